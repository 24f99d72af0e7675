//! Unit-of-work session.
//!
//! A [`Session`] tracks persistence states by identity and flushes every
//! pending change in one commit. Tracking is type-erased so a single
//! session can hold entities of different types, keyed by
//! `(TypeId, structural key hash)`.

use std::any::{Any, TypeId};
use std::sync::Arc;

use relmap_core::{Entity, Error, Gateway, Result, Tuple, Value, hash_values};

use crate::mapper::Mapper;
use crate::state::{PersistenceState, StateData};

/// Identity of a tracked object within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    type_id: TypeId,
    hash: u64,
}

impl ObjectKey {
    /// Key for an entity with a persisted identity.
    pub fn identity<E: Entity>(key_values: &[Value]) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            hash: hash_values(key_values),
        }
    }

    /// Key for a not-yet-persisted entity, unique within one session.
    fn transient<E: Entity>(sequence: u64) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        "transient".hash(&mut hasher);
        sequence.hash(&mut hasher);
        Self {
            type_id: TypeId::of::<E>(),
            hash: hasher.finish(),
        }
    }
}

/// Object-safe view of a tracked `PersistenceState`.
trait TrackedState: Send {
    /// Persist a clone of this state, returning the successor.
    fn persist_boxed(&self) -> Result<Box<dyn TrackedState>>;
    fn is_loaded(&self) -> bool;
    fn relation(&self) -> &'static str;
    fn identity_key(&self) -> Option<ObjectKey>;
    fn as_any(&self) -> &dyn Any;
}

impl<E: Entity + PartialEq> TrackedState for PersistenceState<E> {
    fn persist_boxed(&self) -> Result<Box<dyn TrackedState>> {
        Ok(Box::new(self.clone().persist()?))
    }

    fn is_loaded(&self) -> bool {
        PersistenceState::is_loaded(self)
    }

    fn relation(&self) -> &'static str {
        self.mapper().relation()
    }

    fn identity_key(&self) -> Option<ObjectKey> {
        let mapper = self.mapper();
        let tuple = self.tuple();
        mapper
            .has_identity(tuple)
            .then(|| ObjectKey::identity::<E>(&mapper.key_values(tuple)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Entry {
    key: ObjectKey,
    state: Box<dyn TrackedState>,
}

/// Unit of work over one gateway.
pub struct Session {
    gateway: Arc<dyn Gateway>,
    entries: Vec<Entry>,
    next_transient: u64,
}

impl Session {
    /// Create an empty session.
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            entries: Vec::new(),
            next_transient: 0,
        }
    }

    /// Number of tracked states.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Track an entity, returning its persistence state.
    ///
    /// A second `track` call for the same identity reuses the tracked
    /// entry and reclassifies it against the new field values (last
    /// write wins). An entity without identity is classified `New`;
    /// identical pending `New` states deduplicate to one entry.
    #[tracing::instrument(level = "trace", skip(self, entity), fields(relation = E::RELATION))]
    pub fn track<E: Entity + PartialEq>(&mut self, entity: E) -> Result<PersistenceState<E>> {
        let mapper = Mapper::<E>::new(Arc::clone(&self.gateway));
        let tuple = mapper.dump(&entity)?;

        if !mapper.has_identity(&tuple) {
            return self.track_new(mapper, entity, tuple);
        }

        let key = ObjectKey::identity::<E>(&mapper.key_values(&tuple));
        if let Some(position) = self.position(key) {
            return self.reclassify(position, mapper, entity, tuple);
        }

        let rows = mapper.read(&mapper.identity(&tuple))?;
        let state = match rows.into_iter().next() {
            Some(stored) if stored == tuple => {
                PersistenceState::Loaded(StateData::new(mapper, entity, tuple))
            }
            Some(stored) => {
                let old_entity = mapper.load(&stored)?;
                let old = StateData::new(mapper.clone(), old_entity, stored);
                PersistenceState::dirty(StateData::new(mapper, entity, tuple), old)
            }
            None => PersistenceState::New(StateData::new(mapper, entity, tuple)),
        };

        self.entries.push(Entry {
            key,
            state: Box::new(state.clone()),
        });
        Ok(state)
    }

    fn track_new<E: Entity + PartialEq>(
        &mut self,
        mapper: Mapper<E>,
        entity: E,
        tuple: Tuple,
    ) -> Result<PersistenceState<E>> {
        let state = PersistenceState::New(StateData::new(mapper, entity, tuple));

        // The same logical change must not be persisted twice.
        for entry in &self.entries {
            if let Some(existing) = entry.state.as_any().downcast_ref::<PersistenceState<E>>() {
                if *existing == state {
                    return Ok(existing.clone());
                }
            }
        }

        let key = ObjectKey::transient::<E>(self.next_transient);
        self.next_transient += 1;
        self.entries.push(Entry {
            key,
            state: Box::new(state.clone()),
        });
        Ok(state)
    }

    fn reclassify<E: Entity + PartialEq>(
        &mut self,
        position: usize,
        mapper: Mapper<E>,
        entity: E,
        tuple: Tuple,
    ) -> Result<PersistenceState<E>> {
        let existing = self.entries[position]
            .state
            .as_any()
            .downcast_ref::<PersistenceState<E>>()
            .ok_or_else(|| {
                Error::unknown_identity(E::RELATION, "tracked state has a different entity type")
            })?;

        let state = match existing {
            PersistenceState::Loaded(old) if *old.tuple() == tuple => existing.clone(),
            PersistenceState::Loaded(old) => {
                PersistenceState::dirty(StateData::new(mapper, entity, tuple), old.clone())
            }
            PersistenceState::Dirty(dirty) => {
                PersistenceState::dirty(StateData::new(mapper, entity, tuple), dirty.old().clone())
            }
            PersistenceState::New(_) => {
                PersistenceState::New(StateData::new(mapper, entity, tuple))
            }
        };

        self.entries[position].state = Box::new(state.clone());
        Ok(state)
    }

    /// Persist every tracked state inside one gateway scope, replacing
    /// each transitioning entry until a fixed point is reached.
    ///
    /// The fixed point is bounded by the number of tracked objects: each
    /// one transitions at most once per commit cycle. A commit with no
    /// pending transitions issues zero writes.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        self.gateway.begin()?;
        match self.persist_all() {
            Ok(()) => self.gateway.commit(),
            Err(err) => {
                if let Err(rollback_err) = self.gateway.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback failed after commit error");
                }
                Err(err)
            }
        }
    }

    /// Successor states are staged to the side and only swapped into the
    /// tracked entries once every persist succeeded. An error leaves the
    /// entries exactly as tracked, matching the store the rollback
    /// restored, so the commit can be retried.
    fn persist_all(&mut self) -> Result<()> {
        let mut staged: Vec<Option<(ObjectKey, Box<dyn TrackedState>)>> =
            self.entries.iter().map(|_| None).collect();

        let bound = self.entries.len();
        for _ in 0..=bound {
            let mut transitions = 0usize;
            for (index, entry) in self.entries.iter().enumerate() {
                let current: &dyn TrackedState = match &staged[index] {
                    Some((_, state)) => state.as_ref(),
                    None => entry.state.as_ref(),
                };
                if current.is_loaded() {
                    continue;
                }
                let next = current.persist_boxed()?;
                let key = next.identity_key().unwrap_or(entry.key);
                staged[index] = Some((key, next));
                transitions += 1;
            }
            if transitions == 0 {
                break;
            }
            tracing::trace!(transitions, "commit pass");
        }

        for (entry, slot) in self.entries.iter_mut().zip(staged) {
            if let Some((key, state)) = slot {
                entry.key = key;
                entry.state = state;
            }
        }
        Ok(())
    }

    /// Delete a tracked entity's record and discard its tracking.
    ///
    /// Deleting an entity with no tracked prior state is a programming
    /// error and fails with `UnknownIdentity` before any write.
    pub fn delete<E: Entity + PartialEq>(&mut self, entity: &E) -> Result<()> {
        let mapper = Mapper::<E>::new(Arc::clone(&self.gateway));
        let tuple = mapper.dump(entity)?;
        if !mapper.has_identity(&tuple) {
            return Err(Error::unknown_identity(
                E::RELATION,
                "delete requires a persisted identity",
            ));
        }

        let key = ObjectKey::identity::<E>(&mapper.key_values(&tuple));
        let Some(position) = self.position(key) else {
            return Err(Error::unknown_identity(
                E::RELATION,
                "no tracked prior state for this identity",
            ));
        };

        mapper.delete(&tuple)?;
        self.entries.remove(position);
        Ok(())
    }

    /// Discard tracking for an entity without touching the store.
    pub fn forget<E: Entity + PartialEq>(&mut self, entity: &E) -> Result<bool> {
        let mapper = Mapper::<E>::new(Arc::clone(&self.gateway));
        let tuple = mapper.dump(entity)?;
        if !mapper.has_identity(&tuple) {
            return Ok(false);
        }
        let key = ObjectKey::identity::<E>(&mapper.key_values(&tuple));
        match self.position(key) {
            Some(position) => {
                self.entries.remove(position);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Discard all tracking.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn position(&self, key: ObjectKey) -> Option<usize> {
        self.entries.iter().position(|entry| entry.key == key)
    }
}
