//! Persistence state machine.
//!
//! A [`PersistenceState`] classifies an in-memory entity's relationship
//! to its backing store:
//!
//! - `New` — never persisted; `persist` issues an insert.
//! - `Loaded` — consistent with the store; `persist` is a no-op.
//! - `Dirty` — loaded, but the current snapshot may differ from the
//!   persisted one; `persist` issues an update only when it actually
//!   does.
//!
//! States are immutable; `persist` consumes the state and returns its
//! successor. Write failures propagate uncaught — rollback decisions
//! belong to the enclosing transaction or session.

use std::sync::OnceLock;

use relmap_core::{Entity, Result, Tuple};

use crate::mapper::Mapper;

/// Fields common to every state: the mapping rules, the entity, and the
/// tuple snapshot the state was classified against.
#[derive(Debug, Clone)]
pub struct StateData<E: Entity> {
    mapper: Mapper<E>,
    entity: E,
    tuple: Tuple,
}

impl<E: Entity> StateData<E> {
    pub fn new(mapper: Mapper<E>, entity: E, tuple: Tuple) -> Self {
        Self {
            mapper,
            entity,
            tuple,
        }
    }

    pub fn mapper(&self) -> &Mapper<E> {
        &self.mapper
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn tuple(&self) -> &Tuple {
        &self.tuple
    }
}

impl<E: Entity + PartialEq> PartialEq for StateData<E> {
    fn eq(&self, other: &Self) -> bool {
        self.mapper == other.mapper && self.entity == other.entity && self.tuple == other.tuple
    }
}

/// A loaded state whose current snapshot may diverge from the persisted
/// one. Holds the prior `Loaded` state for dirty checking.
#[derive(Debug)]
pub struct DirtyState<E: Entity> {
    data: StateData<E>,
    old: Box<StateData<E>>,
    /// Memoized dirty check. Safe to cache because both tuples are
    /// immutable once the state is constructed.
    clean: OnceLock<bool>,
}

impl<E: Entity> DirtyState<E> {
    /// True iff the current tuple structurally equals the persisted one.
    pub fn is_clean(&self) -> bool {
        *self
            .clean
            .get_or_init(|| self.data.tuple() == self.old.tuple())
    }

    pub fn old(&self) -> &StateData<E> {
        &self.old
    }
}

impl<E: Entity> Clone for DirtyState<E> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            old: self.old.clone(),
            clean: self.clean.clone(),
        }
    }
}

impl<E: Entity + PartialEq> PartialEq for DirtyState<E> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data && self.old == other.old
    }
}

/// State-machine wrapper around an entity, its tuple snapshot, and its
/// mapper.
#[derive(Debug, Clone)]
pub enum PersistenceState<E: Entity> {
    /// Never persisted.
    New(StateData<E>),
    /// Consistent with the store; the tuple is the last known persisted
    /// snapshot.
    Loaded(StateData<E>),
    /// Potentially diverged from the persisted snapshot.
    Dirty(DirtyState<E>),
}

impl<E: Entity> PersistenceState<E> {
    /// Classify an entity that has never been persisted.
    pub fn new_entity(mapper: Mapper<E>, entity: E) -> Result<Self> {
        let tuple = mapper.dump(&entity)?;
        Ok(PersistenceState::New(StateData::new(mapper, entity, tuple)))
    }

    /// Classify a tuple retrieved from the store.
    pub fn loaded(mapper: Mapper<E>, tuple: Tuple) -> Result<Self> {
        let entity = mapper.load(&tuple)?;
        Ok(PersistenceState::Loaded(StateData::new(
            mapper, entity, tuple,
        )))
    }

    /// Classify an entity observed to differ from its loaded snapshot.
    ///
    /// `old` must be the prior `Loaded` state; any other state is a
    /// caller bug and the dirty state would violate its own invariant.
    pub fn dirty(data: StateData<E>, old: StateData<E>) -> Self {
        PersistenceState::Dirty(DirtyState {
            data,
            old: Box::new(old),
            clean: OnceLock::new(),
        })
    }

    /// The entity this state wraps.
    pub fn entity(&self) -> &E {
        self.data().entity()
    }

    /// The current tuple snapshot.
    pub fn tuple(&self) -> &Tuple {
        self.data().tuple()
    }

    /// The mapper owning this state's mapping rules.
    pub fn mapper(&self) -> &Mapper<E> {
        self.data().mapper()
    }

    pub fn is_new(&self) -> bool {
        matches!(self, PersistenceState::New(_))
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, PersistenceState::Loaded(_))
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self, PersistenceState::Dirty(_))
    }

    /// Whether persisting would issue no write: `Loaded` always, `Dirty`
    /// when its snapshots are equal, `New` never.
    pub fn is_clean(&self) -> bool {
        match self {
            PersistenceState::New(_) => false,
            PersistenceState::Loaded(_) => true,
            PersistenceState::Dirty(dirty) => dirty.is_clean(),
        }
    }

    fn data(&self) -> &StateData<E> {
        match self {
            PersistenceState::New(data) | PersistenceState::Loaded(data) => data,
            PersistenceState::Dirty(dirty) => &dirty.data,
        }
    }

    /// Persist this state, returning its successor.
    ///
    /// - `New` issues one insert and becomes `Loaded` around the
    ///   store-assigned tuple.
    /// - `Dirty` collapses back to its prior `Loaded` state when clean
    ///   (zero writes); otherwise issues one update keyed by the old
    ///   tuple's identity and becomes `Loaded` around the current data.
    /// - `Loaded` returns itself unchanged.
    pub fn persist(self) -> Result<PersistenceState<E>> {
        match self {
            PersistenceState::New(data) => {
                let stored = data.mapper().insert(data.tuple())?;
                tracing::debug!(relation = data.mapper().relation(), tuple = %stored, "inserted");
                let entity = data.mapper().load(&stored)?;
                Ok(PersistenceState::Loaded(StateData::new(
                    data.mapper.clone(),
                    entity,
                    stored,
                )))
            }
            PersistenceState::Dirty(dirty) => {
                if dirty.is_clean() {
                    return Ok(PersistenceState::Loaded(*dirty.old));
                }
                let DirtyState { data, old, .. } = dirty;
                data.mapper().update(data.tuple(), old.tuple())?;
                tracing::debug!(relation = data.mapper().relation(), "updated");
                Ok(PersistenceState::Loaded(data))
            }
            PersistenceState::Loaded(_) => Ok(self),
        }
    }
}

impl<E: Entity + PartialEq> PartialEq for PersistenceState<E> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PersistenceState::New(a), PersistenceState::New(b))
            | (PersistenceState::Loaded(a), PersistenceState::Loaded(b)) => a == b,
            (PersistenceState::Dirty(a), PersistenceState::Dirty(b)) => a == b,
            _ => false,
        }
    }
}
