//! Tuple/entity mapping.
//!
//! A [`Mapper`] translates between an entity type and its tuple
//! representation, and issues the primitive writes for that entity's
//! relation through the gateway. Mappers hold no mutable state; every
//! side effect is confined to the underlying gateway call.

use std::marker::PhantomData;
use std::sync::Arc;

use relmap_core::{Entity, Error, Gateway, Result, Tuple, Value};

/// Mapping rules for one entity type.
pub struct Mapper<E: Entity> {
    gateway: Arc<dyn Gateway>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Mapper<E> {
    /// Create a mapper over the given gateway.
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            _entity: PhantomData,
        }
    }

    /// Name of the backing relation.
    pub fn relation(&self) -> &'static str {
        E::RELATION
    }

    /// Identity attributes of the relation.
    pub fn key(&self) -> &'static [&'static str] {
        E::KEY
    }

    /// Build a domain entity from a persisted tuple.
    pub fn load(&self, tuple: &Tuple) -> Result<E> {
        Ok(serde_json::from_value(tuple.to_json())?)
    }

    /// Extract a tuple snapshot of the entity's current field values.
    pub fn dump(&self, entity: &E) -> Result<Tuple> {
        Tuple::from_json(&serde_json::to_value(entity)?)
    }

    /// The identity predicate of a tuple: its key attributes.
    pub fn identity(&self, tuple: &Tuple) -> Tuple {
        tuple.project(E::KEY)
    }

    /// Whether every key attribute carries a non-null value.
    pub fn has_identity(&self, tuple: &Tuple) -> bool {
        E::KEY
            .iter()
            .all(|attr| tuple.get(attr).is_some_and(|value| !value.is_null()))
    }

    /// Key attribute values of a tuple, null-filled for absent attributes.
    pub fn key_values(&self, tuple: &Tuple) -> Vec<Value> {
        E::KEY
            .iter()
            .map(|attr| tuple.get(attr).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Insert a tuple, returning it with store-assigned attributes merged.
    pub fn insert(&self, tuple: &Tuple) -> Result<Tuple> {
        self.gateway.insert(E::RELATION, tuple)
    }

    /// Update the record identified by `old`'s key attributes, writing
    /// only the attributes of `current` that differ from `old`.
    pub fn update(&self, current: &Tuple, old: &Tuple) -> Result<()> {
        let predicate = self.identity(old);
        if !self.has_identity(old) {
            return Err(Error::unknown_identity(
                E::RELATION,
                "update requires a persisted identity",
            ));
        }
        let changes = current.diff(old);
        self.gateway.update(E::RELATION, &predicate, &changes)
    }

    /// Delete the record identified by the tuple's key attributes.
    pub fn delete(&self, tuple: &Tuple) -> Result<()> {
        if !self.has_identity(tuple) {
            return Err(Error::unknown_identity(
                E::RELATION,
                "delete requires a persisted identity",
            ));
        }
        self.gateway.delete(E::RELATION, &self.identity(tuple))
    }

    /// Read tuples matching a predicate.
    pub fn read(&self, predicate: &Tuple) -> Result<Vec<Tuple>> {
        self.gateway.read(E::RELATION, predicate)
    }
}

impl<E: Entity> Clone for Mapper<E> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> PartialEq for Mapper<E> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.gateway, &other.gateway)
    }
}

impl<E: Entity> std::fmt::Debug for Mapper<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper")
            .field("relation", &E::RELATION)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{User, users_gateway};

    #[test]
    fn dump_then_load_round_trips() {
        let mapper: Mapper<User> = Mapper::new(users_gateway());
        let user = User {
            id: Some(3),
            name: "Jane".into(),
        };

        let tuple = mapper.dump(&user).unwrap();
        assert_eq!(tuple.get("id"), Some(&Value::Int(3)));
        assert_eq!(tuple.get("name"), Some(&Value::Text("Jane".into())));

        let back = mapper.load(&tuple).unwrap();
        assert_eq!(back, user);
    }

    #[test]
    fn identity_projects_key_attributes() {
        let mapper: Mapper<User> = Mapper::new(users_gateway());
        let tuple = Tuple::new([("id", Value::Int(1)), ("name", Value::from("Jane"))]);

        let identity = mapper.identity(&tuple);
        assert_eq!(identity.len(), 1);
        assert_eq!(identity.get("id"), Some(&Value::Int(1)));
        assert!(mapper.has_identity(&tuple));

        let unsaved = Tuple::new([("id", Value::Null), ("name", Value::from("Jane"))]);
        assert!(!mapper.has_identity(&unsaved));
    }

    #[test]
    fn insert_merges_generated_key() {
        let mapper: Mapper<User> = Mapper::new(users_gateway());
        let stored = mapper
            .insert(&Tuple::new([
                ("id", Value::Null),
                ("name", Value::from("Jane")),
            ]))
            .unwrap();

        assert_eq!(stored.get("id"), Some(&Value::Int(1)));
    }

    #[test]
    fn update_writes_changed_attributes_keyed_by_old_identity() {
        let gateway = users_gateway();
        let mapper: Mapper<User> = Mapper::new(Arc::clone(&gateway));
        let old = mapper
            .insert(&Tuple::new([("name", Value::from("Jane"))]))
            .unwrap();

        let current = old.with("name", "Jane Doe");
        mapper.update(&current, &old).unwrap();

        let rows = mapper.read(&mapper.identity(&old)).unwrap();
        assert_eq!(rows[0].get("name"), Some(&Value::Text("Jane Doe".into())));
    }

    #[test]
    fn update_without_identity_is_a_programming_error() {
        let mapper: Mapper<User> = Mapper::new(users_gateway());
        let old = Tuple::new([("id", Value::Null), ("name", Value::from("Jane"))]);

        let err = mapper.update(&old.with("name", "x"), &old).unwrap_err();
        assert!(matches!(err, Error::UnknownIdentity(_)));
    }

    #[test]
    fn delete_removes_by_identity() {
        let mapper: Mapper<User> = Mapper::new(users_gateway());
        let stored = mapper
            .insert(&Tuple::new([("name", Value::from("Jane"))]))
            .unwrap();

        mapper.delete(&stored).unwrap();
        assert!(mapper.read(&Tuple::empty()).unwrap().is_empty());
    }
}
