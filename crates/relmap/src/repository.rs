//! Repository facade.
//!
//! A [`Repository`] ties a gateway and a configuration together and
//! hands out the working objects: sessions for unit-of-work tracking,
//! changesets for declarative writes, and transactions for executing
//! them. It also carries the typed read helpers.

use std::sync::Arc;

use relmap_core::{Config, Entity, Gateway, Result, Tuple, Value};

use crate::changeset::{Changeset, Payload};
use crate::mapper::Mapper;
use crate::session::Session;
use crate::transaction::{Transaction, TransactionState};

/// Entry point over one gateway and one configuration.
#[derive(Clone)]
pub struct Repository {
    gateway: Arc<dyn Gateway>,
    config: Arc<Config>,
}

impl Repository {
    pub fn new(gateway: Arc<dyn Gateway>, config: Arc<Config>) -> Self {
        Self { gateway, config }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Start an empty unit-of-work session.
    pub fn session(&self) -> Session {
        Session::new(Arc::clone(&self.gateway))
    }

    /// Build a create changeset for `relation`.
    pub fn changeset(
        &self,
        relation: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Result<Changeset> {
        Changeset::create(Arc::clone(&self.config), relation, payload)
    }

    /// Build an update changeset for the records matching `predicate`.
    pub fn changeset_update(
        &self,
        relation: impl Into<String>,
        predicate: Tuple,
        payload: impl Into<Payload>,
    ) -> Result<Changeset> {
        Changeset::update(Arc::clone(&self.config), relation, predicate, payload)
    }

    /// Build a delete changeset for the records matching `predicate`.
    pub fn changeset_delete(
        &self,
        relation: impl Into<String>,
        predicate: Tuple,
    ) -> Result<Changeset> {
        Changeset::delete(Arc::clone(&self.config), relation, predicate)
    }

    /// Run `body` inside a transaction scope.
    ///
    /// Commits when the body returns `Ok`, rolls back when it returns
    /// `Err`, and surfaces the body's error unchanged either way. Nested
    /// calls join the outer scope; only the outermost commit is durable.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn transaction<T>(&self, body: impl FnOnce(&mut Transaction) -> Result<T>) -> Result<T> {
        let mut tx = Transaction::new(Arc::clone(&self.gateway));
        tx.begin()?;
        match body(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                // A failed pipeline step already rolled the handle back.
                if tx.state() == TransactionState::Running {
                    if let Err(rollback_err) = tx.rollback() {
                        tracing::warn!(error = %rollback_err, "rollback failed after transaction error");
                    }
                }
                Err(err)
            }
        }
    }

    /// Load every entity of the relation.
    pub fn all<E: Entity>(&self) -> Result<Vec<E>> {
        let mapper = self.mapper::<E>();
        mapper
            .read(&Tuple::empty())?
            .iter()
            .map(|tuple| mapper.load(tuple))
            .collect()
    }

    /// Load the first entity matching `predicate`, if any.
    pub fn one<E: Entity>(&self, predicate: &Tuple) -> Result<Option<E>> {
        let mapper = self.mapper::<E>();
        match mapper.read(predicate)?.first() {
            Some(tuple) => Ok(Some(mapper.load(tuple)?)),
            None => Ok(None),
        }
    }

    /// Load an entity by its key values, in key declaration order.
    pub fn by_key<E: Entity>(&self, values: impl IntoIterator<Item = Value>) -> Result<Option<E>> {
        let predicate = Tuple::new(
            E::KEY
                .iter()
                .map(|attr| attr.to_string())
                .zip(values)
                .collect::<Vec<_>>(),
        );
        self.one(&predicate)
    }

    /// Number of records in a relation.
    pub fn count(&self, relation: &str) -> Result<usize> {
        Ok(self.gateway.read(relation, &Tuple::empty())?.len())
    }

    fn mapper<E: Entity>(&self) -> Mapper<E> {
        Mapper::new(Arc::clone(&self.gateway))
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::User;
    use relmap_core::Error;
    use relmap_memory::{MemoryGateway, RelationSchema};

    fn repository() -> (Arc<MemoryGateway>, Repository) {
        let gw = MemoryGateway::new();
        gw.register(RelationSchema::new("users").require("name"));
        gw.register(RelationSchema::new("posts").require("title"));
        let gw = Arc::new(gw);
        let config = Config::builder()
            .relation("users", ["id"])
            .relation("posts", ["id"])
            .association("author", "users", "posts", "author_id")
            .build()
            .unwrap();
        let repo = Repository::new(
            Arc::clone(&gw) as Arc<dyn Gateway>,
            Arc::new(config),
        );
        (gw, repo)
    }

    #[test]
    fn transaction_commits_on_ok() {
        let (gw, repo) = repository();

        let stored = repo
            .transaction(|tx| {
                let cs = repo.changeset("users", Tuple::new([("name", Value::from("Jane"))]))?;
                tx.create(cs)
            })
            .unwrap();

        assert_eq!(stored[0].get("id"), Some(&Value::Int(1)));
        assert_eq!(gw.count("users"), 1);
    }

    #[test]
    fn transaction_rolls_back_on_err() {
        let (gw, repo) = repository();

        let err = repo
            .transaction(|tx| {
                let ok = repo.changeset("users", Tuple::new([("name", Value::from("Jane"))]))?;
                tx.create(ok)?;
                // Missing required title fails the whole scope.
                let bad = repo.changeset("posts", Tuple::empty())?;
                tx.create(bad)
            })
            .unwrap_err();

        assert!(err.is_constraint());
        assert_eq!(gw.count("users"), 0);
        assert_eq!(gw.count("posts"), 0);
    }

    #[test]
    fn nested_transactions_join_the_outer_scope() {
        let (gw, repo) = repository();

        repo.transaction(|tx| {
            let user = repo.changeset("users", Tuple::new([("name", Value::from("Jane"))]))?;
            tx.create(user)?;
            repo.transaction(|inner| {
                let post = repo.changeset(
                    "posts",
                    Tuple::new([("title", Value::from("Hello"))]),
                )?;
                inner.create(post)
            })?;
            Ok(())
        })
        .unwrap();

        assert_eq!(gw.count("users"), 1);
        assert_eq!(gw.count("posts"), 1);
    }

    #[test]
    fn inner_failure_aborts_the_whole_scope() {
        let (gw, repo) = repository();

        let result: Result<()> = repo.transaction(|tx| {
            let user = repo.changeset("users", Tuple::new([("name", Value::from("Jane"))]))?;
            tx.create(user)?;
            repo.transaction(|inner| {
                let bad = repo.changeset("posts", Tuple::empty())?;
                inner.create(bad)
            })?;
            Ok(())
        });

        assert!(matches!(result, Err(Error::Constraint(_))));
        assert_eq!(gw.count("users"), 0);
    }

    #[test]
    fn read_helpers_load_entities() {
        let (gw, repo) = repository();
        gw.insert("users", &Tuple::new([("name", Value::from("Jane"))]))
            .unwrap();
        gw.insert("users", &Tuple::new([("name", Value::from("Joe"))]))
            .unwrap();

        let all: Vec<User> = repo.all().unwrap();
        assert_eq!(all.len(), 2);

        let jane: Option<User> = repo.by_key([Value::Int(1)]).unwrap();
        assert_eq!(jane.unwrap().name, "Jane");

        let missing: Option<User> = repo.by_key([Value::Int(42)]).unwrap();
        assert!(missing.is_none());

        assert_eq!(repo.count("users").unwrap(), 2);
    }
}
