//! Transactional execution of changeset trees.
//!
//! A [`Transaction`] is a single-use scope over one gateway. It moves
//! through `Pending -> Running -> {Committed, RolledBack}`; every write
//! method requires `Running`, and a finished transaction rejects further
//! use instead of silently reopening.
//!
//! Changeset trees execute as a pipeline: the tree is flattened in
//! declaration order, each node's provider is resolved through its
//! association definition, the nodes are topologically sorted (ties
//! broken by declaration order), and each persisted provider's identity
//! is copied into its dependents' payloads before they run. Any failure
//! leaves the scope poised for rollback; nothing is retried or skipped.

use std::sync::Arc;

use relmap_core::{Error, Gateway, Result, Tuple, TransactionError, TransactionErrorKind};

use crate::changeset::{Changeset, ChangesetKind, Payload};

/// Lifecycle of a transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Created, no scope opened yet.
    Pending,
    /// Scope open; writes are accepted.
    Running,
    /// Scope closed with its writes made durable.
    Committed,
    /// Scope closed with its writes undone.
    RolledBack,
}

/// A single-use transactional scope over a gateway.
///
/// Dropping a still-running transaction rolls it back.
pub struct Transaction {
    gateway: Arc<dyn Gateway>,
    state: TransactionState,
}

impl Transaction {
    /// Create a pending transaction over the gateway.
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            state: TransactionState::Pending,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Open the scope. Joining an outer scope is the gateway's concern;
    /// this handle itself is single-use.
    pub fn begin(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Pending => {
                self.gateway.begin()?;
                self.state = TransactionState::Running;
                Ok(())
            }
            TransactionState::Running => Err(scope_error(
                TransactionErrorKind::NotRunning,
                "transaction scope is already open",
            )),
            TransactionState::Committed => Err(scope_error(
                TransactionErrorKind::AlreadyCommitted,
                "transaction was already committed",
            )),
            TransactionState::RolledBack => Err(scope_error(
                TransactionErrorKind::AlreadyRolledBack,
                "transaction was already rolled back",
            )),
        }
    }

    /// Make the scope's writes durable.
    pub fn commit(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Running => {
                self.gateway.commit()?;
                self.state = TransactionState::Committed;
                Ok(())
            }
            TransactionState::Committed => Err(scope_error(
                TransactionErrorKind::AlreadyCommitted,
                "transaction was already committed",
            )),
            TransactionState::RolledBack => Err(scope_error(
                TransactionErrorKind::AlreadyRolledBack,
                "transaction was already rolled back",
            )),
            TransactionState::Pending => Err(scope_error(
                TransactionErrorKind::NotRunning,
                "transaction scope was never opened",
            )),
        }
    }

    /// Undo every write made inside the scope.
    pub fn rollback(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Running => {
                self.gateway.rollback()?;
                self.state = TransactionState::RolledBack;
                Ok(())
            }
            TransactionState::Committed => Err(scope_error(
                TransactionErrorKind::AlreadyCommitted,
                "transaction was already committed",
            )),
            TransactionState::RolledBack => Err(scope_error(
                TransactionErrorKind::AlreadyRolledBack,
                "transaction was already rolled back",
            )),
            TransactionState::Pending => Err(scope_error(
                TransactionErrorKind::NotRunning,
                "transaction scope was never opened",
            )),
        }
    }

    /// Execute a create changeset tree, returning the root relation's
    /// stored tuples in payload order.
    #[tracing::instrument(level = "debug", skip(self, changeset), fields(relation = changeset.relation()))]
    pub fn create(&mut self, changeset: Changeset) -> Result<Vec<Tuple>> {
        self.require_kind(&changeset, "create", |kind| {
            matches!(kind, ChangesetKind::Create)
        })?;
        self.run(changeset)
    }

    /// Execute an update changeset tree, returning the matching records
    /// as stored after the update.
    #[tracing::instrument(level = "debug", skip(self, changeset), fields(relation = changeset.relation()))]
    pub fn update(&mut self, changeset: Changeset) -> Result<Vec<Tuple>> {
        self.require_kind(&changeset, "update", |kind| {
            matches!(kind, ChangesetKind::Update { .. })
        })?;
        self.run(changeset)
    }

    /// Execute a delete changeset tree.
    #[tracing::instrument(level = "debug", skip(self, changeset), fields(relation = changeset.relation()))]
    pub fn delete(&mut self, changeset: Changeset) -> Result<()> {
        self.require_kind(&changeset, "delete", |kind| {
            matches!(kind, ChangesetKind::Delete { .. })
        })?;
        self.run(changeset).map(|_| ())
    }

    /// Insert a raw tuple, bypassing the changeset pipeline.
    pub fn insert_raw(&mut self, relation: &str, tuple: &Tuple) -> Result<Tuple> {
        self.require_running()?;
        self.gateway.insert(relation, tuple)
    }

    /// Update raw records matching `predicate`, bypassing the pipeline.
    pub fn update_raw(&mut self, relation: &str, predicate: &Tuple, changes: &Tuple) -> Result<()> {
        self.require_running()?;
        self.gateway.update(relation, predicate, changes)
    }

    /// Delete raw records matching `predicate`, bypassing the pipeline.
    pub fn delete_raw(&mut self, relation: &str, predicate: &Tuple) -> Result<()> {
        self.require_running()?;
        self.gateway.delete(relation, predicate)
    }

    fn require_running(&self) -> Result<()> {
        if self.state != TransactionState::Running {
            return Err(scope_error(
                TransactionErrorKind::NotRunning,
                "transaction scope is not running",
            ));
        }
        Ok(())
    }

    fn require_kind(
        &self,
        changeset: &Changeset,
        verb: &str,
        accepts: impl Fn(&ChangesetKind) -> bool,
    ) -> Result<()> {
        self.require_running()?;
        if !accepts(changeset.kind()) {
            return Err(Error::configuration(format!(
                "{} called with a {:?} changeset for '{}'",
                verb,
                changeset.kind(),
                changeset.relation()
            )));
        }
        Ok(())
    }

    /// A failed step aborts the whole scope: the transaction rolls back
    /// and is finished, so the partial writes can never be committed.
    fn run(&mut self, changeset: Changeset) -> Result<Vec<Tuple>> {
        match self.run_pipeline(&changeset) {
            Ok(results) => Ok(results),
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback failed after pipeline error");
                }
                Err(err)
            }
        }
    }

    fn run_pipeline(&mut self, changeset: &Changeset) -> Result<Vec<Tuple>> {
        let nodes = flatten(changeset)?;
        let order = topo_order(&nodes)?;

        let mut results: Vec<Vec<Tuple>> = vec![Vec::new(); nodes.len()];
        for index in order {
            let node = &nodes[index];
            let payload = resolve_payload(&results, node)?;
            results[index] = self.execute(node, payload)?;
        }
        Ok(std::mem::take(&mut results[0]))
    }

    fn execute(&self, node: &Node<'_>, payload: Vec<Tuple>) -> Result<Vec<Tuple>> {
        match node.kind {
            ChangesetKind::Create => {
                let stored = self.gateway.insert_many(node.relation, &payload)?;
                tracing::trace!(relation = node.relation, count = stored.len(), "created");
                Ok(stored)
            }
            ChangesetKind::Update { predicate } => {
                for changes in &payload {
                    self.gateway.update(node.relation, predicate, changes)?;
                }
                tracing::trace!(relation = node.relation, "updated");
                self.gateway.read(node.relation, predicate)
            }
            ChangesetKind::Delete { predicate } => {
                self.gateway.delete(node.relation, predicate)?;
                tracing::trace!(relation = node.relation, "deleted");
                Ok(Vec::new())
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Running {
            if let Err(err) = self.gateway.rollback() {
                tracing::warn!(error = %err, "rollback on drop failed");
            }
            self.state = TransactionState::RolledBack;
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn scope_error(kind: TransactionErrorKind, message: &str) -> Error {
    Error::Transaction(TransactionError {
        kind,
        message: message.into(),
    })
}

/// One changeset of the flattened tree.
struct Node<'a> {
    relation: &'a str,
    kind: &'a ChangesetKind,
    payload: &'a Payload,
    /// Provider node index and the foreign-key propagation rule, absent
    /// for the root.
    dependency: Option<Dependency<'a>>,
}

struct Dependency<'a> {
    provider: usize,
    source: &'a str,
    /// Provider's single identity attribute.
    key_attr: &'a str,
    foreign_key: &'a str,
}

/// Flatten the tree depth-first; pre-order equals declaration order.
///
/// A child's provider is the changeset it was associated onto whenever
/// that parent writes the association's source relation, so sibling
/// changesets on the same relation each feed their own children. Only
/// when the parent's relation differs from the source (the provider is
/// elsewhere in the tree) is it resolved by declaration-order search.
fn flatten(root: &Changeset) -> Result<Vec<Node<'_>>> {
    fn push<'a>(
        changeset: &'a Changeset,
        nodes: &mut Vec<Node<'a>>,
        unresolved: &mut Vec<usize>,
    ) -> Result<()> {
        let parent = nodes.len();
        nodes.push(Node {
            relation: changeset.relation(),
            kind: changeset.kind(),
            payload: changeset.payload(),
            dependency: None,
        });
        for assoc in changeset.children() {
            let key = changeset.config().key_of(&assoc.def.source)?;
            let [key_attr] = key else {
                return Err(Error::configuration(format!(
                    "association '{}' needs a single-attribute key on '{}'",
                    assoc.def.name, assoc.def.source
                )));
            };
            let child_index = nodes.len();
            push(&assoc.child, nodes, unresolved)?;
            if changeset.relation() != assoc.def.source {
                unresolved.push(child_index);
            }
            nodes[child_index].dependency = Some(Dependency {
                provider: parent,
                source: &assoc.def.source,
                key_attr: key_attr.as_str(),
                foreign_key: &assoc.def.foreign_key,
            });
        }
        Ok(())
    }

    let mut nodes = Vec::new();
    let mut unresolved = Vec::new();
    push(root, &mut nodes, &mut unresolved)?;

    for index in unresolved {
        let Some(source) = nodes[index].dependency.as_ref().map(|dep| dep.source) else {
            continue;
        };
        let provider = nodes
            .iter()
            .position(|node| node.relation == source)
            .ok_or_else(|| {
                Error::configuration(format!("no provider for relation '{}' in the tree", source))
            })?;
        if let Some(dep) = nodes[index].dependency.as_mut() {
            dep.provider = provider;
        }
    }
    Ok(nodes)
}

/// Kahn's algorithm over provider edges, smallest declaration index
/// first. The tree is acyclic by construction, but a self-providing
/// node would otherwise hang the pipeline, so exhaustion is an error.
fn topo_order(nodes: &[Node<'_>]) -> Result<Vec<usize>> {
    let mut indegree = vec![0usize; nodes.len()];
    for (index, node) in nodes.iter().enumerate() {
        if let Some(dep) = &node.dependency {
            if dep.provider != index {
                indegree[index] = 1;
            }
        }
    }

    let mut order = Vec::with_capacity(nodes.len());
    let mut done = vec![false; nodes.len()];
    while order.len() < nodes.len() {
        let next = (0..nodes.len()).find(|&i| !done[i] && indegree[i] == 0);
        let Some(next) = next else {
            return Err(Error::configuration(
                "changeset graph has no executable order",
            ));
        };
        done[next] = true;
        order.push(next);
        for (index, node) in nodes.iter().enumerate() {
            if let Some(dep) = &node.dependency {
                if dep.provider == next && indegree[index] > 0 {
                    indegree[index] -= 1;
                }
            }
        }
    }
    Ok(order)
}

/// Copy the provider's identity into every payload tuple under the
/// dependent's foreign key.
fn resolve_payload(results: &[Vec<Tuple>], node: &Node<'_>) -> Result<Vec<Tuple>> {
    let tuples = node.payload.tuples();
    let Some(dep) = &node.dependency else {
        return Ok(tuples.to_vec());
    };

    let provided = &results[dep.provider];
    if provided.len() != 1 {
        return Err(Error::configuration(format!(
            "association provider '{}' persisted {} records, dependents need exactly one",
            dep.source,
            provided.len()
        )));
    }
    let key = match provided[0].get(dep.key_attr) {
        Some(value) if !value.is_null() => value.clone(),
        _ => {
            return Err(Error::configuration(format!(
                "provider '{}' has no usable identity to propagate",
                dep.source
            )));
        }
    };

    Ok(tuples
        .iter()
        .map(|tuple| tuple.with(dep.foreign_key, key.clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{Config, Value};
    use relmap_memory::{MemoryGateway, RelationSchema};

    fn config() -> Arc<Config> {
        Arc::new(
            Config::builder()
                .relation("users", ["id"])
                .relation("posts", ["id"])
                .relation("labels", ["id"])
                .association("author", "users", "posts", "author_id")
                .association("posts", "posts", "labels", "post_id")
                .build()
                .unwrap(),
        )
    }

    fn gateway() -> Arc<MemoryGateway> {
        let gw = MemoryGateway::new();
        gw.register(RelationSchema::new("users").require("name"));
        gw.register(RelationSchema::new("posts").require("title"));
        gw.register(RelationSchema::new("labels").require("name"));
        Arc::new(gw)
    }

    fn running(gw: &Arc<MemoryGateway>) -> Transaction {
        let mut tx = Transaction::new(Arc::clone(gw) as Arc<dyn Gateway>);
        tx.begin().unwrap();
        tx
    }

    #[test]
    fn create_returns_the_stored_root_tuple() {
        let gw = gateway();
        let mut tx = running(&gw);
        let cs = Changeset::create(
            config(),
            "users",
            Tuple::new([("name", Value::from("Jane"))]),
        )
        .unwrap();

        let stored = tx.create(cs).unwrap();
        tx.commit().unwrap();

        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].get("id"), Some(&Value::Int(1)));
        assert_eq!(stored[0].get("name"), Some(&Value::Text("Jane".into())));
    }

    #[test]
    fn create_propagates_the_provider_key_to_every_batch_member() {
        let gw = gateway();
        let config = config();
        let mut tx = running(&gw);

        let posts = Changeset::create(
            Arc::clone(&config),
            "posts",
            vec![
                Tuple::new([("title", Value::from("one"))]),
                Tuple::new([("title", Value::from("two"))]),
            ],
        )
        .unwrap();
        let cs = Changeset::create(
            Arc::clone(&config),
            "users",
            Tuple::new([("name", Value::from("Jane"))]),
        )
        .unwrap()
        .associate(posts, "author")
        .unwrap();

        tx.create(cs).unwrap();
        tx.commit().unwrap();

        let rows = gw.read("posts", &Tuple::empty()).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(
            rows.iter()
                .all(|row| row.get("author_id") == Some(&Value::Int(1)))
        );
        assert_eq!(rows[0].get("title"), Some(&Value::Text("one".into())));
        assert_eq!(rows[1].get("title"), Some(&Value::Text("two".into())));
    }

    #[test]
    fn nested_associations_propagate_level_by_level() {
        let gw = gateway();
        let config = config();
        let mut tx = running(&gw);

        let labels = Changeset::create(
            Arc::clone(&config),
            "labels",
            vec![
                Tuple::new([("name", Value::from("red"))]),
                Tuple::new([("name", Value::from("green"))]),
            ],
        )
        .unwrap();
        let post = Changeset::create(
            Arc::clone(&config),
            "posts",
            Tuple::new([("title", Value::from("Hello"))]),
        )
        .unwrap()
        .associate(labels, "posts")
        .unwrap();
        let cs = Changeset::create(
            Arc::clone(&config),
            "users",
            Tuple::new([("name", Value::from("Jane"))]),
        )
        .unwrap()
        .associate(post, "author")
        .unwrap();

        tx.create(cs).unwrap();
        tx.commit().unwrap();

        let posts = gw.read("posts", &Tuple::empty()).unwrap();
        assert_eq!(posts[0].get("author_id"), Some(&Value::Int(1)));
        let labels = gw.read("labels", &Tuple::empty()).unwrap();
        assert_eq!(labels.len(), 2);
        assert!(
            labels
                .iter()
                .all(|row| row.get("post_id") == Some(&Value::Int(1)))
        );
    }

    #[test]
    fn sibling_changesets_feed_their_own_children() {
        let gw = gateway();
        let config = config();
        let mut tx = running(&gw);

        let post_one = Changeset::create(
            Arc::clone(&config),
            "posts",
            Tuple::new([("title", Value::from("one"))]),
        )
        .unwrap()
        .associate(
            Changeset::create(
                Arc::clone(&config),
                "labels",
                Tuple::new([("name", Value::from("red"))]),
            )
            .unwrap(),
            "posts",
        )
        .unwrap();
        let post_two = Changeset::create(
            Arc::clone(&config),
            "posts",
            Tuple::new([("title", Value::from("two"))]),
        )
        .unwrap()
        .associate(
            Changeset::create(
                Arc::clone(&config),
                "labels",
                Tuple::new([("name", Value::from("green"))]),
            )
            .unwrap(),
            "posts",
        )
        .unwrap();
        let cs = Changeset::create(
            Arc::clone(&config),
            "users",
            Tuple::new([("name", Value::from("Jane"))]),
        )
        .unwrap()
        .associate(post_one, "author")
        .unwrap()
        .associate(post_two, "author")
        .unwrap();

        tx.create(cs).unwrap();
        tx.commit().unwrap();

        // Each label carries the id of the post it was associated onto,
        // not the first post persisted.
        let labels = gw.read("labels", &Tuple::empty()).unwrap();
        let post_of = |name: &str| {
            labels
                .iter()
                .find(|label| label.get("name") == Some(&Value::Text(name.into())))
                .and_then(|label| label.get("post_id"))
                .cloned()
        };
        assert_eq!(post_of("red"), Some(Value::Int(1)));
        assert_eq!(post_of("green"), Some(Value::Int(2)));
    }

    #[test]
    fn a_failed_pipeline_finishes_the_transaction() {
        let gw = gateway();
        let mut tx = running(&gw);

        tx.insert_raw("users", &Tuple::new([("name", Value::from("Jane"))]))
            .unwrap();
        let bad = Changeset::create(
            config(),
            "posts",
            Tuple::new([("title", Value::Null)]),
        )
        .unwrap();
        assert!(tx.create(bad).unwrap_err().is_constraint());

        // The earlier insert is gone and cannot be committed afterwards.
        assert_eq!(tx.state(), TransactionState::RolledBack);
        let err = tx.commit().unwrap_err();
        match err {
            Error::Transaction(e) => assert_eq!(e.kind, TransactionErrorKind::AlreadyRolledBack),
            other => panic!("expected transaction error, got {other}"),
        }
        assert_eq!(gw.count("users"), 0);
    }

    #[test]
    fn multi_row_provider_with_dependents_is_rejected() {
        let gw = gateway();
        let config = config();
        let mut tx = running(&gw);

        let labels = Changeset::create(
            Arc::clone(&config),
            "labels",
            Tuple::new([("name", Value::from("red"))]),
        )
        .unwrap();
        let posts = Changeset::create(
            Arc::clone(&config),
            "posts",
            vec![
                Tuple::new([("title", Value::from("one"))]),
                Tuple::new([("title", Value::from("two"))]),
            ],
        )
        .unwrap()
        .associate(labels, "posts")
        .unwrap();
        let cs = Changeset::create(
            Arc::clone(&config),
            "users",
            Tuple::new([("name", Value::from("Jane"))]),
        )
        .unwrap()
        .associate(posts, "author")
        .unwrap();

        let err = tx.create(cs).unwrap_err();
        assert!(matches!(err, Error::Transaction(_)));
    }

    #[test]
    fn update_merges_changes_and_reads_back() {
        let gw = gateway();
        gw.insert("users", &Tuple::new([("name", Value::from("Jane"))]))
            .unwrap();
        let mut tx = running(&gw);

        let cs = Changeset::update(
            config(),
            "users",
            Tuple::new([("id", Value::Int(1))]),
            Tuple::new([("name", Value::from("Jane Doe"))]),
        )
        .unwrap();

        let stored = tx.update(cs).unwrap();
        tx.commit().unwrap();

        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].get("name"), Some(&Value::Text("Jane Doe".into())));
    }

    #[test]
    fn delete_removes_matching_records() {
        let gw = gateway();
        gw.insert("users", &Tuple::new([("name", Value::from("Jane"))]))
            .unwrap();
        let mut tx = running(&gw);

        let cs = Changeset::delete(config(), "users", Tuple::new([("id", Value::Int(1))])).unwrap();
        tx.delete(cs).unwrap();
        tx.commit().unwrap();

        assert_eq!(gw.count("users"), 0);
    }

    #[test]
    fn raw_operations_share_the_scope() {
        let gw = gateway();
        let mut tx = running(&gw);

        let stored = tx
            .insert_raw("users", &Tuple::new([("name", Value::from("Jane"))]))
            .unwrap();
        tx.update_raw(
            "users",
            &stored.project(&["id"]),
            &Tuple::new([("name", Value::from("Jane Doe"))]),
        )
        .unwrap();
        tx.rollback().unwrap();

        assert_eq!(gw.count("users"), 0);
    }

    #[test]
    fn writes_require_a_running_scope() {
        let gw = gateway();
        let mut tx = Transaction::new(Arc::clone(&gw) as Arc<dyn Gateway>);
        let cs = Changeset::create(
            config(),
            "users",
            Tuple::new([("name", Value::from("Jane"))]),
        )
        .unwrap();

        let err = tx.create(cs).unwrap_err();
        match err {
            Error::Transaction(e) => assert_eq!(e.kind, TransactionErrorKind::NotRunning),
            other => panic!("expected transaction error, got {other}"),
        }
    }

    #[test]
    fn finished_transactions_reject_reuse() {
        let gw = gateway();
        let mut tx = running(&gw);
        tx.commit().unwrap();

        let err = tx.commit().unwrap_err();
        match err {
            Error::Transaction(e) => assert_eq!(e.kind, TransactionErrorKind::AlreadyCommitted),
            other => panic!("expected transaction error, got {other}"),
        }

        let mut tx = running(&gw);
        tx.rollback().unwrap();
        let err = tx.begin().unwrap_err();
        match err {
            Error::Transaction(e) => assert_eq!(e.kind, TransactionErrorKind::AlreadyRolledBack),
            other => panic!("expected transaction error, got {other}"),
        }
    }

    #[test]
    fn rollback_undoes_every_write_in_the_scope() {
        let gw = gateway();
        let config = config();
        let mut tx = running(&gw);

        let user = Changeset::create(
            Arc::clone(&config),
            "users",
            Tuple::new([("name", Value::from("Jane"))]),
        )
        .unwrap();
        tx.create(user).unwrap();
        assert_eq!(gw.count("users"), 1);

        tx.rollback().unwrap();
        assert_eq!(gw.count("users"), 0);
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }

    #[test]
    fn dropping_a_running_transaction_rolls_back() {
        let gw = gateway();
        {
            let mut tx = running(&gw);
            let cs = Changeset::create(
                config(),
                "users",
                Tuple::new([("name", Value::from("Jane"))]),
            )
            .unwrap();
            tx.create(cs).unwrap();
        }
        assert_eq!(gw.count("users"), 0);
    }
}
