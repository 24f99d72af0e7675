//! Datastore adapter trait.
//!
//! A [`Gateway`] exposes the primitive operations this layer builds on:
//! tuple-level `insert`, `update`, `delete`, `read`, and a reentrant
//! transaction scope. Everything adapter-specific (dialects, pooling,
//! wire protocols) lives behind this seam.

use crate::error::Result;
use crate::tuple::Tuple;

/// Primitive datastore operations.
///
/// # Transaction scope
///
/// `begin` / `commit` / `rollback` form a reentrant scope: `begin` while a
/// scope is already open joins it, and only the outermost `commit` makes
/// the scope's writes durable. `rollback` at any depth aborts the whole
/// outermost scope. Isolation between concurrently open scopes on
/// different gateways is the store's concern, not this trait's.
pub trait Gateway: Send + Sync {
    /// Insert one tuple, returning it with store-assigned attributes
    /// (generated keys) merged in.
    fn insert(&self, relation: &str, tuple: &Tuple) -> Result<Tuple>;

    /// Insert a batch, returning the stored tuples in input order.
    fn insert_many(&self, relation: &str, tuples: &[Tuple]) -> Result<Vec<Tuple>> {
        tuples
            .iter()
            .map(|tuple| self.insert(relation, tuple))
            .collect()
    }

    /// Update every record matching `predicate` with the attributes in
    /// `changes`.
    fn update(&self, relation: &str, predicate: &Tuple, changes: &Tuple) -> Result<()>;

    /// Delete every record matching `predicate`.
    fn delete(&self, relation: &str, predicate: &Tuple) -> Result<()>;

    /// Read every record matching `predicate`. An empty predicate reads
    /// the whole relation.
    fn read(&self, relation: &str, predicate: &Tuple) -> Result<Vec<Tuple>>;

    /// Open (or join) the transaction scope.
    fn begin(&self) -> Result<()>;

    /// Close one level of the scope; the outermost close commits.
    fn commit(&self) -> Result<()>;

    /// Abort the scope, undoing every write since the outermost `begin`.
    fn rollback(&self) -> Result<()>;
}
