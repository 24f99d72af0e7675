//! Persistence state tracking, sessions, and transactional changesets.
//!
//! This crate layers a unit-of-work model over the tuple and gateway
//! primitives of `relmap-core`:
//!
//! - [`Mapper`] translates between entities and tuples and issues
//!   primitive writes
//! - [`PersistenceState`] classifies an entity as `New`, `Loaded`, or
//!   `Dirty` and knows how to persist itself
//! - [`Session`] tracks states by identity and flushes them in one
//!   commit
//! - [`Changeset`] describes pending writes declaratively, composed into
//!   trees through associations
//! - [`Transaction`] executes changeset trees all-or-nothing in
//!   dependency order
//! - [`Repository`] ties a gateway and configuration together as the
//!   entry point
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relmap::{Repository, Tuple, Value};
//! use relmap_core::{Config, Gateway};
//! # fn gateway() -> Arc<dyn Gateway> { unimplemented!() }
//!
//! # fn main() -> relmap::Result<()> {
//! let config = Config::builder()
//!     .relation("users", ["id"])
//!     .relation("posts", ["id"])
//!     .association("author", "users", "posts", "author_id")
//!     .build()?;
//! let repo = Repository::new(gateway(), Arc::new(config));
//!
//! let stored = repo.transaction(|tx| {
//!     let posts = repo.changeset("posts", vec![
//!         Tuple::new([("title", Value::from("Hello"))]),
//!     ])?;
//!     let user = repo
//!         .changeset("users", Tuple::new([("name", Value::from("Jane"))]))?
//!         .associate(posts, "author")?;
//!     tx.create(user)
//! })?;
//! # let _ = stored;
//! # Ok(())
//! # }
//! ```

pub mod changeset;
pub mod mapper;
pub mod repository;
pub mod session;
pub mod state;
pub mod transaction;

pub use changeset::{Changeset, ChangesetKind, Payload};
pub use mapper::Mapper;
pub use repository::Repository;
pub use session::{ObjectKey, Session};
pub use state::{DirtyState, PersistenceState, StateData};
pub use transaction::{Transaction, TransactionState};

pub use relmap_core::{
    Config, ConfigBuilder, Entity, Error, Gateway, Result, Tuple, Value,
};
