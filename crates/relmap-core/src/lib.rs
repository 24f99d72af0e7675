//! Core types and traits for relmap.
//!
//! This crate provides the foundational abstractions for the mapping and
//! persistence layer:
//!
//! - `Tuple` and `Value` for immutable record snapshots
//! - `Entity` trait for serde-backed domain structs
//! - `Gateway` trait for datastore adapters
//! - `Config` for immutable relation/association definitions
//! - shared error types

pub mod config;
pub mod entity;
pub mod error;
pub mod gateway;
pub mod tuple;
pub mod value;

pub use config::{AssociationDef, Config, ConfigBuilder, RelationDef};
pub use entity::Entity;
pub use error::{
    AdapterError, ConstraintError, ConstraintKind, CycleError, Error, IdentityError, Result,
    TransactionError, TransactionErrorKind,
};
pub use gateway::Gateway;
pub use tuple::Tuple;
pub use value::{Value, hash_values};
