//! Domain entity trait.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A domain type backed by one relation.
///
/// Entities move across the mapping boundary through serde: a mapper dumps
/// an entity to a [`Tuple`](crate::Tuple) snapshot of its current field
/// values and loads one back from a persisted tuple. The constants name
/// the backing relation and the attributes that identify a record.
///
/// Key attributes are usually store-generated; model them as `Option` so
/// a not-yet-persisted entity dumps a null key.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name of the backing relation.
    const RELATION: &'static str;

    /// Identity attributes, in predicate order.
    const KEY: &'static [&'static str];
}
