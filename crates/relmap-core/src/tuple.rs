//! Immutable attribute tuples.

use crate::error::{Error, Result};
use crate::value::Value;

/// An immutable, ordered attribute-name to value snapshot of one record.
///
/// Tuples are constructed once and never mutated; every operation that
/// "changes" a tuple returns a new one. Attribute order is preserved for
/// iteration, but equality is structural: two tuples are equal when they
/// carry the same attributes with equal values, regardless of order.
#[derive(Debug, Clone, Default)]
pub struct Tuple {
    attributes: Vec<(String, Value)>,
}

impl Tuple {
    /// Create a tuple from name/value pairs.
    ///
    /// Later occurrences of the same attribute name win, matching the
    /// merge semantics used for store-assigned fields.
    pub fn new<I, N, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<Value>,
    {
        let mut tuple = Tuple::default();
        for (name, value) in pairs {
            tuple.set(name.into(), value.into());
        }
        tuple
    }

    /// The empty tuple. As a read predicate it matches every record.
    pub fn empty() -> Self {
        Tuple::default()
    }

    fn set(&mut self, name: String, value: Value) {
        if let Some(slot) = self.attributes.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.attributes.push((name, value));
        }
    }

    /// Get a value by attribute name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Check if an attribute exists.
    pub fn contains(&self, name: &str) -> bool {
        self.attributes.iter().any(|(n, _)| n == name)
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Check if the tuple has no attributes.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Iterate over (name, value) pairs in attribute order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Iterate over attribute names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|(n, _)| n.as_str())
    }

    /// Build a new tuple containing only the named attributes, in the
    /// order given. Missing attributes are skipped.
    pub fn project(&self, names: &[&str]) -> Tuple {
        let attributes = names
            .iter()
            .filter_map(|name| {
                self.get(name)
                    .map(|value| ((*name).to_string(), value.clone()))
            })
            .collect();
        Tuple { attributes }
    }

    /// Build a new tuple with `other`'s attributes merged in.
    ///
    /// Attributes present in both take `other`'s value; attributes only
    /// in `other` are appended. Used to fold store-assigned fields into a
    /// payload and to propagate association keys.
    pub fn merge(&self, other: &Tuple) -> Tuple {
        let mut merged = self.clone();
        for (name, value) in other.iter() {
            merged.set(name.to_string(), value.clone());
        }
        merged
    }

    /// Build a new tuple with a single attribute set.
    pub fn with(&self, name: impl Into<String>, value: impl Into<Value>) -> Tuple {
        let mut next = self.clone();
        next.set(name.into(), value.into());
        next
    }

    /// Attributes of `self` whose value differs from (or is absent in)
    /// `base`. This is the change list written by an update.
    pub fn diff(&self, base: &Tuple) -> Tuple {
        let attributes = self
            .attributes
            .iter()
            .filter(|(name, value)| base.get(name) != Some(value))
            .cloned()
            .collect();
        Tuple { attributes }
    }

    /// Check whether every attribute of `predicate` matches this tuple.
    ///
    /// An empty predicate matches everything.
    pub fn matches(&self, predicate: &Tuple) -> bool {
        predicate
            .iter()
            .all(|(name, value)| self.get(name) == Some(value))
    }

    /// Convert to a JSON object for entity loading.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .attributes
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Convert from a JSON object produced by dumping an entity.
    pub fn from_json(json: &serde_json::Value) -> Result<Tuple> {
        let serde_json::Value::Object(map) = json else {
            return Err(Error::Mapping(format!(
                "expected a JSON object, found {}",
                json
            )));
        };

        let mut tuple = Tuple::default();
        for (name, value) in map {
            let value = Value::from_json(value).ok_or_else(|| {
                Error::Mapping(format!("attribute '{}' is not a scalar value", name))
            })?;
            tuple.set(name.clone(), value);
        }
        Ok(tuple)
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.attributes.len() == other.attributes.len()
            && self
                .attributes
                .iter()
                .all(|(name, value)| other.get(name) == Some(value))
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, (name, value)) in self.attributes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tuple(pairs: &[(&str, Value)]) -> Tuple {
        Tuple::new(pairs.iter().map(|(n, v)| ((*n).to_string(), v.clone())))
    }

    #[test]
    fn equality_ignores_attribute_order() {
        let a = tuple(&[("id", Value::Int(1)), ("name", Value::Text("Jane".into()))]);
        let b = tuple(&[("name", Value::Text("Jane".into())), ("id", Value::Int(1))]);

        assert_eq!(a, b);
    }

    #[test]
    fn equality_is_over_all_fields() {
        let a = tuple(&[("id", Value::Int(1)), ("name", Value::Text("Jane".into()))]);
        let b = tuple(&[("id", Value::Int(1)), ("name", Value::Text("Joe".into()))]);
        let c = tuple(&[("id", Value::Int(1))]);

        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn later_pairs_win() {
        let t = tuple(&[("id", Value::Int(1)), ("id", Value::Int(2))]);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get("id"), Some(&Value::Int(2)));
    }

    #[test]
    fn project_keeps_requested_order() {
        let t = tuple(&[
            ("a", Value::Int(1)),
            ("b", Value::Int(2)),
            ("c", Value::Int(3)),
        ]);

        let p = t.project(&["c", "a", "missing"]);
        let names: Vec<_> = p.names().collect();
        assert_eq!(names, vec!["c", "a"]);
    }

    #[test]
    fn merge_overwrites_and_appends() {
        let base = tuple(&[("id", Value::Null), ("name", Value::Text("Jane".into()))]);
        let assigned = tuple(&[("id", Value::Int(7))]);

        let merged = base.merge(&assigned);
        assert_eq!(merged.get("id"), Some(&Value::Int(7)));
        assert_eq!(merged.get("name"), Some(&Value::Text("Jane".into())));

        let extended = base.merge(&tuple(&[("email", Value::Text("j@x".into()))]));
        assert_eq!(extended.len(), 3);
    }

    #[test]
    fn diff_lists_changed_attributes_only() {
        let old = tuple(&[("id", Value::Int(1)), ("name", Value::Text("Jane".into()))]);
        let new = tuple(&[
            ("id", Value::Int(1)),
            ("name", Value::Text("Jane Doe".into())),
        ]);

        let changes = new.diff(&old);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.get("name"), Some(&Value::Text("Jane Doe".into())));
        assert!(old.diff(&old).is_empty());
    }

    #[test]
    fn matches_predicate() {
        let row = tuple(&[("id", Value::Int(1)), ("name", Value::Text("Jane".into()))]);

        assert!(row.matches(&Tuple::empty()));
        assert!(row.matches(&tuple(&[("id", Value::Int(1))])));
        assert!(!row.matches(&tuple(&[("id", Value::Int(2))])));
        assert!(!row.matches(&tuple(&[("missing", Value::Null)])));
    }

    #[test]
    fn json_round_trip() {
        let t = tuple(&[
            ("id", Value::Int(1)),
            ("name", Value::Text("Jane".into())),
            ("active", Value::Bool(true)),
            ("note", Value::Null),
        ]);

        let back = Tuple::from_json(&t.to_json()).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn from_json_rejects_non_objects() {
        assert!(Tuple::from_json(&serde_json::json!([1, 2])).is_err());
        assert!(Tuple::from_json(&serde_json::json!({"nested": {"a": 1}})).is_err());
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            "[a-z]{0,8}".prop_map(Value::Text),
        ]
    }

    fn arb_tuple() -> impl Strategy<Value = Tuple> {
        proptest::collection::btree_map("[a-z]{1,4}", arb_value(), 0..6)
            .prop_map(|map| Tuple::new(map.into_iter()))
    }

    proptest! {
        #[test]
        fn merge_with_self_is_identity(t in arb_tuple()) {
            prop_assert_eq!(t.merge(&t), t);
        }

        #[test]
        fn diff_against_self_is_empty(t in arb_tuple()) {
            prop_assert!(t.diff(&t).is_empty());
        }

        #[test]
        fn merged_diff_restores_changes(a in arb_tuple(), b in arb_tuple()) {
            // Applying the diff of a merge back onto the base reproduces it.
            let merged = a.merge(&b);
            let changes = merged.diff(&a);
            prop_assert_eq!(a.merge(&changes), merged);
        }
    }
}
