//! In-memory gateway for relmap.
//!
//! This gateway keeps every relation in memory and is suitable for unit
//! tests, integration tests, and ephemeral embedding. It enforces
//! not-null and uniqueness constraints so constraint-violation paths are
//! exercisable without a real store, assigns integer keys on insert, and
//! implements the reentrant transaction scope with whole-store snapshots.
//!
//! # Thread safety
//!
//! The gateway is internally locked and can be shared across threads
//! behind an `Arc`. Note that the transaction scope is gateway-wide:
//! concurrent transactions should use separate gateways.

use std::collections::HashMap;

use parking_lot::Mutex;

use relmap_core::{
    ConstraintKind, Error, Gateway, Result, TransactionError, TransactionErrorKind, Tuple, Value,
};

/// Schema of one in-memory relation.
#[derive(Debug, Clone)]
pub struct RelationSchema {
    name: String,
    key: Vec<String>,
    auto_key: bool,
    required: Vec<String>,
    unique: Vec<String>,
}

impl RelationSchema {
    /// New schema with a single auto-generated `id` key.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: vec!["id".to_string()],
            auto_key: true,
            required: Vec::new(),
            unique: Vec::new(),
        }
    }

    /// Override the identity attributes. Disables key generation when the
    /// key is composite.
    pub fn key(mut self, attributes: impl IntoIterator<Item = &'static str>) -> Self {
        self.key = attributes.into_iter().map(str::to_string).collect();
        self.auto_key = self.key.len() == 1;
        self
    }

    /// Caller-supplied keys only; inserts never generate one.
    pub fn manual_key(mut self) -> Self {
        self.auto_key = false;
        self
    }

    /// Mark an attribute not-null.
    pub fn require(mut self, attribute: impl Into<String>) -> Self {
        self.required.push(attribute.into());
        self
    }

    /// Mark an attribute unique across the relation.
    pub fn unique(mut self, attribute: impl Into<String>) -> Self {
        self.unique.push(attribute.into());
        self
    }
}

#[derive(Debug, Clone)]
struct Table {
    schema: RelationSchema,
    rows: Vec<Tuple>,
    next_key: i64,
}

impl Table {
    fn new(schema: RelationSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
            next_key: 1,
        }
    }
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Table>,
    /// Tables as of the outermost `begin`, kept until the scope closes.
    snapshot: Option<HashMap<String, Table>>,
    depth: usize,
    writes: u64,
}

/// An in-memory [`Gateway`] implementation.
#[derive(Default)]
pub struct MemoryGateway {
    inner: Mutex<Inner>,
}

impl MemoryGateway {
    /// Create an empty gateway with no relations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a relation. Replaces any existing relation of that name.
    pub fn register(&self, schema: RelationSchema) {
        let mut inner = self.inner.lock();
        inner
            .tables
            .insert(schema.name.clone(), Table::new(schema));
    }

    /// Total number of insert/update/delete calls that reached storage.
    ///
    /// Used by tests asserting that clean states issue zero writes.
    pub fn writes(&self) -> u64 {
        self.inner.lock().writes
    }

    /// Number of records currently in a relation.
    pub fn count(&self, relation: &str) -> usize {
        self.inner
            .lock()
            .tables
            .get(relation)
            .map_or(0, |table| table.rows.len())
    }
}

fn unknown_relation(relation: &str) -> Error {
    Error::adapter(format!("unknown relation '{}'", relation))
}

impl Inner {
    fn table(&self, relation: &str) -> Result<&Table> {
        self.tables
            .get(relation)
            .ok_or_else(|| unknown_relation(relation))
    }

    fn table_mut(&mut self, relation: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(relation)
            .ok_or_else(|| unknown_relation(relation))
    }

    fn check_constraints(
        table: &Table,
        candidate: &Tuple,
        ignore_predicate: Option<&Tuple>,
    ) -> Result<()> {
        for attribute in &table.schema.required {
            let value = candidate.get(attribute);
            if value.is_none() || value == Some(&Value::Null) {
                return Err(Error::constraint(
                    ConstraintKind::NotNull,
                    &table.schema.name,
                    attribute,
                    "value is required",
                ));
            }
        }

        for attribute in &table.schema.unique {
            let Some(value) = candidate.get(attribute) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let collision = table.rows.iter().any(|row| {
                row.get(attribute) == Some(value)
                    && !ignore_predicate.is_some_and(|p| row.matches(p))
            });
            if collision {
                return Err(Error::constraint(
                    ConstraintKind::Unique,
                    &table.schema.name,
                    attribute,
                    format!("duplicate value {}", value),
                ));
            }
        }

        Ok(())
    }
}

impl Gateway for MemoryGateway {
    fn insert(&self, relation: &str, tuple: &Tuple) -> Result<Tuple> {
        let mut inner = self.inner.lock();

        let stored = {
            let table = inner.table(relation)?;
            let needs_key = table.schema.auto_key
                && table.schema.key.len() == 1
                && tuple
                    .get(&table.schema.key[0])
                    .is_none_or(Value::is_null);

            let stored = if needs_key {
                tuple.with(table.schema.key[0].clone(), table.next_key)
            } else {
                tuple.clone()
            };

            Inner::check_constraints(table, &stored, None)?;
            stored
        };

        let table = inner.table_mut(relation)?;
        if table.schema.auto_key && table.schema.key.len() == 1 {
            table.next_key += 1;
        }
        table.rows.push(stored.clone());
        inner.writes += 1;

        tracing::trace!(relation, tuple = %stored, "insert");
        Ok(stored)
    }

    fn update(&self, relation: &str, predicate: &Tuple, changes: &Tuple) -> Result<()> {
        let mut inner = self.inner.lock();

        {
            let table = inner.table(relation)?;
            for row in table.rows.iter().filter(|row| row.matches(predicate)) {
                let updated = row.merge(changes);
                Inner::check_constraints(table, &updated, Some(predicate))?;
            }
        }

        let table = inner.table_mut(relation)?;
        let mut matched = 0usize;
        for row in &mut table.rows {
            if row.matches(predicate) {
                *row = row.merge(changes);
                matched += 1;
            }
        }
        inner.writes += 1;

        tracing::trace!(relation, matched, "update");
        Ok(())
    }

    fn delete(&self, relation: &str, predicate: &Tuple) -> Result<()> {
        let mut inner = self.inner.lock();
        let table = inner.table_mut(relation)?;
        let before = table.rows.len();
        table.rows.retain(|row| !row.matches(predicate));
        let removed = before - table.rows.len();
        inner.writes += 1;

        tracing::trace!(relation, removed, "delete");
        Ok(())
    }

    fn read(&self, relation: &str, predicate: &Tuple) -> Result<Vec<Tuple>> {
        let inner = self.inner.lock();
        let table = inner.table(relation)?;
        Ok(table
            .rows
            .iter()
            .filter(|row| row.matches(predicate))
            .cloned()
            .collect())
    }

    fn begin(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.depth == 0 {
            inner.snapshot = Some(inner.tables.clone());
        }
        inner.depth += 1;
        tracing::trace!(depth = inner.depth, "begin");
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.depth == 0 {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotRunning,
                message: "commit outside of a transaction scope".into(),
            }));
        }
        inner.depth -= 1;
        if inner.depth == 0 {
            inner.snapshot = None;
        }
        tracing::trace!(depth = inner.depth, "commit");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if inner.depth == 0 {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotRunning,
                message: "rollback outside of a transaction scope".into(),
            }));
        }

        // Any rollback aborts the whole outermost scope.
        if let Some(snapshot) = &inner.snapshot {
            inner.tables = snapshot.clone();
        }
        inner.depth -= 1;
        if inner.depth == 0 {
            inner.snapshot = None;
        }
        tracing::trace!(depth = inner.depth, "rollback");
        Ok(())
    }
}
