//! Changesets: declarative descriptions of pending writes.
//!
//! A [`Changeset`] names a relation, a kind of write, and a payload of
//! one or more tuples. Changesets compose into trees through
//! [`Changeset::associate`]; the transaction pipeline later resolves the
//! tree into a dependency-ordered sequence of writes, copying each
//! provider's identity into its dependents' payloads.
//!
//! A changeset never touches the store. Construction and association
//! validate eagerly, so a changeset that builds successfully is known to
//! reference only declared relations and an acyclic association graph.

use std::sync::Arc;

use relmap_core::{AssociationDef, Config, CycleError, Error, Result, Tuple};

/// Payload of a create or update: one tuple or a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    One(Tuple),
    Many(Vec<Tuple>),
}

impl Payload {
    /// Tuples in declaration order, regardless of arity.
    pub fn tuples(&self) -> &[Tuple] {
        match self {
            Payload::One(tuple) => std::slice::from_ref(tuple),
            Payload::Many(tuples) => tuples,
        }
    }

    /// Whether this payload holds more than one tuple.
    pub fn is_batch(&self) -> bool {
        matches!(self, Payload::Many(_))
    }
}

impl From<Tuple> for Payload {
    fn from(tuple: Tuple) -> Self {
        Payload::One(tuple)
    }
}

impl From<Vec<Tuple>> for Payload {
    fn from(tuples: Vec<Tuple>) -> Self {
        Payload::Many(tuples)
    }
}

/// The kind of write a changeset describes.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangesetKind {
    /// Insert the payload tuples.
    Create,
    /// Merge the payload into records matching `predicate`.
    Update { predicate: Tuple },
    /// Delete records matching `predicate`.
    Delete { predicate: Tuple },
}

/// A child changeset attached under an association name.
#[derive(Debug, Clone)]
pub struct Association {
    pub(crate) def: AssociationDef,
    pub(crate) child: Changeset,
}

impl Association {
    pub fn def(&self) -> &AssociationDef {
        &self.def
    }

    pub fn child(&self) -> &Changeset {
        &self.child
    }
}

/// A pending write against one relation, with associated children.
#[derive(Debug, Clone)]
pub struct Changeset {
    config: Arc<Config>,
    relation: String,
    kind: ChangesetKind,
    payload: Payload,
    children: Vec<Association>,
}

impl Changeset {
    /// Describe an insert into `relation`.
    pub fn create(
        config: Arc<Config>,
        relation: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Result<Self> {
        let relation = relation.into();
        config.relation(&relation)?;
        Ok(Self {
            config,
            relation,
            kind: ChangesetKind::Create,
            payload: payload.into(),
            children: Vec::new(),
        })
    }

    /// Describe an update of the records matching `predicate`.
    ///
    /// An empty predicate would address every record in the relation;
    /// that is never what an update changeset means, so it fails with
    /// `UnknownIdentity`.
    pub fn update(
        config: Arc<Config>,
        relation: impl Into<String>,
        predicate: Tuple,
        payload: impl Into<Payload>,
    ) -> Result<Self> {
        let relation = relation.into();
        config.relation(&relation)?;
        if predicate.is_empty() {
            return Err(Error::unknown_identity(
                relation,
                "update changeset requires a non-empty predicate",
            ));
        }
        Ok(Self {
            config,
            relation,
            kind: ChangesetKind::Update { predicate },
            payload: payload.into(),
            children: Vec::new(),
        })
    }

    /// Describe a delete of the records matching `predicate`.
    pub fn delete(
        config: Arc<Config>,
        relation: impl Into<String>,
        predicate: Tuple,
    ) -> Result<Self> {
        let relation = relation.into();
        config.relation(&relation)?;
        if predicate.is_empty() {
            return Err(Error::unknown_identity(
                relation,
                "delete changeset requires a non-empty predicate",
            ));
        }
        Ok(Self {
            config,
            relation,
            kind: ChangesetKind::Delete { predicate },
            payload: Payload::Many(Vec::new()),
            children: Vec::new(),
        })
    }

    /// Attach `child` under the association `name`.
    ///
    /// Validates that the association is declared, that the child's
    /// relation matches the association's target, that a provider for
    /// the association's source exists in this tree, and that the
    /// resulting association graph stays acyclic. Consumes and returns
    /// the changeset so calls chain fluently.
    pub fn associate(mut self, child: Changeset, name: &str) -> Result<Self> {
        let def = self.config.association(name)?.clone();

        if child.relation != def.target {
            return Err(Error::configuration(format!(
                "association '{}' targets '{}', got a changeset for '{}'",
                name, def.target, child.relation
            )));
        }
        if !self.tree_contains(&def.source) {
            return Err(Error::configuration(format!(
                "association '{}' needs a provider for '{}', none in this changeset tree",
                name, def.source
            )));
        }

        self.children.push(Association { def, child });
        if let Some(relations) = self.find_cycle() {
            self.children.pop();
            return Err(Error::AssociationCycle(CycleError { relations }));
        }
        Ok(self)
    }

    /// The relation this changeset writes to.
    pub fn relation(&self) -> &str {
        &self.relation
    }

    pub fn kind(&self) -> &ChangesetKind {
        &self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Associated children, in declaration order.
    pub fn children(&self) -> &[Association] {
        &self.children
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    fn tree_contains(&self, relation: &str) -> bool {
        self.relation == relation
            || self
                .children
                .iter()
                .any(|assoc| assoc.child.tree_contains(relation))
    }

    /// Walk the association edges of the tree looking for a relation
    /// that depends, transitively, on itself. Returns the cycle as a
    /// relation path ending where it started.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut edges: Vec<(String, String)> = Vec::new();
        self.collect_edges(&mut edges);

        let mut starts: Vec<&str> = Vec::new();
        for (source, target) in &edges {
            for relation in [source.as_str(), target.as_str()] {
                if !starts.contains(&relation) {
                    starts.push(relation);
                }
            }
        }

        for start in starts {
            let mut path = vec![start.to_string()];
            if Self::walk(start, start, &edges, &mut path) {
                return Some(path);
            }
        }
        None
    }

    fn walk(start: &str, current: &str, edges: &[(String, String)], path: &mut Vec<String>) -> bool {
        for (source, target) in edges {
            if source != current {
                continue;
            }
            if target == start {
                path.push(target.clone());
                return true;
            }
            // Guard against revisiting within one walk.
            if path.iter().any(|seen| seen == target) {
                continue;
            }
            path.push(target.clone());
            if Self::walk(start, target, edges, path) {
                return true;
            }
            path.pop();
        }
        false
    }

    fn collect_edges(&self, edges: &mut Vec<(String, String)>) {
        for assoc in &self.children {
            edges.push((assoc.def.source.clone(), assoc.def.target.clone()));
            assoc.child.collect_edges(edges);
        }
    }
}
