//! Immutable mapping configuration.
//!
//! Relations, identity attributes, and association definitions are
//! declared once at startup and shared by reference afterwards. There is
//! no global registry; every component that needs configuration receives
//! an `Arc<Config>`.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// A relation known to the mapping layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    /// Relation name.
    pub name: String,
    /// Identity attributes, in predicate order.
    pub key: Vec<String>,
}

/// A named association between two relations.
///
/// When a child changeset is associated under `name`, the persisted
/// `source` record's identity is copied into the child's payload under
/// `foreign_key` before the child is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationDef {
    /// Association name used by `Changeset::associate`.
    pub name: String,
    /// Relation providing the identity.
    pub source: String,
    /// Relation receiving the foreign key.
    pub target: String,
    /// Attribute on the target that receives the source identity.
    pub foreign_key: String,
}

/// Immutable lookup table for relations and associations.
///
/// Built once through [`ConfigBuilder`], then frozen.
#[derive(Debug, Default)]
pub struct Config {
    relations: HashMap<String, RelationDef>,
    associations: HashMap<String, AssociationDef>,
}

impl Config {
    /// Start building a configuration.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Look up a relation definition.
    pub fn relation(&self, name: &str) -> Result<&RelationDef> {
        self.relations
            .get(name)
            .ok_or_else(|| Error::configuration(format!("unknown relation '{}'", name)))
    }

    /// Look up an association definition.
    pub fn association(&self, name: &str) -> Result<&AssociationDef> {
        self.associations
            .get(name)
            .ok_or_else(|| Error::configuration(format!("unknown association '{}'", name)))
    }

    /// Identity attributes of a relation.
    pub fn key_of(&self, relation: &str) -> Result<&[String]> {
        Ok(&self.relation(relation)?.key)
    }

    /// Iterate over every declared association.
    pub fn associations(&self) -> impl Iterator<Item = &AssociationDef> {
        self.associations.values()
    }
}

/// Builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    relations: HashMap<String, RelationDef>,
    associations: HashMap<String, AssociationDef>,
}

impl ConfigBuilder {
    /// Declare a relation and its identity attributes.
    pub fn relation<N: Into<String>>(
        mut self,
        name: N,
        key: impl IntoIterator<Item = &'static str>,
    ) -> Self {
        let name = name.into();
        let def = RelationDef {
            name: name.clone(),
            key: key.into_iter().map(str::to_string).collect(),
        };
        self.relations.insert(name, def);
        self
    }

    /// Declare an association from `source` to `target` under `name`.
    pub fn association<N: Into<String>>(
        mut self,
        name: N,
        source: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let def = AssociationDef {
            name: name.clone(),
            source: source.into(),
            target: target.into(),
            foreign_key: foreign_key.into(),
        };
        self.associations.insert(name, def);
        self
    }

    /// Freeze the configuration.
    ///
    /// Fails if an association references an undeclared relation.
    pub fn build(self) -> Result<Config> {
        for def in self.associations.values() {
            for relation in [&def.source, &def.target] {
                if !self.relations.contains_key(relation) {
                    return Err(Error::configuration(format!(
                        "association '{}' references undeclared relation '{}'",
                        def.name, relation
                    )));
                }
            }
        }

        Ok(Config {
            relations: self.relations,
            associations: self.associations,
        })
    }
}
