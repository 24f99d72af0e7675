//! Error types for relmap operations.

use std::fmt;

/// The primary error type for all relmap operations.
#[derive(Debug)]
pub enum Error {
    /// The store rejected a write (null, uniqueness, referential constraint)
    Constraint(ConstraintError),
    /// The changeset association graph contains a cycle
    AssociationCycle(CycleError),
    /// An update or delete referenced an object with no tracked identity
    UnknownIdentity(IdentityError),
    /// Adapter-level failure (connectivity, timeout, storage)
    Adapter(AdapterError),
    /// Transaction scope misuse
    Transaction(TransactionError),
    /// Entity/tuple mapping failure
    Mapping(String),
}

/// A write rejected by the store.
#[derive(Debug)]
pub struct ConstraintError {
    pub kind: ConstraintKind,
    pub relation: String,
    pub attribute: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// A required attribute was null or missing
    NotNull,
    /// A unique attribute collided with an existing record
    Unique,
    /// A referenced record does not exist
    ForeignKey,
}

/// A dependency cycle between associated changesets.
#[derive(Debug)]
pub struct CycleError {
    /// Relations along the cycle, in walk order.
    pub relations: Vec<String>,
}

/// An operation that requires a known identity was given none.
#[derive(Debug)]
pub struct IdentityError {
    pub relation: String,
    pub message: String,
}

/// An adapter-level failure, surfaced verbatim after rollback.
#[derive(Debug)]
pub struct AdapterError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Misuse of the transaction scope.
#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Scope was already committed
    AlreadyCommitted,
    /// Scope was already rolled back
    AlreadyRolledBack,
    /// Operation requires a running scope
    NotRunning,
    /// The changeset graph references an unknown relation or association
    Configuration,
}

impl Error {
    /// Build a constraint violation error.
    pub fn constraint(
        kind: ConstraintKind,
        relation: impl Into<String>,
        attribute: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Constraint(ConstraintError {
            kind,
            relation: relation.into(),
            attribute: Some(attribute.into()),
            message: message.into(),
        })
    }

    /// Build an unknown-identity error.
    pub fn unknown_identity(relation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::UnknownIdentity(IdentityError {
            relation: relation.into(),
            message: message.into(),
        })
    }

    /// Build an adapter error without an underlying source.
    pub fn adapter(message: impl Into<String>) -> Self {
        Error::Adapter(AdapterError {
            message: message.into(),
            source: None,
        })
    }

    /// Build a configuration error for the transaction pipeline.
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind: TransactionErrorKind::Configuration,
            message: message.into(),
        })
    }

    /// Is this a constraint violation?
    pub fn is_constraint(&self) -> bool {
        matches!(self, Error::Constraint(_))
    }

    /// Is this an association cycle detected at changeset build time?
    pub fn is_cycle(&self) -> bool {
        matches!(self, Error::AssociationCycle(_))
    }

    /// The relation this error concerns, if known.
    pub fn relation(&self) -> Option<&str> {
        match self {
            Error::Constraint(e) => Some(&e.relation),
            Error::UnknownIdentity(e) => Some(&e.relation),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Constraint(e) => write!(f, "Constraint violation: {}", e),
            Error::AssociationCycle(e) => write!(f, "Association cycle: {}", e),
            Error::UnknownIdentity(e) => {
                write!(f, "Unknown identity in '{}': {}", e.relation, e.message)
            }
            Error::Adapter(e) => write!(f, "Adapter error: {}", e.message),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Mapping(msg) => write!(f, "Mapping error: {}", msg),
        }
    }
}

impl fmt::Display for ConstraintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ConstraintKind::NotNull => "not-null",
            ConstraintKind::Unique => "unique",
            ConstraintKind::ForeignKey => "foreign-key",
        };
        match &self.attribute {
            Some(attribute) => write!(
                f,
                "{} constraint on {}.{}: {}",
                kind, self.relation, attribute, self.message
            ),
            None => write!(f, "{} constraint on {}: {}", kind, self.relation, self.message),
        }
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relations.join(" -> "))
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Adapter(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<ConstraintError> for Error {
    fn from(err: ConstraintError) -> Self {
        Error::Constraint(err)
    }
}

impl From<CycleError> for Error {
    fn from(err: CycleError) -> Self {
        Error::AssociationCycle(err)
    }
}

impl From<AdapterError> for Error {
    fn from(err: AdapterError) -> Self {
        Error::Adapter(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Mapping(err.to_string())
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;
