//! Error types for entity view operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all entity view operations.
#[derive(Debug)]
pub enum Error {
    /// Statement execution errors reported by the persistence layer
    Query(QueryError),
    /// A version-checked write affected no row, or a reload saw a newer version
    OptimisticLock(OptimisticLockError),
    /// Type conversion errors
    Type(TypeError),
    /// View type registration and attribute resolution errors
    Config(ConfigError),
    /// Misuse of a view instance (mutating a reference, a read-only attribute, ...)
    View(ViewError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct OptimisticLockError {
    /// Entity name of the stale row
    pub entity: String,
    /// Table the version-checked statement ran against
    pub table: String,
    /// Identifier of the stale row
    pub id: Value,
    /// Version the view was loaded with, if the entity is versioned
    pub expected_version: Option<i64>,
    /// Version observed when the row was read back, when known
    pub actual_version: Option<i64>,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// A path segment is not declared on its parent view type
    UnknownAttribute,
    /// A view type name is not registered
    UnknownViewType,
    /// The entity metamodel has no column or table for an attribute
    UnmappedAttribute,
    /// A view type declaration is malformed
    InvalidDeclaration,
}

#[derive(Debug)]
pub struct ViewError {
    pub kind: ViewErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewErrorKind {
    /// The instance is an unfetched reference
    NotLoaded,
    /// Attribute is the id, the version, or declared non-updatable
    ReadOnly,
    /// Attribute was accessed with an accessor for a different kind
    KindMismatch,
    /// The instance lacks an identifier required by the operation
    MissingId,
    /// The persistence layer returned no row for the requested id
    NotFound,
    /// A new instance was requested of a view type not declared creatable
    NotCreatable,
}

impl Error {
    /// Is this a retryable error (deadlock, serialization, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            _ => false,
        }
    }

    /// Is this a registration or path resolution error?
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Is this an optimistic lock failure?
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Build a configuration error of the given kind.
    pub fn config(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Build a view misuse error of the given kind.
    pub fn view(kind: ViewErrorKind, message: impl Into<String>) -> Self {
        Error::View(ViewError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for an [`ConfigErrorKind::UnknownAttribute`] error.
    pub fn unknown_attribute(view_type: &str, path: &str) -> Self {
        Self::config(
            ConfigErrorKind::UnknownAttribute,
            format!("attribute '{path}' is not declared on view type '{view_type}'"),
        )
    }

    /// Shorthand for an [`ConfigErrorKind::UnknownViewType`] error.
    pub fn unknown_view_type(name: &str) -> Self {
        Self::config(
            ConfigErrorKind::UnknownViewType,
            format!("view type '{name}' is not registered"),
        )
    }

    /// Shorthand for an [`ConfigErrorKind::UnmappedAttribute`] error.
    pub fn unmapped(entity: &str, path: &str) -> Self {
        Self::config(
            ConfigErrorKind::UnmappedAttribute,
            format!("entity '{entity}' has no mapping for '{path}'"),
        )
    }

    /// Shorthand for an [`ConfigErrorKind::InvalidDeclaration`] error.
    pub fn invalid_declaration(message: impl Into<String>) -> Self {
        Self::config(ConfigErrorKind::InvalidDeclaration, message)
    }

    /// Shorthand for a [`ViewErrorKind::NotLoaded`] error.
    pub fn not_loaded(view_type: &str) -> Self {
        Self::view(
            ViewErrorKind::NotLoaded,
            format!("instance of '{view_type}' is a reference and must be fetched first"),
        )
    }

    /// Shorthand for a [`ViewErrorKind::ReadOnly`] error.
    pub fn read_only(view_type: &str, path: &str) -> Self {
        Self::view(
            ViewErrorKind::ReadOnly,
            format!("attribute '{path}' of '{view_type}' is not updatable"),
        )
    }

    /// Shorthand for a [`ViewErrorKind::KindMismatch`] error.
    pub fn kind_mismatch(path: &str, expected: &str) -> Self {
        Self::view(
            ViewErrorKind::KindMismatch,
            format!("attribute '{path}' does not hold {expected}"),
        )
    }

    /// Shorthand for a [`ViewErrorKind::NotCreatable`] error.
    pub fn not_creatable(view_type: &str) -> Self {
        Self::view(
            ViewErrorKind::NotCreatable,
            format!("view type '{view_type}' is not creatable"),
        )
    }

    /// Shorthand for a [`ViewErrorKind::MissingId`] error.
    pub fn missing_id(view_type: &str) -> Self {
        Self::view(
            ViewErrorKind::MissingId,
            format!("instance of '{view_type}' has no identifier"),
        )
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::OptimisticLock(e) => write!(f, "Optimistic lock error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::View(e) => write!(f, "View error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {} of entity '{}' (table '{}') was modified concurrently",
            self.id, self.entity, self.table
        )?;
        match (self.expected_version, self.actual_version) {
            (Some(expected), Some(actual)) => {
                write!(f, "; expected version {}, found {}", expected, actual)
            }
            (Some(expected), None) => write!(f, "; expected version {}", expected),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "column '{}': expected {}, found {}",
                col, self.expected, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ViewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<ViewError> for Error {
    fn from(err: ViewError) -> Self {
        Error::View(err)
    }
}

/// Result type alias for entity view operations.
pub type Result<T> = std::result::Result<T, Error>;
