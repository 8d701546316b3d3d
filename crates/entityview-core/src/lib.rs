//! Core types and traits for entity views.
//!
//! This crate holds the seams the change-tracking engine talks through:
//!
//! - `Value` and `Row` for column data
//! - `Error` for the shared error taxonomy
//! - `Connection` for issuing statements inside the caller's transaction
//! - `EntityMetamodel` for mapping introspection
//! - `StatementBuilder` for turning column bindings into executable statements
//! - `Dialect` and `DialectCapabilities` for capability-driven planning
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod dialect;
pub mod error;
pub mod metamodel;
pub mod row;
pub mod statement;
pub mod value;

pub use connection::Connection;
pub use dialect::{Dialect, DialectCapabilities};
pub use error::{
    ConfigError, ConfigErrorKind, Error, OptimisticLockError, QueryError, QueryErrorKind, Result,
    TypeError, ViewError, ViewErrorKind,
};
pub use metamodel::{
    CollectionTable, ColumnDescriptor, ElementColumn, EntityDescriptor, EntityMetamodel,
    StaticMetamodel, StaticMetamodelBuilder,
};
pub use row::{ColumnInfo, Row};
pub use statement::{SqlStatementBuilder, Statement, StatementBuilder, StatementKind};
pub use value::Value;
