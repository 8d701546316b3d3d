//! Entity views for Rust.
//!
//! An entity view is an updatable projection of a mapped entity. Fetch one,
//! change it like a plain value, and `update` writes back exactly what
//! changed: an INSERT for an added tag, a targeted `SET city = ?` for an
//! edited embeddable leaf, a version-checked UPDATE with the increment
//! folded in.
//!
//! # Quick Start
//!
//! ```ignore
//! use entityview::prelude::*;
//!
//! let entities = StaticMetamodel::builder()
//!     .entity(EntityDescriptor::new("Document", "documents", "id").versioned("version"))
//!     .column("name", "name")
//!     .collection(
//!         "tags",
//!         CollectionTable::new("document_tags", "document_id").element_column("tag"),
//!     )
//!     .build();
//!
//! let meta = ViewMetamodel::builder()
//!     .register(
//!         ViewType::builder("DocView")
//!             .entity("Document")
//!             .id("id")
//!             .version("version")
//!             .basic("name")
//!             .set("tags", ElementType::basic())
//!             .build(),
//!     )
//!     .build(Arc::new(entities))?;
//!
//! async fn add_tag(cx: &Cx, conn: &impl Connection, manager: &mut EntityViewManager) {
//!     let Outcome::Ok(Some(mut doc)) = manager.find(cx, conn, "DocView", &Value::BigInt(1)).await
//!     else {
//!         return;
//!     };
//!     doc.collection_mut("tags").unwrap().add("c");
//!
//!     // INSERT INTO "document_tags" ... for "c" only, then the version bump.
//!     manager.update(cx, conn, &mut doc).await;
//!     assert!(!manager.get_change_model(&doc).is_dirty());
//! }
//! ```
//!
//! # Features
//!
//! - **Minimal SQL**: in-place collection edits become row-level INSERT/DELETE
//! - **Inspectable changes**: change models over every attribute path
//! - **Optimistic locking**: version checks on every versioned UPDATE and DELETE
//! - **Structured concurrency**: Built on asupersync for cancel-correct operations
//! - **Capability-driven**: dialect flags choose targeted writes or reload-and-diff

pub mod config;
pub mod listener;
pub mod manager;

pub use config::{EntityViewConfig, UpdateOptions};
pub use listener::{ViewEvent, ViewListeners};
pub use manager::EntityViewManager;

pub use entityview_core::{
    CollectionTable, ColumnDescriptor, ConfigErrorKind, Connection, Cx, Dialect,
    DialectCapabilities, EntityDescriptor, EntityMetamodel, Error, OptimisticLockError, Outcome,
    Result, Row, SqlStatementBuilder, StaticMetamodel, Statement, StatementBuilder, StatementKind,
    Value, ViewErrorKind,
};

pub use entityview_update::{
    AttributeDecl, AttributeValue, BasicUserType, ChangeKind, ChangeModel, CloneEqType,
    CollectionKind, ElementType, FlushMode, FlushResult, FlushStrategy, MapChangeModel,
    PluralChangeModel, PluralCollection, PluralMap, SingularChangeModel, UserValue,
    ViewInstance, ViewMetamodel, ViewType,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use entityview::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Change inspection
        ChangeKind,
        ChangeModel,
        CloneEqType,
        CollectionTable,
        // Core traits and types
        Connection,
        Cx,
        ElementType,
        EntityDescriptor,
        // Manager
        EntityViewConfig,
        EntityViewManager,
        Error,
        FlushMode,
        FlushStrategy,
        Outcome,
        Result,
        StaticMetamodel,
        UpdateOptions,
        Value,
        // Views
        ViewInstance,
        ViewMetamodel,
        ViewType,
    };
}
