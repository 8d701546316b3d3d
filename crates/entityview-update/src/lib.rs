//! Change tracking and flush orchestration for updatable entity views.
//!
//! `entityview-update` is the **dirty-checking layer**. An entity view is a
//! shaped projection of one entity: some attributes map straight to columns,
//! some to embeddable components, some to associated entities or to
//! collection tables. This crate keeps track of what the caller changed on
//! such a view and turns exactly that into SQL.
//!
//! # Role In The Architecture
//!
//! - **View declarations** (`view_type`): attribute kinds, identity, version.
//! - **Metamodel** (`path`): attribute paths resolved against the entity mapping.
//! - **Instances** (`view`, `value`): values plus an owned dirty-state tracker.
//! - **Change models** (`change`): read-only inspection of what changed.
//! - **Planning** (`plan`): dirty state to a [`FlushPlan`] of per-entity units.
//! - **Execution** (`flush`): the plan to UPDATE/INSERT/DELETE statements.
//! - **Loading** (`fetch`): rows back into clean view instances.
//!
//! # Flush Lifecycle
//!
//! ```ignore
//! let planner = FlushPlanner::new(&meta, &config);
//! let plan = planner.plan(&view)?;
//! let result = FlushExecutor::new(&statements)
//!     .execute(&cx, &conn, &plan)
//!     .await;
//! if let Outcome::Ok(result) = &result {
//!     // Only now does the tracker forget its changes.
//!     complete_flush(&mut view, result);
//! }
//! ```

pub mod change;
pub mod config;
pub mod fetch;
pub mod flush;
pub mod path;
pub mod plan;
pub mod tracker;
pub mod user_type;
pub mod value;
pub mod view;
pub mod view_type;

pub use change::{
    ChangeModel, MapChangeModel, PluralChangeModel, SingularChangeModel, change_model,
};
pub use config::{FlushConfig, FlushMode, FlushStrategy};
pub use fetch::ViewFetcher;
pub use flush::{FlushExecutor, FlushResult, complete_flush, view_at};
pub use path::{AttributeMetadata, AttributeRole, ViewMetamodel, ViewMetamodelBuilder};
pub use plan::{
    CollectionAction, CollectionOp, CollectionRow, ColumnWrite, FlushPlan, FlushPlanner,
    FlushUnit, PathStep, RowDelete, UnitKind, VersionCheck, WriteMode,
};
pub use tracker::{
    ChangeKind, CollectionDelta, Dirt, DirtyFlags, DirtyStateTracker, MapDelta, MapEntryChange,
    attribute_dirt, collection_delta, map_delta, view_dirt,
};
pub use user_type::{BasicUserType, CloneEqType, UserTypeRegistry, UserValue};
pub use value::{AttributeValue, PluralCollection, PluralMap, identity_eq};
pub use view::{ViewInstance, ViewInstanceBuilder};
pub use view_type::{
    AttributeDecl, AttributeKind, BasicType, CollectionKind, ElementType, IdentityDecl, ViewType,
    ViewTypeBuilder,
};
