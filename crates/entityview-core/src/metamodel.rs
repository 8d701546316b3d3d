//! The entity metamodel service.
//!
//! Answers "what columns or tables back this entity attribute path". The
//! engine consumes it read-only; mapping discovery happens elsewhere.
//! [`StaticMetamodel`] is a builder-populated implementation suitable for
//! hosts that declare their mappings in code.

use std::collections::HashMap;
use std::fmt::Debug;

/// Table-level facts about one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    /// Entity name.
    pub name: String,
    /// Table holding the entity rows.
    pub table: String,
    /// Primary key column.
    pub id_column: String,
    /// Optimistic lock column, when the entity is versioned.
    pub version_column: Option<String>,
}

impl EntityDescriptor {
    /// Describe an unversioned entity.
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        id_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            id_column: id_column.into(),
            version_column: None,
        }
    }

    /// Mark the entity as versioned through the given column.
    pub fn versioned(mut self, column: impl Into<String>) -> Self {
        self.version_column = Some(column.into());
        self
    }
}

/// What backs an attribute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnDescriptor {
    /// A column of the owning row (basic values, to-one foreign keys,
    /// embeddable leaves).
    Column {
        /// Table holding the column.
        table: String,
        /// Column name.
        column: String,
    },
    /// A collection or join table keyed by the owner's id.
    CollectionTable(CollectionTable),
}

impl ColumnDescriptor {
    /// Column name for single-column mappings.
    pub fn column(&self) -> Option<&str> {
        match self {
            ColumnDescriptor::Column { column, .. } => Some(column),
            ColumnDescriptor::CollectionTable(_) => None,
        }
    }

    /// Collection table for plural mappings.
    pub fn collection_table(&self) -> Option<&CollectionTable> {
        match self {
            ColumnDescriptor::Column { .. } => None,
            ColumnDescriptor::CollectionTable(t) => Some(t),
        }
    }
}

/// Layout of a collection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionTable {
    /// Table name.
    pub table: String,
    /// Column holding the owner's id.
    pub owner_column: String,
    /// Map key or list index column.
    pub key_column: Option<String>,
    /// Columns holding the element. A scalar or to-one element has one
    /// column with an empty path; an embeddable element has one column per
    /// leaf path.
    pub element_columns: Vec<ElementColumn>,
}

/// One column of a collection element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementColumn {
    /// Leaf path inside the element, empty for scalar elements.
    pub path: String,
    /// Column name.
    pub column: String,
}

impl CollectionTable {
    /// Start a collection table description.
    pub fn new(table: impl Into<String>, owner_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            owner_column: owner_column.into(),
            key_column: None,
            element_columns: Vec::new(),
        }
    }

    /// Single column holding a scalar element or a to-one element id.
    pub fn element_column(mut self, column: impl Into<String>) -> Self {
        self.element_columns.push(ElementColumn {
            path: String::new(),
            column: column.into(),
        });
        self
    }

    /// Column for one leaf of an embeddable element.
    pub fn embedded_column(mut self, path: impl Into<String>, column: impl Into<String>) -> Self {
        self.element_columns.push(ElementColumn {
            path: path.into(),
            column: column.into(),
        });
        self
    }

    /// Map key or list index column.
    pub fn key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = Some(column.into());
        self
    }

    /// Column for the given element leaf path.
    pub fn column_for(&self, path: &str) -> Option<&str> {
        self.element_columns
            .iter()
            .find(|c| c.path == path)
            .map(|c| c.column.as_str())
    }
}

/// Read-only mapping introspection consumed by view registration and the
/// flush planner.
pub trait EntityMetamodel: Send + Sync + Debug {
    /// Look up an entity by name.
    fn entity(&self, name: &str) -> Option<&EntityDescriptor>;

    /// Resolve a dotted entity attribute path to its backing storage.
    fn resolve_column(&self, entity: &str, path: &str) -> Option<ColumnDescriptor>;

    /// Whether the entity carries an optimistic lock column.
    fn is_versioned(&self, entity: &str) -> bool {
        self.entity(entity)
            .is_some_and(|e| e.version_column.is_some())
    }
}

/// An [`EntityMetamodel`] populated up front through a builder.
#[derive(Debug, Clone, Default)]
pub struct StaticMetamodel {
    entities: HashMap<String, EntityDescriptor>,
    columns: HashMap<(String, String), ColumnDescriptor>,
}

impl StaticMetamodel {
    /// Create a builder.
    pub fn builder() -> StaticMetamodelBuilder {
        StaticMetamodelBuilder::default()
    }
}

impl EntityMetamodel for StaticMetamodel {
    fn entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entities.get(name)
    }

    fn resolve_column(&self, entity: &str, path: &str) -> Option<ColumnDescriptor> {
        self.columns
            .get(&(entity.to_string(), path.to_string()))
            .cloned()
    }
}

/// Builder for [`StaticMetamodel`].
#[derive(Debug, Default)]
pub struct StaticMetamodelBuilder {
    inner: StaticMetamodel,
    current: Option<String>,
}

impl StaticMetamodelBuilder {
    /// Register an entity; subsequent mapping calls apply to it.
    pub fn entity(mut self, descriptor: EntityDescriptor) -> Self {
        self.current = Some(descriptor.name.clone());
        self.inner
            .entities
            .insert(descriptor.name.clone(), descriptor);
        self
    }

    /// Map an attribute path of the current entity to a column of its table.
    pub fn column(mut self, path: impl Into<String>, column: impl Into<String>) -> Self {
        if let Some(entity) = self.current.clone() {
            let table = self
                .inner
                .entities
                .get(&entity)
                .map(|e| e.table.clone())
                .unwrap_or_default();
            self.inner.columns.insert(
                (entity, path.into()),
                ColumnDescriptor::Column {
                    table,
                    column: column.into(),
                },
            );
        } else {
            tracing::warn!("Column mapped before any entity was registered");
        }
        self
    }

    /// Map an attribute path of the current entity to a collection table.
    pub fn collection(mut self, path: impl Into<String>, table: CollectionTable) -> Self {
        if let Some(entity) = self.current.clone() {
            self.inner.columns.insert(
                (entity, path.into()),
                ColumnDescriptor::CollectionTable(table),
            );
        } else {
            tracing::warn!("Collection mapped before any entity was registered");
        }
        self
    }

    /// Finish building.
    pub fn build(self) -> StaticMetamodel {
        tracing::debug!(
            entities = self.inner.entities.len(),
            mappings = self.inner.columns.len(),
            "Built static metamodel"
        );
        self.inner
    }
}
