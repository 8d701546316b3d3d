//! Flush planning.
//!
//! [`FlushPlanner`] turns the dirty state of a view tree into a
//! [`FlushPlan`]: one [`FlushUnit`] per entity row that needs writing, in
//! the order the units must run. Units for dirty associated views (to-one
//! targets and id'd plural elements) come before the unit of the view that
//! holds them.
//!
//! A unit lists the column writes for the entity row and one operation per
//! collection table. Writes whose necessity can only be decided against the
//! stored state are [`WriteMode::IfDiffers`]; collection operations that
//! need the stored rows are [`CollectionAction::Reconcile`]. The executor
//! reads the stored state for both before it writes anything.
//!
//! Created views get [`UnitKind::Insert`] units carrying every mapped
//! column. Owned views dropped from orphan-removal attributes become
//! [`RowDelete`]s of the unit that dropped them.

use crate::config::FlushConfig;
use crate::path::{AttributeMetadata, ViewMetamodel, join};
use crate::tracker::{
    ChangeKind, Dirt, DirtyStateTracker, attribute_dirt, collection_delta, map_delta, null_value,
    view_dirt,
};
use crate::value::AttributeValue;
use crate::view::ViewInstance;
use crate::view_type::{AttributeDecl, AttributeKind, CollectionKind, ViewType};
use entityview_core::{CollectionTable, Error, Result, Value};

/// One step from a root view down to a nested view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathStep {
    /// A singular attribute holding a view.
    Attribute(String),
    /// The element at `index` of a collection attribute.
    Element { attribute: String, index: usize },
    /// The key of the map entry at `index`.
    MapKey { attribute: String, index: usize },
    /// The element of the map entry at `index`.
    MapElement { attribute: String, index: usize },
}

/// When a column write is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    /// Always written.
    Direct,
    /// Written only when the stored value differs.
    IfDiffers,
}

/// A column of the entity row to write.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnWrite {
    /// Attribute path relative to the unit's view.
    pub path: String,
    pub column: String,
    pub value: Value,
    pub mode: WriteMode,
}

/// One row of a collection table, without the owner column.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRow {
    /// List index or map key, when the table has a key column in use.
    pub key: Option<Value>,
    /// Element column values in the table's element column order.
    pub elements: Vec<Value>,
}

impl CollectionRow {
    /// Equality that ignores integer width.
    pub fn same_as(&self, other: &CollectionRow) -> bool {
        let keys = match (&self.key, &other.key) {
            (Some(a), Some(b)) => a.same_as(b),
            (None, None) => true,
            _ => false,
        };
        keys && self.elements.len() == other.elements.len()
            && self
                .elements
                .iter()
                .zip(&other.elements)
                .all(|(a, b)| a.same_as(b))
    }
}

/// What to do with the rows of one collection table.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionAction {
    /// Delete every row of the owner, then insert `rows`.
    Replace { rows: Vec<CollectionRow> },
    /// Delete and insert individual rows.
    Delta {
        deletes: Vec<CollectionRow>,
        inserts: Vec<CollectionRow>,
    },
    /// Load the stored rows and write the difference to `desired`.
    Reconcile { desired: Vec<CollectionRow> },
}

/// Statements for one collection table.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionOp {
    /// Attribute path relative to the unit's view.
    pub path: String,
    pub table: CollectionTable,
    /// Key column carried by every row, when in use.
    pub key_column: Option<String>,
    /// Rows are addressed by owner and key alone (map entries).
    pub delete_by_key: bool,
    pub action: CollectionAction,
}

impl CollectionOp {
    /// Whether the operation cannot produce any statement.
    pub fn is_empty(&self) -> bool {
        match &self.action {
            CollectionAction::Delta { deletes, inserts } => deletes.is_empty() && inserts.is_empty(),
            CollectionAction::Replace { .. } | CollectionAction::Reconcile { .. } => false,
        }
    }

    /// Columns of an inserted row in value order.
    pub fn insert_columns(&self) -> Vec<&str> {
        let mut columns = vec![self.table.owner_column.as_str()];
        columns.extend(self.key_column.as_deref());
        columns.extend(self.table.element_columns.iter().map(|c| c.column.as_str()));
        columns
    }
}

/// Optimistic lock check on the entity row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheck {
    pub column: String,
    /// Version the view was loaded with.
    pub expected: i64,
}

/// How a unit writes its entity row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// UPDATE of a stored row.
    Update,
    /// INSERT of a created view's row. The version check holds the initial
    /// version and every write is direct.
    Insert,
}

/// An entity row to delete after the rows of its collection tables.
#[derive(Debug, Clone, PartialEq)]
pub struct RowDelete {
    pub view_type: String,
    pub entity: String,
    pub table: String,
    pub id_column: String,
    pub id: Value,
    pub version: Option<VersionCheck>,
    pub collection_tables: Vec<CollectionTable>,
}

/// Writes for one entity row and its collection tables.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushUnit {
    pub kind: UnitKind,
    pub view_type: String,
    pub entity: String,
    pub table: String,
    pub id_column: String,
    pub id: Value,
    pub version: Option<VersionCheck>,
    /// Where the unit's view sits below the root view.
    pub location: Vec<PathStep>,
    pub writes: Vec<ColumnWrite>,
    pub collections: Vec<CollectionOp>,
    /// Owned entity views dropped from orphan-removal attributes, deleted
    /// once the unit's own writes are done.
    pub orphans: Vec<RowDelete>,
}

impl FlushUnit {
    /// Whether the stored entity row must be read before writing.
    pub fn needs_row_read(&self) -> bool {
        self.kind == UnitKind::Update && self.writes.iter().any(|w| w.mode == WriteMode::IfDiffers)
    }

    pub fn is_insert(&self) -> bool {
        self.kind == UnitKind::Insert
    }
}

/// Ordered units of one flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushPlan {
    pub units: Vec<FlushUnit>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FlushUnit> {
        self.units.iter()
    }
}

/// Builds flush plans for view trees registered in a [`ViewMetamodel`].
#[derive(Debug, Clone, Copy)]
pub struct FlushPlanner<'a> {
    meta: &'a ViewMetamodel,
    config: FlushConfig,
}

impl<'a> FlushPlanner<'a> {
    pub fn new(meta: &'a ViewMetamodel, config: FlushConfig) -> Self {
        Self { meta, config }
    }

    /// Plan the flush of a loaded or created entity view and every dirty or
    /// created view it holds.
    #[tracing::instrument(level = "debug", skip(self, view), fields(view_type = %view.view_type().name()))]
    pub fn plan(&self, view: &ViewInstance) -> Result<FlushPlan> {
        let view_type = view.view_type();
        if view_type.is_embeddable() {
            return Err(Error::missing_id(view_type.name()));
        }
        if view.is_reference() {
            return Err(Error::not_loaded(view_type.name()));
        }
        let mut units = Vec::new();
        self.plan_view(view, Vec::new(), &mut units)?;
        tracing::debug!(units = units.len(), "Planned flush");
        Ok(FlushPlan { units })
    }

    /// Plan the deletion of an entity view's row, followed by the rows of
    /// every entity view it owns through orphan-removal attributes.
    ///
    /// Each delete clears the row's collection tables first. The first
    /// delete is the view's own.
    #[tracing::instrument(level = "debug", skip(self, view), fields(view_type = %view.view_type().name()))]
    pub fn plan_removal(&self, view: &ViewInstance) -> Result<Vec<RowDelete>> {
        let view_type = view.view_type();
        if view_type.is_embeddable() {
            return Err(Error::missing_id(view_type.name()));
        }
        let mut deletes = Vec::new();
        self.removal(view, &mut deletes)?;
        tracing::debug!(deletes = deletes.len(), "Planned removal");
        Ok(deletes)
    }

    fn removal(&self, view: &ViewInstance, deletes: &mut Vec<RowDelete>) -> Result<()> {
        let view_type = view.view_type();
        let entity = self.meta.entity(view_type)?;
        let id = view
            .id()
            .cloned()
            .ok_or_else(|| Error::missing_id(view_type.name()))?;
        let version = match (view_type.version(), &entity.version_column, view.version()) {
            (Some(_), Some(column), Some(expected)) => Some(VersionCheck {
                column: column.clone(),
                expected,
            }),
            _ => None,
        };
        let collection_tables = self
            .meta
            .attributes(view_type.name())?
            .iter()
            .filter_map(|m| m.column.as_ref()?.collection_table())
            .cloned()
            .collect();
        deletes.push(RowDelete {
            view_type: view_type.name().to_string(),
            entity: entity.name.clone(),
            table: entity.table.clone(),
            id_column: entity.id_column.clone(),
            id,
            version,
            collection_tables,
        });

        let mut owned = Vec::new();
        if let Some(values) = view.values() {
            owned_views(view_type, values, &mut owned);
        }
        for view in owned {
            self.removal(view, deletes)?;
        }
        Ok(())
    }

    /// Deletes for the owned views that orphan-removal attributes held at
    /// the last snapshot and no longer hold.
    fn orphans(
        &self,
        view_type: &ViewType,
        values: &[AttributeValue],
        tracker: &DirtyStateTracker,
    ) -> Result<Vec<RowDelete>> {
        let mut deletes = Vec::new();
        for (index, decl) in view_type.attributes().iter().enumerate() {
            if decl.owned_view_type().is_none() {
                continue;
            }
            let kept = owned_by(&values[index]);
            for dropped in owned_by(tracker.initial(index)) {
                if !kept.iter().any(|k| same_row(k, dropped)) {
                    tracing::debug!(
                        attribute = %decl.name(),
                        view_type = %dropped.view_type().name(),
                        "Removing orphan"
                    );
                    self.removal(dropped, &mut deletes)?;
                }
            }
        }
        Ok(deletes)
    }

    fn plan_view(
        &self,
        view: &ViewInstance,
        location: Vec<PathStep>,
        units: &mut Vec<FlushUnit>,
    ) -> Result<()> {
        let Some(values) = view.values() else {
            return Ok(());
        };
        let before = units.len();
        self.plan_nested(view.view_type(), values, &location, units)?;
        let cascaded = units.len() > before;
        if let Some(unit) = self.plan_unit(view, location, cascaded)? {
            units.push(unit);
        }
        Ok(())
    }

    /// Plan units for the dirty id'd views held by `values`.
    fn plan_nested(
        &self,
        view_type: &ViewType,
        values: &[AttributeValue],
        location: &[PathStep],
        units: &mut Vec<FlushUnit>,
    ) -> Result<()> {
        for (decl, value) in view_type.attributes().iter().zip(values) {
            let attribute = decl.name().to_string();
            match value {
                AttributeValue::View(_) => {
                    let step = PathStep::Attribute(attribute);
                    self.cascade(value, extend(location, step), units)?;
                }
                AttributeValue::Collection(collection) => {
                    for (index, element) in collection.iter().enumerate() {
                        let step = PathStep::Element {
                            attribute: attribute.clone(),
                            index,
                        };
                        self.cascade(element, extend(location, step), units)?;
                    }
                }
                AttributeValue::Map(map) => {
                    for (index, (key, element)) in map.iter().enumerate() {
                        let key_step = PathStep::MapKey {
                            attribute: attribute.clone(),
                            index,
                        };
                        self.cascade(key, extend(location, key_step), units)?;
                        let element_step = PathStep::MapElement {
                            attribute: attribute.clone(),
                            index,
                        };
                        self.cascade(element, extend(location, element_step), units)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn cascade(
        &self,
        value: &AttributeValue,
        location: Vec<PathStep>,
        units: &mut Vec<FlushUnit>,
    ) -> Result<()> {
        let Some(view) = value.as_view() else {
            return Ok(());
        };
        match view.values() {
            Some(values) if view.view_type().is_embeddable() => {
                self.plan_nested(view.view_type(), values, &location, units)
            }
            Some(_) if view.is_new() || view.is_dirty() => self.plan_view(view, location, units),
            _ => Ok(()),
        }
    }

    /// INSERT unit for a created view: every mapped column and every
    /// collection row.
    fn insert_unit(&self, view: &ViewInstance, location: Vec<PathStep>) -> Result<FlushUnit> {
        let view_type = view.view_type();
        let entity = self.meta.entity(view_type)?;
        let id = view
            .id()
            .cloned()
            .ok_or_else(|| Error::missing_id(view_type.name()))?;
        let version = match (view_type.version(), &entity.version_column) {
            (Some(_), Some(column)) => Some(VersionCheck {
                column: column.clone(),
                expected: view.version().unwrap_or(0),
            }),
            _ => None,
        };
        let mut builder = UnitBuilder {
            meta: self.meta,
            root: view_type.name(),
            config: self.config.for_view(view_type),
            writes: Vec::new(),
            collections: Vec::new(),
        };
        builder.inserted(view_type, Some(view), "")?;
        tracing::debug!(
            view_type = %view_type.name(),
            columns = builder.writes.len(),
            collections = builder.collections.len(),
            "Planned insert"
        );
        Ok(FlushUnit {
            kind: UnitKind::Insert,
            view_type: view_type.name().to_string(),
            entity: entity.name.clone(),
            table: entity.table.clone(),
            id_column: entity.id_column.clone(),
            id,
            version,
            location,
            writes: builder.writes,
            collections: builder.collections,
            orphans: Vec::new(),
        })
    }

    /// Unit for the row of `view` itself.
    ///
    /// A versioned view whose only changes went into `cascaded` units still
    /// gets a unit, so its version is incremented after theirs.
    fn plan_unit(
        &self,
        view: &ViewInstance,
        location: Vec<PathStep>,
        cascaded: bool,
    ) -> Result<Option<FlushUnit>> {
        if view.is_new() {
            return self.insert_unit(view, location).map(Some);
        }
        let view_type = view.view_type();
        let (Some(values), Some(tracker)) = (view.values(), view.tracker()) else {
            return Ok(None);
        };
        if !view_type.is_updatable() || !view_dirt(view).is_dirty() {
            return Ok(None);
        }
        let entity = self.meta.entity(view_type)?;
        let id = view
            .id()
            .cloned()
            .ok_or_else(|| Error::missing_id(view_type.name()))?;
        let version = match (view_type.version(), &entity.version_column) {
            (Some(_), Some(column)) => Some(VersionCheck {
                column: column.clone(),
                expected: view.version().unwrap_or(0),
            }),
            _ => None,
        };

        let config = self.config.for_view(view_type);
        let mut builder = UnitBuilder {
            meta: self.meta,
            root: view_type.name(),
            config,
            writes: Vec::new(),
            collections: Vec::new(),
        };
        if config.is_full() {
            builder.reload(view_type, Some(view), "", Reload::Diff)?;
        } else {
            builder.attributes(view_type, values, tracker, "")?;
        }
        let orphans = self.orphans(view_type, values, tracker)?;
        if builder.writes.is_empty() && builder.collections.is_empty() && orphans.is_empty() {
            if !(cascaded && version.is_some()) {
                tracing::debug!(view_type = %view_type.name(), "Only nested views changed, no row writes");
                return Ok(None);
            }
            tracing::debug!(view_type = %view_type.name(), "Only nested views changed, incrementing version");
        }

        tracing::debug!(
            view_type = %view_type.name(),
            writes = builder.writes.len(),
            collections = builder.collections.len(),
            "Planned unit"
        );
        Ok(Some(FlushUnit {
            kind: UnitKind::Update,
            view_type: view_type.name().to_string(),
            entity: entity.name.clone(),
            table: entity.table.clone(),
            id_column: entity.id_column.clone(),
            id,
            version,
            location,
            writes: builder.writes,
            collections: builder.collections,
            orphans,
        }))
    }
}

/// How [`UnitBuilder::reload`] writes a subtree it cannot plan precisely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reload {
    /// The subtree was replaced: write it all.
    Replace,
    /// Unknown what changed: diff everything against the stored state.
    Diff,
}

struct UnitBuilder<'p> {
    meta: &'p ViewMetamodel,
    root: &'p str,
    config: FlushConfig,
    writes: Vec<ColumnWrite>,
    collections: Vec<CollectionOp>,
}

impl<'p> UnitBuilder<'p> {
    /// Mode for a value known to be replaced.
    fn replace_mode(&self) -> WriteMode {
        if self.config.is_query() {
            WriteMode::Direct
        } else {
            WriteMode::IfDiffers
        }
    }

    /// Plan the dirty attributes of a view or embeddable at `prefix`.
    fn attributes(
        &mut self,
        view_type: &ViewType,
        values: &[AttributeValue],
        tracker: &DirtyStateTracker,
        prefix: &str,
    ) -> Result<()> {
        let meta = self.meta;
        for (index, decl) in view_type.attributes().iter().enumerate() {
            let initial = tracker.initial(index);
            let current = &values[index];
            let dirt = attribute_dirt(decl, initial, current, tracker.flags(index));
            if !dirt.is_dirty() {
                continue;
            }
            let path = join(prefix, decl.name());
            let metadata = meta.resolve(self.root, &path)?;
            if !metadata.updatable {
                tracing::trace!(path = %path, "Skipping non-updatable attribute");
                continue;
            }
            match decl.kind() {
                AttributeKind::Basic(_) => {
                    let mode = if dirt.provable {
                        self.replace_mode()
                    } else {
                        tracing::warn!(
                            path = %path,
                            "Unregistered mutable type changed in place, comparing with stored value"
                        );
                        WriteMode::IfDiffers
                    };
                    self.write(metadata, &path, current, mode)?;
                }
                AttributeKind::ToOne(_) => {
                    // In-place changes of the target run as their own unit.
                    if dirt.kind == ChangeKind::Updated {
                        self.write(metadata, &path, current, self.replace_mode())?;
                    }
                }
                AttributeKind::Embeddable(target) => {
                    let target_type = meta.view_type(target)?;
                    let nested = current.as_view();
                    if dirt.kind == ChangeKind::Updated {
                        self.reload(target_type, nested, &path, Reload::Replace)?;
                        continue;
                    }
                    match nested.and_then(|v| v.values().zip(v.tracker())) {
                        Some((nested_values, nested_tracker))
                            if self.targets_embeddable(target, dirt) =>
                        {
                            self.attributes(target_type, nested_values, nested_tracker, &path)?;
                        }
                        _ => {
                            tracing::debug!(
                                path = %path,
                                embeddable = %target,
                                "Cannot target embeddable columns, diffing all of them"
                            );
                            self.reload(target_type, nested, &path, Reload::Diff)?;
                        }
                    }
                }
                AttributeKind::Collection { kind, .. } => {
                    self.collection(decl, metadata, &path, *kind, initial, current, dirt)?;
                }
                AttributeKind::Map { .. } => {
                    self.map(decl, metadata, &path, initial, current, dirt)?;
                }
            }
        }
        Ok(())
    }

    /// Whether only the dirty leaves of an in-place changed embeddable need
    /// writing.
    fn targets_embeddable(&self, target: &str, dirt: Dirt) -> bool {
        dirt.provable
            && self.config.is_query()
            && self.config.capabilities.supports_update_set_embeddable
            && self.meta.is_known_embeddable(target)
    }

    /// Write every updatable column and collection under `prefix`.
    fn reload(
        &mut self,
        view_type: &ViewType,
        view: Option<&ViewInstance>,
        prefix: &str,
        how: Reload,
    ) -> Result<()> {
        let meta = self.meta;
        let values = view.and_then(ViewInstance::values);
        let leaf_mode = match how {
            Reload::Replace => self.replace_mode(),
            Reload::Diff => WriteMode::IfDiffers,
        };
        for (index, decl) in view_type.attributes().iter().enumerate() {
            let path = join(prefix, decl.name());
            let metadata = meta.resolve(self.root, &path)?;
            if !metadata.updatable {
                continue;
            }
            let current = values.map_or(null_value(), |v| &v[index]);
            match decl.kind() {
                AttributeKind::Basic(_) | AttributeKind::ToOne(_) => {
                    self.write(metadata, &path, current, leaf_mode)?;
                }
                AttributeKind::Embeddable(target) => {
                    self.reload(meta.view_type(target)?, current.as_view(), &path, how)?;
                }
                AttributeKind::Collection { .. } | AttributeKind::Map { .. } => {
                    let table = collection_table(metadata, self.root, &path)?;
                    let desired = desired_rows(decl, table, current);
                    let action = if how == Reload::Replace && self.config.is_query() {
                        CollectionAction::Replace { rows: desired }
                    } else {
                        CollectionAction::Reconcile { desired }
                    };
                    self.push_collection(decl, table, &path, action);
                }
            }
        }
        Ok(())
    }

    /// Write every mapped column and collection row under `prefix` of a
    /// view that has no stored row yet.
    fn inserted(
        &mut self,
        view_type: &ViewType,
        view: Option<&ViewInstance>,
        prefix: &str,
    ) -> Result<()> {
        let meta = self.meta;
        let values = view.and_then(ViewInstance::values);
        for (index, decl) in view_type.attributes().iter().enumerate() {
            let path = join(prefix, decl.name());
            let current = values.map_or(null_value(), |v| &v[index]);
            match decl.kind() {
                AttributeKind::Basic(_) | AttributeKind::ToOne(_) => {
                    let metadata = meta.resolve(self.root, &path)?;
                    self.write(metadata, &path, current, WriteMode::Direct)?;
                }
                AttributeKind::Embeddable(target) => {
                    self.inserted(meta.view_type(target)?, current.as_view(), &path)?;
                }
                AttributeKind::Collection { .. } | AttributeKind::Map { .. } => {
                    let metadata = meta.resolve(self.root, &path)?;
                    let table = collection_table(metadata, self.root, &path)?;
                    let inserts = desired_rows(decl, table, current);
                    let action = CollectionAction::Delta {
                        deletes: Vec::new(),
                        inserts,
                    };
                    self.push_collection(decl, table, &path, action);
                }
            }
        }
        Ok(())
    }

    fn write(
        &mut self,
        metadata: &AttributeMetadata,
        path: &str,
        value: &AttributeValue,
        mode: WriteMode,
    ) -> Result<()> {
        let column = metadata
            .column_name()
            .ok_or_else(|| Error::unmapped(self.root, path))?;
        self.writes.push(ColumnWrite {
            path: path.to_string(),
            column: column.to_string(),
            value: value.column_value().unwrap_or(Value::Null),
            mode,
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn collection(
        &mut self,
        decl: &AttributeDecl,
        metadata: &AttributeMetadata,
        path: &str,
        kind: CollectionKind,
        initial: &AttributeValue,
        current: &AttributeValue,
        dirt: Dirt,
    ) -> Result<()> {
        let table = collection_table(metadata, self.root, path)?;
        let user_type = decl.user_type().map(|t| t.as_ref());
        let delta = collection_delta(kind, initial.as_collection(), current.as_collection(), user_type);
        let indexed = is_indexed(kind, table);
        let duplicates = [initial, current]
            .iter()
            .filter_map(|v| v.as_collection())
            .any(|c| c.has_duplicates(user_type));
        let row = |element: &AttributeValue| element_row(table, None, element);
        let desired = || desired_rows(decl, table, current);

        let action = match dirt.kind {
            ChangeKind::Updated if !self.config.is_query() => {
                CollectionAction::Reconcile { desired: desired() }
            }
            ChangeKind::Updated if !indexed && !duplicates && has_registered_elements(decl) => {
                CollectionAction::Delta {
                    deletes: delta.removed.iter().copied().map(row).collect(),
                    inserts: delta.added.iter().copied().map(row).collect(),
                }
            }
            ChangeKind::Updated => CollectionAction::Replace { rows: desired() },
            _ if !delta.has_membership_changes() && dirt.provable => {
                tracing::trace!(path = %path, "Only element views changed in place");
                return Ok(());
            }
            _ if !self.config.is_query() || !dirt.provable => {
                CollectionAction::Reconcile { desired: desired() }
            }
            _ if indexed || duplicates => CollectionAction::Replace { rows: desired() },
            _ => CollectionAction::Delta {
                deletes: delta.removed.iter().copied().map(row).collect(),
                inserts: delta.added.iter().copied().map(row).collect(),
            },
        };
        tracing::debug!(path = %path, action = action_label(&action), "Planned collection");
        self.push_collection(decl, table, path, action);
        Ok(())
    }

    fn map(
        &mut self,
        decl: &AttributeDecl,
        metadata: &AttributeMetadata,
        path: &str,
        initial: &AttributeValue,
        current: &AttributeValue,
        dirt: Dirt,
    ) -> Result<()> {
        let table = collection_table(metadata, self.root, path)?;
        let delta = map_delta(
            initial.as_map(),
            current.as_map(),
            decl.key_user_type().map(|t| t.as_ref()),
            decl.user_type().map(|t| t.as_ref()),
        );
        let entry = |key: &AttributeValue, element: &AttributeValue| {
            element_row(table, Some(key.column_value().unwrap_or(Value::Null)), element)
        };
        let entry_delta = || CollectionAction::Delta {
            deletes: delta
                .removed
                .iter()
                .map(|&(k, e)| entry(k, e))
                .chain(delta.replaced.iter().map(|c| entry(c.key, c.initial)))
                .collect(),
            inserts: delta
                .added
                .iter()
                .map(|&(k, e)| entry(k, e))
                .chain(delta.replaced.iter().map(|c| entry(c.key, c.current)))
                .collect(),
        };
        let desired = || desired_rows(decl, table, current);

        let action = match dirt.kind {
            ChangeKind::Updated if !self.config.is_query() => {
                CollectionAction::Reconcile { desired: desired() }
            }
            ChangeKind::Updated if has_registered_elements(decl) => entry_delta(),
            ChangeKind::Updated => CollectionAction::Replace { rows: desired() },
            _ if !delta.has_membership_changes() && dirt.provable => {
                tracing::trace!(path = %path, "Only map key or element views changed in place");
                return Ok(());
            }
            _ if !self.config.is_query() || !dirt.provable => {
                CollectionAction::Reconcile { desired: desired() }
            }
            _ => entry_delta(),
        };
        tracing::debug!(path = %path, action = action_label(&action), "Planned map");
        self.push_collection(decl, table, path, action);
        Ok(())
    }

    fn push_collection(
        &mut self,
        decl: &AttributeDecl,
        table: &CollectionTable,
        path: &str,
        action: CollectionAction,
    ) {
        let keyed = matches!(decl.kind(), AttributeKind::Map { .. });
        let key_column = match decl.kind() {
            AttributeKind::Map { .. } => table.key_column.clone(),
            AttributeKind::Collection { kind, .. } if is_indexed(*kind, table) => {
                table.key_column.clone()
            }
            _ => None,
        };
        let op = CollectionOp {
            path: path.to_string(),
            table: table.clone(),
            delete_by_key: keyed && key_column.is_some(),
            key_column,
            action,
        };
        if !op.is_empty() {
            self.collections.push(op);
        }
    }
}

/// Entity views an attribute value holds as a to-one target, collection
/// elements or map elements.
fn owned_by(value: &AttributeValue) -> Vec<&ViewInstance> {
    fn entity_view(value: &AttributeValue) -> Option<&ViewInstance> {
        value.as_view().filter(|v| v.id().is_some())
    }
    match value {
        AttributeValue::View(_) => entity_view(value).into_iter().collect(),
        AttributeValue::Collection(collection) => collection.iter().filter_map(entity_view).collect(),
        AttributeValue::Map(map) => map.iter().filter_map(|(_, e)| entity_view(e)).collect(),
        _ => Vec::new(),
    }
}

/// Views held by the orphan-removal attributes of a view, looking through
/// embeddables.
fn owned_views<'v>(view_type: &ViewType, values: &'v [AttributeValue], out: &mut Vec<&'v ViewInstance>) {
    for (decl, value) in view_type.attributes().iter().zip(values) {
        if decl.owned_view_type().is_some() {
            out.extend(owned_by(value));
        } else if let (AttributeKind::Embeddable(_), Some(nested)) = (decl.kind(), value.as_view()) {
            if let Some(nested_values) = nested.values() {
                owned_views(nested.view_type(), nested_values, out);
            }
        }
    }
}

/// Whether two views denote the same entity row.
fn same_row(a: &ViewInstance, b: &ViewInstance) -> bool {
    a.view_type().entity() == b.view_type().entity()
        && a.id().zip(b.id()).is_some_and(|(x, y)| x.same_as(y))
}

fn extend(location: &[PathStep], step: PathStep) -> Vec<PathStep> {
    let mut next = location.to_vec();
    next.push(step);
    next
}

fn action_label(action: &CollectionAction) -> &'static str {
    match action {
        CollectionAction::Replace { .. } => "replace",
        CollectionAction::Delta { .. } => "delta",
        CollectionAction::Reconcile { .. } => "reconcile",
    }
}

fn collection_table<'m>(
    metadata: &'m AttributeMetadata,
    root: &str,
    path: &str,
) -> Result<&'m CollectionTable> {
    metadata
        .column
        .as_ref()
        .and_then(|c| c.collection_table())
        .ok_or_else(|| Error::unmapped(root, path))
}

/// Lists whose table has a key column store element positions.
fn is_indexed(kind: CollectionKind, table: &CollectionTable) -> bool {
    kind == CollectionKind::List && table.key_column.is_some()
}

/// Elements of a registered user type, whose add/remove delta is computable
/// without the stored rows.
fn has_registered_elements(decl: &AttributeDecl) -> bool {
    decl.kind()
        .element_type()
        .is_some_and(|e| e.user_type().is_some())
        && decl.user_type().is_some()
}

/// Rows a plural value should be stored as.
pub(crate) fn desired_rows(
    decl: &AttributeDecl,
    table: &CollectionTable,
    value: &AttributeValue,
) -> Vec<CollectionRow> {
    match (decl.kind(), value) {
        (AttributeKind::Collection { kind, .. }, AttributeValue::Collection(collection)) => {
            let indexed = is_indexed(*kind, table);
            collection
                .iter()
                .enumerate()
                .map(|(i, element)| {
                    let key = indexed.then(|| Value::BigInt(i64::try_from(i).unwrap_or(i64::MAX)));
                    element_row(table, key, element)
                })
                .collect()
        }
        (AttributeKind::Map { .. }, AttributeValue::Map(map)) => map
            .iter()
            .map(|(key, element)| {
                element_row(table, Some(key.column_value().unwrap_or(Value::Null)), element)
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn element_row(table: &CollectionTable, key: Option<Value>, element: &AttributeValue) -> CollectionRow {
    CollectionRow {
        key,
        elements: table
            .element_columns
            .iter()
            .map(|column| element_column_value(element, &column.path))
            .collect(),
    }
}

/// Value of one element column: the element itself (or its id) for an
/// empty leaf path, otherwise a leaf of an embeddable element.
fn element_column_value(element: &AttributeValue, path: &str) -> Value {
    if path.is_empty() {
        return element.column_value().unwrap_or(Value::Null);
    }
    element
        .as_view()
        .and_then(|view| view.get(path).ok())
        .and_then(AttributeValue::column_value)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlushMode, FlushStrategy};
    use crate::path::tests::{entities, metamodel};
    use crate::user_type::UserValue;
    use crate::user_type::tests::Counter;
    use crate::value::{PluralCollection, PluralMap};
    use crate::view_type::ElementType;
    use entityview_core::{Dialect, DialectCapabilities};
    use std::sync::Arc;

    fn person(meta: &ViewMetamodel, id: i64, name: &str) -> ViewInstance {
        ViewInstance::builder(Arc::clone(meta.view_type("PersonView").unwrap()))
            .id(id)
            .value("name", name)
            .build()
            .unwrap()
    }

    fn doc(meta: &ViewMetamodel) -> ViewInstance {
        let address = ViewInstance::builder(Arc::clone(meta.view_type("AddressView").unwrap()))
            .value("street", "Main")
            .value("city", "Vienna")
            .build()
            .unwrap();
        let counter: Box<dyn UserValue> = Box::new(Counter { hits: vec![1] });
        ViewInstance::builder(Arc::clone(meta.view_type("DocView").unwrap()))
            .id(1_i64)
            .version(3)
            .value("name", "a")
            .value("address", address)
            .value("counter", counter)
            .value("owner", person(meta, 7, "Ann"))
            .value(
                "tags",
                PluralCollection::from_elements(CollectionKind::Set, ["a", "b"]),
            )
            .value("contacts", PluralMap::from_entries([("mail", "a@x"), ("phone", "1")]))
            .build()
            .unwrap()
    }

    fn plan_with(meta: &ViewMetamodel, view: &ViewInstance, config: FlushConfig) -> FlushPlan {
        FlushPlanner::new(meta, config).plan(view).unwrap()
    }

    fn plan(meta: &ViewMetamodel, view: &ViewInstance) -> FlushPlan {
        plan_with(meta, view, FlushConfig::default())
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn test_clean_view_plans_nothing() {
        let meta = metamodel();
        let view = doc(&meta);
        assert!(plan(&meta, &view).is_empty());

        let full = FlushConfig::new(FlushMode::Full, FlushStrategy::Query, Dialect::Postgres.capabilities());
        assert!(plan_with(&meta, &view, full).is_empty());
    }

    #[test]
    fn test_replaced_basic_is_direct_write() {
        let meta = metamodel();
        let mut view = doc(&meta);
        view.set("name", "b").unwrap();

        let plan = plan(&meta, &view);
        assert_eq!(plan.len(), 1);
        let unit = &plan.units[0];
        assert_eq!(unit.table, "documents");
        assert_eq!(unit.id, Value::BigInt(1));
        assert_eq!(
            unit.version,
            Some(VersionCheck {
                column: "version".to_string(),
                expected: 3
            })
        );
        assert_eq!(unit.writes.len(), 1);
        assert_eq!(unit.writes[0].column, "name");
        assert_eq!(unit.writes[0].value, text("b"));
        assert_eq!(unit.writes[0].mode, WriteMode::Direct);
        assert!(unit.collections.is_empty());
        assert!(!unit.needs_row_read());
    }

    #[test]
    fn test_entity_strategy_compares_before_writing() {
        let meta = metamodel();
        let mut view = doc(&meta);
        view.set("name", "b").unwrap();
        let config = FlushConfig::new(FlushMode::Partial, FlushStrategy::Entity, Dialect::Postgres.capabilities());

        let unit = &plan_with(&meta, &view, config).units[0];
        assert_eq!(unit.writes[0].mode, WriteMode::IfDiffers);
        assert!(unit.needs_row_read());
    }

    #[test]
    fn test_added_tag_is_single_insert() {
        let meta = metamodel();
        let mut view = doc(&meta);
        view.collection_mut("tags").unwrap().add("c");

        let plan = plan(&meta, &view);
        let unit = &plan.units[0];
        assert!(unit.writes.is_empty());
        assert_eq!(unit.collections.len(), 1);
        let op = &unit.collections[0];
        assert_eq!(op.table.table, "document_tags");
        assert_eq!(
            op.action,
            CollectionAction::Delta {
                deletes: vec![],
                inserts: vec![CollectionRow {
                    key: None,
                    elements: vec![text("c")]
                }],
            }
        );
        assert_eq!(op.insert_columns(), vec!["document_id", "tag"]);
    }

    #[test]
    fn test_replaced_collection_is_replace() {
        let meta = metamodel();
        let mut view = doc(&meta);
        view.set(
            "tags",
            PluralCollection::from_elements(CollectionKind::Set, ["a", "x"]),
        )
        .unwrap();

        let op = &plan(&meta, &view).units[0].collections[0];
        assert_eq!(
            op.action,
            CollectionAction::Replace {
                rows: vec![
                    CollectionRow {
                        key: None,
                        elements: vec![text("a")]
                    },
                    CollectionRow {
                        key: None,
                        elements: vec![text("x")]
                    },
                ]
            }
        );
    }

    #[test]
    fn test_embeddable_leaf_targeted_when_supported() {
        let meta = metamodel();
        let mut view = doc(&meta);
        view.set("address.city", "Graz").unwrap();

        let unit = &plan(&meta, &view).units[0];
        assert_eq!(unit.writes.len(), 1);
        assert_eq!(unit.writes[0].column, "city");
        assert_eq!(unit.writes[0].mode, WriteMode::Direct);
    }

    #[test]
    fn test_embeddable_falls_back_without_capability() {
        let meta = metamodel();
        let mut view = doc(&meta);
        view.set("address.city", "Graz").unwrap();
        let config = FlushConfig::new(
            FlushMode::Partial,
            FlushStrategy::Query,
            DialectCapabilities {
                supports_update_set_embeddable: false,
                supports_multi_row_insert: true,
            },
        );

        let unit = &plan_with(&meta, &view, config).units[0];
        let columns: Vec<&str> = unit.writes.iter().map(|w| w.column.as_str()).collect();
        assert_eq!(columns, vec!["street", "city"]);
        assert!(unit.writes.iter().all(|w| w.mode == WriteMode::IfDiffers));
    }

    #[test]
    fn test_replaced_embeddable_writes_all_leaves() {
        let meta = metamodel();
        let mut view = doc(&meta);
        let address = ViewInstance::builder(Arc::clone(meta.view_type("AddressView").unwrap()))
            .value("street", "Ring")
            .value("city", "Vienna")
            .build()
            .unwrap();
        view.set("address", address).unwrap();

        let unit = &plan(&meta, &view).units[0];
        assert_eq!(unit.writes.len(), 2);
        assert!(unit.writes.iter().all(|w| w.mode == WriteMode::Direct));
        assert_eq!(unit.writes[0].value, text("Ring"));
    }

    #[test]
    fn test_map_replaced_entry_deletes_by_key() {
        let meta = metamodel();
        let mut view = doc(&meta);
        view.map_mut("contacts").unwrap().put("mail", "b@x");

        let op = &plan(&meta, &view).units[0].collections[0];
        assert!(op.delete_by_key);
        assert_eq!(op.key_column.as_deref(), Some("kind"));
        assert_eq!(
            op.action,
            CollectionAction::Delta {
                deletes: vec![CollectionRow {
                    key: Some(text("mail")),
                    elements: vec![text("a@x")]
                }],
                inserts: vec![CollectionRow {
                    key: Some(text("mail")),
                    elements: vec![text("b@x")]
                }],
            }
        );
        assert_eq!(op.insert_columns(), vec!["document_id", "kind", "contact"]);
    }

    #[test]
    fn test_mutated_to_one_target_is_its_own_unit() {
        let meta = metamodel();
        let mut view = doc(&meta);
        view.view_mut("owner").unwrap().set("name", "Bea").unwrap();

        let plan = plan(&meta, &view);
        assert_eq!(plan.len(), 2);
        let unit = &plan.units[0];
        assert_eq!(unit.table, "people");
        assert_eq!(unit.id, Value::BigInt(7));
        assert_eq!(unit.location, vec![PathStep::Attribute("owner".to_string())]);
        assert_eq!(unit.writes[0].column, "full_name");
        assert!(unit.version.is_none());

        let root = &plan.units[1];
        assert_eq!(root.table, "documents");
        assert!(root.location.is_empty());
        assert!(root.writes.is_empty());
        assert!(root.collections.is_empty());
        assert_eq!(root.version.as_ref().map(|v| v.expected), Some(3));
    }

    #[test]
    fn test_unversioned_owner_of_mutated_view_plans_no_unit() {
        let meta = metamodel();
        let mut ann = ViewInstance::builder(Arc::clone(meta.view_type("PersonView").unwrap()))
            .id(7_i64)
            .value("name", "Ann")
            .value("friend", person(&meta, 8, "Carl"))
            .build()
            .unwrap();
        ann.view_mut("friend").unwrap().set("name", "Cyd").unwrap();

        let plan = plan(&meta, &ann);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.units[0].id, Value::BigInt(8));
    }

    #[test]
    fn test_cascaded_unit_runs_before_owner() {
        let meta = metamodel();
        let mut view = doc(&meta);
        view.view_mut("owner").unwrap().set("name", "Bea").unwrap();
        view.set("name", "b").unwrap();

        let tables: Vec<String> = plan(&meta, &view).iter().map(|u| u.table.clone()).collect();
        assert_eq!(tables, vec!["people".to_string(), "documents".to_string()]);
    }

    #[test]
    fn test_replaced_to_one_writes_foreign_key() {
        let meta = metamodel();
        let mut view = doc(&meta);
        view.set("owner", person(&meta, 8, "Carl")).unwrap();

        let plan = plan(&meta, &view);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.units[0].writes[0].column, "owner_id");
        assert_eq!(plan.units[0].writes[0].value, Value::BigInt(8));
    }

    #[test]
    fn test_full_mode_diffs_every_updatable_attribute() {
        let meta = metamodel();
        let mut view = doc(&meta);
        view.set("name", "b").unwrap();
        let config = FlushConfig::new(FlushMode::Full, FlushStrategy::Query, Dialect::Postgres.capabilities());

        let unit = &plan_with(&meta, &view, config).units[0];
        let columns: Vec<&str> = unit.writes.iter().map(|w| w.column.as_str()).collect();
        assert_eq!(columns, vec!["name", "street", "city", "counter", "owner_id"]);
        assert!(unit.writes.iter().all(|w| w.mode == WriteMode::IfDiffers));
        assert_eq!(unit.collections.len(), 2);
        assert!(
            unit.collections
                .iter()
                .all(|op| matches!(op.action, CollectionAction::Reconcile { .. }))
        );
    }

    #[test]
    fn test_unregistered_user_type_is_compared() {
        let meta = ViewMetamodel::builder()
            .register(crate::path::tests::address())
            .register(crate::path::tests::person())
            .register(crate::path::tests::document())
            .build(entities())
            .unwrap();
        let mut view = doc(&meta);
        view.user_value_mut::<Counter>("counter").unwrap().hits.push(2);

        let unit = &plan(&meta, &view).units[0];
        assert_eq!(unit.writes.len(), 1);
        assert_eq!(unit.writes[0].column, "counter");
        assert_eq!(unit.writes[0].value, text("1,2"));
        assert_eq!(unit.writes[0].mode, WriteMode::IfDiffers);
    }

    #[test]
    fn test_registered_user_type_touched_without_change_is_clean() {
        let meta = metamodel();
        let mut view = doc(&meta);
        let _ = view.user_value_mut::<Counter>("counter").unwrap();
        assert!(plan(&meta, &view).is_empty());
    }

    #[test]
    fn test_indexed_list_is_replaced() {
        let entities = Arc::new(
            entityview_core::StaticMetamodel::builder()
                .entity(entityview_core::EntityDescriptor::new("Playlist", "playlists", "id"))
                .collection(
                    "songs",
                    CollectionTable::new("playlist_songs", "playlist_id")
                        .key_column("position")
                        .element_column("song"),
                )
                .build(),
        );
        let meta = ViewMetamodel::builder()
            .register(
                ViewType::builder("PlaylistView")
                    .entity("Playlist")
                    .id("id")
                    .list("songs", ElementType::basic())
                    .build(),
            )
            .build(entities)
            .unwrap();
        let mut view = ViewInstance::builder(Arc::clone(meta.view_type("PlaylistView").unwrap()))
            .id(5_i64)
            .value(
                "songs",
                PluralCollection::from_elements(CollectionKind::List, ["x", "y"]),
            )
            .build()
            .unwrap();
        view.collection_mut("songs").unwrap().add("z");

        let op = &plan(&meta, &view).units[0].collections[0];
        assert_eq!(op.key_column.as_deref(), Some("position"));
        assert!(!op.delete_by_key);
        let CollectionAction::Replace { rows } = &op.action else {
            panic!("expected replace, got {:?}", op.action);
        };
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].key, Some(Value::BigInt(2)));
        assert_eq!(rows[2].elements, vec![text("z")]);
    }

    fn board_meta(registered: bool) -> ViewMetamodel {
        let entities = Arc::new(
            entityview_core::StaticMetamodel::builder()
                .entity(entityview_core::EntityDescriptor::new("Board", "boards", "id"))
                .collection(
                    "tallies",
                    CollectionTable::new("board_tallies", "board_id").element_column("tally"),
                )
                .collection(
                    "scores",
                    CollectionTable::new("board_scores", "board_id")
                        .key_column("player")
                        .element_column("score"),
                )
                .build(),
        );
        let mut builder = ViewMetamodel::builder();
        if registered {
            builder = builder.user_type(crate::user_type::CloneEqType::<Counter>::new("counter"));
        }
        builder
            .register(
                ViewType::builder("BoardView")
                    .entity("Board")
                    .id("id")
                    .set("tallies", ElementType::user("counter"))
                    .map("scores", ElementType::basic(), ElementType::user("counter"))
                    .build(),
            )
            .build(entities)
            .unwrap()
    }

    fn counter(hits: &[i64]) -> AttributeValue {
        let value: Box<dyn UserValue> = Box::new(Counter {
            hits: hits.to_vec(),
        });
        AttributeValue::from(value)
    }

    fn board(meta: &ViewMetamodel) -> ViewInstance {
        let mut scores = PluralMap::new();
        scores.put("ann", counter(&[1]));
        ViewInstance::builder(Arc::clone(meta.view_type("BoardView").unwrap()))
            .id(4_i64)
            .value(
                "tallies",
                PluralCollection::from_elements(CollectionKind::Set, [counter(&[1])]),
            )
            .value("scores", scores)
            .build()
            .unwrap()
    }

    fn bump(value: &mut AttributeValue, hit: i64) {
        if let AttributeValue::User(user) = value {
            if let Some(counter) = user.as_any_mut().downcast_mut::<Counter>() {
                counter.hits.push(hit);
            }
        }
    }

    fn row(element: &str) -> CollectionRow {
        CollectionRow {
            key: None,
            elements: vec![text(element)],
        }
    }

    fn entry(key: &str, element: &str) -> CollectionRow {
        CollectionRow {
            key: Some(text(key)),
            elements: vec![text(element)],
        }
    }

    #[test]
    fn test_registered_element_type_added_in_place_is_delta() {
        let meta = board_meta(true);
        let mut view = board(&meta);
        let tallies = view.collection_mut("tallies").unwrap();
        assert!(!tallies.add(counter(&[1])));
        assert!(tallies.add(counter(&[2])));

        let op = &plan(&meta, &view).units[0].collections[0];
        assert_eq!(
            op.action,
            CollectionAction::Delta {
                deletes: vec![],
                inserts: vec![row("2")],
            }
        );
    }

    #[test]
    fn test_registered_element_type_mutated_in_place_swaps_the_row() {
        let meta = board_meta(true);
        let mut view = board(&meta);
        let tallies = view.collection_mut("tallies").unwrap();
        bump(tallies.get_mut(0).unwrap(), 2);

        let op = &plan(&meta, &view).units[0].collections[0];
        assert_eq!(
            op.action,
            CollectionAction::Delta {
                deletes: vec![row("1")],
                inserts: vec![row("1,2")],
            }
        );
    }

    #[test]
    fn test_registered_element_type_replaced_is_minimal_delta() {
        let meta = board_meta(true);
        let mut view = board(&meta);
        view.set(
            "tallies",
            PluralCollection::from_elements(CollectionKind::Set, [counter(&[1]), counter(&[5])]),
        )
        .unwrap();
        assert_eq!(
            view.kind("tallies").unwrap(),
            ChangeKind::Updated
        );

        let op = &plan(&meta, &view).units[0].collections[0];
        assert_eq!(
            op.action,
            CollectionAction::Delta {
                deletes: vec![],
                inserts: vec![row("5")],
            }
        );

        view.set(
            "tallies",
            PluralCollection::from_elements(CollectionKind::Set, [counter(&[1])]),
        )
        .unwrap();
        assert!(plan(&meta, &view).is_empty());
    }

    #[test]
    fn test_unregistered_element_type_touched_is_reconciled() {
        let meta = board_meta(false);
        let mut view = board(&meta);
        let tallies = view.collection_mut("tallies").unwrap();
        bump(tallies.get_mut(0).unwrap(), 2);

        let op = &plan(&meta, &view).units[0].collections[0];
        assert_eq!(
            op.action,
            CollectionAction::Reconcile {
                desired: vec![row("1,2")],
            }
        );

        let mut view = board(&meta);
        let _ = view.collection_mut("tallies").unwrap();
        let op = &plan(&meta, &view).units[0].collections[0];
        assert_eq!(
            op.action,
            CollectionAction::Reconcile {
                desired: vec![row("1")],
            }
        );
    }

    #[test]
    fn test_unregistered_element_type_replaced_is_replace() {
        let meta = board_meta(false);
        let mut view = board(&meta);
        view.set(
            "tallies",
            PluralCollection::from_elements(CollectionKind::Set, [counter(&[1]), counter(&[5])]),
        )
        .unwrap();

        let op = &plan(&meta, &view).units[0].collections[0];
        assert_eq!(
            op.action,
            CollectionAction::Replace {
                rows: vec![row("1"), row("5")],
            }
        );
    }

    #[test]
    fn test_registered_map_element_mutated_in_place_is_entry_delta() {
        let meta = board_meta(true);
        let mut view = board(&meta);
        let scores = view.map_mut("scores").unwrap();
        bump(scores.get_mut(&"ann".into()).unwrap(), 3);
        scores.put("bob", counter(&[7]));

        let op = &plan(&meta, &view).units[0].collections[0];
        assert_eq!(op.table.table, "board_scores");
        assert_eq!(
            op.action,
            CollectionAction::Delta {
                deletes: vec![entry("ann", "1")],
                inserts: vec![entry("bob", "7"), entry("ann", "1,3")],
            }
        );
    }

    #[test]
    fn test_map_element_type_replaced() {
        let registered = board_meta(true);
        let mut view = board(&registered);
        view.set("scores", PluralMap::from_entries([("ann", counter(&[1]))]))
            .unwrap();
        assert!(plan(&registered, &view).is_empty());

        let unregistered = board_meta(false);
        let mut view = board(&unregistered);
        view.set("scores", PluralMap::from_entries([("ann", counter(&[1]))]))
            .unwrap();
        let op = &plan(&unregistered, &view).units[0].collections[0];
        assert_eq!(
            op.action,
            CollectionAction::Replace {
                rows: vec![entry("ann", "1")],
            }
        );

        let mut view = board(&unregistered);
        let _ = view.map_mut("scores").unwrap();
        let op = &plan(&unregistered, &view).units[0].collections[0];
        assert!(matches!(op.action, CollectionAction::Reconcile { .. }));
    }

    fn team_meta() -> ViewMetamodel {
        let entities = Arc::new(
            entityview_core::StaticMetamodel::builder()
                .entity(
                    entityview_core::EntityDescriptor::new("Team", "teams", "id")
                        .versioned("version"),
                )
                .column("name", "name")
                .column("captain", "captain_id")
                .collection(
                    "members",
                    CollectionTable::new("team_members", "team_id").element_column("member_id"),
                )
                .entity(entityview_core::EntityDescriptor::new("Person", "people", "id"))
                .column("name", "full_name")
                .column("friend", "friend_id")
                .build(),
        );
        ViewMetamodel::builder()
            .register(
                ViewType::builder("PersonView")
                    .entity("Person")
                    .id("id")
                    .creatable()
                    .basic("name")
                    .to_one("friend", "PersonView")
                    .build(),
            )
            .register(
                ViewType::builder("TeamView")
                    .entity("Team")
                    .id("id")
                    .version("version")
                    .creatable()
                    .basic("name")
                    .attribute(AttributeDecl::to_one("captain", "PersonView").orphan_removal())
                    .attribute(
                        AttributeDecl::collection(
                            "members",
                            ElementType::view("PersonView"),
                            CollectionKind::Set,
                        )
                        .orphan_removal(),
                    )
                    .build(),
            )
            .build(entities)
            .unwrap()
    }

    fn team(meta: &ViewMetamodel) -> ViewInstance {
        ViewInstance::builder(Arc::clone(meta.view_type("TeamView").unwrap()))
            .id(10_i64)
            .version(2)
            .value("name", "Red")
            .value("captain", person(meta, 7, "Ann"))
            .value(
                "members",
                PluralCollection::from_elements(CollectionKind::Set, [person(meta, 8, "Bo")]),
            )
            .build()
            .unwrap()
    }

    fn created(meta: &ViewMetamodel, view_type: &str, id: i64) -> ViewInstance {
        ViewInstance::create(Arc::clone(meta.view_type(view_type).unwrap()), id).unwrap()
    }

    fn member(id: i64) -> CollectionRow {
        CollectionRow {
            key: None,
            elements: vec![Value::BigInt(id)],
        }
    }

    fn person_delete(id: i64) -> RowDelete {
        RowDelete {
            view_type: "PersonView".to_string(),
            entity: "Person".to_string(),
            table: "people".to_string(),
            id_column: "id".to_string(),
            id: Value::BigInt(id),
            version: None,
            collection_tables: Vec::new(),
        }
    }

    #[test]
    fn test_created_view_plans_an_insert_of_every_column() {
        let meta = team_meta();
        let untouched = created(&meta, "TeamView", 10);
        assert_eq!(plan(&meta, &untouched).len(), 1);

        let mut team = created(&meta, "TeamView", 10);
        team.set("name", "Red").unwrap();
        let plan = plan(&meta, &team);
        assert_eq!(plan.len(), 1);
        let unit = &plan.units[0];
        assert!(unit.is_insert());
        assert_eq!(unit.table, "teams");
        assert_eq!(unit.id, Value::BigInt(10));
        assert_eq!(
            unit.version,
            Some(VersionCheck {
                column: "version".to_string(),
                expected: 0
            })
        );
        let columns: Vec<(&str, Value)> = unit
            .writes
            .iter()
            .map(|w| (w.column.as_str(), w.value.clone()))
            .collect();
        assert_eq!(columns, vec![("name", text("Red")), ("captain_id", Value::Null)]);
        assert!(unit.writes.iter().all(|w| w.mode == WriteMode::Direct));
        assert!(unit.collections.is_empty());
        assert!(unit.orphans.is_empty());
        assert!(!unit.needs_row_read());
    }

    #[test]
    fn test_created_elements_are_inserted_before_their_owner() {
        let meta = team_meta();
        let mut zed = created(&meta, "PersonView", 20);
        zed.set("name", "Zed").unwrap();
        let mut team = created(&meta, "TeamView", 10);
        team.set("captain", person(&meta, 7, "Ann")).unwrap();
        team.collection_mut("members").unwrap().add(zed);

        let plan = plan(&meta, &team);
        assert_eq!(plan.len(), 2);
        let person_unit = &plan.units[0];
        assert!(person_unit.is_insert());
        assert_eq!(person_unit.table, "people");
        assert_eq!(person_unit.version, None);
        assert_eq!(
            person_unit.location,
            vec![PathStep::Element {
                attribute: "members".to_string(),
                index: 0
            }]
        );
        assert_eq!(person_unit.writes[0].column, "full_name");
        assert_eq!(person_unit.writes[0].value, text("Zed"));

        let team_unit = &plan.units[1];
        assert!(team_unit.is_insert());
        assert_eq!(team_unit.writes[1].column, "captain_id");
        assert_eq!(team_unit.writes[1].value, Value::BigInt(7));
        assert_eq!(
            team_unit.collections[0].action,
            CollectionAction::Delta {
                deletes: Vec::new(),
                inserts: vec![member(20)]
            }
        );
    }

    #[test]
    fn test_created_element_of_loaded_owner_is_inserted_first() {
        let meta = team_meta();
        let mut team = team(&meta);
        team.collection_mut("members")
            .unwrap()
            .add(created(&meta, "PersonView", 20));

        let plan = plan(&meta, &team);
        assert_eq!(plan.len(), 2);
        assert!(plan.units[0].is_insert());
        assert_eq!(plan.units[0].id, Value::BigInt(20));
        let team_unit = &plan.units[1];
        assert_eq!(team_unit.kind, UnitKind::Update);
        assert_eq!(team_unit.version.as_ref().map(|v| v.expected), Some(2));
        assert_eq!(
            team_unit.collections[0].action,
            CollectionAction::Delta {
                deletes: Vec::new(),
                inserts: vec![member(20)]
            }
        );
        assert!(team_unit.orphans.is_empty());
    }

    #[test]
    fn test_dropped_owned_element_is_deleted_as_orphan() {
        let meta = team_meta();
        let mut team = team(&meta);
        team.collection_mut("members")
            .unwrap()
            .remove_where(|e| e.as_view().and_then(ViewInstance::id) == Some(&Value::BigInt(8)));

        let plan = plan(&meta, &team);
        assert_eq!(plan.len(), 1);
        let unit = &plan.units[0];
        assert_eq!(
            unit.collections[0].action,
            CollectionAction::Delta {
                deletes: vec![member(8)],
                inserts: Vec::new()
            }
        );
        assert_eq!(unit.orphans, vec![person_delete(8)]);
    }

    #[test]
    fn test_replaced_owned_to_one_orphans_the_old_target() {
        let meta = team_meta();
        let mut team = team(&meta);
        team.set("captain", person(&meta, 9, "Cy")).unwrap();

        let plan = plan(&meta, &team);
        let unit = &plan.units[0];
        assert_eq!(unit.writes[0].column, "captain_id");
        assert_eq!(unit.writes[0].value, Value::BigInt(9));
        assert_eq!(unit.orphans, vec![person_delete(7)]);
    }

    #[test]
    fn test_replaced_collection_keeping_its_elements_orphans_nothing() {
        let meta = team_meta();
        let mut team = team(&meta);
        team.set(
            "members",
            PluralCollection::from_elements(CollectionKind::Set, [person(&meta, 8, "Bo")]),
        )
        .unwrap();

        let plan = plan(&meta, &team);
        assert_eq!(plan.len(), 1);
        assert!(plan.units[0].orphans.is_empty());
    }

    #[test]
    fn test_removal_cascades_to_owned_views() {
        let meta = team_meta();
        let team = team(&meta);
        let deletes = FlushPlanner::new(&meta, FlushConfig::default())
            .plan_removal(&team)
            .unwrap();

        assert_eq!(deletes.len(), 3);
        assert_eq!(deletes[0].table, "teams");
        assert_eq!(
            deletes[0].version,
            Some(VersionCheck {
                column: "version".to_string(),
                expected: 2
            })
        );
        assert_eq!(deletes[0].collection_tables.len(), 1);
        assert_eq!(deletes[0].collection_tables[0].table, "team_members");
        assert_eq!(deletes[1..].to_vec(), vec![person_delete(7), person_delete(8)]);

        let team_type = Arc::clone(meta.view_type("TeamView").unwrap());
        let reference = ViewInstance::reference(team_type, 10_i64);
        let deletes = FlushPlanner::new(&meta, FlushConfig::default())
            .plan_removal(&reference)
            .unwrap();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].version, None);
    }

    #[test]
    fn test_reference_and_embeddable_roots_are_rejected() {
        let meta = metamodel();
        let reference = ViewInstance::reference(Arc::clone(meta.view_type("DocView").unwrap()), 1_i64);
        let planner = FlushPlanner::new(&meta, FlushConfig::default());
        assert!(planner.plan(&reference).is_err());

        let address = ViewInstance::builder(Arc::clone(meta.view_type("AddressView").unwrap()))
            .build()
            .unwrap();
        assert!(planner.plan(&address).is_err());
    }

    #[test]
    fn test_row_equality_ignores_integer_width() {
        let a = CollectionRow {
            key: Some(Value::Int(1)),
            elements: vec![Value::BigInt(4)],
        };
        let b = CollectionRow {
            key: Some(Value::BigInt(1)),
            elements: vec![Value::Int(4)],
        };
        assert!(a.same_as(&b));
        assert!(!a.same_as(&CollectionRow {
            key: None,
            elements: vec![Value::Int(4)]
        }));
    }
}
