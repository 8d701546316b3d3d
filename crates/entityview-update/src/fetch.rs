//! Materializing views from stored rows.
//!
//! [`ViewFetcher`] loads an entity view with one SELECT for the entity row
//! and one per collection table. Associated entity views (to-one targets and
//! id'd elements or keys) come back as references holding only their id and
//! can be fetched on their own. A fetched view is clean: its tracker
//! snapshots the loaded state.

use crate::path::{ViewMetamodel, join};
use crate::user_type::BasicUserType;
use crate::value::{AttributeValue, PluralCollection, PluralMap};
use crate::view::ViewInstance;
use crate::view_type::{AttributeKind, BasicType, CollectionKind, ElementType, ViewType};
use asupersync::{Cx, Outcome};
use entityview_core::{
    CollectionTable, ColumnDescriptor, Connection, Error, Result, Row, StatementBuilder,
    TypeError, Value, ViewErrorKind,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Collection table rows keyed by attribute path.
type PluralRows = HashMap<String, Vec<Row>>;

/// Loads view instances through a [`StatementBuilder`] and a [`Connection`].
#[derive(Debug, Clone, Copy)]
pub struct ViewFetcher<'a> {
    meta: &'a ViewMetamodel,
    statements: &'a dyn StatementBuilder,
}

impl<'a> ViewFetcher<'a> {
    pub fn new(meta: &'a ViewMetamodel, statements: &'a dyn StatementBuilder) -> Self {
        Self { meta, statements }
    }

    /// Load the view of the given type for an id, or `None` when no entity
    /// row exists.
    #[tracing::instrument(level = "debug", skip(self, cx, conn, id), fields(id = %id))]
    pub async fn find<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        view_type: &str,
        id: &Value,
    ) -> Outcome<Option<ViewInstance>, Error> {
        let view_type = match self.meta.view_type(view_type) {
            Ok(v) => Arc::clone(v),
            Err(e) => return Outcome::Err(e),
        };
        let entity = match self.meta.entity(&view_type) {
            Ok(entity) => entity,
            Err(e) => return Outcome::Err(e),
        };
        let attributes = match self.meta.attributes(view_type.name()) {
            Ok(attributes) => attributes,
            Err(e) => return Outcome::Err(e),
        };

        let mut columns: Vec<&str> = Vec::new();
        for column in attributes
            .iter()
            .filter(|m| !m.is_plural())
            .filter_map(|m| m.column_name())
        {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        let filter = [(entity.id_column.as_str(), id.clone())];
        let statement = self.statements.select(&entity.table, &columns, &filter);
        tracing::trace!(sql = %statement.sql, "Fetching entity row");
        let rows = match conn.query(cx, &statement.sql, &statement.params).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let Some(row) = rows.into_iter().next() else {
            tracing::debug!(view_type = %view_type.name(), "No entity row");
            return Outcome::Ok(None);
        };

        let mut plurals = PluralRows::new();
        for metadata in attributes.iter().filter(|m| m.is_plural()) {
            let Some(table) = metadata
                .column
                .as_ref()
                .and_then(ColumnDescriptor::collection_table)
            else {
                continue;
            };
            let mut columns: Vec<&str> = Vec::new();
            columns.extend(table.key_column.as_deref());
            columns.extend(table.element_columns.iter().map(|c| c.column.as_str()));
            let filter = [(table.owner_column.as_str(), id.clone())];
            let statement = self.statements.select(&table.table, &columns, &filter);
            tracing::trace!(sql = %statement.sql, path = %metadata.path, "Fetching collection rows");
            match conn.query(cx, &statement.sql, &statement.params).await {
                Outcome::Ok(rows) => {
                    plurals.insert(metadata.path.clone(), rows);
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let root = view_type.name();
        let source = |path: &str| {
            self.meta
                .resolve(root, path)
                .ok()
                .and_then(|m| m.column_name())
                .and_then(|c| row.get_by_name(c))
                .cloned()
                .unwrap_or(Value::Null)
        };
        let values = match self.materialize(root, &view_type, "", &source, &plurals) {
            Ok(values) => values,
            Err(e) => return Outcome::Err(e),
        };
        let loaded_id = row
            .get_by_name(&entity.id_column)
            .cloned()
            .unwrap_or_else(|| id.clone());
        let version = match (view_type.version(), &entity.version_column) {
            (Some(_), Some(column)) => row.get_by_name(column).and_then(Value::as_i64),
            _ => None,
        };

        tracing::debug!(view_type = %root, collections = plurals.len(), "Fetched view");
        Outcome::Ok(Some(ViewInstance::loaded(
            Arc::clone(&view_type),
            Some(loaded_id),
            version,
            values,
        )))
    }

    /// Load the full view behind a reference (or reload a loaded view).
    pub async fn fetch<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        view: &ViewInstance,
    ) -> Outcome<ViewInstance, Error> {
        let name = view.view_type().name();
        let Some(id) = view.id() else {
            return Outcome::Err(Error::missing_id(name));
        };
        match self.find(cx, conn, name, id).await {
            Outcome::Ok(Some(view)) => Outcome::Ok(view),
            Outcome::Ok(None) => Outcome::Err(Error::view(
                ViewErrorKind::NotFound,
                format!("no '{name}' with id {id}"),
            )),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Attribute values of `view_type` in declaration order. `source` maps
    /// a column-backed path (relative to the root) to its stored value.
    fn materialize(
        &self,
        root: &str,
        view_type: &ViewType,
        prefix: &str,
        source: &dyn Fn(&str) -> Value,
        plurals: &PluralRows,
    ) -> Result<Vec<AttributeValue>> {
        let mut values = Vec::with_capacity(view_type.attributes().len());
        for decl in view_type.attributes() {
            let path = join(prefix, decl.name());
            let value = match decl.kind() {
                AttributeKind::Basic(BasicType::Immutable) => basic(source(&path)),
                AttributeKind::Basic(BasicType::User(name)) => {
                    decode_user(decl.user_type(), name, source(&path), &path)?
                }
                AttributeKind::ToOne(target) => self.reference(target, source(&path))?,
                AttributeKind::Embeddable(target) => {
                    let target_type = self.meta.view_type(target)?;
                    let nested = self.materialize(root, target_type, &path, source, plurals)?;
                    if nested.iter().all(is_absent) {
                        AttributeValue::Null
                    } else {
                        AttributeValue::from(ViewInstance::loaded(
                            Arc::clone(target_type),
                            None,
                            None,
                            nested,
                        ))
                    }
                }
                AttributeKind::Collection { element, kind } => {
                    let table = self.collection_table(root, &path)?;
                    let mut rows: Vec<&Row> = plurals.get(&path).into_iter().flatten().collect();
                    if *kind == CollectionKind::List {
                        if let Some(key) = &table.key_column {
                            rows.sort_by_key(|row| row.get_by_name(key).and_then(Value::as_i64));
                        }
                    }
                    let mut collection = PluralCollection::new(*kind);
                    for row in rows {
                        let column = |leaf: &str| column_value(table, row, leaf);
                        collection.add(self.element(element, decl.user_type(), &column, &path)?);
                    }
                    AttributeValue::Collection(collection)
                }
                AttributeKind::Map { key, element } => {
                    let table = self.collection_table(root, &path)?;
                    let key_column = table.key_column.as_deref().unwrap_or_default();
                    let mut map = PluralMap::new();
                    for row in plurals.get(&path).into_iter().flatten() {
                        let key_value = row.get_by_name(key_column).cloned().unwrap_or(Value::Null);
                        let key_source = |_: &str| key_value.clone();
                        let key = self.element(key, decl.key_user_type(), &key_source, &path)?;
                        let column = |leaf: &str| column_value(table, row, leaf);
                        map.put(key, self.element(element, decl.user_type(), &column, &path)?);
                    }
                    AttributeValue::Map(map)
                }
            };
            values.push(value);
        }
        Ok(values)
    }

    /// One collection element or map key.
    fn element(
        &self,
        element: &ElementType,
        user_type: Option<&Arc<dyn BasicUserType>>,
        column: &dyn Fn(&str) -> Value,
        path: &str,
    ) -> Result<AttributeValue> {
        match element {
            ElementType::Basic(BasicType::Immutable) => Ok(basic(column(""))),
            ElementType::Basic(BasicType::User(name)) => {
                decode_user(user_type, name, column(""), path)
            }
            ElementType::View(target) => {
                let target_type = self.meta.view_type(target)?;
                if !target_type.is_embeddable() {
                    return self.reference(target, column(""));
                }
                let values =
                    self.materialize(target, target_type, "", column, &PluralRows::new())?;
                Ok(AttributeValue::from(ViewInstance::loaded(
                    Arc::clone(target_type),
                    None,
                    None,
                    values,
                )))
            }
        }
    }

    fn reference(&self, target: &str, id: Value) -> Result<AttributeValue> {
        if id.is_null() {
            return Ok(AttributeValue::Null);
        }
        let target_type = self.meta.view_type(target)?;
        Ok(AttributeValue::from(ViewInstance::reference(
            Arc::clone(target_type),
            id,
        )))
    }

    fn collection_table(&self, root: &str, path: &str) -> Result<&'a CollectionTable> {
        let meta = self.meta;
        meta.resolve(root, path)?
            .column
            .as_ref()
            .and_then(ColumnDescriptor::collection_table)
            .ok_or_else(|| Error::unmapped(root, path))
    }
}

fn basic(value: Value) -> AttributeValue {
    if value.is_null() {
        AttributeValue::Null
    } else {
        AttributeValue::Basic(value)
    }
}

fn column_value(table: &CollectionTable, row: &Row, leaf: &str) -> Value {
    table
        .column_for(leaf)
        .and_then(|c| row.get_by_name(c))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Null, or an empty plural.
fn is_absent(value: &AttributeValue) -> bool {
    match value {
        AttributeValue::Null => true,
        AttributeValue::Collection(c) => c.is_empty(),
        AttributeValue::Map(m) => m.is_empty(),
        _ => false,
    }
}

fn decode_user(
    user_type: Option<&Arc<dyn BasicUserType>>,
    type_name: &str,
    value: Value,
    path: &str,
) -> Result<AttributeValue> {
    if value.is_null() {
        return Ok(AttributeValue::Null);
    }
    user_type
        .and_then(|t| t.from_value(&value))
        .map(AttributeValue::User)
        .ok_or_else(|| {
            Error::Type(TypeError {
                expected: "a value decodable by a registered user type",
                actual: format!("{} for user type '{type_name}'", value.type_name()),
                column: Some(path.to_string()),
            })
        })
}
