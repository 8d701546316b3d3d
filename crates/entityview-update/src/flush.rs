//! Flush execution.
//!
//! [`FlushExecutor`] runs a [`FlushPlan`] unit by unit, strictly in order,
//! awaiting every statement before issuing the next. Each unit goes through
//! the same phases:
//!
//! 1. Read: SELECT the stored entity row when a write depends on it, and
//!    the stored rows of every collection that must be reconciled.
//! 2. Resolve: drop writes whose stored value is already current and turn
//!    reconciled collections into row deletes and inserts.
//! 3. UPDATE the entity row with the changed columns and the version
//!    increment, guarded by id and version. A created view's row is
//!    INSERTed instead, with every mapped column.
//! 4. DELETE collection rows.
//! 5. INSERT collection rows.
//! 6. DELETE the rows of orphaned owned views.
//!
//! A failure stops the flush. Nothing here touches the view's tracker;
//! [`complete_flush`] resets it once the caller has seen every unit succeed.

use crate::plan::{
    CollectionAction, CollectionOp, CollectionRow, FlushPlan, FlushUnit, PathStep, RowDelete,
    WriteMode,
};
use crate::value::AttributeValue;
use crate::view::ViewInstance;
use asupersync::{Cx, Outcome};
use entityview_core::{
    Connection, Error, OptimisticLockError, Row, Statement, StatementBuilder, Value,
};
use std::time::Instant;

/// Result of executing a flush plan.
#[derive(Debug, Clone, Default)]
pub struct FlushResult {
    /// SELECTs issued to read stored state.
    pub selected: usize,
    /// Entity rows inserted.
    pub created: usize,
    /// Entity rows updated.
    pub updated: usize,
    /// Collection rows inserted.
    pub inserted: usize,
    /// DELETE statements issued.
    pub deleted: usize,
    /// Entity versions incremented.
    pub version_increments: usize,
    /// Every statement issued, in order.
    pub statements: Vec<Statement>,
    versions: Vec<(Vec<PathStep>, i64)>,
    persisted: Vec<Vec<PathStep>>,
}

impl FlushResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of write operations performed.
    pub fn total(&self) -> usize {
        self.created + self.inserted + self.updated + self.deleted
    }

    /// Whether no statement was issued.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// New versions of the flushed views, by location below the root.
    pub fn new_versions(&self) -> &[(Vec<PathStep>, i64)] {
        &self.versions
    }

    /// Locations of the created views whose rows were inserted.
    pub fn persisted(&self) -> &[Vec<PathStep>] {
        &self.persisted
    }
}

/// Row deletes and inserts resolved for one collection table.
#[derive(Debug)]
struct CollectionStep<'u> {
    op: &'u CollectionOp,
    delete_all: bool,
    deletes: Vec<CollectionRow>,
    inserts: Vec<CollectionRow>,
}

impl CollectionStep<'_> {
    fn is_empty(&self) -> bool {
        !self.delete_all && self.deletes.is_empty() && self.inserts.is_empty()
    }
}

/// Executes flush plans through a [`StatementBuilder`] and a [`Connection`].
#[derive(Debug, Clone, Copy)]
pub struct FlushExecutor<'a> {
    statements: &'a dyn StatementBuilder,
}

impl<'a> FlushExecutor<'a> {
    pub fn new(statements: &'a dyn StatementBuilder) -> Self {
        Self { statements }
    }

    /// Execute every unit of the plan in order.
    #[tracing::instrument(level = "info", skip(self, cx, conn, plan))]
    pub async fn execute<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        plan: &FlushPlan,
    ) -> Outcome<FlushResult, Error> {
        tracing::info!(units = plan.len(), "Executing flush plan");

        let start = Instant::now();
        let mut result = FlushResult::default();

        for unit in plan.iter() {
            match self.execute_unit(cx, conn, unit, &mut result).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            selected = result.selected,
            created = result.created,
            updated = result.updated,
            inserted = result.inserted,
            deleted = result.deleted,
            "Flush complete"
        );

        Outcome::Ok(result)
    }

    async fn execute_unit<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        unit: &FlushUnit,
        result: &mut FlushResult,
    ) -> Outcome<(), Error> {
        tracing::debug!(view_type = %unit.view_type, id = %unit.id, "Flushing unit");

        // 1. Reads
        let stored = if unit.needs_row_read() {
            match self.read_row(cx, conn, unit, result).await {
                Outcome::Ok(row) => Some(row),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else {
            None
        };

        // 2. Resolution
        let mut assignments: Vec<(&str, Value)> = Vec::new();
        for write in &unit.writes {
            let current = match (write.mode, &stored) {
                (WriteMode::IfDiffers, Some(row)) => row
                    .get_by_name(&write.column)
                    .is_some_and(|v| v.same_as(&write.value)),
                _ => false,
            };
            if current {
                tracing::trace!(column = %write.column, "Stored value already current");
            } else {
                assignments.push((write.column.as_str(), write.value.clone()));
            }
        }

        let mut steps = Vec::with_capacity(unit.collections.len());
        for op in &unit.collections {
            let step = match &op.action {
                CollectionAction::Replace { rows } => CollectionStep {
                    op,
                    delete_all: true,
                    deletes: Vec::new(),
                    inserts: rows.clone(),
                },
                CollectionAction::Delta { deletes, inserts } => CollectionStep {
                    op,
                    delete_all: false,
                    deletes: deletes.clone(),
                    inserts: inserts.clone(),
                },
                CollectionAction::Reconcile { desired } => {
                    match self.reconcile(cx, conn, unit, op, desired, result).await {
                        Outcome::Ok(step) => step,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
            };
            if !step.is_empty() {
                steps.push(step);
            }
        }

        let planned_rows = !unit.writes.is_empty() || !unit.collections.is_empty();
        if !unit.is_insert()
            && planned_rows
            && assignments.is_empty()
            && steps.is_empty()
            && unit.orphans.is_empty()
        {
            tracing::debug!(view_type = %unit.view_type, "Stored state already current, skipping unit");
            return Outcome::Ok(());
        }

        // 3. Entity row
        if unit.is_insert() {
            match self.insert_row(cx, conn, unit, result).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else if !assignments.is_empty() || unit.version.is_some() {
            match self.update_row(cx, conn, unit, assignments, result).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // 4. Collection deletes
        for step in &steps {
            match self.delete_rows(cx, conn, unit, step, result).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // 5. Collection inserts
        for step in &steps {
            match self.insert_rows(cx, conn, unit, step, result).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // 6. Orphans
        for orphan in &unit.orphans {
            match self.delete_row(cx, conn, orphan, false, result).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        Outcome::Ok(())
    }

    /// Load the columns compared by the unit's writes, checking the version.
    async fn read_row<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        unit: &FlushUnit,
        result: &mut FlushResult,
    ) -> Outcome<Row, Error> {
        let mut columns: Vec<&str> = unit
            .writes
            .iter()
            .filter(|w| w.mode == WriteMode::IfDiffers)
            .map(|w| w.column.as_str())
            .collect();
        if let Some(check) = &unit.version {
            columns.push(check.column.as_str());
        }
        let filter = [(unit.id_column.as_str(), unit.id.clone())];
        let statement = self.statements.select(&unit.table, &columns, &filter);

        let rows = match run_query(cx, conn, statement, result).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let Some(row) = rows.into_iter().next() else {
            return Outcome::Err(unit_lock_error(unit, None));
        };
        if let Some(check) = &unit.version {
            let actual = row.get_by_name(&check.column).and_then(Value::as_i64);
            if actual != Some(check.expected) {
                return Outcome::Err(unit_lock_error(unit, actual));
            }
        }
        Outcome::Ok(row)
    }

    /// Load a collection's stored rows and diff them against the desired
    /// rows.
    async fn reconcile<'u, C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        unit: &FlushUnit,
        op: &'u CollectionOp,
        desired: &[CollectionRow],
        result: &mut FlushResult,
    ) -> Outcome<CollectionStep<'u>, Error> {
        let mut columns: Vec<&str> = Vec::new();
        columns.extend(op.key_column.as_deref());
        columns.extend(op.table.element_columns.iter().map(|c| c.column.as_str()));
        let filter = [(op.table.owner_column.as_str(), unit.id.clone())];
        let statement = self.statements.select(&op.table.table, &columns, &filter);

        let rows = match run_query(cx, conn, statement, result).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let stored: Vec<CollectionRow> = rows.iter().map(|row| stored_row(op, row)).collect();
        let (deletes, inserts) = diff_rows(&stored, desired);

        // A value-addressed DELETE removes every copy of a duplicated row.
        let ambiguous = !op.delete_by_key
            && deletes
                .iter()
                .any(|d| stored.iter().filter(|s| s.same_as(d)).count() > 1);
        if ambiguous {
            tracing::debug!(
                table = %op.table.table,
                "Stored rows hold duplicates, replacing the collection"
            );
            return Outcome::Ok(CollectionStep {
                op,
                delete_all: true,
                deletes: Vec::new(),
                inserts: desired.to_vec(),
            });
        }

        tracing::debug!(
            table = %op.table.table,
            deletes = deletes.len(),
            inserts = inserts.len(),
            "Reconciled collection"
        );
        Outcome::Ok(CollectionStep {
            op,
            delete_all: false,
            deletes,
            inserts,
        })
    }

    async fn update_row<'u, C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        unit: &'u FlushUnit,
        mut assignments: Vec<(&'u str, Value)>,
        result: &mut FlushResult,
    ) -> Outcome<(), Error> {
        let mut filter = vec![(unit.id_column.as_str(), unit.id.clone())];
        let next_version = unit.version.as_ref().map(|check| {
            let next = check.expected.saturating_add(1);
            assignments.push((check.column.as_str(), Value::BigInt(next)));
            filter.push((check.column.as_str(), Value::BigInt(check.expected)));
            next
        });
        let statement = self.statements.update(&unit.table, &assignments, &filter);

        match run_execute(cx, conn, statement, result).await {
            Outcome::Ok(0) => return Outcome::Err(unit_lock_error(unit, None)),
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        result.updated += 1;
        if let Some(version) = next_version {
            result.version_increments += 1;
            result.versions.push((unit.location.clone(), version));
        }
        Outcome::Ok(())
    }

    /// INSERT a created view's row: id, initial version, then the planned
    /// columns.
    async fn insert_row<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        unit: &FlushUnit,
        result: &mut FlushResult,
    ) -> Outcome<(), Error> {
        let mut columns = vec![unit.id_column.as_str()];
        let mut values = vec![unit.id.clone()];
        if let Some(check) = &unit.version {
            columns.push(check.column.as_str());
            values.push(Value::BigInt(check.expected));
        }
        for write in &unit.writes {
            columns.push(write.column.as_str());
            values.push(write.value.clone());
        }
        let statements = self.statements.insert(&unit.table, &columns, &[values]);

        for statement in statements {
            match run_execute(cx, conn, statement, result).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        result.created += 1;
        result.persisted.push(unit.location.clone());
        Outcome::Ok(())
    }

    /// DELETE an entity row after the rows of its collection tables.
    ///
    /// A version-checked delete that matches nothing is a lock failure, and
    /// so is any `strict` one. Otherwise the row is taken as already gone.
    async fn delete_row<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        delete: &RowDelete,
        strict: bool,
        result: &mut FlushResult,
    ) -> Outcome<(), Error> {
        for table in &delete.collection_tables {
            let statement = self
                .statements
                .delete(&table.table, &[(table.owner_column.as_str(), delete.id.clone())]);
            match run_execute(cx, conn, statement, result).await {
                Outcome::Ok(_) => result.deleted += 1,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let mut filter = vec![(delete.id_column.as_str(), delete.id.clone())];
        if let Some(check) = &delete.version {
            filter.push((check.column.as_str(), Value::BigInt(check.expected)));
        }
        let statement = self.statements.delete(&delete.table, &filter);
        match run_execute(cx, conn, statement, result).await {
            Outcome::Ok(0) if strict || delete.version.is_some() => {
                return Outcome::Err(lock_error(
                    &delete.entity,
                    &delete.table,
                    &delete.id,
                    delete.version.as_ref().map(|c| c.expected),
                    None,
                ));
            }
            Outcome::Ok(0) => {
                tracing::debug!(view_type = %delete.view_type, id = %delete.id, "Row already gone");
            }
            Outcome::Ok(_) => result.deleted += 1,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        Outcome::Ok(())
    }

    async fn delete_rows<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        unit: &FlushUnit,
        step: &CollectionStep<'_>,
        result: &mut FlushResult,
    ) -> Outcome<(), Error> {
        let op = step.op;
        let owner = (op.table.owner_column.as_str(), unit.id.clone());
        let mut statements = Vec::new();
        if step.delete_all {
            statements.push(self.statements.delete(&op.table.table, &[owner.clone()]));
        }
        for row in &step.deletes {
            let mut filter = vec![owner.clone()];
            if let (Some(column), Some(key)) = (&op.key_column, &row.key) {
                filter.push((column.as_str(), key.clone()));
            }
            if !op.delete_by_key {
                filter.extend(
                    op.table
                        .element_columns
                        .iter()
                        .map(|c| c.column.as_str())
                        .zip(row.elements.iter().cloned()),
                );
            }
            statements.push(self.statements.delete(&op.table.table, &filter));
        }

        for statement in statements {
            match run_execute(cx, conn, statement, result).await {
                Outcome::Ok(_) => result.deleted += 1,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    async fn insert_rows<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        unit: &FlushUnit,
        step: &CollectionStep<'_>,
        result: &mut FlushResult,
    ) -> Outcome<(), Error> {
        if step.inserts.is_empty() {
            return Outcome::Ok(());
        }
        let op = step.op;
        let rows: Vec<Vec<Value>> = step
            .inserts
            .iter()
            .map(|row| {
                let mut values = Vec::with_capacity(row.elements.len() + 2);
                values.push(unit.id.clone());
                if op.key_column.is_some() {
                    values.push(row.key.clone().unwrap_or(Value::Null));
                }
                values.extend(row.elements.iter().cloned());
                values
            })
            .collect();
        let statements = self
            .statements
            .insert(&op.table.table, &op.insert_columns(), &rows);

        for statement in statements {
            match run_execute(cx, conn, statement, result).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        result.inserted += rows.len();
        Outcome::Ok(())
    }

    /// Run the deletes of [`FlushPlanner::plan_removal`](crate::FlushPlanner::plan_removal)
    /// in order.
    ///
    /// The first delete is the removed view's own row and must match; the
    /// owned rows after it may already be gone unless version-checked.
    #[tracing::instrument(level = "info", skip(self, cx, conn, deletes))]
    pub async fn remove<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        deletes: &[RowDelete],
    ) -> Outcome<FlushResult, Error> {
        let start = Instant::now();
        let mut result = FlushResult::default();

        for (index, delete) in deletes.iter().enumerate() {
            match self.delete_row(cx, conn, delete, index == 0, &mut result).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            deleted = result.deleted,
            "Remove complete"
        );
        Outcome::Ok(result)
    }
}

async fn run_query<C: Connection>(
    cx: &Cx,
    conn: &C,
    statement: Statement,
    result: &mut FlushResult,
) -> Outcome<Vec<Row>, Error> {
    tracing::trace!(sql = %statement.sql, params = statement.params.len(), "Executing read");
    let outcome = conn.query(cx, &statement.sql, &statement.params).await;
    result.selected += 1;
    result.statements.push(statement);
    outcome
}

async fn run_execute<C: Connection>(
    cx: &Cx,
    conn: &C,
    statement: Statement,
    result: &mut FlushResult,
) -> Outcome<u64, Error> {
    tracing::trace!(sql = %statement.sql, params = statement.params.len(), "Executing statement");
    let outcome = conn.execute(cx, &statement.sql, &statement.params).await;
    result.statements.push(statement);
    outcome
}

fn unit_lock_error(unit: &FlushUnit, actual: Option<i64>) -> Error {
    lock_error(
        &unit.entity,
        &unit.table,
        &unit.id,
        unit.version.as_ref().map(|c| c.expected),
        actual,
    )
}

fn lock_error(
    entity: &str,
    table: &str,
    id: &Value,
    expected: Option<i64>,
    actual: Option<i64>,
) -> Error {
    tracing::warn!(entity = entity, id = %id, ?expected, ?actual, "Optimistic lock failure");
    Error::OptimisticLock(OptimisticLockError {
        entity: entity.to_string(),
        table: table.to_string(),
        id: id.clone(),
        expected_version: expected,
        actual_version: actual,
    })
}

fn stored_row(op: &CollectionOp, row: &Row) -> CollectionRow {
    let value = |column: &str| row.get_by_name(column).cloned().unwrap_or(Value::Null);
    CollectionRow {
        key: op.key_column.as_deref().map(value),
        elements: op
            .table
            .element_columns
            .iter()
            .map(|c| value(&c.column))
            .collect(),
    }
}

/// Multiset difference: stored rows without a desired counterpart, and
/// desired rows without a stored counterpart.
fn diff_rows(
    stored: &[CollectionRow],
    desired: &[CollectionRow],
) -> (Vec<CollectionRow>, Vec<CollectionRow>) {
    let mut matched = vec![false; stored.len()];
    let mut inserts = Vec::new();
    for row in desired {
        let found = stored
            .iter()
            .enumerate()
            .position(|(i, s)| !matched[i] && s.same_as(row));
        match found {
            Some(i) => matched[i] = true,
            None => inserts.push(row.clone()),
        }
    }
    let deletes = stored
        .iter()
        .zip(&matched)
        .filter(|(_, m)| !**m)
        .map(|(row, _)| row.clone())
        .collect();
    (deletes, inserts)
}

/// Apply a successful flush to the view tree: mark inserted views as
/// persisted, store the new versions and take fresh snapshots so the tree
/// is clean.
///
/// Call only after [`FlushExecutor::execute`] returned `Ok`; after a failed
/// flush the tracker keeps its state so the flush can be retried.
pub fn complete_flush(view: &mut ViewInstance, result: &FlushResult) {
    for location in &result.persisted {
        match view_at_mut(view, location) {
            Some(target) => target.mark_persisted(),
            None => tracing::warn!(?location, "Inserted view no longer reachable"),
        }
    }
    for (location, version) in &result.versions {
        match view_at_mut(view, location) {
            Some(target) => target.set_version(*version),
            None => tracing::warn!(?location, "Flushed view no longer reachable, version not applied"),
        }
    }
    view.reset_tracking();
}

/// The view at `location` below `root`, as recorded in a plan or result.
pub fn view_at<'v>(root: &'v ViewInstance, location: &[PathStep]) -> Option<&'v ViewInstance> {
    let mut current = root;
    for step in location {
        let value = match step {
            PathStep::Attribute(name) => current.get(name).ok()?,
            PathStep::Element { attribute, index } => {
                current.get(attribute).ok()?.as_collection()?.iter().nth(*index)?
            }
            PathStep::MapKey { attribute, index } => {
                current.get(attribute).ok()?.as_map()?.iter().nth(*index)?.0
            }
            PathStep::MapElement { attribute, index } => {
                current.get(attribute).ok()?.as_map()?.iter().nth(*index)?.1
            }
        };
        current = value.as_view()?;
    }
    Some(current)
}

fn view_at_mut<'v>(root: &'v mut ViewInstance, location: &[PathStep]) -> Option<&'v mut ViewInstance> {
    let mut current = root;
    for step in location {
        let value = match step {
            PathStep::Attribute(name) => current.value_untracked_mut(name)?,
            PathStep::Element { attribute, index } => {
                match current.value_untracked_mut(attribute)? {
                    AttributeValue::Collection(collection) => collection.get_mut(*index)?,
                    _ => return None,
                }
            }
            PathStep::MapKey { attribute, index } => match current.value_untracked_mut(attribute)? {
                AttributeValue::Map(map) => map.entry_mut(*index)?.0,
                _ => return None,
            },
            PathStep::MapElement { attribute, index } => {
                match current.value_untracked_mut(attribute)? {
                    AttributeValue::Map(map) => map.entry_mut(*index)?.1,
                    _ => return None,
                }
            }
        };
        current = value.as_view_mut()?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::tests::metamodel;
    use crate::value::PluralCollection;
    use crate::view_type::{CollectionKind, ViewType};
    use std::sync::Arc;

    fn row(elements: &[&str]) -> CollectionRow {
        CollectionRow {
            key: None,
            elements: elements.iter().map(|e| Value::Text((*e).to_string())).collect(),
        }
    }

    #[test]
    fn test_diff_rows_is_multiset() {
        let stored = vec![row(&["a"]), row(&["b"]), row(&["b"])];
        let desired = vec![row(&["b"]), row(&["c"])];
        let (deletes, inserts) = diff_rows(&stored, &desired);
        assert_eq!(deletes, vec![row(&["a"]), row(&["b"])]);
        assert_eq!(inserts, vec![row(&["c"])]);
    }

    #[test]
    fn test_diff_rows_identical_is_empty() {
        let rows = vec![row(&["a"]), row(&["b"])];
        let (deletes, inserts) = diff_rows(&rows, &rows);
        assert!(deletes.is_empty());
        assert!(inserts.is_empty());
    }

    #[test]
    fn test_complete_flush_applies_versions_and_resets() {
        let meta = metamodel();
        let owner = ViewInstance::builder(Arc::clone(meta.view_type("PersonView").unwrap()))
            .id(7_i64)
            .value("name", "Ann")
            .build()
            .unwrap();
        let mut view = ViewInstance::builder(Arc::clone(meta.view_type("DocView").unwrap()))
            .id(1_i64)
            .version(3)
            .value("name", "a")
            .value("owner", owner)
            .value(
                "tags",
                PluralCollection::from_elements(CollectionKind::Set, ["a"]),
            )
            .build()
            .unwrap();
        view.set("name", "b").unwrap();
        view.collection_mut("tags").unwrap().add("b");
        view.view_mut("owner").unwrap().set("name", "Bea").unwrap();
        assert!(view.is_dirty());

        let mut result = FlushResult::new();
        result.versions.push((Vec::new(), 4));
        complete_flush(&mut view, &result);

        assert_eq!(view.version(), Some(4));
        assert!(!view.is_dirty());
        assert!(!view.get("owner").unwrap().as_view().unwrap().is_dirty());
        assert_eq!(view.get("owner.name").unwrap().as_basic(), Some(&Value::Text("Bea".into())));
    }

    #[test]
    fn test_view_at_mut_follows_steps() {
        let meta = metamodel();
        let owner = ViewInstance::builder(Arc::clone(meta.view_type("PersonView").unwrap()))
            .id(7_i64)
            .build()
            .unwrap();
        let mut view = ViewInstance::builder(Arc::clone(meta.view_type("DocView").unwrap()))
            .id(1_i64)
            .value("owner", owner)
            .build()
            .unwrap();

        let target = view_at_mut(&mut view, &[PathStep::Attribute("owner".to_string())]).unwrap();
        assert_eq!(target.id(), Some(&Value::BigInt(7)));
        let owner = view_at(&view, &[PathStep::Attribute("owner".to_string())]).unwrap();
        assert_eq!(owner.id(), Some(&Value::BigInt(7)));
        assert!(view_at_mut(&mut view, &[PathStep::Attribute("name".to_string())]).is_none());
        assert!(!view.is_dirty());
    }

    #[test]
    fn test_complete_flush_marks_inserted_views_persisted() {
        let person_type = Arc::new(
            ViewType::builder("PersonView")
                .entity("Person")
                .id("id")
                .creatable()
                .basic("name")
                .build(),
        );
        let mut view = ViewInstance::create(person_type, 7_i64).unwrap();
        view.set("name", "Ann").unwrap();

        let mut result = FlushResult::new();
        result.persisted.push(Vec::new());
        complete_flush(&mut view, &result);

        assert!(!view.is_new());
        assert!(!view.is_dirty());
        assert_eq!(result.persisted(), &[Vec::<PathStep>::new()]);
    }
}
