//! The entry point applications talk to.

use crate::config::{EntityViewConfig, UpdateOptions};
use crate::listener::{ViewEvent, ViewListeners};
use asupersync::{Cx, Outcome};
use entityview_core::{Connection, Error, Result, SqlStatementBuilder, StatementBuilder, Value};
use entityview_update::{
    FlushExecutor, FlushPlanner, FlushResult, SingularChangeModel, ViewFetcher, ViewInstance,
    ViewMetamodel, change_model, complete_flush, view_at,
};
use std::sync::Arc;

/// Fetches, inspects and flushes entity views of one [`ViewMetamodel`].
///
/// The manager holds no connection. Every persistence operation runs on the
/// connection (or transaction handle) the caller passes in, so the caller
/// owns transaction boundaries.
///
/// # Example
///
/// ```ignore
/// let mut manager = EntityViewManager::new(Arc::new(meta));
/// let mut doc = manager.find(&cx, &conn, "DocView", &Value::BigInt(1)).await?;
/// doc.collection_mut("tags")?.add("c");
/// assert!(manager.get_change_model(&doc).is_dirty());
/// manager.update(&cx, &conn, &mut doc).await?;
/// ```
#[derive(Debug)]
pub struct EntityViewManager {
    meta: Arc<ViewMetamodel>,
    config: EntityViewConfig,
    statements: Option<Arc<dyn StatementBuilder>>,
    listeners: ViewListeners,
}

impl EntityViewManager {
    /// Create a manager with the default config.
    pub fn new(meta: Arc<ViewMetamodel>) -> Self {
        Self::with_config(meta, EntityViewConfig::default())
    }

    pub fn with_config(meta: Arc<ViewMetamodel>, config: EntityViewConfig) -> Self {
        Self {
            meta,
            config,
            statements: None,
            listeners: ViewListeners::default(),
        }
    }

    /// Use a custom statement builder instead of the SQL builder for the
    /// connection's dialect.
    pub fn with_statement_builder(mut self, statements: Arc<dyn StatementBuilder>) -> Self {
        self.statements = Some(statements);
        self
    }

    pub fn metamodel(&self) -> &Arc<ViewMetamodel> {
        &self.meta
    }

    pub fn config(&self) -> &EntityViewConfig {
        &self.config
    }

    /// Register a listener that runs before a view is flushed.
    ///
    /// The listener can veto the flush by returning `Err`.
    pub fn on_before_update(
        &mut self,
        f: impl FnMut(&ViewInstance) -> Result<()> + Send + 'static,
    ) {
        self.listeners.register(ViewEvent::BeforeUpdate, f);
    }

    /// Register a listener that runs after a successful flush.
    pub fn on_after_update(&mut self, f: impl FnMut(&ViewInstance) -> Result<()> + Send + 'static) {
        self.listeners.register(ViewEvent::AfterUpdate, f);
    }

    /// Register a listener that runs before the row of a created view is
    /// inserted, for the flushed view and every created view it holds.
    ///
    /// The listener can veto the flush by returning `Err`.
    pub fn on_before_persist(
        &mut self,
        f: impl FnMut(&ViewInstance) -> Result<()> + Send + 'static,
    ) {
        self.listeners.register(ViewEvent::BeforePersist, f);
    }

    /// Register a listener that runs after the row of a created view was
    /// inserted.
    pub fn on_after_persist(&mut self, f: impl FnMut(&ViewInstance) -> Result<()> + Send + 'static) {
        self.listeners.register(ViewEvent::AfterPersist, f);
    }

    /// Register a listener that runs before a view is removed.
    ///
    /// The listener can veto the removal by returning `Err`.
    pub fn on_before_remove(
        &mut self,
        f: impl FnMut(&ViewInstance) -> Result<()> + Send + 'static,
    ) {
        self.listeners.register(ViewEvent::BeforeRemove, f);
    }

    /// Register a listener that runs after a successful removal.
    pub fn on_after_remove(&mut self, f: impl FnMut(&ViewInstance) -> Result<()> + Send + 'static) {
        self.listeners.register(ViewEvent::AfterRemove, f);
    }

    /// Change model of a view, for inspecting what an `update` would write.
    pub fn get_change_model<'v>(&self, view: &'v ViewInstance) -> SingularChangeModel<'v> {
        change_model(view)
    }

    /// An unfetched view of the given type, holding only its id.
    pub fn create_reference(&self, view_type: &str, id: impl Into<Value>) -> Result<ViewInstance> {
        let view_type = self.meta.view_type(view_type)?;
        if view_type.id().is_none() {
            return Err(Error::missing_id(view_type.name()));
        }
        Ok(ViewInstance::reference(Arc::clone(view_type), id))
    }

    /// A new view of a creatable type with the given id. Its row is inserted
    /// by the first `update`.
    pub fn create(&self, view_type: &str, id: impl Into<Value>) -> Result<ViewInstance> {
        let view_type = self.meta.view_type(view_type)?;
        if view_type.id().is_none() {
            return Err(Error::missing_id(view_type.name()));
        }
        ViewInstance::create(Arc::clone(view_type), id)
    }

    /// Load a view by id, or `None` when its entity row does not exist.
    pub async fn find<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        view_type: &str,
        id: &Value,
    ) -> Outcome<Option<ViewInstance>, Error> {
        let default_builder;
        let statements: &dyn StatementBuilder = match &self.statements {
            Some(statements) => statements.as_ref(),
            None => {
                default_builder = self.default_builder(conn);
                &default_builder
            }
        };
        ViewFetcher::new(&self.meta, statements)
            .find(cx, conn, view_type, id)
            .await
    }

    /// Load the full view behind a reference.
    pub async fn fetch<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        view: &ViewInstance,
    ) -> Outcome<ViewInstance, Error> {
        let default_builder;
        let statements: &dyn StatementBuilder = match &self.statements {
            Some(statements) => statements.as_ref(),
            None => {
                default_builder = self.default_builder(conn);
                &default_builder
            }
        };
        ViewFetcher::new(&self.meta, statements)
            .fetch(cx, conn, view)
            .await
    }

    /// Flush the changes of a view with the manager's settings.
    pub async fn update<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        view: &mut ViewInstance,
    ) -> Outcome<FlushResult, Error> {
        self.update_with(cx, conn, view, UpdateOptions::default())
            .await
    }

    /// Flush a view in FULL mode regardless of configuration.
    pub async fn update_full<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        view: &mut ViewInstance,
    ) -> Outcome<FlushResult, Error> {
        self.update_with(cx, conn, view, UpdateOptions::full()).await
    }

    /// Flush the changes of a view.
    ///
    /// Statements run strictly in sequence. On success the view tree takes
    /// its new versions and becomes clean; on any failure it keeps its dirty
    /// state so the call can be retried.
    ///
    /// A created root view fires the persist listeners instead of the update
    /// listeners. Created views nested in the tree fire the persist listeners
    /// too.
    #[tracing::instrument(level = "info", skip(self, cx, conn, view), fields(view_type = %view.view_type().name()))]
    pub async fn update_with<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        view: &mut ViewInstance,
        options: UpdateOptions,
    ) -> Outcome<FlushResult, Error> {
        let created = view.is_new();
        if !created {
            if let Err(e) = self.listeners.fire(ViewEvent::BeforeUpdate, view) {
                return Outcome::Err(e);
            }
        }

        let config = self.config.flush_config(conn.dialect(), options);
        let plan = match FlushPlanner::new(&self.meta, config).plan(view) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        for unit in plan.iter().filter(|u| u.is_insert()) {
            let Some(target) = view_at(view, &unit.location) else {
                continue;
            };
            if let Err(e) = self.listeners.fire(ViewEvent::BeforePersist, target) {
                return Outcome::Err(e);
            }
        }
        let result = if plan.is_empty() {
            tracing::debug!("Nothing to flush");
            FlushResult::default()
        } else {
            let default_builder;
            let statements: &dyn StatementBuilder = match &self.statements {
                Some(statements) => statements.as_ref(),
                None => {
                    default_builder = SqlStatementBuilder::new(conn.dialect())
                        .with_capabilities(config.capabilities);
                    &default_builder
                }
            };
            match FlushExecutor::new(statements).execute(cx, conn, &plan).await {
                Outcome::Ok(result) => result,
                Outcome::Err(e) => {
                    tracing::warn!(error = %e, "Flush failed, view keeps its changes");
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };
        complete_flush(view, &result);

        for location in result.persisted() {
            let Some(target) = view_at(view, location) else {
                continue;
            };
            if let Err(e) = self.listeners.fire(ViewEvent::AfterPersist, target) {
                return Outcome::Err(e);
            }
        }
        if !created {
            if let Err(e) = self.listeners.fire(ViewEvent::AfterUpdate, view) {
                return Outcome::Err(e);
            }
        }
        Outcome::Ok(result)
    }

    /// Delete the entity behind a view, including its collection rows and
    /// the entity views it owns through orphan-removal attributes.
    #[tracing::instrument(level = "info", skip(self, cx, conn, view), fields(view_type = %view.view_type().name()))]
    pub async fn remove<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        view: &ViewInstance,
    ) -> Outcome<FlushResult, Error> {
        if view.view_type().is_embeddable() {
            return Outcome::Err(Error::missing_id(view.view_type().name()));
        }
        if view.is_new() {
            tracing::debug!("View was never inserted, nothing to remove");
            return Outcome::Ok(FlushResult::default());
        }
        if let Err(e) = self.listeners.fire(ViewEvent::BeforeRemove, view) {
            return Outcome::Err(e);
        }

        let config = self.config.flush_config(conn.dialect(), UpdateOptions::default());
        let deletes = match FlushPlanner::new(&self.meta, config).plan_removal(view) {
            Ok(deletes) => deletes,
            Err(e) => return Outcome::Err(e),
        };

        let default_builder;
        let statements: &dyn StatementBuilder = match &self.statements {
            Some(statements) => statements.as_ref(),
            None => {
                default_builder = self.default_builder(conn);
                &default_builder
            }
        };
        let result = match FlushExecutor::new(statements)
            .remove(cx, conn, &deletes)
            .await
        {
            Outcome::Ok(result) => result,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        if let Err(e) = self.listeners.fire(ViewEvent::AfterRemove, view) {
            return Outcome::Err(e);
        }
        Outcome::Ok(result)
    }

    fn default_builder<C: Connection>(&self, conn: &C) -> SqlStatementBuilder {
        let dialect = conn.dialect();
        SqlStatementBuilder::new(dialect)
            .with_capabilities(self.config.capabilities.unwrap_or_else(|| dialect.capabilities()))
    }
}
