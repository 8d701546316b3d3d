//! Persist, update and remove listeners.
//!
//! Listeners observe a view around a flush or removal. A `Before*` listener
//! returning `Err` vetoes the operation before any statement runs; an
//! `After*` listener returning `Err` turns a completed operation into an
//! error, but the statements it issued stay issued.

use entityview_core::Error;
use entityview_update::ViewInstance;

/// Type alias for view listener callbacks.
type ViewListenerFn = Box<dyn FnMut(&ViewInstance) -> Result<(), Error> + Send>;

/// Points at which listeners fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewEvent {
    /// Fired before a view is planned and flushed.
    BeforeUpdate,
    /// Fired after a flush succeeded and the view was reset.
    AfterUpdate,
    /// Fired before the row of a created view is inserted.
    BeforePersist,
    /// Fired after the row of a created view was inserted.
    AfterPersist,
    /// Fired before a view's rows are deleted.
    BeforeRemove,
    /// Fired after a view's rows were deleted.
    AfterRemove,
}

/// Holds registered view listeners.
#[derive(Default)]
pub struct ViewListeners {
    before_update: Vec<ViewListenerFn>,
    after_update: Vec<ViewListenerFn>,
    before_persist: Vec<ViewListenerFn>,
    after_persist: Vec<ViewListenerFn>,
    before_remove: Vec<ViewListenerFn>,
    after_remove: Vec<ViewListenerFn>,
}

impl std::fmt::Debug for ViewListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewListeners")
            .field("before_update", &self.before_update.len())
            .field("after_update", &self.after_update.len())
            .field("before_persist", &self.before_persist.len())
            .field("after_persist", &self.after_persist.len())
            .field("before_remove", &self.before_remove.len())
            .field("after_remove", &self.after_remove.len())
            .finish()
    }
}

impl ViewListeners {
    /// Register a listener for an event.
    pub fn register(
        &mut self,
        event: ViewEvent,
        f: impl FnMut(&ViewInstance) -> Result<(), Error> + Send + 'static,
    ) {
        self.listeners_mut(event).push(Box::new(f));
    }

    /// Number of listeners registered for an event.
    pub fn len(&self, event: ViewEvent) -> usize {
        match event {
            ViewEvent::BeforeUpdate => self.before_update.len(),
            ViewEvent::AfterUpdate => self.after_update.len(),
            ViewEvent::BeforePersist => self.before_persist.len(),
            ViewEvent::AfterPersist => self.after_persist.len(),
            ViewEvent::BeforeRemove => self.before_remove.len(),
            ViewEvent::AfterRemove => self.after_remove.len(),
        }
    }

    /// Run the listeners of an event in registration order, stopping at the
    /// first error.
    pub(crate) fn fire(&mut self, event: ViewEvent, view: &ViewInstance) -> Result<(), Error> {
        for listener in self.listeners_mut(event).iter_mut() {
            if let Err(e) = listener(view) {
                tracing::debug!(?event, view_type = %view.view_type().name(), "Listener vetoed");
                return Err(e);
            }
        }
        Ok(())
    }

    fn listeners_mut(&mut self, event: ViewEvent) -> &mut Vec<ViewListenerFn> {
        match event {
            ViewEvent::BeforeUpdate => &mut self.before_update,
            ViewEvent::AfterUpdate => &mut self.after_update,
            ViewEvent::BeforePersist => &mut self.before_persist,
            ViewEvent::AfterPersist => &mut self.after_persist,
            ViewEvent::BeforeRemove => &mut self.before_remove,
            ViewEvent::AfterRemove => &mut self.after_remove,
        }
    }
}
