//! Flush configuration passed explicitly into every planner invocation.

use crate::view_type::ViewType;
use entityview_core::DialectCapabilities;
use serde::{Deserialize, Serialize};

/// How much of a view is written back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlushMode {
    /// Targeted writes for attributes whose change can be proven.
    #[default]
    Partial,
    /// Reload the owning rows and diff every updatable attribute.
    Full,
}

/// Who decides which statements run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlushStrategy {
    /// Emit UPDATE/INSERT/DELETE statements directly.
    #[default]
    Query,
    /// Load the entity state and write only what differs from it.
    Entity,
}

/// Settings for one planner invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushConfig {
    /// Flush mode.
    pub flush_mode: FlushMode,
    /// Flush strategy.
    pub flush_strategy: FlushStrategy,
    /// Capability flags of the target dialect.
    pub capabilities: DialectCapabilities,
    /// Mode and strategy take precedence over view-type declarations.
    pub pinned: bool,
}

impl FlushConfig {
    /// Create a config.
    pub fn new(
        flush_mode: FlushMode,
        flush_strategy: FlushStrategy,
        capabilities: DialectCapabilities,
    ) -> Self {
        Self {
            flush_mode,
            flush_strategy,
            capabilities,
            pinned: false,
        }
    }

    /// Keep this mode and strategy even for view types declaring their own.
    #[must_use]
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// Apply the overrides declared on a view type.
    pub fn for_view(&self, view_type: &ViewType) -> Self {
        if self.pinned {
            return *self;
        }
        Self {
            flush_mode: view_type.flush_mode().unwrap_or(self.flush_mode),
            flush_strategy: view_type.flush_strategy().unwrap_or(self.flush_strategy),
            capabilities: self.capabilities,
            pinned: false,
        }
    }

    /// Whether FULL mode is active.
    pub fn is_full(&self) -> bool {
        self.flush_mode == FlushMode::Full
    }

    /// Whether the QUERY strategy is active.
    pub fn is_query(&self) -> bool {
        self.flush_strategy == FlushStrategy::Query
    }
}
