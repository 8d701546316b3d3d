//! Manager-level and per-call flush settings.

use entityview_core::{Dialect, DialectCapabilities};
use entityview_update::{FlushConfig, FlushMode, FlushStrategy};

/// Settings held by an [`EntityViewManager`](crate::EntityViewManager).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityViewConfig {
    /// Default flush mode.
    pub flush_mode: FlushMode,
    /// Default flush strategy.
    pub flush_strategy: FlushStrategy,
    /// Capability flags; `None` uses the connection dialect's defaults.
    pub capabilities: Option<DialectCapabilities>,
}

impl EntityViewConfig {
    /// Create the default config (PARTIAL, QUERY, dialect capabilities).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default flush mode.
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    /// Set the default flush strategy.
    pub fn flush_strategy(mut self, strategy: FlushStrategy) -> Self {
        self.flush_strategy = strategy;
        self
    }

    /// Pin capability flags regardless of the connection's dialect.
    pub fn capabilities(mut self, capabilities: DialectCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Planner config for a dialect after applying per-call options.
    pub fn flush_config(&self, dialect: Dialect, options: UpdateOptions) -> FlushConfig {
        let capabilities = self.capabilities.unwrap_or_else(|| dialect.capabilities());
        let config = FlushConfig::new(
            options.flush_mode.unwrap_or(self.flush_mode),
            options.flush_strategy.unwrap_or(self.flush_strategy),
            capabilities,
        );
        if options.is_empty() {
            config
        } else {
            config.pinned()
        }
    }
}

/// Overrides for a single `update` call.
///
/// Any override set here wins over the manager defaults and over the view
/// type's own declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub flush_mode: Option<FlushMode>,
    pub flush_strategy: Option<FlushStrategy>,
}

impl UpdateOptions {
    /// No overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Force FULL mode for this call.
    pub fn full() -> Self {
        Self::default().flush_mode(FlushMode::Full)
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = Some(mode);
        self
    }

    pub fn flush_strategy(mut self, strategy: FlushStrategy) -> Self {
        self.flush_strategy = Some(strategy);
        self
    }

    /// Whether nothing is overridden.
    pub fn is_empty(&self) -> bool {
        self.flush_mode.is_none() && self.flush_strategy.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_dialect() {
        let config = EntityViewConfig::new();
        let flush = config.flush_config(Dialect::Mysql, UpdateOptions::new());
        assert_eq!(flush.flush_mode, FlushMode::Partial);
        assert_eq!(flush.flush_strategy, FlushStrategy::Query);
        assert!(!flush.capabilities.supports_update_set_embeddable);
        assert!(!flush.pinned);
    }

    #[test]
    fn test_explicit_capabilities_win() {
        let config = EntityViewConfig::new().capabilities(Dialect::Postgres.capabilities());
        let flush = config.flush_config(Dialect::Mysql, UpdateOptions::new());
        assert!(flush.capabilities.supports_update_set_embeddable);
    }

    #[test]
    fn test_call_options_override_and_pin() {
        let config = EntityViewConfig::new().flush_strategy(FlushStrategy::Entity);
        let flush = config.flush_config(Dialect::Postgres, UpdateOptions::full());
        assert_eq!(flush.flush_mode, FlushMode::Full);
        assert_eq!(flush.flush_strategy, FlushStrategy::Entity);
        assert!(flush.pinned);
    }

    #[test]
    fn test_settings_load_from_host_config() {
        let settings: serde_json::Value =
            serde_json::from_str(r#"{"mode": "Full", "strategy": "Entity"}"#).unwrap();
        let mode: FlushMode = serde_json::from_value(settings["mode"].clone()).unwrap();
        let strategy: FlushStrategy = serde_json::from_value(settings["strategy"].clone()).unwrap();
        let config = EntityViewConfig::new()
            .flush_mode(mode)
            .flush_strategy(strategy);
        assert_eq!(config.flush_mode, FlushMode::Full);
        assert_eq!(config.flush_strategy, FlushStrategy::Entity);
        assert!(config.capabilities.is_none());
    }
}
