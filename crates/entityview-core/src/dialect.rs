//! SQL dialects and the capability flags consulted by the flush planner.

use serde::{Deserialize, Serialize};

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Default capability flags for this dialect.
    pub const fn capabilities(self) -> DialectCapabilities {
        match self {
            Dialect::Postgres | Dialect::Sqlite => DialectCapabilities {
                supports_update_set_embeddable: true,
                supports_multi_row_insert: true,
            },
            Dialect::Mysql => DialectCapabilities {
                supports_update_set_embeddable: false,
                supports_multi_row_insert: true,
            },
        }
    }
}

/// Feature flags that decide between targeted statements and the
/// reload-and-diff path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialectCapabilities {
    /// `UPDATE ... SET` may name a subset of an embeddable's column group.
    pub supports_update_set_embeddable: bool,
    /// `INSERT ... VALUES (..), (..)` is accepted.
    pub supports_multi_row_insert: bool,
}

impl Default for DialectCapabilities {
    fn default() -> Self {
        Dialect::default().capabilities()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(2), "$2");
        assert_eq!(Dialect::Sqlite.placeholder(2), "?2");
        assert_eq!(Dialect::Mysql.placeholder(2), "?");
    }

    #[test]
    fn test_quote_identifier_escapes() {
        assert_eq!(Dialect::Postgres.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::Mysql.quote_identifier("tags"), "`tags`");
    }

    #[test]
    fn test_capabilities_roundtrip_through_config() {
        let caps = Dialect::Mysql.capabilities();
        assert!(!caps.supports_update_set_embeddable);
        let json = serde_json::to_string(&caps).unwrap();
        let back: DialectCapabilities = serde_json::from_str(&json).unwrap();
        assert_eq!(back, caps);
    }
}
