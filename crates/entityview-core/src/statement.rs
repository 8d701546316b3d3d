//! Statement construction.
//!
//! The flush executor treats statement construction as opaque: it asks a
//! [`StatementBuilder`] for a SELECT/UPDATE/INSERT/DELETE over a table and a
//! set of column bindings and hands the result to a
//! [`Connection`](crate::Connection). [`SqlStatementBuilder`] is the default
//! implementation and renders plain parameterized SQL.

use crate::dialect::{Dialect, DialectCapabilities};
use crate::value::Value;
use std::fmt::{self, Debug};

/// Statement category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Row or collection read
    Select,
    /// Root row update
    Update,
    /// Collection row insert
    Insert,
    /// Collection or root row delete
    Delete,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StatementKind::Select => "SELECT",
            StatementKind::Update => "UPDATE",
            StatementKind::Insert => "INSERT",
            StatementKind::Delete => "DELETE",
        })
    }
}

/// An executable statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Statement category.
    pub kind: StatementKind,
    /// Target table.
    pub table: String,
    /// Rendered SQL text.
    pub sql: String,
    /// Bound parameters in placeholder order.
    pub params: Vec<Value>,
}

/// Produces executable statements from table names and column bindings.
///
/// Filters are conjunctions of equality predicates. A `NULL` filter value
/// must match NULL columns.
pub trait StatementBuilder: Send + Sync + Debug {
    /// `SELECT columns FROM table WHERE filter`.
    fn select(&self, table: &str, columns: &[&str], filter: &[(&str, Value)]) -> Statement;

    /// `UPDATE table SET assignments WHERE filter`.
    fn update(&self, table: &str, assignments: &[(&str, Value)], filter: &[(&str, Value)])
    -> Statement;

    /// Insert rows; may return several statements when rows cannot be
    /// combined.
    fn insert(&self, table: &str, columns: &[&str], rows: &[Vec<Value>]) -> Vec<Statement>;

    /// `DELETE FROM table WHERE filter`.
    fn delete(&self, table: &str, filter: &[(&str, Value)]) -> Statement;
}

/// Renders parameterized SQL for a [`Dialect`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlStatementBuilder {
    dialect: Dialect,
    capabilities: DialectCapabilities,
}

impl SqlStatementBuilder {
    /// Create a builder using the dialect's default capabilities.
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            capabilities: dialect.capabilities(),
        }
    }

    /// Override the capability flags.
    pub fn with_capabilities(mut self, capabilities: DialectCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// The dialect this builder renders.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn where_clause(&self, filter: &[(&str, Value)], params: &mut Vec<Value>) -> String {
        if filter.is_empty() {
            return String::new();
        }
        let predicates: Vec<String> = filter
            .iter()
            .map(|(column, value)| {
                let column = self.dialect.quote_identifier(column);
                if value.is_null() {
                    format!("{} IS NULL", column)
                } else {
                    params.push(value.clone());
                    format!("{} = {}", column, self.dialect.placeholder(params.len()))
                }
            })
            .collect();
        format!(" WHERE {}", predicates.join(" AND "))
    }

    fn insert_one(&self, table: &str, col_list: &str, rows: &[Vec<Value>]) -> Statement {
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ",
            self.dialect.quote_identifier(table),
            col_list
        );
        let mut params: Vec<Value> = Vec::new();

        for (i, values) in rows.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            let placeholders: Vec<String> = values
                .iter()
                .map(|value| {
                    params.push(value.clone());
                    self.dialect.placeholder(params.len())
                })
                .collect();
            sql.push('(');
            sql.push_str(&placeholders.join(", "));
            sql.push(')');
        }

        Statement {
            kind: StatementKind::Insert,
            table: table.to_string(),
            sql,
            params,
        }
    }
}

impl StatementBuilder for SqlStatementBuilder {
    fn select(&self, table: &str, columns: &[&str], filter: &[(&str, Value)]) -> Statement {
        let mut params = Vec::new();
        let col_list: Vec<String> = columns
            .iter()
            .map(|c| self.dialect.quote_identifier(c))
            .collect();
        let where_sql = self.where_clause(filter, &mut params);
        Statement {
            kind: StatementKind::Select,
            table: table.to_string(),
            sql: format!(
                "SELECT {} FROM {}{}",
                col_list.join(", "),
                self.dialect.quote_identifier(table),
                where_sql
            ),
            params,
        }
    }

    fn update(
        &self,
        table: &str,
        assignments: &[(&str, Value)],
        filter: &[(&str, Value)],
    ) -> Statement {
        let mut params = Vec::new();
        let set_list: Vec<String> = assignments
            .iter()
            .map(|(column, value)| {
                params.push(value.clone());
                format!(
                    "{} = {}",
                    self.dialect.quote_identifier(column),
                    self.dialect.placeholder(params.len())
                )
            })
            .collect();
        let where_sql = self.where_clause(filter, &mut params);
        Statement {
            kind: StatementKind::Update,
            table: table.to_string(),
            sql: format!(
                "UPDATE {} SET {}{}",
                self.dialect.quote_identifier(table),
                set_list.join(", "),
                where_sql
            ),
            params,
        }
    }

    fn insert(&self, table: &str, columns: &[&str], rows: &[Vec<Value>]) -> Vec<Statement> {
        if rows.is_empty() {
            return Vec::new();
        }
        let col_list = columns
            .iter()
            .map(|c| self.dialect.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");

        if self.capabilities.supports_multi_row_insert {
            vec![self.insert_one(table, &col_list, rows)]
        } else {
            rows.iter()
                .map(|row| self.insert_one(table, &col_list, std::slice::from_ref(row)))
                .collect()
        }
    }

    fn delete(&self, table: &str, filter: &[(&str, Value)]) -> Statement {
        let mut params = Vec::new();
        let where_sql = self.where_clause(filter, &mut params);
        Statement {
            kind: StatementKind::Delete,
            table: table.to_string(),
            sql: format!(
                "DELETE FROM {}{}",
                self.dialect.quote_identifier(table),
                where_sql
            ),
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_with_version_filter() {
        let builder = SqlStatementBuilder::new(Dialect::Postgres);
        let stmt = builder.update(
            "documents",
            &[("name", Value::from("b")), ("version", Value::BigInt(2))],
            &[("id", Value::BigInt(1)), ("version", Value::BigInt(1))],
        );
        assert_eq!(
            stmt.sql,
            "UPDATE \"documents\" SET \"name\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4"
        );
        assert_eq!(stmt.params.len(), 4);
        assert_eq!(stmt.kind, StatementKind::Update);
    }

    #[test]
    fn test_null_filter_uses_is_null() {
        let builder = SqlStatementBuilder::new(Dialect::Sqlite);
        let stmt = builder.delete(
            "document_tags",
            &[("document_id", Value::BigInt(1)), ("tag", Value::Null)],
        );
        assert_eq!(
            stmt.sql,
            "DELETE FROM \"document_tags\" WHERE \"document_id\" = ?1 AND \"tag\" IS NULL"
        );
        assert_eq!(stmt.params, vec![Value::BigInt(1)]);
    }

    #[test]
    fn test_multi_row_insert() {
        let builder = SqlStatementBuilder::new(Dialect::Postgres);
        let stmts = builder.insert(
            "document_tags",
            &["document_id", "tag"],
            &[
                vec![Value::BigInt(1), Value::from("a")],
                vec![Value::BigInt(1), Value::from("b")],
            ],
        );
        assert_eq!(stmts.len(), 1);
        assert_eq!(
            stmts[0].sql,
            "INSERT INTO \"document_tags\" (\"document_id\", \"tag\") VALUES ($1, $2), ($3, $4)"
        );
    }

    #[test]
    fn test_single_row_inserts_without_capability() {
        let builder = SqlStatementBuilder::new(Dialect::Mysql).with_capabilities(
            DialectCapabilities {
                supports_update_set_embeddable: false,
                supports_multi_row_insert: false,
            },
        );
        let stmts = builder.insert(
            "document_tags",
            &["document_id", "tag"],
            &[
                vec![Value::BigInt(1), Value::from("a")],
                vec![Value::BigInt(1), Value::from("b")],
            ],
        );
        assert_eq!(stmts.len(), 2);
        assert_eq!(
            stmts[1].sql,
            "INSERT INTO `document_tags` (`document_id`, `tag`) VALUES (?, ?)"
        );
        assert!(builder.insert("t", &["a"], &[]).is_empty());
    }

    #[test]
    fn test_select() {
        let builder = SqlStatementBuilder::new(Dialect::Postgres);
        let stmt = builder.select("documents", &["id", "name"], &[("id", Value::BigInt(7))]);
        assert_eq!(
            stmt.sql,
            "SELECT \"id\", \"name\" FROM \"documents\" WHERE \"id\" = $1"
        );
    }
}
