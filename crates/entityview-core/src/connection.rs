//! The persistence seam.
//!
//! The engine never manages transactions; it issues statements on whatever
//! connection (or transaction handle) the caller passes in. All operations
//! integrate with asupersync's structured concurrency via the `Cx` context.

use crate::dialect::Dialect;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// A connection capable of executing the statements a flush produces.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
///
/// # Example
///
/// ```rust,ignore
/// let rows = conn.query(&cx, "SELECT \"tag\" FROM \"doc_tags\" WHERE \"doc_id\" = $1", &[Value::BigInt(1)]).await;
/// let affected = conn.execute(&cx, "DELETE FROM \"doc_tags\" WHERE \"doc_id\" = $1", &[Value::BigInt(1)]).await;
/// ```
pub trait Connection: Send + Sync {
    /// The SQL dialect spoken by this connection.
    fn dialect(&self) -> Dialect {
        Dialect::default()
    }

    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;
}
