use crate::error::Result;
use async_trait::async_trait;

/// Positional query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    String(String),
}

impl SqlParam {
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }
}

/// Connection to the diagnosed database server.
///
/// Implementations live outside this workspace (the application crate ships
/// a dev connector for local runs). Each call may use an independent
/// connection; implementations must be safe to share across sessions.
#[async_trait]
pub trait SqlConnector: Send + Sync {
    /// Names of user databases available on the server.
    async fn list_databases(&self) -> Result<Vec<String>>;

    /// Execute `sql` against `database` and serialize the result set as a
    /// JSON document (row objects keyed by column name, bounded row count).
    async fn query_json(&self, database: &str, sql: &str, params: &[SqlParam]) -> Result<String>;

    /// Estimated execution-plan XML for `query`, or `None` when the server
    /// produced no plan.
    async fn estimated_plan_xml(&self, database: &str, query: &str) -> Result<Option<String>>;
}
