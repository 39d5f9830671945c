//! Dev connector for local development and tests.
//!
//! Serves a fixed database list and empty, clearly labeled result sets so
//! the full chat loop can run without a live SQL Server. Production
//! deployments inject their own [`SqlConnector`] implementation through
//! [`crate::server::serve`].

use async_trait::async_trait;
use scout_tools::{Result, SqlConnector, SqlParam};
use serde_json::json;

pub struct DevSqlConnector {
    databases: Vec<String>,
}

impl DevSqlConnector {
    pub fn new(databases: Vec<String>) -> Self {
        Self { databases }
    }
}

#[async_trait]
impl SqlConnector for DevSqlConnector {
    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(self.databases.clone())
    }

    async fn query_json(&self, database: &str, sql: &str, _params: &[SqlParam]) -> Result<String> {
        tracing::debug!(database, sql_chars = sql.len(), "dev connector query");
        Ok(json!({
            "rows": [],
            "note": format!("dev connector: no live server behind database {database}"),
        })
        .to_string())
    }

    async fn estimated_plan_xml(&self, _database: &str, _query: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dev_connector_serves_configured_databases_and_empty_rows() {
        let connector = DevSqlConnector::new(vec!["devdb".to_string()]);
        assert_eq!(connector.list_databases().await.expect("databases"), vec!["devdb"]);

        let payload = connector
            .query_json("devdb", "SELECT 1", &[])
            .await
            .expect("query");
        let parsed: serde_json::Value = serde_json::from_str(&payload).expect("payload json");
        assert_eq!(parsed["rows"], serde_json::json!([]));

        assert!(
            connector
                .estimated_plan_xml("devdb", "SELECT 1")
                .await
                .expect("plan")
                .is_none()
        );
    }
}
