//! The fixed inspection-operation catalog and its dispatcher.
//!
//! Operation routing is a closed enum, so a missing arm is a compile error.
//! Names arriving from the model are parsed at the boundary; anything the
//! enum does not know becomes an error payload, never a panic or an `Err`
//! escaping to the agent loop.

use crate::connector::{SqlConnector, SqlParam};
use crate::error::{Result, ToolError};
use crate::plan;
use crate::safety;
use chrono::{SecondsFormat, Utc};
use scout_llm::ToolDefinition;
use serde_json::json;
use std::sync::Arc;

const DEFAULT_SCHEMA: &str = "dbo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectionOp {
    ListTables,
    TableStructure,
    TableIndexes,
    TableStats,
    ForeignKeys,
    MissingIndexes,
    DatabaseConfig,
    CurrentUtcTime,
    ExecutionPlan,
    ReadOnlyQuery,
}

impl InspectionOp {
    pub const ALL: [InspectionOp; 10] = [
        InspectionOp::ListTables,
        InspectionOp::TableStructure,
        InspectionOp::TableIndexes,
        InspectionOp::TableStats,
        InspectionOp::ForeignKeys,
        InspectionOp::MissingIndexes,
        InspectionOp::DatabaseConfig,
        InspectionOp::CurrentUtcTime,
        InspectionOp::ExecutionPlan,
        InspectionOp::ReadOnlyQuery,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::ListTables => "list_tables",
            Self::TableStructure => "get_table_structure",
            Self::TableIndexes => "get_indexes",
            Self::TableStats => "get_table_stats",
            Self::ForeignKeys => "get_foreign_keys",
            Self::MissingIndexes => "get_missing_indexes",
            Self::DatabaseConfig => "get_database_config",
            Self::CurrentUtcTime => "get_current_utc_time",
            Self::ExecutionPlan => "get_execution_plan",
            Self::ReadOnlyQuery => "execute_read_query",
        }
    }

    /// Definition handed verbatim to the model backend.
    pub fn definition(self) -> ToolDefinition {
        let (description, parameters) = match self {
            Self::ListTables => (
                "List all tables and views in the selected database with row counts and sizes.",
                json!({ "type": "object", "properties": {}, "required": [] }),
            ),
            Self::TableStructure => (
                "Get the column definitions of a table: names, data types, nullability, defaults, and primary key info.",
                table_parameters(),
            ),
            Self::TableIndexes => (
                "Get all indexes on a table: name, type, uniqueness, key and included columns, filter, size, and fragmentation.",
                table_parameters(),
            ),
            Self::TableStats => (
                "Get table statistics: row count, reserved space (MB), used space (MB).",
                table_parameters(),
            ),
            Self::ForeignKeys => (
                "Get all foreign key relationships for a table (both as parent and referenced table).",
                table_parameters(),
            ),
            Self::MissingIndexes => (
                "Get missing index recommendations from the server's DMVs, optionally filtered by table.",
                json!({
                    "type": "object",
                    "properties": {
                        "table_name": { "type": "string", "description": "Optional: filter by table name" },
                        "schema": { "type": "string", "description": "Schema name (default: dbo)", "default": "dbo" }
                    },
                    "required": []
                }),
            ),
            Self::DatabaseConfig => (
                "Get database-level configuration: compatibility level, collation, recovery model, statistics settings.",
                json!({ "type": "object", "properties": {}, "required": [] }),
            ),
            Self::CurrentUtcTime => (
                "Get the current UTC time.",
                json!({ "type": "object", "properties": {}, "required": [] }),
            ),
            Self::ExecutionPlan => (
                "Get the estimated execution plan for a SQL query: operators, costs, row estimates, and missing index hints. Use this to analyze query performance.",
                query_parameters("The SQL query to analyze"),
            ),
            Self::ReadOnlyQuery => (
                "Execute a read-only SELECT query against the database. Only SELECT/WITH statements are allowed.",
                query_parameters("The SELECT query to execute"),
            ),
        };
        ToolDefinition {
            name: self.name().to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

fn table_parameters() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "table_name": { "type": "string", "description": "Table name" },
            "schema": { "type": "string", "description": "Schema name (default: dbo)", "default": "dbo" }
        },
        "required": ["table_name"]
    })
}

fn query_parameters(description: &str) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string", "description": description }
        },
        "required": ["query"]
    })
}

/// Routes model-issued invocations to their implementations.
pub struct OpRegistry {
    connector: Arc<dyn SqlConnector>,
}

impl OpRegistry {
    pub fn new(connector: Arc<dyn SqlConnector>) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &Arc<dyn SqlConnector> {
        &self.connector
    }

    /// The full catalog, in declaration order.
    pub fn definitions() -> Vec<ToolDefinition> {
        InspectionOp::ALL.into_iter().map(InspectionOp::definition).collect()
    }

    /// Dispatch one invocation. Never fails: unknown names, bad arguments
    /// and connector errors all come back as `{"error": ...}` payloads.
    #[tracing::instrument(level = "info", skip(self, args))]
    pub async fn dispatch(&self, name: &str, args: &serde_json::Value, database: &str) -> String {
        let Some(op) = InspectionOp::parse(name) else {
            tracing::warn!(tool_name = name, "model invoked unknown tool");
            return error_payload(format!("unknown tool: {name}"));
        };
        match self.execute(op, args, database).await {
            Ok(observation) => observation,
            Err(e) => {
                tracing::warn!(tool_name = name, error = %e, "tool execution failed");
                error_payload(e.to_string())
            }
        }
    }

    async fn execute(
        &self,
        op: InspectionOp,
        args: &serde_json::Value,
        database: &str,
    ) -> Result<String> {
        match op {
            InspectionOp::ListTables => {
                self.connector.query_json(database, LIST_TABLES_SQL, &[]).await
            }
            InspectionOp::TableStructure => {
                let (schema, table) = table_args(args)?;
                self.connector
                    .query_json(
                        database,
                        TABLE_STRUCTURE_SQL,
                        &[SqlParam::string(schema), SqlParam::string(table)],
                    )
                    .await
            }
            InspectionOp::TableIndexes => {
                let (schema, table) = table_args(args)?;
                self.connector
                    .query_json(
                        database,
                        TABLE_INDEXES_SQL,
                        &[SqlParam::string(schema), SqlParam::string(table)],
                    )
                    .await
            }
            InspectionOp::TableStats => {
                let (schema, table) = table_args(args)?;
                self.connector
                    .query_json(
                        database,
                        TABLE_STATS_SQL,
                        &[SqlParam::string(schema), SqlParam::string(table)],
                    )
                    .await
            }
            InspectionOp::ForeignKeys => {
                let (schema, table) = table_args(args)?;
                self.connector
                    .query_json(
                        database,
                        FOREIGN_KEYS_SQL,
                        &[
                            SqlParam::string(schema.clone()),
                            SqlParam::string(table.clone()),
                            SqlParam::string(schema),
                            SqlParam::string(table),
                        ],
                    )
                    .await
            }
            InspectionOp::MissingIndexes => match optional_string(args, "table_name")? {
                Some(table) => {
                    let schema = optional_string(args, "schema")?
                        .unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
                    self.connector
                        .query_json(
                            database,
                            MISSING_INDEXES_FOR_TABLE_SQL,
                            &[SqlParam::string(table), SqlParam::string(schema)],
                        )
                        .await
                }
                None => {
                    self.connector
                        .query_json(database, MISSING_INDEXES_SQL, &[])
                        .await
                }
            },
            InspectionOp::DatabaseConfig => {
                self.connector
                    .query_json(database, DATABASE_CONFIG_SQL, &[])
                    .await
            }
            InspectionOp::CurrentUtcTime => Ok(json!({
                "utc_now": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            })
            .to_string()),
            InspectionOp::ExecutionPlan => {
                let query = require_string(args, "query")?;
                match self.connector.estimated_plan_xml(database, &query).await? {
                    Some(xml) => Ok(plan::summarize_plan(&xml)),
                    None => Ok(error_payload("no execution plan returned".to_string())),
                }
            }
            InspectionOp::ReadOnlyQuery => {
                let query = require_string(args, "query")?;
                if let Err(reason) = safety::check_read_only(&query) {
                    tracing::warn!(reason = %reason, "read-only query rejected");
                    return Ok(error_payload(reason));
                }
                self.connector.query_json(database, &query, &[]).await
            }
        }
    }
}

fn error_payload(message: String) -> String {
    json!({ "error": message }).to_string()
}

fn table_args(args: &serde_json::Value) -> Result<(String, String)> {
    let table = require_string(args, "table_name")?;
    let schema =
        optional_string(args, "schema")?.unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
    Ok((schema, table))
}

fn require_string(args: &serde_json::Value, key: &str) -> Result<String> {
    match args.get(key) {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(ToolError::InvalidArguments(format!(
            "key {key} must be a string, got {other}"
        ))),
        None => Err(ToolError::InvalidArguments(format!("missing key: {key}"))),
    }
}

fn optional_string(args: &serde_json::Value, key: &str) -> Result<Option<String>> {
    match args.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ToolError::InvalidArguments(format!(
            "key {key} must be a string, got {other}"
        ))),
    }
}

const LIST_TABLES_SQL: &str = r#"
SELECT
    s.name AS table_schema,
    t.name AS table_name,
    'BASE TABLE' AS table_type,
    SUM(ps.row_count) AS row_count,
    SUM(ps.used_page_count) * 8 / 1024 AS data_size_mb
FROM sys.tables t
JOIN sys.schemas s ON t.schema_id = s.schema_id
LEFT JOIN sys.dm_db_partition_stats ps
    ON t.object_id = ps.object_id AND ps.index_id IN (0, 1)
GROUP BY s.name, t.name
UNION ALL
SELECT s.name, v.name, 'VIEW', NULL, NULL
FROM sys.views v
JOIN sys.schemas s ON v.schema_id = s.schema_id
ORDER BY table_type, table_name
"#;

const TABLE_STRUCTURE_SQL: &str = r#"
SELECT
    c.COLUMN_NAME,
    c.DATA_TYPE,
    c.CHARACTER_MAXIMUM_LENGTH,
    c.NUMERIC_PRECISION,
    c.NUMERIC_SCALE,
    c.IS_NULLABLE,
    c.COLUMN_DEFAULT,
    CASE WHEN pk.COLUMN_NAME IS NOT NULL THEN 'YES' ELSE 'NO' END AS IS_PRIMARY_KEY
FROM INFORMATION_SCHEMA.COLUMNS c
LEFT JOIN (
    SELECT ku.TABLE_SCHEMA, ku.TABLE_NAME, ku.COLUMN_NAME
    FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
    JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE ku
        ON tc.CONSTRAINT_NAME = ku.CONSTRAINT_NAME
        AND tc.TABLE_SCHEMA = ku.TABLE_SCHEMA
    WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
) pk ON c.TABLE_SCHEMA = pk.TABLE_SCHEMA
    AND c.TABLE_NAME = pk.TABLE_NAME
    AND c.COLUMN_NAME = pk.COLUMN_NAME
WHERE c.TABLE_SCHEMA = ? AND c.TABLE_NAME = ?
ORDER BY c.ORDINAL_POSITION
"#;

const TABLE_INDEXES_SQL: &str = r#"
SELECT
    i.name AS index_name,
    i.type_desc AS index_type,
    i.is_unique,
    i.is_primary_key,
    STRING_AGG(
        CASE WHEN ic.is_included_column = 0 THEN c.name END, ', '
    ) WITHIN GROUP (ORDER BY ic.key_ordinal) AS key_columns,
    STRING_AGG(
        CASE WHEN ic.is_included_column = 1 THEN c.name END, ', '
    ) WITHIN GROUP (ORDER BY ic.key_ordinal) AS included_columns,
    i.filter_definition,
    MAX(ps.row_count) AS row_count,
    MAX(ps.used_page_count) * 8 / 1024 AS size_mb,
    DATEDIFF(day, MAX(STATS_DATE(i.object_id, i.index_id)), GETUTCDATE()) AS last_stats_update_days_ago
FROM sys.indexes i
JOIN sys.index_columns ic ON i.object_id = ic.object_id AND i.index_id = ic.index_id
JOIN sys.columns c ON ic.object_id = c.object_id AND ic.column_id = c.column_id
JOIN sys.tables t ON i.object_id = t.object_id
JOIN sys.schemas s ON t.schema_id = s.schema_id
LEFT JOIN sys.dm_db_partition_stats ps
    ON i.object_id = ps.object_id AND i.index_id = ps.index_id
WHERE s.name = ? AND t.name = ?
  AND i.name IS NOT NULL
GROUP BY i.object_id, i.index_id, i.name, i.type_desc, i.is_unique, i.is_primary_key, i.filter_definition
ORDER BY i.is_primary_key DESC, i.name
"#;

const TABLE_STATS_SQL: &str = r#"
SELECT
    s.name AS schema_name,
    t.name AS table_name,
    SUM(ps.row_count) AS row_count,
    SUM(ps.reserved_page_count) * 8 / 1024 AS reserved_mb,
    SUM(ps.used_page_count) * 8 / 1024 AS used_mb
FROM sys.tables t
JOIN sys.schemas s ON t.schema_id = s.schema_id
JOIN sys.dm_db_partition_stats ps ON t.object_id = ps.object_id
WHERE s.name = ? AND t.name = ? AND ps.index_id IN (0, 1)
GROUP BY s.name, t.name
"#;

const FOREIGN_KEYS_SQL: &str = r#"
SELECT
    fk.name AS fk_name,
    tp.name AS parent_table,
    sp.name AS parent_schema,
    cp.name AS parent_column,
    tr.name AS referenced_table,
    sr.name AS referenced_schema,
    cr.name AS referenced_column,
    fk.delete_referential_action_desc AS on_delete,
    fk.update_referential_action_desc AS on_update
FROM sys.foreign_keys fk
JOIN sys.foreign_key_columns fkc ON fk.object_id = fkc.constraint_object_id
JOIN sys.tables tp ON fkc.parent_object_id = tp.object_id
JOIN sys.schemas sp ON tp.schema_id = sp.schema_id
JOIN sys.columns cp ON fkc.parent_object_id = cp.object_id AND fkc.parent_column_id = cp.column_id
JOIN sys.tables tr ON fkc.referenced_object_id = tr.object_id
JOIN sys.schemas sr ON tr.schema_id = sr.schema_id
JOIN sys.columns cr ON fkc.referenced_object_id = cr.object_id AND fkc.referenced_column_id = cr.column_id
WHERE (sp.name = ? AND tp.name = ?)
   OR (sr.name = ? AND tr.name = ?)
ORDER BY fk.name
"#;

const MISSING_INDEXES_SQL: &str = r#"
SELECT
    s.name AS schema_name,
    OBJECT_NAME(mid.object_id) AS table_name,
    mid.equality_columns,
    mid.inequality_columns,
    mid.included_columns,
    migs.avg_user_impact,
    migs.user_seeks,
    migs.user_scans,
    migs.last_user_seek
FROM sys.dm_db_missing_index_details mid
JOIN sys.dm_db_missing_index_groups mig ON mid.index_handle = mig.index_handle
JOIN sys.dm_db_missing_index_group_stats migs ON mig.index_group_handle = migs.group_handle
JOIN sys.schemas s ON mid.object_id = OBJECT_ID(QUOTENAME(s.name) + '.' + QUOTENAME(OBJECT_NAME(mid.object_id)))
WHERE mid.database_id = DB_ID()
ORDER BY migs.avg_user_impact * (migs.user_seeks + migs.user_scans) DESC
"#;

const MISSING_INDEXES_FOR_TABLE_SQL: &str = r#"
SELECT
    s.name AS schema_name,
    OBJECT_NAME(mid.object_id) AS table_name,
    mid.equality_columns,
    mid.inequality_columns,
    mid.included_columns,
    migs.avg_user_impact,
    migs.user_seeks,
    migs.user_scans,
    migs.last_user_seek
FROM sys.dm_db_missing_index_details mid
JOIN sys.dm_db_missing_index_groups mig ON mid.index_handle = mig.index_handle
JOIN sys.dm_db_missing_index_group_stats migs ON mig.index_group_handle = migs.group_handle
JOIN sys.schemas s ON mid.object_id = OBJECT_ID(QUOTENAME(s.name) + '.' + QUOTENAME(OBJECT_NAME(mid.object_id)))
WHERE mid.database_id = DB_ID()
  AND OBJECT_NAME(mid.object_id) = ? AND s.name = ?
ORDER BY migs.avg_user_impact * (migs.user_seeks + migs.user_scans) DESC
"#;

const DATABASE_CONFIG_SQL: &str = r#"
SELECT
    name,
    compatibility_level,
    collation_name,
    recovery_model_desc,
    snapshot_isolation_state_desc,
    is_read_committed_snapshot_on,
    is_auto_create_stats_on,
    is_auto_update_stats_on,
    is_parameterization_forced
FROM sys.databases
WHERE name = DB_NAME()
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingConnector {
        calls: Arc<Mutex<Vec<(String, String, Vec<SqlParam>)>>>,
        plan_xml: Option<String>,
        fail: bool,
    }

    #[async_trait]
    impl SqlConnector for RecordingConnector {
        async fn list_databases(&self) -> Result<Vec<String>> {
            Ok(vec!["shop".to_string()])
        }

        async fn query_json(
            &self,
            database: &str,
            sql: &str,
            params: &[SqlParam],
        ) -> Result<String> {
            if self.fail {
                return Err(ToolError::Connector("login timeout".to_string()));
            }
            self.calls.lock().expect("calls lock").push((
                database.to_string(),
                sql.to_string(),
                params.to_vec(),
            ));
            Ok(json!([{ "ok": true }]).to_string())
        }

        async fn estimated_plan_xml(
            &self,
            _database: &str,
            _query: &str,
        ) -> Result<Option<String>> {
            Ok(self.plan_xml.clone())
        }
    }

    fn registry(connector: RecordingConnector) -> OpRegistry {
        OpRegistry::new(Arc::new(connector))
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_payload() {
        let reg = registry(RecordingConnector::default());
        let out = reg.dispatch("launch_rockets", &json!({}), "shop").await;
        let parsed: serde_json::Value = serde_json::from_str(&out).expect("error payload json");
        assert!(
            parsed["error"]
                .as_str()
                .expect("error text")
                .contains("launch_rockets")
        );
    }

    #[tokio::test]
    async fn connector_failure_becomes_error_payload() {
        let reg = registry(RecordingConnector {
            fail: true,
            ..RecordingConnector::default()
        });
        let out = reg.dispatch("list_tables", &json!({}), "shop").await;
        let parsed: serde_json::Value = serde_json::from_str(&out).expect("error payload json");
        assert!(
            parsed["error"]
                .as_str()
                .expect("error text")
                .contains("login timeout")
        );
    }

    #[tokio::test]
    async fn table_ops_default_the_schema() {
        let connector = RecordingConnector::default();
        let calls = connector.calls.clone();
        let reg = registry(connector);
        reg.dispatch("get_indexes", &json!({ "table_name": "orders" }), "shop")
            .await;

        let calls = calls.lock().expect("calls lock");
        assert_eq!(calls.len(), 1);
        let (database, _sql, params) = &calls[0];
        assert_eq!(database, "shop");
        assert_eq!(
            params,
            &vec![SqlParam::string("dbo"), SqlParam::string("orders")]
        );
    }

    #[tokio::test]
    async fn missing_table_name_becomes_error_payload() {
        let reg = registry(RecordingConnector::default());
        let out = reg.dispatch("get_table_structure", &json!({}), "shop").await;
        let parsed: serde_json::Value = serde_json::from_str(&out).expect("error payload json");
        assert!(
            parsed["error"]
                .as_str()
                .expect("error text")
                .contains("table_name")
        );
    }

    #[tokio::test]
    async fn read_only_query_is_gated_before_execution() {
        let connector = RecordingConnector::default();
        let calls = connector.calls.clone();
        let reg = registry(connector);
        let out = reg
            .dispatch("execute_read_query", &json!({ "query": "DROP TABLE x" }), "shop")
            .await;
        let parsed: serde_json::Value = serde_json::from_str(&out).expect("error payload json");
        assert!(parsed.get("error").is_some());
        assert!(calls.lock().expect("calls lock").is_empty());
    }

    #[tokio::test]
    async fn accepted_read_only_query_reaches_the_connector() {
        let connector = RecordingConnector::default();
        let calls = connector.calls.clone();
        let reg = registry(connector);
        reg.dispatch(
            "execute_read_query",
            &json!({ "query": "SELECT * FROM t" }),
            "shop",
        )
        .await;
        let calls = calls.lock().expect("calls lock");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "SELECT * FROM t");
    }

    #[tokio::test]
    async fn execution_plan_without_result_reports_error() {
        let reg = registry(RecordingConnector::default());
        let out = reg
            .dispatch("get_execution_plan", &json!({ "query": "SELECT 1" }), "shop")
            .await;
        let parsed: serde_json::Value = serde_json::from_str(&out).expect("payload json");
        assert_eq!(parsed["error"], "no execution plan returned");
    }

    #[tokio::test]
    async fn execution_plan_is_summarized() {
        let reg = registry(RecordingConnector {
            plan_xml: Some(
                r#"<ShowPlanXML><StmtSimple StatementText="SELECT 1" StatementEstRows="1" StatementSubTreeCost="0.001"/></ShowPlanXML>"#
                    .to_string(),
            ),
            ..RecordingConnector::default()
        });
        let out = reg
            .dispatch("get_execution_plan", &json!({ "query": "SELECT 1" }), "shop")
            .await;
        let parsed: serde_json::Value = serde_json::from_str(&out).expect("summary json");
        assert_eq!(parsed["statements"][0]["statement"], "SELECT 1");
    }

    #[tokio::test]
    async fn current_utc_time_needs_no_connector_round_trip() {
        let reg = registry(RecordingConnector::default());
        let out = reg.dispatch("get_current_utc_time", &json!({}), "shop").await;
        let parsed: serde_json::Value = serde_json::from_str(&out).expect("time payload json");
        assert!(parsed["utc_now"].as_str().expect("utc_now").ends_with('Z'));
    }

    #[test]
    fn catalog_definitions_cover_every_operation_once() {
        let defs = OpRegistry::definitions();
        assert_eq!(defs.len(), InspectionOp::ALL.len());
        for op in InspectionOp::ALL {
            assert_eq!(InspectionOp::parse(op.name()), Some(op));
            let def = defs
                .iter()
                .find(|d| d.name == op.name())
                .expect("definition exists for op");
            assert_eq!(def.parameters["type"], "object");
        }
    }
}
