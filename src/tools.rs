//! Tools the assistant can call during a turn.
//!
//! There is exactly one: `queryDatabase`, backed by the [`QueryGuard`].
//! The dispatcher never fails: bad names and bad arguments come back as a
//! structured failure object the model can read and correct.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::query_guard::{GuardError, QueryGuard, QueryToolResult};

pub const QUERY_DATABASE: &str = "queryDatabase";

/// Function-calling declaration handed to the model backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

pub fn query_database_spec() -> ToolSpec {
    ToolSpec {
        name: QUERY_DATABASE,
        description: "Execute a read-only SQL query against the Zuma PostgreSQL database. \
            Use core.sales_with_product for sales analysis and core.stock_with_product for stock analysis. \
            ALWAYS include mandatory filters: is_intercompany = FALSE and exclude non-product items. \
            ALWAYS add LIMIT clause for non-aggregation queries.",
        parameters: json!({
            "type": "object",
            "properties": {
                "sql": {
                    "type": "string",
                    "description": "The SELECT SQL query to execute against the database"
                },
                "purpose": {
                    "type": "string",
                    "description": "Brief description of what this query is trying to find out"
                }
            },
            "required": ["sql", "purpose"]
        }),
    }
}

pub fn tool_specs() -> Vec<ToolSpec> {
    vec![query_database_spec()]
}

#[derive(Debug, Deserialize)]
struct QueryDatabaseArgs {
    sql: String,
    #[serde(default)]
    purpose: String,
}

/// Parse the raw argument string the model produced. Some models send an
/// empty string for "no arguments"; that is treated as `{}`.
pub fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| format!("Tool arguments are not valid JSON: {e}"))
}

/// Run one tool call and return the JSON result to feed back to the model.
pub async fn execute_tool(guard: &QueryGuard, name: &str, args: &Value) -> Value {
    match name {
        QUERY_DATABASE => match QueryDatabaseArgs::deserialize(args) {
            Ok(a) => guard.execute(&a.sql, &a.purpose).await.to_value(),
            Err(e) => {
                let purpose = args["purpose"].as_str().unwrap_or_default();
                QueryToolResult::failure(
                    purpose,
                    &GuardError::Rejected(format!("invalid queryDatabase arguments: {e}")),
                )
                .to_value()
            }
        },
        other => {
            tracing::warn!(tool = other, "tools: model requested unknown tool");
            tool_failure(&format!("Unknown tool: {other}. Available tools: {QUERY_DATABASE}"))
        }
    }
}

/// Generic failure shape for problems that happen before a tool runs.
pub fn tool_failure(message: &str) -> Value {
    json!({ "success": false, "error": message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_guard::{JsonRow, QueryRunner};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct OneRow;

    #[async_trait]
    impl QueryRunner for OneRow {
        async fn fetch(&self, _sql: &str, _limit: usize) -> Result<Vec<JsonRow>, GuardError> {
            let mut row = JsonRow::new();
            row.insert("n".into(), json!(1));
            Ok(vec![row])
        }
    }

    fn guard() -> QueryGuard {
        QueryGuard::new(Arc::new(OneRow), 200, Duration::from_secs(5))
    }

    #[test]
    fn query_tool_requires_sql_and_purpose() {
        let spec = query_database_spec();
        assert_eq!(spec.name, "queryDatabase");
        assert_eq!(spec.parameters["required"], json!(["sql", "purpose"]));
    }

    #[test]
    fn empty_arguments_are_an_empty_object() {
        assert_eq!(parse_arguments("  ").unwrap(), json!({}));
        assert!(parse_arguments("{\"sql\": ").is_err());
    }

    #[tokio::test]
    async fn dispatches_query_database() {
        let out = execute_tool(&guard(), QUERY_DATABASE, &json!({"sql": "SELECT 1 AS n", "purpose": "probe"})).await;
        assert_eq!(out["success"], true);
        assert_eq!(out["purpose"], "probe");
        assert_eq!(out["rowCount"], 1);
        assert_eq!(out["columns"], json!(["n"]));
    }

    #[tokio::test]
    async fn missing_sql_is_a_structured_failure() {
        let out = execute_tool(&guard(), QUERY_DATABASE, &json!({"purpose": "oops"})).await;
        assert_eq!(out["success"], false);
        assert_eq!(out["purpose"], "oops");
        assert!(out["error"].as_str().unwrap().contains("sql"));
    }

    #[tokio::test]
    async fn unknown_tool_is_a_structured_failure() {
        let out = execute_tool(&guard(), "dropEverything", &json!({})).await;
        assert_eq!(out["success"], false);
        assert!(out["error"].as_str().unwrap().contains("Unknown tool"));
    }
}
