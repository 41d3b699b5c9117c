use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rows returned by an adapter. Each row is a JSON object keyed by column
/// name; no driver row type leaks through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Value>,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<serde_json::Value>, execution_time_ms: u64) -> Self {
        Self {
            columns,
            row_count: rows.len(),
            rows,
            execution_time_ms,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    #[serde(default)]
    pub max_rows: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl QueryOptions {
    pub fn with_max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }
}

/// A validated statement plus everything the caller should surface about
/// how it ran
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryExecution {
    pub id: String,
    pub original_sql: String,
    pub executed_sql: String,
    pub limit_applied: bool,
    pub complexity: u32,
    pub warnings: Vec<String>,
    pub timeout_secs: u64,
    pub attempts: u32,
    pub total_time_ms: u64,
    pub executed_at: DateTime<Utc>,
    pub result: QueryResult,
}

impl QueryExecution {
    pub fn new(original_sql: String, executed_sql: String, result: QueryResult) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            limit_applied: false,
            complexity: 0,
            warnings: Vec::new(),
            timeout_secs: 0,
            attempts: 1,
            total_time_ms: 0,
            executed_at: Utc::now(),
            original_sql,
            executed_sql,
            result,
        }
    }
}
