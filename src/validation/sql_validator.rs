use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::sql_text::{self, LexicalRules};
use crate::models::{DatabaseError, DbResult, Dialect};
use crate::services::database::DatabaseAdapter;

const CARTESIAN_PENALTY: u32 = 50;

static DANGEROUS_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(drop|delete|truncate|insert|update|alter|create|grant|revoke|exec)\b")
        .expect("keyword pattern is valid")
});
static LEADING_VERB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(select|with)\b").expect("leading verb pattern is valid"));
static JOIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bjoin\b").expect("join pattern is valid"));
static JOIN_CONDITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(on|using)\b").expect("join condition pattern is valid"));
static SUBQUERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\(\s*select\b").expect("subquery pattern is valid"));
static AGGREGATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(count|sum|avg|min|max)\s*\(").expect("aggregation pattern is valid")
});
static WILDCARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bselect\s+(?:distinct\s+)?(?:top\s+\d+\s+)?(?:[\w"`\[\]]+\.)?\*"#)
        .expect("wildcard pattern is valid")
});

/// Functions and constructs that reach outside the database, per engine
static DENIED_FUNCTIONS: Lazy<Vec<(Dialect, &'static str, Regex)>> = Lazy::new(|| {
    [
        (Dialect::PostgreSql, "pg_read_file", r"\bpg_read_file\s*\("),
        (Dialect::PostgreSql, "pg_read_binary_file", r"\bpg_read_binary_file\s*\("),
        (Dialect::PostgreSql, "pg_ls_dir", r"\bpg_ls_dir\s*\("),
        (Dialect::PostgreSql, "pg_stat_file", r"\bpg_stat_file\s*\("),
        (Dialect::PostgreSql, "lo_import", r"\blo_import\s*\("),
        (Dialect::PostgreSql, "lo_export", r"\blo_export\s*\("),
        (Dialect::PostgreSql, "dblink", r"\bdblink\w*\s*\("),
        (Dialect::PostgreSql, "pg_sleep", r"\bpg_sleep\w*\s*\("),
        (Dialect::MySql, "load_file", r"\bload_file\s*\("),
        (Dialect::MySql, "sleep", r"\bsleep\s*\("),
        (Dialect::MySql, "benchmark", r"\bbenchmark\s*\("),
        (Dialect::MySql, "into outfile", r"\binto\s+outfile\b"),
        (Dialect::MySql, "into dumpfile", r"\binto\s+dumpfile\b"),
        (Dialect::Sqlite, "load_extension", r"\bload_extension\s*\("),
        (Dialect::Sqlite, "readfile", r"\breadfile\s*\("),
        (Dialect::Sqlite, "writefile", r"\bwritefile\s*\("),
        (Dialect::SqlServer, "xp_cmdshell", r"\bxp_cmdshell\b"),
        (Dialect::SqlServer, "openrowset", r"\bopenrowset\s*\("),
        (Dialect::SqlServer, "opendatasource", r"\bopendatasource\s*\("),
        (Dialect::SqlServer, "openquery", r"\bopenquery\s*\("),
        (Dialect::SqlServer, "sp_executesql", r"\bsp_executesql\b"),
        (Dialect::SqlServer, "waitfor", r"\bwaitfor\b"),
    ]
    .into_iter()
    .map(|(dialect, name, pattern)| {
        let regex = Regex::new(&format!("(?i){}", pattern)).expect("denylist pattern is valid");
        (dialect, name, regex)
    })
    .collect()
});

/// Row cap and timeout tiers applied by [`QuerySafetyValidator`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub default_max_rows: u64,
    pub default_timeout_secs: u64,
    pub medium_timeout_secs: u64,
    pub extended_timeout_secs: u64,
    /// Highest complexity still served by the default tier
    pub medium_threshold: u32,
    /// Highest complexity still served by the medium tier
    pub extended_threshold: u32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            default_max_rows: 1000,
            default_timeout_secs: 30,
            medium_timeout_secs: 60,
            extended_timeout_secs: 120,
            medium_threshold: 10,
            extended_threshold: 50,
        }
    }
}

/// Verdict for one statement. A non-empty `errors` means it must never run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub safe: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub complexity: u32,
    pub recommended_timeout_secs: u64,
}

/// A statement that passed validation and has its row limit applied
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub original_sql: String,
    pub sql: String,
    pub limit_applied: bool,
    pub max_rows: u64,
    pub report: ValidationReport,
}

/// Gatekeeper run before any statement reaches a connection.
///
/// Works lexically: comments are stripped and string literals blanked
/// before scanning, so `SELECT 'drop'` passes while `SELECT 1; DROP TABLE t`
/// does not. Syntax is checked separately by the adapter.
#[derive(Debug, Clone, Default)]
pub struct QuerySafetyValidator {
    config: ValidatorConfig,
}

impl QuerySafetyValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Check a statement against every rule and score it
    pub fn validate(&self, sql: &str, dialect: Dialect) -> ValidationReport {
        let rules = LexicalRules::for_dialect(dialect);
        let stripped = sql_text::sanitize(sql, rules);
        let scan = sql_text::blank_string_literals(&stripped, rules);

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if scan.trim().is_empty() {
            errors.push("Empty SQL query".to_string());
        } else if !LEADING_VERB.is_match(&scan) {
            errors.push("Only SELECT or WITH queries are permitted".to_string());
        }

        if sql_text::has_inner_terminator(&stripped, rules) {
            errors.push("Multiple statements are not allowed".to_string());
        }

        let mut seen = Vec::new();
        for m in DANGEROUS_KEYWORDS.find_iter(&scan) {
            let keyword = m.as_str().to_uppercase();
            if !seen.contains(&keyword) {
                errors.push(format!("Dangerous keyword '{}' is not allowed", keyword));
                seen.push(keyword);
            }
        }

        for (_, name, regex) in DENIED_FUNCTIONS.iter().filter(|(d, _, _)| *d == dialect) {
            if regex.is_match(&scan) {
                errors.push(format!("'{}' is not allowed on {}", name, dialect));
            }
        }

        let joins = JOIN.find_iter(&scan).count() as u32;
        let conditions = JOIN_CONDITION.find_iter(&scan).count() as u32;
        let subqueries = SUBQUERY.find_iter(&scan).count() as u32;
        let aggregations = AGGREGATION.find_iter(&scan).count() as u32;
        let wildcard = u32::from(WILDCARD.is_match(&scan));

        let mut complexity = 2 * joins + 5 * subqueries + aggregations + wildcard;
        if joins > conditions {
            complexity += CARTESIAN_PENALTY;
            warnings.push(format!(
                "{} JOIN(s) but only {} join condition(s): possible cartesian product",
                joins, conditions
            ));
        }

        let recommended_timeout_secs = self.timeout_for(complexity);
        if complexity > self.config.extended_threshold {
            warnings.push(format!(
                "High complexity score {}; timeout raised to {}s",
                complexity, recommended_timeout_secs
            ));
        }

        debug!(
            dialect = %dialect,
            complexity,
            errors = errors.len(),
            warnings = warnings.len(),
            "Validated query"
        );

        ValidationReport {
            safe: errors.is_empty(),
            errors,
            warnings,
            complexity,
            recommended_timeout_secs,
        }
    }

    /// Static tier lookup
    pub fn timeout_for(&self, complexity: u32) -> u64 {
        if complexity <= self.config.medium_threshold {
            self.config.default_timeout_secs
        } else if complexity <= self.config.extended_threshold {
            self.config.medium_timeout_secs
        } else {
            self.config.extended_timeout_secs
        }
    }

    /// Validate, syntax-check with the adapter, then apply its row limit.
    /// Fails without touching the network.
    pub fn prepare(
        &self,
        sql: &str,
        adapter: &dyn DatabaseAdapter,
        max_rows: Option<u64>,
    ) -> DbResult<PreparedQuery> {
        let report = self.validate(sql, adapter.dialect());
        if !report.safe {
            return Err(DatabaseError::validation(report.errors));
        }

        adapter.validate_query(sql)?;

        let max_rows = max_rows.unwrap_or(self.config.default_max_rows);
        let sanitized = adapter.sanitize_query(sql);
        let limited = adapter.enforce_row_limit(&sanitized, max_rows);

        Ok(PreparedQuery {
            original_sql: sql.to_string(),
            limit_applied: limited != sanitized,
            sql: limited,
            max_rows,
            report,
        })
    }
}
