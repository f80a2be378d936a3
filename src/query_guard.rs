//! Read-only SQL execution for the `queryDatabase` tool.
//!
//! Model-written SQL goes through two layers:
//! - a lexical check (`validate_statement`) that only lets a single
//!   `SELECT`/`WITH` statement through, and
//! - execution inside a `READ ONLY` transaction with a statement timeout,
//!   a row limit of `cap + 1`, and an unconditional rollback.
//!
//! Failures never escape as `Err`: they come back as a `QueryToolResult`
//! with `success: false` so the model can correct itself.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("Rejected statement: {0}")]
    Rejected(String),

    #[error("Query failed: {0}")]
    Execution(String),

    #[error("Query timed out after {0}s")]
    Timeout(u64),
}

// ---------------------------------------------------------------------------
// Statement validation
// ---------------------------------------------------------------------------

/// Keywords that write or change session state. Anything else that could
/// only lead a statement is already excluded by the SELECT/WITH check, and
/// the READ ONLY transaction stops the rest.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE",
    "COPY", "MERGE", "VACUUM", "REINDEX", "CLUSTER", "SET", "RESET", "LISTEN", "NOTIFY",
    "UNLISTEN", "EXECUTE", "PREPARE", "DEALLOCATE", "REFRESH", "IMPORT", "DISCARD",
    "CHECKPOINT", "INTO",
];

/// Server functions with side effects or filesystem/network access.
const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "PG_SLEEP", "PG_SLEEP_FOR", "PG_SLEEP_UNTIL", "PG_TERMINATE_BACKEND", "PG_CANCEL_BACKEND",
    "PG_READ_FILE", "PG_READ_BINARY_FILE", "PG_LS_DIR", "PG_RELOAD_CONF", "PG_ROTATE_LOGFILE",
    "LO_IMPORT", "LO_EXPORT", "DBLINK", "DBLINK_EXEC", "SET_CONFIG", "PG_ADVISORY_LOCK",
    "PG_ADVISORY_XACT_LOCK", "NEXTVAL", "SETVAL",
];

static WORD_RE: OnceLock<Regex> = OnceLock::new();

fn word_re() -> &'static Regex {
    WORD_RE.get_or_init(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_$]*").unwrap())
}

/// Replace string literals, quoted identifiers, dollar-quoted bodies and
/// comments with spaces so only real SQL tokens remain. Errors on anything
/// left unterminated.
///
/// Every masked character becomes as many spaces as it has UTF-8 bytes, so
/// byte offsets into the mask are byte offsets into `sql`.
fn mask_non_code(sql: &str) -> Result<String, GuardError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let start = i;
        match c {
            '\'' | '"' => {
                let quote = c;
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(GuardError::Rejected(
                                "unterminated quoted string or identifier".into(),
                            ));
                        }
                        Some(&ch) if ch == quote => {
                            // doubled quote is an escaped quote
                            if chars.get(i + 1) == Some(&quote) {
                                i += 2;
                                continue;
                            }
                            i += 1;
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
                blank(&mut out, &chars[start..i]);
            }
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                blank(&mut out, &chars[start..i]);
            }
            '/' if next == Some('*') => {
                let mut depth = 1;
                i += 2;
                while depth > 0 {
                    match (chars.get(i), chars.get(i + 1)) {
                        (None, _) => {
                            return Err(GuardError::Rejected("unterminated block comment".into()));
                        }
                        (Some('*'), Some('/')) => {
                            depth -= 1;
                            i += 2;
                        }
                        (Some('/'), Some('*')) => {
                            depth += 1;
                            i += 2;
                        }
                        _ => i += 1,
                    }
                }
                blank(&mut out, &chars[start..i]);
            }
            '$' if dollar_tag(&chars, i).is_some() => {
                let tag = dollar_tag(&chars, i).unwrap_or_default();
                let tag_chars: Vec<char> = tag.chars().collect();
                i += tag_chars.len();
                loop {
                    if i >= chars.len() {
                        return Err(GuardError::Rejected("unterminated dollar-quoted string".into()));
                    }
                    if chars[i..].starts_with(&tag_chars) {
                        i += tag_chars.len();
                        break;
                    }
                    i += 1;
                }
                blank(&mut out, &chars[start..i]);
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    debug_assert_eq!(out.len(), sql.len());
    Ok(out)
}

fn blank(out: &mut String, span: &[char]) {
    for ch in span {
        out.extend(std::iter::repeat_n(' ', ch.len_utf8()));
    }
}

/// `$tag$` or `$$` opening at `start`, if any. Positional parameters like
/// `$1` are not dollar quotes.
fn dollar_tag(chars: &[char], start: usize) -> Option<String> {
    if chars.get(start) != Some(&'$') {
        return None;
    }
    let mut j = start + 1;
    while let Some(&c) = chars.get(j) {
        if c == '$' {
            let tag: String = chars[start..=j].iter().collect();
            let first = chars.get(start + 1).copied();
            if first.is_some_and(|f| f.is_ascii_digit()) {
                return None;
            }
            return Some(tag);
        }
        if !(c.is_alphanumeric() || c == '_') {
            return None;
        }
        j += 1;
    }
    None
}

/// Check that `sql` is exactly one read-only statement. Returns the
/// statement with surrounding whitespace and a single trailing `;` removed,
/// ready to be wrapped in a subquery.
pub fn validate_statement(sql: &str) -> Result<String, GuardError> {
    let masked = mask_non_code(sql)?;

    let masked_trimmed = masked.trim_end();
    let masked_body = masked_trimmed.strip_suffix(';').unwrap_or(masked_trimmed);
    let end = masked_body.len();
    if masked_body.contains(';') {
        return Err(GuardError::Rejected(
            "multiple statements are not allowed; send exactly one SELECT".into(),
        ));
    }

    let mut words = word_re().find_iter(masked_body).map(|m| m.as_str().to_ascii_uppercase());
    match words.next().as_deref() {
        None => return Err(GuardError::Rejected("empty statement".into())),
        Some("SELECT") | Some("WITH") => {}
        Some(other) => {
            return Err(GuardError::Rejected(format!(
                "only SELECT or WITH queries are allowed (found {other})"
            )));
        }
    }

    for word in word_re().find_iter(masked_body).map(|m| m.as_str().to_ascii_uppercase()) {
        if FORBIDDEN_KEYWORDS.contains(&word.as_str()) {
            return Err(GuardError::Rejected(format!(
                "{word} is not allowed in a read-only query"
            )));
        }
        if FORBIDDEN_FUNCTIONS.contains(&word.as_str()) {
            return Err(GuardError::Rejected(format!("function {word} is not allowed")));
        }
    }

    // The mask is byte-aligned with `sql`, so cutting the source at the end
    // of the masked body drops the trailing `;` along with any comment after it.
    Ok(sql[..end].trim().to_string())
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Rows as JSON objects keyed by column name, in column order.
pub type JsonRow = Map<String, Value>;

/// Runs an already-validated statement and returns at most `limit` rows.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn fetch(&self, sql: &str, limit: usize) -> Result<Vec<JsonRow>, GuardError>;
}

/// Postgres runner: read-only transaction, local statement timeout, rollback.
pub struct PgQueryRunner {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PgQueryRunner {
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self { pool, statement_timeout }
    }
}

#[async_trait]
impl QueryRunner for PgQueryRunner {
    async fn fetch(&self, sql: &str, limit: usize) -> Result<Vec<JsonRow>, GuardError> {
        let exec = |e: sqlx::Error| GuardError::Execution(e.to_string());

        let mut tx = self.pool.begin().await.map_err(exec)?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(exec)?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await
        .map_err(exec)?;

        // Newlines keep a trailing `--` comment from swallowing the wrapper.
        let wrapped = format!("SELECT row_to_json(q)::text FROM (\n{sql}\n) AS q LIMIT {limit}");
        let raw: Vec<String> = sqlx::query_scalar(&wrapped)
            .fetch_all(&mut *tx)
            .await
            .map_err(exec)?;

        if let Err(e) = tx.rollback().await {
            tracing::warn!("query_guard: rollback failed: {}", e);
        }

        raw.iter().map(|text| decode_row(text)).collect()
    }
}

/// One `row_to_json` object. Postgres happily emits the same key twice
/// (`SELECT s.branch, t.branch`); a map would silently keep only the last,
/// so duplicates are an error the model can fix by aliasing.
fn decode_row(text: &str) -> Result<JsonRow, GuardError> {
    serde_json::from_str::<UniqueKeyRow>(text)
        .map(|row| row.0)
        .map_err(|e| GuardError::Execution(format!("row decode failed: {e}")))
}

struct UniqueKeyRow(JsonRow);

impl<'de> Deserialize<'de> for UniqueKeyRow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = UniqueKeyRow;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object per row")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut row = JsonRow::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    if row.contains_key(&key) {
                        return Err(de::Error::custom(format!(
                            "duplicate column name \"{key}\"; give every output column a unique alias"
                        )));
                    }
                    row.insert(key, value);
                }
                Ok(UniqueKeyRow(row))
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}

// ---------------------------------------------------------------------------
// Tool result
// ---------------------------------------------------------------------------

/// What the model sees after calling `queryDatabase`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryToolResult {
    pub success: bool,
    pub purpose: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<JsonRow>,
    pub row_count: usize,
    pub truncated: bool,
}

impl QueryToolResult {
    pub fn failure(purpose: &str, error: &GuardError) -> Self {
        Self {
            success: false,
            purpose: purpose.to_string(),
            error: Some(error.to_string()),
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            truncated: false,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Keep at most `cap` rows; report whether anything was dropped.
pub fn cap_rows(mut rows: Vec<JsonRow>, cap: usize) -> (Vec<JsonRow>, bool) {
    let truncated = rows.len() > cap;
    rows.truncate(cap);
    (rows, truncated)
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

pub struct QueryGuard {
    runner: Arc<dyn QueryRunner>,
    row_cap: usize,
    timeout: Duration,
}

impl QueryGuard {
    pub fn new(runner: Arc<dyn QueryRunner>, row_cap: usize, timeout: Duration) -> Self {
        Self { runner, row_cap, timeout }
    }

    pub async fn execute(&self, sql: &str, purpose: &str) -> QueryToolResult {
        let statement = match validate_statement(sql) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(purpose, "query_guard: {}", e);
                return QueryToolResult::failure(purpose, &e);
            }
        };

        let fetched =
            tokio::time::timeout(self.timeout, self.runner.fetch(&statement, self.row_cap + 1))
                .await
                .unwrap_or(Err(GuardError::Timeout(self.timeout.as_secs())));

        match fetched {
            Ok(rows) => {
                let (rows, truncated) = cap_rows(rows, self.row_cap);
                let columns = rows
                    .first()
                    .map(|r| r.keys().cloned().collect())
                    .unwrap_or_default();
                tracing::info!(purpose, rows = rows.len(), truncated, "query_guard: query ok");
                QueryToolResult {
                    success: true,
                    purpose: purpose.to_string(),
                    error: None,
                    columns,
                    row_count: rows.len(),
                    rows,
                    truncated,
                }
            }
            Err(e) => {
                tracing::warn!(purpose, "query_guard: {}", e);
                QueryToolResult::failure(purpose, &e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Returns `available` synthetic rows, honouring the requested limit.
    struct FakeRunner {
        available: usize,
        seen: Mutex<Vec<(String, usize)>>,
    }

    impl FakeRunner {
        fn new(available: usize) -> Self {
            Self { available, seen: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl QueryRunner for FakeRunner {
        async fn fetch(&self, sql: &str, limit: usize) -> Result<Vec<JsonRow>, GuardError> {
            self.seen.lock().unwrap().push((sql.to_string(), limit));
            Ok((0..self.available.min(limit))
                .map(|i| {
                    let mut row = Map::new();
                    row.insert("store".into(), json!(format!("store-{i}")));
                    row.insert("total_pairs".into(), json!(i));
                    row
                })
                .collect())
        }
    }

    struct FailingRunner;

    #[async_trait]
    impl QueryRunner for FailingRunner {
        async fn fetch(&self, _sql: &str, _limit: usize) -> Result<Vec<JsonRow>, GuardError> {
            Err(GuardError::Execution("column \"branch\" does not exist".into()))
        }
    }

    struct SlowRunner;

    #[async_trait]
    impl QueryRunner for SlowRunner {
        async fn fetch(&self, _sql: &str, _limit: usize) -> Result<Vec<JsonRow>, GuardError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    fn guard(runner: impl QueryRunner + 'static) -> QueryGuard {
        QueryGuard::new(Arc::new(runner), 200, Duration::from_secs(30))
    }

    #[test]
    fn rejects_multi_statement_and_writes() {
        assert!(matches!(
            validate_statement("DROP TABLE x; SELECT 1"),
            Err(GuardError::Rejected(_))
        ));
        assert!(matches!(
            validate_statement("DELETE FROM sales"),
            Err(GuardError::Rejected(_))
        ));
        assert!(matches!(
            validate_statement("SELECT 1; SELECT 2"),
            Err(GuardError::Rejected(_))
        ));
        assert!(matches!(
            validate_statement("WITH gone AS (DELETE FROM sales RETURNING *) SELECT * FROM gone"),
            Err(GuardError::Rejected(_))
        ));
        assert!(matches!(
            validate_statement("SELECT * INTO backup FROM core.sales_with_product"),
            Err(GuardError::Rejected(_))
        ));
        assert!(matches!(
            validate_statement("SELECT pg_sleep(60)"),
            Err(GuardError::Rejected(_))
        ));
        assert!(matches!(validate_statement("   "), Err(GuardError::Rejected(_))));
    }

    #[test]
    fn accepts_single_selects() {
        assert_eq!(validate_statement("SELECT 1").unwrap(), "SELECT 1");
        assert_eq!(validate_statement("  select 1 ;  ").unwrap(), "select 1");
        assert!(validate_statement(
            "WITH t AS (SELECT branch, SUM(quantity) AS total_pairs FROM core.sales_with_product \
             WHERE is_intercompany = FALSE GROUP BY branch) SELECT * FROM t ORDER BY 2 DESC LIMIT 10"
        )
        .is_ok());
    }

    #[test]
    fn literals_and_comments_are_not_scanned() {
        assert!(validate_statement(
            "SELECT article FROM core.sales_with_product WHERE UPPER(article) NOT LIKE '%DROP; BAG%'"
        )
        .is_ok());
        assert!(validate_statement("SELECT 1 -- delete later").is_ok());
        assert!(validate_statement("SELECT /* update; */ 1").is_ok());
        assert!(validate_statement("SELECT \"update\" FROM t").is_ok());
        assert!(validate_statement("SELECT $$drop table x;$$ AS s").is_ok());
        assert!(validate_statement("SELECT 'it''s fine'").is_ok());
    }

    #[test]
    fn unterminated_input_is_malformed() {
        assert!(matches!(validate_statement("SELECT 'oops"), Err(GuardError::Rejected(_))));
        assert!(matches!(validate_statement("SELECT /* 1"), Err(GuardError::Rejected(_))));
    }

    #[test]
    fn updated_at_column_is_not_a_keyword() {
        assert!(validate_statement("SELECT updated_at, set_id FROM t").is_ok());
    }

    #[test]
    fn trailing_semicolon_is_cut_even_before_a_comment() {
        assert_eq!(validate_statement("SELECT 1; -- top stores").unwrap(), "SELECT 1");
        assert_eq!(validate_statement("SELECT 1 /* done */ ;").unwrap(), "SELECT 1");
        assert_eq!(
            validate_statement("SELECT 'toko ✓; baru' AS s; /* ✓ */").unwrap(),
            "SELECT 'toko ✓; baru' AS s"
        );
        // comment-only tail without `;` is dropped too
        assert_eq!(validate_statement("SELECT 1 -- delete later").unwrap(), "SELECT 1");
    }

    #[test]
    fn mask_keeps_byte_offsets() {
        let sql = "SELECT 'Café' AS n /* ü */, \"Größe\" FROM t";
        let masked = mask_non_code(sql).unwrap();
        assert_eq!(masked.len(), sql.len());
        assert_eq!(masked.find("FROM"), sql.find("FROM"));
    }

    #[test]
    fn harmless_words_are_not_keywords() {
        for sql in [
            "SELECT comment, security, lock, call, analyze FROM t",
            "SELECT article AS comment FROM core.sales_with_product",
        ] {
            assert!(validate_statement(sql).is_ok(), "{sql}");
        }
    }

    #[test]
    fn duplicate_output_columns_are_an_error() {
        let err = decode_row(r#"{"branch":"Bali","branch":"Jatim"}"#).unwrap_err();
        assert!(matches!(&err, GuardError::Execution(m) if m.contains("duplicate column name \"branch\"")));

        let row = decode_row(r#"{"branch":"Bali","total_pairs":12}"#).unwrap();
        assert_eq!(row.keys().collect::<Vec<_>>(), ["branch", "total_pairs"]);
        assert!(decode_row("[1,2]").is_err());
    }

    #[test]
    fn cap_rows_truncates() {
        let rows: Vec<JsonRow> = (0..5).map(|_| Map::new()).collect();
        let (kept, truncated) = cap_rows(rows.clone(), 3);
        assert_eq!(kept.len(), 3);
        assert!(truncated);
        let (kept, truncated) = cap_rows(rows, 5);
        assert_eq!(kept.len(), 5);
        assert!(!truncated);
    }

    #[tokio::test]
    async fn five_hundred_rows_are_capped_at_two_hundred() {
        let g = guard(FakeRunner::new(500));
        let res = g.execute("SELECT * FROM core.stock_with_product", "stock rows").await;
        assert!(res.success);
        assert_eq!(res.rows.len(), 200);
        assert_eq!(res.row_count, 200);
        assert!(res.truncated);
        assert_eq!(res.columns, vec!["store".to_string(), "total_pairs".to_string()]);
    }

    #[tokio::test]
    async fn fifty_rows_are_not_truncated() {
        let g = guard(FakeRunner::new(50));
        let res = g.execute("SELECT 1", "small").await;
        assert!(res.success);
        assert_eq!(res.rows.len(), 50);
        assert!(!res.truncated);
    }

    #[tokio::test]
    async fn runner_is_asked_for_one_extra_row() {
        let runner = Arc::new(FakeRunner::new(0));
        let g = QueryGuard::new(runner.clone(), 200, Duration::from_secs(30));
        g.execute("SELECT 1;", "probe").await;
        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("SELECT 1".to_string(), 201)]);
    }

    #[tokio::test]
    async fn rejected_statement_is_structured_and_never_runs() {
        let runner = Arc::new(FakeRunner::new(10));
        let g = QueryGuard::new(runner.clone(), 200, Duration::from_secs(30));
        let res = g.execute("DELETE FROM sales", "cleanup").await;
        assert!(!res.success);
        assert_eq!(res.row_count, 0);
        assert!(res.rows.is_empty() && res.columns.is_empty());
        assert!(res.error.unwrap().starts_with("Rejected statement"));
        assert!(runner.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn execution_errors_are_structured() {
        let res = guard(FailingRunner).execute("SELECT branch FROM core.stock_with_product", "x").await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("does not exist"));
        let v = QueryToolResult::failure("p", &GuardError::Timeout(1)).to_value();
        assert_eq!(v["rowCount"], 0);
        assert_eq!(v["success"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_queries_time_out() {
        let g = QueryGuard::new(Arc::new(SlowRunner), 200, Duration::from_secs(2));
        let res = g.execute("SELECT 1", "slow").await;
        assert!(!res.success);
        assert_eq!(res.error.as_deref(), Some("Query timed out after 2s"));
    }
}
