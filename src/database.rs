use chrono::{DateTime, Utc};
use mobc::{Manager, Pool};
use rusqlite::{params, Connection, Result as SqliteResult, Row};
use std::path::Path;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::models::ListInfo;
use crate::stats::ListCalculations;

pub struct SqliteManager {
    db_path: String,
}

impl SqliteManager {
    pub fn new(db_path: String) -> Self {
        debug!("Creating SqliteManager for path: {}", db_path);
        Self { db_path }
    }
}

#[async_trait::async_trait]
impl Manager for SqliteManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        debug!("Opening database: {}", self.db_path);
        let conn = Connection::open(&self.db_path)?;

        // Some PRAGMA statements return a result row, so execute() alone
        // isn't enough.
        let exec_pragma = |conn: &Connection, pragma: &str| -> Result<(), rusqlite::Error> {
            match conn.execute(pragma, []) {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::ExecuteReturnedResults) => {
                    conn.query_row(pragma, [], |_| Ok(())).map(|_| ())
                }
                Err(e) => Err(e),
            }
        };

        exec_pragma(&conn, "PRAGMA journal_mode=WAL")?;
        exec_pragma(&conn, "PRAGMA synchronous=NORMAL")?;
        exec_pragma(&conn, "PRAGMA foreign_keys=ON")?;

        init_database(&conn)?;
        Ok(conn)
    }

    async fn check(&self, conn: Self::Connection) -> Result<Self::Connection, Self::Error> {
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(conn)
    }
}

pub type DbPool = Pool<SqliteManager>;

pub async fn create_db_pool(
    db_path: &str,
) -> Result<DbPool, Box<dyn std::error::Error + Send + Sync>> {
    if let Some(parent) = Path::new(db_path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let manager = SqliteManager::new(db_path.to_string());
    let pool = Pool::builder().max_open(10).max_idle(5).build(manager);

    info!("✓ SQLite connection pool created: {}", db_path);
    Ok(pool)
}

fn init_database(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS email_lists (
            list_id TEXT PRIMARY KEY,
            list_name TEXT NOT NULL,
            api_key TEXT NOT NULL,
            data_center TEXT NOT NULL,
            store_aggregates INTEGER NOT NULL DEFAULT 0,
            monthly_updates INTEGER NOT NULL DEFAULT 0,
            registered_at TEXT NOT NULL
        )
        "#,
        [],
    )?;

    // Append-only: one row per analysis run, never updated.
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS list_stats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            list_id TEXT NOT NULL REFERENCES email_lists (list_id),
            analysis_timestamp TEXT NOT NULL,
            subscribers INTEGER NOT NULL,
            open_rate REAL NOT NULL,
            frequency REAL NOT NULL,
            subscribed_pct REAL NOT NULL,
            unsubscribed_pct REAL NOT NULL,
            cleaned_pct REAL NOT NULL,
            pending_pct REAL NOT NULL,
            high_open_rt_pct REAL NOT NULL,
            cur_yr_inactive_pct REAL NOT NULL,
            hist_bin_counts TEXT NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT UNIQUE NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS list_users (
            list_id TEXT NOT NULL REFERENCES email_lists (list_id),
            user_id INTEGER NOT NULL REFERENCES users (id),
            UNIQUE (list_id, user_id)
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_list_stats_list_ts
         ON list_stats (list_id, analysis_timestamp DESC)",
        [],
    )?;

    Ok(())
}

fn pool_error(e: mobc::Error<rusqlite::Error>) -> StorageError {
    StorageError::Pool(e.to_string())
}

/// One persisted `list_stats` row.
#[derive(Debug, Clone)]
pub struct StoredListStats {
    pub id: i64,
    pub list_id: String,
    pub analysis_timestamp: DateTime<Utc>,
    pub calculations: ListCalculations,
}

/// Metric names in the order charts and aggregates report them.
pub const METRICS: [&str; 9] = [
    "subscribers",
    "open_rate",
    "frequency",
    "subscribed_pct",
    "unsubscribed_pct",
    "cleaned_pct",
    "pending_pct",
    "high_open_rt_pct",
    "cur_yr_inactive_pct",
];

impl StoredListStats {
    /// Scalar metrics in `METRICS` order (histogram handled separately).
    pub fn metric_values(&self) -> [(&'static str, f64); 9] {
        let c = &self.calculations;
        [
            ("subscribers", c.subscribers as f64),
            ("open_rate", c.open_rate),
            ("frequency", c.frequency),
            ("subscribed_pct", c.subscribed_pct),
            ("unsubscribed_pct", c.unsubscribed_pct),
            ("cleaned_pct", c.cleaned_pct),
            ("pending_pct", c.pending_pct),
            ("high_open_rt_pct", c.high_open_rt_pct),
            ("cur_yr_inactive_pct", c.cur_yr_inactive_pct),
        ]
    }
}

/// Row fields before the stored text columns are decoded. Decoding happens
/// in `finish_stats` so a bad value surfaces as `StorageError::Corrupt`
/// rather than a rusqlite conversion error.
struct RawStatsRow {
    id: i64,
    list_id: String,
    analysis_timestamp: String,
    calculations: ListCalculations,
    hist_json: String,
}

fn stats_from_row(row: &Row<'_>) -> SqliteResult<RawStatsRow> {
    Ok(RawStatsRow {
        id: row.get(0)?,
        list_id: row.get(1)?,
        analysis_timestamp: row.get(2)?,
        calculations: ListCalculations {
            subscribers: row.get(3)?,
            open_rate: row.get(4)?,
            frequency: row.get(5)?,
            subscribed_pct: row.get(6)?,
            unsubscribed_pct: row.get(7)?,
            cleaned_pct: row.get(8)?,
            pending_pct: row.get(9)?,
            high_open_rt_pct: row.get(10)?,
            cur_yr_inactive_pct: row.get(11)?,
            hist_bin_counts: Vec::new(),
        },
        hist_json: row.get(12)?,
    })
}

fn finish_stats(raw: RawStatsRow) -> Result<StoredListStats, StorageError> {
    // An undecodable timestamp must not pass for a recent one; freshness
    // decisions hang off this field.
    let analysis_timestamp = DateTime::parse_from_rfc3339(&raw.analysis_timestamp)
        .map_err(|e| {
            StorageError::Corrupt(format!(
                "analysis_timestamp for analysis {}: {}",
                raw.id, e
            ))
        })?
        .with_timezone(&Utc);
    let mut calculations = raw.calculations;
    calculations.hist_bin_counts = serde_json::from_str(&raw.hist_json).map_err(|e| {
        StorageError::Corrupt(format!(
            "hist_bin_counts for analysis {}: {}",
            raw.id, e
        ))
    })?;
    Ok(StoredListStats {
        id: raw.id,
        list_id: raw.list_id,
        analysis_timestamp,
        calculations,
    })
}

const STATS_COLUMNS: &str = "id, list_id, analysis_timestamp, subscribers, open_rate, frequency, \
     subscribed_pct, unsubscribed_pct, cleaned_pct, pending_pct, \
     high_open_rt_pct, cur_yr_inactive_pct, hist_bin_counts";

/// Insert a new analysis row. Always an insert, never an update; historical
/// rows are what trend comparison runs on. Transactional: a failed commit
/// rolls back and re-raises.
pub async fn insert_list_stats(
    pool: &DbPool,
    list_id: &str,
    analysis_timestamp: DateTime<Utc>,
    calculations: &ListCalculations,
) -> Result<i64, StorageError> {
    let conn = pool.get().await.map_err(pool_error)?;
    let hist_json = serde_json::to_string(&calculations.hist_bin_counts)
        .map_err(|e| StorageError::Corrupt(e.to_string()))?;

    // Rolls back on drop unless committed.
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        r#"
        INSERT INTO list_stats (
            list_id, analysis_timestamp, subscribers, open_rate, frequency,
            subscribed_pct, unsubscribed_pct, cleaned_pct, pending_pct,
            high_open_rt_pct, cur_yr_inactive_pct, hist_bin_counts
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            list_id,
            analysis_timestamp.to_rfc3339(),
            calculations.subscribers,
            calculations.open_rate,
            calculations.frequency,
            calculations.subscribed_pct,
            calculations.unsubscribed_pct,
            calculations.cleaned_pct,
            calculations.pending_pct,
            calculations.high_open_rt_pct,
            calculations.cur_yr_inactive_pct,
            hist_json,
        ],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;

    debug!("Inserted list_stats row {} for list {}", id, list_id);
    Ok(id)
}

/// Register or reconcile a list's stored configuration. Resubmitted
/// permissions overwrite the stored ones (idempotent write keyed by
/// list_id).
pub async fn upsert_email_list(pool: &DbPool, list: &ListInfo) -> Result<(), StorageError> {
    let conn = pool.get().await.map_err(pool_error)?;
    conn.execute(
        r#"
        INSERT INTO email_lists (
            list_id, list_name, api_key, data_center,
            store_aggregates, monthly_updates, registered_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT (list_id) DO UPDATE SET
            list_name = excluded.list_name,
            api_key = excluded.api_key,
            data_center = excluded.data_center,
            store_aggregates = excluded.store_aggregates,
            monthly_updates = excluded.monthly_updates
        "#,
        params![
            list.list_id,
            list.list_name,
            list.api_key,
            list.data_center,
            list.store_aggregates as i64,
            list.monthly_updates as i64,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub async fn get_email_list(
    pool: &DbPool,
    list_id: &str,
) -> Result<Option<ListInfo>, StorageError> {
    let conn = pool.get().await.map_err(pool_error)?;
    let mut stmt = conn.prepare(
        "SELECT list_id, list_name, api_key, data_center, store_aggregates, monthly_updates
         FROM email_lists WHERE list_id = ?1",
    )?;
    let mut rows = stmt.query_map(params![list_id], list_info_from_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

fn list_info_from_row(row: &Row<'_>) -> SqliteResult<ListInfo> {
    Ok(ListInfo {
        list_id: row.get(0)?,
        list_name: row.get(1)?,
        api_key: row.get(2)?,
        data_center: row.get(3)?,
        store_aggregates: row.get::<_, i64>(4)? != 0,
        monthly_updates: row.get::<_, i64>(5)? != 0,
    })
}

/// Associate a user with a list. Running it twice is a no-op, not a
/// duplicate-key failure.
pub async fn associate_user_with_list(
    pool: &DbPool,
    user_email: &str,
    list_id: &str,
) -> Result<(), StorageError> {
    let conn = pool.get().await.map_err(pool_error)?;
    conn.execute(
        "INSERT OR IGNORE INTO users (email) VALUES (?1)",
        params![user_email],
    )?;
    let user_id: i64 = conn.query_row(
        "SELECT id FROM users WHERE email = ?1",
        params![user_email],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO list_users (list_id, user_id) VALUES (?1, ?2)",
        params![list_id, user_id],
    )?;
    Ok(())
}

pub async fn list_recipients(pool: &DbPool, list_id: &str) -> Result<Vec<String>, StorageError> {
    let conn = pool.get().await.map_err(pool_error)?;
    let mut stmt = conn.prepare(
        "SELECT u.email FROM users u
         JOIN list_users lu ON lu.user_id = u.id
         WHERE lu.list_id = ?1
         ORDER BY u.email",
    )?;
    let rows = stmt.query_map(params![list_id], |row| row.get::<_, String>(0))?;
    let mut emails = Vec::new();
    for row in rows {
        emails.push(row?);
    }
    Ok(emails)
}

/// The most recent analyses for one list, newest first.
pub async fn latest_analyses(
    pool: &DbPool,
    list_id: &str,
    limit: usize,
) -> Result<Vec<StoredListStats>, StorageError> {
    let conn = pool.get().await.map_err(pool_error)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM list_stats WHERE list_id = ?1
         ORDER BY analysis_timestamp DESC LIMIT ?2",
        STATS_COLUMNS
    ))?;
    let rows = stmt.query_map(params![list_id, limit as i64], stats_from_row)?;
    let mut analyses = Vec::new();
    for row in rows {
        analyses.push(finish_stats(row?)?);
    }
    Ok(analyses)
}

/// Load specific analysis rows, newest first.
pub async fn load_analyses(
    pool: &DbPool,
    analysis_ids: &[i64],
) -> Result<Vec<StoredListStats>, StorageError> {
    if analysis_ids.is_empty() {
        return Ok(Vec::new());
    }
    let conn = pool.get().await.map_err(pool_error)?;
    let placeholders = analysis_ids
        .iter()
        .map(|_| "?")
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM list_stats WHERE id IN ({})
         ORDER BY analysis_timestamp DESC",
        STATS_COLUMNS, placeholders
    ))?;
    let rows = stmt.query_map(rusqlite::params_from_iter(analysis_ids.iter()), stats_from_row)?;
    let mut analyses = Vec::new();
    for row in rows {
        analyses.push(finish_stats(row?)?);
    }
    Ok(analyses)
}

/// Per-rank cross-list means over lists that granted `store_aggregates`,
/// rank 1 = each list's most recent analysis, rank 2 = its prior one.
/// Returns one metric-ordered vector per rank (see `METRICS`).
pub async fn aggregate_means(pool: &DbPool, max_rank: usize) -> Result<Vec<Vec<f64>>, StorageError> {
    let conn = pool.get().await.map_err(pool_error)?;
    let mut stmt = conn.prepare(
        r#"
        SELECT rn,
               AVG(subscribers), AVG(open_rate), AVG(frequency),
               AVG(subscribed_pct), AVG(unsubscribed_pct),
               AVG(cleaned_pct), AVG(pending_pct),
               AVG(high_open_rt_pct), AVG(cur_yr_inactive_pct)
        FROM (
            SELECT s.*,
                   ROW_NUMBER() OVER (
                       PARTITION BY s.list_id
                       ORDER BY s.analysis_timestamp DESC
                   ) AS rn
            FROM list_stats s
            JOIN email_lists l ON l.list_id = s.list_id
            WHERE l.store_aggregates = 1
        )
        WHERE rn <= ?1
        GROUP BY rn
        ORDER BY rn
        "#,
    )?;
    let rows = stmt.query_map(params![max_rank as i64], |row| {
        let mut means = Vec::with_capacity(METRICS.len());
        for i in 0..METRICS.len() {
            means.push(row.get::<_, Option<f64>>(i + 1)?.unwrap_or(0.0));
        }
        Ok(means)
    })?;
    let mut ranks = Vec::new();
    for row in rows {
        ranks.push(row?);
    }
    Ok(ranks)
}

pub async fn count_registered_lists(pool: &DbPool) -> Result<i64, StorageError> {
    let conn = pool.get().await.map_err(pool_error)?;
    let count = conn.query_row("SELECT COUNT(*) FROM email_lists", [], |row| row.get(0))?;
    Ok(count)
}

/// Registered lists whose most recent analysis is older than the cutoff,
/// in deterministic list_id order.
pub async fn stale_lists(
    pool: &DbPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<ListInfo>, StorageError> {
    let conn = pool.get().await.map_err(pool_error)?;
    let mut stmt = conn.prepare(
        r#"
        SELECT l.list_id, l.list_name, l.api_key, l.data_center,
               l.store_aggregates, l.monthly_updates
        FROM email_lists l
        LEFT JOIN (
            SELECT list_id, MAX(analysis_timestamp) AS latest
            FROM list_stats
            GROUP BY list_id
        ) s ON s.list_id = l.list_id
        WHERE s.latest IS NULL OR s.latest < ?1
        ORDER BY l.list_id
        "#,
    )?;
    let rows = stmt.query_map(params![cutoff.to_rfc3339()], list_info_from_row)?;
    let mut lists = Vec::new();
    for row in rows {
        lists.push(row?);
    }
    Ok(lists)
}

pub async fn monthly_update_lists(pool: &DbPool) -> Result<Vec<ListInfo>, StorageError> {
    let conn = pool.get().await.map_err(pool_error)?;
    let mut stmt = conn.prepare(
        "SELECT list_id, list_name, api_key, data_center, store_aggregates, monthly_updates
         FROM email_lists WHERE monthly_updates = 1 ORDER BY list_id",
    )?;
    let rows = stmt.query_map([], list_info_from_row)?;
    let mut lists = Vec::new();
    for row in rows {
        lists.push(row?);
    }
    Ok(lists)
}

#[derive(Debug)]
pub struct DatabaseStats {
    pub registered_lists: i64,
    pub stored_analyses: i64,
    pub sharing_lists: i64,
    pub monthly_lists: i64,
    pub latest_analysis: Option<DateTime<Utc>>,
}

pub async fn get_database_stats(pool: &DbPool) -> Result<DatabaseStats, StorageError> {
    let conn = pool.get().await.map_err(pool_error)?;
    let registered_lists =
        conn.query_row("SELECT COUNT(*) FROM email_lists", [], |row| row.get(0))?;
    let stored_analyses =
        conn.query_row("SELECT COUNT(*) FROM list_stats", [], |row| row.get(0))?;
    let sharing_lists = conn.query_row(
        "SELECT COUNT(*) FROM email_lists WHERE store_aggregates = 1",
        [],
        |row| row.get(0),
    )?;
    let monthly_lists = conn.query_row(
        "SELECT COUNT(*) FROM email_lists WHERE monthly_updates = 1",
        [],
        |row| row.get(0),
    )?;
    let latest: Option<String> = conn.query_row(
        "SELECT MAX(analysis_timestamp) FROM list_stats",
        [],
        |row| row.get(0),
    )?;
    Ok(DatabaseStats {
        registered_lists,
        stored_analyses,
        sharing_lists,
        monthly_lists,
        latest_analysis: latest
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// A pool backed by a throwaway on-disk database. The TempDir must stay
    /// alive for the duration of the test.
    pub async fn test_pool() -> (DbPool, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("test.db");
        let manager = SqliteManager::new(path.to_string_lossy().to_string());
        let pool = Pool::builder().max_open(2).build(manager);
        (pool, dir)
    }

    pub fn sample_list(list_id: &str, store_aggregates: bool, monthly_updates: bool) -> ListInfo {
        ListInfo {
            list_id: list_id.to_string(),
            list_name: format!("List {}", list_id),
            api_key: "key-us1".to_string(),
            data_center: "us1".to_string(),
            store_aggregates,
            monthly_updates,
        }
    }

    pub fn sample_calculations(subscribers: i64, open_rate: f64) -> ListCalculations {
        ListCalculations {
            subscribers,
            open_rate,
            frequency: 1.5,
            subscribed_pct: 0.7,
            unsubscribed_pct: 0.2,
            cleaned_pct: 0.05,
            pending_pct: 0.05,
            high_open_rt_pct: 0.1,
            cur_yr_inactive_pct: 0.3,
            hist_bin_counts: vec![5, 4, 3, 2, 1, 0, 0, 0, 0, 1],
        }
    }
}
