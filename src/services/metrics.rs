use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::models::AnswerPath;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS query_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    latency_ms INTEGER NOT NULL,
    path TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_query_log_timestamp ON query_log(timestamp);
"#;

/// Per-query latency and answer path, kept by the daemon.
pub struct MetricsStore {
    conn: Connection,
}

impl MetricsStore {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "auto_vacuum", "INCREMENTAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn record(&self, latency_ms: u64, path: AnswerPath) {
        if let Err(e) = self.conn.execute(
            "INSERT INTO query_log (timestamp, latency_ms, path)
             VALUES (datetime('now'), ?1, ?2)",
            params![latency_ms as i64, path.as_str()],
        ) {
            tracing::debug!(error = %e, "failed to record query metrics");
        }
    }

    pub fn get_summary(&self, retention_days: u32) -> MetricsSummary {
        let window = format!("-{} days", retention_days);

        let totals = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(AVG(latency_ms), 0)
             FROM query_log
             WHERE timestamp >= datetime('now', ?1)",
            params![window],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, f64>(1)? as u64)),
        );
        let Ok((total_queries, avg_latency_ms)) = totals else {
            return MetricsSummary::default();
        };

        let mut by_path = BTreeMap::new();
        let counts = self
            .conn
            .prepare(
                "SELECT path, COUNT(*) FROM query_log
                 WHERE timestamp >= datetime('now', ?1)
                 GROUP BY path",
            )
            .and_then(|mut stmt| {
                stmt.query_map(params![window], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<Result<Vec<_>, _>>()
            });
        if let Ok(counts) = counts {
            by_path.extend(counts);
        }

        MetricsSummary {
            total_queries,
            avg_latency_ms,
            by_path,
        }
    }

    pub fn cleanup(&self, retention_days: u32) {
        let window = format!("-{} days", retention_days);
        let _ = self.conn.execute(
            "DELETE FROM query_log WHERE timestamp < datetime('now', ?1)",
            params![window],
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_queries: u64,
    pub avg_latency_ms: u64,
    /// Query count per answer path (`fast_path`, `generated`, ...)
    pub by_path: BTreeMap<String, u64>,
}

impl MetricsSummary {
    pub fn fallback_rate(&self) -> f32 {
        if self.total_queries == 0 {
            return 0.0;
        }
        let fallbacks = self
            .by_path
            .get(AnswerPath::SafeFallback.as_str())
            .copied()
            .unwrap_or(0);
        fallbacks as f32 * 100.0 / self.total_queries as f32
    }
}
