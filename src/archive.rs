use crate::error::Result;
use crate::types::{PanelRow, ReleaseTag, SnapshotMeta, YearStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// A lease older than this is presumed abandoned by a crashed run and may
/// be taken over. Well above any plausible run duration.
const LEASE_STALE_AFTER_SECS: i64 = 3600;

/// One pipeline invocation in the run ledger.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub table: String,
    pub year: i32,
    pub release_tag: ReleaseTag,
    pub status: String,
    pub records_fetched: usize,
    pub rows_emitted: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Durable store behind the snapshot manager: the append-only snapshot
/// archive, the per-year CurrentView pointer, advisory run leases and the
/// run ledger.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Latest applicable snapshot for a year (the CurrentView pointer), if any.
    async fn current_meta(&self, year: i32) -> Result<Option<SnapshotMeta>>;

    /// Appends an immutable snapshot and promotes it to CurrentView in one
    /// atomic step. Never overwrites an existing archive entry.
    async fn commit_snapshot(&self, meta: &SnapshotMeta, rows: &[PanelRow]) -> Result<()>;

    /// Rows behind the CurrentView pointer for a year.
    async fn current_rows(&self, year: i32) -> Result<Option<Vec<PanelRow>>>;

    /// Years with a CurrentView entry, ascending.
    async fn current_years(&self) -> Result<Vec<i32>>;

    /// Audit retrieval of any archived snapshot by its own hash.
    async fn snapshot_rows(&self, year: i32, content_hash: &str) -> Result<Option<Vec<PanelRow>>>;

    /// Advisory lease keyed (table, year); returns false when already held.
    async fn acquire_lease(&self, table: &str, year: i32, holder: &str) -> Result<bool>;
    async fn release_lease(&self, table: &str, year: i32, holder: &str) -> Result<()>;

    async fn record_run(&self, run: &RunRecord) -> Result<()>;
    async fn record_year_stats(&self, run_id: Uuid, stats: &[YearStats]) -> Result<()>;
}

/// SQLite-backed archive: index tables in `meta.db`, row sets as immutable
/// JSON files under `rows/` keyed by content hash.
pub struct SqliteArchive {
    conn: Mutex<Connection>,
    root: PathBuf,
}

impl SqliteArchive {
    pub fn open_at_root<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let conn = Connection::open(root.join("meta.db"))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS snapshots (
                year                 INTEGER NOT NULL,
                release_tag          TEXT    NOT NULL,
                content_hash         TEXT    NOT NULL,
                created_at           TEXT    NOT NULL,
                source_table_version TEXT,
                row_count            INTEGER NOT NULL,
                payload_ref          TEXT    NOT NULL,
                PRIMARY KEY (year, release_tag, content_hash)
            );
            CREATE TABLE IF NOT EXISTS current_view (
                year         INTEGER PRIMARY KEY,
                release_tag  TEXT    NOT NULL,
                content_hash TEXT    NOT NULL
            );
            CREATE TABLE IF NOT EXISTS leases (
                table_name  TEXT    NOT NULL,
                year        INTEGER NOT NULL,
                holder      TEXT    NOT NULL,
                acquired_at TEXT    NOT NULL,
                PRIMARY KEY (table_name, year)
            );
            CREATE TABLE IF NOT EXISTS runs (
                run_id          TEXT PRIMARY KEY,
                table_name      TEXT    NOT NULL,
                year            INTEGER NOT NULL,
                release_tag     TEXT    NOT NULL,
                status          TEXT    NOT NULL,
                records_fetched INTEGER NOT NULL,
                rows_emitted    INTEGER NOT NULL,
                error           TEXT,
                started_at      TEXT    NOT NULL,
                finished_at     TEXT
            );
            CREATE TABLE IF NOT EXISTS year_stats (
                run_id     TEXT    NOT NULL,
                year       INTEGER NOT NULL,
                stats_json TEXT    NOT NULL,
                PRIMARY KEY (run_id, year)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            root,
        })
    }

    /// Content-addressed row-set file. Written once; a hash collision with
    /// identical content is a no-op.
    fn write_rows(&self, content_hash: &str, rows: &[PanelRow]) -> Result<String> {
        let dir = self
            .root
            .join("rows")
            .join(&content_hash[0..2])
            .join(&content_hash[2..4]);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{content_hash}.json"));
        if !path.exists() {
            let bytes = serde_json::to_vec(rows)?;
            std::fs::write(&path, bytes)?;
        }
        Ok(format!("rows:sha256:{content_hash}"))
    }

    fn read_rows(&self, content_hash: &str) -> Result<Option<Vec<PanelRow>>> {
        let path = self
            .root
            .join("rows")
            .join(&content_hash[0..2])
            .join(&content_hash[2..4])
            .join(format!("{content_hash}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// An unreadable index row is corruption, not something to paper over
    /// with a default; the query fails and surfaces to the caller.
    fn meta_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotMeta> {
        let tag: String = row.get(1)?;
        let created_at: String = row.get(3)?;
        Ok(SnapshotMeta {
            year: row.get(0)?,
            release_tag: ReleaseTag::parse(&tag).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    format!("unknown release tag '{tag}'").into(),
                )
            })?,
            content_hash: row.get(2)?,
            created_at: created_at.parse::<DateTime<Utc>>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            source_table_version: row.get(4)?,
            row_count: row.get::<_, i64>(5)? as usize,
        })
    }
}

#[async_trait]
impl ArchiveStore for SqliteArchive {
    async fn current_meta(&self, year: i32) -> Result<Option<SnapshotMeta>> {
        let conn = self.conn.lock().unwrap();
        let meta = conn
            .query_row(
                "SELECT s.year, s.release_tag, s.content_hash, s.created_at,
                        s.source_table_version, s.row_count
                 FROM current_view c
                 JOIN snapshots s
                   ON s.year = c.year
                  AND s.release_tag = c.release_tag
                  AND s.content_hash = c.content_hash
                 WHERE c.year = ?1",
                params![year],
                |row| Self::meta_from_row(row),
            )
            .optional()?;
        Ok(meta)
    }

    async fn commit_snapshot(&self, meta: &SnapshotMeta, rows: &[PanelRow]) -> Result<()> {
        let payload_ref = self.write_rows(&meta.content_hash, rows)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO snapshots
             (year, release_tag, content_hash, created_at, source_table_version, row_count, payload_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                meta.year,
                meta.release_tag.as_str(),
                meta.content_hash,
                meta.created_at.to_rfc3339(),
                meta.source_table_version,
                meta.row_count as i64,
                payload_ref,
            ],
        )?;
        tx.execute(
            "INSERT INTO current_view (year, release_tag, content_hash) VALUES (?1, ?2, ?3)
             ON CONFLICT(year) DO UPDATE SET
               release_tag = excluded.release_tag,
               content_hash = excluded.content_hash",
            params![meta.year, meta.release_tag.as_str(), meta.content_hash],
        )?;
        tx.commit()?;
        debug!(
            "Committed snapshot year={} tag={} hash={}",
            meta.year,
            meta.release_tag,
            &meta.content_hash[0..12.min(meta.content_hash.len())]
        );
        Ok(())
    }

    async fn current_rows(&self, year: i32) -> Result<Option<Vec<PanelRow>>> {
        let hash: Option<String> = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT content_hash FROM current_view WHERE year = ?1",
                params![year],
                |row| row.get(0),
            )
            .optional()?
        };
        match hash {
            Some(h) => self.read_rows(&h),
            None => Ok(None),
        }
    }

    async fn current_years(&self) -> Result<Vec<i32>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT year FROM current_view ORDER BY year")?;
        let years = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i32>>>()?;
        Ok(years)
    }

    async fn snapshot_rows(&self, year: i32, content_hash: &str) -> Result<Option<Vec<PanelRow>>> {
        let exists: Option<i64> = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT 1 FROM snapshots WHERE year = ?1 AND content_hash = ?2",
                params![year, content_hash],
                |row| row.get(0),
            )
            .optional()?
        };
        if exists.is_none() {
            return Ok(None);
        }
        self.read_rows(content_hash)
    }

    async fn acquire_lease(&self, table: &str, year: i32, holder: &str) -> Result<bool> {
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO leases (table_name, year, holder, acquired_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![table, year, holder, now.to_rfc3339()],
        )?;
        if changed == 1 {
            return Ok(true);
        }
        // Held by someone else; take it over only if it has gone stale.
        let cutoff = (now - chrono::Duration::seconds(LEASE_STALE_AFTER_SECS)).to_rfc3339();
        let taken = conn.execute(
            "UPDATE leases SET holder = ?3, acquired_at = ?4
             WHERE table_name = ?1 AND year = ?2 AND acquired_at < ?5",
            params![table, year, holder, now.to_rfc3339(), cutoff],
        )?;
        Ok(taken == 1)
    }

    async fn release_lease(&self, table: &str, year: i32, holder: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM leases WHERE table_name = ?1 AND year = ?2 AND holder = ?3",
            params![table, year, holder],
        )?;
        Ok(())
    }

    async fn record_run(&self, run: &RunRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runs
             (run_id, table_name, year, release_tag, status, records_fetched,
              rows_emitted, error, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(run_id) DO UPDATE SET
               status = excluded.status,
               records_fetched = excluded.records_fetched,
               rows_emitted = excluded.rows_emitted,
               error = excluded.error,
               finished_at = excluded.finished_at",
            params![
                run.run_id.to_string(),
                run.table,
                run.year,
                run.release_tag.as_str(),
                run.status,
                run.records_fetched as i64,
                run.rows_emitted as i64,
                run.error,
                run.started_at.to_rfc3339(),
                run.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    async fn record_year_stats(&self, run_id: Uuid, stats: &[YearStats]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        for stat in stats {
            conn.execute(
                "INSERT OR REPLACE INTO year_stats (run_id, year, stats_json) VALUES (?1, ?2, ?3)",
                params![
                    run_id.to_string(),
                    stat.year,
                    serde_json::to_string(stat)?
                ],
            )?;
        }
        Ok(())
    }
}

/// In-memory archive for development and tests.
#[derive(Default)]
pub struct InMemoryArchive {
    snapshots: Arc<Mutex<Vec<(SnapshotMeta, Vec<PanelRow>)>>>,
    current: Arc<Mutex<HashMap<i32, SnapshotMeta>>>,
    leases: Arc<Mutex<HashMap<(String, i32), (String, DateTime<Utc>)>>>,
    runs: Arc<Mutex<Vec<RunRecord>>>,
    stats: Arc<Mutex<Vec<(Uuid, YearStats)>>>,
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archived_count(&self, year: i32) -> usize {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|(meta, _)| meta.year == year)
            .count()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArchiveStore for InMemoryArchive {
    async fn current_meta(&self, year: i32) -> Result<Option<SnapshotMeta>> {
        Ok(self.current.lock().unwrap().get(&year).cloned())
    }

    async fn commit_snapshot(&self, meta: &SnapshotMeta, rows: &[PanelRow]) -> Result<()> {
        let mut snapshots = self.snapshots.lock().unwrap();
        let already_archived = snapshots.iter().any(|(m, _)| {
            m.year == meta.year
                && m.release_tag == meta.release_tag
                && m.content_hash == meta.content_hash
        });
        if !already_archived {
            snapshots.push((meta.clone(), rows.to_vec()));
        }
        self.current.lock().unwrap().insert(meta.year, meta.clone());
        Ok(())
    }

    async fn current_rows(&self, year: i32) -> Result<Option<Vec<PanelRow>>> {
        let current = self.current.lock().unwrap();
        let Some(meta) = current.get(&year) else {
            return Ok(None);
        };
        let snapshots = self.snapshots.lock().unwrap();
        Ok(snapshots
            .iter()
            .find(|(m, _)| m.year == year && m.content_hash == meta.content_hash)
            .map(|(_, rows)| rows.clone()))
    }

    async fn current_years(&self) -> Result<Vec<i32>> {
        let mut years: Vec<i32> = self.current.lock().unwrap().keys().copied().collect();
        years.sort_unstable();
        Ok(years)
    }

    async fn snapshot_rows(&self, year: i32, content_hash: &str) -> Result<Option<Vec<PanelRow>>> {
        let snapshots = self.snapshots.lock().unwrap();
        Ok(snapshots
            .iter()
            .find(|(m, _)| m.year == year && m.content_hash == content_hash)
            .map(|(_, rows)| rows.clone()))
    }

    async fn acquire_lease(&self, table: &str, year: i32, holder: &str) -> Result<bool> {
        let now = Utc::now();
        let mut leases = self.leases.lock().unwrap();
        let key = (table.to_string(), year);
        if let Some((_, acquired_at)) = leases.get(&key) {
            let age = now - *acquired_at;
            if age < chrono::Duration::seconds(LEASE_STALE_AFTER_SECS) {
                return Ok(false);
            }
        }
        leases.insert(key, (holder.to_string(), now));
        Ok(true)
    }

    async fn release_lease(&self, table: &str, year: i32, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().unwrap();
        let key = (table.to_string(), year);
        if leases.get(&key).map(|(h, _)| h.as_str()) == Some(holder) {
            leases.remove(&key);
        }
        Ok(())
    }

    async fn record_run(&self, run: &RunRecord) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        if let Some(existing) = runs.iter_mut().find(|r| r.run_id == run.run_id) {
            *existing = run.clone();
        } else {
            runs.push(run.clone());
        }
        Ok(())
    }

    async fn record_year_stats(&self, run_id: Uuid, stats: &[YearStats]) -> Result<()> {
        let mut all = self.stats.lock().unwrap();
        for stat in stats {
            all.push((run_id, stat.clone()));
        }
        Ok(())
    }
}
