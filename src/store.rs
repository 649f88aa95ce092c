//! Durable output: canonical records, the dedup ledger, progress, raw pages,
//! and county office directories, all in one SQLite file.
//!
//! A record and its ledger entry commit in the same transaction, record
//! first, so a crash can never leave a ledgered key without its record.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::extract::offices::{Category, OfficeDirectory};
use crate::model::{
    CanonicalRecord, Field, Jurisdiction, LedgerKey, Platform, RawPage, RecordLocator, RecordStatus,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Startup view of prior work: ledger membership plus the last progress marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub ledger: BTreeSet<LedgerKey>,
    pub written_count: u64,
    pub last_key: Option<LedgerKey>,
    pub saved_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn contains(&self, key: &LedgerKey) -> bool {
        self.ledger.contains(key)
    }

    pub fn load(path: &Path) -> Result<Option<Checkpoint>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let checkpoint = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    /// Write to a sibling temp file, then rename over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

struct Snapshots {
    path: PathBuf,
    every: u64,
}

/// Persisted record plus where it came from.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub platform: Platform,
    pub parcel_key: String,
    pub url: String,
    pub state: String,
    pub county: String,
    pub record: CanonicalRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JurisdictionCounts {
    pub platform: String,
    pub state: String,
    pub county: String,
    pub discovered: u64,
    pub fetched: u64,
    pub complete: u64,
    pub partial: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfficeRow {
    pub state: String,
    pub county: String,
    pub offices: Vec<(Category, String)>,
}

pub struct Store {
    conn: Connection,
    checkpoint: Checkpoint,
    snapshots: Option<Snapshots>,
}

fn field_columns() -> Vec<&'static str> {
    Field::ALL.iter().map(|f| f.name()).collect()
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jurisdictions (
            id            INTEGER PRIMARY KEY,
            platform      TEXT NOT NULL,
            state         TEXT NOT NULL,
            county        TEXT NOT NULL,
            url           TEXT NOT NULL,
            discovered_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(platform, url)
        );

        CREATE TABLE IF NOT EXISTS locators (
            id               INTEGER PRIMARY KEY,
            platform         TEXT NOT NULL,
            state            TEXT NOT NULL,
            county           TEXT NOT NULL,
            jurisdiction_url TEXT NOT NULL,
            url              TEXT NOT NULL,
            parcel_key       TEXT NOT NULL,
            hash_keyed       BOOLEAN NOT NULL DEFAULT 0,
            discovered_at    TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(platform, url)
        );
        CREATE INDEX IF NOT EXISTS idx_locators_key ON locators(platform, parcel_key);

        CREATE TABLE IF NOT EXISTS ledger (
            platform    TEXT NOT NULL,
            parcel_key  TEXT NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (platform, parcel_key)
        );

        CREATE TABLE IF NOT EXISTS progress (
            id            INTEGER PRIMARY KEY CHECK (id = 1),
            written_count INTEGER NOT NULL,
            last_platform TEXT,
            last_key      TEXT,
            updated_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS raw_pages (
            id               INTEGER PRIMARY KEY,
            platform         TEXT NOT NULL,
            parcel_key       TEXT NOT NULL,
            fetch_date       TEXT NOT NULL,
            state            TEXT NOT NULL,
            county           TEXT NOT NULL,
            jurisdiction_url TEXT NOT NULL,
            url              TEXT NOT NULL,
            status           INTEGER NOT NULL,
            html             TEXT NOT NULL,
            fetched_at       TEXT NOT NULL,
            UNIQUE(platform, parcel_key, fetch_date)
        );

        CREATE TABLE IF NOT EXISTS offices (
            state      TEXT NOT NULL,
            county     TEXT NOT NULL,
            assessor   TEXT,
            tax        TEXT,
            gis        TEXT,
            recorder   TEXT,
            taxation   TEXT,
            other      TEXT,
            scraped_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (state, county)
        );
        ",
    )?;

    let fields: Vec<String> = field_columns().iter().map(|c| format!("{} TEXT", c)).collect();
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS records (
            id               INTEGER PRIMARY KEY,
            platform         TEXT NOT NULL,
            parcel_key       TEXT NOT NULL,
            url              TEXT NOT NULL,
            state            TEXT NOT NULL,
            county           TEXT NOT NULL,
            status           TEXT NOT NULL CHECK(status IN ('complete','partial','failed')),
            {},
            saved_at         TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(platform, parcel_key)
        );
        CREATE INDEX IF NOT EXISTS idx_records_status ON records(status);",
        fields.join(",\n            ")
    ))?;
    Ok(())
}

fn parse_platform(s: &str) -> Result<Platform> {
    s.parse::<Platform>().map_err(anyhow::Error::from)
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        let mut store = Store {
            conn,
            checkpoint: Checkpoint::default(),
            snapshots: None,
        };
        store.checkpoint = store.load_checkpoint()?;
        Ok(store)
    }

    /// Write a full snapshot every `every` appended records. An existing
    /// snapshot is merged into the ledger view (set union).
    pub fn with_snapshots(mut self, path: &Path, every: u64) -> Result<Self> {
        if let Some(previous) = Checkpoint::load(path)? {
            let before = self.checkpoint.ledger.len();
            self.checkpoint.ledger.extend(previous.ledger);
            if self.checkpoint.ledger.len() > before {
                info!(
                    recovered = self.checkpoint.ledger.len() - before,
                    "ledger keys recovered from snapshot"
                );
            }
        }
        self.snapshots = Some(Snapshots {
            path: path.to_path_buf(),
            every: every.max(1),
        });
        Ok(self)
    }

    fn load_checkpoint(&self) -> Result<Checkpoint> {
        let mut stmt = self.conn.prepare("SELECT platform, parcel_key FROM ledger")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut ledger = BTreeSet::new();
        for (platform, parcel_key) in rows {
            ledger.insert(LedgerKey {
                platform: parse_platform(&platform)?,
                parcel_key,
            });
        }

        let progress: Option<(i64, Option<String>, Option<String>)> = self
            .conn
            .query_row(
                "SELECT written_count, last_platform, last_key FROM progress WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (written_count, last_key) = match progress {
            Some((count, Some(platform), Some(key))) => (
                count as u64,
                Some(LedgerKey {
                    platform: parse_platform(&platform)?,
                    parcel_key: key,
                }),
            ),
            Some((count, _, _)) => (count as u64, None),
            None => (0, None),
        };

        Ok(Checkpoint {
            ledger,
            written_count,
            last_key,
            saved_at: None,
        })
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Dedup lookup made before any fetch is scheduled.
    pub fn contains(&self, key: &LedgerKey) -> bool {
        self.checkpoint.contains(key)
    }

    // ── Discovery ──

    pub fn save_jurisdictions(&self, jurisdictions: &[Jurisdiction]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO jurisdictions (platform, state, county, url) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for j in jurisdictions {
                count += stmt.execute(params![j.platform.as_str(), j.state, j.county, j.url])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    pub fn save_locators(&self, locators: &[RecordLocator]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO locators
                 (platform, state, county, jurisdiction_url, url, parcel_key, hash_keyed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for l in locators {
                count += stmt.execute(params![
                    l.platform.as_str(),
                    l.jurisdiction.state,
                    l.jurisdiction.county,
                    l.jurisdiction.url,
                    l.url,
                    l.parcel_key(),
                    l.is_hash_keyed(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    /// Stored locators whose key is not yet in the ledger, in discovery order.
    pub fn pending_locators(&self, platform: Option<Platform>, limit: Option<usize>) -> Result<Vec<RecordLocator>> {
        let sql = format!(
            "SELECT l.platform, l.state, l.county, l.jurisdiction_url, l.url
             FROM locators l
             LEFT JOIN ledger g ON g.platform = l.platform AND g.parcel_key = l.parcel_key
             WHERE g.parcel_key IS NULL AND (?1 IS NULL OR l.platform = ?1)
             ORDER BY l.id{}",
            match limit {
                Some(n) => format!(" LIMIT {}", n),
                None => String::new(),
            }
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![platform.map(|p| p.as_str())], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(platform, state, county, jurisdiction_url, url)| -> Result<RecordLocator> {
                let jurisdiction = Jurisdiction {
                    platform: parse_platform(&platform)?,
                    state,
                    county,
                    url: jurisdiction_url,
                };
                Ok(RecordLocator::new(&jurisdiction, &url))
            })
            .collect()
    }

    // ── Records ──

    fn write_record(tx: &rusqlite::Transaction<'_>, locator: &RecordLocator, record: &CanonicalRecord) -> Result<()> {
        let columns = field_columns();
        let placeholders: Vec<String> = (7..7 + columns.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT OR REPLACE INTO records
             (platform, parcel_key, url, state, county, status, {})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, {})",
            columns.join(", "),
            placeholders.join(", ")
        );
        let status = record.status();
        let cells: Vec<Option<String>> = record
            .row()
            .into_iter()
            .map(|c| (!c.is_empty()).then_some(c))
            .collect();

        let platform = locator.platform.as_str();
        let parcel_key = locator.parcel_key();
        let status_str = status.as_str();
        let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(6 + cells.len());
        values.push(&platform);
        values.push(&parcel_key);
        values.push(&locator.url);
        values.push(&locator.jurisdiction.state);
        values.push(&locator.jurisdiction.county);
        values.push(&status_str);
        for cell in &cells {
            values.push(cell);
        }

        let mut stmt = tx.prepare_cached(&sql)?;
        stmt.execute(values.as_slice())?;

        // Failed outcomes stay retryable on the next run.
        if status != RecordStatus::Failed {
            tx.execute(
                "INSERT OR IGNORE INTO ledger (platform, parcel_key) VALUES (?1, ?2)",
                params![platform, parcel_key],
            )?;
        }
        Ok(())
    }

    /// Persist one outcome: record, then ledger, then progress, in one transaction.
    pub fn append(&mut self, locator: &RecordLocator, record: &CanonicalRecord) -> Result<()> {
        let key = locator.ledger_key();
        let tx = self.conn.unchecked_transaction()?;
        Self::write_record(&tx, locator, record)?;
        tx.execute(
            "INSERT INTO progress (id, written_count, last_platform, last_key, updated_at)
             VALUES (1, 1, ?1, ?2, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                written_count = written_count + 1,
                last_platform = excluded.last_platform,
                last_key = excluded.last_key,
                updated_at = excluded.updated_at",
            params![key.platform.as_str(), key.parcel_key],
        )?;
        tx.commit()?;

        if record.status() != RecordStatus::Failed {
            self.checkpoint.ledger.insert(key.clone());
        }
        self.checkpoint.written_count += 1;
        self.checkpoint.last_key = Some(key);

        if let Some(snap) = &self.snapshots {
            if self.checkpoint.written_count % snap.every == 0 {
                let path = snap.path.clone();
                self.snapshot_to(&path)?;
            }
        }
        Ok(())
    }

    /// Rewrite records in bulk (reparse) without touching the progress marker.
    pub fn replace_records(&mut self, rows: &[(RecordLocator, CanonicalRecord)]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        for (locator, record) in rows {
            Self::write_record(&tx, locator, record)?;
        }
        tx.commit()?;
        for (locator, record) in rows {
            if record.status() != RecordStatus::Failed {
                self.checkpoint.ledger.insert(locator.ledger_key());
            }
        }
        Ok(rows.len())
    }

    pub fn snapshot(&mut self) -> Result<()> {
        match &self.snapshots {
            Some(snap) => {
                let path = snap.path.clone();
                self.snapshot_to(&path)
            }
            None => Ok(()),
        }
    }

    fn snapshot_to(&mut self, path: &Path) -> Result<()> {
        self.checkpoint.saved_at = Some(Utc::now());
        self.checkpoint.save(path)?;
        debug!(path = %path.display(), written = self.checkpoint.written_count, "checkpoint snapshot");
        Ok(())
    }

    pub fn records(&self) -> Result<Vec<StoredRecord>> {
        let columns = field_columns();
        let sql = format!(
            "SELECT platform, parcel_key, url, state, county, status, {} FROM records ORDER BY id",
            columns.join(", ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                let mut cells: Vec<Option<String>> = Vec::with_capacity(columns.len());
                for i in 0..columns.len() {
                    cells.push(row.get(6 + i)?);
                }
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    cells,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(platform, parcel_key, url, state, county, status, cells)| -> Result<StoredRecord> {
                let status = match status.as_str() {
                    "complete" => RecordStatus::Complete,
                    "partial" => RecordStatus::Partial,
                    _ => RecordStatus::Failed,
                };
                Ok(StoredRecord {
                    platform: parse_platform(&platform)?,
                    parcel_key,
                    url,
                    state,
                    county,
                    record: CanonicalRecord::from_row(&cells, status),
                })
            })
            .collect()
    }

    // ── Raw pages ──

    pub fn save_raw_page(&self, page: &RawPage) -> Result<()> {
        let l = &page.locator;
        self.conn.execute(
            "INSERT OR REPLACE INTO raw_pages
             (platform, parcel_key, fetch_date, state, county, jurisdiction_url, url, status, html, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                l.platform.as_str(),
                l.parcel_key(),
                page.fetch_date().to_string(),
                l.jurisdiction.state,
                l.jurisdiction.county,
                l.jurisdiction.url,
                l.url,
                page.status,
                page.html,
                page.fetched_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Stored pages, oldest fetch first so later rewrites win.
    pub fn raw_pages(&self, platform: Option<Platform>) -> Result<Vec<RawPage>> {
        let mut stmt = self.conn.prepare(
            "SELECT platform, state, county, jurisdiction_url, url, status, html, fetched_at
             FROM raw_pages
             WHERE (?1 IS NULL OR platform = ?1)
             ORDER BY fetch_date, id",
        )?;
        let rows = stmt
            .query_map(params![platform.map(|p| p.as_str())], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, u16>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(platform, state, county, jurisdiction_url, url, status, html, fetched_at)| -> Result<RawPage> {
                let jurisdiction = Jurisdiction {
                    platform: parse_platform(&platform)?,
                    state,
                    county,
                    url: jurisdiction_url,
                };
                Ok(RawPage {
                    locator: RecordLocator::new(&jurisdiction, &url),
                    html,
                    fetched_at: DateTime::parse_from_rfc3339(&fetched_at)?.with_timezone(&Utc),
                    status,
                })
            })
            .collect()
    }

    // ── Statistics ──

    pub fn jurisdiction_counts(&self) -> Result<Vec<JurisdictionCounts>> {
        let mut stmt = self.conn.prepare(
            "SELECT l.platform, l.state, l.county, COUNT(*),
                    COALESCE(SUM(CASE WHEN r.status IN ('complete','partial') THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN r.status = 'complete' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN r.status = 'partial' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN r.status = 'failed' THEN 1 ELSE 0 END), 0)
             FROM locators l
             LEFT JOIN records r ON r.platform = l.platform AND r.parcel_key = l.parcel_key
             GROUP BY l.platform, l.state, l.county
             ORDER BY l.platform, l.state, l.county",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(JurisdictionCounts {
                    platform: row.get(0)?,
                    state: row.get(1)?,
                    county: row.get(2)?,
                    discovered: row.get::<_, i64>(3)? as u64,
                    fetched: row.get::<_, i64>(4)? as u64,
                    complete: row.get::<_, i64>(5)? as u64,
                    partial: row.get::<_, i64>(6)? as u64,
                    failed: row.get::<_, i64>(7)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Office directories ──

    pub fn save_offices(&self, state: &str, county: &str, directory: &OfficeDirectory) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO offices (state, county, assessor, tax, gis, recorder, taxation, other)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                state,
                county,
                directory.get(Category::Assessor),
                directory.get(Category::Tax),
                directory.get(Category::Gis),
                directory.get(Category::Recorder),
                directory.get(Category::Taxation),
                directory.get(Category::Other),
            ],
        )?;
        Ok(())
    }

    pub fn offices(&self) -> Result<Vec<OfficeRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT state, county, assessor, tax, gis, recorder, taxation, other
             FROM offices ORDER BY state, county",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let mut offices = Vec::new();
                for (i, category) in Category::ALL.iter().enumerate() {
                    if let Some(url) = row.get::<_, Option<String>>(2 + i)? {
                        offices.push((*category, url));
                    }
                }
                Ok(OfficeRow {
                    state: row.get(0)?,
                    county: row.get(1)?,
                    offices,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
