use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use rusqlite::{
    Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior, params, types::Type,
};

use crate::{
    foundation::{
        core::Resolution,
        error::{FramecastError, FramecastResult},
    },
    store::model::{
        AssetId, AssetRecord, CacheEntry, CacheEntryId, NewSession, PlaybackStats, ScannedAsset,
        SessionId, StreamSession, UpsertOutcome,
    },
};

/// How long a writer waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS assets (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT    NOT NULL UNIQUE,
    filename    TEXT    NOT NULL,
    width       INTEGER NOT NULL,
    height      INTEGER NOT NULL,
    n_frames    INTEGER NOT NULL,
    checksum    TEXT    NOT NULL,
    tags        TEXT    NOT NULL DEFAULT '[]',
    first_seen  TEXT    NOT NULL,
    last_played TEXT,
    play_count  INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS assets_by_resolution ON assets (width, height);

CREATE TABLE IF NOT EXISTS cache_entries (
    id                     INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_id               INTEGER NOT NULL,
    asset_name             TEXT    NOT NULL,
    width                  INTEGER NOT NULL,
    height                 INTEGER NOT NULL,
    source_checksum        TEXT    NOT NULL,
    cached_at              TEXT    NOT NULL,
    last_used              TEXT,
    frame_count            INTEGER NOT NULL,
    play_count             INTEGER NOT NULL DEFAULT 0,
    avg_fps                REAL,
    scheduled_for_deletion INTEGER NOT NULL DEFAULT 0,
    currently_playing      INTEGER NOT NULL DEFAULT 0,
    UNIQUE (asset_id, width, height)
);

CREATE TABLE IF NOT EXISTS sessions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    time        TEXT    NOT NULL,
    client_addr TEXT    NOT NULL,
    asset_id    INTEGER NOT NULL,
    request     TEXT    NOT NULL,
    frame_from  INTEGER NOT NULL,
    frame_to    INTEGER NOT NULL,
    width       INTEGER NOT NULL,
    height      INTEGER NOT NULL,
    frames_sent INTEGER,
    fps         REAL
);
";

const ASSET_COLUMNS: &str = "id, name, filename, width, height, n_frames, checksum, tags, \
                             first_seen, last_played, play_count";

const CACHE_COLUMNS: &str = "id, asset_id, asset_name, width, height, source_checksum, cached_at, \
                             last_used, frame_count, play_count, avg_fps, \
                             scheduled_for_deletion, currently_playing";

const SESSION_COLUMNS: &str = "id, time, client_addr, asset_id, request, frame_from, frame_to, \
                               width, height, frames_sent, fps";

/// SQLite stores integers as `i64`; ids and counters never go negative.
fn uint(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    row.get::<_, i64>(idx).map(|v| v.max(0) as u64)
}

fn asset_row(row: &Row<'_>) -> rusqlite::Result<AssetRecord> {
    let tags: String = row.get(7)?;
    let tags = serde_json::from_str(&tags)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    Ok(AssetRecord {
        id: AssetId(uint(row, 0)?),
        name: row.get(1)?,
        filename: row.get(2)?,
        width: row.get(3)?,
        height: row.get(4)?,
        n_frames: row.get(5)?,
        checksum: row.get(6)?,
        tags,
        first_seen: row.get(8)?,
        last_played: row.get(9)?,
        play_count: uint(row, 10)?,
    })
}

fn cache_row(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        id: CacheEntryId(uint(row, 0)?),
        asset_id: AssetId(uint(row, 1)?),
        asset_name: row.get(2)?,
        width: row.get(3)?,
        height: row.get(4)?,
        source_checksum: row.get(5)?,
        cached_at: row.get(6)?,
        last_used: row.get(7)?,
        frame_count: row.get(8)?,
        play_count: uint(row, 9)?,
        avg_fps: row.get(10)?,
        scheduled_for_deletion: row.get(11)?,
        readers: row.get(12)?,
    })
}

fn session_row(row: &Row<'_>) -> rusqlite::Result<StreamSession> {
    Ok(StreamSession {
        id: SessionId(uint(row, 0)?),
        time: row.get(1)?,
        client_addr: row.get(2)?,
        asset_id: AssetId(uint(row, 3)?),
        request: row.get(4)?,
        frame_from: row.get(5)?,
        frame_to: row.get(6)?,
        width: row.get(7)?,
        height: row.get(8)?,
        frames_sent: row.get(9)?,
        fps: row.get(10)?,
    })
}

fn sql_id(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn cache_entry_at(
    conn: &Connection,
    asset_id: AssetId,
    res: Resolution,
) -> rusqlite::Result<Option<CacheEntry>> {
    conn.query_row(
        &format!(
            "SELECT {CACHE_COLUMNS} FROM cache_entries \
             WHERE asset_id = ?1 AND width = ?2 AND height = ?3"
        ),
        params![sql_id(asset_id.0), res.width, res.height],
        cache_row,
    )
    .optional()
}

fn cache_entry_by_id(conn: &Connection, id: CacheEntryId) -> rusqlite::Result<Option<CacheEntry>> {
    conn.query_row(
        &format!("SELECT {CACHE_COLUMNS} FROM cache_entries WHERE id = ?1"),
        params![sql_id(id.0)],
        cache_row,
    )
    .optional()
}

fn delete_cache_entry(conn: &Connection, id: CacheEntryId) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM cache_entries WHERE id = ?1",
        params![sql_id(id.0)],
    )?;
    Ok(())
}

/// Persistent catalog of assets, per-resolution cache entries, and stream sessions, kept in a
/// SQLite database.
///
/// Every mutating operation is one immediate transaction, so the check and the write it guards
/// are atomic across threads and across processes sharing the file. Cache entries are unique per
/// (asset, width, height).
pub struct MetadataStore {
    path: Option<PathBuf>,
    session_log_limit: usize,
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// Open the database at `path`, creating it and its tables if needed.
    pub fn open(path: impl Into<PathBuf>, session_log_limit: usize) -> FramecastResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create catalog dir '{}'", parent.display()))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("open catalog '{}'", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: Some(path),
            session_log_limit: session_log_limit.max(1),
            conn: Mutex::new(conn),
        })
    }

    /// Open an existing database for inspection. Every write fails.
    pub fn read_only(path: impl AsRef<Path>) -> FramecastResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("open catalog '{}'", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            path: None,
            session_log_limit: 1,
            conn: Mutex::new(conn),
        })
    }

    /// A private database that lives only as long as the store.
    pub fn in_memory() -> FramecastResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: None,
            session_log_limit: 10_000,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> FramecastResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| FramecastError::store("catalog lock poisoned"))
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> FramecastResult<T> {
        let conn = self.lock()?;
        Ok(f(&*conn)?)
    }

    fn write<T>(&self, f: impl FnOnce(&Connection) -> FramecastResult<T>) -> FramecastResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&*tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Forget every reader registration. Only the process that serves streams may call this,
    /// once at startup: the counts it clears belong to a server that exited.
    pub fn reset_readers(&self) -> FramecastResult<usize> {
        self.write(|tx| {
            Ok(tx.execute(
                "UPDATE cache_entries SET currently_playing = 0 WHERE currently_playing <> 0",
                [],
            )?)
        })
    }

    // ---- assets -------------------------------------------------------------------------------

    /// Fold one scanned file into the catalog.
    ///
    /// `first_seen` is set only on insert. An existing record is rewritten only when the checksum
    /// differs; play statistics survive the rewrite.
    pub fn upsert_asset(
        &self,
        scanned: &ScannedAsset,
        now: DateTime<Utc>,
    ) -> FramecastResult<UpsertOutcome> {
        self.write(|tx| {
            let existing = tx
                .query_row(
                    "SELECT id, checksum FROM assets WHERE name = ?1",
                    params![scanned.name],
                    |row| Ok((uint(row, 0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;
            match existing {
                Some((id, checksum)) if checksum == scanned.checksum => {
                    Ok(UpsertOutcome::Unchanged(AssetId(id)))
                }
                Some((id, _)) => {
                    tx.execute(
                        "UPDATE assets SET filename = ?2, width = ?3, height = ?4, \
                         n_frames = ?5, checksum = ?6 WHERE id = ?1",
                        params![
                            sql_id(id),
                            scanned.filename,
                            scanned.resolution.width,
                            scanned.resolution.height,
                            scanned.n_frames,
                            scanned.checksum,
                        ],
                    )?;
                    Ok(UpsertOutcome::Modified(AssetId(id)))
                }
                None => {
                    tx.execute(
                        "INSERT INTO assets \
                         (name, filename, width, height, n_frames, checksum, first_seen) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            scanned.name,
                            scanned.filename,
                            scanned.resolution.width,
                            scanned.resolution.height,
                            scanned.n_frames,
                            scanned.checksum,
                            now,
                        ],
                    )?;
                    let id = tx.last_insert_rowid().max(0) as u64;
                    Ok(UpsertOutcome::Inserted(AssetId(id)))
                }
            }
        })
    }

    /// Drop every asset whose source filename is not in `filenames`; returns what was dropped.
    ///
    /// Cache entries of dropped assets are left for the eviction pass, which owns file deletion.
    pub fn remove_assets_not_in(
        &self,
        filenames: &HashSet<String>,
    ) -> FramecastResult<Vec<AssetRecord>> {
        self.write(|tx| {
            let all = tx
                .prepare(&format!("SELECT {ASSET_COLUMNS} FROM assets"))?
                .query_map([], asset_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let gone: Vec<AssetRecord> = all
                .into_iter()
                .filter(|a| !filenames.contains(&a.filename))
                .collect();
            for asset in &gone {
                tx.execute("DELETE FROM assets WHERE id = ?1", params![sql_id(asset.id.0)])?;
            }
            Ok(gone)
        })
    }

    pub fn asset_by_name(&self, name: &str) -> FramecastResult<Option<AssetRecord>> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {ASSET_COLUMNS} FROM assets WHERE name = ?1"),
                params![name],
                asset_row,
            )
            .optional()
        })
    }

    pub fn asset(&self, id: AssetId) -> FramecastResult<Option<AssetRecord>> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {ASSET_COLUMNS} FROM assets WHERE id = ?1"),
                params![sql_id(id.0)],
                asset_row,
            )
            .optional()
        })
    }

    pub fn assets(&self) -> FramecastResult<Vec<AssetRecord>> {
        self.read(|conn| {
            conn.prepare(&format!("SELECT {ASSET_COLUMNS} FROM assets ORDER BY name"))?
                .query_map([], asset_row)?
                .collect()
        })
    }

    pub fn assets_at(&self, res: Resolution) -> FramecastResult<Vec<AssetRecord>> {
        self.read(|conn| {
            conn.prepare(&format!(
                "SELECT {ASSET_COLUMNS} FROM assets WHERE width = ?1 AND height = ?2 \
                 ORDER BY name"
            ))?
            .query_map(params![res.width, res.height], asset_row)?
            .collect()
        })
    }

    /// Distinct resolutions present in the catalog.
    pub fn catalog_resolutions(&self) -> FramecastResult<BTreeSet<Resolution>> {
        self.read(|conn| {
            conn.prepare("SELECT DISTINCT width, height FROM assets")?
                .query_map([], |row| {
                    Ok(Resolution {
                        width: row.get(0)?,
                        height: row.get(1)?,
                    })
                })?
                .collect()
        })
    }

    /// Distinct resolutions present in the catalog or among cache entries.
    pub fn all_resolutions(&self) -> FramecastResult<BTreeSet<Resolution>> {
        self.read(|conn| {
            conn.prepare(
                "SELECT width, height FROM assets UNION SELECT width, height FROM cache_entries",
            )?
            .query_map([], |row| {
                Ok(Resolution {
                    width: row.get(0)?,
                    height: row.get(1)?,
                })
            })?
            .collect()
        })
    }

    /// The `n` assets at `res` with the lowest (play count, last played) pairs.
    ///
    /// Never-played assets sort before any played one; ties fall back to catalog id.
    pub fn least_played(&self, res: Resolution, n: usize) -> FramecastResult<Vec<AssetRecord>> {
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        self.read(|conn| {
            conn.prepare(&format!(
                "SELECT {ASSET_COLUMNS} FROM assets WHERE width = ?1 AND height = ?2 \
                 ORDER BY play_count, last_played, id LIMIT ?3"
            ))?
            .query_map(params![res.width, res.height, limit], asset_row)?
            .collect()
        })
    }

    /// Count one accepted stream request against the asset.
    pub fn record_play(&self, id: AssetId, now: DateTime<Utc>) -> FramecastResult<()> {
        self.write(|tx| {
            let changed = tx.execute(
                "UPDATE assets SET play_count = play_count + 1, last_played = ?2 WHERE id = ?1",
                params![sql_id(id.0), now],
            )?;
            if changed == 0 {
                return Err(FramecastError::not_found(format!("asset id {}", id.0)));
            }
            Ok(())
        })
    }

    // ---- cache entries ------------------------------------------------------------------------

    pub fn cache_entry_for(
        &self,
        asset_id: AssetId,
        res: Resolution,
    ) -> FramecastResult<Option<CacheEntry>> {
        self.read(|conn| cache_entry_at(conn, asset_id, res))
    }

    pub fn cache_entries(&self) -> FramecastResult<Vec<CacheEntry>> {
        self.read(|conn| {
            conn.prepare(&format!("SELECT {CACHE_COLUMNS} FROM cache_entries ORDER BY id"))?
                .query_map([], cache_row)?
                .collect()
        })
    }

    pub fn cache_entries_at(&self, res: Resolution) -> FramecastResult<Vec<CacheEntry>> {
        self.read(|conn| {
            conn.prepare(&format!(
                "SELECT {CACHE_COLUMNS} FROM cache_entries WHERE width = ?1 AND height = ?2 \
                 ORDER BY id"
            ))?
            .query_map(params![res.width, res.height], cache_row)?
            .collect()
        })
    }

    /// Record freshly written frames for (asset, resolution), replacing any previous entry.
    ///
    /// Replacement resets usage statistics. An entry with active readers is never replaced.
    pub fn put_cache_entry(
        &self,
        asset: &AssetRecord,
        res: Resolution,
        frame_count: u32,
        now: DateTime<Utc>,
    ) -> FramecastResult<CacheEntryId> {
        self.write(|tx| {
            if let Some(old) = cache_entry_at(tx, asset.id, res)? {
                if old.is_playing() {
                    return Err(FramecastError::store(format!(
                        "cache entry for '{}' at {res} is being streamed",
                        asset.name
                    )));
                }
                delete_cache_entry(tx, old.id)?;
            }
            tx.execute(
                "INSERT INTO cache_entries \
                 (asset_id, asset_name, width, height, source_checksum, cached_at, frame_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    sql_id(asset.id.0),
                    asset.name,
                    res.width,
                    res.height,
                    asset.checksum,
                    now,
                    frame_count,
                ],
            )?;
            Ok(CacheEntryId(tx.last_insert_rowid().max(0) as u64))
        })
    }

    pub fn set_scheduled(&self, id: CacheEntryId, scheduled: bool) -> FramecastResult<()> {
        self.write(|tx| {
            tx.execute(
                "UPDATE cache_entries SET scheduled_for_deletion = ?2 WHERE id = ?1",
                params![sql_id(id.0), scheduled],
            )?;
            Ok(())
        })
    }

    /// Take an idle entry out of service so its files can be rewritten.
    ///
    /// Returns `false` when the entry has readers; a claimed entry is refused by
    /// [`Self::acquire_playback`] until it is replaced.
    pub fn claim_for_rebuild(&self, id: CacheEntryId) -> FramecastResult<bool> {
        self.write(|tx| match cache_entry_by_id(tx, id)? {
            Some(entry) if entry.is_playing() => Ok(false),
            Some(_) => {
                tx.execute(
                    "UPDATE cache_entries SET scheduled_for_deletion = 1 WHERE id = ?1",
                    params![sql_id(id.0)],
                )?;
                Ok(true)
            }
            None => Ok(true),
        })
    }

    /// Register a reader on the entry for (asset, resolution) if it can serve `min_frames`.
    ///
    /// Entries that are scheduled for deletion or were built from a different source checksum
    /// are refused.
    pub fn acquire_playback(
        &self,
        asset: &AssetRecord,
        res: Resolution,
        min_frames: u32,
    ) -> FramecastResult<Option<CacheEntry>> {
        self.write(|tx| {
            let Some(mut entry) = cache_entry_at(tx, asset.id, res)? else {
                return Ok(None);
            };
            if entry.scheduled_for_deletion
                || entry.source_checksum != asset.checksum
                || entry.frame_count < min_frames
            {
                return Ok(None);
            }
            tx.execute(
                "UPDATE cache_entries SET currently_playing = currently_playing + 1 WHERE id = ?1",
                params![sql_id(entry.id.0)],
            )?;
            entry.readers += 1;
            Ok(Some(entry))
        })
    }

    /// Drop a reader registered by [`Self::acquire_playback`], folding in what it measured.
    pub fn release_playback(
        &self,
        id: CacheEntryId,
        stats: Option<PlaybackStats>,
        now: DateTime<Utc>,
    ) -> FramecastResult<()> {
        self.write(|tx| {
            tx.execute(
                "UPDATE cache_entries SET currently_playing = MAX(currently_playing - 1, 0) \
                 WHERE id = ?1",
                params![sql_id(id.0)],
            )?;
            if let Some(stats) = stats {
                tx.execute(
                    "UPDATE cache_entries SET last_used = ?2, play_count = play_count + 1, \
                     avg_fps = ?3 WHERE id = ?1",
                    params![sql_id(id.0), now, stats.fps],
                )?;
            }
            Ok(())
        })
    }

    /// Remove the row iff it is still scheduled for deletion and has no readers.
    ///
    /// The check and the removal share one transaction, so a stream can never start reading an
    /// entry whose files are about to be deleted.
    pub fn remove_if_evictable(&self, id: CacheEntryId) -> FramecastResult<Option<CacheEntry>> {
        self.write(|tx| {
            let Some(entry) = cache_entry_by_id(tx, id)? else {
                return Ok(None);
            };
            if !entry.scheduled_for_deletion || entry.is_playing() {
                return Ok(None);
            }
            delete_cache_entry(tx, id)?;
            Ok(Some(entry))
        })
    }

    /// Remove the row unless it has readers, regardless of its schedule flag.
    pub fn remove_unless_playing(&self, id: CacheEntryId) -> FramecastResult<Option<CacheEntry>> {
        self.write(|tx| {
            let Some(entry) = cache_entry_by_id(tx, id)? else {
                return Ok(None);
            };
            if entry.is_playing() {
                return Ok(None);
            }
            delete_cache_entry(tx, id)?;
            Ok(Some(entry))
        })
    }

    // ---- sessions -----------------------------------------------------------------------------

    /// Log an accepted request before any frame is sent.
    pub fn begin_session(
        &self,
        session: NewSession,
        now: DateTime<Utc>,
    ) -> FramecastResult<SessionId> {
        let keep = i64::try_from(self.session_log_limit).unwrap_or(i64::MAX);
        self.write(|tx| {
            tx.execute(
                "INSERT INTO sessions \
                 (time, client_addr, asset_id, request, frame_from, frame_to, width, height) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    now,
                    session.client_addr,
                    sql_id(session.asset_id.0),
                    session.request,
                    session.frame_from,
                    session.frame_to,
                    session.resolution.width,
                    session.resolution.height,
                ],
            )?;
            let id = SessionId(tx.last_insert_rowid().max(0) as u64);
            tx.execute(
                "DELETE FROM sessions WHERE id NOT IN \
                 (SELECT id FROM sessions ORDER BY id DESC LIMIT ?1)",
                params![keep],
            )?;
            Ok(id)
        })
    }

    pub fn finish_session(&self, id: SessionId, frames_sent: u32, fps: f64) -> FramecastResult<()> {
        self.write(|tx| {
            tx.execute(
                "UPDATE sessions SET frames_sent = ?2, fps = ?3 WHERE id = ?1",
                params![sql_id(id.0), frames_sent, fps],
            )?;
            Ok(())
        })
    }

    /// Logged sessions, oldest first.
    pub fn sessions(&self) -> FramecastResult<Vec<StreamSession>> {
        self.read(|conn| {
            conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY id"))?
                .query_map([], session_row)?
                .collect()
        })
    }
}

#[cfg(test)]
#[path = "../../tests/unit/store/catalog.rs"]
mod tests;
