use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::foundation::core::Resolution;

/// Catalog identity of a source animation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetId(pub u64);

/// Identity of one per-resolution cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheEntryId(pub u64);

/// Identity of one logged stream session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// One source animation tracked in the catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: AssetId,
    /// File stem; the name clients ask for.
    pub name: String,
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub n_frames: u32,
    /// Hex SHA-256 of the source file bytes.
    pub checksum: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_played: Option<DateTime<Utc>>,
    pub play_count: u64,
}

impl AssetRecord {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }
}

/// What one scan learned about a source file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScannedAsset {
    pub name: String,
    pub filename: String,
    pub resolution: Resolution,
    pub n_frames: u32,
    pub checksum: String,
}

/// Result of folding one scanned file into the catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(AssetId),
    Modified(AssetId),
    Unchanged(AssetId),
}

/// Pre-decoded frames of one asset at one resolution, plus usage accounting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: CacheEntryId,
    pub asset_id: AssetId,
    /// Directory name under the resolution folder; kept so orphans can still be located.
    pub asset_name: String,
    pub width: u32,
    pub height: u32,
    /// Source checksum the frames were built from.
    pub source_checksum: String,
    pub cached_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub frame_count: u32,
    pub play_count: u64,
    pub avg_fps: Option<f64>,
    pub scheduled_for_deletion: bool,
    /// Streams currently reading this entry's frame files.
    #[serde(rename = "currently_playing")]
    pub readers: u32,
}

impl CacheEntry {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.readers > 0
    }

    /// Played at least once and idle long enough to give its slot away.
    ///
    /// Idle means either longer than `stale_after`, or longer than three full loops at the
    /// entry's own measured rate.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if self.play_count == 0 {
            return false;
        }
        let Some(last_used) = self.last_used else {
            return false;
        };
        let idle_secs = (now - last_used).num_milliseconds() as f64 / 1000.0;
        if idle_secs > stale_after.as_secs_f64() {
            return true;
        }
        match self.avg_fps {
            Some(fps) if fps > 0.0 && self.frame_count > 0 => {
                idle_secs > 3.0 * f64::from(self.frame_count) / fps
            }
            _ => false,
        }
    }
}

/// Usage measured by one finished stream, folded into the cache entry it read from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaybackStats {
    pub frames_sent: u32,
    pub fps: f64,
}

/// Log row for one accepted stream request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamSession {
    pub id: SessionId,
    pub time: DateTime<Utc>,
    pub client_addr: String,
    pub asset_id: AssetId,
    pub request: String,
    pub frame_from: u32,
    pub frame_to: u32,
    pub width: u32,
    pub height: u32,
    pub frames_sent: Option<u32>,
    pub fps: Option<f64>,
}

/// Fields of a session known when the request is accepted.
#[derive(Clone, Debug)]
pub struct NewSession {
    pub client_addr: String,
    pub asset_id: AssetId,
    pub request: String,
    pub frame_from: u32,
    pub frame_to: u32,
    pub resolution: Resolution,
}
