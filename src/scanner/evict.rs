use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::{
    foundation::{core::Resolution, error::FramecastResult},
    scanner::CacheScanner,
    store::CacheEntry,
};

/// Counts from one eviction step at one resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvictReport {
    pub orphans: usize,
    pub scheduled: usize,
    pub deleted: usize,
    /// Scheduled entries left in place because a stream was reading them.
    pub busy: usize,
}

impl CacheScanner {
    /// Schedule and delete cache entries at `res` that fall outside the protected set.
    ///
    /// Entries are ranked by most recent use; the first `cache_limit` are protected. The rest are
    /// scheduled only when played and stale, and deleted only when still scheduled and idle. The
    /// check and the row removal are one store transaction, so frames never vanish under a
    /// stream.
    #[tracing::instrument(skip_all, fields(res = %res))]
    pub(crate) fn evict(&self, res: Resolution, now: DateTime<Utc>) -> FramecastResult<EvictReport> {
        let mut report = EvictReport::default();
        let limit = self.cfg.cache_limit;
        let assets = self.store.assets_at(res)?;
        let known: HashSet<_> = assets.iter().map(|a| a.id).collect();

        for entry in self.store.cache_entries_at(res)? {
            if known.contains(&entry.asset_id) {
                continue;
            }
            match self.store.remove_unless_playing(entry.id)? {
                Some(removed) => {
                    tracing::info!(asset = %removed.asset_name, "purged orphan cache entry");
                    self.remove_frames(res, &removed);
                    report.orphans += 1;
                }
                None => report.busy += 1,
            }
        }

        let mut entries = self.store.cache_entries_at(res)?;
        if assets.len() <= limit {
            for entry in entries.iter().filter(|e| e.scheduled_for_deletion) {
                self.store.set_scheduled(entry.id, false)?;
            }
            return Ok(report);
        }

        entries.sort_by(|a, b| {
            b.last_used
                .cmp(&a.last_used)
                .then(b.cached_at.cmp(&a.cached_at))
        });
        let split = limit.min(entries.len());
        let (protected, rest) = entries.split_at(split);
        for entry in protected.iter().filter(|e| e.scheduled_for_deletion) {
            self.store.set_scheduled(entry.id, false)?;
        }

        let stale_after = self.cfg.stale_after();
        for entry in rest {
            let stale = entry.is_stale(now, stale_after);
            if stale {
                report.scheduled += 1;
            }
            if stale != entry.scheduled_for_deletion {
                self.store.set_scheduled(entry.id, stale)?;
            }
        }

        for entry in rest {
            match self.store.remove_if_evictable(entry.id)? {
                Some(removed) => {
                    tracing::info!(
                        asset = %removed.asset_name,
                        play_count = removed.play_count,
                        "evicted cache entry"
                    );
                    self.remove_frames(res, &removed);
                    report.deleted += 1;
                }
                None => {
                    if self
                        .store
                        .cache_entry_for(entry.asset_id, res)?
                        .is_some_and(|e| e.scheduled_for_deletion && e.is_playing())
                    {
                        tracing::debug!(asset = %entry.asset_name, "scheduled entry is streaming");
                        report.busy += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    pub(super) fn remove_frames(&self, res: Resolution, entry: &CacheEntry) {
        if let Err(err) = self.cache.remove_asset(res, &entry.asset_name) {
            tracing::warn!(asset = %entry.asset_name, error = %err, "failed to remove frames");
        }
    }
}
