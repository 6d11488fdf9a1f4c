use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::{
    foundation::{core::Resolution, error::FramecastResult},
    scanner::CacheScanner,
    store::{AssetId, AssetRecord, CacheEntry},
};

/// Counts from one population step at one resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PopulateReport {
    pub built: usize,
    pub replaced: usize,
    /// Selected assets left uncached because no slot could be freed this pass.
    pub deferred: usize,
    pub failed: usize,
}

impl PopulateReport {
    fn absorb(&mut self, outcome: BuildOutcome) {
        match outcome {
            BuildOutcome::Fresh => {}
            BuildOutcome::Built => self.built += 1,
            BuildOutcome::Busy | BuildOutcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BuildOutcome {
    /// Already cached from the current source bytes.
    Fresh,
    Built,
    /// Needs a rebuild but a stream is reading it.
    Busy,
    Failed,
}

impl CacheScanner {
    /// Bring the on-disk cache for `res` up to date with the catalog.
    ///
    /// With no more assets than the cache limit every asset is cached and nothing stays
    /// scheduled. Otherwise the `cache_limit` least-played assets are selected; a selected asset
    /// that is not cached takes a free slot, or the slot of an evictable entry outside the
    /// selection. The entry count at `res` never grows past the limit.
    #[tracing::instrument(skip_all, fields(res = %res))]
    pub(crate) fn populate(
        &self,
        res: Resolution,
        now: DateTime<Utc>,
    ) -> FramecastResult<PopulateReport> {
        let limit = self.cfg.cache_limit;
        let mut report = PopulateReport::default();
        let assets = self.store.assets_at(res)?;

        if assets.len() <= limit {
            for asset in &assets {
                report.absorb(self.ensure_cached(asset, res, now)?);
                if let Some(entry) = self.store.cache_entry_for(asset.id, res)?
                    && entry.scheduled_for_deletion
                {
                    self.store.set_scheduled(entry.id, false)?;
                }
            }
            return Ok(report);
        }

        let selected = self.store.least_played(res, limit)?;
        let selected_ids: HashSet<_> = selected.iter().map(|a| a.id).collect();
        for asset in &selected {
            let existing = self.store.cache_entry_for(asset.id, res)?;
            if existing.is_none() {
                let entries = self.store.cache_entries_at(res)?;
                if entries.len() >= limit {
                    if !self.free_slot(res, &entries, &selected_ids, now)? {
                        tracing::debug!(asset = %asset.name, "no evictable slot, deferring");
                        report.deferred += 1;
                        continue;
                    }
                    report.replaced += 1;
                }
            }
            report.absorb(self.ensure_cached(asset, res, now)?);
        }
        Ok(report)
    }

    /// Drop the least recently used evictable entry outside `selected`.
    ///
    /// Evictable means played at least once, stale, and without readers; entries that were never
    /// played are not candidates.
    fn free_slot(
        &self,
        res: Resolution,
        entries: &[CacheEntry],
        selected: &HashSet<AssetId>,
        now: DateTime<Utc>,
    ) -> FramecastResult<bool> {
        let stale_after = self.cfg.stale_after();
        let mut candidates: Vec<&CacheEntry> = entries
            .iter()
            .filter(|e| !selected.contains(&e.asset_id))
            .filter(|e| !e.is_playing() && e.is_stale(now, stale_after))
            .collect();
        candidates.sort_by(|a, b| {
            a.last_used
                .cmp(&b.last_used)
                .then(a.cached_at.cmp(&b.cached_at))
        });

        for victim in candidates {
            if let Some(removed) = self.store.remove_unless_playing(victim.id)? {
                tracing::info!(asset = %removed.asset_name, %res, "replaced cache entry");
                self.remove_frames(res, &removed);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Make sure `asset` has a complete cache entry at `res` built from its current checksum.
    fn ensure_cached(
        &self,
        asset: &AssetRecord,
        res: Resolution,
        now: DateTime<Utc>,
    ) -> FramecastResult<BuildOutcome> {
        let claimed = match self.store.cache_entry_for(asset.id, res)? {
            Some(entry)
                if entry.source_checksum == asset.checksum
                    && self.cache.has_asset(res, &asset.name) =>
            {
                return Ok(BuildOutcome::Fresh);
            }
            Some(entry) => {
                if !self.store.claim_for_rebuild(entry.id)? {
                    tracing::info!(asset = %asset.name, %res, "outdated cache entry is streaming, rebuild postponed");
                    return Ok(BuildOutcome::Busy);
                }
                Some(entry)
            }
            None => None,
        };

        let source = self.cfg.source_dir.join(&asset.filename);
        tracing::info!(file = %asset.filename, %res, "caching");
        let built = self
            .codec
            .decode_packed(&source, res)
            .and_then(|frames| self.cache.write_frames(res, &asset.name, &frames));
        match built {
            Ok(written) => {
                self.store.put_cache_entry(asset, res, written, now)?;
                Ok(BuildOutcome::Built)
            }
            Err(err) => {
                tracing::warn!(file = %asset.filename, %res, error = %err, "caching failed");
                // A claimed entry may have lost its files; drop it rather than leave it half-built.
                if let Some(entry) = claimed
                    && self.store.remove_unless_playing(entry.id)?.is_some()
                {
                    self.remove_frames(res, &entry);
                }
                Ok(BuildOutcome::Failed)
            }
        }
    }
}
