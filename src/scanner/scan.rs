use std::{
    collections::HashSet,
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sha2::Digest as _;

use crate::{
    codec::FrameCodec,
    foundation::{core::Resolution, error::FramecastResult},
    store::{MetadataStore, ScannedAsset, UpsertOutcome},
};

/// Counts from reconciling the catalog with the source directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub added: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub skipped: usize,
}

/// Hex SHA-256 of a file's bytes, read in 64 KiB chunks.
pub fn file_checksum(path: &Path) -> FramecastResult<String> {
    let f = File::open(path).with_context(|| format!("open '{}'", path.display()))?;
    let mut reader = BufReader::new(f);
    let mut hasher = sha2::Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("read '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    Ok(out)
}

/// Source animations in `dir`, sorted by filename.
pub(crate) fn list_sources(dir: &Path) -> FramecastResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("list source dir '{}'", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "gif") {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Insert, update, and remove catalog rows so they match the files in `source_dir`.
///
/// A file that cannot be read or decoded is logged and skipped; it still counts as present, so
/// an existing record for it is not dropped.
pub(crate) fn scan_sources(
    store: &MetadataStore,
    codec: &FrameCodec,
    source_dir: &Path,
    now: DateTime<Utc>,
) -> FramecastResult<ScanReport> {
    let mut report = ScanReport::default();
    let sources = list_sources(source_dir)?;
    let mut present = HashSet::with_capacity(sources.len());

    for path in &sources {
        let (Some(filename), Some(name)) = (
            path.file_name().and_then(|n| n.to_str()),
            path.file_stem().and_then(|n| n.to_str()),
        ) else {
            tracing::warn!(path = %path.display(), "skipping source with non-UTF-8 name");
            report.skipped += 1;
            continue;
        };
        present.insert(filename.to_string());

        let checksum = match file_checksum(path) {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(%filename, error = %err, "skipping unreadable source");
                report.skipped += 1;
                continue;
            }
        };
        if let Some(existing) = store.asset_by_name(name)?
            && existing.checksum == checksum
            && existing.filename == filename
        {
            report.unchanged += 1;
            continue;
        }

        let info = match codec.probe(path) {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(%filename, error = %err, "skipping undecodable source");
                report.skipped += 1;
                continue;
            }
        };
        let resolution = match Resolution::from_filename_hint(filename) {
            Some(hint) => hint,
            None => Resolution::new(info.width, info.height)?,
        };

        let scanned = ScannedAsset {
            name: name.to_string(),
            filename: filename.to_string(),
            resolution,
            n_frames: info.n_frames,
            checksum,
        };
        match store.upsert_asset(&scanned, now)? {
            UpsertOutcome::Inserted(_) => {
                tracing::info!(
                    %filename, %resolution, n_frames = info.n_frames,
                    checksum = &scanned.checksum[..8], "added"
                );
                report.added += 1;
            }
            UpsertOutcome::Modified(_) => {
                tracing::info!(
                    %filename, %resolution, n_frames = info.n_frames,
                    checksum = &scanned.checksum[..8], "modified"
                );
                report.modified += 1;
            }
            UpsertOutcome::Unchanged(_) => report.unchanged += 1,
        }
    }

    for gone in store.remove_assets_not_in(&present)? {
        tracing::info!(filename = %gone.filename, "removed stale catalog entry");
        report.removed += 1;
    }
    Ok(report)
}
