//! Background maintenance of the catalog and the on-disk frame cache.
//!
//! One pass is scan, then population per catalog resolution, then eviction per resolution. Passes
//! never overlap: the loop runs them one at a time on a blocking thread.

mod evict;
mod populate;
mod scan;

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    cache_dir::CacheDir,
    codec::FrameCodec,
    config::ScannerConfig,
    foundation::{core::Resolution, error::FramecastResult},
    store::MetadataStore,
};

pub use evict::EvictReport;
pub use populate::PopulateReport;
pub use scan::{ScanReport, file_checksum};

/// Everything one maintenance pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub scan: ScanReport,
    pub populated: BTreeMap<Resolution, PopulateReport>,
    pub evicted: BTreeMap<Resolution, EvictReport>,
}

/// Keeps the catalog in step with the source directory and the cache within its limits.
pub struct CacheScanner {
    store: Arc<MetadataStore>,
    cache: CacheDir,
    codec: FrameCodec,
    cfg: ScannerConfig,
}

impl CacheScanner {
    pub fn new(store: Arc<MetadataStore>, cfg: ScannerConfig) -> Self {
        Self {
            store,
            cache: CacheDir::new(cfg.cache_root.clone()),
            codec: FrameCodec::new(),
            cfg,
        }
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn cache(&self) -> &CacheDir {
        &self.cache
    }

    /// Reconcile the catalog with the source directory only.
    pub fn scan_at(&self, now: DateTime<Utc>) -> FramecastResult<ScanReport> {
        scan::scan_sources(&self.store, &self.codec, &self.cfg.source_dir, now)
    }

    pub fn run_pass(&self) -> FramecastResult<PassReport> {
        self.run_pass_at(Utc::now())
    }

    /// One full pass with `now` as the clock; eviction staleness is judged against it.
    pub fn run_pass_at(&self, now: DateTime<Utc>) -> FramecastResult<PassReport> {
        let mut report = PassReport {
            scan: self.scan_at(now)?,
            ..PassReport::default()
        };

        for res in self.store.catalog_resolutions()? {
            report.populated.insert(res, self.populate(res, now)?);
        }
        // Includes resolutions that only have orphaned cache entries left.
        for res in self.store.all_resolutions()? {
            report.evicted.insert(res, self.evict(res, now)?);
        }

        tracing::info!(
            added = report.scan.added,
            modified = report.scan.modified,
            removed = report.scan.removed,
            skipped = report.scan.skipped,
            resolutions = report.populated.len(),
            "scan pass complete"
        );
        Ok(report)
    }

    /// Run passes forever on a background task: once at start, then every scan interval or
    /// whenever [`ScannerHandle::scan_now`] is called, until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> ScannerHandle {
        let wake = Arc::new(Notify::new());
        let scanner = Arc::new(self);
        let task = tokio::spawn(scan_loop(scanner, Arc::clone(&wake), cancel));
        ScannerHandle { wake, task }
    }
}

async fn scan_loop(scanner: Arc<CacheScanner>, wake: Arc<Notify>, cancel: CancellationToken) {
    let interval = scanner.cfg.scan_interval();
    loop {
        let pass = Arc::clone(&scanner);
        match tokio::task::spawn_blocking(move || pass.run_pass()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => tracing::error!(error = %err, "scan pass failed"),
            Err(err) => tracing::error!(error = %err, "scan pass panicked"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => tracing::info!("scan requested"),
            _ = tokio::time::sleep(interval) => {}
        }
    }
    tracing::info!("scanner stopped");
}

/// Control handle for a spawned scanner loop.
pub struct ScannerHandle {
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ScannerHandle {
    /// Start a pass as soon as the current one (if any) finishes.
    pub fn scan_now(&self) {
        self.wake.notify_one();
    }

    /// Wait for the loop to exit after its cancellation token fired.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "scanner task failed");
        }
    }
}
