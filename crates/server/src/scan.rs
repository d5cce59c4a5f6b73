use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use common::{LibraryScan, ScanTotals};
use library::{
    crawl, Catalog, LibraryError, LibraryStats, ScanRequest, ScanStore, TrackOutcome,
    LEASE_EXPIRED_MESSAGE,
};
use metadata::MetadataError;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ScanSettings;
use crate::progress::{timestamp, Broadcaster, CompletedEvent, ErrorEvent, ProgressEvent};
use crate::queue::{JobQueue, QueueError, ScanJob};
use crate::reconcile::Reconciler;

pub const CANCELLED_MESSAGE: &str = "scan cancelled";

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("a library scan is already running: {0}")]
    Conflict(String),
    #[error("scan not found: {0}")]
    NotFound(String),
    #[error("scan already finished: {0}")]
    Finished(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("scan cancelled")]
    Cancelled,
    /// The scan ended and its failure is already recorded.
    #[error("scan failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Library(LibraryError),
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<LibraryError> for ScanError {
    fn from(err: LibraryError) -> Self {
        match err {
            LibraryError::ScanConflict(id) => ScanError::Conflict(id),
            LibraryError::ScanNotFound(id) => ScanError::NotFound(id),
            LibraryError::ScanFinished(id) => ScanError::Finished(id),
            LibraryError::Metadata(err) => ScanError::Metadata(err),
            other => ScanError::Library(other),
        }
    }
}

impl ScanError {
    /// Errors that left the scan record live, so another attempt can pick
    /// the job up again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScanError::Library(_) | ScanError::Join(_))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanCounters {
    pub files_scanned: usize,
    pub total_files: usize,
    pub tracks_created: u32,
    pub tracks_updated: u32,
    pub albums_created: u32,
    pub artists_created: u32,
    pub covers_extracted: u32,
    pub errors: u32,
}

impl ScanCounters {
    pub fn percent(&self) -> u8 {
        if self.total_files == 0 {
            return 0;
        }
        (self.files_scanned.min(self.total_files) * 100 / self.total_files) as u8
    }

    pub fn totals(&self, tracks_deleted: u32) -> ScanTotals {
        ScanTotals {
            tracks_added: self.tracks_created,
            tracks_updated: self.tracks_updated,
            tracks_deleted,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    pub default_root: Option<PathBuf>,
    pub settings: ScanSettings,
}

/// Owns scan lifecycles: start requests, queued processing, cancellation.
#[derive(Clone)]
pub struct ScanService {
    inner: Arc<ScanInner>,
}

struct ScanInner {
    store: ScanStore,
    reconciler: Reconciler,
    broadcaster: Broadcaster,
    queue: Arc<dyn JobQueue>,
    options: ScanOptions,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

impl ScanService {
    pub fn new(
        store: ScanStore,
        reconciler: Reconciler,
        broadcaster: Broadcaster,
        queue: Arc<dyn JobQueue>,
        options: ScanOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ScanInner {
                store,
                reconciler,
                broadcaster,
                queue,
                options,
                cancellations: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    pub fn catalog(&self) -> &Catalog {
        self.inner.reconciler.catalog()
    }

    /// Records a pending full scan and queues it. Fails with `Conflict` while
    /// another full scan is live; no record is created in that case.
    pub async fn start_scan(
        &self,
        root_path: Option<String>,
        recursive: Option<bool>,
        prune_deleted: Option<bool>,
    ) -> Result<LibraryScan, ScanError> {
        let settings = &self.inner.options.settings;
        let root_path = match root_path
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            Some(value) => value,
            None => self
                .inner
                .options
                .default_root
                .as_ref()
                .map(|root| root.to_string_lossy().to_string())
                .ok_or_else(|| ScanError::BadRequest("no music root configured".to_string()))?,
        };
        let request = ScanRequest {
            root_path,
            recursive: recursive.unwrap_or(settings.recursive),
            prune_deleted: prune_deleted.unwrap_or(settings.prune_deleted),
        };

        let store = self.inner.store.clone();
        let lease = settings.lease();
        let pending = request.clone();
        let scan = blocking(move || store.create_full_scan(&pending, lease)).await?;
        self.token_for(&scan.id);

        let job = ScanJob::Full {
            scan_id: scan.id.clone(),
            request,
        };
        if let Err(err) = self.inner.queue.enqueue(job) {
            self.inner.cancellations.lock().remove(&scan.id);
            let store = self.inner.store.clone();
            let scan_id = scan.id.clone();
            let message = err.to_string();
            if let Err(fail_err) = blocking(move || store.fail(&scan_id, &message)).await {
                warn!("Failed to record unqueued scan {}: {}", scan.id, fail_err);
            }
            return Err(err.into());
        }
        info!("Queued scan {} for {}", scan.id, scan.root_path);
        Ok(scan)
    }

    /// Queues an incremental pass over `files`. The returned id only labels
    /// events; incremental passes are not recorded in the scan store.
    pub fn start_incremental(&self, files: Vec<PathBuf>) -> Result<String, ScanError> {
        if files.is_empty() {
            return Err(ScanError::BadRequest("no files to scan".to_string()));
        }
        let scan_id = uuid::Uuid::new_v4().to_string();
        self.token_for(&scan_id);
        let count = files.len();
        if let Err(err) = self.inner.queue.enqueue(ScanJob::Incremental {
            scan_id: scan_id.clone(),
            files,
        }) {
            self.inner.cancellations.lock().remove(&scan_id);
            return Err(err.into());
        }
        info!("Queued incremental scan {} ({} files)", scan_id, count);
        Ok(scan_id)
    }

    pub async fn get_scan(&self, scan_id: &str) -> Result<LibraryScan, ScanError> {
        let store = self.inner.store.clone();
        let id = scan_id.to_string();
        blocking(move || store.get(&id))
            .await?
            .ok_or_else(|| ScanError::NotFound(scan_id.to_string()))
    }

    pub async fn list_scans(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<LibraryScan>, usize), ScanError> {
        let store = self.inner.store.clone();
        blocking(move || store.list(page, page_size)).await
    }

    pub async fn active_scan(&self) -> Result<Option<LibraryScan>, ScanError> {
        let store = self.inner.store.clone();
        blocking(move || store.active()).await
    }

    pub async fn stats(&self) -> Result<LibraryStats, ScanError> {
        let catalog = self.catalog().clone();
        blocking(move || catalog.stats()).await
    }

    /// Stops a queued or running scan at the next file boundary. A live
    /// record nobody is processing here is failed directly.
    pub async fn cancel(&self, scan_id: &str) -> Result<(), ScanError> {
        let token = self.inner.cancellations.lock().get(scan_id).cloned();
        if let Some(token) = token {
            token.cancel();
            info!("Cancellation requested for scan {}", scan_id);
            return Ok(());
        }

        let scan = self.get_scan(scan_id).await?;
        if scan.status.is_terminal() {
            return Err(ScanError::Finished(scan.id));
        }
        let store = self.inner.store.clone();
        let id = scan.id.clone();
        blocking(move || store.fail(&id, CANCELLED_MESSAGE)).await?;
        warn!("Scan {} had no local worker; marked cancelled", scan_id);
        Ok(())
    }

    /// Runs a job once, with no retry to follow.
    pub async fn process(&self, job: ScanJob) -> Result<(), ScanError> {
        self.process_attempt(job, true).await
    }

    /// Queue entrypoint for one job attempt. The scan's cancellation token
    /// survives only a retryable failure that another attempt will follow.
    pub async fn process_attempt(&self, job: ScanJob, last_attempt: bool) -> Result<(), ScanError> {
        let scan_id = job.scan_id().to_string();
        let result = match job {
            ScanJob::Full { scan_id, request } => self.run_full(&scan_id, &request).await,
            ScanJob::Incremental { scan_id, files } => self.run_incremental(&scan_id, files).await,
        };
        self.settle(&scan_id, &result, last_attempt);
        result
    }

    fn settle(&self, scan_id: &str, result: &Result<(), ScanError>, last_attempt: bool) {
        let retry_pending = !last_attempt && matches!(result, Err(err) if err.is_retryable());
        if !retry_pending {
            self.inner.cancellations.lock().remove(scan_id);
        }
    }

    async fn run_full(&self, scan_id: &str, request: &ScanRequest) -> Result<(), ScanError> {
        let token = self.token_for(scan_id);
        let started = Instant::now();
        let mut counters = ScanCounters::default();
        if token.is_cancelled() {
            return self.fail_scan(scan_id, ScanError::Cancelled).await;
        }

        let store = self.inner.store.clone();
        let id = scan_id.to_string();
        blocking(move || store.mark_running(&id)).await?;
        info!("Scan {} running over {}", scan_id, request.root_path);
        self.publish_progress(scan_id, &counters, None, "Scan started".to_string());

        let tracks_deleted = match self
            .crawl_and_reconcile(scan_id, request, &token, &mut counters)
            .await
        {
            Ok(tracks_deleted) => tracks_deleted,
            Err(err) => return self.fail_scan(scan_id, err).await,
        };

        let totals = counters.totals(tracks_deleted);
        let store = self.inner.store.clone();
        let id = scan_id.to_string();
        blocking(move || store.complete(&id, totals)).await?;
        info!(
            "Scan {} completed: {} added, {} updated, {} deleted, {} errors",
            scan_id, totals.tracks_added, totals.tracks_updated, totals.tracks_deleted, counters.errors
        );
        self.publish_completed(scan_id, &counters, tracks_deleted, started);
        Ok(())
    }

    async fn crawl_and_reconcile(
        &self,
        scan_id: &str,
        request: &ScanRequest,
        token: &CancellationToken,
        counters: &mut ScanCounters,
    ) -> Result<u32, ScanError> {
        let root = PathBuf::from(&request.root_path);
        let recursive = request.recursive;
        let files = blocking(move || crawl(&root, recursive)).await?;
        counters.total_files = files.len();
        self.publish_progress(
            scan_id,
            counters,
            None,
            format!("Found {} audio files", files.len()),
        );

        let every = self.inner.options.settings.progress_every_full.max(1);
        for file in &files {
            if token.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            self.reconcile_one(scan_id, &file.path, file.size, counters)
                .await;
            counters.files_scanned += 1;
            if counters.files_scanned % every == 0 || counters.files_scanned == counters.total_files
            {
                self.publish_progress(
                    scan_id,
                    counters,
                    Some(&file.path),
                    format!(
                        "Scanned {} of {} files",
                        counters.files_scanned, counters.total_files
                    ),
                );
                self.heartbeat(scan_id, counters.totals(0)).await?;
            }
        }

        if !request.prune_deleted {
            return Ok(0);
        }
        if token.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let catalog = self.catalog().clone();
        let report = blocking(move || catalog.prune_missing()).await?;
        Ok(report.tracks_deleted)
    }

    async fn run_incremental(&self, scan_id: &str, files: Vec<PathBuf>) -> Result<(), ScanError> {
        let token = self.token_for(scan_id);
        let started = Instant::now();
        let mut counters = ScanCounters {
            total_files: files.len(),
            ..ScanCounters::default()
        };
        self.publish_progress(
            scan_id,
            &counters,
            None,
            format!("Incremental scan of {} files", files.len()),
        );

        let every = self.inner.options.settings.progress_every_incremental.max(1);
        for path in &files {
            if token.is_cancelled() {
                self.inner.broadcaster.publish_failed(ErrorEvent {
                    scan_id: scan_id.to_string(),
                    file: None,
                    error: CANCELLED_MESSAGE.to_string(),
                    timestamp: timestamp(),
                });
                return Err(ScanError::Cancelled);
            }
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_file() => {
                    self.reconcile_one(scan_id, path, meta.len(), &mut counters)
                        .await;
                }
                Ok(_) => self.record_file_error(scan_id, path, "not a regular file", &mut counters),
                Err(err) => self.record_file_error(scan_id, path, &err.to_string(), &mut counters),
            }
            counters.files_scanned += 1;
            if counters.files_scanned % every == 0 || counters.files_scanned == counters.total_files
            {
                self.publish_progress(
                    scan_id,
                    &counters,
                    Some(path),
                    format!(
                        "Scanned {} of {} files",
                        counters.files_scanned, counters.total_files
                    ),
                );
            }
        }

        info!(
            "Incremental scan {} finished: {} created, {} updated, {} errors",
            scan_id, counters.tracks_created, counters.tracks_updated, counters.errors
        );
        self.publish_completed(scan_id, &counters, 0, started);
        Ok(())
    }

    async fn reconcile_one(
        &self,
        scan_id: &str,
        path: &Path,
        size: u64,
        counters: &mut ScanCounters,
    ) {
        match self.inner.reconciler.reconcile(path, size).await {
            Ok(outcome) => {
                match outcome.applied.outcome {
                    TrackOutcome::Created => counters.tracks_created += 1,
                    TrackOutcome::Updated => counters.tracks_updated += 1,
                }
                if outcome.applied.artist_created {
                    counters.artists_created += 1;
                }
                if outcome.applied.album_created {
                    counters.albums_created += 1;
                }
                if outcome.cover_extracted {
                    counters.covers_extracted += 1;
                }
            }
            Err(err) => self.record_file_error(scan_id, path, &err.to_string(), counters),
        }
    }

    fn record_file_error(
        &self,
        scan_id: &str,
        path: &Path,
        error: &str,
        counters: &mut ScanCounters,
    ) {
        counters.errors += 1;
        warn!("Skipping {:?}: {}", path, error);
        self.inner.broadcaster.publish_error(ErrorEvent {
            scan_id: scan_id.to_string(),
            file: Some(path.to_string_lossy().to_string()),
            error: error.to_string(),
            timestamp: timestamp(),
        });
    }

    /// A record that another start request reclaimed stops the scan; other
    /// heartbeat failures are only logged.
    async fn heartbeat(&self, scan_id: &str, totals: ScanTotals) -> Result<(), ScanError> {
        let store = self.inner.store.clone();
        let id = scan_id.to_string();
        match blocking(move || store.touch(&id, totals)).await {
            Ok(_) => Ok(()),
            Err(ScanError::Finished(id)) => Err(ScanError::Finished(id)),
            Err(err) => {
                warn!("Failed to refresh heartbeat for scan {}: {}", scan_id, err);
                Ok(())
            }
        }
    }

    /// Persists the failure, then tells observers. A record that something
    /// else already finished (a lease reclaim, a direct cancel) is reported
    /// with its stored message. Any other store error is returned so the
    /// queue retries the job.
    async fn fail_scan(&self, scan_id: &str, err: ScanError) -> Result<(), ScanError> {
        let message = match &err {
            ScanError::Cancelled => CANCELLED_MESSAGE.to_string(),
            other => other.to_string(),
        };
        let store = self.inner.store.clone();
        let id = scan_id.to_string();
        let recorded = message.clone();
        let message = match blocking(move || store.fail(&id, &recorded)).await {
            Ok(_) => message,
            Err(ScanError::Finished(_)) => self
                .get_scan(scan_id)
                .await
                .ok()
                .and_then(|scan| scan.error_message)
                .unwrap_or_else(|| LEASE_EXPIRED_MESSAGE.to_string()),
            Err(store_err) => return Err(store_err),
        };

        warn!("Scan {} failed: {}", scan_id, message);
        self.inner.broadcaster.publish_failed(ErrorEvent {
            scan_id: scan_id.to_string(),
            file: None,
            error: message.clone(),
            timestamp: timestamp(),
        });
        match err {
            ScanError::Cancelled => Err(ScanError::Cancelled),
            _ => Err(ScanError::Failed(message)),
        }
    }

    fn publish_progress(
        &self,
        scan_id: &str,
        counters: &ScanCounters,
        current_file: Option<&Path>,
        message: String,
    ) {
        self.inner.broadcaster.publish_progress(ProgressEvent {
            scan_id: scan_id.to_string(),
            status: "running".to_string(),
            percent: counters.percent(),
            files_scanned: counters.files_scanned,
            total_files: counters.total_files,
            tracks_created: counters.tracks_created,
            albums_created: counters.albums_created,
            artists_created: counters.artists_created,
            covers_extracted: counters.covers_extracted,
            errors: counters.errors,
            current_file: current_file.map(|path| path.to_string_lossy().to_string()),
            message,
        });
    }

    fn publish_completed(
        &self,
        scan_id: &str,
        counters: &ScanCounters,
        tracks_deleted: u32,
        started: Instant,
    ) {
        self.inner.broadcaster.publish_completed(CompletedEvent {
            scan_id: scan_id.to_string(),
            tracks_added: counters.tracks_created,
            tracks_updated: counters.tracks_updated,
            tracks_deleted,
            albums_created: counters.albums_created,
            artists_created: counters.artists_created,
            covers_extracted: counters.covers_extracted,
            files_scanned: counters.files_scanned,
            errors: counters.errors,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: timestamp(),
        });
    }

    fn token_for(&self, scan_id: &str) -> CancellationToken {
        self.inner
            .cancellations
            .lock()
            .entry(scan_id.to_string())
            .or_default()
            .clone()
    }
}

async fn blocking<T, F>(task: F) -> Result<T, ScanError>
where
    F: FnOnce() -> Result<T, LibraryError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(task).await??)
}
