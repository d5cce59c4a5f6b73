use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use library::ScanRequest;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::QueueSettings;
use crate::scan::{ScanError, ScanService};

/// One unit of queued work.
#[derive(Clone, Debug, PartialEq)]
pub enum ScanJob {
    Full {
        scan_id: String,
        request: ScanRequest,
    },
    Incremental {
        scan_id: String,
        files: Vec<PathBuf>,
    },
}

impl ScanJob {
    pub fn scan_id(&self) -> &str {
        match self {
            ScanJob::Full { scan_id, .. } | ScanJob::Incremental { scan_id, .. } => scan_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job queue is closed")]
    Closed,
}

/// Where the orchestrator hands off work; the transport owns delivery and
/// retries.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: ScanJob) -> Result<(), QueueError>;
}

/// In-process queue backed by an unbounded channel.
#[derive(Clone)]
pub struct LocalJobQueue {
    tx: mpsc::UnboundedSender<ScanJob>,
}

impl LocalJobQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScanJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl JobQueue for LocalJobQueue {
    fn enqueue(&self, job: ScanJob) -> Result<(), QueueError> {
        self.tx.send(job).map_err(|_| QueueError::Closed)
    }
}

/// Exponential backoff between attempts of one job.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            backoff_multiplier: settings.backoff_multiplier,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis.max(0.0) as u64)
    }

    pub fn should_retry(&self, err: &ScanError, attempt: u32) -> bool {
        err.is_retryable() && attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&QueueSettings::default())
    }
}

/// Drains the queue with at most `workers` jobs in flight.
pub fn spawn_workers(
    mut rx: mpsc::UnboundedReceiver<ScanJob>,
    service: ScanService,
    policy: RetryPolicy,
    workers: usize,
) -> JoinHandle<()> {
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let service = service.clone();
            let policy = policy.clone();
            tokio::spawn(async move {
                let _ = run_with_retry(&service, job, &policy).await;
                drop(permit);
            });
        }
        info!("Scan job queue closed");
    })
}

pub async fn run_with_retry(
    service: &ScanService,
    job: ScanJob,
    policy: &RetryPolicy,
) -> Result<(), ScanError> {
    let mut attempt = 1;
    loop {
        let last_attempt = attempt >= policy.max_attempts;
        match service.process_attempt(job.clone(), last_attempt).await {
            Ok(()) => return Ok(()),
            Err(err) if policy.should_retry(&err, attempt) => {
                let delay = policy.backoff(attempt);
                warn!(
                    "Scan job {} attempt {} failed: {}; retrying in {:?}",
                    job.scan_id(),
                    attempt,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                error!(
                    "Scan job {} gave up after {} attempt(s): {}",
                    job.scan_id(),
                    attempt,
                    err
                );
                return Err(err);
            }
        }
    }
}
