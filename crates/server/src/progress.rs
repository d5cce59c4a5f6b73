use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub scan_id: String,
    pub status: String,
    pub percent: u8,
    pub files_scanned: usize,
    pub total_files: usize,
    pub tracks_created: u32,
    pub albums_created: u32,
    pub artists_created: u32,
    pub covers_extracted: u32,
    pub errors: u32,
    pub current_file: Option<String>,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub scan_id: String,
    pub file: Option<String>,
    pub error: String,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedEvent {
    pub scan_id: String,
    pub tracks_added: u32,
    pub tracks_updated: u32,
    pub tracks_deleted: u32,
    pub albums_created: u32,
    pub artists_created: u32,
    pub covers_extracted: u32,
    pub files_scanned: usize,
    pub errors: u32,
    pub duration_ms: u64,
    pub timestamp: String,
}

/// Everything a connection can receive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Progress(ProgressEvent),
    Error(ErrorEvent),
    Completed(CompletedEvent),
    Keepalive {
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        action: String,
        scan_id: String,
    },
    Rejected {
        error: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Only connections subscribed to this scan.
    Scan(String),
    /// Every connection.
    Namespace,
    Keepalive,
    /// Replies to one connection's own requests.
    Direct,
}

impl Channel {
    pub fn name(&self) -> String {
        match self {
            Channel::Scan(scan_id) => format!("scan:{}", scan_id),
            Channel::Namespace => "scans".to_string(),
            Channel::Keepalive => "keepalive".to_string(),
            Channel::Direct => "direct".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub channel: Channel,
    pub message: ServerMessage,
}

impl Frame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&serde_json::json!({
            "channel": self.channel.name(),
            "message": self.message,
        }))
    }
}

/// Fans scan events out to connected observers and remembers the last
/// progress event of every live scan for late subscribers.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Frame>,
    last_progress: Arc<Mutex<HashMap<String, ProgressEvent>>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            last_progress: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn publish_progress(&self, event: ProgressEvent) {
        self.last_progress
            .lock()
            .insert(event.scan_id.clone(), event.clone());
        let scan_id = event.scan_id.clone();
        self.send_twice(&scan_id, ServerMessage::Progress(event));
    }

    pub fn publish_error(&self, event: ErrorEvent) {
        let scan_id = event.scan_id.clone();
        self.send_twice(&scan_id, ServerMessage::Error(event));
    }

    /// A fatal error: the scan is over, so its catch-up record goes too.
    pub fn publish_failed(&self, event: ErrorEvent) {
        self.last_progress.lock().remove(&event.scan_id);
        self.publish_error(event);
    }

    pub fn publish_completed(&self, event: CompletedEvent) {
        self.last_progress.lock().remove(&event.scan_id);
        let scan_id = event.scan_id.clone();
        self.send_twice(&scan_id, ServerMessage::Completed(event));
    }

    pub fn last_progress(&self, scan_id: &str) -> Option<ProgressEvent> {
        self.last_progress.lock().get(scan_id).cloned()
    }

    pub fn connect(&self) -> Connection {
        Connection {
            rx: self.tx.subscribe(),
            subscriptions: Arc::new(Mutex::new(HashSet::new())),
            broadcaster: self.clone(),
        }
    }

    pub fn send_keepalive(&self) {
        let _ = self.tx.send(Frame {
            channel: Channel::Keepalive,
            message: ServerMessage::Keepalive {
                timestamp: timestamp(),
            },
        });
    }

    /// Periodic keepalive frames until `shutdown` fires.
    pub fn spawn_keepalive(&self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let broadcaster = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => broadcaster.send_keepalive(),
                }
            }
        })
    }

    fn send_twice(&self, scan_id: &str, message: ServerMessage) {
        // No receivers is not an error.
        let _ = self.tx.send(Frame {
            channel: Channel::Scan(scan_id.to_string()),
            message: message.clone(),
        });
        let _ = self.tx.send(Frame {
            channel: Channel::Namespace,
            message,
        });
    }
}

/// One observer's view of the broadcast stream.
pub struct Connection {
    rx: broadcast::Receiver<Frame>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    broadcaster: Broadcaster,
}

impl Connection {
    pub fn subscriptions(&self) -> Subscriptions {
        Subscriptions {
            scans: Arc::clone(&self.subscriptions),
            broadcaster: self.broadcaster.clone(),
        }
    }

    /// Next frame addressed to this connection; `None` once the broadcaster
    /// is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => {
                    let wanted = match &frame.channel {
                        Channel::Scan(scan_id) => self.subscriptions.lock().contains(scan_id),
                        Channel::Namespace | Channel::Keepalive | Channel::Direct => true,
                    };
                    if wanted {
                        return Some(frame);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event connection lagged, dropped {} frames", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Shared handle to a connection's scan subscriptions.
#[derive(Clone)]
pub struct Subscriptions {
    scans: Arc<Mutex<HashSet<String>>>,
    broadcaster: Broadcaster,
}

impl Subscriptions {
    /// Joins the scan's channel and returns its last known progress, which
    /// the caller sends to this connection right away.
    pub fn subscribe(&self, scan_id: &str) -> Option<ProgressEvent> {
        self.scans.lock().insert(scan_id.to_string());
        debug!("Subscribed to scan {}", scan_id);
        self.broadcaster.last_progress(scan_id)
    }

    pub fn unsubscribe(&self, scan_id: &str) -> bool {
        self.scans.lock().remove(scan_id)
    }

    pub fn contains(&self, scan_id: &str) -> bool {
        self.scans.lock().contains(scan_id)
    }
}

/// Per-connection filter that keeps scan-channel progress moving forward.
/// The catch-up snapshot and live frames reach a socket by different paths,
/// so an older snapshot can arrive after a newer live frame.
#[derive(Debug, Default)]
pub struct ProgressOrder {
    latest: HashMap<String, (usize, usize)>,
}

impl ProgressOrder {
    pub fn admit(&mut self, frame: &Frame) -> bool {
        let (scan_id, event) = match (&frame.channel, &frame.message) {
            (Channel::Scan(scan_id), ServerMessage::Progress(event)) => (scan_id, event),
            (Channel::Scan(scan_id), ServerMessage::Completed(_)) => {
                self.latest.remove(scan_id);
                return true;
            }
            _ => return true,
        };
        let position = (event.files_scanned, event.total_files);
        match self.latest.get(scan_id) {
            Some(seen) if position < *seen => false,
            _ => {
                self.latest.insert(scan_id.clone(), position);
                true
            }
        }
    }
}

pub fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
