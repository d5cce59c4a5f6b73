use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub name_key: String,
    #[serde(default)]
    pub external_id: Option<String>,
    pub album_count: u32,
    pub song_count: u32,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Album {
    pub id: String,
    pub name: String,
    pub name_key: String,
    pub artist_id: String,
    pub year: Option<i32>,
    pub compilation: bool,
    #[serde(default)]
    pub external_ids: ExternalIds,
    pub cover_ref: Option<String>,
    pub song_count: u32,
    pub duration_ms: u64,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub path: String,
    pub title: String,
    pub artist_id: String,
    pub album_id: String,
    pub album_artist_id: String,
    pub track_no: Option<u16>,
    pub disc_no: Option<u16>,
    pub year: Option<i32>,
    pub duration_ms: u32,
    pub bitrate: Option<u32>,
    pub channels: Option<u8>,
    pub size: u64,
    #[serde(default)]
    pub external_ids: ExternalIds,
    #[serde(default)]
    pub genres: Vec<String>,
    pub comment: Option<String>,
    pub lyrics: Option<String>,
}

/// MusicBrainz identifiers carried by tags.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalIds {
    pub recording: Option<String>,
    pub release: Option<String>,
    pub release_group: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }
}

/// A durable record of one full scan attempt.
///
/// `finished_at` and `error_message` stay empty until the scan reaches a
/// terminal status; after that the record is never written again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryScan {
    pub id: String,
    pub status: ScanStatus,
    pub root_path: String,
    pub recursive: bool,
    pub prune_deleted: bool,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub heartbeat_at: u64,
    pub tracks_added: u32,
    pub tracks_updated: u32,
    pub tracks_deleted: u32,
    pub error_message: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTotals {
    pub tracks_added: u32,
    pub tracks_updated: u32,
    pub tracks_deleted: u32,
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

/// Comparison key for artist and album names: case-folded, diacritics
/// stripped, inner whitespace collapsed to single spaces.
pub fn comparison_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_space = false;
    for ch in name.nfd().filter(|ch| !is_combining_mark(*ch)) {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.extend(ch.to_lowercase());
    }
    out
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis() as u64)
        .unwrap_or(0)
}
