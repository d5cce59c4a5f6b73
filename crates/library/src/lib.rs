mod catalog;
mod covers;
mod crawler;
mod scan_store;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use metadata::MetadataError;
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError, WriteTransaction,
};
use serde::{Deserialize, Serialize};

pub use catalog::{ApplyOutcome, Catalog, LibraryStats, PruneReport, TrackOutcome};
pub use covers::{CoverExtractor, FsCoverExtractor};
pub use crawler::{crawl, is_audio_path, CandidateFile};
pub use scan_store::{ScanRequest, ScanStore, LEASE_EXPIRED_MESSAGE};

const KEY_SEP: char = '\x1f';

pub(crate) const ARTISTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("artists");
pub(crate) const ARTIST_KEYS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("artist_keys");
pub(crate) const ARTIST_ALBUMS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("artist_albums");
pub(crate) const ARTIST_TRACKS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("artist_tracks");
pub(crate) const ALBUMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("albums");
pub(crate) const ALBUM_KEYS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("album_keys");
pub(crate) const ALBUM_TRACKS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("album_tracks");
pub(crate) const TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks");
pub(crate) const TRACK_PATHS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("track_paths");
pub(crate) const SCANS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("scans");
pub(crate) const SCANS_BY_START_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("scans_by_start");
pub(crate) const ACTIVE_SCAN_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("active_scan");

const ALL_TABLES: [TableDefinition<&str, &[u8]>; 12] = [
    ARTISTS_TABLE,
    ARTIST_KEYS_TABLE,
    ARTIST_ALBUMS_TABLE,
    ARTIST_TRACKS_TABLE,
    ALBUMS_TABLE,
    ALBUM_KEYS_TABLE,
    ALBUM_TRACKS_TABLE,
    TRACKS_TABLE,
    TRACK_PATHS_TABLE,
    SCANS_TABLE,
    SCANS_BY_START_TABLE,
    ACTIVE_SCAN_TABLE,
];

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
    #[error("db error: {0}")]
    Redb(#[from] redb::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),
    #[error("key parse error: {0}")]
    KeyParse(String),
    #[error("scan root not found: {}", .0.display())]
    RootMissing(PathBuf),
    #[error("scan root is not a directory: {}", .0.display())]
    RootNotDirectory(PathBuf),
    #[error("crawl failed: {0}")]
    Crawl(String),
    #[error("a library scan is already running: {0}")]
    ScanConflict(String),
    #[error("scan not found: {0}")]
    ScanNotFound(String),
    #[error("scan already finished: {0}")]
    ScanFinished(String),
}

impl From<DatabaseError> for LibraryError {
    fn from(err: DatabaseError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TableError> for LibraryError {
    fn from(err: TableError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TransactionError> for LibraryError {
    fn from(err: TransactionError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<StorageError> for LibraryError {
    fn from(err: StorageError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<CommitError> for LibraryError {
    fn from(err: CommitError) -> Self {
        LibraryError::Redb(err.into())
    }
}

/// Opens (or creates) the index database and makes sure every table exists,
/// so read transactions never hit a missing table.
pub fn open_db(path: &Path) -> Result<Arc<Database>, LibraryError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let db = if path.exists() {
        Database::open(path)?
    } else {
        Database::create(path)?
    };
    let write_txn = db.begin_write()?;
    for table in ALL_TABLES {
        write_txn.open_table(table)?;
    }
    write_txn.commit()?;
    Ok(Arc::new(db))
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}

pub(crate) fn get_value<T: for<'de> Deserialize<'de>>(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
    key: &str,
) -> Result<Option<T>, LibraryError> {
    let table = txn.open_table(table)?;
    let value = match table.get(key)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(value)
}

pub(crate) fn put_value<T: Serialize>(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
    key: &str,
    value: &T,
) -> Result<(), LibraryError> {
    let bytes = encode_value(value)?;
    let mut table = txn.open_table(table)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

pub(crate) fn get_text(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
    key: &str,
) -> Result<Option<String>, LibraryError> {
    let table = txn.open_table(table)?;
    let value = table
        .get(key)?
        .map(|value| String::from_utf8_lossy(value.value()).to_string());
    Ok(value)
}

pub(crate) fn put_text(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
    key: &str,
    value: &str,
) -> Result<(), LibraryError> {
    let mut table = txn.open_table(table)?;
    table.insert(key, value.as_bytes())?;
    Ok(())
}

pub(crate) fn remove_key(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
    key: &str,
) -> Result<bool, LibraryError> {
    let mut table = txn.open_table(table)?;
    let removed = table.remove(key)?.is_some();
    Ok(removed)
}

/// Values of every index entry whose key starts with `owner` + separator.
pub(crate) fn linked_ids(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
    owner: &str,
) -> Result<Vec<String>, LibraryError> {
    let table = txn.open_table(table)?;
    let prefix = prefix_key(owner);
    let mut end = prefix.clone();
    end.push('\u{10ffff}');
    let mut ids = Vec::new();
    for entry in table.range(prefix.as_str()..end.as_str())? {
        let entry = entry?;
        ids.push(String::from_utf8_lossy(entry.1.value()).to_string());
    }
    Ok(ids)
}

pub(crate) fn link_key(owner: &str, child: &str) -> String {
    let mut out = prefix_key(owner);
    out.push_str(child);
    out
}

pub(crate) fn prefix_key(prefix: &str) -> String {
    let mut out = String::new();
    out.push_str(prefix);
    out.push(KEY_SEP);
    out
}

pub(crate) fn split_key_last(value: &str) -> Result<(&str, &str), LibraryError> {
    let idx = value
        .rfind(KEY_SEP)
        .ok_or_else(|| LibraryError::KeyParse(value.to_string()))?;
    let next = idx + KEY_SEP.len_utf8();
    Ok((&value[..idx], &value[next..]))
}

pub(crate) fn table_len(
    db: &Database,
    table: TableDefinition<&str, &[u8]>,
) -> Result<usize, LibraryError> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(table)?;
    Ok(table.len()? as usize)
}
