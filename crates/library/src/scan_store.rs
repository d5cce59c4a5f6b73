use std::sync::Arc;
use std::time::Duration;

use common::{now_millis, LibraryScan, ScanStatus, ScanTotals};
use redb::{Database, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    decode_value, get_text, get_value, link_key, put_text, put_value, remove_key, split_key_last,
    LibraryError, ACTIVE_SCAN_TABLE, SCANS_BY_START_TABLE, SCANS_TABLE,
};

const ACTIVE_FULL_KEY: &str = "full";
pub const LEASE_EXPIRED_MESSAGE: &str = "scan lease expired";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub root_path: String,
    pub recursive: bool,
    pub prune_deleted: bool,
}

/// Durable scan records. At most one full scan is active at a time; the
/// `active_scan` row is written in the same transaction as the scan row so
/// a second start request either sees it or loses the writer race.
#[derive(Clone)]
pub struct ScanStore {
    db: Arc<Database>,
}

impl ScanStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn create_full_scan(
        &self,
        request: &ScanRequest,
        lease: Duration,
    ) -> Result<LibraryScan, LibraryError> {
        let now = now_millis();
        let write_txn = self.db.begin_write()?;

        if let Some(active_id) = get_text(&write_txn, ACTIVE_SCAN_TABLE, ACTIVE_FULL_KEY)? {
            match get_value::<LibraryScan>(&write_txn, SCANS_TABLE, &active_id)? {
                Some(active) if !active.status.is_terminal() => {
                    let age = now.saturating_sub(active.heartbeat_at);
                    if u128::from(age) < lease.as_millis() {
                        return Err(LibraryError::ScanConflict(active.id));
                    }
                    warn!(
                        "Reclaiming scan {} (no heartbeat for {} ms)",
                        active.id, age
                    );
                    finish_in_txn(
                        &write_txn,
                        active,
                        ScanStatus::Failed,
                        Some(LEASE_EXPIRED_MESSAGE.to_string()),
                        None,
                        now,
                    )?;
                }
                _ => {}
            }
        }

        let scan = LibraryScan {
            id: uuid::Uuid::new_v4().to_string(),
            status: ScanStatus::Pending,
            root_path: request.root_path.clone(),
            recursive: request.recursive,
            prune_deleted: request.prune_deleted,
            started_at: now,
            finished_at: None,
            heartbeat_at: now,
            tracks_added: 0,
            tracks_updated: 0,
            tracks_deleted: 0,
            error_message: None,
        };
        put_value(&write_txn, SCANS_TABLE, &scan.id, &scan)?;
        put_text(
            &write_txn,
            SCANS_BY_START_TABLE,
            &start_key(scan.started_at, &scan.id),
            &scan.id,
        )?;
        put_text(&write_txn, ACTIVE_SCAN_TABLE, ACTIVE_FULL_KEY, &scan.id)?;
        write_txn.commit()?;
        info!("Created scan {} for {}", scan.id, scan.root_path);
        Ok(scan)
    }

    pub fn get(&self, scan_id: &str) -> Result<Option<LibraryScan>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SCANS_TABLE)?;
        let scan = match table.get(scan_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(scan)
    }

    /// The non-terminal full scan holding the active slot, if any.
    pub fn active(&self) -> Result<Option<LibraryScan>, LibraryError> {
        let active_id = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(ACTIVE_SCAN_TABLE)?;
            let value = table
                .get(ACTIVE_FULL_KEY)?
                .map(|value| String::from_utf8_lossy(value.value()).to_string());
            value
        };
        match active_id {
            Some(id) => Ok(self.get(&id)?.filter(|scan| !scan.status.is_terminal())),
            None => Ok(None),
        }
    }

    /// Newest first. `page` starts at 1; the second value is the total count.
    pub fn list(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<LibraryScan>, usize), LibraryError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(SCANS_BY_START_TABLE)?;
        let scans = read_txn.open_table(SCANS_TABLE)?;
        let total = index.len()? as usize;
        let skip = page.saturating_sub(1).saturating_mul(page_size);

        let mut items = Vec::new();
        for entry in index.iter()?.rev().skip(skip).take(page_size) {
            let entry = entry?;
            let (_, scan_id) = split_key_last(entry.0.value())?;
            if let Some(value) = scans.get(scan_id)? {
                items.push(decode_value(value.value())?);
            }
        }
        Ok((items, total))
    }

    pub fn mark_running(&self, scan_id: &str) -> Result<LibraryScan, LibraryError> {
        self.update_live(scan_id, |scan| {
            scan.status = ScanStatus::Running;
        })
    }

    /// Refreshes the heartbeat and the persisted counters of a live scan.
    pub fn touch(&self, scan_id: &str, totals: ScanTotals) -> Result<LibraryScan, LibraryError> {
        self.update_live(scan_id, |scan| apply_totals(scan, totals))
    }

    pub fn complete(&self, scan_id: &str, totals: ScanTotals) -> Result<LibraryScan, LibraryError> {
        self.finish(scan_id, ScanStatus::Completed, None, Some(totals))
    }

    pub fn fail(&self, scan_id: &str, message: &str) -> Result<LibraryScan, LibraryError> {
        self.finish(scan_id, ScanStatus::Failed, Some(message.to_string()), None)
    }

    fn finish(
        &self,
        scan_id: &str,
        status: ScanStatus,
        message: Option<String>,
        totals: Option<ScanTotals>,
    ) -> Result<LibraryScan, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let scan = load_live(&write_txn, scan_id)?;
        let scan = finish_in_txn(&write_txn, scan, status, message, totals, now_millis())?;
        write_txn.commit()?;
        info!("Scan {} finished as {}", scan.id, scan.status.as_str());
        Ok(scan)
    }

    fn update_live<F>(&self, scan_id: &str, update: F) -> Result<LibraryScan, LibraryError>
    where
        F: FnOnce(&mut LibraryScan),
    {
        let write_txn = self.db.begin_write()?;
        let mut scan = load_live(&write_txn, scan_id)?;
        update(&mut scan);
        scan.heartbeat_at = now_millis();
        put_value(&write_txn, SCANS_TABLE, &scan.id, &scan)?;
        write_txn.commit()?;
        Ok(scan)
    }
}

fn load_live(txn: &WriteTransaction, scan_id: &str) -> Result<LibraryScan, LibraryError> {
    let scan: LibraryScan = get_value(txn, SCANS_TABLE, scan_id)?
        .ok_or_else(|| LibraryError::ScanNotFound(scan_id.to_string()))?;
    if scan.status.is_terminal() {
        return Err(LibraryError::ScanFinished(scan_id.to_string()));
    }
    Ok(scan)
}

fn finish_in_txn(
    txn: &WriteTransaction,
    mut scan: LibraryScan,
    status: ScanStatus,
    message: Option<String>,
    totals: Option<ScanTotals>,
    now: u64,
) -> Result<LibraryScan, LibraryError> {
    if let Some(totals) = totals {
        apply_totals(&mut scan, totals);
    }
    scan.status = status;
    scan.finished_at = Some(now);
    scan.heartbeat_at = now;
    scan.error_message = match status {
        ScanStatus::Failed => message,
        _ => None,
    };
    put_value(txn, SCANS_TABLE, &scan.id, &scan)?;

    if get_text(txn, ACTIVE_SCAN_TABLE, ACTIVE_FULL_KEY)?.as_deref() == Some(scan.id.as_str()) {
        remove_key(txn, ACTIVE_SCAN_TABLE, ACTIVE_FULL_KEY)?;
    }
    Ok(scan)
}

fn apply_totals(scan: &mut LibraryScan, totals: ScanTotals) {
    scan.tracks_added = totals.tracks_added;
    scan.tracks_updated = totals.tracks_updated;
    scan.tracks_deleted = totals.tracks_deleted;
}

/// Zero-padded so lexical order matches start time.
fn start_key(started_at: u64, scan_id: &str) -> String {
    link_key(&format!("{:020}", started_at), scan_id)
}
