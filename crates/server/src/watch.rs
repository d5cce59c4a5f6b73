use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use library::is_audio_path;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::scan::ScanService;
use crate::state::AppState;

pub fn configure_watcher(state: &AppState, root: PathBuf) {
    let settings = state.config.read().watch.clone();
    if !settings.enabled {
        info!("Watcher disabled (watch.enabled=false)");
        *state.watcher.write() = None;
        return;
    }

    let debounce_secs = if settings.debounce_secs == 0 {
        2
    } else {
        settings.debounce_secs
    };
    let debounce = Duration::from_secs(debounce_secs);

    match setup_watcher(state.scans.clone(), root.clone(), debounce) {
        Ok(watcher) => {
            info!(
                "Watching {} for changes (debounce {}s)",
                root.display(),
                debounce.as_secs()
            );
            *state.watcher.write() = Some(watcher);
        }
        Err(err) => {
            warn!("Failed to start watcher: {}", err);
            *state.watcher.write() = None;
        }
    }
}

fn setup_watcher(
    scans: ScanService,
    root: PathBuf,
    debounce: Duration,
) -> Result<RecommendedWatcher, notify::Error> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        NotifyConfig::default(),
    )?;

    watcher.watch(&root, RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        watch_loop(scans, rx, debounce).await;
    });

    Ok(watcher)
}

/// Collects changed audio paths until the tree has been quiet for
/// `debounce`, then queues them as one incremental scan.
async fn watch_loop(scans: ScanService, mut rx: UnboundedReceiver<Event>, debounce: Duration) {
    loop {
        let event = match rx.recv().await {
            Some(event) => event,
            None => break,
        };
        let mut pending: BTreeSet<PathBuf> = changed_audio_paths(&event).into_iter().collect();
        if pending.is_empty() {
            continue;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => {
                    flush(&scans, std::mem::take(&mut pending));
                    break;
                }
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => pending.extend(changed_audio_paths(&event)),
                        None => {
                            flush(&scans, std::mem::take(&mut pending));
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn flush(scans: &ScanService, pending: BTreeSet<PathBuf>) {
    let files: Vec<PathBuf> = pending.into_iter().filter(|path| path.is_file()).collect();
    if files.is_empty() {
        debug!("Watcher batch had no surviving files");
        return;
    }
    if let Err(err) = scans.start_incremental(files) {
        warn!("Failed to queue incremental scan: {}", err);
    }
}

/// Removals are left to the next pruning full scan.
fn changed_audio_paths(event: &Event) -> Vec<PathBuf> {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|path| is_audio_path(path))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanSettings;
    use crate::queue::ScanJob;
    use crate::scan::tests::test_service;
    use metadata::MemoryTagSource;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use std::sync::Arc;

    #[test]
    fn only_created_or_modified_audio_counts() {
        let created = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/m/a.flac"))
            .add_path(PathBuf::from("/m/cover.jpg"));
        assert_eq!(changed_audio_paths(&created), vec![PathBuf::from("/m/a.flac")]);

        let modified = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from("/m/b.mp3"));
        assert_eq!(changed_audio_paths(&modified).len(), 1);

        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(PathBuf::from("/m/c.mp3"));
        assert!(changed_audio_paths(&removed).is_empty());
    }

    #[tokio::test]
    async fn bursts_are_batched_into_one_incremental_scan() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("music");
        std::fs::create_dir_all(&root).unwrap();
        let first = root.join("a.mp3");
        let second = root.join("b.mp3");
        std::fs::write(&first, b"a").unwrap();
        std::fs::write(&second, b"b").unwrap();

        let (scans, mut jobs) = test_service(
            dir.path(),
            &root,
            Arc::new(MemoryTagSource::new()),
            ScanSettings::default(),
        );
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = tokio::spawn(watch_loop(scans, rx, Duration::from_millis(50)));

        tx.send(Event::new(EventKind::Create(CreateKind::File)).add_path(first.clone()))
            .unwrap();
        tx.send(Event::new(EventKind::Modify(ModifyKind::Any)).add_path(second.clone()))
            .unwrap();
        tx.send(Event::new(EventKind::Modify(ModifyKind::Any)).add_path(first.clone()))
            .unwrap();

        let job = tokio::time::timeout(Duration::from_secs(2), jobs.recv())
            .await
            .unwrap()
            .unwrap();
        match job {
            ScanJob::Incremental { files, .. } => assert_eq!(files, vec![first, second]),
            other => panic!("expected incremental job, got {:?}", other),
        }

        drop(tx);
        handle.await.unwrap();
    }
}
