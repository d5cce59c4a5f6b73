use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::ScanTotals;
use library::{
    crawl, open_db, Catalog, CoverExtractor, FsCoverExtractor, LibraryError, ScanRequest,
    ScanStore, TrackOutcome,
};
use metadata::{normalize, LoftyTagSource, TagSource};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Runs one full scan in-process, without the server, and records it in the
/// same scan history the server uses.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = env::args().skip(1);
    let music_root = args
        .next()
        .or_else(|| env::var("MUSIC_ROOT").ok())
        .ok_or("MUSIC_ROOT not set and no path argument")?;
    let index_path = args
        .next()
        .or_else(|| env::var("INDEX_PATH").ok())
        .unwrap_or_else(|| "data/library.redb".to_string());
    let covers_path = env::var("COVERS_PATH").unwrap_or_else(|_| "data/covers".to_string());
    let prune_deleted = env::var("PRUNE_DELETED")
        .map(|value| value != "0" && !value.eq_ignore_ascii_case("false"))
        .unwrap_or(true);

    let db = open_db(Path::new(&index_path))?;
    let store = ScanStore::new(db.clone());
    let catalog = Catalog::new(db);
    let covers = FsCoverExtractor::new(PathBuf::from(covers_path));

    let request = ScanRequest {
        root_path: music_root,
        recursive: true,
        prune_deleted,
    };
    let scan = store.create_full_scan(&request, Duration::from_secs(600))?;
    store.mark_running(&scan.id)?;
    info!("Scan {} running over {}", scan.id, request.root_path);

    match run(&store, &catalog, &LoftyTagSource, &covers, &scan.id, &request) {
        Ok(totals) => {
            store.complete(&scan.id, totals)?;
            println!(
                "Scan {}: {} added, {} updated, {} deleted",
                scan.id, totals.tracks_added, totals.tracks_updated, totals.tracks_deleted
            );
        }
        Err(err) => {
            store.fail(&scan.id, &err.to_string())?;
            return Err(err.into());
        }
    }

    let stats = catalog.stats()?;
    println!(
        "Indexed: {} artists, {} albums, {} tracks",
        stats.artists, stats.albums, stats.tracks
    );

    Ok(())
}

fn run(
    store: &ScanStore,
    catalog: &Catalog,
    tags: &dyn TagSource,
    covers: &dyn CoverExtractor,
    scan_id: &str,
    request: &ScanRequest,
) -> Result<ScanTotals, LibraryError> {
    let files = crawl(Path::new(&request.root_path), request.recursive)?;
    info!("Found {} audio files", files.len());

    let mut totals = ScanTotals::default();
    let mut errors = 0u32;
    for (index, file) in files.iter().enumerate() {
        let raw = match tags.read_tags(&file.path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("Skipping {}: {}", file.path.display(), err);
                errors += 1;
                continue;
            }
        };
        let meta = normalize(&raw, &file.path);
        let key = file.path.to_string_lossy().to_string();
        let applied = match catalog.apply(&key, file.size, &meta) {
            Ok(applied) => applied,
            Err(err) => {
                warn!("Skipping {}: {}", file.path.display(), err);
                errors += 1;
                continue;
            }
        };
        match applied.outcome {
            TrackOutcome::Created => totals.tracks_added += 1,
            TrackOutcome::Updated => totals.tracks_updated += 1,
        }
        if applied.album_created {
            attach_cover(catalog, covers, &applied.album_id, &file.path);
        }
        if (index + 1) % 100 == 0 {
            store.touch(scan_id, totals)?;
            info!("Scanned {} of {} files", index + 1, files.len());
        }
    }

    if request.prune_deleted {
        totals.tracks_deleted = catalog.prune_missing()?.tracks_deleted;
    }
    if errors > 0 {
        warn!("{} files were skipped", errors);
    }
    Ok(totals)
}

/// Cover problems never fail the file.
fn attach_cover(catalog: &Catalog, covers: &dyn CoverExtractor, album_id: &str, sample: &Path) {
    let cover_ref = match covers.extract_cover(album_id, sample) {
        Ok(Some(cover_ref)) => cover_ref,
        Ok(None) => return,
        Err(err) => {
            warn!("Cover extraction failed for {}: {}", sample.display(), err);
            return;
        }
    };
    if let Err(err) = catalog.set_album_cover(album_id, &cover_ref) {
        warn!("Failed to store cover for album {}: {}", album_id, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metadata::{MemoryTagSource, RawTags};

    struct BrokenCovers;

    impl CoverExtractor for BrokenCovers {
        fn extract_cover(&self, _album_id: &str, _sample: &Path) -> Result<Option<String>, LibraryError> {
            Err(LibraryError::Crawl("cover store offline".to_string()))
        }
    }

    #[test]
    fn bad_files_and_cover_failures_do_not_stop_the_import() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("music");
        std::fs::create_dir_all(&root).unwrap();
        let good = root.join("good.mp3");
        std::fs::write(&good, b"audio").unwrap();
        std::fs::write(root.join("bad.mp3"), b"junk").unwrap();

        let tags = MemoryTagSource::new();
        tags.insert(
            good.clone(),
            RawTags::default()
                .with_text("artist", "Beatles")
                .with_text("album", "Abbey Road"),
        );

        let db = open_db(&dir.path().join("index.redb")).unwrap();
        let store = ScanStore::new(db.clone());
        let catalog = Catalog::new(db);
        let request = ScanRequest {
            root_path: root.to_string_lossy().to_string(),
            recursive: true,
            prune_deleted: true,
        };
        let scan = store.create_full_scan(&request, Duration::from_secs(600)).unwrap();
        store.mark_running(&scan.id).unwrap();

        let totals = run(&store, &catalog, &tags, &BrokenCovers, &scan.id, &request).unwrap();
        assert_eq!(totals.tracks_added, 1);
        assert_eq!(totals.tracks_deleted, 0);
        let albums = catalog.list_albums().unwrap();
        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].cover_ref, None);
    }
}
