use std::path::{Path, PathBuf};
use std::sync::Arc;

use library::{ApplyOutcome, Catalog, CoverExtractor};
use metadata::{normalize, TagSource};
use tracing::{debug, warn};

use crate::scan::ScanError;

/// Result of reconciling one file.
#[derive(Clone, Debug)]
pub struct FileOutcome {
    pub applied: ApplyOutcome,
    pub cover_extracted: bool,
}

/// Reads one file's tags and folds them into the catalog.
#[derive(Clone)]
pub struct Reconciler {
    tags: Arc<dyn TagSource>,
    catalog: Catalog,
    covers: Arc<dyn CoverExtractor>,
}

impl Reconciler {
    pub fn new(
        tags: Arc<dyn TagSource>,
        catalog: Catalog,
        covers: Arc<dyn CoverExtractor>,
    ) -> Self {
        Self {
            tags,
            catalog,
            covers,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// A tag read failure leaves the catalog untouched. Cover extraction runs
    /// once, for the file that created the album, and its failure does not
    /// fail the file.
    pub async fn reconcile(&self, path: &Path, size: u64) -> Result<FileOutcome, ScanError> {
        let tags = Arc::clone(&self.tags);
        let catalog = self.catalog.clone();
        let file_path = path.to_path_buf();
        let applied = tokio::task::spawn_blocking(move || {
            let raw = tags.read_tags(&file_path)?;
            let meta = normalize(&raw, &file_path);
            let key = file_path.to_string_lossy().to_string();
            Ok::<ApplyOutcome, ScanError>(catalog.apply(&key, size, &meta)?)
        })
        .await??;

        let cover_extracted = if applied.album_created {
            self.extract_cover(&applied.album_id, path.to_path_buf()).await
        } else {
            false
        };

        Ok(FileOutcome {
            applied,
            cover_extracted,
        })
    }

    async fn extract_cover(&self, album_id: &str, sample: PathBuf) -> bool {
        let covers = Arc::clone(&self.covers);
        let catalog = self.catalog.clone();
        let album_id = album_id.to_string();
        let result = tokio::task::spawn_blocking(move || {
            match covers.extract_cover(&album_id, &sample)? {
                Some(cover_ref) => {
                    catalog.set_album_cover(&album_id, &cover_ref)?;
                    debug!("Album {} cover set to {}", album_id, cover_ref);
                    Ok::<bool, library::LibraryError>(true)
                }
                None => Ok(false),
            }
        })
        .await;
        match result {
            Ok(Ok(extracted)) => extracted,
            Ok(Err(err)) => {
                warn!("Cover extraction failed: {}", err);
                false
            }
            Err(err) => {
                warn!("Cover extraction task failed: {}", err);
                false
            }
        }
    }
}
