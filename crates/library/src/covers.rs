use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::LibraryError;

const FOLDER_COVERS: &[&str] = &[
    "cover.jpg",
    "cover.jpeg",
    "cover.png",
    "folder.jpg",
    "folder.jpeg",
    "folder.png",
    "front.jpg",
    "front.jpeg",
    "front.png",
    "album.jpg",
    "album.png",
];

/// Produces a cover reference for a newly created album from one of its files.
pub trait CoverExtractor: Send + Sync {
    fn extract_cover(&self, album_id: &str, sample: &Path) -> Result<Option<String>, LibraryError>;
}

/// Writes embedded artwork to `<covers_dir>/<album_id>.<ext>`; without
/// embedded art, points at a cover image next to the sample file.
#[derive(Clone, Debug)]
pub struct FsCoverExtractor {
    covers_dir: PathBuf,
}

impl FsCoverExtractor {
    pub fn new(covers_dir: impl Into<PathBuf>) -> Self {
        Self {
            covers_dir: covers_dir.into(),
        }
    }
}

impl CoverExtractor for FsCoverExtractor {
    fn extract_cover(&self, album_id: &str, sample: &Path) -> Result<Option<String>, LibraryError> {
        if let Some(art) = metadata::read_cover(sample)? {
            let ext = match art.mime.as_deref() {
                Some("image/png") => "png",
                _ => "jpg",
            };
            fs::create_dir_all(&self.covers_dir)?;
            let target = self.covers_dir.join(format!("{}.{}", album_id, ext));
            fs::write(&target, &art.data)?;
            debug!("Wrote embedded cover for album {} to {:?}", album_id, target);
            return Ok(Some(target.to_string_lossy().to_string()));
        }

        let folder = match sample.parent() {
            Some(folder) => folder,
            None => return Ok(None),
        };
        Ok(find_folder_cover(folder).map(|path| path.to_string_lossy().to_string()))
    }
}

fn find_folder_cover(album_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(album_dir).ok()?;
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().to_ascii_lowercase(),
            None => continue,
        };
        let rank = match FOLDER_COVERS.iter().position(|candidate| *candidate == name) {
            Some(rank) => rank,
            None => continue,
        };
        if best.as_ref().map_or(true, |(current, _)| rank < *current) {
            best = Some((rank, path));
        }
    }
    best.map(|(_, path)| path)
}
