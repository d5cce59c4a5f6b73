use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::LibraryError;

const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "oga", "opus", "m4a", "mp4", "aac", "wav", "aif", "aiff", "wv", "ape",
    "mpc",
];

/// A file the crawler considers worth handing to the tag reader.
#[derive(Clone, Debug)]
pub struct CandidateFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Collects audio files under `root`, sorted by path.
///
/// A missing or unreadable root is an error; unreadable entries below it
/// are logged and skipped.
pub fn crawl(root: &Path, recursive: bool) -> Result<Vec<CandidateFile>, LibraryError> {
    let root_meta = match std::fs::metadata(root) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(LibraryError::RootMissing(root.to_path_buf()))
        }
        Err(err) => return Err(err.into()),
    };
    if !root_meta.is_dir() {
        return Err(LibraryError::RootNotDirectory(root.to_path_buf()));
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .max_depth(max_depth)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.depth() == 0 {
                    return Err(LibraryError::Crawl(err.to_string()));
                }
                warn!("Skipping unreadable entry under {:?}: {}", root, err);
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_audio_path(entry.path()) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                warn!("Failed to stat {:?}: {}", entry.path(), err);
                continue;
            }
        };
        files.push(CandidateFile {
            path: entry.path().to_path_buf(),
            size: meta.len(),
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    debug!("Crawled {:?}: {} audio files", root, files.len());
    Ok(files)
}

pub fn is_audio_path(path: &Path) -> bool {
    let ext = match path.extension() {
        Some(ext) => ext.to_string_lossy().to_ascii_lowercase(),
        None => return false,
    };
    AUDIO_EXTENSIONS.contains(&ext.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn recursive_crawl_finds_nested_audio_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("B/Album/02.flac"), b"12345");
        touch(&root.join("A/01.MP3"), b"1");
        touch(&root.join("A/cover.jpg"), b"img");
        touch(&root.join("notes.txt"), b"txt");

        let files = crawl(root, true).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.path.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![PathBuf::from("A/01.MP3"), PathBuf::from("B/Album/02.flac")]
        );
        assert_eq!(files[1].size, 5);
    }

    #[test]
    fn non_recursive_crawl_stays_at_top_level() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("top.ogg"), b"1");
        touch(&root.join("sub/deep.ogg"), b"1");

        let files = crawl(root, false).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].path.ends_with("top.ogg"));
    }

    #[test]
    fn empty_root_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(crawl(dir.path(), true).unwrap().is_empty());
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        assert!(matches!(
            crawl(&missing, true),
            Err(LibraryError::RootMissing(_))
        ));
    }

    #[test]
    fn file_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("one.mp3");
        touch(&file, b"1");
        assert!(matches!(
            crawl(&file, true),
            Err(LibraryError::RootNotDirectory(_))
        ));
    }

    #[test]
    fn audio_extension_check_is_case_insensitive() {
        assert!(is_audio_path(Path::new("x/Song.FLAC")));
        assert!(is_audio_path(Path::new("x/song.m4a")));
        assert!(!is_audio_path(Path::new("x/song")));
        assert!(!is_audio_path(Path::new("x/cover.png")));
    }
}
