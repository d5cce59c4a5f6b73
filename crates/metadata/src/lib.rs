mod normalize;
mod raw;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lofty::error::LoftyError;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use lofty::tag::{ItemValue, TagItem};
use parking_lot::RwLock;

pub use normalize::{normalize, TrackMetadata};
pub use raw::{AudioProperties, RawTags, TagValue};

#[derive(Debug, Clone)]
pub struct CoverArt {
    pub data: Vec<u8>,
    pub mime: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tag parse error: {0}")]
    Lofty(#[from] LoftyError),
    #[error("no tag data for {0}")]
    NotFound(String),
}

/// Source of raw tag dictionaries for audio files.
pub trait TagSource: Send + Sync {
    fn read_tags(&self, path: &Path) -> Result<RawTags, MetadataError>;
}

/// Reads tags and stream properties through lofty.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyTagSource;

impl TagSource for LoftyTagSource {
    fn read_tags(&self, path: &Path) -> Result<RawTags, MetadataError> {
        let tagged_file = lofty::read_from_path(path)?;
        let properties = tagged_file.properties();

        let mut raw = RawTags::default();

        let duration_ms = properties.duration().as_millis();
        if duration_ms > 0 {
            let clamped = duration_ms.min(u128::from(u32::MAX)) as u32;
            raw.properties.duration_ms = Some(clamped);
        }
        raw.properties.sample_rate = properties.sample_rate();
        raw.properties.channels = properties.channels();
        raw.properties.bitrate = properties.audio_bitrate().or(properties.overall_bitrate());

        if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
            for item in tag.items() {
                if let Some((key, value)) = lofty_entry(item) {
                    raw.insert(key, value);
                }
            }
            raw.properties.has_embedded_cover = !tag.pictures().is_empty();
        }

        Ok(raw)
    }
}

/// Fixed tag dictionaries keyed by path, for offline indexing and tests.
#[derive(Default)]
pub struct MemoryTagSource {
    entries: RwLock<HashMap<PathBuf, RawTags>>,
}

impl MemoryTagSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, tags: RawTags) {
        self.entries.write().insert(path.into(), tags);
    }
}

impl TagSource for MemoryTagSource {
    fn read_tags(&self, path: &Path) -> Result<RawTags, MetadataError> {
        self.entries
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(path.display().to_string()))
    }
}

pub fn read_cover(path: &Path) -> Result<Option<CoverArt>, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let tag = match tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        Some(tag) => tag,
        None => return Ok(None),
    };

    let picture = match pick_picture(tag.pictures()) {
        Some(picture) => picture,
        None => return Ok(None),
    };

    let data = picture.data().to_vec();
    let mime = guess_mime(&data);
    Ok(Some(CoverArt { data, mime }))
}

fn lofty_entry(item: &TagItem) -> Option<(String, TagValue)> {
    let key = item_key_name(item.key())?;
    let text = match item.value() {
        ItemValue::Text(text) | ItemValue::Locator(text) => text.clone(),
        ItemValue::Binary(_) => return None,
    };
    let value = match item.key() {
        ItemKey::Comment | ItemKey::Lyrics => {
            let lang = item.lang();
            let language = String::from_utf8_lossy(&lang[..]).to_string();
            let language = if language == "XXX" || language.trim_matches('\0').is_empty() {
                None
            } else {
                Some(language)
            };
            TagValue::Described {
                language,
                description: item.description().to_string(),
                text,
            }
        }
        _ => TagValue::Text(text),
    };
    Some((key, value))
}

fn item_key_name(key: &ItemKey) -> Option<String> {
    let name = match key {
        ItemKey::TrackTitle => "title",
        ItemKey::TrackArtist => "artist",
        ItemKey::AlbumTitle => "album",
        ItemKey::AlbumArtist => "albumartist",
        ItemKey::TrackNumber => "tracknumber",
        ItemKey::DiscNumber => "discnumber",
        ItemKey::Year => "year",
        ItemKey::RecordingDate => "date",
        ItemKey::Genre => "genre",
        ItemKey::Comment => "comment",
        ItemKey::Lyrics => "lyrics",
        ItemKey::FlagCompilation => "compilation",
        ItemKey::MusicBrainzRecordingId => "musicbrainz_recordingid",
        ItemKey::MusicBrainzTrackId => "musicbrainz_trackid",
        ItemKey::MusicBrainzReleaseId => "musicbrainz_albumid",
        ItemKey::MusicBrainzReleaseGroupId => "musicbrainz_releasegroupid",
        ItemKey::MusicBrainzArtistId => "musicbrainz_artistid",
        ItemKey::MusicBrainzReleaseArtistId => "musicbrainz_albumartistid",
        ItemKey::Unknown(other) => return Some(other.to_ascii_lowercase()),
        _ => return None,
    };
    Some(name.to_string())
}

fn pick_picture(pictures: &[Picture]) -> Option<&Picture> {
    for picture in pictures {
        if picture.pic_type() == PictureType::CoverFront {
            return Some(picture);
        }
    }
    pictures.first()
}

fn guess_mime(bytes: &[u8]) -> Option<String> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg".to_string())
    } else if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Some("image/png".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_returns_inserted_tags() {
        let source = MemoryTagSource::new();
        let mut tags = RawTags::default();
        tags.insert("title", TagValue::Text("Come Together".to_string()));
        source.insert("/music/a.mp3", tags.clone());

        let read = source.read_tags(Path::new("/music/a.mp3")).unwrap();
        assert_eq!(read, tags);
        assert!(matches!(
            source.read_tags(Path::new("/music/b.mp3")),
            Err(MetadataError::NotFound(_))
        ));
    }

    #[test]
    fn lofty_rejects_non_audio_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.flac");
        std::fs::write(&path, b"definitely not a flac stream").unwrap();
        assert!(LoftyTagSource.read_tags(&path).is_err());
    }

    #[test]
    fn guesses_image_mime_from_magic() {
        assert_eq!(guess_mime(&[0xFF, 0xD8, 0xFF, 0x00]).as_deref(), Some("image/jpeg"));
        assert_eq!(guess_mime(&[0x89, 0x50, 0x4E, 0x47]).as_deref(), Some("image/png"));
        assert_eq!(guess_mime(b"GIF8"), None);
    }

    #[test]
    fn unknown_keys_are_lowercased() {
        assert_eq!(
            item_key_name(&ItemKey::Unknown("REPLAYGAIN_TRACK_GAIN".to_string())).as_deref(),
            Some("replaygain_track_gain")
        );
        assert_eq!(item_key_name(&ItemKey::AlbumArtist).as_deref(), Some("albumartist"));
    }
}
