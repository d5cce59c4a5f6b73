use std::path::Path;

use common::{ExternalIds, UNKNOWN_ARTIST};

use crate::raw::{AudioProperties, RawTags, TagValue};

/// Canonical per-file metadata consumed by the catalog.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub track_no: Option<u16>,
    pub disc_no: Option<u16>,
    pub year: Option<i32>,
    pub compilation: bool,
    pub genres: Vec<String>,
    pub comment: Option<String>,
    pub lyrics: Option<String>,
    pub artist_external_id: Option<String>,
    pub album_artist_external_id: Option<String>,
    pub external_ids: ExternalIds,
    pub duration_ms: Option<u32>,
    pub bitrate: Option<u32>,
    pub channels: Option<u8>,
    pub sample_rate: Option<u32>,
    pub has_embedded_cover: bool,
}

impl TrackMetadata {
    /// Album artist, then track artist, then the unknown-artist sentinel.
    pub fn resolved_artist(&self) -> &str {
        self.album_artist
            .as_deref()
            .or(self.artist.as_deref())
            .unwrap_or(UNKNOWN_ARTIST)
    }

    pub fn resolved_artist_external_id(&self) -> Option<&str> {
        if self.album_artist.is_some() {
            self.album_artist_external_id.as_deref()
        } else {
            self.artist_external_id.as_deref()
        }
    }
}

pub fn normalize(raw: &RawTags, path: &Path) -> TrackMetadata {
    let AudioProperties {
        duration_ms,
        sample_rate,
        channels,
        bitrate,
        has_embedded_cover,
    } = raw.properties.clone();

    let title = text(raw, "title").unwrap_or_else(|| file_stem(path));
    let year = text(raw, "year")
        .or_else(|| text(raw, "date"))
        .and_then(|value| parse_year(&value));

    TrackMetadata {
        title,
        artist: text(raw, "artist"),
        album_artist: text(raw, "albumartist"),
        album: text(raw, "album"),
        track_no: number(raw, "tracknumber"),
        disc_no: number(raw, "discnumber"),
        year,
        compilation: flag(raw, "compilation"),
        genres: genres(raw.get("genre")),
        comment: text(raw, "comment"),
        lyrics: text(raw, "lyrics"),
        artist_external_id: text(raw, "musicbrainz_artistid"),
        album_artist_external_id: text(raw, "musicbrainz_albumartistid"),
        external_ids: ExternalIds {
            recording: text(raw, "musicbrainz_recordingid")
                .or_else(|| text(raw, "musicbrainz_trackid")),
            release: text(raw, "musicbrainz_albumid"),
            release_group: text(raw, "musicbrainz_releasegroupid"),
        },
        duration_ms,
        bitrate,
        channels,
        sample_rate,
        has_embedded_cover,
    }
}

fn text(raw: &RawTags, key: &str) -> Option<String> {
    match raw.get(key)? {
        TagValue::Text(value) => clean(value),
        TagValue::List(items) => items.iter().find_map(|item| clean(item)),
        TagValue::Number(value) => Some(value.to_string()),
        TagValue::Described { text, .. } => clean(text),
    }
}

fn number(raw: &RawTags, key: &str) -> Option<u16> {
    match raw.get(key)? {
        TagValue::Number(value) => u16::try_from(*value).ok().filter(|n| *n > 0),
        TagValue::Text(value) => parse_u16(value),
        TagValue::List(items) => items.iter().find_map(|item| parse_u16(item)),
        TagValue::Described { text, .. } => parse_u16(text),
    }
}

fn flag(raw: &RawTags, key: &str) -> bool {
    match raw.get(key) {
        None => false,
        Some(TagValue::Number(value)) => *value != 0,
        Some(TagValue::Text(value)) => parse_flag(value),
        Some(TagValue::List(items)) => items.iter().any(|item| parse_flag(item)),
        Some(TagValue::Described { text, .. }) => parse_flag(text),
    }
}

fn genres(value: Option<&TagValue>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let parts: Vec<&str> = match value {
        None => return out,
        Some(TagValue::Text(text)) => vec![text.as_str()],
        Some(TagValue::List(items)) => items.iter().map(String::as_str).collect(),
        Some(TagValue::Described { text, .. }) => vec![text.as_str()],
        Some(TagValue::Number(_)) => return out,
    };
    for part in parts {
        for genre in parse_genres(part) {
            if !out.iter().any(|existing| existing.eq_ignore_ascii_case(&genre)) {
                out.push(genre);
            }
        }
    }
    out
}

fn clean(value: &str) -> Option<String> {
    let trimmed = value.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_u16(text: &str) -> Option<u16> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok().filter(|n: &u16| *n > 0)
}

fn parse_flag(text: &str) -> bool {
    matches!(
        text.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.len() != 4 {
        None
    } else {
        digits.parse().ok()
    }
}

fn parse_genres(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in text.split(&[';', ',', '/', '|', '\0'][..]) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown Track".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, TagValue)]) -> RawTags {
        let mut raw = RawTags::default();
        for (key, value) in pairs {
            raw.insert(*key, value.clone());
        }
        raw
    }

    fn text_value(value: &str) -> TagValue {
        TagValue::Text(value.to_string())
    }

    #[test]
    fn title_falls_back_to_file_stem() {
        let meta = normalize(&RawTags::default(), Path::new("/music/01 - Intro.flac"));
        assert_eq!(meta.title, "01 - Intro");
        assert_eq!(meta.resolved_artist(), UNKNOWN_ARTIST);
    }

    #[test]
    fn album_artist_wins_over_track_artist() {
        let meta = normalize(
            &raw(&[
                ("artist", text_value("Queen feat. Bowie")),
                ("albumartist", text_value("Queen")),
            ]),
            Path::new("a.mp3"),
        );
        assert_eq!(meta.resolved_artist(), "Queen");

        let meta = normalize(&raw(&[("artist", text_value("Queen"))]), Path::new("a.mp3"));
        assert_eq!(meta.resolved_artist(), "Queen");
    }

    #[test]
    fn blank_tags_count_as_missing() {
        let meta = normalize(
            &raw(&[("albumartist", text_value("  \0")), ("artist", text_value("Beatles"))]),
            Path::new("a.mp3"),
        );
        assert_eq!(meta.album_artist, None);
        assert_eq!(meta.resolved_artist(), "Beatles");
    }

    #[test]
    fn numbers_accept_every_variant() {
        let meta = normalize(
            &raw(&[
                ("tracknumber", text_value("3/12")),
                ("discnumber", TagValue::Number(2)),
            ]),
            Path::new("a.mp3"),
        );
        assert_eq!(meta.track_no, Some(3));
        assert_eq!(meta.disc_no, Some(2));

        let meta = normalize(
            &raw(&[(
                "tracknumber",
                TagValue::List(vec!["".to_string(), "7".to_string()]),
            )]),
            Path::new("a.mp3"),
        );
        assert_eq!(meta.track_no, Some(7));

        let meta = normalize(&raw(&[("tracknumber", TagValue::Number(-4))]), Path::new("a.mp3"));
        assert_eq!(meta.track_no, None);
    }

    #[test]
    fn year_prefers_year_then_date() {
        let meta = normalize(&raw(&[("date", text_value("1969-09-26"))]), Path::new("a"));
        assert_eq!(meta.year, Some(1969));
        let meta = normalize(
            &raw(&[("year", text_value("2019")), ("date", text_value("1969"))]),
            Path::new("a"),
        );
        assert_eq!(meta.year, Some(2019));
        let meta = normalize(&raw(&[("year", text_value("69"))]), Path::new("a"));
        assert_eq!(meta.year, None);
    }

    #[test]
    fn described_values_use_their_text() {
        let meta = normalize(
            &raw(&[
                (
                    "comment",
                    TagValue::Described {
                        language: Some("eng".to_string()),
                        description: String::new(),
                        text: "Remastered".to_string(),
                    },
                ),
                (
                    "lyrics",
                    TagValue::Described {
                        language: None,
                        description: "verse".to_string(),
                        text: "Here come old flat top".to_string(),
                    },
                ),
            ]),
            Path::new("a"),
        );
        assert_eq!(meta.comment.as_deref(), Some("Remastered"));
        assert_eq!(meta.lyrics.as_deref(), Some("Here come old flat top"));
    }

    #[test]
    fn genres_are_split_and_deduplicated() {
        let meta = normalize(
            &raw(&[
                ("genre", text_value("Rock; Blues")),
                ("genre", text_value("rock|Jazz")),
            ]),
            Path::new("a"),
        );
        assert_eq!(meta.genres, vec!["Rock", "Blues", "Jazz"]);
    }

    #[test]
    fn compilation_flag_variants() {
        assert!(normalize(&raw(&[("compilation", text_value("1"))]), Path::new("a")).compilation);
        assert!(normalize(&raw(&[("compilation", TagValue::Number(1))]), Path::new("a")).compilation);
        assert!(!normalize(&raw(&[("compilation", text_value("0"))]), Path::new("a")).compilation);
    }

    #[test]
    fn external_ids_follow_resolved_artist() {
        let meta = normalize(
            &raw(&[
                ("artist", text_value("A")),
                ("musicbrainz_artistid", text_value("artist-mbid")),
                ("musicbrainz_albumid", text_value("release-mbid")),
                ("musicbrainz_trackid", text_value("track-mbid")),
            ]),
            Path::new("a"),
        );
        assert_eq!(meta.resolved_artist_external_id(), Some("artist-mbid"));
        assert_eq!(meta.external_ids.release.as_deref(), Some("release-mbid"));
        assert_eq!(meta.external_ids.recording.as_deref(), Some("track-mbid"));
    }
}
