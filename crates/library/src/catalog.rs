use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use common::{comparison_key, stable_id, Album, Artist, Track, UNKNOWN_ALBUM, UNKNOWN_ARTIST};
use metadata::TrackMetadata;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    decode_value, get_text, get_value, link_key, linked_ids, put_text, put_value, remove_key,
    table_len, LibraryError, ALBUMS_TABLE, ALBUM_KEYS_TABLE, ALBUM_TRACKS_TABLE, ARTISTS_TABLE,
    ARTIST_ALBUMS_TABLE, ARTIST_KEYS_TABLE, ARTIST_TRACKS_TABLE, TRACKS_TABLE, TRACK_PATHS_TABLE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackOutcome {
    Created,
    Updated,
}

/// What one reconcile transaction did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub outcome: TrackOutcome,
    pub track_id: String,
    pub artist_id: String,
    pub album_id: String,
    pub artist_created: bool,
    pub album_created: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub tracks_deleted: u32,
    pub albums_deleted: u32,
    pub artists_deleted: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LibraryStats {
    pub artists: usize,
    pub albums: usize,
    pub tracks: usize,
}

/// Artist/album/track tables plus the indexes that tie them together.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<Database>,
}

impl Catalog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Resolves the owning artist and album for one file, upserts its track
    /// and recomputes every aggregate the write touched, all in one write
    /// transaction. redb admits a single writer at a time, so two files of a
    /// new album can never both decide to create it.
    pub fn apply(
        &self,
        path: &str,
        file_size: u64,
        meta: &TrackMetadata,
    ) -> Result<ApplyOutcome, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let outcome = apply_in_txn(&write_txn, path, file_size, meta)?;
        write_txn.commit()?;
        Ok(outcome)
    }

    pub fn set_album_cover(&self, album_id: &str, cover_ref: &str) -> Result<bool, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let updated = match get_value::<Album>(&write_txn, ALBUMS_TABLE, album_id)? {
            Some(mut album) => {
                album.cover_ref = Some(cover_ref.to_string());
                put_value(&write_txn, ALBUMS_TABLE, album_id, &album)?;
                true
            }
            None => false,
        };
        write_txn.commit()?;
        Ok(updated)
    }

    /// Deletes tracks whose file is gone, then albums left without tracks,
    /// then artists left without albums or tracks. Orphans only show up once
    /// the previous step has run, so the order is fixed.
    pub fn prune_missing(&self) -> Result<PruneReport, LibraryError> {
        let missing = self.missing_track_ids()?;
        self.prune_tracks(&missing)
    }

    fn missing_track_ids(&self) -> Result<Vec<String>, LibraryError> {
        Ok(self
            .list_tracks()?
            .into_iter()
            .filter(|track| !Path::new(&track.path).exists())
            .map(|track| track.id)
            .collect())
    }

    /// Candidates are re-read inside the write transaction; a track retagged
    /// or restored since it was listed is pruned by its current links or kept.
    fn prune_tracks(&self, candidates: &[String]) -> Result<PruneReport, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let mut report = PruneReport::default();

        let mut missing = Vec::new();
        for track_id in candidates {
            if let Some(track) = get_value::<Track>(&write_txn, TRACKS_TABLE, track_id)? {
                if !Path::new(&track.path).exists() {
                    missing.push(track);
                }
            }
        }

        let mut touched_albums = BTreeSet::new();
        let mut touched_artists = BTreeSet::new();
        for track in &missing {
            if delete_track(&write_txn, track)? {
                report.tracks_deleted += 1;
                debug!("Pruned missing track {}", track.path);
            }
            touched_albums.insert(track.album_id.clone());
            touched_artists.insert(track.artist_id.clone());
            touched_artists.insert(track.album_artist_id.clone());
        }
        for album_id in &touched_albums {
            recompute_album(&write_txn, album_id)?;
        }

        for album in all_values::<Album>(&write_txn, ALBUMS_TABLE)? {
            if !linked_ids(&write_txn, ALBUM_TRACKS_TABLE, &album.id)?.is_empty() {
                continue;
            }
            remove_key(&write_txn, ALBUMS_TABLE, &album.id)?;
            remove_key(&write_txn, ALBUM_KEYS_TABLE, &album.name_key)?;
            remove_key(
                &write_txn,
                ARTIST_ALBUMS_TABLE,
                &link_key(&album.artist_id, &album.id),
            )?;
            touched_artists.insert(album.artist_id.clone());
            report.albums_deleted += 1;
        }
        for artist_id in &touched_artists {
            recompute_artist(&write_txn, artist_id)?;
        }

        for artist in all_values::<Artist>(&write_txn, ARTISTS_TABLE)? {
            let has_albums = !linked_ids(&write_txn, ARTIST_ALBUMS_TABLE, &artist.id)?.is_empty();
            let has_tracks = !linked_ids(&write_txn, ARTIST_TRACKS_TABLE, &artist.id)?.is_empty();
            if has_albums || has_tracks {
                continue;
            }
            remove_key(&write_txn, ARTISTS_TABLE, &artist.id)?;
            remove_key(&write_txn, ARTIST_KEYS_TABLE, &artist.name_key)?;
            report.artists_deleted += 1;
        }

        write_txn.commit()?;
        if report != PruneReport::default() {
            info!(
                "Pruned {} tracks, {} albums, {} artists",
                report.tracks_deleted, report.albums_deleted, report.artists_deleted
            );
        }
        Ok(report)
    }

    pub fn stats(&self) -> Result<LibraryStats, LibraryError> {
        Ok(LibraryStats {
            artists: table_len(&self.db, ARTISTS_TABLE)?,
            albums: table_len(&self.db, ALBUMS_TABLE)?,
            tracks: table_len(&self.db, TRACKS_TABLE)?,
        })
    }

    pub fn get_artist(&self, artist_id: &str) -> Result<Option<Artist>, LibraryError> {
        self.read_value(ARTISTS_TABLE, artist_id)
    }

    pub fn get_album(&self, album_id: &str) -> Result<Option<Album>, LibraryError> {
        self.read_value(ALBUMS_TABLE, album_id)
    }

    pub fn find_track_by_path(&self, path: &str) -> Result<Option<Track>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let paths = read_txn.open_table(TRACK_PATHS_TABLE)?;
        let track_id = match paths.get(path)? {
            Some(value) => String::from_utf8_lossy(value.value()).to_string(),
            None => return Ok(None),
        };
        let tracks = read_txn.open_table(TRACKS_TABLE)?;
        let track = match tracks.get(track_id.as_str())? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(track)
    }

    pub fn list_artists(&self) -> Result<Vec<Artist>, LibraryError> {
        self.read_all(ARTISTS_TABLE)
    }

    pub fn list_albums(&self) -> Result<Vec<Album>, LibraryError> {
        self.read_all(ALBUMS_TABLE)
    }

    pub fn list_tracks(&self) -> Result<Vec<Track>, LibraryError> {
        self.read_all(TRACKS_TABLE)
    }

    fn read_value<T: for<'de> Deserialize<'de>>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let value = match table.get(key)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(value)
    }

    fn read_all<T: for<'de> Deserialize<'de>>(
        &self,
        table: TableDefinition<&str, &[u8]>,
    ) -> Result<Vec<T>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let mut items = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            items.push(decode_value(entry.1.value())?);
        }
        Ok(items)
    }
}

fn apply_in_txn(
    txn: &WriteTransaction,
    path: &str,
    file_size: u64,
    meta: &TrackMetadata,
) -> Result<ApplyOutcome, LibraryError> {
    let (artist, artist_created) = find_or_create_artist(
        txn,
        meta.resolved_artist(),
        meta.resolved_artist_external_id(),
    )?;
    let (album, album_created) = find_or_create_album(txn, meta, &artist.id)?;

    let existing_id = get_text(txn, TRACK_PATHS_TABLE, path)?;
    let track_id = existing_id.clone().unwrap_or_else(|| stable_id(path));
    let previous: Option<Track> = match &existing_id {
        Some(id) => get_value(txn, TRACKS_TABLE, id)?,
        None => None,
    };

    let track = Track {
        id: track_id.clone(),
        path: path.to_string(),
        title: meta.title.clone(),
        artist_id: artist.id.clone(),
        album_id: album.id.clone(),
        album_artist_id: album.artist_id.clone(),
        track_no: meta.track_no,
        disc_no: meta.disc_no,
        year: meta.year,
        duration_ms: meta.duration_ms.unwrap_or(0),
        bitrate: meta.bitrate,
        channels: meta.channels,
        size: file_size,
        external_ids: meta.external_ids.clone(),
        genres: meta.genres.clone(),
        comment: meta.comment.clone(),
        lyrics: meta.lyrics.clone(),
    };

    let mut stale_albums = BTreeSet::new();
    let mut stale_artists = BTreeSet::new();
    if let Some(previous) = &previous {
        if previous.album_id != track.album_id {
            remove_key(txn, ALBUM_TRACKS_TABLE, &link_key(&previous.album_id, &track_id))?;
            stale_albums.insert(previous.album_id.clone());
        }
        if previous.artist_id != track.artist_id {
            remove_key(txn, ARTIST_TRACKS_TABLE, &link_key(&previous.artist_id, &track_id))?;
            stale_artists.insert(previous.artist_id.clone());
        }
        stale_artists.insert(previous.album_artist_id.clone());
    }

    put_value(txn, TRACKS_TABLE, &track_id, &track)?;
    put_text(txn, TRACK_PATHS_TABLE, path, &track_id)?;
    put_text(txn, ALBUM_TRACKS_TABLE, &link_key(&album.id, &track_id), &track_id)?;
    put_text(txn, ARTIST_TRACKS_TABLE, &link_key(&artist.id, &track_id), &track_id)?;

    recompute_album(txn, &album.id)?;
    for album_id in &stale_albums {
        recompute_album(txn, album_id)?;
    }
    stale_artists.insert(artist.id.clone());
    stale_artists.insert(album.artist_id.clone());
    for artist_id in &stale_artists {
        recompute_artist(txn, artist_id)?;
    }

    Ok(ApplyOutcome {
        outcome: if previous.is_some() {
            TrackOutcome::Updated
        } else {
            TrackOutcome::Created
        },
        track_id,
        artist_id: artist.id,
        album_id: album.id,
        artist_created,
        album_created,
    })
}

fn find_or_create_artist(
    txn: &WriteTransaction,
    name: &str,
    external_id: Option<&str>,
) -> Result<(Artist, bool), LibraryError> {
    let mut name_key = comparison_key(name);
    let mut display = name.trim().to_string();
    if name_key.is_empty() {
        name_key = comparison_key(UNKNOWN_ARTIST);
        display = UNKNOWN_ARTIST.to_string();
    }

    if let Some(id) = get_text(txn, ARTIST_KEYS_TABLE, &name_key)? {
        if let Some(mut artist) = get_value::<Artist>(txn, ARTISTS_TABLE, &id)? {
            if artist.external_id.is_none() && external_id.is_some() {
                artist.external_id = external_id.map(str::to_string);
                put_value(txn, ARTISTS_TABLE, &id, &artist)?;
            }
            return Ok((artist, false));
        }
    }

    let artist = Artist {
        id: stable_id(&format!("artist:{}", name_key)),
        name: display,
        name_key,
        external_id: external_id.map(str::to_string),
        album_count: 0,
        song_count: 0,
        size: 0,
    };
    put_value(txn, ARTISTS_TABLE, &artist.id, &artist)?;
    put_text(txn, ARTIST_KEYS_TABLE, &artist.name_key, &artist.id)?;
    debug!("Created artist '{}'", artist.name);
    Ok((artist, true))
}

fn find_or_create_album(
    txn: &WriteTransaction,
    meta: &TrackMetadata,
    artist_id: &str,
) -> Result<(Album, bool), LibraryError> {
    let name = meta.album.as_deref().unwrap_or(UNKNOWN_ALBUM);
    let mut name_key = comparison_key(name);
    let mut display = name.trim().to_string();
    if name_key.is_empty() {
        name_key = comparison_key(UNKNOWN_ALBUM);
        display = UNKNOWN_ALBUM.to_string();
    }

    if let Some(id) = get_text(txn, ALBUM_KEYS_TABLE, &name_key)? {
        if let Some(mut album) = get_value::<Album>(txn, ALBUMS_TABLE, &id)? {
            let mut changed = false;
            if album.year.is_none() && meta.year.is_some() {
                album.year = meta.year;
                changed = true;
            }
            if !album.compilation && meta.compilation {
                album.compilation = true;
                changed = true;
            }
            if album.external_ids.release.is_none() && meta.external_ids.release.is_some() {
                album.external_ids.release = meta.external_ids.release.clone();
                album.external_ids.release_group = meta.external_ids.release_group.clone();
                changed = true;
            }
            if changed {
                put_value(txn, ALBUMS_TABLE, &id, &album)?;
            }
            return Ok((album, false));
        }
    }

    let album = Album {
        id: stable_id(&format!("album:{}", name_key)),
        name: display,
        name_key,
        artist_id: artist_id.to_string(),
        year: meta.year,
        compilation: meta.compilation,
        external_ids: common::ExternalIds {
            recording: None,
            release: meta.external_ids.release.clone(),
            release_group: meta.external_ids.release_group.clone(),
        },
        cover_ref: None,
        song_count: 0,
        duration_ms: 0,
        size: 0,
    };
    put_value(txn, ALBUMS_TABLE, &album.id, &album)?;
    put_text(txn, ALBUM_KEYS_TABLE, &album.name_key, &album.id)?;
    put_text(txn, ARTIST_ALBUMS_TABLE, &link_key(artist_id, &album.id), &album.id)?;
    debug!("Created album '{}'", album.name);
    Ok((album, true))
}

fn delete_track(txn: &WriteTransaction, track: &Track) -> Result<bool, LibraryError> {
    let removed = remove_key(txn, TRACKS_TABLE, &track.id)?;
    remove_key(txn, TRACK_PATHS_TABLE, &track.path)?;
    remove_key(txn, ALBUM_TRACKS_TABLE, &link_key(&track.album_id, &track.id))?;
    remove_key(txn, ARTIST_TRACKS_TABLE, &link_key(&track.artist_id, &track.id))?;
    Ok(removed)
}

/// Album totals as a fresh sum over its current tracks.
fn recompute_album(txn: &WriteTransaction, album_id: &str) -> Result<(), LibraryError> {
    let mut album: Album = match get_value(txn, ALBUMS_TABLE, album_id)? {
        Some(album) => album,
        None => return Ok(()),
    };
    let mut song_count = 0u32;
    let mut duration_ms = 0u64;
    let mut size = 0u64;
    for track_id in linked_ids(txn, ALBUM_TRACKS_TABLE, album_id)? {
        if let Some(track) = get_value::<Track>(txn, TRACKS_TABLE, &track_id)? {
            song_count += 1;
            duration_ms += u64::from(track.duration_ms);
            size += track.size;
        }
    }
    if album.song_count != song_count || album.duration_ms != duration_ms || album.size != size {
        album.song_count = song_count;
        album.duration_ms = duration_ms;
        album.size = size;
        put_value(txn, ALBUMS_TABLE, album_id, &album)?;
    }
    Ok(())
}

/// Artist totals as a fresh sum over its current albums and tracks.
fn recompute_artist(txn: &WriteTransaction, artist_id: &str) -> Result<(), LibraryError> {
    let mut artist: Artist = match get_value(txn, ARTISTS_TABLE, artist_id)? {
        Some(artist) => artist,
        None => return Ok(()),
    };
    let album_count = linked_ids(txn, ARTIST_ALBUMS_TABLE, artist_id)?.len() as u32;
    let mut song_count = 0u32;
    let mut size = 0u64;
    for track_id in linked_ids(txn, ARTIST_TRACKS_TABLE, artist_id)? {
        if let Some(track) = get_value::<Track>(txn, TRACKS_TABLE, &track_id)? {
            song_count += 1;
            size += track.size;
        }
    }
    if artist.album_count != album_count || artist.song_count != song_count || artist.size != size
    {
        artist.album_count = album_count;
        artist.song_count = song_count;
        artist.size = size;
        put_value(txn, ARTISTS_TABLE, artist_id, &artist)?;
    }
    Ok(())
}

fn all_values<T: for<'de> Deserialize<'de>>(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
) -> Result<Vec<T>, LibraryError> {
    let table = txn.open_table(table)?;
    let mut items = Vec::new();
    for entry in table.iter()? {
        let entry = entry?;
        items.push(decode_value(entry.1.value())?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_db;
    use metadata::{normalize, RawTags};
    use std::fs;
    use tempfile::TempDir;

    fn catalog() -> (TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir.path().join("index.redb")).unwrap();
        (dir, Catalog::new(db))
    }

    fn meta(pairs: &[(&str, &str)], duration_ms: u32) -> TrackMetadata {
        let mut raw = RawTags::default();
        for (key, value) in pairs {
            raw = raw.with_text(key, value);
        }
        raw.properties.duration_ms = Some(duration_ms);
        normalize(&raw, Path::new("track.mp3"))
    }

    fn assert_aggregates_consistent(catalog: &Catalog) {
        let tracks = catalog.list_tracks().unwrap();
        for album in catalog.list_albums().unwrap() {
            let children: Vec<_> = tracks.iter().filter(|t| t.album_id == album.id).collect();
            assert_eq!(album.song_count as usize, children.len(), "album {}", album.name);
            assert_eq!(
                album.duration_ms,
                children.iter().map(|t| u64::from(t.duration_ms)).sum::<u64>()
            );
            assert_eq!(album.size, children.iter().map(|t| t.size).sum::<u64>());
        }
        let albums = catalog.list_albums().unwrap();
        for artist in catalog.list_artists().unwrap() {
            let owned = albums.iter().filter(|a| a.artist_id == artist.id).count();
            let children: Vec<_> = tracks.iter().filter(|t| t.artist_id == artist.id).collect();
            assert_eq!(artist.album_count as usize, owned, "artist {}", artist.name);
            assert_eq!(artist.song_count as usize, children.len());
            assert_eq!(artist.size, children.iter().map(|t| t.size).sum::<u64>());
        }
    }

    #[test]
    fn first_file_creates_artist_album_and_track() {
        let (_dir, catalog) = catalog();
        let outcome = catalog
            .apply(
                "/music/come_together.mp3",
                1000,
                &meta(
                    &[
                        ("artist", "Beatles"),
                        ("album", "Abbey Road"),
                        ("title", "Come Together"),
                    ],
                    259_000,
                ),
            )
            .unwrap();

        assert_eq!(outcome.outcome, TrackOutcome::Created);
        assert!(outcome.artist_created);
        assert!(outcome.album_created);
        let stats = catalog.stats().unwrap();
        assert_eq!((stats.artists, stats.albums, stats.tracks), (1, 1, 1));

        let album = catalog.get_album(&outcome.album_id).unwrap().unwrap();
        assert_eq!(album.name, "Abbey Road");
        assert_eq!(album.song_count, 1);
        assert_eq!(album.duration_ms, 259_000);
        let artist = catalog.get_artist(&outcome.artist_id).unwrap().unwrap();
        assert_eq!(artist.album_count, 1);
        assert_eq!(artist.size, 1000);
        assert_aggregates_consistent(&catalog);
    }

    #[test]
    fn reapplying_same_file_updates_in_place() {
        let (_dir, catalog) = catalog();
        let tags = meta(&[("artist", "Beatles"), ("album", "Abbey Road")], 1000);
        let first = catalog.apply("/music/a.mp3", 10, &tags).unwrap();
        let artists_before = catalog.list_artists().unwrap();
        let albums_before = catalog.list_albums().unwrap();
        let tracks_before = catalog.list_tracks().unwrap();

        let second = catalog.apply("/music/a.mp3", 10, &tags).unwrap();
        assert_eq!(second.outcome, TrackOutcome::Updated);
        assert_eq!(second.track_id, first.track_id);
        assert!(!second.artist_created);
        assert!(!second.album_created);
        assert_eq!(catalog.list_artists().unwrap(), artists_before);
        assert_eq!(catalog.list_albums().unwrap(), albums_before);
        assert_eq!(catalog.list_tracks().unwrap(), tracks_before);
    }

    #[test]
    fn artist_names_match_by_comparison_key() {
        let (_dir, catalog) = catalog();
        let a = catalog
            .apply("/m/1.mp3", 1, &meta(&[("artist", "José"), ("album", "X")], 1))
            .unwrap();
        let b = catalog
            .apply("/m/2.mp3", 1, &meta(&[("artist", "Jose"), ("album", "Y")], 1))
            .unwrap();
        assert_eq!(a.artist_id, b.artist_id);

        let c = catalog
            .apply("/m/3.mp3", 1, &meta(&[("artist", "  The   Beatles "), ("album", "Z")], 1))
            .unwrap();
        let d = catalog
            .apply("/m/4.mp3", 1, &meta(&[("artist", "The Beatles"), ("album", "Z")], 1))
            .unwrap();
        assert_eq!(c.artist_id, d.artist_id);
        assert_eq!(catalog.list_artists().unwrap().len(), 2);
        let jose = catalog.get_artist(&a.artist_id).unwrap().unwrap();
        assert_eq!(jose.name, "José");
        assert_eq!(jose.album_count, 2);
        assert_aggregates_consistent(&catalog);
    }

    #[test]
    fn album_identity_ignores_artist() {
        let (_dir, catalog) = catalog();
        let queen = catalog
            .apply(
                "/m/1.mp3",
                100,
                &meta(&[("artist", "Queen"), ("album", "Greatest Hits")], 1000),
            )
            .unwrap();
        let duet = catalog
            .apply(
                "/m/2.mp3",
                200,
                &meta(&[("artist", "Queen feat. Bowie"), ("album", "Greatest Hits")], 2000),
            )
            .unwrap();

        assert_eq!(queen.album_id, duet.album_id);
        assert_ne!(queen.artist_id, duet.artist_id);
        assert_eq!(catalog.list_albums().unwrap().len(), 1);
        assert_eq!(catalog.list_tracks().unwrap().len(), 2);

        let album = catalog.get_album(&queen.album_id).unwrap().unwrap();
        assert_eq!(album.artist_id, queen.artist_id);
        assert_eq!(album.song_count, 2);
        assert_eq!(album.size, 300);
        let track = catalog.find_track_by_path("/m/2.mp3").unwrap().unwrap();
        assert_eq!(track.album_artist_id, queen.artist_id);
        assert_aggregates_consistent(&catalog);
    }

    #[test]
    fn missing_tags_fall_back_to_sentinels() {
        let (_dir, catalog) = catalog();
        let outcome = catalog.apply("/m/x.mp3", 1, &meta(&[], 1)).unwrap();
        let artist = catalog.get_artist(&outcome.artist_id).unwrap().unwrap();
        let album = catalog.get_album(&outcome.album_id).unwrap().unwrap();
        assert_eq!(artist.name, UNKNOWN_ARTIST);
        assert_eq!(album.name, UNKNOWN_ALBUM);
    }

    #[test]
    fn retagging_moves_track_and_fixes_both_albums() {
        let (_dir, catalog) = catalog();
        catalog
            .apply("/m/1.mp3", 10, &meta(&[("artist", "A"), ("album", "First")], 100))
            .unwrap();
        let moved = catalog
            .apply("/m/2.mp3", 20, &meta(&[("artist", "A"), ("album", "First")], 200))
            .unwrap();
        let retagged = catalog
            .apply("/m/2.mp3", 20, &meta(&[("artist", "B"), ("album", "Second")], 200))
            .unwrap();

        assert_eq!(retagged.outcome, TrackOutcome::Updated);
        assert_ne!(moved.album_id, retagged.album_id);
        let first = catalog.get_album(&moved.album_id).unwrap().unwrap();
        assert_eq!(first.song_count, 1);
        assert_eq!(first.size, 10);
        assert_aggregates_consistent(&catalog);
    }

    #[test]
    fn prune_removes_missing_tracks_then_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir.path().join("index.redb")).unwrap();
        let catalog = Catalog::new(db);

        let kept = dir.path().join("kept.mp3");
        let gone = dir.path().join("gone.mp3");
        fs::write(&kept, b"k").unwrap();
        fs::write(&gone, b"g").unwrap();

        catalog
            .apply(
                &kept.to_string_lossy(),
                1,
                &meta(&[("artist", "Stays"), ("album", "Kept")], 1),
            )
            .unwrap();
        let lonely = catalog
            .apply(
                &gone.to_string_lossy(),
                1,
                &meta(&[("artist", "Leaves"), ("album", "Lonely")], 1),
            )
            .unwrap();

        fs::remove_file(&gone).unwrap();
        let report = catalog.prune_missing().unwrap();
        assert_eq!(
            report,
            PruneReport {
                tracks_deleted: 1,
                albums_deleted: 1,
                artists_deleted: 1,
            }
        );
        assert!(catalog.get_album(&lonely.album_id).unwrap().is_none());
        assert!(catalog.get_artist(&lonely.artist_id).unwrap().is_none());
        let stats = catalog.stats().unwrap();
        assert_eq!((stats.artists, stats.albums, stats.tracks), (1, 1, 1));

        assert_eq!(catalog.prune_missing().unwrap(), PruneReport::default());
    }

    #[test]
    fn prune_uses_links_current_at_delete_time() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir.path().join("index.redb")).unwrap();
        let catalog = Catalog::new(db);
        let gone = dir.path().join("gone.mp3");
        fs::write(&gone, b"g").unwrap();
        let path = gone.to_string_lossy().to_string();

        catalog
            .apply(&path, 1, &meta(&[("artist", "Old"), ("album", "First")], 1))
            .unwrap();
        fs::remove_file(&gone).unwrap();
        let candidates = catalog.missing_track_ids().unwrap();
        assert_eq!(candidates.len(), 1);

        let moved = catalog
            .apply(&path, 1, &meta(&[("artist", "New"), ("album", "Second")], 1))
            .unwrap();
        assert_eq!(moved.outcome, TrackOutcome::Updated);

        let report = catalog.prune_tracks(&candidates).unwrap();
        assert_eq!(report.tracks_deleted, 1);
        assert!(catalog.get_album(&moved.album_id).unwrap().is_none());
        assert!(catalog.get_artist(&moved.artist_id).unwrap().is_none());
        let stats = catalog.stats().unwrap();
        assert_eq!((stats.artists, stats.albums, stats.tracks), (0, 0, 0));
    }

    #[test]
    fn prune_skips_candidate_that_came_back() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir.path().join("index.redb")).unwrap();
        let catalog = Catalog::new(db);
        let flaky = dir.path().join("flaky.mp3");
        fs::write(&flaky, b"f").unwrap();
        catalog
            .apply(&flaky.to_string_lossy(), 1, &meta(&[("album", "Back")], 1))
            .unwrap();

        fs::remove_file(&flaky).unwrap();
        let candidates = catalog.missing_track_ids().unwrap();
        fs::write(&flaky, b"f").unwrap();

        assert_eq!(catalog.prune_tracks(&candidates).unwrap(), PruneReport::default());
        assert_eq!(catalog.stats().unwrap().tracks, 1);
    }

    #[test]
    fn prune_keeps_album_owner_and_guest_artists() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir.path().join("index.redb")).unwrap();
        let catalog = Catalog::new(db);
        let owner = dir.path().join("owner.mp3");
        let guest = dir.path().join("guest.mp3");
        fs::write(&guest, b"g").unwrap();

        catalog
            .apply(
                &owner.to_string_lossy(),
                1,
                &meta(&[("artist", "Queen"), ("album", "Greatest Hits")], 1),
            )
            .unwrap();
        catalog
            .apply(
                &guest.to_string_lossy(),
                1,
                &meta(&[("artist", "Queen feat. Bowie"), ("album", "Greatest Hits")], 1),
            )
            .unwrap();

        let report = catalog.prune_missing().unwrap();
        assert_eq!(report.tracks_deleted, 1);
        assert_eq!(report.albums_deleted, 0);
        assert_eq!(report.artists_deleted, 0);
        let mut artists = catalog.list_artists().unwrap();
        artists.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(artists.len(), 2);
        assert_eq!(artists[0].name, "Queen");
        assert_eq!(artists[0].album_count, 1);
        assert_eq!(artists[0].song_count, 0);
        assert_eq!(artists[1].name, "Queen feat. Bowie");
        assert_eq!(artists[1].album_count, 0);
        assert_eq!(artists[1].song_count, 1);
        assert_aggregates_consistent(&catalog);
    }

    #[test]
    fn set_album_cover_updates_existing_album_only() {
        let (_dir, catalog) = catalog();
        let outcome = catalog
            .apply("/m/1.mp3", 1, &meta(&[("album", "Covered")], 1))
            .unwrap();
        assert!(catalog.set_album_cover(&outcome.album_id, "covers/x.jpg").unwrap());
        assert!(!catalog.set_album_cover("missing", "covers/y.jpg").unwrap());
        let album = catalog.get_album(&outcome.album_id).unwrap().unwrap();
        assert_eq!(album.cover_ref.as_deref(), Some("covers/x.jpg"));
    }
}
