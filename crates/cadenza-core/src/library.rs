//! Music library
//!
//! The in-memory track collection. Tracks are keyed by id and additionally
//! indexed by artist, album and genre; every change updates the map and all
//! three indices under a single write lock.

use std::collections::HashMap;
use std::path::{ Path, PathBuf };
use std::sync::{ Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard };
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use crate::error::{ PlayerError, ScanError };
use crate::scanner::Scanner;
use crate::track::{ Track, TrackId };


/// Outcome of [`Library::scan`].
#[derive( Debug, Default )]
pub struct ScanReport {
    /// Tracks added (or refreshed) in the library.
    pub added: usize,
    pub errors: Vec<ScanError>,
}


/// Secondary index from a display field to track ids, in insertion order.
type FieldIndex = HashMap<String, Vec<TrackId>>;


#[derive( Debug, Default )]
struct Collection {
    tracks: HashMap<TrackId, Arc<Track>>,
    by_artist: FieldIndex,
    by_album: FieldIndex,
    by_genre: FieldIndex,
    scan_paths: Vec<PathBuf>,
    last_scanned: Option<SystemTime>,
}


impl Collection {
    /// Inserts or replaces a track, keeping the indices in step.
    fn insert( &mut self, track: Arc<Track> ) {
        if let Some( old ) = self.tracks.remove( &track.id ) {
            self.unindex( &old );
        }
        index_key( &mut self.by_artist, &track.artist, &track.id );
        index_key( &mut self.by_album, &track.album, &track.id );
        index_key( &mut self.by_genre, &track.genre, &track.id );
        self.tracks.insert( track.id.clone(), track );
    }


    fn remove( &mut self, id: &TrackId ) -> Option<Arc<Track>> {
        let track = self.tracks.remove( id )?;
        self.unindex( &track );
        Some( track )
    }


    fn unindex( &mut self, track: &Track ) {
        unindex_key( &mut self.by_artist, &track.artist, &track.id );
        unindex_key( &mut self.by_album, &track.album, &track.id );
        unindex_key( &mut self.by_genre, &track.genre, &track.id );
    }


    fn lookup( &self, index: &FieldIndex, key: &str ) -> Vec<Arc<Track>> {
        index.get( key )
            .map( |ids| ids.iter().filter_map( |id| self.tracks.get( id ).cloned() ).collect() )
            .unwrap_or_default()
    }
}


fn index_key( index: &mut FieldIndex, key: &str, id: &TrackId ) {
    if !key.is_empty() {
        index.entry( key.to_string() ).or_default().push( id.clone() );
    }
}


fn unindex_key( index: &mut FieldIndex, key: &str, id: &TrackId ) {
    if let Some( ids ) = index.get_mut( key ) {
        ids.retain( |i| i != id );
        if ids.is_empty() {
            index.remove( key );
        }
    }
}


fn sorted_keys( index: &FieldIndex ) -> Vec<String> {
    let mut keys: Vec<String> = index.keys().cloned().collect();
    keys.sort();
    keys
}


/// Thread-safe track collection.
pub struct Library {
    inner: RwLock<Collection>,
    scanner: Scanner,
}


impl Default for Library {
    fn default() -> Self {
        Self::new()
    }
}


impl Library {
    pub fn new() -> Self {
        Self::with_scanner( Scanner::default() )
    }


    pub fn with_scanner( scanner: Scanner ) -> Self {
        Self {
            inner: RwLock::new( Collection::default() ),
            scanner,
        }
    }


    fn read( &self ) -> RwLockReadGuard<'_, Collection> {
        self.inner.read().unwrap_or_else( PoisonError::into_inner )
    }


    fn write( &self ) -> RwLockWriteGuard<'_, Collection> {
        self.inner.write().unwrap_or_else( PoisonError::into_inner )
    }


    pub fn scanner( &self ) -> &Scanner {
        &self.scanner
    }


    /// Adds a track, replacing any track with the same id.
    pub fn add_track( &self, track: impl Into<Arc<Track>> ) {
        self.write().insert( track.into() );
    }


    pub fn get_track( &self, id: &TrackId ) -> Result<Arc<Track>, PlayerError> {
        self.read().tracks.get( id ).cloned().ok_or( PlayerError::TrackNotFound )
    }


    pub fn remove_track( &self, id: &TrackId ) -> Result<Arc<Track>, PlayerError> {
        self.write().remove( id ).ok_or( PlayerError::TrackNotFound )
    }


    /// Returns every track, ordered by artist, album and track number.
    pub fn all_tracks( &self ) -> Vec<Arc<Track>> {
        let mut tracks: Vec<Arc<Track>> = self.read().tracks.values().cloned().collect();
        tracks.sort_by( |a, b| {
            a.artist.cmp( &b.artist )
                .then_with( || a.album.cmp( &b.album ) )
                .then_with( || a.track_number.cmp( &b.track_number ) )
                .then_with( || a.title.cmp( &b.title ) )
        });
        tracks
    }


    pub fn tracks_by_artist( &self, artist: &str ) -> Vec<Arc<Track>> {
        let inner = self.read();
        inner.lookup( &inner.by_artist, artist )
    }


    pub fn tracks_by_album( &self, album: &str ) -> Vec<Arc<Track>> {
        let inner = self.read();
        inner.lookup( &inner.by_album, album )
    }


    pub fn tracks_by_genre( &self, genre: &str ) -> Vec<Arc<Track>> {
        let inner = self.read();
        inner.lookup( &inner.by_genre, genre )
    }


    pub fn artists( &self ) -> Vec<String> {
        sorted_keys( &self.read().by_artist )
    }


    pub fn albums( &self ) -> Vec<String> {
        sorted_keys( &self.read().by_album )
    }


    pub fn genres( &self ) -> Vec<String> {
        sorted_keys( &self.read().by_genre )
    }


    /// Case-insensitive search over title, artist and album.
    ///
    /// Title matches come first.
    pub fn search( &self, query: &str ) -> Vec<Arc<Track>> {
        let query = query.to_lowercase();
        let matches = |field: &str| field.to_lowercase().contains( &query );

        let mut results: Vec<Arc<Track>> = self.all_tracks()
            .into_iter()
            .filter( |t| matches( &t.title ) || matches( &t.artist ) || matches( &t.album ) )
            .collect();

        // Stable, so the library order holds within each group
        results.sort_by_key( |t| !matches( &t.title ) );
        results
    }


    pub fn clear( &self ) {
        let mut inner = self.write();
        let scan_paths = std::mem::take( &mut inner.scan_paths );
        let last_scanned = inner.last_scanned;
        *inner = Collection {
            scan_paths,
            last_scanned,
            ..Collection::default()
        };
    }


    pub fn len( &self ) -> usize {
        self.read().tracks.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.read().tracks.is_empty()
    }


    /// Scans `paths` and adds every track found.
    ///
    /// Per-file failures do not stop the scan; they are collected in the
    /// report while the rest of the files are still added.
    pub async fn scan( &self, token: CancellationToken, paths: Vec<PathBuf> ) -> ScanReport {
        self.write().scan_paths = paths.clone();

        let ( mut tracks, mut errors ) = self.scanner.scan( token, paths );
        let mut report = ScanReport::default();
        let mut tracks_open = true;
        let mut errors_open = true;

        while tracks_open || errors_open {
            tokio::select! {
                track = tracks.recv(), if tracks_open => match track {
                    Some( track ) => {
                        self.add_track( track );
                        report.added += 1;
                    }
                    None => tracks_open = false,
                },
                error = errors.recv(), if errors_open => match error {
                    Some( error ) => report.errors.push( error ),
                    None => errors_open = false,
                },
            }
        }

        self.write().last_scanned = Some( SystemTime::now() );
        tracing::info!(
            "Library scan finished: {} tracks added, {} errors, {} total",
            report.added,
            report.errors.len(),
            self.len()
        );
        report
    }


    /// Reads a single file into the library.
    pub fn add_file( &self, path: &Path ) -> Result<Arc<Track>, PlayerError> {
        let track = Arc::new( self.scanner.scan_file( path )? );
        self.add_track( Arc::clone( &track ) );
        Ok( track )
    }


    /// Roots of the most recent scan.
    pub fn scan_paths( &self ) -> Vec<PathBuf> {
        self.read().scan_paths.clone()
    }


    pub fn last_scanned( &self ) -> Option<SystemTime> {
        self.read().last_scanned
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::fs;


    fn tagged( path: &str, artist: &str, album: &str, genre: &str, number: u32 ) -> Track {
        let mut track = Track::from_path( path );
        track.artist = artist.into();
        track.album = album.into();
        track.genre = genre.into();
        track.track_number = Some( number );
        track
    }


    fn sample_library() -> Library {
        let library = Library::new();
        library.add_track( tagged( "/m/night.mp3", "Owls", "Dusk", "Folk", 2 ) );
        library.add_track( tagged( "/m/morning.mp3", "Owls", "Dusk", "Folk", 1 ) );
        library.add_track( tagged( "/m/static.flac", "Antennas", "Signals", "Noise", 1 ) );
        library.add_track( tagged( "/m/owl song.wav", "Larks", "Night Owl", "", 1 ) );
        library
    }


    #[test]
    fn test_readding_track_keeps_single_entry() {
        let library = Library::new();
        library.add_track( tagged( "/m/a.mp3", "Owls", "Dusk", "Folk", 1 ) );
        library.add_track( tagged( "/m/a.mp3", "Owls", "Dusk", "Folk", 1 ) );

        assert_eq!( library.len(), 1 );
        assert_eq!( library.tracks_by_artist( "Owls" ).len(), 1 );
        assert_eq!( library.tracks_by_album( "Dusk" ).len(), 1 );

        // Retagged: the old artist disappears from the index
        library.add_track( tagged( "/m/a.mp3", "Larks", "Dusk", "Folk", 1 ) );
        assert_eq!( library.artists(), vec![ "Larks" ] );
        assert!( library.tracks_by_artist( "Owls" ).is_empty() );
    }


    #[test]
    fn test_get_and_remove() {
        let library = sample_library();
        let id = TrackId::from_path( Path::new( "/m/night.mp3" ) );

        assert_eq!( library.get_track( &id ).unwrap().title, "night" );
        library.remove_track( &id ).unwrap();

        assert!( matches!( library.get_track( &id ), Err( PlayerError::TrackNotFound ) ) );
        assert!( matches!( library.remove_track( &id ), Err( PlayerError::TrackNotFound ) ) );
        assert_eq!( library.tracks_by_artist( "Owls" ).len(), 1 );
    }


    #[test]
    fn test_empty_fields_are_not_indexed() {
        let library = sample_library();
        library.add_track( Track::from_path( "/m/untagged.mp3" ) );

        assert_eq!( library.artists(), vec![ "Antennas", "Larks", "Owls" ] );
        assert_eq!( library.genres(), vec![ "Folk", "Noise" ] );
        assert_eq!( library.albums(), vec![ "Dusk", "Night Owl", "Signals" ] );
    }


    #[test]
    fn test_all_tracks_sorted() {
        let library = sample_library();
        let titles: Vec<_> = library.all_tracks().iter().map( |t| t.title.clone() ).collect();
        assert_eq!( titles, vec![ "static", "owl song", "morning", "night" ] );
    }


    #[test]
    fn test_search_puts_title_matches_first() {
        let library = sample_library();

        let titles: Vec<_> = library.search( "OWL" ).iter().map( |t| t.title.clone() ).collect();
        assert_eq!( titles, vec![ "owl song", "morning", "night" ] );
        assert!( library.search( "nothing like this" ).is_empty() );
    }


    #[test]
    fn test_clear() {
        let library = sample_library();
        library.clear();
        assert!( library.is_empty() );
        assert!( library.artists().is_empty() );
    }


    #[tokio::test]
    async fn test_scan_adds_tracks_and_collects_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::write( dir.path().join( "one.mp3" ), b"x" ).unwrap();
        fs::write( dir.path().join( "two.wav" ), b"x" ).unwrap();
        fs::write( dir.path().join( "skip.txt" ), b"x" ).unwrap();
        let missing = dir.path().join( "missing" );

        let library = Library::new();
        let report = library.scan(
            CancellationToken::new(),
            vec![ dir.path().to_path_buf(), missing.clone() ],
        ).await;

        assert_eq!( report.added, 2 );
        assert_eq!( report.errors.len(), 1 );
        assert_eq!( report.errors[ 0 ].path, missing );
        assert_eq!( library.len(), 2 );
        assert!( library.last_scanned().is_some() );
        assert_eq!( library.scan_paths().len(), 2 );

        // Rescanning the same files does not duplicate them
        library.scan( CancellationToken::new(), vec![ dir.path().to_path_buf() ] ).await;
        assert_eq!( library.len(), 2 );
    }


    #[test]
    fn test_add_file() {
        let dir = tempfile::tempdir().unwrap();
        let song = dir.path().join( "song.flac" );
        fs::write( &song, b"x" ).unwrap();

        let library = Library::new();
        let track = library.add_file( &song ).unwrap();
        assert_eq!( library.get_track( &track.id ).unwrap().file_path, song );

        let result = library.add_file( &dir.path().join( "notes.txt" ) );
        assert!( matches!( result, Err( PlayerError::InvalidFormat( _ ) ) ) );
    }
}
