//! Library scanning
//!
//! A discovery stage walks the given roots and feeds supported files to a
//! fixed pool of workers, which read each file's metadata on the blocking
//! pool. Tracks and per-file errors come back on two bounded channels that
//! close once every stage has finished.

use std::io;
use std::path::{ Path, PathBuf };
use std::sync::Arc;

use tokio::sync::mpsc::{ self, error::TrySendError };
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::decoder::{ self, extension_of };
use crate::error::{ PlayerError, ScanError };
use crate::metadata::{ MetadataExtractor, TagReader };
use crate::track::Track;


/// Worker count used when none (or zero) is requested.
pub const DEFAULT_WORKERS: usize = 4;

const FILE_CAPACITY: usize = 100;
const TRACK_CAPACITY: usize = 100;
const ERROR_CAPACITY: usize = 10;


/// Concurrent directory scanner.
#[derive( Clone )]
pub struct Scanner {
    workers: usize,
    extractor: Arc<dyn MetadataExtractor>,
}


impl Default for Scanner {
    fn default() -> Self {
        Self::new( DEFAULT_WORKERS )
    }
}


impl Scanner {
    /// Creates a scanner reading tags with [`TagReader`].
    pub fn new( workers: usize ) -> Self {
        Self::with_extractor( workers, Arc::new( TagReader ) )
    }


    pub fn with_extractor( workers: usize, extractor: Arc<dyn MetadataExtractor> ) -> Self {
        let workers = if workers == 0 { DEFAULT_WORKERS } else { workers };
        Self { workers, extractor }
    }


    pub fn workers( &self ) -> usize {
        self.workers
    }


    pub fn supported_formats( &self ) -> Vec<String> {
        decoder::supported_formats()
    }


    /// Scans `paths` recursively.
    ///
    /// Both receivers close once discovery and every worker have exited.
    /// Errors are lossy: when nobody drains the error channel, errors past
    /// its capacity are dropped rather than stalling the scan.
    ///
    /// @param token - Cancelling it stops discovery and the workers
    /// @param paths - Root directories to walk
    ///
    /// @returns Receivers for scanned tracks and per-file errors
    pub fn scan(
        &self,
        token: CancellationToken,
        paths: Vec<PathBuf>,
    ) -> ( mpsc::Receiver<Track>, mpsc::Receiver<ScanError> ) {
        let ( files_tx, files_rx ) = mpsc::channel( FILE_CAPACITY );
        let ( tracks_tx, tracks_rx ) = mpsc::channel( TRACK_CAPACITY );
        let ( errors_tx, errors_rx ) = mpsc::channel( ERROR_CAPACITY );

        tracing::info!( "Scanning {} root(s) with {} workers", paths.len(), self.workers );

        let mut stages = JoinSet::new();

        {
            let errors = errors_tx.clone();
            let token = token.clone();
            stages.spawn_blocking( move || discover( &paths, &files_tx, &errors, &token ) );
        }

        let files = Arc::new( Mutex::new( files_rx ) );
        for id in 0..self.workers {
            let worker = Worker {
                id,
                files: Arc::clone( &files ),
                extractor: Arc::clone( &self.extractor ),
                tracks: tracks_tx.clone(),
                errors: errors_tx.clone(),
                token: token.clone(),
            };
            stages.spawn( worker.run() );
        }

        tokio::spawn( async move {
            while let Some( result ) = stages.join_next().await {
                if let Err( e ) = result {
                    tracing::warn!( "Scan stage failed: {}", e );
                }
            }
            tracing::info!( "Scan complete" );
        });

        ( tracks_rx, errors_rx )
    }


    /// Reads a single file, bypassing the worker pool.
    ///
    /// Unsupported extensions fail with [`PlayerError::InvalidFormat`] before
    /// the file is touched.
    pub fn scan_file( &self, path: &Path ) -> Result<Track, PlayerError> {
        if !decoder::is_supported( path ) {
            let ext = extension_of( path ).map( |e| format!( ".{}", e ) ).unwrap_or_default();
            return Err( PlayerError::InvalidFormat( ext ) );
        }
        Ok( self.extractor.read( path )? )
    }
}


/// Walks every root, sending supported files to the workers.
///
/// Runs on the blocking pool.
fn discover(
    roots: &[PathBuf],
    files: &mpsc::Sender<PathBuf>,
    errors: &mpsc::Sender<ScanError>,
    token: &CancellationToken,
) {
    let mut found = 0usize;

    for root in roots {
        for entry in WalkDir::new( root ).follow_links( true ) {
            if token.is_cancelled() {
                tracing::debug!( "Discovery cancelled after {} files", found );
                return;
            }

            let entry = match entry {
                Ok( entry ) => entry,
                Err( e ) => {
                    let path = e.path().map( Path::to_path_buf ).unwrap_or_else( || root.clone() );
                    report( errors, ScanError::new( path, io::Error::from( e ) ) );
                    continue;
                }
            };

            if !entry.file_type().is_file() || !decoder::is_supported( entry.path() ) {
                continue;
            }

            if files.blocking_send( entry.into_path() ).is_err() {
                tracing::debug!( "Workers gone, discovery stopping" );
                return;
            }
            found += 1;
        }
    }

    tracing::debug!( "Discovery found {} files", found );
}


/// Queues an error without waiting; drops it when the channel is full.
fn report( errors: &mpsc::Sender<ScanError>, error: ScanError ) {
    match errors.try_send( error ) {
        Ok(()) => {}
        Err( TrySendError::Full( error ) ) => {
            tracing::debug!( "Error channel full, dropping: {}", error );
        }
        Err( TrySendError::Closed( _ ) ) => {}
    }
}


struct Worker {
    id: usize,
    files: Arc<Mutex<mpsc::Receiver<PathBuf>>>,
    extractor: Arc<dyn MetadataExtractor>,
    tracks: mpsc::Sender<Track>,
    errors: mpsc::Sender<ScanError>,
    token: CancellationToken,
}


impl Worker {
    async fn run( self ) {
        let mut scanned = 0usize;

        loop {
            let path = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    tracing::debug!( "Scan worker {}: cancelled", self.id );
                    return;
                }
                path = async { self.files.lock().await.recv().await } => match path {
                    Some( path ) => path,
                    None => break,
                },
            };

            let extractor = Arc::clone( &self.extractor );
            let read_path = path.clone();
            let result = tokio::task::spawn_blocking( move || extractor.read( &read_path ) ).await;

            match result {
                Ok( Ok( track ) ) => {
                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => return,
                        sent = self.tracks.send( track ) => {
                            if sent.is_err() {
                                tracing::debug!( "Scan worker {}: track receiver dropped", self.id );
                                return;
                            }
                        }
                    }
                    scanned += 1;
                }
                Ok( Err( e ) ) => {
                    tracing::warn!( "Failed to read {:?}: {}", path, e );
                    report( &self.errors, ScanError::new( path, e ) );
                }
                Err( e ) => {
                    tracing::error!( "Metadata task for {:?} failed: {}", path, e );
                    report( &self.errors, ScanError::new( path, e ) );
                }
            }
        }

        tracing::debug!( "Scan worker {}: done, {} tracks", self.id, scanned );
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    use crate::metadata::MetadataError;


    /// Refuses to read any file named `locked.*`.
    struct LockedFiles;


    impl MetadataExtractor for LockedFiles {
        fn read( &self, path: &Path ) -> Result<Track, MetadataError> {
            let locked = path.file_stem().map( |s| s == "locked" ).unwrap_or( false );
            if locked {
                return Err( MetadataError::Io( io::Error::new( io::ErrorKind::PermissionDenied, "permission denied" ) ) );
            }
            Ok( Track::from_path( path ) )
        }


        fn read_cover_art( &self, _path: &Path ) -> Result<Option<Vec<u8>>, MetadataError> {
            Ok( None )
        }
    }


    /// Fails every file.
    struct Unreadable;


    impl MetadataExtractor for Unreadable {
        fn read( &self, _path: &Path ) -> Result<Track, MetadataError> {
            Err( MetadataError::Probe( "unreadable".into() ) )
        }


        fn read_cover_art( &self, _path: &Path ) -> Result<Option<Vec<u8>>, MetadataError> {
            Ok( None )
        }
    }


    fn touch( dir: &Path, name: &str ) -> PathBuf {
        let path = dir.join( name );
        if let Some( parent ) = path.parent() {
            fs::create_dir_all( parent ).unwrap();
        }
        fs::write( &path, b"not audio" ).unwrap();
        path
    }


    async fn collect(
        mut tracks: mpsc::Receiver<Track>,
        mut errors: mpsc::Receiver<ScanError>,
    ) -> ( Vec<Track>, Vec<ScanError> ) {
        tokio::time::timeout( Duration::from_secs( 5 ), async {
            let mut found = Vec::new();
            while let Some( track ) = tracks.recv().await {
                found.push( track );
            }
            let mut failed = Vec::new();
            while let Some( error ) = errors.recv().await {
                failed.push( error );
            }
            ( found, failed )
        })
        .await
        .expect( "scan never finished" )
    }


    #[test]
    fn test_zero_workers_uses_default() {
        assert_eq!( Scanner::new( 0 ).workers(), DEFAULT_WORKERS );
        assert_eq!( Scanner::new( 2 ).workers(), 2 );
    }


    #[tokio::test]
    async fn test_scan_filters_unsupported_files() {
        let dir = tempfile::tempdir().unwrap();
        touch( dir.path(), "a.mp3" );
        touch( dir.path(), "nested/b.wav" );
        touch( dir.path(), "nested/deeper/c.FLAC" );
        touch( dir.path(), "notes.txt" );
        touch( dir.path(), "cover.jpg" );

        let scanner = Scanner::new( 2 );
        let ( tracks, errors ) = scanner.scan( CancellationToken::new(), vec![ dir.path().to_path_buf() ] );
        let ( tracks, errors ) = collect( tracks, errors ).await;

        let mut titles: Vec<_> = tracks.iter().map( |t| t.title.clone() ).collect();
        titles.sort();
        assert_eq!( titles, vec![ "a", "b", "c" ] );
        assert!( errors.is_empty(), "{:?}", errors );
    }


    #[tokio::test]
    async fn test_permission_error_is_reported_per_file() {
        let dir = tempfile::tempdir().unwrap();
        touch( dir.path(), "a.mp3" );
        touch( dir.path(), "b.mp3" );
        let locked = touch( dir.path(), "locked.mp3" );

        let scanner = Scanner::with_extractor( 4, Arc::new( LockedFiles ) );
        let ( tracks, errors ) = scanner.scan( CancellationToken::new(), vec![ dir.path().to_path_buf() ] );
        let ( tracks, errors ) = collect( tracks, errors ).await;

        assert_eq!( tracks.len(), 2 );
        assert_eq!( errors.len(), 1 );
        assert_eq!( errors[ 0 ].path, locked );
        assert!( errors[ 0 ].to_string().contains( "permission denied" ) );
    }


    #[tokio::test]
    async fn test_missing_root_is_a_scan_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join( "nowhere" );

        let ( tracks, errors ) = Scanner::default().scan( CancellationToken::new(), vec![ missing.clone() ] );
        let ( tracks, errors ) = collect( tracks, errors ).await;

        assert!( tracks.is_empty() );
        assert_eq!( errors.len(), 1 );
        assert_eq!( errors[ 0 ].path, missing );
    }


    #[tokio::test]
    async fn test_error_channel_drops_overflow() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..30 {
            touch( dir.path(), &format!( "{:02}.mp3", i ) );
        }

        let scanner = Scanner::with_extractor( 4, Arc::new( Unreadable ) );
        let ( tracks, errors ) = scanner.scan( CancellationToken::new(), vec![ dir.path().to_path_buf() ] );
        let ( tracks, errors ) = collect( tracks, errors ).await;

        assert!( tracks.is_empty() );
        assert_eq!( errors.len(), ERROR_CAPACITY );
    }


    #[tokio::test]
    async fn test_cancelled_scan_closes_channels() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..50 {
            touch( dir.path(), &format!( "{:02}.wav", i ) );
        }

        let token = CancellationToken::new();
        token.cancel();

        let ( tracks, errors ) = Scanner::default().scan( token, vec![ dir.path().to_path_buf() ] );
        let ( tracks, _ ) = collect( tracks, errors ).await;
        assert!( tracks.is_empty() );
    }


    #[tokio::test]
    async fn test_cancelling_a_stalled_scan_closes_channels() {
        let dir = tempfile::tempdir().unwrap();
        let total = FILE_CAPACITY + TRACK_CAPACITY + 50;
        for i in 0..total {
            touch( dir.path(), &format!( "{:03}.mp3", i ) );
        }

        let token = CancellationToken::new();
        let scanner = Scanner::with_extractor( 4, Arc::new( LockedFiles ) );
        let ( tracks, errors ) = scanner.scan( token.clone(), vec![ dir.path().to_path_buf() ] );

        // Nobody drains the tracks, so workers block on sending and discovery on queueing files
        tokio::time::sleep( Duration::from_millis( 200 ) ).await;
        token.cancel();

        let ( tracks, errors ) = collect( tracks, errors ).await;
        assert!( !tracks.is_empty() );
        assert!( tracks.len() <= TRACK_CAPACITY );
        assert!( errors.is_empty() );
    }


    #[test]
    fn test_scan_file_rejects_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let text = touch( dir.path(), "readme.txt" );
        let song = touch( dir.path(), "song.mp3" );

        let scanner = Scanner::default();
        assert!( matches!(
            scanner.scan_file( &text ),
            Err( PlayerError::InvalidFormat( ref ext ) ) if ext == ".txt"
        ));

        let track = scanner.scan_file( &song ).unwrap();
        assert_eq!( track.title, "song" );
        assert!( matches!(
            scanner.scan_file( &dir.path().join( "gone.mp3" ) ),
            Err( PlayerError::Metadata( MetadataError::Io( _ ) ) )
        ));
    }


    #[test]
    fn test_supported_formats() {
        assert_eq!( Scanner::default().supported_formats(), vec![ ".mp3", ".wav", ".flac" ] );
    }
}
