//! Track records and playback state types
//!
//! Tracks are shared read-only records. Everything that holds on to a track
//! (queue, library, playlists, the engine) does so through `Arc<Track>`.

use std::fmt;
use std::path::{ Path, PathBuf };
use std::time::{ Duration, SystemTime };

use xxhash_rust::xxh64::xxh64;


/// Stable identifier of a track, derived from its file path.
#[derive( Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord )]
pub struct TrackId( String );


impl TrackId {
    /// Derives the id for a file path.
    ///
    /// The id is a pure function of the path bytes, so scanning the same file
    /// twice always yields the same id.
    pub fn from_path( path: &Path ) -> Self {
        let hash = xxh64( path.as_os_str().as_encoded_bytes(), 0 );
        Self( format!( "track-{:016x}", hash ) )
    }


    pub fn as_str( &self ) -> &str {
        &self.0
    }
}


impl fmt::Display for TrackId {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        f.write_str( &self.0 )
    }
}


/// A single audio file known to the player.
#[derive( Debug, Clone, PartialEq )]
pub struct Track {
    pub id: TrackId,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub genre: String,
    pub year: Option<u32>,
    pub track_number: Option<u32>,
    pub duration: Duration,
    pub file_path: PathBuf,
    pub created_at: SystemTime,
}


impl Track {
    /// Builds a bare track for a path, titled after the file name.
    ///
    /// Used when a file's tags cannot be read at all.
    pub fn from_path( path: impl Into<PathBuf> ) -> Self {
        let file_path = path.into();
        Self {
            id: TrackId::from_path( &file_path ),
            title: title_from_path( &file_path ),
            artist: String::new(),
            album: String::new(),
            genre: String::new(),
            year: None,
            track_number: None,
            duration: Duration::ZERO,
            file_path,
            created_at: SystemTime::now(),
        }
    }


    /// Returns "Artist - Title", or just the title when the artist is unknown.
    pub fn display_name( &self ) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!( "{} - {}", self.artist, self.title )
        }
    }
}


/// Title derived from a file name (stem without extension).
pub(crate) fn title_from_path( path: &Path ) -> String {
    path.file_stem()
        .or_else( || path.file_name() )
        .map( |s| s.to_string_lossy().into_owned() )
        .unwrap_or_else( || path.display().to_string() )
}


/// Repeat mode shared by the queue and the published playback state.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub enum RepeatMode {
    #[default]
    None,
    One,
    All,
}


impl RepeatMode {
    /// Cycles None → All → One → None.
    pub fn cycle( self ) -> Self {
        match self {
            RepeatMode::None => RepeatMode::All,
            RepeatMode::All => RepeatMode::One,
            RepeatMode::One => RepeatMode::None,
        }
    }
}


/// Transport status of the engine.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub enum PlaybackStatus {
    #[default]
    Stopped,
    Playing,
    Paused,
}


/// Default engine volume on the `[0, 1]` scale.
pub const DEFAULT_VOLUME: f32 = 0.5;


/// Snapshot of the engine's observable state.
///
/// Snapshots own their data: `current_track` is a copy, so changing a
/// snapshot never reaches back into the engine.
#[derive( Debug, Clone, PartialEq )]
pub struct PlaybackState {
    pub current_track: Option<Track>,
    pub status: PlaybackStatus,
    pub position: Duration,
    pub volume: f32,
    pub repeat: RepeatMode,
    pub shuffle: bool,
}


impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            current_track: None,
            status: PlaybackStatus::Stopped,
            position: Duration::ZERO,
            volume: DEFAULT_VOLUME,
            repeat: RepeatMode::None,
            shuffle: false,
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_track_id_is_stable() {
        let a = TrackId::from_path( Path::new( "/music/a.mp3" ) );
        let b = TrackId::from_path( Path::new( "/music/a.mp3" ) );
        let c = TrackId::from_path( Path::new( "/music/b.mp3" ) );

        assert_eq!( a, b );
        assert_ne!( a, c );
        assert!( a.as_str().starts_with( "track-" ) );
        assert_eq!( a.as_str().len(), "track-".len() + 16 );
    }


    #[test]
    fn test_from_path_uses_file_stem() {
        let track = Track::from_path( "/music/Some Song.flac" );
        assert_eq!( track.title, "Some Song" );
        assert_eq!( track.id, TrackId::from_path( Path::new( "/music/Some Song.flac" ) ) );
        assert!( track.artist.is_empty() );
    }


    #[test]
    fn test_repeat_cycle() {
        assert_eq!( RepeatMode::None.cycle(), RepeatMode::All );
        assert_eq!( RepeatMode::All.cycle(), RepeatMode::One );
        assert_eq!( RepeatMode::One.cycle(), RepeatMode::None );
    }
}
