//! Error taxonomy shared across the player.
//!
//! Each module keeps its own leaf error type; `PlayerError` is what the
//! public operations return.

use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

use crate::backend::SessionError;
use crate::metadata::MetadataError;
use crate::playlist::PlaylistError;
use crate::track::TrackId;


/// Errors returned by player operations.
#[derive( Debug, Error )]
pub enum PlayerError {
    #[error( "track not found" )]
    TrackNotFound,

    #[error( "playlist not found" )]
    PlaylistNotFound,

    #[error( "unsupported audio format: {0}" )]
    InvalidFormat( String ),

    #[error( "volume must be between 0.0 and 1.0, got {0}" )]
    InvalidVolume( f32 ),

    #[error( "{op} failed for track {track_id}: {source}" )]
    PlaybackFailed {
        op: &'static str,
        track_id: TrackId,
        #[source]
        source: SessionError,
    },

    #[error( transparent )]
    Scan( #[from] ScanError ),

    #[error( "index {index} out of bounds for queue of length {len}" )]
    IndexOutOfBounds { index: usize, len: usize },

    #[error( "playback queue is empty" )]
    EmptyQueue,

    #[error( "playback engine is not running" )]
    EngineStopped,

    #[error( transparent )]
    Metadata( #[from] MetadataError ),

    #[error( transparent )]
    Playlist( #[from] PlaylistError ),
}


impl PlayerError {
    /// Wraps a session failure with the operation and track it happened on.
    pub fn playback( op: &'static str, track_id: &TrackId, source: SessionError ) -> Self {
        PlayerError::PlaybackFailed {
            op,
            track_id: track_id.clone(),
            source,
        }
    }
}


/// A per-file failure during a library scan.
///
/// Scan errors are collected alongside results; they never abort a scan.
#[derive( Debug, Error )]
#[error( "scan error at {path}: {source}", path = .path.display() )]
pub struct ScanError {
    pub path: PathBuf,
    #[source]
    pub source: Box<dyn StdError + Send + Sync>,
}


impl ScanError {
    pub fn new( path: impl Into<PathBuf>, source: impl Into<Box<dyn StdError + Send + Sync>> ) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::io;
    use std::path::Path;


    #[test]
    fn test_playback_failed_message() {
        let id = TrackId::from_path( Path::new( "/music/a.mp3" ) );
        let err = PlayerError::playback(
            "open",
            &id,
            SessionError::Open( io::Error::new( io::ErrorKind::NotFound, "gone" ) ),
        );
        let msg = err.to_string();
        assert!( msg.starts_with( "open failed for track track-" ), "{}", msg );
        assert!( msg.contains( "gone" ) );
    }


    #[test]
    fn test_scan_error_keeps_path_and_cause() {
        let err = ScanError::new(
            "/music/locked.mp3",
            io::Error::new( io::ErrorKind::PermissionDenied, "denied" ),
        );
        assert_eq!( err.path, PathBuf::from( "/music/locked.mp3" ) );
        assert!( err.to_string().contains( "/music/locked.mp3" ) );
        assert!( StdError::source( &err ).is_some() );
    }
}
