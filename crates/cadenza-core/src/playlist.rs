//! Named playlists
//!
//! In-memory playlist management plus M3U import and export.

use std::collections::HashMap;
use std::fs::File;
use std::io::{ self, BufRead, BufReader, BufWriter, Write };
use std::path::{ Path, PathBuf };
use std::sync::{ Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard };
use std::time::SystemTime;

use thiserror::Error;

use crate::decoder::extension_of;
use crate::error::PlayerError;
use crate::track::{ Track, TrackId };


/// Errors that can occur with playlist files.
#[derive( Debug, Error )]
pub enum PlaylistError {
    #[error( "Playlist IO error: {0}" )]
    Io( #[from] io::Error ),

    #[error( "Not an M3U playlist: {0}" )]
    InvalidFormat( PathBuf ),
}


/// A named, ordered list of tracks.
#[derive( Debug, Clone )]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tracks: Vec<Arc<Track>>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}


impl Playlist {
    fn touch( &mut self ) {
        self.updated_at = SystemTime::now();
    }
}


#[derive( Debug, Default )]
struct Playlists {
    by_id: HashMap<String, Playlist>,
    /// Ids in creation order.
    order: Vec<String>,
    next_id: u64,
}


/// Thread-safe playlist store.
#[derive( Debug, Default )]
pub struct PlaylistManager {
    inner: RwLock<Playlists>,
}


impl PlaylistManager {
    pub fn new() -> Self {
        Self::default()
    }


    fn read( &self ) -> RwLockReadGuard<'_, Playlists> {
        self.inner.read().unwrap_or_else( PoisonError::into_inner )
    }


    fn write( &self ) -> RwLockWriteGuard<'_, Playlists> {
        self.inner.write().unwrap_or_else( PoisonError::into_inner )
    }


    /// Runs `f` on the playlist with `id`, bumping its update time.
    fn modify<T>(
        &self,
        id: &str,
        f: impl FnOnce( &mut Playlist ) -> Result<T, PlayerError>,
    ) -> Result<T, PlayerError> {
        let mut inner = self.write();
        let playlist = inner.by_id.get_mut( id ).ok_or( PlayerError::PlaylistNotFound )?;
        let result = f( playlist )?;
        playlist.touch();
        Ok( result )
    }


    /// Creates an empty playlist and returns a copy of it.
    pub fn create( &self, name: &str, description: &str ) -> Playlist {
        let mut inner = self.write();
        inner.next_id += 1;

        let now = SystemTime::now();
        let playlist = Playlist {
            id: format!( "playlist-{}", inner.next_id ),
            name: name.to_string(),
            description: description.to_string(),
            tracks: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        tracing::debug!( "Created playlist {} ({})", playlist.id, playlist.name );
        inner.order.push( playlist.id.clone() );
        inner.by_id.insert( playlist.id.clone(), playlist.clone() );
        playlist
    }


    pub fn get( &self, id: &str ) -> Result<Playlist, PlayerError> {
        self.read().by_id.get( id ).cloned().ok_or( PlayerError::PlaylistNotFound )
    }


    /// Returns every playlist in creation order.
    pub fn all( &self ) -> Vec<Playlist> {
        let inner = self.read();
        inner.order.iter().filter_map( |id| inner.by_id.get( id ).cloned() ).collect()
    }


    pub fn update( &self, id: &str, name: &str, description: &str ) -> Result<(), PlayerError> {
        self.modify( id, |p| {
            p.name = name.to_string();
            p.description = description.to_string();
            Ok(())
        })
    }


    pub fn delete( &self, id: &str ) -> Result<Playlist, PlayerError> {
        let mut inner = self.write();
        let playlist = inner.by_id.remove( id ).ok_or( PlayerError::PlaylistNotFound )?;
        inner.order.retain( |i| i != id );
        Ok( playlist )
    }


    pub fn add_track( &self, id: &str, track: Arc<Track> ) -> Result<(), PlayerError> {
        self.modify( id, |p| {
            p.tracks.push( track );
            Ok(())
        })
    }


    /// Removes the first occurrence of a track from a playlist.
    pub fn remove_track( &self, id: &str, track_id: &TrackId ) -> Result<(), PlayerError> {
        self.modify( id, |p| {
            let pos = p.tracks
                .iter()
                .position( |t| &t.id == track_id )
                .ok_or( PlayerError::TrackNotFound )?;
            p.tracks.remove( pos );
            Ok(())
        })
    }


    pub fn len( &self ) -> usize {
        self.read().by_id.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.read().by_id.is_empty()
    }
}


/// Returns true for `.m3u` and `.m3u8` paths.
pub fn is_m3u( path: &Path ) -> bool {
    matches!( extension_of( path ).as_deref(), Some( "m3u" ) | Some( "m3u8" ) )
}


/// Reads the entries of an M3U playlist.
///
/// Blank lines and `#` directives are skipped. Relative entries are resolved
/// against the playlist's directory.
pub fn read_m3u( path: &Path ) -> Result<Vec<PathBuf>, PlaylistError> {
    if !is_m3u( path ) {
        return Err( PlaylistError::InvalidFormat( path.to_path_buf() ) );
    }

    let reader = BufReader::new( File::open( path )? );
    let base = path.parent().unwrap_or( Path::new( "" ) );
    let mut entries = Vec::new();

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with( '#' ) {
            continue;
        }

        let entry = PathBuf::from( trimmed );
        entries.push( if entry.is_relative() { base.join( entry ) } else { entry } );
    }

    tracing::debug!( "Read {} entries from {:?}", entries.len(), path );
    Ok( entries )
}


/// Writes tracks to an M3U playlist, one file path per line.
pub fn write_m3u( path: &Path, tracks: &[Arc<Track>] ) -> Result<(), PlaylistError> {
    let mut file = BufWriter::new( File::create( path )? );

    writeln!( file, "#EXTM3U" )?;
    for track in tracks {
        writeln!( file, "#EXTINF:{},{}", track.duration.as_secs(), track.display_name() )?;
        writeln!( file, "{}", track.file_path.display() )?;
    }

    file.flush()?;
    Ok(())
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::fs;


    fn track( path: &str ) -> Arc<Track> {
        Arc::new( Track::from_path( path ) )
    }


    #[test]
    fn test_create_get_update_delete() {
        let manager = PlaylistManager::new();
        let first = manager.create( "Morning", "wake up" );
        let second = manager.create( "Evening", "" );
        assert_ne!( first.id, second.id );

        manager.update( &first.id, "Early", "coffee" ).unwrap();
        let updated = manager.get( &first.id ).unwrap();
        assert_eq!( updated.name, "Early" );
        assert_eq!( updated.description, "coffee" );
        assert!( updated.updated_at >= updated.created_at );

        let names: Vec<_> = manager.all().into_iter().map( |p| p.name ).collect();
        assert_eq!( names, vec![ "Early", "Evening" ] );

        manager.delete( &first.id ).unwrap();
        assert_eq!( manager.len(), 1 );
        assert!( matches!( manager.get( &first.id ), Err( PlayerError::PlaylistNotFound ) ) );
        assert!( matches!( manager.delete( &first.id ), Err( PlayerError::PlaylistNotFound ) ) );
    }


    #[test]
    fn test_add_and_remove_tracks() {
        let manager = PlaylistManager::new();
        let list = manager.create( "Mix", "" );
        let a = track( "/m/a.mp3" );
        let b = track( "/m/b.mp3" );

        manager.add_track( &list.id, Arc::clone( &a ) ).unwrap();
        manager.add_track( &list.id, Arc::clone( &b ) ).unwrap();
        manager.remove_track( &list.id, &a.id ).unwrap();

        let tracks = manager.get( &list.id ).unwrap().tracks;
        assert_eq!( tracks.len(), 1 );
        assert!( Arc::ptr_eq( &tracks[ 0 ], &b ) );

        assert!( matches!( manager.remove_track( &list.id, &a.id ), Err( PlayerError::TrackNotFound ) ) );
        assert!( matches!( manager.add_track( "playlist-99", a ), Err( PlayerError::PlaylistNotFound ) ) );
    }


    #[test]
    fn test_m3u_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "mix.m3u" );
        let tracks = vec![ track( "/m/one.mp3" ), track( "/m/two.flac" ) ];

        write_m3u( &path, &tracks ).unwrap();
        let contents = fs::read_to_string( &path ).unwrap();
        assert!( contents.starts_with( "#EXTM3U\n" ) );

        let entries = read_m3u( &path ).unwrap();
        assert_eq!( entries, vec![ PathBuf::from( "/m/one.mp3" ), PathBuf::from( "/m/two.flac" ) ] );
    }


    #[test]
    fn test_read_m3u_skips_comments_and_resolves_relative() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "list.m3u8" );
        fs::write( &path, "#EXTM3U\n\n  # note\nsub/song.wav\n/abs/other.mp3\n" ).unwrap();

        let entries = read_m3u( &path ).unwrap();
        assert_eq!( entries, vec![ dir.path().join( "sub/song.wav" ), PathBuf::from( "/abs/other.mp3" ) ] );
    }


    #[test]
    fn test_read_m3u_rejects_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "list.txt" );
        fs::write( &path, "/abs/other.mp3\n" ).unwrap();

        assert!( matches!( read_m3u( &path ), Err( PlaylistError::InvalidFormat( _ ) ) ) );
        assert!( matches!( read_m3u( &dir.path().join( "gone.m3u" ) ), Err( PlaylistError::Io( _ ) ) ) );
    }
}
