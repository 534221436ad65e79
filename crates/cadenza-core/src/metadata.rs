//! Track metadata extraction
//!
//! Reads tags and embedded pictures through Symphonia's metadata API. Files
//! whose tags cannot be read still produce a track, titled after the file.

use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;

use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{ MediaSourceStream, MediaSourceStreamOptions };
use symphonia::core::meta::{ MetadataOptions, MetadataRevision, StandardTagKey };
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::decoder::extension_of;
use crate::track::Track;


pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";


/// Errors that can occur while reading metadata.
#[derive( Debug, Error )]
pub enum MetadataError {
    #[error( "Failed to open file: {0}" )]
    Io( #[from] io::Error ),

    #[error( "Failed to read metadata: {0}" )]
    Probe( String ),
}


/// Turns audio files into [`Track`] records.
pub trait MetadataExtractor: Send + Sync + 'static {
    /// Reads the tags of `path` into a track.
    ///
    /// Only an unopenable file is an error; unreadable tags fall back to a
    /// track titled after the file name.
    fn read( &self, path: &Path ) -> Result<Track, MetadataError>;

    /// Returns the first embedded picture, if any.
    fn read_cover_art( &self, path: &Path ) -> Result<Option<Vec<u8>>, MetadataError>;
}


/// Tags collected from every metadata revision of a file.
///
/// The first value seen for each key wins.
#[derive( Debug, Default )]
struct Tags {
    found: bool,
    title: Option<String>,
    artist: Option<String>,
    album_artist: Option<String>,
    album: Option<String>,
    genre: Option<String>,
    year: Option<u32>,
    track_number: Option<u32>,
    picture: Option<Vec<u8>>,
}


impl Tags {
    fn absorb( &mut self, revision: &MetadataRevision ) {
        for tag in revision.tags() {
            let Some( key ) = tag.std_key else {
                continue;
            };
            let raw = tag.value.to_string();
            let value = raw.trim_matches( char::from( 0 ) ).trim();
            if value.is_empty() {
                continue;
            }
            self.found = true;

            match key {
                StandardTagKey::TrackTitle => fill( &mut self.title, value.to_string() ),
                StandardTagKey::Artist => fill( &mut self.artist, value.to_string() ),
                StandardTagKey::AlbumArtist => fill( &mut self.album_artist, value.to_string() ),
                StandardTagKey::Album => fill( &mut self.album, value.to_string() ),
                StandardTagKey::Genre => fill( &mut self.genre, value.to_string() ),
                StandardTagKey::TrackNumber if self.track_number.is_none() => {
                    // "3" or "3/12"
                    self.track_number = leading_number( value, '/' );
                }
                StandardTagKey::Date | StandardTagKey::ReleaseDate if self.year.is_none() => {
                    // "2023" or "2023-01-15"
                    self.year = leading_number( value, '-' );
                }
                _ => {}
            }
        }

        if self.picture.is_none() {
            if let Some( visual ) = revision.visuals().first() {
                self.picture = Some( visual.data.to_vec() );
            }
        }
    }
}


fn fill( slot: &mut Option<String>, value: String ) {
    if slot.is_none() {
        *slot = Some( value );
    }
}


fn leading_number( value: &str, separator: char ) -> Option<u32> {
    value.split( separator ).next()?.trim().parse().ok()
}


/// What a successful probe yields.
struct Probed {
    tags: Tags,
    duration: Option<Duration>,
}


/// Probes a file for tags and stream length.
///
/// Returns `Ok(None)` when the contents are not a recognisable stream.
fn probe( path: &Path ) -> Result<Option<Probed>, MetadataError> {
    let file = File::open( path )?;
    let mss = MediaSourceStream::new( Box::new( file ), MediaSourceStreamOptions::default() );

    let mut hint = Hint::new();
    if let Some( ext ) = extension_of( path ) {
        hint.with_extension( &ext );
    }

    let mut probed = match symphonia::default::get_probe()
        .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
    {
        Ok( probed ) => probed,
        Err( e ) => {
            tracing::debug!( "No readable tags in {:?}: {}", path, e );
            return Ok( None );
        }
    };

    let mut tags = Tags::default();

    // Container-level tags (ID3v2 and friends) come first
    if let Some( log ) = probed.metadata.get() {
        if let Some( revision ) = log.current() {
            tags.absorb( revision );
        }
    }
    if let Some( revision ) = probed.format.metadata().current() {
        tags.absorb( revision );
    }

    let duration = probed.format
        .tracks()
        .iter()
        .find( |t| t.codec_params.codec != CODEC_TYPE_NULL )
        .and_then( |t| {
            let frames = t.codec_params.n_frames?;
            let rate = t.codec_params.sample_rate?;
            Some( Duration::from_secs_f64( frames as f64 / rate.max( 1 ) as f64 ) )
        });

    Ok( Some( Probed { tags, duration } ) )
}


/// Metadata extractor backed by Symphonia.
#[derive( Debug, Default, Clone, Copy )]
pub struct TagReader;


impl MetadataExtractor for TagReader {
    fn read( &self, path: &Path ) -> Result<Track, MetadataError> {
        let mut track = Track::from_path( path );

        let Some( probed ) = probe( path )? else {
            return Ok( track );
        };

        track.duration = probed.duration.unwrap_or_default();

        let tags = probed.tags;
        if !tags.found {
            return Ok( track );
        }

        if let Some( title ) = tags.title {
            track.title = title;
        }
        track.artist = tags.artist
            .or( tags.album_artist )
            .unwrap_or_else( || UNKNOWN_ARTIST.to_string() );
        track.album = tags.album.unwrap_or_else( || UNKNOWN_ALBUM.to_string() );
        track.genre = tags.genre.unwrap_or_default();
        track.year = tags.year;
        track.track_number = tags.track_number;

        Ok( track )
    }


    fn read_cover_art( &self, path: &Path ) -> Result<Option<Vec<u8>>, MetadataError> {
        match probe( path )? {
            Some( probed ) => Ok( probed.tags.picture ),
            None => Err( MetadataError::Probe( format!( "unrecognised stream in {}", path.display() ) ) ),
        }
    }
}


#[cfg( test )]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;


    /// Builds a one second, 8 kHz mono 16-bit WAV file with optional
    /// RIFF INFO entries.
    pub(crate) fn wav_bytes( info: &[( &[u8; 4], &str )] ) -> Vec<u8> {
        let mut chunks = Vec::new();

        chunks.extend_from_slice( b"fmt " );
        chunks.extend_from_slice( &16u32.to_le_bytes() );
        chunks.extend_from_slice( &1u16.to_le_bytes() );
        chunks.extend_from_slice( &1u16.to_le_bytes() );
        chunks.extend_from_slice( &8000u32.to_le_bytes() );
        chunks.extend_from_slice( &16000u32.to_le_bytes() );
        chunks.extend_from_slice( &2u16.to_le_bytes() );
        chunks.extend_from_slice( &16u16.to_le_bytes() );

        if !info.is_empty() {
            let mut list = b"INFO".to_vec();
            for ( id, value ) in info {
                let mut data = value.as_bytes().to_vec();
                data.push( 0 );
                list.extend_from_slice( *id );
                list.extend_from_slice( &( data.len() as u32 ).to_le_bytes() );
                list.extend_from_slice( &data );
                if data.len() % 2 == 1 {
                    list.push( 0 );
                }
            }
            chunks.extend_from_slice( b"LIST" );
            chunks.extend_from_slice( &( list.len() as u32 ).to_le_bytes() );
            chunks.extend_from_slice( &list );
        }

        chunks.extend_from_slice( b"data" );
        chunks.extend_from_slice( &16000u32.to_le_bytes() );
        chunks.extend( std::iter::repeat( 0u8 ).take( 16000 ) );

        let mut out = b"RIFF".to_vec();
        out.extend_from_slice( &( chunks.len() as u32 + 4 ).to_le_bytes() );
        out.extend_from_slice( b"WAVE" );
        out.extend_from_slice( &chunks );
        out
    }


    fn write_file( dir: &Path, name: &str, bytes: &[u8] ) -> std::path::PathBuf {
        let path = dir.join( name );
        let mut file = File::create( &path ).unwrap();
        file.write_all( bytes ).unwrap();
        path
    }


    #[test]
    fn test_missing_file_is_an_error() {
        let result = TagReader.read( Path::new( "/nonexistent/cadenza/none.mp3" ) );
        assert!( matches!( result, Err( MetadataError::Io( _ ) ) ) );
    }


    #[test]
    fn test_unreadable_tags_fall_back_to_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file( dir.path(), "Mystery Song.mp3", b"not really an mp3" );

        let track = TagReader.read( &path ).unwrap();
        assert_eq!( track.title, "Mystery Song" );
        assert!( track.artist.is_empty() );
        assert!( track.album.is_empty() );
        assert_eq!( track.file_path, path );
    }


    #[test]
    fn test_untagged_wav_gets_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file( dir.path(), "tone.wav", &wav_bytes( &[] ) );

        let track = TagReader.read( &path ).unwrap();
        assert_eq!( track.title, "tone" );
        assert_eq!( track.duration, Duration::from_secs( 1 ) );
        assert!( track.artist.is_empty() );
    }


    #[test]
    fn test_tagged_wav_fills_unknowns() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = wav_bytes( &[ ( b"INAM", "Blue Hour" ), ( b"IART", "The Owls" ) ] );
        let path = write_file( dir.path(), "track01.wav", &bytes );

        let track = TagReader.read( &path ).unwrap();
        assert_eq!( track.title, "Blue Hour" );
        assert_eq!( track.artist, "The Owls" );
        assert_eq!( track.album, UNKNOWN_ALBUM );
    }


    #[test]
    fn test_cover_art_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file( dir.path(), "tone.wav", &wav_bytes( &[] ) );

        assert_eq!( TagReader.read_cover_art( &path ).unwrap(), None );

        let garbage = write_file( dir.path(), "junk.flac", b"junk" );
        assert!( matches!( TagReader.read_cover_art( &garbage ), Err( MetadataError::Probe( _ ) ) ) );
    }


    #[test]
    fn test_leading_number() {
        assert_eq!( leading_number( "3/12", '/' ), Some( 3 ) );
        assert_eq!( leading_number( "2023-01-15", '-' ), Some( 2023 ) );
        assert_eq!( leading_number( "side A", '/' ), None );
    }
}
