//! Audio decoding via Symphonia
//!
//! Turns an MP3, WAV or FLAC file into interleaved f32 samples. The format is
//! picked from the file extension; anything else is rejected up front.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{ Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_NULL };
use symphonia::core::formats::{ FormatOptions, FormatReader, SeekMode, SeekTo };
use symphonia::core::io::{ MediaSourceStream, MediaSourceStreamOptions };
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use thiserror::Error;


/// Extensions the decoder accepts, lowercase and without the dot.
pub const SUPPORTED_FORMATS: &[&str] = &[ "mp3", "wav", "flac" ];


/// Errors that can occur during decoding.
#[derive( Debug, Error )]
pub enum DecoderError {
    #[error( "unsupported audio format: {0}" )]
    InvalidFormat( String ),

    #[error( "Failed to read stream: {0}" )]
    Io( #[from] std::io::Error ),

    #[error( "Unrecognised stream contents" )]
    UnsupportedStream,

    #[error( "No audio tracks found" )]
    NoAudioTrack,

    #[error( "Decoder creation failed: {0}" )]
    DecoderCreation( String ),

    #[error( "Decode error: {0}" )]
    Decode( String ),

    #[error( "Seek error: {0}" )]
    Seek( String ),
}


/// Stream format reported by the decoder.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub struct Format {
    pub sample_rate: u32,
    pub channels: usize,
}


/// Returns the supported extensions, with their leading dot.
pub fn supported_formats() -> Vec<String> {
    SUPPORTED_FORMATS.iter().map( |ext| format!( ".{}", ext ) ).collect()
}


/// Returns the lowercase extension of a path, if it has one.
pub(crate) fn extension_of( path: &Path ) -> Option<String> {
    path.extension()
        .and_then( |e| e.to_str() )
        .map( |e| e.to_lowercase() )
}


/// Checks if a path has a supported extension (case-insensitive).
pub fn is_supported( path: &Path ) -> bool {
    extension_of( path )
        .map( |ext| SUPPORTED_FORMATS.contains( &ext.as_str() ) )
        .unwrap_or( false )
}


/// Decodes an opened file, dispatching on the extension of `path`.
///
/// @param file - The opened audio file; ownership moves into the decoder
/// @param path - Path the file was opened from, used for format dispatch
///
/// @returns The seekable decoder and its stream format
pub fn decode( file: File, path: &Path ) -> Result<( Decoder, Format ), DecoderError> {
    let ext = extension_of( path ).unwrap_or_default();
    if !SUPPORTED_FORMATS.contains( &ext.as_str() ) {
        return Err( DecoderError::InvalidFormat( format!( ".{}", ext ) ) );
    }

    let decoder = Decoder::from_file( file, &ext )?;
    let format = decoder.format();
    Ok(( decoder, format ))
}


/// Audio decoder wrapper around Symphonia.
pub struct Decoder {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn SymphoniaDecoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
    sample_buf: Option<SampleBuffer<f32>>,
}


impl Decoder {
    fn from_file( file: File, ext: &str ) -> Result<Self, DecoderError> {
        let mss = MediaSourceStream::new( Box::new( file ), MediaSourceStreamOptions::default() );

        let mut hint = Hint::new();
        hint.with_extension( ext );

        let probed = symphonia::default::get_probe()
            .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
            .map_err( |_| DecoderError::UnsupportedStream )?;

        let format_reader = probed.format;

        // Find the first audio track
        let track = format_reader
            .tracks()
            .iter()
            .find( |t| t.codec_params.codec != CODEC_TYPE_NULL )
            .ok_or( DecoderError::NoAudioTrack )?;

        let track_id = track.id;
        let codec_params = &track.codec_params;

        let sample_rate = codec_params.sample_rate.unwrap_or( 44100 );
        let channels = codec_params.channels.map( |c| c.count() ).unwrap_or( 2 );
        let duration = codec_params.n_frames.map( |frames| {
            Duration::from_secs_f64( frames as f64 / sample_rate as f64 )
        });

        tracing::debug!(
            "Opened {} stream: {} Hz, {} channels, duration: {:?}",
            ext,
            sample_rate,
            channels,
            duration
        );

        let decoder = symphonia::default::get_codecs()
            .make( codec_params, &DecoderOptions::default() )
            .map_err( |e| DecoderError::DecoderCreation( e.to_string() ) )?;

        Ok( Self {
            format_reader,
            decoder,
            track_id,
            sample_rate,
            channels,
            sample_buf: None,
        })
    }


    /// Returns the stream format.
    pub fn format( &self ) -> Format {
        Format {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }


    /// Decodes the next packet and returns interleaved f32 samples.
    ///
    /// Returns None when EOF is reached.
    pub fn decode_next( &mut self ) -> Result<Option<Vec<f32>>, DecoderError> {
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok( packet ) => packet,
                Err( symphonia::core::errors::Error::IoError( ref e ) )
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok( None );
                }
                Err( e ) => {
                    return Err( DecoderError::Decode( e.to_string() ) );
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode( &packet ) {
                Ok( decoded ) => decoded,
                Err( symphonia::core::errors::Error::DecodeError( e ) ) => {
                    // Corrupt packets are skipped, the stream carries on
                    tracing::debug!( "Skipping undecodable packet: {}", e );
                    continue;
                }
                Err( e ) => {
                    return Err( DecoderError::Decode( e.to_string() ) );
                }
            };

            let spec = *decoded.spec();
            let num_frames = decoded.capacity();

            let needs_alloc = self.sample_buf
                .as_ref()
                .map( |buf| buf.capacity() < num_frames )
                .unwrap_or( true );
            if needs_alloc {
                self.sample_buf = Some( SampleBuffer::new( num_frames as u64, spec ) );
            }

            if let Some( sample_buf ) = self.sample_buf.as_mut() {
                sample_buf.copy_interleaved_ref( decoded );
                return Ok( Some( sample_buf.samples().to_vec() ) );
            }
        }
    }


    /// Seeks to a position from the start of the stream.
    pub fn seek( &mut self, position: Duration ) -> Result<(), DecoderError> {
        let seek_to = SeekTo::Time {
            time: Time::from( position.as_secs_f64() ),
            track_id: Some( self.track_id ),
        };

        self.format_reader
            .seek( SeekMode::Accurate, seek_to )
            .map_err( |e| DecoderError::Seek( e.to_string() ) )?;

        // Reset decoder state after seek
        self.decoder.reset();

        Ok(())
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::io::Write;


    #[test]
    fn test_is_supported() {
        let cases = [
            ( "/music/song.mp3", true ),
            ( "/music/song.MP3", true ),
            ( "/music/song.wav", true ),
            ( "/music/song.flac", true ),
            ( "/music/song.ogg", false ),
            ( "/music/song.aac", false ),
            ( "/music/song.txt", false ),
            ( "/music/song", false ),
        ];

        for ( path, expected ) in cases {
            assert_eq!( is_supported( Path::new( path ) ), expected, "{}", path );
        }
    }


    #[test]
    fn test_supported_formats() {
        assert_eq!( supported_formats(), vec![ ".mp3", ".wav", ".flac" ] );
    }


    #[test]
    fn test_decode_rejects_unknown_extension() {
        let mut file = tempfile::Builder::new().suffix( ".ogg" ).tempfile().unwrap();
        file.write_all( b"OggS" ).unwrap();
        let path = file.path().to_path_buf();

        let result = decode( file.reopen().unwrap(), &path );
        assert!( matches!( result, Err( DecoderError::InvalidFormat( ref ext ) ) if ext == ".ogg" ) );
    }


    #[test]
    fn test_decode_rejects_garbage_contents() {
        let mut file = tempfile::Builder::new().suffix( ".wav" ).tempfile().unwrap();
        file.write_all( b"definitely not a riff header" ).unwrap();
        let path = file.path().to_path_buf();

        let result = decode( file.reopen().unwrap(), &path );
        assert!( matches!( result, Err( DecoderError::UnsupportedStream ) ) );
    }
}
