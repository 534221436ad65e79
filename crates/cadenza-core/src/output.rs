//! Audio output via cpal
//!
//! Decoded samples go into a [`SampleBuffer`] which the device callback
//! drains. The buffer owns pause, gain and channel conversion.

use std::collections::VecDeque;
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use std::sync::atomic::{ AtomicBool, AtomicU32, Ordering };

use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use thiserror::Error;


/// Errors that can occur with audio output.
#[derive( Debug, Error )]
pub enum OutputError {
    #[error( "No output device available" )]
    NoDevice,

    #[error( "Failed to get default stream config: {0}" )]
    StreamConfig( String ),

    #[error( "Failed to build output stream: {0}" )]
    BuildStream( String ),

    #[error( "Failed to play stream: {0}" )]
    PlayStream( String ),

    #[error( "Failed to create resampler: {0}" )]
    Resampler( String ),
}


/// Base of the exponential gain curve: gain g plays at amplitude 2^g.
const GAIN_BASE: f32 = 2.0;

/// Gains at or below this are silent.
pub const MIN_GAIN: f32 = -1.0;


/// Maps a volume on the `[0, 1]` scale onto the `[-1, 1]` gain scale.
///
/// This is a straight linear mapping, not a perceptual curve.
pub fn gain_for_volume( volume: f32 ) -> f32 {
    volume * 2.0 - 1.0
}


/// Converts a gain into the multiplier applied to each sample.
pub fn amplitude_for_gain( gain: f32 ) -> f32 {
    if gain <= MIN_GAIN {
        0.0
    } else {
        GAIN_BASE.powf( gain )
    }
}


/// Shared sample buffer between producer (decoder) and consumer (audio callback).
///
/// Handles channel conversion between source and output.
pub struct SampleBuffer {
    buffer: Mutex<VecDeque<f32>>,
    capacity: usize,
    paused: AtomicBool,
    /// Amplitude multiplier stored as f32 bits
    amplitude: AtomicU32,
    source_channels: u16,
    output_channels: u16,
}


impl SampleBuffer {
    /// Creates a new sample buffer with the given capacity and channel configuration.
    ///
    /// - `capacity`: Maximum number of samples to buffer
    /// - `source_channels`: Number of channels in the decoded stream
    /// - `output_channels`: Number of channels expected by the output device
    pub fn new( capacity: usize, source_channels: u16, output_channels: u16 ) -> Self {
        Self {
            buffer: Mutex::new( VecDeque::with_capacity( capacity ) ),
            capacity,
            paused: AtomicBool::new( false ),
            amplitude: AtomicU32::new( 1.0_f32.to_bits() ),
            source_channels: source_channels.max( 1 ),
            output_channels: output_channels.max( 1 ),
        }
    }


    fn samples( &self ) -> MutexGuard<'_, VecDeque<f32>> {
        self.buffer.lock().unwrap_or_else( PoisonError::into_inner )
    }


    /// Pushes samples to the buffer. Returns number of samples actually pushed.
    pub fn push( &self, samples: &[f32] ) -> usize {
        let mut buf = self.samples();
        let available = self.capacity.saturating_sub( buf.len() );
        let to_push = samples.len().min( available );
        buf.extend( samples[ ..to_push ].iter().copied() );
        to_push
    }


    /// Pops samples into the output slice, converting channels and applying gain.
    ///
    /// Whatever cannot be filled is written as silence. Returns the number of
    /// output samples that carry audio.
    pub fn pop( &self, output: &mut [f32] ) -> usize {
        if self.paused.load( Ordering::Relaxed ) {
            output.fill( 0.0 );
            return 0;
        }

        let amplitude = f32::from_bits( self.amplitude.load( Ordering::Relaxed ) );
        let src_ch = self.source_channels as usize;
        let out_ch = self.output_channels as usize;
        let mut buf = self.samples();

        let output_frames = output.len() / out_ch;
        let frames = output_frames.min( buf.len() / src_ch );

        for frame in 0..frames {
            let out = &mut output[ frame * out_ch..( frame + 1 ) * out_ch ];
            if src_ch == out_ch {
                for sample in out.iter_mut() {
                    *sample = buf.pop_front().unwrap_or( 0.0 );
                }
            } else if out_ch == 1 {
                // Mix down to mono
                let sum: f32 = ( 0..src_ch ).map( |_| buf.pop_front().unwrap_or( 0.0 ) ).sum();
                out[ 0 ] = sum / src_ch as f32;
            } else {
                // Map source channels in order, repeating the last one
                let mut last = 0.0;
                for ch in 0..out_ch.max( src_ch ) {
                    if ch < src_ch {
                        last = buf.pop_front().unwrap_or( 0.0 );
                    }
                    if ch < out_ch {
                        out[ ch ] = last;
                    }
                }
            }
        }

        let written = frames * out_ch;
        output[ written.. ].fill( 0.0 );

        if amplitude != 1.0 {
            for sample in output[ ..written ].iter_mut() {
                *sample *= amplitude;
            }
        }

        written
    }


    /// Returns the number of samples currently in the buffer.
    pub fn len( &self ) -> usize {
        self.samples().len()
    }


    /// Returns true if the buffer is empty.
    pub fn is_empty( &self ) -> bool {
        self.samples().is_empty()
    }


    /// Clears the buffer.
    pub fn clear( &self ) {
        self.samples().clear();
    }


    pub fn set_paused( &self, paused: bool ) {
        self.paused.store( paused, Ordering::Relaxed );
    }


    pub fn is_paused( &self ) -> bool {
        self.paused.load( Ordering::Relaxed )
    }


    /// Sets the gain on the `[-1, 1]` scale.
    pub fn set_gain( &self, gain: f32 ) {
        self.amplitude.store( amplitude_for_gain( gain ).to_bits(), Ordering::Relaxed );
    }
}


/// Audio output handler.
///
/// Not Send: `cpal::Stream` must stay on the thread that built it.
pub struct AudioOutput {
    stream: cpal::Stream,
    sample_rate: u32,
}


impl AudioOutput {
    /// Creates a new audio output for the given source format.
    ///
    /// Returns both the AudioOutput and the SampleBuffer the caller pushes
    /// decoded samples into.
    pub fn new(
        source_sample_rate: u32,
        source_channels: u16,
    ) -> Result<( Self, Arc<SampleBuffer> ), OutputError> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or( OutputError::NoDevice )?;

        tracing::info!( "Using output device: {:?}", device.name() );

        let supported_configs: Vec<_> = device
            .supported_output_configs()
            .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?
            .collect();

        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate().0 <= source_sample_rate
                && c.max_sample_rate().0 >= source_sample_rate
        };

        // Priority: exact match, then same rate with any channel count, then device default
        let config = if let Some( c ) = supported_configs.iter()
            .find( |c| c.channels() == source_channels && supports_rate( *c ) )
        {
            c.clone().with_sample_rate( cpal::SampleRate( source_sample_rate ) ).config()
        } else if let Some( c ) = supported_configs.iter().find( |c| supports_rate( *c ) ) {
            tracing::info!(
                "Channel conversion: stream has {} channels, device using {}",
                source_channels,
                c.channels()
            );
            c.clone().with_sample_rate( cpal::SampleRate( source_sample_rate ) ).config()
        } else {
            let default_config = device
                .default_output_config()
                .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?;
            tracing::info!(
                "Device does not support {} Hz, resampling to {} Hz",
                source_sample_rate,
                default_config.sample_rate().0
            );
            default_config.config()
        };

        tracing::debug!(
            "Audio output config: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        // ~500ms of audio at the device rate
        let buffer_capacity = ( config.sample_rate.0 as usize ) * ( source_channels as usize ) / 2;
        let sample_buffer = Arc::new( SampleBuffer::new(
            buffer_capacity,
            source_channels,
            config.channels,
        ));
        let callback_buffer = Arc::clone( &sample_buffer );

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    callback_buffer.pop( data );
                },
                |err| {
                    tracing::error!( "Audio output error: {}", err );
                },
                None,
            )
            .map_err( |e| OutputError::BuildStream( e.to_string() ) )?;

        Ok((
            Self {
                stream,
                sample_rate: config.sample_rate.0,
            },
            sample_buffer,
        ))
    }


    /// Starts audio output.
    pub fn play( &self ) -> Result<(), OutputError> {
        self.stream
            .play()
            .map_err( |e| OutputError::PlayStream( e.to_string() ) )
    }


    /// Gets the actual sample rate.
    pub fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_gain_mapping() {
        assert_eq!( gain_for_volume( 0.0 ), -1.0 );
        assert_eq!( gain_for_volume( 0.5 ), 0.0 );
        assert_eq!( gain_for_volume( 1.0 ), 1.0 );

        assert_eq!( amplitude_for_gain( -1.0 ), 0.0 );
        assert_eq!( amplitude_for_gain( 0.0 ), 1.0 );
        assert_eq!( amplitude_for_gain( 1.0 ), 2.0 );
    }


    #[test]
    fn test_push_respects_capacity() {
        let buffer = SampleBuffer::new( 4, 2, 2 );
        assert_eq!( buffer.push( &[ 0.1, 0.2, 0.3 ] ), 3 );
        assert_eq!( buffer.push( &[ 0.4, 0.5, 0.6 ] ), 1 );
        assert_eq!( buffer.len(), 4 );
    }


    #[test]
    fn test_pop_fills_silence_when_paused() {
        let buffer = SampleBuffer::new( 8, 2, 2 );
        buffer.push( &[ 0.5, 0.5 ] );
        buffer.set_paused( true );

        let mut out = [ 1.0; 4 ];
        assert_eq!( buffer.pop( &mut out ), 0 );
        assert_eq!( out, [ 0.0; 4 ] );
        assert_eq!( buffer.len(), 2 );
    }


    #[test]
    fn test_pop_mono_to_stereo_with_gain() {
        let buffer = SampleBuffer::new( 8, 1, 2 );
        buffer.set_gain( 1.0 );
        buffer.push( &[ 0.25, -0.25 ] );

        let mut out = [ 9.0; 6 ];
        assert_eq!( buffer.pop( &mut out ), 4 );
        assert_eq!( out, [ 0.5, 0.5, -0.5, -0.5, 0.0, 0.0 ] );
    }


    #[test]
    fn test_pop_stereo_to_mono() {
        let buffer = SampleBuffer::new( 8, 2, 1 );
        buffer.push( &[ 0.2, 0.4, 1.0, 0.0 ] );

        let mut out = [ 0.0; 2 ];
        assert_eq!( buffer.pop( &mut out ), 2 );
        assert!( ( out[ 0 ] - 0.3 ).abs() < 1e-6 );
        assert!( ( out[ 1 ] - 0.5 ).abs() < 1e-6 );
    }


    #[test]
    fn test_silent_gain_mutes_output() {
        let buffer = SampleBuffer::new( 8, 2, 2 );
        buffer.set_gain( gain_for_volume( 0.0 ) );
        buffer.push( &[ 0.7, 0.7 ] );

        let mut out = [ 1.0; 2 ];
        buffer.pop( &mut out );
        assert_eq!( out, [ 0.0, 0.0 ] );
    }
}
