//! Playback sessions
//!
//! A session is one opened track streaming to the output device. The engine
//! talks to sessions only through the [`Backend`] and [`Session`] traits, so
//! the device-backed implementation here can be swapped out in tests.

use std::fs::File;
use std::io;
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use rubato::{ FastFixedOut, PolynomialDegree, Resampler };
use thiserror::Error;
use tokio::sync::mpsc;

use crate::decoder::{ self, Decoder, DecoderError, Format };
use crate::output::{ AudioOutput, OutputError, SampleBuffer };
use crate::track::Track;


/// Errors that can occur while opening or running a session.
#[derive( Debug, Error )]
pub enum SessionError {
    #[error( "Failed to open file: {0}" )]
    Open( #[from] io::Error ),

    #[error( transparent )]
    Decode( #[from] DecoderError ),

    #[error( transparent )]
    Output( #[from] OutputError ),

    #[error( "Stream thread exited before the output was ready" )]
    Startup,
}


impl SessionError {
    /// Name of the operation that failed, as reported in error events.
    pub fn op( &self ) -> &'static str {
        match self {
            SessionError::Open( _ ) => "open",
            SessionError::Decode( _ ) => "decode",
            SessionError::Output( _ ) | SessionError::Startup => "output",
        }
    }
}


/// Position of a session, counted in source frames.
///
/// Cloned handles share the same counter; the streaming side advances it and
/// observers read it.
#[derive( Debug, Clone )]
pub struct SessionClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}


impl SessionClock {
    pub fn new( sample_rate: u32 ) -> Self {
        Self {
            frames: Arc::new( AtomicU64::new( 0 ) ),
            sample_rate: sample_rate.max( 1 ),
        }
    }


    /// Elapsed playback time.
    pub fn position( &self ) -> Duration {
        let frames = self.frames.load( Ordering::Relaxed );
        Duration::from_secs_f64( frames as f64 / self.sample_rate as f64 )
    }


    pub fn advance( &self, frames: u64 ) {
        self.frames.fetch_add( frames, Ordering::Relaxed );
    }


    pub fn set_position( &self, position: Duration ) {
        let frames = ( position.as_secs_f64() * self.sample_rate as f64 ) as u64;
        self.frames.store( frames, Ordering::Relaxed );
    }
}


/// Asynchronous outcome of a session, reported back to the engine.
#[derive( Debug )]
pub enum SessionSignal {
    /// The stream played to its end.
    Finished { generation: u64 },

    /// The stream broke off with a decode error.
    Failed { generation: u64, error: DecoderError },
}


/// Handle a session uses to report how it ended.
///
/// Every signal carries the generation of the session it belongs to, so the
/// engine can ignore signals from sessions it has already replaced.
#[derive( Debug, Clone )]
pub struct SessionNotifier {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionSignal>,
}


impl SessionNotifier {
    pub fn new( generation: u64, tx: mpsc::UnboundedSender<SessionSignal> ) -> Self {
        Self { generation, tx }
    }


    pub fn finished( &self ) {
        let _ = self.tx.send( SessionSignal::Finished { generation: self.generation } );
    }


    pub fn failed( &self, error: DecoderError ) {
        let _ = self.tx.send( SessionSignal::Failed { generation: self.generation, error } );
    }
}


/// An open, streaming track.
pub trait Session: Send + Sync {
    fn pause( &mut self );

    fn resume( &mut self );

    /// Applies a gain on the `[-1, 1]` scale.
    fn set_gain( &mut self, gain: f32 );

    /// Repositions the stream. On error the position is left as it was.
    fn seek( &mut self, position: Duration ) -> Result<(), DecoderError>;

    fn clock( &self ) -> SessionClock;

    /// Stops streaming and releases the file and the output stream.
    fn close( &mut self );
}


/// Opens sessions for tracks.
pub trait Backend: Send + Sync + 'static {
    /// Opens `track` and starts streaming it at `gain`.
    ///
    /// This may block on file and device I/O.
    fn open(
        &self,
        track: &Track,
        gain: f32,
        notifier: SessionNotifier,
    ) -> Result<Box<dyn Session>, SessionError>;
}


/// Backend that decodes with Symphonia and plays through the default cpal device.
#[derive( Debug, Default, Clone, Copy )]
pub struct DeviceBackend;


impl Backend for DeviceBackend {
    fn open(
        &self,
        track: &Track,
        gain: f32,
        notifier: SessionNotifier,
    ) -> Result<Box<dyn Session>, SessionError> {
        let file = File::open( &track.file_path )?;
        let ( decoder, format ) = decoder::decode( file, &track.file_path )?;

        tracing::info!( "Playing: {:?}", track.file_path );

        let decoder = Arc::new( Mutex::new( decoder ) );
        let stop = Arc::new( AtomicBool::new( false ) );
        let seeks = Arc::new( AtomicU64::new( 0 ) );
        let clock = SessionClock::new( format.sample_rate );
        let ( ready_tx, ready_rx ) = std_mpsc::channel();

        let stream = StreamContext {
            decoder: Arc::clone( &decoder ),
            format,
            gain,
            stop: Arc::clone( &stop ),
            seeks: Arc::clone( &seeks ),
            clock: clock.clone(),
            notifier,
        };

        let thread = thread::Builder::new()
            .name( "cadenza-stream".into() )
            .spawn( move || stream.run( ready_tx ) )?;

        // The output stream is built on the streaming thread; wait for it
        let buffer = match ready_rx.recv() {
            Ok( Ok( buffer ) ) => buffer,
            Ok( Err( e ) ) => {
                let _ = thread.join();
                return Err( SessionError::Output( e ) );
            }
            Err( _ ) => {
                let _ = thread.join();
                return Err( SessionError::Startup );
            }
        };

        Ok( Box::new( DeviceSession {
            decoder,
            buffer,
            stop,
            seeks,
            clock,
            thread: Some( thread ),
        }))
    }
}


fn lock_decoder( decoder: &Mutex<Decoder> ) -> MutexGuard<'_, Decoder> {
    decoder.lock().unwrap_or_else( PoisonError::into_inner )
}


/// Session backed by a streaming thread and a cpal output stream.
struct DeviceSession {
    decoder: Arc<Mutex<Decoder>>,
    buffer: Arc<SampleBuffer>,
    stop: Arc<AtomicBool>,
    /// Bumped on every seek, under the decoder lock.
    seeks: Arc<AtomicU64>,
    clock: SessionClock,
    thread: Option<thread::JoinHandle<()>>,
}


impl Session for DeviceSession {
    fn pause( &mut self ) {
        self.buffer.set_paused( true );
    }


    fn resume( &mut self ) {
        self.buffer.set_paused( false );
    }


    fn set_gain( &mut self, gain: f32 ) {
        self.buffer.set_gain( gain );
    }


    fn seek( &mut self, position: Duration ) -> Result<(), DecoderError> {
        let mut decoder = lock_decoder( &self.decoder );
        decoder.seek( position )?;
        self.seeks.fetch_add( 1, Ordering::AcqRel );
        self.buffer.clear();
        self.clock.set_position( position );
        Ok(())
    }


    fn clock( &self ) -> SessionClock {
        self.clock.clone()
    }


    fn close( &mut self ) {
        self.stop.store( true, Ordering::Relaxed );
        self.buffer.clear();

        if let Some( thread ) = self.thread.take() {
            let _ = thread.join();
            tracing::debug!( "Stream thread joined" );
        }
    }
}


impl Drop for DeviceSession {
    fn drop( &mut self ) {
        self.close();
    }
}


/// Everything the streaming thread owns.
struct StreamContext {
    decoder: Arc<Mutex<Decoder>>,
    format: Format,
    gain: f32,
    stop: Arc<AtomicBool>,
    seeks: Arc<AtomicU64>,
    clock: SessionClock,
    notifier: SessionNotifier,
}


type Ready = std_mpsc::Sender<Result<Arc<SampleBuffer>, OutputError>>;


impl StreamContext {
    /// Builds the output on this thread, reports readiness, then streams.
    fn run( self, ready: Ready ) {
        let ( output, buffer ) = match AudioOutput::new( self.format.sample_rate, self.format.channels as u16 ) {
            Ok( pair ) => pair,
            Err( e ) => {
                let _ = ready.send( Err( e ) );
                return;
            }
        };
        buffer.set_gain( self.gain );

        let resampler = match StreamResampler::for_rates( self.format, output.sample_rate() ) {
            Ok( r ) => r,
            Err( e ) => {
                let _ = ready.send( Err( e ) );
                return;
            }
        };

        if let Err( e ) = output.play() {
            let _ = ready.send( Err( e ) );
            return;
        }

        if ready.send( Ok( Arc::clone( &buffer ) ) ).is_err() {
            return;
        }

        self.stream( &buffer, output.sample_rate(), resampler );
        tracing::debug!( "Stream loop: exiting" );
        // `output` drops here, which stops the cpal stream
    }


    fn stopped( &self ) -> bool {
        self.stop.load( Ordering::Relaxed )
    }


    fn sought_since( &self, seeks: u64 ) -> bool {
        self.seeks.load( Ordering::Acquire ) != seeks
    }


    fn stream( &self, buffer: &SampleBuffer, output_rate: u32, mut resampler: Option<StreamResampler> ) {
        let channels = self.format.channels.max( 1 );
        // Keep about 50ms decoded ahead of the device
        let target_buffer = ( output_rate as usize * channels ) / 20;

        loop {
            if self.stopped() {
                tracing::debug!( "Stream loop: stop signal received" );
                return;
            }

            if buffer.is_paused() || buffer.len() > target_buffer {
                thread::sleep( Duration::from_millis( 5 ) );
                continue;
            }

            let ( next, seeks ) = {
                let mut decoder = lock_decoder( &self.decoder );
                let next = decoder.decode_next();
                if let Ok( Some( ref samples ) ) = next {
                    self.clock.advance( ( samples.len() / channels ) as u64 );
                }
                ( next, self.seeks.load( Ordering::Acquire ) )
            };

            match next {
                Ok( Some( samples ) ) => {
                    let samples = match resampler.as_mut() {
                        Some( r ) => r.process( &samples ),
                        None => samples,
                    };
                    self.push_all( buffer, &samples );
                }
                Ok( None ) => {
                    if let Some( r ) = resampler.as_mut() {
                        let tail = r.flush();
                        self.push_all( buffer, &tail );
                    }

                    tracing::info!( "Stream loop: reached end of file" );
                    while !buffer.is_empty() && !self.stopped() && !self.sought_since( seeks ) {
                        thread::sleep( Duration::from_millis( 10 ) );
                    }
                    if self.stopped() {
                        return;
                    }

                    // Seeks hold the decoder lock, so none can land between this check and the signal
                    let _decoder = lock_decoder( &self.decoder );
                    if self.sought_since( seeks ) {
                        tracing::debug!( "Stream loop: seek after end of file, streaming on" );
                        continue;
                    }
                    self.notifier.finished();
                    return;
                }
                Err( e ) => {
                    tracing::error!( "Decode error: {}", e );
                    if !self.stopped() {
                        self.notifier.failed( e );
                    }
                    return;
                }
            }
        }
    }


    /// Pushes samples, waiting for room, until done or stopped.
    fn push_all( &self, buffer: &SampleBuffer, samples: &[f32] ) {
        let mut offset = 0;
        while offset < samples.len() && !self.stopped() {
            let pushed = buffer.push( &samples[ offset.. ] );
            offset += pushed;
            if pushed == 0 {
                thread::sleep( Duration::from_millis( 5 ) );
            }
        }
    }
}


/// Converts interleaved samples from the source rate to the device rate.
struct StreamResampler {
    inner: FastFixedOut<f32>,
    pending: Vec<Vec<f32>>,
}


impl StreamResampler {
    /// Returns None when the rates already match.
    fn for_rates( format: Format, output_rate: u32 ) -> Result<Option<Self>, OutputError> {
        if format.sample_rate == output_rate {
            return Ok( None );
        }

        tracing::info!( "Resampling: {} Hz → {} Hz", format.sample_rate, output_rate );

        let channels = format.channels.max( 1 );
        let inner = FastFixedOut::<f32>::new(
            output_rate as f64 / format.sample_rate as f64,
            2.0,
            PolynomialDegree::Cubic,
            1024,
            channels,
        ).map_err( |e| OutputError::Resampler( e.to_string() ) )?;

        Ok( Some( Self {
            inner,
            pending: vec![ Vec::new(); channels ],
        }))
    }


    fn process( &mut self, samples: &[f32] ) -> Vec<f32> {
        let channels = self.pending.len();
        for frame in samples.chunks( channels ) {
            for ( ch, sample ) in frame.iter().enumerate() {
                self.pending[ ch ].push( *sample );
            }
        }

        let mut out = Vec::new();
        while self.pending[ 0 ].len() >= self.inner.input_frames_next() {
            let needed = self.inner.input_frames_next();
            let chunk: Vec<Vec<f32>> = self.pending
                .iter_mut()
                .map( |ch| ch.drain( ..needed ).collect() )
                .collect();

            match self.inner.process( &chunk, None ) {
                Ok( resampled ) => out.extend( interleave( &resampled ) ),
                Err( e ) => {
                    tracing::error!( "Resample error: {}", e );
                    break;
                }
            }
        }
        out
    }


    /// Resamples whatever is left over at the end of the stream.
    fn flush( &mut self ) -> Vec<f32> {
        if self.pending[ 0 ].is_empty() {
            return Vec::new();
        }

        let result = self.inner.process_partial( Some( self.pending.as_slice() ), None );
        for ch in self.pending.iter_mut() {
            ch.clear();
        }

        match result {
            Ok( resampled ) => interleave( &resampled ),
            Err( e ) => {
                tracing::error!( "Final resample error: {}", e );
                Vec::new()
            }
        }
    }
}


/// Converts planar samples back to interleaved format.
/// [[L0, L1, ...], [R0, R1, ...]] → [L0, R0, L1, R1, ...]
fn interleave( channels: &[Vec<f32>] ) -> Vec<f32> {
    let frames = channels.first().map( Vec::len ).unwrap_or( 0 );
    let mut out = Vec::with_capacity( frames * channels.len() );
    for f in 0..frames {
        for ch in channels {
            out.push( ch[ f ] );
        }
    }
    out
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_interleave() {
        let planar = vec![ vec![ 1.0, 2.0 ], vec![ 10.0, 20.0 ] ];
        assert_eq!( interleave( &planar ), vec![ 1.0, 10.0, 2.0, 20.0 ] );
        assert!( interleave( &[] ).is_empty() );
    }


    #[test]
    fn test_clock_tracks_frames_and_seeks() {
        let clock = SessionClock::new( 1000 );
        let observer = clock.clone();

        clock.advance( 1500 );
        assert_eq!( observer.position(), Duration::from_millis( 1500 ) );

        clock.set_position( Duration::from_millis( 250 ) );
        assert_eq!( observer.position(), Duration::from_millis( 250 ) );
    }


    #[test]
    fn test_session_error_ops() {
        let open = SessionError::Open( io::Error::new( io::ErrorKind::NotFound, "missing" ) );
        let decode = SessionError::Decode( DecoderError::NoAudioTrack );
        let output = SessionError::Output( OutputError::NoDevice );

        assert_eq!( open.op(), "open" );
        assert_eq!( decode.op(), "decode" );
        assert_eq!( output.op(), "output" );
    }


    #[test]
    fn test_device_backend_reports_missing_file() {
        let ( tx, _rx ) = mpsc::unbounded_channel();
        let track = Track::from_path( "/nonexistent/cadenza/missing.mp3" );

        let result = DeviceBackend.open( &track, 0.0, SessionNotifier::new( 1, tx ) );
        assert!( matches!( result, Err( SessionError::Open( _ ) ) ) );
    }


    #[test]
    fn test_seek_after_end_of_file_keeps_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "silence.wav" );
        std::fs::write( &path, crate::metadata::tests::wav_bytes( &[] ) ).unwrap();
        let ( decoder, format ) = decoder::decode( File::open( &path ).unwrap(), &path ).unwrap();

        let ( tx, mut rx ) = mpsc::unbounded_channel();
        let decoder = Arc::new( Mutex::new( decoder ) );
        let stop = Arc::new( AtomicBool::new( false ) );
        let seeks = Arc::new( AtomicU64::new( 0 ) );
        let clock = SessionClock::new( format.sample_rate );
        let buffer = Arc::new( SampleBuffer::new( 16_000, 1, 1 ) );

        let context = StreamContext {
            decoder: Arc::clone( &decoder ),
            format,
            gain: 0.0,
            stop: Arc::clone( &stop ),
            seeks: Arc::clone( &seeks ),
            clock: clock.clone(),
            notifier: SessionNotifier::new( 1, tx ),
        };
        let thread = thread::spawn( {
            let buffer = Arc::clone( &buffer );
            move || context.stream( &buffer, format.sample_rate, None )
        });

        // Play out just enough for the decoder to reach the end with audio still queued
        let mut out = [ 0.0_f32; 64 ];
        for _ in 0..5000 {
            if clock.position() >= Duration::from_secs( 1 ) && buffer.len() <= 200 {
                break;
            }
            buffer.pop( &mut out );
            thread::sleep( Duration::from_millis( 1 ) );
        }
        assert!( clock.position() >= Duration::from_secs( 1 ) );
        thread::sleep( Duration::from_millis( 50 ) );
        assert!( !buffer.is_empty() );
        assert!( rx.try_recv().is_err() );

        let mut session = DeviceSession {
            decoder,
            buffer: Arc::clone( &buffer ),
            stop,
            seeks,
            clock: clock.clone(),
            thread: Some( thread ),
        };
        session.seek( Duration::ZERO ).unwrap();

        thread::sleep( Duration::from_millis( 100 ) );
        assert!( rx.try_recv().is_err() );
        assert!( !buffer.is_empty() );
        assert!( clock.position() < Duration::from_secs( 1 ) );

        // Draining the rest ends the session normally
        let mut finished = false;
        for _ in 0..5000 {
            buffer.pop( &mut out );
            if let Ok( SessionSignal::Finished { generation } ) = rx.try_recv() {
                assert_eq!( generation, 1 );
                finished = true;
                break;
            }
            thread::sleep( Duration::from_millis( 1 ) );
        }
        assert!( finished );
        session.close();
    }


    #[test]
    fn test_notifier_tags_generation() {
        let ( tx, mut rx ) = mpsc::unbounded_channel();
        let notifier = SessionNotifier::new( 7, tx );

        notifier.finished();
        match rx.try_recv() {
            Ok( SessionSignal::Finished { generation } ) => assert_eq!( generation, 7 ),
            other => panic!( "unexpected signal: {:?}", other ),
        }
    }
}
