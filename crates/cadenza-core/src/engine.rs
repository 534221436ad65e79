//! Playback engine
//!
//! A single actor task owns the playback session and every piece of mutable
//! playback state. Callers talk to it through a cloneable [`Engine`] handle
//! that enqueues [`AudioCommand`]s; the actor answers by publishing
//! [`AudioEvent`]s and by writing snapshots into a `watch` cell that
//! [`Engine::state`] reads from.
//!
//! A second task samples the session clock every [`POSITION_INTERVAL`] and
//! publishes `PositionUpdate`s while a track is playing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{ mpsc, watch };
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backend::{ Backend, Session, SessionClock, SessionError, SessionNotifier, SessionSignal };
use crate::command::{ AudioCommand, AudioEvent };
use crate::error::PlayerError;
use crate::output::gain_for_volume;
use crate::track::{ PlaybackState, PlaybackStatus, RepeatMode, Track, DEFAULT_VOLUME };


/// How often the position sampler reports progress.
pub const POSITION_INTERVAL: Duration = Duration::from_millis( 500 );

const COMMAND_CAPACITY: usize = 10;
const EVENT_CAPACITY: usize = 20;


/// Handle to a running playback engine.
///
/// Cloning the handle is cheap; all clones drive the same actor. The actor
/// shuts down when its cancellation token fires or every handle is dropped.
#[derive( Clone )]
pub struct Engine {
    commands: mpsc::Sender<AudioCommand>,
    state: watch::Receiver<PlaybackState>,
    clock: watch::Receiver<Option<SessionClock>>,
}


impl Engine {
    /// Starts the engine on the current tokio runtime.
    ///
    /// @param backend - Opens a session for each played track
    /// @param token - Cancelling it stops playback and shuts the engine down
    ///
    /// @returns The engine handle and its event stream
    pub fn spawn<B: Backend>(
        backend: B,
        token: CancellationToken,
    ) -> ( Self, mpsc::Receiver<AudioEvent> ) {
        Self::spawn_with_interval( backend, token, POSITION_INTERVAL )
    }


    /// Like [`Engine::spawn`], with a custom position sampling interval.
    pub fn spawn_with_interval<B: Backend>(
        backend: B,
        token: CancellationToken,
        interval: Duration,
    ) -> ( Self, mpsc::Receiver<AudioEvent> ) {
        let ( commands_tx, commands_rx ) = mpsc::channel( COMMAND_CAPACITY );
        let ( events_tx, events_rx ) = mpsc::channel( EVENT_CAPACITY );
        let ( signals_tx, signals_rx ) = mpsc::unbounded_channel();
        let ( state_tx, state_rx ) = watch::channel( PlaybackState::default() );
        let ( clock_tx, clock_rx ) = watch::channel( None );
        let shutdown = token.child_token();

        let sampler = PositionSampler {
            state: state_rx.clone(),
            clock: clock_rx.clone(),
            events: events_tx.clone(),
            shutdown: shutdown.clone(),
            interval,
        };

        let actor = Actor {
            backend: Arc::new( backend ),
            commands: commands_rx,
            signals_tx,
            signals: signals_rx,
            events: events_tx,
            state_tx,
            clock_tx,
            shutdown,
            session: None,
            current: None,
            status: PlaybackStatus::Stopped,
            volume: DEFAULT_VOLUME,
            repeat: RepeatMode::None,
            shuffle: false,
            generation: 0,
        };

        tokio::spawn( sampler.run() );
        tokio::spawn( actor.run() );

        let engine = Self {
            commands: commands_tx,
            state: state_rx,
            clock: clock_rx,
        };
        ( engine, events_rx )
    }


    /// Plays a track, replacing whatever is currently playing.
    ///
    /// `None` fails with [`PlayerError::TrackNotFound`] without reaching the
    /// engine. Open failures are reported asynchronously as `Error` events.
    pub async fn play( &self, track: Option<Arc<Track>> ) -> Result<(), PlayerError> {
        let track = track.ok_or( PlayerError::TrackNotFound )?;
        self.send( AudioCommand::Play( track ) ).await
    }


    pub async fn pause( &self ) -> Result<(), PlayerError> {
        self.send( AudioCommand::Pause ).await
    }


    pub async fn resume( &self ) -> Result<(), PlayerError> {
        self.send( AudioCommand::Resume ).await
    }


    pub async fn stop( &self ) -> Result<(), PlayerError> {
        self.send( AudioCommand::Stop ).await
    }


    /// Seeks within the current track. Does nothing when nothing is playing.
    pub async fn seek( &self, position: Duration ) -> Result<(), PlayerError> {
        self.send( AudioCommand::Seek( position ) ).await
    }


    /// Sets the volume on the `[0, 1]` scale.
    ///
    /// Out of range values (NaN included) fail with
    /// [`PlayerError::InvalidVolume`] and leave the volume unchanged.
    pub async fn set_volume( &self, volume: f32 ) -> Result<(), PlayerError> {
        if !( 0.0..=1.0 ).contains( &volume ) {
            return Err( PlayerError::InvalidVolume( volume ) );
        }
        self.send( AudioCommand::SetVolume( volume ) ).await
    }


    /// Mirrors the queue's repeat mode into the published state.
    pub async fn set_repeat( &self, mode: RepeatMode ) -> Result<(), PlayerError> {
        self.send( AudioCommand::SetRepeat( mode ) ).await
    }


    /// Mirrors the queue's shuffle flag into the published state.
    pub async fn set_shuffle( &self, shuffle: bool ) -> Result<(), PlayerError> {
        self.send( AudioCommand::SetShuffle( shuffle ) ).await
    }


    /// Returns an owned snapshot of the playback state.
    ///
    /// The position is read live from the session clock.
    pub fn state( &self ) -> PlaybackState {
        let mut state = self.state.borrow().clone();
        if state.status != PlaybackStatus::Stopped {
            if let Some( clock ) = self.clock.borrow().as_ref() {
                state.position = clock.position();
            }
        }
        state
    }


    /// Returns false once the engine has shut down.
    pub fn is_running( &self ) -> bool {
        !self.commands.is_closed()
    }


    async fn send( &self, command: AudioCommand ) -> Result<(), PlayerError> {
        self.commands
            .send( command )
            .await
            .map_err( |_| PlayerError::EngineStopped )
    }
}


/// The command processor. Owns the session outright.
struct Actor<B> {
    backend: Arc<B>,
    commands: mpsc::Receiver<AudioCommand>,
    signals_tx: mpsc::UnboundedSender<SessionSignal>,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    events: mpsc::Sender<AudioEvent>,
    state_tx: watch::Sender<PlaybackState>,
    clock_tx: watch::Sender<Option<SessionClock>>,
    shutdown: CancellationToken,
    session: Option<Box<dyn Session>>,
    current: Option<Arc<Track>>,
    status: PlaybackStatus,
    volume: f32,
    repeat: RepeatMode,
    shuffle: bool,
    /// Bumped for every opened session; signals from older sessions are stale.
    generation: u64,
}


impl<B: Backend> Actor<B> {
    async fn run( mut self ) {
        tracing::debug!( "Engine started" );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    tracing::debug!( "Engine: cancellation received" );
                    break;
                }

                command = self.commands.recv() => match command {
                    Some( command ) => self.handle( command ).await,
                    None => {
                        tracing::debug!( "Engine: all handles dropped" );
                        break;
                    }
                },

                Some( signal ) = self.signals.recv() => self.handle_signal( signal ).await,
            }
        }

        self.teardown().await;
        self.publish();
        self.shutdown.cancel();
        tracing::debug!( "Engine stopped" );
    }


    async fn handle( &mut self, command: AudioCommand ) {
        tracing::trace!( "Engine command: {:?}", command );

        match command {
            AudioCommand::Play( track ) => self.play( track ).await,

            AudioCommand::Pause => {
                if self.status == PlaybackStatus::Playing {
                    if let Some( session ) = self.session.as_mut() {
                        session.pause();
                        self.status = PlaybackStatus::Paused;
                    }
                }
                self.publish();
                self.emit_state().await;
            }

            AudioCommand::Resume => {
                if self.status == PlaybackStatus::Paused {
                    if let Some( session ) = self.session.as_mut() {
                        session.resume();
                        self.status = PlaybackStatus::Playing;
                    }
                }
                self.publish();
                self.emit_state().await;
            }

            AudioCommand::Stop => {
                self.teardown().await;
                self.publish();
                self.emit_state().await;
            }

            AudioCommand::Seek( position ) => self.seek( position ).await,

            AudioCommand::SetVolume( volume ) => {
                self.volume = volume;
                if let Some( session ) = self.session.as_mut() {
                    session.set_gain( gain_for_volume( volume ) );
                }
                self.publish();
            }

            AudioCommand::SetRepeat( mode ) => {
                self.repeat = mode;
                self.publish();
            }

            AudioCommand::SetShuffle( shuffle ) => {
                self.shuffle = shuffle;
                self.publish();
            }
        }
    }


    async fn play( &mut self, track: Arc<Track> ) {
        let was_stopped = self.status == PlaybackStatus::Stopped;
        self.teardown().await;

        self.generation += 1;
        let notifier = SessionNotifier::new( self.generation, self.signals_tx.clone() );
        let backend = Arc::clone( &self.backend );
        let gain = gain_for_volume( self.volume );
        let opening = Arc::clone( &track );

        let opened = tokio::task::spawn_blocking( move || backend.open( &opening, gain, notifier ) ).await;

        let error = match opened {
            Ok( Ok( session ) ) => {
                tracing::info!( "Playing {}", track.display_name() );
                self.clock_tx.send_replace( Some( session.clock() ) );
                self.session = Some( session );
                self.current = Some( Arc::clone( &track ) );
                self.status = PlaybackStatus::Playing;
                self.publish();

                self.emit( AudioEvent::TrackStarted( track ) ).await;
                self.emit_state().await;
                return;
            }
            Ok( Err( e ) ) => e,
            Err( e ) => {
                tracing::error!( "Session open task failed: {}", e );
                SessionError::Startup
            }
        };

        tracing::error!( "Failed to play {:?}: {}", track.file_path, error );
        self.publish();

        let op = error.op();
        let event = AudioEvent::Error( Arc::new( PlayerError::playback( op, &track.id, error ) ) );
        self.emit( event ).await;
        if !was_stopped {
            self.emit_state().await;
        }
    }


    async fn seek( &mut self, position: Duration ) {
        let Some( session ) = self.session.as_mut() else {
            tracing::debug!( "Seek ignored, nothing is playing" );
            return;
        };

        match session.seek( position ) {
            Ok(()) => {
                self.publish();
                self.emit( AudioEvent::PositionUpdate( position ) ).await;
            }
            Err( e ) => {
                tracing::warn!( "Seek to {:?} failed: {}", position, e );
            }
        }
    }


    async fn handle_signal( &mut self, signal: SessionSignal ) {
        match signal {
            SessionSignal::Finished { generation } if self.is_live( generation ) => {
                let track = self.current.clone();
                self.teardown().await;
                self.publish();

                if let Some( track ) = track {
                    tracing::info!( "Track ended: {}", track.display_name() );
                    self.emit( AudioEvent::TrackEnded( track ) ).await;
                }
                self.emit_state().await;
            }

            SessionSignal::Failed { generation, error } if self.is_live( generation ) => {
                let track = self.current.clone();
                self.teardown().await;
                self.publish();

                if let Some( track ) = track {
                    let err = PlayerError::playback( "stream", &track.id, SessionError::Decode( error ) );
                    self.emit( AudioEvent::Error( Arc::new( err ) ) ).await;
                }
                self.emit_state().await;
            }

            stale => {
                tracing::debug!( "Ignoring signal from a replaced session: {:?}", stale );
            }
        }
    }


    fn is_live( &self, generation: u64 ) -> bool {
        self.session.is_some() && generation == self.generation
    }


    /// Closes the open session, if any, and resets to Stopped.
    ///
    /// Closing can join a streaming thread, so it runs on the blocking pool.
    async fn teardown( &mut self ) {
        if let Some( mut session ) = self.session.take() {
            match tokio::task::spawn_blocking( move || session.close() ).await {
                Ok(()) => tracing::debug!( "Session closed" ),
                Err( e ) => tracing::error!( "Session close task failed: {}", e ),
            }
        }
        self.clock_tx.send_replace( None );
        self.current = None;
        self.status = PlaybackStatus::Stopped;
    }


    fn snapshot( &self ) -> PlaybackState {
        PlaybackState {
            current_track: self.current.as_deref().cloned(),
            status: self.status,
            position: self.session
                .as_ref()
                .map( |s| s.clock().position() )
                .unwrap_or( Duration::ZERO ),
            volume: self.volume,
            repeat: self.repeat,
            shuffle: self.shuffle,
        }
    }


    fn publish( &self ) {
        self.state_tx.send_replace( self.snapshot() );
    }


    async fn emit_state( &self ) {
        self.emit( AudioEvent::StateChange( self.snapshot() ) ).await;
    }


    async fn emit( &self, event: AudioEvent ) {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {}
            result = self.events.send( event ) => {
                if result.is_err() {
                    tracing::trace!( "Event dropped, nobody is listening" );
                }
            }
        }
    }
}


/// Publishes the session position while a track is playing.
struct PositionSampler {
    state: watch::Receiver<PlaybackState>,
    clock: watch::Receiver<Option<SessionClock>>,
    events: mpsc::Sender<AudioEvent>,
    shutdown: CancellationToken,
    interval: Duration,
}


impl PositionSampler {
    async fn run( self ) {
        let first = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at( first, self.interval );
        ticker.set_missed_tick_behavior( MissedTickBehavior::Delay );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some( position ) = self.sample() else {
                continue;
            };

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.events.send( AudioEvent::PositionUpdate( position ) ) => {}
            }
        }

        tracing::debug!( "Position sampler stopped" );
    }


    fn sample( &self ) -> Option<Duration> {
        if self.state.borrow().status != PlaybackStatus::Playing {
            return None;
        }
        self.clock.borrow().as_ref().map( SessionClock::position )
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;
    use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };

    use crate::decoder::DecoderError;


    const NEVER: Duration = Duration::from_secs( 3600 );


    /// Records everything the engine asks of its sessions.
    #[derive( Default )]
    struct Recorder {
        opened: AtomicUsize,
        closed: AtomicUsize,
        overlapped: AtomicBool,
        paused: AtomicBool,
        gain: Mutex<Option<f32>>,
        notifiers: Mutex<Vec<SessionNotifier>>,
        clocks: Mutex<Vec<SessionClock>>,
        fail_seek: AtomicBool,
        slow_close: AtomicBool,
    }


    #[derive( Clone, Default )]
    struct FakeBackend {
        recorder: Arc<Recorder>,
    }


    impl FakeBackend {
        fn notifier( &self, index: usize ) -> SessionNotifier {
            self.recorder.notifiers.lock().unwrap()[ index ].clone()
        }


        async fn first_clock( &self ) -> SessionClock {
            for _ in 0..200 {
                if let Some( clock ) = self.recorder.clocks.lock().unwrap().first() {
                    return clock.clone();
                }
                tokio::time::sleep( Duration::from_millis( 5 ) ).await;
            }
            panic!( "session never opened" );
        }
    }


    impl Backend for FakeBackend {
        fn open(
            &self,
            track: &Track,
            gain: f32,
            notifier: SessionNotifier,
        ) -> Result<Box<dyn Session>, SessionError> {
            if track.file_path.ends_with( "broken.mp3" ) {
                return Err( SessionError::Open( io::Error::new( io::ErrorKind::NotFound, "missing" ) ) );
            }

            let r = &self.recorder;
            let opened = r.opened.fetch_add( 1, Ordering::SeqCst );
            if opened != r.closed.load( Ordering::SeqCst ) {
                r.overlapped.store( true, Ordering::SeqCst );
            }

            let clock = SessionClock::new( 1000 );
            *r.gain.lock().unwrap() = Some( gain );
            r.notifiers.lock().unwrap().push( notifier );
            r.clocks.lock().unwrap().push( clock.clone() );

            Ok( Box::new( FakeSession {
                clock,
                recorder: Arc::clone( r ),
                closed: false,
            }))
        }
    }


    struct FakeSession {
        clock: SessionClock,
        recorder: Arc<Recorder>,
        closed: bool,
    }


    impl Session for FakeSession {
        fn pause( &mut self ) {
            self.recorder.paused.store( true, Ordering::SeqCst );
        }


        fn resume( &mut self ) {
            self.recorder.paused.store( false, Ordering::SeqCst );
        }


        fn set_gain( &mut self, gain: f32 ) {
            *self.recorder.gain.lock().unwrap() = Some( gain );
        }


        fn seek( &mut self, position: Duration ) -> Result<(), DecoderError> {
            if self.recorder.fail_seek.load( Ordering::SeqCst ) {
                return Err( DecoderError::Seek( "not seekable".into() ) );
            }
            self.clock.set_position( position );
            Ok(())
        }


        fn clock( &self ) -> SessionClock {
            self.clock.clone()
        }


        fn close( &mut self ) {
            if self.recorder.slow_close.load( Ordering::SeqCst ) {
                std::thread::sleep( Duration::from_millis( 300 ) );
            }
            if !self.closed {
                self.closed = true;
                self.recorder.closed.fetch_add( 1, Ordering::SeqCst );
            }
        }
    }


    fn track( name: &str ) -> Arc<Track> {
        Arc::new( Track::from_path( format!( "/music/{}", name ) ) )
    }


    fn start( backend: &FakeBackend ) -> ( Engine, mpsc::Receiver<AudioEvent>, CancellationToken ) {
        let token = CancellationToken::new();
        let ( engine, events ) = Engine::spawn_with_interval( backend.clone(), token.clone(), NEVER );
        ( engine, events, token )
    }


    async fn next_event( events: &mut mpsc::Receiver<AudioEvent> ) -> AudioEvent {
        tokio::time::timeout( Duration::from_secs( 2 ), events.recv() )
            .await
            .expect( "timed out waiting for an event" )
            .expect( "event stream closed" )
    }


    async fn next_state( events: &mut mpsc::Receiver<AudioEvent> ) -> PlaybackState {
        match next_event( events ).await {
            AudioEvent::StateChange( state ) => state,
            other => panic!( "expected StateChange, got {:?}", other ),
        }
    }


    #[tokio::test]
    async fn test_play_emits_started_then_state() {
        let backend = FakeBackend::default();
        let ( engine, mut events, _token ) = start( &backend );
        let a = track( "a.mp3" );

        engine.play( Some( Arc::clone( &a ) ) ).await.unwrap();

        match next_event( &mut events ).await {
            AudioEvent::TrackStarted( t ) => assert!( Arc::ptr_eq( &t, &a ) ),
            other => panic!( "expected TrackStarted, got {:?}", other ),
        }
        let state = next_state( &mut events ).await;
        assert_eq!( state.status, PlaybackStatus::Playing );
        assert_eq!( state.current_track.as_ref().map( |t| &t.id ), Some( &a.id ) );

        // Default volume 0.5 maps to unity gain
        assert_eq!( *backend.recorder.gain.lock().unwrap(), Some( 0.0 ) );
    }


    #[tokio::test]
    async fn test_play_none_is_rejected() {
        let backend = FakeBackend::default();
        let ( engine, _events, _token ) = start( &backend );

        let result = engine.play( None ).await;
        assert!( matches!( result, Err( PlayerError::TrackNotFound ) ) );
        assert_eq!( backend.recorder.opened.load( Ordering::SeqCst ), 0 );
    }


    #[tokio::test]
    async fn test_invalid_volume_leaves_volume_unchanged() {
        let backend = FakeBackend::default();
        let ( engine, mut events, _token ) = start( &backend );

        for volume in [ -0.1, 1.01, f32::NAN, f32::INFINITY ] {
            let result = engine.set_volume( volume ).await;
            assert!( matches!( result, Err( PlayerError::InvalidVolume( _ ) ) ), "{}", volume );
        }

        engine.set_volume( 0.8 ).await.unwrap();
        engine.stop().await.unwrap();
        let state = next_state( &mut events ).await;
        assert_eq!( state.volume, 0.8 );
        assert_eq!( engine.state().volume, 0.8 );
    }


    #[tokio::test]
    async fn test_state_is_an_independent_copy() {
        let backend = FakeBackend::default();
        let ( engine, mut events, _token ) = start( &backend );

        engine.play( Some( track( "a.mp3" ) ) ).await.unwrap();
        next_event( &mut events ).await;
        next_state( &mut events ).await;

        let mut copy = engine.state();
        copy.volume = 0.1;
        copy.status = PlaybackStatus::Stopped;
        if let Some( t ) = copy.current_track.as_mut() {
            t.title = "changed".into();
        }

        let fresh = engine.state();
        assert_eq!( fresh.volume, DEFAULT_VOLUME );
        assert_eq!( fresh.status, PlaybackStatus::Playing );
        assert_eq!( fresh.current_track.unwrap().title, "a" );
    }


    #[tokio::test]
    async fn test_pause_and_resume() {
        let backend = FakeBackend::default();
        let ( engine, mut events, _token ) = start( &backend );

        engine.play( Some( track( "a.mp3" ) ) ).await.unwrap();
        next_event( &mut events ).await;
        next_state( &mut events ).await;

        engine.pause().await.unwrap();
        assert_eq!( next_state( &mut events ).await.status, PlaybackStatus::Paused );
        assert!( backend.recorder.paused.load( Ordering::SeqCst ) );

        engine.resume().await.unwrap();
        assert_eq!( next_state( &mut events ).await.status, PlaybackStatus::Playing );
        assert!( !backend.recorder.paused.load( Ordering::SeqCst ) );

        engine.stop().await.unwrap();
        let state = next_state( &mut events ).await;
        assert_eq!( state.status, PlaybackStatus::Stopped );
        assert_eq!( state.position, Duration::ZERO );
        assert!( state.current_track.is_none() );
    }


    #[tokio::test]
    async fn test_only_one_session_open_at_a_time() {
        let backend = FakeBackend::default();
        let ( engine, mut events, _token ) = start( &backend );

        for name in [ "a.mp3", "b.mp3", "c.mp3" ] {
            engine.play( Some( track( name ) ) ).await.unwrap();
            next_event( &mut events ).await;
            next_state( &mut events ).await;
        }

        let r = &backend.recorder;
        assert_eq!( r.opened.load( Ordering::SeqCst ), 3 );
        assert_eq!( r.closed.load( Ordering::SeqCst ), 2 );
        assert!( !r.overlapped.load( Ordering::SeqCst ) );
    }


    #[tokio::test]
    async fn test_closing_a_session_does_not_block_the_runtime() {
        let backend = FakeBackend::default();
        let ( engine, mut events, _token ) = start( &backend );

        engine.play( Some( track( "a.mp3" ) ) ).await.unwrap();
        next_event( &mut events ).await;
        next_state( &mut events ).await;

        backend.recorder.slow_close.store( true, Ordering::SeqCst );
        engine.stop().await.unwrap();

        // The single-threaded test runtime stays responsive while the session closes
        let started = std::time::Instant::now();
        tokio::time::sleep( Duration::from_millis( 20 ) ).await;
        assert!( started.elapsed() < Duration::from_millis( 200 ) );
        assert_eq!( backend.recorder.closed.load( Ordering::SeqCst ), 0 );

        let state = next_state( &mut events ).await;
        assert_eq!( state.status, PlaybackStatus::Stopped );
        assert_eq!( backend.recorder.closed.load( Ordering::SeqCst ), 1 );
    }


    #[tokio::test]
    async fn test_natural_end_emits_track_ended_then_stopped() {
        let backend = FakeBackend::default();
        let ( engine, mut events, _token ) = start( &backend );
        let a = track( "a.mp3" );

        engine.play( Some( Arc::clone( &a ) ) ).await.unwrap();
        next_event( &mut events ).await;
        next_state( &mut events ).await;

        backend.notifier( 0 ).finished();

        match next_event( &mut events ).await {
            AudioEvent::TrackEnded( t ) => assert!( Arc::ptr_eq( &t, &a ) ),
            other => panic!( "expected TrackEnded, got {:?}", other ),
        }
        assert_eq!( next_state( &mut events ).await.status, PlaybackStatus::Stopped );
        assert_eq!( backend.recorder.closed.load( Ordering::SeqCst ), 1 );
    }


    #[tokio::test]
    async fn test_signal_from_replaced_session_is_ignored() {
        let backend = FakeBackend::default();
        let ( engine, mut events, _token ) = start( &backend );

        engine.play( Some( track( "a.mp3" ) ) ).await.unwrap();
        next_event( &mut events ).await;
        next_state( &mut events ).await;
        engine.play( Some( track( "b.mp3" ) ) ).await.unwrap();
        next_event( &mut events ).await;
        next_state( &mut events ).await;

        backend.notifier( 0 ).finished();
        engine.pause().await.unwrap();

        // The stale finish produced nothing; the next event is the pause
        assert_eq!( next_state( &mut events ).await.status, PlaybackStatus::Paused );
    }


    #[tokio::test]
    async fn test_stream_failure_reports_error_and_stops() {
        let backend = FakeBackend::default();
        let ( engine, mut events, _token ) = start( &backend );

        engine.play( Some( track( "a.mp3" ) ) ).await.unwrap();
        next_event( &mut events ).await;
        next_state( &mut events ).await;

        backend.notifier( 0 ).failed( DecoderError::Decode( "bad packet".into() ) );

        match next_event( &mut events ).await {
            AudioEvent::Error( err ) => match err.as_ref() {
                PlayerError::PlaybackFailed { op, .. } => assert_eq!( *op, "stream" ),
                other => panic!( "unexpected error: {:?}", other ),
            },
            other => panic!( "expected Error, got {:?}", other ),
        }
        assert_eq!( next_state( &mut events ).await.status, PlaybackStatus::Stopped );
    }


    #[tokio::test]
    async fn test_open_failure_reports_error_and_engine_keeps_going() {
        let backend = FakeBackend::default();
        let ( engine, mut events, _token ) = start( &backend );
        let broken = track( "broken.mp3" );

        engine.play( Some( Arc::clone( &broken ) ) ).await.unwrap();
        match next_event( &mut events ).await {
            AudioEvent::Error( err ) => match err.as_ref() {
                PlayerError::PlaybackFailed { op, track_id, .. } => {
                    assert_eq!( *op, "open" );
                    assert_eq!( track_id, &broken.id );
                }
                other => panic!( "unexpected error: {:?}", other ),
            },
            other => panic!( "expected Error, got {:?}", other ),
        }
        assert_eq!( engine.state().status, PlaybackStatus::Stopped );

        engine.play( Some( track( "a.mp3" ) ) ).await.unwrap();
        assert!( matches!( next_event( &mut events ).await, AudioEvent::TrackStarted( _ ) ) );
        assert_eq!( next_state( &mut events ).await.status, PlaybackStatus::Playing );
    }


    #[tokio::test]
    async fn test_seek_moves_position() {
        let backend = FakeBackend::default();
        let ( engine, mut events, _token ) = start( &backend );

        // No session: silently ignored
        engine.seek( Duration::from_secs( 5 ) ).await.unwrap();

        engine.play( Some( track( "a.mp3" ) ) ).await.unwrap();
        next_event( &mut events ).await;
        next_state( &mut events ).await;

        engine.seek( Duration::from_secs( 42 ) ).await.unwrap();
        match next_event( &mut events ).await {
            AudioEvent::PositionUpdate( p ) => assert_eq!( p, Duration::from_secs( 42 ) ),
            other => panic!( "expected PositionUpdate, got {:?}", other ),
        }
        assert_eq!( engine.state().position, Duration::from_secs( 42 ) );

        backend.recorder.fail_seek.store( true, Ordering::SeqCst );
        engine.seek( Duration::from_secs( 7 ) ).await.unwrap();
        engine.pause().await.unwrap();
        let state = next_state( &mut events ).await;
        assert_eq!( state.position, Duration::from_secs( 42 ) );
    }


    #[tokio::test]
    async fn test_volume_reaches_open_session() {
        let backend = FakeBackend::default();
        let ( engine, mut events, _token ) = start( &backend );

        engine.play( Some( track( "a.mp3" ) ) ).await.unwrap();
        next_event( &mut events ).await;
        next_state( &mut events ).await;

        engine.set_volume( 1.0 ).await.unwrap();
        engine.pause().await.unwrap();
        next_state( &mut events ).await;
        assert_eq!( *backend.recorder.gain.lock().unwrap(), Some( 1.0 ) );
    }


    #[tokio::test]
    async fn test_repeat_and_shuffle_are_mirrored() {
        let backend = FakeBackend::default();
        let ( engine, mut events, _token ) = start( &backend );

        engine.set_repeat( RepeatMode::All ).await.unwrap();
        engine.set_shuffle( true ).await.unwrap();
        engine.stop().await.unwrap();

        let state = next_state( &mut events ).await;
        assert_eq!( state.repeat, RepeatMode::All );
        assert!( state.shuffle );
    }


    #[tokio::test]
    async fn test_position_sampler_reports_while_playing() {
        let backend = FakeBackend::default();
        let token = CancellationToken::new();
        let ( engine, mut events ) = Engine::spawn_with_interval(
            backend.clone(),
            token.clone(),
            Duration::from_millis( 10 ),
        );

        engine.play( Some( track( "a.mp3" ) ) ).await.unwrap();
        backend.first_clock().await.advance( 2000 );

        loop {
            if let AudioEvent::PositionUpdate( p ) = next_event( &mut events ).await {
                if p >= Duration::from_secs( 2 ) {
                    break;
                }
            }
        }
        token.cancel();
    }


    #[tokio::test]
    async fn test_cancellation_stops_and_closes_events() {
        let backend = FakeBackend::default();
        let ( engine, mut events, token ) = start( &backend );

        engine.play( Some( track( "a.mp3" ) ) ).await.unwrap();
        next_event( &mut events ).await;
        next_state( &mut events ).await;

        token.cancel();

        let drained = tokio::time::timeout( Duration::from_secs( 2 ), async {
            while events.recv().await.is_some() {}
        }).await;
        assert!( drained.is_ok(), "event stream never closed" );

        assert_eq!( engine.state().status, PlaybackStatus::Stopped );
        assert_eq!( backend.recorder.closed.load( Ordering::SeqCst ), 1 );
        assert!( matches!( engine.stop().await, Err( PlayerError::EngineStopped ) ) );
        assert!( !engine.is_running() );
    }
}
