//! Cadenza - A terminal music player
//!
//! Scans music directories, lists supported formats and plays queues of
//! files, folders and M3U playlists from an interactive console.

mod cli;
mod console;
mod settings;

use std::io::{ self, Write };
use std::path::{ Path, PathBuf };
use std::sync::Arc;

use anyhow::{ bail, Context, Result };
use clap::Parser;
use tokio::io::{ AsyncBufReadExt, BufReader };
use tokio_util::sync::CancellationToken;
use tracing::Level;

use cadenza_core::playlist::{ is_m3u, read_m3u };
use cadenza_core::{
    supported_formats, AudioEvent, DeviceBackend, Engine, EventBus, EventKind, Library,
    PlaybackStatus, PlayerError, Queue, Scanner, Subscription, Track,
};

use cli::{ Args, Commands };
use console::{ format_time, help_text, ConsoleCommand };
use settings::Settings;


#[derive( Debug, Clone, Copy, PartialEq, Eq )]
enum Flow {
    Continue,
    Quit,
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging( args.verbose );

    let settings_path = Settings::path( args.config.as_deref() );
    let settings = Settings::load( settings_path.as_deref() );
    tracing::debug!( "Settings: {:?}", settings );

    let token = CancellationToken::new();
    tokio::spawn( {
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!( "Interrupted, shutting down" );
                token.cancel();
            }
        }
    });

    match args.command {
        Commands::Scan { dirs } => scan( &settings, dirs, token ).await,
        Commands::Play { paths, shuffle } => play( &settings, paths, shuffle, token ).await,
        Commands::Formats => {
            for format in supported_formats() {
                println!( "{}", format );
            }
            Ok(())
        }
    }
}


/// Logs go to stderr so they never mix with listings on stdout.
fn init_logging( verbose: u8 ) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level( level )
        .with_writer( io::stderr )
        .with_target( false )
        .init();
}


fn library_for( settings: &Settings ) -> Library {
    Library::with_scanner( Scanner::new( settings.scan_workers ) )
}


fn describe( track: &Track ) -> String {
    format!( "{} [{}]", track.display_name(), format_time( track.duration ) )
}


async fn scan( settings: &Settings, dirs: Vec<PathBuf>, token: CancellationToken ) -> Result<()> {
    let dirs = if dirs.is_empty() { settings.music_directories.clone() } else { dirs };
    if dirs.is_empty() {
        bail!( "No directories to scan. Pass some or set music_directories in the settings file." );
    }

    let library = library_for( settings );
    let report = library.scan( token.clone(), dirs ).await;

    for track in library.all_tracks() {
        println!( "{}  {}", describe( &track ), track.file_path.display() );
    }
    for error in &report.errors {
        eprintln!( "warning: {}", error );
    }

    println!(
        "{} tracks, {} artists, {} albums ({} errors)",
        library.len(),
        library.artists().len(),
        library.albums().len(),
        report.errors.len()
    );

    if token.is_cancelled() {
        bail!( "Scan interrupted" );
    }
    Ok(())
}


/// Expands command-line paths into tracks, keeping their order.
///
/// Directories are scanned, playlists are read entry by entry and anything
/// else is treated as a single audio file.
async fn resolve_tracks(
    library: &Library,
    paths: &[PathBuf],
    token: &CancellationToken,
) -> Vec<Arc<Track>> {
    let mut tracks = Vec::new();

    for path in paths {
        if token.is_cancelled() {
            break;
        }

        if path.is_dir() {
            let report = library.scan( token.clone(), vec![ path.clone() ] ).await;
            for error in &report.errors {
                eprintln!( "warning: {}", error );
            }
            tracks.extend( library.all_tracks().into_iter().filter( |t| t.file_path.starts_with( path ) ) );
        } else if is_m3u( path ) {
            match read_m3u( path ) {
                Ok( entries ) => tracks.extend( entries.iter().filter_map( |e| add_file( library, e ) ) ),
                Err( e ) => eprintln!( "warning: {}: {}", path.display(), e ),
            }
        } else {
            tracks.extend( add_file( library, path ) );
        }
    }

    tracks
}


fn add_file( library: &Library, path: &Path ) -> Option<Arc<Track>> {
    match library.add_file( path ) {
        Ok( track ) => Some( track ),
        Err( e ) => {
            eprintln!( "warning: {}: {}", path.display(), e );
            None
        }
    }
}


async fn play(
    settings: &Settings,
    paths: Vec<PathBuf>,
    shuffle: bool,
    token: CancellationToken,
) -> Result<()> {
    let library = library_for( settings );
    let tracks = resolve_tracks( &library, &paths, &token ).await;
    if tracks.is_empty() {
        bail!( PlayerError::EmptyQueue );
    }

    let mut queue = Queue::new();
    queue.set( tracks );
    if shuffle {
        queue.shuffle();
    }

    // The loop below reads the engine's events itself; the bus only feeds observers
    let ( engine, mut events ) = Engine::spawn( DeviceBackend, token.clone() );
    let bus = EventBus::new();
    tokio::spawn( log_transitions( bus.subscribe( EventKind::StateChange ) ) );

    engine.set_volume( settings.default_volume ).await.context( "Failed to set volume" )?;
    engine.set_shuffle( shuffle ).await?;
    engine.play( queue.current() ).await?;

    println!( "{} tracks queued. Type 'help' for commands.", queue.len() );

    let mut lines = BufReader::new( tokio::io::stdin() ).lines();
    let mut stdin_open = true;
    let mut failures = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,

            line = lines.next_line(), if stdin_open => match line {
                Ok( Some( line ) ) if line.trim().is_empty() => {}
                Ok( Some( line ) ) => match ConsoleCommand::parse( &line ) {
                    Ok( command ) => match run_command( command, &engine, &mut queue ).await {
                        Ok( Flow::Quit ) => break,
                        Ok( Flow::Continue ) => {}
                        Err( PlayerError::EngineStopped ) => break,
                        Err( e ) => eprintln!( "error: {}", e ),
                    },
                    Err( e ) => eprintln!( "{}", e ),
                },
                Ok( None ) => {
                    tracing::debug!( "Console input closed" );
                    stdin_open = false;
                }
                Err( e ) => {
                    tracing::warn!( "Failed to read console input: {}", e );
                    stdin_open = false;
                }
            },

            event = events.recv() => {
                let Some( event ) = event else {
                    break;
                };

                match dispatch( event, &bus, &engine, &mut queue, &mut failures ).await {
                    // Without a console there is nothing left to do
                    Ok( true ) if !stdin_open => break,
                    Ok( _ ) => {}
                    Err( PlayerError::EngineStopped ) => break,
                    Err( e ) => eprintln!( "error: {}", e ),
                }
            }
        }
    }

    token.cancel();
    bus.close();
    Ok(())
}


/// Logs transport changes for `-v` runs.
async fn log_transitions( mut changes: Subscription ) {
    let mut last = None;
    while let Some( event ) = changes.recv().await {
        if let AudioEvent::StateChange( state ) = event {
            if last != Some( state.status ) {
                tracing::info!( "Playback {:?}", state.status );
                last = Some( state.status );
            }
        }
    }
}


/// Shares an engine event with bus observers, then acts on it.
async fn dispatch(
    event: AudioEvent,
    bus: &EventBus,
    engine: &Engine,
    queue: &mut Queue,
    failures: &mut usize,
) -> Result<bool, PlayerError> {
    bus.publish( event.clone() );
    on_event( event, engine, queue, failures ).await
}


/// Reacts to an engine event. Returns true once the queue has run out.
async fn on_event(
    event: AudioEvent,
    engine: &Engine,
    queue: &mut Queue,
    failures: &mut usize,
) -> Result<bool, PlayerError> {
    match event {
        AudioEvent::TrackStarted( track ) => {
            *failures = 0;
            println!( "Now playing: {}", describe( &track ) );
        }
        AudioEvent::TrackEnded( track ) => {
            tracing::debug!( "Finished {}", track.display_name() );
            return advance( engine, queue ).await;
        }
        AudioEvent::Error( error ) => {
            eprintln!( "error: {}", error );

            // Skip files that cannot be opened, but stop once every entry has failed
            if let PlayerError::PlaybackFailed { op: "open", .. } = *error {
                *failures += 1;
                if *failures >= queue.len() {
                    println!( "Nothing in the queue can be played" );
                    return Ok( true );
                }
                return advance( engine, queue ).await;
            }
        }
        AudioEvent::PositionUpdate( position ) => {
            tracing::trace!( "Position {:?}", position );
        }
        AudioEvent::StateChange( state ) => {
            tracing::debug!( "State {:?}", state.status );
        }
    }
    Ok( false )
}


async fn advance( engine: &Engine, queue: &mut Queue ) -> Result<bool, PlayerError> {
    match queue.next() {
        Some( track ) => {
            engine.play( Some( track ) ).await?;
            Ok( false )
        }
        None => {
            println!( "End of queue" );
            Ok( true )
        }
    }
}


async fn run_command(
    command: ConsoleCommand,
    engine: &Engine,
    queue: &mut Queue,
) -> Result<Flow, PlayerError> {
    match command {
        ConsoleCommand::Play { index } => {
            let track = match index {
                Some( index ) => Some( queue.jump_to( index )? ),
                None => queue.current(),
            };
            engine.play( track ).await?;
        }
        ConsoleCommand::Pause => engine.pause().await?,
        ConsoleCommand::Resume => engine.resume().await?,
        ConsoleCommand::Stop => engine.stop().await?,
        ConsoleCommand::Next => {
            advance( engine, queue ).await?;
        }
        ConsoleCommand::Prev => engine.play( queue.previous() ).await?,
        ConsoleCommand::Seek { position } => engine.seek( position ).await?,
        ConsoleCommand::Volume { percent } => engine.set_volume( f32::from( percent ) / 100.0 ).await?,
        ConsoleCommand::Shuffle => {
            queue.shuffle();
            engine.set_shuffle( true ).await?;
            println!( "Queue shuffled" );
        }
        ConsoleCommand::Unshuffle => {
            queue.unshuffle();
            engine.set_shuffle( false ).await?;
            println!( "Queue order restored" );
        }
        ConsoleCommand::Repeat { mode } => {
            let mode = mode.unwrap_or_else( || queue.repeat().cycle() );
            queue.set_repeat( mode );
            engine.set_repeat( mode ).await?;
            println!( "Repeat: {:?}", mode );
        }
        ConsoleCommand::Queue => print_queue( queue ),
        ConsoleCommand::Status => print_status( engine ),
        ConsoleCommand::Help => println!( "{}", help_text() ),
        ConsoleCommand::Quit => return Ok( Flow::Quit ),
    }
    Ok( Flow::Continue )
}


fn print_queue( queue: &Queue ) {
    let mut out = io::stdout().lock();
    for ( i, track ) in queue.tracks().iter().enumerate() {
        let marker = if i == queue.index() { '>' } else { ' ' };
        let _ = writeln!( out, "{} {:>3}. {}", marker, i + 1, describe( track ) );
    }
}


fn print_status( engine: &Engine ) {
    let state = engine.state();
    let status = match state.status {
        PlaybackStatus::Playing => "Playing",
        PlaybackStatus::Paused => "Paused",
        PlaybackStatus::Stopped => "Stopped",
    };

    match &state.current_track {
        Some( track ) => println!(
            "{}: {} {}/{}  vol {:.0}%  repeat {:?}{}",
            status,
            track.display_name(),
            format_time( state.position ),
            format_time( track.duration ),
            state.volume * 100.0,
            state.repeat,
            if state.shuffle { "  shuffle" } else { "" },
        ),
        None => println!( "{}", status ),
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::time::Duration;

    use cadenza_core::backend::{ SessionClock, SessionNotifier };
    use cadenza_core::{ Backend, DecoderError, PlaybackState, Session, SessionError };


    /// Opens sessions that never make a sound.
    struct Silent;


    struct SilentSession( SessionClock );


    impl Backend for Silent {
        fn open(
            &self,
            _track: &Track,
            _gain: f32,
            _notifier: SessionNotifier,
        ) -> Result<Box<dyn Session>, SessionError> {
            Ok( Box::new( SilentSession( SessionClock::new( 1000 ) ) ) )
        }
    }


    impl Session for SilentSession {
        fn pause( &mut self ) {}
        fn resume( &mut self ) {}
        fn set_gain( &mut self, _gain: f32 ) {}


        fn seek( &mut self, position: Duration ) -> Result<(), DecoderError> {
            self.0.set_position( position );
            Ok(())
        }


        fn clock( &self ) -> SessionClock {
            self.0.clone()
        }


        fn close( &mut self ) {}
    }


    fn track( name: &str ) -> Arc<Track> {
        Arc::new( Track::from_path( format!( "/music/{}.mp3", name ) ) )
    }


    #[tokio::test]
    async fn test_track_end_advances_queue_even_when_observers_lag() {
        let token = CancellationToken::new();
        let ( engine, mut events ) = Engine::spawn( Silent, token.clone() );
        let bus = EventBus::new();
        let _stalled = bus.subscribe_all();

        let a = track( "a" );
        let mut queue = Queue::new();
        queue.set( vec![ Arc::clone( &a ), track( "b" ) ] );

        // Fill the observer so the bus starts dropping everything
        for _ in 0..25 {
            bus.publish( AudioEvent::StateChange( PlaybackState::default() ) );
        }

        let mut failures = 0;
        let done = dispatch( AudioEvent::TrackEnded( a ), &bus, &engine, &mut queue, &mut failures )
            .await
            .unwrap();
        assert!( !done );
        assert_eq!( queue.index(), 1 );

        let started = tokio::time::timeout( Duration::from_secs( 2 ), events.recv() ).await.unwrap();
        match started {
            Some( AudioEvent::TrackStarted( t ) ) => assert_eq!( t.title, "b" ),
            other => panic!( "expected TrackStarted, got {:?}", other ),
        }

        // Past the last entry the queue reports it has run out
        let done = dispatch( AudioEvent::TrackEnded( track( "b" ) ), &bus, &engine, &mut queue, &mut failures )
            .await
            .unwrap();
        assert!( done );
        token.cancel();
    }
}
