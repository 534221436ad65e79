//! Interactive console commands.
//!
//! Lines typed while `cadenza play` is running are parsed into
//! [`ConsoleCommand`]s and applied to the engine and queue.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use cadenza_core::RepeatMode;


/// Errors that can occur while parsing a console line.
#[derive( Debug, Error, PartialEq )]
pub enum ConsoleError {
    #[error( "Unknown command: {0}" )]
    Unknown( String ),

    #[error( "Invalid argument: {0}" )]
    InvalidArgument( String ),

    #[error( "Missing argument: {0}" )]
    MissingArgument( String ),
}


/// Parsed console command.
#[derive( Debug, Clone, PartialEq )]
pub enum ConsoleCommand {
    // Playback commands
    Play { index: Option<usize> },
    Pause,
    Resume,
    Stop,
    Next,
    Prev,
    Seek { position: Duration },
    Volume { percent: u8 },

    // Queue commands
    Shuffle,
    Unshuffle,
    Repeat { mode: Option<RepeatMode> },
    Queue,

    Status,
    Help,
    Quit,
}


/// Repeat mode as typed on the console.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
struct RepeatArg( RepeatMode );


impl FromStr for RepeatArg {
    type Err = ConsoleError;


    fn from_str( s: &str ) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Ok( RepeatArg( RepeatMode::None ) ),
            "one" | "1" => Ok( RepeatArg( RepeatMode::One ) ),
            "all" | "2" => Ok( RepeatArg( RepeatMode::All ) ),
            _ => Err( ConsoleError::InvalidArgument(
                format!( "Invalid repeat mode: '{}'. Use 'off', 'one', or 'all'", s )
            )),
        }
    }
}


impl ConsoleCommand {
    /// Parses one console line. A leading `/` is accepted and ignored.
    ///
    /// @param input - The line to parse
    ///
    /// @returns The parsed command or an error
    pub fn parse( input: &str ) -> Result<Self, ConsoleError> {
        let input = input.trim();
        let input = input.strip_prefix( '/' ).unwrap_or( input );
        let mut parts = input.splitn( 2, ' ' );
        let cmd = parts.next().unwrap_or( "" ).to_lowercase();
        let args = parts.next().map( |s| s.trim() ).filter( |s| !s.is_empty() );

        match cmd.as_str() {
            "play" | "p" => {
                // Displayed queue positions start at 1
                let index = match args {
                    Some( n ) => match n.parse::<usize>() {
                        Ok( n ) if n > 0 => Some( n - 1 ),
                        _ => return Err( ConsoleError::InvalidArgument(
                            format!( "Invalid queue position: {}", n )
                        )),
                    },
                    None => None,
                };
                Ok( ConsoleCommand::Play { index } )
            }
            "pause" => Ok( ConsoleCommand::Pause ),
            "resume" | "r" => Ok( ConsoleCommand::Resume ),
            "stop" | "s" => Ok( ConsoleCommand::Stop ),
            "next" | "n" => Ok( ConsoleCommand::Next ),
            "prev" | "previous" | "b" => Ok( ConsoleCommand::Prev ),
            "seek" => {
                let time = args
                    .ok_or_else( || ConsoleError::MissingArgument( "position".into() ) )?;
                Ok( ConsoleCommand::Seek { position: parse_time( time )? } )
            }
            "vol" | "volume" | "v" => {
                let level = args
                    .ok_or_else( || ConsoleError::MissingArgument( "volume level".into() ) )?;
                let percent: u8 = level.parse()
                    .ok()
                    .filter( |p| *p <= 100 )
                    .ok_or_else( || ConsoleError::InvalidArgument(
                        format!( "Volume must be 0-100, got: {}", level )
                    ))?;
                Ok( ConsoleCommand::Volume { percent } )
            }
            "shuffle" | "sh" => Ok( ConsoleCommand::Shuffle ),
            "unshuffle" => Ok( ConsoleCommand::Unshuffle ),
            "repeat" | "rep" => {
                let mode = args.map( |s| s.parse::<RepeatArg>() ).transpose()?;
                Ok( ConsoleCommand::Repeat { mode: mode.map( |m| m.0 ) } )
            }
            "queue" | "q" | "ls" => Ok( ConsoleCommand::Queue ),
            "status" | "st" => Ok( ConsoleCommand::Status ),
            "help" | "h" | "?" => Ok( ConsoleCommand::Help ),
            "quit" | "exit" => Ok( ConsoleCommand::Quit ),
            "" => Err( ConsoleError::MissingArgument( "command".into() ) ),
            _ => Err( ConsoleError::Unknown( cmd ) ),
        }
    }
}


/// Parses a time string like "1:30" or "90" into a Duration.
fn parse_time( s: &str ) -> Result<Duration, ConsoleError> {
    let s = s.trim();

    if let Some(( min, sec )) = s.split_once( ':' ) {
        let minutes: u64 = min.parse()
            .map_err( |_| ConsoleError::InvalidArgument( format!( "Invalid minutes: {}", min ) ) )?;
        let seconds: u64 = sec.parse()
            .map_err( |_| ConsoleError::InvalidArgument( format!( "Invalid seconds: {}", sec ) ) )?;
        Ok( Duration::from_secs( minutes * 60 + seconds ) )
    } else {
        let seconds: u64 = s.parse()
            .map_err( |_| ConsoleError::InvalidArgument( format!( "Invalid time: {}", s ) ) )?;
        Ok( Duration::from_secs( seconds ) )
    }
}


/// Formats a duration as M:SS.
pub fn format_time( d: Duration ) -> String {
    let secs = d.as_secs();
    format!( "{}:{:02}", secs / 60, secs % 60 )
}


/// Returns help text listing all console commands.
pub fn help_text() -> &'static str {
    r#"Playback:
  play [n]        Play queue entry n, or the current entry
  pause           Pause playback
  resume          Resume playback
  stop            Stop playback
  next / prev     Skip forward or back
  seek <time>     Seek to position (e.g., 1:30 or 90)
  vol <0-100>     Set volume

Queue:
  shuffle         Shuffle the queue
  unshuffle       Restore the original order
  repeat [mode]   Set repeat (off/one/all), or cycle it
  queue           List queued tracks

Other:
  status          Show what is playing
  help            Show this help
  quit            Exit"#
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_simple_commands() {
        assert_eq!( ConsoleCommand::parse( "pause" ), Ok( ConsoleCommand::Pause ) );
        assert_eq!( ConsoleCommand::parse( "  NEXT " ), Ok( ConsoleCommand::Next ) );
        assert_eq!( ConsoleCommand::parse( "/prev" ), Ok( ConsoleCommand::Prev ) );
        assert_eq!( ConsoleCommand::parse( "q" ), Ok( ConsoleCommand::Queue ) );
        assert_eq!( ConsoleCommand::parse( "exit" ), Ok( ConsoleCommand::Quit ) );
    }


    #[test]
    fn test_parse_play_position() {
        assert_eq!( ConsoleCommand::parse( "play" ), Ok( ConsoleCommand::Play { index: None } ) );
        assert_eq!( ConsoleCommand::parse( "play 3" ), Ok( ConsoleCommand::Play { index: Some( 2 ) } ) );
        assert!( matches!( ConsoleCommand::parse( "play 0" ), Err( ConsoleError::InvalidArgument( _ ) ) ) );
        assert!( matches!( ConsoleCommand::parse( "play x" ), Err( ConsoleError::InvalidArgument( _ ) ) ) );
    }


    #[test]
    fn test_parse_seek() {
        assert_eq!(
            ConsoleCommand::parse( "seek 1:30" ),
            Ok( ConsoleCommand::Seek { position: Duration::from_secs( 90 ) } )
        );
        assert_eq!(
            ConsoleCommand::parse( "seek 45" ),
            Ok( ConsoleCommand::Seek { position: Duration::from_secs( 45 ) } )
        );
        assert_eq!( ConsoleCommand::parse( "seek" ), Err( ConsoleError::MissingArgument( "position".into() ) ) );
        assert!( ConsoleCommand::parse( "seek a:10" ).is_err() );
    }


    #[test]
    fn test_parse_volume() {
        assert_eq!( ConsoleCommand::parse( "vol 80" ), Ok( ConsoleCommand::Volume { percent: 80 } ) );
        assert!( matches!( ConsoleCommand::parse( "vol 101" ), Err( ConsoleError::InvalidArgument( _ ) ) ) );
        assert!( matches!( ConsoleCommand::parse( "vol -1" ), Err( ConsoleError::InvalidArgument( _ ) ) ) );
    }


    #[test]
    fn test_parse_repeat() {
        assert_eq!( ConsoleCommand::parse( "repeat" ), Ok( ConsoleCommand::Repeat { mode: None } ) );
        assert_eq!(
            ConsoleCommand::parse( "repeat all" ),
            Ok( ConsoleCommand::Repeat { mode: Some( RepeatMode::All ) } )
        );
        assert_eq!(
            ConsoleCommand::parse( "rep off" ),
            Ok( ConsoleCommand::Repeat { mode: Some( RepeatMode::None ) } )
        );
        assert!( ConsoleCommand::parse( "repeat twice" ).is_err() );
    }


    #[test]
    fn test_parse_unknown() {
        assert_eq!( ConsoleCommand::parse( "dance" ), Err( ConsoleError::Unknown( "dance".into() ) ) );
        assert!( matches!( ConsoleCommand::parse( "" ), Err( ConsoleError::MissingArgument( _ ) ) ) );
    }


    #[test]
    fn test_format_time() {
        assert_eq!( format_time( Duration::from_secs( 0 ) ), "0:00" );
        assert_eq!( format_time( Duration::from_secs( 125 ) ), "2:05" );
    }
}
