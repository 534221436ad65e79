//! Command-line argument parsing for Cadenza.

use std::path::PathBuf;

use clap::{ ArgAction, Parser, Subcommand };


/// Cadenza - A terminal music player.
#[derive( Parser, Debug )]
#[command( name = "cadenza" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Settings file to use instead of the default location.
    #[arg( long, global = true, value_name = "PATH" )]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg( short, long, global = true, action = ArgAction::Count )]
    pub verbose: u8,

    #[command( subcommand )]
    pub command: Commands,
}


#[derive( Subcommand, Debug )]
pub enum Commands {
    /// Scan directories and list the tracks found.
    Scan {
        /// Directories to scan; defaults to the configured music directories.
        dirs: Vec<PathBuf>,
    },

    /// Queue files, directories or M3U playlists and start playing.
    Play {
        #[arg( required = true )]
        paths: Vec<PathBuf>,

        /// Shuffle the queue before playing.
        #[arg( short, long )]
        shuffle: bool,
    },

    /// List supported audio formats.
    Formats,
}


#[cfg( test )]
mod tests {
    use super::*;
    use clap::CommandFactory;


    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }


    #[test]
    fn test_parse_scan_with_global_flags() {
        let args = Args::try_parse_from( [ "cadenza", "scan", "/music", "-vv", "--config", "/tmp/c.json" ] ).unwrap();
        assert_eq!( args.verbose, 2 );
        assert_eq!( args.config, Some( PathBuf::from( "/tmp/c.json" ) ) );
        match args.command {
            Commands::Scan { dirs } => assert_eq!( dirs, vec![ PathBuf::from( "/music" ) ] ),
            other => panic!( "unexpected command: {:?}", other ),
        }
    }


    #[test]
    fn test_play_requires_paths() {
        assert!( Args::try_parse_from( [ "cadenza", "play" ] ).is_err() );

        let args = Args::try_parse_from( [ "cadenza", "play", "-s", "a.mp3", "list.m3u" ] ).unwrap();
        match args.command {
            Commands::Play { paths, shuffle } => {
                assert!( shuffle );
                assert_eq!( paths.len(), 2 );
            }
            other => panic!( "unexpected command: {:?}", other ),
        }
    }
}
