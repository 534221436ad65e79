//! Application settings management
//!
//! Settings live in a JSON file under the user's config directory. A
//! missing file is created with defaults; a broken one is reported and
//! ignored.

use std::fs;
use std::path::{ Path, PathBuf };

use serde::{ Deserialize, Serialize };

use cadenza_core::scanner::DEFAULT_WORKERS;
use cadenza_core::track::DEFAULT_VOLUME;


/// Environment variable that overrides the settings file location.
pub const CONFIG_ENV: &str = "CADENZA_CONFIG";


/// Application settings.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct Settings {
    /// Directories scanned when none are given on the command line
    pub music_directories: Vec<PathBuf>,

    /// Startup volume on the 0.0 to 1.0 scale
    pub default_volume: f32,

    /// Number of concurrent metadata readers
    pub scan_workers: usize,
}


impl Default for Settings {
    fn default() -> Self {
        Self {
            music_directories: dirs::audio_dir().into_iter().collect(),
            default_volume: DEFAULT_VOLUME,
            scan_workers: DEFAULT_WORKERS,
        }
    }
}


impl Settings {
    /// Resolves the settings file: explicit path, then `CADENZA_CONFIG`,
    /// then the platform config directory.
    pub fn path( explicit: Option<&Path> ) -> Option<PathBuf> {
        if let Some( path ) = explicit {
            return Some( path.to_path_buf() );
        }
        if let Some( path ) = std::env::var_os( CONFIG_ENV ).filter( |v| !v.is_empty() ) {
            return Some( PathBuf::from( path ) );
        }
        dirs::config_dir().map( |p| p.join( "cadenza" ).join( "settings.json" ) )
    }


    /// Loads settings from `path`, falling back to defaults.
    pub fn load( path: Option<&Path> ) -> Self {
        let Some( path ) = path else {
            return Self::default();
        };

        if !path.exists() {
            let settings = Self::default();
            settings.save( path );
            return settings;
        }

        let settings = match fs::read_to_string( path ) {
            Ok( contents ) => match serde_json::from_str::<Self>( &contents ) {
                Ok( settings ) => settings,
                Err( e ) => {
                    tracing::warn!( "Invalid settings in {:?}, using defaults: {}", path, e );
                    Self::default()
                }
            },
            Err( e ) => {
                tracing::warn!( "Failed to read settings: {}", e );
                Self::default()
            }
        };

        settings.normalized()
    }


    /// Clamps out-of-range values.
    fn normalized( mut self ) -> Self {
        self.default_volume = if self.default_volume.is_nan() {
            DEFAULT_VOLUME
        } else {
            self.default_volume.clamp( 0.0, 1.0 )
        };
        if self.scan_workers == 0 {
            self.scan_workers = DEFAULT_WORKERS;
        }
        self
    }


    /// Saves settings to disk.
    pub fn save( &self, path: &Path ) {
        // Create parent directory if needed
        if let Some( parent ) = path.parent() {
            if !parent.exists() {
                if let Err( e ) = fs::create_dir_all( parent ) {
                    tracing::warn!( "Failed to create settings directory: {}", e );
                    return;
                }
            }
        }

        match serde_json::to_string_pretty( self ) {
            Ok( json ) => {
                if let Err( e ) = fs::write( path, json ) {
                    tracing::warn!( "Failed to save settings: {}", e );
                }
            }
            Err( e ) => {
                tracing::warn!( "Failed to serialize settings: {}", e );
            }
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "nested" ).join( "settings.json" );

        let settings = Settings::load( Some( &path ) );
        assert_eq!( settings, Settings::default() );
        assert!( path.exists() );

        let reloaded = Settings::load( Some( &path ) );
        assert_eq!( reloaded, settings );
    }


    #[test]
    fn test_partial_file_fills_defaults_and_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "settings.json" );
        fs::write( &path, r#"{ "default_volume": 3.5, "scan_workers": 0, "music_directories": [ "/srv/music" ] }"# ).unwrap();

        let settings = Settings::load( Some( &path ) );
        assert_eq!( settings.default_volume, 1.0 );
        assert_eq!( settings.scan_workers, DEFAULT_WORKERS );
        assert_eq!( settings.music_directories, vec![ PathBuf::from( "/srv/music" ) ] );
    }


    #[test]
    fn test_invalid_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "settings.json" );
        fs::write( &path, "{ not json" ).unwrap();

        assert_eq!( Settings::load( Some( &path ) ), Settings::default() );
        // The broken file is left for the user to fix
        assert_eq!( fs::read_to_string( &path ).unwrap(), "{ not json" );
    }


    #[test]
    fn test_explicit_path_wins() {
        let explicit = PathBuf::from( "/tmp/explicit.json" );
        assert_eq!( Settings::path( Some( &explicit ) ), Some( explicit ) );
    }
}
