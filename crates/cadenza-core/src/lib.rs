//! Cadenza Core - Music playback engine
//!
//! This crate provides the core functionality of the player: decoding and
//! output, the playback engine, the library scanner and index, the playback
//! queue, playlists and event distribution.

pub mod backend;
pub mod command;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod events;
pub mod library;
pub mod metadata;
pub mod output;
pub mod playlist;
pub mod queue;
pub mod scanner;
pub mod track;

pub use backend::{ Backend, DeviceBackend, Session, SessionError };
pub use command::{ AudioCommand, AudioEvent, EventKind };
pub use decoder::{ is_supported, supported_formats, DecoderError };
pub use engine::Engine;
pub use error::{ PlayerError, ScanError };
pub use events::{ EventBus, Subscription, SubscriptionId };
pub use library::{ Library, ScanReport };
pub use metadata::{ MetadataError, MetadataExtractor, TagReader };
pub use playlist::{ Playlist, PlaylistError, PlaylistManager };
pub use queue::Queue;
pub use scanner::Scanner;
pub use track::{ PlaybackState, PlaybackStatus, RepeatMode, Track, TrackId };
