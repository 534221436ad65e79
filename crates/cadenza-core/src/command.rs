//! Engine command and event protocol.
//!
//! Commands flow from callers into the engine, events flow back out. They are
//! never paired: the engine reacts to commands and publishes events on its own
//! schedule.

use std::sync::Arc;
use std::time::Duration;

use crate::error::PlayerError;
use crate::track::{ PlaybackState, RepeatMode, Track };


/// Commands accepted by the playback engine.
#[derive( Debug, Clone )]
pub enum AudioCommand {
    Play( Arc<Track> ),
    Pause,
    Resume,
    Stop,
    Seek( Duration ),
    SetVolume( f32 ),
    SetRepeat( RepeatMode ),
    SetShuffle( bool ),
}


/// Events published by the playback engine.
#[derive( Debug, Clone )]
pub enum AudioEvent {
    TrackStarted( Arc<Track> ),
    TrackEnded( Arc<Track> ),
    PositionUpdate( Duration ),
    StateChange( PlaybackState ),
    Error( Arc<PlayerError> ),
}


/// Discriminant of an [`AudioEvent`], used for subscriptions.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub enum EventKind {
    TrackStarted,
    TrackEnded,
    PositionUpdate,
    StateChange,
    Error,
}


impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::TrackStarted,
        EventKind::TrackEnded,
        EventKind::PositionUpdate,
        EventKind::StateChange,
        EventKind::Error,
    ];
}


impl AudioEvent {
    pub fn kind( &self ) -> EventKind {
        match self {
            AudioEvent::TrackStarted( _ ) => EventKind::TrackStarted,
            AudioEvent::TrackEnded( _ ) => EventKind::TrackEnded,
            AudioEvent::PositionUpdate( _ ) => EventKind::PositionUpdate,
            AudioEvent::StateChange( _ ) => EventKind::StateChange,
            AudioEvent::Error( _ ) => EventKind::Error,
        }
    }
}
