//! Event fan-out
//!
//! Distributes engine events to any number of subscribers, each interested
//! in some set of [`EventKind`]s. Publishing never blocks: a subscriber whose
//! buffer is full misses the event.

use std::sync::{ PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard };

use tokio::sync::mpsc::{ self, error::TryRecvError, error::TrySendError };

use crate::command::{ AudioEvent, EventKind };


const KIND_BUFFER: usize = 10;
const ALL_BUFFER: usize = 20;


#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub struct SubscriptionId( u64 );


/// Receiving end of a bus subscription.
#[derive( Debug )]
pub struct Subscription {
    id: SubscriptionId,
    events: mpsc::Receiver<AudioEvent>,
}


impl Subscription {
    pub fn id( &self ) -> SubscriptionId {
        self.id
    }


    /// Waits for the next event. Returns None once unsubscribed or closed.
    pub async fn recv( &mut self ) -> Option<AudioEvent> {
        self.events.recv().await
    }


    pub fn try_recv( &mut self ) -> Result<AudioEvent, TryRecvError> {
        self.events.try_recv()
    }
}


struct Subscriber {
    id: SubscriptionId,
    kinds: Vec<EventKind>,
    tx: mpsc::Sender<AudioEvent>,
}


#[derive( Default )]
struct Subscribers {
    list: Vec<Subscriber>,
    next_id: u64,
    closed: bool,
}


/// Publish/subscribe hub for [`AudioEvent`]s.
#[derive( Default )]
pub struct EventBus {
    inner: RwLock<Subscribers>,
}


impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }


    fn read( &self ) -> RwLockReadGuard<'_, Subscribers> {
        self.inner.read().unwrap_or_else( PoisonError::into_inner )
    }


    fn write( &self ) -> RwLockWriteGuard<'_, Subscribers> {
        self.inner.write().unwrap_or_else( PoisonError::into_inner )
    }


    fn add( &self, kinds: Vec<EventKind>, capacity: usize ) -> Subscription {
        let ( tx, rx ) = mpsc::channel( capacity );
        let mut inner = self.write();

        inner.next_id += 1;
        let id = SubscriptionId( inner.next_id );

        // A closed bus hands out subscriptions that are already finished
        if !inner.closed {
            inner.list.push( Subscriber { id, kinds, tx } );
        }

        Subscription { id, events: rx }
    }


    /// Subscribes to a single kind of event.
    pub fn subscribe( &self, kind: EventKind ) -> Subscription {
        self.add( vec![ kind ], KIND_BUFFER )
    }


    /// Subscribes to every kind of event.
    pub fn subscribe_all( &self ) -> Subscription {
        self.add( EventKind::ALL.to_vec(), ALL_BUFFER )
    }


    /// Delivers an event to every interested subscriber without waiting.
    pub fn publish( &self, event: AudioEvent ) {
        let kind = event.kind();
        let inner = self.read();

        for sub in inner.list.iter().filter( |s| s.kinds.contains( &kind ) ) {
            match sub.tx.try_send( event.clone() ) {
                Ok(()) => {}
                Err( TrySendError::Full( _ ) ) => {
                    tracing::debug!( "Subscriber {:?} is full, dropping {:?} event", sub.id, kind );
                }
                Err( TrySendError::Closed( _ ) ) => {}
            }
        }
    }


    /// Removes a subscription; its receiver then runs dry and ends.
    pub fn unsubscribe( &self, id: SubscriptionId ) {
        self.write().list.retain( |s| s.id != id );
    }


    /// Ends every subscription. Later subscriptions end immediately.
    pub fn close( &self ) {
        let mut inner = self.write();
        inner.closed = true;
        inner.list.clear();
    }


    pub fn subscriber_count( &self ) -> usize {
        self.read().list.len()
    }


    /// Publishes everything from an engine event stream, then closes the bus
    /// when that stream ends.
    pub async fn forward( &self, mut events: mpsc::Receiver<AudioEvent> ) {
        while let Some( event ) = events.recv().await {
            self.publish( event );
        }
        tracing::debug!( "Event stream ended, closing bus" );
        self.close();
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::track::{ PlaybackState, Track };


    fn started() -> AudioEvent {
        AudioEvent::TrackStarted( Arc::new( Track::from_path( "/m/a.mp3" ) ) )
    }


    fn position( secs: u64 ) -> AudioEvent {
        AudioEvent::PositionUpdate( Duration::from_secs( secs ) )
    }


    #[test]
    fn test_delivers_only_subscribed_kinds() {
        let bus = EventBus::new();
        let mut positions = bus.subscribe( EventKind::PositionUpdate );
        let mut everything = bus.subscribe_all();

        bus.publish( started() );
        bus.publish( position( 3 ) );
        bus.publish( AudioEvent::StateChange( PlaybackState::default() ) );

        assert!( matches!( positions.try_recv(), Ok( AudioEvent::PositionUpdate( d ) ) if d.as_secs() == 3 ) );
        assert!( matches!( positions.try_recv(), Err( TryRecvError::Empty ) ) );

        let kinds: Vec<_> = std::iter::from_fn( || everything.try_recv().ok() ).map( |e| e.kind() ).collect();
        assert_eq!( kinds, vec![ EventKind::TrackStarted, EventKind::PositionUpdate, EventKind::StateChange ] );
    }


    #[test]
    fn test_full_subscriber_drops_events() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe( EventKind::PositionUpdate );

        for i in 0..15 {
            bus.publish( position( i ) );
        }

        let received = std::iter::from_fn( || slow.try_recv().ok() ).count();
        assert_eq!( received, KIND_BUFFER );
    }


    #[test]
    fn test_unsubscribe_ends_subscription() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe( EventKind::TrackStarted );
        let mut other = bus.subscribe( EventKind::TrackStarted );

        bus.unsubscribe( sub.id() );
        bus.publish( started() );

        assert!( matches!( sub.try_recv(), Err( TryRecvError::Disconnected ) ) );
        assert!( other.try_recv().is_ok() );
        assert_eq!( bus.subscriber_count(), 1 );
    }


    #[test]
    fn test_close_ends_all_subscriptions() {
        let bus = EventBus::new();
        let mut a = bus.subscribe_all();
        bus.close();

        assert!( matches!( a.try_recv(), Err( TryRecvError::Disconnected ) ) );

        let mut late = bus.subscribe( EventKind::Error );
        assert!( matches!( late.try_recv(), Err( TryRecvError::Disconnected ) ) );
    }


    #[tokio::test]
    async fn test_forward_publishes_then_closes() {
        let bus = Arc::new( EventBus::new() );
        let mut sub = bus.subscribe( EventKind::PositionUpdate );
        let ( tx, rx ) = mpsc::channel( 4 );

        let forwarding = tokio::spawn( {
            let bus = Arc::clone( &bus );
            async move { bus.forward( rx ).await }
        });

        tx.send( position( 1 ) ).await.unwrap();
        tx.send( started() ).await.unwrap();
        drop( tx );
        forwarding.await.unwrap();

        assert!( matches!( sub.recv().await, Some( AudioEvent::PositionUpdate( _ ) ) ) );
        assert!( sub.recv().await.is_none() );
    }
}
