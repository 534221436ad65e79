//! Playback queue
//!
//! An ordered list of tracks with a cursor, a repeat mode and an optional
//! shuffled view. The queue is a plain value; callers that share it wrap it
//! in `Arc<RwLock<Queue>>`.

use std::sync::Arc;

use rand::Rng;

use crate::error::PlayerError;
use crate::track::{ RepeatMode, Track };


/// Pre-shuffle ordering, kept until [`Queue::unshuffle`].
///
/// `tracks[ i ]` in the queue is always `original[ order[ i ] ]`.
#[derive( Debug, Clone )]
struct Shuffled {
    original: Vec<Arc<Track>>,
    order: Vec<usize>,
}


#[derive( Debug, Clone, Default )]
pub struct Queue {
    tracks: Vec<Arc<Track>>,
    index: usize,
    repeat: RepeatMode,
    shuffled: Option<Shuffled>,
    /// Set when `next()` ran off the end with [`RepeatMode::None`].
    exhausted: bool,
}


impl Queue {
    pub fn new() -> Self {
        Self::default()
    }


    /// Replaces the contents and resets the cursor, dropping any shuffle.
    pub fn set( &mut self, tracks: Vec<Arc<Track>> ) {
        self.tracks = tracks;
        self.index = 0;
        self.shuffled = None;
        self.exhausted = false;
    }


    /// Appends tracks to the end of the queue.
    pub fn add( &mut self, tracks: impl IntoIterator<Item = Arc<Track>> ) {
        for track in tracks {
            if let Some( shuffled ) = self.shuffled.as_mut() {
                shuffled.order.push( shuffled.original.len() );
                shuffled.original.push( Arc::clone( &track ) );
            }
            self.tracks.push( track );
        }
    }


    pub fn clear( &mut self ) {
        self.set( Vec::new() );
    }


    /// Removes the entry at `index`.
    ///
    /// The cursor keeps pointing at the same track when an earlier entry is
    /// removed, and moves to the new last entry when it falls off the end.
    pub fn remove( &mut self, index: usize ) -> Result<Arc<Track>, PlayerError> {
        if index >= self.tracks.len() {
            return Err( PlayerError::IndexOutOfBounds { index, len: self.tracks.len() } );
        }

        let removed = self.tracks.remove( index );
        self.exhausted = false;

        if let Some( shuffled ) = self.shuffled.as_mut() {
            let slot = shuffled.order.remove( index );
            shuffled.original.remove( slot );
            for o in shuffled.order.iter_mut() {
                if *o > slot {
                    *o -= 1;
                }
            }
        }

        if self.tracks.is_empty() {
            self.index = 0;
        } else if self.index > index {
            self.index -= 1;
        } else if self.index >= self.tracks.len() {
            self.index = self.tracks.len() - 1;
        }

        Ok( removed )
    }


    pub fn current( &self ) -> Option<Arc<Track>> {
        self.tracks.get( self.index ).cloned()
    }


    /// Advances according to the repeat mode.
    ///
    /// With [`RepeatMode::None`] this returns `None` at the last entry and
    /// leaves the cursor where it is.
    pub fn next( &mut self ) -> Option<Arc<Track>> {
        if self.tracks.is_empty() {
            return None;
        }
        self.exhausted = false;

        match self.repeat {
            RepeatMode::One => {}
            RepeatMode::All => {
                self.index = ( self.index + 1 ) % self.tracks.len();
            }
            RepeatMode::None => {
                if self.index + 1 >= self.tracks.len() {
                    self.exhausted = true;
                    return None;
                }
                self.index += 1;
            }
        }

        self.current()
    }


    /// Steps back according to the repeat mode.
    ///
    /// With [`RepeatMode::None`] the cursor stops at the first entry and that
    /// entry is returned again. Right after `next()` has run off the end, the
    /// first step back returns the last entry without moving.
    pub fn previous( &mut self ) -> Option<Arc<Track>> {
        if self.tracks.is_empty() {
            return None;
        }
        let exhausted = std::mem::take( &mut self.exhausted );

        match self.repeat {
            RepeatMode::One => {}
            RepeatMode::All => {
                let len = self.tracks.len();
                self.index = ( self.index + len - 1 ) % len;
            }
            RepeatMode::None if exhausted => {}
            RepeatMode::None => {
                self.index = self.index.saturating_sub( 1 );
            }
        }

        self.current()
    }


    pub fn has_next( &self ) -> bool {
        match self.repeat {
            RepeatMode::None => self.index + 1 < self.tracks.len(),
            _ => !self.tracks.is_empty(),
        }
    }


    pub fn has_previous( &self ) -> bool {
        match self.repeat {
            RepeatMode::None => self.index > 0 || self.exhausted,
            _ => !self.tracks.is_empty(),
        }
    }


    /// Moves the cursor to `index` and returns the track there.
    pub fn jump_to( &mut self, index: usize ) -> Result<Arc<Track>, PlayerError> {
        match self.tracks.get( index ) {
            Some( track ) => {
                self.index = index;
                self.exhausted = false;
                Ok( Arc::clone( track ) )
            }
            None => Err( PlayerError::IndexOutOfBounds { index, len: self.tracks.len() } ),
        }
    }


    /// Shuffles with the thread-local RNG. See [`Queue::shuffle_with`].
    pub fn shuffle( &mut self ) {
        self.shuffle_with( &mut rand::thread_rng() );
    }


    /// Shuffles the queue, putting the current track first.
    ///
    /// The order from before the first shuffle is kept until
    /// [`Queue::unshuffle`], however many times the queue is reshuffled.
    pub fn shuffle_with<R: Rng + ?Sized>( &mut self, rng: &mut R ) {
        let len = self.tracks.len();
        if len <= 1 {
            return;
        }

        let shuffled = self.shuffled.get_or_insert_with( || Shuffled {
            original: self.tracks.clone(),
            order: ( 0..len ).collect(),
        });

        let mut order = shuffled.order.clone();
        let current = order[ self.index ];

        // Fisher-Yates
        for i in ( 1..len ).rev() {
            let j = rng.gen_range( 0..=i );
            order.swap( i, j );
        }

        if let Some( pos ) = order.iter().position( |&o| o == current ) {
            order.swap( 0, pos );
        }

        self.tracks = order.iter().map( |&o| Arc::clone( &shuffled.original[ o ] ) ).collect();
        shuffled.order = order;
        self.index = 0;
        self.exhausted = false;
    }


    /// Restores the pre-shuffle order, keeping the cursor on the same track.
    pub fn unshuffle( &mut self ) {
        let Some( shuffled ) = self.shuffled.take() else {
            return;
        };

        if let Some( &slot ) = shuffled.order.get( self.index ) {
            self.index = slot;
        }
        self.tracks = shuffled.original;
        self.exhausted = false;
    }


    pub fn is_shuffled( &self ) -> bool {
        self.shuffled.is_some()
    }


    pub fn index( &self ) -> usize {
        self.index
    }


    pub fn len( &self ) -> usize {
        self.tracks.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.tracks.is_empty()
    }


    pub fn tracks( &self ) -> &[Arc<Track>] {
        &self.tracks
    }


    pub fn repeat( &self ) -> RepeatMode {
        self.repeat
    }


    pub fn set_repeat( &mut self, mode: RepeatMode ) {
        self.repeat = mode;
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;


    fn tracks( names: &[&str] ) -> Vec<Arc<Track>> {
        names.iter()
            .map( |n| Arc::new( Track::from_path( format!( "/music/{}.mp3", n ) ) ) )
            .collect()
    }


    fn titles( queue: &Queue ) -> Vec<String> {
        queue.tracks().iter().map( |t| t.title.clone() ).collect()
    }


    fn title( track: Option<Arc<Track>> ) -> Option<String> {
        track.map( |t| t.title.clone() )
    }


    #[test]
    fn test_repeat_none_walk() {
        let mut queue = Queue::new();
        queue.set( tracks( &[ "A", "B", "C" ] ) );

        assert_eq!( title( queue.current() ).as_deref(), Some( "A" ) );
        assert_eq!( title( queue.next() ).as_deref(), Some( "B" ) );
        assert_eq!( title( queue.next() ).as_deref(), Some( "C" ) );
        assert_eq!( title( queue.next() ), None );
        assert_eq!( queue.index(), 2 );
        assert_eq!( title( queue.previous() ).as_deref(), Some( "C" ) );
        assert_eq!( queue.index(), 2 );
        assert_eq!( title( queue.previous() ).as_deref(), Some( "B" ) );
        assert_eq!( title( queue.previous() ).as_deref(), Some( "A" ) );
        assert_eq!( title( queue.previous() ).as_deref(), Some( "A" ) );
        assert_eq!( queue.index(), 0 );
    }


    #[test]
    fn test_running_off_the_end_is_forgotten_after_a_move() {
        let mut queue = Queue::new();
        queue.set( tracks( &[ "A", "B", "C" ] ) );
        queue.jump_to( 2 ).unwrap();

        assert_eq!( title( queue.next() ), None );
        assert!( queue.has_previous() );
        queue.jump_to( 2 ).unwrap();
        assert_eq!( title( queue.previous() ).as_deref(), Some( "B" ) );

        // A repeated None keeps the first step back on the last entry
        queue.jump_to( 2 ).unwrap();
        assert_eq!( title( queue.next() ), None );
        assert_eq!( title( queue.next() ), None );
        assert_eq!( title( queue.previous() ).as_deref(), Some( "C" ) );
        assert_eq!( title( queue.previous() ).as_deref(), Some( "B" ) );
    }


    #[test]
    fn test_repeat_one_never_moves() {
        let mut queue = Queue::new();
        queue.set( tracks( &[ "A", "B", "C" ] ) );
        queue.jump_to( 1 ).unwrap();
        queue.set_repeat( RepeatMode::One );

        for _ in 0..4 {
            assert!( Arc::ptr_eq( &queue.next().unwrap(), &queue.current().unwrap() ) );
            assert!( Arc::ptr_eq( &queue.previous().unwrap(), &queue.current().unwrap() ) );
            assert_eq!( queue.index(), 1 );
        }
    }


    #[test]
    fn test_repeat_all_wraps() {
        let mut queue = Queue::new();
        queue.set( tracks( &[ "A", "B", "C", "D" ] ) );
        queue.jump_to( 2 ).unwrap();
        queue.set_repeat( RepeatMode::All );
        let start = queue.current().unwrap();

        for _ in 0..queue.len() {
            queue.next();
        }
        assert!( Arc::ptr_eq( &queue.current().unwrap(), &start ) );

        queue.jump_to( 0 ).unwrap();
        assert_eq!( title( queue.previous() ).as_deref(), Some( "D" ) );
    }


    #[test]
    fn test_has_next_and_previous() {
        let mut queue = Queue::new();
        assert!( !queue.has_next() );
        assert!( !queue.has_previous() );

        queue.set( tracks( &[ "A", "B" ] ) );
        assert!( queue.has_next() );
        assert!( !queue.has_previous() );

        queue.next();
        assert!( !queue.has_next() );
        assert!( queue.has_previous() );

        queue.set_repeat( RepeatMode::All );
        assert!( queue.has_next() );
    }


    #[test]
    fn test_empty_queue() {
        let mut queue = Queue::new();
        assert!( queue.current().is_none() );
        assert!( queue.next().is_none() );
        assert!( queue.previous().is_none() );
        assert!( matches!( queue.jump_to( 0 ), Err( PlayerError::IndexOutOfBounds { index: 0, len: 0 } ) ) );
    }


    #[test]
    fn test_jump_to_out_of_bounds() {
        let mut queue = Queue::new();
        queue.set( tracks( &[ "A", "B" ] ) );
        queue.jump_to( 1 ).unwrap();

        assert!( matches!( queue.jump_to( 2 ), Err( PlayerError::IndexOutOfBounds { index: 2, len: 2 } ) ) );
        assert_eq!( queue.index(), 1 );
    }


    #[test]
    fn test_remove_adjusts_cursor() {
        let mut queue = Queue::new();
        queue.set( tracks( &[ "A", "B", "C", "D" ] ) );

        // Before the cursor: cursor follows its track
        queue.jump_to( 2 ).unwrap();
        queue.remove( 0 ).unwrap();
        assert_eq!( queue.index(), 1 );
        assert_eq!( title( queue.current() ).as_deref(), Some( "C" ) );

        // At the cursor, with tracks after it: the next one slides in
        queue.remove( 1 ).unwrap();
        assert_eq!( title( queue.current() ).as_deref(), Some( "D" ) );

        // At the cursor, last entry: clamp
        queue.remove( 1 ).unwrap();
        assert_eq!( queue.index(), 0 );
        assert_eq!( title( queue.current() ).as_deref(), Some( "B" ) );

        queue.remove( 0 ).unwrap();
        assert!( queue.is_empty() );
        assert_eq!( queue.index(), 0 );
        assert!( matches!( queue.remove( 0 ), Err( PlayerError::IndexOutOfBounds { index: 0, len: 0 } ) ) );
    }


    #[test]
    fn test_shuffle_then_unshuffle_restores_order() {
        let mut queue = Queue::new();
        queue.set( tracks( &[ "A", "B", "C", "D", "E", "F" ] ) );
        queue.jump_to( 3 ).unwrap();
        let before = titles( &queue );
        let current = queue.current().unwrap();

        let mut rng = StdRng::seed_from_u64( 7 );
        queue.shuffle_with( &mut rng );
        assert!( queue.is_shuffled() );
        assert_eq!( queue.index(), 0 );
        assert!( Arc::ptr_eq( &queue.current().unwrap(), &current ) );

        let mut sorted = titles( &queue );
        sorted.sort();
        assert_eq!( sorted, before );

        // Reshuffling keeps the original order
        queue.next();
        queue.shuffle_with( &mut rng );

        queue.unshuffle();
        assert!( !queue.is_shuffled() );
        assert_eq!( titles( &queue ), before );
    }


    #[test]
    fn test_unshuffle_keeps_cursor_on_track() {
        let mut queue = Queue::new();
        queue.set( tracks( &[ "A", "B", "C", "D", "E" ] ) );
        queue.shuffle_with( &mut StdRng::seed_from_u64( 1 ) );
        queue.jump_to( 3 ).unwrap();
        let current = queue.current().unwrap();

        queue.unshuffle();
        assert!( Arc::ptr_eq( &queue.current().unwrap(), &current ) );
    }


    #[test]
    fn test_shuffle_short_queue_is_noop() {
        let mut queue = Queue::new();
        queue.set( tracks( &[ "A" ] ) );
        queue.shuffle();
        assert!( !queue.is_shuffled() );
        assert_eq!( titles( &queue ), vec![ "A" ] );
    }


    #[test]
    fn test_changes_while_shuffled_survive_unshuffle() {
        let mut queue = Queue::new();
        queue.set( tracks( &[ "A", "B", "C", "D" ] ) );
        queue.shuffle_with( &mut StdRng::seed_from_u64( 3 ) );

        queue.add( tracks( &[ "E" ] ) );
        assert_eq!( title( queue.tracks().last().cloned() ).as_deref(), Some( "E" ) );

        let b = queue.tracks().iter().position( |t| t.title == "B" ).unwrap();
        queue.remove( b ).unwrap();

        queue.unshuffle();
        assert_eq!( titles( &queue ), vec![ "A", "C", "D", "E" ] );
    }


    #[test]
    fn test_set_clears_shuffle() {
        let mut queue = Queue::new();
        queue.set( tracks( &[ "A", "B", "C" ] ) );
        queue.shuffle();
        queue.set( tracks( &[ "X", "Y" ] ) );

        assert!( !queue.is_shuffled() );
        queue.unshuffle();
        assert_eq!( titles( &queue ), vec![ "X", "Y" ] );
    }
}
