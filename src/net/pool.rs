//! Fixed-size upstream connection pool.
//!
//! # Responsibilities
//! - Establish the configured number of upstream connections at startup
//! - Track per-slot availability and hand out slots to new clients
//! - Enforce acquire/release invariants
//!
//! # Design Decisions
//! - Startup is all-or-nothing: one failed connect aborts the process,
//!   a partial pool is never served
//! - Selection is the first AVAILABLE slot in insertion order, a named and
//!   testable policy; callers must not depend on which slot they get
//! - The pool tracks tokens only; the connections themselves are owned by
//!   the registry for their whole lifetime

use std::io;
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::Token;
use thiserror::Error;

/// Availability of one upstream slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Free to be bound to a new client.
    Available,
    /// Bound to exactly one client mapping.
    Unavailable,
}

/// Invariant violations in pool bookkeeping.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The token does not belong to any pool slot.
    #[error("upstream {0:?} is not a pool member")]
    UnknownSlot(Token),

    /// `release` was called on a slot that was already available.
    #[error("upstream {0:?} released while already available")]
    ReleaseWhileAvailable(Token),
}

#[derive(Debug)]
struct Slot {
    token: Token,
    state: SlotState,
}

/// Fixed-capacity allocator over the upstream connections.
///
/// Size is set once during startup registration and only shrinks if a dead
/// upstream cannot be re-established (see [`retire`](Self::retire)).
#[derive(Debug, Default)]
pub struct UpstreamPool {
    slots: Vec<Slot>,
}

impl UpstreamPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a slot for a freshly registered upstream connection.
    pub fn insert(&mut self, token: Token) {
        self.slots.push(Slot {
            token,
            state: SlotState::Available,
        });
    }

    /// Acquire the first available slot in insertion order.
    ///
    /// Returns `None` when the pool is exhausted; admission control is the
    /// caller's decision.
    pub fn acquire(&mut self) -> Option<Token> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.state == SlotState::Available)?;
        slot.state = SlotState::Unavailable;
        Some(slot.token)
    }

    /// Return a slot to the available state.
    pub fn release(&mut self, token: Token) -> Result<(), PoolError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.token == token)
            .ok_or(PoolError::UnknownSlot(token))?;
        if slot.state == SlotState::Available {
            return Err(PoolError::ReleaseWhileAvailable(token));
        }
        slot.state = SlotState::Available;
        Ok(())
    }

    /// Swap a dead upstream's slot for its replacement connection.
    ///
    /// The slot comes back AVAILABLE regardless of its previous state.
    pub fn replace(&mut self, old: Token, new: Token) -> Result<(), PoolError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.token == old)
            .ok_or(PoolError::UnknownSlot(old))?;
        slot.token = new;
        slot.state = SlotState::Available;
        Ok(())
    }

    /// Drop a slot whose upstream could not be re-established.
    pub fn retire(&mut self, token: Token) {
        self.slots.retain(|s| s.token != token);
    }

    /// Whether the token belongs to a pool slot.
    pub fn contains(&self, token: Token) -> bool {
        self.slots.iter().any(|s| s.token == token)
    }

    /// Number of slots currently available.
    pub fn available(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Available)
            .count()
    }

    /// Number of slots currently bound to a client.
    pub fn unavailable(&self) -> usize {
        self.slots.len() - self.available()
    }

    /// Total slot count.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Establish one upstream connection, blocking until connected.
///
/// The stream is switched to non-blocking before it is handed to the poll
/// registry. Used both for eager pool startup and for refilling a slot after
/// an upstream failure.
pub fn connect_upstream(target: SocketAddr) -> io::Result<TcpStream> {
    let stream = std::net::TcpStream::connect(target)?;
    stream.set_nonblocking(true)?;
    let stream = TcpStream::from_std(stream);
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Establish the whole pool eagerly.
///
/// Any single failure is returned as-is so the caller can abort startup;
/// already-established streams are dropped (closed) on the way out.
pub fn connect_pool(target: SocketAddr, size: usize) -> io::Result<Vec<TcpStream>> {
    let mut streams = Vec::with_capacity(size);
    for _ in 0..size {
        streams.push(connect_upstream(target)?);
    }
    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: usize) -> UpstreamPool {
        let mut pool = UpstreamPool::new();
        for i in 0..n {
            pool.insert(Token(i + 1));
        }
        pool
    }

    #[test]
    fn acquire_picks_first_available_in_insertion_order() {
        let mut pool = pool_of(3);
        assert_eq!(pool.acquire(), Some(Token(1)));
        assert_eq!(pool.acquire(), Some(Token(2)));
        pool.release(Token(1)).unwrap();
        // Slot 1 is free again and precedes slot 3 in insertion order.
        assert_eq!(pool.acquire(), Some(Token(1)));
        assert_eq!(pool.acquire(), Some(Token(3)));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = pool_of(2);
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_some());
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn unavailable_never_exceeds_capacity() {
        let mut pool = pool_of(4);
        while pool.acquire().is_some() {}
        assert_eq!(pool.unavailable(), 4);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn release_before_next_acquire_is_observed() {
        let mut pool = pool_of(1);
        let slot = pool.acquire().unwrap();
        assert_eq!(pool.acquire(), None);
        pool.release(slot).unwrap();
        assert_eq!(pool.acquire(), Some(slot));
    }

    #[test]
    fn double_release_is_an_invariant_violation() {
        let mut pool = pool_of(1);
        let slot = pool.acquire().unwrap();
        pool.release(slot).unwrap();
        assert_eq!(
            pool.release(slot),
            Err(PoolError::ReleaseWhileAvailable(slot))
        );
    }

    #[test]
    fn release_of_foreign_token_is_rejected() {
        let mut pool = pool_of(1);
        assert_eq!(
            pool.release(Token(99)),
            Err(PoolError::UnknownSlot(Token(99)))
        );
    }

    #[test]
    fn replace_swaps_token_and_resets_state() {
        let mut pool = pool_of(2);
        let slot = pool.acquire().unwrap();
        pool.replace(slot, Token(7)).unwrap();
        assert!(!pool.contains(slot));
        assert!(pool.contains(Token(7)));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn retire_shrinks_the_pool() {
        let mut pool = pool_of(2);
        pool.retire(Token(1));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.acquire(), Some(Token(2)));
    }
}
