//! Connection registry: roles, mappings, and per-socket transfer state.
//!
//! # Responsibilities
//! - Own every live connection for its whole lifetime
//! - Track the bidirectional client↔upstream mapping per exchange
//! - Hold the per-destination message accumulator and outbound buffer
//! - Allocate poll tokens
//!
//! # Design Decisions
//! - One owned struct threaded through the reactor; no global socket maps
//! - A client participates in at most one mapping, enforced on bind
//! - Interest flags live on the connection so the reactor can recompute
//!   poll registration from state instead of tracking it ad hoc

use std::collections::HashMap;
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::Token;

use crate::http::HttpMessage;

/// Role of a tracked socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Inbound connection from a downstream client.
    Client,
    /// Pooled outbound connection to the backend target.
    Upstream,
}

/// A serialized message being drained to its destination.
///
/// Kept across iterations when a write returns `WouldBlock` part-way through.
#[derive(Debug)]
pub struct Outbound {
    buf: Vec<u8>,
    written: usize,
}

impl Outbound {
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf, written: 0 }
    }

    /// Bytes still to be written.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.written..]
    }

    /// Record `n` bytes as written.
    pub fn advance(&mut self, n: usize) {
        self.written = (self.written + n).min(self.buf.len());
    }

    pub fn is_drained(&self) -> bool {
        self.written >= self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// One tracked socket and its transfer state.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub role: Role,
    pub peer: SocketAddr,
    /// Message being assembled with this socket as its destination.
    pub assembler: Option<HttpMessage>,
    /// Serialized message currently draining to this socket.
    pub outbound: Option<Outbound>,
    /// Read interest; suspended while the destination holds an undelivered
    /// complete message.
    pub wants_read: bool,
    /// Write interest; armed only while a complete message is pending.
    pub wants_write: bool,
    /// Whether the stream is currently registered with the poll.
    pub registered: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, role: Role, peer: SocketAddr) -> Self {
        Self {
            stream,
            role,
            peer,
            assembler: None,
            outbound: None,
            wants_read: true,
            wants_write: false,
            registered: false,
        }
    }
}

/// Owned registry of all live connections and their pairings.
#[derive(Debug)]
pub struct ConnectionRegistry {
    conns: HashMap<Token, Connection>,
    /// Bidirectional client↔upstream pairing; both directions are present.
    peers: HashMap<Token, Token>,
    next_token: usize,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            conns: HashMap::new(),
            peers: HashMap::new(),
            // Token 0 is reserved for the listener.
            next_token: 1,
        }
    }

    /// Allocate a fresh poll token.
    pub fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn insert(&mut self, token: Token, conn: Connection) {
        self.conns.insert(token, conn);
    }

    pub fn get(&self, token: Token) -> Option<&Connection> {
        self.conns.get(&token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.conns.get_mut(&token)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.conns.contains_key(&token)
    }

    /// Remove a connection, dropping (closing) its socket.
    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        self.conns.remove(&token)
    }

    /// Pair a client with an upstream for one exchange.
    ///
    /// A token already in a mapping keeps its existing pairing untouched and
    /// the bind is refused.
    pub fn bind(&mut self, client: Token, upstream: Token) -> bool {
        if self.peers.contains_key(&client) || self.peers.contains_key(&upstream) {
            return false;
        }
        self.peers.insert(client, upstream);
        self.peers.insert(upstream, client);
        true
    }

    /// Tear down the mapping either side belongs to.
    ///
    /// Returns the peer token if a mapping existed.
    pub fn unbind(&mut self, token: Token) -> Option<Token> {
        let peer = self.peers.remove(&token)?;
        self.peers.remove(&peer);
        Some(peer)
    }

    /// The other side of this token's mapping, if mapped.
    pub fn peer_of(&self, token: Token) -> Option<Token> {
        self.peers.get(&token).copied()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
