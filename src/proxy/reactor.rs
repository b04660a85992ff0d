//! Single-threaded readiness-driven event loop.
//!
//! # Responsibilities
//! - Sole driver of all I/O: accept, read, write, error handling
//! - Bind accepted clients to pool slots (with explicit admission control)
//! - Feed read bytes to the destination's message accumulator
//! - Flush completed messages and recycle exchange state
//!
//! # Design Decisions
//! - One blocking poll call per iteration is the only suspension point;
//!   every socket operation is non-blocking
//! - Readiness classes are handled in a fixed order per iteration:
//!   readable, then writable, then exceptional
//! - Write interest is armed only while a destination holds a completed
//!   message; read interest on the source is suspended until that message
//!   is fully drained, so a destination never has two messages in flight
//! - Poll failures are logged and the loop continues; only startup
//!   failures are fatal

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use thiserror::Error;

use crate::config::{AdmissionPolicy, ProxyConfig};
use crate::http::HttpMessage;
use crate::net::pool::{self, UpstreamPool};
use crate::net::{Connection, ConnectionRegistry, Outbound, Role};
use crate::observability::{log_traffic, Direction};

/// Token reserved for the listening socket.
const LISTENER: Token = Token(0);

/// Size of the per-read scratch buffer.
const READ_BUF_SIZE: usize = 4096;

const EVENTS_CAPACITY: usize = 256;

/// Upper bound on one poll suspension so the shutdown flag stays responsive.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Fatal startup errors. Everything after startup is recovered per-socket.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A configured address did not parse.
    #[error("invalid socket address {addr:?}: {source}")]
    InvalidAddress {
        addr: String,
        source: std::net::AddrParseError,
    },

    /// The listening socket could not be bound.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    /// An upstream pool connection could not be established.
    #[error("failed to establish upstream pool: {0}")]
    UpstreamConnect(#[source] io::Error),

    /// The readiness poll could not be set up.
    #[error("readiness poll setup failed: {0}")]
    Poll(#[source] io::Error),
}

/// Cooperative stop signal for a running reactor.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    /// Ask the reactor to stop after its current iteration.
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One event snapshot; mio events are copied out so handlers can mutate state.
struct ReadyEvent {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
}

/// The proxy's event loop.
///
/// Owns the poll, the listener, the connection registry, and the upstream
/// pool. All state is mutated by the loop thread between suspension points;
/// no locking is involved.
#[derive(Debug)]
pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    registry: ConnectionRegistry,
    pool: UpstreamPool,
    /// Clients accepted while the pool was exhausted (queue policy only).
    backlog: VecDeque<Token>,
    admission: AdmissionPolicy,
    upstream_addr: SocketAddr,
    shutdown: ShutdownHandle,
}

impl Reactor {
    /// Bind the listener and eagerly establish the upstream pool.
    ///
    /// Any failure here is fatal: the caller must not serve with a partial
    /// pool or an unbound listener.
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let listen_addr = parse_addr(&config.listener.bind_address)?;
        let upstream_addr = parse_addr(&config.upstream.address)?;

        let poll = Poll::new().map_err(ProxyError::Poll)?;
        let mut listener = TcpListener::bind(listen_addr).map_err(ProxyError::Bind)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ProxyError::Poll)?;
        tracing::info!(address = %listen_addr, "listening for client connections");

        let mut registry = ConnectionRegistry::new();
        let mut upstreams = UpstreamPool::new();
        let streams = pool::connect_pool(upstream_addr, config.upstream.pool_size)
            .map_err(ProxyError::UpstreamConnect)?;
        for mut stream in streams {
            let token = registry.alloc_token();
            poll.registry()
                .register(&mut stream, token, Interest::READABLE)
                .map_err(ProxyError::Poll)?;
            let peer = stream.peer_addr().map_err(ProxyError::UpstreamConnect)?;
            let mut conn = Connection::new(stream, Role::Upstream, peer);
            conn.registered = true;
            registry.insert(token, conn);
            upstreams.insert(token);
            tracing::info!(upstream = %peer, token = token.0, "established upstream connection");
        }

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            registry,
            pool: upstreams,
            backlog: VecDeque::new(),
            admission: config.upstream.admission,
            upstream_addr,
            shutdown: ShutdownHandle::default(),
        })
    }

    /// Address the listener actually bound to (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle that stops the loop from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run the loop until the shutdown handle fires.
    pub fn run(&mut self) {
        tracing::info!(
            pool_size = self.pool.len(),
            admission = ?self.admission,
            "reactor running"
        );
        while !self.shutdown.is_shutdown() {
            self.turn();
        }
        tracing::info!("reactor stopped");
    }

    /// One iteration: a single poll suspension, then the three readiness
    /// classes in fixed order.
    fn turn(&mut self) {
        match self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                // Abort this iteration only; the loop itself survives.
                tracing::error!(error = %e, "readiness poll failed");
                return;
            }
        }

        let ready: Vec<ReadyEvent> = self
            .events
            .iter()
            .map(|event| ReadyEvent {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
                error: event.is_error(),
            })
            .collect();

        for event in ready.iter().filter(|e| e.readable) {
            self.on_readable(event.token);
        }
        for event in ready.iter().filter(|e| e.writable) {
            self.on_writable(event.token);
        }
        for event in ready.iter().filter(|e| e.error) {
            self.on_exceptional(event.token);
        }
    }

    fn on_readable(&mut self, token: Token) {
        if token == LISTENER {
            self.on_accept();
            return;
        }
        // Readiness is edge-triggered: drain until WouldBlock.
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            let result = match self.registry.get_mut(token) {
                // Torn down earlier in this iteration.
                None => return,
                Some(conn) => conn.stream.read(&mut buf),
            };
            match result {
                Ok(0) => {
                    self.on_peer_shutdown(token);
                    return;
                }
                Ok(n) => {
                    if !self.ingest(token, &buf[..n]) {
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(token = token.0, error = %e, "read failed");
                    self.teardown_exchange(token);
                    return;
                }
            }
        }
    }

    fn on_accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let token = self.registry.alloc_token();
                    self.registry
                        .insert(token, Connection::new(stream, Role::Client, addr));
                    tracing::info!(peer = %addr, "accepted client connection");
                    self.admit(token);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Bind a newly accepted client to an upstream slot, or apply the
    /// configured admission policy.
    fn admit(&mut self, client: Token) {
        match self.pool.acquire() {
            Some(upstream) => self.attach(client, upstream),
            None => match self.admission {
                AdmissionPolicy::Reject => {
                    tracing::warn!(token = client.0, "pool exhausted, rejecting client");
                    // Never registered with the poll; dropping closes it.
                    self.registry.remove(client);
                }
                AdmissionPolicy::Queue => {
                    tracing::debug!(
                        token = client.0,
                        queued = self.backlog.len() + 1,
                        "pool exhausted, queueing client"
                    );
                    self.backlog.push_back(client);
                }
            },
        }
    }

    fn attach(&mut self, client: Token, upstream: Token) {
        if !self.registry.bind(client, upstream) {
            tracing::error!(
                client = client.0,
                upstream = upstream.0,
                "mapping bind refused"
            );
            if let Err(e) = self.pool.release(upstream) {
                tracing::error!(error = %e, "pool bookkeeping violation");
            }
            self.registry.remove(client);
            return;
        }
        // Clients get read interest only once admitted; bytes from queued
        // clients wait in the kernel buffer until a slot frees up.
        if let Err(e) = self.apply_interest(client) {
            tracing::warn!(token = client.0, error = %e, "failed to register client");
            self.teardown_client(client);
            return;
        }
        tracing::debug!(
            client = client.0,
            upstream = upstream.0,
            available = self.pool.available(),
            "client bound to upstream slot"
        );
    }

    /// Feed bytes read from `source` into the accumulator of its mapped
    /// destination. Returns false when the caller should stop reading
    /// (message completed, or the exchange was torn down).
    fn ingest(&mut self, source: Token, bytes: &[u8]) -> bool {
        let (role, peer) = match self.registry.get(source) {
            Some(conn) => (conn.role, conn.peer),
            None => return false,
        };
        log_traffic(Direction::Received, role, peer, bytes);

        let dest = match self.registry.peer_of(source) {
            Some(dest) => dest,
            None => {
                // An AVAILABLE upstream has no exchange; nothing sane to do
                // with unsolicited bytes but drop them.
                tracing::warn!(
                    token = source.0,
                    bytes = bytes.len(),
                    "data on unmapped socket discarded"
                );
                return true;
            }
        };

        let outcome = match self.registry.get_mut(dest) {
            None => return false,
            Some(conn) => {
                let assembler = conn.assembler.get_or_insert_with(HttpMessage::new);
                assembler
                    .ingest_chunk(bytes)
                    .map(|_| assembler.is_complete())
            }
        };

        match outcome {
            Err(e) => {
                tracing::warn!(token = source.0, error = %e, "parse fault, closing exchange");
                self.teardown_exchange(source);
                false
            }
            Ok(false) => true,
            Ok(true) => {
                // Arm the destination for writing; stop reading from the
                // source until the message has fully drained.
                if let Some(conn) = self.registry.get_mut(dest) {
                    conn.wants_write = true;
                }
                if let Err(e) = self.apply_interest(dest) {
                    tracing::warn!(token = dest.0, error = %e, "interest update failed");
                    self.teardown_exchange(dest);
                    return false;
                }
                if let Some(conn) = self.registry.get_mut(source) {
                    conn.wants_read = false;
                }
                if let Err(e) = self.apply_interest(source) {
                    tracing::warn!(token = source.0, error = %e, "interest update failed");
                    self.teardown_exchange(source);
                }
                false
            }
        }
    }

    fn on_writable(&mut self, token: Token) {
        if self.prepare_outbound(token) {
            self.flush(token);
        }
    }

    /// Serialize a completed accumulator into the outbound buffer, or drop
    /// spurious write interest.
    fn prepare_outbound(&mut self, token: Token) -> bool {
        let armed = {
            let conn = match self.registry.get_mut(token) {
                Some(conn) => conn,
                None => return false,
            };
            if conn.outbound.is_some() {
                true
            } else {
                match conn.assembler.take() {
                    Some(mut message) if message.is_complete() => {
                        if conn.role == Role::Upstream {
                            // Requests to the pool ride persistent connections.
                            message.set_header(b"Connection", b"Keep-Alive");
                        }
                        let bytes = message.to_bytes();
                        log_traffic(Direction::Sending, conn.role, conn.peer, &bytes);
                        conn.outbound = Some(Outbound::new(bytes));
                        true
                    }
                    incomplete => {
                        // Spurious writability: no completed message pending.
                        conn.assembler = incomplete;
                        conn.wants_write = false;
                        false
                    }
                }
            }
        };
        if !armed {
            if let Err(e) = self.apply_interest(token) {
                tracing::warn!(token = token.0, error = %e, "interest update failed");
                self.teardown_exchange(token);
            }
        }
        armed
    }

    /// Drain the outbound buffer; partial writes keep their tail and the
    /// write interest until a later iteration.
    fn flush(&mut self, token: Token) {
        loop {
            let result = {
                let conn = match self.registry.get_mut(token) {
                    Some(conn) => conn,
                    None => return,
                };
                let out = match conn.outbound.as_mut() {
                    Some(out) => out,
                    None => return,
                };
                match conn.stream.write(out.remaining()) {
                    Ok(n) => apply_write(out, n),
                    Err(e) => Err(e),
                }
            };
            match result {
                Ok(true) => {
                    self.finish_flush(token);
                    return;
                }
                Ok(false) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(token = token.0, error = %e, "write failed");
                    self.teardown_exchange(token);
                    return;
                }
            }
        }
    }

    /// Message fully transmitted: discard it and resume reading from the
    /// mapped source.
    fn finish_flush(&mut self, token: Token) {
        if let Some(conn) = self.registry.get_mut(token) {
            conn.outbound = None;
            conn.wants_write = false;
        }
        if let Err(e) = self.apply_interest(token) {
            tracing::warn!(token = token.0, error = %e, "interest update failed");
            self.teardown_exchange(token);
            return;
        }
        if let Some(source) = self.registry.peer_of(token) {
            if let Some(conn) = self.registry.get_mut(source) {
                conn.wants_read = true;
            }
            if let Err(e) = self.apply_interest(source) {
                tracing::warn!(token = source.0, error = %e, "interest update failed");
                self.teardown_exchange(source);
            }
        }
    }

    /// Zero-length read: the peer shut down. Normal closure, not a failure.
    fn on_peer_shutdown(&mut self, token: Token) {
        let role = match self.registry.get(token) {
            Some(conn) => conn.role,
            None => return,
        };
        tracing::debug!(token = token.0, role = ?role, "peer closed connection");
        match role {
            Role::Client => self.teardown_client(token),
            Role::Upstream => self.handle_upstream_failure(token),
        }
    }

    /// Exceptional readiness: close the socket and recycle its resources.
    fn on_exceptional(&mut self, token: Token) {
        if token == LISTENER {
            tracing::error!("listener reported exceptional state");
            return;
        }
        if !self.registry.contains(token) {
            return;
        }
        tracing::warn!(token = token.0, "exceptional readiness");
        self.teardown_exchange(token);
    }

    /// Tear down whichever exchange `token` belongs to, keyed on its role.
    fn teardown_exchange(&mut self, token: Token) {
        match self.registry.get(token).map(|conn| conn.role) {
            Some(Role::Client) => self.teardown_client(token),
            Some(Role::Upstream) => self.handle_upstream_failure(token),
            None => {}
        }
    }

    /// Close a client and return its upstream slot to the pool.
    fn teardown_client(&mut self, client: Token) {
        let upstream = self.registry.unbind(client);
        self.close(client);
        if let Some(upstream) = upstream {
            self.reset_upstream(upstream);
            self.release_slot(upstream);
        }
    }

    /// Clear an upstream's exchange state and restore read-only interest.
    fn reset_upstream(&mut self, upstream: Token) {
        if let Some(conn) = self.registry.get_mut(upstream) {
            conn.assembler = None;
            conn.outbound = None;
            conn.wants_read = true;
            conn.wants_write = false;
        }
        if let Err(e) = self.apply_interest(upstream) {
            tracing::warn!(token = upstream.0, error = %e, "failed to rearm upstream");
        }
    }

    fn release_slot(&mut self, upstream: Token) {
        match self.pool.release(upstream) {
            Ok(()) => tracing::debug!(
                token = upstream.0,
                available = self.pool.available(),
                "upstream slot released"
            ),
            Err(e) => {
                tracing::error!(error = %e, "pool bookkeeping violation");
                return;
            }
        }
        self.serve_backlog();
    }

    /// Bind queued clients to whatever slots are now free (queue policy).
    fn serve_backlog(&mut self) {
        while self.pool.available() > 0 {
            let client = match self.backlog.pop_front() {
                Some(client) => client,
                None => return,
            };
            if !self.registry.contains(client) {
                continue;
            }
            match self.pool.acquire() {
                Some(upstream) => {
                    tracing::debug!(client = client.0, "serving queued client");
                    self.attach(client, upstream);
                }
                None => {
                    self.backlog.push_front(client);
                    return;
                }
            }
        }
    }

    /// The upstream socket itself failed or was closed by the backend.
    ///
    /// Its mapped client (if any) is closed, then one synchronous reconnect
    /// refills the fixed-size slot; if that fails the slot is retired.
    fn handle_upstream_failure(&mut self, upstream: Token) {
        if let Some(client) = self.registry.unbind(upstream) {
            self.close(client);
        }
        self.close(upstream);
        match pool::connect_upstream(self.upstream_addr) {
            Ok(mut stream) => {
                let token = self.registry.alloc_token();
                match self
                    .poll
                    .registry()
                    .register(&mut stream, token, Interest::READABLE)
                {
                    Ok(()) => {
                        let peer = stream.peer_addr().unwrap_or(self.upstream_addr);
                        let mut conn = Connection::new(stream, Role::Upstream, peer);
                        conn.registered = true;
                        self.registry.insert(token, conn);
                        if let Err(e) = self.pool.replace(upstream, token) {
                            tracing::error!(error = %e, "pool bookkeeping violation");
                        }
                        tracing::info!(upstream = %peer, "re-established upstream connection");
                        self.serve_backlog();
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to register replacement upstream");
                        self.pool.retire(upstream);
                    }
                }
            }
            Err(e) => {
                self.pool.retire(upstream);
                tracing::error!(
                    error = %e,
                    remaining = self.pool.len(),
                    "upstream reconnect failed, slot retired"
                );
            }
        }
    }

    /// Remove a connection from every tracked set and close its socket.
    fn close(&mut self, token: Token) {
        self.backlog.retain(|queued| *queued != token);
        if let Some(mut conn) = self.registry.remove(token) {
            if conn.registered {
                if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                    tracing::debug!(token = token.0, error = %e, "deregister failed");
                }
            }
            tracing::debug!(peer = %conn.peer, role = ?conn.role, "connection closed");
        }
    }

    /// Recompute poll registration from the connection's interest flags.
    fn apply_interest(&mut self, token: Token) -> io::Result<()> {
        let conn = match self.registry.get_mut(token) {
            Some(conn) => conn,
            None => return Ok(()),
        };
        let interest = match (conn.wants_read, conn.wants_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        match (interest, conn.registered) {
            (Some(interest), true) => {
                self.poll
                    .registry()
                    .reregister(&mut conn.stream, token, interest)
            }
            (Some(interest), false) => {
                self.poll
                    .registry()
                    .register(&mut conn.stream, token, interest)?;
                conn.registered = true;
                Ok(())
            }
            (None, true) => {
                self.poll.registry().deregister(&mut conn.stream)?;
                conn.registered = false;
                Ok(())
            }
            (None, false) => Ok(()),
        }
    }
}

/// Fold one write result into outbound progress.
///
/// A zero-length write with bytes still pending is a dead socket, not
/// progress; reporting it as a failure keeps the flush loop from spinning.
fn apply_write(out: &mut Outbound, n: usize) -> io::Result<bool> {
    if n == 0 && !out.is_drained() {
        return Err(io::ErrorKind::WriteZero.into());
    }
    out.advance(n);
    Ok(out.is_drained())
}

fn parse_addr(addr: &str) -> Result<SocketAddr, ProxyError> {
    addr.parse().map_err(|source| ProxyError::InvalidAddress {
        addr: addr.to_string(),
        source,
    })
}
