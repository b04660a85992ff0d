//! Proxy core subsystem.
//!
//! # Data Flow
//! ```text
//! poll readiness (single suspension point)
//!     → reactor.rs readable class
//!         listener → accept → pool acquire / admission control
//!         socket   → read → destination accumulator → complete?
//!     → reactor.rs writable class
//!         serialize completed message → drain outbound buffer
//!     → reactor.rs exceptional class
//!         close socket → unbind mapping → release/refill pool slot
//! ```
//!
//! # Design Decisions
//! - Single thread; registry, pool, and accumulators are plain owned state
//! - Exactly one outbound message in flight per destination socket
//! - Startup failure is fatal; every later failure is scoped to one socket

pub mod reactor;

pub use reactor::{ProxyError, Reactor, ShutdownHandle};
