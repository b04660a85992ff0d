//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Reactor events produce:
//!     → logging.rs (structured log events, traffic previews)
//!
//! Consumers:
//!     → stdout/stderr via the tracing subscriber
//! ```
//!
//! # Design Decisions
//! - Structured logging via tracing, filter from config or RUST_LOG
//! - Traffic lines carry a bounded escaped preview, never full payloads
//! - Logging is fire-and-forget: it can never fail or stall the event loop

pub mod logging;

pub use logging::{log_traffic, Direction};
