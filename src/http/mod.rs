//! HTTP framing subsystem.
//!
//! # Data Flow
//! ```text
//! Socket read (reactor)
//!     → message.rs ingest_chunk (per destination accumulator)
//!     → phase transitions: start line → headers → body
//!     → completion predicate satisfied
//!     → message.rs to_bytes (wire serialization)
//!     → Socket write (reactor)
//! ```
//!
//! # Design Decisions
//! - One accumulator per destination socket, owned by the registry
//! - Parsing is structural only; header semantics stay opaque
//! - Chunk boundaries carry no meaning: assembly is split-invariant

pub mod message;

pub use message::{HttpMessage, MessageError};
