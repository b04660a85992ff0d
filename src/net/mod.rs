//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     pool.rs connect_pool (blocking, all-or-nothing)
//!         → registry.rs Connection (role Upstream)
//!         → pool.rs UpstreamPool slot (AVAILABLE)
//!
//! Accept:
//!     listener readable → new Connection (role Client)
//!         → UpstreamPool acquire → registry.rs bind (client↔upstream)
//!         → or admission control (reject / queue)
//!
//! Teardown:
//!     EOF or error → registry.rs unbind → UpstreamPool release
//! ```
//!
//! # Design Decisions
//! - The registry is the sole owner of sockets; the pool allocates tokens
//! - Every state the reactor consults is explicit connection state, not a
//!   side table keyed by raw descriptors

pub mod pool;
pub mod registry;

pub use pool::{PoolError, SlotState, UpstreamPool};
pub use registry::{Connection, ConnectionRegistry, Outbound, Role};
