//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Format traffic log lines (direction, peer pair, payload preview, size)
//!
//! # Design Decisions
//! - Uses the tracing crate for structured logging
//! - Log level configurable via config and the RUST_LOG environment variable
//! - Logging never fails or blocks the proxy; a payload preview is a bounded
//!   escaped prefix, never the full body

use std::net::SocketAddr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::net::Role;

/// Longest escaped payload prefix shown in traffic logs.
const PREVIEW_LIMIT: usize = 40;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured default filter.
pub fn init(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Direction of a traffic log event relative to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes read off a socket.
    Received,
    /// A serialized message written to a socket.
    Sending,
}

/// Log one traffic event with a bounded payload preview.
pub fn log_traffic(direction: Direction, role: Role, peer: SocketAddr, payload: &[u8]) {
    let flow = describe_flow(direction, role);
    tracing::info!(
        peer = %peer,
        bytes = payload.len(),
        preview = %preview(payload),
        "{flow}"
    );
}

/// Human-readable flow description matching the socket's side of the proxy.
fn describe_flow(direction: Direction, role: Role) -> &'static str {
    match (direction, role) {
        (Direction::Received, Role::Client) => "client -> proxy",
        (Direction::Sending, Role::Client) => "client <- proxy",
        (Direction::Received, Role::Upstream) => "proxy <- upstream",
        (Direction::Sending, Role::Upstream) => "proxy -> upstream",
    }
}

/// Escaped, truncated prefix of a payload for log lines.
fn preview(payload: &[u8]) -> String {
    let escaped: String = payload
        .iter()
        .flat_map(|b| std::ascii::escape_default(*b))
        .map(char::from)
        .collect();
    if escaped.len() > PREVIEW_LIMIT {
        format!("{}...", &escaped[..PREVIEW_LIMIT])
    } else {
        escaped
    }
}
