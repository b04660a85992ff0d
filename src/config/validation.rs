//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check addresses parse as socket addresses
//! - Validate value ranges (pool size at least 1)
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::config::schema::ProxyConfig;

/// A single semantic configuration problem.
#[derive(Debug, PartialEq, Eq)]
pub enum ValidationError {
    /// The listener bind address is not a parseable socket address.
    InvalidListenAddress(String),
    /// The upstream target address is not a parseable socket address.
    InvalidUpstreamAddress(String),
    /// A pool of zero upstreams can never serve a client.
    ZeroPoolSize,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::InvalidListenAddress(addr) => {
                write!(f, "invalid listener bind_address: {}", addr)
            }
            ValidationError::InvalidUpstreamAddress(addr) => {
                write!(f, "invalid upstream address: {}", addr)
            }
            ValidationError::ZeroPoolSize => write!(f, "upstream pool_size must be at least 1"),
        }
    }
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config
        .listener
        .bind_address
        .parse::<std::net::SocketAddr>()
        .is_err()
    {
        errors.push(ValidationError::InvalidListenAddress(
            config.listener.bind_address.clone(),
        ));
    }

    if config
        .upstream
        .address
        .parse::<std::net::SocketAddr>()
        .is_err()
    {
        errors.push(ValidationError::InvalidUpstreamAddress(
            config.upstream.address.clone(),
        ));
    }

    if config.upstream.pool_size == 0 {
        errors.push(ValidationError::ZeroPoolSize);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn all_errors_are_collected() {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.upstream.address = "also bad".into();
        config.upstream.pool_size = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ValidationError::ZeroPoolSize));
    }
}
