//! Server configuration
//!
//! Read-only settings fixed before the first connection is accepted and
//! shared as `Arc<Config>` afterwards.

use std::time::Duration;

use crate::error::AppError;

/// Default listening host
pub const DEFAULT_HOST: &str = "localhost";
/// Default listening port
pub const DEFAULT_PORT: u16 = 8080;
/// Smallest usable outbound queue: the welcome, identity and join lines
/// are all queued before the write loop starts
pub const MIN_OUTBOUND_CAPACITY: usize = 3;

/// Server settings
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// A connection that sends nothing for this long is closed
    pub idle_timeout: Duration,
    /// Deadline for writing one line to a connection
    pub write_timeout: Duration,
    /// Longest accepted input line in bytes
    pub max_message_bytes: usize,
    /// Concurrent client limit, 0 = unlimited
    pub max_clients: usize,
    pub debug: bool,
    /// Capacity of each connection's outbound queue
    pub outbound_capacity: usize,
    /// Delay between the shutdown warning and closing every connection
    pub shutdown_grace: Duration,
    /// Capacity of the hub's request channel
    pub hub_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            idle_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(10),
            max_message_bytes: 4096,
            max_clients: 0,
            debug: false,
            outbound_capacity: 64,
            shutdown_grace: Duration::from_secs(3),
            hub_capacity: 256,
        }
    }
}

impl Config {
    /// `host:port` for binding
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_message_bytes == 0 {
            return Err(AppError::InvalidConfig(
                "maximum message size must be positive".to_string(),
            ));
        }
        if self.hub_capacity == 0 {
            return Err(AppError::InvalidConfig(
                "hub queue capacity must be positive".to_string(),
            ));
        }
        if self.outbound_capacity < MIN_OUTBOUND_CAPACITY {
            return Err(AppError::InvalidConfig(format!(
                "outbound queue capacity must be at least {}",
                MIN_OUTBOUND_CAPACITY
            )));
        }
        if self.idle_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(AppError::InvalidConfig(
                "timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr(), "localhost:8080");
        assert_eq!(config.max_clients, 0);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = Config {
            max_message_bytes: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(AppError::InvalidConfig(_))));

        let config = Config {
            outbound_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(AppError::InvalidConfig(_))));

        let config = Config {
            write_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(AppError::InvalidConfig(_))));
    }

    #[test]
    fn test_outbound_capacity_must_hold_the_greeting() {
        for capacity in [1, 2] {
            let config = Config {
                outbound_capacity: capacity,
                ..Config::default()
            };
            assert!(matches!(config.validate(), Err(AppError::InvalidConfig(_))));
        }

        let config = Config {
            outbound_capacity: MIN_OUTBOUND_CAPACITY,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }
}
