//! Application configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::websocket::connection::DEFAULT_QUEUE_CAPACITY;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Authentication
    pub jwt_secret: String,

    // WebSocket
    pub ws_idle_timeout_secs: u64,
    pub ws_write_timeout_secs: u64,
    pub ws_max_message_bytes: usize,
    pub ws_outbound_queue_capacity: usize,
    pub ws_welcome_enabled: bool,

    // Logging
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),

            // Authentication
            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            // WebSocket
            ws_idle_timeout_secs: parse_var("WS_IDLE_TIMEOUT_SECS", 60)?,
            ws_write_timeout_secs: parse_var("WS_WRITE_TIMEOUT_SECS", 10)?,
            ws_max_message_bytes: parse_var("WS_MAX_MESSAGE_BYTES", 512)?,
            ws_outbound_queue_capacity: parse_var(
                "WS_OUTBOUND_QUEUE_CAPACITY",
                DEFAULT_QUEUE_CAPACITY,
            )?,
            ws_welcome_enabled: parse_var("WS_WELCOME_ENABLED", true)?,

            // Logging
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                Ok("pretty") | Err(_) => LogFormat::Pretty,
                Ok(_) => {
                    return Err(ConfigError::Invalid {
                        var: "LOG_FORMAT",
                        reason: "expected \"pretty\" or \"json\"".to_string(),
                    })
                }
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Default settings with the given signing secret
    pub fn with_secret(jwt_secret: impl Into<String>) -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            jwt_secret: jwt_secret.into(),
            ws_idle_timeout_secs: 60,
            ws_write_timeout_secs: 10,
            ws_max_message_bytes: 512,
            ws_outbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ws_welcome_enabled: true,
            log_format: LogFormat::Pretty,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ws_idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "WS_IDLE_TIMEOUT_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.ws_outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                var: "WS_OUTBOUND_QUEUE_CAPACITY",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_idle_timeout_secs)
    }

    /// Server ping period, 9/10 of the idle timeout
    pub fn heartbeat_interval(&self) -> Duration {
        self.idle_timeout() * 9 / 10
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_write_timeout_secs)
    }
}

fn parse_var<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}
