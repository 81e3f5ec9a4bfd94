// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use chrono_tz::Tz;

use crate::schedule::SchedulePattern;

/// Nudge Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Maximum pooled database connections
    pub db_max_connections: u32,
    /// Timezone used for participants enrolled without one
    pub default_timezone: Tz,
    /// Daily prompt pattern used for participants enrolled without one
    pub default_schedule: String,
    /// Capacity of the inbound message and delivery receipt channels
    pub inbound_buffer: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `NUDGE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `NUDGE_DB_MAX_CONNECTIONS`: pool size (default: 5)
    /// - `NUDGE_DEFAULT_TIMEZONE`: IANA timezone name (default: UTC)
    /// - `NUDGE_DEFAULT_SCHEDULE`: daily prompt pattern (default: 10:00)
    /// - `NUDGE_INBOUND_BUFFER`: inbound channel capacity (default: 256)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("NUDGE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("NUDGE_DATABASE_URL"))?;

        let db_max_connections: u32 = std::env::var("NUDGE_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("NUDGE_DB_MAX_CONNECTIONS", "must be a positive integer")
            })?;

        let default_timezone: Tz = std::env::var("NUDGE_DEFAULT_TIMEZONE")
            .unwrap_or_else(|_| "UTC".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("NUDGE_DEFAULT_TIMEZONE", "must be an IANA timezone name")
            })?;

        let default_schedule =
            std::env::var("NUDGE_DEFAULT_SCHEDULE").unwrap_or_else(|_| "10:00".to_string());
        if SchedulePattern::parse(&default_schedule, default_timezone).is_err() {
            return Err(ConfigError::Invalid(
                "NUDGE_DEFAULT_SCHEDULE",
                "must be HH:MM, HH:MM-HH:MM or a five-field calendar pattern",
            ));
        }

        let inbound_buffer: usize = std::env::var("NUDGE_INBOUND_BUFFER")
            .unwrap_or_else(|_| "256".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "NUDGE_INBOUND_BUFFER",
                "must be a positive integer",
            ))?;

        Ok(Self {
            database_url,
            db_max_connections,
            default_timezone,
            default_schedule,
            inbound_buffer,
        })
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn clear_optional(guard: &mut EnvGuard) {
        guard.remove("NUDGE_DB_MAX_CONNECTIONS");
        guard.remove("NUDGE_DEFAULT_TIMEZONE");
        guard.remove("NUDGE_DEFAULT_SCHEDULE");
        guard.remove("NUDGE_INBOUND_BUFFER");
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("NUDGE_DATABASE_URL", "sqlite::memory:");
        clear_optional(&mut guard);

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.db_max_connections, 5);
        assert_eq!(config.default_timezone, chrono_tz::UTC);
        assert_eq!(config.default_schedule, "10:00");
        assert_eq!(config.inbound_buffer, 256);
    }

    #[test]
    fn test_config_from_env_with_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("NUDGE_DATABASE_URL", "postgres://localhost/nudge");
        guard.set("NUDGE_DB_MAX_CONNECTIONS", "12");
        guard.set("NUDGE_DEFAULT_TIMEZONE", "America/New_York");
        guard.set("NUDGE_DEFAULT_SCHEDULE", "08:00-10:00");
        guard.set("NUDGE_INBOUND_BUFFER", "16");

        let config = Config::from_env().unwrap();

        assert_eq!(config.db_max_connections, 12);
        assert_eq!(config.default_timezone, chrono_tz::America::New_York);
        assert_eq!(config.default_schedule, "08:00-10:00");
        assert_eq!(config.inbound_buffer, 16);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("NUDGE_DATABASE_URL");

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::Missing("NUDGE_DATABASE_URL"))
        ));
    }

    #[test]
    fn test_config_invalid_timezone() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("NUDGE_DATABASE_URL", "sqlite::memory:");
        clear_optional(&mut guard);
        guard.set("NUDGE_DEFAULT_TIMEZONE", "Mars/Olympus");

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::Invalid("NUDGE_DEFAULT_TIMEZONE", _))
        ));
    }

    #[test]
    fn test_config_invalid_schedule() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("NUDGE_DATABASE_URL", "sqlite::memory:");
        clear_optional(&mut guard);
        guard.set("NUDGE_DEFAULT_SCHEDULE", "25:99");

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::Invalid("NUDGE_DEFAULT_SCHEDULE", _))
        ));
    }

    #[test]
    fn test_config_zero_buffer_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("NUDGE_DATABASE_URL", "sqlite::memory:");
        clear_optional(&mut guard);
        guard.set("NUDGE_INBOUND_BUFFER", "0");

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::Invalid("NUDGE_INBOUND_BUFFER", _))
        ));
    }
}
