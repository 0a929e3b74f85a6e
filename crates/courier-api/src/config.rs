//! Configuration management for the courier service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use courier_delivery::{ClientConfig, DeliveryConfig, SweepSchedule};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";

/// Where destinations and messages are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// PostgreSQL at `database_url`.
    Postgres,
    /// Process memory. Pending messages are lost on restart.
    Memory,
}

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Storage
    /// Storage backend, `postgres` or `memory`.
    ///
    /// Environment variable: `STORAGE_BACKEND`
    #[serde(default = "default_storage_backend", alias = "STORAGE_BACKEND")]
    pub storage_backend: StorageBackend,
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,

    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// Inbound request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Delivery
    /// Age in seconds at which an undelivered message is discarded.
    ///
    /// Environment variable: `MESSAGE_TTL_SECONDS`
    #[serde(default = "default_message_ttl", alias = "MESSAGE_TTL_SECONDS")]
    pub message_ttl_seconds: u64,
    /// Pause before every delivery attempt in milliseconds.
    ///
    /// Environment variable: `PACING_DELAY_MS`
    #[serde(default = "default_pacing_delay", alias = "PACING_DELAY_MS")]
    pub pacing_delay_ms: u64,
    /// Hours between periodic sweeps. Must divide 24.
    ///
    /// Environment variable: `SWEEP_EVERY_HOURS`
    #[serde(default = "default_sweep_every_hours", alias = "SWEEP_EVERY_HOURS")]
    pub sweep_every_hours: u32,
    /// Capacity of the immediate trigger queue.
    ///
    /// Environment variable: `TRIGGER_QUEUE_SIZE`
    #[serde(default = "default_trigger_queue_size", alias = "TRIGGER_QUEUE_SIZE")]
    pub trigger_queue_size: usize,
    /// Seconds to wait for background delivery tasks on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Client
    /// HTTP request timeout for a delivery attempt in seconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout", alias = "DELIVERY_TIMEOUT_SECONDS")]
    pub delivery_timeout_seconds: u64,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, `courier.toml`, and environment
    /// variable overrides, then validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or a value is invalid.
    pub fn load() -> Result<Self> {
        let config: Self = Self::figment().extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""))
    }

    /// Converts to the delivery engine's configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `sweep_every_hours` does not divide 24.
    pub fn to_delivery_config(&self) -> Result<DeliveryConfig> {
        let sweep_schedule =
            SweepSchedule::new(self.sweep_every_hours).context("invalid sweep schedule")?;

        Ok(DeliveryConfig {
            message_ttl: Duration::from_secs(self.message_ttl_seconds),
            pacing_delay: Duration::from_millis(self.pacing_delay_ms),
            client_config: self.to_client_config(),
            trigger_queue_size: self.trigger_queue_size,
            sweep_schedule,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        })
    }

    /// Converts to client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            user_agent: format!("Courier/{}", env!("CARGO_PKG_VERSION")),
            ..ClientConfig::default()
        }
    }

    /// Parses the server socket address from host and port.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("invalid server address")
    }

    /// Inbound request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.storage_backend == StorageBackend::Postgres {
            if self.database_max_connections == 0 {
                anyhow::bail!("database max_connections must be greater than 0");
            }

            if self.database_min_connections > self.database_max_connections {
                anyhow::bail!("database min_connections cannot exceed max_connections");
            }
        }

        if self.message_ttl_seconds == 0 {
            anyhow::bail!("message_ttl_seconds must be greater than 0");
        }

        if self.sweep_every_hours == 0 || 24 % self.sweep_every_hours != 0 {
            anyhow::bail!("sweep_every_hours must divide 24");
        }

        if self.trigger_queue_size == 0 {
            anyhow::bail!("trigger_queue_size must be greater than 0");
        }

        if self.delivery_timeout_seconds == 0 {
            anyhow::bail!("delivery_timeout_seconds must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_backend: default_storage_backend(),
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            message_ttl_seconds: default_message_ttl(),
            pacing_delay_ms: default_pacing_delay(),
            sweep_every_hours: default_sweep_every_hours(),
            trigger_queue_size: default_trigger_queue_size(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            delivery_timeout_seconds: default_delivery_timeout(),
            rust_log: default_log_level(),
        }
    }
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Postgres
}

fn default_database_url() -> String {
    "postgresql://localhost/courier".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_message_ttl() -> u64 {
    courier_delivery::DEFAULT_MESSAGE_TTL_SECONDS
}

fn default_pacing_delay() -> u64 {
    courier_delivery::DEFAULT_PACING_DELAY_MS
}

fn default_sweep_every_hours() -> u32 {
    courier_delivery::DEFAULT_SWEEP_EVERY_HOURS
}

fn default_trigger_queue_size() -> usize {
    courier_delivery::DEFAULT_TRIGGER_QUEUE_SIZE
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_delivery_timeout() -> u64 {
    courier_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_log_level() -> String {
    "info,courier=debug,tower_http=debug".to_string()
}
