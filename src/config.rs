//! Centralized configuration management for the gateway.
//!
//! All configuration is provided via environment variables (a `.env` file is
//! honored). Validation happens once at startup; invalid configuration is
//! fatal before any listener binds.

use std::net::SocketAddr;
use std::sync::OnceLock;

use crate::error::GatewayError;

// ============================================================================
// Environment variable names
// ============================================================================

mod env {
    pub const PUBLIC_ADDR: &str = "MUXTUN_PUBLIC_ADDR";
    pub const SSH_ADDR: &str = "MUXTUN_SSH_ADDR";
    pub const SOCKS_ADDR: &str = "MUXTUN_SOCKS_ADDR";
    pub const DNS_ADDR: &str = "MUXTUN_DNS_ADDR";
    pub const DNS_ZONES: &str = "MUXTUN_DNS_ZONES";
    pub const DNS_BACKENDS: &str = "MUXTUN_DNS_BACKENDS";
    pub const DB_PATH: &str = "MUXTUN_DB_PATH";
    pub const HOST_KEY: &str = "MUXTUN_HOST_KEY";
}

// ============================================================================
// Global configuration (loaded once at startup)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Config {
    /// Mixed SSH/SOCKS5 public listener.
    pub public_addr: SocketAddr,
    /// Internal SSH gateway listener.
    pub ssh_addr: SocketAddr,
    /// Internal SOCKS5 gateway listener.
    pub socks_addr: SocketAddr,
    /// DNS dispatcher listener.
    pub dns_addr: SocketAddr,
    /// Zone suffixes routed to tunnel backends, in match order.
    pub dns_zones: Vec<String>,
    /// Backend UDP endpoints; one per zone, or a single shared one.
    pub dns_backends: Vec<SocketAddr>,
    /// SQLite accounts database path.
    pub db_path: String,
    /// PEM-encoded RSA host key path.
    pub host_key_path: String,
}

fn addr_var(name: &str, default: &str) -> Result<SocketAddr, GatewayError> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|_| GatewayError::Config(format!("{} is not a valid address: '{}'", name, raw)))
}

fn list_var(name: &str) -> Vec<String> {
    std::env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    fn load() -> Result<Self, GatewayError> {
        let dns_backends = list_var(env::DNS_BACKENDS)
            .into_iter()
            .map(|raw| {
                raw.parse().map_err(|_| {
                    GatewayError::Config(format!(
                        "{} entry is not a valid UDP address: '{}'",
                        env::DNS_BACKENDS,
                        raw
                    ))
                })
            })
            .collect::<Result<Vec<SocketAddr>, _>>()?;

        let config = Self {
            public_addr: addr_var(env::PUBLIC_ADDR, "0.0.0.0:2222")?,
            ssh_addr: addr_var(env::SSH_ADDR, "127.0.0.1:2223")?,
            socks_addr: addr_var(env::SOCKS_ADDR, "127.0.0.1:2224")?,
            dns_addr: addr_var(env::DNS_ADDR, "0.0.0.0:53")?,
            dns_zones: list_var(env::DNS_ZONES),
            dns_backends,
            db_path: std::env::var(env::DB_PATH).unwrap_or_else(|_| "accounts.db".to_string()),
            host_key_path: std::env::var(env::HOST_KEY)
                .unwrap_or_else(|_| "host_key.pem".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        // The dispatcher is optional, but a half-configured one is fatal.
        if self.dns_zones.is_empty() != self.dns_backends.is_empty() {
            return Err(GatewayError::Config(format!(
                "{} and {} must be set together",
                env::DNS_ZONES,
                env::DNS_BACKENDS
            )));
        }
        Ok(())
    }

    /// Whether the DNS dispatcher should run at all.
    pub fn dns_enabled(&self) -> bool {
        !self.dns_zones.is_empty()
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Initialize configuration. Must be called once at startup.
pub fn init() -> Result<&'static Config, GatewayError> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }
    let config = Config::load()?;
    Ok(CONFIG.get_or_init(|| config))
}

/// Get the global configuration. Panics if not initialized.
pub fn get() -> &'static Config {
    CONFIG
        .get()
        .expect("Config not initialized. Call config::init() first.")
}
