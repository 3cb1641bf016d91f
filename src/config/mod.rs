use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SessionError};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DATA_FILE: &str = "./data/rooms.json";
pub const DEFAULT_PUBLIC_DIR: &str = "./public";
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_ROOM_TTL_HOURS: u64 = 48;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_file: PathBuf,
    pub flush_interval: Duration,
}

/// Timer settings for the session task
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    pub room_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            room_ttl: Duration::from_secs(DEFAULT_ROOM_TTL_HOURS * 60 * 60),
        }
    }
}

impl Config {
    /// Reads configuration from the environment, loading `.env` first if present.
    ///
    /// Missing variables take their defaults. A present but unparsable
    /// numeric value is an error, and so is a zero period or ttl.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("PORT", DEFAULT_PORT)?,
                public_dir: env::var("PUBLIC_DIR")
                    .unwrap_or_else(|_| DEFAULT_PUBLIC_DIR.to_string())
                    .into(),
            },
            storage: StorageConfig {
                data_file: env::var("DATA_FILE")
                    .unwrap_or_else(|_| DEFAULT_DATA_FILE.to_string())
                    .into(),
                flush_interval: interval_secs(
                    "FLUSH_INTERVAL_SECS",
                    parse_var("FLUSH_INTERVAL_SECS", DEFAULT_FLUSH_INTERVAL_SECS)?,
                )?,
            },
            session: SessionConfig {
                heartbeat_interval: interval_secs(
                    "HEARTBEAT_INTERVAL_SECS",
                    parse_var("HEARTBEAT_INTERVAL_SECS", DEFAULT_HEARTBEAT_INTERVAL_SECS)?,
                )?,
                sweep_interval: interval_secs(
                    "SWEEP_INTERVAL_SECS",
                    parse_var("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)?,
                )?,
                room_ttl: ttl_from_hours(parse_var("ROOM_TTL_HOURS", DEFAULT_ROOM_TTL_HOURS)?)?,
            },
        })
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::UNSPECIFIED;
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::LOCALHOST,
            "" | "0.0.0.0" => Ipv4Addr::UNSPECIFIED,
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::UNSPECIFIED
            }
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => parse_value(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| SessionError::configuration(format!("{} has invalid value {:?}", name, raw)))
}

/// Timer periods must be non-zero
fn interval_secs(name: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(SessionError::configuration(format!("{} must be greater than zero", name)));
    }
    Ok(Duration::from_secs(secs))
}

fn ttl_from_hours(hours: u64) -> Result<Duration> {
    if hours == 0 {
        return Err(SessionError::configuration("ROOM_TTL_HOURS must be greater than zero"));
    }
    hours
        .checked_mul(60 * 60)
        .map(Duration::from_secs)
        .ok_or_else(|| SessionError::configuration(format!("ROOM_TTL_HOURS value {} is too large", hours)))
}
