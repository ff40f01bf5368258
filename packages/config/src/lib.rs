// ABOUTME: Environment-sourced configuration for the codehive server
// ABOUTME: Typed Config with validation for limits, URLs and listen address

use std::env;
use std::num::ParseIntError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid port number: {0}")]
    InvalidPort(#[from] ParseIntError),
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("Invalid memory limit: {0}")]
    InvalidMemoryLimit(String),
    #[error("Invalid CPU limit: {0}")]
    InvalidCpuLimit(String),
}

/// Server configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub app_url: String,
    pub database_url: String,
    pub redis_url: String,

    /// Hard ceiling for per-job wall timeouts (admission clamps to this).
    pub max_execution_time_ms: u64,
    /// Default and maximum sandbox memory limit, docker size string.
    pub max_memory_limit: String,
    /// Default and maximum sandbox CPU share, fractional cores.
    pub max_cpu_limit: f64,

    /// Per-user submissions allowed inside the rolling window.
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,

    /// Container image used for compile-and-run sandboxes.
    pub sandbox_image: String,
    /// Host directory under which per-run workspaces are materialized.
    pub sandbox_scratch_root: String,
    /// Global cap on concurrently live sandboxes.
    pub max_concurrent_sandboxes: usize,
    /// Number of queue worker lanes.
    pub worker_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4100,
            app_url: "http://localhost:4100".to_string(),
            database_url: "sqlite:codehive.db".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_execution_time_ms: 30_000,
            max_memory_limit: "128m".to_string(),
            max_cpu_limit: 0.5,
            rate_limit_max: 5,
            rate_limit_window_ms: 60_000,
            sandbox_image: "gcc:13".to_string(),
            sandbox_scratch_root: "/tmp/codehive-runs".to_string(),
            max_concurrent_sandboxes: 5,
            worker_count: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let port = match env::var("PORT") {
            Ok(raw) => {
                let port = raw.parse::<u16>()?;
                if port == 0 {
                    return Err(ConfigError::PortOutOfRange(port));
                }
                port
            }
            Err(_) => defaults.port,
        };

        let max_memory_limit =
            env::var("MAX_MEMORY_LIMIT").unwrap_or_else(|_| defaults.max_memory_limit.clone());
        if parse_memory_limit(&max_memory_limit).is_none() {
            return Err(ConfigError::InvalidMemoryLimit(max_memory_limit));
        }

        let max_cpu_limit = match env::var("MAX_CPU_LIMIT") {
            Ok(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|v| *v > 0.0 && *v <= 4.0)
                .ok_or(ConfigError::InvalidCpuLimit(raw))?,
            Err(_) => defaults.max_cpu_limit,
        };

        Ok(Self {
            port,
            app_url: env::var("APP_URL")
                .unwrap_or_else(|_| format!("http://localhost:{}", port)),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            max_execution_time_ms: parse_env_u64(
                "MAX_EXECUTION_TIME_MS",
                defaults.max_execution_time_ms,
            ),
            max_memory_limit,
            max_cpu_limit,
            rate_limit_max: parse_env_u64("RATE_LIMIT_MAX", defaults.rate_limit_max as u64) as u32,
            rate_limit_window_ms: parse_env_u64(
                "RATE_LIMIT_WINDOW_MS",
                defaults.rate_limit_window_ms,
            ),
            sandbox_image: env::var("SANDBOX_IMAGE").unwrap_or(defaults.sandbox_image),
            sandbox_scratch_root: env::var("SANDBOX_SCRATCH_ROOT")
                .unwrap_or(defaults.sandbox_scratch_root),
            max_concurrent_sandboxes: parse_env_u64(
                "MAX_CONCURRENT_SANDBOXES",
                defaults.max_concurrent_sandboxes as u64,
            ) as usize,
            worker_count: parse_env_u64("WORKER_COUNT", defaults.worker_count as u64) as usize,
        })
    }
}

fn parse_env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Parse a docker-style size string (`"128m"`, `"2g"`, `"512k"`, plain bytes)
/// into bytes. Returns `None` for anything that does not match `^\d+[kmg]?$`.
pub fn parse_memory_limit(raw: &str) -> Option<u64> {
    let raw = raw.trim().to_ascii_lowercase();
    if raw.is_empty() {
        return None;
    }
    let (digits, multiplier) = match raw.as_bytes()[raw.len() - 1] {
        b'k' => (&raw[..raw.len() - 1], 1024u64),
        b'm' => (&raw[..raw.len() - 1], 1024 * 1024),
        b'g' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        b'0'..=b'9' => (raw.as_str(), 1),
        _ => return None,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.max_execution_time_ms, 30_000);
        assert_eq!(config.max_memory_limit, "128m");
        assert_eq!(config.max_cpu_limit, 0.5);
        assert_eq!(config.max_concurrent_sandboxes, 5);
        assert_eq!(config.worker_count, 3);
    }

    #[test]
    fn memory_limit_parsing() {
        assert_eq!(parse_memory_limit("128m"), Some(128 * 1024 * 1024));
        assert_eq!(parse_memory_limit("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("512k"), Some(512 * 1024));
        assert_eq!(parse_memory_limit("1048576"), Some(1_048_576));
        assert_eq!(parse_memory_limit("128mb"), None);
        assert_eq!(parse_memory_limit("m"), None);
        assert_eq!(parse_memory_limit(""), None);
        assert_eq!(parse_memory_limit("-1m"), None);
    }
}
