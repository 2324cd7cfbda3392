use crate::policy::AllowRule;
use anyhow::{bail, Result};
use std::time::Duration;
use tracing::warn;

/// Process configuration, resolved once from the environment at startup.
///
/// Immutable for the lifetime of the process: the route table and allow-list
/// built from it are read without locking by every connection handler.
#[derive(Debug, Clone)]
pub struct Config {
    pub proxy_port: u16,
    pub health_port: u16,
    pub allowed_ips_raw: String,
    pub allowed_ips: Vec<AllowRule>,
    pub proxy_connect_timeout: Duration,
    pub proxy_timeout: Duration,
    pub preread_timeout: Duration,
    pub rate_limit_per_ip: u32,
    pub log_level: String,
    pub log_pretty: bool,
}

const DEFAULT_PORT: u16 = 443;
const DEFAULT_HEALTH_PORT: u16 = 3000;
const DEFAULT_ALLOWED_IPS: &str = "0.0.0.0/0";
const DEFAULT_PROXY_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PROXY_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_PREREAD_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RATE_LIMIT_PER_IP: u32 = 100;
const DEFAULT_LOG_LEVEL: &str = "info";
const MIN_TIMEOUT_MS: u64 = 1_000;

impl Config {
    /// Load configuration from the process environment, validating every
    /// field and aborting with every failed check enumerated rather than
    /// stopping at the first one.
    pub fn from_env() -> Result<Self> {
        let mut errors = Vec::new();

        let proxy_port = parse_port("PORT", DEFAULT_PORT, &mut errors);
        let health_port = parse_port("HEALTH_PORT", DEFAULT_HEALTH_PORT, &mut errors);

        if proxy_port == health_port {
            errors.push(format!(
                "PORT and HEALTH_PORT must differ (both are {})",
                proxy_port
            ));
        }

        let allowed_ips_raw =
            env_or_default("ALLOWED_IPS", DEFAULT_ALLOWED_IPS);
        let allowed_ips = AllowRule::parse_list(&allowed_ips_raw);
        if allowed_ips.is_empty() {
            warn!("ALLOWED_IPS is empty or fully invalid: all source addresses will be admitted");
        }

        let proxy_connect_timeout = parse_timeout_ms(
            "PROXY_CONNECT_TIMEOUT",
            DEFAULT_PROXY_CONNECT_TIMEOUT_MS,
            &mut errors,
        );
        let proxy_timeout =
            parse_timeout_ms("PROXY_TIMEOUT", DEFAULT_PROXY_TIMEOUT_MS, &mut errors);
        let preread_timeout =
            parse_timeout_ms("PREREAD_TIMEOUT", DEFAULT_PREREAD_TIMEOUT_MS, &mut errors);

        let rate_limit_per_ip = match std::env::var("RATE_LIMIT_PER_IP") {
            Ok(v) => match v.parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    errors.push(format!("RATE_LIMIT_PER_IP must be a positive integer, got {:?}", v));
                    DEFAULT_RATE_LIMIT_PER_IP
                }
            },
            Err(_) => DEFAULT_RATE_LIMIT_PER_IP,
        };

        let log_level = env_or_default("LOG_LEVEL", DEFAULT_LOG_LEVEL);
        let log_pretty = match std::env::var("LOG_PRETTY") {
            Ok(v) => v.eq_ignore_ascii_case("true") || v == "1",
            Err(_) => false,
        };

        if !errors.is_empty() {
            bail!("invalid configuration:\n  - {}", errors.join("\n  - "));
        }

        Ok(Self {
            proxy_port,
            health_port,
            allowed_ips_raw,
            allowed_ips,
            proxy_connect_timeout,
            proxy_timeout,
            preread_timeout,
            rate_limit_per_ip,
            log_level,
            log_pretty,
        })
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_port(key: &str, default: u16, errors: &mut Vec<String>) -> u16 {
    match std::env::var(key) {
        Ok(v) => match v.parse::<u32>() {
            Ok(n) if (1..=65535).contains(&n) => n as u16,
            _ => {
                errors.push(format!("{} must be an integer in 1..65535, got {:?}", key, v));
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_timeout_ms(key: &str, default_ms: u64, errors: &mut Vec<String>) -> Duration {
    match std::env::var(key) {
        Ok(v) => match v.parse::<u64>() {
            Ok(ms) if ms >= MIN_TIMEOUT_MS => Duration::from_millis(ms),
            Ok(ms) => {
                errors.push(format!("{} must be at least {}ms, got {}ms", key, MIN_TIMEOUT_MS, ms));
                Duration::from_millis(default_ms)
            }
            Err(_) => {
                errors.push(format!("{} must be an integer number of milliseconds, got {:?}", key, v));
                Duration::from_millis(default_ms)
            }
        },
        Err(_) => Duration::from_millis(default_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "PORT",
            "HEALTH_PORT",
            "ALLOWED_IPS",
            "PROXY_CONNECT_TIMEOUT",
            "PROXY_TIMEOUT",
            "PREREAD_TIMEOUT",
            "RATE_LIMIT_PER_IP",
            "LOG_LEVEL",
            "LOG_PRETTY",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn defaults_are_valid() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let config = Config::from_env().unwrap();
        assert_eq!(config.proxy_port, DEFAULT_PORT);
        assert_eq!(config.health_port, DEFAULT_HEALTH_PORT);
        assert_eq!(config.rate_limit_per_ip, DEFAULT_RATE_LIMIT_PER_IP);
    }

    #[test]
    fn rejects_matching_ports() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("PORT", "8443");
            std::env::set_var("HEALTH_PORT", "8443");
        }
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("must differ"));
        clear_env();
    }

    #[test]
    fn rejects_sub_minimum_timeout() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe { std::env::set_var("PREREAD_TIMEOUT", "10") };
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("PREREAD_TIMEOUT"));
        clear_env();
    }

    #[test]
    fn enumerates_every_failed_check() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("PORT", "99999");
            std::env::set_var("PROXY_TIMEOUT", "5");
        }
        let err = Config::from_env().unwrap_err().to_string();
        assert!(err.contains("PORT"));
        assert!(err.contains("PROXY_TIMEOUT"));
        clear_env();
    }
}
