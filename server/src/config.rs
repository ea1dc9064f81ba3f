//! Server configuration.
//!
//! Every option has a compiled-in default and can be overridden from the
//! environment. Lookup is case-insensitive: the exact option name is tried
//! first, then its uppercase form (`listen_port`, then `LISTEN_PORT`).

use std::fmt::Display;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for option {name}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub ssl_listen_port: u16,
    pub worker_threads: usize,
    pub jwt_secret: String,
    pub disable_auth: bool,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: String,
    pub redis_prefix: String,
    pub redis_pool_size: usize,
    pub enable_cache: bool,
    pub max_cache_length: u64,
    pub max_cache_request_limit: u64,
    pub default_cache_ttl: u64,
    pub ping_interval: u64,
    pub handshake_timeout: u64,
    pub enable_sse: bool,
    pub enable_ssl: bool,
    pub ssl_ca_certificate: String,
    pub ssl_certificate: String,
    pub ssl_private_key: String,
    pub ssl_cert_auto_reload: bool,
    pub ssl_cert_check_interval: u64,
    pub disable_unsecure_listener: bool,
    pub enable_kvstore: bool,
    pub prometheus_metric_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            ssl_listen_port: 8443,
            worker_threads: 0,
            jwt_secret: String::new(),
            disable_auth: false,
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_password: String::new(),
            redis_prefix: "eventhub".to_string(),
            redis_pool_size: 5,
            enable_cache: false,
            max_cache_length: 1000,
            max_cache_request_limit: 100,
            default_cache_ttl: 60,
            ping_interval: 30,
            handshake_timeout: 5,
            enable_sse: false,
            enable_ssl: false,
            ssl_ca_certificate: String::new(),
            ssl_certificate: String::new(),
            ssl_private_key: String::new(),
            ssl_cert_auto_reload: false,
            ssl_cert_check_interval: 300,
            disable_unsecure_listener: false,
            enable_kvstore: true,
            prometheus_metric_prefix: "eventhub".to_string(),
        }
    }
}

impl Config {
    /// Builds a config from defaults overridden by environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        read_env("listen_port", &mut cfg.listen_port)?;
        read_env("ssl_listen_port", &mut cfg.ssl_listen_port)?;
        read_env("worker_threads", &mut cfg.worker_threads)?;
        read_env_string("jwt_secret", &mut cfg.jwt_secret);
        read_env_bool("disable_auth", &mut cfg.disable_auth)?;
        read_env_string("redis_host", &mut cfg.redis_host);
        read_env("redis_port", &mut cfg.redis_port)?;
        read_env_string("redis_password", &mut cfg.redis_password);
        read_env_string("redis_prefix", &mut cfg.redis_prefix);
        read_env("redis_pool_size", &mut cfg.redis_pool_size)?;
        read_env_bool("enable_cache", &mut cfg.enable_cache)?;
        read_env("max_cache_length", &mut cfg.max_cache_length)?;
        read_env("max_cache_request_limit", &mut cfg.max_cache_request_limit)?;
        read_env("default_cache_ttl", &mut cfg.default_cache_ttl)?;
        read_env("ping_interval", &mut cfg.ping_interval)?;
        read_env("handshake_timeout", &mut cfg.handshake_timeout)?;
        read_env_bool("enable_sse", &mut cfg.enable_sse)?;
        read_env_bool("enable_ssl", &mut cfg.enable_ssl)?;
        read_env_string("ssl_ca_certificate", &mut cfg.ssl_ca_certificate);
        read_env_string("ssl_certificate", &mut cfg.ssl_certificate);
        read_env_string("ssl_private_key", &mut cfg.ssl_private_key);
        read_env_bool("ssl_cert_auto_reload", &mut cfg.ssl_cert_auto_reload)?;
        read_env("ssl_cert_check_interval", &mut cfg.ssl_cert_check_interval)?;
        read_env_bool("disable_unsecure_listener", &mut cfg.disable_unsecure_listener)?;
        read_env_bool("enable_kvstore", &mut cfg.enable_kvstore)?;
        read_env_string("prometheus_metric_prefix", &mut cfg.prometheus_metric_prefix);

        Ok(cfg)
    }

    /// Effective worker count: `worker_threads`, or the machine's available
    /// parallelism when set to 0.
    pub fn worker_count(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Connection URL for the backplane client.
    pub fn redis_url(&self) -> String {
        if self.redis_password.is_empty() {
            format!("redis://{}:{}/", self.redis_host, self.redis_port)
        } else {
            format!(
                "redis://:{}@{}:{}/",
                self.redis_password, self.redis_host, self.redis_port
            )
        }
    }
}

fn lookup(name: &'static str) -> Option<String> {
    std::env::var(name)
        .ok()
        .or_else(|| std::env::var(name.to_uppercase()).ok())
}

fn read_env<T>(name: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr + Display,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw })?;
    }

    Ok(())
}

fn read_env_string(name: &'static str, target: &mut String) {
    if let Some(raw) = lookup(name) {
        *target = raw;
    }
}

fn read_env_bool(name: &'static str, target: &mut bool) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(name) {
        *target = match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => return Err(ConfigError::InvalidValue { name, value: raw }),
        };
    }

    Ok(())
}
