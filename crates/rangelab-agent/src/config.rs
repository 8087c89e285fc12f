// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the rangelab agent.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ipnetwork::Ipv4Network;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker pool sizing and pacing
    pub worker: WorkerConfig,
    /// Parent CIDR labs are carved from; also the pods CIDR excluded from
    /// lab egress
    pub labs_cidr: Ipv4Network,
    /// Catalog/IPAM database
    pub postgres: PostgresConfig,
    /// RPC server
    pub rpc: RpcConfig,
    /// Path to a kubeconfig file; empty means in-cluster/inferred
    pub kube_config_path: Option<String>,
    /// Run a create/add/delete probe lab at startup
    pub self_check: bool,
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent executors
    pub max_workers: usize,
    /// Pause between tasks on each executor
    pub throttle: Duration,
}

/// Postgres connection configuration.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub ssl_mode: String,
}

/// RPC server configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Bind address
    pub addr: SocketAddr,
    /// TLS enabled; when false a self-signed certificate is generated
    pub tls_enabled: bool,
    /// Certificate chain file (PEM)
    pub tls_cert_file: Option<String>,
    /// Private key file (PEM)
    pub tls_key_file: Option<String>,
    /// Client CA file for mutual TLS (PEM)
    pub tls_ca_file: Option<String>,
    /// Expected `authKey` claim value
    pub auth_key: String,
    /// HS256 sign key for bearer tokens
    pub sign_key: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_workers = parse_env("WORKER_MAX_WORKERS", 10usize)?;
        let throttle_ms = parse_env("WORKER_THROTTLE_MS", 10u64)?;

        let labs_cidr: Ipv4Network = std::env::var("LABS_CIDR")
            .unwrap_or_else(|_| "128.0.0.0/8".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("LABS_CIDR"))?;

        let postgres = PostgresConfig {
            host: require_env("POSTGRES_HOST")?,
            port: parse_env("POSTGRES_PORT", 5432u16)?,
            user: require_env("POSTGRES_USER")?,
            password: require_env("POSTGRES_PASSWORD")?,
            database: require_env("POSTGRES_DB")?,
            ssl_mode: std::env::var("POSTGRES_SSL_MODE")
                .unwrap_or_else(|_| "verify-full".to_string()),
        };

        let host: IpAddr = std::env::var("GRPC_HOST")
            .unwrap_or_else(|_| "0.0.0.0".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("GRPC_HOST"))?;
        let port = parse_env("GRPC_PORT", 5454u16)?;

        let rpc = RpcConfig {
            addr: SocketAddr::new(host, port),
            tls_enabled: bool_env("GRPC_TLS_ENABLED"),
            tls_cert_file: std::env::var("GRPC_TLS_CERT").ok().filter(|v| !v.is_empty()),
            tls_key_file: std::env::var("GRPC_TLS_KEY").ok().filter(|v| !v.is_empty()),
            tls_ca_file: std::env::var("GRPC_TLS_CA").ok().filter(|v| !v.is_empty()),
            auth_key: require_env("AUTH_KEY")?,
            sign_key: require_env("SIGN_KEY")?,
        };

        Ok(Self {
            worker: WorkerConfig {
                max_workers,
                throttle: Duration::from_millis(throttle_ms),
            },
            labs_cidr,
            postgres,
            rpc,
            kube_config_path: std::env::var("KUBE_CONFIG_PATH").ok().filter(|v| !v.is_empty()),
            self_check: bool_env("AGENT_SELF_CHECK"),
        })
    }
}

impl PostgresConfig {
    /// Postgres connection options for sqlx.
    pub fn connect_options(&self) -> Result<sqlx::postgres::PgConnectOptions, ConfigError> {
        use std::str::FromStr;

        let ssl_mode = sqlx::postgres::PgSslMode::from_str(&self.ssl_mode)
            .map_err(|_| ConfigError::InvalidValue("POSTGRES_SSL_MODE"))?;

        Ok(sqlx::postgres::PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(ssl_mode))
    }
}

fn require_env(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key))
}

fn parse_env<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue(key)),
        Err(_) => Ok(default),
    }
}

fn bool_env(key: &'static str) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
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

    fn set_required(guard: &mut EnvGuard) {
        guard.set("POSTGRES_HOST", "localhost");
        guard.set("POSTGRES_USER", "agent");
        guard.set("POSTGRES_PASSWORD", "secret");
        guard.set("POSTGRES_DB", "rangelab");
        guard.set("AUTH_KEY", "auth");
        guard.set("SIGN_KEY", "sign");
    }

    #[test]
    fn config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        set_required(&mut guard);
        for key in [
            "WORKER_MAX_WORKERS",
            "WORKER_THROTTLE_MS",
            "LABS_CIDR",
            "POSTGRES_PORT",
            "POSTGRES_SSL_MODE",
            "GRPC_HOST",
            "GRPC_PORT",
            "GRPC_TLS_ENABLED",
            "KUBE_CONFIG_PATH",
            "AGENT_SELF_CHECK",
        ] {
            guard.remove(key);
        }

        let config = Config::from_env().unwrap();

        assert_eq!(config.worker.max_workers, 10);
        assert_eq!(config.worker.throttle, Duration::from_millis(10));
        assert_eq!(config.labs_cidr, "128.0.0.0/8".parse::<Ipv4Network>().unwrap());
        assert_eq!(config.postgres.port, 5432);
        assert_eq!(config.postgres.ssl_mode, "verify-full");
        assert_eq!(config.rpc.addr, "0.0.0.0:5454".parse().unwrap());
        assert!(!config.rpc.tls_enabled);
        assert!(config.kube_config_path.is_none());
        assert!(!config.self_check);
    }

    #[test]
    fn config_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        set_required(&mut guard);
        guard.set("WORKER_MAX_WORKERS", "4");
        guard.set("WORKER_THROTTLE_MS", "25");
        guard.set("LABS_CIDR", "10.128.0.0/9");
        guard.set("GRPC_HOST", "127.0.0.1");
        guard.set("GRPC_PORT", "6000");
        guard.set("GRPC_TLS_ENABLED", "true");
        guard.set("KUBE_CONFIG_PATH", "/etc/rangelab/kubeconfig");
        guard.set("AGENT_SELF_CHECK", "1");

        let config = Config::from_env().unwrap();

        assert_eq!(config.worker.max_workers, 4);
        assert_eq!(config.worker.throttle, Duration::from_millis(25));
        assert_eq!(config.labs_cidr.prefix(), 9);
        assert_eq!(config.rpc.addr, "127.0.0.1:6000".parse().unwrap());
        assert!(config.rpc.tls_enabled);
        assert_eq!(
            config.kube_config_path.as_deref(),
            Some("/etc/rangelab/kubeconfig")
        );
        assert!(config.self_check);
    }

    #[test]
    fn missing_auth_key_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        set_required(&mut guard);
        guard.remove("AUTH_KEY");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("AUTH_KEY")));
    }

    #[test]
    fn invalid_labs_cidr_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        set_required(&mut guard);
        guard.set("LABS_CIDR", "not-a-cidr");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue("LABS_CIDR")));
    }
}
