//! Layered settings: built-in defaults, an optional config file, then
//! `XRATE__*` environment variables (e.g. `XRATE__POSTGRES__HOST`).

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Parser)]
#[command(name = "xrate", about = "Exchange rate gRPC service")]
pub struct Cli {
    /// Path to a TOML/YAML settings file.
    #[arg(long, env = "CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Overrides the configured environment (local, dev, prod).
    #[arg(long)]
    pub env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub env: String,
    pub grpc: GrpcConfig,
    pub postgres: PostgresConfig,
    pub garantex: GarantexConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrpcConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Server-side cap per call; 0 disables it.
    pub request_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub db_name: String,
    pub user: String,
    pub password: String,
    pub max_conns: u32,
    pub min_conns: u32,
    pub max_conn_lifetime_secs: u64,
    pub max_conn_idle_time_secs: u64,
    pub healthcheck_period_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GarantexConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus listener, only used with the `metrics-exporter` feature.
    pub listen: Option<SocketAddr>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("env", "local")?
            .set_default("grpc.host", "0.0.0.0")?
            .set_default("grpc.port", 50051)?
            .set_default("grpc.request_timeout_secs", 0)?
            .set_default("grpc.shutdown_grace_secs", 10)?
            .set_default("postgres.host", "localhost")?
            .set_default("postgres.port", 5432)?
            .set_default("postgres.db_name", "exchange_rates")?
            .set_default("postgres.user", "postgres")?
            .set_default("postgres.password", "")?
            .set_default("postgres.max_conns", 200)?
            .set_default("postgres.min_conns", 0)?
            .set_default("postgres.max_conn_lifetime_secs", 3600)?
            .set_default("postgres.max_conn_idle_time_secs", 1800)?
            .set_default("postgres.healthcheck_period_secs", 60)?
            .set_default("postgres.connect_timeout_secs", 5)?
            .set_default("garantex.base_url", "https://garantex.org")?
            .set_default("garantex.timeout_ms", 5000)?;

        if let Some(path) = &cli.config {
            builder = builder.add_source(File::from(path.as_path()));
        }

        builder = builder.add_source(
            Environment::with_prefix("XRATE")
                .prefix_separator("__")
                .separator("__"),
        );

        if let Some(env) = &cli.env {
            builder = builder.set_override("env", env.as_str())?;
        }

        builder.build()?.try_deserialize()
    }
}

impl GrpcConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl PostgresConfig {
    pub fn max_conn_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_conn_lifetime_secs)
    }

    pub fn max_conn_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_conn_idle_time_secs)
    }

    pub fn healthcheck_period(&self) -> Duration {
        Duration::from_secs(self.healthcheck_period_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl GarantexConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
