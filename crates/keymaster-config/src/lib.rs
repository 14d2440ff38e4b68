//! Configuration loading and tracing-subscriber init for the `keymaster-reaperd` binary (and any
//! future CLI front-end), modeled on the teacher's `CoreConfig::load()` — env/TOML via the
//! `config` crate, `dotenvy` for `.env`, `tracing-subscriber` for structured logs.

use serde::{Deserialize, Serialize};

/// Global runtime configuration. Load precedence: env `KEYMASTER_CONFIG` path > `config/keymaster.toml`
/// (if it exists) > defaults, with `KEYMASTER__`-prefixed environment variables overriding both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeymasterConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Default per-account deploy timeout, in seconds (spec.md §5: dial 10s + session open 10s + transfer 40s = 60s).
    #[serde(default = "default_deploy_timeout_secs")]
    pub deploy_timeout_secs: u64,
    /// Default Parallel Runner concurrency. `None` defers to `num_cpus * 2`.
    #[serde(default)]
    pub parallel_concurrency: Option<usize>,
    /// Session Reaper sweep interval, in seconds (spec.md §4.7 default: 1 minute).
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// Bootstrap session TTL, in hours (spec.md §4.7 default: ≤ 24h).
    #[serde(default = "default_bootstrap_ttl_hours")]
    pub bootstrap_ttl_hours: i64,
    /// SSH port used when none is specified per-account.
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

fn default_db_path() -> String {
    "./keymaster.db".to_string()
}

fn default_deploy_timeout_secs() -> u64 {
    60
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_bootstrap_ttl_hours() -> i64 {
    24
}

fn default_ssh_port() -> u16 {
    22
}

impl KeymasterConfig {
    /// Load config from file and environment. Precedence: env `KEYMASTER_CONFIG` path >
    /// `config/keymaster.toml` > defaults, then `KEYMASTER__`-prefixed env vars on top.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("KEYMASTER_CONFIG").unwrap_or_else(|_| "config/keymaster".to_string());

        let builder = config::Config::builder()
            .set_default("db_path", default_db_path())?
            .set_default("deploy_timeout_secs", default_deploy_timeout_secs() as i64)?
            .set_default("reaper_interval_secs", default_reaper_interval_secs() as i64)?
            .set_default("bootstrap_ttl_hours", default_bootstrap_ttl_hours())?
            .set_default("ssh_port", default_ssh_port() as i64)?;

        let path = std::path::Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("KEYMASTER").separator("__"))
            .build()?;

        built.try_deserialize()
    }
}

pub mod telemetry {
    /// Initializes a `tracing-subscriber` registry reading `RUST_LOG` (default `info`), the same
    /// shape the teacher's daemon binary sets up at process start.
    pub fn init_tracing() {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_config_file_or_env() {
        let config = KeymasterConfig::load().unwrap();
        assert_eq!(config.deploy_timeout_secs, 60);
        assert_eq!(config.reaper_interval_secs, 60);
        assert_eq!(config.bootstrap_ttl_hours, 24);
        assert_eq!(config.ssh_port, 22);
    }
}
