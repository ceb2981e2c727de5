use corral_rs::util::chrono::duration as human_duration;
use miette::{IntoDiagnostic, WrapErr};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use xdg::BaseDirectories;

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchboardConfig {
    /// Configuration for connecting to PostgreSQL server.
    pub database: DatabaseConfig,
    /// Configuration of the HTTP server.
    pub server: ServerConfig,
    /// Configuration of the Switchboard service.
    pub service: ServiceConfig,
    /// Configuration of Switchboard logging.
    #[serde(default)]
    pub log: LogConfig,
    /// Periodic backups and pruning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// IP address of database server, OR path to Unix socket.
    ///
    /// **NOTE**: if this is a path to a unix socket, `port` MUST be set to `None`.
    pub host: String,
    /// Port of the database server, or `None` if using a Unix socket.
    pub port: Option<u16>,
    /// Name of the database to connect to.
    pub database: String,
    /// Name of the user to connect with.
    pub user: String,
    /// Authentication credentials, if necessary.
    pub auth: Option<DatabaseCredentials>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseCredentials {
    /// Use a password to connect to the database.
    Password(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind to.
    pub bind_address: SocketAddr,
    /// Optional TLS mode for testing only.
    pub testing_only_tls_config: Option<TestingOnlyTlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestingOnlyTlsConfig {
    /// Public key (for TLS).
    pub cert: PathBuf,
    /// Private key (for TLS).
    pub key: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Bearer token required on every `/api/v1` request.
    pub admin_token: String,
    /// How long a node's previous token keeps working after rotation.
    #[serde(with = "human_duration", default = "default_token_grace_period")]
    pub token_grace_period: chrono::TimeDelta,
    /// Job logs are cut to this many bytes before they are stored.
    #[serde(default = "default_log_max_bytes")]
    pub log_max_bytes: usize,
    /// Default age after which an `in_progress` job is listed as stale.
    #[serde(with = "human_duration", default = "default_stale_job_after")]
    pub stale_job_after: chrono::TimeDelta,
    /// Lifetime of a cached node token verification.
    #[serde(with = "human_duration", default = "default_auth_cache_ttl")]
    pub auth_cache_ttl: chrono::TimeDelta,
}

fn default_token_grace_period() -> chrono::TimeDelta {
    chrono::TimeDelta::hours(1)
}

fn default_log_max_bytes() -> usize {
    64 * 1024
}

fn default_stale_job_after() -> chrono::TimeDelta {
    chrono::TimeDelta::minutes(30)
}

fn default_auth_cache_ttl() -> chrono::TimeDelta {
    chrono::TimeDelta::seconds(60)
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Whether the switchboard enqueues backups and prunes on its own.
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    /// Time between two passes over the backup policies.
    #[serde(with = "human_duration", default = "default_scheduler_interval")]
    pub interval: chrono::TimeDelta,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            enabled: default_scheduler_enabled(),
            interval: default_scheduler_interval(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_scheduler_interval() -> chrono::TimeDelta {
    chrono::TimeDelta::minutes(15)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, multi-field lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    /// Output format of the tracing subscriber.
    #[serde(default)]
    pub format: LogFormat,
}

/// Load the switchboard configuration.
pub fn load_configuration(
    path: Option<&Path>,
    xdg_basedirs: &BaseDirectories,
) -> miette::Result<SwitchboardConfig> {
    let path = path
        .and_then(|p| {
            if p.exists() {
                Some(p.to_path_buf())
            } else {
                tracing::warn!(
                    "Specified configuration file '{}' does not exist",
                    p.display()
                );
                None
            }
        })
        .ok_or(())
        .or_else(|()| {
            tracing::warn!("Searching for corral/config.toml in XDG configuration directories.");
            xdg_basedirs
                .find_config_file("config.toml")
                .ok_or(miette::miette!(
                    "couldn't find path to 'config.toml' in XDG config dirs"
                ))
        })?;

    extract_configuration(&path)
}

fn extract_configuration(path: &Path) -> miette::Result<SwitchboardConfig> {
    use figment::providers::{self, Format};
    figment::Figment::new()
        .merge(providers::Toml::file(path))
        .merge(providers::Env::prefixed("CORRAL_").split("__"))
        .extract()
        .into_diagnostic()
        .wrap_err("Failed to extract switchboard configuration")
}

#[cfg(test)]
mod test {
    use super::*;

    const MINIMAL: &str = r#"
        [database]
        host = "localhost"
        port = 5432
        database = "corral"
        user = "corral"
        auth = { password = "hunter2" }

        [server]
        bind_address = "127.0.0.1:8080"

        [service]
        admin_token = "admin-secret"
    "#;

    #[test]
    fn defaults_fill_in() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.toml", MINIMAL)?;
            let config = extract_configuration(Path::new("config.toml")).unwrap();
            assert_eq!(config.service.log_max_bytes, 65536);
            assert_eq!(config.service.token_grace_period, chrono::TimeDelta::hours(1));
            assert_eq!(config.log.format, LogFormat::Pretty);
            assert!(config.scheduler.enabled);
            assert_eq!(config.scheduler.interval, chrono::TimeDelta::minutes(15));
            assert!(config.server.testing_only_tls_config.is_none());
            assert!(matches!(
                config.database.auth,
                Some(DatabaseCredentials::Password(ref p)) if p == "hunter2"
            ));
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.toml", MINIMAL)?;
            jail.set_env("CORRAL_SERVICE__TOKEN_GRACE_PERIOD", "10m");
            jail.set_env("CORRAL_LOG__FORMAT", "json");
            jail.set_env("CORRAL_SCHEDULER__INTERVAL", "1h");
            jail.set_env("CORRAL_SCHEDULER__ENABLED", "false");
            let config = extract_configuration(Path::new("config.toml")).unwrap();
            assert_eq!(config.service.token_grace_period, chrono::TimeDelta::minutes(10));
            assert_eq!(config.log.format, LogFormat::Json);
            assert_eq!(config.scheduler.interval, chrono::TimeDelta::hours(1));
            assert!(!config.scheduler.enabled);
            Ok(())
        });
    }
}
