//! Agent configuration, read from a TOML file at startup.

use chrono::TimeDelta;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use corral_rs::util::chrono::duration;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("neither `controller.token` nor `controller.token_file` is set")]
    MissingToken,
    #[error("failed to read token file {path:?}: {source}")]
    TokenFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("token file {0:?} is empty")]
    EmptyToken(PathBuf),
}

/// Convert a configured duration, treating zero and negative values as
/// "no limit".
pub fn positive(delta: TimeDelta) -> Option<Duration> {
    delta.to_std().ok().filter(|d| !d.is_zero())
}

#[derive(Deserialize, Debug, Clone)]
pub struct AgentConfig {
    pub controller: ControllerConfig,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub exec: ExecConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Object storage for `s3` and `hybrid` backups. Backups requesting a
    /// remote tier fail when this is absent.
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ControllerConfig {
    /// Base URL of the switchboard, e.g. `https://corral.example.net`.
    pub url: String,

    /// Node token. Prefer `token_file` outside of testing.
    #[serde(default)]
    pub token: Option<String>,

    /// File holding the node token on its first line.
    #[serde(default)]
    pub token_file: Option<PathBuf>,

    /// Timeout applied to every request to the switchboard.
    #[serde(with = "duration", default = "default_request_timeout")]
    pub request_timeout: TimeDelta,
}

fn default_request_timeout() -> TimeDelta {
    TimeDelta::seconds(30)
}

impl ControllerConfig {
    pub fn load_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        let path = self.token_file.as_ref().ok_or(ConfigError::MissingToken)?;
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::TokenFile {
            path: path.clone(),
            source,
        })?;
        let token = contents.lines().next().unwrap_or("").trim();
        if token.is_empty() {
            return Err(ConfigError::EmptyToken(path.clone()));
        }
        Ok(token.to_string())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PollConfig {
    /// Sleep between polls that returned no job.
    #[serde(with = "duration", default = "default_poll_interval")]
    pub interval: TimeDelta,

    /// Upper bound for the backoff after failed requests.
    #[serde(with = "duration", default = "default_max_backoff")]
    pub max_backoff: TimeDelta,

    /// Relative jitter applied to every backoff delay, between 0 and 1.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_poll_interval() -> TimeDelta {
    TimeDelta::seconds(5)
}

fn default_max_backoff() -> TimeDelta {
    TimeDelta::minutes(5)
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: default_poll_interval(),
            max_backoff: default_max_backoff(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ExecConfig {
    /// Timeout for commands that don't set their own. `0s` disables it.
    #[serde(with = "duration", default = "default_command_timeout")]
    pub default_timeout: TimeDelta,

    /// Only run programs from the built-in allowlist plus `extra_allowed`.
    #[serde(default = "default_true")]
    pub enforce_allowlist: bool,

    #[serde(default)]
    pub extra_allowed: Vec<String>,

    /// Absolute paths for programs, keyed by program name
    /// (`virsh = "/usr/local/bin/virsh"`).
    #[serde(default)]
    pub binaries: HashMap<String, PathBuf>,
}

fn default_command_timeout() -> TimeDelta {
    TimeDelta::minutes(30)
}

fn default_true() -> bool {
    true
}

impl Default for ExecConfig {
    fn default() -> Self {
        ExecConfig {
            default_timeout: default_command_timeout(),
            enforce_allowlist: true,
            extra_allowed: Vec::new(),
            binaries: HashMap::new(),
        }
    }
}

impl ExecConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        positive(self.default_timeout)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PathsConfig {
    /// Generated domain definitions live below `state_dir/domains`.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Default directory for qcow2 disks.
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,

    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Where generated nftables scripts are written before loading.
    #[serde(default = "default_nft_dir")]
    pub nft_dir: PathBuf,

    #[serde(default = "default_radvd_conf")]
    pub radvd_conf: PathBuf,

    /// One radvd interface block per bridge, assembled into `radvd_conf`.
    #[serde(default = "default_radvd_fragment_dir")]
    pub radvd_fragment_dir: PathBuf,

    /// LXC container path (`lxc.lxcpath`).
    #[serde(default = "default_lxc_path")]
    pub lxc_path: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/corral")
}

fn default_images_dir() -> PathBuf {
    PathBuf::from("/var/lib/corral/images")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/var/backups/corral")
}

fn default_nft_dir() -> PathBuf {
    PathBuf::from("/var/lib/corral/nft")
}

fn default_radvd_conf() -> PathBuf {
    PathBuf::from("/etc/radvd.conf")
}

fn default_radvd_fragment_dir() -> PathBuf {
    PathBuf::from("/etc/radvd.d")
}

fn default_lxc_path() -> PathBuf {
    PathBuf::from("/var/lib/lxc")
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            state_dir: default_state_dir(),
            images_dir: default_images_dir(),
            backup_dir: default_backup_dir(),
            nft_dir: default_nft_dir(),
            radvd_conf: default_radvd_conf(),
            radvd_fragment_dir: default_radvd_fragment_dir(),
            lxc_path: default_lxc_path(),
        }
    }
}

impl PathsConfig {
    /// All paths below `root`, for running against a scratch directory.
    pub fn under(root: &Path) -> Self {
        PathsConfig {
            state_dir: root.join("state"),
            images_dir: root.join("images"),
            backup_dir: root.join("backups"),
            nft_dir: root.join("nft"),
            radvd_conf: root.join("radvd.conf"),
            radvd_fragment_dir: root.join("radvd.d"),
            lxc_path: root.join("lxc"),
        }
    }

    pub fn domains_dir(&self) -> PathBuf {
        self.state_dir.join("domains")
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct NetworkConfig {
    /// Bridge used by instances that don't name one.
    #[serde(default = "default_bridge")]
    pub default_bridge: String,

    /// `inet` table holding NAT / routed forwarding rules.
    #[serde(default = "default_forward_table")]
    pub forward_table: String,

    /// `bridge` table holding per-VM firewall and anti-spoofing chains.
    #[serde(default = "default_filter_table")]
    pub filter_table: String,
}

fn default_bridge() -> String {
    "br0".to_string()
}

fn default_forward_table() -> String {
    "corral_nat".to_string()
}

fn default_filter_table() -> String {
    "corral".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            default_bridge: default_bridge(),
            forward_table: default_forward_table(),
            filter_table: default_filter_table(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct LifecycleConfig {
    /// How long STOP waits for a guest to shut down before destroying it.
    #[serde(with = "duration", default = "default_stop_timeout")]
    pub stop_timeout: TimeDelta,

    /// Interval between `virsh domstate` checks while waiting for shutdown.
    #[serde(with = "duration", default = "default_stop_poll_interval")]
    pub stop_poll_interval: TimeDelta,

    /// QEMU machine type for generated domains.
    #[serde(default = "default_machine_type")]
    pub machine_type: String,

    #[serde(default = "default_lxc_dist")]
    pub lxc_dist: String,

    #[serde(default = "default_lxc_release")]
    pub lxc_release: String,

    #[serde(default = "default_lxc_arch")]
    pub lxc_arch: String,

    /// Capabilities dropped in every container.
    #[serde(default = "default_lxc_cap_drop")]
    pub lxc_cap_drop: Vec<String>,
}

fn default_stop_timeout() -> TimeDelta {
    TimeDelta::seconds(60)
}

fn default_stop_poll_interval() -> TimeDelta {
    TimeDelta::seconds(2)
}

fn default_machine_type() -> String {
    "q35".to_string()
}

fn default_lxc_dist() -> String {
    "debian".to_string()
}

fn default_lxc_release() -> String {
    "bookworm".to_string()
}

fn default_lxc_arch() -> String {
    "amd64".to_string()
}

fn default_lxc_cap_drop() -> Vec<String> {
    ["sys_module", "mac_admin", "mac_override", "sys_time", "sys_rawio"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            stop_timeout: default_stop_timeout(),
            stop_poll_interval: default_stop_poll_interval(),
            machine_type: default_machine_type(),
            lxc_dist: default_lxc_dist(),
            lxc_release: default_lxc_release(),
            lxc_arch: default_lxc_arch(),
            lxc_cap_drop: default_lxc_cap_drop(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ObjectStoreConfig {
    pub bucket: String,

    /// Custom S3 endpoint (`--endpoint-url`), for non-AWS object stores.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Prepended to every object key.
    #[serde(default)]
    pub prefix: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            [controller]
            url = "https://switchboard.example"
            token = "abc"
            "#,
        )
        .unwrap();
        assert_eq!(config.poll.interval, TimeDelta::seconds(5));
        assert_eq!(config.network.default_bridge, "br0");
        assert!(config.exec.enforce_allowlist);
        assert!(config.object_store.is_none());
        assert_eq!(config.controller.load_token().unwrap(), "abc");
    }

    #[test]
    fn human_durations() {
        let config: AgentConfig = toml::from_str(
            r#"
            [controller]
            url = "http://localhost:8080"
            token = "abc"
            request_timeout = "10s"

            [poll]
            interval = "500ms"
            max_backoff = "2m"

            [exec]
            default_timeout = "0s"
            "#,
        )
        .unwrap();
        assert_eq!(config.controller.request_timeout, TimeDelta::seconds(10));
        assert_eq!(config.poll.interval, TimeDelta::milliseconds(500));
        assert_eq!(config.poll.max_backoff, TimeDelta::minutes(2));
        assert_eq!(config.exec.default_timeout(), None);
    }

    #[test]
    fn token_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "s3cret\n").unwrap();
        let controller = ControllerConfig {
            url: "http://localhost".into(),
            token: None,
            token_file: Some(path.clone()),
            request_timeout: default_request_timeout(),
        };
        assert_eq!(controller.load_token().unwrap(), "s3cret");

        std::fs::write(&path, "\n").unwrap();
        assert!(matches!(
            controller.load_token(),
            Err(ConfigError::EmptyToken(_))
        ));
    }
}
