//! Host network configuration: bridges, forwarding, per-VM nftables chains
//! and IPv6 router advertisements.
//!
//! nftables changes are always written to a script under `nft_dir` and
//! loaded with a single `nft -f`, so a ruleset is never observed half
//! applied.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{event, Level};

use crate::config::{AgentConfig, NetworkConfig, PathsConfig};
use crate::exec::{CommandRunner, ExecError, Invocation};

pub mod antispoof;
pub mod bridge;
pub mod firewall;
pub mod forward;
pub mod radvd;

/// Longest Linux interface name (`IFNAMSIZ - 1`).
pub const MAX_IFACE_LEN: usize = 15;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("invalid interface name {0:?}")]
    InvalidInterface(String),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Command(#[from] ExecError),
}

/// Interface names end up quoted inside nft scripts and in radvd config;
/// only accept what the kernel would.
pub fn validate_iface(name: &str) -> Result<&str, NetworkError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_IFACE_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(name)
    } else {
        Err(NetworkError::InvalidInterface(name.to_string()))
    }
}

/// Network configurator for one node.
pub struct Network {
    runner: Arc<dyn CommandRunner>,
    paths: PathsConfig,
    config: NetworkConfig,
}

impl Network {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &AgentConfig) -> Self {
        Network {
            runner,
            paths: config.paths.clone(),
            config: config.network.clone(),
        }
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn paths(&self) -> &PathsConfig {
        &self.paths
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub(crate) async fn write_file(&self, path: &Path, contents: &str) -> Result<(), NetworkError> {
        let io_err = |source| NetworkError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(path, contents).await.map_err(io_err)
    }

    /// Write `script` to `nft_dir/<file_name>` and load it atomically.
    pub(crate) async fn apply_nft(&self, file_name: &str, script: &str) -> Result<PathBuf, NetworkError> {
        let path = self.paths.nft_dir.join(file_name);
        self.write_file(&path, script).await?;
        self.runner
            .checked(Invocation::new(
                "nft",
                ["-f".to_string(), path.to_string_lossy().into_owned()],
            ))
            .await?;
        event!(Level::DEBUG, ?path, "Loaded nft script");
        Ok(path)
    }

    /// Make sure `chain` in the bridge filter table is jumped to from its
    /// forward chain by a rule matching `matcher` (e.g. `oifname "vnet0"`).
    ///
    /// Returns whether a rule was added. Repeated calls never stack up
    /// duplicate jumps.
    pub(crate) async fn ensure_jump(&self, matcher: &str, chain: &str) -> Result<bool, NetworkError> {
        let table = &self.config.filter_table;
        let listing = self
            .runner
            .checked(Invocation::new(
                "nft",
                ["list", "chain", "bridge", table.as_str(), "forward"],
            ))
            .await?;
        let jump = format!("{matcher} jump {chain}");
        if listing.stdout.lines().any(|line| line.trim() == jump) {
            return Ok(false);
        }

        let mut args: Vec<String> = ["add", "rule", "bridge", table.as_str(), "forward"]
            .into_iter()
            .map(str::to_string)
            .collect();
        args.extend(jump.split_whitespace().map(str::to_string));
        self.runner.checked(Invocation::new("nft", args)).await?;
        event!(Level::DEBUG, %jump, "Added forward jump");
        Ok(true)
    }

    /// Remove `chain` and every forward rule jumping to it. Absent chains
    /// are not an error.
    pub(crate) async fn remove_chain(&self, chain: &str) -> Result<(), NetworkError> {
        let table = &self.config.filter_table;
        let listing = self
            .runner
            .run(Invocation::new(
                "nft",
                ["-a", "list", "chain", "bridge", table.as_str(), "forward"],
            ))
            .await;
        if !listing.success() {
            // No table, so nothing to remove.
            return Ok(());
        }
        let target = format!("jump {chain}");
        for handle in listing
            .stdout
            .lines()
            .filter(|line| line.contains(&target))
            .filter_map(rule_handle)
        {
            self.runner
                .checked(Invocation::new(
                    "nft",
                    [
                        "delete", "rule", "bridge", table.as_str(), "forward", "handle", handle,
                    ],
                ))
                .await?;
        }

        let deleted = self
            .runner
            .run(Invocation::new(
                "nft",
                ["delete", "chain", "bridge", table.as_str(), chain],
            ))
            .await;
        if !deleted.success() {
            event!(Level::DEBUG, chain, error = deleted.diagnostic(), "Chain not deleted");
        }
        Ok(())
    }
}

/// The `# handle N` suffix `nft -a` prints after each rule.
fn rule_handle(line: &str) -> Option<&str> {
    let (_, handle) = line.rsplit_once("# handle ")?;
    let handle = handle.trim();
    handle
        .chars()
        .all(|c| c.is_ascii_digit())
        .then_some(handle)
        .filter(|h| !h.is_empty())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::exec::CommandOutput;

    pub(crate) fn network(root: &Path, runner: Arc<FakeRunner>) -> Network {
        let mut config: AgentConfig = toml::from_str(
            r#"
            [controller]
            url = "http://localhost"
            token = "t"
            "#,
        )
        .unwrap();
        config.paths = PathsConfig::under(root);
        Network::new(runner, &config)
    }

    #[test]
    fn interface_names() {
        assert!(validate_iface("br0").is_ok());
        assert!(validate_iface("vnet12").is_ok());
        assert!(validate_iface("eth0.100").is_ok());
        assert!(validate_iface("").is_err());
        assert!(validate_iface("averyveryverylongname").is_err());
        assert!(validate_iface("br0\" accept").is_err());
    }

    #[test]
    fn handles() {
        assert_eq!(
            rule_handle("\t\toifname \"vnet0\" jump vm_vnet0 # handle 7"),
            Some("7")
        );
        assert_eq!(rule_handle("oifname \"vnet0\" jump vm_vnet0"), None);
    }

    #[tokio::test]
    async fn remove_chain_deletes_jumps_by_handle() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            &["nft", "-a", "list"],
            CommandOutput::ok(
                "table bridge corral {\n\tchain forward { # handle 1\n\
                 \t\toifname \"vnet0\" jump vm_vnet0 # handle 4\n\
                 \t\toifname \"vnet1\" jump vm_vnet1 # handle 5\n\t}\n}\n",
            ),
        );
        let net = network(dir.path(), runner.clone());
        net.remove_chain("vm_vnet0").await.unwrap();

        let lines = runner.lines();
        assert!(lines.contains(&"nft delete rule bridge corral forward handle 4".to_string()));
        assert!(!lines.iter().any(|l| l.ends_with("handle 5")));
        assert_eq!(lines.last().unwrap(), "nft delete chain bridge corral vm_vnet0");
    }
}
