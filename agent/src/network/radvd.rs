//! IPv6 router advertisements with radvd.
//!
//! Each bridge has its own fragment in `radvd_fragment_dir`; the daemon's
//! config file is rebuilt from all fragments so that configuring one bridge
//! never drops another.

use std::fmt::Write as _;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use tracing::{event, instrument, Level};

use corral_rs::net::Ipv6Prefix64;

use super::{validate_iface, Network, NetworkError};
use crate::exec::Invocation;

pub fn interface_block(bridge: &str, prefix: &Ipv6Prefix64, dns_servers: &[Ipv6Addr]) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "interface {bridge}");
    let _ = writeln!(s, "{{");
    let _ = writeln!(s, "\tAdvSendAdvert on;");
    let _ = writeln!(s, "\tMinRtrAdvInterval 30;");
    let _ = writeln!(s, "\tMaxRtrAdvInterval 100;");
    let _ = writeln!(s, "\tprefix {prefix}");
    let _ = writeln!(s, "\t{{");
    let _ = writeln!(s, "\t\tAdvOnLink on;");
    let _ = writeln!(s, "\t\tAdvAutonomous on;");
    let _ = writeln!(s, "\t}};");
    if !dns_servers.is_empty() {
        let servers: Vec<String> = dns_servers.iter().map(|a| a.to_string()).collect();
        let _ = writeln!(s, "\tRDNSS {}", servers.join(" "));
        let _ = writeln!(s, "\t{{");
        let _ = writeln!(s, "\t}};");
    }
    let _ = writeln!(s, "}};");
    s
}

impl Network {
    fn fragment_path(&self, bridge: &str) -> PathBuf {
        self.paths().radvd_fragment_dir.join(format!("{bridge}.conf"))
    }

    /// Concatenate all fragments, sorted by file name.
    async fn assemble_radvd_conf(&self) -> Result<String, NetworkError> {
        let dir = &self.paths().radvd_fragment_dir;
        let io_err = |source| NetworkError::Io {
            path: dir.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
        let mut fragments = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "conf") {
                fragments.push(path);
            }
        }
        fragments.sort();

        let mut conf = String::from("# Generated by corral-agent from radvd fragments.\n");
        for path in fragments {
            let fragment = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| NetworkError::Io {
                    path: path.clone(),
                    source,
                })?;
            conf.push('\n');
            conf.push_str(&fragment);
        }
        Ok(conf)
    }

    /// Advertise `prefix` on `bridge`, with the bridge itself as router at
    /// `<prefix>::1`.
    #[instrument(skip(self, dns_servers))]
    pub async fn configure_ra(
        &self,
        bridge: &str,
        prefix: &Ipv6Prefix64,
        dns_servers: &[Ipv6Addr],
    ) -> Result<String, NetworkError> {
        let bridge = validate_iface(bridge)?;

        self.write_file(
            &self.fragment_path(bridge),
            &interface_block(bridge, prefix, dns_servers),
        )
        .await?;
        let conf = self.assemble_radvd_conf().await?;
        let conf_path = self.paths().radvd_conf.clone();
        self.write_file(&conf_path, &conf).await?;

        let gateway = prefix.gateway();
        self.runner()
            .checked(Invocation::new(
                "ip",
                [
                    "-6".to_string(),
                    "addr".to_string(),
                    "replace".to_string(),
                    format!("{gateway}/64"),
                    "dev".to_string(),
                    bridge.to_string(),
                ],
            ))
            .await?;
        self.runner()
            .checked(Invocation::new(
                "radvd",
                [
                    "--configtest".to_string(),
                    "--config".to_string(),
                    conf_path.to_string_lossy().into_owned(),
                ],
            ))
            .await?;
        self.runner()
            .checked(Invocation::new("systemctl", ["reload-or-restart", "radvd"]))
            .await?;

        event!(Level::INFO, bridge, %prefix, %gateway, "Router advertisements configured");
        Ok(format!("advertising {prefix} on {bridge}, gateway {gateway}"))
    }
}
