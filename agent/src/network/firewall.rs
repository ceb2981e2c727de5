//! Per-VM ingress firewall.
//!
//! Each VM interface gets its own chain `vm_<iface>` in the bridge-family
//! filter table, jumped to from the table's forward chain for frames leaving
//! through that interface. A sync flushes and refills only that chain; the
//! rendered script depends on nothing but the interface, the mode and the
//! rules, so syncing unchanged inputs reloads a byte-identical chain.

use ipnetwork::IpNetwork;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing::{event, instrument, Level};

use corral_rs::connector::FirewallState;
use corral_rs::firewall::{effective_rules, FirewallMode, FirewallRule, Protocol, RuleAction};

use super::{validate_iface, Network, NetworkError};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("invalid source {0:?}")]
    Source(String),
    #[error("invalid port expression {0:?}")]
    Ports(String),
    #[error("icmp rules cannot match ports")]
    PortsWithoutTransport,
}

pub fn chain_name(iface: &str) -> String {
    format!("vm_{iface}")
}

fn is_any(s: &str) -> bool {
    let s = s.trim();
    s.is_empty() || s.eq_ignore_ascii_case("any")
}

fn source_match(source: &str) -> Result<Option<String>, RuleError> {
    if is_any(source) {
        return Ok(None);
    }
    let net = IpNetwork::from_str(source.trim()).map_err(|_| RuleError::Source(source.to_string()))?;
    let family = match net {
        IpNetwork::V4(_) => "ip",
        IpNetwork::V6(_) => "ip6",
    };
    let full = match net {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    };
    let addr = if net.prefix() == full {
        net.ip().to_string()
    } else {
        format!("{}/{}", net.network(), net.prefix())
    };
    Ok(Some(format!("{family} saddr {addr}")))
}

fn port(s: &str) -> Option<u16> {
    s.trim().parse::<u16>().ok().filter(|p| *p != 0)
}

fn ports_match(ports: &str) -> Result<Option<String>, RuleError> {
    if is_any(ports) {
        return Ok(None);
    }
    let invalid = || RuleError::Ports(ports.to_string());
    let mut items = Vec::new();
    for item in ports.split(',') {
        let item = match item.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (port(lo).ok_or_else(invalid)?, port(hi).ok_or_else(invalid)?);
                if lo > hi {
                    return Err(invalid());
                }
                format!("{lo}-{hi}")
            }
            None => port(item).ok_or_else(invalid)?.to_string(),
        };
        items.push(item);
    }
    Ok(Some(match items.as_slice() {
        [single] => format!("th dport {single}"),
        _ => format!("th dport {{ {} }}", items.join(", ")),
    }))
}

/// The match expression and verdict for one rule.
pub fn rule_expression(rule: &FirewallRule) -> Result<String, RuleError> {
    let source = source_match(&rule.source_cidr)?;
    let ports = ports_match(&rule.dest_ports)?;
    let protocol = match (rule.protocol, &ports) {
        (Protocol::Tcp, _) => Some("meta l4proto tcp"),
        (Protocol::Udp, _) => Some("meta l4proto udp"),
        (Protocol::Icmp, None) => Some("meta l4proto { icmp, ipv6-icmp }"),
        (Protocol::Icmp, Some(_)) => return Err(RuleError::PortsWithoutTransport),
        (Protocol::Any, None) => None,
        (Protocol::Any, Some(_)) => Some("meta l4proto { tcp, udp }"),
    };
    let verdict = match rule.action {
        RuleAction::Allow => "accept",
        RuleAction::Deny => "drop",
    };
    let parts: Vec<&str> = [source.as_deref(), protocol, ports.as_deref(), Some(verdict)]
        .into_iter()
        .flatten()
        .collect();
    Ok(parts.join(" "))
}

/// A rendered chain script plus the rules that were left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainScript {
    pub script: String,
    pub applied: usize,
    pub skipped: Vec<(i64, RuleError)>,
}

/// Render the script that recreates `vm_<iface>` for `mode` and `rules`.
///
/// Rules whose source or ports do not parse are skipped; the rest of the
/// chain, including the default verdict, is still installed.
pub fn chain_script(table: &str, iface: &str, mode: FirewallMode, rules: &[FirewallRule]) -> ChainScript {
    let chain = chain_name(iface);
    let mut s = String::new();
    let mut applied = 0;
    let mut skipped = Vec::new();

    let _ = writeln!(s, "add table bridge {table}");
    let _ = writeln!(
        s,
        "add chain bridge {table} forward {{ type filter hook forward priority filter; policy accept; }}"
    );
    let _ = writeln!(s, "add chain bridge {table} {chain}");
    let _ = writeln!(s, "flush chain bridge {table} {chain}");

    let prefix = format!("add rule bridge {table} {chain}");
    match mode {
        FirewallMode::Disabled => {
            let _ = writeln!(s, "{prefix} accept");
        }
        FirewallMode::Allowlist | FirewallMode::Denylist => {
            let _ = writeln!(s, "{prefix} ct state established,related accept");
            for rule in effective_rules(rules) {
                match rule_expression(rule) {
                    Ok(expr) => {
                        let _ = writeln!(s, "{prefix} {expr}");
                        applied += 1;
                    }
                    Err(e) => skipped.push((rule.id, e)),
                }
            }
            let default = if mode == FirewallMode::Allowlist {
                "drop"
            } else {
                "return"
            };
            let _ = writeln!(s, "{prefix} {default}");
        }
    }

    ChainScript {
        script: s,
        applied,
        skipped,
    }
}

impl Network {
    /// File holding the interface `vm`'s chain was last built for.
    fn iface_record(&self, vm: &str) -> PathBuf {
        self.paths().nft_dir.join("ifaces").join(vm)
    }

    async fn recorded_iface(&self, vm: &str) -> Option<String> {
        let recorded = tokio::fs::read_to_string(self.iface_record(vm)).await.ok()?;
        let recorded = recorded.trim();
        validate_iface(recorded).ok().map(str::to_string)
    }

    /// Rebuild the firewall chain of the VM `vm`, now behind `iface`.
    ///
    /// If the VM's chain was last built for another interface, that chain
    /// and its jump are removed first.
    #[instrument(skip(self, state), fields(mode = %state.mode, rules = state.rules.len()))]
    pub async fn sync_firewall(&self, vm: &str, iface: &str, state: &FirewallState) -> Result<String, NetworkError> {
        let iface = validate_iface(iface)?;
        let chain = chain_name(iface);
        let rendered = chain_script(&self.config().filter_table, iface, state.mode, &state.rules);
        for (id, e) in &rendered.skipped {
            event!(Level::WARN, rule_id = id, error = %e, "Skipping malformed firewall rule");
        }

        let stale = self.recorded_iface(vm).await.filter(|old| old != iface);
        if let Some(old) = &stale {
            event!(Level::INFO, vm, old, new = iface, "Interface changed, removing old chain");
            self.remove_chain(&chain_name(old)).await?;
        }

        self.apply_nft(&format!("{chain}.nft"), &rendered.script).await?;
        let jump_added = self.ensure_jump(&format!("oifname \"{iface}\""), &chain).await?;
        self.write_file(&self.iface_record(vm), iface).await?;

        let mut log = format!(
            "synced {chain} ({}): {} rule(s) applied",
            state.mode, rendered.applied
        );
        if !rendered.skipped.is_empty() {
            let ids: Vec<String> = rendered.skipped.iter().map(|(id, _)| id.to_string()).collect();
            let _ = write!(log, ", skipped malformed rule(s) {}", ids.join(", "));
        }
        if jump_added {
            log.push_str(", jump added");
        }
        if let Some(old) = stale {
            let _ = write!(log, ", removed {}", chain_name(&old));
        }
        Ok(log)
    }

    /// Drop the firewall chain of `vm` behind `iface` and its jump, plus the
    /// chain of any other interface recorded for it.
    pub async fn remove_firewall(&self, vm: &str, iface: &str) -> Result<(), NetworkError> {
        let iface = validate_iface(iface)?;
        if let Some(old) = self.recorded_iface(vm).await.filter(|old| old != iface) {
            self.remove_chain(&chain_name(&old)).await?;
        }
        self.remove_chain(&chain_name(iface)).await?;

        let record = self.iface_record(vm);
        match tokio::fs::remove_file(&record).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(NetworkError::Io { path: record, source }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::exec::CommandOutput;
    use crate::network::test::network;
    use std::sync::Arc;

    fn rule(id: i64, protocol: Protocol, source: &str, ports: &str, action: RuleAction, priority: i32) -> FirewallRule {
        FirewallRule {
            id,
            protocol,
            source_cidr: source.to_string(),
            dest_ports: ports.to_string(),
            action,
            priority,
            enabled: true,
        }
    }

    #[test]
    fn expressions() {
        let r = rule(1, Protocol::Tcp, "any", "22", RuleAction::Allow, 10);
        assert_eq!(rule_expression(&r).unwrap(), "meta l4proto tcp th dport 22 accept");

        let r = rule(2, Protocol::Udp, "10.1.2.3/8", "53,1000-2000", RuleAction::Deny, 10);
        assert_eq!(
            rule_expression(&r).unwrap(),
            "ip saddr 10.0.0.0/8 meta l4proto udp th dport { 53, 1000-2000 } drop"
        );

        let r = rule(3, Protocol::Icmp, "2001:db8::/32", "any", RuleAction::Allow, 10);
        assert_eq!(
            rule_expression(&r).unwrap(),
            "ip6 saddr 2001:db8::/32 meta l4proto { icmp, ipv6-icmp } accept"
        );

        let r = rule(4, Protocol::Any, "192.0.2.7", "any", RuleAction::Deny, 10);
        assert_eq!(rule_expression(&r).unwrap(), "ip saddr 192.0.2.7 drop");
    }

    #[test]
    fn malformed_fields() {
        let r = rule(1, Protocol::Tcp, "10.0.0.0/33", "22", RuleAction::Allow, 1);
        assert!(matches!(rule_expression(&r), Err(RuleError::Source(_))));
        let r = rule(1, Protocol::Tcp, "any", "80-22", RuleAction::Allow, 1);
        assert!(matches!(rule_expression(&r), Err(RuleError::Ports(_))));
        let r = rule(1, Protocol::Tcp, "any", "ssh", RuleAction::Allow, 1);
        assert!(matches!(rule_expression(&r), Err(RuleError::Ports(_))));
        let r = rule(1, Protocol::Icmp, "any", "8", RuleAction::Allow, 1);
        assert_eq!(rule_expression(&r), Err(RuleError::PortsWithoutTransport));
    }

    #[test]
    fn allowlist_chain_order_and_default() {
        let rules = vec![
            rule(7, Protocol::Tcp, "any", "443", RuleAction::Allow, 20),
            rule(3, Protocol::Tcp, "any", "22", RuleAction::Allow, 10),
            rule(9, Protocol::Tcp, "not-a-cidr", "80", RuleAction::Allow, 5),
            FirewallRule {
                enabled: false,
                ..rule(1, Protocol::Any, "any", "any", RuleAction::Allow, 1)
            },
        ];
        let rendered = chain_script("corral", "vnet0", FirewallMode::Allowlist, &rules);
        let rule_lines: Vec<&str> = rendered
            .script
            .lines()
            .filter(|l| l.starts_with("add rule"))
            .collect();
        assert_eq!(
            rule_lines,
            vec![
                "add rule bridge corral vm_vnet0 ct state established,related accept",
                "add rule bridge corral vm_vnet0 meta l4proto tcp th dport 22 accept",
                "add rule bridge corral vm_vnet0 meta l4proto tcp th dport 443 accept",
                "add rule bridge corral vm_vnet0 drop",
            ]
        );
        assert_eq!(rendered.applied, 2);
        assert_eq!(rendered.skipped.len(), 1);
        assert_eq!(rendered.skipped[0].0, 9);
    }

    #[test]
    fn denylist_returns_and_disabled_accepts() {
        let rules = vec![rule(1, Protocol::Tcp, "203.0.113.0/24", "any", RuleAction::Deny, 1)];
        let deny = chain_script("corral", "vnet0", FirewallMode::Denylist, &rules);
        assert!(deny.script.ends_with("add rule bridge corral vm_vnet0 return\n"));

        let disabled = chain_script("corral", "vnet0", FirewallMode::Disabled, &rules);
        let rule_lines: Vec<&str> = disabled
            .script
            .lines()
            .filter(|l| l.starts_with("add rule"))
            .collect();
        assert_eq!(rule_lines, vec!["add rule bridge corral vm_vnet0 accept"]);
        assert!(disabled.script.contains("flush chain bridge corral vm_vnet0\n"));
    }

    #[tokio::test]
    async fn sync_adds_jump_once() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond_seq(
            &["nft", "list", "chain"],
            vec![
                CommandOutput::ok("table bridge corral {\n\tchain forward {\n\t}\n}\n"),
                CommandOutput::ok(
                    "table bridge corral {\n\tchain forward {\n\t\toifname \"vnet0\" jump vm_vnet0\n\t}\n}\n",
                ),
            ],
        );
        let net = network(dir.path(), runner.clone());
        let state = FirewallState {
            mode: FirewallMode::Allowlist,
            rules: vec![rule(1, Protocol::Tcp, "any", "22", RuleAction::Allow, 1)],
        };

        let first = net.sync_firewall("vm1", "vnet0", &state).await.unwrap();
        let script_path = dir.path().join("nft/vm_vnet0.nft");
        let first_script = std::fs::read_to_string(&script_path).unwrap();
        let second = net.sync_firewall("vm1", "vnet0", &state).await.unwrap();
        let second_script = std::fs::read_to_string(&script_path).unwrap();

        assert!(first.ends_with("jump added"));
        assert!(!second.ends_with("jump added"));
        assert_eq!(first_script, second_script);
        let adds: Vec<String> = runner
            .lines()
            .into_iter()
            .filter(|l| l.starts_with("nft add rule"))
            .collect();
        assert_eq!(
            adds,
            vec!["nft add rule bridge corral forward oifname \"vnet0\" jump vm_vnet0"]
        );
    }

    #[tokio::test]
    async fn changed_interface_drops_old_chain() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            &["nft", "-a", "list"],
            CommandOutput::ok(
                "table bridge corral {\n\tchain forward { # handle 1\n\
                 \t\toifname \"vnet0\" jump vm_vnet0 # handle 4\n\t}\n}\n",
            ),
        );
        let net = network(dir.path(), runner.clone());
        let state = FirewallState {
            mode: FirewallMode::Disabled,
            rules: vec![],
        };

        net.sync_firewall("vm1", "vnet0", &state).await.unwrap();
        assert!(!runner.lines().iter().any(|l| l.starts_with("nft delete")));

        let log = net.sync_firewall("vm1", "vnet3", &state).await.unwrap();
        assert!(log.ends_with("removed vm_vnet0"));
        let lines = runner.lines();
        assert!(lines.contains(&"nft delete rule bridge corral forward handle 4".to_string()));
        assert!(lines.contains(&"nft delete chain bridge corral vm_vnet0".to_string()));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("nft/ifaces/vm1")).unwrap(),
            "vnet3"
        );

        net.remove_firewall("vm1", "vnet3").await.unwrap();
        assert!(runner.lines().contains(&"nft delete chain bridge corral vm_vnet3".to_string()));
        assert!(!dir.path().join("nft/ifaces/vm1").exists());
    }
}
