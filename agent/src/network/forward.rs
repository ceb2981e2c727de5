use std::fmt::Write as _;
use tracing::instrument;

use corral_rs::net::NetMode;

use super::{validate_iface, Network, NetworkError};
use crate::exec::Invocation;

/// The forwarding ruleset for one bridge/uplink pair.
///
/// The `add table`/`delete table` preamble lets `nft -f` replace the table
/// in one transaction whether or not it already exists.
pub fn forward_script(table: &str, mode: NetMode, bridge: &str, wan: &str) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "add table inet {table}");
    let _ = writeln!(s, "delete table inet {table}");
    let _ = writeln!(s, "table inet {table} {{");
    match mode {
        NetMode::Nat => {
            let _ = writeln!(s, "\tchain postrouting {{");
            let _ = writeln!(s, "\t\ttype nat hook postrouting priority srcnat; policy accept;");
            let _ = writeln!(s, "\t\tiifname \"{bridge}\" oifname \"{wan}\" masquerade");
            let _ = writeln!(s, "\t}}");
        }
        NetMode::Routed => {
            let _ = writeln!(s, "\tchain forward {{");
            let _ = writeln!(s, "\t\ttype filter hook forward priority filter; policy accept;");
            let _ = writeln!(s, "\t\tiifname \"{bridge}\" oifname \"{wan}\" accept");
            let _ = writeln!(
                s,
                "\t\tiifname \"{wan}\" oifname \"{bridge}\" ct state established,related accept"
            );
            let _ = writeln!(s, "\t\tiifname \"{wan}\" oifname \"{bridge}\" drop");
            let _ = writeln!(s, "\t}}");
        }
    }
    let _ = writeln!(s, "}}");
    s
}

impl Network {
    /// Enable forwarding and (re)load the NAT or routed ruleset.
    #[instrument(skip(self))]
    pub async fn setup_forwarding(
        &self,
        mode: NetMode,
        bridge: &str,
        wan: &str,
    ) -> Result<String, NetworkError> {
        let bridge = validate_iface(bridge)?;
        let wan = validate_iface(wan)?;

        self.runner()
            .checked(Invocation::new("sysctl", ["-w", "net.ipv4.ip_forward=1"]))
            .await?;
        if mode == NetMode::Routed {
            self.runner()
                .checked(Invocation::new(
                    "sysctl",
                    ["-w", "net.ipv6.conf.all.forwarding=1"],
                ))
                .await?;
        }

        let table = &self.config().forward_table;
        let script = forward_script(table, mode, bridge, wan);
        let path = self.apply_nft("forward.nft", &script).await?;
        Ok(format!(
            "loaded {} forwarding {bridge} -> {wan} from {}",
            match mode {
                NetMode::Nat => "NAT",
                NetMode::Routed => "routed",
            },
            path.display()
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::network::test::network;
    use std::sync::Arc;

    #[test]
    fn nat_masquerades_on_egress() {
        let script = forward_script("corral_nat", NetMode::Nat, "br0", "eth0");
        assert!(script.starts_with("add table inet corral_nat\ndelete table inet corral_nat\n"));
        assert!(script.contains("iifname \"br0\" oifname \"eth0\" masquerade"));
        assert!(!script.contains("chain forward"));
    }

    #[test]
    fn routed_only_admits_replies() {
        let script = forward_script("corral_nat", NetMode::Routed, "br0", "eth0");
        assert!(script.contains("iifname \"br0\" oifname \"eth0\" accept"));
        let established = script
            .find("iifname \"eth0\" oifname \"br0\" ct state established,related accept")
            .unwrap();
        let drop = script.find("iifname \"eth0\" oifname \"br0\" drop").unwrap();
        assert!(established < drop);
    }

    #[tokio::test]
    async fn applies_script_in_one_load() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let net = network(dir.path(), runner.clone());

        net.setup_forwarding(NetMode::Nat, "br0", "eth0").await.unwrap();
        let script_path = dir.path().join("nft/forward.nft");
        assert_eq!(
            runner.lines(),
            vec![
                "sysctl -w net.ipv4.ip_forward=1".to_string(),
                format!("nft -f {}", script_path.display()),
            ]
        );
        let script = std::fs::read_to_string(script_path).unwrap();
        assert_eq!(script, forward_script("corral_nat", NetMode::Nat, "br0", "eth0"));
    }

    #[tokio::test]
    async fn rejects_bad_interface_before_touching_anything() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let net = network(dir.path(), runner.clone());

        assert!(net
            .setup_forwarding(NetMode::Nat, "br0", "eth0\"; flush ruleset")
            .await
            .is_err());
        assert!(runner.calls().is_empty());
    }
}
