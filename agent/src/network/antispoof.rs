use std::fmt::Write as _;
use std::net::IpAddr;
use tracing::instrument;

use corral_rs::net::MacAddress;

use super::{validate_iface, Network, NetworkError};

pub fn chain_name(iface: &str) -> String {
    format!("as_{iface}")
}

/// Chain dropping frames from `iface` whose source MAC or IP is not the
/// VM's own.
pub fn antispoof_script(table: &str, iface: &str, mac: MacAddress, ip: Option<IpAddr>) -> String {
    let chain = chain_name(iface);
    let prefix = format!("add rule bridge {table} {chain}");
    let mut s = String::new();
    let _ = writeln!(s, "add table bridge {table}");
    let _ = writeln!(
        s,
        "add chain bridge {table} forward {{ type filter hook forward priority filter; policy accept; }}"
    );
    let _ = writeln!(s, "add chain bridge {table} {chain}");
    let _ = writeln!(s, "flush chain bridge {table} {chain}");
    let _ = writeln!(s, "{prefix} ether saddr != {mac} drop");
    match ip {
        Some(IpAddr::V4(ip)) => {
            let _ = writeln!(s, "{prefix} ip saddr != {ip} drop");
        }
        // Link-local addresses are needed for neighbor discovery.
        Some(IpAddr::V6(ip)) => {
            let _ = writeln!(s, "{prefix} ip6 saddr != {{ {ip}, fe80::/10 }} drop");
        }
        None => {}
    }
    s
}

impl Network {
    #[instrument(skip(self))]
    pub async fn apply_antispoof(
        &self,
        iface: &str,
        mac: MacAddress,
        ip: Option<IpAddr>,
    ) -> Result<String, NetworkError> {
        let iface = validate_iface(iface)?;
        let chain = chain_name(iface);
        let script = antispoof_script(&self.config().filter_table, iface, mac, ip);
        self.apply_nft(&format!("{chain}.nft"), &script).await?;
        self.ensure_jump(&format!("iifname \"{iface}\""), &chain).await?;
        Ok(match ip {
            Some(ip) => format!("{iface} pinned to {mac} / {ip}"),
            None => format!("{iface} pinned to {mac}"),
        })
    }

    pub async fn remove_antispoof(&self, iface: &str) -> Result<(), NetworkError> {
        let iface = validate_iface(iface)?;
        self.remove_chain(&chain_name(iface)).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::network::test::network;
    use std::sync::Arc;

    #[test]
    fn v4_and_mac_rules() {
        let mac: MacAddress = "02:00:00:aa:bb:cc".parse().unwrap();
        let script = antispoof_script("corral", "vnet2", mac, Some("10.0.0.5".parse().unwrap()));
        assert!(script.contains("add rule bridge corral as_vnet2 ether saddr != 02:00:00:aa:bb:cc drop\n"));
        assert!(script.contains("add rule bridge corral as_vnet2 ip saddr != 10.0.0.5 drop\n"));
    }

    #[test]
    fn v6_keeps_link_local() {
        let mac: MacAddress = "02:00:00:aa:bb:cc".parse().unwrap();
        let script = antispoof_script("corral", "vnet2", mac, Some("2001:db8::10".parse().unwrap()));
        assert!(script.contains("ip6 saddr != { 2001:db8::10, fe80::/10 } drop"));
    }

    #[tokio::test]
    async fn jumps_on_ingress_interface() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let net = network(dir.path(), runner.clone());
        let mac: MacAddress = "02:00:00:aa:bb:cc".parse().unwrap();

        net.apply_antispoof("vnet2", mac, None).await.unwrap();
        assert!(runner.ran("nft add rule bridge corral forward iifname \"vnet2\" jump as_vnet2"));
        assert!(dir.path().join("nft/as_vnet2.nft").exists());
    }
}
