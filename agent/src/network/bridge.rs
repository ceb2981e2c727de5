use tracing::{event, instrument, Level};

use super::{validate_iface, Network, NetworkError};
use crate::exec::Invocation;

/// What `ip -d -o link show` says about an existing bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeState {
    pub up: bool,
    pub stp: bool,
}

/// Parse one line of `ip -d -o link show dev <bridge>`.
pub fn parse_link_details(output: &str) -> BridgeState {
    let flags = output
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map(|(flags, _)| flags)
        .unwrap_or("");
    BridgeState {
        up: flags.split(',').any(|f| f == "UP"),
        stp: output
            .split_whitespace()
            .collect::<Vec<_>>()
            .windows(2)
            .any(|w| w[0] == "stp_state" && w[1] != "0"),
    }
}

impl Network {
    /// Create `bridge` if needed, then enable STP and bring it up. Every
    /// step is skipped when already satisfied.
    #[instrument(skip(self))]
    pub async fn ensure_bridge(&self, bridge: &str) -> Result<Vec<String>, NetworkError> {
        let bridge = validate_iface(bridge)?;
        let mut done = Vec::new();

        let show = self
            .runner()
            .exec("ip", &["-d", "-o", "link", "show", "dev", bridge])
            .await;
        let state = if show.success() {
            parse_link_details(&show.stdout)
        } else {
            self.runner()
                .checked(Invocation::new(
                    "ip",
                    ["link", "add", "name", bridge, "type", "bridge"],
                ))
                .await?;
            done.push(format!("created bridge {bridge}"));
            BridgeState {
                up: false,
                stp: false,
            }
        };

        if !state.stp {
            self.runner()
                .checked(Invocation::new(
                    "ip",
                    ["link", "set", "dev", bridge, "type", "bridge", "stp_state", "1"],
                ))
                .await?;
            done.push(format!("enabled STP on {bridge}"));
        }
        if !state.up {
            self.runner()
                .checked(Invocation::new("ip", ["link", "set", "dev", bridge, "up"]))
                .await?;
            done.push(format!("brought up {bridge}"));
        }

        if done.is_empty() {
            done.push(format!("bridge {bridge} already configured"));
        }
        event!(Level::DEBUG, bridge, steps = done.len(), "Bridge ensured");
        Ok(done)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::exec::CommandOutput;
    use crate::network::test::network;
    use std::sync::Arc;

    const READY: &str = "5: br0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP mode DEFAULT group default qlen 1000\\    link/ether 02:11:22:33:44:55 brd ff:ff:ff:ff:ff:ff promiscuity 0 \\    bridge forward_delay 1500 hello_time 200 max_age 2000 ageing_time 30000 stp_state 1 priority 32768";

    #[test]
    fn parses_flags_and_stp() {
        assert_eq!(parse_link_details(READY), BridgeState { up: true, stp: true });
        let down = READY
            .replace("UP,LOWER_UP", "")
            .replace("stp_state 1", "stp_state 0");
        assert_eq!(parse_link_details(&down), BridgeState { up: false, stp: false });
    }

    #[tokio::test]
    async fn existing_ready_bridge_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["ip", "-d"], CommandOutput::ok(READY));
        let net = network(dir.path(), runner.clone());

        let done = net.ensure_bridge("br0").await.unwrap();
        assert_eq!(done, vec!["bridge br0 already configured"]);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn missing_bridge_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            &["ip", "-d"],
            CommandOutput::failed(1, "Device \"br0\" does not exist."),
        );
        let net = network(dir.path(), runner.clone());

        net.ensure_bridge("br0").await.unwrap();
        assert_eq!(
            runner.lines()[1..],
            [
                "ip link add name br0 type bridge",
                "ip link set dev br0 type bridge stp_state 1",
                "ip link set dev br0 up",
            ]
        );
    }
}
