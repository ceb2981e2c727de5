//! Postgres access. Every function takes an executor so callers decide whether it runs on the
//! pool or inside a transaction.

pub mod backup;
pub mod firewall;
pub mod ipam;
pub mod job;
pub mod node;
pub mod storage_pool;
pub mod vm;

use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Host address as stored in an `inet` column.
pub fn host_network(ip: IpAddr) -> IpNetwork {
    IpNetwork::from(ip)
}
