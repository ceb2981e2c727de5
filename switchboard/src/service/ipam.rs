//! Address allocation from IP pools and per-node subnets.
//!
//! The scan itself ([`next_free`]) is pure. Allocators run it against the set
//! of addresses already taken in the range and mark the result allocated in the
//! same critical section: a row lock on the range for [`PgAllocator`], a mutex
//! for [`memory::MemoryAllocator`].

use async_trait::async_trait;
use corral_rs::api::admin::IpRangeRef;
use ipnetwork::IpNetwork;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::sql;

/// Only this many host addresses at the start of an IPv6 range are ever handed out.
pub const IPV6_SCAN_WINDOW: u128 = 0xffff;

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("no such address range")]
    NotFound,
    #[error("{0} is outside the range")]
    OutOfRange(IpAddr),
    #[error("{0} is reserved in the range")]
    Reserved(IpAddr),
    #[error("{0} is already allocated")]
    AlreadyAllocated(IpAddr),
    #[error("{0} is not allocated")]
    NotAllocated(IpAddr),
    #[error("no free address left in the range")]
    Exhausted,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A pool or subnet: its network and, optionally, the gateway living in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub cidr: IpNetwork,
    pub gateway: Option<IpAddr>,
}

impl AddressRange {
    /// Addresses that are never allocated: the network and broadcast addresses and the gateway.
    /// An IPv4 range without a gateway keeps its first host free for one.
    pub fn is_reserved(&self, ip: IpAddr) -> bool {
        if Some(ip) == self.gateway {
            return true;
        }
        match self.cidr {
            IpNetwork::V4(net) => {
                let ip = match ip {
                    IpAddr::V4(ip) => ip,
                    IpAddr::V6(_) => return true,
                };
                let network = u32::from(net.network());
                let first_host = Ipv4Addr::from(network.wrapping_add(1));
                ip == net.network()
                    || ip == net.broadcast()
                    || (self.gateway.is_none() && ip == first_host)
            }
            IpNetwork::V6(net) => ip == IpAddr::V6(net.network()),
        }
    }

    /// Check that `ip` is a host address of this range that may be handed out.
    pub fn check_host(&self, ip: IpAddr) -> Result<(), IpamError> {
        if !self.cidr.contains(ip) {
            return Err(IpamError::OutOfRange(ip));
        }
        if self.is_reserved(ip) {
            return Err(IpamError::Reserved(ip));
        }
        Ok(())
    }

    /// Allocation candidates, lowest first.
    fn candidates(&self) -> Box<dyn Iterator<Item = IpAddr> + '_> {
        match self.cidr {
            IpNetwork::V4(net) => {
                let first = u32::from(net.network()).saturating_add(1);
                let broadcast = u32::from(net.broadcast());
                Box::new(
                    (first..broadcast)
                        .map(|n| IpAddr::V4(Ipv4Addr::from(n)))
                        .filter(|ip| !self.is_reserved(*ip)),
                )
            }
            IpNetwork::V6(net) => {
                let base = u128::from(net.network());
                let host_max = u128::MAX.checked_shr(u32::from(net.prefix())).unwrap_or(0);
                let window = host_max.min(IPV6_SCAN_WINDOW);
                Box::new(
                    (1..=window)
                        .map(move |n| IpAddr::V6(Ipv6Addr::from(base + n)))
                        .filter(|ip| !self.is_reserved(*ip)),
                )
            }
        }
    }
}

/// The lowest candidate of `range` not in `allocated`.
pub fn next_free(range: &AddressRange, allocated: &HashSet<IpAddr>) -> Option<IpAddr> {
    range.candidates().find(|ip| !allocated.contains(ip))
}

#[async_trait]
pub trait AddressAllocator: Send + Sync {
    /// Allocate the next free address of `range`, optionally on behalf of `vm_uuid`.
    async fn allocate(&self, range: IpRangeRef, vm_uuid: Option<Uuid>)
        -> Result<IpAddr, IpamError>;

    /// Pin a specific address of `range`.
    async fn reserve(
        &self,
        range: IpRangeRef,
        ip: IpAddr,
        vm_uuid: Option<Uuid>,
    ) -> Result<(), IpamError>;

    async fn release(&self, range: IpRangeRef, ip: IpAddr) -> Result<(), IpamError>;
}

async fn lock_range(
    range: IpRangeRef,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<AddressRange, IpamError> {
    let row = sql::ipam::lock_range(range, tx)
        .await?
        .ok_or(IpamError::NotFound)?;
    Ok(AddressRange {
        cidr: row.cidr,
        gateway: row.gateway.map(|gw| gw.ip()),
    })
}

/// Allocate inside a caller-owned transaction. The range row stays locked until it ends.
pub async fn allocate_in(
    range: IpRangeRef,
    vm_uuid: Option<Uuid>,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<IpAddr, IpamError> {
    let addresses = lock_range(range, tx).await?;
    let taken: HashSet<IpAddr> = sql::ipam::allocated(range, tx.as_mut())
        .await?
        .into_iter()
        .collect();
    let ip = next_free(&addresses, &taken).ok_or(IpamError::Exhausted)?;
    if !sql::ipam::mark_allocated(range, ip, vm_uuid, tx.as_mut()).await? {
        // The range lock makes this unreachable unless rows were written outside of it.
        return Err(IpamError::AlreadyAllocated(ip));
    }
    Ok(ip)
}

pub async fn reserve_in(
    range: IpRangeRef,
    ip: IpAddr,
    vm_uuid: Option<Uuid>,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), IpamError> {
    lock_range(range, tx).await?.check_host(ip)?;
    if !sql::ipam::mark_allocated(range, ip, vm_uuid, tx.as_mut()).await? {
        return Err(IpamError::AlreadyAllocated(ip));
    }
    Ok(())
}

pub struct PgAllocator {
    pool: PgPool,
}

impl PgAllocator {
    pub fn new(pool: PgPool) -> Self {
        PgAllocator { pool }
    }
}

#[async_trait]
impl AddressAllocator for PgAllocator {
    #[instrument(skip(self))]
    async fn allocate(
        &self,
        range: IpRangeRef,
        vm_uuid: Option<Uuid>,
    ) -> Result<IpAddr, IpamError> {
        let mut tx = self.pool.begin().await?;
        let ip = allocate_in(range, vm_uuid, &mut tx).await?;
        tx.commit().await?;
        tracing::info!(%ip, "allocated address");
        Ok(ip)
    }

    #[instrument(skip(self))]
    async fn reserve(
        &self,
        range: IpRangeRef,
        ip: IpAddr,
        vm_uuid: Option<Uuid>,
    ) -> Result<(), IpamError> {
        let mut tx = self.pool.begin().await?;
        reserve_in(range, ip, vm_uuid, &mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn release(&self, range: IpRangeRef, ip: IpAddr) -> Result<(), IpamError> {
        let mut tx = self.pool.begin().await?;
        lock_range(range, &mut tx).await?;
        if !sql::ipam::release(range, ip, tx.as_mut()).await? {
            return Err(IpamError::NotAllocated(ip));
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod memory {
    //! Process-local allocator over fixed ranges, used in tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryAllocator {
        ranges: HashMap<IpRangeRef, AddressRange>,
        allocated: Mutex<HashMap<IpRangeRef, HashMap<IpAddr, Option<Uuid>>>>,
    }

    impl MemoryAllocator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_range(mut self, range: IpRangeRef, addresses: AddressRange) -> Self {
            self.ranges.insert(range, addresses);
            self
        }

        pub fn holder(&self, range: IpRangeRef, ip: IpAddr) -> Option<Option<Uuid>> {
            self.allocated
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&range)
                .and_then(|taken| taken.get(&ip).copied())
        }
    }

    #[async_trait]
    impl AddressAllocator for MemoryAllocator {
        async fn allocate(
            &self,
            range: IpRangeRef,
            vm_uuid: Option<Uuid>,
        ) -> Result<IpAddr, IpamError> {
            let addresses = self.ranges.get(&range).ok_or(IpamError::NotFound)?;
            let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
            let taken = allocated.entry(range).or_default();
            let in_use: HashSet<IpAddr> = taken.keys().copied().collect();
            let ip = next_free(addresses, &in_use).ok_or(IpamError::Exhausted)?;
            taken.insert(ip, vm_uuid);
            Ok(ip)
        }

        async fn reserve(
            &self,
            range: IpRangeRef,
            ip: IpAddr,
            vm_uuid: Option<Uuid>,
        ) -> Result<(), IpamError> {
            self.ranges
                .get(&range)
                .ok_or(IpamError::NotFound)?
                .check_host(ip)?;
            let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
            let taken = allocated.entry(range).or_default();
            if taken.contains_key(&ip) {
                return Err(IpamError::AlreadyAllocated(ip));
            }
            taken.insert(ip, vm_uuid);
            Ok(())
        }

        async fn release(&self, range: IpRangeRef, ip: IpAddr) -> Result<(), IpamError> {
            if !self.ranges.contains_key(&range) {
                return Err(IpamError::NotFound);
            }
            let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
            allocated
                .get_mut(&range)
                .and_then(|taken| taken.remove(&ip))
                .map(|_| ())
                .ok_or(IpamError::NotAllocated(ip))
        }
    }
}

#[cfg(test)]
mod test {
    use super::memory::MemoryAllocator;
    use super::*;
    use std::sync::Arc;

    fn range(cidr: &str, gateway: Option<&str>) -> AddressRange {
        AddressRange {
            cidr: cidr.parse().unwrap(),
            gateway: gateway.map(|gw| gw.parse().unwrap()),
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn v4_skips_network_and_gateway() {
        let subnet = range("10.0.0.0/24", Some("10.0.0.1"));
        assert_eq!(next_free(&subnet, &HashSet::new()), Some(ip("10.0.0.2")));

        let taken: HashSet<IpAddr> = [ip("10.0.0.2"), ip("10.0.0.3")].into();
        assert_eq!(next_free(&subnet, &taken), Some(ip("10.0.0.4")));
    }

    #[test]
    fn v4_pool_without_gateway_keeps_first_host() {
        let pool = range("192.168.10.0/29", None);
        assert_eq!(next_free(&pool, &HashSet::new()), Some(ip("192.168.10.2")));
        assert!(pool.is_reserved(ip("192.168.10.1")));
    }

    #[test]
    fn v4_exhaustion_never_yields_broadcast() {
        let pool = range("10.1.0.0/30", Some("10.1.0.1"));
        let taken: HashSet<IpAddr> = [ip("10.1.0.2")].into();
        assert_eq!(next_free(&pool, &taken), None);
        assert!(pool.is_reserved(ip("10.1.0.3")));
    }

    #[test]
    fn v6_scans_a_16_bit_window() {
        let subnet = range("2001:db8::/64", Some("2001:db8::1"));
        assert_eq!(next_free(&subnet, &HashSet::new()), Some(ip("2001:db8::2")));

        let mut taken: HashSet<IpAddr> = HashSet::new();
        for n in 2..=0xffffu128 {
            taken.insert(IpAddr::V6(Ipv6Addr::from(
                u128::from(ip_v6("2001:db8::")) + n,
            )));
        }
        // Plenty of room left in the /64, but nothing inside the window.
        assert_eq!(next_free(&subnet, &taken), None);
    }

    fn ip_v6(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    #[test]
    fn check_host_rejects_foreign_and_reserved() {
        let subnet = range("10.0.0.0/24", Some("10.0.0.1"));
        assert!(subnet.check_host(ip("10.0.0.50")).is_ok());
        assert!(matches!(
            subnet.check_host(ip("10.0.1.5")),
            Err(IpamError::OutOfRange(_))
        ));
        assert!(matches!(
            subnet.check_host(ip("10.0.0.1")),
            Err(IpamError::Reserved(_))
        ));
        assert!(matches!(
            subnet.check_host(ip("10.0.0.255")),
            Err(IpamError::Reserved(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_allocations_are_distinct() {
        let pool = IpRangeRef::Pool(1);
        let allocator = Arc::new(
            MemoryAllocator::new().with_range(pool, range("10.9.0.0/27", Some("10.9.0.1"))),
        );

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let allocator = Arc::clone(&allocator);
            tasks.push(tokio::spawn(async move {
                allocator.allocate(pool, Some(Uuid::new_v4())).await.unwrap()
            }));
        }
        let mut seen = HashSet::new();
        for task in tasks {
            assert!(seen.insert(task.await.unwrap()));
        }
        assert_eq!(seen.len(), 20);
        for addr in &seen {
            assert!(allocator.holder(pool, *addr).is_some());
        }
    }

    #[tokio::test]
    async fn reserve_and_release() {
        let subnet = IpRangeRef::Subnet(4);
        let owner = Uuid::new_v4();
        let allocator =
            MemoryAllocator::new().with_range(subnet, range("10.0.0.0/24", Some("10.0.0.1")));

        allocator.reserve(subnet, ip("10.0.0.2"), Some(owner)).await.unwrap();
        assert!(matches!(
            allocator.reserve(subnet, ip("10.0.0.2"), None).await,
            Err(IpamError::AlreadyAllocated(_))
        ));
        // The reserved address is skipped by the scan.
        assert_eq!(allocator.allocate(subnet, None).await.unwrap(), ip("10.0.0.3"));

        allocator.release(subnet, ip("10.0.0.2")).await.unwrap();
        assert!(matches!(
            allocator.release(subnet, ip("10.0.0.2")).await,
            Err(IpamError::NotAllocated(_))
        ));
        assert!(matches!(
            allocator.allocate(IpRangeRef::Pool(99), None).await,
            Err(IpamError::NotFound)
        ));
    }
}
