//! Network identity helpers: deterministic MAC addresses, IPv6 /64 prefixes
//! and forwarding modes.

use ipnetwork::Ipv6Network;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// First octet of every derived MAC: unicast, locally administered.
pub const LOCAL_UNICAST_PREFIX: u8 = 0x02;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetError {
    #[error("invalid MAC address: {0:?}")]
    InvalidMac(String),
    #[error("invalid IPv6 prefix {0:?}: {1}")]
    InvalidPrefix(String, String),
    #[error("only /64 IPv6 prefixes are supported, got /{1} in {0:?}")]
    PrefixNot64(String, u8),
}

/// A 48-bit Ethernet address, rendered as lower-case colon-separated hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| NetError::InvalidMac(s.to_string()))?;
            *octet =
                u8::from_str_radix(part, 16).map_err(|_| NetError::InvalidMac(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(NetError::InvalidMac(s.to_string()));
        }
        Ok(MacAddress(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Derive a VM's MAC address from its UUID.
///
/// The first octet is fixed to [`LOCAL_UNICAST_PREFIX`]; the remaining five
/// come from a SHA-256 digest of the UUID bytes, so redefining a domain keeps
/// its MAC.
pub fn mac_from_uuid(uuid: &Uuid) -> MacAddress {
    let digest = Sha256::digest(uuid.as_bytes());
    let mut octets = [0u8; 6];
    octets[0] = LOCAL_UNICAST_PREFIX;
    octets[1..].copy_from_slice(&digest[..5]);
    MacAddress(octets)
}

/// An IPv6 /64 prefix, normalized to its network address.
///
/// Router advertisement and IPv6 subnets only deal in /64s; anything else is
/// rejected when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Prefix64 {
    network: Ipv6Addr,
}

impl Ipv6Prefix64 {
    pub fn network(&self) -> Ipv6Addr {
        self.network
    }

    /// The router address handed out on the bridge: `<prefix>::1`.
    pub fn gateway(&self) -> Ipv6Addr {
        Ipv6Addr::from(u128::from(self.network) | 1)
    }

    /// Host `n` within the prefix (interface identifier `n`).
    pub fn host(&self, n: u64) -> Ipv6Addr {
        Ipv6Addr::from(u128::from(self.network) | u128::from(n))
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        (u128::from(addr) >> 64) == (u128::from(self.network) >> 64)
    }
}

impl fmt::Display for Ipv6Prefix64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/64", self.network)
    }
}

impl FromStr for Ipv6Prefix64 {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let network = Ipv6Network::from_str(s.trim())
            .map_err(|e| NetError::InvalidPrefix(s.to_string(), e.to_string()))?;
        if network.prefix() != 64 {
            return Err(NetError::PrefixNot64(s.to_string(), network.prefix()));
        }
        Ok(Ipv6Prefix64 {
            network: network.network(),
        })
    }
}

impl Serialize for Ipv6Prefix64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv6Prefix64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// How a node forwards traffic between its VM bridge and the uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetMode {
    /// Masquerade VM traffic behind the egress interface.
    Nat,
    /// Route VM addresses directly; only established/related replies come back in.
    Routed,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mac_is_deterministic_and_local() {
        let u = Uuid::parse_str("0b0e5f5c-2a4c-4a3b-9d6b-0d3b2a6f7c11").unwrap();
        let a = mac_from_uuid(&u);
        let b = mac_from_uuid(&u);
        assert_eq!(a, b);
        assert!(a.is_locally_administered());
        assert!(a.is_unicast());
        assert!(a.to_string().starts_with("02:"));
    }

    #[test]
    fn distinct_uuids_get_distinct_macs() {
        let macs: std::collections::BTreeSet<_> =
            (0..256).map(|_| mac_from_uuid(&Uuid::new_v4())).collect();
        assert_eq!(macs.len(), 256);
    }

    #[test]
    fn mac_parse_display() {
        let mac: MacAddress = "02:AB:cd:00:11:ff".parse().unwrap();
        assert_eq!(mac.to_string(), "02:ab:cd:00:11:ff");
        assert!("02:ab:cd:00:11".parse::<MacAddress>().is_err());
        assert!("02:ab:cd:00:11:ff:00".parse::<MacAddress>().is_err());
        assert!("zz:ab:cd:00:11:ff".parse::<MacAddress>().is_err());
    }

    #[test]
    fn prefix_gateway() {
        let prefix: Ipv6Prefix64 = "2001:db8::1/64".parse().unwrap();
        assert_eq!(prefix.network(), "2001:db8::".parse::<Ipv6Addr>().unwrap());
        assert_eq!(prefix.gateway(), "2001:db8::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(prefix.to_string(), "2001:db8::/64");
    }

    #[test]
    fn prefix_rejects_non_64() {
        assert_eq!(
            "2001:db8::/48".parse::<Ipv6Prefix64>(),
            Err(NetError::PrefixNot64("2001:db8::/48".into(), 48))
        );
        assert!("10.0.0.0/24".parse::<Ipv6Prefix64>().is_err());
    }
}
