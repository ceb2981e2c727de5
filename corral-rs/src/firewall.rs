//! Per-VM ingress firewall model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallMode {
    /// No filtering: the VM chain accepts everything.
    #[default]
    Disabled,
    /// Only traffic matched by an `allow` rule gets through.
    Allowlist,
    /// Everything gets through unless a `deny` rule matches.
    Denylist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Deny,
}

macro_rules! impl_str_enum {
    ($ty:ident { $($variant:ident => $s:literal),* $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s),*
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)*
                    other => Err(format!(concat!("invalid ", stringify!($ty), ": {:?}"), other)),
                }
            }
        }
    };
}

impl_str_enum!(FirewallMode { Disabled => "disabled", Allowlist => "allowlist", Denylist => "denylist" });
impl_str_enum!(Protocol { Tcp => "tcp", Udp => "udp", Icmp => "icmp", Any => "any" });
impl_str_enum!(RuleAction { Allow => "allow", Deny => "deny" });

pub const DEFAULT_PRIORITY: i32 = 1000;

/// One rule as stored. `source_cidr` and `dest_ports` are kept verbatim;
/// they are validated when the ruleset is rendered, and a rule whose fields
/// do not parse is left out of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub id: i64,
    pub protocol: Protocol,
    /// `any`, an address, or a CIDR (v4 or v6).
    #[serde(default = "any")]
    pub source_cidr: String,
    /// `any`, a port, a range `lo-hi`, or a comma list of those.
    #[serde(default = "any")]
    pub dest_ports: String,
    pub action: RuleAction,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn any() -> String {
    "any".to_string()
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn enabled() -> bool {
    true
}

/// The enabled rules in evaluation order: ascending priority, ties broken by id.
pub fn effective_rules(rules: &[FirewallRule]) -> Vec<&FirewallRule> {
    let mut ordered: Vec<&FirewallRule> = rules.iter().filter(|r| r.enabled).collect();
    ordered.sort_by_key(|r| (r.priority, r.id));
    ordered
}
