//! Corral Fleet Control Plane Base Crate
//!
//! This crate contains the type definitions and pure algorithms shared by the
//! switchboard (controller) and the per-node agent: the HTTP wire types, the
//! job-kind tagged union with its payload schemas, the VM lifecycle state
//! machine, firewall and backup domain types, and network identity helpers.
//! It does not contain any actual service implementation and performs no I/O.

pub mod api;
pub mod backup;
pub mod connector;
pub mod firewall;
pub mod instance;
pub mod job;
pub mod lifecycle;
pub mod net;
pub mod storage;
pub mod util;
