//! The per-node agent: polls the switchboard for jobs and carries them out
//! with the host's virtualization, storage and network tools.

pub mod backup;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod exec;
pub mod lifecycle;
pub mod network;
pub mod object_store;
pub mod poll;
pub mod storage;
