//! The corral switchboard: job queue, node authentication, IPAM and the
//! HTTP surface used by agents and administrators.

pub mod auth;
pub mod config;
pub mod routes;
pub mod serve;
pub mod service;
pub mod sql;
