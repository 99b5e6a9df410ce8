//! Backend pool and health monitor (spec §4.4, C4): tracks each upstream
//! SOCKSv5 backend's liveness/latency/internet-reachability, derives the
//! green/yellow/black classification, and drives the hysteretic global
//! "SOCKS available" signal.

mod backend;
mod health;
mod select;

pub(crate) use backend::{Backend, BackendStatus, Tier};
pub(crate) use health::HealthMonitor;
pub(crate) use select::Pool;
