//! Switchboard - local control plane for a multi-service messaging gateway
//!
//! This library runs the backends of the gateway as supervised subprocesses:
//! - Allocates loopback ports from fixed per-service ranges
//! - Spawns services in dependency order and restarts crashed ones with
//!   exponential backoff behind a circuit breaker
//! - Aggregates service health into one report
//! - Tails service log files for queries and live streaming
//! - Fronts everything with one HTTP listener routing by path prefix

pub mod admin;
pub mod breaker;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod logline;
pub mod logs;
pub mod pool;
pub mod ports;
pub mod probe;
pub mod process;
pub mod proxy;
pub mod service;
