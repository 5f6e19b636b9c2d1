//! sqlpool - connection pooling proxy core for relational databases
//!
//! Slot-segregated per-backend pools with circuit breaking, client sessions,
//! local and two-phase transaction coordination, and cluster-wide pool
//! sizing.

pub mod backend;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod session;
pub mod txn;

pub use config::Config;
pub use crate::core::{Core, CoreSnapshot};
pub use error::{ErrorKind, ProxyError};
