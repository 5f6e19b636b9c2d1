//! CLI module for sqlpool
//!
//! Operator commands that run the core without a network front end.
//!
//! # Usage
//!
//! ```bash
//! # Validate a configuration and show the fast/slow split per backend
//! sqlpool --config sqlpool.yaml check
//!
//! # Per-node targets for a three node cluster
//! sqlpool --config sqlpool.yaml plan --nodes 3
//!
//! # Targets for a cluster-health report
//! sqlpool --config sqlpool.yaml plan --report "10.0.0.1:1059(UP);10.0.0.2:1059(DOWN)"
//!
//! # Drive in-memory backends with concurrent clients
//! sqlpool --config sqlpool.yaml simulate --clients 32 --operations 100
//! ```

pub mod commands;

pub use commands::{cmd_check, cmd_plan, cmd_simulate};
