//! Conductor: dependency-aware skill execution with checkpoints and
//! decision gates.
//!
//! - [`core`] holds skill descriptors, the registry and dependency resolution
//! - [`state`] snapshots tracked files into content-addressed checkpoints
//! - [`orchestration`] plans runs, gates steps on decisions and executes plans
//!   with halt, resume, abort and rollback control

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod util;

pub use error::{Error, Result};
