//! Shared pieces of the replmover tools.
//!
//! - [`config`]: transfer and output settings together with the protocol constants
//! - [`logging`]: tracing subscriber setup
//! - [`restart`]: transfer checkpoints that let an interrupted transfer resume from its gaps

pub mod config;
pub mod logging;
pub mod restart;

pub use config::{OutputConfig, TransferConfig};
pub use restart::{Checkpoint, RestartError, RestartInfo, RestartOperation, RestartPolicy};
