//! Incremental ZFS snapshot replication between hosts.
//!
//! Replication state is kept on the filesystems themselves, as ZFS user
//! properties namespaced by each pair's fingerprint. The local run directory
//! only holds the per-pair lock marker and the status relay socket.

pub mod alert;
pub mod config;
pub mod error;
pub mod exec;
pub mod logging;
pub mod pair;
pub mod relay;
pub mod report;
pub mod set;
pub mod zfs;

pub use config::{Config, PairSpec};
pub use error::{Error, Result};
pub use exec::{Session, Shell, SystemShell};
pub use pair::{Action, Outcome, Pair, State, Status};
pub use set::PairSet;
pub use zfs::Dataset;
