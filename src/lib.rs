//! Firewall fingerprinting.
//!
//! Probes a host with external tools, reduces the raw output to a fixed
//! ten-value feature vector, and classifies the host as unfiltered,
//! stateless, stateful or proxy with a tree ensemble trained on labeled
//! lab machines.

pub mod classify;
pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod label;
pub mod model;
pub mod network;
pub mod probe;
pub mod validate;

pub use error::{FwError, Result};
pub use label::FirewallLabel;
