//! Harness for running convolutions end to end.
//!
//! This module provides infrastructure for:
//! - A golden direct-convolution model
//! - A scripted host that streams inputs and collects outputs
//! - TOML scenario manifests checked against expected outputs
//!
//! # Usage
//!
//! ```bash
//! cargo run -- scenario scenarios/
//! ```

pub mod host;
pub mod reference;
pub mod scenario;

pub use host::{run_job, ConvJob, HostDriver, Pattern, RunReport, TxReady};
pub use reference::conv2d;
pub use scenario::{Expected, Mismatch, Scenario, ScenarioResult};
