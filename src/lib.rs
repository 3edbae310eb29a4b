//! systolic-emu library
//!
//! Cycle-accurate behavioral model of a weight-stationary systolic-array
//! convolution accelerator.

pub mod config;
pub mod device;
pub mod emu;
pub mod error;
pub mod testing;
