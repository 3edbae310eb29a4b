//! Hardware models of the convolution engine's datapath.
//!
//! This module provides:
//! - Architecture constants (word width, supported ranges, latencies)
//! - Run configuration and tiling geometry
//! - The memory collaborator with its one-tick read latency
//! - The address-generation unit
//! - Processing elements and the systolic array
//! - Valid/ready stream ports
//!
//! # Datapath Overview
//!
//! ```text
//!   rx stream --> AGU (pack) --> MemoryPort [weights | ping | pong | output]
//!                                    |                              ^
//!                           AGU (window reads)                      |
//!                                    v                              |
//!                            SystolicArray ---- results ------------+
//!                                                                   |
//!   tx stream <-- AGU (unload, one byte lane per read) <------------+
//! ```
//!
//! # Example
//!
//! ```
//! use systolic_emu::device::{RunConfig, TileGeometry};
//!
//! let geometry = TileGeometry::new(RunConfig::new(16, 3));
//! assert_eq!(geometry.output_dim, 14);
//! assert_eq!(geometry.input_tile_size, 10);
//! assert_eq!(geometry.num_output_tiles(), 4);
//! ```

pub mod arch;
pub mod geometry;
pub mod memory;
pub mod agu;
pub mod pe;
pub mod array;
pub mod stream;

pub use agu::{AddressGenerator, AguConfig, AguInputs, AguMode, AguOutputs};
pub use array::{ArrayInputs, SystolicArray, TilingState, WeightLoad};
pub use geometry::{KernelTile, OutputTile, RunConfig, TileGeometry};
pub use memory::{InputBank, MemoryLayout, MemoryPort, MemoryRequest, RegionSpec, RegionStats};
pub use pe::{PeInputs, ProcessingElement};
pub use stream::{HandshakeMonitor, StreamBeat};
