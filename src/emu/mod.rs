//! Control layer of the convolution engine.
//!
//! This module sequences the datapath models in [`crate::device`]:
//! - The control FSM (IDLE, LOAD_WEIGHTS, LOAD_INPUT, COMPUTE, DRAIN, DONE)
//! - The compute/drain sequencer that owns kernel-tile policy
//! - The top-level accelerator with its per-tick ordering
//!
//! # Architecture
//!
//! Every component is advanced once per tick by [`Accelerator::tick`] and
//! sees only the previous tick's values of the others. The memory is the
//! only shared resource; all requests of a tick are collected and handed to
//! it together so bank conflicts can be checked.
//!
//! # Example
//!
//! ```
//! use systolic_emu::emu::{Accelerator, FsmState, HostInputs};
//!
//! let mut acc = Accelerator::with_array_size(8).unwrap();
//! acc.tick(&HostInputs { start: true, config_n: 16, config_k: 3, ..Default::default() })
//!     .unwrap();
//! assert_eq!(acc.state(), FsmState::LoadWeights);
//! ```

pub mod fsm;
pub mod sequencer;
pub mod engine;

pub use fsm::{ControlFsm, FsmInputs, FsmOutputs, FsmState};
pub use sequencer::{Phase, Sequencer, SequencerOutputs};
pub use engine::{Accelerator, EngineStatus, HostInputs, HostInterface, HostOutputs, StateTransition};
