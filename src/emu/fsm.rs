//! Top-level control state machine.
//!
//! ```text
//!   IDLE --start--> LOAD_WEIGHTS --K^2 bytes--> LOAD_INPUT --tile bytes--> COMPUTE
//!    ^                                              ^                         |
//!    |                                              | more tiles              | array done
//!   DONE <----------------- last tile ----------- DRAIN <---------------------+
//! ```
//!
//! The FSM is a pure update function: [`ControlFsm::outputs`] is a Moore
//! function of the current registers and [`ControlFsm::next`] returns the
//! registers for the next tick. Pulses (array clear, AGU start, tile start,
//! drain start, done) fire only in the tick a state is entered, detected by
//! comparing the state with the previous tick's state.
//!
//! Exit conditions compare registered counters, so a state leaves one tick
//! after its last transfer, as a clocked implementation would.

use std::fmt;

use crate::device::geometry::{OutputTile, RunConfig, TileGeometry};
use crate::device::memory::InputBank;
use crate::device::AguMode;
use crate::error::ConfigurationError;

/// Control states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum FsmState {
    #[default]
    Idle,
    LoadWeights,
    LoadInput,
    Compute,
    Drain,
    Done,
}

impl FsmState {
    /// States that accept the rx stream.
    #[inline]
    pub fn is_load(self) -> bool {
        matches!(self, FsmState::LoadWeights | FsmState::LoadInput)
    }
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsmState::Idle => "IDLE",
            FsmState::LoadWeights => "LOAD_WEIGHTS",
            FsmState::LoadInput => "LOAD_INPUT",
            FsmState::Compute => "COMPUTE",
            FsmState::Drain => "DRAIN",
            FsmState::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Signals the FSM samples at the end of a tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsmInputs {
    /// Host start pulse.
    pub start: bool,
    /// Host `configN`, latched with start.
    pub config_n: usize,
    /// Host `configK`, latched with start.
    pub config_k: usize,
    /// An rx byte transferred this tick.
    pub rx_transfer: bool,
    /// The fourth byte of an output transferred on tx this tick.
    pub output_complete: bool,
    pub agu_mode: AguMode,
    pub agu_done: bool,
    /// The compute/drain sequencer has nothing in flight.
    pub sequencer_idle: bool,
    pub array_done: bool,
}

/// What the FSM drives in the current tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsmOutputs {
    pub state: FsmState,
    /// First tick in `state`.
    pub entry: bool,
    /// Clear every partial sum (LOAD_WEIGHTS entry).
    pub array_clear: bool,
    /// Configure and start the AGU for a load mode.
    pub agu_start: bool,
    /// Begin the current output tile's compute pass (COMPUTE entry).
    pub tile_start: bool,
    /// Begin draining the current output tile (DRAIN entry).
    pub drain_start: bool,
    /// rx may be ready in this state.
    pub rx_enable: bool,
    /// tx may be valid in this state.
    pub tx_enable: bool,
    /// Input bank for the current tile.
    pub input_bank: InputBank,
    /// Index of the current output tile.
    pub output_tile: usize,
    /// Host done pulse (DONE entry).
    pub done: bool,
    pub busy: bool,
}

/// Registers of the control FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFsm {
    state: FsmState,
    previous_state: FsmState,
    array_size: usize,
    geometry: Option<TileGeometry>,
    weight_count: usize,
    input_count: usize,
    output_count: usize,
    output_tile: usize,
    input_bank: InputBank,
}

impl ControlFsm {
    pub fn new(array_size: usize) -> Self {
        Self {
            state: FsmState::Idle,
            previous_state: FsmState::Idle,
            array_size,
            geometry: None,
            weight_count: 0,
            input_count: 0,
            output_count: 0,
            output_tile: 0,
            input_bank: InputBank::Ping,
        }
    }

    #[inline]
    pub fn state(&self) -> FsmState {
        self.state
    }

    #[inline]
    pub fn previous_state(&self) -> FsmState {
        self.previous_state
    }

    /// First tick in the current state.
    #[inline]
    pub fn is_entry(&self) -> bool {
        self.state != self.previous_state
    }

    /// Geometry latched with the last accepted start.
    #[inline]
    pub fn geometry(&self) -> Option<&TileGeometry> {
        self.geometry.as_ref()
    }

    #[inline]
    pub fn weight_count(&self) -> usize {
        self.weight_count
    }

    #[inline]
    pub fn input_count(&self) -> usize {
        self.input_count
    }

    #[inline]
    pub fn output_count(&self) -> usize {
        self.output_count
    }

    #[inline]
    pub fn output_tile_index(&self) -> usize {
        self.output_tile
    }

    #[inline]
    pub fn input_bank(&self) -> InputBank {
        self.input_bank
    }

    /// Current output tile, if a run is latched.
    pub fn output_tile(&self) -> Option<OutputTile> {
        self.geometry.map(|g| g.output_tile(self.output_tile))
    }

    /// Cumulative output count at which the current tile's drain is complete.
    pub fn drain_target(&self) -> usize {
        self.geometry
            .map(|g| (0..=self.output_tile).map(|i| g.output_tile(i).len()).sum())
            .unwrap_or(0)
    }

    /// Moore outputs for the current tick.
    pub fn outputs(&self) -> FsmOutputs {
        let entry = self.is_entry();
        let state = self.state;
        FsmOutputs {
            state,
            entry,
            array_clear: entry && state == FsmState::LoadWeights,
            agu_start: entry && state.is_load(),
            tile_start: entry && state == FsmState::Compute,
            drain_start: entry && state == FsmState::Drain,
            rx_enable: state.is_load(),
            tx_enable: state == FsmState::Drain,
            input_bank: self.input_bank,
            output_tile: self.output_tile,
            done: entry && state == FsmState::Done,
            busy: !matches!(state, FsmState::Idle | FsmState::Done),
        }
    }

    /// Registers for the next tick.
    ///
    /// A start with an unsupported configuration is rejected and the FSM
    /// stays idle.
    pub fn next(&self, inputs: &FsmInputs) -> Result<Self, ConfigurationError> {
        let mut next = *self;
        next.previous_state = self.state;

        match self.state {
            FsmState::Idle => {
                if inputs.start {
                    let config = RunConfig {
                        n: inputs.config_n,
                        k: inputs.config_k,
                        array_size: self.array_size,
                    };
                    config.validate()?;
                    next = Self::new(self.array_size);
                    next.previous_state = FsmState::Idle;
                    next.geometry = Some(TileGeometry::new(config));
                    next.state = FsmState::LoadWeights;
                }
            }

            FsmState::LoadWeights => {
                let target = self.geometry.map_or(0, |g| g.total_weight_elems);
                if self.weight_count >= target {
                    next.input_count = 0;
                    next.state = FsmState::LoadInput;
                } else if inputs.rx_transfer {
                    next.weight_count += 1;
                }
            }

            FsmState::LoadInput => {
                let target = self.geometry.map_or(0, |g| g.total_input_elems);
                if self.input_count >= target {
                    next.state = FsmState::Compute;
                } else if inputs.rx_transfer {
                    next.input_count += 1;
                }
            }

            FsmState::Compute => {
                let window_exhausted =
                    inputs.agu_mode == AguMode::SlidingWindow && inputs.agu_done && inputs.sequencer_idle;
                if !self.is_entry() && (inputs.array_done || window_exhausted) {
                    next.state = FsmState::Drain;
                }
            }

            FsmState::Drain => {
                if self.output_count >= self.drain_target() {
                    let tiles = self.geometry.map_or(0, |g| g.num_output_tiles());
                    if self.output_tile + 1 < tiles {
                        next.output_tile += 1;
                        next.input_bank = self.input_bank.toggled();
                        next.input_count = 0;
                        next.state = FsmState::LoadInput;
                    } else {
                        next.state = FsmState::Done;
                    }
                } else if inputs.output_complete {
                    next.output_count += 1;
                }
            }

            FsmState::Done => {
                next.state = FsmState::Idle;
            }
        }

        if next.state != self.state {
            log::debug!("FSM {} -> {}", self.state, next.state);
        }
        Ok(next)
    }

    /// Synchronous reset.
    pub fn reset(&mut self) {
        *self = Self::new(self.array_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(n: usize, k: usize) -> FsmInputs {
        FsmInputs {
            start: true,
            config_n: n,
            config_k: k,
            ..Default::default()
        }
    }

    fn rx() -> FsmInputs {
        FsmInputs { rx_transfer: true, ..Default::default() }
    }

    #[test]
    fn test_start_latches_configuration() {
        let fsm = ControlFsm::new(8);
        assert_eq!(fsm.outputs().state, FsmState::Idle);
        assert!(!fsm.outputs().busy);

        let fsm = fsm.next(&start(16, 3)).unwrap();
        assert_eq!(fsm.state(), FsmState::LoadWeights);
        assert_eq!(fsm.geometry().map(|g| g.total_weight_elems), Some(9));

        let out = fsm.outputs();
        assert!(out.entry && out.array_clear && out.agu_start && out.rx_enable);

        // Pulses last one tick
        let fsm = fsm.next(&FsmInputs::default()).unwrap();
        let out = fsm.outputs();
        assert!(!out.entry && !out.array_clear && !out.agu_start);
        assert!(out.rx_enable);
    }

    #[test]
    fn test_bad_configuration_stays_idle() {
        let fsm = ControlFsm::new(8);
        assert!(matches!(
            fsm.next(&start(16, 17)),
            Err(ConfigurationError::KernelDimOutOfRange { k: 17, .. })
        ));
        assert!(matches!(
            fsm.next(&start(15, 3)),
            Err(ConfigurationError::InputDimOutOfRange { n: 15, .. })
        ));
        assert_eq!(fsm.state(), FsmState::Idle);

        let small = ControlFsm::new(4);
        assert!(matches!(
            small.next(&start(16, 9)),
            Err(ConfigurationError::KernelTooLargeForArray { .. })
        ));
    }

    #[test]
    fn test_weight_count_exits_one_tick_late() {
        let mut fsm = ControlFsm::new(8).next(&start(16, 2)).unwrap();
        for _ in 0..4 {
            fsm = fsm.next(&rx()).unwrap();
            assert_eq!(fsm.state(), FsmState::LoadWeights);
        }
        assert_eq!(fsm.weight_count(), 4);

        fsm = fsm.next(&rx()).unwrap();
        assert_eq!(fsm.state(), FsmState::LoadInput);
        assert_eq!(fsm.weight_count(), 4);
        assert_eq!(fsm.input_bank(), InputBank::Ping);
        assert!(fsm.outputs().agu_start);
        assert!(!fsm.outputs().array_clear);
    }

    #[test]
    fn test_compute_exit_conditions() {
        let mut fsm = ControlFsm::new(8).next(&start(16, 2)).unwrap();
        while fsm.state() != FsmState::Compute {
            fsm = fsm.next(&rx()).unwrap();
        }
        assert!(fsm.outputs().tile_start);
        assert!(!fsm.outputs().rx_enable);

        // AGU done from a load mode does not count as an exhausted window
        let load_done = FsmInputs {
            agu_mode: AguMode::LoadInput,
            agu_done: true,
            sequencer_idle: true,
            ..Default::default()
        };
        fsm = fsm.next(&load_done).unwrap();
        fsm = fsm.next(&load_done).unwrap();
        assert_eq!(fsm.state(), FsmState::Compute);

        let exhausted = FsmInputs {
            agu_mode: AguMode::SlidingWindow,
            agu_done: true,
            sequencer_idle: true,
            ..Default::default()
        };
        fsm = fsm.next(&exhausted).unwrap();
        assert_eq!(fsm.state(), FsmState::Drain);
        assert!(fsm.outputs().drain_start && fsm.outputs().tx_enable);
    }

    #[test]
    fn test_drain_toggles_bank_and_counts_cumulatively() {
        let mut fsm = ControlFsm::new(8).next(&start(16, 3)).unwrap();
        let done = FsmInputs { array_done: true, ..Default::default() };
        let byte = FsmInputs { output_complete: true, ..Default::default() };

        let mut banks = Vec::new();
        let mut states = vec![fsm.state()];
        let mut ticks = 0;
        while fsm.state() != FsmState::Idle && ticks < 10_000 {
            let inputs = match fsm.state() {
                FsmState::LoadWeights | FsmState::LoadInput => rx(),
                FsmState::Compute => done,
                FsmState::Drain => byte,
                _ => FsmInputs::default(),
            };
            if fsm.outputs().agu_start && fsm.state() == FsmState::LoadInput {
                banks.push(fsm.outputs().input_bank);
            }
            let next = fsm.next(&inputs).unwrap();
            if next.state() != fsm.state() {
                states.push(next.state());
            }
            if next.state() == FsmState::Done {
                assert_eq!(next.output_count(), 196);
                assert_eq!(next.weight_count(), 9);
            }
            fsm = next;
            ticks += 1;
        }

        use FsmState::*;
        let mut expected = vec![LoadWeights];
        for _ in 0..4 {
            expected.extend([LoadInput, Compute, Drain]);
        }
        expected.extend([Done, Idle]);
        assert_eq!(states, expected);
        assert_eq!(
            banks,
            vec![InputBank::Ping, InputBank::Pong, InputBank::Ping, InputBank::Pong]
        );
    }

    #[test]
    fn test_done_pulse_then_idle() {
        let mut fsm = ControlFsm::new(8).next(&start(16, 3)).unwrap();
        let mut saw_done = 0;
        for _ in 0..100_000 {
            let inputs = match fsm.state() {
                FsmState::LoadWeights | FsmState::LoadInput => rx(),
                FsmState::Compute => FsmInputs { array_done: true, ..Default::default() },
                FsmState::Drain => FsmInputs { output_complete: true, ..Default::default() },
                _ => FsmInputs::default(),
            };
            if fsm.outputs().done {
                saw_done += 1;
            }
            fsm = fsm.next(&inputs).unwrap();
            if fsm.state() == FsmState::Idle {
                break;
            }
        }
        assert_eq!(saw_done, 1);
        assert_eq!(fsm.state(), FsmState::Idle);
        assert!(fsm.previous_state() == FsmState::Done);
    }
}
