//! Top-level accelerator: one synchronous tick across every component.
//!
//! The engine wires the control FSM, AGU, systolic array, sequencer and
//! memory together and advances them on a single clock. Within a tick:
//!
//! 1. A reset input overrides everything and returns every component to its
//!    initial state.
//!    Without one, a Faulted engine refuses the tick with [`EmuError::Faulted`].
//! 2. The FSM's Moore outputs for the current state are computed.
//! 3. State-entry pulses fire (array clear, AGU start, tile start, drain start).
//! 4. The rx handshake is resolved against `rx_ready`.
//! 5. The AGU (load states) or the sequencer (compute/drain) does its work and
//!    collects memory requests; the tx handshake is resolved.
//! 6. The memory executes the collected requests, checking bank conflicts.
//! 7. The FSM computes its next registers from what happened this tick.
//!
//! # Usage
//!
//! ```ignore
//! let mut acc = Accelerator::with_array_size(8)?;
//! let mut host = HostDriver::new(&job, 8, TxReady::Always)?;
//! let cycles = acc.run(&mut host)?;
//! ```

use smallvec::SmallVec;

use super::fsm::{ControlFsm, FsmInputs, FsmState};
use super::sequencer::{RequestVec, Sequencer};
use crate::config::Config;
use crate::device::geometry::{validate_array_size, RunConfig, TileGeometry};
use crate::device::stream::{HandshakeMonitor, StreamBeat};
use crate::device::{AddressGenerator, AguConfig, AguInputs, MemoryLayout, MemoryPort, SystolicArray};
use crate::error::{ConfigurationError, EmuError, ProtocolViolation};

/// Host-side signals for one tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostInputs {
    /// Synchronous reset, overrides everything.
    pub reset: bool,
    /// Start pulse, sampled in IDLE.
    pub start: bool,
    pub config_n: usize,
    pub config_k: usize,
    /// rx producer side.
    pub rx: StreamBeat,
    /// tx consumer side.
    pub tx_ready: bool,
}

/// Accelerator-side signals for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostOutputs {
    pub state: FsmState,
    pub rx_ready: bool,
    /// An rx byte transferred this tick.
    pub rx_fire: bool,
    pub tx: StreamBeat,
    /// A tx byte transferred this tick.
    pub tx_fire: bool,
    /// One-tick completion pulse.
    pub done: bool,
    pub busy: bool,
}

/// The collaborator on the other side of the host interface.
pub trait HostInterface {
    /// Signals to present in the coming tick.
    fn drive(&mut self, cycle: u64) -> HostInputs;

    /// What the accelerator drove in that tick.
    fn observe(&mut self, cycle: u64, outputs: &HostOutputs);
}

/// Engine execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// No run latched.
    Idle,
    /// A run is in progress.
    Running,
    /// The last run completed.
    Done,
    /// A protocol violation stopped the run; only reset recovers.
    Faulted,
}

/// One FSM state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    /// Cycle at whose end the change took effect.
    pub cycle: u64,
    pub from: FsmState,
    pub to: FsmState,
}

/// The convolution accelerator.
pub struct Accelerator {
    fsm: ControlFsm,
    agu: AddressGenerator,
    array: SystolicArray,
    memory: MemoryPort,
    sequencer: Sequencer,
    rx: HandshakeMonitor,
    tx: HandshakeMonitor,
    /// Current engine status.
    pub status: EngineStatus,
    /// Total cycles since the last reset.
    pub total_cycles: u64,
    /// Cycle budget for [`run`](Self::run) (0 = unlimited).
    pub max_cycles: u64,
    runs_completed: u64,
    trace: Vec<StateTransition>,
}

impl Accelerator {
    /// Create an accelerator with an explicit memory layout.
    pub fn new(array_size: usize, layout: MemoryLayout) -> Result<Self, ConfigurationError> {
        validate_array_size(array_size)?;
        layout.validate()?;

        Ok(Self {
            fsm: ControlFsm::new(array_size),
            agu: AddressGenerator::new(),
            array: SystolicArray::new(array_size),
            memory: MemoryPort::new(layout),
            sequencer: Sequencer::new(layout),
            rx: HandshakeMonitor::new("rx"),
            tx: HandshakeMonitor::new("tx"),
            status: EngineStatus::Idle,
            total_cycles: 0,
            max_cycles: 0,
            runs_completed: 0,
            trace: Vec::new(),
        })
    }

    /// Create an accelerator with packed regions.
    pub fn with_array_size(array_size: usize) -> Result<Self, ConfigurationError> {
        validate_array_size(array_size)?;
        Self::new(array_size, MemoryLayout::packed(array_size))
    }

    /// Create an accelerator from loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigurationError> {
        let mut acc = Self::new(config.array_size(), config.memory_layout()?)?;
        acc.max_cycles = config.max_cycles();
        Ok(acc)
    }

    /// Synchronous reset of every component.
    pub fn reset(&mut self) {
        self.fsm.reset();
        self.agu.reset();
        self.array.reset();
        self.memory.reset();
        self.sequencer.reset();
        self.rx.reset();
        self.tx.reset();
        self.status = EngineStatus::Idle;
        self.total_cycles = 0;
        self.trace.clear();
    }

    /// Execute one clock tick.
    pub fn tick(&mut self, inputs: &HostInputs) -> Result<HostOutputs, EmuError> {
        if inputs.reset {
            self.reset();
            return Ok(HostOutputs::default());
        }
        if self.status == EngineStatus::Faulted {
            return Err(EmuError::Faulted);
        }

        let out = self.fsm.outputs();
        let layout = *self.memory.layout();

        // State-entry pulses
        if let Some(geometry) = self.fsm.geometry().copied() {
            if out.array_clear {
                self.array.clear();
            }
            if out.agu_start {
                let config = if out.state == FsmState::LoadWeights {
                    AguConfig::load_weights(&geometry, &layout)
                } else {
                    AguConfig::load_input(&geometry, &layout, out.input_bank)
                };
                self.agu.configure(config);
                self.agu.start();
            }
            if out.tile_start {
                let tile = geometry.output_tile(out.output_tile);
                self.sequencer
                    .begin_compute(geometry, tile, out.input_bank, &mut self.agu, &mut self.array);
            }
            if out.drain_start {
                self.sequencer.begin_drain();
            }
        }
        if out.done {
            // Per-run datapath state goes back to idle with the FSM
            self.agu.reset();
            self.sequencer.reset();
            self.runs_completed += 1;
            self.status = EngineStatus::Done;
            log::info!(
                "run complete after {} cycles: {} outputs, {} MAC ops",
                self.total_cycles,
                self.fsm.output_count(),
                self.array.mac_ops()
            );
        }

        // rx handshake
        let rx_ready = out.rx_enable && self.agu.rx_ready();
        let observed = self.rx.observe(inputs.rx, rx_ready);
        let rx_byte = self.check(observed)?;

        // Datapath work
        let mut requests: RequestVec = SmallVec::new();
        let mut tx = None;
        let mut output_complete = false;
        match out.state {
            FsmState::LoadWeights | FsmState::LoadInput => {
                let agu_out = self.agu.step(&AguInputs {
                    rx_byte,
                    ..Default::default()
                });
                requests.extend(agu_out.request);
            }
            FsmState::Compute | FsmState::Drain => {
                let tx_ready = out.tx_enable && inputs.tx_ready;
                let read_data = self.memory.read_data();
                let seq = self.sequencer.step(&mut self.agu, &mut self.array, read_data, tx_ready);
                requests = seq.requests;
                if out.tx_enable {
                    tx = seq.tx;
                    output_complete = seq.output_complete;
                }
            }
            FsmState::Idle | FsmState::Done => {}
        }

        // tx handshake, checked from our side as producer
        let tx_beat = StreamBeat::from_option(tx);
        let observed = self.tx.observe(tx_beat, inputs.tx_ready);
        let tx_byte = self.check(observed)?;

        let cycled = self.memory.cycle(&requests);
        self.check(cycled)?;

        // Next state
        let fsm_inputs = FsmInputs {
            start: inputs.start,
            config_n: inputs.config_n,
            config_k: inputs.config_k,
            rx_transfer: rx_byte.is_some(),
            output_complete,
            agu_mode: self.agu.mode(),
            agu_done: self.agu.is_done(),
            sequencer_idle: self.sequencer.is_idle(),
            array_done: self.array.array_done(),
        };
        let next = match self.latch(&fsm_inputs) {
            Ok(next) => next,
            Err(err) => {
                self.total_cycles += 1;
                log::warn!("start rejected: {}", err);
                return Err(err.into());
            }
        };

        if next.state() != self.fsm.state() {
            if self.fsm.state() == FsmState::Idle {
                self.trace.clear();
                self.status = EngineStatus::Running;
            }
            self.trace.push(StateTransition {
                cycle: self.total_cycles,
                from: self.fsm.state(),
                to: next.state(),
            });
        }
        self.fsm = next;
        self.total_cycles += 1;

        Ok(HostOutputs {
            state: out.state,
            rx_ready,
            rx_fire: rx_byte.is_some(),
            tx: tx_beat,
            tx_fire: tx_byte.is_some(),
            done: out.done,
            busy: out.busy,
        })
    }

    /// FSM next state, with the memory layout checked against a newly
    /// latched configuration.
    fn latch(&self, inputs: &FsmInputs) -> Result<ControlFsm, ConfigurationError> {
        let next = self.fsm.next(inputs)?;
        if self.fsm.state() == FsmState::Idle {
            if let Some(geometry) = next.geometry() {
                self.memory.layout().validate_for(geometry)?;
                log::debug!(
                    "latched N={} K={} on {}x{}: {} output tile(s), {} kernel tile(s)",
                    geometry.config.n,
                    geometry.config.k,
                    geometry.array_size(),
                    geometry.array_size(),
                    geometry.num_output_tiles(),
                    geometry.num_kernel_tiles
                );
            }
        }
        Ok(next)
    }

    fn check<T>(&mut self, result: Result<T, ProtocolViolation>) -> Result<T, EmuError> {
        result.map_err(|violation| {
            self.status = EngineStatus::Faulted;
            log::error!("cycle {}: {}", self.total_cycles, violation);
            EmuError::from(violation)
        })
    }

    /// Run one convolution against a host, from its start pulse to the done
    /// pulse.
    ///
    /// Returns the number of cycles executed.
    pub fn run<H: HostInterface>(&mut self, host: &mut H) -> Result<u64, EmuError> {
        let mut elapsed = 0u64;
        loop {
            if self.max_cycles > 0 && elapsed >= self.max_cycles {
                log::error!("cycle budget of {} exhausted in {}", self.max_cycles, self.fsm.state());
                return Err(EmuError::CycleBudgetExceeded {
                    budget: self.max_cycles,
                });
            }

            let cycle = self.total_cycles;
            let inputs = host.drive(cycle);
            let outputs = self.tick(&inputs)?;
            host.observe(cycle, &outputs);
            elapsed += 1;

            if outputs.done {
                return Ok(elapsed);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    #[inline]
    pub fn fsm(&self) -> &ControlFsm {
        &self.fsm
    }

    #[inline]
    pub fn state(&self) -> FsmState {
        self.fsm.state()
    }

    #[inline]
    pub fn agu(&self) -> &AddressGenerator {
        &self.agu
    }

    #[inline]
    pub fn array(&self) -> &SystolicArray {
        &self.array
    }

    #[inline]
    pub fn memory(&self) -> &MemoryPort {
        &self.memory
    }

    #[inline]
    pub fn geometry(&self) -> Option<&TileGeometry> {
        self.fsm.geometry()
    }

    /// State transitions of the current (or last) run.
    #[inline]
    pub fn trace(&self) -> &[StateTransition] {
        &self.trace
    }

    /// States visited by the current (or last) run, starting from IDLE.
    pub fn state_sequence(&self) -> Vec<FsmState> {
        let first = self.trace.first().map_or(self.fsm.state(), |t| t.from);
        std::iter::once(first).chain(self.trace.iter().map(|t| t.to)).collect()
    }

    #[inline]
    pub fn runs_completed(&self) -> u64 {
        self.runs_completed
    }

    /// rx transfers since reset.
    #[inline]
    pub fn rx_transfers(&self) -> u64 {
        self.rx.transfers()
    }

    /// tx transfers and stalls since reset.
    #[inline]
    pub fn tx_stats(&self) -> (u64, u64) {
        (self.tx.transfers(), self.tx.stalls())
    }

    /// Get a status string for the engine.
    pub fn status_string(&self) -> &'static str {
        match self.status {
            EngineStatus::Idle => "Idle",
            EngineStatus::Running => "Running",
            EngineStatus::Done => "Done",
            EngineStatus::Faulted => "Faulted",
        }
    }

    /// Print engine status.
    pub fn print_status(&self) {
        println!("Engine Status: {}", self.status_string());
        println!("Total Cycles: {}", self.total_cycles);
        println!("FSM State: {}", self.fsm.state());
        if let Some(geo) = self.fsm.geometry() {
            let RunConfig { n, k, array_size } = geo.config;
            println!("Run: N={} K={} on {}x{}", n, k, array_size, array_size);
            println!(
                "Counters: weights={} inputs={} outputs={}/{}",
                self.fsm.weight_count(),
                self.fsm.input_count(),
                self.fsm.output_count(),
                geo.total_outputs()
            );
        }
        println!("MAC ops: {}", self.array.mac_ops());
        let (tx_transfers, tx_stalls) = self.tx_stats();
        println!(
            "Streams: rx={} tx={} (stalled {} ticks)",
            self.rx.transfers(),
            tx_transfers,
            tx_stalls
        );

        println!();
        println!("Memory Regions:");
        for region in self.memory.layout().regions() {
            let stats = self.memory.region_stats(region.name).unwrap_or_default();
            println!(
                "  {:<12} 0x{:04X}..0x{:04X} reads={} writes={}",
                region.name,
                region.base,
                region.end(),
                stats.reads,
                stats.writes
            );
        }

        if !self.trace.is_empty() {
            println!();
            println!("State Trace:");
            for t in &self.trace {
                println!("  @{:>6} {} -> {}", t.cycle, t.from, t.to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle() -> HostInputs {
        HostInputs::default()
    }

    fn start(n: usize, k: usize) -> HostInputs {
        HostInputs {
            start: true,
            config_n: n,
            config_k: k,
            ..Default::default()
        }
    }

    #[test]
    fn test_idle_never_ready() {
        let mut acc = Accelerator::with_array_size(8).unwrap();
        for _ in 0..5 {
            let out = acc
                .tick(&HostInputs { rx: StreamBeat::valid(7), tx_ready: true, ..idle() })
                .unwrap();
            assert!(!out.rx_ready && !out.rx_fire);
            assert!(!out.tx.valid);
            assert!(!out.busy);
        }
        assert_eq!(acc.status, EngineStatus::Idle);
        assert_eq!(acc.rx_transfers(), 0);
    }

    #[test]
    fn test_bad_start_stays_idle() {
        let mut acc = Accelerator::with_array_size(8).unwrap();
        let err = acc.tick(&start(16, 1)).unwrap_err();
        assert!(matches!(
            err,
            EmuError::Configuration(ConfigurationError::KernelDimOutOfRange { k: 1, .. })
        ));
        assert_eq!(acc.state(), FsmState::Idle);
        assert_eq!(acc.status, EngineStatus::Idle);

        // A fresh, valid start is accepted
        acc.tick(&start(16, 3)).unwrap();
        assert_eq!(acc.state(), FsmState::LoadWeights);
        assert_eq!(acc.status, EngineStatus::Running);
    }

    #[test]
    fn test_load_weights_accepts_stream() {
        let mut acc = Accelerator::with_array_size(8).unwrap();
        acc.tick(&start(16, 3)).unwrap();

        let mut accepted = 0;
        for i in 0..20u8 {
            let out = acc.tick(&HostInputs { rx: StreamBeat::valid(i), ..idle() });
            if out.unwrap().rx_fire {
                accepted += 1;
            }
            if acc.state() != FsmState::LoadWeights {
                break;
            }
        }
        assert_eq!(accepted, 9);
        assert_eq!(acc.state(), FsmState::LoadInput);
        assert_eq!(acc.fsm().weight_count(), 9);
        let base = acc.memory().layout().weights.base;
        assert_eq!(acc.memory().peek_bytes(base, 9), (0..9).collect::<Vec<u8>>());
    }

    #[test]
    fn test_reset_overrides() {
        let mut acc = Accelerator::with_array_size(8).unwrap();
        acc.tick(&start(16, 3)).unwrap();
        acc.tick(&HostInputs { rx: StreamBeat::valid(5), ..idle() }).unwrap();
        assert_eq!(acc.state(), FsmState::LoadWeights);

        let out = acc.tick(&HostInputs { reset: true, ..start(16, 3) }).unwrap();
        assert_eq!(out, HostOutputs::default());
        assert_eq!(acc.state(), FsmState::Idle);
        assert_eq!(acc.total_cycles, 0);
        assert!(acc.trace().is_empty());
        assert_eq!(acc.memory().peek(0), 0);
    }

    #[test]
    fn test_rx_instability_faults() {
        let mut acc = Accelerator::with_array_size(8).unwrap();
        acc.tick(&start(16, 3)).unwrap();
        // Take all nine weights, then the accelerator stops being ready
        // until LOAD_INPUT starts
        for i in 0..9u8 {
            acc.tick(&HostInputs { rx: StreamBeat::valid(i), ..idle() }).unwrap();
        }
        let out = acc.tick(&HostInputs { rx: StreamBeat::valid(0xAA), ..idle() }).unwrap();
        assert!(!out.rx_ready);

        let err = acc
            .tick(&HostInputs { rx: StreamBeat::valid(0xBB), ..idle() })
            .unwrap_err();
        assert!(matches!(
            err,
            EmuError::Protocol(ProtocolViolation::UnstableData { port: "rx", held: 0xAA, presented: 0xBB })
        ));
        assert_eq!(acc.status, EngineStatus::Faulted);
    }

    #[test]
    fn test_faulted_engine_holds_until_reset() {
        let mut acc = Accelerator::with_array_size(8).unwrap();
        acc.tick(&start(16, 3)).unwrap();
        for i in 0..9u8 {
            acc.tick(&HostInputs { rx: StreamBeat::valid(i), ..idle() }).unwrap();
        }
        acc.tick(&HostInputs { rx: StreamBeat::valid(0xAA), ..idle() }).unwrap();
        assert!(acc.tick(&HostInputs { rx: StreamBeat::valid(0xBB), ..idle() }).is_err());
        assert_eq!(acc.status, EngineStatus::Faulted);

        let state = acc.state();
        let transfers = acc.rx_transfers();
        let cycles = acc.total_cycles;
        for _ in 0..50 {
            let err = acc
                .tick(&HostInputs { rx: StreamBeat::valid(0xBB), tx_ready: true, ..idle() })
                .unwrap_err();
            assert_eq!(err, EmuError::Faulted);
        }
        assert_eq!(acc.state(), state);
        assert_eq!(acc.rx_transfers(), transfers);
        assert_eq!(acc.total_cycles, cycles);

        acc.tick(&HostInputs { reset: true, ..idle() }).unwrap();
        assert_eq!(acc.status, EngineStatus::Idle);
        acc.tick(&start(16, 3)).unwrap();
        assert_eq!(acc.state(), FsmState::LoadWeights);
    }

    struct StallingHost;

    impl HostInterface for StallingHost {
        fn drive(&mut self, cycle: u64) -> HostInputs {
            if cycle == 0 { start(16, 3) } else { idle() }
        }

        fn observe(&mut self, _cycle: u64, _outputs: &HostOutputs) {}
    }

    #[test]
    fn test_cycle_budget() {
        let mut acc = Accelerator::with_array_size(8).unwrap();
        acc.max_cycles = 50;
        let err = acc.run(&mut StallingHost).unwrap_err();
        assert_eq!(err, EmuError::CycleBudgetExceeded { budget: 50 });
        assert_eq!(acc.state(), FsmState::LoadWeights);
    }

    #[test]
    fn test_layout_too_small_rejected_at_latch() {
        let mut layout = MemoryLayout::packed(8);
        layout.weights.words = 2;
        let mut acc = Accelerator::new(8, layout).unwrap();

        let err = acc.tick(&start(16, 3)).unwrap_err();
        assert!(matches!(
            err,
            EmuError::Configuration(ConfigurationError::RegionTooSmall { region: "weights", .. })
        ));
        assert_eq!(acc.state(), FsmState::Idle);
    }
}
