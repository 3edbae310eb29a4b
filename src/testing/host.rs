//! Scripted host for end-to-end runs.
//!
//! [`HostDriver`] plays the system side of the host interface: it pulses
//! `start`, streams the kernel and every input tile over rx, consumes the
//! output stream over tx under a configurable backpressure pattern, and
//! reassembles the output image.
//!
//! The rx byte stream is one continuous sequence:
//!
//! ```text
//!   K^2 kernel bytes (row-major)
//!   then per output tile: (A+K-1)^2 input bytes starting at (row0, col0),
//!   zero beyond the image edge
//! ```

use byteorder::{ByteOrder, LittleEndian};
use serde::Deserialize;

use crate::device::geometry::{RunConfig, TileGeometry};
use crate::device::arch;
use crate::device::stream::{HandshakeMonitor, StreamBeat};
use crate::emu::{Accelerator, FsmState, HostInputs, HostInterface, HostOutputs};
use crate::error::{ConfigurationError, EmuError, ProtocolViolation};

/// Data pattern for an image or kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Pattern {
    /// Every element the same value.
    Constant { value: u8 },
    /// `start + i * step`, wrapping at 256.
    Ramp {
        #[serde(default)]
        start: u8,
        #[serde(default = "default_step")]
        step: u8,
    },
    /// All zeros.
    Zeros,
}

fn default_step() -> u8 {
    1
}

impl Pattern {
    /// Generate `len` elements.
    pub fn generate(&self, len: usize) -> Vec<u8> {
        match *self {
            Pattern::Constant { value } => vec![value; len],
            Pattern::Ramp { start, step } => (0..len)
                .map(|i| start.wrapping_add((i as u8).wrapping_mul(step)))
                .collect(),
            Pattern::Zeros => vec![0; len],
        }
    }
}

/// When the host consumer asserts `tx_ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TxReady {
    /// Ready on every tick.
    #[default]
    Always,
    /// Not ready for the first `stalled` ticks of every `period`.
    Periodic { period: u32, stalled: u32 },
}

impl TxReady {
    fn ready(&self, tick: u64) -> bool {
        match *self {
            TxReady::Always => true,
            TxReady::Periodic { period, stalled } => {
                period == 0 || (tick % period as u64) >= stalled as u64
            }
        }
    }
}

/// One convolution: image, kernel and their edges.
#[derive(Debug, Clone)]
pub struct ConvJob {
    pub n: usize,
    pub k: usize,
    /// `n x n`, row-major.
    pub image: Vec<u8>,
    /// `k x k`, row-major.
    pub kernel: Vec<u8>,
}

impl ConvJob {
    /// Checks the data against its edges and that the kernel fits the
    /// image. Range checks against the accelerator happen when it runs.
    pub fn new(n: usize, k: usize, image: Vec<u8>, kernel: Vec<u8>) -> Result<Self, ConfigurationError> {
        if k > n {
            return Err(ConfigurationError::KernelLargerThanInput { n, k });
        }
        if image.len() != n * n {
            return Err(ConfigurationError::DataLengthMismatch {
                what: "image",
                expected: n * n,
                actual: image.len(),
            });
        }
        if kernel.len() != k * k {
            return Err(ConfigurationError::DataLengthMismatch {
                what: "kernel",
                expected: k * k,
                actual: kernel.len(),
            });
        }
        Ok(Self { n, k, image, kernel })
    }

    pub fn from_patterns(n: usize, k: usize, image: Pattern, kernel: Pattern) -> Result<Self, ConfigurationError> {
        Self::new(n, k, image.generate(n * n), kernel.generate(k * k))
    }

    /// Golden outputs for this job.
    pub fn reference(&self) -> Vec<u32> {
        super::reference::conv2d(&self.image, self.n, &self.kernel, self.k)
    }

    /// The full rx byte sequence for a given array edge.
    pub fn rx_stream(&self, geometry: &TileGeometry) -> Vec<u8> {
        let its = geometry.input_tile_size;
        let mut stream = Vec::with_capacity(
            self.kernel.len() + geometry.num_output_tiles() * geometry.total_input_elems,
        );
        stream.extend_from_slice(&self.kernel);

        for tile in geometry.output_tiles() {
            for r in 0..its {
                for c in 0..its {
                    let (y, x) = (tile.row0 + r, tile.col0 + c);
                    let pixel = if y < self.n && x < self.n {
                        self.image[y * self.n + x]
                    } else {
                        0
                    };
                    stream.push(pixel);
                }
            }
        }
        stream
    }
}

/// Host side of one run.
pub struct HostDriver {
    config: RunConfig,
    geometry: TileGeometry,
    stream: Vec<u8>,
    cursor: usize,
    tx_ready: TxReady,
    ready_now: bool,
    ticks: u64,
    started: bool,
    done: bool,
    received: Vec<u8>,
    tx_monitor: HandshakeMonitor,
    violations: Vec<ProtocolViolation>,
}

impl HostDriver {
    /// Fails if the accelerator would reject the job's configuration.
    pub fn new(job: &ConvJob, array_size: usize, tx_ready: TxReady) -> Result<Self, ConfigurationError> {
        let config = RunConfig::new(job.n, job.k).with_array_size(array_size);
        config.validate()?;
        let geometry = TileGeometry::new(config);
        Ok(Self {
            config,
            geometry,
            stream: job.rx_stream(&geometry),
            cursor: 0,
            tx_ready,
            ready_now: false,
            ticks: 0,
            started: false,
            done: false,
            received: Vec::new(),
            tx_monitor: HandshakeMonitor::new("tx"),
            violations: Vec::new(),
        })
    }

    /// rx bytes accepted so far.
    pub fn bytes_sent(&self) -> usize {
        self.cursor
    }

    /// Raw tx bytes received so far.
    pub fn bytes_received(&self) -> &[u8] {
        &self.received
    }

    /// Contract violations seen on tx from the consumer side.
    pub fn violations(&self) -> &[ProtocolViolation] {
        &self.violations
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Reassemble the received words into the row-major output image.
    ///
    /// Outputs never received stay zero.
    pub fn output_image(&self) -> Vec<u32> {
        let dim = self.geometry.output_dim;
        let mut image = vec![0u32; dim * dim];
        let mut words = self.received.chunks_exact(arch::WORD_BYTES).map(LittleEndian::read_u32);

        for tile in self.geometry.output_tiles() {
            for r in 0..tile.rows {
                for c in 0..tile.cols {
                    let Some(word) = words.next() else {
                        return image;
                    };
                    image[(tile.row0 + r) * dim + tile.col0 + c] = word;
                }
            }
        }
        image
    }
}

impl HostInterface for HostDriver {
    fn drive(&mut self, _cycle: u64) -> HostInputs {
        let start = !self.started;
        self.started = true;
        self.ready_now = self.tx_ready.ready(self.ticks);
        self.ticks += 1;

        HostInputs {
            reset: false,
            start,
            config_n: self.config.n,
            config_k: self.config.k,
            rx: StreamBeat::from_option(self.stream.get(self.cursor).copied()),
            tx_ready: self.ready_now,
        }
    }

    fn observe(&mut self, cycle: u64, outputs: &HostOutputs) {
        if outputs.rx_fire {
            self.cursor += 1;
        }

        match self.tx_monitor.observe(outputs.tx, self.ready_now) {
            Ok(Some(byte)) => self.received.push(byte),
            Ok(None) => {}
            Err(violation) => {
                log::error!("host: cycle {}: {}", cycle, violation);
                self.violations.push(violation);
            }
        }

        if outputs.done {
            log::debug!(
                "host: done at cycle {} after {} rx / {} tx bytes",
                cycle,
                self.cursor,
                self.received.len()
            );
            self.done = true;
        }
    }
}

/// Outcome of one end-to-end run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Row-major output image.
    pub outputs: Vec<u32>,
    pub output_dim: usize,
    /// Ticks from the start pulse to the done pulse, inclusive.
    pub cycles: u64,
    /// States visited, starting from IDLE.
    pub states: Vec<FsmState>,
    pub weight_count: usize,
    pub output_count: usize,
    pub rx_bytes: usize,
    pub tx_bytes: usize,
    pub tx_stalls: u64,
    pub mac_ops: u64,
    pub violations: Vec<ProtocolViolation>,
}

impl RunReport {
    /// Positions where `outputs` differ from `expected`, as
    /// `(row, col, expected, actual)`.
    pub fn mismatches(&self, expected: &[u32]) -> Vec<(usize, usize, u32, u32)> {
        self.outputs
            .iter()
            .zip(expected)
            .enumerate()
            .filter(|(_, (actual, expected))| actual != expected)
            .map(|(i, (&actual, &expected))| (i / self.output_dim, i % self.output_dim, expected, actual))
            .collect()
    }

    pub fn print_summary(&self) {
        println!("Cycles: {}", self.cycles);
        let states: Vec<String> = self.states.iter().map(|s| s.to_string()).collect();
        println!("States: {}", states.join(" -> "));
        println!("Weights loaded: {}", self.weight_count);
        println!("Outputs: {} ({}x{})", self.output_count, self.output_dim, self.output_dim);
        println!("rx bytes: {}, tx bytes: {} ({} stalled ticks)", self.rx_bytes, self.tx_bytes, self.tx_stalls);
        println!("MAC ops: {}", self.mac_ops);
        if !self.violations.is_empty() {
            println!("Violations: {}", self.violations.len());
        }
    }
}

/// Run one job on an idle accelerator and collect the result.
pub fn run_job(acc: &mut Accelerator, job: &ConvJob, tx_ready: TxReady) -> Result<RunReport, EmuError> {
    let array_size = acc.array().size();
    let mut host = HostDriver::new(job, array_size, tx_ready)?;
    let cycles = acc.run(&mut host)?;
    let (_, tx_stalls) = acc.tx_stats();

    Ok(RunReport {
        outputs: host.output_image(),
        output_dim: host.geometry.output_dim,
        cycles,
        states: acc.state_sequence(),
        weight_count: acc.fsm().weight_count(),
        output_count: acc.fsm().output_count(),
        rx_bytes: host.bytes_sent(),
        tx_bytes: host.bytes_received().len(),
        tx_stalls,
        mac_ops: acc.array().mac_ops(),
        violations: host.violations,
    })
}
