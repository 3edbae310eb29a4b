//! Kernel-tile policy for the COMPUTE and DRAIN states.
//!
//! The AGU only knows address patterns; which patterns run in which order
//! lives here. Per output tile:
//!
//! ```text
//!   COMPUTE entry
//!     StageInput      SLIDING_WIN over the input bank, inputTileSize^2 reads
//!     for each kernel tile (ty, tx):
//!       ClearWeights  broadcast zero into every weight register (1 tick)
//!       LoadWeights   SLIDING_WIN over the kernel sub-block, one PE per read
//!       Sweep         one row sweep per output row of the tile
//!     -> array done
//!   DRAIN entry
//!     WriteBack       one accumulator word per tick into the output region
//!     Unload          AGU UNLOAD streams the words out over tx
//! ```
//!
//! Reads land one tick after issue. The window position of an outstanding
//! read is kept in a pending register and consumed in the next tick.

use smallvec::SmallVec;

use crate::device::agu::{AddressGenerator, AguConfig, AguInputs, AguMode, WindowRead};
use crate::device::array::{ArrayInputs, SystolicArray, WeightLoad};
use crate::device::geometry::{OutputTile, TileGeometry};
use crate::device::memory::{extract_lane, InputBank, MemoryLayout, MemoryRequest};
use crate::device::arch;

/// Requester tag for array write-back.
pub const REQUESTER: &str = "array";

/// Memory requests issued in one tick.
pub type RequestVec = SmallVec<[MemoryRequest; 2]>;

/// Where an outstanding read's byte goes when it lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingTarget {
    Stage { row: usize, col: usize },
    Weight { row: usize, col: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRead {
    target: PendingTarget,
    lane: usize,
}

/// Sequencer phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    StageInput,
    ClearWeights { tile: usize },
    LoadWeights { tile: usize },
    Sweep { tile: usize, oy: usize, tau: usize },
    WriteBack { index: usize },
    Unload,
}

/// What the sequencer drives in one tick.
#[derive(Debug, Clone, Default)]
pub struct SequencerOutputs {
    pub requests: RequestVec,
    /// tx data with valid high.
    pub tx: Option<u8>,
    pub tx_fire: bool,
    pub output_complete: bool,
}

/// COMPUTE/DRAIN sequencer.
#[derive(Debug, Clone)]
pub struct Sequencer {
    layout: MemoryLayout,
    geometry: Option<TileGeometry>,
    output_tile: Option<OutputTile>,
    bank: InputBank,
    phase: Phase,
    pending: Option<PendingRead>,
}

impl Sequencer {
    pub fn new(layout: MemoryLayout) -> Self {
        Self {
            layout,
            geometry: None,
            output_tile: None,
            bank: InputBank::Ping,
            phase: Phase::Idle,
            pending: None,
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Nothing staged, swept or drained is in flight.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle && self.pending.is_none()
    }

    /// Tile-start pulse: begin the compute pass for one output tile.
    pub fn begin_compute(
        &mut self,
        geometry: TileGeometry,
        tile: OutputTile,
        bank: InputBank,
        agu: &mut AddressGenerator,
        array: &mut SystolicArray,
    ) {
        self.geometry = Some(geometry);
        self.output_tile = Some(tile);
        self.bank = bank;
        self.pending = None;

        array.begin_output_tile(&tile, geometry.input_tile_size);
        agu.configure(AguConfig::input_window(&geometry, &self.layout, bank));
        agu.start();
        self.phase = Phase::StageInput;

        log::debug!(
            "compute: output tile {} at ({}, {}) {}x{} from {:?}, {} kernel tile(s)",
            tile.index,
            tile.row0,
            tile.col0,
            tile.rows,
            tile.cols,
            bank,
            geometry.num_kernel_tiles
        );
    }

    /// Drain-start pulse: write back and stream out the current tile.
    pub fn begin_drain(&mut self) {
        self.pending = None;
        self.phase = Phase::WriteBack { index: 0 };
    }

    /// Advance one tick.
    pub fn step(
        &mut self,
        agu: &mut AddressGenerator,
        array: &mut SystolicArray,
        read_data: Option<u32>,
        tx_ready: bool,
    ) -> SequencerOutputs {
        let mut out = SequencerOutputs::default();
        let (Some(geometry), Some(output_tile)) = (self.geometry, self.output_tile) else {
            return out;
        };

        let landed_weight = self.land_pending(array, read_data);

        match self.phase {
            Phase::Idle => {}

            Phase::StageInput => {
                self.issue_window_read(agu, &mut out, |read| PendingTarget::Stage {
                    row: read.row,
                    col: read.col,
                });
                if agu.is_done() {
                    self.phase = Phase::ClearWeights { tile: 0 };
                }
            }

            Phase::ClearWeights { tile } => {
                let kernel_tile = geometry.kernel_tile(tile);
                array.begin_kernel_tile(&kernel_tile);
                array.step(&ArrayInputs {
                    enable: true,
                    weight_load: WeightLoad::Broadcast(0),
                    ..Default::default()
                });
                agu.configure(AguConfig::weight_window(&geometry, &self.layout, &kernel_tile));
                agu.start();
                self.phase = Phase::LoadWeights { tile };
            }

            Phase::LoadWeights { tile } => {
                if !agu.is_done() {
                    let kernel_tile = geometry.kernel_tile(tile);
                    self.issue_window_read(agu, &mut out, |read| {
                        let (row, col) = SystolicArray::weight_target(&kernel_tile, read.row, read.col);
                        PendingTarget::Weight { row, col }
                    });
                } else if !landed_weight && self.pending.is_none() {
                    // Last weight landed last tick; the array is free this tick
                    self.phase = self.sweep_step(array, &geometry, tile, 0, 0);
                }
            }

            Phase::Sweep { tile, oy, tau } => {
                self.phase = self.sweep_step(array, &geometry, tile, oy, tau);
            }

            Phase::WriteBack { index } => {
                let results = array.outputs();
                if let Some(&value) = results.get(index) {
                    let address = self.layout.output.base + index as u32;
                    out.requests.push(MemoryRequest::write(address, value, arch::FULL_BYTE_MASK, REQUESTER));
                }
                if index + 1 >= results.len() {
                    agu.configure(AguConfig::unload(&self.layout, &output_tile));
                    agu.start();
                    self.phase = Phase::Unload;
                } else {
                    self.phase = Phase::WriteBack { index: index + 1 };
                }
            }

            Phase::Unload => {
                let agu_out = agu.step(&AguInputs {
                    read_data,
                    tx_ready,
                    ..Default::default()
                });
                out.requests.extend(agu_out.request);
                out.tx = agu_out.tx;
                out.tx_fire = agu_out.tx_fire;
                out.output_complete = agu_out.output_complete;
                if agu.is_done() {
                    log::debug!("drain: output tile {} streamed", output_tile.index);
                    self.phase = Phase::Idle;
                }
            }
        }

        out
    }

    /// Consume last tick's read. Returns true if it loaded a weight.
    fn land_pending(&mut self, array: &mut SystolicArray, read_data: Option<u32>) -> bool {
        let Some(pending) = self.pending.take() else {
            return false;
        };
        let Some(word) = read_data else {
            log::warn!("sequencer: read for {:?} returned no data", pending.target);
            return false;
        };

        let value = extract_lane(word, pending.lane);
        match pending.target {
            PendingTarget::Stage { row, col } => {
                array.write_stage(row, col, value);
                false
            }
            PendingTarget::Weight { row, col } => {
                array.step(&ArrayInputs {
                    enable: true,
                    weight_load: WeightLoad::Single { row, col, value },
                    ..Default::default()
                });
                true
            }
        }
    }

    fn issue_window_read(
        &mut self,
        agu: &mut AddressGenerator,
        out: &mut SequencerOutputs,
        target: impl FnOnce(&WindowRead) -> PendingTarget,
    ) {
        debug_assert_eq!(agu.mode(), AguMode::SlidingWindow);
        let agu_out = agu.step(&AguInputs {
            read_enable: true,
            ..Default::default()
        });
        if let Some(read) = agu_out.window_read {
            self.pending = Some(PendingRead {
                target: target(&read),
                lane: read.lane,
            });
        }
        out.requests.extend(agu_out.request);
    }

    fn sweep_step(
        &self,
        array: &mut SystolicArray,
        geometry: &TileGeometry,
        tile: usize,
        oy: usize,
        tau: usize,
    ) -> Phase {
        let kernel_tile = geometry.kernel_tile(tile);
        if !array.sweep_step(&kernel_tile, oy, tau) {
            return Phase::Sweep { tile, oy, tau: tau + 1 };
        }

        let (rows, _) = array.output_dims();
        if oy + 1 < rows {
            return Phase::Sweep { tile, oy: oy + 1, tau: 0 };
        }

        array.finish_kernel_tile();
        if kernel_tile.is_last {
            Phase::Idle
        } else {
            Phase::ClearWeights { tile: tile + 1 }
        }
    }

    /// Global reset.
    pub fn reset(&mut self) {
        *self = Self::new(self.layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::geometry::RunConfig;
    use crate::device::memory::MemoryPort;

    struct Bench {
        geometry: TileGeometry,
        memory: MemoryPort,
        agu: AddressGenerator,
        array: SystolicArray,
        sequencer: Sequencer,
    }

    impl Bench {
        fn new(n: usize, k: usize) -> Self {
            let geometry = TileGeometry::new(RunConfig::new(n, k));
            let layout = MemoryLayout::packed(geometry.array_size());
            Self {
                geometry,
                memory: MemoryPort::new(layout),
                agu: AddressGenerator::new(),
                array: SystolicArray::new(geometry.array_size()),
                sequencer: Sequencer::new(layout),
            }
        }

        fn tick(&mut self, tx_ready: bool) -> SequencerOutputs {
            let read_data = self.memory.read_data();
            let out = self.sequencer.step(&mut self.agu, &mut self.array, read_data, tx_ready);
            self.memory.cycle(&out.requests).unwrap();
            out
        }
    }

    #[test]
    fn test_compute_all_ones() {
        let mut bench = Bench::new(16, 5);
        let layout = *bench.memory.layout();
        bench.memory.poke_bytes(layout.weights.base, &[1u8; 25]);
        bench.memory.poke_bytes(layout.input_pong.base, &vec![2u8; bench.geometry.total_input_elems]);

        let tile = bench.geometry.output_tile(0);
        bench
            .sequencer
            .begin_compute(bench.geometry, tile, InputBank::Pong, &mut bench.agu, &mut bench.array);

        let mut ticks = 0;
        while !bench.sequencer.is_idle() {
            bench.tick(false);
            ticks += 1;
            assert!(ticks < 100_000);
        }

        assert!(bench.array.array_done());
        assert!(bench.array.outputs().iter().all(|&v| v == 50));
        assert_eq!(bench.agu.mode(), AguMode::SlidingWindow);
        assert!(bench.agu.is_done());
    }

    #[test]
    fn test_weight_load_phase_lands_every_weight() {
        let mut bench = Bench::new(16, 3);
        let layout = *bench.memory.layout();
        let kernel: Vec<u8> = (1..=9).collect();
        bench.memory.poke_bytes(layout.weights.base, &kernel);

        let tile = bench.geometry.output_tile(0);
        bench
            .sequencer
            .begin_compute(bench.geometry, tile, InputBank::Ping, &mut bench.agu, &mut bench.array);
        while !matches!(bench.sequencer.phase(), Phase::Sweep { .. }) {
            bench.tick(false);
        }

        // PE(r, c) holds W[r][kc - 1 - c]
        for r in 0..3 {
            for c in 0..3 {
                assert_eq!(bench.array.pe(r, c).weight(), kernel[r * 3 + (2 - c)]);
            }
        }
        assert_eq!(bench.array.pe(3, 0).weight(), 0);
        assert_eq!(bench.array.pe(0, 3).weight(), 0);
    }

    #[test]
    fn test_drain_writes_back_then_streams() {
        let mut bench = Bench::new(16, 2);
        let layout = *bench.memory.layout();
        let geometry = bench.geometry;
        let tile = geometry.output_tile(0);

        let kernel = [1u8, 2, 3, 4];
        bench.memory.poke_bytes(layout.weights.base, &kernel);
        let input: Vec<u8> = (0..geometry.total_input_elems).map(|i| (i % 11) as u8).collect();
        bench.memory.poke_bytes(layout.input_ping.base, &input);

        bench
            .sequencer
            .begin_compute(geometry, tile, InputBank::Ping, &mut bench.agu, &mut bench.array);
        while !bench.sequencer.is_idle() {
            bench.tick(false);
        }
        let results = bench.array.outputs().to_vec();

        bench.sequencer.begin_drain();
        let mut stream = Vec::new();
        let mut completed = 0;
        let mut tick = 0u32;
        while !bench.sequencer.is_idle() {
            let out = bench.tick(tick % 2 == 0);
            if out.tx_fire {
                stream.extend(out.tx);
            }
            completed += out.output_complete as usize;
            tick += 1;
            assert!(tick < 100_000);
        }

        let expected: Vec<u8> = results.iter().flat_map(|r| r.to_le_bytes()).collect();
        assert_eq!(stream, expected);
        assert_eq!(completed, tile.len());
        assert_eq!(
            bench.memory.peek(layout.output.base + 9),
            results[9],
            "write-back lands in the output region"
        );

        // Output (0, 0) = 1*x[0][0] + 2*x[0][1] + 3*x[1][0] + 4*x[1][1]
        let its = geometry.input_tile_size;
        let x = |r: usize, c: usize| input[r * its + c] as u32;
        assert_eq!(results[0], x(0, 0) + 2 * x(0, 1) + 3 * x(1, 0) + 4 * x(1, 1));
    }
}
