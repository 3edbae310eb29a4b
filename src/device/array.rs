//! Systolic array: the PE grid plus the state that outlives one kernel tile.
//!
//! PEs are stored in a flat Vec, row-major (`row * size + col`). Every tick
//! the next grid is built from a snapshot of the current one and the two
//! buffers are swapped, so no PE observes a neighbour's same-tick update.
//!
//! # Dataflow
//!
//! ```text
//!   west[0] --> PE(0,0) --> PE(0,1) --> ... pixels move right
//!                  |           |
//!   west[1] --> PE(1,0) --> PE(1,1) --> ...
//!                  |           |        psums move down
//!                  v           v
//!            bottom row psums, summed per tick
//! ```
//!
//! # Weight-stationary mapping
//!
//! For a kernel tile with extent `kr x kc` starting at kernel `(row0, col0)`,
//! PE `(r, c)` holds `W[row0 + r][col0 + kc - 1 - c]`; PEs outside the
//! extent hold zero. During the sweep for output row `oy`, array row `r`
//! streams staged input row `oy + row0 + r` from column `col0`, skewed by
//! `r` ticks. The sum of the bottom-row psums `size + kc - 1 + ox` ticks into
//! the sweep is this tile's contribution to output `(oy, ox)`.
//!
//! # Accumulation across kernel tiles
//!
//! The output accumulators hold each output's running partial sum between
//! kernel tiles. During a sweep the running sum of output `ox` is loaded as
//! the memory base of PE `(0, 0)` on tick `kc - 1 + ox`. It rides down
//! column 0 and reaches the bottom row on the tick that output is sampled,
//! so the sample is the running sum plus this tile's contribution and is
//! stored back.
//!
//! ```text
//!   tick kc-1+ox:          psum_from_memory[0] = outputs[oy][ox]
//!   tick size+kc-2+ox:     outputs[oy][ox] = bottom row sum
//! ```
//!
//! The accumulators and PE partial sums are cleared once per output tile,
//! when its first kernel tile begins. Clearing between kernel tiles would
//! drop the earlier tiles' contributions.

use smallvec::SmallVec;

use crate::device::geometry::{KernelTile, OutputTile};
use crate::device::pe::{PeInputs, ProcessingElement};
use crate::device::arch;

/// One value per array edge position.
pub type EdgeVec<T> = SmallVec<[T; arch::MAX_ARRAY_SIZE]>;

/// Weight-load request for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightLoad {
    #[default]
    None,
    /// Every PE latches the same weight.
    Broadcast(u8),
    /// One PE latches a weight; the rest hold.
    Single { row: usize, col: usize, value: u8 },
}

/// Signals the array samples in one tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrayInputs<'a> {
    pub enable: bool,
    /// Pixels entering column 0, one per row. Missing rows read as zero.
    pub west: &'a [u8],
    /// Psums entering row 0, one per column. Missing columns read as zero.
    pub north: &'a [u32],
    /// Per-PE base overriding the psum from above (row-major). PEs past
    /// the end of the slice use the psum from above.
    pub psum_from_memory: Option<&'a [u32]>,
    pub weight_load: WeightLoad,
}

/// Array-level tiling flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TilingState {
    /// Accumulators were cleared for the current output tile.
    pub cleared_once: bool,
    pub current_kernel_tile: usize,
    pub is_last_tile: bool,
    /// Current kernel tile's MAC pass finished.
    pub tile_done: bool,
    /// Last kernel tile finished: results are final.
    pub array_done: bool,
}

/// The PE grid with its input line store and output accumulators.
pub struct SystolicArray {
    size: usize,
    pes: Vec<ProcessingElement>,
    /// Back buffer for the next tick.
    next: Vec<ProcessingElement>,
    /// Staged input tile, `stage_dim x stage_dim` row-major.
    stage: Vec<u8>,
    stage_dim: usize,
    /// Output accumulators of the current output tile, row-major.
    outputs: Vec<u32>,
    output_rows: usize,
    output_cols: usize,
    tiling: TilingState,
    mac_ops: u64,
}

impl SystolicArray {
    pub fn new(size: usize) -> Self {
        let cells = size * size;
        Self {
            size,
            pes: vec![ProcessingElement::new(); cells],
            next: vec![ProcessingElement::new(); cells],
            stage: Vec::new(),
            stage_dim: 0,
            outputs: Vec::new(),
            output_rows: 0,
            output_cols: 0,
            tiling: TilingState::default(),
            mac_ops: 0,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn index(&self, row: usize, col: usize) -> usize {
        row * self.size + col
    }

    #[inline]
    pub fn pe(&self, row: usize, col: usize) -> &ProcessingElement {
        &self.pes[self.index(row, col)]
    }

    /// Advance the grid one tick.
    pub fn step(&mut self, inputs: &ArrayInputs<'_>) {
        let size = self.size;
        let computing = inputs.enable && inputs.weight_load == WeightLoad::None;

        for row in 0..size {
            for col in 0..size {
                let idx = row * size + col;
                let pixel_in = if col == 0 {
                    inputs.west.get(row).copied().unwrap_or(0)
                } else {
                    self.pes[idx - 1].pixel_out()
                };
                let psum_in = if row == 0 {
                    inputs.north.get(col).copied().unwrap_or(0)
                } else {
                    self.pes[idx - size].psum_out()
                };
                let load_weight = match inputs.weight_load {
                    WeightLoad::None => None,
                    WeightLoad::Broadcast(value) => Some(value),
                    WeightLoad::Single { row: r, col: c, value } => (r == row && c == col).then_some(value),
                };

                let pe_inputs = PeInputs {
                    pixel_in,
                    psum_in,
                    psum_from_memory: inputs.psum_from_memory.and_then(|m| m.get(idx).copied()),
                    load_weight,
                };
                let enabled = computing || (inputs.enable && load_weight.is_some());
                self.next[idx] = self.pes[idx].next(&pe_inputs, enabled);
            }
        }

        std::mem::swap(&mut self.pes, &mut self.next);
        if computing {
            self.mac_ops += (size * size) as u64;
        }
    }

    /// Psums leaving the bottom row.
    pub fn bottom_psums(&self) -> EdgeVec<u32> {
        let last = self.size - 1;
        (0..self.size).map(|col| self.pe(last, col).psum_out()).collect()
    }

    /// Sum of the psums leaving the bottom row this tick.
    pub fn bottom_row_sum(&self) -> u32 {
        self.bottom_psums()
            .iter()
            .fold(0u32, |acc, &p| acc.wrapping_add(p))
    }

    /// Clear pulse: zero every partial sum and accumulator. Weights are kept.
    pub fn clear(&mut self) {
        for pe in &mut self.pes {
            pe.clear_partial_sums();
        }
        self.outputs.fill(0);
        self.tiling = TilingState::default();
    }

    /// Global reset.
    pub fn reset(&mut self) {
        *self = Self::new(self.size);
    }

    // ------------------------------------------------------------------------
    // Output tile lifecycle
    // ------------------------------------------------------------------------

    /// Prepare for a new output tile: size the line store and accumulators
    /// and re-arm the clear-once rule.
    pub fn begin_output_tile(&mut self, tile: &OutputTile, stage_dim: usize) {
        self.stage_dim = stage_dim;
        self.stage.clear();
        self.stage.resize(stage_dim * stage_dim, 0);
        self.output_rows = tile.rows;
        self.output_cols = tile.cols;
        self.outputs.clear();
        self.outputs.resize(tile.len(), 0);
        self.tiling = TilingState::default();
    }

    /// Start a kernel tile. Accumulators are cleared only for the first
    /// kernel tile of the output tile.
    pub fn begin_kernel_tile(&mut self, tile: &KernelTile) {
        if !self.tiling.cleared_once {
            for pe in &mut self.pes {
                pe.clear_partial_sums();
            }
            self.outputs.fill(0);
            self.tiling.cleared_once = true;
            log::trace!("array: accumulators cleared for kernel tile {}", tile.index);
        }
        self.tiling.current_kernel_tile = tile.index;
        self.tiling.is_last_tile = tile.is_last;
        self.tiling.tile_done = false;
        self.tiling.array_done = false;
    }

    /// Mark the current kernel tile finished.
    pub fn finish_kernel_tile(&mut self) {
        self.tiling.tile_done = true;
        if self.tiling.is_last_tile {
            self.tiling.array_done = true;
        }
        log::trace!(
            "array: kernel tile {} done (last={})",
            self.tiling.current_kernel_tile,
            self.tiling.is_last_tile
        );
    }

    #[inline]
    pub fn tiling(&self) -> &TilingState {
        &self.tiling
    }

    #[inline]
    pub fn tile_done(&self) -> bool {
        self.tiling.tile_done
    }

    #[inline]
    pub fn array_done(&self) -> bool {
        self.tiling.array_done
    }

    // ------------------------------------------------------------------------
    // Input line store
    // ------------------------------------------------------------------------

    /// Store one staged input pixel.
    pub fn write_stage(&mut self, row: usize, col: usize, value: u8) {
        if row < self.stage_dim && col < self.stage_dim {
            self.stage[row * self.stage_dim + col] = value;
        }
    }

    /// Staged pixel, zero outside the store.
    #[inline]
    pub fn stage_at(&self, row: usize, col: usize) -> u8 {
        if row < self.stage_dim && col < self.stage_dim {
            self.stage[row * self.stage_dim + col]
        } else {
            0
        }
    }

    #[inline]
    pub fn stage_dim(&self) -> usize {
        self.stage_dim
    }

    // ------------------------------------------------------------------------
    // Weight mapping and row sweeps
    // ------------------------------------------------------------------------

    /// PE that holds weight `(window_row, window_col)` of a kernel tile.
    #[inline]
    pub fn weight_target(tile: &KernelTile, window_row: usize, window_col: usize) -> (usize, usize) {
        (window_row, tile.cols - 1 - window_col)
    }

    /// Ticks one row sweep takes for a kernel tile.
    #[inline]
    pub fn sweep_len(&self, tile: &KernelTile) -> usize {
        self.size + tile.cols - 1 + self.output_cols
    }

    /// Pixel entering array row `row` at tick `tau` of the sweep for output row `oy`.
    fn sweep_pixel(&self, tile: &KernelTile, oy: usize, tau: usize, row: usize) -> u8 {
        if row >= tile.rows || tau < row {
            return 0;
        }
        self.stage_at(oy + tile.row0 + row, tile.col0 + tau - row)
    }

    /// Run tick `tau` of the sweep for output row `oy`.
    ///
    /// Returns true on the sweep's last tick.
    pub fn sweep_step(&mut self, tile: &KernelTile, oy: usize, tau: usize) -> bool {
        let west: EdgeVec<u8> = (0..self.size)
            .map(|row| self.sweep_pixel(tile, oy, tau, row))
            .collect();
        let base = tau
            .checked_sub(tile.cols - 1)
            .and_then(|ox| self.output_slot(oy, ox))
            .map(|slot| self.outputs[slot]);
        self.step(&ArrayInputs {
            enable: true,
            west: &west,
            psum_from_memory: base.as_ref().map(std::slice::from_ref),
            ..Default::default()
        });

        let age = tau + 1;
        let first_sample = self.size + tile.cols - 1;
        if let Some(slot) = age.checked_sub(first_sample).and_then(|ox| self.output_slot(oy, ox)) {
            self.outputs[slot] = self.bottom_row_sum();
        }

        age >= self.sweep_len(tile)
    }

    /// Accumulator index of output `(oy, ox)` of the current output tile.
    #[inline]
    fn output_slot(&self, oy: usize, ox: usize) -> Option<usize> {
        (oy < self.output_rows && ox < self.output_cols).then(|| oy * self.output_cols + ox)
    }

    // ------------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------------

    /// Output accumulators of the current output tile, row-major.
    #[inline]
    pub fn outputs(&self) -> &[u32] {
        &self.outputs
    }

    #[inline]
    pub fn output(&self, oy: usize, ox: usize) -> u32 {
        self.outputs[oy * self.output_cols + ox]
    }

    /// `(rows, cols)` of the current output tile.
    #[inline]
    pub fn output_dims(&self) -> (usize, usize) {
        (self.output_rows, self.output_cols)
    }

    /// PE-ticks spent computing.
    #[inline]
    pub fn mac_ops(&self) -> u64 {
        self.mac_ops
    }
}
