//! Address-generation unit.
//!
//! The AGU turns a configured mode plus tile geometry into a sequence of
//! memory requests, one step per tick while enabled:
//!
//! | Mode            | Direction        | Pattern                                   |
//! |-----------------|------------------|-------------------------------------------|
//! | `LoadWeight`    | rx stream -> mem | pack bytes, write `base+0, base+1, ...`   |
//! | `LoadInput`     | rx stream -> mem | same, into the selected input bank        |
//! | `SlidingWindow` | mem -> array     | raster over a window, one read per enable |
//! | `Unload`        | mem -> tx stream | read word, wait one tick, emit byte lane  |
//!
//! The AGU is tile-agnostic: the control layer reconfigures it once per
//! kernel tile with a different window offset.
//!
//! # Unload timing
//!
//! ```text
//!   Issue    read(base + byte/4)
//!   Await    read_data valid, extract lane byte%4, present on tx
//!   Hold     tx not ready, keep presenting the same byte
//! ```

mod packer;
mod raster;

pub use packer::WordPacker;
pub use raster::{RasterIter, RasterScan, WindowRead, WindowShape};

use crate::device::geometry::{KernelTile, OutputTile, TileGeometry};
use crate::device::memory::{extract_lane, InputBank, MemoryLayout, MemoryRequest};
use crate::device::arch;

/// Requester tag the AGU puts on its memory requests.
pub const REQUESTER: &str = "agu";

/// Address pattern the AGU generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AguMode {
    #[default]
    Idle,
    LoadWeight,
    LoadInput,
    SlidingWindow,
    Unload,
}

impl AguMode {
    /// Modes that consume the rx stream.
    #[inline]
    pub fn is_load(self) -> bool {
        matches!(self, AguMode::LoadWeight | AguMode::LoadInput)
    }
}

/// One mode activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AguConfig {
    pub mode: AguMode,
    /// Word address of the region the mode works on.
    pub base: u32,
    /// Bytes to move (load and unload modes).
    pub total_bytes: usize,
    /// Window to scan (sliding-window mode).
    pub window: WindowShape,
}

impl AguConfig {
    /// Load the whole `K x K` kernel into the weight region.
    pub fn load_weights(geometry: &TileGeometry, layout: &MemoryLayout) -> Self {
        Self {
            mode: AguMode::LoadWeight,
            base: layout.weights.base,
            total_bytes: geometry.total_weight_elems,
            window: WindowShape::default(),
        }
    }

    /// Load one input tile into an input bank.
    pub fn load_input(geometry: &TileGeometry, layout: &MemoryLayout, bank: InputBank) -> Self {
        Self {
            mode: AguMode::LoadInput,
            base: layout.input(bank).base,
            total_bytes: geometry.total_input_elems,
            window: WindowShape::default(),
        }
    }

    /// Scan a whole input tile out of an input bank.
    pub fn input_window(geometry: &TileGeometry, layout: &MemoryLayout, bank: InputBank) -> Self {
        let window = WindowShape::full(geometry.input_tile_size);
        Self {
            mode: AguMode::SlidingWindow,
            base: layout.input(bank).base,
            total_bytes: window.len(),
            window,
        }
    }

    /// Scan the weights of one kernel tile out of the weight region.
    pub fn weight_window(geometry: &TileGeometry, layout: &MemoryLayout, tile: &KernelTile) -> Self {
        let window = WindowShape::sub(tile.rows, tile.cols, geometry.config.k, tile.row0, tile.col0);
        Self {
            mode: AguMode::SlidingWindow,
            base: layout.weights.base,
            total_bytes: window.len(),
            window,
        }
    }

    /// Stream one output tile's results out of the output region.
    pub fn unload(layout: &MemoryLayout, tile: &OutputTile) -> Self {
        Self {
            mode: AguMode::Unload,
            base: layout.output.base,
            total_bytes: tile.len() * arch::WORD_BYTES,
            window: WindowShape::default(),
        }
    }
}

/// Signals the AGU samples in one tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct AguInputs {
    /// Byte accepted from rx this tick (valid and ready both high).
    pub rx_byte: Option<u8>,
    /// Consumer wants one window read this tick.
    pub read_enable: bool,
    /// Memory read register (data for last tick's read).
    pub read_data: Option<u32>,
    /// Downstream ready on tx.
    pub tx_ready: bool,
}

/// What the AGU drives in one tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct AguOutputs {
    pub request: Option<MemoryRequest>,
    /// Window position and lane of a read issued this tick.
    pub window_read: Option<WindowRead>,
    /// tx data with valid high.
    pub tx: Option<u8>,
    /// tx transfer completed this tick.
    pub tx_fire: bool,
    /// The transferred byte was the last lane of an output word.
    pub output_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum UnloadPhase {
    #[default]
    Issue,
    Await,
    Hold(u8),
}

/// The address-generation unit.
#[derive(Debug, Clone, Default)]
pub struct AddressGenerator {
    config: AguConfig,
    enabled: bool,
    done: bool,
    write_cursor: u32,
    read_cursor: usize,
    bytes_transferred: usize,
    packer: WordPacker,
    scan: Option<RasterScan>,
    unload: UnloadPhase,
}

impl AddressGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch a mode activation. The AGU stays disabled until [`start`](Self::start).
    pub fn configure(&mut self, config: AguConfig) {
        self.config = config;
        self.enabled = false;
        self.clear_cursors();
    }

    /// Enable the configured mode from its first address.
    pub fn start(&mut self) {
        self.clear_cursors();
        self.enabled = self.config.mode != AguMode::Idle;
        self.done = match self.config.mode {
            AguMode::Idle => false,
            AguMode::SlidingWindow => self.config.window.is_empty(),
            _ => self.config.total_bytes == 0,
        };
        log::trace!(
            "AGU start {:?} base=0x{:04X} bytes={}",
            self.config.mode,
            self.config.base,
            self.config.total_bytes
        );
    }

    /// Back to idle (global reset).
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn clear_cursors(&mut self) {
        self.done = false;
        self.write_cursor = 0;
        self.read_cursor = 0;
        self.bytes_transferred = 0;
        self.packer.clear();
        self.unload = UnloadPhase::Issue;
        self.scan = (self.config.mode == AguMode::SlidingWindow)
            .then(|| RasterScan::new(self.config.base, self.config.window));
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.done
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn mode(&self) -> AguMode {
        self.config.mode
    }

    #[inline]
    pub fn config(&self) -> &AguConfig {
        &self.config
    }

    #[inline]
    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred
    }

    #[inline]
    pub fn write_cursor(&self) -> u32 {
        self.write_cursor
    }

    #[inline]
    pub fn read_cursor(&self) -> usize {
        self.read_cursor
    }

    /// Current `(window_row, window_col)` of the sliding-window scan.
    pub fn window_position(&self) -> (usize, usize) {
        self.scan.as_ref().map(RasterScan::position).unwrap_or((0, 0))
    }

    /// rx ready: a load mode is running and still needs bytes.
    #[inline]
    pub fn rx_ready(&self) -> bool {
        self.enabled && !self.done && self.config.mode.is_load()
    }

    /// Advance one tick.
    pub fn step(&mut self, inputs: &AguInputs) -> AguOutputs {
        let mut out = AguOutputs::default();
        if !self.enabled || self.done {
            return out;
        }

        match self.config.mode {
            AguMode::Idle => {}
            AguMode::LoadWeight | AguMode::LoadInput => self.step_load(inputs, &mut out),
            AguMode::SlidingWindow => self.step_window(inputs, &mut out),
            AguMode::Unload => self.step_unload(inputs, &mut out),
        }
        out
    }

    fn step_load(&mut self, inputs: &AguInputs, out: &mut AguOutputs) {
        let Some(byte) = inputs.rx_byte else {
            return;
        };

        let full = self.packer.push(byte);
        self.bytes_transferred += 1;
        let last = self.bytes_transferred >= self.config.total_bytes;

        // A short final word is written with a partial mask
        if full || last {
            let (word, mask) = self.packer.take();
            let address = self.config.base + self.write_cursor;
            out.request = Some(MemoryRequest::write(address, word, mask, REQUESTER));
            self.write_cursor += 1;
        }
        if last {
            self.done = true;
        }
    }

    fn step_window(&mut self, inputs: &AguInputs, out: &mut AguOutputs) {
        if !inputs.read_enable {
            return;
        }
        let Some(scan) = self.scan.as_mut() else {
            return;
        };

        if let Some(read) = scan.next() {
            out.request = Some(MemoryRequest::read(read.address, REQUESTER));
            out.window_read = Some(read);
            self.bytes_transferred += 1;
        }
        if scan.is_finished() {
            self.done = true;
        }
    }

    fn step_unload(&mut self, inputs: &AguInputs, out: &mut AguOutputs) {
        match self.unload {
            UnloadPhase::Issue => {
                let address = self.config.base + (self.read_cursor / arch::WORD_BYTES) as u32;
                out.request = Some(MemoryRequest::read(address, REQUESTER));
                self.unload = UnloadPhase::Await;
            }
            UnloadPhase::Await => match inputs.read_data {
                Some(word) => {
                    let byte = extract_lane(word, self.read_cursor % arch::WORD_BYTES);
                    self.present(byte, inputs.tx_ready, out);
                }
                None => {
                    log::warn!("AGU unload: no read data at byte {}, reissuing", self.read_cursor);
                    self.unload = UnloadPhase::Issue;
                }
            },
            UnloadPhase::Hold(byte) => self.present(byte, inputs.tx_ready, out),
        }
    }

    fn present(&mut self, byte: u8, tx_ready: bool, out: &mut AguOutputs) {
        out.tx = Some(byte);
        if !tx_ready {
            self.unload = UnloadPhase::Hold(byte);
            return;
        }

        out.tx_fire = true;
        out.output_complete = self.read_cursor % arch::WORD_BYTES == arch::WORD_BYTES - 1;
        self.read_cursor += 1;
        self.bytes_transferred += 1;

        if self.read_cursor >= self.config.total_bytes {
            self.done = true;
        } else {
            self.unload = UnloadPhase::Issue;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::device::geometry::RunConfig;
    use crate::device::memory::MemoryPort;

    fn setup(n: usize, k: usize) -> (TileGeometry, MemoryPort) {
        let geo = TileGeometry::new(RunConfig::new(n, k));
        let mem = MemoryPort::new(MemoryLayout::packed(geo.array_size()));
        (geo, mem)
    }

    /// Feed bytes through a load mode, one per tick.
    fn load(agu: &mut AddressGenerator, mem: &mut MemoryPort, bytes: &[u8]) -> Vec<MemoryRequest> {
        let mut writes = Vec::new();
        for &byte in bytes {
            assert!(agu.rx_ready());
            let out = agu.step(&AguInputs { rx_byte: Some(byte), ..Default::default() });
            let requests: Vec<MemoryRequest> = out.request.into_iter().collect();
            mem.cycle(&requests).unwrap();
            writes.extend(requests);
        }
        writes
    }

    #[test]
    fn test_load_weights_packs_words() {
        let (geo, mut mem) = setup(16, 3);
        let layout = *mem.layout();
        let mut agu = AddressGenerator::new();
        agu.configure(AguConfig::load_weights(&geo, &layout));
        assert!(!agu.rx_ready());
        agu.start();

        let bytes: Vec<u8> = (1..=9).collect();
        let writes = load(&mut agu, &mut mem, &bytes);

        let summary: Vec<(u32, u8)> = writes
            .iter()
            .map(|w| match w {
                MemoryRequest::Write { address, mask, .. } => (*address, *mask),
                MemoryRequest::Read { .. } => panic!("unexpected read"),
            })
            .collect();
        let base = layout.weights.base;
        assert_eq!(summary, vec![(base, 0b1111), (base + 1, 0b1111), (base + 2, 0b0001)]);

        assert!(agu.is_done());
        assert!(!agu.rx_ready());
        assert_eq!(agu.bytes_transferred(), 9);
        assert_eq!(mem.peek_bytes(base, 9), bytes);
    }

    #[test]
    fn test_load_ignores_idle_ticks() {
        let (geo, mut mem) = setup(16, 2);
        let layout = *mem.layout();
        let mut agu = AddressGenerator::new();
        agu.configure(AguConfig::load_weights(&geo, &layout));
        agu.start();

        let out = agu.step(&AguInputs::default());
        assert!(out.request.is_none());
        assert_eq!(agu.bytes_transferred(), 0);

        load(&mut agu, &mut mem, &[7, 8, 9, 10]);
        assert!(agu.is_done());
        assert_eq!(agu.write_cursor(), 1);

        // Done: further bytes are not accepted
        let out = agu.step(&AguInputs { rx_byte: Some(1), ..Default::default() });
        assert!(out.request.is_none());
    }

    #[test]
    fn test_window_needs_read_enable() {
        let (geo, mem) = setup(16, 3);
        let mut agu = AddressGenerator::new();
        agu.configure(AguConfig::input_window(&geo, mem.layout(), InputBank::Ping));
        agu.start();

        let out = agu.step(&AguInputs::default());
        assert!(out.request.is_none());
        assert_eq!(agu.window_position(), (0, 0));

        let out = agu.step(&AguInputs { read_enable: true, ..Default::default() });
        assert_eq!(out.request, Some(MemoryRequest::read(mem.layout().input_ping.base, REQUESTER)));
        assert_eq!(agu.window_position(), (0, 1));
    }

    #[test]
    fn test_window_emits_exact_count() {
        let (geo, mem) = setup(16, 3);
        let mut agu = AddressGenerator::new();
        agu.configure(AguConfig::input_window(&geo, mem.layout(), InputBank::Pong));
        agu.start();

        let base = mem.layout().input_pong.base;
        let mut count = 0;
        while !agu.is_done() {
            let out = agu.step(&AguInputs { read_enable: true, ..Default::default() });
            let address = out.request.map(|r| r.address()).unwrap();
            assert!(address >= base && address < base + geo.input_words());
            count += 1;
        }
        assert_eq!(count, geo.total_input_elems);

        let out = agu.step(&AguInputs { read_enable: true, ..Default::default() });
        assert!(out.request.is_none());
    }

    #[test]
    fn test_load_then_window_covers_every_byte() {
        for (n, k) in [(16, 2), (16, 3), (20, 5), (64, 8)] {
            let (geo, mut mem) = setup(n, k);
            let layout = *mem.layout();
            let mut agu = AddressGenerator::new();

            agu.configure(AguConfig::load_input(&geo, &layout, InputBank::Ping));
            agu.start();
            let bytes = vec![0x5A; geo.total_input_elems];
            let written: BTreeSet<usize> = load(&mut agu, &mut mem, &bytes)
                .iter()
                .flat_map(|w| {
                    let word = (w.address() - layout.input_ping.base) as usize;
                    (0..arch::WORD_BYTES).map(move |lane| word * arch::WORD_BYTES + lane)
                })
                .filter(|&b| b < geo.total_input_elems)
                .collect();

            agu.configure(AguConfig::input_window(&geo, &layout, InputBank::Ping));
            agu.start();
            let mut visited = BTreeSet::new();
            while !agu.is_done() {
                let out = agu.step(&AguInputs { read_enable: true, ..Default::default() });
                let read = out.window_read.unwrap();
                let word = (read.address - layout.input_ping.base) as usize;
                visited.insert(word * arch::WORD_BYTES + read.lane);
            }

            assert_eq!(written, visited, "coverage hole for N={n} K={k}");
        }
    }

    #[test]
    fn test_weight_window_offsets() {
        let geo = TileGeometry::new(RunConfig::new(20, 11));
        let layout = MemoryLayout::packed(8);
        let tile = geo.kernel_tile(1);
        let mut agu = AddressGenerator::new();
        agu.configure(AguConfig::weight_window(&geo, &layout, &tile));
        agu.start();

        let mut bytes = Vec::new();
        while !agu.is_done() {
            let read = agu
                .step(&AguInputs { read_enable: true, ..Default::default() })
                .window_read
                .unwrap();
            bytes.push((read.address - layout.weights.base) as usize * 4 + read.lane);
        }

        // Columns 8..11 of each of the first 8 kernel rows
        let expected: Vec<usize> = (0..8).flat_map(|r| (8..11).map(move |c| r * 11 + c)).collect();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_unload_with_backpressure() {
        let layout = MemoryLayout::packed(8);
        let mut mem = MemoryPort::new(layout);
        let geo = TileGeometry::new(RunConfig::new(16, 3));
        let tile = geo.output_tile(3);
        let results: Vec<u32> = (0..tile.len() as u32).map(|i| 0x0102_0304 + i).collect();
        let raw: Vec<u8> = results.iter().flat_map(|r| r.to_le_bytes()).collect();
        mem.poke_bytes(layout.output.base, &raw);

        let mut agu = AddressGenerator::new();
        agu.configure(AguConfig::unload(&layout, &tile));
        agu.start();

        let mut received = Vec::new();
        let mut completed = 0;
        let mut held: Option<u8> = None;
        for tick in 0..10_000u32 {
            if agu.is_done() {
                break;
            }
            let tx_ready = tick % 3 != 0;
            let out = agu.step(&AguInputs {
                read_data: mem.read_data(),
                tx_ready,
                ..Default::default()
            });

            if let (Some(prev), Some(now)) = (held, out.tx) {
                assert_eq!(prev, now, "tx data changed while stalled");
            }
            held = if out.tx.is_some() && !out.tx_fire { out.tx } else { None };

            if out.tx_fire {
                received.push(out.tx.unwrap());
            }
            if out.output_complete {
                completed += 1;
            }
            let requests: Vec<MemoryRequest> = out.request.into_iter().collect();
            mem.cycle(&requests).unwrap();
        }

        assert!(agu.is_done());
        assert_eq!(received, raw);
        assert_eq!(completed, tile.len());
    }

    #[test]
    fn test_configure_resets_state() {
        let (geo, mut mem) = setup(16, 2);
        let layout = *mem.layout();
        let mut agu = AddressGenerator::new();
        agu.configure(AguConfig::load_weights(&geo, &layout));
        agu.start();
        load(&mut agu, &mut mem, &[1, 2, 3, 4]);
        assert!(agu.is_done());

        agu.configure(AguConfig::load_input(&geo, &layout, InputBank::Pong));
        assert!(!agu.is_done());
        assert!(!agu.is_enabled());
        assert_eq!(agu.bytes_transferred(), 0);
        assert_eq!(agu.write_cursor(), 0);
    }
}
