//! Word-addressable memory collaborator with a one-cycle read latency.
//!
//! The accelerator sees a single memory with one read port and one write
//! port. Physical bank multiplexing is out of scope; logical banks are the
//! named regions of a [`MemoryLayout`] (weights, the two input ping-pong
//! buffers, and the output buffer).
//!
//! # Timing contract
//!
//! ```text
//!   tick T   : read(addr) issued          write(addr, word, mask) issued
//!   tick T+1 : read_data() == mem[addr]   write visible to reads issued >= T+1
//! ```
//!
//! A read issued in tick T returns the contents *before* any write issued in
//! the same tick. Reads and writes are never same-cycle-visible.
//!
//! # Usage
//!
//! ```
//! use systolic_emu::device::{MemoryLayout, MemoryPort, MemoryRequest};
//!
//! let layout = MemoryLayout::packed(8);
//! let mut mem = MemoryPort::new(layout);
//! let out = mem.layout().output.base;
//!
//! mem.cycle(&[MemoryRequest::write(out, 0xDEAD_BEEF, 0b1111, "test")]).unwrap();
//! mem.cycle(&[MemoryRequest::read(out, "test")]).unwrap();
//! assert_eq!(mem.read_data(), Some(0xDEAD_BEEF));
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::device::geometry::TileGeometry;
use crate::device::arch;
use crate::error::{ConfigurationError, ProtocolViolation};

/// Placement of one logical bank in word addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSpec {
    pub name: &'static str,
    /// First word of the region.
    pub base: u32,
    /// Size in words.
    pub words: u32,
}

impl RegionSpec {
    pub const fn new(name: &'static str, base: u32, words: u32) -> Self {
        Self { name, base, words }
    }

    /// One past the last word of the region.
    #[inline]
    pub fn end(&self) -> u32 {
        self.base + self.words
    }

    #[inline]
    pub fn contains(&self, address: u32) -> bool {
        address >= self.base && address < self.end()
    }

    #[inline]
    pub fn overlaps(&self, other: &RegionSpec) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

/// Which of the two input buffers a tile is loaded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputBank {
    #[default]
    Ping,
    Pong,
}

impl InputBank {
    /// The other buffer.
    #[inline]
    pub fn toggled(self) -> Self {
        match self {
            InputBank::Ping => InputBank::Pong,
            InputBank::Pong => InputBank::Ping,
        }
    }
}

/// Region placement for one accelerator instance.
///
/// Base addresses are configuration, not constants; [`MemoryLayout::packed`]
/// places the regions back-to-back sized for the largest run an array of a
/// given edge supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub weights: RegionSpec,
    pub input_ping: RegionSpec,
    pub input_pong: RegionSpec,
    pub output: RegionSpec,
    /// Total words in the memory.
    pub total_words: u32,
}

impl MemoryLayout {
    /// Pack all regions contiguously from word 0.
    pub fn packed(array_size: usize) -> Self {
        let (weight_words, input_words, output_words) = Self::capacity_words(array_size);

        let weights = RegionSpec::new("weights", 0, weight_words);
        let input_ping = RegionSpec::new("input_ping", weights.end(), input_words);
        let input_pong = RegionSpec::new("input_pong", input_ping.end(), input_words);
        let output = RegionSpec::new("output", input_pong.end(), output_words);

        Self {
            weights,
            input_ping,
            input_pong,
            output,
            total_words: output.end(),
        }
    }

    /// Region sizes (weights, one input buffer, output) for the largest
    /// kernel an array of this edge accepts.
    pub fn capacity_words(array_size: usize) -> (u32, u32, u32) {
        let max_k = arch::MAX_KERNEL_DIM.min(arch::MAX_KERNEL_TILES_PER_DIM * array_size);
        let input_tile = array_size + max_k - 1;
        let weight_words = (max_k * max_k).div_ceil(arch::WORD_BYTES) as u32;
        let input_words = (input_tile * input_tile).div_ceil(arch::WORD_BYTES) as u32;
        let output_words = (array_size * array_size) as u32;
        (weight_words, input_words, output_words)
    }

    /// All regions, in address-independent order.
    pub fn regions(&self) -> [RegionSpec; 4] {
        [self.weights, self.input_ping, self.input_pong, self.output]
    }

    /// Input buffer for a bank selector.
    #[inline]
    pub fn input(&self, bank: InputBank) -> RegionSpec {
        match bank {
            InputBank::Ping => self.input_ping,
            InputBank::Pong => self.input_pong,
        }
    }

    /// Logical bank containing an address.
    pub fn bank_of(&self, address: u32) -> &'static str {
        self.regions()
            .iter()
            .find(|r| r.contains(address))
            .map(|r| r.name)
            .unwrap_or("unmapped")
    }

    /// Check that regions are disjoint and inside the memory.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let regions = self.regions();
        for (i, region) in regions.iter().enumerate() {
            if region.end() > self.total_words {
                return Err(ConfigurationError::RegionOutOfBounds {
                    region: region.name,
                    end: region.end(),
                    words: self.total_words,
                });
            }
            for other in &regions[i + 1..] {
                if region.overlaps(other) {
                    return Err(ConfigurationError::RegionOverlap {
                        first: region.name,
                        second: other.name,
                    });
                }
            }
        }
        Ok(())
    }

    /// Check that every region is large enough for a run.
    pub fn validate_for(&self, geometry: &TileGeometry) -> Result<(), ConfigurationError> {
        let a = geometry.array_size();
        let needs = [
            (self.weights, geometry.weight_words()),
            (self.input_ping, geometry.input_words()),
            (self.input_pong, geometry.input_words()),
            (self.output, (a * a) as u32),
        ];
        for (region, required) in needs {
            if region.words < required {
                return Err(ConfigurationError::RegionTooSmall {
                    region: region.name,
                    available: region.words,
                    required,
                });
            }
        }
        Ok(())
    }
}

/// One access presented to the memory in a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRequest {
    Read {
        address: u32,
        requester: &'static str,
    },
    Write {
        address: u32,
        data: u32,
        /// One enable bit per byte lane.
        mask: u8,
        requester: &'static str,
    },
}

impl MemoryRequest {
    pub fn read(address: u32, requester: &'static str) -> Self {
        Self::Read { address, requester }
    }

    pub fn write(address: u32, data: u32, mask: u8, requester: &'static str) -> Self {
        Self::Write { address, data, mask, requester }
    }

    #[inline]
    pub fn address(&self) -> u32 {
        match *self {
            Self::Read { address, .. } | Self::Write { address, .. } => address,
        }
    }

    #[inline]
    pub fn requester(&self) -> &'static str {
        match *self {
            Self::Read { requester, .. } | Self::Write { requester, .. } => requester,
        }
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write { .. })
    }
}

/// Per-region access counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStats {
    pub reads: u64,
    pub writes: u64,
}

/// Merge the enabled byte lanes of `data` into `word`.
pub fn merge_masked(word: u32, data: u32, mask: u8) -> u32 {
    let mut current = [0u8; arch::WORD_BYTES];
    let mut incoming = [0u8; arch::WORD_BYTES];
    LittleEndian::write_u32(&mut current, word);
    LittleEndian::write_u32(&mut incoming, data);

    for lane in 0..arch::BYTE_MASK_BITS {
        if mask & (1 << lane) != 0 {
            current[lane] = incoming[lane];
        }
    }
    LittleEndian::read_u32(&current)
}

/// Extract one byte lane of a word.
#[inline]
pub fn extract_lane(word: u32, lane: usize) -> u8 {
    let mut bytes = [0u8; arch::WORD_BYTES];
    LittleEndian::write_u32(&mut bytes, word);
    bytes[lane % arch::WORD_BYTES]
}

/// The memory collaborator.
pub struct MemoryPort {
    layout: MemoryLayout,
    words: Vec<u32>,
    /// Read data register: result of the read issued in the previous tick.
    read_data: Option<u32>,
    stats: [RegionStats; 4],
    total_reads: u64,
    total_writes: u64,
}

impl MemoryPort {
    /// Create a zeroed memory for a layout.
    pub fn new(layout: MemoryLayout) -> Self {
        Self {
            layout,
            words: vec![0; layout.total_words as usize],
            read_data: None,
            stats: [RegionStats::default(); 4],
            total_reads: 0,
            total_writes: 0,
        }
    }

    #[inline]
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    #[inline]
    pub fn len_words(&self) -> u32 {
        self.words.len() as u32
    }

    /// Data returned for the read issued in the previous tick.
    #[inline]
    pub fn read_data(&self) -> Option<u32> {
        self.read_data
    }

    /// Advance the memory by one tick.
    ///
    /// At most one read and one write may be presented, and they may not
    /// target the same logical bank.
    pub fn cycle(&mut self, requests: &[MemoryRequest]) -> Result<(), ProtocolViolation> {
        let mut read: Option<(u32, &'static str)> = None;
        let mut write: Option<(u32, u32, u8, &'static str)> = None;

        for req in requests {
            self.check_address(req.address())?;
            match *req {
                MemoryRequest::Read { address, requester } => {
                    if let Some((prev, first)) = read {
                        return Err(ProtocolViolation::BankConflict {
                            bank: self.layout.bank_of(prev),
                            first,
                            second: requester,
                        });
                    }
                    read = Some((address, requester));
                }
                MemoryRequest::Write { address, data, mask, requester } => {
                    if let Some((prev, _, _, first)) = write {
                        return Err(ProtocolViolation::BankConflict {
                            bank: self.layout.bank_of(prev),
                            first,
                            second: requester,
                        });
                    }
                    write = Some((address, data, mask, requester));
                }
            }
        }

        if let (Some((raddr, reader)), Some((waddr, _, _, writer))) = (read, write) {
            let bank = self.layout.bank_of(raddr);
            if bank == self.layout.bank_of(waddr) {
                return Err(ProtocolViolation::BankConflict {
                    bank,
                    first: writer,
                    second: reader,
                });
            }
        }

        // Read samples memory before this tick's write lands
        self.read_data = None;
        if let Some((address, _)) = read {
            self.total_reads += 1;
            self.record(address, false);
            self.read_data = Some(self.words[address as usize]);
        }

        if let Some((address, data, mask, _)) = write {
            self.total_writes += 1;
            self.record(address, true);
            let slot = &mut self.words[address as usize];
            *slot = merge_masked(*slot, data, mask);
        }

        Ok(())
    }

    fn check_address(&self, address: u32) -> Result<(), ProtocolViolation> {
        if address >= self.len_words() {
            return Err(ProtocolViolation::AddressOutOfRange {
                address,
                words: self.len_words(),
            });
        }
        Ok(())
    }

    fn record(&mut self, address: u32, is_write: bool) {
        let regions = self.layout.regions();
        if let Some(i) = regions.iter().position(|r| r.contains(address)) {
            if is_write {
                self.stats[i].writes += 1;
            } else {
                self.stats[i].reads += 1;
            }
        }
    }

    /// Backdoor read of a word (no latency, no statistics).
    #[inline]
    pub fn peek(&self, address: u32) -> u32 {
        self.words.get(address as usize).copied().unwrap_or(0)
    }

    /// Backdoor read of `len` bytes starting at a word address.
    pub fn peek_bytes(&self, address: u32, len: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(len.next_multiple_of(arch::WORD_BYTES));
        let words = len.div_ceil(arch::WORD_BYTES) as u32;
        for i in 0..words {
            let mut buf = [0u8; arch::WORD_BYTES];
            LittleEndian::write_u32(&mut buf, self.peek(address + i));
            bytes.extend_from_slice(&buf);
        }
        bytes.truncate(len);
        bytes
    }

    /// Backdoor write of packed bytes starting at a word address.
    pub fn poke_bytes(&mut self, address: u32, bytes: &[u8]) {
        for (i, chunk) in bytes.chunks(arch::WORD_BYTES).enumerate() {
            let mut buf = [0u8; arch::WORD_BYTES];
            buf[..chunk.len()].copy_from_slice(chunk);
            if let Some(slot) = self.words.get_mut(address as usize + i) {
                *slot = LittleEndian::read_u32(&buf);
            }
        }
    }

    /// Access counters for a region by name.
    pub fn region_stats(&self, name: &str) -> Option<RegionStats> {
        self.layout
            .regions()
            .iter()
            .position(|r| r.name == name)
            .map(|i| self.stats[i])
    }

    pub fn total_reads(&self) -> u64 {
        self.total_reads
    }

    pub fn total_writes(&self) -> u64 {
        self.total_writes
    }

    /// Synchronous reset: contents, read register and counters.
    pub fn reset(&mut self) {
        self.words.fill(0);
        self.read_data = None;
        self.stats = [RegionStats::default(); 4];
        self.total_reads = 0;
        self.total_writes = 0;
    }

    /// Hexdump words for debugging.
    pub fn hexdump(&self, address: u32, words: u32) -> String {
        let mut result = String::new();
        for row in (0..words).step_by(4) {
            result.push_str(&format!("{:04X}:", address + row));
            for i in row..(row + 4).min(words) {
                result.push_str(&format!(" {:08X}", self.peek(address + i)));
            }
            result.push('\n');
        }
        result
    }
}
