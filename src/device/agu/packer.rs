//! Byte-to-word packing for the stream-to-memory modes.
//!
//! Stream elements are one byte wide, memory words hold
//! [`arch::WORD_BYTES`] of them. The packer collects bytes in little-endian
//! lane order and hands out a word plus the byte mask of the lanes it filled.

use byteorder::{ByteOrder, LittleEndian};

use crate::device::arch;

/// Word buffer for byte packing.
#[derive(Debug, Clone, Default)]
pub struct WordPacker {
    lanes: [u8; arch::WORD_BYTES],
    filled: usize,
}

impl WordPacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one byte in the next lane.
    ///
    /// Returns true once the word is full.
    pub fn push(&mut self, byte: u8) -> bool {
        debug_assert!(self.filled < arch::WORD_BYTES, "push into a full word buffer");
        self.lanes[self.filled] = byte;
        self.filled += 1;
        self.is_full()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.filled == arch::WORD_BYTES
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Lanes filled so far.
    #[inline]
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Byte mask covering the filled lanes.
    #[inline]
    pub fn mask(&self) -> u8 {
        ((1u16 << self.filled) - 1) as u8
    }

    /// Take the packed word and its mask, leaving the buffer empty.
    pub fn take(&mut self) -> (u32, u8) {
        let mask = self.mask();
        let mut bytes = [0u8; arch::WORD_BYTES];
        bytes[..self.filled].copy_from_slice(&self.lanes[..self.filled]);
        self.clear();
        (LittleEndian::read_u32(&bytes), mask)
    }

    pub fn clear(&mut self) {
        self.lanes = [0; arch::WORD_BYTES];
        self.filled = 0;
    }
}
