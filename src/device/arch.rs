//! Architecture constants for the weight-stationary convolution engine.
//!
//! Everything that the hardware fixes at build time lives here: word and
//! element widths, supported configuration ranges, and the latency contract
//! of the memory collaborator. Components derive their shifts and masks from
//! these values instead of hard-coding them.

// ============================================================================
// Data widths
// ============================================================================

/// Width of one stream element (pixel or weight): 8 bits.
pub const ELEMENT_BITS: usize = 8;

/// Memory word width: 32 bits.
pub const WORD_BITS: usize = 32;

/// Elements packed into one memory word: 4.
/// "word = streamWidth / elementWidth elements"
pub const WORD_BYTES: usize = WORD_BITS / ELEMENT_BITS;

/// Byte-mask granularity: one enable bit per byte lane.
pub const BYTE_MASK_BITS: usize = WORD_BYTES;

/// Byte mask that enables every lane of a word.
pub const FULL_BYTE_MASK: u8 = (1 << BYTE_MASK_BITS) - 1;

/// Width of the PE product register (8 x 8 bits).
pub const PRODUCT_BITS: usize = 2 * ELEMENT_BITS;

/// Width of every partial-sum accumulator.
pub const ACCUMULATOR_BITS: usize = 32;

// ============================================================================
// Configuration ranges
// ============================================================================

/// Smallest supported kernel edge.
pub const MIN_KERNEL_DIM: usize = 2;

/// Largest supported kernel edge.
pub const MAX_KERNEL_DIM: usize = 16;

/// Smallest supported input edge.
pub const MIN_INPUT_DIM: usize = 16;

/// Largest supported input edge.
pub const MAX_INPUT_DIM: usize = 64;

/// Default systolic array edge.
pub const DEFAULT_ARRAY_SIZE: usize = 8;

/// Largest array edge the model accepts from configuration.
pub const MAX_ARRAY_SIZE: usize = 32;

/// A kernel may span at most this many array edges per dimension.
pub const MAX_KERNEL_TILES_PER_DIM: usize = 2;

// ============================================================================
// Timing
// ============================================================================

/// Memory read latency: data for a read issued in tick T is visible in T+1.
pub const MEMORY_READ_LATENCY: u64 = 1;

/// Ticks the array spends broadcasting zero into every weight register
/// before a kernel tile's weights are fetched.
pub const WEIGHT_CLEAR_TICKS: u64 = 1;

// ============================================================================
// Accumulator headroom
// ============================================================================

/// Largest value a single 8-bit x 8-bit product can take.
pub const MAX_PRODUCT: u64 = (u8::MAX as u64) * (u8::MAX as u64);

/// Worst-case sum for a `k x k` kernel with saturated pixels and weights.
#[inline]
pub const fn worst_case_accumulation(kernel_dim: usize) -> u64 {
    (kernel_dim as u64) * (kernel_dim as u64) * MAX_PRODUCT
}

/// Headroom of the 32-bit accumulator for the largest supported kernel.
///
/// 16 x 16 x 255 x 255 = 16_646_400, about 2^24. The 32-bit accumulator
/// leaves roughly 8 bits of headroom, so no supported configuration wraps.
pub const ACCUMULATOR_HEADROOM_BITS: u32 =
    (u32::MAX as u64 / worst_case_accumulation(MAX_KERNEL_DIM)).ilog2();

const _: () = assert!(worst_case_accumulation(MAX_KERNEL_DIM) <= u32::MAX as u64);
const _: () = assert!(MAX_PRODUCT <= u16::MAX as u64);
