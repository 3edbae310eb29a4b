//! Error taxonomy for the accelerator model.
//!
//! No error here is recoverable in-band. A [`ConfigurationError`] is raised
//! when a run is latched and leaves the accelerator idle; a
//! [`ProtocolViolation`] means a collaborator (or the model itself) broke an
//! interface contract and the run cannot be trusted any more.

use thiserror::Error;

use crate::device::arch;

/// Rejected run or device configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Input edge outside the supported range.
    #[error("input dimension N={n} outside supported range {min}..={max}")]
    InputDimOutOfRange { n: usize, min: usize, max: usize },

    /// Kernel edge outside the supported range.
    #[error("kernel dimension K={k} outside supported range {min}..={max}")]
    KernelDimOutOfRange { k: usize, min: usize, max: usize },

    /// Kernel larger than the input it slides over.
    #[error("kernel dimension K={k} exceeds input dimension N={n}")]
    KernelLargerThanInput { n: usize, k: usize },

    /// Kernel needs more tiles than the array supports per dimension.
    #[error("kernel dimension K={k} exceeds {max_tiles} x array size {array_size}")]
    KernelTooLargeForArray {
        k: usize,
        array_size: usize,
        max_tiles: usize,
    },

    /// Array edge outside the range the model supports.
    #[error("array size {size} outside supported range 1..={max}")]
    ArraySizeOutOfRange { size: usize, max: usize },

    /// Worst-case accumulation would not fit in the accumulator.
    #[error("kernel K={k} can accumulate up to {worst_case}, exceeding the {bits}-bit accumulator")]
    AccumulatorOverflowRisk { k: usize, worst_case: u64, bits: usize },

    /// A memory region is too small for the data the run places in it.
    #[error("memory region '{region}' holds {available} words, run needs {required}")]
    RegionTooSmall {
        region: &'static str,
        available: u32,
        required: u32,
    },

    /// Two memory regions overlap.
    #[error("memory region '{first}' overlaps '{second}'")]
    RegionOverlap {
        first: &'static str,
        second: &'static str,
    },

    /// A memory region extends past the end of the memory.
    #[error("memory region '{region}' ends at word {end}, memory has {words} words")]
    RegionOutOfBounds {
        region: &'static str,
        end: u32,
        words: u32,
    },

    /// Image or kernel data does not match its declared edge.
    #[error("{what} has {actual} elements, expected {expected}")]
    DataLengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl ConfigurationError {
    /// Check the accumulator headroom for a kernel edge.
    pub fn check_headroom(k: usize) -> Result<(), Self> {
        let worst_case = arch::worst_case_accumulation(k);
        if worst_case > u32::MAX as u64 {
            return Err(Self::AccumulatorOverflowRisk {
                k,
                worst_case,
                bits: arch::ACCUMULATOR_BITS,
            });
        }
        Ok(())
    }
}

/// A collaborator or component broke an interface contract.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Producer changed its data while valid was held without ready.
    #[error("{port}: data changed from 0x{held:02X} to 0x{presented:02X} before ready was seen")]
    UnstableData {
        port: &'static str,
        held: u8,
        presented: u8,
    },

    /// Producer dropped valid before the transfer completed.
    #[error("{port}: valid dropped before ready was seen")]
    ValidDropped { port: &'static str },

    /// Two accesses that may not share a bank in one tick.
    #[error("bank '{bank}' accessed by both {first} and {second} in one tick")]
    BankConflict {
        bank: &'static str,
        first: &'static str,
        second: &'static str,
    },

    /// Access outside the memory.
    #[error("word address 0x{address:04X} outside memory of {words} words")]
    AddressOutOfRange { address: u32, words: u32 },
}

/// Umbrella error for running the model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmuError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Run did not finish inside the cycle budget.
    #[error("run did not complete within {budget} cycles")]
    CycleBudgetExceeded { budget: u64 },

    /// A protocol violation stopped the engine; only reset recovers.
    #[error("engine is faulted, reset required")]
    Faulted,
}
