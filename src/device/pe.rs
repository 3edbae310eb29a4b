//! Processing element: one multiply-accumulate cell of the systolic array.
//!
//! ```text
//!               psum_in (from above)
//!                    |
//!   pixel_in --> [ x weight ] --> pixel_out (to the right, 1 tick later)
//!                    |
//!              product_pipe     psum_pipe <- psum_in | psum_from_memory
//!                    \              /
//!                     +----[ + ]---+
//!                            |
//!                        psum_out ---> accumulator (latched every tick)
//!                            |
//!                   (to the PE below)
//! ```
//!
//! The product and the selected base go through one pipeline register each,
//! so they reach the adder in the same tick. `psum_out` is the adder result:
//! it depends only on registers, so a neighbour reading it sees the value
//! from the previous tick.
//!
//! While `load_weight` is asserted the PE latches the weight and holds
//! everything else. A disabled PE holds all of its registers.

/// Signals a PE samples in one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeInputs {
    pub pixel_in: u8,
    pub psum_in: u32,
    /// Base from memory; replaces `psum_in` when present.
    pub psum_from_memory: Option<u32>,
    /// Weight to latch instead of computing.
    pub load_weight: Option<u8>,
}

/// Register state of one PE.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingElement {
    weight: u8,
    pixel_out: u8,
    product_pipe: u16,
    psum_pipe: u32,
    accumulator: u32,
}

impl ProcessingElement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next register state. `self` is not modified.
    #[inline]
    pub fn next(&self, inputs: &PeInputs, enabled: bool) -> Self {
        if !enabled {
            return *self;
        }

        if let Some(weight) = inputs.load_weight {
            return Self { weight, ..*self };
        }

        Self {
            weight: self.weight,
            pixel_out: inputs.pixel_in,
            product_pipe: inputs.pixel_in as u16 * self.weight as u16,
            psum_pipe: inputs.psum_from_memory.unwrap_or(inputs.psum_in),
            accumulator: self.psum_out(),
        }
    }

    /// Adder output, forwarded to the PE below.
    #[inline]
    pub fn psum_out(&self) -> u32 {
        self.psum_pipe.wrapping_add(self.product_pipe as u32)
    }

    #[inline]
    pub fn pixel_out(&self) -> u8 {
        self.pixel_out
    }

    #[inline]
    pub fn weight(&self) -> u8 {
        self.weight
    }

    #[inline]
    pub fn accumulator(&self) -> u32 {
        self.accumulator
    }

    #[inline]
    pub fn product_pipe(&self) -> u16 {
        self.product_pipe
    }

    #[inline]
    pub fn psum_pipe(&self) -> u32 {
        self.psum_pipe
    }

    /// Zero the partial-sum path. The weight is kept.
    pub fn clear_partial_sums(&mut self) {
        *self = Self {
            weight: self.weight,
            ..Self::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compute(pixel_in: u8, psum_in: u32) -> PeInputs {
        PeInputs { pixel_in, psum_in, ..Default::default() }
    }

    #[test]
    fn test_weight_load_holds_datapath() {
        let pe = ProcessingElement::new()
            .next(&PeInputs { load_weight: Some(4), ..Default::default() }, true)
            .next(&compute(3, 10), true);
        assert_eq!(pe.psum_out(), 22);

        let reloaded = pe.next(&PeInputs { pixel_in: 9, load_weight: Some(7), ..Default::default() }, true);
        assert_eq!(reloaded.weight(), 7);
        assert_eq!(reloaded.pixel_out(), 3);
        assert_eq!(reloaded.psum_out(), 22);
    }

    #[test]
    fn test_pipeline_timing() {
        let pe = ProcessingElement::new().next(&PeInputs { load_weight: Some(4), ..Default::default() }, true);

        // Tick 1: operands registered, adder output visible
        let pe = pe.next(&compute(3, 10), true);
        assert_eq!(pe.product_pipe(), 12);
        assert_eq!(pe.psum_pipe(), 10);
        assert_eq!(pe.pixel_out(), 3);
        assert_eq!(pe.psum_out(), 22);
        assert_eq!(pe.accumulator(), 0);

        // Tick 2: accumulator latches the previous adder output
        let pe = pe.next(&compute(0, 0), true);
        assert_eq!(pe.accumulator(), 22);
        assert_eq!(pe.psum_out(), 0);
    }

    #[test]
    fn test_disabled_holds() {
        let pe = ProcessingElement::new()
            .next(&PeInputs { load_weight: Some(2), ..Default::default() }, true)
            .next(&compute(5, 1), true);
        let held = pe.next(&compute(200, 999), false);
        assert_eq!(held, pe);

        let held = pe.next(&PeInputs { load_weight: Some(9), ..Default::default() }, false);
        assert_eq!(held.weight(), 2);
    }

    #[test]
    fn test_base_from_memory() {
        let pe = ProcessingElement::new()
            .next(&PeInputs { load_weight: Some(1), ..Default::default() }, true)
            .next(&PeInputs { pixel_in: 5, psum_in: 7, psum_from_memory: Some(100), ..Default::default() }, true);
        assert_eq!(pe.psum_out(), 105);
    }

    #[test]
    fn test_saturated_product() {
        let pe = ProcessingElement::new()
            .next(&PeInputs { load_weight: Some(255), ..Default::default() }, true)
            .next(&compute(255, 0), true);
        assert_eq!(pe.product_pipe(), 65025);
    }

    #[test]
    fn test_clear_keeps_weight() {
        let mut pe = ProcessingElement::new()
            .next(&PeInputs { load_weight: Some(3), ..Default::default() }, true)
            .next(&compute(2, 4), true)
            .next(&compute(2, 4), true);
        assert_ne!(pe.accumulator(), 0);

        pe.clear_partial_sums();
        assert_eq!(pe.weight(), 3);
        assert_eq!(pe.accumulator(), 0);
        assert_eq!(pe.psum_out(), 0);
        assert_eq!(pe.pixel_out(), 0);
    }
}
