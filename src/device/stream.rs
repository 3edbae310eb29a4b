//! Valid/ready byte streams between the accelerator and its DRAM collaborator.
//!
//! ```text
//!   host  --rx_data/rx_valid-->  accelerator      (rx_ready back)
//!   host  <--tx_data/tx_valid--  accelerator      (tx_ready back)
//! ```
//!
//! A byte transfers only in a tick where valid and ready are both high.
//! Once a producer raises valid it must hold valid and its data unchanged
//! until it sees ready. [`HandshakeMonitor`] enforces that on one port.

use crate::error::ProtocolViolation;

/// Producer side of one stream for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamBeat {
    pub valid: bool,
    pub data: u8,
}

impl StreamBeat {
    /// A valid beat carrying `data`.
    #[inline]
    pub fn valid(data: u8) -> Self {
        Self { valid: true, data }
    }

    /// No data offered.
    #[inline]
    pub fn idle() -> Self {
        Self::default()
    }

    /// Beat for an optional byte.
    #[inline]
    pub fn from_option(data: Option<u8>) -> Self {
        data.map_or_else(Self::idle, Self::valid)
    }
}

/// Handshake checker and counters for one stream port.
#[derive(Debug, Clone)]
pub struct HandshakeMonitor {
    port: &'static str,
    /// Byte offered without ready last tick.
    held: Option<u8>,
    transfers: u64,
    stalls: u64,
}

impl HandshakeMonitor {
    pub fn new(port: &'static str) -> Self {
        Self {
            port,
            held: None,
            transfers: 0,
            stalls: 0,
        }
    }

    /// Observe one tick. Returns the transferred byte, if any.
    pub fn observe(&mut self, beat: StreamBeat, ready: bool) -> Result<Option<u8>, ProtocolViolation> {
        if let Some(held) = self.held {
            if !beat.valid {
                return Err(ProtocolViolation::ValidDropped { port: self.port });
            }
            if beat.data != held {
                return Err(ProtocolViolation::UnstableData {
                    port: self.port,
                    held,
                    presented: beat.data,
                });
            }
        }

        if !beat.valid {
            return Ok(None);
        }
        if ready {
            self.held = None;
            self.transfers += 1;
            Ok(Some(beat.data))
        } else {
            self.held = Some(beat.data);
            self.stalls += 1;
            Ok(None)
        }
    }

    /// Completed transfers.
    #[inline]
    pub fn transfers(&self) -> u64 {
        self.transfers
    }

    /// Ticks with valid high and ready low.
    #[inline]
    pub fn stalls(&self) -> u64 {
        self.stalls
    }

    /// A byte is waiting for ready.
    #[inline]
    pub fn is_holding(&self) -> bool {
        self.held.is_some()
    }

    #[inline]
    pub fn port(&self) -> &'static str {
        self.port
    }

    pub fn reset(&mut self) {
        self.held = None;
        self.transfers = 0;
        self.stalls = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_needs_both() {
        let mut mon = HandshakeMonitor::new("rx");
        assert_eq!(mon.observe(StreamBeat::idle(), true), Ok(None));
        assert_eq!(mon.observe(StreamBeat::valid(1), true), Ok(Some(1)));
        assert_eq!(mon.transfers(), 1);
    }

    #[test]
    fn test_stall_then_transfer() {
        let mut mon = HandshakeMonitor::new("tx");
        assert_eq!(mon.observe(StreamBeat::valid(0xAA), false), Ok(None));
        assert!(mon.is_holding());
        assert_eq!(mon.observe(StreamBeat::valid(0xAA), false), Ok(None));
        assert_eq!(mon.observe(StreamBeat::valid(0xAA), true), Ok(Some(0xAA)));
        assert!(!mon.is_holding());
        assert_eq!((mon.transfers(), mon.stalls()), (1, 2));

        // Free to change after the transfer
        assert_eq!(mon.observe(StreamBeat::valid(0xBB), true), Ok(Some(0xBB)));
    }

    #[test]
    fn test_data_change_while_held() {
        let mut mon = HandshakeMonitor::new("rx");
        mon.observe(StreamBeat::valid(0x12), false).unwrap();
        assert_eq!(
            mon.observe(StreamBeat::valid(0x34), true),
            Err(ProtocolViolation::UnstableData { port: "rx", held: 0x12, presented: 0x34 })
        );
    }

    #[test]
    fn test_valid_dropped_while_held() {
        let mut mon = HandshakeMonitor::new("rx");
        mon.observe(StreamBeat::valid(0x12), false).unwrap();
        assert_eq!(
            mon.observe(StreamBeat::idle(), true),
            Err(ProtocolViolation::ValidDropped { port: "rx" })
        );
    }

    #[test]
    fn test_from_option() {
        assert_eq!(StreamBeat::from_option(Some(3)), StreamBeat::valid(3));
        assert_eq!(StreamBeat::from_option(None), StreamBeat::idle());
    }
}
