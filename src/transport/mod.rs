//! Timestamped UDP transport used by the send workers.
//!
//! A worker owns two endpoints: the event socket, which carries Sync and has TX
//! timestamping enabled, and the general socket for everything else. The
//! [`Transport`] trait is the seam between the worker logic and the socket
//! syscalls so the worker can run against any implementation.

mod nix;

use std::{fmt, io, net::SocketAddr};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::protocol::{CONTROL_SIZE_BYTES, PAYLOAD_SIZE_BYTES};

pub use self::nix::{enable_hardware_timestamps, enable_software_timestamps, UdpTransport};

/// Room for the link, network and transport headers the kernel loops back with
/// a timestamped packet.
const ECHO_HEADROOM_BYTES: usize = 128;

/// The two logical PTP channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Timing-critical messages (Sync), port 319.
    Event,
    /// Everything else (Follow-Up, Announce, Delay-Response), port 320.
    General,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Channel::Event => write!(f, "event"),
            Channel::General => write!(f, "general"),
        }
    }
}

/// Errors raised by transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Binding to {channel} socket on {addr} failed: {source}")]
    Bind {
        channel: Channel,
        addr: SocketAddr,
        source: io::Error,
    },
    #[error("Failed to enable hardware timestamps on {interface}: {source}")]
    HardwareTimestamps { interface: String, source: io::Error },
    #[error("Failed to enable software timestamps: {0}")]
    SoftwareTimestamps(io::Error),
    #[error("Failed to set DSCP on {channel} socket: {source}")]
    Dscp { channel: Channel, source: io::Error },
    #[error("Sending to {peer} failed: {source}")]
    Send { peer: SocketAddr, source: io::Error },
    #[error("Reading the socket error queue failed: {0}")]
    ErrorQueue(io::Error),
}

/// Reusable buffers for reading TX timestamps from the error queue.
pub struct TimestampBuffers {
    /// Receives the packet the kernel loops back with the timestamp.
    pub echo: Vec<u8>,
    /// Receives the ancillary data holding the timestamp.
    pub control: Vec<u8>,
}

impl TimestampBuffers {
    pub fn new() -> Self {
        TimestampBuffers {
            echo: vec![0u8; PAYLOAD_SIZE_BYTES + ECHO_HEADROOM_BYTES],
            control: vec![0u8; CONTROL_SIZE_BYTES],
        }
    }
}

impl Default for TimestampBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// A TX timestamp report read from the error queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxTimestamp {
    /// When the datagram left the NIC (or the kernel stack).
    pub timestamp: DateTime<Utc>,
    /// Number of looped-back packet bytes written to [`TimestampBuffers::echo`].
    pub echoed: usize,
}

impl TxTimestamp {
    /// Whether this report belongs to the datagram `sent`.
    ///
    /// The kernel loops the packet back with its headers, so the payload is the
    /// tail of the echo. An empty echo carries no payload to compare and is
    /// accepted.
    pub fn matches(&self, buffers: &TimestampBuffers, sent: &[u8]) -> bool {
        self.echoed == 0 || buffers.echo[..self.echoed].ends_with(sent)
    }
}

/// Send and TX-timestamp primitives needed by a send worker.
pub trait Transport {
    /// Sends one datagram on the given channel.
    fn send_to(
        &mut self,
        channel: Channel,
        buf: &[u8],
        peer: SocketAddr,
    ) -> Result<(), TransportError>;

    /// Performs one non-blocking read of the event socket's error queue.
    ///
    /// Returns `Ok(None)` when no timestamp is available yet.
    fn recv_tx_timestamp(
        &mut self,
        buffers: &mut TimestampBuffers,
    ) -> Result<Option<TxTimestamp>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(echoed: usize) -> TxTimestamp {
        TxTimestamp {
            timestamp: DateTime::<Utc>::from_timestamp(1, 0).unwrap(),
            echoed,
        }
    }

    #[test]
    fn test_report_matches_payload_at_tail() {
        let mut buffers = TimestampBuffers::new();
        let sent = [0xAAu8, 0xBB, 0xCC];
        buffers.echo[..4].copy_from_slice(&[0x45, 0xAA, 0xBB, 0xCC]);
        assert!(report(4).matches(&buffers, &sent));
    }

    #[test]
    fn test_report_for_other_packet_does_not_match() {
        let mut buffers = TimestampBuffers::new();
        buffers.echo[..3].copy_from_slice(&[0x01, 0x02, 0x03]);
        assert!(!report(3).matches(&buffers, &[0xAA, 0xBB]));
    }

    #[test]
    fn test_empty_echo_is_accepted() {
        let buffers = TimestampBuffers::new();
        assert!(report(0).matches(&buffers, &[0xAA]));
    }
}
