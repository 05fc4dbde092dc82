//! ptp4u-tx - transmit core of a unicast PTP (IEEE 1588-2008) grandmaster.
//!
//! A pool of send workers serves subscribed clients: two-step Sync with the
//! transmit time carried in a Follow-Up, Announce, and Delay-Response. Transmit
//! timestamps come from the NIC (hardware) or the kernel stack (software) through
//! Linux `SO_TIMESTAMPING`.
//!
//! # Usage
//!
//! Serve two unicast clients with hardware timestamps from `eth0`:
//! ```bash
//! ptp4u-tx -i eth0 --client 192.168.1.10 --client 192.168.1.11
//! ```
//!
//! Software timestamps, shifted by the TAI-UTC offset:
//! ```bash
//! ptp4u-tx -t software --utc-offset 37s --client 192.168.1.10
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("ptp4u-tx relies on Linux SO_TIMESTAMPING and only builds on Linux");

/// Subscribed clients and message builders.
pub mod client;
/// Command-line configuration and validation.
pub mod configuration;
/// Interface lookup and clock identity.
pub mod interface;
/// PTPv2 message structures and serialization.
pub mod protocol;
/// Worker pool and subscription scheduling.
pub mod server;
/// Transmit counters and per-worker gauges.
pub mod stats;
/// Hardware and software timestamping modes.
pub mod timestamp_mode;
/// Timestamped UDP transport.
pub mod transport;
/// The send worker.
pub mod worker;

/// Prometheus metrics support (requires "metrics" feature).
#[cfg(feature = "metrics")]
pub mod metrics;
