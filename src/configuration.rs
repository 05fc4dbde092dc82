use std::{net::IpAddr, time::Duration};

pub use clap::Parser;
use thiserror::Error;

use crate::{interface, stats::OutputFormat, timestamp_mode::TimestampMode};

/// Errors detected while validating the configuration.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigurationError {
    #[error("At least one send worker is required")]
    NoWorkers,
    #[error("Queue size must be greater than zero")]
    ZeroQueueSize,
    #[error("TX timestamp attempts must be greater than zero")]
    ZeroTimestampAttempts,
    #[error("DSCP value {0} out of range (0-63)")]
    InvalidDscp(u8),
    #[error("{0} interval must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("Interface {0} not found (required for hardware timestamping)")]
    UnknownInterface(String),
}

/// Runtime configuration of the grandmaster transmit path.
///
/// Everything here is read-only once the workers are started. In particular the
/// timestamp type cannot change without restarting the workers.
#[derive(Parser, Debug, Clone)]
#[command(author = "Piotr Olszewski", version, about, long_about = None)]
pub struct Configuration {
    /// IP address to bind the event and general sockets to
    #[arg(long, default_value = "::")]
    pub ip: IpAddr,
    /// Network interface used for hardware timestamping and clock identity
    #[arg(short, long, default_value = "eth0")]
    pub interface: String,
    /// Source of TX timestamps
    #[arg(short = 't', long, value_enum, default_value_t = TimestampMode::Hardware)]
    pub timestamp_type: TimestampMode,
    /// UTC offset: added to software TX timestamps and advertised in Announce (e.g. 37s, 250ms)
    #[arg(long, default_value = "37s", value_parser = parse_offset, allow_hyphen_values = true)]
    pub utc_offset: chrono::Duration,
    /// Number of send workers
    #[arg(short, long, default_value_t = 10)]
    pub workers: usize,
    /// Capacity of each worker's job queue
    #[arg(long, default_value_t = 100)]
    pub queue_size: usize,
    /// Maximum number of error queue reads when fetching a TX timestamp
    #[arg(long, default_value_t = 100)]
    pub txts_attempts: u32,
    /// Delay between TX timestamp reads that found nothing, in microseconds
    #[arg(long, default_value_t = 20)]
    pub txts_retry_delay_us: u64,
    /// DSCP value set on outgoing packets
    #[arg(long)]
    pub dscp: Option<u8>,
    /// PTP domain number
    #[arg(long, default_value_t = 0)]
    pub domain: u8,
    /// Announced grandmaster clock class
    #[arg(long, default_value_t = 6)]
    pub clock_class: u8,
    /// Announced grandmaster clock accuracy
    #[arg(long, default_value_t = 0x21)]
    pub clock_accuracy: u8,
    /// Announced offset scaled log variance
    #[arg(long, default_value_t = 0x4e5d)]
    pub clock_variance: u16,
    /// Announced grandmaster priority 1
    #[arg(long, default_value_t = 128)]
    pub priority1: u8,
    /// Announced grandmaster priority 2
    #[arg(long, default_value_t = 128)]
    pub priority2: u8,
    /// Announced time source (0x20 = GNSS)
    #[arg(long, default_value_t = 0x20)]
    pub time_source: u8,
    /// Unicast client to serve (repeatable)
    #[arg(short, long = "client")]
    pub clients: Vec<IpAddr>,
    /// Sync/Follow-Up interval per client in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub sync_interval_ms: u64,
    /// Announce interval per client in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub announce_interval_ms: u64,
    /// Duration of each granted subscription in seconds
    #[arg(long, default_value_t = 300)]
    pub subscription_secs: u64,
    /// Statistics report interval in seconds (0 disables)
    #[arg(long, default_value_t = 10)]
    pub report_interval: u64,
    /// Output format for statistics reports
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output_format: OutputFormat,
    /// Enable Prometheus metrics
    #[cfg(feature = "metrics")]
    #[arg(long)]
    pub metrics: bool,
    /// Address of the Prometheus metrics endpoint
    #[cfg(feature = "metrics")]
    #[arg(long, default_value = "127.0.0.1:9090")]
    pub metrics_addr: std::net::SocketAddr,
}

impl Configuration {
    /// Checks that the configuration can be used to start the workers.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.workers == 0 {
            return Err(ConfigurationError::NoWorkers);
        }
        if self.queue_size == 0 {
            return Err(ConfigurationError::ZeroQueueSize);
        }
        if self.txts_attempts == 0 {
            return Err(ConfigurationError::ZeroTimestampAttempts);
        }
        if let Some(dscp) = self.dscp {
            if dscp > 63 {
                return Err(ConfigurationError::InvalidDscp(dscp));
            }
        }
        if self.sync_interval_ms == 0 {
            return Err(ConfigurationError::ZeroInterval("Sync"));
        }
        if self.announce_interval_ms == 0 {
            return Err(ConfigurationError::ZeroInterval("Announce"));
        }
        if self.subscription_secs == 0 {
            return Err(ConfigurationError::ZeroInterval("Subscription"));
        }
        if self.timestamp_type == TimestampMode::Hardware
            && interface::find_interface(&self.interface).is_none()
        {
            return Err(ConfigurationError::UnknownInterface(
                self.interface.clone(),
            ));
        }
        Ok(())
    }

    /// Sleep between two error queue reads that returned nothing.
    pub fn txts_retry_delay(&self) -> Duration {
        Duration::from_micros(self.txts_retry_delay_us)
    }

    /// UTC offset in whole seconds, as advertised in Announce.
    pub fn announce_utc_offset(&self) -> i16 {
        self.utc_offset
            .num_seconds()
            .clamp(i16::MIN as i64, i16::MAX as i64) as i16
    }
}

/// Parses a signed offset with a unit suffix: `ns`, `us`, `ms` or `s`.
pub fn parse_offset(s: &str) -> Result<chrono::Duration, String> {
    let s = s.trim();
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let split = body
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(body.len());
    let (digits, unit) = body.split_at(split);
    let value: i64 = digits
        .parse()
        .map_err(|_| format!("invalid offset '{}'", s))?;

    let offset = match unit {
        "ns" => Some(chrono::Duration::nanoseconds(value)),
        "us" => Some(chrono::Duration::microseconds(value)),
        "ms" => chrono::Duration::try_milliseconds(value),
        "s" => chrono::Duration::try_seconds(value),
        "" => return Err(format!("missing unit in offset '{}' (ns, us, ms, s)", s)),
        other => return Err(format!("unknown unit '{}' in offset '{}'", other, s)),
    }
    .ok_or_else(|| format!("offset '{}' out of range", s))?;

    Ok(if negative { -offset } else { offset })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn software_conf(extra: &[&str]) -> Configuration {
        let mut args = vec!["ptp4u-tx", "--timestamp-type", "software"];
        args.extend_from_slice(extra);
        Configuration::parse_from(args)
    }

    #[test]
    fn test_defaults_validate_in_software_mode() {
        let conf = software_conf(&[]);
        assert_eq!(conf.validate(), Ok(()));
        assert_eq!(conf.utc_offset, chrono::Duration::seconds(37));
        assert_eq!(conf.announce_utc_offset(), 37);
        assert_eq!(conf.txts_retry_delay(), Duration::from_micros(20));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let conf = software_conf(&["--workers", "0"]);
        assert_eq!(conf.validate(), Err(ConfigurationError::NoWorkers));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let conf = software_conf(&["--txts-attempts", "0"]);
        assert_eq!(
            conf.validate(),
            Err(ConfigurationError::ZeroTimestampAttempts)
        );
    }

    #[test]
    fn test_validate_rejects_large_dscp() {
        let conf = software_conf(&["--dscp", "64"]);
        assert_eq!(conf.validate(), Err(ConfigurationError::InvalidDscp(64)));
    }

    #[test]
    fn test_hardware_mode_requires_existing_interface() {
        let conf = Configuration::parse_from([
            "ptp4u-tx",
            "--timestamp-type",
            "hardware",
            "--interface",
            "definitely-not-a-nic0",
        ]);
        assert_eq!(
            conf.validate(),
            Err(ConfigurationError::UnknownInterface(
                "definitely-not-a-nic0".to_string()
            ))
        );
    }

    #[test]
    fn test_unknown_timestamp_type_is_rejected() {
        let result = Configuration::try_parse_from(["ptp4u-tx", "--timestamp-type", "ptp"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_offset_units() {
        assert_eq!(parse_offset("37s"), Ok(chrono::Duration::seconds(37)));
        assert_eq!(
            parse_offset("37ms"),
            Ok(chrono::Duration::milliseconds(37))
        );
        assert_eq!(
            parse_offset("-1500ns"),
            Ok(chrono::Duration::nanoseconds(-1500))
        );
        assert_eq!(parse_offset("250us"), Ok(chrono::Duration::microseconds(250)));
    }

    #[test]
    fn test_parse_offset_errors() {
        assert!(parse_offset("37").is_err());
        assert!(parse_offset("37h").is_err());
        assert!(parse_offset("s").is_err());
    }

    #[test]
    fn test_negative_offset_from_command_line() {
        let conf = software_conf(&["--utc-offset", "-2ms"]);
        assert_eq!(conf.utc_offset, chrono::Duration::milliseconds(-2));
    }
}
