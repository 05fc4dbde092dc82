use std::{fmt, str::FromStr};

use clap::ValueEnum;
use thiserror::Error;

/// Source of the transmit timestamps used for Follow-Up messages.
///
/// The mode is fixed for the lifetime of a worker; switching requires a restart.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, ValueEnum)]
pub enum TimestampMode {
    /// Timestamps taken by the NIC (PHC), already on the PTP timescale.
    #[default]
    #[value(name = "hardware")]
    Hardware,
    /// Timestamps taken by the kernel network stack, corrected by the UTC offset.
    #[value(name = "software")]
    Software,
}

/// TimestampModeError is returned when a timestamp mode name cannot be parsed.
#[derive(Error, Debug, PartialEq)]
pub enum TimestampModeError {
    #[error("Unrecognized timestamp type: {0}")]
    Unrecognized(String),
}

impl FromStr for TimestampMode {
    type Err = TimestampModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hardware" | "hw" => Ok(TimestampMode::Hardware),
            "software" | "sw" => Ok(TimestampMode::Software),
            other => Err(TimestampModeError::Unrecognized(other.to_string())),
        }
    }
}

impl fmt::Display for TimestampMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TimestampMode::Hardware => write!(f, "hardware"),
            TimestampMode::Software => write!(f, "software"),
        }
    }
}
