//! Status codes shared between the daemon, its controllers, and remote clients.
//!
//! Every remote command resolves to a [`CommandStatus`]. The numeric codes are
//! part of the wire protocol: the CLI exits with the code of a failed command
//! so that shell scripts can branch on specific failures.

use serde::{Serialize, Serializer};
use std::fmt;

/// Result of a remote operations command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    /// Command completed successfully.
    Succeeded,
    /// Command failed for an unspecified reason.
    Failed,
    /// Another command already holds the command lock.
    Blocked,
    /// The target controller is in an error state that must be acknowledged.
    InErrorState,
    /// The caller's source address is not in the control whitelist.
    InvalidControlIP,
    /// The submitted schedule failed validation.
    InvalidSchedule,
    /// The dome is not under automatic control.
    DomeNotAutomatic,
    /// The dome must be closed before this command is accepted.
    DomeNotClosed,
    /// The telescope is not under automatic control.
    TelescopeNotAutomatic,
    /// The environment is not safe for opening.
    EnvironmentNotSafe,
}

/// Code reported by clients when the daemon cannot be reached.
///
/// This value never originates from the daemon itself.
pub const DAEMON_UNREACHABLE: i32 = -101;

impl CommandStatus {
    /// Returns the numeric wire code for this status.
    pub fn code(self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed => 1,
            Self::Blocked => 2,
            Self::InErrorState => 3,
            Self::InvalidControlIP => 10,
            Self::InvalidSchedule => 21,
            Self::DomeNotAutomatic => 22,
            Self::DomeNotClosed => 23,
            Self::TelescopeNotAutomatic => 24,
            Self::EnvironmentNotSafe => 25,
        }
    }

    /// Returns a human-readable message suitable for client display.
    pub fn message(self) -> &'static str {
        match self {
            Self::Succeeded => "command succeeded",
            Self::Failed => "error: command failed",
            Self::Blocked => "error: another command is already running",
            Self::InErrorState => "error: error state must first be acknowledged",
            Self::InvalidControlIP => "error: command not accepted from this IP",
            Self::InvalidSchedule => "error: invalid schedule definition",
            Self::DomeNotAutomatic => "error: dome is not in automatic mode",
            Self::DomeNotClosed => "error: dome is not closed",
            Self::TelescopeNotAutomatic => "error: telescope is not in automatic mode",
            Self::EnvironmentNotSafe => "error: environment is not safe",
        }
    }

    /// Returns the message for an arbitrary wire code, including codes
    /// generated client-side.
    pub fn describe(code: i32) -> String {
        if code == DAEMON_UNREACHABLE {
            return "error: unable to communicate with operations daemon".to_string();
        }
        match Self::from_code(code) {
            Some(status) => status.message().to_string(),
            None => format!("error: unknown error code {code}"),
        }
    }

    /// Parses a wire code back into a status, if it is one the daemon emits.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Succeeded,
            1 => Self::Failed,
            2 => Self::Blocked,
            3 => Self::InErrorState,
            10 => Self::InvalidControlIP,
            21 => Self::InvalidSchedule,
            22 => Self::DomeNotAutomatic,
            23 => Self::DomeNotClosed,
            24 => Self::TelescopeNotAutomatic,
            25 => Self::EnvironmentNotSafe,
            _ => return None,
        })
    }

    /// Returns true if the command completed successfully.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Control mode of a dome or telescope controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OperationsMode {
    /// Operator has direct control; the daemon does not issue commands.
    #[default]
    Manual,
    /// The daemon drives the hardware from the schedule.
    Automatic,
    /// A backend fault latched; requires operator acknowledgement.
    Error,
    /// No backend is configured for this controller.
    Offline,
}

impl OperationsMode {
    /// Returns the uppercase label used in status payloads and CLI output.
    pub fn label(self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Automatic => "AUTOMATIC",
            Self::Error => "ERROR",
            Self::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for OperationsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl Serialize for OperationsMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// Aggregated dome shutter status reported by the dome backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DomeStatus {
    /// All shutters closed.
    #[default]
    Closed,
    /// All shutters open.
    Open,
    /// Shutters in transit.
    Moving,
    /// The backend's autonomous heartbeat tripped; sticky until cleared.
    Timeout,
    /// The backend reported a hardware fault; sticky until cleared.
    HardwareError,
}

impl DomeStatus {
    /// Returns the uppercase label used in status payloads and CLI output.
    pub fn label(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::Moving => "MOVING",
            Self::Timeout => "TIMEOUT",
            Self::HardwareError => "HARDWARE ERROR",
        }
    }

    /// Returns true for the sticky fault states that require an operator to
    /// switch the dome back to automatic.
    pub fn is_fault(self) -> bool {
        matches!(self, Self::Timeout | Self::HardwareError)
    }
}

impl fmt::Display for DomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl Serialize for DomeStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}
