//! Severity-ordered classification of check outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome of a single check, ordered by importance.
///
/// The `*Level` variants are thresholds, never produced by a check. Policy code
/// compares against them instead of matching on concrete kinds, so a new kind
/// must be inserted into the bucket matching its severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ErrType {
    #[default]
    Success = 0,
    DebugLevel,
    /// Task dropped unexecuted because its deadline passed.
    TtlExpired,
    HlsParser,
    BadRequest,
    WarningLevel,
    Slow,
    VerySlow,
    ErrorLevel,
    CTimeout,
    RTimeout,
    BadLength,
    BodyRead,
    CriticalLevel,
    Refused,
    BadStatus,
    BadUri,
    ListEmpty,
    BadFormat,
    UnkErr,
}

const ALL: [ErrType; 20] = [
    ErrType::Success,
    ErrType::DebugLevel,
    ErrType::TtlExpired,
    ErrType::HlsParser,
    ErrType::BadRequest,
    ErrType::WarningLevel,
    ErrType::Slow,
    ErrType::VerySlow,
    ErrType::ErrorLevel,
    ErrType::CTimeout,
    ErrType::RTimeout,
    ErrType::BadLength,
    ErrType::BodyRead,
    ErrType::CriticalLevel,
    ErrType::Refused,
    ErrType::BadStatus,
    ErrType::BadUri,
    ErrType::ListEmpty,
    ErrType::BadFormat,
    ErrType::UnkErr,
];

impl ErrType {
    /// Numeric code used by the persistent store.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of [`ErrType::code`]. Unknown codes map to `UnkErr`.
    pub fn from_code(code: u8) -> Self {
        ALL.get(code as usize).copied().unwrap_or(ErrType::UnkErr)
    }

    pub fn is_warning(self) -> bool {
        self > ErrType::WarningLevel
    }

    pub fn is_error(self) -> bool {
        self > ErrType::ErrorLevel
    }

    pub fn is_critical(self) -> bool {
        self > ErrType::CriticalLevel
    }

    /// Reporting bucket of this outcome.
    pub fn severity(self) -> Severity {
        if self.is_critical() {
            Severity::Critical
        } else if self.is_error() {
            Severity::Error
        } else if self.is_warning() {
            Severity::Warning
        } else {
            Severity::Info
        }
    }

    /// Human readable description.
    pub fn describe(self) -> &'static str {
        match self {
            ErrType::Success => "success",
            ErrType::HlsParser => "HLS parser",
            ErrType::BadRequest => "invalid request",
            ErrType::Slow => "slow response",
            ErrType::VerySlow => "very slow response",
            ErrType::BadStatus => "bad status",
            ErrType::BadUri => "bad URI",
            ErrType::ListEmpty => "list empty",
            ErrType::BadFormat => "bad format",
            ErrType::TtlExpired => "TTL expired",
            ErrType::RTimeout => "timeout on read",
            ErrType::CTimeout => "connection timeout",
            ErrType::BadLength => "bad content length value",
            ErrType::BodyRead => "response body error",
            ErrType::Refused => "connection refused",
            _ => "unknown",
        }
    }

    fn name(self) -> &'static str {
        match self {
            ErrType::Success => "success",
            ErrType::DebugLevel => "debug",
            ErrType::TtlExpired => "ttlexpired",
            ErrType::HlsParser => "hlsparser",
            ErrType::BadRequest => "badrequest",
            ErrType::WarningLevel => "warning",
            ErrType::Slow => "slow",
            ErrType::VerySlow => "veryslow",
            ErrType::ErrorLevel => "error",
            ErrType::CTimeout => "ctimeout",
            ErrType::RTimeout => "rtimeout",
            ErrType::BadLength => "badlength",
            ErrType::BodyRead => "bodyread",
            ErrType::CriticalLevel => "critical",
            ErrType::Refused => "refused",
            ErrType::BadStatus => "badstatus",
            ErrType::BadUri => "baduri",
            ErrType::ListEmpty => "listempty",
            ErrType::BadFormat => "badformat",
            ErrType::UnkErr => "unkerr",
        }
    }
}

impl fmt::Display for ErrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ErrType {
    type Err = std::convert::Infallible;

    /// Never fails: unrecognized names become `UnkErr`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_ascii_lowercase();
        Ok(ALL
            .iter()
            .copied()
            .find(|e| e.name() == s)
            .unwrap_or(ErrType::UnkErr))
    }
}

/// Severity of a log event or report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "warning" => Severity::Warning,
            "error" => Severity::Error,
            "critical" => Severity::Critical,
            _ => Severity::Info,
        }
    }
}
