use std::{io, time::Duration};

use thiserror::Error;

/// Every failure surfaced by the device layer.
///
/// `HumanTakeover` is the fatal class: it must reach the top-level caller
/// untouched. Everything else is classified by [`FailureKind::classify`]
/// and may be recovered from inside the retry executor.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("human takeover required: {0}")]
    HumanTakeover(String),
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error("adb error: {0}")]
    Adb(String),
    #[error("package not installed: {0}")]
    PackageNotInstalled(String),
    #[error("adb timeout: {0}")]
    Timeout(String),
    #[error("reverse server accept timed out after {0:?}")]
    AcceptTimeout(Duration),
    #[error("adb not found (set adb_binary, ADBKEEP_ADB_PATH or ANDROID_SDK_ROOT)")]
    AdbNotFound,
    #[error("adb command failed with exit {status}: {detail}")]
    Exit { status: i32, detail: String },
    #[error("invalid config: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DeviceError {
    pub fn takeover(reason: impl Into<String>) -> Self {
        DeviceError::HumanTakeover(reason.into())
    }

    /// True for errors that belong to the human-takeover class.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeviceError::HumanTakeover(_) | DeviceError::AcceptTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    ConnectionReset,
    RecoverableProtocolError,
    FatalProtocolError,
    PackageMissing,
    Unknown,
}

/// Substrings of bridge errors that another attempt can fix. A lost
/// port race (`cannot bind`) is re-probed on the next attempt.
const RECOVERABLE_ADB_MESSAGES: &[&str] = &[
    "not found",
    "timeout",
    "closed",
    "device offline",
    "cannot bind",
];

impl FailureKind {
    pub fn classify(err: &DeviceError) -> Self {
        match err {
            DeviceError::HumanTakeover(_) | DeviceError::AcceptTimeout(_) => {
                FailureKind::FatalProtocolError
            }
            DeviceError::ConnectionReset(_) => FailureKind::ConnectionReset,
            DeviceError::Io(io_err) => match io_err.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => FailureKind::ConnectionReset,
                _ => FailureKind::Unknown,
            },
            DeviceError::Adb(msg) => {
                if is_recoverable_adb_message(msg) {
                    FailureKind::RecoverableProtocolError
                } else {
                    FailureKind::FatalProtocolError
                }
            }
            DeviceError::Timeout(_) => FailureKind::RecoverableProtocolError,
            DeviceError::PackageNotInstalled(_) => FailureKind::PackageMissing,
            DeviceError::AdbNotFound | DeviceError::Exit { .. } | DeviceError::Config(_) => {
                FailureKind::Unknown
            }
        }
    }
}

fn is_recoverable_adb_message(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    RECOVERABLE_ADB_MESSAGES
        .iter()
        .any(|needle| lower.contains(needle))
}
