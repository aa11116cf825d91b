use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! str_enum {
    ($kind:literal, $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError { kind: $kind, value: other.to_string() }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Orphaned,
    Canceled,
}

str_enum!("task status", TaskStatus {
    Pending => "PENDING",
    Submitted => "SUBMITTED",
    Running => "RUNNING",
    Succeeded => "SUCCEEDED",
    Failed => "FAILED",
    Orphaned => "ORPHANED",
    Canceled => "CANCELED",
});

impl TaskStatus {
    pub const UNFINISHED: [TaskStatus; 3] = [TaskStatus::Pending, TaskStatus::Submitted, TaskStatus::Running];

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled)
    }

    /// Pending, submitted or running: someone is (or should be) working on it.
    pub fn is_in_flight(&self) -> bool {
        Self::UNFINISHED.contains(self)
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self, TaskStatus::Orphaned | TaskStatus::Failed)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

str_enum!("item status", ItemStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Api,
    Io,
    Validation,
    Unknown,
    HeartbeatTimeout,
}

str_enum!("error category", ErrorCategory {
    Network => "NETWORK",
    Timeout => "TIMEOUT",
    Api => "API",
    Io => "IO",
    Validation => "VALIDATION",
    Unknown => "UNKNOWN",
    HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
});

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkError,
    ConnectionError,
    Timeout,
    AuthenticationError,
    PermissionDenied,
    RateLimit,
    ServerError,
    InvalidRequest,
    ApiError,
    QuotaExceeded,
    TemporaryFailure,
    FileNotFound,
    IoError,
    ValidationError,
    UnknownError,
    HeartbeatTimeout,
    NoFilesFound,
}

str_enum!("error code", ErrorCode {
    NetworkError => "NETWORK_ERROR",
    ConnectionError => "CONNECTION_ERROR",
    Timeout => "TIMEOUT",
    AuthenticationError => "AUTHENTICATION_ERROR",
    PermissionDenied => "PERMISSION_DENIED",
    RateLimit => "RATE_LIMIT",
    ServerError => "SERVER_ERROR",
    InvalidRequest => "INVALID_REQUEST",
    ApiError => "API_ERROR",
    QuotaExceeded => "QUOTA_EXCEEDED",
    TemporaryFailure => "TEMPORARY_FAILURE",
    FileNotFound => "FILE_NOT_FOUND",
    IoError => "IO_ERROR",
    ValidationError => "VALIDATION_ERROR",
    UnknownError => "UNKNOWN_ERROR",
    HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
    NoFilesFound => "NO_FILES_FOUND",
});
