use crate::config::DeviceValidationError;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Failed to build HTTP client: {0}")]
    HttpClientBuild(String),

    #[error("Invalid device record: {}", format_issues(.0))]
    InvalidDevice(Vec<DeviceValidationError>),

    #[error("Device index out of range: {index} (have {count} devices)")]
    DeviceIndexOutOfRange { index: usize, count: usize },

    #[error("Another geomap-bridge instance is already running")]
    AlreadyRunning,

    #[error("Control protocol error: {0}")]
    ControlProtocol(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

fn format_issues(issues: &[DeviceValidationError]) -> String {
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, BridgeError>;
