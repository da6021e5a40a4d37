use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PilapseError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Validation(#[from] ConfigValidationError),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Image evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    LogSchema(#[from] LogSchemaError),

    #[error("Insufficient disk space at {path}: {free_mb}MB free, {required_mb}MB required")]
    DiskSpace {
        path: PathBuf,
        free_mb: u64,
        required_mb: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("System error: {message}")]
    System { message: String },
}

impl PilapseError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Errors that make forward progress impossible. Everything else is
    /// handled per-cycle by the scheduler.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Validation(_) | Self::DiskSpace { .. }
        )
    }
}

/// A configuration value rejected by the validation table. The in-memory
/// configuration is left unchanged when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid value for {field}: {reason}")]
pub struct ConfigValidationError {
    pub field: String,
    pub reason: String,
}

impl ConfigValidationError {
    pub fn new<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("failed to open camera device {device}: {details}")]
    DeviceOpen { device: u32, details: String },

    #[error("camera configuration failed: {details}")]
    Configuration { details: String },

    #[error("capture failed: {details}")]
    CaptureFailed { details: String },

    #[error("capture timed out after {timeout:?}")]
    CaptureTimeout { timeout: Duration },

    #[error("{operation} is not valid while the camera is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("camera backend not available on this platform")]
    NotAvailable,
}

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("could not read image {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not decode image {path}: {details}")]
    Decode { path: PathBuf, details: String },
}

/// A CSV write whose field set does not exactly match the pinned header.
/// These are fatal for the offending write only; rows already in the file
/// are never touched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogSchemaError {
    #[error("capture metadata is missing required columns: {0:?}")]
    MissingColumns(Vec<String>),

    #[error("capture metadata contains unexpected columns: {0:?}")]
    UnexpectedColumns(Vec<String>),

    #[error("existing CSV header does not match the pinned schema: expected {expected:?}, found {found:?}")]
    HeaderMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
}

pub type Result<T> = std::result::Result<T, PilapseError>;
