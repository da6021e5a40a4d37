pub mod camera;
pub mod config;
pub mod error;
pub mod metrics_log;
pub mod quality;
pub mod recovery;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod timing;

pub use camera::{CameraDevice, CameraManager, CameraState, CaptureOutcome, MockCamera, RawFrame};
pub use config::{CameraConfig, LoggingConfig, PilapseConfig, TimelapseConfig};
pub use error::{
    CameraError, ConfigValidationError, EvaluationError, LogSchemaError, PilapseError, Result,
};
pub use metrics_log::{
    CaptureLogStats, CaptureRecord, MetricsLogger, ShotType, TimingSnapshot, CSV_COLUMNS,
};
pub use quality::{
    brightness_warnings, calculate_brightness, calculate_sharpness, evaluate_image_quality,
    QualityMetrics,
};
pub use recovery::{FailureCounter, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerOutcome, SchedulerState};
pub use status::{QualityStatistics, StatusMonitor, TimingReadout, QUALITY_HISTORY_LIMIT};
pub use timing::{DriftInfo, TimingController, TimingStats};
