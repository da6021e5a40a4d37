use crate::error::ConfigValidationError;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Resolutions the HQ camera sensor (and its common scaled modes) can
/// deliver. Anything else is rejected before it reaches the driver.
pub const SUPPORTED_RESOLUTIONS: [(u32, u32); 6] = [
    (4056, 3040),
    (2028, 1520),
    (2028, 1080),
    (1920, 1080),
    (1332, 990),
    (640, 480),
];

pub const VALID_ISO_VALUES: [u32; 6] = [100, 200, 400, 800, 1600, 3200];

pub const VALID_EXPOSURE_MODES: [&str; 11] = [
    "auto",
    "night",
    "backlight",
    "spotlight",
    "sports",
    "snow",
    "beach",
    "verylong",
    "fixedfps",
    "antishake",
    "fireworks",
];

pub const VALID_AWB_MODES: [&str; 9] = [
    "auto",
    "sunlight",
    "cloudy",
    "shade",
    "tungsten",
    "fluorescent",
    "incandescent",
    "flash",
    "horizon",
];

pub const VALID_IMAGE_FORMATS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

pub const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PilapseConfig {
    pub camera: CameraConfig,
    pub timelapse: TimelapseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Camera device index (e.g., 0 for /dev/video0)
    #[serde(default = "default_device_index")]
    pub device_index: u32,

    /// Still resolution (width, height); must be a supported sensor mode
    #[serde(default = "default_resolution")]
    pub resolution: (u32, u32),

    /// JPEG quality (1-100)
    #[serde(default = "default_quality")]
    pub quality: u8,

    /// Auto-exposure mode
    #[serde(default = "default_exposure_mode")]
    pub exposure_mode: String,

    /// Sensor ISO (maps to analogue gain)
    #[serde(default = "default_iso")]
    pub iso: u32,

    /// Fixed shutter speed in microseconds (0 = auto)
    #[serde(default)]
    pub shutter_speed_us: u32,

    /// Auto-white-balance mode
    #[serde(default = "default_awb_mode")]
    pub awb_mode: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimelapseConfig {
    /// Target interval between captures in seconds
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u32,

    /// Run duration in hours (0 = indefinite)
    #[serde(default = "default_duration_hours")]
    pub duration_hours: f64,

    /// Directory for captured images
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Prefix for generated filenames
    #[serde(default = "default_filename_prefix")]
    pub filename_prefix: String,

    /// Image format (jpg, jpeg, png, bmp)
    #[serde(default = "default_image_format")]
    pub image_format: String,

    /// Embed a millisecond timestamp in filenames
    #[serde(default = "default_true")]
    pub add_timestamp: bool,

    /// Group captures into YYYY-MM-DD subdirectories
    #[serde(default = "default_true")]
    pub create_daily_dirs: bool,

    /// Write a JSON sidecar next to each capture's metadata
    #[serde(default)]
    pub save_sidecar_json: bool,

    /// Consecutive failed capture cycles before the run is aborted
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Directory for the rolling log file and the CSV metadata log
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// CSV metadata log filename within log_dir
    #[serde(default = "default_csv_filename")]
    pub csv_filename: String,
}

impl PilapseConfig {
    /// Load configuration from the default file location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("pilapse.toml")
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file falls back to built-in defaults; a file that exists
    /// but fails to parse is an error. Environment variables with a
    /// `PILAPSE__` prefix override both.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("camera.device_index", default_device_index() as i64)?
            .set_default(
                "camera.resolution",
                vec![default_resolution().0 as i64, default_resolution().1 as i64],
            )?
            .set_default("camera.quality", default_quality() as i64)?
            .set_default("camera.exposure_mode", default_exposure_mode())?
            .set_default("camera.iso", default_iso() as i64)?
            .set_default("camera.shutter_speed_us", 0i64)?
            .set_default("camera.awb_mode", default_awb_mode())?
            .set_default(
                "timelapse.interval_seconds",
                default_interval_seconds() as i64,
            )?
            .set_default("timelapse.duration_hours", default_duration_hours())?
            .set_default("timelapse.output_dir", default_output_dir())?
            .set_default("timelapse.filename_prefix", default_filename_prefix())?
            .set_default("timelapse.image_format", default_image_format())?
            .set_default("timelapse.add_timestamp", true)?
            .set_default("timelapse.create_daily_dirs", true)?
            .set_default("timelapse.save_sidecar_json", false)?
            .set_default(
                "timelapse.max_consecutive_failures",
                default_max_consecutive_failures() as i64,
            )?
            .set_default("logging.log_dir", default_log_dir())?
            .set_default("logging.log_level", default_log_level())?
            .set_default("logging.csv_filename", default_csv_filename())?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("PILAPSE").separator("__"))
            .build()?;

        let config: PilapseConfig = settings.try_deserialize()?;

        info!("Configuration loaded");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Run the full validation table and return every violation.
    pub fn get_validation_errors(&self) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();

        if !SUPPORTED_RESOLUTIONS.contains(&self.camera.resolution) {
            errors.push(resolution_error(self.camera.resolution));
        }
        if self.camera.quality < 1 {
            errors.push(ConfigValidationError::new(
                "camera.quality",
                "must be between 1 and 100",
            ));
        }
        if !VALID_ISO_VALUES.contains(&self.camera.iso) {
            errors.push(iso_error(self.camera.iso));
        }
        if !VALID_EXPOSURE_MODES.contains(&self.camera.exposure_mode.as_str()) {
            errors.push(exposure_mode_error(&self.camera.exposure_mode));
        }
        if !VALID_AWB_MODES.contains(&self.camera.awb_mode.as_str()) {
            errors.push(ConfigValidationError::new(
                "camera.awb_mode",
                format!(
                    "\"{}\" is not one of {:?}",
                    self.camera.awb_mode, VALID_AWB_MODES
                ),
            ));
        }

        if self.timelapse.interval_seconds < 1 {
            errors.push(ConfigValidationError::new(
                "timelapse.interval_seconds",
                "must be at least 1",
            ));
        }
        if !self.timelapse.duration_hours.is_finite() || self.timelapse.duration_hours < 0.0 {
            errors.push(ConfigValidationError::new(
                "timelapse.duration_hours",
                "must be a non-negative number (0 = indefinite)",
            ));
        }
        if self.timelapse.output_dir.trim().is_empty() {
            errors.push(ConfigValidationError::new(
                "timelapse.output_dir",
                "must be a non-empty path",
            ));
        }
        if self.timelapse.filename_prefix.trim().is_empty() {
            errors.push(ConfigValidationError::new(
                "timelapse.filename_prefix",
                "must be a non-empty string",
            ));
        }
        if !VALID_IMAGE_FORMATS.contains(&self.timelapse.image_format.to_lowercase().as_str()) {
            errors.push(ConfigValidationError::new(
                "timelapse.image_format",
                format!(
                    "\"{}\" is not one of {:?}",
                    self.timelapse.image_format, VALID_IMAGE_FORMATS
                ),
            ));
        }
        if self.timelapse.max_consecutive_failures < 1 {
            errors.push(ConfigValidationError::new(
                "timelapse.max_consecutive_failures",
                "must be at least 1",
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.log_level.to_lowercase().as_str()) {
            errors.push(ConfigValidationError::new(
                "logging.log_level",
                format!(
                    "\"{}\" is not one of {:?}",
                    self.logging.log_level, VALID_LOG_LEVELS
                ),
            ));
        }
        if self.logging.log_dir.trim().is_empty() {
            errors.push(ConfigValidationError::new(
                "logging.log_dir",
                "must be a non-empty path",
            ));
        }
        if self.logging.csv_filename.trim().is_empty() {
            errors.push(ConfigValidationError::new(
                "logging.csv_filename",
                "must be a non-empty filename",
            ));
        }

        errors
    }

    /// Validate the whole configuration, returning the first violation.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        match self.get_validation_errors().into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // Validated setters for runtime/CLI overrides. Each rejects invalid
    // values without touching the stored configuration.

    pub fn set_interval_seconds(&mut self, value: u32) -> Result<(), ConfigValidationError> {
        if value < 1 {
            return Err(ConfigValidationError::new(
                "timelapse.interval_seconds",
                "must be at least 1",
            ));
        }
        self.timelapse.interval_seconds = value;
        Ok(())
    }

    pub fn set_duration_hours(&mut self, value: f64) -> Result<(), ConfigValidationError> {
        if !value.is_finite() || value < 0.0 {
            return Err(ConfigValidationError::new(
                "timelapse.duration_hours",
                "must be a non-negative number (0 = indefinite)",
            ));
        }
        self.timelapse.duration_hours = value;
        Ok(())
    }

    pub fn set_output_dir(&mut self, value: &str) -> Result<(), ConfigValidationError> {
        if value.trim().is_empty() {
            return Err(ConfigValidationError::new(
                "timelapse.output_dir",
                "must be a non-empty path",
            ));
        }
        self.timelapse.output_dir = value.to_string();
        Ok(())
    }

    pub fn set_resolution(&mut self, value: (u32, u32)) -> Result<(), ConfigValidationError> {
        if !SUPPORTED_RESOLUTIONS.contains(&value) {
            return Err(resolution_error(value));
        }
        self.camera.resolution = value;
        Ok(())
    }

    pub fn set_iso(&mut self, value: u32) -> Result<(), ConfigValidationError> {
        if !VALID_ISO_VALUES.contains(&value) {
            return Err(iso_error(value));
        }
        self.camera.iso = value;
        Ok(())
    }

    pub fn set_exposure_mode(&mut self, value: &str) -> Result<(), ConfigValidationError> {
        if !VALID_EXPOSURE_MODES.contains(&value) {
            return Err(exposure_mode_error(value));
        }
        self.camera.exposure_mode = value.to_string();
        Ok(())
    }

    pub fn set_quality(&mut self, value: u8) -> Result<(), ConfigValidationError> {
        if value < 1 {
            return Err(ConfigValidationError::new(
                "camera.quality",
                "must be between 1 and 100",
            ));
        }
        self.camera.quality = value;
        Ok(())
    }

    pub fn set_log_level(&mut self, value: &str) -> Result<(), ConfigValidationError> {
        if !VALID_LOG_LEVELS.contains(&value.to_lowercase().as_str()) {
            return Err(ConfigValidationError::new(
                "logging.log_level",
                format!("\"{}\" is not one of {:?}", value, VALID_LOG_LEVELS),
            ));
        }
        self.logging.log_level = value.to_lowercase();
        Ok(())
    }
}

impl Default for PilapseConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                device_index: default_device_index(),
                resolution: default_resolution(),
                quality: default_quality(),
                exposure_mode: default_exposure_mode(),
                iso: default_iso(),
                shutter_speed_us: 0,
                awb_mode: default_awb_mode(),
            },
            timelapse: TimelapseConfig {
                interval_seconds: default_interval_seconds(),
                duration_hours: default_duration_hours(),
                output_dir: default_output_dir(),
                filename_prefix: default_filename_prefix(),
                image_format: default_image_format(),
                add_timestamp: true,
                create_daily_dirs: true,
                save_sidecar_json: false,
                max_consecutive_failures: default_max_consecutive_failures(),
            },
            logging: LoggingConfig {
                log_dir: default_log_dir(),
                log_level: default_log_level(),
                csv_filename: default_csv_filename(),
            },
        }
    }
}

fn resolution_error(value: (u32, u32)) -> ConfigValidationError {
    let supported: Vec<String> = SUPPORTED_RESOLUTIONS
        .iter()
        .map(|(w, h)| format!("{}x{}", w, h))
        .collect();
    ConfigValidationError::new(
        "camera.resolution",
        format!(
            "{}x{} is not a supported resolution ({})",
            value.0,
            value.1,
            supported.join(", ")
        ),
    )
}

fn iso_error(value: u32) -> ConfigValidationError {
    ConfigValidationError::new(
        "camera.iso",
        format!("{} is not one of {:?}", value, VALID_ISO_VALUES),
    )
}

fn exposure_mode_error(value: &str) -> ConfigValidationError {
    ConfigValidationError::new(
        "camera.exposure_mode",
        format!("\"{}\" is not one of {:?}", value, VALID_EXPOSURE_MODES),
    )
}

// Default value functions
fn default_device_index() -> u32 {
    0
}
fn default_resolution() -> (u32, u32) {
    (4056, 3040)
}
fn default_quality() -> u8 {
    95
}
fn default_exposure_mode() -> String {
    "auto".to_string()
}
fn default_iso() -> u32 {
    100
}
fn default_awb_mode() -> String {
    "auto".to_string()
}

fn default_interval_seconds() -> u32 {
    30
}
fn default_duration_hours() -> f64 {
    24.0
}
fn default_output_dir() -> String {
    "output/images".to_string()
}
fn default_filename_prefix() -> String {
    "timelapse".to_string()
}
fn default_image_format() -> String {
    "jpg".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_csv_filename() -> String {
    "timelapse_metadata.csv".to_string()
}
