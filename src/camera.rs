use crate::config::CameraConfig;
use crate::error::CameraError;
use crate::recovery::RetryPolicy;
use image::RgbImage;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Camera handle lifecycle. Operations invoked outside their valid
/// originating state fail with `CameraError::InvalidState` instead of
/// silently doing nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Uninitialized,
    Configured,
    Running,
    Stopped,
    Failed,
}

impl CameraState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// One RGB8 frame pulled from a device
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Device seam: the real V4L2 backend and the synthetic backend both sit
/// behind this, so the manager and the scheduler never touch a driver type.
pub trait CameraDevice: Send {
    fn name(&self) -> &'static str;
    fn configure(&mut self, config: &CameraConfig) -> Result<(), CameraError>;
    fn grab_frame(&mut self) -> Result<RawFrame, CameraError>;
    fn release(&mut self);
}

type DeviceFactory = Box<dyn Fn() -> Result<Box<dyn CameraDevice>, CameraError> + Send>;

/// Result of a successful capture
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub resolution: (u32, u32),
}

/// Owns the camera device exclusively: initialization with bounded
/// retries, per-shot capture + encode, and idempotent cleanup.
pub struct CameraManager {
    config: CameraConfig,
    factory: DeviceFactory,
    device: Option<Box<dyn CameraDevice>>,
    state: CameraState,
    retry_policy: RetryPolicy,
    frame_counter: u64,
}

impl CameraManager {
    /// Create a manager using the platform's default backend
    pub fn new(config: CameraConfig) -> Self {
        let device_index = config.device_index;
        Self::with_factory(config, Box::new(move || default_device(device_index)))
    }

    /// Create a manager with an injected device factory (tests, rehearsals)
    pub fn with_factory(config: CameraConfig, factory: DeviceFactory) -> Self {
        Self {
            config,
            factory,
            device: None,
            state: CameraState::Uninitialized,
            retry_policy: RetryPolicy::default(),
            frame_counter: 0,
        }
    }

    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry_policy = policy;
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_counter
    }

    /// Open and configure the device. Retries are bounded by the retry
    /// policy; once exhausted the manager lands in `Failed` and the last
    /// error is returned.
    pub fn initialize(&mut self) -> Result<(), CameraError> {
        match self.state {
            CameraState::Uninitialized | CameraState::Stopped => {}
            state => {
                return Err(CameraError::InvalidState {
                    operation: "initialize",
                    state: state.as_str(),
                });
            }
        }

        info!(
            "Initializing camera device {} ({}x{}, quality {})",
            self.config.device_index,
            self.config.resolution.0,
            self.config.resolution.1,
            self.config.quality
        );

        let mut last_error = CameraError::NotAvailable;
        for attempt in 0..self.retry_policy.max_attempts {
            match self.open_and_configure() {
                Ok(device) => {
                    info!("Camera initialized using {} backend", device.name());
                    self.device = Some(device);
                    self.state = CameraState::Configured;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Camera initialization failed (attempt {}/{}): {}",
                        attempt + 1,
                        self.retry_policy.max_attempts,
                        e
                    );
                    last_error = e;
                    if attempt + 1 < self.retry_policy.max_attempts {
                        std::thread::sleep(self.retry_policy.delay_for(attempt));
                    }
                }
            }
        }

        self.state = CameraState::Failed;
        Err(last_error)
    }

    fn open_and_configure(&self) -> Result<Box<dyn CameraDevice>, CameraError> {
        let mut device = (self.factory)()?;
        device.configure(&self.config)?;
        Ok(device)
    }

    /// Capture a single frame and write it to `path`, encoded per the
    /// configured format and quality. Driver failures surface as typed
    /// errors here; nothing panics mid-run.
    pub fn capture_to(&mut self, path: &Path) -> Result<CaptureOutcome, CameraError> {
        match self.state {
            CameraState::Configured | CameraState::Running => {}
            state => {
                return Err(CameraError::InvalidState {
                    operation: "capture",
                    state: state.as_str(),
                });
            }
        }

        let device = self.device.as_mut().ok_or(CameraError::NotAvailable)?;
        let frame = device.grab_frame()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CameraError::CaptureFailed {
                details: format!("could not create {}: {}", parent.display(), e),
            })?;
        }

        encode_frame(&frame, path, self.config.quality)?;

        let bytes_written = fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| CameraError::CaptureFailed {
                details: format!("capture file missing after write: {}", e),
            })?;

        self.state = CameraState::Running;
        self.frame_counter += 1;
        debug!(
            "Captured frame {} -> {} ({} bytes)",
            self.frame_counter,
            path.display(),
            bytes_written
        );

        Ok(CaptureOutcome {
            path: path.to_path_buf(),
            bytes_written,
            resolution: (frame.width, frame.height),
        })
    }

    /// Release the device. Safe to call multiple times and after a failed
    /// initialize; always lands in `Stopped`.
    pub fn cleanup(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.release();
            info!("Camera device released");
        }
        self.state = CameraState::Stopped;
    }
}

fn encode_frame(frame: &RawFrame, path: &Path, quality: u8) -> Result<(), CameraError> {
    let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels.clone()).ok_or(
        CameraError::CaptureFailed {
            details: format!(
                "frame buffer size mismatch for {}x{}",
                frame.width, frame.height
            ),
        },
    )?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let encode_result = match extension.as_str() {
        "png" => image.save_with_format(path, image::ImageFormat::Png),
        "bmp" => image.save_with_format(path, image::ImageFormat::Bmp),
        _ => {
            // jpg/jpeg and anything unrecognized: JPEG at the configured quality
            let file = fs::File::create(path).map_err(|e| CameraError::CaptureFailed {
                details: format!("could not create {}: {}", path.display(), e),
            })?;
            let mut writer = std::io::BufWriter::new(file);
            let mut encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, quality);
            encoder.encode(
                image.as_raw(),
                frame.width,
                frame.height,
                image::ColorType::Rgb8,
            )
        }
    };

    encode_result.map_err(|e| CameraError::CaptureFailed {
        details: format!("failed to encode {}: {}", path.display(), e),
    })
}

fn default_device(device_index: u32) -> Result<Box<dyn CameraDevice>, CameraError> {
    #[cfg(all(feature = "camera", target_os = "linux"))]
    {
        Ok(Box::new(v4l2::V4l2Camera::open(device_index)?))
    }

    #[cfg(not(all(feature = "camera", target_os = "linux")))]
    {
        let _ = device_index;
        warn!("V4L2 backend unavailable on this platform, using synthetic camera");
        Ok(Box::new(MockCamera::new()))
    }
}

/// Synthetic backend: produces a deterministic gradient that shifts per
/// frame, so captures are distinguishable and quality metrics are non-zero.
pub struct MockCamera {
    resolution: (u32, u32),
    frame_id: u64,
}

impl MockCamera {
    pub fn new() -> Self {
        Self {
            resolution: (640, 480),
            frame_id: 0,
        }
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDevice for MockCamera {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn configure(&mut self, config: &CameraConfig) -> Result<(), CameraError> {
        self.resolution = config.resolution;
        debug!(
            "Mock camera configured at {}x{}",
            config.resolution.0, config.resolution.1
        );
        Ok(())
    }

    fn grab_frame(&mut self) -> Result<RawFrame, CameraError> {
        let (width, height) = self.resolution;
        let shift = (self.frame_id % 256) as u32;
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);

        for y in 0..height {
            for x in 0..width {
                pixels.push((((x + shift) * 255) / width.max(1)) as u8);
                pixels.push(((y * 255) / height.max(1)) as u8);
                pixels.push((255 - shift.min(255)) as u8);
            }
        }

        self.frame_id += 1;
        Ok(RawFrame {
            width,
            height,
            pixels,
        })
    }

    fn release(&mut self) {
        debug!("Mock camera released");
    }
}

#[cfg(all(feature = "camera", target_os = "linux"))]
mod v4l2 {
    use super::{CameraDevice, RawFrame};
    use crate::config::CameraConfig;
    use crate::error::CameraError;
    use tracing::{debug, info, warn};
    use v4l::buffer::Type;
    use v4l::io::mmap::Stream;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;

    /// V4L2 still-capture backend. The stream is created per grab so the
    /// device handle itself is the only long-lived resource.
    pub struct V4l2Camera {
        device: v4l::Device,
        device_index: u32,
        resolution: (u32, u32),
        fourcc: v4l::FourCC,
    }

    impl V4l2Camera {
        pub fn open(device_index: u32) -> Result<Self, CameraError> {
            let path = format!("/dev/video{}", device_index);
            debug!("Opening V4L2 device: {}", path);

            let device = v4l::Device::new(device_index as usize).map_err(|e| {
                CameraError::DeviceOpen {
                    device: device_index,
                    details: e.to_string(),
                }
            })?;

            Ok(Self {
                device,
                device_index,
                resolution: (0, 0),
                fourcc: v4l::FourCC::new(b"RGB3"),
            })
        }
    }

    impl CameraDevice for V4l2Camera {
        fn name(&self) -> &'static str {
            "v4l2"
        }

        fn configure(&mut self, config: &CameraConfig) -> Result<(), CameraError> {
            let mut format = self
                .device
                .format()
                .map_err(|e| CameraError::Configuration {
                    details: format!("failed to read format: {}", e),
                })?;

            format.width = config.resolution.0;
            format.height = config.resolution.1;
            format.fourcc = v4l::FourCC::new(b"RGB3");

            let actual = self
                .device
                .set_format(&format)
                .map_err(|e| CameraError::Configuration {
                    details: format!("failed to set format: {}", e),
                })?;

            if actual.width != config.resolution.0 || actual.height != config.resolution.1 {
                warn!(
                    "Camera resolution adjusted by driver: requested {}x{}, got {}x{}",
                    config.resolution.0, config.resolution.1, actual.width, actual.height
                );
            }

            self.resolution = (actual.width, actual.height);
            self.fourcc = actual.fourcc;

            info!(
                "Camera device {} configured: {}x{} format {}",
                self.device_index, actual.width, actual.height, actual.fourcc
            );
            Ok(())
        }

        fn grab_frame(&mut self) -> Result<RawFrame, CameraError> {
            let mut stream = Stream::with_buffers(&self.device, Type::VideoCapture, 2).map_err(
                |e| CameraError::CaptureFailed {
                    details: format!("failed to create capture stream: {}", e),
                },
            )?;

            // First frame after stream start can be stale; grab two and
            // keep the second.
            let mut data = Vec::new();
            for _ in 0..2 {
                let (buffer, _meta) =
                    stream.next().map_err(|e| CameraError::CaptureFailed {
                        details: format!("frame capture failed: {}", e),
                    })?;
                data = buffer.to_vec();
            }

            let (width, height) = self.resolution;
            let pixels = match &self.fourcc.repr {
                b"RGB3" => data,
                b"MJPG" => image::load_from_memory(&data)
                    .map_err(|e| CameraError::CaptureFailed {
                        details: format!("MJPEG decode failed: {}", e),
                    })?
                    .to_rgb8()
                    .into_raw(),
                other => {
                    return Err(CameraError::Configuration {
                        details: format!(
                            "unsupported pixel format {:?}",
                            String::from_utf8_lossy(other)
                        ),
                    });
                }
            };

            Ok(RawFrame {
                width,
                height,
                pixels,
            })
        }

        fn release(&mut self) {
            debug!("Releasing V4L2 device {}", self.device_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PilapseConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_camera_config() -> CameraConfig {
        let mut config = PilapseConfig::default().camera;
        config.resolution = (640, 480);
        config
    }

    fn mock_manager() -> CameraManager {
        CameraManager::with_factory(
            test_camera_config(),
            Box::new(|| Ok(Box::new(MockCamera::new()))),
        )
    }

    #[test]
    fn test_initialize_and_capture() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = mock_manager();

        camera.initialize().unwrap();
        assert_eq!(camera.state(), CameraState::Configured);

        let path = dir.path().join("frame.jpg");
        let outcome = camera.capture_to(&path).unwrap();
        assert!(path.is_file());
        assert!(outcome.bytes_written > 0);
        assert_eq!(outcome.resolution, (640, 480));
        assert_eq!(camera.frame_count(), 1);
        assert_eq!(camera.state(), CameraState::Running);

        // Captured file decodes back to the configured resolution
        let decoded = image::open(&path).unwrap();
        assert_eq!(decoded.width(), 640);
        assert_eq!(decoded.height(), 480);
    }

    #[test]
    fn test_capture_before_initialize_is_invalid_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = mock_manager();

        let result = camera.capture_to(&dir.path().join("frame.jpg"));
        assert!(matches!(
            result,
            Err(CameraError::InvalidState {
                operation: "capture",
                state: "uninitialized",
            })
        ));
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let mut camera = mock_manager();
        camera.initialize().unwrap();

        camera.cleanup();
        assert_eq!(camera.state(), CameraState::Stopped);
        camera.cleanup();
        assert_eq!(camera.state(), CameraState::Stopped);
    }

    #[test]
    fn test_cleanup_after_failed_initialize() {
        let mut camera = CameraManager::with_factory(
            test_camera_config(),
            Box::new(|| {
                Err(CameraError::DeviceOpen {
                    device: 0,
                    details: "no such device".to_string(),
                })
            }),
        );
        camera.set_retry_policy(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            exponential_backoff: false,
        });

        assert!(camera.initialize().is_err());
        assert_eq!(camera.state(), CameraState::Failed);

        camera.cleanup();
        assert_eq!(camera.state(), CameraState::Stopped);
        camera.cleanup();
        assert_eq!(camera.state(), CameraState::Stopped);
    }

    #[test]
    fn test_initialize_retries_are_bounded() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let mut camera = CameraManager::with_factory(
            test_camera_config(),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CameraError::DeviceOpen {
                    device: 0,
                    details: "busy".to_string(),
                })
            }),
        );
        camera.set_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            exponential_backoff: true,
        });

        let result = camera.initialize();
        assert!(matches!(result, Err(CameraError::DeviceOpen { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(camera.state(), CameraState::Failed);
    }

    #[test]
    fn test_reinitialize_after_cleanup() {
        let mut camera = mock_manager();
        camera.initialize().unwrap();
        camera.cleanup();

        camera.initialize().unwrap();
        assert_eq!(camera.state(), CameraState::Configured);
    }

    #[test]
    fn test_initialize_while_configured_is_invalid_state() {
        let mut camera = mock_manager();
        camera.initialize().unwrap();

        let result = camera.initialize();
        assert!(matches!(
            result,
            Err(CameraError::InvalidState {
                operation: "initialize",
                ..
            })
        ));
    }

    #[test]
    fn test_png_capture() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = mock_manager();
        camera.initialize().unwrap();

        let path = dir.path().join("frame.png");
        camera.capture_to(&path).unwrap();
        let decoded = image::open(&path).unwrap();
        assert_eq!(decoded.width(), 640);
    }
}
