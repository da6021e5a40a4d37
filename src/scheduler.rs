use crate::camera::{CameraManager, CaptureOutcome};
use crate::config::PilapseConfig;
use crate::error::{CameraError, PilapseError, Result};
use crate::metrics_log::{CaptureRecord, MetricsLogger, ShotType};
use crate::quality::{self, QualityMetrics};
use crate::recovery::FailureCounter;
use crate::status::{StatusMonitor, TimingReadout};
use crate::storage;
use crate::timing::TimingController;
use chrono::Local;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Scheduler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Totals reported when a run ends
#[derive(Debug, Clone)]
pub struct SchedulerOutcome {
    pub captures_attempted: u64,
    pub failed_cycles: u32,
}

/// The drift-corrected main loop: waits out each deadline, drives a
/// capture, evaluates quality, logs the CSV row, and updates the console.
///
/// Per-cycle errors are counted but never fatal on their own; only a run
/// of consecutive failures, disk exhaustion, or an unrecoverable
/// configuration aborts the run. Camera and logger cleanup are guaranteed
/// on every exit path once `run` has been entered.
pub struct Scheduler {
    config: PilapseConfig,
    camera: Arc<Mutex<CameraManager>>,
    metrics: Arc<MetricsLogger>,
    status: StatusMonitor,
    timing: TimingController,
    cancel: CancellationToken,
    state: SchedulerState,
    failures: FailureCounter,
    capture_timeout: Duration,
    capture_count: u64,
    output_dir: Option<PathBuf>,
}

impl Scheduler {
    pub fn new(
        config: PilapseConfig,
        camera: CameraManager,
        metrics: MetricsLogger,
        verbose: bool,
        dry_run: bool,
    ) -> Result<Self> {
        let timing = TimingController::new(config.timelapse.interval_seconds as f64, false)?;
        let mut status = StatusMonitor::new(&config, verbose);
        status.set_dry_run(dry_run);

        // A hung driver call may cost at most one interval of cadence
        let capture_timeout = Duration::from_secs(config.timelapse.interval_seconds.max(1) as u64);
        let failures = FailureCounter::new(config.timelapse.max_consecutive_failures);

        Ok(Self {
            config,
            camera: Arc::new(Mutex::new(camera)),
            metrics: Arc::new(metrics),
            status,
            timing,
            cancel: CancellationToken::new(),
            state: SchedulerState::Idle,
            failures,
            capture_timeout,
            capture_count: 0,
            output_dir: None,
        })
    }

    /// Token that shutdown signal handlers cancel to stop the run. Honored
    /// within one capture cycle, never mid-write.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn capture_count(&self) -> u64 {
        self.capture_count
    }

    /// Shared handle to the camera, for inspecting state after a run
    pub fn camera(&self) -> Arc<Mutex<CameraManager>> {
        Arc::clone(&self.camera)
    }

    /// Run the capture loop to completion (duration elapsed, cancellation,
    /// or escalated failure). Cleanup of the camera and the metrics logger
    /// runs on every exit path.
    pub async fn run(&mut self) -> Result<SchedulerOutcome> {
        if self.state != SchedulerState::Idle {
            return Err(PilapseError::system(format!(
                "scheduler cannot run from the {:?} state",
                self.state
            )));
        }

        self.state = SchedulerState::Running;
        let result = self.run_inner().await;
        self.state = SchedulerState::Stopping;

        // Cleanup must not be skipped by any return path above.
        match self.camera.try_lock_for(Duration::from_secs(5)) {
            Some(mut camera) => camera.cleanup(),
            None => warn!("Camera still busy during shutdown; device release skipped"),
        }
        self.metrics.cleanup();

        let final_dir = self
            .output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.config.timelapse.output_dir));
        self.status.display_final_summary(&final_dir);
        self.timing.report();

        match result {
            Ok(()) => {
                self.state = SchedulerState::Stopped;
                info!(
                    "Timelapse completed: {} captures in {:.2} hours",
                    self.capture_count,
                    self.status.elapsed_hours()
                );
                Ok(SchedulerOutcome {
                    captures_attempted: self.capture_count,
                    failed_cycles: self.failures.total(),
                })
            }
            Err(e) => {
                self.state = SchedulerState::Failed;
                error!("Timelapse run failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run_inner(&mut self) -> Result<()> {
        storage::ensure_directories(&self.config)?;
        let output_dir = storage::prepare_output_dir(&self.config)?;
        self.output_dir = Some(output_dir.clone());

        let duration_hours = self.config.timelapse.duration_hours;
        let end_at = if duration_hours > 0.0 {
            Some(Instant::now() + Duration::from_secs_f64(duration_hours * 3600.0))
        } else {
            None
        };

        info!(
            "Starting timelapse capture loop: interval {}s, duration {}, output {}",
            self.config.timelapse.interval_seconds,
            if duration_hours == 0.0 {
                "indefinite".to_string()
            } else {
                format!("{} hours", duration_hours)
            },
            output_dir.display()
        );

        println!("\n=== Pilapse Timelapse System ===");
        println!(
            "Started: {}",
            self.status.started_at().format("%Y-%m-%d %H:%M:%S")
        );
        println!(
            "Interval: {} seconds",
            self.config.timelapse.interval_seconds
        );
        println!("Output: {}", output_dir.display());
        if duration_hours == 0.0 {
            println!("Duration: Indefinite");
        } else {
            println!("Duration: {} hours", duration_hours);
        }
        if self.status.is_dry_run() {
            println!("Mode: DRY RUN (no images captured)");
        }
        println!("{}\n", "=".repeat(40));

        loop {
            if self.cancel.is_cancelled() {
                info!("Shutdown requested, draining capture loop");
                break;
            }

            if let Some(end) = end_at {
                if Instant::now() >= end {
                    info!("Configured duration elapsed, stopping timelapse");
                    break;
                }
            }

            if !self.timing.wait_until_due(&self.cancel).await {
                info!("Shutdown requested while waiting for next capture");
                break;
            }

            self.capture_count += 1;
            let capture_number = self.capture_count;

            match self.run_cycle(&output_dir, capture_number).await {
                Ok(()) => {
                    self.failures.record_success();
                }
                Err(e) if e.is_fatal() => {
                    error!("Unrecoverable error in capture cycle {}: {}", capture_number, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Capture cycle {} failed: {}", capture_number, e);
                    if self.failures.record_failure() {
                        return Err(PilapseError::system(format!(
                            "aborting after {} consecutive failed capture cycles (last error: {})",
                            self.failures.consecutive(),
                            e
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    async fn run_cycle(&mut self, output_dir: &Path, capture_number: u64) -> Result<()> {
        let cycle_start = Local::now();

        storage::check_disk_space(output_dir, storage::MIN_CAPTURE_SPACE_MB)?;

        let filename = storage::generate_filename(
            &self.config.timelapse,
            capture_number,
            Some(output_dir),
        );
        let path = output_dir.join(&filename);

        let readout = self.timing_readout();
        self.status
            .display_status_line(cycle_start, true, "", Some(&readout));

        if self.status.is_dry_run() {
            self.timing.capture_completed();
            self.status.update_capture(capture_number, None);
            let readout = self.timing_readout();
            self.status
                .display_status_line(Local::now(), true, "", Some(&readout));
            self.status
                .display_periodic_summary(Local::now(), Some(&readout));
            return Ok(());
        }

        let outcome = match self.capture_with_timeout(path.clone()).await {
            Ok(outcome) => {
                info!("Captured: {}", filename);
                outcome
            }
            Err(e) => {
                // Advance the deadline so a failing camera cannot spin the
                // loop without sleeping.
                self.timing.capture_completed();
                let readout = self.timing_readout();
                self.status.display_status_line(
                    Local::now(),
                    false,
                    "capture failed",
                    Some(&readout),
                );
                return Err(e);
            }
        };

        let quality_metrics = match self.evaluate_with_timeout(path.clone()).await {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                warn!("Quality evaluation failed for {}: {}", filename, e);
                None
            }
        };

        self.timing.capture_completed();

        let mut error_msg = "";
        match &quality_metrics {
            Some(metrics) => {
                let record = CaptureRecord {
                    timestamp: cycle_start,
                    filename: filename.clone(),
                    image_path: path.clone(),
                    shot_type: ShotType::Scheduled,
                    capture_number,
                    resolution: outcome.resolution,
                    file_size: outcome.bytes_written,
                    quality: metrics.clone(),
                    iso: self.config.camera.iso,
                    exposure_mode: self.config.camera.exposure_mode.clone(),
                    timing: self.timing.last_snapshot(),
                };

                match self.metrics.log_capture_event(&record) {
                    Ok(()) => {
                        if self.config.timelapse.save_sidecar_json {
                            if let Err(e) = save_sidecar(&record, output_dir) {
                                warn!("Failed to write sidecar for {}: {}", filename, e);
                            }
                        }
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!("Failed to log metadata for {}: {}", filename, e);
                        error_msg = "metadata log failed";
                    }
                }
            }
            None => {
                error_msg = "image evaluation failed";
            }
        }

        self.status
            .update_capture(capture_number, quality_metrics.as_ref());
        let readout = self.timing_readout();
        self.status
            .display_status_line(Local::now(), true, error_msg, Some(&readout));
        self.status
            .display_periodic_summary(Local::now(), Some(&readout));

        if capture_number % 10 == 0 {
            info!("Progress: {} captures completed", capture_number);
        }

        Ok(())
    }

    /// Capture in a blocking task, bounded so a hung driver costs at most
    /// one missed interval.
    async fn capture_with_timeout(&self, path: PathBuf) -> Result<CaptureOutcome> {
        let camera = Arc::clone(&self.camera);
        let task = tokio::task::spawn_blocking(move || {
            match camera.try_lock_for(Duration::from_secs(1)) {
                Some(mut camera) => camera.capture_to(&path),
                None => Err(CameraError::CaptureFailed {
                    details: "previous capture still holds the camera".to_string(),
                }),
            }
        });

        match timeout(self.capture_timeout, task).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(join_err)) => Err(PilapseError::system(format!(
                "capture task failed: {}",
                join_err
            ))),
            Err(_) => Err(CameraError::CaptureTimeout {
                timeout: self.capture_timeout,
            }
            .into()),
        }
    }

    async fn evaluate_with_timeout(&self, path: PathBuf) -> Result<QualityMetrics> {
        let task = tokio::task::spawn_blocking(move || quality::evaluate_image_quality(&path));

        match timeout(self.capture_timeout, task).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(join_err)) => Err(PilapseError::system(format!(
                "evaluation task failed: {}",
                join_err
            ))),
            Err(_) => Err(PilapseError::system("quality evaluation timed out")),
        }
    }

    fn timing_readout(&self) -> TimingReadout {
        let stats = self.timing.get_timing_stats();
        let drift = self.timing.get_drift_info();
        TimingReadout {
            time_until_next: self.timing.get_time_until_next(),
            drift_percentage: drift.drift_percentage,
            avg_interval: stats.avg_interval,
        }
    }
}

/// Per-capture JSON sidecar under `<output>/metadata/`, for consumers that
/// want structured metadata without parsing the CSV
fn save_sidecar(record: &CaptureRecord, output_dir: &Path) -> Result<()> {
    let metadata_dir = output_dir.join("metadata");
    std::fs::create_dir_all(&metadata_dir)?;

    let json = serde_json::to_string_pretty(record)
        .map_err(|e| PilapseError::system(format!("failed to serialize metadata: {}", e)))?;

    let sidecar_path = metadata_dir.join(format!("{}.json", record.filename));
    std::fs::write(&sidecar_path, json)?;
    Ok(())
}
