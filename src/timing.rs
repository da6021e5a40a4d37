use crate::error::ConfigValidationError;
use crate::metrics_log::TimingSnapshot;
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Rolling window of actual inter-capture intervals kept for statistics
pub const INTERVAL_HISTORY_LIMIT: usize = 100;

/// Wall-clock jumps beyond this (relative to monotonic time) count as a
/// system clock adjustment (NTP sync, manual set)
const CLOCK_JUMP_THRESHOLD_SECS: f64 = 1.0;

/// Clock-jump warnings emitted at warn level before downgrading to info
const MAX_DRIFT_WARNINGS: u32 = 3;

/// Timing accuracy snapshot
#[derive(Debug, Clone)]
pub struct TimingStats {
    pub expected_interval: f64,
    pub last_interval: f64,
    pub drift_accumulated: f64,
    pub total_drift: f64,
    pub capture_count: u64,
    pub clock_adjustments: u32,
    pub avg_interval: f64,
    pub min_interval: f64,
    pub max_interval: f64,
}

/// Drift-centric view used by status displays
#[derive(Debug, Clone)]
pub struct DriftInfo {
    pub current_drift: f64,
    pub total_drift: f64,
    pub avg_drift_per_capture: f64,
    pub drift_percentage: f64,
    pub clock_adjustments: u32,
}

/// Drift-correcting deadline scheduler for the capture loop.
///
/// Deadlines are tracked on the monotonic clock. After each capture the
/// actual interval is compared against the target; the accumulated error
/// is fed back into the next deadline (clamped to half an interval) so the
/// period between fire times converges to the configured interval even
/// though each capture takes variable time.
pub struct TimingController {
    interval: f64,
    start: Instant,
    last_capture: Instant,
    next_deadline: Instant,

    drift_accumulated: f64,
    total_drift: f64,
    last_interval: f64,
    last_drift: f64,
    capture_count: u64,

    last_wall_time: SystemTime,
    last_check: Instant,
    clock_adjustments: u32,

    interval_history: VecDeque<f64>,
    min_interval: f64,
    max_interval: f64,

    sleep_slice: Duration,
    suppress_drift_warnings: bool,
    drift_warning_count: u32,
}

impl TimingController {
    pub fn new(
        interval_seconds: f64,
        suppress_drift_warnings: bool,
    ) -> Result<Self, ConfigValidationError> {
        if !interval_seconds.is_finite() || interval_seconds <= 0.0 {
            return Err(ConfigValidationError::new(
                "timelapse.interval_seconds",
                "interval must be greater than 0",
            ));
        }

        let now = Instant::now();
        let controller = Self {
            interval: interval_seconds,
            start: now,
            last_capture: now,
            next_deadline: now + Duration::from_secs_f64(interval_seconds),
            drift_accumulated: 0.0,
            total_drift: 0.0,
            last_interval: 0.0,
            last_drift: 0.0,
            capture_count: 0,
            last_wall_time: SystemTime::now(),
            last_check: now,
            clock_adjustments: 0,
            interval_history: VecDeque::with_capacity(INTERVAL_HISTORY_LIMIT),
            min_interval: f64::INFINITY,
            max_interval: 0.0,
            sleep_slice: Duration::from_secs_f64((interval_seconds / 10.0).min(1.0)),
            suppress_drift_warnings,
            drift_warning_count: 0,
        };

        info!(
            "Timing controller initialized: interval={}s, drift warnings {}",
            interval_seconds,
            if suppress_drift_warnings {
                "suppressed"
            } else {
                "enabled"
            }
        );

        Ok(controller)
    }

    /// Sleep until the next deadline, in small slices so cancellation is
    /// honored promptly. Returns false if cancelled before the deadline.
    pub async fn wait_until_due(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            self.detect_clock_adjustment();

            let now = Instant::now();
            if now >= self.next_deadline {
                return true;
            }

            let remaining = self.next_deadline - now;
            let slice = remaining.min(self.sleep_slice);

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(slice) => {}
            }
        }
    }

    /// Record a finished capture cycle and schedule the next deadline with
    /// drift correction applied.
    pub fn capture_completed(&mut self) {
        let now = Instant::now();
        let actual_interval = (now - self.last_capture).as_secs_f64();

        if self.interval_history.len() == INTERVAL_HISTORY_LIMIT {
            self.interval_history.pop_front();
        }
        self.interval_history.push_back(actual_interval);
        self.min_interval = self.min_interval.min(actual_interval);
        self.max_interval = self.max_interval.max(actual_interval);

        let drift = actual_interval - self.interval;
        self.drift_accumulated += drift;
        self.total_drift += drift.abs();
        self.last_interval = actual_interval;
        self.last_drift = drift;

        // Correction is bounded to half an interval so a single bad cycle
        // cannot swing the schedule past its neighbors.
        let max_correction = self.interval * 0.5;
        let correction = (-self.drift_accumulated).clamp(-max_correction, max_correction);

        self.last_capture = now;
        self.next_deadline = now + Duration::from_secs_f64(self.interval + correction);
        self.capture_count += 1;

        debug!(
            "Capture #{}: interval={:.3}s, drift={:.3}s, correction={:.3}s",
            self.capture_count, actual_interval, drift, correction
        );
    }

    fn detect_clock_adjustment(&mut self) {
        let wall_now = SystemTime::now();
        let mono_elapsed = self.last_check.elapsed().as_secs_f64();

        let wall_elapsed = match wall_now.duration_since(self.last_wall_time) {
            Ok(d) => d.as_secs_f64(),
            Err(e) => -e.duration().as_secs_f64(),
        };

        let jump = (wall_elapsed - mono_elapsed).abs();
        if jump > CLOCK_JUMP_THRESHOLD_SECS {
            self.clock_adjustments += 1;
            self.drift_warning_count += 1;

            if self.suppress_drift_warnings {
                debug!("System clock adjustment detected: {:.2}s jump", jump);
            } else if self.drift_warning_count <= MAX_DRIFT_WARNINGS {
                warn!("System clock adjustment detected: {:.2}s jump", jump);
            } else {
                info!(
                    "System clock adjustment detected: {:.2}s jump (adjustment #{})",
                    jump, self.clock_adjustments
                );
            }
        }

        self.last_wall_time = wall_now;
        self.last_check = Instant::now();
    }

    /// Seconds until the next deadline, floored at zero
    pub fn get_time_until_next(&self) -> f64 {
        let now = Instant::now();
        if now >= self.next_deadline {
            0.0
        } else {
            (self.next_deadline - now).as_secs_f64()
        }
    }

    /// Total seconds since the controller was created
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn capture_count(&self) -> u64 {
        self.capture_count
    }

    pub fn get_timing_stats(&self) -> TimingStats {
        let avg_interval = if self.interval_history.is_empty() {
            0.0
        } else {
            self.interval_history.iter().sum::<f64>() / self.interval_history.len() as f64
        };

        TimingStats {
            expected_interval: self.interval,
            last_interval: self.last_interval,
            drift_accumulated: self.drift_accumulated,
            total_drift: self.total_drift,
            capture_count: self.capture_count,
            clock_adjustments: self.clock_adjustments,
            avg_interval,
            min_interval: if self.min_interval.is_finite() {
                self.min_interval
            } else {
                0.0
            },
            max_interval: self.max_interval,
        }
    }

    pub fn get_drift_info(&self) -> DriftInfo {
        DriftInfo {
            current_drift: self.drift_accumulated,
            total_drift: self.total_drift,
            avg_drift_per_capture: self.total_drift / self.capture_count.max(1) as f64,
            drift_percentage: self.drift_accumulated / self.interval * 100.0,
            clock_adjustments: self.clock_adjustments,
        }
    }

    /// Timing figures for the most recently completed cycle, in the shape
    /// the CSV log records
    pub fn last_snapshot(&self) -> TimingSnapshot {
        TimingSnapshot {
            actual_interval: self.last_interval,
            drift: self.last_drift,
            accumulated_drift: self.drift_accumulated,
            clock_adjustments: self.clock_adjustments,
        }
    }

    /// Change the target interval mid-run; the next deadline restarts from
    /// now.
    pub fn adjust_interval(&mut self, new_interval: f64) -> Result<(), ConfigValidationError> {
        if !new_interval.is_finite() || new_interval <= 0.0 {
            return Err(ConfigValidationError::new(
                "timelapse.interval_seconds",
                "interval must be greater than 0",
            ));
        }

        info!(
            "Adjusting interval from {}s to {}s",
            self.interval, new_interval
        );
        self.interval = new_interval;
        self.sleep_slice = Duration::from_secs_f64((new_interval / 10.0).min(1.0));
        self.next_deadline = Instant::now() + Duration::from_secs_f64(new_interval);
        Ok(())
    }

    /// Discard accumulated drift (useful after a clock adjustment)
    pub fn reset_drift(&mut self) {
        info!("Resetting accumulated drift");
        self.drift_accumulated = 0.0;
        self.next_deadline = Instant::now() + Duration::from_secs_f64(self.interval);
    }

    /// Log the end-of-run timing accuracy report
    pub fn report(&self) {
        let stats = self.get_timing_stats();
        let drift = self.get_drift_info();

        info!("=== Timing Accuracy Report ===");
        info!("Captures completed: {}", stats.capture_count);
        info!("Expected interval: {:.3}s", stats.expected_interval);
        info!("Average interval: {:.3}s", stats.avg_interval);
        info!(
            "Interval range: {:.3}s - {:.3}s",
            stats.min_interval, stats.max_interval
        );
        info!(
            "Current drift: {:.3}s ({:.2}%)",
            stats.drift_accumulated, drift.drift_percentage
        );
        info!("Total drift: {:.3}s", stats.total_drift);
        info!("System clock adjustments: {}", stats.clock_adjustments);
        info!("Elapsed time: {:.1}s", self.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_is_rejected() {
        assert!(TimingController::new(0.0, false).is_err());
        assert!(TimingController::new(-1.0, false).is_err());
        assert!(TimingController::new(f64::NAN, false).is_err());
    }

    #[tokio::test]
    async fn test_wait_returns_when_due() {
        let mut controller = TimingController::new(0.05, true).unwrap();
        let cancel = CancellationToken::new();

        let started = Instant::now();
        assert!(controller.wait_until_due(&cancel).await);
        let waited = started.elapsed().as_secs_f64();
        assert!(waited >= 0.04, "waited only {:.3}s", waited);
        assert!(waited < 1.0, "waited too long: {:.3}s", waited);
    }

    #[tokio::test]
    async fn test_wait_honors_cancellation_promptly() {
        let mut controller = TimingController::new(30.0, true).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = Instant::now();
        assert!(!controller.wait_until_due(&cancel).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_drift_correction_pulls_deadline_earlier() {
        let mut controller = TimingController::new(0.1, true).unwrap();
        let cancel = CancellationToken::new();

        assert!(controller.wait_until_due(&cancel).await);
        // Simulate slow capture work past the deadline
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.capture_completed();

        // Positive drift accumulated, so the next wait is shorter than the
        // nominal interval
        let until = controller.get_time_until_next();
        assert!(until < 0.1, "deadline not corrected: {:.3}s", until);

        let snapshot = controller.last_snapshot();
        assert!(snapshot.actual_interval > 0.1);
        assert!(snapshot.drift > 0.0);
    }

    #[tokio::test]
    async fn test_fire_time_gaps_converge_to_interval() {
        let interval = 0.1;
        let mut controller = TimingController::new(interval, true).unwrap();
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let cycles = 5u32;
        for _ in 0..cycles {
            assert!(controller.wait_until_due(&cancel).await);
            // Variable per-capture work time
            tokio::time::sleep(Duration::from_millis(30)).await;
            controller.capture_completed();
        }
        let total = started.elapsed().as_secs_f64();

        // Despite 30ms of work per cycle, total run time stays close to
        // cycles * interval thanks to drift correction
        let expected = cycles as f64 * interval;
        assert!(
            (total - expected).abs() < 0.15,
            "total {:.3}s vs expected {:.3}s",
            total,
            expected
        );

        let stats = controller.get_timing_stats();
        assert_eq!(stats.capture_count, cycles as u64);
        assert!(stats.avg_interval > 0.0);
    }

    #[test]
    fn test_correction_is_clamped() {
        let mut controller = TimingController::new(10.0, true).unwrap();

        // Immediate completions: each actual interval is ~0, accumulating
        // large negative drift; correction must stay within half an
        // interval so the next deadline is at most 1.5 intervals out.
        for _ in 0..5 {
            controller.capture_completed();
        }

        let until = controller.get_time_until_next();
        assert!(until <= 15.0 + 0.1, "uncorrected deadline: {:.3}s", until);
    }

    #[test]
    fn test_interval_history_is_bounded() {
        let mut controller = TimingController::new(1.0, true).unwrap();
        for _ in 0..(INTERVAL_HISTORY_LIMIT + 50) {
            controller.capture_completed();
        }
        assert_eq!(controller.interval_history.len(), INTERVAL_HISTORY_LIMIT);
    }

    #[test]
    fn test_adjust_interval_validates() {
        let mut controller = TimingController::new(1.0, true).unwrap();
        assert!(controller.adjust_interval(0.0).is_err());
        assert!(controller.adjust_interval(5.0).is_ok());

        let stats = controller.get_timing_stats();
        assert_eq!(stats.expected_interval, 5.0);
    }

    #[test]
    fn test_reset_drift_clears_accumulation() {
        let mut controller = TimingController::new(1.0, true).unwrap();
        controller.capture_completed();
        controller.reset_drift();

        let drift = controller.get_drift_info();
        assert_eq!(drift.current_drift, 0.0);
    }
}
