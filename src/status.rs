use crate::config::PilapseConfig;
use crate::quality::QualityMetrics;
use chrono::{DateTime, Duration as ChronoDuration, Local};
use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

/// Rolling quality window size; the oldest entry is evicted beyond this
pub const QUALITY_HISTORY_LIMIT: usize = 50;

/// The slice of a frame's quality metrics the monitor keeps per capture
#[derive(Debug, Clone, Copy)]
pub struct QualitySample {
    pub sharpness: f64,
    pub brightness: f64,
}

/// Aggregates over the rolling quality window
#[derive(Debug, Clone, PartialEq)]
pub struct QualityStatistics {
    pub avg_sharpness: f64,
    pub min_sharpness: f64,
    pub max_sharpness: f64,
    pub avg_brightness: f64,
    pub min_brightness: f64,
    pub max_brightness: f64,
}

/// Timing figures the scheduler hands over for display
#[derive(Debug, Clone, Copy)]
pub struct TimingReadout {
    pub time_until_next: f64,
    pub drift_percentage: f64,
    pub avg_interval: f64,
}

/// Console status monitoring for a running timelapse.
///
/// Status lines and summaries are product output and go to stdout; the
/// tracing log carries diagnostics separately.
pub struct StatusMonitor {
    capture_count: u64,
    start_time: DateTime<Local>,
    started: Instant,
    last_capture_time: DateTime<Local>,
    last_quality: Option<QualitySample>,
    quality_history: VecDeque<QualitySample>,
    interval_seconds: u32,
    duration_hours: f64,
    output_dir: String,
    end_time: Option<DateTime<Local>>,
    verbose: bool,
    dry_run: bool,
}

impl StatusMonitor {
    pub fn new(config: &PilapseConfig, verbose: bool) -> Self {
        let start_time = Local::now();
        let duration_hours = config.timelapse.duration_hours;

        // duration_hours == 0 means an indefinite run with no end time
        let end_time = if duration_hours > 0.0 {
            Some(start_time + ChronoDuration::seconds((duration_hours * 3600.0) as i64))
        } else {
            None
        };

        Self {
            capture_count: 0,
            start_time,
            started: Instant::now(),
            last_capture_time: start_time,
            last_quality: None,
            quality_history: VecDeque::with_capacity(QUALITY_HISTORY_LIMIT),
            interval_seconds: config.timelapse.interval_seconds,
            duration_hours,
            output_dir: config.timelapse.output_dir.clone(),
            end_time,
            verbose,
            dry_run: false,
        }
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn capture_count(&self) -> u64 {
        self.capture_count
    }

    pub fn end_time(&self) -> Option<DateTime<Local>> {
        self.end_time
    }

    /// Record a completed capture, appending its quality sample to the
    /// rolling window (evicting the oldest beyond the limit).
    pub fn update_capture(&mut self, capture_number: u64, metrics: Option<&QualityMetrics>) {
        self.capture_count = capture_number;
        self.last_capture_time = Local::now();

        if let Some(metrics) = metrics {
            let sample = QualitySample {
                sharpness: metrics.sharpness_score,
                brightness: metrics.brightness_value,
            };
            self.last_quality = Some(sample);
            if self.quality_history.len() == QUALITY_HISTORY_LIMIT {
                self.quality_history.pop_front();
            }
            self.quality_history.push_back(sample);
        }
    }

    pub fn get_next_capture_time(&self) -> DateTime<Local> {
        self.last_capture_time + ChronoDuration::seconds(self.interval_seconds as i64)
    }

    /// Seconds until the next scheduled capture, floored at zero
    pub fn get_time_until_next(&self) -> f64 {
        let until = self.get_next_capture_time() - Local::now();
        (until.num_milliseconds() as f64 / 1000.0).max(0.0)
    }

    /// Monotonic time since the monitor was created
    pub fn get_elapsed_time(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_hours(&self) -> f64 {
        self.get_elapsed_time().as_secs_f64() / 3600.0
    }

    /// Remaining run time; None for an indefinite run
    pub fn get_remaining_time(&self) -> Option<Duration> {
        let end = self.end_time?;
        let remaining = end - Local::now();
        Some(Duration::from_secs_f64(
            (remaining.num_milliseconds() as f64 / 1000.0).max(0.0),
        ))
    }

    /// Aggregates over the rolling window; None while the history is empty
    pub fn get_quality_statistics(&self) -> Option<QualityStatistics> {
        if self.quality_history.is_empty() {
            return None;
        }

        let n = self.quality_history.len() as f64;
        let mut stats = QualityStatistics {
            avg_sharpness: 0.0,
            min_sharpness: f64::INFINITY,
            max_sharpness: f64::NEG_INFINITY,
            avg_brightness: 0.0,
            min_brightness: f64::INFINITY,
            max_brightness: f64::NEG_INFINITY,
        };

        for sample in &self.quality_history {
            stats.avg_sharpness += sample.sharpness;
            stats.min_sharpness = stats.min_sharpness.min(sample.sharpness);
            stats.max_sharpness = stats.max_sharpness.max(sample.sharpness);
            stats.avg_brightness += sample.brightness;
            stats.min_brightness = stats.min_brightness.min(sample.brightness);
            stats.max_brightness = stats.max_brightness.max(sample.brightness);
        }
        stats.avg_sharpness /= n;
        stats.avg_brightness /= n;

        Some(stats)
    }

    /// Single-line rolling status, rewritten in place with `\r`
    pub fn display_status_line(
        &self,
        now: DateTime<Local>,
        capture_success: bool,
        error_msg: &str,
        timing: Option<&TimingReadout>,
    ) {
        let mut line = format!(
            "\r[{}] Capture #{:04} | Elapsed: {:.1}h",
            now.format("%H:%M:%S"),
            self.capture_count,
            self.elapsed_hours()
        );

        if let Some(remaining) = self.get_remaining_time() {
            line.push_str(&format!(
                " | Remaining: {:.1}h",
                remaining.as_secs_f64() / 3600.0
            ));
        }

        if capture_success {
            if let Some(quality) = self.last_quality {
                line.push_str(&format!(
                    " | Sharpness: {:.1} | Brightness: {:.1}",
                    quality.sharpness, quality.brightness
                ));
            }
        }

        match timing {
            Some(timing) if timing.time_until_next > 0.0 => {
                line.push_str(&format!(
                    " | Next: {} ({:.0}s) | Drift: {:.1}%",
                    self.get_next_capture_time().format("%H:%M:%S"),
                    timing.time_until_next,
                    timing.drift_percentage
                ));
            }
            Some(timing) => {
                line.push_str(&format!(" | Next: NOW | Drift: {:.1}%", timing.drift_percentage));
            }
            None => {
                let until = self.get_time_until_next();
                if until > 0.0 {
                    line.push_str(&format!(
                        " | Next: {} ({:.0}s)",
                        self.get_next_capture_time().format("%H:%M:%S"),
                        until
                    ));
                } else {
                    line.push_str(" | Next: NOW");
                }
            }
        }

        if !error_msg.is_empty() {
            line.push_str(&format!(" | {}", error_msg));
        }

        if self.dry_run {
            line.push_str(" | [DRY RUN]");
        }

        print!("{:<120}", line);
        let _ = std::io::stdout().flush();
    }

    /// Block summary printed every 10th capture
    pub fn display_periodic_summary(&self, now: DateTime<Local>, timing: Option<&TimingReadout>) {
        if self.capture_count == 0 || self.capture_count % 10 != 0 {
            return;
        }

        let elapsed_hours = self.elapsed_hours();
        let avg_interval = if self.capture_count > 0 {
            elapsed_hours * 3600.0 / self.capture_count as f64
        } else {
            0.0
        };

        println!(
            "\n\n=== Progress Summary (Capture #{}) ===",
            self.capture_count
        );
        println!("Time: {}", now.format("%Y-%m-%d %H:%M:%S"));
        println!("Elapsed: {:.2} hours", elapsed_hours);
        match timing {
            Some(timing) => println!(
                "Average interval: {:.1} seconds | Timing: {:.1}s avg | Drift: {:.1}%",
                avg_interval, timing.avg_interval, timing.drift_percentage
            ),
            None => println!("Average interval: {:.1} seconds", avg_interval),
        }

        if let Some(stats) = self.get_quality_statistics() {
            println!(
                "Quality Statistics (last {} captures):",
                self.quality_history.len()
            );
            println!(
                "  Sharpness: {:.1} avg ({:.1}-{:.1})",
                stats.avg_sharpness, stats.min_sharpness, stats.max_sharpness
            );
            println!(
                "  Brightness: {:.1} avg ({:.1}-{:.1})",
                stats.avg_brightness, stats.min_brightness, stats.max_brightness
            );
        }

        if self.verbose {
            println!("Output directory: {}", self.output_dir);
            println!("Interval: {} seconds", self.interval_seconds);
            match self.get_remaining_time() {
                Some(remaining) => println!(
                    "Duration: {} hours ({:.1}h remaining)",
                    self.duration_hours,
                    remaining.as_secs_f64() / 3600.0
                ),
                None => println!("Duration: Indefinite"),
            }
        }

        println!("{}", "=".repeat(60));
    }

    /// Printed once when the run ends, whatever the reason
    pub fn display_final_summary(&self, output_dir: &Path) {
        let total_secs = self.get_elapsed_time().as_secs_f64();
        let avg_interval = if self.capture_count > 0 {
            total_secs / self.capture_count as f64
        } else {
            0.0
        };

        println!("\n\n=== Final Timelapse Summary ===");
        println!("Total captures: {}", self.capture_count);
        println!("Total time: {:.2} hours", total_secs / 3600.0);
        println!("Average interval: {:.1} seconds", avg_interval);
        println!("Output directory: {}", output_dir.display());

        if let Some(stats) = self.get_quality_statistics() {
            println!("\nQuality Summary:");
            println!(
                "  Sharpness: {:.1} average ({:.1}-{:.1} range)",
                stats.avg_sharpness, stats.min_sharpness, stats.max_sharpness
            );
            println!(
                "  Brightness: {:.1} average ({:.1}-{:.1} range)",
                stats.avg_brightness, stats.min_brightness, stats.max_brightness
            );
        }

        println!("{}", "=".repeat(40));
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PilapseConfig;

    fn sample_metrics(sharpness: f64, brightness: f64) -> QualityMetrics {
        QualityMetrics {
            sharpness_score: sharpness,
            brightness_value: brightness,
            contrast: 0.0,
            overexposed_percent: 0.0,
            underexposed_percent: 0.0,
            dynamic_range: 0.0,
            frame_hash: String::new(),
        }
    }

    fn monitor_with_duration(duration_hours: f64) -> StatusMonitor {
        let mut config = PilapseConfig::default();
        config.timelapse.duration_hours = duration_hours;
        StatusMonitor::new(&config, false)
    }

    #[test]
    fn test_quality_history_is_bounded_to_fifty() {
        let mut monitor = monitor_with_duration(1.0);

        for n in 1..=51u64 {
            monitor.update_capture(n, Some(&sample_metrics(n as f64, 50.0)));
        }

        assert_eq!(monitor.quality_history.len(), QUALITY_HISTORY_LIMIT);
        // The first sample (sharpness 1.0) was evicted by the 51st update
        let stats = monitor.get_quality_statistics().unwrap();
        assert_eq!(stats.min_sharpness, 2.0);
        assert_eq!(stats.max_sharpness, 51.0);
    }

    #[test]
    fn test_quality_statistics_empty_history() {
        let monitor = monitor_with_duration(1.0);
        assert!(monitor.get_quality_statistics().is_none());
    }

    #[test]
    fn test_quality_statistics_values() {
        let mut monitor = monitor_with_duration(1.0);
        monitor.update_capture(1, Some(&sample_metrics(10.0, 50.0)));
        monitor.update_capture(2, Some(&sample_metrics(15.0, 60.0)));
        monitor.update_capture(3, Some(&sample_metrics(12.0, 55.0)));

        let stats = monitor.get_quality_statistics().unwrap();
        assert!((stats.avg_sharpness - 12.333333).abs() < 1e-3);
        assert_eq!(stats.min_sharpness, 10.0);
        assert_eq!(stats.max_sharpness, 15.0);
        assert!((stats.avg_brightness - 55.0).abs() < 1e-9);
        assert_eq!(stats.min_brightness, 50.0);
        assert_eq!(stats.max_brightness, 60.0);
    }

    #[test]
    fn test_indefinite_run_has_no_end_time() {
        let monitor = monitor_with_duration(0.0);
        assert!(monitor.end_time().is_none());
        assert!(monitor.get_remaining_time().is_none());
    }

    #[test]
    fn test_finite_run_has_end_time_and_remaining() {
        let monitor = monitor_with_duration(2.0);
        assert!(monitor.end_time().is_some());

        let remaining = monitor.get_remaining_time().unwrap();
        let remaining_hours = remaining.as_secs_f64() / 3600.0;
        assert!(remaining_hours > 1.9 && remaining_hours <= 2.0);
    }

    #[test]
    fn test_next_capture_time_advances_with_updates() {
        let mut monitor = monitor_with_duration(1.0);
        let first_next = monitor.get_next_capture_time();

        monitor.update_capture(1, None);
        let second_next = monitor.get_next_capture_time();
        assert!(second_next >= first_next);

        // Next capture is one interval after the last capture
        let until = monitor.get_time_until_next();
        assert!(until > 0.0 && until <= 30.0);
    }

    #[test]
    fn test_update_without_metrics_keeps_history_empty() {
        let mut monitor = monitor_with_duration(1.0);
        monitor.update_capture(1, None);

        assert_eq!(monitor.capture_count(), 1);
        assert!(monitor.get_quality_statistics().is_none());
    }
}
