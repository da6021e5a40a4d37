use crate::error::{LogSchemaError, PilapseError, Result};
use crate::quality::{self, QualityMetrics};
use crate::storage::{check_disk_space, MIN_LOG_SPACE_MB};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The pinned CSV schema. Column order is part of the contract: every row
/// ever written to a given file carries exactly these columns, and a
/// mismatch is reported instead of coerced.
pub const CSV_COLUMNS: [&str; 21] = [
    "timestamp",
    "filename",
    "image_path",
    "shot_type",
    "capture_number",
    "resolution",
    "file_size",
    "sharpness_score",
    "brightness_value",
    "brightness_warnings",
    "contrast",
    "overexposed_percent",
    "underexposed_percent",
    "dynamic_range",
    "iso",
    "exposure_mode",
    "frame_hash",
    "timing_interval",
    "timing_drift",
    "timing_accumulated_drift",
    "clock_adjustments",
];

/// Distinguishes scheduled timelapse frames from manually triggered shots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShotType {
    Scheduled,
    Manual,
}

impl ShotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

/// Timing figures for the cycle that produced a capture
#[derive(Debug, Clone, Serialize)]
pub struct TimingSnapshot {
    pub actual_interval: f64,
    pub drift: f64,
    pub accumulated_drift: f64,
    pub clock_adjustments: u32,
}

impl TimingSnapshot {
    pub fn zero() -> Self {
        Self {
            actual_interval: 0.0,
            drift: 0.0,
            accumulated_drift: 0.0,
            clock_adjustments: 0,
        }
    }
}

/// One capture event, immutable once logged
#[derive(Debug, Clone, Serialize)]
pub struct CaptureRecord {
    pub timestamp: DateTime<Local>,
    pub filename: String,
    pub image_path: PathBuf,
    pub shot_type: ShotType,
    pub capture_number: u64,
    pub resolution: (u32, u32),
    pub file_size: u64,
    pub quality: QualityMetrics,
    pub iso: u32,
    pub exposure_mode: String,
    pub timing: TimingSnapshot,
}

impl CaptureRecord {
    /// Project onto the pinned schema, in column order
    fn to_row(&self) -> Vec<String> {
        let warnings = quality::brightness_warnings(self.quality.brightness_value).join("; ");
        vec![
            self.timestamp.to_rfc3339(),
            self.filename.clone(),
            self.image_path.to_string_lossy().into_owned(),
            self.shot_type.as_str().to_string(),
            self.capture_number.to_string(),
            format!("{}x{}", self.resolution.0, self.resolution.1),
            self.file_size.to_string(),
            format!("{:.3}", self.quality.sharpness_score),
            format!("{:.3}", self.quality.brightness_value),
            warnings,
            format!("{:.3}", self.quality.contrast),
            format!("{:.3}", self.quality.overexposed_percent),
            format!("{:.3}", self.quality.underexposed_percent),
            format!("{:.1}", self.quality.dynamic_range),
            self.iso.to_string(),
            self.exposure_mode.clone(),
            self.quality.frame_hash.clone(),
            format!("{:.3}", self.timing.actual_interval),
            format!("{:.3}", self.timing.drift),
            format!("{:.3}", self.timing.accumulated_drift),
            self.timing.clock_adjustments.to_string(),
        ]
    }
}

/// Aggregates computed from the CSV file
#[derive(Debug, Clone, Default)]
pub struct CaptureLogStats {
    pub total_captures: usize,
    pub first_capture: Option<String>,
    pub last_capture: Option<String>,
    pub avg_file_size: f64,
    pub avg_sharpness: f64,
    pub min_sharpness: f64,
    pub max_sharpness: f64,
    pub avg_brightness: f64,
    pub min_brightness: f64,
    pub max_brightness: f64,
}

#[derive(Debug)]
struct LoggerState {
    closed: bool,
}

/// Append-only CSV logger for capture events.
///
/// Rows are serialized to a buffer first and appended to the file in a
/// single write under an exclusive `flock`, so a reader polling the file
/// (the dashboard) never observes a partial row and two writer processes
/// never interleave.
#[derive(Debug)]
pub struct MetricsLogger {
    csv_path: PathBuf,
    log_dir: PathBuf,
    state: Mutex<LoggerState>,
}

impl MetricsLogger {
    /// Create a logger writing `csv_filename` under `log_dir`. If the file
    /// already exists its header must match the pinned schema.
    pub fn new<P: AsRef<Path>>(log_dir: P, csv_filename: &str) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&log_dir)?;

        let csv_path = log_dir.join(csv_filename);
        if csv_path.exists() && std::fs::metadata(&csv_path)?.len() > 0 {
            verify_header(&csv_path)?;
            debug!(
                "Appending to existing metadata log: {}",
                csv_path.display()
            );
        }

        Ok(Self {
            csv_path,
            log_dir,
            state: Mutex::new(LoggerState { closed: false }),
        })
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    /// Append one capture event
    pub fn log_capture_event(&self, record: &CaptureRecord) -> Result<()> {
        self.append_fields(record.to_row())?;
        debug!("Logged capture event: {}", record.filename);
        Ok(())
    }

    /// Append a row from a raw column->value mapping. The key set must
    /// equal the pinned schema exactly; missing or unexpected keys are a
    /// schema violation and nothing is written.
    pub fn append_row(&self, fields: &BTreeMap<String, String>) -> Result<()> {
        let missing: Vec<String> = CSV_COLUMNS
            .iter()
            .filter(|c| !fields.contains_key(**c))
            .map(|c| c.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(LogSchemaError::MissingColumns(missing).into());
        }

        let unexpected: Vec<String> = fields
            .keys()
            .filter(|k| !CSV_COLUMNS.contains(&k.as_str()))
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            return Err(LogSchemaError::UnexpectedColumns(unexpected).into());
        }

        let row = CSV_COLUMNS
            .iter()
            .map(|c| fields[*c].clone())
            .collect::<Vec<_>>();
        self.append_fields(row)
    }

    fn append_fields(&self, row: Vec<String>) -> Result<()> {
        let state = self.state.lock();
        if state.closed {
            return Err(PilapseError::system(
                "metrics logger is closed, cannot append",
            ));
        }

        check_disk_space(&self.log_dir, MIN_LOG_SPACE_MB)?;

        let row_bytes = serialize_row(&row)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_path)?;

        lock_exclusive(&file)?;
        // Lock is held until `file` drops at the end of this scope.

        let mut payload = Vec::with_capacity(row_bytes.len() + 256);
        if file.metadata()?.len() == 0 {
            payload.extend_from_slice(&serialize_row(
                &CSV_COLUMNS.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
            )?);
        }
        payload.extend_from_slice(&row_bytes);

        let mut writer = &file;
        writer.write_all(&payload)?;
        writer.flush()?;

        Ok(())
    }

    /// Read back aggregate statistics from the CSV file
    pub fn read_stats(&self) -> Result<CaptureLogStats> {
        if !self.csv_path.exists() {
            return Ok(CaptureLogStats::default());
        }

        let mut reader = csv::Reader::from_path(&self.csv_path)?;
        let headers = reader.headers()?.clone();
        let timestamp_idx = headers.iter().position(|h| h == "timestamp");
        let sharpness_idx = headers.iter().position(|h| h == "sharpness_score");
        let brightness_idx = headers.iter().position(|h| h == "brightness_value");
        let size_idx = headers.iter().position(|h| h == "file_size");

        let mut stats = CaptureLogStats::default();
        let mut sharpness = Vec::new();
        let mut brightness = Vec::new();
        let mut sizes = Vec::new();

        for record in reader.records() {
            let record = record?;
            stats.total_captures += 1;

            if let Some(ts) = timestamp_idx.and_then(|i| record.get(i)) {
                if stats.first_capture.is_none() {
                    stats.first_capture = Some(ts.to_string());
                }
                stats.last_capture = Some(ts.to_string());
            }
            if let Some(v) = sharpness_idx
                .and_then(|i| record.get(i))
                .and_then(|s| s.parse::<f64>().ok())
            {
                sharpness.push(v);
            }
            if let Some(v) = brightness_idx
                .and_then(|i| record.get(i))
                .and_then(|s| s.parse::<f64>().ok())
            {
                brightness.push(v);
            }
            if let Some(v) = size_idx
                .and_then(|i| record.get(i))
                .and_then(|s| s.parse::<f64>().ok())
            {
                sizes.push(v);
            }
        }

        if !sharpness.is_empty() {
            stats.avg_sharpness = sharpness.iter().sum::<f64>() / sharpness.len() as f64;
            stats.min_sharpness = sharpness.iter().cloned().fold(f64::INFINITY, f64::min);
            stats.max_sharpness = sharpness.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        }
        if !brightness.is_empty() {
            stats.avg_brightness = brightness.iter().sum::<f64>() / brightness.len() as f64;
            stats.min_brightness = brightness.iter().cloned().fold(f64::INFINITY, f64::min);
            stats.max_brightness = brightness.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        }
        if !sizes.is_empty() {
            stats.avg_file_size = sizes.iter().sum::<f64>() / sizes.len() as f64;
        }

        Ok(stats)
    }

    /// Flush and close. Idempotent; appends after cleanup are rejected.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            info!("Metrics logger closed: {}", self.csv_path.display());
        }
    }
}

fn serialize_row(fields: &[String]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    writer
        .into_inner()
        .map_err(|e| PilapseError::system(format!("CSV serialization failed: {}", e)))
}

fn verify_header(csv_path: &Path) -> Result<()> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let found: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let expected: Vec<String> = CSV_COLUMNS.iter().map(|c| c.to_string()).collect();

    if found != expected {
        return Err(LogSchemaError::HeaderMismatch { expected, found }.into());
    }
    Ok(())
}

/// Acquire an exclusive advisory lock, bounded so a stuck peer process
/// cannot stall the capture loop indefinitely
#[cfg(unix)]
fn lock_exclusive(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::WouldBlock {
            return Err(err);
        }
        if std::time::Instant::now() >= deadline {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out waiting for CSV file lock",
            ));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(n: u64) -> CaptureRecord {
        CaptureRecord {
            timestamp: Local::now(),
            filename: format!("timelapse_{:06}.jpg", n),
            image_path: PathBuf::from(format!("/tmp/out/timelapse_{:06}.jpg", n)),
            shot_type: ShotType::Scheduled,
            capture_number: n,
            resolution: (1920, 1080),
            file_size: 1024 * n,
            quality: QualityMetrics {
                sharpness_score: 10.0 + n as f64,
                brightness_value: 100.0,
                contrast: 12.0,
                overexposed_percent: 0.0,
                underexposed_percent: 0.0,
                dynamic_range: 200.0,
                frame_hash: "abc123".to_string(),
            },
            iso: 100,
            exposure_mode: "auto".to_string(),
            timing: TimingSnapshot::zero(),
        }
    }

    fn full_row_map() -> BTreeMap<String, String> {
        CSV_COLUMNS
            .iter()
            .map(|c| (c.to_string(), "0".to_string()))
            .collect()
    }

    #[test]
    fn test_header_written_once_and_rows_append() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path(), "meta.csv").unwrap();

        logger.log_capture_event(&sample_record(1)).unwrap();
        logger.log_capture_event(&sample_record(2)).unwrap();

        let mut reader = csv::Reader::from_path(logger.csv_path()).unwrap();
        let headers: Vec<String> = reader
            .headers()
            .unwrap()
            .iter()
            .map(|h| h.to_string())
            .collect();
        assert_eq!(headers, CSV_COLUMNS.to_vec());

        let rows: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.len(), CSV_COLUMNS.len());
        }
        assert_eq!(rows[0].get(4), Some("1"));
        assert_eq!(rows[1].get(4), Some("2"));
    }

    #[test]
    fn test_missing_column_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path(), "meta.csv").unwrap();

        let mut fields = full_row_map();
        fields.remove("sharpness_score");

        let err = logger.append_row(&fields).unwrap_err();
        match err {
            PilapseError::LogSchema(LogSchemaError::MissingColumns(cols)) => {
                assert_eq!(cols, vec!["sharpness_score".to_string()]);
            }
            other => panic!("expected MissingColumns, got {:?}", other),
        }
        // Nothing written
        assert!(!logger.csv_path().exists());
    }

    #[test]
    fn test_unexpected_column_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path(), "meta.csv").unwrap();

        let mut fields = full_row_map();
        fields.insert("surprise".to_string(), "1".to_string());

        let err = logger.append_row(&fields).unwrap_err();
        match err {
            PilapseError::LogSchema(LogSchemaError::UnexpectedColumns(cols)) => {
                assert_eq!(cols, vec!["surprise".to_string()]);
            }
            other => panic!("expected UnexpectedColumns, got {:?}", other),
        }
    }

    #[test]
    fn test_schema_error_leaves_existing_rows_intact() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path(), "meta.csv").unwrap();
        logger.log_capture_event(&sample_record(1)).unwrap();

        let mut fields = full_row_map();
        fields.remove("timestamp");
        assert!(logger.append_row(&fields).is_err());

        let mut reader = csv::Reader::from_path(logger.csv_path()).unwrap();
        assert_eq!(reader.records().count(), 1);
    }

    #[test]
    fn test_foreign_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.csv");
        std::fs::write(&path, "a,b,c\n1,2,3\n").unwrap();

        let err = MetricsLogger::new(dir.path(), "meta.csv").unwrap_err();
        assert!(matches!(
            err,
            PilapseError::LogSchema(LogSchemaError::HeaderMismatch { .. })
        ));
    }

    #[test]
    fn test_reopen_existing_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        {
            let logger = MetricsLogger::new(dir.path(), "meta.csv").unwrap();
            logger.log_capture_event(&sample_record(1)).unwrap();
            logger.cleanup();
        }
        {
            let logger = MetricsLogger::new(dir.path(), "meta.csv").unwrap();
            let mut manual = sample_record(2);
            manual.shot_type = ShotType::Manual;
            logger.log_capture_event(&manual).unwrap();
        }

        let mut reader =
            csv::Reader::from_path(dir.path().join("meta.csv")).unwrap();
        let rows: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get(3), Some("scheduled"));
        assert_eq!(rows[1].get(3), Some("manual"));
    }

    #[test]
    fn test_concurrent_writers_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        const PER_WRITER: u64 = 25;

        let mut handles = Vec::new();
        for writer_id in 0..2u64 {
            let logger = MetricsLogger::new(&path, "meta.csv").unwrap();
            handles.push(std::thread::spawn(move || {
                for n in 0..PER_WRITER {
                    logger
                        .log_capture_event(&sample_record(writer_id * 1000 + n))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut reader =
            csv::Reader::from_path(path.join("meta.csv")).unwrap();
        let rows: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), (2 * PER_WRITER) as usize);
        for row in &rows {
            assert_eq!(row.len(), CSV_COLUMNS.len());
        }
    }

    #[test]
    fn test_cleanup_is_idempotent_and_closes_writes() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path(), "meta.csv").unwrap();

        logger.cleanup();
        logger.cleanup();

        assert!(logger.log_capture_event(&sample_record(1)).is_err());
    }

    #[test]
    fn test_read_stats_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path(), "meta.csv").unwrap();

        for n in 1..=3 {
            logger.log_capture_event(&sample_record(n)).unwrap();
        }

        let stats = logger.read_stats().unwrap();
        assert_eq!(stats.total_captures, 3);
        assert!((stats.min_sharpness - 11.0).abs() < 1e-9);
        assert!((stats.max_sharpness - 13.0).abs() < 1e-9);
        assert!((stats.avg_sharpness - 12.0).abs() < 1e-9);
        assert!((stats.avg_brightness - 100.0).abs() < 1e-9);
        assert!(stats.first_capture.is_some());
    }

    #[test]
    fn test_read_stats_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path(), "meta.csv").unwrap();

        let stats = logger.read_stats().unwrap();
        assert_eq!(stats.total_captures, 0);
        assert!(stats.first_capture.is_none());
    }
}
