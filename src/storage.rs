use crate::config::{PilapseConfig, TimelapseConfig};
use crate::error::{PilapseError, Result};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Free-space floor for the capture directory
pub const MIN_CAPTURE_SPACE_MB: u64 = 100;
/// Free-space floor for CSV/log writes
pub const MIN_LOG_SPACE_MB: u64 = 10;

/// Create the output and log directories (parents included), verify they
/// are writable, and check disk space. Called once before a run starts so
/// permission and disk problems surface before the camera is touched.
pub fn ensure_directories(config: &PilapseConfig) -> Result<()> {
    let output_dir = PathBuf::from(&config.timelapse.output_dir);
    let log_dir = PathBuf::from(&config.logging.log_dir);

    for dir in [&output_dir, &log_dir] {
        fs::create_dir_all(dir).map_err(|e| {
            error!("Failed to create directory {}: {}", dir.display(), e);
            e
        })?;
        check_writable(dir)?;
        info!("Directory ensured: {}", dir.display());
    }

    check_disk_space(&output_dir, MIN_CAPTURE_SPACE_MB)?;
    check_disk_space(&log_dir, MIN_LOG_SPACE_MB)?;

    Ok(())
}

/// Resolve the directory captures are written into for this run, creating
/// the daily subdirectory when configured.
pub fn prepare_output_dir(config: &PilapseConfig) -> Result<PathBuf> {
    let output_dir = PathBuf::from(&config.timelapse.output_dir);

    if !output_dir.exists() {
        return Err(PilapseError::system(format!(
            "output directory {} does not exist; run directory preparation first",
            output_dir.display()
        )));
    }

    if config.timelapse.create_daily_dirs {
        let daily = output_dir.join(Local::now().format("%Y-%m-%d").to_string());
        fs::create_dir_all(&daily)?;
        return Ok(daily);
    }

    Ok(output_dir)
}

/// Verify write access by touching and removing a probe file
pub fn check_writable(dir: &Path) -> Result<()> {
    let probe = dir.join(".write_probe");
    fs::write(&probe, b"").map_err(|e| {
        error!("Cannot write to directory {}: {}", dir.display(), e);
        e
    })?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

/// Fail with a DiskSpace error when free space at `dir` is below `min_mb`
pub fn check_disk_space(dir: &Path, min_mb: u64) -> Result<()> {
    let free_mb = match free_space_mb(dir) {
        Ok(mb) => mb,
        Err(e) => {
            warn!(
                "Could not determine free space for {}: {}",
                dir.display(),
                e
            );
            return Ok(());
        }
    };

    if free_mb < min_mb {
        return Err(PilapseError::DiskSpace {
            path: dir.to_path_buf(),
            free_mb,
            required_mb: min_mb,
        });
    }

    debug!("Disk space available at {}: {}MB", dir.display(), free_mb);
    Ok(())
}

#[cfg(unix)]
pub fn free_space_mb(path: &Path) -> std::io::Result<u64> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64) / (1024 * 1024))
}

#[cfg(not(unix))]
pub fn free_space_mb(_path: &Path) -> std::io::Result<u64> {
    // No statvfs here; report unlimited and let writes fail on their own.
    Ok(u64::MAX / (1024 * 1024))
}

/// Generate a capture filename: `prefix_YYYYMMDD_HHMMSS_mmm_nnnnnn.ext`
/// (millisecond timestamp, 6-digit sequence). When `output_dir` is given
/// the name is checked for collisions and made unique.
pub fn generate_filename(
    config: &TimelapseConfig,
    capture_number: u64,
    output_dir: Option<&Path>,
) -> String {
    let format = config
        .image_format
        .to_lowercase()
        .trim_start_matches('.')
        .to_string();

    let base = if config.add_timestamp {
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
        format!(
            "{}_{}_{:06}.{}",
            config.filename_prefix, stamp, capture_number, format
        )
    } else {
        format!("{}_{:06}.{}", config.filename_prefix, capture_number, format)
    };

    match output_dir {
        Some(dir) => unique_filename(base, dir),
        None => base,
    }
}

/// Resolve filename collisions with a `_001`..`_999` counter suffix,
/// falling back to a fresh millisecond timestamp after that.
fn unique_filename(filename: String, output_dir: &Path) -> String {
    if !output_dir.join(&filename).exists() {
        return filename;
    }

    let (stem, extension) = match filename.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), Some(ext.to_string())),
        None => (filename.clone(), None),
    };

    for counter in 1..=999u32 {
        let candidate = match &extension {
            Some(ext) => format!("{}_{:03}.{}", stem, counter, ext),
            None => format!("{}_{:03}", stem, counter),
        };
        if !output_dir.join(&candidate).exists() {
            debug!("Filename collision resolved: {} -> {}", filename, candidate);
            return candidate;
        }
    }

    warn!(
        "Could not generate a unique counter suffix for {}, falling back to timestamp",
        filename
    );
    let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
    match &extension {
        Some(ext) => format!("{}_{}.{}", stem, stamp, ext),
        None => format!("{}_{}", stem, stamp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PilapseConfig;

    fn test_config(root: &Path) -> PilapseConfig {
        let mut config = PilapseConfig::default();
        config.timelapse.output_dir = root.join("out/images").to_string_lossy().into_owned();
        config.logging.log_dir = root.join("logs").to_string_lossy().into_owned();
        config
    }

    #[test]
    fn test_ensure_directories_creates_nested_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        ensure_directories(&config).unwrap();
        assert!(dir.path().join("out/images").is_dir());
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn test_prepare_output_dir_daily_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        ensure_directories(&config).unwrap();

        let daily = prepare_output_dir(&config).unwrap();
        assert!(daily.is_dir());
        let name = daily.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, Local::now().format("%Y-%m-%d").to_string());

        config.timelapse.create_daily_dirs = false;
        let flat = prepare_output_dir(&config).unwrap();
        assert_eq!(flat, PathBuf::from(&config.timelapse.output_dir));
    }

    #[test]
    fn test_prepare_output_dir_requires_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        // ensure_directories not called
        assert!(prepare_output_dir(&config).is_err());
    }

    #[test]
    fn test_generate_filename_shape() {
        let config = PilapseConfig::default().timelapse;
        let name = generate_filename(&config, 42, None);

        assert!(name.starts_with("timelapse_"));
        assert!(name.ends_with("_000042.jpg"));
        // prefix + date + time + millis + sequence
        assert_eq!(name.matches('_').count(), 4);
    }

    #[test]
    fn test_generate_filename_without_timestamp() {
        let mut config = PilapseConfig::default().timelapse;
        config.add_timestamp = false;
        config.image_format = "PNG".to_string();

        assert_eq!(generate_filename(&config, 7, None), "timelapse_000007.png");
    }

    #[test]
    fn test_unique_filename_counter() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("shot_000001.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("shot_000001_001.jpg"), b"x").unwrap();

        let unique = unique_filename("shot_000001.jpg".to_string(), dir.path());
        assert_eq!(unique, "shot_000001_002.jpg");
    }

    #[test]
    fn test_check_disk_space_passes_on_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        // A fresh tempdir should have more than 0 MB free
        check_disk_space(dir.path(), 0).unwrap();
    }
}
