use crate::error::EvaluationError;
use image::GrayImage;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Brightness below this is reported as very dark
pub const BRIGHTNESS_DARK_THRESHOLD: f64 = 30.0;
/// Brightness above this is reported as very bright
pub const BRIGHTNESS_BRIGHT_THRESHOLD: f64 = 220.0;

/// Gray levels above 250 count as overexposed, below 5 as underexposed
const OVEREXPOSED_LEVEL: u8 = 250;
const UNDEREXPOSED_LEVEL: u8 = 5;

/// Per-frame quality scores computed from a saved capture.
///
/// Sharpness is the variance of a 4-neighbour 3x3 Laplacian over the 8-bit
/// grayscale image; brightness is the mean gray level in [0, 255].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QualityMetrics {
    pub sharpness_score: f64,
    pub brightness_value: f64,
    pub contrast: f64,
    pub overexposed_percent: f64,
    pub underexposed_percent: f64,
    pub dynamic_range: f64,
    pub frame_hash: String,
}

/// Evaluate all quality metrics for an image with a single read + decode.
///
/// Never panics on bad input; a missing or undecodable file comes back as a
/// typed error so one bad frame cannot abort a long run.
pub fn evaluate_image_quality(path: &Path) -> Result<QualityMetrics, EvaluationError> {
    let bytes = std::fs::read(path).map_err(|source| EvaluationError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;

    let frame_hash = {
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    };

    let gray = image::load_from_memory(&bytes)
        .map_err(|e| EvaluationError::Decode {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?
        .to_luma8();

    let sharpness_score = laplacian_variance(&gray);
    let stats = intensity_stats(&gray);

    Ok(QualityMetrics {
        sharpness_score,
        brightness_value: stats.mean,
        contrast: stats.std_dev,
        overexposed_percent: stats.overexposed_percent,
        underexposed_percent: stats.underexposed_percent,
        dynamic_range: stats.dynamic_range,
        frame_hash,
    })
}

/// Focus measure: variance of the Laplacian. Higher means sharper.
pub fn calculate_sharpness(path: &Path) -> Result<f64, EvaluationError> {
    let gray = load_gray(path)?;
    Ok(laplacian_variance(&gray))
}

/// Mean gray pixel intensity in [0, 255]. Higher means brighter.
pub fn calculate_brightness(path: &Path) -> Result<f64, EvaluationError> {
    let gray = load_gray(path)?;
    Ok(intensity_stats(&gray).mean)
}

/// Warnings for frames captured outside the usable exposure band
pub fn brightness_warnings(brightness: f64) -> Vec<&'static str> {
    let mut warnings = Vec::new();

    if brightness < BRIGHTNESS_DARK_THRESHOLD {
        warnings.push("image is very dark (brightness < 30)");
    } else if brightness > BRIGHTNESS_BRIGHT_THRESHOLD {
        warnings.push("image is very bright (brightness > 220)");
    }

    warnings
}

fn load_gray(path: &Path) -> Result<GrayImage, EvaluationError> {
    let bytes = std::fs::read(path).map_err(|source| EvaluationError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(image::load_from_memory(&bytes)
        .map_err(|e| EvaluationError::Decode {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?
        .to_luma8())
}

/// Variance of the 3x3 Laplacian (kernel 0,1,0 / 1,-4,1 / 0,1,0) over the
/// interior pixels, accumulated in f64. Images too small for the kernel
/// score 0.
fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let n = ((width - 2) as f64) * ((height - 2) as f64);
    let mut sum = 0.0;
    let mut sum_sq = 0.0;

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let center = gray.get_pixel(x, y)[0] as f64;
            let lap = gray.get_pixel(x, y - 1)[0] as f64
                + gray.get_pixel(x, y + 1)[0] as f64
                + gray.get_pixel(x - 1, y)[0] as f64
                + gray.get_pixel(x + 1, y)[0] as f64
                - 4.0 * center;
            sum += lap;
            sum_sq += lap * lap;
        }
    }

    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

struct IntensityStats {
    mean: f64,
    std_dev: f64,
    overexposed_percent: f64,
    underexposed_percent: f64,
    dynamic_range: f64,
}

fn intensity_stats(gray: &GrayImage) -> IntensityStats {
    let pixels = gray.as_raw();
    if pixels.is_empty() {
        return IntensityStats {
            mean: 0.0,
            std_dev: 0.0,
            overexposed_percent: 0.0,
            underexposed_percent: 0.0,
            dynamic_range: 0.0,
        };
    }

    let n = pixels.len() as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut min = u8::MAX;
    let mut max = u8::MIN;
    let mut overexposed = 0usize;
    let mut underexposed = 0usize;

    for &p in pixels {
        let v = p as f64;
        sum += v;
        sum_sq += v * v;
        min = min.min(p);
        max = max.max(p);
        if p > OVEREXPOSED_LEVEL {
            overexposed += 1;
        }
        if p < UNDEREXPOSED_LEVEL {
            underexposed += 1;
        }
    }

    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);

    IntensityStats {
        mean,
        std_dev: variance.sqrt(),
        overexposed_percent: overexposed as f64 / n * 100.0,
        underexposed_percent: underexposed as f64 / n * 100.0,
        dynamic_range: (max - min) as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::path::PathBuf;

    fn write_gray_png(dir: &Path, name: &str, make: impl Fn(u32, u32) -> u8) -> PathBuf {
        let img = GrayImage::from_fn(64, 48, |x, y| Luma([make(x, y)]));
        let path = dir.join(name);
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_uniform_image_scores() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_gray_png(dir.path(), "flat.png", |_, _| 128);

        let metrics = evaluate_image_quality(&path).unwrap();
        assert_eq!(metrics.sharpness_score, 0.0);
        assert!((metrics.brightness_value - 128.0).abs() < 1e-9);
        assert_eq!(metrics.contrast, 0.0);
        assert_eq!(metrics.dynamic_range, 0.0);
        assert_eq!(metrics.overexposed_percent, 0.0);
        assert_eq!(metrics.underexposed_percent, 0.0);
    }

    #[test]
    fn test_checkerboard_is_sharper_than_flat() {
        let dir = tempfile::tempdir().unwrap();
        let flat = write_gray_png(dir.path(), "flat.png", |_, _| 100);
        let checker = write_gray_png(dir.path(), "checker.png", |x, y| {
            if (x + y) % 2 == 0 {
                0
            } else {
                255
            }
        });

        let flat_sharpness = calculate_sharpness(&flat).unwrap();
        let checker_sharpness = calculate_sharpness(&checker).unwrap();
        assert_eq!(flat_sharpness, 0.0);
        assert!(checker_sharpness > 1000.0);
    }

    #[test]
    fn test_brightness_matches_mean() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_gray_png(dir.path(), "half.png", |x, _| if x < 32 { 0 } else { 200 });

        let brightness = calculate_brightness(&path).unwrap();
        assert!((brightness - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let result = evaluate_image_quality(Path::new("/nonexistent/frame.jpg"));
        assert!(matches!(result, Err(EvaluationError::Unreadable { .. })));
    }

    #[test]
    fn test_non_image_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_an_image.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        let result = evaluate_image_quality(&path);
        assert!(matches!(result, Err(EvaluationError::Decode { .. })));

        let result = calculate_sharpness(&path);
        assert!(matches!(result, Err(EvaluationError::Decode { .. })));
    }

    #[test]
    fn test_exposure_extremes() {
        let dir = tempfile::tempdir().unwrap();
        let blown = write_gray_png(dir.path(), "blown.png", |_, _| 255);

        let metrics = evaluate_image_quality(&blown).unwrap();
        assert_eq!(metrics.overexposed_percent, 100.0);
        assert_eq!(metrics.underexposed_percent, 0.0);
    }

    #[test]
    fn test_brightness_warning_thresholds() {
        assert_eq!(
            brightness_warnings(10.0),
            vec!["image is very dark (brightness < 30)"]
        );
        assert_eq!(
            brightness_warnings(240.0),
            vec!["image is very bright (brightness > 220)"]
        );
        assert!(brightness_warnings(128.0).is_empty());
        assert!(brightness_warnings(30.0).is_empty());
        assert!(brightness_warnings(220.0).is_empty());
    }

    #[test]
    fn test_frame_hash_is_stable_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_gray_png(dir.path(), "hash.png", |x, y| ((x * y) % 251) as u8);

        let first = evaluate_image_quality(&path).unwrap();
        let second = evaluate_image_quality(&path).unwrap();
        assert_eq!(first.frame_hash, second.frame_hash);
        assert_eq!(first.frame_hash.len(), 64);
        assert!(first.frame_hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
