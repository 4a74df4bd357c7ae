use std::io::Cursor;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use image::{ImageFormat, Rgb, RgbImage};
use sewage_seg_rs::mocks::MockLoader;
use sewage_seg_rs::{
    ConfidenceThreshold, DetectorConfig, ModelState, ModelType, Result, SewageDetector,
};
use tempfile::TempDir;

fn png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        let v = ((x + y) % 256) as u8;
        Rgb([v, v, v])
    });
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_load() -> Result<()> {
    let loader = MockLoader::new(128).with_delay(Duration::from_millis(100));
    let calls = loader.calls();
    let detector = Arc::new(SewageDetector::with_loader(DetectorConfig::default(), loader)?);
    let bytes = Arc::new(png(200, 160));
    let threshold = ConfidenceThreshold::new(0.5)?;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let detector = Arc::clone(&detector);
        let bytes = Arc::clone(&bytes);
        tasks.push(tokio::spawn(async move {
            detector.detect(&bytes, None, threshold).await
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap()?);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(detector.supervisor().load_attempts(), 1);
    assert!(results
        .iter()
        .all(|d| d.result.model_type == ModelType::Primary));
    assert!(results.windows(2).all(|w| w[0].mask == w[1].mask));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_all_fall_back_when_load_fails() -> Result<()> {
    let loader = MockLoader::failing().with_delay(Duration::from_millis(50));
    let calls = loader.calls();
    let detector = Arc::new(SewageDetector::with_loader(DetectorConfig::default(), loader)?);
    let bytes = Arc::new(png(128, 128));
    let threshold = ConfidenceThreshold::new(0.3)?;

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let detector = Arc::clone(&detector);
            let bytes = Arc::clone(&bytes);
            tokio::spawn(async move { detector.detect(&bytes, None, threshold).await })
        })
        .collect();

    for task in tasks {
        let detection = task.await.unwrap()?;
        assert_eq!(detection.result.model_type, ModelType::Fallback);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(detector.supervisor().state(), ModelState::Unavailable);
    Ok(())
}

#[tokio::test]
async fn test_cooldown_lets_a_failed_model_recover() -> Result<()> {
    let mut config = DetectorConfig::default();
    config.supervisor.retry_cooldown_secs = Some(0);
    let detector = SewageDetector::with_loader(config, MockLoader::new(128).fail_first(1))?;
    let bytes = png(150, 150);
    let threshold = ConfidenceThreshold::new(0.5)?;

    let first = detector.detect(&bytes, None, threshold).await?;
    assert_eq!(first.result.model_type, ModelType::Fallback);

    let second = detector.detect(&bytes, None, threshold).await?;
    assert_eq!(second.result.model_type, ModelType::Primary);
    assert_eq!(detector.supervisor().state(), ModelState::Ready);
    Ok(())
}

#[tokio::test]
async fn test_config_file_drives_detector() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("detector.toml");
    std::fs::write(
        &path,
        r#"
        default_confidence_threshold = 0.45

        [supervisor]
        failure_threshold = 5
        tile_workers = 2

        [postprocess]
        erosion_radius = 0
        dilation_radius = 0
        "#,
    )?;

    let config = DetectorConfig::from_toml_file(&path)?;
    assert_eq!(config.supervisor.failure_threshold, 5);
    assert_eq!(config.ingest.tile_size, 128);

    let detector = SewageDetector::with_loader(config, MockLoader::new(128))?;
    let threshold = ConfidenceThreshold::new(detector.config().default_confidence_threshold)?;
    let detection = detector.detect(&png(140, 120), None, threshold).await?;
    assert_eq!(detection.result.model_type, ModelType::Primary);
    assert!((detection.result.confidence_threshold - 0.45).abs() < 1e-6);
    Ok(())
}

#[test]
fn test_missing_config_file_is_a_filesystem_error() {
    let err = DetectorConfig::from_toml_file(std::path::Path::new("no/such/detector.toml"))
        .unwrap_err();
    assert!(matches!(
        err,
        sewage_seg_rs::DetectionError::FileSystem { .. }
    ));
}
