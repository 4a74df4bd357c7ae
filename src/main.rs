use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{ensure, Context, Result};
use clap::{ArgAction, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use sewage_seg_rs::{
    ingest, ConfidenceThreshold, DetectionResponse, DetectorConfig, SewageDetector,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(version, about = "Detect sewage infrastructure in aerial imagery", long_about = None)]
struct Cli {
    /// Image file, or directory searched recursively for images
    input: PathBuf,

    #[arg(default_value = "output")]
    output_dir: PathBuf,

    /// TOML configuration; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    model_path: Option<PathBuf>,

    /// Confidence threshold in (0, 1)
    #[arg(short, long)]
    threshold: Option<f32>,

    #[arg(long)]
    tile_size: Option<u32>,

    #[arg(long)]
    tile_workers: Option<usize>,

    #[arg(long)]
    inference_timeout_ms: Option<u64>,

    #[arg(short, long)]
    device_id: Option<i32>,

    /// -v for debug output, -vv for trace
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn detector_config(&self) -> Result<DetectorConfig> {
        let mut config = match &self.config {
            Some(path) => DetectorConfig::from_toml_file(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => DetectorConfig::default(),
        };

        if let Some(path) = &self.model_path {
            config.model.weights_path = path.clone();
        }
        if let Some(threshold) = self.threshold {
            config.default_confidence_threshold = threshold;
        }
        if let Some(size) = self.tile_size {
            config.ingest.tile_size = size;
        }
        if let Some(workers) = self.tile_workers {
            config.supervisor.tile_workers = workers;
        }
        if let Some(timeout) = self.inference_timeout_ms {
            config.supervisor.inference_timeout_ms = timeout;
        }
        if let Some(device_id) = self.device_id {
            config.model.device_id = device_id;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbosity: u8) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) if verbosity == 0 => filter,
        _ => EnvFilter::try_new(match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })?,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr).compact())
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    ensure!(cli.input.exists(), "Input path does not exist");
    let config = cli.detector_config()?;
    let threshold = ConfidenceThreshold::new(config.default_confidence_threshold)?;

    let image_paths = collect_images(&cli.input);
    if image_paths.is_empty() {
        warn!(input = %cli.input.display(), "no supported images found");
        return Ok(());
    }

    let detector = SewageDetector::new(config)?;
    let state = detector.warm_up().await?;
    info!(?state, images = image_paths.len(), "detector ready");

    let progress_bar = ProgressBar::new(image_paths.len() as u64);
    progress_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
        )?
        .progress_chars("#>-"),
    );

    let mut failed = 0usize;
    for path in &image_paths {
        if let Err(e) = process_image(&detector, path, &cli, threshold).await {
            failed += 1;
            progress_bar.suspend(|| warn!(path = %path.display(), error = %e, "skipped image"));
        }
        progress_bar.inc(1);
    }
    progress_bar.finish();

    info!(
        processed = image_paths.len() - failed,
        failed, "all images processed"
    );
    Ok(())
}

fn collect_images(input: &Path) -> Vec<PathBuf> {
    if input.is_file() {
        return vec![input.to_path_buf()];
    }
    WalkDir::new(input)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(ingest::is_supported_declaration)
        })
        .map(|e| e.into_path())
        .collect()
}

async fn process_image(
    detector: &SewageDetector,
    path: &Path,
    cli: &Cli,
    threshold: ConfidenceThreshold,
) -> Result<()> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read image: {}", path.display()))?;
    let name = path.file_name().and_then(|n| n.to_str());
    let detection = detector.detect(&bytes, name, threshold).await?;

    let (mask_path, report_path) = output_paths(path, &cli.input, &cli.output_dir)?;
    detection.mask.save_png(&mask_path)?;

    let response = DetectionResponse::new(
        &detection,
        path.display().to_string(),
        mask_path.display().to_string(),
    );
    let report = serde_json::to_string_pretty(&response)?;
    fs::write(&report_path, report)
        .with_context(|| format!("Failed to write report: {}", report_path.display()))?;
    Ok(())
}

/// `<output>/<relative dir>/<stem>_mask.png` and `<stem>.json`, mirroring the
/// input tree when a directory was given.
fn output_paths(path: &Path, input: &Path, output_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let relative = if input.is_dir() {
        path.strip_prefix(input).unwrap_or(path)
    } else {
        Path::new(path.file_name().context("Input has no file name")?)
    };
    let target = output_dir.join(relative);
    let parent = target.parent().unwrap_or(output_dir);
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let stem = target
        .file_stem()
        .and_then(|s| s.to_str())
        .context("Input has no usable file stem")?;
    Ok((
        parent.join(format!("{stem}_mask.png")),
        parent.join(format!("{stem}.json")),
    ))
}
