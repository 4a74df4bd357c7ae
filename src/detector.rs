use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::DetectorConfig;
use crate::errors::{DetectionError, Result};
use crate::heuristic::HeuristicSegmenter;
use crate::ingest::{self, InputImage, Normalizer, Tile, TileGrid, TileRect};
use crate::mask::ProbabilityMap;
use crate::model::{OnnxModelLoader, PrimarySegmenter};
use crate::postprocess::{self, ProbabilityStitcher};
use crate::result::{ConfidenceThreshold, Detection, DetectionResult, ModelType};
use crate::supervisor::{ModelState, ModelSupervisor};
use crate::traits::ModelLoader;

/// The strategy chosen for one request.
#[derive(Clone)]
pub enum Segmenter {
    Primary(PrimarySegmenter),
    Heuristic(Arc<HeuristicSegmenter>),
}

impl Segmenter {
    pub const fn model_type(&self) -> ModelType {
        match self {
            Self::Primary(_) => ModelType::Primary,
            Self::Heuristic(_) => ModelType::Fallback,
        }
    }
}

/// Entry point of the engine: bytes in, mask and statistics out.
///
/// One detector serves any number of concurrent requests. It owns the model
/// supervisor, so the learned model is loaded at most once per process.
pub struct SewageDetector<L: ModelLoader + 'static = OnnxModelLoader> {
    config: Arc<DetectorConfig>,
    supervisor: Arc<ModelSupervisor<L>>,
    heuristic: Arc<HeuristicSegmenter>,
    tile_permits: Arc<Semaphore>,
    gate: Arc<InferenceGate>,
}

impl SewageDetector<OnnxModelLoader> {
    /// Detector backed by the ONNX weights named in `config.model`.
    pub fn new(config: DetectorConfig) -> Result<Self> {
        let loader = OnnxModelLoader::new(config.model.clone(), config.ingest.tile_size);
        Self::with_loader(config, loader)
    }
}

impl<L: ModelLoader + 'static> SewageDetector<L> {
    pub fn with_loader(config: DetectorConfig, loader: L) -> Result<Self> {
        config.validate()?;
        let supervisor = ModelSupervisor::new(loader, config.supervisor.clone());
        Ok(Self {
            heuristic: Arc::new(HeuristicSegmenter::new(config.heuristic.clone())),
            tile_permits: Arc::new(Semaphore::new(config.supervisor.tile_workers)),
            gate: Arc::new(InferenceGate::new()),
            supervisor: Arc::new(supervisor),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ModelSupervisor<L> {
        &self.supervisor
    }

    /// Load the model now instead of on the first request.
    pub async fn warm_up(&self) -> Result<ModelState> {
        let supervisor = Arc::clone(&self.supervisor);
        run_blocking("model warm-up", move || {
            supervisor.acquire();
            supervisor.state()
        })
        .await
    }

    /// Detect sewage infrastructure in an encoded image.
    ///
    /// Only bad input ([`DetectionError::InvalidImage`]) or a broken internal
    /// invariant ([`DetectionError::PostProcessing`]) fails a request; model
    /// problems degrade to the heuristic detector and show up as
    /// [`ModelType::Fallback`].
    pub async fn detect(
        &self,
        bytes: &[u8],
        declared: Option<&str>,
        threshold: ConfidenceThreshold,
    ) -> Result<Detection> {
        let started = Instant::now();
        let config = Arc::clone(&self.config);
        let owned = bytes.to_vec();
        let declared = declared.map(str::to_owned);
        let image = run_blocking("decode", move || {
            ingest::decode(&owned, declared.as_deref(), &config.ingest)
        })
        .await??;
        let image = Arc::new(image);
        let (width, height) = image.dimensions();

        let segmenter = self.select_segmenter().await?;
        debug!(strategy = ?segmenter.model_type(), width, height, "strategy selected");
        let (probabilities, model_type) = match segmenter {
            Segmenter::Primary(primary) => self.run_primary(primary, Arc::clone(&image)).await?,
            Segmenter::Heuristic(heuristic) => {
                let image = Arc::clone(&image);
                let map = run_blocking("fallback scoring", move || heuristic.score(&image.pixels))
                    .await?;
                (map, ModelType::Fallback)
            }
        };

        let config = Arc::clone(&self.config);
        let (result, mask) = run_blocking("post-processing", move || {
            let mask = postprocess::binarize(&probabilities, threshold.get(), &config.postprocess);
            let result = DetectionResult::from_mask(
                &mask,
                (width, height),
                threshold,
                model_type,
                config.postprocess.noise_floor,
            )?;
            Ok::<_, DetectionError>((result, mask))
        })
        .await??;

        info!(
            width,
            height,
            model_type = ?result.model_type,
            detected_pixels = result.detected_pixels,
            coverage = result.coverage_percentage,
            detected = result.sewage_lines_detected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "detection finished"
        );

        Ok(Detection {
            result,
            mask,
            width,
            height,
        })
    }

    async fn select_segmenter(&self) -> Result<Segmenter> {
        let supervisor = Arc::clone(&self.supervisor);
        let handle = run_blocking("model acquisition", move || supervisor.acquire()).await?;
        let model = &self.config.model;
        Ok(match handle {
            Some(handle) => Segmenter::Primary(PrimarySegmenter::new(
                handle,
                model.layout,
                model.output_activation,
            )),
            None => Segmenter::Heuristic(Arc::clone(&self.heuristic)),
        })
    }

    /// Tile the image, run the model on every tile and stitch the results.
    /// Tiles the model fails on are scored by the heuristic instead, which
    /// makes the whole request [`ModelType::Fallback`].
    async fn run_primary(
        &self,
        primary: PrimarySegmenter,
        image: Arc<InputImage>,
    ) -> Result<(ProbabilityMap, ModelType)> {
        let tile_size = primary.input_size();
        let overlap = self.config.ingest.tile_overlap.min(tile_size.saturating_sub(1));
        let (width, height) = image.dimensions();
        let grid = TileGrid::plan(width, height, tile_size, overlap);
        debug!(tiles = grid.len(), tile_size, overlap, "tiling image");

        let job = Arc::new(TileJob {
            image,
            primary,
            heuristic: Arc::clone(&self.heuristic),
            supervisor: Arc::clone(&self.supervisor),
            gate: Arc::clone(&self.gate),
            normalizer: Normalizer::from_config(&self.config.ingest, self.config.model.layout),
            tile_size,
            deadline: self.config.supervisor.inference_timeout(),
        });

        let mut tasks = JoinSet::new();
        for rect in grid.rects() {
            let job = Arc::clone(&job);
            let permits = Arc::clone(&self.tile_permits);
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| DetectionError::post_processing("tile scheduling", e.to_string()))?;
                let (map, model_type) = job.process(rect).await?;
                Ok::<_, DetectionError>((rect, map, model_type))
            });
        }

        let mut maps = Vec::with_capacity(grid.len());
        let mut model_type = ModelType::Primary;
        while let Some(joined) = tasks.join_next().await {
            let (rect, map, tile_type) = joined
                .map_err(|e| DetectionError::post_processing("tile task", e.to_string()))??;
            if tile_type == ModelType::Fallback {
                model_type = ModelType::Fallback;
            }
            maps.push((rect, map));
        }

        let stitched =
            run_blocking("stitching", move || ProbabilityStitcher::stitch(width, height, maps))
                .await??;
        Ok((stitched, model_type))
    }
}

/// Admits one inference at a time to the accelerator.
///
/// A tile's deadline starts once it holds the gate, so time spent queued
/// behind other tiles never counts against the model. The pass travels into
/// the blocking inference and is released only when the model returns, even
/// if the tile has already given up on it.
struct InferenceGate {
    slot: Arc<Semaphore>,
    /// Ticket of the pass currently held, counting from 1.
    holder: AtomicU64,
    /// Ticket of the last pass whose inference outlived its deadline.
    overrun: AtomicU64,
}

struct GatePass {
    ticket: u64,
    _permit: OwnedSemaphorePermit,
}

impl InferenceGate {
    fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
            holder: AtomicU64::new(0),
            overrun: AtomicU64::new(0),
        }
    }

    /// Wait for the accelerator as long as it keeps making progress.
    ///
    /// `None` means the current holder is stuck past its own deadline. The
    /// wait is re-checked every `patience`.
    async fn enter(&self, patience: Duration) -> Result<Option<GatePass>> {
        let acquire = Arc::clone(&self.slot).acquire_owned();
        tokio::pin!(acquire);
        loop {
            tokio::select! {
                biased;
                permit = &mut acquire => {
                    let permit = permit
                        .map_err(|e| DetectionError::post_processing("inference gate", e.to_string()))?;
                    let ticket = self.holder.fetch_add(1, Ordering::AcqRel) + 1;
                    return Ok(Some(GatePass { ticket, _permit: permit }));
                }
                () = tokio::time::sleep(patience) => {
                    if self.is_stuck() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn mark_overrun(&self, pass_ticket: u64) {
        self.overrun.store(pass_ticket, Ordering::Release);
    }

    fn is_stuck(&self) -> bool {
        let holder = self.holder.load(Ordering::Acquire);
        holder != 0 && self.overrun.load(Ordering::Acquire) == holder
    }
}

/// Everything one tile task needs, shared across the tasks of a request.
struct TileJob<L: ModelLoader + 'static> {
    image: Arc<InputImage>,
    primary: PrimarySegmenter,
    heuristic: Arc<HeuristicSegmenter>,
    supervisor: Arc<ModelSupervisor<L>>,
    gate: Arc<InferenceGate>,
    normalizer: Normalizer,
    tile_size: u32,
    deadline: Duration,
}

impl<L: ModelLoader + 'static> TileJob<L> {
    async fn process(self: Arc<Self>, rect: TileRect) -> Result<(ProbabilityMap, ModelType)> {
        let job = Arc::clone(&self);
        let tile = run_blocking("tile extraction", move || {
            Tile::extract(&job.image, rect, job.tile_size, &job.normalizer)
        })
        .await??;
        let tile = Arc::new(tile);

        let failure = match self.gate.enter(self.deadline).await? {
            Some(pass) => match self.infer(pass, Arc::clone(&tile)).await {
                Ok(map) => {
                    self.supervisor.record_success();
                    return Ok((map, ModelType::Primary));
                }
                Err(e) => e,
            },
            None => DetectionError::inference(
                "inference gate",
                "model is stuck on an earlier tile past its deadline",
            ),
        };

        warn!(tile = rect.index, error = %failure, "primary inference failed, scoring tile with fallback");
        self.supervisor.record_failure();
        let heuristic = Arc::clone(&self.heuristic);
        let map = run_blocking("fallback scoring", move || heuristic.score(&tile.pixels)).await?;
        Ok((map, ModelType::Fallback))
    }

    /// Run the model on `tile` while holding `pass`; the deadline covers the
    /// inference alone.
    async fn infer(&self, pass: GatePass, tile: Arc<Tile>) -> Result<ProbabilityMap> {
        let ticket = pass.ticket;
        let primary = self.primary.clone();
        let inference = tokio::task::spawn_blocking(move || {
            let scored = primary.infer(&tile);
            drop(pass);
            scored
        });
        match timeout(self.deadline, inference).await {
            Ok(Ok(scored)) => scored,
            Ok(Err(join)) => Err(DetectionError::inference("tile inference", join.to_string())),
            Err(_) => {
                self.gate.mark_overrun(ticket);
                Err(DetectionError::InferenceTimeout {
                    after: self.deadline,
                })
            }
        }
    }
}

/// Run CPU-bound work off the async workers.
async fn run_blocking<T, F>(stage: &'static str, work: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DetectionError::post_processing(stage, e.to_string()))
}
