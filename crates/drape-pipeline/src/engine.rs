//! Request orchestration — the exposed `generate` operation.
//!
//! One request moves strictly forward through the state machine
//! RECEIVED → NORMALIZED → PREPROCESSED → MASKED → BACKEND_RESOLVED →
//! GENERATED → COMPOSITED → DONE.  Cancellation is checked between stages;
//! a request cancelled before backend resolution needs no rollback (frames
//! and masks are per-request values).  The generation call itself is
//! atomic — a timeout is reported as a one-off backend failure for that
//! call and is **not** memoized against the descriptor.

use std::time::{Duration, Instant};

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use drape_core::error::{Result, TryOnError};
use drape_core::geometry::{center_crop_to_ratio, normalize, PORTRAIT_RATIO};
use drape_core::types::{
    GenerationRequest, Mask, RequestState, TryOnOptions, TryOnOutput, TryOnTiming,
};

use crate::compositor::composite;
use crate::mask::{auto_mask, manual_mask};
use crate::resolver::SynthesisResolver;
use crate::stages::StagePipeline;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Engine-wide configuration, loadable from JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_schema_version")]
    pub config_schema_version: u32,
    /// Model canvas width.
    #[serde(default = "default_target_width")]
    pub target_width: u32,
    /// Model canvas height.
    #[serde(default = "default_target_height")]
    pub target_height: u32,
    /// Wall-clock budget for one generation call.
    #[serde(default = "default_generation_timeout_ms")]
    pub generation_timeout_ms: u64,
    /// Abort instead of degrading when pose estimation fails.
    #[serde(default)]
    pub require_pose: bool,
    /// Abort instead of degrading when body parsing fails.
    #[serde(default)]
    pub require_parsing: bool,
}

fn default_schema_version() -> u32 {
    CONFIG_SCHEMA_VERSION
}

fn default_target_width() -> u32 {
    768
}

fn default_target_height() -> u32 {
    1024
}

fn default_generation_timeout_ms() -> u64 {
    120_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            config_schema_version: CONFIG_SCHEMA_VERSION,
            target_width: default_target_width(),
            target_height: default_target_height(),
            generation_timeout_ms: default_generation_timeout_ms(),
            require_pose: false,
            require_parsing: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(data: &str) -> Result<EngineConfig> {
        let config: EngineConfig = serde_json::from_str(data).map_err(|err| {
            TryOnError::InvariantViolation(format!("Invalid engine config JSON: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &std::path::Path) -> Result<EngineConfig> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            TryOnError::InvariantViolation(format!(
                "Failed to read engine config from {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.config_schema_version != CONFIG_SCHEMA_VERSION {
            return Err(TryOnError::InvariantViolation(format!(
                "Config schema mismatch: expected {}, got {}",
                CONFIG_SCHEMA_VERSION, self.config_schema_version
            )));
        }
        if self.target_width == 0 || self.target_height == 0 {
            return Err(TryOnError::InvariantViolation(format!(
                "Config validation failed: target {}x{} has zero area",
                self.target_width, self.target_height
            )));
        }
        if self.generation_timeout_ms == 0 {
            return Err(TryOnError::InvariantViolation(
                "Config validation failed: generation_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// The orchestration engine: preprocessing pipeline + synthesis cascade.
pub struct TryOnEngine {
    config: EngineConfig,
    pipeline: StagePipeline,
    resolver: SynthesisResolver,
}

impl TryOnEngine {
    pub fn new(
        config: EngineConfig,
        pipeline: StagePipeline,
        resolver: SynthesisResolver,
    ) -> Result<TryOnEngine> {
        config.validate()?;
        Ok(TryOnEngine {
            config,
            pipeline,
            resolver,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &SynthesisResolver {
        &self.resolver
    }

    /// Synthesize `person` wearing `garment`.
    ///
    /// Returns a complete [`TryOnOutput`] or a typed failure; the
    /// unmodified input image is never returned as a successful
    /// generation.
    pub async fn generate(
        &self,
        person: &RgbImage,
        garment: &RgbImage,
        description: &str,
        options: &TryOnOptions,
        cancel: &CancellationToken,
    ) -> Result<TryOnOutput> {
        let total_started = Instant::now();
        let mut state = RequestState::Received;
        debug!(state = state.as_str(), "request accepted");

        // ── Normalize ─────────────────────────────────────────────────
        let (person_source, crop_window) = if options.crop_to_region {
            let (cropped, window) = center_crop_to_ratio(person, PORTRAIT_RATIO)?;
            (cropped, Some(window))
        } else {
            (person.clone(), None)
        };
        let target = (self.config.target_width, self.config.target_height);
        let person_frame = normalize(&person_source, target)?;
        let garment_frame = normalize(garment, target)?;
        state = RequestState::Normalized;
        debug!(
            state = state.as_str(),
            scale = person_frame.scale,
            content_w = person_frame.content_size.0,
            content_h = person_frame.content_size.1,
            "person frame normalized"
        );
        if cancel.is_cancelled() {
            return Err(TryOnError::Cancelled);
        }

        // ── Preprocess ────────────────────────────────────────────────
        let preprocess_started = Instant::now();
        let ctx = self.pipeline.run(person_frame).await?;
        let preprocess_ms = preprocess_started.elapsed().as_millis() as u64;
        state = RequestState::Preprocessed;
        debug!(
            state = state.as_str(),
            degraded = ?ctx.degraded_stages(),
            "preprocessing complete"
        );
        if cancel.is_cancelled() {
            return Err(TryOnError::Cancelled);
        }

        // ── Mask ──────────────────────────────────────────────────────
        let mask = if options.auto_mask {
            let parsing = ctx.parsing.as_ref().ok_or(TryOnError::StageFailed {
                stage: crate::stages::PARSING_STAGE,
                reason: "pipeline produced no parsing output".into(),
            })?;
            let pose = ctx.pose.as_ref().ok_or(TryOnError::StageFailed {
                stage: crate::stages::POSE_STAGE,
                reason: "pipeline produced no pose output".into(),
            })?;
            auto_mask(&ctx.frame, parsing, pose, options.region)
        } else {
            match &options.manual_mask {
                Some(user_mask) => manual_mask(user_mask, &ctx.frame, 0),
                None => {
                    let (w, h) = ctx.frame.target_size();
                    Mask::filled(w, h, true)
                }
            }
        };
        state = RequestState::Masked;
        debug!(state = state.as_str(), coverage = mask.coverage(), "mask ready");

        // ── Resolve backend ───────────────────────────────────────────
        let backend = self.resolver.resolve().await?;
        state = RequestState::BackendResolved;
        debug!(state = state.as_str(), backend = backend.name(), "backend resolved");
        if cancel.is_cancelled() {
            return Err(TryOnError::Cancelled);
        }

        // ── Generate ──────────────────────────────────────────────────
        let pose_map = if backend.accepts_structured_input() {
            ctx.pose_map.as_ref().map(|r| r.payload.clone())
        } else {
            None
        };
        let request = GenerationRequest {
            person: ctx.frame.clone(),
            garment: garment_frame,
            mask,
            pose_map,
            description: description.to_string(),
            seed: options.seed,
            steps: options.steps,
        };

        let timeout = Duration::from_millis(self.config.generation_timeout_ms);
        let generation_started = Instant::now();
        let result = match tokio::time::timeout(timeout, backend.generate(&request)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                error!(backend = backend.name(), error = %err, "generation failed");
                return Err(err);
            }
            Err(_) => {
                // Plausibly transient: fail this call, leave the descriptor
                // eligible for the next request.
                warn!(
                    backend = backend.name(),
                    timeout_ms = self.config.generation_timeout_ms,
                    "generation timed out"
                );
                return Err(TryOnError::GenerationTimeout {
                    backend: backend.name().to_string(),
                    timeout_ms: self.config.generation_timeout_ms,
                });
            }
        };
        let generation_ms = generation_started.elapsed().as_millis() as u64;
        state = RequestState::Generated;
        debug!(state = state.as_str(), elapsed_ms = generation_ms, "generation complete");

        // ── Composite ─────────────────────────────────────────────────
        let composite_started = Instant::now();
        let output_image = composite(&result.image, &ctx.frame, person, crop_window)?;
        let composite_ms = composite_started.elapsed().as_millis() as u64;
        state = RequestState::Composited;
        debug!(state = state.as_str(), "composited onto original");

        let timing = TryOnTiming {
            preprocess_ms,
            generation_ms,
            composite_ms,
            total_ms: total_started.elapsed().as_millis() as u64,
        };
        state = RequestState::Done;
        info!(
            state = state.as_str(),
            backend = backend.name(),
            total_ms = timing.total_ms,
            "try-on complete"
        );

        Ok(TryOnOutput {
            image: output_image,
            diagnostic_mask: result.diagnostic_mask,
            timing,
            backend_used: backend.name().to_string(),
            degraded_stages: ctx.degraded_stages(),
        })
    }
}
