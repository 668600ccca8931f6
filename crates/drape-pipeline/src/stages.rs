//! Sequential preprocessing pipeline with per-stage graceful degradation.
//!
//! Stages run strictly in order against the normalized person frame; later
//! stages may consume earlier outputs (pose-map synthesis reads pose and
//! parsing, parsing feeds mask derivation downstream).
//!
//! # Degradation policy
//!
//! A failing optional stage is caught, logged, and substituted with its
//! fallback output (`degraded = true`); execution continues.  A failing
//! *required* stage aborts the whole request with
//! [`TryOnError::StageFailed`] — a load-bearing input must never be
//! silently replaced with a low-confidence substitute.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use tracing::{debug, error, warn};

use drape_core::error::{Result, TryOnError};
use drape_core::services::{
    self, LabelMap, ParsingService, PoseEstimate, PoseService, parse_label,
};
use drape_core::types::{NormalizedFrame, StageResult};

/// Accumulated preprocessing outputs for one request.
#[derive(Debug)]
pub struct PreprocessContext {
    pub frame: NormalizedFrame,
    pub pose: Option<StageResult<PoseEstimate>>,
    pub parsing: Option<StageResult<LabelMap>>,
    pub pose_map: Option<StageResult<RgbImage>>,
}

impl PreprocessContext {
    fn new(frame: NormalizedFrame) -> PreprocessContext {
        PreprocessContext {
            frame,
            pose: None,
            parsing: None,
            pose_map: None,
        }
    }

    /// Names of stages whose outputs are degraded fallbacks.
    pub fn degraded_stages(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.pose.as_ref().is_some_and(|r| r.degraded) {
            names.push(POSE_STAGE);
        }
        if self.parsing.as_ref().is_some_and(|r| r.degraded) {
            names.push(PARSING_STAGE);
        }
        if self.pose_map.as_ref().is_some_and(|r| r.degraded) {
            names.push(POSE_MAP_STAGE);
        }
        names
    }
}

pub const POSE_STAGE: &str = "pose-estimation";
pub const PARSING_STAGE: &str = "body-parsing";
pub const POSE_MAP_STAGE: &str = "pose-map";

/// One step of the preprocessing pipeline.
#[async_trait]
pub trait PreprocessStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a failure of this stage aborts the request.
    fn required(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &mut PreprocessContext) -> Result<()>;

    /// Produce the degraded substitute after a non-required failure.
    fn fallback(&self, ctx: &mut PreprocessContext);
}

/// Runs the ordered stage list with the degradation policy above.
pub struct StagePipeline {
    stages: Vec<Box<dyn PreprocessStage>>,
}

impl StagePipeline {
    pub fn new(stages: Vec<Box<dyn PreprocessStage>>) -> StagePipeline {
        StagePipeline { stages }
    }

    /// The standard pose → parsing → pose-map chain.
    pub fn standard(
        pose: Arc<dyn PoseService>,
        parsing: Arc<dyn ParsingService>,
        require_pose: bool,
        require_parsing: bool,
    ) -> StagePipeline {
        StagePipeline::new(vec![
            Box::new(PoseStage { service: pose, required: require_pose }),
            Box::new(ParsingStage { service: parsing, required: require_parsing }),
            Box::new(PoseMapStage),
        ])
    }

    pub async fn run(&self, frame: NormalizedFrame) -> Result<PreprocessContext> {
        let mut ctx = PreprocessContext::new(frame);
        for stage in &self.stages {
            let started = Instant::now();
            match stage.run(&mut ctx).await {
                Ok(()) => {
                    debug!(
                        stage = stage.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "stage complete"
                    );
                }
                Err(err) if stage.required() => {
                    error!(stage = stage.name(), error = %err, "required stage failed");
                    return Err(TryOnError::StageFailed {
                        stage: stage.name(),
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(stage = stage.name(), error = %err, "stage degraded, using fallback");
                    stage.fallback(&mut ctx);
                }
            }
        }
        Ok(ctx)
    }
}

/// Pose estimation against the normalized person frame.
pub struct PoseStage {
    pub service: Arc<dyn PoseService>,
    pub required: bool,
}

#[async_trait]
impl PreprocessStage for PoseStage {
    fn name(&self) -> &'static str {
        POSE_STAGE
    }

    fn required(&self) -> bool {
        self.required
    }

    async fn run(&self, ctx: &mut PreprocessContext) -> Result<()> {
        let estimate = self.service.estimate(&ctx.frame.canvas).await?;
        ctx.pose = Some(StageResult::fresh(estimate));
        Ok(())
    }

    fn fallback(&self, ctx: &mut PreprocessContext) {
        ctx.pose = Some(StageResult::degraded(PoseEstimate::canonical()));
    }
}

/// Body parsing against the normalized person frame.
pub struct ParsingStage {
    pub service: Arc<dyn ParsingService>,
    pub required: bool,
}

#[async_trait]
impl PreprocessStage for ParsingStage {
    fn name(&self) -> &'static str {
        PARSING_STAGE
    }

    fn required(&self) -> bool {
        self.required
    }

    async fn run(&self, ctx: &mut PreprocessContext) -> Result<()> {
        let map = self.service.parse(&ctx.frame.canvas).await?;
        if map.dimensions() != ctx.frame.target_size() {
            return Err(TryOnError::ServiceUnavailable {
                service: "body-parsing",
                reason: format!(
                    "label map {:?} does not match frame {:?}",
                    map.dimensions(),
                    ctx.frame.target_size()
                ),
            });
        }
        ctx.parsing = Some(StageResult::fresh(map));
        Ok(())
    }

    fn fallback(&self, ctx: &mut PreprocessContext) {
        let (w, h) = ctx.frame.target_size();
        ctx.parsing = Some(StageResult::degraded(LabelMap::empty(w, h)));
    }
}

/// Pose-map synthesis: renders parse-region colors plus the skeleton into
/// the structured conditioning raster generative backends consume.
///
/// Consumes the pose and parsing outputs; both are always present by the
/// time this stage runs (fresh or fallback).  With two degraded inputs the
/// render collapses to the silhouette template, and the stage result is
/// marked degraded whenever either input was.
pub struct PoseMapStage;

#[async_trait]
impl PreprocessStage for PoseMapStage {
    fn name(&self) -> &'static str {
        POSE_MAP_STAGE
    }

    async fn run(&self, ctx: &mut PreprocessContext) -> Result<()> {
        let (w, h) = ctx.frame.target_size();
        let pose = ctx.pose.as_ref().ok_or(TryOnError::StageFailed {
            stage: POSE_MAP_STAGE,
            reason: "pose stage did not run".into(),
        })?;
        let parsing = ctx.parsing.as_ref().ok_or(TryOnError::StageFailed {
            stage: POSE_MAP_STAGE,
            reason: "parsing stage did not run".into(),
        })?;

        let degraded = pose.degraded || parsing.degraded;
        let map = if pose.degraded && parsing.degraded {
            silhouette_template(w, h)
        } else {
            render_pose_map(w, h, &pose.payload, &parsing.payload, parsing.degraded)
        };
        ctx.pose_map = Some(if degraded {
            StageResult::degraded(map)
        } else {
            StageResult::fresh(map)
        });
        Ok(())
    }

    fn fallback(&self, ctx: &mut PreprocessContext) {
        let (w, h) = ctx.frame.target_size();
        ctx.pose_map = Some(StageResult::degraded(silhouette_template(w, h)));
    }
}

/// Region colors for the parse-based portion of the pose map.
const PART_COLORS: &[(u8, Rgb<u8>)] = &[
    (parse_label::UPPER_CLOTHES, Rgb([255, 0, 0])),
    (parse_label::DRESS, Rgb([0, 255, 0])),
    (parse_label::COAT, Rgb([0, 0, 255])),
    (parse_label::JUMPSUIT, Rgb([255, 255, 0])),
    (parse_label::LEFT_ARM, Rgb([255, 128, 0])),
    (parse_label::RIGHT_ARM, Rgb([0, 255, 128])),
    (parse_label::HAIR, Rgb([255, 128, 128])),
    (parse_label::FACE, Rgb([128, 255, 128])),
    (parse_label::PANTS, Rgb([128, 0, 128])),
    (parse_label::SKIRT, Rgb([0, 128, 128])),
    (parse_label::LEFT_LEG, Rgb([64, 64, 64])),
    (parse_label::RIGHT_LEG, Rgb([192, 192, 192])),
];

fn render_pose_map(
    w: u32,
    h: u32,
    pose: &PoseEstimate,
    parsing: &LabelMap,
    skip_parsing: bool,
) -> RgbImage {
    let mut map = RgbImage::new(w, h);

    if !skip_parsing {
        for (x, y, px) in map.enumerate_pixels_mut() {
            let label = parsing.label_at(x, y);
            if let Some((_, color)) = PART_COLORS.iter().find(|(l, _)| *l == label) {
                *px = *color;
            }
        }
    }

    for &(a, b) in services::SKELETON {
        if let (Some(p), Some(q)) = (pose.get(a), pose.get(b)) {
            draw_limb(
                &mut map,
                (p.x * w as f32, p.y * h as f32),
                (q.x * w as f32, q.y * h as f32),
            );
        }
    }
    map
}

/// Proportional human silhouette, the no-data substitute.
fn silhouette_template(w: u32, h: u32) -> RgbImage {
    let mut map = RgbImage::new(w, h);
    fill_rect(&mut map, 0.42, 0.06, 0.58, 0.18, Rgb([255, 255, 255])); // head
    fill_rect(&mut map, 0.33, 0.18, 0.67, 0.55, Rgb([128, 128, 255])); // torso
    fill_rect(&mut map, 0.24, 0.20, 0.33, 0.52, Rgb([255, 128, 0])); // right arm
    fill_rect(&mut map, 0.67, 0.20, 0.76, 0.52, Rgb([0, 255, 128])); // left arm
    fill_rect(&mut map, 0.36, 0.55, 0.64, 0.92, Rgb([128, 0, 128])); // legs
    map
}

fn fill_rect(map: &mut RgbImage, x0: f32, y0: f32, x1: f32, y1: f32, color: Rgb<u8>) {
    let (w, h) = map.dimensions();
    let px0 = (x0 * w as f32) as u32;
    let py0 = (y0 * h as f32) as u32;
    let px1 = ((x1 * w as f32) as u32).min(w);
    let py1 = ((y1 * h as f32) as u32).min(h);
    for y in py0..py1 {
        for x in px0..px1 {
            map.put_pixel(x, y, color);
        }
    }
}

/// Thick white line between two pixel positions (integer Bresenham).
fn draw_limb(map: &mut RgbImage, from: (f32, f32), to: (f32, f32)) {
    let (w, h) = map.dimensions();
    let (mut x0, mut y0) = (from.0 as i64, from.1 as i64);
    let (x1, y1) = (to.0 as i64, to.1 as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        for oy in -1..=1i64 {
            for ox in -1..=1i64 {
                let (px, py) = (x0 + ox, y0 + oy);
                if px >= 0 && py >= 0 && (px as u32) < w && (py as u32) < h {
                    map.put_pixel(px as u32, py as u32, Rgb([255, 255, 255]));
                }
            }
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}
