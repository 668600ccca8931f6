//! Core data model: normalized frames, binary masks, stage results, and the
//! request/response shapes that cross the engine boundary.
//!
//! Lifecycles: [`NormalizedFrame`] and [`Mask`] are created per request and
//! discarded after compositing.  Descriptor state lives in the registry and
//! resolver, not here.

use std::time::Duration;

use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TryOnError};

/// Request lifecycle.  States advance strictly forward; FAILED is reachable
/// from NORMALIZED, PREPROCESSED, BACKEND_RESOLVED and GENERATED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    Normalized,
    Preprocessed,
    Masked,
    BackendResolved,
    Generated,
    Composited,
    Done,
    Failed,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Normalized => "normalized",
            Self::Preprocessed => "preprocessed",
            Self::Masked => "masked",
            Self::BackendResolved => "backend_resolved",
            Self::Generated => "generated",
            Self::Composited => "composited",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Garment region targeted by mask derivation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    #[default]
    Upper,
    Lower,
    Full,
}

/// Rectangular window within an image, used for upstream region crops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropWindow {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Canonical fixed-size, aspect-preserving representation of an input image.
///
/// The canvas is exactly the model target size; the source content occupies
/// `content_size` pixels pasted at `paste_offset`.  Invariant: the inverse
/// transform ([`crate::geometry::denormalize`]) reproduces `source_size`
/// exactly.
#[derive(Clone, Debug)]
pub struct NormalizedFrame {
    pub canvas: RgbImage,
    /// Uniform scale factor applied to the source (min of the two axes).
    pub scale: f32,
    /// Dimensions of the scaled content within the canvas.
    pub content_size: (u32, u32),
    /// Top-left corner of the content within the canvas.
    pub paste_offset: (u32, u32),
    /// Pre-normalization source dimensions.
    pub source_size: (u32, u32),
}

impl NormalizedFrame {
    pub fn target_size(&self) -> (u32, u32) {
        self.canvas.dimensions()
    }
}

/// Binary raster, always exactly the dimensions of its source frame, values
/// restricted to {0, 255}.  The constructors enforce binarization so
/// downstream code never re-checks.
#[derive(Clone, Debug, PartialEq)]
pub struct Mask {
    image: GrayImage,
}

impl Mask {
    /// Threshold an arbitrary grayscale raster: strictly above `threshold`
    /// becomes 255, everything else 0.
    pub fn from_gray(gray: &GrayImage, threshold: u8) -> Mask {
        let mut image = gray.clone();
        for px in image.pixels_mut() {
            px.0[0] = if px.0[0] > threshold { 255 } else { 0 };
        }
        Mask { image }
    }

    /// Wrap an already-binary raster, rejecting any other value.
    pub fn from_binary(image: GrayImage) -> Result<Mask> {
        if let Some(px) = image.pixels().find(|px| px.0[0] != 0 && px.0[0] != 255) {
            return Err(TryOnError::InvariantViolation(format!(
                "Mask must be binary, found value {}",
                px.0[0]
            )));
        }
        Ok(Mask { image })
    }

    /// Uniformly filled mask (`on` selects everything).
    pub fn filled(width: u32, height: u32, on: bool) -> Mask {
        let value = if on { 255u8 } else { 0u8 };
        Mask {
            image: GrayImage::from_pixel(width, height, image::Luma([value])),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> bool {
        self.image.get_pixel(x, y).0[0] == 255
    }

    pub fn as_image(&self) -> &GrayImage {
        &self.image
    }

    pub fn into_image(self) -> GrayImage {
        self.image
    }

    /// Fraction of selected pixels, in [0, 1].
    pub fn coverage(&self) -> f32 {
        let (w, h) = self.image.dimensions();
        if w == 0 || h == 0 {
            return 0.0;
        }
        let on = self.image.pixels().filter(|px| px.0[0] == 255).count();
        on as f32 / (w as f32 * h as f32)
    }

    /// Tight bounding box of the selected region, if any pixel is selected.
    pub fn bounding_box(&self) -> Option<CropWindow> {
        let (w, h) = self.image.dimensions();
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0u32, 0u32);
        let mut any = false;
        for (x, y, px) in self.image.enumerate_pixels() {
            if px.0[0] == 255 {
                any = true;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
        any.then(|| CropWindow {
            x: min_x,
            y: min_y,
            width: max_x - min_x + 1,
            height: max_y - min_y + 1,
        })
    }
}

/// Outcome of one preprocessing stage.  A degraded result carries a fallback
/// payload, never an error value.
#[derive(Clone, Debug)]
pub struct StageResult<T> {
    pub payload: T,
    pub degraded: bool,
}

impl<T> StageResult<T> {
    pub fn fresh(payload: T) -> StageResult<T> {
        StageResult { payload, degraded: false }
    }

    pub fn degraded(payload: T) -> StageResult<T> {
        StageResult { payload, degraded: true }
    }
}

/// Everything a generation backend needs for one synthesis call.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub person: NormalizedFrame,
    pub garment: NormalizedFrame,
    pub mask: Mask,
    /// Structured pose conditioning.  Backends that do not accept structured
    /// input ignore or strip this.
    pub pose_map: Option<RgbImage>,
    pub description: String,
    pub seed: u64,
    pub steps: u32,
}

/// One completed synthesis call.
#[derive(Clone, Debug)]
pub struct GenerationResult {
    /// Generated canvas, same dimensions as the request's person canvas.
    pub image: RgbImage,
    /// Grayscale preview of the masked region for diagnostics.
    pub diagnostic_mask: GrayImage,
    pub duration: Duration,
}

/// Caller-facing knobs for a single request.
#[derive(Clone, Debug)]
pub struct TryOnOptions {
    pub auto_mask: bool,
    pub region: Region,
    pub crop_to_region: bool,
    pub steps: u32,
    pub seed: u64,
    /// Caller-supplied mask, used when `auto_mask` is off.  Thresholded and
    /// resized to the frame; absent means full coverage.
    pub manual_mask: Option<GrayImage>,
}

impl Default for TryOnOptions {
    fn default() -> Self {
        Self {
            auto_mask: true,
            region: Region::Upper,
            crop_to_region: false,
            steps: 30,
            seed: 42,
            manual_mask: None,
        }
    }
}

/// Wall-clock breakdown of one request.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct TryOnTiming {
    pub preprocess_ms: u64,
    pub generation_ms: u64,
    pub composite_ms: u64,
    pub total_ms: u64,
}

/// Successful try-on outcome.
#[derive(Clone, Debug)]
pub struct TryOnOutput {
    /// Final image in the original input's coordinate space.
    pub image: RgbImage,
    pub diagnostic_mask: GrayImage,
    pub timing: TryOnTiming,
    pub backend_used: String,
    /// Names of stages that fell back to degraded payloads.
    pub degraded_stages: Vec<&'static str>,
}
