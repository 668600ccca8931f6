//! Contracts for the consumed perception and generation collaborators.
//!
//! The orchestration core never sees model internals.  Pose estimation,
//! body parsing, and generative synthesis are injected behind these traits;
//! only their input/output shapes are specified here.
//!
//! Keypoint coordinates are normalized to `[0, 1]` relative to the frame
//! they were estimated on, so consumers stay resolution-independent.

use async_trait::async_trait;
use image::{GrayImage, RgbImage};

use crate::error::Result;
use crate::types::GenerationRequest;

/// BODY-18 keypoint indices (OpenPose ordering).
pub mod keypoint {
    pub const NOSE: usize = 0;
    pub const NECK: usize = 1;
    pub const RIGHT_SHOULDER: usize = 2;
    pub const RIGHT_ELBOW: usize = 3;
    pub const RIGHT_WRIST: usize = 4;
    pub const LEFT_SHOULDER: usize = 5;
    pub const LEFT_ELBOW: usize = 6;
    pub const LEFT_WRIST: usize = 7;
    pub const RIGHT_HIP: usize = 8;
    pub const RIGHT_KNEE: usize = 9;
    pub const RIGHT_ANKLE: usize = 10;
    pub const LEFT_HIP: usize = 11;
    pub const LEFT_KNEE: usize = 12;
    pub const LEFT_ANKLE: usize = 13;
    pub const RIGHT_EYE: usize = 14;
    pub const LEFT_EYE: usize = 15;
    pub const RIGHT_EAR: usize = 16;
    pub const LEFT_EAR: usize = 17;

    pub const COUNT: usize = 18;
}

/// Skeleton limb connectivity, pairs of [`keypoint`] indices.
pub const SKELETON: &[(usize, usize)] = &[
    (keypoint::NECK, keypoint::RIGHT_SHOULDER),
    (keypoint::NECK, keypoint::LEFT_SHOULDER),
    (keypoint::RIGHT_SHOULDER, keypoint::RIGHT_ELBOW),
    (keypoint::RIGHT_ELBOW, keypoint::RIGHT_WRIST),
    (keypoint::LEFT_SHOULDER, keypoint::LEFT_ELBOW),
    (keypoint::LEFT_ELBOW, keypoint::LEFT_WRIST),
    (keypoint::NECK, keypoint::RIGHT_HIP),
    (keypoint::NECK, keypoint::LEFT_HIP),
    (keypoint::RIGHT_HIP, keypoint::RIGHT_KNEE),
    (keypoint::RIGHT_KNEE, keypoint::RIGHT_ANKLE),
    (keypoint::LEFT_HIP, keypoint::LEFT_KNEE),
    (keypoint::LEFT_KNEE, keypoint::LEFT_ANKLE),
    (keypoint::NECK, keypoint::NOSE),
    (keypoint::NOSE, keypoint::RIGHT_EYE),
    (keypoint::NOSE, keypoint::LEFT_EYE),
    (keypoint::RIGHT_EYE, keypoint::RIGHT_EAR),
    (keypoint::LEFT_EYE, keypoint::LEFT_EAR),
];

/// One detected keypoint in normalized frame coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Keypoint {
        Keypoint { x, y, confidence }
    }

    pub fn is_visible(&self) -> bool {
        self.confidence > 0.0
    }
}

/// Pose estimate for the single person in the frame.
#[derive(Clone, Debug)]
pub struct PoseEstimate {
    pub keypoints: Vec<Keypoint>,
}

impl PoseEstimate {
    pub fn new(keypoints: Vec<Keypoint>) -> PoseEstimate {
        PoseEstimate { keypoints }
    }

    /// Visible keypoint at `index`, if detected.
    pub fn get(&self, index: usize) -> Option<Keypoint> {
        self.keypoints
            .get(index)
            .copied()
            .filter(Keypoint::is_visible)
    }

    /// Normalized bounding box `(min_x, min_y, max_x, max_y)` over the
    /// given keypoint indices, ignoring invisible points.
    pub fn bounding_box(&self, indices: &[usize]) -> Option<(f32, f32, f32, f32)> {
        let mut bounds: Option<(f32, f32, f32, f32)> = None;
        for &i in indices {
            if let Some(kp) = self.get(i) {
                let b = bounds.get_or_insert((kp.x, kp.y, kp.x, kp.y));
                b.0 = b.0.min(kp.x);
                b.1 = b.1.min(kp.y);
                b.2 = b.2.max(kp.x);
                b.3 = b.3.max(kp.y);
            }
        }
        bounds
    }

    /// Canonical standing pose positioned by relative body proportions.
    /// Used as the degraded substitute when estimation is unavailable.
    pub fn canonical() -> PoseEstimate {
        let mut keypoints = vec![Keypoint::default(); keypoint::COUNT];
        let mut put = |index: usize, x: f32, y: f32| {
            keypoints[index] = Keypoint::new(x, y, 0.5);
        };
        put(keypoint::NOSE, 0.50, 0.10);
        put(keypoint::NECK, 0.50, 0.18);
        put(keypoint::RIGHT_SHOULDER, 0.36, 0.20);
        put(keypoint::LEFT_SHOULDER, 0.64, 0.20);
        put(keypoint::RIGHT_ELBOW, 0.30, 0.35);
        put(keypoint::LEFT_ELBOW, 0.70, 0.35);
        put(keypoint::RIGHT_WRIST, 0.28, 0.50);
        put(keypoint::LEFT_WRIST, 0.72, 0.50);
        put(keypoint::RIGHT_HIP, 0.42, 0.52);
        put(keypoint::LEFT_HIP, 0.58, 0.52);
        put(keypoint::RIGHT_KNEE, 0.41, 0.72);
        put(keypoint::LEFT_KNEE, 0.59, 0.72);
        put(keypoint::RIGHT_ANKLE, 0.41, 0.92);
        put(keypoint::LEFT_ANKLE, 0.59, 0.92);
        PoseEstimate { keypoints }
    }
}

/// Semantic parse labels (ATR convention, the subset the engine consumes).
pub mod parse_label {
    pub const BACKGROUND: u8 = 0;
    pub const HAIR: u8 = 2;
    pub const UPPER_CLOTHES: u8 = 5;
    pub const DRESS: u8 = 6;
    pub const COAT: u8 = 7;
    pub const PANTS: u8 = 9;
    pub const JUMPSUIT: u8 = 10;
    pub const SKIRT: u8 = 12;
    pub const FACE: u8 = 13;
    pub const LEFT_ARM: u8 = 14;
    pub const RIGHT_ARM: u8 = 15;
    pub const LEFT_LEG: u8 = 16;
    pub const RIGHT_LEG: u8 = 17;
}

/// Per-pixel semantic label map, same dimensions as its source frame.
#[derive(Clone, Debug)]
pub struct LabelMap {
    labels: GrayImage,
}

impl LabelMap {
    pub fn new(labels: GrayImage) -> LabelMap {
        LabelMap { labels }
    }

    /// All-background map, the degraded substitute when parsing fails.
    pub fn empty(width: u32, height: u32) -> LabelMap {
        LabelMap {
            labels: GrayImage::from_pixel(width, height, image::Luma([parse_label::BACKGROUND])),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.labels.dimensions()
    }

    #[inline]
    pub fn label_at(&self, x: u32, y: u32) -> u8 {
        self.labels.get_pixel(x, y).0[0]
    }

    /// Raster selecting every pixel whose label is in `labels` (255/0).
    pub fn select(&self, labels: &[u8]) -> GrayImage {
        let (w, h) = self.labels.dimensions();
        GrayImage::from_fn(w, h, |x, y| {
            let value = if labels.contains(&self.label_at(x, y)) {
                255
            } else {
                0
            };
            image::Luma([value])
        })
    }
}

/// Pose Estimation Service: image → keypoint list, or error.
#[async_trait]
pub trait PoseService: Send + Sync {
    async fn estimate(&self, frame: &RgbImage) -> Result<PoseEstimate>;
}

/// Body Parsing Service: image → per-pixel label map, or error.
#[async_trait]
pub trait ParsingService: Send + Sync {
    async fn parse(&self, frame: &RgbImage) -> Result<LabelMap>;
}

/// Generative Image Backend transport: structured request → raster, or error.
#[async_trait]
pub trait GenerativeService: Send + Sync {
    async fn synthesize(&self, request: &GenerationRequest) -> Result<RgbImage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invisible_keypoints_are_filtered() {
        let mut keypoints = vec![Keypoint::default(); keypoint::COUNT];
        keypoints[keypoint::NECK] = Keypoint::new(0.5, 0.2, 0.9);
        let pose = PoseEstimate::new(keypoints);
        assert!(pose.get(keypoint::NECK).is_some());
        assert!(pose.get(keypoint::NOSE).is_none());
    }

    #[test]
    fn bounding_box_spans_visible_points() {
        let pose = PoseEstimate::canonical();
        let (min_x, min_y, max_x, max_y) = pose
            .bounding_box(&[
                keypoint::RIGHT_SHOULDER,
                keypoint::LEFT_SHOULDER,
                keypoint::RIGHT_HIP,
                keypoint::LEFT_HIP,
            ])
            .expect("torso box");
        assert!(min_x < max_x && min_y < max_y);
        assert!((min_y - 0.20).abs() < 1e-6);
        assert!((max_y - 0.52).abs() < 1e-6);
    }

    #[test]
    fn canonical_pose_has_no_ear_or_eye_points() {
        let pose = PoseEstimate::canonical();
        assert!(pose.get(keypoint::LEFT_EAR).is_none());
        assert!(pose.get(keypoint::RIGHT_EYE).is_none());
    }

    #[test]
    fn label_selection_is_binary_and_frame_sized() {
        let mut raster = GrayImage::new(4, 4);
        raster.put_pixel(1, 1, image::Luma([parse_label::UPPER_CLOTHES]));
        raster.put_pixel(2, 2, image::Luma([parse_label::PANTS]));
        let map = LabelMap::new(raster);
        let selected = map.select(&[parse_label::UPPER_CLOTHES]);
        assert_eq!(selected.dimensions(), (4, 4));
        assert_eq!(selected.get_pixel(1, 1).0[0], 255);
        assert_eq!(selected.get_pixel(2, 2).0[0], 0);
    }
}
