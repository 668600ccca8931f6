//! Region-of-interest mask derivation.
//!
//! [`auto_mask`] combines semantic parse labels with a pose-derived
//! bounding clip.  When either input is degraded it falls back to a fixed
//! geometric template positioned by relative body proportions — derivation
//! never fails, it only gets coarser.  [`manual_mask`] thresholds a
//! caller-supplied grayscale raster.
//!
//! Contract: every returned [`Mask`] is exactly the size of its source
//! frame and strictly binary.

use image::imageops::{self, FilterType};
use image::GrayImage;
use tracing::debug;

use drape_core::services::{LabelMap, PoseEstimate, keypoint, parse_label};
use drape_core::types::{Mask, NormalizedFrame, Region, StageResult};

/// Parse labels contributing to each region's mask.
pub const UPPER_LABELS: &[u8] = &[
    parse_label::UPPER_CLOTHES,
    parse_label::DRESS,
    parse_label::COAT,
    parse_label::JUMPSUIT,
    parse_label::LEFT_ARM,
    parse_label::RIGHT_ARM,
];

pub const LOWER_LABELS: &[u8] = &[
    parse_label::PANTS,
    parse_label::SKIRT,
    parse_label::JUMPSUIT,
    parse_label::LEFT_LEG,
    parse_label::RIGHT_LEG,
];

pub const FULL_LABELS: &[u8] = &[
    parse_label::UPPER_CLOTHES,
    parse_label::DRESS,
    parse_label::COAT,
    parse_label::JUMPSUIT,
    parse_label::PANTS,
    parse_label::SKIRT,
    parse_label::LEFT_ARM,
    parse_label::RIGHT_ARM,
    parse_label::LEFT_LEG,
    parse_label::RIGHT_LEG,
];

/// Fractional padding applied around the pose-derived clip band.
const POSE_CLIP_MARGIN: f32 = 0.08;

/// Derive the region mask from parsing + pose, falling back to the
/// geometric template when either input is degraded.
pub fn auto_mask(
    frame: &NormalizedFrame,
    parsing: &StageResult<LabelMap>,
    pose: &StageResult<PoseEstimate>,
    region: Region,
) -> Mask {
    let (w, h) = frame.target_size();
    if parsing.degraded || pose.degraded {
        debug!(?region, "mask inputs degraded, using geometric template");
        return template_mask((w, h), region, &pose.payload);
    }

    let labels = match region {
        Region::Upper => UPPER_LABELS,
        Region::Lower => LOWER_LABELS,
        Region::Full => FULL_LABELS,
    };
    let mut raster = parsing.payload.select(labels);

    if let Some((min_x, min_y, max_x, max_y)) = pose_clip_band(&pose.payload, region) {
        clip_outside(&mut raster, (w, h), (min_x, min_y, max_x, max_y));
    }

    let mask = Mask::from_gray(&raster, 127);
    if mask.coverage() == 0.0 {
        // Labels and pose disagreed so hard that nothing survived; a blank
        // mask would make generation a no-op.
        debug!(?region, "semantic mask empty, using geometric template");
        return template_mask((w, h), region, &pose.payload);
    }
    mask
}

/// Threshold a caller-supplied grayscale raster into a frame-sized binary
/// mask.  The raster is resized to the frame first (nearest neighbour, to
/// keep edges hard).
pub fn manual_mask(user_mask: &GrayImage, frame: &NormalizedFrame, threshold: u8) -> Mask {
    let (w, h) = frame.target_size();
    let sized = if user_mask.dimensions() == (w, h) {
        user_mask.clone()
    } else {
        imageops::resize(user_mask, w, h, FilterType::Nearest)
    };
    Mask::from_gray(&sized, threshold)
}

/// Fixed geometric template positioned by relative body proportions.
///
/// The fractions come from the default upper-body rectangle of the
/// reference mask path ((200, 100)–(568, 600) on a 768×1024 canvas); the
/// vertical band shifts to the pose's neck/hip lines when those keypoints
/// are visible.
pub fn template_mask(size: (u32, u32), region: Region, pose: &PoseEstimate) -> Mask {
    let (w, h) = size;
    let neck_y = pose.get(keypoint::NECK).map(|kp| kp.y);
    let hip_y = match (pose.get(keypoint::RIGHT_HIP), pose.get(keypoint::LEFT_HIP)) {
        (Some(r), Some(l)) => Some((r.y + l.y) / 2.0),
        (Some(kp), None) | (None, Some(kp)) => Some(kp.y),
        (None, None) => None,
    };

    let (x0, y0, x1, y1) = match region {
        Region::Upper => (
            0.26,
            neck_y.unwrap_or(0.10),
            0.74,
            hip_y.unwrap_or(0.59),
        ),
        Region::Lower => (0.28, hip_y.unwrap_or(0.45), 0.72, 0.95),
        Region::Full => (0.22, neck_y.unwrap_or(0.08), 0.78, 0.95),
    };

    let mut raster = GrayImage::new(w, h);
    let px0 = (x0 * w as f32) as u32;
    let py0 = (y0 * h as f32) as u32;
    let px1 = ((x1 * w as f32) as u32).min(w);
    let py1 = ((y1 * h as f32) as u32).min(h);
    for y in py0..py1 {
        for x in px0..px1 {
            raster.put_pixel(x, y, image::Luma([255]));
        }
    }
    Mask::from_gray(&raster, 127)
}

/// Grayscale preview of the masked region: person luminance outside the
/// mask, black inside.  Shipped alongside results for diagnostics.
pub fn diagnostic_overlay(frame: &NormalizedFrame, mask: &Mask) -> GrayImage {
    let (w, h) = frame.target_size();
    GrayImage::from_fn(w, h, |x, y| {
        if mask.get(x, y) {
            image::Luma([0])
        } else {
            let px = frame.canvas.get_pixel(x, y).0;
            // Integer Rec.601 luma.
            let luma =
                (299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32) / 1000;
            image::Luma([luma as u8])
        }
    })
}

/// Vertical band (with margin) the mask may occupy, from pose keypoints.
fn pose_clip_band(pose: &PoseEstimate, region: Region) -> Option<(f32, f32, f32, f32)> {
    let indices: &[usize] = match region {
        Region::Upper => &[
            keypoint::NECK,
            keypoint::RIGHT_SHOULDER,
            keypoint::LEFT_SHOULDER,
            keypoint::RIGHT_WRIST,
            keypoint::LEFT_WRIST,
            keypoint::RIGHT_HIP,
            keypoint::LEFT_HIP,
        ],
        Region::Lower => &[
            keypoint::RIGHT_HIP,
            keypoint::LEFT_HIP,
            keypoint::RIGHT_KNEE,
            keypoint::LEFT_KNEE,
            keypoint::RIGHT_ANKLE,
            keypoint::LEFT_ANKLE,
        ],
        Region::Full => &[
            keypoint::NECK,
            keypoint::RIGHT_SHOULDER,
            keypoint::LEFT_SHOULDER,
            keypoint::RIGHT_WRIST,
            keypoint::LEFT_WRIST,
            keypoint::RIGHT_ANKLE,
            keypoint::LEFT_ANKLE,
        ],
    };
    let (min_x, min_y, max_x, max_y) = pose.bounding_box(indices)?;
    Some((
        (min_x - POSE_CLIP_MARGIN).max(0.0),
        (min_y - POSE_CLIP_MARGIN).max(0.0),
        (max_x + POSE_CLIP_MARGIN).min(1.0),
        (max_y + POSE_CLIP_MARGIN).min(1.0),
    ))
}

fn clip_outside(raster: &mut GrayImage, size: (u32, u32), band: (f32, f32, f32, f32)) {
    let (w, h) = size;
    let px0 = (band.0 * w as f32) as u32;
    let py0 = (band.1 * h as f32) as u32;
    let px1 = ((band.2 * w as f32) as u32).min(w.saturating_sub(1));
    let py1 = ((band.3 * h as f32) as u32).min(h.saturating_sub(1));
    for (x, y, px) in raster.enumerate_pixels_mut() {
        if x < px0 || x > px1 || y < py0 || y > py1 {
            px.0[0] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drape_core::geometry::normalize;
    use drape_core::services::parse_label;
    use image::RgbImage;

    fn frame(tw: u32, th: u32) -> NormalizedFrame {
        let source = RgbImage::from_pixel(tw / 2, th / 2, image::Rgb([90, 120, 60]));
        normalize(&source, (tw, th)).expect("normalize")
    }

    fn parsing_with_upper_band(w: u32, h: u32) -> LabelMap {
        let mut raster = GrayImage::new(w, h);
        for y in h / 5..h / 2 {
            for x in w / 4..3 * w / 4 {
                raster.put_pixel(x, y, image::Luma([parse_label::UPPER_CLOTHES]));
            }
        }
        LabelMap::new(raster)
    }

    #[test]
    fn auto_mask_is_frame_sized_and_binary() {
        let frame = frame(96, 128);
        let (w, h) = frame.target_size();
        let parsing = StageResult::fresh(parsing_with_upper_band(w, h));
        let pose = StageResult::fresh(PoseEstimate::canonical());
        let mask = auto_mask(&frame, &parsing, &pose, Region::Upper);
        assert_eq!(mask.dimensions(), (w, h));
        assert!(
            mask.as_image()
                .pixels()
                .all(|px| px.0[0] == 0 || px.0[0] == 255)
        );
        assert!(mask.coverage() > 0.0);
    }

    #[test]
    fn degraded_parsing_falls_back_to_template() {
        let frame = frame(96, 128);
        let (w, h) = frame.target_size();
        let parsing = StageResult::degraded(LabelMap::empty(w, h));
        let pose = StageResult::degraded(PoseEstimate::canonical());
        let mask = auto_mask(&frame, &parsing, &pose, Region::Upper);
        let expected = template_mask((w, h), Region::Upper, &PoseEstimate::canonical());
        assert_eq!(mask, expected);
        assert!(mask.coverage() > 0.0);
    }

    #[test]
    fn empty_semantic_mask_falls_back_to_template() {
        // Fresh inputs, but no garment labels anywhere in the map.
        let frame = frame(96, 128);
        let (w, h) = frame.target_size();
        let parsing = StageResult::fresh(LabelMap::empty(w, h));
        let pose = StageResult::fresh(PoseEstimate::canonical());
        let mask = auto_mask(&frame, &parsing, &pose, Region::Upper);
        assert!(mask.coverage() > 0.0);
    }

    #[test]
    fn template_tracks_pose_proportions() {
        let pose = PoseEstimate::canonical();
        let mask = template_mask((768, 1024), Region::Upper, &pose);
        let bbox = mask.bounding_box().expect("template selects pixels");
        // Vertical band follows the canonical neck (0.18) and hips (0.52).
        assert_eq!(bbox.y, (0.18f32 * 1024.0) as u32);
        assert_eq!(bbox.y + bbox.height, (0.52f32 * 1024.0) as u32);
    }

    #[test]
    fn lower_region_selects_leg_labels() {
        let frame = frame(96, 128);
        let (w, h) = frame.target_size();
        let mut raster = GrayImage::new(w, h);
        for y in (6 * h / 10)..(9 * h / 10) {
            for x in w / 3..2 * w / 3 {
                raster.put_pixel(x, y, image::Luma([parse_label::PANTS]));
            }
        }
        let parsing = StageResult::fresh(LabelMap::new(raster));
        let pose = StageResult::fresh(PoseEstimate::canonical());
        let mask = auto_mask(&frame, &parsing, &pose, Region::Lower);
        let bbox = mask.bounding_box().expect("pants selected");
        assert!(bbox.y >= h / 2);
    }

    #[test]
    fn manual_mask_resizes_to_frame() {
        let frame = frame(96, 128);
        let mut user = GrayImage::new(10, 10);
        for y in 0..5 {
            for x in 0..10 {
                user.put_pixel(x, y, image::Luma([200]));
            }
        }
        let mask = manual_mask(&user, &frame, 0);
        assert_eq!(mask.dimensions(), frame.target_size());
        assert!(mask.get(48, 10));
        assert!(!mask.get(48, 120));
    }

    #[test]
    fn diagnostic_overlay_blacks_out_masked_region() {
        let frame = frame(96, 128);
        let mask = template_mask(frame.target_size(), Region::Upper, &PoseEstimate::canonical());
        let overlay = diagnostic_overlay(&frame, &mask);
        assert_eq!(overlay.dimensions(), frame.target_size());
        let bbox = mask.bounding_box().unwrap();
        assert_eq!(overlay.get_pixel(bbox.x + 1, bbox.y + 1).0[0], 0);
        assert_ne!(overlay.get_pixel(0, 0).0[0], 0);
    }
}
