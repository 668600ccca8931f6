//! Invertible aspect-preserving resize and letterbox.
//!
//! [`normalize`] fits a source image entirely within a target canvas,
//! preserving aspect ratio and recording scale + paste offset so that
//! [`denormalize`] can map generated content back to the source's exact
//! pixel dimensions.  Content dimensions are floor-truncated and clamped
//! to at least one pixel per axis, so extreme aspect ratios stay invertible.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

use crate::error::{Result, TryOnError};
use crate::types::{CropWindow, NormalizedFrame};

/// Letterbox fill.  Neutral so the padding does not bias generation.
pub const NEUTRAL_FILL: Rgb<u8> = Rgb([255, 255, 255]);

/// Portrait aspect ratio used by region crops (width : height).
pub const PORTRAIT_RATIO: (u32, u32) = (3, 4);

/// Scale `image` to fit entirely within `target`, centered on a
/// neutral-filled canvas of exactly `target`.
///
/// # Errors
///
/// Returns [`TryOnError::Geometry`] for a zero-area source or target.
pub fn normalize(image: &RgbImage, target: (u32, u32)) -> Result<NormalizedFrame> {
    let (tw, th) = target;
    let (sw, sh) = image.dimensions();
    if tw == 0 || th == 0 {
        return Err(TryOnError::Geometry(format!(
            "target {tw}x{th} has zero area"
        )));
    }
    if sw == 0 || sh == 0 {
        return Err(TryOnError::Geometry(format!(
            "source {sw}x{sh} has zero area"
        )));
    }

    let scale = (tw as f32 / sw as f32).min(th as f32 / sh as f32);
    let cw = ((sw as f32 * scale) as u32).clamp(1, tw);
    let ch = ((sh as f32 * scale) as u32).clamp(1, th);

    let content = imageops::resize(image, cw, ch, FilterType::Lanczos3);
    let paste_offset = ((tw - cw) / 2, (th - ch) / 2);
    let mut canvas = RgbImage::from_pixel(tw, th, NEUTRAL_FILL);
    imageops::overlay(
        &mut canvas,
        &content,
        paste_offset.0 as i64,
        paste_offset.1 as i64,
    );

    Ok(NormalizedFrame {
        canvas,
        scale,
        content_size: (cw, ch),
        paste_offset,
        source_size: (sw, sh),
    })
}

/// Crop `result` back to the content region recorded in `frame`, then
/// rescale to the original source dimensions.  The output has exactly
/// `frame.source_size` dimensions.
///
/// # Errors
///
/// Returns [`TryOnError::Geometry`] if `result` does not match the frame's
/// canvas dimensions.
pub fn denormalize(result: &RgbImage, frame: &NormalizedFrame) -> Result<RgbImage> {
    if result.dimensions() != frame.target_size() {
        let (rw, rh) = result.dimensions();
        let (tw, th) = frame.target_size();
        return Err(TryOnError::Geometry(format!(
            "result canvas {rw}x{rh} does not match normalized frame {tw}x{th}"
        )));
    }

    let (ox, oy) = frame.paste_offset;
    let (cw, ch) = frame.content_size;
    let content = imageops::crop_imm(result, ox, oy, cw, ch).to_image();
    let (sw, sh) = frame.source_size;
    Ok(imageops::resize(&content, sw, sh, FilterType::Lanczos3))
}

/// Center-crop `image` to the given aspect ratio, returning the cropped
/// image together with the crop's window within the source.  Used for
/// region-of-interest crops before normalization; the window is what the
/// compositor pastes back into.
pub fn center_crop_to_ratio(
    image: &RgbImage,
    ratio: (u32, u32),
) -> Result<(RgbImage, CropWindow)> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Err(TryOnError::Geometry(format!("source {w}x{h} has zero area")));
    }
    let (rw, rh) = ratio;
    if rw == 0 || rh == 0 {
        return Err(TryOnError::Geometry(format!("ratio {rw}:{rh} is degenerate")));
    }

    let width = w.min((h * rw / rh).max(1));
    let height = h.min((w * rh / rw).max(1));
    let window = CropWindow {
        x: (w - width) / 2,
        y: (h - height) / 2,
        width,
        height,
    };
    let cropped = imageops::crop_imm(image, window.x, window.y, width, height).to_image();
    Ok((cropped, window))
}
