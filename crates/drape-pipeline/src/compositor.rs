//! Maps generated content back onto the original image coordinates.
//!
//! The generator works in the normalized canvas space; the compositor
//! inverts that: extract the content region recorded in the frame, rescale
//! to the pre-normalization size, and — when an upstream region-of-interest
//! crop happened — paste at the crop's location within the original rather
//! than returning the cropped extent.

use image::imageops;
use image::RgbImage;

use drape_core::error::{Result, TryOnError};
use drape_core::geometry::denormalize;
use drape_core::types::{CropWindow, NormalizedFrame};

/// Rebuild the final image in original coordinates.
///
/// `crop` is the window the person image was cropped to before
/// normalization, if any; `original` is always the *uncropped* input.
///
/// # Errors
///
/// Returns [`TryOnError::Geometry`] when the generated canvas does not
/// match the frame, or the crop window does not fit the original.
pub fn composite(
    generated: &RgbImage,
    frame: &NormalizedFrame,
    original: &RgbImage,
    crop: Option<CropWindow>,
) -> Result<RgbImage> {
    let region = denormalize(generated, frame)?;
    match crop {
        None => Ok(region),
        Some(window) => {
            let (ow, oh) = original.dimensions();
            if window.x + window.width > ow || window.y + window.height > oh {
                return Err(TryOnError::Geometry(format!(
                    "crop window {}x{}+{}+{} exceeds original {ow}x{oh}",
                    window.width, window.height, window.x, window.y
                )));
            }
            if region.dimensions() != (window.width, window.height) {
                return Err(TryOnError::Geometry(format!(
                    "denormalized region {:?} does not match crop window {}x{}",
                    region.dimensions(),
                    window.width,
                    window.height
                )));
            }
            let mut out = original.clone();
            imageops::overlay(&mut out, &region, window.x as i64, window.y as i64);
            Ok(out)
        }
    }
}
