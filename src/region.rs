use image::{DynamicImage, GenericImageView};
use tracing::instrument;

use crate::{error::Error, OriginalBox, Region, Result};

/// Crops `[start_y, end_y) x [start_x, end_x)` out of the original image.
#[instrument(level = "trace", skip(image))]
pub fn extract_region(image: &DynamicImage, bounds: OriginalBox) -> Result<Region> {
    if bounds.is_empty() {
        return Err(Error::EmptyRegion(bounds));
    }
    let (width, height) = image.dimensions();
    if bounds.end_x > width || bounds.end_y > height {
        return Err(Error::InvalidImage(format!(
            "region {bounds:?} lies outside {width}x{height} image"
        )));
    }
    log::trace!("Slicing subimage to {bounds:?}");
    Ok(Region {
        bounds,
        image: image.crop_imm(
            bounds.start_x,
            bounds.start_y,
            bounds.width(),
            bounds.height(),
        ),
    })
}
