use image::{DynamicImage, Pixel, Rgb};
use ndarray::Array3;
use tracing::instrument;

use crate::{OriginalBox, SurvivingBox};

/// Ratio between the original image and the detector input along each axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    pub factor_x: f32,
    pub factor_y: f32,
    pub original_width: u32,
    pub original_height: u32,
}

impl Scale {
    /// `original` and `resized` are `(width, height)`. Both must be non-zero.
    pub fn between(original: (u32, u32), resized: (u32, u32)) -> Self {
        let (original_width, original_height) = original;
        let (resized_width, resized_height) = resized;
        let factor_x = original_width as f32 / resized_width as f32;
        let factor_y = original_height as f32 / resized_height as f32;
        log::debug!("Rescaling from (w: {resized_width}, h: {resized_height}) to (w: {original_width}, h: {original_height}) with factor ({factor_x}, {factor_y}).");
        Self {
            factor_x,
            factor_y,
            original_width,
            original_height,
        }
    }

    pub fn identity(width: u32, height: u32) -> Self {
        Self::between((width, height), (width, height))
    }

    /// Maps a resized-space box into original pixels, flooring and clamping
    /// every coordinate to the image.
    pub fn rescale(&self, b_box: &SurvivingBox) -> OriginalBox {
        let max_x = self.original_width.saturating_sub(1);
        let max_y = self.original_height.saturating_sub(1);
        OriginalBox {
            start_x: scale_coord(b_box.start_x, self.factor_x, max_x),
            start_y: scale_coord(b_box.start_y, self.factor_y, max_y),
            end_x: scale_coord(b_box.end_x, self.factor_x, max_x),
            end_y: scale_coord(b_box.end_y, self.factor_y, max_y),
        }
    }
}

fn scale_coord(value: i32, factor: f32, max: u32) -> u32 {
    let scaled = (value as f32 * factor).floor();
    if scaled <= 0.0 {
        0
    } else {
        (scaled as u32).min(max)
    }
}

/// Returns a `(3, height, width)` tensor of `pixel * norm - mean * norm` for
/// pixels in `[0, 1]`.
#[instrument(level = "debug", skip(image))]
pub(crate) fn subtract_mean_normalize(
    image: &DynamicImage,
    mean_vals: &[f32; 3],
    norm_vals: &[f32; 3],
) -> Array3<f32> {
    let mut image = image.to_rgb32f();
    let norm = Rgb::<f32>(*norm_vals);
    let mean_vals = Rgb::<f32>(*mean_vals).map2(&norm, |c1, c2| c1 * c2);
    for pixel in image.pixels_mut() {
        *pixel = pixel
            .map2(&norm, |c1, c2| c1 * c2)
            .map2(&mean_vals, |c1, c2| c1 - c2);
    }
    Array3::<f32>::from_shape_fn(
        (3, image.height() as usize, image.width() as usize),
        |(ch, y, x)| image.get_pixel(x as u32, y as u32).channels()[ch],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surviving(start_x: i32, start_y: i32, end_x: i32, end_y: i32) -> SurvivingBox {
        SurvivingBox {
            start_x,
            start_y,
            end_x,
            end_y,
            confidence: 0.9,
            angle: 0.0,
        }
    }

    #[test]
    fn unit_scale_keeps_coordinates() {
        let scale = Scale::identity(320, 320);
        let rescaled = scale.rescale(&surviving(72, 35, 88, 45));
        assert_eq!(
            rescaled,
            OriginalBox {
                start_x: 72,
                start_y: 35,
                end_x: 88,
                end_y: 45
            }
        );
    }

    #[test]
    fn rescale_floors_each_axis_independently() {
        let scale = Scale::between((1000, 480), (320, 320));
        let rescaled = scale.rescale(&surviving(72, 35, 88, 45));
        // 72 * 3.125 = 225, 35 * 1.5 = 52.5, 88 * 3.125 = 275, 45 * 1.5 = 67.5
        assert_eq!(
            rescaled,
            OriginalBox {
                start_x: 225,
                start_y: 52,
                end_x: 275,
                end_y: 67
            }
        );
    }

    #[test]
    fn rescale_clamps_to_image() {
        let scale = Scale::between((640, 640), (320, 320));
        let rescaled = scale.rescale(&surviving(-12, -3, 400, 330));
        assert_eq!(
            rescaled,
            OriginalBox {
                start_x: 0,
                start_y: 0,
                end_x: 639,
                end_y: 639
            }
        );
    }

    #[test]
    fn normalize_produces_channel_first_tensor() {
        let image = DynamicImage::new_rgb8(4, 2);
        let tensor = subtract_mean_normalize(&image, &[0.5, 0.5, 0.5], &[2.0, 2.0, 2.0]);
        assert_eq!(tensor.dim(), (3, 2, 4));
        assert!(tensor.iter().all(|it| (*it + 1.0).abs() < 1e-6));
    }
}
