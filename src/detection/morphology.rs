use image::{DynamicImage, GrayImage, Luma, Rgb};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::morphology;

use crate::error::{HexError, Result};

pub const DEFAULT_KERNEL_SIZE: u32 = 3;

/// Largest kernel accepted; the dilation radius is stored as a `u8`.
pub const MAX_KERNEL_SIZE: u32 = 101;

/// Thicken dark line-art strokes by dilating them with a square kernel.
///
/// Pixels that the dilation newly covers take the mean colour of the original
/// strokes; every other pixel is copied through. Repeated application keeps
/// thickening, so the pipeline runs this at most once per image.
pub fn thicken(image: &DynamicImage, kernel_size: u32) -> Result<DynamicImage> {
    validate_kernel_size(kernel_size)?;

    let rgb = image.to_rgb8();
    let gray = image.to_luma8();

    let Some(lines) = line_mask(&gray) else {
        return Ok(DynamicImage::ImageRgb8(rgb));
    };

    let radius = (kernel_size / 2) as u8;
    if radius == 0 {
        return Ok(DynamicImage::ImageRgb8(rgb));
    }
    let dilated = morphology::dilate(&lines, Norm::LInf, radius);

    let stroke = mean_stroke_color(&rgb, &lines);
    let mut out = rgb;
    for (x, y, covered) in dilated.enumerate_pixels() {
        if covered[0] > 0 && lines.get_pixel(x, y)[0] == 0 {
            out.put_pixel(x, y, stroke);
        }
    }

    Ok(DynamicImage::ImageRgb8(out))
}

pub fn validate_kernel_size(kernel_size: u32) -> Result<()> {
    if kernel_size == 0 {
        return Err(HexError::invalid_parameter("kernel size must be positive"));
    }
    if kernel_size % 2 == 0 {
        return Err(HexError::invalid_parameter(format!(
            "kernel size must be odd, got {}",
            kernel_size
        )));
    }
    if kernel_size > MAX_KERNEL_SIZE {
        return Err(HexError::invalid_parameter(format!(
            "kernel size {} exceeds maximum of {}",
            kernel_size, MAX_KERNEL_SIZE
        )));
    }
    Ok(())
}

/// Binary mask of stroke pixels (255) using Otsu's level.
///
/// Returns `None` for flat images, which have no strokes to thicken.
fn line_mask(gray: &GrayImage) -> Option<GrayImage> {
    let (min, max) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if min >= max {
        return None;
    }

    // imageproc thresholds treat values above the level as foreground,
    // so strokes are everything at or below it.
    let level = otsu_level(gray);
    let mut mask = GrayImage::new(gray.width(), gray.height());
    let mut any = false;
    for (x, y, p) in gray.enumerate_pixels() {
        if p[0] <= level {
            mask.put_pixel(x, y, Luma([255]));
            any = true;
        }
    }

    any.then_some(mask)
}

fn mean_stroke_color(rgb: &image::RgbImage, lines: &GrayImage) -> Rgb<u8> {
    let mut sum = [0u64; 3];
    let mut count = 0u64;
    for (x, y, p) in lines.enumerate_pixels() {
        if p[0] > 0 {
            let px = rgb.get_pixel(x, y);
            for c in 0..3 {
                sum[c] += px[c] as u64;
            }
            count += 1;
        }
    }
    if count == 0 {
        return Rgb([0, 0, 0]);
    }
    Rgb([
        (sum[0] / count) as u8,
        (sum[1] / count) as u8,
        (sum[2] / count) as u8,
    ])
}
