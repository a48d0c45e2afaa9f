use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Rgb};
use imageproc::distance_transform::Norm;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use imageproc::point::Point;

use crate::error::FeatureError;

pub type Gray8 = ImageBuffer<Luma<u8>, Vec<u8>>;
pub type Gray16 = ImageBuffer<Luma<u16>, Vec<u16>>;
pub type Rgb8 = ImageBuffer<Rgb<u8>, Vec<u8>>;

pub fn new_gray8(width: u32, height: u32) -> Gray8 {
    ImageBuffer::new(width, height)
}

pub fn new_gray16(width: u32, height: u32) -> Gray16 {
    ImageBuffer::new(width, height)
}

pub fn load_gray8(path: &Path) -> Result<Gray8> {
    let img = image::open(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(img.to_luma8())
}

pub fn load_gray16(path: &Path) -> Result<Gray16> {
    let img = image::open(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(img.to_luma16())
}

pub fn save_image<P, C>(img: &ImageBuffer<P, C>, path: &Path) -> Result<()>
where
    P: image::PixelWithColorType,
    C: std::ops::Deref<Target = [P::Subpixel]>,
    [P::Subpixel]: image::EncodableLayout,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    img.save(path).with_context(|| format!("writing {}", path.display()))
}

/// Converts float pixel coordinates to the integer points `draw_polygon_mut`
/// accepts: consecutive duplicates removed, ring left open.
fn polygon_points(points: &[(f64, f64)]) -> Result<Vec<Point<i32>>, FeatureError> {
    let mut pts: Vec<Point<i32>> = Vec::with_capacity(points.len());
    for &(x, y) in points {
        let p = Point::new(x.round() as i32, y.round() as i32);
        if pts.last() != Some(&p) {
            pts.push(p);
        }
    }
    if pts.len() > 1 && pts.first() == pts.last() {
        pts.pop();
    }
    if pts.len() < 3 {
        return Err(FeatureError::Degenerate(pts.len()));
    }
    Ok(pts)
}

/// Scanline fill without anti-aliasing; a degenerate ring is an error the
/// caller logs and skips.
pub fn fill_polygon(img: &mut Gray8, points: &[(f64, f64)], value: u8) -> Result<(), FeatureError> {
    let pts = polygon_points(points)?;
    imageproc::drawing::draw_polygon_mut(img, &pts, Luma([value]));
    Ok(())
}

/// Rasterizes a polyline with the given total thickness into the mask.
pub fn draw_polyline(img: &mut Gray8, points: &[(f64, f64)], thickness: f64, value: u8) {
    let half = (thickness / 2.0).max(0.5);
    let ring = crate::geometry::buffer_polyline(points, half);
    if fill_polygon(img, &ring, value).is_err() {
        // Single-pixel fallback for degenerate lines.
        for &(x, y) in points {
            let (xi, yi) = (x.round() as i64, y.round() as i64);
            if xi >= 0 && yi >= 0 && (xi as u32) < img.width() && (yi as u32) < img.height() {
                img.put_pixel(xi as u32, yi as u32, Luma([value]));
            }
        }
    }
}

fn center_crop<P: image::Pixel>(
    img: &ImageBuffer<P, Vec<P::Subpixel>>,
    out_width: u32,
    out_height: u32,
) -> ImageBuffer<P, Vec<P::Subpixel>>
where
    P: 'static,
{
    let x0 = (img.width() / 2).saturating_sub(out_width / 2);
    let y0 = (img.height() / 2).saturating_sub(out_height / 2);
    imageops::crop_imm(img, x0, y0, out_width, out_height).to_image()
}

/// Rotates the raster by `-angle` degrees about its center, then cuts the
/// central `out_width x out_height` window. Masks use nearest interpolation
/// so they stay binary; elevation data uses bilinear.
pub fn rotate_and_crop8(img: &Gray8, angle: i32, out_width: u32, out_height: u32) -> Gray8 {
    let theta = -(angle as f32).to_radians();
    let rotated = rotate_about_center(img, theta, Interpolation::Nearest, Luma([0u8]));
    center_crop(&rotated, out_width, out_height)
}

pub fn rotate_and_crop16(img: &Gray16, angle: i32, out_width: u32, out_height: u32) -> Gray16 {
    let theta = -(angle as f32).to_radians();
    let rotated = rotate_about_center(img, theta, Interpolation::Bilinear, Luma([0u16]));
    center_crop(&rotated, out_width, out_height)
}

/// Forces the kernel radius odd; zero and below disable the blur.
pub fn effective_blur_radius(radius: i32) -> Option<u32> {
    if radius <= 0 {
        None
    } else if radius % 2 == 0 {
        Some(radius as u32 + 1)
    } else {
        Some(radius as u32)
    }
}

fn sigma_for_kernel(kernel: u32) -> f32 {
    // OpenCV's rule for deriving sigma from an explicit kernel size.
    0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

pub fn gaussian_blur16(img: &Gray16, radius: i32) -> Gray16 {
    match effective_blur_radius(radius) {
        Some(kernel) => imageproc::filter::gaussian_blur_f32(img, sigma_for_kernel(kernel)),
        None => img.clone(),
    }
}

pub fn gaussian_blur8(img: &Gray8, radius: i32) -> Gray8 {
    match effective_blur_radius(radius) {
        Some(kernel) => imageproc::filter::gaussian_blur_f32(img, sigma_for_kernel(kernel)),
        None => img.clone(),
    }
}

/// Blurs the raster but keeps every pixel outside the mask untouched.
pub fn blur_by_mask16(data: &Gray16, mask: &Gray8, radius: i32) -> Gray16 {
    let blurred = gaussian_blur16(data, radius);
    let mut out = data.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        if mask.get_pixel(x, y).0[0] == 255 {
            *pixel = *blurred.get_pixel(x, y);
        }
    }
    out
}

pub fn dilate_mask(mask: &Gray8, kernel: u32, iterations: u32) -> Gray8 {
    if kernel <= 1 {
        return mask.clone();
    }
    let k = (kernel / 2).max(1) as u8;
    let mut out = mask.clone();
    for _ in 0..iterations {
        out = imageproc::morphology::dilate(&out, Norm::LInf, k);
    }
    out
}

pub fn erode_mask(mask: &Gray8, kernel: u32, iterations: u32) -> Gray8 {
    if kernel <= 1 {
        return mask.clone();
    }
    let k = (kernel / 2).max(1) as u8;
    let mut out = mask.clone();
    for _ in 0..iterations {
        out = imageproc::morphology::erode(&out, Norm::LInf, k);
    }
    out
}

/// Blurs only the rim of the masked region: the difference of a dilated and
/// an eroded copy of the mask selects the edge band.
pub fn blur_edges_by_mask16(
    data: &Gray16,
    mask: &Gray8,
    bigger_kernel: u32,
    smaller_kernel: u32,
    iterations: u32,
) -> Gray16 {
    let bigger = dilate_mask(mask, bigger_kernel, iterations);
    let smaller = erode_mask(mask, smaller_kernel, iterations);
    let mut edge = new_gray8(mask.width(), mask.height());
    for (x, y, pixel) in edge.enumerate_pixels_mut() {
        let value = bigger.get_pixel(x, y).0[0].saturating_sub(smaller.get_pixel(x, y).0[0]);
        *pixel = Luma([value]);
    }
    blur_by_mask16(data, &edge, 3)
}

/// Subtracts a constant where the mask is 255, eroding the mask first so the
/// subtraction never touches the outermost masked ring. With `flatten_to`
/// the region is set to that level instead.
pub fn subtract_by_mask(
    data: &mut Gray16,
    mask: &Gray8,
    subtract_by: u16,
    flatten_to: Option<u16>,
) {
    let eroded = erode_mask(mask, 3, 1);
    for (x, y, pixel) in data.enumerate_pixels_mut() {
        if eroded.get_pixel(x, y).0[0] == 255 {
            pixel.0[0] = match flatten_to {
                Some(level) => level,
                None => pixel.0[0].saturating_sub(subtract_by),
            };
        }
    }
}

/// Grayscale dilation with an LInf structuring element, for 16-bit data the
/// morphology helpers do not cover.
pub fn dilate16(data: &Gray16, kernel: u32, iterations: u32) -> Gray16 {
    let r = (kernel.max(1) / 2).max(1) as i64;
    let (w, h) = (data.width() as i64, data.height() as i64);
    let mut current = data.clone();
    for _ in 0..iterations {
        let mut next = current.clone();
        for y in 0..h {
            for x in 0..w {
                let mut max = 0u16;
                for dy in -r..=r {
                    for dx in -r..=r {
                        let (nx, ny) = (x + dx, y + dy);
                        if nx >= 0 && ny >= 0 && nx < w && ny < h {
                            max = max.max(current.get_pixel(nx as u32, ny as u32).0[0]);
                        }
                    }
                }
                next.put_pixel(x as u32, y as u32, Luma([max]));
            }
        }
        current = next;
    }
    current
}

/// Cuts the central square of side `2 * half_size` out of the raster.
pub fn cut_out_center(img: &Gray16, half_size: u32) -> Gray16 {
    let cx = img.width() / 2;
    let cy = img.height() / 2;
    let x0 = cx.saturating_sub(half_size);
    let y0 = cy.saturating_sub(half_size);
    imageops::crop_imm(img, x0, y0, half_size * 2, half_size * 2).to_image()
}

/// Clears a border band on every edge of `src`; pixels that were set inside
/// the band are raised to 255 in `dst` so the base layer absorbs them.
pub fn transfer_border(src: &mut Gray8, mut dst: Option<&mut Gray8>, border: u32) {
    let (w, h) = (src.width(), src.height());
    let border = border.min(w / 2).min(h / 2);
    for y in 0..h {
        for x in 0..w {
            let in_border = x < border || y < border || x >= w - border || y >= h - border;
            if !in_border {
                continue;
            }
            let value = src.get_pixel(x, y).0[0];
            if value != 0 {
                if let Some(base) = dst.as_deref_mut() {
                    base.put_pixel(x, y, Luma([255]));
                }
            }
            src.put_pixel(x, y, Luma([0]));
        }
    }
}

pub fn resize_nearest8(img: &Gray8, width: u32, height: u32) -> Gray8 {
    imageops::resize(img, width, height, FilterType::Nearest)
}

pub fn resize_nearest16(img: &Gray16, width: u32, height: u32) -> Gray16 {
    imageops::resize(img, width, height, FilterType::Nearest)
}

pub fn resize_linear16(img: &Gray16, width: u32, height: u32) -> Gray16 {
    imageops::resize(img, width, height, FilterType::Triangle)
}

pub fn masked_mean16(data: &Gray16, mask: &Gray8) -> Option<f64> {
    let mut sum = 0f64;
    let mut count = 0u64;
    for (x, y, pixel) in data.enumerate_pixels() {
        if mask.get_pixel(x, y).0[0] == 255 {
            sum += f64::from(pixel.0[0]);
            count += 1;
        }
    }
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

pub fn min_max16(data: &Gray16) -> (u16, u16) {
    use itertools::{Itertools, MinMaxResult};
    match data.pixels().map(|p| p.0[0]).minmax() {
        MinMaxResult::NoElements => (0, 0),
        MinMaxResult::OneElement(v) => (v, v),
        MinMaxResult::MinMax(min, max) => (min, max),
    }
}

/// `dst |= src` for binary masks.
pub fn or_into(dst: &mut Gray8, src: &Gray8) {
    for (d, s) in dst.pixels_mut().zip(src.pixels()) {
        if s.0[0] != 0 {
            d.0[0] = 255;
        }
    }
}

/// `layer & !cumulative`: clears pixels an earlier layer already claimed.
pub fn mask_against(layer: &Gray8, cumulative: &Gray8) -> Gray8 {
    let mut out = layer.clone();
    for (o, c) in out.pixels_mut().zip(cumulative.pixels()) {
        if c.0[0] != 0 {
            o.0[0] = 0;
        }
    }
    out
}

pub fn invert8(img: &Gray8) -> Gray8 {
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = 255 - pixel.0[0];
    }
    out
}

pub fn any_nonzero8(img: &Gray8) -> bool {
    img.pixels().any(|p| p.0[0] != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_polygon_covers_the_expected_area() {
        let mut img = new_gray8(32, 32);
        fill_polygon(&mut img, &[(4.0, 4.0), (20.0, 4.0), (20.0, 20.0), (4.0, 20.0)], 255)
            .unwrap();
        let count = img.pixels().filter(|p| p.0[0] == 255).count();
        // 17x17 including both boundary rows.
        assert_eq!(count, 289);
    }

    #[test]
    fn degenerate_polygon_is_rejected() {
        let mut img = new_gray8(8, 8);
        let result = fill_polygon(&mut img, &[(1.0, 1.0), (1.0, 1.0), (1.0, 1.0)], 255);
        assert!(matches!(result, Err(FeatureError::Degenerate(_))));
    }

    #[test]
    fn subtract_with_zero_depth_is_a_no_op() {
        let mut data = new_gray16(16, 16);
        for pixel in data.pixels_mut() {
            pixel.0[0] = 1000;
        }
        let mut mask = new_gray8(16, 16);
        fill_polygon(&mut mask, &[(2.0, 2.0), (13.0, 2.0), (13.0, 13.0), (2.0, 13.0)], 255)
            .unwrap();

        let before = data.clone();
        subtract_by_mask(&mut data, &mask, 0, None);
        assert_eq!(before.as_raw(), data.as_raw());
    }

    #[test]
    fn subtract_lowers_only_the_masked_interior() {
        let mut data = new_gray16(16, 16);
        for pixel in data.pixels_mut() {
            pixel.0[0] = 1000;
        }
        let mut mask = new_gray8(16, 16);
        fill_polygon(&mut mask, &[(4.0, 4.0), (11.0, 4.0), (11.0, 11.0), (4.0, 11.0)], 255)
            .unwrap();
        subtract_by_mask(&mut data, &mask, 100, None);

        assert_eq!(data.get_pixel(7, 7).0[0], 900);
        assert_eq!(data.get_pixel(0, 0).0[0], 1000);
        // The outermost masked ring survives the erosion.
        assert_eq!(data.get_pixel(4, 4).0[0], 1000);
    }

    #[test]
    fn cut_out_center_returns_the_middle_square() {
        let mut img = new_gray16(64, 64);
        img.put_pixel(32, 32, Luma([7]));
        let cut = cut_out_center(&img, 8);
        assert_eq!(cut.dimensions(), (16, 16));
        assert_eq!(cut.get_pixel(8, 8).0[0], 7);
    }

    #[test]
    fn transfer_border_moves_pixels_to_the_base() {
        let mut src = new_gray8(10, 10);
        let mut base = new_gray8(10, 10);
        src.put_pixel(0, 5, Luma([255]));
        src.put_pixel(5, 5, Luma([255]));
        transfer_border(&mut src, Some(&mut base), 2);

        assert_eq!(src.get_pixel(0, 5).0[0], 0);
        assert_eq!(base.get_pixel(0, 5).0[0], 255);
        // Interior pixel untouched on both sides.
        assert_eq!(src.get_pixel(5, 5).0[0], 255);
        assert_eq!(base.get_pixel(5, 5).0[0], 0);
    }

    #[test]
    fn rotation_by_zero_keeps_the_center_crop() {
        let mut img = new_gray16(20, 20);
        img.put_pixel(10, 10, Luma([500]));
        let out = rotate_and_crop16(&img, 0, 10, 10);
        assert_eq!(out.dimensions(), (10, 10));
        assert_eq!(out.get_pixel(5, 5).0[0], 500);
    }

    #[test]
    fn blur_radius_is_forced_odd() {
        assert_eq!(effective_blur_radius(4), Some(5));
        assert_eq!(effective_blur_radius(3), Some(3));
        assert_eq!(effective_blur_radius(0), None);
        assert_eq!(effective_blur_radius(-2), None);
    }

    #[test]
    fn dilate16_grows_bright_regions() {
        let mut img = new_gray16(9, 9);
        img.put_pixel(4, 4, Luma([100]));
        let grown = dilate16(&img, 3, 1);
        assert_eq!(grown.get_pixel(3, 3).0[0], 100);
        assert_eq!(grown.get_pixel(4, 5).0[0], 100);
        assert_eq!(grown.get_pixel(1, 1).0[0], 0);
    }
}
