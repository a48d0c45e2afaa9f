use std::path::PathBuf;

use image::imageops::{resize, FilterType};
use image::{ImageBuffer, Luma};
use log::debug;

use crate::error::{FetchError, GenerationError};
use crate::map::MapContext;
use crate::raster::{gaussian_blur16, rotate_and_crop16, save_image, Gray16};

type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Parameters of one DEM sub-pipeline run. The background component drives
/// this at background sizes; other callers may run it at playable sizes.
pub struct DemStage {
    /// Square side of the real-world window handed to the DTM provider.
    pub fetch_side_m: u32,
    /// Side of the working raster the provider data is resampled to.
    pub output_resolution: u32,
    /// Side of the final raster after rotation compensation.
    pub crop_size: u32,
    pub output_path: PathBuf,
}

/// Runs the DEM chain: fetch, resize, multiply, ground-level shift, height
/// scale determination, 16-bit normalization, blur and rotation. Records
/// the chosen height scale into the shared runtime.
pub(crate) fn process(ctx: &mut MapContext, stage: &DemStage) -> Result<(), GenerationError> {
    let grid = ctx.dtm.fetch(ctx.center, stage.fetch_side_m)?;
    if grid.is_all_zero() {
        return Err(GenerationError::Fetch(FetchError::EmptyData {
            provider: ctx.dtm.name().to_string(),
        }));
    }
    debug!(
        "DEM data fetched from provider {}: {}x{}, min {:.1}, max {:.1}",
        ctx.dtm.name(),
        grid.width,
        grid.height,
        grid.min(),
        grid.max()
    );

    let raw = GrayF32::from_raw(grid.width as u32, grid.height as u32, grid.values)
        .ok_or_else(|| anyhow::anyhow!("provider grid dimensions do not match its data"))?;

    // 1. Resample to the working resolution.
    let mut data = resize(&raw, stage.output_resolution, stage.output_resolution, FilterType::Triangle);

    // 2. Elevation multiplier.
    let multiplier = ctx.settings.dem.multiplier;
    if multiplier != 1 {
        for pixel in data.pixels_mut() {
            pixel.0[0] *= multiplier as f32;
        }
        debug!("DEM multiplied by {}", multiplier);
    }

    // 3. Shift so the lowest point sits at plateau + water depth.
    if ctx.settings.dem.adjust_terrain_to_ground_level {
        let desired = ctx.settings.dem.plateau as f32 + ctx.settings.dem.water_depth as f32;
        let current = data.pixels().map(|p| p.0[0]).fold(f32::MAX, f32::min);
        let shift = desired - current;
        for pixel in data.pixels_mut() {
            pixel.0[0] += shift;
        }
        debug!("terrain shifted to ground level {} (by {:.2})", desired, shift);
    }

    // 4. Height scale: the number of meters pixel value 65535 stands for.
    let max_meters = data.pixels().map(|p| p.0[0]).fold(f32::MIN, f32::max);
    let height_scale = determine_height_scale(ctx, f64::from(max_meters));

    // 5. Normalize into the unsigned 16-bit range.
    let mut normalized: Gray16 = ImageBuffer::new(data.width(), data.height());
    for (src, dst) in data.pixels().zip(normalized.pixels_mut()) {
        let value = (f64::from(src.0[0]) / height_scale * 65535.0).clamp(0.0, 65535.0);
        dst.0[0] = value as u16;
    }

    // 6. Blur.
    let blurred = gaussian_blur16(&normalized, ctx.settings.dem.blur_radius);

    save_image(&blurred, &stage.output_path)?;
    debug!("DEM saved to {}", stage.output_path.display());

    // 7. Rotation compensation.
    if ctx.rotation != 0 {
        let rotated = rotate_and_crop16(&blurred, ctx.rotation, stage.crop_size, stage.crop_size);
        save_image(&rotated, &stage.output_path)?;
        debug!("DEM rotated by {} and cropped to {}", ctx.rotation, stage.crop_size);
    }
    Ok(())
}

/// `H = ceil(max(minimum_height_scale, max_meters + ceiling))`, with the
/// derived scale factors recorded for every later component.
pub(crate) fn determine_height_scale(ctx: &mut MapContext, max_meters: f64) -> f64 {
    let minimum = f64::from(ctx.settings.dem.minimum_height_scale);
    let height_scale = (max_meters + f64::from(ctx.settings.dem.ceiling)).max(minimum).ceil();

    ctx.shared.height_scale_value = Some(height_scale);
    ctx.shared.mesh_z_scaling_factor = Some(65535.0 / height_scale);
    ctx.shared.height_scale_multiplier = Some(height_scale / 255.0);
    ctx.shared.change_height_scale = true;

    debug!("height scale determined: {}", height_scale);
    height_scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtm::HeightGrid;
    use crate::map::tests::test_context;

    struct Slope;

    impl crate::dtm::DtmProvider for Slope {
        fn name(&self) -> &str {
            "slope"
        }
        fn fetch(&self, _: (f64, f64), _: u32) -> Result<HeightGrid, FetchError> {
            let size = 64;
            let values =
                (0..size * size).map(|i| 10.0 + (i % size) as f32).collect::<Vec<f32>>();
            Ok(HeightGrid { width: size, height: size, values })
        }
    }

    #[test]
    fn height_scale_honours_the_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path(), 256, 0);
        let scale = determine_height_scale(&mut ctx, 80.0);
        assert_eq!(scale, 255.0);
        assert!(ctx.shared.change_height_scale);
        assert!((ctx.shared.mesh_z_scaling_factor.unwrap() - 65535.0 / 255.0).abs() < 1e-9);
    }

    #[test]
    fn height_scale_grows_past_tall_terrain() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path(), 256, 0);
        ctx.settings.dem.ceiling = 10;
        let scale = determine_height_scale(&mut ctx, 301.5);
        assert_eq!(scale, 312.0);
    }

    #[test]
    fn processed_dem_respects_the_height_scale_contract() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path(), 256, 0);
        ctx.dtm = Box::new(Slope);
        // Keep the raw elevations so the contract can be checked against
        // the provider values.
        ctx.settings.dem.adjust_terrain_to_ground_level = false;

        let output_path = dir.path().join("FULL.png");
        let stage = DemStage {
            fetch_side_m: 256,
            output_resolution: 128,
            crop_size: 128,
            output_path: output_path.clone(),
        };
        process(&mut ctx, &stage).unwrap();

        let dem = crate::raster::load_gray16(&output_path).unwrap();
        let (_, max_pixel) = crate::raster::min_max16(&dem);
        let height_scale = ctx.shared.height_scale_value.unwrap();
        assert!(max_pixel <= 65535);
        // Raw max elevation must still be representable.
        let raw_max = 10.0 + 63.0;
        assert!(f64::from(max_pixel) * height_scale / 65535.0 + 1.0 >= raw_max);
    }
}
