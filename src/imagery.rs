use std::path::Path;

use crate::error::FetchError;

/// Source of rectified satellite mosaics. The tile downloader itself lives
/// outside this crate; implementations may serve from a local tile cache.
pub trait ImageryProvider {
    /// Writes a square mosaic of `side_m` meters centered at `center`,
    /// rotated by `rotation` degrees, to `out_path`. May reuse an existing
    /// file at that path.
    fn fetch(
        &self,
        center: (f64, f64),
        side_m: u32,
        zoom: u32,
        rotation: i32,
        out_path: &Path,
    ) -> Result<(), FetchError>;
}

/// Writes a flat mid-gray mosaic. Stands in when no imagery backend is
/// configured so the rest of the pipeline can still texture meshes.
pub struct FlatImagery;

impl ImageryProvider for FlatImagery {
    fn fetch(
        &self,
        _center: (f64, f64),
        side_m: u32,
        _zoom: u32,
        _rotation: i32,
        out_path: &Path,
    ) -> Result<(), FetchError> {
        if out_path.is_file() {
            return Ok(());
        }
        // One pixel per two meters is plenty for a placeholder.
        let side = (side_m / 2).clamp(64, 4096);
        let img = image::RgbImage::from_pixel(side, side, image::Rgb([96u8, 96, 96]));
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        img.save(out_path).map_err(|e| FetchError::TileMalformed {
            path: out_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}
