use std::env;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::error::FetchError;

/// The radius of the earth in meters.
pub const EARTH_RADIUS: f64 = 6_371_000.0;
pub const EARTH_CIRCUMFERENCE: f64 = 2.0 * std::f64::consts::PI * EARTH_RADIUS;

/// Meters of one degree of latitude.
fn meters_per_degree() -> f64 {
    EARTH_CIRCUMFERENCE / 360.0
}

/// A raw elevation window, rows first, values in meters.
#[derive(Clone, Debug)]
pub struct HeightGrid {
    pub width: usize,
    pub height: usize,
    pub values: Vec<f32>,
}

impl HeightGrid {
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.values[row * self.width + col]
    }

    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(f32::MIN, f32::max)
    }

    pub fn min(&self) -> f32 {
        self.values.iter().copied().fold(f32::MAX, f32::min)
    }

    pub fn is_all_zero(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }
}

/// Source of elevation windows for a map center and extent.
///
/// Implementations read locally cached tiles; HTTP delivery of the tiles
/// themselves is outside this crate.
pub trait DtmProvider {
    fn name(&self) -> &str;

    /// Returns the elevation window covering a square of `side_m` meters
    /// centered at `center` (latitude, longitude in WGS-84 degrees).
    fn fetch(&self, center: (f64, f64), side_m: u32) -> Result<HeightGrid, FetchError>;
}

/// Resolves the DTM tile cache directory from the environment.
pub fn dtm_cache_dir() -> PathBuf {
    env::var_os("FARMSCAPE_DTM_CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("cache").join("dtm"))
}

/// Resolves the satellite tile cache directory from the environment.
pub fn sat_cache_dir() -> PathBuf {
    env::var_os("FARMSCAPE_SAT_CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("cache").join("satellite"))
}

/// SRTM `.hgt` tiles stored in a cache directory, one file per 1x1 degree
/// cell named like `n45_e020.hgt`. Both the 3 arc-second (1201^2) and the
/// 1 arc-second (3601^2) layouts are recognized by file size.
pub struct SrtmProvider {
    cache_dir: PathBuf,
}

impl SrtmProvider {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn tile_name(latitude: i16, longitude: i16) -> String {
        let n_or_s = if latitude >= 0 { 'n' } else { 's' };
        let e_or_w = if longitude >= 0 { 'e' } else { 'w' };
        format!("{}{:02}_{}{:03}.hgt", n_or_s, latitude.abs(), e_or_w, longitude.abs())
    }

    fn load_tile(&self, latitude: i16, longitude: i16) -> Result<HgtTile, FetchError> {
        let path = self.cache_dir.join(Self::tile_name(latitude, longitude));
        if !path.is_file() {
            return Err(FetchError::TileMissing(path));
        }
        let data = fs::read(&path)?;
        parse_hgt(&path, data)
    }
}

struct HgtTile {
    resolution: usize,
    values: Vec<f32>,
}

impl HgtTile {
    /// Bilinear sample at fractional cell coordinates within the tile.
    fn sample(&self, fx: f64, fy: f64) -> f32 {
        let max = (self.resolution - 1) as f64;
        let fx = fx.clamp(0.0, max);
        let fy = fy.clamp(0.0, max);
        let (x0, y0) = (fx.floor() as usize, fy.floor() as usize);
        let (x1, y1) = ((x0 + 1).min(self.resolution - 1), (y0 + 1).min(self.resolution - 1));
        let (tx, ty) = ((fx - x0 as f64) as f32, (fy - y0 as f64) as f32);

        let at = |x: usize, y: usize| self.values[y * self.resolution + x];
        let top = at(x0, y0) * (1.0 - tx) + at(x1, y0) * tx;
        let bottom = at(x0, y1) * (1.0 - tx) + at(x1, y1) * tx;
        top * (1.0 - ty) + bottom * ty
    }
}

/// Parses an SRTM `.hgt` file: big-endian signed 16-bit samples, row order
/// north to south, -32768 marking voids.
fn parse_hgt(path: &Path, data: Vec<u8>) -> Result<HgtTile, FetchError> {
    let resolution = match data.len() {
        len if len == 1201 * 1201 * 2 => 1201,
        len if len == 3601 * 3601 * 2 => 3601,
        len => {
            return Err(FetchError::TileMalformed {
                path: path.to_path_buf(),
                reason: format!("unexpected file size {}", len),
            })
        }
    };

    let samples: Vec<i16> = bytemuck::pod_collect_to_vec(&data);
    let mut values = Vec::with_capacity(resolution * resolution);
    for raw in samples {
        let h = i16::from_be(raw);
        values.push(if h == -32768 { 0.0 } else { f32::from(h) });
    }
    Ok(HgtTile { resolution, values })
}

impl DtmProvider for SrtmProvider {
    fn name(&self) -> &str {
        "srtm"
    }

    fn fetch(&self, center: (f64, f64), side_m: u32) -> Result<HeightGrid, FetchError> {
        let (lat, lon) = center;
        let half_lat = f64::from(side_m) / 2.0 / meters_per_degree();
        let half_lon = half_lat / lat.to_radians().cos().abs().max(1e-6);

        let north = lat + half_lat;
        let south = lat - half_lat;
        let west = lon - half_lon;
        let east = lon + half_lon;

        // One output sample per ~30 m keeps SRTM1 detail without wasting
        // memory on lower resolution tiles.
        let size = ((f64::from(side_m) / 30.0).ceil() as usize).max(16);
        let mut values = vec![0f32; size * size];

        let mut tiles: Vec<(i16, i16, HgtTile)> = Vec::new();
        for tile_lat in (south.floor() as i16)..=(north.floor() as i16) {
            for tile_lon in (west.floor() as i16)..=(east.floor() as i16) {
                let tile = self.load_tile(tile_lat, tile_lon)?;
                tiles.push((tile_lat, tile_lon, tile));
            }
        }

        for row in 0..size {
            // Row 0 is the northern edge.
            let sample_lat = north - (north - south) * (row as f64) / (size - 1) as f64;
            for col in 0..size {
                let sample_lon = west + (east - west) * (col as f64) / (size - 1) as f64;
                let (tile_lat, tile_lon) =
                    (sample_lat.floor() as i16, sample_lon.floor() as i16);
                if let Some((_, _, tile)) =
                    tiles.iter().find(|(la, lo, _)| *la == tile_lat && *lo == tile_lon)
                {
                    let max = (tile.resolution - 1) as f64;
                    let fx = (sample_lon - f64::from(tile_lon)) * max;
                    // hgt rows run north to south inside a tile.
                    let fy = (1.0 - (sample_lat - f64::from(tile_lat))) * max;
                    values[row * size + col] = tile.sample(fx, fy);
                }
            }
        }

        Ok(HeightGrid { width: size, height: size, values })
    }
}

/// A single GeoTIFF file covering the whole requested area, e.g. a regional
/// lidar export. The file is read strip by strip and returned as one grid;
/// the DEM stage resizes it to the working resolution anyway.
pub struct GeoTiffProvider {
    path: PathBuf,
}

impl GeoTiffProvider {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl DtmProvider for GeoTiffProvider {
    fn name(&self) -> &str {
        "geotiff"
    }

    fn fetch(&self, _center: (f64, f64), _side_m: u32) -> Result<HeightGrid, FetchError> {
        if !self.path.is_file() {
            return Err(FetchError::TileMissing(self.path.clone()));
        }
        let data = fs::read(&self.path)?;
        let mut decoder = tiff::decoder::Decoder::new(Cursor::new(data)).map_err(|e| {
            FetchError::TileMalformed { path: self.path.clone(), reason: e.to_string() }
        })?;
        let (width, height) = decoder.dimensions().map_err(|e| FetchError::TileMalformed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let mut values: Vec<f32> = Vec::with_capacity(width as usize * height as usize);
        let strip_count = decoder.strip_count().map_err(|e| FetchError::TileMalformed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        for strip_index in 0..strip_count {
            let strip = decoder.read_chunk(strip_index).map_err(|e| FetchError::TileMalformed {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
            match strip {
                tiff::decoder::DecodingResult::I16(v) => {
                    values.extend(v.iter().map(|&s| f32::from(s)))
                }
                tiff::decoder::DecodingResult::U16(v) => {
                    values.extend(v.iter().map(|&s| f32::from(s)))
                }
                tiff::decoder::DecodingResult::F32(v) => values.extend_from_slice(&v),
                _ => {
                    return Err(FetchError::TileMalformed {
                        path: self.path.clone(),
                        reason: "unsupported sample format".to_string(),
                    })
                }
            }
        }

        if values.len() != width as usize * height as usize {
            return Err(FetchError::TileMalformed {
                path: self.path.clone(),
                reason: "strip data does not match dimensions".to_string(),
            });
        }

        Ok(HeightGrid { width: width as usize, height: height as usize, values })
    }
}

/// Picks a provider by name for the CLI.
pub fn provider_from_name(name: &str, cache_dir: PathBuf) -> Result<Box<dyn DtmProvider>, FetchError> {
    match name {
        "srtm" | "SRTM" | "srtm30" | "SRTM30" => Ok(Box::new(SrtmProvider::new(cache_dir))),
        other => {
            let path = PathBuf::from(other);
            if path.extension().map_or(false, |e| e == "tif" || e == "tiff") {
                Ok(Box::new(GeoTiffProvider::new(path)))
            } else {
                Err(FetchError::EmptyData { provider: other.to_string() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, WriteBytesExt};

    fn write_tile(dir: &Path, name: &str, f: impl Fn(usize, usize) -> i16) {
        let mut data = Vec::with_capacity(1201 * 1201 * 2);
        for y in 0..1201 {
            for x in 0..1201 {
                data.write_i16::<BigEndian>(f(x, y)).unwrap();
            }
        }
        fs::write(dir.join(name), data).unwrap();
    }

    #[test]
    fn tile_names_follow_the_srtm_convention() {
        assert_eq!(SrtmProvider::tile_name(45, 20), "n45_e020.hgt");
        assert_eq!(SrtmProvider::tile_name(-12, -77), "s12_w077.hgt");
    }

    #[test]
    fn fetch_samples_a_flat_tile() {
        let dir = tempfile::tempdir().unwrap();
        write_tile(dir.path(), "n45_e020.hgt", |_, _| 150);
        let provider = SrtmProvider::new(dir.path().to_path_buf());

        let grid = provider.fetch((45.5, 20.5), 2048).unwrap();
        assert_eq!(grid.width, grid.height);
        assert!(grid.values.iter().all(|&v| (v - 150.0).abs() < 0.01));
    }

    #[test]
    fn voids_become_zero() {
        let dir = tempfile::tempdir().unwrap();
        write_tile(dir.path(), "n45_e020.hgt", |_, _| -32768);
        let provider = SrtmProvider::new(dir.path().to_path_buf());

        let grid = provider.fetch((45.5, 20.5), 1024).unwrap();
        assert!(grid.is_all_zero());
    }

    #[test]
    fn missing_tile_is_a_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SrtmProvider::new(dir.path().to_path_buf());
        assert!(matches!(
            provider.fetch((45.5, 20.5), 1024),
            Err(FetchError::TileMissing(_))
        ));
    }

    #[test]
    fn truncated_tile_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("n45_e020.hgt"), vec![0u8; 100]).unwrap();
        let provider = SrtmProvider::new(dir.path().to_path_buf());
        assert!(matches!(
            provider.fetch((45.5, 20.5), 1024),
            Err(FetchError::TileMalformed { .. })
        ));
    }
}
