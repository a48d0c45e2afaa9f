use std::path::PathBuf;

use anyhow::Result;
use log::{debug, warn};

use crate::component::dem::{self, DemStage};
use crate::component::texture::{self, TexturePass};
use crate::error::GenerationError;
use crate::geometry::{self, FitOptions};
use crate::infolayer::{self, keys, InfoLayerStore};
use crate::map::{MapContext, BACKGROUND_DISTANCE};
use crate::mesh::{self, obj, Mesh};
use crate::raster::{
    self, any_nonzero8, cut_out_center, dilate16, fill_polygon, load_gray16, load_gray8,
    masked_mean16, new_gray8, or_into, resize_nearest16, save_image, subtract_by_mask, Gray16,
};
use crate::schema::LayerSpec;

const NOT_RESIZED_DEM: &str = "not_resized_dem.png";
const NOT_RESIZED_DEM_FOUNDATIONS: &str = "not_resized_dem_FOUNDATIONS.png";
const NOT_RESIZED_DEM_ROADS: &str = "not_resized_dem_ROADS.png";

/// Not-resized DEM variants ordered most processed first. Consumers walk
/// this chain and take the first file that exists.
pub(crate) fn not_resized_chain(ctx: &MapContext) -> Vec<PathBuf> {
    let dir = ctx.background_dir();
    vec![
        dir.join(NOT_RESIZED_DEM_ROADS),
        dir.join(NOT_RESIZED_DEM_FOUNDATIONS),
        dir.join(NOT_RESIZED_DEM),
    ]
}

/// First not-resized DEM on disk, most processed variant first.
pub(crate) fn load_best_not_resized(ctx: &MapContext) -> Option<Gray16> {
    for path in not_resized_chain(ctx) {
        if path.is_file() {
            match load_gray16(&path) {
                Ok(img) => return Some(img),
                Err(e) => warn!("could not read {}: {}", path.display(), e),
            }
        }
    }
    None
}

pub(crate) fn water_resources_path(ctx: &MapContext) -> PathBuf {
    ctx.water_dir().join("water_resources.png")
}

pub(crate) fn full_dem_path(ctx: &MapContext) -> PathBuf {
    ctx.background_dir().join("FULL.png")
}

pub(crate) fn process(ctx: &mut MapContext) -> Result<(), GenerationError> {
    for dir in [
        ctx.background_dir(),
        ctx.water_dir(),
        ctx.assets_dir().join("background"),
        ctx.assets_dir().join("water"),
    ] {
        std::fs::create_dir_all(dir).map_err(anyhow::Error::from)?;
    }

    create_background_textures(ctx)?;

    let full_path = full_dem_path(ctx);
    let stage = DemStage {
        fetch_side_m: ctx.background_rotated_size(),
        output_resolution: ctx.background_rotated_size(),
        crop_size: ctx.background_size(),
        output_path: full_path.clone(),
    };
    dem::process(ctx, &stage)?;

    // Terrain as it stands before water carving, kept for the water planes.
    let not_substracted = ctx.background_dir().join("not_substracted.png");
    std::fs::copy(&full_path, &not_substracted).map_err(anyhow::Error::from)?;

    let flatten_water_to = if ctx.settings.dem.water_depth > 0 {
        subtract_water(ctx)?
    } else {
        None
    };

    save_map_dem(ctx)?;

    if ctx.settings.background.flatten_roads {
        flatten_roads(ctx)?;
    }

    if let Some(name) = ctx.game.additional_dem_name() {
        if let Some(dem_path) = ctx.assets.dem.clone() {
            let copy_path = dem_path.with_file_name(name);
            std::fs::copy(&dem_path, &copy_path).map_err(anyhow::Error::from)?;
            debug!("additional DEM copied to {}", copy_path.display());
        }
    }

    if ctx.settings.background.generate_background {
        generate_background_mesh(ctx)?;
    }
    if ctx.settings.background.generate_water {
        generate_water_meshes(ctx, flatten_water_to)?;
    }
    Ok(())
}

/// A second, background-sized texture pass over the layers flagged
/// `background`, composited into a single water-resources mask.
fn create_background_textures(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let background_layers: Vec<LayerSpec> = ctx
        .schema
        .background_layers()
        .into_iter()
        .map(|layer| LayerSpec {
            name: format!("{}_background", layer.name),
            count: 1,
            procedural: None,
            border: None,
            merge_into: None,
            ..layer.clone()
        })
        .collect();
    if background_layers.is_empty() {
        return Ok(());
    }

    let pass = TexturePass {
        layers: background_layers.clone(),
        map_size: ctx.background_size(),
        rotated_size: ctx.background_rotated_size(),
        store_path: infolayer::background_store_path(&ctx.map_directory),
        record_water_lines: true,
        skip_scaling: true,
    };
    texture::run_pass(ctx, &pass)?;

    let weights_dir = ctx.game.weights_dir(&ctx.map_directory);
    let size = ctx.background_size();
    let mut composite = new_gray8(size, size);
    for layer in &background_layers {
        let path = layer.path(&weights_dir);
        if !path.is_file() {
            continue;
        }
        let img = load_gray8(&path)?;
        if img.dimensions() == composite.dimensions() {
            or_into(&mut composite, &img);
        }
    }
    save_image(&composite, &water_resources_path(ctx))?;
    debug!("water resources mask composited from {} layers", background_layers.len());
    Ok(())
}

/// Carves the water depth out of the background DEM wherever the water
/// mask is set, then smooths the shorelines.
fn subtract_water(ctx: &mut MapContext) -> Result<Option<u16>, GenerationError> {
    let mask_path = water_resources_path(ctx);
    if !mask_path.is_file() {
        warn!("water resources mask was not generated, skipping subtraction");
        return Ok(None);
    }
    let mask = load_gray8(&mask_path)?;
    let full_path = full_dem_path(ctx);
    let mut dem = load_gray16(&full_path)?;

    let z_factor = ctx.shared.mesh_z_scaling_factor.unwrap_or(257.0);
    let subtract_by =
        (f64::from(ctx.settings.dem.water_depth) * z_factor).min(f64::from(u16::MAX)) as u16;

    let flatten_to = if ctx.settings.background.flatten_water {
        match masked_mean16(&dem, &mask) {
            Some(mean) => {
                Some((mean - f64::from(subtract_by)).max(0.0) as u16)
            }
            None => {
                warn!("no water pixels found in the water resources mask");
                return Ok(None);
            }
        }
    } else {
        None
    };

    subtract_by_mask(&mut dem, &mask, subtract_by, flatten_to);
    let dem = raster::blur_edges_by_mask16(&dem, &mask, 5, 3, 5);
    save_image(&dem, &full_path)?;
    debug!("water depth of {} subtracted from the background DEM", ctx.settings.dem.water_depth);
    Ok(flatten_to)
}

/// Cuts the playable square out of the background DEM, optionally levels
/// building pads, and writes the resized playable DEM the game loads.
fn save_map_dem(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let full = load_gray16(&full_dem_path(ctx))?;
    let mut cutout = cut_out_center(&full, ctx.size / 2);

    save_image(&cutout, &ctx.background_dir().join(NOT_RESIZED_DEM))?;

    if ctx.settings.dem.add_foundations {
        cutout = create_foundations(ctx, cutout)?;
        save_image(&cutout, &ctx.background_dir().join(NOT_RESIZED_DEM_FOUNDATIONS))?;
    }

    let output_size = ctx.scaled_size() + 1;
    let resized = resize_nearest16(&cutout, output_size, output_size);
    let dem_path = ctx.game.dem_file_path(&ctx.map_directory);
    save_image(&resized, &dem_path)?;
    debug!("playable DEM saved to {}", dem_path.display());
    ctx.assets.dem = Some(dem_path);
    Ok(())
}

/// Buildings rest on flat pads: every building polygon is flood-filled with
/// the mean elevation found inside it.
fn create_foundations(ctx: &MapContext, mut dem: Gray16) -> Result<Gray16> {
    let store = InfoLayerStore::load(&infolayer::textures_store_path(&ctx.map_directory))?;
    let Some(buildings) = store.polygons(keys::BUILDINGS) else {
        warn!("buildings data not found in the textures info layer");
        return Ok(dem);
    };
    debug!("creating foundations for {} buildings", buildings.len());

    let opts = ctx.playable_fit_options();
    let scale = ctx.size_scale();
    for building in buildings {
        let points: Vec<(f64, f64)> =
            building.iter().map(|p| (f64::from(p[0]), f64::from(p[1]))).collect();
        let fitted = match geometry::fit_polygon_into_bounds(&points, &opts) {
            Ok(fitted) => fitted,
            Err(e) => {
                debug!("building could not be fitted into the map bounds: {}", e);
                continue;
            }
        };
        // The cutout is unscaled; fitted coordinates are in output pixels.
        let unscaled: Vec<(f64, f64)> =
            fitted.iter().map(|&(x, y)| (x / scale, y / scale)).collect();

        let mut mask = new_gray8(dem.width(), dem.height());
        if let Err(e) = fill_polygon(&mut mask, &unscaled, 255) {
            debug!("could not rasterize building footprint: {}", e);
            continue;
        }
        if let Some(mean) = masked_mean16(&dem, &mask) {
            let level = mean.round().clamp(0.0, f64::from(u16::MAX)) as u16;
            for (x, y, pixel) in dem.enumerate_pixels_mut() {
                if mask.get_pixel(x, y).0[0] == 255 {
                    pixel.0[0] = level;
                }
            }
        }
    }
    Ok(dem)
}

/// Levels the terrain under each road polyline: elevation is sampled at
/// ~30 m intervals along the road and interpolated across the road mask.
fn flatten_roads(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let base_path = [
        ctx.background_dir().join(NOT_RESIZED_DEM_FOUNDATIONS),
        ctx.background_dir().join(NOT_RESIZED_DEM),
    ]
    .into_iter()
    .find(|p| p.is_file());
    let Some(base_path) = base_path else {
        warn!("no DEM data found for flattening roads");
        return Ok(());
    };
    let mut dem = load_gray16(&base_path)?;

    let store = InfoLayerStore::load(&infolayer::textures_store_path(&ctx.map_directory))?;
    let Some(roads) = store.polylines(keys::ROADS_POLYLINES) else {
        warn!("no road polylines found in the textures info layer");
        return Ok(());
    };
    debug!("flattening {} roads", roads.len());

    let opts = ctx.playable_fit_options();
    let scale = ctx.size_scale();
    let mut full_mask = new_gray8(dem.width(), dem.height());

    for road in roads {
        let points: Vec<(f64, f64)> =
            road.points.iter().map(|p| (f64::from(p[0]), f64::from(p[1]))).collect();
        let fitted = match geometry::fit_polyline_into_bounds(&points, &opts) {
            Ok(fitted) => fitted,
            Err(e) => {
                debug!("road could not be fitted into the map bounds: {}", e);
                continue;
            }
        };
        let polyline: Vec<(f64, f64)> =
            fitted.iter().map(|&(x, y)| (x / scale, y / scale)).collect();
        let total_length = geometry::polyline_length(&polyline);
        if total_length < 1.0 {
            continue;
        }

        let thickness = (road.width * 4.0).max(1.0);

        // Densely resampled center line for the mask and distance lookups.
        let dense_step = (total_length / 100.0).min(2.0).max(0.05);
        let dense_count = (total_length / dense_step).ceil() as usize + 1;
        let dense: Vec<(f64, f64)> = (0..dense_count)
            .map(|i| geometry::point_at_distance(&polyline, i as f64 * dense_step))
            .collect();

        let mut road_mask = new_gray8(dem.width(), dem.height());
        raster::draw_polyline(&mut road_mask, &dense, thickness, 255);

        // Elevation anchors every ~30 m along the road.
        let segment_length = 30.0f64;
        let segment_count = (total_length / segment_length).ceil().max(1.0) as usize;
        let mut anchor_distances = Vec::with_capacity(segment_count + 1);
        let mut anchor_elevations = Vec::with_capacity(segment_count + 1);
        let sample_radius = ((thickness / 4.0) as i64).max(5);
        for i in 0..=segment_count {
            let d = total_length * i as f64 / segment_count as f64;
            let (sx, sy) = geometry::point_at_distance(&polyline, d);
            anchor_distances.push(d);
            anchor_elevations.push(sample_window_mean(&dem, sx, sy, sample_radius));
        }

        for (x, y, pixel) in road_mask.enumerate_pixels() {
            if pixel.0[0] != 255 {
                continue;
            }
            let distance = nearest_dense_distance(&dense, dense_step, x, y);
            let elevation = interp(&anchor_distances, &anchor_elevations, distance);
            dem.put_pixel(x, y, image::Luma([elevation.round() as u16]));
            full_mask.put_pixel(x, y, image::Luma([255]));
        }
    }

    let dem = raster::blur_by_mask16(&dem, &full_mask, 5);
    let dem = raster::blur_edges_by_mask16(&dem, &full_mask, 3, 1, 1);

    save_image(&dem, &ctx.background_dir().join(NOT_RESIZED_DEM_ROADS))?;

    let output_size = ctx.scaled_size() + 1;
    let resized = resize_nearest16(&dem, output_size, output_size);
    let dem_path = ctx.game.dem_file_path(&ctx.map_directory);
    save_image(&resized, &dem_path)?;
    debug!("flattened roads written into the playable DEM");
    Ok(())
}

fn sample_window_mean(dem: &Gray16, x: f64, y: f64, radius: i64) -> f64 {
    let (w, h) = (dem.width() as i64, dem.height() as i64);
    let (cx, cy) = (x.round() as i64, y.round() as i64);
    let mut sum = 0f64;
    let mut count = 0u64;
    for sy in (cy - radius).max(0)..(cy + radius).min(h) {
        for sx in (cx - radius).max(0)..(cx + radius).min(w) {
            sum += f64::from(dem.get_pixel(sx as u32, sy as u32).0[0]);
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Distance along the road of the dense point nearest to the pixel.
fn nearest_dense_distance(dense: &[(f64, f64)], dense_step: f64, x: u32, y: u32) -> f64 {
    let (px, py) = (f64::from(x), f64::from(y));
    let mut best = 0usize;
    let mut best_d2 = f64::MAX;
    for (i, &(dx, dy)) in dense.iter().enumerate() {
        let d2 = (dx - px).powi(2) + (dy - py).powi(2);
        if d2 < best_d2 {
            best_d2 = d2;
            best = i;
        }
    }
    best as f64 * dense_step
}

/// Piecewise-linear interpolation over sorted sample positions.
fn interp(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    if x <= xs[0] {
        return ys[0];
    }
    if x >= xs[xs.len() - 1] {
        return ys[ys.len() - 1];
    }
    for i in 0..xs.len() - 1 {
        if x <= xs[i + 1] {
            let t = (x - xs[i]) / (xs[i + 1] - xs[i]).max(1e-12);
            return ys[i] + (ys[i + 1] - ys[i]) * t;
        }
    }
    ys[ys.len() - 1]
}

fn decimate_factor(map_size: u32) -> Option<f32> {
    match map_size {
        s if s <= 2048 => Some(0.1),
        s if s <= 4096 => Some(0.05),
        s if s <= 8192 => Some(0.025),
        s if s <= 16384 => Some(0.0125),
        _ => None,
    }
}

fn background_texture_resolution(map_size: u32) -> u32 {
    if map_size <= 2048 {
        2048
    } else {
        4096
    }
}

/// Builds the background terrain mesh from the full DEM and, when the game
/// wants processed meshes, decimates, textures and converts it to I3D.
fn generate_background_mesh(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let full_path = full_dem_path(ctx);
    if !full_path.is_file() {
        warn!("background DEM not found, mesh generation stopped");
        return Ok(());
    }
    let mut data = load_gray16(&full_path)?;
    if ctx.output_size.is_some() {
        let scaled = (f64::from(ctx.background_size()) * ctx.size_scale()) as u32;
        data = resize_nearest16(&data, scaled, scaled);
    }

    let mut mesh = mesh::mesh_from_heightmap(&data, true, ctx.mesh_z_scale());
    if ctx.settings.background.remove_center {
        mesh.to_origin();
        mesh.remove_center(ctx.scaled_size() as f32);
    }

    let obj_path = ctx.background_dir().join("FULL.obj");
    obj::write_obj(&mesh, &obj_path, "background_terrain", None)?;
    ctx.assets.background_mesh = Some(obj_path);
    debug!("background mesh exported with {} faces", mesh.faces.len());

    if !ctx.game.mesh_processing() {
        warn!("mesh processing is disabled for the game, skipping background mesh processing");
        return Ok(());
    }

    let Some(factor) = decimate_factor(ctx.size) else {
        warn!("map size too large for decimation, perform manual decimation instead");
        return Ok(());
    };
    let mut decimated = mesh.decimate(factor);
    let decimated_path = ctx.background_dir().join("decimated_background.obj");
    obj::write_obj(&decimated, &decimated_path, "background_terrain", None)?;
    ctx.assets.decimated_background_mesh = Some(decimated_path);

    let Some(texture_path) = ctx.assets.satellite_background.clone() else {
        warn!("background satellite texture not found, cannot texture background mesh");
        return Ok(());
    };
    let textured_dir = ctx.background_dir().join("textured_mesh");
    std::fs::create_dir_all(&textured_dir).map_err(anyhow::Error::from)?;

    let resolution = background_texture_resolution(ctx.size);
    let texture = image::open(&texture_path)
        .map_err(|e| anyhow::anyhow!("reading {}: {}", texture_path.display(), e))?
        .to_rgb8();
    let resized = image::imageops::resize(
        &texture,
        resolution,
        resolution,
        image::imageops::FilterType::CatmullRom,
    );
    let texture_out = textured_dir.join("background_texture.jpg");
    resized.save(&texture_out).map_err(anyhow::Error::from)?;

    decimated.rotate_x(-90.0);
    decimated.project_xz_uvs();
    let textured_obj = textured_dir.join("background_textured_mesh.obj");
    let textured_mtl = textured_dir.join("background_textured_mesh.mtl");
    obj::write_mtl(&textured_mtl, &obj::MtlSpec::terrain("background_texture.jpg".to_string()))?;
    obj::write_obj(
        &decimated,
        &textured_obj,
        "background_terrain",
        Some(("background_textured_mesh.mtl", "TerrainMaterial")),
    )?;
    ctx.assets.textured_background_mesh = Some(textured_obj);

    let i3d_dir = ctx.assets_dir().join("background");
    let asset_texture = i3d_dir.join("background_texture.jpg");
    std::fs::copy(&texture_out, &asset_texture).map_err(anyhow::Error::from)?;
    let i3d_path = i3d_dir.join("background_terrain.i3d");
    mesh::i3d::write_mesh_i3d(
        &decimated,
        &i3d_path,
        "background_terrain",
        Some("background_texture.jpg"),
        false,
    )?;
    ctx.assets.background_terrain_i3d = Some(i3d_path);
    Ok(())
}

/// Builds both water meshes: flat per-polygon planes from the recorded
/// water polygons, and the elevated plane under the full water mask.
fn generate_water_meshes(
    ctx: &mut MapContext,
    flatten_water_to: Option<u16>,
) -> Result<(), GenerationError> {
    if let Err(e) = generate_line_based_water(ctx, flatten_water_to) {
        warn!("line-based water generation failed: {}", e);
    }
    generate_elevated_water(ctx)?;
    Ok(())
}

fn generate_line_based_water(
    ctx: &mut MapContext,
    flatten_water_to: Option<u16>,
) -> Result<(), GenerationError> {
    let store = InfoLayerStore::load(&infolayer::background_store_path(&ctx.map_directory))?;
    let Some(polygons) = store.polygons(keys::WATER) else {
        warn!("no water polygons found in the background info layer");
        return Ok(());
    };
    debug!("found {} water polygons in the background info layer", polygons.len());

    let not_resized = load_gray16(&ctx.background_dir().join(NOT_RESIZED_DEM)).ok();
    let z_meters = ctx.mesh_z_scale();

    let mut fit = FitOptions::new(
        f64::from(ctx.background_size()),
        f64::from(ctx.background_rotated_size()),
        ctx.size_scale(),
        ctx.rotation,
    );
    fit.canvas_size = f64::from(ctx.background_size());
    fit.xshift = -f64::from(BACKGROUND_DISTANCE);

    let mut combined = Mesh::default();
    for polygon in polygons {
        if polygon.len() < 3 {
            warn!("skipping water polygon with insufficient points");
            continue;
        }
        let points: Vec<(f64, f64)> =
            polygon.iter().map(|p| (f64::from(p[0]), f64::from(p[1]))).collect();
        // Slightly oversize the plane so it tucks under the shoreline.
        let buffered = geometry::offset_polygon_mitre(&points, 2.0).unwrap_or(points);
        let fitted = match geometry::fit_polygon_into_bounds(&buffered, &fit) {
            Ok(fitted) => fitted,
            Err(e) => {
                debug!("water polygon could not be fitted: {}", e);
                continue;
            }
        };
        let Some(faces) = mesh::triangulate_polygon(&fitted) else {
            debug!("water polygon could not be triangulated");
            continue;
        };

        let offset = combined.vertices.len() as u32;
        for &(x, y) in &fitted {
            let z = match flatten_water_to {
                Some(level) => f64::from(level) * z_meters,
                None => match &not_resized {
                    Some(dem) => {
                        let sx = (x.round() as i64).clamp(0, i64::from(dem.width()) - 1) as u32;
                        let sy = (y.round() as i64).clamp(0, i64::from(dem.height()) - 1) as u32;
                        f64::from(dem.get_pixel(sx, sy).0[0]) * z_meters
                    }
                    None => 0.0,
                },
            };
            combined.vertices.push(cgmath::Point3::new(x as f32, y as f32, z as f32));
        }
        for face in faces {
            combined.faces.push([face[0] + offset, face[1] + offset, face[2] + offset]);
        }
    }

    if combined.is_empty() {
        warn!("no mesh could be created from the water polygons");
        return Ok(());
    }

    // Terrain-engine convention, then flip so the normals face up from
    // below the surface.
    for v in &mut combined.vertices {
        v.y = -v.y;
        v.z = -v.z;
    }
    combined.invert_faces();

    let obj_path = ctx.water_dir().join("line_based_water.obj");
    obj::write_obj(&combined, &obj_path, "water_resources", None)?;
    ctx.assets.line_based_water_mesh = Some(obj_path);

    if ctx.game.mesh_processing() {
        let i3d_path = ctx.assets_dir().join("water").join("water_resources.i3d");
        mesh::i3d::write_mesh_i3d(&combined, &i3d_path, "water_resources", None, true)?;
        ctx.assets.water_resources_i3d = Some(i3d_path);
    }
    Ok(())
}

fn generate_elevated_water(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let mask_path = water_resources_path(ctx);
    if !mask_path.is_file() {
        warn!("water resources mask not found");
        return Ok(());
    }
    let mut mask = load_gray8(&mask_path)?;
    if !any_nonzero8(&mask) {
        debug!("water resources mask is empty, skipping water generation");
        return Ok(());
    }

    let mut terrain = load_gray16(&ctx.background_dir().join("not_substracted.png"))?;
    if ctx.output_size.is_some() {
        let scaled = (f64::from(ctx.background_size()) * ctx.size_scale()) as u32;
        mask = raster::resize_nearest8(&mask, scaled, scaled);
        terrain = resize_nearest16(&terrain, scaled, scaled);
    }

    let blur = ctx.settings.background.water_blurriness.clamp(3, 99);
    let mut terrain = raster::gaussian_blur16(&terrain, blur as i32);

    for (x, y, pixel) in terrain.enumerate_pixels_mut() {
        if mask.get_pixel(x, y).0[0] == 0 {
            pixel.0[0] = 0;
        }
    }
    let dilated = dilate16(&terrain, 3, 10);
    let mut elevated = dilated;
    for (x, y, pixel) in elevated.enumerate_pixels_mut() {
        let original = terrain.get_pixel(x, y).0[0];
        if original > 0 {
            pixel.0[0] = original;
        }
    }

    let mesh = mesh::mesh_from_heightmap(&elevated, false, ctx.mesh_z_scale());
    if mesh.is_empty() {
        debug!("elevated water mesh is empty");
        return Ok(());
    }
    let obj_path = ctx.water_dir().join("elevated_water.obj");
    obj::write_obj(&mesh, &obj_path, "elevated_water", None)?;
    ctx.assets.water_mesh = Some(obj_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::tests::test_context;

    #[test]
    fn foundations_flatten_building_footprints() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 256, 0);

        let mut store = InfoLayerStore::default();
        store.add_polygon(
            keys::BUILDINGS,
            vec![[40, 40], [90, 40], [90, 90], [40, 90]],
        );
        store.save(&infolayer::textures_store_path(&ctx.map_directory)).unwrap();

        // A sloping terrain: elevation grows with x.
        let mut dem = crate::raster::new_gray16(256, 256);
        for (x, _, pixel) in dem.enumerate_pixels_mut() {
            pixel.0[0] = (x * 10) as u16;
        }

        let flattened = create_foundations(&ctx, dem).unwrap();

        let inside: Vec<u16> = (45..85)
            .flat_map(|y| (45..85).map(move |x| (x, y)))
            .map(|(x, y)| flattened.get_pixel(x, y).0[0])
            .collect();
        let first = inside[0];
        assert!(inside.iter().all(|&v| v == first), "pad must be flat");
        // Terrain outside the footprint keeps its slope.
        assert_ne!(flattened.get_pixel(10, 10).0[0], flattened.get_pixel(200, 10).0[0]);
    }

    #[test]
    fn interp_matches_endpoints_and_midpoints() {
        let xs = [0.0, 10.0, 20.0];
        let ys = [100.0, 200.0, 150.0];
        assert_eq!(interp(&xs, &ys, -5.0), 100.0);
        assert_eq!(interp(&xs, &ys, 25.0), 150.0);
        assert!((interp(&xs, &ys, 5.0) - 150.0).abs() < 1e-9);
        assert!((interp(&xs, &ys, 15.0) - 175.0).abs() < 1e-9);
    }

    #[test]
    fn decimate_factor_follows_the_size_table() {
        assert_eq!(decimate_factor(1024), Some(0.1));
        assert_eq!(decimate_factor(4096), Some(0.05));
        assert_eq!(decimate_factor(8192), Some(0.025));
        assert_eq!(decimate_factor(16384), Some(0.0125));
        assert_eq!(decimate_factor(32768), None);
    }

    #[test]
    fn dense_distance_lookup_finds_the_closest_sample() {
        let dense: Vec<(f64, f64)> = (0..100).map(|i| (i as f64, 0.0)).collect();
        assert_eq!(nearest_dense_distance(&dense, 1.0, 42, 3), 42.0);
        assert_eq!(nearest_dense_distance(&dense, 1.0, 0, 0), 0.0);
    }
}
