use cgmath::{Point2, Point3};
use log::{debug, info, warn};
use rand::Rng;

use crate::component::background;
use crate::error::GenerationError;
use crate::geometry::{
    self, polyline_perpendiculars, smart_interpolation, split_long_line_surfaces,
    LineSurfaceEntry,
};
use crate::infolayer::{self, keys, InfoLayerStore};
use crate::map::MapContext;
use crate::mesh::{self, obj, Mesh};
use crate::raster::Gray16;

const PATCH_Z_OFFSET: f64 = -0.01;
const JUNCTION_TOLERANCE: f64 = 1.0;
const TEXTURE_TILE_SIZE: f64 = 10.0;

pub(crate) fn process(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let store = InfoLayerStore::load(&infolayer::textures_store_path(&ctx.map_directory))?;
    let Some(roads) = store.polylines(keys::ROADS_POLYLINES) else {
        warn!("road polylines not found in the textures info layer");
        return Ok(());
    };

    let opts = ctx.playable_fit_options();
    let scale = ctx.size_scale();
    let mut entries: Vec<LineSurfaceEntry> = Vec::new();
    for (road_id, road) in roads.iter().enumerate() {
        if road.points.len() < 2 || road.width <= 0.0 {
            debug!("invalid road data for road {}", road_id + 1);
            continue;
        }
        let points: Vec<(f64, f64)> =
            road.points.iter().map(|p| (f64::from(p[0]), f64::from(p[1]))).collect();
        match geometry::fit_polyline_into_bounds(&points, &opts) {
            Ok(fitted) => {
                // The mesh lives in unscaled meters-as-pixels space.
                let unscaled: Vec<(f64, f64)> =
                    fitted.iter().map(|&(x, y)| (x / scale, y / scale)).collect();
                entries.push(LineSurfaceEntry {
                    points: unscaled,
                    width: road.width,
                    z_offset: 0.0,
                });
            }
            Err(e) => debug!("road {} could not be fitted: {}", road_id + 1, e),
        }
    }
    info!("{} roads collected for mesh generation", entries.len());
    if entries.is_empty() {
        return Ok(());
    }

    let patches = junction_patches(&entries);
    info!("{} T-junction patches generated", patches.len());
    entries.extend(patches);

    let entries = smart_interpolation(entries);
    let entries = split_long_line_surfaces(entries, TEXTURE_TILE_SIZE);

    generate_road_mesh(ctx, &entries)
}

fn point_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

fn segment_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len2 = dx * dx + dy * dy;
    if len2 < 1e-12 {
        return point_distance(p, a);
    }
    let t = (((p.0 - a.0) * dx + (p.1 - a.1) * dy) / len2).clamp(0.0, 1.0);
    point_distance(p, (a.0 + t * dx, a.1 + t * dy))
}

fn polyline_distance(p: (f64, f64), points: &[(f64, f64)]) -> f64 {
    points
        .windows(2)
        .map(|w| segment_distance(p, w[0], w[1]))
        .fold(f64::MAX, f64::min)
}

/// Finds T junctions where one road ends on the interior of another and
/// creates a short overlay patch from the continuous road, nudged down so
/// the surfaces do not z-fight.
fn junction_patches(entries: &[LineSurfaceEntry]) -> Vec<LineSurfaceEntry> {
    let mut patches = Vec::new();
    for (idx, road) in entries.iter().enumerate() {
        let endpoints = [road.points[0], *road.points.last().unwrap()];
        for (other_idx, other) in entries.iter().enumerate() {
            if idx == other_idx || other.points.len() < 2 {
                continue;
            }
            for endpoint in endpoints {
                if polyline_distance(endpoint, &other.points) >= JUNCTION_TOLERANCE {
                    continue;
                }
                // Meeting the other road's endpoint is a plain crossing,
                // not a T junction.
                if point_distance(endpoint, other.points[0]) < JUNCTION_TOLERANCE
                    || point_distance(endpoint, *other.points.last().unwrap())
                        < JUNCTION_TOLERANCE
                {
                    continue;
                }

                let segment_idx = other
                    .points
                    .windows(2)
                    .enumerate()
                    .min_by(|(_, a), (_, b)| {
                        segment_distance(endpoint, a[0], a[1])
                            .partial_cmp(&segment_distance(endpoint, b[0], b[1]))
                            .unwrap()
                    })
                    .map(|(i, _)| i);
                let Some(segment_idx) = segment_idx else { continue };

                let start = segment_idx.saturating_sub(2);
                let end = (segment_idx + 3).min(other.points.len() - 1);
                if end - start < 1 {
                    continue;
                }
                patches.push(LineSurfaceEntry {
                    points: other.points[start..=end].to_vec(),
                    width: other.width,
                    z_offset: other.z_offset + PATCH_Z_OFFSET,
                });
                debug!("created patch for T junction: road {} onto road {}", idx, other_idx);
            }
        }
    }
    patches
}

/// Extrudes every entry into a textured ribbon following the terrain and
/// writes the OBJ/MTL pair plus the I3D asset.
fn generate_road_mesh(
    ctx: &mut MapContext,
    entries: &[LineSurfaceEntry],
) -> Result<(), GenerationError> {
    let Some(dem) = background::load_best_not_resized(ctx) else {
        warn!("no processed terrain available, cannot generate the road mesh");
        return Ok(());
    };

    let roads_dir = ctx.map_directory.join("roads");
    std::fs::create_dir_all(&roads_dir).map_err(anyhow::Error::from)?;

    let texture_path = roads_dir.join("asphalt.png");
    write_asphalt_texture(&texture_path)?;

    let mesh = build_ribbon_mesh(ctx, entries, &dem);
    if mesh.is_empty() {
        warn!("no vertices generated for the road mesh");
        return Ok(());
    }

    let obj_path = roads_dir.join("roads.obj");
    let mtl_path = roads_dir.join("roads.mtl");
    obj::write_mtl(&mtl_path, &obj::MtlSpec::road("asphalt.png".to_string()))?;
    obj::write_obj(&mesh, &obj_path, "roads", Some(("roads.mtl", "RoadMaterial")))?;
    debug!(
        "road mesh written to {} with {} vertices and {} faces",
        obj_path.display(),
        mesh.vertices.len(),
        mesh.faces.len()
    );
    ctx.assets.roads_mesh = Some(obj_path);

    let mut scene_mesh = mesh;
    scene_mesh.rotate_x(90.0);
    scene_mesh.center_on_origin();

    let assets_dir = ctx.assets_dir().join("roads");
    std::fs::create_dir_all(&assets_dir).map_err(anyhow::Error::from)?;
    std::fs::copy(&texture_path, assets_dir.join("asphalt.png")).map_err(anyhow::Error::from)?;
    let i3d_path = assets_dir.join("roads.i3d");
    mesh::i3d::write_mesh_i3d(&scene_mesh, &i3d_path, "roads", Some("asphalt.png"), false)?;
    ctx.assets.roads_i3d = Some(i3d_path);
    Ok(())
}

/// Walks every polyline emitting left/right vertex pairs offset along the
/// averaged perpendicular, with V following the accumulated 3-D distance.
fn build_ribbon_mesh(ctx: &MapContext, entries: &[LineSurfaceEntry], dem: &Gray16) -> Mesh {
    let mut mesh = Mesh::default();
    let z_meters = ctx.mesh_z_scale();

    let patches = entries.iter().filter(|e| e.z_offset != 0.0).count();
    debug!("creating mesh for {} surfaces ({} patches)", entries.len(), patches);

    for entry in entries {
        if entry.points.len() < 2 {
            continue;
        }
        let vertex_offset = mesh.vertices.len() as u32;
        let perps = polyline_perpendiculars(&entry.points);

        let mut accumulated = 0.0f64;
        let mut prev_center: Option<(f64, f64, f64)> = None;
        for (&(x, y), &(px, py)) in entry.points.iter().zip(&perps) {
            let sx = (x.round() as i64).clamp(0, i64::from(dem.width()) - 1) as u32;
            let sy = (y.round() as i64).clamp(0, i64::from(dem.height()) - 1) as u32;
            let height = f64::from(dem.get_pixel(sx, sy).0[0]) * z_meters;
            let z = -height + entry.z_offset;

            mesh.vertices.push(Point3::new(
                (x + px * entry.width) as f32,
                (y + py * entry.width) as f32,
                z as f32,
            ));
            mesh.vertices.push(Point3::new(
                (x - px * entry.width) as f32,
                (y - py * entry.width) as f32,
                z as f32,
            ));

            if let Some(prev) = prev_center {
                accumulated += ((x - prev.0).powi(2)
                    + (y - prev.1).powi(2)
                    + (z - prev.2).powi(2))
                .sqrt();
            }
            prev_center = Some((x, y, z));

            let v = (accumulated / TEXTURE_TILE_SIZE) as f32;
            mesh.uvs.push(Point2::new(0.0, v));
            mesh.uvs.push(Point2::new(1.0, v));
        }

        for i in 0..entry.points.len() as u32 - 1 {
            let v0 = vertex_offset + i * 2;
            let v1 = v0 + 1;
            let v2 = v0 + 2;
            let v3 = v0 + 3;
            mesh.faces.push([v0, v2, v1]);
            mesh.faces.push([v1, v2, v3]);
        }
    }
    mesh
}

/// The tiled asphalt texture: flat gray with gaussian grain, enough for
/// the editor preview without shipping a binary asset.
fn write_asphalt_texture(path: &std::path::Path) -> Result<(), GenerationError> {
    if path.is_file() {
        return Ok(());
    }
    let mut rng = rand::thread_rng();
    let grain = rand_distr::Normal::new(80.0f32, 4.0).expect("valid distribution");
    let mut img = image::GrayImage::new(256, 256);
    for pixel in img.pixels_mut() {
        pixel.0[0] = rng.sample(grain).clamp(64.0, 96.0) as u8;
    }
    crate::raster::save_image(&img, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(points: Vec<(f64, f64)>, width: f64) -> LineSurfaceEntry {
        LineSurfaceEntry { points, width, z_offset: 0.0 }
    }

    #[test]
    fn t_junction_produces_exactly_one_patch() {
        let through = entry(vec![(0.0, 50.0), (40.0, 50.0), (80.0, 50.0), (120.0, 50.0)], 4.0);
        let stem = entry(vec![(60.0, 0.0), (60.0, 50.0)], 3.0);
        let patches = junction_patches(&[through.clone(), stem]);
        assert_eq!(patches.len(), 1);
        assert!((patches[0].z_offset - PATCH_Z_OFFSET).abs() < 1e-12);
        assert!((patches[0].width - through.width).abs() < 1e-12);
    }

    #[test]
    fn crossing_at_endpoints_is_not_a_t_junction() {
        let a = entry(vec![(0.0, 0.0), (100.0, 0.0)], 4.0);
        let b = entry(vec![(100.0, 0.0), (100.0, 100.0)], 4.0);
        assert!(junction_patches(&[a, b]).is_empty());
    }

    #[test]
    fn distant_roads_produce_no_patches() {
        let a = entry(vec![(0.0, 0.0), (100.0, 0.0)], 4.0);
        let b = entry(vec![(0.0, 50.0), (100.0, 50.0)], 4.0);
        assert!(junction_patches(&[a, b]).is_empty());
    }

    #[test]
    fn ribbon_mesh_v_coordinates_stay_in_engine_range() {
        let long = entry(vec![(0.0, 0.0), (700.0, 0.0)], 4.0);
        let split = split_long_line_surfaces(vec![long], TEXTURE_TILE_SIZE);
        assert!(split.len() >= 2);
        for piece in &split {
            let length = geometry::polyline_length(&piece.points);
            assert!(length / TEXTURE_TILE_SIZE <= 32.0);
        }
    }

    #[test]
    fn ribbon_faces_connect_consecutive_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = crate::map::tests::test_context(dir.path(), 256, 0);
        let dem = crate::raster::new_gray16(256, 256);
        let mesh = build_ribbon_mesh(
            &ctx,
            &[entry(vec![(10.0, 10.0), (20.0, 10.0), (30.0, 10.0)], 2.0)],
            &dem,
        );
        assert_eq!(mesh.vertices.len(), 6);
        assert_eq!(mesh.faces.len(), 4);
        assert_eq!(mesh.uvs.len(), 6);
        assert!((mesh.uvs[2].y - 1.0).abs() < 1e-6);
    }
}
