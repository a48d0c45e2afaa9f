use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::component::background;
use crate::error::GenerationError;
use crate::geometry;
use crate::infolayer::{self, keys, InfoLayerStore};
use crate::map::MapContext;
use crate::raster::load_gray8;
use crate::xmlutil::{self, ElementMatch, XmlFragment};

const FIELD_NODE_ID_START: u32 = 2000;
const SPLINE_NODE_ID_START: u32 = 5000;
const TREE_NODE_ID_START: u32 = 10000;
const TREES_DEFAULT_Y: i32 = 400;

pub(crate) fn process(ctx: &mut MapContext) -> Result<(), GenerationError> {
    update_height_scale(ctx)?;
    update_parameters(ctx)?;

    if ctx.game.i3d_processing() {
        add_fields(ctx)?;
        if ctx.settings.i3d.add_trees {
            add_forests(ctx)?;
        }
        add_splines(ctx)?;
    }
    Ok(())
}

fn read_map_i3d(ctx: &MapContext) -> Result<Option<(std::path::PathBuf, String)>, GenerationError> {
    let path = ctx.game.i3d_file_path(&ctx.map_directory);
    if !path.is_file() {
        warn!("map descriptor {} not found", path.display());
        return Ok(None);
    }
    let xml = std::fs::read_to_string(&path).map_err(anyhow::Error::from)?;
    Ok(Some((path, xml)))
}

/// Writes the height scale computed by the DEM stage into the terrain
/// transform group.
fn update_height_scale(ctx: &mut MapContext) -> Result<(), GenerationError> {
    if !ctx.shared.change_height_scale {
        return Ok(());
    }
    let Some(value) = ctx.shared.height_scale_value else { return Ok(()) };
    let Some((path, xml)) = read_map_i3d(ctx)? else { return Ok(()) };

    let value = (value as i64).to_string();
    let (xml, touched) = xmlutil::update_attributes(
        &xml,
        &ElementMatch::named("TerrainTransformGroup").within("Scene"),
        &[("heightScale", value.as_str())],
    )?;
    if touched == 0 {
        warn!("TerrainTransformGroup not found in {}", path.display());
    }
    std::fs::write(&path, xml).map_err(anyhow::Error::from)?;
    Ok(())
}

/// Sun shadow bounding box and displacement layer size follow the map size.
fn update_parameters(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let Some((path, xml)) = read_map_i3d(ctx)? else { return Ok(()) };
    let distance = ctx.size / 2;

    let bbox_min = format!("-{},-128,-{}", distance, distance);
    let bbox_max = format!("{},148,{}", distance, distance);
    let (xml, _) = xmlutil::update_attributes(
        &xml,
        &ElementMatch::with_attr("Light", "name", "sun"),
        &[
            ("lastShadowMapSplitBboxMin", bbox_min.as_str()),
            ("lastShadowMapSplitBboxMax", bbox_max.as_str()),
        ],
    )?;

    let displacement = (ctx.size * 8).to_string();
    let (xml, _) = xmlutil::update_attributes(
        &xml,
        &ElementMatch::named("DisplacementLayer").within("TerrainTransformGroup"),
        &[("size", displacement.as_str())],
    )?;
    std::fs::write(&path, xml).map_err(anyhow::Error::from)?;
    Ok(())
}

/// Converts a raster pixel coordinate into the game's centered frame.
fn top_left_to_center(ctx: &MapContext, point: (f64, f64)) -> (i64, i64) {
    let half = i64::from(ctx.scaled_size() / 2);
    (point.0 as i64 - half, point.1 as i64 - half)
}

fn sample_height_meters(
    dem: &crate::raster::Gray16,
    ctx: &MapContext,
    x: f64,
    y: f64,
) -> f64 {
    let sx = (x.round() as i64).clamp(0, i64::from(dem.width()) - 1) as u32;
    let sy = (y.round() as i64).clamp(0, i64::from(dem.height()) - 1) as u32;
    f64::from(dem.get_pixel(sx, sy).0[0]) * ctx.mesh_z_scale()
}

/// Emits one NURBS spline per recorded road polyline into the splines
/// descriptor, sampling Y from the processed terrain.
fn add_splines(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let splines_path = ctx.game.splines_file_path(&ctx.map_directory);
    if !splines_path.is_file() {
        warn!("splines descriptor {} not found", splines_path.display());
        return Ok(());
    }
    let store = InfoLayerStore::load(&infolayer::textures_store_path(&ctx.map_directory))?;
    let Some(roads) = store.polylines(keys::ROADS_POLYLINES) else {
        warn!("road polylines not found in the textures info layer");
        return Ok(());
    };
    let Some(dem) = background::load_best_not_resized(ctx) else {
        warn!("no processed terrain found for spline height sampling");
        return Ok(());
    };

    let opts = ctx.playable_fit_options();
    let scale = ctx.size_scale();

    let mut scene = XmlFragment::new();
    let mut shapes = XmlFragment::new();
    let mut attributes = XmlFragment::new();
    let mut node_id = SPLINE_NODE_ID_START;
    let mut emitted = 0usize;

    for (road_id, road) in roads.iter().enumerate() {
        let points: Vec<(f64, f64)> =
            road.points.iter().map(|p| (f64::from(p[0]), f64::from(p[1]))).collect();
        let fitted = match geometry::fit_polyline_into_bounds(&points, &opts) {
            Ok(fitted) => fitted,
            Err(e) => {
                debug!("road {} could not be fitted for splines: {}", road_id + 1, e);
                continue;
            }
        };
        let dense = geometry::interpolate_points(&fitted, ctx.settings.spline.spline_density);

        let mut variants: Vec<(String, Vec<(f64, f64)>)> =
            vec![(format!("spline{}", road_id + 1), dense.clone())];
        if ctx.settings.spline.add_reversed_splines {
            let mut reversed = dense;
            reversed.reverse();
            variants.push((format!("spline{}_reversed", road_id + 1), reversed));
        }

        for (name, polyline) in variants {
            let id = node_id.to_string();
            scene
                .empty(
                    "Shape",
                    &[
                        ("name", name.as_str()),
                        ("translation", "0 0 0"),
                        ("nodeId", id.as_str()),
                        ("shapeId", id.as_str()),
                    ],
                )
                .map_err(anyhow::Error::from)?;

            shapes
                .start(
                    "NurbsCurve",
                    &[
                        ("name", name.as_str()),
                        ("shapeId", id.as_str()),
                        ("degree", "3"),
                        ("form", "open"),
                    ],
                )
                .map_err(anyhow::Error::from)?;
            for &(x, y) in &polyline {
                let (cx, cy) = top_left_to_center(ctx, (x, y));
                let z = sample_height_meters(&dem, ctx, x / scale, y / scale);
                let c = format!("{}, {:.3}, {}", cx, z, cy);
                shapes.empty("cv", &[("c", c.as_str())]).map_err(anyhow::Error::from)?;
            }
            shapes.end("NurbsCurve").map_err(anyhow::Error::from)?;

            append_user_attribute(
                &mut attributes,
                node_id,
                &[("maxSpeedScale", "integer", "1"), ("speedLimit", "integer", "100")],
            )?;
            node_id += 1;
            emitted += 1;
        }
    }

    if emitted == 0 {
        return Ok(());
    }

    let xml = std::fs::read_to_string(&splines_path).map_err(anyhow::Error::from)?;
    let (xml, _) = xmlutil::insert_into(&xml, &ElementMatch::named("Scene"), &scene.into_string()?)?;
    let (xml, _) =
        xmlutil::insert_into(&xml, &ElementMatch::named("Shapes"), &shapes.into_string()?)?;
    let (xml, placed) = xmlutil::insert_into(
        &xml,
        &ElementMatch::named("UserAttributes"),
        &attributes.into_string()?,
    )?;
    if placed == 0 {
        warn!("UserAttributes element not found in {}", splines_path.display());
    }
    std::fs::write(&splines_path, xml).map_err(anyhow::Error::from)?;
    debug!("{} splines written to {}", emitted, splines_path.display());
    Ok(())
}

fn append_user_attribute(
    fragment: &mut XmlFragment,
    node_id: u32,
    attributes: &[(&str, &str, &str)],
) -> Result<(), GenerationError> {
    let id = node_id.to_string();
    fragment.start("UserAttribute", &[("nodeId", id.as_str())]).map_err(anyhow::Error::from)?;
    for (name, kind, value) in attributes {
        fragment
            .empty("Attribute", &[("name", name), ("type", kind), ("value", value)])
            .map_err(anyhow::Error::from)?;
    }
    fragment.end("UserAttribute").map_err(anyhow::Error::from)?;
    Ok(())
}

const FIELD_ATTRIBUTES: [(&str, &str, &str); 6] = [
    ("angle", "integer", "0"),
    ("missionAllowed", "boolean", "true"),
    ("missionOnlyGrass", "boolean", "false"),
    ("nameIndicatorIndex", "string", "1"),
    ("polygonIndex", "string", "0"),
    ("teleportIndicatorIndex", "string", "2"),
];

/// Emits one gameplay field node per recorded field polygon: the polygon
/// points relative to the centroid plus name and teleport indicators.
fn add_fields(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let store = InfoLayerStore::load(&infolayer::textures_store_path(&ctx.map_directory))?;
    let Some(fields) = store.polygons(keys::FIELDS) else {
        warn!("fields data not found in the textures info layer");
        return Ok(());
    };
    debug!("adding {} fields to the map descriptor", fields.len());

    let border = ctx
        .schema
        .layer_by_usage("field")
        .and_then(|l| l.border)
        .unwrap_or(0);
    let mut opts = ctx.playable_fit_options();
    opts.border = f64::from(border);

    let mut fields_fragment = XmlFragment::new();
    let mut attributes = XmlFragment::new();
    let mut node_id = FIELD_NODE_ID_START;
    let mut field_id = 1u32;
    let mut emitted = 0usize;

    for polygon in fields {
        let points: Vec<(f64, f64)> =
            polygon.iter().map(|p| (f64::from(p[0]), f64::from(p[1]))).collect();
        let fitted = match geometry::fit_polygon_into_bounds(&points, &opts) {
            Ok(fitted) => fitted,
            Err(e) => {
                debug!("field {} could not be fitted: {}", field_id, e);
                continue;
            }
        };
        let centered: Vec<(i64, i64)> =
            fitted.iter().map(|&p| top_left_to_center(ctx, p)).collect();
        let (cx, cy) = {
            let center = geometry::polygon_center(
                &centered.iter().map(|&(x, y)| (x as f64, y as f64)).collect::<Vec<_>>(),
            );
            (center.0.round() as i64, center.1.round() as i64)
        };

        let field_node_id = node_id;
        let name = format!("field{}", field_id);
        let translation = format!("{} 0 {}", cx, cy);
        fields_fragment
            .start(
                "TransformGroup",
                &[
                    ("name", name.as_str()),
                    ("translation", translation.as_str()),
                    ("nodeId", field_node_id.to_string().as_str()),
                ],
            )
            .map_err(anyhow::Error::from)?;
        node_id += 1;

        fields_fragment
            .start(
                "TransformGroup",
                &[("name", "polygonPoints"), ("nodeId", node_id.to_string().as_str())],
            )
            .map_err(anyhow::Error::from)?;
        node_id += 1;
        for (point_id, &(x, y)) in centered.iter().enumerate() {
            let point_name = format!("point{}", point_id + 1);
            let offset = format!("{} 0 {}", x - cx, y - cy);
            fields_fragment
                .empty(
                    "TransformGroup",
                    &[
                        ("name", point_name.as_str()),
                        ("translation", offset.as_str()),
                        ("nodeId", node_id.to_string().as_str()),
                    ],
                )
                .map_err(anyhow::Error::from)?;
            node_id += 1;
        }
        fields_fragment.end("TransformGroup").map_err(anyhow::Error::from)?;

        fields_fragment
            .start(
                "TransformGroup",
                &[("name", "nameIndicator"), ("nodeId", node_id.to_string().as_str())],
            )
            .map_err(anyhow::Error::from)?;
        node_id += 1;
        let note = format!("{}\n0.00 ha", name);
        fields_fragment
            .empty(
                "Note",
                &[
                    ("name", "Note"),
                    ("nodeId", node_id.to_string().as_str()),
                    ("text", note.as_str()),
                    ("color", "4278190080"),
                    ("fixedSize", "true"),
                ],
            )
            .map_err(anyhow::Error::from)?;
        node_id += 1;
        fields_fragment.end("TransformGroup").map_err(anyhow::Error::from)?;

        fields_fragment
            .empty(
                "TransformGroup",
                &[("name", "teleportIndicator"), ("nodeId", node_id.to_string().as_str())],
            )
            .map_err(anyhow::Error::from)?;
        node_id += 1;
        fields_fragment.end("TransformGroup").map_err(anyhow::Error::from)?;

        append_user_attribute(&mut attributes, field_node_id, &FIELD_ATTRIBUTES)?;
        field_id += 1;
        emitted += 1;
    }

    if emitted == 0 {
        return Ok(());
    }

    let Some((path, xml)) = read_map_i3d(ctx)? else { return Ok(()) };
    let (xml, placed) = xmlutil::insert_into(
        &xml,
        &ElementMatch::with_attr("TransformGroup", "name", "fields"),
        &fields_fragment.into_string()?,
    )?;
    if placed == 0 {
        warn!("fields transform group not found in {}", path.display());
        return Ok(());
    }
    let (xml, _) = xmlutil::insert_into(
        &xml,
        &ElementMatch::named("UserAttributes"),
        &attributes.into_string()?,
    )?;
    std::fs::write(&path, xml).map_err(anyhow::Error::from)?;
    debug!("{} fields written to the map descriptor", emitted);
    Ok(())
}

/// Scatters tree reference nodes over the forest mask at the configured
/// density with positional jitter and random yaw.
fn add_forests(ctx: &mut MapContext) -> Result<(), GenerationError> {
    if ctx.tree_schema.is_empty() {
        warn!("tree schema is empty, skipping forests");
        return Ok(());
    }
    let Some(forest_layer) = ctx.schema.layer_by_usage("forest") else {
        warn!("forest layer not found in the texture schema");
        return Ok(());
    };
    let weights_dir = ctx.game.weights_dir(&ctx.map_directory);
    let forest_path = forest_layer.preview_or_path(&weights_dir);
    if !forest_path.is_file() {
        warn!("forest mask not found at {}", forest_path.display());
        return Ok(());
    }
    let forest = load_gray8(&forest_path)?;

    let density = ctx.settings.i3d.forest_density.max(1);
    let shift_range =
        f64::from(density) * f64::from(ctx.settings.i3d.trees_relative_shift) / 100.0;
    let mut rng = rand::thread_rng();

    let mut trees = XmlFragment::new();
    let mut node_id = TREE_NODE_ID_START;
    let translation = format!("0 {} 0", TREES_DEFAULT_Y);
    trees
        .start(
            "TransformGroup",
            &[
                ("name", "trees"),
                ("translation", translation.as_str()),
                ("nodeId", node_id.to_string().as_str()),
            ],
        )
        .map_err(anyhow::Error::from)?;
    node_id += 1;

    let mut planted = 0usize;
    for y in (0..forest.height()).step_by(density as usize) {
        for x in (0..forest.width()).step_by(density as usize) {
            if forest.get_pixel(x, y).0[0] == 0 {
                continue;
            }
            let (cx, cy) = top_left_to_center(ctx, (f64::from(x), f64::from(y)));
            let shifted_x = cx as f64 + rng.gen_range(-shift_range..=shift_range);
            let shifted_y = cy as f64 + rng.gen_range(-shift_range..=shift_range);
            let rotation: i32 = rng.gen_range(-180..=180);

            let tree = ctx.tree_schema.choose(&mut rng).unwrap();
            node_id += 1;
            let translation = format!("{:.2} 0 {:.2}", shifted_x, shifted_y);
            let yaw = format!("0 {} 0", rotation);
            trees
                .empty(
                    "ReferenceNode",
                    &[
                        ("name", tree.name.as_str()),
                        ("translation", translation.as_str()),
                        ("rotation", yaw.as_str()),
                        ("referenceId", tree.reference_id.to_string().as_str()),
                        ("nodeId", node_id.to_string().as_str()),
                    ],
                )
                .map_err(anyhow::Error::from)?;
            planted += 1;
        }
    }
    trees.end("TransformGroup").map_err(anyhow::Error::from)?;

    if planted == 0 {
        debug!("forest mask has no set pixels, no trees planted");
        return Ok(());
    }

    let Some((path, xml)) = read_map_i3d(ctx)? else { return Ok(()) };
    let (xml, placed) =
        xmlutil::insert_into(&xml, &ElementMatch::named("Scene"), &trees.into_string()?)?;
    if placed == 0 {
        warn!("Scene element not found in {}", path.display());
        return Ok(());
    }
    std::fs::write(&path, xml).map_err(anyhow::Error::from)?;
    debug!("{} trees planted", planted);
    Ok(())
}
