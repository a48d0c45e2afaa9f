use std::path::PathBuf;

use anyhow::Result;
use log::{debug, warn};
use rand::Rng;

use crate::error::GenerationError;
use crate::geometry::{buffer_point, buffer_polyline, offset_polygon_mitre};
use crate::infolayer::{self, InfoLayerStore, PolylineRecord};
use crate::map::MapContext;
use crate::osm::{BoundingBox, OsmGeometry};
use crate::raster::{
    self, any_nonzero8, fill_polygon, invert8, load_gray8, mask_against, new_gray8, or_into,
    resize_nearest8, rotate_and_crop8, save_image, Gray8,
};
use crate::schema::{LayerSpec, TagFilter};

/// One rasterization pass over a set of layers. The main texture component
/// runs the full schema at playable-map sizes; the background component
/// reruns a restricted copy at background sizes.
pub struct TexturePass {
    pub layers: Vec<LayerSpec>,
    /// Canvas side before rotation compensation (pixels, unscaled).
    pub map_size: u32,
    /// Canvas side the intermediate rasters are drawn at.
    pub rotated_size: u32,
    pub store_path: PathBuf,
    /// Record `water` polylines in addition to `roads` ones.
    pub record_water_lines: bool,
    pub skip_scaling: bool,
}

pub(crate) fn process(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let pass = TexturePass {
        layers: ctx.schema.layers.clone(),
        map_size: ctx.size,
        rotated_size: ctx.rotated_size(),
        store_path: infolayer::textures_store_path(&ctx.map_directory),
        record_water_lines: false,
        skip_scaling: false,
    };
    run_pass(ctx, &pass)?;
    Ok(())
}

pub(crate) fn run_pass(ctx: &MapContext, pass: &TexturePass) -> Result<(), GenerationError> {
    let weights_dir = ctx.game.weights_dir(&ctx.map_directory);
    std::fs::create_dir_all(&weights_dir).map_err(anyhow::Error::from)?;

    prepare_weights(pass, &weights_dir)?;
    draw(ctx, pass, &weights_dir)?;
    rotate_textures(ctx, pass, &weights_dir)?;
    merge_layers(pass, &weights_dir)?;
    if !pass.skip_scaling {
        scale_textures(ctx, pass, &weights_dir)?;
    }
    add_borders(pass, &weights_dir)?;
    if ctx.settings.texture.dissolve && ctx.game.dissolve() {
        dissolve(pass, &weights_dir)?;
    }
    copy_procedural(ctx, pass, &weights_dir)?;
    Ok(())
}

/// Creates the zero-filled weight files. Layers without tags are already at
/// the final canvas size; tagged layers start at the rotated size and get
/// cropped after rotation compensation.
fn prepare_weights(pass: &TexturePass, weights_dir: &std::path::Path) -> Result<()> {
    for layer in &pass.layers {
        let size = if layer.has_tags() { pass.rotated_size } else { pass.map_size };
        for path in layer.paths(weights_dir) {
            save_image(&new_gray8(size, size), &path)?;
        }
    }
    debug!("prepared weights for {} layers", pass.layers.len());
    Ok(())
}

fn pixel_from_lat_lon(bbox: &BoundingBox, rotated_size: u32, lat: f64, lon: f64) -> (f64, f64) {
    let x = (lon - bbox.west) / (bbox.east - bbox.west) * f64::from(rotated_size);
    let y = (lat - bbox.north) / (bbox.south - bbox.north) * f64::from(rotated_size);
    (x, y)
}

/// Projects one feature into map-local pixel space and buffers lines and
/// points into polygons. Returns `None` for geometry the layer cannot use.
fn feature_to_polygon(
    bbox: &BoundingBox,
    rotated_size: u32,
    geometry: &OsmGeometry,
    width: Option<f64>,
) -> Option<Vec<(f64, f64)>> {
    match geometry {
        OsmGeometry::Polygon(ring) => Some(
            ring.iter()
                .map(|&(lon, lat)| pixel_from_lat_lon(bbox, rotated_size, lat, lon))
                .collect(),
        ),
        OsmGeometry::Line(line) => {
            let width = width?;
            let pixels: Vec<(f64, f64)> = line
                .iter()
                .map(|&(lon, lat)| pixel_from_lat_lon(bbox, rotated_size, lat, lon))
                .collect();
            if pixels.len() < 2 {
                return None;
            }
            Some(buffer_polyline(&pixels, width))
        }
        OsmGeometry::Point(p) => {
            let width = width?;
            let center = pixel_from_lat_lon(bbox, rotated_size, p.1, p.0);
            Some(buffer_point(center, width))
        }
    }
}

fn scaled_points(points: &[(f64, f64)], size_scale: f64) -> Vec<[i32; 2]> {
    points
        .iter()
        .map(|&(x, y)| [(x * size_scale) as i32, (y * size_scale) as i32])
        .collect()
}

fn draw(
    ctx: &MapContext,
    pass: &TexturePass,
    weights_dir: &std::path::Path,
) -> Result<(), GenerationError> {
    let bbox = BoundingBox::from_center(ctx.center, f64::from(pass.rotated_size) / 2.0);
    let mut store = InfoLayerStore::default();
    let mut cumulative = new_gray8(pass.rotated_size, pass.rotated_size);

    let ordered: Vec<&LayerSpec> = {
        let mut sorted: Vec<&LayerSpec> = pass.layers.iter().filter(|l| l.has_tags()).collect();
        sorted.sort_by_key(|l| match l.priority {
            None => (0, 0i64),
            Some(p) => (1, -i64::from(p)),
        });
        sorted
    };

    for layer in ordered {
        if ctx.settings.texture.skip_drains && layer.usage.as_deref() == Some("drain") {
            debug!("skipping drain layer {}", layer.name);
            continue;
        }
        if layer.is_base() {
            debug!("base layer {} postponed to the final fill", layer.name);
            continue;
        }

        let layer_path = layer.path(weights_dir);
        let mut layer_image = load_gray8(&layer_path)?;

        draw_layer(ctx, pass, &bbox, layer, &mut layer_image, &mut store);
        record_polylines(ctx, pass, &bbox, layer, &mut store);

        let output = if layer.external {
            layer_image
        } else {
            let masked = mask_against(&layer_image, &cumulative);
            or_into(&mut cumulative, &masked);
            masked
        };
        save_image(&output, &layer_path)?;
        debug!("texture {} saved", layer_path.display());
    }

    store.save(&pass.store_path)?;

    if let Some(base) = pass.layers.iter().find(|l| l.is_base()) {
        let base_path = base.path(weights_dir);
        save_image(&invert8(&cumulative), &base_path)?;
        debug!("base texture {} saved", base_path.display());
    }
    Ok(())
}

fn draw_layer(
    ctx: &MapContext,
    pass: &TexturePass,
    bbox: &BoundingBox,
    layer: &LayerSpec,
    layer_image: &mut Gray8,
    store: &mut InfoLayerStore,
) {
    let tags = effective_tags(ctx, layer);
    let Some(tags) = tags else { return };

    let features = match ctx.osm.features(bbox, tags) {
        Ok(features) => features,
        Err(e) => {
            debug!("no features for layer {}: {}", layer.name, e);
            return;
        }
    };
    debug!("fetched {} features for layer {}", features.len(), layer.name);

    for feature in &features {
        let Some(mut polygon) =
            feature_to_polygon(bbox, pass.rotated_size, &feature.geometry, layer.width)
        else {
            continue;
        };
        if polygon.len() < 3 {
            debug!("skipping polygon with less than 3 points");
            continue;
        }

        if layer.info_layer.as_deref() == Some(infolayer::keys::FIELDS)
            && ctx.settings.texture.fields_padding > 0
        {
            match offset_polygon_mitre(&polygon, -f64::from(ctx.settings.texture.fields_padding)) {
                Some(padded) => polygon = padded,
                None => debug!("padding value too high, field left unpadded"),
            }
        }

        if let Some(key) = &layer.info_layer {
            store.add_polygon(key, scaled_points(&polygon, ctx.size_scale()));
        }
        if !layer.invisible {
            if let Err(e) = fill_polygon(layer_image, &polygon, 255) {
                debug!("error drawing polygon on {}: {}", layer.name, e);
            }
        }
    }
}

fn effective_tags<'a>(ctx: &MapContext, layer: &'a LayerSpec) -> Option<&'a TagFilter> {
    if ctx.settings.texture.use_precise_tags {
        if let Some(precise) = &layer.precise_tags {
            return Some(precise);
        }
    }
    layer.tags.as_ref()
}

/// Records the raw polylines of road and waterway layers so later stages
/// can rebuild center lines instead of working from rasterized masks.
fn record_polylines(
    ctx: &MapContext,
    pass: &TexturePass,
    bbox: &BoundingBox,
    layer: &LayerSpec,
    store: &mut InfoLayerStore,
) {
    let Some(info_layer) = layer.info_layer.as_deref() else { return };
    let records_lines = info_layer == infolayer::keys::ROADS
        || (pass.record_water_lines && info_layer == infolayer::keys::WATER);
    if !records_lines {
        return;
    }
    let Some(tags) = layer.tags.as_ref() else { return };
    let Ok(features) = ctx.osm.features(bbox, tags) else { return };

    let key = format!("{}_polylines", info_layer);
    for feature in &features {
        if let OsmGeometry::Line(line) = &feature.geometry {
            let pixels: Vec<(f64, f64)> = line
                .iter()
                .map(|&(lon, lat)| pixel_from_lat_lon(bbox, pass.rotated_size, lat, lon))
                .collect();
            store.add_polyline(
                &key,
                PolylineRecord {
                    points: scaled_points(&pixels, ctx.size_scale()),
                    width: layer.width.unwrap_or(1.0),
                    tags: format!("{:?}", tags),
                },
            );
        }
    }
}

/// Rotates every tagged layer back by the map rotation and crops it to the
/// unrotated canvas. Tagless layers were never oversized.
fn rotate_textures(
    ctx: &MapContext,
    pass: &TexturePass,
    weights_dir: &std::path::Path,
) -> Result<()> {
    if ctx.rotation == 0 {
        return Ok(());
    }
    for layer in &pass.layers {
        if !layer.has_tags() {
            debug!("layer {} has no tags, skipping rotation", layer.name);
            continue;
        }
        let mut paths = layer.paths(weights_dir);
        paths.push(layer.path_preview(weights_dir));
        for path in paths {
            if !path.is_file() {
                continue;
            }
            let img = load_gray8(&path)?;
            let rotated = rotate_and_crop8(&img, ctx.rotation, pass.map_size, pass.map_size);
            save_image(&rotated, &path)?;
        }
    }
    Ok(())
}

/// OR-composites layers marked `merge_into` onto their target and clears
/// the source file.
fn merge_layers(pass: &TexturePass, weights_dir: &std::path::Path) -> Result<()> {
    for layer in &pass.layers {
        let Some(target_name) = &layer.merge_into else { continue };
        let Some(target) = pass.layers.iter().find(|l| &l.name == target_name) else {
            continue;
        };
        let source_path = layer.path(weights_dir);
        let target_path = target.path(weights_dir);
        if !source_path.is_file() || !target_path.is_file() {
            continue;
        }
        let source = load_gray8(&source_path)?;
        let mut merged = load_gray8(&target_path)?;
        if source.dimensions() != merged.dimensions() {
            warn!(
                "layer {} and merge target {} have different sizes, skipping merge",
                layer.name, target.name
            );
            continue;
        }
        or_into(&mut merged, &source);
        save_image(&merged, &target_path)?;
        save_image(&new_gray8(source.width(), source.height()), &source_path)?;
        debug!("merged layer {} into {}", layer.name, target.name);
    }
    Ok(())
}

fn scale_textures(
    ctx: &MapContext,
    pass: &TexturePass,
    weights_dir: &std::path::Path,
) -> Result<()> {
    let Some(output_size) = ctx.output_size else {
        debug!("no output size defined, skipping scaling");
        return Ok(());
    };
    for layer in &pass.layers {
        let mut paths = layer.paths(weights_dir);
        paths.push(layer.path_preview(weights_dir));
        for path in paths {
            if !path.is_file() {
                continue;
            }
            let img = load_gray8(&path)?;
            save_image(&resize_nearest8(&img, output_size, output_size), &path)?;
        }
    }
    Ok(())
}

/// Erases the border band of layers that carry one and hands those pixels
/// to the base layer so map edges blend.
fn add_borders(pass: &TexturePass, weights_dir: &std::path::Path) -> Result<()> {
    let base = pass.layers.iter().find(|l| l.is_base());
    let mut base_image = match base {
        Some(layer) => Some(load_gray8(&layer.path(weights_dir))?),
        None => None,
    };

    for layer in &pass.layers {
        let Some(border) = layer.border else { continue };
        if border == 0 {
            continue;
        }
        let path = layer.path(weights_dir);
        if !path.is_file() {
            continue;
        }
        let mut img = load_gray8(&path)?;
        raster::transfer_border(&mut img, base_image.as_mut(), border);
        save_image(&img, &path)?;
        debug!("borders added to layer {}", layer.name);
    }

    if let (Some(layer), Some(img)) = (base, base_image) {
        save_image(&img, &layer.path(weights_dir))?;
    }
    Ok(())
}

/// Splits each tagged layer's pixels across its weight variants uniformly
/// at random, keeping the original mask as a `_preview` file.
fn dissolve(pass: &TexturePass, weights_dir: &std::path::Path) -> Result<()> {
    let mut rng = rand::thread_rng();
    for layer in &pass.layers {
        if layer.tags.is_none() || layer.count < 2 {
            continue;
        }
        let paths = layer.paths(weights_dir);
        let source = load_gray8(&layer.path(weights_dir))?;
        if !any_nonzero8(&source) {
            debug!("layer {} has no set pixels, skipping dissolve", layer.name);
            continue;
        }
        save_image(&source, &layer.path_preview(weights_dir))?;

        let mut variants: Vec<Gray8> =
            (0..layer.count).map(|_| new_gray8(source.width(), source.height())).collect();
        for (x, y, pixel) in source.enumerate_pixels() {
            if pixel.0[0] != 0 {
                let pick = rng.gen_range(0..layer.count) as usize;
                variants[pick].put_pixel(x, y, image::Luma([255]));
            }
        }
        for (variant, path) in variants.iter().zip(&paths) {
            save_image(variant, path)?;
        }
        debug!("dissolved layer {} into {} variants", layer.name, layer.count);
    }
    Ok(())
}

/// Copies (or OR-merges) layers into `masks/{name}.png` for procedural
/// generation consumers, and guarantees an empty BLOCKMASK exists.
fn copy_procedural(
    ctx: &MapContext,
    pass: &TexturePass,
    weights_dir: &std::path::Path,
) -> Result<()> {
    let masks_dir = weights_dir.join("masks");
    std::fs::create_dir_all(&masks_dir)?;

    let blockmask = masks_dir.join("BLOCKMASK.png");
    if !blockmask.is_file() {
        debug!("BLOCKMASK.png not found, creating an empty one");
        save_image(&new_gray8(ctx.scaled_size(), ctx.scaled_size()), &blockmask)?;
    }

    let mut by_key: std::collections::BTreeMap<String, Vec<PathBuf>> = Default::default();
    for layer in &pass.layers {
        if let Some(keys) = &layer.procedural {
            let source = layer.preview_or_path(weights_dir);
            for key in keys {
                by_key.entry(key.clone()).or_default().push(source.clone());
            }
        }
    }

    for (key, sources) in by_key {
        let save_path = masks_dir.join(format!("{}.png", key));
        let mut merged: Option<Gray8> = None;
        for source in sources {
            if !source.is_file() {
                continue;
            }
            let img = load_gray8(&source)?;
            match &mut merged {
                None => merged = Some(img),
                Some(acc) if acc.dimensions() == img.dimensions() => or_into(acc, &img),
                Some(_) => warn!("procedural source {} has a mismatched size", source.display()),
            }
        }
        if let Some(img) = merged {
            save_image(&img, &save_path)?;
            debug!("procedural mask {} written", save_path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_transform_round_trips_within_one_pixel() {
        let bbox = BoundingBox::from_center((45.286, 20.239), 1024.0 / 2.0);
        let size = 1024u32;
        for &(lat, lon) in &[
            (45.286, 20.239),
            (bbox.south + 1e-5, bbox.west + 1e-5),
            (bbox.north - 1e-5, bbox.east - 1e-5),
        ] {
            let (x, y) = pixel_from_lat_lon(&bbox, size, lat, lon);
            // Inverse derived from the same bbox.
            let lon_back = bbox.west + x / f64::from(size) * (bbox.east - bbox.west);
            let lat_back = bbox.north + y / f64::from(size) * (bbox.south - bbox.north);
            let (x2, y2) = pixel_from_lat_lon(&bbox, size, lat_back, lon_back);
            assert!((x - x2).abs() <= 1.0);
            assert!((y - y2).abs() <= 1.0);
        }
    }

    #[test]
    fn corner_pixels_land_on_the_canvas_corners() {
        let bbox = BoundingBox::from_center((45.0, 20.0), 512.0);
        let (x, y) = pixel_from_lat_lon(&bbox, 1024, bbox.north, bbox.west);
        assert!(x.abs() < 1e-6 && y.abs() < 1e-6);
        let (x, y) = pixel_from_lat_lon(&bbox, 1024, bbox.south, bbox.east);
        assert!((x - 1024.0).abs() < 1e-6 && (y - 1024.0).abs() < 1e-6);
    }

    #[test]
    fn line_features_without_width_are_dropped() {
        let bbox = BoundingBox::from_center((45.0, 20.0), 512.0);
        let line = OsmGeometry::Line(vec![(20.0, 45.0), (20.001, 45.0)]);
        assert!(feature_to_polygon(&bbox, 1024, &line, None).is_none());
        assert!(feature_to_polygon(&bbox, 1024, &line, Some(4.0)).is_some());
    }

    fn dissolvable_layer(name: &str, count: u32) -> LayerSpec {
        let mut tags = TagFilter::new();
        tags.insert("landuse".into(), crate::schema::TagMatch::One("meadow".into()));
        LayerSpec {
            name: name.into(),
            count,
            tags: Some(tags),
            width: None,
            color: None,
            exclude_weight: false,
            priority: None,
            info_layer: None,
            usage: None,
            background: false,
            invisible: false,
            procedural: None,
            border: None,
            precise_tags: None,
            area_water: false,
            merge_into: None,
            building_category: None,
            external: false,
        }
    }

    #[test]
    fn dissolve_splits_pixels_evenly_and_loses_none() {
        let dir = tempfile::tempdir().unwrap();
        let weights_dir = dir.path().to_path_buf();
        let layer = dissolvable_layer("grass", 2);

        // Half the canvas belongs to the layer.
        let size = 128u32;
        let mut source = new_gray8(size, size);
        for (x, _, pixel) in source.enumerate_pixels_mut() {
            if x < size / 2 {
                pixel.0[0] = 255;
            }
        }
        save_image(&source, &layer.path(&weights_dir)).unwrap();
        save_image(&new_gray8(size, size), &weights_dir.join("grass02_weight.png")).unwrap();

        let pass = TexturePass {
            layers: vec![layer.clone()],
            map_size: size,
            rotated_size: size,
            store_path: weights_dir.join("textures.json"),
            record_water_lines: false,
            skip_scaling: true,
        };
        dissolve(&pass, &weights_dir).unwrap();

        let variants: Vec<Gray8> = layer
            .paths(&weights_dir)
            .iter()
            .map(|p| load_gray8(p).unwrap())
            .collect();
        let total = u64::from(size) * u64::from(size) / 2;

        // The union of variants reproduces the original mask exactly.
        for (x, y, pixel) in source.enumerate_pixels() {
            let union = variants.iter().any(|v| v.get_pixel(x, y).0[0] == 255);
            assert_eq!(union, pixel.0[0] == 255);
            let claimed =
                variants.iter().filter(|v| v.get_pixel(x, y).0[0] == 255).count();
            assert!(claimed <= 1);
        }

        // Binomial concentration: per-variant counts stay near an even
        // split within a few standard deviations.
        let counts: Vec<u64> = variants
            .iter()
            .map(|v| v.pixels().filter(|p| p.0[0] == 255).count() as u64)
            .collect();
        assert_eq!(counts.iter().sum::<u64>(), total);
        let tolerance = 4.0 * (total as f64).sqrt();
        for &count in &counts {
            assert!((count as f64 - total as f64 / 2.0).abs() < tolerance);
        }

        // The original mask survives as the preview file.
        assert!(layer.path_preview(&weights_dir).is_file());
    }
}
