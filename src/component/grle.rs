use image::Luma;
use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::GenerationError;
use crate::geometry::{self, offset_polygon_mitre};
use crate::infolayer::{self, keys, InfoLayerStore};
use crate::map::{MapContext, FARMLAND_ID_LIMIT};
use crate::raster::{
    erode_mask, fill_polygon, load_gray8, new_gray8, resize_nearest8, save_image, Gray8,
};
use crate::xmlutil::{self, ElementMatch, XmlFragment};

const PLANT_ISLAND_MINIMUM_SIZE: u32 = 10;
const PLANT_ISLAND_MAXIMUM_SIZE: u32 = 200;
const PLANT_ISLAND_VERTEX_COUNT: usize = 30;
const PLANT_ISLAND_ROUNDING_RADIUS: f64 = 15.0;
const PLANT_ISLAND_DISTORTION: f64 = 0.3;

/// Pixel values of the plant types the game understands.
fn plant_pixel_value(name: &str) -> Option<u8> {
    match name {
        "smallDenseMix" => Some(33),
        "meadow" => Some(131),
        _ => None,
    }
}

pub(crate) fn process(ctx: &mut MapContext) -> Result<(), GenerationError> {
    if ctx.grle_schema.is_empty() {
        debug!("no GRLE schema for this game, skipping");
        return Ok(());
    }

    let weights_dir = ctx.game.weights_dir(&ctx.map_directory);
    for entry in &ctx.grle_schema {
        let width = (f64::from(ctx.scaled_size()) * entry.width_multiplier) as u32;
        let height = (f64::from(ctx.scaled_size()) * entry.height_multiplier) as u32;
        let path = weights_dir.join(&entry.name);
        match (entry.channels, entry.data_type.as_str()) {
            (1, "uint8") => save_image(&new_gray8(width, height), &path)?,
            (1, "uint16") => {
                save_image(&crate::raster::new_gray16(width, height), &path)?
            }
            (3, _) => {
                let img: image::RgbImage = image::ImageBuffer::new(width, height);
                save_image(&img, &path)?
            }
            (channels, data_type) => {
                warn!(
                    "unsupported info layer format {}x {} for {}, writing single channel",
                    channels, data_type, entry.name
                );
                save_image(&new_gray8(width, height), &path)?
            }
        }
        debug!("info layer raster {} created at {}x{}", entry.name, width, height);
    }

    add_farmlands(ctx)?;
    if ctx.game.plants_processing() && ctx.settings.grle.add_grass {
        add_plants(ctx)?;
    }
    Ok(())
}

/// Paints every field (and optionally farmyard) polygon into the half
/// resolution farmlands raster and mirrors each drawn id into the
/// farmlands XML.
fn add_farmlands(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let store = InfoLayerStore::load(&infolayer::textures_store_path(&ctx.map_directory))?;
    let mut farmlands: Vec<Vec<[i32; 2]>> = Vec::new();
    if let Some(fields) = store.polygons(keys::FIELDS) {
        debug!("found {} fields in the textures info layer", fields.len());
        farmlands.extend(fields.iter().cloned());
    }
    if ctx.settings.grle.add_farmyards {
        if let Some(farmyards) = store.polygons(keys::FARMYARDS) {
            debug!("found {} farmyards in the textures info layer", farmyards.len());
            farmlands.extend(farmyards.iter().cloned());
        }
    }
    if farmlands.is_empty() {
        warn!("no farmlands obtained from fields or farmyards, skipping");
        return Ok(());
    }

    let farmlands_png = ctx.game.farmlands_png_path(&ctx.map_directory);
    if !farmlands_png.is_file() {
        warn!("farmlands raster {} not found", farmlands_png.display());
        return Ok(());
    }
    let mut image = load_gray8(&farmlands_png)?;

    let mut fragment = XmlFragment::new();
    let mut opts = ctx.playable_fit_options();
    opts.margin = f64::from(ctx.settings.grle.farmland_margin);

    let mut farmland_id: u32 = 1;
    let mut limit_warned = false;
    for polygon in &farmlands {
        if farmland_id >= FARMLAND_ID_LIMIT + 1 {
            if !limit_warned {
                warn!(
                    "farmland id limit of {} reached, remaining farmlands skipped",
                    FARMLAND_ID_LIMIT
                );
                limit_warned = true;
            }
            break;
        }
        let points: Vec<(f64, f64)> =
            polygon.iter().map(|p| (f64::from(p[0]), f64::from(p[1]))).collect();
        let fitted = match geometry::fit_polygon_into_bounds(&points, &opts) {
            Ok(fitted) => fitted,
            Err(e) => {
                debug!("farmland {} could not be fitted: {}", farmland_id, e);
                continue;
            }
        };
        // The farmlands raster is half resolution.
        let halved: Vec<(f64, f64)> = fitted.iter().map(|&(x, y)| (x / 2.0, y / 2.0)).collect();
        if let Err(e) = fill_polygon(&mut image, &halved, farmland_id as u8) {
            debug!("farmland {} could not be drawn: {}", farmland_id, e);
            continue;
        }

        let id = farmland_id.to_string();
        let price_scale = "1";
        fragment
            .empty(
                "farmland",
                &[("id", id.as_str()), ("priceScale", price_scale), ("npcName", "FORESTER")],
            )
            .map_err(anyhow::Error::from)?;
        farmland_id += 1;
    }

    if let Some(xml_path) = ctx.game.farmlands_xml_path(&ctx.map_directory) {
        if xml_path.is_file() {
            let xml = std::fs::read_to_string(&xml_path).map_err(anyhow::Error::from)?;
            let price = ctx.settings.grle.base_price.to_string();
            let (xml, _) = xmlutil::update_attributes(
                &xml,
                &ElementMatch::named("farmlands"),
                &[("pricePerHa", price.as_str())],
            )?;
            let (xml, inserted) = xmlutil::insert_into(
                &xml,
                &ElementMatch::named("farmlands"),
                &fragment.into_string()?,
            )?;
            if inserted == 0 {
                warn!("farmlands element not found in {}", xml_path.display());
            }
            std::fs::write(&xml_path, xml).map_err(anyhow::Error::from)?;
        } else {
            warn!("farmlands XML {} not found", xml_path.display());
        }
    }

    if ctx.settings.grle.fill_empty_farmlands {
        for pixel in image.pixels_mut() {
            if pixel.0[0] == 0 {
                pixel.0[0] = 255;
            }
        }
    }

    save_image(&image, &farmlands_png)?;
    ctx.assets.farmlands = Some(farmlands_png);
    Ok(())
}

/// Writes the plant layer into channel 0 of the fruit density map: the base
/// plant over the grass mask, optional random islands, eroded edges.
fn add_plants(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let weights_dir = ctx.game.weights_dir(&ctx.map_directory);
    let Some(grass_layer) = ctx.schema.layer_by_usage("grass") else {
        warn!("grass layer not found in the texture schema");
        return Ok(());
    };
    let grass_path = grass_layer.preview_or_path(&weights_dir);
    if !grass_path.is_file() {
        warn!("grass mask not found at {}", grass_path.display());
        return Ok(());
    }

    let density_path = ctx.game.plants_density_path(&ctx.map_directory);
    if !density_path.is_file() {
        warn!("fruit density map not found at {}", density_path.display());
        return Ok(());
    }

    // The density map is twice the raster size of the weight masks.
    let double = ctx.scaled_size() * 2;
    let mut grass = resize_nearest8(&load_gray8(&grass_path)?, double, double);

    if let Some(forest_layer) = ctx.schema.layer_by_usage("forest") {
        let forest_path = forest_layer.preview_or_path(&weights_dir);
        if forest_path.is_file() {
            let forest = resize_nearest8(&load_gray8(&forest_path)?, double, double);
            for (g, f) in grass.pixels_mut().zip(forest.pixels()) {
                if f.0[0] != 0 {
                    g.0[0] = 255;
                }
            }
        }
    }

    let base_value =
        plant_pixel_value(&ctx.settings.grle.base_grass).unwrap_or(131);

    let mut plants = grass.clone();
    for pixel in plants.pixels_mut() {
        if pixel.0[0] != 0 {
            pixel.0[0] = base_value;
        }
    }

    if ctx.settings.grle.random_plants {
        let island_count = ctx.scaled_size();
        plants = create_plant_islands(plants, island_count);
        debug!("scattered {} plant islands", island_count);
    }

    // Shrink the mask slightly so plants never poke out of the grass.
    let eroded = erode_mask(&grass, 3, 1);
    for (p, m) in plants.pixels_mut().zip(eroded.pixels()) {
        if m.0[0] == 0 {
            p.0[0] = 0;
        }
    }
    clear_edge_pixels(&mut plants);

    let mut density = image::open(&density_path)
        .map_err(|e| anyhow::anyhow!("reading {}: {}", density_path.display(), e))?
        .to_rgb8();
    if density.dimensions() != plants.dimensions() {
        warn!(
            "density map size {:?} does not match the plant layer {:?}",
            density.dimensions(),
            plants.dimensions()
        );
        return Ok(());
    }
    for (d, p) in density.pixels_mut().zip(plants.pixels()) {
        d.0[0] = p.0[0];
    }
    density.save(&density_path).map_err(anyhow::Error::from)?;
    ctx.assets.plants = Some(density_path);
    Ok(())
}

fn clear_edge_pixels(img: &mut Gray8) {
    let (w, h) = img.dimensions();
    for x in 0..w {
        img.put_pixel(x, 0, Luma([0]));
        img.put_pixel(x, h - 1, Luma([0]));
    }
    for y in 0..h {
        img.put_pixel(0, y, Luma([0]));
        img.put_pixel(w - 1, y, Luma([0]));
    }
}

/// Scatters rounded random polygons of random plant types over the layer.
fn create_plant_islands(mut image: Gray8, count: u32) -> Gray8 {
    let possible_values: [u8; 6] = [65, 97, 129, 161, 193, 225];
    let mut rng = rand::thread_rng();
    let (w, h) = image.dimensions();

    for _ in 0..count {
        let plant_value = *possible_values.choose(&mut rng).unwrap();
        let island_size =
            rng.gen_range(PLANT_ISLAND_MINIMUM_SIZE..=PLANT_ISLAND_MAXIMUM_SIZE);
        if w <= island_size || h <= island_size {
            continue;
        }
        let x = rng.gen_range(0..w - island_size);
        let y = rng.gen_range(0..h - island_size);
        let center = (
            f64::from(x + island_size / 2),
            f64::from(y + island_size / 2),
        );
        if let Some(polygon) =
            rounded_polygon(&mut rng, center, f64::from(island_size / 2))
        {
            let _ = fill_polygon(&mut image, &polygon, plant_value);
        }
    }
    image
}

/// A randomly distorted, rounded polygon around `center`.
fn rounded_polygon(
    rng: &mut impl Rng,
    center: (f64, f64),
    radius: f64,
) -> Option<Vec<(f64, f64)>> {
    let n = PLANT_ISLAND_VERTEX_COUNT;
    let angle_offset = std::f64::consts::PI / n as f64;
    let mut points = Vec::with_capacity(n);
    for i in 0..n {
        let angle = i as f64 / n as f64 * std::f64::consts::TAU
            + angle_offset
            + rng.gen_range(-PLANT_ISLAND_DISTORTION..PLANT_ISLAND_DISTORTION);
        let r = radius
            + rng.gen_range(-radius * PLANT_ISLAND_DISTORTION..=radius * PLANT_ISLAND_DISTORTION);
        points.push((center.0 + angle.cos() * r, center.1 + angle.sin() * r));
    }
    offset_polygon_mitre(&points, PLANT_ISLAND_ROUNDING_RADIUS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plant_values_cover_the_known_mixes() {
        assert_eq!(plant_pixel_value("meadow"), Some(131));
        assert_eq!(plant_pixel_value("smallDenseMix"), Some(33));
        assert_eq!(plant_pixel_value("unknown"), None);
    }

    #[test]
    fn edge_pixels_are_cleared() {
        let mut img = new_gray8(8, 8);
        for p in img.pixels_mut() {
            p.0[0] = 131;
        }
        clear_edge_pixels(&mut img);
        assert_eq!(img.get_pixel(0, 3).0[0], 0);
        assert_eq!(img.get_pixel(7, 7).0[0], 0);
        assert_eq!(img.get_pixel(3, 3).0[0], 131);
    }

    #[test]
    fn islands_only_paint_known_plant_values() {
        let img = new_gray8(512, 512);
        let painted = create_plant_islands(img, 10);
        let allowed = [0u8, 65, 97, 129, 161, 193, 225];
        assert!(painted.pixels().all(|p| allowed.contains(&p.0[0])));
    }

    #[test]
    fn rounded_polygon_has_enough_vertices() {
        let mut rng = rand::thread_rng();
        let polygon = rounded_polygon(&mut rng, (100.0, 100.0), 30.0).unwrap();
        assert!(polygon.len() >= PLANT_ISLAND_VERTEX_COUNT);
    }
}
