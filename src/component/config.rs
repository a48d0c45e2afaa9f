use log::{debug, warn};

use crate::error::GenerationError;
use crate::map::MapContext;
use crate::raster::{load_gray16, min_max16};
use crate::xmlutil::{self, ElementMatch};

pub(crate) fn process(ctx: &mut MapContext) -> Result<(), GenerationError> {
    set_map_size(ctx)?;
    if ctx.game.fog_processing() {
        adjust_fog(ctx)?;
    }
    set_overview(ctx)?;
    Ok(())
}

/// Writes the final raster size into the map descriptor XML.
fn set_map_size(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let path = ctx.game.map_xml_path(&ctx.map_directory);
    if !path.is_file() {
        warn!("map XML {} not found", path.display());
        return Ok(());
    }
    let xml = std::fs::read_to_string(&path).map_err(anyhow::Error::from)?;
    let size = ctx.scaled_size().to_string();
    let (xml, touched) = xmlutil::update_attributes(
        &xml,
        &ElementMatch::named("map"),
        &[("width", size.as_str()), ("height", size.as_str())],
    )?;
    if touched == 0 {
        warn!("map element not found in {}", path.display());
    }
    std::fs::write(&path, xml).map_err(anyhow::Error::from)?;
    debug!("map size {} written to {}", size, path.display());
    Ok(())
}

/// Reads the height scale the I3D stage wrote back out of the descriptor;
/// falls back to the shared runtime when the file has no value.
fn height_scale(ctx: &MapContext) -> f64 {
    let path = ctx.game.i3d_file_path(&ctx.map_directory);
    if path.is_file() {
        if let Ok(xml) = std::fs::read_to_string(&path) {
            let target = ElementMatch::named("TerrainTransformGroup").within("Scene");
            if let Ok(Some(value)) = xmlutil::read_attribute(&xml, &target, "heightScale") {
                if let Ok(parsed) = value.parse::<f64>() {
                    return parsed;
                }
            }
        }
    }
    ctx.shared.height_scale_value.unwrap_or(255.0)
}

/// Clamps the seasonal height-fog bands to the real terrain extremes.
fn adjust_fog(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let Some(env_path) = ctx.game.environment_xml_path(&ctx.map_directory) else {
        debug!("game does not carry an environment XML, fog untouched");
        return Ok(());
    };
    if !env_path.is_file() {
        warn!("environment XML {} not found, fog untouched", env_path.display());
        return Ok(());
    }
    let Some(dem_path) = ctx.assets.dem.clone() else {
        warn!("playable DEM missing, fog untouched");
        return Ok(());
    };

    let dem = load_gray16(&dem_path)?;
    let (min_pixel, max_pixel) = min_max16(&dem);
    let scale = height_scale(ctx);
    let minimum_m = (f64::from(min_pixel) * scale / 65535.0) as i64;
    let maximum_m = (f64::from(max_pixel) * scale / 65535.0) as i64;

    let xml = std::fs::read_to_string(&env_path).map_err(anyhow::Error::from)?;
    let min = minimum_m.to_string();
    let max = maximum_m.to_string();
    let (xml, touched) = xmlutil::update_attributes(
        &xml,
        &ElementMatch::named("maxHeight").within("heightFog"),
        &[("min", min.as_str()), ("max", max.as_str())],
    )?;
    std::fs::write(&env_path, xml).map_err(anyhow::Error::from)?;
    debug!("fog heights adjusted to [{}, {}] m on {} elements", min, max, touched);
    Ok(())
}

/// Drops the satellite overview into the game's overview slot.
fn set_overview(ctx: &mut MapContext) -> Result<(), GenerationError> {
    let Some(target) = ctx.game.overview_file_path(&ctx.map_directory) else {
        debug!("game does not carry an overview file, skipping");
        return Ok(());
    };
    let Some(overview) = ctx.assets.satellite_overview.clone() else {
        debug!("no satellite overview was produced, skipping");
        return Ok(());
    };
    if !overview.is_file() {
        return Ok(());
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(anyhow::Error::from)?;
    }
    std::fs::copy(&overview, &target).map_err(anyhow::Error::from)?;
    debug!("overview image placed at {}", target.display());
    Ok(())
}
