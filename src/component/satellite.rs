use log::{debug, error};

use crate::error::GenerationError;
use crate::map::{MapContext, BACKGROUND_DISTANCE};

/// Downloads the overview and background mosaics. Tasks with the same
/// extent reuse the first downloaded file instead of refetching.
pub(crate) fn process(ctx: &mut MapContext) -> Result<(), GenerationError> {
    if !ctx.settings.satellite.download_images {
        debug!("satellite image download is disabled");
        return Ok(());
    }
    let Some(imagery) = ctx.imagery.as_ref() else {
        debug!("no imagery provider configured");
        return Ok(());
    };

    let satellite_dir = ctx.map_directory.join("satellite");
    std::fs::create_dir_all(&satellite_dir).map_err(anyhow::Error::from)?;

    let overview_size = ctx.size * 2;
    let background_size = ctx.size + BACKGROUND_DISTANCE * 2;
    let overview_path = satellite_dir.join("satellite_overview.png");
    let background_path = satellite_dir.join("satellite_background.png");

    let tasks = [(overview_size, &overview_path), (background_size, &background_path)];
    let mut completed: Vec<(u32, std::path::PathBuf)> = Vec::new();

    for (size, path) in tasks {
        if let Some((_, existing)) = completed.iter().find(|(s, _)| *s == size) {
            if let Err(e) = std::fs::copy(existing, path) {
                error!("failed to reuse satellite image: {}", e);
            }
            continue;
        }
        match imagery.fetch(
            ctx.center,
            size,
            ctx.settings.satellite.zoom_level,
            ctx.rotation,
            path,
        ) {
            Ok(()) => completed.push((size, path.clone())),
            Err(e) => {
                error!("failed to download satellite image: {}", e);
                continue;
            }
        }
    }

    if overview_path.is_file() {
        ctx.assets.satellite_overview = Some(overview_path);
    }
    if background_path.is_file() {
        ctx.assets.satellite_background = Some(background_path);
    }
    Ok(())
}
