use std::path::PathBuf;
use std::process::exit;

use indicatif::{ProgressBar, ProgressStyle};
use structopt::StructOpt;

use farmscape::dtm::{self, provider_from_name};
use farmscape::map::{Component, Map, MapContext};
use farmscape::osm;
use farmscape::{GameKind, GameProfile, GenerationError};

#[derive(Debug, StructOpt)]
#[structopt(name = "generate", about = "Generate a farming-simulator map package.")]
struct Opt {
    /// Target game profile (FS22 or FS25).
    #[structopt(long, default_value = "FS25")]
    game: String,

    /// Latitude of the map center, WGS-84 degrees.
    #[structopt(long)]
    lat: f64,

    /// Longitude of the map center, WGS-84 degrees.
    #[structopt(long)]
    lon: f64,

    /// Side length of the playable square in meters; a power of two.
    #[structopt(long)]
    size: u32,

    /// Map rotation in degrees, -180 to 180.
    #[structopt(long, default_value = "0")]
    rotation: i32,

    /// Output directory for the map package.
    #[structopt(long, parse(from_os_str))]
    out: PathBuf,

    /// Elevation provider: "srtm" or a path to a GeoTIFF.
    #[structopt(long, default_value = "srtm")]
    provider: String,

    /// Optional GeoJSON extract standing in for a live OSM source.
    #[structopt(long, parse(from_os_str))]
    custom_osm: Option<PathBuf>,

    /// Optional final raster size, independent of the real world extent.
    #[structopt(long)]
    output_size: Option<u32>,

    /// Directory holding the game map templates.
    #[structopt(long, parse(from_os_str), default_value = "templates")]
    templates: PathBuf,
}

fn run(opt: Opt) -> Result<(), GenerationError> {
    let kind = GameKind::from_code(&opt.game)?;
    let game = GameProfile::new(kind, &opt.templates);

    let dtm = provider_from_name(&opt.provider, dtm::dtm_cache_dir())?;
    let osm = osm::source_from_args(opt.custom_osm.as_deref());

    let mut ctx =
        MapContext::new(game, (opt.lat, opt.lon), opt.size, opt.rotation, opt.out, dtm, osm)?;
    ctx.output_size = opt.output_size;
    ctx.validate()?;

    let mut map = Map::new(ctx)?;

    let progress = ProgressBar::new(Component::SEQUENCE.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar().template("{msg:12} [{bar:40}] {pos}/{len}"),
    );
    for step in map.generate() {
        let name = step?;
        progress.set_message(name.to_string());
        progress.inc(1);
    }
    progress.finish_with_message("done");
    Ok(())
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();
    if let Err(e) = run(opt) {
        eprintln!("error: {}", e);
        exit(e.exit_code());
    }
}
