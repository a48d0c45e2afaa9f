use std::fs::File;
use std::path::PathBuf;

use log::{debug, info, warn};

use crate::component;
use crate::dtm::DtmProvider;
use crate::error::GenerationError;
use crate::game::GameProfile;
use crate::geometry::FitOptions;
use crate::imagery::ImageryProvider;
use crate::osm::OsmSource;
use crate::schema::{self, GrleLayer, TextureSchema, TreeSpec};
use crate::settings::{SettingsBundle, SharedRuntime};

/// Width of the background terrain skirt around the playable square, in
/// meters (and pixels, at one pixel per meter).
pub const BACKGROUND_DISTANCE: u32 = 2048;

/// Highest farmland id the editor accepts.
pub const FARMLAND_ID_LIMIT: u32 = 254;

/// Final output paths each component records for its successors. A `None`
/// means the asset was not produced; consumers treat that as skip, never as
/// an error.
#[derive(Clone, Debug, Default)]
pub struct Assets {
    pub dem: Option<PathBuf>,
    pub farmlands: Option<PathBuf>,
    pub plants: Option<PathBuf>,
    pub background_mesh: Option<PathBuf>,
    pub decimated_background_mesh: Option<PathBuf>,
    pub textured_background_mesh: Option<PathBuf>,
    pub background_terrain_i3d: Option<PathBuf>,
    pub water_mesh: Option<PathBuf>,
    pub line_based_water_mesh: Option<PathBuf>,
    pub water_resources_i3d: Option<PathBuf>,
    pub roads_mesh: Option<PathBuf>,
    pub roads_i3d: Option<PathBuf>,
    pub satellite_overview: Option<PathBuf>,
    pub satellite_background: Option<PathBuf>,
}

/// The root value object of one generation run: coordinates, extent,
/// rotation, schemas, settings and the consumed provider interfaces.
pub struct MapContext {
    /// Latitude and longitude of the map center, WGS-84 degrees.
    pub center: (f64, f64),
    /// Side length of the playable square in meters; a power of two.
    pub size: u32,
    /// Map rotation in degrees, [-180, 180].
    pub rotation: i32,
    /// Optional final raster size; all outputs are resized to it.
    pub output_size: Option<u32>,
    pub game: GameProfile,
    pub map_directory: PathBuf,
    pub settings: SettingsBundle,
    pub schema: TextureSchema,
    pub grle_schema: Vec<GrleLayer>,
    pub tree_schema: Vec<TreeSpec>,
    pub shared: SharedRuntime,
    pub assets: Assets,
    pub dtm: Box<dyn DtmProvider>,
    pub osm: Box<dyn OsmSource>,
    pub imagery: Option<Box<dyn ImageryProvider>>,
}

impl MapContext {
    /// Builds a context with the game's schemas loaded and the inputs
    /// validated.
    pub fn new(
        game: GameProfile,
        center: (f64, f64),
        size: u32,
        rotation: i32,
        map_directory: PathBuf,
        dtm: Box<dyn DtmProvider>,
        osm: Box<dyn OsmSource>,
    ) -> Result<Self, GenerationError> {
        let schema = schema::load_texture_schema(game.kind, game.texture_schema.as_deref())?;
        let grle_schema = schema::load_grle_schema(game.kind, game.grle_schema.as_deref())?;
        let tree_schema = schema::load_tree_schema(game.kind, game.tree_schema.as_deref())?;
        let ctx = Self {
            center,
            size,
            rotation,
            output_size: None,
            game,
            map_directory,
            settings: SettingsBundle::default(),
            schema,
            grle_schema,
            tree_schema,
            shared: SharedRuntime::default(),
            assets: Assets::default(),
            dtm,
            osm,
            imagery: None,
        };
        ctx.validate()?;
        Ok(ctx)
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        let (lat, lon) = self.center;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(GenerationError::InvalidInput(format!(
                "coordinates out of range: {}, {}",
                lat, lon
            )));
        }
        if self.size < 2 || !self.size.is_power_of_two() {
            return Err(GenerationError::InvalidInput(format!(
                "map size must be a power of two, got {}",
                self.size
            )));
        }
        if !(-180..=180).contains(&self.rotation) {
            return Err(GenerationError::InvalidInput(format!(
                "rotation out of range: {}",
                self.rotation
            )));
        }
        if let Some(output_size) = self.output_size {
            if output_size < 2 || !output_size.is_power_of_two() {
                return Err(GenerationError::InvalidInput(format!(
                    "output size must be a power of two, got {}",
                    output_size
                )));
            }
        }
        Ok(())
    }

    /// Side of the intermediate rasters: oversized by 1.5 when the map is
    /// rotated so the post-rotation crop stays filled.
    pub fn rotated_size(&self) -> u32 {
        if self.rotation != 0 {
            (f64::from(self.size) * 1.5).ceil() as u32
        } else {
            self.size
        }
    }

    pub fn size_scale(&self) -> f64 {
        match self.output_size {
            Some(output_size) => f64::from(output_size) / f64::from(self.size),
            None => 1.0,
        }
    }

    /// The final raster side: `output_size` when set, the map size
    /// otherwise.
    pub fn scaled_size(&self) -> u32 {
        self.output_size.unwrap_or(self.size)
    }

    pub fn background_size(&self) -> u32 {
        self.size + 2 * BACKGROUND_DISTANCE
    }

    pub fn background_rotated_size(&self) -> u32 {
        if self.rotation != 0 {
            (f64::from(self.background_size()) * 1.5).ceil() as u32
        } else {
            self.background_size()
        }
    }

    /// Meters represented by one DEM unit, after the elevation multiplier.
    pub fn mesh_z_scale(&self) -> f64 {
        let height_scale = self.shared.height_scale_value.unwrap_or(255.0);
        height_scale / 65535.0 / f64::from(self.settings.dem.multiplier.max(1))
    }

    /// Fit options for geometry recorded in playable-map pixel space.
    pub fn playable_fit_options(&self) -> FitOptions {
        FitOptions::new(
            f64::from(self.size),
            f64::from(self.rotated_size()),
            self.size_scale(),
            self.rotation,
        )
    }

    pub fn background_dir(&self) -> PathBuf {
        self.map_directory.join("background")
    }

    pub fn water_dir(&self) -> PathBuf {
        self.map_directory.join("water")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.map_directory.join("assets")
    }
}

/// The fixed component sequence of §2, dispatched by the driver loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    Satellite,
    Texture,
    Background,
    Grle,
    I3d,
    Config,
    Road,
}

impl Component {
    pub const SEQUENCE: [Component; 7] = [
        Component::Satellite,
        Component::Texture,
        Component::Background,
        Component::Grle,
        Component::I3d,
        Component::Config,
        Component::Road,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Component::Satellite => "satellite",
            Component::Texture => "texture",
            Component::Background => "background",
            Component::Grle => "grle",
            Component::I3d => "i3d",
            Component::Config => "config",
            Component::Road => "road",
        }
    }

    fn process(self, ctx: &mut MapContext) -> Result<(), GenerationError> {
        match self {
            Component::Satellite => component::satellite::process(ctx),
            Component::Texture => component::texture::process(ctx),
            Component::Background => component::background::process(ctx),
            Component::Grle => component::grle::process(ctx),
            Component::I3d => component::i3d::process(ctx),
            Component::Config => component::config::process(ctx),
            Component::Road => component::road::process(ctx),
        }
    }
}

/// One generation run over a prepared map directory.
pub struct Map {
    pub ctx: MapContext,
}

impl Map {
    /// Validates the context, prepares the output directory and unpacks the
    /// game template into it.
    pub fn new(ctx: MapContext) -> Result<Self, GenerationError> {
        ctx.validate()?;
        std::fs::create_dir_all(&ctx.map_directory).map_err(anyhow::Error::from)?;
        std::fs::create_dir_all(ctx.map_directory.join("info_layers"))
            .map_err(anyhow::Error::from)?;

        let template = &ctx.game.template_archive;
        if !template.is_file() {
            return Err(GenerationError::TemplateMissing(template.clone()));
        }
        let archive = File::open(template).map_err(anyhow::Error::from)?;
        let mut archive = zip::ZipArchive::new(archive).map_err(anyhow::Error::from)?;
        archive.extract(&ctx.map_directory).map_err(anyhow::Error::from)?;
        info!("map template {} unpacked to {}", template.display(), ctx.map_directory.display());

        for required in ctx.game.required_files(&ctx.map_directory) {
            if !required.is_file() {
                return Err(GenerationError::TemplateMissing(required));
            }
        }
        Ok(Self { ctx })
    }

    /// Returns the pull-based component iterator: each `next()` runs one
    /// component to completion and yields its name, so a host can render
    /// progress between steps.
    pub fn generate(&mut self) -> Generator<'_> {
        Generator { ctx: &mut self.ctx, index: 0, failed: false }
    }
}

pub struct Generator<'a> {
    ctx: &'a mut MapContext,
    index: usize,
    failed: bool,
}

impl Iterator for Generator<'_> {
    type Item = Result<&'static str, GenerationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.index >= Component::SEQUENCE.len() {
            return None;
        }
        let component = Component::SEQUENCE[self.index];
        self.index += 1;
        debug!("running component {}", component.name());
        match component.process(self.ctx) {
            Ok(()) => {
                commit_generation_info(self.ctx, component);
                Some(Ok(component.name()))
            }
            Err(e) => {
                self.failed = true;
                warn!("component {} failed: {}", component.name(), e);
                Some(Err(e))
            }
        }
    }
}

/// Appends one component's section to `generation_info.json`. The file is
/// read back and merged so every component keeps its own section.
fn commit_generation_info(ctx: &MapContext, component: Component) {
    let section = generation_info_section(ctx, component);
    if section.is_null() {
        return;
    }
    let path = ctx.map_directory.join("generation_info.json");
    let mut info: serde_json::Map<String, serde_json::Value> = std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    info.insert(component.name().to_string(), section);
    match serde_json::to_string_pretty(&info) {
        Ok(raw) => {
            if let Err(e) = std::fs::write(&path, raw) {
                warn!("could not save generation info: {}", e);
            }
        }
        Err(e) => warn!("could not serialize generation info: {}", e),
    }
}

fn generation_info_section(ctx: &MapContext, component: Component) -> serde_json::Value {
    use serde_json::json;
    let bbox =
        crate::osm::BoundingBox::from_center(ctx.center, f64::from(ctx.rotated_size()) / 2.0);
    match component {
        Component::Texture => json!({
            "coordinates": [ctx.center.0, ctx.center.1],
            "map_size": ctx.size,
            "rotation": ctx.rotation,
            "north": bbox.north,
            "south": bbox.south,
            "east": bbox.east,
            "west": bbox.west,
        }),
        Component::Background => json!({
            "background_size": ctx.background_size(),
            "rotated_size": ctx.background_rotated_size(),
            "height_scale_value": ctx.shared.height_scale_value,
            "mesh_z_scaling_factor": ctx.shared.mesh_z_scaling_factor,
            "height_scale_multiplier": ctx.shared.height_scale_multiplier,
        }),
        Component::Config => json!({
            "overview": {
                "height": ctx.size * 2,
                "width": ctx.size * 2,
                "output_size": ctx.scaled_size(),
            }
        }),
        _ => serde_json::Value::Null,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dtm::HeightGrid;
    use crate::error::FetchError;
    use crate::game::{GameKind, GameProfile};
    use crate::osm::NoOsm;
    use std::path::Path;

    pub(crate) struct FlatDtm(pub f32);

    impl DtmProvider for FlatDtm {
        fn name(&self) -> &str {
            "flat"
        }
        fn fetch(&self, _: (f64, f64), _: u32) -> Result<HeightGrid, FetchError> {
            let size = 64;
            Ok(HeightGrid { width: size, height: size, values: vec![self.0; size * size] })
        }
    }

    /// A context over embedded schemas and synthetic providers, used across
    /// the unit tests.
    pub(crate) fn test_context(dir: &Path, size: u32, rotation: i32) -> MapContext {
        let game = GameProfile::new(GameKind::Fs25, &dir.join("templates"));
        MapContext::new(
            game,
            (45.286, 20.239),
            size,
            rotation,
            dir.to_path_buf(),
            Box::new(FlatDtm(20.0)),
            Box::new(NoOsm),
        )
        .unwrap()
    }

    #[test]
    fn rotated_size_is_only_oversized_when_rotated() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 1024, 0);
        assert_eq!(ctx.rotated_size(), 1024);

        let ctx = test_context(dir.path(), 1024, 45);
        assert_eq!(ctx.rotated_size(), 1536);
        assert_eq!(ctx.background_rotated_size(), (5120.0f64 * 1.5).ceil() as u32);
    }

    #[test]
    fn size_scale_follows_the_output_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path(), 1024, 0);
        assert_eq!(ctx.size_scale(), 1.0);
        ctx.output_size = Some(2048);
        assert_eq!(ctx.size_scale(), 2.0);
        assert_eq!(ctx.scaled_size(), 2048);
    }

    #[test]
    fn validation_rejects_bad_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path(), 1024, 0);

        ctx.size = 1000;
        assert!(matches!(ctx.validate(), Err(GenerationError::InvalidInput(_))));
        ctx.size = 1024;

        ctx.rotation = 200;
        assert!(matches!(ctx.validate(), Err(GenerationError::InvalidInput(_))));
        ctx.rotation = 0;

        ctx.center = (95.0, 20.0);
        assert!(matches!(ctx.validate(), Err(GenerationError::InvalidInput(_))));
        ctx.center = (45.0, 20.0);

        ctx.output_size = Some(3000);
        assert!(matches!(ctx.validate(), Err(GenerationError::InvalidInput(_))));
    }

    #[test]
    fn missing_template_maps_to_the_template_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 1024, 0);
        match Map::new(ctx) {
            Err(GenerationError::TemplateMissing(path)) => {
                assert!(path.to_string_lossy().contains("fs25-map-template.zip"));
            }
            other => panic!("expected TemplateMissing, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn component_sequence_matches_the_pipeline_order() {
        let names: Vec<&str> = Component::SEQUENCE.iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            vec!["satellite", "texture", "background", "grle", "i3d", "config", "road"]
        );
    }
}
