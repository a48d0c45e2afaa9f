use std::path::{Path, PathBuf};

use crate::error::GenerationError;

/// Which game the map package targets.
///
/// The profile decides template layout, on-disk paths and which optional
/// processing stages run at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GameKind {
    Fs22,
    Fs25,
}

impl GameKind {
    pub fn from_code(code: &str) -> Result<Self, GenerationError> {
        match code.to_ascii_uppercase().as_str() {
            "FS22" => Ok(GameKind::Fs22),
            "FS25" => Ok(GameKind::Fs25),
            other => Err(GenerationError::InvalidInput(format!("unknown game code: {}", other))),
        }
    }

    pub fn code(&self) -> &'static str {
        match *self {
            GameKind::Fs22 => "FS22",
            GameKind::Fs25 => "FS25",
        }
    }
}

/// File-path table and feature flags for one game version.
#[derive(Clone, Debug)]
pub struct GameProfile {
    pub kind: GameKind,
    /// Zip archive with the pristine map template. Unpacked into the map
    /// directory before the pipeline runs.
    pub template_archive: PathBuf,
    /// Overrides for the schema files shipped with the template. `None`
    /// falls back to the embedded defaults.
    pub texture_schema: Option<PathBuf>,
    pub grle_schema: Option<PathBuf>,
    pub tree_schema: Option<PathBuf>,
}

impl GameProfile {
    pub fn new(kind: GameKind, templates_dir: &Path) -> Self {
        let template_file = match kind {
            GameKind::Fs22 => "fs22-map-template.zip",
            GameKind::Fs25 => "fs25-map-template.zip",
        };
        Self {
            kind,
            template_archive: templates_dir.join(template_file),
            texture_schema: None,
            grle_schema: None,
            tree_schema: None,
        }
    }

    /// Resolution multiplier for the DEM sub-pipeline. The playable DEM is
    /// always written at `scaled_size + 1` regardless.
    pub fn dem_multiplier(&self) -> u32 {
        2
    }

    /// Name under which an untouched copy of the playable DEM is kept, if
    /// the game wants one.
    pub fn additional_dem_name(&self) -> Option<&'static str> {
        match self.kind {
            GameKind::Fs22 => None,
            GameKind::Fs25 => Some("unprocessedHeightMap.png"),
        }
    }

    pub fn i3d_processing(&self) -> bool {
        self.kind == GameKind::Fs25
    }

    pub fn plants_processing(&self) -> bool {
        self.kind == GameKind::Fs25
    }

    pub fn mesh_processing(&self) -> bool {
        self.kind == GameKind::Fs25
    }

    pub fn dissolve(&self) -> bool {
        self.kind == GameKind::Fs25
    }

    pub fn environment_processing(&self) -> bool {
        self.kind == GameKind::Fs25
    }

    pub fn fog_processing(&self) -> bool {
        self.kind == GameKind::Fs25
    }

    fn map_root(&self, dir: &Path) -> PathBuf {
        match self.kind {
            GameKind::Fs22 => dir.join("maps").join("map"),
            GameKind::Fs25 => dir.join("map"),
        }
    }

    pub fn dem_file_path(&self, dir: &Path) -> PathBuf {
        match self.kind {
            GameKind::Fs22 => self.map_root(dir).join("data").join("map_dem.png"),
            GameKind::Fs25 => self.map_root(dir).join("data").join("dem.png"),
        }
    }

    pub fn weights_dir(&self, dir: &Path) -> PathBuf {
        self.map_root(dir).join("data")
    }

    pub fn i3d_file_path(&self, dir: &Path) -> PathBuf {
        self.map_root(dir).join("map.i3d")
    }

    pub fn splines_file_path(&self, dir: &Path) -> PathBuf {
        self.map_root(dir).join("splines.i3d")
    }

    pub fn map_xml_path(&self, dir: &Path) -> PathBuf {
        self.map_root(dir).join("map.xml")
    }

    pub fn farmlands_xml_path(&self, dir: &Path) -> Option<PathBuf> {
        match self.kind {
            GameKind::Fs22 => None,
            GameKind::Fs25 => Some(self.map_root(dir).join("config").join("farmlands.xml")),
        }
    }

    pub fn environment_xml_path(&self, dir: &Path) -> Option<PathBuf> {
        match self.kind {
            GameKind::Fs22 => None,
            GameKind::Fs25 => Some(self.map_root(dir).join("config").join("environment.xml")),
        }
    }

    pub fn overview_file_path(&self, dir: &Path) -> Option<PathBuf> {
        match self.kind {
            GameKind::Fs22 => None,
            GameKind::Fs25 => Some(self.map_root(dir).join("overview.dds")),
        }
    }

    pub fn farmlands_png_path(&self, dir: &Path) -> PathBuf {
        self.weights_dir(dir).join("infoLayer_farmlands.png")
    }

    pub fn plants_density_path(&self, dir: &Path) -> PathBuf {
        self.weights_dir(dir).join("densityMap_fruits.png")
    }

    /// Files the unpacked template must contain for generation to make sense.
    pub fn required_files(&self, dir: &Path) -> Vec<PathBuf> {
        let mut required = vec![self.map_xml_path(dir), self.i3d_file_path(dir)];
        if let Some(path) = self.farmlands_xml_path(dir) {
            required.push(path);
        }
        if let Some(path) = self.environment_xml_path(dir) {
            required.push(path);
        }
        required
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs25_paths_are_rooted_at_map() {
        let profile = GameProfile::new(GameKind::Fs25, Path::new("/tmp/templates"));
        let dir = Path::new("/out");
        assert_eq!(profile.dem_file_path(dir), Path::new("/out/map/data/dem.png"));
        assert_eq!(profile.map_xml_path(dir), Path::new("/out/map/map.xml"));
        assert_eq!(
            profile.farmlands_xml_path(dir).unwrap(),
            Path::new("/out/map/config/farmlands.xml")
        );
    }

    #[test]
    fn fs22_paths_keep_the_legacy_layout() {
        let profile = GameProfile::new(GameKind::Fs22, Path::new("/tmp/templates"));
        let dir = Path::new("/out");
        assert_eq!(profile.dem_file_path(dir), Path::new("/out/maps/map/data/map_dem.png"));
        assert!(profile.farmlands_xml_path(dir).is_none());
        assert!(!profile.i3d_processing());
    }

    #[test]
    fn unknown_code_is_invalid_input() {
        assert!(GameKind::from_code("fs19").is_err());
        assert_eq!(GameKind::from_code("fs25").unwrap(), GameKind::Fs25);
    }
}
