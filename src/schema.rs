use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::game::GameKind;

/// One value of a tag filter: match any value, one value, or one of many.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagMatch {
    Any(bool),
    One(String),
    Many(Vec<String>),
}

impl TagMatch {
    fn matches(&self, value: &str) -> bool {
        match self {
            TagMatch::Any(enabled) => *enabled,
            TagMatch::One(expected) => expected == value,
            TagMatch::Many(expected) => expected.iter().any(|e| e == value),
        }
    }
}

/// A set of `{key: value | [values] | true}` OSM tag constraints. A feature
/// matches if any one of the constraints matches one of its tags.
pub type TagFilter = BTreeMap<String, TagMatch>;

pub fn filter_matches(filter: &TagFilter, tags: &BTreeMap<String, String>) -> bool {
    filter.iter().any(|(key, matcher)| tags.get(key).map_or(false, |v| matcher.matches(v)))
}

/// One texture mask the pipeline produces, as described by the schema file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub count: u32,
    #[serde(default)]
    pub tags: Option<TagFilter>,
    /// Buffer half-width in meters for line and point features.
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub color: Option<[u8; 3]>,
    #[serde(default)]
    pub exclude_weight: bool,
    #[serde(default)]
    pub priority: Option<i32>,
    /// Info layer key the rasterized geometry is recorded under.
    #[serde(default)]
    pub info_layer: Option<String>,
    #[serde(default)]
    pub usage: Option<String>,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub invisible: bool,
    #[serde(default)]
    pub procedural: Option<Vec<String>>,
    /// Margin in pixels erased on every map edge and handed to the base layer.
    #[serde(default)]
    pub border: Option<u32>,
    #[serde(default)]
    pub precise_tags: Option<TagFilter>,
    #[serde(default)]
    pub area_water: bool,
    #[serde(default)]
    pub merge_into: Option<String>,
    #[serde(default)]
    pub building_category: Option<String>,
    /// External layers are not masked against the cumulative coverage.
    #[serde(default)]
    pub external: bool,
}

impl LayerSpec {
    pub fn is_base(&self) -> bool {
        self.priority == Some(0)
    }

    pub fn has_tags(&self) -> bool {
        self.tags.is_some() || self.precise_tags.is_some()
    }

    /// Path to the first (or only) weight file of the layer.
    pub fn path(&self, weights_dir: &Path) -> PathBuf {
        let idx = if self.count > 0 { "01" } else { "" };
        let postfix = if self.exclude_weight { "" } else { "_weight" };
        weights_dir.join(format!("{}{}{}.png", self.name, idx, postfix))
    }

    pub fn path_preview(&self, weights_dir: &Path) -> PathBuf {
        let main = self.path(weights_dir);
        let stem = main.file_stem().and_then(|s| s.to_str()).unwrap_or(&self.name);
        main.with_file_name(format!("{}_preview.png", stem))
    }

    /// The preview file when the layer was dissolved, the weight file otherwise.
    pub fn preview_or_path(&self, weights_dir: &Path) -> PathBuf {
        let preview = self.path_preview(weights_dir);
        if preview.is_file() {
            preview
        } else {
            self.path(weights_dir)
        }
    }

    /// All weight file paths of the layer, `{name}{NN}_weight.png` for
    /// 1..=count or the single `{name}.png` when count is zero.
    pub fn paths(&self, weights_dir: &Path) -> Vec<PathBuf> {
        let postfix = if self.exclude_weight { "" } else { "_weight" };
        if self.count == 0 {
            vec![weights_dir.join(format!("{}{}.png", self.name, postfix))]
        } else {
            (1..=self.count)
                .map(|i| weights_dir.join(format!("{}{:02}{}.png", self.name, i, postfix)))
                .collect()
        }
    }
}

/// The ordered list of texture layers for one game.
#[derive(Clone, Debug)]
pub struct TextureSchema {
    pub layers: Vec<LayerSpec>,
}

impl TextureSchema {
    pub fn base_layer(&self) -> Option<&LayerSpec> {
        self.layers.iter().find(|l| l.is_base())
    }

    pub fn layer_by_name(&self, name: &str) -> Option<&LayerSpec> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn layer_by_usage(&self, usage: &str) -> Option<&LayerSpec> {
        self.layers.iter().find(|l| l.usage.as_deref() == Some(usage))
    }

    pub fn background_layers(&self) -> Vec<&LayerSpec> {
        self.layers.iter().filter(|l| l.background).collect()
    }

    /// Layers sorted for drawing: null priority first, then descending
    /// priority, ties broken by schema order.
    pub fn layers_by_priority(&self) -> Vec<&LayerSpec> {
        let mut sorted: Vec<&LayerSpec> = self.layers.iter().collect();
        sorted.sort_by_key(|l| match l.priority {
            None => (0, 0i64),
            Some(p) => (1, -i64::from(p)),
        });
        sorted
    }
}

/// One fixed-schema GRLE raster the game expects to exist.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GrleLayer {
    pub name: String,
    pub height_multiplier: f64,
    pub width_multiplier: f64,
    pub channels: u8,
    pub data_type: String,
}

/// One tree reference the forest pass can place.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeSpec {
    pub name: String,
    pub reference_id: u32,
}

lazy_static::lazy_static! {
    static ref FS25_TEXTURE_SCHEMA: Vec<LayerSpec> =
        serde_json::from_str(include_str!("../templates/fs25-texture-schema.json"))
            .expect("embedded FS25 texture schema");
    static ref FS22_TEXTURE_SCHEMA: Vec<LayerSpec> =
        serde_json::from_str(include_str!("../templates/fs22-texture-schema.json"))
            .expect("embedded FS22 texture schema");
    static ref FS25_GRLE_SCHEMA: Vec<GrleLayer> =
        serde_json::from_str(include_str!("../templates/fs25-grle-schema.json"))
            .expect("embedded FS25 GRLE schema");
    static ref FS25_TREE_SCHEMA: Vec<TreeSpec> =
        serde_json::from_str(include_str!("../templates/fs25-tree-schema.json"))
            .expect("embedded FS25 tree schema");
}

pub fn load_texture_schema(kind: GameKind, path: Option<&Path>) -> Result<TextureSchema> {
    let layers = match path {
        Some(p) => {
            let raw = fs::read_to_string(p)
                .with_context(|| format!("reading schema {}", p.display()))?;
            serde_json::from_str(&raw).context("texture schema must be a list of layers")?
        }
        None => match kind {
            GameKind::Fs22 => FS22_TEXTURE_SCHEMA.clone(),
            GameKind::Fs25 => FS25_TEXTURE_SCHEMA.clone(),
        },
    };
    Ok(TextureSchema { layers })
}

pub fn load_grle_schema(kind: GameKind, path: Option<&Path>) -> Result<Vec<GrleLayer>> {
    match (kind, path) {
        (GameKind::Fs22, _) => Ok(Vec::new()),
        (GameKind::Fs25, Some(p)) => {
            let raw = fs::read_to_string(p)
                .with_context(|| format!("reading schema {}", p.display()))?;
            serde_json::from_str(&raw).context("GRLE schema must be a list of raster entries")
        }
        (GameKind::Fs25, None) => Ok(FS25_GRLE_SCHEMA.clone()),
    }
}

pub fn load_tree_schema(kind: GameKind, path: Option<&Path>) -> Result<Vec<TreeSpec>> {
    match (kind, path) {
        (GameKind::Fs22, _) => Ok(Vec::new()),
        (GameKind::Fs25, Some(p)) => {
            let raw = fs::read_to_string(p)
                .with_context(|| format!("reading schema {}", p.display()))?;
            serde_json::from_str(&raw).context("tree schema must be a list of tree entries")
        }
        (GameKind::Fs25, None) => Ok(FS25_TREE_SCHEMA.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TextureSchema {
        load_texture_schema(GameKind::Fs25, None).unwrap()
    }

    #[test]
    fn embedded_schema_parses_and_has_one_base_layer() {
        let schema = schema();
        let bases: Vec<_> = schema.layers.iter().filter(|l| l.is_base()).collect();
        assert_eq!(bases.len(), 1, "exactly one layer may carry priority 0");
    }

    #[test]
    fn priority_order_puts_null_first_then_descending() {
        let schema = schema();
        let ordered = schema.layers_by_priority();
        let first_with_priority =
            ordered.iter().position(|l| l.priority.is_some()).unwrap_or(ordered.len());
        let priorities: Vec<i32> =
            ordered[first_with_priority..].iter().filter_map(|l| l.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted);
        assert_eq!(ordered.last().map(|l| l.priority), Some(Some(0)));
    }

    #[test]
    fn weight_paths_follow_the_count_convention() {
        let layer = LayerSpec {
            name: "asphalt".into(),
            count: 2,
            tags: None,
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
        };
        let dir = Path::new("/w");
        assert_eq!(layer.path(dir), Path::new("/w/asphalt01_weight.png"));
        assert_eq!(
            layer.paths(dir),
            vec![
                PathBuf::from("/w/asphalt01_weight.png"),
                PathBuf::from("/w/asphalt02_weight.png")
            ]
        );

        let single = LayerSpec { count: 0, exclude_weight: true, ..layer };
        assert_eq!(single.path(dir), Path::new("/w/asphalt.png"));
    }

    #[test]
    fn tag_filter_matching() {
        let mut filter = TagFilter::new();
        filter.insert("highway".into(), TagMatch::Many(vec!["primary".into(), "track".into()]));
        filter.insert("building".into(), TagMatch::Any(true));

        let mut tags = BTreeMap::new();
        tags.insert("highway".to_string(), "track".to_string());
        assert!(filter_matches(&filter, &tags));

        let mut other = BTreeMap::new();
        other.insert("building".to_string(), "yes".to_string());
        assert!(filter_matches(&filter, &other));

        let mut neither = BTreeMap::new();
        neither.insert("highway".to_string(), "footway".to_string());
        assert!(!filter_matches(&filter, &neither));
    }
}
