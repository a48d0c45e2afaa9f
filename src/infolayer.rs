use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One recorded polyline with the metadata later components need to rebuild
/// the road or waterway it came from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolylineRecord {
    pub points: Vec<[i32; 2]>,
    pub width: f64,
    pub tags: String,
}

/// A value stored under one info layer key: either raw polygon rings or
/// polyline records.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InfoLayerEntry {
    Polylines(Vec<PolylineRecord>),
    Polygons(Vec<Vec<[i32; 2]>>),
}

/// The persisted JSON dictionary shared between components.
///
/// Two scopes exist per run ("textures" and "background"), each backed by one
/// file under `info_layers/`. The on-disk JSON is the source of truth between
/// pipeline steps: writers merge into the existing file rather than
/// overwriting it.
#[derive(Clone, Debug, Default)]
pub struct InfoLayerStore {
    entries: BTreeMap<String, InfoLayerEntry>,
}

impl InfoLayerStore {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading info layer store {}", path.display()))?;
        let entries = serde_json::from_str(&raw)
            .with_context(|| format!("parsing info layer store {}", path.display()))?;
        Ok(Self { entries })
    }

    /// Merges this store's keys into the file, keeping keys written by other
    /// components untouched.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut merged = Self::load(path)?.entries;
        for (key, value) in &self.entries {
            merged.insert(key.clone(), value.clone());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(&merged)?;
        fs::write(path, raw)
            .with_context(|| format!("writing info layer store {}", path.display()))?;
        Ok(())
    }

    pub fn add_polygon(&mut self, key: &str, points: Vec<[i32; 2]>) {
        match self.entries.entry(key.to_string()).or_insert_with(|| InfoLayerEntry::Polygons(Vec::new()))
        {
            InfoLayerEntry::Polygons(polygons) => polygons.push(points),
            InfoLayerEntry::Polylines(_) => {
                log::warn!("info layer key {} already holds polylines, polygon dropped", key)
            }
        }
    }

    pub fn add_polyline(&mut self, key: &str, record: PolylineRecord) {
        match self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| InfoLayerEntry::Polylines(Vec::new()))
        {
            InfoLayerEntry::Polylines(lines) => lines.push(record),
            InfoLayerEntry::Polygons(_) => {
                log::warn!("info layer key {} already holds polygons, polyline dropped", key)
            }
        }
    }

    pub fn polygons(&self, key: &str) -> Option<&Vec<Vec<[i32; 2]>>> {
        match self.entries.get(key) {
            Some(InfoLayerEntry::Polygons(polygons)) => Some(polygons),
            _ => None,
        }
    }

    pub fn polylines(&self, key: &str) -> Option<&Vec<PolylineRecord>> {
        match self.entries.get(key) {
            Some(InfoLayerEntry::Polylines(lines)) => Some(lines),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Well known info layer keys.
pub mod keys {
    pub const FIELDS: &str = "fields";
    pub const FARMYARDS: &str = "farmyards";
    pub const BUILDINGS: &str = "buildings";
    pub const ROADS: &str = "roads";
    pub const WATER: &str = "water";
    pub const ROADS_POLYLINES: &str = "roads_polylines";
    pub const WATER_POLYLINES: &str = "water_polylines";
}

/// Paths of the two store scopes under the map directory.
pub fn textures_store_path(map_directory: &Path) -> PathBuf {
    map_directory.join("info_layers").join("textures.json")
}

pub fn background_store_path(map_directory: &Path) -> PathBuf {
    map_directory.join("info_layers").join("background.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polygons_and_polylines_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("textures.json");

        let mut store = InfoLayerStore::default();
        store.add_polygon(keys::FIELDS, vec![[0, 0], [10, 0], [10, 10]]);
        store.add_polyline(
            keys::ROADS_POLYLINES,
            PolylineRecord {
                points: vec![[0, 0], [50, 50]],
                width: 4.0,
                tags: "highway".to_string(),
            },
        );
        store.save(&path).unwrap();

        let loaded = InfoLayerStore::load(&path).unwrap();
        assert_eq!(loaded.polygons(keys::FIELDS).unwrap().len(), 1);
        let roads = loaded.polylines(keys::ROADS_POLYLINES).unwrap();
        assert_eq!(roads[0].points, vec![[0, 0], [50, 50]]);
        assert!((roads[0].width - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn save_merges_with_existing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("textures.json");

        let mut first = InfoLayerStore::default();
        first.add_polygon(keys::FIELDS, vec![[0, 0], [1, 0], [1, 1]]);
        first.save(&path).unwrap();

        let mut second = InfoLayerStore::default();
        second.add_polygon(keys::BUILDINGS, vec![[5, 5], [6, 5], [6, 6]]);
        second.save(&path).unwrap();

        let loaded = InfoLayerStore::load(&path).unwrap();
        assert!(loaded.polygons(keys::FIELDS).is_some());
        assert!(loaded.polygons(keys::BUILDINGS).is_some());
    }

    #[test]
    fn missing_file_loads_empty() {
        let store = InfoLayerStore::load(Path::new("/nonexistent/infolayers.json")).unwrap();
        assert!(store.is_empty());
    }
}
