use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::dtm::EARTH_CIRCUMFERENCE;
use crate::error::FetchError;
use crate::schema::{filter_matches, TagFilter};

/// Geographic bounding box in WGS-84 degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl BoundingBox {
    /// Box of side `2 * dist_m` meters centered at `center`.
    pub fn from_center(center: (f64, f64), dist_m: f64) -> Self {
        let (lat, lon) = center;
        let meters_per_degree = EARTH_CIRCUMFERENCE / 360.0;
        let dlat = dist_m / meters_per_degree;
        let dlon = dlat / lat.to_radians().cos().abs().max(1e-6);
        Self { north: lat + dlat, south: lat - dlat, east: lon + dlon, west: lon - dlon }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat <= self.north && lat >= self.south && lon >= self.west && lon <= self.east
    }
}

/// Feature geometry in lon/lat coordinate pairs.
#[derive(Clone, Debug)]
pub enum OsmGeometry {
    Polygon(Vec<(f64, f64)>),
    Line(Vec<(f64, f64)>),
    Point((f64, f64)),
}

#[derive(Clone, Debug)]
pub struct OsmFeature {
    pub geometry: OsmGeometry,
    pub tags: BTreeMap<String, String>,
}

impl OsmFeature {
    fn touches(&self, bbox: &BoundingBox) -> bool {
        let points: &[(f64, f64)] = match &self.geometry {
            OsmGeometry::Polygon(p) | OsmGeometry::Line(p) => p,
            OsmGeometry::Point(p) => std::slice::from_ref(p),
        };
        points.iter().any(|&(lon, lat)| bbox.contains(lat, lon))
    }
}

/// Source of tagged features for a bounding box. The remote Overpass client
/// lives outside this crate; the core only consumes this interface.
pub trait OsmSource {
    fn features(
        &self,
        bbox: &BoundingBox,
        filter: &TagFilter,
    ) -> Result<Vec<OsmFeature>, FetchError>;
}

/// A source with no data at all. Used when generation runs without any map
/// features, producing empty masks and a bare terrain.
pub struct NoOsm;

impl OsmSource for NoOsm {
    fn features(&self, _: &BoundingBox, _: &TagFilter) -> Result<Vec<OsmFeature>, FetchError> {
        Ok(Vec::new())
    }
}

/// In-memory source, primarily for tests and programmatic callers.
#[derive(Default)]
pub struct MemoryOsm {
    pub features: Vec<OsmFeature>,
}

impl OsmSource for MemoryOsm {
    fn features(
        &self,
        bbox: &BoundingBox,
        filter: &TagFilter,
    ) -> Result<Vec<OsmFeature>, FetchError> {
        Ok(self
            .features
            .iter()
            .filter(|f| filter_matches(filter, &f.tags) && f.touches(bbox))
            .cloned()
            .collect())
    }
}

/// A GeoJSON `FeatureCollection` on disk standing in for a live extract.
/// Properties become tags; Polygon, MultiPolygon, LineString and Point
/// geometries are understood.
pub struct GeoJsonOsm {
    path: PathBuf,
}

impl GeoJsonOsm {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn parse(&self) -> Result<Vec<OsmFeature>, FetchError> {
        let raw = fs::read_to_string(&self.path)?;
        let root: Value = serde_json::from_str(&raw).map_err(|e| FetchError::TileMalformed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let mut features = Vec::new();
        let Some(list) = root.get("features").and_then(Value::as_array) else {
            return Err(FetchError::TileMalformed {
                path: self.path.clone(),
                reason: "missing features array".to_string(),
            });
        };

        for feature in list {
            let tags = parse_tags(feature.get("properties"));
            let Some(geometry) = feature.get("geometry") else { continue };
            let kind = geometry.get("type").and_then(Value::as_str).unwrap_or_default();
            let coords = geometry.get("coordinates");
            match kind {
                "Polygon" => {
                    if let Some(ring) = coords.and_then(|c| c.get(0)).and_then(parse_ring) {
                        features
                            .push(OsmFeature { geometry: OsmGeometry::Polygon(ring), tags });
                    }
                }
                "MultiPolygon" => {
                    for polygon in coords.and_then(Value::as_array).into_iter().flatten() {
                        if let Some(ring) = polygon.get(0).and_then(parse_ring) {
                            features.push(OsmFeature {
                                geometry: OsmGeometry::Polygon(ring),
                                tags: tags.clone(),
                            });
                        }
                    }
                }
                "LineString" => {
                    if let Some(line) = coords.and_then(parse_ring) {
                        features.push(OsmFeature { geometry: OsmGeometry::Line(line), tags });
                    }
                }
                "Point" => {
                    if let Some(point) = coords.and_then(parse_position) {
                        features.push(OsmFeature { geometry: OsmGeometry::Point(point), tags });
                    }
                }
                other => log::debug!("unsupported GeoJSON geometry type {}", other),
            }
        }
        Ok(features)
    }
}

fn parse_tags(properties: Option<&Value>) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    if let Some(Value::Object(map)) = properties {
        for (key, value) in map {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            tags.insert(key.clone(), text);
        }
    }
    tags
}

fn parse_position(value: &Value) -> Option<(f64, f64)> {
    let pair = value.as_array()?;
    Some((pair.first()?.as_f64()?, pair.get(1)?.as_f64()?))
}

fn parse_ring(value: &Value) -> Option<Vec<(f64, f64)>> {
    let list = value.as_array()?;
    let ring: Vec<(f64, f64)> = list.iter().filter_map(parse_position).collect();
    if ring.is_empty() {
        None
    } else {
        Some(ring)
    }
}

impl OsmSource for GeoJsonOsm {
    fn features(
        &self,
        bbox: &BoundingBox,
        filter: &TagFilter,
    ) -> Result<Vec<OsmFeature>, FetchError> {
        Ok(self
            .parse()?
            .into_iter()
            .filter(|f| filter_matches(filter, &f.tags) && f.touches(bbox))
            .collect())
    }
}

/// Builds the OSM source for the CLI: a custom extract if given, otherwise
/// no features at all.
pub fn source_from_args(custom_osm: Option<&Path>) -> Box<dyn OsmSource> {
    match custom_osm {
        Some(path) => Box::new(GeoJsonOsm::new(path.to_path_buf())),
        None => Box::new(NoOsm),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TagMatch;

    fn farmland_filter() -> TagFilter {
        let mut filter = TagFilter::new();
        filter.insert("landuse".into(), TagMatch::One("farmland".into()));
        filter
    }

    #[test]
    fn bbox_is_symmetric_around_the_center() {
        let bbox = BoundingBox::from_center((45.0, 20.0), 512.0);
        assert!((bbox.north - 45.0) - (45.0 - bbox.south) < 1e-12);
        assert!(bbox.contains(45.0, 20.0));
        assert!(!bbox.contains(46.0, 20.0));
    }

    #[test]
    fn geojson_features_are_filtered_by_tags_and_bbox() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extract.geojson");
        fs::write(
            &path,
            r#"{
              "type": "FeatureCollection",
              "features": [
                {
                  "type": "Feature",
                  "properties": {"landuse": "farmland"},
                  "geometry": {"type": "Polygon", "coordinates": [[[20.0, 45.0], [20.001, 45.0], [20.001, 45.001], [20.0, 45.001], [20.0, 45.0]]]}
                },
                {
                  "type": "Feature",
                  "properties": {"landuse": "forest"},
                  "geometry": {"type": "Polygon", "coordinates": [[[20.0, 45.0], [20.001, 45.0], [20.0, 45.001], [20.0, 45.0]]]}
                },
                {
                  "type": "Feature",
                  "properties": {"landuse": "farmland"},
                  "geometry": {"type": "Polygon", "coordinates": [[[30.0, 55.0], [30.001, 55.0], [30.0, 55.001], [30.0, 55.0]]]}
                }
              ]
            }"#,
        )
        .unwrap();

        let source = GeoJsonOsm::new(path);
        let bbox = BoundingBox::from_center((45.0005, 20.0005), 2000.0);
        let features = source.features(&bbox, &farmland_filter()).unwrap();
        assert_eq!(features.len(), 1);
        assert!(matches!(features[0].geometry, OsmGeometry::Polygon(_)));
    }

    #[test]
    fn memory_source_respects_the_filter() {
        let mut tags = BTreeMap::new();
        tags.insert("landuse".to_string(), "farmland".to_string());
        let source = MemoryOsm {
            features: vec![OsmFeature {
                geometry: OsmGeometry::Point((20.0, 45.0)),
                tags,
            }],
        };
        let bbox = BoundingBox::from_center((45.0, 20.0), 1000.0);
        assert_eq!(source.features(&bbox, &farmland_filter()).unwrap().len(), 1);

        let mut other = TagFilter::new();
        other.insert("building".into(), TagMatch::Any(true));
        assert!(source.features(&bbox, &other).unwrap().is_empty());
    }
}
