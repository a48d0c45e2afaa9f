use serde::{Deserialize, Serialize};

/// Settings controlling the DEM processing chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DemSettings {
    /// Shift the terrain so that its lowest point sits at `plateau + water_depth` meters.
    pub adjust_terrain_to_ground_level: bool,
    /// Integer multiplier applied to every elevation sample.
    pub multiplier: i32,
    /// Lower bound for the computed height scale, in meters.
    pub minimum_height_scale: u32,
    /// Base level the terrain is raised to, in meters.
    pub plateau: i32,
    /// Headroom added above the highest sample before normalization, in meters.
    pub ceiling: u32,
    /// Depth carved out under water surfaces, in meters.
    pub water_depth: u32,
    /// Gaussian kernel radius; zero or negative disables the blur.
    pub blur_radius: i32,
    /// Flatten the terrain under building footprints.
    pub add_foundations: bool,
}

impl Default for DemSettings {
    fn default() -> Self {
        Self {
            adjust_terrain_to_ground_level: true,
            multiplier: 1,
            minimum_height_scale: 255,
            plateau: 0,
            ceiling: 0,
            water_depth: 0,
            blur_radius: 3,
            add_foundations: false,
        }
    }
}

/// Settings for the background terrain and water meshes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundSettings {
    pub generate_background: bool,
    pub generate_water: bool,
    /// Gaussian kernel size used to soften the terrain under water planes.
    pub water_blurriness: u32,
    /// Cut the playable square out of the background terrain mesh.
    pub remove_center: bool,
    /// Level the road surface along each road polyline.
    pub flatten_roads: bool,
    /// Replace water areas with a single flat level instead of carving depth per pixel.
    pub flatten_water: bool,
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            generate_background: false,
            generate_water: false,
            water_blurriness: 20,
            remove_center: true,
            flatten_roads: false,
            flatten_water: false,
        }
    }
}

/// Settings for the GRLE info layer rasters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GrleSettings {
    /// Margin around each farmland polygon in meters, buffered with a mitre join.
    pub farmland_margin: u32,
    /// Also turn farmyard polygons into buyable farmlands.
    pub add_farmyards: bool,
    /// Price per hectare written once into the farmlands XML.
    pub base_price: u32,
    pub price_scale: u32,
    pub add_grass: bool,
    /// Name of the plant painted over the grass mask.
    pub base_grass: String,
    /// Scatter random plant islands over the density map.
    pub random_plants: bool,
    /// Paint pixel value 255 wherever no farmland was drawn.
    pub fill_empty_farmlands: bool,
}

impl Default for GrleSettings {
    fn default() -> Self {
        Self {
            farmland_margin: 0,
            add_farmyards: false,
            base_price: 60_000,
            price_scale: 100,
            add_grass: true,
            base_grass: "meadow".to_string(),
            random_plants: true,
            fill_empty_farmlands: false,
        }
    }
}

/// Settings for the map descriptor mutations.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct I3dSettings {
    pub add_trees: bool,
    /// Stride in pixels between tree placements on the forest mask.
    pub forest_density: u32,
    /// Maximum position jitter relative to the density, in percent.
    pub trees_relative_shift: u32,
}

impl Default for I3dSettings {
    fn default() -> Self {
        Self { add_trees: true, forest_density: 10, trees_relative_shift: 20 }
    }
}

/// Settings for road spline emission.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SplineSettings {
    /// Extra points inserted between every pair of polyline points.
    pub spline_density: u32,
    /// Emit every spline a second time with reversed point order.
    pub add_reversed_splines: bool,
}

impl Default for SplineSettings {
    fn default() -> Self {
        Self { spline_density: 2, add_reversed_splines: false }
    }
}

/// Settings for the texture rasterizer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureSettings {
    /// Split each layer mask across its weight variants at random.
    pub dissolve: bool,
    /// Inward padding applied to field polygons, in meters.
    pub fields_padding: u32,
    pub skip_drains: bool,
    /// Prefer a layer's precise tag filter over its broad one.
    pub use_precise_tags: bool,
}

impl Default for TextureSettings {
    fn default() -> Self {
        Self { dissolve: false, fields_padding: 0, skip_drains: false, use_precise_tags: false }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SatelliteSettings {
    pub download_images: bool,
    pub zoom_level: u32,
}

impl Default for SatelliteSettings {
    fn default() -> Self {
        Self { download_images: false, zoom_level: 16 }
    }
}

/// Values produced by the DEM stage and consumed by everything downstream.
///
/// The DEM stage receives the only mutable reference; later components read
/// these fields through a shared borrow.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SharedRuntime {
    /// Meters of elevation represented by DEM pixel value 65535.
    pub height_scale_value: Option<f64>,
    /// `65535 / height_scale_value`, maps meters to DEM units.
    pub mesh_z_scaling_factor: Option<f64>,
    /// `height_scale_value / 255`.
    pub height_scale_multiplier: Option<f64>,
    pub change_height_scale: bool,
}

/// The eight named setting groups carried by a [`MapContext`](crate::map::MapContext).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsBundle {
    pub dem: DemSettings,
    pub background: BackgroundSettings,
    pub grle: GrleSettings,
    pub i3d: I3dSettings,
    pub spline: SplineSettings,
    pub texture: TextureSettings,
    pub satellite: SatelliteSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let bundle = SettingsBundle::default();
        let json = serde_json::to_string(&bundle).unwrap();
        let back: SettingsBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dem.minimum_height_scale, 255);
        assert_eq!(back.grle.base_price, 60_000);
        assert!(back.background.remove_center);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let bundle: SettingsBundle =
            serde_json::from_str(r#"{"dem": {"water_depth": 5}}"#).unwrap();
        assert_eq!(bundle.dem.water_depth, 5);
        assert_eq!(bundle.dem.blur_radius, 3);
        assert_eq!(bundle.satellite.zoom_level, 16);
    }

}
