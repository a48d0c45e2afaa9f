//! End-to-end runs of the full component pipeline over synthetic providers
//! and a minimal FS25 template archive.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use farmscape::dtm::{DtmProvider, HeightGrid};
use farmscape::error::FetchError;
use farmscape::map::{Map, MapContext};
use farmscape::osm::{BoundingBox, MemoryOsm, OsmFeature, OsmGeometry};
use farmscape::{GameKind, GameProfile};

const MAP_I3D: &str = r#"<?xml version="1.0" encoding="iso-8859-1"?>
<i3D name="map" version="1.6">
  <Asset/>
  <Scene>
    <Light name="sun" nodeId="10" lastShadowMapSplitBboxMin="0,0,0" lastShadowMapSplitBboxMax="0,0,0"/>
    <TerrainTransformGroup name="terrain" heightScale="255" nodeId="11">
      <Layers>
        <DisplacementLayer size="1024"/>
      </Layers>
    </TerrainTransformGroup>
    <TransformGroup name="gameplay" nodeId="20">
      <TransformGroup name="fields" nodeId="21"/>
    </TransformGroup>
  </Scene>
  <UserAttributes/>
</i3D>
"#;

const SPLINES_I3D: &str = r#"<?xml version="1.0" encoding="iso-8859-1"?>
<i3D name="splines" version="1.6">
  <Shapes/>
  <Scene/>
  <UserAttributes/>
</i3D>
"#;

const MAP_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<map width="0" height="0">
  <environment filename="config/environment.xml"/>
</map>
"#;

const FARMLANDS_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<map>
  <farmlands pricePerHa="75000"/>
</map>
"#;

const ENVIRONMENT_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<environment>
  <weather>
    <season name="summer">
      <fog>
        <heightFog>
          <maxHeight min="0" max="100"/>
        </heightFog>
      </fog>
    </season>
    <season name="winter">
      <fog>
        <heightFog>
          <maxHeight min="0" max="100"/>
        </heightFog>
      </fog>
    </season>
  </weather>
</environment>
"#;

fn write_template(templates_dir: &Path) -> PathBuf {
    std::fs::create_dir_all(templates_dir).unwrap();
    let archive_path = templates_dir.join("fs25-map-template.zip");
    let file = File::create(&archive_path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default();

    let entries = [
        ("map/map.i3d", MAP_I3D),
        ("map/splines.i3d", SPLINES_I3D),
        ("map/map.xml", MAP_XML),
        ("map/config/farmlands.xml", FARMLANDS_XML),
        ("map/config/environment.xml", ENVIRONMENT_XML),
    ];
    for (name, contents) in entries {
        zip.start_file(name, options).unwrap();
        zip.write_all(contents.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
    archive_path
}

struct RollingHills;

impl DtmProvider for RollingHills {
    fn name(&self) -> &str {
        "rolling-hills"
    }
    fn fetch(&self, _: (f64, f64), _: u32) -> Result<HeightGrid, FetchError> {
        let size = 128usize;
        let mut values = Vec::with_capacity(size * size);
        for y in 0..size {
            for x in 0..size {
                let rolling =
                    ((x as f32 / 9.0).sin() + (y as f32 / 13.0).cos()) * 12.0;
                values.push(300.0 + rolling);
            }
        }
        Ok(HeightGrid { width: size, height: size, values })
    }
}

fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|&(k, v)| (k.to_string(), v.to_string())).collect()
}

fn synthetic_osm(center: (f64, f64)) -> MemoryOsm {
    let field_box = BoundingBox::from_center(center, 40.0);
    let field = OsmFeature {
        geometry: OsmGeometry::Polygon(vec![
            (field_box.west, field_box.south),
            (field_box.east, field_box.south),
            (field_box.east, field_box.north),
            (field_box.west, field_box.north),
        ]),
        tags: tags(&[("landuse", "farmland")]),
    };

    let road_box = BoundingBox::from_center(center, 100.0);
    let road = OsmFeature {
        geometry: OsmGeometry::Line(vec![
            (road_box.west, center.0),
            (center.1, center.0),
            (road_box.east, center.0),
        ]),
        tags: tags(&[("highway", "residential")]),
    };

    let water_box = BoundingBox::from_center((center.0 + 0.0006, center.1), 25.0);
    let water = OsmFeature {
        geometry: OsmGeometry::Polygon(vec![
            (water_box.west, water_box.south),
            (water_box.east, water_box.south),
            (water_box.east, water_box.north),
            (water_box.west, water_box.north),
        ]),
        tags: tags(&[("natural", "water")]),
    };

    MemoryOsm { features: vec![field, road, water] }
}

fn build_map(dir: &Path, size: u32, rotation: i32, output_size: Option<u32>) -> Map {
    let templates = dir.join("templates");
    write_template(&templates);
    let game = GameProfile::new(GameKind::Fs25, &templates);
    let center = (45.286, 20.239);

    let mut ctx = MapContext::new(
        game,
        center,
        size,
        rotation,
        dir.join("out"),
        Box::new(RollingHills),
        Box::new(synthetic_osm(center)),
    )
    .unwrap();
    ctx.output_size = output_size;
    // Keep the valley floor at altitude so the height scale ends up above
    // the 255 m minimum and the descriptor update is observable.
    ctx.settings.dem.plateau = 300;
    Map::new(ctx).unwrap()
}

#[test]
fn full_pipeline_produces_the_expected_package() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = build_map(dir.path(), 256, 0, None);

    let names: Vec<&str> = map.generate().map(|step| step.unwrap()).collect();
    assert_eq!(
        names,
        vec!["satellite", "texture", "background", "grle", "i3d", "config", "road"]
    );

    let out = dir.path().join("out");

    // Playable DEM: 16-bit, one vertex more than the cell count per side.
    let dem = image::open(out.join("map/data/dem.png")).unwrap().to_luma16();
    assert_eq!(dem.dimensions(), (257, 257));
    assert!(dem.pixels().any(|p| p.0[0] > 0));

    // Untouched copy the FS25 profile asks for.
    assert!(out.join("map/data/unprocessedHeightMap.png").is_file());

    // Farmlands raster at half resolution with one region of id 1.
    let farmlands =
        image::open(out.join("map/data/infoLayer_farmlands.png")).unwrap().to_luma8();
    assert_eq!(farmlands.dimensions(), (128, 128));
    let ids: std::collections::BTreeSet<u8> =
        farmlands.pixels().map(|p| p.0[0]).filter(|&v| v != 0).collect();
    assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1]);

    let farmlands_xml = std::fs::read_to_string(out.join("map/config/farmlands.xml")).unwrap();
    assert!(farmlands_xml.contains(r#"pricePerHa="60000""#));
    assert_eq!(farmlands_xml.matches("<farmland ").count(), 1);
    assert!(farmlands_xml.contains(r#"id="1""#));

    // Map descriptor carries the output size.
    let map_xml = std::fs::read_to_string(out.join("map/map.xml")).unwrap();
    assert!(map_xml.contains(r#"width="256""#));
    assert!(map_xml.contains(r#"height="256""#));

    // The map i3d got a real height scale and the field node.
    let map_i3d = std::fs::read_to_string(out.join("map/map.i3d")).unwrap();
    assert!(!map_i3d.contains(r#"heightScale="255""#));
    assert!(map_i3d.contains("field1"));
    assert!(map_i3d.contains("polygonPoints"));

    // One road spline with both endpoints of the polyline densified.
    let splines = std::fs::read_to_string(out.join("map/splines.i3d")).unwrap();
    assert!(splines.contains("NurbsCurve"));
    assert!(splines.contains("spline1"));
    assert!(splines.contains("speedLimit"));

    // Fog bands were clamped against the DEM.
    let environment = std::fs::read_to_string(out.join("map/config/environment.xml")).unwrap();
    assert!(!environment.contains(r#"max="100""#));

    // Road surface mesh with material and texture.
    assert!(out.join("roads/roads.obj").is_file());
    assert!(out.join("roads/roads.mtl").is_file());
    assert!(out.join("roads/asphalt.png").is_file());
    assert!(out.join("assets/roads/roads.i3d").is_file());
    let roads_obj = std::fs::read_to_string(out.join("roads/roads.obj")).unwrap();
    assert!(roads_obj.contains("usemtl RoadMaterial"));
    assert!(roads_obj.contains("vt "));

    // Info layer stores for both scopes.
    assert!(out.join("info_layers/textures.json").is_file());
    assert!(out.join("info_layers/background.json").is_file());
    let textures_json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("info_layers/textures.json")).unwrap())
            .unwrap();
    assert!(textures_json.get("fields").is_some());
    assert!(textures_json.get("roads_polylines").is_some());

    // Background rasters at playable + skirt resolution.
    let full = image::open(out.join("background/FULL.png")).unwrap().to_luma16();
    assert_eq!(full.dimensions(), (256 + 4096, 256 + 4096));
    assert!(out.join("background/not_substracted.png").is_file());
    assert!(out.join("background/not_resized_dem.png").is_file());

    // The run ledger carries one section per reporting component.
    let info: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("generation_info.json")).unwrap())
            .unwrap();
    assert!(info.get("texture").is_some());
    assert!(info["background"]["height_scale_value"].as_f64().unwrap() > 255.0);
}

#[test]
fn weight_masks_partition_every_pixel() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = build_map(dir.path(), 256, 0, None);
    for step in map.generate() {
        step.unwrap();
    }

    let weights_dir = dir.path().join("out/map/data");
    let schema = &map.ctx.schema;

    let mut masks = Vec::new();
    for layer in &schema.layers {
        if !layer.has_tags() || layer.external {
            continue;
        }
        let path = layer.path(&weights_dir);
        assert!(path.is_file(), "missing weight mask {}", path.display());
        masks.push(image::open(&path).unwrap().to_luma8());
    }
    assert!(!masks.is_empty());
    for mask in &masks {
        assert_eq!(mask.dimensions(), (256, 256));
    }

    for y in 0..256u32 {
        for x in 0..256u32 {
            let sum: u32 = masks.iter().map(|m| u32::from(m.get_pixel(x, y).0[0])).sum();
            assert_eq!(sum, 255, "coverage violated at ({}, {})", x, y);
        }
    }
}

#[test]
fn output_size_rescales_every_final_raster() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = build_map(dir.path(), 128, 0, Some(256));
    for step in map.generate() {
        step.unwrap();
    }
    let out = dir.path().join("out");

    let dem = image::open(out.join("map/data/dem.png")).unwrap().to_luma16();
    assert_eq!(dem.dimensions(), (257, 257));

    let farmlands =
        image::open(out.join("map/data/infoLayer_farmlands.png")).unwrap().to_luma8();
    assert_eq!(farmlands.dimensions(), (128, 128));

    let grass = image::open(out.join("map/data/grass01_weight.png")).unwrap().to_luma8();
    assert_eq!(grass.dimensions(), (256, 256));

    let map_xml = std::fs::read_to_string(out.join("map/map.xml")).unwrap();
    assert!(map_xml.contains(r#"width="256""#));
}

#[test]
fn rotation_keeps_playable_outputs_at_the_same_shape() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = build_map(dir.path(), 256, 45, None);
    for step in map.generate() {
        step.unwrap();
    }
    let out = dir.path().join("out");

    let dem = image::open(out.join("map/data/dem.png")).unwrap().to_luma16();
    assert_eq!(dem.dimensions(), (257, 257));

    let grass = image::open(out.join("map/data/grass01_weight.png")).unwrap().to_luma8();
    assert_eq!(grass.dimensions(), (256, 256));
}
