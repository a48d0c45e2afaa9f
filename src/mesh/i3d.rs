use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, Event};
use quick_xml::Writer;

use super::Mesh;
use crate::xmlutil::owned_element;

fn start(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
    writer.write_event(Event::Start(owned_element(name, attrs)))?;
    Ok(())
}

fn empty(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
    writer.write_event(Event::Empty(owned_element(name, attrs)))?;
    Ok(())
}

fn end(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str) -> Result<()> {
    writer.write_event(Event::End(BytesEnd::owned(name.as_bytes().to_vec())))?;
    Ok(())
}

/// Emits the mesh as an I3D 1.6 scene with one `IndexedTriangleSet`.
///
/// Water meshes get the ocean-shader material variant and a bare `Shape`
/// scene node; everything else gets a standard material (optionally
/// textured) under a `TransformGroup`.
pub fn write_mesh_i3d(
    mesh: &Mesh,
    path: &Path,
    name: &str,
    texture_file: Option<&str>,
    water_mesh: bool,
) -> Result<()> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new(b"1.0", Some(b"iso-8859-1"), None)))?;

    start(
        &mut writer,
        "i3D",
        &[
            ("name", name),
            ("version", "1.6"),
            ("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"),
            ("xsi:noNamespaceSchemaLocation", "http://i3d.giants.ch/schema/i3d-1.6.xsd"),
        ],
    )?;

    start(&mut writer, "Asset", &[])?;
    empty(
        &mut writer,
        "Export",
        &[("program", "farmscape"), ("version", env!("CARGO_PKG_VERSION"))],
    )?;
    end(&mut writer, "Asset")?;

    if water_mesh {
        start(&mut writer, "Files", &[])?;
        empty(
            &mut writer,
            "File",
            &[("fileId", "4"), ("filename", "$data/shaders/oceanShader.xml")],
        )?;
        end(&mut writer, "Files")?;
    } else if let Some(texture) = texture_file {
        start(&mut writer, "Files", &[])?;
        empty(
            &mut writer,
            "File",
            &[("fileId", "1"), ("filename", texture), ("relativePath", "true")],
        )?;
        end(&mut writer, "Files")?;
    }

    start(&mut writer, "Materials", &[])?;
    if water_mesh {
        start(
            &mut writer,
            "Material",
            &[
                ("name", "OceanShader"),
                ("materialId", "1"),
                ("diffuseColor", "0.8 0.8 0.8 1"),
                ("specularColor", "0.501961 1 0"),
                ("customShaderId", "4"),
                ("customShaderVariation", "simple"),
            ],
        )?;
        empty(&mut writer, "Normalmap", &[("fileId", "2")])?;
        empty(
            &mut writer,
            "Refractionmap",
            &[("coeff", "1"), ("bumpScale", "0.01"), ("withSSRData", "true")],
        )?;
        end(&mut writer, "Material")?;
    } else {
        let material_name = format!("{}_material", name);
        let attrs = [
            ("name", material_name.as_str()),
            ("materialId", "1"),
            ("diffuseColor", "1 1 1 1"),
            ("specularColor", "0.5 0.5 0.5"),
        ];
        if texture_file.is_some() {
            start(&mut writer, "Material", &attrs)?;
            empty(&mut writer, "Texture", &[("fileId", "1")])?;
            end(&mut writer, "Material")?;
        } else {
            empty(&mut writer, "Material", &attrs)?;
        }
    }
    end(&mut writer, "Materials")?;

    start(&mut writer, "Shapes", &[])?;
    let mut shape_attrs: Vec<(String, String)> =
        vec![("name".into(), name.to_string()), ("shapeId".into(), "1".into())];
    if !mesh.vertices.is_empty() {
        let center = mesh.centroid();
        let radius = mesh
            .vertices
            .iter()
            .map(|v| {
                let (dx, dy, dz) = (v.x - center.x, v.y - center.y, v.z - center.z);
                (dx * dx + dy * dy + dz * dz).sqrt()
            })
            .fold(0.0f32, f32::max);
        shape_attrs.push((
            "bvCenter".into(),
            format!("{:.6} {:.6} {:.6}", center.x, center.y, center.z),
        ));
        shape_attrs.push(("bvRadius".into(), format!("{:.6}", radius)));
    }
    let borrowed: Vec<(&str, &str)> =
        shape_attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    start(&mut writer, "IndexedTriangleSet", &borrowed)?;

    let has_uv = mesh.uvs.len() == mesh.vertices.len() && !mesh.uvs.is_empty();
    let vertex_count = mesh.vertices.len().to_string();
    let mut vertex_attrs = vec![("count", vertex_count.as_str())];
    if has_uv {
        vertex_attrs.push(("uv0", "true"));
    }
    start(&mut writer, "Vertices", &vertex_attrs)?;
    for (i, v) in mesh.vertices.iter().enumerate() {
        let position = format!("{:.6} {:.6} {:.6}", v.x, v.y, v.z);
        if has_uv {
            let uv = mesh.uvs[i];
            let t0 = format!("{:.6} {:.6}", uv.x, uv.y);
            empty(&mut writer, "v", &[("p", position.as_str()), ("t0", t0.as_str())])?;
        } else {
            empty(&mut writer, "v", &[("p", position.as_str())])?;
        }
    }
    end(&mut writer, "Vertices")?;

    let triangle_count = mesh.faces.len().to_string();
    start(&mut writer, "Triangles", &[("count", triangle_count.as_str())])?;
    for face in &mesh.faces {
        let vi = format!("{} {} {}", face[0], face[1], face[2]);
        empty(&mut writer, "t", &[("vi", vi.as_str())])?;
    }
    end(&mut writer, "Triangles")?;

    start(&mut writer, "Subsets", &[("count", "1")])?;
    let num_indices = (mesh.faces.len() * 3).to_string();
    empty(
        &mut writer,
        "Subset",
        &[
            ("firstVertex", "0"),
            ("numVertices", vertex_count.as_str()),
            ("firstIndex", "0"),
            ("numIndices", num_indices.as_str()),
        ],
    )?;
    end(&mut writer, "Subsets")?;

    end(&mut writer, "IndexedTriangleSet")?;
    end(&mut writer, "Shapes")?;

    start(&mut writer, "Scene", &[])?;
    if water_mesh {
        empty(
            &mut writer,
            "Shape",
            &[
                ("name", name),
                ("shapeId", "1"),
                ("nodeId", "4"),
                ("castsShadows", "true"),
                ("receiveShadows", "true"),
                ("materialIds", "1"),
            ],
        )?;
    } else {
        start(&mut writer, "TransformGroup", &[("name", name), ("nodeId", "1")])?;
        let shape_name = format!("{}_shape", name);
        empty(
            &mut writer,
            "Shape",
            &[
                ("name", shape_name.as_str()),
                ("nodeId", "2"),
                ("shapeId", "1"),
                ("static", "true"),
                ("compound", "false"),
                ("collision", "true"),
                ("materialIds", "1"),
            ],
        )?;
        end(&mut writer, "TransformGroup")?;
    }
    end(&mut writer, "Scene")?;

    end(&mut writer, "i3D")?;

    let bytes = writer.into_inner().into_inner();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Point2, Point3};

    fn triangle() -> Mesh {
        Mesh {
            vertices: vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(10.0, 0.0, 0.0),
                Point3::new(0.0, 10.0, 0.0),
            ],
            uvs: vec![Point2::new(0.0, 0.0), Point2::new(1.0, 0.0), Point2::new(0.0, 1.0)],
            faces: vec![[0, 1, 2]],
        }
    }

    #[test]
    fn terrain_i3d_has_triangle_set_and_transform_group() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terrain.i3d");
        write_mesh_i3d(&triangle(), &path, "background_terrain", Some("texture.jpg"), false)
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("<IndexedTriangleSet"));
        assert!(contents.contains("uv0=\"true\""));
        assert!(contents.contains("TransformGroup name=\"background_terrain\""));
        assert!(contents.contains("filename=\"texture.jpg\""));
        assert!(contents.contains("vi=\"0 1 2\""));
        assert!(contents.contains("numIndices=\"3\""));
    }

    #[test]
    fn water_i3d_uses_the_ocean_shader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("water.i3d");
        write_mesh_i3d(&triangle(), &path, "water_resources", None, true).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("oceanShader.xml"));
        assert!(contents.contains("OceanShader"));
        assert!(contents.contains("customShaderVariation=\"simple\""));
        assert!(!contents.contains("TransformGroup"));
    }
}
