use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use super::Mesh;

/// Material description for an OBJ/MTL pair.
pub struct MtlSpec {
    pub material_name: &'static str,
    pub texture_filename: String,
    pub specular: [f32; 3],
    pub specular_exponent: Option<f32>,
    pub illumination: u8,
}

impl MtlSpec {
    pub fn road(texture_filename: String) -> Self {
        Self {
            material_name: "RoadMaterial",
            texture_filename,
            specular: [0.3, 0.3, 0.3],
            specular_exponent: Some(10.0),
            illumination: 2,
        }
    }

    pub fn terrain(texture_filename: String) -> Self {
        Self {
            material_name: "TerrainMaterial",
            texture_filename,
            specular: [0.0, 0.0, 0.0],
            specular_exponent: None,
            illumination: 1,
        }
    }
}

pub fn write_mtl(path: &Path, spec: &MtlSpec) -> Result<()> {
    let mut w = BufWriter::new(
        File::create(path).with_context(|| format!("creating {}", path.display()))?,
    );
    writeln!(w, "newmtl {}", spec.material_name)?;
    writeln!(w, "Ka 1.0 1.0 1.0")?;
    writeln!(w, "Kd 1.0 1.0 1.0")?;
    writeln!(w, "Ks {} {} {}", spec.specular[0], spec.specular[1], spec.specular[2])?;
    if let Some(ns) = spec.specular_exponent {
        writeln!(w, "Ns {}", ns)?;
    }
    writeln!(w, "illum {}", spec.illumination)?;
    writeln!(w, "map_Kd {}", spec.texture_filename)?;
    Ok(())
}

/// Writes the mesh as Wavefront OBJ. When the mesh carries UVs the faces
/// reference them as `f v/vt v/vt v/vt`; `mtl_filename` adds the material
/// library and usemtl lines.
pub fn write_obj(
    mesh: &Mesh,
    path: &Path,
    object_name: &str,
    mtl: Option<(&str, &str)>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut w = BufWriter::new(
        File::create(path).with_context(|| format!("creating {}", path.display()))?,
    );

    writeln!(w, "o {}", object_name)?;
    if let Some((mtl_filename, _)) = mtl {
        writeln!(w, "mtllib {}", mtl_filename)?;
    }

    for v in &mesh.vertices {
        writeln!(w, "v {:.6} {:.6} {:.6}", v.x, v.y, v.z)?;
    }
    let textured = !mesh.uvs.is_empty();
    if textured {
        for uv in &mesh.uvs {
            writeln!(w, "vt {:.6} {:.6}", uv.x, uv.y)?;
        }
    }

    if let Some((_, material_name)) = mtl {
        writeln!(w, "usemtl {}", material_name)?;
    }
    for face in &mesh.faces {
        // OBJ indices are 1-based; UVs are parallel to vertices.
        let (a, b, c) = (face[0] + 1, face[1] + 1, face[2] + 1);
        if textured {
            writeln!(w, "f {}/{} {}/{} {}/{}", a, a, b, b, c, c)?;
        } else {
            writeln!(w, "f {} {} {}", a, b, c)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Point2, Point3};

    fn quad() -> Mesh {
        Mesh {
            vertices: vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            uvs: vec![
                Point2::new(0.0, 0.0),
                Point2::new(1.0, 0.0),
                Point2::new(1.0, 1.0),
                Point2::new(0.0, 1.0),
            ],
            faces: vec![[0, 1, 2], [0, 2, 3]],
        }
    }

    #[test]
    fn obj_output_references_uvs_and_material() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quad.obj");
        write_obj(&quad(), &path, "quad", Some(("quad.mtl", "RoadMaterial"))).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("mtllib quad.mtl"));
        assert!(contents.contains("usemtl RoadMaterial"));
        assert_eq!(contents.matches("\nv ").count(), 4);
        assert_eq!(contents.matches("\nvt ").count(), 4);
        assert!(contents.contains("f 1/1 2/2 3/3"));
    }

    #[test]
    fn untextured_obj_uses_plain_face_indices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.obj");
        let mut mesh = quad();
        mesh.uvs.clear();
        write_obj(&mesh, &path, "plain", None).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("f 1 2 3"));
        assert!(!contents.contains("vt "));
    }

    #[test]
    fn mtl_contains_the_texture_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roads.mtl");
        write_mtl(&path, &MtlSpec::road("asphalt.png".to_string())).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("newmtl RoadMaterial"));
        assert!(contents.contains("map_Kd asphalt.png"));
        assert!(contents.contains("Ns 10"));
    }
}
