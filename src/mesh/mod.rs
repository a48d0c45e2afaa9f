use cgmath::{Point2, Point3};

use crate::raster::Gray16;

pub mod i3d;
pub mod obj;

/// Downsampling stride applied to the heightmap before triangulation.
pub const RESIZE_FACTOR: u32 = 8;

/// A triangulated surface with optional texture coordinates. Faces index
/// into `vertices`; when `uvs` is non-empty it is parallel to `vertices`.
#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Point3<f32>>,
    pub uvs: Vec<Point2<f32>>,
    pub faces: Vec<[u32; 3]>,
}

impl Mesh {
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn extents(&self) -> (f32, f32, f32) {
        let (mut min, mut max) = (
            Point3::new(f32::MAX, f32::MAX, f32::MAX),
            Point3::new(f32::MIN, f32::MIN, f32::MIN),
        );
        for v in &self.vertices {
            min.x = min.x.min(v.x);
            min.y = min.y.min(v.y);
            min.z = min.z.min(v.z);
            max.x = max.x.max(v.x);
            max.y = max.y.max(v.y);
            max.z = max.z.max(v.z);
        }
        if self.vertices.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        (max.x - min.x, max.y - min.y, max.z - min.z)
    }

    pub fn min_corner(&self) -> Point3<f32> {
        let mut min = Point3::new(f32::MAX, f32::MAX, f32::MAX);
        for v in &self.vertices {
            min.x = min.x.min(v.x);
            min.y = min.y.min(v.y);
            min.z = min.z.min(v.z);
        }
        min
    }

    pub fn centroid(&self) -> Point3<f32> {
        let mut sum = Point3::new(0.0f64, 0.0, 0.0);
        for v in &self.vertices {
            sum.x += f64::from(v.x);
            sum.y += f64::from(v.y);
            sum.z += f64::from(v.z);
        }
        let n = self.vertices.len().max(1) as f64;
        Point3::new((sum.x / n) as f32, (sum.y / n) as f32, (sum.z / n) as f32)
    }

    pub fn apply_scale(&mut self, sx: f32, sy: f32, sz: f32) {
        for v in &mut self.vertices {
            v.x *= sx;
            v.y *= sy;
            v.z *= sz;
        }
    }

    pub fn apply_translation(&mut self, dx: f32, dy: f32, dz: f32) {
        for v in &mut self.vertices {
            v.x += dx;
            v.y += dy;
            v.z += dz;
        }
    }

    /// Rotation about the X axis, used to move between the raster frame and
    /// the engine's Y-up frame.
    pub fn rotate_x(&mut self, degrees: f32) {
        let (sin, cos) = degrees.to_radians().sin_cos();
        for v in &mut self.vertices {
            let (y, z) = (v.y, v.z);
            v.y = y * cos - z * sin;
            v.z = y * sin + z * cos;
        }
    }

    fn rotate_y_180(&mut self) {
        for v in &mut self.vertices {
            v.x = -v.x;
            v.z = -v.z;
        }
    }

    fn rotate_z_180(&mut self) {
        for v in &mut self.vertices {
            v.x = -v.x;
            v.y = -v.y;
        }
    }

    pub fn center_on_origin(&mut self) {
        let c = self.centroid();
        self.apply_translation(-c.x, -c.y, -c.z);
    }

    /// Reverses the winding of every face, flipping the normals.
    pub fn invert_faces(&mut self) {
        for face in &mut self.faces {
            face.swap(0, 2);
        }
    }

    /// Moves the mesh so the playable square sits at the origin, using the
    /// mesh extents the way the terrain convention expects.
    pub fn to_origin(&mut self) {
        let (x_size, _, _) = self.extents();
        let distance = (x_size.round() / 2.0).floor();
        self.apply_translation(-distance, distance, 0.0);
    }

    /// Drops every triangle whose footprint lies inside the centered square
    /// of side `remove_size`. For a height-field grid this matches the
    /// boolean cube difference up to the tessellation of the rim.
    pub fn remove_center(&mut self, remove_size: f32) {
        let half = remove_size / 2.0;
        let vertices = &self.vertices;
        self.faces.retain(|face| {
            let cx = (vertices[face[0] as usize].x
                + vertices[face[1] as usize].x
                + vertices[face[2] as usize].x)
                / 3.0;
            let cy = (vertices[face[0] as usize].y
                + vertices[face[1] as usize].y
                + vertices[face[2] as usize].y)
                / 3.0;
            cx.abs() > half || cy.abs() > half
        });
    }

    /// Vertex-clustering decimation to roughly `factor` of the original
    /// face count.
    pub fn decimate(&self, factor: f32) -> Mesh {
        if self.faces.is_empty() || factor >= 1.0 {
            return self.clone();
        }
        let (ex, ey, _) = self.extents();
        let area = (ex * ey).max(1.0);
        let avg_edge = (2.0 * area / self.faces.len() as f32).sqrt();
        let cell = (avg_edge / factor.sqrt()).max(avg_edge);
        let min = self.min_corner();

        let mut clusters: std::collections::HashMap<(i64, i64), (usize, Point3<f64>)> =
            std::collections::HashMap::new();
        let mut remap = vec![0u32; self.vertices.len()];
        let mut order: Vec<(i64, i64)> = Vec::new();

        for (i, v) in self.vertices.iter().enumerate() {
            let key = (
                ((v.x - min.x) / cell).floor() as i64,
                ((v.y - min.y) / cell).floor() as i64,
            );
            let next_index = clusters.len();
            let entry = clusters.entry(key).or_insert_with(|| {
                order.push(key);
                (next_index, Point3::new(0.0, 0.0, 0.0))
            });
            entry.1.x += f64::from(v.x);
            entry.1.y += f64::from(v.y);
            entry.1.z += f64::from(v.z);
            remap[i] = entry.0 as u32;
        }

        let mut counts = vec![0u32; clusters.len()];
        for &r in &remap {
            counts[r as usize] += 1;
        }
        let mut vertices = vec![Point3::new(0.0f32, 0.0, 0.0); clusters.len()];
        for key in &order {
            let (index, sum) = &clusters[key];
            let n = f64::from(counts[*index]);
            vertices[*index] =
                Point3::new((sum.x / n) as f32, (sum.y / n) as f32, (sum.z / n) as f32);
        }

        let mut faces = Vec::new();
        for face in &self.faces {
            let mapped =
                [remap[face[0] as usize], remap[face[1] as usize], remap[face[2] as usize]];
            if mapped[0] != mapped[1] && mapped[1] != mapped[2] && mapped[0] != mapped[2] {
                faces.push(mapped);
            }
        }
        Mesh { vertices, uvs: Vec::new(), faces }
    }

    /// UV projection onto the XZ ground plane after the mesh was brought
    /// into the Y-up frame: `u = (x - min_x) / width`, `v = 1 - (z - min_z)
    /// / depth`.
    pub fn project_xz_uvs(&mut self) {
        let mut min = (f32::MAX, f32::MAX);
        let mut max = (f32::MIN, f32::MIN);
        for v in &self.vertices {
            min.0 = min.0.min(v.x);
            min.1 = min.1.min(v.z);
            max.0 = max.0.max(v.x);
            max.1 = max.1.max(v.z);
        }
        let width = (max.0 - min.0).max(1e-6);
        let depth = (max.1 - min.1).max(1e-6);
        self.uvs = self
            .vertices
            .iter()
            .map(|v| {
                let u = ((v.x - min.0) / width).clamp(0.0, 1.0);
                let t = (1.0 - (v.z - min.1) / depth).clamp(0.0, 1.0);
                Point2::new(u, t)
            })
            .collect();
    }
}

/// Unfolds a 16-bit heightmap into a triangulated grid.
///
/// The raster is inverted and downsampled by [`RESIZE_FACTOR`] first; cells
/// touching the ground level are skipped unless `include_zeros`. Two 180
/// degree rotations bring the grid into the terrain-engine convention, then
/// X/Y are scaled back up by the stride and Z by `z_scaling_factor`.
pub fn mesh_from_heightmap(
    data: &Gray16,
    include_zeros: bool,
    z_scaling_factor: f64,
) -> Mesh {
    let expected_size = data.width() as f32;
    let max_value = data.pixels().map(|p| p.0[0]).max().unwrap_or(0);

    let cols = (data.width() / RESIZE_FACTOR).max(2) as usize;
    let rows = (data.height() / RESIZE_FACTOR).max(2) as usize;

    let mut inverted = vec![0f32; rows * cols];
    for row in 0..rows {
        for col in 0..cols {
            let px = (col as u32 * RESIZE_FACTOR).min(data.width() - 1);
            let py = (row as u32 * RESIZE_FACTOR).min(data.height() - 1);
            inverted[row * cols + col] = f32::from(max_value - data.get_pixel(px, py).0[0]);
        }
    }
    let ground = inverted.iter().copied().fold(f32::MIN, f32::max);

    let mut mesh = Mesh::default();
    mesh.vertices = (0..rows * cols)
        .map(|i| {
            Point3::new((i % cols) as f32, (i / cols) as f32, inverted[i])
        })
        .collect();

    for row in 0..rows - 1 {
        for col in 0..cols - 1 {
            let top_left = (row * cols + col) as u32;
            let top_right = top_left + 1;
            let bottom_left = top_left + cols as u32;
            let bottom_right = bottom_left + 1;

            if !include_zeros {
                let corners = [
                    inverted[row * cols + col],
                    inverted[row * cols + col + 1],
                    inverted[(row + 1) * cols + col],
                    inverted[(row + 1) * cols + col + 1],
                ];
                if corners.contains(&ground) {
                    continue;
                }
            }
            mesh.faces.push([top_left, bottom_left, bottom_right]);
            mesh.faces.push([top_left, bottom_right, top_right]);
        }
    }

    mesh.rotate_y_180();
    mesh.rotate_z_180();
    mesh.apply_scale(RESIZE_FACTOR as f32, RESIZE_FACTOR as f32, z_scaling_factor as f32);

    if include_zeros {
        // Snap the footprint back to the raster extent lost to the stride.
        let (x_size, y_size, _) = mesh.extents();
        if x_size > 0.0 && y_size > 0.0 {
            let c = mesh.centroid();
            for v in &mut mesh.vertices {
                v.x = c.x + (v.x - c.x) * expected_size / x_size;
                v.y = c.y + (v.y - c.y) * expected_size / y_size;
            }
        }
    }
    mesh
}

/// Ear-clipping triangulation of a simple polygon ring without holes.
/// Returns indices into the input slice, or `None` for degenerate rings.
pub fn triangulate_polygon(points: &[(f64, f64)]) -> Option<Vec<[u32; 3]>> {
    let mut ring: Vec<usize> = (0..points.len()).collect();
    if points.len() > 1 {
        let first = points[0];
        let last = points[points.len() - 1];
        if (first.0 - last.0).abs() < 1e-9 && (first.1 - last.1).abs() < 1e-9 {
            ring.pop();
        }
    }
    if ring.len() < 3 {
        return None;
    }

    let area: f64 = {
        let mut sum = 0.0;
        for i in 0..ring.len() {
            let (x0, y0) = points[ring[i]];
            let (x1, y1) = points[ring[(i + 1) % ring.len()]];
            sum += x0 * y1 - x1 * y0;
        }
        sum / 2.0
    };
    let ccw = area > 0.0;

    let cross = |a: (f64, f64), b: (f64, f64), c: (f64, f64)| {
        (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
    };
    let inside = |a: (f64, f64), b: (f64, f64), c: (f64, f64), p: (f64, f64)| {
        let d1 = cross(a, b, p);
        let d2 = cross(b, c, p);
        let d3 = cross(c, a, p);
        let has_neg = d1 < 0.0 || d2 < 0.0 || d3 < 0.0;
        let has_pos = d1 > 0.0 || d2 > 0.0 || d3 > 0.0;
        !(has_neg && has_pos)
    };

    let mut faces = Vec::with_capacity(ring.len().saturating_sub(2));
    let mut guard = 0usize;
    while ring.len() > 3 {
        guard += 1;
        if guard > points.len() * points.len() {
            return None;
        }
        let n = ring.len();
        let mut clipped = false;
        for i in 0..n {
            let (ia, ib, ic) = (ring[(i + n - 1) % n], ring[i], ring[(i + 1) % n]);
            let (a, b, c) = (points[ia], points[ib], points[ic]);
            let convex = if ccw { cross(a, b, c) > 1e-12 } else { cross(a, b, c) < -1e-12 };
            if !convex {
                continue;
            }
            let contains_other = ring
                .iter()
                .filter(|&&j| j != ia && j != ib && j != ic)
                .any(|&j| inside(a, b, c, points[j]));
            if contains_other {
                continue;
            }
            faces.push([ia as u32, ib as u32, ic as u32]);
            ring.remove(i);
            clipped = true;
            break;
        }
        if !clipped {
            return None;
        }
    }
    faces.push([ring[0] as u32, ring[1] as u32, ring[2] as u32]);
    Some(faces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn flat_map(size: u32, value: u16) -> Gray16 {
        let mut img = crate::raster::new_gray16(size, size);
        for p in img.pixels_mut() {
            p.0[0] = value;
        }
        img
    }

    #[test]
    fn heightmap_mesh_covers_the_raster_extent() {
        let mut img = flat_map(128, 100);
        img.put_pixel(64, 64, Luma([5000]));
        let mesh = mesh_from_heightmap(&img, true, 1.0);
        assert!(!mesh.is_empty());
        let (x, y, _) = mesh.extents();
        assert!((x - 128.0).abs() < 1.0);
        assert!((y - 128.0).abs() < 1.0);
    }

    #[test]
    fn skipping_ground_cells_drops_empty_regions() {
        let mut img = crate::raster::new_gray16(128, 128);
        // One raised block in the corner; the rest stays at ground level.
        for y in 0..32 {
            for x in 0..32 {
                img.put_pixel(x, y, Luma([2000]));
            }
        }
        let full = mesh_from_heightmap(&img, true, 1.0);
        let partial = mesh_from_heightmap(&img, false, 1.0);
        assert!(partial.faces.len() < full.faces.len());
        assert!(!partial.is_empty());
    }

    #[test]
    fn remove_center_clears_the_playable_square() {
        let img = flat_map(256, 1000);
        let mut mesh = mesh_from_heightmap(&img, true, 1.0);
        mesh.to_origin();
        let before = mesh.faces.len();
        mesh.remove_center(128.0);
        assert!(mesh.faces.len() < before);
        let half = 64.0;
        for face in &mesh.faces {
            let cx: f32 = face.iter().map(|&i| mesh.vertices[i as usize].x).sum::<f32>() / 3.0;
            let cy: f32 = face.iter().map(|&i| mesh.vertices[i as usize].y).sum::<f32>() / 3.0;
            assert!(cx.abs() > half || cy.abs() > half);
        }
    }

    #[test]
    fn decimation_reduces_face_count() {
        let img = flat_map(512, 700);
        let mesh = mesh_from_heightmap(&img, true, 1.0);
        let decimated = mesh.decimate(0.1);
        assert!(!decimated.is_empty());
        assert!(decimated.faces.len() < mesh.faces.len() / 2);
    }

    #[test]
    fn triangulation_of_a_convex_ring() {
        let square = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        let faces = triangulate_polygon(&square).unwrap();
        assert_eq!(faces.len(), 2);
    }

    #[test]
    fn triangulation_of_a_concave_ring() {
        let ring = [
            (0.0, 0.0),
            (10.0, 0.0),
            (10.0, 10.0),
            (5.0, 3.0),
            (0.0, 10.0),
        ];
        let faces = triangulate_polygon(&ring).unwrap();
        assert_eq!(faces.len(), 3);
    }

    #[test]
    fn degenerate_ring_is_rejected() {
        assert!(triangulate_polygon(&[(0.0, 0.0), (1.0, 1.0)]).is_none());
    }

    #[test]
    fn xz_uvs_span_the_unit_square() {
        let img = flat_map(128, 300);
        let mut mesh = mesh_from_heightmap(&img, true, 1.0);
        mesh.rotate_x(-90.0);
        mesh.project_xz_uvs();
        assert_eq!(mesh.uvs.len(), mesh.vertices.len());
        for uv in &mesh.uvs {
            assert!((0.0..=1.0).contains(&uv.x));
            assert!((0.0..=1.0).contains(&uv.y));
        }
    }

    #[test]
    fn invert_faces_reverses_winding() {
        let mut mesh = Mesh {
            vertices: vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            uvs: Vec::new(),
            faces: vec![[0, 1, 2]],
        };
        mesh.invert_faces();
        assert_eq!(mesh.faces[0], [2, 1, 0]);
    }
}
