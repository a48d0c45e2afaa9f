use geo::{BooleanOps, Centroid, Coord, LineString, Polygon};

use crate::error::FeatureError;

/// A road or waterway surface entry: the polyline, its half width in meters
/// and a z offset applied to every generated vertex.
#[derive(Clone, Debug)]
pub struct LineSurfaceEntry {
    pub points: Vec<(f64, f64)>,
    pub width: f64,
    pub z_offset: f64,
}

/// Options for [`fit_into_bounds`]. All sizes are in pixels of the target
/// canvas; `map_size` and `rotated_size` are the unscaled sizes the rotation
/// compensation is derived from.
#[derive(Clone, Copy, Debug)]
pub struct FitOptions {
    pub map_size: f64,
    pub rotated_size: f64,
    pub size_scale: f64,
    /// Canvas side length the geometry must end up inside (already scaled).
    pub canvas_size: f64,
    /// Outward mitre margin for polygons.
    pub margin: f64,
    /// Map rotation in degrees; geometry is rotated back by this amount.
    pub angle: i32,
    /// Inset of the clipping box from the canvas edge.
    pub border: f64,
    pub xshift: f64,
    pub yshift: f64,
}

impl FitOptions {
    pub fn new(map_size: f64, rotated_size: f64, size_scale: f64, angle: i32) -> Self {
        Self {
            map_size,
            rotated_size,
            size_scale,
            canvas_size: map_size * size_scale,
            margin: 0.0,
            angle,
            border: 0.0,
            xshift: 0.0,
            yshift: 0.0,
        }
    }

    fn rotation_center(&self) -> (f64, f64) {
        let c = (self.rotated_size * self.size_scale / 2.0).floor();
        (c, c)
    }

    fn offset(&self) -> (f64, f64) {
        let base = ((self.map_size / 2.0) - (self.rotated_size / 2.0)).trunc() * self.size_scale;
        (base + self.xshift, base + self.yshift)
    }
}

fn rotate_point(p: (f64, f64), degrees: f64, center: (f64, f64)) -> (f64, f64) {
    let theta = degrees.to_radians();
    let (sin, cos) = theta.sin_cos();
    let dx = p.0 - center.0;
    let dy = p.1 - center.1;
    (center.0 + dx * cos - dy * sin, center.1 + dx * sin + dy * cos)
}

fn transform(points: &[(f64, f64)], opts: &FitOptions) -> Vec<(f64, f64)> {
    if opts.angle == 0 {
        return points.to_vec();
    }
    let center = opts.rotation_center();
    let (xoff, yoff) = opts.offset();
    points
        .iter()
        .map(|&p| {
            let r = rotate_point(p, -f64::from(opts.angle), center);
            (r.0 + xoff, r.1 + yoff)
        })
        .collect()
}

fn closed_ring(points: &[(f64, f64)]) -> Vec<Coord<f64>> {
    let mut coords: Vec<Coord<f64>> =
        points.iter().map(|&(x, y)| Coord { x, y }).collect();
    if coords.first() != coords.last() {
        if let Some(first) = coords.first().copied() {
            coords.push(first);
        }
    }
    coords
}

fn box_polygon(min: f64, max: f64) -> Polygon<f64> {
    Polygon::new(
        LineString::from(vec![(min, min), (max, min), (max, max), (min, max), (min, min)]),
        vec![],
    )
}

/// Fits a polygon into the map bounds: rotate back by the map rotation,
/// translate into the cropped frame, apply the mitre margin and clip against
/// the canvas box. Fails if the geometry leaves the canvas entirely or is
/// split into multiple parts by the clip.
pub fn fit_polygon_into_bounds(
    points: &[(f64, f64)],
    opts: &FitOptions,
) -> Result<Vec<(f64, f64)>, FeatureError> {
    if points.len() < 3 {
        return Err(FeatureError::Degenerate(points.len()));
    }
    let mut transformed = transform(points, opts);
    if opts.margin != 0.0 {
        transformed = offset_polygon_mitre(&transformed, opts.margin)
            .ok_or(FeatureError::Degenerate(transformed.len()))?;
    }

    let polygon = Polygon::new(LineString(closed_ring(&transformed)), vec![]);
    let bounds = box_polygon(opts.border, opts.canvas_size - opts.border);
    let clipped = polygon.intersection(&bounds);

    let mut parts: Vec<&Polygon<f64>> = clipped.iter().collect();
    match parts.len() {
        0 => Err(FeatureError::OutOfBounds),
        1 => {
            let part = parts.remove(0);
            let ring: Vec<(f64, f64)> =
                part.exterior().coords().map(|c| (c.x, c.y)).collect();
            if ring.len() < 4 {
                Err(FeatureError::Degenerate(ring.len()))
            } else {
                Ok(ring)
            }
        }
        _ => Err(FeatureError::Split),
    }
}

/// Fits a polyline into the map bounds. A polyline that exits the canvas and
/// re-enters would split, which is reported as an error exactly like a split
/// polygon.
pub fn fit_polyline_into_bounds(
    points: &[(f64, f64)],
    opts: &FitOptions,
) -> Result<Vec<(f64, f64)>, FeatureError> {
    if points.len() < 2 {
        return Err(FeatureError::Degenerate(points.len()));
    }
    let transformed = transform(points, opts);
    let min = opts.border;
    let max = opts.canvas_size - opts.border;

    let mut result: Vec<(f64, f64)> = Vec::new();
    let mut left_canvas = false;
    for window in transformed.windows(2) {
        let (a, b) = (window[0], window[1]);
        match clip_segment(a, b, min, max) {
            Some((ca, cb)) => {
                if result.is_empty() {
                    if left_canvas {
                        return Err(FeatureError::Split);
                    }
                    result.push(ca);
                } else {
                    let last = *result.last().unwrap();
                    if dist(last, ca) > 1e-6 {
                        return Err(FeatureError::Split);
                    }
                }
                result.push(cb);
            }
            None => {
                if !result.is_empty() {
                    left_canvas = true;
                }
            }
        }
    }
    if result.len() < 2 {
        return Err(FeatureError::OutOfBounds);
    }
    Ok(result)
}

/// Liang-Barsky clipping of one segment against the square [min, max]^2.
fn clip_segment(
    a: (f64, f64),
    b: (f64, f64),
    min: f64,
    max: f64,
) -> Option<((f64, f64), (f64, f64))> {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    let checks = [(-dx, a.0 - min), (dx, max - a.0), (-dy, a.1 - min), (dy, max - a.1)];
    for &(p, q) in &checks {
        if p.abs() < 1e-12 {
            if q < 0.0 {
                return None;
            }
        } else {
            let r = q / p;
            if p < 0.0 {
                t0 = t0.max(r);
            } else {
                t1 = t1.min(r);
            }
        }
    }
    if t0 > t1 {
        return None;
    }
    Some(((a.0 + t0 * dx, a.1 + t0 * dy), (a.0 + t1 * dx, a.1 + t1 * dy)))
}

fn dist(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

fn signed_area(points: &[(f64, f64)]) -> f64 {
    let n = points.len();
    let mut area = 0.0;
    for i in 0..n {
        let (x0, y0) = points[i];
        let (x1, y1) = points[(i + 1) % n];
        area += x0 * y1 - x1 * y0;
    }
    area / 2.0
}

/// Offsets a polygon ring outward by `margin` with mitre joins. A negative
/// margin shrinks the polygon. Returns `None` when the ring degenerates.
pub fn offset_polygon_mitre(points: &[(f64, f64)], margin: f64) -> Option<Vec<(f64, f64)>> {
    let mut ring: Vec<(f64, f64)> = points.to_vec();
    if ring.len() > 1 && dist(ring[0], ring[ring.len() - 1]) < 1e-9 {
        ring.pop();
    }
    if ring.len() < 3 {
        return None;
    }
    // Outward is to the right of each edge for clockwise rings in pixel
    // space (y grows downward); flip for counter-clockwise input.
    let orientation = if signed_area(&ring) >= 0.0 { 1.0 } else { -1.0 };

    let n = ring.len();
    let mut offset = Vec::with_capacity(n);
    for i in 0..n {
        let prev = ring[(i + n - 1) % n];
        let cur = ring[i];
        let next = ring[(i + 1) % n];

        let e0 = normalize((cur.0 - prev.0, cur.1 - prev.1))?;
        let e1 = normalize((next.0 - cur.0, next.1 - cur.1))?;
        let n0 = (e0.1 * orientation, -e0.0 * orientation);
        let n1 = (e1.1 * orientation, -e1.0 * orientation);

        // Intersect the two offset edge lines for the mitre corner; fall
        // back to the averaged normal when the edges are nearly parallel.
        let p0 = (prev.0 + n0.0 * margin, prev.1 + n0.1 * margin);
        let p1 = (cur.0 + n1.0 * margin, cur.1 + n1.1 * margin);
        let denom = e0.0 * e1.1 - e0.1 * e1.0;
        let corner = if denom.abs() < 1e-9 {
            (cur.0 + n0.0 * margin, cur.1 + n0.1 * margin)
        } else {
            let t = ((p1.0 - p0.0) * e1.1 - (p1.1 - p0.1) * e1.0) / denom;
            (p0.0 + e0.0 * t, p0.1 + e0.1 * t)
        };
        offset.push(corner);
    }

    if margin < 0.0 && signed_area(&offset) * signed_area(&ring) <= 0.0 {
        // The ring inverted; the shrink consumed the whole polygon.
        return None;
    }
    Some(offset)
}

fn normalize(v: (f64, f64)) -> Option<(f64, f64)> {
    let len = (v.0 * v.0 + v.1 * v.1).sqrt();
    if len < 1e-12 {
        None
    } else {
        Some((v.0 / len, v.1 / len))
    }
}

/// Per-vertex unit perpendiculars of a polyline: endpoints use the adjacent
/// segment, interior points average the two neighboring segments.
pub fn polyline_perpendiculars(points: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let n = points.len();
    let mut perps = Vec::with_capacity(n);
    for i in 0..n {
        let dir = if i == 0 {
            (points[1].0 - points[0].0, points[1].1 - points[0].1)
        } else if i == n - 1 {
            (points[n - 1].0 - points[n - 2].0, points[n - 1].1 - points[n - 2].1)
        } else {
            let d0 = (points[i].0 - points[i - 1].0, points[i].1 - points[i - 1].1);
            let d1 = (points[i + 1].0 - points[i].0, points[i + 1].1 - points[i].1);
            ((d0.0 + d1.0) / 2.0, (d0.1 + d1.1) / 2.0)
        };
        let unit = normalize(dir).unwrap_or((1.0, 0.0));
        perps.push((-unit.1, unit.0));
    }
    perps
}

/// Buffers a polyline into a closed ribbon polygon of half width `width`.
pub fn buffer_polyline(points: &[(f64, f64)], width: f64) -> Vec<(f64, f64)> {
    let perps = polyline_perpendiculars(points);
    let mut ring: Vec<(f64, f64)> = points
        .iter()
        .zip(&perps)
        .map(|(&p, &n)| (p.0 + n.0 * width, p.1 + n.1 * width))
        .collect();
    ring.extend(
        points
            .iter()
            .zip(&perps)
            .rev()
            .map(|(&p, &n)| (p.0 - n.0 * width, p.1 - n.1 * width)),
    );
    ring
}

/// Buffers a point into a regular 16-gon of the given radius.
pub fn buffer_point(p: (f64, f64), radius: f64) -> Vec<(f64, f64)> {
    (0..16)
        .map(|i| {
            let theta = f64::from(i) * std::f64::consts::TAU / 16.0;
            (p.0 + radius * theta.cos(), p.1 + radius * theta.sin())
        })
        .collect()
}

/// Inserts `num_points` linearly spaced points between every adjacent pair.
pub fn interpolate_points(polyline: &[(f64, f64)], num_points: u32) -> Vec<(f64, f64)> {
    if polyline.is_empty() || num_points == 0 {
        return polyline.to_vec();
    }
    let mut out = Vec::with_capacity(polyline.len() * (num_points as usize + 1));
    for window in polyline.windows(2) {
        let (p1, p2) = (window[0], window[1]);
        out.push(p1);
        for j in 1..=num_points {
            let t = f64::from(j) / f64::from(num_points + 1);
            out.push((p1.0 + (p2.0 - p1.0) * t, p1.1 + (p2.1 - p1.1) * t));
        }
    }
    out.push(*polyline.last().unwrap());
    out
}

pub fn polyline_length(points: &[(f64, f64)]) -> f64 {
    points.windows(2).map(|w| dist(w[0], w[1])).sum()
}

/// Point on the polyline at the given distance from its start.
pub fn point_at_distance(points: &[(f64, f64)], distance: f64) -> (f64, f64) {
    if points.is_empty() {
        return (0.0, 0.0);
    }
    let mut remaining = distance.max(0.0);
    for window in points.windows(2) {
        let seg = dist(window[0], window[1]);
        if remaining <= seg && seg > 0.0 {
            let t = remaining / seg;
            return (
                window[0].0 + (window[1].0 - window[0].0) * t,
                window[0].1 + (window[1].1 - window[0].1) * t,
            );
        }
        remaining -= seg;
    }
    *points.last().unwrap()
}

/// Slice of the polyline between two distances from its start.
pub fn polyline_substring(points: &[(f64, f64)], start: f64, end: f64) -> Vec<(f64, f64)> {
    let mut out = vec![point_at_distance(points, start)];
    let mut travelled = 0.0;
    for window in points.windows(2) {
        let seg = dist(window[0], window[1]);
        let vertex_distance = travelled + seg;
        if vertex_distance > start && vertex_distance < end {
            out.push(window[1]);
        }
        travelled = vertex_distance;
        if travelled >= end {
            break;
        }
    }
    let tail = point_at_distance(points, end);
    if dist(*out.last().unwrap(), tail) > 1e-9 {
        out.push(tail);
    }
    out
}

const TARGET_SEGMENT_LENGTH: f64 = 5.0;
const MAX_ANGLE_CHANGE_DEG: f64 = 30.0;

fn has_sharp_curves(points: &[(f64, f64)]) -> bool {
    for i in 1..points.len().saturating_sub(1) {
        let v1 = (points[i].0 - points[i - 1].0, points[i].1 - points[i - 1].1);
        let v2 = (points[i + 1].0 - points[i].0, points[i + 1].1 - points[i].1);
        let (l1, l2) = ((v1.0 * v1.0 + v1.1 * v1.1).sqrt(), (v2.0 * v2.0 + v2.1 * v2.1).sqrt());
        if l1 > 0.0 && l2 > 0.0 {
            let cos = ((v1.0 * v2.0 + v1.1 * v2.1) / (l1 * l2)).clamp(-1.0, 1.0);
            if cos.acos().to_degrees() > MAX_ANGLE_CHANGE_DEG {
                return true;
            }
        }
    }
    false
}

/// Resamples road polylines at ~5 m steps. Roads with any interior angle
/// above 30 degrees keep their original geometry.
pub fn smart_interpolation(entries: Vec<LineSurfaceEntry>) -> Vec<LineSurfaceEntry> {
    entries
        .into_iter()
        .map(|entry| {
            if entry.points.len() < 2 || has_sharp_curves(&entry.points) {
                return entry;
            }
            let needs_resample = entry
                .points
                .windows(2)
                .any(|w| dist(w[0], w[1]) > TARGET_SEGMENT_LENGTH * 1.5);
            if !needs_resample {
                return entry;
            }
            let length = polyline_length(&entry.points);
            let count = (length / TARGET_SEGMENT_LENGTH).ceil() as usize + 1;
            let mut resampled: Vec<(f64, f64)> = (0..count)
                .map(|i| point_at_distance(&entry.points, (i as f64) * TARGET_SEGMENT_LENGTH))
                .collect();
            let last = *entry.points.last().unwrap();
            if dist(*resampled.last().unwrap(), last) > 1e-9 {
                resampled.push(last);
            }
            LineSurfaceEntry { points: resampled, ..entry }
        })
        .collect()
}

/// Caps every surface at `30 * texture_tile_size` so the tiled V coordinate
/// stays within the engine's allowed range.
pub fn split_long_line_surfaces(
    entries: Vec<LineSurfaceEntry>,
    texture_tile_size: f64,
) -> Vec<LineSurfaceEntry> {
    let max_length = 30.0 * texture_tile_size;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let length = polyline_length(&entry.points);
        if length <= max_length {
            out.push(entry);
            continue;
        }
        let segments = (length / max_length).ceil() as usize;
        let segment_length = length / segments as f64;
        log::debug!(
            "splitting {:.1} m line surface into {} segments of {:.1} m",
            length,
            segments,
            segment_length
        );
        for i in 0..segments {
            let start = i as f64 * segment_length;
            let end = ((i + 1) as f64 * segment_length).min(length);
            let piece = polyline_substring(&entry.points, start, end);
            if piece.len() >= 2 {
                out.push(LineSurfaceEntry {
                    points: piece,
                    width: entry.width,
                    z_offset: entry.z_offset,
                });
            }
        }
    }
    out
}

/// Centroid of a polygon ring.
pub fn polygon_center(points: &[(f64, f64)]) -> (f64, f64) {
    let polygon = Polygon::new(LineString(closed_ring(points)), vec![]);
    match polygon.centroid() {
        Some(c) => (c.x(), c.y()),
        None => {
            let n = points.len().max(1) as f64;
            let sum = points.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            (sum.0 / n, sum.1 / n)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square(x: f64, y: f64, side: f64) -> Vec<(f64, f64)> {
        vec![(x, y), (x + side, y), (x + side, y + side), (x, y + side)]
    }

    fn opts(size: f64) -> FitOptions {
        FitOptions::new(size, size, 1.0, 0)
    }

    #[test]
    fn polygon_inside_bounds_is_unchanged() {
        let fitted = fit_polygon_into_bounds(&square(10.0, 10.0, 20.0), &opts(100.0)).unwrap();
        assert!(fitted.iter().all(|&(x, y)| (0.0..=100.0).contains(&x) && (0.0..=100.0).contains(&y)));
        let area = signed_area(&fitted).abs();
        assert_relative_eq!(area, 400.0, epsilon = 1e-6);
    }

    #[test]
    fn polygon_partially_outside_is_clipped() {
        let fitted = fit_polygon_into_bounds(&square(-10.0, -10.0, 20.0), &opts(100.0)).unwrap();
        let area = signed_area(&fitted).abs();
        assert_relative_eq!(area, 100.0, epsilon = 1e-6);
    }

    #[test]
    fn polygon_fully_outside_errors() {
        let result = fit_polygon_into_bounds(&square(-50.0, -50.0, 20.0), &opts(100.0));
        assert!(matches!(result, Err(FeatureError::OutOfBounds)));
    }

    #[test]
    fn rotation_by_360_roundtrips_within_tolerance() {
        let mut o = opts(100.0);
        o.angle = 360;
        let original = square(20.0, 20.0, 10.0);
        let fitted = fit_polygon_into_bounds(&original, &o).unwrap();
        // The clip may reorder the ring, so check vertex membership and
        // area instead of pointwise equality.
        assert_relative_eq!(signed_area(&fitted).abs(), 100.0, epsilon = 1e-6);
        for orig in &original {
            assert!(
                fitted.iter().any(|f| dist(*f, *orig) < 1e-6),
                "vertex {:?} missing after identity rotation",
                orig
            );
        }
    }

    #[test]
    fn mitre_margin_grows_the_polygon() {
        let grown = offset_polygon_mitre(&square(10.0, 10.0, 10.0), 2.0).unwrap();
        assert_relative_eq!(signed_area(&grown).abs(), 196.0, epsilon = 1e-6);

        let shrunk = offset_polygon_mitre(&square(10.0, 10.0, 10.0), -2.0).unwrap();
        assert_relative_eq!(signed_area(&shrunk).abs(), 36.0, epsilon = 1e-6);
    }

    #[test]
    fn over_shrinking_returns_none() {
        assert!(offset_polygon_mitre(&square(0.0, 0.0, 4.0), -3.0).is_none());
    }

    #[test]
    fn polyline_crossing_and_returning_splits() {
        let line = vec![(10.0, 10.0), (-20.0, 10.0), (-20.0, 20.0), (10.0, 20.0)];
        assert!(matches!(
            fit_polyline_into_bounds(&line, &opts(100.0)),
            Err(FeatureError::Split)
        ));
    }

    #[test]
    fn polyline_clipped_at_the_border() {
        let line = vec![(50.0, 50.0), (150.0, 50.0)];
        let fitted = fit_polyline_into_bounds(&line, &opts(100.0)).unwrap();
        assert_relative_eq!(fitted.last().unwrap().0, 100.0, epsilon = 1e-9);
    }

    #[test]
    fn interpolation_inserts_the_requested_points() {
        let line = vec![(0.0, 0.0), (10.0, 0.0)];
        let dense = interpolate_points(&line, 4);
        assert_eq!(dense.len(), 6);
        assert_relative_eq!(dense[1].0, 2.0, epsilon = 1e-9);
        assert_relative_eq!(dense[4].0, 8.0, epsilon = 1e-9);
    }

    #[test]
    fn smart_interpolation_skips_sharp_roads() {
        let sharp = LineSurfaceEntry {
            points: vec![(0.0, 0.0), (100.0, 0.0), (100.0, 100.0)],
            width: 4.0,
            z_offset: 0.0,
        };
        let out = smart_interpolation(vec![sharp]);
        assert_eq!(out[0].points.len(), 3);

        let straight = LineSurfaceEntry {
            points: vec![(0.0, 0.0), (100.0, 0.0)],
            width: 4.0,
            z_offset: 0.0,
        };
        let out = smart_interpolation(vec![straight]);
        assert!(out[0].points.len() > 15);
    }

    #[test]
    fn long_surfaces_are_split_under_the_uv_cap() {
        let long = LineSurfaceEntry {
            points: vec![(0.0, 0.0), (700.0, 0.0)],
            width: 4.0,
            z_offset: 0.0,
        };
        let out = split_long_line_surfaces(vec![long], 10.0);
        assert!(out.len() >= 2);
        for entry in &out {
            assert!(polyline_length(&entry.points) <= 300.0 + 1e-6);
        }
        let total: f64 = out.iter().map(|e| polyline_length(&e.points)).sum();
        assert_relative_eq!(total, 700.0, epsilon = 1e-6);
    }

    #[test]
    fn ribbon_buffer_is_closed_and_wide() {
        let ring = buffer_polyline(&[(0.0, 0.0), (10.0, 0.0)], 2.0);
        assert_eq!(ring.len(), 4);
        assert_relative_eq!(signed_area(&ring).abs(), 40.0, epsilon = 1e-6);
    }

    #[test]
    fn centroid_of_a_square() {
        let (cx, cy) = polygon_center(&square(0.0, 0.0, 10.0));
        assert_relative_eq!(cx, 5.0, epsilon = 1e-9);
        assert_relative_eq!(cy, 5.0, epsilon = 1e-9);
    }
}
