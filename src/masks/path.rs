//! Closed-path rasterizer.
//!
//! Control points are interpolated Catmull-Rom style: smooth nodes take
//! their tangent from the neighbouring corners, corner nodes use their
//! stored handles verbatim. Each segment becomes a cubic Bézier, sampled
//! at a density that follows the on-screen length, then the closed
//! polyline is filled by non-zero winding with a per-node feather applied
//! along the outward normal.

use lyon::geom::CubicBezierSegment;
use lyon::math::{point, Point};

use super::{Form, MaskBuffer, MaskGeometry, PathPoint, PointState};

fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Effective `(ctrl1, ctrl2)` handles of every node, normalised coords.
fn resolve_handles(points: &[PathPoint]) -> Vec<(Point, Point)> {
    let n = points.len();
    points
        .iter()
        .enumerate()
        .map(|(i, pt)| match pt.state {
            PointState::Corner => (
                point(pt.ctrl1[0], pt.ctrl1[1]),
                point(pt.ctrl2[0], pt.ctrl2[1]),
            ),
            PointState::Smooth => {
                let prev = &points[(i + n - 1) % n].corner;
                let next = &points[(i + 1) % n].corner;
                let tx = (next[0] - prev[0]) / 6.0;
                let ty = (next[1] - prev[1]) / 6.0;
                (
                    point(pt.corner[0] - tx, pt.corner[1] - ty),
                    point(pt.corner[0] + tx, pt.corner[1] + ty),
                )
            }
        })
        .collect()
}

/// Flattened closed polyline in stage pixels with the feather width
/// interpolated per vertex.
struct Polyline {
    pts: Vec<Point>,
    border: Vec<f32>,
}

fn flatten(points: &[PathPoint], geo: &MaskGeometry, offset: (f32, f32)) -> Option<Polyline> {
    let n = points.len();
    if n < 3 {
        return None;
    }
    let handles = resolve_handles(points);
    let to_px = |p: [f32; 2]| -> Point {
        let (x, y) = geo.to_pixels(p);
        point(x + offset.0, y + offset.1)
    };

    let mut pts = Vec::new();
    let mut border = Vec::new();
    for i in 0..n {
        let j = (i + 1) % n;
        let from = to_px(points[i].corner);
        let to = to_px(points[j].corner);
        let ctrl1 = to_px([handles[i].1.x, handles[i].1.y]);
        let ctrl2 = to_px([handles[j].0.x, handles[j].0.y]);
        let bezier = CubicBezierSegment {
            from,
            ctrl1,
            ctrl2,
            to,
        };

        // sampling density follows the on-screen segment length
        let chord = (to - from).length() + (ctrl1 - from).length() + (to - ctrl2).length();
        let steps = (chord / 2.0).clamp(8.0, 200.0) as usize;
        for s in 0..steps {
            let t = s as f32 / steps as f32;
            pts.push(bezier.sample(t));
            let b = points[i].border + (points[j].border - points[i].border) * t;
            border.push(b * geo.unit());
        }
    }
    Some(Polyline { pts, border })
}

fn centroid(pts: &[Point]) -> Point {
    let mut cx = 0.0;
    let mut cy = 0.0;
    for p in pts {
        cx += p.x;
        cy += p.y;
    }
    point(cx / pts.len() as f32, cy / pts.len() as f32)
}

/// Offset of a clone rendering: shift the whole geometry so the first
/// corner lands on the form's source point.
fn source_offset(form: &Form, points: &[PathPoint], geo: &MaskGeometry) -> (f32, f32) {
    let (sx, sy) = geo.to_pixels(form.source);
    let (fx, fy) = geo.to_pixels(points[0].corner);
    (sx - fx, sy - fy)
}

/// Outline and feather polylines for overlay drawing, interleaved x/y.
pub fn points_border(
    points: &[PathPoint],
    form: &Form,
    geo: &MaskGeometry,
    source: bool,
) -> Option<(Vec<f32>, Option<Vec<f32>>)> {
    if points.len() < 3 {
        return None;
    }
    let offset = if source && form.is_clone {
        source_offset(form, points, geo)
    } else {
        (0.0, 0.0)
    };
    let line = flatten(points, geo, offset)?;
    let center = centroid(&line.pts);
    let n = line.pts.len();

    let mut flat = Vec::with_capacity(n * 2);
    let mut feather = Vec::with_capacity(n * 2);
    for k in 0..n {
        let p = line.pts[k];
        flat.push(p.x);
        flat.push(p.y);

        // outward normal from the neighbouring vertices
        let prev = line.pts[(k + n - 1) % n];
        let next = line.pts[(k + 1) % n];
        let tangent = next - prev;
        let len = tangent.length().max(f32::MIN_POSITIVE);
        let mut nx = -tangent.y / len;
        let mut ny = tangent.x / len;
        if nx * (p.x - center.x) + ny * (p.y - center.y) < 0.0 {
            nx = -nx;
            ny = -ny;
        }
        feather.push(p.x + nx * line.border[k]);
        feather.push(p.y + ny * line.border[k]);
    }
    Some((flat, Some(feather)))
}

/// Bounding box `(width, height, x, y)` including the feather band.
pub fn area(points: &[PathPoint], geo: &MaskGeometry) -> Option<(i32, i32, i32, i32)> {
    let line = flatten(points, geo, (0.0, 0.0))?;
    let max_border = line.border.iter().cloned().fold(0.0f32, f32::max);
    let mut min_x = f32::MAX;
    let mut min_y = f32::MAX;
    let mut max_x = f32::MIN;
    let mut max_y = f32::MIN;
    for p in &line.pts {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    let x = (min_x - max_border).floor() as i32 - 1;
    let y = (min_y - max_border).floor() as i32 - 1;
    let w = (max_x + max_border).ceil() as i32 + 2 - x;
    let h = (max_y + max_border).ceil() as i32 + 2 - y;
    Some((w, h, x, y))
}

/// Non-zero winding test row by row: crossing positions with direction,
/// sorted, then accumulated along x.
fn fill_winding(line: &Polyline, width: i32, height: i32, x: i32, y: i32, buffer: &mut [f32]) {
    let n = line.pts.len();
    let mut crossings: Vec<(f32, i32)> = Vec::new();
    for j in 0..height {
        let yc = (y + j) as f32 + 0.5;
        crossings.clear();
        for k in 0..n {
            let a = line.pts[k];
            let b = line.pts[(k + 1) % n];
            if a.y <= yc && b.y > yc {
                let t = (yc - a.y) / (b.y - a.y);
                crossings.push((a.x + t * (b.x - a.x), 1));
            } else if b.y <= yc && a.y > yc {
                let t = (yc - b.y) / (a.y - b.y);
                crossings.push((b.x + t * (a.x - b.x), -1));
            }
        }
        crossings.sort_by(|l, r| l.0.total_cmp(&r.0));

        let mut winding = 0;
        let mut c = 0;
        for i in 0..width {
            let xc = (x + i) as f32 + 0.5;
            while c < crossings.len() && crossings[c].0 <= xc {
                winding += crossings[c].1;
                c += 1;
            }
            if winding != 0 {
                buffer[(j * width + i) as usize] = 1.0;
            }
        }
    }
}

/// Distance from a point to the polyline together with the feather width
/// at the closest spot.
fn distance_to_outline(line: &Polyline, px: f32, py: f32) -> (f32, f32) {
    let n = line.pts.len();
    let mut best_d2 = f32::MAX;
    let mut best_border = 0.0;
    for k in 0..n {
        let a = line.pts[k];
        let b = line.pts[(k + 1) % n];
        let abx = b.x - a.x;
        let aby = b.y - a.y;
        let len2 = (abx * abx + aby * aby).max(f32::MIN_POSITIVE);
        let t = (((px - a.x) * abx + (py - a.y) * aby) / len2).clamp(0.0, 1.0);
        let dx = px - (a.x + t * abx);
        let dy = py - (a.y + t * aby);
        let d2 = dx * dx + dy * dy;
        if d2 < best_d2 {
            best_d2 = d2;
            let bb = line.border[(k + 1) % n];
            best_border = line.border[k] + (bb - line.border[k]) * t;
        }
    }
    (best_d2.sqrt(), best_border)
}

pub fn mask(points: &[PathPoint], geo: &MaskGeometry) -> Option<MaskBuffer> {
    let line = flatten(points, geo, (0.0, 0.0))?;
    let (width, height, x, y) = area(points, geo)?;
    if width <= 0 || height <= 0 {
        return None;
    }

    let mut buffer = vec![0.0f32; (width * height) as usize];
    fill_winding(&line, width, height, x, y, &mut buffer);

    // feather outward from the outline
    for j in 0..height {
        for i in 0..width {
            let idx = (j * width + i) as usize;
            if buffer[idx] != 0.0 {
                continue;
            }
            let px = (x + i) as f32 + 0.5;
            let py = (y + j) as f32 + 0.5;
            let (d, border) = distance_to_outline(&line, px, py);
            if border > 0.0 && d < border {
                buffer[idx] = 1.0 - smoothstep(d / border);
            }
        }
    }

    Some(MaskBuffer {
        buffer,
        width,
        height,
        x,
        y,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smooth(x: f32, y: f32, border: f32) -> PathPoint {
        PathPoint {
            corner: [x, y],
            ctrl1: [x, y],
            ctrl2: [x, y],
            border,
            state: PointState::Smooth,
        }
    }

    fn square_path(border: f32) -> Vec<PathPoint> {
        vec![
            PathPoint {
                corner: [0.25, 0.25],
                ctrl1: [0.25, 0.25],
                ctrl2: [0.25, 0.25],
                border,
                state: PointState::Corner,
            },
            PathPoint {
                corner: [0.75, 0.25],
                ctrl1: [0.75, 0.25],
                ctrl2: [0.75, 0.25],
                border,
                state: PointState::Corner,
            },
            PathPoint {
                corner: [0.75, 0.75],
                ctrl1: [0.75, 0.75],
                ctrl2: [0.75, 0.75],
                border,
                state: PointState::Corner,
            },
            PathPoint {
                corner: [0.25, 0.75],
                ctrl1: [0.25, 0.75],
                ctrl2: [0.25, 0.75],
                border,
                state: PointState::Corner,
            },
        ]
    }

    #[test]
    fn square_interior_is_opaque() {
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);
        let mask = mask(&square_path(0.0), &geo).unwrap();
        assert_eq!(mask.sample(50, 50), 1.0);
        assert_eq!(mask.sample(10, 10), 0.0);
    }

    #[test]
    fn feather_decays_outside_the_outline() {
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);
        let mask = mask(&square_path(0.1), &geo).unwrap();
        // border unit = 100px, so the feather band is 10px wide
        let near = mask.sample(50, 78);
        let far = mask.sample(50, 83);
        assert!(near > far, "feather must decay outward: {near} vs {far}");
        assert!(mask.sample(50, 95) < 1e-3);
    }

    #[test]
    fn smooth_nodes_round_the_outline() {
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);
        let pts = vec![
            smooth(0.5, 0.25, 0.0),
            smooth(0.75, 0.5, 0.0),
            smooth(0.5, 0.75, 0.0),
            smooth(0.25, 0.5, 0.0),
        ];
        let mask = mask(&pts, &geo).unwrap();
        assert_eq!(mask.sample(50, 50), 1.0);
        // corners of the bounding square stay outside the rounded diamond
        assert_eq!(mask.sample(28, 28), 0.0);
    }

    #[test]
    fn degenerate_paths_produce_no_mask() {
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);
        assert!(mask(&square_path(0.0)[..2].to_vec(), &geo).is_none());
    }

    #[test]
    fn all_samples_stay_in_unit_range() {
        let geo = MaskGeometry::new(64, 64, 1.0, 1.0);
        let mask = mask(&square_path(0.05), &geo).unwrap();
        for v in &mask.buffer {
            assert!((0.0..=1.0).contains(v));
        }
    }
}
