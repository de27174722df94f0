//! Circle rasterizer.
//!
//! A circle is a signed distance field from its centre: alpha 1 inside the
//! radius, 0 outside `radius + border`, with a smoothstep falloff over the
//! border band.

use super::{Circle, MaskBuffer, MaskGeometry};

/// Hermite falloff on `[0,1]`.
fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Perimeter polyline at a given normalised radius, centre point first,
/// interleaved x/y in stage pixels. Segment count follows the on-screen
/// circumference so zoomed-in outlines stay smooth.
pub fn outline(center: [f32; 2], radius: f32, geo: &MaskGeometry) -> Vec<f32> {
    let (cx, cy) = geo.to_pixels(center);
    let r = radius * geo.unit();
    let segments = ((r * std::f32::consts::TAU) / 3.0).clamp(16.0, 512.0) as usize;

    let mut points = Vec::with_capacity((segments + 1) * 2);
    points.push(cx);
    points.push(cy);
    for i in 0..segments {
        let a = i as f32 / segments as f32 * std::f32::consts::TAU;
        points.push(cx + r * a.cos());
        points.push(cy + r * a.sin());
    }
    points
}

/// Bounding box `(width, height, x, y)` including the border band.
pub fn area(circle: &Circle, geo: &MaskGeometry) -> (i32, i32, i32, i32) {
    let (cx, cy) = geo.to_pixels(circle.center);
    let extent = (circle.radius + circle.border) * geo.unit();
    let x = (cx - extent).floor() as i32 - 1;
    let y = (cy - extent).floor() as i32 - 1;
    let w = (extent * 2.0).ceil() as i32 + 2;
    let h = w;
    (w, h, x, y)
}

pub fn mask(circle: &Circle, geo: &MaskGeometry) -> MaskBuffer {
    let (width, height, x, y) = area(circle, geo);
    let (cx, cy) = geo.to_pixels(circle.center);
    let r = circle.radius * geo.unit();
    let border = (circle.border * geo.unit()).max(f32::MIN_POSITIVE);

    let mut buffer = vec![0.0f32; (width.max(0) * height.max(0)) as usize];
    for j in 0..height {
        for i in 0..width {
            let px = (x + i) as f32 + 0.5;
            let py = (y + j) as f32 + 0.5;
            let d = ((px - cx).powi(2) + (py - cy).powi(2)).sqrt();
            let alpha = if d <= r {
                1.0
            } else {
                1.0 - smoothstep((d - r) / border)
            };
            buffer[(j * width + i) as usize] = alpha;
        }
    }

    MaskBuffer {
        buffer,
        width,
        height,
        x,
        y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_circle() -> Circle {
        Circle {
            center: [0.5, 0.5],
            radius: 0.1,
            border: 0.02,
        }
    }

    #[test]
    fn alpha_is_one_at_centre_and_zero_far_out() {
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);
        let mask = mask(&test_circle(), &geo);
        assert!((mask.sample(50, 50) - 1.0).abs() < 1e-6);
        assert_eq!(mask.sample(80, 80), 0.0);
    }

    #[test]
    fn falloff_is_monotone_across_the_border() {
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);
        let mask = mask(&test_circle(), &geo);
        // radius 10px, border 2px: walk outward along +x from the centre
        let inside = mask.sample(59, 50);
        let mid = mask.sample(61, 50);
        let outside = mask.sample(63, 50);
        assert!(inside >= mid && mid >= outside);
        assert!(inside > 0.9);
        assert!(outside < 0.1);
    }

    #[test]
    fn outline_starts_at_the_centre() {
        let geo = MaskGeometry::new(100, 100, 1.0, 1.0);
        let points = outline([0.5, 0.5], 0.1, &geo);
        assert_eq!(&points[..2], &[50.0, 50.0]);
        // first perimeter point sits on the radius
        let dx = points[2] - 50.0;
        let dy = points[3] - 50.0;
        assert!((dx.hypot(dy) - 10.0).abs() < 1e-3);
    }

    #[test]
    fn all_samples_stay_in_unit_range() {
        let geo = MaskGeometry::new(64, 48, 1.0, 0.5);
        let mask = mask(&test_circle(), &geo);
        for v in &mask.buffer {
            assert!((0.0..=1.0).contains(v));
        }
    }
}
