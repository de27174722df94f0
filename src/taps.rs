//! In-line observation taps: histograms and color pickers.
//!
//! Taps are read-only; they sample the buffers flowing through the
//! pipeline at documented positions and store their results on the
//! engine. Sampling strides follow the module's color space: raw data is
//! sampled 1/9 (stride 3, unlocked from the Bayer pattern), RGB and Lab
//! 1/16 (stride 4).

use ahash::HashMap;

use crate::module::ColorSpace;
use crate::roi::Roi;

pub const HISTOGRAM_BINS: usize = 64;

/// 64-bin × 4-channel histogram with per-channel maxima.
#[derive(Debug, Clone)]
pub struct Histogram {
    pub bins: [f32; HISTOGRAM_BINS * 4],
    pub max: [f32; 4],
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            bins: [0.0; HISTOGRAM_BINS * 4],
            max: [0.0; 4],
        }
    }
}

/// Mean, minimum and maximum of a picked region.
#[derive(Debug, Clone, Copy)]
pub struct PickedColor {
    pub mean: [f32; 3],
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Default for PickedColor {
    fn default() -> Self {
        Self {
            mean: [0.0; 3],
            min: [f32::MAX; 3],
            max: [f32::MIN; 3],
        }
    }
}

/// A persistent sample point evaluated at the terminal stage of every
/// preview run.
#[derive(Debug, Clone, Default)]
pub struct LiveSample {
    pub point: [f32; 2],
    pub area: Option<[f32; 4]>,
    pub locked: bool,
    pub rgb: PickedColor,
    pub lab: PickedColor,
}

/// Everything the taps produced during the most recent runs.
#[derive(Default)]
pub struct TapRecords {
    /// Focused module's input, at its stage.
    pub picked_color: PickedColor,
    /// Focused module's output, at its stage.
    pub picked_output_color: PickedColor,
    /// Primary picker at the terminal stage.
    pub primary_rgb: PickedColor,
    pub primary_lab: PickedColor,
    /// Per-module histograms, keyed by module index.
    pub module_histograms: HashMap<usize, Histogram>,
    /// Histogram of the displayed output.
    pub display_histogram: Histogram,
    pub live_samples: Vec<LiveSample>,
}

fn bin(value: f32) -> usize {
    (value * HISTOGRAM_BINS as f32).clamp(0.0, HISTOGRAM_BINS as f32 - 1.0) as usize
}

/// Per-module histogram at the module's declared color space.
pub fn histogram_collect(cs: ColorSpace, pixel: &[f32], roi: &Roi) -> Histogram {
    let mut h = Histogram::default();
    let width = roi.width as usize;

    match cs {
        ColorSpace::Raw => {
            for j in (0..roi.height as usize).step_by(3) {
                for i in (0..width).step_by(3) {
                    let v = bin(pixel[4 * (j * width + i)]);
                    h.bins[4 * v] += 1.0;
                }
            }
            for k in (0..HISTOGRAM_BINS * 4).step_by(4) {
                h.max[0] = h.max[0].max(h.bins[k]);
            }
        }
        ColorSpace::Rgb => {
            for j in (0..roi.height as usize).step_by(4) {
                for i in (0..width).step_by(4) {
                    let p = 4 * (j * width + i);
                    let r = pixel[p];
                    let g = pixel[p + 1];
                    let b = pixel[p + 2];
                    let lum = r.max(g).max(b);
                    h.bins[4 * bin(r)] += 1.0;
                    h.bins[4 * bin(g) + 1] += 1.0;
                    h.bins[4 * bin(b) + 2] += 1.0;
                    h.bins[4 * bin(lum) + 3] += 1.0;
                }
            }
            // skip the lowest bin so black borders don't dominate
            for c in 0..4 {
                for k in ((4 + c)..HISTOGRAM_BINS * 4).step_by(4) {
                    h.max[c] = h.max[c].max(h.bins[k]);
                }
            }
        }
        ColorSpace::Lab => {
            for j in (0..roi.height as usize).step_by(4) {
                for i in (0..width).step_by(4) {
                    let p = 4 * (j * width + i);
                    let l = bin(pixel[p] / 100.0);
                    let a = bin((pixel[p + 1] + 128.0) / 256.0);
                    let b = bin((pixel[p + 2] + 128.0) / 256.0);
                    h.bins[4 * l] += 1.0;
                    h.bins[4 * a + 1] += 1.0;
                    h.bins[4 * b + 2] += 1.0;
                }
            }
            for k in (4..HISTOGRAM_BINS * 4).step_by(4) {
                h.max[0] = h.max[0].max(h.bins[k]);
            }
            // a/b channels clip their extreme bins
            for c in 1..3 {
                for k in ((4 + c)..(HISTOGRAM_BINS - 1) * 4).step_by(4) {
                    h.max[c] = h.max[c].max(h.bins[k]);
                }
            }
        }
    }
    h
}

/// Sample a point or box of a buffer. Coordinates are normalised to the
/// region; a box takes the mean/min/max over every covered pixel.
pub fn picker(pixel: &[f32], roi: &Roi, point: [f32; 2], area: Option<[f32; 4]>) -> PickedColor {
    let mut picked = PickedColor::default();
    if point[0] < 0.0 || point[1] < 0.0 {
        return PickedColor {
            mean: [0.0; 3],
            min: [0.0; 3],
            max: [0.0; 3],
        };
    }
    let clamp_x = |v: f32| ((v * roi.width as f32) as i32).clamp(0, roi.width - 1);
    let clamp_y = |v: f32| ((v * roi.height as f32) as i32).clamp(0, roi.height - 1);

    match area {
        Some(b) => {
            let x0 = clamp_x(b[0]);
            let y0 = clamp_y(b[1]);
            let x1 = clamp_x(b[2]);
            let y1 = clamp_y(b[3]);
            let w = 1.0 / (((x1 - x0 + 1) * (y1 - y0 + 1)) as f32);
            let mut mean = [0.0f32; 3];
            for j in y0..=y1 {
                for i in x0..=x1 {
                    let p = (4 * (j * roi.width + i)) as usize;
                    for k in 0..3 {
                        let v = pixel[p + k];
                        mean[k] += w * v;
                        picked.min[k] = picked.min[k].min(v);
                        picked.max[k] = picked.max[k].max(v);
                    }
                }
            }
            picked.mean = mean;
        }
        None => {
            let x = clamp_x(point[0]);
            let y = clamp_y(point[1]);
            let p = (4 * (y * roi.width + x)) as usize;
            for k in 0..3 {
                picked.mean[k] = pixel[p + k];
                picked.min[k] = pixel[p + k];
                picked.max[k] = pixel[p + k];
            }
        }
    }
    picked
}

/// Histogram of the displayed output, optionally restricted to a
/// normalised box. Luminance channel takes the per-pixel maximum.
pub fn display_histogram(pixel: &[f32], roi: &Roi, restrict: Option<[f32; 4]>) -> Histogram {
    let mut h = Histogram::default();
    let (x0, y0, x1, y1) = match restrict {
        Some(b) => (
            ((b[0] * roi.width as f32) as i32).clamp(0, roi.width - 1),
            ((b[1] * roi.height as f32) as i32).clamp(0, roi.height - 1),
            ((b[2] * roi.width as f32) as i32).clamp(0, roi.width - 1),
            ((b[3] * roi.height as f32) as i32).clamp(0, roi.height - 1),
        ),
        None => (0, 0, roi.width - 1, roi.height - 1),
    };

    let mut j = y0;
    while j <= y1 {
        let mut i = x0;
        while i <= x1 {
            let p = (4 * (j * roi.width + i)) as usize;
            let rgb = [pixel[p], pixel[p + 1], pixel[p + 2]];
            for (k, v) in rgb.iter().enumerate() {
                h.bins[4 * bin(*v) + k] += 1.0;
            }
            let lum = rgb[0].max(rgb[1]).max(rgb[2]);
            h.bins[4 * bin(lum) + 3] += 1.0;
            i += 4;
        }
        j += 4;
    }
    // skip the black bin when scaling
    for k in (19..HISTOGRAM_BINS * 4).step_by(4) {
        h.max[3] = h.max[3].max(h.bins[k]);
    }
    h
}

fn srgb_to_linear(value: f32) -> f32 {
    if value <= 0.04045 {
        value / 12.92
    } else {
        ((value + 0.055) / 1.055).powf(2.4)
    }
}

/// Display RGB to Lab through the sRGB D65 reference primaries.
pub fn srgb_to_lab(rgb: [f32; 3]) -> [f32; 3] {
    let r = srgb_to_linear(rgb[0]);
    let g = srgb_to_linear(rgb[1]);
    let b = srgb_to_linear(rgb[2]);

    let x = 0.4124564 * r + 0.3575761 * g + 0.1804375 * b;
    let y = 0.2126729 * r + 0.7151522 * g + 0.0721750 * b;
    let z = 0.0193339 * r + 0.1191920 * g + 0.9503041 * b;

    // D65 white
    let f = |t: f32| {
        if t > 0.008856 {
            t.cbrt()
        } else {
            7.787 * t + 16.0 / 116.0
        }
    };
    let fx = f(x / 0.95047);
    let fy = f(y);
    let fz = f(z / 1.08883);

    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

/// Convert a picked RGB region to Lab componentwise.
pub fn picked_to_lab(rgb: &PickedColor) -> PickedColor {
    PickedColor {
        mean: srgb_to_lab(rgb.mean),
        min: srgb_to_lab(rgb.min),
        max: srgb_to_lab(rgb.max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(width: i32, height: i32, value: f32) -> Vec<f32> {
        vec![value; (width * height * 4) as usize]
    }

    #[test]
    fn rgb_histogram_lands_in_one_bin() {
        let roi = Roi::full(16, 16);
        let pixel = flat(16, 16, 0.5);
        let h = histogram_collect(ColorSpace::Rgb, &pixel, &roi);
        let expected = (16f32 / 4.0).powi(2);
        assert_eq!(h.bins[4 * 32], expected);
        assert_eq!(h.max[0], expected);
    }

    #[test]
    fn raw_histogram_samples_one_of_nine() {
        let roi = Roi::full(9, 9);
        let pixel = flat(9, 9, 0.0);
        let h = histogram_collect(ColorSpace::Raw, &pixel, &roi);
        assert_eq!(h.bins[0], 9.0);
    }

    #[test]
    fn point_picker_reads_one_pixel() {
        let roi = Roi::full(4, 4);
        let mut pixel = flat(4, 4, 0.25);
        let p = (4 * (2 * 4 + 2)) as usize;
        pixel[p] = 0.9;
        let picked = picker(&pixel, &roi, [0.5, 0.5], None);
        assert_eq!(picked.mean[0], 0.9);
        assert_eq!(picked.min[0], 0.9);
        assert_eq!(picked.max[0], 0.9);
    }

    #[test]
    fn box_picker_averages_and_tracks_extremes() {
        let roi = Roi::full(4, 1);
        let mut pixel = flat(4, 1, 0.0);
        pixel[0] = 1.0; // pixel (0,0) red
        let picked = picker(&pixel, &roi, [0.0, 0.0], Some([0.0, 0.0, 1.0, 1.0]));
        assert!((picked.mean[0] - 0.25).abs() < 1e-6);
        assert_eq!(picked.min[0], 0.0);
        assert_eq!(picked.max[0], 1.0);
    }

    #[test]
    fn negative_point_disables_picking() {
        let roi = Roi::full(4, 4);
        let pixel = flat(4, 4, 0.5);
        let picked = picker(&pixel, &roi, [-1.0, 0.5], None);
        assert_eq!(picked.mean, [0.0; 3]);
    }

    #[test]
    fn lab_of_white_is_l100() {
        let lab = srgb_to_lab([1.0, 1.0, 1.0]);
        assert!((lab[0] - 100.0).abs() < 0.1);
        assert!(lab[1].abs() < 0.5);
        assert!(lab[2].abs() < 0.5);
    }

    #[test]
    fn display_histogram_respects_the_restriction_box() {
        let roi = Roi::full(16, 16);
        let mut pixel = flat(16, 16, 0.0);
        // bright pixel outside the restricted quadrant
        let p = (4 * (12 * 16 + 12)) as usize;
        pixel[p] = 1.0;
        let h = display_histogram(&pixel, &roi, Some([0.0, 0.0, 0.4, 0.4]));
        assert_eq!(h.bins[4 * (HISTOGRAM_BINS - 1)], 0.0);
    }
}
