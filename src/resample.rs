//! Base-buffer import helpers.
//!
//! The recursive processor's base case pulls the caller-supplied input
//! buffer into a cache slab: row copies for 1:1 windows, an area-average
//! resampler for everything else.

use crate::roi::Roi;

/// Copy a 1:1 window of `input` into `output`, clamping against the input
/// geometry so an out-of-range ROI never reads past the buffer.
pub fn copy_rows(
    output: &mut [f32],
    input: &[f32],
    roi_out: &Roi,
    iwidth: i32,
    iheight: i32,
) {
    let in_x = roi_out.x.max(0);
    let in_y = roi_out.y.max(0);
    let cp_width = roi_out.width.min(iwidth - in_x).max(0) as usize;
    let cp_height = roi_out.height.min(iheight - in_y).max(0) as usize;
    let out_stride = roi_out.width as usize * 4;

    for j in 0..cp_height {
        let src = (in_x as usize + (in_y as usize + j) * iwidth as usize) * 4;
        let dst = j * out_stride;
        output[dst..dst + cp_width * 4].copy_from_slice(&input[src..src + cp_width * 4]);
    }
}

/// Clip-and-zoom: fill `roi_out` (at `roi_out.scale` relative to the full
/// input) by averaging the input pixels each output pixel covers.
pub fn clip_and_zoom(
    output: &mut [f32],
    input: &[f32],
    roi_out: &Roi,
    iwidth: i32,
    iheight: i32,
) {
    let scale = roi_out.scale.max(f32::MIN_POSITIVE);
    let px = 1.0 / scale;

    for j in 0..roi_out.height {
        for i in 0..roi_out.width {
            // footprint of this output pixel in input coordinates
            let fx = (roi_out.x + i) as f32 * px;
            let fy = (roi_out.y + j) as f32 * px;
            let x0 = (fx.floor() as i32).clamp(0, iwidth - 1);
            let y0 = (fy.floor() as i32).clamp(0, iheight - 1);
            let x1 = ((fx + px).ceil() as i32).clamp(x0 + 1, iwidth);
            let y1 = ((fy + px).ceil() as i32).clamp(y0 + 1, iheight);

            let mut acc = [0.0f32; 4];
            let mut n = 0.0f32;
            for y in y0..y1 {
                for x in x0..x1 {
                    let src = ((y * iwidth + x) * 4) as usize;
                    for k in 0..4 {
                        acc[k] += input[src + k];
                    }
                    n += 1.0;
                }
            }
            let dst = ((j * roi_out.width + i) * 4) as usize;
            for k in 0..4 {
                output[dst + k] = acc[k] / n;
            }
        }
    }
}
