//! The operator contract consumed by the pipeline.
//!
//! The pipeline never knows what a module computes; it only drives the
//! calls below. Optional capabilities (tiled and accelerated paths) are
//! advertised through `has_*` queries whose answers are cached on the
//! pipeline node at commit time.

use std::sync::Arc;

use bitflags::bitflags;

use crate::accel::{AccelDevice, DevBuffer};
use crate::error::{AccelError, ProcessError};
use crate::pipe::Piece;
use crate::roi::Roi;

/// Operation name of the terminal display-encoding module. The processor
/// pins its output in the cache and runs display taps after it.
pub const OP_GAMMA: &str = "gamma";

/// Operation name of the output color mapping module; the terminal tap
/// associates primary color picking with it.
pub const OP_COLOROUT: &str = "colorout";

bitflags! {
    /// Capability bits of a module.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u32 {
        const SUPPORTS_BLENDING = 1 << 0;
        const NO_MASKS = 1 << 1;
        const ALLOW_TILING = 1 << 2;
        /// Never run the accelerated path on the preview pipe.
        const PREVIEW_NON_ACCEL = 1 << 3;
    }
}

bitflags! {
    /// Free-form operation tags; a focused module's tag filter suppresses
    /// matching modules for snapshot-style rendering.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpTags: u32 {
        const DISTORT = 1 << 0;
        const DECORATION = 1 << 1;
    }
}

/// Color space a module declares for histogram collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Raw,
    Rgb,
    Lab,
}

/// Tiling requirements reported by a module (and by the blending step);
/// the processor combines them elementwise before deciding how to run.
#[derive(Debug, Clone, Copy)]
pub struct TilingRequest {
    /// Memory use as a multiple of one full input buffer.
    pub factor: f32,
    /// Largest single allocation as a multiple of one buffer.
    pub maxbuf: f32,
    /// Fixed extra bytes independent of image size.
    pub overhead: usize,
}

impl Default for TilingRequest {
    fn default() -> Self {
        Self {
            factor: 2.0,
            maxbuf: 1.0,
            overhead: 0,
        }
    }
}

impl TilingRequest {
    pub fn max(self, other: TilingRequest) -> TilingRequest {
        TilingRequest {
            factor: self.factor.max(other.factor),
            maxbuf: self.maxbuf.max(other.maxbuf),
            overhead: self.overhead.max(other.overhead),
        }
    }
}

/// Opaque committed parameter blob. The pipeline folds it into cache keys
/// and hands it back to the module at commit time; only the module knows
/// the layout.
pub type OpParams = Arc<[u8]>;

pub fn empty_params() -> OpParams {
    Arc::from(&[][..])
}

/// A reusable image operator.
///
/// `Piece` is the per-pipe instantiation carrying the committed state; the
/// same module value serves every pipe.
pub trait ImageOp: Send + Sync {
    /// Short stable operation name ("exposure", "gamma", ...).
    fn op(&self) -> &'static str;

    /// Display name.
    fn name(&self) -> &str {
        self.op()
    }

    fn flags(&self) -> OpFlags {
        OpFlags::empty()
    }

    fn operation_tags(&self) -> OpTags {
        OpTags::empty()
    }

    fn operation_tags_filter(&self) -> OpTags {
        OpTags::empty()
    }

    fn default_enabled(&self) -> bool {
        false
    }

    fn default_params(&self) -> OpParams {
        empty_params()
    }

    fn colorspace(&self) -> ColorSpace {
        ColorSpace::Rgb
    }

    /// Bytes per output pixel, for tiling and device-fit decisions.
    fn output_bpp(&self, _piece: &Piece) -> usize {
        4 * std::mem::size_of::<f32>()
    }

    /// Input region needed to produce `roi_out`.
    fn modify_roi_in(&self, _piece: &Piece, roi_out: &Roi) -> Roi {
        *roi_out
    }

    /// Output region produced from `roi_in`.
    fn modify_roi_out(&self, _piece: &Piece, roi_in: &Roi) -> Roi {
        *roi_in
    }

    fn tiling_callback(&self, _piece: &Piece, _roi_in: &Roi, _roi_out: &Roi) -> TilingRequest {
        TilingRequest::default()
    }

    /// Interpret a parameter blob into per-piece state (`piece.data`).
    /// Called under the pipe's busy lock whenever history is synched.
    fn commit_params(&self, _params: &OpParams, _piece: &mut Piece) {}

    /// Drop per-piece state when the node list is torn down.
    fn cleanup_pipe(&self, _piece: &mut Piece) {}

    fn process(
        &self,
        piece: &Piece,
        input: &[f32],
        output: &mut [f32],
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<(), ProcessError>;

    /// True when [`process_tiling`](Self::process_tiling) is a real
    /// implementation rather than the passthrough default.
    fn has_process_tiling(&self) -> bool {
        false
    }

    fn process_tiling(
        &self,
        piece: &Piece,
        input: &[f32],
        output: &mut [f32],
        roi_in: &Roi,
        roi_out: &Roi,
        _in_bpp: usize,
    ) -> Result<(), ProcessError> {
        self.process(piece, input, output, roi_in, roi_out)
    }

    /// True when the module ships an accelerated kernel.
    fn has_process_accel(&self) -> bool {
        false
    }

    fn process_accel(
        &self,
        _piece: &Piece,
        _device: &dyn AccelDevice,
        _input: &DevBuffer,
        _output: &DevBuffer,
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), AccelError> {
        Err(AccelError::Kernel(self.op()))
    }

    /// Accelerated tiled path: operates on host buffers, the module slices
    /// and uploads tiles itself.
    fn process_tiling_accel(
        &self,
        _piece: &Piece,
        _device: &dyn AccelDevice,
        _input: &[f32],
        _output: &mut [f32],
        _roi_in: &Roi,
        _roi_out: &Roi,
        _in_bpp: usize,
    ) -> Result<(), AccelError> {
        Err(AccelError::Kernel(self.op()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiling_requests_combine_elementwise() {
        let a = TilingRequest {
            factor: 2.5,
            maxbuf: 1.0,
            overhead: 100,
        };
        let b = TilingRequest {
            factor: 2.0,
            maxbuf: 3.0,
            overhead: 4,
        };
        let c = a.max(b);
        assert_eq!(c.factor, 2.5);
        assert_eq!(c.maxbuf, 3.0);
        assert_eq!(c.overhead, 100);
    }

    #[test]
    fn tag_filter_intersection() {
        let tags = OpTags::DISTORT;
        let filter = OpTags::DISTORT | OpTags::DECORATION;
        assert!(filter.intersects(tags));
        assert!(!OpTags::DECORATION.intersects(tags));
    }
}
