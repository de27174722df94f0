//! # Darkroom
//!
//! Darkroom is the development core of a non-destructive raw photo editor:
//! a demand-driven pixel pipeline that renders a region of interest through
//! an ordered chain of editing modules, with aggressive slab caching, mask
//! composition from vector shapes, and an optional accelerator path with
//! transparent CPU fallback (via the [`wgpu`](https://crates.io/crates/wgpu)
//! crate).
//!
//! ## Features
//!
//! - **Recursive processing**: a target region is pulled backwards through
//!   the module chain; every intermediate buffer lands in a fixed pool of
//!   hashed pixel slabs, so edits only recompute what they touch.
//! - **Vector masks**: circles and Catmull-Rom paths, composed per module
//!   through groups with fuzzy union/intersection/difference/exclusion and
//!   per-shape opacity, persisted as packed binary records.
//! - **Accelerator offload**: modules that ship device kernels run on a
//!   leased device; any device failure transparently restarts the pipe on
//!   the CPU with bit-identical results.
//! - **Observation taps**: per-module histograms and color pickers, plus
//!   display histogram and live samples at the terminal stage.
//!
//! ## Basic Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use darkroom::{Engine, ImageInfo, PixelPipe, PipeType};
//!
//! // a document with no modules: the pipe passes the input through
//! let engine = Engine::new(
//!     ImageInfo { id: 1, width: 4, height: 4, raw: false },
//!     Vec::new(),
//! );
//!
//! let input = Arc::new(vec![1.0f32; 4 * 4 * 4]);
//! let mut pipe = PixelPipe::new(PipeType::Full, 4, 4);
//! pipe.set_input(&engine, input, 4, 4, 1.0);
//! pipe.create_nodes(&engine);
//! pipe.change(&engine);
//!
//! pipe.process(&engine, 0, 0, 4, 4, 1.0).expect("render");
//! let backbuf = pipe.backbuf_handle().snapshot();
//! assert_eq!(backbuf.width, 4);
//! ```

pub use lyon;
pub use wgpu;

mod blend;
mod cache;
mod dev;
mod error;
mod module;
mod pipe;
mod resample;
mod roi;
mod taps;

pub mod accel;
pub mod masks;

pub use blend::{BlendMode, BlendParams};
pub use cache::{PixBuf, PixelCache};
pub use dev::{Engine, GuiState, History, HistoryItem, ImageInfo, PipeSignal};
pub use error::{AccelError, ProcessError, StoreError};
pub use module::{
    empty_params, ColorSpace, ImageOp, OpFlags, OpParams, OpTags, TilingRequest, OP_COLOROUT,
    OP_GAMMA,
};
pub use pipe::{
    BackBuffer, BackbufHandle, Piece, PipeChange, PipeConfig, PipeType, PixelPipe, ShutdownHandle,
};
pub use roi::Roi;
pub use taps::{Histogram, LiveSample, PickedColor, TapRecords};
