//! A pixel pipe: one end-to-end rendering context.
//!
//! A pipe owns its node list (one piece per module), its slab cache and
//! the published backbuf. It borrows the [`Engine`] for every call; the
//! recursive processor lives in the `process` submodule.

use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::blend::BlendParams;
use crate::cache::{pipeline_hash, PixBuf, PixelCache};
use crate::dev::{Engine, History, ImageInfo};
use crate::module::{ImageOp, OpParams};
use crate::roi::Roi;

mod process;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeType {
    Full,
    Preview,
    Thumbnail,
    Export,
}

bitflags::bitflags! {
    /// Why a pipe needs re-synching before its next run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PipeChange: u32 {
        const TOP_CHANGED = 1 << 0;
        const SYNCH = 1 << 1;
        const REMOVE = 1 << 2;
        const ZOOMED = 1 << 3;
    }
}

/// Cache entries per pipe type: interactive pipes keep more history.
fn cache_entries(ptype: PipeType) -> usize {
    match ptype {
        PipeType::Full | PipeType::Preview => 5,
        PipeType::Thumbnail | PipeType::Export => 2,
    }
}

/// Per-pipe instantiation of one module with its committed state.
pub struct Piece {
    pub module: Arc<dyn ImageOp>,
    /// Index of the module in the engine's chain.
    pub position: usize,
    pub enabled: bool,
    /// Fold of the committed parameter and blend blobs; feeds cache keys.
    pub hash: u64,
    /// Cached answer of the module's accelerated-path capability.
    pub accel_ready: bool,
    pub iwidth: i32,
    pub iheight: i32,
    pub iscale: f32,
    /// Module-interpreted committed state.
    pub data: Option<Box<dyn std::any::Any + Send>>,
    pub blend_params: BlendParams,
    /// Stage regions recorded during dimension computation, for overlays.
    pub buf_in: Roi,
    pub buf_out: Roi,
    /// Clipping reference saved so cache hits can restore it.
    pub processed_maximum: [f32; 3],
}

impl Piece {
    pub fn new(
        module: Arc<dyn ImageOp>,
        position: usize,
        iwidth: i32,
        iheight: i32,
        iscale: f32,
    ) -> Self {
        Self {
            enabled: module.default_enabled(),
            accel_ready: false,
            module,
            position,
            hash: 0,
            iwidth,
            iheight,
            iscale,
            data: None,
            blend_params: BlendParams::default(),
            buf_in: Roi::full(0, 0),
            buf_out: Roi::full(0, 0),
            processed_maximum: [1.0; 3],
        }
    }

    /// Commit a parameter blob: refresh the piece hash and let the module
    /// interpret the blob into its per-piece state.
    pub fn commit_params(&mut self, params: &OpParams, blend: BlendParams) {
        self.blend_params = blend;
        self.hash = commit_hash(self.module.op(), params, &blend);
        self.accel_ready = self.module.has_process_accel();
        let module = Arc::clone(&self.module);
        module.commit_params(params, self);
    }
}

fn commit_hash(op: &str, params: &OpParams, blend: &BlendParams) -> u64 {
    let mut h = ahash::RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    )
    .build_hasher();
    h.write(op.as_bytes());
    h.write(params);
    for word in blend.hash_words() {
        h.write_u64(word);
    }
    h.finish()
}

/// The published output of a pipe, read under its own mutex.
#[derive(Default, Clone)]
pub struct BackBuffer {
    pub buf: Option<PixBuf>,
    pub width: i32,
    pub height: i32,
    pub hash: u64,
}

impl BackBuffer {
    /// The published pixels. Backing slabs may be larger than the
    /// rendered region; this view covers exactly `width × height`.
    pub fn pixels(&self) -> Option<&[f32]> {
        let len = (self.width * self.height * 4) as usize;
        self.buf.as_deref().map(|buf| &buf[..len])
    }
}

/// Cross-thread cancellation for one pipe.
///
/// `request` flips the shutdown bit every suspension point checks;
/// `drain` additionally waits on the busy mutex, so when it returns no
/// run is in flight anymore.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    busy: Arc<Mutex<()>>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn drain(&self) {
        self.request();
        drop(self.busy.lock());
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Shared read access to a pipe's most recent output.
#[derive(Clone)]
pub struct BackbufHandle(Arc<Mutex<BackBuffer>>);

impl BackbufHandle {
    pub fn snapshot(&self) -> BackBuffer {
        self.0.lock().clone()
    }
}

/// Runtime knobs of one pipe.
#[derive(Debug, Clone, Copy)]
pub struct PipeConfig {
    /// User preference: try the accelerator at all.
    pub accel_preference: bool,
    /// Host memory budget driving CPU tiling decisions.
    pub host_memory: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            accel_preference: true,
            host_memory: 1 << 30,
        }
    }
}

pub struct PixelPipe {
    ptype: PipeType,
    pub config: PipeConfig,

    pub(crate) input: Option<PixBuf>,
    pub(crate) iwidth: i32,
    pub(crate) iheight: i32,
    pub(crate) iscale: f32,
    pub(crate) image: ImageInfo,

    pub changed: PipeChange,
    pub(crate) cache: PixelCache,
    pub(crate) nodes: Vec<Piece>,
    pub(crate) cache_obsolete: bool,

    pub(crate) accel_enabled: bool,
    pub(crate) accel_error: bool,
    /// Identity of the currently leased device, -1 without one.
    pub(crate) devid: i32,

    pub(crate) processed_maximum: [f32; 3],
    pub(crate) mask_display: bool,
    pub processed_width: i32,
    pub processed_height: i32,

    processing: AtomicBool,
    shutdown: Arc<AtomicBool>,
    busy: Arc<Mutex<()>>,
    backbuf: Arc<Mutex<BackBuffer>>,
}

impl PixelPipe {
    /// A pipe producing at most `width`×`height` output pixels.
    pub fn new(ptype: PipeType, width: i32, height: i32) -> Self {
        let slab_len = width.max(1) as usize * height.max(1) as usize * 4;
        Self {
            ptype,
            config: PipeConfig::default(),
            input: None,
            iwidth: 0,
            iheight: 0,
            iscale: 1.0,
            image: ImageInfo {
                id: -1,
                width: 0,
                height: 0,
                raw: false,
            },
            changed: PipeChange::empty(),
            cache: PixelCache::new(cache_entries(ptype), slab_len),
            nodes: Vec::new(),
            cache_obsolete: false,
            accel_enabled: false,
            accel_error: false,
            devid: -1,
            processed_maximum: [1.0; 3],
            mask_display: false,
            processed_width: 0,
            processed_height: 0,
            processing: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            busy: Arc::new(Mutex::new(())),
            backbuf: Arc::new(Mutex::new(BackBuffer::default())),
        }
    }

    pub fn pipe_type(&self) -> PipeType {
        self.ptype
    }

    /// The preview pipe runs on a downsampled copy of the input.
    pub(crate) fn uses_downsampled_input(&self) -> bool {
        matches!(self.ptype, PipeType::Preview)
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Relaxed)
    }

    pub(crate) fn set_processing(&self, on: bool) {
        self.processing.store(on, Ordering::Relaxed);
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            busy: Arc::clone(&self.busy),
        }
    }

    pub fn backbuf_handle(&self) -> BackbufHandle {
        BackbufHandle(Arc::clone(&self.backbuf))
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn busy_mutex(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.busy)
    }

    pub(crate) fn publish_backbuf(&self, buf: PixBuf, width: i32, height: i32, hash: u64) {
        let mut backbuf = self.backbuf.lock();
        backbuf.buf = Some(buf);
        backbuf.width = width;
        backbuf.height = height;
        backbuf.hash = hash;
    }

    /// Hand the pipe its source pixels. The buffer is caller-owned; the
    /// pipe only keeps a shared reference.
    pub fn set_input(
        &mut self,
        engine: &Engine,
        input: PixBuf,
        width: i32,
        height: i32,
        iscale: f32,
    ) {
        debug_assert!(input.len() >= (width * height * 4) as usize);
        self.iwidth = width;
        self.iheight = height;
        self.iscale = iscale;
        self.input = Some(input);
        self.image = engine.image;
    }

    /// Build one node per module, enabled or not: disabled nodes skip
    /// execution but preserve topology and hashing.
    pub fn create_nodes(&mut self, engine: &Engine) {
        self.shutdown.store(false, Ordering::SeqCst);
        debug_assert!(self.nodes.is_empty());
        for (position, module) in engine.modules.iter().enumerate() {
            self.nodes.push(Piece::new(
                Arc::clone(module),
                position,
                self.iwidth,
                self.iheight,
                self.iscale,
            ));
        }
    }

    /// Tear down every node, giving each module its cleanup call.
    pub fn cleanup_nodes(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for piece in &mut self.nodes {
            let module = Arc::clone(&piece.module);
            module.cleanup_pipe(piece);
            piece.data = None;
        }
        self.nodes.clear();
    }

    /// Full tear-down: unpublish the backbuf, drop nodes, free the cache.
    pub fn cleanup(&mut self) {
        *self.backbuf.lock() = BackBuffer::default();
        self.cleanup_nodes();
        self.cache.flush();
    }

    fn synch_item(&mut self, history: &History, index: usize) {
        let item = &history.items[index];
        if let Some(piece) = self.nodes.get_mut(item.module) {
            piece.enabled = item.enabled;
            piece.commit_params(&item.params, item.blend);
        } else {
            tracing::warn!(
                target: "darkroom::dev",
                module = item.module,
                "history refers to a module without a node"
            );
        }
    }

    /// Reset every piece to its module defaults, then replay the history
    /// prefix.
    pub fn synch_all(&mut self, history: &History) {
        for piece in &mut self.nodes {
            piece.hash = 0;
            piece.enabled = piece.module.default_enabled();
            let params = piece.module.default_params();
            piece.commit_params(&params, BlendParams::default());
        }
        for index in 0..history.end.min(history.items.len()) {
            self.synch_item(history, index);
        }
    }

    /// Re-commit only the most recent history entry.
    pub fn synch_top(&mut self, history: &History) {
        if history.end > 0 && history.end <= history.items.len() {
            self.synch_item(history, history.end - 1);
        }
    }

    /// Apply whatever the `changed` bitset demands, under the
    /// document-wide history lock, then recompute output dimensions.
    pub fn change(&mut self, engine: &Engine) {
        {
            let history = engine.history.lock();
            if self.changed.contains(PipeChange::TOP_CHANGED) {
                self.synch_top(&history);
            }
            if self.changed.contains(PipeChange::SYNCH) {
                self.synch_all(&history);
            }
            if self.changed.contains(PipeChange::REMOVE) {
                self.cleanup_nodes();
                self.create_nodes(engine);
                self.synch_all(&history);
            }
            self.changed = PipeChange::empty();
        }
        let (width, height) = self.get_dimensions(engine, self.iwidth, self.iheight);
        self.processed_width = width;
        self.processed_height = height;
    }

    /// Forward ROI propagation: walk nodes in order through
    /// `modify_roi_out`, recording stage regions on each piece.
    pub fn get_dimensions(&mut self, engine: &Engine, width_in: i32, height_in: i32) -> (i32, i32) {
        let filter = {
            let gui = engine.gui.lock();
            gui.focus
                .and_then(|focus| engine.modules.get(focus))
                .map(|module| module.operation_tags_filter())
        };

        let mut roi = Roi::full(width_in, height_in);
        for piece in &mut self.nodes {
            let filtered = filter
                .map(|f| f.intersects(piece.module.operation_tags()))
                .unwrap_or(false);
            if piece.enabled && !filtered {
                piece.buf_in = roi;
                let module = Arc::clone(&piece.module);
                roi = module.modify_roi_out(piece, &roi);
                piece.buf_out = roi;
            } else {
                piece.buf_in = roi;
                piece.buf_out = roi;
            }
        }
        (roi.width, roi.height)
    }

    /// Transiently disable `op` and everything after it in execution
    /// order.
    pub fn disable_after(&mut self, op: &str) {
        for piece in self.nodes.iter_mut().rev() {
            let found = piece.module.op() == op;
            piece.enabled = false;
            if found {
                break;
            }
        }
    }

    /// Transiently disable `op` and everything before it.
    pub fn disable_before(&mut self, op: &str) {
        for piece in self.nodes.iter_mut() {
            let found = piece.module.op() == op;
            piece.enabled = false;
            if found {
                break;
            }
        }
    }

    /// Flush the slab cache.
    pub fn flush_caches(&mut self) {
        self.cache.flush();
    }

    /// Flush the cache at the start of the next run, e.g. after the input
    /// buffer was swapped.
    pub fn mark_cache_obsolete(&mut self) {
        self.cache_obsolete = true;
    }

    /// Did the last run render a composite mask instead of blended
    /// pixels?
    pub fn mask_displayed(&self) -> bool {
        self.mask_display
    }

    /// Cache key for the buffer at `pos` nodes into the chain (0 = base
    /// buffer). Folds the committed hashes of every enabled piece up to
    /// there.
    pub(crate) fn node_hash(&self, roi: &Roi, pos: usize) -> u64 {
        pipeline_hash(
            self.image.id,
            roi,
            self.nodes[..pos]
                .iter()
                .filter(|p| p.enabled)
                .map(|p| p.hash),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;
    use crate::module::empty_params;

    struct Half;

    impl ImageOp for Half {
        fn op(&self) -> &'static str {
            "half"
        }
        fn default_enabled(&self) -> bool {
            true
        }
        fn modify_roi_out(&self, _: &Piece, roi_in: &Roi) -> Roi {
            Roi {
                width: roi_in.width / 2,
                height: roi_in.height / 2,
                ..*roi_in
            }
        }
        fn process(
            &self,
            _: &Piece,
            _: &[f32],
            _: &mut [f32],
            _: &Roi,
            _: &Roi,
        ) -> Result<(), ProcessError> {
            Ok(())
        }
    }

    struct Noop(&'static str);

    impl ImageOp for Noop {
        fn op(&self) -> &'static str {
            self.0
        }
        fn default_enabled(&self) -> bool {
            true
        }
        fn process(
            &self,
            _: &Piece,
            _: &[f32],
            _: &mut [f32],
            _: &Roi,
            _: &Roi,
        ) -> Result<(), ProcessError> {
            Ok(())
        }
    }

    fn engine_with(modules: Vec<Arc<dyn ImageOp>>) -> Engine {
        Engine::new(
            ImageInfo {
                id: 9,
                width: 8,
                height: 8,
                raw: false,
            },
            modules,
        )
    }

    fn pipe_with(engine: &Engine) -> PixelPipe {
        let mut pipe = PixelPipe::new(PipeType::Full, 8, 8);
        pipe.set_input(engine, Arc::new(vec![0.0; 8 * 8 * 4]), 8, 8, 1.0);
        pipe.create_nodes(engine);
        pipe
    }

    #[test]
    fn dimensions_walk_through_modify_roi_out() {
        let engine = engine_with(vec![Arc::new(Half), Arc::new(Half)]);
        let mut pipe = pipe_with(&engine);
        let (w, h) = pipe.get_dimensions(&engine, 8, 8);
        assert_eq!((w, h), (2, 2));
        assert_eq!(pipe.nodes[0].buf_out.width, 4);
        assert_eq!(pipe.nodes[1].buf_in.width, 4);
    }

    #[test]
    fn disabled_nodes_pass_dimensions_through() {
        let engine = engine_with(vec![Arc::new(Half)]);
        let mut pipe = pipe_with(&engine);
        pipe.nodes[0].enabled = false;
        let (w, h) = pipe.get_dimensions(&engine, 8, 8);
        assert_eq!((w, h), (8, 8));
    }

    #[test]
    fn top_changed_touches_only_the_latest_entry() {
        let engine = engine_with(vec![Arc::new(Noop("a")), Arc::new(Noop("b"))]);
        let mut pipe = pipe_with(&engine);
        engine.add_history_item(0, empty_params(), BlendParams::default(), true);
        pipe.changed = PipeChange::SYNCH;
        pipe.change(&engine);
        let hash_a = pipe.nodes[0].hash;
        let hash_b = pipe.nodes[1].hash;

        engine.add_history_item(1, Arc::from(&b"p"[..]), BlendParams::default(), true);
        pipe.changed = PipeChange::TOP_CHANGED;
        pipe.change(&engine);
        assert_eq!(pipe.nodes[0].hash, hash_a);
        assert_ne!(pipe.nodes[1].hash, hash_b);
    }

    #[test]
    fn remove_rebuilds_the_node_list() {
        let engine = engine_with(vec![Arc::new(Noop("a"))]);
        let mut pipe = pipe_with(&engine);
        pipe.nodes[0].enabled = false;
        pipe.changed = PipeChange::REMOVE;
        pipe.change(&engine);
        assert_eq!(pipe.nodes.len(), 1);
        assert!(pipe.nodes[0].enabled, "rebuild resets to module defaults");
    }

    #[test]
    fn disable_after_stops_at_the_named_op() {
        let engine = engine_with(vec![
            Arc::new(Noop("a")),
            Arc::new(Noop("b")),
            Arc::new(Noop("c")),
        ]);
        let mut pipe = pipe_with(&engine);
        pipe.disable_after("b");
        assert!(pipe.nodes[0].enabled);
        assert!(!pipe.nodes[1].enabled);
        assert!(!pipe.nodes[2].enabled);
    }

    #[test]
    fn disable_before_stops_at_the_named_op() {
        let engine = engine_with(vec![
            Arc::new(Noop("a")),
            Arc::new(Noop("b")),
            Arc::new(Noop("c")),
        ]);
        let mut pipe = pipe_with(&engine);
        pipe.disable_before("b");
        assert!(!pipe.nodes[0].enabled);
        assert!(!pipe.nodes[1].enabled);
        assert!(pipe.nodes[2].enabled);
    }

    #[test]
    fn shutdown_handle_reaches_the_pipe() {
        let engine = engine_with(vec![]);
        let pipe = pipe_with(&engine);
        let handle = pipe.shutdown_handle();
        assert!(!pipe.shutdown_requested());
        handle.request();
        assert!(pipe.shutdown_requested());
    }
}
