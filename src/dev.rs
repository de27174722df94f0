//! The development engine: everything a pipeline run reads besides its own
//! pipe state.
//!
//! One `Engine` value stands for one open document: image geometry, the
//! ordered module chain, the committed history, the mask catalogue and the
//! observation state of an attached GUI. Pipes borrow it for the duration
//! of a call; there is no hidden global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::accel::DeviceHub;
use crate::blend::BlendParams;
use crate::masks::FormStore;
use crate::masks::MemoryFormsDb;
use crate::module::{ImageOp, OpParams};
use crate::taps::TapRecords;

/// Identity and geometry of the source image.
#[derive(Debug, Clone, Copy)]
pub struct ImageInfo {
    pub id: i64,
    pub width: i32,
    pub height: i32,
    /// Raw sensor data changes histogram sampling.
    pub raw: bool,
}

/// One committed edit: a module, its parameter blob and blend settings.
#[derive(Clone)]
pub struct HistoryItem {
    /// Index into [`Engine::modules`].
    pub module: usize,
    pub enabled: bool,
    pub params: OpParams,
    pub blend: BlendParams,
}

/// The edit timeline. Only items before `end` are replayed into pipes, so
/// undo is a matter of moving `end`.
#[derive(Default)]
pub struct History {
    pub items: Vec<HistoryItem>,
    pub end: usize,
}

/// Signals a pipe raises when a run completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeSignal {
    PreviewPipeFinished,
    UiPipeFinished,
}

/// What an attached GUI is currently looking at.
#[derive(Default)]
pub struct GuiState {
    pub attached: bool,
    pub leaving: bool,
    /// Focused module index; its tag filter suppresses matching modules.
    pub focus: Option<usize>,
    pub request_color_pick: bool,
    /// Picker position in normalised output coordinates.
    pub picker_point: [f32; 2],
    /// Optional picker box `[x0, y0, x1, y1]`, normalised.
    pub picker_box: Option<[f32; 4]>,
    /// Restrict the display histogram to the picker area.
    pub restrict_histogram: bool,
    /// Module indices that asked for a per-module histogram.
    pub histogram_requests: ahash::HashSet<usize>,
}

pub struct Engine {
    pub image: ImageInfo,
    pub modules: Vec<Arc<dyn ImageOp>>,
    pub history: Mutex<History>,
    pub forms: Mutex<FormStore>,
    pub gui: Mutex<GuiState>,
    pub taps: Mutex<TapRecords>,
    pub devices: Arc<DeviceHub>,
    signals: Option<Sender<PipeSignal>>,
    pub image_force_reload: AtomicBool,
    pub preview_loading: AtomicBool,
    /// Developer breakpoint: aborts any in-flight run at its next
    /// suspension point.
    pub breakpoint: AtomicBool,
}

impl Engine {
    pub fn new(image: ImageInfo, modules: Vec<Arc<dyn ImageOp>>) -> Self {
        Self {
            image,
            modules,
            history: Mutex::new(History::default()),
            forms: Mutex::new(FormStore::new(image.id, Box::new(MemoryFormsDb::new()))),
            gui: Mutex::new(GuiState::default()),
            taps: Mutex::new(TapRecords::default()),
            devices: Arc::new(DeviceHub::new()),
            signals: None,
            image_force_reload: AtomicBool::new(false),
            preview_loading: AtomicBool::new(false),
            breakpoint: AtomicBool::new(false),
        }
    }

    pub fn with_devices(mut self, devices: Arc<DeviceHub>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_forms(self, forms: FormStore) -> Self {
        *self.forms.lock() = forms;
        self
    }

    /// Deliver pipe-finished signals over `sender`.
    pub fn with_signals(mut self, sender: Sender<PipeSignal>) -> Self {
        self.signals = Some(sender);
        self
    }

    /// Append an edit and advance the replay end past it.
    pub fn add_history_item(
        &self,
        module: usize,
        params: OpParams,
        blend: BlendParams,
        enabled: bool,
    ) {
        let mut history = self.history.lock();
        let at = history.end;
        history.items.truncate(at);
        history.items.push(HistoryItem {
            module,
            enabled,
            params,
            blend,
        });
        history.end = history.items.len();
    }

    pub(crate) fn raise(&self, signal: PipeSignal) {
        if let Some(sender) = &self.signals {
            let _ = sender.try_send(signal);
        }
    }

    pub(crate) fn reload_pending(&self) -> bool {
        self.image_force_reload.load(Ordering::Relaxed)
    }

    pub(crate) fn preview_reloading(&self) -> bool {
        self.preview_loading.load(Ordering::Relaxed)
    }

    pub(crate) fn breakpoint_set(&self) -> bool {
        self.breakpoint.load(Ordering::Relaxed)
    }
}
