//! Shared fixtures for the integration tests: simple operator modules and
//! an in-memory accelerator device with leak accounting.

#![allow(dead_code)]

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use darkroom::accel::{AccelDevice, DevBuffer, DeviceHub};
use darkroom::{
    AccelError, Engine, ImageInfo, ImageOp, OpFlags, OpParams, Piece, PipeChange, PipeType,
    PixelPipe, ProcessError, Roi,
};

/// Route `darkroom::*` debug channels to the test output; safe to call
/// from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ones(width: i32, height: i32) -> Arc<Vec<f32>> {
    Arc::new(vec![1.0f32; (width * height * 4) as usize])
}

pub fn image(id: i64, width: i32, height: i32) -> ImageInfo {
    ImageInfo {
        id,
        width,
        height,
        raw: false,
    }
}

/// A full pipe with nodes built and history synched.
pub fn pipe_for(engine: &Engine, input: Arc<Vec<f32>>, width: i32, height: i32) -> PixelPipe {
    let mut pipe = PixelPipe::new(PipeType::Full, width, height);
    pipe.set_input(engine, input, width, height, 1.0);
    pipe.create_nodes(engine);
    pipe.changed = PipeChange::SYNCH;
    pipe.change(engine);
    pipe
}

pub fn gain_params(gain: f32) -> OpParams {
    Arc::from(gain.to_ne_bytes().as_slice())
}

/// Copies its input through unchanged.
pub struct Identity;

impl ImageOp for Identity {
    fn op(&self) -> &'static str {
        "identity"
    }
    fn default_enabled(&self) -> bool {
        true
    }
    fn process(
        &self,
        _piece: &Piece,
        input: &[f32],
        output: &mut [f32],
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), ProcessError> {
        let len = output.len().min(input.len());
        output[..len].copy_from_slice(&input[..len]);
        Ok(())
    }
}

fn committed_gain(piece: &Piece) -> f32 {
    piece
        .data
        .as_ref()
        .and_then(|data| data.downcast_ref::<f32>())
        .copied()
        .unwrap_or(1.0)
}

fn apply_gain(gain: f32, input: &[f32], output: &mut [f32]) {
    for (k, (out, value)) in output.iter_mut().zip(input.iter()).enumerate() {
        *out = if k & 3 == 3 { *value } else { *value * gain };
    }
}

/// Multiplies RGB by a committed factor; parameter blob is the factor's
/// native-endian bytes.
pub struct Gain;

impl ImageOp for Gain {
    fn op(&self) -> &'static str {
        "gain"
    }
    fn default_enabled(&self) -> bool {
        true
    }
    fn flags(&self) -> OpFlags {
        OpFlags::SUPPORTS_BLENDING
    }
    fn commit_params(&self, params: &OpParams, piece: &mut Piece) {
        let gain = params
            .get(..4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(1.0);
        piece.data = Some(Box::new(gain));
    }
    fn process(
        &self,
        piece: &Piece,
        input: &[f32],
        output: &mut [f32],
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), ProcessError> {
        apply_gain(committed_gain(piece), input, output);
        Ok(())
    }
}

/// Gain with a device path. The first `fail_kernels` invocations of the
/// kernel report failure, which must restart the pipe without the
/// accelerator.
pub struct AccelGain {
    fail_kernels: AtomicUsize,
    pub kernel_calls: AtomicUsize,
}

impl AccelGain {
    pub fn reliable() -> Self {
        Self::failing(0)
    }

    pub fn failing(times: usize) -> Self {
        Self {
            fail_kernels: AtomicUsize::new(times),
            kernel_calls: AtomicUsize::new(0),
        }
    }
}

impl ImageOp for AccelGain {
    fn op(&self) -> &'static str {
        "gain"
    }
    fn default_enabled(&self) -> bool {
        true
    }
    fn commit_params(&self, params: &OpParams, piece: &mut Piece) {
        Gain.commit_params(params, piece)
    }
    fn process(
        &self,
        piece: &Piece,
        input: &[f32],
        output: &mut [f32],
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<(), ProcessError> {
        Gain.process(piece, input, output, roi_in, roi_out)
    }
    fn has_process_accel(&self) -> bool {
        true
    }
    fn process_accel(
        &self,
        piece: &Piece,
        device: &dyn AccelDevice,
        input: &DevBuffer,
        output: &DevBuffer,
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), AccelError> {
        self.kernel_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_kernels
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AccelError::Kernel("gain"));
        }
        let mut host_in = vec![0.0f32; input.host_len()];
        device.read(input, &mut host_in)?;
        let mut host_out = vec![0.0f32; output.host_len()];
        apply_gain(committed_gain(piece), &host_in, &mut host_out);
        device.write(output, &host_out, true)
    }
}

/// Terminal display encoding: clamps to `[0,1]`.
pub struct GammaOp;

impl ImageOp for GammaOp {
    fn op(&self) -> &'static str {
        darkroom::OP_GAMMA
    }
    fn default_enabled(&self) -> bool {
        true
    }
    fn process(
        &self,
        _piece: &Piece,
        input: &[f32],
        output: &mut [f32],
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), ProcessError> {
        for (out, value) in output.iter_mut().zip(input.iter()) {
            *out = value.clamp(0.0, 1.0);
        }
        Ok(())
    }
}

/// Announces the start of its run and then stalls, so tests can race a
/// shutdown request against it.
pub struct Stall {
    pub started: crossbeam_channel::Sender<()>,
}

impl ImageOp for Stall {
    fn op(&self) -> &'static str {
        "stall"
    }
    fn default_enabled(&self) -> bool {
        true
    }
    fn process(
        &self,
        _piece: &Piece,
        input: &[f32],
        output: &mut [f32],
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), ProcessError> {
        let _ = self.started.send(());
        std::thread::sleep(std::time::Duration::from_millis(100));
        output.copy_from_slice(&input[..output.len()]);
        Ok(())
    }
}

/// Host-memory-backed accelerator with live-buffer accounting.
pub struct MockDevice {
    buffers: Mutex<HashMap<u64, Vec<f32>>>,
    next_id: AtomicU64,
    live: AtomicUsize,
    total_allocs: AtomicUsize,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            live: AtomicUsize::new(0),
            total_allocs: AtomicUsize::new(0),
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn total_allocs(&self) -> usize {
        self.total_allocs.load(Ordering::SeqCst)
    }

    pub fn hub(device: Arc<Self>) -> Arc<DeviceHub> {
        let mut hub = DeviceHub::new();
        hub.add_device(device);
        Arc::new(hub)
    }
}

impl AccelDevice for MockDevice {
    fn name(&self) -> &str {
        "mock"
    }
    fn alloc(&self, width: i32, height: i32, bpp: usize) -> Result<DevBuffer, AccelError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.buffers
            .lock()
            .unwrap()
            .insert(id, vec![0.0; (width * height * 4) as usize]);
        self.live.fetch_add(1, Ordering::SeqCst);
        self.total_allocs.fetch_add(1, Ordering::SeqCst);
        Ok(DevBuffer::new(id, width, height, bpp))
    }
    fn write(&self, buf: &DevBuffer, data: &[f32], _blocking: bool) -> Result<(), AccelError> {
        let mut buffers = self.buffers.lock().unwrap();
        let slab = buffers
            .get_mut(&buf.id())
            .ok_or_else(|| AccelError::Copy("write to released buffer".into()))?;
        let len = slab.len().min(data.len());
        slab[..len].copy_from_slice(&data[..len]);
        Ok(())
    }
    fn read(&self, buf: &DevBuffer, data: &mut [f32]) -> Result<(), AccelError> {
        let buffers = self.buffers.lock().unwrap();
        let slab = buffers
            .get(&buf.id())
            .ok_or_else(|| AccelError::Copy("read from released buffer".into()))?;
        let len = slab.len().min(data.len());
        data[..len].copy_from_slice(&slab[..len]);
        Ok(())
    }
    fn release(&self, buf: DevBuffer) {
        if self.buffers.lock().unwrap().remove(&buf.id()).is_some() {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
    fn finish(&self) -> Result<(), AccelError> {
        Ok(())
    }
    fn events_reset(&self) {}
    fn events_flush(&self) -> u32 {
        0
    }
    fn fits(&self, _: i32, _: i32, _: usize, _: f32, _: usize) -> bool {
        true
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}
