//! Accelerator device contract and per-pipe device locking.
//!
//! The pipeline only ever talks to an accelerator through [`AccelDevice`]:
//! buffer allocation, host/device copies, synchronization and event
//! accounting. Kernels themselves are module-provided; a module's
//! accelerated path receives the device and buffer handles and does its own
//! dispatch (downcasting via [`AccelDevice::as_any`] when it needs the
//! concrete backend).

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::AccelError;
use crate::pipe::PipeType;

mod wgpu_device;

pub use wgpu_device::WgpuDevice;

/// Handle to one device-resident image buffer.
///
/// Not `Clone`: whoever holds the handle owns the allocation and must hand
/// it back through [`AccelDevice::release`].
#[derive(Debug)]
pub struct DevBuffer {
    id: u64,
    pub width: i32,
    pub height: i32,
    pub bpp: usize,
}

impl DevBuffer {
    /// Wrap a backend-assigned buffer id. Only device implementations
    /// construct these.
    pub fn new(id: u64, width: i32, height: i32, bpp: usize) -> Self {
        Self {
            id,
            width,
            height,
            bpp,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.bpp
    }

    /// Length in `f32` of the host mirror of this buffer.
    pub fn host_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// The narrow contract the pipeline requires from an off-CPU executor.
pub trait AccelDevice: Send + Sync {
    fn name(&self) -> &str;

    fn alloc(&self, width: i32, height: i32, bpp: usize) -> Result<DevBuffer, AccelError>;

    /// Copy host pixels into a device buffer. A non-blocking write may
    /// surface its failure later through [`events_flush`](Self::events_flush).
    fn write(&self, buf: &DevBuffer, data: &[f32], blocking: bool) -> Result<(), AccelError>;

    /// Copy a device buffer back into host pixels. Always blocking.
    fn read(&self, buf: &DevBuffer, data: &mut [f32]) -> Result<(), AccelError>;

    fn release(&self, buf: DevBuffer);

    /// Wait for all submitted work.
    fn finish(&self) -> Result<(), AccelError>;

    /// Forget accumulated event state at the start of a run.
    fn events_reset(&self);

    /// Drain the event list; non-zero is the number of late failures since
    /// the last reset.
    fn events_flush(&self) -> u32;

    /// Whether an image of the given geometry fits the device once the
    /// module's tiling factor and fixed overhead are applied.
    fn fits(&self, width: i32, height: i32, bpp: usize, factor: f32, overhead: usize) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// Registry of available devices with one-lease-per-device locking.
///
/// A pipe holds its lease for the duration of one `process` call; other
/// pipes asking for the same device in the meantime simply run CPU-only.
#[derive(Default)]
pub struct DeviceHub {
    devices: Vec<Arc<dyn AccelDevice>>,
    in_use: Mutex<Vec<bool>>,
}

impl DeviceHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&mut self, device: Arc<dyn AccelDevice>) {
        self.devices.push(device);
        self.in_use.lock().push(false);
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Try to lock a device for `ptype`. Interactive pipes scan from the
    /// back of the registry, batch pipes from the front, so a two-device
    /// setup splits naturally.
    pub fn lock(self: Arc<Self>, ptype: PipeType) -> Option<DeviceLease> {
        if self.devices.is_empty() {
            return None;
        }
        let order: Vec<usize> = match ptype {
            PipeType::Full | PipeType::Export => (0..self.devices.len()).collect(),
            PipeType::Preview | PipeType::Thumbnail => (0..self.devices.len()).rev().collect(),
        };
        let mut in_use = self.in_use.lock();
        for index in order {
            if !in_use[index] {
                in_use[index] = true;
                drop(in_use);
                tracing::debug!(
                    target: "darkroom::opencl",
                    device = self.devices[index].name(),
                    ?ptype,
                    "device locked"
                );
                return Some(DeviceLease { hub: self, index });
            }
        }
        None
    }
}

/// An exclusive lease on one device; unlocks on drop.
pub struct DeviceLease {
    hub: Arc<DeviceHub>,
    index: usize,
}

impl DeviceLease {
    pub fn device(&self) -> &Arc<dyn AccelDevice> {
        &self.hub.devices[self.index]
    }

    /// Small integer identity of the leased device, for diagnostics.
    pub fn devid(&self) -> i32 {
        self.index as i32
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.hub.in_use.lock()[self.index] = false;
    }
}
