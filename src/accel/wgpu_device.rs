//! `wgpu`-backed implementation of the device contract.
//!
//! Covers the buffer-traffic half of the contract: storage buffers for
//! image data, queued uploads, mapped readback. Module kernels downcast to
//! this type to build their own compute dispatches against [`device`] and
//! [`queue`].
//!
//! [`device`]: WgpuDevice::wgpu_device
//! [`queue`]: WgpuDevice::wgpu_queue

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::accel::{AccelDevice, DevBuffer};
use crate::error::AccelError;

pub struct WgpuDevice {
    adapter_name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    buffers: Mutex<HashMap<u64, wgpu::Buffer>>,
    next_id: AtomicU64,
    failed_events: AtomicU32,
    max_buffer_size: u64,
}

impl WgpuDevice {
    /// Bring up a headless device on the highest-performance adapter.
    /// Returns `None` when no adapter is available.
    ///
    /// ```rust,no_run
    /// use futures::executor::block_on;
    /// use darkroom::accel::{DeviceHub, WgpuDevice};
    /// use std::sync::Arc;
    ///
    /// let mut hub = DeviceHub::new();
    /// if let Some(device) = block_on(WgpuDevice::new()) {
    ///     hub.add_device(Arc::new(device));
    /// }
    /// ```
    pub async fn new() -> Option<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok()?;

        let adapter_name = adapter.get_info().name;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("darkroom accel device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
                trace: Default::default(),
            })
            .await
            .ok()?;

        let max_buffer_size = device.limits().max_buffer_size;

        Some(Self {
            adapter_name,
            device,
            queue,
            buffers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            failed_events: AtomicU32::new(0),
            max_buffer_size,
        })
    }

    pub fn wgpu_device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn wgpu_queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Resolve a handle to its backing buffer, if still alive.
    pub fn buffer_for(&self, buf: &DevBuffer) -> Option<wgpu::Buffer> {
        self.buffers.lock().get(&buf.id()).cloned()
    }

    fn note_event_failure(&self) {
        self.failed_events.fetch_add(1, Ordering::Relaxed);
    }
}

impl AccelDevice for WgpuDevice {
    fn name(&self) -> &str {
        &self.adapter_name
    }

    fn alloc(&self, width: i32, height: i32, bpp: usize) -> Result<DevBuffer, AccelError> {
        let byte_len = width as usize * height as usize * bpp;
        if byte_len as u64 > self.max_buffer_size {
            return Err(AccelError::Alloc(byte_len));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("darkroom image buffer"),
            size: byte_len as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.buffers.lock().insert(id, buffer);
        Ok(DevBuffer {
            id,
            width,
            height,
            bpp,
        })
    }

    fn write(&self, buf: &DevBuffer, data: &[f32], blocking: bool) -> Result<(), AccelError> {
        let buffer = self
            .buffer_for(buf)
            .ok_or_else(|| AccelError::Copy("write to released buffer".into()))?;
        if data.len() < buf.host_len() {
            return Err(AccelError::Copy("host buffer shorter than device image".into()));
        }
        self.queue
            .write_buffer(&buffer, 0, bytemuck::cast_slice(&data[..buf.host_len()]));
        if blocking {
            self.queue.submit(std::iter::empty());
            let _ = self.device.poll(wgpu::MaintainBase::Wait);
        }
        Ok(())
    }

    fn read(&self, buf: &DevBuffer, data: &mut [f32]) -> Result<(), AccelError> {
        let buffer = self
            .buffer_for(buf)
            .ok_or_else(|| AccelError::Copy("read from released buffer".into()))?;
        if data.len() < buf.host_len() {
            return Err(AccelError::Copy("host buffer shorter than device image".into()));
        }
        let byte_len = buf.host_len() as u64 * 4;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("darkroom readback buffer"),
            size: byte_len,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("darkroom readback encoder"),
            });
        encoder.copy_buffer_to_buffer(&buffer, 0, &staging, 0, byte_len);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            if sender.send(result).is_err() {
                tracing::warn!(target: "darkroom::opencl", "map_async result dropped");
            }
        });
        let _ = self.device.poll(wgpu::MaintainBase::Wait);

        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.note_event_failure();
                return Err(AccelError::Copy(format!("map failed: {err:?}")));
            }
            Err(_) => {
                self.note_event_failure();
                return Err(AccelError::Copy("map callback lost".into()));
            }
        }

        let mapped = slice.get_mapped_range();
        data[..buf.host_len()].copy_from_slice(bytemuck::cast_slice(&mapped));
        drop(mapped);
        staging.unmap();
        Ok(())
    }

    fn release(&self, buf: DevBuffer) {
        if let Some(buffer) = self.buffers.lock().remove(&buf.id()) {
            buffer.destroy();
        }
    }

    fn finish(&self) -> Result<(), AccelError> {
        self.queue.submit(std::iter::empty());
        let _ = self.device.poll(wgpu::MaintainBase::Wait);
        Ok(())
    }

    fn events_reset(&self) {
        self.failed_events.store(0, Ordering::Relaxed);
    }

    fn events_flush(&self) -> u32 {
        self.failed_events.swap(0, Ordering::Relaxed)
    }

    fn fits(&self, width: i32, height: i32, bpp: usize, factor: f32, overhead: usize) -> bool {
        let base = width as f64 * height as f64 * bpp as f64;
        let required = base * factor.max(1.0) as f64 + overhead as f64;
        required <= self.max_buffer_size as f64
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
