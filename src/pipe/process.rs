//! The recursive, demand-driven processor and its outer driver.
//!
//! `process_rec` walks the node list tail-first: each level either returns
//! a cached buffer or recurses for its input, runs the module on the CPU
//! or the leased accelerator, blends, feeds the taps and publishes the
//! result into the slab cache. The outer `process` owns the device lease
//! and restarts the whole pipe once, accelerator disabled, when a device
//! error surfaces.

use std::sync::Arc;

use crate::accel::{DevBuffer, DeviceLease};
use crate::blend::{self, BlendMode};
use crate::cache::{pipeline_hash, CacheLine, PixBuf};
use crate::dev::{Engine, PipeSignal};
use crate::error::ProcessError;
use crate::module::{ImageOp, OpFlags, TilingRequest, OP_COLOROUT, OP_GAMMA};
use crate::pipe::{PipeType, PixelPipe};
use crate::resample;
use crate::roi::Roi;
use crate::taps;

/// Host buffers are always 4 × f32 per pixel.
const HOST_BPP: usize = 16;

pub(crate) struct RecOut {
    buf: PixBuf,
    /// Device copy of the same pixels, forwarded so the next module can
    /// skip the upload.
    dev: Option<DevBuffer>,
}

enum AccelAttempt {
    /// The module ran on the device; host line is filled and blended.
    Done { dev_out: Option<DevBuffer> },
    /// Device path unavailable for this module; run the CPU path.
    FallBack,
    /// Unrecoverable for this run (late copy error, shutdown).
    Fail(ProcessError),
}

/// View of the pixels a region actually covers; backing slabs may be
/// larger.
fn roi_slice<'a>(buf: &'a [f32], roi: &Roi) -> &'a [f32] {
    &buf[..roi.buffer_len().min(buf.len())]
}

fn fits_host_memory(
    budget: usize,
    width: i32,
    height: i32,
    bpp: usize,
    tiling: &TilingRequest,
) -> bool {
    let required =
        width as f64 * height as f64 * bpp as f64 * tiling.factor.max(1.0) as f64
            + tiling.overhead as f64;
    required <= budget as f64
}

impl PixelPipe {
    fn release_dev(&self, lease: Option<&DeviceLease>, buf: Option<DevBuffer>) {
        if let (Some(lease), Some(buf)) = (lease, buf) {
            lease.device().release(buf);
        }
    }

    /// Environment checks shared by every suspension point past the cache
    /// lookup.
    fn abort_pending(&self, engine: &Engine) -> bool {
        if self.shutdown_requested() || engine.breakpoint_set() {
            return true;
        }
        match self.pipe_type() {
            PipeType::Full if engine.reload_pending() => true,
            PipeType::Preview if engine.preview_reloading() => true,
            _ => engine.gui.lock().leaving,
        }
    }

    /// Is the module at `idx` suppressed by the focused module's tag
    /// filter?
    fn tag_filtered(&self, engine: &Engine, idx: usize) -> bool {
        let gui = engine.gui.lock();
        let Some(focus) = gui.focus else {
            return false;
        };
        let Some(focused) = engine.modules.get(focus) else {
            return false;
        };
        focused
            .operation_tags_filter()
            .intersects(self.nodes[idx].module.operation_tags())
    }

    pub(crate) fn process_rec(
        &mut self,
        engine: &Engine,
        lease: Option<&DeviceLease>,
        roi_out: &Roi,
        pos: usize,
    ) -> Result<RecOut, ProcessError> {
        // disabled or tag-filtered nodes pass the ROI through unchanged
        if pos > 0 {
            let piece = &self.nodes[pos - 1];
            if !piece.enabled || self.tag_filtered(engine, pos - 1) {
                return self.process_rec(engine, lease, roi_out, pos - 1);
            }
        }

        let buf_len = roi_out.buffer_len();

        // 1) a cached buffer short-circuits the whole subtree
        if self.shutdown_requested() {
            return Err(ProcessError::Aborted);
        }
        let hash = self.node_hash(roi_out, pos);
        if self.cache.available(hash) {
            self.processed_maximum = if pos > 0 {
                self.nodes[pos - 1].processed_maximum
            } else {
                [1.0; 3]
            };
            let line = self.cache.get(hash, buf_len);
            let buf = self.cache.publish(line);
            if pos > 0 {
                self.collect_terminal(engine, pos, &buf, roi_out);
            }
            return Ok(RecOut { buf, dev: None });
        }

        // 2) has the environment moved on?
        if self.abort_pending(engine) {
            return Err(ProcessError::Aborted);
        }

        // 3a) base case: import the caller's input buffer
        if pos == 0 {
            let input = self
                .input
                .clone()
                .ok_or_else(|| ProcessError::InvalidState("no input buffer set".into()))?;
            if roi_out.is_full_frame(self.iwidth, self.iheight) && !self.uses_downsampled_input()
            {
                // zero-copy alias of the caller's buffer
                return Ok(RecOut {
                    buf: input,
                    dev: None,
                });
            }
            let line = self.cache.get(hash, buf_len);
            {
                let out = self.cache.writer(&line);
                if roi_out.scale == 1.0 {
                    out.fill(0.0);
                    resample::copy_rows(out, &input, roi_out, self.iwidth, self.iheight);
                } else {
                    resample::clip_and_zoom(out, &input, roi_out, self.iwidth, self.iheight);
                }
            }
            let buf = self.cache.publish(line);
            return Ok(RecOut { buf, dev: None });
        }

        // 3b) recurse for this module's input
        let idx = pos - 1;
        let module = Arc::clone(&self.nodes[idx].module);
        let roi_in = module.modify_roi_in(&self.nodes[idx], roi_out);
        if self.shutdown_requested() {
            return Err(ProcessError::Aborted);
        }

        let upstream = self.process_rec(engine, lease, &roi_in, pos - 1)?;
        let input = upstream.buf;
        let mut dev_in = upstream.dev;

        if self.shutdown_requested() {
            self.release_dev(lease, dev_in.take());
            return Err(ProcessError::Aborted);
        }

        // reserve the output line; the display terminal outlives churn
        let line = if module.op() == OP_GAMMA {
            self.cache.get_important(hash, buf_len)
        } else {
            self.cache.get(hash, buf_len)
        };

        let tiling = module
            .tiling_callback(&self.nodes[idx], &roi_in, roi_out)
            .max(blend::tiling_callback(&self.nodes[idx]));

        // 4) pick an execution path
        let mut dev_out = None;
        let mut need_cpu = true;

        let accel_lease = lease.filter(|_| {
            self.accel_enabled
                && self.nodes[idx].accel_ready
                && !(self.pipe_type() == PipeType::Preview
                    && module.flags().contains(OpFlags::PREVIEW_NON_ACCEL))
        });
        if let Some(lease) = accel_lease {
            match self.run_accel(
                engine, lease, &module, idx, &line, &input, &mut dev_in, &roi_in, roi_out,
                &tiling,
            ) {
                AccelAttempt::Done { dev_out: produced } => {
                    dev_out = produced;
                    need_cpu = false;
                }
                AccelAttempt::FallBack => {
                    tracing::debug!(
                        target: "darkroom::opencl",
                        op = module.op(),
                        "falling back to the cpu path"
                    );
                    self.release_dev(Some(lease), dev_in.take());
                }
                AccelAttempt::Fail(err) => {
                    self.release_dev(Some(lease), dev_in.take());
                    self.cache.abandon(line);
                    return Err(err);
                }
            }
        }

        if need_cpu {
            self.release_dev(lease, dev_in.take());
            if let Err(err) = self.run_cpu(engine, &module, idx, &line, &input, &roi_in, roi_out, &tiling)
            {
                self.cache.abandon(line);
                return Err(err);
            }
        }

        // save the clipping reference so cache hits can restore it
        self.nodes[idx].processed_maximum = self.processed_maximum;

        // the focused module's input is the most likely buffer to be
        // needed again
        if engine.gui.lock().focus == Some(idx) {
            self.cache.reweight(&input);
        }

        self.scan_non_finite(&module, &line, roi_out);

        let buf = self.cache.publish(line);
        self.collect_terminal(engine, pos, &buf, roi_out);
        Ok(RecOut { buf, dev: dev_out })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_accel(
        &mut self,
        engine: &Engine,
        lease: &DeviceLease,
        module: &Arc<dyn ImageOp>,
        idx: usize,
        line: &CacheLine,
        input: &PixBuf,
        dev_in: &mut Option<DevBuffer>,
        roi_in: &Roi,
        roi_out: &Roi,
        tiling: &TilingRequest,
    ) -> AccelAttempt {
        let device = lease.device();
        let bpp = module.output_bpp(&self.nodes[idx]).max(HOST_BPP);
        let width = roi_in.width.max(roi_out.width);
        let height = roi_in.height.max(roi_out.height);

        if device.fits(width, height, bpp, tiling.factor, tiling.overhead) {
            // whole image at once
            let din = match dev_in.take() {
                Some(buf) => buf,
                None => {
                    let buf = match device.alloc(roi_in.width, roi_in.height, HOST_BPP) {
                        Ok(buf) => buf,
                        Err(err) => {
                            tracing::debug!(
                                target: "darkroom::opencl",
                                op = module.op(),
                                %err,
                                "could not allocate device input"
                            );
                            self.accel_error = true;
                            return AccelAttempt::Fail(err.into());
                        }
                    };
                    if let Err(err) = device.write(&buf, input, false) {
                        tracing::debug!(
                            target: "darkroom::opencl",
                            op = module.op(),
                            %err,
                            "could not upload device input"
                        );
                        device.release(buf);
                        self.accel_error = true;
                        return AccelAttempt::Fail(err.into());
                    }
                    buf
                }
            };

            if self.shutdown_requested() {
                device.release(din);
                return AccelAttempt::Fail(ProcessError::Aborted);
            }

            let dout = match device.alloc(roi_out.width, roi_out.height, bpp) {
                Ok(buf) => buf,
                Err(err) => {
                    tracing::debug!(
                        target: "darkroom::opencl",
                        op = module.op(),
                        %err,
                        "could not allocate device output"
                    );
                    device.release(din);
                    self.accel_error = true;
                    return AccelAttempt::Fail(err.into());
                }
            };

            if let Err(err) =
                module.process_accel(&self.nodes[idx], device.as_ref(), &din, &dout, roi_in, roi_out)
            {
                tracing::debug!(
                    target: "darkroom::opencl",
                    op = module.op(),
                    %err,
                    "kernel failed"
                );
                device.release(din);
                device.release(dout);
                self.accel_error = true;
                return AccelAttempt::Fail(err.into());
            }

            if self.shutdown_requested() {
                device.release(din);
                device.release(dout);
                return AccelAttempt::Fail(ProcessError::Aborted);
            }

            // synchronous copy-back keeps the host cache line coherent
            {
                let out = self.cache.writer(line);
                if let Err(err) = device.read(&dout, out) {
                    tracing::debug!(
                        target: "darkroom::opencl",
                        op = module.op(),
                        %err,
                        "late device error while copying back"
                    );
                    device.release(din);
                    device.release(dout);
                    self.accel_error = true;
                    return AccelAttempt::Fail(ProcessError::AcceleratorTransient(err.to_string()));
                }
            }
            device.release(din);

            self.run_module_taps(engine, idx, input, roi_in, line, roi_out);

            match self.run_blend(engine, idx, input, line, roi_in, roi_out) {
                Ok(false) => AccelAttempt::Done {
                    dev_out: Some(dout),
                },
                Ok(true) => {
                    // blending changed the host pixels; the device copy is
                    // stale, so the next module re-uploads
                    device.release(dout);
                    AccelAttempt::Done { dev_out: None }
                }
                Err(err) => {
                    device.release(dout);
                    AccelAttempt::Fail(err)
                }
            }
        } else if module.flags().contains(OpFlags::ALLOW_TILING) {
            // too big for the device in one piece: the module tiles on
            // host buffers and uploads slice by slice
            if let Some(buf) = dev_in.take() {
                device.release(buf);
            }
            let result = {
                let out = self.cache.writer(line);
                module.process_tiling_accel(
                    &self.nodes[idx],
                    device.as_ref(),
                    input,
                    out,
                    roi_in,
                    roi_out,
                    HOST_BPP,
                )
            };
            if let Err(err) = result {
                tracing::debug!(
                    target: "darkroom::opencl",
                    op = module.op(),
                    %err,
                    "tiled kernel failed"
                );
                self.accel_error = true;
                return AccelAttempt::Fail(err.into());
            }
            self.run_module_taps(engine, idx, input, roi_in, line, roi_out);
            match self.run_blend(engine, idx, input, line, roi_in, roi_out) {
                Ok(_) => AccelAttempt::Done { dev_out: None },
                Err(err) => AccelAttempt::Fail(err),
            }
        } else {
            AccelAttempt::FallBack
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_cpu(
        &mut self,
        engine: &Engine,
        module: &Arc<dyn ImageOp>,
        idx: usize,
        line: &CacheLine,
        input: &PixBuf,
        roi_in: &Roi,
        roi_out: &Roi,
        tiling: &TilingRequest,
    ) -> Result<(), ProcessError> {
        let bpp = module.output_bpp(&self.nodes[idx]).max(HOST_BPP);
        let width = roi_in.width.max(roi_out.width);
        let height = roi_in.height.max(roi_out.height);
        let tiled = module.flags().contains(OpFlags::ALLOW_TILING)
            && !fits_host_memory(self.config.host_memory, width, height, bpp, tiling);

        {
            let piece = &self.nodes[idx];
            let pixels = roi_slice(input, roi_in);
            let out = self.cache.writer(line);
            if tiled {
                module.process_tiling(piece, pixels, out, roi_in, roi_out, HOST_BPP)?;
            } else {
                module.process(piece, pixels, out, roi_in, roi_out)?;
            }
        }
        if self.shutdown_requested() {
            return Err(ProcessError::Aborted);
        }

        self.run_module_taps(engine, idx, input, roi_in, line, roi_out);
        if self.shutdown_requested() {
            return Err(ProcessError::Aborted);
        }

        self.run_blend(engine, idx, input, line, roi_in, roi_out)?;
        Ok(())
    }

    /// Blend the module's output over its input under the committed mask.
    /// Returns whether blending touched the pixels.
    fn run_blend(
        &mut self,
        engine: &Engine,
        idx: usize,
        input: &PixBuf,
        line: &CacheLine,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<bool, ProcessError> {
        let piece = &self.nodes[idx];
        if piece.blend_params.mode == BlendMode::Disabled
            || !piece.module.flags().contains(OpFlags::SUPPORTS_BLENDING)
        {
            return Ok(false);
        }
        if piece.blend_params.show_mask {
            self.mask_display = true;
        }
        let mask_display = self.mask_display;
        let forms = engine.forms.lock();
        let pixels = roi_slice(input, roi_in);
        let out = self.cache.writer(line);
        blend::blend_process(piece, forms.forms(), mask_display, pixels, out, roi_in, roi_out)?;
        Ok(true)
    }

    /// Per-module picker and histogram taps, preview pipe only.
    fn run_module_taps(
        &self,
        engine: &Engine,
        idx: usize,
        input: &PixBuf,
        roi_in: &Roi,
        line: &CacheLine,
        roi_out: &Roi,
    ) {
        if self.pipe_type() != PipeType::Preview {
            return;
        }
        let (want_pick, want_hist, point, area) = {
            let gui = engine.gui.lock();
            if !gui.attached {
                return;
            }
            let position = self.nodes[idx].position;
            (
                gui.focus == Some(position) && gui.request_color_pick,
                gui.histogram_requests.contains(&position),
                gui.picker_point,
                gui.picker_box,
            )
        };

        if want_pick {
            let output = self.cache.reader(line);
            let mut records = engine.taps.lock();
            records.picked_color = taps::picker(roi_slice(input, roi_in), roi_in, point, area);
            records.picked_output_color = taps::picker(output, roi_out, point, area);
        }
        if want_hist {
            let hist = taps::histogram_collect(
                self.nodes[idx].module.colorspace(),
                roi_slice(input, roi_in),
                roi_in,
            );
            engine
                .taps
                .lock()
                .module_histograms
                .insert(self.nodes[idx].position, hist);
        }
    }

    /// Terminal-stage collection: live samples, the primary picker and
    /// the display histogram, plus the finished signals.
    fn collect_terminal(&self, engine: &Engine, pos: usize, buf: &PixBuf, roi_out: &Roi) {
        if self.nodes[pos - 1].module.op() != OP_GAMMA {
            return;
        }
        let (attached, leaving, focus_is_colorout, want_pick, point, area, restrict) = {
            let gui = engine.gui.lock();
            let focus_is_colorout = gui
                .focus
                .and_then(|f| engine.modules.get(f))
                .map(|m| m.op() == OP_COLOROUT)
                .unwrap_or(false);
            (
                gui.attached,
                gui.leaving,
                focus_is_colorout,
                gui.request_color_pick,
                gui.picker_point,
                gui.picker_box,
                gui.restrict_histogram,
            )
        };
        if !attached || leaving {
            return;
        }

        if self.pipe_type() == PipeType::Preview {
            {
                let pixels = roi_slice(buf, roi_out);
                let mut records = engine.taps.lock();

                let mut samples = std::mem::take(&mut records.live_samples);
                for sample in &mut samples {
                    if sample.locked {
                        continue;
                    }
                    sample.rgb = taps::picker(pixels, roi_out, sample.point, sample.area);
                    sample.lab = taps::picked_to_lab(&sample.rgb);
                }
                records.live_samples = samples;

                if focus_is_colorout && want_pick {
                    records.primary_rgb = taps::picker(pixels, roi_out, point, area);
                    records.primary_lab = taps::picked_to_lab(&records.primary_rgb);
                }

                let restrict_box = if focus_is_colorout && want_pick && restrict {
                    Some(area.unwrap_or([point[0], point[1], point[0], point[1]]))
                } else {
                    None
                };
                records.display_histogram =
                    taps::display_histogram(pixels, roi_out, restrict_box);
            }
            engine.raise(PipeSignal::PreviewPipeFinished);
        } else {
            engine.raise(PipeSignal::UiPipeFinished);
        }
    }

    /// Debug-build sweep for non-finite floats in a freshly computed
    /// buffer, with per-channel extrema.
    fn scan_non_finite(&self, module: &Arc<dyn ImageOp>, line: &CacheLine, roi_out: &Roi) {
        if !cfg!(debug_assertions) || module.op() == OP_GAMMA {
            return;
        }
        let buffer = self.cache.reader(line);
        let mut has_nan = false;
        let mut has_inf = false;
        let mut min = [f32::MAX; 3];
        let mut max = [f32::MIN; 3];
        for (k, value) in buffer.iter().enumerate() {
            let channel = k & 3;
            if channel == 3 {
                continue;
            }
            if value.is_nan() {
                has_nan = true;
            } else if value.is_infinite() {
                has_inf = true;
            } else {
                min[channel] = min[channel].min(*value);
                max[channel] = max[channel].max(*value);
            }
        }
        if has_nan {
            tracing::warn!(target: "darkroom::nan", op = module.op(), "module outputs NaNs");
        }
        if has_inf {
            tracing::warn!(
                target: "darkroom::nan",
                op = module.op(),
                "module outputs non-finite floats"
            );
        }
        tracing::trace!(
            target: "darkroom::nan",
            op = module.op(),
            width = roi_out.width,
            height = roi_out.height,
            ?min,
            ?max,
            "output extrema"
        );
    }

    /// `process_rec` plus the final device-buffer release. The host copy
    /// is published at every level, so there is nothing left to copy,
    /// only a leftover device buffer to hand back.
    fn process_rec_and_backcopy(
        &mut self,
        engine: &Engine,
        lease: Option<&DeviceLease>,
        roi_out: &Roi,
        pos: usize,
    ) -> Result<PixBuf, ProcessError> {
        let out = self.process_rec(engine, lease, roi_out, pos)?;
        self.release_dev(lease, out.dev);
        Ok(out.buf)
    }

    /// Render `(x, y, width, height)` at `scale` and publish the result.
    pub fn process(
        &mut self,
        engine: &Engine,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        scale: f32,
    ) -> Result<(), ProcessError> {
        self.set_processing(true);
        let busy = self.busy_mutex();
        let _busy_guard = busy.lock();

        self.accel_enabled = self.config.accel_preference && !engine.devices.is_empty();
        let mut lease = if self.accel_enabled {
            Arc::clone(&engine.devices).lock(self.pipe_type())
        } else {
            None
        };
        self.devid = lease.as_ref().map(|l| l.devid()).unwrap_or(-1);
        if let Some(lease) = &lease {
            lease.device().events_reset();
        }
        tracing::debug!(
            target: "darkroom::opencl",
            pipe = ?self.pipe_type(),
            devid = self.devid,
            "process start"
        );

        let roi = Roi::new(x, y, width, height, scale);
        let pos = self.nodes.len();

        // re-entry point: late accelerator errors restart the whole pipe
        // with the accelerator disabled
        let result = loop {
            self.processed_maximum = [1.0; 3];
            if self.cache_obsolete {
                self.cache.flush();
                self.cache_obsolete = false;
            }
            self.mask_display = false;

            let run = self.process_rec_and_backcopy(engine, lease.as_ref(), &roi, pos);

            let late_failures = lease
                .as_ref()
                .map(|l| l.device().events_flush())
                .unwrap_or(0);
            let in_band_error = matches!(run, Err(ProcessError::AcceleratorTransient(_)))
                || (run.is_err() && self.accel_error);

            if late_failures > 0 || in_band_error {
                if late_failures > 0 {
                    tracing::warn!(
                        target: "darkroom::opencl",
                        failures = late_failures,
                        "late device errors detected, disabling the accelerator"
                    );
                }
                drop(lease.take());
                self.devid = -1;
                self.accel_enabled = false;
                self.accel_error = false;
                self.flush_caches();
                self.change(engine);
                continue;
            }
            break run;
        };

        drop(lease.take());
        self.devid = -1;

        match result {
            Err(err) => {
                self.set_processing(false);
                Err(err)
            }
            Ok(buf) => {
                let hash = pipeline_hash(self.image.id, &roi, std::iter::empty());
                self.publish_backbuf(buf, width, height, hash);
                self.set_processing(false);
                Ok(())
            }
        }
    }

    /// Render without the terminal display encoding, e.g. for snapshots.
    pub fn process_no_gamma(
        &mut self,
        engine: &Engine,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        scale: f32,
    ) -> Result<(), ProcessError> {
        let gamma = self
            .nodes
            .iter()
            .rposition(|piece| piece.module.op() == OP_GAMMA);
        if let Some(index) = gamma {
            self.nodes[index].enabled = false;
        }
        let result = self.process(engine, x, y, width, height, scale);
        if let Some(index) = gamma {
            self.nodes[index].enabled = true;
        }
        result
    }

    /// Is the buffer at `pos` nodes into the chain already cached for
    /// `roi`?
    pub fn is_cached(&self, roi: &Roi, pos: usize) -> bool {
        self.cache.available(self.node_hash(roi, pos))
    }
}
