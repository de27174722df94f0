//! Error types for the darkroom pipeline core.

use thiserror::Error;

/// Failure modes of a pipeline run.
///
/// Everything surfaced by [`crate::PixelPipe::process`] and the recursive
/// processor is one of these. A failed run never publishes a partial
/// backbuf.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// A suspension point observed the shutdown bit, an image reload or a
    /// breakpoint. Never retried.
    #[error("pipeline run aborted")]
    Aborted,

    /// Accelerator allocation, copy or kernel failure. The outer driver
    /// restarts the pipe once with the accelerator disabled.
    #[error("transient accelerator failure: {0}")]
    AcceleratorTransient(String),

    /// Accelerator failure detected while draining the event queue. The
    /// pipe runs CPU-only until the caller re-enables the device.
    #[error("fatal accelerator failure ({0} failed events)")]
    AcceleratorFatal(u32),

    /// Buffer sizes or persistent records disagree with the committed
    /// state. Fatal to the current call.
    #[error("invalid pipeline state: {0}")]
    InvalidState(String),
}

/// Failures of the form persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no form {form_id} stored for image {image_id}")]
    MissingRow { image_id: i64, form_id: i64 },

    /// A payload blob does not match its declared record count or layout.
    /// Callers may recover by reloading the whole form list.
    #[error("corrupt form record: {0}")]
    Corrupt(String),
}

/// Failures of an accelerator device operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccelError {
    #[error("device buffer allocation failed ({0} bytes)")]
    Alloc(usize),

    #[error("host/device copy failed: {0}")]
    Copy(String),

    #[error("kernel invocation failed in `{0}`")]
    Kernel(&'static str),

    #[error("device synchronization failed")]
    Sync,
}

impl From<AccelError> for ProcessError {
    fn from(err: AccelError) -> Self {
        ProcessError::AcceleratorTransient(err.to_string())
    }
}
