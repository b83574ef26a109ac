// SPDX-License-Identifier: CEPL-1.0
use thiserror::Error;

/// Failure reported by a backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuError {
    /// The device was removed or reset. Recovered by rebuilding everything.
    #[error("GPU device was removed or reset")]
    DeviceLost,
    /// The presentable surface no longer matches the window.
    #[error("presentation surface is out of date")]
    SurfaceOutdated,
    #[error("no adapter can create a device")]
    NoAdapter,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{op} failed: {reason}")]
    Call { op: &'static str, reason: String },
}

impl GpuError {
    pub fn call(op: &'static str, reason: impl ToString) -> Self {
        GpuError::Call {
            op,
            reason: reason.to_string(),
        }
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, GpuError::DeviceLost)
    }
}

pub type GpuResult<T> = Result<T, GpuError>;

/// How the orchestrator classified a failure.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer initialization failed")]
    Initialization(#[source] GpuError),
    /// A non-device-loss failure, or a second failure while recovering.
    #[error("unrecoverable GPU failure")]
    Fatal(#[source] GpuError),
    #[error("renderer stopped after an earlier fatal error")]
    Terminated,
}

impl RenderError {
    pub fn gpu_error(&self) -> Option<&GpuError> {
        match self {
            RenderError::Initialization(e) | RenderError::Fatal(e) => Some(e),
            RenderError::Terminated => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_is_classified() {
        assert!(GpuError::DeviceLost.is_device_lost());
        assert!(!GpuError::SurfaceOutdated.is_device_lost());
        assert!(!GpuError::call("Signal", "E_FAIL").is_device_lost());
    }

    #[test]
    fn call_error_names_the_operation() {
        let e = GpuError::call("ResizeBuffers", "out of memory");
        assert_eq!(e.to_string(), "ResizeBuffers failed: out of memory");
    }

    #[test]
    fn render_error_exposes_source() {
        let e = RenderError::Fatal(GpuError::NoAdapter);
        assert_eq!(e.gpu_error(), Some(&GpuError::NoAdapter));
        assert!(RenderError::Terminated.gpu_error().is_none());
    }
}
