// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fmt;

use thiserror::Error;

use crate::shape::Shape;

/// Result alias used throughout the crate.
pub type LinearResult<T> = Result<T, LinearError>;

/// Device interaction stage that reported a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceStage {
    /// Host to device upload of input, weight or bias.
    Transfer,
    /// Writing the shape/bias uniforms consumed by the kernel.
    Bind,
    /// Encoding, submitting or waiting on the compute dispatch.
    Launch,
    /// Copying the result back into host memory.
    Readback,
}

impl DeviceStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStage::Transfer => "host-to-device transfer",
            DeviceStage::Bind => "kernel argument binding",
            DeviceStage::Launch => "kernel launch",
            DeviceStage::Readback => "device-to-host readback",
        }
    }
}

impl fmt::Display for DeviceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors emitted by the affine forward dispatcher and the host accumulator.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum LinearError {
    /// A shape or capacity was declared with a zero extent.
    #[error("{label}: dimensions must be positive, got {dims:?}")]
    InvalidDimensions {
        label: &'static str,
        dims: Vec<usize>,
    },
    /// A buffer is shorter than the shape it was paired with.
    #[error("{label} length mismatch: expected at least {expected} elements, got {got}")]
    DataLength {
        label: &'static str,
        expected: usize,
        got: usize,
    },
    /// Two views that must agree on their layout do not.
    #[error("{label}: expected shape {expected}, got {got}")]
    ShapeMismatch {
        label: &'static str,
        expected: Shape,
        got: Shape,
    },
    #[error("{label}: expected a rank-{expected} tensor, got rank {got}")]
    RankMismatch {
        label: &'static str,
        expected: usize,
        got: usize,
    },
    /// The call needs more device memory than the context reserved.
    #[error("{label} exceeds context capacity: requires {required}, capacity {capacity}")]
    CapacityExceeded {
        label: &'static str,
        required: usize,
        capacity: usize,
    },
    /// The tile size cannot be launched on the selected device.
    #[error("tile size {tile} is not supported: {reason}")]
    InvalidTile { tile: u32, reason: String },
    /// A device limit rules out the requested capacity.
    #[error("{label} requires {required} but the device allows {limit}")]
    DeviceLimit {
        label: &'static str,
        required: u64,
        limit: u64,
    },
    #[error("no compatible WGPU adapter was found")]
    NoAdapter,
    #[error("failed to acquire WGPU device: {0}")]
    RequestDevice(String),
    #[error("failed to compile affine forward shader: {0}")]
    Shader(String),
    /// A shader constant targeted for specialisation is missing from the source.
    #[error("shader constant '{0}' not found")]
    ShaderConstantNotFound(String),
    /// The device rejected one of the forward stages.
    #[error("{stage} failed: {message}")]
    Device { stage: DeviceStage, message: String },
    #[error("failed to build backward worker pool: {0}")]
    ThreadPool(String),
}

impl LinearError {
    /// Returns true for failures raised by the device rather than by the caller.
    pub fn is_device_failure(&self) -> bool {
        matches!(self, LinearError::Device { .. })
    }

    /// Stage that produced a device failure, if any.
    pub fn stage(&self) -> Option<DeviceStage> {
        match self {
            LinearError::Device { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub(crate) fn device(stage: DeviceStage, message: impl Into<String>) -> Self {
        LinearError::Device {
            stage,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_failures_carry_their_stage() {
        let err = LinearError::device(DeviceStage::Readback, "map failed");
        assert!(err.is_device_failure());
        assert_eq!(err.stage(), Some(DeviceStage::Readback));
        assert_eq!(err.to_string(), "device-to-host readback failed: map failed");
    }

    #[test]
    fn precondition_errors_are_not_device_failures() {
        let err = LinearError::DataLength {
            label: "weight",
            expected: 12,
            got: 8,
        };
        assert!(!err.is_device_failure());
        assert_eq!(err.stage(), None);
        assert_eq!(
            err.to_string(),
            "weight length mismatch: expected at least 12 elements, got 8"
        );
    }
}
