// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Affine (fully-connected) layer primitives for SpiralTorch.
//!
//! * [`LinearContext::forward`] evaluates `out = inp · weightᵀ + bias` with a
//!   tiled WGPU compute kernel and blocks until the result is back on the host.
//! * [`HostAccumulator`] and [`backward`] accumulate `dinp`, `dweight` and
//!   `dbias` on the rayon pool.
//! * [`host::forward`] is the host reference of the forward pass.
//!
//! All tensors are flat row-major `f32` buffers: activations are `(B, T, C)`,
//! the weight is `(OC, C)` and the bias is `(OC)`.

pub mod backward;
pub mod config;
pub mod context;
pub mod error;
mod forward;
pub mod host;
pub mod kernel;
pub mod layer;
pub mod shape;
pub mod telemetry;

pub use backward::{backward, GradMode, HostAccumulator, LinearGrads};
pub use config::{FailurePolicy, LinearConfig};
pub use context::{LinearCapacity, LinearContext};
pub use error::{DeviceStage, LinearError, LinearResult};
pub use layer::{Linear, Parameter};
pub use shape::{LinearDims, Shape, TensorView, TensorViewMut};
