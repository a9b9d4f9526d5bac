// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Tiled affine forward kernel: WGSL source, specialisation, uniforms and
//! launch geometry.

use bytemuck::{Pod, Zeroable};

use crate::error::{LinearError, LinearResult};
use crate::shape::LinearDims;

/// Unspecialised WGSL source of the forward kernel.
pub const FORWARD_WGSL: &str = include_str!("shaders/linear_forward.wgsl");

/// Tile edge baked into [`FORWARD_WGSL`].
pub const DEFAULT_TILE: u32 = 16;

/// Returns the forward kernel source with its tile edge set to `tile`.
pub fn forward_shader(tile: u32) -> LinearResult<String> {
    specialize(FORWARD_WGSL, &[("TILE", tile)])
}

/// Rewrites module-scope `const NAME: u32 = ...;` declarations.
///
/// Workgroup shape and shared-memory tile arrays both depend on the tile edge,
/// so it has to be a compile-time constant rather than a uniform.
pub fn specialize(source: &str, constants: &[(&str, u32)]) -> LinearResult<String> {
    let mut output = String::with_capacity(source.len() + constants.len() * 16);
    let mut seen = vec![false; constants.len()];

    for line in source.lines() {
        let trimmed = line.trim_start();
        let matched = constants.iter().enumerate().find(|(_, (name, _))| {
            trimmed
                .strip_prefix("const ")
                .and_then(|rest| rest.strip_prefix(name))
                .map(|rest| rest.trim_start().starts_with(':'))
                .unwrap_or(false)
        });
        match matched {
            Some((index, (name, value))) => {
                output.push_str(&line[..line.len() - trimmed.len()]);
                output.push_str(&format!("const {name}: u32 = {value}u;"));
                seen[index] = true;
            }
            None => output.push_str(line),
        }
        output.push('\n');
    }

    if let Some(index) = seen.iter().position(|hit| !hit) {
        return Err(LinearError::ShaderConstantNotFound(
            constants[index].0.to_string(),
        ));
    }
    Ok(output)
}

/// Uniform block bound at `@binding(4)`; mirrors `Params` in the WGSL source.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct ForwardParams {
    pub batch: u32,
    pub time: u32,
    pub in_channels: u32,
    pub out_channels: u32,
    pub use_bias: u32,
    _pad: [u32; 3],
}

impl ForwardParams {
    pub fn new(dims: LinearDims, use_bias: bool) -> LinearResult<Self> {
        Ok(Self {
            batch: to_u32("batch", dims.batch)?,
            time: to_u32("time", dims.time)?,
            in_channels: to_u32("in_channels", dims.in_channels)?,
            out_channels: to_u32("out_channels", dims.out_channels)?,
            use_bias: use_bias as u32,
            _pad: [0; 3],
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

fn to_u32(label: &'static str, value: usize) -> LinearResult<u32> {
    u32::try_from(value).map_err(|_| LinearError::DeviceLimit {
        label,
        required: value as u64,
        limit: u64::from(u32::MAX),
    })
}

/// Rounds `value` up to the next multiple of `tile`.
pub fn round_up(value: u32, tile: u32) -> u32 {
    assert!(tile > 0, "tile size must be positive");
    value.div_ceil(tile) * tile
}

/// 2D launch covering a `rows x cols` output with square `tile x tile` workgroups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchGrid {
    /// Invocations per axis, each a multiple of the tile edge.
    pub global: [u32; 2],
    /// Workgroup shape.
    pub local: [u32; 2],
}

impl LaunchGrid {
    pub fn cover(rows: u32, cols: u32, tile: u32) -> Self {
        Self {
            global: [round_up(rows, tile), round_up(cols, tile)],
            local: [tile, tile],
        }
    }

    /// Workgroup counts for `dispatch_workgroups`.
    pub fn workgroups(&self) -> (u32, u32, u32) {
        (
            self.global[0] / self.local[0],
            self.global[1] / self.local[1],
            1,
        )
    }

    /// Number of invocations that fall outside the true output and must not store.
    pub fn padding(&self, rows: u32, cols: u32) -> u64 {
        let launched = u64::from(self.global[0]) * u64::from(self.global[1]);
        launched - u64::from(rows) * u64::from(cols)
    }
}

/// Checks that a `tile x tile` workgroup with two shared `f32` tiles fits `limits`.
pub fn validate_tile(tile: u32, limits: &wgpu::Limits) -> LinearResult<()> {
    let invalid = |reason: String| LinearError::InvalidTile { tile, reason };
    if tile == 0 {
        return Err(invalid("tile must be positive".into()));
    }
    if tile > limits.max_compute_workgroup_size_x || tile > limits.max_compute_workgroup_size_y {
        return Err(invalid(format!(
            "workgroup edge exceeds device maximum {}x{}",
            limits.max_compute_workgroup_size_x, limits.max_compute_workgroup_size_y
        )));
    }
    let invocations = u64::from(tile) * u64::from(tile);
    if invocations > u64::from(limits.max_compute_invocations_per_workgroup) {
        return Err(invalid(format!(
            "{invocations} invocations per workgroup exceed device maximum {}",
            limits.max_compute_invocations_per_workgroup
        )));
    }
    let shared_bytes = 2 * invocations * std::mem::size_of::<f32>() as u64;
    if shared_bytes > u64::from(limits.max_compute_workgroup_storage_size) {
        return Err(invalid(format!(
            "{shared_bytes} bytes of workgroup storage exceed device maximum {}",
            limits.max_compute_workgroup_storage_size
        )));
    }
    Ok(())
}
