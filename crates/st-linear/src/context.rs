// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Long-lived device state for the affine forward kernel.
//!
//! A [`LinearContext`] owns the compiled pipeline, one set of device buffers
//! sized for the largest call it will serve, and the bind group tying them
//! together. Contexts are explicit values: several may share one device, and
//! dropping a context releases its buffers.

use std::sync::Arc;

use tracing::{debug, error, info};
use wgpu::{BindGroup, BindGroupLayout, Buffer, BufferUsages, ComputePipeline, Device, Queue};

use crate::config::{FailurePolicy, LinearConfig};
use crate::error::{DeviceStage, LinearError, LinearResult};
use crate::kernel::{self, ForwardParams};
use crate::shape::LinearDims;

/// Largest extents a context reserves device memory for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinearCapacity {
    /// Maximum `B * T`.
    pub rows: usize,
    pub in_channels: usize,
    pub out_channels: usize,
}

impl LinearCapacity {
    pub fn new(rows: usize, in_channels: usize, out_channels: usize) -> LinearResult<Self> {
        if rows == 0 || in_channels == 0 || out_channels == 0 {
            return Err(LinearError::InvalidDimensions {
                label: "capacity",
                dims: vec![rows, in_channels, out_channels],
            });
        }
        Ok(Self {
            rows,
            in_channels,
            out_channels,
        })
    }

    /// Capacity that fits exactly one call shape.
    pub fn for_dims(dims: LinearDims) -> Self {
        Self {
            rows: dims.rows(),
            in_channels: dims.in_channels,
            out_channels: dims.out_channels,
        }
    }

    pub fn input_len(&self) -> usize {
        self.rows * self.in_channels
    }

    pub fn weight_len(&self) -> usize {
        self.out_channels * self.in_channels
    }

    pub fn output_len(&self) -> usize {
        self.rows * self.out_channels
    }

    pub fn fits(&self, dims: LinearDims) -> bool {
        self.check(dims).is_ok()
    }

    pub(crate) fn check(&self, dims: LinearDims) -> LinearResult<()> {
        let checks = [
            ("input", dims.rows() * dims.in_channels, self.input_len()),
            ("weight", dims.out_channels * dims.in_channels, self.weight_len()),
            ("bias", dims.out_channels, self.out_channels),
            ("output", dims.rows() * dims.out_channels, self.output_len()),
        ];
        for (label, required, capacity) in checks {
            if required > capacity {
                return Err(LinearError::CapacityExceeded {
                    label,
                    required,
                    capacity,
                });
            }
        }
        Ok(())
    }
}

pub(crate) struct DeviceBuffers {
    pub(crate) input: Buffer,
    pub(crate) weight: Buffer,
    pub(crate) bias: Buffer,
    pub(crate) output: Buffer,
    pub(crate) staging: Buffer,
    pub(crate) params: Buffer,
}

impl DeviceBuffers {
    fn allocate(device: &Device, capacity: &LinearCapacity) -> Self {
        let storage_in = BufferUsages::STORAGE | BufferUsages::COPY_DST;
        Self {
            input: f32_buffer(device, "st.linear.input", capacity.input_len(), storage_in),
            weight: f32_buffer(device, "st.linear.weight", capacity.weight_len(), storage_in),
            bias: f32_buffer(device, "st.linear.bias", capacity.out_channels, storage_in),
            output: f32_buffer(
                device,
                "st.linear.output",
                capacity.output_len(),
                BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            ),
            staging: f32_buffer(
                device,
                "st.linear.staging",
                capacity.output_len(),
                BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            ),
            params: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("st.linear.params"),
                size: std::mem::size_of::<ForwardParams>() as u64,
                usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
        }
    }

    fn destroy(&self) {
        for buffer in [
            &self.input,
            &self.weight,
            &self.bias,
            &self.output,
            &self.staging,
            &self.params,
        ] {
            buffer.destroy();
        }
    }
}

fn f32_buffer(device: &Device, label: &str, elements: usize, usage: BufferUsages) -> Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: (elements * std::mem::size_of::<f32>()) as u64,
        usage,
        mapped_at_creation: false,
    })
}

/// Runs `op` inside validation and out-of-memory error scopes.
pub(crate) fn capture_errors<T>(device: &Device, op: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = op();
    let validation = pollster::block_on(device.pop_error_scope());
    let out_of_memory = pollster::block_on(device.pop_error_scope());
    (value, validation.or(out_of_memory))
}

/// Device, compiled forward pipeline and persistent buffers for one layer
/// family.
pub struct LinearContext {
    device: Arc<Device>,
    queue: Arc<Queue>,
    pipeline: ComputePipeline,
    bind_group: BindGroup,
    pub(crate) buffers: DeviceBuffers,
    capacity: LinearCapacity,
    config: LinearConfig,
}

impl LinearContext {
    /// Acquires a high-performance adapter and builds a context on a fresh device.
    pub fn new(capacity: LinearCapacity, config: LinearConfig) -> LinearResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(LinearError::NoAdapter)?;

        let adapter_info = adapter.get_info();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("st.linear.device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
            },
            None,
        ))
        .map_err(|err| LinearError::RequestDevice(err.to_string()))?;

        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            "acquired device for affine forward"
        );
        Self::with_device(Arc::new(device), Arc::new(queue), capacity, config)
    }

    /// Builds a context on an existing device, e.g. to share it between layers.
    pub fn with_device(
        device: Arc<Device>,
        queue: Arc<Queue>,
        capacity: LinearCapacity,
        config: LinearConfig,
    ) -> LinearResult<Self> {
        LinearCapacity::new(capacity.rows, capacity.in_channels, capacity.out_channels)?;
        let limits = device.limits();
        kernel::validate_tile(config.tile_size, &limits)?;
        validate_capacity(&capacity, config.tile_size, &limits)?;

        let source = kernel::forward_shader(config.tile_size)?;
        let layout = bind_group_layout(&device);
        let (pipeline, shader_error) = capture_errors(&device, || {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("st.linear.forward.shader"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("st.linear.forward.pipeline_layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("st.linear.forward.pipeline"),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: "main",
                compilation_options: Default::default(),
            })
        });
        if let Some(err) = shader_error {
            return Err(LinearError::Shader(err.to_string()));
        }

        let (buffers, alloc_error) =
            capture_errors(&device, || DeviceBuffers::allocate(&device, &capacity));
        if let Some(err) = alloc_error {
            return Err(LinearError::RequestDevice(err.to_string()));
        }
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("st.linear.forward.bind_group"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffers.input.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffers.weight.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.bias.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: buffers.output.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: buffers.params.as_entire_binding(),
                },
            ],
        });

        info!(
            tile = config.tile_size,
            rows = capacity.rows,
            in_channels = capacity.in_channels,
            out_channels = capacity.out_channels,
            "affine forward context ready"
        );
        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group,
            buffers,
            capacity,
            config,
        })
    }

    pub fn device(&self) -> &Device {
        self.device.as_ref()
    }

    pub fn queue(&self) -> &Queue {
        self.queue.as_ref()
    }

    /// Shared handles for building further contexts on the same device.
    pub fn shared_device(&self) -> (Arc<Device>, Arc<Queue>) {
        (Arc::clone(&self.device), Arc::clone(&self.queue))
    }

    pub fn capacity(&self) -> LinearCapacity {
        self.capacity
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn tile_size(&self) -> u32 {
        self.config.tile_size
    }

    pub fn set_failure_policy(&mut self, policy: FailurePolicy) {
        self.config.failure_policy = policy;
    }

    pub(crate) fn pipeline(&self) -> &ComputePipeline {
        &self.pipeline
    }

    pub(crate) fn bind_group(&self) -> &BindGroup {
        &self.bind_group
    }

    pub(crate) fn capture<T>(
        &self,
        stage: DeviceStage,
        op: impl FnOnce() -> T,
    ) -> LinearResult<T> {
        let (value, err) = capture_errors(&self.device, op);
        match err {
            Some(err) => Err(LinearError::device(stage, err.to_string())),
            None => Ok(value),
        }
    }

    /// Checks that the grid for `dims` can be dispatched on this device.
    ///
    /// Capacity bounds element counts, not extents, so a reshaped call may need
    /// more row workgroups than the capacity itself.
    pub(crate) fn check_launch(&self, dims: LinearDims) -> LinearResult<()> {
        check_workgroups(
            dims.rows(),
            dims.out_channels,
            self.config.tile_size,
            &self.device.limits(),
        )
    }

    /// Blocks until every submission on the queue has completed.
    pub(crate) fn finish(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }

    /// Applies the failure policy to the outcome of a forward call.
    pub(crate) fn settle(&self, result: LinearResult<()>) -> LinearResult<()> {
        match result {
            Err(err)
                if err.is_device_failure()
                    && self.config.failure_policy == FailurePolicy::Abort =>
            {
                error!(stage = ?err.stage(), "fatal device failure in affine forward: {err}");
                eprintln!("error: {err}");
                std::process::exit(1);
            }
            other => other,
        }
    }
}

impl Drop for LinearContext {
    fn drop(&mut self) {
        self.buffers.destroy();
        debug!("affine forward context released");
    }
}

impl std::fmt::Debug for LinearContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearContext")
            .field("capacity", &self.capacity)
            .field("config", &self.config)
            .finish()
    }
}

fn validate_capacity(
    capacity: &LinearCapacity,
    tile: u32,
    limits: &wgpu::Limits,
) -> LinearResult<()> {
    let binding_limit = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
    let buffers = [
        ("input buffer", capacity.input_len()),
        ("weight buffer", capacity.weight_len()),
        ("output buffer", capacity.output_len()),
    ];
    for (label, elements) in buffers {
        let bytes = (elements * std::mem::size_of::<f32>()) as u64;
        if bytes > binding_limit {
            return Err(LinearError::DeviceLimit {
                label,
                required: bytes,
                limit: binding_limit,
            });
        }
    }

    check_workgroups(capacity.rows, capacity.out_channels, tile, limits)
}

/// Rejects a `rows x cols` launch whose workgroup count exceeds the per-dimension limit.
pub(crate) fn check_workgroups(
    rows: usize,
    cols: usize,
    tile: u32,
    limits: &wgpu::Limits,
) -> LinearResult<()> {
    let max_groups = u64::from(limits.max_compute_workgroups_per_dimension);
    let tile = tile.max(1) as usize;
    for (label, extent) in [("row workgroups", rows), ("column workgroups", cols)] {
        let groups = extent.div_ceil(tile) as u64;
        if groups > max_groups {
            return Err(LinearError::DeviceLimit {
                label,
                required: groups,
                limit: max_groups,
            });
        }
    }
    Ok(())
}

fn bind_group_layout(device: &Device) -> BindGroupLayout {
    let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("st.linear.forward.bind_layout"),
        entries: &[
            storage(0, true),
            storage(1, true),
            storage(2, true),
            storage(3, false),
            wgpu::BindGroupLayoutEntry {
                binding: 4,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
        ],
    })
}
