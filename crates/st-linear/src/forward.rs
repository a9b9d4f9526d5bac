// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Device dispatch of `out = inp · weightᵀ + bias`.
//!
//! Every call walks the same four stages in order (stage, bind, launch, read
//! back) and each stage completes before the next one starts. The call returns
//! only after the output has landed in host memory.

use std::sync::mpsc;

use tracing::debug;

use crate::context::{capture_errors, LinearContext};
use crate::error::{DeviceStage, LinearError, LinearResult};
use crate::kernel::{ForwardParams, LaunchGrid};
use crate::shape::{LinearDims, TensorView, TensorViewMut};

impl LinearContext {
    /// Computes `out[b,t,o] = bias[o] + Σ_c inp[b,t,c] · weight[o,c]` on the device.
    ///
    /// `out` must hold `B*T*OC` values and is fully overwritten. Without a bias
    /// the kernel skips the addition, which matches a zero bias.
    pub fn forward(
        &mut self,
        out: &mut [f32],
        inp: &[f32],
        weight: &[f32],
        bias: Option<&[f32]>,
        dims: LinearDims,
    ) -> LinearResult<()> {
        let out = TensorViewMut::new("out", out, dims.output_shape())?;
        let inp = TensorView::new("inp", inp, dims.input_shape())?;
        let weight = TensorView::new("weight", weight, dims.weight_shape())?;
        let bias = bias
            .map(|bias| TensorView::new("bias", bias, dims.bias_shape()))
            .transpose()?;
        self.forward_views(out, inp, weight, bias)
    }

    /// Shape-checked variant of [`LinearContext::forward`] reading `B`, `T`,
    /// `C` and `OC` from the views.
    pub fn forward_views(
        &mut self,
        mut out: TensorViewMut<'_>,
        inp: TensorView<'_>,
        weight: TensorView<'_>,
        bias: Option<TensorView<'_>>,
    ) -> LinearResult<()> {
        let dims = LinearDims::from_operands(inp.shape(), weight.shape())?;
        out.expect_shape(dims.output_shape())?;
        if let Some(bias) = &bias {
            bias.expect_shape(dims.bias_shape())?;
        }
        self.capacity().check(dims)?;
        self.check_launch(dims)?;
        let params = ForwardParams::new(dims, bias.is_some())?;

        let _span = tracing::debug_span!(
            "st.linear.forward",
            batch = dims.batch,
            time = dims.time,
            in_channels = dims.in_channels,
            out_channels = dims.out_channels,
            bias = bias.is_some(),
        )
        .entered();

        let result = self.dispatch(
            out.data_mut(),
            inp.data(),
            weight.data(),
            bias.map(|bias| bias.data()),
            &params,
        );
        self.settle(result)
    }

    fn dispatch(
        &self,
        out: &mut [f32],
        inp: &[f32],
        weight: &[f32],
        bias: Option<&[f32]>,
        params: &ForwardParams,
    ) -> LinearResult<()> {
        self.stage_inputs(inp, weight, bias)?;
        self.bind_arguments(params)?;
        self.launch(params)?;
        self.read_output(out)
    }

    fn stage_inputs(&self, inp: &[f32], weight: &[f32], bias: Option<&[f32]>) -> LinearResult<()> {
        self.capture(DeviceStage::Transfer, || {
            self.queue()
                .write_buffer(&self.buffers.input, 0, bytemuck::cast_slice(inp));
            self.queue()
                .write_buffer(&self.buffers.weight, 0, bytemuck::cast_slice(weight));
            if let Some(bias) = bias {
                self.queue()
                    .write_buffer(&self.buffers.bias, 0, bytemuck::cast_slice(bias));
            }
            self.queue().submit(std::iter::empty());
        })?;
        self.finish();
        debug!(inp = inp.len(), weight = weight.len(), "inputs staged");
        Ok(())
    }

    fn bind_arguments(&self, params: &ForwardParams) -> LinearResult<()> {
        self.capture(DeviceStage::Bind, || {
            self.queue()
                .write_buffer(&self.buffers.params, 0, params.as_bytes());
        })
    }

    fn launch(&self, params: &ForwardParams) -> LinearResult<()> {
        let rows = params.batch * params.time;
        let grid = LaunchGrid::cover(rows, params.out_channels, self.tile_size());
        let (x, y, z) = grid.workgroups();

        self.capture(DeviceStage::Launch, || {
            let mut encoder = self
                .device()
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("st.linear.forward.encoder"),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("st.linear.forward.pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(self.pipeline());
                pass.set_bind_group(0, self.bind_group(), &[]);
                pass.dispatch_workgroups(x, y, z);
            }
            self.queue().submit(Some(encoder.finish()));
        })?;
        self.finish();
        debug!(
            global = ?grid.global,
            local = ?grid.local,
            padding = grid.padding(rows, params.out_channels),
            "forward kernel finished"
        );
        Ok(())
    }

    fn read_output(&self, out: &mut [f32]) -> LinearResult<()> {
        let bytes = (out.len() * std::mem::size_of::<f32>()) as u64;
        let (receiver, scope_error) = capture_errors(self.device(), || {
            let mut encoder = self
                .device()
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("st.linear.readback.encoder"),
                });
            encoder.copy_buffer_to_buffer(&self.buffers.output, 0, &self.buffers.staging, 0, bytes);
            self.queue().submit(Some(encoder.finish()));

            let (sender, receiver) = mpsc::channel();
            self.buffers
                .staging
                .slice(..bytes)
                .map_async(wgpu::MapMode::Read, move |result| {
                    let _ = sender.send(result);
                });
            receiver
        });
        // The map request resolves during this wait whether or not the scope failed.
        self.finish();
        let mapped = receiver.recv();

        if let Some(err) = scope_error {
            if matches!(mapped, Ok(Ok(()))) {
                self.buffers.staging.unmap();
            }
            return Err(LinearError::device(DeviceStage::Readback, err.to_string()));
        }
        match mapped {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(LinearError::device(DeviceStage::Readback, err.to_string())),
            Err(_) => {
                return Err(LinearError::device(
                    DeviceStage::Readback,
                    "map callback was dropped before completion",
                ))
            }
        }

        {
            let view = self.buffers.staging.slice(..bytes).get_mapped_range();
            out.copy_from_slice(bytemuck::cast_slice(&view[..]));
        }
        self.buffers.staging.unmap();
        Ok(())
    }
}
