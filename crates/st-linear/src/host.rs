// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Host evaluation of the affine forward, partitioned by output row.

use rayon::prelude::*;

use crate::error::LinearResult;
use crate::shape::{LinearDims, TensorView, TensorViewMut};

/// `out[b,t,o] = bias[o] + Σ_c inp[b,t,c] · weight[o,c]`, overwriting `out`.
pub fn forward(
    out: &mut [f32],
    inp: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    dims: LinearDims,
) -> LinearResult<()> {
    forward_views(
        TensorViewMut::new("out", out, dims.output_shape())?,
        TensorView::new("inp", inp, dims.input_shape())?,
        TensorView::new("weight", weight, dims.weight_shape())?,
        bias.map(|bias| TensorView::new("bias", bias, dims.bias_shape()))
            .transpose()?,
    )
}

pub fn forward_views(
    out: TensorViewMut<'_>,
    inp: TensorView<'_>,
    weight: TensorView<'_>,
    bias: Option<TensorView<'_>>,
) -> LinearResult<()> {
    let dims = LinearDims::from_operands(inp.shape(), weight.shape())?;
    out.expect_shape(dims.output_shape())?;
    if let Some(bias) = &bias {
        bias.expect_shape(dims.bias_shape())?;
    }

    let c = dims.in_channels;
    let weight = weight.data();
    let bias = bias.map(|bias| bias.data());
    out.into_data()
        .par_chunks_mut(dims.out_channels)
        .zip(inp.data().par_chunks(c))
        .for_each(|(out_row, inp_row)| {
            for (o, (slot, weight_row)) in out_row.iter_mut().zip(weight.chunks_exact(c)).enumerate() {
                let mut acc = bias.map_or(0.0, |bias| bias[o]);
                for (&x, &w) in inp_row.iter().zip(weight_row) {
                    acc += x * w;
                }
                *slot = acc;
            }
        });
    Ok(())
}
