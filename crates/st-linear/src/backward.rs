// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Host-side gradients of the affine map, computed on the rayon pool.
//!
//! The work is split into two independent passes so that no output element is
//! ever written by two tasks:
//!
//! * the input pass owns one `(b, t)` row of `dinp` per task;
//! * the weight pass owns one output channel per task, i.e. one row of
//!   `dweight` and one entry of `dbias`.
//!
//! Each task walks its reduction in a fixed order, so results do not depend on
//! the number of worker threads.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::config::LinearConfig;
use crate::error::{LinearError, LinearResult};
use crate::shape::{LinearDims, TensorView, TensorViewMut};

/// How the backward writes into the gradient buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GradMode {
    /// Add onto whatever the buffers already hold.
    #[default]
    Accumulate,
    /// Zero each owned slice before adding.
    Overwrite,
}

/// Gradient destinations for one backward call.
#[derive(Debug)]
pub struct LinearGrads<'a> {
    pub input: TensorViewMut<'a>,
    pub weight: TensorViewMut<'a>,
    pub bias: Option<TensorViewMut<'a>>,
}

/// Runs the two gradient passes, either on the global rayon pool or on a
/// dedicated one.
#[derive(Debug, Default)]
pub struct HostAccumulator {
    pool: Option<ThreadPool>,
}

impl HostAccumulator {
    /// Builds a dedicated pool when `config` asks for a thread count or for
    /// deterministic execution; otherwise the global pool is used.
    pub fn new(config: &LinearConfig) -> LinearResult<Self> {
        let threads = if config.deterministic {
            Some(1)
        } else {
            config.worker_threads
        };
        let pool = match threads {
            Some(threads) => Some(
                ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|index| format!("st-linear-backward-{index}"))
                    .build()
                    .map_err(|err| LinearError::ThreadPool(err.to_string()))?,
            ),
            None => None,
        };
        Ok(Self { pool })
    }

    /// Worker threads the passes fan out to.
    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    /// Accumulates `dinp`, `dweight` and (when present) `dbias` from `dout`.
    ///
    /// `B`, `T`, `C` and `OC` are read from `inp` and `weight`; every other
    /// view must agree with them.
    pub fn backward(
        &self,
        grads: LinearGrads<'_>,
        dout: TensorView<'_>,
        inp: TensorView<'_>,
        weight: TensorView<'_>,
        mode: GradMode,
    ) -> LinearResult<()> {
        let dims = LinearDims::from_operands(inp.shape(), weight.shape())?;
        dout.expect_shape(dims.output_shape())?;
        grads.input.expect_shape(dims.input_shape())?;
        grads.weight.expect_shape(dims.weight_shape())?;
        if let Some(bias) = &grads.bias {
            bias.expect_shape(dims.bias_shape())?;
        }

        let _span = tracing::debug_span!(
            "st.linear.backward",
            batch = dims.batch,
            time = dims.time,
            in_channels = dims.in_channels,
            out_channels = dims.out_channels,
            bias = grads.bias.is_some(),
            mode = ?mode,
        )
        .entered();

        let dinp = grads.input.into_data();
        let dweight = grads.weight.into_data();
        let dbias = grads.bias.map(TensorViewMut::into_data);
        let (dout, inp, weight) = (dout.data(), inp.data(), weight.data());

        let run = move || {
            rayon::join(
                || input_pass(dinp, dout, weight, dims, mode),
                || weight_pass(dweight, dbias, dout, inp, dims, mode),
            );
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
        debug!(threads = self.threads(), "affine backward finished");
        Ok(())
    }

    /// Slice-based variant of [`HostAccumulator::backward`] with explicit extents.
    #[allow(clippy::too_many_arguments)]
    pub fn backward_slices(
        &self,
        dinp: &mut [f32],
        dweight: &mut [f32],
        dbias: Option<&mut [f32]>,
        dout: &[f32],
        inp: &[f32],
        weight: &[f32],
        dims: LinearDims,
        mode: GradMode,
    ) -> LinearResult<()> {
        let grads = LinearGrads {
            input: TensorViewMut::new("dinp", dinp, dims.input_shape())?,
            weight: TensorViewMut::new("dweight", dweight, dims.weight_shape())?,
            bias: dbias
                .map(|dbias| TensorViewMut::new("dbias", dbias, dims.bias_shape()))
                .transpose()?,
        };
        self.backward(
            grads,
            TensorView::new("dout", dout, dims.output_shape())?,
            TensorView::new("inp", inp, dims.input_shape())?,
            TensorView::new("weight", weight, dims.weight_shape())?,
            mode,
        )
    }
}

/// Accumulating backward on the global rayon pool.
#[allow(clippy::too_many_arguments)]
pub fn backward(
    dinp: &mut [f32],
    dweight: &mut [f32],
    dbias: Option<&mut [f32]>,
    dout: &[f32],
    inp: &[f32],
    weight: &[f32],
    dims: LinearDims,
) -> LinearResult<()> {
    HostAccumulator::default().backward_slices(
        dinp,
        dweight,
        dbias,
        dout,
        inp,
        weight,
        dims,
        GradMode::Accumulate,
    )
}

// dinp[bt, i] += Σ_o weight[o, i] * dout[bt, o]
fn input_pass(dinp: &mut [f32], dout: &[f32], weight: &[f32], dims: LinearDims, mode: GradMode) {
    let c = dims.in_channels;
    let oc = dims.out_channels;
    dinp.par_chunks_mut(c)
        .zip(dout.par_chunks(oc))
        .for_each(|(dinp_row, dout_row)| {
            if mode == GradMode::Overwrite {
                dinp_row.fill(0.0);
            }
            for (weight_row, &d) in weight.chunks_exact(c).zip(dout_row) {
                for (slot, &w) in dinp_row.iter_mut().zip(weight_row) {
                    *slot += w * d;
                }
            }
        });
}

// dweight[o, i] += Σ_bt inp[bt, i] * dout[bt, o];  dbias[o] += Σ_bt dout[bt, o]
fn weight_pass(
    dweight: &mut [f32],
    dbias: Option<&mut [f32]>,
    dout: &[f32],
    inp: &[f32],
    dims: LinearDims,
    mode: GradMode,
) {
    let channels = dweight.par_chunks_mut(dims.in_channels).enumerate();
    match dbias {
        Some(dbias) => channels
            .zip(dbias.par_iter_mut())
            .for_each(|((o, dweight_row), dbias_slot)| {
                channel_grad(o, dweight_row, Some(dbias_slot), dout, inp, dims, mode)
            }),
        None => channels.for_each(|(o, dweight_row)| {
            channel_grad(o, dweight_row, None, dout, inp, dims, mode)
        }),
    }
}

fn channel_grad(
    o: usize,
    dweight_row: &mut [f32],
    mut dbias_slot: Option<&mut f32>,
    dout: &[f32],
    inp: &[f32],
    dims: LinearDims,
    mode: GradMode,
) {
    if mode == GradMode::Overwrite {
        dweight_row.fill(0.0);
        if let Some(slot) = dbias_slot.as_deref_mut() {
            *slot = 0.0;
        }
    }
    let rows = inp
        .chunks_exact(dims.in_channels)
        .zip(dout.chunks_exact(dims.out_channels));
    for (inp_row, dout_row) in rows {
        let d = dout_row[o];
        if let Some(slot) = dbias_slot.as_deref_mut() {
            *slot += d;
        }
        for (slot, &x) in dweight_row.iter_mut().zip(inp_row) {
            *slot += x * d;
        }
    }
}
