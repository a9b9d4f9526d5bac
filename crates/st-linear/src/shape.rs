// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Shape-carrying views over flat, row-major `f32` buffers.
//!
//! Buffers stay plain slices so the hot loops keep their flat-memory layout;
//! the view only pairs the slice with the extents it is expected to hold and
//! validates that pairing once, at the call boundary.

use std::fmt;

use crate::error::{LinearError, LinearResult};

/// Row-major extents of an activation `(B, T, C)`, a matrix `(R, C)` or a vector `(N)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: [usize; 3],
    rank: usize,
}

impl Shape {
    pub const fn activation(batch: usize, time: usize, channels: usize) -> Self {
        Self {
            dims: [batch, time, channels],
            rank: 3,
        }
    }

    pub const fn matrix(rows: usize, cols: usize) -> Self {
        Self {
            dims: [rows, cols, 1],
            rank: 2,
        }
    }

    pub const fn vector(len: usize) -> Self {
        Self {
            dims: [len, 1, 1],
            rank: 1,
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.rank]
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn numel(&self) -> usize {
        self.dims().iter().product()
    }

    /// Row-major strides, in elements, for each dimension.
    pub fn strides(&self) -> Vec<usize> {
        let dims = self.dims();
        let mut strides = vec![1; dims.len()];
        for axis in (0..dims.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * dims[axis + 1];
        }
        strides
    }

    fn ensure_positive(&self, label: &'static str) -> LinearResult<()> {
        if self.dims().iter().any(|&dim| dim == 0) {
            return Err(LinearError::InvalidDimensions {
                label,
                dims: self.dims().to_vec(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (index, dim) in self.dims().iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, ")")
    }
}

fn check_len(label: &'static str, len: usize, shape: Shape) -> LinearResult<()> {
    shape.ensure_positive(label)?;
    if len < shape.numel() {
        return Err(LinearError::DataLength {
            label,
            expected: shape.numel(),
            got: len,
        });
    }
    Ok(())
}

/// Read-only view of a contiguous buffer holding at least `shape.numel()` values.
#[derive(Clone, Copy, Debug)]
pub struct TensorView<'a> {
    label: &'static str,
    data: &'a [f32],
    shape: Shape,
}

impl<'a> TensorView<'a> {
    pub fn new(label: &'static str, data: &'a [f32], shape: Shape) -> LinearResult<Self> {
        check_len(label, data.len(), shape)?;
        Ok(Self {
            label,
            data: &data[..shape.numel()],
            shape,
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Exactly `shape.numel()` values; any trailing capacity is hidden.
    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    pub(crate) fn expect_shape(&self, expected: Shape) -> LinearResult<()> {
        expect_shape(self.label, self.shape, expected)
    }
}

/// Mutable counterpart of [`TensorView`].
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    label: &'static str,
    data: &'a mut [f32],
    shape: Shape,
}

impl<'a> TensorViewMut<'a> {
    pub fn new(label: &'static str, data: &'a mut [f32], shape: Shape) -> LinearResult<Self> {
        check_len(label, data.len(), shape)?;
        let numel = shape.numel();
        Ok(Self {
            label,
            data: &mut data[..numel],
            shape,
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &*self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut *self.data
    }

    pub fn into_data(self) -> &'a mut [f32] {
        self.data
    }

    pub(crate) fn expect_shape(&self, expected: Shape) -> LinearResult<()> {
        expect_shape(self.label, self.shape, expected)
    }
}

fn expect_shape(label: &'static str, got: Shape, expected: Shape) -> LinearResult<()> {
    if got != expected {
        return Err(LinearError::ShapeMismatch {
            label,
            expected,
            got,
        });
    }
    Ok(())
}

fn expect_rank(label: &'static str, shape: Shape, rank: usize) -> LinearResult<()> {
    if shape.rank() != rank {
        return Err(LinearError::RankMismatch {
            label,
            expected: rank,
            got: shape.rank(),
        });
    }
    Ok(())
}

/// Extents of one affine call: `(B, T, C) x (OC, C)^T -> (B, T, OC)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LinearDims {
    pub batch: usize,
    pub time: usize,
    pub in_channels: usize,
    pub out_channels: usize,
}

impl LinearDims {
    pub fn new(
        batch: usize,
        time: usize,
        in_channels: usize,
        out_channels: usize,
    ) -> LinearResult<Self> {
        let dims = Self {
            batch,
            time,
            in_channels,
            out_channels,
        };
        if batch == 0 || time == 0 || in_channels == 0 || out_channels == 0 {
            return Err(LinearError::InvalidDimensions {
                label: "linear",
                dims: vec![batch, time, in_channels, out_channels],
            });
        }
        Ok(dims)
    }

    /// Reads `B`, `T`, `C` from the input view and `OC` from the weight view.
    pub fn from_operands(input: Shape, weight: Shape) -> LinearResult<Self> {
        expect_rank("input", input, 3)?;
        expect_rank("weight", weight, 2)?;
        let dims = input.dims();
        let resolved = Self::new(dims[0], dims[1], dims[2], weight.dims()[0])?;
        expect_shape("weight", weight, resolved.weight_shape())?;
        Ok(resolved)
    }

    /// Flattened batch x time extent, the row count of every activation.
    pub fn rows(&self) -> usize {
        self.batch * self.time
    }

    pub fn input_shape(&self) -> Shape {
        Shape::activation(self.batch, self.time, self.in_channels)
    }

    pub fn output_shape(&self) -> Shape {
        Shape::activation(self.batch, self.time, self.out_channels)
    }

    pub fn weight_shape(&self) -> Shape {
        Shape::matrix(self.out_channels, self.in_channels)
    }

    pub fn bias_shape(&self) -> Shape {
        Shape::vector(self.out_channels)
    }
}
