// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backward::{GradMode, HostAccumulator, LinearGrads};
use crate::context::LinearContext;
use crate::error::{LinearError, LinearResult};
use crate::host;
use crate::shape::{LinearDims, Shape, TensorView, TensorViewMut};

/// Named trainable tensor with a gradient buffer of the same shape.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    name: String,
    shape: Shape,
    value: Vec<f32>,
    grad: Vec<f32>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, shape: Shape, value: Vec<f32>) -> LinearResult<Self> {
        if value.len() != shape.numel() {
            return Err(LinearError::DataLength {
                label: "parameter",
                expected: shape.numel(),
                got: value.len(),
            });
        }
        let grad = vec![0.0; value.len()];
        Ok(Self {
            name: name.into(),
            shape,
            value,
            grad,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn value(&self) -> &[f32] {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut [f32] {
        &mut self.value
    }

    pub fn grad(&self) -> &[f32] {
        &self.grad
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// Applies `value -= lr * grad`.
    pub fn apply_step(&mut self, lr: f32) {
        for (value, grad) in self.value.iter_mut().zip(&self.grad) {
            *value -= lr * grad;
        }
    }
}

/// Fully-connected layer over `(B, T, C)` activations.
#[derive(Clone, Debug)]
pub struct Linear {
    name: String,
    in_channels: usize,
    out_channels: usize,
    weight: Parameter,
    bias: Option<Parameter>,
}

impl Linear {
    /// Draws weight and bias uniformly from `±1/√C` using a seeded generator.
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        with_bias: bool,
        seed: u64,
    ) -> LinearResult<Self> {
        if in_channels == 0 || out_channels == 0 {
            return Err(LinearError::InvalidDimensions {
                label: "linear layer",
                dims: vec![in_channels, out_channels],
            });
        }
        let bound = 1.0 / (in_channels as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        let weight = (0..out_channels * in_channels)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        let bias = with_bias.then(|| {
            (0..out_channels)
                .map(|_| rng.gen_range(-bound..bound))
                .collect()
        });
        Self::from_parts(name, in_channels, out_channels, weight, bias)
    }

    /// Wraps existing values; `weight` is `(OC, C)` row-major.
    pub fn from_parts(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        weight: Vec<f32>,
        bias: Option<Vec<f32>>,
    ) -> LinearResult<Self> {
        let name = name.into();
        let weight = Parameter::new(
            format!("{name}::weight"),
            Shape::matrix(out_channels, in_channels),
            weight,
        )?;
        let bias = bias
            .map(|bias| Parameter::new(format!("{name}::bias"), Shape::vector(out_channels), bias))
            .transpose()?;
        Ok(Self {
            name,
            in_channels,
            out_channels,
            weight,
            bias,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    pub fn dims(&self, batch: usize, time: usize) -> LinearResult<LinearDims> {
        LinearDims::new(batch, time, self.in_channels, self.out_channels)
    }

    /// Runs the forward pass on the device owned by `ctx`.
    pub fn forward(
        &self,
        ctx: &mut LinearContext,
        inp: &[f32],
        batch: usize,
        time: usize,
    ) -> LinearResult<Vec<f32>> {
        let dims = self.dims(batch, time)?;
        let mut out = vec![0.0; dims.rows() * self.out_channels];
        ctx.forward(
            &mut out,
            inp,
            &self.weight.value,
            self.bias.as_ref().map(|bias| bias.value.as_slice()),
            dims,
        )?;
        Ok(out)
    }

    pub fn forward_host(&self, inp: &[f32], batch: usize, time: usize) -> LinearResult<Vec<f32>> {
        let dims = self.dims(batch, time)?;
        let mut out = vec![0.0; dims.rows() * self.out_channels];
        host::forward(
            &mut out,
            inp,
            &self.weight.value,
            self.bias.as_ref().map(|bias| bias.value.as_slice()),
            dims,
        )?;
        Ok(out)
    }

    /// Accumulates parameter gradients and returns the gradient w.r.t. `inp`.
    pub fn backward(
        &mut self,
        accumulator: &HostAccumulator,
        inp: &[f32],
        dout: &[f32],
        batch: usize,
        time: usize,
    ) -> LinearResult<Vec<f32>> {
        let dims = self.dims(batch, time)?;
        let mut dinp = vec![0.0; dims.rows() * self.in_channels];
        let grads = LinearGrads {
            input: TensorViewMut::new("dinp", &mut dinp, dims.input_shape())?,
            weight: TensorViewMut::new(
                "dweight",
                &mut self.weight.grad,
                dims.weight_shape(),
            )?,
            bias: match self.bias.as_mut() {
                Some(bias) => Some(TensorViewMut::new(
                    "dbias",
                    &mut bias.grad,
                    dims.bias_shape(),
                )?),
                None => None,
            },
        };
        accumulator.backward(
            grads,
            TensorView::new("dout", dout, dims.output_shape())?,
            TensorView::new("inp", inp, dims.input_shape())?,
            TensorView::new("weight", &self.weight.value, dims.weight_shape())?,
            GradMode::Accumulate,
        )?;
        Ok(dinp)
    }

    pub fn zero_grad(&mut self) {
        self.visit_parameters_mut(|param| param.zero_grad());
    }

    pub fn visit_parameters(&self, mut visitor: impl FnMut(&Parameter)) {
        visitor(&self.weight);
        if let Some(bias) = &self.bias {
            visitor(bias);
        }
    }

    pub fn visit_parameters_mut(&mut self, mut visitor: impl FnMut(&mut Parameter)) {
        visitor(&mut self.weight);
        if let Some(bias) = &mut self.bias {
            visitor(bias);
        }
    }

    pub fn num_parameters(&self) -> usize {
        let mut total = 0;
        self.visit_parameters(|param| total += param.shape().numel());
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_follow_layer_naming() {
        let layer = Linear::new("proj", 4, 3, true, 7).unwrap();
        let mut names = Vec::new();
        layer.visit_parameters(|param| names.push(param.name().to_string()));
        assert_eq!(names, vec!["proj::weight", "proj::bias"]);
        assert_eq!(layer.num_parameters(), 15);
    }

    #[test]
    fn init_is_seeded_and_bounded() {
        let a = Linear::new("fc", 16, 8, false, 42).unwrap();
        let b = Linear::new("fc", 16, 8, false, 42).unwrap();
        assert_eq!(a.weight().value(), b.weight().value());
        assert!(a.bias().is_none());
        assert!(a.weight().value().iter().all(|w| w.abs() <= 0.25));
    }

    #[test]
    fn from_parts_validates_lengths() {
        let err = Linear::from_parts("fc", 3, 2, vec![0.0; 5], None).unwrap_err();
        assert!(matches!(
            err,
            LinearError::DataLength {
                expected: 6,
                got: 5,
                ..
            }
        ));
    }

    #[test]
    fn backward_accumulates_until_zeroed() {
        let mut layer =
            Linear::from_parts("fc", 2, 1, vec![1.0, -1.0], Some(vec![0.0])).unwrap();
        let acc = HostAccumulator::default();
        let inp = [1.0, 2.0];
        let dout = [3.0];

        let dinp = layer.backward(&acc, &inp, &dout, 1, 1).unwrap();
        assert_eq!(dinp, vec![3.0, -3.0]);
        layer.backward(&acc, &inp, &dout, 1, 1).unwrap();
        assert_eq!(layer.weight().grad(), &[6.0, 12.0]);
        assert_eq!(layer.bias().unwrap().grad(), &[6.0]);

        layer.zero_grad();
        assert!(layer.weight().grad().iter().all(|g| *g == 0.0));

        layer.visit_parameters_mut(|param| param.apply_step(0.5));
        assert_eq!(layer.weight().value(), &[1.0, -1.0]);
    }
}
