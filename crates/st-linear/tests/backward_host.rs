// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use approx::{assert_abs_diff_eq, assert_relative_eq};
use rand::{rngs::StdRng, Rng, SeedableRng};
use st_linear::{
    backward, host, GradMode, HostAccumulator, LinearConfig, LinearDims, LinearError,
    LinearGrads, Shape, TensorView, TensorViewMut,
};

fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

struct Problem {
    dims: LinearDims,
    inp: Vec<f32>,
    weight: Vec<f32>,
    bias: Vec<f32>,
    dout: Vec<f32>,
}

impl Problem {
    fn random(seed: u64, batch: usize, time: usize, c: usize, oc: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let dims = LinearDims::new(batch, time, c, oc).unwrap();
        Self {
            dims,
            inp: random_vec(&mut rng, dims.rows() * c),
            weight: random_vec(&mut rng, oc * c),
            bias: random_vec(&mut rng, oc),
            dout: random_vec(&mut rng, dims.rows() * oc),
        }
    }

    fn zero_grads(&self) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        (
            vec![0.0; self.inp.len()],
            vec![0.0; self.weight.len()],
            vec![0.0; self.bias.len()],
        )
    }

    fn run(&self, acc: &HostAccumulator, mode: GradMode, grads: &mut (Vec<f32>, Vec<f32>, Vec<f32>)) {
        acc.backward_slices(
            &mut grads.0,
            &mut grads.1,
            Some(grads.2.as_mut_slice()),
            &self.dout,
            &self.inp,
            &self.weight,
            self.dims,
            mode,
        )
        .unwrap();
    }

    /// Σ out · dout in f64, so finite differences see the linear term only.
    fn loss(&self, inp: &[f32], weight: &[f32], bias: &[f32]) -> f64 {
        let mut out = vec![0.0; self.dout.len()];
        host::forward(&mut out, inp, weight, Some(bias), self.dims).unwrap();
        out.iter()
            .zip(&self.dout)
            .map(|(&o, &d)| f64::from(o) * f64::from(d))
            .sum()
    }
}

#[test]
fn identity_weight_scenario() {
    let dims = LinearDims::new(2, 2, 2, 2).unwrap();
    let inp = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
    let weight = [1.0, 0.0, 0.0, 1.0];
    let bias = [0.0, 0.0];

    let mut out = [0.0; 8];
    host::forward(&mut out, &inp, &weight, Some(&bias[..]), dims).unwrap();
    assert_eq!(out, inp);

    let dout = [1.0; 8];
    let mut dinp = [0.0; 8];
    let mut dweight = [0.0; 4];
    let mut dbias = [0.0; 2];
    backward(
        &mut dinp,
        &mut dweight,
        Some(&mut dbias[..]),
        &dout,
        &inp,
        &weight,
        dims,
    )
    .unwrap();

    assert_eq!(dinp, [1.0; 8]);
    assert_eq!(dweight, [16.0, 20.0, 16.0, 20.0]);
    assert_eq!(dbias, [4.0, 4.0]);
}

#[test]
fn gradients_match_finite_differences() {
    let problem = Problem::random(11, 2, 3, 4, 5);
    let mut grads = problem.zero_grads();
    problem.run(&HostAccumulator::default(), GradMode::Accumulate, &mut grads);
    let (dinp, dweight, dbias) = grads;

    let eps = 1e-2f32;
    let central = |plus: f64, minus: f64| ((plus - minus) / (2.0 * f64::from(eps))) as f32;

    for (index, &analytic) in dinp.iter().enumerate() {
        let mut inp = problem.inp.clone();
        inp[index] += eps;
        let plus = problem.loss(&inp, &problem.weight, &problem.bias);
        inp[index] -= 2.0 * eps;
        let minus = problem.loss(&inp, &problem.weight, &problem.bias);
        assert_abs_diff_eq!(central(plus, minus), analytic, epsilon = 1e-2);
    }

    for (index, &analytic) in dweight.iter().enumerate() {
        let mut weight = problem.weight.clone();
        weight[index] += eps;
        let plus = problem.loss(&problem.inp, &weight, &problem.bias);
        weight[index] -= 2.0 * eps;
        let minus = problem.loss(&problem.inp, &weight, &problem.bias);
        assert_abs_diff_eq!(central(plus, minus), analytic, epsilon = 1e-2);
    }

    for (index, &analytic) in dbias.iter().enumerate() {
        let mut bias = problem.bias.clone();
        bias[index] += eps;
        let plus = problem.loss(&problem.inp, &problem.weight, &bias);
        bias[index] -= 2.0 * eps;
        let minus = problem.loss(&problem.inp, &problem.weight, &bias);
        assert_abs_diff_eq!(central(plus, minus), analytic, epsilon = 1e-2);
    }
}

#[test]
fn repeated_calls_accumulate() {
    let problem = Problem::random(3, 3, 5, 7, 6);
    let acc = HostAccumulator::default();

    let mut once = problem.zero_grads();
    problem.run(&acc, GradMode::Accumulate, &mut once);

    let mut twice = problem.zero_grads();
    problem.run(&acc, GradMode::Accumulate, &mut twice);
    problem.run(&acc, GradMode::Accumulate, &mut twice);

    for (single, double) in [(&once.0, &twice.0), (&once.1, &twice.1), (&once.2, &twice.2)] {
        for (&a, &b) in single.iter().zip(double.iter()) {
            assert_relative_eq!(2.0 * a, b, epsilon = 1e-4, max_relative = 1e-4);
        }
    }
}

#[test]
fn overwrite_discards_previous_contents() {
    let problem = Problem::random(5, 2, 4, 3, 5);
    let acc = HostAccumulator::default();

    let mut fresh = problem.zero_grads();
    problem.run(&acc, GradMode::Accumulate, &mut fresh);

    let mut stale = (
        vec![9.0; problem.inp.len()],
        vec![-3.0; problem.weight.len()],
        vec![100.0; problem.bias.len()],
    );
    problem.run(&acc, GradMode::Overwrite, &mut stale);
    assert_eq!(stale, fresh);
}

#[test]
fn absent_bias_gradient_leaves_other_gradients_unchanged() {
    let problem = Problem::random(8, 1, 6, 5, 3);
    let mut with_bias = problem.zero_grads();
    problem.run(&HostAccumulator::default(), GradMode::Accumulate, &mut with_bias);

    let mut dinp = vec![0.0; problem.inp.len()];
    let mut dweight = vec![0.0; problem.weight.len()];
    backward(
        &mut dinp,
        &mut dweight,
        None,
        &problem.dout,
        &problem.inp,
        &problem.weight,
        problem.dims,
    )
    .unwrap();
    assert_eq!(dinp, with_bias.0);
    assert_eq!(dweight, with_bias.1);
}

#[test]
fn omitted_bias_matches_zero_bias_forward() {
    let problem = Problem::random(21, 2, 3, 6, 4);
    let zeros = vec![0.0; problem.bias.len()];
    let mut without = vec![f32::NAN; problem.dout.len()];
    let mut with_zero = vec![f32::NAN; problem.dout.len()];
    host::forward(&mut without, &problem.inp, &problem.weight, None, problem.dims).unwrap();
    host::forward(
        &mut with_zero,
        &problem.inp,
        &problem.weight,
        Some(zeros.as_slice()),
        problem.dims,
    )
    .unwrap();
    assert_eq!(without, with_zero);
}

#[test]
fn thread_count_does_not_change_results() {
    let problem = Problem::random(13, 4, 9, 17, 11);

    let sequential = HostAccumulator::new(&LinearConfig::default().with_deterministic(true)).unwrap();
    let pooled = HostAccumulator::new(&LinearConfig::default().with_worker_threads(4)).unwrap();

    let mut a = problem.zero_grads();
    problem.run(&sequential, GradMode::Accumulate, &mut a);
    let mut b = problem.zero_grads();
    problem.run(&pooled, GradMode::Accumulate, &mut b);
    let mut c = problem.zero_grads();
    problem.run(&HostAccumulator::default(), GradMode::Accumulate, &mut c);

    // Every element is reduced by exactly one task in a fixed order.
    assert_eq!(a, b);
    assert_eq!(a, c);
}

#[test]
fn view_shapes_are_validated() {
    let problem = Problem::random(1, 2, 2, 3, 4);
    let acc = HostAccumulator::default();
    let (mut dinp, mut dweight, mut dbias) = problem.zero_grads();

    let err = acc
        .backward_slices(
            &mut dinp,
            &mut dweight,
            Some(dbias.as_mut_slice()),
            &problem.dout[..5],
            &problem.inp,
            &problem.weight,
            problem.dims,
            GradMode::Accumulate,
        )
        .unwrap_err();
    assert_eq!(
        err,
        LinearError::DataLength {
            label: "dout",
            expected: 16,
            got: 5,
        }
    );

    let grads = LinearGrads {
        input: TensorViewMut::new("dinp", &mut dinp, Shape::activation(2, 2, 3)).unwrap(),
        weight: TensorViewMut::new("dweight", &mut dweight, Shape::matrix(4, 3)).unwrap(),
        bias: Some(TensorViewMut::new("dbias", &mut dbias[..3], Shape::vector(3)).unwrap()),
    };
    let err = acc
        .backward(
            grads,
            TensorView::new("dout", &problem.dout, Shape::activation(2, 2, 4)).unwrap(),
            TensorView::new("inp", &problem.inp, Shape::activation(2, 2, 3)).unwrap(),
            TensorView::new("weight", &problem.weight, Shape::matrix(4, 3)).unwrap(),
            GradMode::Accumulate,
        )
        .unwrap_err();
    assert_eq!(
        err,
        LinearError::ShapeMismatch {
            label: "dbias",
            expected: Shape::vector(4),
            got: Shape::vector(3),
        }
    );
    assert!(dinp.iter().all(|&g| g == 0.0));
}
