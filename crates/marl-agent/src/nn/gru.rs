//! Gated recurrent unit cell with backpropagation through time

use ndarray::{s, Array1, Array2, ArrayView2, ArrayViewD, ArrayViewMutD, Axis, Zip};
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

use super::{Gradients, Parameterized};

/// GRU cell with gate blocks ordered `[reset | update | new]`
///
/// ```text
/// r  = σ(x·W_ir + b_ir + h·W_hr + b_hr)
/// z  = σ(x·W_iz + b_iz + h·W_hz + b_hz)
/// n  = tanh(x·W_in + b_in + r ⊙ (h·W_hn + b_hn))
/// h' = (1 - z) ⊙ n + z ⊙ h
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GruCell {
    /// `(in_dim, 3 * hidden_dim)`
    pub w_ih: Array2<f32>,
    /// `(hidden_dim, 3 * hidden_dim)`
    pub w_hh: Array2<f32>,
    /// `(3 * hidden_dim,)`
    pub b_ih: Array1<f32>,
    /// `(3 * hidden_dim,)`
    pub b_hh: Array1<f32>,
}

/// Values from one forward step needed by [`GruCell::backward_step`]
#[derive(Debug, Clone)]
pub struct GruStep {
    x: Array2<f32>,
    h_prev: Array2<f32>,
    r: Array2<f32>,
    z: Array2<f32>,
    n: Array2<f32>,
    gh_n: Array2<f32>,
}

/// Gradient accumulators for a [`GruCell`], summed over time steps
#[derive(Debug, Clone)]
pub struct GruGrads {
    w_ih: Array2<f32>,
    w_hh: Array2<f32>,
    b_ih: Array1<f32>,
    b_hh: Array1<f32>,
}

impl GruGrads {
    /// Flatten into parameter order
    #[must_use]
    pub fn into_gradients(self) -> Gradients {
        vec![
            self.w_ih.into_dyn(),
            self.w_hh.into_dyn(),
            self.b_ih.into_dyn(),
            self.b_hh.into_dyn(),
        ]
    }
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

impl GruCell {
    /// Cell with every parameter drawn from `U(-1/√hidden, 1/√hidden)`
    pub fn new<R: Rng + ?Sized>(in_dim: usize, hidden_dim: usize, rng: &mut R) -> Self {
        let k = 1.0 / (hidden_dim.max(1) as f32).sqrt();
        let dist = Uniform::new_inclusive(-k, k);
        let mut draw = |shape: (usize, usize)| Array2::from_shape_fn(shape, |_| dist.sample(rng));
        let w_ih = draw((in_dim, 3 * hidden_dim));
        let w_hh = draw((hidden_dim, 3 * hidden_dim));
        let b_ih = draw((1, 3 * hidden_dim)).row(0).to_owned();
        let b_hh = draw((1, 3 * hidden_dim)).row(0).to_owned();
        Self { w_ih, w_hh, b_ih, b_hh }
    }

    /// Hidden state width
    #[must_use]
    pub fn hidden_dim(&self) -> usize {
        self.w_hh.nrows()
    }

    /// Input width
    #[must_use]
    pub fn in_dim(&self) -> usize {
        self.w_ih.nrows()
    }

    /// Zeroed gradient accumulators shaped like this cell
    #[must_use]
    pub fn zero_grads(&self) -> GruGrads {
        GruGrads {
            w_ih: Array2::zeros(self.w_ih.raw_dim()),
            w_hh: Array2::zeros(self.w_hh.raw_dim()),
            b_ih: Array1::zeros(self.b_ih.raw_dim()),
            b_hh: Array1::zeros(self.b_hh.raw_dim()),
        }
    }

    /// Advance the hidden state by one step
    #[must_use]
    pub fn step(&self, x: ArrayView2<f32>, h: ArrayView2<f32>) -> (Array2<f32>, GruStep) {
        let hd = self.hidden_dim();
        let gi = x.dot(&self.w_ih) + &self.b_ih;
        let gh = h.dot(&self.w_hh) + &self.b_hh;

        let r = (&gi.slice(s![.., ..hd]) + &gh.slice(s![.., ..hd])).mapv(sigmoid);
        let z = (&gi.slice(s![.., hd..2 * hd]) + &gh.slice(s![.., hd..2 * hd])).mapv(sigmoid);
        let gh_n = gh.slice(s![.., 2 * hd..]).to_owned();

        let mut n = gi.slice(s![.., 2 * hd..]).to_owned();
        Zip::from(&mut n).and(&r).and(&gh_n).for_each(|n, &r, &g| *n = (*n + r * g).tanh());

        let mut h_new = Array2::zeros(n.raw_dim());
        Zip::from(&mut h_new)
            .and(&z)
            .and(&n)
            .and(&h)
            .for_each(|out, &z, &n, &h| *out = (1.0 - z) * n + z * h);

        let cache = GruStep {
            x: x.to_owned(),
            h_prev: h.to_owned(),
            r,
            z,
            n,
            gh_n,
        };
        (h_new, cache)
    }

    /// Backpropagate `dL/dh'` through one step
    ///
    /// Accumulates parameter gradients into `grads` and returns `(dL/dx, dL/dh)`.
    #[must_use]
    pub fn backward_step(
        &self,
        cache: &GruStep,
        grad_h: ArrayView2<f32>,
        grads: &mut GruGrads,
    ) -> (Array2<f32>, Array2<f32>) {
        let hd = self.hidden_dim();
        let shape = grad_h.raw_dim();

        let mut dn_pre = Array2::zeros(shape.clone());
        Zip::from(&mut dn_pre)
            .and(&grad_h)
            .and(&cache.z)
            .and(&cache.n)
            .for_each(|o, &d, &z, &n| *o = d * (1.0 - z) * (1.0 - n * n));

        let mut dz_pre = Array2::zeros(shape.clone());
        let mut dh_direct = Array2::zeros(shape.clone());
        Zip::from(&mut dz_pre)
            .and(&mut dh_direct)
            .and(&grad_h)
            .and(&cache.z)
            .and(&cache.n)
            .and(&cache.h_prev)
            .for_each(|dz, dh, &d, &z, &n, &h| {
                *dz = d * (h - n) * z * (1.0 - z);
                *dh = d * z;
            });

        let mut dr_pre = Array2::zeros(shape.clone());
        let mut dgh_n = Array2::zeros(shape);
        Zip::from(&mut dr_pre)
            .and(&mut dgh_n)
            .and(&dn_pre)
            .and(&cache.gh_n)
            .and(&cache.r)
            .for_each(|dr, dg, &dn, &g, &r| {
                *dr = dn * g * r * (1.0 - r);
                *dg = dn * r;
            });

        let rows = grad_h.nrows();
        let mut dgi = Array2::zeros((rows, 3 * hd));
        dgi.slice_mut(s![.., ..hd]).assign(&dr_pre);
        dgi.slice_mut(s![.., hd..2 * hd]).assign(&dz_pre);
        dgi.slice_mut(s![.., 2 * hd..]).assign(&dn_pre);

        let mut dgh = dgi.clone();
        dgh.slice_mut(s![.., 2 * hd..]).assign(&dgh_n);

        grads.w_ih += &cache.x.t().dot(&dgi);
        grads.b_ih += &dgi.sum_axis(Axis(0));
        grads.w_hh += &cache.h_prev.t().dot(&dgh);
        grads.b_hh += &dgh.sum_axis(Axis(0));

        let grad_x = dgi.dot(&self.w_ih.t());
        let grad_h_prev = dh_direct + dgh.dot(&self.w_hh.t());
        (grad_x, grad_h_prev)
    }
}

impl Parameterized for GruCell {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![
            self.w_ih.view().into_dyn(),
            self.w_hh.view().into_dyn(),
            self.b_ih.view().into_dyn(),
            self.b_hh.view().into_dyn(),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        vec![
            self.w_ih.view_mut().into_dyn(),
            self.w_hh.view_mut().into_dyn(),
            self.b_ih.view_mut().into_dyn(),
            self.b_hh.view_mut().into_dyn(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Loss of a two-step unroll: `sum(c ⊙ h_2)`
    fn unrolled_loss(cell: &GruCell, xs: &[Array2<f32>], c: &Array2<f32>) -> f32 {
        let mut h = Array2::zeros((xs[0].nrows(), cell.hidden_dim()));
        for x in xs {
            h = cell.step(x.view(), h.view()).0;
        }
        (&h * c).sum()
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(5);
        let cell = GruCell::new(3, 4, &mut rng);
        let xs: Vec<Array2<f32>> = (0..2)
            .map(|t| Array2::from_shape_fn((2, 3), |(i, j)| ((i + 2 * j + 3 * t) % 5) as f32 * 0.3 - 0.6))
            .collect();
        let c = Array2::from_shape_fn((2, 4), |(i, j)| if (i + j) % 2 == 0 { 1.0 } else { -0.5 });

        let mut h = Array2::zeros((2, 4));
        let mut caches = Vec::new();
        for x in &xs {
            let (h_new, cache) = cell.step(x.view(), h.view());
            caches.push(cache);
            h = h_new;
        }
        let mut grads = cell.zero_grads();
        let mut grad_h = c.clone();
        for cache in caches.iter().rev() {
            let (_, grad_prev) = cell.backward_step(cache, grad_h.view(), &mut grads);
            grad_h = grad_prev;
        }
        let analytic = grads.into_gradients();

        let eps = 1e-2_f32;
        for (p_idx, grad) in analytic.iter().enumerate() {
            for flat in [0, grad.len() / 2, grad.len() - 1] {
                let mut plus = cell.clone();
                plus.parameters_mut()[p_idx].as_slice_mut().unwrap()[flat] += eps;
                let mut minus = cell.clone();
                minus.parameters_mut()[p_idx].as_slice_mut().unwrap()[flat] -= eps;
                let numeric = (unrolled_loss(&plus, &xs, &c) - unrolled_loss(&minus, &xs, &c)) / (2.0 * eps);
                let expected = grad.as_slice().unwrap()[flat];
                assert_abs_diff_eq!(numeric, expected, epsilon = 2e-3);
            }
        }
    }

    #[test]
    fn test_zero_update_gate_passes_candidate() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut cell = GruCell::new(2, 3, &mut rng);
        // Large negative update-gate bias drives z to zero, so h' == n.
        cell.b_ih.slice_mut(s![3..6]).fill(-50.0);
        let x = Array2::from_elem((1, 2), 0.2);
        let h = Array2::from_elem((1, 3), 0.7);
        let (h_new, cache) = cell.step(x.view(), h.view());
        for (a, b) in h_new.iter().zip(cache.n.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }
}
