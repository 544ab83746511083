//! Dense layers and ReLU multi-layer perceptrons

use ndarray::{Array1, Array2, ArrayView2, ArrayViewD, ArrayViewMutD, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{Gradients, Parameterized};

/// Fully connected layer computing `x · W + b`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    /// `(in_dim, out_dim)`
    pub weight: Array2<f32>,
    /// `(out_dim,)`
    pub bias: Array1<f32>,
}

impl Linear {
    /// Xavier-initialised layer with zero bias
    pub fn new<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        Self {
            weight: xavier_init(in_dim, out_dim, rng),
            bias: Array1::zeros(out_dim),
        }
    }

    /// Input width
    #[must_use]
    pub fn in_dim(&self) -> usize {
        self.weight.nrows()
    }

    /// Output width
    #[must_use]
    pub fn out_dim(&self) -> usize {
        self.weight.ncols()
    }

    /// Forward pass over a `(rows, in_dim)` batch
    #[must_use]
    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        x.dot(&self.weight) + &self.bias
    }

    /// Gradients for `x` and the layer's weight and bias given `dL/dy`
    #[must_use]
    pub fn backward(
        &self,
        x: ArrayView2<f32>,
        grad_out: ArrayView2<f32>,
    ) -> (Array2<f32>, Array2<f32>, Array1<f32>) {
        let grad_weight = x.t().dot(&grad_out);
        let grad_bias = grad_out.sum_axis(Axis(0));
        let grad_x = grad_out.dot(&self.weight.t());
        (grad_x, grad_weight, grad_bias)
    }
}

impl Parameterized for Linear {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![self.weight.view().into_dyn(), self.bias.view().into_dyn()]
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        vec![self.weight.view_mut().into_dyn(), self.bias.view_mut().into_dyn()]
    }
}

/// Xavier initialization for weights
pub(crate) fn xavier_init<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Array2<f32> {
    let limit = (6.0 / (in_dim + out_dim) as f32).sqrt();
    Array2::from_shape_fn((in_dim, out_dim), |_| rng.gen_range(-limit..limit))
}

pub(crate) fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

/// Zero `grad` wherever the ReLU that produced `activation` was inactive
pub(crate) fn relu_backward(grad: &mut Array2<f32>, activation: &Array2<f32>) {
    grad.zip_mut_with(activation, |g, &a| {
        if a <= 0.0 {
            *g = 0.0;
        }
    });
}

/// Stack of [`Linear`] layers with ReLU between them and no output activation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    layers: Vec<Linear>,
}

/// Layer inputs recorded during a forward pass
#[derive(Debug, Clone)]
pub struct MlpTape {
    inputs: Vec<Array2<f32>>,
}

impl Mlp {
    /// Build from layer widths `[in, hidden.., out]`
    ///
    /// # Panics
    /// If fewer than two widths are given.
    pub fn new<R: Rng + ?Sized>(dims: &[usize], rng: &mut R) -> Self {
        assert!(dims.len() >= 2, "an MLP needs an input and an output width");
        let layers = dims
            .windows(2)
            .map(|w| Linear::new(w[0], w[1], rng))
            .collect();
        Self { layers }
    }

    /// Input width
    #[must_use]
    pub fn in_dim(&self) -> usize {
        self.layers.first().map_or(0, Linear::in_dim)
    }

    /// Output width
    #[must_use]
    pub fn out_dim(&self) -> usize {
        self.layers.last().map_or(0, Linear::out_dim)
    }

    /// Forward pass without recording
    #[must_use]
    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        self.forward_tape(x).0
    }

    /// Forward pass that records what [`Mlp::backward`] needs
    #[must_use]
    pub fn forward_tape(&self, x: ArrayView2<f32>) -> (Array2<f32>, MlpTape) {
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut h = x.to_owned();
        for (k, layer) in self.layers.iter().enumerate() {
            if k > 0 {
                h = relu(&h);
            }
            let out = layer.forward(h.view());
            inputs.push(h);
            h = out;
        }
        (h, MlpTape { inputs })
    }

    /// Gradients for the input and every parameter given `dL/dy`
    #[must_use]
    pub fn backward(&self, tape: &MlpTape, grad_out: ArrayView2<f32>) -> (Array2<f32>, Gradients) {
        let mut per_layer = Vec::with_capacity(self.layers.len());
        let mut grad = grad_out.to_owned();
        for (k, layer) in self.layers.iter().enumerate().rev() {
            let (mut grad_x, grad_w, grad_b) = layer.backward(tape.inputs[k].view(), grad.view());
            per_layer.push((grad_w, grad_b));
            if k > 0 {
                relu_backward(&mut grad_x, &tape.inputs[k]);
            }
            grad = grad_x;
        }

        let grads = per_layer
            .into_iter()
            .rev()
            .flat_map(|(w, b)| [w.into_dyn(), b.into_dyn()])
            .collect();
        (grad, grads)
    }
}

impl Parameterized for Mlp {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        self.layers.iter().flat_map(Parameterized::parameters).collect()
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        self.layers
            .iter_mut()
            .flat_map(Parameterized::parameters_mut)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Ix1, Ix2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_linear_forward_backward() {
        let layer = Linear {
            weight: arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]),
            bias: arr1(&[0.5, -0.5]),
        };
        let x = arr2(&[[1.0, 0.0, -1.0], [2.0, 1.0, 0.0]]);
        let y = layer.forward(x.view());
        assert_eq!(y, arr2(&[[-3.5, -4.5], [5.5, 7.5]]));

        let g = arr2(&[[1.0, 0.0], [0.0, 1.0]]);
        let (gx, gw, gb) = layer.backward(x.view(), g.view());
        assert_eq!(gx, arr2(&[[1.0, 3.0, 5.0], [2.0, 4.0, 6.0]]));
        assert_eq!(gw, arr2(&[[1.0, 2.0], [0.0, 1.0], [-1.0, 0.0]]));
        assert_eq!(gb, arr1(&[1.0, 1.0]));
    }

    #[test]
    fn test_mlp_shapes_and_parameter_order() {
        let mut rng = StdRng::seed_from_u64(0);
        let mlp = Mlp::new(&[4, 16, 8, 3], &mut rng);
        assert_eq!(mlp.in_dim(), 4);
        assert_eq!(mlp.out_dim(), 3);

        let shapes: Vec<Vec<usize>> = mlp.parameters().iter().map(|p| p.shape().to_vec()).collect();
        assert_eq!(
            shapes,
            vec![vec![4, 16], vec![16], vec![16, 8], vec![8], vec![8, 3], vec![3]]
        );

        let x = Array2::from_shape_fn((5, 4), |(i, j)| (i as f32 - j as f32) * 0.1);
        let (y, tape) = mlp.forward_tape(x.view());
        assert_eq!(y.shape(), &[5, 3]);
        let (gx, grads) = mlp.backward(&tape, Array2::ones((5, 3)).view());
        assert_eq!(gx.shape(), &[5, 4]);
        for (g, p) in grads.iter().zip(mlp.parameters()) {
            assert_eq!(g.shape(), p.shape());
        }
    }

    #[test]
    fn test_mlp_gradient_descent_reduces_loss() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut mlp = Mlp::new(&[2, 16, 1], &mut rng);
        let x = Array2::from_shape_fn((16, 2), |(i, j)| ((i * 3 + j * 5) % 7) as f32 / 7.0 - 0.5);
        let target = x.map_axis(Axis(1), |r| r[0] * 2.0 - r[1]).insert_axis(Axis(1));

        let loss_of = |m: &Mlp| {
            let d = m.forward(x.view()) - &target;
            d.mapv(|v| v * v).mean().unwrap_or(0.0)
        };
        let initial = loss_of(&mlp);

        for _ in 0..1000 {
            let (y, tape) = mlp.forward_tape(x.view());
            let grad = (&y - &target) * (2.0 / y.len() as f32);
            let (_, grads) = mlp.backward(&tape, grad.view());
            for (mut p, g) in mlp.parameters_mut().into_iter().zip(&grads) {
                p.zip_mut_with(g, |p, &g| *p -= 0.1 * g);
            }
        }
        assert!(loss_of(&mlp) < initial * 0.5);
    }

    #[test]
    fn test_single_layer_mlp_matches_linear() {
        let mut rng = StdRng::seed_from_u64(4);
        let mlp = Mlp::new(&[3, 2], &mut rng);
        let layer = mlp.layers[0].clone();
        let x = arr2(&[[0.3, -0.2, 0.9]]);
        assert_eq!(mlp.forward(x.view()), layer.forward(x.view()));

        let (_, tape) = mlp.forward_tape(x.view());
        let g = arr2(&[[1.0, -1.0]]);
        let (gx, grads) = mlp.backward(&tape, g.view());
        let (lx, lw, lb) = layer.backward(x.view(), g.view());
        assert_eq!(gx, lx);
        assert_eq!(grads[0].clone().into_dimensionality::<Ix2>().unwrap(), lw);
        assert_eq!(grads[1].clone().into_dimensionality::<Ix1>().unwrap(), lb);
    }
}
