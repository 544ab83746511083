//! Per-agent Q-networks shared by all agents
//!
//! Sequences are time-major: `(steps, rows, features)` where a row is one
//! agent of one episode. Recurrent networks start every sequence from a zero
//! hidden state; the acting hidden state used by [`QNetwork::act`] is kept
//! separately and only reset by [`QNetwork::reset_hidden`].

use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, ArrayViewD, ArrayViewMutD};
use rand::Rng;
use serde::{Deserialize, Serialize};

use marl_core::{error::ensure_dim, RLError, Result};

use super::gru::{GruCell, GruStep};
use super::linear::{relu, relu_backward, Linear, Mlp, MlpTape};
use super::{Gradients, Parameterized};

/// Function approximator mapping agent inputs to action values
pub trait QNetwork: Parameterized {
    /// What a forward pass records for its backward pass
    type Tape;

    /// Width of one agent input row
    fn input_dim(&self) -> usize;

    /// Number of discrete actions
    fn action_dim(&self) -> usize;

    /// Whether the network carries hidden state between steps
    fn is_recurrent(&self) -> bool;

    /// Action values for a `(steps, rows, input_dim)` sequence
    fn forward_sequence(&self, inputs: ArrayView3<f32>) -> (Array3<f32>, Self::Tape);

    /// Parameter gradients given `dL/dQ` shaped like the forward output
    fn backward_sequence(&self, tape: &Self::Tape, grad_out: ArrayView3<f32>) -> Result<Gradients>;

    /// Forget the acting hidden state
    fn reset_hidden(&mut self);

    /// Action values for one step of `(rows, input_dim)` inputs, advancing
    /// the acting hidden state if recurrent
    fn act(&mut self, inputs: ArrayView2<f32>) -> Array2<f32>;
}

fn flatten(x: ArrayView3<f32>) -> Array2<f32> {
    let (t, r, f) = x.dim();
    Array2::from_shape_fn((t * r, f), |(k, j)| x[[k / r, k % r, j]])
}

fn unflatten(x: &Array2<f32>, steps: usize, rows: usize) -> Array3<f32> {
    Array3::from_shape_fn((steps, rows, x.ncols()), |(s, i, j)| x[[s * rows + i, j]])
}

/// Feed-forward Q-network: `in -> H -> H -> actions` with ReLU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpQNetwork {
    mlp: Mlp,
}

/// Tape of [`MlpQNetwork::forward_sequence`]
#[derive(Debug, Clone)]
pub struct MlpSequenceTape {
    steps: usize,
    rows: usize,
    tape: MlpTape,
}

impl MlpQNetwork {
    /// Create a new MLP Q-network
    pub fn new<R: Rng + ?Sized>(input_dim: usize, hidden_dim: usize, action_dim: usize, rng: &mut R) -> Self {
        Self {
            mlp: Mlp::new(&[input_dim, hidden_dim, hidden_dim, action_dim], rng),
        }
    }
}

impl Parameterized for MlpQNetwork {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        self.mlp.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        self.mlp.parameters_mut()
    }
}

impl QNetwork for MlpQNetwork {
    type Tape = MlpSequenceTape;

    fn input_dim(&self) -> usize {
        self.mlp.in_dim()
    }

    fn action_dim(&self) -> usize {
        self.mlp.out_dim()
    }

    fn is_recurrent(&self) -> bool {
        false
    }

    fn forward_sequence(&self, inputs: ArrayView3<f32>) -> (Array3<f32>, Self::Tape) {
        let (steps, rows, _) = inputs.dim();
        let (out, tape) = self.mlp.forward_tape(flatten(inputs).view());
        (unflatten(&out, steps, rows), MlpSequenceTape { steps, rows, tape })
    }

    fn backward_sequence(&self, tape: &Self::Tape, grad_out: ArrayView3<f32>) -> Result<Gradients> {
        ensure_dim(tape.steps, grad_out.dim().0)?;
        ensure_dim(tape.rows, grad_out.dim().1)?;
        let (_, grads) = self.mlp.backward(&tape.tape, flatten(grad_out).view());
        Ok(grads)
    }

    fn reset_hidden(&mut self) {}

    fn act(&mut self, inputs: ArrayView2<f32>) -> Array2<f32> {
        self.mlp.forward(inputs)
    }
}

/// Recurrent Q-network: `relu(fc1) -> GRU -> fc2`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RnnQNetwork {
    fc1: Linear,
    rnn: GruCell,
    fc2: Linear,
    #[serde(skip)]
    hidden: Option<Array2<f32>>,
}

#[derive(Debug, Clone)]
struct RnnStepTape {
    input: Array2<f32>,
    activation: Array2<f32>,
    gru: GruStep,
    hidden: Array2<f32>,
}

/// Tape of [`RnnQNetwork::forward_sequence`], one entry per step
#[derive(Debug, Clone)]
pub struct RnnTape {
    steps: Vec<RnnStepTape>,
}

impl RnnQNetwork {
    /// Create a new recurrent Q-network
    pub fn new<R: Rng + ?Sized>(input_dim: usize, hidden_dim: usize, action_dim: usize, rng: &mut R) -> Self {
        Self {
            fc1: Linear::new(input_dim, hidden_dim, rng),
            rnn: GruCell::new(hidden_dim, hidden_dim, rng),
            fc2: Linear::new(hidden_dim, action_dim, rng),
            hidden: None,
        }
    }

    /// Width of the recurrent state
    #[must_use]
    pub fn hidden_dim(&self) -> usize {
        self.rnn.hidden_dim()
    }

    /// Current acting hidden state, if any step has been taken
    #[must_use]
    pub fn hidden(&self) -> Option<&Array2<f32>> {
        self.hidden.as_ref()
    }

    fn step(&self, x: ArrayView2<f32>, h: ArrayView2<f32>) -> (Array2<f32>, RnnStepTape) {
        let activation = relu(&self.fc1.forward(x));
        let (hidden, gru) = self.rnn.step(activation.view(), h);
        let q = self.fc2.forward(hidden.view());
        let tape = RnnStepTape {
            input: x.to_owned(),
            activation,
            gru,
            hidden,
        };
        (q, tape)
    }
}

impl Parameterized for RnnQNetwork {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut params = self.fc1.parameters();
        params.extend(self.rnn.parameters());
        params.extend(self.fc2.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut params = self.fc1.parameters_mut();
        params.extend(self.rnn.parameters_mut());
        params.extend(self.fc2.parameters_mut());
        params
    }
}

impl QNetwork for RnnQNetwork {
    type Tape = RnnTape;

    fn input_dim(&self) -> usize {
        self.fc1.in_dim()
    }

    fn action_dim(&self) -> usize {
        self.fc2.out_dim()
    }

    fn is_recurrent(&self) -> bool {
        true
    }

    fn forward_sequence(&self, inputs: ArrayView3<f32>) -> (Array3<f32>, Self::Tape) {
        let (steps, rows, _) = inputs.dim();
        let mut out = Array3::zeros((steps, rows, self.action_dim()));
        let mut tapes = Vec::with_capacity(steps);
        let mut h = Array2::zeros((rows, self.hidden_dim()));
        for (t, x) in inputs.outer_iter().enumerate() {
            let (q, tape) = self.step(x, h.view());
            out.index_axis_mut(ndarray::Axis(0), t).assign(&q);
            h = tape.hidden.clone();
            tapes.push(tape);
        }
        (out, RnnTape { steps: tapes })
    }

    fn backward_sequence(&self, tape: &Self::Tape, grad_out: ArrayView3<f32>) -> Result<Gradients> {
        ensure_dim(tape.steps.len(), grad_out.dim().0)?;
        let rows = grad_out.dim().1;

        let mut fc1_w = Array2::zeros(self.fc1.weight.raw_dim());
        let mut fc1_b = Array1::zeros(self.fc1.bias.raw_dim());
        let mut fc2_w = Array2::zeros(self.fc2.weight.raw_dim());
        let mut fc2_b = Array1::zeros(self.fc2.bias.raw_dim());
        let mut gru_grads = self.rnn.zero_grads();

        let mut dh_carry = Array2::zeros((rows, self.hidden_dim()));
        for (step, grad_q) in tape.steps.iter().zip(grad_out.outer_iter()).rev() {
            ensure_dim(rows, step.hidden.nrows())?;
            let (dh, gw2, gb2) = self.fc2.backward(step.hidden.view(), grad_q);
            fc2_w += &gw2;
            fc2_b += &gb2;

            let dh = dh + &dh_carry;
            let (mut dx, dh_prev) = self.rnn.backward_step(&step.gru, dh.view(), &mut gru_grads);
            dh_carry = dh_prev;

            relu_backward(&mut dx, &step.activation);
            let (_, gw1, gb1) = self.fc1.backward(step.input.view(), dx.view());
            fc1_w += &gw1;
            fc1_b += &gb1;
        }

        let mut grads = vec![fc1_w.into_dyn(), fc1_b.into_dyn()];
        grads.extend(gru_grads.into_gradients());
        grads.push(fc2_w.into_dyn());
        grads.push(fc2_b.into_dyn());
        Ok(grads)
    }

    fn reset_hidden(&mut self) {
        self.hidden = None;
    }

    fn act(&mut self, inputs: ArrayView2<f32>) -> Array2<f32> {
        let rows = inputs.nrows();
        let h = match self.hidden.take() {
            Some(h) if h.nrows() == rows => h,
            _ => Array2::zeros((rows, self.hidden_dim())),
        };
        let (q, tape) = self.step(inputs, h.view());
        self.hidden = Some(tape.hidden);
        q
    }
}

/// Q-network variant resolved from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentNetwork {
    /// Feed-forward
    Mlp(MlpQNetwork),
    /// GRU-based
    Rnn(RnnQNetwork),
}

/// Tape of [`AgentNetwork::forward_sequence`]
#[derive(Debug, Clone)]
pub enum AgentTape {
    /// From the feed-forward variant
    Mlp(MlpSequenceTape),
    /// From the recurrent variant
    Rnn(RnnTape),
}

impl AgentNetwork {
    /// Build the recurrent or feed-forward variant
    pub fn new<R: Rng + ?Sized>(
        use_rnn: bool,
        input_dim: usize,
        hidden_dim: usize,
        action_dim: usize,
        rng: &mut R,
    ) -> Self {
        if use_rnn {
            Self::Rnn(RnnQNetwork::new(input_dim, hidden_dim, action_dim, rng))
        } else {
            Self::Mlp(MlpQNetwork::new(input_dim, hidden_dim, action_dim, rng))
        }
    }
}

impl Parameterized for AgentNetwork {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        match self {
            Self::Mlp(net) => net.parameters(),
            Self::Rnn(net) => net.parameters(),
        }
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        match self {
            Self::Mlp(net) => net.parameters_mut(),
            Self::Rnn(net) => net.parameters_mut(),
        }
    }
}

impl QNetwork for AgentNetwork {
    type Tape = AgentTape;

    fn input_dim(&self) -> usize {
        match self {
            Self::Mlp(net) => net.input_dim(),
            Self::Rnn(net) => net.input_dim(),
        }
    }

    fn action_dim(&self) -> usize {
        match self {
            Self::Mlp(net) => net.action_dim(),
            Self::Rnn(net) => net.action_dim(),
        }
    }

    fn is_recurrent(&self) -> bool {
        matches!(self, Self::Rnn(_))
    }

    fn forward_sequence(&self, inputs: ArrayView3<f32>) -> (Array3<f32>, Self::Tape) {
        match self {
            Self::Mlp(net) => {
                let (q, tape) = net.forward_sequence(inputs);
                (q, AgentTape::Mlp(tape))
            }
            Self::Rnn(net) => {
                let (q, tape) = net.forward_sequence(inputs);
                (q, AgentTape::Rnn(tape))
            }
        }
    }

    fn backward_sequence(&self, tape: &Self::Tape, grad_out: ArrayView3<f32>) -> Result<Gradients> {
        match (self, tape) {
            (Self::Mlp(net), AgentTape::Mlp(tape)) => net.backward_sequence(tape, grad_out),
            (Self::Rnn(net), AgentTape::Rnn(tape)) => net.backward_sequence(tape, grad_out),
            _ => Err(RLError::Computation(
                "tape was recorded by a different network variant".to_string(),
            )),
        }
    }

    fn reset_hidden(&mut self) {
        match self {
            Self::Mlp(net) => net.reset_hidden(),
            Self::Rnn(net) => net.reset_hidden(),
        }
    }

    fn act(&mut self, inputs: ArrayView2<f32>) -> Array2<f32> {
        match self {
            Self::Mlp(net) => net.act(inputs),
            Self::Rnn(net) => net.act(inputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{s, Axis};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn inputs(steps: usize, rows: usize, dim: usize) -> Array3<f32> {
        Array3::from_shape_fn((steps, rows, dim), |(t, r, j)| ((t * 7 + r * 3 + j) % 5) as f32 * 0.25 - 0.5)
    }

    fn weighted_sum(net: &AgentNetwork, x: &Array3<f32>, c: &Array3<f32>) -> f32 {
        (&net.forward_sequence(x.view()).0 * c).sum()
    }

    fn assert_close(a: ArrayView2<f32>, b: ArrayView2<f32>) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_sequence_matches_stepwise_acting() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut net = AgentNetwork::new(true, 4, 8, 3, &mut rng);
        let x = inputs(3, 2, 4);
        let (q, _) = net.forward_sequence(x.view());
        assert_eq!(q.dim(), (3, 2, 3));

        net.reset_hidden();
        for t in 0..3 {
            let step = net.act(x.index_axis(Axis(0), t));
            assert_close(step.view(), q.index_axis(Axis(0), t));
        }
        net.reset_hidden();
        assert_close(net.act(x.index_axis(Axis(0), 0)).view(), q.index_axis(Axis(0), 0));
    }

    #[test]
    fn test_mlp_sequence_is_rowwise() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut net = AgentNetwork::new(false, 4, 8, 3, &mut rng);
        assert!(!net.is_recurrent());
        let x = inputs(2, 3, 4);
        let (q, _) = net.forward_sequence(x.view());
        assert_close(net.act(x.slice(s![1, .., ..])).view(), q.slice(s![1, .., ..]));
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        for use_rnn in [false, true] {
            let mut rng = StdRng::seed_from_u64(2);
            let net = AgentNetwork::new(use_rnn, 3, 5, 2, &mut rng);
            let x = inputs(3, 2, 3);
            let c = Array3::from_shape_fn((3, 2, 2), |(t, r, a)| (t + r + a) as f32 * 0.3 - 0.4);

            let (_, tape) = net.forward_sequence(x.view());
            let grads = net.backward_sequence(&tape, c.view()).unwrap();
            assert_eq!(grads.len(), net.parameters().len());

            let eps = 1e-3_f32;
            for (p_idx, grad) in grads.iter().enumerate() {
                let flat = grad.len() / 2;
                let mut plus = net.clone();
                plus.parameters_mut()[p_idx].as_slice_mut().unwrap()[flat] += eps;
                let mut minus = net.clone();
                minus.parameters_mut()[p_idx].as_slice_mut().unwrap()[flat] -= eps;
                let numeric = (weighted_sum(&plus, &x, &c) - weighted_sum(&minus, &x, &c)) / (2.0 * eps);
                assert_abs_diff_eq!(numeric, grad.as_slice().unwrap()[flat], epsilon = 2e-3);
            }
        }
    }

    #[test]
    fn test_tape_variant_mismatch_is_an_error() {
        let mut rng = StdRng::seed_from_u64(3);
        let mlp = AgentNetwork::new(false, 3, 4, 2, &mut rng);
        let rnn = AgentNetwork::new(true, 3, 4, 2, &mut rng);
        let x = inputs(2, 1, 3);
        let (q, tape) = rnn.forward_sequence(x.view());
        assert!(mlp.backward_sequence(&tape, q.view()).is_err());
    }

    #[test]
    fn test_serde_skips_hidden_state() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut net = AgentNetwork::new(true, 3, 4, 2, &mut rng);
        let _ = net.act(Array2::ones((2, 3)).view());
        let json = serde_json::to_string(&net).unwrap();
        let restored: AgentNetwork = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.parameters(), net.parameters());
        match restored {
            AgentNetwork::Rnn(rnn) => assert!(rnn.hidden().is_none()),
            AgentNetwork::Mlp(_) => panic!("variant changed"),
        }
    }
}
