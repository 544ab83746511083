//! Value mixers: combine per-agent action values into a joint value
//!
//! Inputs are batch-major `(B, T, N)` per-agent values and an optional
//! `(B, T, S)` global state; outputs are `(B, T)` joint values.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, ArrayViewD, ArrayViewMutD, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use marl_core::{error::ensure_dim, RLError, Result};

use crate::nn::{Gradients, Mlp, MlpTape, Parameterized};

/// Value-decomposition algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Algorithm {
    /// Monotonic hypernetwork mixing
    #[default]
    Qmix,
    /// Plain sum of agent values
    Vdn,
}

impl Algorithm {
    /// Canonical upper-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qmix => "QMIX",
            Self::Vdn => "VDN",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = RLError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("QMIX") {
            Ok(Self::Qmix)
        } else if s.eq_ignore_ascii_case("VDN") {
            Ok(Self::Vdn)
        } else {
            Err(RLError::UnsupportedAlgorithm(s.to_string()))
        }
    }
}

/// Combines per-agent values into a joint value
pub trait ValueMixer: Parameterized {
    /// What a forward pass records for its backward pass
    type Tape;

    /// Joint values plus the tape needed for [`ValueMixer::backward`]
    fn forward(&self, agent_values: ArrayView3<f32>, states: Option<ArrayView3<f32>>) -> Result<(Array2<f32>, Self::Tape)>;

    /// Gradient with respect to the agent values and the mixer parameters
    /// given `dL/dQ_tot` shaped `(B, T)`
    fn backward(&self, tape: &Self::Tape, grad_total: ArrayView2<f32>) -> Result<(Array3<f32>, Gradients)>;

    /// Joint values without recording
    fn combine(&self, agent_values: ArrayView3<f32>, states: Option<ArrayView3<f32>>) -> Result<Array2<f32>> {
        Ok(self.forward(agent_values, states)?.0)
    }
}

/// VDN: `Q_tot = Σ_i Q_i`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VdnMixer;

impl Parameterized for VdnMixer {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        Vec::new()
    }
}

impl ValueMixer for VdnMixer {
    type Tape = (usize, usize, usize);

    fn forward(&self, agent_values: ArrayView3<f32>, _states: Option<ArrayView3<f32>>) -> Result<(Array2<f32>, Self::Tape)> {
        let total = agent_values.map_axis(Axis(2), |lane| lane.iter().fold(0.0, |acc, &v| acc + v));
        Ok((total, agent_values.dim()))
    }

    fn backward(&self, tape: &Self::Tape, grad_total: ArrayView2<f32>) -> Result<(Array3<f32>, Gradients)> {
        let (b, t, n) = *tape;
        ensure_dim(b, grad_total.nrows())?;
        ensure_dim(t, grad_total.ncols())?;
        let grad = Array3::from_shape_fn((b, t, n), |(i, j, _)| grad_total[[i, j]]);
        Ok((grad, Vec::new()))
    }
}

/// QMIX hypernetwork mixer
///
/// ```text
/// hidden = elu(q · |W1(s)| + b1(s))        W1: (N, H)
/// Q_tot  = hidden · |W2(s)| + b2(s)        W2: (H, 1)
/// ```
///
/// Absolute-valued mixing weights keep `∂Q_tot/∂q_i ≥ 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QmixMixer {
    n_agents: usize,
    state_dim: usize,
    hidden_dim: usize,
    hyper_w1: Mlp,
    hyper_b1: Mlp,
    hyper_w2: Mlp,
    hyper_b2: Mlp,
}

/// Intermediate values of one [`QmixMixer`] forward pass, rows flattened `b * T + t`
#[derive(Debug, Clone)]
pub struct QmixTape {
    batch: usize,
    steps: usize,
    q: Array2<f32>,
    w1_raw: Array2<f32>,
    pre: Array2<f32>,
    hidden: Array2<f32>,
    w2_raw: Array2<f32>,
    tapes: [MlpTape; 4],
}

fn elu(x: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        x.exp_m1()
    }
}

fn elu_grad(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        x.exp()
    }
}

fn abs_grad(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn rows_of(x: ArrayView3<f32>) -> Array2<f32> {
    let (b, t, f) = x.dim();
    Array2::from_shape_fn((b * t, f), |(r, j)| x[[r / t, r % t, j]])
}

impl QmixMixer {
    /// Build the hypernetworks; `hyper_layers_num` is 1 or 2
    pub fn new<R: Rng + ?Sized>(
        n_agents: usize,
        state_dim: usize,
        hidden_dim: usize,
        hyper_hidden_dim: usize,
        hyper_layers_num: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if n_agents == 0 || state_dim == 0 || hidden_dim == 0 {
            return Err(RLError::invalid("QMIX needs agents, a state and a mixing width"));
        }
        let (hyper_w1, hyper_w2) = match hyper_layers_num {
            1 => (
                Mlp::new(&[state_dim, n_agents * hidden_dim], rng),
                Mlp::new(&[state_dim, hidden_dim], rng),
            ),
            2 => (
                Mlp::new(&[state_dim, hyper_hidden_dim, n_agents * hidden_dim], rng),
                Mlp::new(&[state_dim, hyper_hidden_dim, hidden_dim], rng),
            ),
            other => {
                return Err(RLError::invalid(format!(
                    "hyper_layers_num must be 1 or 2, got {other}"
                )))
            }
        };
        Ok(Self {
            n_agents,
            state_dim,
            hidden_dim,
            hyper_w1,
            hyper_b1: Mlp::new(&[state_dim, hidden_dim], rng),
            hyper_w2,
            hyper_b2: Mlp::new(&[state_dim, hidden_dim, 1], rng),
        })
    }

    /// Number of agents mixed
    #[must_use]
    pub fn n_agents(&self) -> usize {
        self.n_agents
    }

    /// Global state width
    #[must_use]
    pub fn state_dim(&self) -> usize {
        self.state_dim
    }
}

impl Parameterized for QmixMixer {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        [&self.hyper_w1, &self.hyper_b1, &self.hyper_w2, &self.hyper_b2]
            .into_iter()
            .flat_map(Parameterized::parameters)
            .collect()
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        [
            &mut self.hyper_w1,
            &mut self.hyper_b1,
            &mut self.hyper_w2,
            &mut self.hyper_b2,
        ]
        .into_iter()
        .flat_map(Parameterized::parameters_mut)
        .collect()
    }
}

impl ValueMixer for QmixMixer {
    type Tape = QmixTape;

    fn forward(&self, agent_values: ArrayView3<f32>, states: Option<ArrayView3<f32>>) -> Result<(Array2<f32>, Self::Tape)> {
        let states = states.ok_or_else(|| RLError::invalid("QMIX mixing requires the global state"))?;
        let (b, t, n) = agent_values.dim();
        ensure_dim(self.n_agents, n)?;
        ensure_dim(b, states.dim().0)?;
        ensure_dim(t, states.dim().1)?;
        ensure_dim(self.state_dim, states.dim().2)?;

        let h = self.hidden_dim;
        let q = rows_of(agent_values);
        let s = rows_of(states);

        let (w1_raw, tape_w1) = self.hyper_w1.forward_tape(s.view());
        let (b1, tape_b1) = self.hyper_b1.forward_tape(s.view());
        let (w2_raw, tape_w2) = self.hyper_w2.forward_tape(s.view());
        let (b2, tape_b2) = self.hyper_b2.forward_tape(s.view());

        let rows = b * t;
        let mut pre = b1;
        for r in 0..rows {
            for i in 0..n {
                let qi = q[[r, i]];
                for k in 0..h {
                    pre[[r, k]] += qi * w1_raw[[r, i * h + k]].abs();
                }
            }
        }
        let hidden = pre.mapv(elu);

        let mut out = Array1::zeros(rows);
        for r in 0..rows {
            let mut acc = b2[[r, 0]];
            for k in 0..h {
                acc += hidden[[r, k]] * w2_raw[[r, k]].abs();
            }
            out[r] = acc;
        }

        let total = Array2::from_shape_fn((b, t), |(i, j)| out[i * t + j]);
        let tape = QmixTape {
            batch: b,
            steps: t,
            q,
            w1_raw,
            pre,
            hidden,
            w2_raw,
            tapes: [tape_w1, tape_b1, tape_w2, tape_b2],
        };
        Ok((total, tape))
    }

    fn backward(&self, tape: &Self::Tape, grad_total: ArrayView2<f32>) -> Result<(Array3<f32>, Gradients)> {
        let (b, t) = (tape.batch, tape.steps);
        ensure_dim(b, grad_total.nrows())?;
        ensure_dim(t, grad_total.ncols())?;
        let (n, h) = (self.n_agents, self.hidden_dim);
        let rows = b * t;

        let g = Array1::from_shape_fn(rows, |r| grad_total[[r / t, r % t]]);
        let grad_b2 = g.clone().insert_axis(Axis(1));

        let mut grad_w2 = Array2::zeros((rows, h));
        let mut grad_pre = Array2::zeros((rows, h));
        for r in 0..rows {
            for k in 0..h {
                let w2 = tape.w2_raw[[r, k]];
                grad_w2[[r, k]] = g[r] * tape.hidden[[r, k]] * abs_grad(w2);
                grad_pre[[r, k]] = g[r] * w2.abs() * elu_grad(tape.pre[[r, k]]);
            }
        }

        let mut grad_w1 = Array2::zeros((rows, n * h));
        let mut grad_q = Array2::zeros((rows, n));
        for r in 0..rows {
            for i in 0..n {
                let qi = tape.q[[r, i]];
                let mut dq = 0.0;
                for k in 0..h {
                    let w1 = tape.w1_raw[[r, i * h + k]];
                    grad_w1[[r, i * h + k]] = grad_pre[[r, k]] * qi * abs_grad(w1);
                    dq += grad_pre[[r, k]] * w1.abs();
                }
                grad_q[[r, i]] = dq;
            }
        }

        let [tape_w1, tape_b1, tape_w2, tape_b2] = &tape.tapes;
        let mut grads = self.hyper_w1.backward(tape_w1, grad_w1.view()).1;
        grads.extend(self.hyper_b1.backward(tape_b1, grad_pre.view()).1);
        grads.extend(self.hyper_w2.backward(tape_w2, grad_w2.view()).1);
        grads.extend(self.hyper_b2.backward(tape_b2, grad_b2.view()).1);

        let grad_agents = Array3::from_shape_fn((b, t, n), |(i, j, a)| grad_q[[i * t + j, a]]);
        Ok((grad_agents, grads))
    }
}

/// Mixer variant chosen by [`Algorithm`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mixer {
    /// Hypernetwork mixer
    Qmix(QmixMixer),
    /// Sum mixer
    Vdn(VdnMixer),
}

/// Tape of [`Mixer::forward`]
#[derive(Debug, Clone)]
pub enum MixerTape {
    /// From the QMIX variant
    Qmix(QmixTape),
    /// From the VDN variant: `(B, T, N)`
    Vdn((usize, usize, usize)),
}

impl Mixer {
    /// Build the mixer for `algorithm`
    pub fn new<R: Rng + ?Sized>(
        algorithm: Algorithm,
        n_agents: usize,
        state_dim: usize,
        hidden_dim: usize,
        hyper_hidden_dim: usize,
        hyper_layers_num: usize,
        rng: &mut R,
    ) -> Result<Self> {
        match algorithm {
            Algorithm::Qmix => Ok(Self::Qmix(QmixMixer::new(
                n_agents,
                state_dim,
                hidden_dim,
                hyper_hidden_dim,
                hyper_layers_num,
                rng,
            )?)),
            Algorithm::Vdn => Ok(Self::Vdn(VdnMixer)),
        }
    }

    /// Algorithm this mixer implements
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::Qmix(_) => Algorithm::Qmix,
            Self::Vdn(_) => Algorithm::Vdn,
        }
    }
}

impl Parameterized for Mixer {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        match self {
            Self::Qmix(m) => m.parameters(),
            Self::Vdn(m) => m.parameters(),
        }
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        match self {
            Self::Qmix(m) => m.parameters_mut(),
            Self::Vdn(m) => m.parameters_mut(),
        }
    }
}

impl ValueMixer for Mixer {
    type Tape = MixerTape;

    fn forward(&self, agent_values: ArrayView3<f32>, states: Option<ArrayView3<f32>>) -> Result<(Array2<f32>, Self::Tape)> {
        match self {
            Self::Qmix(m) => {
                let (total, tape) = m.forward(agent_values, states)?;
                Ok((total, MixerTape::Qmix(tape)))
            }
            Self::Vdn(m) => {
                let (total, tape) = m.forward(agent_values, states)?;
                Ok((total, MixerTape::Vdn(tape)))
            }
        }
    }

    fn backward(&self, tape: &Self::Tape, grad_total: ArrayView2<f32>) -> Result<(Array3<f32>, Gradients)> {
        match (self, tape) {
            (Self::Qmix(m), MixerTape::Qmix(tape)) => m.backward(tape, grad_total),
            (Self::Vdn(m), MixerTape::Vdn(tape)) => m.backward(tape, grad_total),
            _ => Err(RLError::Computation(
                "tape was recorded by a different mixer variant".to_string(),
            )),
        }
    }
}
