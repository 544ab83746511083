//! First-order optimizers over ordered parameter lists
//!
//! Hyper-parameters follow the PyTorch defaults. Moment buffers are created
//! on the first step and must keep the same shapes afterwards.

use ndarray::{ArrayD, ArrayViewMutD, Zip};
use serde::{Deserialize, Serialize};

use marl_core::{error::ensure_dim, RLError, Result};

/// Which optimizer to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OptimizerKind {
    /// Adam with bias correction
    #[default]
    Adam,
    /// RMSprop without momentum
    RmsProp,
}

/// Adam optimizer
#[derive(Debug, Clone)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: i32,
    m: Vec<ArrayD<f32>>,
    v: Vec<ArrayD<f32>>,
}

impl Default for Adam {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }
}

impl Adam {
    /// Apply one update with learning rate `lr`
    pub fn step(&mut self, params: Vec<ArrayViewMutD<'_, f32>>, grads: &[ArrayD<f32>], lr: f32) -> Result<()> {
        check_grads(&params, grads)?;
        init_state(&mut self.m, grads)?;
        init_state(&mut self.v, grads)?;

        self.t = self.t.saturating_add(1);
        let bc1 = 1.0 - self.beta1.powi(self.t);
        let bc2 = 1.0 - self.beta2.powi(self.t);
        let (b1, b2, eps) = (self.beta1, self.beta2, self.eps);

        for (((mut p, g), m), v) in params.into_iter().zip(grads).zip(&mut self.m).zip(&mut self.v) {
            Zip::from(&mut p).and(g).and(m).and(v).for_each(|p, &g, m, v| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bc1;
                let v_hat = *v / bc2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
        }
        Ok(())
    }
}

/// RMSprop optimizer
#[derive(Debug, Clone)]
pub struct RmsProp {
    alpha: f32,
    eps: f32,
    square_avg: Vec<ArrayD<f32>>,
}

impl Default for RmsProp {
    fn default() -> Self {
        Self {
            alpha: 0.99,
            eps: 1e-8,
            square_avg: Vec::new(),
        }
    }
}

impl RmsProp {
    /// Apply one update with learning rate `lr`
    pub fn step(&mut self, params: Vec<ArrayViewMutD<'_, f32>>, grads: &[ArrayD<f32>], lr: f32) -> Result<()> {
        check_grads(&params, grads)?;
        init_state(&mut self.square_avg, grads)?;
        let (alpha, eps) = (self.alpha, self.eps);

        for ((mut p, g), s) in params.into_iter().zip(grads).zip(&mut self.square_avg) {
            Zip::from(&mut p).and(g).and(s).for_each(|p, &g, s| {
                *s = alpha * *s + (1.0 - alpha) * g * g;
                *p -= lr * g / (s.sqrt() + eps);
            });
        }
        Ok(())
    }
}

/// Optimizer chosen at construction
#[derive(Debug, Clone)]
pub enum Optimizer {
    /// Adam
    Adam(Adam),
    /// RMSprop
    RmsProp(RmsProp),
}

impl Optimizer {
    /// Fresh optimizer of the given kind
    #[must_use]
    pub fn new(kind: OptimizerKind) -> Self {
        match kind {
            OptimizerKind::Adam => Self::Adam(Adam::default()),
            OptimizerKind::RmsProp => Self::RmsProp(RmsProp::default()),
        }
    }

    /// Kind of this optimizer
    #[must_use]
    pub fn kind(&self) -> OptimizerKind {
        match self {
            Self::Adam(_) => OptimizerKind::Adam,
            Self::RmsProp(_) => OptimizerKind::RmsProp,
        }
    }

    /// Apply one update; `params` and `grads` must be in the same order
    pub fn step(&mut self, params: Vec<ArrayViewMutD<'_, f32>>, grads: &[ArrayD<f32>], lr: f32) -> Result<()> {
        match self {
            Self::Adam(opt) => opt.step(params, grads, lr),
            Self::RmsProp(opt) => opt.step(params, grads, lr),
        }
    }
}

fn check_grads(params: &[ArrayViewMutD<'_, f32>], grads: &[ArrayD<f32>]) -> Result<()> {
    ensure_dim(params.len(), grads.len())?;
    for (p, g) in params.iter().zip(grads) {
        if p.shape() != g.shape() {
            return Err(RLError::DimensionMismatch {
                expected: p.len(),
                actual: g.len(),
            });
        }
    }
    Ok(())
}

fn init_state(state: &mut Vec<ArrayD<f32>>, grads: &[ArrayD<f32>]) -> Result<()> {
    if state.is_empty() {
        state.extend(grads.iter().map(|g| ArrayD::zeros(g.raw_dim())));
        return Ok(());
    }
    ensure_dim(state.len(), grads.len())?;
    for (s, g) in state.iter().zip(grads) {
        if s.shape() != g.shape() {
            return Err(RLError::Computation(
                "gradient shapes changed between optimizer steps".to_string(),
            ));
        }
    }
    Ok(())
}
