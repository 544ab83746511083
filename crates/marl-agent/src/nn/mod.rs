//! Small ndarray function approximators with explicit backpropagation
//!
//! Networks expose their parameters as an ordered list of tensors. Gradients
//! are returned in the same order, which is what optimizers, gradient
//! clipping and target synchronisation iterate over.

pub mod gru;
pub mod linear;
pub mod optim;
pub mod q_network;

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD};

use marl_core::{error::ensure_dim, RLError, Result};

use crate::utils::polyak_update;

pub use gru::GruCell;
pub use linear::{Linear, Mlp, MlpTape};
pub use optim::{Adam, Optimizer, OptimizerKind, RmsProp};
pub use q_network::{AgentNetwork, AgentTape, MlpQNetwork, QNetwork, RnnQNetwork};

/// Gradients in parameter order
pub type Gradients = Vec<ArrayD<f32>>;

/// Anything with an ordered set of trainable tensors
pub trait Parameterized {
    /// Read-only views of every parameter tensor
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>>;

    /// Mutable views of every parameter tensor, same order as [`Parameterized::parameters`]
    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>>;

    /// Total number of scalar parameters
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(ArrayViewD::len).sum()
    }

    /// Copy every parameter of `other` into `self`
    fn load_parameters_from(&mut self, other: &Self) -> Result<()>
    where
        Self: Sized,
    {
        hard_update(self, other)
    }
}

/// Copy `source` parameters verbatim into `target`
pub fn hard_update<P: Parameterized + ?Sized>(target: &mut P, source: &P) -> Result<()> {
    let src = source.parameters();
    let mut dst = target.parameters_mut();
    ensure_dim(src.len(), dst.len())?;
    for (t, s) in dst.iter_mut().zip(&src) {
        ensure_same_shape(s, t)?;
        t.assign(s);
    }
    Ok(())
}

/// Polyak-average `target` towards `source`: `target = tau * source + (1 - tau) * target`
pub fn soft_update<P: Parameterized + ?Sized>(target: &mut P, source: &P, tau: f32) -> Result<()> {
    let src = source.parameters();
    let mut dst = target.parameters_mut();
    ensure_dim(src.len(), dst.len())?;
    for (t, s) in dst.iter_mut().zip(&src) {
        ensure_same_shape(s, t)?;
        t.zip_mut_with(s, |t, &s| *t = polyak_update(*t, s, tau));
    }
    Ok(())
}

fn ensure_same_shape(source: &ArrayViewD<'_, f32>, target: &ArrayViewMutD<'_, f32>) -> Result<()> {
    if source.shape() == target.shape() {
        Ok(())
    } else {
        Err(RLError::DimensionMismatch {
            expected: source.len(),
            actual: target.len(),
        })
    }
}

/// L2 norm over all gradient tensors
#[must_use]
pub fn global_norm(grads: &[ArrayD<f32>]) -> f32 {
    grads
        .iter()
        .flat_map(|g| g.iter())
        .map(|&v| v * v)
        .sum::<f32>()
        .sqrt()
}

/// Rescale `grads` in place so their global norm is at most `max_norm`
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut [ArrayD<f32>], max_norm: f32) -> f32 {
    let norm = global_norm(grads);
    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        for g in grads.iter_mut() {
            g.mapv_inplace(|v| v * coef);
        }
    }
    norm
}
