//! Tabular on-policy SARSA

use std::hash::Hash;

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::trace;

use marl_core::{RLError, Result};

/// SARSA hyper-parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SarsaConfig {
    /// Number of discrete actions
    pub n_actions: usize,
    /// Step size
    pub learning_rate: f64,
    /// Discount factor
    pub gamma: f64,
    /// Probability of acting greedily
    pub e_greedy: f64,
    /// Seed for action selection
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SarsaConfig {
    fn default() -> Self {
        Self {
            n_actions: 4,
            learning_rate: 0.01,
            gamma: 0.9,
            e_greedy: 0.9,
            seed: None,
        }
    }
}

/// SARSA agent over a lazily grown Q-table
///
/// States are added on first sight with all-zero action values, so the
/// table iterates in discovery order.
#[derive(Debug, Clone)]
pub struct SarsaAgent<S> {
    config: SarsaConfig,
    q_table: IndexMap<S, Vec<f64>>,
    rng: StdRng,
}

impl<S: Eq + Hash + Clone> SarsaAgent<S> {
    /// Create a new agent with an empty table
    pub fn new(config: SarsaConfig) -> Result<Self> {
        if config.n_actions == 0 {
            return Err(RLError::invalid("n_actions must be positive"));
        }
        if !(0.0..=1.0).contains(&config.e_greedy) {
            return Err(RLError::invalid(format!("e_greedy {} outside [0, 1]", config.e_greedy)));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            q_table: IndexMap::new(),
            rng,
        })
    }

    /// Agent configuration
    #[must_use]
    pub fn config(&self) -> &SarsaConfig {
        &self.config
    }

    /// The Q-table, in state discovery order
    #[must_use]
    pub fn q_table(&self) -> &IndexMap<S, Vec<f64>> {
        &self.q_table
    }

    /// Action values of `state`, if it has been seen
    #[must_use]
    pub fn q_values(&self, state: &S) -> Option<&[f64]> {
        self.q_table.get(state).map(Vec::as_slice)
    }

    /// Epsilon-greedy action; greedy ties are broken uniformly
    pub fn choose_action(&mut self, state: &S) -> usize {
        let n_actions = self.config.n_actions;
        let greedy = self.rng.gen::<f64>() < self.config.e_greedy;
        let values = self.ensure_state(state).clone();
        if !greedy {
            return self.rng.gen_range(0..n_actions);
        }
        let best = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let ties: Vec<usize> = (0..n_actions).filter(|&a| values[a] == best).collect();
        ties.choose(&mut self.rng).copied().unwrap_or(0)
    }

    /// Update `Q(s, a)` towards `r + γ Q(s', a')`, or `r` when `next` is `None`
    ///
    /// Returns the TD error before the update.
    pub fn learn(&mut self, state: &S, action: usize, reward: f64, next: Option<(&S, usize)>) -> Result<f64> {
        let n_actions = self.config.n_actions;
        if action >= n_actions {
            return Err(RLError::invalid(format!("action {action} outside 0..{n_actions}")));
        }
        let target = match next {
            Some((next_state, next_action)) => {
                if next_action >= n_actions {
                    return Err(RLError::invalid(format!(
                        "action {next_action} outside 0..{n_actions}"
                    )));
                }
                reward + self.config.gamma * self.ensure_state(next_state)[next_action]
            }
            None => reward,
        };

        let lr = self.config.learning_rate;
        let q = &mut self.ensure_state(state)[action];
        let td_error = target - *q;
        *q += lr * td_error;
        trace!(action, reward, td_error, "sarsa update");
        Ok(td_error)
    }

    fn ensure_state(&mut self, state: &S) -> &mut Vec<f64> {
        let n_actions = self.config.n_actions;
        self.q_table
            .entry(state.clone())
            .or_insert_with(|| vec![0.0; n_actions])
    }
}
