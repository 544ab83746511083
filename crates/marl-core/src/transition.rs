//! Per-agent transitions and the sampled batches built from them

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// One agent's `(o, u, r, o')` at a single time step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTransition {
    /// Current observation
    pub observation: Array1<f32>,
    /// Action taken (one-hot or continuous vector)
    pub action: Array1<f32>,
    /// Reward received
    pub reward: f32,
    /// Next observation
    pub next_observation: Array1<f32>,
}

/// All agents' transitions for one environment step, ordered by agent id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointTransition {
    /// Observations, one per agent
    pub observations: Vec<Array1<f32>>,
    /// Actions, one per agent
    pub actions: Vec<Array1<f32>>,
    /// Rewards, one per agent
    pub rewards: Vec<f32>,
    /// Next observations, one per agent
    pub next_observations: Vec<Array1<f32>>,
}

impl JointTransition {
    /// Number of agents described by this transition
    #[must_use]
    pub fn n_agents(&self) -> usize {
        self.observations.len()
    }

    /// Split into the transition of a single agent
    #[must_use]
    pub fn agent(&self, agent_id: usize) -> Option<AgentTransition> {
        Some(AgentTransition {
            observation: self.observations.get(agent_id)?.clone(),
            action: self.actions.get(agent_id)?.clone(),
            reward: *self.rewards.get(agent_id)?,
            next_observation: self.next_observations.get(agent_id)?.clone(),
        })
    }
}

/// Stacked copy of one agent's fields at the sampled indices
#[derive(Debug, Clone, PartialEq)]
pub struct AgentBatch {
    /// `[batch, obs_dim]`
    pub observations: Array2<f32>,
    /// `[batch, action_dim]`
    pub actions: Array2<f32>,
    /// `[batch]`
    pub rewards: Array1<f32>,
    /// `[batch, obs_dim]`
    pub next_observations: Array2<f32>,
}

/// Batch of transitions sampled from a [`crate::CircularReplayBuffer`]
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionBatch {
    /// Slot index behind each batch row
    pub indices: Vec<usize>,
    /// Per-agent stacked fields, ordered by agent id
    pub agents: Vec<AgentBatch>,
}

impl TransitionBatch {
    /// Number of rows in the batch
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Check if the batch has no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Row `row` of the batch as a joint transition
    #[must_use]
    pub fn row(&self, row: usize) -> Option<JointTransition> {
        if row >= self.len() {
            return None;
        }
        Some(JointTransition {
            observations: self.agents.iter().map(|a| a.observations.row(row).to_owned()).collect(),
            actions: self.agents.iter().map(|a| a.actions.row(row).to_owned()).collect(),
            rewards: self.agents.iter().map(|a| a.rewards[row]).collect(),
            next_observations: self
                .agents
                .iter()
                .map(|a| a.next_observations.row(row).to_owned())
                .collect(),
        })
    }
}
