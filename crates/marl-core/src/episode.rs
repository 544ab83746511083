//! Episode replay for recurrent value-decomposition training
//!
//! Episodes are stored whole, padded to `episode_limit`. A sampled batch is
//! cut to the longest episode it contains; shorter episodes keep zeroed
//! padding with `active == 0`.

use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ensure_dim, RLError, Result};

/// Configuration for [`EpisodeReplayBuffer`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeBufferConfig {
    /// Maximum number of stored episodes
    pub buffer_size: usize,
    /// Number of agents
    pub n_agents: usize,
    /// Per-agent observation width
    pub obs_dim: usize,
    /// Global state width
    pub state_dim: usize,
    /// Number of discrete actions per agent
    pub action_dim: usize,
    /// Maximum episode length
    pub episode_limit: usize,
    /// Seed for sampling
    #[serde(default)]
    pub seed: Option<u64>,
}

impl EpisodeBufferConfig {
    /// Reject configurations the buffer cannot be built from
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("buffer_size", self.buffer_size),
            ("n_agents", self.n_agents),
            ("obs_dim", self.obs_dim),
            ("action_dim", self.action_dim),
            ("episode_limit", self.episode_limit),
        ] {
            if value == 0 {
                return Err(RLError::invalid(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Batch of padded episodes
///
/// `T` is `max_episode_len`. Observation-like fields carry `T + 1` steps so
/// that step `t + 1` can serve as the bootstrap input of step `t`.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeBatch {
    /// `(B, T + 1, N, obs_dim)`
    pub observations: Array4<f32>,
    /// `(B, T + 1, state_dim)`
    pub states: Array3<f32>,
    /// `(B, T + 1, N, action_dim)`, zero at `t = 0`
    pub last_onehot_actions: Array4<f32>,
    /// `(B, T, N)`
    pub actions: Array3<usize>,
    /// `(B, T)`
    pub rewards: Array2<f32>,
    /// `(B, T)`, 1.0 where the episode terminated (not truncated)
    pub dones: Array2<f32>,
    /// `(B, T)`, 1.0 for real steps, 0.0 for padding
    pub active: Array2<f32>,
    /// `T`
    pub max_episode_len: usize,
}

impl EpisodeBatch {
    /// All-zero batch of the given shape with every step inactive
    #[must_use]
    pub fn zeros(
        batch_size: usize,
        max_episode_len: usize,
        n_agents: usize,
        obs_dim: usize,
        state_dim: usize,
        action_dim: usize,
    ) -> Self {
        let (b, t, n) = (batch_size, max_episode_len, n_agents);
        Self {
            observations: Array4::zeros((b, t + 1, n, obs_dim)),
            states: Array3::zeros((b, t + 1, state_dim)),
            last_onehot_actions: Array4::zeros((b, t + 1, n, action_dim)),
            actions: Array3::zeros((b, t, n)),
            rewards: Array2::zeros((b, t)),
            dones: Array2::zeros((b, t)),
            active: Array2::zeros((b, t)),
            max_episode_len: t,
        }
    }

    /// Number of episodes in the batch
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.observations.shape()[0]
    }

    /// Number of agents
    #[must_use]
    pub fn n_agents(&self) -> usize {
        self.observations.shape()[2]
    }

    /// Check every field against the expected widths
    pub fn validate(
        &self,
        n_agents: usize,
        obs_dim: usize,
        state_dim: usize,
        action_dim: usize,
    ) -> Result<()> {
        let b = self.batch_size();
        let t = self.max_episode_len;

        let obs = self.observations.shape();
        ensure_dim(t + 1, obs[1])?;
        ensure_dim(n_agents, obs[2])?;
        ensure_dim(obs_dim, obs[3])?;

        let states = self.states.shape();
        ensure_dim(b, states[0])?;
        ensure_dim(t + 1, states[1])?;
        ensure_dim(state_dim, states[2])?;

        let last = self.last_onehot_actions.shape();
        ensure_dim(b, last[0])?;
        ensure_dim(t + 1, last[1])?;
        ensure_dim(n_agents, last[2])?;
        ensure_dim(action_dim, last[3])?;

        let actions = self.actions.shape();
        ensure_dim(b, actions[0])?;
        ensure_dim(t, actions[1])?;
        ensure_dim(n_agents, actions[2])?;
        if let Some(&a) = self.actions.iter().find(|&&a| a >= action_dim) {
            return Err(RLError::invalid(format!(
                "action {a} outside 0..{action_dim}"
            )));
        }

        for field in [&self.rewards, &self.dones, &self.active] {
            ensure_dim(b, field.shape()[0])?;
            ensure_dim(t, field.shape()[1])?;
        }
        Ok(())
    }
}

/// Anything that can hand the trainer a batch of episodes
pub trait EpisodeSource {
    /// Draw `batch_size` episodes
    fn sample_episodes(&mut self, batch_size: usize) -> Result<EpisodeBatch>;
}

/// Circular store of whole episodes
#[derive(Debug)]
pub struct EpisodeReplayBuffer {
    config: EpisodeBufferConfig,
    observations: Array4<f32>,
    states: Array3<f32>,
    last_onehot_actions: Array4<f32>,
    actions: Array3<usize>,
    rewards: Array2<f32>,
    dones: Array2<f32>,
    active: Array2<f32>,
    episode_len: Array1<usize>,
    episode_num: usize,
    current_size: usize,
    rng: StdRng,
}

impl EpisodeReplayBuffer {
    /// Create a new episode buffer
    pub fn new(config: EpisodeBufferConfig) -> Result<Self> {
        config.validate()?;
        let c = &config;
        let (cap, limit, n) = (c.buffer_size, c.episode_limit, c.n_agents);
        let rng = match c.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            observations: Array4::zeros((cap, limit + 1, n, c.obs_dim)),
            states: Array3::zeros((cap, limit + 1, c.state_dim)),
            last_onehot_actions: Array4::zeros((cap, limit + 1, n, c.action_dim)),
            actions: Array3::zeros((cap, limit, n)),
            rewards: Array2::zeros((cap, limit)),
            dones: Array2::zeros((cap, limit)),
            active: Array2::zeros((cap, limit)),
            episode_len: Array1::zeros(cap),
            episode_num: 0,
            current_size: 0,
            rng,
            config,
        })
    }

    /// Buffer configuration
    #[must_use]
    pub fn config(&self) -> &EpisodeBufferConfig {
        &self.config
    }

    /// Number of complete episodes stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.current_size
    }

    /// Check if no episode has been completed yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current_size == 0
    }

    /// Record step `episode_step` of the episode being collected
    ///
    /// `actions` are the discrete actions taken at this step; their one-hot
    /// encoding becomes the "last action" input of the following step.
    pub fn store_transition(
        &mut self,
        episode_step: usize,
        observations: ArrayView2<f32>,
        state: ArrayView1<f32>,
        actions: &[usize],
        reward: f32,
        done: bool,
    ) -> Result<()> {
        let c = &self.config;
        if episode_step >= c.episode_limit {
            return Err(RLError::invalid(format!(
                "episode step {episode_step} beyond episode_limit {}",
                c.episode_limit
            )));
        }
        self.check_observation(observations, state)?;
        ensure_dim(c.n_agents, actions.len())?;
        if let Some(&a) = actions.iter().find(|&&a| a >= c.action_dim) {
            return Err(RLError::invalid(format!("action {a} outside 0..{}", c.action_dim)));
        }

        let e = self.episode_num;
        if episode_step == 0 {
            self.clear_slot(e);
        }

        self.observations.slice_mut(s![e, episode_step, .., ..]).assign(&observations);
        self.states.slice_mut(s![e, episode_step, ..]).assign(&state);
        for (agent, &a) in actions.iter().enumerate() {
            self.actions[[e, episode_step, agent]] = a;
            self.last_onehot_actions[[e, episode_step + 1, agent, a]] = 1.0;
        }
        self.rewards[[e, episode_step]] = reward;
        self.dones[[e, episode_step]] = if done { 1.0 } else { 0.0 };
        self.active[[e, episode_step]] = 1.0;
        Ok(())
    }

    /// Record the final observation of an episode of length `episode_step` and close it
    pub fn store_last_step(
        &mut self,
        episode_step: usize,
        observations: ArrayView2<f32>,
        state: ArrayView1<f32>,
    ) -> Result<()> {
        if episode_step == 0 || episode_step > self.config.episode_limit {
            return Err(RLError::invalid(format!(
                "episode length {episode_step} outside 1..={}",
                self.config.episode_limit
            )));
        }
        self.check_observation(observations, state)?;

        let e = self.episode_num;
        self.observations.slice_mut(s![e, episode_step, .., ..]).assign(&observations);
        self.states.slice_mut(s![e, episode_step, ..]).assign(&state);
        self.episode_len[e] = episode_step;

        self.episode_num = (self.episode_num + 1) % self.config.buffer_size;
        self.current_size = (self.current_size + 1).min(self.config.buffer_size);
        debug!(episode_len = episode_step, stored = self.current_size, "episode stored");
        Ok(())
    }

    /// Sample `batch_size` distinct episodes
    pub fn sample_with_rng<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<EpisodeBatch> {
        if self.current_size == 0 {
            return Err(RLError::invalid("cannot sample from an empty episode buffer"));
        }
        if batch_size == 0 || batch_size > self.current_size {
            return Err(RLError::invalid(format!(
                "batch of {batch_size} episodes requested, {} stored",
                self.current_size
            )));
        }

        let indices = rand::seq::index::sample(rng, self.current_size, batch_size).into_vec();
        let t = indices
            .iter()
            .map(|&i| self.episode_len[i])
            .max()
            .unwrap_or(0);

        Ok(EpisodeBatch {
            observations: self.observations.select(Axis(0), &indices).slice(s![.., ..=t, .., ..]).to_owned(),
            states: self.states.select(Axis(0), &indices).slice(s![.., ..=t, ..]).to_owned(),
            last_onehot_actions: self
                .last_onehot_actions
                .select(Axis(0), &indices)
                .slice(s![.., ..=t, .., ..])
                .to_owned(),
            actions: self.actions.select(Axis(0), &indices).slice(s![.., ..t, ..]).to_owned(),
            rewards: self.rewards.select(Axis(0), &indices).slice(s![.., ..t]).to_owned(),
            dones: self.dones.select(Axis(0), &indices).slice(s![.., ..t]).to_owned(),
            active: self.active.select(Axis(0), &indices).slice(s![.., ..t]).to_owned(),
            max_episode_len: t,
        })
    }

    fn check_observation(&self, observations: ArrayView2<f32>, state: ArrayView1<f32>) -> Result<()> {
        ensure_dim(self.config.n_agents, observations.nrows())?;
        ensure_dim(self.config.obs_dim, observations.ncols())?;
        ensure_dim(self.config.state_dim, state.len())
    }

    fn clear_slot(&mut self, e: usize) {
        self.observations.index_axis_mut(Axis(0), e).fill(0.0);
        self.states.index_axis_mut(Axis(0), e).fill(0.0);
        self.last_onehot_actions.index_axis_mut(Axis(0), e).fill(0.0);
        self.actions.index_axis_mut(Axis(0), e).fill(0);
        self.rewards.row_mut(e).fill(0.0);
        self.dones.row_mut(e).fill(0.0);
        self.active.row_mut(e).fill(0.0);
        self.episode_len[e] = 0;
    }
}

impl EpisodeSource for EpisodeReplayBuffer {
    fn sample_episodes(&mut self, batch_size: usize) -> Result<EpisodeBatch> {
        let mut rng = StdRng::seed_from_u64(self.rng.gen());
        self.sample_with_rng(batch_size, &mut rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array2};

    fn config() -> EpisodeBufferConfig {
        EpisodeBufferConfig {
            buffer_size: 3,
            n_agents: 2,
            obs_dim: 2,
            state_dim: 3,
            action_dim: 3,
            episode_limit: 5,
            seed: Some(0),
        }
    }

    fn fill_episode(buffer: &mut EpisodeReplayBuffer, len: usize, tag: f32) {
        for t in 0..len {
            let obs = Array2::from_elem((2, 2), tag + t as f32);
            let state = Array1::from_elem(3, tag);
            buffer
                .store_transition(t, obs.view(), state.view(), &[t % 3, 1], 1.0, t + 1 == len)
                .unwrap();
        }
        let obs = Array2::from_elem((2, 2), tag + len as f32);
        buffer.store_last_step(len, obs.view(), arr1(&[tag, tag, tag]).view()).unwrap();
    }

    #[test]
    fn test_batch_is_cut_to_longest_episode() {
        let mut buffer = EpisodeReplayBuffer::new(config()).unwrap();
        fill_episode(&mut buffer, 2, 10.0);
        fill_episode(&mut buffer, 4, 20.0);
        assert_eq!(buffer.len(), 2);

        let batch = buffer.sample_episodes(2).unwrap();
        assert_eq!(batch.max_episode_len, 4);
        assert_eq!(batch.observations.shape(), &[2, 5, 2, 2]);
        batch.validate(2, 2, 3, 3).unwrap();

        let short = (0..2).find(|&b| batch.states[[b, 0, 0]] == 10.0).unwrap();
        assert_eq!(batch.active.row(short).to_vec(), vec![1.0, 1.0, 0.0, 0.0]);
        assert_eq!(batch.dones.row(short).to_vec(), vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(batch.rewards[[short, 3]], 0.0);
    }

    #[test]
    fn test_last_action_is_shifted_one_hot() {
        let mut buffer = EpisodeReplayBuffer::new(config()).unwrap();
        fill_episode(&mut buffer, 3, 0.0);
        let batch = buffer.sample_episodes(1).unwrap();

        assert_eq!(batch.last_onehot_actions.slice(s![0, 0, .., ..]).sum(), 0.0);
        for t in 0..3 {
            assert_eq!(batch.last_onehot_actions[[0, t + 1, 0, t % 3]], 1.0);
            assert_eq!(batch.last_onehot_actions[[0, t + 1, 1, 1]], 1.0);
            assert_eq!(batch.actions[[0, t, 0]], t % 3);
        }
    }

    #[test]
    fn test_reused_slot_is_cleared() {
        let mut buffer = EpisodeReplayBuffer::new(config()).unwrap();
        fill_episode(&mut buffer, 5, 1.0);
        fill_episode(&mut buffer, 5, 2.0);
        fill_episode(&mut buffer, 5, 3.0);
        fill_episode(&mut buffer, 1, 4.0);
        assert_eq!(buffer.len(), 3);

        for _ in 0..20 {
            let batch = buffer.sample_episodes(3).unwrap();
            let newest = (0..3).find(|&b| batch.states[[b, 0, 0]] == 4.0).unwrap();
            assert_eq!(batch.active.row(newest).sum(), 1.0);
        }
    }

    #[test]
    fn test_sampling_errors() {
        let mut buffer = EpisodeReplayBuffer::new(config()).unwrap();
        assert!(matches!(buffer.sample_episodes(1), Err(RLError::InvalidArgument(_))));
        fill_episode(&mut buffer, 2, 0.0);
        assert!(buffer.sample_episodes(2).is_err());
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut buffer = EpisodeReplayBuffer::new(config()).unwrap();
        let obs = Array2::zeros((3, 2));
        let state = Array1::zeros(3);
        assert!(buffer.store_transition(0, obs.view(), state.view(), &[0, 0], 0.0, false).is_err());

        let obs = Array2::zeros((2, 2));
        assert!(buffer.store_transition(0, obs.view(), state.view(), &[0, 7], 0.0, false).is_err());
        assert!(buffer.store_transition(5, obs.view(), state.view(), &[0, 0], 0.0, false).is_err());
        assert!(buffer.store_last_step(0, obs.view(), state.view()).is_err());
    }
}
