//! Centralised QMIX / VDN training
//!
//! One [`QmixTrainer::train`] call performs one gradient step on a batch of
//! padded episodes:
//!
//! 1. Build per-agent inputs `[obs | last action | agent id]` for `T + 1` steps.
//! 2. Evaluate the eval network on steps `0..T` (`0..=T` with double-Q) and
//!    the target network on steps `1..=T`.
//! 3. Bootstrap per-agent values from the target network, selecting the
//!    action with the eval network when double-Q is on.
//! 4. Mix both sides, form `r + γ (1 - done) Q_tot'`, and take the squared
//!    TD error averaged over valid steps only.
//! 5. Backpropagate through the mixer and the Q-network, clip, step the
//!    optimizer, then synchronise targets and decay the learning rate.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2, ArrayViewMut1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use marl_core::error::ensure_dim;
use marl_core::{EpisodeBatch, EpisodeBufferConfig, EpisodeSource, RLError, Result};

use crate::checkpoint::{checkpoint_file_name, Checkpoint};
use crate::mixer::{Algorithm, Mixer, ValueMixer};
use crate::nn::{
    clip_grad_norm, global_norm, hard_update, soft_update, AgentNetwork, Gradients, Optimizer,
    OptimizerKind, Parameterized, QNetwork,
};
use crate::utils::{argmax, LinearSchedule, Schedule};

/// QMIX / VDN trainer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QmixConfig {
    /// Mixing algorithm
    pub algorithm: Algorithm,
    /// Number of agents
    pub n_agents: usize,
    /// Per-agent observation width
    pub obs_dim: usize,
    /// Global state width (unused by VDN)
    pub state_dim: usize,
    /// Discrete actions per agent
    pub action_dim: usize,
    /// Maximum episode length
    pub episode_limit: usize,
    /// Episode replay capacity
    pub buffer_size: usize,
    /// Episodes per training batch
    pub batch_size: usize,
    /// Initial learning rate
    pub learning_rate: f32,
    /// Discount factor
    pub gamma: f32,
    /// Horizon of the linear learning-rate decay
    pub max_train_steps: usize,
    /// GRU agent network instead of an MLP
    pub use_rnn: bool,
    /// GRU hidden width
    pub rnn_hidden_dim: usize,
    /// MLP hidden width
    pub mlp_hidden_dim: usize,
    /// QMIX mixing hidden width
    pub qmix_hidden_dim: usize,
    /// Hidden width of two-layer hypernetworks
    pub hyper_hidden_dim: usize,
    /// Hypernetwork depth for the mixing weights (1 or 2)
    pub hyper_layers_num: usize,
    /// RMSprop instead of Adam
    pub use_rms: bool,
    /// Append the previous one-hot action to agent inputs
    pub add_last_action: bool,
    /// Append a one-hot agent id to agent inputs
    pub add_agent_id: bool,
    /// Select bootstrap actions with the eval network
    pub use_double_q: bool,
    /// Clip the global gradient norm
    pub use_grad_clip: bool,
    /// Global gradient norm threshold
    pub grad_clip_norm: f32,
    /// Decay the learning rate linearly to zero over `max_train_steps`
    pub use_lr_decay: bool,
    /// Periodic hard copy instead of per-step Polyak averaging
    pub use_hard_update: bool,
    /// Steps between hard target copies
    pub target_update_freq: usize,
    /// Polyak coefficient for soft target updates
    pub tau: f32,
    /// Steps between checkpoints (0 disables)
    pub save_freq: usize,
    /// Checkpoint directory; checkpoints are skipped when unset
    pub model_dir: Option<PathBuf>,
    /// Identifier embedded in checkpoint names
    pub run_id: u32,
    /// Seed for initialisation and exploration
    pub seed: u64,
}

impl Default for QmixConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Qmix,
            n_agents: 3,
            obs_dim: 30,
            state_dim: 48,
            action_dim: 9,
            episode_limit: 60,
            buffer_size: 5000,
            batch_size: 32,
            learning_rate: 5e-4,
            gamma: 0.99,
            max_train_steps: 1_000_000,
            use_rnn: true,
            rnn_hidden_dim: 64,
            mlp_hidden_dim: 64,
            qmix_hidden_dim: 32,
            hyper_hidden_dim: 64,
            hyper_layers_num: 1,
            use_rms: false,
            add_last_action: true,
            add_agent_id: true,
            use_double_q: true,
            use_grad_clip: true,
            grad_clip_norm: 10.0,
            use_lr_decay: false,
            use_hard_update: true,
            target_update_freq: 200,
            tau: 0.005,
            save_freq: 5000,
            model_dir: None,
            run_id: 1,
            seed: 0,
        }
    }
}

impl QmixConfig {
    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the trainer cannot run with
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("n_agents", self.n_agents),
            ("obs_dim", self.obs_dim),
            ("action_dim", self.action_dim),
            ("episode_limit", self.episode_limit),
            ("buffer_size", self.buffer_size),
            ("batch_size", self.batch_size),
            ("rnn_hidden_dim", self.rnn_hidden_dim),
            ("mlp_hidden_dim", self.mlp_hidden_dim),
        ] {
            if value == 0 {
                return Err(RLError::invalid(format!("{name} must be positive")));
            }
        }
        if self.algorithm == Algorithm::Qmix && (self.state_dim == 0 || self.qmix_hidden_dim == 0) {
            return Err(RLError::invalid("QMIX needs state_dim and qmix_hidden_dim"));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(RLError::invalid(format!("gamma {} outside [0, 1]", self.gamma)));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(RLError::invalid("learning_rate must be positive"));
        }
        if self.use_hard_update && self.target_update_freq == 0 {
            return Err(RLError::invalid("target_update_freq must be positive"));
        }
        if !self.use_hard_update && !(self.tau > 0.0 && self.tau <= 1.0) {
            return Err(RLError::invalid(format!("tau {} outside (0, 1]", self.tau)));
        }
        if self.use_grad_clip && self.grad_clip_norm <= 0.0 {
            return Err(RLError::invalid("grad_clip_norm must be positive"));
        }
        if self.use_lr_decay && self.max_train_steps == 0 {
            return Err(RLError::invalid("max_train_steps must be positive with lr decay"));
        }
        Ok(())
    }

    /// Width of one agent input row
    #[must_use]
    pub fn input_dim(&self) -> usize {
        let mut dim = self.obs_dim;
        if self.add_last_action {
            dim += self.action_dim;
        }
        if self.add_agent_id {
            dim += self.n_agents;
        }
        dim
    }

    /// Episode buffer matching this trainer
    #[must_use]
    pub fn episode_buffer_config(&self) -> EpisodeBufferConfig {
        EpisodeBufferConfig {
            buffer_size: self.buffer_size,
            n_agents: self.n_agents,
            obs_dim: self.obs_dim,
            state_dim: self.state_dim,
            action_dim: self.action_dim,
            episode_limit: self.episode_limit,
            seed: Some(self.seed),
        }
    }
}

/// Summary of one training step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainStats {
    /// Step counter after this update
    pub train_step: usize,
    /// Masked TD loss before the update
    pub loss: f32,
    /// Global gradient norm before clipping
    pub grad_norm: f32,
    /// Learning rate used for this update
    pub learning_rate: f32,
    /// Whether the target networks changed
    pub target_synced: bool,
}

/// Loss and unclipped gradients for one batch
#[derive(Debug, Clone)]
pub struct LossGradients {
    /// Masked TD loss
    pub loss: f32,
    /// Gradients of the eval mixer, in parameter order
    pub mixer: Gradients,
    /// Gradients of the eval Q-network, in parameter order
    pub q_network: Gradients,
}

/// QMIX / VDN learner
#[derive(Debug)]
pub struct QmixTrainer {
    config: QmixConfig,
    eval_q: AgentNetwork,
    target_q: AgentNetwork,
    eval_mixer: Mixer,
    target_mixer: Mixer,
    optimizer: Optimizer,
    lr_schedule: LinearSchedule,
    learning_rate: f32,
    train_step: usize,
    rng: StdRng,
}

fn write_input_row(
    config: &QmixConfig,
    mut row: ArrayViewMut1<f32>,
    observation: ArrayView1<f32>,
    last_action: ArrayView1<f32>,
    agent: usize,
) {
    let obs_dim = observation.len();
    row.slice_mut(s![..obs_dim]).assign(&observation);
    let mut offset = obs_dim;
    if config.add_last_action {
        let width = last_action.len();
        row.slice_mut(s![offset..offset + width]).assign(&last_action);
        offset += width;
    }
    if config.add_agent_id {
        row[offset + agent] = 1.0;
    }
}

fn max_value(values: ArrayView1<f32>) -> f32 {
    values.fold(f32::NEG_INFINITY, |m, &v| m.max(v))
}

impl QmixTrainer {
    /// Build eval and target networks and the optimizer
    pub fn new(config: QmixConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let hidden = if config.use_rnn {
            config.rnn_hidden_dim
        } else {
            config.mlp_hidden_dim
        };
        let eval_q = AgentNetwork::new(config.use_rnn, config.input_dim(), hidden, config.action_dim, &mut rng);
        let eval_mixer = Mixer::new(
            config.algorithm,
            config.n_agents,
            config.state_dim,
            config.qmix_hidden_dim,
            config.hyper_hidden_dim,
            config.hyper_layers_num,
            &mut rng,
        )?;
        let optimizer = Optimizer::new(if config.use_rms {
            OptimizerKind::RmsProp
        } else {
            OptimizerKind::Adam
        });

        info!(
            algorithm = %config.algorithm,
            n_agents = config.n_agents,
            input_dim = config.input_dim(),
            use_rnn = config.use_rnn,
            use_double_q = config.use_double_q,
            use_hard_update = config.use_hard_update,
            optimizer = ?optimizer.kind(),
            q_parameters = eval_q.num_parameters(),
            mixer_parameters = eval_mixer.num_parameters(),
            "value-decomposition trainer ready"
        );

        Ok(Self {
            target_q: eval_q.clone(),
            target_mixer: eval_mixer.clone(),
            eval_q,
            eval_mixer,
            optimizer,
            lr_schedule: LinearSchedule::new(f64::from(config.learning_rate), 0.0, config.max_train_steps),
            learning_rate: config.learning_rate,
            train_step: 0,
            rng,
            config,
        })
    }

    /// Trainer configuration
    #[must_use]
    pub fn config(&self) -> &QmixConfig {
        &self.config
    }

    /// Number of completed training steps
    #[must_use]
    pub fn train_step(&self) -> usize {
        self.train_step
    }

    /// Learning rate for the next update
    #[must_use]
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Network used for acting and trained by the optimizer
    #[must_use]
    pub fn eval_q_network(&self) -> &AgentNetwork {
        &self.eval_q
    }

    /// Bootstrap network
    #[must_use]
    pub fn target_q_network(&self) -> &AgentNetwork {
        &self.target_q
    }

    /// Trained mixer
    #[must_use]
    pub fn eval_mixer(&self) -> &Mixer {
        &self.eval_mixer
    }

    /// Bootstrap mixer
    #[must_use]
    pub fn target_mixer(&self) -> &Mixer {
        &self.target_mixer
    }

    /// Start a new episode for the acting hidden state
    pub fn reset_hidden(&mut self) {
        self.eval_q.reset_hidden();
    }

    /// Agent input rows `(N, input_dim)` for one environment step
    pub fn agent_inputs(&self, observations: ArrayView2<f32>, last_onehot_actions: ArrayView2<f32>) -> Result<Array2<f32>> {
        let c = &self.config;
        ensure_dim(c.n_agents, observations.nrows())?;
        ensure_dim(c.obs_dim, observations.ncols())?;
        if c.add_last_action {
            ensure_dim(c.n_agents, last_onehot_actions.nrows())?;
            ensure_dim(c.action_dim, last_onehot_actions.ncols())?;
        }

        let mut inputs = Array2::zeros((c.n_agents, c.input_dim()));
        for (agent, mut row) in inputs.outer_iter_mut().enumerate() {
            let last = if c.add_last_action {
                last_onehot_actions.row(agent)
            } else {
                observations.slice(s![agent, ..0])
            };
            write_input_row(c, row.view_mut(), observations.row(agent), last, agent);
        }
        Ok(inputs)
    }

    /// Epsilon-greedy joint action
    ///
    /// With probability `epsilon` every agent acts uniformly at random.
    /// Otherwise the eval network runs once and each agent takes its argmax.
    pub fn choose_action(
        &mut self,
        observations: ArrayView2<f32>,
        last_onehot_actions: ArrayView2<f32>,
        epsilon: f64,
    ) -> Result<Vec<usize>> {
        let inputs = self.agent_inputs(observations, last_onehot_actions)?;
        if self.rng.gen::<f64>() < epsilon {
            let n = self.config.action_dim;
            return Ok((0..self.config.n_agents).map(|_| self.rng.gen_range(0..n)).collect());
        }
        let q = self.eval_q.act(inputs.view());
        Ok(q.outer_iter().map(|row| argmax(row.iter())).collect())
    }

    /// Sample a batch from `source` and train on it
    pub fn train<S: EpisodeSource + ?Sized>(&mut self, source: &mut S) -> Result<TrainStats> {
        let batch = source.sample_episodes(self.config.batch_size)?;
        self.train_on_batch(&batch)
    }

    /// One gradient step on an explicit batch
    pub fn train_on_batch(&mut self, batch: &EpisodeBatch) -> Result<TrainStats> {
        let LossGradients { loss, mixer, q_network } = self.compute_gradients(batch)?;
        let mut grads = mixer;
        grads.extend(q_network);

        let grad_norm = if self.config.use_grad_clip {
            clip_grad_norm(&mut grads, self.config.grad_clip_norm)
        } else {
            global_norm(&grads)
        };
        if !grad_norm.is_finite() {
            return Err(RLError::Computation(format!(
                "non-finite gradient norm at step {}",
                self.train_step
            )));
        }

        let learning_rate = self.learning_rate;
        let mut params = self.eval_mixer.parameters_mut();
        params.extend(self.eval_q.parameters_mut());
        self.optimizer.step(params, &grads, learning_rate)?;

        self.train_step += 1;
        let target_synced = self.sync_targets()?;

        if self.config.use_lr_decay {
            self.learning_rate = self.decayed_learning_rate();
        }

        debug!(
            train_step = self.train_step,
            loss,
            grad_norm,
            learning_rate,
            "train step"
        );

        if self.config.save_freq > 0 && self.train_step % self.config.save_freq == 0 {
            if let Some(dir) = self.config.model_dir.clone() {
                self.save_model(dir)?;
            }
        }

        Ok(TrainStats {
            train_step: self.train_step,
            loss,
            grad_norm,
            learning_rate,
            target_synced,
        })
    }

    /// Masked TD loss and its gradients, leaving every parameter untouched
    pub fn compute_gradients(&self, batch: &EpisodeBatch) -> Result<LossGradients> {
        let c = &self.config;
        batch.validate(c.n_agents, c.obs_dim, c.state_dim, c.action_dim)?;
        let (b, t, n) = (batch.batch_size(), batch.max_episode_len, c.n_agents);
        let valid = batch.active.sum();
        if t == 0 || valid <= 0.0 {
            return Err(RLError::invalid("batch contains no valid steps"));
        }

        let inputs = self.build_inputs(batch);
        let eval_steps = if c.use_double_q { t + 1 } else { t };
        let (q_evals, eval_tape) = self.eval_q.forward_sequence(inputs.slice(s![..eval_steps, .., ..]));
        let (q_targets, _) = self.target_q.forward_sequence(inputs.slice(s![1.., .., ..]));

        let mut chosen = Array3::zeros((b, t, n));
        let mut bootstrap = Array3::zeros((b, t, n));
        for ep in 0..b {
            for step in 0..t {
                for agent in 0..n {
                    let row = ep * n + agent;
                    chosen[[ep, step, agent]] = q_evals[[step, row, batch.actions[[ep, step, agent]]]];
                    let next = q_targets.slice(s![step, row, ..]);
                    bootstrap[[ep, step, agent]] = if c.use_double_q {
                        let greedy = argmax(q_evals.slice(s![step + 1, row, ..]));
                        next[greedy]
                    } else {
                        max_value(next)
                    };
                }
            }
        }

        let (q_total, mix_tape) = self
            .eval_mixer
            .forward(chosen.view(), Some(batch.states.slice(s![.., ..t, ..])))?;
        let q_total_target = self
            .target_mixer
            .combine(bootstrap.view(), Some(batch.states.slice(s![.., 1.., ..])))?;

        let not_done = batch.dones.mapv(|d| 1.0 - d);
        let targets = &batch.rewards + &(not_done * &q_total_target * c.gamma);
        let masked_td = (&q_total - &targets) * &batch.active;
        let loss = masked_td.mapv(|v| v * v).sum() / valid;
        if !loss.is_finite() {
            return Err(RLError::Computation(format!(
                "non-finite loss at step {}",
                self.train_step
            )));
        }

        let grad_total = &masked_td * &batch.active * (2.0 / valid);
        let (grad_chosen, mixer_grads) = self.eval_mixer.backward(&mix_tape, grad_total.view())?;

        let mut grad_q = Array3::zeros(q_evals.raw_dim());
        for ep in 0..b {
            for step in 0..t {
                for agent in 0..n {
                    let action = batch.actions[[ep, step, agent]];
                    grad_q[[step, ep * n + agent, action]] += grad_chosen[[ep, step, agent]];
                }
            }
        }
        let q_grads = self.eval_q.backward_sequence(&eval_tape, grad_q.view())?;

        Ok(LossGradients {
            loss,
            mixer: mixer_grads,
            q_network: q_grads,
        })
    }

    /// Write a checkpoint of the eval networks into `dir`
    pub fn save_model(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(checkpoint_file_name(
            self.config.algorithm,
            self.config.run_id,
            self.config.seed,
            self.train_step,
        ));
        Checkpoint::new(
            self.config.algorithm,
            self.train_step,
            self.eval_q.clone(),
            self.eval_mixer.clone(),
        )
        .save(&path)?;
        info!(path = %path.display(), train_step = self.train_step, "checkpoint written");
        Ok(path)
    }

    /// Restore eval and target networks from a checkpoint
    pub fn load_model(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = Checkpoint::load(path)?;
        if checkpoint.algorithm != self.config.algorithm {
            return Err(RLError::invalid(format!(
                "checkpoint holds {}, trainer runs {}",
                checkpoint.algorithm, self.config.algorithm
            )));
        }
        hard_update(&mut self.eval_q, &checkpoint.q_network)?;
        hard_update(&mut self.eval_mixer, &checkpoint.mixer)?;
        hard_update(&mut self.target_q, &self.eval_q)?;
        hard_update(&mut self.target_mixer, &self.eval_mixer)?;
        self.eval_q.reset_hidden();
        self.train_step = checkpoint.train_step;
        if self.config.use_lr_decay {
            self.learning_rate = self.decayed_learning_rate();
        }
        info!(train_step = self.train_step, "checkpoint restored");
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn decayed_learning_rate(&self) -> f32 {
        (self.lr_schedule.value(self.train_step) as f32).max(0.0)
    }

    fn sync_targets(&mut self) -> Result<bool> {
        if self.config.use_hard_update {
            if self.train_step % self.config.target_update_freq != 0 {
                return Ok(false);
            }
            hard_update(&mut self.target_q, &self.eval_q)?;
            hard_update(&mut self.target_mixer, &self.eval_mixer)?;
            info!(train_step = self.train_step, "target networks copied");
        } else {
            soft_update(&mut self.target_q, &self.eval_q, self.config.tau)?;
            soft_update(&mut self.target_mixer, &self.eval_mixer, self.config.tau)?;
        }
        Ok(true)
    }

    /// Time-major inputs `(T + 1, B * N, input_dim)`
    fn build_inputs(&self, batch: &EpisodeBatch) -> Array3<f32> {
        let c = &self.config;
        let (b, steps, n, _) = batch.observations.dim();
        let mut inputs = Array3::zeros((steps, b * n, c.input_dim()));
        for step in 0..steps {
            for ep in 0..b {
                for agent in 0..n {
                    write_input_row(
                        c,
                        inputs.slice_mut(s![step, ep * n + agent, ..]),
                        batch.observations.slice(s![ep, step, agent, ..]),
                        batch.last_onehot_actions.slice(s![ep, step, agent, ..]),
                        agent,
                    );
                }
            }
        }
        inputs
    }
}
