//! Value-decomposition learners for cooperative multi-agent RL
//!
//! This crate provides:
//! - QMIX and VDN centralised training over episode batches
//! - ndarray Q-networks (MLP and GRU) and hypernetwork mixers with
//!   explicit backpropagation
//! - Adam / RMSprop optimizers and target-network synchronisation
//! - JSON checkpoints
//! - A tabular SARSA agent

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::many_single_char_names)]

pub mod checkpoint;
pub mod mixer;
pub mod nn;
pub mod qmix;
pub mod sarsa;
pub mod utils;

// Re-export learners
pub use qmix::{LossGradients, QmixConfig, QmixTrainer, TrainStats};
pub use sarsa::{SarsaAgent, SarsaConfig};

// Re-export mixing and persistence
pub use checkpoint::{checkpoint_file_name, Checkpoint};
pub use mixer::{Algorithm, Mixer, QmixMixer, ValueMixer, VdnMixer};

// Re-export utilities
pub use utils::{LinearSchedule, Schedule};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::nn::{AgentNetwork, Parameterized, QNetwork};
    pub use crate::{
        Algorithm, LinearSchedule, Mixer, QmixConfig, QmixTrainer, SarsaAgent, SarsaConfig,
        Schedule, TrainStats, ValueMixer,
    };
    pub use marl_core::prelude::*;
}
