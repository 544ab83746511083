//! Core storage and types for multi-agent value-decomposition RL
//!
//! This crate provides the replay structures that feed training:
//! - a thread-safe, fixed-capacity multi-agent transition buffer
//! - an episode buffer producing padded, masked episode batches
//! - the shared error type

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod buffer;
pub mod episode;
pub mod error;
pub mod transition;

// Re-export core types
pub use buffer::{allocate_slots, BufferConfig, CircularReplayBuffer};
pub use episode::{EpisodeBatch, EpisodeBufferConfig, EpisodeReplayBuffer, EpisodeSource};
pub use error::{RLError, Result};
pub use transition::{AgentBatch, AgentTransition, JointTransition, TransitionBatch};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        BufferConfig, CircularReplayBuffer, EpisodeBatch, EpisodeReplayBuffer, EpisodeSource,
        JointTransition, RLError, Result,
    };
}
