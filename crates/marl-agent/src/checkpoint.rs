//! On-disk checkpoints of trained networks

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marl_core::Result;

use crate::mixer::{Algorithm, Mixer};
use crate::nn::AgentNetwork;

/// File name for a checkpoint taken at `train_step`
///
/// The step is written in thousands, truncated: step 12 345 becomes `12k`.
#[must_use]
pub fn checkpoint_file_name(algorithm: Algorithm, run_id: u32, seed: u64, train_step: usize) -> String {
    format!("{algorithm}_{run_id}_seed_{seed}_step_{}k.json", train_step / 1000)
}

/// Eval networks plus metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Algorithm the networks were trained with
    pub algorithm: Algorithm,
    /// Training step at save time
    pub train_step: usize,
    /// Wall-clock save time
    pub saved_at: DateTime<Utc>,
    /// Agent Q-network
    pub q_network: AgentNetwork,
    /// Mixing network
    pub mixer: Mixer,
}

impl Checkpoint {
    /// Checkpoint stamped with the current time
    #[must_use]
    pub fn new(algorithm: Algorithm, train_step: usize, q_network: AgentNetwork, mixer: Mixer) -> Self {
        Self {
            algorithm,
            train_step,
            saved_at: Utc::now(),
            q_network,
            mixer,
        }
    }

    /// Write as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Read a checkpoint written by [`Checkpoint::save`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marl_core::RLError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_file_name_uses_thousands() {
        assert_eq!(checkpoint_file_name(Algorithm::Qmix, 1, 0, 999), "QMIX_1_seed_0_step_0k.json");
        assert_eq!(checkpoint_file_name(Algorithm::Vdn, 3, 42, 12_345), "VDN_3_seed_42_step_12k.json");
    }

    #[test]
    fn test_save_and_load() {
        let mut rng = StdRng::seed_from_u64(0);
        let q_network = AgentNetwork::new(false, 4, 8, 3, &mut rng);
        let mixer = Mixer::new(Algorithm::Qmix, 2, 5, 4, 8, 2, &mut rng).unwrap();
        let checkpoint = Checkpoint::new(Algorithm::Qmix, 4000, q_network, mixer);

        let path = std::env::temp_dir().join(format!("marl-checkpoint-{}.json", std::process::id()));
        checkpoint.save(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.algorithm, Algorithm::Qmix);
        assert_eq!(loaded.train_step, 4000);
        assert_eq!(loaded.saved_at, checkpoint.saved_at);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(Checkpoint::load(&path), Err(RLError::Io(_))));
    }
}
