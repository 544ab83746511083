//! Example: QMIX on a one-step cooperative matrix game
//!
//! Two agents pick one of three actions and share the payoff below. Run with
//! `RUST_LOG=debug` to see per-step training logs.

use marl_agent::prelude::*;
use ndarray::{Array1, Array2};
use tracing_subscriber::EnvFilter;

const PAYOFF: [[f32; 3]; 3] = [[8.0, -12.0, -12.0], [-12.0, 0.0, 0.0], [-12.0, 0.0, 6.0]];

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = QmixConfig {
        n_agents: 2,
        obs_dim: 2,
        state_dim: 2,
        action_dim: 3,
        episode_limit: 1,
        buffer_size: 500,
        batch_size: 32,
        use_rnn: false,
        mlp_hidden_dim: 32,
        qmix_hidden_dim: 16,
        hyper_hidden_dim: 32,
        learning_rate: 5e-3,
        target_update_freq: 50,
        save_freq: 0,
        ..QmixConfig::default()
    };
    let mut buffer = EpisodeReplayBuffer::new(config.episode_buffer_config())?;
    let mut trainer = QmixTrainer::new(config)?;
    let epsilon = LinearSchedule::new(1.0, 0.05, 1500);

    let obs = Array2::from_shape_fn((2, 2), |(agent, k)| if agent == k { 1.0 } else { 0.0 });
    let state = Array1::from_elem(2, 1.0);
    let no_last_action = Array2::zeros((2, 3));

    for episode in 0..2000 {
        trainer.reset_hidden();
        let actions = trainer.choose_action(obs.view(), no_last_action.view(), epsilon.value(episode))?;
        let reward = PAYOFF[actions[0]][actions[1]];
        buffer.store_transition(0, obs.view(), state.view(), &actions, reward, true)?;
        buffer.store_last_step(1, obs.view(), state.view())?;

        if buffer.len() >= trainer.config().batch_size {
            let stats = trainer.train(&mut buffer)?;
            if stats.train_step % 250 == 0 {
                println!("step {:>5}: loss = {:.4}", stats.train_step, stats.loss);
            }
        }
    }

    let greedy = trainer.choose_action(obs.view(), no_last_action.view(), 0.0)?;
    println!(
        "Greedy joint action: {:?} (payoff {})",
        greedy,
        PAYOFF[greedy[0]][greedy[1]]
    );
    Ok(())
}
