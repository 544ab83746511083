use criterion::{black_box, criterion_group, criterion_main, Criterion};
use marl_core::{BufferConfig, CircularReplayBuffer};
use ndarray::Array1;

fn filled_buffer(n_agents: usize) -> (CircularReplayBuffer, Vec<Array1<f32>>, Vec<Array1<f32>>) {
    let config = BufferConfig {
        buffer_size: 50_000,
        n_agents,
        obs_shape: vec![24; n_agents],
        action_shape: vec![5; n_agents],
        seed: Some(0),
    };
    let buffer = CircularReplayBuffer::new(config).expect("valid config");
    let obs: Vec<_> = (0..n_agents).map(|_| Array1::from_elem(24, 0.5)).collect();
    let actions: Vec<_> = (0..n_agents).map(|_| Array1::from_elem(5, 0.2)).collect();
    let rewards = vec![1.0; n_agents];
    for _ in 0..50_000 {
        buffer.store(&obs, &actions, &rewards, &obs).expect("store");
    }
    (buffer, obs, actions)
}

fn bench_store(c: &mut Criterion) {
    let (buffer, obs, actions) = filled_buffer(3);
    let rewards = vec![1.0; 3];
    c.bench_function("store_full_buffer_3_agents", |b| {
        b.iter(|| buffer.store(black_box(&obs), &actions, &rewards, &obs))
    });
}

fn bench_sample(c: &mut Criterion) {
    let (buffer, _, _) = filled_buffer(3);
    c.bench_function("sample_256_3_agents", |b| {
        b.iter(|| buffer.sample(black_box(256)))
    });
}

criterion_group!(benches, bench_store, bench_sample);
criterion_main!(benches);
