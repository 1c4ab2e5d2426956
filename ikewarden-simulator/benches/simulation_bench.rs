#[macro_use]
extern crate criterion;

use criterion::{black_box, Criterion};
use ikewarden_config::{NetworkModelConfig, SimulatorConfig};
use ikewarden_simulator::simulate;
use ikewarden_telemetry::MetricsRecorder;

/// A simulated day of DPD traffic over a lossy link.
fn benchmark_simulation_throughput(c: &mut Criterion) {
    let config = SimulatorConfig {
        seed: 42,
        duration_secs: 86_400,
        sa_lifetime_secs: 0,
        network: NetworkModelConfig {
            latency_ms: 50,
            jitter_ms: 20,
            loss_probability: 0.05,
        },
        ..SimulatorConfig::default()
    };

    c.bench_function("simulated_day", |b| {
        b.iter(|| black_box(simulate(config.clone(), MetricsRecorder::new())))
    });
}

criterion_group!(benches, benchmark_simulation_throughput);
criterion_main!(benches);
