use criterion::{Criterion, black_box, criterion_group, criterion_main};
use l2l::config::{GuidedHistoryConfig, LstmConfig, MlpConfig, OptimizerConfig, RuleConfig};
use l2l::engine::LearnedOptimizer;
use l2l::problem::ElementwiseSquare;

fn built(rule: RuleConfig) -> LearnedOptimizer<ElementwiseSquare> {
    let problem = ElementwiseSquare::new(100, -2.0, 2.0, 0).unwrap();
    let mut optimizer = LearnedOptimizer::new(problem, OptimizerConfig::new(rule)).unwrap();
    optimizer.build().unwrap();
    optimizer
}

fn benchmark_unroll(c: &mut Criterion) {
    let mut group = c.benchmark_group("unroll");

    // 20-step LSTM unroll with a meta step on 100 coordinates
    let mut lstm = built(RuleConfig::Lstm(LstmConfig::default()));
    group.bench_function("lstm_100x20_meta", |b| {
        b.iter(|| {
            black_box(lstm.step().unwrap());
        })
    });

    let mut frozen = built(RuleConfig::Lstm(LstmConfig::default()));
    frozen.set_meta_training(false);
    group.bench_function("lstm_100x20_forward", |b| {
        b.iter(|| {
            black_box(frozen.step().unwrap());
        })
    });

    let mut mlp = built(RuleConfig::MlpSimple(MlpConfig::default()));
    group.bench_function("mlp_simple_100", |b| {
        b.iter(|| {
            black_box(mlp.step().unwrap());
        })
    });

    let mut guided = built(RuleConfig::XHistoryGradNorm(GuidedHistoryConfig::default()));
    group.bench_function("x_history_grad_norm_100", |b| {
        b.iter(|| {
            black_box(guided.step().unwrap());
        })
    });

    group.finish();
}

criterion_group!(benches, benchmark_unroll);
criterion_main!(benches);
