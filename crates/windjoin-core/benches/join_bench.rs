//! Window join benchmarks
//!
//! Benchmarks for window evaluation of the join operator and for the
//! end-to-end pipeline with checkpointing.
//!
//! Run with: cargo bench --bench join_bench

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use arrow_array::{Int64Array, RecordBatch, StringArray, TimestampMillisecondArray};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use windjoin_core::checkpoint::RestartPolicy;
use windjoin_core::config::JobConfig;
use windjoin_core::operator::aggregate::{AggregateExpr, WindowAggregation};
use windjoin_core::operator::window_join::{
    Existence, JoinSide, JoinType, WindowJoinConfig, WindowJoinOperator,
};
use windjoin_core::operator::{Event, OperatorContext};
use windjoin_core::pipeline::{StreamInput, WindowJoinPipeline};
use windjoin_core::sink::CollectingSink;
use windjoin_core::source::VecSource;
use windjoin_core::state::InMemoryStore;
use windjoin_core::time::{TimerService, Watermark};

/// Window results: `keys` names, all in window `[0, 5000)`.
fn create_window_results(keys: usize) -> RecordBatch {
    let names: Vec<String> = (0..keys).map(|i| format!("key{i}")).collect();
    let counts: Vec<i64> = (0..keys as i64).collect();
    RecordBatch::try_from_iter(vec![
        ("name", Arc::new(StringArray::from(names)) as _),
        (
            "window_start",
            Arc::new(TimestampMillisecondArray::from(vec![0; keys])) as _,
        ),
        (
            "window_end",
            Arc::new(TimestampMillisecondArray::from(vec![5_000; keys])) as _,
        ),
        ("cnt", Arc::new(Int64Array::from(counts)) as _),
    ])
    .unwrap()
}

fn bench_window_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_join_evaluate");

    for join_type in [
        JoinType::Inner,
        JoinType::Full,
        JoinType::Anti(Existence::In),
    ] {
        for keys in [100usize, 10_000] {
            let left = create_window_results(keys);
            // half the right keys match
            let right = create_window_results(keys * 2).slice(keys / 2, keys);
            let config = WindowJoinConfig::builder()
                .key("name", "name")
                .join_type(join_type)
                .build();

            group.throughput(Throughput::Elements((keys * 2) as u64));
            group.bench_with_input(
                BenchmarkId::new(join_type.to_string(), keys),
                &(left, right),
                |b, (left, right)| {
                    b.iter_batched(
                        || {
                            (
                                WindowJoinOperator::new(
                                    config.clone(),
                                    &left.schema(),
                                    &right.schema(),
                                )
                                .unwrap(),
                                InMemoryStore::new(),
                                TimerService::new(),
                            )
                        },
                        |(mut operator, mut store, mut timers)| {
                            let mut ctx = OperatorContext {
                                processing_time: 0,
                                timers: &mut timers,
                                state: &mut store,
                                operator_index: 0,
                            };
                            operator
                                .process_side(JoinSide::Left, &Event::new(0, left.clone()), &mut ctx)
                                .unwrap();
                            operator
                                .process_side(
                                    JoinSide::Right,
                                    &Event::new(0, right.clone()),
                                    &mut ctx,
                                )
                                .unwrap();
                            operator
                                .on_watermark(JoinSide::Left, Watermark::END_OF_INPUT, &mut ctx)
                                .unwrap();
                            black_box(
                                operator
                                    .on_watermark(
                                        JoinSide::Right,
                                        Watermark::END_OF_INPUT,
                                        &mut ctx,
                                    )
                                    .unwrap(),
                            )
                        },
                        BatchSize::SmallInput,
                    )
                },
            );
        }
    }

    group.finish();
}

fn create_rows(rows: usize, keys: usize) -> RecordBatch {
    let ids: Vec<i64> = (0..rows as i64).collect();
    let names: Vec<String> = (0..rows).map(|i| format!("key{}", i % keys)).collect();
    let ts: Vec<i64> = (0..rows as i64).map(|i| i * 10).collect();
    RecordBatch::try_from_iter(vec![
        ("id", Arc::new(Int64Array::from(ids)) as _),
        ("name", Arc::new(StringArray::from(names)) as _),
        ("ts", Arc::new(Int64Array::from(ts)) as _),
    ])
    .unwrap()
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_join_pipeline");
    group.sample_size(20);

    let rows = create_rows(20_000, 64);
    for interval_ms in [0u64, 60_000] {
        let config = JobConfig::builder()
            .window_size(Duration::from_secs(5))
            .checkpoint_interval(Duration::from_millis(interval_ms))
            .restart_policy(RestartPolicy::None)
            .build()
            .unwrap();
        let input = |name: &str| {
            StreamInput::new(VecSource::sliced(name, &rows, 1_000), "ts")
                .with_group_by(vec!["name".into()])
                .with_aggregation(WindowAggregation::Aggregate(vec![
                    AggregateExpr::count_distinct("id", "ids"),
                ]))
        };

        group.throughput(Throughput::Elements(2 * rows.num_rows() as u64));
        group.bench_function(BenchmarkId::new("checkpoint_interval_ms", interval_ms), |b| {
            b.iter_batched(
                || {
                    WindowJoinPipeline::builder(config.clone(), CollectingSink::new())
                        .left(input("left"))
                        .right(input("right"))
                        .join_key("name", "name")
                        .build()
                        .unwrap()
                },
                |mut pipeline| {
                    pipeline.run().unwrap();
                    black_box(pipeline.into_sink())
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_window_evaluation, bench_pipeline);
criterion_main!(benches);
