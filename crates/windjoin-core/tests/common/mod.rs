//! Shared fixtures for the pipeline integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use arrow_array::{Int64Array, RecordBatch, StringArray};
use windjoin_core::checkpoint::RestartPolicy;
use windjoin_core::config::JobConfig;
use windjoin_core::operator::aggregate::{AggregateExpr, WindowAggregation};
use windjoin_core::pipeline::{StreamInput, WindowJoinPipeline};
use windjoin_core::sink::CollectingSink;
use windjoin_core::source::{FailingSource, ReplayableSource, VecSource};
use windjoin_core::{Datum, JoinType, NullEquality};

/// One input row: `(id, name, event time in ms)`.
pub type Row = (i64, Option<&'static str>, i64);

pub fn batch(rows: &[Row]) -> RecordBatch {
    let ids: Vec<i64> = rows.iter().map(|r| r.0).collect();
    let names: Vec<Option<&str>> = rows.iter().map(|r| r.1).collect();
    let ts: Vec<i64> = rows.iter().map(|r| r.2).collect();
    RecordBatch::try_from_iter(vec![
        ("id", Arc::new(Int64Array::from(ids)) as _),
        ("name", Arc::new(StringArray::from(names)) as _),
        ("ts", Arc::new(Int64Array::from(ts)) as _),
    ])
    .unwrap()
}

/// Counts distinct ids per name and 5-second window.
pub fn distinct_ids(source: impl ReplayableSource + 'static, alias: &str) -> StreamInput {
    StreamInput::new(source, "ts")
        .with_group_by(vec!["name".into()])
        .with_aggregation(WindowAggregation::Aggregate(vec![AggregateExpr::count_distinct(
            "id", alias,
        )]))
}

pub fn job(join_type: JoinType, null_equality: NullEquality, restart: RestartPolicy) -> JobConfig {
    JobConfig::builder()
        .window_size(Duration::from_secs(5))
        .join_type(join_type)
        .null_equality(null_equality)
        .checkpoint_interval(Duration::ZERO)
        .restart_policy(restart)
        .build()
        .unwrap()
}

/// Every committed row, sorted.
pub fn committed(sink: &CollectingSink) -> Vec<Vec<Datum>> {
    let mut rows = Vec::new();
    for batch in sink.committed_batches() {
        for row in 0..batch.num_rows() {
            rows.push(Datum::row_from_columns(batch.columns(), row).unwrap());
        }
    }
    rows.sort();
    rows
}

/// Joins the distinct-id counts of both inputs on name and returns the
/// committed rows. `fail_left_at` injects one failure into the left source.
pub fn run_join(
    config: JobConfig,
    left: &[Row],
    right: &[Row],
    fail_left_at: Option<u64>,
) -> (Vec<Vec<Datum>>, WindowJoinPipeline<CollectingSink>) {
    let left_source = VecSource::sliced("left", &batch(left), 1);
    let right_source = VecSource::sliced("right", &batch(right), 1);
    let left_input = match fail_left_at {
        Some(position) => distinct_ids(FailingSource::new(left_source, position), "left_ids"),
        None => distinct_ids(left_source, "left_ids"),
    };
    let mut pipeline = WindowJoinPipeline::builder(config, CollectingSink::new())
        .left(left_input)
        .right(distinct_ids(right_source, "right_ids"))
        .join_key("name", "name")
        .build()
        .unwrap();
    pipeline.run().unwrap();
    (committed(pipeline.sink()), pipeline)
}

/// Projects `(name, window_start, window_end)` plus the given columns.
pub fn project(rows: &[Vec<Datum>], columns: &[usize]) -> Vec<Vec<Datum>> {
    rows.iter()
        .map(|row| columns.iter().map(|&c| row[c].clone()).collect())
        .collect()
}

pub fn s(value: &str) -> Datum {
    Datum::Utf8(value.to_string())
}

pub fn ts(value: i64) -> Datum {
    Datum::Timestamp(value)
}
