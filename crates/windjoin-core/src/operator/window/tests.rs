use super::*;
use crate::operator::aggregate::AggregateExpr;
use crate::state::{InMemoryStore, StateError, StateSnapshot, StateStore};
use crate::time::TimerService;
use arrow_array::cast::AsArray;
use arrow_array::types::{Int64Type, TimestampMillisecondType};
use arrow_array::{Int64Array, StringArray, TimestampMillisecondArray};
use bytes::Bytes;
use std::ops::Range;

type Row = (Option<&'static str>, Option<i64>, Option<i64>);

struct Harness {
    timers: TimerService,
    state: InMemoryStore,
}

impl Harness {
    fn new() -> Self {
        Self {
            timers: TimerService::new(),
            state: InMemoryStore::new(),
        }
    }

    fn ctx(&mut self) -> OperatorContext<'_> {
        OperatorContext {
            processing_time: 0,
            timers: &mut self.timers,
            state: &mut self.state,
            operator_index: 0,
        }
    }
}

fn input_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("name", DataType::Utf8, true),
        Field::new("id", DataType::Int64, true),
        Field::new("ts", DataType::Timestamp(TimeUnit::Millisecond, None), true),
    ]))
}

fn event(rows: &[Row]) -> Event {
    let names: StringArray = rows.iter().map(|r| r.0).collect();
    let ids: Int64Array = rows.iter().map(|r| r.1).collect();
    let times: TimestampMillisecondArray = rows.iter().map(|r| r.2).collect();
    let batch = RecordBatch::try_new(
        input_schema(),
        vec![Arc::new(names), Arc::new(ids), Arc::new(times)],
    )
    .unwrap();
    Event::new(0, batch)
}

fn distinct_config() -> WindowTriggerConfig {
    WindowTriggerConfig::new("left_window", "ts", Duration::from_secs(5))
        .with_group_by(vec!["name".into()])
        .with_aggregation(WindowAggregation::Aggregate(vec![
            AggregateExpr::count_distinct("id", "cnt"),
        ]))
}

fn batches(output: &OutputVec) -> Vec<&RecordBatch> {
    output
        .iter()
        .filter_map(|o| match o {
            Output::Event(e) => Some(&e.data),
            Output::Watermark(_) => None,
        })
        .collect()
}

fn names(batch: &RecordBatch) -> Vec<Option<String>> {
    batch
        .column(0)
        .as_string::<i32>()
        .iter()
        .map(|v| v.map(str::to_string))
        .collect()
}

#[test]
fn test_window_key_roundtrip_preserves_order() {
    let windows = [
        WindowId::new(-10_000, -5_000),
        WindowId::new(-5_000, 0),
        WindowId::new(0, 5_000),
        WindowId::new(5_000, 10_000),
    ];
    for pair in windows.windows(2) {
        assert!(pair[0].to_key_inline() < pair[1].to_key_inline());
    }
    for window in windows {
        assert_eq!(WindowId::from_key(&window.to_key()), Some(window));
    }
    assert_eq!(WindowId::from_key(&[0u8; 8]), None);
    assert_eq!(WindowId::new(5_000, 10_000).window_time(), 9_999);
}

#[test]
fn test_five_second_window_boundaries_at_offsets() {
    let no_offset = TumblingWindowAssigner::from_millis(5_000, 0).unwrap();
    assert_eq!(no_offset.assign(0), WindowId::new(0, 5_000));
    assert_eq!(no_offset.assign(4_999), WindowId::new(0, 5_000));
    assert_eq!(no_offset.assign(5_000), WindowId::new(5_000, 10_000));
    assert_eq!(no_offset.assign(-1), WindowId::new(-5_000, 0));

    let plus_one = TumblingWindowAssigner::from_millis(5_000, 1_000).unwrap();
    assert_eq!(plus_one.assign(999), WindowId::new(-4_000, 1_000));
    assert_eq!(plus_one.assign(1_000), WindowId::new(1_000, 6_000));
    assert_eq!(plus_one.assign(5_999), WindowId::new(1_000, 6_000));

    let minus_one = TumblingWindowAssigner::from_millis(5_000, -1_000).unwrap();
    assert_eq!(minus_one.offset_ms(), 4_000);
    assert_eq!(minus_one.assign(3_999), WindowId::new(-1_000, 4_000));
    assert_eq!(minus_one.assign(4_000), WindowId::new(4_000, 9_000));
    assert_eq!(minus_one.assign(-1_001), WindowId::new(-6_000, -1_000));
}

#[test]
fn test_assignment_is_deterministic_and_covers_time() {
    let assigner = TumblingWindowAssigner::new(Duration::from_secs(5), -1_000).unwrap();
    for t in (-20_000..20_000).step_by(333) {
        let window = assigner.assign(t);
        assert_eq!(window, assigner.assign(t));
        assert!(window.start <= t && t < window.end);
        assert_eq!(window.duration_ms(), 5_000);
    }
}

#[test]
fn test_invalid_window_size() {
    assert!(matches!(
        TumblingWindowAssigner::from_millis(0, 0),
        Err(TimeError::InvalidWindowSize(0))
    ));
    assert!(TumblingWindowAssigner::new(Duration::ZERO, 0).is_err());
    let config = WindowTriggerConfig::new("w", "ts", Duration::ZERO);
    assert!(WindowTriggerOperator::new(config, &input_schema()).is_err());
}

#[test]
fn test_missing_columns_are_rejected() {
    let config = WindowTriggerConfig::new("w", "event_time", Duration::from_secs(5));
    assert!(WindowTriggerOperator::new(config, &input_schema()).is_err());

    let config = distinct_config().with_group_by(vec!["missing".into()]);
    assert!(WindowTriggerOperator::new(config, &input_schema()).is_err());
}

#[test]
fn test_output_schema_layout() {
    let operator = WindowTriggerOperator::new(distinct_config(), &input_schema()).unwrap();
    let schema = operator.output_schema();
    let names: Vec<_> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    assert_eq!(
        names,
        ["name", "window_start", "window_end", "window_time", "cnt"]
    );
}

#[test]
fn test_distinct_count_emitted_when_watermark_reaches_end() {
    let mut harness = Harness::new();
    let mut operator = WindowTriggerOperator::new(distinct_config(), &input_schema()).unwrap();

    let first = event(&[
        (Some("b"), Some(1), Some(5_000)),
        (Some("b"), Some(1), Some(6_000)),
        (Some("b"), Some(2), Some(7_000)),
        (Some("a"), Some(3), Some(8_000)),
        (Some("a"), None, Some(9_000)),
    ]);
    let output = operator.process(&first, &mut harness.ctx()).unwrap();
    assert!(batches(&output).is_empty());
    assert_eq!(operator.current_watermark(), Watermark::new(9_000));
    assert_eq!(
        operator.window_phase(&WindowId::new(5_000, 10_000)),
        Some(WindowPhase::Open)
    );

    let second = event(&[(Some("c"), Some(1), Some(10_000))]);
    let output = operator.process(&second, &mut harness.ctx()).unwrap();
    let results = batches(&output);
    assert_eq!(results.len(), 1);
    let batch = results[0];
    assert_eq!(names(batch), vec![Some("a".into()), Some("b".into())]);
    let starts = batch.column(1).as_primitive::<TimestampMillisecondType>();
    let ends = batch.column(2).as_primitive::<TimestampMillisecondType>();
    let times = batch.column(3).as_primitive::<TimestampMillisecondType>();
    let counts = batch.column(4).as_primitive::<Int64Type>();
    assert_eq!(starts.values().to_vec(), vec![5_000, 5_000]);
    assert_eq!(ends.values().to_vec(), vec![10_000, 10_000]);
    assert_eq!(times.values().to_vec(), vec![9_999, 9_999]);
    assert_eq!(counts.values().to_vec(), vec![1, 2]);

    assert!(matches!(output.last(), Some(Output::Watermark(10_000))));
    assert_eq!(
        operator.window_phase(&WindowId::new(5_000, 10_000)),
        Some(WindowPhase::Evicted)
    );
    assert_eq!(operator.window_close_metrics().windows_closed_total(), 1);
    assert_eq!(operator.window_close_metrics().rows_emitted_total(), 2);
}

#[test]
fn test_late_rows_never_reopen_a_window() {
    let mut harness = Harness::new();
    let config = distinct_config().with_lateness(Duration::from_secs(1));
    let mut operator = WindowTriggerOperator::new(config, &input_schema()).unwrap();

    operator
        .process(&event(&[(Some("a"), Some(1), Some(4_000))]), &mut harness.ctx())
        .unwrap();
    // watermark 11_000 - 1_000 closes [0, 5000) and [5000, 10000)
    let output = operator
        .process(&event(&[(Some("a"), Some(2), Some(11_000))]), &mut harness.ctx())
        .unwrap();
    assert_eq!(batches(&output).len(), 1);

    // within the lateness bound of the open window [10000, 15000)
    let output = operator
        .process(
            &event(&[
                (Some("a"), Some(3), Some(4_500)),
                (Some("a"), Some(4), Some(10_500)),
            ]),
            &mut harness.ctx(),
        )
        .unwrap();
    assert!(batches(&output).is_empty());
    assert_eq!(operator.late_data_metrics().late_rows_dropped(), 1);
    assert_eq!(operator.late_data_metrics().batches_with_late_rows(), 1);
    assert_eq!(
        operator.window_phase(&WindowId::new(0, 5_000)),
        Some(WindowPhase::Evicted)
    );
    assert_eq!(harness.state.len(), 1);

    operator.reset_metrics();
    assert_eq!(operator.late_data_metrics().late_rows_dropped(), 0);
}

#[test]
fn test_batch_rows_applied_before_watermark_advance() {
    let mut harness = Harness::new();
    let mut operator = WindowTriggerOperator::new(distinct_config(), &input_schema()).unwrap();

    let output = operator
        .process(
            &event(&[
                (Some("x"), Some(1), Some(20_000)),
                (Some("x"), Some(2), Some(1_000)),
            ]),
            &mut harness.ctx(),
        )
        .unwrap();
    let results = batches(&output);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].num_rows(), 1);
    assert_eq!(operator.late_data_metrics().late_rows_dropped(), 0);
    assert_eq!(operator.open_window_count(), 1);
}

#[test]
fn test_windows_close_in_end_order() {
    let mut harness = Harness::new();
    let mut operator = WindowTriggerOperator::new(distinct_config(), &input_schema()).unwrap();

    // the batch watermark (12_000) already closes the first two windows
    let mut output = operator
        .process(
            &event(&[
                (Some("a"), Some(1), Some(12_000)),
                (Some("a"), Some(1), Some(2_000)),
                (Some("a"), Some(1), Some(7_000)),
            ]),
            &mut harness.ctx(),
        )
        .unwrap();
    assert_eq!(batches(&output).len(), 2);
    assert_eq!(operator.open_window_count(), 1);

    output.extend(
        operator
            .on_watermark(Watermark::END_OF_INPUT, &mut harness.ctx())
            .unwrap(),
    );
    let starts: Vec<i64> = batches(&output)
        .iter()
        .map(|b| b.column(1).as_primitive::<TimestampMillisecondType>().value(0))
        .collect();
    assert_eq!(starts, vec![0, 5_000, 10_000]);
    assert!(harness.state.is_empty());
    assert_eq!(harness.timers.pending_count(), 0);
}

/// Store whose deletes fail, so a window cannot finish eviction.
struct RejectDeletes(InMemoryStore);

impl StateStore for RejectDeletes {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.0.get(key)
    }
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        self.0.put(key, value)
    }
    fn delete(&mut self, _key: &[u8]) -> Result<(), StateError> {
        Err(StateError::Io(std::io::Error::other("delete rejected")))
    }
    fn prefix_scan<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        self.0.prefix_scan(prefix)
    }
    fn range_scan<'a>(
        &'a self,
        range: Range<&'a [u8]>,
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        self.0.range_scan(range)
    }
    fn size_bytes(&self) -> usize {
        self.0.size_bytes()
    }
    fn len(&self) -> usize {
        self.0.len()
    }
    fn snapshot(&self) -> StateSnapshot {
        self.0.snapshot()
    }
    fn restore(&mut self, snapshot: StateSnapshot) -> Result<(), StateError> {
        self.0.restore(snapshot)
    }
    fn clear(&mut self) -> Result<(), StateError> {
        self.0.clear()
    }
}

#[test]
fn test_failed_eviction_leaves_window_closed() {
    let mut timers = TimerService::new();
    let mut state = RejectDeletes(InMemoryStore::new());
    let mut operator = WindowTriggerOperator::new(distinct_config(), &input_schema()).unwrap();
    let window = WindowId::new(0, 5_000);

    let mut ctx = OperatorContext {
        processing_time: 0,
        timers: &mut timers,
        state: &mut state,
        operator_index: 0,
    };
    operator
        .process(&event(&[(Some("a"), Some(1), Some(1_000))]), &mut ctx)
        .unwrap();
    assert_eq!(operator.window_phase(&window), Some(WindowPhase::Open));

    assert!(operator
        .on_watermark(Watermark::new(5_000), &mut ctx)
        .is_err());
    assert_eq!(operator.window_phase(&window), Some(WindowPhase::Closed));
    assert_eq!(operator.open_window_count(), 0);
}

#[test]
fn test_null_group_key_forms_its_own_group() {
    let mut harness = Harness::new();
    let mut operator = WindowTriggerOperator::new(distinct_config(), &input_schema()).unwrap();

    operator
        .process(
            &event(&[
                (None, Some(1), Some(1_000)),
                (None, Some(2), Some(2_000)),
                (Some("a"), Some(1), Some(3_000)),
            ]),
            &mut harness.ctx(),
        )
        .unwrap();
    let output = operator
        .on_watermark(Watermark::END_OF_INPUT, &mut harness.ctx())
        .unwrap();
    let batch = batches(&output)[0];
    assert_eq!(names(batch), vec![None, Some("a".into())]);
    let counts = batch.column(4).as_primitive::<Int64Type>();
    assert_eq!(counts.values().to_vec(), vec![2, 1]);
}

#[test]
fn test_rows_mode_emits_buffered_rows_with_window_columns() {
    let mut harness = Harness::new();
    let config = WindowTriggerConfig::new("rows", "ts", Duration::from_secs(5))
        .with_aggregation(WindowAggregation::Rows);
    let mut operator = WindowTriggerOperator::new(config, &input_schema()).unwrap();

    operator
        .process(
            &event(&[
                (Some("z"), Some(1), Some(6_000)),
                (Some("a"), None, Some(7_000)),
            ]),
            &mut harness.ctx(),
        )
        .unwrap();
    let output = operator
        .on_watermark(Watermark::new(10_000), &mut harness.ctx())
        .unwrap();
    let batch = batches(&output)[0];
    assert_eq!(batch.num_columns(), 6);
    assert_eq!(names(batch), vec![Some("z".into()), Some("a".into())]);
    assert!(batch.column(1).is_null(1));
    let ends = batch.column(4).as_primitive::<TimestampMillisecondType>();
    assert_eq!(ends.values().to_vec(), vec![10_000, 10_000]);
}

#[test]
fn test_rows_without_event_time_are_excluded() {
    let mut harness = Harness::new();
    let mut operator = WindowTriggerOperator::new(distinct_config(), &input_schema()).unwrap();

    let output = operator
        .process(
            &event(&[(Some("a"), Some(1), None), (Some("a"), Some(2), Some(1_000))]),
            &mut harness.ctx(),
        )
        .unwrap();
    assert!(batches(&output).is_empty());
    assert_eq!(operator.time_assigner_metrics().null_times, 1);

    let output = operator
        .on_watermark(Watermark::END_OF_INPUT, &mut harness.ctx())
        .unwrap();
    let counts = batches(&output)[0].column(4).as_primitive::<Int64Type>();
    assert_eq!(counts.value(0), 1);
}

#[test]
fn test_checkpoint_restore_rebuilds_open_windows() {
    let mut harness = Harness::new();
    let mut operator = WindowTriggerOperator::new(distinct_config(), &input_schema()).unwrap();
    operator
        .process(
            &event(&[
                (Some("a"), Some(1), Some(1_000)),
                (Some("b"), Some(1), Some(6_000)),
            ]),
            &mut harness.ctx(),
        )
        .unwrap();

    let state = operator.checkpoint().unwrap();
    let snapshot = harness.state.snapshot();

    let mut recovered = Harness::new();
    recovered.state.restore(snapshot).unwrap();
    let mut restored = WindowTriggerOperator::new(distinct_config(), &input_schema()).unwrap();
    restored.restore(state, &mut recovered.ctx()).unwrap();

    assert_eq!(restored.current_watermark(), Watermark::new(6_000));
    assert_eq!(restored.open_window_count(), 1);
    assert_eq!(recovered.timers.next_timer_timestamp(), Some(10_000));

    // a row for the window closed before the checkpoint is still late
    restored
        .process(&event(&[(Some("a"), Some(9), Some(2_000))]), &mut recovered.ctx())
        .unwrap();
    assert_eq!(restored.late_data_metrics().late_rows_dropped(), 1);

    let output = restored
        .on_watermark(Watermark::END_OF_INPUT, &mut recovered.ctx())
        .unwrap();
    let results = batches(&output);
    assert_eq!(results.len(), 1);
    assert_eq!(names(results[0]), vec![Some("b".into())]);
}

#[test]
fn test_restore_rejects_foreign_state() {
    let mut harness = Harness::new();
    let mut operator = WindowTriggerOperator::new(distinct_config(), &input_schema()).unwrap();
    let foreign = OperatorState {
        operator_id: "right_window".into(),
        data: Vec::new(),
    };
    assert!(matches!(
        operator.restore(foreign, &mut harness.ctx()),
        Err(OperatorError::StateAccessFailed(_))
    ));
}

#[test]
fn test_session_time_zone_shifts_windows() {
    let schema = Arc::new(Schema::new(vec![Field::new(
        "ts",
        DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
        true,
    )]));
    let config = WindowTriggerConfig::new("ltz", "ts", Duration::from_secs(5))
        .with_time_semantics(TimeSemantics::TimestampLtz)
        .with_session_time_zone("+01:00")
        .with_aggregation(WindowAggregation::Aggregate(vec![AggregateExpr::count_star(
            "n",
        )]));
    let mut operator = WindowTriggerOperator::new(config, &schema).unwrap();
    let mut harness = Harness::new();

    let times = TimestampMillisecondArray::from(vec![Some(2_000)]).with_timezone("UTC");
    let batch = RecordBatch::try_new(schema, vec![Arc::new(times)]).unwrap();
    operator
        .process(&Event::new(0, batch), &mut harness.ctx())
        .unwrap();
    assert_eq!(
        operator.window_phase(&WindowId::new(3_600_000, 3_605_000)),
        Some(WindowPhase::Open)
    );
}
