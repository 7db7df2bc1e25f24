//! Ensemble aggregation of nominal and uncertainty-worker output.
//!
//! For every step the nominal model's designated block (normally
//! `WeatheringOutput`) is replaced by a combined record:
//!
//! ```text
//! { time_stamp, nominal, low, high, "0": fragment, "1": fragment, ... }
//! ```
//!
//! `low`/`high` are the field-wise minimum and maximum across the workers'
//! blocks. Worker order is preserved in the numbered keys, so the merge is a
//! stable indexed merge rather than a set operation.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use driftline_types::OutputRecord;
use serde_json::{Map, Value};

use crate::model::WorkerResult;

/// Key of the timestamp field inside the designated block.
pub const TIME_STAMP_KEY: &str = "time_stamp";

/// Errors raised while merging worker output into the nominal record.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// A worker reported a failure; it is re-raised with its origin context.
    #[error("uncertainty worker {index} failed: {message}")]
    Worker {
        /// Position of the worker in the set.
        index: usize,
        /// The worker's error message.
        message: String,
        /// Where the error arose inside the worker.
        context: String,
    },

    /// A worker's output lacks the designated block.
    #[error("uncertainty worker {index} produced no `{block}` block")]
    MissingBlock {
        /// Position of the worker in the set.
        index: usize,
        /// The designated block name.
        block: String,
    },

    /// The designated block is not a JSON object.
    #[error("`{block}` block is not an object")]
    MalformedBlock {
        /// The designated block name.
        block: String,
    },

    /// A field's values across workers cannot be ordered against each other.
    #[error("field `{field}` has values that cannot be ordered")]
    Incomparable {
        /// The offending field.
        field: String,
    },
}

/// Merge uncertainty-worker results into the nominal output record.
///
/// `workers` is `None` (or empty) when the run has no uncertainty workers;
/// the designated block is then wrapped with null bounds. Otherwise the first
/// worker failure, in worker order, aborts the merge.
///
/// # Errors
///
/// Returns [`AggregateError`] if a worker failed or its output cannot be
/// merged.
pub fn aggregate(
    mut output: OutputRecord,
    workers: Option<&[WorkerResult]>,
    block: &str,
) -> Result<OutputRecord, AggregateError> {
    let workers = workers.filter(|w| !w.is_empty());

    let fragments = match workers {
        Some(results) => Some(surface_failures(results)?),
        None => None,
    };

    let Some(nominal) = output.remove(block) else {
        return Ok(output);
    };
    let time_stamp = nominal.get(TIME_STAMP_KEY).cloned().unwrap_or(Value::Null);

    let mut combined = Map::new();
    combined.insert(String::from(TIME_STAMP_KEY), time_stamp);

    match fragments {
        None => {
            combined.insert(String::from("nominal"), nominal);
            combined.insert(String::from("low"), Value::Null);
            combined.insert(String::from("high"), Value::Null);
        }
        Some(fragments) => {
            let blocks = worker_blocks(&fragments, block)?;
            let (low, high) = bounds(&blocks)?;
            combined.insert(String::from("nominal"), nominal);
            combined.insert(String::from("low"), Value::Object(low));
            combined.insert(String::from("high"), Value::Object(high));
            for (index, worker_block) in blocks.into_iter().enumerate() {
                combined.insert(index.to_string(), Value::Object(worker_block.clone()));
            }
        }
    }

    output.insert(block.to_owned(), Value::Object(combined));
    Ok(output)
}

/// Record aggregation timing on the output record, in seconds.
pub fn attach_response_times(output: &mut OutputRecord, uncertain: Duration, total: Duration) {
    output.insert(
        String::from("uncertain_response_time"),
        Value::from(uncertain.as_secs_f64()),
    );
    output.insert(
        String::from("total_response_time"),
        Value::from(total.as_secs_f64()),
    );
}

/// Return the worker fragments, or the first encoded failure as an error.
fn surface_failures(results: &[WorkerResult]) -> Result<Vec<&OutputRecord>, AggregateError> {
    results
        .iter()
        .enumerate()
        .map(|(index, result)| match result {
            WorkerResult::Fragment(record) => Ok(record),
            WorkerResult::Failed(failure) => Err(AggregateError::Worker {
                index,
                message: failure.message.clone(),
                context: failure.context.clone(),
            }),
        })
        .collect()
}

fn worker_blocks<'a>(
    fragments: &[&'a OutputRecord],
    block: &str,
) -> Result<Vec<&'a Map<String, Value>>, AggregateError> {
    fragments
        .iter()
        .enumerate()
        .map(|(index, fragment)| match fragment.get(block) {
            Some(Value::Object(map)) => Ok(map),
            Some(_) => Err(AggregateError::MalformedBlock {
                block: block.to_owned(),
            }),
            None => Err(AggregateError::MissingBlock {
                index,
                block: block.to_owned(),
            }),
        })
        .collect()
}

/// Field-wise minimum and maximum over every field any worker reports.
fn bounds(
    blocks: &[&Map<String, Value>],
) -> Result<(Map<String, Value>, Map<String, Value>), AggregateError> {
    let mut by_field: BTreeMap<&str, Vec<&Value>> = BTreeMap::new();
    for block in blocks {
        for (field, value) in *block {
            by_field.entry(field.as_str()).or_default().push(value);
        }
    }

    let mut low = Map::new();
    let mut high = Map::new();
    for (field, values) in by_field {
        let incomparable = || AggregateError::Incomparable {
            field: field.to_owned(),
        };
        let mut iter = values.into_iter();
        let Some(first) = iter.next() else {
            continue;
        };
        let (mut min, mut max) = (first, first);
        for value in iter {
            if compare(value, min).ok_or_else(incomparable)? == Ordering::Less {
                min = value;
            }
            if compare(value, max).ok_or_else(incomparable)? == Ordering::Greater {
                max = value;
            }
        }
        low.insert(field.to_owned(), min.clone());
        high.insert(field.to_owned(), max.clone());
    }
    Ok((low, high))
}

/// Order two JSON scalars of the same kind; `None` for mixed kinds or NaN.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::WorkerFailure;

    const BLOCK: &str = "WeatheringOutput";

    fn record(block: Value) -> OutputRecord {
        let mut record = OutputRecord::new();
        record.insert(String::from("step_num"), json!(4));
        record.insert(String::from(BLOCK), block);
        record
    }

    fn fragment(block: Value) -> WorkerResult {
        WorkerResult::Fragment(record(block))
    }

    #[test]
    fn low_and_high_are_fieldwise_extremes() {
        let nominal = record(json!({"time_stamp": "t4", "a": 2}));
        let workers = [
            fragment(json!({"a": 1})),
            fragment(json!({"a": 3})),
            fragment(json!({"a": 2})),
        ];
        let out = aggregate(nominal, Some(&workers), BLOCK).unwrap();
        let combined = &out[BLOCK];
        assert_eq!(combined["low"]["a"], json!(1));
        assert_eq!(combined["high"]["a"], json!(3));
        assert_eq!(combined["time_stamp"], json!("t4"));
        assert_eq!(combined["nominal"]["a"], json!(2));
    }

    #[test]
    fn worker_fragments_keep_their_index() {
        let nominal = record(json!({"time_stamp": "t", "a": 0}));
        let workers = [fragment(json!({"a": 10})), fragment(json!({"a": 20}))];
        let out = aggregate(nominal, Some(&workers), BLOCK).unwrap();
        assert_eq!(out[BLOCK]["0"]["a"], json!(10));
        assert_eq!(out[BLOCK]["1"]["a"], json!(20));
        // Unrelated top-level entries survive.
        assert_eq!(out["step_num"], json!(4));
    }

    #[test]
    fn fields_missing_from_some_workers_use_the_rest() {
        let nominal = record(json!({"time_stamp": "t"}));
        let workers = [fragment(json!({"a": 5, "b": 1.5})), fragment(json!({"a": 4}))];
        let out = aggregate(nominal, Some(&workers), BLOCK).unwrap();
        assert_eq!(out[BLOCK]["low"]["a"], json!(4));
        assert_eq!(out[BLOCK]["low"]["b"], json!(1.5));
        assert_eq!(out[BLOCK]["high"]["b"], json!(1.5));
    }

    #[test]
    fn no_workers_wraps_block_with_null_bounds() {
        let nominal = record(json!({"time_stamp": "t0", "a": 7}));
        let out = aggregate(nominal, None, BLOCK).unwrap();
        assert_eq!(
            out[BLOCK],
            json!({"time_stamp": "t0", "nominal": {"time_stamp": "t0", "a": 7}, "low": null, "high": null})
        );
    }

    #[test]
    fn record_without_block_passes_through() {
        let mut plain = OutputRecord::new();
        plain.insert(String::from("step_num"), json!(1));
        let out = aggregate(plain.clone(), None, BLOCK).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn first_worker_failure_is_reraised() {
        let nominal = record(json!({"time_stamp": "t", "a": 0}));
        let workers = [
            fragment(json!({"a": 1})),
            WorkerResult::Failed(WorkerFailure {
                message: String::from("negative viscosity"),
                context: String::from("uncertainty worker 1"),
            }),
            WorkerResult::Failed(WorkerFailure {
                message: String::from("second failure"),
                context: String::from("uncertainty worker 2"),
            }),
        ];
        let err = aggregate(nominal, Some(&workers), BLOCK).unwrap_err();
        match err {
            AggregateError::Worker { index, message, .. } => {
                assert_eq!(index, 1);
                assert_eq!(message, "negative viscosity");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn worker_without_block_is_an_error() {
        let nominal = record(json!({"time_stamp": "t"}));
        let workers = [WorkerResult::Fragment(OutputRecord::new())];
        let err = aggregate(nominal, Some(&workers), BLOCK).unwrap_err();
        assert!(matches!(err, AggregateError::MissingBlock { index: 0, .. }));
    }

    #[test]
    fn mixed_value_kinds_are_incomparable() {
        let nominal = record(json!({"time_stamp": "t"}));
        let workers = [fragment(json!({"a": 1})), fragment(json!({"a": "one"}))];
        let err = aggregate(nominal, Some(&workers), BLOCK).unwrap_err();
        assert!(matches!(err, AggregateError::Incomparable { field } if field == "a"));
    }

    #[test]
    fn response_times_are_seconds() {
        let mut out = OutputRecord::new();
        attach_response_times(
            &mut out,
            Duration::from_millis(250),
            Duration::from_millis(1500),
        );
        assert_eq!(out["uncertain_response_time"], json!(0.25));
        assert_eq!(out["total_response_time"], json!(1.5));
    }
}
