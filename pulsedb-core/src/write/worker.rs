//! Writer workers
//!
//! Each worker drains object-wise batches from the shared channel,
//! coerces every value to the counter's declared type, serializes it and
//! hands the record to the storage engine under the day/counter path
//! derived from the sample's timestamp (UTC). A bad sample is logged and
//! dropped; the worker loop never aborts for one.

use crate::storage::{encode_record, StorageEngine};
use crate::write::batch::ObjectBatch;
use crate::{CounterRegistry, DataPoint, Error, Result, Timestamp, Value, ValueType};
use chrono::{DateTime, Datelike};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Validate and coerce a sample value to the counter's declared type
pub fn coerce_value(counter_id: u16, value: Value, expected: ValueType) -> Result<Value> {
    let mismatch = || Error::TypeMismatch {
        counter_id,
        expected,
    };

    match expected {
        ValueType::Int => match value {
            Value::Int(v) => Ok(Value::Int(v)),
            Value::Float(v) => Ok(Value::Int(v as i64)),
            Value::Str(s) => s.parse::<i64>().map(Value::Int).map_err(|_| mismatch()),
        },
        ValueType::Float => match value {
            Value::Float(v) => Ok(Value::Float(v)),
            Value::Int(v) => Ok(Value::Float(v as f64)),
            Value::Str(s) => s.parse::<f64>().map(Value::Float).map_err(|_| mismatch()),
        },
        ValueType::Str => match value {
            Value::Str(s) => Ok(Value::Str(s)),
            Value::Int(v) => Ok(Value::Str(v.to_string())),
            Value::Float(v) => Ok(Value::Str(v.to_string())),
        },
    }
}

/// The `<root>/YYYY/MM/DD/counter_<id>` directory for a sample timestamp,
/// derived in UTC
pub fn counter_day_dir(root: &Path, counter_id: u16, timestamp: Timestamp) -> PathBuf {
    let date = DateTime::from_timestamp(timestamp as i64, 0)
        .map(|dt| dt.date_naive())
        .unwrap_or_default();

    root.join(format!(
        "{:04}/{:02}/{:02}",
        date.year(),
        date.month(),
        date.day()
    ))
    .join(format!("counter_{counter_id}"))
}

pub(crate) async fn run_worker(
    worker_id: usize,
    batches: Arc<Mutex<mpsc::Receiver<ObjectBatch>>>,
    storage: StorageEngine,
    registry: Arc<CounterRegistry>,
    root: PathBuf,
) {
    loop {
        let batch = { batches.lock().await.recv().await };
        let Some(batch) = batch else {
            break;
        };

        debug!(
            worker = worker_id,
            object_id = batch.object_id,
            counter_id = batch.counter_id,
            count = batch.points.len(),
            "writing batch"
        );

        for point in batch.points {
            if let Err(e) = write_sample(
                &storage,
                &registry,
                &root,
                batch.object_id,
                batch.counter_id,
                point,
            ) {
                warn!(
                    worker = worker_id,
                    object_id = batch.object_id,
                    counter_id = batch.counter_id,
                    error = %e,
                    "dropping sample"
                );
            }
        }
    }

    debug!(worker = worker_id, "writer exiting");
}

fn write_sample(
    storage: &StorageEngine,
    registry: &CounterRegistry,
    root: &Path,
    object_id: u32,
    counter_id: u16,
    point: DataPoint,
) -> Result<()> {
    let expected = registry.value_type(counter_id)?;
    let value = coerce_value(counter_id, point.value, expected)?;
    let record = encode_record(point.timestamp, &value);

    storage.set_storage_path(counter_day_dir(root, counter_id, point.timestamp))?;
    storage.put(object_id, counter_id, &record)
}
