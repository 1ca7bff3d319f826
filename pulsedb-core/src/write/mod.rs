//! Write pipeline
//!
//! Ingress delivers vectors of samples on a channel. A single coordinator
//! drains them into the batch buffer; a flush routine empties the buffer
//! into the writer channel every two seconds and once more at shutdown.
//! A pool of writer workers consumes object-wise batches and appends each
//! sample through the storage engine.
//!
//! Closing the ingress channel drains everything: the final flush runs,
//! the writer channel closes, and the pipeline returns only after every
//! dispatched batch is fully written.

pub mod batch;
pub mod worker;

pub use batch::{BatchBuffer, ObjectBatch};
pub use worker::{coerce_value, counter_day_dir};

use crate::storage::StorageEngine;
use crate::{defaults, CounterRegistry, DataPoint, Sample};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub(crate) async fn run_write_pipeline(
    storage: StorageEngine,
    registry: Arc<CounterRegistry>,
    root: PathBuf,
    writers: usize,
    mut data_rx: mpsc::Receiver<Vec<Sample>>,
) {
    let writers = writers.max(1);
    let (batch_tx, batch_rx) = mpsc::channel(writers * defaults::WRITER_BATCH_MULTIPLIER);
    let batch_rx = Arc::new(Mutex::new(batch_rx));

    let mut workers = Vec::with_capacity(writers);
    for worker_id in 0..writers {
        workers.push(tokio::spawn(worker::run_worker(
            worker_id,
            batch_rx.clone(),
            storage.clone(),
            registry.clone(),
            root.clone(),
        )));
    }

    let buffer = Arc::new(BatchBuffer::new());
    let (stop_tx, stop_rx) = oneshot::channel();
    let flusher = tokio::spawn(flush_routine(buffer.clone(), batch_tx.clone(), stop_rx));

    info!(writers, "write pipeline started");

    while let Some(samples) = data_rx.recv().await {
        for sample in samples {
            buffer.add(
                sample.object_id,
                sample.counter_id,
                DataPoint {
                    timestamp: sample.timestamp,
                    value: sample.value,
                },
            );
        }
    }

    // Ingress closed: final flush, then let the workers drain.
    let _ = stop_tx.send(());
    let _ = flusher.await;
    drop(batch_tx);
    for handle in workers {
        let _ = handle.await;
    }

    info!("write pipeline drained");
}

async fn flush_routine(
    buffer: Arc<BatchBuffer>,
    tx: mpsc::Sender<ObjectBatch>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(defaults::FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    let sent = buffer.flush(&tx).await;
                    debug!(batches = sent, "periodic flush");
                }
            }
            _ = &mut stop_rx => {
                if !buffer.is_empty() {
                    let sent = buffer.flush(&tx).await;
                    debug!(batches = sent, "final flush");
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{decode_records, StorageOptions};
    use crate::{Value, ValueType};
    use tempfile::TempDir;

    fn sample(object_id: u32, counter_id: u16, timestamp: u32, value: Value) -> Sample {
        Sample {
            object_id,
            counter_id,
            value,
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_accepted_samples() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let registry = Arc::new(CounterRegistry::default());
        let storage = StorageEngine::new(StorageOptions::default(), registry.clone());

        let (tx, rx) = mpsc::channel(16);
        let pipeline = tokio::spawn(run_write_pipeline(
            storage.clone(),
            registry,
            root.clone(),
            2,
            rx,
        ));

        tx.send(vec![
            sample(1, 1, 1_700_000_000, Value::Float(12.5)),
            sample(1, 1, 1_700_000_005, Value::Float(13.0)),
            sample(2, 2, 1_700_000_000, Value::Int(7)),
        ])
        .await
        .unwrap();
        drop(tx);

        pipeline.await.unwrap();

        let day = counter_day_dir(&root, 1, 1_700_000_000);
        let blocks = storage.get_by_path(1, &day).unwrap();
        let points: Vec<_> = blocks
            .iter()
            .flat_map(|b| decode_records(b, 1, u32::MAX, ValueType::Float))
            .collect();
        assert_eq!(points.len(), 2);

        let day = counter_day_dir(&root, 2, 1_700_000_000);
        let blocks = storage.get_by_path(2, &day).unwrap();
        let points: Vec<_> = blocks
            .iter()
            .flat_map(|b| decode_records(b, 1, u32::MAX, ValueType::Int))
            .collect();
        assert_eq!(points, vec![DataPoint::new(1_700_000_000, Value::Int(7))]);
    }

    #[tokio::test]
    async fn test_bad_samples_do_not_stall_the_pipeline() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let registry = Arc::new(CounterRegistry::default());
        let storage = StorageEngine::new(StorageOptions::default(), registry.clone());

        let (tx, rx) = mpsc::channel(16);
        let pipeline = tokio::spawn(run_write_pipeline(
            storage.clone(),
            registry,
            root.clone(),
            1,
            rx,
        ));

        tx.send(vec![
            // Unknown counter: dropped.
            sample(1, 77, 1_700_000_000, Value::Int(1)),
            // Unparseable int for an int counter: dropped.
            sample(1, 2, 1_700_000_000, Value::from("twelve")),
            // Valid sample: written.
            sample(1, 2, 1_700_000_010, Value::Int(12)),
        ])
        .await
        .unwrap();
        drop(tx);

        pipeline.await.unwrap();

        let day = counter_day_dir(&root, 2, 1_700_000_010);
        let blocks = storage.get_by_path(1, &day).unwrap();
        let points: Vec<_> = blocks
            .iter()
            .flat_map(|b| decode_records(b, 1, u32::MAX, ValueType::Int))
            .collect();
        assert_eq!(points, vec![DataPoint::new(1_700_000_010, Value::Int(12))]);
    }
}
