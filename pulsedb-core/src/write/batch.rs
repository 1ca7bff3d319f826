//! Batch buffer for incoming samples

use crate::DataPoint;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::warn;

/// All buffered points for one (object, counter) pair, handed to a writer
/// worker as a unit
#[derive(Debug, Clone)]
pub struct ObjectBatch {
    pub object_id: u32,
    pub counter_id: u16,
    pub points: Vec<DataPoint>,
}

/// Accumulates incoming samples keyed by (object, counter) between
/// flushes. `add` and `drain` are serialized by an internal lock, so a
/// flush never observes a half-inserted sample.
#[derive(Default)]
pub struct BatchBuffer {
    buffer: Mutex<HashMap<(u32, u16), Vec<DataPoint>>>,
}

impl BatchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one point for an (object, counter) pair
    pub fn add(&self, object_id: u32, counter_id: u16, point: DataPoint) {
        self.buffer
            .lock()
            .entry((object_id, counter_id))
            .or_default()
            .push(point);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Atomically take everything buffered so far
    pub fn drain(&self) -> Vec<ObjectBatch> {
        let drained = std::mem::take(&mut *self.buffer.lock());
        drained
            .into_iter()
            .filter(|(_, points)| !points.is_empty())
            .map(|((object_id, counter_id), points)| ObjectBatch {
                object_id,
                counter_id,
                points,
            })
            .collect()
    }

    /// Drain the buffer and dispatch one batch per (object, counter)
    /// into the writer channel. Returns the number of batches sent.
    pub async fn flush(&self, tx: &mpsc::Sender<ObjectBatch>) -> usize {
        let batches = self.drain();
        let mut sent = 0;

        for batch in batches {
            if tx.send(batch).await.is_err() {
                warn!("writer channel closed mid-flush, dropping remaining batches");
                break;
            }
            sent += 1;
        }

        sent
    }
}
