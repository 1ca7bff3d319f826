//! Database wiring
//!
//! Connects the storage engine, the write pipeline and the query engine
//! over the caller's channels. The caller owns the ingress ends: closing
//! the data channel drains and stops the write side, closing the query
//! channel drains the query side and closes the response channel.

use crate::query::run_query_engine;
use crate::storage::{StorageEngine, StorageOptions};
use crate::write::run_write_pipeline;
use crate::{Config, CounterRegistry, Query, QueryResponse, Result, Sample};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Database;

impl Database {
    /// Start the engine on the given channels. Must be called from
    /// within a tokio runtime. Failure to create the storage root is
    /// fatal and surfaces here.
    pub fn start(
        config: Config,
        registry: CounterRegistry,
        data_rx: mpsc::Receiver<Vec<Sample>>,
        query_rx: mpsc::Receiver<Query>,
        response_tx: mpsc::Sender<QueryResponse>,
    ) -> Result<DatabaseHandle> {
        std::fs::create_dir_all(&config.storage_path)?;

        let registry = Arc::new(registry);
        let storage = StorageEngine::new(StorageOptions::from(&config), registry.clone());

        let write = tokio::spawn(run_write_pipeline(
            storage.clone(),
            registry.clone(),
            config.storage_path.clone(),
            config.writers,
            data_rx,
        ));

        let query = tokio::spawn(run_query_engine(
            storage.clone(),
            registry,
            config.storage_path.clone(),
            config.readers,
            config.buffred_chan_size,
            query_rx,
            response_tx,
        ));

        info!(storage_path = %config.storage_path.display(), "database started");

        Ok(DatabaseHandle {
            storage,
            write: Some(write),
            query: Some(query),
        })
    }
}

/// Handle over the running pipelines
pub struct DatabaseHandle {
    storage: StorageEngine,
    write: Option<JoinHandle<()>>,
    query: Option<JoinHandle<()>>,
}

impl DatabaseHandle {
    /// Wait for the write pipeline to drain. Returns once every sample
    /// accepted before the data channel closed is in storage.
    pub async fn drain_writes(&mut self) {
        if let Some(handle) = self.write.take() {
            let _ = handle.await;
        }
    }

    /// Wait for both pipelines and release the mapped files
    pub async fn shutdown(mut self) -> Result<()> {
        self.drain_writes().await;
        if let Some(handle) = self.query.take() {
            let _ = handle.await;
        }
        info!("database stopped");
        self.storage.close()
    }

    /// Direct access to the shared storage engine
    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataPoint, Value};
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct TestDb {
        data_tx: Option<mpsc::Sender<Vec<Sample>>>,
        query_tx: mpsc::Sender<Query>,
        response_rx: mpsc::Receiver<QueryResponse>,
        handle: DatabaseHandle,
        _dir: TempDir,
    }

    fn start_test_db() -> TestDb {
        let dir = TempDir::new().unwrap();
        let config = Config {
            writers: 2,
            readers: 2,
            buffred_chan_size: 16,
            storage_path: dir.path().join("db"),
            ..Default::default()
        };

        let (data_tx, data_rx) = mpsc::channel(16);
        let (query_tx, query_rx) = mpsc::channel(16);
        let (response_tx, response_rx) = mpsc::channel(16);

        let handle = Database::start(
            config,
            CounterRegistry::default(),
            data_rx,
            query_rx,
            response_tx,
        )
        .unwrap();

        TestDb {
            data_tx: Some(data_tx),
            query_tx,
            response_rx,
            handle,
            _dir: dir,
        }
    }

    fn sample(object_id: u32, counter_id: u16, timestamp: u32, value: impl Into<Value>) -> Sample {
        Sample {
            object_id,
            counter_id,
            value: value.into(),
            timestamp,
        }
    }

    fn raw_query(query_id: u64, object_ids: Vec<u32>, counter_id: u16) -> Query {
        Query {
            query_id,
            from: 1_699_999_990,
            to: 1_700_000_020,
            object_ids,
            counter_id,
            aggregation: String::new(),
            interval: 0,
            group_by_objects: false,
        }
    }

    /// Send one batch, close the data channel and wait for the write
    /// pipeline to drain it into storage.
    async fn write_and_drain(db: &mut TestDb, samples: Vec<Sample>) {
        let data_tx = db.data_tx.take().unwrap();
        data_tx.send(samples).await.unwrap();
        drop(data_tx);
        db.handle.drain_writes().await;
    }

    async fn run_query(db: &mut TestDb, query: Query) -> QueryResponse {
        let want = query.query_id;
        db.query_tx.send(query).await.unwrap();
        loop {
            let response = db.response_rx.recv().await.unwrap();
            if response.query_id == want {
                return response;
            }
        }
    }

    fn scenario_a_samples() -> Vec<Sample> {
        vec![
            sample(1, 1, 1_700_000_000, 12.5),
            sample(1, 1, 1_700_000_005, 13.0),
            sample(1, 1, 1_700_000_010, 11.75),
        ]
    }

    #[tokio::test]
    async fn test_scenario_a_raw_roundtrip() {
        let mut db = start_test_db();
        write_and_drain(&mut db, scenario_a_samples()).await;

        let response = run_query(&mut db, raw_query(1, vec![1], 1)).await;
        assert_eq!(response.query_id, 1);
        assert_eq!(
            response.data,
            HashMap::from([(
                1,
                vec![
                    DataPoint::new(1_700_000_000, 12.5),
                    DataPoint::new(1_700_000_005, 13.0),
                    DataPoint::new(1_700_000_010, 11.75),
                ]
            )])
        );

        drop(db.query_tx);
        db.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scenario_b_avg() {
        let mut db = start_test_db();
        write_and_drain(&mut db, scenario_a_samples()).await;

        let mut query = raw_query(2, vec![1], 1);
        query.aggregation = "avg".to_string();

        let response = run_query(&mut db, query).await;
        assert_eq!(
            response.data,
            HashMap::from([(1, vec![DataPoint::new(1_700_000_010, 37.25 / 3.0)])])
        );

        drop(db.query_tx);
        db.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scenario_c_histogram_merged() {
        let mut db = start_test_db();
        write_and_drain(&mut db, scenario_a_samples()).await;

        let mut query = raw_query(3, vec![1], 1);
        query.aggregation = "histogram".to_string();
        query.interval = 10;

        let response = run_query(&mut db, query).await;
        assert_eq!(
            response.data,
            HashMap::from([(
                0,
                vec![
                    DataPoint::new(1_700_000_000, Value::Int(2)),
                    DataPoint::new(1_700_000_010, Value::Int(1)),
                ]
            )])
        );

        drop(db.query_tx);
        db.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scenario_d_gauge() {
        let mut db = start_test_db();
        write_and_drain(
            &mut db,
            vec![
                sample(2, 1, 1_700_000_000, 5.0),
                sample(2, 1, 1_700_000_045, 7.0),
            ],
        )
        .await;

        let mut query = raw_query(4, vec![2], 1);
        query.to = 1_700_000_100;
        query.aggregation = "gauge".to_string();

        let response = run_query(&mut db, query).await;
        assert_eq!(
            response.data,
            HashMap::from([(
                2,
                vec![
                    DataPoint::new(1_699_999_980, 5.0),
                    DataPoint::new(1_700_000_040, 7.0),
                ]
            )])
        );

        drop(db.query_tx);
        db.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scenario_e_all_objects() {
        let mut db = start_test_db();
        write_and_drain(
            &mut db,
            vec![
                sample(10, 1, 1_700_000_000, 1.0),
                sample(20, 1, 1_700_000_020, 2.0),
                sample(30, 1, 1_700_000_040, 3.0),
            ],
        )
        .await;

        let mut query = raw_query(5, vec![], 1);
        query.to = 1_700_000_060;

        let response = run_query(&mut db, query).await;
        let mut keys: Vec<u32> = response.data.keys().copied().collect();
        keys.sort();
        assert_eq!(keys, vec![10, 20, 30]);

        drop(db.query_tx);
        db.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scenario_f_dedup() {
        let mut db = start_test_db();
        write_and_drain(
            &mut db,
            vec![
                sample(1, 1, 1_700_000_000, 12.5),
                sample(1, 1, 1_700_000_000, 12.5),
            ],
        )
        .await;

        let response = run_query(&mut db, raw_query(6, vec![1], 1)).await;
        assert_eq!(
            response.data,
            HashMap::from([(1, vec![DataPoint::new(1_700_000_000, 12.5)])])
        );

        drop(db.query_tx);
        db.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_string_counter_roundtrip() {
        let mut db = start_test_db();
        write_and_drain(
            &mut db,
            vec![
                sample(7, 3, 1_700_000_000, "link up"),
                sample(7, 3, 1_700_000_010, "link down"),
            ],
        )
        .await;

        let response = run_query(&mut db, raw_query(7, vec![7], 3)).await;
        assert_eq!(
            response.data,
            HashMap::from([(
                7,
                vec![
                    DataPoint::new(1_700_000_000, "link up"),
                    DataPoint::new(1_700_000_010, "link down"),
                ]
            )])
        );

        drop(db.query_tx);
        db.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_spans_utc_days() {
        let mut db = start_test_db();
        // 1700006399 is the last second of 2023-11-14 UTC; the second
        // sample lands on the next day's directory tree.
        write_and_drain(
            &mut db,
            vec![
                sample(4, 1, 1_700_006_399, 1.0),
                sample(4, 1, 1_700_006_401, 2.0),
            ],
        )
        .await;

        let mut query = raw_query(11, vec![4], 1);
        query.from = 1_700_006_000;
        query.to = 1_700_007_000;

        let response = run_query(&mut db, query).await;
        assert_eq!(
            response.data,
            HashMap::from([(
                4,
                vec![
                    DataPoint::new(1_700_006_399, 1.0),
                    DataPoint::new(1_700_006_401, 2.0),
                ]
            )])
        );

        drop(db.query_tx);
        db.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_grouped_histogram_is_per_object() {
        let mut db = start_test_db();
        write_and_drain(
            &mut db,
            vec![
                sample(1, 1, 1_700_000_000, 1.0),
                sample(1, 1, 1_700_000_005, 2.0),
                sample(2, 1, 1_700_000_012, 3.0),
            ],
        )
        .await;

        let mut query = raw_query(12, vec![1, 2], 1);
        query.aggregation = "histogram".to_string();
        query.interval = 10;
        query.group_by_objects = true;

        let response = run_query(&mut db, query).await;
        assert_eq!(
            response.data,
            HashMap::from([
                (1, vec![DataPoint::new(1_700_000_000, Value::Int(2))]),
                (2, vec![DataPoint::new(1_700_000_010, Value::Int(1))]),
            ])
        );

        drop(db.query_tx);
        db.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_counter_query_is_empty() {
        let mut db = start_test_db();
        write_and_drain(&mut db, scenario_a_samples()).await;

        let response = run_query(&mut db, raw_query(8, vec![1], 42)).await;
        assert_eq!(response.query_id, 8);
        assert!(response.data.is_empty());

        drop(db.query_tx);
        db.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_queries_both_answered() {
        let mut db = start_test_db();
        write_and_drain(&mut db, scenario_a_samples()).await;

        // Submit both before reading either response; they may come back
        // in any order.
        db.query_tx.send(raw_query(100, vec![1], 1)).await.unwrap();
        db.query_tx.send(raw_query(101, vec![1], 1)).await.unwrap();

        let first = db.response_rx.recv().await.unwrap();
        let second = db.response_rx.recv().await.unwrap();

        let mut ids = vec![first.query_id, second.query_id];
        ids.sort();
        assert_eq!(ids, vec![100, 101]);
        assert_eq!(first.data.len(), 1);
        assert_eq!(second.data.len(), 1);

        drop(db.query_tx);
        db.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_channel_close_closes_responses() {
        let mut db = start_test_db();
        drop(db.query_tx);

        assert!(db.response_rx.recv().await.is_none());

        drop(db.data_tx.take());
        db.handle.shutdown().await.unwrap();
    }
}
