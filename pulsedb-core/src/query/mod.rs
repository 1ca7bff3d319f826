//! Query engine
//!
//! A distributor routes each query to a reader shard chosen by
//! `query_id mod readers`; shards pull queries off their own channel and
//! farm them to a worker pool shared across shards (a counting semaphore
//! of five slots per reader). Responses go out on a single channel and
//! may arrive in any order; clients correlate by query id.

pub mod aggregate;
pub mod cache;
pub mod executor;

pub use cache::QueryCache;

use crate::storage::StorageEngine;
use crate::{defaults, CounterRegistry, Query, QueryResponse};
use executor::QueryExecutor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub(crate) async fn run_query_engine(
    storage: StorageEngine,
    registry: Arc<CounterRegistry>,
    root: PathBuf,
    readers: usize,
    chan_size: usize,
    mut query_rx: mpsc::Receiver<Query>,
    response_tx: mpsc::Sender<QueryResponse>,
) {
    let readers = readers.max(1);
    let executor = QueryExecutor::new(storage, registry, root);
    let pool = Arc::new(Semaphore::new(defaults::WORKERS_PER_READER * readers));

    let mut shard_txs = Vec::with_capacity(readers);
    let mut shards = Vec::with_capacity(readers);
    for shard_id in 0..readers {
        let (tx, rx) = mpsc::channel(chan_size.max(1));
        shard_txs.push(tx);
        shards.push(tokio::spawn(run_shard(
            shard_id,
            rx,
            executor.clone(),
            pool.clone(),
            response_tx.clone(),
        )));
    }
    drop(response_tx);

    info!(readers, "query engine started");

    while let Some(query) = query_rx.recv().await {
        let shard = (query.query_id % readers as u64) as usize;
        debug!(query_id = query.query_id, shard, "dispatching query");
        if shard_txs[shard].send(query).await.is_err() {
            warn!(shard, "reader shard gone, dropping query");
        }
    }

    // Ingress closed: close the shard channels and wait for in-flight
    // queries to finish. Dropping the last response sender closes the
    // response channel.
    drop(shard_txs);
    for shard in shards {
        let _ = shard.await;
    }

    info!("query engine stopped");
}

async fn run_shard(
    shard_id: usize,
    mut queries: mpsc::Receiver<Query>,
    executor: QueryExecutor,
    pool: Arc<Semaphore>,
    response_tx: mpsc::Sender<QueryResponse>,
) {
    let mut inflight = JoinSet::new();

    while let Some(query) = queries.recv().await {
        let Ok(permit) = pool.clone().acquire_owned().await else {
            break;
        };
        let executor = executor.clone();
        let response_tx = response_tx.clone();

        inflight.spawn(async move {
            let query_id = query.query_id;
            let response = executor.process(query).await;
            if response_tx.send(response).await.is_err() {
                warn!(query_id, "response channel closed, dropping response");
            }
            drop(permit);
        });
    }

    // Drain queries still executing on this shard.
    while inflight.join_next().await.is_some() {}

    debug!(shard = shard_id, "reader stopped");
}
