//! Channel-level query client
//!
//! Sends queries into the engine and waits for the matching response.
//! Responses are not ordered, so anything received that belongs to a
//! different query is stashed and handed to the `send_query` call that
//! asked for it.

use crate::{defaults, Error, Query, QueryResponse, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

pub struct QueryClient {
    query_tx: mpsc::Sender<Query>,
    response_rx: Mutex<mpsc::Receiver<QueryResponse>>,
    pending: Mutex<HashMap<u64, QueryResponse>>,
    timeout: Duration,
}

impl QueryClient {
    pub fn new(
        query_tx: mpsc::Sender<Query>,
        response_rx: mpsc::Receiver<QueryResponse>,
    ) -> Self {
        Self::with_timeout(query_tx, response_rx, defaults::QUERY_TIMEOUT)
    }

    pub fn with_timeout(
        query_tx: mpsc::Sender<Query>,
        response_rx: mpsc::Receiver<QueryResponse>,
        timeout: Duration,
    ) -> Self {
        Self {
            query_tx,
            response_rx: Mutex::new(response_rx),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Send a query and wait for its response, stashing out-of-order
    /// responses for later calls. Fails with `Timeout` when the engine
    /// does not answer in time.
    pub async fn send_query(&self, query: Query) -> Result<QueryResponse> {
        let query_id = query.query_id;

        self.query_tx
            .send(query)
            .await
            .map_err(|_| Error::ChannelClosed)?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        let poll = Duration::from_millis(100);

        loop {
            if let Some(response) = self.pending.lock().await.remove(&query_id) {
                debug!(query_id, "matched stashed response");
                return Ok(response);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(Error::Timeout { query_id });
            }
            let wait = poll.min(deadline - now);

            let received = {
                let mut rx = self.response_rx.lock().await;
                match tokio::time::timeout(wait, rx.recv()).await {
                    Ok(Some(response)) => Some(response),
                    Ok(None) => return Err(Error::ChannelClosed),
                    // Poll tick: re-check the stash and the deadline.
                    Err(_) => None,
                }
            };

            if let Some(response) = received {
                if response.query_id == query_id {
                    return Ok(response);
                }
                debug!(
                    got = response.query_id,
                    want = query_id,
                    "stashing out-of-order response"
                );
                self.pending.lock().await.insert(response.query_id, response);
            }
        }
    }
}
