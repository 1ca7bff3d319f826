//! Read-through query cache
//!
//! Caches the decoded data points of one (object, counter, from, to)
//! read. Admission and eviction are cost-based with cost = number of
//! data points and a total budget of 1 GiB worth of points; entries
//! expire after 1000 minutes.

use crate::{defaults, DataPoint};
use moka::future::Cache;
use std::sync::Arc;

type CacheKey = (u32, u16, u32, u32);

pub struct QueryCache {
    inner: Cache<CacheKey, Arc<Vec<DataPoint>>>,
}

impl QueryCache {
    pub fn new() -> Self {
        let inner = Cache::builder()
            .max_capacity(defaults::CACHE_MAX_COST)
            .weigher(|_key, points: &Arc<Vec<DataPoint>>| {
                points.len().try_into().unwrap_or(u32::MAX)
            })
            .time_to_live(defaults::CACHE_TTL)
            .build();
        Self { inner }
    }

    pub async fn get(
        &self,
        object_id: u32,
        counter_id: u16,
        from: u32,
        to: u32,
    ) -> Option<Arc<Vec<DataPoint>>> {
        self.inner.get(&(object_id, counter_id, from, to)).await
    }

    pub async fn insert(
        &self,
        object_id: u32,
        counter_id: u16,
        from: u32,
        to: u32,
        points: Arc<Vec<DataPoint>>,
    ) {
        self.inner
            .insert((object_id, counter_id, from, to), points)
            .await;
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}
