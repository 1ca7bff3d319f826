//! Per-query execution
//!
//! A query fans out per object, per UTC calendar day and per block:
//! object reads run under a per-query semaphore, each object reads its
//! days in parallel, and each non-empty block payload is decoded in its
//! own task. Day results are served from the read cache when possible.
//! The merged points are deduplicated and then shaped according to the
//! query: raw, scalar aggregation, histogram, gauge or per-object grid.

use crate::query::aggregate::{aggregate, dedup, gauge, histogram};
use crate::query::cache::QueryCache;
use crate::storage::{decode_records, StorageEngine};
use crate::{
    defaults, Aggregation, CounterRegistry, DataPoint, Query, QueryResponse, Timestamp, ValueType,
};
use chrono::{DateTime, Datelike, NaiveDate};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// How a query's results are shaped after the raw read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Raw,
    Scalar(Aggregation),
    Histogram { interval: u32, grouped: bool },
    Gauge { interval: u32 },
    Grid,
}

fn shape_of(query: &Query) -> Shape {
    let aggregation = Aggregation::parse(&query.aggregation);

    if query.aggregation.is_empty() && query.interval == 0 {
        return Shape::Raw;
    }
    if let Some(agg) = aggregation {
        if agg.is_scalar() {
            return Shape::Scalar(agg);
        }
    }
    if aggregation == Some(Aggregation::Histogram) || query.interval > 0 {
        let interval = if query.interval == 0 {
            defaults::HISTOGRAM_INTERVAL_SECS
        } else {
            query.interval
        };
        return Shape::Histogram {
            interval,
            grouped: query.group_by_objects,
        };
    }
    if aggregation == Some(Aggregation::Gauge) || !query.group_by_objects {
        let interval = if query.interval == 0 {
            defaults::GAUGE_INTERVAL_SECS
        } else {
            query.interval
        };
        return Shape::Gauge { interval };
    }
    Shape::Grid
}

#[derive(Clone)]
pub(crate) struct QueryExecutor {
    storage: StorageEngine,
    registry: Arc<CounterRegistry>,
    cache: Arc<QueryCache>,
    root: PathBuf,
}

impl QueryExecutor {
    pub fn new(storage: StorageEngine, registry: Arc<CounterRegistry>, root: PathBuf) -> Self {
        Self {
            storage,
            registry,
            cache: Arc::new(QueryCache::new()),
            root,
        }
    }

    /// Execute one query to completion and build its response
    pub async fn process(&self, query: Query) -> QueryResponse {
        let mut response = QueryResponse::empty(query.query_id);

        let value_type = match self.registry.value_type(query.counter_id) {
            Ok(value_type) => value_type,
            Err(e) => {
                warn!(query_id = query.query_id, error = %e, "query rejected");
                return response;
            }
        };

        let object_ids = self.resolve_objects(&query);
        if object_ids.is_empty() {
            return response;
        }

        let shape = shape_of(&query);
        debug!(
            query_id = query.query_id,
            objects = object_ids.len(),
            ?shape,
            "executing query"
        );

        let per_object = self.collect_per_object(&query, object_ids, value_type).await;

        match shape {
            Shape::Raw => {
                for (object_id, points) in per_object {
                    if !points.is_empty() {
                        response.data.insert(object_id, dedup(points));
                    }
                }
            }
            Shape::Scalar(agg) => {
                for (object_id, points) in per_object {
                    if points.is_empty() {
                        continue;
                    }
                    let shaped = aggregate(&dedup(points), Some(agg));
                    if !shaped.is_empty() {
                        response.data.insert(object_id, shaped);
                    }
                }
            }
            Shape::Histogram {
                interval,
                grouped: true,
            } => {
                for (object_id, points) in per_object {
                    if points.is_empty() {
                        continue;
                    }
                    let shaped = histogram(&dedup(points), interval);
                    if !shaped.is_empty() {
                        response.data.insert(object_id, shaped);
                    }
                }
            }
            Shape::Histogram {
                interval,
                grouped: false,
            } => {
                // Merge every object's samples and emit one histogram
                // under the synthetic object id 0.
                let merged: Vec<DataPoint> = per_object
                    .into_iter()
                    .flat_map(|(_, points)| points)
                    .collect();
                response.data.insert(0, histogram(&dedup(merged), interval));
            }
            Shape::Gauge { interval } => {
                for (object_id, points) in per_object {
                    if points.is_empty() {
                        continue;
                    }
                    let shaped = gauge(&dedup(points), interval);
                    if !shaped.is_empty() {
                        response.data.insert(object_id, shaped);
                    }
                }
            }
            Shape::Grid => {
                let aggregation = Aggregation::parse(&query.aggregation);
                for (object_id, points) in per_object {
                    if points.is_empty() {
                        continue;
                    }
                    let shaped = aggregate(&dedup(points), aggregation);
                    if !shaped.is_empty() {
                        response.data.insert(object_id, shaped);
                    }
                }
            }
        }

        response
    }

    /// The explicit object set, or every object with data for this
    /// counter on any day in range
    fn resolve_objects(&self, query: &Query) -> Vec<u32> {
        if !query.object_ids.is_empty() {
            return query.object_ids.clone();
        }

        let mut ids = BTreeSet::new();
        for date in day_range(query.from, query.to) {
            let dir = self.day_dir(query.counter_id, date);
            if !dir.exists() {
                continue;
            }

            let storage = self.storage.clone();
            if let Err(e) = storage.set_storage_path(&dir) {
                warn!(dir = %dir.display(), error = %e, "cannot scope storage to day");
                continue;
            }
            match storage.all_object_ids() {
                Ok(day_ids) => ids.extend(day_ids),
                Err(e) => warn!(dir = %dir.display(), error = %e, "cannot list objects"),
            }
        }

        ids.into_iter().collect()
    }

    /// Read every object's points in range, bounded by a per-query
    /// semaphore
    async fn collect_per_object(
        &self,
        query: &Query,
        object_ids: Vec<u32>,
        value_type: ValueType,
    ) -> Vec<(u32, Vec<DataPoint>)> {
        let semaphore = Arc::new(Semaphore::new(max_concurrent(object_ids.len())));
        let mut tasks = JoinSet::new();

        for object_id in object_ids {
            let executor = self.clone();
            let semaphore = semaphore.clone();
            let counter_id = query.counter_id;
            let (from, to) = (query.from, query.to);

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (object_id, Vec::new());
                };
                let points = executor
                    .read_object(object_id, counter_id, from, to, value_type)
                    .await;
                (object_id, points)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "object read task failed"),
            }
        }
        results
    }

    /// Union of one object's points over every day in the query range
    async fn read_object(
        &self,
        object_id: u32,
        counter_id: u16,
        from: Timestamp,
        to: Timestamp,
        value_type: ValueType,
    ) -> Vec<DataPoint> {
        let mut tasks = JoinSet::new();
        for date in day_range(from, to) {
            let executor = self.clone();
            tasks.spawn(async move {
                executor
                    .read_object_day(object_id, counter_id, date, from, to, value_type)
                    .await
            });
        }

        let mut points = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(day_points) => points.extend(day_points),
                Err(e) => warn!(object_id, error = %e, "day read task failed"),
            }
        }
        points
    }

    async fn read_object_day(
        &self,
        object_id: u32,
        counter_id: u16,
        date: NaiveDate,
        from: Timestamp,
        to: Timestamp,
        value_type: ValueType,
    ) -> Vec<DataPoint> {
        let dir = self.day_dir(counter_id, date);
        if !dir.exists() {
            return Vec::new();
        }

        // Clamp the query range to this day so the cache key identifies
        // exactly the slice this read produces.
        let (day_from, day_to) = clamp_to_day(date, from, to);

        if let Some(cached) = self.cache.get(object_id, counter_id, day_from, day_to).await {
            return cached.as_ref().clone();
        }

        let blocks = match self.storage.clone().get_by_path(object_id, &dir) {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!(object_id, dir = %dir.display(), error = %e, "block read failed");
                return Vec::new();
            }
        };

        let mut tasks = JoinSet::new();
        for block in blocks {
            if block.is_empty() {
                continue;
            }
            tasks.spawn(async move { decode_records(&block, day_from, day_to, value_type) });
        }

        let mut points = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(block_points) => points.extend(block_points),
                Err(e) => warn!(object_id, error = %e, "block decode task failed"),
            }
        }

        if !points.is_empty() {
            self.cache
                .insert(object_id, counter_id, day_from, day_to, Arc::new(points.clone()))
                .await;
        }

        points
    }

    fn day_dir(&self, counter_id: u16, date: NaiveDate) -> PathBuf {
        self.root
            .join(format!(
                "{:04}/{:02}/{:02}",
                date.year(),
                date.month(),
                date.day()
            ))
            .join(format!("counter_{counter_id}"))
    }
}

/// Every UTC calendar day touched by `[from, to]`, in order
fn day_range(from: Timestamp, to: Timestamp) -> Vec<NaiveDate> {
    if from > to {
        return Vec::new();
    }

    let (Some(start), Some(end)) = (
        DateTime::from_timestamp(from as i64, 0).map(|dt| dt.date_naive()),
        DateTime::from_timestamp(to as i64, 0).map(|dt| dt.date_naive()),
    ) else {
        return Vec::new();
    };

    let mut days = Vec::new();
    let mut day = start;
    while day <= end {
        days.push(day);
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    days
}

/// Intersect a query range with one day's second range
fn clamp_to_day(date: NaiveDate, from: Timestamp, to: Timestamp) -> (Timestamp, Timestamp) {
    let start = date
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc().timestamp())
        .unwrap_or(0);
    let day_from = start.clamp(0, u32::MAX as i64) as u32;
    let day_to = (start + 86_399).clamp(0, u32::MAX as i64) as u32;

    (from.max(day_from), to.min(day_to))
}

/// Object-level fan-out bound for one query
fn max_concurrent(num_objects: usize) -> usize {
    if num_objects > 100 {
        100
    } else {
        200
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(aggregation: &str, interval: u32, grouped: bool) -> Query {
        Query {
            query_id: 1,
            from: 0,
            to: 100,
            object_ids: vec![1],
            counter_id: 1,
            aggregation: aggregation.to_string(),
            interval,
            group_by_objects: grouped,
        }
    }

    #[test]
    fn test_shape_dispatch() {
        assert_eq!(shape_of(&query("", 0, false)), Shape::Raw);
        assert_eq!(shape_of(&query("", 0, true)), Shape::Raw);
        assert_eq!(
            shape_of(&query("avg", 0, false)),
            Shape::Scalar(Aggregation::Avg)
        );
        assert_eq!(
            shape_of(&query("max", 0, true)),
            Shape::Scalar(Aggregation::Max)
        );
        assert_eq!(
            shape_of(&query("histogram", 0, false)),
            Shape::Histogram {
                interval: 10,
                grouped: false
            }
        );
        assert_eq!(
            shape_of(&query("", 15, true)),
            Shape::Histogram {
                interval: 15,
                grouped: true
            }
        );
        assert_eq!(
            shape_of(&query("gauge", 0, false)),
            Shape::Gauge { interval: 30 }
        );
        assert_eq!(
            shape_of(&query("gauge", 0, true)),
            Shape::Gauge { interval: 30 }
        );
        // Unrecognized aggregations fall back to gauge, or to the grid
        // when grouped.
        assert_eq!(
            shape_of(&query("median", 0, false)),
            Shape::Gauge { interval: 30 }
        );
        assert_eq!(shape_of(&query("median", 0, true)), Shape::Grid);
    }

    #[test]
    fn test_day_range() {
        // 1700000000 = 2023-11-14T22:13:20Z; +8000s crosses midnight.
        let days = day_range(1_700_000_000, 1_700_008_000);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0], NaiveDate::from_ymd_opt(2023, 11, 14).unwrap());
        assert_eq!(days[1], NaiveDate::from_ymd_opt(2023, 11, 15).unwrap());

        assert_eq!(day_range(1_700_000_000, 1_700_000_010).len(), 1);
        assert!(day_range(100, 50).is_empty());
    }

    #[test]
    fn test_clamp_to_day() {
        let day = NaiveDate::from_ymd_opt(2023, 11, 14).unwrap();
        // Day spans [1699920000, 1700006399].
        let (from, to) = clamp_to_day(day, 1_699_000_000, 1_701_000_000);
        assert_eq!(from, 1_699_920_000);
        assert_eq!(to, 1_700_006_399);

        let (from, to) = clamp_to_day(day, 1_700_000_000, 1_700_000_020);
        assert_eq!(from, 1_700_000_000);
        assert_eq!(to, 1_700_000_020);
    }

    #[test]
    fn test_max_concurrent() {
        assert_eq!(max_concurrent(5), 200);
        assert_eq!(max_concurrent(100), 200);
        assert_eq!(max_concurrent(101), 100);
    }
}
