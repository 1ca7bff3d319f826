//! Deduplication, scalar aggregation, histograms and gauges

use crate::{Aggregation, DataPoint, Value};
use std::collections::BTreeMap;

/// Filter for corrupt-looking values: floats beyond +/-1e10 read like
/// stray pointers, magnitudes under 1e-300 like denormal noise.
pub fn is_reasonable(value: &Value) -> bool {
    match value {
        Value::Float(v) => v.abs() <= 1e10 && v.abs() >= 1e-300,
        Value::Int(v) => (v.unsigned_abs() as f64) <= 1e10,
        Value::Str(_) => true,
    }
}

/// Collapse duplicate timestamps, preferring the first reasonable value
/// in each group and falling back to 0.0 when none is. The result is
/// sorted ascending by timestamp.
pub fn dedup(mut points: Vec<DataPoint>) -> Vec<DataPoint> {
    if points.is_empty() {
        return points;
    }

    points.sort_by_key(|p| p.timestamp);

    let mut out = Vec::with_capacity(points.len());
    let mut i = 0;
    while i < points.len() {
        let timestamp = points[i].timestamp;
        let mut j = i + 1;
        while j < points.len() && points[j].timestamp == timestamp {
            j += 1;
        }

        if j - i == 1 {
            out.push(points[i].clone());
        } else {
            match points[i..j].iter().find(|p| is_reasonable(&p.value)) {
                Some(best) => out.push(DataPoint {
                    timestamp,
                    value: best.value.clone(),
                }),
                None => out.push(DataPoint {
                    timestamp,
                    value: Value::Float(0.0),
                }),
            }
        }
        i = j;
    }

    out
}

/// Scalar reduction over a point list. Integers are promoted to float
/// and non-numeric values are skipped; when nothing is aggregatable the
/// input is returned unchanged. The output point carries the timestamp
/// of the last input sample.
pub fn aggregate(points: &[DataPoint], aggregation: Option<Aggregation>) -> Vec<DataPoint> {
    let Some(last) = points.last() else {
        return Vec::new();
    };
    let Some(aggregation) = aggregation else {
        return points.to_vec();
    };

    let numeric: Vec<f64> = points.iter().filter_map(|p| p.value.as_f64()).collect();
    if numeric.is_empty() {
        return points.to_vec();
    }

    let value = match aggregation {
        Aggregation::Avg => numeric.iter().sum::<f64>() / numeric.len() as f64,
        Aggregation::Sum => numeric.iter().sum(),
        Aggregation::Min => numeric.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregation::Max => numeric.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Aggregation::Histogram | Aggregation::Gauge => return points.to_vec(),
    };

    vec![DataPoint {
        timestamp: last.timestamp,
        value: Value::Float(value),
    }]
}

/// Count points per fixed-width bucket. One bucket is emitted for every
/// interval from the aligned minimum through the maximum timestamp,
/// zero-count buckets included, ascending.
pub fn histogram(points: &[DataPoint], interval: u32) -> Vec<DataPoint> {
    if interval == 0 {
        return Vec::new();
    }
    let (Some(min_t), Some(max_t)) = (
        points.iter().map(|p| p.timestamp).min(),
        points.iter().map(|p| p.timestamp).max(),
    ) else {
        return Vec::new();
    };

    let mut buckets: BTreeMap<u32, i64> = BTreeMap::new();
    let mut bucket = min_t - min_t % interval;
    while bucket <= max_t {
        buckets.insert(bucket, 0);
        match bucket.checked_add(interval) {
            Some(next) => bucket = next,
            None => break,
        }
    }

    for point in points {
        let bucket = point.timestamp - point.timestamp % interval;
        *buckets.entry(bucket).or_insert(0) += 1;
    }

    buckets
        .into_iter()
        .map(|(timestamp, count)| DataPoint {
            timestamp,
            value: Value::Int(count),
        })
        .collect()
}

/// Latest sample per interval: for every window `[b, b + interval)` that
/// holds at least one point, emit the newest point's value at the window
/// start. Unreasonable values are filtered first.
pub fn gauge(points: &[DataPoint], interval: u32) -> Vec<DataPoint> {
    if interval == 0 {
        return Vec::new();
    }

    let mut latest: BTreeMap<u32, &DataPoint> = BTreeMap::new();
    for point in points.iter().filter(|p| is_reasonable(&p.value)) {
        let bucket = point.timestamp - point.timestamp % interval;
        match latest.get(&bucket) {
            Some(current) if current.timestamp >= point.timestamp => {}
            _ => {
                latest.insert(bucket, point);
            }
        }
    }

    latest
        .into_iter()
        .map(|(bucket, point)| DataPoint {
            timestamp: bucket,
            value: point.value.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_points(points: &[(u32, f64)]) -> Vec<DataPoint> {
        points.iter().map(|&(t, v)| DataPoint::new(t, v)).collect()
    }

    #[test]
    fn test_reasonable_values() {
        assert!(is_reasonable(&Value::Float(12.5)));
        assert!(!is_reasonable(&Value::Float(1e12)));
        assert!(!is_reasonable(&Value::Float(1e-305)));
        assert!(!is_reasonable(&Value::Float(0.0)));
        assert!(is_reasonable(&Value::Int(42)));
        assert!(!is_reasonable(&Value::Int(100_000_000_000)));
        assert!(!is_reasonable(&Value::Int(i64::MIN)));
        assert!(is_reasonable(&Value::from("anything")));
    }

    #[test]
    fn test_dedup_distinct_timestamps() {
        let points = float_points(&[(30, 3.0), (10, 1.0), (20, 2.0)]);
        let out = dedup(points);
        assert_eq!(out, float_points(&[(10, 1.0), (20, 2.0), (30, 3.0)]));
    }

    #[test]
    fn test_dedup_prefers_reasonable() {
        let points = vec![
            DataPoint::new(10, 1e20),
            DataPoint::new(10, 42.0),
            DataPoint::new(10, 43.0),
        ];
        assert_eq!(dedup(points), vec![DataPoint::new(10, 42.0)]);
    }

    #[test]
    fn test_dedup_falls_back_to_zero() {
        let points = vec![DataPoint::new(10, 1e20), DataPoint::new(10, -1e20)];
        assert_eq!(dedup(points), vec![DataPoint::new(10, 0.0)]);
    }

    #[test]
    fn test_dedup_count_property() {
        // N points over K distinct timestamps leaves exactly K points.
        let points = float_points(&[(1, 1.0), (1, 1.0), (2, 2.0), (3, 3.0), (3, 9.0)]);
        let out = dedup(points);
        assert_eq!(out.len(), 3);
        assert!(out.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_avg() {
        let points = float_points(&[(1_700_000_000, 12.5), (1_700_000_005, 13.0), (1_700_000_010, 11.75)]);
        let out = aggregate(&points, Some(Aggregation::Avg));
        assert_eq!(
            out,
            vec![DataPoint::new(1_700_000_010, 37.25 / 3.0)]
        );
    }

    #[test]
    fn test_sum_min_max() {
        let points = float_points(&[(10, 2.0), (20, 8.0), (30, 5.0)]);
        assert_eq!(
            aggregate(&points, Some(Aggregation::Sum)),
            vec![DataPoint::new(30, 15.0)]
        );
        assert_eq!(
            aggregate(&points, Some(Aggregation::Min)),
            vec![DataPoint::new(30, 2.0)]
        );
        assert_eq!(
            aggregate(&points, Some(Aggregation::Max)),
            vec![DataPoint::new(30, 8.0)]
        );
    }

    #[test]
    fn test_aggregate_promotes_ints() {
        let points = vec![DataPoint::new(10, Value::Int(4)), DataPoint::new(20, Value::Int(6))];
        assert_eq!(
            aggregate(&points, Some(Aggregation::Avg)),
            vec![DataPoint::new(20, 5.0)]
        );
    }

    #[test]
    fn test_aggregate_all_non_numeric_returns_input() {
        let points = vec![DataPoint::new(10, Value::from("a")), DataPoint::new(20, Value::from("b"))];
        assert_eq!(aggregate(&points, Some(Aggregation::Avg)), points);
    }

    #[test]
    fn test_aggregate_without_known_function_returns_input() {
        let points = float_points(&[(10, 1.0)]);
        assert_eq!(aggregate(&points, None), points);
    }

    #[test]
    fn test_histogram_counts_and_empty_buckets() {
        let points = float_points(&[(1_700_000_000, 12.5), (1_700_000_005, 13.0), (1_700_000_010, 11.75)]);
        let out = histogram(&points, 10);
        assert_eq!(
            out,
            vec![
                DataPoint::new(1_700_000_000, Value::Int(2)),
                DataPoint::new(1_700_000_010, Value::Int(1)),
            ]
        );

        // A gap in the data still yields its zero buckets.
        let sparse = float_points(&[(100, 1.0), (135, 2.0)]);
        let out = histogram(&sparse, 10);
        assert_eq!(out.len(), 4);
        assert_eq!(out[1], DataPoint::new(110, Value::Int(0)));
        assert_eq!(out[2], DataPoint::new(120, Value::Int(0)));

        let total: i64 = out.iter().filter_map(|p| p.value.as_i64()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_histogram_empty_input() {
        assert!(histogram(&[], 10).is_empty());
        assert!(histogram(&float_points(&[(1, 1.0)]), 0).is_empty());
    }

    #[test]
    fn test_gauge_latest_per_window() {
        let points = float_points(&[(1_700_000_000, 5.0), (1_700_000_045, 7.0)]);
        let out = gauge(&points, 30);
        assert_eq!(
            out,
            vec![
                DataPoint::new(1_699_999_980, 5.0),
                DataPoint::new(1_700_000_040, 7.0),
            ]
        );
    }

    #[test]
    fn test_gauge_keeps_newest_in_window() {
        let points = float_points(&[(100, 1.0), (110, 2.0), (95, 9.0)]);
        let out = gauge(&points, 30);
        assert_eq!(out, vec![DataPoint::new(90, 2.0)]);
    }

    #[test]
    fn test_gauge_filters_unreasonable() {
        let points = float_points(&[(100, 1e20)]);
        assert!(gauge(&points, 30).is_empty());
    }
}
