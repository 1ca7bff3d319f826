//! Core types for PulseDB

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Seconds since the Unix epoch
pub type Timestamp = u32;

/// The value type declared for a counter.
///
/// Every counter has a fixed type; the type is never stored per sample.
/// On disk it appears once per block as the header's data type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Float,
    #[serde(rename = "string")]
    Str,
}

impl ValueType {
    /// On-disk data type tag (block header byte)
    pub fn tag(self) -> u8 {
        match self {
            ValueType::Int => 1,
            ValueType::Float => 2,
            ValueType::Str => 3,
        }
    }

    /// Decode an on-disk data type tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ValueType::Int),
            2 => Some(ValueType::Float),
            3 => Some(ValueType::Str),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Int => write!(f, "int"),
            ValueType::Float => write!(f, "float"),
            ValueType::Str => write!(f, "string"),
        }
    }
}

/// A sample value: signed integer, IEEE-754 float or UTF-8 string.
///
/// The wire format carries the value as a bare JSON scalar; the variant a
/// counter accepts is decided by the counter registry, not the JSON token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Which variant this value holds
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Str(_) => ValueType::Str,
        }
    }

    /// Get as f64 if numeric (integers promoted)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Str(_) => None,
        }
    }

    /// Get as i64 if numeric (floats truncated)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            Value::Str(_) => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// One observation pushed by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "Object_id")]
    pub object_id: u32,
    pub counter_id: u16,
    pub value: Value,
    pub timestamp: Timestamp,
}

/// A (timestamp, value) pair as returned to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl DataPoint {
    pub fn new(timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}

/// A query over one counter and a closed time range.
///
/// An empty `object_ids` means "all objects with any sample in range for
/// this counter". `interval` and `group_by_objects` default when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub query_id: u64,
    pub from: Timestamp,
    pub to: Timestamp,
    #[serde(rename = "Object_id", default)]
    pub object_ids: Vec<u32>,
    pub counter_id: u16,
    #[serde(default)]
    pub aggregation: String,
    #[serde(default)]
    pub interval: u32,
    #[serde(default)]
    pub group_by_objects: bool,
}

/// Response to a query: the query id echoed plus a mapping from object id
/// to ordered data points. Merged-across-objects results use object id 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query_id: u64,
    pub data: HashMap<u32, Vec<DataPoint>>,
}

impl QueryResponse {
    pub fn empty(query_id: u64) -> Self {
        Self {
            query_id,
            data: HashMap::new(),
        }
    }
}

/// Aggregation requested by a query. Parsing is case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Avg,
    Sum,
    Min,
    Max,
    Histogram,
    Gauge,
}

impl Aggregation {
    /// Parse from the wire string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "avg" => Some(Aggregation::Avg),
            "sum" => Some(Aggregation::Sum),
            "min" => Some(Aggregation::Min),
            "max" => Some(Aggregation::Max),
            "histogram" => Some(Aggregation::Histogram),
            "gauge" => Some(Aggregation::Gauge),
            _ => None,
        }
    }

    /// Whether this is one of the scalar reductions (avg/sum/min/max)
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            Aggregation::Avg | Aggregation::Sum | Aggregation::Min | Aggregation::Max
        )
    }
}
