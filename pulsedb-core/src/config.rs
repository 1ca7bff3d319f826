//! Configuration documents and the counter registry

use crate::{Error, Result, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Engine configuration, loaded from a JSON document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub writers: usize,
    pub readers: usize,
    pub num_of_partitions: usize,
    pub block_size: usize,
    pub buffred_chan_size: usize,
    pub storage_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            writers: 4,
            readers: 4,
            num_of_partitions: crate::defaults::NUM_PARTITIONS,
            block_size: crate::defaults::BLOCK_SIZE,
            buffred_chan_size: 1024,
            storage_path: PathBuf::from("data"),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data)?;
        if config.block_size == 0 {
            return Err(Error::Config("block_size must be non-zero".to_string()));
        }
        if config.num_of_partitions == 0 {
            return Err(Error::Config(
                "num_of_partitions must be non-zero".to_string(),
            ));
        }
        Ok(config)
    }
}

/// A counter definition: a display name and a declared value type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
}

/// Process-wide mapping from counter id to its declared value type.
///
/// Constructed at start-up and passed by reference through the pipelines;
/// there is no hidden global. Serialization and deserialization of sample
/// values consult this registry, never the JSON token type.
#[derive(Debug, Clone)]
pub struct CounterRegistry {
    counters: HashMap<u16, CounterConfig>,
}

impl CounterRegistry {
    /// Build a registry from an explicit mapping
    pub fn new(counters: HashMap<u16, CounterConfig>) -> Self {
        Self { counters }
    }

    /// Load the counters document: a JSON object keyed by decimal counter id
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let raw: HashMap<String, CounterConfig> = serde_json::from_str(&data)?;

        let mut counters = HashMap::with_capacity(raw.len());
        for (key, counter) in raw {
            let id: u16 = key
                .parse()
                .map_err(|_| Error::Config(format!("invalid counter id key: {key}")))?;
            counters.insert(id, counter);
        }

        Ok(Self { counters })
    }

    /// The declared value type for a counter
    pub fn value_type(&self, counter_id: u16) -> Result<ValueType> {
        self.counters
            .get(&counter_id)
            .map(|c| c.value_type)
            .ok_or(Error::UnknownCounter(counter_id))
    }

    /// The display name for a counter, if known
    pub fn name(&self, counter_id: u16) -> Option<&str> {
        self.counters.get(&counter_id).map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl Default for CounterRegistry {
    /// Fallback mapping used when no counters document is present:
    /// counter 1 = float, 2 = int, 3 = string.
    fn default() -> Self {
        let mut counters = HashMap::new();
        counters.insert(
            1,
            CounterConfig {
                name: "counter_1".to_string(),
                value_type: ValueType::Float,
            },
        );
        counters.insert(
            2,
            CounterConfig {
                name: "counter_2".to_string(),
                value_type: ValueType::Int,
            },
        );
        counters.insert(
            3,
            CounterConfig {
                name: "counter_3".to_string(),
                value_type: ValueType::Str,
            },
        );
        Self { counters }
    }
}
