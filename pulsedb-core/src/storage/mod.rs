//! On-disk storage: mapped files, blocks and the partitioned engine

pub mod block;
pub mod engine;
pub mod index;
pub mod mmap;

pub use block::{decode_records, encode_record, BlockHeader};
pub use engine::{StorageEngine, StorageOptions, StorageStats};
pub use index::IndexEntry;
pub use mmap::MappedFile;
