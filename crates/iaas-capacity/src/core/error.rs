//! Error types.
//!
//! Admission rejections are not errors: checks answer with `bool` and allocations with an
//! [`AllocationVerdict`](crate::core::common::AllocationVerdict). Errors are reserved for invalid input, broken
//! configuration and failures of the backing capacity store.

use thiserror::Error;

use crate::core::common::RecordKey;

/// Failure reported by a [`CapacityStore`](crate::core::store::CapacityStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("capacity store is unavailable: {0}")]
    Unavailable(String),
    #[error("record {0} is locked by another writer")]
    Contention(RecordKey),
    #[error("record {0} already exists")]
    AlreadyExists(RecordKey),
}

#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown configuration key: {0}")]
    UnknownConfigKey(String),
    #[error("can't read config file {path}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("can't parse YAML from file {path}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("no capacity record for {0}")]
    MissingRecord(RecordKey),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type CapacityResult<T> = Result<T, CapacityError>;
