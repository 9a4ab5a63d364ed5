//! Persistent storage: the ordered index, the journaled key/value store and
//! the chain-specific layer on top of it.

pub mod btree;
pub mod chain_store;
pub mod database;
pub mod journal;

pub use chain_store::{BlockLocation, ChainStore, TxRef, UtxoEntry, ValidatorInfo};
pub use database::{Database, DatabaseConfig, IndexDef};

#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    /// Data on disk does not decode or violates the layout
    Corrupt(String),
    /// An earlier commit failed; the handle must be reopened
    Poisoned,
    NotFound(String),
    InvalidKey { index: u8, expected: usize, actual: usize },
    UnknownIndex(u8),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "io error: {}", e),
            StorageError::Corrupt(e) => write!(f, "corrupt data: {}", e),
            StorageError::Poisoned => write!(f, "store poisoned by a failed commit"),
            StorageError::NotFound(e) => write!(f, "not found: {}", e),
            StorageError::InvalidKey { index, expected, actual } => {
                write!(f, "index {} expects {}-byte keys, got {}", index, expected, actual)
            }
            StorageError::UnknownIndex(id) => write!(f, "unknown index {}", id),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Corrupt(e.to_string())
    }
}

impl From<crate::core::codec::DecodeError> for StorageError {
    fn from(e: crate::core::codec::DecodeError) -> Self {
        StorageError::Corrupt(e.to_string())
    }
}
