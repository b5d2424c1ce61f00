//! Document Store
//!
//! Every control-plane entity is a serde document addressed by a string key.
//! Services depend on the [`Repository`] trait; the binary wires
//! [`FileRepository`] under the data directory and tests use
//! [`MemoryRepository`].

mod checksum;
mod errors;
mod file;
mod memory;

pub use checksum::{seal, unseal};
pub use errors::{StoreError, StoreResult};
pub use file::FileRepository;
pub use memory::MemoryRepository;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A persisted control-plane record.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection name; also the directory name for file-backed stores.
    const KIND: &'static str;

    /// Stable key of this record within its collection.
    fn key(&self) -> String;
}

/// Keyed storage for one entity collection.
///
/// Implementations must make `put` visible to subsequent `get`/`list` calls
/// once it returns, and must return `list` results ordered by key.
pub trait Repository<T: Entity>: Send + Sync {
    /// Fetch a record by key.
    fn get(&self, key: &str) -> StoreResult<Option<T>>;

    /// Insert or replace a record.
    fn put(&self, value: &T) -> StoreResult<()>;

    /// Remove a record. Returns whether it existed.
    fn delete(&self, key: &str) -> StoreResult<bool>;

    /// All records, ordered by key.
    fn list(&self) -> StoreResult<Vec<T>>;

    /// All records matching a predicate, ordered by key.
    fn find(&self, predicate: &dyn Fn(&T) -> bool) -> StoreResult<Vec<T>> {
        Ok(self.list()?.into_iter().filter(|v| predicate(v)).collect())
    }
}

/// Validate that a key can be used as a file name.
pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("2f1c9d2e-0c1a-4c52-9a57-1c1b7d1c0e11").is_ok());
        assert!(validate_key("cred_node").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a b").is_err());
    }
}
