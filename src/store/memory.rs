//! In-memory repository.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{validate_key, Entity, Repository, StoreError, StoreResult};

/// Repository held entirely in memory. Used by tests and dry runs.
pub struct MemoryRepository<T> {
    records: Mutex<BTreeMap<String, T>>,
}

impl<T> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T> MemoryRepository<T> {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T: Entity> Repository<T> for MemoryRepository<T> {
    fn get(&self, key: &str) -> StoreResult<Option<T>> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(key).cloned())
    }

    fn put(&self, value: &T) -> StoreResult<()> {
        let key = value.key();
        validate_key(&key)?;
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        records.insert(key, value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records.remove(key).is_some())
    }

    fn list(&self) -> StoreResult<Vec<T>> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: String,
        value: u32,
    }

    impl Entity for Sample {
        const KIND: &'static str = "samples";
        fn key(&self) -> String {
            self.id.clone()
        }
    }

    #[test]
    fn test_put_get_delete() {
        let repo = MemoryRepository::new();
        let sample = Sample { id: "a".into(), value: 1 };
        repo.put(&sample).unwrap();
        assert_eq!(repo.get("a").unwrap(), Some(sample));
        assert!(repo.delete("a").unwrap());
        assert!(!repo.delete("a").unwrap());
        assert_eq!(repo.get("a").unwrap(), None);
    }

    #[test]
    fn test_list_is_key_ordered() {
        let repo = MemoryRepository::new();
        for id in ["c", "a", "b"] {
            repo.put(&Sample { id: id.into(), value: 0 }).unwrap();
        }
        let keys: Vec<_> = repo.list().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_find_filters() {
        let repo = MemoryRepository::new();
        repo.put(&Sample { id: "a".into(), value: 1 }).unwrap();
        repo.put(&Sample { id: "b".into(), value: 2 }).unwrap();
        let found = repo.find(&|p: &Sample| p.value > 1).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "b");
    }
}
