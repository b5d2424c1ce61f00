//! File-backed repository.
//!
//! One document per record at `<root>/<kind>/<key>.json`. The first line of a
//! document holds the CRC32 of the JSON body that follows it.
//!
//! Writes are atomic:
//! 1. Write to temp file
//! 2. fsync temp file
//! 3. Rename temp to final (atomic on POSIX)
//! 4. fsync the directory

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::checksum::{seal, unseal};
use super::{validate_key, Entity, Repository, StoreError, StoreResult};

const DOCUMENT_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "json.tmp";

/// Repository persisting each record as a checksummed JSON document.
pub struct FileRepository<T> {
    dir: PathBuf,
    /// Serializes writers so a temp file is never shared.
    write_lock: Mutex<()>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> FileRepository<T> {
    /// Open (creating if needed) the collection directory under `root`.
    pub fn open(root: &Path) -> StoreResult<Self> {
        let dir = root.join(T::KIND);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
            _entity: PhantomData,
        })
    }

    /// Collection directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn document_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, DOCUMENT_EXTENSION))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, TEMP_EXTENSION))
    }

    fn encode(value: &T) -> StoreResult<Vec<u8>> {
        Ok(seal(&serde_json::to_vec_pretty(value)?))
    }

    fn decode(key: &str, bytes: &[u8]) -> StoreResult<T> {
        let body = unseal(bytes).ok_or_else(|| StoreError::Corrupted {
            kind: T::KIND,
            key: key.to_string(),
        })?;
        Ok(serde_json::from_slice(body)?)
    }

    fn read_document(&self, key: &str, path: &Path) -> StoreResult<Option<T>> {
        match fs::read(path) {
            Ok(bytes) => Self::decode(key, &bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn sync_dir(&self) {
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
    }
}

impl<T: Entity> Repository<T> for FileRepository<T> {
    fn get(&self, key: &str) -> StoreResult<Option<T>> {
        validate_key(key)?;
        self.read_document(key, &self.document_path(key))
    }

    fn put(&self, value: &T) -> StoreResult<()> {
        let key = value.key();
        validate_key(&key)?;
        let content = Self::encode(value)?;

        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let temp = self.temp_path(&key);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)?;
        file.write_all(&content)?;
        file.sync_all()?;
        fs::rename(&temp, self.document_path(&key))?;
        self.sync_dir();
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        validate_key(key)?;
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        match fs::remove_file(self.document_path(key)) {
            Ok(()) => {
                self.sync_dir();
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self) -> StoreResult<Vec<T>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            // Leftover temp files from an interrupted write are ignored.
            if path.extension().and_then(|e| e.to_str()) != Some(DOCUMENT_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.contains('.') {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.read_document(&key, &self.document_path(&key))? {
                records.push(record);
            }
        }
        Ok(records)
    }
}
