//! Table-scoped key/value persistence used for the registration record and the certified keys.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

/// Names a table in a [Storage] backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageTableSpec {
    pub name: &'static str,
}

impl StorageTableSpec {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("no row '{key}' in table '{table}'")]
    NotFound { table: &'static str, key: String },
    #[error("row '{key}' already exists in table '{table}'")]
    KeyAlreadyExists { table: &'static str, key: String },
    #[error("storage lock poisoned")]
    Poisoned,
    #[error("storage backend failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Persistent table storage.
///
/// Rows are opaque bytes keyed by a string. When `insert` is not given a key, the backend
/// generates one and returns it.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, table: &StorageTableSpec, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn insert(
        &self,
        table: &StorageTableSpec,
        key: Option<&str>,
        data: Vec<u8>,
    ) -> Result<String, StorageError>;

    async fn update(&self, table: &StorageTableSpec, key: &str, data: Vec<u8>) -> Result<(), StorageError>;

    /// Returns whether a row was removed.
    async fn delete(&self, table: &StorageTableSpec, key: &str) -> Result<bool, StorageError>;

    async fn enumerate_with_data(
        &self,
        table: &StorageTableSpec,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

/// In-memory [Storage]. Clones share the same tables, which lets a test drop a client and build
/// a new one over the same data.
#[derive(Debug, Clone, Default)]
pub struct EphemeralStorage {
    tables: Arc<Mutex<HashMap<&'static str, BTreeMap<String, Vec<u8>>>>>,
}

impl EphemeralStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<T>(
        &self,
        table: &StorageTableSpec,
        f: impl FnOnce(&mut BTreeMap<String, Vec<u8>>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut tables = self.tables.lock().map_err(|_| StorageError::Poisoned)?;
        f(tables.entry(table.name).or_default())
    }
}

#[async_trait]
impl Storage for EphemeralStorage {
    async fn get(&self, table: &StorageTableSpec, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.with_table(table, |rows| Ok(rows.get(key).cloned()))
    }

    async fn insert(
        &self,
        table: &StorageTableSpec,
        key: Option<&str>,
        data: Vec<u8>,
    ) -> Result<String, StorageError> {
        let key = key
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.with_table(table, |rows| {
            if rows.contains_key(&key) {
                return Err(StorageError::KeyAlreadyExists {
                    table: table.name,
                    key,
                });
            }
            rows.insert(key.clone(), data);
            Ok(key)
        })
    }

    async fn update(&self, table: &StorageTableSpec, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.with_table(table, |rows| match rows.get_mut(key) {
            Some(row) => {
                *row = data;
                Ok(())
            }
            None => Err(StorageError::NotFound {
                table: table.name,
                key: key.to_owned(),
            }),
        })
    }

    async fn delete(&self, table: &StorageTableSpec, key: &str) -> Result<bool, StorageError> {
        self.with_table(table, |rows| Ok(rows.remove(key).is_some()))
    }

    async fn enumerate_with_data(
        &self,
        table: &StorageTableSpec,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.with_table(table, |rows| {
            Ok(rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        })
    }
}
