//! In-process store, used when no database is configured

use super::KeyValueStore;
use crate::error::RelayerResult;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_by_key(&self, key: &str) -> RelayerResult<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set_by_key(&self, key: &str, value: &[u8]) -> RelayerResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
