use std::collections::HashMap;

use parking_lot::Mutex;

use super::{Persist, PersistKey};

/// Process-local storage. Everything is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryPersist {
    values: Mutex<HashMap<PersistKey, Vec<u8>>>,
}

impl MemoryPersist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values across all namespaces.
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl Persist for MemoryPersist {
    async fn put(&self, key: &PersistKey, value: &[u8]) -> eyre::Result<()> {
        self.values.lock().insert(key.clone(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &PersistKey) -> eyre::Result<Option<Vec<u8>>> {
        Ok(self.values.lock().get(key).cloned())
    }
}
