//! In-memory store

use super::{ListenerSet, Store, StoreListener, StoreOp, StoreValue, notify_batch};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Store backed by an ordered in-memory map
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, StoreValue>>,
    listeners: ListenerSet,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl Store for MemoryStore {
    fn put(&self, value: StoreValue) -> Result<()> {
        {
            let mut values = self.values.write();
            if values.contains_key(&value.key) {
                return Err(Error::StoreKeyExistsAlready(value.key));
            }
            values.insert(value.key.clone(), value.clone());
        }
        self.listeners.each(|l| l.put_performed(&value));
        Ok(())
    }

    fn update(&self, value: StoreValue) -> Result<()> {
        {
            let mut values = self.values.write();
            let Some(slot) = values.get_mut(&value.key) else {
                return Err(Error::StoreKeyDoesNotExist(value.key));
            };
            *slot = value.clone();
        }
        self.listeners.each(|l| l.update_performed(&value));
        Ok(())
    }

    fn put_or_update(&self, value: StoreValue) -> Result<bool> {
        let existed = self
            .values
            .write()
            .insert(value.key.clone(), value.clone())
            .is_some();
        if existed {
            self.listeners.each(|l| l.update_performed(&value));
        } else {
            self.listeners.each(|l| l.put_performed(&value));
        }
        Ok(existed)
    }

    fn get(&self, key: &str) -> Result<StoreValue> {
        let found = self.values.read().get(key).cloned();
        match found {
            Some(value) => {
                self.listeners.each(|l| l.get_performed(&value));
                Ok(value)
            }
            None => {
                self.listeners.each(|l| l.get_failed(key));
                Err(Error::StoreKeyDoesNotExist(key.to_string()))
            }
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        if self.values.write().remove(key).is_none() {
            return Err(Error::StoreKeyDoesNotExist(key.to_string()));
        }
        self.listeners.each(|l| l.delete_performed(key));
        Ok(())
    }

    fn delete_all(&self, prefix: &str) -> Result<usize> {
        let removed = {
            let mut values = self.values.write();
            let before = values.len();
            values.retain(|key, _| !key.starts_with(prefix));
            before - values.len()
        };
        self.listeners.each(|l| l.delete_all_performed(prefix));
        Ok(removed)
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.values.read().keys().cloned().collect())
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.values.read().contains_key(key))
    }

    fn write_batch(&self, ops: Vec<StoreOp>) -> Result<()> {
        let mut applied = Vec::with_capacity(ops.len());
        {
            let mut values = self.values.write();

            // Validate before touching anything
            let mut present: BTreeMap<&str, bool> = BTreeMap::new();
            for op in &ops {
                match op {
                    StoreOp::PutOrUpdate(value) => {
                        present.insert(&value.key, true);
                    }
                    StoreOp::Delete(key) => {
                        let exists = present
                            .get(key.as_str())
                            .copied()
                            .unwrap_or_else(|| values.contains_key(key));
                        if !exists {
                            return Err(Error::StoreKeyDoesNotExist(key.clone()));
                        }
                        present.insert(key, false);
                    }
                }
            }

            for op in ops {
                match &op {
                    StoreOp::PutOrUpdate(value) => {
                        let existed = values.insert(value.key.clone(), value.clone()).is_some();
                        applied.push((op, existed));
                    }
                    StoreOp::Delete(key) => {
                        values.remove(key);
                        applied.push((op, true));
                    }
                }
            }
        }
        notify_batch(&self.listeners, &applied);
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn StoreListener>) {
        self.listeners.add(listener);
    }
}
