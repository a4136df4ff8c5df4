//! LMDB-backed store

use super::{ListenerSet, Store, StoreListener, StoreOp, StoreValue, notify_batch};
use crate::config::StoreConfig;
use crate::{Error, Result};
use heed::types::{SerdeBincode, Str};
use heed::{Database, Env, EnvOpenOptions};
use std::path::Path;
use std::sync::Arc;

const DATABASE_NAME: &str = "mesh_objects";

/// Durable store on an LMDB environment
///
/// Every batch is one LMDB write transaction, so a commit either lands
/// completely or not at all.
pub struct LmdbStore {
    env: Arc<Env>,
    values: Database<Str, SerdeBincode<StoreValue>>,
    listeners: ListenerSet,
}

impl LmdbStore {
    /// Open or create a store in `path`
    pub fn open<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.map_size)
                .max_dbs(config.max_dbs)
                .open(path)?
        };
        let env = Arc::new(env);

        let mut wtxn = env.write_txn()?;
        let values = env.create_database(&mut wtxn, Some(DATABASE_NAME))?;
        wtxn.commit()?;

        tracing::info!("Opened LMDB store at {}", path.display());

        Ok(Self {
            env,
            values,
            listeners: ListenerSet::default(),
        })
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let rtxn = self.env.read_txn()?;
        Ok(self.values.get(&rtxn, key)?.is_some())
    }
}

impl Store for LmdbStore {
    fn put(&self, value: StoreValue) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        if self.values.get(&wtxn, &value.key)?.is_some() {
            return Err(Error::StoreKeyExistsAlready(value.key));
        }
        self.values.put(&mut wtxn, &value.key, &value)?;
        wtxn.commit()?;
        self.listeners.each(|l| l.put_performed(&value));
        Ok(())
    }

    fn update(&self, value: StoreValue) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        if self.values.get(&wtxn, &value.key)?.is_none() {
            return Err(Error::StoreKeyDoesNotExist(value.key));
        }
        self.values.put(&mut wtxn, &value.key, &value)?;
        wtxn.commit()?;
        self.listeners.each(|l| l.update_performed(&value));
        Ok(())
    }

    fn put_or_update(&self, value: StoreValue) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let existed = self.values.get(&wtxn, &value.key)?.is_some();
        self.values.put(&mut wtxn, &value.key, &value)?;
        wtxn.commit()?;
        if existed {
            self.listeners.each(|l| l.update_performed(&value));
        } else {
            self.listeners.each(|l| l.put_performed(&value));
        }
        Ok(existed)
    }

    fn get(&self, key: &str) -> Result<StoreValue> {
        let rtxn = self.env.read_txn()?;
        match self.values.get(&rtxn, key)? {
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
        let mut wtxn = self.env.write_txn()?;
        if !self.values.delete(&mut wtxn, key)? {
            return Err(Error::StoreKeyDoesNotExist(key.to_string()));
        }
        wtxn.commit()?;
        self.listeners.each(|l| l.delete_performed(key));
        Ok(())
    }

    fn delete_all(&self, prefix: &str) -> Result<usize> {
        let mut wtxn = self.env.write_txn()?;
        let keys = {
            let mut keys = Vec::new();
            for entry in self.values.prefix_iter(&wtxn, prefix)? {
                let (key, _) = entry?;
                keys.push(key.to_string());
            }
            keys
        };
        for key in &keys {
            self.values.delete(&mut wtxn, key)?;
        }
        wtxn.commit()?;
        self.listeners.each(|l| l.delete_all_performed(prefix));
        Ok(keys.len())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let rtxn = self.env.read_txn()?;
        let mut keys = Vec::new();
        for entry in self.values.iter(&rtxn)? {
            let (key, _) = entry?;
            keys.push(key.to_string());
        }
        Ok(keys)
    }

    fn contains(&self, key: &str) -> Result<bool> {
        self.exists(key)
    }

    fn write_batch(&self, ops: Vec<StoreOp>) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        let mut applied = Vec::with_capacity(ops.len());
        for op in ops {
            let existed = match &op {
                StoreOp::PutOrUpdate(value) => {
                    let existed = self.values.get(&wtxn, &value.key)?.is_some();
                    self.values.put(&mut wtxn, &value.key, value)?;
                    existed
                }
                StoreOp::Delete(key) => {
                    if !self.values.delete(&mut wtxn, key)? {
                        // Dropping the write transaction aborts it
                        return Err(Error::StoreKeyDoesNotExist(key.clone()));
                    }
                    true
                }
            };
            applied.push((op, existed));
        }
        wtxn.commit()?;
        notify_batch(&self.listeners, &applied);
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn StoreListener>) {
        self.listeners.add(listener);
    }
}
