use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

use super::{MqttClientPersistence, PersistenceError};

/// In-process store. Data survives `close`/`open` cycles of the same
/// instance, so sharing one `Arc<MemoryPersistence>` between two client
/// instances simulates a restart.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    data: DashMap<String, Vec<u8>>,
    open: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), PersistenceError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(PersistenceError::NotOpen)
        }
    }
}

impl MqttClientPersistence for MemoryPersistence {
    fn open(&self, _client_id: &str, _server_uri: &str) -> Result<(), PersistenceError> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<(), PersistenceError> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        self.data.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.ensure_open()?;
        Ok(self.data.get(key).map(|v| v.value().clone()))
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        self.data.remove(key);
        Ok(())
    }

    fn contains_key(&self, key: &str) -> Result<bool, PersistenceError> {
        self.ensure_open()?;
        Ok(self.data.contains_key(key))
    }

    fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        self.ensure_open()?;
        Ok(self.data.iter().map(|e| e.key().clone()).collect())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        self.data.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_basic() {
        let store = MemoryPersistence::new();
        assert!(matches!(store.put("s-1", b"x"), Err(PersistenceError::NotOpen)));

        store.open("c", "tcp://localhost:1883").unwrap();
        store.put("s-1", b"abc").unwrap();
        store.put("r-2", b"def").unwrap();
        assert!(store.contains_key("s-1").unwrap());
        assert_eq!(store.get("s-1").unwrap(), Some(b"abc".to_vec()));
        assert_eq!(store.get("s-9").unwrap(), None);

        let mut keys = store.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["r-2".to_string(), "s-1".to_string()]);

        store.remove("s-1").unwrap();
        store.remove("s-1").unwrap();
        assert!(!store.contains_key("s-1").unwrap());
    }

    #[test]
    fn test_memory_store_survives_reopen() {
        let store = MemoryPersistence::new();
        store.open("c", "tcp://h:1").unwrap();
        store.put("s-5", b"p").unwrap();
        store.close().unwrap();
        assert!(store.get("s-5").is_err());
        store.open("c", "tcp://h:1").unwrap();
        assert_eq!(store.get("s-5").unwrap(), Some(b"p".to_vec()));
        store.clear().unwrap();
        assert!(store.keys().unwrap().is_empty());
    }
}
