use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use super::{MqttClientPersistence, PersistenceError};

const EXTENSION: &str = "msg";
const TEMP_EXTENSION: &str = "tmp";

/// One file per key inside a per-client directory under `base_dir`.
/// Writes go to a temporary file that is renamed over the target, so a crash
/// leaves either the old or the new record, never a torn one.
#[derive(Debug)]
pub struct FilePersistence {
    base_dir: PathBuf,
    client_dir: Mutex<Option<PathBuf>>,
}

impl FilePersistence {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FilePersistence {
            base_dir: base_dir.into(),
            client_dir: Mutex::new(None),
        }
    }

    fn dir(&self) -> Result<PathBuf, PersistenceError> {
        self.client_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PersistenceError::NotOpen)
    }

    fn file_for(dir: &Path, key: &str) -> PathBuf {
        dir.join(format!("{}.{}", encode_key(key), EXTENSION))
    }
}

fn is_plain(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

/// Percent-escapes every byte outside `[A-Za-z0-9_-]`, so a key can never
/// name another directory or carry a second extension.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for b in key.bytes() {
        if is_plain(b) {
            encoded.push(char::from(b));
        } else {
            encoded.push_str(&format!("%{:02X}", b));
        }
    }
    encoded
}

/// Reverses [`encode_key`]. `None` for a file name this store did not write.
fn decode_key(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = stem.get(i + 1..i + 3)?;
                decoded.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b if is_plain(b) => {
                decoded.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(decoded).ok()
}

/// Keeps only characters that are safe in a file name on every platform.
fn sanitise(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

impl MqttClientPersistence for FilePersistence {
    fn open(&self, client_id: &str, server_uri: &str) -> Result<(), PersistenceError> {
        let dir = self
            .base_dir
            .join(format!("{}-{}", sanitise(client_id), sanitise(server_uri)));
        fs::create_dir_all(&dir)?;

        // leftovers of writes interrupted before their rename
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TEMP_EXTENSION) {
                warn!(path = %path.display(), "removing incomplete persistence write");
                fs::remove_file(&path)?;
            }
        }

        debug!(dir = %dir.display(), "file persistence opened");
        *self
            .client_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(dir);
        Ok(())
    }

    fn close(&self) -> Result<(), PersistenceError> {
        self.client_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), PersistenceError> {
        let dir = self.dir()?;
        let target = Self::file_for(&dir, key);
        let temp = target.with_extension(TEMP_EXTENSION);
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &target)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let dir = self.dir()?;
        match fs::read(Self::file_for(&dir, key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        let dir = self.dir()?;
        match fs::remove_file(Self::file_for(&dir, key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn contains_key(&self, key: &str) -> Result<bool, PersistenceError> {
        let dir = self.dir()?;
        Ok(Self::file_for(&dir, key).is_file())
    }

    fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        let dir = self.dir()?;
        let mut keys = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).and_then(decode_key) {
                Some(key) => keys.push(key),
                None => debug!(path = %path.display(), "ignoring foreign file"),
            }
        }
        Ok(keys)
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        for key in self.keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }
}
