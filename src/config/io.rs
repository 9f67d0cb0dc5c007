use std::collections::HashMap;
use std::env::{current_exe};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::str;
use std::sync::{Arc, Mutex};
use directories_next::{ProjectDirs};
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{debug, info};
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// String-keyed persisted settings.
///
/// Every write is durable before the call returns, there is no batching.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set_all(&self, entries: Vec<(&str, Value)>) -> Result<(), ConfigError>;

    fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        self.set_all(vec![(key, value)])
    }

    fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(Value::String(value)) => Some(value),
            _ => None,
        }
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.set(key, Value::String(value.to_string()))
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(value)) => value,
            _ => default,
        }
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), ConfigError> {
        self.set(key, Value::Bool(value))
    }
}

// creates a path to CONFIG_FILE_NAME in the same directory as the executable
// this could be useful for usb sticks
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            // F:\foo.exe => F:\foo.json
            if !path.set_extension("json") {
                debug!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            debug!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// creates a path to blocklybot-connect.json in an os dependent standard directory, such as
// %AppData% on windows.
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "tharvey", "blocklybot-connect").map(|dirs| {
        dirs.config_dir().join("blocklybot-connect.json")
    })
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = get_portable_config_path() {
        match std::fs::metadata(&path) {
            Ok(attr) if attr.is_file() => return Ok(path),
            Ok(_) => {},
            Err(err) => {
                debug!("Could not read metadata of: {}; Using local path instead. ({:?})", path.to_string_lossy(), err);
            },
        }
    }

    match get_local_config_path() {
        None => Err(ConfigError::NoConfigPath),
        Some(path) => Ok(path),
    }
}

fn parse_values(content: &[u8]) -> Result<Map<String, Value>, ConfigError> {
    if content.is_empty() {
        return Ok(Map::new());
    }

    let content = str::from_utf8(content)?;
    let values: Map<String, Value> = serde_json::from_str(content)?;
    Ok(values)
}

pub struct ConfigIOLocker {
    rw_lock: RwLock<File>,
}

impl ConfigIOLocker {
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<File>, ConfigError> {
        match self.rw_lock.try_write() {
            Ok(guard) => Ok(guard),
            Err(source) => Err(ConfigError::CanNotLock { source }),
        }
    }
}

struct ConfigIOInner {
    file: File,
    values: Map<String, Value>,
}

impl ConfigIOInner {
    fn save(&mut self) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(&self.values)?;
        self.file.rewind()?;
        self.file.set_len(0)?;
        self.file.write_all(content.as_bytes())?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// A JSON object on disk, rewritten as a whole on every change.
#[derive(Clone)]
pub struct ConfigIO {
    inner: Arc<Mutex<ConfigIOInner>>,
}

impl ConfigIO {
    pub fn new_sync() -> Result<Self, ConfigError> {
        let path = get_config_path()?;
        info!("Using config file {}", path.to_string_lossy());
        Self::open(path)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .append(false)
            .create(true)
            .open(path)?;

        let mut content = vec![];
        file.read_to_end(&mut content)?;
        let values = parse_values(&content)?;

        let inner = ConfigIOInner {
            file,
            values,
        };
        Ok(ConfigIO { inner: Arc::new(Mutex::new(inner)) })
    }

    // obtain an exclusive file lock so that this config file is used by only one instance of
    // this application.
    pub fn locker(&self) -> Result<ConfigIOLocker, ConfigError> {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");

        Ok(ConfigIOLocker {
            rw_lock: RwLock::new(inner.file.try_clone()?),
        })
    }
}

impl PreferenceStore for ConfigIO {
    fn get(&self, key: &str) -> Option<Value> {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");
        inner.values.get(key).cloned()
    }

    fn set_all(&self, entries: Vec<(&str, Value)>) -> Result<(), ConfigError> {
        let mut inner = self.inner.lock().expect("Failed to lock ConfigIO inner");
        for (key, value) in entries {
            inner.values.insert(key.to_string(), value);
        }
        inner.save()
    }
}

/// Store that lives only as long as the process, for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.lock().expect("Failed to lock MemoryStore");
        values.get(key).cloned()
    }

    fn set_all(&self, entries: Vec<(&str, Value)>) -> Result<(), ConfigError> {
        let mut values = self.values.lock().expect("Failed to lock MemoryStore");
        for (key, value) in entries {
            values.insert(key.to_string(), value);
        }
        Ok(())
    }
}
