//! Persistence of named values across sessions.
//!
//! The token engine keeps the signed-in user and pending sign-in states here,
//! and [`LastUsed`] remembers which issuer and client the user picked last.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Map, Value as JsonValue};
use url::Url;

const ISSUER_KEY: &str = "kapi-client.iss";
const CLIENT_ID_KEY: &str = "kapi-client.client_id";

/// Consumer-provided key/value persistence.
///
/// Mirrors browser `localStorage`: synchronous, string values, named keys.
pub trait TokenStore: Send + Sync + 'static {
    fn get(&self, name: &str) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>>;

    fn set(&self, name: &str, value: &str)
    -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Removing a missing key is not an error.
    fn remove(&self, name: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<T: TokenStore> TokenStore for std::sync::Arc<T> {
    fn get(&self, name: &str) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        (**self).get(name)
    }

    fn set(
        &self,
        name: &str,
        value: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).set(name, value)
    }

    fn remove(&self, name: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).remove(name)
    }
}

/// In-process store; contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryStore {
    fn get(&self, name: &str) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        let values = self.values.lock().map_err(|_| "memory store poisoned")?;
        Ok(values.get(name).cloned())
    }

    fn set(
        &self,
        name: &str,
        value: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut values = self.values.lock().map_err(|_| "memory store poisoned")?;
        values.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut values = self.values.lock().map_err(|_| "memory store poisoned")?;
        values.remove(name);
        Ok(())
    }
}

/// Store backed by a single JSON object file, rewritten on every mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<Map<String, JsonValue>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or is not a JSON object.
    pub fn open(
        path: impl AsRef<Path>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Map::new(),
            Ok(bytes) => match serde_json::from_slice(&bytes)? {
                JsonValue::Object(map) => map,
                _ => return Err(format!("{}: not a JSON object", path.display()).into()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(
        &self,
        values: &Map<String, JsonValue>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl TokenStore for FileStore {
    fn get(&self, name: &str) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        let values = self.values.lock().map_err(|_| "file store poisoned")?;
        Ok(values
            .get(name)
            .and_then(JsonValue::as_str)
            .map(str::to_string))
    }

    fn set(
        &self,
        name: &str,
        value: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut values = self.values.lock().map_err(|_| "file store poisoned")?;
        values.insert(name.to_string(), JsonValue::String(value.to_string()));
        self.persist(&values)
    }

    fn remove(&self, name: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut values = self.values.lock().map_err(|_| "file store poisoned")?;
        if values.remove(name).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

/// Remembers the last-used issuer and client ID across runs.
pub struct LastUsed<'a, S: TokenStore> {
    store: &'a S,
}

impl<'a, S: TokenStore> LastUsed<'a, S> {
    #[must_use]
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// # Errors
    ///
    /// Returns the store error if either value cannot be written.
    pub fn remember(
        &self,
        issuer: &Url,
        client_id: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.store.set(ISSUER_KEY, issuer.as_str())?;
        self.store.set(CLIENT_ID_KEY, client_id)
    }

    /// Last issuer and client ID, if both are stored and the issuer is a valid URL.
    #[must_use]
    pub fn recall(&self) -> Option<(Url, String)> {
        let issuer = self.store.get(ISSUER_KEY).ok().flatten()?;
        let client_id = self.store.get(CLIENT_ID_KEY).ok().flatten()?;
        match issuer.parse() {
            Ok(url) => Some((url, client_id)),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring stored issuer");
                None
            }
        }
    }

    /// # Errors
    ///
    /// Returns the store error if either value cannot be removed.
    pub fn forget(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.store.remove(ISSUER_KEY)?;
        self.store.remove(CLIENT_ID_KEY)
    }
}
