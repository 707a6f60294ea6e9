//! Labelled-object token backends
//!
//! Storage seam under the secret module adapter: anything that can hold
//! labelled objects with per-object attributes, gate access behind a PIN
//! hash, and offer an atomic read-modify-write suffices. The in-memory
//! backend serves tests; the file backend persists a software token under
//! the node's data directory.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{Error, Result};

/// One labelled object inside the token.
///
/// `sensitive` / `extractable` mirror the PKCS#11 attributes of the same
/// names; the adapter refuses plaintext readback of non-extractable values.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenObject {
    pub label: String,
    #[serde(with = "hex::serde")]
    pub value: Vec<u8>,
    pub sensitive: bool,
    pub extractable: bool,
}

impl TokenObject {
    pub fn new(label: impl Into<String>, value: Vec<u8>, sensitive: bool, extractable: bool) -> Self {
        Self {
            label: label.into(),
            value,
            sensitive,
            extractable,
        }
    }
}

impl Drop for TokenObject {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

impl std::fmt::Debug for TokenObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenObject")
            .field("label", &self.label)
            .field("value_len", &self.value.len())
            .field("sensitive", &self.sensitive)
            .field("extractable", &self.extractable)
            .finish()
    }
}

/// Token storage backend.
pub trait TokenBackend: Send + Sync {
    /// Fetch an object by label.
    fn get(&self, label: &str) -> Result<Option<TokenObject>>;

    /// Create an object. Fails if the label is taken.
    fn insert(&self, object: TokenObject) -> Result<()>;

    /// Create or overwrite an object.
    fn replace(&self, object: TokenObject) -> Result<()>;

    /// Delete an object; reports whether it existed.
    fn remove(&self, label: &str) -> Result<bool>;

    /// All labels, sorted.
    fn labels(&self) -> Result<Vec<String>>;

    /// Atomic read-modify-write of one object's value. The closure receives
    /// the current value and returns the replacement; the new value is
    /// returned to the caller.
    fn update_value(
        &self,
        label: &str,
        f: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>>;

    /// Stored PIN hash, if the token has been personalised.
    fn pin_hash(&self) -> Result<Option<Vec<u8>>>;

    /// Personalise the token with a PIN hash.
    fn set_pin_hash(&self, hash: &[u8]) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    objects: BTreeMap<String, TokenObject>,
    pin_hash: Option<Vec<u8>>,
}

/// In-memory token for tests and in-process demos.
#[derive(Default)]
pub struct MemoryToken {
    inner: Mutex<MemoryInner>,
}

impl MemoryToken {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenBackend for MemoryToken {
    fn get(&self, label: &str) -> Result<Option<TokenObject>> {
        let inner = self.inner.lock().expect("token lock");
        Ok(inner.objects.get(label).cloned())
    }

    fn insert(&self, object: TokenObject) -> Result<()> {
        let mut inner = self.inner.lock().expect("token lock");
        if inner.objects.contains_key(&object.label) {
            return Err(Error::Module(format!(
                "object {} already exists",
                object.label
            )));
        }
        inner.objects.insert(object.label.clone(), object);
        Ok(())
    }

    fn replace(&self, object: TokenObject) -> Result<()> {
        let mut inner = self.inner.lock().expect("token lock");
        inner.objects.insert(object.label.clone(), object);
        Ok(())
    }

    fn remove(&self, label: &str) -> Result<bool> {
        let mut inner = self.inner.lock().expect("token lock");
        Ok(inner.objects.remove(label).is_some())
    }

    fn labels(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().expect("token lock");
        Ok(inner.objects.keys().cloned().collect())
    }

    fn update_value(
        &self,
        label: &str,
        f: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().expect("token lock");
        let object = inner
            .objects
            .get_mut(label)
            .ok_or_else(|| Error::MissingObject(label.to_string()))?;
        let new_value = f(&object.value)?;
        object.value.zeroize();
        object.value = new_value.clone();
        Ok(new_value)
    }

    fn pin_hash(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().expect("token lock").pin_hash.clone())
    }

    fn set_pin_hash(&self, hash: &[u8]) -> Result<()> {
        self.inner.lock().expect("token lock").pin_hash = Some(hash.to_vec());
        Ok(())
    }
}

#[derive(Default, Serialize, Deserialize)]
struct TokenFileContents {
    pin_hash_hex: Option<String>,
    objects: Vec<TokenObject>,
}

/// File-backed software token.
///
/// The whole token is one JSON file; every operation runs under an
/// exclusive advisory lock and rewrites the file atomically.
pub struct FileToken {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileToken {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_path = path.with_extension("lock");
        if !lock_path.exists() {
            File::create(&lock_path)?;
        }
        Ok(Self { path, lock_path })
    }

    fn with_contents<R>(
        &self,
        mutate: bool,
        f: impl FnOnce(&mut TokenFileContents) -> Result<R>,
    ) -> Result<R> {
        let lock = OpenOptions::new().read(true).write(true).open(&self.lock_path)?;
        lock.lock_exclusive()?;
        let result = (|| {
            let mut contents = if self.path.exists() {
                serde_json::from_slice(&fs::read(&self.path)?)?
            } else {
                TokenFileContents::default()
            };
            let out = f(&mut contents)?;
            if mutate {
                let tmp = self.path.with_extension("tmp");
                let mut file = File::create(&tmp)?;
                file.write_all(&serde_json::to_vec_pretty(&contents)?)?;
                file.sync_all()?;
                fs::rename(&tmp, &self.path)?;
            }
            Ok(out)
        })();
        lock.unlock()?;
        result
    }

    fn position(contents: &TokenFileContents, label: &str) -> Option<usize> {
        contents.objects.iter().position(|o| o.label == label)
    }
}

impl TokenBackend for FileToken {
    fn get(&self, label: &str) -> Result<Option<TokenObject>> {
        self.with_contents(false, |contents| {
            Ok(Self::position(contents, label).map(|i| contents.objects[i].clone()))
        })
    }

    fn insert(&self, object: TokenObject) -> Result<()> {
        self.with_contents(true, |contents| {
            if Self::position(contents, &object.label).is_some() {
                return Err(Error::Module(format!(
                    "object {} already exists",
                    object.label
                )));
            }
            contents.objects.push(object);
            Ok(())
        })
    }

    fn replace(&self, object: TokenObject) -> Result<()> {
        self.with_contents(true, |contents| {
            if let Some(i) = Self::position(contents, &object.label) {
                contents.objects[i] = object;
            } else {
                contents.objects.push(object);
            }
            Ok(())
        })
    }

    fn remove(&self, label: &str) -> Result<bool> {
        self.with_contents(true, |contents| {
            match Self::position(contents, label) {
                Some(i) => {
                    contents.objects.remove(i);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn labels(&self) -> Result<Vec<String>> {
        self.with_contents(false, |contents| {
            let mut labels: Vec<String> =
                contents.objects.iter().map(|o| o.label.clone()).collect();
            labels.sort();
            Ok(labels)
        })
    }

    fn update_value(
        &self,
        label: &str,
        f: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        self.with_contents(true, |contents| {
            let i = Self::position(contents, label)
                .ok_or_else(|| Error::MissingObject(label.to_string()))?;
            let new_value = f(&contents.objects[i].value)?;
            contents.objects[i].value.zeroize();
            contents.objects[i].value = new_value.clone();
            Ok(new_value)
        })
    }

    fn pin_hash(&self) -> Result<Option<Vec<u8>>> {
        self.with_contents(false, |contents| {
            contents
                .pin_hash_hex
                .as_ref()
                .map(|h| hex::decode(h).map_err(|e| Error::Module(format!("corrupt pin hash: {e}"))))
                .transpose()
        })
    }

    fn set_pin_hash(&self, hash: &[u8]) -> Result<()> {
        self.with_contents(true, |contents| {
            contents.pin_hash_hex = Some(hex::encode(hash));
            Ok(())
        })
    }
}
