//! In-memory transport for tests and single-process demos.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::{Error, PushOutcome, Result, Snapshot, Transport, Version};

/// Shared in-memory board. Clone the `Arc` it lives in to hand the same
/// board to several [`crate::BoardClient`]s.
#[derive(Default)]
pub struct MemoryTransport {
    inner: Mutex<Snapshot>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete an object out from under every client, simulating a board
    /// rewind. Exists for attack-scenario tests; a real transport only
    /// appends.
    pub fn rewind(&self, path: &str) -> bool {
        let mut inner = self.inner.lock().expect("memory board lock");
        let removed = inner.objects.remove(path).is_some();
        if removed {
            inner.version += 1;
        }
        removed
    }
}

impl Transport for MemoryTransport {
    fn pull(&self) -> Result<Snapshot> {
        Ok(self.inner.lock().expect("memory board lock").clone())
    }

    fn push(&self, base: Version, additions: &BTreeMap<String, Vec<u8>>) -> Result<PushOutcome> {
        let mut inner = self.inner.lock().expect("memory board lock");
        if inner.version != base {
            return Ok(PushOutcome::Conflict);
        }
        for path in additions.keys() {
            if inner.objects.contains_key(path) {
                return Err(Error::Transport(format!(
                    "append of existing path {path} at matching version"
                )));
            }
        }
        for (path, blob) in additions {
            inner.objects.insert(path.clone(), blob.clone());
        }
        inner.version += 1;
        Ok(PushOutcome::Committed(inner.version))
    }
}
