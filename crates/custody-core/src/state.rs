//! Durable node state
//!
//! One JSON document per node, guarded by an advisory file lock and replaced
//! atomically (tmp, fsync, rename). Reads take a shared lock; updates take
//! an exclusive lock and load the file again *without* re-acquiring it —
//! the update path must never call the public read path, which would
//! deadlock on the lock.
//!
//! Besides the ceremony flags, the state file is the first layer of the
//! nonce-reuse defence: every approved request is recorded here before the
//! board learns anything.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::module::ModuleSession;
use crate::types::OperationMode;
use crate::{Error, Result};

/// DKG ceremony phase, per the `idle → committed → distributed → finalized`
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DkgPhase {
    #[default]
    Idle,
    Committed,
    Distributed,
    Finalized,
}

impl std::fmt::Display for DkgPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DkgPhase::Idle => write!(f, "idle"),
            DkgPhase::Committed => write!(f, "committed"),
            DkgPhase::Distributed => write!(f, "distributed"),
            DkgPhase::Finalized => write!(f, "finalized"),
        }
    }
}

/// This node's view of its DKG participation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DkgState {
    pub round_id: Option<String>,
    pub phase: DkgPhase,
    pub threshold: usize,
    pub total: usize,
    /// Sorted participant list fixed at finalise; index(j) is 1 + position.
    pub participants: Vec<String>,
    pub group_pubkey_hex: Option<String>,
    pub share_stored: bool,
}

/// Per-request nonce usage record (third defence layer is the board; this
/// file is the first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRecord {
    pub counter: u64,
    pub r_hex: String,
    pub message_digest_hex: String,
}

/// The whole durable document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    pub initialized: bool,
    pub identity_posted: bool,
    pub dkg: DkgState,
    /// request_id → nonce usage record.
    pub nonces: BTreeMap<String, NonceRecord>,
}

impl NodeState {
    fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            initialized: false,
            identity_posted: false,
            dkg: DkgState::default(),
            nonces: BTreeMap::new(),
        }
    }
}

/// Outcome of the nonce consistency audit between this file and the secret
/// module's derivation records.
#[derive(Debug, Default)]
pub struct NonceAudit {
    pub local_records: usize,
    pub module_records: usize,
    pub mismatches: Vec<String>,
}

impl NonceAudit {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Durable state store for one node.
pub struct StateStore {
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl StateStore {
    /// Open (creating if necessary) the state file under `data_dir`.
    pub fn open(data_dir: &Path, node_id: &str) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let store = Self {
            state_path: data_dir.join("state.json"),
            lock_path: data_dir.join("state.lock"),
        };
        if !store.lock_path.exists() {
            File::create(&store.lock_path)?;
        }
        if !store.state_path.exists() {
            store.save(&NodeState::new(node_id))?;
        }
        Ok(store)
    }

    fn lock_file(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.lock_path)?)
    }

    /// Load under a shared lock.
    pub fn load(&self) -> Result<NodeState> {
        let lock = self.lock_file()?;
        lock.lock_shared()?;
        let result = self.load_unlocked();
        lock.unlock()?;
        result
    }

    /// Load without touching the lock. Only for callers that already hold
    /// it.
    fn load_unlocked(&self) -> Result<NodeState> {
        let raw = fs::read(&self.state_path)?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::StateCorruption(format!("unreadable state file: {e}")))
    }

    /// Atomic replace: write a sibling tmp file, fsync, rename over the
    /// target.
    fn save(&self, state: &NodeState) -> Result<()> {
        let tmp = self.state_path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(state)?)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    /// Exclusive-locked read-modify-write.
    pub fn update<F>(&self, mutate: F) -> Result<NodeState>
    where
        F: FnOnce(&mut NodeState),
    {
        let lock = self.lock_file()?;
        lock.lock_exclusive()?;
        let result = (|| {
            let mut state = self.load_unlocked()?;
            mutate(&mut state);
            self.save(&state)?;
            Ok(state)
        })();
        lock.unlock()?;
        result
    }

    /// First-layer reuse check.
    pub fn has_nonce_for(&self, request_id: &str) -> Result<bool> {
        Ok(self.load()?.nonces.contains_key(request_id))
    }

    /// Record a derivation for a request. Refuses to overwrite.
    pub fn record_nonce(&self, request_id: &str, record: NonceRecord) -> Result<()> {
        let lock = self.lock_file()?;
        lock.lock_exclusive()?;
        let result = (|| {
            let mut state = self.load_unlocked()?;
            if state.nonces.contains_key(request_id) {
                return Err(Error::NonceReuseAttempted {
                    request_id: request_id.to_string(),
                    layer: crate::ReuseLayer::LocalState,
                });
            }
            debug!(request_id, counter = record.counter, "recording nonce use");
            state.nonces.insert(request_id.to_string(), record);
            self.save(&state)
        })();
        lock.unlock()?;
        result
    }

    /// All recorded nonce usages.
    pub fn nonce_records(&self) -> Result<BTreeMap<String, NonceRecord>> {
        Ok(self.load()?.nonces)
    }

    /// Compare this file's records against the module's derivation trail.
    ///
    /// In demo mode the full records are compared; in production only the
    /// counter sets (record values are non-extractable there).
    pub fn audit_nonces(&self, session: &ModuleSession<'_>, mode: OperationMode) -> Result<NonceAudit> {
        let local = self.nonce_records()?;
        let module_counters = session.derivation_counters()?;
        let mut audit = NonceAudit {
            local_records: local.len(),
            module_records: module_counters.len(),
            mismatches: Vec::new(),
        };

        for (request_id, record) in &local {
            if !module_counters.contains(&record.counter) {
                audit.mismatches.push(format!(
                    "request {request_id}: counter {} has no module derivation record",
                    record.counter
                ));
            }
        }

        if mode == OperationMode::Demo {
            for module_record in session.derivation_records()? {
                match local.get(&module_record.request_id) {
                    None => audit.mismatches.push(format!(
                        "module derivation {} (request {}) missing from local state",
                        module_record.counter, module_record.request_id
                    )),
                    Some(local_record) => {
                        if local_record.counter != module_record.counter
                            || local_record.r_hex != module_record.r_hex
                            || local_record.message_digest_hex != module_record.message_digest_hex
                        {
                            audit.mismatches.push(format!(
                                "request {} disagrees between local state and module",
                                module_record.request_id
                            ));
                        }
                    }
                }
            }
        }

        Ok(audit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{token::MemoryToken, SecretModule};
    use crate::types::ModulePin;
    use crate::math;
    use rand::rngs::OsRng;
    use std::sync::Arc;

    fn store() -> (StateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path(), "node1").unwrap();
        (store, dir)
    }

    #[test]
    fn fresh_store_starts_idle() {
        let (store, _dir) = store();
        let state = store.load().unwrap();
        assert_eq!(state.node_id, "node1");
        assert!(!state.initialized);
        assert_eq!(state.dkg.phase, DkgPhase::Idle);
        assert!(state.nonces.is_empty());
    }

    #[test]
    fn update_persists_atomically() {
        let (store, dir) = store();
        store
            .update(|s| {
                s.initialized = true;
                s.dkg.phase = DkgPhase::Committed;
            })
            .unwrap();

        // A second handle over the same directory sees the update.
        let reopened = StateStore::open(dir.path(), "node1").unwrap();
        let state = reopened.load().unwrap();
        assert!(state.initialized);
        assert_eq!(state.dkg.phase, DkgPhase::Committed);
        assert!(!dir.path().join("state.tmp").exists());
    }

    #[test]
    fn nonce_record_refuses_overwrite() {
        let (store, _dir) = store();
        let record = NonceRecord {
            counter: 1,
            r_hex: "02ab".to_string(),
            message_digest_hex: "00".to_string(),
        };
        store.record_nonce("tx_1", record.clone()).unwrap();
        assert!(store.has_nonce_for("tx_1").unwrap());
        assert!(matches!(
            store.record_nonce("tx_1", record),
            Err(Error::NonceReuseAttempted { .. })
        ));
    }

    #[test]
    fn audit_flags_counter_drift() {
        let (store, _dir) = store();
        let module = SecretModule::new(Arc::new(MemoryToken::new()), OperationMode::Demo);
        let session = module.login(&ModulePin::new("test-pin-123").unwrap()).unwrap();
        session.init_nonce_derivation(&mut OsRng).unwrap();

        let digest = math::sha256(b"message");
        let derivation = session.derive_nonce("tx_1", &digest).unwrap();
        store
            .record_nonce(
                "tx_1",
                NonceRecord {
                    counter: derivation.counter,
                    r_hex: derivation.r_hex.clone(),
                    message_digest_hex: hex::encode(digest),
                },
            )
            .unwrap();

        let clean = store.audit_nonces(&session, OperationMode::Demo).unwrap();
        assert!(clean.is_consistent());

        // A local record the module never derived (snapshot drift).
        store
            .record_nonce(
                "tx_ghost",
                NonceRecord {
                    counter: 99,
                    r_hex: "02ff".to_string(),
                    message_digest_hex: "00".to_string(),
                },
            )
            .unwrap();
        let dirty = store.audit_nonces(&session, OperationMode::Demo).unwrap();
        assert!(!dirty.is_consistent());
    }
}
