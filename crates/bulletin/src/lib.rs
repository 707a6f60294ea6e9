//! Bulletin Board Client
//!
//! A path-addressed, append-style object store shared by all custody nodes.
//! The board is the only channel nodes use to coordinate; they never need to
//! be online at the same time.
//!
//! The transport underneath is abstract: anything offering an atomic
//! versioned `pull` and a compare-and-append `push` will do. Two transports
//! ship with this crate: [`memory::MemoryTransport`] for in-process tests and
//! [`dir::DirTransport`] for multi-process deployments over a shared
//! directory.
//!
//! [`BoardClient`] layers the posting discipline on top: posts are
//! idempotent on identical content, refuse to overwrite differing content,
//! and resolve push conflicts with a bounded pull-rebase-push loop.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

pub mod dir;
pub mod memory;

pub use dir::DirTransport;
pub use memory::MemoryTransport;

/// Board errors
#[derive(Debug, Error)]
pub enum Error {
    /// The path is already on the board with different content.
    #[error("path already on board with different content: {0}")]
    Occupied(String),

    /// Push conflicts persisted through the whole retry budget.
    #[error("push conflict persisted after {0} attempts")]
    RetriesExhausted(usize),

    /// Underlying transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Monotonic board version as observed at pull time.
pub type Version = u64;

/// A consistent view of the whole board at one version.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Version this snapshot was taken at.
    pub version: Version,
    /// All objects on the board, keyed by path.
    pub objects: BTreeMap<String, Vec<u8>>,
}

/// Outcome of a transport push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Additions committed; the board is now at this version.
    Committed(Version),
    /// The board moved past `base`; pull and retry.
    Conflict,
}

/// Abstract board transport: versioned pull, compare-and-append push.
///
/// Paths are append-only. A push succeeds only if the board has not moved
/// since the `base` version the caller pulled, which makes create-if-absent
/// races (session locks, results) resolvable by the caller.
pub trait Transport: Send + Sync {
    /// Fetch the whole board.
    fn pull(&self) -> Result<Snapshot>;

    /// Atomically append `additions` if the board is still at `base`.
    fn push(&self, base: Version, additions: &BTreeMap<String, Vec<u8>>) -> Result<PushOutcome>;
}

/// How many pull-rebase-push rounds a post attempts before giving up.
pub const PUSH_RETRY_ATTEMPTS: usize = 3;

/// Client for one node's view of the board.
///
/// Holds a local working copy refreshed by [`BoardClient::sync`]; all reads
/// are served from the most recent pull.
pub struct BoardClient {
    transport: Arc<dyn Transport>,
    node_id: String,
    snapshot: Mutex<Snapshot>,
}

impl BoardClient {
    /// Connect a node to a transport. Performs no I/O until the first
    /// operation.
    pub fn new(transport: Arc<dyn Transport>, node_id: impl Into<String>) -> Self {
        Self {
            transport,
            node_id: node_id.into(),
            snapshot: Mutex::new(Snapshot::default()),
        }
    }

    /// Refresh the working copy from the transport.
    pub fn sync(&self) -> Result<()> {
        let fresh = self.transport.pull()?;
        *self.snapshot.lock().expect("board snapshot lock") = fresh;
        Ok(())
    }

    /// Pull, then read one object. `None` if the path is absent.
    pub fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.sync()?;
        let snap = self.snapshot.lock().expect("board snapshot lock");
        Ok(snap.objects.get(path).cloned())
    }

    /// Pull, then list all paths under `prefix`, sorted.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.sync()?;
        let snap = self.snapshot.lock().expect("board snapshot lock");
        Ok(snap
            .objects
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect())
    }

    /// Publish one object.
    ///
    /// Idempotent on identical content. Fails with [`Error::Occupied`] if the
    /// path already carries different content (including when a concurrent
    /// writer wins the race mid-retry), and with [`Error::RetriesExhausted`]
    /// if push conflicts outlast the retry budget.
    pub fn post(&self, path: &str, blob: &[u8]) -> Result<()> {
        for attempt in 1..=PUSH_RETRY_ATTEMPTS {
            self.sync()?;
            let base = {
                let snap = self.snapshot.lock().expect("board snapshot lock");
                if let Some(existing) = snap.objects.get(path) {
                    if existing.as_slice() == blob {
                        debug!(node_id = %self.node_id, path, "post: identical content already on board");
                        return Ok(());
                    }
                    return Err(Error::Occupied(path.to_string()));
                }
                snap.version
            };

            let mut additions = BTreeMap::new();
            additions.insert(path.to_string(), blob.to_vec());

            match self.transport.push(base, &additions)? {
                PushOutcome::Committed(version) => {
                    debug!(node_id = %self.node_id, path, version, "post: committed");
                    let mut snap = self.snapshot.lock().expect("board snapshot lock");
                    snap.version = version;
                    snap.objects.insert(path.to_string(), blob.to_vec());
                    return Ok(());
                }
                PushOutcome::Conflict => {
                    debug!(node_id = %self.node_id, path, attempt, "post: push conflict, rebasing");
                }
            }
        }
        Err(Error::RetriesExhausted(PUSH_RETRY_ATTEMPTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(transport: &Arc<MemoryTransport>, node_id: &str) -> BoardClient {
        BoardClient::new(transport.clone() as Arc<dyn Transport>, node_id)
    }

    #[test]
    fn post_then_read() {
        let transport = Arc::new(MemoryTransport::new());
        let board = client(&transport, "node1");

        board.post("identity/node1", b"pem").unwrap();
        assert_eq!(board.read("identity/node1").unwrap().unwrap(), b"pem");
        assert_eq!(board.read("identity/node2").unwrap(), None);
    }

    #[test]
    fn post_is_idempotent_on_identical_content() {
        let transport = Arc::new(MemoryTransport::new());
        let board = client(&transport, "node1");

        board.post("a/b", b"x").unwrap();
        board.post("a/b", b"x").unwrap();
        assert_eq!(board.list("a/").unwrap().len(), 1);
    }

    #[test]
    fn post_refuses_different_content() {
        let transport = Arc::new(MemoryTransport::new());
        let board = client(&transport, "node1");

        board.post("a/b", b"x").unwrap();
        match board.post("a/b", b"y") {
            Err(Error::Occupied(path)) => assert_eq!(path, "a/b"),
            other => panic!("expected Occupied, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_writers_converge() {
        let transport = Arc::new(MemoryTransport::new());
        let board1 = client(&transport, "node1");
        let board2 = client(&transport, "node2");

        // board1 holds a stale working copy while board2 commits; board1's
        // post must rebase and still land.
        board1.sync().unwrap();
        board2.post("signing/tx_1/commitments/node2.json", b"r2").unwrap();
        board1.post("signing/tx_1/commitments/node1.json", b"r1").unwrap();

        let paths = board2.list("signing/tx_1/commitments/").unwrap();
        assert_eq!(paths.len(), 2);
    }

    #[test]
    fn first_writer_wins_on_shared_path() {
        let transport = Arc::new(MemoryTransport::new());
        let board1 = client(&transport, "node1");
        let board2 = client(&transport, "node2");

        board1.post("signing/tx_1/session.json", b"lock-by-node1").unwrap();
        match board2.post("signing/tx_1/session.json", b"lock-by-node2") {
            Err(Error::Occupied(_)) => {}
            other => panic!("expected Occupied, got {other:?}"),
        }
        assert_eq!(
            board2.read("signing/tx_1/session.json").unwrap().unwrap(),
            b"lock-by-node1"
        );
    }

    #[test]
    fn list_filters_by_prefix() {
        let transport = Arc::new(MemoryTransport::new());
        let board = client(&transport, "node1");

        board.post("dkg/demo/commitments/node1.json", b"a").unwrap();
        board.post("dkg/demo/commitments/node2.json", b"b").unwrap();
        board.post("dkg/demo/shares/node1_to_node2.enc", b"c").unwrap();

        let commitments = board.list("dkg/demo/commitments/").unwrap();
        assert_eq!(
            commitments,
            vec![
                "dkg/demo/commitments/node1.json".to_string(),
                "dkg/demo/commitments/node2.json".to_string(),
            ]
        );
    }
}
