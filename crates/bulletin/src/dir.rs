//! Shared-directory transport.
//!
//! Backs the board with a directory reachable by every node (a bind mount,
//! an NFS share, a synced folder). Objects live under `objects/` with the
//! board path as the relative file path; a `version` file carries the board
//! version and a `board.lock` file serialises writers with an advisory lock.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::{Error, PushOutcome, Result, Snapshot, Transport, Version};

const OBJECTS_DIR: &str = "objects";
const VERSION_FILE: &str = "version";
const LOCK_FILE: &str = "board.lock";

/// Directory-backed board transport.
pub struct DirTransport {
    root: PathBuf,
}

impl DirTransport {
    /// Open (creating if necessary) a board rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(OBJECTS_DIR))?;
        let version_path = root.join(VERSION_FILE);
        if !version_path.exists() {
            fs::write(&version_path, b"0")?;
        }
        let lock_path = root.join(LOCK_FILE);
        if !lock_path.exists() {
            File::create(&lock_path)?;
        }
        Ok(Self { root })
    }

    fn lock_file(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.root.join(LOCK_FILE))?)
    }

    fn read_version(&self) -> Result<Version> {
        let raw = fs::read_to_string(self.root.join(VERSION_FILE))?;
        raw.trim()
            .parse()
            .map_err(|_| Error::Transport(format!("corrupt version file: {raw:?}")))
    }

    fn write_version(&self, version: Version) -> Result<()> {
        let tmp = self.root.join(format!("{VERSION_FILE}.tmp"));
        let mut file = File::create(&tmp)?;
        file.write_all(version.to_string().as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, self.root.join(VERSION_FILE))?;
        Ok(())
    }

    fn collect(&self, dir: &Path, rel: &str, out: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let child_rel = if rel.is_empty() {
                name.to_string()
            } else {
                format!("{rel}/{name}")
            };
            if entry.file_type()?.is_dir() {
                self.collect(&entry.path(), &child_rel, out)?;
            } else {
                out.insert(child_rel, fs::read(entry.path())?);
            }
        }
        Ok(())
    }

    fn object_path(&self, board_path: &str) -> Result<PathBuf> {
        let mut path = self.root.join(OBJECTS_DIR);
        for component in board_path.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(Error::Transport(format!(
                    "invalid board path: {board_path:?}"
                )));
            }
            path.push(component);
        }
        Ok(path)
    }
}

impl Transport for DirTransport {
    fn pull(&self) -> Result<Snapshot> {
        let lock = self.lock_file()?;
        lock.lock_shared()?;
        let result = (|| {
            let version = self.read_version()?;
            let mut objects = BTreeMap::new();
            self.collect(&self.root.join(OBJECTS_DIR), "", &mut objects)?;
            Ok(Snapshot { version, objects })
        })();
        lock.unlock()?;
        result
    }

    fn push(&self, base: Version, additions: &BTreeMap<String, Vec<u8>>) -> Result<PushOutcome> {
        let lock = self.lock_file()?;
        lock.lock_exclusive()?;
        let result = (|| {
            let version = self.read_version()?;
            if version != base {
                return Ok(PushOutcome::Conflict);
            }
            for (board_path, blob) in additions {
                let path = self.object_path(board_path)?;
                if path.exists() {
                    return Err(Error::Transport(format!(
                        "append of existing path {board_path} at matching version"
                    )));
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let tmp = path.with_extension("tmp");
                let mut file = File::create(&tmp)?;
                file.write_all(blob)?;
                file.sync_all()?;
                fs::rename(&tmp, &path)?;
            }
            let next = version + 1;
            self.write_version(next)?;
            Ok(PushOutcome::Committed(next))
        })();
        lock.unlock()?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pull_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let transport = DirTransport::open(dir.path()).unwrap();

        let mut additions = BTreeMap::new();
        additions.insert("dkg/demo/commitments/node1.json".to_string(), b"abc".to_vec());
        assert_eq!(transport.push(0, &additions).unwrap(), PushOutcome::Committed(1));

        let snap = transport.pull().unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(
            snap.objects.get("dkg/demo/commitments/node1.json").unwrap(),
            b"abc"
        );
    }

    #[test]
    fn stale_base_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let transport = DirTransport::open(dir.path()).unwrap();

        let mut additions = BTreeMap::new();
        additions.insert("a".to_string(), vec![1]);
        transport.push(0, &additions).unwrap();

        let mut more = BTreeMap::new();
        more.insert("b".to_string(), vec![2]);
        assert_eq!(transport.push(0, &more).unwrap(), PushOutcome::Conflict);
    }

    #[test]
    fn rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let transport = DirTransport::open(dir.path()).unwrap();

        let mut additions = BTreeMap::new();
        additions.insert("../escape".to_string(), vec![1]);
        assert!(transport.push(0, &additions).is_err());
    }

    #[test]
    fn two_transports_share_one_board() {
        let dir = tempfile::tempdir().unwrap();
        let a = DirTransport::open(dir.path()).unwrap();
        let b = DirTransport::open(dir.path()).unwrap();

        let mut additions = BTreeMap::new();
        additions.insert("identity/node1".to_string(), b"pem".to_vec());
        a.push(0, &additions).unwrap();

        let snap = b.pull().unwrap();
        assert_eq!(snap.objects.get("identity/node1").unwrap(), b"pem");
    }
}
