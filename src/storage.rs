//! # On-Disk Node Storage
//!
//! A node's data directory holds two files:
//!
//! | File | Contents |
//! |------|----------|
//! | `node.key` | raw 32-byte Ed25519 secret key, mode `0600` on Unix |
//! | `state.bin` | `PMSNAP01` magic, 32-byte BLAKE3 of the body, bincode body |
//!
//! Snapshots are written to `state.bin.tmp`, flushed, synced, and renamed
//! over `state.bin`, so a crash leaves either the old or the new snapshot.
//! A checksum mismatch on load is an error; corrupted state is never
//! silently replaced with an empty node.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use bincode::Options;
use tracing::{debug, info};

use crate::identity::Keypair;
use crate::state::NodeState;

const KEY_FILENAME: &str = "node.key";
const STATE_FILENAME: &str = "state.bin";
const STATE_TMP_FILENAME: &str = "state.bin.tmp";

const SNAPSHOT_MAGIC: &[u8; 8] = b"PMSNAP01";
const CHECKSUM_LEN: usize = 32;
const SNAPSHOT_HEADER_LEN: usize = SNAPSHOT_MAGIC.len() + CHECKSUM_LEN;

/// Upper bound on a decoded snapshot body.
const MAX_SNAPSHOT_SIZE: u64 = 64 * 1024 * 1024;

fn snapshot_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_SNAPSHOT_SIZE)
        .allow_trailing_bytes()
}

#[derive(Clone, Debug)]
pub struct NodeStore {
    dir: PathBuf,
}

impl NodeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create data dir {}", self.dir.display()))
    }

    /// Load `node.key`, or generate and persist a new keypair if absent.
    pub fn load_or_generate_keypair(&self) -> Result<Keypair> {
        let path = self.dir.join(KEY_FILENAME);
        if path.exists() {
            let keypair = load_key_file(&path)?;
            debug!(
                identity = %hex::encode(&keypair.public_key_bytes()[..8]),
                "loaded node key"
            );
            return Ok(keypair);
        }

        self.ensure_dir()?;
        let keypair = Keypair::generate();
        write_key_file(&path, &keypair.secret_key_bytes())?;
        info!(
            identity = %hex::encode(&keypair.public_key_bytes()[..8]),
            path = %path.display(),
            "generated new node key"
        );
        Ok(keypair)
    }

    /// Load the last snapshot. `Ok(None)` when the node has never saved one.
    pub fn load_state(&self) -> Result<Option<NodeState>> {
        let path = self.dir.join(STATE_FILENAME);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let state = decode_snapshot(&bytes)
            .with_context(|| format!("invalid snapshot {}", path.display()))?;
        Ok(Some(state))
    }

    pub fn save_state(&self, state: &NodeState) -> Result<()> {
        self.ensure_dir()?;
        let bytes = encode_snapshot(state)?;
        let tmp = self.dir.join(STATE_TMP_FILENAME);
        let path = self.dir.join(STATE_FILENAME);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("failed to open {}", tmp.display()))?;
        file.write_all(&bytes)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

/// Read a raw 32-byte secret key file.
pub fn load_key_file(path: &Path) -> Result<Keypair> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let secret: [u8; 32] = data.as_slice().try_into().map_err(|_| {
        anyhow::anyhow!(
            "{}: expected 32 bytes, found {}",
            path.display(),
            data.len()
        )
    })?;
    Ok(Keypair::from_secret_key_bytes(&secret))
}

pub fn write_key_file(path: &Path, secret: &[u8; 32]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(secret)?;
    file.flush()?;
    file.sync_all()?;
    set_permission_0600(path)?;
    Ok(())
}

fn encode_snapshot(state: &NodeState) -> Result<Vec<u8>> {
    let body = snapshot_options()
        .serialize(state)
        .context("failed to encode node state")?;
    let checksum = blake3::hash(&body);

    let mut out = Vec::with_capacity(SNAPSHOT_HEADER_LEN + body.len());
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.extend_from_slice(checksum.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_snapshot(bytes: &[u8]) -> Result<NodeState> {
    if bytes.len() < SNAPSHOT_HEADER_LEN {
        bail!("snapshot truncated: {} bytes", bytes.len());
    }
    let (magic, rest) = bytes.split_at(SNAPSHOT_MAGIC.len());
    if magic != SNAPSHOT_MAGIC {
        bail!("bad snapshot magic");
    }
    let (checksum, body) = rest.split_at(CHECKSUM_LEN);
    if blake3::hash(body).as_bytes() != checksum {
        bail!("snapshot checksum mismatch");
    }
    snapshot_options()
        .deserialize(body)
        .context("failed to decode node state")
}

#[cfg(unix)]
fn set_permission_0600(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_permission_0600(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::profile::ProfileUpdate;

    fn sample_state() -> NodeState {
        let owner = Identity::from_bytes([1u8; 32]);
        let mut state = NodeState::new(owner, owner);
        state
            .update_profile(
                owner,
                ProfileUpdate {
                    name: "Grace".into(),
                    bio: "compilers".into(),
                    ..ProfileUpdate::default()
                },
            )
            .expect("update");
        state
            .update_skills(owner, vec!["COBOL".into(), "Rust".into()])
            .expect("skills");
        state
    }

    #[test]
    fn keypair_is_generated_once_and_reloaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = NodeStore::new(dir.path());

        let first = store.load_or_generate_keypair().expect("generate");
        let second = store.load_or_generate_keypair().expect("reload");
        assert_eq!(first.identity(), second.identity());

        let len = fs::metadata(dir.path().join(KEY_FILENAME)).expect("meta").len();
        assert_eq!(len, 32);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        NodeStore::new(dir.path())
            .load_or_generate_keypair()
            .expect("generate");
        let mode = fs::metadata(dir.path().join(KEY_FILENAME))
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn short_key_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(KEY_FILENAME), [0u8; 16]).expect("write");
        let err = NodeStore::new(dir.path())
            .load_or_generate_keypair()
            .unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes"));
    }

    #[test]
    fn missing_snapshot_loads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(NodeStore::new(dir.path()).load_state().expect("load").is_none());
    }

    #[test]
    fn snapshot_survives_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = NodeStore::new(dir.path());
        let state = sample_state();

        store.save_state(&state).expect("save");
        let loaded = store.load_state().expect("load").expect("present");
        assert_eq!(loaded, state);
        assert!(!dir.path().join(STATE_TMP_FILENAME).exists());
    }

    #[test]
    fn corrupted_snapshot_is_a_hard_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = NodeStore::new(dir.path());
        store.save_state(&sample_state()).expect("save");

        let path = dir.path().join(STATE_FILENAME);
        let mut bytes = fs::read(&path).expect("read");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).expect("write");

        let err = store.load_state().unwrap_err();
        assert!(format!("{:#}", err).contains("checksum mismatch"));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encode_snapshot(&sample_state()).expect("encode");
        bytes[0] = b'X';
        assert!(decode_snapshot(&bytes).is_err());
        assert!(decode_snapshot(&bytes[..10]).is_err());
    }
}
