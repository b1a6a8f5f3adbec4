// SPDX-License-Identifier: Apache-2.0
//! Snapshot persistence: framed, checksummed, atomically written.
//!
//! File layout (little-endian): 4-byte magic `VSNP`, `u16` format
//! version, 32-byte BLAKE3 checksum of the payload, then the payload —
//! a CBOR-encoded [`Snapshot`]. Saves write to `path + ".tmp"` and
//! rename into place, so a crash never leaves a half-written snapshot
//! where a reader might find it.
//!
//! The state image and effect params are opaque blobs: the engine
//! does not interpret them. Restoring hands them back to a
//! caller-supplied initializer and effect factory; factory failures
//! are collected, not fatal.

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use veil_core::{Effect, SchemaRegistry, Trackable, TrackedState};

/// Snapshot file magic.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"VSNP";
/// Current snapshot file format version.
pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;
/// Fixed header size: magic + version + checksum.
const HEADER_SIZE: usize = 4 + 2 + 32;

/// Snapshot persistence failures.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Filesystem failure.
    #[error("snapshot io: {0}")]
    Io(#[from] io::Error),
    /// CBOR encoding failure on save.
    #[error("snapshot encode: {0}")]
    Encode(String),
    /// CBOR decoding failure on load.
    #[error("snapshot decode: {0}")]
    Decode(String),
    /// File does not start with the snapshot magic.
    #[error("bad snapshot magic {0:02x?}")]
    BadMagic([u8; 4]),
    /// File format version this build does not read.
    #[error("unsupported snapshot format version {0}")]
    UnsupportedVersion(u16),
    /// Payload does not hash to the header checksum.
    #[error("snapshot checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch {
        /// Checksum from the header, hex.
        expected: String,
        /// Checksum computed over the payload, hex.
        got: String,
    },
    /// File shorter than the fixed header.
    #[error("snapshot file truncated")]
    Truncated,
    /// The user-supplied state initializer failed.
    #[error("snapshot initializer: {0}")]
    Initializer(String),
}

/// Serialized metadata for one stacked effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectMeta {
    /// Effect id.
    pub id: String,
    /// Effect type tag understood by the restore factory.
    pub kind: String,
    /// Opaque factory parameters.
    pub params: Vec<u8>,
}

/// A persisted state tree: base image, effect list, bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot content version (current = 1).
    pub version: u32,
    /// Opaque serialized base state image.
    pub state: Vec<u8>,
    /// Stacked effects in application order.
    pub effects: Vec<EffectMeta>,
    /// Capture time, unix millis.
    pub timestamp_ms: i64,
    /// Opaque extra blob for application bookkeeping.
    pub extra: Vec<u8>,
}

/// One effect the restore factory could not rebuild. Non-fatal: the
/// state restores without it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectRestoreFailure {
    /// Metadata of the failed effect.
    pub meta: EffectMeta,
    /// Factory-reported reason.
    pub reason: String,
}

/// Writes a snapshot atomically: `path + ".tmp"`, then rename.
///
/// # Errors
/// [`SnapshotError::Io`] / [`SnapshotError::Encode`].
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    let mut payload = Vec::new();
    ciborium::into_writer(snapshot, &mut payload)
        .map_err(|e| SnapshotError::Encode(e.to_string()))?;

    let mut file = Vec::with_capacity(HEADER_SIZE + payload.len());
    file.extend_from_slice(&SNAPSHOT_MAGIC);
    file.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
    file.extend_from_slice(blake3::hash(&payload).as_bytes());
    file.extend_from_slice(&payload);

    let tmp = tmp_path(path);
    std::fs::write(&tmp, &file)?;
    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), bytes = file.len(), "snapshot saved");
    Ok(())
}

/// Loads a snapshot. A missing file is not an error: `Ok(None)`.
///
/// # Errors
/// Framing, checksum, and decode failures.
pub fn load(path: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    let file = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(SnapshotError::Io(err)),
    };
    if file.len() < HEADER_SIZE {
        return Err(SnapshotError::Truncated);
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&file[0..4]);
    if magic != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic(magic));
    }
    let version = u16::from_le_bytes([file[4], file[5]]);
    if version != SNAPSHOT_FORMAT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let expected = &file[6..HEADER_SIZE];
    let payload = &file[HEADER_SIZE..];
    let got = blake3::hash(payload);
    if got.as_bytes() != expected {
        return Err(SnapshotError::ChecksumMismatch {
            expected: hex::encode(expected),
            got: hex::encode(got.as_bytes()),
        });
    }
    let snapshot: Snapshot =
        ciborium::from_reader(payload).map_err(|e| SnapshotError::Decode(e.to_string()))?;
    Ok(Some(snapshot))
}

/// Rebuilds a [`TrackedState`] from a loaded snapshot.
///
/// `initializer` turns the opaque state image back into a trackable;
/// `effect_factory` rebuilds each stacked effect (returning the
/// effect and its activator). Factory failures are collected and
/// returned alongside the restored state; the corresponding effects
/// are simply absent from the stack.
///
/// # Errors
/// [`SnapshotError::Initializer`] when the state image does not
/// restore; effect failures are not errors.
pub fn restore<T, A, I, F>(
    snapshot: &Snapshot,
    registry: Arc<SchemaRegistry>,
    initializer: I,
    effect_factory: F,
) -> Result<(TrackedState<T, A>, Vec<EffectRestoreFailure>), SnapshotError>
where
    T: Trackable + Clone,
    I: FnOnce(&Snapshot) -> Result<T, String>,
    F: Fn(&EffectMeta) -> Result<(Arc<dyn Effect<T, A>>, A), String>,
{
    let initial = initializer(snapshot).map_err(SnapshotError::Initializer)?;
    let state = TrackedState::new(initial, registry);

    let mut failures = Vec::new();
    for meta in &snapshot.effects {
        match effect_factory(meta) {
            Ok((effect, activator)) => {
                if let Err(err) = state.add_effect(effect, activator) {
                    failures.push(EffectRestoreFailure {
                        meta: meta.clone(),
                        reason: err.to_string(),
                    });
                }
            }
            Err(reason) => {
                failures.push(EffectRestoreFailure {
                    meta: meta.clone(),
                    reason,
                });
            }
        }
    }
    debug!(
        effects = snapshot.effects.len(),
        failures = failures.len(),
        "snapshot restored"
    );
    Ok((state, failures))
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::path::PathBuf::from(tmp)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        Snapshot {
            version: 1,
            state: vec![1, 2, 3],
            effects: vec![EffectMeta {
                id: "boost".into(),
                kind: "score_boost".into(),
                params: vec![5],
            }],
            timestamp_ms: 1_700_000_000_000,
            extra: Vec::new(),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.vsnp");
        save(&path, &sample()).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded, sample());
        // The tmp file is gone after the rename.
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.vsnp");
        assert!(load(&path).unwrap().is_none());
    }

    #[test]
    fn corrupted_payload_fails_the_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.vsnp");
        save(&path, &sample()).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            load(&path),
            Err(SnapshotError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.vsnp");
        std::fs::write(&path, b"NOPE\x01\x00__________padding_to_header_size______").unwrap();
        assert!(matches!(load(&path), Err(SnapshotError::BadMagic(_))));
    }

    #[test]
    fn short_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.vsnp");
        std::fs::write(&path, b"VS").unwrap();
        assert!(matches!(load(&path), Err(SnapshotError::Truncated)));
    }
}
