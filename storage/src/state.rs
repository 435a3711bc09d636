//! Durable state blobs
//!
//! Versioned, checksummed serialization of the VFS plus the environment
//! map. Byte layout:
//!
//! ```text
//! offset 0..3   magic  = b"WBOX"
//! offset 4..7   version, little-endian u32 (>= 1)
//! offset 8..11  (v2+) CRC32 of payload, little-endian u32
//! offset 12..   (v2)  /  8.. (v1)   UTF-8 JSON payload
//! ```
//!
//! Export walks the physical tree only (virtual-mount subtrees are never
//! exported, symlinks are deliberately skipped). Import filters entries
//! to a whitelist of safe path prefixes and applies them in three phases
//! under a write-policy bypass: directories depth-first, then file
//! contents, then permissions. A checksum mismatch aborts before any
//! mutation.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::inode::InodeContent;
use crate::vfs::Vfs;

/// Four-byte ASCII tag identifying a wasmbox state blob.
pub const STATE_MAGIC: [u8; 4] = *b"WBOX";

/// Current blob version. Version 1 blobs (no checksum) are still read.
pub const STATE_VERSION: u32 = 2;

/// Path prefixes that survive an import; everything else is silently
/// dropped.
pub const SAFE_PREFIXES: &[&str] = &["/home", "/tmp", "/opt/packages", "/usr/lib/python"];

/// Errors raised while decoding a state blob.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("CorruptedState: blob shorter than its header")]
    Truncated,
    #[error("CorruptedState: bad magic")]
    BadMagic,
    #[error("CorruptedState: unsupported version {0}")]
    UnsupportedVersion(u32),
    #[error("CorruptedState: payload checksum mismatch")]
    ChecksumMismatch,
    #[error("CorruptedState: malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct StatePayload {
    entries: Vec<StateEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    env: Vec<(String, String)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    data: String,
    permissions: u32,
}

fn under_safe_prefix(path: &str) -> bool {
    SAFE_PREFIXES
        .iter()
        .any(|p| path == *p || path.starts_with(&format!("{p}/")))
}

/// Serialize the VFS and environment into a versioned blob.
pub fn export_state(vfs: &Vfs, env: &BTreeMap<String, String>) -> Vec<u8> {
    let mut entries = Vec::new();
    vfs.visit(|path, node| {
        if path == "/" {
            return;
        }
        match &node.content {
            InodeContent::File(data) => entries.push(StateEntry {
                path: path.to_string(),
                kind: String::from("file"),
                data: BASE64.encode(data.as_slice()),
                permissions: node.meta.permissions,
            }),
            InodeContent::Directory(_) => entries.push(StateEntry {
                path: path.to_string(),
                kind: String::from("dir"),
                data: String::new(),
                permissions: node.meta.permissions,
            }),
            // Symlinks are not persisted.
            InodeContent::Symlink(_) => {}
        }
    });

    let payload = StatePayload {
        entries,
        env: env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    };
    let json = serde_json::to_vec(&payload).expect("state payload serializes");

    let mut blob = Vec::with_capacity(json.len() + 12);
    blob.extend_from_slice(&STATE_MAGIC);
    blob.extend_from_slice(&STATE_VERSION.to_le_bytes());
    blob.extend_from_slice(&crc32fast::hash(&json).to_le_bytes());
    blob.extend_from_slice(&json);
    blob
}

/// Decode a blob and apply it to `vfs`. Returns the environment map from
/// the payload. Validation happens entirely before the first mutation.
pub fn import_state(vfs: &mut Vfs, blob: &[u8]) -> Result<BTreeMap<String, String>, StateError> {
    if blob.len() < 8 {
        return Err(StateError::Truncated);
    }
    if blob[0..4] != STATE_MAGIC {
        return Err(StateError::BadMagic);
    }
    let version = u32::from_le_bytes(blob[4..8].try_into().expect("4 bytes"));
    if version < 1 {
        return Err(StateError::UnsupportedVersion(version));
    }

    let payload = if version >= 2 {
        if blob.len() < 12 {
            return Err(StateError::Truncated);
        }
        let stored = u32::from_le_bytes(blob[8..12].try_into().expect("4 bytes"));
        let payload = &blob[12..];
        if crc32fast::hash(payload) != stored {
            return Err(StateError::ChecksumMismatch);
        }
        payload
    } else {
        &blob[8..]
    };

    let parsed: StatePayload = serde_json::from_slice(payload)?;

    let mut kept: Vec<StateEntry> = Vec::new();
    let mut dropped = 0usize;
    for entry in parsed.entries {
        if under_safe_prefix(&entry.path) {
            kept.push(entry);
        } else {
            dropped += 1;
        }
    }
    if dropped > 0 {
        log::debug!("state import dropped {dropped} entries outside safe prefixes");
    }

    vfs.with_bypass(|vfs| {
        // Phase 1: directories, shallowest first.
        let mut dirs: Vec<&StateEntry> = kept.iter().filter(|e| e.kind == "dir").collect();
        dirs.sort_by_key(|e| e.path.matches('/').count());
        for entry in dirs {
            let _ = vfs.mkdirp(&entry.path);
        }

        // Phase 2: file contents (parents may only exist in the blob
        // implicitly, so create them as needed).
        for entry in kept.iter().filter(|e| e.kind == "file") {
            if let Some(idx) = entry.path.rfind('/') {
                if idx > 0 {
                    let _ = vfs.mkdirp(&entry.path[..idx]);
                }
            }
            let data = BASE64.decode(&entry.data).unwrap_or_default();
            if let Err(e) = vfs.write_file(&entry.path, &data) {
                log::warn!("state import skipped {}: {e}", entry.path);
            }
        }

        // Phase 3: permissions.
        for entry in &kept {
            let _ = vfs.set_permissions(&entry.path, entry.permissions);
        }
    });

    Ok(parsed.env.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_vfs() -> (Vfs, BTreeMap<String, String>) {
        let mut vfs = Vfs::new();
        vfs.with_bypass(|v| {
            v.mkdirp("/home/user").unwrap();
            v.mkdirp("/tmp").unwrap();
            v.mkdirp("/etc").unwrap();
            v.write_file("/home/user/a.txt", b"abc").unwrap();
            v.write_file("/etc/secret", b"root-only").unwrap();
            v.set_permissions("/home/user/a.txt", 0o600).unwrap();
            v.symlink("/home/user/a.txt", "/home/user/link").unwrap();
        });
        let mut env = BTreeMap::new();
        env.insert(String::from("HOME"), String::from("/home/user"));
        env.insert(String::from("PATH"), String::from("/bin"));
        (vfs, env)
    }

    #[test]
    fn test_header_layout() {
        let (vfs, env) = seeded_vfs();
        let blob = export_state(&vfs, &env);
        assert_eq!(&blob[0..4], b"WBOX");
        assert_eq!(u32::from_le_bytes(blob[4..8].try_into().unwrap()), STATE_VERSION);
        let crc = u32::from_le_bytes(blob[8..12].try_into().unwrap());
        assert_eq!(crc, crc32fast::hash(&blob[12..]));
    }

    #[test]
    fn test_round_trip_preserves_bytes_and_permissions() {
        let (vfs, env) = seeded_vfs();
        let blob = export_state(&vfs, &env);

        let mut fresh = Vfs::new();
        let imported_env = import_state(&mut fresh, &blob).unwrap();
        assert_eq!(fresh.read_file("/home/user/a.txt").unwrap(), b"abc");
        assert_eq!(fresh.stat("/home/user/a.txt").unwrap().permissions, 0o600);
        assert_eq!(imported_env.get("HOME").unwrap(), "/home/user");
        assert_eq!(imported_env.len(), 2);
    }

    #[test]
    fn test_unsafe_prefixes_are_dropped() {
        let (vfs, env) = seeded_vfs();
        let blob = export_state(&vfs, &env);
        let mut fresh = Vfs::new();
        import_state(&mut fresh, &blob).unwrap();
        assert!(!fresh.exists("/etc/secret"));
    }

    #[test]
    fn test_symlinks_are_not_exported() {
        let (vfs, env) = seeded_vfs();
        let blob = export_state(&vfs, &env);
        let mut fresh = Vfs::new();
        import_state(&mut fresh, &blob).unwrap();
        assert!(!fresh.exists("/home/user/link"));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let (vfs, env) = seeded_vfs();
        let mut blob = export_state(&vfs, &env);
        blob[0] = b'X';
        let mut fresh = Vfs::new();
        assert!(matches!(
            import_state(&mut fresh, &blob),
            Err(StateError::BadMagic)
        ));
    }

    #[test]
    fn test_corruption_detected_without_mutation() {
        let (vfs, env) = seeded_vfs();
        let mut blob = export_state(&vfs, &env);
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;

        let mut fresh = Vfs::new();
        let before = fresh.entry_count();
        assert!(matches!(
            import_state(&mut fresh, &blob),
            Err(StateError::ChecksumMismatch)
        ));
        assert_eq!(fresh.entry_count(), before);
    }

    #[test]
    fn test_version_1_blob_without_checksum() {
        let (vfs, env) = seeded_vfs();
        let v2 = export_state(&vfs, &env);
        // Rebuild as v1: header without CRC word, same payload.
        let mut v1 = Vec::new();
        v1.extend_from_slice(&STATE_MAGIC);
        v1.extend_from_slice(&1u32.to_le_bytes());
        v1.extend_from_slice(&v2[12..]);

        let mut fresh = Vfs::new();
        import_state(&mut fresh, &v1).unwrap();
        assert_eq!(fresh.read_file("/home/user/a.txt").unwrap(), b"abc");
    }

    #[test]
    fn test_reexport_is_stable() {
        let (vfs, env) = seeded_vfs();
        let blob = export_state(&vfs, &env);
        let mut fresh = Vfs::new();
        let env2 = import_state(&mut fresh, &blob).unwrap();
        let blob2 = export_state(&fresh, &env2);

        // Payload JSON compares equal once both sides are filtered to the
        // safe prefixes, so a second import yields the same tree.
        let mut third = Vfs::new();
        import_state(&mut third, &blob2).unwrap();
        assert_eq!(third.read_file("/home/user/a.txt").unwrap(), b"abc");
        assert_eq!(third.stat("/home/user/a.txt").unwrap().permissions, 0o600);
    }

    #[test]
    fn test_truncated_blob() {
        let mut fresh = Vfs::new();
        assert!(matches!(
            import_state(&mut fresh, b"WBO"),
            Err(StateError::Truncated)
        ));
    }
}
