//! Wasmbox storage subsystem
//!
//! In-memory filesystem for the sandbox: a typed inode tree, a VFS layer
//! with quotas, write policy and copy-on-write snapshots, virtual mount
//! providers for synthetic subtrees (`/dev`, `/proc`, host directories),
//! glob resolution, and the versioned state-blob format used for
//! export/import of a sandbox.
//!
//! All data lives on the heap; there is no disk backend. The only escape
//! hatch to the host filesystem is [`provider::HostDirProvider`], which
//! path-traversal-checks every access against its declared root.

pub mod glob;
pub mod inode;
pub mod provider;
pub mod state;
pub mod vfs;

pub use inode::{Inode, InodeContent, Metadata, NodeKind};
pub use provider::{DeviceProvider, HostDirProvider, ProcInfoProvider, VirtualProvider};
pub use state::{export_state, import_state, StateError, STATE_MAGIC, STATE_VERSION};
pub use vfs::{DirEntry, FileStat, SharedVfs, SnapshotId, Vfs, VfsError, MAX_SYMLINK_DEPTH};
