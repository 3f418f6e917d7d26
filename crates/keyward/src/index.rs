//! Durable per-vnode key index engines.
//!
//! This module provides the `KeyIndex` abstraction and two engine
//! implementations: `MemoryIndex` (in-memory, for tests and embedding) and
//! `FjallIndex` (on-disk). The index stores one logical set of keys per
//! vnode; the coordinator consults it through the cache layer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::vnode::VNodeId;

/// Durable set-of-keys per vnode.
///
/// `add_key` and `remove_key` are idempotent, and a mutation that returns
/// `Ok` must be visible to every subsequent `load_keys` for that vnode.
#[async_trait]
pub trait KeyIndex: Send + Sync + 'static {
    /// Read the full key set persisted under `vnode`.
    async fn load_keys(&self, vnode: VNodeId) -> anyhow::Result<BTreeSet<Vec<u8>>>;

    /// Durably associate `key` with `vnode`.
    async fn add_key(&self, vnode: VNodeId, key: &[u8]) -> anyhow::Result<()>;

    /// Durably remove the association of `key` with `vnode`.
    async fn remove_key(&self, vnode: VNodeId, key: &[u8]) -> anyhow::Result<()>;
}

/// Simple in-memory key index.
#[derive(Default)]
pub struct MemoryIndex {
    inner: RwLock<BTreeMap<VNodeId, BTreeSet<Vec<u8>>>>,
}

impl MemoryIndex {
    /// Create a new empty in-memory index.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyIndex for MemoryIndex {
    async fn load_keys(&self, vnode: VNodeId) -> anyhow::Result<BTreeSet<Vec<u8>>> {
        let guard = self.inner.read().unwrap();
        Ok(guard.get(&vnode).cloned().unwrap_or_default())
    }

    async fn add_key(&self, vnode: VNodeId, key: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.inner.write().unwrap();
        guard.entry(vnode).or_default().insert(key.to_vec());
        Ok(())
    }

    async fn remove_key(&self, vnode: VNodeId, key: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.inner.write().unwrap();
        if let Some(keys) = guard.get_mut(&vnode) {
            keys.remove(key);
            if keys.is_empty() {
                guard.remove(&vnode);
            }
        }
        Ok(())
    }
}

/// Fjall-backed key index.
///
/// Entries live in one partition keyed by the 4-byte big-endian vnode id
/// followed by the raw key bytes, so `load_keys` is a single prefix scan.
pub struct FjallIndex {
    keys: PartitionHandle,
}

impl FjallIndex {
    /// Open the key-index partition inside an existing keyspace.
    pub fn open(keyspace: Arc<Keyspace>) -> anyhow::Result<Self> {
        let keys = keyspace
            .open_partition("vnode_keys", PartitionCreateOptions::default())
            .context("open vnode_keys partition")?;
        Ok(Self { keys })
    }
}

#[async_trait]
impl KeyIndex for FjallIndex {
    async fn load_keys(&self, vnode: VNodeId) -> anyhow::Result<BTreeSet<Vec<u8>>> {
        let prefix = vnode.to_be_bytes();
        let mut out = BTreeSet::new();
        for item in self.keys.prefix(prefix) {
            let (entry_key, _) = item.context("scan vnode_keys partition")?;
            out.insert(entry_key[prefix.len()..].to_vec());
        }
        Ok(out)
    }

    async fn add_key(&self, vnode: VNodeId, key: &[u8]) -> anyhow::Result<()> {
        self.keys
            .insert(encode_entry_key(vnode, key), "")
            .with_context(|| format!("persist key association for vnode {vnode}"))
    }

    async fn remove_key(&self, vnode: VNodeId, key: &[u8]) -> anyhow::Result<()> {
        self.keys
            .remove(encode_entry_key(vnode, key))
            .with_context(|| format!("remove key association for vnode {vnode}"))
    }
}

/// Build the partition entry key for `(vnode, key)`.
fn encode_entry_key(vnode: VNodeId, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len());
    out.extend_from_slice(&vnode.to_be_bytes());
    out.extend_from_slice(key);
    out
}
