//! In-memory shadow of the persisted key index.
//!
//! `IndexCache` serves reads from memory once a vnode's key set has been
//! loaded, writes through to the backing store, and can drop a vnode's
//! residency when this node stops owning it. Operations on the same vnode
//! serialize on that vnode's slot; operations on different vnodes are
//! independent.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use crate::index::KeyIndex;
use crate::vnode::VNodeId;

#[derive(Default)]
struct CacheSlot {
    /// Whether the persisted set has been folded into `keys`.
    loaded: bool,
    keys: BTreeSet<Vec<u8>>,
}

/// Read-through, write-through cache over a [`KeyIndex`].
pub struct IndexCache {
    index: Arc<dyn KeyIndex>,
    slots: RwLock<HashMap<VNodeId, Arc<Mutex<CacheSlot>>>>,
}

impl IndexCache {
    pub fn new(index: Arc<dyn KeyIndex>) -> Self {
        Self {
            index,
            slots: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, vnode: VNodeId) -> Arc<Mutex<CacheSlot>> {
        if let Some(slot) = self.slots.read().unwrap().get(&vnode) {
            return slot.clone();
        }
        self.slots
            .write()
            .unwrap()
            .entry(vnode)
            .or_default()
            .clone()
    }

    /// Current key set for `vnode`, reading through to the store on first
    /// access. Mutations recorded before the first load are preserved.
    pub async fn load_keys(&self, vnode: VNodeId) -> anyhow::Result<BTreeSet<Vec<u8>>> {
        let slot = self.slot(vnode);
        let mut slot = slot.lock().await;
        if !slot.loaded {
            let persisted = self.index.load_keys(vnode).await?;
            slot.keys.extend(persisted);
            slot.loaded = true;
        }
        Ok(slot.keys.clone())
    }

    /// Add `key` to the vnode's set, persisting first. The cache reflects
    /// the key only once the store acknowledged the write.
    pub async fn add_key(&self, vnode: VNodeId, key: &[u8]) -> anyhow::Result<()> {
        let slot = self.slot(vnode);
        let mut slot = slot.lock().await;
        if slot.keys.contains(key) {
            return Ok(());
        }
        self.index.add_key(vnode, key).await?;
        slot.keys.insert(key.to_vec());
        Ok(())
    }

    /// Remove `key` from the vnode's set and the store. Idempotent on keys
    /// that are already absent.
    pub async fn remove_key(&self, vnode: VNodeId, key: &[u8]) -> anyhow::Result<()> {
        let slot = self.slot(vnode);
        let mut slot = slot.lock().await;
        self.index.remove_key(vnode, key).await?;
        slot.keys.remove(key);
        Ok(())
    }

    /// Drop the in-memory entry for `vnode` without touching persistence.
    pub fn release_from_cache(&self, vnode: VNodeId) {
        self.slots.write().unwrap().remove(&vnode);
    }

    /// Vnodes currently resident in memory, sorted.
    pub fn cached_vnodes(&self) -> Vec<VNodeId> {
        let mut out: Vec<VNodeId> = self.slots.read().unwrap().keys().copied().collect();
        out.sort_unstable();
        out
    }
}
