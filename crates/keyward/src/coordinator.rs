//! Coordinator construction, the routed-lookup decorator, and the public API.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::IndexCache;
use crate::index::KeyIndex;
use crate::reconciler::{self, KeyHandler};
use crate::ring::{HashRing, NodeId};
use crate::vnode::{vnode_for_key, VNodeId, DEFAULT_TOTAL_VNODES};

/// Coordinator tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct CoordinatorConfig {
    /// Partitions of the key space. Must match every peer sharing the
    /// persisted index and must never change against existing state.
    pub total_vnodes: u32,
    /// Debounce window coalescing ring-change bursts into one pass.
    pub calm_threshold: Duration,
    /// Fan-out cap across vnodes and keys, and on host callbacks in flight.
    pub max_parallel_tasks: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            total_vnodes: DEFAULT_TOTAL_VNODES,
            calm_threshold: Duration::from_millis(500),
            max_parallel_tasks: 10,
        }
    }
}

/// Shared state behind the coordinator and its reconciler task.
pub(crate) struct CoordinatorState {
    pub(crate) ring: Arc<dyn HashRing>,
    pub(crate) cache: IndexCache,
    pub(crate) handler: Arc<dyn KeyHandler>,
    pub(crate) config: CoordinatorConfig,
    /// Result of the most recently completed reconciliation, not the
    /// instantaneous ring view.
    pub(crate) owned: RwLock<BTreeSet<VNodeId>>,
    pub(crate) reconcile_passes: AtomicU64,
}

/// Introspection snapshot of a coordinator.
#[derive(Clone, Debug, Serialize)]
pub struct CoordinatorStatus {
    pub node_id: NodeId,
    pub total_vnodes: u32,
    pub owned_vnodes: Vec<VNodeId>,
    pub cached_vnodes: Vec<VNodeId>,
    pub reconcile_passes: u64,
}

/// Durable-key ownership coordinator.
///
/// Routes keys through the ring while recording locally-owned keys into the
/// per-vnode index, and reconciles ownership in the background when ring
/// membership changes. Construct with [`Coordinator::new`] inside a tokio
/// runtime; the reconciler task runs until [`Coordinator::shutdown`] or
/// until the coordinator is dropped.
pub struct Coordinator {
    state: Arc<CoordinatorState>,
    shutdown_tx: watch::Sender<bool>,
    reconciler: JoinHandle<()>,
}

impl Coordinator {
    /// Validate `config` and start coordinating over `ring`, persisting key
    /// associations in `index` and driving `handler` on ownership changes.
    pub fn new(
        ring: Arc<dyn HashRing>,
        index: Arc<dyn KeyIndex>,
        handler: Arc<dyn KeyHandler>,
        config: CoordinatorConfig,
    ) -> anyhow::Result<Self> {
        if config.total_vnodes == 0 {
            anyhow::bail!("total_vnodes must be at least 1");
        }
        if config.max_parallel_tasks == 0 {
            anyhow::bail!("max_parallel_tasks must be at least 1");
        }

        let state = Arc::new(CoordinatorState {
            ring,
            cache: IndexCache::new(index),
            handler,
            config,
            owned: RwLock::new(BTreeSet::new()),
            reconcile_passes: AtomicU64::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = reconciler::spawn(state.clone(), shutdown_rx);

        Ok(Self {
            state,
            shutdown_tx,
            reconciler,
        })
    }

    /// Vnode that `key` maps to under this coordinator's partition count.
    pub fn vnode_for_key(&self, key: &[u8]) -> VNodeId {
        vnode_for_key(key, self.state.config.total_vnodes)
    }

    /// Resolve the node responsible for `key`.
    ///
    /// This is the decorated ring lookup: when the resolved node is the
    /// local one, the `(vnode, key)` association is persisted in the
    /// background so a future owner can recover the key. The caller never
    /// waits on that write; persistence failures are logged and repaired by
    /// the next lookup of the same key.
    pub fn lookup(&self, key: &[u8]) -> NodeId {
        let vnode = self.vnode_for_key(key);
        let node = self.state.ring.node_for(vnode);
        if node == self.state.ring.whoami() {
            let state = self.state.clone();
            let key = key.to_vec();
            tokio::spawn(async move {
                if let Err(err) = state.cache.add_key(vnode, &key).await {
                    tracing::warn!(
                        vnode,
                        key = %String::from_utf8_lossy(&key),
                        error = ?err,
                        "failed to persist routed key"
                    );
                }
            });
        }
        node
    }

    /// Drop `key` from its vnode's index once the host has finished the
    /// work bound to it. Idempotent; surfaces the store error.
    pub async fn work_complete_on_key(&self, key: &[u8]) -> anyhow::Result<()> {
        let vnode = self.vnode_for_key(key);
        self.state.cache.remove_key(vnode, key).await
    }

    /// Owned vnodes as of the last completed reconciliation.
    pub fn owned_vnodes(&self) -> BTreeSet<VNodeId> {
        self.state.owned.read().unwrap().clone()
    }

    /// Point-in-time snapshot for logs and admin surfaces.
    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            node_id: self.state.ring.whoami(),
            total_vnodes: self.state.config.total_vnodes,
            owned_vnodes: self.owned_vnodes().into_iter().collect(),
            cached_vnodes: self.state.cache.cached_vnodes(),
            reconcile_passes: self.state.reconcile_passes.load(Ordering::Relaxed),
        }
    }

    /// `status()` rendered as JSON.
    pub fn status_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(&self.status())?)
    }

    /// Stop the reconciler task and wait for it to exit.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.reconciler
            .await
            .map_err(|err| anyhow::anyhow!("reconciler task join failed: {err}"))
    }
}
