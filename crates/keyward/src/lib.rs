//! Durable-key ownership coordination over a consistent-hash ring.
//!
//! Client applications route work by key; `keyward` records which keys this
//! node has seen, persists those associations in a per-vnode index, and when
//! ring membership changes drives recovery of keys on their new owner and
//! release on their former owner. Stateful per-key work (long-running jobs,
//! stream positions, timers) survives node failure and rebalancing without
//! the client re-enumerating outstanding work.
//!
//! The entry point is [`Coordinator`]: hand it a [`HashRing`], a
//! [`KeyIndex`], and a [`KeyHandler`], then route through
//! [`Coordinator::lookup`] and call [`Coordinator::work_complete_on_key`]
//! when a key's work is done.

pub mod cache;
pub mod coordinator;
pub mod index;
pub mod ownership;
pub mod reconciler;
pub mod ring;
pub mod vnode;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorStatus};
pub use index::{FjallIndex, KeyIndex, MemoryIndex};
pub use reconciler::KeyHandler;
pub use ring::{HashRing, NodeId, RingEvent, StaticRing};
pub use vnode::{vnode_for_key, VNodeId, DEFAULT_TOTAL_VNODES};
