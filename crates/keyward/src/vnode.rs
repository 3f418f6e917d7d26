//! Key-to-vnode mapping.
//!
//! The key space is partitioned into a fixed number of virtual nodes; the
//! ring assigns ownership of vnodes, never of individual keys. Peers that
//! share `total_vnodes` must agree bit-for-bit on the mapping, so the hash
//! is pinned to FarmHash-32 over the raw key bytes.

/// Virtual node identifier in `[0, total_vnodes)`.
pub type VNodeId = u32;

/// Default partition count for the key space.
///
/// Must never change over the lifetime of a cluster's persisted state:
/// changing it orphans every existing vnode→key association.
pub const DEFAULT_TOTAL_VNODES: u32 = 1024;

/// Map a key to its owning vnode.
pub fn vnode_for_key(key: &[u8], total_vnodes: u32) -> VNodeId {
    farmhash::hash32(key) % total_vnodes.max(1)
}
