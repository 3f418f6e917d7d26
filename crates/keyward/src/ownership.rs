//! Derived vnode ownership.

use std::collections::BTreeSet;

use crate::ring::HashRing;
use crate::vnode::VNodeId;

/// Vnodes the local node owns in the ring's current view.
///
/// Ownership is derived, never stored: a vnode is owned iff the ring
/// resolves it to `whoami()`. This samples the raw ring lookup, so deriving
/// ownership has no side effects on the key index.
pub fn owned_vnodes(ring: &dyn HashRing, total_vnodes: u32) -> BTreeSet<VNodeId> {
    let local = ring.whoami();
    (0..total_vnodes)
        .filter(|vnode| ring.node_for(*vnode) == local)
        .collect()
}
