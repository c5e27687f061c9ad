//! Per-VM network allocation.
//!
//! A configurable /16 base subnet is partitioned into /30 blocks, one per
//! slot. Slot `k` maps deterministically to host IP `base + (k<<2) + 1` and
//! guest IP `base + (k<<2) + 2`. Allocation creates a host tap device and,
//! when NAT is enabled, masquerade and forward rules against the external
//! interface. Release is idempotent against missing kernel state.

pub mod allocator;
pub mod error;

pub use allocator::{NetworkAllocator, NetworkAllocatorConfig, NetworkConfig};
pub use error::{NetError, NetResult};
