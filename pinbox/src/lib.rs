//! Lock-free pin-based allocator for fixed-size objects
//!
//! This crate provides safe memory reclamation for the building blocks of
//! lock-free data structures (hash buckets, skip list towers, queue nodes)
//! without taking any mutex on the fast path. Readers *pin* the objects they
//! are traversing by publishing the address in a per-thread hazard cell;
//! writers that free an object park it in their thread-local *purgatory*
//! until a scan proves that no thread still pins it, at which point the
//! object goes back onto a lock-free freelist for reuse.
//!
//! The design follows the classic hazard-pointer scheme (Michael 2004):
//! pinning an address is a plain store, so readers pay no CAS; the ABA
//! problem on the object freelist is defeated by the pin protocol itself,
//! and on the pin-slot freelist by a 16-bit version packed next to the
//! 16-bit slot index.
//!
//! Three layers, bottom up:
//! * [dynarray]: a grow-only array with stable element addresses,
//!   used to hand out pin slots that live for the life of the registry
//! * [pins]: the pin registry ("pinbox"), i.e. per-thread pin slots,
//!   purgatory, and the scan-and-reclaim pass
//! * [fixed_alloc]: the fixed-size object allocator layered on top

mod loom_testing;
mod util;

pub mod dynarray;
pub mod fixed_alloc;
pub mod pins;

pub use fixed_alloc::FixedAlloc;
pub use pins::{PinBox, Pins, ReclaimBatch, PIN_CELLS};
