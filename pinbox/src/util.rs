//! Access to the free link embedded inside managed objects
//!
//! Every object handled by the pinbox reserves `size_of::<*mut u8>()` bytes
//! of its payload, at a caller-chosen offset, for a "next" pointer that is
//! only touched while the object is free or sitting in a purgatory. The same
//! field serves as the purgatory link and as the freelist link, depending on
//! which list the object is currently on.
//!
//! The field is accessed through an [AtomicPtr] overlaid on the payload
//! bytes. All list publication happens through release CASes on the list
//! *heads*, so relaxed operations on the field itself are sufficient.

use std::{mem::size_of, ptr, sync::atomic::Ordering};

use crate::loom_testing::*;

/// Bytes an object must reserve at its free link offset
pub const FREE_LINK_SZ: usize = size_of::<*mut u8>();

#[inline]
unsafe fn link_ptr(obj: *mut u8, offset: usize) -> *mut AtomicPtr<u8> {
    obj.add(offset) as *mut AtomicPtr<u8>
}

/// (Re)initialize the free link field of `obj` to null.
///
/// Must be called before the first [store_free_link] after the object
/// leaves the caller's ownership. This stays an atomic store: a hazard
/// reader that lost its re-read race may still be loading the field of a
/// stale head at this moment (it discards the value, but the access
/// itself happens).
///
/// Safety: `obj + offset` must be in-bounds and pointer-aligned, and no
/// non-atomic access to those bytes may be in flight.
#[cfg(not(loom))]
#[inline]
pub unsafe fn init_free_link(obj: *mut u8, offset: usize) {
    store_free_link(obj, offset, ptr::null_mut());
}

/// loom atomics carry tracking state, so here the field has to be
/// constructed in place over the payload bytes. loom cannot model the
/// stale-reader load against these bytes anyway (sigh).
#[cfg(loom)]
#[inline]
pub unsafe fn init_free_link(obj: *mut u8, offset: usize) {
    ptr::write(link_ptr(obj, offset), AtomicPtr::new(ptr::null_mut()));
}

/// Store the free link of `obj`.
///
/// Safety: as [init_free_link], which must already have run since the
/// object was last owned by the caller.
#[inline]
pub unsafe fn store_free_link(obj: *mut u8, offset: usize, next: *mut u8) {
    (*link_ptr(obj, offset)).store(next, Ordering::Relaxed);
}

/// Load the free link of `obj`.
///
/// Safety: as [store_free_link].
#[inline]
pub unsafe fn load_free_link(obj: *mut u8, offset: usize) -> *mut u8 {
    (*link_ptr(obj, offset)).load(Ordering::Relaxed)
}
