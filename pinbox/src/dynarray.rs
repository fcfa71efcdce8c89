//! Lock-free grow-only indexed array
//!
//! Maps a `u32` index to a stable element address, materializing backing
//! storage lazily. The backing store is a fixed-fanout radix tree: an inline
//! root of atomic pointers to *mid* pages, mid pages of atomic pointers to
//! *leaf* pages, and leaves holding [PAGE_LEN] elements each. Directory and
//! leaf pages are published with a CAS from null; the losing thread throws
//! its page away and adopts the winner's, so the address returned for any
//! index is the same address forever. Pages are never freed or moved until
//! the whole array is dropped.
//!
//! This is the substrate the pin registry hands out pin slots from: a slot
//! reference must stay valid for the life of the registry even while other
//! threads keep growing the array, which rules out anything `Vec`-like.
//! Index 0 is a valid index at this layer; the registry above reserves it
//! to mean "none".

use std::{
    alloc::{self, Layout},
    cmp,
    mem::needs_drop,
    ptr::{self, addr_of_mut},
    sync::atomic::Ordering,
};

use tracing::Level;

use crate::loom_testing::*;

/// Elements per leaf page (and pointers per directory page); power of two
pub const PAGE_LEN: usize = 256;
/// Number of root directory entries
const ROOT_LEN: usize = 64;
/// Elements spanned by one mid page worth of leaves
const MID_SPAN: usize = PAGE_LEN * PAGE_LEN;
/// Total addressable elements
pub const CAPACITY: u32 = (ROOT_LEN * MID_SPAN) as u32;

/// Directory page: pointers to leaves, all null until materialized
#[repr(C)]
struct MidPage<T> {
    leaves: [AtomicPtr<LeafPage<T>>; PAGE_LEN],
}

/// Leaf page: actual element storage
#[repr(C)]
struct LeafPage<T> {
    elems: [T; PAGE_LEN],
}

/// Lock-free grow-only array of `T` with stable element addresses
///
/// Elements are created with `T::default()` when their leaf page is first
/// materialized, so a freshly-grown element is always in a well-defined
/// "empty" state regardless of which thread wins the publication race.
pub struct LfDynArray<T: Default> {
    root: [AtomicPtr<MidPage<T>>; ROOT_LEN],
}

// safety: raw page pointers are only ever handed out as &T, and all
// directory mutation goes through atomics
unsafe impl<T: Default + Send> Send for LfDynArray<T> {}
unsafe impl<T: Default + Send + Sync> Sync for LfDynArray<T> {}

#[inline]
fn split(i: u32) -> Option<(usize, usize, usize)> {
    if i >= CAPACITY {
        return None;
    }
    let i = i as usize;
    Some((i / MID_SPAN, (i / PAGE_LEN) % PAGE_LEN, i % PAGE_LEN))
}

impl<T: Default> LfDynArray<T> {
    pub fn new() -> Self {
        Self {
            root: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Look up element `i` without growing.
    ///
    /// Returns `None` if `i` is out of range or its leaf has not been
    /// materialized yet. Never allocates.
    pub fn get(&self, i: u32) -> Option<&T> {
        let (r, m, l) = split(i)?;
        // order: acquire pairs with the release CAS publishing the page,
        // so the page contents (incl. default-initialized elements) are
        // visible before we dereference
        let mid = self.root[r].load(Ordering::Acquire);
        if mid.is_null() {
            return None;
        }
        let leaf = unsafe { (*mid).leaves[m].load(Ordering::Acquire) };
        if leaf.is_null() {
            return None;
        }
        Some(unsafe { &(*leaf).elems[l] })
    }

    /// Look up element `i`, materializing directory and leaf pages as
    /// needed.
    ///
    /// Returns `None` only if `i` is out of range or the heap refuses to
    /// grow the backing store; callers must treat that as back-pressure.
    /// Once this has returned `Some` for an index, every later `ensure`
    /// and [get](Self::get) for the same index returns the same address.
    pub fn ensure(&self, i: u32) -> Option<&T> {
        let (r, m, l) = split(i)?;

        let mut mid = self.root[r].load(Ordering::Acquire);
        if mid.is_null() {
            mid = self.publish_mid(r)?;
        }

        let leaf_slot = unsafe { &(*mid).leaves[m] };
        let mut leaf = leaf_slot.load(Ordering::Acquire);
        if leaf.is_null() {
            leaf = self.publish_leaf(leaf_slot)?;
        }

        Some(unsafe { &(*leaf).elems[l] })
    }

    /// Invoke `f` once per materialized leaf, in index order, visiting at
    /// most `limit` element positions in total.
    ///
    /// Unmaterialized pages are skipped but still count toward `limit`,
    /// so the slice passed for a leaf always starts at that leaf's first
    /// index. Elements growing in concurrently may or may not be seen;
    /// a leaf that was published before the call began always is.
    pub fn for_each_leaf(&self, limit: u32, mut f: impl FnMut(&[T])) {
        let mut remaining = cmp::min(limit, CAPACITY) as usize;
        for r in 0..ROOT_LEN {
            if remaining == 0 {
                return;
            }
            let mid = self.root[r].load(Ordering::Acquire);
            if mid.is_null() {
                remaining = remaining.saturating_sub(MID_SPAN);
                continue;
            }
            for m in 0..PAGE_LEN {
                if remaining == 0 {
                    return;
                }
                let leaf = unsafe { (*mid).leaves[m].load(Ordering::Acquire) };
                if leaf.is_null() {
                    remaining = remaining.saturating_sub(PAGE_LEN);
                    continue;
                }
                let n = cmp::min(PAGE_LEN, remaining);
                f(unsafe { &(&(*leaf).elems)[..n] });
                remaining -= n;
            }
        }
    }

    /// Allocate and publish the mid page for root entry `r`, or adopt the
    /// winner's if we lose the race.
    fn publish_mid(&self, r: usize) -> Option<*mut MidPage<T>> {
        let layout = Layout::new::<MidPage<T>>();
        let page = unsafe { alloc::alloc(layout) } as *mut MidPage<T>;
        if page.is_null() {
            return None;
        }
        unsafe {
            for m in 0..PAGE_LEN {
                ptr::write(
                    addr_of_mut!((*page).leaves[m]),
                    AtomicPtr::new(ptr::null_mut()),
                );
            }
        }
        // order: release publishes the initialized directory entries;
        // acquire on failure pairs with the winner's release
        match self.root[r].compare_exchange(
            ptr::null_mut(),
            page,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::event!(Level::TRACE, r, page = ?(page as *const ()));
                Some(page)
            }
            Err(winner) => {
                unsafe { alloc::dealloc(page as *mut u8, layout) };
                Some(winner)
            }
        }
    }

    /// Allocate and publish a leaf page into `slot`, or adopt the winner's.
    fn publish_leaf(&self, slot: &AtomicPtr<LeafPage<T>>) -> Option<*mut LeafPage<T>> {
        let layout = Layout::new::<LeafPage<T>>();
        let page = unsafe { alloc::alloc(layout) } as *mut LeafPage<T>;
        if page.is_null() {
            return None;
        }
        unsafe {
            for l in 0..PAGE_LEN {
                ptr::write(addr_of_mut!((*page).elems[l]), T::default());
            }
        }
        match slot.compare_exchange(
            ptr::null_mut(),
            page,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::event!(Level::TRACE, page = ?(page as *const ()));
                Some(page)
            }
            Err(winner) => {
                unsafe {
                    if needs_drop::<T>() {
                        for l in 0..PAGE_LEN {
                            ptr::drop_in_place(addr_of_mut!((*page).elems[l]));
                        }
                    }
                    alloc::dealloc(page as *mut u8, layout);
                }
                Some(winner)
            }
        }
    }
}

impl<T: Default> Drop for LfDynArray<T> {
    fn drop(&mut self) {
        // &mut self: no other thread can be touching the directory
        for r in 0..ROOT_LEN {
            let mid = self.root[r].load(Ordering::Relaxed);
            if mid.is_null() {
                continue;
            }
            unsafe {
                for m in 0..PAGE_LEN {
                    let leaf = (*mid).leaves[m].load(Ordering::Relaxed);
                    if leaf.is_null() {
                        continue;
                    }
                    if needs_drop::<T>() {
                        for l in 0..PAGE_LEN {
                            ptr::drop_in_place(addr_of_mut!((*leaf).elems[l]));
                        }
                    }
                    alloc::dealloc(leaf as *mut u8, Layout::new::<LeafPage<T>>());
                }
                alloc::dealloc(mid as *mut u8, Layout::new::<MidPage<T>>());
            }
        }
    }
}
