//! Lock-free allocator for fixed-size objects
//!
//! A [FixedAlloc] serves objects of one compile-time-unknown but fixed
//! byte size. Allocations come from a lock-free LIFO freelist of reclaimed
//! objects when possible and fall back to the system heap otherwise; heap
//! memory is only returned to the system when the allocator is dropped,
//! objects circulate through the freelist in between.
//!
//! Frees are deferred: [free](FixedAlloc::free) parks the object in the
//! calling slot's purgatory, and the pinbox's scan-and-reclaim pass pushes
//! it onto the freelist once no thread pins it (see [crate::pins]). The
//! pop side uses pin cell 0 to protect the freelist head while reading its
//! next link, which is what makes the freelist immune to ABA without a
//! version counter.
//!
//! An object is always in exactly one of three states: owned by the
//! caller, pending in some slot's purgatory, or free on the freelist.
//! There is no direct path from caller-owned to free.

use std::{
    alloc::{self, Layout},
    mem::align_of,
    ptr::{self, NonNull},
    sync::atomic::Ordering,
};

use rustc_hash::FxHashSet;
use tracing::Level;

use crate::{
    loom_testing::*,
    pins::{PinBox, Pins, ReclaimBatch},
    util,
};

/// Lock-free LIFO freelist of reclaimed objects
///
/// This is the [ReclaimBatch] capability the allocator plugs into its
/// pinbox: the scan pass hands over whole batches, one CAS each.
pub struct ObjFreeList {
    /// Head of the freelist, null when empty
    top: AtomicPtr<u8>,
    /// Byte offset of the free link within an object
    free_ptr_offset: usize,
    /// Number of objects ever taken from the system heap (diagnostic,
    /// monotonically non-decreasing)
    mallocs: AtomicUsize,
}

impl ReclaimBatch for ObjFreeList {
    unsafe fn reclaim_batch(&self, first: *mut u8, last: *mut u8) {
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            util::store_free_link(last, self.free_ptr_offset, top);
            // order: release publishes the batch's links; a popper's
            // acquire load of top synchronizes-with this
            match self
                .top
                .compare_exchange_weak(top, first, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(t) => top = t,
            }
        }
    }
}

/// Lock-free allocator of fixed-size objects, wired to a [PinBox] for
/// safe reclamation
pub struct FixedAlloc {
    /// Heap layout of one object
    layout: Layout,
    pinbox: PinBox<ObjFreeList>,
}

impl FixedAlloc {
    /// Create an allocator for objects of `element_size` bytes whose free
    /// link lives at `free_ptr_offset`.
    ///
    /// The caller guarantees the bytes at
    /// `free_ptr_offset..free_ptr_offset + FREE_LINK_SZ` of every object
    /// are unused while the object is free or pending reclamation.
    ///
    /// Panics if the link does not fit inside the object or the offset is
    /// not pointer-aligned.
    pub fn new(element_size: usize, free_ptr_offset: usize) -> Self {
        assert!(
            free_ptr_offset + util::FREE_LINK_SZ <= element_size,
            "free link must fit inside the object"
        );
        let layout = Layout::from_size_align(element_size, align_of::<*mut u8>()).unwrap();
        Self {
            layout,
            // PinBox::new checks the offset alignment
            pinbox: PinBox::new(
                free_ptr_offset,
                ObjFreeList {
                    top: AtomicPtr::new(ptr::null_mut()),
                    free_ptr_offset,
                    mallocs: AtomicUsize::new(0),
                },
            ),
        }
    }

    /// Bytes per object
    pub fn element_size(&self) -> usize {
        self.layout.size()
    }

    /// Acquire a pin slot for the calling thread.
    ///
    /// `None` once 65535 slots are live concurrently or the heap refuses
    /// to grow the slot array.
    pub fn pin_slot(&self) -> Option<Pins<'_, ObjFreeList>> {
        self.pinbox.acquire()
    }

    /// The pin registry backing this allocator
    pub fn pinbox(&self) -> &PinBox<ObjFreeList> {
        &self.pinbox
    }

    /// Allocate one object.
    ///
    /// Pops the freelist if possible, protected by a transient pin in
    /// cell 0 of `pins` (the cell is null again on return). Falls back to
    /// the system heap when the freelist is empty; `None` means the heap
    /// itself is exhausted and the caller should back off and retry.
    ///
    /// The returned bytes are unspecified; recycled objects come back
    /// with whatever the previous owner left in them.
    pub fn alloc(&self, pins: &Pins<'_, ObjFreeList>) -> Option<NonNull<u8>> {
        let tracing_span = tracing::span!(Level::TRACE, "fixed_alloc::alloc", slot = pins.slot_index());
        let _span_enter = tracing_span.enter();

        let fl = self.pinbox.reclaimer();
        let offset = self.pinbox.free_ptr_offset();

        let node = loop {
            // order: acquire pairs with the release CAS that published the
            // node's free link
            let top = fl.top.load(Ordering::Acquire);
            if top.is_null() {
                break top;
            }
            pins.pin(0, top);
            // hazard re-read: only if the head is unchanged is our pin
            // guaranteed to have been set before any scan could free top
            if fl.top.load(Ordering::SeqCst) != top {
                continue;
            }
            let next = unsafe { util::load_free_link(top, offset) };
            // order: SeqCst puts the pop in the same total order as the
            // pin stores and the scanner's harvest loads; with anything
            // weaker, a re-read elsewhere could still observe the
            // pre-pop head and CAS a stale next link into place
            if fl
                .top
                .compare_exchange_weak(top, next, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                break top;
            }
        };
        pins.unpin(0);

        if node.is_null() {
            // freelist empty: take a fresh object from the heap
            let obj = unsafe { alloc::alloc(self.layout) };
            if obj.is_null() {
                return None;
            }
            fl.mallocs.fetch_add(1, Ordering::Relaxed);
            tracing::event!(Level::TRACE, ptr = ?(obj as *const ()), from_heap = true);
            NonNull::new(obj)
        } else {
            tracing::event!(Level::TRACE, ptr = ?(node as *const ()), from_heap = false);
            NonNull::new(node)
        }
    }

    /// Free one object, through the purgatory of `pins`.
    ///
    /// The object is guaranteed not to be handed out again until every
    /// thread has dropped its pins on it; *when* it becomes reusable is
    /// unspecified.
    ///
    /// Safety: `obj` must have come from [alloc](Self::alloc) on this
    /// allocator, must not be freed twice, and no references to it may be
    /// used after this call (pinned readers excepted, per the protocol).
    pub unsafe fn free(&self, pins: &Pins<'_, ObjFreeList>, obj: NonNull<u8>) {
        let tracing_span = tracing::span!(Level::TRACE, "fixed_alloc::free", slot = pins.slot_index());
        let _span_enter = tracing_span.enter();
        tracing::event!(Level::TRACE, ptr = ?(obj.as_ptr() as *const ()));

        pins.defer_free(obj.as_ptr());
    }

    /// Objects ever taken from the system heap (diagnostic)
    pub fn mallocs(&self) -> usize {
        self.pinbox.reclaimer().mallocs.load(Ordering::Relaxed)
    }

    /// Number of objects currently on the freelist.
    ///
    /// Safety: diagnostic only; the walk is not protected against
    /// concurrent allocation, so no other thread may be calling
    /// [alloc](Self::alloc) or triggering reclaim passes meanwhile.
    pub unsafe fn count(&self) -> usize {
        let fl = self.pinbox.reclaimer();
        let offset = self.pinbox.free_ptr_offset();
        let mut n = 0;
        let mut cur = fl.top.load(Ordering::Acquire);
        while !cur.is_null() {
            n += 1;
            cur = util::load_free_link(cur, offset);
        }
        n
    }

    /// Walk the freelist checking that no object appears twice.
    ///
    /// Returns the freelist length. Safety: as [count](Self::count).
    pub unsafe fn _debug_check_freelist(&self) -> usize {
        let fl = self.pinbox.reclaimer();
        let offset = self.pinbox.free_ptr_offset();
        let mut seen = FxHashSet::default();
        let mut cur = fl.top.load(Ordering::Acquire);
        while !cur.is_null() {
            assert!(
                seen.insert(cur as usize),
                "object {:?} is on the freelist twice",
                cur as *const ()
            );
            cur = util::load_free_link(cur, offset);
        }
        seen.len()
    }
}

impl Drop for FixedAlloc {
    fn drop(&mut self) {
        // &mut self: every Pins guard is gone, so all purgatories have
        // drained into the freelist; anything still caller-owned is the
        // caller's leak
        let fl = self.pinbox.reclaimer();
        let offset = self.pinbox.free_ptr_offset();
        let mut cur = fl.top.load(Ordering::Relaxed);
        while !cur.is_null() {
            unsafe {
                let next = util::load_free_link(cur, offset);
                alloc::dealloc(cur, self.layout);
                cur = next;
            }
        }
    }
}
