//! Pin registry ("pinbox"): hazard-pointer slots, purgatory, scan-and-reclaim
//!
//! A [PinBox] hands out per-thread [pin slots](PinSlot) through the RAII
//! guard [Pins]. Each slot owns a small array of *pin cells*: publishing an
//! object's address in a cell asserts "do not recycle this object". The full
//! reader protocol is pin → re-read → proceed:
//!
//! ```text
//! loop {
//!     p = load(shared);
//!     pins.pin(k, p);
//!     if load(shared) == p { break; }   // pin is now protecting p
//! }
//! ```
//!
//! If the re-read fails the reader never touches the object, which is what
//! makes it safe for a scanner to trust a null cell.
//!
//! Freeing goes through the slot's *purgatory*: a thread-local list of
//! objects whose free has been requested but not yet proven safe. Every
//! [PURGATORY_THRESHOLD]-th deferred free runs a scan-and-reclaim pass that
//! harvests every pin cell of every slot and hands the unpinned purgatory
//! entries back to the owner via the [ReclaimBatch] capability.
//!
//! Slots are carved out of a [LfDynArray] (stable addresses, never freed)
//! and recycled through a LIFO free stack whose head word packs a 16-bit
//! version next to the 16-bit top index; the version makes the pop CAS
//! immune to ABA. The object freelist built on top needs no version word
//! because the pins themselves prevent ABA there.
//!
//! Dropping a [Pins] guard drains its purgatory by re-scanning until empty,
//! yielding between attempts. A pinned purgatory entry can only become
//! reclaimable through another thread dropping its pin, so do not release a
//! slot while holding anything another thread needs to make that progress.

use std::{
    cell::{Cell, UnsafeCell},
    cmp,
    marker::PhantomData,
    mem::align_of,
    ptr,
    sync::atomic::Ordering,
};

use rustc_hash::FxHashSet;
use tracing::Level;

use crate::{dynarray::LfDynArray, loom_testing::*, util};

/// Pin cells per slot
pub const PIN_CELLS: usize = 4;
/// Deferred frees between automatic scan-and-reclaim passes
pub const PURGATORY_THRESHOLD: u32 = 10;
/// Maximum number of pin slots that can ever be live at once.
///
/// The free-stack word packs the top index into 16 bits, and index 0 is
/// reserved to mean "none".
pub const MAX_PIN_SLOTS: u32 = u16::MAX as u32;
/// Above this many harvested pointers the scan falls back to a linear
/// per-object search instead of building a sorted scratch table
const HARVEST_CAP: usize = 1 << 16;

/// Extract the top slot index from the versioned free-stack word
#[inline]
const fn top_index(word: u32) -> u32 {
    word & 0xFFFF
}

/// Build a free-stack word with `idx` on top and the version bumped.
///
/// Every push and pop goes through this, so the word never repeats within
/// 2^16 operations and a stalled CAS cannot succeed against a recycled top.
#[inline]
const fn bump_version(word: u32, idx: u32) -> u32 {
    ((word >> 16).wrapping_add(1) & 0xFFFF) << 16 | idx
}

/// Decoded form of [PinSlot::link]
///
/// The stored representation is a single u32 with the tag in bit 31, so
/// the dual use of the field costs no space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SlotLink {
    /// Slot is owned by a thread; payload is the slot's own index
    Owned(u32),
    /// Slot is on the free stack; payload is the next free slot's index
    Free(u32),
}

const LINK_OWNED_BIT: u32 = 1 << 31;

impl SlotLink {
    #[inline]
    fn encode(self) -> u32 {
        match self {
            SlotLink::Owned(idx) => idx | LINK_OWNED_BIT,
            SlotLink::Free(idx) => idx,
        }
    }

    #[inline]
    fn decode(word: u32) -> Self {
        if word & LINK_OWNED_BIT != 0 {
            SlotLink::Owned(word & !LINK_OWNED_BIT)
        } else {
            SlotLink::Free(word)
        }
    }
}

/// One per-thread pin slot
///
/// Pin cells may be read by any thread at any time; they are written only
/// by the owning thread. The purgatory fields are written and read only by
/// the owning thread. Ownership transfers only at the acquire/release
/// boundary, through the free-stack CAS.
pub struct PinSlot {
    /// Hazard cells; null means "no pin held here"
    pins: [AtomicPtr<u8>; PIN_CELLS],
    /// Encoded [SlotLink]
    link: AtomicU32,
    /// Head of this thread's deferred-free list
    purgatory_head: Cell<*mut u8>,
    /// Length of the deferred-free list
    purgatory_count: Cell<u32>,
}

impl Default for PinSlot {
    fn default() -> Self {
        Self {
            pins: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            link: AtomicU32::new(0),
            purgatory_head: Cell::new(ptr::null_mut()),
            purgatory_count: Cell::new(0),
        }
    }
}

// safety: only the thread holding the Pins guard touches the Cell fields
// and writes the pin cells; everything cross-thread goes through atomics
unsafe impl Send for PinSlot {}
unsafe impl Sync for PinSlot {}

/// Capability through which the pinbox hands reclaimed objects back to
/// their owner (normally the object allocator's freelist)
pub trait ReclaimBatch: Sync {
    /// Take back a batch of objects that no thread pins any longer.
    ///
    /// The batch is singly linked from `first` to `last` through the free
    /// link at the pinbox's `free_ptr_offset`; `last`'s link is null.
    ///
    /// Safety: called with objects previously passed to
    /// [Pins::defer_free]; the implementation becomes their owner.
    unsafe fn reclaim_batch(&self, first: *mut u8, last: *mut u8);
}

/// Registry of pin slots for one reclamation domain
pub struct PinBox<R: ReclaimBatch> {
    /// Backing store for the slots; grows, never shrinks
    slots: LfDynArray<PinSlot>,
    /// Versioned free-stack word: `{version:16, top_index:16}`, top 0 = empty
    free_top: AtomicU32,
    /// High-water mark of slot indices ever handed out
    slots_in_array: AtomicU32,
    /// Byte offset of the free link within managed objects
    free_ptr_offset: usize,
    reclaimer: R,
}

impl<R: ReclaimBatch> PinBox<R> {
    /// Create a registry whose managed objects carry their free link at
    /// `free_ptr_offset` bytes into the payload.
    ///
    /// Panics if the offset is not pointer-aligned.
    pub fn new(free_ptr_offset: usize, reclaimer: R) -> Self {
        assert!(
            free_ptr_offset % align_of::<*mut u8>() == 0,
            "free_ptr_offset must be pointer-aligned"
        );
        Self {
            slots: LfDynArray::new(),
            free_top: AtomicU32::new(0),
            slots_in_array: AtomicU32::new(0),
            free_ptr_offset,
            reclaimer,
        }
    }

    pub fn reclaimer(&self) -> &R {
        &self.reclaimer
    }

    pub fn free_ptr_offset(&self) -> usize {
        self.free_ptr_offset
    }

    /// Acquire a pin slot, owned by the caller until the guard drops.
    ///
    /// Pops the free stack if it is non-empty, otherwise materializes a
    /// fresh slot. Returns `None` once [MAX_PIN_SLOTS] slots are live
    /// concurrently, or if the backing array cannot grow.
    pub fn acquire(&self) -> Option<Pins<'_, R>> {
        let tracing_span = tracing::span!(Level::TRACE, "pins::acquire");
        let _span_enter = tracing_span.enter();

        loop {
            // order: acquire pairs with the release CAS in the guard's
            // drop, making the released slot's link store visible
            let top = self.free_top.load(Ordering::Acquire);
            let idx = top_index(top);
            if idx == 0 {
                return self.acquire_fresh();
            }
            // the slot was materialized when idx was first handed out,
            // and leaf pages are never freed
            let slot = self.slots.get(idx).unwrap();
            let next = match SlotLink::decode(slot.link.load(Ordering::Relaxed)) {
                SlotLink::Free(next) => next,
                SlotLink::Owned(_) => {
                    // another thread popped this slot between our load of
                    // free_top and our load of link; free_top has moved on
                    spin_hint();
                    continue;
                }
            };
            match self.free_top.compare_exchange_weak(
                top,
                bump_version(top, next),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    slot.link
                        .store(SlotLink::Owned(idx).encode(), Ordering::Relaxed);
                    // drained before it was pushed
                    debug_assert!(slot.purgatory_head.get().is_null());
                    debug_assert_eq!(slot.purgatory_count.get(), 0);
                    tracing::event!(Level::TRACE, idx, recycled = true);
                    return Some(Pins {
                        pinbox: self,
                        slot,
                        idx,
                        _not_sync: PhantomData,
                    });
                }
                Err(_) => spin_hint(),
            }
        }
    }

    /// Slow path of [acquire](Self::acquire): no free slot exists, so
    /// claim a fresh index and materialize it.
    fn acquire_fresh(&self) -> Option<Pins<'_, R>> {
        // index 0 means "none", so slot numbering starts at 1
        let idx = self.slots_in_array.fetch_add(1, Ordering::Relaxed) + 1;
        if idx > MAX_PIN_SLOTS {
            return None;
        }
        let slot = self.slots.ensure(idx)?;
        slot.link
            .store(SlotLink::Owned(idx).encode(), Ordering::Relaxed);
        tracing::event!(Level::TRACE, idx, recycled = false);
        Some(Pins {
            pinbox: self,
            slot,
            idx,
            _not_sync: PhantomData,
        })
    }

    /// Number of slot indices visited by a scan (high-water mark plus the
    /// reserved index 0)
    fn scan_limit(&self) -> u32 {
        cmp::min(
            self.slots_in_array.load(Ordering::Acquire),
            MAX_PIN_SLOTS,
        ) + 1
    }

    /// Collect every currently-pinned address across all slots.
    ///
    /// Debug/diagnostic only: the result is a racy snapshot.
    pub fn _debug_pinned_set(&self) -> FxHashSet<usize> {
        let mut pinned = FxHashSet::default();
        self.slots.for_each_leaf(self.scan_limit(), |slots| {
            for slot in slots {
                for cell in &slot.pins {
                    let p = cell.load(Ordering::SeqCst);
                    if !p.is_null() {
                        pinned.insert(p as usize);
                    }
                }
            }
        });
        pinned
    }
}

/// An acquired pin slot (RAII guard)
///
/// The only way to get one is [PinBox::acquire], which guarantees at most
/// one `Pins` exists per slot. Whoever holds the guard has exclusive use
/// of the slot's pin cells and purgatory; the guard may move between
/// threads but cannot be shared.
///
/// Dropping the guard drains the purgatory (spinning with a yield until
/// every entry is unpinned) and pushes the slot back on the free stack.
/// All pin cells must be null by then; a live pin at release is a
/// programming error caught by a debug assertion.
pub struct Pins<'pb, R: ReclaimBatch> {
    pinbox: &'pb PinBox<R>,
    slot: &'pb PinSlot,
    idx: u32,
    /// prevent this type from being `Sync`
    _not_sync: PhantomData<UnsafeCell<()>>,
}

impl<'pb, R: ReclaimBatch> Pins<'pb, R> {
    /// Index of the underlying slot (diagnostic)
    pub fn slot_index(&self) -> u32 {
        self.idx
    }

    /// Current length of this slot's purgatory (diagnostic)
    pub fn purgatory_len(&self) -> u32 {
        self.slot.purgatory_count.get()
    }

    /// Publish `addr` in pin cell `k`.
    ///
    /// The caller must immediately re-read the shared location `addr` was
    /// loaded from and retry if it changed; only after a successful
    /// re-read is the object protected.
    #[inline]
    pub fn pin(&self, k: usize, addr: *mut u8) {
        // order: SeqCst puts the store in the same total order as the
        // caller's re-read and the scanner's harvest loads; a release
        // store could become visible only after the scanner has already
        // decided the cell is empty
        self.slot.pins[k].store(addr, Ordering::SeqCst);
    }

    /// Clear pin cell `k`
    #[inline]
    pub fn unpin(&self, k: usize) {
        // order: release keeps the caller's last reads of the object
        // before the pin disappears
        self.slot.pins[k].store(ptr::null_mut(), Ordering::Release);
    }

    /// Publish cell `to_k` with the current value of cell `from_k`.
    ///
    /// `to_k` must be greater than `from_k`: the scanner reads cells in
    /// increasing order, so only an upward copy guarantees the address is
    /// observed in at least one of the two cells mid-transition. Copying
    /// downward defeats hazard protection.
    #[inline]
    pub fn copy_pin(&self, from_k: usize, to_k: usize) {
        debug_assert!(to_k > from_k, "copy_pin must copy to a higher cell");
        // own cell, no other writer
        let addr = self.slot.pins[from_k].load(Ordering::Relaxed);
        self.slot.pins[to_k].store(addr, Ordering::SeqCst);
    }

    /// Push `obj` onto this slot's purgatory.
    ///
    /// The object will be handed to the pinbox's [ReclaimBatch] once a
    /// scan proves no thread pins it; that can be arbitrarily delayed if
    /// this slot's purgatory never reaches [PURGATORY_THRESHOLD] again,
    /// so callers needing tighter bounds run
    /// [scan_and_reclaim](Self::scan_and_reclaim) themselves.
    ///
    /// Safety: `obj` must point to a live object of this pinbox's domain,
    /// no longer reachable through any shared structure, with the bytes
    /// at `free_ptr_offset` unused by the caller from here on.
    pub unsafe fn defer_free(&self, obj: *mut u8) {
        let tracing_span = tracing::span!(Level::TRACE, "pins::defer_free", slot = self.idx);
        let _span_enter = tracing_span.enter();
        tracing::event!(Level::TRACE, ptr = ?(obj as *const ()));

        let offset = self.pinbox.free_ptr_offset;
        util::init_free_link(obj, offset);
        util::store_free_link(obj, offset, self.slot.purgatory_head.get());
        self.slot.purgatory_head.set(obj);
        let count = self.slot.purgatory_count.get() + 1;
        self.slot.purgatory_count.set(count);

        // every Nth deferred free, not on the first
        if count % PURGATORY_THRESHOLD == 0 {
            self.scan_and_reclaim();
        }
    }

    /// Partition this slot's purgatory into entries some thread still pins
    /// (kept) and entries nobody pins (handed to the reclaimer in one
    /// batch). A no-op if the purgatory is empty.
    pub fn scan_and_reclaim(&self) {
        let before = self.slot.purgatory_count.get();
        if before == 0 {
            return;
        }

        let tracing_span = tracing::span!(Level::TRACE, "pins::scan", slot = self.idx);
        let _span_enter = tracing_span.enter();

        let offset = self.pinbox.free_ptr_offset;
        let limit = self.pinbox.scan_limit();

        // detach the purgatory; survivors get pushed back one by one
        let mut cur = self.slot.purgatory_head.replace(ptr::null_mut());
        self.slot.purgatory_count.set(0);

        let mut batch_first: *mut u8 = ptr::null_mut();
        let mut batch_last: *mut u8 = ptr::null_mut();
        let mut freed = 0u32;

        let harvest_size = limit as usize * PIN_CELLS;
        if harvest_size <= HARVEST_CAP {
            // harvest every pin cell once, then binary-search per object
            let mut harvested: Vec<usize> = Vec::with_capacity(harvest_size);
            self.pinbox.slots.for_each_leaf(limit, |slots| {
                for slot in slots {
                    // increasing cell order; copy_pin only moves upward,
                    // so a migrating address is seen at least once
                    for cell in &slot.pins {
                        // order: SeqCst, see [pin](Self::pin)
                        let p = cell.load(Ordering::SeqCst);
                        if !p.is_null() {
                            harvested.push(p as usize);
                        }
                    }
                }
            });
            harvested.sort_unstable();

            while !cur.is_null() {
                let next = unsafe { util::load_free_link(cur, offset) };
                if harvested.binary_search(&(cur as usize)).is_ok() {
                    self.keep_in_purgatory(cur);
                } else {
                    unsafe {
                        if batch_first.is_null() {
                            batch_first = cur;
                        } else {
                            util::store_free_link(batch_last, offset, cur);
                        }
                    }
                    batch_last = cur;
                    freed += 1;
                }
                cur = next;
            }
        } else {
            // too many slots to table up; walk the pins per object instead
            while !cur.is_null() {
                let next = unsafe { util::load_free_link(cur, offset) };
                if self.is_pinned_anywhere(limit, cur) {
                    self.keep_in_purgatory(cur);
                } else {
                    unsafe {
                        if batch_first.is_null() {
                            batch_first = cur;
                        } else {
                            util::store_free_link(batch_last, offset, cur);
                        }
                    }
                    batch_last = cur;
                    freed += 1;
                }
                cur = next;
            }
        }

        tracing::event!(Level::TRACE, freed, kept = before - freed);

        if !batch_first.is_null() {
            unsafe {
                util::store_free_link(batch_last, offset, ptr::null_mut());
                self.pinbox
                    .reclaimer
                    .reclaim_batch(batch_first, batch_last);
            }
        }
    }

    /// Re-insert a still-pinned object into the (already detached)
    /// purgatory
    fn keep_in_purgatory(&self, obj: *mut u8) {
        unsafe {
            util::store_free_link(obj, self.pinbox.free_ptr_offset, self.slot.purgatory_head.get());
        }
        self.slot.purgatory_head.set(obj);
        self.slot
            .purgatory_count
            .set(self.slot.purgatory_count.get() + 1);
    }

    /// Linear-scan fallback: does any pin cell of any slot hold `addr`?
    fn is_pinned_anywhere(&self, limit: u32, addr: *mut u8) -> bool {
        let mut found = false;
        self.pinbox.slots.for_each_leaf(limit, |slots| {
            if found {
                return;
            }
            for slot in slots {
                for cell in &slot.pins {
                    if cell.load(Ordering::SeqCst) == addr {
                        found = true;
                        return;
                    }
                }
            }
        });
        found
    }
}

impl<'pb, R: ReclaimBatch> Drop for Pins<'pb, R> {
    fn drop(&mut self) {
        for (k, cell) in self.slot.pins.iter().enumerate() {
            debug_assert!(
                cell.load(Ordering::Relaxed).is_null(),
                "pin slot released with live pin in cell {}",
                k
            );
        }

        // a pinned purgatory entry only becomes reclaimable through another
        // thread dropping its pin, so spin with a yield between scans
        while self.slot.purgatory_count.get() != 0 {
            self.scan_and_reclaim();
            if self.slot.purgatory_count.get() != 0 {
                yield_now();
            }
        }

        loop {
            let top = self.pinbox.free_top.load(Ordering::Relaxed);
            self.slot
                .link
                .store(SlotLink::Free(top_index(top)).encode(), Ordering::Relaxed);
            // order: release publishes the link store to the next acquirer
            match self.pinbox.free_top.compare_exchange_weak(
                top,
                bump_version(top, self.idx),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(_) => spin_hint(),
            }
        }
    }
}

#[cfg(test)]
mod tests;
