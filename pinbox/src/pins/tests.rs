use std::sync::Mutex;

use super::*;

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}

/// Managed object for registry-level tests: link at offset 0, payload after
#[repr(align(8))]
struct TestObj([u8; 64]);

fn new_obj() -> *mut u8 {
    Box::into_raw(Box::new(TestObj([0; 64]))) as *mut u8
}

unsafe fn drop_obj(obj: *mut u8) {
    drop(Box::from_raw(obj as *mut TestObj));
}

/// Reclaimer that records every handed-back object and releases its memory
struct CollectReclaim {
    offset: usize,
    freed: Mutex<Vec<usize>>,
    batches: Mutex<u32>,
}

impl CollectReclaim {
    fn new(offset: usize) -> Self {
        Self {
            offset,
            freed: Mutex::new(Vec::new()),
            batches: Mutex::new(0),
        }
    }

    fn freed(&self) -> Vec<usize> {
        self.freed.lock().unwrap().clone()
    }

    fn batches(&self) -> u32 {
        *self.batches.lock().unwrap()
    }
}

impl ReclaimBatch for CollectReclaim {
    unsafe fn reclaim_batch(&self, first: *mut u8, last: *mut u8) {
        *self.batches.lock().unwrap() += 1;
        let mut freed = self.freed.lock().unwrap();
        let mut cur = first;
        loop {
            freed.push(cur as usize);
            if cur == last {
                break;
            }
            cur = util::load_free_link(cur, self.offset);
        }
        assert!(util::load_free_link(last, self.offset).is_null());
        let mut cur = first;
        while !cur.is_null() {
            let next = util::load_free_link(cur, self.offset);
            drop_obj(cur);
            cur = next;
        }
    }
}

/// Reclaimer for tests that must never reclaim anything
struct NoReclaim;

impl ReclaimBatch for NoReclaim {
    unsafe fn reclaim_batch(&self, _first: *mut u8, _last: *mut u8) {
        unreachable!("nothing should be reclaimed in this test");
    }
}

#[test]
fn ensure_pinbox_send_sync() {
    assert_send::<PinBox<NoReclaim>>();
    assert_sync::<PinBox<NoReclaim>>();
    assert_send::<Pins<'static, NoReclaim>>();
}

#[test]
fn slot_link_encoding() {
    for idx in [0u32, 1, 42, MAX_PIN_SLOTS] {
        assert_eq!(
            SlotLink::decode(SlotLink::Owned(idx).encode()),
            SlotLink::Owned(idx)
        );
        assert_eq!(
            SlotLink::decode(SlotLink::Free(idx).encode()),
            SlotLink::Free(idx)
        );
    }
}

#[test]
fn versioned_word_packing() {
    let w = bump_version(0, 3);
    assert_eq!(top_index(w), 3);
    assert_eq!(w >> 16, 1);
    // version wraps at 16 bits without disturbing the index
    let w = bump_version(0xFFFF_0000, 7);
    assert_eq!(top_index(w), 7);
    assert_eq!(w >> 16, 0);
}

#[cfg(not(loom))]
#[test]
fn pin_unpin_roundtrip() {
    let pb = PinBox::new(0, NoReclaim);
    let pins = pb.acquire().unwrap();
    let obj = new_obj();

    pins.pin(0, obj);
    assert_eq!(pins.slot.pins[0].load(Ordering::SeqCst), obj);
    assert!(pb._debug_pinned_set().contains(&(obj as usize)));

    // pin/unpin pairs are idempotent at quiescence
    for _ in 0..3 {
        pins.pin(1, obj);
        pins.unpin(1);
    }
    assert!(pins.slot.pins[1].load(Ordering::SeqCst).is_null());

    pins.unpin(0);
    assert!(pins.slot.pins[0].load(Ordering::SeqCst).is_null());
    assert!(pb._debug_pinned_set().is_empty());

    drop(pins);
    unsafe { drop_obj(obj) };
}

#[cfg(not(loom))]
#[test]
fn copy_pin_goes_upward() {
    let pb = PinBox::new(0, NoReclaim);
    let pins = pb.acquire().unwrap();
    let obj = new_obj();

    pins.pin(0, obj);
    pins.copy_pin(0, 2);
    assert_eq!(pins.slot.pins[2].load(Ordering::SeqCst), obj);
    pins.unpin(0);
    pins.unpin(2);

    drop(pins);
    unsafe { drop_obj(obj) };
}

#[cfg(all(not(loom), debug_assertions))]
#[test]
#[should_panic(expected = "copy_pin must copy to a higher cell")]
fn copy_pin_downward_asserts() {
    let pb = PinBox::new(0, NoReclaim);
    let pins = pb.acquire().unwrap();
    pins.copy_pin(1, 0);
}

#[cfg(not(loom))]
#[test]
fn slot_recycling_bumps_version() {
    let pb = PinBox::new(0, NoReclaim);
    // materialize one slot, then recycle it over and over
    drop(pb.acquire().unwrap());

    let mut prev = pb.free_top.load(Ordering::SeqCst);
    for _ in 0..10_000 {
        let pins = pb.acquire().unwrap();
        assert_eq!(pins.slot_index(), 1);
        drop(pins);
        let snap = pb.free_top.load(Ordering::SeqCst);
        // version moved even though the same slot is back on top
        assert_ne!(snap, prev);
        assert_eq!(top_index(snap), 1);
        prev = snap;
    }
}

#[cfg(not(loom))]
#[test]
fn acquiring_last_free_slot_empties_stack() {
    let pb = PinBox::new(0, NoReclaim);
    let pins = pb.acquire().unwrap();
    assert_eq!(top_index(pb.free_top.load(Ordering::SeqCst)), 0);
    drop(pins);
    assert_eq!(top_index(pb.free_top.load(Ordering::SeqCst)), 1);
    let pins = pb.acquire().unwrap();
    assert_eq!(pins.slot_index(), 1);
    assert_eq!(top_index(pb.free_top.load(Ordering::SeqCst)), 0);
}

#[cfg(not(loom))]
#[test]
fn scan_with_empty_purgatory_is_noop() {
    let pb = PinBox::new(0, NoReclaim);
    let pins = pb.acquire().unwrap();
    // NoReclaim panics if a batch is ever handed over
    pins.scan_and_reclaim();
    assert_eq!(pins.purgatory_len(), 0);
}

#[cfg(not(loom))]
#[test]
fn threshold_triggers_reclaim_every_nth_free() {
    let pb = PinBox::new(0, CollectReclaim::new(0));
    let pins = pb.acquire().unwrap();

    // 25 deferred frees with nothing pinned: passes fire at the 10th and
    // 20th free, each clearing the purgatory completely
    for i in 0..25u32 {
        unsafe { pins.defer_free(new_obj()) };
        assert_eq!(pins.purgatory_len(), (i + 1) % PURGATORY_THRESHOLD);
    }
    assert_eq!(pb.reclaimer().batches(), 2);
    assert_eq!(pb.reclaimer().freed().len(), 20);
    assert_eq!(pins.purgatory_len(), 5);

    // forcing a pass drains the remainder
    pins.scan_and_reclaim();
    assert_eq!(pins.purgatory_len(), 0);
    assert_eq!(pb.reclaimer().batches(), 3);
    assert_eq!(pb.reclaimer().freed().len(), 25);
}

#[cfg(not(loom))]
#[test]
fn pinned_object_stays_in_purgatory() {
    let pb = PinBox::new(0, CollectReclaim::new(0));
    let freeing = pb.acquire().unwrap();
    let reading = pb.acquire().unwrap();

    let obj = new_obj();
    reading.pin(0, obj);

    unsafe { freeing.defer_free(obj) };
    for _ in 0..3 {
        freeing.scan_and_reclaim();
        assert_eq!(freeing.purgatory_len(), 1);
        assert!(pb.reclaimer().freed().is_empty());
    }

    reading.unpin(0);
    freeing.scan_and_reclaim();
    assert_eq!(freeing.purgatory_len(), 0);
    assert_eq!(pb.reclaimer().freed(), vec![obj as usize]);
}

/// Reclaimer that scribbles over the payload (beyond the link) before
/// releasing, so any use-after-reclaim read trips on the poison
struct PoisonReclaim {
    offset: usize,
    freed: Mutex<Vec<usize>>,
}

const POISON: u8 = 0xDE;

impl ReclaimBatch for PoisonReclaim {
    unsafe fn reclaim_batch(&self, first: *mut u8, last: *mut u8) {
        assert!(util::load_free_link(last, self.offset).is_null());
        let mut freed = self.freed.lock().unwrap();
        let mut cur = first;
        while !cur.is_null() {
            let next = util::load_free_link(cur, self.offset);
            for i in 16..64 {
                *cur.add(i) = POISON;
            }
            freed.push(cur as usize);
            cur = next;
        }
    }
}

/// Walking a linked list with the upward copy-pin idiom keeps every node
/// the walker stands on alive, even while another slot frees the whole
/// list out from under it.
#[cfg(not(loom))]
#[test]
fn copy_pin_walk_survives_concurrent_free() {
    const MAGIC: u8 = 0x5A;
    // next pointer at offset 8, payload at 16.. (free link is at 0)
    unsafe fn next_of(node: *mut u8) -> *mut u8 {
        (node.add(8) as *mut *mut u8).read()
    }
    unsafe fn check_alive(node: *mut u8) {
        for i in 16..64 {
            assert_eq!(*node.add(i), MAGIC, "walker read a poisoned node");
        }
    }

    let pb = PinBox::new(
        0,
        PoisonReclaim {
            offset: 0,
            freed: Mutex::new(Vec::new()),
        },
    );
    let walker = pb.acquire().unwrap();
    let mutator = pb.acquire().unwrap();

    // build h -> n1 -> n2 -> n3
    let nodes: Vec<*mut u8> = (0..4).map(|_| new_obj()).collect();
    unsafe {
        for (i, &n) in nodes.iter().enumerate() {
            for b in 16..64 {
                *n.add(b) = MAGIC;
            }
            let next = if i + 1 < nodes.len() {
                nodes[i + 1]
            } else {
                ptr::null_mut()
            };
            (n.add(8) as *mut *mut u8).write(next);
        }
    }

    // the mutator frees each node while the walker is standing on it;
    // only the walker's pins keep the poison away
    let mut cur = nodes[0];
    walker.pin(0, cur);
    unsafe {
        while !cur.is_null() {
            mutator.defer_free(cur);
            mutator.scan_and_reclaim();
            check_alive(cur);
            // protect the node we stand on, then advance cell 0
            walker.copy_pin(0, 1);
            let next = next_of(cur);
            walker.pin(0, next);
            mutator.scan_and_reclaim();
            check_alive(cur);
            walker.unpin(1);
            cur = next;
        }
    }
    walker.unpin(0);
    walker.unpin(1);

    mutator.scan_and_reclaim();
    assert_eq!(mutator.purgatory_len(), 0);
    assert_eq!(pb.reclaimer().freed.lock().unwrap().len(), 4);

    for &n in &nodes {
        unsafe { drop_obj(n) };
    }
}

#[cfg(not(loom))]
#[test]
fn slot_exhaustion_and_recovery() {
    let pb = PinBox::new(0, NoReclaim);

    let mut guards = Vec::with_capacity(MAX_PIN_SLOTS as usize);
    for i in 1..=MAX_PIN_SLOTS {
        let pins = pb.acquire().expect("slots up to the cap must succeed");
        assert_eq!(pins.slot_index(), i);
        guards.push(pins);
    }
    // 65536th concurrent slot is over the cap
    assert!(pb.acquire().is_none());
    assert!(pb.acquire().is_none());

    // nothing was corrupted: release one, acquire gets it back
    let last = guards.pop().unwrap();
    let freed_idx = last.slot_index();
    drop(last);
    let pins = pb.acquire().unwrap();
    assert_eq!(pins.slot_index(), freed_idx);
    assert!(pb.acquire().is_none());
}

#[cfg(loom)]
#[test]
fn pins_loom_concurrent_acquire() {
    loom::model(|| {
        let pb = &*Box::leak(Box::new(PinBox::new(0, NoReclaim)));
        // seed the free stack with two slots
        {
            let a = pb.acquire().unwrap();
            let b = pb.acquire().unwrap();
            drop(a);
            drop(b);
        }

        // each thread tags pin cell 0 of its slot with a thread-unique
        // marker; if a double-pop ever handed both threads the same slot
        // the other thread's tag shows up in our cell
        let worker = |tag: usize| {
            move || {
                let pins = pb.acquire().unwrap();
                assert!(pins.slot_index() >= 1 && pins.slot_index() <= 2);
                pins.pin(0, tag as *mut u8);
                loom::thread::yield_now();
                assert_eq!(pins.slot.pins[0].load(Ordering::SeqCst), tag as *mut u8);
                pins.unpin(0);
                drop(pins);
            }
        };
        let t0 = loom::thread::spawn(worker(0x10));
        let t1 = loom::thread::spawn(worker(0x20));
        t0.join().unwrap();
        t1.join().unwrap();

        // both slots ended up back on the stack
        let a = pb.acquire().unwrap();
        let b = pb.acquire().unwrap();
        assert_ne!(a.slot_index(), b.slot_index());
        assert!(a.slot_index() <= 2 && b.slot_index() <= 2);
    })
}

#[cfg(loom)]
#[test]
fn pins_loom_hazard_protect() {
    const MAGIC: u64 = 0x600D_F00D_600D_F00D;
    const BAD: u64 = 0xDEAD_DEAD_DEAD_DEAD;
    // loom atomics are bigger than a bare pointer, so park the payload
    // well past the free link
    const PAYLOAD: usize = 128;

    #[repr(align(8))]
    struct BigObj([u8; 256]);

    struct PoisonDrop;
    impl ReclaimBatch for PoisonDrop {
        unsafe fn reclaim_batch(&self, first: *mut u8, last: *mut u8) {
            let mut cur = first;
            while !cur.is_null() {
                let next = util::load_free_link(cur, 0);
                (cur.add(PAYLOAD) as *mut u64).write(BAD);
                drop(Box::from_raw(cur as *mut BigObj));
                if cur == last {
                    break;
                }
                cur = next;
            }
        }
    }

    loom::model(|| {
        let pb = &*Box::leak(Box::new(PinBox::new(0, PoisonDrop)));
        let shared = &*Box::leak(Box::new(AtomicPtr::new(ptr::null_mut::<u8>())));

        let obj = Box::into_raw(Box::new(BigObj([0; 256]))) as *mut u8;
        unsafe { (obj.add(PAYLOAD) as *mut u64).write(MAGIC) };
        shared.store(obj, Ordering::SeqCst);

        let reader = loom::thread::spawn(move || {
            let pins = pb.acquire().unwrap();
            let p = shared.load(Ordering::SeqCst);
            if !p.is_null() {
                pins.pin(0, p);
                if shared.load(Ordering::SeqCst) == p {
                    // pin held and re-read confirmed: the payload must
                    // still be intact no matter how the free interleaves
                    let v = unsafe { (p.add(PAYLOAD) as *const u64).read() };
                    assert_eq!(v, MAGIC);
                }
                pins.unpin(0);
            }
            drop(pins);
        });

        let pins = pb.acquire().unwrap();
        shared.store(ptr::null_mut(), Ordering::SeqCst);
        unsafe { pins.defer_free(obj) };
        pins.scan_and_reclaim();
        drop(pins); // drains once the reader unpins

        reader.join().unwrap();
    })
}
