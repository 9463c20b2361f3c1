use std::sync::atomic::{AtomicUsize, Ordering};

use crate::collect::{instantiate_collector, CollectionKind, CollectorOptions};
use crate::mutator::Mutator;
use crate::size_classes::size_class_index;
use crate::types::{Array, FieldDesc, TypeLayout, ARRAY_MALLOC};
use crate::value::{as_tagged, value_of, BigVal, GcString, Value, WeakRef, GC_MARKED, GC_OLD, WORD};

#[repr(C)]
struct Node {
    next: *mut Value,
    data: usize,
}

static NODE_LAYOUT: TypeLayout = TypeLayout {
    size: 16,
    npointers: 1,
    name: "node",
    desc: FieldDesc::Ptr8(&[0]),
    sweepfunc: None,
};

static BIG_BYTES_LAYOUT: TypeLayout = TypeLayout {
    size: 1024 * 1024,
    npointers: 0,
    name: "bigbytes",
    desc: FieldDesc::None,
    sweepfunc: None,
};

static ARRAY_LAYOUT: TypeLayout = TypeLayout {
    size: std::mem::size_of::<Array>(),
    npointers: 0,
    name: "bytearray",
    desc: FieldDesc::Array,
    sweepfunc: None,
};

fn alloc_node(mutator: &mut Mutator, next: *mut Value) -> *mut Value {
    let v = mutator.alloc(16, &NODE_LAYOUT).unwrap();
    unsafe {
        let node = v.cast::<Node>();
        (*node).next = next;
        (*node).data = 0xbeef;
    }
    v
}

/// Shadow stack frame over a fixed set of roots; pops itself on drop.
struct RootFrame {
    mutator: *const Mutator,
    buf: Vec<usize>,
}

impl RootFrame {
    fn new(mutator: &Mutator, ptrs: &[*mut Value]) -> Box<RootFrame> {
        let mut buf = Vec::with_capacity(2 + ptrs.len());
        buf.push(ptrs.len() << 2);
        buf.push(0);
        buf.extend(ptrs.iter().map(|p| *p as usize));
        let mut this = Box::new(RootFrame {
            mutator: mutator as *const Mutator,
            buf,
        });
        unsafe {
            mutator.push_gc_frame(this.buf.as_mut_ptr().cast());
        }
        this
    }
}

impl Drop for RootFrame {
    fn drop(&mut self) {
        unsafe {
            (*self.mutator).pop_gc_frame();
        }
    }
}

#[test]
fn pool_objects_survive_collection() {
    let mut mutator = instantiate_collector(CollectorOptions::default());
    const N: usize = 10_000;
    let mut objs = Vec::with_capacity(N);
    for _ in 0..N {
        objs.push(alloc_node(&mut mutator, std::ptr::null_mut()));
    }
    let frame = RootFrame::new(&mutator, &objs);
    mutator.collect(CollectionKind::Auto);

    assert!(mutator.collector_ref().live_bytes() >= 160_000);
    for &v in objs.iter() {
        unsafe {
            assert_eq!((*as_tagged(v)).type_of(), &NODE_LAYOUT as *const TypeLayout);
            assert_eq!((*v.cast::<Node>()).data, 0xbeef);
        }
    }

    // page accounting: free cells plus live cells fill the page exactly
    unsafe {
        let collector = mutator.collector_ref();
        let pg = collector
            .page_alloc
            .memory_map()
            .page_metadata(as_tagged(objs[0]) as usize);
        assert!(!pg.is_null());
        let osize = (*pg).osize as usize;
        let capacity = (crate::page::GC_PAGE_SZ - crate::page::GC_PAGE_OFFSET) / osize;
        let mut live = 0;
        for i in 0..capacity {
            if (*pg).ages.add(i / 8).read() & (1 << (i % 8)) != 0 {
                live += 1;
            }
        }
        assert_eq!(live + (*pg).nfree as usize, capacity);
    }
    drop(frame);
}

static BIG_FREED: AtomicUsize = AtomicUsize::new(0);

fn count_big_free(_hdr: *mut BigVal) {
    BIG_FREED.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn big_object_freed_with_callback() {
    let mut mutator = instantiate_collector(CollectorOptions::default());
    mutator
        .collector_ref()
        .callbacks
        .notify_external_free
        .register(count_big_free);

    let v = mutator.alloc(1024 * 1024, &BIG_BYTES_LAYOUT).unwrap();
    let hdr = BigVal::from_tagged(as_tagged(v));
    // the big list holds it until it dies
    assert!(contains_big(&mutator, hdr));

    mutator.collect(CollectionKind::Full);
    assert_eq!(BIG_FREED.load(Ordering::Relaxed), 1);
    assert!(!contains_big(&mutator, hdr));
}

fn contains_big(mutator: &Mutator, hdr: *mut BigVal) -> bool {
    unsafe {
        let mut v = mutator.heap.big_objects;
        while !v.is_null() {
            if v == hdr {
                return true;
            }
            v = (*v).next;
        }
        false
    }
}

#[test]
fn unreachable_cycle_is_reclaimed() {
    let mut mutator = instantiate_collector(CollectorOptions::default());
    // a live object keeps the page from being handed back wholesale, so
    // the dead cells end up on the freelist where we can see them
    let keeper = alloc_node(&mut mutator, std::ptr::null_mut());
    let a = alloc_node(&mut mutator, std::ptr::null_mut());
    let b = alloc_node(&mut mutator, a);
    unsafe {
        (*a.cast::<Node>()).next = b;
    }
    let frame = RootFrame::new(&mutator, &[keeper]);
    mutator.collect(CollectionKind::Full);

    // both cells must be back on the freelist of their size class
    let class = size_class_index(16 + WORD);
    unsafe {
        let mut fl = mutator.heap.pools[class].freelist;
        let mut found = 0;
        while !fl.is_null() {
            if value_of(fl) == a || value_of(fl) == b {
                found += 1;
            }
            fl = (*fl).next();
        }
        assert_eq!(found, 2, "cycle cells were not threaded onto the freelist");
    }
    drop(frame);
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

unsafe fn count_finalized(_v: *mut Value) {
    FINALIZED.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn finalizer_runs_exactly_once() {
    let mut mutator = instantiate_collector(CollectorOptions::default());
    {
        let v = alloc_node(&mut mutator, std::ptr::null_mut());
        mutator.add_ptr_finalizer(v, count_finalized);
    }
    mutator.collect(CollectionKind::Auto);
    assert_eq!(FINALIZED.load(Ordering::Relaxed), 1);
    mutator.collect(CollectionKind::Auto);
    mutator.collect(CollectionKind::Full);
    assert_eq!(FINALIZED.load(Ordering::Relaxed), 1);
}

#[test]
fn finalizer_deferred_while_reachable() {
    static ALIVE_FIN: AtomicUsize = AtomicUsize::new(0);
    unsafe fn fin(_v: *mut Value) {
        ALIVE_FIN.fetch_add(1, Ordering::Relaxed);
    }

    let mut mutator = instantiate_collector(CollectorOptions::default());
    let v = alloc_node(&mut mutator, std::ptr::null_mut());
    mutator.add_ptr_finalizer(v, fin);
    let frame = RootFrame::new(&mutator, &[v]);
    mutator.collect(CollectionKind::Auto);
    assert_eq!(ALIVE_FIN.load(Ordering::Relaxed), 0);
    drop(frame);
    mutator.collect(CollectionKind::Auto);
    assert_eq!(ALIVE_FIN.load(Ordering::Relaxed), 1);
}

#[test]
fn weak_ref_cleared_and_preserved() {
    let mut mutator = instantiate_collector(CollectorOptions::default());

    let target = alloc_node(&mut mutator, std::ptr::null_mut());
    let wr = mutator.alloc_weakref(target).unwrap();
    let frame = RootFrame::new(&mutator, &[wr, target]);
    mutator.collect(CollectionKind::Auto);
    unsafe {
        assert_eq!((*wr.cast::<WeakRef>()).value, target, "live target kept");
    }
    drop(frame);

    let frame = RootFrame::new(&mutator, &[wr]);
    mutator.collect(CollectionKind::Auto);
    unsafe {
        let undef = mutator.collector_ref().undef();
        assert_eq!(
            (*wr.cast::<WeakRef>()).value,
            undef,
            "dead target replaced by the undef sentinel"
        );
    }
    drop(frame);
}

#[test]
fn write_barrier_keeps_young_child_alive() {
    let mut mutator = instantiate_collector(CollectorOptions::default());

    let old = alloc_node(&mut mutator, std::ptr::null_mut());
    let frame = RootFrame::new(&mutator, &[old]);
    // two quick cycles age the object past the promotion threshold
    mutator.collect(CollectionKind::Auto);
    mutator.collect(CollectionKind::Auto);
    unsafe {
        assert_eq!((*as_tagged(old)).bits(), GC_OLD, "survivor was promoted");
    }

    // store a young object into the old one; the barrier is on us
    let young = alloc_node(&mut mutator, std::ptr::null_mut());
    unsafe {
        (*old.cast::<Node>()).next = young;
    }
    mutator.queue_root(old);
    assert!(mutator.heap.remset.contains(&old));

    mutator.collect(CollectionKind::Auto);
    unsafe {
        assert_eq!(
            (*as_tagged(young)).type_of(),
            &NODE_LAYOUT as *const TypeLayout,
            "young child survived through the remset"
        );
        // after a quick sweep the parent is re-tagged so the barrier stays
        // primed without firing again
        assert_eq!((*as_tagged(old)).bits(), GC_MARKED);
        assert!(mutator.heap.remset.contains(&old));
    }
    drop(frame);
}

#[test]
fn malloced_array_buffer_swept() {
    let mut mutator = instantiate_collector(CollectorOptions::default());
    {
        let v = mutator
            .alloc(std::mem::size_of::<Array>(), &ARRAY_LAYOUT)
            .unwrap();
        let buf = mutator.managed_malloc(1024).unwrap();
        unsafe {
            let a = v.cast::<Array>();
            (*a).data = buf;
            (*a).len = 1024;
            (*a).owner = std::ptr::null_mut();
            (*a).eltype = std::ptr::null();
            (*a).elsize = 1;
            (*a).how = ARRAY_MALLOC;
            (*a).ptrarray = false;
            (*a).hasptr = false;
        }
        mutator.track_malloced_array(v);
    }
    mutator.collect(CollectionKind::Full);
    assert!(mutator.heap.mallocarrays.is_null());
    assert!(!mutator.heap.mafreelist.is_null(), "tracking node recycled");
}

#[test]
fn realloc_string_copies_small_grows_big() {
    let mut mutator = instantiate_collector(CollectorOptions::default());

    // pool-class string: growth copies
    let s = mutator.alloc_string(32).unwrap();
    unsafe {
        std::ptr::write_bytes(s.cast::<u8>().add(WORD), b'x', 32);
    }
    let grown = mutator.realloc_string(s, 4096).unwrap();
    assert_ne!(grown, s);
    unsafe {
        assert_eq!((*grown.cast::<GcString>()).len, 4096);
        assert_eq!(s.cast::<u8>().add(WORD).read(), b'x');
        assert_eq!(grown.cast::<u8>().add(WORD).read(), b'x');
    }

    // big unmarked string: grows in place, old pointer is gone
    let big = mutator.alloc_string(64 * 1024).unwrap();
    let bigger = mutator.realloc_string(big, 128 * 1024).unwrap();
    unsafe {
        assert_eq!((*bigger.cast::<GcString>()).len, 128 * 1024);
        assert!(contains_big(&mutator, BigVal::from_tagged(as_tagged(bigger))));
    }
}

#[test]
fn perm_alloc_is_never_swept() {
    let mut mutator = instantiate_collector(CollectorOptions::default());
    let collector = mutator.collector_ref();
    let p = collector.perm_alloc(64, true, 16, 0).unwrap();
    assert!(!p.is_null());
    assert_eq!(p as usize % 16, 0);
    unsafe {
        p.write(0xab);
    }
    mutator.collect(CollectionKind::Full);
    unsafe {
        assert_eq!(p.read(), 0xab);
    }
}

#[test]
fn disabled_gc_defers_accounting() {
    let mut mutator = instantiate_collector(CollectorOptions::default());
    assert!(mutator.gc_is_enabled());
    let prev = mutator.gc_enable(false);
    assert!(prev);
    // trigger the collection path; it must defer instead of collecting
    mutator.collect(CollectionKind::Auto);
    assert_eq!(mutator.collector_ref().num().pause, 0);
    assert!(mutator.collector_ref().num().deferred_alloc >= 0);
    let prev = mutator.gc_enable(true);
    assert!(!prev);
    mutator.collect(CollectionKind::Auto);
    assert_eq!(mutator.collector_ref().num().pause, 1);
}

#[test]
fn conservative_base_pointer_lookup() {
    let mut mutator = instantiate_collector(CollectorOptions::default());
    let v = alloc_node(&mut mutator, std::ptr::null_mut());
    let frame = RootFrame::new(&mutator, &[v]);
    assert!(!mutator.enable_conservative_gc_support());

    let collector = mutator.collector_ref();
    // interior pointer into the payload maps back to the object base
    let interior = (v as usize + 12) as *mut ();
    assert_eq!(collector.internal_obj_base_ptr(interior), Some(v));
    // pointer into the page header area maps to nothing
    let page = crate::page::gc_page_data(v as usize);
    assert_eq!(collector.internal_obj_base_ptr(page.cast()), None);
    drop(frame);
}

#[test]
fn stop_running_threads() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 10_000;

    let mut mutator = instantiate_collector(CollectorOptions::default());
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        handles.push(mutator.spawn_mutator(|mut mutator| {
            for i in 0..ITERATIONS {
                let v = alloc_node(&mut mutator, std::ptr::null_mut());
                std::hint::black_box(v);
                if i % 128 == 0 {
                    mutator.safepoint();
                }
            }
        }));
    }
    for _ in 0..4 {
        mutator.collect(CollectionKind::Auto);
    }
    for handle in handles {
        handle.join(&mutator);
    }
    mutator.collect(CollectionKind::Full);
}

#[test]
fn parallel_markers_agree_with_serial() {
    let options = CollectorOptions {
        marker_threads: 4,
        ..Default::default()
    };
    let mut mutator = instantiate_collector(options);
    // a deep list stresses the work-stealing drain
    let mut head = std::ptr::null_mut();
    for _ in 0..50_000 {
        head = alloc_node(&mut mutator, head);
    }
    let frame = RootFrame::new(&mutator, &[head]);
    mutator.collect(CollectionKind::Auto);
    // every node is still intact
    let mut n = 0;
    let mut v = head;
    while !v.is_null() {
        unsafe {
            assert_eq!((*v.cast::<Node>()).data, 0xbeef);
            v = (*v.cast::<Node>()).next;
        }
        n += 1;
    }
    assert_eq!(n, 50_000);
    drop(frame);
}
