use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use sable::types::{FieldDesc, TypeLayout};
use sable::{instantiate_collector, CollectionKind, CollectorOptions, Mutator, Value};

#[repr(C)]
struct Tree {
    first: *mut Value,
    second: *mut Value,
}

static TREE_LAYOUT: TypeLayout = TypeLayout {
    size: 16,
    npointers: 2,
    name: "tree",
    desc: FieldDesc::Ptr8(&[0, 1]),
    sweepfunc: None,
};

fn alloc_tree(mutator: &mut Mutator, first: *mut Value, second: *mut Value) -> *mut Value {
    let v = mutator.alloc(16, &TREE_LAYOUT).unwrap();
    unsafe {
        let t = v.cast::<Tree>();
        (*t).first = first;
        (*t).second = second;
    }
    v
}

fn bottom_up_tree(mutator: &mut Mutator, depth: u32) -> *mut Value {
    if depth == 0 {
        return alloc_tree(mutator, std::ptr::null_mut(), std::ptr::null_mut());
    }
    let first = bottom_up_tree(mutator, depth - 1);
    // keep the finished subtrees rooted while allocating the rest
    let mut frame = [2usize << 2, 0, first as usize, 0];
    unsafe {
        mutator.push_gc_frame(frame.as_mut_ptr().cast());
    }
    let second = bottom_up_tree(mutator, depth - 1);
    frame[3] = second as usize;
    let parent = alloc_tree(mutator, first, second);
    unsafe {
        mutator.pop_gc_frame();
    }
    parent
}

fn item_check(v: *mut Value) -> i32 {
    unsafe {
        let t = v.cast::<Tree>();
        if (*t).first.is_null() {
            return 1;
        }
        1 + item_check((*t).first) + item_check((*t).second)
    }
}

pub fn bench_gcs(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary trees");
    group.sample_size(20);
    let min_depth = 4;

    for max_depth in [12u32, 14] {
        group.bench_function(BenchmarkId::new("sable", max_depth), |b| {
            b.iter_batched_ref(
                || instantiate_collector(CollectorOptions::default()),
                |mutator| {
                    let mut depth = min_depth;
                    while depth < max_depth {
                        let iterations = 1 << (max_depth - depth + min_depth);
                        for _ in 0..iterations {
                            item_check(bottom_up_tree(mutator, depth));
                        }
                        depth += 2;
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });

        group.bench_function(BenchmarkId::new("sable(parallel-mark)", max_depth), |b| {
            b.iter_batched_ref(
                || {
                    instantiate_collector(CollectorOptions {
                        marker_threads: 4,
                        ..Default::default()
                    })
                },
                |mutator| {
                    let long_lived = bottom_up_tree(mutator, max_depth);
                    let mut frame = [1usize << 2, 0, long_lived as usize];
                    unsafe {
                        mutator.push_gc_frame(frame.as_mut_ptr().cast());
                    }
                    mutator.collect(CollectionKind::Full);
                    item_check(long_lived);
                    unsafe {
                        mutator.pop_gc_frame();
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_gcs);
criterion_main!(benches);
