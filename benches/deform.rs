//! Tuple Deformation Benchmarks
//!
//! Compares the regular, interpreted `slot_getsomeattrs` against a deformation function
//! generated for the benchmarked slot. Rows are fixed-width and null-free so the
//! generated function never takes its fallback path.
//!
//! Each iteration stores the row into the slot again (which invalidates the previous
//! deformation) and then deforms every attribute, so both variants pay the same
//! bookkeeping cost.
//!
//! Run with: `cargo bench --bench deform`

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use deform_jit::executor::{
    slot_getsomeattrs, Attribute, HeapTuple, TupleDesc, TupleTableSlot, TupleValue,
};
use deform_jit::{CallSite, CodegenManager, SlotGetSomeAttrsFn};

/// A descriptor alternating int4 and int8 columns, which exercises alignment padding.
fn mixed_desc(natts: usize) -> Arc<TupleDesc> {
    Arc::new(TupleDesc::new(
        (0..natts)
            .map(|i| if i % 2 == 0 { Attribute::int4() } else { Attribute::int8() })
            .collect(),
    ))
}

fn mixed_row(desc: &TupleDesc) -> Arc<HeapTuple> {
    let values: Vec<TupleValue> = (0..desc.natts())
        .map(|i| TupleValue::Int(i as i64 * 7 - 3))
        .collect();
    Arc::new(HeapTuple::form(desc, &values))
}

fn benchmark_deformation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Slot Deformation");

    for natts in [2usize, 8, 32] {
        let desc = mixed_desc(natts);
        let row = mixed_row(&desc);

        group.bench_with_input(BenchmarkId::new("Regular", natts), &natts, |b, &natts| {
            let mut slot = TupleTableSlot::new(Arc::clone(&desc));
            b.iter(|| {
                slot.store_heap_tuple(Arc::clone(&row));
                unsafe { slot_getsomeattrs(slot.as_mut_ptr(), black_box(natts as i32)) };
                black_box(slot.values()[natts - 1])
            })
        });

        group.bench_with_input(BenchmarkId::new("JIT", natts), &natts, |b, &natts| {
            let mut slot = TupleTableSlot::new(Arc::clone(&desc));
            let site = CallSite::new(slot_getsomeattrs as SlotGetSomeAttrsFn);
            let mut manager = CodegenManager::new("bench");
            manager.enroll_slot_deform(Arc::clone(&site), &slot, natts as i32);
            manager.generate_code();
            manager.prepare_generated_functions();
            let deform = site.get();
            b.iter(|| {
                slot.store_heap_tuple(Arc::clone(&row));
                unsafe { deform(slot.as_mut_ptr(), black_box(natts as i32)) };
                black_box(slot.values()[natts - 1])
            })
        });
    }

    group.finish();
}

fn benchmark_compilation_time(c: &mut Criterion) {
    let mut group = c.benchmark_group("Deformation Compilation");

    for natts in [2usize, 32] {
        let desc = mixed_desc(natts);
        group.bench_with_input(BenchmarkId::new("Compile", natts), &natts, |b, &natts| {
            let slot = TupleTableSlot::new(Arc::clone(&desc));
            b.iter(|| {
                let site = CallSite::new(slot_getsomeattrs as SlotGetSomeAttrsFn);
                let mut manager = CodegenManager::new("bench");
                manager.enroll_slot_deform(site, &slot, natts as i32);
                manager.generate_code();
                black_box(manager.prepare_generated_functions())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_deformation, benchmark_compilation_time);
criterion_main!(benches);
