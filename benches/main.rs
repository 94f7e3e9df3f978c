use criterion::{criterion_group, criterion_main, Criterion};

use tephra::cell::Value;
use tephra::driver::GcReason;
use tephra::memory_manager as mm;
use tephra::RuntimeBuilder;

fn bench_nursery_alloc(c: &mut Criterion) {
    let rt = RuntimeBuilder::new_no_env_vars().build();
    let mutator = rt.bind_mutator(rt.system_group());
    c.bench_function("nursery alloc", |b| {
        b.iter(|| {
            let obj = mm::new_object(&mutator, 2).unwrap();
            mm::write_slot(obj, 1, Value::from_int(1));
            obj
        })
    });
}

fn bench_minor_gc(c: &mut Criterion) {
    let rt = RuntimeBuilder::new_no_env_vars().build();
    let mutator = rt.bind_mutator(rt.system_group());
    c.bench_function("minor gc of a full nursery", |b| {
        b.iter(|| {
            while mm::new_object(&mutator, 2).is_ok()
                && rt.system_group().nursery.used_bytes() * 2 < rt.system_group().nursery.capacity()
            {
            }
            mm::evict_nursery(&rt, GcReason::ApiRequest);
        })
    });
}

criterion_group!(benches, bench_nursery_alloc, bench_minor_gc);
criterion_main!(benches);
