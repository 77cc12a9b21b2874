use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use realm_model::host::{self, RealmSpec};
use realm_model::monitor::{HostMemory, ModelMonitor, Rmi};
use realm_model::types::{level_size, Pa, GRANULE_SIZE, RTT_ENTRIES, RTT_MAX_LEVEL};

/// A realm whose second unprotected 2 MiB block is mapped page by page.
fn mapped_realm() -> (ModelMonitor, Pa, u64) {
    let mut m = ModelMonitor::default();
    let block = level_size(2);
    let mut realm = host::realm_setup(&mut m, &RealmSpec::default()).unwrap();
    let phys = m.alloc_granules(RTT_ENTRIES, block).unwrap();
    let ipa = host::map_unprotected_range(&mut m, &mut realm, block, block, phys, 0).unwrap();
    (m, realm.rd, ipa)
}

fn bench_fold_unfold(c: &mut Criterion) {
    let (mut m, rd, ipa) = mapped_realm();
    c.bench_function("fold_then_unfold_ns_block", |b| {
        b.iter(|| {
            let rtt = m.rtt_fold(rd, black_box(ipa), RTT_MAX_LEVEL).unwrap();
            m.rtt_create(rd, rtt, ipa, RTT_MAX_LEVEL).unwrap();
        })
    });

    c.bench_function("read_leaf_entries", |b| {
        b.iter(|| {
            for page in 0..RTT_ENTRIES as u64 {
                black_box(m.rtt_read_entry(rd, ipa + page * GRANULE_SIZE, RTT_MAX_LEVEL).unwrap());
            }
        })
    });

    c.bench_function("realm_setup_and_map", |b| {
        b.iter_batched(
            ModelMonitor::default,
            |mut m| {
                let mut realm = host::realm_setup(&mut m, &RealmSpec::default()).unwrap();
                host::map_protected_data(&mut m, &mut realm, 0x1000, Some(b"bench")).unwrap();
                host::teardown(&mut m, realm).unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_fold_unfold);
criterion_main!(benches);
