//! Integration test: concurrent allocation and free across threads.
//!
//! Several threads allocate for the same tenant (racing on one active
//! chunk) and for distinct tenants, stamp their payloads, and verify no
//! two live allocations overlap. Frees are also handed across threads.
//! Large payload access must not hold up other tenants.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use strata_arena::{ArenaConfig, TenantArena, CHUNK_DATA_BYTES};
use strata_core::{AllocError, AllocHandle, ByteArena, Pool, TenantId};
use strata_test_utils::init_tracing;

fn arena() -> TenantArena {
    init_tracing();
    TenantArena::new(ArenaConfig::new().with_reserve_bytes(1 << 30)).unwrap()
}

#[test]
fn shared_tenant_allocations_never_overlap() {
    let arena = arena();
    let tenant = TenantId(1);

    let per_thread: Vec<Vec<(AllocHandle, u8)>> = thread::scope(|s| {
        let workers: Vec<_> = (0u8..8)
            .map(|t| {
                let arena = &arena;
                s.spawn(move || {
                    (0..500)
                        .map(|i| {
                            let size = 8 + (i % 13) * 24;
                            let h = arena.allocate(size, tenant).unwrap();
                            arena.with_bytes_mut(h, |b| b.fill(t)).unwrap();
                            (h, t)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let mut spans = Vec::new();
    for (h, stamp) in per_thread.iter().flatten() {
        assert!(arena.with_bytes(*h, |b| b.iter().all(|x| x == stamp)).unwrap());
        let addr = arena.address_of(*h).unwrap();
        spans.push((addr, addr + h.len() as u64));
    }
    spans.sort_unstable();
    for w in spans.windows(2) {
        assert!(w[0].1 <= w[1].0, "overlapping payloads {:?}", w);
    }

    for chunk in arena.tenant_chunks(tenant) {
        let usage = arena.chunk_usage(chunk).unwrap();
        assert_eq!(
            usage.free_bytes as usize + usage.used_bytes as usize,
            CHUNK_DATA_BYTES
        );
    }
}

#[test]
fn distinct_tenants_stay_in_their_own_chunks() {
    let arena = arena();

    thread::scope(|s| {
        for t in 0..6u32 {
            let arena = &arena;
            s.spawn(move || {
                let tenant = TenantId(100 + t);
                let mut live = Vec::new();
                for i in 0..2_000usize {
                    live.push(arena.allocate(16 + (i % 7) * 8, tenant).unwrap());
                    if i % 3 == 0 {
                        arena.free(live.swap_remove(i % live.len()));
                    }
                }
                for h in live {
                    arena.free(h);
                }
            });
        }
    });

    let mut seen = HashSet::new();
    for t in 0..6u32 {
        let chunks = arena.tenant_chunks(TenantId(100 + t));
        assert!(!chunks.is_empty());
        for chunk in chunks {
            assert!(seen.insert(chunk), "chunk {chunk} shared between tenants");
            let usage = arena.chunk_usage(chunk).unwrap();
            assert_eq!(usage.owner, Some(TenantId(100 + t)));
            assert_eq!(usage.used_bytes, 0);
        }
    }
    assert_eq!(arena.stats().rejected_frees, 0);
}

#[test]
fn frees_from_other_threads_are_accepted() {
    let arena = arena();
    let (tx, rx) = crossbeam_channel::bounded::<AllocHandle>(64);

    thread::scope(|s| {
        let producer = &arena;
        s.spawn(move || {
            for i in 0..1_000usize {
                let size = if i % 100 == 0 { 1_500_000 } else { 40 };
                tx.send(producer.allocate(size, TenantId(9)).unwrap()).unwrap();
            }
        });
        let consumer = &arena;
        s.spawn(move || {
            for h in rx {
                if h.region().pool() == Pool::Large {
                    assert_eq!(h.len(), 1_500_000);
                }
                consumer.free(h);
            }
        });
    });

    let stats = arena.stats();
    assert_eq!(stats.rejected_frees, 0);
    assert_eq!(stats.large_blocks, 0);
    for chunk in arena.tenant_chunks(TenantId(9)) {
        assert_eq!(arena.chunk_usage(chunk).unwrap().used_bytes, 0);
    }
}

#[test]
fn close_races_with_other_tenants() {
    let arena = arena();

    thread::scope(|s| {
        let worker = &arena;
        s.spawn(move || {
            for round in 0..50u32 {
                let tenant = TenantId(500 + round % 3);
                for _ in 0..20 {
                    worker.allocate(256, tenant).unwrap();
                }
                worker.notify_tenant_closed(tenant);
            }
        });
        let steady = &arena;
        s.spawn(move || {
            let handles: Vec<_> = (0..2_000)
                .map(|_| steady.allocate(64, TenantId(1)).unwrap())
                .collect();
            for h in &handles {
                steady.write(*h, 0, &[0xEE; 64]).unwrap();
            }
            for h in handles {
                assert_eq!(steady.to_vec(h).unwrap(), vec![0xEE; 64]);
            }
        });
    });

    for round in 0..3 {
        assert!(arena.tenant_chunks(TenantId(500 + round)).is_empty());
    }
    assert!(!arena.tenant_chunks(TenantId(1)).is_empty());
}

#[test]
fn large_payload_access_leaves_the_arena_usable() {
    let arena = arena();
    let held = arena.allocate(2_000_000, TenantId(1)).unwrap();
    let other = arena.allocate(2_000_000, TenantId(2)).unwrap();
    let (tx, rx) = crossbeam_channel::bounded::<Result<AllocHandle, AllocError>>(1);

    let (len, served) = thread::scope(|s| {
        arena
            .with_bytes(held, |bytes| {
                let tx = tx.clone();
                let arena = &arena;
                s.spawn(move || {
                    let small = arena.allocate(16, TenantId(2));
                    arena.with_bytes_mut(other, |b| b[0] = 7).unwrap();
                    tx.send(small).unwrap();
                });
                (bytes.len(), rx.recv_timeout(Duration::from_secs(5)))
            })
            .unwrap()
    });

    assert_eq!(len, 2_000_000);
    let small = served
        .expect("other tenant blocked while a large payload was borrowed")
        .unwrap();
    assert_eq!(small.region().pool(), Pool::Small);
    assert_eq!(arena.with_bytes(other, |b| b[0]).unwrap(), 7);

    arena.free(held);
    assert!(matches!(
        arena.with_bytes(held, |_| ()),
        Err(AllocError::StaleHandle { .. })
    ));
    assert_eq!(arena.stats().rejected_frees, 0);
}
