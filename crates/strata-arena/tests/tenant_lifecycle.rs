//! Integration test: tenant open/close cycles and chunk recycling.
//!
//! Simulates documents being opened and closed repeatedly and checks that
//! committed memory returns to zero, recycled chunks carry new
//! generations, and a reopened tenant id starts from a clean slate.

use strata_arena::{ArenaConfig, TenantArena, CHUNK_DATA_BYTES, LARGE_ALLOC_THRESHOLD};
use strata_core::{AllocError, ByteArena, TenantId};
use strata_test_utils::init_tracing;

fn arena() -> TenantArena {
    init_tracing();
    TenantArena::new(ArenaConfig::new().with_reserve_bytes(256 << 20)).unwrap()
}

#[test]
fn closed_tenant_chunks_move_to_recyclable_pool() {
    let arena = arena();
    let tenant = TenantId(3);
    let big = LARGE_ALLOC_THRESHOLD - 8;
    for _ in 0..9 {
        arena.allocate(big, tenant).unwrap();
    }
    let owned = arena.tenant_chunks(tenant);
    assert_eq!(owned.len(), 3);

    let release = arena.notify_tenant_closed(tenant);
    assert_eq!(release.chunks, 3);
    assert!(arena.tenant_chunks(tenant).is_empty());
    let mut recyclable = arena.recyclable_chunks();
    recyclable.sort_unstable();
    assert_eq!(recyclable, owned);

    let stats = arena.stats();
    assert_eq!(stats.chunks_committed, 0);
    assert_eq!(stats.chunks_recyclable, 3);
    assert_eq!(stats.tenants, 0);
    assert_eq!(stats.committed_bytes, 0);
}

#[test]
fn reopened_tenant_starts_fresh_history() {
    let arena = arena();
    let tenant = TenantId(11);
    let old = arena.allocate(64, tenant).unwrap();
    arena.write(old, 0, &[7; 64]).unwrap();
    arena.notify_tenant_closed(tenant);

    let new = arena.allocate(64, tenant).unwrap();
    assert_eq!(arena.tenant_chunks(tenant), vec![new.region().index()]);
    assert_ne!(new.region(), old.region());
    assert_eq!(arena.to_vec(new).unwrap(), vec![0; 64]);
    assert!(matches!(
        arena.to_vec(old),
        Err(AllocError::StaleHandle { .. })
    ));
    let usage = arena.chunk_usage(new.region().index()).unwrap();
    assert_eq!(usage.free_ranges, 1);
    assert_eq!(usage.used_bytes, 72);
}

#[test]
fn open_close_cycles_do_not_grow_the_arena() {
    let arena = arena();
    for cycle in 0..40u32 {
        let tenant = TenantId(cycle % 5);
        let mut handles = Vec::new();
        for i in 0..200usize {
            handles.push(arena.allocate(32 + i * 16, tenant).unwrap());
        }
        handles.push(arena.allocate(3 << 20, tenant).unwrap());
        for h in handles.iter().step_by(2) {
            arena.free(*h);
        }
        arena.notify_tenant_closed(tenant);
    }
    let stats = arena.stats();
    assert_eq!(stats.committed_bytes, 0);
    assert_eq!(stats.large_blocks, 0);
    assert!(stats.chunks_total <= 2, "chunks grew to {}", stats.chunks_total);
    assert_eq!(stats.rejected_frees, 0);
}

#[test]
fn generation_advances_on_every_reuse() {
    let arena = arena();
    let mut last = None;
    for round in 0..5u32 {
        let h = arena.allocate(8, TenantId(round)).unwrap();
        assert_eq!(h.region().index(), 0);
        if let Some(prev) = last {
            assert_eq!(h.region().generation(), u8::wrapping_add(prev, 1));
        }
        last = Some(h.region().generation());
        arena.notify_tenant_closed(TenantId(round));
    }
}

#[test]
fn large_blocks_of_closed_tenant_are_reused() {
    let arena = arena();
    let a = arena.allocate(2_000_000, TenantId(1)).unwrap();
    let addr = arena.address_of(a).unwrap();
    assert_eq!(arena.notify_tenant_closed(TenantId(1)).large_blocks, 1);

    let b = arena.allocate(2_000_000, TenantId(2)).unwrap();
    assert_eq!(arena.address_of(b).unwrap(), addr);
    assert_ne!(a.region(), b.region());
    assert!(arena.with_bytes(b, |p| p.iter().all(|&x| x == 0)).unwrap());
}

#[test]
fn small_pool_never_exceeds_chunk_data() {
    let arena = arena();
    let tenant = TenantId(4);
    let mut handles = Vec::new();
    for i in 0..5_000usize {
        handles.push(arena.allocate(1 + i % 500, tenant).unwrap());
    }
    for chunk in arena.tenant_chunks(tenant) {
        let usage = arena.chunk_usage(chunk).unwrap();
        assert_eq!(
            usage.free_bytes as usize + usage.used_bytes as usize,
            CHUNK_DATA_BYTES
        );
    }
    for h in handles {
        arena.free(h);
    }
    for chunk in arena.tenant_chunks(tenant) {
        let usage = arena.chunk_usage(chunk).unwrap();
        assert_eq!(usage.used_bytes, 0);
        assert_eq!(usage.free_ranges, 1);
    }
}
