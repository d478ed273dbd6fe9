//! Benchmark workloads for the Strata arena and property store.
//!
//! - [`bench_arena`]: a `TenantArena` sized for benchmark loops
//! - [`size_mix`]: deterministic allocation sizes skewed towards small
//!   payloads, with an occasional large one
//! - [`sparse_mask`]: deterministic presence masks with a target density

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use strata_arena::{ArenaConfig, ArenaError, TenantArena, LARGE_ALLOC_THRESHOLD};

const LCG_MUL: u64 = 6364136223846793005;
const LCG_INC: u64 = 1442695040888963407;

fn lcg(state: u64) -> u64 {
    state.wrapping_mul(LCG_MUL).wrapping_add(LCG_INC)
}

/// A 1 GiB-reservation arena for benchmark loops.
pub fn bench_arena() -> Result<TenantArena, ArenaError> {
    TenantArena::new(ArenaConfig::new().with_reserve_bytes(1 << 30))
}

/// `n` allocation sizes from `seed`.
///
/// Roughly 15 in 16 land in 8..=512 bytes, the rest in 512..=16384,
/// except every 1024th size, which is just past the large threshold.
pub fn size_mix(n: usize, seed: u64) -> Vec<usize> {
    let mut state = seed;
    (0..n)
        .map(|i| {
            state = lcg(state);
            let r = (state >> 33) as usize;
            if i % 1024 == 1023 {
                LARGE_ALLOC_THRESHOLD + r % 4096
            } else if r % 16 == 0 {
                512 + r % (16384 - 512)
            } else {
                8 + r % 505
            }
        })
        .collect()
}

/// A mask over `bits` properties with about `density` of them set.
pub fn sparse_mask(bits: u32, density: f64, seed: u64) -> u64 {
    let mut state = seed;
    let mut mask = 0u64;
    for bit in 0..bits.min(64) {
        state = lcg(state);
        if ((state >> 11) as f64 / (1u64 << 53) as f64) < density {
            mask |= 1 << bit;
        }
    }
    mask
}
