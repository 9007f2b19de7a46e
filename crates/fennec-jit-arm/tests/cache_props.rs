//! Property tests: no sequence of public operations may break the cache's
//! cross-reference invariants, leak a mapping past a full flush, or touch
//! the memory image of a scratch slot.

mod common;

use common::RecordingEmitter;
use fennec_jit_arm::{CpuFeatures, FpuRegCache, MapFlags};
use fennec_mips::{AnalysisResults, FpuReg, VecReg, VectorSize, TEMP0};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
    Map { r: u8, dirty: bool, noinit: bool },
    MapDirtyIn { rd: u8, rs: u8, avoid: bool },
    MapDirtyInIn { rd: u8, rs: u8, rt: u8, avoid: bool },
    FlushGuest(u8),
    Discard(u8),
    SpillLock(u8),
    QMap { v: u8, sz: u8, dirty: bool },
    QFlush(u8),
    AllocScratch,
    ReleaseLocks,
    FlushAll,
}

/// Small operand universe: a few FPRs plus the lanes of matrices 0-1, so
/// scalar and quad mappings collide often.
fn guest_reg(sel: u8) -> FpuReg {
    if sel < 8 {
        FpuReg::fpr(sel)
    } else {
        FpuReg::vfpu((sel - 8) % 32)
    }
}

fn vec_reg(sel: u8) -> VecReg {
    let m = (sel / 8) % 2;
    let i = sel % 4;
    if (sel / 4) % 2 == 0 {
        VecReg::col(m, i)
    } else {
        VecReg::row(m, i)
    }
}

fn vec_size(sel: u8) -> VectorSize {
    match sel % 4 {
        0 => VectorSize::Single,
        1 => VectorSize::Pair,
        2 => VectorSize::Triple,
        _ => VectorSize::Quad,
    }
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..40, any::<bool>(), any::<bool>())
            .prop_map(|(r, dirty, noinit)| Op::Map { r, dirty, noinit }),
        (0u8..40, 0u8..40, any::<bool>()).prop_map(|(rd, rs, avoid)| Op::MapDirtyIn {
            rd,
            rs,
            avoid
        }),
        (0u8..40, 0u8..40, 0u8..40, any::<bool>()).prop_map(|(rd, rs, rt, avoid)| {
            Op::MapDirtyInIn { rd, rs, rt, avoid }
        }),
        (0u8..40).prop_map(Op::FlushGuest),
        (0u8..40).prop_map(Op::Discard),
        (0u8..40).prop_map(Op::SpillLock),
        (0u8..16, 0u8..4, any::<bool>()).prop_map(|(v, sz, dirty)| Op::QMap { v, sz, dirty }),
        (0u8..16).prop_map(Op::QFlush),
        any::<bool>().prop_map(|alloc| if alloc {
            Op::AllocScratch
        } else {
            Op::ReleaseLocks
        }),
        Just(Op::FlushAll),
    ]
}

fn apply(cache: &mut FpuRegCache, emit: &mut RecordingEmitter, op: Op) {
    match op {
        Op::Map { r, dirty, noinit } => {
            let mut flags = MapFlags::empty();
            if dirty {
                flags |= MapFlags::DIRTY;
            }
            if noinit {
                flags |= MapFlags::NOINIT;
            }
            cache.map_reg(emit, guest_reg(r), flags);
        }
        Op::MapDirtyIn { rd, rs, avoid } => {
            cache.map_dirty_in(emit, guest_reg(rd), guest_reg(rs), avoid);
        }
        Op::MapDirtyInIn { rd, rs, rt, avoid } => {
            cache.map_dirty_in_in(emit, guest_reg(rd), guest_reg(rs), guest_reg(rt), avoid);
        }
        Op::FlushGuest(r) => cache.flush_guest(emit, guest_reg(r)),
        Op::Discard(r) => cache.discard_guest(guest_reg(r)),
        Op::SpillLock(r) => cache.spill_lock(&[guest_reg(r)]),
        Op::QMap { v, sz, dirty } => {
            let flags = if dirty {
                MapFlags::DIRTY
            } else {
                MapFlags::empty()
            };
            cache.qmap_reg(emit, vec_reg(v), vec_size(sz), flags);
        }
        Op::QFlush(q) => cache.qflush(emit, q),
        Op::AllocScratch => {
            cache.alloc_scratch();
        }
        Op::ReleaseLocks => cache.release_locks_and_discard_temps(),
        Op::FlushAll => cache.flush_all(emit),
    }
}

/// First context offset past the memory-backed registers; no emitted access
/// may reach it.
const SCRATCH_OFFSET_FLOOR: u32 = (TEMP0 as u32 + 32) * 4;

fn run_sequence(features: CpuFeatures, ops: &[Op]) {
    let mut cache = FpuRegCache::new(features);
    cache.start(&AnalysisResults::default());
    let mut emit = RecordingEmitter::new();

    for &op in ops {
        apply(&mut cache, &mut emit, op);
        assert_eq!(
            cache.audit(),
            0,
            "cross-reference violation after {op:?}"
        );
    }

    cache.flush_all(&mut emit);
    assert_eq!(cache.audit(), 0);
    assert_eq!(
        cache.live_host_entries(),
        0,
        "flush_all left a host entry occupied"
    );

    for off in emit.scalar_offsets() {
        assert!(
            off < SCRATCH_OFFSET_FLOOR,
            "scalar access to scratch slot at offset {off}"
        );
    }
    for off in emit.lane_addresses() {
        assert!(
            off < SCRATCH_OFFSET_FLOOR,
            "lane access to scratch slot at offset {off}"
        );
    }
}

proptest! {
    #[test]
    fn invariants_hold_with_simd(ops in prop::collection::vec(op_strategy(), 1..48)) {
        run_sequence(CpuFeatures::with_simd128(), &ops);
    }

    #[test]
    fn invariants_hold_scalar_only(ops in prop::collection::vec(op_strategy(), 1..48)) {
        run_sequence(CpuFeatures::scalar_only(), &ops);
    }

    // A mapped register answers its own host lookup, and mapping twice in a
    // row is stable.
    #[test]
    fn mapping_is_stable(sel in 0u8..40, dirty in any::<bool>()) {
        let mut cache = FpuRegCache::new(CpuFeatures::with_simd128());
        cache.start(&AnalysisResults::default());
        let mut emit = RecordingEmitter::new();

        let r = guest_reg(sel);
        let flags = if dirty { MapFlags::DIRTY } else { MapFlags::empty() };
        let first = cache.map_reg(&mut emit, r, flags);
        prop_assert!(first.is_some());
        let loads = emit.total_loads();

        let second = cache.map_reg(&mut emit, r, flags);
        prop_assert_eq!(first, second);
        prop_assert_eq!(cache.host(r), first);
        prop_assert_eq!(emit.total_loads(), loads);
    }
}
