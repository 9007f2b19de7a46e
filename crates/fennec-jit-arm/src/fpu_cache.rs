//! Floating-point register cache for the MIPS→ARM recompiler.
//!
//! Decides, at code-emission time, which guest FPU registers live in which
//! host FP registers, when to load or spill them, and how to pack runs of
//! contiguous guest vector lanes into a single host quad when the host has
//! 128-bit SIMD. The cache tracks two cross-referenced tables (guest side
//! and host side) plus a per-quad table for the SIMD view; see the module
//! operations for the state machine.

use bitflags::bitflags;
use tracing::error;

use fennec_mips::{
    AnalysisResults, FpuReg, VecReg, VectorSize, NUM_FPU_REGS, NUM_TEMPS,
};

use crate::arm::{
    ArmFpReg, ADDR_SCRATCH_REG, CTX_REG, IMM_SCRATCH_REG, NUM_QUADS, NUM_SCALAR_FP_REGS,
};
use crate::emitter::FpuEmitter;
use crate::features::CpuFeatures;

bitflags! {
    /// Mapping-request flags.
    ///
    /// The empty set means "load from memory, read-only".
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        /// The caller will write the register; it must be stored back
        /// before the mapping is released.
        const DIRTY = 1 << 0;
        /// Skip the initial load; the caller immediately overwrites the
        /// whole register.
        const NOINIT = 1 << 1;
        /// Reserved. Immediate values are never cached for FP; requesting
        /// one is a translator bug.
        const INITIAL_VALUE = 1 << 2;
    }
}

/// Where a guest register currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    /// At home in the guest context structure.
    Mem,
    /// In a host scalar register, by scalar index.
    Scalar(u8),
    /// In one 32-bit lane of a host quad.
    QuadLane { q: u8, lane: u8 },
    /// Known-constant value. Defined for parity with the integer cache but
    /// never entered for FP.
    Imm,
}

#[derive(Debug, Clone, Copy)]
struct GuestState {
    loc: Loc,
    spill_lock: bool,
    temp_lock: bool,
}

impl GuestState {
    const INIT: GuestState = GuestState {
        loc: Loc::Mem,
        spill_lock: false,
        temp_lock: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HostScalarState {
    guest: Option<FpuReg>,
    dirty: bool,
}

impl HostScalarState {
    const FREE: HostScalarState = HostScalarState {
        guest: None,
        dirty: false,
    };
}

#[derive(Debug, Clone, Copy)]
struct QuadState {
    /// Guest vector whose prefix this quad holds.
    vec: Option<VecReg>,
    /// Individual guest lanes occupying each 32-bit slot.
    lanes: [Option<FpuReg>; 4],
    /// Logical occupied length.
    sz: Option<VectorSize>,
    dirty: bool,
    /// Map tick at the time of the last mapping; lowest is evicted first.
    age: u64,
}

impl QuadState {
    const FREE: QuadState = QuadState {
        vec: None,
        lanes: [None; 4],
        sz: None,
        dirty: false,
        age: 0,
    };

    fn is_free(&self) -> bool {
        self.vec.is_none() && self.lanes.iter().all(Option::is_none)
    }
}

/// One contiguous lane transfer within a quad: `lanes` 32-bit slots starting
/// at quad position `pos`, whose first guest slot is `base`.
#[derive(Debug, Clone, Copy)]
struct LaneTransfer {
    pos: u8,
    lanes: u8,
    base: FpuReg,
}

/// Decompose the live lanes in `lanes[lo..hi]` into the fewest transfers the
/// hardware can do: a run of lanes whose guest slots are consecutive in
/// memory becomes multi-lane transfers where the double-register alignment
/// allows (whole quad from position 0, pairs from even positions), single
/// lane transfers otherwise.
fn lane_transfers(lanes: &[Option<FpuReg>; 4], lo: usize, hi: usize) -> Vec<LaneTransfer> {
    let mut out = Vec::new();
    let mut i = lo;
    while i < hi {
        let Some(g) = lanes[i] else {
            i += 1;
            continue;
        };
        let mut run = 1;
        while i + run < hi {
            match lanes[i + run] {
                Some(next) if next.index() == g.index() + run => run += 1,
                _ => break,
            }
        }
        let mut j = 0;
        while j < run {
            let pos = i + j;
            let rem = run - j;
            let take = if pos == 0 && rem >= 4 {
                4
            } else if pos % 2 == 0 && rem >= 2 {
                2
            } else {
                1
            };
            out.push(LaneTransfer {
                pos: pos as u8,
                lanes: take as u8,
                base: FpuReg(g.0 + j as u16),
            });
            j += take;
        }
        i += run;
    }
    out
}

/// The floating-point register cache.
///
/// Owned by one translator; strictly single-threaded. All state is reset by
/// [`FpuRegCache::start`] at the top of every translated guest basic block,
/// and [`FpuRegCache::flush_all`] must run before any control transfer that
/// leaves the block.
pub struct FpuRegCache {
    features: CpuFeatures,
    guests: [GuestState; NUM_FPU_REGS],
    scalars: [HostScalarState; NUM_SCALAR_FP_REGS],
    quads: [QuadState; NUM_QUADS],
    map_tick: u64,
}

// Scalar allocation order without SIMD. S0-S1 stay reserved as emission
// scratch.
const ALLOC_ORDER: [u8; 14] = [2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

// With 128-bit SIMD the low end reserves a full quad (Q0 = S0-S3) for
// emission scratch and quad building; Q4-Q15 belong exclusively to the quad
// view, so scalars only ever allocate inside Q1-Q3.
const ALLOC_ORDER_SIMD: [u8; 12] = [4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

impl FpuRegCache {
    #[must_use]
    pub fn new(features: CpuFeatures) -> Self {
        FpuRegCache {
            features,
            guests: [GuestState::INIT; NUM_FPU_REGS],
            scalars: [HostScalarState::FREE; NUM_SCALAR_FP_REGS],
            quads: [QuadState::FREE; NUM_QUADS],
            map_tick: 0,
        }
    }

    /// Reset all mapping state at the top of a translated basic block.
    pub fn start(&mut self, _analysis: &AnalysisResults) {
        self.guests = [GuestState::INIT; NUM_FPU_REGS];
        self.scalars = [HostScalarState::FREE; NUM_SCALAR_FP_REGS];
        self.quads = [QuadState::FREE; NUM_QUADS];
        self.map_tick = 0;
    }

    fn alloc_order(&self) -> &'static [u8] {
        if self.features.simd128 {
            &ALLOC_ORDER_SIMD
        } else {
            &ALLOC_ORDER
        }
    }

    /// Whether quad `q` may be used by the quad view. Q0-Q3 alias the
    /// scalar bank and stay out of quad allocation.
    #[inline]
    #[must_use]
    pub fn mappable_quad(&self, q: u8) -> bool {
        self.features.simd128 && (4..NUM_QUADS as u8).contains(&q)
    }

    // ------------------------------------------------------------------
    // Scalar mapping engine
    // ------------------------------------------------------------------

    /// Map `r` into a host scalar register and return it.
    ///
    /// If `r` is already scalar-mapped, the existing register is returned
    /// and its dirty bit is OR-ed with the request. If `r` currently lives
    /// in a quad lane it is first flushed out of the quad, since a value
    /// must never be visible in two host registers at once. A fresh mapping
    /// loads the value from the context unless [`MapFlags::NOINIT`] is set
    /// or `r` is a scratch slot (scratches have no memory backing).
    ///
    /// Returns `None` when every allocatable slot is spill-locked; that is
    /// a translator bug and is logged.
    pub fn map_reg(
        &mut self,
        emit: &mut impl FpuEmitter,
        r: FpuReg,
        flags: MapFlags,
    ) -> Option<ArmFpReg> {
        if flags.contains(MapFlags::INITIAL_VALUE) {
            error!("immediate values are not cached for FP ({r})");
            return None;
        }
        match self.guests[r.index()].loc {
            Loc::Scalar(s) => {
                if self.scalars[s as usize].guest != Some(r) {
                    error!("register cache out of sync: {r} claims s{s}");
                }
                if flags.contains(MapFlags::DIRTY) {
                    self.scalars[s as usize].dirty = true;
                }
                return Some(ArmFpReg::S(s));
            }
            Loc::QuadLane { .. } => {
                // Resident in a SIMD lane; move it home before giving the
                // translator a scalar view of it.
                self.flush_guest(emit, r);
            }
            Loc::Imm => {
                error!("immediate in FP register {r}");
                self.guests[r.index()].loc = Loc::Mem;
            }
            Loc::Mem => {}
        }

        let order = self.alloc_order();
        for _ in 0..=order.len() {
            let free = order
                .iter()
                .copied()
                .find(|&s| self.scalars[s as usize].guest.is_none());
            if let Some(s) = free {
                self.scalars[s as usize] = HostScalarState {
                    guest: Some(r),
                    dirty: flags.contains(MapFlags::DIRTY),
                };
                if !flags.contains(MapFlags::NOINIT) && r.is_memory_backed() {
                    emit.load_scalar(ArmFpReg::S(s), CTX_REG, r.ctx_offset());
                }
                self.guests[r.index()].loc = Loc::Scalar(s);
                return Some(ArmFpReg::S(s));
            }

            // Nothing free: spill the first unlocked entry in allocation
            // order and rescan.
            let victim = order.iter().copied().find(|&s| {
                self.scalars[s as usize].guest.is_some_and(|g| {
                    !self.guests[g.index()].spill_lock && !self.guests[g.index()].temp_lock
                })
            });
            match victim {
                Some(s) => self.flush_host_scalar(emit, s),
                None => {
                    error!("out of spillable FP registers mapping {r}");
                    return None;
                }
            }
        }
        error!("FP allocation failed to converge mapping {r}");
        None
    }

    /// Scalar-map one vector-unit lane.
    pub fn map_reg_v(
        &mut self,
        emit: &mut impl FpuEmitter,
        lane: u8,
        flags: MapFlags,
    ) -> Option<ArmFpReg> {
        self.map_reg(emit, FpuReg::vfpu(lane), flags)
    }

    // ------------------------------------------------------------------
    // Operand-tuple helpers
    // ------------------------------------------------------------------
    //
    // These lock every named operand before mapping anything, so mapping
    // one operand can never evict another operand of the same instruction.

    /// Two read-only operands.
    pub fn map_in_in(&mut self, emit: &mut impl FpuEmitter, rd: FpuReg, rs: FpuReg) {
        self.spill_lock(&[rd, rs]);
        self.map_reg(emit, rd, MapFlags::empty());
        self.map_reg(emit, rs, MapFlags::empty());
        self.release_spill_lock(rd);
        self.release_spill_lock(rs);
    }

    /// One written destination plus one read operand.
    ///
    /// With `avoid_load`, an overlapping destination keeps its initial load
    /// (the caller reads what it writes); otherwise the destination maps
    /// `NOINIT | DIRTY` since the caller overwrites it in full.
    pub fn map_dirty_in(
        &mut self,
        emit: &mut impl FpuEmitter,
        rd: FpuReg,
        rs: FpuReg,
        avoid_load: bool,
    ) {
        self.spill_lock(&[rd, rs]);
        let overlap = avoid_load && rd == rs;
        let dflags = if overlap {
            MapFlags::DIRTY
        } else {
            MapFlags::DIRTY | MapFlags::NOINIT
        };
        self.map_reg(emit, rd, dflags);
        self.map_reg(emit, rs, MapFlags::empty());
        self.release_spill_lock(rd);
        self.release_spill_lock(rs);
    }

    /// One written destination plus two read operands.
    pub fn map_dirty_in_in(
        &mut self,
        emit: &mut impl FpuEmitter,
        rd: FpuReg,
        rs: FpuReg,
        rt: FpuReg,
        avoid_load: bool,
    ) {
        self.spill_lock(&[rd, rs, rt]);
        let overlap = avoid_load && (rd == rs || rd == rt);
        let dflags = if overlap {
            MapFlags::DIRTY
        } else {
            MapFlags::DIRTY | MapFlags::NOINIT
        };
        self.map_reg(emit, rd, dflags);
        self.map_reg(emit, rt, MapFlags::empty());
        self.map_reg(emit, rs, MapFlags::empty());
        self.release_spill_lock(rd);
        self.release_spill_lock(rs);
        self.release_spill_lock(rt);
    }

    /// Spill-lock and scalar-map every lane of `v`.
    pub fn map_regs_and_spill_lock_v(
        &mut self,
        emit: &mut impl FpuEmitter,
        v: VecReg,
        sz: VectorSize,
        flags: MapFlags,
    ) {
        self.spill_lock_v(v, sz);
        for &lane in &v.lanes()[..sz.lanes()] {
            self.map_reg_v(emit, lane, flags);
        }
    }

    /// Vector variant of [`FpuRegCache::map_in_in`], on the scalar view.
    pub fn map_in_in_v(
        &mut self,
        emit: &mut impl FpuEmitter,
        vs: VecReg,
        vt: VecReg,
        sz: VectorSize,
    ) {
        self.spill_lock_v(vs, sz);
        self.spill_lock_v(vt, sz);
        for &lane in &vs.lanes()[..sz.lanes()] {
            self.map_reg_v(emit, lane, MapFlags::empty());
        }
        for &lane in &vt.lanes()[..sz.lanes()] {
            self.map_reg_v(emit, lane, MapFlags::empty());
        }
        self.release_spill_lock_v(vs, sz);
        self.release_spill_lock_v(vt, sz);
    }

    /// Vector variant of [`FpuRegCache::map_dirty_in`], on the scalar view.
    pub fn map_dirty_in_v(
        &mut self,
        emit: &mut impl FpuEmitter,
        vd: VecReg,
        vs: VecReg,
        sz: VectorSize,
        avoid_load: bool,
    ) {
        let overlap = avoid_load && vd == vs;
        self.spill_lock_v(vd, sz);
        self.spill_lock_v(vs, sz);
        let dflags = if overlap {
            MapFlags::DIRTY
        } else {
            MapFlags::DIRTY | MapFlags::NOINIT
        };
        for &lane in &vd.lanes()[..sz.lanes()] {
            self.map_reg_v(emit, lane, dflags);
        }
        for &lane in &vs.lanes()[..sz.lanes()] {
            self.map_reg_v(emit, lane, MapFlags::empty());
        }
        self.release_spill_lock_v(vd, sz);
        self.release_spill_lock_v(vs, sz);
    }

    /// Vector variant of [`FpuRegCache::map_dirty_in_in`], on the scalar
    /// view.
    pub fn map_dirty_in_in_v(
        &mut self,
        emit: &mut impl FpuEmitter,
        vd: VecReg,
        vs: VecReg,
        vt: VecReg,
        sz: VectorSize,
        avoid_load: bool,
    ) {
        let overlap = avoid_load && (vd == vs || vd == vt);
        self.spill_lock_v(vd, sz);
        self.spill_lock_v(vs, sz);
        self.spill_lock_v(vt, sz);
        let dflags = if overlap {
            MapFlags::DIRTY
        } else {
            MapFlags::DIRTY | MapFlags::NOINIT
        };
        for &lane in &vd.lanes()[..sz.lanes()] {
            self.map_reg_v(emit, lane, dflags);
        }
        for &lane in &vs.lanes()[..sz.lanes()] {
            self.map_reg_v(emit, lane, MapFlags::empty());
        }
        for &lane in &vt.lanes()[..sz.lanes()] {
            self.map_reg_v(emit, lane, MapFlags::empty());
        }
        self.release_spill_lock_v(vd, sz);
        self.release_spill_lock_v(vs, sz);
        self.release_spill_lock_v(vt, sz);
    }

    /// Copy one vector lane into a specific host scalar: a plain move when
    /// the lane is already mapped, a map-then-move otherwise.
    pub fn load_to_reg_v(&mut self, emit: &mut impl FpuEmitter, dst: ArmFpReg, lane: u8) {
        let r = FpuReg::vfpu(lane);
        if let Loc::Scalar(s) = self.guests[r.index()].loc {
            emit.move_scalar(dst, ArmFpReg::S(s));
        } else if let Some(src) = self.map_reg(emit, r, MapFlags::empty()) {
            emit.move_scalar(dst, src);
        }
    }

    // ------------------------------------------------------------------
    // Spill locks and scratches
    // ------------------------------------------------------------------

    /// Pin `regs` against eviction for the current guest instruction.
    pub fn spill_lock(&mut self, regs: &[FpuReg]) {
        for &r in regs {
            self.guests[r.index()].spill_lock = true;
        }
    }

    pub fn release_spill_lock(&mut self, r: FpuReg) {
        self.guests[r.index()].spill_lock = false;
    }

    /// Pin every lane of `v` against eviction.
    pub fn spill_lock_v(&mut self, v: VecReg, sz: VectorSize) {
        for &lane in &v.lanes()[..sz.lanes()] {
            self.guests[FpuReg::vfpu(lane).index()].spill_lock = true;
        }
    }

    pub fn release_spill_lock_v(&mut self, v: VecReg, sz: VectorSize) {
        for &lane in &v.lanes()[..sz.lanes()] {
            self.guests[FpuReg::vfpu(lane).index()].spill_lock = false;
        }
    }

    /// Hand out a free scratch slot, `temp_lock`ed until released.
    ///
    /// Returns `None` (logged) when every scratch is taken; the translator
    /// must discard some.
    pub fn alloc_scratch(&mut self) -> Option<FpuReg> {
        for n in 0..NUM_TEMPS {
            let r = FpuReg::temp(n as u8);
            let g = &mut self.guests[r.index()];
            if g.loc == Loc::Mem && !g.temp_lock {
                g.temp_lock = true;
                return Some(r);
            }
        }
        error!("out of FPU scratch slots");
        None
    }

    /// Whether `h` currently holds a compiler scratch.
    #[must_use]
    pub fn is_temp(&self, h: ArmFpReg) -> bool {
        match h {
            ArmFpReg::S(s) => self.scalars[s as usize]
                .guest
                .is_some_and(FpuReg::is_temp),
            ArmFpReg::D(_) | ArmFpReg::Q(_) => false,
        }
    }

    /// Clear every spill lock and discard every scratch slot. Called at
    /// guest-instruction boundaries.
    pub fn release_locks_and_discard_temps(&mut self) {
        for g in self.guests.iter_mut() {
            g.spill_lock = false;
        }
        for n in 0..NUM_TEMPS {
            self.discard_guest(FpuReg::temp(n as u8));
        }
    }

    // ------------------------------------------------------------------
    // Flush and discard
    // ------------------------------------------------------------------

    fn flush_host_scalar(&mut self, emit: &mut impl FpuEmitter, s: u8) {
        let entry = self.scalars[s as usize];
        let Some(g) = entry.guest else {
            if entry.dirty {
                error!("dirty host scalar s{s} has no guest owner");
                self.scalars[s as usize].dirty = false;
            }
            return;
        };
        if self.guests[g.index()].loc == Loc::Scalar(s) {
            if entry.dirty && g.is_memory_backed() {
                emit.store_scalar(ArmFpReg::S(s), CTX_REG, g.ctx_offset());
            }
            self.guests[g.index()].loc = Loc::Mem;
        } else {
            // Guest side is authoritative; drop the stale host entry.
            error!("cross-reference mismatch: s{s} claims {g}, which lives elsewhere");
        }
        self.scalars[s as usize] = HostScalarState::FREE;
    }

    /// Flush one host register: write back if dirty and clear both sides of
    /// the cross-reference. Doubles and quads dispatch to the quad flush.
    pub fn flush_host_reg(&mut self, emit: &mut impl FpuEmitter, h: ArmFpReg) {
        match h {
            ArmFpReg::S(s) => self.flush_host_scalar(emit, s),
            ArmFpReg::D(d) => self.qflush(emit, d / 2),
            ArmFpReg::Q(q) => self.qflush(emit, q),
        }
    }

    /// Flush one guest register back to the context.
    ///
    /// A guest living in a quad lane gets a surgical lane-store: the other
    /// lanes of the quad stay mapped and only this lane's cross-reference is
    /// cleared. Flushing a memory-resident guest is a no-op.
    pub fn flush_guest(&mut self, emit: &mut impl FpuEmitter, r: FpuReg) {
        match self.guests[r.index()].loc {
            Loc::Imm => {
                error!("immediate in FP register {r}");
            }
            Loc::Scalar(s) => {
                if self.scalars[s as usize].guest == Some(r) {
                    if self.scalars[s as usize].dirty && r.is_memory_backed() {
                        emit.store_scalar(ArmFpReg::S(s), CTX_REG, r.ctx_offset());
                    }
                    self.scalars[s as usize] = HostScalarState::FREE;
                } else {
                    error!("cross-reference mismatch: {r} claims s{s}, held by another guest");
                }
            }
            Loc::QuadLane { q, lane } => {
                if self.quads[q as usize].lanes[lane as usize] == Some(r) {
                    self.flush_quad_lane(emit, q, lane);
                } else {
                    error!("cross-reference mismatch: {r} claims q{q} lane {lane}");
                }
            }
            Loc::Mem => return,
        }
        self.guests[r.index()].loc = Loc::Mem;
    }

    /// Drop one guest register without writing it back.
    pub fn discard_guest(&mut self, r: FpuReg) {
        match self.guests[r.index()].loc {
            Loc::Imm => {
                error!("immediate in FP register {r}");
            }
            Loc::Scalar(s) => {
                if self.scalars[s as usize].guest == Some(r) {
                    self.scalars[s as usize] = HostScalarState::FREE;
                } else {
                    error!("cross-reference mismatch: {r} claims s{s}, held by another guest");
                }
            }
            Loc::QuadLane { q, lane } => {
                if self.quads[q as usize].lanes[lane as usize] == Some(r) {
                    self.quads[q as usize].lanes[lane as usize] = None;
                    self.refresh_quad_extent(q);
                } else {
                    error!("cross-reference mismatch: {r} claims q{q} lane {lane}");
                }
            }
            Loc::Mem => {}
        }
        let g = &mut self.guests[r.index()];
        g.loc = Loc::Mem;
        g.spill_lock = false;
        g.temp_lock = false;
    }

    /// Store the lane holding `quads[q].lanes[lane]` (if the quad is dirty)
    /// and remove it from the quad.
    fn flush_quad_lane(&mut self, emit: &mut impl FpuEmitter, q: u8, lane: u8) {
        let qi = q as usize;
        let Some(g) = self.quads[qi].lanes[lane as usize] else {
            return;
        };
        if self.quads[qi].dirty && g.is_memory_backed() {
            emit.add_immediate(ADDR_SCRATCH_REG, CTX_REG, g.ctx_offset(), IMM_SCRATCH_REG);
            emit.lane_store(ArmFpReg::Q(q), ADDR_SCRATCH_REG, lane);
        }
        self.quads[qi].lanes[lane as usize] = None;
        self.guests[g.index()].loc = Loc::Mem;
        self.refresh_quad_extent(q);
    }

    /// Recompute a quad's logical extent after lanes left it; release the
    /// quad entirely when its last lane is gone.
    fn refresh_quad_extent(&mut self, q: u8) {
        let qi = q as usize;
        match self.quads[qi].lanes.iter().rposition(Option::is_some) {
            Some(last) => self.quads[qi].sz = VectorSize::from_lanes(last + 1),
            None => self.quads[qi] = QuadState::FREE,
        }
    }

    /// Flush everything and leave both host tables empty. Called before any
    /// control transfer out of the translated block.
    pub fn flush_all(&mut self, emit: &mut impl FpuEmitter) {
        for n in 0..NUM_TEMPS {
            self.discard_guest(FpuReg::temp(n as u8));
        }
        for q in 0..NUM_QUADS as u8 {
            self.qflush(emit, q);
        }
        for i in 0..NUM_FPU_REGS {
            self.flush_guest(emit, FpuReg(i as u16));
        }
        // Sanity walk; anything still mapped is a bug.
        self.audit();
    }

    // ------------------------------------------------------------------
    // Quad mapping engine
    // ------------------------------------------------------------------

    /// Map the first `sz` lanes of vector `v` into one host quad.
    ///
    /// An existing quad whose lane prefix matches is reused: a superset
    /// mapping is shrunk (trailing lanes written back if dirty), a partial
    /// prefix is extended in place with per-lane loads. Otherwise a free
    /// mappable quad is claimed, evicting the least-recently-mapped quad if
    /// none is free. Lanes currently held elsewhere are flushed home first
    /// so the value exists in exactly one host register.
    ///
    /// Returns the double alias for `Single`/`Pair` (narrow SIMD
    /// instructions can address it), the quad view for `Triple`/`Quad`, or
    /// `None` on a host without 128-bit SIMD.
    pub fn qmap_reg(
        &mut self,
        emit: &mut impl FpuEmitter,
        v: VecReg,
        sz: VectorSize,
        flags: MapFlags,
    ) -> Option<ArmFpReg> {
        if !self.features.simd128 {
            error!("quad mapping of {v} on a host without 128-bit SIMD");
            return None;
        }
        if flags.contains(MapFlags::INITIAL_VALUE) {
            error!("immediate values are not cached for FP ({v})");
            return None;
        }
        let n = sz.lanes();
        let expansion = v.lanes();
        let mut l = [FpuReg(0); 4];
        for (slot, &lane) in l.iter_mut().zip(expansion.iter()) {
            *slot = FpuReg::vfpu(lane);
        }

        self.map_tick += 1;
        let tick = self.map_tick;

        // Longest lane-prefix match over the mappable quads; first quad
        // with the longest prefix wins.
        let mut best: Option<(u8, usize)> = None;
        for q in 0..NUM_QUADS as u8 {
            if !self.mappable_quad(q) {
                continue;
            }
            let lanes = self.quads[q as usize].lanes;
            let mut k = 0;
            while k < n && lanes[k] == Some(l[k]) {
                k += 1;
            }
            if k > 0 && best.is_none_or(|(_, bk)| k > bk) {
                best = Some((q, k));
            }
        }

        if let Some((q, k)) = best {
            let qi = q as usize;
            if k < n {
                // Partial prefix: extend in place, one lane at a time.
                for (i, &g) in l.iter().enumerate().take(n).skip(k) {
                    if self.guests[g.index()].loc != Loc::Mem {
                        self.flush_guest(emit, g);
                    }
                    // A stray resident of the slot would be clobbered by the
                    // lane load; move it home first.
                    self.flush_quad_lane(emit, q, i as u8);
                    emit.add_immediate(
                        ADDR_SCRATCH_REG,
                        CTX_REG,
                        g.ctx_offset(),
                        IMM_SCRATCH_REG,
                    );
                    emit.lane_load(ArmFpReg::Q(q), ADDR_SCRATCH_REG, i as u8);
                    self.quads[qi].lanes[i] = Some(g);
                    self.guests[g.index()].loc = Loc::QuadLane { q, lane: i as u8 };
                }
            }
            if self.quads[qi].lanes[n..].iter().any(Option::is_some) {
                // The existing mapping was wider than requested; wipe the
                // stray trailing lanes.
                self.shrink_quad(emit, q, n);
            }
            let quad = &mut self.quads[qi];
            quad.vec = Some(v);
            quad.sz = Some(sz);
            quad.dirty |= flags.contains(MapFlags::DIRTY);
            quad.age = tick;
            return Some(Self::quad_alias(q, sz));
        }

        // No match anywhere: claim a free quad, evicting the
        // least-recently-mapped one if the table is full.
        for _ in 0..=NUM_QUADS {
            let free = (0..NUM_QUADS as u8)
                .find(|&q| self.mappable_quad(q) && self.quads[q as usize].is_free());
            let Some(q) = free else {
                let victim = (0..NUM_QUADS as u8)
                    .filter(|&q| self.mappable_quad(q) && !self.quads[q as usize].is_free())
                    .min_by_key(|&q| self.quads[q as usize].age);
                match victim {
                    Some(vq) => {
                        self.qflush(emit, vq);
                        continue;
                    }
                    None => {
                        error!("no mappable quads available for {v}");
                        return None;
                    }
                }
            };

            // Lanes held elsewhere must come home before the reload.
            for &g in l.iter().take(n) {
                if self.guests[g.index()].loc != Loc::Mem {
                    self.flush_guest(emit, g);
                }
            }
            self.qflush(emit, q);

            if !flags.contains(MapFlags::NOINIT) {
                let mut staged = [None; 4];
                for (slot, &g) in staged.iter_mut().zip(l.iter()).take(n) {
                    *slot = Some(g);
                }
                Self::emit_quad_loads(emit, q, &staged, n);
            }

            let qi = q as usize;
            for (i, &g) in l.iter().enumerate().take(n) {
                self.quads[qi].lanes[i] = Some(g);
                self.guests[g.index()].loc = Loc::QuadLane { q, lane: i as u8 };
            }
            let quad = &mut self.quads[qi];
            quad.vec = Some(v);
            quad.sz = Some(sz);
            quad.dirty = flags.contains(MapFlags::DIRTY);
            quad.age = tick;
            return Some(Self::quad_alias(q, sz));
        }
        error!("quad allocation failed to converge for {v}");
        None
    }

    fn quad_alias(q: u8, sz: VectorSize) -> ArmFpReg {
        if sz.lanes() <= 2 {
            ArmFpReg::quad_as_d(q)
        } else {
            ArmFpReg::quad_as_q(q)
        }
    }

    /// Flush quad `q`: write the live lanes back (fewest stores possible)
    /// and release the mapping. No-op for non-mappable or free quads.
    pub fn qflush(&mut self, emit: &mut impl FpuEmitter, q: u8) {
        if !self.mappable_quad(q) {
            return;
        }
        let qi = q as usize;
        if self.quads[qi].is_free() {
            return;
        }
        if self.quads[qi].dirty {
            self.emit_quad_stores(emit, q, 0, 4);
        }
        for g in self.quads[qi].lanes.into_iter().flatten() {
            self.guests[g.index()].loc = Loc::Mem;
        }
        self.quads[qi] = QuadState::FREE;
    }

    /// Write back and drop the lanes at positions `keep..` of quad `q`,
    /// leaving the prefix mapped.
    fn shrink_quad(&mut self, emit: &mut impl FpuEmitter, q: u8, keep: usize) {
        let qi = q as usize;
        if self.quads[qi].dirty {
            self.emit_quad_stores(emit, q, keep, 4);
        }
        for i in keep..4 {
            if let Some(g) = self.quads[qi].lanes[i] {
                self.guests[g.index()].loc = Loc::Mem;
                self.quads[qi].lanes[i] = None;
            }
        }
    }

    /// Store the live lanes in `q`'s positions `lo..hi` with the fewest
    /// transfers: one multi-lane store per memory-consecutive run (split on
    /// double-register alignment), one lane-store otherwise. A run that
    /// continues into the next transfer uses the post-increment form so the
    /// follow-up store needs no fresh address.
    fn emit_quad_stores(&self, emit: &mut impl FpuEmitter, q: u8, lo: usize, hi: usize) {
        let transfers = lane_transfers(&self.quads[q as usize].lanes, lo, hi);
        let mut cursor: Option<u32> = None;
        for (i, t) in transfers.iter().enumerate() {
            let off = t.base.ctx_offset();
            if cursor != Some(off) {
                emit.add_immediate(ADDR_SCRATCH_REG, CTX_REG, off, IMM_SCRATCH_REG);
            }
            if t.lanes == 1 {
                emit.lane_store(ArmFpReg::Q(q), ADDR_SCRATCH_REG, t.pos);
                cursor = Some(off);
            } else {
                let src = ArmFpReg::D(q * 2 + t.pos / 2);
                let end = off + 4 * t.lanes as u32;
                let continues =
                    transfers.get(i + 1).map(|next| next.base.ctx_offset()) == Some(end);
                if continues {
                    emit.vec_store_post(src, ADDR_SCRATCH_REG, t.lanes);
                    cursor = Some(end);
                } else {
                    emit.vec_store(src, ADDR_SCRATCH_REG, t.lanes);
                    cursor = Some(off);
                }
            }
        }
    }

    /// Load the staged lanes into quad `q` with the fewest transfers.
    fn emit_quad_loads(
        emit: &mut impl FpuEmitter,
        q: u8,
        staged: &[Option<FpuReg>; 4],
        n: usize,
    ) {
        for t in lane_transfers(staged, 0, n) {
            emit.add_immediate(
                ADDR_SCRATCH_REG,
                CTX_REG,
                t.base.ctx_offset(),
                IMM_SCRATCH_REG,
            );
            if t.lanes == 1 {
                emit.lane_load(ArmFpReg::Q(q), ADDR_SCRATCH_REG, t.pos);
            } else {
                emit.vec_load(ArmFpReg::D(q * 2 + t.pos / 2), ADDR_SCRATCH_REG, t.lanes);
            }
        }
    }

    // ------------------------------------------------------------------
    // Accessors and diagnostics
    // ------------------------------------------------------------------

    /// The host register currently holding `r`.
    ///
    /// The guest must have been mapped: an unmapped guest is a translator
    /// bug (logged, returns `None`). A quad-resident guest reports the quad
    /// view.
    #[must_use]
    pub fn host(&self, r: FpuReg) -> Option<ArmFpReg> {
        match self.guests[r.index()].loc {
            Loc::Scalar(s) => Some(ArmFpReg::S(s)),
            Loc::QuadLane { q, .. } => Some(ArmFpReg::Q(q)),
            Loc::Mem | Loc::Imm => {
                error!("{r} is not in a host register");
                None
            }
        }
    }

    /// [`FpuRegCache::host`] for a vector-unit lane.
    #[must_use]
    pub fn host_v(&self, lane: u8) -> Option<ArmFpReg> {
        self.host(FpuReg::vfpu(lane))
    }

    /// Whether `r` currently lives in a host register.
    #[must_use]
    pub fn is_mapped(&self, r: FpuReg) -> bool {
        !matches!(self.guests[r.index()].loc, Loc::Mem)
    }

    /// Number of occupied host-side entries (scalar slots plus quad lanes).
    #[must_use]
    pub fn live_host_entries(&self) -> usize {
        let scalars = self.scalars.iter().filter(|s| s.guest.is_some()).count();
        let lanes = self
            .quads
            .iter()
            .flat_map(|q| q.lanes.iter())
            .filter(|l| l.is_some())
            .count();
        scalars + lanes
    }

    /// Walk both tables and log every cross-reference violation; returns the
    /// number found. Zero after any public operation, or the cache has a
    /// bug.
    pub fn audit(&self) -> usize {
        let mut failures = 0;
        let bank = self.features.num_scalar_fp_regs();

        for (s, entry) in self.scalars[..bank].iter().enumerate() {
            if let Some(g) = entry.guest {
                if self.guests[g.index()].loc != (Loc::Scalar(s as u8)) {
                    error!("audit: s{s} claims {g}, which does not point back");
                    failures += 1;
                }
            } else if entry.dirty {
                error!("audit: dirty host scalar s{s} has no guest owner");
                failures += 1;
            }
        }

        for (q, quad) in self.quads.iter().enumerate() {
            for (lane, slot) in quad.lanes.iter().enumerate() {
                if let Some(g) = *slot {
                    let expect = Loc::QuadLane {
                        q: q as u8,
                        lane: lane as u8,
                    };
                    if self.guests[g.index()].loc != expect {
                        error!("audit: q{q} lane {lane} claims {g}, which does not point back");
                        failures += 1;
                    }
                }
            }
            if quad.vec.is_some() && quad.lanes.iter().all(Option::is_none) {
                error!("audit: q{q} names a vector but holds no lanes");
                failures += 1;
            }
        }

        for i in 0..NUM_FPU_REGS {
            let r = FpuReg(i as u16);
            match self.guests[i].loc {
                Loc::Scalar(s) => {
                    if self.scalars[s as usize].guest != Some(r) {
                        error!("audit: {r} claims s{s}, which holds something else");
                        failures += 1;
                    }
                }
                Loc::QuadLane { q, lane } => {
                    if self.quads[q as usize].lanes[lane as usize] != Some(r) {
                        error!("audit: {r} claims q{q} lane {lane}, which holds something else");
                        failures += 1;
                    }
                }
                Loc::Imm => {
                    error!("audit: immediate in FP register {r}");
                    failures += 1;
                }
                Loc::Mem => {}
            }
        }

        failures
    }
}
