//! Guest-side FPU register-file descriptor for the MIPS-derived CPU.
//!
//! The recompiler addresses every floating-point storage location of the
//! guest through one flat index space (see [`FpuReg`]): the 32 ordinary FPU
//! registers come first, then the 128 vector-unit lanes, then a small set of
//! compiler scratch slots that have no memory backing. This crate owns that
//! index space, the byte offsets of each slot inside the guest context
//! structure, and the expansion of vector-register identifiers into their
//! individual lanes.

use std::fmt;

use tracing::error;

/// Number of ordinary guest FPU registers (`f0..f31`).
pub const NUM_FPRS: usize = 32;

/// Number of vector-unit lanes (32 vectors of 4 lanes each).
pub const NUM_VFPU_LANES: usize = 128;

/// Number of compiler scratch slots.
///
/// Scratches are register-allocator temporaries with no memory backing: they
/// are never loaded from the context and never written back.
pub const NUM_TEMPS: usize = 16;

/// Flat index of the first scratch slot.
pub const TEMP0: usize = NUM_FPRS + NUM_VFPU_LANES;

/// Total size of the flat FPU index space.
pub const NUM_FPU_REGS: usize = NUM_FPRS + NUM_VFPU_LANES + NUM_TEMPS;

/// A guest floating-point register in the flat index space
/// `[0, 32 + 128 + 16)`.
///
/// Indices `[0, 32)` are the ordinary FPU registers, `[32, 160)` the
/// vector-unit lanes, and `[160, 176)` the compiler scratches. Use the
/// [`FpuReg::fpr`], [`FpuReg::vfpu`] and [`FpuReg::temp`] constructors rather
/// than raw indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FpuReg(pub u16);

impl FpuReg {
    /// Ordinary FPU register `f{n}`.
    #[inline]
    #[must_use]
    pub fn fpr(n: u8) -> Self {
        debug_assert!((n as usize) < NUM_FPRS);
        FpuReg(n as u16)
    }

    /// Vector-unit lane `v{lane}` (`lane < 128`).
    #[inline]
    #[must_use]
    pub fn vfpu(lane: u8) -> Self {
        FpuReg(NUM_FPRS as u16 + lane as u16)
    }

    /// Compiler scratch slot `t{n}`.
    #[inline]
    #[must_use]
    pub fn temp(n: u8) -> Self {
        debug_assert!((n as usize) < NUM_TEMPS);
        FpuReg(TEMP0 as u16 + n as u16)
    }

    /// Position in the flat index space.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this is a compiler scratch slot.
    #[inline]
    #[must_use]
    pub fn is_temp(self) -> bool {
        self.index() >= TEMP0
    }

    /// Whether this register has a slot in the guest context structure.
    ///
    /// Everything except the compiler scratches is memory-backed; a scratch
    /// must never be the source or target of a context load/store.
    #[inline]
    #[must_use]
    pub fn is_memory_backed(self) -> bool {
        !self.is_temp()
    }

    /// Byte offset of this register's slot inside the guest context
    /// structure.
    ///
    /// The context lays out the 32 integer registers first, then the FPU
    /// block addressed here, 4 bytes per slot. An out-of-range index is an
    /// internal error: it is logged and offset 0 is returned so emission can
    /// continue (downstream tests catch the misdirected access).
    #[must_use]
    pub fn ctx_offset(self) -> u32 {
        if self.index() < NUM_FPU_REGS {
            (self.0 as u32 + 32) * 4
        } else {
            error!("bad guest FPU register {}, out of range", self.0);
            0
        }
    }
}

impl fmt::Display for FpuReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let i = self.index();
        if i < NUM_FPRS {
            write!(f, "f{i}")
        } else if i < TEMP0 {
            write!(f, "v{}", i - NUM_FPRS)
        } else if i < NUM_FPU_REGS {
            write!(f, "t{}", i - TEMP0)
        } else {
            write!(f, "fpu#{i}")
        }
    }
}

/// Logical length of a vector operand, in lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VectorSize {
    Single = 1,
    Pair = 2,
    Triple = 3,
    Quad = 4,
}

impl VectorSize {
    /// Number of lanes covered by this size.
    #[inline]
    #[must_use]
    pub fn lanes(self) -> usize {
        self as usize
    }

    /// The size covering exactly `n` lanes, for `n` in `1..=4`.
    #[inline]
    #[must_use]
    pub fn from_lanes(n: usize) -> Option<VectorSize> {
        match n {
            1 => Some(VectorSize::Single),
            2 => Some(VectorSize::Pair),
            3 => Some(VectorSize::Triple),
            4 => Some(VectorSize::Quad),
            _ => None,
        }
    }
}

/// Identifier of a guest vector register.
///
/// The vector unit's 128 lanes form eight 4x4 matrices. The canonical 32
/// vectors are the matrix columns, whose lanes are consecutive in context
/// memory; row vectors access the transposed view and their lanes are 4
/// apart. The loader in the register cache exploits column contiguity to
/// combine lane accesses into multi-lane loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VecReg {
    mtx: u8,
    idx: u8,
    transposed: bool,
}

impl VecReg {
    /// Column `c` of matrix `m`: lanes `m*16 + c*4 .. +4`, consecutive in
    /// memory.
    #[inline]
    #[must_use]
    pub fn col(m: u8, c: u8) -> Self {
        debug_assert!(m < 8 && c < 4);
        VecReg {
            mtx: m,
            idx: c,
            transposed: false,
        }
    }

    /// Row `r` of matrix `m`: lanes `m*16 + r, +4, +8, +12`, 4 apart in
    /// memory.
    #[inline]
    #[must_use]
    pub fn row(m: u8, r: u8) -> Self {
        debug_assert!(m < 8 && r < 4);
        VecReg {
            mtx: m,
            idx: r,
            transposed: true,
        }
    }

    /// The full 4-lane expansion of this vector.
    ///
    /// Callers working with a narrower [`VectorSize`] use the prefix of the
    /// returned array; the trailing entries name the lanes a wider mapping of
    /// the same vector would cover.
    #[must_use]
    pub fn lanes(self) -> [u8; 4] {
        let base = self.mtx * 16;
        let mut out = [0u8; 4];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = if self.transposed {
                base + self.idx + (i as u8) * 4
            } else {
                base + self.idx * 4 + i as u8
            };
        }
        out
    }
}

impl fmt::Display for VecReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.transposed {
            write!(f, "m{}r{}", self.mtx, self.idx)
        } else {
            write!(f, "m{}c{}", self.mtx, self.idx)
        }
    }
}

/// Static analysis results for a guest basic block.
///
/// Produced by the front-end before translation and handed to each register
/// cache at block start. The FPU cache accepts these for interface parity
/// with the integer cache; it derives no allocation decisions from them.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisResults {
    /// Whether any instruction in the block touches an FPU or vector
    /// register.
    pub uses_fpu: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_index_space_partitions() {
        assert_eq!(FpuReg::fpr(0).index(), 0);
        assert_eq!(FpuReg::fpr(31).index(), 31);
        assert_eq!(FpuReg::vfpu(0).index(), 32);
        assert_eq!(FpuReg::vfpu(127).index(), 159);
        assert_eq!(FpuReg::temp(0).index(), 160);
        assert_eq!(FpuReg::temp(15).index(), 175);

        assert!(!FpuReg::fpr(5).is_temp());
        assert!(!FpuReg::vfpu(100).is_temp());
        assert!(FpuReg::temp(3).is_temp());
        assert!(!FpuReg::temp(3).is_memory_backed());
    }

    #[test]
    fn ctx_offsets_skip_integer_block() {
        assert_eq!(FpuReg::fpr(0).ctx_offset(), 128);
        assert_eq!(FpuReg::fpr(5).ctx_offset(), 148);
        assert_eq!(FpuReg::vfpu(0).ctx_offset(), (32 + 32) * 4);
        // Out of range falls back to 0.
        assert_eq!(FpuReg(500).ctx_offset(), 0);
    }

    #[test]
    fn column_lanes_are_consecutive() {
        assert_eq!(VecReg::col(0, 0).lanes(), [0, 1, 2, 3]);
        assert_eq!(VecReg::col(0, 2).lanes(), [8, 9, 10, 11]);
        assert_eq!(VecReg::col(3, 1).lanes(), [52, 53, 54, 55]);
    }

    #[test]
    fn row_lanes_are_strided() {
        assert_eq!(VecReg::row(0, 0).lanes(), [0, 4, 8, 12]);
        assert_eq!(VecReg::row(0, 3).lanes(), [3, 7, 11, 15]);
        assert_eq!(VecReg::row(7, 2).lanes(), [114, 118, 122, 126]);
    }

    #[test]
    fn vector_size_round_trips() {
        for sz in [
            VectorSize::Single,
            VectorSize::Pair,
            VectorSize::Triple,
            VectorSize::Quad,
        ] {
            assert_eq!(VectorSize::from_lanes(sz.lanes()), Some(sz));
        }
        assert_eq!(VectorSize::from_lanes(0), None);
        assert_eq!(VectorSize::from_lanes(5), None);
    }

    #[test]
    fn display_names_by_partition() {
        assert_eq!(FpuReg::fpr(7).to_string(), "f7");
        assert_eq!(FpuReg::vfpu(12).to_string(), "v12");
        assert_eq!(FpuReg::temp(2).to_string(), "t2");
        assert_eq!(VecReg::col(1, 2).to_string(), "m1c2");
        assert_eq!(VecReg::row(4, 0).to_string(), "m4r0");
    }
}
