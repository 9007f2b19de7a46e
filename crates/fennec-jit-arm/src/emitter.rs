//! The slice of the ARM instruction emitter the register cache drives.
//!
//! The cache only ever asks for context loads/stores, register moves, lane
//! transfers and the address arithmetic feeding them; instruction encoding
//! is entirely the emitter's concern. The trait is infallible by design:
//! emission appends to a preallocated code buffer and cannot fail at this
//! layer.

use crate::arm::{ArmFpReg, ArmGpr};

/// FP emission operations consumed by the register cache.
///
/// Register-width expectations follow the operation: `load_scalar` /
/// `store_scalar` / `move_scalar` take scalar (`S`) registers, `lane_load` /
/// `lane_store` take the quad (`Q`) view, and `vec_load` / `vec_store` take
/// the double (`D`) alias of the quad being transferred, with `lane_count`
/// naming how many consecutive 32-bit lanes move.
pub trait FpuEmitter {
    /// Load a scalar from `[base + offset]`.
    fn load_scalar(&mut self, dst: ArmFpReg, base: ArmGpr, offset: u32);

    /// Store a scalar to `[base + offset]`.
    fn store_scalar(&mut self, src: ArmFpReg, base: ArmGpr, offset: u32);

    /// Register-to-register scalar move.
    fn move_scalar(&mut self, dst: ArmFpReg, src: ArmFpReg);

    /// `dst = base + imm`, clobbering `scratch` if the immediate does not
    /// encode directly.
    fn add_immediate(&mut self, dst: ArmGpr, base: ArmGpr, imm: u32, scratch: ArmGpr);

    /// Load one 32-bit lane of `dst` from `[base]`.
    fn lane_load(&mut self, dst: ArmFpReg, base: ArmGpr, lane: u8);

    /// Store one 32-bit lane of `src` to `[base]`.
    fn lane_store(&mut self, src: ArmFpReg, base: ArmGpr, lane: u8);

    /// Load `lane_count` consecutive 32-bit lanes from `[base]`.
    fn vec_load(&mut self, dst: ArmFpReg, base: ArmGpr, lane_count: u8);

    /// Store `lane_count` consecutive 32-bit lanes to `[base]`.
    fn vec_store(&mut self, src: ArmFpReg, base: ArmGpr, lane_count: u8);

    /// As [`FpuEmitter::vec_store`], post-incrementing `base` past the
    /// stored lanes so a follow-up transfer can continue without a fresh
    /// address computation.
    fn vec_store_post(&mut self, src: ArmFpReg, base: ArmGpr, lane_count: u8);
}

impl<T: FpuEmitter + ?Sized> FpuEmitter for &mut T {
    #[inline]
    fn load_scalar(&mut self, dst: ArmFpReg, base: ArmGpr, offset: u32) {
        <T as FpuEmitter>::load_scalar(&mut **self, dst, base, offset)
    }

    #[inline]
    fn store_scalar(&mut self, src: ArmFpReg, base: ArmGpr, offset: u32) {
        <T as FpuEmitter>::store_scalar(&mut **self, src, base, offset)
    }

    #[inline]
    fn move_scalar(&mut self, dst: ArmFpReg, src: ArmFpReg) {
        <T as FpuEmitter>::move_scalar(&mut **self, dst, src)
    }

    #[inline]
    fn add_immediate(&mut self, dst: ArmGpr, base: ArmGpr, imm: u32, scratch: ArmGpr) {
        <T as FpuEmitter>::add_immediate(&mut **self, dst, base, imm, scratch)
    }

    #[inline]
    fn lane_load(&mut self, dst: ArmFpReg, base: ArmGpr, lane: u8) {
        <T as FpuEmitter>::lane_load(&mut **self, dst, base, lane)
    }

    #[inline]
    fn lane_store(&mut self, src: ArmFpReg, base: ArmGpr, lane: u8) {
        <T as FpuEmitter>::lane_store(&mut **self, src, base, lane)
    }

    #[inline]
    fn vec_load(&mut self, dst: ArmFpReg, base: ArmGpr, lane_count: u8) {
        <T as FpuEmitter>::vec_load(&mut **self, dst, base, lane_count)
    }

    #[inline]
    fn vec_store(&mut self, src: ArmFpReg, base: ArmGpr, lane_count: u8) {
        <T as FpuEmitter>::vec_store(&mut **self, src, base, lane_count)
    }

    #[inline]
    fn vec_store_post(&mut self, src: ArmFpReg, base: ArmGpr, lane_count: u8) {
        <T as FpuEmitter>::vec_store_post(&mut **self, src, base, lane_count)
    }
}
