//! ARM backend surface of the MIPS→ARM dynamic recompiler.
//!
//! This crate holds the host-side register model ([`arm`]), the host FP
//! capability flags ([`features`]), the slice of the instruction emitter the
//! register allocator drives ([`emitter`]), and the floating-point register
//! cache itself ([`fpu_cache`]), which maps guest FPU registers and vector
//! lanes onto host scalar and 128-bit SIMD registers during translation.

pub mod arm;
pub mod emitter;
pub mod features;
pub mod fpu_cache;

pub use arm::{ArmFpReg, ArmGpr, ADDR_SCRATCH_REG, CTX_REG, IMM_SCRATCH_REG};
pub use emitter::FpuEmitter;
pub use features::CpuFeatures;
pub use fpu_cache::{FpuRegCache, MapFlags};
