//! Shared test support: an emitter double that records every operation the
//! register cache asks for, so tests can assert on exact op sequences.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use fennec_jit_arm::arm::{ArmFpReg, ArmGpr};
use fennec_jit_arm::emitter::FpuEmitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmittedOp {
    LoadScalar {
        dst: ArmFpReg,
        base: ArmGpr,
        offset: u32,
    },
    StoreScalar {
        src: ArmFpReg,
        base: ArmGpr,
        offset: u32,
    },
    MoveScalar {
        dst: ArmFpReg,
        src: ArmFpReg,
    },
    AddImmediate {
        dst: ArmGpr,
        base: ArmGpr,
        imm: u32,
    },
    LaneLoad {
        dst: ArmFpReg,
        lane: u8,
    },
    LaneStore {
        src: ArmFpReg,
        lane: u8,
    },
    VecLoad {
        dst: ArmFpReg,
        lane_count: u8,
    },
    VecStore {
        src: ArmFpReg,
        lane_count: u8,
    },
    VecStorePost {
        src: ArmFpReg,
        lane_count: u8,
    },
}

/// Records the operation stream instead of encoding instructions.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    pub ops: Vec<EmittedOp>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        RecordingEmitter::default()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    pub fn scalar_loads(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, EmittedOp::LoadScalar { .. }))
            .count()
    }

    pub fn scalar_stores(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, EmittedOp::StoreScalar { .. }))
            .count()
    }

    pub fn lane_loads(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, EmittedOp::LaneLoad { .. }))
            .count()
    }

    pub fn lane_stores(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, EmittedOp::LaneStore { .. }))
            .count()
    }

    pub fn vec_loads(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, EmittedOp::VecLoad { .. }))
            .count()
    }

    /// Multi-lane stores, counting both the plain and post-increment forms.
    pub fn vec_stores(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| {
                matches!(
                    op,
                    EmittedOp::VecStore { .. } | EmittedOp::VecStorePost { .. }
                )
            })
            .count()
    }

    /// Every store of any width.
    pub fn total_stores(&self) -> usize {
        self.scalar_stores() + self.lane_stores() + self.vec_stores()
    }

    /// Every load of any width.
    pub fn total_loads(&self) -> usize {
        self.scalar_loads() + self.lane_loads() + self.vec_loads()
    }

    /// Context offsets touched by scalar loads/stores, in emission order.
    pub fn scalar_offsets(&self) -> Vec<u32> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                EmittedOp::LoadScalar { offset, .. } | EmittedOp::StoreScalar { offset, .. } => {
                    Some(*offset)
                }
                _ => None,
            })
            .collect()
    }

    /// Offsets materialized for lane transfers, in emission order.
    pub fn lane_addresses(&self) -> Vec<u32> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                EmittedOp::AddImmediate { imm, .. } => Some(*imm),
                _ => None,
            })
            .collect()
    }
}

impl FpuEmitter for RecordingEmitter {
    fn load_scalar(&mut self, dst: ArmFpReg, base: ArmGpr, offset: u32) {
        self.ops.push(EmittedOp::LoadScalar { dst, base, offset });
    }

    fn store_scalar(&mut self, src: ArmFpReg, base: ArmGpr, offset: u32) {
        self.ops.push(EmittedOp::StoreScalar { src, base, offset });
    }

    fn move_scalar(&mut self, dst: ArmFpReg, src: ArmFpReg) {
        self.ops.push(EmittedOp::MoveScalar { dst, src });
    }

    fn add_immediate(&mut self, dst: ArmGpr, base: ArmGpr, imm: u32, _scratch: ArmGpr) {
        self.ops.push(EmittedOp::AddImmediate { dst, base, imm });
    }

    fn lane_load(&mut self, dst: ArmFpReg, _base: ArmGpr, lane: u8) {
        self.ops.push(EmittedOp::LaneLoad { dst, lane });
    }

    fn lane_store(&mut self, src: ArmFpReg, _base: ArmGpr, lane: u8) {
        self.ops.push(EmittedOp::LaneStore { src, lane });
    }

    fn vec_load(&mut self, dst: ArmFpReg, _base: ArmGpr, lane_count: u8) {
        self.ops.push(EmittedOp::VecLoad { dst, lane_count });
    }

    fn vec_store(&mut self, src: ArmFpReg, _base: ArmGpr, lane_count: u8) {
        self.ops.push(EmittedOp::VecStore { src, lane_count });
    }

    fn vec_store_post(&mut self, src: ArmFpReg, _base: ArmGpr, lane_count: u8) {
        self.ops.push(EmittedOp::VecStorePost { src, lane_count });
    }
}

/// The quad number behind whichever view `qmap_reg` returned.
pub fn quad_of(reg: ArmFpReg) -> u8 {
    match reg {
        ArmFpReg::D(d) => d / 2,
        ArmFpReg::Q(q) => q,
        ArmFpReg::S(s) => panic!("expected a quad view, got s{s}"),
    }
}
