//! Guest instruction decoding.
//!
//! Wraps `iced-x86` ("a proven, table-driven decoder backend... to get
//! broad ISA coverage immediately without per-instruction allocations" —
//! the same justification the teacher gives for this dependency) behind a
//! small, pcjit-specific `DecodedInsn` so the interpreter and JIT emit
//! tables never import `iced_x86` types directly and the backend stays
//! swappable.

mod insn;
mod operand;

pub use insn::{
    decode_one, AluOp, Cond, DecodedInsn, FpuOp, InsnKind, MmxOp, ShiftOp, StringOp,
};
pub use operand::{MemOperand, Operand};

pub use pcjit_types::{Gpr, OpSizeMode, Seg, Width};
