//! The interpreter/flags/FPU/JIT-support core (`spec.md` §1-§7): guest
//! register state, lazy EFLAGS, the x87/MMX model, the `GuestBus`/
//! `InterruptSource` seams the surrounding system implements, the C7
//! interpreter fallback, interrupt entry, the block cache and its
//! IR/dirty-tracking support, and the C6 executor loop that ties them
//! together. Opcode decode lives in `pcjit-decode`; the emit tables that
//! turn decoded instructions into compiled blocks live in `pcjit-jit`,
//! which depends on this crate rather than the other way around.

pub mod bus;
pub mod exec;
pub mod flags;
pub mod fpu;
pub mod interp;
pub mod interrupt;
pub mod state;

pub mod jit {
    pub mod cache;
    pub mod ir;
    pub mod pages;
}

pub use bus::{GuestBus, InterruptSource};
pub use exec::{BlockCompiler, Executor, JitConfig, StopReason};
pub use flags::{eflags_bits, LazyFlagKind, LazyFlags};
pub use fpu::{Fp80, FpuTopAssumption, Tag, X87State};
pub use interp::{step, StepOutcome};
pub use state::{ControlRegs, DebugRegs, GuestCpuState, InterruptInhibit, SegmentDescriptor};
