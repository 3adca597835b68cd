//! C2/C3: guest-decode-driven emit tables (`spec.md` §4.2, §4.3).
//!
//! Mirrors the teacher's tiered-compile split (`aero-jit-x86`'s
//! `tier1`/`tier2` pipelines sitting above `aero-cpu-core`'s `CodeCache`)
//! at a single tier: walk guest bytes forward from a block's first byte,
//! decide per instruction whether it has table coverage, and lower
//! covered ones into the IR the executor already knows how to run.
//! Emitted blocks are plain data (`pcjit_cpu::jit::ir::IrOp` sequences),
//! not machine code, so "emitting" here means packaging a `CodeBlock`
//! rather than writing bytes into an executable page.

pub mod compiler;
pub mod tables;

pub use compiler::JitCompiler;
