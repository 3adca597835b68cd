//! The emit-table decision: which `InsnKind`s this backend knows how to
//! append to a block, and which end the block when reached (`spec.md`
//! §4.3: branches, privilege-affecting instructions, and anything without
//! coverage all end the block rather than continuing past them).

use pcjit_decode::InsnKind;

/// `false` means no table entry — the compiler stops the block *before*
/// this instruction and the executor falls back to the interpreter for it
/// (`spec.md` §9 Open Question, resolved: 0F-table holes interpret rather
/// than abort the whole block).
pub fn has_table_entry(kind: &InsnKind) -> bool {
    !matches!(kind, InsnKind::LockPrefixed | InsnKind::Unsupported)
}

/// Whether control can fall through this instruction into the next one
/// inside the same block. Branches, traps, and mode-affecting
/// instructions all end the block so the executor can re-resolve the
/// cache/page state at the new `pc` (`spec.md` §4.3/§4.5).
pub fn ends_block(kind: &InsnKind) -> bool {
    matches!(
        kind,
        InsnKind::CallNear { .. }
            | InsnKind::RetNear { .. }
            | InsnKind::JmpNear { .. }
            | InsnKind::JccNear { .. }
            | InsnKind::LoopCx { .. }
            | InsnKind::Jcxz { .. }
            | InsnKind::Int { .. }
            | InsnKind::Int3
            | InsnKind::Hlt
            | InsnKind::Cli
            | InsnKind::Sti
            | InsnKind::LockPrefixed
    )
}

/// Whether this instruction reads or writes the x87 stack, for
/// `CodeBlock::fpu_top_static` bookkeeping (`spec.md` §4.4).
pub fn touches_fpu(kind: &InsnKind) -> bool {
    matches!(kind, InsnKind::Fpu { .. } | InsnKind::Mmx { .. })
}
