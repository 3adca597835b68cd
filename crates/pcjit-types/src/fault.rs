use std::fmt;

/// Guest-visible fault vectors the core needs to name explicitly. Kept as a
/// small closed enum rather than a bare `u8` so callers can match on the
/// well-known ones (`GP`, `PF`, ...) while still carrying arbitrary vectors
/// raised by software interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    DivideError,
    Debug,
    Nmi,
    Breakpoint,
    Overflow,
    BoundRange,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    InvalidTss,
    SegmentNotPresent,
    StackFault,
    GeneralProtection,
    PageFault,
    Vector(u8),
}

impl FaultKind {
    pub fn vector(self) -> u8 {
        match self {
            FaultKind::DivideError => 0,
            FaultKind::Debug => 1,
            FaultKind::Nmi => 2,
            FaultKind::Breakpoint => 3,
            FaultKind::Overflow => 4,
            FaultKind::BoundRange => 5,
            FaultKind::InvalidOpcode => 6,
            FaultKind::DeviceNotAvailable => 7,
            FaultKind::DoubleFault => 8,
            FaultKind::InvalidTss => 10,
            FaultKind::SegmentNotPresent => 11,
            FaultKind::StackFault => 12,
            FaultKind::GeneralProtection => 13,
            FaultKind::PageFault => 14,
            FaultKind::Vector(v) => v,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vector {}", self.vector())
    }
}

/// The error surface the core's `GuestBus`/executor paths return. Mirrors
/// `spec.md` §7's error table; `GuestAbort`/`BlockBudgetExceeded`/
/// `UnsupportedOpcode` are the three kinds that propagate out of emit/interp
/// functions, `CacheMiss`/`DirtyHit` are internal cache control flow and are
/// modelled as plain enum values rather than `Err` (see `pcjit-cpu::jit::cache`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("guest abort: {kind} (error code {code:#x})")]
    GuestAbort { kind: FaultKind, code: u32 },

    #[error("emitted block exceeded its byte/IR-unit budget")]
    BlockBudgetExceeded,

    #[error("opcode has no decode/emit table entry")]
    UnsupportedOpcode,

    #[error("internal invariant violation: {0}")]
    Internal(&'static str),
}

impl Fault {
    pub fn gp(code: u32) -> Fault {
        Fault::GuestAbort {
            kind: FaultKind::GeneralProtection,
            code,
        }
    }

    pub fn page_fault(code: u32) -> Fault {
        Fault::GuestAbort {
            kind: FaultKind::PageFault,
            code,
        }
    }

    pub fn segment_not_present(code: u32) -> Fault {
        Fault::GuestAbort {
            kind: FaultKind::SegmentNotPresent,
            code,
        }
    }
}
