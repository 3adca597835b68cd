//! Primitive types shared by the decoder, interpreter and JIT.
//!
//! No other `pcjit-*` crate depends on this one's internals reaching back
//! in; it only ever grows leaf types (enums, small newtypes, the `Fault`
//! error kind) that every layer needs to agree on.

mod fault;
mod reg;
mod width;

pub use fault::{Fault, FaultKind};
pub use reg::{Gpr, Seg};
pub use width::Width;

/// Guest operand/address size mode. The core never targets 64-bit guest
/// mode (`spec.md` Non-goals), so this is a strict two-valued mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpSizeMode {
    Bits16,
    Bits32,
}

impl OpSizeMode {
    pub fn default_width(self) -> Width {
        match self {
            OpSizeMode::Bits16 => Width::W16,
            OpSizeMode::Bits32 => Width::W32,
        }
    }

    pub fn table_index_bit(self) -> usize {
        match self {
            OpSizeMode::Bits16 => 0,
            OpSizeMode::Bits32 => 1,
        }
    }
}
