//! The "host code" a compiled block stores.
//!
//! `spec.md` Design Notes §9 calls for representing opcode dispatch "as
//! arrays of tagged variants or sum types, one variant per instruction
//! family" rather than literal machine bytes — `pcjit_decode::InsnKind`
//! already is that tagged-variant set. This implementation takes that
//! suggestion at face value: a compiled block's `host_code` is a flat
//! trace of pre-decoded instructions, and "executing host code" means
//! walking the trace and replaying each op through the same per-family
//! semantics the interpreter uses, skipping only the fetch-and-decode step
//! the interpreter redoes on every visit. This is the concrete stand-in
//! this core uses for literal emitted machine bytes in an mmapped
//! executable page, which cannot be safely constructed and verified
//! without running the toolchain — see `DESIGN.md`.

use pcjit_decode::InsnKind;
use pcjit_types::{Fault, Width};

use crate::bus::GuestBus;
use crate::interp::{exec_one, StepOutcome};
use crate::state::GuestCpuState;

/// One already-decoded guest instruction, frozen into a block's trace at
/// compile time together with the operand-size it was decoded under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrOp {
    pub guest_pc: u32,
    pub kind: InsnKind,
    pub length: u32,
    pub width: Width,
}

/// Run a compiled block's trace starting at its first op. Stops at the
/// first op that reports `ends_block`, falls off the end of the trace
/// (control passes to whatever follows at `next_pc`), or faults — a fault
/// leaves `cpu.pc` at the faulting op's `guest_pc`, which is what gives
/// this core precise-PC-on-fault (`spec.md` §7, §8 property 6) without any
/// separate bookkeeping.
pub fn run_block(
    cpu: &mut GuestCpuState,
    bus: &mut dyn GuestBus,
    ops: &[IrOp],
) -> Result<StepOutcome, Fault> {
    let mut outcome = StepOutcome {
        next_pc: cpu.pc,
        ends_block: false,
    };
    for op in ops {
        cpu.prev_pc = op.guest_pc;
        cpu.pc = op.guest_pc;
        let fallthrough = op.guest_pc.wrapping_add(op.length);
        // Consumes whatever the *previous* op armed (STI/MOV SS), not this
        // op's own arm below it in `exec_one` — the one-shot "end block
        // after next instruction" counter `spec.md` §5 describes.
        let force_end = cpu.inhibit_interrupts.tick();
        outcome = exec_one(cpu, bus, &op.kind, fallthrough, op.width)?;
        if force_end {
            outcome.ends_block = true;
        }
        if outcome.ends_block {
            return Ok(outcome);
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcjit_decode::{AluOp, Operand};
    use pcjit_types::Gpr;

    struct FlatMem {
        bytes: Vec<u8>,
    }

    impl GuestBus for FlatMem {
        fn read_b(&mut self, _seg: pcjit_types::Seg, off: u32) -> Result<u8, Fault> {
            Ok(self.bytes[off as usize])
        }
        fn read_w(&mut self, _seg: pcjit_types::Seg, off: u32) -> Result<u16, Fault> {
            Ok(u16::from_le_bytes([self.bytes[off as usize], self.bytes[off as usize + 1]]))
        }
        fn read_l(&mut self, _seg: pcjit_types::Seg, off: u32) -> Result<u32, Fault> {
            let b = &self.bytes[off as usize..off as usize + 4];
            Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }
        fn write_b(&mut self, _seg: pcjit_types::Seg, off: u32, v: u8) -> Result<(), Fault> {
            self.bytes[off as usize] = v;
            Ok(())
        }
        fn write_w(&mut self, _seg: pcjit_types::Seg, off: u32, v: u16) -> Result<(), Fault> {
            let b = v.to_le_bytes();
            self.bytes[off as usize] = b[0];
            self.bytes[off as usize + 1] = b[1];
            Ok(())
        }
        fn write_l(&mut self, _seg: pcjit_types::Seg, off: u32, v: u32) -> Result<(), Fault> {
            let b = v.to_le_bytes();
            self.bytes[off as usize..off as usize + 4].copy_from_slice(&b);
            Ok(())
        }
        fn phys_of(&mut self, linear: u32) -> Result<u32, Fault> {
            Ok(linear)
        }
        fn invalidate_tlb(&mut self) {}
        fn fetch_code(&mut self, _seg: pcjit_types::Seg, ip: u32, len: u8, out: &mut [u8]) -> Result<(), Fault> {
            out.copy_from_slice(&self.bytes[ip as usize..ip as usize + len as usize]);
            Ok(())
        }
        fn read_flat_w(&mut self, addr: u32) -> Result<u16, Fault> {
            self.read_w(pcjit_types::Seg::Ds, addr)
        }
        fn write_flat_w(&mut self, addr: u32, v: u16) -> Result<(), Fault> {
            self.write_w(pcjit_types::Seg::Ds, addr, v)
        }
    }

    /// A bus whose writes always fault, so the second op in a trace never
    /// completes. Property 6 ("precise PC on fault") requires `cpu.pc` to
    /// land on this op's own `guest_pc`, not the block's entry or the op
    /// after it.
    struct FaultingWrites;
    impl GuestBus for FaultingWrites {
        fn read_b(&mut self, _seg: pcjit_types::Seg, _off: u32) -> Result<u8, Fault> {
            Ok(0)
        }
        fn read_w(&mut self, _seg: pcjit_types::Seg, _off: u32) -> Result<u16, Fault> {
            Ok(0)
        }
        fn read_l(&mut self, _seg: pcjit_types::Seg, _off: u32) -> Result<u32, Fault> {
            Ok(0)
        }
        fn write_b(&mut self, _seg: pcjit_types::Seg, _off: u32, _v: u8) -> Result<(), Fault> {
            Err(Fault::page_fault(0))
        }
        fn write_w(&mut self, _seg: pcjit_types::Seg, _off: u32, _v: u16) -> Result<(), Fault> {
            Err(Fault::page_fault(0))
        }
        fn write_l(&mut self, _seg: pcjit_types::Seg, _off: u32, _v: u32) -> Result<(), Fault> {
            Err(Fault::page_fault(0))
        }
        fn phys_of(&mut self, linear: u32) -> Result<u32, Fault> {
            Ok(linear)
        }
        fn invalidate_tlb(&mut self) {}
        fn fetch_code(&mut self, _seg: pcjit_types::Seg, _ip: u32, _len: u8, out: &mut [u8]) -> Result<(), Fault> {
            out.fill(0x90);
            Ok(())
        }
        fn read_flat_w(&mut self, _addr: u32) -> Result<u16, Fault> {
            Ok(0)
        }
        fn write_flat_w(&mut self, _addr: u32, _v: u16) -> Result<(), Fault> {
            Err(Fault::page_fault(0))
        }
    }

    #[test]
    fn a_fault_mid_block_leaves_pc_at_the_faulting_op_not_the_block_entry() {
        let ops = vec![
            IrOp {
                guest_pc: 0,
                kind: InsnKind::Inc {
                    dst: Operand::Reg(Gpr::Ebx, Width::W32),
                },
                length: 2,
                width: Width::W32,
            },
            IrOp {
                guest_pc: 2,
                kind: InsnKind::Push {
                    src: Operand::Reg(Gpr::Eax, Width::W32),
                },
                length: 1,
                width: Width::W32,
            },
            IrOp {
                guest_pc: 3,
                kind: InsnKind::Inc {
                    dst: Operand::Reg(Gpr::Ecx, Width::W32),
                },
                length: 2,
                width: Width::W32,
            },
        ];
        let mut cpu = GuestCpuState::default();
        let mut bus = FaultingWrites;
        let err = run_block(&mut cpu, &mut bus, &ops);
        assert!(err.is_err());
        assert_eq!(cpu.pc, 2, "must stop at the PUSH, not the block entry or the INC after it");
        assert_eq!(cpu.gpr[Gpr::Ebx.index()], 1, "the INC before the fault still committed");
        assert_eq!(cpu.gpr[Gpr::Ecx.index()], 0, "the INC after the fault must not run");
    }

    #[test]
    fn replaying_a_trace_matches_stepping_it_live() {
        let ops = vec![
            IrOp {
                guest_pc: 0,
                kind: InsnKind::Alu {
                    op: AluOp::Add,
                    dst: Operand::Reg(Gpr::Eax, Width::W32),
                    src: Operand::Imm(1),
                },
                length: 3,
                width: Width::W32,
            },
            IrOp {
                guest_pc: 3,
                kind: InsnKind::Inc {
                    dst: Operand::Reg(Gpr::Ebx, Width::W32),
                },
                length: 2,
                width: Width::W32,
            },
        ];
        let mut cpu = GuestCpuState::default();
        cpu.gpr[Gpr::Eax.index()] = 41;
        let mut bus = FlatMem { bytes: vec![0u8; 16] };
        let outcome = run_block(&mut cpu, &mut bus, &ops).unwrap();
        assert_eq!(cpu.gpr[Gpr::Eax.index()], 42);
        assert_eq!(cpu.gpr[Gpr::Ebx.index()], 1);
        assert!(!outcome.ends_block);
        assert_eq!(cpu.prev_pc, 3);
    }
}
