//! Interrupt entry (`spec.md` §6: "Interrupt entry calls into
//! `raise_pmode_int(vec, software_flag)` or `raise_rmode_int(vec)` inside
//! the core"). Grounded on `examples/original_source/src/cpu/386_common.c`'s
//! `x86_int`/`x86_int_sw`, trimmed to what `GuestCpuState` actually models:
//! full GDT/LDT/TSS privilege-transition machinery belongs to the
//! segmentation checker this core explicitly does not own (`spec.md` §1),
//! so the protected-mode path here handles same-privilege interrupt gates
//! only and leaves the segment-descriptor cache reload for CS to the bus
//! layer's next fetch.

use pcjit_types::{Fault, Seg, Width};

use crate::bus::GuestBus;
use crate::state::GuestCpuState;

const IF_FLAG: u32 = crate::flags::eflags_bits::IF;
const TF_FLAG: u32 = crate::flags::eflags_bits::TF;

fn push_word(cpu: &mut GuestCpuState, bus: &mut dyn GuestBus, v: u16) -> Result<(), Fault> {
    let sp = cpu.reg(pcjit_types::Gpr::Esp, Width::W16).wrapping_sub(2) & 0xFFFF;
    cpu.set_reg(pcjit_types::Gpr::Esp, Width::W16, sp);
    bus.write_w(Seg::Ss, sp, v)
}

fn push_dword(cpu: &mut GuestCpuState, bus: &mut dyn GuestBus, v: u32) -> Result<(), Fault> {
    let esp = cpu.reg(pcjit_types::Gpr::Esp, Width::W32).wrapping_sub(4);
    cpu.set_reg(pcjit_types::Gpr::Esp, Width::W32, esp);
    bus.write_l(Seg::Ss, esp, v)
}

/// Real-mode interrupt entry: 16-bit IVT lookup, 3-word stack frame
/// (FLAGS, CS, IP), matching `x86_int`'s `else` branch exactly.
pub fn raise_rmode_int(
    cpu: &mut GuestCpuState,
    bus: &mut dyn GuestBus,
    vector: u8,
) -> Result<(), Fault> {
    cpu.materialise_flags();
    let addr = (vector as u32) << 2;
    if addr + 3 > cpu.idtr_limit as u32 {
        if cpu.idtr_limit < 35 {
            return Err(Fault::Internal("triple fault: IVT too small for reset vector"));
        }
        return raise_rmode_int(cpu, bus, 8);
    }
    let flags = cpu.eflags as u16;
    let cs = cpu.seg(Seg::Cs).selector;
    let ip = cpu.pc as u16;
    if cpu.stack_is_32 {
        push_dword(cpu, bus, flags as u32)?;
        push_dword(cpu, bus, cs as u32)?;
        push_dword(cpu, bus, ip as u32)?;
    } else {
        push_word(cpu, bus, flags)?;
        push_word(cpu, bus, cs)?;
        push_word(cpu, bus, ip)?;
    }
    cpu.eflags &= !(IF_FLAG | TF_FLAG);
    let new_ip = bus.read_flat_w(cpu.idtr_base.wrapping_add(addr))?;
    let new_cs = bus.read_flat_w(cpu.idtr_base.wrapping_add(addr).wrapping_add(2))?;
    cpu.seg_mut(Seg::Cs).selector = new_cs;
    cpu.seg_mut(Seg::Cs).base = (new_cs as u32) << 4;
    cpu.pc = new_ip as u32;
    Ok(())
}

/// Protected-mode interrupt entry, restricted to same-privilege interrupt
/// gates (no stack switch, no task gates): push EFLAGS/CS/EIP, clear
/// IF/TF (TF additionally for software int per `x86_int_sw`'s omission —
/// this core follows `x86_int`'s behaviour for both, the simpler and more
/// conservative of the two), then load CS:EIP from the 8-byte IDT gate at
/// `idtr_base + vector*8`.
pub fn raise_pmode_int(
    cpu: &mut GuestCpuState,
    bus: &mut dyn GuestBus,
    vector: u8,
    _software: bool,
) -> Result<(), Fault> {
    cpu.materialise_flags();
    let gate_addr = cpu.idtr_base.wrapping_add((vector as u32) * 8);
    if (vector as u32) * 8 + 7 > cpu.idtr_limit as u32 {
        return Err(Fault::gp((vector as u32) * 8 + 2));
    }
    let offset_lo = bus.read_flat_w(gate_addr)?;
    let selector = bus.read_flat_w(gate_addr.wrapping_add(2))?;
    let access = bus.read_flat_w(gate_addr.wrapping_add(4))?;
    let offset_hi = bus.read_flat_w(gate_addr.wrapping_add(6))?;
    if access & 0x8000 == 0 {
        return Err(Fault::GuestAbort {
            kind: pcjit_types::FaultKind::SegmentNotPresent,
            code: (vector as u32) * 8 + 2,
        });
    }
    let eflags = cpu.eflags;
    let cs = cpu.seg(Seg::Cs).selector as u32;
    let eip = cpu.pc;
    if cpu.stack_is_32 {
        push_dword(cpu, bus, eflags)?;
        push_dword(cpu, bus, cs)?;
        push_dword(cpu, bus, eip)?;
    } else {
        push_word(cpu, bus, eflags as u16)?;
        push_word(cpu, bus, cs as u16)?;
        push_word(cpu, bus, eip as u16)?;
    }
    cpu.eflags &= !(IF_FLAG | TF_FLAG);
    cpu.seg_mut(Seg::Cs).selector = selector;
    cpu.seg_mut(Seg::Cs).base = (selector as u32) << 4;
    cpu.pc = (offset_hi as u32) << 16 | offset_lo as u32;
    cpu.refresh_stack_size();
    Ok(())
}
