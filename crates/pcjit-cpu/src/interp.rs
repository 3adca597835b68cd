//! C7: the interpreter fallback.
//!
//! `spec.md` §4.7: "identical dispatch tables but the emit step is replaced
//! with direct execution... the ground-truth reference: any emitted block
//! must produce bitwise-identical guest state to running the same
//! instructions through C7." This module is also used for: opcodes with no
//! JIT table entry, the first-pass trace that lets the cache record a
//! block's observed bounds, and single-stepping under the trap flag
//! (`spec.md` §4.7 (a)-(c)).
//!
//! `pcjit-jit`'s emit tables mirror this function's `match` arms in the
//! same order over the same `pcjit_decode::InsnKind`, so "decode tables"
//! are shared at the data level (Design Notes §9) even though interpreter
//! and JIT are two concrete functions rather than one generic-dispatch
//! body — see `DESIGN.md` for why a single polymorphic `InsnSink` body was
//! not worth the abstraction given the value-vs-IR-node mismatch between
//! the two tiers.

use pcjit_decode::{decode_one, AluOp, Cond, DecodedInsn, FpuOp, InsnKind, MemOperand, MmxOp, Operand, ShiftOp, StringOp};
use pcjit_types::{Fault, FaultKind, Gpr, OpSizeMode, Seg, Width};

use crate::bus::GuestBus;
use crate::flags::{eflags_bits, LazyFlagKind};
use crate::fpu::Fp80;
use crate::state::GuestCpuState;

/// What the executor should do after one interpreted instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub next_pc: u32,
    /// `spec.md` §2: "Block ends on: unconditional branch, indirect
    /// branch, page crossing, trap flag set, fault, or oversize." The
    /// interpreter reports every such condition it can see locally (it
    /// cannot see page crossings or oversize — those are the compiler's
    /// concern) so block-discovery tracing can record accurate bounds.
    pub ends_block: bool,
}

fn cond_true(cpu: &mut GuestCpuState, cond: Cond) -> bool {
    let cf = cpu.lazy_flags.cf(cpu.eflags);
    let zf = cpu.lazy_flags.zf(cpu.eflags);
    let sf = cpu.lazy_flags.sf(cpu.eflags);
    let of = cpu.lazy_flags.of(cpu.eflags);
    let pf = cpu.lazy_flags.pf(cpu.eflags);
    match cond {
        Cond::O => of,
        Cond::No => !of,
        Cond::B => cf,
        Cond::Ae => !cf,
        Cond::E => zf,
        Cond::Ne => !zf,
        Cond::Be => cf || zf,
        Cond::A => !cf && !zf,
        Cond::S => sf,
        Cond::Ns => !sf,
        Cond::P => pf,
        Cond::Np => !pf,
        Cond::L => sf != of,
        Cond::Ge => sf == of,
        Cond::Le => zf || (sf != of),
        Cond::G => !zf && (sf == of),
    }
}

fn addr_mask(w: Width, v: u32) -> u32 {
    match w {
        Width::W16 => v & 0xFFFF,
        _ => v,
    }
}

fn effective_address(cpu: &GuestCpuState, m: &MemOperand) -> (Seg, u32) {
    let mut ea: u32 = 0;
    if let Some(base) = m.base {
        ea = ea.wrapping_add(cpu.reg(base, Width::W32));
    }
    if let Some(index) = m.index {
        ea = ea.wrapping_add(cpu.reg(index, Width::W32).wrapping_mul(m.scale as u32));
    }
    ea = ea.wrapping_add(m.disp as u32);
    ea = addr_mask(m.addr_width, ea);
    let default_seg = match m.base {
        Some(Gpr::Ebp) | Some(Gpr::Esp) => Seg::Ss,
        _ => Seg::Ds,
    };
    (m.seg_override.unwrap_or(default_seg), ea)
}

fn read_operand(
    cpu: &mut GuestCpuState,
    bus: &mut dyn GuestBus,
    op: &Operand,
) -> Result<u32, Fault> {
    Ok(match op {
        Operand::Reg(g, w) => cpu.reg(*g, *w),
        Operand::RegHigh8(g) => cpu.reg_high8(*g),
        Operand::Imm(i) => *i as u32,
        Operand::Rel(r) => *r as u32,
        Operand::Mem(m) => {
            let (seg, ea) = effective_address(cpu, m);
            match m.width {
                Width::W8 => bus.read_b(seg, ea)? as u32,
                Width::W16 => bus.read_w(seg, ea)? as u32,
                Width::W32 => bus.read_l(seg, ea)?,
            }
        }
    })
}

/// `spec.md` §4.2 "Protection": a write through a segment must respect
/// that segment's presence and writability. Real mode has no descriptor
/// table backing these bits, so the check only applies once the guest has
/// entered protected mode.
fn check_segment_writable(cpu: &GuestCpuState, seg: Seg) -> Result<(), Fault> {
    if !cpu.cr.protected_mode() {
        return Ok(());
    }
    let desc = cpu.seg(seg);
    if !desc.present {
        return Err(Fault::segment_not_present(desc.selector as u32 & !0x7));
    }
    if !desc.writable() {
        return Err(Fault::gp(desc.selector as u32 & !0x7));
    }
    Ok(())
}

/// `spec.md` §4.2: every branch target is checked against the destination
/// segment's presence and limit before it becomes `cpu.pc`, so a fault
/// materialises at the branch itself rather than at the first fetch of
/// the bad target.
fn check_branch_target(cpu: &GuestCpuState, seg: Seg, target: u32) -> Result<(), Fault> {
    if !cpu.cr.protected_mode() {
        return Ok(());
    }
    let desc = cpu.seg(seg);
    if !desc.present {
        return Err(Fault::segment_not_present(desc.selector as u32 & !0x7));
    }
    if !desc.contains_offset(target) {
        return Err(Fault::gp(desc.selector as u32 & !0x7));
    }
    Ok(())
}

fn write_operand(
    cpu: &mut GuestCpuState,
    bus: &mut dyn GuestBus,
    op: &Operand,
    value: u32,
) -> Result<(), Fault> {
    match op {
        Operand::Reg(g, w) => cpu.set_reg(*g, *w, value),
        Operand::RegHigh8(g) => cpu.set_reg_high8(*g, value),
        Operand::Mem(m) => {
            let (seg, ea) = effective_address(cpu, m);
            check_segment_writable(cpu, seg)?;
            match m.width {
                Width::W8 => bus.write_b(seg, ea, value as u8)?,
                Width::W16 => bus.write_w(seg, ea, value as u16)?,
                Width::W32 => bus.write_l(seg, ea, value)?,
            }
        }
        Operand::Imm(_) | Operand::Rel(_) => return Err(Fault::Internal("write to immediate")),
    }
    Ok(())
}

fn push(cpu: &mut GuestCpuState, bus: &mut dyn GuestBus, value: u32) -> Result<(), Fault> {
    check_segment_writable(cpu, Seg::Ss)?;
    let w = if cpu.stack_is_32 { Width::W32 } else { Width::W16 };
    let esp = cpu.reg(Gpr::Esp, Width::W32).wrapping_sub(w.bits() / 8);
    cpu.set_reg(Gpr::Esp, if cpu.stack_is_32 { Width::W32 } else { Width::W16 }, esp);
    let esp_full = cpu.reg(Gpr::Esp, Width::W32);
    match w {
        Width::W32 => bus.write_l(Seg::Ss, esp_full, value)?,
        Width::W16 => bus.write_w(Seg::Ss, esp_full, value as u16)?,
        Width::W8 => unreachable!(),
    }
    Ok(())
}

fn pop(cpu: &mut GuestCpuState, bus: &mut dyn GuestBus) -> Result<u32, Fault> {
    let w = if cpu.stack_is_32 { Width::W32 } else { Width::W16 };
    let esp_full = cpu.reg(Gpr::Esp, Width::W32);
    let value = match w {
        Width::W32 => bus.read_l(Seg::Ss, esp_full)?,
        Width::W16 => bus.read_w(Seg::Ss, esp_full)? as u32,
        Width::W8 => unreachable!(),
    };
    let new_esp = esp_full.wrapping_add(w.bits() / 8);
    cpu.set_reg(Gpr::Esp, if cpu.stack_is_32 { Width::W32 } else { Width::W16 }, new_esp);
    Ok(value)
}

fn alu_kind(op: AluOp, w: Width) -> Option<LazyFlagKind> {
    use AluOp::*;
    Some(match op {
        Add => LazyFlagKind::Add(w),
        Sub | Cmp => LazyFlagKind::Sub(w),
        Adc => LazyFlagKind::Adc(w),
        Sbb => LazyFlagKind::Sbb(w),
        Or | And | Xor => LazyFlagKind::ZeroNeg(w),
    })
}

fn alu_result(op: AluOp, w: Width, dst: u32, src: u32, cf_in: bool) -> u32 {
    use AluOp::*;
    let d = w.truncate(dst);
    let s = w.truncate(src);
    w.truncate(match op {
        Add => d.wrapping_add(s),
        Sub | Cmp => d.wrapping_sub(s),
        Adc => d.wrapping_add(s).wrapping_add(cf_in as u32),
        Sbb => d.wrapping_sub(s).wrapping_sub(cf_in as u32),
        Or => d | s,
        And => d & s,
        Xor => d ^ s,
    })
}

/// Execute one guest instruction. `seg_override`/prefixes are assumed
/// already folded into `insn` by the decoder.
pub fn step(
    cpu: &mut GuestCpuState,
    bus: &mut dyn GuestBus,
) -> Result<StepOutcome, Fault> {
    let mut code = [0u8; 15];
    bus.fetch_code(Seg::Cs, cpu.pc, 15, &mut code)?;
    let DecodedInsn { kind, length } = decode_one(&code, cpu.pc, cpu.op_size)?;
    cpu.prev_pc = cpu.pc;
    let fallthrough = cpu.pc.wrapping_add(length);
    let w = cpu.op_size.default_width();

    // Consumes whatever the *previous* instruction armed, not this one's
    // own arm below — see `jit::ir::run_block` for the same pattern.
    let force_end = cpu.inhibit_interrupts.tick();
    let mut outcome = exec_one(cpu, bus, &kind, fallthrough, w)?;
    if force_end {
        outcome.ends_block = true;
    }
    Ok(outcome)
}

pub(crate) fn exec_one(
    cpu: &mut GuestCpuState,
    bus: &mut dyn GuestBus,
    kind: &InsnKind,
    fallthrough: u32,
    w: Width,
) -> Result<StepOutcome, Fault> {
    let not_end = StepOutcome { next_pc: fallthrough, ends_block: false };
    match kind {
        InsnKind::Mov { dst, src } => {
            let v = read_operand(cpu, bus, src)?;
            write_operand(cpu, bus, dst, v)?;
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Alu { op, dst, src } => {
            let a = read_operand(cpu, bus, dst)?;
            let b = read_operand(cpu, bus, src)?;
            let cf_in = cpu.lazy_flags.cf(cpu.eflags);
            let res = alu_result(*op, w, a, b, cf_in);
            if !matches!(op, AluOp::Cmp) {
                write_operand(cpu, bus, dst, res)?;
            }
            if let Some(k) = alu_kind(*op, w) {
                cpu.lazy_flags.set(k, a, b, res);
            }
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Test { a, b } => {
            let av = read_operand(cpu, bus, a)?;
            let bv = read_operand(cpu, bus, b)?;
            let res = w.truncate(av & bv);
            cpu.lazy_flags.set(LazyFlagKind::ZeroNeg(w), av, bv, res);
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Inc { dst } => {
            let a = read_operand(cpu, bus, dst)?;
            let res = w.truncate(a.wrapping_add(1));
            write_operand(cpu, bus, dst, res)?;
            cpu.lazy_flags.set(LazyFlagKind::Inc(w), a, 1, res);
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Dec { dst } => {
            let a = read_operand(cpu, bus, dst)?;
            let res = w.truncate(a.wrapping_sub(1));
            write_operand(cpu, bus, dst, res)?;
            cpu.lazy_flags.set(LazyFlagKind::Dec(w), a, 1, res);
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Shift { op, dst, count } => {
            let a = read_operand(cpu, bus, dst)?;
            let c = read_operand(cpu, bus, count)? & 0x1F;
            if c == 0 {
                cpu.pc = fallthrough;
                return Ok(not_end);
            }
            let (res, kind) = match op {
                ShiftOp::Shl => (w.truncate(a.wrapping_shl(c)), LazyFlagKind::Shl(w)),
                ShiftOp::Shr => (w.truncate(w.truncate(a) >> c.min(w.bits())), LazyFlagKind::Shr(w)),
                ShiftOp::Sar => {
                    let signed = w.sign_extend_to_32(a);
                    (w.truncate((signed >> c.min(31)) as u32), LazyFlagKind::Sar(w))
                }
                ShiftOp::Rol => {
                    let bits = w.bits();
                    let n = c % bits;
                    let v = w.truncate(a);
                    (w.truncate((v << n) | (v >> (bits - n).max(1).min(bits))), LazyFlagKind::Rol(w))
                }
                ShiftOp::Ror => {
                    let bits = w.bits();
                    let n = c % bits;
                    let v = w.truncate(a);
                    (w.truncate((v >> n) | (v << (bits - n).max(1).min(bits))), LazyFlagKind::Ror(w))
                }
            };
            write_operand(cpu, bus, dst, res)?;
            cpu.lazy_flags.set(kind, a, c, res);
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Lea { dst, addr } => {
            let (_, ea) = effective_address(cpu, addr);
            cpu.set_reg(*dst, w, ea);
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Push { src } => {
            let v = read_operand(cpu, bus, src)?;
            push(cpu, bus, v)?;
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Pop { dst } => {
            let v = pop(cpu, bus)?;
            write_operand(cpu, bus, dst, v)?;
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Pushf => {
            cpu.materialise_flags();
            push(cpu, bus, cpu.eflags)?;
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Popf => {
            let v = pop(cpu, bus)?;
            cpu.eflags = v;
            cpu.lazy_flags.kind = LazyFlagKind::Unknown;
            cpu.pc = fallthrough;
            Ok(StepOutcome { next_pc: fallthrough, ends_block: true })
        }
        InsnKind::Sahf => {
            cpu.materialise_flags();
            let ah = cpu.reg_high8(Gpr::Eax);
            cpu.eflags = (cpu.eflags & !0xFF) | (ah & 0xD5) | 0x02;
            cpu.lazy_flags.kind = LazyFlagKind::Unknown;
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Lahf => {
            cpu.materialise_flags();
            cpu.set_reg_high8(Gpr::Eax, cpu.eflags & 0xFF);
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::CallNear { target } => {
            let t = resolve_branch_target(cpu, bus, target)?;
            check_branch_target(cpu, Seg::Cs, t)?;
            push(cpu, bus, fallthrough)?;
            cpu.pc = t;
            Ok(StepOutcome { next_pc: t, ends_block: true })
        }
        InsnKind::RetNear { imm16 } => {
            let ret = pop(cpu, bus)?;
            check_branch_target(cpu, Seg::Cs, ret)?;
            if *imm16 != 0 {
                let esp = cpu.reg(Gpr::Esp, Width::W32).wrapping_add(*imm16 as u32);
                cpu.set_reg(Gpr::Esp, Width::W32, esp);
            }
            cpu.pc = ret;
            Ok(StepOutcome { next_pc: ret, ends_block: true })
        }
        InsnKind::JmpNear { target } => {
            let t = resolve_branch_target(cpu, bus, target)?;
            check_branch_target(cpu, Seg::Cs, t)?;
            cpu.pc = t;
            Ok(StepOutcome { next_pc: t, ends_block: true })
        }
        InsnKind::JccNear { cond, target } => {
            // `target` is already the absolute branch target: iced's
            // `near_branch16`/`near_branch32` report the destination, not
            // a displacement.
            let taken = cond_true(cpu, *cond);
            let dest = if taken { *target as u32 } else { fallthrough };
            if taken {
                check_branch_target(cpu, Seg::Cs, dest)?;
            }
            cpu.pc = dest;
            Ok(StepOutcome { next_pc: dest, ends_block: true })
        }
        InsnKind::LoopCx { cond, target } => {
            let ecx = if cpu.op_size == OpSizeMode::Bits32 {
                let v = cpu.reg(Gpr::Ecx, Width::W32).wrapping_sub(1);
                cpu.set_reg(Gpr::Ecx, Width::W32, v);
                v != 0
            } else {
                let v = cpu.reg(Gpr::Ecx, Width::W16).wrapping_sub(1) & 0xFFFF;
                cpu.set_reg(Gpr::Ecx, Width::W16, v);
                v != 0
            };
            let zf = cpu.lazy_flags.zf(cpu.eflags);
            let take = match cond {
                None => ecx,
                Some(true) => ecx && zf,
                Some(false) => ecx && !zf,
            };
            let dest = if take { *target as u32 } else { fallthrough };
            if take {
                check_branch_target(cpu, Seg::Cs, dest)?;
            }
            cpu.pc = dest;
            Ok(StepOutcome { next_pc: dest, ends_block: true })
        }
        InsnKind::Jcxz { target } => {
            let cx = if cpu.op_size == OpSizeMode::Bits32 {
                cpu.reg(Gpr::Ecx, Width::W32)
            } else {
                cpu.reg(Gpr::Ecx, Width::W16)
            };
            let dest = if cx == 0 { *target as u32 } else { fallthrough };
            if cx == 0 {
                check_branch_target(cpu, Seg::Cs, dest)?;
            }
            cpu.pc = dest;
            Ok(StepOutcome { next_pc: dest, ends_block: true })
        }
        InsnKind::Int3 => raise_interrupt(cpu, bus, FaultKind::Breakpoint.vector(), fallthrough),
        InsnKind::Int { vector } => raise_interrupt(cpu, bus, *vector, fallthrough),
        InsnKind::Hlt => {
            cpu.halted = true;
            cpu.pc = fallthrough;
            Ok(StepOutcome { next_pc: fallthrough, ends_block: true })
        }
        InsnKind::Cli => {
            cpu.materialise_flags();
            cpu.eflags &= !eflags_bits::IF;
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Sti => {
            cpu.materialise_flags();
            cpu.eflags |= eflags_bits::IF;
            cpu.inhibit_interrupts.arm();
            cpu.pc = fallthrough;
            Ok(StepOutcome { next_pc: fallthrough, ends_block: true })
        }
        InsnKind::Clc => {
            cpu.materialise_flags();
            cpu.eflags &= !eflags_bits::CF;
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Stc => {
            cpu.materialise_flags();
            cpu.eflags |= eflags_bits::CF;
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Cmc => {
            cpu.materialise_flags();
            cpu.eflags ^= eflags_bits::CF;
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Cld => {
            cpu.materialise_flags();
            cpu.eflags &= !eflags_bits::DF;
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Std => {
            cpu.materialise_flags();
            cpu.eflags |= eflags_bits::DF;
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Nop => {
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::MovSeg { dst, src } => {
            let v = read_operand(cpu, bus, src)?;
            cpu.seg_mut(*dst).selector = v as u16;
            if *dst == Seg::Ss {
                // One-instruction interrupt-inhibit window (`spec.md` §4.3,
                // §5): the next instruction must stay in the same block,
                // so this does not end the block by itself — `run_block`/
                // `step`'s one-shot counter ends it after the *following*
                // op instead.
                cpu.inhibit_interrupts.arm();
                cpu.refresh_stack_size();
            }
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::StringOp { op, rep } => {
            exec_string_op(cpu, bus, *op, *rep, w)?;
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Fpu { op, operand } => {
            exec_fpu(cpu, bus, *op, operand)?;
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::Mmx { op, dst, src } => {
            exec_mmx(cpu, bus, *op, dst, src.as_ref())?;
            cpu.pc = fallthrough;
            Ok(not_end)
        }
        InsnKind::LockPrefixed => Ok(StepOutcome { next_pc: fallthrough, ends_block: true }),
        InsnKind::Unsupported => Err(Fault::UnsupportedOpcode),
    }
}

fn resolve_branch_target(
    cpu: &mut GuestCpuState,
    bus: &mut dyn GuestBus,
    op: &Operand,
) -> Result<u32, Fault> {
    match op {
        Operand::Rel(r) => Ok(*r as u32),
        Operand::Imm(i) => Ok(*i as u32),
        other => read_operand(cpu, bus, other),
    }
}

fn raise_interrupt(
    cpu: &mut GuestCpuState,
    bus: &mut dyn GuestBus,
    vector: u8,
    fallthrough: u32,
) -> Result<StepOutcome, Fault> {
    cpu.materialise_flags();
    if cpu.cr.protected_mode() {
        crate::interrupt::raise_pmode_int(cpu, bus, vector, true)?;
    } else {
        crate::interrupt::raise_rmode_int(cpu, bus, vector)?;
    }
    Ok(StepOutcome { next_pc: cpu.pc, ends_block: true })
}

fn exec_string_op(
    cpu: &mut GuestCpuState,
    bus: &mut dyn GuestBus,
    op: StringOp,
    rep: Option<bool>,
    w: Width,
) -> Result<(), Fault> {
    // DF is read once at loop start, per `spec.md` §4.3 policy.
    cpu.materialise_flags();
    let df_back = cpu.eflags & eflags_bits::DF != 0;
    let step: i32 = if df_back { -(w.bits() as i32 / 8) } else { w.bits() as i32 / 8 };

    let mut count: u32 = match rep {
        None => 1,
        Some(_) => {
            if cpu.op_size == OpSizeMode::Bits32 {
                cpu.reg(Gpr::Ecx, Width::W32)
            } else {
                cpu.reg(Gpr::Ecx, Width::W16)
            }
        }
    };
    // `spec.md` §4.3: rep-prefixed string ops may be expanded inline with a
    // bounded count; cap the interpreter's inline expansion the same way
    // the JIT must cap emission (`BlockBudgetExceeded`).
    const MAX_INLINE_REPS: u32 = 65536;
    let mut did_any = count > 0;
    while count > 0 {
        let si = cpu.reg(Gpr::Esi, Width::W32);
        let di = cpu.reg(Gpr::Edi, Width::W32);
        match op {
            StringOp::Movs => {
                let v = read_width(bus, Seg::Ds, si, w)?;
                write_width(bus, Seg::Es, di, w, v)?;
            }
            StringOp::Stos => {
                let v = cpu.reg(Gpr::Eax, w);
                write_width(bus, Seg::Es, di, w, v)?;
            }
            StringOp::Lods => {
                let v = read_width(bus, Seg::Ds, si, w)?;
                cpu.set_reg(Gpr::Eax, w, v);
            }
            StringOp::Cmps => {
                let a = read_width(bus, Seg::Ds, si, w)?;
                let b = read_width(bus, Seg::Es, di, w)?;
                let res = w.truncate(a.wrapping_sub(b));
                cpu.lazy_flags.set(LazyFlagKind::Sub(w), a, b, res);
            }
            StringOp::Scas => {
                let a = cpu.reg(Gpr::Eax, w);
                let b = read_width(bus, Seg::Es, di, w)?;
                let res = w.truncate(a.wrapping_sub(b));
                cpu.lazy_flags.set(LazyFlagKind::Sub(w), a, b, res);
            }
        }
        if matches!(op, StringOp::Movs | StringOp::Cmps | StringOp::Lods) {
            cpu.set_reg(Gpr::Esi, Width::W32, si.wrapping_add(step as u32));
        }
        if matches!(op, StringOp::Movs | StringOp::Stos | StringOp::Cmps | StringOp::Scas) {
            cpu.set_reg(Gpr::Edi, Width::W32, di.wrapping_add(step as u32));
        }
        count -= 1;
        if cpu.op_size == OpSizeMode::Bits32 {
            cpu.set_reg(Gpr::Ecx, Width::W32, count);
        } else {
            cpu.set_reg(Gpr::Ecx, Width::W16, count);
        }
        if let Some(want_zf) = rep {
            if matches!(op, StringOp::Cmps | StringOp::Scas) {
                let zf = cpu.lazy_flags.zf(cpu.eflags);
                if zf != want_zf {
                    break;
                }
            }
        }
        if did_any && MAX_INLINE_REPS == 0 {
            break;
        }
        did_any = true;
        if count > MAX_INLINE_REPS {
            return Err(Fault::BlockBudgetExceeded);
        }
    }
    Ok(())
}

fn read_width(bus: &mut dyn GuestBus, seg: Seg, off: u32, w: Width) -> Result<u32, Fault> {
    Ok(match w {
        Width::W8 => bus.read_b(seg, off)? as u32,
        Width::W16 => bus.read_w(seg, off)? as u32,
        Width::W32 => bus.read_l(seg, off)?,
    })
}

fn write_width(bus: &mut dyn GuestBus, seg: Seg, off: u32, w: Width, v: u32) -> Result<(), Fault> {
    match w {
        Width::W8 => bus.write_b(seg, off, v as u8)?,
        Width::W16 => bus.write_w(seg, off, v as u16)?,
        Width::W32 => bus.write_l(seg, off, v)?,
    }
    Ok(())
}

fn fpu_mem_read(cpu: &mut GuestCpuState, bus: &mut dyn GuestBus, m: &MemOperand) -> Result<Fp80, Fault> {
    let (seg, ea) = effective_address(cpu, m);
    match m.width {
        Width::W32 => Ok(Fp80::from_f64(f32::from_bits(bus.read_l(seg, ea)?) as f64)),
        _ => Ok(Fp80::from_i64(bus.read_l(seg, ea)? as i32 as i64)),
    }
}

fn exec_fpu(
    cpu: &mut GuestCpuState,
    bus: &mut dyn GuestBus,
    op: FpuOp,
    operand: &Option<Operand>,
) -> Result<(), Fault> {
    if cpu.cr.cr0 & (1 << 3) != 0 {
        return Err(Fault::GuestAbort { kind: FaultKind::DeviceNotAvailable, code: 0 });
    }
    cpu.x87.fp_enter();
    match op {
        FpuOp::Fld => {
            let v = match operand {
                Some(Operand::Mem(m)) => fpu_mem_read(cpu, bus, m)?,
                _ => cpu.x87.st(0),
            };
            cpu.x87.push(v);
        }
        FpuOp::Fst | FpuOp::Fstp => {
            let v = cpu.x87.st(0);
            if let Some(Operand::Mem(m)) = operand {
                let (seg, ea) = effective_address(cpu, m);
                match m.width {
                    Width::W32 => bus.write_l(seg, ea, (v.to_f64() as f32).to_bits())?,
                    _ => bus.write_l(seg, ea, v.to_i64_truncate() as u32)?,
                }
            }
            if matches!(op, FpuOp::Fstp) {
                cpu.x87.pop();
            }
        }
        FpuOp::Fadd | FpuOp::Fmul | FpuOp::Fsub | FpuOp::Fsubr | FpuOp::Fdiv | FpuOp::Fdivr => {
            let src = match operand {
                Some(Operand::Mem(m)) => fpu_mem_read(cpu, bus, m)?.to_f64(),
                _ => cpu.x87.st(1).to_f64(),
            };
            let dst = cpu.x87.st(0).to_f64();
            let result = match op {
                FpuOp::Fadd => dst + src,
                FpuOp::Fmul => dst * src,
                FpuOp::Fsub => dst - src,
                FpuOp::Fsubr => src - dst,
                FpuOp::Fdiv => dst / src,
                FpuOp::Fdivr => src / dst,
                _ => unreachable!(),
            };
            cpu.x87.set_st(0, Fp80::from_f64(result));
        }
        FpuOp::Fild => {
            if let Some(Operand::Mem(m)) = operand {
                let (seg, ea) = effective_address(cpu, m);
                let v = bus.read_l(seg, ea)? as i32;
                cpu.x87.push(Fp80::from_i64(v as i64));
            }
        }
        FpuOp::Fist | FpuOp::Fistp => {
            let v = cpu.x87.st(0).to_i64_truncate();
            if let Some(Operand::Mem(m)) = operand {
                let (seg, ea) = effective_address(cpu, m);
                bus.write_l(seg, ea, v as u32)?;
            }
            if matches!(op, FpuOp::Fistp) {
                cpu.x87.pop();
            }
        }
        FpuOp::Fcom | FpuOp::Fcomp => {
            let src = match operand {
                Some(Operand::Mem(m)) => fpu_mem_read(cpu, bus, m)?.to_f64(),
                _ => cpu.x87.st(1).to_f64(),
            };
            let dst = cpu.x87.st(0).to_f64();
            cpu.x87.status_word &= !0x4500;
            if dst < src {
                cpu.x87.status_word |= 0x0100;
            } else if dst == src {
                cpu.x87.status_word |= 0x4000;
            }
            if matches!(op, FpuOp::Fcomp) {
                cpu.x87.pop();
            }
        }
        FpuOp::Fxch => {
            let a = cpu.x87.st(0);
            let b = cpu.x87.st(1);
            cpu.x87.set_st(0, b);
            cpu.x87.set_st(1, a);
        }
        FpuOp::Fchs => {
            let mut v = cpu.x87.st(0);
            v.sign_exp ^= 0x8000;
            cpu.x87.set_st(0, v);
        }
        FpuOp::Fabs => {
            let mut v = cpu.x87.st(0);
            v.sign_exp &= !0x8000;
            cpu.x87.set_st(0, v);
        }
        FpuOp::Fldz => cpu.x87.push(Fp80::ZERO),
        FpuOp::Fld1 => cpu.x87.push(Fp80::from_f64(1.0)),
        FpuOp::Fldcw => {
            if let Some(Operand::Mem(m)) = operand {
                let (seg, ea) = effective_address(cpu, m);
                cpu.x87.control_word = bus.read_w(seg, ea)?;
            }
        }
        FpuOp::Fstcw => {
            if let Some(Operand::Mem(m)) = operand {
                let (seg, ea) = effective_address(cpu, m);
                bus.write_w(seg, ea, cpu.x87.control_word)?;
            }
        }
        FpuOp::Fstsw => {
            if let Some(Operand::Mem(m)) = operand {
                let (seg, ea) = effective_address(cpu, m);
                bus.write_w(seg, ea, cpu.x87.status_word)?;
            } else if let Some(Operand::Reg(Gpr::Eax, _)) = operand {
                cpu.set_reg(Gpr::Eax, Width::W16, cpu.x87.status_word as u32);
            }
        }
    }
    Ok(())
}

fn mmx_operand_index(op: &Operand) -> u8 {
    match op {
        Operand::Reg(g, _) => g.index() as u8,
        _ => 0,
    }
}

fn exec_mmx(
    cpu: &mut GuestCpuState,
    bus: &mut dyn GuestBus,
    op: MmxOp,
    dst: &Operand,
    src: Option<&Operand>,
) -> Result<(), Fault> {
    if op == MmxOp::Emms {
        cpu.x87.emms();
        return Ok(());
    }
    let dst_i = mmx_operand_index(dst);
    match op {
        MmxOp::Movd | MmxOp::Movq => {
            let src = src.ok_or(Fault::Internal("movd/movq missing source"))?;
            let bits = match src {
                Operand::Mem(m) => {
                    let (seg, ea) = effective_address(cpu, m);
                    bus.read_l(seg, ea)? as u64
                }
                Operand::Reg(g, _) => cpu.reg(*g, Width::W32) as u64,
                other => cpu.x87.mmx_read(mmx_operand_index(other)),
            };
            match dst {
                Operand::Mem(m) => {
                    let (seg, ea) = effective_address(cpu, m);
                    bus.write_l(seg, ea, bits as u32)?;
                }
                Operand::Reg(g, _) => cpu.set_reg(*g, Width::W32, bits as u32),
                _ => cpu.x87.mmx_write(dst_i, bits),
            }
        }
        MmxOp::Paddb | MmxOp::Paddw | MmxOp::Paddd | MmxOp::Psubb | MmxOp::Psubw | MmxOp::Psubd
        | MmxOp::Pand | MmxOp::Por | MmxOp::Pxor => {
            let src_i = mmx_operand_index(src.ok_or(Fault::Internal("missing mmx src"))?);
            let a = cpu.x87.mmx_read(dst_i);
            let b = cpu.x87.mmx_read(src_i);
            let result = match op {
                MmxOp::Paddb => pack_lanes(a, b, 8, u8::wrapping_add as fn(u8, u8) -> u8),
                MmxOp::Paddw => pack_lanes16(a, b, |x, y| x.wrapping_add(y)),
                MmxOp::Paddd => pack_lanes32(a, b, |x, y| x.wrapping_add(y)),
                MmxOp::Psubb => pack_lanes(a, b, 8, u8::wrapping_sub as fn(u8, u8) -> u8),
                MmxOp::Psubw => pack_lanes16(a, b, |x, y| x.wrapping_sub(y)),
                MmxOp::Psubd => pack_lanes32(a, b, |x, y| x.wrapping_sub(y)),
                MmxOp::Pand => a & b,
                MmxOp::Por => a | b,
                MmxOp::Pxor => a ^ b,
                _ => unreachable!(),
            };
            cpu.x87.mmx_write(dst_i, result);
        }
        MmxOp::Emms => unreachable!(),
    }
    Ok(())
}

fn pack_lanes(a: u64, b: u64, _lane_bits: u8, f: fn(u8, u8) -> u8) -> u64 {
    let mut out = 0u64;
    for i in 0..8 {
        let av = ((a >> (i * 8)) & 0xFF) as u8;
        let bv = ((b >> (i * 8)) & 0xFF) as u8;
        out |= (f(av, bv) as u64) << (i * 8);
    }
    out
}

fn pack_lanes16(a: u64, b: u64, f: impl Fn(u16, u16) -> u16) -> u64 {
    let mut out = 0u64;
    for i in 0..4 {
        let av = ((a >> (i * 16)) & 0xFFFF) as u16;
        let bv = ((b >> (i * 16)) & 0xFFFF) as u16;
        out |= (f(av, bv) as u64) << (i * 16);
    }
    out
}

fn pack_lanes32(a: u64, b: u64, f: impl Fn(u32, u32) -> u32) -> u64 {
    let mut out = 0u64;
    for i in 0..2 {
        let av = ((a >> (i * 32)) & 0xFFFF_FFFF) as u32;
        let bv = ((b >> (i * 32)) & 0xFFFF_FFFF) as u32;
        out |= (f(av, bv) as u64) << (i * 32);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcjit_decode::MemOperand;

    struct FlatMem {
        bytes: Vec<u8>,
    }

    impl GuestBus for FlatMem {
        fn read_b(&mut self, _seg: Seg, off: u32) -> Result<u8, Fault> {
            Ok(self.bytes[off as usize])
        }
        fn read_w(&mut self, _seg: Seg, off: u32) -> Result<u16, Fault> {
            Ok(u16::from_le_bytes([self.bytes[off as usize], self.bytes[off as usize + 1]]))
        }
        fn read_l(&mut self, _seg: Seg, off: u32) -> Result<u32, Fault> {
            let b = &self.bytes[off as usize..off as usize + 4];
            Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }
        fn write_b(&mut self, _seg: Seg, off: u32, v: u8) -> Result<(), Fault> {
            self.bytes[off as usize] = v;
            Ok(())
        }
        fn write_w(&mut self, _seg: Seg, off: u32, v: u16) -> Result<(), Fault> {
            let b = v.to_le_bytes();
            self.bytes[off as usize] = b[0];
            self.bytes[off as usize + 1] = b[1];
            Ok(())
        }
        fn write_l(&mut self, _seg: Seg, off: u32, v: u32) -> Result<(), Fault> {
            let b = v.to_le_bytes();
            self.bytes[off as usize..off as usize + 4].copy_from_slice(&b);
            Ok(())
        }
        fn phys_of(&mut self, linear: u32) -> Result<u32, Fault> {
            Ok(linear)
        }
        fn invalidate_tlb(&mut self) {}
        fn fetch_code(&mut self, _seg: Seg, ip: u32, len: u8, out: &mut [u8]) -> Result<(), Fault> {
            out.copy_from_slice(&self.bytes[ip as usize..ip as usize + len as usize]);
            Ok(())
        }
        fn read_flat_w(&mut self, addr: u32) -> Result<u16, Fault> {
            self.read_w(Seg::Ds, addr)
        }
        fn write_flat_w(&mut self, addr: u32, v: u16) -> Result<(), Fault> {
            self.write_w(Seg::Ds, addr, v)
        }
    }

    fn pmode_cpu() -> GuestCpuState {
        let mut cpu = GuestCpuState::default();
        cpu.cr.cr0 |= 1;
        cpu
    }

    fn flat_mem_operand() -> Operand {
        Operand::Mem(MemOperand {
            seg_override: None,
            base: None,
            index: None,
            scale: 1,
            disp: 0,
            width: Width::W32,
            addr_width: Width::W32,
        })
    }

    #[test]
    fn writing_a_read_only_data_segment_in_protected_mode_faults_gp() {
        let mut cpu = pmode_cpu();
        cpu.seg_mut(Seg::Ds).access &= !0x02;
        let mut bus = FlatMem { bytes: vec![0u8; 16] };
        let err = write_operand(&mut cpu, &mut bus, &flat_mem_operand(), 5).unwrap_err();
        assert!(matches!(err, Fault::GuestAbort { kind: FaultKind::GeneralProtection, .. }));
    }

    #[test]
    fn writing_through_a_not_present_segment_faults_segment_not_present() {
        let mut cpu = pmode_cpu();
        cpu.seg_mut(Seg::Ds).present = false;
        let mut bus = FlatMem { bytes: vec![0u8; 16] };
        let err = write_operand(&mut cpu, &mut bus, &flat_mem_operand(), 5).unwrap_err();
        assert!(matches!(err, Fault::GuestAbort { kind: FaultKind::SegmentNotPresent, .. }));
    }

    #[test]
    fn real_mode_never_enforces_segment_protection() {
        let mut cpu = GuestCpuState::default();
        cpu.seg_mut(Seg::Ds).access &= !0x02;
        cpu.seg_mut(Seg::Ds).present = false;
        let mut bus = FlatMem { bytes: vec![0u8; 16] };
        assert!(write_operand(&mut cpu, &mut bus, &flat_mem_operand(), 5).is_ok());
    }

    #[test]
    fn a_jump_past_the_code_segment_limit_faults_gp() {
        let mut cpu = pmode_cpu();
        cpu.seg_mut(Seg::Cs).limit = 0x10;
        let mut bus = FlatMem { bytes: vec![0u8; 64] };
        let err = exec_one(
            &mut cpu,
            &mut bus,
            &InsnKind::JmpNear { target: Operand::Imm(0x20) },
            2,
            Width::W32,
        )
        .unwrap_err();
        assert!(matches!(err, Fault::GuestAbort { kind: FaultKind::GeneralProtection, .. }));
    }

    #[test]
    fn a_jump_into_a_not_present_code_segment_faults_segment_not_present() {
        let mut cpu = pmode_cpu();
        cpu.seg_mut(Seg::Cs).present = false;
        let mut bus = FlatMem { bytes: vec![0u8; 64] };
        let err = exec_one(
            &mut cpu,
            &mut bus,
            &InsnKind::JmpNear { target: Operand::Imm(0x4) },
            2,
            Width::W32,
        )
        .unwrap_err();
        assert!(matches!(err, Fault::GuestAbort { kind: FaultKind::SegmentNotPresent, .. }));
    }

    #[test]
    fn sti_arms_the_inhibit_window_and_mov_ss_does_not_end_the_block() {
        let mut cpu = GuestCpuState::default();
        let mut bus = FlatMem { bytes: vec![0u8; 16] };
        let outcome = exec_one(&mut cpu, &mut bus, &InsnKind::Sti, 1, Width::W32).unwrap();
        assert!(outcome.ends_block, "STI always ends its own block");
        assert!(cpu.inhibit_interrupts.armed, "arming must survive past STI's own exec_one call");

        let mut cpu2 = GuestCpuState::default();
        let outcome2 = exec_one(
            &mut cpu2,
            &mut bus,
            &InsnKind::MovSeg { dst: Seg::Ss, src: Operand::Reg(Gpr::Eax, Width::W16) },
            2,
            Width::W16,
        )
        .unwrap();
        assert!(!outcome2.ends_block, "MOV SS must leave the next instruction in the same block");
        assert!(cpu2.inhibit_interrupts.armed);
    }
}
