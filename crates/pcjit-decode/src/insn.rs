use iced_x86::{Decoder, DecoderOptions, Instruction, MemorySize, Mnemonic, Register};

use crate::operand::{MemOperand, Operand};
use pcjit_types::{Fault, Gpr, OpSizeMode, Seg, Width};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Stos,
    Cmps,
    Scas,
    Lods,
}

/// Jcc/SETcc/LOOPcc condition, collapsed from iced's per-mnemonic variants
/// via `Instruction::condition_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuOp {
    Fld,
    Fst,
    Fstp,
    Fadd,
    Fmul,
    Fsub,
    Fsubr,
    Fdiv,
    Fdivr,
    Fild,
    Fist,
    Fistp,
    Fcom,
    Fcomp,
    Fxch,
    Fchs,
    Fabs,
    Fldz,
    Fld1,
    Fldcw,
    Fstcw,
    Fstsw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmxOp {
    Movd,
    Movq,
    Paddb,
    Paddw,
    Paddd,
    Psubb,
    Psubw,
    Psubd,
    Pand,
    Por,
    Pxor,
    Emms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnKind {
    Mov { dst: Operand, src: Operand },
    Alu { op: AluOp, dst: Operand, src: Operand },
    Test { a: Operand, b: Operand },
    Inc { dst: Operand },
    Dec { dst: Operand },
    Shift { op: ShiftOp, dst: Operand, count: Operand },
    Lea { dst: Gpr, addr: MemOperand },
    Push { src: Operand },
    Pop { dst: Operand },
    Pushf,
    Popf,
    Sahf,
    Lahf,
    CallNear { target: Operand },
    RetNear { imm16: u16 },
    JmpNear { target: Operand },
    JccNear { cond: Cond, target: i32 },
    LoopCx { cond: Option<bool>, target: i32 },
    Jcxz { target: i32 },
    Int { vector: u8 },
    Int3,
    Hlt,
    Cli,
    Sti,
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
    Nop,
    MovSeg { dst: Seg, src: Operand },
    StringOp { op: StringOp, rep: Option<bool> },
    Fpu { op: FpuOp, operand: Option<Operand> },
    Mmx { op: MmxOp, dst: Operand, src: Option<Operand> },
    /// LOCK prefix seen on an instruction the block-end policy does not
    /// special-case: `spec.md` §4.3 mandates ending the block rather than
    /// emitting a (possibly wrong) atomic RMW.
    LockPrefixed,
    /// No decode/emit table entry: falls through to the interpreter per
    /// `spec.md` §4.3/§7 (`UnsupportedOpcode`).
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInsn {
    pub kind: InsnKind,
    pub length: u32,
}

fn reg_gpr_width(r: Register) -> Option<(Gpr, Width)> {
    use Register::*;
    Some(match r {
        EAX => (Gpr::Eax, Width::W32),
        ECX => (Gpr::Ecx, Width::W32),
        EDX => (Gpr::Edx, Width::W32),
        EBX => (Gpr::Ebx, Width::W32),
        ESP => (Gpr::Esp, Width::W32),
        EBP => (Gpr::Ebp, Width::W32),
        ESI => (Gpr::Esi, Width::W32),
        EDI => (Gpr::Edi, Width::W32),
        AX => (Gpr::Eax, Width::W16),
        CX => (Gpr::Ecx, Width::W16),
        DX => (Gpr::Edx, Width::W16),
        BX => (Gpr::Ebx, Width::W16),
        SP => (Gpr::Esp, Width::W16),
        BP => (Gpr::Ebp, Width::W16),
        SI => (Gpr::Esi, Width::W16),
        DI => (Gpr::Edi, Width::W16),
        AL => (Gpr::Eax, Width::W8),
        CL => (Gpr::Ecx, Width::W8),
        DL => (Gpr::Edx, Width::W8),
        BL => (Gpr::Ebx, Width::W8),
        _ => return Option::None,
    })
}

fn reg_high8(r: Register) -> Option<Gpr> {
    use Register::*;
    Some(match r {
        AH => Gpr::Eax,
        CH => Gpr::Ecx,
        DH => Gpr::Edx,
        BH => Gpr::Ebx,
        _ => return Option::None,
    })
}

fn reg_seg(r: Register) -> Option<Seg> {
    use Register::*;
    Some(match r {
        ES => Seg::Es,
        CS => Seg::Cs,
        SS => Seg::Ss,
        DS => Seg::Ds,
        FS => Seg::Fs,
        GS => Seg::Gs,
        _ => return Option::None,
    })
}

fn memory_size_width(ms: MemorySize, fallback: Width) -> Width {
    match ms {
        MemorySize::UInt8 | MemorySize::Int8 => Width::W8,
        MemorySize::UInt16 | MemorySize::Int16 => Width::W16,
        MemorySize::UInt32 | MemorySize::Int32 => Width::W32,
        _ => fallback,
    }
}

fn mem_operand(instr: &Instruction, fallback_width: Width) -> MemOperand {
    let base = reg_gpr_width(instr.memory_base()).map(|(g, _)| g);
    let index = reg_gpr_width(instr.memory_index()).map(|(g, _)| g);
    let scale = instr.memory_index_scale() as u8;
    let disp = instr.memory_displacement32() as i32;
    let seg_override = reg_seg(instr.memory_segment());
    let addr_width = if instr.code_size() == iced_x86::CodeSize::Code16 {
        Width::W16
    } else {
        Width::W32
    };
    MemOperand {
        seg_override,
        base,
        index,
        scale: if index.is_some() { scale } else { 1 },
        disp,
        width: memory_size_width(instr.memory_size(), fallback_width),
        addr_width,
    }
}

fn operand_at(instr: &Instruction, idx: u32, width: Width) -> Operand {
    use iced_x86::OpKind;
    match instr.op_kind(idx) {
        OpKind::Register => {
            let r = instr.op_register(idx);
            if let Some(g) = reg_high8(r) {
                Operand::RegHigh8(g)
            } else if let Some((g, w)) = reg_gpr_width(r) {
                Operand::Reg(g, w)
            } else {
                Operand::Imm(0)
            }
        }
        OpKind::Memory => Operand::Mem(mem_operand(instr, width)),
        OpKind::Immediate8 | OpKind::Immediate8to32 => Operand::Imm(instr.immediate8() as i8 as i32),
        OpKind::Immediate16 => Operand::Imm(instr.immediate16() as i16 as i32),
        OpKind::Immediate32 => Operand::Imm(instr.immediate32() as i32),
        OpKind::NearBranch16 => Operand::Rel(instr.near_branch16() as i32),
        OpKind::NearBranch32 => Operand::Rel(instr.near_branch32() as i32),
        _ => Operand::Imm(0),
    }
}

fn cond_of(instr: &Instruction) -> Option<Cond> {
    use iced_x86::ConditionCode;
    Some(match instr.condition_code() {
        ConditionCode::None => return Option::None,
        ConditionCode::o => Cond::O,
        ConditionCode::no => Cond::No,
        ConditionCode::b => Cond::B,
        ConditionCode::ae => Cond::Ae,
        ConditionCode::e => Cond::E,
        ConditionCode::ne => Cond::Ne,
        ConditionCode::be => Cond::Be,
        ConditionCode::a => Cond::A,
        ConditionCode::s => Cond::S,
        ConditionCode::ns => Cond::Ns,
        ConditionCode::p => Cond::P,
        ConditionCode::np => Cond::Np,
        ConditionCode::l => Cond::L,
        ConditionCode::ge => Cond::Ge,
        ConditionCode::le => Cond::Le,
        ConditionCode::g => Cond::G,
    })
}

fn classify(instr: &Instruction, op_width: Width) -> InsnKind {
    use Mnemonic::*;
    if instr.has_lock_prefix() {
        return InsnKind::LockPrefixed;
    }
    let op0 = || operand_at(instr, 0, op_width);
    let op1 = || operand_at(instr, 1, op_width);
    match instr.mnemonic() {
        Mov => {
            // MOV to/from a segment register starts the one-instruction
            // interrupt-inhibit window for SS (`spec.md` §4.3).
            if let Some(seg) = reg_seg(instr.op0_register()) {
                return InsnKind::MovSeg { dst: seg, src: op1() };
            }
            InsnKind::Mov { dst: op0(), src: op1() }
        }
        Add => InsnKind::Alu { op: AluOp::Add, dst: op0(), src: op1() },
        Or => InsnKind::Alu { op: AluOp::Or, dst: op0(), src: op1() },
        Adc => InsnKind::Alu { op: AluOp::Adc, dst: op0(), src: op1() },
        Sbb => InsnKind::Alu { op: AluOp::Sbb, dst: op0(), src: op1() },
        And => InsnKind::Alu { op: AluOp::And, dst: op0(), src: op1() },
        Sub => InsnKind::Alu { op: AluOp::Sub, dst: op0(), src: op1() },
        Xor => InsnKind::Alu { op: AluOp::Xor, dst: op0(), src: op1() },
        Cmp => InsnKind::Alu { op: AluOp::Cmp, dst: op0(), src: op1() },
        Test => InsnKind::Test { a: op0(), b: op1() },
        Inc => InsnKind::Inc { dst: op0() },
        Dec => InsnKind::Dec { dst: op0() },
        Shl | Sal => InsnKind::Shift { op: ShiftOp::Shl, dst: op0(), count: op1() },
        Shr => InsnKind::Shift { op: ShiftOp::Shr, dst: op0(), count: op1() },
        Sar => InsnKind::Shift { op: ShiftOp::Sar, dst: op0(), count: op1() },
        Rol => InsnKind::Shift { op: ShiftOp::Rol, dst: op0(), count: op1() },
        Ror => InsnKind::Shift { op: ShiftOp::Ror, dst: op0(), count: op1() },
        Lea => match op1() {
            Operand::Mem(m) => InsnKind::Lea {
                dst: match op0() {
                    Operand::Reg(g, _) => g,
                    _ => Gpr::Eax,
                },
                addr: m,
            },
            _ => InsnKind::Unsupported,
        },
        Push => InsnKind::Push { src: op0() },
        Pop => InsnKind::Pop { dst: op0() },
        Pushfd | Pushf => InsnKind::Pushf,
        Popfd | Popf => InsnKind::Popf,
        Sahf => InsnKind::Sahf,
        Lahf => InsnKind::Lahf,
        Call => InsnKind::CallNear { target: op0() },
        Ret => {
            let imm16 = match instr.op_count() {
                0 => 0,
                _ => instr.immediate16(),
            };
            InsnKind::RetNear { imm16 }
        }
        Jmp => InsnKind::JmpNear { target: op0() },
        Loop => InsnKind::LoopCx { cond: None, target: operand_rel(instr) },
        Loope => InsnKind::LoopCx { cond: Some(true), target: operand_rel(instr) },
        Loopne => InsnKind::LoopCx { cond: Some(false), target: operand_rel(instr) },
        Jcxz | Jecxz => InsnKind::Jcxz { target: operand_rel(instr) },
        Int3 => InsnKind::Int3,
        Int => InsnKind::Int { vector: instr.immediate8() },
        Hlt => InsnKind::Hlt,
        Cli => InsnKind::Cli,
        Sti => InsnKind::Sti,
        Clc => InsnKind::Clc,
        Stc => InsnKind::Stc,
        Cmc => InsnKind::Cmc,
        Cld => InsnKind::Cld,
        Std => InsnKind::Std,
        Nop => InsnKind::Nop,
        Movsb | Movsw | Movsd => InsnKind::StringOp { op: StringOp::Movs, rep: rep_of(instr) },
        Stosb | Stosw | Stosd => InsnKind::StringOp { op: StringOp::Stos, rep: rep_of(instr) },
        Cmpsb | Cmpsw | Cmpsd => InsnKind::StringOp { op: StringOp::Cmps, rep: rep_of(instr) },
        Scasb | Scasw | Scasd => InsnKind::StringOp { op: StringOp::Scas, rep: rep_of(instr) },
        Lodsb | Lodsw | Lodsd => InsnKind::StringOp { op: StringOp::Lods, rep: rep_of(instr) },
        Fld => InsnKind::Fpu { op: FpuOp::Fld, operand: Some(op0()) },
        Fst => InsnKind::Fpu { op: FpuOp::Fst, operand: Some(op0()) },
        Fstp => InsnKind::Fpu { op: FpuOp::Fstp, operand: Some(op0()) },
        Fadd | Faddp => InsnKind::Fpu { op: FpuOp::Fadd, operand: op0_if_any(instr, op_width) },
        Fmul | Fmulp => InsnKind::Fpu { op: FpuOp::Fmul, operand: op0_if_any(instr, op_width) },
        Fsub | Fsubp => InsnKind::Fpu { op: FpuOp::Fsub, operand: op0_if_any(instr, op_width) },
        Fsubr | Fsubrp => InsnKind::Fpu { op: FpuOp::Fsubr, operand: op0_if_any(instr, op_width) },
        Fdiv | Fdivp => InsnKind::Fpu { op: FpuOp::Fdiv, operand: op0_if_any(instr, op_width) },
        Fdivr | Fdivrp => InsnKind::Fpu { op: FpuOp::Fdivr, operand: op0_if_any(instr, op_width) },
        Fild => InsnKind::Fpu { op: FpuOp::Fild, operand: Some(op0()) },
        Fist => InsnKind::Fpu { op: FpuOp::Fist, operand: Some(op0()) },
        Fistp => InsnKind::Fpu { op: FpuOp::Fistp, operand: Some(op0()) },
        Fcom => InsnKind::Fpu { op: FpuOp::Fcom, operand: op0_if_any(instr, op_width) },
        Fcomp => InsnKind::Fpu { op: FpuOp::Fcomp, operand: op0_if_any(instr, op_width) },
        Fxch => InsnKind::Fpu { op: FpuOp::Fxch, operand: None },
        Fchs => InsnKind::Fpu { op: FpuOp::Fchs, operand: None },
        Fabs => InsnKind::Fpu { op: FpuOp::Fabs, operand: None },
        Fldz => InsnKind::Fpu { op: FpuOp::Fldz, operand: None },
        Fld1 => InsnKind::Fpu { op: FpuOp::Fld1, operand: None },
        Fldcw => InsnKind::Fpu { op: FpuOp::Fldcw, operand: Some(op0()) },
        Fnstcw | Fstcw => InsnKind::Fpu { op: FpuOp::Fstcw, operand: Some(op0()) },
        Fnstsw | Fstsw => InsnKind::Fpu { op: FpuOp::Fstsw, operand: Some(op0()) },
        Movd => InsnKind::Mmx { op: MmxOp::Movd, dst: op0(), src: Some(op1()) },
        Movq => InsnKind::Mmx { op: MmxOp::Movq, dst: op0(), src: Some(op1()) },
        Paddb => InsnKind::Mmx { op: MmxOp::Paddb, dst: op0(), src: Some(op1()) },
        Paddw => InsnKind::Mmx { op: MmxOp::Paddw, dst: op0(), src: Some(op1()) },
        Paddd => InsnKind::Mmx { op: MmxOp::Paddd, dst: op0(), src: Some(op1()) },
        Psubb => InsnKind::Mmx { op: MmxOp::Psubb, dst: op0(), src: Some(op1()) },
        Psubw => InsnKind::Mmx { op: MmxOp::Psubw, dst: op0(), src: Some(op1()) },
        Psubd => InsnKind::Mmx { op: MmxOp::Psubd, dst: op0(), src: Some(op1()) },
        Pand => InsnKind::Mmx { op: MmxOp::Pand, dst: op0(), src: Some(op1()) },
        Por => InsnKind::Mmx { op: MmxOp::Por, dst: op0(), src: Some(op1()) },
        Pxor => InsnKind::Mmx { op: MmxOp::Pxor, dst: op0(), src: Some(op1()) },
        Emms => InsnKind::Mmx { op: MmxOp::Emms, dst: Operand::Imm(0), src: None },
        _ => {
            if let Some(cond) = cond_of(instr) {
                InsnKind::JccNear { cond, target: operand_rel(instr) }
            } else {
                InsnKind::Unsupported
            }
        }
    }
}

fn op0_if_any(instr: &Instruction, width: Width) -> Option<Operand> {
    if instr.op_count() == 0 {
        None
    } else {
        Some(operand_at(instr, 0, width))
    }
}

fn operand_rel(instr: &Instruction) -> i32 {
    match operand_at(instr, 0, Width::W32) {
        Operand::Rel(r) => r,
        Operand::Imm(i) => i,
        _ => 0,
    }
}

fn rep_of(instr: &Instruction) -> Option<bool> {
    if instr.has_rep_prefix() {
        Some(true)
    } else if instr.has_repne_prefix() {
        Some(false)
    } else {
        None
    }
}

/// Decode one instruction starting at `bytes[0]`, which must begin at guest
/// linear address `ip`. `mode` selects the 16/32-bit operand-size table;
/// address-size/operand-size prefixes are honoured by the decoder itself.
pub fn decode_one(bytes: &[u8], ip: u32, mode: OpSizeMode) -> Result<DecodedInsn, Fault> {
    let bitness = match mode {
        OpSizeMode::Bits16 => 16,
        OpSizeMode::Bits32 => 32,
    };
    let mut decoder = Decoder::with_ip(bitness, bytes, ip as u64, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Err(Fault::UnsupportedOpcode);
    }
    let instr = decoder.decode();
    if instr.is_invalid() {
        return Err(Fault::UnsupportedOpcode);
    }
    let op_width = mode.default_width();
    let kind = classify(&instr, op_width);
    Ok(DecodedInsn {
        kind,
        length: instr.len() as u32,
    })
}
