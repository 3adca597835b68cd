//! Cross-crate equivalence: running a block through the compiled-IR path
//! must land on exactly the same guest state as single-stepping the same
//! bytes through the interpreter. Grounded on the teacher's own
//! `tier1_end_to_end_with_aero_cpu_core.rs`/`pf008_*` differential style
//! (compile once, interpret once, compare state), standing in for the
//! random-trace fuzz harness (`tier1_random_ir_equiv.rs`) at a scale this
//! crate's much smaller opcode surface warrants.

use pcjit_cpu::exec::{BlockCompiler, JitConfig};
use pcjit_cpu::{interp, GuestBus, GuestCpuState};
use pcjit_jit::JitCompiler;
use pcjit_types::{Fault, Gpr, OpSizeMode, Seg, Width};

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
        let ip = ip as usize;
        let len = len as usize;
        let avail = self.bytes.len().saturating_sub(ip).min(len);
        out[..avail].copy_from_slice(&self.bytes[ip..ip + avail]);
        for b in &mut out[avail..] {
            *b = 0x90;
        }
        Ok(())
    }
    fn read_flat_w(&mut self, addr: u32) -> Result<u16, Fault> {
        self.read_w(Seg::Ds, addr)
    }
    fn write_flat_w(&mut self, addr: u32, v: u16) -> Result<(), Fault> {
        self.write_w(Seg::Ds, addr, v)
    }
}

fn fresh_cpu() -> GuestCpuState {
    let mut cpu = GuestCpuState::default();
    cpu.pc = 0;
    cpu.seg_mut(Seg::Cs).base = 0;
    cpu.op_size = OpSizeMode::Bits32;
    cpu.gpr[Gpr::Eax.index()] = 10;
    cpu.gpr[Gpr::Ebx.index()] = 0;
    cpu.gpr[Gpr::Ecx.index()] = 3;
    cpu
}

// ADD EAX, 5 (83 C0 05); INC EBX (43); DEC ECX (49); JMP short $ (EB 00)
const PROGRAM: [u8; 8] = [0x83, 0xC0, 0x05, 0x43, 0x49, 0xEB, 0x00, 0x90];

#[test]
fn compiled_block_matches_single_stepped_interpretation() {
    let mut interp_cpu = fresh_cpu();
    let mut interp_bus = FlatMem { bytes: PROGRAM.to_vec() };
    loop {
        let outcome = interp::step(&mut interp_cpu, &mut interp_bus).unwrap();
        interp_cpu.pc = outcome.next_pc;
        if outcome.ends_block {
            break;
        }
    }

    let mut jit_cpu = fresh_cpu();
    let mut jit_bus = FlatMem { bytes: PROGRAM.to_vec() };
    let mut compiler = JitCompiler;
    let block = compiler
        .compile(&jit_cpu, &mut jit_bus, 0, JitConfig::default())
        .unwrap();
    let outcome = pcjit_cpu::jit::ir::run_block(&mut jit_cpu, &mut jit_bus, &block.host_code).unwrap();
    jit_cpu.pc = outcome.next_pc;

    assert_eq!(jit_cpu.gpr, interp_cpu.gpr);
    assert_eq!(jit_cpu.pc, interp_cpu.pc);
    assert_eq!(jit_cpu.eflags, interp_cpu.eflags);
    assert_eq!(jit_cpu.lazy_flags, interp_cpu.lazy_flags);
}

#[test]
fn unsupported_first_instruction_reports_unsupported_opcode() {
    // 0F 0B is UD2: iced decodes it successfully but this crate's
    // classifier has no case for it, so it surfaces as `Unsupported` with
    // no table entry — the compiler must bail rather than silently
    // skipping it.
    let cpu = fresh_cpu();
    let mut bus = FlatMem { bytes: vec![0x0F, 0x0B, 0x90, 0x90] };
    let mut compiler = JitCompiler;
    let err = compiler.compile(&cpu, &mut bus, 0, JitConfig::default());
    assert!(matches!(err, Err(Fault::UnsupportedOpcode)));
}
