//! Fuzz-style differential test: generate random short ALU/INC/DEC traces
//! and require the compiled-IR path and the single-stepped interpreter to
//! land on identical guest state, over many seeds. Stands in for the
//! teacher's `tier1_random_ir_equiv.rs` at a scale this crate's much
//! smaller opcode surface warrants (`spec.md` §8: "interpreter and compiled
//! path agree on architectural state after any block").

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use pcjit_cpu::exec::{BlockCompiler, JitConfig};
use pcjit_cpu::{interp, GuestBus, GuestCpuState};
use pcjit_jit::JitCompiler;
use pcjit_types::{Fault, Gpr, OpSizeMode, Seg};

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
    cpu.gpr[Gpr::Eax.index()] = 0x1234;
    cpu.gpr[Gpr::Ebx.index()] = 7;
    cpu.gpr[Gpr::Ecx.index()] = 0xFFFF_FFF0;
    cpu
}

/// One-byte `INC`/`DEC r32` forms plus `ADD/SUB/AND/OR/XOR r32, imm8`
/// (opcode `83 /r ib`), terminated by a short `JMP $` so every trace ends
/// the block the same way. Picking only single-byte-prefix encodings keeps
/// every generated trace guaranteed-decodable, which is the point: this
/// harness is about ALU/flags equivalence, not decoder coverage.
fn random_trace(rng: &mut ChaCha8Rng, len: usize) -> Vec<u8> {
    let regs = [0u8, 1, 2, 3]; // eax, ecx, edx, ebx
    let mut bytes = Vec::new();
    for _ in 0..len {
        match rng.gen_range(0..4u32) {
            0 => bytes.push(0x40 + regs[rng.gen_range(0..4usize)]), // INC r32
            1 => bytes.push(0x48 + regs[rng.gen_range(0..4usize)]), // DEC r32
            _ => {
                let reg = regs[rng.gen_range(0..4usize)];
                let op_ext = [0u8, 1, 4, 6][rng.gen_range(0..4usize)]; // add/or/and/xor
                bytes.push(0x83);
                bytes.push(0xC0 | (op_ext << 3) | reg);
                bytes.push(rng.gen());
            }
        }
    }
    bytes.push(0xEB);
    bytes.push(0x00); // JMP short $
    bytes
}

#[test]
fn compiled_and_interpreted_traces_agree_across_many_random_seeds() {
    for seed in 0..64u64 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let program = random_trace(&mut rng, 12);

        let mut interp_cpu = fresh_cpu();
        let mut interp_bus = FlatMem { bytes: program.clone() };
        loop {
            let outcome = interp::step(&mut interp_cpu, &mut interp_bus).unwrap();
            interp_cpu.pc = outcome.next_pc;
            if outcome.ends_block {
                break;
            }
        }

        let mut jit_cpu = fresh_cpu();
        let mut jit_bus = FlatMem { bytes: program };
        let mut compiler = JitCompiler;
        let block = compiler
            .compile(&jit_cpu, &mut jit_bus, 0, JitConfig::default())
            .unwrap();
        let outcome =
            pcjit_cpu::jit::ir::run_block(&mut jit_cpu, &mut jit_bus, &block.host_code).unwrap();
        jit_cpu.pc = outcome.next_pc;

        assert_eq!(jit_cpu.gpr, interp_cpu.gpr, "seed {seed}");
        assert_eq!(jit_cpu.eflags, interp_cpu.eflags, "seed {seed}");
        assert_eq!(jit_cpu.lazy_flags, interp_cpu.lazy_flags, "seed {seed}");
    }
}
