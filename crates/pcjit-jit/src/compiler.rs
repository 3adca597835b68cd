//! The `BlockCompiler` implementation: walks guest bytes forward from a
//! block's entry, consults [`crate::tables`] per instruction, and packages
//! the result into a `pcjit_cpu::jit::cache::CodeBlock`.
//!
//! Grounded on the teacher's Tier-1 compile path (`aero-jit-x86`'s
//! `tier1::pipeline` walks a RIP forward building a block under a byte/
//! instruction cap and bails at the first unsupported opcode), adapted to
//! this core's data-only IR instead of a WASM/native codegen target.

use pcjit_cpu::exec::{BlockCompiler, JitConfig};
use pcjit_cpu::fpu::FpuTopAssumption;
use pcjit_cpu::jit::cache::{BlockStatus, CodeBlock};
use pcjit_cpu::jit::ir::IrOp;
use pcjit_cpu::jit::pages;
use pcjit_cpu::{GuestBus, GuestCpuState};
use pcjit_decode::decode_one;
use pcjit_types::{Fault, Seg};

use crate::tables;

#[derive(Debug, Default)]
pub struct JitCompiler;

impl BlockCompiler for JitCompiler {
    fn compile(
        &mut self,
        cpu: &GuestCpuState,
        bus: &mut dyn GuestBus,
        phys_start: u32,
        config: JitConfig,
    ) -> Result<CodeBlock, Fault> {
        let cs_base = cpu.seg(Seg::Cs).base;
        let mut pc = cpu.pc;
        let mut ops: Vec<IrOp> = Vec::new();
        let mut bytes_used = 0u32;
        let mut saw_fpu = false;
        let mut phys_end = phys_start;
        let mut phys_2 = None;

        loop {
            // A fault here (e.g. the second page of a cross-page block not
            // being present) must not discard instructions already decoded
            // from the first page (`spec.md` §4.5 step 5 / §8 Scenario F):
            // once `ops` is non-empty, stop the walk and hand back the
            // partial block instead of propagating the fault out of
            // `compile()`. The executor will re-enter at the block's
            // `guest_end_pc`, which is exactly the faulting instruction, so
            // the fault resurfaces there with a precise PC next time.
            let phys = match bus.phys_of(cs_base.wrapping_add(pc)) {
                Ok(p) => p,
                Err(e) if ops.is_empty() => return Err(e),
                Err(_) => break,
            };
            if phys_2.is_none() && pages::page_number(phys) != pages::page_number(phys_start) {
                phys_2 = Some(phys);
            }

            let mut code = [0u8; 15];
            if let Err(e) = bus.fetch_code(Seg::Cs, pc, 15, &mut code) {
                if ops.is_empty() {
                    return Err(e);
                }
                break;
            }
            let decoded = decode_one(&code, pc, cpu.op_size);

            let decoded = match decoded {
                Ok(d) => d,
                // Can't even decode what's here: end the block before it so
                // the executor retries this address through the
                // interpreter, which reports the fault precisely.
                Err(_) if ops.is_empty() => return Err(Fault::UnsupportedOpcode),
                Err(_) => break,
            };

            if !tables::has_table_entry(&decoded.kind) {
                if ops.is_empty() {
                    return Err(Fault::UnsupportedOpcode);
                }
                break;
            }

            if touches_fpu(&decoded.kind) {
                saw_fpu = true;
            }

            let ends = tables::ends_block(&decoded.kind);
            ops.push(IrOp {
                guest_pc: pc,
                kind: decoded.kind,
                length: decoded.length,
                width: cpu.op_size.default_width(),
            });
            bytes_used += decoded.length;
            pc = pc.wrapping_add(decoded.length);
            phys_end = phys.wrapping_add(decoded.length);

            if ends
                || ops.len() as u32 >= config.max_block_insts
                || bytes_used >= config.max_block_bytes
            {
                break;
            }
        }

        let page_mask = if let Some(p2) = phys_2 {
            pages::sub_page_mask(phys_start % pages::PAGE_SIZE, p2.wrapping_sub(phys_start).min(pages::PAGE_SIZE))
        } else {
            pages::sub_page_mask(phys_start % pages::PAGE_SIZE, phys_end.wrapping_sub(phys_start).max(1))
        };
        let page_mask_2 = phys_2
            .map(|p2| pages::sub_page_mask(p2 % pages::PAGE_SIZE, phys_end.wrapping_sub(p2).max(1)))
            .unwrap_or(0);

        Ok(CodeBlock {
            host_code: ops,
            entry_point: phys_start,
            guest_cs_base: cs_base,
            guest_phys_start: phys_start,
            guest_phys_end: phys_end,
            guest_end_pc: pc,
            phys_2,
            status: BlockStatus {
                op_size: cpu.op_size,
                protected_mode: cpu.cr.protected_mode(),
                stack_is_32: cpu.stack_is_32,
            },
            page_mask,
            page_mask_2,
            fpu_top_static: if saw_fpu {
                FpuTopAssumption::Static(cpu.x87.top)
            } else {
                FpuTopAssumption::Static(0)
            },
            valid: true,
            was_recompiled: true,
        })
    }
}

fn touches_fpu(kind: &pcjit_decode::InsnKind) -> bool {
    tables::touches_fpu(kind)
}
