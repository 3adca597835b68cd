//! C6: the top-level executor loop (`spec.md` §4.6).
//!
//! Grounded on the teacher's `Vm::run_slice` trampoline
//! (`examples/wilsonzlin-aero/crates/aero-cpu/src/exec.rs`): look a block up
//! by physical address, fall back to the interpreter below a hotness
//! threshold, otherwise compile and cache it, then check for pending
//! traps/interrupts at the block boundary before looping again. The
//! dispatcher-trait seam Design Notes §9 calls for ("pass a dispatcher
//! trait object... rather than by name") is `BlockCompiler`: this crate
//! only defines the trait, `pcjit-jit` implements it, which keeps
//! `pcjit-cpu` from depending on `pcjit-jit`'s emit tables.

use std::collections::HashMap;

use pcjit_types::{Fault, Seg};

use crate::bus::{GuestBus, InterruptSource};
use crate::interp;
use crate::interrupt;
use crate::jit::cache::{BlockCache, BlockStatus, CodeBlock};
use crate::state::GuestCpuState;

/// Per-block structural limits (`spec.md` §4.5: a compiled block's
/// `host_code` arena is bounded both in guest-byte span and instruction
/// count so a pathological straight-line run can't grow it unboundedly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitConfig {
    /// Visits to a given phys/CS/status combination before the executor
    /// compiles it instead of continuing to interpret.
    pub hot_threshold: u32,
    pub max_block_insts: u32,
    pub max_block_bytes: u32,
    pub cache_capacity: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            hot_threshold: 1,
            max_block_insts: 4096,
            max_block_bytes: 1000,
            cache_capacity: 4096,
        }
    }
}

/// Implemented by `pcjit-jit`. Given the guest state sitting at a block's
/// first byte, decode and lower instructions into a `CodeBlock` without
/// mutating architectural state (`cpu`/`bus` are borrowed only to read code
/// bytes and the current mode bits the decoder needs).
pub trait BlockCompiler {
    fn compile(
        &mut self,
        cpu: &GuestCpuState,
        bus: &mut dyn GuestBus,
        phys_start: u32,
        config: JitConfig,
    ) -> Result<CodeBlock, Fault>;
}

/// Why `step_block` stopped, for callers that want to distinguish a
/// faultless block exit from an instruction-level trap (`spec.md` §8
/// property 6: "precise PC on fault").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    BlockBoundary,
    SingleStepWarmup,
    TrapFlag,
    Interrupt(u8),
}

/// Poll-able counters for the executor's own decisions, alongside
/// `BlockCache::stats` for the cache's (`SPEC_FULL.md` "Ambient stack" —
/// no per-instruction logging on this hot path, plain counters instead).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub single_step_warmups: u64,
    pub blocks_run: u64,
    pub recompiles: u64,
    pub fpu_stale_recompiles: u64,
}

pub struct Executor {
    pub cache: BlockCache,
    pub config: JitConfig,
    visit_counts: HashMap<u32, u32>,
    stats: ExecutorStats,
}

impl Executor {
    pub fn new(config: JitConfig) -> Self {
        Executor {
            cache: BlockCache::new(config.cache_capacity, 256),
            config,
            visit_counts: HashMap::new(),
            stats: ExecutorStats::default(),
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats
    }

    fn status_of(cpu: &GuestCpuState) -> BlockStatus {
        BlockStatus {
            op_size: cpu.op_size,
            protected_mode: cpu.cr.protected_mode(),
            stack_is_32: cpu.stack_is_32,
        }
    }

    /// Drop the cache and visit counters; called on the reset/mode-change
    /// triggers `spec.md` §6 lists (the embedder is responsible for calling
    /// this at the same points it would call `BlockCache::clear` directly).
    pub fn invalidate_all(&mut self) {
        self.cache.clear();
        self.visit_counts.clear();
    }

    /// Run one step of the `spec.md` §4.6 loop: look up or build a block at
    /// `cpu.pc`, execute it, then service a pending trap or interrupt.
    pub fn step_block(
        &mut self,
        cpu: &mut GuestCpuState,
        bus: &mut dyn GuestBus,
        compiler: &mut dyn BlockCompiler,
        irq: &mut dyn InterruptSource,
    ) -> Result<StopReason, Fault> {
        if cpu.halted {
            if self.poll_wakeup(cpu, bus, irq)? {
                cpu.halted = false;
            } else {
                cpu.tsc = cpu.tsc.wrapping_add(1);
                return Ok(StopReason::BlockBoundary);
            }
        }

        let cs_base = cpu.seg(Seg::Cs).base;
        let phys = bus.phys_of(cs_base.wrapping_add(cpu.pc))?;
        let status = Self::status_of(cpu);

        let reason = if let Some(mut block) = self.cache.get_cloned(phys, cs_base, status) {
            if self.block_is_fpu_stale(&block, cpu) {
                self.stats.fpu_stale_recompiles += 1;
                block = self.recompile(cpu, bus, compiler, phys)?;
            }
            let outcome = crate::jit::ir::run_block(cpu, bus, &block.host_code)?;
            cpu.pc = outcome.next_pc;
            self.stats.blocks_run += 1;
            StopReason::BlockBoundary
        } else {
            let visits = self.visit_counts.entry(phys).or_insert(0);
            *visits += 1;
            if *visits < self.config.hot_threshold.max(1) {
                let outcome = interp::step(cpu, bus)?;
                cpu.pc = outcome.next_pc;
                self.stats.single_step_warmups += 1;
                StopReason::SingleStepWarmup
            } else {
                match self.recompile(cpu, bus, compiler, phys) {
                    Ok(block) => {
                        let outcome = crate::jit::ir::run_block(cpu, bus, &block.host_code)?;
                        cpu.pc = outcome.next_pc;
                        self.stats.blocks_run += 1;
                        StopReason::BlockBoundary
                    }
                    // No emit-table entry for whatever sits at `phys`
                    // (`spec.md` §9 Open Question: "0F-table holes fall
                    // back to the interpreter"): run it one instruction at
                    // a time instead of failing the whole step.
                    Err(Fault::UnsupportedOpcode) => {
                        let outcome = interp::step(cpu, bus)?;
                        cpu.pc = outcome.next_pc;
                        self.stats.single_step_warmups += 1;
                        StopReason::SingleStepWarmup
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        cpu.tsc = cpu.tsc.wrapping_add(1);
        // Read after running, not before: `STI`/`MOV SS` arms this during
        // the run that just happened, and it must still read `true` here
        // so no trap/interrupt is serviced until the one additional
        // instruction the one-shot counter in `run_block`/`step` lets run
        // afterwards has also completed (`spec.md` §5).
        if cpu.inhibit_interrupts.armed {
            return Ok(reason);
        }
        self.service_pending_traps(cpu, bus, irq, reason)
    }

    fn recompile(
        &mut self,
        cpu: &GuestCpuState,
        bus: &mut dyn GuestBus,
        compiler: &mut dyn BlockCompiler,
        phys: u32,
    ) -> Result<CodeBlock, Fault> {
        let block = compiler.compile(cpu, bus, phys, self.config)?;
        self.cache.insert(block.clone())?;
        self.stats.recompiles += 1;
        Ok(block)
    }

    /// Scenario E: a block compiled under one static `TOP` assumption is
    /// entered again with the FPU stack rotated. Execution is always
    /// correct regardless (`X87State` always indexes by the live `top`,
    /// never by a value baked in at compile time), but the cache still
    /// tracks the mismatch and forces a recompile so `fpu_top_static`
    /// reflects reality rather than a stale guess.
    fn block_is_fpu_stale(&self, block: &CodeBlock, cpu: &GuestCpuState) -> bool {
        matches!(
            block.fpu_top_static,
            crate::fpu::FpuTopAssumption::Static(top) if top != cpu.x87.top
        )
    }

    fn service_pending_traps(
        &mut self,
        cpu: &mut GuestCpuState,
        bus: &mut dyn GuestBus,
        irq: &mut dyn InterruptSource,
        reason: StopReason,
    ) -> Result<StopReason, Fault> {
        cpu.materialise_flags();
        if cpu.flag(crate::flags::eflags_bits::TF) {
            dispatch(cpu, bus, 1, false)?;
            return Ok(StopReason::TrapFlag);
        }
        if irq.nmi() && irq.nmi_enable() && !irq.nmi_mask() {
            dispatch(cpu, bus, 2, false)?;
            return Ok(StopReason::Interrupt(2));
        }
        if cpu.flag(crate::flags::eflags_bits::IF) {
            if let Some(vector) = irq.pending_irq_vector() {
                dispatch(cpu, bus, vector, false)?;
                return Ok(StopReason::Interrupt(vector));
            }
        }
        Ok(reason)
    }

    fn poll_wakeup(
        &mut self,
        cpu: &mut GuestCpuState,
        _bus: &mut dyn GuestBus,
        irq: &mut dyn InterruptSource,
    ) -> Result<bool, Fault> {
        cpu.materialise_flags();
        let nmi = irq.nmi() && irq.nmi_enable() && !irq.nmi_mask();
        let irq_pending = cpu.flag(crate::flags::eflags_bits::IF) && irq.pending_irq_vector().is_some();
        Ok(nmi || irq_pending)
    }
}

fn dispatch(cpu: &mut GuestCpuState, bus: &mut dyn GuestBus, vector: u8, software: bool) -> Result<(), Fault> {
    if cpu.cr.protected_mode() {
        interrupt::raise_pmode_int(cpu, bus, vector, software)
    } else {
        interrupt::raise_rmode_int(cpu, bus, vector)
    }
}
