//! C5: the block cache (`spec.md` §3 `CodeBlock`/`Cache`, §4.5).
//!
//! Shape grounded on the teacher's `CodeCache`/`CompiledBlockHandle`/
//! `CompiledBlockMeta` (`examples/wilsonzlin-aero/crates/aero-cpu-core/
//! tests/code_cache.rs`: `CodeCache::new(capacity, ..)`, `.insert()`
//! returning the evicted handles, `.get_cloned()`, `.contains()`). The
//! per-sub-page auxiliary disambiguation tree `spec.md` §4.5 step 3
//! describes is simplified here to a linear scan over the `Vec` stored at
//! each `guest_phys_start` key — correct, and cheap enough in practice
//! since same-phys-different-status collisions are rare; noted as a
//! simplification in `DESIGN.md` rather than implemented as a second index.

use std::collections::{HashMap, VecDeque};

use pcjit_types::{Fault, OpSizeMode};

use super::ir::IrOp;
use super::pages::{self, PageTable, PAGE_SIZE};
use crate::fpu::FpuTopAssumption;

/// The mode bits a compiled block was emitted under; a lookup whose live
/// `BlockStatus` doesn't match a candidate forces a miss (`spec.md` §4.5
/// step 2: "verify... `block.status == cpu_status`").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockStatus {
    pub op_size: OpSizeMode,
    pub protected_mode: bool,
    pub stack_is_32: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub host_code: Vec<IrOp>,
    pub entry_point: u32,
    pub guest_cs_base: u32,
    pub guest_phys_start: u32,
    pub guest_phys_end: u32,
    pub guest_end_pc: u32,
    /// Second page's physical start, for a block that crosses a page
    /// boundary (`spec.md` §3, §4.5 step 5); `None` for single-page blocks.
    pub phys_2: Option<u32>,
    pub status: BlockStatus,
    pub page_mask: u64,
    pub page_mask_2: u64,
    pub fpu_top_static: FpuTopAssumption,
    pub valid: bool,
    pub was_recompiled: bool,
}

/// Plain poll-able counters standing in for per-instruction logging on this
/// crate's hot path (`SPEC_FULL.md` "Ambient stack" — the teacher's CPU-core
/// and JIT crates carry no `tracing`/`log` dependency either, exposing
/// `perf_counters.rs`-style counters instead).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub blocks_inserted: u64,
    pub blocks_evicted: u64,
    pub blocks_invalidated: u64,
    pub guest_writes_observed: u64,
}

pub struct BlockCache {
    by_phys: HashMap<u32, Vec<CodeBlock>>,
    order: VecDeque<u32>,
    capacity: usize,
    pub pages: PageTable,
    stats: CacheStats,
}

impl BlockCache {
    pub fn new(capacity: usize, initial_pages: usize) -> Self {
        BlockCache {
            by_phys: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            pages: PageTable::new(initial_pages),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn contains(&self, phys_start: u32) -> bool {
        self.by_phys.contains_key(&phys_start)
    }

    pub fn lookup(&self, phys_start: u32, cs_base: u32, status: BlockStatus) -> Option<&CodeBlock> {
        self.by_phys
            .get(&phys_start)?
            .iter()
            .find(|b| b.valid && b.guest_cs_base == cs_base && b.status == status)
    }

    pub fn get_cloned(&self, phys_start: u32, cs_base: u32, status: BlockStatus) -> Option<CodeBlock> {
        self.lookup(phys_start, cs_base, status).cloned()
    }

    /// Insert a freshly-compiled block, marking its sub-pages code-present,
    /// and evict the least-recently-inserted phys-address bucket until the
    /// cache is back under capacity. Returns every block evicted this way.
    pub fn insert(&mut self, block: CodeBlock) -> Result<Vec<CodeBlock>, Fault> {
        self.mark_present(&block)?;
        self.stats.blocks_inserted += 1;
        let key = block.guest_phys_start;
        self.by_phys.entry(key).or_default().push(block);
        if !self.order.contains(&key) {
            self.order.push_back(key);
        }

        let mut evicted = Vec::new();
        while self.order.len() > self.capacity.max(1) {
            let Some(oldest) = self.order.pop_front() else { break };
            if let Some(blocks) = self.by_phys.remove(&oldest) {
                for b in &blocks {
                    self.unmark_present(b);
                }
                evicted.extend(blocks);
            }
        }
        self.stats.blocks_evicted += evicted.len() as u64;
        Ok(evicted)
    }

    fn mark_present(&mut self, block: &CodeBlock) -> Result<(), Fault> {
        self.pages
            .mark_code_present(pages::page_number(block.guest_phys_start), block.page_mask)?;
        if let Some(phys2) = block.phys_2 {
            self.pages
                .mark_code_present(pages::page_number(phys2), block.page_mask_2)?;
        }
        Ok(())
    }

    fn unmark_present(&mut self, block: &CodeBlock) {
        self.pages
            .clear_code_present(pages::page_number(block.guest_phys_start), block.page_mask);
        if let Some(phys2) = block.phys_2 {
            self.pages
                .clear_code_present(pages::page_number(phys2), block.page_mask_2);
        }
    }

    /// Invalidate every block whose `page_mask`/`page_mask_2` intersects
    /// `mask` on physical `page` (`spec.md` §4.5: "Invalidation frees all
    /// blocks whose `page_mask` intersects the sub-page").
    pub fn invalidate_page(&mut self, page: u32, mask: u64) {
        let mut emptied = Vec::new();
        for (key, blocks) in self.by_phys.iter_mut() {
            let before = blocks.len();
            blocks.retain(|b| {
                let hit1 = pages::page_number(b.guest_phys_start) == page && (b.page_mask & mask) != 0;
                let hit2 = b
                    .phys_2
                    .map(|p| pages::page_number(p) == page && (b.page_mask_2 & mask) != 0)
                    .unwrap_or(false);
                !(hit1 || hit2)
            });
            self.stats.blocks_invalidated += (before - blocks.len()) as u64;
            if blocks.is_empty() {
                emptied.push(*key);
            }
        }
        for key in emptied {
            self.by_phys.remove(&key);
            self.order.retain(|k| *k != key);
        }
        self.pages.clear_dirty(page, mask);
    }

    /// Guest write barrier entry point: the embedder calls this after any
    /// guest memory write reaches physical memory (`spec.md` §4.5:
    /// "guest writes go through a write barrier per 64-byte sub-page;
    /// setting a dirty bit queues invalidation"). `pcjit-cpu` has no
    /// memory of its own to hook this automatically, so it is exposed as
    /// an explicit call rather than threaded through `GuestBus`.
    pub fn on_guest_write(&mut self, phys_addr: u32, len: u32) -> Result<(), Fault> {
        self.stats.guest_writes_observed += 1;
        let mut addr = phys_addr;
        let mut remaining = len;
        while remaining > 0 {
            let page_no = pages::page_number(addr);
            let page_base = page_no * PAGE_SIZE;
            let in_page_len = remaining.min(PAGE_SIZE - (addr - page_base));
            let touched = self.pages.bump_write(addr, in_page_len)?;
            if touched != 0 {
                self.invalidate_page(page_no, touched);
            }
            addr += in_page_len;
            remaining -= in_page_len;
        }
        Ok(())
    }

    /// Drop every cached block (`spec.md` §6: reset/mode-change triggers:
    /// CR0.PE toggle, CR0.PG toggle, EFLAGS.VM toggle, CR3 write, CS load).
    /// `stats` is left untouched — it's a cumulative counter, same as a
    /// real perf counter surviving a guest reset.
    pub fn clear(&mut self) {
        self.by_phys.clear();
        self.order.clear();
        self.pages = PageTable::new(self.pages.table_ptr_len());
    }

    pub fn len(&self) -> usize {
        self.by_phys.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub const GUEST_PAGE_SIZE: u32 = PAGE_SIZE;
