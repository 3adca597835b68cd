//! External collaborator interfaces the core *consumes* (`spec.md` §1, §6).
//! No implementation lives here — the MMU/TLB/segmentation checker and the
//! interrupt controller are out of scope; this module only pins down the
//! trait surface the interpreter/JIT/executor call into.

use pcjit_types::{Fault, Seg};

/// Guest memory access, consumed exactly as `spec.md` §6 names it:
/// `read_b/w/l/q`, `write_b/w/l/q`, `phys_of`, `invalidate_tlb`.
pub trait GuestBus {
    fn read_b(&mut self, seg: Seg, off: u32) -> Result<u8, Fault>;
    fn read_w(&mut self, seg: Seg, off: u32) -> Result<u16, Fault>;
    fn read_l(&mut self, seg: Seg, off: u32) -> Result<u32, Fault>;

    fn write_b(&mut self, seg: Seg, off: u32, v: u8) -> Result<(), Fault>;
    fn write_w(&mut self, seg: Seg, off: u32, v: u16) -> Result<(), Fault>;
    fn write_l(&mut self, seg: Seg, off: u32, v: u32) -> Result<(), Fault>;

    /// Translate a guest linear address to a guest physical address. This
    /// is the only address space the block cache indexes by
    /// (`spec.md` §3 `CodeBlock::guest_phys_start`).
    fn phys_of(&mut self, linear: u32) -> Result<u32, Fault>;

    fn invalidate_tlb(&mut self);

    /// Fetch `len` raw code bytes starting at guest linear `ip`, for
    /// decode. Does not need to honour segment limits beyond what the
    /// decoder itself requires (at most 15 bytes per `iced-x86` window);
    /// faulting mid-window must still report the first inaccessible byte.
    fn fetch_code(&mut self, seg: Seg, ip: u32, len: u8, out: &mut [u8]) -> Result<(), Fault>;

    /// Flat (segment-base-bypassing) word read/write, for the one place the
    /// core itself must ignore the current segment cache: locating the
    /// real-mode IVT or protected-mode IDT entry for an interrupt vector.
    /// 86Box's own `x86_int` does the same thing by passing a literal `0`
    /// base to `readmemw`/`writememw` rather than a segment register.
    fn read_flat_w(&mut self, addr: u32) -> Result<u16, Fault>;
    fn write_flat_w(&mut self, addr: u32, v: u16) -> Result<(), Fault>;
}

/// Interrupt controller state the core only *observes*
/// (`spec.md` §1, §6).
pub trait InterruptSource {
    fn nmi(&self) -> bool;
    fn nmi_enable(&self) -> bool;
    fn nmi_mask(&self) -> bool;
    fn pending_irq_vector(&mut self) -> Option<u8>;
}
