//! Thread-local storage bookkeeping. Modules present at startup live in the static TLS block,
//! at a fixed offset from the thread pointer (below it for Variant II, above the thread control
//! block for Variant I). Modules that arrive later through `dlopen` get their blocks allocated
//! per thread on first access, through the dynamic thread vector (DTV).
//!
//! Module indices are reused after a module is unloaded, so every slot records the generation
//! at which it was handed out and each thread's DTV records the generation it was last brought
//! up to date at.

use std::{
    alloc::Layout,
    cell::RefCell,
    collections::HashMap,
    ptr::NonNull,
};

use tracing::{debug, trace};

use crate::{
    arch::{TlsSlot, MINIMUM_TLS_ALIGNMENT},
    RtldError, RtldErrorKind,
};

/// Static TLS space held back at startup for late modules that insist on static TLS.
pub const STATIC_TLS_SURPLUS: usize = 1664;

/// Size of the thread control block that precedes the TLS blocks in Variant I.
const VARIANT1_TCB_SIZE: usize = 16;

/// Size reserved for the thread control block above the thread pointer in Variant II.
const VARIANT2_TCB_SIZE: usize = 64;

/// The two ELF TLS layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVariant {
    /// Blocks above the thread pointer, after a two-word TCB (aarch64).
    Variant1,
    /// Blocks below the thread pointer, TCB at the thread pointer (x86_64).
    Variant2,
}

/// Where a module's block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsOffset {
    /// Will be placed in the static block, not yet assigned.
    Pending,
    /// Offset from the thread pointer in the static block.
    Allocated(usize),
    /// Allocated per thread on first use.
    Dynamic,
}

#[derive(Debug, Clone)]
pub struct TlsModule {
    pub index: usize,
    pub template_addr: usize,
    pub template_filesz: usize,
    pub template_memsz: usize,
    pub template_align: usize,
    pub offset: TlsOffset,
    /// Process generation at which this index was assigned.
    pub generation: u64,
}

impl TlsModule {
    pub fn static_offset(&self) -> Option<usize> {
        match self.offset {
            TlsOffset::Allocated(off) => Some(off),
            _ => None,
        }
    }
}

fn round_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// Process-wide TLS state.
#[derive(Debug)]
pub struct TlsInfo {
    variant: TlsVariant,
    generation: u64,
    // High-water mark of the static block, in bytes from the thread pointer.
    static_size: usize,
    static_align: usize,
    // Set once the initial static block is laid out; later static offsets come from the surplus.
    static_limit: Option<usize>,
    slots: Vec<Option<TlsModule>>,
    free: Vec<usize>,
}

impl TlsInfo {
    pub fn new(variant: TlsVariant) -> Self {
        Self {
            variant,
            generation: 1,
            static_size: match variant {
                TlsVariant::Variant1 => VARIANT1_TCB_SIZE,
                TlsVariant::Variant2 => 0,
            },
            static_align: MINIMUM_TLS_ALIGNMENT,
            static_limit: None,
            slots: vec![],
            free: vec![],
        }
    }

    pub fn variant(&self) -> TlsVariant {
        self.variant
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn static_size(&self) -> usize {
        self.static_size
    }

    /// Whether the initial static block has been laid out.
    pub fn is_frozen(&self) -> bool {
        self.static_limit.is_some()
    }

    /// Assign a module index for a TLS template. Freed indices are reused, lowest first.
    pub fn register(
        &mut self,
        template_addr: usize,
        template_filesz: usize,
        template_memsz: usize,
        template_align: usize,
    ) -> usize {
        self.generation += 1;
        self.free.sort_unstable_by(|a, b| b.cmp(a));
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.slots.len()
            }
        };
        let offset = if self.is_frozen() {
            TlsOffset::Dynamic
        } else {
            TlsOffset::Pending
        };
        self.slots[index - 1] = Some(TlsModule {
            index,
            template_addr,
            template_filesz,
            template_memsz,
            template_align: template_align.max(1),
            offset,
            generation: self.generation,
        });
        trace!("tls: registered module index {} (gen {})", index, self.generation);
        index
    }

    pub fn module(&self, index: usize) -> Option<&TlsModule> {
        self.slots.get(index.checked_sub(1)?)?.as_ref()
    }

    fn module_mut(&mut self, index: usize) -> Option<&mut TlsModule> {
        self.slots.get_mut(index.checked_sub(1)?)?.as_mut()
    }

    /// The coordinates relocations need.
    pub fn slot(&self, index: usize) -> Option<TlsSlot> {
        self.module(index).map(|tm| TlsSlot {
            index,
            static_offset: tm.static_offset(),
        })
    }

    /// Give a module a static offset. Calling this again for the same module returns the same
    /// offset. After the static block is frozen, the offset comes out of the surplus and `None`
    /// is returned if it does not fit.
    pub fn allocate_offset(&mut self, index: usize) -> Option<usize> {
        let (memsz, align, current) = {
            let tm = self.module(index)?;
            (tm.template_memsz, tm.template_align, tm.offset)
        };
        if let TlsOffset::Allocated(off) = current {
            return Some(off);
        }
        let (offset, new_size) = match self.variant {
            TlsVariant::Variant2 => {
                let off = round_up(self.static_size + memsz, align);
                (off, off)
            }
            TlsVariant::Variant1 => {
                let off = round_up(self.static_size, align);
                (off, off + memsz)
            }
        };
        if let Some(limit) = self.static_limit {
            if new_size > limit || align > self.static_align {
                return None;
            }
        } else {
            self.static_align = self.static_align.max(align).next_power_of_two();
        }
        self.static_size = new_size;
        self.module_mut(index)?.offset = TlsOffset::Allocated(offset);
        debug!(
            "tls: module {} at static offset {:#x} ({})",
            index,
            offset,
            humansize::format_size(memsz, humansize::BINARY)
        );
        Some(offset)
    }

    /// Lay out the initial static block. Everything registered from now on is dynamic unless it
    /// is explicitly given a surplus offset.
    pub fn freeze_static(&mut self) {
        if self.static_limit.is_none() {
            self.static_limit = Some(self.static_size + STATIC_TLS_SURPLUS);
        }
    }

    /// Release a module's index. Its static space, if any, is not reclaimed.
    pub fn release(&mut self, index: usize) {
        if let Some(slot) = index.checked_sub(1).and_then(|i| self.slots.get_mut(i)) {
            if slot.take().is_some() {
                self.generation += 1;
                self.free.push(index);
                trace!("tls: released module index {} (gen {})", index, self.generation);
            }
        }
    }

    /// Snapshot used to undo a failed batch.
    pub(crate) fn checkpoint(&self) -> TlsCheckpoint {
        TlsCheckpoint {
            static_size: self.static_size,
        }
    }

    /// Drop the indices registered since `cp` and give back their static space. Offsets handed
    /// out after the checkpoint are all above its high-water mark.
    pub(crate) fn rollback(&mut self, cp: TlsCheckpoint, indices: &[usize]) {
        for &index in indices {
            self.release(index);
        }
        self.static_size = cp.static_size;
    }

    fn static_layout(&self) -> Result<(Layout, usize), RtldError> {
        let limit = self.static_limit.unwrap_or(self.static_size + STATIC_TLS_SURPLUS);
        let align = self.static_align.max(64);
        let (size, tp_offset) = match self.variant {
            TlsVariant::Variant2 => {
                let region = round_up(limit, align);
                (region + VARIANT2_TCB_SIZE, region)
            }
            TlsVariant::Variant1 => (limit.max(VARIANT1_TCB_SIZE), 0),
        };
        let layout =
            Layout::from_size_align(size, align).map_err(|_| RtldErrorKind::OutOfMemory)?;
        Ok((layout, tp_offset))
    }

    /// Address of a static block relative to a thread pointer.
    pub fn static_block_addr(&self, thread_pointer: usize, offset: usize) -> usize {
        match self.variant {
            TlsVariant::Variant2 => thread_pointer - offset,
            TlsVariant::Variant1 => thread_pointer + offset,
        }
    }

    /// Allocate and initialize a static TLS block for one thread, returning it. The initial
    /// thread's block is built at boot and never freed.
    pub fn allocate_static_block(&self) -> Result<StaticTlsBlock, RtldError> {
        let (layout, tp_offset) = self.static_layout()?;
        let base = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or(RtldErrorKind::OutOfMemory)?;
        let thread_pointer = base.as_ptr() as usize + tp_offset;
        for tm in self.slots.iter().flatten() {
            let Some(off) = tm.static_offset() else {
                continue;
            };
            let dst = self.static_block_addr(thread_pointer, off) as *mut u8;
            trace!(
                "tls: copy template {:x} => {:p} (filesz={}, memsz={})",
                tm.template_addr,
                dst,
                tm.template_filesz,
                tm.template_memsz
            );
            unsafe {
                dst.copy_from_nonoverlapping(tm.template_addr as *const u8, tm.template_filesz)
            };
        }
        if self.variant == TlsVariant::Variant2 {
            // The TCB starts with a pointer to itself.
            unsafe { (thread_pointer as *mut usize).write(thread_pointer) };
        }
        Ok(StaticTlsBlock {
            base,
            layout,
            thread_pointer,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TlsCheckpoint {
    static_size: usize,
}

/// One thread's static TLS block.
#[derive(Debug)]
pub struct StaticTlsBlock {
    base: NonNull<u8>,
    layout: Layout,
    thread_pointer: usize,
}

impl StaticTlsBlock {
    pub fn thread_pointer(&self) -> usize {
        self.thread_pointer
    }

    /// Keep the block for the life of the process.
    pub fn leak(self) -> usize {
        let tp = self.thread_pointer;
        std::mem::forget(self);
        tp
    }
}

impl Drop for StaticTlsBlock {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[derive(Debug)]
struct DtvBlock {
    addr: NonNull<u8>,
    // None for blocks that live in a static TLS block.
    layout: Option<Layout>,
    generation: u64,
}

impl Drop for DtvBlock {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            unsafe { std::alloc::dealloc(self.addr.as_ptr(), layout) };
        }
    }
}

#[derive(Debug, Default)]
struct Dtv {
    generation: u64,
    blocks: Vec<Option<DtvBlock>>,
}

impl Dtv {
    fn refresh(&mut self, info: &TlsInfo) {
        if self.generation >= info.generation {
            return;
        }
        for (i, entry) in self.blocks.iter_mut().enumerate() {
            let stale = match (entry.as_ref(), info.module(i + 1)) {
                (Some(block), Some(tm)) => block.generation != tm.generation,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if stale {
                trace!("tls: dropping stale dtv entry {}", i + 1);
                *entry = None;
            }
        }
        if self.blocks.len() < info.slots.len() {
            self.blocks.resize_with(info.slots.len(), || None);
        }
        self.generation = info.generation;
    }
}

thread_local! {
    // One DTV per loader instance.
    static DTVS: RefCell<HashMap<u64, Dtv>> = RefCell::new(HashMap::new());
}

impl TlsInfo {
    /// Address of `offset` inside module `index`'s block for the calling thread, allocating the
    /// block if this thread has not touched it yet.
    pub fn get_addr(&self, instance: u64, index: usize, offset: usize) -> Result<usize, RtldError> {
        let tm = self.module(index).ok_or_else(|| RtldErrorKind::NoTLSInfo {
            library: format!("tls module {}", index),
        })?;
        DTVS.with(|dtvs| {
            let mut dtvs = dtvs.borrow_mut();
            let dtv = dtvs.entry(instance).or_default();
            dtv.refresh(self);
            if let Some(block) = &dtv.blocks[index - 1] {
                return Ok(block.addr.as_ptr() as usize + offset);
            }
            let layout = Layout::from_size_align(tm.template_memsz.max(1), tm.template_align)
                .map_err(|_| RtldErrorKind::OutOfMemory)?;
            let addr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
                .ok_or(RtldErrorKind::OutOfMemory)?;
            unsafe {
                addr.as_ptr().copy_from_nonoverlapping(
                    tm.template_addr as *const u8,
                    tm.template_filesz,
                )
            };
            trace!("tls: allocated block for module {} at {:p}", index, addr);
            dtv.blocks[index - 1] = Some(DtvBlock {
                addr,
                layout: Some(layout),
                generation: tm.generation,
            });
            Ok(addr.as_ptr() as usize + offset)
        })
    }

    /// The calling thread's block for module `index`, if it has one.
    pub fn current_block(&self, instance: u64, index: usize) -> Option<usize> {
        DTVS.with(|dtvs| {
            let mut dtvs = dtvs.borrow_mut();
            let dtv = dtvs.get_mut(&instance)?;
            dtv.refresh(self);
            dtv.blocks
                .get(index.checked_sub(1)?)?
                .as_ref()
                .map(|b| b.addr.as_ptr() as usize)
        })
    }

    /// Point the calling thread's DTV at the blocks inside its static TLS region.
    pub fn install_static(&self, instance: u64, thread_pointer: usize) {
        DTVS.with(|dtvs| {
            let mut dtvs = dtvs.borrow_mut();
            let dtv = dtvs.entry(instance).or_default();
            dtv.refresh(self);
            for tm in self.slots.iter().flatten() {
                let Some(off) = tm.static_offset() else {
                    continue;
                };
                let addr = self.static_block_addr(thread_pointer, off);
                dtv.blocks[tm.index - 1] = NonNull::new(addr as *mut u8).map(|addr| DtvBlock {
                    addr,
                    layout: None,
                    generation: tm.generation,
                });
            }
        })
    }
}

/// Release every block the calling thread allocated for a loader instance.
pub fn free_thread(instance: u64) {
    DTVS.with(|dtvs| {
        if let Some(dtv) = dtvs.borrow_mut().remove(&instance) {
            trace!("tls: freeing {} dtv entries", dtv.blocks.len());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_idempotent() {
        let mut tls = TlsInfo::new(TlsVariant::Variant2);
        let a = tls.register(0, 0, 24, 8);
        let b = tls.register(0, 0, 100, 64);
        let off_a = tls.allocate_offset(a).unwrap();
        assert_eq!(off_a, 24);
        assert_eq!(tls.allocate_offset(a), Some(off_a));
        let off_b = tls.allocate_offset(b).unwrap();
        assert_eq!(off_b, 128);
        assert_eq!(off_b % 64, 0);
        assert_eq!(tls.static_size(), 128);
        assert_eq!(tls.allocate_offset(b), Some(off_b));
    }

    #[test]
    fn variant1_starts_after_tcb() {
        let mut tls = TlsInfo::new(TlsVariant::Variant1);
        let a = tls.register(0, 0, 10, 8);
        let b = tls.register(0, 0, 4, 4);
        assert_eq!(tls.allocate_offset(a), Some(16));
        assert_eq!(tls.allocate_offset(b), Some(28));
        assert_eq!(tls.static_size(), 32);
    }

    #[test]
    fn surplus_after_freeze() {
        let mut tls = TlsInfo::new(TlsVariant::Variant2);
        let a = tls.register(0, 0, 16, 8);
        tls.allocate_offset(a).unwrap();
        tls.freeze_static();
        let late = tls.register(0, 0, 64, 8);
        assert_eq!(tls.module(late).unwrap().offset, TlsOffset::Dynamic);
        assert!(tls.allocate_offset(late).is_some());
        let huge = tls.register(0, 0, STATIC_TLS_SURPLUS * 2, 8);
        assert!(tls.allocate_offset(huge).is_none());
    }

    #[test]
    fn indices_are_reused() {
        let mut tls = TlsInfo::new(TlsVariant::Variant2);
        let a = tls.register(0, 0, 8, 8);
        let b = tls.register(0, 0, 8, 8);
        assert_eq!((a, b), (1, 2));
        let gen_b = tls.module(b).unwrap().generation;
        tls.release(b);
        assert!(tls.module(b).is_none());
        let c = tls.register(0, 0, 8, 8);
        assert_eq!(c, 2);
        assert!(tls.module(c).unwrap().generation > gen_b);
    }

    #[test]
    fn dynamic_blocks_copy_template() {
        let template: [u8; 4] = [1, 2, 3, 4];
        let mut tls = TlsInfo::new(TlsVariant::Variant2);
        tls.freeze_static();
        let idx = tls.register(template.as_ptr() as usize, 4, 16, 8);
        let instance = 0x7e57;
        let addr = tls.get_addr(instance, idx, 0).unwrap();
        let block = unsafe { std::slice::from_raw_parts(addr as *const u8, 16) };
        assert_eq!(&block[..4], &template);
        assert!(block[4..].iter().all(|&b| b == 0));
        assert_eq!(tls.get_addr(instance, idx, 2).unwrap(), addr + 2);
        assert_eq!(tls.current_block(instance, idx), Some(addr));

        // Reusing the index invalidates the old block.
        tls.release(idx);
        let again = tls.register(template.as_ptr() as usize, 4, 16, 8);
        assert_eq!(again, idx);
        assert_eq!(tls.current_block(instance, again), None);
        free_thread(instance);
    }

    #[test]
    fn static_block_holds_templates() {
        let template: [u8; 8] = *b"tlsdata!";
        let mut tls = TlsInfo::new(TlsVariant::Variant2);
        let idx = tls.register(template.as_ptr() as usize, 8, 32, 16);
        let off = tls.allocate_offset(idx).unwrap();
        tls.freeze_static();
        let block = tls.allocate_static_block().unwrap();
        let tp = block.thread_pointer();
        assert_eq!(unsafe { *(tp as *const usize) }, tp);
        let data = unsafe { std::slice::from_raw_parts((tp - off) as *const u8, 8) };
        assert_eq!(data, &template);

        tls.install_static(0x5eed, tp);
        assert_eq!(tls.current_block(0x5eed, idx), Some(tp - off));
        free_thread(0x5eed);
    }
}
