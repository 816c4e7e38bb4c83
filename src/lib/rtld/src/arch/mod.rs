//! The machine relocation backend. Exactly one implementation is compiled in, selected by the
//! target architecture. The relocation driver (see [crate::context]) iterates tables, looks up
//! symbols and decides lazy vs eager; the backend only knows how to encode a value for its
//! instruction set.

use crate::RtldError;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64::*;
#[cfg(target_arch = "x86_64")]
pub(crate) use x86_64::*;

/// One entry of a REL or RELA table, normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocEntry {
    pub r_type: u32,
    pub r_offset: u64,
    pub r_sym: u32,
    /// Explicit addend (RELA). REL entries carry their addend in the target word.
    pub addend: Option<i64>,
}

/// TLS coordinates of a module, as needed by the TLS relocation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsSlot {
    /// Module index (the DTV index).
    pub index: usize,
    /// Offset from the thread pointer, if the module lives in the static TLS block.
    pub static_offset: Option<usize>,
}

/// A resolved symbol, as handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolValue {
    /// Absolute address of the definition. For TLS symbols, the offset of the variable inside
    /// its module's TLS block.
    pub value: usize,
    pub size: usize,
    /// The definition is a GNU indirect function; `value` is the resolver.
    pub ifunc: bool,
    /// TLS coordinates of the defining module.
    pub tls: Option<TlsSlot>,
}

/// Where a relocation lands.
#[derive(Debug, Clone, Copy)]
pub struct RelocSite {
    pub target: *mut u8,
    pub bias: usize,
    /// Explicit or implicit addend.
    pub addend: i64,
    /// TLS coordinates of the module being relocated (for relocations with no symbol).
    pub own_tls: Option<TlsSlot>,
}

/// The outcome of applying one relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The value was stored.
    Done,
    /// A copy relocation; the driver copies the data once the whole batch is relocated.
    Copy,
    /// The stored value must come from calling an indirect-function resolver, plus `addend`.
    /// The driver defers the call until it can release the exclusive lock.
    Ifunc {
        target: *mut usize,
        resolver: usize,
        addend: i64,
    },
    /// This backend does not implement the relocation type.
    Unsupported,
    /// A TLS relocation named a module with no TLS segment, or one without a static offset.
    MissingTls,
}

/// Callback used by [RelocBackend::apply] to resolve the entry's symbol, only called for types
/// that need one.
pub type Resolver<'a> = dyn FnMut() -> Result<SymbolValue, RtldError> + 'a;

/// The four operations a machine backend provides.
pub trait RelocBackend {
    /// Point a module's lazy-binding GOT header at the trampoline. `got` is the module's
    /// `DT_PLTGOT`, `cookie` is passed back to [crate::context::rtld_lazy_bind].
    ///
    /// # Safety
    /// `got` must point to at least three writable words.
    unsafe fn init_lazy(&self, got: *mut usize, cookie: usize);

    /// Apply one non-PLT relocation.
    ///
    /// # Safety
    /// `site.target` must be writable for the width the relocation type stores.
    unsafe fn apply(
        &self,
        rel: &RelocEntry,
        site: &RelocSite,
        resolve: &mut Resolver<'_>,
    ) -> Result<Applied, RtldError>;

    /// Store a resolved address into a PLT slot.
    ///
    /// # Safety
    /// `slot` must be a writable, aligned GOT entry.
    unsafe fn apply_plt(&self, slot: *mut usize, value: usize);

    /// Call a function taking no arguments, returning its address-sized result (init and fini
    /// functions ignore it).
    ///
    /// # Safety
    /// `func` must be the address of a function with the C calling convention.
    unsafe fn call0(&self, func: usize) -> usize;
}

/// The backend for the build target.
pub(crate) const BACKEND: Backend = Backend;

#[inline]
pub(crate) unsafe fn write_word(target: *mut u8, value: u64) {
    (target as *mut u64).write_unaligned(value)
}

#[inline]
pub(crate) unsafe fn write_half(target: *mut u8, value: u32) {
    (target as *mut u32).write_unaligned(value)
}
