//! Management of individual modules (the main program, shared libraries, the loader itself).

use std::{
    fmt::{Debug, Display},
    path::{Path, PathBuf},
};

use elf::{
    abi::{PT_DYNAMIC, PT_TLS},
    endian::NativeEndian,
    file::Class,
    segment::ProgramHeader,
    string_table::StringTable,
    symbol::{Symbol, SymbolTable},
};
use petgraph::stable_graph::NodeIndex;

use crate::{
    engines::{FileId, Mapping},
    symbol::HashTable,
};

mod dynamic;
mod init;
mod load;
mod version;

pub use dynamic::{DynamicInfo, Table};
pub(crate) use load::{load_module, module_from_image, LoadKind};
pub use version::{VersionDef, VersionInfo, VersionReq};

/// The ID struct for a module: its node in the object graph.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
#[repr(transparent)]
pub struct ModuleId(pub(crate) NodeIndex);

impl ModuleId {
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

impl Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.index())
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ModuleFlags: u32 {
        /// The main program.
        const MAIN = 1;
        /// The loader's own image.
        const LOADER = 2;
        /// Relocations write into non-writable segments.
        const TEXTREL = 4;
        /// Search this module first when resolving its own references.
        const SYMBOLIC = 8;
        /// Never unloaded.
        const NODELETE = 0x10;
        /// Initialize before, and finalize after, everything else in its batch.
        const INITFIRST = 0x20;
        /// Cannot be the target of dlopen.
        const NOOPEN = 0x40;
        /// Uses the static TLS model.
        const STATIC_TLS = 0x80;
        /// Resolve PLT slots eagerly.
        const BIND_NOW = 0x100;
        /// Part of the global resolution scope.
        const GLOBAL = 0x200;
        /// Loaded at startup (main program, preloads and their dependencies).
        const STARTUP = 0x400;
    }
}

/// Lifecycle of a module in the graph.
#[derive(PartialEq, PartialOrd, Ord, Eq, Debug, Clone, Copy)]
pub enum ModuleState {
    /// Mapped, relocation not finished (or failed).
    Loading,
    /// Relocation completed successfully.
    Relocated,
    /// Initializers have run.
    Initialized,
    /// Finalizers have run; the module is about to be removed.
    Finalized,
}

/// A `DT_NEEDED` edge. `resolved` is filled in by dependency loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepEdge {
    pub name_off: u32,
    pub resolved: Option<ModuleId>,
}

/// The value in `GOT[1]` of a lazily bound module: enough to find the module again from the
/// trampoline.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct LazyCookie {
    pub(crate) owner: *const crate::api::Shared,
    pub(crate) module: ModuleId,
}

/// A loaded module.
pub struct Module {
    /// Name the module was requested by.
    pub name: String,
    /// Path it was opened from.
    pub path: PathBuf,
    pub(crate) soname: Option<String>,
    pub(crate) idx: NodeIndex,
    pub(crate) file_id: Option<FileId>,
    pub(crate) mapping: Mapping,
    pub(crate) phdrs: Vec<ProgramHeader>,
    /// Run-time address of the program headers, if they are mapped.
    pub(crate) phdr_addr: Option<usize>,
    pub(crate) entry: usize,
    pub(crate) dynamic: DynamicInfo,
    pub(crate) hash: HashTable,
    pub(crate) nsyms: usize,
    pub(crate) deps: Vec<DepEdge>,
    pub flags: ModuleFlags,
    pub(crate) refcount: usize,
    pub(crate) opencount: usize,
    pub(crate) state: ModuleState,
    /// TLS module index.
    pub(crate) tls: Option<usize>,
    pub(crate) versions: VersionInfo,
    pub(crate) rpath: Vec<String>,
    pub(crate) runpath: Vec<String>,
    pub(crate) plt_trimmed: bool,
    pub(crate) lazy_cookie: Option<Box<LazyCookie>>,
}

#[allow(dead_code)]
impl Module {
    /// Get the ID for this module.
    pub fn id(&self) -> ModuleId {
        ModuleId(self.idx)
    }

    /// Relocation bias: run-time address minus link-time address.
    pub fn bias(&self) -> usize {
        self.mapping.bias()
    }

    /// Lowest mapped address.
    pub fn base_addr(&self) -> usize {
        self.mapping.start()
    }

    pub fn mapped_len(&self) -> usize {
        self.mapping.len()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.mapping.contains(addr)
    }

    /// Compute an in-memory address for a ELF virtual addr.
    pub fn laddr(&self, vaddr: usize) -> usize {
        self.bias().wrapping_add(vaddr)
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub fn opencount(&self) -> usize {
        self.opencount
    }

    pub fn soname(&self) -> Option<&str> {
        self.soname.as_deref()
    }

    pub fn tls_index(&self) -> Option<usize> {
        self.tls
    }

    pub fn program_headers(&self) -> &[ProgramHeader] {
        &self.phdrs
    }

    pub fn is_main(&self) -> bool {
        self.flags.contains(ModuleFlags::MAIN)
    }

    /// Entry point, for the main program.
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Directory of the file this module was loaded from, for `$ORIGIN`.
    pub fn origin(&self) -> Option<&Path> {
        self.path.parent()
    }

    /// Borrow `len` bytes of mapped memory at link-time address `vaddr`, clipped to the end of
    /// the mapping.
    pub(crate) fn mem(&self, vaddr: usize, len: usize) -> &[u8] {
        let start = self.laddr(vaddr);
        if !self.contains(start) {
            return &[];
        }
        let avail = self.base_addr() + self.mapped_len() - start;
        unsafe { core::slice::from_raw_parts(start as *const u8, len.min(avail)) }
    }

    /// Bytes from `vaddr` to the end of the mapping.
    pub(crate) fn mem_from(&self, vaddr: usize) -> &[u8] {
        self.mem(vaddr, usize::MAX)
    }

    pub(crate) fn strtab(&self) -> StringTable<'_> {
        match self.dynamic.strtab {
            Some(addr) => StringTable::new(self.mem(addr, self.dynamic.strsz)),
            None => StringTable::new(&[]),
        }
    }

    pub(crate) fn string(&self, off: u32) -> Option<&str> {
        self.strtab().get(off as usize).ok()
    }

    pub(crate) fn symtab(&self) -> SymbolTable<'_, NativeEndian> {
        let data = match self.dynamic.symtab {
            Some(addr) => self.mem(addr, self.nsyms * 24),
            None => &[],
        };
        SymbolTable::new(NativeEndian, Class::ELF64, data)
    }

    pub(crate) fn symbol(&self, idx: u32) -> Option<Symbol> {
        if idx as usize >= self.nsyms {
            return None;
        }
        self.symtab().get(idx as usize).ok()
    }

    pub(crate) fn symbol_name(&self, sym: &Symbol) -> Option<&str> {
        self.string(sym.st_name)
    }

    /// Version index of symbol `idx`, if the module carries a version table.
    pub(crate) fn versym(&self, idx: u32) -> Option<u16> {
        let addr = self.dynamic.versym?;
        let bytes = self.mem(addr + 2 * idx as usize, 2);
        Some(u16::from_ne_bytes(bytes.try_into().ok()?))
    }

    /// Name of dependency edge `edge`.
    pub fn dep_name(&self, edge: &DepEdge) -> Option<&str> {
        self.string(edge.name_off)
    }

    /// Resolved dependencies, in `DT_NEEDED` order.
    pub fn dependencies(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.deps.iter().filter_map(|d| d.resolved)
    }

    /// The `PT_TLS` template: (run-time address, file size, memory size, alignment).
    pub(crate) fn tls_template(&self) -> Option<(usize, usize, usize, usize)> {
        self.phdrs.iter().find(|p| p.p_type == PT_TLS).map(|p| {
            (
                self.laddr(p.p_vaddr as usize),
                p.p_filesz as usize,
                p.p_memsz as usize,
                p.p_align as usize,
            )
        })
    }

    /// Run-time address of the dynamic section.
    pub fn dynamic_addr(&self) -> Option<usize> {
        self.phdrs
            .iter()
            .find(|p| p.p_type == PT_DYNAMIC)
            .map(|p| self.laddr(p.p_vaddr as usize))
    }

    /// Run-time address of the program headers, if they are mapped.
    pub fn phdr_addr(&self) -> Option<usize> {
        self.phdr_addr
    }

    /// Whether this module is known as `name`, by the name it was requested by, its path or its
    /// soname.
    pub fn matches_name(&self, name: &str) -> bool {
        self.name == name
            || self.path.as_os_str() == name
            || self.soname.as_deref() == Some(name)
    }
}

impl Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("idx", &self.idx)
            .field("base", &format_args!("{:#x}", self.base_addr()))
            .field("flags", &self.flags)
            .field("refcount", &self.refcount)
            .field("opencount", &self.opencount)
            .field("state", &self.state)
            .field("tls", &self.tls)
            .finish()
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        tracing::debug!("rtld: drop module: {:?}", self);
    }
}

impl Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}
