//! Definitions for symbols in the runtime loader: hashing, hash table walks and the per-module
//! lookup with its version rules. Searching across modules lives in [crate::context].

use elf::{
    abi::{
        SHN_ABS, STB_LOCAL, STB_WEAK, STT_COMMON, STT_FUNC, STT_GNU_IFUNC, STT_NOTYPE,
        STT_OBJECT, STT_TLS,
    },
    symbol::Symbol,
};

use crate::{
    arch::SymbolValue,
    library::{Module, ModuleId},
    tls::TlsInfo,
};

/// The SysV ELF hash.
pub fn elf_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &c in name {
        h = (h << 4).wrapping_add(c as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// The GNU hash (djb2).
pub fn gnu_hash(name: &[u8]) -> u32 {
    name.iter()
        .fold(5381u32, |h, &c| h.wrapping_mul(33).wrapping_add(c as u32))
}

/// A name to look up, with both hashes computed once.
#[derive(Debug, Clone, Copy)]
pub struct SymbolName<'a> {
    pub name: &'a str,
    pub sysv: u32,
    pub gnu: u32,
}

impl<'a> SymbolName<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            sysv: elf_hash(name.as_bytes()),
            gnu: gnu_hash(name.as_bytes()),
        }
    }
}

/// A version a reference asks for.
#[derive(Debug, Clone, Copy)]
pub struct VersionRequest<'a> {
    pub name: &'a str,
    pub hash: u32,
    /// A weak requirement accepts an unversioned, non-hidden definition.
    pub weak: bool,
}

impl<'a> VersionRequest<'a> {
    pub fn new(name: &'a str, weak: bool) -> Self {
        Self {
            name,
            hash: elf_hash(name.as_bytes()),
            weak,
        }
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    /// Options for use during symbol lookup.
    pub struct LookupFlags : u32 {
        /// Don't search the referencing module (copy relocations).
        const SKIP_SELF = 1;
        /// Accept undefined function symbols with a non-zero value: the canonical PLT address
        /// of a function in the main program. Set for references other than PLT slots.
        const ALLOW_PLT = 2;
        /// Don't fall back to the loader's exported symbols.
        const SKIP_EXPORTS = 4;
    }
}

/// The symbol hash table of a module, located in mapped memory.
#[derive(Debug, Clone, Copy)]
pub(crate) enum HashTable {
    SysV {
        nbucket: u32,
        nchain: u32,
        buckets: usize,
        chains: usize,
    },
    Gnu {
        nbuckets: u32,
        symoffset: u32,
        bloom: usize,
        bloom_size: u32,
        bloom_shift: u32,
        buckets: usize,
        chains: usize,
    },
}

impl HashTable {
    /// # Safety
    /// `addr` must be the run-time address of a mapped `DT_HASH` table.
    pub(crate) unsafe fn sysv(addr: usize) -> Self {
        let words = addr as *const u32;
        let nbucket = words.read();
        let nchain = words.add(1).read();
        let buckets = addr + 8;
        HashTable::SysV {
            nbucket,
            nchain,
            buckets,
            chains: buckets + 4 * nbucket as usize,
        }
    }

    /// # Safety
    /// `addr` must be the run-time address of a mapped `DT_GNU_HASH` table.
    pub(crate) unsafe fn gnu(addr: usize) -> Self {
        let words = addr as *const u32;
        let nbuckets = words.read();
        let symoffset = words.add(1).read();
        let bloom_size = words.add(2).read();
        let bloom_shift = words.add(3).read();
        let bloom = addr + 16;
        let buckets = bloom + 8 * bloom_size as usize;
        HashTable::Gnu {
            nbuckets,
            symoffset,
            bloom,
            bloom_size,
            bloom_shift,
            buckets,
            chains: buckets + 4 * nbuckets as usize,
        }
    }

    /// Number of entries in the dynamic symbol table. The table has no size of its own; the
    /// hash table is the only thing that covers all of it.
    pub(crate) unsafe fn symbol_count(&self) -> usize {
        match *self {
            HashTable::SysV { nchain, .. } => nchain as usize,
            HashTable::Gnu {
                nbuckets,
                symoffset,
                buckets,
                chains,
                ..
            } => {
                let buckets = core::slice::from_raw_parts(buckets as *const u32, nbuckets as usize);
                let max = buckets.iter().copied().max().unwrap_or(0);
                if max < symoffset {
                    return symoffset as usize;
                }
                let mut idx = max;
                while (chains as *const u32).add((idx - symoffset) as usize).read() & 1 == 0 {
                    idx += 1;
                }
                idx as usize + 1
            }
        }
    }

    /// Symbol indices that may carry `name`.
    pub(crate) unsafe fn chain(&self, name: &SymbolName<'_>) -> Chain {
        match *self {
            HashTable::SysV {
                nbucket,
                nchain,
                buckets,
                chains,
            } => {
                if nbucket == 0 {
                    return Chain::Empty;
                }
                let first = (buckets as *const u32)
                    .add((name.sysv % nbucket) as usize)
                    .read();
                Chain::SysV {
                    chains: chains as *const u32,
                    next: first,
                    remaining: nchain,
                }
            }
            HashTable::Gnu {
                nbuckets,
                symoffset,
                bloom,
                bloom_size,
                bloom_shift,
                buckets,
                chains,
            } => {
                if nbuckets == 0 || bloom_size == 0 {
                    return Chain::Empty;
                }
                let h = name.gnu;
                let word = (bloom as *const u64)
                    .add(((h / 64) % bloom_size) as usize)
                    .read_unaligned();
                let mask = (1u64 << (h % 64)) | (1u64 << ((h >> bloom_shift) % 64));
                if word & mask != mask {
                    return Chain::Empty;
                }
                let first = (buckets as *const u32).add((h % nbuckets) as usize).read();
                if first < symoffset {
                    return Chain::Empty;
                }
                Chain::Gnu {
                    chains: chains as *const u32,
                    symoffset,
                    next: first,
                    hash: h,
                    done: false,
                }
            }
        }
    }
}

/// Walks one hash chain.
pub(crate) enum Chain {
    Empty,
    SysV {
        chains: *const u32,
        next: u32,
        remaining: u32,
    },
    Gnu {
        chains: *const u32,
        symoffset: u32,
        next: u32,
        hash: u32,
        done: bool,
    },
}

impl Iterator for Chain {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        match self {
            Chain::Empty => None,
            Chain::SysV {
                chains,
                next,
                remaining,
            } => {
                if *next == 0 || *remaining == 0 {
                    return None;
                }
                let cur = *next;
                *remaining -= 1;
                *next = unsafe { chains.add(cur as usize).read() };
                Some(cur)
            }
            Chain::Gnu {
                chains,
                symoffset,
                next,
                hash,
                done,
            } => {
                while !*done {
                    let cur = *next;
                    let ch = unsafe { chains.add((cur - *symoffset) as usize).read() };
                    *done = ch & 1 != 0;
                    *next += 1;
                    if (ch | 1) == (*hash | 1) {
                        return Some(cur);
                    }
                }
                None
            }
        }
    }
}

/// Outcome of searching one module.
#[derive(Debug)]
pub(crate) enum ModuleLookup {
    Found(Symbol),
    NotFound,
    /// More than one versioned, non-hidden definition and no way to pick.
    Ambiguous(usize),
}

enum VersionMatch {
    Accept,
    Reject,
    Remember,
}

impl Module {
    fn version_match(&self, idx: u32, req: Option<&VersionRequest<'_>>) -> VersionMatch {
        let Some(versym) = self.versym(idx) else {
            return VersionMatch::Accept;
        };
        let ndx = versym & 0x7fff;
        let hidden = versym & 0x8000 != 0;
        match req {
            None => {
                if ndx <= 1 || Some(ndx) == self.versions.base_index() {
                    VersionMatch::Accept
                } else if hidden {
                    VersionMatch::Reject
                } else {
                    VersionMatch::Remember
                }
            }
            Some(req) => {
                let matches = self
                    .versions
                    .def(ndx)
                    .is_some_and(|def| def.hash == req.hash && def.name == req.name);
                if matches || (req.weak && ndx <= 1 && !hidden) {
                    VersionMatch::Accept
                } else {
                    VersionMatch::Reject
                }
            }
        }
    }

    /// Search this module's own symbol table.
    pub(crate) fn lookup(
        &self,
        name: &SymbolName<'_>,
        req: Option<&VersionRequest<'_>>,
        flags: LookupFlags,
    ) -> ModuleLookup {
        let mut remembered = None;
        let mut vcount = 0;
        for idx in unsafe { self.hash.chain(name) } {
            let Some(sym) = self.symbol(idx) else {
                continue;
            };
            if sym.st_bind() == STB_LOCAL {
                continue;
            }
            let ty = sym.st_symtype();
            if !matches!(
                ty,
                STT_NOTYPE | STT_OBJECT | STT_FUNC | STT_COMMON | STT_TLS | STT_GNU_IFUNC
            ) {
                continue;
            }
            if sym.is_undefined() {
                if !(flags.contains(LookupFlags::ALLOW_PLT) && ty == STT_FUNC && sym.st_value != 0)
                {
                    continue;
                }
            } else if sym.st_value == 0 && ty != STT_TLS {
                continue;
            }
            if self.symbol_name(&sym) != Some(name.name) {
                continue;
            }
            match self.version_match(idx, req) {
                VersionMatch::Accept => return ModuleLookup::Found(sym),
                VersionMatch::Reject => continue,
                VersionMatch::Remember => {
                    vcount += 1;
                    remembered.get_or_insert(sym);
                }
            }
        }
        match (vcount, remembered) {
            (1, Some(sym)) => ModuleLookup::Found(sym),
            (0, _) => ModuleLookup::NotFound,
            (n, _) => ModuleLookup::Ambiguous(n),
        }
    }

    /// The defined symbol with the highest address not above `addr`, with that address.
    pub(crate) fn nearest_symbol(&self, addr: usize) -> Option<(&str, usize)> {
        (1..self.nsyms as u32)
            .filter_map(|idx| self.symbol(idx))
            .filter(|sym| {
                !sym.is_undefined()
                    && sym.st_shndx != SHN_ABS
                    && matches!(
                        sym.st_symtype(),
                        STT_NOTYPE | STT_OBJECT | STT_FUNC | STT_GNU_IFUNC
                    )
            })
            .map(|sym| (self.laddr(sym.st_value as usize), sym))
            .filter(|&(value, _)| value <= addr && self.contains(value))
            .max_by_key(|&(value, _)| value)
            .and_then(|(value, sym)| Some((self.symbol_name(&sym)?, value)))
    }
}

/// A symbol resolved to a definition.
#[derive(Debug, Clone)]
pub enum RelocatedSymbol<'lib> {
    /// Defined in a module's symbol table.
    Module {
        sym: Symbol,
        lib: &'lib Module,
    },
    /// One of the loader's own exported entry points.
    Export { addr: usize },
    /// An undefined weak reference with nothing to bind to. Its value is zero.
    Undefined,
}

impl<'lib> RelocatedSymbol<'lib> {
    pub(crate) fn new(sym: Symbol, lib: &'lib Module) -> Self {
        Self::Module { sym, lib }
    }

    /// Returns the relocated address of the symbol, i.e. the value of the symbol added to the base
    /// address of the library it comes from. For TLS symbols this is the offset within the
    /// module's TLS block.
    pub fn reloc_value(&self) -> u64 {
        match self {
            RelocatedSymbol::Module { sym, lib } => {
                if sym.st_shndx == SHN_ABS || sym.st_symtype() == STT_TLS {
                    sym.st_value
                } else {
                    sym.st_value.wrapping_add(lib.bias() as u64)
                }
            }
            RelocatedSymbol::Export { addr } => *addr as u64,
            RelocatedSymbol::Undefined => 0,
        }
    }

    /// Returns the raw symbol value (unrelocated).
    pub fn raw_value(&self) -> u64 {
        match self {
            RelocatedSymbol::Module { sym, .. } => sym.st_value,
            RelocatedSymbol::Export { addr } => *addr as u64,
            RelocatedSymbol::Undefined => 0,
        }
    }

    /// Returns the symbol's size.
    pub fn size(&self) -> u64 {
        match self {
            RelocatedSymbol::Module { sym, .. } => sym.st_size,
            RelocatedSymbol::Export { .. } | RelocatedSymbol::Undefined => 0,
        }
    }

    pub fn is_weak(&self) -> bool {
        matches!(self, RelocatedSymbol::Module { sym, .. } if sym.st_bind() == STB_WEAK)
    }

    pub fn is_ifunc(&self) -> bool {
        matches!(self, RelocatedSymbol::Module { sym, .. } if sym.st_symtype() == STT_GNU_IFUNC)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, RelocatedSymbol::Module { sym, .. } if sym.st_symtype() == STT_TLS)
    }

    /// The module the definition comes from, if any.
    pub fn module(&self) -> Option<&'lib Module> {
        match self {
            RelocatedSymbol::Module { lib, .. } => Some(lib),
            RelocatedSymbol::Export { .. } | RelocatedSymbol::Undefined => None,
        }
    }

    pub fn module_id(&self) -> Option<ModuleId> {
        self.module().map(|lib| lib.id())
    }

    /// The form the relocation backend consumes.
    pub(crate) fn to_value(&self, tls: &TlsInfo) -> SymbolValue {
        SymbolValue {
            value: self.reloc_value() as usize,
            size: self.size() as usize,
            ifunc: self.is_ifunc(),
            tls: self
                .module()
                .and_then(|lib| lib.tls)
                .and_then(|index| tls.slot(index)),
        }
    }
}
