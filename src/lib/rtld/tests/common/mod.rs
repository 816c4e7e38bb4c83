//! Writes small but real ELF64 shared objects for the integration tests. Every object is one
//! read-write `PT_LOAD` segment whose virtual addresses equal its file offsets, so the tables the
//! loader reads can be laid out back to back.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use rtld::{symbol::elf_hash, Config};

#[cfg(target_arch = "x86_64")]
mod arch {
    pub const MACHINE: u16 = 62;
    pub const R_ABS64: u32 = 1;
    pub const R_COPY: u32 = 5;
    pub const R_GLOB_DAT: u32 = 6;
    pub const R_JUMP_SLOT: u32 = 7;
    pub const R_RELATIVE: u32 = 8;
}

#[cfg(target_arch = "aarch64")]
mod arch {
    pub const MACHINE: u16 = 183;
    pub const R_ABS64: u32 = 257;
    pub const R_COPY: u32 = 1024;
    pub const R_GLOB_DAT: u32 = 1025;
    pub const R_JUMP_SLOT: u32 = 1026;
    pub const R_RELATIVE: u32 = 1027;
}

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SYM_SIZE: usize = 24;
const RELA_SIZE: usize = 24;
const VERDEF_SIZE: usize = 28;

const DT_NULL: u64 = 0;
const DT_NEEDED: u64 = 1;
const DT_PLTRELSZ: u64 = 2;
const DT_PLTGOT: u64 = 3;
const DT_HASH: u64 = 4;
const DT_STRTAB: u64 = 5;
const DT_SYMTAB: u64 = 6;
const DT_RELA: u64 = 7;
const DT_RELASZ: u64 = 8;
const DT_RELAENT: u64 = 9;
const DT_STRSZ: u64 = 10;
const DT_SYMENT: u64 = 11;
const DT_SONAME: u64 = 14;
const DT_RPATH: u64 = 15;
const DT_SYMBOLIC: u64 = 16;
const DT_PLTREL: u64 = 20;
const DT_JMPREL: u64 = 23;
const DT_INIT_ARRAY: u64 = 25;
const DT_FINI_ARRAY: u64 = 26;
const DT_INIT_ARRAYSZ: u64 = 27;
const DT_FINI_ARRAYSZ: u64 = 28;
const DT_RUNPATH: u64 = 29;
const DT_VERSYM: u64 = 0x6fff_fff0;
const DT_FLAGS_1: u64 = 0x6fff_fffb;
const DT_VERDEF: u64 = 0x6fff_fffc;
const DT_VERDEFNUM: u64 = 0x6fff_fffd;
const DT_VERNEED: u64 = 0x6fff_fffe;
const DT_VERNEEDNUM: u64 = 0x6fff_ffff;

pub const DF_1_NODELETE: u64 = 0x8;
pub const DF_1_INITFIRST: u64 = 0x20;
pub const DF_1_NOOPEN: u64 = 0x40;

const SHN_ABS: u16 = 0xfff1;
const VER_FLG_BASE: u16 = 1;
const VERSYM_HIDDEN: u16 = 0x8000;

#[derive(Debug, Clone)]
pub enum SymKind {
    /// An 8-byte object in the data area with this initial value.
    Data(u64),
    /// An absolute function address.
    Func(usize),
    /// An indirect function whose resolver lives at this absolute address.
    Ifunc(usize),
    /// A thread-local object at this offset of the TLS template.
    Tls(u64),
    /// A reference to someone else's definition.
    Undef,
}

#[derive(Debug, Clone)]
pub struct Sym {
    pub name: String,
    pub kind: SymKind,
    pub weak: bool,
    /// Version name, and whether the definition is hidden.
    pub version: Option<(String, bool)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    Abs64,
    GlobDat,
    Relative,
    Copy,
    JumpSlot,
}

impl RelocKind {
    fn r_type(self) -> u32 {
        match self {
            RelocKind::Abs64 => arch::R_ABS64,
            RelocKind::GlobDat => arch::R_GLOB_DAT,
            RelocKind::Relative => arch::R_RELATIVE,
            RelocKind::Copy => arch::R_COPY,
            RelocKind::JumpSlot => arch::R_JUMP_SLOT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reloc {
    /// The data symbol whose cell the relocation writes.
    pub cell: String,
    pub kind: RelocKind,
    pub sym: Option<String>,
    pub addend: i64,
}

/// Description of one shared object.
#[derive(Debug, Clone, Default)]
pub struct Dso {
    pub soname: Option<String>,
    pub needed: Vec<String>,
    pub rpath: Option<String>,
    pub runpath: Option<String>,
    pub symbols: Vec<Sym>,
    pub relocs: Vec<Reloc>,
    /// Jump slot relocations, placed in `DT_JMPREL`.
    pub plt: Vec<Reloc>,
    pub init: Vec<usize>,
    pub fini: Vec<usize>,
    pub flags_1: u64,
    pub symbolic: bool,
    /// Versions this object defines, after its base version.
    pub versions: Vec<String>,
    /// Versions this object needs: (file, version).
    pub needs_versions: Vec<(String, String)>,
    pub tls: Vec<u8>,
}

impl Dso {
    pub fn new(soname: &str) -> Self {
        Self {
            soname: Some(soname.to_string()),
            ..Default::default()
        }
    }

    pub fn needs(mut self, name: &str) -> Self {
        self.needed.push(name.to_string());
        self
    }

    fn add(mut self, name: &str, kind: SymKind, weak: bool, version: Option<(&str, bool)>) -> Self {
        self.symbols.push(Sym {
            name: name.to_string(),
            kind,
            weak,
            version: version.map(|(v, hidden)| (v.to_string(), hidden)),
        });
        self
    }

    pub fn data(self, name: &str, value: u64) -> Self {
        self.add(name, SymKind::Data(value), false, None)
    }

    pub fn weak_data(self, name: &str, value: u64) -> Self {
        self.add(name, SymKind::Data(value), true, None)
    }

    pub fn func(self, name: &str, addr: usize) -> Self {
        self.add(name, SymKind::Func(addr), false, None)
    }

    pub fn versioned_func(self, name: &str, addr: usize, version: &str, hidden: bool) -> Self {
        self.add(name, SymKind::Func(addr), false, Some((version, hidden)))
    }

    pub fn ifunc(self, name: &str, resolver: usize) -> Self {
        self.add(name, SymKind::Ifunc(resolver), false, None)
    }

    pub fn tls_var(mut self, name: &str, init: &[u8]) -> Self {
        let offset = self.tls.len() as u64;
        self.tls.extend_from_slice(init);
        self.add(name, SymKind::Tls(offset), false, None)
    }

    pub fn undef(self, name: &str) -> Self {
        self.add(name, SymKind::Undef, false, None)
    }

    pub fn weak_undef(self, name: &str) -> Self {
        self.add(name, SymKind::Undef, true, None)
    }

    pub fn versioned_undef(self, name: &str, file: &str, version: &str) -> Self {
        let mut dso = self.add(name, SymKind::Undef, false, Some((version, false)));
        let need = (file.to_string(), version.to_string());
        if !dso.needs_versions.contains(&need) {
            dso.needs_versions.push(need);
        }
        dso
    }

    pub fn reloc(mut self, cell: &str, kind: RelocKind, sym: Option<&str>, addend: i64) -> Self {
        let reloc = Reloc {
            cell: cell.to_string(),
            kind,
            sym: sym.map(str::to_string),
            addend,
        };
        if kind == RelocKind::JumpSlot {
            self.plt.push(reloc);
        } else {
            self.relocs.push(reloc);
        }
        self
    }

    /// Write the object to `dir/file`.
    pub fn write(&self, dir: &Path, file: &str) -> PathBuf {
        let path = dir.join(file);
        std::fs::write(&path, self.build()).unwrap();
        path
    }

    /// The verdef index of each defined version: the base takes 1.
    fn def_index(&self, version: &str) -> Option<u16> {
        self.versions
            .iter()
            .position(|v| v == version)
            .map(|i| i as u16 + 2)
    }

    fn need_index(&self, version: &str) -> Option<u16> {
        self.needs_versions
            .iter()
            .position(|(_, v)| v == version)
            .map(|i| (self.versions.len() + i) as u16 + 2)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut strtab = StrTab::default();
        let needed: Vec<u32> = self.needed.iter().map(|n| strtab.add(n)).collect();
        let soname = self.soname.as_deref().map(|s| strtab.add(s));
        let rpath = self.rpath.as_deref().map(|s| strtab.add(s));
        let runpath = self.runpath.as_deref().map(|s| strtab.add(s));
        let sym_names: Vec<u32> = self.symbols.iter().map(|s| strtab.add(&s.name)).collect();
        let base_name = self.soname.clone().unwrap_or_else(|| "a.out".to_string());
        let base_name_off = strtab.add(&base_name);
        let version_offs: Vec<u32> = self.versions.iter().map(|v| strtab.add(v)).collect();
        let mut need_files: Vec<&str> = vec![];
        for (file, _) in &self.needs_versions {
            if !need_files.contains(&file.as_str()) {
                need_files.push(file);
            }
        }
        let need_file_offs: Vec<u32> = need_files.iter().map(|f| strtab.add(f)).collect();
        let need_version_offs: Vec<u32> = self
            .needs_versions
            .iter()
            .map(|(_, v)| strtab.add(v))
            .collect();

        let nsyms = self.symbols.len() + 1;
        let nbucket = (nsyms / 2).max(1);
        let versioned = !self.versions.is_empty() || !self.needs_versions.is_empty();
        let ndefs = if self.versions.is_empty() {
            0
        } else {
            self.versions.len() + 1
        };

        // Layout.
        let nphdrs = if self.tls.is_empty() { 2 } else { 3 };
        let mut off = EHDR_SIZE + nphdrs * PHDR_SIZE;
        let mut place = |len: usize, align: usize| {
            off = off.next_multiple_of(align);
            let at = off;
            off += len;
            at
        };
        let dynsym_off = place(nsyms * SYM_SIZE, 8);
        let dynstr_off = place(strtab.bytes.len(), 1);
        let hash_off = place((2 + nbucket + nsyms) * 4, 8);
        let versym_off = place(if versioned { nsyms * 2 } else { 0 }, 2);
        let verdef_off = place(ndefs * VERDEF_SIZE, 8);
        let verneed_off = place(
            need_files.len() * 16 + self.needs_versions.len() * 16,
            8,
        );
        let rela_off = place(self.relocs.len() * RELA_SIZE, 8);
        let jmprel_off = place(self.plt.len() * RELA_SIZE, 8);
        let tls_off = place(self.tls.len(), 8);
        let mut cells = HashMap::new();
        for sym in &self.symbols {
            if let SymKind::Data(_) = sym.kind {
                cells.insert(sym.name.clone(), place(8, 8));
            }
        }
        let got_off = place(if self.plt.is_empty() { 0 } else { 24 }, 8);
        let init_off = place(self.init.len() * 8, 8);
        let fini_off = place(self.fini.len() * 8, 8);

        let mut dynamic: Vec<(u64, u64)> = vec![];
        dynamic.extend(needed.iter().map(|&n| (DT_NEEDED, n as u64)));
        if let Some(s) = soname {
            dynamic.push((DT_SONAME, s as u64));
        }
        if let Some(r) = rpath {
            dynamic.push((DT_RPATH, r as u64));
        }
        if let Some(r) = runpath {
            dynamic.push((DT_RUNPATH, r as u64));
        }
        dynamic.extend([
            (DT_STRTAB, dynstr_off as u64),
            (DT_STRSZ, strtab.bytes.len() as u64),
            (DT_SYMTAB, dynsym_off as u64),
            (DT_SYMENT, SYM_SIZE as u64),
            (DT_HASH, hash_off as u64),
        ]);
        if !self.relocs.is_empty() {
            dynamic.extend([
                (DT_RELA, rela_off as u64),
                (DT_RELASZ, (self.relocs.len() * RELA_SIZE) as u64),
                (DT_RELAENT, RELA_SIZE as u64),
            ]);
        }
        if !self.plt.is_empty() {
            dynamic.extend([
                (DT_JMPREL, jmprel_off as u64),
                (DT_PLTRELSZ, (self.plt.len() * RELA_SIZE) as u64),
                (DT_PLTREL, DT_RELA),
                (DT_PLTGOT, got_off as u64),
            ]);
        }
        if !self.init.is_empty() {
            dynamic.push((DT_INIT_ARRAY, init_off as u64));
            dynamic.push((DT_INIT_ARRAYSZ, (self.init.len() * 8) as u64));
        }
        if !self.fini.is_empty() {
            dynamic.push((DT_FINI_ARRAY, fini_off as u64));
            dynamic.push((DT_FINI_ARRAYSZ, (self.fini.len() * 8) as u64));
        }
        if versioned {
            dynamic.push((DT_VERSYM, versym_off as u64));
        }
        if ndefs > 0 {
            dynamic.push((DT_VERDEF, verdef_off as u64));
            dynamic.push((DT_VERDEFNUM, ndefs as u64));
        }
        if !need_files.is_empty() {
            dynamic.push((DT_VERNEED, verneed_off as u64));
            dynamic.push((DT_VERNEEDNUM, need_files.len() as u64));
        }
        if self.flags_1 != 0 {
            dynamic.push((DT_FLAGS_1, self.flags_1));
        }
        if self.symbolic {
            dynamic.push((DT_SYMBOLIC, 0));
        }
        dynamic.push((DT_NULL, 0));
        let dynamic_off = place(dynamic.len() * 16, 8);
        let total = off;

        let mut out = Out(vec![0u8; total]);

        // File header.
        out.bytes(0, &[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.u16(16, 3);
        out.u16(18, arch::MACHINE);
        out.u32(20, 1);
        out.u64(32, EHDR_SIZE as u64);
        out.u16(52, EHDR_SIZE as u16);
        out.u16(54, PHDR_SIZE as u16);
        out.u16(56, nphdrs as u16);
        out.u16(58, 64);

        // Program headers.
        let mut phdr = |i: usize, p_type: u32, flags: u32, at: usize, len: usize, align: u64| {
            let base = EHDR_SIZE + i * PHDR_SIZE;
            out.u32(base, p_type);
            out.u32(base + 4, flags);
            out.u64(base + 8, at as u64);
            out.u64(base + 16, at as u64);
            out.u64(base + 24, at as u64);
            out.u64(base + 32, len as u64);
            out.u64(base + 40, len as u64);
            out.u64(base + 48, align);
        };
        phdr(0, 1, 6, 0, total, 0x1000);
        phdr(1, 2, 6, dynamic_off, dynamic.len() * 16, 8);
        if !self.tls.is_empty() {
            phdr(2, 7, 4, tls_off, self.tls.len(), 8);
        }

        out.bytes(dynstr_off, &strtab.bytes);

        // Symbols, with their versions.
        let mut sym_index = HashMap::new();
        for (i, sym) in self.symbols.iter().enumerate() {
            let idx = i + 1;
            sym_index.entry(sym.name.clone()).or_insert(idx);
            let (st_type, shndx, value, size) = match sym.kind {
                SymKind::Data(_) => (1u8, 1u16, cells[&sym.name] as u64, 8u64),
                SymKind::Func(addr) => (2, SHN_ABS, addr as u64, 0),
                SymKind::Ifunc(addr) => (10, SHN_ABS, addr as u64, 0),
                SymKind::Tls(offset) => (6, 1, offset, 8),
                SymKind::Undef => (0, 0, 0, 0),
            };
            let bind: u8 = if sym.weak { 2 } else { 1 };
            let at = dynsym_off + idx * SYM_SIZE;
            out.u32(at, sym_names[i]);
            out.bytes(at + 4, &[(bind << 4) | st_type, 0]);
            out.u16(at + 6, shndx);
            out.u64(at + 8, value);
            out.u64(at + 16, size);
            if let SymKind::Data(init) = sym.kind {
                out.u64(cells[&sym.name], init);
            }
            if versioned {
                let ver = match (&sym.version, &sym.kind) {
                    (None, _) => 1,
                    (Some((v, _)), SymKind::Undef) => self.need_index(v).unwrap_or(1),
                    (Some((v, hidden)), _) => {
                        self.def_index(v).unwrap_or(1) | if *hidden { VERSYM_HIDDEN } else { 0 }
                    }
                };
                out.u16(versym_off + idx * 2, ver);
            }
        }

        // SysV hash table.
        let mut buckets = vec![0u32; nbucket];
        let mut chains = vec![0u32; nsyms];
        for (i, sym) in self.symbols.iter().enumerate() {
            let b = elf_hash(sym.name.as_bytes()) as usize % nbucket;
            chains[i + 1] = buckets[b];
            buckets[b] = (i + 1) as u32;
        }
        out.u32(hash_off, nbucket as u32);
        out.u32(hash_off + 4, nsyms as u32);
        for (i, b) in buckets.iter().enumerate() {
            out.u32(hash_off + 8 + i * 4, *b);
        }
        for (i, c) in chains.iter().enumerate() {
            out.u32(hash_off + 8 + (nbucket + i) * 4, *c);
        }

        // Version definitions: the base first.
        let defs = std::iter::once((&base_name, base_name_off, VER_FLG_BASE))
            .chain(self.versions.iter().zip(version_offs.iter().copied()).map(|(v, o)| (v, o, 0)));
        for (i, (name, name_off, flags)) in defs.take(ndefs).enumerate() {
            let at = verdef_off + i * VERDEF_SIZE;
            out.u16(at, 1);
            out.u16(at + 2, flags);
            out.u16(at + 4, i as u16 + 1);
            out.u16(at + 6, 1);
            out.u32(at + 8, elf_hash(name.as_bytes()));
            out.u32(at + 12, 20);
            out.u32(at + 16, if i + 1 == ndefs { 0 } else { VERDEF_SIZE as u32 });
            out.u32(at + 20, name_off);
        }

        // Version requirements, grouped by file.
        let mut at = verneed_off;
        for (fi, file) in need_files.iter().enumerate() {
            let reqs: Vec<usize> = self
                .needs_versions
                .iter()
                .enumerate()
                .filter(|(_, (f, _))| f == file)
                .map(|(i, _)| i)
                .collect();
            let size = 16 + reqs.len() * 16;
            out.u16(at, 1);
            out.u16(at + 2, reqs.len() as u16);
            out.u32(at + 4, need_file_offs[fi]);
            out.u32(at + 8, 16);
            out.u32(at + 12, if fi + 1 == need_files.len() { 0 } else { size as u32 });
            for (ri, &req) in reqs.iter().enumerate() {
                let aux = at + 16 + ri * 16;
                let version = &self.needs_versions[req].1;
                out.u32(aux, elf_hash(version.as_bytes()));
                out.u16(aux + 4, 0);
                out.u16(aux + 6, self.need_index(version).unwrap_or(0));
                out.u32(aux + 8, need_version_offs[req]);
                out.u32(aux + 12, if ri + 1 == reqs.len() { 0 } else { 16 });
            }
            at += size;
        }

        // Relocations.
        let mut write_relocs = |table: usize, relocs: &[Reloc]| {
            for (i, r) in relocs.iter().enumerate() {
                let at = table + i * RELA_SIZE;
                let sym = r.sym.as_ref().map_or(0, |s| sym_index[s]) as u64;
                out.u64(at, cells[&r.cell] as u64);
                out.u64(at + 8, (sym << 32) | r.kind.r_type() as u64);
                out.u64(at + 16, r.addend as u64);
            }
        };
        write_relocs(rela_off, &self.relocs);
        write_relocs(jmprel_off, &self.plt);

        out.bytes(tls_off, &self.tls);
        for (i, f) in self.init.iter().enumerate() {
            out.u64(init_off + i * 8, *f as u64);
        }
        for (i, f) in self.fini.iter().enumerate() {
            out.u64(fini_off + i * 8, *f as u64);
        }
        for (i, (tag, val)) in dynamic.iter().enumerate() {
            out.u64(dynamic_off + i * 16, *tag);
            out.u64(dynamic_off + i * 16 + 8, *val);
        }
        out.0
    }
}

#[derive(Debug)]
struct StrTab {
    bytes: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl Default for StrTab {
    fn default() -> Self {
        Self {
            bytes: vec![0],
            offsets: HashMap::new(),
        }
    }
}

impl StrTab {
    fn add(&mut self, s: &str) -> u32 {
        if let Some(off) = self.offsets.get(s) {
            return *off;
        }
        let off = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(s.to_string(), off);
        off
    }
}

struct Out(Vec<u8>);

impl Out {
    fn bytes(&mut self, at: usize, b: &[u8]) {
        self.0[at..at + b.len()].copy_from_slice(b);
    }

    fn u16(&mut self, at: usize, v: u16) {
        self.bytes(at, &v.to_le_bytes());
    }

    fn u32(&mut self, at: usize, v: u32) {
        self.bytes(at, &v.to_le_bytes());
    }

    fn u64(&mut self, at: usize, v: u64) {
        self.bytes(at, &v.to_le_bytes());
    }
}

/// A fresh directory for one test's objects.
pub fn scratch(name: &str) -> PathBuf {
    let dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join(format!("rtld-{}", name));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// A configuration that only looks in `dirs`.
pub fn config(dirs: &[&Path]) -> Config {
    Config {
        library_path: dirs.iter().map(|d| d.display().to_string()).collect(),
        default_paths: vec![],
        hints_path: PathBuf::from("/nonexistent/ld.so.hints"),
        ..Config::default()
    }
}

/// Read the 8-byte cell at `addr`.
pub fn read_cell(addr: usize) -> u64 {
    unsafe { (addr as *const u64).read_unaligned() }
}
