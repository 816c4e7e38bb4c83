//! The dynamic array, walked tag by tag.

use elf::{
    abi::{
        DF_1_INITFIRST, DF_1_NODELETE, DF_1_NOOPEN, DF_1_NOW, DF_BIND_NOW, DF_STATIC_TLS,
        DF_SYMBOLIC, DF_TEXTREL, DT_BIND_NOW, DT_FINI, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_FLAGS,
        DT_FLAGS_1, DT_GNU_HASH, DT_HASH, DT_INIT, DT_INIT_ARRAY, DT_INIT_ARRAYSZ, DT_JMPREL,
        DT_NEEDED, DT_NULL, DT_PLTGOT, DT_PLTREL, DT_PLTRELSZ, DT_PREINIT_ARRAY,
        DT_PREINIT_ARRAYSZ, DT_REL, DT_RELA, DT_RELASZ, DT_RELSZ, DT_RPATH, DT_RUNPATH,
        DT_SONAME, DT_STRSZ, DT_STRTAB, DT_SYMBOLIC, DT_SYMTAB, DT_TEXTREL, DT_VERDEF,
        DT_VERDEFNUM, DT_VERNEED, DT_VERNEEDNUM, DT_VERSYM,
    },
    dynamic::Dyn,
};

use super::ModuleFlags;

/// A table given as link-time address plus size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Table {
    pub addr: usize,
    pub size: usize,
}

impl Table {
    pub fn end(&self) -> usize {
        self.addr + self.size
    }

    pub fn contains(&self, other: &Table) -> bool {
        other.addr >= self.addr && other.end() <= self.end()
    }
}

/// Everything the loader needs from `PT_DYNAMIC`. Addresses are link-time addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicInfo {
    /// String-table offsets of `DT_NEEDED` entries, in order.
    pub needed: Vec<u32>,
    pub soname: Option<u32>,
    pub rpath: Option<u32>,
    pub runpath: Option<u32>,
    pub strtab: Option<usize>,
    pub strsz: usize,
    pub symtab: Option<usize>,
    pub hash: Option<usize>,
    pub gnu_hash: Option<usize>,
    pub rela: Option<Table>,
    pub rel: Option<Table>,
    pub jmprel: Option<Table>,
    /// `DT_RELA` or `DT_REL`, the entry kind of `DT_JMPREL`.
    pub pltrel: Option<i64>,
    pub pltgot: Option<usize>,
    pub init: Option<usize>,
    pub fini: Option<usize>,
    pub init_array: Option<Table>,
    pub fini_array: Option<Table>,
    pub preinit_array: Option<Table>,
    pub versym: Option<usize>,
    pub verdef: Option<(usize, u64)>,
    pub verneed: Option<(usize, u64)>,
    pub flags: u64,
    pub flags_1: u64,
    pub textrel: bool,
    pub symbolic: bool,
    pub bind_now: bool,
}

fn table(addr: Option<usize>, size: Option<usize>) -> Option<Table> {
    match (addr, size) {
        (Some(addr), Some(size)) if size > 0 => Some(Table { addr, size }),
        _ => None,
    }
}

impl DynamicInfo {
    /// Collect the dynamic array, stopping at `DT_NULL`.
    pub fn parse(entries: impl IntoIterator<Item = Dyn>) -> Self {
        let mut info = DynamicInfo::default();
        let mut rela = (None, None);
        let mut rel = (None, None);
        let mut jmprel = (None, None);
        let mut init_array = (None, None);
        let mut fini_array = (None, None);
        let mut preinit_array = (None, None);
        let mut verdef = (None, 0);
        let mut verneed = (None, 0);
        for d in entries {
            let tag = d.d_tag;
            let ptr = d.clone().d_ptr() as usize;
            match tag {
                DT_NULL => break,
                DT_NEEDED => info.needed.push(d.d_val() as u32),
                DT_SONAME => info.soname = Some(d.d_val() as u32),
                DT_RPATH => info.rpath = Some(d.d_val() as u32),
                DT_RUNPATH => info.runpath = Some(d.d_val() as u32),
                DT_STRTAB => info.strtab = Some(ptr),
                DT_STRSZ => info.strsz = d.d_val() as usize,
                DT_SYMTAB => info.symtab = Some(ptr),
                DT_HASH => info.hash = Some(ptr),
                DT_GNU_HASH => info.gnu_hash = Some(ptr),
                DT_RELA => rela.0 = Some(ptr),
                DT_RELASZ => rela.1 = Some(d.d_val() as usize),
                DT_REL => rel.0 = Some(ptr),
                DT_RELSZ => rel.1 = Some(d.d_val() as usize),
                DT_JMPREL => jmprel.0 = Some(ptr),
                DT_PLTRELSZ => jmprel.1 = Some(d.d_val() as usize),
                DT_PLTREL => info.pltrel = Some(d.d_val() as i64),
                DT_PLTGOT => info.pltgot = Some(ptr),
                DT_INIT => info.init = Some(ptr),
                DT_FINI => info.fini = Some(ptr),
                DT_INIT_ARRAY => init_array.0 = Some(ptr),
                DT_INIT_ARRAYSZ => init_array.1 = Some(d.d_val() as usize),
                DT_FINI_ARRAY => fini_array.0 = Some(ptr),
                DT_FINI_ARRAYSZ => fini_array.1 = Some(d.d_val() as usize),
                DT_PREINIT_ARRAY => preinit_array.0 = Some(ptr),
                DT_PREINIT_ARRAYSZ => preinit_array.1 = Some(d.d_val() as usize),
                DT_VERSYM => info.versym = Some(ptr),
                DT_VERDEF => verdef.0 = Some(ptr),
                DT_VERDEFNUM => verdef.1 = d.d_val(),
                DT_VERNEED => verneed.0 = Some(ptr),
                DT_VERNEEDNUM => verneed.1 = d.d_val(),
                DT_FLAGS => info.flags = d.d_val(),
                DT_FLAGS_1 => info.flags_1 = d.d_val(),
                DT_TEXTREL => info.textrel = true,
                DT_SYMBOLIC => info.symbolic = true,
                DT_BIND_NOW => info.bind_now = true,
                _ => {}
            }
        }
        info.rela = table(rela.0, rela.1);
        info.rel = table(rel.0, rel.1);
        info.jmprel = table(jmprel.0, jmprel.1);
        info.init_array = table(init_array.0, init_array.1);
        info.fini_array = table(fini_array.0, fini_array.1);
        info.preinit_array = table(preinit_array.0, preinit_array.1);
        info.verdef = verdef.0.map(|addr| (addr, verdef.1));
        info.verneed = verneed.0.map(|addr| (addr, verneed.1));
        info
    }

    /// Module flags implied by the dynamic array.
    pub fn module_flags(&self) -> ModuleFlags {
        let mut flags = ModuleFlags::empty();
        let has = |word: u64, bit: i64| word & bit as u64 != 0;
        if self.textrel || has(self.flags, DF_TEXTREL) {
            flags |= ModuleFlags::TEXTREL;
        }
        if self.symbolic || has(self.flags, DF_SYMBOLIC) {
            flags |= ModuleFlags::SYMBOLIC;
        }
        if self.bind_now || has(self.flags, DF_BIND_NOW) || has(self.flags_1, DF_1_NOW) {
            flags |= ModuleFlags::BIND_NOW;
        }
        if has(self.flags, DF_STATIC_TLS) {
            flags |= ModuleFlags::STATIC_TLS;
        }
        if has(self.flags_1, DF_1_NODELETE) {
            flags |= ModuleFlags::NODELETE;
        }
        if has(self.flags_1, DF_1_INITFIRST) {
            flags |= ModuleFlags::INITFIRST;
        }
        if has(self.flags_1, DF_1_NOOPEN) {
            flags |= ModuleFlags::NOOPEN;
        }
        flags
    }

    /// Whether the PLT relocations are a sub-range of the ordinary relocation table, in which
    /// case they must be left out when the ordinary table is processed.
    pub fn plt_trimmed(&self) -> bool {
        let Some(jmprel) = self.jmprel else {
            return false;
        };
        let outer = if self.pltrel == Some(DT_REL) {
            self.rel
        } else {
            self.rela
        };
        outer.is_some_and(|outer| outer.contains(&jmprel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dyns(entries: &[(i64, u64)]) -> Vec<Dyn> {
        let mut bytes = vec![];
        for (tag, val) in entries {
            bytes.extend_from_slice(&tag.to_ne_bytes());
            bytes.extend_from_slice(&val.to_ne_bytes());
        }
        let table: elf::dynamic::DynamicTable<'_, elf::endian::NativeEndian> =
            elf::parse::ParsingTable::new(
                elf::endian::NativeEndian,
                elf::file::Class::ELF64,
                &bytes,
            );
        table.iter().collect()
    }

    #[test]
    fn parses_tables_and_stops_at_null() {
        let info = DynamicInfo::parse(dyns(&[
            (DT_NEEDED, 1),
            (DT_NEEDED, 9),
            (DT_STRTAB, 0x400),
            (DT_STRSZ, 0x80),
            (DT_SYMTAB, 0x200),
            (DT_RELA, 0x1000),
            (DT_RELASZ, 0x60),
            (DT_JMPREL, 0x1030),
            (DT_PLTRELSZ, 0x30),
            (DT_PLTREL, DT_RELA as u64),
            (DT_FLAGS, (DF_TEXTREL | DF_BIND_NOW) as u64),
            (DT_FLAGS_1, DF_1_NODELETE as u64),
            (DT_NULL, 0),
            (DT_NEEDED, 20),
        ]));
        assert_eq!(info.needed, vec![1, 9]);
        assert_eq!(info.strtab, Some(0x400));
        assert_eq!(
            info.rela,
            Some(Table {
                addr: 0x1000,
                size: 0x60
            })
        );
        assert!(info.plt_trimmed());
        let flags = info.module_flags();
        assert!(flags.contains(ModuleFlags::TEXTREL | ModuleFlags::BIND_NOW | ModuleFlags::NODELETE));
        assert!(!flags.contains(ModuleFlags::SYMBOLIC));
    }

    #[test]
    fn separate_plt_table_is_not_trimmed() {
        let info = DynamicInfo::parse(dyns(&[
            (DT_RELA, 0x1000),
            (DT_RELASZ, 0x30),
            (DT_JMPREL, 0x1030),
            (DT_PLTRELSZ, 0x30),
            (DT_PLTREL, DT_RELA as u64),
        ]));
        assert!(!info.plt_trimmed());
        assert_eq!(DynamicInfo::parse(vec![]).jmprel, None);
    }
}
