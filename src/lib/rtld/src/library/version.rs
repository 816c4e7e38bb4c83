//! Symbol version definitions and requirements. These are read once, when the module is
//! loaded, and never recomputed.

use elf::{
    abi::{VER_FLG_BASE, VER_FLG_WEAK},
    endian::NativeEndian,
    file::Class,
    gnu_symver::{VerDefIterator, VerNeedIterator},
    string_table::StringTable,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDef {
    pub hash: u32,
    pub name: String,
    pub flags: u16,
    pub index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReq {
    pub hash: u32,
    pub name: String,
    pub flags: u16,
    pub index: u16,
    /// The file that must provide this version.
    pub file: String,
}

impl VersionReq {
    pub fn is_weak(&self) -> bool {
        self.flags & VER_FLG_WEAK != 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub defs: Vec<VersionDef>,
    pub reqs: Vec<VersionReq>,
}

impl VersionInfo {
    /// Read the definition and requirement lists. `verdef` and `verneed` hold the table bytes
    /// (from the table start to the end of the mapping) and the entry count.
    pub fn parse(
        strtab: &StringTable<'_>,
        verdef: Option<(&[u8], u64)>,
        verneed: Option<(&[u8], u64)>,
    ) -> Self {
        let mut info = VersionInfo::default();
        if let Some((data, count)) = verdef {
            for (vd, mut aux) in VerDefIterator::new(NativeEndian, Class::ELF64, count, 0, data) {
                // The first aux entry names the version; the rest name its parents.
                let Some(name) = aux.next().and_then(|a| strtab.get(a.vda_name as usize).ok())
                else {
                    continue;
                };
                info.defs.push(VersionDef {
                    hash: vd.vd_hash,
                    name: name.to_string(),
                    flags: vd.vd_flags,
                    index: vd.vd_ndx,
                });
            }
        }
        if let Some((data, count)) = verneed {
            for (vn, aux) in VerNeedIterator::new(NativeEndian, Class::ELF64, count, 0, data) {
                let Ok(file) = strtab.get(vn.vn_file as usize) else {
                    continue;
                };
                for vna in aux {
                    let Ok(name) = strtab.get(vna.vna_name as usize) else {
                        continue;
                    };
                    info.reqs.push(VersionReq {
                        hash: vna.vna_hash,
                        name: name.to_string(),
                        flags: vna.vna_flags,
                        index: vna.vna_other,
                        file: file.to_string(),
                    });
                }
            }
        }
        info
    }

    pub fn def(&self, index: u16) -> Option<&VersionDef> {
        let index = index & 0x7fff;
        self.defs.iter().find(|d| d.index == index)
    }

    pub fn req(&self, index: u16) -> Option<&VersionReq> {
        let index = index & 0x7fff;
        self.reqs.iter().find(|r| r.index == index)
    }

    /// Index of the definition naming the module itself.
    pub fn base_index(&self) -> Option<u16> {
        self.defs
            .iter()
            .find(|d| d.flags & VER_FLG_BASE != 0)
            .map(|d| d.index)
    }

    /// Requirements grouped by the file that must satisfy them.
    pub fn reqs_by_file(&self) -> impl Iterator<Item = (&str, Vec<&VersionReq>)> {
        use itertools::Itertools;
        self.reqs
            .iter()
            .chunk_by(|r| r.file.as_str())
            .into_iter()
            .map(|(file, reqs)| (file, reqs.collect()))
            .collect::<Vec<_>>()
            .into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::elf_hash;

    fn push_u16(b: &mut Vec<u8>, v: u16) {
        b.extend_from_slice(&v.to_ne_bytes());
    }

    fn push_u32(b: &mut Vec<u8>, v: u32) {
        b.extend_from_slice(&v.to_ne_bytes());
    }

    #[test]
    fn reads_definitions_and_requirements() {
        let strs = b"\0libfoo.so\0FOO_1.0\0libbar.so\0BAR_2.0\0";
        let strtab = StringTable::new(strs);
        // Two definitions: the base (index 1, names the file) and FOO_1.0 (index 2).
        let mut vd = vec![];
        for (i, (flags, name_off)) in [(VER_FLG_BASE, 1u32), (0, 11)].into_iter().enumerate() {
            push_u16(&mut vd, 1);
            push_u16(&mut vd, flags);
            push_u16(&mut vd, i as u16 + 1);
            push_u16(&mut vd, 1);
            let name = if name_off == 1 { "libfoo.so" } else { "FOO_1.0" };
            push_u32(&mut vd, elf_hash(name.as_bytes()));
            push_u32(&mut vd, 20);
            push_u32(&mut vd, if i == 0 { 28 } else { 0 });
            push_u32(&mut vd, name_off);
            push_u32(&mut vd, 0);
        }
        // One requirement on libbar.so for BAR_2.0, weak, index 3.
        let mut vn = vec![];
        push_u16(&mut vn, 1);
        push_u16(&mut vn, 1);
        push_u32(&mut vn, 19);
        push_u32(&mut vn, 16);
        push_u32(&mut vn, 0);
        push_u32(&mut vn, elf_hash(b"BAR_2.0"));
        push_u16(&mut vn, VER_FLG_WEAK);
        push_u16(&mut vn, 3);
        push_u32(&mut vn, 29);
        push_u32(&mut vn, 0);

        let info = VersionInfo::parse(&strtab, Some((&vd, 2)), Some((&vn, 1)));
        assert_eq!(info.defs.len(), 2);
        assert_eq!(info.base_index(), Some(1));
        let foo = info.def(2).unwrap();
        assert_eq!(foo.name, "FOO_1.0");
        assert_eq!(foo.hash, elf_hash(b"FOO_1.0"));
        // The hidden bit is not part of the index.
        assert_eq!(info.def(0x8002), Some(foo));

        let bar = info.req(3).unwrap();
        assert_eq!(bar.file, "libbar.so");
        assert_eq!(bar.name, "BAR_2.0");
        assert!(bar.is_weak());
        let grouped: Vec<_> = info.reqs_by_file().collect();
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].0, "libbar.so");
    }
}
