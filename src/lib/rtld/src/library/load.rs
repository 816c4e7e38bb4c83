//! Turning an object file (or an image someone else already mapped) into a [Module].

use std::{os::unix::fs::FileExt, path::PathBuf};

use elf::{
    abi::{
        ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFDATA2MSB, ELFMAGIC, ET_DYN, ET_EXEC, EV_CURRENT,
        PT_DYNAMIC, PT_LOAD, PT_PHDR,
    },
    dynamic::DynamicTable,
    endian::NativeEndian,
    file::{Class, FileHeader},
    segment::{ProgramHeader, SegmentTable},
};
use petgraph::stable_graph::NodeIndex;
use tracing::{debug, trace};

use super::{DepEdge, DynamicInfo, Module, ModuleFlags, ModuleState, VersionInfo};
use crate::{
    arch::MACHINE,
    engines::{FileId, LoadDirective, LoadFlags, MapEngine, Mapping, ObjectFile},
    symbol::HashTable,
    HeaderError, RtldError, RtldErrorKind,
};

/// Most loadable segments we accept. Linkers emit two (text and data), sometimes a separate
/// read-only segment or two.
pub(crate) const MAX_LOAD_SEGMENTS: usize = 4;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadKind {
    /// A shared object: must be `ET_DYN`.
    Library,
    /// A main program: `ET_EXEC` is allowed too.
    Program,
}

const NATIVE_DATA: u8 = if cfg!(target_endian = "little") {
    ELFDATA2LSB
} else {
    ELFDATA2MSB
};

/// Validate the ELF file header.
pub(crate) fn check_header(
    buf: &[u8; EHDR_SIZE],
    kind: LoadKind,
) -> Result<FileHeader<NativeEndian>, RtldError> {
    if buf[..4] != ELFMAGIC {
        return Err(HeaderError::BadMagic {
            got: [buf[0], buf[1], buf[2], buf[3]],
        }
        .into());
    }
    match buf[elf::abi::EI_CLASS] {
        ELFCLASS64 => {}
        ELFCLASS32 => {
            return Err(HeaderError::ClassMismatch {
                expect: Class::ELF64,
                got: Class::ELF32,
            }
            .into())
        }
        _ => {}
    }
    if buf[elf::abi::EI_DATA] != NATIVE_DATA {
        return Err(HeaderError::EncodingMismatch {
            got: buf[elf::abi::EI_DATA],
        }
        .into());
    }
    let ident = elf::file::parse_ident::<NativeEndian>(buf)?;
    let hdr = FileHeader::parse_tail(ident, &buf[elf::abi::EI_NIDENT..])?;

    if hdr.version != EV_CURRENT as u32 {
        return Err(HeaderError::VersionMismatch {
            expect: EV_CURRENT as u32,
            got: hdr.version,
        }
        .into());
    }
    let type_ok = hdr.e_type == ET_DYN || (kind == LoadKind::Program && hdr.e_type == ET_EXEC);
    if !type_ok {
        return Err(HeaderError::ELFTypeMismatch {
            expect: ET_DYN,
            got: hdr.e_type,
        }
        .into());
    }
    if hdr.e_machine != MACHINE {
        return Err(HeaderError::MachineMismatch {
            expect: MACHINE,
            got: hdr.e_machine,
        }
        .into());
    }
    if hdr.e_phentsize as usize != PHDR_SIZE {
        return Err(HeaderError::PhentsizeMismatch {
            got: hdr.e_phentsize,
        }
        .into());
    }
    Ok(hdr)
}

fn read_headers(
    obj: &ObjectFile,
    kind: LoadKind,
) -> Result<(FileHeader<NativeEndian>, Vec<ProgramHeader>), RtldError> {
    let io_fail = |err| RtldErrorKind::OpenFail {
        path: obj.path.clone(),
        err,
    };
    let mut buf = [0u8; EHDR_SIZE];
    obj.file.read_exact_at(&mut buf, 0).map_err(io_fail)?;
    let hdr = check_header(&buf, kind)?;

    let mut phdr_bytes = vec![0u8; hdr.e_phnum as usize * PHDR_SIZE];
    obj.file
        .read_exact_at(&mut phdr_bytes, hdr.e_phoff)
        .map_err(io_fail)?;
    let phdrs = SegmentTable::new(NativeEndian, Class::ELF64, &phdr_bytes)
        .iter()
        .collect();
    Ok((hdr, phdrs))
}

fn check_segments(name: &str, phdrs: &[ProgramHeader]) -> Result<(), RtldError> {
    let loads = phdrs.iter().filter(|p| p.p_type == PT_LOAD).count();
    if loads == 0 || loads > MAX_LOAD_SEGMENTS {
        return Err(RtldErrorKind::SegmentCount {
            library: name.to_string(),
            count: loads,
        }
        .into());
    }
    if phdrs.iter().filter(|p| p.p_type == PT_DYNAMIC).count() != 1 {
        return Err(RtldErrorKind::MissingSection {
            library: name.to_string(),
            name: "PT_DYNAMIC".to_string(),
        }
        .into());
    }
    Ok(())
}

/// Map an object file and build its module record.
pub(crate) fn load_module(
    engine: &dyn MapEngine,
    obj: ObjectFile,
    name: &str,
    kind: LoadKind,
) -> Result<Module, RtldError> {
    let (hdr, phdrs) = read_headers(&obj, kind)?;
    check_segments(name, &phdrs)?;

    let directives: Vec<_> = phdrs
        .iter()
        .filter(|p| p.p_type == PT_LOAD)
        .map(|p| LoadDirective {
            load_flags: LoadFlags::from_phdr_flags(p.p_flags),
            vaddr: p.p_vaddr as usize,
            memsz: p.p_memsz as usize,
            offset: p.p_offset as usize,
            align: p.p_align as usize,
            filesz: p.p_filesz as usize,
        })
        .collect();
    let mapping = engine.map(&obj, name, &directives, hdr.e_type == ET_EXEC)?;
    let bias = mapping.bias();

    // The program headers are reachable in memory either through PT_PHDR or because the first
    // segment maps the start of the file.
    let phdr_addr = phdrs
        .iter()
        .find(|p| p.p_type == PT_PHDR)
        .map(|p| bias.wrapping_add(p.p_vaddr as usize))
        .or_else(|| {
            phdrs
                .iter()
                .find(|p| {
                    p.p_type == PT_LOAD
                        && p.p_offset <= hdr.e_phoff
                        && hdr.e_phoff < p.p_offset + p.p_filesz
                })
                .map(|p| bias.wrapping_add((p.p_vaddr + hdr.e_phoff - p.p_offset) as usize))
        });

    let entry = if hdr.e_entry == 0 {
        0
    } else {
        bias.wrapping_add(hdr.e_entry as usize)
    };
    let flags = match kind {
        LoadKind::Program => ModuleFlags::MAIN,
        LoadKind::Library => ModuleFlags::empty(),
    };
    assemble(
        name,
        obj.path.clone(),
        Some(obj.id),
        mapping,
        phdrs,
        phdr_addr,
        entry,
        flags,
    )
}

/// Build a module record for an image that is already mapped (the main program when the kernel
/// loaded it, or the loader itself).
///
/// # Safety
/// `phdr_addr` must point to `phnum` program headers of a fully mapped image. If the headers
/// have no `PT_PHDR` entry, `base` must be the image's load address.
pub(crate) unsafe fn module_from_image(
    name: &str,
    path: PathBuf,
    phdr_addr: usize,
    phnum: usize,
    entry: usize,
    base: Option<usize>,
    flags: ModuleFlags,
) -> Result<Module, RtldError> {
    let bytes = core::slice::from_raw_parts(phdr_addr as *const u8, phnum * PHDR_SIZE);
    let phdrs: Vec<ProgramHeader> = SegmentTable::new(NativeEndian, Class::ELF64, bytes)
        .iter()
        .collect();
    check_segments(name, &phdrs)?;

    let bias = match phdrs.iter().find(|p| p.p_type == PT_PHDR) {
        Some(p) => phdr_addr.wrapping_sub(p.p_vaddr as usize),
        None => base.ok_or_else(|| RtldErrorKind::MissingSection {
            library: name.to_string(),
            name: "PT_PHDR".to_string(),
        })?,
    };
    let loads = phdrs.iter().filter(|p| p.p_type == PT_LOAD);
    let lo = loads.clone().map(|p| p.p_vaddr as usize).min().unwrap_or(0);
    let hi = loads
        .map(|p| (p.p_vaddr + p.p_memsz) as usize)
        .max()
        .unwrap_or(0);
    let mapping = Mapping::preexisting(bias.wrapping_add(lo), hi - lo, bias);
    assemble(
        name,
        path,
        None,
        mapping,
        phdrs,
        Some(phdr_addr),
        entry,
        flags,
    )
}

fn split_path_list(list: Option<&str>) -> Vec<String> {
    list.map(|l| {
        l.split(':')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[allow(clippy::too_many_arguments)]
fn assemble(
    name: &str,
    path: PathBuf,
    file_id: Option<FileId>,
    mapping: Mapping,
    phdrs: Vec<ProgramHeader>,
    phdr_addr: Option<usize>,
    entry: usize,
    flags: ModuleFlags,
) -> Result<Module, RtldError> {
    let missing = |what: &str| RtldErrorKind::MissingSection {
        library: name.to_string(),
        name: what.to_string(),
    };
    let bias = mapping.bias();
    let dyn_phdr = phdrs
        .iter()
        .find(|p| p.p_type == PT_DYNAMIC)
        .ok_or_else(|| missing("PT_DYNAMIC"))?;
    let dyn_addr = bias.wrapping_add(dyn_phdr.p_vaddr as usize);
    if !mapping.contains(dyn_addr) {
        return Err(missing("PT_DYNAMIC").into());
    }
    let dyn_bytes =
        unsafe { core::slice::from_raw_parts(dyn_addr as *const u8, dyn_phdr.p_memsz as usize) };
    let dynamic =
        DynamicInfo::parse(DynamicTable::new(NativeEndian, Class::ELF64, dyn_bytes).iter());

    if dynamic.strtab.is_none() {
        return Err(missing("DT_STRTAB").into());
    }
    if dynamic.symtab.is_none() {
        return Err(missing("DT_SYMTAB").into());
    }
    let hash = match (dynamic.hash, dynamic.gnu_hash) {
        (Some(addr), _) => unsafe { HashTable::sysv(bias.wrapping_add(addr)) },
        (None, Some(addr)) => unsafe { HashTable::gnu(bias.wrapping_add(addr)) },
        (None, None) => return Err(missing("DT_HASH").into()),
    };
    let nsyms = unsafe { hash.symbol_count() };

    let flags = flags | dynamic.module_flags();
    let plt_trimmed = dynamic.plt_trimmed();
    let deps = dynamic
        .needed
        .iter()
        .map(|&name_off| DepEdge {
            name_off,
            resolved: None,
        })
        .collect();

    let mut module = Module {
        name: name.to_string(),
        path,
        soname: None,
        idx: NodeIndex::end(),
        file_id,
        mapping,
        phdrs,
        phdr_addr,
        entry,
        dynamic,
        hash,
        nsyms,
        deps,
        flags,
        refcount: 0,
        opencount: 0,
        state: ModuleState::Loading,
        tls: None,
        versions: VersionInfo::default(),
        rpath: vec![],
        runpath: vec![],
        plt_trimmed,
        lazy_cookie: None,
    };

    let soname = module
        .dynamic
        .soname
        .and_then(|off| module.string(off))
        .map(str::to_string);
    let rpath = split_path_list(module.dynamic.rpath.and_then(|off| module.string(off)));
    let runpath = split_path_list(module.dynamic.runpath.and_then(|off| module.string(off)));
    let versions = VersionInfo::parse(
        &module.strtab(),
        module
            .dynamic
            .verdef
            .map(|(addr, count)| (module.mem_from(addr), count)),
        module
            .dynamic
            .verneed
            .map(|(addr, count)| (module.mem_from(addr), count)),
    );
    module.soname = soname;
    module.rpath = rpath;
    module.runpath = runpath;
    module.versions = versions;

    debug!(
        "{}: loaded at {:x} ({}, {} symbols, {} deps)",
        module,
        module.base_addr(),
        humansize::format_size(module.mapped_len(), humansize::BINARY),
        module.nsyms,
        module.deps.len()
    );
    trace!("{}: flags {:?}, dynamic {:?}", module, module.flags, module.dynamic);
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(e_type: u16, machine: u16) -> [u8; EHDR_SIZE] {
        let mut b = [0u8; EHDR_SIZE];
        b[..4].copy_from_slice(&ELFMAGIC);
        b[4] = ELFCLASS64;
        b[5] = NATIVE_DATA;
        b[6] = EV_CURRENT;
        b[16..18].copy_from_slice(&e_type.to_ne_bytes());
        b[18..20].copy_from_slice(&machine.to_ne_bytes());
        b[20..24].copy_from_slice(&1u32.to_ne_bytes());
        b[32..40].copy_from_slice(&64u64.to_ne_bytes());
        b[52..54].copy_from_slice(&64u16.to_ne_bytes());
        b[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_ne_bytes());
        b
    }

    fn header_err(buf: &[u8; EHDR_SIZE], kind: LoadKind) -> HeaderError {
        match check_header(buf, kind).unwrap_err().kind {
            RtldErrorKind::InvalidELFHeader { hdr_err } => hdr_err,
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn accepts_native_shared_object() {
        let hdr = check_header(&header(ET_DYN, MACHINE), LoadKind::Library).unwrap();
        assert_eq!(hdr.e_phoff, 64);
    }

    #[test]
    fn rejects_bad_headers() {
        let mut bad = header(ET_DYN, MACHINE);
        bad[0] = 0;
        assert!(matches!(
            header_err(&bad, LoadKind::Library),
            HeaderError::BadMagic { .. }
        ));

        let mut bad = header(ET_DYN, MACHINE);
        bad[4] = ELFCLASS32;
        assert!(matches!(
            header_err(&bad, LoadKind::Library),
            HeaderError::ClassMismatch { .. }
        ));

        assert!(matches!(
            header_err(&header(ET_DYN, MACHINE + 1), LoadKind::Library),
            HeaderError::MachineMismatch { .. }
        ));
    }

    #[test]
    fn executables_only_as_programs() {
        let exec = header(ET_EXEC, MACHINE);
        assert!(matches!(
            header_err(&exec, LoadKind::Library),
            HeaderError::ELFTypeMismatch { .. }
        ));
        assert!(check_header(&exec, LoadKind::Program).is_ok());
    }

    #[test]
    fn path_lists() {
        assert_eq!(
            split_path_list(Some("/a::$ORIGIN/lib")),
            vec!["/a".to_string(), "$ORIGIN/lib".to_string()]
        );
        assert!(split_path_list(None).is_empty());
    }
}
