use std::collections::HashMap;

use elf::{
    abi::{DT_RELA, PF_W, PT_LOAD},
    endian::NativeEndian,
    file::Class,
    relocation::{RelIterator, RelaIterator},
};
use tracing::{debug, error, trace};

use super::Context;
use crate::{
    arch::{
        reloc_name, Applied, RelocBackend, RelocEntry, RelocSite, SymbolValue, BACKEND,
        REL_PLT,
    },
    engines::LoadFlags,
    library::{LazyCookie, Module, ModuleFlags, ModuleId, ModuleState, Table},
    symbol::{LookupFlags, SymbolName},
    RtldError, RtldErrorKind,
};

const REL_SIZE: usize = 16;
const RELA_SIZE: usize = 24;

/// An indirect function whose resolver runs once the batch is otherwise relocated.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingIfunc {
    pub(crate) target: *mut usize,
    pub(crate) resolver: usize,
    pub(crate) addend: i64,
}

#[derive(Debug, Clone, Copy)]
struct PendingCopy {
    module: ModuleId,
    target: usize,
    symidx: u32,
}

/// Work left over after the relocation pass of a batch.
#[derive(Debug, Default)]
pub(crate) struct RelocOutput {
    pub(crate) ifuncs: Vec<PendingIfunc>,
    copies: Vec<PendingCopy>,
}

fn parse_entries(data: &[u8], rela: bool) -> Vec<RelocEntry> {
    if rela {
        RelaIterator::new(NativeEndian, Class::ELF64, data)
            .map(|r| RelocEntry {
                r_type: r.r_type,
                r_offset: r.r_offset,
                r_sym: r.r_sym,
                addend: Some(r.r_addend),
            })
            .collect()
    } else {
        RelIterator::new(NativeEndian, Class::ELF64, data)
            .map(|r| RelocEntry {
                r_type: r.r_type,
                r_offset: r.r_offset,
                r_sym: r.r_sym,
                addend: None,
            })
            .collect()
    }
}

/// `table` without the part `hole` covers.
fn trim(table: Table, hole: Table) -> Vec<Table> {
    [
        Table {
            addr: table.addr,
            size: hole.addr.saturating_sub(table.addr),
        },
        Table {
            addr: hole.end(),
            size: table.end().saturating_sub(hole.end()),
        },
    ]
    .into_iter()
    .filter(|t| t.size > 0)
    .collect()
}

/// Call every pending resolver and store its result.
///
/// # Safety
/// Every target must still be mapped and writable, and every resolver a function.
pub(crate) unsafe fn resolve_ifuncs(pending: &[PendingIfunc]) {
    for ifunc in pending {
        let value = BACKEND.call0(ifunc.resolver);
        let value = (value as u64).wrapping_add_signed(ifunc.addend) as usize;
        trace!(
            "ifunc {:x} => {:x} at {:p}",
            ifunc.resolver,
            value,
            ifunc.target
        );
        ifunc.target.write_unaligned(value);
    }
}

impl Context {
    /// The non-PLT tables of a module, with the PLT range cut out if it shares their array.
    fn general_tables(module: &Module) -> Vec<(Table, bool)> {
        let dynamic = &module.dynamic;
        let mut tables = vec![];
        for (table, rela) in [(dynamic.rela, true), (dynamic.rel, false)] {
            let Some(table) = table else {
                continue;
            };
            match dynamic.jmprel {
                Some(jmprel) if module.plt_trimmed && table.contains(&jmprel) => {
                    tables.extend(trim(table, jmprel).into_iter().map(|t| (t, rela)))
                }
                _ => tables.push((table, rela)),
            }
        }
        tables
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_one(
        &self,
        module: &Module,
        rel: &RelocEntry,
        flags: LookupFlags,
        deps_list: &[ModuleId],
        cache: &mut HashMap<u32, SymbolValue>,
        out: &mut RelocOutput,
    ) -> Result<(), RtldError> {
        let target = module.laddr(rel.r_offset as usize) as *mut u8;
        let addend = match rel.addend {
            Some(addend) => addend,
            None => unsafe { (target as *const i64).read_unaligned() },
        };
        let site = RelocSite {
            target,
            bias: module.bias(),
            addend,
            own_tls: module.tls.and_then(|index| self.tls.slot(index)),
        };
        let mut resolve = || -> Result<SymbolValue, RtldError> {
            if let Some(value) = cache.get(&rel.r_sym) {
                return Ok(*value);
            }
            let sym = self.resolve_reference(module, rel.r_sym, flags, deps_list)?;
            let value = sym.to_value(&self.tls);
            cache.insert(rel.r_sym, value);
            Ok(value)
        };
        trace!(
            "{}: {} at {:p} (sym {}, addend {:#x})",
            module,
            reloc_name(rel.r_type),
            target,
            rel.r_sym,
            addend
        );
        match unsafe { BACKEND.apply(rel, &site, &mut resolve)? } {
            Applied::Done => Ok(()),
            Applied::Copy => {
                if !module.is_main() {
                    let symname = module
                        .symbol(rel.r_sym)
                        .and_then(|s| module.symbol_name(&s).map(str::to_string))
                        .unwrap_or_default();
                    error!("{}: copy relocation for {} in a library", module, symname);
                    return Err(RtldErrorKind::CopyRelocInLibrary {
                        symname,
                        library: module.name.clone(),
                    }
                    .into());
                }
                out.copies.push(PendingCopy {
                    module: module.id(),
                    target: target as usize,
                    symidx: rel.r_sym,
                });
                Ok(())
            }
            Applied::Ifunc {
                target,
                resolver,
                addend,
            } => {
                out.ifuncs.push(PendingIfunc {
                    target,
                    resolver,
                    addend,
                });
                Ok(())
            }
            Applied::Unsupported => {
                let name = reloc_name(rel.r_type);
                error!("{}: unsupported relocation {} ({})", module, name, rel.r_type);
                Err(RtldErrorKind::UnsupportedReloc {
                    library: module.name.clone(),
                    reloc: format!("{} ({})", name, rel.r_type),
                }
                .into())
            }
            Applied::MissingTls => Err(RtldErrorKind::NoTLSInfo {
                library: module.name.clone(),
            }
            .into()),
        }
    }

    fn process_rels(
        &self,
        module: &Module,
        table: Table,
        rela: bool,
        flags: LookupFlags,
        deps_list: &[ModuleId],
        out: &mut RelocOutput,
    ) -> Result<(), RtldError> {
        let entries = parse_entries(module.mem(table.addr, table.size), rela);
        let secname = if rela { "RELA" } else { "REL" };
        debug!(
            "{}: processing {} relocations (num = {})",
            module,
            secname,
            entries.len()
        );
        let mut cache = HashMap::new();
        RtldError::collect(
            RtldErrorKind::RelocationSectionFail {
                secname: secname.to_string(),
                library: module.name.clone(),
            },
            entries
                .iter()
                .map(|rel| self.apply_one(module, rel, flags, deps_list, &mut cache, out)),
        )?;
        Ok(())
    }

    fn relocate_plt(
        &self,
        module: &Module,
        lazy_cookie: Option<usize>,
        deps_list: &[ModuleId],
        out: &mut RelocOutput,
    ) -> Result<(), RtldError> {
        let Some(jmprel) = module.dynamic.jmprel else {
            return Ok(());
        };
        let rela = module.dynamic.pltrel == Some(DT_RELA);
        let (Some(cookie), Some(pltgot)) = (lazy_cookie, module.dynamic.pltgot) else {
            return self.process_rels(module, jmprel, rela, LookupFlags::empty(), deps_list, out);
        };

        let entries = parse_entries(module.mem(jmprel.addr, jmprel.size), rela);
        debug!("{}: {} lazy PLT slots", module, entries.len());
        unsafe { BACKEND.init_lazy(module.laddr(pltgot) as *mut usize, cookie) };
        let mut cache = HashMap::new();
        for rel in &entries {
            if rel.r_type == REL_PLT {
                // The slot holds the link-time address of its PLT stub.
                let slot = module.laddr(rel.r_offset as usize) as *mut usize;
                unsafe { slot.write(module.laddr(slot.read())) };
            } else {
                self.apply_one(
                    module,
                    rel,
                    LookupFlags::empty(),
                    deps_list,
                    &mut cache,
                    out,
                )?;
            }
        }
        Ok(())
    }

    fn set_text_writable(&self, module: &Module, writable: bool) -> Result<(), RtldError> {
        let page = self.engine.page_size();
        for phdr in module
            .phdrs
            .iter()
            .filter(|p| p.p_type == PT_LOAD && p.p_flags & PF_W == 0)
        {
            let start = module.laddr(phdr.p_vaddr as usize) & !(page - 1);
            let end = module.laddr((phdr.p_vaddr + phdr.p_memsz) as usize);
            let mut flags = LoadFlags::from_phdr_flags(phdr.p_flags);
            if writable {
                flags |= LoadFlags::TARGETS_DATA;
            }
            self.engine
                .protect(start, end - start, flags)
                .map_err(|err| RtldErrorKind::ProtectFail {
                    library: module.name.clone(),
                    err,
                })?;
        }
        Ok(())
    }

    fn relocate_single(
        &mut self,
        id: ModuleId,
        bind_now: bool,
        out: &mut RelocOutput,
    ) -> Result<(), RtldError> {
        let module = self.get_module(id)?;
        let eager = bind_now
            || self.config.bind_now
            || module.flags.contains(ModuleFlags::BIND_NOW)
            || module.dynamic.pltgot.is_none();
        let lazy_cookie = if eager || module.dynamic.jmprel.is_none() {
            None
        } else {
            let cookie = Box::new(LazyCookie {
                owner: self.owner,
                module: id,
            });
            let addr = &*cookie as *const LazyCookie as usize;
            self.get_module_mut(id)?.lazy_cookie = Some(cookie);
            Some(addr)
        };

        let module = self.get_module(id)?;
        debug!("{}: relocating ({})", module, if eager { "now" } else { "lazy" });
        let deps_list = self.deps_search_list(id);
        let textrel = module.flags.contains(ModuleFlags::TEXTREL);
        if textrel {
            self.set_text_writable(module, true)?;
        }

        let res = Self::general_tables(module)
            .into_iter()
            .try_for_each(|(table, rela)| {
                self.process_rels(module, table, rela, LookupFlags::ALLOW_PLT, &deps_list, out)
            })
            .and_then(|_| self.relocate_plt(module, lazy_cookie, &deps_list, out));

        if textrel {
            self.set_text_writable(module, false)?;
        }
        res
    }

    /// Copy the initial values of data the main program took copies of.
    fn process_copies(&self, copies: &[PendingCopy]) -> Result<(), RtldError> {
        for copy in copies {
            let module = self.get_module(copy.module)?;
            let sym = module
                .symbol(copy.symidx)
                .ok_or_else(|| RtldErrorKind::Internal {
                    what: format!("{}: copy of symbol {} out of range", module, copy.symidx),
                })?;
            let name = module.symbol_name(&sym).unwrap_or_default();
            let req = self.reference_version(module, copy.symidx);
            let deps_list = self.deps_search_list(copy.module);
            let src = self.lookup_symbol(
                copy.module,
                &SymbolName::new(name),
                req.as_ref(),
                LookupFlags::SKIP_SELF | LookupFlags::SKIP_EXPORTS,
                &deps_list,
            )?;
            let len = (sym.st_size as usize).min(src.size() as usize);
            trace!(
                "{}: copy {} bytes of {} from {:x}",
                module,
                len,
                name,
                src.reloc_value()
            );
            unsafe {
                (copy.target as *mut u8)
                    .copy_from_nonoverlapping(src.reloc_value() as *const u8, len)
            };
        }
        Ok(())
    }

    /// Relocate every module of a batch, dependencies first, then perform the copies. Indirect
    /// functions are handed back to the caller, who runs them with the lock downgraded.
    pub(crate) fn relocate_batch(
        &mut self,
        batch: &[ModuleId],
        bind_now: bool,
    ) -> Result<RelocOutput, RtldError> {
        let mut out = RelocOutput::default();
        for &id in batch.iter().rev() {
            if self.get_module(id)?.state != ModuleState::Loading {
                continue;
            }
            if let Err(e) = self.relocate_single(id, bind_now, &mut out) {
                let library = self.get_module(id)?.name.clone();
                error!("{}: failed to relocate", library);
                return Err(RtldError::new_collect(
                    RtldErrorKind::RelocationFail { library },
                    vec![e],
                ));
            }
        }
        self.process_copies(&out.copies)?;
        for &id in batch {
            let module = self.get_module_mut(id)?;
            if module.state == ModuleState::Loading {
                module.state = ModuleState::Relocated;
            }
        }
        Ok(out)
    }
}

/// Resolve one PLT slot of `id`, for the lazy binding trampoline.
pub(super) fn bind_lazy(ctx: &Context, id: ModuleId, index: usize) -> Result<usize, RtldError> {
    let module = ctx.get_module(id)?;
    let jmprel = module
        .dynamic
        .jmprel
        .ok_or_else(|| RtldErrorKind::MissingSection {
            library: module.name.clone(),
            name: "DT_JMPREL".to_string(),
        })?;
    let rela = module.dynamic.pltrel == Some(DT_RELA);
    let entsize = if rela { RELA_SIZE } else { REL_SIZE };
    if (index + 1) * entsize > jmprel.size {
        return Err(RtldErrorKind::Internal {
            what: format!("{}: PLT index {} out of range", module, index),
        }
        .into());
    }
    let rel = parse_entries(module.mem(jmprel.addr + index * entsize, entsize), rela)
        .into_iter()
        .next()
        .ok_or_else(|| RtldErrorKind::Internal {
            what: format!("{}: unreadable PLT entry {}", module, index),
        })?;

    let deps_list = ctx.deps_search_list(id);
    let sym = ctx.resolve_reference(module, rel.r_sym, LookupFlags::empty(), &deps_list)?;
    let mut value = sym.reloc_value() as usize;
    if sym.is_ifunc() {
        value = unsafe { BACKEND.call0(value) };
    }
    let slot = module.laddr(rel.r_offset as usize) as *mut usize;
    unsafe { BACKEND.apply_plt(slot, value) };
    debug!("{}: bound PLT slot {} to {:x}", module, index, value);
    Ok(value)
}
