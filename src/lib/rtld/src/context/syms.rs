use elf::abi::{STB_LOCAL, STB_WEAK};
use petgraph::visit::{Bfs, VisitMap, Visitable};
use tracing::trace;

use super::Context;
use crate::{
    library::{Module, ModuleFlags, ModuleId},
    symbol::{LookupFlags, ModuleLookup, RelocatedSymbol, SymbolName, VersionRequest},
    RtldError, RtldErrorKind,
};

/// What a scope search keeps when no module has a unique strong definition.
#[derive(Default)]
struct Fallback<'a> {
    weak: Option<RelocatedSymbol<'a>>,
    ambiguous: Option<RtldError>,
}

impl<'a> Fallback<'a> {
    /// A weak definition wins over an ambiguity seen elsewhere in the scope.
    fn finish(self) -> Result<Option<RelocatedSymbol<'a>>, RtldError> {
        match (self.weak, self.ambiguous) {
            (Some(weak), _) => Ok(Some(weak)),
            (None, Some(err)) => Err(err),
            (None, None) => Ok(None),
        }
    }
}

impl Context {
    /// The modules reachable from `start`, breadth first, `start` included.
    pub fn deps_search_list(&self, start: ModuleId) -> Vec<ModuleId> {
        let mut ret = vec![];
        let mut visit = Bfs::new(&self.graph, start.0);
        while let Some(node) = visit.next(&self.graph) {
            ret.push(ModuleId(node));
        }
        ret
    }

    fn startup_modules(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.modules()
            .filter(|m| m.flags.contains(ModuleFlags::STARTUP))
            .map(|m| m.id())
    }

    /// Search `ids` in order. A weak definition is held back in case a strong one follows, and a
    /// module with several candidate versions is passed over in case a later module has a
    /// unique one. `visited` lets one search span several lists without repeating a module.
    fn search_modules<'a>(
        &'a self,
        ids: impl IntoIterator<Item = ModuleId>,
        visited: &mut impl VisitMap<petgraph::stable_graph::NodeIndex>,
        fallback: &mut Fallback<'a>,
        name: &SymbolName<'_>,
        req: Option<&VersionRequest<'_>>,
        flags: LookupFlags,
    ) -> Option<RelocatedSymbol<'a>> {
        for id in ids {
            if !visited.visit(id.0) {
                continue;
            }
            let Some(module) = self.graph.node_weight(id.0) else {
                continue;
            };
            match module.lookup(name, req, flags) {
                ModuleLookup::Found(sym) => {
                    let found = RelocatedSymbol::new(sym, module);
                    if !found.is_weak() {
                        trace!("{}: found {} in {}", name.name, found.reloc_value(), module);
                        return Some(found);
                    }
                    fallback.weak.get_or_insert(found);
                }
                ModuleLookup::NotFound => {}
                ModuleLookup::Ambiguous(count) => {
                    trace!("{}: {} candidates in {}", name.name, count, module);
                    fallback.ambiguous.get_or_insert_with(|| {
                        RtldErrorKind::AmbiguousSymbol {
                            symname: name.name.to_string(),
                            library: module.name.clone(),
                            count,
                        }
                        .into()
                    });
                }
            }
        }
        None
    }

    pub(crate) fn lookup_export(&self, name: &str) -> Option<RelocatedSymbol<'static>> {
        self.exports
            .get(name)
            .map(|&addr| RelocatedSymbol::Export { addr })
    }

    /// Resolve a reference made by `requester`: the requester itself if it binds symbolically,
    /// then the startup modules, then the global scope, then the requester's own dependencies
    /// (`deps_list`), then the loader's exports.
    pub fn lookup_symbol<'a>(
        &'a self,
        requester: ModuleId,
        name: &SymbolName<'_>,
        req: Option<&VersionRequest<'_>>,
        flags: LookupFlags,
        deps_list: &[ModuleId],
    ) -> Result<RelocatedSymbol<'a>, RtldError> {
        let start = self.get_module(requester)?;
        let mut visited = self.graph.visit_map();
        let mut fallback = Fallback::default();
        let skip_self = flags.contains(LookupFlags::SKIP_SELF);
        if skip_self {
            visited.visit(requester.0);
        }
        let symbolic = !skip_self && start.flags.contains(ModuleFlags::SYMBOLIC);

        let scope = symbolic
            .then_some(requester)
            .into_iter()
            .chain(self.startup_modules())
            .chain(self.global.iter().copied())
            .chain(deps_list.iter().copied());
        let found = self.search_modules(scope, &mut visited, &mut fallback, name, req, flags);
        if let Some(found) = found {
            return Ok(found);
        }

        if !flags.contains(LookupFlags::SKIP_EXPORTS) {
            if let Some(found) = self.lookup_export(name.name) {
                return Ok(found);
            }
        }
        fallback.finish()?.ok_or_else(|| {
            RtldErrorKind::SymbolLookupFail {
                symname: name.name.to_string(),
                sourcelib: start.name.clone(),
            }
            .into()
        })
    }

    /// Search exactly the given modules, in order.
    pub fn lookup_in<'a>(
        &'a self,
        ids: impl IntoIterator<Item = ModuleId>,
        name: &SymbolName<'_>,
        req: Option<&VersionRequest<'_>>,
        flags: LookupFlags,
    ) -> Result<Option<RelocatedSymbol<'a>>, RtldError> {
        let mut visited = self.graph.visit_map();
        let mut fallback = Fallback::default();
        match self.search_modules(ids, &mut visited, &mut fallback, name, req, flags) {
            Some(found) => Ok(Some(found)),
            None => fallback.finish(),
        }
    }

    /// Search the global resolution scope: startup modules, then global modules, then the
    /// loader's exports.
    pub fn lookup_default<'a>(
        &'a self,
        name: &SymbolName<'_>,
        req: Option<&VersionRequest<'_>>,
    ) -> Result<Option<RelocatedSymbol<'a>>, RtldError> {
        let mut visited = self.graph.visit_map();
        let mut fallback = Fallback::default();
        let scope = self.startup_modules().chain(self.global.iter().copied());
        let found = self
            .search_modules(
                scope,
                &mut visited,
                &mut fallback,
                name,
                req,
                LookupFlags::empty(),
            )
            .or_else(|| self.lookup_export(name.name));
        match found {
            Some(found) => Ok(Some(found)),
            None => fallback.finish(),
        }
    }

    /// The version a reference to symbol `symidx` of `module` asks for.
    pub(crate) fn reference_version<'m>(
        &self,
        module: &'m Module,
        symidx: u32,
    ) -> Option<VersionRequest<'m>> {
        let ndx = module.versym(symidx)? & 0x7fff;
        if ndx <= 1 {
            return None;
        }
        if let Some(req) = module.versions.req(ndx) {
            return Some(VersionRequest::new(&req.name, req.is_weak()));
        }
        module
            .versions
            .def(ndx)
            .map(|def| VersionRequest::new(&def.name, false))
    }

    /// Resolve the symbol a relocation of `module` names. Local symbols bind to themselves; an
    /// unresolvable weak reference binds to zero.
    pub(crate) fn resolve_reference<'a>(
        &'a self,
        module: &'a Module,
        symidx: u32,
        flags: LookupFlags,
        deps_list: &[ModuleId],
    ) -> Result<RelocatedSymbol<'a>, RtldError> {
        let sym = module
            .symbol(symidx)
            .ok_or_else(|| RtldErrorKind::Internal {
                what: format!("{}: symbol index {} out of range", module, symidx),
            })?;
        if sym.st_bind() == STB_LOCAL {
            return Ok(RelocatedSymbol::new(sym, module));
        }
        let name = module.symbol_name(&sym).ok_or_else(|| RtldErrorKind::Internal {
            what: format!("{}: bad name for symbol {}", module, symidx),
        })?;
        let req = self.reference_version(module, symidx);
        match self.lookup_symbol(
            module.id(),
            &SymbolName::new(name),
            req.as_ref(),
            flags,
            deps_list,
        ) {
            Ok(found) => Ok(found),
            Err(e)
                if sym.st_bind() == STB_WEAK
                    && sym.is_undefined()
                    && matches!(e.kind, RtldErrorKind::SymbolLookupFail { .. }) =>
            {
                trace!("{}: weak reference {} left undefined", module, name);
                Ok(RelocatedSymbol::Undefined)
            }
            Err(e) => Err(e),
        }
    }
}
