use petgraph::visit::DfsPostOrder;
use tracing::{debug, trace};

use super::Context;
use crate::{
    arch::{RelocBackend, BACKEND},
    library::{ModuleFlags, ModuleId, ModuleState},
    RtldError,
};

/// Functions to call for one module, in order.
#[derive(Debug, Clone)]
pub(crate) struct ModuleFunctions {
    pub(crate) module: String,
    pub(crate) funcs: Vec<usize>,
}

/// Call a list of init or fini functions. Must be called without any borrow of the context
/// alive, since the functions may call back into the loader.
///
/// # Safety
/// Every address must be a function with the C calling convention in a module that stays
/// mapped for the duration of the call.
pub(crate) unsafe fn run_functions(lists: &[ModuleFunctions], what: &str) {
    for list in lists {
        for &func in &list.funcs {
            trace!("{}: calling {} function {:x}", list.module, what, func);
            BACKEND.call0(func);
        }
    }
}

impl Context {
    /// Modules reachable from `roots` in dependency post-order: every module after everything it
    /// needs. Cycles are broken at the first module revisited.
    pub(crate) fn post_order(&self, roots: &[ModuleId]) -> Vec<ModuleId> {
        let mut ret = vec![];
        let mut dfs = DfsPostOrder::empty(&self.graph);
        for root in roots {
            if self.graph.node_weight(root.0).is_none() {
                continue;
            }
            dfs.move_to(root.0);
            while let Some(node) = dfs.next(&self.graph) {
                ret.push(ModuleId(node));
            }
        }
        ret
    }

    /// Relocated but uninitialized modules reachable from `roots`, in the order their
    /// initializers run: `INITFIRST` modules first, then dependencies before dependents.
    pub(crate) fn init_order(&self, roots: &[ModuleId]) -> Vec<ModuleId> {
        let (mut first, rest): (Vec<_>, Vec<_>) = self
            .post_order(roots)
            .into_iter()
            .filter(|id| self.graph[id.0].state == ModuleState::Relocated)
            .partition(|id| self.graph[id.0].flags.contains(ModuleFlags::INITFIRST));
        first.extend(rest);
        first
    }

    /// Mark the modules of `order` initialized and collect their initializers (the main
    /// program's preinit array first).
    pub(crate) fn take_initializers(
        &mut self,
        order: &[ModuleId],
    ) -> Result<Vec<ModuleFunctions>, RtldError> {
        let mut lists = vec![];
        for &id in order {
            let module = self.get_module_mut(id)?;
            module.state = ModuleState::Initialized;
            let mut funcs = module.preinitializers();
            funcs.extend(module.initializers());
            debug!("{}: {} initializers", module, funcs.len());
            lists.push(ModuleFunctions {
                module: module.name.clone(),
                funcs,
            });
        }
        Ok(lists)
    }

    /// Take one reference on every module reachable from `root`.
    pub(crate) fn ref_dag(&mut self, root: ModuleId) {
        for id in self.deps_search_list(root) {
            if let Some(module) = self.graph.node_weight_mut(id.0) {
                module.refcount += 1;
            }
        }
    }

    /// Drop one reference on every module reachable from `root`.
    pub(crate) fn unref_dag(&mut self, root: ModuleId) {
        for id in self.deps_search_list(root) {
            if let Some(module) = self.graph.node_weight_mut(id.0) {
                module.refcount = module.refcount.saturating_sub(1);
            }
        }
    }

    /// Pin a module and its dependencies for the life of the process.
    pub(crate) fn pin(&mut self, root: ModuleId) -> Result<(), RtldError> {
        let module = self.get_module_mut(root)?;
        if module.flags.contains(ModuleFlags::NODELETE) {
            return Ok(());
        }
        module.flags |= ModuleFlags::NODELETE;
        debug!("{}: pinned", module);
        self.ref_dag(root);
        Ok(())
    }

    /// Pin the new modules of a batch that asked for it in their dynamic flags.
    pub(crate) fn pin_flagged(&mut self, new: &[ModuleId]) {
        for &id in new {
            if self.graph[id.0].flags.contains(ModuleFlags::NODELETE) {
                self.ref_dag(id);
            }
        }
    }

    /// Add `root` and its dependencies to the global scope.
    pub(crate) fn promote_global(&mut self, root: ModuleId) {
        for id in self.deps_search_list(root) {
            if !self.global.contains(&id) {
                self.global.push(id);
            }
            if let Some(module) = self.graph.node_weight_mut(id.0) {
                module.flags |= ModuleFlags::GLOBAL;
            }
        }
    }

    /// Modules reachable from `root` that no one references any more, in the order their
    /// finalizers run: deepest dependency first, `INITFIRST` modules last.
    pub(crate) fn unload_order(&self, root: ModuleId) -> Vec<ModuleId> {
        let (first, mut last): (Vec<_>, Vec<_>) = self
            .post_order(&[root])
            .into_iter()
            .filter(|id| {
                let module = &self.graph[id.0];
                module.refcount == 0
                    && !module
                        .flags
                        .intersects(ModuleFlags::NODELETE | ModuleFlags::MAIN | ModuleFlags::LOADER)
            })
            .partition(|id| !self.graph[id.0].flags.contains(ModuleFlags::INITFIRST));
        let mut order = first;
        order.append(&mut last);
        order
    }

    /// Mark the modules of `order` finalized and collect the finalizers of those that were
    /// initialized.
    pub(crate) fn take_finalizers(
        &mut self,
        order: &[ModuleId],
    ) -> Result<Vec<ModuleFunctions>, RtldError> {
        let mut lists = vec![];
        for &id in order {
            let module = self.get_module_mut(id)?;
            let initialized = module.state == ModuleState::Initialized;
            module.state = ModuleState::Finalized;
            if initialized {
                lists.push(ModuleFunctions {
                    module: module.name.clone(),
                    funcs: module.finalizers(),
                });
            }
        }
        Ok(lists)
    }

    /// Remove finalized modules from the graph, unmapping them.
    pub(crate) fn remove_modules(&mut self, order: &[ModuleId]) {
        for &id in order {
            if let Some(module) = self.remove(id) {
                debug!("{}: unloaded", module);
            }
        }
    }
}
