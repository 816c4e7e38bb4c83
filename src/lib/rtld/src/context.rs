//! Management of the object graph: every loaded module, the edges between them, the global
//! resolution scope and the TLS state they share.

use std::collections::HashMap;

use petgraph::stable_graph::StableDiGraph;
use tracing::debug;

use crate::{
    api::Shared,
    config::Config,
    engines::{FileId, MapEngine},
    fatal_error,
    library::{LazyCookie, Module, ModuleId, ModuleState},
    path::PathResolver,
    tls::TlsInfo,
    RtldError, RtldErrorKind,
};

mod lifecycle;
mod load;
mod relocate;
mod syms;

pub(crate) use lifecycle::{run_functions, ModuleFunctions};
pub(crate) use load::Batch;
pub(crate) use relocate::{resolve_ifuncs, PendingIfunc};

/// Names the loader is willing to hand out from its own export table.
pub const EXPORTABLE: &[&str] = &[
    "dlopen",
    "dlclose",
    "dlsym",
    "dlvsym",
    "dlerror",
    "dladdr",
    "dlinfo",
    "dl_iterate_phdr",
    "__tls_get_addr",
];

/// A dynamic linker context, the main state struct for this crate.
pub struct Context {
    // The main object graph: nodes are modules, edges point from a module to the modules it
    // needs.
    pub(crate) graph: StableDiGraph<Module, ()>,
    // Every module, in the order it was added.
    pub(crate) load_order: Vec<ModuleId>,
    // Modules opened with global visibility, in the order they were promoted.
    pub(crate) global: Vec<ModuleId>,
    pub(crate) exports: HashMap<String, usize>,
    pub(crate) paths: PathResolver,
    pub(crate) tls: TlsInfo,
    pub(crate) engine: Box<dyn MapEngine>,
    pub(crate) config: Config,
    pub(crate) instance: u64,
    // The shared state this context lives in, for lazy binding cookies.
    pub(crate) owner: *const Shared,
    pub(crate) main: Option<ModuleId>,
    // Counters reported through dl_iterate_phdr.
    pub(crate) adds: u64,
    pub(crate) subs: u64,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("modules", &self.load_order.len())
            .field("global", &self.global)
            .field("main", &self.main)
            .field("tls", &self.tls)
            .field("adds", &self.adds)
            .field("subs", &self.subs)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Construct a new dynamic linker context.
    pub fn new(
        config: Config,
        engine: Box<dyn MapEngine>,
        paths: PathResolver,
        instance: u64,
    ) -> Self {
        Self {
            graph: StableDiGraph::new(),
            load_order: vec![],
            global: vec![],
            exports: HashMap::new(),
            paths,
            tls: TlsInfo::new(crate::arch::TLS_VARIANT),
            engine,
            config,
            instance,
            owner: core::ptr::null(),
            main: None,
            adds: 0,
            subs: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tls(&self) -> &TlsInfo {
        &self.tls
    }

    /// Get a module reference from a module ID.
    pub fn get_module(&self, id: ModuleId) -> Result<&Module, RtldError> {
        self.graph
            .node_weight(id.0)
            .ok_or_else(|| RtldErrorKind::InvalidHandle { id }.into())
    }

    /// Get a mut module reference from a module ID.
    pub fn get_module_mut(&mut self, id: ModuleId) -> Result<&mut Module, RtldError> {
        self.graph
            .node_weight_mut(id.0)
            .ok_or_else(|| RtldErrorKind::InvalidHandle { id }.into())
    }

    /// Every module, in load order.
    pub fn modules(&self) -> impl Iterator<Item = &Module> + '_ {
        self.load_order
            .iter()
            .filter_map(|id| self.graph.node_weight(id.0))
    }

    pub fn main_module(&self) -> Option<&Module> {
        self.main.and_then(|id| self.graph.node_weight(id.0))
    }

    /// The module whose mapping contains `addr`.
    pub fn module_at(&self, addr: usize) -> Option<&Module> {
        self.modules().find(|m| m.contains(addr))
    }

    /// A live module known by `name`.
    pub fn find_loaded(&self, name: &str) -> Option<ModuleId> {
        self.modules()
            .find(|m| m.state != ModuleState::Finalized && m.matches_name(name))
            .map(|m| m.id())
    }

    pub(crate) fn find_by_file(&self, file_id: FileId) -> Option<ModuleId> {
        self.modules()
            .find(|m| m.state != ModuleState::Finalized && m.file_id == Some(file_id))
            .map(|m| m.id())
    }

    /// Add a module to the graph.
    pub(crate) fn insert(&mut self, module: Module) -> ModuleId {
        let idx = self.graph.add_node(module);
        self.graph[idx].idx = idx;
        let id = ModuleId(idx);
        self.load_order.push(id);
        self.adds += 1;
        if self.graph[idx].is_main() {
            self.main = Some(id);
        }
        debug!("{}: inserted as {}", self.graph[idx], id);
        id
    }

    /// Take a module out of the graph. Dropping the returned module unmaps it.
    pub(crate) fn remove(&mut self, id: ModuleId) -> Option<Module> {
        let module = self.graph.remove_node(id.0)?;
        self.load_order.retain(|&m| m != id);
        self.global.retain(|&m| m != id);
        if let Some(index) = module.tls {
            self.tls.release(index);
        }
        if self.main == Some(id) {
            self.main = None;
        }
        self.subs += 1;
        Some(module)
    }

    /// Register one of the loader's entry points so modules can bind to it.
    pub fn export_symbol(&mut self, name: &str, addr: usize) -> Result<(), RtldError> {
        if !EXPORTABLE.contains(&name) {
            return Err(RtldErrorKind::NotExportable {
                name: name.to_string(),
            }
            .into());
        }
        debug!("export {} => {:x}", name, addr);
        self.exports.insert(name.to_string(), addr);
        Ok(())
    }

    /// Resolve one PLT slot on first call.
    pub(crate) fn bind_lazy(&self, id: ModuleId, index: usize) -> Result<usize, RtldError> {
        relocate::bind_lazy(self, id, index)
    }
}

/// Entered from the lazy binding trampoline: resolve PLT entry `index` of the module described
/// by `cookie`, patch its slot and return the target. Failure is fatal.
///
/// # Safety
/// `cookie` must be a cookie installed by the relocation driver, for a module that is still
/// loaded.
pub(crate) unsafe extern "C" fn rtld_lazy_bind(cookie: *const LazyCookie, index: usize) -> usize {
    let cookie = &*cookie;
    let shared = &*cookie.owner;
    let _guard = shared.lock.shared();
    match shared.ctx().bind_lazy(cookie.module, index) {
        Ok(addr) => addr,
        Err(e) => fatal_error(&e),
    }
}
