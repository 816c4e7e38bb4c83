//! The run-time interface: the [Rtld] handle and the `dl*` family of operations on it.

use std::{
    cell::UnsafeCell,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{
    arch::{RelocBackend, BACKEND},
    config::Config,
    context::{resolve_ifuncs, run_functions, Batch, Context, ModuleFunctions, PendingIfunc},
    engines::{mmap::MmapEngine, MapEngine},
    fatal_error,
    library::{LoadKind, ModuleFlags, ModuleId},
    lock::RtldLock,
    path::{PathResolver, Requester},
    symbol::{LookupFlags, RelocatedSymbol, SymbolName, VersionRequest},
    tls::{free_thread, StaticTlsBlock},
    ErrorClass, RtldError, RtldErrorKind,
};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// The loader state shared by every clone of an [Rtld]: the context and the lock guarding it.
pub(crate) struct Shared {
    pub(crate) lock: RtldLock,
    ctx: UnsafeCell<Context>,
    last_error: Mutex<Option<String>>,
}

// The context is only reached through the lock.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    /// # Safety
    /// The caller must hold the lock, shared or exclusive.
    pub(crate) unsafe fn ctx(&self) -> &Context {
        &*self.ctx.get()
    }

    /// # Safety
    /// The caller must hold the lock exclusively and not downgraded, and must not keep any
    /// other reference to the context alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn ctx_mut(&self) -> &mut Context {
        if !self.lock.held_exclusive() || self.lock.is_downgraded() {
            fatal_error(
                &RtldErrorKind::Internal {
                    what: "loader state modified without the exclusive lock".to_string(),
                }
                .into(),
            );
        }
        &mut *self.ctx.get()
    }
}

bitflags::bitflags! {
    /// Mode bits for [Rtld::dlopen]. Exactly one of `LAZY` and `NOW` must be given.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct DlopenMode: i32 {
        const LAZY = 1;
        const NOW = 2;
        /// Only succeed if the module is already loaded.
        const NOLOAD = 4;
        /// Add the module and its dependencies to the global scope.
        const GLOBAL = 0x100;
        /// Never unload the module.
        const NODELETE = 0x1000;
    }
}

impl DlopenMode {
    pub const LOCAL: Self = Self::empty();

    /// Check raw mode bits as passed to the C `dlopen`.
    pub fn from_raw(mode: i32) -> Result<Self, RtldError> {
        let flags = Self::from_bits(mode).ok_or(RtldErrorKind::InvalidMode { mode })?;
        flags.validate()?;
        Ok(flags)
    }

    fn validate(&self) -> Result<(), RtldError> {
        let binding = *self & (Self::LAZY | Self::NOW);
        if binding == Self::LAZY || binding == Self::NOW {
            Ok(())
        } else {
            Err(RtldErrorKind::InvalidMode { mode: self.bits() }.into())
        }
    }
}

/// Which modules a [Rtld::dlsym] searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlHandle {
    /// The global resolution scope.
    Default,
    /// Only the module containing `addr` (the caller's return address).
    Caller { addr: usize },
    /// The caller's module and every module loaded after it.
    SelfAndLater { addr: usize },
    /// Every module loaded after the caller's.
    Next { addr: usize },
    /// A module returned by [Rtld::dlopen] and everything it depends on.
    Module(ModuleId),
}

/// The result of [Rtld::dladdr].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlInfo {
    pub fname: PathBuf,
    pub fbase: usize,
    pub sname: Option<String>,
    pub saddr: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlInfoRequest {
    LinkMap,
    Origin,
    SearchPaths,
    TlsModId,
    TlsData,
    RefCounts,
}

/// The link map entry of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMap {
    pub name: PathBuf,
    /// Relocation bias.
    pub addr: usize,
    /// Address of the dynamic section.
    pub dynamic: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlInfoValue {
    LinkMap(LinkMap),
    Origin(PathBuf),
    SearchPaths(Vec<String>),
    /// Zero for modules without TLS.
    TlsModId(usize),
    /// The calling thread's block, if it has one. Never allocates.
    TlsData(Option<usize>),
    RefCounts { refcount: usize, opencount: usize },
}

/// One record of [Rtld::dl_iterate_phdr].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhdrInfo {
    /// Relocation bias.
    pub addr: usize,
    pub name: String,
    /// Run-time address of the program headers, or zero if they are not mapped.
    pub phdr: usize,
    pub phnum: usize,
    pub adds: u64,
    pub subs: u64,
    pub tls_modid: usize,
    pub tls_data: Option<usize>,
}

/// Where to continue once startup is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct BootInfo {
    pub entry: usize,
    pub thread_pointer: usize,
    /// Leading arguments the loader consumed (the program path when run directly).
    pub args_consumed: usize,
}

/// A handle to a loader instance. Clones share the same state.
#[derive(Clone)]
pub struct Rtld {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Rtld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let _guard = self.shared.lock.shared();
        let ctx = unsafe { self.shared.ctx() };
        f.debug_struct("Rtld").field("ctx", ctx).finish()
    }
}

impl Rtld {
    /// A loader mapping files with `mmap`, searching paths as `config` says.
    pub fn new(config: Config) -> Self {
        let paths = PathResolver::from_config(&config);
        Self::with_engine(config, Box::new(MmapEngine), paths)
    }

    pub fn with_engine(config: Config, engine: Box<dyn MapEngine>, paths: PathResolver) -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            lock: RtldLock::new(),
            ctx: UnsafeCell::new(Context::new(config, engine, paths, instance)),
            last_error: Mutex::new(None),
        });
        // Nothing else can see the context yet.
        unsafe { (*shared.ctx.get()).owner = Arc::as_ptr(&shared) };
        Self { shared }
    }

    /// Remember a recoverable error for `dlerror`. Protocol errors never come back.
    pub(crate) fn record(&self, err: RtldError) -> RtldError {
        if err.class() == ErrorClass::Protocol {
            fatal_error(&err);
        }
        let msg = err.message();
        debug!("dlerror: {}", msg);
        *self.shared.last_error.lock() = Some(msg);
        err
    }

    /// Run `f` against the loader state, under the shared lock.
    pub fn with_context<R>(&self, f: impl FnOnce(&Context) -> R) -> R {
        let _guard = self.shared.lock.shared();
        f(unsafe { self.shared.ctx() })
    }

    /// Open `name` (or, for `None`, the main program) and everything it needs.
    pub fn dlopen(&self, name: Option<&str>, mode: DlopenMode) -> Result<ModuleId, RtldError> {
        mode.validate().map_err(|e| self.record(e))?;
        let mut guard = self.shared.lock.exclusive();

        let (root, ifuncs) = {
            let ctx = unsafe { self.shared.ctx_mut() };
            let Some(name) = name else {
                return Self::open_main(ctx).map_err(|e| self.record(e));
            };
            let mut batch = ctx.begin_batch();
            match Self::open_batch(ctx, &mut batch, name, mode) {
                Ok(ret) => ret,
                Err(e) => {
                    error!("dlopen {}: {}", name, e);
                    ctx.rollback(batch);
                    return Err(self.record(e));
                }
            }
        };

        guard.with_downgraded(|| unsafe { resolve_ifuncs(&ifuncs) });
        let inits = self.take_initializers(&[root])?;
        unsafe { run_functions(&inits, "init") };
        drop(guard);
        Ok(root)
    }

    fn open_main(ctx: &mut Context) -> Result<ModuleId, RtldError> {
        let main = ctx.main.ok_or_else(|| RtldErrorKind::NotResident {
            name: "main program".to_string(),
        })?;
        ctx.ref_dag(main);
        ctx.get_module_mut(main)?.opencount += 1;
        Ok(main)
    }

    fn open_batch(
        ctx: &mut Context,
        batch: &mut Batch,
        name: &str,
        mode: DlopenMode,
    ) -> Result<(ModuleId, Vec<PendingIfunc>), RtldError> {
        let root = if mode.contains(DlopenMode::NOLOAD) {
            ctx.find_loaded(name)
                .ok_or_else(|| RtldErrorKind::NotResident {
                    name: name.to_string(),
                })?
        } else {
            let requester = ctx.main;
            ctx.load_object(
                batch,
                name,
                requester,
                LoadKind::Library,
                ModuleFlags::empty(),
            )?
        };
        let module = ctx.get_module(root)?;
        if module.flags.contains(ModuleFlags::NOOPEN) {
            return Err(RtldErrorKind::NoOpen {
                library: module.name.clone(),
            }
            .into());
        }

        ctx.load_dependencies(batch, root)?;
        RtldError::collect(
            RtldErrorKind::LibraryLoadFail {
                library: name.to_string(),
            },
            batch.new.iter().map(|&id| ctx.check_versions(id)),
        )?;
        ctx.ref_dag(root);
        batch.referenced = Some(root);

        let bind_now = mode.contains(DlopenMode::NOW) || ctx.config.bind_now;
        let out = ctx.relocate_batch(&batch.new, bind_now)?;

        ctx.pin_flagged(&batch.new);
        if mode.contains(DlopenMode::NODELETE) {
            ctx.pin(root)?;
        }
        if mode.contains(DlopenMode::GLOBAL) {
            ctx.promote_global(root);
        }
        let module = ctx.get_module_mut(root)?;
        module.opencount += 1;
        debug!(
            "dlopen {}: {} (refcount {}, opencount {})",
            name, module, module.refcount, module.opencount
        );
        Ok((root, out.ifuncs))
    }

    /// Collect the initializers of everything reachable from `roots` that still needs them.
    /// The exclusive lock must be held.
    fn take_initializers(&self, roots: &[ModuleId]) -> Result<Vec<ModuleFunctions>, RtldError> {
        let ctx = unsafe { self.shared.ctx_mut() };
        let order = ctx.init_order(roots);
        ctx.take_initializers(&order).map_err(|e| self.record(e))
    }

    /// Drop one open of `handle`. Modules nothing references any more are finalized and
    /// unmapped.
    pub fn dlclose(&self, handle: ModuleId) -> Result<(), RtldError> {
        let guard = self.shared.lock.exclusive();
        let (order, finis) = {
            let ctx = unsafe { self.shared.ctx_mut() };
            let module = ctx.get_module_mut(handle).map_err(|e| self.record(e))?;
            if module.opencount == 0 {
                return Err(self.record(RtldErrorKind::InvalidHandle { id: handle }.into()));
            }
            module.opencount -= 1;
            ctx.unref_dag(handle);
            let order = ctx.unload_order(handle);
            let finis = ctx.take_finalizers(&order).map_err(|e| self.record(e))?;
            (order, finis)
        };
        unsafe { run_functions(&finis, "fini") };
        let ctx = unsafe { self.shared.ctx_mut() };
        ctx.remove_modules(&order);
        drop(guard);
        Ok(())
    }

    /// Address of `name` in the scope `handle` names.
    pub fn dlsym(&self, handle: DlHandle, name: &str) -> Result<usize, RtldError> {
        self.find_symbol(handle, name, None)
    }

    /// Address of version `version` of `name` in the scope `handle` names.
    pub fn dlvsym(&self, handle: DlHandle, name: &str, version: &str) -> Result<usize, RtldError> {
        self.find_symbol(handle, name, Some(version))
    }

    fn find_symbol(
        &self,
        handle: DlHandle,
        name: &str,
        version: Option<&str>,
    ) -> Result<usize, RtldError> {
        let _guard = self.shared.lock.shared();
        let ctx = unsafe { self.shared.ctx() };
        let ret = Self::lookup_handle(ctx, handle, name, version)
            .and_then(|sym| Self::symbol_address(ctx, sym));
        ret.map_err(|e| self.record(e))
    }

    fn lookup_handle<'a>(
        ctx: &'a Context,
        handle: DlHandle,
        name: &str,
        version: Option<&str>,
    ) -> Result<RelocatedSymbol<'a>, RtldError> {
        let symname = SymbolName::new(name);
        let req = version.map(|v| VersionRequest::new(v, false));
        let req = req.as_ref();
        let caller = |addr| {
            ctx.module_at(addr)
                .map(|m| m.id())
                .ok_or(RtldErrorKind::NoModuleAt { addr })
        };
        let (found, scope) = match handle {
            DlHandle::Default => (ctx.lookup_default(&symname, req)?, "default scope".to_string()),
            DlHandle::Caller { addr } => {
                let id = caller(addr)?;
                (
                    ctx.lookup_in([id], &symname, req, LookupFlags::empty())?,
                    ctx.get_module(id)?.name.clone(),
                )
            }
            DlHandle::SelfAndLater { addr } | DlHandle::Next { addr } => {
                let id = caller(addr)?;
                let skip = usize::from(matches!(handle, DlHandle::Next { .. }));
                let later = ctx
                    .load_order
                    .iter()
                    .copied()
                    .skip_while(|&m| m != id)
                    .skip(skip);
                (
                    ctx.lookup_in(later, &symname, req, LookupFlags::empty())?,
                    ctx.get_module(id)?.name.clone(),
                )
            }
            DlHandle::Module(id) => {
                let module = ctx.get_module(id)?;
                let found = if module.is_main() {
                    ctx.lookup_default(&symname, req)?
                } else {
                    ctx.lookup_in(
                        ctx.deps_search_list(id),
                        &symname,
                        req,
                        LookupFlags::empty(),
                    )?
                };
                (found, module.name.clone())
            }
        };
        found.ok_or_else(|| {
            RtldErrorKind::SymbolLookupFail {
                symname: name.to_string(),
                sourcelib: scope,
            }
            .into()
        })
    }

    /// The address a program sees for a definition: TLS symbols live in the calling thread's
    /// block and indirect functions are resolved on the spot.
    fn symbol_address(ctx: &Context, sym: RelocatedSymbol<'_>) -> Result<usize, RtldError> {
        let value = sym.reloc_value() as usize;
        if sym.is_tls() {
            let lib = sym.module();
            let index = lib
                .and_then(|m| m.tls)
                .ok_or_else(|| RtldErrorKind::NoTLSInfo {
                    library: lib.map(|m| m.name.clone()).unwrap_or_default(),
                })?;
            return ctx.tls.get_addr(ctx.instance, index, value);
        }
        if sym.is_ifunc() {
            return Ok(unsafe { BACKEND.call0(value) });
        }
        Ok(value)
    }

    /// Bind PLT entry `index` of `handle` now, as the lazy binding trampoline does on the first
    /// call through it, and return the target.
    pub fn bind_plt(&self, handle: ModuleId, index: usize) -> Result<usize, RtldError> {
        let _guard = self.shared.lock.shared();
        let ctx = unsafe { self.shared.ctx() };
        ctx.bind_lazy(handle, index).map_err(|e| self.record(e))
    }

    /// Take the last recorded error message, clearing it.
    pub fn dlerror(&self) -> Option<String> {
        self.shared.last_error.lock().take()
    }

    /// Find the module containing `addr` and the nearest symbol at or below it.
    pub fn dladdr(&self, addr: usize) -> Result<DlInfo, RtldError> {
        let _guard = self.shared.lock.shared();
        let ctx = unsafe { self.shared.ctx() };
        let module = ctx
            .module_at(addr)
            .ok_or_else(|| self.record(RtldErrorKind::NoModuleAt { addr }.into()))?;
        let (sname, saddr) = match module.nearest_symbol(addr) {
            Some((name, value)) => (Some(name.to_string()), value),
            None => (None, 0),
        };
        Ok(DlInfo {
            fname: module.path.clone(),
            fbase: module.base_addr(),
            sname,
            saddr,
        })
    }

    pub fn dlinfo(&self, handle: ModuleId, request: DlInfoRequest) -> Result<DlInfoValue, RtldError> {
        let _guard = self.shared.lock.shared();
        let ctx = unsafe { self.shared.ctx() };
        let module = ctx.get_module(handle).map_err(|e| self.record(e))?;
        Ok(match request {
            DlInfoRequest::LinkMap => DlInfoValue::LinkMap(LinkMap {
                name: module.path.clone(),
                addr: module.bias(),
                dynamic: module.dynamic_addr(),
            }),
            DlInfoRequest::Origin => {
                DlInfoValue::Origin(module.origin().map(Path::to_path_buf).unwrap_or_default())
            }
            DlInfoRequest::SearchPaths => DlInfoValue::SearchPaths(ctx.paths.search_dirs(
                &Requester {
                    origin: module.origin(),
                    rpath: &module.rpath,
                    runpath: &module.runpath,
                },
            )),
            DlInfoRequest::TlsModId => DlInfoValue::TlsModId(module.tls.unwrap_or(0)),
            DlInfoRequest::TlsData => DlInfoValue::TlsData(
                module
                    .tls
                    .and_then(|index| ctx.tls.current_block(ctx.instance, index)),
            ),
            DlInfoRequest::RefCounts => DlInfoValue::RefCounts {
                refcount: module.refcount,
                opencount: module.opencount,
            },
        })
    }

    /// Call `f` once per module in load order until it returns non-zero, returning the last
    /// value it returned. The records are taken under the lock; `f` runs without it.
    pub fn dl_iterate_phdr(&self, mut f: impl FnMut(&PhdrInfo) -> i32) -> i32 {
        let records: Vec<_> = self.with_context(|ctx| {
            ctx.modules()
                .map(|m| PhdrInfo {
                    addr: m.bias(),
                    name: m.path.to_string_lossy().into_owned(),
                    phdr: m.phdr_addr().unwrap_or(0),
                    phnum: m.program_headers().len(),
                    adds: ctx.adds,
                    subs: ctx.subs,
                    tls_modid: m.tls.unwrap_or(0),
                    tls_data: m
                        .tls
                        .and_then(|index| ctx.tls.current_block(ctx.instance, index)),
                })
                .collect()
        });
        for rec in &records {
            let ret = f(rec);
            if ret != 0 {
                return ret;
            }
        }
        0
    }

    /// Address of `offset` in TLS module `index` for the calling thread.
    pub fn tls_get_addr(&self, index: usize, offset: usize) -> Result<usize, RtldError> {
        let _guard = self.shared.lock.shared();
        let ctx = unsafe { self.shared.ctx() };
        ctx.tls
            .get_addr(ctx.instance, index, offset)
            .map_err(|e| self.record(e))
    }

    /// Register one of the loader's entry points for modules to bind to.
    pub fn export_symbol(&self, name: &str, addr: usize) -> Result<(), RtldError> {
        let _guard = self.shared.lock.exclusive();
        let ctx = unsafe { self.shared.ctx_mut() };
        ctx.export_symbol(name, addr).map_err(|e| self.record(e))
    }

    /// Build a static TLS block for a new thread.
    pub fn allocate_thread_tls(&self) -> Result<StaticTlsBlock, RtldError> {
        self.with_context(|ctx| ctx.tls.allocate_static_block())
    }

    /// Tell the loader the calling thread runs with the static block at `thread_pointer`.
    pub fn thread_start(&self, thread_pointer: usize) {
        self.with_context(|ctx| ctx.tls.install_static(ctx.instance, thread_pointer))
    }

    /// Free the calling thread's dynamically allocated TLS blocks.
    pub fn thread_exit(&self) {
        let instance = self.with_context(|ctx| ctx.instance);
        free_thread(instance);
    }

    /// Map the program at `path` as the main module and prepare it the way startup does:
    /// preloads, dependencies, relocation, static TLS and initializers.
    pub fn load_program(&self, path: &Path) -> Result<BootInfo, RtldError> {
        let name = path.to_string_lossy().into_owned();
        self.startup(|ctx, batch| {
            ctx.load_object(
                batch,
                &name,
                None,
                LoadKind::Program,
                ModuleFlags::STARTUP,
            )
        })
    }

    /// Bring up a process around the main module `place` adds to the graph. On error the
    /// batch is rolled back.
    pub(crate) fn startup(
        &self,
        place: impl FnOnce(&mut Context, &mut Batch) -> Result<ModuleId, RtldError>,
    ) -> Result<BootInfo, RtldError> {
        let mut guard = self.shared.lock.exclusive();
        let (roots, ifuncs, info) = {
            let ctx = unsafe { self.shared.ctx_mut() };
            if ctx.main.is_some() {
                return Err(self.record(
                    RtldErrorKind::Internal {
                        what: "main program loaded twice".to_string(),
                    }
                    .into(),
                ));
            }
            let mut batch = ctx.begin_batch();
            match place(ctx, &mut batch).and_then(|main| Self::prepare(ctx, &mut batch, main)) {
                Ok(ret) => ret,
                Err(e) => {
                    error!("startup failed: {}", e);
                    ctx.rollback(batch);
                    return Err(self.record(e));
                }
            }
        };

        guard.with_downgraded(|| unsafe { resolve_ifuncs(&ifuncs) });
        let inits = self.take_initializers(&roots)?;
        unsafe { run_functions(&inits, "init") };
        drop(guard);
        debug!("startup done: entry {:x}", info.entry);
        Ok(info)
    }

    fn prepare(
        ctx: &mut Context,
        batch: &mut Batch,
        main: ModuleId,
    ) -> Result<(Vec<ModuleId>, Vec<PendingIfunc>, BootInfo), RtldError> {
        let mut roots = vec![];
        for name in ctx.config.preload.clone() {
            roots.push(ctx.load_object(
                batch,
                &name,
                Some(main),
                LoadKind::Library,
                ModuleFlags::STARTUP,
            )?);
        }
        roots.push(main);
        for &root in &roots {
            ctx.load_dependencies(batch, root)?;
        }
        RtldError::collect(
            RtldErrorKind::LibraryLoadFail {
                library: ctx.get_module(main)?.name.clone(),
            },
            batch.new.iter().map(|&id| ctx.check_versions(id)),
        )?;

        let bind_now = ctx.config.bind_now;
        let out = ctx.relocate_batch(&batch.new, bind_now)?;

        ctx.tls.freeze_static();
        let thread_pointer = ctx.tls.allocate_static_block()?.leak();
        ctx.tls.install_static(ctx.instance, thread_pointer);

        for &root in &roots {
            ctx.pin(root)?;
        }
        ctx.pin_flagged(&batch.new);
        ctx.get_module_mut(main)?.opencount += 1;
        let entry = ctx.get_module(main)?.entry();
        Ok((
            roots,
            out.ifuncs,
            BootInfo {
                entry,
                thread_pointer,
                args_consumed: 0,
            },
        ))
    }
}
