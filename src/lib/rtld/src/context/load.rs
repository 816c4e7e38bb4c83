use std::collections::VecDeque;

use tracing::{debug, error, warn};

use super::Context;
use crate::{
    library::{load_module, LoadKind, Module, ModuleFlags, ModuleId},
    path::Requester,
    tls::TlsCheckpoint,
    RtldError, RtldErrorKind,
};

/// The modules one top-level operation (startup, or a `dlopen`) added, kept so a failure can be
/// undone.
#[derive(Debug)]
pub(crate) struct Batch {
    pub(crate) new: Vec<ModuleId>,
    tls: Vec<usize>,
    checkpoint: TlsCheckpoint,
    // Root whose DAG was referenced as part of this batch.
    pub(crate) referenced: Option<ModuleId>,
}

impl Context {
    /// Start a batch. Clears the path resolver's negative cache.
    pub(crate) fn begin_batch(&mut self) -> Batch {
        self.paths.begin_batch();
        Batch {
            new: vec![],
            tls: vec![],
            checkpoint: self.tls.checkpoint(),
            referenced: None,
        }
    }

    /// Find or load the module for `name`, as needed by `requester`. Newly loaded modules are
    /// recorded in `batch` and get `extra` flags.
    pub(crate) fn load_object(
        &mut self,
        batch: &mut Batch,
        name: &str,
        requester: Option<ModuleId>,
        kind: LoadKind,
        extra: ModuleFlags,
    ) -> Result<ModuleId, RtldError> {
        if !name.contains('/') {
            if let Some(id) = self.find_loaded(name) {
                return Ok(id);
            }
        }

        let path = {
            let Context { graph, paths, .. } = self;
            let req = requester
                .and_then(|r| graph.node_weight(r.0))
                .map(|m| Requester {
                    origin: m.origin(),
                    rpath: &m.rpath,
                    runpath: &m.runpath,
                })
                .unwrap_or_default();
            paths.resolve(name, &req)?
        };
        if let Some(id) = path.to_str().and_then(|p| self.find_loaded(p)) {
            return Ok(id);
        }

        let obj = self.engine.open(&path)?;
        if let Some(id) = self.find_by_file(obj.id) {
            debug!("{}: same file as {}", name, self.graph[id.0]);
            return Ok(id);
        }
        let mut module = load_module(self.engine.as_ref(), obj, name, kind)?;
        if let Some(id) = module.soname().and_then(|s| self.find_loaded(s)) {
            debug!("{}: soname already loaded as {}", name, self.graph[id.0]);
            return Ok(id);
        }
        module.flags |= extra;

        let id = self.insert(module);
        batch.new.push(id);
        self.register_tls(batch, id)?;
        Ok(id)
    }

    /// Add a module that is already mapped (the main program when the kernel loaded it) to the
    /// graph as part of `batch`.
    pub(crate) fn adopt(&mut self, batch: &mut Batch, module: Module) -> Result<ModuleId, RtldError> {
        let id = self.insert(module);
        batch.new.push(id);
        self.register_tls(batch, id)?;
        Ok(id)
    }

    /// Hand out a TLS module index, and a static offset if the module gets one.
    fn register_tls(&mut self, batch: &mut Batch, id: ModuleId) -> Result<(), RtldError> {
        let module = self.get_module(id)?;
        let Some((addr, filesz, memsz, align)) = module.tls_template() else {
            return Ok(());
        };
        let wants_static = module.flags.contains(ModuleFlags::STATIC_TLS);
        let library = module.name.clone();

        let index = self.tls.register(addr, filesz, memsz, align);
        batch.tls.push(index);
        self.get_module_mut(id)?.tls = Some(index);

        if !self.tls.is_frozen() {
            self.tls
                .allocate_offset(index)
                .ok_or(RtldErrorKind::OutOfMemory)?;
        } else if wants_static {
            // Threads that already exist cannot be given initialized data, only zeroes.
            if filesz > 0 {
                error!("{}: late static TLS with initialized data", library);
                return Err(RtldErrorKind::StaticTlsUnavailable { library }.into());
            }
            self.tls
                .allocate_offset(index)
                .ok_or(RtldErrorKind::StaticTlsUnavailable { library })?;
        }
        Ok(())
    }

    /// Load everything `root` needs, breadth first. Startup modules pass the flag on to their
    /// dependencies.
    pub(crate) fn load_dependencies(
        &mut self,
        batch: &mut Batch,
        root: ModuleId,
    ) -> Result<(), RtldError> {
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            let (library, extra, needed) = {
                let module = self.get_module(id)?;
                let needed = module
                    .deps
                    .iter()
                    .enumerate()
                    .filter(|(_, edge)| edge.resolved.is_none())
                    .map(|(i, edge)| {
                        module
                            .dep_name(edge)
                            .map(|n| (i, n.to_string()))
                            .ok_or_else(|| RtldErrorKind::DepEnumerationFail {
                                library: module.name.clone(),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                (
                    module.name.clone(),
                    module.flags & ModuleFlags::STARTUP,
                    needed,
                )
            };
            for (i, dep_name) in needed {
                let dep = self
                    .load_object(batch, &dep_name, Some(id), LoadKind::Library, extra)
                    .map_err(|e| {
                        RtldError::new_collect(
                            RtldErrorKind::LibraryLoadFail {
                                library: library.clone(),
                            },
                            vec![e],
                        )
                    })?;
                self.get_module_mut(id)?.deps[i].resolved = Some(dep);
                self.graph.update_edge(id.0, dep.0, ());
                if batch.new.contains(&dep) && !queue.contains(&dep) {
                    queue.push_back(dep);
                }
            }
        }
        Ok(())
    }

    /// Check that every version `id` requires is defined by the dependency it names.
    pub(crate) fn check_versions(&self, id: ModuleId) -> Result<(), RtldError> {
        let module = self.get_module(id)?;
        let per_file = module.versions.reqs_by_file().map(|(file, reqs)| {
            let Some(dep) = module
                .dependencies()
                .filter_map(|d| self.graph.node_weight(d.0))
                .find(|d| d.matches_name(file))
            else {
                warn!("{}: versions required from {}, which is not a dependency", module, file);
                return Ok(());
            };
            if dep.versions.defs.is_empty() {
                warn!("{}: no version information available", dep);
                return Ok(());
            }
            RtldError::collect(
                RtldErrorKind::VersionCheckFail {
                    library: module.name.clone(),
                },
                reqs.into_iter().map(|req| {
                    let defined = dep
                        .versions
                        .defs
                        .iter()
                        .any(|def| def.hash == req.hash && def.name == req.name);
                    if defined {
                        Ok(())
                    } else if req.is_weak() {
                        warn!("{}: weak version {} not found in {}", module, req.name, dep);
                        Ok(())
                    } else {
                        Err(RtldErrorKind::VersionNotFound {
                            version: req.name.clone(),
                            file: file.to_string(),
                            library: module.name.clone(),
                        }
                        .into())
                    }
                }),
            )
            .map(|_| ())
        });
        RtldError::collect(
            RtldErrorKind::VersionCheckFail {
                library: module.name.clone(),
            },
            per_file,
        )
        .map(|_| ())
    }

    /// Undo a failed batch: drop its references, unmap every module it added and give back
    /// their TLS.
    pub(crate) fn rollback(&mut self, batch: Batch) {
        if let Some(root) = batch.referenced {
            self.unref_dag(root);
        }
        for &id in batch.new.iter().rev() {
            if let Some(module) = self.remove(id) {
                debug!("rollback: unloading {}", module);
            }
        }
        self.tls.rollback(batch.checkpoint, &batch.tls);
    }
}
