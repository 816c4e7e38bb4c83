//! A runtime loader for ELF64 programs: maps a program's shared libraries, binds their symbol
//! references, runs their constructors, and keeps serving `dlopen` and friends afterwards.
//!
//! The job of the runtime loader is:
//!   1. Find and map dynamic shared objects (modules) and everything they need.
//!   2. Fix up the relocations inside those modules.
//!   3. Hand out thread-local storage.
//!   4. Run initializers in dependency order, and finalizers when modules go away.
//!
//! # The pipeline
//! Startup (see [boot]) parses the initial process stack and builds one [Rtld] for the process.
//! The main program, any preloaded libraries and all their `DT_NEEDED` dependencies are loaded
//! breadth first as one batch: the [path] resolver turns a name into a file (rpath, then
//! `LD_LIBRARY_PATH`, then runpath, then the hints file's directories, then the default
//! directories), the [engines] map the file's `PT_LOAD` segments, and the module is recorded in
//! the object graph of the [context]. The batch is then relocated dependencies first. Each
//! symbol reference is resolved against a scope ([symbol], [context]) and the result encoded by
//! the machine backend. Initializers run last.
//!
//! `dlopen` re-enters the same pipeline for one root at a time. Every module a failed `dlopen`
//! added is removed again before the error is returned.
//!
//! # Symbol scopes
//! A reference made by a module is looked up in order:
//!   1. The module itself, if it was linked with `-Bsymbolic`.
//!   2. Every module loaded at startup, in load order.
//!   3. Modules opened with `RTLD_GLOBAL`.
//!   4. The referencing module's own dependency tree, breadth first.
//!   5. The loader's own exported entry points.
//!
//! A weak definition found along the way is only used if no strong one follows.
//!
//! # Locking
//! All loader state sits behind one [lock::RtldLock]. Lookups take it shared; anything that
//! changes the object graph (and running initializers and finalizers) takes it exclusively.
//!
//! ## Error Handling
//! This crate reports errors with the [RtldError] type, which implements std::error::Error and
//! miette's Diagnostic. Failures during startup are fatal; failures through the `dl*` calls are
//! returned and remembered for [Rtld::dlerror].

// Nothing arch-specific should export directly.
pub(crate) mod arch;

mod error;
pub use error::*;

pub mod api;
pub mod boot;
#[cfg(feature = "capi")]
pub mod capi;
pub mod config;
pub mod context;
pub mod engines;
pub mod hints;
pub mod library;
pub mod lock;
pub mod path;
pub mod symbol;
pub mod tls;

pub use api::{
    BootInfo, DlHandle, DlInfo, DlInfoRequest, DlInfoValue, DlopenMode, LinkMap, PhdrInfo, Rtld,
};
pub use config::Config;
pub use library::{Module, ModuleFlags, ModuleId, ModuleState};
