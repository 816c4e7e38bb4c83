//! Definitions for errors for the runtime loader.
use std::path::PathBuf;

use elf::file::Class;
use itertools::{Either, Itertools};
use miette::Diagnostic;
use thiserror::Error;

use crate::library::ModuleId;

#[derive(Debug, Error, Diagnostic)]
#[error("{kind}")]
pub struct RtldError {
    pub kind: RtldErrorKind,
    #[related]
    pub related: Vec<RtldError>,
}

impl RtldError {
    pub fn new_collect(kind: RtldErrorKind, related: Vec<RtldError>) -> Self {
        Self { kind, related }
    }

    pub fn new(kind: RtldErrorKind) -> Self {
        Self {
            kind,
            related: vec![],
        }
    }

    pub fn collect<I, T>(parent_kind: RtldErrorKind, it: I) -> Result<Vec<T>, RtldError>
    where
        I: IntoIterator<Item = Result<T, RtldError>>,
    {
        // Collect errors and values, and then if there any errors, build a new error from them.
        let (vals, errs): (Vec<T>, Vec<RtldError>) =
            it.into_iter().partition_map(|item| match item {
                Ok(o) => Either::Left(o),
                Err(e) => Either::Right(e),
            });

        if errs.is_empty() {
            Ok(vals)
        } else {
            Err(RtldError {
                kind: parent_kind,
                related: errs,
            })
        }
    }

    /// The severity class of the outermost error.
    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    /// Render this error and everything related to it as a single line of text, as reported
    /// through `dlerror`.
    pub fn message(&self) -> String {
        let mut msg = self.kind.to_string();
        for rel in &self.related {
            msg.push_str(": ");
            msg.push_str(&rel.message());
        }
        msg
    }
}

impl From<RtldErrorKind> for RtldError {
    fn from(value: RtldErrorKind) -> Self {
        Self {
            kind: value,
            related: vec![],
        }
    }
}

impl From<elf::ParseError> for RtldError {
    fn from(value: elf::ParseError) -> Self {
        Self {
            kind: RtldErrorKind::ParseError { err: value },
            related: vec![],
        }
    }
}

impl From<HeaderError> for RtldError {
    fn from(value: HeaderError) -> Self {
        RtldErrorKind::InvalidELFHeader { hdr_err: value }.into()
    }
}

/// How bad an error is. Everything but [ErrorClass::Protocol] can be returned to a `dlopen` or
/// `dlsym` caller; during startup every class is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The object file is not something we can load.
    Format,
    /// A symbol, version or library could not be found, or was ambiguous.
    Resolution,
    /// A relocation could not be applied.
    Relocation,
    /// We ran out of address space or memory.
    Resource,
    /// The loader's own locking or bookkeeping was violated.
    Protocol,
}

#[derive(Debug, Error, Diagnostic)]
pub enum RtldErrorKind {
    #[error("failed to load library {library}")]
    LibraryLoadFail { library: String },
    #[error("library not found: {name}")]
    NotFound { name: String },
    #[error("{name}: not already loaded")]
    NotResident { name: String },
    #[error("{library}: cannot be opened at run time")]
    NoOpen { library: String },
    #[error("failed to open {}: {err}", path.display())]
    OpenFail {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("undefined symbol '{symname}' referenced by '{sourcelib}'")]
    SymbolLookupFail { symname: String, sourcelib: String },
    #[error("symbol '{symname}' is ambiguous in '{library}' ({count} versioned definitions)")]
    AmbiguousSymbol {
        symname: String,
        library: String,
        count: usize,
    },
    #[error("version '{version}' required by '{library}' not found in '{file}'")]
    VersionNotFound {
        version: String,
        file: String,
        library: String,
    },
    #[error("version requirements of '{library}' not satisfied")]
    VersionCheckFail { library: String },
    #[error("parse failed: {err}")]
    ParseError {
        #[from]
        err: elf::ParseError,
    },
    #[error("invalid ELF header: {hdr_err}")]
    InvalidELFHeader {
        #[source]
        #[diagnostic_source]
        hdr_err: HeaderError,
    },
    #[error("dynamic object '{library}' is missing a required segment or section '{name}'")]
    MissingSection { library: String, name: String },
    #[error("'{library}' has {count} loadable segments")]
    SegmentCount { library: String, count: usize },
    #[error("failed to enumerate dependencies for {library}")]
    DepEnumerationFail { library: String },
    #[error("library {library} had no TLS data for request")]
    NoTLSInfo { library: String },
    #[error("library {library} needs static TLS with initialized data after startup")]
    StaticTlsUnavailable { library: String },
    #[error("library {library} requested relocation that is unsupported: {reloc}")]
    UnsupportedReloc { library: String, reloc: String },
    #[error("copy relocation for '{symname}' in library '{library}'")]
    CopyRelocInLibrary { symname: String, library: String },
    #[error("failed to process relocation section '{secname}' for library '{library}'")]
    RelocationSectionFail { secname: String, library: String },
    #[error("library '{library}' failed to relocate")]
    RelocationFail { library: String },
    #[error("failed to map '{library}': {err}")]
    MapFail {
        library: String,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to change protection in '{library}': {err}")]
    ProtectFail {
        library: String,
        #[source]
        err: std::io::Error,
    },
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid library handle '{id}'")]
    InvalidHandle { id: ModuleId },
    #[error("no module contains address {addr:#x}")]
    NoModuleAt { addr: usize },
    #[error("'{name}' is not an exportable loader symbol")]
    NotExportable { name: String },
    #[error("invalid mode for dlopen: {mode:#x}")]
    InvalidMode { mode: i32 },
    #[error("unsupported dlinfo request {request}")]
    UnsupportedRequest { request: i32 },
    #[error("loader lock re-entered for exclusive access by its owner")]
    ReentrantExclusive,
    #[error("internal error: {what}")]
    Internal { what: String },
}

impl RtldErrorKind {
    pub fn class(&self) -> ErrorClass {
        match self {
            RtldErrorKind::ParseError { .. }
            | RtldErrorKind::InvalidELFHeader { .. }
            | RtldErrorKind::MissingSection { .. }
            | RtldErrorKind::SegmentCount { .. }
            | RtldErrorKind::NoOpen { .. }
            | RtldErrorKind::LibraryLoadFail { .. }
            | RtldErrorKind::DepEnumerationFail { .. } => ErrorClass::Format,
            RtldErrorKind::NotFound { .. }
            | RtldErrorKind::NotResident { .. }
            | RtldErrorKind::OpenFail { .. }
            | RtldErrorKind::SymbolLookupFail { .. }
            | RtldErrorKind::AmbiguousSymbol { .. }
            | RtldErrorKind::VersionNotFound { .. }
            | RtldErrorKind::VersionCheckFail { .. }
            | RtldErrorKind::InvalidHandle { .. }
            | RtldErrorKind::NoModuleAt { .. }
            | RtldErrorKind::NotExportable { .. }
            | RtldErrorKind::InvalidMode { .. }
            | RtldErrorKind::UnsupportedRequest { .. } => ErrorClass::Resolution,
            RtldErrorKind::NoTLSInfo { .. }
            | RtldErrorKind::StaticTlsUnavailable { .. }
            | RtldErrorKind::UnsupportedReloc { .. }
            | RtldErrorKind::CopyRelocInLibrary { .. }
            | RtldErrorKind::RelocationSectionFail { .. }
            | RtldErrorKind::RelocationFail { .. }
            | RtldErrorKind::ProtectFail { .. } => ErrorClass::Relocation,
            RtldErrorKind::MapFail { .. } | RtldErrorKind::OutOfMemory => ErrorClass::Resource,
            RtldErrorKind::ReentrantExclusive | RtldErrorKind::Internal { .. } => {
                ErrorClass::Protocol
            }
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum HeaderError {
    #[error("bad magic: {got:02x?}")]
    BadMagic { got: [u8; 4] },
    #[error("class mismatch: expected {expect:?}, got {got:?}")]
    ClassMismatch { expect: Class, got: Class },
    #[error("data encoding mismatch: got {got}")]
    EncodingMismatch { got: u8 },
    #[error("ELF version mismatch: expected {expect}, got {got}")]
    VersionMismatch { expect: u32, got: u32 },
    #[error("ELF type mismatch: expected {expect}, got {got}")]
    ELFTypeMismatch { expect: u16, got: u16 },
    #[error("machine mismatch: expected {expect}, got {got}")]
    MachineMismatch { expect: u16, got: u16 },
    #[error("unexpected program header entry size {got}")]
    PhentsizeMismatch { got: u16 },
}

/// Print a message and terminate the process. Used for errors that cannot be unwound: anything
/// during startup, a lazy binding that cannot be resolved, and protocol violations.
pub fn fatal(msg: impl std::fmt::Display) -> ! {
    eprintln!("rtld: fatal: {}", msg);
    unsafe { libc::_exit(127) }
}

/// Render a full error report (including related errors) and terminate.
pub fn fatal_error(err: &RtldError) -> ! {
    let mut report = String::new();
    if miette::NarratableReportHandler::new()
        .with_cause_chain()
        .render_report(&mut report, err)
        .is_err()
    {
        report = err.message();
    }
    fatal(report.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_keeps_values_when_all_ok() {
        let vals = RtldError::collect(
            RtldErrorKind::RelocationFail {
                library: "libfoo.so".into(),
            },
            vec![Ok(1), Ok(2)],
        )
        .unwrap();
        assert_eq!(vals, vec![1, 2]);
    }

    #[test]
    fn collect_gathers_every_failure() {
        let err = RtldError::collect::<_, u32>(
            RtldErrorKind::RelocationFail {
                library: "libfoo.so".into(),
            },
            vec![
                Ok(1),
                Err(RtldErrorKind::OutOfMemory.into()),
                Err(RtldErrorKind::NotFound {
                    name: "libbar.so".into(),
                }
                .into()),
            ],
        )
        .unwrap_err();
        assert_eq!(err.related.len(), 2);
        assert_eq!(err.class(), ErrorClass::Relocation);
        let msg = err.message();
        assert!(msg.starts_with("library 'libfoo.so' failed to relocate"));
        assert!(msg.contains("library not found: libbar.so"));
    }

    #[test]
    fn classes() {
        assert_eq!(
            RtldErrorKind::ReentrantExclusive.class(),
            ErrorClass::Protocol
        );
        assert_eq!(RtldErrorKind::OutOfMemory.class(), ErrorClass::Resource);
        let hdr: RtldError = HeaderError::MachineMismatch { expect: 62, got: 3 }.into();
        assert_eq!(hdr.class(), ErrorClass::Format);
    }
}
