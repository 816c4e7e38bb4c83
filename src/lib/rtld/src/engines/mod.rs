//! System-specific mapping of object files. The loader describes what it wants mapped with
//! [LoadDirective]s; an engine turns them into a [Mapping].

pub mod mmap;

use std::{fs::File, io, path::Path, path::PathBuf};

use crate::RtldError;

/// System-specific implementation functions for the loader, mostly involving mapping objects.
pub trait MapEngine: Send + Sync {
    /// Open an object file for loading.
    fn open(&self, path: &Path) -> Result<ObjectFile, RtldError>;

    /// Map a file according to the given load directives. The directives' virtual addresses are
    /// link-time addresses; if `fixed` is set they are also the run-time addresses.
    fn map(
        &self,
        file: &ObjectFile,
        name: &str,
        directives: &[LoadDirective],
        fixed: bool,
    ) -> Result<Mapping, RtldError>;

    /// Change the protection of a mapped range.
    fn protect(&self, addr: usize, len: usize, flags: LoadFlags) -> io::Result<()>;

    /// The system page size.
    fn page_size(&self) -> usize;
}

/// An open object file.
#[derive(Debug)]
pub struct ObjectFile {
    pub file: File,
    pub path: PathBuf,
    pub id: FileId,
}

/// Device and inode of a file, used to notice the same object under two names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

/// A single load directive, matching closely with an ELF program header.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Ord, Eq, Hash, Default)]
pub struct LoadDirective {
    pub load_flags: LoadFlags,
    pub vaddr: usize,
    pub memsz: usize,
    pub offset: usize,
    pub align: usize,
    pub filesz: usize,
}

bitflags::bitflags! {
    /// Some flags for a load directive.
    #[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Ord, Eq, Hash, Default)]
    pub struct LoadFlags: u32 {
        /// This load directive specifies a data (writable) segment.
        const TARGETS_DATA = 1;
        /// The segment contains code.
        const EXEC = 2;
        /// The segment is readable.
        const READ = 4;
    }
}

impl LoadFlags {
    /// Translate ELF segment permission bits.
    pub fn from_phdr_flags(p_flags: u32) -> Self {
        let mut flags = LoadFlags::empty();
        if p_flags & elf::abi::PF_R != 0 {
            flags |= LoadFlags::READ;
        }
        if p_flags & elf::abi::PF_W != 0 {
            flags |= LoadFlags::TARGETS_DATA;
        }
        if p_flags & elf::abi::PF_X != 0 {
            flags |= LoadFlags::EXEC;
        }
        flags
    }

    pub(crate) fn prot(&self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(LoadFlags::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(LoadFlags::TARGETS_DATA) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(LoadFlags::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// The memory holding one module. Owned mappings are unmapped when dropped, which happens
/// exactly when the module leaves the object graph (or when loading it fails part way).
#[derive(Debug)]
pub struct Mapping {
    start: usize,
    len: usize,
    bias: usize,
    regions: Vec<(usize, usize)>,
    owned: bool,
}

impl Mapping {
    pub(crate) fn owned(start: usize, len: usize, bias: usize) -> Self {
        Self {
            start,
            len,
            bias,
            regions: vec![(start, len)],
            owned: true,
        }
    }

    /// A mapping someone else made (the main program, or the loader itself). Never unmapped.
    pub fn preexisting(start: usize, len: usize, bias: usize) -> Self {
        Self {
            start,
            len,
            bias,
            regions: vec![],
            owned: false,
        }
    }

    pub(crate) fn set_regions(&mut self, regions: Vec<(usize, usize)>) {
        self.regions = regions;
    }

    /// Lowest mapped address.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Length of the span from the lowest to the highest mapped address.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Load address minus link-time address.
    pub fn bias(&self) -> usize {
        self.bias
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr - self.start < self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        for (start, len) in self.regions.drain(..) {
            tracing::trace!("unmap {:x}..{:x}", start, start + len);
            unsafe { libc::munmap(start as *mut libc::c_void, len) };
        }
    }
}
