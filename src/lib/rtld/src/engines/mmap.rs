//! The default engine: plain `mmap`, `mprotect` and `munmap`.

use std::{
    fs::File,
    io,
    os::{fd::AsRawFd, unix::fs::MetadataExt},
    path::Path,
};

use tracing::{debug, trace};

use super::{FileId, LoadDirective, LoadFlags, MapEngine, Mapping, ObjectFile};
use crate::{RtldError, RtldErrorKind};

#[derive(Debug, Default, Clone, Copy)]
pub struct MmapEngine;

fn round_down(x: usize, page: usize) -> usize {
    x & !(page - 1)
}

fn round_up(x: usize, page: usize) -> usize {
    (x + page - 1) & !(page - 1)
}

impl MmapEngine {
    fn map_fail(name: &str) -> RtldError {
        RtldErrorKind::MapFail {
            library: name.to_string(),
            err: io::Error::last_os_error(),
        }
        .into()
    }

    unsafe fn map_one(
        &self,
        file: &ObjectFile,
        name: &str,
        bias: usize,
        dir: &LoadDirective,
    ) -> Result<(usize, usize), RtldError> {
        let page = self.page_size();
        let seg_start = bias + dir.vaddr;
        let page_start = round_down(seg_start, page);
        let seg_end = round_up(seg_start + dir.memsz, page);
        let file_end = seg_start + dir.filesz;
        let prot = dir.load_flags.prot();
        let needs_zero = dir.memsz > dir.filesz;

        if dir.offset % page != dir.vaddr % page {
            return Err(RtldErrorKind::MapFail {
                library: name.to_string(),
                err: io::Error::new(io::ErrorKind::InvalidData, "misaligned segment"),
            }
            .into());
        }

        let anon_start = if dir.filesz > 0 {
            // Map it writable for now if we need to clear the tail of the last file page.
            let map_prot = if needs_zero {
                prot | libc::PROT_WRITE
            } else {
                prot
            };
            let len = round_up(file_end, page) - page_start;
            let addr = libc::mmap(
                page_start as *mut libc::c_void,
                len,
                map_prot,
                libc::MAP_PRIVATE | libc::MAP_FIXED,
                file.file.as_raw_fd(),
                round_down(dir.offset, page) as libc::off_t,
            );
            if addr == libc::MAP_FAILED {
                return Err(Self::map_fail(name));
            }
            if needs_zero {
                let zero_end = round_up(file_end, page).min(seg_start + dir.memsz);
                if zero_end > file_end {
                    core::ptr::write_bytes(file_end as *mut u8, 0, zero_end - file_end);
                }
                if map_prot != prot {
                    self.protect(page_start, len, dir.load_flags)
                        .map_err(|err| RtldErrorKind::ProtectFail {
                            library: name.to_string(),
                            err,
                        })?;
                }
            }
            round_up(file_end, page)
        } else {
            page_start
        };

        if seg_end > anon_start {
            // The rest of the BSS.
            let addr = libc::mmap(
                anon_start as *mut libc::c_void,
                seg_end - anon_start,
                prot,
                libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if addr == libc::MAP_FAILED {
                return Err(Self::map_fail(name));
            }
        }
        trace!(
            "{}: mapped segment {:x}..{:x} (file to {:x}, prot {:?})",
            name,
            page_start,
            seg_end,
            file_end,
            dir.load_flags
        );
        Ok((page_start, seg_end - page_start))
    }
}

impl MapEngine for MmapEngine {
    fn open(&self, path: &Path) -> Result<ObjectFile, RtldError> {
        let open_fail = |err| RtldErrorKind::OpenFail {
            path: path.to_path_buf(),
            err,
        };
        let file = File::open(path).map_err(open_fail)?;
        let meta = file.metadata().map_err(open_fail)?;
        if !meta.is_file() {
            return Err(open_fail(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            ))
            .into());
        }
        Ok(ObjectFile {
            file,
            path: path.to_path_buf(),
            id: FileId {
                dev: meta.dev(),
                ino: meta.ino(),
            },
        })
    }

    fn map(
        &self,
        file: &ObjectFile,
        name: &str,
        directives: &[LoadDirective],
        fixed: bool,
    ) -> Result<Mapping, RtldError> {
        let page = self.page_size();
        let lo = directives
            .iter()
            .map(|d| round_down(d.vaddr, page))
            .min()
            .unwrap_or_default();
        let hi = directives
            .iter()
            .map(|d| round_up(d.vaddr + d.memsz, page))
            .max()
            .unwrap_or_default();
        let span = hi - lo;
        if span == 0 {
            return Err(RtldErrorKind::SegmentCount {
                library: name.to_string(),
                count: 0,
            }
            .into());
        }

        // Reserve the whole range first, so the segments land in one contiguous region.
        let hint = if fixed { lo } else { 0 };
        let reserve = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                span,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reserve == libc::MAP_FAILED {
            return Err(Self::map_fail(name));
        }
        let base = reserve as usize;
        let bias = base - lo;
        let mut mapping = Mapping::owned(base, span, bias);
        if fixed && base != lo {
            // Dropping the mapping releases the reservation.
            return Err(RtldErrorKind::MapFail {
                library: name.to_string(),
                err: io::Error::new(io::ErrorKind::AddrInUse, "fixed address unavailable"),
            }
            .into());
        }

        let mut regions = directives
            .iter()
            .map(|dir| unsafe { self.map_one(file, name, bias, dir) })
            .collect::<Result<Vec<_>, _>>()?;
        regions.sort();

        // Give back the holes between segments.
        let mut cursor = base;
        let mut kept = Vec::with_capacity(regions.len());
        for (start, len) in regions {
            if start > cursor {
                unsafe { libc::munmap(cursor as *mut libc::c_void, start - cursor) };
            }
            cursor = cursor.max(start + len);
            kept.push((start, len));
        }
        mapping.set_regions(kept);

        debug!(
            "{}: mapped {} at {:x} (bias {:x})",
            name,
            humansize::format_size(span, humansize::BINARY),
            base,
            bias
        );
        Ok(mapping)
    }

    fn protect(&self, addr: usize, len: usize, flags: LoadFlags) -> io::Result<()> {
        let page = self.page_size();
        let start = round_down(addr, page);
        let len = round_up(addr + len, page) - start;
        let ret = unsafe { libc::mprotect(start as *mut libc::c_void, len, flags.prot()) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz <= 0 {
            4096
        } else {
            sz as usize
        }
    }
}
