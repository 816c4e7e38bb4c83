//! The C entry points. Handles are module indices plus one; the pseudo-handles follow the usual
//! `<dlfcn.h>` values.

use std::{
    cell::RefCell,
    ffi::{c_char, c_int, c_void, CStr, CString},
};

use petgraph::stable_graph::NodeIndex;
use tracing::warn;

use crate::{
    api::{BootInfo, DlHandle, DlInfoRequest, DlInfoValue, DlopenMode, Rtld},
    boot::{boot, process_rtld},
    fatal,
    library::ModuleId,
    RtldErrorKind,
};

const RTLD_DEFAULT: isize = 0;
const RTLD_NEXT: isize = -1;
const RTLD_SELF: isize = -3;

const RTLD_DI_LINKMAP: c_int = 2;
const RTLD_DI_SERINFOSIZE: c_int = 5;
const RTLD_DI_ORIGIN: c_int = 6;
const RTLD_DI_TLS_MODID: c_int = 9;
const RTLD_DI_TLS_DATA: c_int = 10;

const SERINFO_HEADER: usize = 16;
const SERPATH_SIZE: usize = 16;

thread_local! {
    static ERROR_BUF: RefCell<Option<CString>> = const { RefCell::new(None) };
    static DLADDR_BUF: RefCell<(Option<CString>, Option<CString>)> = const { RefCell::new((None, None)) };
    static LINKMAP_BUF: RefCell<Option<(CString, LinkMapEntry)>> = const { RefCell::new(None) };
}

/// `struct link_map`.
#[derive(Debug)]
#[repr(C)]
pub struct LinkMapEntry {
    pub l_addr: usize,
    pub l_name: *const c_char,
    pub l_ld: *const c_void,
    pub l_next: *const LinkMapEntry,
    pub l_prev: *const LinkMapEntry,
}

/// The `tls_index` argument of `__tls_get_addr`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TlsIndex {
    pub module: usize,
    pub offset: usize,
}

fn rtld() -> &'static Rtld {
    match process_rtld() {
        Some(rtld) => rtld,
        None => fatal("dynamic loader used before startup"),
    }
}

fn to_handle(id: ModuleId) -> *mut c_void {
    (id.index() + 1) as *mut c_void
}

fn from_handle(handle: *mut c_void, caller: usize) -> DlHandle {
    match handle as isize {
        RTLD_DEFAULT => DlHandle::Default,
        RTLD_NEXT => DlHandle::Next { addr: caller },
        RTLD_SELF => DlHandle::SelfAndLater { addr: caller },
        n => DlHandle::Module(ModuleId(NodeIndex::new((n - 1) as usize))),
    }
}

fn module_handle(handle: *mut c_void) -> Option<ModuleId> {
    match from_handle(handle, 0) {
        DlHandle::Module(id) => Some(id),
        _ => None,
    }
}

/// Register the C entry points as the loader's exports.
pub(crate) fn register_exports(rtld: &Rtld) {
    let exports: [(&str, usize); 9] = [
        ("dlopen", dlopen as usize),
        ("dlclose", dlclose as usize),
        ("dlsym", dlsym as usize),
        ("dlvsym", dlvsym as usize),
        ("dlerror", dlerror as usize),
        ("dladdr", dladdr as usize),
        ("dlinfo", dlinfo as usize),
        ("dl_iterate_phdr", dl_iterate_phdr as usize),
        ("__tls_get_addr", __tls_get_addr as usize),
    ];
    for (name, addr) in exports {
        if let Err(e) = rtld.export_symbol(name, addr) {
            warn!("failed to export {}: {}", name, e);
        }
    }
}

#[no_mangle]
pub unsafe extern "C-unwind" fn rtld_boot(sp: *const usize, out: *mut BootInfo) {
    out.write(boot(sp));
}

#[no_mangle]
pub unsafe extern "C-unwind" fn dlopen(name: *const c_char, mode: c_int) -> *mut c_void {
    let rtld = rtld();
    let mode = match DlopenMode::from_raw(mode) {
        Ok(mode) => mode,
        Err(e) => {
            rtld.record(e);
            return core::ptr::null_mut();
        }
    };
    let name = if name.is_null() {
        None
    } else {
        Some(CStr::from_ptr(name).to_string_lossy().into_owned())
    };
    match rtld.dlopen(name.as_deref(), mode) {
        Ok(id) => to_handle(id),
        Err(_) => core::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C-unwind" fn dlclose(handle: *mut c_void) -> c_int {
    let Some(id) = module_handle(handle) else {
        return -1;
    };
    match rtld().dlclose(id) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

extern "C" {
    fn dlsym(handle: *mut c_void, name: *const c_char) -> *mut c_void;
    fn dlvsym(handle: *mut c_void, name: *const c_char, version: *const c_char) -> *mut c_void;
}

// dlsym and dlvsym need their caller's return address, which they pass on as an extra
// argument.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".globl dlsym",
    ".type dlsym,@function",
    "dlsym:",
    "mov rdx, qword ptr [rsp]",
    "jmp {dlsym}",
    ".size dlsym, . - dlsym",
    ".globl dlvsym",
    ".type dlvsym,@function",
    "dlvsym:",
    "mov rcx, qword ptr [rsp]",
    "jmp {dlvsym}",
    ".size dlvsym, . - dlvsym",
    dlsym = sym rtld_dlsym,
    dlvsym = sym rtld_dlvsym,
);

#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    ".globl dlsym",
    ".type dlsym,@function",
    "dlsym:",
    "mov x2, x30",
    "b {dlsym}",
    ".size dlsym, . - dlsym",
    ".globl dlvsym",
    ".type dlvsym,@function",
    "dlvsym:",
    "mov x3, x30",
    "b {dlvsym}",
    ".size dlvsym, . - dlvsym",
    dlsym = sym rtld_dlsym,
    dlvsym = sym rtld_dlvsym,
);

unsafe extern "C" fn rtld_dlsym(
    handle: *mut c_void,
    name: *const c_char,
    caller: usize,
) -> *mut c_void {
    let name = CStr::from_ptr(name).to_string_lossy();
    match rtld().dlsym(from_handle(handle, caller), &name) {
        Ok(addr) => addr as *mut c_void,
        Err(_) => core::ptr::null_mut(),
    }
}

unsafe extern "C" fn rtld_dlvsym(
    handle: *mut c_void,
    name: *const c_char,
    version: *const c_char,
    caller: usize,
) -> *mut c_void {
    let name = CStr::from_ptr(name).to_string_lossy();
    let version = CStr::from_ptr(version).to_string_lossy();
    match rtld().dlvsym(from_handle(handle, caller), &name, &version) {
        Ok(addr) => addr as *mut c_void,
        Err(_) => core::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C-unwind" fn dlerror() -> *const c_char {
    let msg = rtld()
        .dlerror()
        .and_then(|msg| CString::new(msg.replace('\0', " ")).ok());
    ERROR_BUF.with(|buf| {
        let mut buf = buf.borrow_mut();
        *buf = msg;
        buf.as_ref().map_or(core::ptr::null(), |s| s.as_ptr())
    })
}

#[no_mangle]
pub unsafe extern "C-unwind" fn dladdr(addr: *const c_void, info: *mut libc::Dl_info) -> c_int {
    let Ok(found) = rtld().dladdr(addr as usize) else {
        return 0;
    };
    let fname = CString::new(found.fname.to_string_lossy().into_owned()).ok();
    let sname = found.sname.and_then(|s| CString::new(s).ok());
    DLADDR_BUF.with(|buf| {
        let mut buf = buf.borrow_mut();
        *buf = (fname, sname);
        info.write(libc::Dl_info {
            dli_fname: buf.0.as_ref().map_or(core::ptr::null(), |s| s.as_ptr()),
            dli_fbase: found.fbase as *mut c_void,
            dli_sname: buf.1.as_ref().map_or(core::ptr::null(), |s| s.as_ptr()),
            dli_saddr: found.saddr as *mut c_void,
        });
    });
    1
}

#[no_mangle]
pub unsafe extern "C-unwind" fn dlinfo(handle: *mut c_void, request: c_int, out: *mut c_void) -> c_int {
    let rtld = rtld();
    let Some(id) = module_handle(handle) else {
        return -1;
    };
    let req = match request {
        RTLD_DI_LINKMAP => DlInfoRequest::LinkMap,
        RTLD_DI_ORIGIN => DlInfoRequest::Origin,
        RTLD_DI_SERINFOSIZE => DlInfoRequest::SearchPaths,
        RTLD_DI_TLS_MODID => DlInfoRequest::TlsModId,
        RTLD_DI_TLS_DATA => DlInfoRequest::TlsData,
        _ => {
            rtld.record(RtldErrorKind::UnsupportedRequest { request }.into());
            return -1;
        }
    };
    let Ok(value) = rtld.dlinfo(id, req) else {
        return -1;
    };
    match value {
        DlInfoValue::LinkMap(lm) => {
            let Ok(name) = CString::new(lm.name.to_string_lossy().into_owned()) else {
                return -1;
            };
            LINKMAP_BUF.with(|buf| {
                let mut buf = buf.borrow_mut();
                let entry = LinkMapEntry {
                    l_addr: lm.addr,
                    l_name: name.as_ptr(),
                    l_ld: lm.dynamic.unwrap_or(0) as *const c_void,
                    l_next: core::ptr::null(),
                    l_prev: core::ptr::null(),
                };
                let (_, entry) = buf.insert((name, entry));
                (out as *mut *const LinkMapEntry).write(entry as *const LinkMapEntry);
            });
        }
        DlInfoValue::Origin(origin) => {
            let bytes = origin.to_string_lossy();
            let len = bytes.len().min(libc::PATH_MAX as usize - 1);
            let dst = out as *mut u8;
            dst.copy_from_nonoverlapping(bytes.as_ptr(), len);
            dst.add(len).write(0);
        }
        DlInfoValue::SearchPaths(paths) => {
            // Dl_serinfo header, one Dl_serpath per directory, then the strings.
            let strings: usize = paths.iter().map(|p| p.len() + 1).sum();
            let out = out as *mut usize;
            out.write(SERINFO_HEADER + paths.len() * SERPATH_SIZE + strings);
            (out.add(1) as *mut u32).write(paths.len() as u32);
        }
        DlInfoValue::TlsModId(index) => (out as *mut usize).write(index),
        DlInfoValue::TlsData(data) => (out as *mut usize).write(data.unwrap_or(0)),
        DlInfoValue::RefCounts { .. } => return -1,
    }
    0
}

#[no_mangle]
pub unsafe extern "C-unwind" fn dl_iterate_phdr(
    cb: Option<
        unsafe extern "C-unwind" fn(
            info: *mut libc::dl_phdr_info,
            size: usize,
            data: *mut c_void,
        ) -> c_int,
    >,
    data: *mut c_void,
) -> c_int {
    let Some(cb) = cb else {
        return 0;
    };
    rtld().dl_iterate_phdr(|rec| {
        let name = CString::new(rec.name.clone()).unwrap_or_default();
        let mut info = libc::dl_phdr_info {
            dlpi_addr: rec.addr as _,
            dlpi_name: name.as_ptr(),
            dlpi_phdr: rec.phdr as *const _,
            dlpi_phnum: rec.phnum as _,
            dlpi_adds: rec.adds as _,
            dlpi_subs: rec.subs as _,
            dlpi_tls_modid: rec.tls_modid as _,
            dlpi_tls_data: rec.tls_data.unwrap_or(0) as *mut c_void,
        };
        cb(&mut info, core::mem::size_of::<libc::dl_phdr_info>(), data)
    })
}

#[no_mangle]
pub unsafe extern "C-unwind" fn __tls_get_addr(index: *const TlsIndex) -> *mut c_void {
    let index = *index;
    match rtld().tls_get_addr(index.module, index.offset) {
        Ok(addr) => addr as *mut c_void,
        Err(e) => crate::fatal_error(&e),
    }
}
