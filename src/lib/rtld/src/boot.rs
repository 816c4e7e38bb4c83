//! Process startup. The trampoline hands over the initial stack; we parse it, build the
//! process-wide loader instance, adopt the images the kernel mapped and prepare the main
//! program.

use std::{ffi::CStr, path::PathBuf, sync::OnceLock};

use tracing::{debug, warn};

use crate::{
    api::{BootInfo, Rtld},
    config::{init_logging, Config},
    fatal_error,
    library::{module_from_image, ModuleFlags, ModuleState},
    RtldError,
};

const AT_NULL: usize = 0;
const AT_PHDR: usize = 3;
const AT_PHENT: usize = 4;
const AT_PHNUM: usize = 5;
const AT_PAGESZ: usize = 6;
const AT_BASE: usize = 7;
const AT_ENTRY: usize = 9;
const AT_UID: usize = 11;
const AT_EUID: usize = 12;
const AT_GID: usize = 13;
const AT_EGID: usize = 14;
const AT_PLATFORM: usize = 15;
const AT_SECURE: usize = 23;
const AT_EXECFN: usize = 31;

/// The auxiliary vector entries the loader cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuxInfo {
    pub phdr: usize,
    pub phent: usize,
    pub phnum: usize,
    pub pagesz: usize,
    pub base: usize,
    pub entry: usize,
    pub uid: Option<usize>,
    pub euid: Option<usize>,
    pub gid: Option<usize>,
    pub egid: Option<usize>,
    pub secure: bool,
    pub platform: Option<String>,
    pub execfn: Option<String>,
}

/// Everything the kernel put on the initial stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupStack {
    pub argc: usize,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    pub aux: AuxInfo,
}

unsafe fn c_string(ptr: usize) -> Option<String> {
    if ptr == 0 {
        return None;
    }
    Some(
        CStr::from_ptr(ptr as *const libc::c_char)
            .to_string_lossy()
            .into_owned(),
    )
}

/// Read the initial process stack: `argc`, the `argv` and `envp` arrays and the auxiliary
/// vector.
///
/// # Safety
/// `sp` must point to a stack laid out the way the kernel lays it out at process entry.
pub unsafe fn parse_stack(sp: *const usize) -> StartupStack {
    let argc = *sp;
    let mut cur = sp.add(1);
    let mut argv = Vec::with_capacity(argc);
    for _ in 0..argc {
        argv.extend(c_string(*cur));
        cur = cur.add(1);
    }
    // Skip argv's terminating null.
    cur = cur.add(1);

    let mut envp = vec![];
    while *cur != 0 {
        envp.extend(c_string(*cur));
        cur = cur.add(1);
    }
    cur = cur.add(1);

    let mut aux = AuxInfo::default();
    loop {
        let (key, value) = (*cur, *cur.add(1));
        match key {
            AT_NULL => break,
            AT_PHDR => aux.phdr = value,
            AT_PHENT => aux.phent = value,
            AT_PHNUM => aux.phnum = value,
            AT_PAGESZ => aux.pagesz = value,
            AT_BASE => aux.base = value,
            AT_ENTRY => aux.entry = value,
            AT_UID => aux.uid = Some(value),
            AT_EUID => aux.euid = Some(value),
            AT_GID => aux.gid = Some(value),
            AT_EGID => aux.egid = Some(value),
            AT_SECURE => aux.secure = value != 0,
            AT_PLATFORM => aux.platform = c_string(value),
            AT_EXECFN => aux.execfn = c_string(value),
            _ => {}
        }
        cur = cur.add(2);
    }

    StartupStack {
        argc,
        argv,
        envp,
        aux,
    }
}

impl StartupStack {
    /// Whether the environment may steer the loader: not set-id, and not flagged secure.
    pub fn trusted(&self) -> bool {
        let aux = &self.aux;
        !aux.secure && aux.uid == aux.euid && aux.gid == aux.egid
    }

    /// The environment as `KEY=VALUE` pairs.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.envp.iter().filter_map(|e| e.split_once('='))
    }

    /// The configuration this process runs with.
    pub fn config(&self) -> Config {
        let mut config = Config::from_vars(self.env_pairs(), self.trusted());
        if let Some(platform) = &self.aux.platform {
            config.platform.platform = platform.clone();
        }
        config
    }
}

static PROCESS_RTLD: OnceLock<Rtld> = OnceLock::new();

/// The loader instance of this process, once startup has created it.
pub fn process_rtld() -> Option<&'static Rtld> {
    PROCESS_RTLD.get()
}

/// Run startup on the initial stack and return where to continue. Every failure is fatal.
///
/// # Safety
/// Must be called once, from the process entry trampoline, with the kernel's initial stack.
pub unsafe fn boot(sp: *const usize) -> BootInfo {
    let stack = parse_stack(sp);
    let config = stack.config();
    init_logging(config.debug);
    debug!(
        "boot: {} args, {} env vars, phdr {:x}, base {:x}",
        stack.argc,
        stack.envp.len(),
        stack.aux.phdr,
        stack.aux.base
    );
    let rtld = PROCESS_RTLD.get_or_init(|| Rtld::new(config));
    #[cfg(feature = "capi")]
    crate::capi::register_exports(rtld);
    match rtld.boot_from_stack(&stack) {
        Ok(info) => info,
        Err(e) => fatal_error(&e),
    }
}

/// Program header table of an ELF image mapped at `base`: (address, count).
unsafe fn image_phdrs(base: usize) -> (usize, usize) {
    let phoff = ((base + 32) as *const u64).read_unaligned() as usize;
    let phnum = ((base + 56) as *const u16).read_unaligned() as usize;
    (base + phoff, phnum)
}

impl Rtld {
    /// Startup proper. When the kernel ran the loader directly (no `AT_BASE`), the program is
    /// the first argument and is mapped here; otherwise the kernel already mapped it.
    ///
    /// # Safety
    /// The auxiliary vector must describe the images actually mapped in this process.
    pub(crate) unsafe fn boot_from_stack(&self, stack: &StartupStack) -> Result<BootInfo, RtldError> {
        let aux = &stack.aux;
        if aux.base == 0 {
            let Some(program) = stack.argv.get(1) else {
                crate::fatal("usage: rtld <program> [args...]");
            };
            debug!("boot: direct invocation of {}", program);
            let mut info = self.load_program(std::path::Path::new(program))?;
            info.args_consumed = 1;
            return Ok(info);
        }

        let (loader_phdr, loader_phnum) = image_phdrs(aux.base);
        let mut loader = module_from_image(
            "rtld",
            PathBuf::from("rtld"),
            loader_phdr,
            loader_phnum,
            0,
            Some(aux.base),
            ModuleFlags::LOADER,
        )?;
        loader.state = ModuleState::Relocated;

        let name = aux
            .execfn
            .clone()
            .or_else(|| stack.argv.first().cloned())
            .unwrap_or_default();
        if aux.phent != 0 && aux.phent != 56 {
            warn!("boot: unexpected program header size {}", aux.phent);
        }
        let main = module_from_image(
            &name,
            PathBuf::from(&name),
            aux.phdr,
            aux.phnum,
            aux.entry,
            None,
            ModuleFlags::MAIN | ModuleFlags::STARTUP,
        )?;
        self.startup(|ctx, batch| {
            ctx.insert(loader);
            ctx.adopt(batch, main)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use super::*;

    #[test]
    fn stack_parsing() {
        let args = [CString::new("/bin/prog").unwrap(), CString::new("-v").unwrap()];
        let env = [
            CString::new("LD_LIBRARY_PATH=/opt/lib").unwrap(),
            CString::new("HOME=/root").unwrap(),
        ];
        let platform = CString::new("x86_64").unwrap();
        let mut stack: Vec<usize> = vec![args.len()];
        stack.extend(args.iter().map(|a| a.as_ptr() as usize));
        stack.push(0);
        stack.extend(env.iter().map(|e| e.as_ptr() as usize));
        stack.push(0);
        stack.extend([
            AT_PHDR,
            0x40_0040,
            AT_PHNUM,
            9,
            AT_PAGESZ,
            4096,
            AT_UID,
            1000,
            AT_EUID,
            1000,
            AT_GID,
            100,
            AT_EGID,
            100,
            AT_PLATFORM,
            platform.as_ptr() as usize,
            AT_NULL,
            0,
        ]);

        let parsed = unsafe { parse_stack(stack.as_ptr()) };
        assert_eq!(parsed.argc, 2);
        assert_eq!(parsed.argv, vec!["/bin/prog", "-v"]);
        assert_eq!(parsed.envp.len(), 2);
        assert_eq!(parsed.aux.phdr, 0x40_0040);
        assert_eq!(parsed.aux.phnum, 9);
        assert_eq!(parsed.aux.pagesz, 4096);
        assert_eq!(parsed.aux.platform.as_deref(), Some("x86_64"));
        assert!(parsed.trusted());

        let config = parsed.config();
        assert_eq!(config.library_path, vec!["/opt/lib"]);
        assert_eq!(config.platform.platform, "x86_64");
    }

    #[test]
    fn setuid_is_untrusted() {
        let stack = StartupStack {
            envp: vec!["LD_PRELOAD=/tmp/evil.so".into()],
            aux: AuxInfo {
                uid: Some(1000),
                euid: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!stack.trusted());
        assert!(stack.config().preload.is_empty());

        let secure = StartupStack {
            aux: AuxInfo {
                secure: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!secure.trusted());
    }
}
