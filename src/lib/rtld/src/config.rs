//! Loader configuration: environment variables, search path defaults and platform strings.

use std::path::PathBuf;

use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Directories searched after everything else.
pub const DEFAULT_PATHS: &[&str] = &["/lib64", "/usr/lib64", "/lib", "/usr/lib"];

/// Where the hints file lives unless told otherwise.
pub const DEFAULT_HINTS_PATH: &str = "/etc/ld.so.hints.conf";

/// Values for the `$OSNAME`, `$OSREL` and `$PLATFORM` path tokens.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlatformInfo {
    pub osname: String,
    pub osrel: String,
    pub platform: String,
}

impl PlatformInfo {
    /// Ask the kernel.
    pub fn from_uname() -> Self {
        let mut uts: libc::utsname = unsafe { core::mem::zeroed() };
        if unsafe { libc::uname(&mut uts) } != 0 {
            return Self::default();
        }
        let field = |f: &[libc::c_char]| {
            let bytes: Vec<u8> = f
                .iter()
                .take_while(|&&c| c != 0)
                .map(|&c| c as u8)
                .collect();
            String::from_utf8_lossy(&bytes).into_owned()
        };
        Self {
            osname: field(&uts.sysname),
            osrel: field(&uts.release),
            platform: field(&uts.machine),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Whether the process may be steered by its environment. Set-id processes are not.
    pub trusted: bool,
    /// `LD_LIBRARY_PATH`.
    pub library_path: Vec<String>,
    /// `LD_PRELOAD`.
    pub preload: Vec<String>,
    /// `LD_BIND_NOW`.
    pub bind_now: bool,
    /// `LD_DEBUG`.
    pub debug: bool,
    pub hints_path: PathBuf,
    pub default_paths: Vec<String>,
    pub platform: PlatformInfo,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trusted: true,
            library_path: vec![],
            preload: vec![],
            bind_now: false,
            debug: false,
            hints_path: PathBuf::from(DEFAULT_HINTS_PATH),
            default_paths: DEFAULT_PATHS.iter().map(|s| s.to_string()).collect(),
            platform: PlatformInfo::from_uname(),
        }
    }
}

fn split_list(value: &str, seps: &[char]) -> Vec<String> {
    value
        .split(seps)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Build a configuration from `KEY=VALUE` pairs. Untrusted processes ignore every `LD_*`
    /// variable.
    pub fn from_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>, trusted: bool) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Config {
            trusted,
            ..Default::default()
        };
        if !trusted {
            return config;
        }
        for (key, value) in vars {
            let value = value.as_ref();
            match key.as_ref() {
                "LD_LIBRARY_PATH" => config.library_path = split_list(value, &[':', ';']),
                "LD_PRELOAD" => config.preload = split_list(value, &[':', ' ', '\t']),
                "LD_BIND_NOW" => config.bind_now = !value.is_empty(),
                "LD_DEBUG" => config.debug = !value.is_empty(),
                "LD_HINTS_PATH" => config.hints_path = PathBuf::from(value),
                _ => {}
            }
        }
        config
    }

    /// The configuration for the running process, from `std::env`.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars(), process_is_trusted())
    }
}

/// A process is trusted unless it runs with different real and effective ids.
pub fn process_is_trusted() -> bool {
    unsafe { libc::getuid() == libc::geteuid() && libc::getgid() == libc::getegid() }
}

/// Install the loader's log subscriber on standard error.
pub fn init_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        warn!("log subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_reads_ld_vars() {
        let vars = [
            ("LD_LIBRARY_PATH", "/opt/a::/opt/b"),
            ("LD_PRELOAD", "liba.so libb.so:libc2.so"),
            ("LD_BIND_NOW", "1"),
            ("HOME", "/root"),
        ];
        let config = Config::from_vars(vars, true);
        assert_eq!(config.library_path, vec!["/opt/a", "/opt/b"]);
        assert_eq!(config.preload, vec!["liba.so", "libb.so", "libc2.so"]);
        assert!(config.bind_now);
        assert!(!config.debug);
        assert_eq!(config.hints_path, PathBuf::from(DEFAULT_HINTS_PATH));
    }

    #[test]
    fn untrusted_ignores_ld_vars() {
        let vars = [("LD_LIBRARY_PATH", "/tmp/evil"), ("LD_DEBUG", "1")];
        let config = Config::from_vars(vars, false);
        assert!(!config.trusted);
        assert!(config.library_path.is_empty());
        assert!(!config.debug);
    }

    #[test]
    fn empty_bind_now_is_off() {
        let config = Config::from_vars([("LD_BIND_NOW", "")], true);
        assert!(!config.bind_now);
    }
}
