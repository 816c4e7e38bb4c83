//! The hints file: extra search directories, and per-library substitutions chosen by asking the
//! system about itself.
//!
//! ```text
//! # comment
//! /opt/vendor/lib
//! libm.so.6 hw.cpu.avx2 1:libm-avx2.so.6 *:libm.so.6
//! libgfx.so hw.machine x86_64,amd64:libgfx-x86.so,libgfx-generic.so
//! ```
//!
//! A rule line is a library name, a system-configuration key, then groups of
//! `value[,value...]:lib[,lib...]`. The first group whose values contain the key's answer (or
//! `*`) supplies the libraries to try, in order, before the original name.

use std::path::Path;

use tracing::{debug, warn};

use crate::config::PlatformInfo;

/// Answers system-configuration queries for hint rules.
pub trait SysctlQuery: Send + Sync {
    fn query(&self, key: &str) -> Option<String>;
}

/// Answers from `uname` and CPU feature detection.
#[derive(Debug, Clone)]
pub struct SystemSysctl {
    platform: PlatformInfo,
}

impl SystemSysctl {
    pub fn new(platform: PlatformInfo) -> Self {
        Self { platform }
    }
}

#[cfg(target_arch = "x86_64")]
fn cpu_feature(name: &str) -> Option<bool> {
    Some(match name {
        "sse3" => std::is_x86_feature_detected!("sse3"),
        "ssse3" => std::is_x86_feature_detected!("ssse3"),
        "sse4.1" => std::is_x86_feature_detected!("sse4.1"),
        "sse4.2" => std::is_x86_feature_detected!("sse4.2"),
        "popcnt" => std::is_x86_feature_detected!("popcnt"),
        "aes" => std::is_x86_feature_detected!("aes"),
        "avx" => std::is_x86_feature_detected!("avx"),
        "avx2" => std::is_x86_feature_detected!("avx2"),
        "avx512f" => std::is_x86_feature_detected!("avx512f"),
        "bmi1" => std::is_x86_feature_detected!("bmi1"),
        "bmi2" => std::is_x86_feature_detected!("bmi2"),
        "fma" => std::is_x86_feature_detected!("fma"),
        _ => return None,
    })
}

#[cfg(target_arch = "aarch64")]
fn cpu_feature(name: &str) -> Option<bool> {
    Some(match name {
        "neon" => std::arch::is_aarch64_feature_detected!("neon"),
        "aes" => std::arch::is_aarch64_feature_detected!("aes"),
        "sha2" => std::arch::is_aarch64_feature_detected!("sha2"),
        "crc" => std::arch::is_aarch64_feature_detected!("crc"),
        "lse" => std::arch::is_aarch64_feature_detected!("lse"),
        "sve" => std::arch::is_aarch64_feature_detected!("sve"),
        _ => return None,
    })
}

impl SysctlQuery for SystemSysctl {
    fn query(&self, key: &str) -> Option<String> {
        match key {
            "hw.machine" => Some(self.platform.platform.clone()),
            "kern.ostype" => Some(self.platform.osname.clone()),
            "kern.osrelease" => Some(self.platform.osrel.clone()),
            _ => {
                let feature = key.strip_prefix("hw.cpu.")?;
                cpu_feature(feature).map(|on| if on { "1" } else { "0" }.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintGroup {
    pub values: Vec<String>,
    pub libs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintRule {
    pub name: String,
    pub key: String,
    pub groups: Vec<HintGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hints {
    /// Extra search directories, searched after `DT_RUNPATH` and before the defaults.
    pub dirs: Vec<String>,
    pub rules: Vec<HintRule>,
}

fn parse_group(word: &str) -> Option<HintGroup> {
    let (values, libs) = word.split_once(':')?;
    let split = |s: &str| -> Vec<String> {
        s.split(',')
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    };
    let group = HintGroup {
        values: split(values),
        libs: split(libs),
    };
    if group.values.is_empty() || group.libs.is_empty() {
        return None;
    }
    Some(group)
}

impl Hints {
    pub fn parse(text: &str) -> Self {
        let mut hints = Hints::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = match line.split_once('#') {
                Some((before, _)) => before,
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('/') {
                hints.dirs.push(line.to_string());
                continue;
            }
            let mut words = line.split_whitespace();
            let (Some(name), Some(key)) = (words.next(), words.next()) else {
                warn!("hints line {}: expected a name and a key", lineno + 1);
                continue;
            };
            let groups: Option<Vec<_>> = words.map(parse_group).collect();
            match groups {
                Some(groups) if !groups.is_empty() => hints.rules.push(HintRule {
                    name: name.to_string(),
                    key: key.to_string(),
                    groups,
                }),
                _ => warn!("hints line {}: malformed substitution groups", lineno + 1),
            }
        }
        hints
    }

    /// Read the hints file. A missing file is the same as an empty one.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let hints = Self::parse(&text);
                debug!(
                    "hints: {} dirs, {} rules from {}",
                    hints.dirs.len(),
                    hints.rules.len(),
                    path.display()
                );
                hints
            }
            Err(e) => {
                debug!("hints: not using {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Names to try for `name`, in order: the substitutions picked by the first matching rule,
    /// then `name` itself.
    pub fn candidates(&self, name: &str, sysctl: &dyn SysctlQuery) -> Vec<String> {
        let mut out = vec![];
        if let Some(rule) = self.rules.iter().find(|r| r.name == name) {
            let answer = sysctl.query(&rule.key);
            let group = rule.groups.iter().find(|g| {
                g.values
                    .iter()
                    .any(|v| v == "*" || Some(v.as_str()) == answer.as_deref())
            });
            if let Some(group) = group {
                debug!(
                    "hints: {} = {:?} selects {:?} for {}",
                    rule.key, answer, group.libs, name
                );
                out.extend(group.libs.iter().filter(|l| *l != name).cloned());
            }
        }
        out.push(name.to_string());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static [(&'static str, &'static str)]);

    impl SysctlQuery for Fixed {
        fn query(&self, key: &str) -> Option<String> {
            self.0
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    const TEXT: &str = "\
# vendor overrides
/opt/vendor/lib   # trailing comment

libm.so.6 hw.cpu.avx2 1:libm-avx2.so.6 *:libm.so.6
libgfx.so hw.machine x86_64,amd64:libgfx-x86.so,libgfx-generic.so
broken.so
bad.so hw.machine nocolon
";

    #[test]
    fn parses_dirs_and_rules() {
        let hints = Hints::parse(TEXT);
        assert_eq!(hints.dirs, vec!["/opt/vendor/lib"]);
        assert_eq!(hints.rules.len(), 2);
        assert_eq!(hints.rules[1].key, "hw.machine");
        assert_eq!(
            hints.rules[1].groups[0],
            HintGroup {
                values: vec!["x86_64".into(), "amd64".into()],
                libs: vec!["libgfx-x86.so".into(), "libgfx-generic.so".into()],
            }
        );
    }

    #[test]
    fn substitution_follows_the_answer() {
        let hints = Hints::parse(TEXT);
        let with_avx2 = Fixed(&[("hw.cpu.avx2", "1"), ("hw.machine", "amd64")]);
        assert_eq!(
            hints.candidates("libm.so.6", &with_avx2),
            vec!["libm-avx2.so.6", "libm.so.6"]
        );
        assert_eq!(
            hints.candidates("libgfx.so", &with_avx2),
            vec!["libgfx-x86.so", "libgfx-generic.so", "libgfx.so"]
        );

        // The wildcard group catches everything else; the original name is not repeated.
        let without = Fixed(&[("hw.cpu.avx2", "0"), ("hw.machine", "riscv64")]);
        assert_eq!(hints.candidates("libm.so.6", &without), vec!["libm.so.6"]);
        assert_eq!(hints.candidates("libgfx.so", &without), vec!["libgfx.so"]);
        assert_eq!(hints.candidates("libz.so", &without), vec!["libz.so"]);
    }

    #[test]
    fn missing_file_is_empty() {
        let hints = Hints::load(Path::new("/nonexistent/ld.so.hints.conf"));
        assert_eq!(hints, Hints::default());
    }

    #[test]
    fn system_answers() {
        let sys = SystemSysctl::new(PlatformInfo {
            osname: "Linux".into(),
            osrel: "6.1".into(),
            platform: "x86_64".into(),
        });
        assert_eq!(sys.query("kern.ostype").as_deref(), Some("Linux"));
        assert_eq!(sys.query("hw.machine").as_deref(), Some("x86_64"));
        assert_eq!(sys.query("hw.cpu.no-such-feature"), None);
        assert_eq!(sys.query("vm.whatever"), None);
    }
}
