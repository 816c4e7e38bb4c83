//! Turning a library name into a path we can open.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use tracing::{debug, trace, warn};

use crate::{
    config::{Config, PlatformInfo},
    hints::{Hints, SysctlQuery, SystemSysctl},
    RtldError, RtldErrorKind,
};

/// What the module asking for a library contributes to the search.
#[derive(Debug, Clone, Copy, Default)]
pub struct Requester<'a> {
    /// Directory of the requesting module, for `$ORIGIN`.
    pub origin: Option<&'a Path>,
    pub rpath: &'a [String],
    pub runpath: &'a [String],
}

pub struct PathResolver {
    trusted: bool,
    library_path: Vec<String>,
    default_paths: Vec<String>,
    hints: Hints,
    platform: PlatformInfo,
    sysctl: Box<dyn SysctlQuery>,
    // Candidate paths already proven not to exist during this batch.
    negative: HashSet<PathBuf>,
}

impl std::fmt::Debug for PathResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathResolver")
            .field("trusted", &self.trusted)
            .field("library_path", &self.library_path)
            .field("default_paths", &self.default_paths)
            .field("hints", &self.hints)
            .finish()
    }
}

impl PathResolver {
    pub fn new(config: &Config, hints: Hints, sysctl: Box<dyn SysctlQuery>) -> Self {
        Self {
            trusted: config.trusted,
            library_path: config.library_path.clone(),
            default_paths: config.default_paths.clone(),
            hints,
            platform: config.platform.clone(),
            sysctl,
            negative: HashSet::new(),
        }
    }

    /// A resolver reading the configured hints file and asking the running system.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config,
            Hints::load(&config.hints_path),
            Box::new(SystemSysctl::new(config.platform.clone())),
        )
    }

    /// Forget the negative cache. Called at the start of each top-level batch.
    pub fn begin_batch(&mut self) {
        self.negative.clear();
    }

    /// Expand `$ORIGIN`, `$OSNAME`, `$OSREL` and `$PLATFORM` (bare or in braces). Returns `None`
    /// if the element uses an unknown token, or `$ORIGIN` where it is not allowed or not known.
    pub fn expand_tokens(&self, elem: &str, origin: Option<&Path>) -> Option<String> {
        let mut out = String::with_capacity(elem.len());
        let mut rest = elem;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            rest = &rest[pos + 1..];
            let (token, after) = match rest.strip_prefix('{') {
                Some(inner) => {
                    let end = inner.find('}')?;
                    (&inner[..end], &inner[end + 1..])
                }
                None => {
                    let end = rest
                        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                        .unwrap_or(rest.len());
                    (&rest[..end], &rest[end..])
                }
            };
            match token {
                "ORIGIN" => {
                    if !self.trusted {
                        warn!("$ORIGIN not allowed in untrusted process: {}", elem);
                        return None;
                    }
                    out.push_str(origin?.to_str()?);
                }
                "OSNAME" => out.push_str(&self.platform.osname),
                "OSREL" => out.push_str(&self.platform.osrel),
                "PLATFORM" => out.push_str(&self.platform.platform),
                _ => {
                    warn!("unknown token ${} in {}", token, elem);
                    return None;
                }
            }
            rest = after;
        }
        out.push_str(rest);
        Some(out)
    }

    /// The directories searched for a bare name, in order.
    pub fn search_dirs(&self, req: &Requester<'_>) -> Vec<String> {
        let mut raw: Vec<&str> = vec![];
        // DT_RPATH is ignored when DT_RUNPATH is present.
        if req.runpath.is_empty() {
            raw.extend(req.rpath.iter().map(String::as_str));
        }
        if self.trusted {
            raw.extend(self.library_path.iter().map(String::as_str));
        }
        raw.extend(req.runpath.iter().map(String::as_str));
        raw.extend(self.hints.dirs.iter().map(String::as_str));
        raw.extend(self.default_paths.iter().map(String::as_str));
        raw.into_iter()
            .filter_map(|dir| self.expand_tokens(dir, req.origin))
            .collect()
    }

    fn probe(&mut self, path: PathBuf) -> Option<PathBuf> {
        if self.negative.contains(&path) {
            trace!("skip {} (known missing)", path.display());
            return None;
        }
        if std::fs::metadata(&path).is_ok_and(|m| m.is_file()) {
            return Some(path);
        }
        trace!("miss {}", path.display());
        self.negative.insert(path);
        None
    }

    /// Find a file for `name`.
    pub fn resolve(&mut self, name: &str, req: &Requester<'_>) -> Result<PathBuf, RtldError> {
        let candidates = self.hints.candidates(name, self.sysctl.as_ref());
        for cand in &candidates {
            if cand.contains('/') {
                if !self.trusted && !cand.starts_with('/') {
                    warn!("relative path {} not allowed in untrusted process", cand);
                    continue;
                }
                let Some(expanded) = self.expand_tokens(cand, req.origin) else {
                    continue;
                };
                if let Some(found) = self.probe(PathBuf::from(expanded)) {
                    debug!("resolved {} => {}", name, found.display());
                    return Ok(found);
                }
                continue;
            }
            for dir in self.search_dirs(req) {
                if let Some(found) = self.probe(Path::new(&dir).join(cand)) {
                    debug!("resolved {} => {}", name, found.display());
                    return Ok(found);
                }
            }
        }
        Err(RtldErrorKind::NotFound {
            name: name.to_string(),
        }
        .into())
    }
}
