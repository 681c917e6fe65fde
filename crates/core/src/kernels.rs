use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{NnError, Result};

/// Kernel name to program source lookup, filled by scanning kernel files.
#[derive(Clone, Debug, Default)]
pub struct KernelRegistry {
    sources: HashMap<String, Arc<str>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every file listed in a newline-delimited manifest. Each line is
    /// a base filename relative to the manifest's directory; `suffix` is
    /// appended to it.
    pub fn from_manifest(path: impl AsRef<Path>, suffix: &str) -> Result<Self> {
        let path = path.as_ref();
        let manifest = fs::read_to_string(path).map_err(|e| {
            NnError::ResourceNotFound(format!("kernel manifest {}: {}", path.display(), e))
        })?;
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        let mut registry = Self::new();
        for line in manifest.lines() {
            let base = line.trim();
            if base.is_empty() {
                continue;
            }
            let file: PathBuf = dir.join(format!("{base}{suffix}"));
            registry.add_file(&file)?;
        }
        Ok(registry)
    }

    /// Scans one kernel file; returns how many kernels it defines.
    pub fn add_file(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|e| {
            NnError::ResourceNotFound(format!("kernel file {}: {}", path.display(), e))
        })?;
        let count = self.add_source(&source);
        debug!("registered {} kernels from {}", count, path.display());
        Ok(count)
    }

    /// Registers every kernel defined in `source` under its own name.
    pub fn add_source(&mut self, source: &str) -> usize {
        let shared: Arc<str> = Arc::from(source);
        let names = scan_kernel_names(source);
        for name in &names {
            if self.sources.insert(name.clone(), shared.clone()).is_some() {
                warn!("kernel `{}` registered twice, keeping the newest source", name);
            }
        }
        names.len()
    }

    pub fn source(&self, name: &str) -> Option<&str> {
        self.sources.get(name).map(|s| s.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Finds `kernel void <name>(` (or `__kernel void <name>(`) declarations.
pub fn scan_kernel_names(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut search = 0;

    while let Some(found) = source[search..].find("kernel") {
        let start = search + found;
        let end = start + "kernel".len();
        search = end;

        let before = source[..start].chars().next_back();
        let boundary_before = match before {
            None => true,
            Some('_') => source[..start].ends_with("__")
                && source[..start - 2].chars().next_back().map_or(true, |c| !is_ident(c)),
            Some(c) => !is_ident(c),
        };
        if !boundary_before {
            continue;
        }

        let rest = &source[end..];
        let trimmed = rest.trim_start();
        if trimmed.len() == rest.len() {
            continue;
        }
        let Some(after_void) = trimmed.strip_prefix("void") else {
            continue;
        };
        let ident_part = after_void.trim_start();
        if ident_part.len() == after_void.len() {
            continue;
        }
        let ident: String = ident_part.chars().take_while(|c| is_ident(*c)).collect();
        if ident.is_empty() {
            continue;
        }
        if ident_part[ident.len()..].trim_start().starts_with('(') {
            names.push(ident);
        }
    }
    names
}
