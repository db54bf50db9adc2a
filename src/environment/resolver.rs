use super::EnvironmentError;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Prints interpreter identity and import search path as one JSON object
const PROBE_SCRIPT: &str = "import json, sys; print(json.dumps({\
\"version\": sys.version, \"executable\": sys.executable, \"search_paths\": sys.path}))";

/// Identity of the interpreter whose packages are inspected
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct InterpreterInfo {
    /// Full version banner, e.g. `3.11.6 (main, ...) [GCC 13.2.0]`
    pub version: String,
    /// Absolute path of the interpreter binary
    pub executable: PathBuf,
    /// Import search path, in priority order
    pub search_paths: Vec<PathBuf>,
}

/// An installed distribution as described by its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    /// Version string as recorded, e.g. `2.1.0+cu118`
    pub version: String,
    /// Declared requirements, e.g. `basicsr>=1.4.2` or `tqdm; extra == "cli"`
    pub requires: Vec<String>,
}

/// Looks up installed packages
///
/// Enables checking against a fake environment in tests via `MockPackageResolver`.
#[cfg_attr(test, mockall::automock)]
pub trait PackageResolver {
    /// Interpreter the packages belong to
    fn interpreter(&self) -> &InterpreterInfo;

    /// Installed distribution called `name`, or `None` if not installed
    ///
    /// # Errors
    /// Returns error if the package metadata exists but cannot be read
    fn installed(&self, name: &str) -> Result<Option<InstalledPackage>, EnvironmentError>;
}

/// Resolves packages from the `.dist-info` / `.egg-info` metadata on an
/// interpreter's search path
#[derive(Debug)]
pub struct PythonResolver {
    info: InterpreterInfo,
    /// normalized name -> metadata path, first match on the search path wins
    index: HashMap<String, PathBuf>,
}

impl PythonResolver {
    /// Runs `interpreter` once to learn its version and search path, then
    /// indexes the installed distributions
    ///
    /// # Errors
    /// Returns error if the interpreter cannot be launched or its probe output is malformed
    pub fn probe(interpreter: &str) -> Result<Self, EnvironmentError> {
        tracing::debug!(interpreter, "probing interpreter");

        let output = Command::new(interpreter)
            .args(["-c", PROBE_SCRIPT])
            .output()
            .map_err(|source| EnvironmentError::Launch {
                interpreter: interpreter.to_owned(),
                source,
            })?;

        if !output.status.success() {
            return Err(EnvironmentError::Probe {
                interpreter: interpreter.to_owned(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let info: InterpreterInfo = serde_json::from_slice(&output.stdout).map_err(|e| {
            EnvironmentError::Probe {
                interpreter: interpreter.to_owned(),
                message: format!("unexpected probe output: {e}"),
            }
        })?;

        Ok(Self::from_info(info))
    }

    /// Indexes the distributions found on `info.search_paths`
    #[must_use]
    pub fn from_info(info: InterpreterInfo) -> Self {
        let mut index = HashMap::new();

        for dir in &info.search_paths {
            // Zip archives and stale entries are not directories
            let Ok(entries) = fs::read_dir(search_dir(dir)) else {
                continue;
            };

            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some((stem, metadata)) = metadata_location(&path, file_name) else {
                    continue;
                };
                let name = stem.split('-').next().unwrap_or(stem);
                index
                    .entry(normalize_name(name))
                    .or_insert(metadata);
            }
        }

        tracing::debug!(
            executable = %info.executable.display(),
            distributions = index.len(),
            "indexed installed distributions"
        );

        Self { info, index }
    }
}

impl PackageResolver for PythonResolver {
    fn interpreter(&self) -> &InterpreterInfo {
        &self.info
    }

    fn installed(&self, name: &str) -> Result<Option<InstalledPackage>, EnvironmentError> {
        let Some(metadata) = self.index.get(&normalize_name(name)) else {
            return Ok(None);
        };

        let contents = read_metadata(metadata)?.unwrap_or_default();
        let Some(version) =
            header_value(&contents, "Version").or_else(|| version_from_dir_name(metadata))
        else {
            return Ok(None);
        };

        let mut requires = header_values(&contents, "Requires-Dist");
        if metadata.ends_with("PKG-INFO") {
            if let Some(parent) = metadata.parent() {
                let requires_txt = parent.join("requires.txt");
                if let Some(listing) = read_metadata(&requires_txt)? {
                    requires.extend(unconditional_requires(&listing));
                }
            }
        }

        Ok(Some(InstalledPackage { version, requires }))
    }
}

/// Reads a metadata file; `None` only for an optional file that is absent
fn read_metadata(path: &Path) -> Result<Option<String>, EnvironmentError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound && path.ends_with("requires.txt") => Ok(None),
        Err(source) => Err(EnvironmentError::Metadata {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Lines of an egg `requires.txt` before the first `[extra]` section
fn unconditional_requires(listing: &str) -> impl Iterator<Item = String> + '_ {
    listing
        .lines()
        .map(str::trim)
        .take_while(|line| !line.starts_with('['))
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
}

/// Directory to scan for a search path entry; `""` is the working directory
fn search_dir(entry: &Path) -> &Path {
    if entry.as_os_str().is_empty() {
        Path::new(".")
    } else {
        entry
    }
}

/// Maps a search path entry to `(stem, metadata file)` if it describes a distribution
fn metadata_location<'a>(path: &Path, file_name: &'a str) -> Option<(&'a str, PathBuf)> {
    if let Some(stem) = file_name.strip_suffix(".dist-info") {
        return Some((stem, path.join("METADATA")));
    }
    let stem = file_name.strip_suffix(".egg-info")?;
    if path.is_dir() {
        Some((stem, path.join("PKG-INFO")))
    } else {
        Some((stem, path.to_path_buf()))
    }
}

/// First `Key: value` header of an email-style metadata file
fn header_value(contents: &str, key: &str) -> Option<String> {
    header_values(contents, key).into_iter().next()
}

/// Every `Key: value` header of an email-style metadata file, in order
fn header_values(contents: &str, key: &str) -> Vec<String> {
    contents
        .lines()
        .take_while(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim()
                .eq_ignore_ascii_case(key)
                .then(|| v.trim().to_owned())
        })
        .collect()
}

/// `Pillow-9.3.0.dist-info/METADATA` -> `9.3.0`
fn version_from_dir_name(metadata: &Path) -> Option<String> {
    let dir = if metadata.extension().is_some_and(|e| e == "egg-info") {
        metadata
    } else {
        metadata.parent()?
    };
    let name = dir.file_stem()?.to_str()?;
    let (_, rest) = name.split_once('-')?;
    let version = rest.split('-').next()?;
    Some(version.to_owned())
}

/// Canonical distribution name: lowercase, runs of `-`, `_`, `.` become one `-`
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            pending_sep = true;
        } else {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}
