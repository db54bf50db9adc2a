/// Installed package lookup
pub mod resolver;
/// Version parsing and specifier matching
pub mod version;

pub use resolver::{
    normalize_name, InstalledPackage, InterpreterInfo, PackageResolver, PythonResolver,
};
pub use version::{Version, VersionError, VersionSpec};

use crate::config::Requirement;
use std::collections::{HashSet, VecDeque};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that abort the dependency check
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// The interpreter binary could not be started
    #[error("failed to launch interpreter {interpreter}: {source}")]
    Launch {
        /// Interpreter command
        interpreter: String,
        /// Underlying error
        source: io::Error,
    },

    /// The interpreter ran but did not describe itself
    #[error("interpreter {interpreter} probe failed: {message}")]
    Probe {
        /// Interpreter command
        interpreter: String,
        /// Stderr or parse failure
        message: String,
    },

    /// Package metadata exists but is unreadable
    #[error("failed to read package metadata {}: {source}", path.display())]
    Metadata {
        /// Metadata file
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// A requirement carries a malformed constraint
    #[error(transparent)]
    Version(#[from] VersionError),

    /// Writing the report failed
    #[error("failed to write report: {0}")]
    Output(#[from] io::Error),
}

/// Outcome of checking every requirement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyReport {
    /// Packages that are not installed at all, in requirement order
    pub missing: Vec<String>,
    /// Packages installed at a version outside their constraint
    pub conflicts: Vec<String>,
}

impl DependencyReport {
    /// Only absent packages make the environment unhealthy
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.missing.is_empty()
    }

    /// Process exit status: 0 when healthy, 1 otherwise
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        u8::from(!self.is_healthy())
    }
}

/// Resolves each requirement together with everything it transitively
/// requires, collecting absent packages and warning about outdated ones on `out`
///
/// A requirement whose dependency tree lacks a package is reported missing
/// under its own name; an outdated package anywhere in the tree produces a
/// conflict warning for the requirement.
///
/// # Errors
/// Returns error on a malformed constraint, unreadable metadata or a failed write
pub fn check_dependencies<W: Write>(
    requirements: &[Requirement],
    resolver: &dyn PackageResolver,
    out: &mut W,
) -> Result<DependencyReport, EnvironmentError> {
    let mut report = DependencyReport::default();

    for requirement in requirements {
        let spec: VersionSpec = requirement.version.parse()?;

        match first_unmet(&requirement.name, spec, resolver)? {
            None => {
                tracing::debug!(
                    package = %requirement.name,
                    constraint = %requirement.version,
                    "requirement satisfied"
                );
            }
            Some(Unmet::Missing(dependency)) => {
                tracing::info!(
                    package = %requirement.name,
                    %dependency,
                    "package not installed"
                );
                report.missing.push(requirement.name.clone());
            }
            Some(Unmet::Conflict { dependency, installed }) => {
                tracing::warn!(
                    package = %requirement.name,
                    %dependency,
                    %installed,
                    "version conflict"
                );
                writeln!(out, "Warning: {} version conflict", requirement.name)?;
                report.conflicts.push(requirement.name.clone());
            }
        }
    }

    Ok(report)
}

/// First package in a requirement's tree that is absent or outdated
#[derive(Debug, PartialEq, Eq)]
enum Unmet {
    Missing(String),
    Conflict { dependency: String, installed: String },
}

/// Walks the requirement tree breadth-first from `name`
///
/// Requirements guarded by an environment marker or extra are not followed.
fn first_unmet(
    name: &str,
    spec: VersionSpec,
    resolver: &dyn PackageResolver,
) -> Result<Option<Unmet>, EnvironmentError> {
    let mut queue = VecDeque::from([(name.to_owned(), spec)]);
    let mut expanded = HashSet::new();

    while let Some((name, spec)) = queue.pop_front() {
        let Some(package) = resolver.installed(&name)? else {
            return Ok(Some(Unmet::Missing(name)));
        };

        // An unparsable installed version cannot satisfy any constraint
        let satisfied = package
            .version
            .parse::<Version>()
            .is_ok_and(|version| spec.matches(&version));
        if !satisfied {
            return Ok(Some(Unmet::Conflict {
                dependency: name,
                installed: package.version,
            }));
        }

        if !expanded.insert(normalize_name(&name)) {
            continue;
        }
        for entry in &package.requires {
            let Some((dependency, constraint)) = split_requirement(entry) else {
                continue;
            };
            match constraint.parse::<VersionSpec>() {
                Ok(spec) => queue.push_back((dependency.to_owned(), spec)),
                Err(e) => {
                    tracing::debug!(package = %name, %entry, error = %e, "skipping requirement");
                }
            }
        }
    }

    Ok(None)
}

/// `basicsr (>=1.4.2)` / `torch[cuda]>=2.0` -> `(name, constraint)`
///
/// Returns `None` for conditional requirements (anything after `;`).
fn split_requirement(entry: &str) -> Option<(&str, &str)> {
    if entry.contains(';') {
        return None;
    }
    let entry = entry.trim();
    let name_len = entry
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(entry.len());
    let (name, rest) = entry.split_at(name_len);
    if name.is_empty() {
        return None;
    }

    let mut rest = rest.trim_start();
    if let Some(extras) = rest.strip_prefix('[') {
        rest = extras.split_once(']').map_or("", |(_, after)| after).trim_start();
    }
    // Direct URL references carry no version constraint
    if rest.starts_with('@') {
        return Some((name, ""));
    }

    let constraint = rest.trim_start_matches('(').trim_end_matches(')').trim();
    Some((name, constraint))
}

/// Prints the interpreter identity, checks `requirements` and prints the verdict
///
/// # Errors
/// Propagates [`check_dependencies`] failures
pub fn run<W: Write>(
    requirements: &[Requirement],
    resolver: &dyn PackageResolver,
    script_dir: &Path,
    out: &mut W,
) -> Result<DependencyReport, EnvironmentError> {
    let info = resolver.interpreter();
    writeln!(out, "Python version: {}", info.version)?;
    writeln!(out, "Python executable: {}", info.executable.display())?;
    writeln!(out, "Script directory: {}", script_dir.display())?;

    let report = check_dependencies(requirements, resolver, out)?;

    if report.is_healthy() {
        writeln!(out, "All required packages are installed")?;
    } else {
        writeln!(out, "Missing packages: {}", report.missing.join(", "))?;
    }
    out.flush()?;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_requirements;
    use super::resolver::MockPackageResolver;
    use std::collections::HashMap;

    fn interpreter() -> InterpreterInfo {
        InterpreterInfo {
            version: "3.11.6 (main) [GCC 13.2.0]".to_owned(),
            executable: PathBuf::from("/usr/bin/python3"),
            search_paths: Vec::new(),
        }
    }

    fn package(version: &str, requires: &[&str]) -> InstalledPackage {
        InstalledPackage {
            version: version.to_owned(),
            requires: requires.iter().map(|r| (*r).to_owned()).collect(),
        }
    }

    fn resolver_from(packages: HashMap<String, InstalledPackage>) -> MockPackageResolver {
        let mut resolver = MockPackageResolver::new();
        resolver.expect_interpreter().return_const(interpreter());
        resolver
            .expect_installed()
            .returning(move |name| Ok(packages.get(name).cloned()));
        resolver
    }

    fn resolver_with(installed: &[(&str, &str)]) -> MockPackageResolver {
        resolver_from(
            installed
                .iter()
                .map(|(name, version)| ((*name).to_owned(), package(version, &[])))
                .collect(),
        )
    }

    fn all_satisfied() -> Vec<(&'static str, &'static str)> {
        vec![
            ("torch", "2.1.0+cu118"),
            ("basicsr", "1.4.2"),
            ("facexlib", "0.3.0"),
            ("gfpgan", "1.3.8"),
            ("numpy", "1.26.4"),
            ("opencv-python", "4.9.0.80"),
            ("Pillow", "10.2.0"),
            ("realesrgan", "0.3.0"),
        ]
    }

    #[test]
    fn test_empty_environment_reports_everything_missing() {
        let resolver = resolver_with(&[]);
        let mut out = Vec::new();

        let report = check_dependencies(&default_requirements(), &resolver, &mut out).unwrap();

        let expected: Vec<String> = default_requirements().into_iter().map(|r| r.name).collect();
        assert_eq!(report.missing, expected);
        assert_eq!(report.exit_code(), 1);
        assert!(out.is_empty());
    }

    #[test]
    fn test_all_installed_is_healthy() {
        let resolver = resolver_with(&all_satisfied());
        let mut out = Vec::new();

        let report = check_dependencies(&default_requirements(), &resolver, &mut out).unwrap();

        assert!(report.missing.is_empty());
        assert!(report.conflicts.is_empty());
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_outdated_package_warns_but_is_not_missing() {
        let mut installed = all_satisfied();
        installed[4] = ("numpy", "1.21.0");
        let resolver = resolver_with(&installed);
        let mut out = Vec::new();

        let report = check_dependencies(&default_requirements(), &resolver, &mut out).unwrap();

        assert!(report.missing.is_empty());
        assert_eq!(report.conflicts, vec!["numpy".to_owned()]);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Warning: numpy version conflict\n"
        );
    }

    #[test]
    fn test_unparsable_installed_version_is_a_conflict() {
        let resolver = resolver_with(&[("torch", "nightly")]);
        let requirements = vec![Requirement::new("torch", ">=1.7.0")];
        let mut out = Vec::new();

        let report = check_dependencies(&requirements, &resolver, &mut out).unwrap();

        assert_eq!(report.conflicts, vec!["torch".to_owned()]);
        assert!(report.missing.is_empty());
    }

    #[test]
    fn test_malformed_constraint_aborts() {
        let resolver = MockPackageResolver::new();
        let requirements = vec![Requirement::new("torch", "1.7.0")];
        let mut out = Vec::new();

        let result = check_dependencies(&requirements, &resolver, &mut out);

        assert!(matches!(result, Err(EnvironmentError::Version(_))));
    }

    #[test]
    fn test_resolver_error_propagates() {
        let mut resolver = MockPackageResolver::new();
        resolver
            .expect_installed()
            .times(1)
            .returning(|_| {
                Err(EnvironmentError::Metadata {
                    path: PathBuf::from("/site/torch-2.1.0.dist-info/METADATA"),
                    source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
                })
            });
        let requirements = vec![
            Requirement::new("torch", ">=1.7.0"),
            Requirement::new("numpy", ">=1.23.5"),
        ];
        let mut out = Vec::new();

        let result = check_dependencies(&requirements, &resolver, &mut out);

        assert!(matches!(result, Err(EnvironmentError::Metadata { .. })));
    }

    #[test]
    fn test_missing_dependency_marks_requirement_missing() {
        let resolver = resolver_from(HashMap::from([(
            "realesrgan".to_owned(),
            package("0.3.0", &["basicsr>=1.4.2", "numpy"]),
        )]));
        let requirements = vec![Requirement::new("realesrgan", ">=0.3.0")];
        let mut out = Vec::new();

        let report = check_dependencies(&requirements, &resolver, &mut out).unwrap();

        assert_eq!(report.missing, vec!["realesrgan".to_owned()]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_outdated_dependency_warns_for_requirement() {
        let resolver = resolver_from(HashMap::from([
            (
                "gfpgan".to_owned(),
                package("1.3.8", &["basicsr (>=1.4.2)", "facexlib>=0.2.5"]),
            ),
            ("basicsr".to_owned(), package("1.3.0", &[])),
            ("facexlib".to_owned(), package("0.3.0", &[])),
        ]));
        let requirements = vec![Requirement::new("gfpgan", ">=1.3.5")];
        let mut out = Vec::new();

        let report = check_dependencies(&requirements, &resolver, &mut out).unwrap();

        assert!(report.missing.is_empty());
        assert_eq!(report.conflicts, vec!["gfpgan".to_owned()]);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Warning: gfpgan version conflict\n"
        );
    }

    #[test]
    fn test_conditional_requirements_are_not_followed() {
        let resolver = resolver_from(HashMap::from([(
            "basicsr".to_owned(),
            package(
                "1.4.2",
                &["tb-nightly ; python_version < \"3.7\"", "pytest; extra == \"test\""],
            ),
        )]));
        let requirements = vec![Requirement::new("basicsr", ">=1.4.2")];
        let mut out = Vec::new();

        let report = check_dependencies(&requirements, &resolver, &mut out).unwrap();

        assert!(report.is_healthy());
        assert!(report.conflicts.is_empty());
    }

    #[test]
    fn test_dependency_cycle_terminates() {
        let resolver = resolver_from(HashMap::from([
            ("facexlib".to_owned(), package("0.3.0", &["filterpy"])),
            ("filterpy".to_owned(), package("1.4.5", &["facexlib"])),
        ]));
        let requirements = vec![Requirement::new("facexlib", ">=0.2.5")];
        let mut out = Vec::new();

        let report = check_dependencies(&requirements, &resolver, &mut out).unwrap();

        assert!(report.is_healthy());
    }

    #[test]
    fn test_split_requirement() {
        assert_eq!(split_requirement("numpy"), Some(("numpy", "")));
        assert_eq!(
            split_requirement("basicsr (>=1.4.2)"),
            Some(("basicsr", ">=1.4.2"))
        );
        assert_eq!(
            split_requirement("torch[cuda] >=1.7,<3"),
            Some(("torch", ">=1.7,<3"))
        );
        assert_eq!(
            split_requirement("pkg @ https://example.org/pkg.whl"),
            Some(("pkg", ""))
        );
        assert_eq!(split_requirement("pytest; extra == \"test\""), None);
        assert_eq!(split_requirement(">=1.0"), None);
    }

    #[test]
    fn test_run_prints_missing_list() {
        let resolver = resolver_with(&[("torch", "2.1.0"), ("numpy", "1.26.4")]);
        let mut out = Vec::new();

        let report = run(
            &default_requirements(),
            &resolver,
            Path::new("/opt/runner"),
            &mut out,
        )
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Python version: 3.11.6 (main) [GCC 13.2.0]");
        assert_eq!(lines[1], "Python executable: /usr/bin/python3");
        assert_eq!(lines[2], "Script directory: /opt/runner");
        assert_eq!(
            lines[3],
            "Missing packages: basicsr, facexlib, gfpgan, opencv-python, Pillow, realesrgan"
        );
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_run_prints_success() {
        let resolver = resolver_with(&all_satisfied());
        let mut out = Vec::new();

        let report = run(
            &default_requirements(),
            &resolver,
            Path::new("/opt/runner"),
            &mut out,
        )
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("All required packages are installed\n"));
        assert_eq!(report.exit_code(), 0);
    }
}
