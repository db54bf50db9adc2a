//! Package versions and version specifiers
//!
//! Covers the subset of the Python packaging rules that installed
//! distributions actually use: numeric release segments, an optional epoch,
//! pre/post/dev markers and a discarded local label (`+cu118`).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from parsing versions or specifiers
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    /// The version string has no numeric release
    #[error("invalid version: {0:?}")]
    InvalidVersion(String),

    /// A specifier clause has no recognised operator or a bad operand
    #[error("invalid version specifier: {0:?}")]
    InvalidSpecifier(String),
}

/// Release stage, ordered dev < alpha < beta < rc < final < post
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Dev(u64),
    Alpha(u64),
    Beta(u64),
    Rc(u64),
    Final,
    Post(u64),
}

/// A parsed package version
#[derive(Debug, Clone)]
pub struct Version {
    epoch: u64,
    release: Vec<u64>,
    stage: Stage,
    text: String,
}

impl Version {
    fn cmp_release(&self, other: &Self) -> Ordering {
        let len = self.release.len().max(other.release.len());
        (0..len)
            .map(|i| {
                let a = self.release.get(i).copied().unwrap_or(0);
                let b = other.release.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// True if the leading release segments equal `prefix`
    fn has_release_prefix(&self, prefix: &[u64]) -> bool {
        prefix
            .iter()
            .enumerate()
            .all(|(i, seg)| self.release.get(i).copied().unwrap_or(0) == *seg)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| self.cmp_release(other))
            .then_with(|| self.stage.cmp(&other.stage))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidVersion(s.to_owned());
        let text = s.trim();
        let lowered = text.to_ascii_lowercase();
        let public = lowered.split('+').next().unwrap_or_default();
        let public = public.strip_prefix('v').unwrap_or(public);

        let (epoch, rest) = match public.split_once('!') {
            Some((epoch, rest)) => (epoch.parse().map_err(|_| invalid())?, rest),
            None => (0, public),
        };

        let release_end = release_len(rest);
        if release_end == 0 {
            return Err(invalid());
        }
        let release = rest[..release_end]
            .split('.')
            .map(str::parse)
            .collect::<Result<Vec<u64>, _>>()
            .map_err(|_| invalid())?;

        let stage = parse_stage(&rest[release_end..]).ok_or_else(invalid)?;

        Ok(Self {
            epoch,
            release,
            stage,
            text: text.to_owned(),
        })
    }
}

/// Length of the leading `N(.N)*` run
fn release_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut end = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            i += 1;
            end = i;
        } else if bytes[i] == b'.' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() && end == i
        {
            i += 1;
        } else {
            break;
        }
    }
    end
}

fn parse_stage(suffix: &str) -> Option<Stage> {
    let suffix = suffix.trim_start_matches(['.', '-', '_']);
    if suffix.is_empty() {
        return Some(Stage::Final);
    }

    // Longest labels first so "rc" is not read as "r"
    const LABELS: [(&str, fn(u64) -> Stage); 11] = [
        ("preview", Stage::Rc),
        ("alpha", Stage::Alpha),
        ("beta", Stage::Beta),
        ("post", Stage::Post),
        ("pre", Stage::Rc),
        ("dev", Stage::Dev),
        ("rev", Stage::Post),
        ("rc", Stage::Rc),
        ("a", Stage::Alpha),
        ("b", Stage::Beta),
        ("c", Stage::Rc),
    ];

    let (label, make) = LABELS
        .iter()
        .find(|(label, _)| suffix.starts_with(label))
        .map(|(label, make)| (*label, *make))
        .or_else(|| suffix.starts_with('r').then_some(("r", Stage::Post as fn(u64) -> Stage)))?;

    let number = suffix[label.len()..].trim_start_matches(['.', '-', '_']);
    let digits: String = number.chars().take_while(char::is_ascii_digit).collect();
    let n = if digits.is_empty() {
        0
    } else {
        digits.parse().ok()?
    };
    Some(make(n))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Compatible,
    Equal,
    NotEqual,
    GreaterEqual,
    LessEqual,
    Greater,
    Less,
}

#[derive(Debug, Clone)]
struct Clause {
    op: Operator,
    version: Version,
    /// `==1.2.*` / `!=1.2.*`
    wildcard: bool,
}

impl Clause {
    fn matches(&self, v: &Version) -> bool {
        match self.op {
            Operator::Equal if self.wildcard => v.has_release_prefix(&self.version.release),
            Operator::NotEqual if self.wildcard => !v.has_release_prefix(&self.version.release),
            Operator::Equal => v == &self.version,
            Operator::NotEqual => v != &self.version,
            Operator::GreaterEqual => v >= &self.version,
            Operator::LessEqual => v <= &self.version,
            Operator::Greater => v > &self.version,
            Operator::Less => v < &self.version,
            Operator::Compatible => {
                let prefix = &self.version.release[..self.version.release.len() - 1];
                v >= &self.version && v.has_release_prefix(prefix)
            }
        }
    }
}

/// A comma-separated set of clauses, all of which must hold
#[derive(Debug, Clone)]
pub struct VersionSpec {
    clauses: Vec<Clause>,
}

impl VersionSpec {
    /// True if `version` satisfies every clause (an empty spec accepts anything)
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        self.clauses.iter().all(|clause| clause.matches(version))
    }
}

impl FromStr for VersionSpec {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const OPERATORS: [(&str, Operator); 7] = [
            ("~=", Operator::Compatible),
            ("==", Operator::Equal),
            ("!=", Operator::NotEqual),
            (">=", Operator::GreaterEqual),
            ("<=", Operator::LessEqual),
            (">", Operator::Greater),
            ("<", Operator::Less),
        ];

        let clauses = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                let invalid = || VersionError::InvalidSpecifier(part.to_owned());
                let (token, op) = OPERATORS
                    .iter()
                    .find(|(token, _)| part.starts_with(token))
                    .ok_or_else(invalid)?;
                let operand = part[token.len()..].trim();

                let (operand, wildcard) = match operand.strip_suffix(".*") {
                    Some(base) if matches!(op, Operator::Equal | Operator::NotEqual) => {
                        (base, true)
                    }
                    Some(_) => return Err(invalid()),
                    None => (operand, false),
                };

                let version: Version = operand.parse().map_err(|_| invalid())?;
                if *op == Operator::Compatible && version.release.len() < 2 {
                    return Err(invalid());
                }

                Ok(Clause {
                    op: *op,
                    version,
                    wildcard,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { clauses })
    }
}
