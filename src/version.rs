use std::{
  cmp::Ordering,
  collections::HashMap,
  fmt,
  process::Stdio,
  str::FromStr,
  sync::OnceLock,
};

use anyhow::{Context, Result};
use regex::Regex;

use crate::{ext::ExitStatusExt, interpreter::Interpreter};

/// A dotted numeric version such as `3.12.1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(Vec<u64>);

impl Version {
  /// Finds the first dotted version number in free-form `--version` output.
  pub fn find(text: &str) -> Option<Version> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"\d+(?:\.\d+)+").expect("valid version regex"));

    pattern.find(text)?.as_str().parse().ok()
  }

  /// Compares only as many components as `bound` has, so `3.12.4` is within
  /// a `maxver` of `3.12`.
  fn cmp_to_bound(&self, bound: &Version) -> Ordering {
    let len = bound.0.len().min(self.0.len());
    self.0[..len].cmp(&bound.0[..len]).then_with(|| {
      if self.0.len() < bound.0.len() {
        Ordering::Less
      } else {
        Ordering::Equal
      }
    })
  }

  /// Returns true if the version lies in the inclusive `[min, max]` range.
  /// A missing bound is open.
  pub fn within(&self, min: Option<&Version>, max: Option<&Version>) -> bool {
    let above_min = min.map_or(true, |min| self.cmp_to_bound(min) != Ordering::Less);
    let below_max = max.map_or(true, |max| self.cmp_to_bound(max) != Ordering::Greater);

    above_min && below_max
  }
}

impl FromStr for Version {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self> {
    let components = s
      .trim()
      .split('.')
      .map(|part| {
        // Tolerate pre-release suffixes such as `13rc1` or `0+`.
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        digits.parse::<u64>().with_context(|| format!("bad version component {part:?} in {s:?}"))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Self(components))
  }
}

impl fmt::Display for Version {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
    write!(f, "{}", parts.join("."))
  }
}

/// Interpreter versions, probed at most once per interpreter command.
#[derive(Debug, Default)]
pub struct VersionCache {
  versions: HashMap<Interpreter, Version>,
}

impl VersionCache {
  pub fn insert(&mut self, interpreter: Interpreter, version: Version) {
    self.versions.insert(interpreter, version);
  }

  pub fn get(&mut self, interpreter: &Interpreter) -> Result<Version> {
    if let Some(version) = self.versions.get(interpreter) {
      return Ok(version.clone());
    }

    let version = probe(interpreter).with_context(|| format!("probe version of {interpreter}"))?;
    tracing::debug!(%interpreter, %version, "probed interpreter version");
    self.versions.insert(interpreter.clone(), version.clone());

    Ok(version)
  }
}

/// Runs `interpreter --version`. Some interpreters print the version on
/// stderr, so both streams are searched.
fn probe(interpreter: &Interpreter) -> Result<Version> {
  let output = interpreter
    .command()
    .arg("--version")
    .stdin(Stdio::null())
    .output()
    .context("output")?;
  output.status.check_success()?;

  let text = format!(
    "{}\n{}",
    String::from_utf8_lossy(&output.stdout),
    String::from_utf8_lossy(&output.stderr)
  );

  Version::find(&text).context("no version number in output")
}
