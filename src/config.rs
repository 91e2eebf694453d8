use std::{
  fs,
  path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::version::VersionCache;

/// Looked up in the working directory when `--config` is not given.
pub const CONFIG_FILE: &str = "interp-bench.toml";

/// Settings shared by every command. Command line flags win over these.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  /// Manifest used when `--manifest` is not given.
  pub manifest: Option<PathBuf>,
  /// The manifest `<default>` refers to.
  pub default_manifest: Option<PathBuf>,
  /// Interpreter used when `--interpreter` is not given.
  pub interpreter: Option<PathBuf>,
  pub affinity_tool: PathBuf,
  /// Per-benchmark timeout in seconds.
  pub timeout: Option<u64>,
  pub inherit_environ: Vec<String>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      manifest: None,
      default_manifest: None,
      interpreter: None,
      affinity_tool: default_affinity_tool(),
      timeout: None,
      inherit_environ: Vec::new(),
    }
  }
}

fn default_affinity_tool() -> PathBuf {
  PathBuf::from("taskset")
}

impl Config {
  /// Loads a config file. Relative paths in it are relative to the file.
  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;
    let mut config: Config = toml::from_str(&text).with_context(|| format!("parse {path:?}"))?;

    let dir = path.parent().unwrap_or(Path::new("."));
    for file in [&mut config.manifest, &mut config.default_manifest].into_iter().flatten() {
      if file.is_relative() {
        *file = dir.join(&*file);
      }
    }
    // Bare names such as `python3` are looked up on PATH, so only
    // paths with a directory part are anchored.
    if let Some(interpreter) = &mut config.interpreter {
      if interpreter.is_relative() && interpreter.components().count() > 1 {
        *interpreter = dir.join(&*interpreter);
      }
    }

    Ok(config)
  }

  /// `explicit`, else `interp-bench.toml` in the working directory if present,
  /// else defaults.
  pub fn discover(explicit: Option<&Path>) -> Result<Self> {
    if let Some(path) = explicit {
      return Self::load(path);
    }

    let path = Path::new(CONFIG_FILE);
    if path.is_file() {
      tracing::debug!("using config file {path:?}");
      return Self::load(path);
    }

    Ok(Self::default())
  }

  /// The manifest to load: `cli`, then the configured manifest, then the
  /// default one.
  pub fn manifest_path(&self, cli: Option<&Path>) -> Result<PathBuf> {
    cli
      .map(Path::to_path_buf)
      .or_else(|| self.manifest.clone())
      .or_else(|| self.default_manifest.clone())
      .context("no manifest given, pass --manifest or set `manifest` in the config file")
  }
}

/// State shared by a command: settings and the interpreter versions probed
/// so far.
#[derive(Debug, Default)]
pub struct Session {
  pub config: Config,
  pub versions: VersionCache,
}

impl Session {
  pub fn new(config: Config) -> Self {
    Self {
      config,
      versions: VersionCache::default(),
    }
  }
}
