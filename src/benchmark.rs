use std::{
  cell::OnceCell,
  fmt, fs,
  path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::version::Version;

/// Origin of benchmarks declared by the built-in manifest.
pub const DEFAULT_ORIGIN: &str = "<default>";

/// Metadata file name inside a `bm_<name>` directory.
pub const METADATA_FILE: &str = "benchmark.toml";

const DATA_DIR: &str = "data";
const RUNSCRIPT_STEM: &str = "run_benchmark";
const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Returns true for lowercase identifier-shaped names (`json_dumps`, `2to3`).
pub fn is_valid_name(name: &str) -> bool {
  !name.is_empty()
    && name
      .chars()
      .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    && !name.chars().all(|c| c.is_ascii_digit())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkSpec {
  pub name: String,
  pub version: Option<String>,
  /// The manifest that declared the benchmark.
  pub origin: Option<String>,
}

impl fmt::Display for BenchmarkSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.name)?;
    if let Some(version) = &self.version {
      write!(f, "-{version}")?;
    }

    Ok(())
  }
}

/// Fully resolved benchmark metadata. Paths are absolute.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
  pub name: String,
  pub version: Option<String>,
  pub tags: Vec<String>,
  pub datadir: Option<PathBuf>,
  pub runscript: Option<PathBuf>,
  pub extra_opts: Vec<String>,
  pub requirements_lockfile: Option<PathBuf>,
  pub minver: Option<Version>,
  pub maxver: Option<Version>,
  /// The metadata file this one inherits from, if any.
  pub base: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MetadataFile {
  name: Option<String>,
  version: Option<String>,
  tags: Option<Tags>,
  datadir: Option<PathBuf>,
  runscript: Option<PathBuf>,
  extra_opts: Option<Vec<String>>,
  requirements_lockfile: Option<PathBuf>,
  minver: Option<String>,
  maxver: Option<String>,
  base: Option<PathBuf>,
}

/// Either `["a", "b"]` or `"a, b"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Tags {
  List(Vec<String>),
  Joined(String),
}

impl Tags {
  fn into_vec(self) -> Vec<String> {
    match self {
      Tags::List(tags) => tags,
      Tags::Joined(tags) => tags.replace(',', " ").split_whitespace().map(String::from).collect(),
    }
  }
}

/// One metadata document with its paths resolved against its own directory.
#[derive(Debug, Default)]
struct Layer {
  name: Option<String>,
  version: Option<String>,
  tags: Option<Vec<String>>,
  datadir: Option<PathBuf>,
  runscript: Option<PathBuf>,
  extra_opts: Option<Vec<String>>,
  requirements_lockfile: Option<PathBuf>,
  minver: Option<Version>,
  maxver: Option<Version>,
  base: Option<PathBuf>,
}

impl Layer {
  /// Fields set on `self` win over those of `base`.
  fn or(self, base: Layer) -> Layer {
    Layer {
      name: self.name,
      version: self.version.or(base.version),
      tags: self.tags.or(base.tags),
      datadir: self.datadir.or(base.datadir),
      runscript: self.runscript.or(base.runscript),
      extra_opts: self.extra_opts.or(base.extra_opts),
      requirements_lockfile: self.requirements_lockfile.or(base.requirements_lockfile),
      minver: self.minver.or(base.minver),
      maxver: self.maxver.or(base.maxver),
      base: self.base,
    }
  }
}

/// Benchmark name implied by the metadata file location: `bm_<name>.toml`, or
/// `bm_<name>/benchmark.toml`.
fn name_from_path(metafile: &Path) -> Option<String> {
  let file_name = metafile.file_name()?.to_str()?;
  if file_name == METADATA_FILE {
    let dir = metafile.parent()?.file_name()?.to_str()?;
    return dir.strip_prefix("bm_").map(String::from);
  }

  file_name
    .strip_prefix("bm_")
    .and_then(|rest| rest.strip_suffix(".toml"))
    .map(String::from)
}

/// `bm_<x>/bm_<name>.toml` implicitly inherits `bm_<x>/benchmark.toml`.
fn implicit_base(metafile: &Path) -> Option<PathBuf> {
  let file_name = metafile.file_name()?.to_str()?;
  if file_name == METADATA_FILE || !(file_name.starts_with("bm_") && file_name.ends_with(".toml")) {
    return None;
  }

  let dir = metafile.parent()?;
  if !dir.file_name()?.to_str()?.starts_with("bm_") {
    return None;
  }

  Some(dir.join(METADATA_FILE)).filter(|base| base.is_file())
}

fn resolve_path(rootdir: &Path, path: PathBuf) -> PathBuf {
  if path.is_absolute() {
    path
  } else {
    rootdir.join(path)
  }
}

fn read_layer(metafile: &Path) -> Result<Layer> {
  let text = fs::read_to_string(metafile).with_context(|| format!("read {metafile:?}"))?;
  let file: MetadataFile = toml::from_str(&text).with_context(|| format!("parse {metafile:?}"))?;
  let rootdir = metafile.parent().context("metadata file has no parent directory")?;

  if let Some(name) = &file.name {
    if !is_valid_name(name) {
      anyhow::bail!("invalid benchmark name {name:?}");
    }
  }

  let tags = file.tags.map(Tags::into_vec);
  for tag in tags.iter().flatten() {
    if !is_valid_name(tag) {
      anyhow::bail!("invalid tag {tag:?}");
    }
  }

  let datadir = file.datadir.map(|dir| resolve_path(rootdir, dir));
  if let Some(datadir) = &datadir {
    if !datadir.is_dir() {
      anyhow::bail!("datadir {datadir:?} is not a directory");
    }
  }

  let runscript = file.runscript.map(|script| resolve_path(rootdir, script));
  if let Some(runscript) = &runscript {
    if !runscript.is_file() {
      anyhow::bail!("runscript {runscript:?} is not a file");
    }
  }

  if let Some(opts) = &file.extra_opts {
    if opts.iter().any(String::is_empty) {
      anyhow::bail!("extra_opts should be a list of non-empty strings, got {opts:?}");
    }
  }

  let base = match file.base {
    Some(base) if base.as_os_str() == ".." => Some(rootdir.parent().unwrap_or(rootdir).join("base.toml")),
    Some(base) => Some(resolve_path(rootdir, base)),
    None => implicit_base(metafile),
  };

  Ok(Layer {
    name: file.name,
    version: file.version,
    tags,
    datadir,
    runscript,
    extra_opts: file.extra_opts,
    requirements_lockfile: file.requirements_lockfile.map(|path| resolve_path(rootdir, path)),
    minver: file.minver.as_deref().map(str::parse).transpose().context("minver")?,
    maxver: file.maxver.as_deref().map(str::parse).transpose().context("maxver")?,
    base,
  })
}

/// Reads `metafile` and everything it inherits from, innermost first wins.
fn load_chain(metafile: &Path, chain: &mut Vec<PathBuf>) -> Result<Layer> {
  let canonical = metafile
    .canonicalize()
    .with_context(|| format!("metadata file {metafile:?} not found"))?;

  if chain.contains(&canonical) {
    let cycle = chain
      .iter()
      .chain(std::iter::once(&canonical))
      .map(|path| path.display().to_string())
      .collect::<Vec<_>>()
      .join(" -> ");
    anyhow::bail!("circular metadata inheritance: {cycle}");
  }
  chain.push(canonical);

  let layer = read_layer(metafile)?;
  match &layer.base {
    Some(base) => {
      let base = load_chain(base, chain).with_context(|| format!("load base {base:?}"))?;
      Ok(layer.or(base))
    }
    None => Ok(layer),
  }
}

fn default_runscript(rootdir: &Path) -> Result<Option<PathBuf>> {
  let mut candidates = fs::read_dir(rootdir)
    .with_context(|| format!("read dir {rootdir:?}"))?
    .filter_map(|entry| entry.ok().map(|entry| entry.path()))
    .filter(|path| path.is_file() && path.file_stem().is_some_and(|stem| stem == RUNSCRIPT_STEM))
    .collect::<Vec<_>>();
  candidates.sort();

  Ok(candidates.into_iter().next())
}

/// Loads a metadata file, following `base` inheritance and filling defaults
/// from the directory of `metafile`.
pub fn load_metadata<P: AsRef<Path>>(metafile: P) -> Result<Metadata> {
  let metafile = metafile.as_ref();
  let layer = load_chain(metafile, &mut Vec::new())?;
  let rootdir = metafile.parent().context("metadata file has no parent directory")?;

  let name = layer
    .name
    .or_else(|| name_from_path(metafile))
    .context("missing benchmark name")?;

  let datadir = match layer.datadir {
    Some(datadir) => Some(datadir),
    None => Some(rootdir.join(DATA_DIR)).filter(|dir| dir.is_dir()),
  };
  let runscript = match layer.runscript {
    Some(runscript) => Some(runscript),
    None => default_runscript(rootdir)?,
  };
  let requirements_lockfile = match layer.requirements_lockfile {
    Some(lockfile) => Some(lockfile),
    None => Some(rootdir.join(REQUIREMENTS_FILE)).filter(|file| file.is_file()),
  };

  Ok(Metadata {
    name,
    version: layer.version,
    tags: layer.tags.unwrap_or_default(),
    datadir,
    runscript,
    extra_opts: layer.extra_opts.unwrap_or_default(),
    requirements_lockfile,
    minver: layer.minver,
    maxver: layer.maxver,
    base: layer.base,
  })
}

/// A benchmark declared by a manifest. Its metadata file is read on first
/// access and cached for the lifetime of the value.
#[derive(Debug)]
pub struct Benchmark {
  pub spec: BenchmarkSpec,
  pub metafile: PathBuf,
  metadata: OnceCell<Metadata>,
}

impl Benchmark {
  pub fn new(spec: BenchmarkSpec, metafile: PathBuf) -> Self {
    Self {
      spec,
      metafile,
      metadata: OnceCell::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.spec.name
  }

  pub fn metadata(&self) -> Result<&Metadata> {
    if let Some(metadata) = self.metadata.get() {
      return Ok(metadata);
    }

    let metadata =
      load_metadata(&self.metafile).with_context(|| format!("load metadata of benchmark {}", self.spec.name))?;
    if metadata.name != self.spec.name {
      anyhow::bail!(
        "metadata name {:?} does not match benchmark {:?} ({:?})",
        metadata.name,
        self.spec.name,
        self.metafile
      );
    }

    Ok(self.metadata.get_or_init(|| metadata))
  }

  /// The declared version, falling back to the metadata file.
  pub fn version(&self) -> Result<Option<&str>> {
    if let Some(version) = &self.spec.version {
      return Ok(Some(version));
    }

    Ok(self.metadata()?.version.as_deref())
  }

  pub fn tags(&self) -> Result<&[String]> {
    Ok(&self.metadata()?.tags)
  }

  pub fn runscript(&self) -> Result<&Path> {
    self
      .metadata()?
      .runscript
      .as_deref()
      .with_context(|| format!("benchmark {} has no runscript", self.spec.name))
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;

  fn write(dir: &Path, path: &str, contents: &str) -> PathBuf {
    let path = dir.join(path);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, contents).unwrap();
    path
  }

  fn spec(name: &str) -> BenchmarkSpec {
    BenchmarkSpec {
      name: name.to_string(),
      version: None,
      origin: None,
    }
  }

  #[test]
  fn names() {
    assert!(is_valid_name("json_dumps"));
    assert!(is_valid_name("2to3"));
    assert!(!is_valid_name("Json"));
    assert!(!is_valid_name("a-b"));
    assert!(!is_valid_name("123"));
    assert!(!is_valid_name(""));
  }

  #[test]
  fn defaults_from_directory() {
    let tmp = TempDir::new().unwrap();
    let metafile = write(tmp.path(), "bm_nbody/benchmark.toml", "version = \"1.0\"\ntags = \"math, cpu\"\n");
    write(tmp.path(), "bm_nbody/run_benchmark.sh", "exit 0\n");
    fs::create_dir(tmp.path().join("bm_nbody/data")).unwrap();

    let metadata = load_metadata(&metafile).unwrap();
    assert_eq!(metadata.name, "nbody");
    assert_eq!(metadata.version.as_deref(), Some("1.0"));
    assert_eq!(metadata.tags, vec!["math", "cpu"]);
    assert_eq!(metadata.datadir, Some(tmp.path().join("bm_nbody/data")));
    assert_eq!(metadata.runscript, Some(tmp.path().join("bm_nbody/run_benchmark.sh")));
    assert_eq!(metadata.requirements_lockfile, None);
  }

  #[test]
  fn own_values_win_over_base() {
    let tmp = TempDir::new().unwrap();
    write(
      tmp.path(),
      "base.toml",
      "version = \"2.0\"\ntags = [\"base\"]\nextra_opts = [\"--quick\"]\nminver = \"3.8\"\n",
    );
    let metafile = write(tmp.path(), "bm_a/benchmark.toml", "base = \"..\"\ntags = [\"own\"]\n");
    write(tmp.path(), "bm_a/run_benchmark.py", "");

    let metadata = load_metadata(&metafile).unwrap();
    assert_eq!(metadata.tags, vec!["own"]);
    assert_eq!(metadata.version.as_deref(), Some("2.0"));
    assert_eq!(metadata.extra_opts, vec!["--quick"]);
    assert_eq!(metadata.minver, Some("3.8".parse().unwrap()));
    assert_eq!(metadata.base, Some(tmp.path().join("base.toml")));
  }

  #[test]
  fn local_variant_inherits_directory_metadata() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "bm_json/benchmark.toml", "tags = [\"serialize\"]\n");
    write(tmp.path(), "bm_json/run_benchmark.sh", "");
    let metafile = write(tmp.path(), "bm_json/bm_json_dumps.toml", "extra_opts = [\"dumps\"]\n");

    let metadata = load_metadata(&metafile).unwrap();
    assert_eq!(metadata.name, "json_dumps");
    assert_eq!(metadata.tags, vec!["serialize"]);
    assert_eq!(metadata.extra_opts, vec!["dumps"]);
  }

  #[test]
  fn circular_inheritance() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "a.toml", "name = \"a\"\nbase = \"b.toml\"\n");
    write(tmp.path(), "b.toml", "name = \"b\"\nbase = \"a.toml\"\n");

    let err = load_metadata(tmp.path().join("a.toml")).unwrap_err();
    assert!(format!("{err:#}").contains("circular metadata inheritance"), "{err:#}");
  }

  #[test]
  fn missing_runscript_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let metafile = write(tmp.path(), "bm_x/benchmark.toml", "runscript = \"nope.py\"\n");
    assert!(load_metadata(metafile).is_err());
  }

  #[test]
  fn metadata_is_cached() {
    let tmp = TempDir::new().unwrap();
    let metafile = write(tmp.path(), "bm_x/benchmark.toml", "tags = [\"a\"]\n");
    let bench = Benchmark::new(spec("x"), metafile.clone());

    assert_eq!(bench.tags().unwrap(), ["a".to_string()]);
    fs::remove_file(&metafile).unwrap();
    assert_eq!(bench.tags().unwrap(), ["a".to_string()]);
    assert!(bench.runscript().is_err());
  }

  #[test]
  fn name_mismatch() {
    let tmp = TempDir::new().unwrap();
    let metafile = write(tmp.path(), "bm_x/benchmark.toml", "name = \"y\"\n");
    let bench = Benchmark::new(spec("x"), metafile);

    let err = bench.metadata().unwrap_err();
    assert!(err.to_string().contains("does not match"), "{err}");
  }

  #[test]
  fn spec_version_wins() {
    let tmp = TempDir::new().unwrap();
    let metafile = write(tmp.path(), "bm_x/benchmark.toml", "version = \"1\"\n");
    let mut spec = spec("x");
    spec.version = Some("2".to_string());

    assert_eq!(Benchmark::new(spec, metafile).version().unwrap(), Some("2"));
  }
}
