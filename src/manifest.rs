use std::{
  collections::{BTreeMap, BTreeSet, HashMap, HashSet},
  fs,
  path::{Path, PathBuf},
};

use anyhow::{Context, Result};

use crate::benchmark::{self, Benchmark, BenchmarkSpec, DEFAULT_ORIGIN, METADATA_FILE};

/// Group holding every benchmark of the manifest.
pub const ALL_GROUP: &str = "all";
/// Group selected when a selection has no positive entry.
pub const DEFAULT_GROUP: &str = "default";

const BENCHMARKS_HEADER: [&str; 2] = ["name", "metafile"];
const DEFAULT_INCLUDE: &str = "<default>";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
  #[error("invalid manifest file, no sections found")]
  NoSections,
  #[error("expected new section, got {0:?}")]
  ExpectedSection(String),
  #[error("unknown manifest section [{0}]")]
  UnknownSection(String),
  #[error("invalid manifest file, expected benchmarks table header")]
  BadHeader,
  #[error("bad benchmark line {0:?}")]
  BadLine(String),
  #[error("invalid name {0:?}")]
  InvalidName(String),
  #[error("unsupported metafile directive {0:?}")]
  UnsupportedDirective(String),
  #[error("duplicate benchmark {0:?}")]
  DuplicateBenchmark(String),
  #[error("a group and a benchmark have the same name ({0})")]
  NameClash(String),
  #[error("group {0:?} is built in and cannot be declared")]
  ReservedGroup(String),
  #[error("unknown benchmark or group {member:?} (in group {group:?})")]
  UnknownMember { group: String, member: String },
  #[error("circular group reference: {}", .0.join(" -> "))]
  CircularGroup(Vec<String>),
  #[error("no default manifest configured for {DEFAULT_INCLUDE} include")]
  NoDefaultManifest,
}

/// One line of a `[group NAME]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GroupEntry {
  exclude: bool,
  name: String,
}

impl GroupEntry {
  fn parse(line: &str) -> Result<Self, ManifestError> {
    let (exclude, name) = match line.strip_prefix('-') {
      Some(name) => (true, name),
      None => (false, line.strip_prefix('+').unwrap_or(line)),
    };
    let name = name.trim();

    if !benchmark::is_valid_name(name) {
      return Err(ManifestError::InvalidName(name.to_string()));
    }

    Ok(Self {
      exclude,
      name: name.to_string(),
    })
  }
}

/// A parsed manifest: benchmarks in declaration order and fully resolved
/// groups.
#[derive(Debug)]
pub struct Manifest {
  benchmarks: Vec<Benchmark>,
  by_name: HashMap<String, usize>,
  groups: BTreeMap<String, BTreeSet<String>>,
}

impl Manifest {
  /// Loads the manifest at `path` and its includes. `default_manifest` is
  /// what `<default>` includes refer to.
  pub fn load<P: AsRef<Path>>(path: P, default_manifest: Option<&Path>) -> Result<Self> {
    let path = path.as_ref();
    let mut loader = Loader::new(default_manifest);
    loader.load_file(path).with_context(|| format!("load manifest {path:?}"))?;

    Ok(loader.finish()?)
  }

  /// Parses manifest `text` as if it were read from `path`.
  pub fn parse<P: AsRef<Path>>(text: &str, path: P, default_manifest: Option<&Path>) -> Result<Self> {
    let path = path.as_ref();
    let mut loader = Loader::new(default_manifest);
    loader.seen.insert(canonical(path));
    loader.load_text(text, path).with_context(|| format!("parse manifest {path:?}"))?;

    Ok(loader.finish()?)
  }

  pub fn benchmarks(&self) -> &[Benchmark] {
    &self.benchmarks
  }

  pub fn benchmark(&self, name: &str) -> Option<&Benchmark> {
    self.by_name.get(name).map(|&index| &self.benchmarks[index])
  }

  pub fn groups(&self) -> &BTreeMap<String, BTreeSet<String>> {
    &self.groups
  }

  pub fn group(&self, name: &str) -> Option<&BTreeSet<String>> {
    self.groups.get(name)
  }

  /// Tags aggregated from benchmark metadata. Loads every benchmark's
  /// metadata.
  pub fn tags(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let mut tags: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for bench in &self.benchmarks {
      for tag in bench.tags()? {
        tags.entry(tag.clone()).or_default().insert(bench.name().to_string());
      }
    }

    Ok(tags)
  }

  /// Benchmarks tagged with `tag`.
  pub fn with_tag(&self, tag: &str) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for bench in &self.benchmarks {
      if bench.tags()?.iter().any(|t| t == tag) {
        names.insert(bench.name().to_string());
      }
    }

    Ok(names)
  }
}

fn canonical(path: &Path) -> PathBuf {
  path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Splits manifest text into `(section, lines)` pairs. `#` starts a comment.
fn sections(text: &str) -> Result<Vec<(String, Vec<String>)>, ManifestError> {
  let mut sections: Vec<(String, Vec<String>)> = Vec::new();

  for line in text.lines() {
    let line = line.split('#').next().unwrap_or_default().trim();
    if line.is_empty() {
      continue;
    }

    if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
      sections.push((name.trim().to_string(), Vec::new()));
    } else {
      match sections.last_mut() {
        Some((_, lines)) => lines.push(line.to_string()),
        None => return Err(ManifestError::ExpectedSection(line.to_string())),
      }
    }
  }

  if sections.is_empty() {
    return Err(ManifestError::NoSections);
  }

  Ok(sections)
}

/// Fields of a tab-separated `[benchmarks]` row.
fn split_row(line: &str) -> Vec<&str> {
  line.split('\t').map(str::trim).filter(|field| !field.is_empty()).collect()
}

/// Resolves a metafile column relative to the manifest directory.
fn resolve_metafile(metafile: &str, name: &str, localdir: &Path) -> Result<PathBuf, ManifestError> {
  if metafile == "-" {
    return Ok(localdir.join(format!("bm_{name}")).join(METADATA_FILE));
  }

  let Some(directive) = metafile.strip_prefix('<').and_then(|rest| rest.strip_suffix('>')) else {
    return Ok(localdir.join(metafile));
  };

  match directive.split_once(':') {
    None if directive == "local" => Ok(localdir.join(format!("bm_{name}")).join(METADATA_FILE)),
    Some(("local", base)) if !base.is_empty() => Ok(localdir.join(format!("bm_{base}")).join(format!("bm_{name}.toml"))),
    _ => Err(ManifestError::UnsupportedDirective(metafile.to_string())),
  }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
  Visiting,
  Done,
}

/// Accumulates benchmarks and group declarations across included files.
struct Loader {
  default_manifest: Option<PathBuf>,
  seen: HashSet<PathBuf>,
  benchmarks: Vec<Benchmark>,
  by_name: HashMap<String, usize>,
  /// `None` for groups only listed under `[groups]`.
  groups: BTreeMap<String, Option<Vec<GroupEntry>>>,
}

impl Loader {
  fn new(default_manifest: Option<&Path>) -> Self {
    Self {
      default_manifest: default_manifest.map(canonical),
      seen: HashSet::new(),
      benchmarks: Vec::new(),
      by_name: HashMap::new(),
      groups: BTreeMap::new(),
    }
  }

  fn load_file(&mut self, path: &Path) -> Result<()> {
    if !self.seen.insert(canonical(path)) {
      tracing::debug!(?path, "manifest already loaded, skipping");
      return Ok(());
    }

    let text = fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;
    self.load_text(&text, path)
  }

  fn load_text(&mut self, text: &str, path: &Path) -> Result<()> {
    let localdir = path.parent().unwrap_or(Path::new("."));
    let origin = match &self.default_manifest {
      Some(default) if *default == canonical(path) => DEFAULT_ORIGIN.to_string(),
      _ => path.display().to_string(),
    };

    for (section, lines) in sections(text)? {
      match section.as_str() {
        "benchmarks" => self.parse_benchmarks(&lines, localdir, &origin)?,
        "groups" => {
          for name in lines {
            self.declare_group(&name)?;
          }
        }
        "includes" => {
          for include in lines {
            let include = if include == DEFAULT_INCLUDE {
              self.default_manifest.clone().ok_or(ManifestError::NoDefaultManifest)?
            } else {
              localdir.join(include)
            };
            self
              .load_file(&include)
              .with_context(|| format!("include {include:?}"))?;
          }
        }
        _ => match section.strip_prefix("group ") {
          Some(name) => {
            let name = name.trim();
            self.declare_group(name)?;
            let entries = lines
              .iter()
              .map(|line| GroupEntry::parse(line))
              .collect::<Result<Vec<_>, _>>()?;
            if let Some(group) = self.groups.get_mut(name) {
              group.get_or_insert_with(Vec::new).extend(entries);
            }
          }
          None => return Err(ManifestError::UnknownSection(section.clone()).into()),
        },
      }
    }

    Ok(())
  }

  fn declare_group(&mut self, name: &str) -> Result<(), ManifestError> {
    if name == ALL_GROUP {
      return Err(ManifestError::ReservedGroup(name.to_string()));
    }
    if !benchmark::is_valid_name(name) {
      return Err(ManifestError::InvalidName(name.to_string()));
    }
    self.groups.entry(name.to_string()).or_default();

    Ok(())
  }

  fn parse_benchmarks(&mut self, lines: &[String], localdir: &Path, origin: &str) -> Result<(), ManifestError> {
    let mut lines = lines.iter();
    let header = lines.next().map(|line| split_row(line));
    if header.as_deref() != Some(&BENCHMARKS_HEADER[..]) {
      return Err(ManifestError::BadHeader);
    }

    for line in lines {
      let fields = split_row(line);
      let [name, metafile] = fields[..] else {
        return Err(ManifestError::BadLine(line.clone()));
      };
      if !benchmark::is_valid_name(name) {
        return Err(ManifestError::InvalidName(name.to_string()));
      }
      if self.by_name.contains_key(name) {
        return Err(ManifestError::DuplicateBenchmark(name.to_string()));
      }

      let metafile = resolve_metafile(metafile, name, localdir)?;
      let spec = BenchmarkSpec {
        name: name.to_string(),
        version: None,
        origin: Some(origin.to_string()),
      };
      self.by_name.insert(name.to_string(), self.benchmarks.len());
      self.benchmarks.push(Benchmark::new(spec, metafile));
    }

    Ok(())
  }

  fn finish(self) -> Result<Manifest, ManifestError> {
    for (group, entries) in &self.groups {
      if self.by_name.contains_key(group) {
        return Err(ManifestError::NameClash(group.clone()));
      }

      for entry in entries.iter().flatten() {
        let known = entry.name == ALL_GROUP || self.by_name.contains_key(&entry.name) || self.groups.contains_key(&entry.name);
        if !known {
          return Err(ManifestError::UnknownMember {
            group: group.clone(),
            member: entry.name.clone(),
          });
        }
      }
    }

    let all: BTreeSet<String> = self.by_name.keys().cloned().collect();
    let mut resolver = GroupResolver {
      declared: &self.groups,
      benchmarks: &self.by_name,
      all: &all,
      marks: HashMap::new(),
      stack: Vec::new(),
      resolved: BTreeMap::new(),
    };
    for group in self.groups.keys() {
      resolver.resolve(group)?;
    }

    let mut groups = resolver.resolved;
    groups.insert(ALL_GROUP.to_string(), all.clone());
    groups.entry(DEFAULT_GROUP.to_string()).or_insert(all);

    Ok(Manifest {
      benchmarks: self.benchmarks,
      by_name: self.by_name,
      groups,
    })
  }
}

/// Depth-first group expansion with cycle detection.
struct GroupResolver<'a> {
  declared: &'a BTreeMap<String, Option<Vec<GroupEntry>>>,
  benchmarks: &'a HashMap<String, usize>,
  all: &'a BTreeSet<String>,
  marks: HashMap<&'a str, Mark>,
  stack: Vec<&'a str>,
  resolved: BTreeMap<String, BTreeSet<String>>,
}

impl<'a> GroupResolver<'a> {
  fn resolve(&mut self, group: &'a str) -> Result<BTreeSet<String>, ManifestError> {
    match self.marks.get(group) {
      Some(Mark::Done) => return Ok(self.resolved[group].clone()),
      Some(Mark::Visiting) => {
        let start = self.stack.iter().position(|name| *name == group).unwrap_or(0);
        let mut cycle: Vec<String> = self.stack[start..].iter().map(|name| name.to_string()).collect();
        cycle.push(group.to_string());
        return Err(ManifestError::CircularGroup(cycle));
      }
      None => {}
    }

    self.marks.insert(group, Mark::Visiting);
    self.stack.push(group);

    let declared = self.declared;
    let members = match declared.get(group).and_then(Option::as_ref) {
      None => BTreeSet::new(),
      Some(entries) => {
        let mut members = if entries.iter().any(|entry| !entry.exclude) {
          BTreeSet::new()
        } else {
          self.all.clone()
        };

        for entry in entries.iter().filter(|entry| !entry.exclude) {
          members.extend(self.expand(&entry.name)?);
        }
        for entry in entries.iter().filter(|entry| entry.exclude) {
          for name in self.expand(&entry.name)? {
            members.remove(&name);
          }
        }

        members
      }
    };

    self.stack.pop();
    self.marks.insert(group, Mark::Done);
    self.resolved.insert(group.to_string(), members.clone());

    Ok(members)
  }

  fn expand(&mut self, name: &'a str) -> Result<BTreeSet<String>, ManifestError> {
    if self.benchmarks.contains_key(name) {
      Ok(BTreeSet::from([name.to_string()]))
    } else if name == ALL_GROUP {
      Ok(self.all.clone())
    } else {
      self.resolve(name)
    }
  }
}
