use std::collections::BTreeSet;

use anyhow::{Context, Result};

use crate::{
  interpreter::Interpreter,
  manifest::{Manifest, DEFAULT_GROUP},
  version::VersionCache,
};

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
  #[error("negative groups not supported: -{0}")]
  NegativeGroup(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
  Include,
  Exclude,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
  /// A benchmark or group name.
  Name(String),
  /// `<tag>`: a group or a metadata tag.
  Tag(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
  pub op: Op,
  pub target: Target,
}

/// Parses a comma-separated selection such as `"default,-chaos,<apps>"`.
pub fn parse_selections(raw: &str) -> Vec<Selection> {
  raw
    .split(',')
    .map(|token| token.trim().to_lowercase())
    .filter(|token| !token.is_empty())
    .map(|token| {
      let (op, rest) = match token.strip_prefix('-') {
        Some(rest) => (Op::Exclude, rest),
        None => (Op::Include, token.strip_prefix('+').unwrap_or(&token)),
      };
      let rest = rest.trim();

      let target = match rest.strip_prefix('<').and_then(|tag| tag.strip_suffix('>')) {
        Some(tag) => Target::Tag(tag.to_string()),
        None => Target::Name(rest.to_string()),
      };

      Selection { op, target }
    })
    .collect()
}

/// Resolves a selection string against `manifest` into a sorted set of
/// benchmark names. Without any resolvable positive entry the `default`
/// group is selected.
pub fn select(manifest: &Manifest, raw: &str) -> Result<BTreeSet<String>> {
  resolve(manifest, &parse_selections(raw))
}

pub fn resolve(manifest: &Manifest, selections: &[Selection]) -> Result<BTreeSet<String>> {
  let mut included = BTreeSet::new();
  let mut excluded = BTreeSet::new();
  let mut any_positive = false;

  for selection in selections {
    match (&selection.op, &selection.target) {
      (Op::Include, Target::Name(name)) => {
        if manifest.benchmark(name).is_some() {
          included.insert(name.clone());
        } else if let Some(group) = manifest.group(name) {
          included.extend(group.iter().cloned());
        } else {
          tracing::warn!("unknown benchmark or group {name:?}, skipping");
          continue;
        }
        any_positive = true;
      }
      (Op::Exclude, Target::Name(name)) => {
        if manifest.benchmark(name).is_some() {
          excluded.insert(name.clone());
        } else if manifest.group(name).is_some() {
          return Err(SelectionError::NegativeGroup(name.clone()).into());
        } else {
          tracing::warn!("unknown benchmark {name:?}, skipping");
        }
      }
      (Op::Include, Target::Tag(tag)) => {
        let members = match manifest.group(tag) {
          Some(group) => group.clone(),
          None => manifest.with_tag(tag).with_context(|| format!("collect tag <{tag}>"))?,
        };
        if members.is_empty() && manifest.group(tag).is_none() {
          tracing::warn!("unknown group or tag <{tag}>, skipping");
          continue;
        }
        included.extend(members);
        any_positive = true;
      }
      (Op::Exclude, Target::Tag(tag)) => {
        return Err(SelectionError::NegativeGroup(format!("<{tag}>")).into());
      }
    }
  }

  if !any_positive {
    if let Some(default) = manifest.group(DEFAULT_GROUP) {
      included.extend(default.iter().cloned());
    }
  }

  Ok(included.difference(&excluded).cloned().collect())
}

/// Drops benchmarks whose supported version range excludes any of
/// `interpreters`.
pub fn filter_compatible(
  manifest: &Manifest,
  selected: BTreeSet<String>,
  interpreters: &[&Interpreter],
  versions: &mut VersionCache,
) -> Result<BTreeSet<String>> {
  let mut compatible = BTreeSet::new();

  'benchmarks: for name in selected {
    let bench = manifest.benchmark(&name).with_context(|| format!("unknown benchmark {name}"))?;
    let metadata = bench.metadata()?;
    if metadata.minver.is_none() && metadata.maxver.is_none() {
      compatible.insert(name);
      continue;
    }

    for &interpreter in interpreters {
      let version = versions.get(interpreter)?;
      if !version.within(metadata.minver.as_ref(), metadata.maxver.as_ref()) {
        tracing::info!("skipping benchmark {name}: not compatible with {interpreter} version {version}");
        continue 'benchmarks;
      }
    }

    compatible.insert(name);
  }

  Ok(compatible)
}

#[cfg(test)]
mod tests {
  use std::{fs, path::Path};

  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;

  fn manifest() -> Manifest {
    let text = "\
[benchmarks]
name\tmetafile
chaos\t-
go\t-
nbody\t-

[group apps]
chaos
go

[group default]
-nbody
";
    Manifest::parse(text, "/suite/MANIFEST", None).unwrap()
  }

  fn names(set: &BTreeSet<String>) -> Vec<&str> {
    set.iter().map(String::as_str).collect()
  }

  #[test]
  fn tokens() {
    assert_eq!(
      parse_selections(" Chaos, -go,,<Apps>,+nbody "),
      vec![
        Selection {
          op: Op::Include,
          target: Target::Name("chaos".into())
        },
        Selection {
          op: Op::Exclude,
          target: Target::Name("go".into())
        },
        Selection {
          op: Op::Include,
          target: Target::Tag("apps".into())
        },
        Selection {
          op: Op::Include,
          target: Target::Name("nbody".into())
        },
      ]
    );
  }

  #[test]
  fn default_is_deterministic() {
    let manifest = manifest();
    let first = select(&manifest, "default").unwrap();
    let second = select(&manifest, "default").unwrap();

    assert_eq!(names(&first), vec!["chaos", "go"]);
    assert_eq!(first, second);
    assert_eq!(select(&manifest, "").unwrap(), first);
  }

  #[test]
  fn include_then_exclude_is_empty() {
    assert!(select(&manifest(), "chaos,-chaos").unwrap().is_empty());
  }

  #[test]
  fn only_exclusions_start_from_default() {
    assert_eq!(names(&select(&manifest(), "-go").unwrap()), vec!["chaos"]);
  }

  #[test]
  fn groups_and_group_patterns() {
    let manifest = manifest();
    assert_eq!(names(&select(&manifest, "apps,-go").unwrap()), vec!["chaos"]);
    assert_eq!(names(&select(&manifest, "<apps>,nbody").unwrap()), vec!["chaos", "go", "nbody"]);
    assert_eq!(names(&select(&manifest, "all").unwrap()), vec!["chaos", "go", "nbody"]);
  }

  #[test]
  fn negative_group_is_fatal() {
    let err = select(&manifest(), "all,-apps").unwrap_err();
    assert_eq!(err.to_string(), "negative groups not supported: -apps");

    let err = select(&manifest(), "all,-<apps>").unwrap_err();
    assert_eq!(err.to_string(), "negative groups not supported: -<apps>");
  }

  #[test]
  fn unknown_names_are_skipped() {
    assert_eq!(names(&select(&manifest(), "chaos,bogus,-missing").unwrap()), vec!["chaos"]);
  }

  fn write(dir: &Path, path: &str, contents: &str) {
    let path = dir.join(path);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
  }

  #[test]
  fn tags_from_metadata() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "bm_a/benchmark.toml", "tags = [\"math\"]\n");
    write(tmp.path(), "bm_b/benchmark.toml", "tags = \"io\"\n");
    write(tmp.path(), "MANIFEST", "[benchmarks]\nname\tmetafile\na\t-\nb\t-\n");
    let manifest = Manifest::load(tmp.path().join("MANIFEST"), None).unwrap();

    assert_eq!(names(&select(&manifest, "<math>").unwrap()), vec!["a"]);
    assert_eq!(names(&select(&manifest, "<io>,a").unwrap()), vec!["a", "b"]);
  }

  #[test]
  fn incompatible_versions_are_dropped() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "bm_old/benchmark.toml", "maxver = \"3.8\"\n");
    write(tmp.path(), "bm_new/benchmark.toml", "minver = \"3.11\"\n");
    write(tmp.path(), "bm_any/benchmark.toml", "");
    write(
      tmp.path(),
      "MANIFEST",
      "[benchmarks]\nname\tmetafile\nold\t-\nnew\t-\nany\t-\n",
    );
    let manifest = Manifest::load(tmp.path().join("MANIFEST"), None).unwrap();

    let base = Interpreter::new("/opt/py311/bin/python", Vec::new());
    let changed = Interpreter::new("/opt/py312/bin/python", Vec::new());
    let mut versions = VersionCache::default();
    versions.insert(base.clone(), "3.11.9".parse().unwrap());
    versions.insert(changed.clone(), "3.12.1".parse().unwrap());

    let selected = select(&manifest, "all").unwrap();
    let compatible = filter_compatible(&manifest, selected.clone(), &[&base, &changed], &mut versions).unwrap();
    assert_eq!(names(&compatible), vec!["any", "new"]);

    let old = Interpreter::new("/opt/py37/bin/python", Vec::new());
    versions.insert(old.clone(), "3.7".parse().unwrap());
    let compatible = filter_compatible(&manifest, selected, &[&old], &mut versions).unwrap();
    assert_eq!(names(&compatible), vec!["any", "old"]);
  }
}
