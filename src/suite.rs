use std::{
  collections::{BTreeMap, HashSet},
  fs::{self, OpenOptions},
  io::Write,
  path::Path,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version of this harness, stamped into every result file.
pub const HARNESS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Placeholder for a missing harness version.
pub const NO_VERSION: &str = "<not set>";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
  #[default]
  Second,
  Byte,
  Integer,
}

/// The samples of one benchmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
  pub name: String,
  #[serde(default)]
  pub unit: Unit,
  pub values: Vec<f64>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub metadata: BTreeMap<String, Value>,
}

impl BenchmarkResult {
  pub fn new(name: impl Into<String>, unit: Unit, values: Vec<f64>) -> Self {
    Self {
      name: name.into(),
      unit,
      values,
      metadata: BTreeMap::new(),
    }
  }

  pub fn mean(&self) -> f64 {
    if self.values.is_empty() {
      return 0.0;
    }

    self.values.iter().sum::<f64>() / self.values.len() as f64
  }

  /// Sample standard deviation, zero below two samples.
  pub fn stdev(&self) -> f64 {
    if self.values.len() < 2 {
      return 0.0;
    }

    let mean = self.mean();
    let squares: f64 = self.values.iter().map(|x| (x - mean).powi(2)).sum();

    (squares / (self.values.len() - 1) as f64).sqrt()
  }

  /// Inner loop count the framework calibrated, if recorded.
  pub fn loops(&self) -> Option<u64> {
    self.metadata.get("loops").and_then(Value::as_u64)
  }

  pub fn update_metadata(&mut self, key: &str, value: impl Into<Value>) {
    self.metadata.insert(key.to_string(), value.into());
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteMetadata {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub platform: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cpu_count: Option<usize>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub harness_version: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub interpreter: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub interpreter_version: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start_date: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub end_date: Option<DateTime<Utc>>,
  /// Keys written by benchmark frameworks that we carry along untouched.
  #[serde(flatten)]
  pub extra: BTreeMap<String, Value>,
}

/// Benchmark results for one interpreter, in insertion order with unique
/// names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Suite {
  #[serde(default)]
  pub metadata: SuiteMetadata,
  pub benchmarks: Vec<BenchmarkResult>,
}

impl Suite {
  pub fn get(&self, name: &str) -> Option<&BenchmarkResult> {
    self.benchmarks.iter().find(|result| result.name == name)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.benchmarks.iter().map(|result| result.name.as_str())
  }

  pub fn is_empty(&self) -> bool {
    self.benchmarks.is_empty()
  }

  pub fn harness_version(&self) -> &str {
    self.metadata.harness_version.as_deref().unwrap_or(NO_VERSION)
  }

  pub fn add(&mut self, result: BenchmarkResult) -> Result<()> {
    if self.get(&result.name).is_some() {
      anyhow::bail!("suite already contains a benchmark named {:?}", result.name);
    }
    self.benchmarks.push(result);

    Ok(())
  }

  /// Appends the values of `other` to same-named benchmarks, adding the
  /// benchmarks we don't have yet.
  pub fn merge_runs(&mut self, other: Suite) -> Result<()> {
    for result in other.benchmarks {
      match self.benchmarks.iter_mut().find(|existing| existing.name == result.name) {
        Some(existing) => {
          if existing.unit != result.unit {
            anyhow::bail!(
              "cannot merge {}: unit {:?} differs from {:?}",
              result.name,
              result.unit,
              existing.unit
            );
          }
          existing.values.extend(result.values);
          for (key, value) in result.metadata {
            existing.metadata.entry(key).or_insert(value);
          }
        }
        None => self.benchmarks.push(result),
      }
    }

    let start_dates = [self.metadata.start_date, other.metadata.start_date];
    self.metadata.start_date = start_dates.into_iter().flatten().min();
    let end_dates = [self.metadata.end_date, other.metadata.end_date];
    self.metadata.end_date = end_dates.into_iter().flatten().max();

    Ok(())
  }

  /// `loops` of every benchmark that recorded one.
  pub fn loops(&self) -> BTreeMap<String, u64> {
    self
      .benchmarks
      .iter()
      .filter_map(|result| Some((result.name.clone(), result.loops()?)))
      .collect()
  }

  pub fn parse(text: &str) -> Result<Self> {
    let suite: Suite = serde_json::from_str(text).context("deserialize")?;
    suite.validate()?;

    Ok(suite)
  }

  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;

    Self::parse(&text).with_context(|| format!("load result file {path:?}"))
  }

  fn validate(&self) -> Result<()> {
    let mut seen = HashSet::new();
    for result in &self.benchmarks {
      if !seen.insert(result.name.as_str()) {
        anyhow::bail!("duplicate benchmark {:?}", result.name);
      }
      if result.values.is_empty() {
        anyhow::bail!("benchmark {:?} has no values", result.name);
      }
      if result.values.iter().any(|value| !value.is_finite()) {
        anyhow::bail!("benchmark {:?} has non-finite values", result.name);
      }
    }

    Ok(())
  }

  fn to_json(&self) -> Result<String> {
    let mut json = serde_json::to_string_pretty(self).context("serialize")?;
    json.push('\n');

    Ok(json)
  }

  /// Writes the suite to a new file; fails if `path` already exists.
  pub fn dump<P: AsRef<Path>>(&self, path: P) -> Result<()> {
    let path = path.as_ref();
    let mut file = OpenOptions::new()
      .write(true)
      .create_new(true)
      .open(path)
      .with_context(|| format!("create {path:?}"))?;
    file.write_all(self.to_json()?.as_bytes()).context("write")?;

    Ok(())
  }

  /// Writes the suite to `path`, replacing any previous contents.
  pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, self.to_json()?).with_context(|| format!("write {path:?}"))
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;

  fn result(name: &str, values: &[f64]) -> BenchmarkResult {
    BenchmarkResult::new(name, Unit::Second, values.to_vec())
  }

  #[test]
  fn mean_and_stdev() {
    let r = result("a", &[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
    assert_eq!(r.mean(), 5.0);
    assert!((r.stdev() - 2.138_089_935).abs() < 1e-9);
    assert_eq!(result("b", &[1.5]).stdev(), 0.0);
  }

  #[test]
  fn parses_minimal_document() {
    let suite = Suite::parse(r#"{"benchmarks": [{"name": "x", "values": [1.0, 2.0], "metadata": {"loops": 8}}]}"#).unwrap();

    assert_eq!(suite.get("x").unwrap().unit, Unit::Second);
    assert_eq!(suite.get("x").unwrap().loops(), Some(8));
    assert_eq!(suite.harness_version(), NO_VERSION);
  }

  #[test]
  fn rejects_invalid_documents() {
    assert!(Suite::parse("{").is_err());
    assert!(Suite::parse(r#"{"benchmarks": [{"name": "x", "values": []}]}"#).is_err());
    assert!(Suite::parse(
      r#"{"benchmarks": [{"name": "x", "values": [1]}, {"name": "x", "values": [2]}]}"#
    )
    .is_err());
  }

  #[test]
  fn add_rejects_duplicates() {
    let mut suite = Suite::default();
    suite.add(result("a", &[1.0])).unwrap();
    assert!(suite.add(result("a", &[2.0])).is_err());
  }

  #[test]
  fn merge_appends_values() {
    let mut suite = Suite::default();
    suite.add(result("a", &[1.0])).unwrap();

    let mut other = Suite::default();
    other.add(result("a", &[2.0])).unwrap();
    other.add(result("b", &[3.0])).unwrap();

    suite.merge_runs(other).unwrap();
    assert_eq!(suite.get("a").unwrap().values, vec![1.0, 2.0]);
    assert_eq!(suite.names().collect::<Vec<_>>(), vec!["a", "b"]);
  }

  #[test]
  fn dump_refuses_existing_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("out.json");

    let mut suite = Suite::default();
    suite.metadata.harness_version = Some(HARNESS_VERSION.to_string());
    suite.metadata.extra.insert("hostname".to_string(), Value::from("box"));
    suite.add(result("a", &[1.0, 1.5])).unwrap();
    suite.dump(&path).unwrap();

    assert!(suite.dump(&path).is_err());
    assert_eq!(Suite::load(&path).unwrap(), suite);
  }
}
