//! Two-sample significance testing between a base and a changed suite.

use std::{collections::BTreeSet, fmt};

use crate::suite::{BenchmarkResult, Suite, Unit, NO_VERSION};

/// Two-tailed 95% critical values of Student's t distribution, indexed by
/// degrees of freedom.
const T_DIST_95: [f64; 31] = [
  0.0, 12.706, 4.303, 3.182, 2.776, 2.571, 2.447, 2.365, 2.306, 2.262, 2.228, 2.201, 2.179, 2.160, 2.145, 2.131, 2.120,
  2.110, 2.101, 2.093, 2.086, 2.080, 2.074, 2.069, 2.064, 2.060, 2.056, 2.052, 2.048, 2.045, 2.042,
];

/// Differences of less than this fraction of the means are never significant.
const NOISE_FLOOR: f64 = 0.01;

const SINGLE_SAMPLE: &str = "benchmark only contains a single sample";
const NO_VARIANCE: &str = "samples have no variance";

#[derive(Debug, thiserror::Error)]
pub enum CompareError {
  #[error("not the same benchmark: {0} != {1}")]
  NameMismatch(String, String),
  #[error("base and changed don't have the same number of values for {name} ({base} != {changed})")]
  SampleCountMismatch { name: String, base: usize, changed: usize },
  #[error("different number of values")]
  DifferentLengths,
  #[error("Harness versions are different: {base} != {changed}")]
  VersionMismatch { base: String, changed: String },
}

/// Critical value for a two-tailed test at 95% confidence.
pub fn tdist95_critical(df: usize) -> f64 {
  if df >= 200 {
    1.960
  } else if df >= 100 {
    1.984
  } else if df >= 80 {
    1.990
  } else if df >= 60 {
    2.000
  } else if df >= 50 {
    2.009
  } else if df >= 40 {
    2.021
  } else {
    T_DIST_95[df.min(T_DIST_95.len() - 1)]
  }
}

fn mean(sample: &[f64]) -> f64 {
  sample.iter().sum::<f64>() / sample.len() as f64
}

fn sum_of_squares(sample: &[f64]) -> f64 {
  let mean = mean(sample);
  sample.iter().map(|x| (x - mean).powi(2)).sum()
}

pub fn pooled_sample_variance(a: &[f64], b: &[f64]) -> f64 {
  let df = (a.len() + b.len()) as f64 - 2.0;
  (sum_of_squares(a) + sum_of_squares(b)) / df
}

fn t_statistic(a: &[f64], b: &[f64]) -> f64 {
  let error = pooled_sample_variance(a, b) / a.len() as f64;
  (mean(a) - mean(b)) / (error * 2.0).sqrt()
}

/// Two-sample t score of equally sized samples.
pub fn tscore(a: &[f64], b: &[f64]) -> Result<f64, CompareError> {
  if a.len() != b.len() {
    return Err(CompareError::DifferentLengths);
  }

  Ok(t_statistic(a, b))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Significance {
  Significant { t: f64 },
  NotSignificant,
  Incomparable { reason: &'static str },
}

impl fmt::Display for Significance {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Significance::Significant { t } => write!(f, "Significant (t={t:.2})"),
      Significance::NotSignificant => write!(f, "Not significant"),
      Significance::Incomparable { reason } => write!(f, "({reason})"),
    }
  }
}

/// Change of the changed mean relative to the base mean.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delta {
  Slower(f64),
  Faster(f64),
  Larger(f64),
  Smaller(f64),
  NoChange,
  Incomparable,
}

impl Delta {
  pub fn new(old: f64, new: f64, unit: Unit) -> Self {
    let is_time = unit == Unit::Second;

    if old == 0.0 || new == 0.0 {
      Delta::Incomparable
    } else if new > old {
      if is_time {
        Delta::Slower(new / old)
      } else {
        Delta::Larger(new / old)
      }
    } else if new < old {
      if is_time {
        Delta::Faster(old / new)
      } else {
        Delta::Smaller(old / new)
      }
    } else {
      Delta::NoChange
    }
  }
}

impl fmt::Display for Delta {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Delta::Slower(ratio) => write!(f, "{ratio:.2}x slower"),
      Delta::Faster(ratio) => write!(f, "{ratio:.2}x faster"),
      Delta::Larger(ratio) => write!(f, "{ratio:.2}x larger"),
      Delta::Smaller(ratio) => write!(f, "{ratio:.2}x smaller"),
      Delta::NoChange => write!(f, "no change"),
      Delta::Incomparable => write!(f, "incomparable (one result was zero)"),
    }
  }
}

/// A base and a changed result of the same benchmark.
#[derive(Debug, Clone, Copy)]
pub struct ComparisonResult<'a> {
  pub base: &'a BenchmarkResult,
  pub changed: &'a BenchmarkResult,
}

impl<'a> ComparisonResult<'a> {
  pub fn new(base: &'a BenchmarkResult, changed: &'a BenchmarkResult) -> Result<Self, CompareError> {
    if base.name != changed.name {
      return Err(CompareError::NameMismatch(base.name.clone(), changed.name.clone()));
    }
    if base.values.len() != changed.values.len() {
      return Err(CompareError::SampleCountMismatch {
        name: base.name.clone(),
        base: base.values.len(),
        changed: changed.values.len(),
      });
    }

    Ok(Self { base, changed })
  }

  pub fn name(&self) -> &'a str {
    &self.base.name
  }

  pub fn is_single_sample(&self) -> bool {
    self.base.values.len() < 2 || self.changed.values.len() < 2
  }

  pub fn delta(&self) -> Delta {
    Delta::new(self.base.mean(), self.changed.mean(), self.base.unit)
  }

  pub fn significance(&self) -> Significance {
    if self.is_single_sample() {
      return Significance::Incomparable { reason: SINGLE_SAMPLE };
    }

    let base = self.base.mean();
    let changed = self.changed.mean();
    if (base - changed).abs() <= (base + changed) * NOISE_FLOOR {
      return Significance::NotSignificant;
    }

    if pooled_sample_variance(&self.base.values, &self.changed.values) == 0.0 {
      return Significance::Incomparable { reason: NO_VARIANCE };
    }

    let df = self.base.values.len() + self.changed.values.len() - 2;
    let t = t_statistic(&self.base.values, &self.changed.values);
    if t.abs() >= tdist95_critical(df) {
      Significance::Significant { t }
    } else {
      Significance::NotSignificant
    }
  }
}

/// The benchmarks two suites have in common, sorted by name, and those only
/// one of them has.
#[derive(Debug)]
pub struct Comparison<'a> {
  pub results: Vec<ComparisonResult<'a>>,
  pub only_base: Vec<&'a str>,
  pub only_changed: Vec<&'a str>,
}

/// Both suites must carry the same, known harness version.
pub fn check_harness_versions(base: &Suite, changed: &Suite) -> Result<(), CompareError> {
  let (base, changed) = (base.harness_version(), changed.harness_version());
  if base != changed || base == NO_VERSION {
    return Err(CompareError::VersionMismatch {
      base: base.to_string(),
      changed: changed.to_string(),
    });
  }

  Ok(())
}

pub fn compare_suites<'a>(base: &'a Suite, changed: &'a Suite) -> Result<Comparison<'a>, CompareError> {
  let base_names: BTreeSet<&str> = base.names().collect();
  let changed_names: BTreeSet<&str> = changed.names().collect();

  let mut results = Vec::new();
  for name in base_names.intersection(&changed_names) {
    if let (Some(b), Some(c)) = (base.get(name), changed.get(name)) {
      results.push(ComparisonResult::new(b, c)?);
    }
  }

  Ok(Comparison {
    results,
    only_base: base_names.difference(&changed_names).copied().collect(),
    only_changed: changed_names.difference(&base_names).copied().collect(),
  })
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;
  use crate::suite::HARNESS_VERSION;

  fn result(name: &str, values: &[f64]) -> BenchmarkResult {
    BenchmarkResult::new(name, Unit::Second, values.to_vec())
  }

  fn suite(results: &[BenchmarkResult]) -> Suite {
    let mut suite = Suite::default();
    suite.metadata.harness_version = Some(HARNESS_VERSION.to_string());
    for r in results {
      suite.add(r.clone()).unwrap();
    }
    suite
  }

  #[test]
  fn critical_values() {
    assert_eq!(tdist95_critical(1), 12.706);
    assert_eq!(tdist95_critical(10), 2.228);
    assert_eq!(tdist95_critical(30), 2.042);
    assert_eq!(tdist95_critical(35), 2.042);
    assert_eq!(tdist95_critical(40), 2.021);
    assert_eq!(tdist95_critical(55), 2.009);
    assert_eq!(tdist95_critical(99), 1.990);
    assert_eq!(tdist95_critical(150), 1.984);
    assert_eq!(tdist95_critical(1000), 1.960);
  }

  #[test]
  fn identical_means_give_zero_t() {
    let a = [1.0, 2.0, 3.0];
    let b = [3.0, 1.0, 2.0];
    assert_eq!(tscore(&a, &b).unwrap(), 0.0);
    assert_eq!(pooled_sample_variance(&a, &b), 1.0);

    let (base, changed) = (result("x", &a), result("x", &b));
    let cmp = ComparisonResult::new(&base, &changed).unwrap();
    assert_eq!(cmp.significance(), Significance::NotSignificant);
  }

  #[test]
  fn tscore_requires_equal_lengths() {
    assert!(matches!(tscore(&[1.0], &[1.0, 2.0]), Err(CompareError::DifferentLengths)));
  }

  #[test]
  fn clear_slowdown_is_significant() {
    let base = result("x", &[1.00, 1.01, 0.99, 1.00, 1.02]);
    let changed = result("x", &[1.50, 1.52, 1.49, 1.51, 1.50]);
    let cmp = ComparisonResult::new(&base, &changed).unwrap();

    match cmp.significance() {
      Significance::Significant { t } => assert!(t < -2.306, "{t}"),
      other => panic!("unexpected {other:?}"),
    }
    assert_eq!(cmp.delta().to_string(), "1.50x slower");
  }

  #[test]
  fn small_differences_are_noise() {
    let base = result("x", &[1.000, 1.001, 1.000, 1.001]);
    let changed = result("x", &[1.005, 1.006, 1.005, 1.006]);
    let cmp = ComparisonResult::new(&base, &changed).unwrap();
    assert_eq!(cmp.significance(), Significance::NotSignificant);
  }

  #[test]
  fn single_sample() {
    let (base, changed) = (result("x", &[2.0]), result("x", &[1.0]));
    let cmp = ComparisonResult::new(&base, &changed).unwrap();

    assert_eq!(cmp.significance().to_string(), "(benchmark only contains a single sample)");
    assert_eq!(cmp.delta().to_string(), "2.00x faster");
  }

  #[test]
  fn constant_samples_have_no_t_score() {
    let (base, changed) = (result("x", &[1.0, 1.0, 1.0]), result("x", &[2.0, 2.0, 2.0]));
    let cmp = ComparisonResult::new(&base, &changed).unwrap();

    assert_eq!(cmp.significance(), Significance::Incomparable { reason: NO_VARIANCE });
    assert_eq!(cmp.significance().to_string(), "(samples have no variance)");
    assert_eq!(cmp.delta().to_string(), "2.00x slower");

    let same = result("x", &[1.0, 1.0, 1.0]);
    let cmp = ComparisonResult::new(&base, &same).unwrap();
    assert_eq!(cmp.significance(), Significance::NotSignificant);
  }

  #[test]
  fn deltas() {
    assert_eq!(Delta::new(2.0, 3.0, Unit::Byte).to_string(), "1.50x larger");
    assert_eq!(Delta::new(3.0, 2.0, Unit::Byte).to_string(), "1.50x smaller");
    assert_eq!(Delta::new(0.0, 2.0, Unit::Second).to_string(), "incomparable (one result was zero)");
    assert_eq!(Delta::new(2.0, 2.0, Unit::Second), Delta::NoChange);
  }

  #[test]
  fn preconditions() {
    let (a, b) = (result("a", &[1.0, 2.0]), result("b", &[1.0, 2.0]));
    assert!(matches!(ComparisonResult::new(&a, &b), Err(CompareError::NameMismatch(..))));

    let short = result("a", &[1.0]);
    assert!(matches!(
      ComparisonResult::new(&a, &short),
      Err(CompareError::SampleCountMismatch { .. })
    ));
  }

  #[test]
  fn self_comparison_has_no_change() {
    let suite = suite(&[result("a", &[1.0, 1.2, 0.9]), result("b", &[5.0, 5.5, 4.5])]);
    let comparison = compare_suites(&suite, &suite).unwrap();

    assert_eq!(comparison.results.len(), 2);
    for cmp in &comparison.results {
      assert_eq!(cmp.significance(), Significance::NotSignificant);
      assert_eq!(cmp.delta(), Delta::NoChange);
    }
  }

  #[test]
  fn names_only_in_one_suite() {
    let base = suite(&[result("a", &[1.0]), result("b", &[1.0])]);
    let changed = suite(&[result("b", &[1.0]), result("c", &[1.0]), result("d", &[1.0])]);
    let comparison = compare_suites(&base, &changed).unwrap();

    assert_eq!(comparison.results.iter().map(|r| r.name()).collect::<Vec<_>>(), vec!["b"]);
    assert_eq!(comparison.only_base, vec!["a"]);
    assert_eq!(comparison.only_changed, vec!["c", "d"]);
  }

  #[test]
  fn harness_versions() {
    let mut base = suite(&[]);
    let mut changed = suite(&[]);
    assert!(check_harness_versions(&base, &changed).is_ok());

    changed.metadata.harness_version = Some("0.0.1".to_string());
    let err = check_harness_versions(&base, &changed).unwrap_err();
    assert_eq!(err.to_string(), format!("Harness versions are different: {HARNESS_VERSION} != 0.0.1"));

    base.metadata.harness_version = None;
    changed.metadata.harness_version = None;
    assert!(check_harness_versions(&base, &changed).is_err());
  }
}
