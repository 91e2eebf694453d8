use std::{
  fmt::Write as _,
  fs,
  path::Path,
};

use anyhow::{Context, Result};
use clap::ValueEnum;

use crate::{
  compare::{Comparison, ComparisonResult, Significance},
  suite::{BenchmarkResult, Suite, SuiteMetadata, Unit},
};

const TIME_UNITS: [&str; 4] = ["sec", "ms", "us", "ns"];
const SIZE_UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];

const HIDDEN_HEADER: &str = "The following not significant results are hidden, use -v to show them:";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputStyle {
  #[default]
  Normal,
  Table,
}

/// Formats `values` with the unit scale picked for the first one, keeping
/// three significant digits of it.
pub fn format_values(unit: Unit, values: &[f64]) -> Vec<String> {
  let reference = values.first().copied().unwrap_or_default().abs();

  let (factor, precision, unit) = match unit {
    Unit::Second => {
      let exponent = (-9..=2).rev().find(|&i| reference >= 10f64.powi(i)).unwrap_or(-9);
      let scale = (-exponent.div_euclid(3)).clamp(0, 3);
      (10f64.powi(scale * 3), 2 - exponent.rem_euclid(3), TIME_UNITS[scale as usize])
    }
    Unit::Byte => {
      let exponent = (0..=11).rev().find(|&i| reference >= 10f64.powi(i)).unwrap_or(0);
      let scale = (exponent / 3).min(3);
      (10f64.powi(-scale * 3), 2 - exponent % 3, SIZE_UNITS[scale as usize])
    }
    Unit::Integer => return values.iter().map(|value| format!("{value:.0}")).collect(),
  };

  values
    .iter()
    .map(|value| format!("{:.*} {unit}", precision as usize, value * factor))
    .collect()
}

pub fn format_value(unit: Unit, value: f64) -> String {
  format_values(unit, &[value]).remove(0)
}

/// `Mean +- std dev: A +- B`, or the single value.
pub fn format_result(result: &BenchmarkResult) -> String {
  if result.values.len() >= 2 {
    let values = format_values(result.unit, &[result.mean(), result.stdev()]);
    format!("Mean +- std dev: {} +- {}", values[0], values[1])
  } else {
    format_value(result.unit, result.mean())
  }
}

/// The metadata block of a suite, headed by `title` when there is anything
/// to show.
pub fn format_suite_metadata(metadata: &SuiteMetadata, title: Option<&str>) -> Result<String> {
  let mut lines = Vec::new();

  if let Some(version) = &metadata.harness_version {
    lines.push(format!("Harness version: {version}"));
  }
  if let Some(version) = &metadata.interpreter_version {
    lines.push(format!("Interpreter version: {version}"));
  }
  if let Some(platform) = &metadata.platform {
    lines.push(format!("Report on {platform}"));
  }
  if let Some(cpu_count) = metadata.cpu_count {
    lines.push(format!("Number of logical CPUs: {cpu_count}"));
  }
  if let (Some(start), Some(end)) = (metadata.start_date, metadata.end_date) {
    lines.push(format!("Start date: {}", start.format("%Y-%m-%d %H:%M:%S")));
    lines.push(format!("End date: {}", end.format("%Y-%m-%d %H:%M:%S")));
  }

  let mut block = String::new();
  if lines.is_empty() {
    return Ok(block);
  }

  if let Some(title) = title {
    writeln!(block, "{title}")?;
    writeln!(block, "{}", "=".repeat(title.len()))?;
    writeln!(block)?;
  }
  for line in lines {
    writeln!(block, "{line}")?;
  }
  writeln!(block)?;

  Ok(block)
}

/// What `show` prints for a result file.
pub fn format_suite(suite: &Suite) -> Result<String> {
  let mut out = format_suite_metadata(&suite.metadata, None)?;

  for result in &suite.benchmarks {
    writeln!(out, "### {} ###", result.name)?;
    writeln!(out, "{}", format_result(result))?;
    writeln!(out)?;
  }

  Ok(out)
}

fn format_comparison(result: &ComparisonResult) -> String {
  let (base, changed) = (result.base, result.changed);

  if base.values.len() > 1 {
    let values = format_values(base.unit, &[base.mean(), base.stdev(), changed.mean(), changed.stdev()]);
    format!(
      "Mean +- std dev: {} +- {} -> {} +- {}: {}\n{}",
      values[0],
      values[1],
      values[2],
      values[3],
      result.delta(),
      result.significance()
    )
  } else {
    format!(
      "{} -> {}: {}",
      format_value(base.unit, base.mean()),
      format_value(base.unit, changed.mean()),
      result.delta()
    )
  }
}

fn format_normal(shown: &[&ComparisonResult]) -> Result<String> {
  let mut out = String::new();

  for (index, result) in shown.iter().enumerate() {
    if index > 0 {
      writeln!(out)?;
    }
    writeln!(out, "### {} ###", result.name())?;
    writeln!(out, "{}", format_comparison(result))?;
  }

  Ok(out)
}

/// Renders rows as a bordered ASCII table. The first row is the header.
/// Columns with no value in any other row are left out; missing cells are
/// blank.
fn format_rows(rows: &[Vec<Option<String>>]) -> Result<String> {
  let columns = rows.first().map_or(0, Vec::len);
  let kept: Vec<usize> = (0..columns)
    .filter(|&col| rows.len() < 2 || rows[1..].iter().any(|row| row[col].is_some()))
    .collect();
  let widths: Vec<usize> = kept
    .iter()
    .map(|&col| rows.iter().filter_map(|row| row[col].as_deref()).map(str::len).max().unwrap_or(0))
    .collect();

  let line = |fill: &str| {
    let mut line = "+".to_string();
    for width in &widths {
      line.push_str(&fill.repeat(width + 2));
      line.push('+');
    }
    line
  };
  let outside = line("-");

  let mut table = String::new();
  writeln!(table, "{outside}")?;
  for (index, row) in rows.iter().enumerate() {
    for (&col, &width) in kept.iter().zip(&widths) {
      write!(table, "| {:<width$} ", row[col].as_deref().unwrap_or_default())?;
    }
    writeln!(table, "|")?;

    if index == 0 {
      writeln!(table, "{}", line("="))?;
    } else {
      writeln!(table, "{outside}")?;
    }
  }

  Ok(table)
}

fn format_table(base_label: &str, changed_label: &str, shown: &[&ComparisonResult]) -> Result<String> {
  let header = ["Benchmark", base_label, changed_label, "Change", "Significance"];
  let mut rows = vec![header.iter().map(|cell| Some(cell.to_string())).collect::<Vec<_>>()];

  for result in shown {
    let significance = match result.significance() {
      Significance::Incomparable { .. } => None,
      significance => Some(significance.to_string()),
    };
    rows.push(vec![
      Some(result.name().to_string()),
      Some(format_value(result.base.unit, result.base.mean())),
      Some(format_value(result.changed.unit, result.changed.mean())),
      Some(result.delta().to_string()),
      significance,
    ]);
  }

  format_rows(&rows)
}

/// Short labels for two result files: basenames, or the full paths when the
/// basenames are the same.
pub fn labels(base: &Path, changed: &Path) -> (String, String) {
  let base_name = base.file_name().map(|name| name.to_string_lossy().into_owned());
  let changed_name = changed.file_name().map(|name| name.to_string_lossy().into_owned());

  match (base_name, changed_name) {
    (Some(base_name), Some(changed_name)) if base_name != changed_name => (base_name, changed_name),
    _ => (base.display().to_string(), changed.display().to_string()),
  }
}

pub struct Report<'a> {
  pub base: &'a Suite,
  pub changed: &'a Suite,
  pub comparison: &'a Comparison<'a>,
  pub base_label: &'a str,
  pub changed_label: &'a str,
  pub style: OutputStyle,
  pub verbose: bool,
}

impl Report<'_> {
  pub fn format(&self) -> Result<String> {
    let (shown, hidden): (Vec<&ComparisonResult>, Vec<&ComparisonResult>) = self
      .comparison
      .results
      .iter()
      .partition(|result| self.verbose || result.significance() != Significance::NotSignificant);

    let mut out = String::new();
    out.push_str(&format_suite_metadata(&self.base.metadata, Some(self.base_label))?);
    out.push_str(&format_suite_metadata(&self.changed.metadata, Some(self.changed_label))?);

    match self.style {
      OutputStyle::Normal => out.push_str(&format_normal(&shown)?),
      OutputStyle::Table if !shown.is_empty() => {
        out.push_str(&format_table(self.base_label, self.changed_label, &shown)?)
      }
      OutputStyle::Table => {}
    }

    if !hidden.is_empty() {
      let names: Vec<&str> = hidden.iter().map(|result| result.name()).collect();
      writeln!(out)?;
      writeln!(out, "{HIDDEN_HEADER}")?;
      writeln!(out, "{}.", names.join(", "))?;
    }

    for (only, label) in [
      (&self.comparison.only_base, self.base_label),
      (&self.comparison.only_changed, self.changed_label),
    ] {
      if !only.is_empty() {
        writeln!(out)?;
        writeln!(out, "Skipped {} benchmarks only in {label}: {}", only.len(), only.join(", "))?;
      }
    }

    Ok(out)
  }
}

/// CSV cell value: at least three significant digits without a long tail of
/// zeros.
pub fn format_csv(value: f64) -> String {
  let abs = value.abs();

  if abs >= 1.0 {
    format!("{value:.2}")
  } else if abs >= 1e-3 {
    format!("{value:.5}")
  } else if abs >= 1e-6 {
    format!("{value:.8}")
  } else {
    let formatted = format!("{value:.11}");
    let trimmed = formatted.trim_end_matches('0');
    if trimmed.ends_with('.') {
      format!("{trimmed}0")
    } else {
      trimmed.to_string()
    }
  }
}

fn csv_field(field: &str) -> String {
  if field.contains([',', '"', '\n', '\r']) {
    format!("\"{}\"", field.replace('"', "\"\""))
  } else {
    field.to_string()
  }
}

pub fn format_csv_rows(comparison: &Comparison) -> String {
  let mut csv = String::from("Benchmark,Base,Changed\r\n");
  for result in &comparison.results {
    csv.push_str(&format!(
      "{},{},{}\r\n",
      csv_field(result.name()),
      format_csv(result.base.mean()),
      format_csv(result.changed.mean())
    ));
  }

  csv
}

pub fn write_csv<P: AsRef<Path>>(path: P, comparison: &Comparison) -> Result<()> {
  let path = path.as_ref();
  fs::write(path, format_csv_rows(comparison)).with_context(|| format!("write {path:?}"))
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};
  use pretty_assertions::assert_eq;

  use super::*;
  use crate::{
    compare::compare_suites,
    suite::HARNESS_VERSION,
  };

  #[test]
  fn csv_values() {
    assert_eq!(format_csv(1.2345), "1.23");
    assert_eq!(format_csv(0.0012345), "0.00123");
    assert_eq!(format_csv(0.0000012345), "0.00000123");
    assert_eq!(format_csv(1.2e-7), "0.00000012");
    assert_eq!(format_csv(0.0), "0.0");
  }

  #[test]
  fn time_values_share_a_unit() {
    assert_eq!(format_values(Unit::Second, &[1.5, 0.01]), vec!["1.50 sec", "0.01 sec"]);
    assert_eq!(format_value(Unit::Second, 0.0123), "12.3 ms");
    assert_eq!(format_value(Unit::Second, 0.000123), "123 us");
    assert_eq!(format_value(Unit::Second, 4.56e-9), "4.56 ns");
    assert_eq!(format_value(Unit::Second, 250.0), "250 sec");
  }

  #[test]
  fn size_values() {
    assert_eq!(format_value(Unit::Byte, 512.0), "512 B");
    assert_eq!(format_value(Unit::Byte, 12_345.0), "12.3 kB");
    assert_eq!(format_value(Unit::Byte, 1_500_000_000.0), "1.50 GB");
    assert_eq!(format_value(Unit::Integer, 42.0), "42");
  }

  #[test]
  fn labels_fall_back_to_paths() {
    assert_eq!(
      labels(Path::new("a/base.json"), Path::new("b/changed.json")),
      ("base.json".to_string(), "changed.json".to_string())
    );
    assert_eq!(
      labels(Path::new("a/out.json"), Path::new("b/out.json")),
      ("a/out.json".to_string(), "b/out.json".to_string())
    );
  }

  #[test]
  fn metadata_block() {
    let metadata = SuiteMetadata {
      platform: Some("Linux-6.1-x86_64".to_string()),
      cpu_count: Some(8),
      start_date: Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()),
      end_date: Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap()),
      ..Default::default()
    };

    assert_eq!(
      format_suite_metadata(&metadata, Some("base.json")).unwrap(),
      "base.json\n=========\n\nReport on Linux-6.1-x86_64\nNumber of logical CPUs: 8\n\
       Start date: 2024-05-01 10:00:00\nEnd date: 2024-05-01 10:30:00\n\n"
    );
    assert_eq!(format_suite_metadata(&SuiteMetadata::default(), Some("x")).unwrap(), "");
  }

  fn suite(results: &[(&str, &[f64])]) -> Suite {
    let mut suite = Suite::default();
    suite.metadata.harness_version = Some(HARNESS_VERSION.to_string());
    for (name, values) in results {
      suite.add(BenchmarkResult::new(*name, Unit::Second, values.to_vec())).unwrap();
    }
    suite
  }

  fn report(base: &Suite, changed: &Suite, style: OutputStyle, verbose: bool) -> String {
    let comparison = compare_suites(base, changed).unwrap();
    Report {
      base,
      changed,
      comparison: &comparison,
      base_label: "base.json",
      changed_label: "changed.json",
      style,
      verbose,
    }
    .format()
    .unwrap()
  }

  #[test]
  fn normal_report_hides_insignificant_results() {
    let base = suite(&[
      ("fast", &[1.00, 1.01, 0.99, 1.00]),
      ("same", &[2.0, 2.1, 1.9, 2.0]),
      ("gone", &[1.0, 1.0, 1.0, 1.0]),
    ]);
    let changed = suite(&[("fast", &[0.50, 0.51, 0.49, 0.50]), ("same", &[2.0, 2.1, 1.9, 2.0])]);

    let out = report(&base, &changed, OutputStyle::Normal, false);
    assert!(out.contains("### fast ###\nMean +- std dev: 1.00 sec +- 0.01 sec -> 0.50 sec +- 0.01 sec: 2.00x faster\nSignificant (t="), "{out}");
    assert!(!out.contains("### same ###"), "{out}");
    assert!(out.contains(&format!("{HIDDEN_HEADER}\nsame.\n")), "{out}");
    assert!(out.ends_with("\nSkipped 1 benchmarks only in base.json: gone\n"), "{out}");

    let verbose = report(&base, &changed, OutputStyle::Normal, true);
    assert!(verbose.contains("### same ###\nMean +- std dev: 2.00 sec +- 0.08 sec -> 2.00 sec +- 0.08 sec: no change\nNot significant\n"), "{verbose}");
    assert!(!verbose.contains(HIDDEN_HEADER));
  }

  #[test]
  fn table_report() {
    let base = suite(&[("a", &[1.0, 1.0, 1.0]), ("b", &[2.0, 2.0, 2.0])]);
    let changed = suite(&[("a", &[1.0, 1.0, 1.0]), ("b", &[2.02, 2.02, 2.02])]);

    let out = report(&base, &changed, OutputStyle::Table, true);
    let table: Vec<&str> = out.lines().skip_while(|line| !line.starts_with('+')).collect();
    assert_eq!(
      table,
      vec![
        "+-----------+-----------+--------------+--------------+-----------------+",
        "| Benchmark | base.json | changed.json | Change       | Significance    |",
        "+===========+===========+==============+==============+=================+",
        "| a         | 1.00 sec  | 1.00 sec     | no change    | Not significant |",
        "+-----------+-----------+--------------+--------------+-----------------+",
        "| b         | 2.00 sec  | 2.02 sec     | 1.01x slower | Not significant |",
        "+-----------+-----------+--------------+--------------+-----------------+",
      ]
    );
  }

  #[test]
  fn table_drops_significance_for_single_samples() {
    let base = suite(&[("a", &[1.0])]);
    let changed = suite(&[("a", &[2.0])]);

    let out = report(&base, &changed, OutputStyle::Table, false);
    let table: Vec<&str> = out.lines().skip_while(|line| !line.starts_with('+')).collect();
    assert_eq!(
      table,
      vec![
        "+-----------+-----------+--------------+--------------+",
        "| Benchmark | base.json | changed.json | Change       |",
        "+===========+===========+==============+==============+",
        "| a         | 1.00 sec  | 2.00 sec     | 2.00x slower |",
        "+-----------+-----------+--------------+--------------+",
      ]
    );
  }

  #[test]
  fn table_keeps_significance_when_some_rows_have_it() {
    let base = suite(&[("multi", &[1.0, 1.01, 0.99, 1.0]), ("single", &[1.0])]);
    let changed = suite(&[("multi", &[2.0, 2.01, 1.99, 2.0]), ("single", &[2.0])]);

    let out = report(&base, &changed, OutputStyle::Table, false);
    let table: Vec<&str> = out.lines().skip_while(|line| !line.starts_with('+')).collect();
    assert_eq!(
      table,
      vec![
        "+-----------+-----------+--------------+--------------+-------------------------+",
        "| Benchmark | base.json | changed.json | Change       | Significance            |",
        "+===========+===========+==============+==============+=========================+",
        "| multi     | 1.00 sec  | 2.00 sec     | 2.00x slower | Significant (t=-173.21) |",
        "+-----------+-----------+--------------+--------------+-------------------------+",
        "| single    | 1.00 sec  | 2.00 sec     | 2.00x slower |                         |",
        "+-----------+-----------+--------------+--------------+-------------------------+",
      ]
    );
  }

  #[test]
  fn csv_export() {
    let base = suite(&[("a", &[1.0, 2.0]), ("b,c", &[0.0012345, 0.0012345])]);
    let comparison = compare_suites(&base, &base).unwrap();

    assert_eq!(
      format_csv_rows(&comparison),
      "Benchmark,Base,Changed\r\na,1.50,1.50\r\n\"b,c\",0.00123,0.00123\r\n"
    );
  }
}
