use std::{
  collections::BTreeSet,
  io::{self, Write},
  process::Stdio,
};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;

use crate::{
  config::Session,
  ext::{CommandExt, ExitStatusExt},
  interpreter::Interpreter,
  interrupt,
  manifest::Manifest,
  run::{self, Affinity, RunError, RunOptions},
  suite::{Suite, HARNESS_VERSION},
};

/// A benchmark that did not produce results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
  pub name: String,
  pub interpreter: String,
  pub reason: String,
}

/// Results of one `run`: a suite per interpreter and the failed benchmarks.
#[derive(Debug, Default)]
pub struct RunOutcome {
  pub base: Suite,
  pub changed: Option<Suite>,
  pub failures: Vec<Failure>,
}

impl RunOutcome {
  pub fn is_empty(&self) -> bool {
    self.base.is_empty() && self.changed.as_ref().map_or(true, Suite::is_empty)
  }

  /// Names of failed benchmarks, each once.
  pub fn failed_names(&self) -> BTreeSet<&str> {
    self.failures.iter().map(|failure| failure.name.as_str()).collect()
  }
}

pub struct Bench<'a> {
  manifest: &'a Manifest,
  base: Interpreter,
  changed: Option<Interpreter>,
  options: RunOptions,
}

impl<'a> Bench<'a> {
  pub fn new(manifest: &'a Manifest, base: Interpreter, changed: Option<Interpreter>, options: RunOptions) -> Self {
    Self {
      manifest,
      base,
      changed,
      options,
    }
  }

  /// Runs `selected` one benchmark at a time, in name order. With two
  /// interpreters the changed one runs first for every benchmark.
  pub fn run(&self, selected: &BTreeSet<String>, session: &mut Session) -> Result<RunOutcome> {
    if let Some(affinity) = &self.options.affinity {
      check_affinity(affinity, &self.base).context("check CPU affinity")?;
      if let Some(changed) = &self.changed {
        check_affinity(affinity, changed).context("check CPU affinity")?;
      }
    }

    let mut outcome = RunOutcome {
      changed: self.changed.as_ref().map(|_| Suite::default()),
      ..Default::default()
    };
    let start_date = Utc::now();

    let total = selected.len().to_string();
    for (index, name) in selected.iter().enumerate() {
      if interrupt::is_interrupted() {
        return Err(RunError::Interrupted.into());
      }
      println!("[{:>width$}/{total}] {name}...", index + 1, width = total.len());
      io::stdout().flush().context("flush stdout")?;

      if let (Some(changed), Some(suite)) = (&self.changed, &mut outcome.changed) {
        self.run_one(name, changed, suite, &mut outcome.failures)?;
      }
      self.run_one(name, &self.base, &mut outcome.base, &mut outcome.failures)?;
    }
    println!();

    let end_date = Utc::now();
    fill_metadata(&mut outcome.base, &self.base, session, start_date, end_date);
    if let (Some(changed), Some(suite)) = (&self.changed, &mut outcome.changed) {
      fill_metadata(suite, changed, session, start_date, end_date);
    }

    Ok(outcome)
  }

  fn run_one(&self, name: &str, interpreter: &Interpreter, suite: &mut Suite, failures: &mut Vec<Failure>) -> Result<()> {
    let bench = self
      .manifest
      .benchmark(name)
      .with_context(|| format!("unknown benchmark {name}"))?;
    let run_id = run::run_id(interpreter, name);
    tracing::debug!(%run_id, %interpreter, "running benchmark {name}");

    let result = run::run_benchmark(bench, interpreter, &self.options, &run_id).and_then(|results| {
      let tags: Vec<Value> = bench.tags()?.iter().cloned().map(Value::from).collect();
      for mut result in results.benchmarks {
        result.update_metadata("harness_version", HARNESS_VERSION);
        result.update_metadata("tags", tags.clone());
        suite.add(result)?;
      }

      Ok(())
    });

    match result {
      Ok(()) => {}
      Err(RunError::Interrupted) => return Err(RunError::Interrupted.into()),
      Err(RunError::Failed { reason, stderr }) => {
        if let Some(stderr) = stderr.filter(|stderr| !stderr.is_empty()) {
          eprint!("{stderr}");
        }
        println!("ERROR: Benchmark {name} failed: {reason}");
        failures.push(Failure {
          name: name.to_string(),
          interpreter: interpreter.to_string(),
          reason,
        });
      }
    }

    Ok(())
  }
}

/// Runs `<tool> --cpu-list 0 <interpreter> --version` so a missing or broken
/// pinning tool is reported before any benchmark runs.
fn check_affinity(affinity: &Affinity, interpreter: &Interpreter) -> Result<()> {
  let probe = Affinity {
    tool: affinity.tool.clone(),
    cpu_list: "0".to_string(),
  };
  let mut command = probe.command(interpreter);
  command
    .arg("--version")
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null());

  let status = match command.status() {
    Ok(status) => status,
    Err(err) if err.kind() == io::ErrorKind::NotFound => {
      anyhow::bail!("command {:?} not found, unable to pin CPUs", affinity.tool)
    }
    Err(err) => return Err(err).with_context(|| format!("spawn {}", command.command_line())),
  };

  status
    .check_success()
    .with_context(|| format!("{} failed", command.command_line()))
}

fn fill_metadata(
  suite: &mut Suite,
  interpreter: &Interpreter,
  session: &mut Session,
  start_date: chrono::DateTime<Utc>,
  end_date: chrono::DateTime<Utc>,
) {
  let metadata = &mut suite.metadata;
  metadata.platform = Some(format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH));
  metadata.cpu_count = std::thread::available_parallelism().ok().map(usize::from);
  metadata.harness_version = Some(HARNESS_VERSION.to_string());
  metadata.interpreter = Some(interpreter.to_string());
  metadata.interpreter_version = match session.versions.get(interpreter) {
    Ok(version) => Some(version.to_string()),
    Err(err) => {
      tracing::debug!("no version for {interpreter}: {err:#}");
      None
    }
  };
  metadata.start_date = Some(start_date);
  metadata.end_date = Some(end_date);
}
