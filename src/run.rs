use std::{
  collections::BTreeMap,
  env,
  ffi::OsString,
  path::{Path, PathBuf},
  process::{Command, Stdio},
  time::{Duration, Instant},
};

use anyhow::Context;
use tempfile::TempDir;

use crate::{
  benchmark::Benchmark,
  ext::{ChildExt, ChildStderrExt, CommandExt, ExitStatusExt, Stopped},
  interpreter::Interpreter,
  interrupt,
  suite::Suite,
};

/// Environment variable carrying the run id into every benchmark process.
pub const RUN_ID_ENV: &str = "INTERP_BENCH_RUNID";

/// Variables a benchmark process sees without `--inherit-environ`.
const CHILD_ENV: &[&str] = &["PATH", "HOME", "TMPDIR", "TEMP", "TMP", "LANG", "LC_ALL", "LC_CTYPE"];

const RESULT_FILE: &str = "result.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
  #[default]
  Default,
  Fast,
  Rigorous,
  DebugSingleValue,
}

impl RunMode {
  /// The most thorough flag wins over faster ones, except that a single
  /// debug value beats everything.
  pub fn from_flags(debug_single_value: bool, rigorous: bool, fast: bool) -> Self {
    if debug_single_value {
      RunMode::DebugSingleValue
    } else if rigorous {
      RunMode::Rigorous
    } else if fast {
      RunMode::Fast
    } else {
      RunMode::Default
    }
  }

  pub fn flag(self) -> Option<&'static str> {
    match self {
      RunMode::Default => None,
      RunMode::Fast => Some("--fast"),
      RunMode::Rigorous => Some("--rigorous"),
      RunMode::DebugSingleValue => Some("--debug-single-value"),
    }
  }
}

/// External CPU pinning: `<tool> --cpu-list <cpus> <command...>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Affinity {
  pub tool: PathBuf,
  pub cpu_list: String,
}

impl Affinity {
  pub fn command(&self, interpreter: &Interpreter) -> Command {
    let mut command = Command::new(&self.tool);
    command
      .arg("--cpu-list")
      .arg(&self.cpu_list)
      .arg(&interpreter.program)
      .args(&interpreter.args);

    command
  }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
  pub mode: RunMode,
  pub verbose: bool,
  pub track_memory: bool,
  pub inherit_environ: Vec<String>,
  pub min_time: Option<f64>,
  /// Seconds. Forwarded to the framework and enforced as a hard deadline.
  pub timeout: Option<u64>,
  pub affinity: Option<Affinity>,
  /// Loop counts per benchmark, from `--same-loops`.
  pub loops: BTreeMap<String, u64>,
}

impl RunOptions {
  /// Options forwarded to the benchmark framework for `bench`.
  pub fn framework_opts(&self, bench: &str) -> Vec<String> {
    let mut opts: Vec<String> = self.mode.flag().map(String::from).into_iter().collect();

    if self.verbose {
      opts.push("--verbose".to_string());
    }
    if self.track_memory {
      opts.push("--track-memory".to_string());
    }

    let inherited: Vec<&str> = std::iter::once(RUN_ID_ENV)
      .chain(self.inherit_environ.iter().map(String::as_str))
      .collect();
    opts.push(format!("--inherit-environ={}", inherited.join(",")));

    if let Some(min_time) = self.min_time {
      opts.push(format!("--min-time={min_time}"));
    }
    if let Some(timeout) = self.timeout {
      opts.push(format!("--timeout={timeout}"));
    }
    if let Some(loops) = self.loops.get(bench) {
      opts.push(format!("--loops={loops}"));
    }

    opts
  }

  /// The restricted environment of a benchmark process.
  fn child_env(&self, run_id: &str) -> Vec<(OsString, OsString)> {
    let mut vars: Vec<(OsString, OsString)> = CHILD_ENV
      .iter()
      .copied()
      .chain(self.inherit_environ.iter().map(String::as_str))
      .filter(|name| *name != RUN_ID_ENV)
      .filter_map(|name| Some((OsString::from(name), env::var_os(name)?)))
      .collect();
    vars.push((RUN_ID_ENV.into(), run_id.into()));

    vars
  }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
  #[error("Benchmark suite interrupted")]
  Interrupted,
  #[error("{reason}")]
  Failed { reason: String, stderr: Option<String> },
}

impl From<anyhow::Error> for RunError {
  fn from(err: anyhow::Error) -> Self {
    RunError::Failed {
      reason: format!("{err:#}"),
      stderr: None,
    }
  }
}

/// `<interpreter>-bm-<benchmark>-<unix time>`
pub fn run_id(interpreter: &Interpreter, bench: &str) -> String {
  format!("{}-bm-{bench}-{}", interpreter.id(), chrono::Utc::now().timestamp())
}

/// `[pin prefix] interpreter args runscript extra_opts framework_opts --output <output>`
pub fn build_command(
  interpreter: &Interpreter,
  affinity: Option<&Affinity>,
  runscript: &Path,
  extra_opts: &[String],
  framework_opts: &[String],
  output: &Path,
) -> Command {
  let mut command = match affinity {
    Some(affinity) => affinity.command(interpreter),
    None => interpreter.command(),
  };
  command
    .arg(runscript)
    .args(extra_opts)
    .args(framework_opts)
    .arg("--output")
    .arg(output);

  command
}

/// Runs one benchmark in a fresh process and loads the results it wrote.
pub fn run_benchmark(
  bench: &Benchmark,
  interpreter: &Interpreter,
  options: &RunOptions,
  run_id: &str,
) -> Result<Suite, RunError> {
  let runscript = bench.runscript()?;
  let metadata = bench.metadata()?;

  // The framework refuses to overwrite an existing file, so hand it a path
  // inside a fresh directory rather than a pre-created temp file.
  let tempdir = TempDir::with_prefix("interp-bench-").context("tempdir")?;
  let output = tempdir.path().join(RESULT_FILE);

  let mut command = build_command(
    interpreter,
    options.affinity.as_ref(),
    runscript,
    &metadata.extra_opts,
    &options.framework_opts(bench.name()),
    &output,
  );
  command.env_clear().envs(options.child_env(run_id)).stdin(Stdio::null());
  if !options.verbose {
    command.stderr(Stdio::piped());
  }

  tracing::debug!("running {}", command.command_line());
  let mut child = command
    .spawn()
    .with_context(|| format!("spawn {}", command.command_line()))?;
  let stderr = child.stderr.take().map(ChildStderrExt::read_in_background);

  let deadline = options.timeout.map(|secs| Instant::now() + Duration::from_secs(secs));
  let waited = child.wait_interruptible(deadline)?;
  let stderr = stderr.map(|reader| reader.join().unwrap_or_default());

  let failed = |reason: String, stderr: Option<String>| RunError::Failed { reason, stderr };
  match waited {
    Err(Stopped::Interrupted) => return Err(RunError::Interrupted),
    Err(Stopped::TimedOut) => {
      let secs = options.timeout.unwrap_or_default();
      return Err(failed(format!("timed out after {secs}s"), stderr));
    }
    // The terminal delivers Ctrl-C to the child too, which often exits
    // before the next poll sees the flag.
    Ok(_) if interrupt::is_interrupted() => return Err(RunError::Interrupted),
    Ok(status) => {
      if let Err(err) = status.check_success() {
        return Err(failed(err.to_string(), stderr));
      }
    }
  }

  Suite::load(&output).map_err(|err| failed(format!("{err:#}"), stderr))
}
