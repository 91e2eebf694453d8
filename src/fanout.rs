//! Runs one command per revision on a bounded worker pool, e.g. to backfill
//! results for a list of interpreter commits.

use std::{
  fmt,
  fs::{self, File},
  path::{Path, PathBuf},
  process::{Command, Stdio},
  time::{Duration, Instant},
};

use anyhow::{Context, Result};
use rayon::{prelude::*, ThreadPoolBuilder};

use crate::{
  ext::{ChildExt, CommandExt, ExitStatusExt, Stopped},
  interrupt,
};

pub const DEFAULT_JOBS: usize = 8;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
  pub rev: String,
  pub branch: String,
}

impl Revision {
  /// `<branch>-<rev>`, safe to use as a file name.
  pub fn stem(&self) -> String {
    format!("{}-{}", self.branch.replace('/', "-"), self.rev)
  }
}

impl fmt::Display for Revision {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({})", self.rev, self.branch)
  }
}

/// Parses `rev=branch` lines. Blank lines and `#` comments are ignored.
pub fn parse_revisions(text: &str) -> Result<Vec<Revision>> {
  text
    .lines()
    .map(|line| line.split('#').next().unwrap_or_default().trim())
    .filter(|line| !line.is_empty())
    .map(|line| {
      let (rev, branch) = line
        .split_once('=')
        .with_context(|| format!("expected rev=branch, got {line:?}"))?;
      let (rev, branch) = (rev.trim(), branch.trim());
      if rev.is_empty() || branch.is_empty() {
        anyhow::bail!("expected rev=branch, got {line:?}");
      }

      Ok(Revision {
        rev: rev.to_string(),
        branch: branch.to_string(),
      })
    })
    .collect()
}

pub fn load_revisions<P: AsRef<Path>>(path: P) -> Result<Vec<Revision>> {
  let path = path.as_ref();
  let text = fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;

  parse_revisions(&text).with_context(|| format!("parse {path:?}"))
}

#[derive(Debug, Clone)]
pub struct FanoutOptions {
  pub jobs: usize,
  /// Wall-clock budget for the whole fan-out.
  pub timeout: Duration,
  pub output_dir: PathBuf,
  /// Command template; `{rev}` and `{branch}` are substituted per revision.
  pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionStatus {
  Succeeded,
  Failed(String),
  TimedOut,
  Interrupted,
  /// Never started: the deadline passed or the operator interrupted first.
  Skipped,
}

impl fmt::Display for RevisionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RevisionStatus::Succeeded => write!(f, "ok"),
      RevisionStatus::Failed(reason) => write!(f, "failed: {reason}"),
      RevisionStatus::TimedOut => write!(f, "killed at the deadline"),
      RevisionStatus::Interrupted => write!(f, "interrupted"),
      RevisionStatus::Skipped => write!(f, "skipped"),
    }
  }
}

fn substitute(template: &[String], revision: &Revision) -> Vec<String> {
  template
    .iter()
    .map(|arg| arg.replace("{rev}", &revision.rev).replace("{branch}", &revision.branch))
    .collect()
}

fn run_revision(revision: &Revision, options: &FanoutOptions, deadline: Instant) -> Result<RevisionStatus> {
  if interrupt::is_interrupted() || Instant::now() >= deadline {
    return Ok(RevisionStatus::Skipped);
  }

  let args = substitute(&options.command, revision);
  let (program, args) = args.split_first().context("empty command")?;

  let stem = revision.stem();
  let out = File::create(options.output_dir.join(format!("{stem}.out"))).context("create .out")?;
  let err = File::create(options.output_dir.join(format!("{stem}.err"))).context("create .err")?;

  let mut command = Command::new(program);
  command.args(args).stdin(Stdio::null()).stdout(out).stderr(err);
  tracing::info!("{revision}: {}", command.command_line());

  let mut child = match command.spawn() {
    Ok(child) => child,
    Err(err) => return Ok(RevisionStatus::Failed(format!("spawn {program}: {err}"))),
  };

  let status = match child.wait_interruptible(Some(deadline))? {
    Ok(status) => match status.check_success() {
      Ok(()) => RevisionStatus::Succeeded,
      Err(err) => RevisionStatus::Failed(err.to_string()),
    },
    Err(Stopped::TimedOut) => RevisionStatus::TimedOut,
    Err(Stopped::Interrupted) => RevisionStatus::Interrupted,
  };

  Ok(status)
}

/// Runs the command for every revision, at most `jobs` at a time. Workers
/// still running at the deadline are killed.
pub fn fanout(revisions: &[Revision], options: &FanoutOptions) -> Result<Vec<(Revision, RevisionStatus)>> {
  if options.command.is_empty() {
    anyhow::bail!("no command given");
  }
  fs::create_dir_all(&options.output_dir).with_context(|| format!("create {:?}", options.output_dir))?;

  let jobs = options.jobs.max(1).min(revisions.len().max(1));
  // Workers inherit the blocked mask, so Ctrl-C is only ever handled by the
  // calling thread.
  let pool = interrupt::with_sigint_masked(|| ThreadPoolBuilder::new().num_threads(jobs).build())?
    .context("build worker pool")?;

  let deadline = Instant::now() + options.timeout;
  let statuses: Vec<Result<RevisionStatus>> = pool.install(|| {
    revisions
      .par_iter()
      .map(|revision| run_revision(revision, options, deadline).with_context(|| format!("revision {revision}")))
      .collect()
  });

  revisions
    .iter()
    .cloned()
    .zip(statuses)
    .map(|(revision, status)| Ok((revision, status?)))
    .collect()
}
