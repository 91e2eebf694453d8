use std::{
  env, fmt,
  path::{Path, PathBuf},
  process::Command,
};

use anyhow::{Context, Result};

/// An interpreter command: the executable plus arguments placed before the
/// benchmark script.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Interpreter {
  pub program: PathBuf,
  pub args: Vec<String>,
}

impl Interpreter {
  pub fn new<P: Into<PathBuf>>(program: P, args: Vec<String>) -> Self {
    Self {
      program: program.into(),
      args,
    }
  }

  /// Resolves `program` to an absolute path, searching `PATH` for bare names.
  /// Benchmarks run with a restricted environment, so the path is pinned
  /// here rather than left to the child's lookup.
  pub fn resolve<P: AsRef<Path>>(program: P, args: Vec<String>) -> Result<Self> {
    let program = program.as_ref();

    let resolved = if program.components().count() > 1 {
      env::current_dir().context("current dir")?.join(program)
    } else {
      let path = env::var_os("PATH").context("PATH is not set")?;
      env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .with_context(|| format!("unable to locate the interpreter {program:?}"))?
    };

    if !resolved.is_file() {
      anyhow::bail!("unable to locate the interpreter {resolved:?}");
    }

    Ok(Self::new(resolved, args))
  }

  pub fn command(&self) -> Command {
    let mut command = Command::new(&self.program);
    command.args(&self.args);

    command
  }

  /// Short identifier used in run ids.
  pub fn id(&self) -> String {
    self
      .program
      .file_stem()
      .map(|stem| stem.to_string_lossy().into_owned())
      .unwrap_or_else(|| "interpreter".to_string())
  }
}

impl fmt::Display for Interpreter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.program.display())?;
    for arg in &self.args {
      write!(f, " {arg}")?;
    }

    Ok(())
  }
}

/// Splits the `--args` option into base and changed interpreter arguments.
/// `"-X dev"` applies to both interpreters, `"-X dev,-E"` to each side.
pub fn split_args(raw: Option<&str>) -> Result<(Vec<String>, Vec<String>)> {
  let Some(raw) = raw else {
    return Ok((Vec::new(), Vec::new()));
  };

  let mut sides = raw.split(',');
  let base: Vec<String> = sides.next().unwrap_or_default().split_whitespace().map(String::from).collect();
  let changed = match sides.next() {
    Some(changed) => changed.split_whitespace().map(String::from).collect(),
    None => base.clone(),
  };

  if sides.next().is_some() {
    anyhow::bail!("expected at most one comma in --args, got {raw:?}");
  }

  Ok((base, changed))
}
