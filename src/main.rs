mod bench;
mod benchmark;
mod compare;
mod config;
mod ext;
mod fanout;
mod format;
mod interpreter;
mod interrupt;
mod manifest;
mod run;
mod selection;
mod suite;
mod version;

use std::{
  collections::BTreeSet,
  path::{Path, PathBuf},
  process::ExitCode,
  time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use self::{
  bench::{Bench, RunOutcome},
  compare::compare_suites,
  config::{Config, Session},
  fanout::{FanoutOptions, RevisionStatus},
  format::{OutputStyle, Report},
  interpreter::Interpreter,
  manifest::{Manifest, ALL_GROUP, DEFAULT_GROUP},
  run::{Affinity, RunError, RunMode, RunOptions},
  suite::Suite,
};

const DEFAULT_INTERPRETER: &str = "python3";

#[derive(Parser)]
#[command(version, about = "Benchmark two interpreter builds and compare the results")]
struct Args {
  /// Config file. Defaults to `interp-bench.toml` in the working directory.
  #[arg(long, global = true)]
  config: Option<PathBuf>,
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run benchmarks against an interpreter, or two of them.
  Run(RunArgs),
  /// Compare two result files.
  Compare {
    base: PathBuf,
    changed: PathBuf,
    #[arg(short = 'O', long, value_enum, default_value_t)]
    output_style: OutputStyle,
    /// Also write the means of both files as CSV.
    #[arg(long)]
    csv: Option<PathBuf>,
    /// Show results that are not significant.
    #[arg(short, long)]
    verbose: bool,
  },
  /// Print a result file.
  Show { filename: PathBuf },
  /// List the benchmarks a selection resolves to.
  List {
    #[arg(short, long, default_value = DEFAULT_GROUP)]
    benchmarks: String,
    #[arg(long)]
    manifest: Option<PathBuf>,
  },
  /// List groups and tags with their benchmarks.
  #[command(name = "list_groups")]
  ListGroups {
    #[arg(long)]
    manifest: Option<PathBuf>,
    /// Only count benchmarks compatible with this interpreter.
    #[arg(short = 'p', long)]
    interpreter: Option<PathBuf>,
  },
  /// Run a command for every `rev=branch` line of REVISIONS in parallel.
  Fanout {
    revisions: PathBuf,
    #[arg(short, long, default_value_t = fanout::DEFAULT_JOBS)]
    jobs: usize,
    /// Wall-clock limit for the whole fan-out, in seconds.
    #[arg(long, default_value_t = fanout::DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,
    /// Command to run; `{rev}` and `{branch}` are substituted.
    #[arg(last = true, required = true)]
    command: Vec<String>,
  },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
  /// Comma-separated benchmarks, groups or `<tag>` patterns; `-name` excludes.
  #[arg(short, long, default_value = DEFAULT_GROUP)]
  benchmarks: String,
  /// Write results to a new file.
  #[arg(short, long)]
  output: Option<PathBuf>,
  /// Add runs to an existing result file, creating it if needed.
  #[arg(long)]
  append: Option<PathBuf>,
  #[arg(short, long)]
  rigorous: bool,
  #[arg(short, long)]
  fast: bool,
  #[arg(long)]
  debug_single_value: bool,
  #[arg(short = 'm', long)]
  track_memory: bool,
  /// CPUs to pin benchmark processes to, e.g. `2,3` or `0-3`.
  #[arg(long)]
  affinity: Option<String>,
  /// Extra environment variables passed through to benchmarks.
  #[arg(long, value_delimiter = ',')]
  inherit_environ: Vec<String>,
  #[arg(short = 'p', long)]
  interpreter: Option<PathBuf>,
  /// Second interpreter; each benchmark runs on it first, then on the base.
  #[arg(long)]
  changed: Option<PathBuf>,
  #[arg(long, requires = "changed")]
  changed_output: Option<PathBuf>,
  /// Interpreter arguments, `"BASE_ARGS,CHANGED_ARGS"` or shared.
  #[arg(long, allow_hyphen_values = true)]
  args: Option<String>,
  /// Reuse the loop counts recorded in a result file.
  #[arg(long)]
  same_loops: Option<PathBuf>,
  #[arg(long)]
  min_time: Option<f64>,
  /// Per-benchmark timeout in seconds.
  #[arg(long)]
  timeout: Option<u64>,
  #[arg(long)]
  manifest: Option<PathBuf>,
  /// Exit successfully even if some benchmarks failed.
  #[arg(long)]
  allow_failures: bool,
  #[arg(short, long)]
  verbose: bool,
}

fn init_tracing() -> Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_target(false)
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("interp_bench=info".parse()?))
    .init();

  Ok(())
}

fn main() -> ExitCode {
  let args = Args::parse();

  if let Err(err) = init_tracing() {
    eprintln!("ERROR: {err:#}");
    return ExitCode::FAILURE;
  }

  match dispatch(args) {
    Ok(code) => code,
    Err(err) => {
      if matches!(err.downcast_ref::<RunError>(), Some(RunError::Interrupted)) {
        eprintln!("Benchmark suite interrupted: exit!");
      } else {
        eprintln!("ERROR: {err:#}");
      }
      ExitCode::FAILURE
    }
  }
}

fn dispatch(args: Args) -> Result<ExitCode> {
  let config = Config::discover(args.config.as_deref()).context("load config")?;
  let mut session = Session::new(config);

  match args.command {
    Command::Run(run) => {
      interrupt::install()?;
      cmd_run(run, &mut session)
    }
    Command::Compare {
      base,
      changed,
      output_style,
      csv,
      verbose,
    } => cmd_compare(&base, &changed, output_style, csv.as_deref(), verbose),
    Command::Show { filename } => {
      let suite = Suite::load(&filename)?;
      print!("{}", format::format_suite(&suite)?);
      Ok(ExitCode::SUCCESS)
    }
    Command::List { benchmarks, manifest } => {
      let manifest = load_manifest(&session, manifest.as_deref())?;
      let selected = selection::select(&manifest, &benchmarks)?;

      println!("{benchmarks:?} benchmarks:");
      for name in &selected {
        println!("- {name}");
      }
      println!();
      println!("Total: {} benchmarks", selected.len());
      Ok(ExitCode::SUCCESS)
    }
    Command::ListGroups { manifest, interpreter } => {
      let manifest = load_manifest(&session, manifest.as_deref())?;
      let interpreter = interpreter.map(|path| Interpreter::resolve(path, Vec::new())).transpose()?;
      cmd_list_groups(&manifest, interpreter.as_ref(), &mut session)?;
      Ok(ExitCode::SUCCESS)
    }
    Command::Fanout {
      revisions,
      jobs,
      timeout,
      output_dir,
      command,
    } => {
      interrupt::install()?;
      let options = FanoutOptions {
        jobs,
        timeout: Duration::from_secs(timeout),
        output_dir,
        command,
      };
      cmd_fanout(&revisions, &options)
    }
  }
}

fn load_manifest(session: &Session, cli: Option<&Path>) -> Result<Manifest> {
  let path = session.config.manifest_path(cli)?;
  Manifest::load(&path, session.config.default_manifest.as_deref())
}

fn cmd_run(args: RunArgs, session: &mut Session) -> Result<ExitCode> {
  for output in [&args.output, &args.changed_output].into_iter().flatten() {
    if output.exists() {
      anyhow::bail!("the output file {} already exists!", output.display());
    }
  }

  let manifest = load_manifest(session, args.manifest.as_deref())?;

  let (base_args, changed_args) = interpreter::split_args(args.args.as_deref())?;
  let program = args
    .interpreter
    .clone()
    .or_else(|| session.config.interpreter.clone())
    .unwrap_or_else(|| PathBuf::from(DEFAULT_INTERPRETER));
  let base = Interpreter::resolve(program, base_args)?;
  let changed = args
    .changed
    .as_ref()
    .map(|program| Interpreter::resolve(program, changed_args))
    .transpose()?;

  let selected = selection::select(&manifest, &args.benchmarks)?;
  let interpreters: Vec<&Interpreter> = std::iter::once(&base).chain(changed.as_ref()).collect();
  let selected = selection::filter_compatible(&manifest, selected, &interpreters, &mut session.versions)?;

  let loops = match &args.same_loops {
    Some(path) => Suite::load(path).context("--same-loops")?.loops(),
    None => Default::default(),
  };
  let mut inherit_environ = session.config.inherit_environ.clone();
  inherit_environ.extend(args.inherit_environ.iter().cloned());

  let options = RunOptions {
    mode: RunMode::from_flags(args.debug_single_value, args.rigorous, args.fast),
    verbose: args.verbose,
    track_memory: args.track_memory,
    inherit_environ,
    min_time: args.min_time,
    timeout: args.timeout.or(session.config.timeout),
    affinity: args.affinity.clone().map(|cpu_list| Affinity {
      tool: session.config.affinity_tool.clone(),
      cpu_list,
    }),
    loops,
  };

  let outcome = Bench::new(&manifest, base, changed, options).run(&selected, session)?;
  if outcome.is_empty() {
    anyhow::bail!("No benchmark was run");
  }

  save_outcome(&args, &outcome)?;
  if let Err(err) = report_outcome(&outcome) {
    tracing::warn!("cannot compare the results: {err:#}");
  }

  let failed = outcome.failed_names();
  if !failed.is_empty() {
    println!("{} benchmarks failed:", failed.len());
    for name in &failed {
      println!("- {name}");
    }
    println!();

    if !args.allow_failures {
      return Ok(ExitCode::FAILURE);
    }
  }

  Ok(ExitCode::SUCCESS)
}

fn save_outcome(args: &RunArgs, outcome: &RunOutcome) -> Result<()> {
  if let Some(output) = &args.output {
    outcome.base.dump(output)?;
  }
  if let Some(append) = &args.append {
    if append.exists() {
      let mut suite = Suite::load(append)?;
      suite.merge_runs(outcome.base.clone())?;
      suite.write(append)?;
    } else {
      outcome.base.dump(append)?;
    }
  }
  if let (Some(output), Some(changed)) = (&args.changed_output, &outcome.changed) {
    changed.dump(output)?;
  }

  Ok(())
}

fn report_outcome(outcome: &RunOutcome) -> Result<()> {
  let Some(changed) = &outcome.changed else {
    print!("{}", format::format_suite(&outcome.base)?);
    return Ok(());
  };

  compare::check_harness_versions(&outcome.base, changed)?;
  let comparison = compare_suites(&outcome.base, changed)?;
  let report = Report {
    base: &outcome.base,
    changed,
    comparison: &comparison,
    base_label: "base",
    changed_label: "changed",
    style: OutputStyle::Normal,
    verbose: true,
  };
  print!("{}", report.format()?);

  Ok(())
}

fn cmd_compare(
  base_path: &Path,
  changed_path: &Path,
  style: OutputStyle,
  csv: Option<&Path>,
  verbose: bool,
) -> Result<ExitCode> {
  let base = Suite::load(base_path)?;
  let changed = Suite::load(changed_path)?;

  compare::check_harness_versions(&base, &changed)?;
  let comparison = compare_suites(&base, &changed)?;

  let (base_label, changed_label) = format::labels(base_path, changed_path);
  let report = Report {
    base: &base,
    changed: &changed,
    comparison: &comparison,
    base_label: &base_label,
    changed_label: &changed_label,
    style,
    verbose,
  };
  print!("{}", report.format()?);

  if let Some(csv) = csv {
    format::write_csv(csv, &comparison)?;
  }

  Ok(ExitCode::SUCCESS)
}

fn print_members(title: &str, members: &BTreeSet<String>) {
  println!("{title} ({}):", members.len());
  for name in members {
    println!("- {name}");
  }
  println!();
}

fn cmd_list_groups(manifest: &Manifest, interpreter: Option<&Interpreter>, session: &mut Session) -> Result<()> {
  let all = manifest.group(ALL_GROUP).cloned().unwrap_or_default();
  let known = match interpreter {
    Some(interpreter) => selection::filter_compatible(manifest, all, &[interpreter], &mut session.versions)?,
    None => all,
  };

  let mut groups: Vec<&str> = vec![ALL_GROUP, DEFAULT_GROUP];
  groups.extend(
    manifest
      .groups()
      .keys()
      .map(String::as_str)
      .filter(|name| *name != ALL_GROUP && *name != DEFAULT_GROUP),
  );

  for group in groups {
    let Some(members) = manifest.group(group) else {
      continue;
    };
    let members: BTreeSet<String> = members.intersection(&known).cloned().collect();
    if !members.is_empty() {
      print_members(group, &members);
    }
  }

  println!("=============================");
  println!();
  println!("tags:");
  println!();

  let tags = manifest.tags()?;
  if tags.is_empty() {
    println!("(no tags)");
  }
  for (tag, members) in &tags {
    let members: BTreeSet<String> = members.intersection(&known).cloned().collect();
    if !members.is_empty() {
      print_members(tag, &members);
    }
  }

  Ok(())
}

fn cmd_fanout(revisions: &Path, options: &FanoutOptions) -> Result<ExitCode> {
  let revisions = fanout::load_revisions(revisions)?;
  let statuses = fanout::fanout(&revisions, options)?;

  let mut ok = true;
  for (revision, status) in &statuses {
    if *status != RevisionStatus::Succeeded {
      ok = false;
      println!("{revision}: {status}");
    }
  }

  if interrupt::is_interrupted() {
    println!("Caught interrupt, terminating workers");
    return Ok(ExitCode::FAILURE);
  }
  if ok {
    println!("Normal termination");
    Ok(ExitCode::SUCCESS)
  } else {
    Ok(ExitCode::FAILURE)
  }
}
