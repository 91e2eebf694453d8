use std::{
  io::{self, Read},
  process::{Child, ChildStderr, Command, ExitStatus},
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use anyhow::{Context, Result};
use wait_timeout::ChildExt as WaitExt;

use crate::interrupt;

/// How often a blocked wait wakes up to look for an operator interrupt.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why a child was killed before it exited on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
  Interrupted,
  TimedOut,
}

#[extend::ext]
pub impl ExitStatus {
  fn check_success(&self) -> Result<()> {
    if !self.success() {
      anyhow::bail!("exited with non-zero status {self}");
    }

    Ok(())
  }
}

#[extend::ext]
pub impl Child {
  /// Blocks until the child exits. If the operator interrupts us, or the
  /// optional `deadline` passes first, the child is killed and reaped.
  fn wait_interruptible(&mut self, deadline: Option<Instant>) -> Result<std::result::Result<ExitStatus, Stopped>> {
    loop {
      let slice = match deadline {
        Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(POLL_INTERVAL),
        None => POLL_INTERVAL,
      };

      if let Some(status) = self.wait_timeout(slice).context("wait")? {
        return Ok(Ok(status));
      }

      let stopped = if interrupt::is_interrupted() {
        Some(Stopped::Interrupted)
      } else if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        Some(Stopped::TimedOut)
      } else {
        None
      };

      if let Some(stopped) = stopped {
        self.kill_and_reap()?;
        return Ok(Err(stopped));
      }
    }
  }

  fn kill_and_reap(&mut self) -> Result<()> {
    match self.kill() {
      Ok(()) => {}
      // Already exited between the last poll and the kill.
      Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
      Err(err) => return Err(err).context("kill"),
    }
    self.wait().context("wait")?;

    Ok(())
  }
}

#[extend::ext]
pub impl ChildStderr {
  /// Drains the pipe on a separate thread so a chatty child cannot block on
  /// a full pipe while we wait for it.
  fn read_in_background(self) -> JoinHandle<String> {
    let mut stderr = self;
    thread::spawn(move || {
      let mut buf = Vec::new();
      if let Err(err) = stderr.read_to_end(&mut buf) {
        tracing::debug!("reading child stderr: {err}");
      }

      String::from_utf8_lossy(&buf).into_owned()
    })
  }
}

#[extend::ext]
pub impl Command {
  /// The command line, for logs.
  fn command_line(&self) -> String {
    std::iter::once(self.get_program())
      .chain(self.get_args())
      .map(|arg| arg.to_string_lossy().into_owned())
      .collect::<Vec<_>>()
      .join(" ")
  }
}
