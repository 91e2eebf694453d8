//! Operator interrupt (SIGINT) handling.
//!
//! Once [`install`] has run, Ctrl-C only raises a flag. Blocked waits poll
//! the flag, kill their child and unwind, so no benchmark process is left
//! orphaned behind us.

use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use anyhow::Context;
use anyhow::Result;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_sigint(_signum: libc::c_int) {
  INTERRUPTED.store(true, Ordering::SeqCst);
}

pub fn install() -> Result<()> {
  #[cfg(unix)]
  {
    let handler = on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
    let previous = unsafe { libc::signal(libc::SIGINT, handler) };
    if previous == libc::SIG_ERR {
      return Err(std::io::Error::last_os_error()).context("install SIGINT handler");
    }
  }

  Ok(())
}

pub fn is_interrupted() -> bool {
  INTERRUPTED.load(Ordering::SeqCst)
}

/// Blocks SIGINT on the calling thread until dropped.
///
/// Threads spawned while the guard is alive inherit the blocked mask, so a
/// pending interrupt is delivered to the calling thread once the mask is
/// restored, never to a half-built worker.
pub struct SigintMask {
  #[cfg(unix)]
  previous: libc::sigset_t,
}

impl SigintMask {
  pub fn block() -> Result<Self> {
    #[cfg(unix)]
    unsafe {
      let mut block: libc::sigset_t = std::mem::zeroed();
      let mut previous: libc::sigset_t = std::mem::zeroed();
      libc::sigemptyset(&mut block);
      libc::sigaddset(&mut block, libc::SIGINT);

      let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &block, &mut previous);
      if rc != 0 {
        anyhow::bail!("pthread_sigmask: {}", std::io::Error::from_raw_os_error(rc));
      }

      Ok(Self { previous })
    }

    #[cfg(not(unix))]
    Ok(Self {})
  }
}

impl Drop for SigintMask {
  fn drop(&mut self) {
    #[cfg(unix)]
    unsafe {
      libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut());
    }
  }
}

/// Runs `f` with SIGINT masked on the calling thread.
pub fn with_sigint_masked<T>(f: impl FnOnce() -> T) -> Result<T> {
  let _mask = SigintMask::block()?;

  Ok(f())
}
