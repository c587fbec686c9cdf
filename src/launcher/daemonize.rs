use std::os::fd::AsRawFd;

use anyhow::Context as _;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{chdir, dup2, fork, setsid, ForkResult};

/// Which side of the detach the caller ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    /// Original process: the daemon is on its way, just exit.
    Parent,
    /// Detached grandchild: carry on supervising.
    Child,
}

/// Classic double-fork detach: the parent waits for the intermediate child
/// and returns; the intermediate becomes a session leader, points stdio at
/// /dev/null and forks once more so the daemon can never reacquire a
/// controlling terminal.
///
/// Must run before the async runtime exists; the already-claimed control
/// socket fd survives the forks.
pub fn detach() -> anyhow::Result<Forked> {
    // SAFETY: single-threaded at this point (no runtime, no spawned threads).
    match unsafe { fork() }.context("fork")? {
        ForkResult::Parent { child } => {
            let _ = waitpid(child, None);
            return Ok(Forked::Parent);
        }
        ForkResult::Child => {}
    }

    setsid().context("setsid")?;
    chdir("/").context("chdir to /")?;
    // SAFETY: replacing the disposition with SIG_IGN is async-signal-safe.
    unsafe { signal(Signal::SIGHUP, SigHandler::SigIgn) }.context("ignore SIGHUP")?;

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("open /dev/null")?;
    for fd in 0..=2 {
        dup2(devnull.as_raw_fd(), fd).context("redirect stdio to /dev/null")?;
    }

    // SAFETY: still single-threaded.
    match unsafe { fork() }.context("second fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => Ok(Forked::Child),
    }
}
