//! Background detachment of the top-level process
//!
//! fork() followed by the parent's exit detaches the child from the init
//! script or terminal shell that started it. The child then drops its
//! controlling session, resets the file-creation mask, and points stdin
//! and stdout at the null device.

#![allow(unsafe_code)]

use crate::context::ProcessContext;
use crate::{CoreError, Result};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{close, dup2, fork, setsid, ForkResult};
use tracing::{debug, error};

/// Detach the calling process from its controlling terminal.
///
/// The parent exits with status 0 and never returns from this call; the
/// child returns `Ok` once detached. Partial detachment (session
/// detached but redirection failed) is reported, not rolled back; the
/// caller decides whether to terminate.
///
/// # Errors
///
/// [`CoreError::Daemonize`] naming the failing operation.
pub fn daemonize(ctx: &mut ProcessContext) -> Result<()> {
    match unsafe { fork() } {
        Err(errno) => {
            error!("fork() failed: {}", errno);
            return Err(CoreError::Daemonize { op: "fork", errno });
        }
        Ok(ForkResult::Parent { child }) => {
            debug!("fork(): {}", child);
            std::process::exit(0);
        }
        Ok(ForkResult::Child) => {}
    }

    ctx.refresh_after_fork();

    debug!("daemon");

    if let Err(errno) = setsid() {
        error!("setsid() failed: {}", errno);
        return Err(CoreError::Daemonize { op: "setsid", errno });
    }

    // Reset the file mode creation mask: any access rights can be set on
    // file creation.
    umask(Mode::empty());

    // Redirect STDIN and STDOUT to the null device.
    let fd = open("/dev/null", OFlag::O_RDWR, Mode::empty()).map_err(|errno| {
        error!("open(\"/dev/null\") failed: {}", errno);
        CoreError::Daemonize {
            op: "open(\"/dev/null\")",
            errno,
        }
    })?;

    dup2(fd, libc::STDIN_FILENO).map_err(|errno| {
        error!("dup2(\"/dev/null\", STDIN) failed: {}", errno);
        CoreError::Daemonize {
            op: "dup2(STDIN)",
            errno,
        }
    })?;

    dup2(fd, libc::STDOUT_FILENO).map_err(|errno| {
        error!("dup2(\"/dev/null\", STDOUT) failed: {}", errno);
        CoreError::Daemonize {
            op: "dup2(STDOUT)",
            errno,
        }
    })?;

    if fd > libc::STDERR_FILENO {
        let _ = close(fd);
    }

    Ok(())
}
