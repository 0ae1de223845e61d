//! Platform capability layer
//!
//! The few operations whose primitive differs per platform are gathered
//! here behind one interface: create-and-exec, process titles, and the
//! supplementary-group cap. Core logic calls these functions and stays
//! unaware of which concrete primitive backs them on the build target.

#![allow(unsafe_code)]

use crate::{CoreError, Result};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::ffi::CString;
use tracing::{debug, error};

/// Hard cap on the number of supplementary groups the platform reports.
///
/// A `getgroups` result above this cap means the enumeration path cannot
/// be trusted on this platform and the resolver falls back to switch-time
/// group initialization.
pub fn max_supplementary_groups() -> usize {
    // libc exposes no `NGROUPS_MAX` constant on Linux/macOS; query the same
    // platform cap portably via sysconf (returns NGROUPS_MAX, e.g. 65536).
    unsafe { libc::sysconf(libc::_SC_NGROUPS_MAX) as usize }
}

/// Set the process display name, if the platform has a primitive for it.
#[cfg(target_os = "linux")]
pub fn set_process_title(title: &str) {
    if let Ok(name) = CString::new(title) {
        // PR_SET_NAME truncates to 15 bytes plus NUL; fine for role names.
        unsafe {
            libc::prctl(
                libc::PR_SET_NAME,
                name.as_ptr() as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            );
        }
    }
    debug!("process title set to \"{}\"", title);
}

#[cfg(not(target_os = "linux"))]
pub fn set_process_title(title: &str) {
    debug!("process title \"{}\" (no title primitive on this platform)", title);
}

fn to_cstring_table(strings: &[String]) -> Result<Vec<CString>> {
    strings
        .iter()
        .map(|s| {
            CString::new(s.as_str()).map_err(|_| {
                CoreError::ProcessSpawn(format!("argument contains NUL byte: {:?}", s))
            })
        })
        .collect()
}

/// Launch an external binary as a new process image.
///
/// Uses the platform's native spawn primitive where one exists; the
/// explicit fork-then-exec fallback below covers the rest. Returns the
/// new process id, or an error if the creation primitive itself failed.
#[cfg(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd"
))]
pub fn create_exec(path: &str, argv: &[String], envp: &[String]) -> Result<Pid> {
    debug!("posix_spawn(\"{}\")", path);

    let c_path = CString::new(path)
        .map_err(|_| CoreError::ProcessSpawn(format!("path contains NUL byte: {:?}", path)))?;
    let c_argv = to_cstring_table(argv)?;
    let c_envp = to_cstring_table(envp)?;

    // posix_spawn wants NULL-terminated pointer tables.
    let mut argv_ptrs: Vec<*mut libc::c_char> = c_argv
        .iter()
        .map(|s| s.as_ptr() as *mut libc::c_char)
        .collect();
    argv_ptrs.push(std::ptr::null_mut());
    let mut envp_ptrs: Vec<*mut libc::c_char> = c_envp
        .iter()
        .map(|s| s.as_ptr() as *mut libc::c_char)
        .collect();
    envp_ptrs.push(std::ptr::null_mut());

    let mut pid: libc::pid_t = 0;
    let rc = unsafe {
        libc::posix_spawn(
            &mut pid,
            c_path.as_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            argv_ptrs.as_ptr(),
            envp_ptrs.as_ptr(),
        )
    };

    if rc != 0 {
        let errno = Errno::from_raw(rc);
        error!("posix_spawn(\"{}\") failed: {}", path, errno);
        return Err(CoreError::ProcessExec {
            path: path.to_string(),
            errno,
        });
    }

    Ok(Pid::from_raw(pid))
}

/// Fork-then-exec fallback for platforms without a native spawn primitive.
///
/// The child execs directly and `_exit`s on failure; it must never return
/// to shared caller logic with the parent's state.
#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd"
)))]
pub fn create_exec(path: &str, argv: &[String], envp: &[String]) -> Result<Pid> {
    use nix::unistd::{execve, fork, ForkResult};

    let c_path = CString::new(path)
        .map_err(|_| CoreError::ProcessSpawn(format!("path contains NUL byte: {:?}", path)))?;
    let c_argv = to_cstring_table(argv)?;
    let c_envp = to_cstring_table(envp)?;

    debug!("fork/execve(\"{}\")", path);

    match unsafe { fork() } {
        Err(errno) => {
            error!("fork() failed while executing \"{}\": {}", path, errno);
            Err(CoreError::ProcessSpawn(format!(
                "fork() failed while executing \"{}\": {}",
                path, errno
            )))
        }
        Ok(ForkResult::Child) => {
            let _ = execve(&c_path, &c_argv, &c_envp);
            error!("execve(\"{}\") failed: {}", path, Errno::last());
            unsafe { libc::_exit(1) }
        }
        Ok(ForkResult::Parent { child }) => {
            debug!("fork for exec: {}", child);
            Ok(child)
        }
    }
}
