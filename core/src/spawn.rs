//! Process creation: the fork path and the exec path
//!
//! A single fork yields two divergent execution futures that must each
//! reach a consistent view of the shared tables. The fork result is
//! branched exactly once here; the parent and child continuations are
//! plain functions so the divergence is testable without forking.

#![allow(unsafe_code)]

use crate::bootstrap::bootstrap;
use crate::context::ProcessContext;
use crate::engine::EventEngine;
use crate::platform;
use crate::port::Port;
use crate::process::{ProcessRecord, RoleInit};
use crate::runtime::Runtime;
use crate::{CoreError, Result};
use nix::unistd::{fork, ForkResult, Pid};
use std::sync::Arc;
use tracing::{debug, error};

/// Create a worker/auxiliary process on the fork path.
///
/// `ports` are the pre-created endpoints to associate with the new
/// process. In the parent this returns the child's pid once the record
/// is tracked; in the child it returns the child's own pid after the
/// bootstrap sequence completed. A bootstrap failure terminates the
/// child with status 1 and never returns.
///
/// # Errors
///
/// Fork failure is logged at error severity and reported; no process
/// record is created.
pub fn spawn_forked(
    rt: &mut Runtime,
    ctx: &mut ProcessContext,
    engine: &mut EventEngine,
    init: Arc<RoleInit>,
    ports: Vec<Arc<Port>>,
) -> Result<Pid> {
    // Safety: the child immediately repairs its inherited state and runs
    // only the bootstrap sequence; no other threads exist in processes
    // that call this (single-writer table contract).
    match unsafe { fork() } {
        Err(errno) => {
            error!("fork() failed while creating \"{}\": {}", init.name, errno);
            Err(CoreError::ProcessSpawn(format!(
                "fork() failed while creating \"{}\": {}",
                init.name, errno
            )))
        }
        Ok(ForkResult::Parent { child }) => {
            debug!("fork(\"{}\"): {}", init.name, child);
            track_spawned(rt, &init, &ports, child);
            Ok(child)
        }
        Ok(ForkResult::Child) => match continue_in_child(rt, ctx, engine, &init, &ports) {
            Ok(pid) => Ok(pid),
            Err(e) => {
                error!("bootstrap of \"{}\" failed: {}", init.name, e);
                std::process::exit(1);
            }
        },
    }
}

/// Parent-side continuation: track the new child in the process table.
///
/// The record enters the table not ready; it flips once the child's
/// ready notification arrives.
pub fn track_spawned(rt: &mut Runtime, init: &Arc<RoleInit>, ports: &[Arc<Port>], child: Pid) {
    rt.processes.add(ProcessRecord::new(child, Arc::clone(init)));
    for port in ports {
        rt.processes.attach_port(child, Arc::clone(port));
    }
}

/// Child-side continuation: repair inherited state, register self, and
/// run the bootstrap sequence.
///
/// The inherited process table is walked exactly once: records whose
/// bootstrap had not completed before the fork are unreliable here and
/// are dropped; ready records lose their bulk buffer mappings.
pub fn continue_in_child(
    rt: &mut Runtime,
    ctx: &mut ProcessContext,
    engine: &mut EventEngine,
    init: &Arc<RoleInit>,
    ports: &[Arc<Port>],
) -> Result<Pid> {
    ctx.refresh_after_fork();
    let own_pid = ctx.pid();

    // The child starts with no active role types of its own.
    rt.types.clear();

    // Restart local port-id allocation so the child cannot collide with
    // ids the parent handed out before the fork.
    rt.port_ids.reset();

    // The engine's thread affinity is stale across fork.
    engine.adopt_thread();

    rt.processes.repair_after_fork();

    rt.processes.add(ProcessRecord::new(own_pid, Arc::clone(init)));
    for port in ports {
        rt.processes.attach_port(own_pid, Arc::clone(port));
    }

    bootstrap(rt, ctx, engine, init, own_pid)?;

    rt.processes.mark_ready(own_pid);

    Ok(own_pid)
}

/// Launch an external binary as a new, unrelated process image.
///
/// # Errors
///
/// Returns the creation primitive's failure; the caller process is left
/// untouched.
pub fn spawn_exec(path: &str, argv: &[String], envp: &[String]) -> Result<Pid> {
    platform::create_exec(path, argv, envp)
}
