//! Mirzam coordinating daemon
//!
//! Translates the runtime configuration into spawnable roles, resolves
//! target credentials ahead of spawning (directory lookups may block,
//! and must never stall a freshly forked worker), and runs the spawn
//! and reap loop of the main process.

pub mod error;

pub use error::{DaemonError, Result};

use mirzam_core::config::{RoleConfig, RuntimeConfig};
use mirzam_core::credentials::resolve_credential;
use mirzam_core::engine::EventEngine;
use mirzam_core::port::{HandlerTable, MessageKind};
use mirzam_core::process::{ProcessRecord, RoleInit, RoleKind};
use mirzam_core::runtime::Runtime;
use mirzam_core::spawn::spawn_forked;
use mirzam_core::ProcessContext;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Signals every spawned role's engine handles.
const ROLE_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP];

fn on_data(payload: &[u8]) {
    debug!("data message ({} bytes)", payload.len());
}

/// Build the spawnable role list from the configuration.
///
/// # Errors
///
/// Credential resolution failures surface here, before anything is
/// forked.
pub fn build_roles(config: &RuntimeConfig) -> Result<Vec<Arc<RoleInit>>> {
    let mut roles = Vec::with_capacity(config.roles.len());
    for role in &config.roles {
        roles.push(Arc::new(build_role(role)?));
    }
    Ok(roles)
}

fn build_role(role: &RoleConfig) -> Result<RoleInit> {
    let entry_name = role.name.clone();
    let mut init = RoleInit::new(
        role.name.clone(),
        role.kind,
        Box::new(move || {
            info!("role \"{}\" entry point running", entry_name);
            Ok(())
        }),
    )
    .with_stream(role.stream)
    .with_signals(ROLE_SIGNALS.to_vec())
    .with_port_handlers(HandlerTable::new().on(MessageKind::Data, on_data));

    if let Some(user) = &role.user {
        let cred = resolve_credential(user, role.group.as_deref())?;
        init = init.with_user_cred(cred);
    }

    Ok(init)
}

/// Run the main coordinating process: spawn every configured role, then
/// reap children until they have all exited.
///
/// In a forked child this returns once the child's bootstrap and entry
/// point have finished; the caller should simply exit.
pub fn run(config: &RuntimeConfig) -> Result<()> {
    let mut ctx = ProcessContext::capture();

    if config.daemonize {
        mirzam_core::daemonize(&mut ctx)?;
    }

    let mut rt = Runtime::new(config);
    let mut engine = EventEngine::new();
    engine.adopt_thread();
    rt.types.insert(RoleKind::Main);

    // The main process registers itself, ready, with the port every
    // worker reports over.
    let main_port = rt.new_port();
    rt.set_main_port(main_port.clone());
    rt.processes.add(ProcessRecord::new(
        ctx.pid(),
        Arc::new(RoleInit::new("main", RoleKind::Main, Box::new(|| Ok(())))),
    ));
    rt.processes.attach_port(ctx.pid(), main_port);
    rt.processes.mark_ready(ctx.pid());

    let roles = build_roles(config)?;
    for init in roles {
        let port = rt.new_port();
        match spawn_forked(&mut rt, &mut ctx, &mut engine, Arc::clone(&init), vec![port]) {
            Ok(pid) if pid == ctx.pid() => {
                // The forked child lands here once bootstrapped; its
                // entry point already ran.
                info!("{} finished", init.name);
                return Ok(());
            }
            Ok(pid) => info!("spawned \"{}\" as {}", init.name, pid),
            Err(e) => warn!("failed to spawn \"{}\": {}", init.name, e),
        }
    }

    reap_children(&mut rt)
}

/// Wait for children and drop their records as they exit.
fn reap_children(rt: &mut Runtime) -> Result<()> {
    loop {
        match waitpid(None::<Pid>, None) {
            Ok(WaitStatus::Exited(pid, code)) => {
                info!("process {} exited with code {}", pid, code);
                rt.processes.remove(pid);
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                warn!("process {} killed by {}", pid, signal);
                rt.processes.remove(pid);
            }
            Ok(status) => debug!("wait status: {:?}", status),
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                return Err(DaemonError::Startup(format!("waitpid failed: {}", errno)));
            }
        }
    }
    info!("all workers exited");
    Ok(())
}
