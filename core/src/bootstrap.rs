//! The fixed bootstrap sequence a freshly created process runs
//!
//! Runs once, synchronously, before the process is usable. Every failure
//! here is fatal to the process: the caller (the child branch of the
//! spawner) terminates rather than leave a half-initialized worker
//! accepting ports or traffic.

use crate::context::ProcessContext;
use crate::credentials;
use crate::engine::EventEngine;
use crate::platform;
use crate::port::MessageKind;
use crate::process::RoleInit;
use crate::runtime::Runtime;
use crate::{CoreError, Result};
use nix::unistd::{Pid, Uid};
use std::time::Duration;
use tracing::{debug, error, info};

/// Idle timeout for the auxiliary thread pool.
const AUX_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Run the bootstrap sequence for `init` in the process `own_pid`.
///
/// The process record for `own_pid` must already be in the table; the
/// record's first-created port is the one locked down and enabled here.
///
/// # Errors
///
/// Any step failing aborts the sequence; the error names the step. The
/// caller must treat the failure as fatal to the process.
pub fn bootstrap(
    rt: &mut Runtime,
    ctx: &mut ProcessContext,
    engine: &mut EventEngine,
    init: &RoleInit,
    own_pid: Pid,
) -> Result<()> {
    info!("{} started", init.name);
    platform::set_process_title(&format!("mirzam: {}", init.name));

    ctx.reseed_rng();

    match &init.user_cred {
        Some(cred) if Uid::effective().is_root() => {
            credentials::apply_credential(cred)?;
        }
        Some(_) => {
            debug!("not super-user, \"{}\" keeps the caller identity", init.name);
        }
        None => {}
    }

    rt.types.insert(init.kind);

    // The inherited engine still carries the main process's signal
    // configuration; replace it with this role's set before rebinding.
    engine.set_signals(&init.signals);

    let backend = rt.engines.lookup(rt.engine_name()).map_err(|e| {
        error!("bootstrap of \"{}\": {}", init.name, e);
        e
    })?;
    engine.rebind(backend, rt.batch()).map_err(|e| {
        error!("bootstrap of \"{}\": {}", init.name, e);
        e
    })?;

    rt.pools()
        .create(rt.auxiliary_threads(), AUX_POOL_IDLE_TIMEOUT)
        .map_err(|e| {
            error!("bootstrap of \"{}\": {}", init.name, e);
            e
        })?;

    let transport = rt.transport();

    // Directionality lock-down: a worker only ever writes to the channel
    // it reports to main over, and peers only ever write to the worker's
    // own port.
    let main_port = rt.main_port().ok_or_else(|| {
        error!("bootstrap of \"{}\": no main-process port configured", init.name);
        CoreError::PortSend("no main-process port configured".to_string())
    })?;
    transport.close_read(&main_port);
    transport.open_write(&main_port);

    let own_port = rt.processes.get(own_pid).and_then(|record| record.first_port());
    match &own_port {
        Some(port) => transport.close_write(port),
        None => debug!("\"{}\" has no port of its own yet", init.name),
    }

    (init.start)().map_err(|e| {
        error!("entry point of \"{}\" failed: {}", init.name, e);
        CoreError::EntryPoint(e.to_string())
    })?;

    if let Some(port) = &own_port {
        transport.enable(port, &init.port_handlers);
    }

    transport
        .send(&main_port, MessageKind::Ready, &[], init.stream)
        .map_err(|e| {
            error!("failed to send READY message to main: {}", e);
            e
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::engine::{MockEngineBackend, MockPools};
    use crate::port::{MockTransport, TransportCall};
    use crate::process::{ProcessRecord, RoleKind};
    use std::sync::Arc;

    struct Harness {
        rt: Runtime,
        ctx: ProcessContext,
        engine: EventEngine,
        transport: Arc<MockTransport>,
        pools: Arc<MockPools>,
        main_id: u32,
        own_id: u32,
        pid: Pid,
    }

    fn harness(transport: MockTransport, pools: MockPools) -> Harness {
        let transport = Arc::new(transport);
        let pools = Arc::new(pools);
        let mut rt = Runtime::new(&RuntimeConfig::default())
            .with_transport(transport.clone())
            .with_pools(pools.clone());

        let main_port = rt.new_port();
        let main_id = main_port.id();
        rt.set_main_port(main_port);

        let pid = Pid::from_raw(4242);
        let init = Arc::new(RoleInit::new("router", RoleKind::Router, Box::new(|| Ok(()))));
        rt.processes.add(ProcessRecord::new(pid, init));
        let own_port = rt.new_port();
        let own_id = own_port.id();
        rt.processes.attach_port(pid, own_port);

        Harness {
            rt,
            ctx: ProcessContext::capture(),
            engine: EventEngine::new(),
            transport,
            pools,
            main_id,
            own_id,
            pid,
        }
    }

    fn role(name: &str, stream: u32) -> RoleInit {
        RoleInit::new(name, RoleKind::Router, Box::new(|| Ok(()))).with_stream(stream)
    }

    #[test]
    fn test_full_sequence_without_credential() {
        let mut h = harness(MockTransport::new(), MockPools::new());
        let init = role("router", 7);

        bootstrap(&mut h.rt, &mut h.ctx, &mut h.engine, &init, h.pid).unwrap();

        // Engine rebound, role type active, pool created.
        assert_eq!(h.engine.backend_name(), Some("poll"));
        assert!(h.rt.types.contains(RoleKind::Router));
        assert_eq!(h.pools.created(), vec![(2, AUX_POOL_IDLE_TIMEOUT)]);

        // Lock-down and ready notification, in order, with the
        // configured stream id.
        assert_eq!(
            h.transport.calls(),
            vec![
                TransportCall::CloseRead(h.main_id),
                TransportCall::OpenWrite(h.main_id),
                TransportCall::CloseWrite(h.own_id),
                TransportCall::Enable(h.own_id),
                TransportCall::Send {
                    port: h.main_id,
                    kind: MessageKind::Ready,
                    stream: 7
                },
            ]
        );
    }

    #[test]
    fn test_engine_lookup_failure_stops_before_any_port_work() {
        let mut h = harness(MockTransport::new(), MockPools::new());
        let mut config = RuntimeConfig::default();
        config.engine = "epoll".to_string();
        h.rt = Runtime::new(&config)
            .with_transport(h.transport.clone())
            .with_pools(h.pools.clone());

        let init = role("router", 0);
        let err = bootstrap(&mut h.rt, &mut h.ctx, &mut h.engine, &init, h.pid).unwrap_err();
        assert!(matches!(err, CoreError::EngineNotFound(_)));
        assert!(h.transport.calls().is_empty());
        assert!(h.pools.created().is_empty());
    }

    #[test]
    fn test_rebind_failure_terminates_before_port_handlers_enable() {
        let mut h = harness(MockTransport::new(), MockPools::new());
        // Shadow the default backend with one that refuses to attach.
        h.rt.engines
            .register(Arc::new(MockEngineBackend::new("poll").refuse_attach()));

        let init = role("router", 0);
        let err = bootstrap(&mut h.rt, &mut h.ctx, &mut h.engine, &init, h.pid).unwrap_err();
        assert!(matches!(err, CoreError::EngineRebind(_)));
        assert!(h.transport.enabled_ports().is_empty());
        assert!(!h
            .transport
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::Send { .. })));
    }

    #[test]
    fn test_pool_failure_stops_before_port_handlers_enable() {
        let mut h = harness(MockTransport::new(), MockPools::new().refuse_creation());
        let init = role("router", 0);
        let err = bootstrap(&mut h.rt, &mut h.ctx, &mut h.engine, &init, h.pid).unwrap_err();
        assert!(matches!(err, CoreError::ThreadPools(_)));
        assert!(h.transport.enabled_ports().is_empty());
    }

    #[test]
    fn test_entry_point_failure_stops_before_port_handlers_enable() {
        let mut h = harness(MockTransport::new(), MockPools::new());
        let init = RoleInit::new(
            "router",
            RoleKind::Router,
            Box::new(|| Err(CoreError::EntryPoint("role refused to start".to_string()))),
        );

        let err = bootstrap(&mut h.rt, &mut h.ctx, &mut h.engine, &init, h.pid).unwrap_err();
        assert!(matches!(err, CoreError::EntryPoint(_)));
        assert!(h.transport.enabled_ports().is_empty());
        assert!(!h
            .transport
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::Send { .. })));
    }

    #[test]
    fn test_ready_send_failure_is_an_error() {
        let mut h = harness(MockTransport::new().refuse_sends(), MockPools::new());
        let init = role("router", 3);
        let err = bootstrap(&mut h.rt, &mut h.ctx, &mut h.engine, &init, h.pid).unwrap_err();
        assert!(matches!(err, CoreError::PortSend(_)));
    }

    #[test]
    fn test_missing_main_port_is_fatal() {
        let transport = Arc::new(MockTransport::new());
        let mut rt = Runtime::new(&RuntimeConfig::default()).with_transport(transport.clone());
        let pid = Pid::from_raw(1);
        rt.processes.add(ProcessRecord::new(
            pid,
            Arc::new(RoleInit::new("router", RoleKind::Router, Box::new(|| Ok(())))),
        ));

        let mut ctx = ProcessContext::capture();
        let mut engine = EventEngine::new();
        let init = role("router", 0);
        let err = bootstrap(&mut rt, &mut ctx, &mut engine, &init, pid).unwrap_err();
        assert!(matches!(err, CoreError::PortSend(_)));
    }
}
