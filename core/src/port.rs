//! Port endpoints and the transport seam
//!
//! A port is a bidirectional IPC endpoint identified by its owning
//! process id plus a per-process port id. The wire-level encoding and
//! read/write scheduling live behind the [`PortTransport`] trait; this
//! module only tracks identity, ownership, and direction state.

use crate::Result;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Per-process port identifier; unique together with the owning pid.
pub type PortId = u32;

/// Allocator for local port ids.
///
/// A forked child resets it so its allocations cannot collide with ids
/// the parent handed out before the fork.
#[derive(Debug, Default)]
pub struct PortIdAllocator {
    next: AtomicU32,
}

impl PortIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> PortId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Restart allocation from zero (post-fork repair step).
    pub fn reset(&self) {
        self.next.store(0, Ordering::Relaxed);
    }
}

/// Kinds of messages this core sends or names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Bootstrap-complete notification to the main process.
    Ready,
    Data,
    Quit,
}

/// Handler a role registers for one message kind.
pub type PortHandler = fn(&[u8]);

/// Message handlers a role declares for its port.
///
/// Opaque to this core; the transport consumes it when full read/write
/// handling is enabled.
#[derive(Debug, Default)]
pub struct HandlerTable {
    handlers: HashMap<MessageKind, PortHandler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, kind: MessageKind, handler: PortHandler) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: MessageKind) -> Option<PortHandler> {
        self.handlers.get(&kind).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// One IPC endpoint.
///
/// The owner back-reference is set when the port is attached to a process
/// record; both directions start open and are locked down during
/// bootstrap.
#[derive(Debug)]
pub struct Port {
    id: PortId,
    /// Raw pid of the owning process; 0 while unattached.
    owner: AtomicI32,
    read_open: AtomicBool,
    write_open: AtomicBool,
}

impl Port {
    pub fn new(id: PortId) -> Self {
        Self {
            id,
            owner: AtomicI32::new(0),
            read_open: AtomicBool::new(true),
            write_open: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn owner(&self) -> Option<Pid> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    pub(crate) fn bind_to(&self, pid: Pid) {
        self.owner.store(pid.as_raw(), Ordering::Release);
    }

    pub fn is_read_open(&self) -> bool {
        self.read_open.load(Ordering::Acquire)
    }

    pub fn is_write_open(&self) -> bool {
        self.write_open.load(Ordering::Acquire)
    }

    pub fn mark_read_closed(&self) {
        self.read_open.store(false, Ordering::Release);
    }

    pub fn mark_write_closed(&self) {
        self.write_open.store(false, Ordering::Release);
    }

    pub fn mark_write_open(&self) {
        self.write_open.store(true, Ordering::Release);
    }
}

/// The consumed port-transport contract.
///
/// Direction changes are infallible state transitions; only `send` can
/// fail.
pub trait PortTransport: Send + Sync {
    fn open_write(&self, port: &Port);
    fn close_write(&self, port: &Port);
    fn close_read(&self, port: &Port);
    /// Enable full read/write handling with the role's handler table.
    fn enable(&self, port: &Port, handlers: &HandlerTable);
    fn send(&self, port: &Port, kind: MessageKind, payload: &[u8], stream: u32) -> Result<()>;
}

/// Transport wiring that flips direction state and logs; the daemon uses
/// it where no wire-level transport is configured.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogTransport;

impl LogTransport {
    pub fn new() -> Self {
        Self
    }
}

impl PortTransport for LogTransport {
    fn open_write(&self, port: &Port) {
        port.mark_write_open();
        debug!("port {} write enabled", port.id());
    }

    fn close_write(&self, port: &Port) {
        port.mark_write_closed();
        debug!("port {} write closed", port.id());
    }

    fn close_read(&self, port: &Port) {
        port.mark_read_closed();
        debug!("port {} read closed", port.id());
    }

    fn enable(&self, port: &Port, handlers: &HandlerTable) {
        debug!("port {} enabled with {} handlers", port.id(), handlers.len());
    }

    fn send(&self, port: &Port, kind: MessageKind, payload: &[u8], stream: u32) -> Result<()> {
        debug!(
            "port {} send {:?} ({} bytes) stream {}",
            port.id(),
            kind,
            payload.len(),
            stream
        );
        Ok(())
    }
}

/// Recorded transport operation, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    OpenWrite(PortId),
    CloseWrite(PortId),
    CloseRead(PortId),
    Enable(PortId),
    Send {
        port: PortId,
        kind: MessageKind,
        stream: u32,
    },
}

/// Mock transport for tests: records every call and optionally refuses
/// sends.
#[derive(Debug, Default)]
pub struct MockTransport {
    calls: Mutex<Vec<TransportCall>>,
    fail_sends: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_sends(self) -> Self {
        self.fail_sends.store(true, Ordering::Relaxed);
        self
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn enabled_ports(&self) -> Vec<PortId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::Enable(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl PortTransport for MockTransport {
    fn open_write(&self, port: &Port) {
        port.mark_write_open();
        self.record(TransportCall::OpenWrite(port.id()));
    }

    fn close_write(&self, port: &Port) {
        port.mark_write_closed();
        self.record(TransportCall::CloseWrite(port.id()));
    }

    fn close_read(&self, port: &Port) {
        port.mark_read_closed();
        self.record(TransportCall::CloseRead(port.id()));
    }

    fn enable(&self, port: &Port, _handlers: &HandlerTable) {
        self.record(TransportCall::Enable(port.id()));
    }

    fn send(&self, port: &Port, kind: MessageKind, _payload: &[u8], stream: u32) -> Result<()> {
        self.record(TransportCall::Send {
            port: port.id(),
            kind,
            stream,
        });
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(crate::CoreError::PortSend(format!(
                "send refused on port {}",
                port.id()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_is_monotonic_until_reset() {
        let alloc = PortIdAllocator::new();
        assert_eq!(alloc.next(), 0);
        assert_eq!(alloc.next(), 1);
        assert_eq!(alloc.next(), 2);
        alloc.reset();
        assert_eq!(alloc.next(), 0);
    }

    #[test]
    fn test_port_directions_start_open() {
        let port = Port::new(3);
        assert!(port.is_read_open());
        assert!(port.is_write_open());
        assert_eq!(port.owner(), None);
    }

    #[test]
    fn test_log_transport_flips_direction_state() {
        let transport = LogTransport::new();
        let port = Port::new(0);
        transport.close_read(&port);
        transport.close_write(&port);
        assert!(!port.is_read_open());
        assert!(!port.is_write_open());
        transport.open_write(&port);
        assert!(port.is_write_open());
    }

    #[test]
    fn test_handler_table_lookup() {
        fn on_data(_: &[u8]) {}
        let table = HandlerTable::new().on(MessageKind::Data, on_data);
        assert_eq!(table.len(), 1);
        assert!(table.get(MessageKind::Data).is_some());
        assert!(table.get(MessageKind::Quit).is_none());
    }

    #[test]
    fn test_mock_transport_records_in_order() {
        let transport = MockTransport::new();
        let port = Port::new(9);
        transport.close_read(&port);
        transport.open_write(&port);
        transport
            .send(&port, MessageKind::Ready, &[], 42)
            .unwrap();
        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::CloseRead(9),
                TransportCall::OpenWrite(9),
                TransportCall::Send {
                    port: 9,
                    kind: MessageKind::Ready,
                    stream: 42
                },
            ]
        );
    }

    #[test]
    fn test_mock_transport_send_refusal() {
        let transport = MockTransport::new().refuse_sends();
        let port = Port::new(1);
        assert!(transport.send(&port, MessageKind::Ready, &[], 0).is_err());
    }
}
