//! Session lifecycle
//!
//! [`LifecycleManager`] owns every session and is the only thing that changes
//! a session's state. It runs on a single thread; attach, detach, transmit and
//! completion all arrive as plain method calls from the worker loop.
//!
//! Teardown order on detach:
//!
//! 1. unregister the network interface, so no new transmit can start
//! 2. cancel every outstanding transfer
//! 3. wait for each cancelled transfer's completion, dropping its buffer
//! 4. release the interface and discard the session

use common::{DeviceKey, InterfaceDescriptor, MacAddress};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::classifier::classify_endpoints;
use crate::engine::{CompletionHandler, CompletionOutcome, EngineContext, TransferIds};
use crate::error::{DriverError, Result};
use crate::framing::Framing;
use crate::pool::{BufferAllocator, FrameBuffer};
use crate::receive::{DEFAULT_RX_BUFFER_SIZE, ReceiveEngine};
use crate::session::{LifecycleState, Session, SessionId, SessionInfo, SessionStats};
use crate::transmit::TransmitEngine;
use crate::transport::{
    Completion, NetworkStack, TransferId, TransferRole, TransmitEntry, TransmitSink, Transport,
};

/// Tunables for the lifecycle manager and its worker
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Size of the buffer armed on bulk-in
    pub rx_buffer_size: usize,
    /// How long shutdown waits for cancelled transfers to come back
    pub drain_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything needed to bind one device interface
pub struct AttachRequest {
    pub device: DeviceKey,
    pub interface: InterfaceDescriptor,
    pub framing: Framing,
    pub transport: Box<dyn Transport>,
    /// Hardware address for the host interface; random locally administered if unset
    pub mac: Option<MacAddress>,
}

impl AttachRequest {
    pub fn new(
        device: DeviceKey,
        interface: InterfaceDescriptor,
        framing: Framing,
        transport: impl Transport + 'static,
    ) -> Self {
        Self {
            device,
            interface,
            framing,
            transport: Box::new(transport),
            mac: None,
        }
    }

    pub fn with_mac(mut self, mac: MacAddress) -> Self {
        self.mac = Some(mac);
        self
    }
}

impl fmt::Debug for AttachRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachRequest")
            .field("device", &self.device)
            .field("interface", &self.interface.number)
            .field("framing", &self.framing)
            .field("mac", &self.mac)
            .finish_non_exhaustive()
    }
}

/// Result of a detach request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// Nothing was in flight; the session is gone
    Released,
    /// Cancels issued; the session goes away once these completions return
    Draining { outstanding: usize },
    /// No live session, or one already detaching
    NoOp,
}

/// Something the manager did that the outside world should hear about
#[derive(Debug)]
pub enum LifecycleEvent {
    Activated {
        session: SessionId,
        device: DeviceKey,
        interface: String,
    },
    /// The session hit a fatal transfer error and is detaching on its own
    Failed {
        session: SessionId,
        device: DeviceKey,
        error: DriverError,
    },
    Released {
        session: SessionId,
        device: DeviceKey,
        stats: SessionStats,
    },
}

pub struct LifecycleManager<N: NetworkStack, A: BufferAllocator> {
    config: DriverConfig,
    stack: N,
    allocator: A,
    sink: Arc<dyn TransmitSink>,
    sessions: HashMap<SessionId, Session<N::Interface>>,
    devices: HashMap<DeviceKey, SessionId>,
    /// Lookup only; the transport owns the buffer until the completion
    routes: HashMap<TransferId, (SessionId, TransferRole)>,
    ids: TransferIds,
    next_session: u32,
    receive: ReceiveEngine,
    transmit: TransmitEngine,
    events: Vec<LifecycleEvent>,
}

impl<N: NetworkStack, A: BufferAllocator> LifecycleManager<N, A> {
    pub fn new(config: DriverConfig, stack: N, allocator: A, sink: Arc<dyn TransmitSink>) -> Self {
        let receive = ReceiveEngine::new(config.rx_buffer_size);
        Self {
            config,
            stack,
            allocator,
            sink,
            sessions: HashMap::new(),
            devices: HashMap::new(),
            routes: HashMap::new(),
            ids: TransferIds::default(),
            next_session: 0,
            receive,
            transmit: TransmitEngine::new(),
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Bind a device: classify, bring up the interface, arm the first receive
    ///
    /// On error nothing of the attempt remains: no session, no registered
    /// interface, no transfer in flight.
    pub fn attach(&mut self, request: AttachRequest) -> Result<SessionId> {
        let AttachRequest {
            device,
            interface,
            framing,
            transport,
            mac,
        } = request;

        if let Some(existing) = self.devices.get(&device).and_then(|id| self.sessions.get(id)) {
            return Err(DriverError::InvalidState {
                operation: "attach",
                state: existing.state,
            });
        }

        let selection = classify_endpoints(&interface.endpoints)?;
        debug!(
            "{}: interface {} bulk-in {:#04x}, bulk-out {:#04x}",
            device, interface.number, selection.bulk_in.address, selection.bulk_out.address
        );

        self.next_session += 1;
        let id = SessionId(self.next_session);
        let mac = mac.unwrap_or_else(MacAddress::random_local);

        let handle = self.stack.allocate_interface(id, mac)?;
        let mut session = Session::new(id, device, selection, framing, transport, handle);

        let entry = TransmitEntry::new(id, Arc::clone(&self.sink));
        if let Some(handle) = session.interface.as_mut()
            && let Err(e) = self.stack.register(handle, entry)
        {
            if let Some(handle) = session.interface.take() {
                self.stack.release(handle);
            }
            warn!("{}: interface registration failed: {}", device, e);
            return Err(match e {
                DriverError::RegistrationFailed(_) => e,
                other => DriverError::RegistrationFailed(other.to_string()),
            });
        }
        session.state = LifecycleState::Active;

        let mut ctx = EngineContext {
            stack: &mut self.stack,
            allocator: &self.allocator,
            ids: &mut self.ids,
        };
        match self.receive.start(&mut session, &mut ctx) {
            Ok(rx) => {
                self.routes.insert(rx, (id, TransferRole::Receive));
            }
            Err(e) => {
                session.state = LifecycleState::Detaching;
                if let Some(mut handle) = session.interface.take() {
                    self.stack.unregister(&mut handle);
                    self.stack.release(handle);
                }
                warn!("{}: first receive could not be armed: {}", device, e);
                return Err(e);
            }
        }

        let name = session.info().interface;
        info!("{} active: {} on {} ({})", id, name, device, framing);
        self.events.push(LifecycleEvent::Activated {
            session: id,
            device,
            interface: name,
        });
        self.devices.insert(device, id);
        self.sessions.insert(id, session);

        Ok(id)
    }

    /// Begin tearing down the session bound to `device`
    pub fn detach(&mut self, device: DeviceKey) -> DetachOutcome {
        match self.devices.get(&device) {
            Some(id) => self.detach_session(*id),
            None => {
                debug!("{}: detach for unknown device", device);
                DetachOutcome::NoOp
            }
        }
    }

    pub fn detach_session(&mut self, id: SessionId) -> DetachOutcome {
        let Some(session) = self.sessions.get_mut(&id) else {
            return DetachOutcome::NoOp;
        };
        if session.state != LifecycleState::Active {
            debug!("{}: detach ignored while {}", id, session.state);
            return DetachOutcome::NoOp;
        }

        session.state = LifecycleState::Detaching;
        if let Some(handle) = session.interface.as_mut() {
            self.stack.unregister(handle);
        }

        let outstanding = session.outstanding();
        for transfer in &outstanding {
            session.transport.cancel(*transfer);
        }

        if outstanding.is_empty() {
            self.finish_release(id);
            DetachOutcome::Released
        } else {
            debug!("{}: draining {} transfers", id, outstanding.len());
            DetachOutcome::Draining {
                outstanding: outstanding.len(),
            }
        }
    }

    /// Detach every active session; returns how many are still draining
    pub fn detach_all(&mut self) -> usize {
        let mut active: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.state == LifecycleState::Active)
            .map(|s| s.id)
            .collect();
        active.sort();

        for id in active {
            self.detach_session(id);
        }
        self.sessions.len()
    }

    /// Route a transport completion to the engine that submitted it
    pub fn handle_completion(&mut self, completion: Completion) {
        let Some((id, role)) = self.routes.remove(&completion.id) else {
            warn!("Completion for unknown transfer {}", completion.id);
            self.allocator.release(completion.buffer);
            return;
        };
        let Some(session) = self.sessions.get_mut(&id) else {
            warn!("{}: completion {} after release", id, completion.id);
            self.allocator.release(completion.buffer);
            return;
        };

        let mut ctx = EngineContext {
            stack: &mut self.stack,
            allocator: &self.allocator,
            ids: &mut self.ids,
        };
        let outcome = if role == self.receive.role() {
            self.receive.handle_completion(session, &mut ctx, completion)
        } else {
            self.transmit.handle_completion(session, &mut ctx, completion)
        };

        let device = session.device;
        let state = session.state;
        match outcome {
            CompletionOutcome::Done => {}
            CompletionOutcome::Resubmitted(next) => {
                self.routes.insert(next, (id, TransferRole::Receive));
            }
            CompletionOutcome::Stopped(error) if state == LifecycleState::Active => {
                error!("{}: receive failed, detaching: {}", id, error);
                self.events.push(LifecycleEvent::Failed {
                    session: id,
                    device,
                    error,
                });
                self.detach_session(id);
                return;
            }
            CompletionOutcome::Stopped(reason) => {
                debug!("{}: receive drained ({})", id, reason);
            }
        }

        if state == LifecycleState::Detaching
            && self
                .sessions
                .get(&id)
                .is_some_and(|s| s.outstanding_count() == 0)
        {
            self.finish_release(id);
        }
    }

    /// Send one outbound frame on `session`'s bulk-out endpoint
    ///
    /// `frame` is released on every path.
    pub fn transmit(&mut self, session: SessionId, frame: FrameBuffer) -> Result<()> {
        let Some(target) = self.sessions.get_mut(&session) else {
            self.allocator.release(frame);
            return Err(DriverError::SessionNotFound(session));
        };

        let mut ctx = EngineContext {
            stack: &mut self.stack,
            allocator: &self.allocator,
            ids: &mut self.ids,
        };
        let transfer = self.transmit.transmit(target, &mut ctx, frame)?;
        self.routes.insert(transfer, (session, TransferRole::Transmit));
        Ok(())
    }

    fn finish_release(&mut self, id: SessionId) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };
        self.devices.remove(&session.device);

        if let Some(handle) = session.interface.take() {
            self.stack.release(handle);
        }
        session.state = LifecycleState::Released;

        info!("{} released from {}", id, session.device);
        self.events.push(LifecycleEvent::Released {
            session: id,
            device: session.device,
            stats: session.stats,
        });
    }

    /// No session is alive or draining
    pub fn is_idle(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Transfers submitted and not yet completed, across all sessions
    pub fn outstanding_transfers(&self) -> usize {
        self.routes.len()
    }

    /// `Unattached` when the device has no session
    pub fn state_of(&self, device: DeviceKey) -> LifecycleState {
        self.devices
            .get(&device)
            .and_then(|id| self.sessions.get(id))
            .map(|s| s.state)
            .unwrap_or(LifecycleState::Unattached)
    }

    pub fn session_for(&self, device: DeviceKey) -> Option<SessionId> {
        self.devices.get(&device).copied()
    }

    pub fn session_info(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.get(&id).map(|s| s.info())
    }

    pub fn sessions_info(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.values().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Take the events recorded since the last call
    pub fn drain_events(&mut self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn stack(&self) -> &N {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut N {
        &mut self.stack
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }
}

impl<N: NetworkStack, A: BufferAllocator> fmt::Debug for LifecycleManager<N, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("sessions", &self.sessions.len())
            .field("outstanding", &self.routes.len())
            .finish_non_exhaustive()
    }
}
