//! Test utilities for the driver core
//!
//! Mock collaborators that record every call into a shared [`CallLog`], so a
//! test can assert on the relative order of transport and network-stack
//! operations.
//!
//! # Example
//!
//! ```
//! use driver::test_utils::{bulk_in, bulk_out, cdc_interface};
//!
//! let iface = cdc_interface(vec![bulk_in(0x81), bulk_out(0x02)]);
//! assert_eq!(iface.endpoints.len(), 2);
//! ```

use common::{EndpointDescriptor, EndpointTransferType, InterfaceDescriptor, MacAddress};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device_table::{CDC_COMMUNICATIONS_CLASS, CDC_ETHERNET_SUBCLASS};
use crate::error::{DriverError, Result, TransferStatus};
use crate::frame::Frame;
use crate::pool::FrameBuffer;
use crate::session::SessionId;
use crate::transport::{
    Completion, NetInterface, NetworkStack, SubmitError, TransferId, TransferRequest,
    TransferRole, TransmitEntry, TransmitSink, Transport,
};

/// One recorded collaborator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Submit {
        id: TransferId,
        role: TransferRole,
        endpoint: u8,
    },
    Cancel(TransferId),
    AllocateInterface(SessionId),
    Register(SessionId),
    Unregister(SessionId),
    Release(SessionId),
    Ingest {
        session: SessionId,
        len: usize,
    },
}

/// Ordered record of calls, shared by all mocks of one test
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn lock(&self) -> MutexGuard<'_, Vec<Call>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, call: Call) {
        self.lock().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Index of the first call matching `pred`
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.lock().iter().position(pred)
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().iter().filter(|c| pred(c)).count()
    }
}

#[derive(Default)]
struct TransportState {
    pending: BTreeMap<TransferId, TransferRequest>,
    cancelled: Vec<TransferId>,
    refuse_next: Option<TransferStatus>,
    /// Bytes of every accepted bulk-out submission, in order
    sent: Vec<Vec<u8>>,
}

/// Transport that parks submissions until the test completes them
pub struct MockTransport {
    log: CallLog,
    state: Arc<Mutex<TransportState>>,
}

/// Test-side handle onto a [`MockTransport`]'s parked transfers
#[derive(Clone)]
pub struct MockTransportHandle {
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    pub fn new(log: CallLog) -> (Self, MockTransportHandle) {
        let state = Arc::new(Mutex::new(TransportState::default()));
        (
            Self {
                log,
                state: Arc::clone(&state),
            },
            MockTransportHandle { state },
        )
    }
}

impl Transport for MockTransport {
    fn submit(&mut self, request: TransferRequest) -> std::result::Result<(), SubmitError> {
        let mut state = lock(&self.state);
        if let Some(status) = state.refuse_next.take() {
            return Err(request.reject(status));
        }

        self.log.push(Call::Submit {
            id: request.id,
            role: request.role,
            endpoint: request.endpoint.address,
        });
        if request.role == TransferRole::Transmit {
            state.sent.push(request.buffer.to_vec());
        }
        state.pending.insert(request.id, request);
        Ok(())
    }

    fn cancel(&mut self, id: TransferId) {
        self.log.push(Call::Cancel(id));
        lock(&self.state).cancelled.push(id);
    }
}

impl MockTransportHandle {
    pub fn pending(&self) -> Vec<TransferId> {
        lock(&self.state).pending.keys().copied().collect()
    }

    pub fn pending_receive(&self) -> Option<TransferId> {
        self.pending_with_role(TransferRole::Receive).into_iter().next()
    }

    pub fn pending_transmits(&self) -> Vec<TransferId> {
        self.pending_with_role(TransferRole::Transmit)
    }

    fn pending_with_role(&self, role: TransferRole) -> Vec<TransferId> {
        lock(&self.state)
            .pending
            .values()
            .filter(|r| r.role == role)
            .map(|r| r.id)
            .collect()
    }

    /// Endpoint address a parked transfer was submitted on
    pub fn endpoint_of(&self, id: TransferId) -> Option<u8> {
        lock(&self.state)
            .pending
            .get(&id)
            .map(|r| r.endpoint.address)
    }

    /// Read size of a parked transfer's buffer
    pub fn buffer_len(&self, id: TransferId) -> Option<usize> {
        lock(&self.state).pending.get(&id).map(|r| r.buffer.len())
    }

    /// Finish a parked transfer with `status`, buffer untouched
    pub fn complete(&self, id: TransferId, status: TransferStatus) -> Option<Completion> {
        lock(&self.state)
            .pending
            .remove(&id)
            .map(|request| request.complete(status))
    }

    /// Finish the parked receive successfully with `data` as the transferred bytes
    pub fn complete_receive(&self, data: &[u8]) -> Option<Completion> {
        let id = self.pending_receive()?;
        let mut request = lock(&self.state).pending.remove(&id)?;
        request.buffer.clear();
        request.buffer.extend_from_slice(data);
        Some(request.complete(TransferStatus::Completed))
    }

    /// Finish every cancelled transfer still parked, as the controller would
    pub fn complete_cancelled(&self) -> Vec<Completion> {
        let mut state = lock(&self.state);
        let cancelled = std::mem::take(&mut state.cancelled);
        cancelled
            .into_iter()
            .filter_map(|id| state.pending.remove(&id))
            .map(|request| request.complete(TransferStatus::Cancelled))
            .collect()
    }

    pub fn cancelled(&self) -> Vec<TransferId> {
        lock(&self.state).cancelled.clone()
    }

    /// Refuse the next submission with `status`
    pub fn refuse_next(&self, status: TransferStatus) {
        lock(&self.state).refuse_next = Some(status);
    }

    /// Bytes of every accepted bulk-out submission
    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.state).sent.clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Interface handle handed out by [`MockNetworkStack`]
#[derive(Debug)]
pub struct MockInterface {
    session: SessionId,
    name: String,
    mac: MacAddress,
    registered: bool,
}

impl MockInterface {
    pub fn new(session: SessionId, mac: MacAddress) -> Self {
        Self {
            session,
            name: format!("mock{}", session.0),
            mac,
            registered: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }
}

impl NetInterface for MockInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn mac(&self) -> MacAddress {
        self.mac
    }
}

/// Network stack that records calls and panics on ordering violations
///
/// Releasing a registered interface, unregistering twice and ingesting on an
/// unregistered interface all panic.
#[derive(Default)]
pub struct MockNetworkStack {
    log: CallLog,
    fail_register: bool,
    entries: HashMap<SessionId, TransmitEntry>,
    ingested: Vec<(SessionId, Frame)>,
    live: usize,
}

impl MockNetworkStack {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn fail_register(&mut self, fail: bool) {
        self.fail_register = fail;
    }

    /// Frames handed to the stack, in arrival order
    pub fn ingested(&self) -> &[(SessionId, Frame)] {
        &self.ingested
    }

    pub fn take_ingested(&mut self) -> Vec<(SessionId, Frame)> {
        std::mem::take(&mut self.ingested)
    }

    /// Transmit entry bound at registration, while still registered
    pub fn entry(&self, session: SessionId) -> Option<TransmitEntry> {
        self.entries.get(&session).cloned()
    }

    /// Interfaces allocated and not yet released
    pub fn live_interfaces(&self) -> usize {
        self.live
    }
}

impl NetworkStack for MockNetworkStack {
    type Interface = MockInterface;

    fn allocate_interface(&mut self, session: SessionId, mac: MacAddress) -> Result<MockInterface> {
        self.log.push(Call::AllocateInterface(session));
        self.live += 1;
        Ok(MockInterface::new(session, mac))
    }

    fn register(&mut self, interface: &mut MockInterface, entry: TransmitEntry) -> Result<()> {
        if self.fail_register {
            return Err(DriverError::RegistrationFailed(format!(
                "{} refused",
                interface.name
            )));
        }
        self.log.push(Call::Register(interface.session));
        interface.registered = true;
        self.entries.insert(interface.session, entry);
        Ok(())
    }

    fn unregister(&mut self, interface: &mut MockInterface) {
        assert!(interface.registered, "{} unregistered twice", interface.name);
        self.log.push(Call::Unregister(interface.session));
        interface.registered = false;
        self.entries.remove(&interface.session);
    }

    fn release(&mut self, interface: MockInterface) {
        assert!(
            !interface.registered,
            "{} released while registered",
            interface.name
        );
        self.log.push(Call::Release(interface.session));
        self.live -= 1;
    }

    fn ingest(&mut self, interface: &MockInterface, frame: Frame) {
        assert!(
            interface.registered,
            "ingest on unregistered {}",
            interface.name
        );
        self.log.push(Call::Ingest {
            session: interface.session,
            len: frame.len(),
        });
        self.ingested.push((interface.session, frame));
    }
}

/// Sink that records outbound frames instead of forwarding them
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<(SessionId, Vec<u8>)>>,
}

impl RecordingSink {
    pub fn frames(&self) -> Vec<(SessionId, Vec<u8>)> {
        lock(&self.frames).clone()
    }
}

impl TransmitSink for RecordingSink {
    fn transmit(&self, session: SessionId, frame: FrameBuffer) {
        lock(&self.frames).push((session, frame.to_vec()));
    }
}

/// Bulk IN endpoint at `address` (bit 7 set by caller)
pub fn bulk_in(address: u8) -> EndpointDescriptor {
    EndpointDescriptor::new(address, EndpointTransferType::Bulk, 512)
}

pub fn bulk_out(address: u8) -> EndpointDescriptor {
    EndpointDescriptor::new(address, EndpointTransferType::Bulk, 512)
}

pub fn control_endpoint() -> EndpointDescriptor {
    EndpointDescriptor::new(0x00, EndpointTransferType::Control, 64)
}

pub fn interrupt_in(address: u8) -> EndpointDescriptor {
    EndpointDescriptor::new(address, EndpointTransferType::Interrupt, 16)
}

pub fn iso_in(address: u8) -> EndpointDescriptor {
    EndpointDescriptor::new(address, EndpointTransferType::Isochronous, 1024)
}

/// CDC Ethernet control interface carrying `endpoints`
pub fn cdc_interface(endpoints: Vec<EndpointDescriptor>) -> InterfaceDescriptor {
    InterfaceDescriptor {
        number: 0,
        class: CDC_COMMUNICATIONS_CLASS,
        subclass: CDC_ETHERNET_SUBCLASS,
        protocol: 0,
        endpoints,
    }
}

/// Ethernet frame of `len` bytes to `dst` with the given EtherType
///
/// The source address is fixed and the payload is a counting pattern.
pub fn ethernet_frame(dst: MacAddress, ethertype: u16, len: usize) -> Vec<u8> {
    let mut frame = Vec::with_capacity(len.max(14));
    frame.extend_from_slice(dst.as_bytes());
    frame.extend_from_slice(&[0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    let mut n = 0u8;
    while frame.len() < len {
        frame.push(n);
        n = n.wrapping_add(1);
    }
    frame.truncate(len.max(14));
    frame
}
