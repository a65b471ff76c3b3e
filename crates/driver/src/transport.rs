//! Collaborator contracts
//!
//! The core never touches a USB controller or a host network stack directly.
//! It drives a [`Transport`] for bulk transfers and a [`NetworkStack`] for the
//! host-side interface. Buffers move by value: a [`TransferRequest`] hands its
//! buffer to the transport and the matching [`Completion`] hands it back, so a
//! buffer cannot be freed while a submission referencing it is outstanding.

use common::{EndpointDescriptor, MacAddress};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::error::{Result, TransferStatus};
use crate::frame::Frame;
use crate::pool::FrameBuffer;
use crate::session::SessionId;

/// Identifies one submitted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xfer-{}", self.0)
    }
}

/// Which engine a transfer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferRole {
    Receive,
    Transmit,
}

/// A bulk transfer handed to the transport
#[derive(Debug)]
pub struct TransferRequest {
    pub id: TransferId,
    pub role: TransferRole,
    pub endpoint: EndpointDescriptor,
    /// For receives: zero-filled to the read size. For transmits: the bytes to send.
    pub buffer: FrameBuffer,
}

impl TransferRequest {
    /// Finish this request with `status`, returning the buffer to the core
    pub fn complete(self, status: TransferStatus) -> Completion {
        Completion {
            id: self.id,
            status,
            buffer: self.buffer,
        }
    }

    /// Refuse this request, returning the buffer to the core
    pub fn reject(self, status: TransferStatus) -> SubmitError {
        SubmitError {
            status,
            buffer: self.buffer,
        }
    }
}

/// Completion event for a previously submitted transfer
///
/// For a successful receive, `buffer.len()` is the actual transfer length.
#[derive(Debug)]
pub struct Completion {
    pub id: TransferId,
    pub status: TransferStatus,
    pub buffer: FrameBuffer,
}

/// A submission the transport refused; the buffer comes back with it
#[derive(Debug, Error)]
#[error("Transfer submission refused: {status}")]
pub struct SubmitError {
    pub status: TransferStatus,
    pub buffer: FrameBuffer,
}

/// Asynchronous bulk transfer primitive for one device
///
/// Every accepted submission must eventually produce exactly one
/// [`Completion`], including after [`cancel`](Self::cancel). Completions are
/// delivered out of band (see [`crate::CommandSender`]), never from inside
/// `submit` or `cancel`.
pub trait Transport: Send {
    fn submit(&mut self, request: TransferRequest) -> std::result::Result<(), SubmitError>;

    /// Request cancellation; the completion still arrives, usually as
    /// [`TransferStatus::Cancelled`]
    fn cancel(&mut self, id: TransferId);
}

/// Host-side view of a network interface handle
pub trait NetInterface {
    fn name(&self) -> &str;
    fn mac(&self) -> MacAddress;
}

/// Where a [`TransmitEntry`] forwards outbound frames
pub trait TransmitSink: Send + Sync {
    fn transmit(&self, session: SessionId, frame: FrameBuffer);
}

/// Transmit entry point bound to one session's interface
#[derive(Clone)]
pub struct TransmitEntry {
    session: SessionId,
    sink: Arc<dyn TransmitSink>,
}

impl TransmitEntry {
    pub fn new(session: SessionId, sink: Arc<dyn TransmitSink>) -> Self {
        Self { session, sink }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Hand one outbound frame to the driver
    pub fn transmit(&self, frame: FrameBuffer) {
        self.sink.transmit(self.session, frame);
    }
}

impl fmt::Debug for TransmitEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmitEntry")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Host network stack
pub trait NetworkStack {
    type Interface: NetInterface;

    /// Allocate an interface handle; nothing is visible to the host yet
    fn allocate_interface(&mut self, session: SessionId, mac: MacAddress)
    -> Result<Self::Interface>;

    /// Make the interface visible and start calling `entry` with outbound frames
    fn register(&mut self, interface: &mut Self::Interface, entry: TransmitEntry) -> Result<()>;

    /// Stop calling the transmit entry point and hide the interface
    fn unregister(&mut self, interface: &mut Self::Interface);

    /// Free the interface's backing resources
    fn release(&mut self, interface: Self::Interface);

    /// Deliver a received frame; the stack takes ownership
    fn ingest(&mut self, interface: &Self::Interface, frame: Frame);
}
