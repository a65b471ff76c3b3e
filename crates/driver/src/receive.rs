//! Receive engine
//!
//! Keeps exactly one bulk-in transfer armed per active session. Each
//! successful completion is split into frames, copied into right-sized pool
//! buffers, stamped and handed to the network stack; then the same transfer
//! buffer goes straight back to the transport under a fresh id before the
//! handler returns. A failed or cancelled completion ends the loop.

use tracing::{debug, trace, warn};

use crate::engine::{CompletionHandler, CompletionOutcome, EngineContext};
use crate::error::{DriverError, Result, TransferStatus};
use crate::frame::Frame;
use crate::pool::{BufferAllocator, FrameBuffer};
use crate::session::{LifecycleState, Session};
use crate::transport::{
    Completion, NetInterface, NetworkStack, SubmitError, TransferId, TransferRequest,
    TransferRole,
};

/// Default bulk-in read size: a full Ethernet frame plus RNDIS header, rounded up
pub const DEFAULT_RX_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy)]
pub struct ReceiveEngine {
    buffer_size: usize,
}

impl ReceiveEngine {
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Arm the first receive of a freshly activated session
    pub(crate) fn start<N: NetworkStack, A: BufferAllocator>(
        &self,
        session: &mut Session<N::Interface>,
        ctx: &mut EngineContext<'_, N, A>,
    ) -> Result<TransferId> {
        if session.state != LifecycleState::Active {
            return Err(DriverError::InvalidState {
                operation: "start receiving",
                state: session.state,
            });
        }

        let buffer = ctx.allocator.allocate(self.buffer_size)?;
        self.submit(session, ctx, buffer)
    }

    fn submit<N: NetworkStack, A: BufferAllocator>(
        &self,
        session: &mut Session<N::Interface>,
        ctx: &mut EngineContext<'_, N, A>,
        mut buffer: FrameBuffer,
    ) -> Result<TransferId> {
        buffer.prepare_read();
        let id = ctx.ids.next();
        let request = TransferRequest {
            id,
            role: TransferRole::Receive,
            endpoint: session.selection.bulk_in,
            buffer,
        };

        match session.transport.submit(request) {
            Ok(()) => {
                session.rx_transfer = Some(id);
                trace!(
                    "{}: armed {} on endpoint {:#04x}",
                    session.id, id, session.selection.bulk_in.address
                );
                Ok(id)
            }
            Err(SubmitError { status, buffer }) => {
                ctx.allocator.release(buffer);
                warn!(
                    "{}: bulk-in submission on {:#04x} refused: {}",
                    session.id, session.selection.bulk_in.address, status
                );
                Err(DriverError::TransferFailed(status))
            }
        }
    }

    /// Split a completed transfer into frames and hand them to the stack
    fn deliver<N: NetworkStack, A: BufferAllocator>(
        &self,
        session: &mut Session<N::Interface>,
        ctx: &mut EngineContext<'_, N, A>,
        data: &[u8],
    ) {
        let payloads = match session.framing.decode(data) {
            Ok(payloads) => payloads,
            Err(e) => {
                session.stats.rx_errors += 1;
                warn!("{}: dropping {} byte transfer: {}", session.id, data.len(), e);
                return;
            }
        };

        let Some(interface) = session.interface.as_ref() else {
            return;
        };

        for payload in payloads {
            match ctx.allocator.allocate(payload.len()) {
                Ok(mut buffer) => {
                    buffer.extend_from_slice(payload);
                    let frame = Frame::stamp(buffer, interface.mac());
                    trace!(
                        "{}: rx {} bytes, protocol {:#06x}, {:?}",
                        session.id,
                        frame.len(),
                        frame.protocol(),
                        frame.packet_type()
                    );
                    session.stats.rx_packets += 1;
                    session.stats.rx_bytes += payload.len() as u64;
                    ctx.stack.ingest(interface, frame);
                }
                Err(e) => {
                    session.stats.rx_dropped += 1;
                    warn!("{}: dropping received frame: {}", session.id, e);
                }
            }
        }
    }
}

impl Default for ReceiveEngine {
    fn default() -> Self {
        Self::new(DEFAULT_RX_BUFFER_SIZE)
    }
}

impl CompletionHandler for ReceiveEngine {
    fn role(&self) -> TransferRole {
        TransferRole::Receive
    }

    fn handle_completion<N: NetworkStack, A: BufferAllocator>(
        &self,
        session: &mut Session<N::Interface>,
        ctx: &mut EngineContext<'_, N, A>,
        completion: Completion,
    ) -> CompletionOutcome {
        let Completion { id, status, buffer } = completion;

        if session.rx_transfer == Some(id) {
            session.rx_transfer = None;
        } else {
            warn!(
                "{}: receive completion for {} but {:?} is armed",
                session.id, id, session.rx_transfer
            );
        }

        if !status.is_success() {
            ctx.allocator.release(buffer);
            if status != TransferStatus::Cancelled {
                session.stats.rx_errors += 1;
            }
            debug!("{}: receive loop stopped: {}", session.id, status);
            return CompletionOutcome::Stopped(DriverError::TransferFailed(status));
        }

        if session.state != LifecycleState::Active {
            // Completed while a cancel was in flight; the interface is already gone
            ctx.allocator.release(buffer);
            return CompletionOutcome::Stopped(DriverError::InvalidState {
                operation: "resubmit receive",
                state: session.state,
            });
        }

        self.deliver(session, ctx, &buffer);

        match self.submit(session, ctx, buffer) {
            Ok(next) => CompletionOutcome::Resubmitted(next),
            Err(e) => CompletionOutcome::Stopped(e),
        }
    }
}
