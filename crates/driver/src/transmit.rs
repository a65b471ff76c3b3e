//! Transmit engine
//!
//! Turns one outbound frame into one bulk-out transfer. The frame is framed
//! into a pool buffer sized for the wire encoding; that buffer travels with
//! the submission and comes back with its completion.

use tracing::{debug, trace, warn};

use crate::engine::{CompletionHandler, CompletionOutcome, EngineContext};
use crate::error::{DriverError, Result, TransferStatus};
use crate::pool::{BufferAllocator, FrameBuffer};
use crate::session::{LifecycleState, Session};
use crate::transport::{
    Completion, NetworkStack, SubmitError, TransferId, TransferRequest, TransferRole,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct TransmitEngine;

impl TransmitEngine {
    pub fn new() -> Self {
        Self
    }

    /// Submit `frame` on the session's bulk-out endpoint
    ///
    /// The input frame is released before this returns, whatever the outcome.
    pub(crate) fn transmit<N: NetworkStack, A: BufferAllocator>(
        &self,
        session: &mut Session<N::Interface>,
        ctx: &mut EngineContext<'_, N, A>,
        frame: FrameBuffer,
    ) -> Result<TransferId> {
        if session.state != LifecycleState::Active {
            ctx.allocator.release(frame);
            session.stats.tx_dropped += 1;
            return Err(DriverError::InvalidState {
                operation: "transmit",
                state: session.state,
            });
        }

        if frame.is_empty() {
            ctx.allocator.release(frame);
            session.stats.tx_dropped += 1;
            return Err(DriverError::Framing("empty frame".into()));
        }

        let mut wire = match ctx.allocator.allocate(session.framing.encoded_len(frame.len())) {
            Ok(buffer) => buffer,
            Err(e) => {
                ctx.allocator.release(frame);
                session.stats.tx_dropped += 1;
                return Err(e);
            }
        };
        session.framing.encode(&frame, &mut wire);
        ctx.allocator.release(frame);

        let id = ctx.ids.next();
        let len = wire.len();
        let request = TransferRequest {
            id,
            role: TransferRole::Transmit,
            endpoint: session.selection.bulk_out,
            buffer: wire,
        };

        match session.transport.submit(request) {
            Ok(()) => {
                session.tx_transfers.insert(id);
                trace!("{}: tx {} as {} ({} bytes)", session.id, id, session.framing, len);
                Ok(id)
            }
            Err(SubmitError { status, buffer }) => {
                ctx.allocator.release(buffer);
                session.stats.tx_errors += 1;
                warn!("{}: bulk-out submission refused: {}", session.id, status);
                Err(DriverError::TransferFailed(status))
            }
        }
    }
}

impl CompletionHandler for TransmitEngine {
    fn role(&self) -> TransferRole {
        TransferRole::Transmit
    }

    fn handle_completion<N: NetworkStack, A: BufferAllocator>(
        &self,
        session: &mut Session<N::Interface>,
        ctx: &mut EngineContext<'_, N, A>,
        completion: Completion,
    ) -> CompletionOutcome {
        let Completion { id, status, buffer } = completion;

        if !session.tx_transfers.remove(&id) {
            warn!("{}: unexpected transmit completion for {}", session.id, id);
        }

        match status {
            TransferStatus::Completed => {
                let overhead = session.framing.encoded_len(0);
                session.stats.tx_packets += 1;
                session.stats.tx_bytes += buffer.len().saturating_sub(overhead) as u64;
            }
            TransferStatus::Cancelled => {
                session.stats.tx_dropped += 1;
                debug!("{}: {} cancelled", session.id, id);
            }
            other => {
                session.stats.tx_errors += 1;
                warn!("{}: {} failed: {}", session.id, id, other);
            }
        }

        ctx.allocator.release(buffer);
        CompletionOutcome::Done
    }
}
