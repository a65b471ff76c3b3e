//! Shared plumbing for the receive and transmit engines

use crate::error::DriverError;
use crate::pool::BufferAllocator;
use crate::session::Session;
use crate::transport::{Completion, NetworkStack, TransferId, TransferRole};

/// Mints transfer ids; never reuses one
#[derive(Debug, Default)]
pub(crate) struct TransferIds {
    next: u64,
}

impl TransferIds {
    pub(crate) fn next(&mut self) -> TransferId {
        self.next += 1;
        TransferId(self.next)
    }
}

/// What an engine may touch besides the session itself
pub(crate) struct EngineContext<'a, N, A> {
    pub(crate) stack: &'a mut N,
    pub(crate) allocator: &'a A,
    pub(crate) ids: &'a mut TransferIds,
}

/// Result of handling one completion
#[derive(Debug)]
pub(crate) enum CompletionOutcome {
    /// Nothing follows from this completion
    Done,
    /// A fresh transfer took the completed one's place
    Resubmitted(TransferId),
    /// The receive loop ended
    Stopped(DriverError),
}

/// Capability shared by both engines: consume a completion for a transfer
/// they submitted
pub(crate) trait CompletionHandler {
    fn role(&self) -> TransferRole;

    fn handle_completion<N: NetworkStack, A: BufferAllocator>(
        &self,
        session: &mut Session<N::Interface>,
        ctx: &mut EngineContext<'_, N, A>,
        completion: Completion,
    ) -> CompletionOutcome;
}
