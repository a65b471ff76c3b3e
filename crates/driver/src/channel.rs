//! Async channel bridge between the Tokio runtime and the driver worker
//!
//! Everything that reaches the lifecycle manager goes through one bounded
//! command queue: hotplug attach and detach from the runtime, completions from
//! transport lanes, outbound frames from network-stack readers.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use common::DeviceKey;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::error::{DriverError, Result};
use crate::lifecycle::{AttachRequest, DetachOutcome};
use crate::pool::FrameBuffer;
use crate::session::{SessionId, SessionInfo, SessionStats};
use crate::transport::{Completion, TransmitSink};

/// Default depth of the command and event queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Commands processed by the driver worker, one at a time
#[derive(Debug)]
pub enum DriverCommand {
    /// Bind a newly discovered device interface
    Attach {
        request: AttachRequest,
        response: Option<oneshot::Sender<Result<SessionId>>>,
    },

    /// Tear down whatever is bound to a device
    Detach {
        device: DeviceKey,
        response: Option<oneshot::Sender<DetachOutcome>>,
    },

    /// A transport finished a transfer
    Complete(Completion),

    /// The network stack has an outbound frame
    Transmit {
        session: SessionId,
        frame: FrameBuffer,
    },

    ListSessions {
        response: oneshot::Sender<Vec<SessionInfo>>,
    },

    /// Detach everything, drain, and stop the worker
    Shutdown,
}

/// Notifications from the driver worker
#[derive(Debug, Clone)]
pub enum DriverEvent {
    SessionActive {
        session: SessionId,
        device: DeviceKey,
        interface: String,
    },
    SessionFailed {
        session: SessionId,
        device: DeviceKey,
        error: String,
    },
    SessionReleased {
        session: SessionId,
        device: DeviceKey,
        stats: SessionStats,
    },
    AttachRejected {
        device: DeviceKey,
        error: String,
    },
}

/// Handle for the Tokio runtime (async)
#[derive(Clone)]
pub struct DriverBridge {
    cmd_tx: Sender<DriverCommand>,
    event_rx: Receiver<DriverEvent>,
}

impl DriverBridge {
    /// Send a command to the driver worker
    pub async fn send_command(&self, cmd: DriverCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| DriverError::Channel(e.to_string()))
    }

    /// Receive an event from the driver worker
    pub async fn recv_event(&self) -> Result<DriverEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| DriverError::Channel(e.to_string()))
    }

    /// Attach and wait for the outcome
    pub async fn attach(&self, request: AttachRequest) -> Result<SessionId> {
        let (tx, rx) = oneshot::channel();
        self.send_command(DriverCommand::Attach {
            request,
            response: Some(tx),
        })
        .await?;
        rx.await
            .map_err(|e| DriverError::Channel(e.to_string()))?
    }

    pub async fn detach(&self, device: DeviceKey) -> Result<DetachOutcome> {
        let (tx, rx) = oneshot::channel();
        self.send_command(DriverCommand::Detach {
            device,
            response: Some(tx),
        })
        .await?;
        rx.await.map_err(|e| DriverError::Channel(e.to_string()))
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let (tx, rx) = oneshot::channel();
        self.send_command(DriverCommand::ListSessions { response: tx })
            .await?;
        rx.await.map_err(|e| DriverError::Channel(e.to_string()))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send_command(DriverCommand::Shutdown).await
    }

    /// Blocking-side sender for transport lanes and stack readers
    pub fn command_sender(&self) -> CommandSender {
        CommandSender {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

/// Handle for the driver worker thread (blocking)
pub struct DriverWorker {
    cmd_rx: Receiver<DriverCommand>,
    cmd_tx: Sender<DriverCommand>,
    event_tx: Sender<DriverEvent>,
}

impl DriverWorker {
    /// Receive a command (blocking)
    pub fn recv_command(&self) -> Result<DriverCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| DriverError::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<DriverCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Publish an event; dropped with a warning if nobody keeps up
    pub fn send_event(&self, event: DriverEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event queue full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Event receiver gone");
            }
        }
    }

    /// Loopback sender, used as the transmit sink of every session
    pub fn command_sender(&self) -> CommandSender {
        CommandSender {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

/// Cloneable blocking sender into the worker's command queue
#[derive(Clone)]
pub struct CommandSender {
    cmd_tx: Sender<DriverCommand>,
}

impl CommandSender {
    /// Queue a command, blocking while the queue is full
    pub fn send(&self, cmd: DriverCommand) -> Result<()> {
        self.cmd_tx
            .send_blocking(cmd)
            .map_err(|e| DriverError::Channel(e.to_string()))
    }

    /// Report a finished transfer
    ///
    /// Blocks rather than drops: every accepted submission owes the worker
    /// exactly one completion.
    pub fn complete(&self, completion: Completion) -> Result<()> {
        self.send(DriverCommand::Complete(completion))
    }
}

impl TransmitSink for CommandSender {
    fn transmit(&self, session: SessionId, frame: FrameBuffer) {
        match self.cmd_tx.try_send(DriverCommand::Transmit { session, frame }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("{}: command queue full, dropping outbound frame", session);
            }
            Err(TrySendError::Closed(_)) => {
                trace!("{}: worker gone, dropping outbound frame", session);
            }
        }
    }
}

/// Create the channel bridge between Tokio and the driver worker
///
/// Returns (DriverBridge for Tokio, DriverWorker for the worker thread)
pub fn create_driver_bridge(capacity: usize) -> (DriverBridge, DriverWorker) {
    let (cmd_tx, cmd_rx) = bounded(capacity);
    let (event_tx, event_rx) = bounded(capacity);

    (
        DriverBridge {
            cmd_tx: cmd_tx.clone(),
            event_rx,
        },
        DriverWorker {
            cmd_rx,
            cmd_tx,
            event_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferAllocator, FramePool};

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_driver_bridge(8);

        let handle = std::thread::spawn(move || {
            let cmd = worker.recv_command().unwrap();
            matches!(cmd, DriverCommand::ListSessions { .. })
        });

        let (tx, _rx) = oneshot::channel();
        bridge
            .send_command(DriverCommand::ListSessions { response: tx })
            .await
            .unwrap();

        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_transmit_sink_drops_when_full() {
        let pool = FramePool::new(4096);
        let (bridge, worker) = create_driver_bridge(1);
        let sink = bridge.command_sender();

        sink.transmit(SessionId(1), pool.allocate(64).unwrap());
        sink.transmit(SessionId(1), pool.allocate(64).unwrap());

        // The second frame was dropped and its lease returned
        assert_eq!(pool.stats().outstanding(), 1);
        assert!(matches!(
            worker.try_recv_command(),
            Some(DriverCommand::Transmit {
                session: SessionId(1),
                ..
            })
        ));
        assert!(worker.try_recv_command().is_none());
    }

    #[tokio::test]
    async fn test_event_queue_overflow_keeps_oldest() {
        let (bridge, worker) = create_driver_bridge(1);
        worker.send_event(DriverEvent::AttachRejected {
            device: DeviceKey::new(1, 1),
            error: "first".into(),
        });
        worker.send_event(DriverEvent::AttachRejected {
            device: DeviceKey::new(1, 2),
            error: "second".into(),
        });

        match bridge.recv_event().await.unwrap() {
            DriverEvent::AttachRejected { device, .. } => assert_eq!(device, DeviceKey::new(1, 1)),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
