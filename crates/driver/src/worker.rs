//! Driver worker thread
//!
//! Owns the [`LifecycleManager`] and feeds it one [`DriverCommand`] at a time.
//! The loop blocks on the command queue; there is nothing to poll, since
//! transports report completions as commands too.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::channel::{DriverCommand, DriverEvent, DriverWorker};
use crate::error::DriverError;
use crate::lifecycle::{DetachOutcome, DriverConfig, LifecycleEvent, LifecycleManager};
use crate::pool::BufferAllocator;
use crate::transport::NetworkStack;

/// Pause between queue checks while draining on shutdown
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct DriverWorkerThread<N: NetworkStack, A: BufferAllocator> {
    manager: LifecycleManager<N, A>,
    worker: DriverWorker,
}

impl<N: NetworkStack, A: BufferAllocator> DriverWorkerThread<N, A> {
    pub fn new(config: DriverConfig, stack: N, allocator: A, worker: DriverWorker) -> Self {
        let sink = Arc::new(worker.command_sender());
        Self {
            manager: LifecycleManager::new(config, stack, allocator, sink),
            worker,
        }
    }

    /// Process commands until `Shutdown`, then drain and return the manager
    pub fn run(mut self) -> LifecycleManager<N, A> {
        info!("Driver worker started");

        loop {
            match self.worker.recv_command() {
                Ok(DriverCommand::Shutdown) => {
                    info!("Driver worker shutting down");
                    break;
                }
                Ok(cmd) => self.handle_command(cmd),
                Err(e) => {
                    warn!("Command queue closed: {}", e);
                    break;
                }
            }
            self.forward_events();
        }

        self.drain();
        info!("Driver worker stopped");
        self.manager
    }

    /// Handle a command, keeping the thread alive across panics
    fn handle_command(&mut self, cmd: DriverCommand) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in driver command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: DriverCommand) {
        match cmd {
            DriverCommand::Attach { request, response } => {
                let device = request.device;
                debug!("Attaching {}", device);
                let result = self.manager.attach(request);
                if let Err(e) = &result {
                    warn!("Attach of {} rejected: {}", device, e);
                    self.worker.send_event(DriverEvent::AttachRejected {
                        device,
                        error: e.to_string(),
                    });
                }
                if let Some(response) = response {
                    let _ = response.send(result);
                }
            }

            DriverCommand::Detach { device, response } => {
                let outcome = self.manager.detach(device);
                debug!("Detach of {}: {:?}", device, outcome);
                if let Some(response) = response {
                    let _ = response.send(outcome);
                }
            }

            DriverCommand::Complete(completion) => {
                self.manager.handle_completion(completion);
            }

            DriverCommand::Transmit { session, frame } => {
                if let Err(e) = self.manager.transmit(session, frame) {
                    debug!("{}: transmit dropped: {}", session, e);
                }
            }

            DriverCommand::ListSessions { response } => {
                let _ = response.send(self.manager.sessions_info());
            }

            // Handled by the run loop
            DriverCommand::Shutdown => {}
        }
    }

    /// Detach everything and wait for outstanding completions
    fn drain(&mut self) {
        let draining = self.manager.detach_all();
        self.forward_events();
        if draining == 0 {
            return;
        }

        info!("Waiting for {} sessions to drain", draining);
        let deadline = Instant::now() + self.manager.config().drain_timeout;

        while !self.manager.is_idle() {
            match self.worker.try_recv_command() {
                Some(DriverCommand::Complete(completion)) => {
                    self.manager.handle_completion(completion);
                    self.forward_events();
                }
                Some(DriverCommand::Attach { request, response }) => {
                    debug!("Ignoring attach of {} during shutdown", request.device);
                    if let Some(response) = response {
                        let _ = response.send(Err(DriverError::Channel(
                            "driver is shutting down".into(),
                        )));
                    }
                }
                Some(DriverCommand::Detach { response, .. }) => {
                    if let Some(response) = response {
                        let _ = response.send(DetachOutcome::NoOp);
                    }
                }
                Some(DriverCommand::ListSessions { response }) => {
                    let _ = response.send(self.manager.sessions_info());
                }
                Some(DriverCommand::Transmit { .. } | DriverCommand::Shutdown) => {}
                None => {
                    if Instant::now() >= deadline {
                        error!(
                            "Drain timed out with {} transfers outstanding",
                            self.manager.outstanding_transfers()
                        );
                        break;
                    }
                    std::thread::sleep(DRAIN_POLL_INTERVAL);
                }
            }
        }
    }

    fn forward_events(&mut self) {
        for event in self.manager.drain_events() {
            let event = match event {
                LifecycleEvent::Activated {
                    session,
                    device,
                    interface,
                } => DriverEvent::SessionActive {
                    session,
                    device,
                    interface,
                },
                LifecycleEvent::Failed {
                    session,
                    device,
                    error,
                } => DriverEvent::SessionFailed {
                    session,
                    device,
                    error: error.to_string(),
                },
                LifecycleEvent::Released {
                    session,
                    device,
                    stats,
                } => DriverEvent::SessionReleased {
                    session,
                    device,
                    stats,
                },
            };
            self.worker.send_event(event);
        }
    }
}

/// Spawn the driver worker thread
///
/// The thread runs until a `Shutdown` command arrives and hands the drained
/// manager back through the join handle.
pub fn spawn_driver_worker<N, A>(
    config: DriverConfig,
    stack: N,
    allocator: A,
    worker: DriverWorker,
) -> std::io::Result<JoinHandle<LifecycleManager<N, A>>>
where
    N: NetworkStack + Send + 'static,
    N::Interface: Send,
    A: BufferAllocator + Send + 'static,
{
    std::thread::Builder::new()
        .name("driver-worker".to_string())
        .spawn(move || DriverWorkerThread::new(config, stack, allocator, worker).run())
}
