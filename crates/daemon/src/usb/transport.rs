//! libusb-backed [`Transport`]
//!
//! libusb's synchronous bulk calls block, so each device gets two lane
//! threads: the IN lane serves the (single) armed receive and the OUT lane
//! serves transmits in submission order. Lanes report completions straight
//! into the driver command queue through a [`CommandSender`].
//!
//! The IN lane reads with a short poll timeout and re-checks for cancellation
//! between polls; a poll that times out is not a failure. The OUT lane writes
//! with the configured transmit timeout and does surface it.

use common::DeviceKey;
use driver::{
    CommandSender, SubmitError, TransferId, TransferRequest, TransferStatus, Transport,
};
use rusb::{DeviceHandle, UsbContext};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Bulk-in read timeout between cancellation checks
    pub poll_timeout: Duration,
    /// Bulk-out write timeout
    pub tx_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            tx_timeout: Duration::from_secs(1),
        }
    }
}

/// Blocking bulk I/O on an opened device
pub trait BulkPipe: Send + Sync + 'static {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;
    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize>;
}

impl<T: UsbContext + 'static> BulkPipe for DeviceHandle<T> {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::read_bulk(self, endpoint, buf, timeout)
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::write_bulk(self, endpoint, buf, timeout)
    }
}

/// Map rusb errors onto transfer statuses
pub fn map_rusb_error(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::Timeout,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::NoDevice | rusb::Error::NotFound => TransferStatus::NoDevice,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::Io => TransferStatus::Io,
        rusb::Error::Interrupted => TransferStatus::Cancelled,
        _ => TransferStatus::Other(err.to_string()),
    }
}

/// A bulk-out transfer of a whole number of max-size packets needs a
/// zero-length packet so the device sees where it ends
pub fn needs_zlp(len: usize, max_packet_size: u16) -> bool {
    max_packet_size > 0 && len > 0 && len % max_packet_size as usize == 0
}

#[derive(Default)]
struct LaneState {
    in_flight: HashSet<TransferId>,
    cancelled: HashSet<TransferId>,
}

/// State shared between the transport and its lanes
#[derive(Default)]
struct Lanes {
    state: Mutex<LaneState>,
    closed: AtomicBool,
}

impl Lanes {
    fn track(&self, id: TransferId) {
        if let Ok(mut state) = self.state.lock() {
            state.in_flight.insert(id);
        }
    }

    fn cancel(&self, id: TransferId) -> bool {
        match self.state.lock() {
            Ok(mut state) if state.in_flight.contains(&id) => state.cancelled.insert(id),
            _ => false,
        }
    }

    fn is_cancelled(&self, id: TransferId) -> bool {
        self.closed.load(Ordering::Acquire)
            || self
                .state
                .lock()
                .map(|state| state.cancelled.contains(&id))
                .unwrap_or(true)
    }

    fn finish(&self, id: TransferId) {
        if let Ok(mut state) = self.state.lock() {
            state.in_flight.remove(&id);
            state.cancelled.remove(&id);
        }
    }
}

/// Bulk transport for one device over libusb
pub struct RusbTransport {
    device: DeviceKey,
    in_lane: Option<mpsc::Sender<TransferRequest>>,
    out_lane: Option<mpsc::Sender<TransferRequest>>,
    lanes: Arc<Lanes>,
    threads: Vec<JoinHandle<()>>,
}

impl RusbTransport {
    /// Start the IN and OUT lanes for `device`
    pub fn new<P: BulkPipe>(
        device: DeviceKey,
        pipe: Arc<P>,
        config: TransportConfig,
        completions: CommandSender,
    ) -> std::io::Result<Self> {
        let lanes = Arc::new(Lanes::default());
        let (in_tx, in_rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel();

        let in_thread = {
            let pipe = pipe.clone();
            let lanes = lanes.clone();
            let completions = completions.clone();
            std::thread::Builder::new()
                .name(format!("usb-in-{}", device))
                .spawn(move || {
                    run_in_lane(&*pipe, in_rx, &lanes, config.poll_timeout, &completions)
                })?
        };

        let out_thread = {
            let lanes = lanes.clone();
            std::thread::Builder::new()
                .name(format!("usb-out-{}", device))
                .spawn(move || {
                    run_out_lane(&*pipe, out_rx, &lanes, config.tx_timeout, &completions)
                })?
        };

        debug!("{}: transport lanes started", device);
        Ok(Self {
            device,
            in_lane: Some(in_tx),
            out_lane: Some(out_tx),
            lanes,
            threads: vec![in_thread, out_thread],
        })
    }
}

impl Transport for RusbTransport {
    fn submit(&mut self, request: TransferRequest) -> Result<(), SubmitError> {
        let lane = match request.endpoint.direction() {
            common::Direction::In => self.in_lane.as_ref(),
            common::Direction::Out => self.out_lane.as_ref(),
        };
        let Some(lane) = lane else {
            return Err(request.reject(TransferStatus::NoDevice));
        };

        let id = request.id;
        self.lanes.track(id);
        trace!(
            "{}: submit {} on {:#04x}",
            self.device, id, request.endpoint.address
        );
        lane.send(request).map_err(|mpsc::SendError(request)| {
            self.lanes.finish(id);
            request.reject(TransferStatus::NoDevice)
        })
    }

    fn cancel(&mut self, id: TransferId) {
        if self.lanes.cancel(id) {
            trace!("{}: cancel {}", self.device, id);
        }
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        self.lanes.closed.store(true, Ordering::Release);
        self.in_lane.take();
        self.out_lane.take();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("{}: transport lane panicked", self.device);
            }
        }
        debug!("{}: transport lanes stopped", self.device);
    }
}

fn run_in_lane<P: BulkPipe + ?Sized>(
    pipe: &P,
    requests: mpsc::Receiver<TransferRequest>,
    lanes: &Lanes,
    poll_timeout: Duration,
    completions: &CommandSender,
) {
    while let Ok(mut request) = requests.recv() {
        let address = request.endpoint.address;
        let status = loop {
            if lanes.is_cancelled(request.id) {
                break TransferStatus::Cancelled;
            }
            match pipe.read_bulk(address, &mut request.buffer[..], poll_timeout) {
                Ok(n) => {
                    request.buffer.truncate(n);
                    break TransferStatus::Completed;
                }
                Err(rusb::Error::Timeout) => continue,
                Err(e) => break map_rusb_error(e),
            }
        };

        lanes.finish(request.id);
        if completions.complete(request.complete(status)).is_err() {
            debug!("Driver gone, IN lane exiting");
            return;
        }
    }
}

fn run_out_lane<P: BulkPipe + ?Sized>(
    pipe: &P,
    requests: mpsc::Receiver<TransferRequest>,
    lanes: &Lanes,
    tx_timeout: Duration,
    completions: &CommandSender,
) {
    while let Ok(request) = requests.recv() {
        let status = if lanes.is_cancelled(request.id) {
            TransferStatus::Cancelled
        } else {
            write_transfer(pipe, &request, tx_timeout)
        };

        lanes.finish(request.id);
        if completions.complete(request.complete(status)).is_err() {
            debug!("Driver gone, OUT lane exiting");
            return;
        }
    }
}

fn write_transfer<P: BulkPipe + ?Sized>(
    pipe: &P,
    request: &TransferRequest,
    timeout: Duration,
) -> TransferStatus {
    let endpoint = request.endpoint;
    let data = &request.buffer[..];

    match pipe.write_bulk(endpoint.address, data, timeout) {
        Ok(n) if n < data.len() => {
            return TransferStatus::Other(format!("short write: {} of {} bytes", n, data.len()));
        }
        Ok(_) => {}
        Err(e) => return map_rusb_error(e),
    }

    if needs_zlp(data.len(), endpoint.max_packet_size)
        && let Err(e) = pipe.write_bulk(endpoint.address, &[], timeout)
    {
        return map_rusb_error(e);
    }

    TransferStatus::Completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use driver::test_utils::{bulk_in, bulk_out};
    use driver::{
        BufferAllocator, DriverCommand, DriverWorker, FramePool, TransferRole, create_driver_bridge,
    };
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Scripted pipe: reads pop from a queue (timing out when empty), writes are recorded
    #[derive(Default)]
    struct FakePipe {
        reads: Mutex<VecDeque<rusb::Result<Vec<u8>>>>,
        writes: Mutex<Vec<Vec<u8>>>,
        write_error: Mutex<Option<rusb::Error>>,
    }

    impl BulkPipe for FakePipe {
        fn read_bulk(&self, _: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
            let next = self.reads.lock().unwrap().pop_front();
            match next {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => {
                    std::thread::sleep(timeout);
                    Err(rusb::Error::Timeout)
                }
            }
        }

        fn write_bulk(&self, _: u8, buf: &[u8], _: Duration) -> rusb::Result<usize> {
            if let Some(e) = self.write_error.lock().unwrap().take() {
                return Err(e);
            }
            self.writes.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }
    }

    const CONFIG: TransportConfig = TransportConfig {
        poll_timeout: Duration::from_millis(5),
        tx_timeout: Duration::from_millis(50),
    };

    fn setup(pipe: Arc<FakePipe>) -> (RusbTransport, DriverWorker) {
        let (bridge, worker) = create_driver_bridge(16);
        let transport =
            RusbTransport::new(DeviceKey::new(1, 2), pipe, CONFIG, bridge.command_sender()).unwrap();
        (transport, worker)
    }

    fn receive(pool: &FramePool, id: u64) -> TransferRequest {
        let mut buffer = pool.allocate(64).unwrap();
        buffer.prepare_read();
        TransferRequest {
            id: TransferId(id),
            role: TransferRole::Receive,
            endpoint: bulk_in(0x81),
            buffer,
        }
    }

    fn transmit(pool: &FramePool, id: u64, len: usize) -> TransferRequest {
        let mut buffer = pool.allocate(len).unwrap();
        buffer.extend_from_slice(&vec![0xab; len]);
        TransferRequest {
            id: TransferId(id),
            role: TransferRole::Transmit,
            endpoint: bulk_out(0x02),
            buffer,
        }
    }

    fn next_completion(worker: &DriverWorker) -> driver::Completion {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(DriverCommand::Complete(completion)) = worker.try_recv_command() {
                return completion;
            }
            assert!(Instant::now() < deadline, "no completion arrived");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransferStatus::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransferStatus::Stall);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), TransferStatus::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::Overflow), TransferStatus::Overflow);
        assert_eq!(map_rusb_error(rusb::Error::Io), TransferStatus::Io);
        assert!(matches!(
            map_rusb_error(rusb::Error::Busy),
            TransferStatus::Other(_)
        ));
    }

    #[test]
    fn test_needs_zlp() {
        assert!(needs_zlp(512, 512));
        assert!(needs_zlp(1024, 512));
        assert!(!needs_zlp(1514, 512));
        assert!(!needs_zlp(0, 512));
        assert!(!needs_zlp(64, 0));
    }

    #[test]
    fn test_receive_survives_poll_timeouts() {
        let pipe = Arc::new(FakePipe::default());
        let (mut transport, worker) = setup(pipe.clone());
        let pool = FramePool::new(4096);

        transport.submit(receive(&pool, 1)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        pipe.reads.lock().unwrap().push_back(Ok(vec![7; 42]));

        let completion = next_completion(&worker);
        assert_eq!(completion.id, TransferId(1));
        assert_eq!(completion.status, TransferStatus::Completed);
        assert_eq!(completion.buffer.len(), 42);
    }

    #[test]
    fn test_cancel_interrupts_pending_receive() {
        let pipe = Arc::new(FakePipe::default());
        let (mut transport, worker) = setup(pipe);
        let pool = FramePool::new(4096);

        transport.submit(receive(&pool, 9)).unwrap();
        transport.cancel(TransferId(9));

        let completion = next_completion(&worker);
        assert_eq!(completion.id, TransferId(9));
        assert_eq!(completion.status, TransferStatus::Cancelled);

        // Cancelling something that already finished is a no-op
        transport.cancel(TransferId(9));
        drop(completion);
        drop(transport);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_receive_error_is_mapped() {
        let pipe = Arc::new(FakePipe::default());
        pipe.reads
            .lock()
            .unwrap()
            .push_back(Err(rusb::Error::NoDevice));
        let (mut transport, worker) = setup(pipe);
        let pool = FramePool::new(4096);

        transport.submit(receive(&pool, 3)).unwrap();
        assert_eq!(next_completion(&worker).status, TransferStatus::NoDevice);
    }

    #[test]
    fn test_transmit_appends_zlp_on_packet_boundary() {
        let pipe = Arc::new(FakePipe::default());
        let (mut transport, worker) = setup(pipe.clone());
        let pool = FramePool::new(8192);

        transport.submit(transmit(&pool, 1, 512)).unwrap();
        assert_eq!(next_completion(&worker).status, TransferStatus::Completed);
        transport.submit(transmit(&pool, 2, 100)).unwrap();
        assert_eq!(next_completion(&worker).status, TransferStatus::Completed);

        let writes = pipe.writes.lock().unwrap();
        let lens: Vec<usize> = writes.iter().map(Vec::len).collect();
        assert_eq!(lens, vec![512, 0, 100]);
    }

    #[test]
    fn test_transmit_timeout_is_surfaced() {
        let pipe = Arc::new(FakePipe::default());
        *pipe.write_error.lock().unwrap() = Some(rusb::Error::Timeout);
        let (mut transport, worker) = setup(pipe);
        let pool = FramePool::new(4096);

        transport.submit(transmit(&pool, 5, 60)).unwrap();
        let completion = next_completion(&worker);
        assert_eq!(completion.id, TransferId(5));
        assert_eq!(completion.status, TransferStatus::Timeout);
    }

    #[test]
    fn test_submit_after_close_is_refused() {
        let pipe = Arc::new(FakePipe::default());
        let (mut transport, _worker) = setup(pipe);
        let pool = FramePool::new(4096);

        transport.in_lane.take();
        let err = transport.submit(receive(&pool, 1)).unwrap_err();
        assert_eq!(err.status, TransferStatus::NoDevice);
        drop(err);
        assert_eq!(pool.stats().in_use, 0);
    }
}
