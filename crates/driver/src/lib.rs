//! Data-plane and lifecycle core for usb-tether
//!
//! This crate bridges a CDC-Ethernet or RNDIS USB function to a host network
//! interface. It classifies the device's endpoints on attach, keeps one
//! bulk-in transfer permanently armed, turns outbound frames into bulk-out
//! transfers, and tears a session down on detach in an order that never frees
//! a buffer or interface while something can still reference it.
//!
//! The transport, network stack and buffer allocator are collaborators behind
//! the traits in [`transport`]. Everything in this crate is driven by explicit
//! messages: [`LifecycleManager`] is single-threaded and the [`worker`] thread
//! feeds it [`DriverCommand`]s from the channel bridge.
//!
//! # Example
//!
//! ```
//! use driver::classifier::classify_endpoints;
//! use common::EndpointDescriptor;
//!
//! let endpoints = [
//!     EndpointDescriptor::from_raw(0x00, 0x00, 64), // control
//!     EndpointDescriptor::from_raw(0x81, 0x02, 512), // bulk-in
//!     EndpointDescriptor::from_raw(0x02, 0x02, 512), // bulk-out
//!     EndpointDescriptor::from_raw(0x83, 0x03, 16), // interrupt
//! ];
//!
//! let selection = classify_endpoints(&endpoints).unwrap();
//! assert_eq!(selection.bulk_in.address, 0x81);
//! assert_eq!(selection.bulk_out.address, 0x02);
//! ```

pub mod channel;
pub mod classifier;
pub mod device_table;
mod engine;
pub mod error;
pub mod frame;
pub mod framing;
pub mod lifecycle;
pub mod pool;
pub mod receive;
pub mod session;
pub mod test_utils;
pub mod transmit;
pub mod transport;
pub mod worker;

pub use channel::{
    CommandSender, DriverBridge, DriverCommand, DriverEvent, DriverWorker, create_driver_bridge,
};
pub use classifier::{EndpointClass, EndpointSelection, classify, classify_endpoints};
pub use device_table::{DeviceMatch, DeviceTable};
pub use error::{DriverError, Result, TransferStatus};
pub use frame::{Frame, PacketType};
pub use framing::Framing;
pub use lifecycle::{AttachRequest, DetachOutcome, DriverConfig, LifecycleEvent, LifecycleManager};
pub use pool::{BufferAllocator, FrameBuffer, FramePool, PoolStats};
pub use session::{LifecycleState, SessionId, SessionInfo, SessionStats};
pub use transport::{
    Completion, NetInterface, NetworkStack, SubmitError, TransferId, TransferRequest,
    TransferRole, TransmitEntry, TransmitSink, Transport,
};
pub use worker::{DriverWorkerThread, spawn_driver_worker};
