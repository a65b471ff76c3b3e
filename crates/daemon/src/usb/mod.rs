//! USB subsystem
//!
//! Device discovery and the libusb transport. The manager runs on its own
//! thread pumping libusb events; each bound device adds two transport lane
//! threads that report completions to the driver worker.

pub mod device;
pub mod manager;
pub mod transport;

pub use device::{CdcFunction, UsbDevice, find_function};
pub use manager::{DeviceManager, DeviceSummary, check_filter, spawn_usb_manager};
pub use transport::{RusbTransport, TransportConfig, map_rusb_error};
