//! Common utilities for usb-tether
//!
//! This crate provides functionality shared between the driver core and the
//! daemon: USB descriptor types, MAC addresses, error handling and logging
//! setup.

pub mod error;
pub mod logging;
pub mod usb_types;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{
    DeviceKey, Direction, EndpointDescriptor, EndpointTransferType, InterfaceDescriptor,
    MacAddress,
};
