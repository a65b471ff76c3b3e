//! usb-tether daemon library
//!
//! The `usb-tetherd` binary wires these together: [`usb`] finds and owns the
//! devices, the driver worker runs the sessions, and [`net`] gives each one a
//! host interface.

pub mod config;
pub mod net;
pub mod service;
pub mod usb;
