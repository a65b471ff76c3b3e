//! Host network side
//!
//! Sessions surface as TAP interfaces; see [`tap::TapStack`].

pub mod tap;

pub use tap::{TapInterface, TapStack};
