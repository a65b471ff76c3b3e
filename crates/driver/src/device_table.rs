//! Interface match table
//!
//! Decides which interfaces the bridge binds to and which framing their data
//! endpoints speak. The table is built once at startup and never mutated.

use common::InterfaceDescriptor;
use serde::{Deserialize, Serialize};

use crate::framing::Framing;

/// USB Communications Device Class
pub const CDC_COMMUNICATIONS_CLASS: u8 = 0x02;
/// CDC Ethernet Control Model subclass
pub const CDC_ETHERNET_SUBCLASS: u8 = 0x06;
/// Subclass RNDIS functions advertise under the CDC class
pub const RNDIS_SUBCLASS: u8 = 0x02;
/// CDC Data interface class, which carries the bulk endpoints
pub const CDC_DATA_CLASS: u8 = 0x0a;

/// One `(class, subclass, protocol)` match and the framing it implies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMatch {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub framing: Framing,
}

impl DeviceMatch {
    fn key(&self) -> (u8, u8, u8) {
        (self.class, self.subclass, self.protocol)
    }

    pub fn matches(&self, interface: &InterfaceDescriptor) -> bool {
        self.class == interface.class
            && self.subclass == interface.subclass
            && self.protocol == interface.protocol
    }
}

/// Immutable list of interface matches, checked in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTable {
    entries: Vec<DeviceMatch>,
}

impl DeviceTable {
    pub fn new(entries: Vec<DeviceMatch>) -> Self {
        Self { entries }
    }

    /// CDC Ethernet and RNDIS
    pub fn builtin() -> Self {
        Self::new(vec![
            DeviceMatch {
                class: CDC_COMMUNICATIONS_CLASS,
                subclass: CDC_ETHERNET_SUBCLASS,
                protocol: 0,
                framing: Framing::Ecm,
            },
            DeviceMatch {
                class: CDC_COMMUNICATIONS_CLASS,
                subclass: RNDIS_SUBCLASS,
                protocol: 0,
                framing: Framing::Rndis,
            },
        ])
    }

    /// Builtin entries followed by `extra`, skipping duplicates
    pub fn with_extra(extra: &[DeviceMatch]) -> Self {
        let mut table = Self::builtin();
        for entry in extra {
            if !table.entries.iter().any(|e| e.key() == entry.key()) {
                table.entries.push(*entry);
            }
        }
        table
    }

    /// First entry matching `interface`
    pub fn lookup(&self, interface: &InterfaceDescriptor) -> Option<&DeviceMatch> {
        self.entries.iter().find(|entry| entry.matches(interface))
    }

    pub fn entries(&self) -> &[DeviceMatch] {
        &self.entries
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::builtin()
    }
}
