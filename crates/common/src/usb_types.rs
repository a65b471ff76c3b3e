//! USB type abstractions and utilities
//!
//! Descriptor types shared by the driver core (which classifies them) and the
//! daemon (which reads them from real devices).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Endpoint direction bit in `bEndpointAddress`
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Transfer type mask in `bmAttributes`
pub const ENDPOINT_TYPE_MASK: u8 = 0x03;

/// Identifies a physical device on the host (bus number, device address)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub bus: u8,
    pub address: u8,
}

impl DeviceKey {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Data direction of an endpoint, seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("bulk-in"),
            Direction::Out => f.write_str("bulk-out"),
        }
    }
}

/// Transfer type advertised in `bmAttributes` bits 0..1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointTransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointTransferType {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & ENDPOINT_TYPE_MASK {
            0 => EndpointTransferType::Control,
            1 => EndpointTransferType::Isochronous,
            2 => EndpointTransferType::Bulk,
            _ => EndpointTransferType::Interrupt,
        }
    }
}

/// A single endpoint descriptor, immutable once read from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// `bEndpointAddress`, including the direction bit
    pub address: u8,
    /// Transfer type decoded from `bmAttributes`
    pub transfer_type: EndpointTransferType,
    /// `wMaxPacketSize`
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub fn new(address: u8, transfer_type: EndpointTransferType, max_packet_size: u16) -> Self {
        Self {
            address,
            transfer_type,
            max_packet_size,
        }
    }

    /// Build from the raw `bEndpointAddress` / `bmAttributes` / `wMaxPacketSize` fields
    pub fn from_raw(address: u8, attributes: u8, max_packet_size: u16) -> Self {
        Self::new(
            address,
            EndpointTransferType::from_attributes(attributes),
            max_packet_size,
        )
    }

    pub fn direction(&self) -> Direction {
        if self.address & ENDPOINT_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }
}

/// An interface as advertised by the device's active configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// Endpoints in advertised order
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    /// Random unicast address with the locally administered bit set
    pub fn random_local() -> Self {
        let mut bytes: [u8; 6] = rand::random();
        bytes[0] = (bytes[0] & 0xfe) | 0x02;
        MacAddress(bytes)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_direction() {
        let ep_in = EndpointDescriptor::from_raw(0x81, 0x02, 512);
        assert_eq!(ep_in.direction(), Direction::In);
        assert_eq!(ep_in.number(), 1);

        let ep_out = EndpointDescriptor::from_raw(0x02, 0x02, 512);
        assert_eq!(ep_out.direction(), Direction::Out);
        assert_eq!(ep_out.number(), 2);
    }

    #[test]
    fn test_transfer_type_from_attributes() {
        assert_eq!(
            EndpointTransferType::from_attributes(0x00),
            EndpointTransferType::Control
        );
        assert_eq!(
            EndpointTransferType::from_attributes(0x05),
            EndpointTransferType::Isochronous
        );
        assert_eq!(
            EndpointTransferType::from_attributes(0x02),
            EndpointTransferType::Bulk
        );
        assert_eq!(
            EndpointTransferType::from_attributes(0x03),
            EndpointTransferType::Interrupt
        );
    }

    #[test]
    fn test_random_mac_is_local_unicast() {
        for _ in 0..32 {
            let mac = MacAddress::random_local();
            assert!(!mac.is_multicast());
            assert_eq!(mac.0[0] & 0x02, 0x02);
        }
    }

    #[test]
    fn test_mac_display() {
        let mac = MacAddress([0x02, 0x00, 0x5e, 0x10, 0xab, 0xff]);
        assert_eq!(mac.to_string(), "02:00:5e:10:ab:ff");
        assert!(MacAddress::BROADCAST.is_broadcast());
        assert!(MacAddress::BROADCAST.is_multicast());
    }

    #[test]
    fn test_device_key_display() {
        assert_eq!(DeviceKey::new(1, 7).to_string(), "001:007");
    }
}
