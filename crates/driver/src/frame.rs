//! Inbound Ethernet frames and their protocol metadata

use byteorder::{BigEndian, ByteOrder};
use common::MacAddress;
use serde::Serialize;

use crate::pool::FrameBuffer;

/// Ethernet header length (destination, source, EtherType)
pub const ETH_HLEN: usize = 14;

/// Smallest value of the type/length field that is an EtherType
pub const ETH_P_802_3_MIN: u16 = 0x0600;

/// Raw 802.3 frame (Novell IPX without 802.2 LLC)
pub const ETH_P_802_3: u16 = 0x0001;

/// 802.2 LLC frame
pub const ETH_P_802_2: u16 = 0x0004;

/// How a received frame is addressed relative to the receiving interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PacketType {
    /// Addressed to this interface
    Host,
    Broadcast,
    Multicast,
    /// Addressed to some other station
    OtherHost,
}

/// A received frame, owned by whoever holds it, stamped with metadata
#[derive(Debug)]
pub struct Frame {
    buffer: FrameBuffer,
    protocol: u16,
    packet_type: PacketType,
}

impl Frame {
    /// Stamp `buffer` with its EtherType and packet type relative to `local`
    ///
    /// Frames shorter than an Ethernet header get protocol 0 and are
    /// classified as [`PacketType::OtherHost`]; the stack decides what to do
    /// with them.
    pub fn stamp(buffer: FrameBuffer, local: MacAddress) -> Self {
        if buffer.len() < ETH_HLEN {
            return Self {
                buffer,
                protocol: 0,
                packet_type: PacketType::OtherHost,
            };
        }

        let mut dest = [0u8; 6];
        dest.copy_from_slice(&buffer[0..6]);
        let dest = MacAddress(dest);

        let packet_type = if dest.is_multicast() {
            if dest.is_broadcast() {
                PacketType::Broadcast
            } else {
                PacketType::Multicast
            }
        } else if dest == local {
            PacketType::Host
        } else {
            PacketType::OtherHost
        };

        let type_or_len = BigEndian::read_u16(&buffer[12..14]);
        let protocol = if type_or_len >= ETH_P_802_3_MIN {
            type_or_len
        } else if buffer.len() >= ETH_HLEN + 2 && buffer[14..16] == [0xff, 0xff] {
            ETH_P_802_3
        } else {
            ETH_P_802_2
        };

        Self {
            buffer,
            protocol,
            packet_type,
        }
    }

    /// EtherType, or one of the 802.3/802.2 pseudo-protocols
    pub fn protocol(&self) -> u16 {
        self.protocol
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Take the underlying buffer back
    pub fn into_buffer(self) -> FrameBuffer {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferAllocator, FramePool};
    use crate::test_utils::ethernet_frame;

    const LOCAL: MacAddress = MacAddress([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);

    fn buffer(pool: &FramePool, data: &[u8]) -> FrameBuffer {
        let mut buf = pool.allocate(data.len()).unwrap();
        buf.extend_from_slice(data);
        buf
    }

    #[test]
    fn test_unicast_to_host() {
        let pool = FramePool::default();
        let data = ethernet_frame(LOCAL, 0x0800, 64);
        let frame = Frame::stamp(buffer(&pool, &data), LOCAL);

        assert_eq!(frame.protocol(), 0x0800);
        assert_eq!(frame.packet_type(), PacketType::Host);
        assert_eq!(frame.len(), 64);
    }

    #[test]
    fn test_broadcast_and_multicast() {
        let pool = FramePool::default();

        let arp = ethernet_frame(MacAddress::BROADCAST, 0x0806, 60);
        let frame = Frame::stamp(buffer(&pool, &arp), LOCAL);
        assert_eq!(frame.packet_type(), PacketType::Broadcast);
        assert_eq!(frame.protocol(), 0x0806);

        let mdns = ethernet_frame(MacAddress([0x01, 0x00, 0x5e, 0x00, 0x00, 0xfb]), 0x0800, 60);
        let frame = Frame::stamp(buffer(&pool, &mdns), LOCAL);
        assert_eq!(frame.packet_type(), PacketType::Multicast);
    }

    #[test]
    fn test_other_host() {
        let pool = FramePool::default();
        let data = ethernet_frame(MacAddress([0x02, 0, 0, 0, 0, 0x99]), 0x86dd, 80);
        let frame = Frame::stamp(buffer(&pool, &data), LOCAL);
        assert_eq!(frame.packet_type(), PacketType::OtherHost);
        assert_eq!(frame.protocol(), 0x86dd);
    }

    #[test]
    fn test_length_field_frames() {
        let pool = FramePool::default();

        let mut llc = ethernet_frame(LOCAL, 0x002e, 60);
        llc[14] = 0x42;
        llc[15] = 0x42;
        let frame = Frame::stamp(buffer(&pool, &llc), LOCAL);
        assert_eq!(frame.protocol(), ETH_P_802_2);

        let mut raw = ethernet_frame(LOCAL, 0x002e, 60);
        raw[14] = 0xff;
        raw[15] = 0xff;
        let frame = Frame::stamp(buffer(&pool, &raw), LOCAL);
        assert_eq!(frame.protocol(), ETH_P_802_3);
    }

    #[test]
    fn test_runt_frame() {
        let pool = FramePool::default();
        let frame = Frame::stamp(buffer(&pool, &[0xff; 8]), LOCAL);
        assert_eq!(frame.protocol(), 0);
        assert_eq!(frame.packet_type(), PacketType::OtherHost);
        assert_eq!(frame.into_buffer().len(), 8);
    }
}
