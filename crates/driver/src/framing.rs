//! Data-plane framing of Ethernet frames inside bulk transfers
//!
//! CDC-ECM carries one raw Ethernet frame per bulk transfer. RNDIS wraps each
//! frame in a `REMOTE_NDIS_PACKET_MSG` header and may concatenate several
//! messages in a single bulk-in transfer.
//!
//! ```text
//! offset  field
//! 0       MessageType    (1 = REMOTE_NDIS_PACKET_MSG)
//! 4       MessageLength  (header + payload)
//! 8       DataOffset     (from byte 8, normally 36)
//! 12      DataLength
//! 16..44  OOB / per-packet-info / VC handle / reserved, all zero
//! 44      payload
//! ```

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DriverError, Result};
use crate::pool::FrameBuffer;

pub const RNDIS_MSG_PACKET: u32 = 0x0000_0001;

/// Size of the `REMOTE_NDIS_PACKET_MSG` header
pub const RNDIS_PACKET_HEADER_LEN: usize = 44;

/// `DataOffset` is measured from the start of this field
const RNDIS_DATA_OFFSET_BASE: usize = 8;

/// Framing used on a device's bulk data endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// CDC Ethernet Control Model: raw frames
    #[default]
    Ecm,
    /// RNDIS packet messages
    Rndis,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Ecm => f.write_str("cdc-ecm"),
            Framing::Rndis => f.write_str("rndis"),
        }
    }
}

impl Framing {
    /// Bytes a payload of `payload_len` occupies on the wire
    pub fn encoded_len(&self, payload_len: usize) -> usize {
        match self {
            Framing::Ecm => payload_len,
            Framing::Rndis => RNDIS_PACKET_HEADER_LEN + payload_len,
        }
    }

    /// Write `payload`, framed, into `out`
    ///
    /// `out` must have been allocated with at least
    /// [`encoded_len`](Self::encoded_len) bytes.
    pub fn encode(&self, payload: &[u8], out: &mut FrameBuffer) {
        out.clear();
        if let Framing::Rndis = self {
            let mut header = [0u8; RNDIS_PACKET_HEADER_LEN];
            LittleEndian::write_u32(&mut header[0..4], RNDIS_MSG_PACKET);
            LittleEndian::write_u32(
                &mut header[4..8],
                (RNDIS_PACKET_HEADER_LEN + payload.len()) as u32,
            );
            LittleEndian::write_u32(
                &mut header[8..12],
                (RNDIS_PACKET_HEADER_LEN - RNDIS_DATA_OFFSET_BASE) as u32,
            );
            LittleEndian::write_u32(&mut header[12..16], payload.len() as u32);
            out.extend_from_slice(&header);
        }
        out.extend_from_slice(payload);
    }

    /// Split a completed bulk-in transfer into frame payloads
    ///
    /// An empty transfer yields no payloads.
    pub fn decode<'a>(&self, transfer: &'a [u8]) -> Result<Vec<&'a [u8]>> {
        if transfer.is_empty() {
            return Ok(Vec::new());
        }

        match self {
            Framing::Ecm => Ok(vec![transfer]),
            Framing::Rndis => decode_rndis(transfer),
        }
    }
}

fn decode_rndis(mut rest: &[u8]) -> Result<Vec<&[u8]>> {
    let mut payloads = Vec::new();

    while !rest.is_empty() {
        if rest.len() < RNDIS_PACKET_HEADER_LEN {
            // Some devices pad the tail of a transfer with zeroes
            if rest.iter().all(|b| *b == 0) {
                break;
            }
            return Err(DriverError::Framing(format!(
                "truncated RNDIS header: {} bytes",
                rest.len()
            )));
        }

        let msg_type = LittleEndian::read_u32(&rest[0..4]);
        let msg_len = LittleEndian::read_u32(&rest[4..8]) as usize;
        let data_offset = LittleEndian::read_u32(&rest[8..12]) as usize;
        let data_len = LittleEndian::read_u32(&rest[12..16]) as usize;

        if msg_type != RNDIS_MSG_PACKET {
            return Err(DriverError::Framing(format!(
                "unexpected RNDIS message type {:#x}",
                msg_type
            )));
        }

        let data_start = RNDIS_DATA_OFFSET_BASE + data_offset;
        if msg_len < RNDIS_PACKET_HEADER_LEN
            || msg_len > rest.len()
            || data_start + data_len > msg_len
        {
            return Err(DriverError::Framing(format!(
                "bad RNDIS packet: len={} offset={} data_len={} available={}",
                msg_len,
                data_offset,
                data_len,
                rest.len()
            )));
        }

        payloads.push(&rest[data_start..data_start + data_len]);
        rest = &rest[msg_len..];
    }

    Ok(payloads)
}


/// Property-based tests using proptest
#[cfg(test)]
mod proptests {
    use super::*;
    use crate::pool::{BufferAllocator, FramePool};
    use proptest::prelude::*;

    proptest! {
        /// Property: any batch of RNDIS-wrapped frames decodes back to the same frames
        #[test]
        fn prop_rndis_batch_decodes_to_inputs(
            frames in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 1..=1514),
                1..4,
            ),
            padding in 0usize..8,
        ) {
            let pool = FramePool::new(64 * 1024);
            let mut transfer = Vec::new();
            for frame in &frames {
                let mut wire = pool.allocate(Framing::Rndis.encoded_len(frame.len())).unwrap();
                Framing::Rndis.encode(frame, &mut wire);
                transfer.extend_from_slice(&wire);
            }
            transfer.extend(std::iter::repeat_n(0u8, padding));

            let decoded = Framing::Rndis.decode(&transfer).unwrap();
            prop_assert_eq!(decoded.len(), frames.len());
            for (decoded, original) in decoded.iter().zip(&frames) {
                prop_assert_eq!(*decoded, &original[..]);
            }
        }

        /// Property: decoding arbitrary bytes never panics
        #[test]
        fn prop_rndis_decode_is_total(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Framing::Rndis.decode(&data);
        }
    }
}
