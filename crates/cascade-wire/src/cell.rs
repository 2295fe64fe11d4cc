//! Chain-cell framing inside a data channel payload.
//!
//! After the hop layers are removed, the cell handed to a data chain has one
//! of two layouts, depending on the chain protocol the cascade negotiated.
//!
//! ## Single-channel chains
//!
//! ```text
//! [length_and_flags:2 BE][type:1][data:length][random padding]
//! ```
//!
//! - bits 0..10 of `length_and_flags`: data length
//! - `0x8000`: flow control (request or acknowledgement)
//! - `0x4000`: the last mix lost its connection to the destination
//! - `type`: chain type on the first upstream cell, 0 otherwise
//!
//! ## Sequential chains
//!
//! ```text
//! [length_and_flags:2 BE][chain_id:8, optional][data:length][random padding]
//! ```
//!
//! The chain id is present on the first downstream cell of a chain and on the
//! first upstream cell of every sequel channel.

use crate::{Result, WireError};

/// Mask selecting the data length from `length_and_flags`.
pub const CELL_LENGTH_MASK: u16 = 0x03FF;

/// Flow-control request / acknowledgement.
pub const FLAG_FLOW_CONTROL: u16 = 0x8000;

/// Last mix reports a broken destination connection.
pub const FLAG_CONNECTION_ERROR: u16 = 0x4000;

/// Header size of a single-channel cell.
pub const CELL_HEADER_SIZE: usize = 3;

/// Chain id length on sequential chains.
pub const CHAIN_ID_LENGTH: usize = 8;

/// Header size of a sequential cell (without chain id).
pub const SEQUENTIAL_HEADER_SIZE: usize = 2;

/// Upstream: first cell of a new chain.
pub const SEQ_FLAG_NEW_CHAIN: u16 = 0x2000;

/// Upstream: the mix should answer without waiting for more data.
pub const SEQ_FLAG_FAST_RESPONSE: u16 = 0x8000;

/// Both directions: the sender closed its side of the stream.
pub const SEQ_FLAG_STREAM_CLOSED: u16 = 0x4000;

/// Downstream: the mix does not know the chain id we sent.
pub const SEQ_FLAG_UNKNOWN_CHAIN_ID: u16 = 0x2000;

/// Downstream: the destination connection broke.
pub const SEQ_FLAG_CONNECTION_ERROR: u16 = 0x8000;

/// Largest length a 10-bit length field can carry.
pub const MAX_CELL_DATA: usize = CELL_LENGTH_MASK as usize;

/// Single-channel chain cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainCell {
    /// Flag bits (`FLAG_*`), without the length.
    pub flags: u16,
    /// Chain type tag.
    pub chain_type: u8,
    /// Cell data.
    pub data: Vec<u8>,
}

impl ChainCell {
    /// Data capacity of a cell buffer of `cell_size` bytes.
    pub fn capacity(cell_size: usize) -> usize {
        cell_size.saturating_sub(CELL_HEADER_SIZE).min(MAX_CELL_DATA)
    }

    /// Write header and data into the front of `buf`; the tail is left as is.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < CELL_HEADER_SIZE {
            return Err(WireError::InvalidCell(format!("cell buffer of {} bytes has no room for a header", buf.len())));
        }
        let capacity = Self::capacity(buf.len());
        if self.data.len() > capacity {
            return Err(WireError::InvalidCell(format!(
                "{} data bytes exceed cell capacity {capacity}",
                self.data.len()
            )));
        }
        let length_and_flags = (self.flags & !CELL_LENGTH_MASK) | self.data.len() as u16;
        buf[..2].copy_from_slice(&length_and_flags.to_be_bytes());
        buf[2] = self.chain_type;
        buf[CELL_HEADER_SIZE..CELL_HEADER_SIZE + self.data.len()].copy_from_slice(&self.data);
        Ok(())
    }

    /// Parse a received cell, validating the declared length.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CELL_HEADER_SIZE {
            return Err(WireError::InvalidCell(format!("cell of {} bytes has no header", buf.len())));
        }
        let length_and_flags = u16::from_be_bytes([buf[0], buf[1]]);
        let len = usize::from(length_and_flags & CELL_LENGTH_MASK);
        if CELL_HEADER_SIZE + len > buf.len() {
            return Err(WireError::InvalidCell(format!(
                "declared length {len} exceeds cell capacity {}",
                buf.len() - CELL_HEADER_SIZE
            )));
        }
        Ok(Self {
            flags: length_and_flags & !CELL_LENGTH_MASK,
            chain_type: buf[2],
            data: buf[CELL_HEADER_SIZE..CELL_HEADER_SIZE + len].to_vec(),
        })
    }

    /// Whether `flag` is set.
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Sequential chain cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequentialCell {
    /// Flag bits (`SEQ_FLAG_*`), without the length.
    pub flags: u16,
    /// Chain id, when carried by this cell.
    pub chain_id: Option<[u8; CHAIN_ID_LENGTH]>,
    /// Cell data.
    pub data: Vec<u8>,
}

impl SequentialCell {
    /// Data capacity of a cell buffer, with or without a chain id.
    pub fn capacity(cell_size: usize, with_chain_id: bool) -> usize {
        let header = SEQUENTIAL_HEADER_SIZE + if with_chain_id { CHAIN_ID_LENGTH } else { 0 };
        cell_size.saturating_sub(header).min(MAX_CELL_DATA)
    }

    fn header_len(&self) -> usize {
        SEQUENTIAL_HEADER_SIZE + self.chain_id.map_or(0, |_| CHAIN_ID_LENGTH)
    }

    /// Write header, optional chain id and data into the front of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < self.header_len() {
            return Err(WireError::InvalidCell(format!("cell buffer of {} bytes has no room for a header", buf.len())));
        }
        let capacity = Self::capacity(buf.len(), self.chain_id.is_some());
        if self.data.len() > capacity {
            return Err(WireError::InvalidCell(format!(
                "{} data bytes exceed cell capacity {capacity}",
                self.data.len()
            )));
        }
        let length_and_flags = (self.flags & !CELL_LENGTH_MASK) | self.data.len() as u16;
        buf[..2].copy_from_slice(&length_and_flags.to_be_bytes());
        let mut offset = SEQUENTIAL_HEADER_SIZE;
        if let Some(id) = &self.chain_id {
            buf[offset..offset + CHAIN_ID_LENGTH].copy_from_slice(id);
            offset += CHAIN_ID_LENGTH;
        }
        buf[offset..offset + self.data.len()].copy_from_slice(&self.data);
        Ok(())
    }

    /// Parse a received cell. `with_chain_id` says whether this position in
    /// the chain carries an id.
    pub fn decode(buf: &[u8], with_chain_id: bool) -> Result<Self> {
        let header = SEQUENTIAL_HEADER_SIZE + if with_chain_id { CHAIN_ID_LENGTH } else { 0 };
        if buf.len() < header {
            return Err(WireError::InvalidCell(format!("cell of {} bytes has no header", buf.len())));
        }
        let length_and_flags = u16::from_be_bytes([buf[0], buf[1]]);
        let len = usize::from(length_and_flags & CELL_LENGTH_MASK);
        if header + len > buf.len() {
            return Err(WireError::InvalidCell(format!(
                "declared length {len} exceeds cell capacity {}",
                buf.len() - header
            )));
        }
        let chain_id = if with_chain_id {
            let mut id = [0u8; CHAIN_ID_LENGTH];
            id.copy_from_slice(&buf[SEQUENTIAL_HEADER_SIZE..header]);
            Some(id)
        } else {
            None
        };
        Ok(Self {
            flags: length_and_flags & !CELL_LENGTH_MASK,
            chain_id,
            data: buf[header..header + len].to_vec(),
        })
    }

    /// Whether `flag` is set.
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    /// Total bytes this cell occupies at the front of its buffer.
    pub fn encoded_len(&self) -> usize {
        self.header_len() + self.data.len()
    }
}
