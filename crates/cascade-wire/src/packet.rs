//! Fixed-size multiplexer packets.
//!
//! ## Packet layout
//!
//! ```text
//! [channel_id:4 BE][flags:2 BE][payload:992] = 998 bytes
//! ```
//!
//! The first [`LINK_ENCRYPTED_PREFIX`] bytes of every serialized packet are
//! protected by the link cipher negotiated during login (once negotiated);
//! the payload itself carries the per-hop layers applied by the channel.
//!
//! A packet may carry send finalizers: callbacks that mutate the packet
//! right before it is written, in wire order. The first-mix cipher uses this
//! to encrypt channel key material at the position the mix will see it.

use std::fmt;
use std::io::{ErrorKind, Read, Write};

use cascade_crypto::sym::SymCipher;
use rand::RngCore;
use tracing::debug;

use crate::Result;

/// Total serialized packet size.
pub const PACKET_SIZE: usize = 998;

/// Header size (`channel_id` + `flags`).
pub const HEADER_SIZE: usize = 6;

/// Payload size.
pub const PAYLOAD_SIZE: usize = PACKET_SIZE - HEADER_SIZE; // 992

/// Serialized prefix covered by the link cipher.
pub const LINK_ENCRYPTED_PREFIX: usize = 16;

// Header field offsets
const OFF_CHANNEL_ID: usize = 0;
const OFF_FLAGS: usize = 4;
const OFF_PAYLOAD: usize = HEADER_SIZE;

/// Callback run on a packet inside the send slot, right before it is written.
pub type SendFinalizer = Box<dyn FnOnce(&mut MixPacket) + Send>;

/// One multiplexer frame.
pub struct MixPacket {
    channel_id: u32,
    flags: u16,
    payload: Box<[u8; PAYLOAD_SIZE]>,
    finalizers: Vec<SendFinalizer>,
}

impl MixPacket {
    /// Create a packet for `channel_id` with a random payload and no flags.
    pub fn new(channel_id: u32) -> Self {
        let mut payload = Box::new([0u8; PAYLOAD_SIZE]);
        rand::thread_rng().fill_bytes(payload.as_mut());
        Self {
            channel_id,
            flags: 0,
            payload,
            finalizers: Vec::new(),
        }
    }

    /// Rebuild a packet from its serialized form (no link cipher applied).
    pub fn from_bytes(bytes: &[u8; PACKET_SIZE]) -> Self {
        let mut id = [0u8; 4];
        id.copy_from_slice(&bytes[OFF_CHANNEL_ID..OFF_FLAGS]);
        let mut flags = [0u8; 2];
        flags.copy_from_slice(&bytes[OFF_FLAGS..OFF_PAYLOAD]);
        let mut payload = Box::new([0u8; PAYLOAD_SIZE]);
        payload.copy_from_slice(&bytes[OFF_PAYLOAD..]);
        Self {
            channel_id: u32::from_be_bytes(id),
            flags: u16::from_be_bytes(flags),
            payload,
            finalizers: Vec::new(),
        }
    }

    /// Read exactly one packet from `reader`.
    ///
    /// If `link` is set, the first [`LINK_ENCRYPTED_PREFIX`] bytes are
    /// decrypted with its upstream register. A read timeout is retried once;
    /// a truncated read is an `UnexpectedEof` I/O error.
    pub fn parse<R: Read + ?Sized>(reader: &mut R, link: Option<&mut SymCipher>) -> Result<Self> {
        let mut raw = [0u8; PACKET_SIZE];
        read_fully(reader, &mut raw)?;
        if let Some(cipher) = link {
            cipher.apply_upstream(&mut raw[..LINK_ENCRYPTED_PREFIX]);
        }
        Ok(Self::from_bytes(&raw))
    }

    /// Serialize the packet without link encryption.
    pub fn to_bytes(&self) -> [u8; PACKET_SIZE] {
        let mut raw = [0u8; PACKET_SIZE];
        raw[OFF_CHANNEL_ID..OFF_FLAGS].copy_from_slice(&self.channel_id.to_be_bytes());
        raw[OFF_FLAGS..OFF_PAYLOAD].copy_from_slice(&self.flags.to_be_bytes());
        raw[OFF_PAYLOAD..].copy_from_slice(self.payload.as_ref());
        raw
    }

    /// Serialize, apply the link cipher to the prefix and write the packet.
    ///
    /// Finalizers are not run here; the multiplexer runs them first.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W, link: Option<&mut SymCipher>) -> Result<()> {
        let mut raw = self.to_bytes();
        if let Some(cipher) = link {
            cipher.apply_upstream(&mut raw[..LINK_ENCRYPTED_PREFIX]);
        }
        writer.write_all(&raw)?;
        writer.flush()?;
        Ok(())
    }

    /// Channel this packet belongs to.
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Channel-specific flags.
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Set the channel-specific flags.
    pub fn set_flags(&mut self, flags: u16) {
        self.flags = flags;
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8; PAYLOAD_SIZE] {
        &self.payload
    }

    /// Mutable payload bytes.
    pub fn payload_mut(&mut self) -> &mut [u8; PAYLOAD_SIZE] {
        &mut self.payload
    }

    /// Register a callback run right before the packet goes on the wire.
    pub fn add_finalizer(&mut self, finalizer: SendFinalizer) {
        self.finalizers.push(finalizer);
    }

    /// Number of pending finalizers.
    pub fn finalizer_count(&self) -> usize {
        self.finalizers.len()
    }

    /// Run and consume every registered finalizer, in registration order.
    pub fn run_finalizers(&mut self) {
        let finalizers = std::mem::take(&mut self.finalizers);
        for finalizer in finalizers {
            finalizer(self);
        }
    }
}

impl PartialEq for MixPacket {
    fn eq(&self, other: &Self) -> bool {
        self.channel_id == other.channel_id
            && self.flags == other.flags
            && self.payload[..] == other.payload[..]
    }
}

impl Eq for MixPacket {}

impl fmt::Debug for MixPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MixPacket")
            .field("channel_id", &self.channel_id)
            .field("flags", &format_args!("{:#06x}", self.flags))
            .field("finalizers", &self.finalizers.len())
            .finish_non_exhaustive()
    }
}

/// Fill `buf` completely, tolerating a single read timeout.
fn read_fully<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<()> {
    let mut filled = 0;
    let mut timed_out = false;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("connection closed after {filled} of {} packet bytes", buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e)
                if !timed_out
                    && matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                debug!(filled, "packet read timed out, retrying once");
                timed_out = true;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WireError;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn test_constants() {
        assert_eq!(PAYLOAD_SIZE, 992);
        assert_eq!(HEADER_SIZE + PAYLOAD_SIZE, PACKET_SIZE);
    }

    #[test]
    fn test_new_packet_has_random_payload() {
        let a = MixPacket::new(7);
        let b = MixPacket::new(7);
        assert_eq!(a.channel_id(), 7);
        assert_eq!(a.flags(), 0);
        assert_ne!(a.payload()[..], b.payload()[..]);
    }

    #[test]
    fn test_header_is_big_endian() {
        let mut packet = MixPacket::new(0x0102_0304);
        packet.set_flags(0x0a0b);
        let raw = packet.to_bytes();
        assert_eq!(&raw[..6], &[1, 2, 3, 4, 0x0a, 0x0b]);
    }

    #[test]
    fn test_link_cipher_roundtrip() {
        let key = [3u8; 16];
        let mut out_link = SymCipher::new(&key).expect("cipher");
        let mut in_link = SymCipher::new(&key).expect("cipher");

        let mut packet = MixPacket::new(1234);
        packet.set_flags(0x0008);
        let mut wire = Vec::new();
        packet.write_to(&mut wire, Some(&mut out_link)).expect("write");
        assert_eq!(wire.len(), PACKET_SIZE);
        assert_ne!(&wire[..6], &packet.to_bytes()[..6]);
        // Only the prefix is touched.
        assert_eq!(&wire[LINK_ENCRYPTED_PREFIX..], &packet.to_bytes()[LINK_ENCRYPTED_PREFIX..]);

        let parsed = MixPacket::parse(&mut Cursor::new(wire), Some(&mut in_link)).expect("parse");
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_truncated_read_is_io_error() {
        let mut cursor = Cursor::new(vec![0u8; PACKET_SIZE - 1]);
        let err = MixPacket::parse(&mut cursor, None).expect_err("truncated");
        match err {
            WireError::Io(e) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_finalizers_run_in_order_once() {
        let mut packet = MixPacket::new(9);
        packet.add_finalizer(Box::new(|p: &mut MixPacket| p.payload_mut()[0] = 1));
        packet.add_finalizer(Box::new(|p: &mut MixPacket| {
            let first = p.payload()[0];
            p.payload_mut()[1] = first + 1;
        }));
        assert_eq!(packet.finalizer_count(), 2);
        packet.run_finalizers();
        assert_eq!(packet.payload()[..2], [1, 2]);
        assert_eq!(packet.finalizer_count(), 0);
    }

    struct TimeoutOnce {
        inner: Cursor<Vec<u8>>,
        fired: bool,
    }

    impl Read for TimeoutOnce {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.fired && self.inner.position() > 0 {
                self.fired = true;
                return Err(std::io::Error::new(ErrorKind::WouldBlock, "timeout"));
            }
            let limit = buf.len().min(100);
            self.inner.read(&mut buf[..limit])
        }
    }

    #[test]
    fn test_single_timeout_is_tolerated() {
        let packet = MixPacket::new(77);
        let mut reader = TimeoutOnce {
            inner: Cursor::new(packet.to_bytes().to_vec()),
            fired: false,
        };
        let parsed = MixPacket::parse(&mut reader, None).expect("parse");
        assert_eq!(parsed, packet);
    }

    proptest! {
        #[test]
        fn prop_packet_roundtrip(id in any::<u32>(), flags in any::<u16>(),
                                 payload in prop::collection::vec(any::<u8>(), PAYLOAD_SIZE)) {
            let mut packet = MixPacket::new(id);
            packet.set_flags(flags);
            packet.payload_mut().copy_from_slice(&payload);
            let parsed = MixPacket::parse(&mut Cursor::new(packet.to_bytes().to_vec()), None)
                .expect("parse");
            prop_assert_eq!(parsed, packet);
        }
    }
}
