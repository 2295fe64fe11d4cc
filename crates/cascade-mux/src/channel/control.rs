//! Control channels.
//!
//! A control message is framed as a `u16` big-endian length followed by the
//! body and split over as many packets as needed. Each packet's flags field
//! holds the number of payload bytes it carries. Control packets are not
//! onion-encrypted; only the link cipher protects them.

use std::sync::Arc;

use cascade_wire::packet::{MixPacket, PAYLOAD_SIZE};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::mux::{Multiplexer, MuxHandle};
use crate::scheduler::CancelToken;
use crate::{is_control_channel_id, MuxError, Result};

/// Length prefix of a control message.
pub const CONTROL_LENGTH_SIZE: usize = 2;

/// Largest control message body.
pub const MAX_CONTROL_MESSAGE: usize = u16::MAX as usize;

/// Receives complete control messages.
pub trait ControlMessageHandler: Send + Sync {
    /// A complete message arrived.
    fn process_message(&self, message: &[u8]);

    /// The multiplexer closed.
    fn multiplexer_closed(&self) {}
}

/// Handler that drops every message.
pub struct DiscardHandler;

impl ControlMessageHandler for DiscardHandler {
    fn process_message(&self, message: &[u8]) {
        debug!(len = message.len(), "control message discarded");
    }
}

/// A fixed-id channel carrying framed control messages.
pub struct ControlChannel {
    id: u32,
    mux: MuxHandle,
    open: Mutex<bool>,
    reassembly: Mutex<Vec<u8>>,
    handler: Box<dyn ControlMessageHandler>,
}

impl ControlChannel {
    /// Register a control channel on `mux`.
    ///
    /// On a closed multiplexer the channel is returned already notified of
    /// the close.
    pub fn open(mux: &Multiplexer, id: u32, handler: Box<dyn ControlMessageHandler>) -> Result<Arc<Self>> {
        if !is_control_channel_id(id) {
            return Err(MuxError::InvalidParameter(format!("{id} is not a control channel id")));
        }
        let channel = Arc::new(Self {
            id,
            mux: mux.handle(),
            open: Mutex::new(true),
            reassembly: Mutex::new(Vec::new()),
            handler,
        });
        mux.table().register_control_channel(Arc::clone(&channel))?;
        debug!(channel_id = id, "control channel registered");
        Ok(channel)
    }

    /// Send one message, fragmenting it over as many packets as needed.
    ///
    /// A cancelled `cancel` stops before the next fragment.
    pub fn send_raw_message(&self, message: &[u8], cancel: Option<&CancelToken>) -> Result<()> {
        if message.len() > MAX_CONTROL_MESSAGE {
            return Err(MuxError::InvalidParameter(format!(
                "control message of {} bytes exceeds {MAX_CONTROL_MESSAGE}",
                message.len()
            )));
        }
        let mut framed = Vec::with_capacity(CONTROL_LENGTH_SIZE + message.len());
        framed.extend_from_slice(&(message.len() as u16).to_be_bytes());
        framed.extend_from_slice(message);

        let open = self.open.lock();
        for fragment in framed.chunks(PAYLOAD_SIZE) {
            if !*open {
                return Err(MuxError::ChannelClosed);
            }
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(MuxError::Interrupted);
            }
            let mux = self.mux.upgrade()?;
            let mut packet = MixPacket::new(self.id);
            packet.set_flags(fragment.len() as u16);
            packet.payload_mut()[..fragment.len()].copy_from_slice(fragment);
            mux.send_packet(packet, cancel)?;
        }
        Ok(())
    }

    /// Unregister the channel; later sends fail.
    pub fn close(&self) {
        let mut open = self.open.lock();
        if *open {
            *open = false;
            if let Ok(mux) = self.mux.upgrade() {
                mux.table().remove_channel(self.id);
            }
        }
    }

    /// Take a complete message out of the reassembly buffer if one is there.
    fn take_message(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
        if buffer.len() < CONTROL_LENGTH_SIZE {
            return None;
        }
        let len = u16::from_be_bytes([buffer[0], buffer[1]]) as usize;
        if buffer.len() < CONTROL_LENGTH_SIZE + len {
            return None;
        }
        let message = buffer[CONTROL_LENGTH_SIZE..CONTROL_LENGTH_SIZE + len].to_vec();
        buffer.drain(..CONTROL_LENGTH_SIZE + len);
        Some(message)
    }
}

impl Channel for ControlChannel {
    fn id(&self) -> u32 {
        self.id
    }

    fn process_received_packet(&self, packet: MixPacket) {
        let used = packet.flags() as usize;
        let mut messages = Vec::new();
        {
            let mut buffer = self.reassembly.lock();
            if used > PAYLOAD_SIZE {
                warn!(channel_id = self.id, used, "invalid control packet length, reassembly reset");
                buffer.clear();
                return;
            }
            buffer.extend_from_slice(&packet.payload()[..used]);
            while let Some(message) = Self::take_message(&mut buffer) {
                messages.push(message);
            }
        }
        for message in messages {
            self.handler.process_message(&message);
        }
    }

    fn multiplexer_closed(&self) {
        *self.open.lock() = false;
        self.handler.multiplexer_closed();
    }

    fn is_open(&self) -> bool {
        *self.open.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Arc<Mutex<Vec<Vec<u8>>>>);

    impl ControlMessageHandler for Collect {
        fn process_message(&self, message: &[u8]) {
            self.0.lock().push(message.to_vec());
        }
    }

    fn channel() -> (ControlChannel, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let channel = ControlChannel {
            id: 3,
            mux: MuxHandle::detached(),
            open: Mutex::new(true),
            reassembly: Mutex::new(Vec::new()),
            handler: Box::new(Collect(Arc::clone(&seen))),
        };
        (channel, seen)
    }

    fn packet(bytes: &[u8]) -> MixPacket {
        let mut packet = MixPacket::new(3);
        packet.set_flags(bytes.len() as u16);
        packet.payload_mut()[..bytes.len()].copy_from_slice(bytes);
        packet
    }

    #[test]
    fn test_reassembles_fragmented_message() {
        let (channel, seen) = channel();
        let body: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        let mut framed = (body.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);

        let mut fragments = framed.chunks(PAYLOAD_SIZE);
        channel.process_received_packet(packet(fragments.next().expect("first")));
        assert!(seen.lock().is_empty());
        channel.process_received_packet(packet(fragments.next().expect("second")));
        assert_eq!(*seen.lock(), vec![body]);
    }

    #[test]
    fn test_two_messages_in_one_packet() {
        let (channel, seen) = channel();
        channel.process_received_packet(packet(&[0, 1, 0xaa, 0, 2, 0xbb, 0xcc]));
        assert_eq!(*seen.lock(), vec![vec![0xaa], vec![0xbb, 0xcc]]);
    }

    #[test]
    fn test_invalid_length_resets_reassembly() {
        let (channel, seen) = channel();
        channel.process_received_packet(packet(&[0, 4, 1, 2]));
        let mut bogus = MixPacket::new(3);
        bogus.set_flags(PAYLOAD_SIZE as u16 + 1);
        channel.process_received_packet(bogus);
        channel.process_received_packet(packet(&[0, 1, 9]));
        assert_eq!(*seen.lock(), vec![vec![9]]);
    }

    #[test]
    fn test_send_after_close_fails() {
        let (channel, _) = channel();
        channel.multiplexer_closed();
        assert!(!channel.is_open());
        assert!(matches!(channel.send_raw_message(b"x", None), Err(MuxError::ChannelClosed)));
    }
}
