//! Data channels.
//!
//! A data channel owns the per-hop ciphers of one anonymous connection
//! through the cascade and hands decrypted payloads to its data chain through
//! an internal message queue.
//!
//! ## Channel flags
//!
//! | flag | value | meaning |
//! |---|---|---|
//! | `DATA` | `0x0000` | data on an open channel |
//! | `CLOSE` | `0x0001` | the sender closes the channel |
//! | `OPEN` | `0x0008` | first upstream packet, carries the hop keys |
//! | `DUMMY` | `0x0010` | downstream filler, dropped on arrival |
//!
//! ## Modes
//!
//! - [`DataChannelMode::Unlimited`]: any number of packets both ways until
//!   either side sends `CLOSE`.
//! - [`DataChannelMode::SimulatedLimited`]: exactly one upstream packet and
//!   at most `downstream_packets` downstream packets, the last of which
//!   carries `CLOSE`; a supervisor thread enforces `channel_timeout`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cascade_wire::packet::{MixPacket, PAYLOAD_SIZE};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::cipher::ChannelLayers;
use crate::mux::MuxHandle;
use crate::scheduler::{CancelToken, SendPriority};
use crate::{MuxError, Result};

/// Data on an open channel.
pub const FLAG_CHANNEL_DATA: u16 = 0x0000;

/// The sender closes the channel.
pub const FLAG_CHANNEL_CLOSE: u16 = 0x0001;

/// First upstream packet of a channel.
pub const FLAG_CHANNEL_OPEN: u16 = 0x0008;

/// Downstream filler.
pub const FLAG_CHANNEL_DUMMY: u16 = 0x0010;

/// How a data channel accounts for packets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataChannelMode {
    /// Unlimited packets in both directions.
    Unlimited,
    /// One upstream packet, a fixed number of downstream packets.
    SimulatedLimited {
        /// Downstream packets including the closing one.
        downstream_packets: u32,
        /// Time allowed between opening and the closing packet.
        channel_timeout: Duration,
    },
}

/// Internal message from a channel to its data chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelMessage {
    /// A decrypted downstream payload.
    PacketReceived(Vec<u8>),
    /// The channel is gone; carries the payload of the closing packet if any.
    ChannelClosed(Option<Vec<u8>>),
    /// The channel failed; a `ChannelClosed` may still follow.
    ChannelError(String),
}

struct DataState {
    /// Registered and able to send.
    open: bool,
    /// First upstream packet sent.
    opened: bool,
    /// No further downstream packets are accepted (simulated-limited).
    finished: bool,
    received: u32,
    close_payload: Option<Vec<u8>>,
    layers: ChannelLayers,
}

/// One onion-encrypted channel through the cascade.
pub struct DataChannel {
    id: u32,
    mux: MuxHandle,
    mode: DataChannelMode,
    state: Mutex<DataState>,
    finished: Condvar,
    messages: Sender<ChannelMessage>,
}

impl DataChannel {
    pub(crate) fn new(
        id: u32,
        mux: MuxHandle,
        layers: ChannelLayers,
        mode: DataChannelMode,
    ) -> (Arc<Self>, Receiver<ChannelMessage>) {
        let (messages, rx) = unbounded();
        let channel = Arc::new(Self {
            id,
            mux,
            mode,
            state: Mutex::new(DataState {
                open: true,
                opened: false,
                finished: false,
                received: 0,
                close_payload: None,
                layers,
            }),
            finished: Condvar::new(),
            messages,
        });
        (channel, rx)
    }

    /// Accounting mode.
    pub fn mode(&self) -> DataChannelMode {
        self.mode
    }

    /// Whether the next [`DataChannel::send_cell`] can succeed.
    pub fn accepts_upstream(&self) -> bool {
        let state = self.state.lock();
        state.open
            && match self.mode {
                DataChannelMode::Unlimited => true,
                DataChannelMode::SimulatedLimited { .. } => !state.opened,
            }
    }

    /// Whether the first upstream packet went out.
    pub fn is_opened(&self) -> bool {
        self.state.lock().opened
    }

    /// Size of the cell the next packet carries after hop key transport.
    pub fn next_cell_size(&self) -> usize {
        PAYLOAD_SIZE - self.state.lock().layers.next_packet_overhead()
    }

    /// Build and send one packet.
    ///
    /// `fill` receives the cell (pre-filled with random bytes) and writes the
    /// chain's framing into it; its result is returned once the packet is on
    /// the wire. The cell is encrypted only after the send slot is granted,
    /// so the channel lock is never held across the wait and the receive
    /// thread keeps decrypting downstream packets meanwhile.
    pub fn send_cell<T, F>(self: &Arc<Self>, cancel: Option<&CancelToken>, fill: F) -> Result<T>
    where
        F: FnOnce(&mut [u8]) -> Result<T>,
    {
        let mux = self.mux.upgrade()?;
        let (value, opening) = mux.send_with(SendPriority::Data, cancel, || {
            let mut state = self.state.lock();
            if !state.open {
                return Err(MuxError::ChannelClosed);
            }
            let opening = !state.opened;
            let flags = if opening {
                FLAG_CHANNEL_OPEN
            } else {
                if let DataChannelMode::SimulatedLimited { .. } = self.mode {
                    return Err(MuxError::Protocol(
                        "simulated-limited channel carries a single upstream packet".into(),
                    ));
                }
                FLAG_CHANNEL_DATA
            };
            let (packet, value) = self.seal(&mut state, flags, fill)?;
            state.opened = true;
            Ok((packet, (value, opening)))
        })?;

        if opening {
            if let DataChannelMode::SimulatedLimited { channel_timeout, .. } = self.mode {
                self.spawn_supervisor(channel_timeout)?;
            }
        }
        Ok(value)
    }

    /// Onion-encrypt one cell into a packet carrying `flags`.
    fn seal<T, F>(&self, state: &mut DataState, flags: u16, fill: F) -> Result<(MixPacket, T)>
    where
        F: FnOnce(&mut [u8]) -> Result<T>,
    {
        let mut packet = MixPacket::new(self.id);
        packet.set_flags(flags);
        let overhead = state.layers.next_packet_overhead();
        let mut cell = packet.payload()[overhead..].to_vec();
        let value = fill(&mut cell)?;
        state.layers.encrypt_outbound(cell, &mut packet)?;
        Ok((packet, value))
    }

    fn spawn_supervisor(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let channel = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("channel-timeout-{:08x}", self.id))
            .spawn(move || channel.supervise(timeout))?;
        Ok(())
    }

    fn supervise(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.finished {
            if self.finished.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if !state.finished {
            warn!(channel_id = self.id, ?timeout, "channel timeout");
            state.finished = true;
            self.notify(ChannelMessage::ChannelError("channel timeout".into()));
        }
        let payload = state.close_payload.take();
        self.notify(ChannelMessage::ChannelClosed(payload));
        self.delete_locked(&mut state);
    }

    /// Start the close negotiation for this channel.
    pub fn organize_close(self: &Arc<Self>) {
        match self.mode {
            DataChannelMode::Unlimited => {
                let opened = {
                    let state = self.state.lock();
                    if !state.open {
                        return;
                    }
                    state.opened
                };
                if opened {
                    if let Err(e) = self.send_close() {
                        debug!(channel_id = self.id, error = %e, "close packet not sent");
                    }
                }
                let mut state = self.state.lock();
                if self.delete_locked(&mut state) {
                    self.notify(ChannelMessage::ChannelClosed(None));
                }
            }
            DataChannelMode::SimulatedLimited { .. } => {
                // An opened channel closes when the cascade sends CLOSE or
                // the supervisor times out.
                let mut state = self.state.lock();
                if state.open && !state.opened {
                    state.finished = true;
                    self.delete_locked(&mut state);
                    self.notify(ChannelMessage::ChannelClosed(None));
                }
            }
        }
    }

    fn send_close(&self) -> Result<()> {
        let mux = self.mux.upgrade()?;
        mux.send_with(SendPriority::Data, None, || {
            let mut state = self.state.lock();
            if !state.open {
                return Err(MuxError::ChannelClosed);
            }
            self.seal(&mut state, FLAG_CHANNEL_CLOSE, |_| Ok(()))
        })
    }

    /// Mark the channel closed and unregister it. Returns `false` if it was
    /// already closed.
    fn delete_locked(&self, state: &mut DataState) -> bool {
        if !state.open {
            return false;
        }
        state.open = false;
        if let Ok(mux) = self.mux.upgrade() {
            mux.table().remove_channel(self.id);
        }
        debug!(channel_id = self.id, "data channel deleted");
        true
    }

    fn notify(&self, message: ChannelMessage) {
        // The chain may already be gone.
        let _ = self.messages.send(message);
    }

    fn handle_limited(&self, state: &mut DataState, flags: u16, payload: Vec<u8>, expected: u32) {
        if state.finished {
            debug!(channel_id = self.id, "packet after channel end dropped");
            return;
        }
        state.received += 1;
        if flags & FLAG_CHANNEL_CLOSE != 0 {
            if state.received < expected {
                warn!(channel_id = self.id, received = state.received, expected, "packets missing on channel");
                self.notify(ChannelMessage::ChannelError("packets missing on channel".into()));
            }
            state.close_payload = Some(payload);
            state.finished = true;
            self.finished.notify_all();
        } else if state.received >= expected {
            warn!(channel_id = self.id, expected, "more packets on channel than allowed");
            self.notify(ChannelMessage::ChannelError("more packets on channel than allowed".into()));
            state.finished = true;
            self.finished.notify_all();
        } else {
            self.notify(ChannelMessage::PacketReceived(payload));
        }
    }
}

impl Channel for DataChannel {
    fn id(&self) -> u32 {
        self.id
    }

    fn process_received_packet(&self, packet: MixPacket) {
        let flags = packet.flags();
        if flags & FLAG_CHANNEL_DUMMY != 0 {
            debug!(channel_id = self.id, "dummy packet dropped");
            return;
        }

        let mut state = self.state.lock();
        if !state.open {
            debug!(channel_id = self.id, "packet for closed channel dropped");
            return;
        }
        let mut payload = packet.payload().to_vec();
        if let Err(e) = state.layers.decrypt_inbound(&mut payload) {
            warn!(channel_id = self.id, error = %e, "undecryptable packet");
            self.notify(ChannelMessage::ChannelError(e.to_string()));
            return;
        }

        match self.mode {
            DataChannelMode::Unlimited => {
                if flags & FLAG_CHANNEL_CLOSE != 0 {
                    if self.delete_locked(&mut state) {
                        self.notify(ChannelMessage::ChannelClosed(Some(payload)));
                    }
                } else {
                    self.notify(ChannelMessage::PacketReceived(payload));
                }
            }
            DataChannelMode::SimulatedLimited { downstream_packets, .. } => {
                self.handle_limited(&mut state, flags, payload, downstream_packets);
            }
        }
    }

    fn multiplexer_closed(&self) {
        let mut state = self.state.lock();
        match self.mode {
            DataChannelMode::Unlimited => {
                if state.open {
                    state.open = false;
                    self.notify(ChannelMessage::ChannelError("multiplexer closed".into()));
                    self.notify(ChannelMessage::ChannelClosed(None));
                }
            }
            DataChannelMode::SimulatedLimited { .. } => {
                if !state.finished {
                    warn!(channel_id = self.id, "multiplexer closed before channel received all packets");
                    state.finished = true;
                    self.notify(ChannelMessage::ChannelError("multiplexer closed".into()));
                    self.finished.notify_all();
                    if !state.opened && state.open {
                        // No supervisor runs for a channel that never opened.
                        state.open = false;
                        self.notify(ChannelMessage::ChannelClosed(None));
                    }
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherChain, MixParameters};
    use cascade_crypto::asym::{AsymDecryptor, AsymScheme};
    use cascade_crypto::keys::generate_rsa_key;

    fn layers() -> ChannelLayers {
        let decryptor = AsymDecryptor::new(generate_rsa_key(1024).expect("keygen"), AsymScheme::Plain);
        let chain = CipherChain::new(vec![MixParameters::new("mix", decryptor.public_cipher())], None, false)
            .expect("chain");
        chain.open_channel()
    }

    #[test]
    fn test_send_without_multiplexer_fails() {
        let (channel, _rx) = DataChannel::new(4711, MuxHandle::detached(), layers(), DataChannelMode::Unlimited);
        assert!(matches!(
            channel.send_cell(None, |_| Ok(())),
            Err(MuxError::MultiplexerClosed)
        ));
        assert!(!channel.is_opened());
    }

    #[test]
    fn test_multiplexer_closed_notifies_once() {
        let (channel, rx) = DataChannel::new(4711, MuxHandle::detached(), layers(), DataChannelMode::Unlimited);
        channel.multiplexer_closed();
        channel.multiplexer_closed();
        let messages: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            messages,
            vec![
                ChannelMessage::ChannelError("multiplexer closed".into()),
                ChannelMessage::ChannelClosed(None)
            ]
        );
        assert!(!channel.is_open());
        assert!(matches!(
            channel.send_cell(None, |_| Ok(())),
            Err(MuxError::ChannelClosed | MuxError::MultiplexerClosed)
        ));
    }

    #[test]
    fn test_unopened_limited_channel_closes_locally() {
        let mode = DataChannelMode::SimulatedLimited {
            downstream_packets: 3,
            channel_timeout: Duration::from_secs(10),
        };
        let (channel, rx) = DataChannel::new(4711, MuxHandle::detached(), layers(), mode);
        assert!(channel.accepts_upstream());
        channel.organize_close();
        assert_eq!(rx.try_recv().ok(), Some(ChannelMessage::ChannelClosed(None)));
        assert!(!channel.accepts_upstream());
        // Idempotent.
        channel.organize_close();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dummy_packets_are_dropped() {
        let (channel, rx) = DataChannel::new(4711, MuxHandle::detached(), layers(), DataChannelMode::Unlimited);
        let mut packet = MixPacket::new(4711);
        packet.set_flags(FLAG_CHANNEL_DUMMY);
        channel.process_received_packet(packet);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_packet_before_open_is_channel_error() {
        let (channel, rx) = DataChannel::new(4711, MuxHandle::detached(), layers(), DataChannelMode::Unlimited);
        channel.process_received_packet(MixPacket::new(4711));
        assert!(matches!(rx.try_recv(), Ok(ChannelMessage::ChannelError(_))));
    }

    #[test]
    fn test_next_cell_size_accounts_for_key_transport() {
        let (channel, _rx) = DataChannel::new(4711, MuxHandle::detached(), layers(), DataChannelMode::Unlimited);
        assert_eq!(channel.next_cell_size(), PAYLOAD_SIZE - 16);
    }
}
