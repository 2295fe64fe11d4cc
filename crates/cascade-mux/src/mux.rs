//! The multiplexer.
//!
//! Owns the connection to the first mix. Outgoing packets from any thread go
//! through the two-tier [`SendScheduler`]; a dedicated receive thread parses
//! incoming packets and dispatches them through the [`ChannelTable`].
//!
//! When the receive loop ends (orderly close or connection failure) the
//! scheduler and the table are closed, every channel is notified and a final
//! [`MuxEvent::Closed`] is emitted.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use cascade_crypto::sym::SymCipher;
use cascade_wire::connection::{ReadHalf, StreamConnection, WriteHalf};
use cascade_wire::packet::MixPacket;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{ChannelMessage, DataChannel, DataChannelMode};
use crate::cipher::CipherChain;
use crate::events::{EventBus, MuxEvent};
use crate::scheduler::{CancelToken, SendPriority, SendScheduler};
use crate::table::{ChannelTable, TableEntry};
use crate::{is_control_channel_id, MuxError, Result, DEFAULT_MAX_DATA_CHANNELS};

/// Everything the key exchange produced that the multiplexer needs.
pub struct MuxSetup {
    /// Onion layers for data channels.
    pub cipher_chain: CipherChain,
    /// Link cipher for packets from the first mix.
    pub input_link: Option<SymCipher>,
    /// Link cipher for packets to the first mix.
    pub output_link: Option<SymCipher>,
    /// Cap on simultaneously open data channels.
    pub max_data_channels: usize,
}

impl MuxSetup {
    /// Setup without link encryption and with the default channel cap.
    pub fn new(cipher_chain: CipherChain) -> Self {
        Self {
            cipher_chain,
            input_link: None,
            output_link: None,
            max_data_channels: DEFAULT_MAX_DATA_CHANNELS,
        }
    }

    /// Set both link ciphers.
    pub fn with_link_ciphers(mut self, input: SymCipher, output: SymCipher) -> Self {
        self.input_link = Some(input);
        self.output_link = Some(output);
        self
    }

    /// Set the data channel cap.
    pub fn with_max_data_channels(mut self, max: usize) -> Self {
        self.max_data_channels = max;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MuxState {
    Active,
    Closing,
    Closed,
}

struct Writer {
    stream: WriteHalf,
    link: Option<SymCipher>,
}

pub(crate) struct MuxInner {
    connection: Arc<dyn StreamConnection>,
    writer: Mutex<Writer>,
    scheduler: SendScheduler,
    table: ChannelTable,
    events: EventBus,
    cipher_chain: Arc<CipherChain>,
    state: Mutex<MuxState>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    receiver_thread: Mutex<Option<ThreadId>>,
}

/// Weak reference from channels and chains back to their multiplexer.
#[derive(Clone)]
pub(crate) struct MuxHandle(Weak<MuxInner>);

impl MuxHandle {
    pub(crate) fn upgrade(&self) -> Result<Arc<MuxInner>> {
        self.0.upgrade().ok_or(MuxError::MultiplexerClosed)
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self(Weak::new())
    }
}

/// Multiplexes control and data channels over one cascade connection.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    /// Take over `connection` and start the receive thread.
    pub fn start(connection: Arc<dyn StreamConnection>, setup: MuxSetup) -> Result<Self> {
        connection.set_timeout(None)?;
        let (reader, writer) = connection.split()?;
        let inner = Arc::new(MuxInner {
            connection,
            writer: Mutex::new(Writer {
                stream: writer,
                link: setup.output_link,
            }),
            scheduler: SendScheduler::new(),
            table: ChannelTable::new(setup.max_data_channels),
            events: EventBus::new(),
            cipher_chain: Arc::new(setup.cipher_chain),
            state: Mutex::new(MuxState::Active),
            receiver: Mutex::new(None),
            receiver_thread: Mutex::new(None),
        });

        let loop_inner = Arc::clone(&inner);
        let input_link = setup.input_link;
        let handle = thread::Builder::new()
            .name("mux-receive".into())
            .spawn(move || loop_inner.receive_loop(reader, input_link))?;
        *inner.receiver_thread.lock() = Some(handle.thread().id());
        *inner.receiver.lock() = Some(handle);

        info!(peer = %inner.connection.peer(), hops = inner.cipher_chain.hop_count(), "multiplexer started");
        Ok(Self { inner })
    }

    pub(crate) fn handle(&self) -> MuxHandle {
        MuxHandle(Arc::downgrade(&self.inner))
    }

    /// Send one packet. Control packets are preferred over data packets.
    pub fn send_packet(&self, packet: MixPacket, cancel: Option<&CancelToken>) -> Result<()> {
        self.inner.send_packet(packet, cancel)
    }

    /// Create and register a data channel with fresh onion layers.
    ///
    /// Blocks while the data channel cap is reached, unless `cancel` fires.
    /// On a closed multiplexer the returned channel is already closed.
    pub fn create_data_channel(
        &self,
        mode: DataChannelMode,
        cancel: Option<&CancelToken>,
    ) -> Result<(Arc<DataChannel>, Receiver<ChannelMessage>)> {
        self.inner.table.create_data_channel(
            |id| DataChannel::new(id, self.handle(), self.inner.cipher_chain.open_channel(), mode),
            cancel,
        )
    }

    /// Subscribe to packet events.
    pub fn subscribe(&self) -> Receiver<MuxEvent> {
        self.inner.events.subscribe()
    }

    /// The channel table.
    pub fn table(&self) -> &ChannelTable {
        &self.inner.table
    }

    /// Onion layers shared by all data channels.
    pub fn cipher_chain(&self) -> &Arc<CipherChain> {
        &self.inner.cipher_chain
    }

    /// Whether the receive loop has ended.
    pub fn is_closed(&self) -> bool {
        *self.inner.state.lock() == MuxState::Closed
    }

    /// Close the connection and wait for the receive loop to finish.
    ///
    /// Safe to call repeatedly and from channel callbacks running on the
    /// receive thread.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl MuxInner {
    pub(crate) fn table(&self) -> &ChannelTable {
        &self.table
    }

    /// Write one packet when the scheduler grants the slot.
    ///
    /// Control packets are preferred over data packets.
    pub(crate) fn send_packet(&self, packet: MixPacket, cancel: Option<&CancelToken>) -> Result<()> {
        let priority = if is_control_channel_id(packet.channel_id()) {
            SendPriority::Control
        } else {
            SendPriority::Data
        };
        self.send_with(priority, cancel, || Ok((packet, ())))
    }

    /// Wait for the send slot, then build the packet with `build` and write it.
    ///
    /// Packets built while holding the slot leave in the order their stream
    /// ciphers advanced, so callers need no lock of their own across the
    /// wait. Finalizers run right before serialization. A write failure
    /// closes the connection, which ends the receive loop.
    pub(crate) fn send_with<T, F>(&self, priority: SendPriority, cancel: Option<&CancelToken>, build: F) -> Result<T>
    where
        F: FnOnce() -> Result<(MixPacket, T)>,
    {
        let _slot = self.scheduler.acquire(priority, cancel)?;
        let (mut packet, value) = build()?;
        let control = is_control_channel_id(packet.channel_id());

        packet.run_finalizers();
        let written = {
            let mut writer = self.writer.lock();
            let Writer { stream, link } = &mut *writer;
            packet.write_to(stream.as_mut(), link.as_mut())
        };
        if let Err(e) = written {
            warn!(channel_id = packet.channel_id(), error = %e, "packet write failed, closing connection");
            self.shutdown_connection();
            return Err(e.into());
        }

        self.events.emit(if control {
            MuxEvent::ControlPacketSent
        } else {
            MuxEvent::DataPacketSent
        });
        Ok(value)
    }

    fn receive_loop(self: Arc<Self>, mut reader: ReadHalf, mut link: Option<SymCipher>) {
        loop {
            let packet = match MixPacket::parse(reader.as_mut(), link.as_mut()) {
                Ok(packet) => packet,
                Err(e) => {
                    if *self.state.lock() == MuxState::Active {
                        warn!(error = %e, "connection to cascade lost");
                    } else {
                        debug!(error = %e, "receive loop stopped");
                    }
                    break;
                }
            };
            self.dispatch(packet);
        }

        self.scheduler.close();
        self.table.close_table();
        *self.state.lock() = MuxState::Closed;
        // The peer may still be connected after a parse error.
        self.shutdown_connection();
        self.events.emit(MuxEvent::Closed);
        info!("multiplexer closed");
    }

    fn dispatch(&self, packet: MixPacket) {
        let id = packet.channel_id();
        let control = is_control_channel_id(id);
        match self.table.get_channel(id) {
            Some(entry) => {
                let event = match entry {
                    TableEntry::Control(_) => MuxEvent::ControlPacketReceived,
                    TableEntry::Data(_) => MuxEvent::DataPacketReceived,
                };
                entry.channel().process_received_packet(packet);
                self.events.emit(event);
            }
            None => {
                info!(channel_id = id, "packet for unknown channel discarded");
                self.events.emit(if control {
                    MuxEvent::ControlPacketDiscarded
                } else {
                    MuxEvent::DataPacketDiscarded
                });
            }
        }
    }

    fn shutdown_connection(&self) {
        if let Err(e) = self.connection.close() {
            debug!(error = %e, "connection close failed");
        }
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == MuxState::Active {
                *state = MuxState::Closing;
            }
        }
        self.shutdown_connection();
        self.scheduler.close();

        let on_receiver = *self.receiver_thread.lock() == Some(thread::current().id());
        if on_receiver {
            return;
        }
        if let Some(handle) = self.receiver.lock().take() {
            if handle.join().is_err() {
                warn!("receive thread panicked");
            }
        }
    }
}
