//! Packet event emission.
//!
//! The multiplexer publishes one [`MuxEvent`] per packet it sends, receives
//! or discards, and a final [`MuxEvent::Closed`]. Consumers (dummy traffic,
//! packet counters, the client's connection watcher) subscribe and get an
//! independent unbounded queue each.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

/// An event emitted by the multiplexer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MuxEvent {
    /// A control channel packet was written.
    ControlPacketSent,
    /// A data channel packet was written.
    DataPacketSent,
    /// A control channel packet was dispatched.
    ControlPacketReceived,
    /// A data channel packet was dispatched.
    DataPacketReceived,
    /// A packet for an unknown control channel was dropped.
    ControlPacketDiscarded,
    /// A packet for an unknown or closed data channel was dropped.
    DataPacketDiscarded,
    /// The receive loop ended; no further events follow.
    Closed,
}

/// Event bus for broadcasting multiplexer events to subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<MuxEvent>>>>,
}

impl EventBus {
    /// Create an event bus without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit an event to all subscribers, dropping those that went away.
    pub fn emit(&self, event: MuxEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event).is_ok());
    }

    /// Subscribe to events. Returns a receiver.
    pub fn subscribe(&self) -> Receiver<MuxEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }
}

/// Running totals of mixed packets.
#[derive(Debug, Default)]
pub struct PacketCounter {
    sent: AtomicU64,
    received: AtomicU64,
    discarded: AtomicU64,
}

impl PacketCounter {
    /// Fresh counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one event.
    pub fn record(&self, event: MuxEvent) {
        let counter = match event {
            MuxEvent::ControlPacketSent | MuxEvent::DataPacketSent => &self.sent,
            MuxEvent::ControlPacketReceived | MuxEvent::DataPacketReceived => &self.received,
            MuxEvent::ControlPacketDiscarded | MuxEvent::DataPacketDiscarded => &self.discarded,
            MuxEvent::Closed => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Packets written.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Packets dispatched to a channel.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Packets dropped on arrival.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Packets sent plus packets received.
    pub fn mixed_packets(&self) -> u64 {
        self.sent() + self.received()
    }

    /// Count events from `events` on a background thread until the
    /// multiplexer closes.
    pub fn watch(self: &Arc<Self>, events: Receiver<MuxEvent>) -> std::io::Result<JoinHandle<()>> {
        let counter = Arc::clone(self);
        std::thread::Builder::new()
            .name("packet-counter".into())
            .spawn(move || {
                for event in events {
                    if event == MuxEvent::Closed {
                        break;
                    }
                    counter.record(event);
                }
            })
    }
}
