//! Sequential data chain for the fixed-ratio chain protocol.
//!
//! Every upstream packet travels on its own simulated-limited channel, and
//! the cascade answers each with a bounded number of downstream packets.
//! The chain strings these channels together:
//!
//! - The first downstream cell of the chain carries the chain id chosen by
//!   the last mix; every later upstream cell (on a sequel channel) carries it
//!   back.
//! - A sequel channel is only created once the previous one has delivered a
//!   downstream packet.
//! - The processor reads channels strictly in creation order. When every
//!   channel is used up and the chain is still open, a keep-alive order with
//!   `FAST_RESPONSE` gives the cascade a channel for further downstream data.
//! - The first byte written to the chain is the chain type.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use cascade_wire::cell::{
    SequentialCell, CHAIN_ID_LENGTH, SEQ_FLAG_CONNECTION_ERROR, SEQ_FLAG_FAST_RESPONSE,
    SEQ_FLAG_NEW_CHAIN, SEQ_FLAG_STREAM_CLOSED, SEQ_FLAG_UNKNOWN_CHAIN_ID,
};
use crossbeam_channel::{select, Receiver};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::chain::queue::InputQueue;
use crate::chain::{channel_failure, ConnectionErrorHook, FixedRatio};
use crate::channel::{ChannelMessage, DataChannel, DataChannelMode};
use crate::mux::Multiplexer;
use crate::scheduler::{CancelToken, CANCEL_POLL_INTERVAL};
use crate::{MuxError, Result};

struct ChainChannel {
    channel: Arc<DataChannel>,
    messages: Receiver<ChannelMessage>,
    downstream: u32,
}

#[derive(Default)]
struct SequentialState {
    channels: VecDeque<ChainChannel>,
    chain_id: Option<[u8; CHAIN_ID_LENGTH]>,
    type_sent: bool,
    first_downstream_seen: bool,
    /// No further orders are accepted.
    closed: bool,
    /// The processor thread must exit.
    stopped: bool,
}

pub(crate) struct SequentialChain {
    mux: Multiplexer,
    params: FixedRatio,
    chain_type: u8,
    queue: Arc<InputQueue>,
    on_connection_error: Option<ConnectionErrorHook>,
    /// Serializes orders so each one sees a consistent channel list.
    order_lock: Mutex<()>,
    state: Mutex<SequentialState>,
    changed: Condvar,
    cancel: CancelToken,
    stop: crossbeam_channel::Sender<()>,
    stop_rx: Receiver<()>,
}

enum Step {
    Continue,
    Terminate,
}

impl SequentialChain {
    pub(crate) fn open(
        mux: &Multiplexer,
        params: FixedRatio,
        chain_type: u8,
        queue: Arc<InputQueue>,
        on_connection_error: Option<ConnectionErrorHook>,
        cancel: CancelToken,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let (stop, stop_rx) = crossbeam_channel::bounded(1);
        let chain = Arc::new(Self {
            mux: mux.clone(),
            params,
            chain_type,
            queue,
            on_connection_error,
            order_lock: Mutex::new(()),
            state: Mutex::new(SequentialState::default()),
            changed: Condvar::new(),
            cancel,
            stop,
            stop_rx,
        });
        let processor = Arc::clone(&chain);
        let handle = std::thread::Builder::new()
            .name("chain-processor".into())
            .spawn(move || processor.run())?;
        Ok((chain, handle))
    }

    /// Send as much of `data` as fits into the next cell.
    pub(crate) fn write(self: &Arc<Self>, data: &[u8]) -> Result<usize> {
        self.order(data, false, false, Some(&self.cancel))
    }

    fn order(
        self: &Arc<Self>,
        data: &[u8],
        close: bool,
        keep_alive: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<usize> {
        let _order = self.order_lock.lock();
        let mut state = self.state.lock();
        if state.closed {
            return Err(MuxError::ChannelClosed);
        }
        let channel = self.sending_channel(&mut state, cancel)?;
        let chain_id = state.chain_id;
        let type_pending = !state.type_sent;
        drop(state);

        let chain_type = self.chain_type;
        let written = channel.send_cell(cancel, |cell| {
            let mut body = Vec::new();
            if type_pending {
                body.push(chain_type);
            }
            let capacity = SequentialCell::capacity(cell.len(), chain_id.is_some());
            let take = data.len().min(capacity.saturating_sub(body.len()));
            body.extend_from_slice(&data[..take]);

            let mut flags = 0;
            if chain_id.is_none() {
                flags |= SEQ_FLAG_NEW_CHAIN;
            }
            if take < data.len() || keep_alive {
                flags |= SEQ_FLAG_FAST_RESPONSE;
            }
            if close {
                flags |= SEQ_FLAG_STREAM_CLOSED;
            }
            SequentialCell {
                flags,
                chain_id,
                data: body,
            }
            .encode_into(cell)?;
            Ok(take)
        })?;

        self.state.lock().type_sent = true;
        Ok(written)
    }

    /// The channel the next upstream packet goes out on, creating a sequel
    /// channel when the last one is used up.
    fn sending_channel(
        &self,
        state: &mut MutexGuard<'_, SequentialState>,
        cancel: Option<&CancelToken>,
    ) -> Result<Arc<DataChannel>> {
        let deadline = Instant::now() + self.params.chain_timeout;
        loop {
            if state.closed {
                return Err(MuxError::ChannelClosed);
            }
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(MuxError::Interrupted);
            }
            match state.channels.back() {
                Some(last) if last.channel.accepts_upstream() => return Ok(Arc::clone(&last.channel)),
                Some(last) if last.downstream == 0 => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(timeout = ?self.params.chain_timeout, "no downstream packet on chain");
                        return Err(MuxError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "no downstream packet on chain",
                        )));
                    }
                    let wait = match cancel {
                        Some(_) => (deadline - now).min(CANCEL_POLL_INTERVAL),
                        None => deadline - now,
                    };
                    self.changed.wait_for(state, wait);
                }
                _ => {
                    let mode = DataChannelMode::SimulatedLimited {
                        downstream_packets: self.params.downstream_packets,
                        channel_timeout: self.params.channel_timeout,
                    };
                    let (channel, messages) = MutexGuard::unlocked(state, || self.mux.create_data_channel(mode, cancel))?;
                    state.channels.push_back(ChainChannel {
                        channel: Arc::clone(&channel),
                        messages,
                        downstream: 0,
                    });
                    self.changed.notify_all();
                    debug!(channels = state.channels.len(), "sequel channel created");
                    return Ok(channel);
                }
            }
        }
    }

    /// Send the stream close to the last mix and refuse further orders.
    pub(crate) fn close_output(self: &Arc<Self>) {
        let anything_sent = self.state.lock().type_sent;
        if anything_sent {
            if let Err(e) = self.order(&[], true, false, None) {
                debug!(error = %e, "stream close not sent");
            }
        }
        self.state.lock().closed = true;
        self.changed.notify_all();
    }

    pub(crate) fn stop(&self) {
        self.state.lock().stopped = true;
        self.changed.notify_all();
        let _ = self.stop.try_send(());
    }

    fn run(self: Arc<Self>) {
        loop {
            let Some(messages) = self.next_channel() else {
                break;
            };
            let message = select! {
                recv(self.stop_rx) -> _ => break,
                recv(messages) -> message => message,
            };
            let step = match message {
                Ok(ChannelMessage::PacketReceived(payload)) => self.on_packet(&payload),
                Ok(ChannelMessage::ChannelClosed(payload)) => self.on_channel_closed(payload.as_deref()),
                Ok(ChannelMessage::ChannelError(reason)) => {
                    self.queue.push_error(channel_failure(reason));
                    Step::Terminate
                }
                Err(_) => Step::Terminate,
            };
            if let Step::Terminate = step {
                break;
            }
        }
        self.terminate();
    }

    /// Wait for the head channel; spawns a keep-alive order when the list
    /// ran empty on an open chain.
    fn next_channel(self: &Arc<Self>) -> Option<Receiver<ChannelMessage>> {
        let mut state = self.state.lock();
        if state.channels.is_empty() && state.first_downstream_seen && !state.closed && !state.stopped {
            let chain = Arc::clone(self);
            let spawned = std::thread::Builder::new().name("chain-keep-alive".into()).spawn(move || {
                if let Err(e) = chain.order(&[], false, true, Some(&chain.cancel)) {
                    debug!(error = %e, "keep-alive order failed");
                }
            });
            if let Err(e) = spawned {
                warn!(error = %e, "keep-alive thread not started");
            }
        }
        loop {
            if state.stopped {
                return None;
            }
            if let Some(head) = state.channels.front() {
                return Some(head.messages.clone());
            }
            self.changed.wait(&mut state);
        }
    }

    fn on_packet(&self, payload: &[u8]) -> Step {
        let mut state = self.state.lock();
        let with_chain_id = !state.first_downstream_seen;
        let cell = match SequentialCell::decode(payload, with_chain_id) {
            Ok(cell) => cell,
            Err(e) => {
                self.queue.push_error(e.into());
                return Step::Terminate;
            }
        };
        if with_chain_id {
            if let Some(id) = &cell.chain_id {
                debug!(chain_id = %hex::encode(id), "chain id assigned by last mix");
            }
            state.chain_id = cell.chain_id;
            state.first_downstream_seen = true;
        }
        let unknown_chain = cell.has_flag(SEQ_FLAG_UNKNOWN_CHAIN_ID);
        let stream_closed = cell.has_flag(SEQ_FLAG_STREAM_CLOSED);
        self.queue.push_data(cell.data);
        if unknown_chain {
            warn!("last mix signaled an unknown chain id");
            self.queue.push_error(MuxError::Protocol("last mix does not know the chain".into()));
        }
        if stream_closed {
            debug!("downstream closed by last mix");
            return Step::Terminate;
        }
        if let Some(head) = state.channels.front_mut() {
            head.downstream += 1;
        }
        self.changed.notify_all();
        Step::Continue
    }

    fn on_channel_closed(&self, payload: Option<&[u8]>) -> Step {
        if let Some(payload) = payload {
            match SequentialCell::decode(payload, false) {
                Ok(cell) if cell.data.is_empty() && cell.has_flag(SEQ_FLAG_CONNECTION_ERROR) => {
                    warn!("last mix signaled a connection error");
                    self.queue.push_error(MuxError::ConnectionError);
                    if let Some(hook) = &self.on_connection_error {
                        hook();
                    }
                }
                Ok(_) => {}
                Err(e) => self.queue.push_error(e.into()),
            }
        }

        let mut state = self.state.lock();
        match state.channels.front() {
            Some(head) if head.downstream == 0 => {
                warn!("channel closed without a downstream packet");
                Step::Terminate
            }
            Some(_) => {
                state.channels.pop_front();
                self.changed.notify_all();
                Step::Continue
            }
            None => Step::Terminate,
        }
    }

    fn terminate(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.queue.push_end();
        for entry in state.channels.drain(..) {
            entry.channel.organize_close();
        }
        drop(state);
        self.changed.notify_all();
        debug!("sequential chain processor finished");
    }
}
