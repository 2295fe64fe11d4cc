//! Single-channel data chain.
//!
//! The whole stream runs over one unlimited data channel. Every packet
//! carries one [`ChainCell`]; the first upstream cell holds the chain type,
//! later cells hold `0` in that byte.
//!
//! With flow control every `upstream_send_me`-th upstream data cell carries
//! the flow-control flag, and a downstream cell carrying the flag is
//! acknowledged right away with an empty cell carrying the flag.

use std::sync::Arc;
use std::thread::JoinHandle;

use cascade_wire::cell::{ChainCell, FLAG_CONNECTION_ERROR, FLAG_FLOW_CONTROL};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::chain::queue::InputQueue;
use crate::chain::{channel_failure, ConnectionErrorHook, FlowControl};
use crate::channel::{Channel, ChannelMessage, DataChannel, DataChannelMode};
use crate::mux::Multiplexer;
use crate::scheduler::CancelToken;
use crate::{MuxError, Result};

#[derive(Default)]
struct OutputState {
    first_cell_sent: bool,
    data_cells: u64,
    closed: bool,
}

pub(crate) struct SingleChannelChain {
    channel: Arc<DataChannel>,
    chain_type: u8,
    flow_control: Option<FlowControl>,
    output: Mutex<OutputState>,
    cancel: CancelToken,
    stop: Sender<()>,
}

impl SingleChannelChain {
    pub(crate) fn open(
        mux: &Multiplexer,
        chain_type: u8,
        flow_control: Option<FlowControl>,
        queue: Arc<InputQueue>,
        on_connection_error: Option<ConnectionErrorHook>,
        cancel: CancelToken,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let (channel, messages) = mux.create_data_channel(DataChannelMode::Unlimited, Some(&cancel))?;
        let (stop, stop_rx) = unbounded();
        let chain = Arc::new(Self {
            channel,
            chain_type,
            flow_control,
            output: Mutex::new(OutputState::default()),
            cancel,
            stop,
        });

        let processor = Arc::clone(&chain);
        let handle = std::thread::Builder::new()
            .name("chain-processor".into())
            .spawn(move || processor.run(&messages, &stop_rx, &queue, on_connection_error.as_ref()))?;
        Ok((chain, handle))
    }

    /// Send as much of `data` as fits into the next cell.
    pub(crate) fn write(&self, data: &[u8]) -> Result<usize> {
        let mut output = self.output.lock();
        if output.closed {
            return Err(MuxError::ChannelClosed);
        }
        self.send(&mut output, data, false)
    }

    fn send(&self, output: &mut OutputState, data: &[u8], acknowledge: bool) -> Result<usize> {
        let chain_type = if output.first_cell_sent { 0 } else { self.chain_type };
        let mut flags = 0;
        if acknowledge {
            flags |= FLAG_FLOW_CONTROL;
        } else if let Some(flow) = self.flow_control {
            let nth = output.data_cells + 1;
            if flow.upstream_send_me > 0 && nth % u64::from(flow.upstream_send_me) == 0 {
                flags |= FLAG_FLOW_CONTROL;
            }
        }

        // Acknowledgements keep flowing after an interrupt.
        let cancel = (!acknowledge).then_some(&self.cancel);
        let written = self.channel.send_cell(cancel, |cell| {
            let n = data.len().min(ChainCell::capacity(cell.len()));
            ChainCell {
                flags,
                chain_type,
                data: data[..n].to_vec(),
            }
            .encode_into(cell)?;
            Ok(n)
        })?;

        output.first_cell_sent = true;
        if !acknowledge {
            output.data_cells += 1;
        }
        Ok(written)
    }

    fn acknowledge(&self) {
        let mut output = self.output.lock();
        if output.closed {
            return;
        }
        if let Err(e) = self.send(&mut output, &[], true) {
            debug!(error = %e, "flow control acknowledgement not sent");
        }
    }

    /// Stop writing and start the channel close.
    pub(crate) fn close_output(&self) {
        self.output.lock().closed = true;
        self.channel.organize_close();
    }

    pub(crate) fn stop(&self) {
        let _ = self.stop.send(());
    }

    fn run(
        &self,
        messages: &Receiver<ChannelMessage>,
        stop: &Receiver<()>,
        queue: &InputQueue,
        on_connection_error: Option<&ConnectionErrorHook>,
    ) {
        loop {
            let message = select! {
                recv(stop) -> _ => break,
                recv(messages) -> message => match message {
                    Ok(message) => message,
                    Err(_) => {
                        queue.push_end();
                        break;
                    }
                },
            };
            match message {
                ChannelMessage::PacketReceived(payload) => match ChainCell::decode(&payload) {
                    Ok(cell) => {
                        if self.flow_control.is_some() && cell.has_flag(FLAG_FLOW_CONTROL) {
                            self.acknowledge();
                        }
                        let connection_error = cell.has_flag(FLAG_CONNECTION_ERROR);
                        queue.push_data(cell.data);
                        if connection_error {
                            warn!("last mix signaled a connection error");
                            queue.push_error(MuxError::ConnectionError);
                            if let Some(hook) = on_connection_error {
                                hook();
                            }
                        }
                    }
                    Err(e) => queue.push_error(e.into()),
                },
                ChannelMessage::ChannelClosed(_) => {
                    queue.push_end();
                    break;
                }
                ChannelMessage::ChannelError(reason) => queue.push_error(channel_failure(reason)),
            }
        }
        debug!(channel_id = self.channel.id(), "chain processor finished");
    }
}
