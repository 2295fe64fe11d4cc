//! Data chains: byte streams over data channels.
//!
//! A [`DataChain`] turns one or more data channels into a blocking byte
//! stream. Which channels are used and how cells are framed depends on the
//! chain protocol the cascade announced:
//!
//! | protocol | chain | channel mode |
//! |---|---|---|
//! | unlimited | single channel | unlimited |
//! | flow controlled | single channel, SendMe flags | unlimited |
//! | fixed ratio | sequential channels | simulated-limited |
//!
//! Each chain runs a processor thread that turns channel messages into
//! entries of the chain's read queue.

mod queue;
mod sequential;
mod single;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::mux::Multiplexer;
use crate::scheduler::CancelToken;
use crate::{MuxError, Result};

use queue::InputQueue;
use sequential::SequentialChain;
use single::SingleChannelChain;

/// Called on the chain's processor thread when the last mix reports that
/// its connection to the destination failed.
pub type ConnectionErrorHook = Arc<dyn Fn() + Send + Sync>;

/// Flow control parameters (chain protocol 0.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowControl {
    /// Every n-th upstream data cell carries the flow-control flag.
    pub upstream_send_me: u32,
    /// Downstream cells the last mix sends between flow-control flags.
    pub downstream_send_me: u32,
}

/// Fixed-ratio parameters (chain protocol 0.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedRatio {
    /// Downstream packets per channel, including the closing one.
    pub downstream_packets: u32,
    /// Time a channel may take to deliver its downstream packets.
    pub channel_timeout: Duration,
    /// Time to wait for a downstream packet before a sequel channel.
    pub chain_timeout: Duration,
}

/// Chain protocol announced by the last mix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainProtocol {
    /// Chain protocol 0.3.
    Unlimited,
    /// Chain protocol 0.6.
    FlowControlled(FlowControl),
    /// Chain protocol 0.5.
    FixedRatio(FixedRatio),
}

/// Outcome of a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were copied.
    Data(usize),
    /// Nothing arrived within the timeout.
    Retry,
    /// The stream ended.
    End,
}

enum ChainKind {
    Single(Arc<SingleChannelChain>),
    Sequential(Arc<SequentialChain>),
}

/// A byte stream through the cascade.
pub struct DataChain {
    kind: ChainKind,
    protocol: ChainProtocol,
    queue: Arc<InputQueue>,
    cancel: CancelToken,
    closed: AtomicBool,
    processor: Mutex<Option<JoinHandle<()>>>,
    processor_thread: ThreadId,
}

impl DataChain {
    /// Open a chain of `chain_type` on `mux`.
    ///
    /// Blocks while the multiplexer's data channel cap is reached. Blocking
    /// waits of this chain end with [`MuxError::Interrupted`] once `cancel`
    /// fires or the chain is closed.
    pub fn open(
        mux: &Multiplexer,
        protocol: ChainProtocol,
        chain_type: u8,
        on_connection_error: Option<ConnectionErrorHook>,
        cancel: Option<&CancelToken>,
    ) -> Result<Self> {
        let cancel = cancel.map_or_else(CancelToken::new, CancelToken::child);
        let queue = Arc::new(InputQueue::new());
        let (kind, handle) = match protocol {
            ChainProtocol::Unlimited => {
                let (chain, handle) = SingleChannelChain::open(
                    mux,
                    chain_type,
                    None,
                    Arc::clone(&queue),
                    on_connection_error,
                    cancel.clone(),
                )?;
                (ChainKind::Single(chain), handle)
            }
            ChainProtocol::FlowControlled(flow) => {
                let (chain, handle) = SingleChannelChain::open(
                    mux,
                    chain_type,
                    Some(flow),
                    Arc::clone(&queue),
                    on_connection_error,
                    cancel.clone(),
                )?;
                (ChainKind::Single(chain), handle)
            }
            ChainProtocol::FixedRatio(params) => {
                let (chain, handle) = SequentialChain::open(
                    mux,
                    params,
                    chain_type,
                    Arc::clone(&queue),
                    on_connection_error,
                    cancel.clone(),
                )?;
                (ChainKind::Sequential(chain), handle)
            }
        };
        debug!(?protocol, chain_type, "data chain opened");
        Ok(Self {
            kind,
            protocol,
            queue,
            cancel,
            closed: AtomicBool::new(false),
            processor_thread: handle.thread().id(),
            processor: Mutex::new(Some(handle)),
        })
    }

    /// Chain protocol this chain speaks.
    pub fn protocol(&self) -> ChainProtocol {
        self.protocol
    }

    /// Send a prefix of `data`; returns how many bytes were accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(MuxError::ChannelClosed);
        }
        if data.is_empty() {
            return Ok(0);
        }
        match &self.kind {
            ChainKind::Single(chain) => chain.write(data),
            ChainKind::Sequential(chain) => chain.write(data),
        }
    }

    /// Send all of `data`.
    pub fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.write(data)?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Block until data, end of stream or an error is available.
    pub fn read(&self, buf: &mut [u8]) -> Result<ReadStatus> {
        self.queue.read(buf, None)
    }

    /// Like [`DataChain::read`], returning [`ReadStatus::Retry`] when
    /// nothing arrived within `timeout`.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<ReadStatus> {
        self.queue.read(buf, Some(timeout))
    }

    /// Bytes readable without blocking.
    pub fn available(&self) -> usize {
        self.queue.available()
    }

    /// Whether [`DataChain::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Abort writes blocked on this chain without closing it.
    ///
    /// Later writes fail with [`MuxError::Interrupted`] as well.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// Close write side, read side and channels, then wait for the
    /// processor thread. Idempotent.
    ///
    /// Writes blocked in other threads are interrupted first.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        match &self.kind {
            ChainKind::Single(chain) => chain.close_output(),
            ChainKind::Sequential(chain) => chain.close_output(),
        }
        self.queue.close();
        match &self.kind {
            ChainKind::Single(chain) => chain.stop(),
            ChainKind::Sequential(chain) => chain.stop(),
        }
        if thread::current().id() == self.processor_thread {
            return;
        }
        if let Some(handle) = self.processor.lock().take() {
            if handle.join().is_err() {
                warn!("chain processor panicked");
            }
        }
        debug!("data chain closed");
    }
}

impl Drop for DataChain {
    fn drop(&mut self) {
        self.close();
    }
}

/// Error entry for a channel that reported a failure.
pub(crate) fn channel_failure(reason: String) -> MuxError {
    MuxError::Io(io::Error::other(reason))
}

impl io::Read for &DataChain {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match DataChain::read(*self, buf)? {
            ReadStatus::Data(n) => Ok(n),
            ReadStatus::End => Ok(0),
            ReadStatus::Retry => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

impl io::Write for &DataChain {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(DataChain::write(*self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for DataChain {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }
}

impl io::Write for DataChain {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
