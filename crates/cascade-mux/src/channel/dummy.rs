//! Dummy traffic on the dummy control channel.
//!
//! When no packet crossed the connection for the configured interval, an
//! empty control message is sent on channel
//! [`CONTROL_CHANNEL_ID_DUMMY`](crate::CONTROL_CHANNEL_ID_DUMMY). Any sent or
//! received packet restarts the timer, so the first mix sees traffic at least
//! once per interval and the connection is kept alive through idle periods.
//!
//! Dummy messages from the cascade arrive on the same channel and are dropped.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{after, never, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::channel::control::{ControlChannel, DiscardHandler};
use crate::events::MuxEvent;
use crate::mux::Multiplexer;
use crate::{MuxError, Result, CONTROL_CHANNEL_ID_DUMMY};

/// Default interval between dummy packets in milliseconds.
pub const DEFAULT_DUMMY_INTERVAL_MS: u64 = 30_000;

/// Minimum interval between dummy packets in milliseconds.
pub const MIN_DUMMY_INTERVAL_MS: u64 = 500;

/// Maximum interval between dummy packets in milliseconds.
pub const MAX_DUMMY_INTERVAL_MS: u64 = 30_000;

/// Dummy traffic timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DummyTrafficConfig {
    /// Idle time before a dummy packet is sent.
    pub interval_ms: u64,
    /// Whether dummy packets are sent at all.
    pub enabled: bool,
}

impl Default for DummyTrafficConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_DUMMY_INTERVAL_MS,
            enabled: true,
        }
    }
}

impl DummyTrafficConfig {
    /// Enabled config; the interval is clamped to
    /// `[MIN_DUMMY_INTERVAL_MS, MAX_DUMMY_INTERVAL_MS]`.
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: interval_ms.clamp(MIN_DUMMY_INTERVAL_MS, MAX_DUMMY_INTERVAL_MS),
            enabled: true,
        }
    }

    /// Config that sends nothing.
    pub fn disabled() -> Self {
        Self {
            interval_ms: DEFAULT_DUMMY_INTERVAL_MS,
            enabled: false,
        }
    }

    fn interval(&self) -> Option<Duration> {
        self.enabled.then(|| Duration::from_millis(self.interval_ms))
    }
}

enum Command {
    Configure(DummyTrafficConfig),
    Stop,
}

/// Background dummy traffic sender bound to one multiplexer.
pub struct DummyTraffic {
    channel: std::sync::Arc<ControlChannel>,
    commands: Sender<Command>,
    config: Mutex<DummyTrafficConfig>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DummyTraffic {
    /// Register the dummy control channel and start the timer thread.
    pub fn start(mux: &Multiplexer, config: DummyTrafficConfig) -> Result<Self> {
        let channel = ControlChannel::open(mux, CONTROL_CHANNEL_ID_DUMMY, Box::new(DiscardHandler))?;
        let events = mux.subscribe();
        let (commands, command_rx) = unbounded();

        let worker_channel = std::sync::Arc::clone(&channel);
        let worker = std::thread::Builder::new()
            .name("dummy-traffic".into())
            .spawn(move || run(&worker_channel, &events, &command_rx, config))?;

        info!(enabled = config.enabled, interval_ms = config.interval_ms, "dummy traffic started");
        Ok(Self {
            channel,
            commands,
            config: Mutex::new(config),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Current timing.
    pub fn config(&self) -> DummyTrafficConfig {
        *self.config.lock()
    }

    /// Change the timing; the timer restarts with the new interval.
    pub fn set_config(&self, config: DummyTrafficConfig) {
        *self.config.lock() = config;
        // The worker is gone once the multiplexer closed.
        let _ = self.commands.send(Command::Configure(config));
    }

    /// Stop the timer thread and unregister the channel.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                debug!("dummy traffic thread panicked");
            }
        }
        self.channel.close();
    }
}

impl Drop for DummyTraffic {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    channel: &ControlChannel,
    events: &Receiver<MuxEvent>,
    commands: &Receiver<Command>,
    mut config: DummyTrafficConfig,
) {
    loop {
        let timer = config.interval().map(after).unwrap_or_else(never);
        select! {
            recv(commands) -> command => match command {
                Ok(Command::Configure(next)) => config = next,
                Ok(Command::Stop) | Err(_) => break,
            },
            recv(events) -> event => match event {
                Ok(MuxEvent::Closed) | Err(_) => break,
                Ok(_) => {}
            },
            recv(timer) -> _ => {
                debug!("sending dummy packet");
                match channel.send_raw_message(&[], None) {
                    Ok(()) => {}
                    Err(MuxError::ChannelClosed | MuxError::MultiplexerClosed) => break,
                    Err(e) => debug!(error = %e, "dummy packet not sent"),
                }
            },
        }
    }
    debug!("dummy traffic stopped");
}
