//! Channel registry.
//!
//! Maps channel ids to live channels, allocates random data channel ids
//! outside the control range and caps the number of simultaneously open data
//! channels. Creating a data channel while the cap is reached blocks until a
//! slot frees up or the table closes.
//!
//! Lock order: a channel's own lock may be held while calling into the
//! table, never the other way round. The table therefore notifies channels
//! of a close only after releasing its lock.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::debug;

use crate::channel::{Channel, ChannelMessage, ControlChannel, DataChannel};
use crate::scheduler::{CancelToken, CANCEL_POLL_INTERVAL};
use crate::{is_control_channel_id, MuxError, Result, MAX_CONTROL_CHANNEL_ID};

/// A registered channel.
#[derive(Clone)]
pub enum TableEntry {
    /// Fixed-id control channel.
    Control(Arc<ControlChannel>),
    /// Random-id data channel.
    Data(Arc<DataChannel>),
}

impl TableEntry {
    /// The entry as a [`Channel`].
    pub fn channel(&self) -> &dyn Channel {
        match self {
            TableEntry::Control(channel) => channel.as_ref(),
            TableEntry::Data(channel) => channel.as_ref(),
        }
    }

    /// Whether this is a control channel.
    pub fn is_control(&self) -> bool {
        matches!(self, TableEntry::Control(_))
    }
}

struct TableState {
    channels: HashMap<u32, TableEntry>,
    open_data_channels: usize,
    closed: bool,
}

/// Id-to-channel map with a data channel cap.
pub struct ChannelTable {
    state: Mutex<TableState>,
    slot_freed: Condvar,
    max_data_channels: usize,
}

impl ChannelTable {
    /// Create an open table allowing `max_data_channels` data channels.
    pub fn new(max_data_channels: usize) -> Self {
        Self {
            state: Mutex::new(TableState {
                channels: HashMap::new(),
                open_data_channels: 0,
                closed: false,
            }),
            slot_freed: Condvar::new(),
            max_data_channels: max_data_channels.max(1),
        }
    }

    /// Register a control channel under its fixed id.
    ///
    /// On a closed table the channel is told about the close immediately.
    pub fn register_control_channel(&self, channel: Arc<ControlChannel>) -> Result<()> {
        let id = channel.id();
        if !is_control_channel_id(id) {
            return Err(MuxError::InvalidParameter(format!("{id} is not a control channel id")));
        }
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            channel.multiplexer_closed();
            return Ok(());
        }
        if state.channels.contains_key(&id) {
            return Err(MuxError::InvalidParameter(format!("control channel {id} already registered")));
        }
        state.channels.insert(id, TableEntry::Control(channel));
        Ok(())
    }

    /// Allocate an id and register the data channel `build` creates for it.
    ///
    /// Blocks while the cap is reached; a cancelled `cancel` ends the wait
    /// with [`MuxError::Interrupted`]. On a closed table `build` is called
    /// with id 0 and the channel is returned already notified of the close.
    pub fn create_data_channel<F>(
        &self,
        build: F,
        cancel: Option<&CancelToken>,
    ) -> Result<(Arc<DataChannel>, Receiver<ChannelMessage>)>
    where
        F: FnOnce(u32) -> (Arc<DataChannel>, Receiver<ChannelMessage>),
    {
        let mut state = self.state.lock();
        while !state.closed && state.open_data_channels >= self.max_data_channels {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(MuxError::Interrupted);
            }
            debug!(open = state.open_data_channels, "waiting for a free data channel slot");
            match cancel {
                Some(_) => {
                    self.slot_freed.wait_for(&mut state, CANCEL_POLL_INTERVAL);
                }
                None => self.slot_freed.wait(&mut state),
            }
        }
        if state.closed {
            drop(state);
            let (channel, messages) = build(0);
            channel.multiplexer_closed();
            return Ok((channel, messages));
        }

        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: u32 = rng.gen();
            if candidate > MAX_CONTROL_CHANNEL_ID && !state.channels.contains_key(&candidate) {
                break candidate;
            }
        };
        let (channel, messages) = build(id);
        state.channels.insert(id, TableEntry::Data(Arc::clone(&channel)));
        state.open_data_channels += 1;
        debug!(channel_id = id, open = state.open_data_channels, "data channel registered");
        Ok((channel, messages))
    }

    /// Look up a channel.
    pub fn get_channel(&self, id: u32) -> Option<TableEntry> {
        self.state.lock().channels.get(&id).cloned()
    }

    /// Unregister a channel. Unknown ids and closed tables are ignored.
    pub fn remove_channel(&self, id: u32) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if let Some(TableEntry::Data(_)) = state.channels.remove(&id) {
            state.open_data_channels -= 1;
            drop(state);
            self.slot_freed.notify_all();
        }
    }

    /// Close the table and tell every remaining channel exactly once.
    pub fn close_table(&self) {
        let entries: Vec<TableEntry> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.open_data_channels = 0;
            state.channels.drain().map(|(_, entry)| entry).collect()
        };
        self.slot_freed.notify_all();
        debug!(channels = entries.len(), "channel table closed");
        for entry in entries {
            entry.channel().multiplexer_closed();
        }
    }

    /// Whether [`ChannelTable::close_table`] was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of open data channels.
    pub fn open_data_channels(&self) -> usize {
        self.state.lock().open_data_channels
    }

    /// Number of registered channels of any kind.
    pub fn len(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Whether no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DataChannelMode;
    use crate::cipher::{CipherChain, MixParameters};
    use crate::mux::MuxHandle;
    use cascade_crypto::asym::{AsymDecryptor, AsymScheme};
    use cascade_crypto::keys::generate_rsa_key;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::{Barrier, OnceLock};
    use std::thread;
    use std::time::Duration;

    fn cipher_chain() -> CipherChain {
        let decryptor = AsymDecryptor::new(generate_rsa_key(1024).expect("keygen"), AsymScheme::Plain);
        CipherChain::new(vec![MixParameters::new("mix", decryptor.public_cipher())], None, false).expect("chain")
    }

    fn create_with(
        table: &ChannelTable,
        chain: &CipherChain,
        cancel: Option<&CancelToken>,
    ) -> Result<(Arc<DataChannel>, Receiver<ChannelMessage>)> {
        table.create_data_channel(
            |id| DataChannel::new(id, MuxHandle::detached(), chain.open_channel(), DataChannelMode::Unlimited),
            cancel,
        )
    }

    fn create(table: &ChannelTable, chain: &CipherChain) -> (Arc<DataChannel>, Receiver<ChannelMessage>) {
        create_with(table, chain, None).expect("create")
    }

    /// Key generation dominates; share one chain across proptest cases.
    fn shared_chain() -> &'static CipherChain {
        static CHAIN: OnceLock<CipherChain> = OnceLock::new();
        CHAIN.get_or_init(cipher_chain)
    }

    #[test]
    fn test_data_channel_ids_avoid_control_range() {
        let table = ChannelTable::new(50);
        let chain = cipher_chain();
        for _ in 0..20 {
            let (channel, _) = create(&table, &chain);
            assert!(channel.id() > MAX_CONTROL_CHANNEL_ID);
            assert!(table.get_channel(channel.id()).is_some());
        }
        assert_eq!(table.open_data_channels(), 20);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = ChannelTable::new(50);
        let chain = cipher_chain();
        let (channel, _) = create(&table, &chain);
        table.remove_channel(channel.id());
        table.remove_channel(channel.id());
        table.remove_channel(12345);
        assert_eq!(table.open_data_channels(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_cap_blocks_until_slot_freed() {
        let table = Arc::new(ChannelTable::new(1));
        let chain = Arc::new(cipher_chain());
        let (first, _) = create(&table, &chain);

        let waiter = {
            let table = Arc::clone(&table);
            let chain = Arc::clone(&chain);
            thread::spawn(move || create(&table, &chain).0.id())
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!waiter.is_finished());

        table.remove_channel(first.id());
        let second = waiter.join().expect("join");
        assert_ne!(second, 0);
        assert_eq!(table.open_data_channels(), 1);
    }

    #[test]
    fn test_close_notifies_channels_and_releases_waiters() {
        let table = Arc::new(ChannelTable::new(1));
        let chain = Arc::new(cipher_chain());
        let (_first, messages) = create(&table, &chain);

        let waiter = {
            let table = Arc::clone(&table);
            let chain = Arc::clone(&chain);
            thread::spawn(move || create(&table, &chain))
        };
        thread::sleep(Duration::from_millis(50));
        table.close_table();
        table.close_table();

        let (late, late_messages) = waiter.join().expect("join");
        assert_eq!(late.id(), 0);
        assert!(!late.is_open());
        assert!(matches!(late_messages.try_recv(), Ok(ChannelMessage::ChannelError(_))));

        let received: Vec<_> = messages.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert_eq!(received[1], ChannelMessage::ChannelClosed(None));
        assert!(table.is_empty());
    }

    #[test]
    fn test_cap_wait_is_interruptible() {
        let table = Arc::new(ChannelTable::new(1));
        let chain = Arc::new(cipher_chain());
        let (_first, _) = create(&table, &chain);

        let token = CancelToken::new();
        let waiter = {
            let table = Arc::clone(&table);
            let chain = Arc::clone(&chain);
            let token = token.clone();
            thread::spawn(move || create_with(&table, &chain, Some(&token)).map(|(channel, _)| channel.id()))
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!waiter.is_finished());

        token.cancel();
        assert!(matches!(waiter.join().expect("join"), Err(MuxError::Interrupted)));
        assert_eq!(table.open_data_channels(), 1);
    }

    #[test]
    fn test_racing_closes_notify_once() {
        let chain = cipher_chain();
        for _ in 0..20 {
            let table = Arc::new(ChannelTable::new(4));
            let (channel, messages) = create(&table, &chain);
            let id = channel.id();
            let barrier = Arc::new(Barrier::new(4));

            let mut handles = Vec::new();
            for _ in 0..2 {
                let channel = Arc::clone(&channel);
                let barrier = Arc::clone(&barrier);
                handles.push(thread::spawn(move || {
                    barrier.wait();
                    channel.organize_close();
                }));
            }
            {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                handles.push(thread::spawn(move || {
                    barrier.wait();
                    table.remove_channel(id);
                }));
            }
            {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                handles.push(thread::spawn(move || {
                    barrier.wait();
                    table.close_table();
                }));
            }
            for handle in handles {
                handle.join().expect("join");
            }

            let closes = messages
                .try_iter()
                .filter(|m| matches!(m, ChannelMessage::ChannelClosed(_)))
                .count();
            assert_eq!(closes, 1, "channel {id} reported its close {closes} times");
            assert!(!channel.is_open());
            assert_eq!(table.open_data_channels(), 0);
            assert!(table.is_empty());
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_ids_stay_unique_across_create_and_close(
            ops in prop::collection::vec((any::<bool>(), any::<prop::sample::Index>()), 1..80)
        ) {
            let table = ChannelTable::new(1_000);
            let chain = shared_chain();
            let mut live: Vec<u32> = Vec::new();
            for (create_next, pick) in ops {
                if create_next || live.is_empty() {
                    let (channel, _) = create(&table, chain);
                    let id = channel.id();
                    prop_assert!(id > MAX_CONTROL_CHANNEL_ID, "id {} in control range", id);
                    prop_assert!(!live.contains(&id), "id {} handed out twice", id);
                    live.push(id);
                } else {
                    let id = live.swap_remove(pick.index(live.len()));
                    table.remove_channel(id);
                }
                let unique: HashSet<u32> = live.iter().copied().collect();
                prop_assert_eq!(unique.len(), live.len());
                prop_assert_eq!(table.open_data_channels(), live.len());
            }
        }
    }
}
