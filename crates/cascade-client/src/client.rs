//! The client facade.
//!
//! [`AnonClient`] owns at most one cascade session: the multiplexer, the
//! dummy traffic controller and a watcher thread that notices when the
//! connection drops. Data chains and control channels are opened on the
//! current session.
//!
//! ```text
//! initialize ──> connect ──> login ──(terms interrupt, accepted)──> login again
//!                                │
//!                                └──> Multiplexer + DummyTraffic + watcher
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use cascade_mux::chain::ConnectionErrorHook;
use cascade_mux::channel::{ControlChannel, ControlMessageHandler, DummyTraffic, DummyTrafficConfig};
use cascade_mux::{CancelToken, ChainProtocol, DataChain, MuxEvent, MuxSetup, Multiplexer, PacketCounter};
use cascade_wire::connection::{StreamConnection, TcpConnection};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cascade::{CascadeDescriptor, CascadeTarget, DescriptorCodec, TermsConfirmation, TermsContainer, TrustModel};
use crate::config::ClientConfig;
use crate::handshake::{HandshakeOutcome, KeyExchangeManager};
use crate::{ClientError, Result};

/// Opens the physical connection to a cascade's first mix.
pub trait Connector: Send + Sync {
    /// Connect within `timeout`.
    fn connect(&self, target: &CascadeTarget, timeout: Duration) -> Result<Arc<dyn StreamConnection>>;
}

/// Plain TCP to the first reachable listener address.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, target: &CascadeTarget, timeout: Duration) -> Result<Arc<dyn StreamConnection>> {
        let mut last_error = None;
        for address in &target.addresses {
            match TcpConnection::connect(address, timeout) {
                Ok(connection) => return Ok(Arc::new(connection)),
                Err(e) => {
                    debug!(%address, error = %e, "listener unreachable");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e.into()),
            None => Err(ClientError::Config(format!("cascade {} has no listener address", target.id))),
        }
    }
}

/// Client state changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// Login finished; channels can be opened.
    ConnectionEstablished { cascade_id: String },
    /// The connection dropped without a shutdown.
    ConnectionLost,
    /// The last mix reported a failed connection on one of the chains.
    ChainConnectionError,
    /// [`AnonClient::shutdown`] closed the session.
    Disconnected,
}

struct Session {
    generation: u64,
    mux: Multiplexer,
    dummy: DummyTraffic,
    /// Parent of every chain's cancel token.
    cancel: CancelToken,
    cascade: CascadeDescriptor,
    chain_protocol: ChainProtocol,
    payment_required: bool,
}

impl Session {
    fn close(self) {
        self.cancel.cancel();
        self.dummy.stop();
        self.mux.close();
        debug!(generation = self.generation, "session closed");
    }
}

#[derive(Default)]
struct ClientState {
    session: Option<Session>,
    target: Option<CascadeTarget>,
    confirmation: Option<Arc<dyn TermsConfirmation>>,
    generation: u64,
    shutting_down: bool,
}

struct ClientInner {
    config: ClientConfig,
    connector: Box<dyn Connector>,
    codec: Arc<dyn DescriptorCodec>,
    trust: Arc<dyn TrustModel>,
    terms: Option<Arc<dyn TermsContainer>>,
    state: Mutex<ClientState>,
    /// Serializes logins.
    connecting: Mutex<()>,
    /// Connection of a login in progress, closed by a shutdown.
    login: Mutex<Option<Arc<dyn StreamConnection>>>,
    dummy_config: Mutex<DummyTrafficConfig>,
    counter: Arc<PacketCounter>,
    subscribers: Mutex<Vec<Sender<ClientEvent>>>,
}

/// Builder for [`AnonClient`].
pub struct ClientBuilder {
    config: ClientConfig,
    codec: Arc<dyn DescriptorCodec>,
    trust: Arc<dyn TrustModel>,
    connector: Box<dyn Connector>,
    terms: Option<Arc<dyn TermsContainer>>,
}

impl ClientBuilder {
    /// Replace the default [`TcpConnector`].
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Box::new(connector);
        self
    }

    /// Terms store for cascades that require terms confirmation.
    pub fn terms(mut self, container: Arc<dyn TermsContainer>) -> Self {
        self.terms = Some(container);
        self
    }

    pub fn build(self) -> AnonClient {
        let dummy_config = self.config.dummy_traffic();
        AnonClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                connector: self.connector,
                codec: self.codec,
                trust: self.trust,
                terms: self.terms,
                state: Mutex::new(ClientState::default()),
                connecting: Mutex::new(()),
                login: Mutex::new(None),
                dummy_config: Mutex::new(dummy_config),
                counter: Arc::new(PacketCounter::new()),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// Client of one mix cascade.
pub struct AnonClient {
    inner: Arc<ClientInner>,
}

impl AnonClient {
    /// Start building a client.
    pub fn builder(
        config: ClientConfig,
        codec: Arc<dyn DescriptorCodec>,
        trust: Arc<dyn TrustModel>,
    ) -> ClientBuilder {
        ClientBuilder {
            config,
            codec,
            trust,
            connector: Box::new(TcpConnector),
            terms: None,
        }
    }

    /// Connect to `target` and log in.
    ///
    /// If the cascade interrupts the login for terms and conditions,
    /// `confirmation` is asked once; on acceptance the login is repeated
    /// exactly once and a second interrupt is returned as an error.
    pub fn initialize(
        &self,
        target: CascadeTarget,
        confirmation: Option<Arc<dyn TermsConfirmation>>,
    ) -> Result<()> {
        self.inner.initialize(target, confirmation)
    }

    /// Open a data chain of `chain_type` on the current session.
    ///
    /// Blocks while the data channel cap is reached. Closing the session
    /// interrupts the wait and every write still blocked on its chains.
    pub fn create_channel(&self, chain_type: u8) -> Result<DataChain> {
        let (mux, protocol, cancel) = {
            let state = self.inner.state.lock();
            let session = state.session.as_ref().ok_or(ClientError::NotConnected)?;
            (session.mux.clone(), session.chain_protocol, session.cancel.clone())
        };
        let client = Arc::downgrade(&self.inner);
        let hook: ConnectionErrorHook = Arc::new(move || {
            if let Some(inner) = client.upgrade() {
                inner.emit(ClientEvent::ChainConnectionError);
            }
        });
        Ok(DataChain::open(&mux, protocol, chain_type, Some(hook), Some(&cancel))?)
    }

    /// Register a control channel for a replay or payment collaborator.
    pub fn open_control_channel(
        &self,
        id: u32,
        handler: Box<dyn ControlMessageHandler>,
    ) -> Result<Arc<ControlChannel>> {
        let mux = self.multiplexer().ok_or(ClientError::NotConnected)?;
        Ok(ControlChannel::open(&mux, id, handler)?)
    }

    /// Close the session and abort a login in progress. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Drop the current session and log in to the last target again.
    pub fn reconnect(&self) -> Result<()> {
        self.inner.reconnect()
    }

    /// Change dummy traffic timing, now and for later sessions.
    pub fn set_dummy_traffic(&self, config: DummyTrafficConfig) {
        *self.inner.dummy_config.lock() = config;
        if let Some(session) = &self.inner.state.lock().session {
            session.dummy.set_config(config);
        }
    }

    /// Current dummy traffic timing.
    pub fn dummy_traffic(&self) -> DummyTrafficConfig {
        *self.inner.dummy_config.lock()
    }

    /// Packets sent and received over all sessions.
    pub fn mixed_packets(&self) -> u64 {
        self.inner.counter.mixed_packets()
    }

    /// Subscribe to client events.
    pub fn subscribe(&self) -> Receiver<ClientEvent> {
        let (tx, rx) = unbounded();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().session.is_some()
    }

    /// Descriptor of the connected cascade.
    pub fn cascade(&self) -> Option<CascadeDescriptor> {
        self.inner.state.lock().session.as_ref().map(|s| s.cascade.clone())
    }

    /// Chain protocol of the connected cascade.
    pub fn chain_protocol(&self) -> Option<ChainProtocol> {
        self.inner.state.lock().session.as_ref().map(|s| s.chain_protocol)
    }

    /// Whether the connected cascade charges for traffic.
    pub fn payment_required(&self) -> bool {
        self.inner
            .state
            .lock()
            .session
            .as_ref()
            .is_some_and(|s| s.payment_required)
    }

    /// Multiplexer of the current session.
    pub fn multiplexer(&self) -> Option<Multiplexer> {
        self.inner.state.lock().session.as_ref().map(|s| s.mux.clone())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl Drop for AnonClient {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl ClientInner {
    fn emit(&self, event: ClientEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn initialize(
        self: &Arc<Self>,
        target: CascadeTarget,
        confirmation: Option<Arc<dyn TermsConfirmation>>,
    ) -> Result<()> {
        let _connecting = self.connecting.lock();
        {
            let mut state = self.state.lock();
            if state.session.is_some() {
                return Err(ClientError::AlreadyConnected);
            }
            state.shutting_down = false;
            state.target = Some(target.clone());
            state.confirmation = confirmation.clone();
        }

        let (connection, outcome) = match self.login(&target) {
            Err(ClientError::TermsInterrupt { pending }) => {
                let Some(confirmation) = confirmation else {
                    return Err(ClientError::TermsInterrupt { pending });
                };
                if !confirmation.confirm(&pending) {
                    info!(cascade = %target.id, "terms and conditions rejected");
                    return Err(ClientError::TermsRejected);
                }
                info!(cascade = %target.id, "terms and conditions accepted, logging in again");
                self.login(&target)?
            }
            result => result?,
        };
        self.start_session(connection, outcome)
    }

    /// Connect and run the key exchange. The connection is closed on failure.
    fn login(&self, target: &CascadeTarget) -> Result<(Arc<dyn StreamConnection>, HandshakeOutcome)> {
        let timeout = self.config.login_timeout();
        debug!(cascade = %target.id, ?timeout, "connecting");
        let connection = self.connector.connect(target, timeout)?;
        *self.login.lock() = Some(Arc::clone(&connection));

        let result = if self.state.lock().shutting_down {
            Err(ClientError::Interrupted)
        } else {
            self.handshake(connection.as_ref(), timeout)
        };
        self.login.lock().take();

        match result {
            Ok(outcome) => Ok((connection, outcome)),
            Err(e) => {
                let _ = connection.close();
                if self.state.lock().shutting_down {
                    return Err(ClientError::Interrupted);
                }
                warn!(cascade = %target.id, error = %e, "login failed");
                Err(e)
            }
        }
    }

    fn handshake(&self, connection: &dyn StreamConnection, timeout: Duration) -> Result<HandshakeOutcome> {
        connection.set_timeout(Some(timeout))?;
        let (mut reader, mut writer) = connection.split()?;
        let mut manager = KeyExchangeManager::new(self.codec.as_ref(), self.trust.as_ref());
        if let Some(terms) = &self.terms {
            manager = manager.with_terms(terms.as_ref());
        }
        let outcome = manager.run(&mut reader, &mut writer)?;
        connection.set_timeout(None)?;
        Ok(outcome)
    }

    fn start_session(self: &Arc<Self>, connection: Arc<dyn StreamConnection>, outcome: HandshakeOutcome) -> Result<()> {
        let HandshakeOutcome {
            cascade,
            chain_protocol,
            cipher_chain,
            input_link,
            output_link,
            payment_required,
            ..
        } = outcome;
        let setup = MuxSetup::new(cipher_chain)
            .with_link_ciphers(input_link, output_link)
            .with_max_data_channels(self.config.connection.max_data_channels);
        let mux = Multiplexer::start(connection, setup)?;

        if let Err(e) = self.counter.watch(mux.subscribe()) {
            mux.close();
            return Err(e.into());
        }
        let dummy = match DummyTraffic::start(&mux, *self.dummy_config.lock()) {
            Ok(dummy) => dummy,
            Err(e) => {
                mux.close();
                return Err(e.into());
            }
        };
        let events = mux.subscribe();

        let session = Session {
            generation: 0,
            mux: mux.clone(),
            dummy,
            cancel: CancelToken::new(),
            cascade,
            chain_protocol,
            payment_required,
        };
        let cascade_id = session.cascade.id.clone();
        let generation = {
            let mut state = self.state.lock();
            if state.shutting_down {
                drop(state);
                session.close();
                return Err(ClientError::Interrupted);
            }
            state.generation += 1;
            let generation = state.generation;
            state.session = Some(Session { generation, ..session });
            generation
        };

        let client = Arc::downgrade(self);
        let spawned = std::thread::Builder::new()
            .name("connection-watcher".into())
            .spawn(move || watch_connection(&client, generation, &mux, &events));
        if let Err(e) = spawned {
            self.disconnect();
            return Err(e.into());
        }

        info!(cascade = %cascade_id, ?chain_protocol, "connected to cascade");
        self.emit(ClientEvent::ConnectionEstablished { cascade_id });
        Ok(())
    }

    /// Close and forget the current session.
    fn disconnect(&self) -> bool {
        let session = self.state.lock().session.take();
        match session {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        if let Some(connection) = self.login.lock().take() {
            debug!("aborting login");
            let _ = connection.close();
        }
        if self.disconnect() {
            info!("client shut down");
            self.emit(ClientEvent::Disconnected);
        }
    }

    fn reconnect(self: &Arc<Self>) -> Result<()> {
        let (target, confirmation) = {
            let state = self.state.lock();
            let target = state.target.clone().ok_or(ClientError::NotConnected)?;
            (target, state.confirmation.clone())
        };
        self.disconnect();
        info!(cascade = %target.id, "reconnecting");
        self.initialize(target, confirmation)
    }

    fn connection_lost(self: &Arc<Self>, generation: u64) {
        let session = {
            let mut state = self.state.lock();
            match &state.session {
                Some(session) if session.generation == generation => state.session.take(),
                _ => None,
            }
        };
        let Some(session) = session else {
            return;
        };
        session.close();
        warn!("connection to cascade lost");
        self.emit(ClientEvent::ConnectionLost);

        if self.config.connection.auto_reconnect {
            if let Err(e) = self.reconnect() {
                warn!(error = %e, "reconnect failed");
            }
        }
    }
}

fn watch_connection(client: &Weak<ClientInner>, generation: u64, mux: &Multiplexer, events: &Receiver<MuxEvent>) {
    if !mux.is_closed() {
        for event in events {
            if event == MuxEvent::Closed {
                break;
            }
        }
    }
    if let Some(inner) = client.upgrade() {
        inner.connection_lost(generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::{KeyConfirmation, KeyExchange, TermsAnswer, TermsResource};
    use cascade_crypto::asym::AsymCipher;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoCodec;

    impl DescriptorCodec for NoCodec {
        fn decode_cascade(&self, _: &[u8]) -> Result<CascadeDescriptor> {
            Err(ClientError::Protocol("no codec".into()))
        }

        fn encode_key_exchange(&self, _: &KeyExchange, _: &AsymCipher) -> Result<Vec<u8>> {
            Err(ClientError::Protocol("no codec".into()))
        }

        fn decode_key_confirmation(&self, _: &[u8]) -> Result<KeyConfirmation> {
            Err(ClientError::Protocol("no codec".into()))
        }

        fn encode_terms_request(&self, _: &[TermsResource]) -> Result<Vec<u8>> {
            Err(ClientError::Protocol("no codec".into()))
        }

        fn encode_terms_answer(&self, _: TermsAnswer) -> Result<Vec<u8>> {
            Err(ClientError::Protocol("no codec".into()))
        }
    }

    struct TrustAll;

    impl TrustModel for TrustAll {
        fn check_trust(&self, _: &CascadeDescriptor) -> Result<()> {
            Ok(())
        }

        fn verify_key_signature(&self, _: &CascadeDescriptor, _: &KeyExchange, _: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    struct RefusingConnector {
        attempts: Arc<AtomicUsize>,
    }

    impl Connector for RefusingConnector {
        fn connect(&self, _: &CascadeTarget, _: Duration) -> Result<Arc<dyn StreamConnection>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into())
        }
    }

    fn client(attempts: &Arc<AtomicUsize>) -> AnonClient {
        AnonClient::builder(ClientConfig::default(), Arc::new(NoCodec), Arc::new(TrustAll))
            .connector(RefusingConnector {
                attempts: Arc::clone(attempts),
            })
            .build()
    }

    fn target() -> CascadeTarget {
        CascadeTarget::new("cascade", SocketAddr::from(([127, 0, 0, 1], 1)))
    }

    #[test]
    fn test_create_channel_requires_connection() {
        let client = client(&Arc::new(AtomicUsize::new(0)));
        assert!(matches!(client.create_channel(0), Err(ClientError::NotConnected)));
        assert!(matches!(
            client.open_control_channel(3, Box::new(cascade_mux::channel::DiscardHandler)),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn test_failed_connect_leaves_client_disconnected() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let client = client(&attempts);
        let result = client.initialize(target(), None);
        assert!(matches!(result, Err(ClientError::Io(_))));
        assert!(!client.is_connected());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(client.mixed_packets(), 0);
    }

    #[test]
    fn test_reconnect_without_target() {
        let client = client(&Arc::new(AtomicUsize::new(0)));
        assert!(matches!(client.reconnect(), Err(ClientError::NotConnected)));
    }

    #[test]
    fn test_reconnect_uses_last_target() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let client = client(&attempts);
        assert!(client.initialize(target(), None).is_err());
        assert!(client.reconnect().is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let client = client(&Arc::new(AtomicUsize::new(0)));
        let events = client.subscribe();
        client.shutdown();
        client.shutdown();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_dummy_traffic_setting_survives_without_session() {
        let client = client(&Arc::new(AtomicUsize::new(0)));
        assert_eq!(client.dummy_traffic(), DummyTrafficConfig::default());
        client.set_dummy_traffic(DummyTrafficConfig::new(1_000));
        assert_eq!(client.dummy_traffic().interval_ms, 1_000);
    }

    #[test]
    fn test_tcp_connector_without_addresses() {
        let target = CascadeTarget {
            id: "empty".into(),
            addresses: Vec::new(),
        };
        let result = TcpConnector.connect(&target, Duration::from_secs(1));
        assert!(matches!(result, Err(ClientError::Config(_))));
    }
}
