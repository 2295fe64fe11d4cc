//! # cascade-integration-tests
//!
//! End-to-end tests of the client against a cascade simulated on loopback
//! sockets. The tests live in `tests/`; this library holds the harness they
//! share.
//!
//! ## Harness
//!
//! - [`JsonCodec`] — login documents as JSON, the key exchange RSA-encrypted
//!   block by block for the first mix
//! - [`SharedSecretTrust`] — trusts every cascade except a deny list and
//!   checks SHA-1 key signatures keyed with a shared secret
//! - [`MemoryTerms`] / [`ScriptedUser`] — terms container and a user that
//!   answers terms prompts from a script
//! - [`FakeCascade`] — a single mix: runs the login, strips the onion layer
//!   and echoes every data cell back downstream; on fixed-ratio cascades it
//!   answers every channel with a fixed number of packets
//! - [`PresetConnector`] — hands out prepared loopback connections

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cascade_client::cascade::{
    ChainProtocolInfo, KeyConfirmation, KeyExchange, MixTermsInfo, PublicKeyInfo, TermsAnswer, TermsResource,
    TermsState,
};
use cascade_client::config::ClientConfig;
use cascade_client::{
    AnonClient, CascadeDescriptor, CascadeTarget, ChannelProtocol, ClientError, Connector, DescriptorCodec,
    MixDescriptor, PendingTerms, TermsConfirmation, TermsContainer, TrustModel,
};
use cascade_crypto::asym::{AsymCipher, AsymDecryptor, AsymScheme};
use cascade_crypto::keys::generate_rsa_key;
use cascade_crypto::sym::{SymCipher, KEY_SIZE, KEY_WITH_IV_SIZE};
use cascade_mux::channel::data::{FLAG_CHANNEL_CLOSE, FLAG_CHANNEL_OPEN};
use cascade_mux::is_control_channel_id;
use cascade_wire::cell::{
    ChainCell, SequentialCell, CHAIN_ID_LENGTH, SEQ_FLAG_NEW_CHAIN, SEQ_FLAG_STREAM_CLOSED,
};
use cascade_wire::connection::{loopback_pair, ReadHalf, StreamConnection, TcpConnection, WriteHalf};
use cascade_wire::frame::{read_frame, write_frame, write_long_frame};
use cascade_wire::packet::{MixPacket, PAYLOAD_SIZE};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, info};

/// Secret the fake cascade signs key exchanges with.
pub const CASCADE_SECRET: &[u8] = b"loopback cascade secret";

/// Operator of the fake mix.
pub const OPERATOR: &str = "loopback-operator";

/// How long tests wait for something to arrive.
pub const WAIT: Duration = Duration::from_secs(10);

/// How long the fake mix holds a keep-alive channel before answering it.
const KEEP_ALIVE_DELAY: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct KeyExchangeDocument {
    link_keys: String,
    mix_keys: String,
    replay_detection: bool,
}

/// Answer carried by a [`TermsMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TermsAnswerKind {
    Confirm,
    Interrupt,
}

/// Terms message sent by the client after the key exchange.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TermsMessage {
    Resources { resources: Vec<TermsResource> },
    Answer { answer: TermsAnswerKind },
}

/// JSON login documents.
pub struct JsonCodec;

fn json_error(what: &str, e: serde_json::Error) -> ClientError {
    ClientError::Protocol(format!("{what}: {e}"))
}

impl DescriptorCodec for JsonCodec {
    fn decode_cascade(&self, data: &[u8]) -> cascade_client::Result<CascadeDescriptor> {
        serde_json::from_slice(data).map_err(|e| json_error("cascade descriptor", e))
    }

    fn encode_key_exchange(&self, exchange: &KeyExchange, first_mix: &AsymCipher) -> cascade_client::Result<Vec<u8>> {
        let document = KeyExchangeDocument {
            link_keys: STANDARD.encode(&exchange.link_keys[..]),
            mix_keys: STANDARD.encode(&exchange.mix_keys[..]),
            replay_detection: exchange.replay_detection,
        };
        let mut plain = serde_json::to_vec(&document).map_err(|e| json_error("key exchange", e))?;
        // Trailing blanks fill the last block; JSON ignores them.
        let block = first_mix.input_block_size();
        plain.resize(plain.len().div_ceil(block) * block, b' ');

        let mut encrypted = Vec::with_capacity(plain.len() / block * first_mix.output_block_size());
        for chunk in plain.chunks(block) {
            encrypted.extend_from_slice(&first_mix.encrypt_block(chunk)?);
        }
        Ok(encrypted)
    }

    fn decode_key_confirmation(&self, data: &[u8]) -> cascade_client::Result<KeyConfirmation> {
        serde_json::from_slice(data).map_err(|e| json_error("key confirmation", e))
    }

    fn encode_terms_request(&self, resources: &[TermsResource]) -> cascade_client::Result<Vec<u8>> {
        let message = TermsMessage::Resources {
            resources: resources.to_vec(),
        };
        serde_json::to_vec(&message).map_err(|e| json_error("terms request", e))
    }

    fn encode_terms_answer(&self, answer: TermsAnswer) -> cascade_client::Result<Vec<u8>> {
        let answer = match answer {
            TermsAnswer::Confirm => TermsAnswerKind::Confirm,
            TermsAnswer::Interrupt => TermsAnswerKind::Interrupt,
        };
        serde_json::to_vec(&TermsMessage::Answer { answer }).map_err(|e| json_error("terms answer", e))
    }
}

/// Keys recovered by the first mix from a key exchange.
pub struct ReceivedKeys {
    pub link_keys: Vec<u8>,
    pub mix_keys: Vec<u8>,
    pub replay_detection: bool,
}

/// Undo [`JsonCodec::encode_key_exchange`] with the first mix's private key.
pub fn decrypt_key_exchange(decryptor: &AsymDecryptor, data: &[u8]) -> anyhow::Result<ReceivedKeys> {
    let block = decryptor.output_block_size();
    if data.is_empty() || data.len() % block != 0 {
        bail!("key exchange of {} bytes is not a whole number of blocks", data.len());
    }
    let mut plain = Vec::with_capacity(data.len());
    for chunk in data.chunks(block) {
        plain.extend_from_slice(&decryptor.decrypt_block(chunk)?);
    }
    let document: KeyExchangeDocument = serde_json::from_slice(&plain).context("key exchange document")?;
    Ok(ReceivedKeys {
        link_keys: STANDARD.decode(document.link_keys)?,
        mix_keys: STANDARD.decode(document.mix_keys)?,
        replay_detection: document.replay_detection,
    })
}

// ---------------------------------------------------------------------------
// Trust
// ---------------------------------------------------------------------------

/// Signature the cascade puts on a key exchange.
pub fn sign_exchange(secret: &[u8], link_keys: &[u8], mix_keys: &[u8]) -> Vec<u8> {
    Sha1::new()
        .chain_update(secret)
        .chain_update(link_keys)
        .chain_update(mix_keys)
        .finalize()
        .to_vec()
}

/// Trust model keyed with a secret shared with the fake cascade.
pub struct SharedSecretTrust {
    secret: Vec<u8>,
    distrusted: HashSet<String>,
}

impl SharedSecretTrust {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
            distrusted: HashSet::new(),
        }
    }

    /// Refuse the cascade with `id`.
    pub fn distrust(mut self, id: impl Into<String>) -> Self {
        self.distrusted.insert(id.into());
        self
    }
}

impl TrustModel for SharedSecretTrust {
    fn check_trust(&self, cascade: &CascadeDescriptor) -> cascade_client::Result<()> {
        if self.distrusted.contains(&cascade.id) {
            return Err(ClientError::Trust(format!("cascade {} is not trusted", cascade.id)));
        }
        Ok(())
    }

    fn verify_key_signature(
        &self,
        _cascade: &CascadeDescriptor,
        exchange: &KeyExchange,
        signature: &[u8],
    ) -> cascade_client::Result<()> {
        let expected = sign_exchange(&self.secret, &exchange.link_keys, &exchange.mix_keys);
        if expected != signature {
            return Err(ClientError::Signature("key exchange signature mismatch".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Terms
// ---------------------------------------------------------------------------

/// In-memory terms container.
#[derive(Default)]
pub struct MemoryTerms {
    accepted: Mutex<HashSet<(String, String)>>,
    loaded: Mutex<HashSet<String>>,
}

impl MemoryTerms {
    /// Record that `operator`'s terms of `date` were accepted.
    pub fn accept(&self, operator: &str, date: &str) {
        self.accepted.lock().insert((operator.to_string(), date.to_string()));
    }

    /// Whether resources for `operator` were received from the cascade.
    pub fn has_resources(&self, operator: &str) -> bool {
        self.loaded.lock().contains(operator)
    }
}

impl TermsContainer for MemoryTerms {
    fn state(&self, operator: &str, terms: &MixTermsInfo) -> TermsState {
        if self.accepted.lock().contains(&(operator.to_string(), terms.date.clone())) {
            TermsState::Accepted
        } else {
            TermsState::Outdated
        }
    }

    fn missing_resources(&self, operator: &str, terms: &MixTermsInfo) -> Vec<TermsResource> {
        if self.has_resources(operator) {
            return Vec::new();
        }
        let language = terms.default_language.clone();
        let template_id = terms.templates.get(&language).cloned().unwrap_or_default();
        vec![
            TermsResource::Template {
                operator: operator.to_string(),
                language: language.clone(),
                template_id,
            },
            TermsResource::CustomizedSections {
                operator: operator.to_string(),
                language,
            },
        ]
    }

    fn handle_resource_response(&self, response: &[u8]) -> cascade_client::Result<()> {
        let operators: Vec<String> =
            serde_json::from_slice(response).map_err(|e| json_error("terms resources", e))?;
        self.loaded.lock().extend(operators);
        Ok(())
    }
}

/// A user answering terms prompts from a script.
pub struct ScriptedUser {
    answer: bool,
    record: Option<Arc<MemoryTerms>>,
    prompts: AtomicUsize,
}

impl ScriptedUser {
    /// Accepts and records the acceptance in `terms`.
    pub fn accepting(terms: Arc<MemoryTerms>) -> Self {
        Self {
            answer: true,
            record: Some(terms),
            prompts: AtomicUsize::new(0),
        }
    }

    /// Claims to accept but never records it.
    pub fn forgetful() -> Self {
        Self {
            answer: true,
            record: None,
            prompts: AtomicUsize::new(0),
        }
    }

    /// Declines every prompt.
    pub fn declining() -> Self {
        Self {
            answer: false,
            record: None,
            prompts: AtomicUsize::new(0),
        }
    }

    /// How often the user was asked.
    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

impl TermsConfirmation for ScriptedUser {
    fn confirm(&self, pending: &[PendingTerms]) -> bool {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if self.answer {
            if let Some(terms) = &self.record {
                for item in pending {
                    terms.accept(&item.operator, &item.date);
                }
            }
        }
        self.answer
    }
}

// ---------------------------------------------------------------------------
// Fake cascade
// ---------------------------------------------------------------------------

/// RSA key of the fake mix, generated once per test binary.
fn mix_key() -> anyhow::Result<RsaPrivateKey> {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    if let Some(key) = KEY.get() {
        return Ok(key.clone());
    }
    let key = generate_rsa_key(1024)?;
    Ok(KEY.get_or_init(|| key).clone())
}

/// What the fake mix observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MixEvent {
    /// The client's key exchange was decrypted.
    KeysReceived,
    /// The client requested terms resources.
    TermsResourcesRequested(usize),
    /// The client's final terms message.
    TermsAnswered(TermsAnswerKind),
    /// An upstream data cell after layer removal.
    Cell { channel_id: u32, cell: ChainCell },
    /// An upstream cell of a fixed-ratio chain after layer removal.
    SequentialCell { channel_id: u32, cell: SequentialCell },
    /// The client closed a data channel.
    ChannelClosed(u32),
    /// The connection ended.
    Disconnected,
}

/// How the fake mix answers channels of a fixed-ratio chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DownstreamFault {
    /// Exactly the announced number of packets, the last one closing.
    #[default]
    None,
    /// One data packet more than announced.
    ExtraPacket,
    /// One data packet less than announced.
    MissingPacket,
    /// No answer at all.
    Silent,
}

/// A one-mix cascade speaking the login and the multiplexing protocol.
#[derive(Clone)]
pub struct FakeCascade {
    descriptor: CascadeDescriptor,
    scheme: AsymScheme,
    enhanced: bool,
    fault: DownstreamFault,
}

impl FakeCascade {
    /// Cascade speaking channel protocol `version` and chain protocol 0.3.
    pub fn new(version: &str) -> anyhow::Result<Self> {
        let protocol = version.parse::<ChannelProtocol>().ok();
        let scheme = protocol.map_or(AsymScheme::Plain, ChannelProtocol::asym_scheme);
        let key = mix_key()?;
        let descriptor = CascadeDescriptor {
            id: "loopback-cascade".into(),
            name: "Loopback".into(),
            mix_protocol_version: version.into(),
            mixes: vec![MixDescriptor {
                id: "loopback-mix".into(),
                name: "Loopback mix".into(),
                operator: OPERATOR.into(),
                verified: true,
                public_key: PublicKeyInfo {
                    modulus: key.n().to_bytes_be(),
                    exponent: key.e().to_bytes_be(),
                },
                chain_protocol: Some(ChainProtocolInfo {
                    version: "0.3".into(),
                    ..ChainProtocolInfo::default()
                }),
                terms: None,
            }],
            ..CascadeDescriptor::default()
        };
        Ok(Self {
            descriptor,
            scheme,
            enhanced: protocol.is_some_and(ChannelProtocol::enhanced_encryption),
            fault: DownstreamFault::None,
        })
    }

    /// Announce `info` as the chain protocol of the last mix.
    pub fn with_chain_protocol(mut self, info: ChainProtocolInfo) -> Self {
        if let Some(last) = self.descriptor.mixes.last_mut() {
            last.chain_protocol = Some(info);
        }
        self
    }

    /// Misbehave when answering fixed-ratio channels.
    pub fn with_downstream_fault(mut self, fault: DownstreamFault) -> Self {
        self.fault = fault;
        self
    }

    /// Downstream packets per channel when the cascade speaks chain
    /// protocol 0.5.
    fn fixed_ratio_packets(&self) -> Option<u32> {
        let info = self.descriptor.mixes.last()?.chain_protocol.as_ref()?;
        if info.version != "0.5" {
            return None;
        }
        info.downstream_packets.and_then(|n| u32::try_from(n).ok())
    }

    /// Require confirmation of terms dated `date`.
    pub fn with_terms(mut self, date: &str) -> Self {
        self.descriptor.terms_required = true;
        for mix in &mut self.descriptor.mixes {
            mix.terms = Some(MixTermsInfo {
                date: date.into(),
                default_language: "en".into(),
                templates: [("en".to_string(), "template-en".to_string())].into_iter().collect(),
            });
        }
        self
    }

    /// The descriptor sent to clients.
    pub fn descriptor(&self) -> &CascadeDescriptor {
        &self.descriptor
    }

    /// Target naming this cascade. The address is never dialed.
    pub fn target(&self) -> CascadeTarget {
        CascadeTarget::new(self.descriptor.id.clone(), SocketAddr::from(([127, 0, 0, 1], 9)))
    }

    /// Create a loopback connection and serve it; returns the client side.
    pub fn serve(&self) -> anyhow::Result<(TcpConnection, MixSession)> {
        let (client, remote) = loopback_pair()?;
        let session = self.spawn(remote)?;
        Ok((client, session))
    }

    /// Serve `connection` on a new thread.
    pub fn spawn(&self, connection: TcpConnection) -> anyhow::Result<MixSession> {
        let connection = Arc::new(connection);
        let (reader, writer) = connection.split()?;
        let (events_tx, events) = unbounded();
        let downlink = Arc::new(Mutex::new(Downlink {
            writer,
            link: None,
            channels: HashMap::new(),
        }));

        let mix = MixThread {
            cascade: self.clone(),
            decryptor: AsymDecryptor::new(mix_key()?, self.scheme),
            downlink: Arc::clone(&downlink),
            events: events_tx,
        };
        let thread = thread::Builder::new()
            .name("fake-mix".into())
            .spawn(move || mix.run(reader))?;

        Ok(MixSession {
            connection,
            downlink,
            events,
            thread: Some(thread),
        })
    }
}

struct Downlink {
    writer: WriteHalf,
    link: Option<SymCipher>,
    channels: HashMap<u32, SymCipher>,
}

impl Downlink {
    /// Send `data` downstream on `channel_id`.
    fn send(&mut self, channel_id: u32, flags: u16, data: &[u8]) -> anyhow::Result<()> {
        let cell = ChainCell {
            flags: 0,
            chain_type: 0,
            data: data.to_vec(),
        };
        self.send_chain_cell(channel_id, flags, &cell)
    }

    fn send_chain_cell(&mut self, channel_id: u32, flags: u16, cell: &ChainCell) -> anyhow::Result<()> {
        let mut payload = vec![0u8; PAYLOAD_SIZE];
        cell.encode_into(&mut payload)?;
        self.send_payload(channel_id, flags, payload)
    }

    /// Unknown channels get the payload unencrypted.
    fn send_payload(&mut self, channel_id: u32, flags: u16, mut payload: Vec<u8>) -> anyhow::Result<()> {
        if let Some(cipher) = self.channels.get_mut(&channel_id) {
            cipher.apply_downstream(&mut payload);
        }
        let mut packet = MixPacket::new(channel_id);
        packet.set_flags(flags);
        packet.payload_mut().copy_from_slice(&payload);
        packet.write_to(self.writer.as_mut(), self.link.as_mut())?;
        Ok(())
    }

    /// Write `replies` on a fixed-ratio channel and forget the channel.
    fn answer(&mut self, channel_id: u32, replies: Vec<(u16, Vec<u8>)>) -> anyhow::Result<()> {
        let result = replies
            .into_iter()
            .try_for_each(|(flags, payload)| self.send_payload(channel_id, flags, payload));
        self.channels.remove(&channel_id);
        result
    }
}

/// Per-connection state of fixed-ratio chains.
#[derive(Default)]
struct FixedRatioState {
    chains: u32,
    /// Chain id still to be announced in the next downstream cell.
    unannounced: Option<[u8; CHAIN_ID_LENGTH]>,
}

struct MixThread {
    cascade: FakeCascade,
    decryptor: AsymDecryptor,
    downlink: Arc<Mutex<Downlink>>,
    events: Sender<MixEvent>,
}

impl MixThread {
    fn run(self, mut reader: ReadHalf) -> anyhow::Result<()> {
        let result = self.login(&mut reader).and_then(|session| match session {
            Some((link, first_mix)) => self.relay(&mut reader, link, first_mix),
            None => Ok(()),
        });
        let _ = self.events.send(MixEvent::Disconnected);
        debug!(?result, "fake mix finished");
        result
    }

    /// Returns the upstream link cipher and the first-mix cipher, or `None`
    /// when the client interrupted the login.
    fn login(&self, reader: &mut ReadHalf) -> anyhow::Result<Option<(SymCipher, SymCipher)>> {
        let descriptor = serde_json::to_vec(&self.cascade.descriptor)?;
        write_frame(self.downlink.lock().writer.as_mut(), &descriptor)?;

        let exchange = read_frame(reader.as_mut()).context("key exchange")?;
        let keys = decrypt_key_exchange(&self.decryptor, &exchange)?;
        if keys.link_keys.len() != 2 * KEY_WITH_IV_SIZE || keys.mix_keys.len() != KEY_WITH_IV_SIZE {
            bail!("key exchange carries keys of unexpected length");
        }
        let _ = self.events.send(MixEvent::KeysReceived);

        let confirmation = KeyConfirmation {
            signature: sign_exchange(CASCADE_SECRET, &keys.link_keys, &keys.mix_keys),
            replay: Vec::new(),
        };
        {
            let mut downlink = self.downlink.lock();
            write_frame(downlink.writer.as_mut(), &serde_json::to_vec(&confirmation)?)?;
            downlink.link = Some(SymCipher::new(&keys.link_keys[KEY_WITH_IV_SIZE..])?);
        }

        if self.cascade.descriptor.terms_required {
            loop {
                let frame = read_frame(reader.as_mut()).context("terms message")?;
                match serde_json::from_slice::<TermsMessage>(&frame)? {
                    TermsMessage::Resources { resources } => {
                        let _ = self.events.send(MixEvent::TermsResourcesRequested(resources.len()));
                        let operators: Vec<&str> = resources
                            .iter()
                            .map(|resource| match resource {
                                TermsResource::Template { operator, .. }
                                | TermsResource::CustomizedSections { operator, .. } => operator.as_str(),
                            })
                            .collect();
                        write_long_frame(self.downlink.lock().writer.as_mut(), &serde_json::to_vec(&operators)?)?;
                    }
                    TermsMessage::Answer { answer } => {
                        let _ = self.events.send(MixEvent::TermsAnswered(answer));
                        if answer == TermsAnswerKind::Interrupt {
                            return Ok(None);
                        }
                        break;
                    }
                }
            }
        }

        info!(cascade = %self.cascade.descriptor.id, "fake mix login finished");
        Ok(Some((
            SymCipher::new(&keys.link_keys[..KEY_WITH_IV_SIZE])?,
            SymCipher::new(&keys.mix_keys)?,
        )))
    }

    fn hop_cipher(&self, key: &[u8]) -> anyhow::Result<SymCipher> {
        let cipher = if self.cascade.enhanced {
            SymCipher::with_directional_keys(&key[..KEY_SIZE], &key[KEY_SIZE..])?
        } else {
            SymCipher::new(key)?
        };
        Ok(cipher)
    }

    fn relay(&self, reader: &mut ReadHalf, mut link: SymCipher, mut first_mix: SymCipher) -> anyhow::Result<()> {
        let key_len = if self.cascade.enhanced { 2 * KEY_SIZE } else { KEY_SIZE };
        let fixed_ratio = self.cascade.fixed_ratio_packets();
        let mut chains = FixedRatioState::default();
        loop {
            let packet = match MixPacket::parse(reader.as_mut(), Some(&mut link)) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(error = %e, "fake mix connection ended");
                    return Ok(());
                }
            };
            let id = packet.channel_id();
            if is_control_channel_id(id) {
                continue;
            }
            let flags = packet.flags();
            let mut payload = packet.payload().to_vec();

            let mut downlink = self.downlink.lock();
            let cell = if flags & FLAG_CHANNEL_OPEN != 0 {
                let mut key = payload[..key_len].to_vec();
                first_mix.apply_upstream(&mut key);
                let mut cipher = self.hop_cipher(&key)?;
                let mut rest = payload.split_off(key_len);
                cipher.apply_upstream(&mut rest);
                downlink.channels.insert(id, cipher);
                rest
            } else {
                let Some(cipher) = downlink.channels.get_mut(&id) else {
                    debug!(channel_id = id, "packet for unknown channel");
                    continue;
                };
                cipher.apply_upstream(&mut payload);
                payload
            };

            if flags & FLAG_CHANNEL_CLOSE != 0 {
                downlink.channels.remove(&id);
                drop(downlink);
                let _ = self.events.send(MixEvent::ChannelClosed(id));
                continue;
            }

            if let Some(packets) = fixed_ratio {
                drop(downlink);
                self.answer_fixed_ratio(id, &cell, packets, &mut chains)?;
                continue;
            }

            let cell = ChainCell::decode(&cell)?;
            if !cell.data.is_empty() {
                downlink.send(id, 0, &cell.data)?;
            }
            drop(downlink);
            let _ = self.events.send(MixEvent::Cell { channel_id: id, cell });
        }
    }

    /// Echo one fixed-ratio order on its own channel. Keep-alive orders are
    /// held for [`KEEP_ALIVE_DELAY`] first.
    fn answer_fixed_ratio(
        &self,
        channel_id: u32,
        raw: &[u8],
        packets: u32,
        chains: &mut FixedRatioState,
    ) -> anyhow::Result<()> {
        let new_chain = raw.len() >= 2 && u16::from_be_bytes([raw[0], raw[1]]) & SEQ_FLAG_NEW_CHAIN != 0;
        let cell = SequentialCell::decode(raw, !new_chain)?;
        let mut echo = cell.data.clone();
        if new_chain {
            chains.chains += 1;
            let mut id = [0u8; CHAIN_ID_LENGTH];
            id.copy_from_slice(format!("chain-{:02}", chains.chains % 100).as_bytes());
            chains.unannounced = Some(id);
            // The first byte of a chain is its type.
            if !echo.is_empty() {
                echo.remove(0);
            }
        }
        let stream_closed = cell.has_flag(SEQ_FLAG_STREAM_CLOSED);
        let keep_alive = !new_chain && cell.data.is_empty() && !stream_closed;
        let _ = self.events.send(MixEvent::SequentialCell { channel_id, cell });

        let data_packets = match self.cascade.fault {
            DownstreamFault::Silent => return Ok(()),
            DownstreamFault::None => packets.saturating_sub(1),
            DownstreamFault::ExtraPacket => packets,
            DownstreamFault::MissingPacket => packets.saturating_sub(2),
        }
        .max(1);

        let mut replies = Vec::new();
        for index in 0..data_packets {
            let first = index == 0;
            let reply = SequentialCell {
                flags: if first && stream_closed { SEQ_FLAG_STREAM_CLOSED } else { 0 },
                chain_id: if first { chains.unannounced.take() } else { None },
                data: if first { std::mem::take(&mut echo) } else { Vec::new() },
            };
            let mut payload = vec![0u8; PAYLOAD_SIZE];
            reply.encode_into(&mut payload)?;
            replies.push((0, payload));
        }
        let mut closing = vec![0u8; PAYLOAD_SIZE];
        SequentialCell {
            flags: 0,
            chain_id: None,
            data: Vec::new(),
        }
        .encode_into(&mut closing)?;
        replies.push((FLAG_CHANNEL_CLOSE, closing));

        if keep_alive {
            let downlink = Arc::clone(&self.downlink);
            thread::Builder::new().name("fake-mix-keep-alive".into()).spawn(move || {
                thread::sleep(KEEP_ALIVE_DELAY);
                if let Err(e) = downlink.lock().answer(channel_id, replies) {
                    debug!(channel_id, error = %e, "keep-alive answer not sent");
                }
            })?;
            return Ok(());
        }
        self.downlink.lock().answer(channel_id, replies)
    }
}

/// Handle on one connection served by a [`FakeCascade`].
pub struct MixSession {
    connection: Arc<TcpConnection>,
    downlink: Arc<Mutex<Downlink>>,
    events: Receiver<MixEvent>,
    thread: Option<JoinHandle<anyhow::Result<()>>>,
}

impl MixSession {
    /// Next observation, or `None` after [`WAIT`].
    pub fn next_event(&self) -> Option<MixEvent> {
        self.events.recv_timeout(WAIT).ok()
    }

    /// Skip events until `matches` accepts one.
    pub fn wait_for(&self, matches: impl Fn(&MixEvent) -> bool) -> Option<MixEvent> {
        while let Some(event) = self.next_event() {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Upstream cells with their channel ids, until nothing arrives for
    /// `quiet`.
    pub fn collect_cells(&self, quiet: Duration) -> Vec<(u32, ChainCell)> {
        let mut cells = Vec::new();
        while let Ok(event) = self.events.recv_timeout(quiet) {
            if let MixEvent::Cell { channel_id, cell } = event {
                cells.push((channel_id, cell));
            }
        }
        cells
    }

    /// Send `data` downstream on `channel_id`.
    pub fn send_downstream(&self, channel_id: u32, flags: u16, data: &[u8]) -> anyhow::Result<()> {
        self.downlink.lock().send(channel_id, flags, data)
    }

    /// Send a single-channel chain cell downstream on `channel_id`.
    pub fn send_downstream_cell(&self, channel_id: u32, cell: &ChainCell) -> anyhow::Result<()> {
        self.downlink.lock().send_chain_cell(channel_id, 0, cell)
    }

    /// Drop the connection as a failing mix would.
    pub fn disconnect(&self) -> anyhow::Result<()> {
        self.connection.close()?;
        Ok(())
    }

    /// Wait for the mix thread and return its result.
    pub fn finish(mut self) -> anyhow::Result<()> {
        self.connection.close()?;
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| anyhow::anyhow!("fake mix thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for MixSession {
    fn drop(&mut self) {
        let _ = self.connection.close();
    }
}

// ---------------------------------------------------------------------------
// Connector and client
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PresetInner {
    connections: Mutex<VecDeque<TcpConnection>>,
    attempts: AtomicUsize,
}

/// Connector handing out prepared connections in order. Clones share the
/// queue.
#[derive(Clone, Default)]
pub struct PresetConnector {
    inner: Arc<PresetInner>,
}

impl PresetConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the client side of a connection.
    pub fn push(&self, connection: TcpConnection) {
        self.inner.connections.lock().push_back(connection);
    }

    /// Connection attempts so far.
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for PresetConnector {
    fn connect(&self, _target: &CascadeTarget, _timeout: Duration) -> cascade_client::Result<Arc<dyn StreamConnection>> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        match self.inner.connections.lock().pop_front() {
            Some(connection) => Ok(Arc::new(connection)),
            None => Err(ClientError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no cascade listening",
            ))),
        }
    }
}

/// Client config for tests: short login timeout, no dummy traffic.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.connection.login_timeout_ms = 5_000;
    config.traffic.dummy_traffic_enabled = false;
    config
}

/// Client wired to the harness codec, trust model and `connector`.
pub fn test_client(connector: &PresetConnector, terms: Option<Arc<MemoryTerms>>) -> AnonClient {
    let mut builder = AnonClient::builder(
        test_config(),
        Arc::new(JsonCodec),
        Arc::new(SharedSecretTrust::new(CASCADE_SECRET)),
    )
    .connector(connector.clone());
    if let Some(terms) = terms {
        builder = builder.terms(terms);
    }
    builder.build()
}
