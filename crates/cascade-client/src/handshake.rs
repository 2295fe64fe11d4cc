//! Login key exchange with the first mix.
//!
//! The exchange runs on the raw connection before the multiplexer takes it
//! over. Every step is fatal: on any error the caller drops the connection.
//!
//! 1. Read the cascade descriptor (`u16` frame), check trust.
//! 2. Pick the channel protocol and build per-hop [`MixParameters`].
//! 3. Pick the chain protocol announced by the last mix.
//! 4. Send fresh link and first-mix keys, verify the signed confirmation.
//!    Channel protocol 0.2 instead sends a raw key packet.
//! 5. Confirm terms and conditions if the cascade requires it.

use std::io::{Read, Write};
use std::str::FromStr;
use std::time::Duration;

use cascade_crypto::asym::{AsymCipher, AsymScheme};
use cascade_crypto::keys::random_key_material;
use cascade_crypto::sym::{SymCipher, KEY_SIZE, KEY_WITH_IV_SIZE};
use cascade_mux::{ChainProtocol, CipherChain, FixedRatio, FlowControl, MixParameters, ReplayTimestamp};
use cascade_wire::frame::{read_frame, read_long_frame, write_frame};
use cascade_wire::packet::MixPacket;
use tracing::{debug, info, warn};

use crate::cascade::{
    CascadeDescriptor, ChainProtocolInfo, DescriptorCodec, KeyExchange, PendingTerms, TermsAnswer, TermsContainer,
    TermsResource, TermsState, TrustModel,
};
use crate::{ClientError, Result};

/// Marker at the start of a protocol 0.2 key packet.
pub const KEY_PACKET_MARKER: &[u8] = b"KEYPACKET";

/// Link key bytes in a protocol 0.2 key packet (input key, output key).
const KEY_PACKET_KEYS: usize = 2 * KEY_SIZE;

/// Channel protocol version of the cascade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelProtocol {
    /// Raw key packet, no first-mix cipher.
    V0_2,
    /// XML key exchange with a first-mix cipher.
    V0_4,
    /// As 0.4 with replay detection.
    V0_81,
    V0_9,
    /// Separate upstream and downstream channel keys, RSA-OAEP.
    V0_10,
}

impl ChannelProtocol {
    /// Whether channel keys for the first hop go under a shared cipher.
    pub fn uses_first_mix_cipher(self) -> bool {
        self != ChannelProtocol::V0_2
    }

    /// Whether the mixes run replay detection.
    pub fn replay_detection(self) -> bool {
        self == ChannelProtocol::V0_81
    }

    /// Whether channels use separate upstream and downstream keys.
    pub fn enhanced_encryption(self) -> bool {
        self == ChannelProtocol::V0_10
    }

    /// Scheme used for hop key transport.
    pub fn asym_scheme(self) -> AsymScheme {
        if self.enhanced_encryption() {
            AsymScheme::Oaep
        } else {
            AsymScheme::Plain
        }
    }
}

impl FromStr for ChannelProtocol {
    type Err = ClientError;

    fn from_str(version: &str) -> Result<Self> {
        match version.trim() {
            "0.2" => Ok(Self::V0_2),
            "0.4" => Ok(Self::V0_4),
            "0.81" => Ok(Self::V0_81),
            "0.9" => Ok(Self::V0_9),
            "0.10" => Ok(Self::V0_10),
            other => Err(ClientError::UnknownProtocolVersion(format!("channel protocol '{other}'"))),
        }
    }
}

/// Everything a successful login produced.
pub struct HandshakeOutcome {
    /// The cascade as described by its first mix.
    pub cascade: CascadeDescriptor,
    pub channel_protocol: ChannelProtocol,
    pub chain_protocol: ChainProtocol,
    pub cipher_chain: CipherChain,
    /// Link cipher for packets from the first mix.
    pub input_link: SymCipher,
    /// Link cipher for packets to the first mix.
    pub output_link: SymCipher,
    pub payment_required: bool,
}

/// Runs the login on one connection.
pub struct KeyExchangeManager<'a> {
    codec: &'a dyn DescriptorCodec,
    trust: &'a dyn TrustModel,
    terms: Option<&'a dyn TermsContainer>,
}

/// Terms bookkeeping collected while walking the mixes.
#[derive(Default)]
struct TermsCheck {
    pending: Vec<PendingTerms>,
    resources: Vec<TermsResource>,
}

impl<'a> KeyExchangeManager<'a> {
    pub fn new(codec: &'a dyn DescriptorCodec, trust: &'a dyn TrustModel) -> Self {
        Self {
            codec,
            trust,
            terms: None,
        }
    }

    /// Use `container` for cascades that require terms confirmation.
    pub fn with_terms(mut self, container: &'a dyn TermsContainer) -> Self {
        self.terms = Some(container);
        self
    }

    /// Run the login. Reads and writes block; the caller enforces the
    /// login timeout on the connection.
    pub fn run<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<HandshakeOutcome>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        // 1. Cascade descriptor and trust
        let descriptor = read_frame(reader)?;
        let cascade = self.codec.decode_cascade(&descriptor)?;
        if cascade.mixes.is_empty() {
            return Err(ClientError::Protocol("cascade without mixes".into()));
        }
        self.trust.check_trust(&cascade)?;

        // 2. Channel protocol and hops
        let channel_protocol: ChannelProtocol = cascade.mix_protocol_version.parse()?;
        debug!(cascade = %cascade.id, version = %cascade.mix_protocol_version, "channel protocol");
        if !cascade.is_payment_protocol_supported() {
            return Err(ClientError::UnknownProtocolVersion(format!(
                "payment protocol '{}'",
                cascade.payment_protocol_version.as_deref().unwrap_or("")
            )));
        }
        let (hops, terms) = self.mix_parameters(&cascade, channel_protocol)?;

        // 3. Chain protocol of the last mix
        let last = cascade.mixes.len() - 1;
        let chain_protocol = match &cascade.mixes[last].chain_protocol {
            Some(info) => chain_protocol(info)?,
            None => return Err(ClientError::Protocol("last mix announces no chain protocol".into())),
        };
        debug!(?chain_protocol, "chain protocol");

        // 4. Keys
        let first_asym = hops[0].asym_cipher().clone();
        let (input_link, output_link, first_mix) = if channel_protocol.uses_first_mix_cipher() {
            self.exchange_keys(reader, writer, &cascade, &hops, &first_asym, channel_protocol)?
        } else {
            let (input, output) = send_key_packet(writer, &first_asym)?;
            (input, output, None)
        };
        let cipher_chain = CipherChain::new(hops, first_mix, channel_protocol.enhanced_encryption())?;

        // 5. Terms and conditions
        if cascade.terms_required {
            self.confirm_terms(reader, writer, terms)?;
        }

        info!(cascade = %cascade.id, mixes = cascade.mixes.len(), "key exchange finished");
        Ok(HandshakeOutcome {
            payment_required: cascade.payment,
            cascade,
            channel_protocol,
            chain_protocol,
            cipher_chain,
            input_link,
            output_link,
        })
    }

    fn mix_parameters(
        &self,
        cascade: &CascadeDescriptor,
        protocol: ChannelProtocol,
    ) -> Result<(Vec<MixParameters>, TermsCheck)> {
        let mut hops = Vec::with_capacity(cascade.mixes.len());
        let mut terms = TermsCheck::default();
        for (index, mix) in cascade.mixes.iter().enumerate() {
            if index > 0 && !mix.verified {
                return Err(ClientError::Signature(format!("mix {} has an invalid signature", index + 1)));
            }
            let asym = AsymCipher::from_components(&mix.public_key.modulus, &mix.public_key.exponent, protocol.asym_scheme())
                .map_err(|e| ClientError::Protocol(format!("invalid public key for mix {index}: {e}")))?;
            hops.push(MixParameters::new(mix.id.clone(), asym));

            if !cascade.terms_required {
                continue;
            }
            let Some(container) = self.terms else {
                return Err(ClientError::Protocol(
                    "terms confirmation required but no terms container".into(),
                ));
            };
            let Some(info) = &mix.terms else {
                warn!(mix = %mix.name, "cascade requires terms confirmation but the mix sends no terms");
                continue;
            };
            if container.state(&mix.operator, info) != TermsState::Accepted {
                terms.pending.push(PendingTerms {
                    operator: mix.operator.clone(),
                    date: info.date.clone(),
                });
            }
            terms.resources.extend(container.missing_resources(&mix.operator, info));
        }
        Ok((hops, terms))
    }

    fn exchange_keys<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        cascade: &CascadeDescriptor,
        hops: &[MixParameters],
        first_asym: &AsymCipher,
        protocol: ChannelProtocol,
    ) -> Result<(SymCipher, SymCipher, Option<SymCipher>)>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        let exchange = KeyExchange {
            link_keys: random_key_material(2 * KEY_WITH_IV_SIZE),
            mix_keys: random_key_material(KEY_WITH_IV_SIZE),
            replay_detection: protocol.replay_detection(),
        };
        let output_link = SymCipher::new(&exchange.link_keys[..KEY_WITH_IV_SIZE])?;
        let input_link = SymCipher::new(&exchange.link_keys[KEY_WITH_IV_SIZE..])?;
        let first_mix = SymCipher::new(&exchange.mix_keys)?;

        debug!("sending key exchange");
        let document = self.codec.encode_key_exchange(&exchange, first_asym)?;
        write_frame(writer, &document)?;

        let answer = read_frame(reader)?;
        let confirmation = self.codec.decode_key_confirmation(&answer)?;
        if exchange.replay_detection {
            for replay in &confirmation.replay {
                match hops.iter().find(|hop| hop.mix_id() == replay.mix_id) {
                    Some(hop) => hop.set_replay_timestamp(Some(ReplayTimestamp::new(
                        replay.mix_id.clone(),
                        Duration::from_secs(replay.interval),
                        replay.offset,
                    ))),
                    None => warn!(mix = %replay.mix_id, "replay offset for an unknown mix"),
                }
            }
        }
        self.trust.verify_key_signature(cascade, &exchange, &confirmation.signature)?;
        Ok((input_link, output_link, Some(first_mix)))
    }

    fn confirm_terms<R, W>(&self, reader: &mut R, writer: &mut W, terms: TermsCheck) -> Result<()>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        let Some(container) = self.terms else {
            return Err(ClientError::Protocol("terms confirmation required but no terms container".into()));
        };
        if !terms.resources.is_empty() {
            debug!(resources = terms.resources.len(), "requesting terms resources");
            write_frame(writer, &self.codec.encode_terms_request(&terms.resources)?)?;
            let response = read_long_frame(reader)?;
            container.handle_resource_response(&response)?;
        }

        let answer = if terms.pending.is_empty() {
            TermsAnswer::Confirm
        } else {
            TermsAnswer::Interrupt
        };
        write_frame(writer, &self.codec.encode_terms_answer(answer)?)?;
        if answer == TermsAnswer::Interrupt {
            info!(operators = terms.pending.len(), "login interrupted for terms confirmation");
            return Err(ClientError::TermsInterrupt { pending: terms.pending });
        }
        Ok(())
    }
}

/// Send the protocol 0.2 key packet; returns (input, output) link ciphers.
fn send_key_packet<W: Write + ?Sized>(writer: &mut W, first_asym: &AsymCipher) -> Result<(SymCipher, SymCipher)> {
    let keys = random_key_material(KEY_PACKET_KEYS);
    let mut packet = MixPacket::new(0);
    let payload = packet.payload_mut();
    payload[..KEY_PACKET_MARKER.len()].copy_from_slice(KEY_PACKET_MARKER);
    payload[KEY_PACKET_MARKER.len()..KEY_PACKET_MARKER.len() + KEY_PACKET_KEYS].copy_from_slice(&keys);

    let block = first_asym.input_block_size();
    let encrypted = first_asym.encrypt_block(&payload[..block])?;
    payload[..encrypted.len()].copy_from_slice(&encrypted);

    debug!("sending key packet");
    packet.write_to(writer, None)?;
    writer.flush()?;
    Ok((SymCipher::new(&keys[..KEY_SIZE])?, SymCipher::new(&keys[KEY_SIZE..])?))
}

fn positive(value: Option<i64>, name: &str) -> Result<u32> {
    match value {
        Some(v) if v >= 1 => u32::try_from(v).map_err(|_| ClientError::Protocol(format!("{name} out of range"))),
        Some(_) => Err(ClientError::Protocol(format!("{name} has an invalid value"))),
        None => Err(ClientError::Protocol(format!("{name} expected"))),
    }
}

/// Chain protocol from the last mix's announcement.
pub fn chain_protocol(info: &ChainProtocolInfo) -> Result<ChainProtocol> {
    match info.version.trim() {
        "0.3" => Ok(ChainProtocol::Unlimited),
        "0.5" => Ok(ChainProtocol::FixedRatio(FixedRatio {
            downstream_packets: positive(info.downstream_packets, "DownstreamPackets")?,
            channel_timeout: Duration::from_secs(u64::from(positive(info.channel_timeout, "ChannelTimeout")?)),
            chain_timeout: Duration::from_secs(u64::from(positive(info.chain_timeout, "ChainTimeout")?)),
        })),
        "0.6" => Ok(ChainProtocol::FlowControlled(FlowControl {
            upstream_send_me: positive(info.upstream_send_me, "UpstreamSendMe")?,
            downstream_send_me: positive(info.downstream_send_me, "DownstreamSendMe")?,
        })),
        other => Err(ClientError::UnknownProtocolVersion(format!("chain protocol '{other}'"))),
    }
}
