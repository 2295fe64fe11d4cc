//! Layered channel encryption.
//!
//! A [`CipherChain`] describes the cascade as negotiated during login: one
//! [`MixParameters`] per hop (index 0 is the first mix) and, for newer
//! cascades, a symmetric cipher shared with the first mix. It is immutable
//! after login and shared by every channel.
//!
//! Each data channel opens its own [`ChannelLayers`]: a fresh symmetric key
//! per hop. The first packet of a channel transports those keys:
//!
//! ```text
//! hop i layer, first packet:  asym(key_i || inner[..]) || ofb_i(inner[..])
//! hop 0 layer with first-mix cipher:  first_mix(key_0) || ofb_0(inner)
//! later packets:              ofb_i(inner)
//! ```
//!
//! Outbound layers are applied from the last hop to the first; inbound
//! layers are removed from the first hop to the last. Every layer advances
//! its OFB stream as if it had processed a full payload so that the client
//! stays synchronized with mixes, which always process full payloads.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cascade_crypto::asym::{AsymCipher, AsymScheme};
use cascade_crypto::keys::random_key_material;
use cascade_crypto::sym::{SymCipher, KEY_SIZE};
use cascade_wire::packet::{MixPacket, PAYLOAD_SIZE};
use parking_lot::{Mutex, RwLock};
use zeroize::Zeroizing;

use crate::{MuxError, Result};

/// Size of the replay timestamp written into hop keys.
pub const REPLAY_TIMESTAMP_SIZE: usize = 2;

/// Replay-detection timestamp of one mix.
///
/// The mix publishes an offset and an interval; the current timestamp is the
/// offset advanced by one for every elapsed interval since it was received.
#[derive(Clone, Debug)]
pub struct ReplayTimestamp {
    mix_id: String,
    interval: Duration,
    offset: u16,
    reference: Instant,
}

impl ReplayTimestamp {
    /// Timestamp received now.
    pub fn new(mix_id: impl Into<String>, interval: Duration, offset: u16) -> Self {
        Self {
            mix_id: mix_id.into(),
            interval,
            offset,
            reference: Instant::now(),
        }
    }

    /// Mix this timestamp belongs to.
    pub fn mix_id(&self) -> &str {
        &self.mix_id
    }

    /// Timestamp value at the current instant, big-endian.
    pub fn current(&self) -> [u8; REPLAY_TIMESTAMP_SIZE] {
        let interval = self.interval.as_secs().max(1);
        let steps = self.reference.elapsed().as_secs() / interval;
        let value = (u64::from(self.offset).wrapping_add(steps) & 0xFFFF) as u16;
        value.to_be_bytes()
    }
}

/// Negotiated parameters of one hop.
pub struct MixParameters {
    mix_id: String,
    asym: AsymCipher,
    replay: RwLock<Option<ReplayTimestamp>>,
}

impl MixParameters {
    /// Parameters for the mix `mix_id` with its public key cipher.
    pub fn new(mix_id: impl Into<String>, asym: AsymCipher) -> Self {
        Self {
            mix_id: mix_id.into(),
            asym,
            replay: RwLock::new(None),
        }
    }

    /// Mix identifier.
    pub fn mix_id(&self) -> &str {
        &self.mix_id
    }

    /// Public key cipher of the mix.
    pub fn asym_cipher(&self) -> &AsymCipher {
        &self.asym
    }

    /// Install or clear the replay timestamp.
    pub fn set_replay_timestamp(&self, timestamp: Option<ReplayTimestamp>) {
        *self.replay.write() = timestamp;
    }

    /// Current replay timestamp, if the mix uses replay detection.
    pub fn replay_timestamp(&self) -> Option<ReplayTimestamp> {
        self.replay.read().clone()
    }
}

impl fmt::Debug for MixParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MixParameters")
            .field("mix_id", &self.mix_id)
            .field("scheme", &self.asym.scheme())
            .finish_non_exhaustive()
    }
}

/// The cascade's hops as negotiated at login.
pub struct CipherChain {
    hops: Vec<Arc<MixParameters>>,
    first_mix: Option<Arc<Mutex<SymCipher>>>,
    enhanced: bool,
}

impl CipherChain {
    /// Build the chain. `first_mix` is the symmetric cipher shared with the
    /// first mix, if the cascade uses one; `enhanced` selects separate
    /// upstream and downstream channel keys.
    pub fn new(hops: Vec<MixParameters>, first_mix: Option<SymCipher>, enhanced: bool) -> Result<Self> {
        if hops.is_empty() {
            return Err(MuxError::InvalidParameter("cipher chain needs at least one hop".into()));
        }
        Ok(Self {
            hops: hops.into_iter().map(Arc::new).collect(),
            first_mix: first_mix.map(|c| Arc::new(Mutex::new(c))),
            enhanced,
        })
    }

    /// Hop parameters, first mix first.
    pub fn hops(&self) -> &[Arc<MixParameters>] {
        &self.hops
    }

    /// Number of hops.
    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Whether channel keys are split into upstream and downstream keys.
    pub fn is_enhanced(&self) -> bool {
        self.enhanced
    }

    /// Bytes of key material transported per hop.
    pub fn channel_key_size(&self) -> usize {
        if self.enhanced {
            2 * KEY_SIZE
        } else {
            KEY_SIZE
        }
    }

    /// Fresh per-hop keys for a new channel.
    pub fn open_channel(&self) -> ChannelLayers {
        let key_size = self.channel_key_size();
        let layers = self
            .hops
            .iter()
            .enumerate()
            .map(|(index, params)| {
                let mut key = random_key_material(key_size);
                let kind = match (&self.first_mix, index) {
                    (Some(shared), 0) => HopKind::FirstMix(Arc::clone(shared)),
                    _ => {
                        if params.asym_cipher().scheme() == AsymScheme::Plain {
                            // Keeps the RSA block below the modulus.
                            key[0] &= 0x7f;
                        }
                        HopKind::Asymmetric(Arc::clone(params))
                    }
                };
                HopLayer {
                    kind,
                    key,
                    cipher: None,
                    enhanced: self.enhanced,
                }
            })
            .collect();
        ChannelLayers { layers }
    }
}

impl fmt::Debug for CipherChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherChain")
            .field("hops", &self.hops)
            .field("first_mix_cipher", &self.first_mix.is_some())
            .field("enhanced", &self.enhanced)
            .finish()
    }
}

enum HopKind {
    /// Key transported under the mix's public key.
    Asymmetric(Arc<MixParameters>),
    /// Key transported under the first-mix stream cipher at send time.
    FirstMix(Arc<Mutex<SymCipher>>),
}

struct HopLayer {
    kind: HopKind,
    key: Zeroizing<Vec<u8>>,
    cipher: Option<SymCipher>,
    enhanced: bool,
}

impl HopLayer {
    fn first_packet_overhead(&self) -> usize {
        if self.cipher.is_some() {
            return 0;
        }
        match &self.kind {
            HopKind::Asymmetric(params) => self.key.len() + params.asym_cipher().expansion(),
            HopKind::FirstMix(_) => self.key.len(),
        }
    }

    fn build_cipher(&self) -> Result<SymCipher> {
        let cipher = if self.enhanced {
            SymCipher::with_directional_keys(&self.key[..KEY_SIZE], &self.key[KEY_SIZE..])?
        } else {
            SymCipher::new(&self.key)?
        };
        Ok(cipher)
    }

    fn encrypt(&mut self, cell: Vec<u8>, packet: &mut MixPacket) -> Result<Vec<u8>> {
        if let Some(cipher) = self.cipher.as_mut() {
            let mut out = cell;
            apply_virtual(cipher, &mut out, PAYLOAD_SIZE);
            return Ok(out);
        }

        if let HopKind::Asymmetric(params) = &self.kind {
            if let Some(timestamp) = params.replay_timestamp() {
                let end = if self.enhanced { KEY_SIZE } else { self.key.len() };
                self.key[end - REPLAY_TIMESTAMP_SIZE..end].copy_from_slice(&timestamp.current());
            }
        }
        let mut cipher = self.build_cipher()?;
        let key_len = self.key.len();

        let out = match &self.kind {
            HopKind::Asymmetric(params) => {
                let asym = params.asym_cipher();
                let block = asym.input_block_size();
                let mut plain = Zeroizing::new(Vec::with_capacity(key_len + cell.len()));
                plain.extend_from_slice(&self.key);
                plain.extend_from_slice(&cell);
                if plain.len() < block {
                    return Err(MuxError::Protocol(format!(
                        "first packet layer of {} bytes is shorter than the asymmetric block",
                        plain.len()
                    )));
                }
                let mut out = asym.encrypt_block(&plain[..block])?;
                let mut tail = plain[block..].to_vec();
                apply_virtual(&mut cipher, &mut tail, PAYLOAD_SIZE - block);
                out.extend_from_slice(&tail);
                out
            }
            HopKind::FirstMix(shared) => {
                let mut tail = cell;
                apply_virtual(&mut cipher, &mut tail, PAYLOAD_SIZE - key_len);
                let shared = Arc::clone(shared);
                packet.add_finalizer(Box::new(move |p: &mut MixPacket| {
                    shared.lock().apply_upstream(&mut p.payload_mut()[..key_len]);
                }));
                let mut out = Vec::with_capacity(key_len + tail.len());
                out.extend_from_slice(&self.key);
                out.extend_from_slice(&tail);
                out
            }
        };
        self.cipher = Some(cipher);
        Ok(out)
    }
}

/// Encrypt `data` as if it were `virtual_len` bytes long.
fn apply_virtual(cipher: &mut SymCipher, data: &mut Vec<u8>, virtual_len: usize) {
    let real = data.len();
    if virtual_len > real {
        data.resize(virtual_len, 0);
    }
    cipher.apply_upstream(data);
    data.truncate(real);
}

/// Per-channel hop ciphers.
pub struct ChannelLayers {
    layers: Vec<HopLayer>,
}

impl ChannelLayers {
    /// Payload bytes the next packet loses to key transport.
    pub fn next_packet_overhead(&self) -> usize {
        self.layers.iter().map(HopLayer::first_packet_overhead).sum()
    }

    /// Whether the hop keys have already been sent.
    pub fn is_established(&self) -> bool {
        self.layers.iter().all(|layer| layer.cipher.is_some())
    }

    /// Onion-encrypt `cell` into the payload of `packet`.
    ///
    /// `cell` must be `PAYLOAD_SIZE - next_packet_overhead()` bytes long.
    /// Send finalizers needed by the first-mix layer are added to `packet`.
    pub fn encrypt_outbound(&mut self, cell: Vec<u8>, packet: &mut MixPacket) -> Result<()> {
        let mut data = cell;
        for layer in self.layers.iter_mut().rev() {
            data = layer.encrypt(data, packet)?;
        }
        if data.len() != PAYLOAD_SIZE {
            return Err(MuxError::Protocol(format!(
                "layered payload is {} bytes, expected {PAYLOAD_SIZE}",
                data.len()
            )));
        }
        packet.payload_mut().copy_from_slice(&data);
        Ok(())
    }

    /// Remove every hop layer from a downstream payload in place.
    pub fn decrypt_inbound(&mut self, payload: &mut [u8]) -> Result<()> {
        for layer in &mut self.layers {
            let cipher = layer.cipher.as_mut().ok_or_else(|| {
                MuxError::Protocol("downstream packet before the channel was opened".into())
            })?;
            cipher.apply_downstream(payload);
        }
        Ok(())
    }
}

impl fmt::Debug for ChannelLayers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLayers")
            .field("hops", &self.layers.len())
            .field("established", &self.is_established())
            .finish()
    }
}
