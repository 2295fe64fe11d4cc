//! Cascade descriptors and the collaborators of the login.
//!
//! The first mix describes the cascade in a signed document. Parsing that
//! document, checking trust and signatures and storing terms and conditions
//! are left to collaborators behind the traits in this module; the login
//! itself only sees the decoded [`CascadeDescriptor`].

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use cascade_crypto::asym::AsymCipher;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::Result;

/// Payment protocol version this client speaks.
pub const SUPPORTED_PAYMENT_PROTOCOL: &str = "2.0";

/// Where to reach a cascade.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CascadeTarget {
    /// Cascade identifier.
    pub id: String,
    /// Listener addresses of the first mix, tried in order.
    pub addresses: Vec<SocketAddr>,
}

impl CascadeTarget {
    /// Target with a single listener address.
    pub fn new(id: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            id: id.into(),
            addresses: vec![address],
        }
    }
}

/// Public RSA key of a mix, big-endian.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub modulus: Vec<u8>,
    pub exponent: Vec<u8>,
}

/// Chain protocol announced by the last mix, unvalidated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainProtocolInfo {
    /// "0.3", "0.5" or "0.6".
    pub version: String,
    #[serde(default)]
    pub upstream_send_me: Option<i64>,
    #[serde(default)]
    pub downstream_send_me: Option<i64>,
    #[serde(default)]
    pub downstream_packets: Option<i64>,
    /// Seconds.
    #[serde(default)]
    pub channel_timeout: Option<i64>,
    /// Seconds.
    #[serde(default)]
    pub chain_timeout: Option<i64>,
}

/// Terms and conditions a mix operator publishes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixTermsInfo {
    /// Date of the current version, `YYYYMMDD`.
    pub date: String,
    pub default_language: String,
    /// Template id per language code.
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
}

/// One mix of the cascade.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Operator running the mix.
    #[serde(default)]
    pub operator: String,
    /// The mix certificate was verified while decoding.
    pub verified: bool,
    pub public_key: PublicKeyInfo,
    /// Only meaningful on the last mix.
    #[serde(default)]
    pub chain_protocol: Option<ChainProtocolInfo>,
    #[serde(default)]
    pub terms: Option<MixTermsInfo>,
}

/// The cascade as described by its first mix.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Channel protocol version, e.g. "0.10".
    pub mix_protocol_version: String,
    #[serde(default)]
    pub payment: bool,
    #[serde(default)]
    pub payment_protocol_version: Option<String>,
    #[serde(default)]
    pub terms_required: bool,
    /// First mix first.
    pub mixes: Vec<MixDescriptor>,
}

impl CascadeDescriptor {
    /// Whether the cascade's payment protocol can be spoken.
    pub fn is_payment_protocol_supported(&self) -> bool {
        !self.payment || self.payment_protocol_version.as_deref() == Some(SUPPORTED_PAYMENT_PROTOCOL)
    }

    /// Whether both descriptors list the same mixes in the same order.
    pub fn same_mixes(&self, other: &CascadeDescriptor) -> bool {
        self.mixes.len() == other.mixes.len() && self.mixes.iter().zip(&other.mixes).all(|(a, b)| a.id == b.id)
    }
}

/// Keys the client hands to the first mix.
pub struct KeyExchange {
    /// Link keys: upstream key and IV (bytes `0..32`), downstream key and
    /// IV (bytes `32..64`).
    pub link_keys: Zeroizing<Vec<u8>>,
    /// Key and IV of the cipher shared with the first mix.
    pub mix_keys: Zeroizing<Vec<u8>>,
    /// Ask the mixes for replay detection.
    pub replay_detection: bool,
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("replay_detection", &self.replay_detection)
            .finish_non_exhaustive()
    }
}

/// Replay timestamp offset of one mix.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayOffset {
    pub mix_id: String,
    pub offset: u16,
    /// Seconds per timestamp step.
    pub interval: u64,
}

/// The first mix's answer to a key exchange.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfirmation {
    /// Signature over the key exchange by the cascade.
    pub signature: Vec<u8>,
    /// Present when replay detection was requested.
    #[serde(default)]
    pub replay: Vec<ReplayOffset>,
}

/// A terms and conditions resource the client lacks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TermsResource {
    /// A template in some language.
    Template {
        operator: String,
        language: String,
        template_id: String,
    },
    /// The operator's customized sections in some language.
    CustomizedSections { operator: String, language: String },
}

/// Terms of one operator that still need to be accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTerms {
    pub operator: String,
    pub date: String,
}

/// Final terms message of the login.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermsAnswer {
    /// All terms are accepted.
    Confirm,
    /// Some terms are not accepted; the mix drops the login.
    Interrupt,
}

/// Acceptance state of an operator's terms, as far as the container knows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermsState {
    Accepted,
    NotAccepted,
    /// Unknown or older than the version the mix announces.
    Outdated,
}

/// Encodes and decodes login documents.
pub trait DescriptorCodec: Send + Sync {
    /// Decode the cascade descriptor sent by the first mix.
    fn decode_cascade(&self, data: &[u8]) -> Result<CascadeDescriptor>;

    /// Encode `exchange`, encrypted for the first mix.
    fn encode_key_exchange(&self, exchange: &KeyExchange, first_mix: &AsymCipher) -> Result<Vec<u8>>;

    /// Decode the first mix's confirmation.
    fn decode_key_confirmation(&self, data: &[u8]) -> Result<KeyConfirmation>;

    /// Encode a request for missing terms resources.
    fn encode_terms_request(&self, resources: &[TermsResource]) -> Result<Vec<u8>>;

    /// Encode the final terms message.
    fn encode_terms_answer(&self, answer: TermsAnswer) -> Result<Vec<u8>>;
}

/// Decides whether a cascade may be used.
pub trait TrustModel: Send + Sync {
    /// Fails with `ClientError::Trust` or `ClientError::Signature`.
    fn check_trust(&self, cascade: &CascadeDescriptor) -> Result<()>;

    /// Verify the cascade's signature over the key exchange. Fails with
    /// `ClientError::Signature`.
    fn verify_key_signature(
        &self,
        cascade: &CascadeDescriptor,
        exchange: &KeyExchange,
        signature: &[u8],
    ) -> Result<()>;
}

/// Local store of terms and conditions.
pub trait TermsContainer: Send + Sync {
    /// State of `operator`'s terms against the announced version.
    fn state(&self, operator: &str, terms: &MixTermsInfo) -> TermsState;

    /// Resources needed to display `operator`'s terms.
    fn missing_resources(&self, operator: &str, terms: &MixTermsInfo) -> Vec<TermsResource>;

    /// Store the first mix's answer to a resource request.
    fn handle_resource_response(&self, response: &[u8]) -> Result<()>;
}

/// Asks the user to accept pending terms.
pub trait TermsConfirmation: Send + Sync {
    /// Return `true` once every pending terms document was accepted and
    /// recorded in the container.
    fn confirm(&self, pending: &[PendingTerms]) -> bool;
}
