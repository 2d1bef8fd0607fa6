//! Resumption handshake: ephemeral P-256 agreement and token derivation.
//!
//! Every accepted socket gets a fresh ephemeral P-256 key whose public half
//! rides in the server banner. A resuming client completes the agreement by
//! sending its own 65-byte uncompressed public key, after which both sides
//! hold the same shared secret and derive from it:
//!
//! ```text
//! SHA-256(shared_secret) = session_token (16 bytes) || handshake_pad (16 bytes)
//! ```
//!
//! The token identifies the session; the pad is a per-connection one-time
//! mask applied to every 16-byte token field on the wire. Claiming an
//! existing token therefore requires knowledge of both the token and the
//! fresh shared secret: a peer with a fresh DH key and no knowledge of the
//! original exchange unmasks to garbage and is refused.
//!
//! # Post-handshake wire format
//!
//! - Client → Server: 65-byte public key, then 16 masked token bytes
//!   (an all-zeros token, i.e. the bare pad on the wire, requests a new
//!   session; anything else resumes that token).
//! - Server → Client: 16 masked token bytes on success; a single error
//!   marker byte ([`ERR_HANDSHAKE`] or [`ERR_NO_SUCH_SESSION`]) on failure,
//!   then close.

use limpet_platform::{LimpetError, LimpetResult};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, ECDH_P256};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::resume::version::ECDH_P256_UNCOMPRESSED_LEN;

/// Length of a session token in bytes.
pub const TOKEN_LEN: usize = 16;

/// Error marker: the handshake itself failed (bad key, I/O, refused).
pub const ERR_HANDSHAKE: u8 = 0x01;

/// Error marker: the declared token names no live session.
pub const ERR_NO_SUCH_SESSION: u8 = 0x02;

/// A 16-byte session identifier derived from the ECDH shared secret.
///
/// Equality is constant time. The all-zeros token is reserved: on the wire
/// it requests a new session and is never assigned to one.
#[derive(Debug, Clone, Copy)]
pub struct SessionToken([u8; TOKEN_LEN]);

impl SessionToken {
    /// Wraps raw token bytes.
    pub fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw token bytes.
    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Returns true for the reserved all-zeros token.
    pub fn is_zero(&self) -> bool {
        self.0.ct_eq(&[0u8; TOKEN_LEN]).into()
    }

    /// XORs the token with a 16-byte pad (self-inverse).
    pub fn mask(&self, pad: &[u8; TOKEN_LEN]) -> [u8; TOKEN_LEN] {
        let mut out = self.0;
        for (b, p) in out.iter_mut().zip(pad) {
            *b ^= p;
        }
        out
    }
}

impl PartialEq for SessionToken {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SessionToken {}

impl std::hash::Hash for SessionToken {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Secrets derived from one completed key agreement.
pub struct HandshakeSecret {
    token: SessionToken,
    pad: [u8; TOKEN_LEN],
}

impl HandshakeSecret {
    /// Derives token and pad from a raw shared secret.
    fn from_shared_secret(secret: &[u8]) -> Self {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(secret));

        let mut token = [0u8; TOKEN_LEN];
        let mut pad = [0u8; TOKEN_LEN];
        token.copy_from_slice(&digest[..TOKEN_LEN]);
        pad.copy_from_slice(&digest[TOKEN_LEN..]);
        digest.zeroize();

        Self {
            token: SessionToken(token),
            pad,
        }
    }

    /// The session token this agreement identifies.
    pub fn token(&self) -> SessionToken {
        self.token
    }

    /// Masks a token for transmission.
    pub fn mask(&self, token: &SessionToken) -> [u8; TOKEN_LEN] {
        token.mask(&self.pad)
    }

    /// Unmasks a received 16-byte token field.
    pub fn unmask(&self, wire: &[u8; TOKEN_LEN]) -> SessionToken {
        SessionToken(*wire).mask(&self.pad).into()
    }
}

impl From<[u8; TOKEN_LEN]> for SessionToken {
    fn from(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }
}

/// Server side of the ephemeral P-256 exchange.
///
/// Generated once per accepted socket, before the banner is written. The
/// private half is consumed by [`ServerHandshakeKey::agree`]; `ring`
/// zeroizes it on drop.
///
/// # Example
///
/// ```rust
/// use limpet_proto::resume::ServerHandshakeKey;
///
/// let key = ServerHandshakeKey::generate().unwrap();
/// assert_eq!(key.public_bytes().len(), 65);
/// assert_eq!(key.public_bytes()[0], 0x04); // uncompressed point
/// ```
pub struct ServerHandshakeKey {
    private: EphemeralPrivateKey,
    public: [u8; ECDH_P256_UNCOMPRESSED_LEN],
}

impl ServerHandshakeKey {
    /// Generates a fresh ephemeral key pair.
    ///
    /// # Errors
    ///
    /// Returns [`LimpetError::Security`] if the system RNG fails.
    pub fn generate() -> LimpetResult<Self> {
        let rng = SystemRandom::new();
        let private = EphemeralPrivateKey::generate(&ECDH_P256, &rng)
            .map_err(|_| LimpetError::Security("Failed to generate P-256 key".to_string()))?;

        let public_key = private
            .compute_public_key()
            .map_err(|_| LimpetError::Security("Failed to compute P-256 public key".to_string()))?;

        let mut public = [0u8; ECDH_P256_UNCOMPRESSED_LEN];
        public.copy_from_slice(public_key.as_ref());

        Ok(Self { private, public })
    }

    /// Returns the 65-byte uncompressed public key for the banner.
    pub fn public_bytes(&self) -> &[u8; ECDH_P256_UNCOMPRESSED_LEN] {
        &self.public
    }

    /// Completes the agreement against the peer's uncompressed public key,
    /// consuming the private key.
    ///
    /// # Errors
    ///
    /// Returns [`LimpetError::Security`] if the peer key is not a valid
    /// point on the curve.
    ///
    /// # Example
    ///
    /// ```rust
    /// use limpet_proto::resume::ServerHandshakeKey;
    ///
    /// let server = ServerHandshakeKey::generate().unwrap();
    /// let client = ServerHandshakeKey::generate().unwrap();
    /// let server_public = *server.public_bytes();
    ///
    /// let a = server.agree(client.public_bytes()).unwrap();
    /// let b = client.agree(&server_public).unwrap();
    /// assert_eq!(a.token(), b.token());
    /// ```
    pub fn agree(self, peer_public: &[u8]) -> LimpetResult<HandshakeSecret> {
        if peer_public.len() != ECDH_P256_UNCOMPRESSED_LEN {
            return Err(LimpetError::Security(format!(
                "Peer public key has {} bytes (expected {})",
                peer_public.len(),
                ECDH_P256_UNCOMPRESSED_LEN
            )));
        }

        let peer = UnparsedPublicKey::new(&ECDH_P256, peer_public);
        agree_ephemeral(self.private, &peer, HandshakeSecret::from_shared_secret)
            .map_err(|_| LimpetError::Security("P-256 key agreement failed".to_string()))
    }
}
