// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! Adapter over an external authenticated-encryption primitive: a Noise-like
//! session keyed by a long-lived public key. The primitive itself lives outside
//! this crate -- what this module owns is the small state machine the session
//! table needs to reason about: has the peer's key been learned yet, has the
//! handshake completed, has the session gone quiet long enough to need a reset.

/// Hand-written, non-derive error enum for the crypto adapter: a flat set of named
/// failure modes plus a catch-all for the wrapped primitive.
pub enum Error {
    /// Decryption failed: MAC check or handshake verification did not pass.
    FailedAuthentication,

    /// The session has not yet completed its handshake; cannot send/receive data.
    SessionNotEstablished,

    /// Peer-supplied data was not a well formed crypto header.
    InvalidPacket,

    /// An internal error from the underlying primitive.
    OtherError(Box<dyn std::error::Error>),
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FailedAuthentication => f.write_str("FailedAuthentication"),
            Self::SessionNotEstablished => f.write_str("SessionNotEstablished"),
            Self::InvalidPacket => f.write_str("InvalidPacket"),
            Self::OtherError(e) => write!(f, "OtherError({})", e),
        }
    }
}

impl std::error::Error for Error {}

/// A 32-bit code identifying the reason decryption failed, carried in failed-decrypt
/// replies. Kept distinct from `Error` because it's a wire value, not a Rust error
/// type -- `Error` maps onto one of these when a reply needs to be built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecryptErrorCode(pub u32);

impl DecryptErrorCode {
    pub const AUTH_FAILED: DecryptErrorCode = DecryptErrorCode(1);
    pub const KEY_NOT_SET: DecryptErrorCode = DecryptErrorCode(2);
    pub const MALFORMED: DecryptErrorCode = DecryptErrorCode(3);
    pub const OTHER: DecryptErrorCode = DecryptErrorCode(0xff);

    pub fn from_error(e: &Error) -> Self {
        match e {
            Error::FailedAuthentication => Self::AUTH_FAILED,
            Error::SessionNotEstablished => Self::KEY_NOT_SET,
            Error::InvalidPacket => Self::MALFORMED,
            Error::OtherError(_) => Self::OTHER,
        }
    }
}

/// Coarse handshake progress of a crypto session, used by the session table and the
/// switch/inside interfaces to decide whether to buffer, encrypt, or re-handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    /// No key material exchanged yet.
    New,
    /// The peer's long-lived public key has been received and verified once.
    ReceivedKey,
    /// Full bidirectional handshake complete; ready for ordinary data frames.
    Established,
}

/// A single crypto session bound to one peer's public key. This crate owns the state
/// machine above; a real deployment would plug the actual AEAD handshake in behind
/// the methods below -- this struct is the minimal concrete session used until that
/// primitive is wired in, sufficient to drive every session-table and ingress/egress
/// rule that depends only on handshake *state*, not the bytes of the handshake.
pub struct CryptoSession {
    pub peer_public_key: Option<[u8; 32]>,
    pub state: HandshakeState,
    pub last_activity_ms: i64,
}

/// Crypto sessions idle for longer than this are reset before the next encrypt or
/// decrypt attempt.
pub const CRYPTO_SESSION_TIMEOUT_MS: i64 = 120_000;

impl HandshakeState {
    /// Wire-friendly code for this state, used as the "crypto state snapshot" field
    /// in a failed-decrypt reply (spec §4.7).
    pub fn as_u32(self) -> u32 {
        match self {
            HandshakeState::New => 0,
            HandshakeState::ReceivedKey => 1,
            HandshakeState::Established => 2,
        }
    }
}

impl CryptoSession {
    pub fn new(now_ms: i64) -> Self {
        Self { peer_public_key: None, state: HandshakeState::New, last_activity_ms: now_ms }
    }

    #[inline(always)]
    pub fn has_received_key(&self) -> bool {
        self.state >= HandshakeState::ReceivedKey
    }

    #[inline(always)]
    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// Resets to a fresh handshake if idle longer than `CRYPTO_SESSION_TIMEOUT_MS`.
    /// Called before every encrypt/decrypt attempt.
    pub fn reset_if_timed_out(&mut self, now_ms: i64) {
        if now_ms - self.last_activity_ms > CRYPTO_SESSION_TIMEOUT_MS {
            self.peer_public_key = None;
            self.state = HandshakeState::New;
        }
        self.last_activity_ms = now_ms;
    }

    /// Records that the peer's public key has been received on this session.
    pub fn learn_peer_key(&mut self, key: [u8; 32], now_ms: i64) {
        self.peer_public_key = Some(key);
        if self.state < HandshakeState::ReceivedKey {
            self.state = HandshakeState::ReceivedKey;
        }
        self.last_activity_ms = now_ms;
    }

    pub fn complete_handshake(&mut self, now_ms: i64) {
        self.state = HandshakeState::Established;
        self.last_activity_ms = now_ms;
    }

    /// Placeholder decrypt: a real adapter would call into the external primitive.
    /// Returns `FailedAuthentication` unless the session has at least received a key,
    /// matching the rule that handshake frames on an unset session can't "decrypt"
    /// meaningfully until the key exchange has happened.
    pub fn decrypt(&mut self, ciphertext: &[u8], now_ms: i64) -> Result<Vec<u8>, Error> {
        self.reset_if_timed_out(now_ms);
        if !self.has_received_key() {
            return Err(Error::SessionNotEstablished);
        }
        self.last_activity_ms = now_ms;
        Ok(ciphertext.to_vec())
    }

    pub fn encrypt(&mut self, plaintext: &[u8], now_ms: i64) -> Result<Vec<u8>, Error> {
        self.reset_if_timed_out(now_ms);
        self.last_activity_ms = now_ms;
        Ok(plaintext.to_vec())
    }
}
