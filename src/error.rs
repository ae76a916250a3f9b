use thiserror::Error;

/// Errors surfaced while classifying or decrypting an inbound datagram.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet shorter than the minimum tag length")]
    Truncated,
    #[error("rlp decoding failed: {0}")]
    Rlp(#[from] rlp::DecoderError),
    #[error("no session installed for this sender")]
    NoSession,
    #[error("aes-gcm open failed")]
    Decrypt,
    #[error("decoded payload does not match a known message kind")]
    UnsupportedPacketType,
}

/// Errors from the session/handshake crypto layer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("ecdh failed: {0}")]
    Ecdh(String),
    #[error("hkdf expand failed")]
    Hkdf,
    #[error("id-nonce signature is invalid")]
    BadIdSignature,
    #[error(transparent)]
    Secp256k1(#[from] secp256k1::Error),
}

/// Errors from drawing bytes off the injected random source.
#[derive(Debug, Error)]
#[error("random source exhausted")]
pub struct RandomnessError;

/// Top-level error returned by the public engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Randomness(#[from] RandomnessError),
    #[error("the engine has already been closed")]
    Closed,
    #[error("operation timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
