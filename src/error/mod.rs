use std::io;
use thiserror::Error;

/// Errors related to the lanscout discovery protocol.
///
/// Several `Display` strings double as protocol-visible text: they travel to
/// the peer inside error envelopes and are matched by embedders, so they are
/// part of the crate's contract.
#[derive(Debug, Error)]
pub enum LanscoutError {
    /// No interface on this host has the required capability
    #[error("no interface")]
    NoInterface,

    /// An interface was requested by name but does not exist
    #[error("none interface with this name")]
    InterfaceNotFound,

    /// The selected interface has no address that can host the requested role
    #[error("can't find an interface with the right capabilites")]
    CantFindInterface,

    /// Every candidate address on the interface was skipped
    #[error("no addresses capable for listen udp")]
    NoUsableAddress,

    /// An address is neither valid IPv4 nor valid IPv6
    #[error("invalid ip address")]
    InvalidIp,

    /// The discovery deadline elapsed without a completed handshake
    #[error("can't find the server")]
    ServerNotFound,

    /// The confirmation response carried a different session id
    #[error("protocol fail wrong response")]
    WrongResponse,

    /// The envelope sender is not the expected server
    #[error("wrong server name")]
    WrongServerName,

    /// The envelope is addressed to someone else
    #[error("message isn't for me")]
    NotForMe,

    /// No public key stored under this name
    #[error("key not found for this id")]
    KeyNotFound,

    /// A session context with this id already exists
    #[error("context already registered")]
    CtxAlreadyRegistered,

    /// No session context with this id
    #[error("context not found")]
    CtxNotFound,

    /// OAEP encryption of an envelope chunk failed
    #[error("can't encrypt message: {0}")]
    Encrypt(rsa::Error),

    /// OAEP decryption of an envelope chunk failed
    #[error("can't decrypt the message: {0}")]
    Decrypt(rsa::Error),

    /// PSS signing of an envelope chunk failed
    #[error("can't sign the message: {0}")]
    Sign(rsa::signature::Error),

    /// A chunk signature did not verify
    #[error("can't verify the signature: {0}")]
    Verify(rsa::signature::Error),

    /// An encoded message does not fit the datagram buffer
    #[error("message is too big ({0} bytes)")]
    TooBig(usize),

    /// A UDP send or receive missed its per-operation deadline.
    /// Inside the client's discovery loop this is a retry signal.
    #[error("i/o timeout")]
    IoTimeout,

    /// Application-level protocol failure (malformed payload, callback refusal)
    #[error("{0}")]
    Protocol(String),

    /// Error text surfaced verbatim from a peer's error envelope
    #[error("{0}")]
    Remote(String),

    /// Serialization error
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Deserialization error
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, LanscoutError>;
