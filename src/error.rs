/// Errors that can occur during messaging core operations.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// The underlying key store failed. The operation was aborted and no
    /// partial state was written.
    #[error("Key store operation failed: {0}")]
    Storage(String),

    /// A pre-key bundle's signed pre-key failed signature verification.
    #[error("Signed pre-key signature verification failed")]
    InvalidSignature,

    /// A one-time pre-key was already consumed or never existed.
    #[error("One-time pre-key {0} not found")]
    PreKeyNotFound(u32),

    /// A signed pre-key referenced by a handshake is unknown or expired.
    #[error("Signed pre-key {0} not found")]
    UnknownPreKey(u32),

    /// The receiving chain gap exceeds the configured skip limit.
    #[error("Receiving chain gap {gap} exceeds limit {limit}")]
    TooManySkippedMessages {
        /// Number of messages that would have to be skipped.
        gap: u32,
        /// Configured maximum skip distance.
        limit: u32,
    },

    /// The message key for this envelope was already consumed.
    #[error("Message key already consumed")]
    ReplayedMessage,

    /// AEAD authentication failed for a single envelope.
    #[error("Message decryption failed")]
    DecryptionFailed,

    /// The peer presented an identity key that differs from the one recorded
    /// at first use.
    #[error("Peer identity key changed since first use")]
    IdentityKeyChanged,

    /// A cryptographic operation failed.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// Random number generation failed.
    #[error("Random number generation failed")]
    Random,

    /// Wire or persistence encoding/decoding failed.
    #[error("Encoding/decoding failed: {0}")]
    Encoding(String),
}
