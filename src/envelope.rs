use crate::{Error, X25519PublicKey};

const HANDSHAKE_TAG: u8 = 0x01;
const RATCHET_TAG: u8 = 0x02;

/// A session-establishing envelope.
///
/// Carries the identifiers the responder needs to replay the initiator's
/// X3DH computation, plus the first ratchet message as its payload: the
/// handshake is never empty, a data-free handshake encrypts an empty string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeEnvelope {
    /// Initiator's registration id.
    pub registration_id: u32,
    /// Initiator's public X25519 identity key.
    pub identity_key: X25519PublicKey,
    /// Initiator's ephemeral base key from the X3DH agreement.
    pub base_key: X25519PublicKey,
    /// Id of the responder's signed pre-key used in the agreement.
    pub signed_pre_key_id: u32,
    /// Id of the responder's one-time pre-key, when one was published.
    pub one_time_pre_key_id: Option<u32>,
    /// Encoded [`RatchetEnvelope`] holding the first message.
    pub inner: Vec<u8>,
}

/// An ordinary ratchet message envelope.
///
/// The header fields travel in the clear but are bound to the ciphertext as
/// AEAD associated data; tampering with any of them fails decryption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetEnvelope {
    /// Sender's current ratchet public key.
    pub ratchet_key: X25519PublicKey,
    /// Index of this message within the sender's current chain.
    pub message_number: u32,
    /// Length of the sender's previous sending chain.
    pub previous_chain_length: u32,
    /// AEAD ciphertext.
    pub ciphertext: Vec<u8>,
}

impl RatchetEnvelope {
    /// Returns the 40-byte header exactly as it is authenticated: ratchet
    /// key, previous chain length, message number (big-endian).
    pub(crate) fn header_bytes(&self) -> [u8; 40] {
        ratchet_header(
            &self.ratchet_key,
            self.previous_chain_length,
            self.message_number,
        )
    }
}

pub(crate) fn ratchet_header(
    ratchet_key: &X25519PublicKey,
    previous_chain_length: u32,
    message_number: u32,
) -> [u8; 40] {
    let mut bytes = [0u8; 40];
    bytes[0..32].copy_from_slice(ratchet_key.as_bytes());
    bytes[32..36].copy_from_slice(&previous_chain_length.to_be_bytes());
    bytes[36..40].copy_from_slice(&message_number.to_be_bytes());

    bytes
}

/// The wire unit exchanged between peers.
///
/// The discriminant is the first byte so a decoder can dispatch without
/// ambiguity. All integers are fixed-width big-endian; key material is
/// fixed 32-byte fields; variable-length fields are length-prefixed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    /// First message of a session, carrying the handshake.
    Handshake(HandshakeEnvelope),
    /// Ordinary ratchet message.
    Ratchet(RatchetEnvelope),
}

impl Envelope {
    /// Serializes the envelope for transmission.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Handshake(handshake) => {
                let mut result = Vec::with_capacity(82 + handshake.inner.len());
                result.push(HANDSHAKE_TAG);
                result.extend_from_slice(&handshake.registration_id.to_be_bytes());
                result.extend_from_slice(handshake.identity_key.as_bytes());
                result.extend_from_slice(handshake.base_key.as_bytes());
                result.extend_from_slice(&handshake.signed_pre_key_id.to_be_bytes());
                match handshake.one_time_pre_key_id {
                    Some(id) => {
                        result.push(1);
                        result.extend_from_slice(&id.to_be_bytes());
                    }
                    None => result.push(0),
                }
                result.extend_from_slice(&(handshake.inner.len() as u32).to_be_bytes());
                result.extend_from_slice(&handshake.inner);

                result
            }
            Self::Ratchet(message) => {
                let mut result = Vec::with_capacity(45 + message.ciphertext.len());
                result.push(RATCHET_TAG);
                result.extend_from_slice(message.ratchet_key.as_bytes());
                result.extend_from_slice(&message.message_number.to_be_bytes());
                result.extend_from_slice(&message.previous_chain_length.to_be_bytes());
                result.extend_from_slice(&(message.ciphertext.len() as u32).to_be_bytes());
                result.extend_from_slice(&message.ciphertext);

                result
            }
        }
    }

    /// Deserializes an envelope, rejecting truncated input and trailing
    /// bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);

        let envelope = match reader.read_u8()? {
            HANDSHAKE_TAG => {
                let registration_id = reader.read_u32()?;
                let identity_key = X25519PublicKey::from(reader.read_key()?);
                let base_key = X25519PublicKey::from(reader.read_key()?);
                let signed_pre_key_id = reader.read_u32()?;
                let one_time_pre_key_id = match reader.read_u8()? {
                    0 => None,
                    1 => Some(reader.read_u32()?),
                    _ => {
                        return Err(Error::Encoding(
                            "invalid one-time pre-key flag".to_string(),
                        ));
                    }
                };
                let inner = reader.read_prefixed()?;

                Self::Handshake(HandshakeEnvelope {
                    registration_id,
                    identity_key,
                    base_key,
                    signed_pre_key_id,
                    one_time_pre_key_id,
                    inner,
                })
            }
            RATCHET_TAG => {
                let ratchet_key = X25519PublicKey::from(reader.read_key()?);
                let message_number = reader.read_u32()?;
                let previous_chain_length = reader.read_u32()?;
                let ciphertext = reader.read_prefixed()?;

                Self::Ratchet(RatchetEnvelope {
                    ratchet_key,
                    message_number,
                    previous_chain_length,
                    ciphertext,
                })
            }
            tag => {
                return Err(Error::Encoding(format!("unknown envelope tag {tag:#04x}")));
            }
        };

        reader.finish()?;
        Ok(envelope)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: 0,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| Error::Encoding("truncated envelope".to_string()))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_key(&mut self) -> Result<[u8; 32], Error> {
        let bytes = self.take(32)?;
        let mut key = [0u8; 32];
        key.copy_from_slice(bytes);
        Ok(key)
    }

    fn read_prefixed(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn finish(self) -> Result<(), Error> {
        if self.offset != self.bytes.len() {
            return Err(Error::Encoding(
                "trailing bytes after envelope".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ratchet_envelope() -> Envelope {
        Envelope::Ratchet(RatchetEnvelope {
            ratchet_key: X25519PublicKey::from([7u8; 32]),
            message_number: 3,
            previous_chain_length: 11,
            ciphertext: vec![1, 2, 3, 4, 5],
        })
    }

    fn handshake_envelope(one_time: Option<u32>) -> Envelope {
        Envelope::Handshake(HandshakeEnvelope {
            registration_id: 12001,
            identity_key: X25519PublicKey::from([9u8; 32]),
            base_key: X25519PublicKey::from([4u8; 32]),
            signed_pre_key_id: 2,
            one_time_pre_key_id: one_time,
            inner: ratchet_envelope().encode(),
        })
    }

    #[test]
    fn test_ratchet_roundtrip() {
        let envelope = ratchet_envelope();
        assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);
    }

    #[test]
    fn test_handshake_roundtrip() {
        for one_time in [Some(17), None] {
            let envelope = handshake_envelope(one_time);
            assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);
        }
    }

    #[test]
    fn test_discriminant_is_first_byte() {
        assert_eq!(handshake_envelope(None).encode()[0], 0x01);
        assert_eq!(ratchet_envelope().encode()[0], 0x02);
    }

    #[test]
    fn test_decode_rejects_empty_and_unknown_tag() {
        assert!(Envelope::decode(&[]).is_err());
        assert!(Envelope::decode(&[0x7f, 0, 0]).is_err());
    }

    #[test]
    fn test_decode_rejects_truncation_and_trailing_bytes() {
        let bytes = ratchet_envelope().encode();

        for len in 0..bytes.len() {
            assert!(Envelope::decode(&bytes[..len]).is_err());
        }

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(Envelope::decode(&padded).is_err());
    }

    proptest! {
        #[test]
        fn prop_ratchet_roundtrip(
            key in prop::array::uniform32(any::<u8>()),
            message_number in any::<u32>(),
            previous_chain_length in any::<u32>(),
            ciphertext in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let envelope = Envelope::Ratchet(RatchetEnvelope {
                ratchet_key: X25519PublicKey::from(key),
                message_number,
                previous_chain_length,
                ciphertext,
            });
            prop_assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);
        }

        #[test]
        fn prop_handshake_roundtrip(
            registration_id in 1u32..16384,
            identity in prop::array::uniform32(any::<u8>()),
            base in prop::array::uniform32(any::<u8>()),
            signed_pre_key_id in any::<u32>(),
            one_time_pre_key_id in prop::option::of(any::<u32>()),
            inner in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let envelope = Envelope::Handshake(HandshakeEnvelope {
                registration_id,
                identity_key: X25519PublicKey::from(identity),
                base_key: X25519PublicKey::from(base),
                signed_pre_key_id,
                one_time_pre_key_id,
                inner,
            });
            prop_assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);
        }

        #[test]
        fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = Envelope::decode(&bytes);
        }
    }
}
