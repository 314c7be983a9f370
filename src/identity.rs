use crate::store::{KeyStore, StoreOp};
use crate::types::generate_random_seed;
use crate::{Error, X25519PublicKey, X25519Secret};
use ed25519_dalek::{SecretKey, SigningKey, Signer, ed25519};
use rand::Rng;
use std::sync::Arc;
use x25519_dalek::SharedSecret;
use zeroize::Zeroize;

pub(crate) const IDENTITY_KEY_PAIR: &str = "identity/key_pair";
pub(crate) const REGISTRATION_ID: &str = "identity/registration_id";

/// Registration ids are uniform in `[1, 16384)`.
const REGISTRATION_ID_MAX: u32 = 16384;

/// Long-term identity key pair combining signing and key agreement.
///
/// Contains an Ed25519 signing key for pre-key authentication and an X25519
/// key for Diffie-Hellman, both derived from the same 32-byte seed. Created
/// once at account provisioning and never rotated.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: Box<SigningKey>,
    dh_key: X25519Secret,
}

impl IdentityKeyPair {
    /// Creates a new identity key pair with a randomly generated seed.
    pub fn generate() -> Result<Self, Error> {
        let seed = generate_random_seed()?;
        let signing_key = Box::new(SigningKey::from(SecretKey::from(*seed)));
        let dh_key = X25519Secret::from(seed);

        Ok(Self {
            signing_key,
            dh_key,
        })
    }

    /// Signs a message using the Ed25519 signing key.
    pub fn sign(&self, message: &[u8]) -> ed25519::Signature {
        self.signing_key.sign(message)
    }

    /// Returns the public Ed25519 verification key for this identity.
    pub fn signing_key_public(&self) -> ed25519_dalek::VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Returns the public X25519 key for Diffie-Hellman operations.
    pub fn dh_key_public(&self) -> X25519PublicKey {
        self.dh_key.public_key()
    }

    /// Performs Diffie-Hellman key agreement with another party's public key.
    pub fn dh(&self, public_key: &X25519PublicKey) -> SharedSecret {
        self.dh_key.dh(public_key)
    }

    /// Serializes the identity key pair to a 64-byte array: Ed25519 seed
    /// followed by X25519 secret.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[0..32].copy_from_slice(self.signing_key.as_bytes().as_slice());
        bytes[32..64].copy_from_slice(self.dh_key.as_bytes());

        bytes
    }
}

impl From<[u8; 64]> for IdentityKeyPair {
    fn from(bytes: [u8; 64]) -> Self {
        let mut private_sk_bytes = Box::new([0u8; 32]);
        private_sk_bytes.copy_from_slice(&bytes[0..32]);
        let signing_key_private = SecretKey::from(*private_sk_bytes);
        let signing_key = Box::new(SigningKey::from_bytes(&signing_key_private));

        private_sk_bytes.zeroize();

        let mut private_dh_bytes = Box::new([0u8; 32]);
        private_dh_bytes.copy_from_slice(&bytes[32..64]);
        let dh_key = X25519Secret::from(private_dh_bytes);

        Self {
            signing_key,
            dh_key,
        }
    }
}

/// The provisioned local identity: key pair plus registration id.
#[derive(Clone)]
pub struct Identity {
    /// The long-term identity key pair.
    pub key_pair: IdentityKeyPair,
    /// Random tag for this identity's key generation epoch, in `[1, 16384)`.
    pub registration_id: u32,
}

/// Generates and owns the long-term identity state for the local party.
pub struct IdentityKeyManager {
    store: Arc<dyn KeyStore>,
}

impl IdentityKeyManager {
    /// Creates a manager over the given key store.
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    /// Loads the local identity, creating and persisting one if none exists.
    ///
    /// Idempotent: repeated calls return the same identity. The key pair and
    /// registration id are committed in a single atomic batch so a storage
    /// failure can never provision half an identity.
    pub fn ensure_identity(&self) -> Result<Identity, Error> {
        if let Some(bytes) = self.store.get(IDENTITY_KEY_PAIR)? {
            let key_pair = decode_key_pair(&bytes)?;
            let registration_id = match self.store.get(REGISTRATION_ID)? {
                Some(reg_bytes) => decode_registration_id(&reg_bytes)?,
                None => {
                    return Err(Error::Encoding(
                        "identity key pair present without registration id".to_string(),
                    ));
                }
            };

            return Ok(Identity {
                key_pair,
                registration_id,
            });
        }

        let key_pair = IdentityKeyPair::generate()?;
        let registration_id = rand::rng().random_range(1..REGISTRATION_ID_MAX);

        self.store.apply(&[
            StoreOp::Put {
                key: IDENTITY_KEY_PAIR.to_string(),
                value: key_pair.to_bytes().to_vec(),
            },
            StoreOp::Put {
                key: REGISTRATION_ID.to_string(),
                value: registration_id.to_be_bytes().to_vec(),
            },
        ])?;

        Ok(Identity {
            key_pair,
            registration_id,
        })
    }
}

fn decode_key_pair(bytes: &[u8]) -> Result<IdentityKeyPair, Error> {
    if bytes.len() != 64 {
        return Err(Error::Encoding("invalid identity key length".to_string()));
    }
    let mut fixed = [0u8; 64];
    fixed.copy_from_slice(bytes);
    Ok(IdentityKeyPair::from(fixed))
}

fn decode_registration_id(bytes: &[u8]) -> Result<u32, Error> {
    if bytes.len() != 4 {
        return Err(Error::Encoding(
            "invalid registration id length".to_string(),
        ));
    }
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
