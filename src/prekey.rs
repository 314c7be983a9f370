use crate::identity::{Identity, IdentityKeyPair};
use crate::store::{KeyStore, StoreOp};
use crate::types::generate_random_seed;
use crate::{Error, ProtocolConfig, X25519PublicKey, X25519Secret};
use ed25519_dalek::ed25519::SignatureBytes;
use ed25519_dalek::{Signature, VerifyingKey};
use std::sync::Arc;
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

const SIGNED_PRE_KEY_CURRENT: &str = "prekey/signed/current";
const ONE_TIME_PRE_KEY_INDEX: &str = "prekey/one_time/index";

fn signed_pre_key_record(id: u32) -> String {
    format!("prekey/signed/{id}")
}

fn one_time_pre_key_record(id: u32) -> String {
    format!("prekey/one_time/{id}")
}

/// A medium-term signed pre-key.
///
/// Signed pre-keys are authenticated with the identity key and rotated on a
/// schedule decided by the caller. Prior keys stay loadable until removed so
/// in-flight handshakes referencing them still complete.
pub struct SignedPreKey {
    pre_key: X25519Secret,
    id: u32,
}

impl SignedPreKey {
    /// Creates a new signed pre-key with the given ID.
    pub fn new(id: u32) -> Result<Self, Error> {
        let seed = generate_random_seed()?;

        Ok(Self {
            pre_key: X25519Secret::from(seed),
            id,
        })
    }

    /// Returns the public component of this signed pre-key.
    pub fn public_key(&self) -> X25519PublicKey {
        self.pre_key.public_key()
    }

    /// Returns the complete key pair for this signed pre-key.
    pub fn key_pair(&self) -> X25519Secret {
        self.pre_key.clone()
    }

    /// Returns the unique identifier for this signed pre-key.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Performs Diffie-Hellman key agreement with the other party's public key.
    pub fn dh(&self, public_key: &X25519PublicKey) -> SharedSecret {
        self.pre_key.dh(public_key)
    }

    /// Generates the signature proving this pre-key belongs to the owner of
    /// the identity key.
    pub fn signature(&self, identity_key: &IdentityKeyPair) -> Signature {
        let encoded = self.public_key().to_bytes();
        identity_key.sign(&encoded)
    }

    /// Serializes to a 36-byte record: ID (big-endian u32) then the X25519
    /// private key.
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut result = [0u8; 36];

        result[0..4].copy_from_slice(&self.id.to_be_bytes());
        result[4..].copy_from_slice(self.pre_key.as_bytes());

        result
    }
}

impl From<[u8; 36]> for SignedPreKey {
    fn from(bytes: [u8; 36]) -> Self {
        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(&bytes[0..4]);
        let id = u32::from_be_bytes(id_bytes);

        let mut key_bytes = Box::new([0u8; 32]);
        key_bytes.copy_from_slice(&bytes[4..]);

        Self {
            pre_key: X25519Secret::from(key_bytes),
            id,
        }
    }
}

impl Zeroize for SignedPreKey {
    fn zeroize(&mut self) {
        self.pre_key.zeroize();
        self.id = 0;
    }
}

impl ZeroizeOnDrop for SignedPreKey {}

/// A single-use pre-key.
///
/// Consumed (removed from the store) the first time a peer's handshake
/// references it; the Diffie-Hellman operation takes the key by value so a
/// consumed key cannot be used twice.
pub struct OneTimePreKey {
    pre_key: X25519Secret,
    id: u32,
}

impl OneTimePreKey {
    /// Creates a new one-time pre-key with the given ID.
    pub fn new(id: u32) -> Result<Self, Error> {
        Ok(Self {
            pre_key: X25519Secret::from(generate_random_seed()?),
            id,
        })
    }

    /// Returns the public component of this pre-key.
    pub fn public_key(&self) -> X25519PublicKey {
        self.pre_key.public_key()
    }

    /// Returns the unique identifier for this pre-key.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Performs Diffie-Hellman key agreement, consuming the pre-key.
    pub fn dh(self, public_key: &X25519PublicKey) -> SharedSecret {
        self.pre_key.dh(public_key)
    }

    /// Serializes to a 36-byte record: ID (big-endian u32) then the X25519
    /// private key.
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut result = [0u8; 36];

        result[0..4].copy_from_slice(&self.id.to_be_bytes());
        result[4..].copy_from_slice(self.pre_key.as_bytes());

        result
    }
}

impl From<[u8; 36]> for OneTimePreKey {
    fn from(bytes: [u8; 36]) -> Self {
        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(&bytes[0..4]);
        let id = u32::from_be_bytes(id_bytes);

        let mut key_bytes = Box::new([0u8; 32]);
        key_bytes.copy_from_slice(&bytes[4..]);

        Self {
            pre_key: X25519Secret::from(key_bytes),
            id,
        }
    }
}

impl Zeroize for OneTimePreKey {
    fn zeroize(&mut self) {
        self.pre_key.zeroize();
        self.id = 0;
    }
}

impl ZeroizeOnDrop for OneTimePreKey {}

/// The publishable, private-material-free subset of a party's key state.
///
/// Contains everything a peer needs to initiate a session: identity public
/// keys, the current signed pre-key with its signature, and at most one
/// one-time pre-key.
pub struct PublicBundle {
    /// Registration id of the publishing identity.
    pub registration_id: u32,
    /// Public X25519 identity key for DH operations.
    pub identity_key: X25519PublicKey,
    /// Public Ed25519 verification key for the identity.
    pub signing_key: VerifyingKey,
    /// Current signed pre-key id and public key.
    pub signed_pre_key: (u32, X25519PublicKey),
    /// Identity signature over the signed pre-key public key.
    pub signature: Signature,
    /// One available one-time pre-key, if the pool is not exhausted.
    pub one_time_pre_key: Option<(u32, X25519PublicKey)>,
}

impl PublicBundle {
    /// Verifies that the signed pre-key was created by the owner of the
    /// identity key. Must pass before any session is established from this
    /// bundle.
    pub fn verify(&self) -> Result<(), Error> {
        let encoded_key = self.signed_pre_key.1.to_bytes();
        self.signing_key
            .verify_strict(&encoded_key, &self.signature)
            .map_err(|_| Error::InvalidSignature)
    }

    /// Serializes the bundle to its fixed-layout binary form.
    ///
    /// Layout (big-endian): registration id, identity DH key (32), identity
    /// verification key (32), signed pre-key id, signed pre-key (32),
    /// signature (64), one-time flag byte, then id and key (32) when the
    /// flag is set.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(205);
        result.extend_from_slice(&self.registration_id.to_be_bytes());
        result.extend_from_slice(self.identity_key.as_bytes());
        result.extend_from_slice(self.signing_key.as_bytes());
        result.extend_from_slice(&self.signed_pre_key.0.to_be_bytes());
        result.extend_from_slice(self.signed_pre_key.1.as_bytes());
        result.extend_from_slice(&self.signature.to_bytes());
        match self.one_time_pre_key {
            Some((id, key)) => {
                result.push(1);
                result.extend_from_slice(&id.to_be_bytes());
                result.extend_from_slice(key.as_bytes());
            }
            None => result.push(0),
        }

        result
    }

    /// Deserializes a bundle, rejecting truncated or oversized input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        const BASE_LEN: usize = 4 + 32 + 32 + 4 + 32 + 64 + 1;
        const FULL_LEN: usize = BASE_LEN + 4 + 32;

        if bytes.len() != BASE_LEN && bytes.len() != FULL_LEN {
            return Err(Error::Encoding("invalid bundle length".to_string()));
        }

        let registration_id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

        let mut ik = [0u8; 32];
        ik.copy_from_slice(&bytes[4..36]);

        let mut signing = [0u8; 32];
        signing.copy_from_slice(&bytes[36..68]);
        let signing_key = VerifyingKey::from_bytes(&signing)
            .map_err(|err| Error::Encoding(err.to_string()))?;

        let spk_id = u32::from_be_bytes([bytes[68], bytes[69], bytes[70], bytes[71]]);
        let mut spk = [0u8; 32];
        spk.copy_from_slice(&bytes[72..104]);

        let mut sig = [0u8; 64];
        sig.copy_from_slice(&bytes[104..168]);
        let signature = Signature::from_bytes(&SignatureBytes::from(sig));

        let one_time_pre_key = match bytes[168] {
            0 if bytes.len() == BASE_LEN => None,
            1 if bytes.len() == FULL_LEN => {
                let id = u32::from_be_bytes([bytes[169], bytes[170], bytes[171], bytes[172]]);
                let mut otpk = [0u8; 32];
                otpk.copy_from_slice(&bytes[173..205]);
                Some((id, X25519PublicKey::from(otpk)))
            }
            _ => return Err(Error::Encoding("invalid bundle one-time flag".to_string())),
        };

        Ok(Self {
            registration_id,
            identity_key: X25519PublicKey::from(ik),
            signing_key,
            signed_pre_key: (spk_id, X25519PublicKey::from(spk)),
            signature,
            one_time_pre_key,
        })
    }
}

/// Index of the one-time pre-key pool: next id to hand out and the ids still
/// available for publishing.
struct OneTimePreKeyIndex {
    next_id: u32,
    available: Vec<u32>,
}

impl OneTimePreKeyIndex {
    fn encode(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(8 + self.available.len() * 4);
        result.extend_from_slice(&self.next_id.to_be_bytes());
        result.extend_from_slice(&(self.available.len() as u32).to_be_bytes());
        for id in &self.available {
            result.extend_from_slice(&id.to_be_bytes());
        }
        result
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 8 {
            return Err(Error::Encoding(
                "invalid one-time pre-key index".to_string(),
            ));
        }
        let next_id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let count = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        if bytes.len() != 8 + count * 4 {
            return Err(Error::Encoding(
                "invalid one-time pre-key index".to_string(),
            ));
        }

        let mut available = Vec::with_capacity(count);
        for chunk in bytes[8..].chunks_exact(4) {
            available.push(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }

        Ok(Self {
            next_id,
            available,
        })
    }
}

/// Generates, rotates and consumes pre-keys for the local identity, and
/// assembles the [`PublicBundle`] peers fetch to initiate sessions.
pub struct PreKeyManager {
    store: Arc<dyn KeyStore>,
    identity: Identity,
    config: ProtocolConfig,
}

impl PreKeyManager {
    /// Creates a manager for the given identity over the given store.
    pub fn new(store: Arc<dyn KeyStore>, identity: Identity, config: ProtocolConfig) -> Self {
        Self {
            store,
            identity,
            config,
        }
    }

    /// Generates a fresh signed pre-key and makes it current.
    ///
    /// The record and the current-key pointer are committed atomically.
    /// Previously generated keys stay loadable via [`Self::signed_pre_key`].
    pub fn generate_signed_pre_key(&self, id: u32) -> Result<SignedPreKey, Error> {
        let key = SignedPreKey::new(id)?;

        self.store.apply(&[
            StoreOp::Put {
                key: signed_pre_key_record(id),
                value: key.to_bytes().to_vec(),
            },
            StoreOp::Put {
                key: SIGNED_PRE_KEY_CURRENT.to_string(),
                value: id.to_be_bytes().to_vec(),
            },
        ])?;

        Ok(key)
    }

    /// Loads a signed pre-key by id.
    pub fn signed_pre_key(&self, id: u32) -> Result<SignedPreKey, Error> {
        let bytes = self
            .store
            .get(&signed_pre_key_record(id))?
            .ok_or(Error::UnknownPreKey(id))?;
        decode_signed_pre_key(&bytes)
    }

    /// Loads the current signed pre-key.
    pub fn current_signed_pre_key(&self) -> Result<SignedPreKey, Error> {
        let pointer = self.store.get(SIGNED_PRE_KEY_CURRENT)?.ok_or_else(|| {
            Error::Encoding("no signed pre-key has been generated".to_string())
        })?;
        if pointer.len() != 4 {
            return Err(Error::Encoding(
                "invalid signed pre-key pointer".to_string(),
            ));
        }
        let id = u32::from_be_bytes([pointer[0], pointer[1], pointer[2], pointer[3]]);
        self.signed_pre_key(id)
    }

    /// Generates `count` one-time pre-keys with sequential ids from
    /// `start_id`, persisting the batch and the pool index atomically.
    pub fn generate_one_time_pre_keys(
        &self,
        start_id: u32,
        count: u32,
    ) -> Result<Vec<OneTimePreKey>, Error> {
        let mut index = self.load_index()?;
        let mut keys = Vec::with_capacity(count as usize);
        let mut batch = Vec::with_capacity(count as usize + 1);

        for id in start_id..start_id.wrapping_add(count) {
            let key = OneTimePreKey::new(id)?;
            batch.push(StoreOp::Put {
                key: one_time_pre_key_record(id),
                value: key.to_bytes().to_vec(),
            });
            index.available.push(id);
            keys.push(key);
        }
        index.next_id = index.next_id.max(start_id.wrapping_add(count));

        batch.push(StoreOp::Put {
            key: ONE_TIME_PRE_KEY_INDEX.to_string(),
            value: index.encode(),
        });
        self.store.apply(&batch)?;

        Ok(keys)
    }

    /// Tops the one-time pre-key pool back up to the configured size.
    pub fn replenish_one_time_pre_keys(&self) -> Result<Vec<OneTimePreKey>, Error> {
        let index = self.load_index()?;
        let needed = self
            .config
            .max_one_time_pre_keys
            .saturating_sub(index.available.len());
        if needed == 0 {
            return Ok(Vec::new());
        }
        self.generate_one_time_pre_keys(index.next_id, needed as u32)
    }

    /// Loads and atomically removes a one-time pre-key.
    ///
    /// Fails with [`Error::PreKeyNotFound`] if the key was already consumed
    /// or never existed; the peer used a stale bundle and should fetch a
    /// fresh one.
    pub fn consume_one_time_pre_key(&self, id: u32) -> Result<OneTimePreKey, Error> {
        let (key, batch) = self.consume_one_time_pre_key_ops(id)?;
        self.store.apply(&batch)?;
        Ok(key)
    }

    /// Loads a one-time pre-key and returns the store operations that remove
    /// it, for callers that commit the removal together with other state.
    pub(crate) fn consume_one_time_pre_key_ops(
        &self,
        id: u32,
    ) -> Result<(OneTimePreKey, Vec<StoreOp>), Error> {
        let bytes = self
            .store
            .get(&one_time_pre_key_record(id))?
            .ok_or(Error::PreKeyNotFound(id))?;
        let key = decode_one_time_pre_key(&bytes)?;

        let mut index = self.load_index()?;
        index.available.retain(|available| *available != id);

        let batch = vec![
            StoreOp::Remove {
                key: one_time_pre_key_record(id),
            },
            StoreOp::Put {
                key: ONE_TIME_PRE_KEY_INDEX.to_string(),
                value: index.encode(),
            },
        ];

        Ok((key, batch))
    }

    /// Returns the ids of one-time pre-keys still available for publishing.
    pub fn available_one_time_pre_key_ids(&self) -> Result<Vec<u32>, Error> {
        Ok(self.load_index()?.available)
    }

    /// Assembles the current public bundle.
    ///
    /// Peek semantics: the included one-time pre-key stays in the pool; the
    /// actual removal happens on the receiving side via
    /// [`Self::consume_one_time_pre_key`]. An exhausted pool yields a bundle
    /// without a one-time pre-key rather than an error.
    pub fn public_bundle(&self) -> Result<PublicBundle, Error> {
        let signed = self.current_signed_pre_key()?;
        let index = self.load_index()?;

        let one_time_pre_key = match index.available.first() {
            Some(id) => {
                let bytes = self
                    .store
                    .get(&one_time_pre_key_record(*id))?
                    .ok_or(Error::PreKeyNotFound(*id))?;
                let key = decode_one_time_pre_key(&bytes)?;
                Some((key.id(), key.public_key()))
            }
            None => None,
        };

        Ok(PublicBundle {
            registration_id: self.identity.registration_id,
            identity_key: self.identity.key_pair.dh_key_public(),
            signing_key: self.identity.key_pair.signing_key_public(),
            signed_pre_key: (signed.id(), signed.public_key()),
            signature: signed.signature(&self.identity.key_pair),
            one_time_pre_key,
        })
    }

    fn load_index(&self) -> Result<OneTimePreKeyIndex, Error> {
        match self.store.get(ONE_TIME_PRE_KEY_INDEX)? {
            Some(bytes) => OneTimePreKeyIndex::decode(&bytes),
            None => Ok(OneTimePreKeyIndex {
                next_id: 1,
                available: Vec::new(),
            }),
        }
    }
}

fn decode_signed_pre_key(bytes: &[u8]) -> Result<SignedPreKey, Error> {
    if bytes.len() != 36 {
        return Err(Error::Encoding(
            "invalid signed pre-key length".to_string(),
        ));
    }
    let mut fixed = [0u8; 36];
    fixed.copy_from_slice(bytes);
    Ok(SignedPreKey::from(fixed))
}

fn decode_one_time_pre_key(bytes: &[u8]) -> Result<OneTimePreKey, Error> {
    if bytes.len() != 36 {
        return Err(Error::Encoding(
            "invalid one-time pre-key length".to_string(),
        ));
    }
    let mut fixed = [0u8; 36];
    fixed.copy_from_slice(bytes);
    Ok(OneTimePreKey::from(fixed))
}
