mod chain;
mod state;

use crate::envelope::{RatchetEnvelope, ratchet_header};
use crate::error::Error;
use crate::types::generate_random_seed;
use crate::x3dh::HandshakeSecret;
use crate::{X25519PublicKey, X25519Secret};
use aes_gcm_siv::aead::Aead;
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use hkdf::Hkdf;
pub(crate) use crate::ratchet::chain::Chain;
pub(crate) use crate::ratchet::state::RatchetState;
use sha2::Sha256;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_SIZE: usize = 12; // AES-GCM-SIV uses 12-byte (96-bit) nonces

thread_local! {
    static AD_BUFFER: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(256));
}

fn with_ad_buffer<F, R>(f: F) -> R
where
    F: FnOnce(&mut Vec<u8>) -> R,
{
    AD_BUFFER.with(|buffer| {
        let mut buffer = buffer.borrow_mut();
        buffer.clear();
        f(&mut buffer)
    })
}

/// The double-ratchet state machine for one established session.
///
/// Provides forward secrecy (compromise of current keys does not expose past
/// messages) and break-in recovery (a DH ratchet step heals a compromise).
/// It manages:
/// - A root key that evolves with each DH ratchet step
/// - Separate sending and receiving chain keys for message encryption
/// - A bounded cache of skipped message keys for out-of-order delivery
#[derive(Clone)]
pub struct DoubleRatchet {
    pub(crate) state: RatchetState,
    // Map<(ratchet_public, message_no): message_key>
    pub(crate) skipped_message_keys: HashMap<([u8; 32], u32), Box<[u8; 32]>>,
    // Insertion order of the cache, oldest first, for eviction
    pub(crate) skipped_order: VecDeque<([u8; 32], u32)>,
    pub(crate) max_skip: u32,
    pub(crate) max_cached: usize,
}

impl Zeroize for DoubleRatchet {
    fn zeroize(&mut self) {
        self.state.zeroize();
        for (_, mut key) in self.skipped_message_keys.drain() {
            key.zeroize();
        }
        self.skipped_order.clear();
    }
}

impl ZeroizeOnDrop for DoubleRatchet {}

impl DoubleRatchet {
    /// Get the current dh ratchet public key
    pub fn public_key(&self) -> X25519PublicKey {
        self.state.dh_pair.public_key()
    }

    /// Index of the next expected message on the receiving chain.
    pub fn receiving_message_number(&self) -> u32 {
        self.state.receiving_message_number
    }

    /// Initializes a ratchet on the initiator side, immediately performing
    /// the first DH step against the responder's signed pre-key so the
    /// sending chain is ready before any reply arrives.
    pub fn initialize_for_initiator(
        shared_secret: HandshakeSecret,
        remote_signed_pre_key: &X25519PublicKey,
        max_skip: u32,
        max_cached: usize,
        ad: Box<[u8; 64]>,
    ) -> Result<Self, Error> {
        let seed = generate_random_seed()?;
        let dh_pair = X25519Secret::from(seed);

        let dh_output = dh_pair.dh(remote_signed_pre_key);
        let (root_key, chain_key) = Self::kdf_root(&shared_secret.0, dh_output);

        Ok(Self {
            state: RatchetState {
                ad,
                root_key,
                dh_pair,
                remote_ratchet_key: Some(*remote_signed_pre_key),
                sending_chain: Chain::new(chain_key),
                receiving_chain: Chain::default(),
                previous_sending_chain_length: 0,
                sending_message_number: 0,
                receiving_message_number: 0,
            },
            skipped_message_keys: HashMap::new(),
            skipped_order: VecDeque::new(),
            max_skip,
            max_cached,
        })
    }

    /// Initializes a ratchet on the responder side. The receiving chain is
    /// populated lazily when the first inbound message triggers a DH step
    /// against the initiator's ratchet key.
    pub fn initialize_for_responder(
        shared_secret: HandshakeSecret,
        dh_pair: X25519Secret,
        max_skip: u32,
        max_cached: usize,
        ad: Box<[u8; 64]>,
    ) -> Self {
        Self {
            state: RatchetState {
                ad,
                root_key: shared_secret.0.clone(),
                dh_pair,
                remote_ratchet_key: None,
                sending_chain: Chain::default(),
                receiving_chain: Chain::default(),
                previous_sending_chain_length: 0,
                sending_message_number: 0,
                receiving_message_number: 0,
            },
            skipped_message_keys: HashMap::new(),
            skipped_order: VecDeque::new(),
            max_skip,
            max_cached,
        }
    }

    /// Key derivation for the root ratchet.
    ///
    /// # Returns
    ///
    /// A tuple containing:
    /// 1. The new root key
    /// 2. The new chain key
    fn kdf_root(
        root_key: &[u8; 32],
        mut dh_output: SharedSecret,
    ) -> (Box<[u8; 32]>, Box<[u8; 32]>) {
        let hkdf = Hkdf::<Sha256>::new(Some(root_key), dh_output.as_bytes());

        let mut new_root_key = Box::new([0u8; 32]);
        let mut chain_key = Box::new([0u8; 32]);

        hkdf.expand(b"Murmur-Ratchet-Root", new_root_key.as_mut_slice())
            .expect("HKDF output length is fixed and valid");
        hkdf.expand(b"Murmur-Ratchet-Chain", chain_key.as_mut_slice())
            .expect("HKDF output length is fixed and valid");

        dh_output.zeroize();

        (new_root_key, chain_key)
    }

    /// Encrypts a message, advancing the sending chain.
    ///
    /// The envelope header (ratchet key, chain position) travels in the
    /// clear but is bound to the ciphertext as associated data together with
    /// the session's identity binding.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetEnvelope, Error> {
        let ratchet_key = self.public_key();
        let header = ratchet_header(
            &ratchet_key,
            self.state.previous_sending_chain_length,
            self.state.sending_message_number,
        );

        let message_key = self.state.sending_chain.next();
        let ciphertext = with_ad_buffer(|buffer| {
            buffer.extend_from_slice(self.state.ad.as_slice());
            buffer.extend_from_slice(&header);
            Self::seal_message(&message_key, plaintext, buffer)
        })?;

        let envelope = RatchetEnvelope {
            ratchet_key,
            message_number: self.state.sending_message_number,
            previous_chain_length: self.state.previous_sending_chain_length,
            ciphertext,
        };

        self.state.sending_message_number = self.state.sending_message_number.wrapping_add(1);

        Ok(envelope)
    }

    /// Decrypts a message, advancing the receiving chain and performing a DH
    /// ratchet step when the envelope carries a new ratchet key.
    ///
    /// Any failure restores the ratchet to the state it had before the call.
    pub fn decrypt(&mut self, envelope: &RatchetEnvelope) -> Result<Vec<u8>, Error> {
        let cache_key = (envelope.ratchet_key.to_bytes(), envelope.message_number);

        if let Some(message_key) = self.skipped_message_keys.remove(&cache_key) {
            self.skipped_order.retain(|entry| entry != &cache_key);

            let plaintext = with_ad_buffer(|buffer| {
                buffer.extend_from_slice(self.state.ad.as_slice());
                buffer.extend_from_slice(&envelope.header_bytes());
                Self::open_message(&message_key, &envelope.ciphertext, buffer)
            });

            return match plaintext {
                Ok(plaintext) => Ok(plaintext),
                Err(err) => {
                    // The envelope was corrupted in transit; keep the key so
                    // the genuine message can still arrive.
                    self.skipped_message_keys.insert(cache_key, message_key);
                    self.skipped_order.push_back(cache_key);
                    Err(err)
                }
            };
        }

        let is_current_chain =
            self.state.remote_ratchet_key.as_ref() == Some(&envelope.ratchet_key);

        if is_current_chain && envelope.message_number < self.state.receiving_message_number {
            return Err(Error::ReplayedMessage);
        }

        let old_state = self.state.clone();
        let old_skipped = self.skipped_message_keys.clone();
        let old_order = self.skipped_order.clone();

        let result = self.decrypt_advancing(envelope, is_current_chain);
        if result.is_err() {
            self.state = old_state;
            self.skipped_message_keys = old_skipped;
            self.skipped_order = old_order;
        }

        result
    }

    fn decrypt_advancing(
        &mut self,
        envelope: &RatchetEnvelope,
        is_current_chain: bool,
    ) -> Result<Vec<u8>, Error> {
        if !is_current_chain {
            // Cache the remainder of the old chain, then rotate the keys
            self.skip_message_keys(envelope.previous_chain_length)?;
            self.dh_ratchet(&envelope.ratchet_key)?;
        }

        if envelope.message_number > self.state.receiving_message_number {
            self.skip_message_keys(envelope.message_number)?;
        }

        let message_key = self.state.receiving_chain.next();
        self.state.receiving_message_number =
            self.state.receiving_message_number.wrapping_add(1);

        with_ad_buffer(|buffer| {
            buffer.extend_from_slice(self.state.ad.as_slice());
            buffer.extend_from_slice(&envelope.header_bytes());
            Self::open_message(&message_key, &envelope.ciphertext, buffer)
        })
    }

    /// Performs a Diffie-Hellman ratchet step.
    fn dh_ratchet(&mut self, remote: &X25519PublicKey) -> Result<(), Error> {
        let seed = generate_random_seed()?;

        self.state.previous_sending_chain_length = self.state.sending_chain.index;
        self.state.remote_ratchet_key = Some(*remote);

        // Reset message counters
        self.state.receiving_message_number = 0;
        self.state.sending_message_number = 0;

        // Derive new receiving chain
        let dh_output = self.state.dh_pair.dh(remote);
        let (new_root_key, chain_key) = Self::kdf_root(&self.state.root_key, dh_output);
        self.state.root_key = new_root_key;
        self.state.receiving_chain = Chain::new(chain_key);

        // Generate new DH key pair
        self.state.dh_pair = X25519Secret::from(seed);

        // Derive new sending chain
        let dh_output = self.state.dh_pair.dh(remote);
        let (new_root_key, chain_key) = Self::kdf_root(&self.state.root_key, dh_output);
        self.state.root_key = new_root_key;
        self.state.sending_chain = Chain::new(chain_key);

        debug!("dh ratchet step completed");
        Ok(())
    }

    /// Walks the receiving chain up to `until`, caching the message keys of
    /// the skipped numbers for later out-of-order delivery.
    fn skip_message_keys(&mut self, until: u32) -> Result<(), Error> {
        if u64::from(self.state.receiving_message_number) + u64::from(self.max_skip)
            < u64::from(until)
        {
            return Err(Error::TooManySkippedMessages {
                gap: until - self.state.receiving_message_number,
                limit: self.max_skip,
            });
        }

        if self.state.receiving_chain.chain_key.as_ref() == &[0u8; 32] {
            return Ok(());
        }
        let Some(remote) = self.state.remote_ratchet_key else {
            return Ok(());
        };

        let remote_bytes = remote.to_bytes();
        while self.state.receiving_message_number < until {
            let message_key = self.state.receiving_chain.next();
            self.insert_skipped(
                (remote_bytes, self.state.receiving_message_number),
                message_key,
            );
            self.state.receiving_message_number =
                self.state.receiving_message_number.wrapping_add(1);
        }

        Ok(())
    }

    fn insert_skipped(&mut self, cache_key: ([u8; 32], u32), message_key: Box<[u8; 32]>) {
        self.skipped_message_keys.insert(cache_key, message_key);
        self.skipped_order.push_back(cache_key);

        while self.skipped_message_keys.len() > self.max_cached {
            let Some(oldest) = self.skipped_order.pop_front() else {
                break;
            };
            if let Some(mut dropped) = self.skipped_message_keys.remove(&oldest) {
                dropped.zeroize();
                warn!(
                    message_number = oldest.1,
                    "skipped-key cache full, evicting oldest message key"
                );
            }
        }
    }

    /// Encrypt with a single-use message key. The AES key and nonce are both
    /// derived from the message key, so the nonce is never reused for a key.
    fn seal_message(key: &[u8; 32], plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>, Error> {
        let (aes_key, nonce_bytes) = Self::derive_message_material(key);

        let cipher = Aes256GcmSiv::new(aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(&aes_key));
        let nonce = Nonce::from_slice(&nonce_bytes);

        cipher
            .encrypt(
                nonce,
                aes_gcm_siv::aead::Payload {
                    msg: plaintext,
                    aad: ad,
                },
            )
            .map_err(|_| Error::Crypto("message encryption failed".to_string()))
    }

    /// Decrypt with a single-use message key.
    fn open_message(key: &[u8; 32], ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>, Error> {
        let (aes_key, nonce_bytes) = Self::derive_message_material(key);

        let cipher = Aes256GcmSiv::new(aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(&aes_key));
        let nonce = Nonce::from_slice(&nonce_bytes);

        cipher
            .decrypt(
                nonce,
                aes_gcm_siv::aead::Payload {
                    msg: ciphertext,
                    aad: ad,
                },
            )
            .map_err(|_| Error::DecryptionFailed)
    }

    fn derive_message_material(key: &[u8; 32]) -> ([u8; 32], [u8; NONCE_SIZE]) {
        let hkdf = Hkdf::<Sha256>::new(None, key.as_slice());

        let mut derived_material = [0u8; 44];
        hkdf.expand(b"Murmur-Message-Keys", &mut derived_material)
            .expect("HKDF output length is fixed and valid");

        let mut aes_key = [0u8; 32];
        aes_key.copy_from_slice(&derived_material[0..32]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&derived_material[32..44]);
        derived_material.zeroize();

        (aes_key, nonce)
    }
}
