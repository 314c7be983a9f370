use crate::envelope::{Envelope, HandshakeEnvelope};
use crate::identity::Identity;
use crate::prekey::{PreKeyManager, PublicBundle};
use crate::proto;
use crate::ratchet::DoubleRatchet;
use crate::store::{KeyStore, StoreOp};
use crate::x3dh::X3dh;
use crate::{Error, ProtocolConfig, X25519PublicKey};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Address of a remote party: one session exists per (peer, device) pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    /// Stable identifier of the peer account.
    pub peer_id: String,
    /// Device number within that account.
    pub device_id: u32,
}

impl PeerAddress {
    /// Creates an address from its parts.
    pub fn new(peer_id: impl Into<String>, device_id: u32) -> Self {
        Self {
            peer_id: peer_id.into(),
            device_id,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.peer_id, self.device_id)
    }
}

fn session_record_key(address: &PeerAddress) -> String {
    format!("session/{}/{}", address.peer_id, address.device_id)
}

fn trust_record_key(address: &PeerAddress) -> String {
    format!("trust/{}/{}", address.peer_id, address.device_id)
}

/// X3DH identifiers an initiator keeps until the peer's first reply confirms
/// the session end-to-end.
#[derive(Clone)]
pub(crate) struct PendingHandshake {
    pub(crate) signed_pre_key_id: u32,
    pub(crate) one_time_pre_key_id: Option<u32>,
    pub(crate) base_key: X25519PublicKey,
}

/// An established secure messaging session with one peer address.
///
/// Wraps the double ratchet together with the peer metadata needed to
/// continue the conversation across restarts. Every mutation is written back
/// to the key store as one atomic record; a persistence failure rolls the
/// in-memory state back so memory and store never disagree.
///
/// Mutating operations take `&mut self`: exclusive access per session is
/// enforced by the borrow checker, and callers sharing a session across
/// threads wrap it in its own lock. Sessions for different peers are
/// independent.
pub struct Session {
    pub(crate) session_id: String,
    pub(crate) address: PeerAddress,
    pub(crate) remote_identity: X25519PublicKey,
    pub(crate) remote_registration_id: u32,
    pub(crate) pending: Option<PendingHandshake>,
    pub(crate) consecutive_failures: u32,
    pub(crate) ratchet: DoubleRatchet,
    pub(crate) desync_threshold: u32,
    pub(crate) store: Arc<dyn KeyStore>,
}

impl Session {
    /// Loads the persisted session for `address`, if one exists.
    pub fn load(
        store: Arc<dyn KeyStore>,
        address: &PeerAddress,
        config: &ProtocolConfig,
    ) -> Result<Option<Self>, Error> {
        match store.get(&session_record_key(address))? {
            Some(bytes) => Ok(Some(proto::decode_session(&bytes, store, config)?)),
            None => Ok(None),
        }
    }

    /// Unique identifier of this session, equal on both ends.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The peer this session belongs to.
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// The peer's identity key as recorded at establishment.
    pub fn remote_identity(&self) -> X25519PublicKey {
        self.remote_identity
    }

    /// The peer's registration id.
    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    /// Index of the next expected message on the receiving chain.
    pub fn receiving_message_number(&self) -> u32 {
        self.ratchet.receiving_message_number()
    }

    /// True until the peer's first reply confirms the handshake.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// True once consecutive decryption failures have crossed the configured
    /// threshold; the caller should discard this session and initiate a
    /// fresh handshake.
    pub fn is_desynchronized(&self) -> bool {
        self.consecutive_failures >= self.desync_threshold
    }

    /// Encrypts a message for the peer, advancing and persisting the
    /// sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Envelope, Error> {
        let snapshot = self.ratchet.clone();
        let message = self.ratchet.encrypt(plaintext)?;

        if let Err(err) = self.persist() {
            self.ratchet = snapshot;
            return Err(err);
        }

        Ok(Envelope::Ratchet(message))
    }

    /// Decrypts a ratchet envelope from the peer, advancing and persisting
    /// the receiving state.
    ///
    /// Handshake envelopes are not accepted here; they go through
    /// [`SessionEstablisher::process_handshake`].
    pub fn decrypt(&mut self, envelope: &Envelope) -> Result<Vec<u8>, Error> {
        let Envelope::Ratchet(message) = envelope else {
            return Err(Error::Encoding(
                "handshake envelopes are processed by the session establisher".to_string(),
            ));
        };

        let ratchet_snapshot = self.ratchet.clone();
        let pending_snapshot = self.pending.clone();
        let failures_snapshot = self.consecutive_failures;

        match self.ratchet.decrypt(message) {
            Ok(plaintext) => {
                self.pending = None;
                self.consecutive_failures = 0;

                if let Err(err) = self.persist() {
                    self.ratchet = ratchet_snapshot;
                    self.pending = pending_snapshot;
                    self.consecutive_failures = failures_snapshot;
                    return Err(err);
                }

                Ok(plaintext)
            }
            Err(Error::DecryptionFailed) => {
                // The ratchet rolled itself back; only the failure counter
                // moves, and it is persisted so restarts keep the tally.
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);

                if let Err(err) = self.persist() {
                    self.consecutive_failures = failures_snapshot;
                    return Err(err);
                }

                if self.is_desynchronized() {
                    warn!(
                        peer = %self.address,
                        failures = self.consecutive_failures,
                        "session appears desynchronized, re-establishment recommended"
                    );
                }

                Err(Error::DecryptionFailed)
            }
            Err(err) => Err(err),
        }
    }

    fn persist(&self) -> Result<(), Error> {
        let record = proto::encode_session(self)?;
        self.store.put(&session_record_key(&self.address), &record)
    }
}

impl Zeroize for Session {
    fn zeroize(&mut self) {
        self.session_id.zeroize();
        self.ratchet.zeroize();
        self.pending = None;
    }
}

impl ZeroizeOnDrop for Session {}

/// Establishes sessions from published key material.
///
/// Holds the local identity and pre-key state, and implements both the
/// initiator path (consume a fetched [`PublicBundle`]) and the responder
/// path (process an inbound handshake envelope). Peer identity keys are
/// pinned on first use; a later mismatch surfaces as
/// [`Error::IdentityKeyChanged`] for the caller to resolve.
pub struct SessionEstablisher {
    store: Arc<dyn KeyStore>,
    identity: Identity,
    pre_keys: PreKeyManager,
    config: ProtocolConfig,
}

impl SessionEstablisher {
    /// Creates an establisher for the given identity over the given store.
    pub fn new(store: Arc<dyn KeyStore>, identity: Identity, config: ProtocolConfig) -> Self {
        let pre_keys = PreKeyManager::new(store.clone(), identity.clone(), config.clone());

        Self {
            store,
            identity,
            pre_keys,
            config,
        }
    }

    /// The pre-key manager backing this establisher.
    pub fn pre_keys(&self) -> &PreKeyManager {
        &self.pre_keys
    }

    /// Loads the persisted session for `address`, if one exists.
    pub fn session(&self, address: &PeerAddress) -> Result<Option<Session>, Error> {
        Session::load(self.store.clone(), address, &self.config)
    }

    /// Initiates a session with a peer from its published bundle.
    ///
    /// `first_plaintext` is encrypted into the handshake envelope itself;
    /// there is no empty handshake on the wire, so callers wanting a pure
    /// handshake pass an empty message. The session replaces any previously
    /// stored one for this address wholesale.
    pub fn initiate_session(
        &self,
        address: &PeerAddress,
        bundle: &PublicBundle,
        first_plaintext: &[u8],
    ) -> Result<(Session, Envelope), Error> {
        bundle.verify()?;
        let trust_op = self.check_trust(address, &bundle.identity_key)?;

        let x3dh = X3dh::new(&self.config.protocol_info);
        let agreement = x3dh.initiate(&self.identity.key_pair, bundle)?;
        let base_key = agreement.base_public();

        let local_identity_key = self.identity.key_pair.dh_key_public();
        let ad = session_binding(&local_identity_key, &bundle.identity_key);
        let ratchet = DoubleRatchet::initialize_for_initiator(
            agreement.shared_secret(),
            &bundle.signed_pre_key.1,
            self.config.max_skipped_messages,
            self.config.max_skipped_keys,
            ad,
        )?;

        let mut session = Session {
            session_id: derive_session_id(&local_identity_key, &bundle.identity_key, &base_key),
            address: address.clone(),
            remote_identity: bundle.identity_key,
            remote_registration_id: bundle.registration_id,
            pending: Some(PendingHandshake {
                signed_pre_key_id: bundle.signed_pre_key.0,
                one_time_pre_key_id: bundle.one_time_pre_key.map(|(id, _)| id),
                base_key,
            }),
            consecutive_failures: 0,
            ratchet,
            desync_threshold: self.config.desync_threshold,
            store: self.store.clone(),
        };

        let inner = Envelope::Ratchet(session.ratchet.encrypt(first_plaintext)?).encode();

        let mut batch = vec![StoreOp::Put {
            key: session_record_key(address),
            value: proto::encode_session(&session)?,
        }];
        if let Some(op) = trust_op {
            batch.push(op);
        }
        self.store.apply(&batch)?;

        debug!(peer = %address, session = %session.session_id, "outbound session established");

        let envelope = Envelope::Handshake(HandshakeEnvelope {
            registration_id: self.identity.registration_id,
            identity_key: local_identity_key,
            base_key,
            signed_pre_key_id: bundle.signed_pre_key.0,
            one_time_pre_key_id: bundle.one_time_pre_key.map(|(id, _)| id),
            inner,
        });

        Ok((session, envelope))
    }

    /// Processes an inbound handshake envelope, establishing the responder
    /// side of the session and decrypting the first message it carries.
    ///
    /// A referenced one-time pre-key is consumed; if it is already gone the
    /// handshake is rejected with [`Error::PreKeyNotFound`] rather than
    /// silently completing a weaker three-way agreement. The pre-key
    /// removal, trust record and session record are committed in one atomic
    /// batch after the inner message has decrypted.
    pub fn process_handshake(
        &self,
        address: &PeerAddress,
        envelope: &Envelope,
    ) -> Result<(Session, Vec<u8>), Error> {
        let Envelope::Handshake(handshake) = envelope else {
            return Err(Error::Encoding("expected a handshake envelope".to_string()));
        };

        let trust_op = self.check_trust(address, &handshake.identity_key)?;
        let signed_pre_key = self.pre_keys.signed_pre_key(handshake.signed_pre_key_id)?;

        let (one_time_pre_key, mut batch) = match handshake.one_time_pre_key_id {
            Some(id) => {
                let (key, ops) = self.pre_keys.consume_one_time_pre_key_ops(id)?;
                (Some(key), ops)
            }
            None => (None, Vec::new()),
        };

        let x3dh = X3dh::new(&self.config.protocol_info);
        let shared_secret = x3dh.respond(
            &self.identity.key_pair,
            &signed_pre_key,
            one_time_pre_key,
            &handshake.identity_key,
            &handshake.base_key,
        )?;

        let local_identity_key = self.identity.key_pair.dh_key_public();
        let ad = session_binding(&handshake.identity_key, &local_identity_key);
        let mut ratchet = DoubleRatchet::initialize_for_responder(
            shared_secret,
            signed_pre_key.key_pair(),
            self.config.max_skipped_messages,
            self.config.max_skipped_keys,
            ad,
        );

        let Envelope::Ratchet(first_message) = Envelope::decode(&handshake.inner)? else {
            return Err(Error::Encoding(
                "handshake payload must be a ratchet envelope".to_string(),
            ));
        };
        let plaintext = ratchet.decrypt(&first_message)?;

        let session = Session {
            session_id: derive_session_id(
                &handshake.identity_key,
                &local_identity_key,
                &handshake.base_key,
            ),
            address: address.clone(),
            remote_identity: handshake.identity_key,
            remote_registration_id: handshake.registration_id,
            pending: None,
            consecutive_failures: 0,
            ratchet,
            desync_threshold: self.config.desync_threshold,
            store: self.store.clone(),
        };

        batch.push(StoreOp::Put {
            key: session_record_key(address),
            value: proto::encode_session(&session)?,
        });
        if let Some(op) = trust_op {
            batch.push(op);
        }
        self.store.apply(&batch)?;

        debug!(peer = %address, session = %session.session_id, "inbound session established");

        Ok((session, plaintext))
    }

    /// Records a new identity key for `address` after out-of-band
    /// re-verification, discarding the session established under the old
    /// key.
    pub fn trust_identity(
        &self,
        address: &PeerAddress,
        identity_key: &X25519PublicKey,
    ) -> Result<(), Error> {
        self.store.apply(&[
            StoreOp::Put {
                key: trust_record_key(address),
                value: identity_key.as_bytes().to_vec(),
            },
            StoreOp::Remove {
                key: session_record_key(address),
            },
        ])
    }

    fn check_trust(
        &self,
        address: &PeerAddress,
        identity_key: &X25519PublicKey,
    ) -> Result<Option<StoreOp>, Error> {
        match self.store.get(&trust_record_key(address))? {
            Some(recorded) => {
                if recorded.as_slice() != identity_key.as_bytes() {
                    warn!(peer = %address, "peer identity key changed since first use");
                    return Err(Error::IdentityKeyChanged);
                }
                Ok(None)
            }
            None => Ok(Some(StoreOp::Put {
                key: trust_record_key(address),
                value: identity_key.as_bytes().to_vec(),
            })),
        }
    }
}

/// The 64-byte associated-data prefix binding every message of a session to
/// both identity keys, initiator first.
fn session_binding(
    initiator_identity: &X25519PublicKey,
    responder_identity: &X25519PublicKey,
) -> Box<[u8; 64]> {
    let mut ad = Box::new([0u8; 64]);
    ad[0..32].copy_from_slice(initiator_identity.as_bytes());
    ad[32..64].copy_from_slice(responder_identity.as_bytes());
    ad
}

/// Derives the session id both parties compute identically: a hash of both
/// identity keys and the handshake base key.
fn derive_session_id(
    initiator_identity: &X25519PublicKey,
    responder_identity: &X25519PublicKey,
    base_key: &X25519PublicKey,
) -> String {
    let mut hasher = Sha256::new();

    hasher.update(initiator_identity.as_bytes());
    hasher.update(responder_identity.as_bytes());
    hasher.update(base_key.as_bytes());

    let bytes = hasher.finalize();
    let engine = base64::engine::general_purpose::STANDARD;

    engine.encode(bytes)
}
