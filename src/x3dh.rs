use crate::identity::IdentityKeyPair;
use crate::prekey::{OneTimePreKey, PublicBundle, SignedPreKey};
use crate::types::generate_random_seed;
use crate::{Error, X25519PublicKey, X25519Secret};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

const SALT: &[u8] = b"Murmur-X3DH";

/// A shared secret derived from X3DH key agreement.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HandshakeSecret(pub(crate) Box<[u8; 32]>);

/// The result of an X3DH agreement on the initiator side.
///
/// Carries the derived secret plus the ephemeral base key that must be
/// transmitted to the responder so it can replay the same computation.
pub struct InitiationResult {
    shared_secret: HandshakeSecret,
    base_public: X25519PublicKey,
}

impl InitiationResult {
    /// Returns the ephemeral base public key to send to the responder.
    pub fn base_public(&self) -> X25519PublicKey {
        self.base_public
    }

    /// Consumes the result and returns only the shared secret.
    pub fn shared_secret(self) -> HandshakeSecret {
        self.shared_secret
    }
}

/// X3DH (Extended Triple Diffie-Hellman) key agreement.
///
/// Combines identity, signed and one-time pre-keys into a shared secret
/// without both parties being online simultaneously. The `info` string
/// domain-separates the HKDF derivation per deployment.
pub struct X3dh {
    info: Vec<u8>,
}

impl X3dh {
    /// Creates an agreement instance with the given application info string.
    pub fn new(info: &[u8]) -> Self {
        Self {
            info: info.to_vec(),
        }
    }

    /// Initiator side: verify the responder's bundle, generate an ephemeral
    /// base key and derive the shared secret.
    ///
    /// DH terms, in concatenation order:
    /// DH1 = DH(IKa, SPKb), DH2 = DH(EKa, IKb), DH3 = DH(EKa, SPKb),
    /// DH4 = DH(EKa, OPKb) when the bundle carries a one-time pre-key.
    pub fn initiate(
        &self,
        local_identity: &IdentityKeyPair,
        peer_bundle: &PublicBundle,
    ) -> Result<InitiationResult, Error> {
        peer_bundle.verify()?;

        let seed = generate_random_seed()?;
        let base_key = X25519Secret::from(seed);

        let dh1 = local_identity.dh(&peer_bundle.signed_pre_key.1);
        let dh2 = base_key.dh(&peer_bundle.identity_key);
        let dh3 = base_key.dh(&peer_bundle.signed_pre_key.1);
        let dh4 = peer_bundle
            .one_time_pre_key
            .map(|(_, otpk)| base_key.dh(&otpk));

        let shared_secret = self.derive_secret(dh1, dh2, dh3, dh4)?;

        Ok(InitiationResult {
            shared_secret,
            base_public: base_key.public_key(),
        })
    }

    /// Responder side: mirror the initiator's computation and derive the
    /// byte-identical shared secret.
    ///
    /// The one-time pre-key is taken by value; its private half is gone once
    /// the agreement completes.
    pub fn respond(
        &self,
        local_identity: &IdentityKeyPair,
        signed_pre_key: &SignedPreKey,
        one_time_pre_key: Option<OneTimePreKey>,
        peer_identity_public: &X25519PublicKey,
        peer_base_public: &X25519PublicKey,
    ) -> Result<HandshakeSecret, Error> {
        let dh1 = signed_pre_key.dh(peer_identity_public);
        let dh2 = local_identity.dh(peer_base_public);
        let dh3 = signed_pre_key.dh(peer_base_public);
        let dh4 = one_time_pre_key.map(|otpk| otpk.dh(peer_base_public));

        self.derive_secret(dh1, dh2, dh3, dh4)
    }

    fn derive_secret(
        &self,
        dh1: SharedSecret,
        dh2: SharedSecret,
        dh3: SharedSecret,
        dh4: Option<SharedSecret>,
    ) -> Result<HandshakeSecret, Error> {
        // IKM = DH1 || DH2 || DH3 || DH4, zero-padded when DH4 is absent.
        let mut key_material = Box::new([0u8; 128]);

        key_material[0..32].copy_from_slice(dh1.as_bytes());
        key_material[32..64].copy_from_slice(dh2.as_bytes());
        key_material[64..96].copy_from_slice(dh3.as_bytes());
        if let Some(dh4) = dh4 {
            key_material[96..128].copy_from_slice(dh4.as_bytes());
        }

        let hkdf = Hkdf::<Sha256>::new(Some(SALT), key_material.as_slice());

        let mut shared_secret = Box::new([0u8; 32]);
        let expanded = hkdf.expand(&self.info, shared_secret.as_mut_slice());
        key_material.zeroize();
        expanded.map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;

        Ok(HandshakeSecret(shared_secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdentityKeyPair;

    fn bundle_for(
        identity: &IdentityKeyPair,
        signed: &SignedPreKey,
        one_time: Option<&OneTimePreKey>,
    ) -> PublicBundle {
        PublicBundle {
            registration_id: 42,
            identity_key: identity.dh_key_public(),
            signing_key: identity.signing_key_public(),
            signed_pre_key: (signed.id(), signed.public_key()),
            signature: signed.signature(identity),
            one_time_pre_key: one_time.map(|otpk| (otpk.id(), otpk.public_key())),
        }
    }

    #[test]
    fn test_agreement_with_one_time_pre_key() {
        let alice_identity = IdentityKeyPair::generate().unwrap();
        let bob_identity = IdentityKeyPair::generate().unwrap();
        let bob_signed = SignedPreKey::new(1).unwrap();
        let bob_one_time = OneTimePreKey::new(1).unwrap();
        let bob_bundle = bundle_for(&bob_identity, &bob_signed, Some(&bob_one_time));

        let x3dh = X3dh::new(b"Test-Protocol-Info");
        let alice_result = x3dh.initiate(&alice_identity, &bob_bundle).unwrap();
        let base_public = alice_result.base_public();

        let bob_secret = x3dh
            .respond(
                &bob_identity,
                &bob_signed,
                Some(bob_one_time),
                &alice_identity.dh_key_public(),
                &base_public,
            )
            .unwrap();

        assert_eq!(alice_result.shared_secret.0, bob_secret.0);
    }

    #[test]
    fn test_agreement_without_one_time_pre_key() {
        let alice_identity = IdentityKeyPair::generate().unwrap();
        let bob_identity = IdentityKeyPair::generate().unwrap();
        let bob_signed = SignedPreKey::new(1).unwrap();
        let bob_bundle = bundle_for(&bob_identity, &bob_signed, None);

        let x3dh = X3dh::new(b"Test-Protocol-Info");
        let alice_result = x3dh.initiate(&alice_identity, &bob_bundle).unwrap();
        let base_public = alice_result.base_public();

        let bob_secret = x3dh
            .respond(
                &bob_identity,
                &bob_signed,
                None,
                &alice_identity.dh_key_public(),
                &base_public,
            )
            .unwrap();

        assert_eq!(alice_result.shared_secret.0, bob_secret.0);
    }

    #[test]
    fn test_distinct_info_strings_diverge() {
        let alice_identity = IdentityKeyPair::generate().unwrap();
        let bob_identity = IdentityKeyPair::generate().unwrap();
        let bob_signed = SignedPreKey::new(1).unwrap();
        let bob_bundle = bundle_for(&bob_identity, &bob_signed, None);

        let secret1 = X3dh::new(b"Info-1")
            .initiate(&alice_identity, &bob_bundle)
            .unwrap();
        let secret2 = X3dh::new(b"Info-2")
            .initiate(&alice_identity, &bob_bundle)
            .unwrap();

        assert_ne!(secret1.shared_secret.0, secret2.shared_secret.0);
    }

    #[test]
    fn test_mismatched_signing_key_rejected() {
        let alice_identity = IdentityKeyPair::generate().unwrap();
        let bob_identity = IdentityKeyPair::generate().unwrap();
        let other_identity = IdentityKeyPair::generate().unwrap();
        let bob_signed = SignedPreKey::new(1).unwrap();

        let mut bundle = bundle_for(&bob_identity, &bob_signed, None);
        bundle.signing_key = other_identity.signing_key_public();

        assert_eq!(
            x3dh_err(&alice_identity, &bundle),
            Error::InvalidSignature
        );
    }

    fn x3dh_err(identity: &IdentityKeyPair, bundle: &PublicBundle) -> Error {
        X3dh::new(b"Test")
            .initiate(identity, bundle)
            .err()
            .unwrap()
    }
}
