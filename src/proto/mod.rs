use crate::ratchet::{Chain, DoubleRatchet, RatchetState};
use crate::session::{PendingHandshake, PeerAddress, Session};
use crate::store::KeyStore;
use crate::types::X25519Secret;
use crate::{Error, ProtocolConfig, X25519PublicKey};
use prost::Message;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

include!(concat!(env!("OUT_DIR"), "/murmur.rs"));

/// Serializes a session to the Protocol Buffers record persisted in the key
/// store.
pub(crate) fn encode_session(session: &Session) -> Result<Vec<u8>, Error> {
    let state = &session.ratchet.state;

    let skipped_message_keys = session
        .ratchet
        .skipped_order
        .iter()
        .filter_map(|cache_key| {
            session
                .ratchet
                .skipped_message_keys
                .get(cache_key)
                .map(|message_key| SkippedKeyProto {
                    ratchet_key: cache_key.0.to_vec(),
                    message_number: cache_key.1,
                    message_key: message_key.to_vec(),
                })
        })
        .collect();

    let ratchet = RatchetProto {
        dh_pair: state.dh_pair.to_bytes().to_vec(),
        remote_ratchet_key: match &state.remote_ratchet_key {
            Some(key) => key.as_bytes().to_vec(),
            None => Vec::new(),
        },
        root_key: state.root_key.to_vec(),
        sending_chain: Some(ChainProto {
            chain_key: state.sending_chain.chain_key.to_vec(),
            index: state.sending_chain.index,
        }),
        receiving_chain: Some(ChainProto {
            chain_key: state.receiving_chain.chain_key.to_vec(),
            index: state.receiving_chain.index,
        }),
        previous_sending_chain_length: state.previous_sending_chain_length,
        sending_message_number: state.sending_message_number,
        receiving_message_number: state.receiving_message_number,
        ad: state.ad.to_vec(),
        skipped_message_keys,
        max_skip: session.ratchet.max_skip,
        max_cached: session.ratchet.max_cached as u32,
    };

    let record = SessionRecordProto {
        version: 1, // Current schema version
        session_id: session.session_id.clone(),
        peer_id: session.address.peer_id.clone(),
        device_id: session.address.device_id,
        remote_identity: session.remote_identity.as_bytes().to_vec(),
        remote_registration_id: session.remote_registration_id,
        ratchet: Some(ratchet),
        pending: session.pending.as_ref().map(|pending| PendingHandshakeProto {
            signed_pre_key_id: pending.signed_pre_key_id,
            one_time_pre_key_id: pending.one_time_pre_key_id,
            base_key: pending.base_key.as_bytes().to_vec(),
        }),
        consecutive_failures: session.consecutive_failures,
    };

    let mut buf = Vec::new();
    record
        .encode(&mut buf)
        .map_err(|err| Error::Encoding(format!("failed to encode session: {err:?}")))?;

    Ok(buf)
}

/// Deserializes a session record loaded from the key store.
pub(crate) fn decode_session(
    bytes: &[u8],
    store: Arc<dyn KeyStore>,
    config: &ProtocolConfig,
) -> Result<Session, Error> {
    let record = SessionRecordProto::decode(bytes)
        .map_err(|err| Error::Encoding(format!("failed to decode session: {err:?}")))?;

    if record.version != 1 {
        return Err(Error::Encoding(format!(
            "unsupported session schema version: {}",
            record.version
        )));
    }

    let remote_identity =
        X25519PublicKey::from(fixed32(&record.remote_identity, "remote identity key")?);

    let pending = match record.pending {
        Some(pending) => Some(PendingHandshake {
            signed_pre_key_id: pending.signed_pre_key_id,
            one_time_pre_key_id: pending.one_time_pre_key_id,
            base_key: X25519PublicKey::from(fixed32(&pending.base_key, "base key")?),
        }),
        None => None,
    };

    let ratchet_proto = record
        .ratchet
        .ok_or_else(|| Error::Encoding("missing ratchet state".to_string()))?;
    let ratchet = decode_ratchet(ratchet_proto)?;

    Ok(Session {
        session_id: record.session_id,
        address: PeerAddress::new(record.peer_id, record.device_id),
        remote_identity,
        remote_registration_id: record.remote_registration_id,
        pending,
        consecutive_failures: record.consecutive_failures,
        ratchet,
        desync_threshold: config.desync_threshold,
        store,
    })
}

fn decode_ratchet(proto: RatchetProto) -> Result<DoubleRatchet, Error> {
    let dh_pair = X25519Secret::from(fixed32_boxed(&proto.dh_pair, "DH key pair")?);

    let remote_ratchet_key = if proto.remote_ratchet_key.is_empty() {
        None
    } else {
        Some(X25519PublicKey::from(fixed32(
            &proto.remote_ratchet_key,
            "remote ratchet key",
        )?))
    };

    let root_key = fixed32_boxed(&proto.root_key, "root key")?;

    if proto.ad.len() != 64 {
        return Err(Error::Encoding("invalid associated data length".to_string()));
    }
    let mut ad = Box::new([0u8; 64]);
    ad.copy_from_slice(&proto.ad);

    let sending_chain_proto = proto
        .sending_chain
        .ok_or_else(|| Error::Encoding("missing sending chain".to_string()))?;
    let receiving_chain_proto = proto
        .receiving_chain
        .ok_or_else(|| Error::Encoding("missing receiving chain".to_string()))?;

    let mut sending_chain = Chain::new(fixed32_boxed(
        &sending_chain_proto.chain_key,
        "sending chain key",
    )?);
    sending_chain.set_index(sending_chain_proto.index);
    let mut receiving_chain = Chain::new(fixed32_boxed(
        &receiving_chain_proto.chain_key,
        "receiving chain key",
    )?);
    receiving_chain.set_index(receiving_chain_proto.index);

    let mut skipped_message_keys = HashMap::with_capacity(proto.skipped_message_keys.len());
    let mut skipped_order = VecDeque::with_capacity(proto.skipped_message_keys.len());
    for skipped in proto.skipped_message_keys {
        let cache_key = (
            fixed32(&skipped.ratchet_key, "skipped ratchet key")?,
            skipped.message_number,
        );
        let message_key = fixed32_boxed(&skipped.message_key, "skipped message key")?;
        skipped_message_keys.insert(cache_key, message_key);
        skipped_order.push_back(cache_key);
    }

    Ok(DoubleRatchet {
        state: RatchetState {
            dh_pair,
            remote_ratchet_key,
            root_key,
            sending_chain,
            receiving_chain,
            previous_sending_chain_length: proto.previous_sending_chain_length,
            sending_message_number: proto.sending_message_number,
            receiving_message_number: proto.receiving_message_number,
            ad,
        },
        skipped_message_keys,
        skipped_order,
        max_skip: proto.max_skip,
        max_cached: proto.max_cached as usize,
    })
}

fn fixed32(bytes: &[u8], what: &str) -> Result<[u8; 32], Error> {
    if bytes.len() != 32 {
        return Err(Error::Encoding(format!("invalid {what} length")));
    }
    let mut fixed = [0u8; 32];
    fixed.copy_from_slice(bytes);
    Ok(fixed)
}

fn fixed32_boxed(bytes: &[u8], what: &str) -> Result<Box<[u8; 32]>, Error> {
    Ok(Box::new(fixed32(bytes, what)?))
}
