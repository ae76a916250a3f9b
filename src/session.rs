//! Session key derivation and id-nonce signatures (§4.1). The derivation
//! shape (ECDH -> HKDF -> split key material) and the directional
//! write/read assignment mirror the teacher's discv5 session module; the
//! salt and the info/signature preimages follow this engine's wire format
//! (§6) rather than the real discv5 masking-iv/static-header framing.

use ethereum_types::H256;
use hkdf::Hkdf;
use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey};
use sha2::{Digest, Sha256};

use crate::error::SessionError;
use crate::types::NodeId;

const KEY_AGREEMENT_INFO: &[u8] = b"discovery v5 key agreement";
const ID_SIGNATURE_PREFIX: &[u8] = b"discovery-id-nonce";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub write_key: [u8; 16],
    pub read_key: [u8; 16],
}

/// Raw (unhashed) X-coordinate-derived shared secret, compressed to 33
/// bytes, matching the convention the real protocol's ECDH step uses.
fn compressed_shared_secret(
    secret_key: &SecretKey,
    public_key: &PublicKey,
) -> [u8; 33] {
    let point = secp256k1::ecdh::shared_secret_point(public_key, secret_key);
    let mut compressed = [0u8; 33];
    compressed[0] = if point[63] % 2 == 0 { 0x02 } else { 0x03 };
    compressed[1..].copy_from_slice(&point[..32]);
    compressed
}

/// Derives the full `(initiator_key, recipient_key, auth_resp_key)` key
/// material for a handshake (§4.1). The first two become the ongoing
/// session's write/read keys; `auth_resp_key` is used once, to seal the
/// auth-response (id-signature + optional ENR) inside the handshake
/// message itself.
fn derive_key_material(
    local_secret: &SecretKey,
    remote_public: &PublicKey,
    initiator_id: NodeId,
    recipient_id: NodeId,
    id_nonce: &[u8; 32],
) -> Result<([u8; 16], [u8; 16], [u8; 16]), SessionError> {
    let shared_secret = compressed_shared_secret(local_secret, remote_public);

    let mut info = Vec::with_capacity(KEY_AGREEMENT_INFO.len() + 64);
    info.extend_from_slice(KEY_AGREEMENT_INFO);
    info.extend_from_slice(initiator_id.as_bytes());
    info.extend_from_slice(recipient_id.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(id_nonce), &shared_secret);
    let mut okm = [0u8; 48];
    hk.expand(&info, &mut okm).map_err(|_| SessionError::Hkdf)?;

    let mut initiator_key = [0u8; 16];
    let mut recipient_key = [0u8; 16];
    let mut auth_resp_key = [0u8; 16];
    initiator_key.copy_from_slice(&okm[..16]);
    recipient_key.copy_from_slice(&okm[16..32]);
    auth_resp_key.copy_from_slice(&okm[32..]);
    Ok((initiator_key, recipient_key, auth_resp_key))
}

/// Derives `(write_key, read_key)` plus the transient `auth_resp_key` for
/// the local side of a handshake.
///
/// `is_initiator` is true for the side that sent the handshake-initiating
/// message (the side that received WHOAREYOU).
pub fn derive_session_keys(
    local_secret: &SecretKey,
    remote_public: &PublicKey,
    local_id: NodeId,
    remote_id: NodeId,
    id_nonce: &[u8; 32],
    is_initiator: bool,
) -> Result<(Session, [u8; 16]), SessionError> {
    let (initiator_id, recipient_id): (NodeId, NodeId) = if is_initiator {
        (local_id, remote_id)
    } else {
        (remote_id, local_id)
    };
    let (initiator_key, recipient_key, auth_resp_key) =
        derive_key_material(local_secret, remote_public, initiator_id, recipient_id, id_nonce)?;

    let session = if is_initiator {
        Session {
            write_key: initiator_key,
            read_key: recipient_key,
        }
    } else {
        Session {
            write_key: recipient_key,
            read_key: initiator_key,
        }
    };
    Ok((session, auth_resp_key))
}

/// `sign(SHA256("discovery-id-nonce" || id_nonce || ephemeral_pubkey))`.
pub fn create_id_signature(
    local_secret: &SecretKey,
    id_nonce: &[u8; 32],
    ephemeral_public: &PublicKey,
) -> Signature {
    let digest = id_signature_digest(id_nonce, ephemeral_public);
    let message = Message::from_digest(digest);
    local_secret.sign_ecdsa(message)
}

pub fn verify_id_signature(
    signature: &Signature,
    id_nonce: &[u8; 32],
    ephemeral_public: &PublicKey,
    signer_public: &PublicKey,
) -> bool {
    let digest = id_signature_digest(id_nonce, ephemeral_public);
    let Ok(message) = Message::from_digest_slice(&digest) else {
        return false;
    };
    signature.verify(&message, signer_public).is_ok()
}

fn id_signature_digest(id_nonce: &[u8; 32], ephemeral_public: &PublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(ID_SIGNATURE_PREFIX);
    hasher.update(id_nonce);
    hasher.update(ephemeral_public.serialize_uncompressed());
    hasher.finalize().into()
}

/// `SHA256(recipient_node_id || "WHOAREYOU")`, the 32-byte magic that
/// prefixes every WHOAREYOU challenge (§4.1.1, §6).
pub fn whoareyou_magic(recipient_id: &NodeId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(recipient_id.as_bytes());
    hasher.update(b"WHOAREYOU");
    hasher.finalize().into()
}

/// `tag = SHA256(recipient_id) XOR sender_id`.
pub fn ordinary_tag(recipient_id: &NodeId, sender_id: &NodeId) -> H256 {
    let hashed_recipient = Sha256::digest(recipient_id.as_bytes());
    let mut tag = [0u8; 32];
    for i in 0..32 {
        tag[i] = hashed_recipient[i] ^ sender_id[i];
    }
    H256::from(tag)
}

/// Recovers the sender id from a received tag: `sender_id = tag XOR SHA256(local_id)`.
pub fn sender_id_from_tag(tag: &H256, local_id: &NodeId) -> NodeId {
    let hashed_local = Sha256::digest(local_id.as_bytes());
    let mut sender_id = [0u8; 32];
    for i in 0..32 {
        sender_id[i] = tag[i] ^ hashed_local[i];
    }
    H256::from(sender_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> (SecretKey, PublicKey) {
        let secret = SecretKey::new(&mut OsRng);
        let public = PublicKey::from_secret_key_global(&secret);
        (secret, public)
    }

    #[test]
    fn session_keys_match_on_both_sides() {
        let (a_secret, a_public) = keypair();
        let (b_secret, b_public) = keypair();
        let a_id = NodeId::random();
        let b_id = NodeId::random();
        let id_nonce = [7u8; 32];

        let (a_session, a_auth_resp_key) =
            derive_session_keys(&a_secret, &b_public, a_id, b_id, &id_nonce, true).unwrap();
        let (b_session, b_auth_resp_key) =
            derive_session_keys(&b_secret, &a_public, b_id, a_id, &id_nonce, false).unwrap();

        assert_eq!(a_session.write_key, b_session.read_key);
        assert_eq!(a_session.read_key, b_session.write_key);
        assert_eq!(a_auth_resp_key, b_auth_resp_key);
    }

    #[test]
    fn id_signature_round_trip() {
        let (secret, public) = keypair();
        let (_, ephemeral_public) = keypair();
        let id_nonce = [9u8; 32];

        let signature = create_id_signature(&secret, &id_nonce, &ephemeral_public);
        assert!(verify_id_signature(&signature, &id_nonce, &ephemeral_public, &public));

        let wrong_nonce = [1u8; 32];
        assert!(!verify_id_signature(&signature, &wrong_nonce, &ephemeral_public, &public));
    }

    #[test]
    fn tag_round_trips_to_sender_id() {
        let recipient = NodeId::random();
        let sender = NodeId::random();
        let tag = ordinary_tag(&recipient, &sender);
        assert_eq!(sender_id_from_tag(&tag, &recipient), sender);
    }
}
