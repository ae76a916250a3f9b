//! Packet classification and AES-GCM framing (§4.1, §6). The codec is a
//! set of pure functions over byte slices and derived keys; it owns no
//! state itself — sessions and pending challenges are the engine's.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use ethereum_types::H256;
use rlp::{DecoderError, Rlp, RlpStream};
use secp256k1::PublicKey;
use sha2::{Digest, Sha256};

use crate::error::PacketError;
use crate::session::whoareyou_magic;
use crate::types::{NodeId, NodeRecord};

pub type AuthTag = [u8; 12];

/// The three forms an inbound datagram classifies into (§4.1).
#[derive(Debug, Clone)]
pub enum Packet {
    WhoAreYou {
        auth_tag: AuthTag,
        id_nonce: [u8; 32],
        enr_seq: u64,
    },
    Handshake {
        tag: H256,
        auth_tag: AuthTag,
        id_nonce: [u8; 32],
        ephemeral_public: PublicKey,
        auth_response_ct: Vec<u8>,
        ciphertext: Vec<u8>,
    },
    Ordinary {
        tag: H256,
        auth_tag: AuthTag,
        ciphertext: Vec<u8>,
    },
}

/// The auth-response payload sealed under `auth_resp_key` inside a
/// handshake-initiating message: the id-nonce signature plus an optional
/// embedded ENR (sent when the recipient's view of our `enr_seq` is stale).
#[derive(Debug, Clone)]
pub struct AuthResponse {
    pub id_signature: Vec<u8>,
    pub record: Option<NodeRecord>,
}

impl AuthResponse {
    fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new();
        match &self.record {
            Some(record) => {
                stream.begin_list(2);
                stream.append(&self.id_signature.as_slice());
                stream.begin_list(5);
                stream.append(&record.seq);
                stream.append(&record.public_key.as_bytes());
                match record.address.ip {
                    std::net::IpAddr::V4(v4) => stream.append(&v4.octets().as_slice()),
                    std::net::IpAddr::V6(v6) => stream.append(&v6.octets().as_slice()),
                };
                stream.append(&record.address.udp_port);
                stream.append(&record.address.tcp_port);
            }
            None => {
                stream.begin_list(1);
                stream.append(&self.id_signature.as_slice());
            }
        }
        stream.out().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecoderError> {
        let rlp = Rlp::new(bytes);
        let id_signature: Vec<u8> = rlp.val_at(0)?;
        if rlp.item_count()? < 2 {
            return Ok(AuthResponse {
                id_signature,
                record: None,
            });
        }
        let record_rlp = rlp.at(1)?;
        let seq: u64 = record_rlp.val_at(0)?;
        let public_key_bytes: Vec<u8> = record_rlp.val_at(1)?;
        if public_key_bytes.len() != 64 {
            return Err(DecoderError::RlpInvalidLength);
        }
        let ip_bytes: Vec<u8> = record_rlp.val_at(2)?;
        let ip = match ip_bytes.len() {
            4 => {
                let mut o = [0u8; 4];
                o.copy_from_slice(&ip_bytes);
                std::net::IpAddr::from(o)
            }
            16 => {
                let mut o = [0u8; 16];
                o.copy_from_slice(&ip_bytes);
                std::net::IpAddr::from(o)
            }
            _ => return Err(DecoderError::RlpInvalidLength),
        };
        let udp_port: u16 = record_rlp.val_at(3)?;
        let tcp_port: u16 = record_rlp.val_at(4)?;
        Ok(AuthResponse {
            id_signature,
            record: Some(NodeRecord {
                seq,
                public_key: ethereum_types::H512::from_slice(&public_key_bytes),
                address: crate::types::Address {
                    ip,
                    udp_port,
                    tcp_port,
                },
                signature: Vec::new(),
            }),
        })
    }
}

/// Classifies a datagram without decrypting it. The magic-tag check must
/// run before the generic tag path, since both are 32-byte prefixes.
pub fn classify(bytes: &[u8], local_id: &NodeId) -> Result<Packet, PacketError> {
    if bytes.len() < 32 {
        return Err(PacketError::Truncated);
    }
    let (prefix, rest) = bytes.split_at(32);
    let magic = whoareyou_magic(local_id);
    if prefix == magic {
        return parse_whoareyou_body(rest);
    }
    let tag = H256::from_slice(prefix);
    parse_tagged_body(tag, rest)
}

fn parse_whoareyou_body(body: &[u8]) -> Result<Packet, PacketError> {
    let rlp = Rlp::new(body);
    let auth_tag_bytes: Vec<u8> = rlp.val_at(0)?;
    if auth_tag_bytes.len() != 12 {
        return Err(PacketError::Rlp(DecoderError::RlpInvalidLength));
    }
    let mut auth_tag = [0u8; 12];
    auth_tag.copy_from_slice(&auth_tag_bytes);
    let id_nonce_bytes: Vec<u8> = rlp.val_at(1)?;
    if id_nonce_bytes.len() != 32 {
        return Err(PacketError::Rlp(DecoderError::RlpInvalidLength));
    }
    let mut id_nonce = [0u8; 32];
    id_nonce.copy_from_slice(&id_nonce_bytes);
    let enr_seq: u64 = rlp.val_at(2)?;
    Ok(Packet::WhoAreYou {
        auth_tag,
        id_nonce,
        enr_seq,
    })
}

fn parse_tagged_body(tag: H256, body: &[u8]) -> Result<Packet, PacketError> {
    // The auth header is itself an RLP list; its first two items tell us
    // whether this is a handshake or an ordinary message.
    let header_rlp = Rlp::new(body);
    let payload_offset = header_rlp.payload_info()?.total();
    let auth_tag_bytes: Vec<u8> = header_rlp.val_at(0)?;
    if auth_tag_bytes.len() != 12 {
        return Err(PacketError::Rlp(DecoderError::RlpInvalidLength));
    }
    let mut auth_tag = [0u8; 12];
    auth_tag.copy_from_slice(&auth_tag_bytes);

    let item_count = header_rlp.item_count()?;
    let ciphertext = body.get(payload_offset..).unwrap_or_default().to_vec();

    if item_count == 1 {
        return Ok(Packet::Ordinary {
            tag,
            auth_tag,
            ciphertext,
        });
    }

    let scheme: Vec<u8> = header_rlp.val_at(1)?;
    if scheme != b"gcm" {
        return Err(PacketError::UnsupportedPacketType);
    }
    let id_nonce_bytes: Vec<u8> = header_rlp.val_at(2)?;
    if id_nonce_bytes.len() != 32 {
        return Err(PacketError::Rlp(DecoderError::RlpInvalidLength));
    }
    let mut id_nonce = [0u8; 32];
    id_nonce.copy_from_slice(&id_nonce_bytes);
    let ephemeral_bytes: Vec<u8> = header_rlp.val_at(3)?;
    let ephemeral_public =
        PublicKey::from_slice(&ephemeral_bytes).map_err(|_| PacketError::UnsupportedPacketType)?;
    let auth_response_ct: Vec<u8> = header_rlp.val_at(4)?;

    Ok(Packet::Handshake {
        tag,
        auth_tag,
        id_nonce,
        ephemeral_public,
        auth_response_ct,
        ciphertext,
    })
}

pub fn build_whoareyou(recipient_id: &NodeId, auth_tag: &AuthTag, id_nonce: &[u8; 32], enr_seq: u64) -> Vec<u8> {
    let magic = whoareyou_magic(recipient_id);
    let mut stream = RlpStream::new();
    stream.begin_list(3);
    stream.append(&auth_tag.as_slice());
    stream.append(&id_nonce.as_slice());
    stream.append(&enr_seq);
    let body = stream.out();
    let mut out = Vec::with_capacity(32 + body.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&body);
    out
}

pub fn build_ordinary(tag: &H256, auth_tag: &AuthTag, write_key: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    let mut header = RlpStream::new();
    header.begin_list(1);
    header.append(&auth_tag.as_slice());
    let header_bytes = header.out();

    let ciphertext = seal(write_key, auth_tag, tag.as_bytes(), plaintext);

    let mut out = Vec::with_capacity(32 + header_bytes.len() + ciphertext.len());
    out.extend_from_slice(tag.as_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

pub fn open_ordinary(
    tag: &H256,
    auth_tag: &AuthTag,
    ciphertext: &[u8],
    read_key: &[u8; 16],
) -> Result<Vec<u8>, PacketError> {
    open(read_key, auth_tag, tag.as_bytes(), ciphertext).ok_or(PacketError::Decrypt)
}

#[allow(clippy::too_many_arguments)]
pub fn build_handshake(
    tag: &H256,
    auth_tag: &AuthTag,
    id_nonce: &[u8; 32],
    ephemeral_public: &PublicKey,
    auth_resp_key: &[u8; 16],
    auth_response: &AuthResponse,
    write_key: &[u8; 16],
    plaintext: &[u8],
) -> Vec<u8> {
    let auth_response_plain = auth_response.encode();
    // The auth-response is sealed with an all-zero nonce: it is encrypted
    // exactly once under a key never reused for anything else.
    let auth_response_ct = seal(auth_resp_key, &[0u8; 12], tag.as_bytes(), &auth_response_plain);

    let mut header = RlpStream::new();
    header.begin_list(5);
    header.append(&auth_tag.as_slice());
    header.append(&b"gcm".as_slice());
    header.append(&id_nonce.as_slice());
    header.append(&ephemeral_public.serialize().as_slice());
    header.append(&auth_response_ct.as_slice());
    let header_bytes = header.out();

    let ciphertext = seal(write_key, auth_tag, tag.as_bytes(), plaintext);

    let mut out = Vec::with_capacity(32 + header_bytes.len() + ciphertext.len());
    out.extend_from_slice(tag.as_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

pub fn open_auth_response(
    tag: &H256,
    auth_response_ct: &[u8],
    auth_resp_key: &[u8; 16],
) -> Result<AuthResponse, PacketError> {
    let plain =
        open(auth_resp_key, &[0u8; 12], tag.as_bytes(), auth_response_ct).ok_or(PacketError::Decrypt)?;
    AuthResponse::decode(&plain).map_err(PacketError::from)
}

pub fn open_handshake_ciphertext(
    tag: &H256,
    auth_tag: &AuthTag,
    ciphertext: &[u8],
    read_key: &[u8; 16],
) -> Result<Vec<u8>, PacketError> {
    open(read_key, auth_tag, tag.as_bytes(), ciphertext).ok_or(PacketError::Decrypt)
}

fn seal(key: &[u8; 16], nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes128Gcm::new_from_slice(key).expect("16-byte key");
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .expect("aes-gcm seal cannot fail for valid inputs")
}

fn open(key: &[u8; 16], nonce: &[u8; 12], aad: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let cipher = Aes128Gcm::new_from_slice(key).ok()?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .ok()
}

/// SHA256 of the recipient's id; used by callers recovering the sender id
/// from the ordinary-packet tag.
pub fn hash_recipient(recipient_id: &NodeId) -> [u8; 32] {
    Sha256::digest(recipient_id.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ordinary_tag;

    #[test]
    fn whoareyou_round_trips() {
        let recipient = NodeId::random();
        let auth_tag = [3u8; 12];
        let id_nonce = [4u8; 32];
        let bytes = build_whoareyou(&recipient, &auth_tag, &id_nonce, 7);
        match classify(&bytes, &recipient).unwrap() {
            Packet::WhoAreYou {
                auth_tag: got_tag,
                id_nonce: got_nonce,
                enr_seq,
            } => {
                assert_eq!(got_tag, auth_tag);
                assert_eq!(got_nonce, id_nonce);
                assert_eq!(enr_seq, 7);
            }
            other => panic!("expected WhoAreYou, got {other:?}"),
        }
    }

    #[test]
    fn ordinary_message_round_trips_and_detects_tamper() {
        let sender = NodeId::random();
        let recipient = NodeId::random();
        let tag = ordinary_tag(&recipient, &sender);
        let key = [9u8; 16];
        let auth_tag = [1u8; 12];
        let plaintext = b"hello discv5".to_vec();

        let bytes = build_ordinary(&tag, &auth_tag, &key, &plaintext);
        let packet = classify(&bytes, &recipient).unwrap();
        let Packet::Ordinary {
            auth_tag: got_auth_tag,
            ciphertext,
            ..
        } = packet
        else {
            panic!("expected Ordinary packet");
        };
        let decrypted = open_ordinary(&tag, &got_auth_tag, &ciphertext, &key).unwrap();
        assert_eq!(decrypted, plaintext);

        let mut tampered = bytes.clone();
        *tampered.last_mut().unwrap() ^= 0xff;
        if let Packet::Ordinary {
            auth_tag, ciphertext, ..
        } = classify(&tampered, &recipient).unwrap()
        {
            assert!(open_ordinary(&tag, &auth_tag, &ciphertext, &key).is_err());
        }
    }

    #[test]
    fn handshake_round_trips() {
        let sender = NodeId::random();
        let recipient = NodeId::random();
        let tag = ordinary_tag(&recipient, &sender);
        let id_nonce = [5u8; 32];
        let auth_tag = [2u8; 12];
        let ephemeral_secret = secp256k1::SecretKey::new(&mut rand::rngs::OsRng);
        let ephemeral_public = PublicKey::from_secret_key_global(&ephemeral_secret);
        let auth_resp_key = [6u8; 16];
        let write_key = [7u8; 16];
        let auth_response = AuthResponse {
            id_signature: vec![0xab; 64],
            record: None,
        };
        let plaintext = b"ping payload".to_vec();

        let bytes = build_handshake(
            &tag,
            &auth_tag,
            &id_nonce,
            &ephemeral_public,
            &auth_resp_key,
            &auth_response,
            &write_key,
            &plaintext,
        );

        let Packet::Handshake {
            auth_tag: got_auth_tag,
            id_nonce: got_nonce,
            ephemeral_public: got_ephemeral,
            auth_response_ct,
            ciphertext,
            ..
        } = classify(&bytes, &recipient).unwrap()
        else {
            panic!("expected Handshake packet");
        };
        assert_eq!(got_auth_tag, auth_tag);
        assert_eq!(got_nonce, id_nonce);
        assert_eq!(got_ephemeral, ephemeral_public);

        let opened_response = open_auth_response(&tag, &auth_response_ct, &auth_resp_key).unwrap();
        assert_eq!(opened_response.id_signature, auth_response.id_signature);

        let opened_plain =
            open_handshake_ciphertext(&tag, &got_auth_tag, &ciphertext, &write_key).unwrap();
        assert_eq!(opened_plain, plaintext);
    }
}
