//! Core data model: node identities, addresses and the (intentionally thin)
//! ENR stand-in. The real ENR codec is an external collaborator; `NodeRecord`
//! here only carries the fields the engine itself inspects.

use std::net::IpAddr;

use ethereum_types::{H256, H512};
use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey};
use sha2::{Digest, Sha256};

pub const K: usize = 16;
pub const ALPHA: usize = 3;
pub const MAX_NODES_PER_PACKET: usize = 3;
pub const FIND_NODE_RESULT_LIMIT: usize = 15;
pub const LOOKUP_REQUEST_LIMIT: usize = 3;
pub const NUMBER_OF_BUCKETS: usize = 256;

pub type NodeId = H256;

/// `SHA256(serialize(public_key))`, per the discv5 identity scheme (not the
/// Keccak-256 discv4 uses).
pub fn node_id_from_public_key(public_key: &H512) -> NodeId {
    let digest = Sha256::digest(public_key.as_bytes());
    H256::from_slice(&digest)
}

/// `log_distance(a, b) = 256 - leading_zero_bits(a XOR b)`, `0` iff `a == b`.
pub fn log_distance(a: &NodeId, b: &NodeId) -> usize {
    if a == b {
        return 0;
    }
    let mut xor = [0u8; 32];
    for i in 0..32 {
        xor[i] = a[i] ^ b[i];
    }
    let leading_zeros: usize = xor
        .iter()
        .enumerate()
        .find(|(_, &byte)| byte != 0)
        .map(|(i, &byte)| i * 8 + byte.leading_zeros() as usize)
        .unwrap_or(256);
    256 - leading_zeros
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Address {
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.udp_port)
    }

    /// discv5 admission rule from §4.4/§8.3/§3: an advertised address is
    /// only useful if it could plausibly originate where it claims to.
    pub fn is_globally_valid_from(&self, observed: &IpAddr) -> bool {
        if self.ip.is_multicast() || is_any_local(&self.ip) {
            return false;
        }
        if is_loopback(&self.ip) && !is_loopback(observed) {
            return false;
        }
        if is_site_local(&self.ip) && !is_site_local(observed) {
            return false;
        }
        true
    }
}

fn is_any_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}

fn is_loopback(ip: &IpAddr) -> bool {
    ip.is_loopback()
}

fn is_site_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.octets()[0] == 10
            || (v4.octets()[0] == 172 && (16..=31).contains(&v4.octets()[1]))
            || (v4.octets()[0] == 192 && v4.octets()[1] == 168),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// A signed node record: opaque to us beyond the fields used for admission
/// and session bookkeeping. `seq` is monotonically increasing; a lower `seq`
/// never supersedes a higher one for the same `public_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub seq: u64,
    pub public_key: H512,
    pub address: Address,
    pub signature: Vec<u8>,
}

impl NodeRecord {
    /// Digest that the record's signature covers: `sha256(seq || pubkey || ip || ports)`.
    pub fn signing_digest(
        seq: u64,
        public_key: &H512,
        address: &Address,
    ) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(seq.to_be_bytes());
        hasher.update(public_key.as_bytes());
        match address.ip {
            IpAddr::V4(v4) => hasher.update(v4.octets()),
            IpAddr::V6(v6) => hasher.update(v6.octets()),
        }
        hasher.update(address.udp_port.to_be_bytes());
        hasher.update(address.tcp_port.to_be_bytes());
        hasher.finalize().into()
    }

    pub fn sign(
        seq: u64,
        public_key: H512,
        address: Address,
        signing_key: &SecretKey,
    ) -> Self {
        let digest = Self::signing_digest(seq, &public_key, &address);
        let message = Message::from_digest(digest);
        let signature = signing_key.sign_ecdsa(message);
        NodeRecord {
            seq,
            public_key,
            address,
            signature: signature.serialize_compact().to_vec(),
        }
    }

    pub fn verify_signature(&self) -> bool {
        let digest = Self::signing_digest(self.seq, &self.public_key, &self.address);
        let Ok(message) = Message::from_digest_slice(&digest) else {
            return false;
        };
        let Ok(signature) = Signature::from_compact(&self.signature) else {
            return false;
        };
        let mut uncompressed = [0u8; 65];
        uncompressed[0] = 0x04;
        uncompressed[1..].copy_from_slice(self.public_key.as_bytes());
        let Ok(public_key) = PublicKey::from_slice(&uncompressed) else {
            return false;
        };
        secp256k1::ecdsa::Signature::verify(&signature, &message, &public_key).is_ok()
    }
}

/// `(id, record, address)`. The invariant `id = hash(record.public_key)` is
/// enforced by [`Node::new`]; callers never construct a `Node` with a
/// mismatched id directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub record: NodeRecord,
}

impl Node {
    pub fn new(record: NodeRecord) -> Self {
        let id = node_id_from_public_key(&record.public_key);
        Node { id, record }
    }

    pub fn address(&self) -> Address {
        self.record.address
    }

    /// `true` if `other` carries a strictly newer ENR for the same identity.
    pub fn supersedes(&self, other: &Node) -> bool {
        self.id == other.id && self.record.seq > other.record.seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn log_distance_self_is_zero() {
        let id = H256::random();
        assert_eq!(log_distance(&id, &id), 0);
    }

    #[test]
    fn log_distance_max_for_complementary_ids() {
        let a = H256::zero();
        let b = H256::repeat_byte(0xff);
        assert_eq!(log_distance(&a, &b), 256);
    }

    #[test]
    fn address_rejects_multicast_and_any_local() {
        let observed = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        let multicast = Address {
            ip: IpAddr::V4(Ipv4Addr::new(224, 0, 0, 1)),
            udp_port: 30303,
            tcp_port: 30303,
        };
        assert!(!multicast.is_globally_valid_from(&observed));

        let unspecified = Address {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port: 30303,
            tcp_port: 30303,
        };
        assert!(!unspecified.is_globally_valid_from(&observed));
    }

    #[test]
    fn address_loopback_only_valid_from_loopback() {
        let loopback_addr = Address {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port: 1,
            tcp_port: 1,
        };
        assert!(!loopback_addr.is_globally_valid_from(&IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
        assert!(loopback_addr.is_globally_valid_from(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn record_signature_round_trip() {
        let signing_key = SecretKey::new(&mut rand::rngs::OsRng);
        let public_key = PublicKey::from_secret_key_global(&signing_key);
        let public_key_bytes = H512::from_slice(&public_key.serialize_uncompressed()[1..]);
        let address = Address {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            udp_port: 9000,
            tcp_port: 9000,
        };
        let record = NodeRecord::sign(1, public_key_bytes, address, &signing_key);
        assert!(record.verify_signature());

        let mut tampered = record.clone();
        tampered.seq = 2;
        assert!(!tampered.verify_signature());
    }
}
