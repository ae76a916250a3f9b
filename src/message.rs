//! Message payloads (§4.4, §6): a one-byte kind tag followed by the RLP of
//! `[request_id, body...]`. RLP encode/decode is implemented by hand in the
//! teacher's style (see `types.rs`'s `NodeRecordPairs`) rather than through
//! derive, since the wire shape (kind byte prefix, variable body) doesn't
//! map onto a single RLP list.

use std::net::IpAddr;

use ethereum_types::H512;
use rlp::{DecoderError, Rlp, RlpStream};

use crate::error::PacketError;
use crate::types::{Address, NodeRecord};

pub type RequestId = [u8; 8];

const KIND_PING: u8 = 1;
const KIND_PONG: u8 = 2;
const KIND_FINDNODE: u8 = 3;
const KIND_NODES: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping {
        request_id: RequestId,
        enr_seq: u64,
    },
    Pong {
        request_id: RequestId,
        enr_seq: u64,
        observed_ip: IpAddr,
        observed_port: u16,
    },
    FindNode {
        request_id: RequestId,
        distance: u16,
    },
    Nodes {
        request_id: RequestId,
        total: u32,
        records: Vec<NodeRecord>,
    },
}

impl Message {
    pub fn request_id(&self) -> RequestId {
        match self {
            Message::Ping { request_id, .. }
            | Message::Pong { request_id, .. }
            | Message::FindNode { request_id, .. }
            | Message::Nodes { request_id, .. } => *request_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new();
        let kind = match self {
            Message::Ping { request_id, enr_seq } => {
                stream.begin_list(2);
                stream.append(&request_id.as_slice());
                stream.append(enr_seq);
                KIND_PING
            }
            Message::Pong {
                request_id,
                enr_seq,
                observed_ip,
                observed_port,
            } => {
                stream.begin_list(4);
                stream.append(&request_id.as_slice());
                stream.append(enr_seq);
                append_ip(&mut stream, observed_ip);
                stream.append(observed_port);
                KIND_PONG
            }
            Message::FindNode {
                request_id,
                distance,
            } => {
                stream.begin_list(2);
                stream.append(&request_id.as_slice());
                stream.append(distance);
                KIND_FINDNODE
            }
            Message::Nodes {
                request_id,
                total,
                records,
            } => {
                stream.begin_list(3);
                stream.append(&request_id.as_slice());
                stream.append(total);
                stream.begin_list(records.len());
                for record in records {
                    append_record(&mut stream, record);
                }
                KIND_NODES
            }
        };
        let body = stream.out();
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(kind);
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let (kind, body) = bytes.split_first().ok_or(PacketError::Truncated)?;
        let rlp = Rlp::new(body);
        let message = match *kind {
            KIND_PING => {
                let request_id = decode_request_id(&rlp.at(0)?)?;
                let enr_seq: u64 = rlp.val_at(1)?;
                Message::Ping { request_id, enr_seq }
            }
            KIND_PONG => {
                let request_id = decode_request_id(&rlp.at(0)?)?;
                let enr_seq: u64 = rlp.val_at(1)?;
                let observed_ip = decode_ip(&rlp.at(2)?)?;
                let observed_port: u16 = rlp.val_at(3)?;
                Message::Pong {
                    request_id,
                    enr_seq,
                    observed_ip,
                    observed_port,
                }
            }
            KIND_FINDNODE => {
                let request_id = decode_request_id(&rlp.at(0)?)?;
                let distance: u16 = rlp.val_at(1)?;
                Message::FindNode {
                    request_id,
                    distance,
                }
            }
            KIND_NODES => {
                let request_id = decode_request_id(&rlp.at(0)?)?;
                let total: u32 = rlp.val_at(1)?;
                let records_rlp = rlp.at(2)?;
                let mut records = Vec::with_capacity(records_rlp.item_count()?);
                for item in records_rlp.iter() {
                    records.push(decode_record(&item)?);
                }
                Message::Nodes {
                    request_id,
                    total,
                    records,
                }
            }
            _ => return Err(PacketError::UnsupportedPacketType),
        };
        Ok(message)
    }
}

fn decode_request_id(rlp: &Rlp) -> Result<RequestId, DecoderError> {
    let bytes: Vec<u8> = rlp.as_val()?;
    if bytes.len() != 8 {
        return Err(DecoderError::RlpInvalidLength);
    }
    let mut request_id = [0u8; 8];
    request_id.copy_from_slice(&bytes);
    Ok(request_id)
}

fn append_ip(stream: &mut RlpStream, ip: &IpAddr) {
    match ip {
        IpAddr::V4(v4) => {
            stream.append(&v4.octets().as_slice());
        }
        IpAddr::V6(v6) => {
            stream.append(&v6.octets().as_slice());
        }
    }
}

fn decode_ip(rlp: &Rlp) -> Result<IpAddr, DecoderError> {
    let bytes: Vec<u8> = rlp.as_val()?;
    match bytes.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&bytes);
            Ok(IpAddr::from(octets))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes);
            Ok(IpAddr::from(octets))
        }
        _ => Err(DecoderError::RlpInvalidLength),
    }
}

fn append_record(stream: &mut RlpStream, record: &NodeRecord) {
    stream.begin_list(6);
    stream.append(&record.seq);
    stream.append(&record.public_key.as_bytes());
    append_ip(stream, &record.address.ip);
    stream.append(&record.address.udp_port);
    stream.append(&record.address.tcp_port);
    stream.append(&record.signature.as_slice());
}

fn decode_record(rlp: &Rlp) -> Result<NodeRecord, DecoderError> {
    let seq: u64 = rlp.val_at(0)?;
    let public_key_bytes: Vec<u8> = rlp.val_at(1)?;
    if public_key_bytes.len() != 64 {
        return Err(DecoderError::RlpInvalidLength);
    }
    let public_key = H512::from_slice(&public_key_bytes);
    let ip = decode_ip(&rlp.at(2)?)?;
    let udp_port: u16 = rlp.val_at(3)?;
    let tcp_port: u16 = rlp.val_at(4)?;
    let signature: Vec<u8> = rlp.val_at(5)?;
    Ok(NodeRecord {
        seq,
        public_key,
        address: Address {
            ip,
            udp_port,
            tcp_port,
        },
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn ping_round_trips() {
        let message = Message::Ping {
            request_id: [1, 2, 3, 4, 5, 6, 7, 8],
            enr_seq: 42,
        };
        let encoded = message.encode();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn nodes_with_records_round_trips() {
        let record = NodeRecord {
            seq: 1,
            public_key: H512::repeat_byte(0xab),
            address: Address {
                ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                udp_port: 9000,
                tcp_port: 9001,
            },
            signature: vec![0xaa; 64],
        };
        let message = Message::Nodes {
            request_id: [9; 8],
            total: 1,
            records: vec![record.clone(), record],
        };
        let encoded = message.encode();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn unknown_kind_is_unsupported() {
        let bytes = [0xffu8, 0xc0];
        let err = Message::decode(&bytes).unwrap_err();
        assert!(matches!(err, PacketError::UnsupportedPacketType));
    }
}
