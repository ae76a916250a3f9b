//! Request/response correlation (§4.3). Two registries, each keyed
//! differently and each self-expiring after `RESPONSE_TIMEOUT`: pending
//! outbound packets by `auth_tag` (for WHOAREYOU re-encryption), and
//! awaited replies by `(node_id, request_id)`. Grounded in the discv5
//! server's `pending_by_nonce` map and the discv4 `find_node_and_wait_for_response`
//! accumulation loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::codec::AuthTag;
use crate::message::{Message, RequestId};
use crate::types::{Node, NodeId};

pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// The plaintext of a just-sent request, retained so it can be re-sealed
/// under freshly derived session keys if the remote answers with
/// WHOAREYOU instead of a direct reply.
pub struct PendingRequest {
    pub dest: Node,
    pub dest_addr: SocketAddr,
    pub plaintext: Vec<u8>,
    pub deadline: Instant,
}

/// A single completion slot for an outstanding request. `NODES` replies
/// reuse the slot up to `total` times; the accumulator tracks how many
/// segments are still owed and the nodes seen so far.
struct Slot {
    sender: Option<oneshot::Sender<Option<Message>>>,
    accumulator: Vec<Message>,
    remaining_segments: Option<u32>,
    deadline: Instant,
}

/// Handle returned to a caller awaiting a response; `recv` consumes
/// whatever arrived (or `None` on timeout/cancellation).
pub struct AwaitedResponse {
    receiver: oneshot::Receiver<Option<Message>>,
}

impl AwaitedResponse {
    pub async fn recv(self) -> Option<Message> {
        self.receiver.await.ok().flatten()
    }
}

#[derive(Default)]
pub struct RequestTracker {
    pending_by_auth_tag: HashMap<AuthTag, PendingRequest>,
    awaited: HashMap<(NodeId, RequestId), Slot>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pending(&mut self, auth_tag: AuthTag, pending: PendingRequest) {
        self.pending_by_auth_tag.insert(auth_tag, pending);
    }

    pub fn take_pending(&mut self, auth_tag: &AuthTag) -> Option<PendingRequest> {
        self.pending_by_auth_tag.remove(auth_tag)
    }

    /// Registers a completion slot for `(node_id, request_id)` and returns
    /// the handle the caller awaits. `expects_multi_part` should be `true`
    /// for FINDNODE requests, whose `NODES` reply may span several packets.
    pub fn await_response(
        &mut self,
        node_id: NodeId,
        request_id: RequestId,
    ) -> AwaitedResponse {
        let (sender, receiver) = oneshot::channel();
        self.awaited.insert(
            (node_id, request_id),
            Slot {
                sender: Some(sender),
                accumulator: Vec::new(),
                remaining_segments: None,
                deadline: Instant::now() + RESPONSE_TIMEOUT,
            },
        );
        AwaitedResponse { receiver }
    }

    /// Delivers a single reply that completes the slot outright (PONG, or
    /// any non-multipart response).
    pub fn complete(&mut self, node_id: NodeId, request_id: RequestId, message: Message) {
        if let Some(mut slot) = self.awaited.remove(&(node_id, request_id)) {
            if let Some(sender) = slot.sender.take() {
                let _ = sender.send(Some(message));
            }
        }
    }

    /// Delivers one segment of a multi-packet `NODES` response. Returns
    /// `true` once `total` segments have arrived (the slot is then
    /// consumed and the caller's awaited future resolves to the merged
    /// `Nodes` message with `total` left as the last segment's value).
    pub fn deliver_nodes_segment(
        &mut self,
        node_id: NodeId,
        request_id: RequestId,
        total: u32,
        mut records: Vec<crate::types::NodeRecord>,
    ) {
        let Some(slot) = self.awaited.get_mut(&(node_id, request_id)) else {
            return;
        };
        if slot.remaining_segments.is_none() {
            slot.remaining_segments = Some(total);
        }
        if let Some(Message::Nodes {
            records: existing, ..
        }) = slot.accumulator.first_mut()
        {
            existing.append(&mut records);
        } else {
            slot.accumulator.push(Message::Nodes {
                request_id,
                total,
                records,
            });
        }
        if let Some(remaining) = slot.remaining_segments.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                if let Some(mut slot) = self.awaited.remove(&(node_id, request_id)) {
                    if let (Some(sender), Some(merged)) =
                        (slot.sender.take(), slot.accumulator.pop())
                    {
                        let _ = sender.send(Some(merged));
                    }
                }
            }
        }
    }

    /// Expires any pending request or awaited slot past its deadline.
    /// Awaited slots resolve their waiter with whatever partial `NODES`
    /// result had accumulated so far (§4.4: "upon any missing or
    /// malformed response in the sequence, the accumulated partial
    /// result is returned"), or `None` if nothing had arrived yet.
    /// Expired pending requests are simply dropped (there is nothing
    /// left to re-send to).
    pub fn reap_expired(&mut self) {
        let now = Instant::now();
        self.pending_by_auth_tag.retain(|_, p| p.deadline > now);
        let expired_keys: Vec<_> = self
            .awaited
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in expired_keys {
            if let Some(mut slot) = self.awaited.remove(&key) {
                if let Some(sender) = slot.sender.take() {
                    let _ = sender.send(slot.accumulator.pop());
                }
            }
        }
    }

    /// Cancellation (§5): resolve every outstanding slot to "no response".
    pub fn cancel_all(&mut self) {
        for (_, mut slot) in self.awaited.drain() {
            if let Some(sender) = slot.sender.take() {
                let _ = sender.send(None);
            }
        }
        self.pending_by_auth_tag.clear();
    }

    pub fn has_pending(&self, auth_tag: &AuthTag) -> bool {
        self.pending_by_auth_tag.contains_key(auth_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn dummy_node() -> Node {
        use crate::types::{Address, NodeRecord};
        Node {
            id: NodeId::random(),
            record: NodeRecord {
                seq: 1,
                public_key: ethereum_types::H512::zero(),
                address: Address {
                    ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                    udp_port: 1,
                    tcp_port: 1,
                },
                signature: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn timeout_clears_slot_and_resolves_none() {
        let mut tracker = RequestTracker::new();
        let node_id = NodeId::random();
        let request_id = [1u8; 8];
        let awaited = tracker.await_response(node_id, request_id);

        // Force-expire without waiting out the real two-second timeout.
        tracker.awaited.get_mut(&(node_id, request_id)).unwrap().deadline =
            Instant::now() - Duration::from_millis(1);
        tracker.reap_expired();

        assert_eq!(awaited.recv().await, None);
        assert!(tracker.awaited.is_empty());
    }

    #[tokio::test]
    async fn multi_packet_nodes_accumulate_out_of_order() {
        let mut tracker = RequestTracker::new();
        let node_id = NodeId::random();
        let request_id = [2u8; 8];
        let awaited = tracker.await_response(node_id, request_id);

        let node_a = dummy_node();
        let node_b = dummy_node();
        let node_c = dummy_node();

        tracker.deliver_nodes_segment(node_id, request_id, 3, vec![node_b.record.clone()]);
        tracker.deliver_nodes_segment(node_id, request_id, 3, vec![node_a.record.clone()]);
        tracker.deliver_nodes_segment(node_id, request_id, 3, vec![node_c.record.clone()]);

        let Some(Message::Nodes { records, .. }) = awaited.recv().await else {
            panic!("expected merged Nodes message");
        };
        assert_eq!(records.len(), 3);
    }

    /// §4.4: a timeout mid-sequence still returns whatever partial
    /// `NODES` result had accumulated, rather than discarding it.
    #[tokio::test]
    async fn timeout_mid_sequence_returns_partial_nodes_result() {
        let mut tracker = RequestTracker::new();
        let node_id = NodeId::random();
        let request_id = [3u8; 8];
        let awaited = tracker.await_response(node_id, request_id);

        let node_a = dummy_node();
        tracker.deliver_nodes_segment(node_id, request_id, 2, vec![node_a.record.clone()]);

        tracker.awaited.get_mut(&(node_id, request_id)).unwrap().deadline =
            Instant::now() - Duration::from_millis(1);
        tracker.reap_expired();

        let Some(Message::Nodes { records, .. }) = awaited.recv().await else {
            panic!("expected a partial merged Nodes message, not None");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], node_a.record);
        assert!(tracker.awaited.is_empty());
    }

    #[tokio::test]
    async fn pending_request_retrievable_by_auth_tag() {
        let mut tracker = RequestTracker::new();
        let auth_tag = [5u8; 12];
        tracker.register_pending(
            auth_tag,
            PendingRequest {
                dest: dummy_node(),
                dest_addr: "127.0.0.1:9000".parse().unwrap(),
                plaintext: vec![1, 2, 3],
                deadline: Instant::now() + RESPONSE_TIMEOUT,
            },
        );
        assert!(tracker.has_pending(&auth_tag));
        let taken = tracker.take_pending(&auth_tag).unwrap();
        assert_eq!(taken.plaintext, vec![1, 2, 3]);
        assert!(!tracker.has_pending(&auth_tag));
    }
}
