//! Iterative α-parallel FINDNODE traversal (§4.5). The bounded-concurrency
//! dispatch loop is grounded in the discv4 `DiscoveryLookupHandler`'s
//! `recursive_lookup`/`lookup` pair; `lookup_distances` is new (the
//! teacher's discv4 code never splits a lookup across several distances
//! per peer) but follows the spec's alternating `d+i`/`d-i` construction.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;

use crate::types::{log_distance, Node, NodeId, ALPHA, FIND_NODE_RESULT_LIMIT, K, LOOKUP_REQUEST_LIMIT};

/// What `lookup_worker` needs from the engine: a single FINDNODE exchange
/// for one distance, returning whatever `NODES` entries came back (already
/// filtered for IP validity by the caller, per §4.4).
#[async_trait]
pub trait FindNodeClient: Send + Sync {
    async fn find_node(&self, peer: Node, distance: u16) -> Vec<Node>;
}

/// `lookup_distances(target, peer.id)` (§4.5): start at the true log
/// distance, then alternately probe one step further and one step nearer
/// until `limit` distinct, in-range distances have been collected.
pub fn lookup_distances(target: &NodeId, peer_id: &NodeId, limit: usize) -> Vec<usize> {
    let base = log_distance(target, peer_id);
    let mut distances = vec![base];
    let mut i = 1usize;
    while distances.len() < limit {
        let mut progressed = false;
        if base + i < 256 {
            distances.push(base + i);
            progressed = true;
        }
        if distances.len() >= limit {
            break;
        }
        if base >= i {
            distances.push(base - i);
            progressed = true;
        }
        if !progressed {
            break;
        }
        i += 1;
    }
    distances.truncate(limit);
    distances
}

async fn lookup_worker(
    peer: Node,
    target: NodeId,
    transport: &dyn FindNodeClient,
) -> Vec<Node> {
    let distances = lookup_distances(&target, &peer.id, LOOKUP_REQUEST_LIMIT);
    let mut accumulated = Vec::new();
    for distance in distances {
        let found = transport.find_node(peer.clone(), distance as u16).await;
        accumulated.extend(found);
        if accumulated.len() >= FIND_NODE_RESULT_LIMIT {
            break;
        }
    }
    accumulated
}

/// `lookup(target_id)`: returns up to `K` closest nodes to `target_id`
/// known to the network, seeded from `seed` (the engine's
/// `neighbours(target_id, K)`).
pub async fn lookup(
    local_id: NodeId,
    target_id: NodeId,
    seed: Vec<Node>,
    transport: &dyn FindNodeClient,
) -> Vec<Node> {
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut asked: HashSet<NodeId> = HashSet::new();
    seen.insert(local_id);
    asked.insert(local_id);

    let mut result: Vec<Node> = Vec::new();
    for node in seed {
        if seen.insert(node.id) {
            result.push(node);
        }
    }
    result.sort_by_key(|n| log_distance(&target_id, &n.id));

    let mut in_flight = FuturesUnordered::new();

    loop {
        while in_flight.len() < ALPHA {
            let next = result
                .iter()
                .find(|n| !asked.contains(&n.id))
                .cloned();
            let Some(candidate) = next else {
                break;
            };
            asked.insert(candidate.id);
            in_flight.push(lookup_worker(candidate, target_id, transport));
        }

        if in_flight.is_empty() {
            break;
        }

        let Some(found_nodes) = in_flight.next().await else {
            break;
        };

        for node in found_nodes {
            if seen.insert(node.id) && result.len() < K {
                result.push(node);
            }
        }
        result.sort_by_key(|n| log_distance(&target_id, &n.id));
    }

    result.truncate(K);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, NodeRecord};
    use ethereum_types::H512;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[test]
    fn lookup_distances_alternate_around_base() {
        let target = NodeId::zero();
        let peer = NodeId::repeat_byte(0x01); // log_distance = 256
        let distances = lookup_distances(&target, &peer, 3);
        assert_eq!(distances.len(), 3);
        assert_eq!(distances[0], 256);
    }

    #[test]
    fn lookup_distances_near_zero_stops_early() {
        let target = NodeId::zero();
        let peer = NodeId::zero();
        let distances = lookup_distances(&target, &peer, 3);
        // base == 0; d-1 underflows (skipped), only d and d+1 are valid.
        assert_eq!(distances, vec![0, 1]);
    }

    fn node_with_id(id: NodeId) -> Node {
        Node {
            id,
            record: NodeRecord {
                seq: 1,
                public_key: H512::zero(),
                address: Address {
                    ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                    udp_port: 1,
                    tcp_port: 1,
                },
                signature: Vec::new(),
            },
        }
    }

    struct NetworkTransport {
        nodes_by_id: std::collections::HashMap<NodeId, Vec<Node>>,
        concurrent: Arc<AtomicUsize>,
        max_concurrent: Arc<AtomicUsize>,
        in_flight_lock: Arc<Mutex<()>>,
    }

    #[async_trait]
    impl FindNodeClient for NetworkTransport {
        async fn find_node(&self, peer: Node, _distance: u16) -> Vec<Node> {
            let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(current, Ordering::SeqCst);
            let _guard = self.in_flight_lock.lock().await;
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.nodes_by_id.get(&peer.id).cloned().unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn lookup_terminates_and_respects_alpha() {
        let local_id = NodeId::random();
        let target = NodeId::random();

        let mut nodes_by_id = std::collections::HashMap::new();
        let mut seed = Vec::new();
        for _ in 0..10 {
            let id = NodeId::random();
            let node = node_with_id(id);
            let neighbour = node_with_id(NodeId::random());
            nodes_by_id.insert(id, vec![neighbour]);
            seed.push(node);
        }

        let transport = NetworkTransport {
            nodes_by_id,
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_concurrent: Arc::new(AtomicUsize::new(0)),
            in_flight_lock: Arc::new(Mutex::new(())),
        };

        let max_concurrent = transport.max_concurrent.clone();
        let result = lookup(local_id, target, seed, &transport).await;
        assert!(result.len() <= K);
        let mut ids: HashSet<NodeId> = HashSet::new();
        for node in &result {
            assert!(ids.insert(node.id), "duplicate node in lookup result");
        }
        assert!(max_concurrent.load(Ordering::SeqCst) <= ALPHA);
    }
}
