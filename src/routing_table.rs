//! The 256-bucket Kademlia routing table (§3, §4.2). Bucket layout and
//! replacement-cache mechanics are grounded in the teacher's top-level
//! `kademlia.rs` (`MAX_NODES_PER_BUCKET`, `NUMBER_OF_BUCKETS`, FIFO
//! replacement eviction); the actor-owned, no-back-pointer shape follows
//! the discv5 server's single-owner model (§9).

use std::collections::VecDeque;

use crate::types::{log_distance, Node, NodeId, K, NUMBER_OF_BUCKETS};

/// Live nodes ordered oldest-seen (head, eviction candidate) to
/// newest-seen (tail), plus a bounded FIFO of replacement candidates.
#[derive(Debug, Default, Clone)]
pub struct Bucket {
    live: VecDeque<Node>,
    replacements: VecDeque<Node>,
}

impl Bucket {
    pub fn live(&self) -> impl Iterator<Item = &Node> {
        self.live.iter()
    }

    pub fn is_full(&self) -> bool {
        self.live.len() >= K
    }
}

pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
    /// Round-robin cursor for `node_to_revalidate`.
    revalidation_cursor: usize,
}

/// Outcome of [`RoutingTable::add_node`], observable by tests and callers
/// that want to log admission decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// `node` was already resident; it was moved to the tail.
    RefreshedExisting,
    /// `node` was appended to a bucket with free capacity.
    Inserted,
    /// The bucket was full; `node` was pushed onto the replacement cache.
    Replaced,
    /// `node.id == self_id`.
    RejectedSelf,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        RoutingTable {
            local_id,
            buckets: vec![Bucket::default(); NUMBER_OF_BUCKETS + 1],
            revalidation_cursor: 0,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        log_distance(&self.local_id, id)
    }

    pub fn add_node(&mut self, node: Node) -> AddOutcome {
        let distance = self.bucket_index(&node.id);
        if distance == 0 {
            return AddOutcome::RejectedSelf;
        }
        let bucket = &mut self.buckets[distance];

        if let Some(pos) = bucket.live.iter().position(|n| n.id == node.id) {
            bucket.live.remove(pos);
            bucket.live.push_back(node);
            return AddOutcome::RefreshedExisting;
        }

        if bucket.live.len() < K {
            bucket.live.push_back(node);
            return AddOutcome::Inserted;
        }

        if bucket.replacements.iter().any(|n| n.id == node.id) {
            return AddOutcome::Replaced;
        }
        if bucket.replacements.len() >= K {
            bucket.replacements.pop_front();
        }
        bucket.replacements.push_back(node);
        AddOutcome::Replaced
    }

    /// Removes `id` from its bucket, promoting the newest replacement
    /// candidate into the vacated slot if one is available.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        let distance = self.bucket_index(id);
        let bucket = &mut self.buckets[distance];
        let pos = bucket.live.iter().position(|n| &n.id == id)?;
        let removed = bucket.live.remove(pos)?;
        if let Some(promoted) = bucket.replacements.pop_back() {
            bucket.live.push_back(promoted);
        }
        Some(removed)
    }

    pub fn set_just_seen(&mut self, id: &NodeId) {
        let distance = self.bucket_index(id);
        let bucket = &mut self.buckets[distance];
        if let Some(pos) = bucket.live.iter().position(|n| &n.id == id) {
            let node = bucket.live.remove(pos).expect("position just found");
            bucket.live.push_back(node);
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        let distance = self.bucket_index(id);
        self.buckets[distance].live.iter().find(|n| &n.id == id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn neighbours_at_distance(&self, distance: usize) -> Vec<Node> {
        if distance == 0 {
            return Vec::new();
        }
        self.buckets
            .get(distance)
            .map(|bucket| bucket.live.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The `k` nodes with smallest XOR distance to `target_id`. Scans
    /// buckets in expanding order around `log_distance(self_id, target_id)`
    /// so a table with a handful of populated buckets near the target
    /// doesn't need a full table scan; falls back to an exact sort of
    /// whatever was collected.
    pub fn neighbours(&self, target_id: &NodeId, k: usize) -> Vec<Node> {
        let center = self.bucket_index(target_id);
        let mut candidates: Vec<Node> = Vec::new();
        for offset in 0..=NUMBER_OF_BUCKETS {
            if center >= offset {
                candidates.extend(self.buckets[center - offset].live.iter().cloned());
            }
            if offset != 0 && center + offset <= NUMBER_OF_BUCKETS {
                candidates.extend(self.buckets[center + offset].live.iter().cloned());
            }
            if candidates.len() >= k {
                break;
            }
        }
        candidates.sort_by_key(|n| log_distance(target_id, &n.id));
        candidates.truncate(k);
        candidates
    }

    /// The head (least-recently-seen) node of a bucket chosen in
    /// round-robin order across all non-empty buckets.
    pub fn node_to_revalidate(&mut self) -> Option<Node> {
        let total = self.buckets.len();
        for step in 0..total {
            let idx = (self.revalidation_cursor + step) % total;
            if let Some(node) = self.buckets[idx].live.front().cloned() {
                self.revalidation_cursor = (idx + 1) % total;
                return Some(node);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.live.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
