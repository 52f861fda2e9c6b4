// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The DHT subsystems the pathfinder orchestrates (node store, search runner, rumor
//! mill, router) have their actual Kademlia-style implementation elsewhere. What's
//! here is the handful of operations the pathfinder event loop calls through, as
//! traits, plus a small in-memory implementation of each sufficient to exercise the
//! event dispatch.

use std::collections::HashMap;

use crate::address::Ip6;
use crate::pfchan::NodeInfo;
use crate::protocol::{DataHeader, RouteHeader};

/// A known link to a node: its address and the switch label it was last seen at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeHandle {
    pub ip6: Ip6,
    pub public_key: [u8; 32],
    pub label: u64,
    pub metric: u32,
    pub version: u32,
}

pub trait NodeStore: Send {
    fn link_for_path(&self, label: u64) -> Option<NodeHandle>;
    fn broken_link(&mut self, ip6: &Ip6);
    fn disconnected_peer(&mut self, label: u64);
    fn node_for_addr(&self, ip6: &Ip6) -> Option<NodeHandle>;
    fn add_node(&mut self, node: &NodeInfo);
    fn pin_node(&mut self, ip6: &Ip6);
    fn unpin_node(&mut self, ip6: &Ip6);
    fn is_direct_child_with_label(&self, ip6: &Ip6, label: u64) -> bool;
}

pub trait SearchRunner: Send {
    fn start_search(&mut self, ip6: Ip6);
    fn start_refined_search(&mut self, ip6: Ip6, bucket_size: usize, concurrency: usize);
}

pub trait RumorMill: Send {
    fn insert(&mut self, node: NodeInfo);
    fn capacity(&self) -> usize;
    fn len(&self) -> usize;
}

pub trait Router: Send {
    fn send_get_peers(&mut self, node: &NodeHandle);
}

/// Outcome of handing an inbound DHT message to the registry: whether it wants an
/// immediate reply and whether it learned a protocol version for the sender.
pub struct DhtMessageOutcome {
    pub reply: Option<Vec<u8>>,
    pub learned_version: Option<u32>,
}

pub trait DhtRegistry: Send {
    fn handle_message(&mut self, route_header: &RouteHeader, data_header: &DataHeader, payload: &[u8]) -> DhtMessageOutcome;
}

/// In-memory node store keyed by both IPv6 and switch label.
#[derive(Default)]
pub struct SimpleNodeStore {
    by_ip6: HashMap<Ip6, NodeHandle>,
    by_label: HashMap<u64, Ip6>,
    pinned: std::collections::HashSet<Ip6>,
}

impl SimpleNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeStore for SimpleNodeStore {
    fn link_for_path(&self, label: u64) -> Option<NodeHandle> {
        self.by_label.get(&label).and_then(|ip6| self.by_ip6.get(ip6)).cloned()
    }

    fn broken_link(&mut self, ip6: &Ip6) {
        if let Some(node) = self.by_ip6.get_mut(ip6) {
            node.metric = crate::protocol::DEAD_LINK;
        }
    }

    fn disconnected_peer(&mut self, label: u64) {
        if let Some(ip6) = self.by_label.remove(&label) {
            self.by_ip6.remove(&ip6);
        }
    }

    fn node_for_addr(&self, ip6: &Ip6) -> Option<NodeHandle> {
        self.by_ip6.get(ip6).cloned()
    }

    fn add_node(&mut self, node: &NodeInfo) {
        self.by_label.insert(node.path, node.ip6);
        self.by_ip6.insert(
            node.ip6,
            NodeHandle { ip6: node.ip6, public_key: node.public_key, label: node.path, metric: node.metric, version: node.version },
        );
    }

    fn pin_node(&mut self, ip6: &Ip6) {
        self.pinned.insert(*ip6);
    }

    fn unpin_node(&mut self, ip6: &Ip6) {
        self.pinned.remove(ip6);
    }

    fn is_direct_child_with_label(&self, ip6: &Ip6, label: u64) -> bool {
        self.by_ip6.get(ip6).map(|n| n.label == label).unwrap_or(false)
    }
}

/// No-op search runner; records the searches it was asked to run, for tests.
#[derive(Default)]
pub struct LoggingSearchRunner {
    pub searches: Vec<Ip6>,
    pub refined_searches: Vec<(Ip6, usize, usize)>,
}

impl SearchRunner for LoggingSearchRunner {
    fn start_search(&mut self, ip6: Ip6) {
        self.searches.push(ip6);
    }

    fn start_refined_search(&mut self, ip6: Ip6, bucket_size: usize, concurrency: usize) {
        self.refined_searches.push((ip6, bucket_size, concurrency));
    }
}

/// Bounded FIFO rumor mill (default capacity 64).
pub struct BoundedRumorMill {
    capacity: usize,
    entries: std::collections::VecDeque<NodeInfo>,
}

impl BoundedRumorMill {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: std::collections::VecDeque::new() }
    }
}

impl RumorMill for BoundedRumorMill {
    fn insert(&mut self, node: NodeInfo) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(node);
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// No-op router; records get-peers queries sent, for tests.
#[derive(Default)]
pub struct LoggingRouter {
    pub get_peers_sent: Vec<Ip6>,
}

impl Router for LoggingRouter {
    fn send_get_peers(&mut self, node: &NodeHandle) {
        self.get_peers_sent.push(node.ip6);
    }
}

/// Minimal DHT registry stub: never wants a reply, never learns a version. A real
/// registry would parse the CJDHT payload and run the Kademlia protocol.
#[derive(Default)]
pub struct NullDhtRegistry;

impl DhtRegistry for NullDhtRegistry {
    fn handle_message(&mut self, _route_header: &RouteHeader, _data_header: &DataHeader, _payload: &[u8]) -> DhtMessageOutcome {
        DhtMessageOutcome { reply: None, learned_version: None }
    }
}
