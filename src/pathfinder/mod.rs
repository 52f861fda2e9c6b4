// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The pathfinder event loop: a state machine that starts `INITIALIZING`, comes up
//! once on the first `CONNECT` event, and then dispatches every subsequent
//! `CoreEvent` to a handler in [`handlers`] while `RUNNING`.

pub mod dht;
mod handlers;

use tracing::debug;

use crate::address::{Address, PublicKey};
use crate::config::Settings;
use crate::pfchan::{CoreEvent, PFChan, PathfinderEvent};
use dht::{
    BoundedRumorMill, DhtMessageOutcome, DhtRegistry, LoggingRouter, LoggingSearchRunner, NodeStore, NullDhtRegistry, Router,
    RumorMill, SearchRunner, SimpleNodeStore,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Initializing,
    Running,
}

/// The protocol version this implementation advertises in its own `CONNECT` self
/// announcement. Chosen to be distinct from `0` (the wire sentinel for "no version
/// known").
pub const PROTOCOL_VERSION: u32 = 18;

/// User agent string sent in the pathfinder's own `CONNECT` announcement, zero-padded
/// to the fixed 64-byte field.
const USER_AGENT: &[u8] = b"meshcore internal pathfinder";

fn user_agent_field() -> [u8; 64] {
    let mut field = [0u8; 64];
    let n = USER_AGENT.len().min(64);
    field[..n].copy_from_slice(&USER_AGENT[..n]);
    field
}

/// The pathfinder half of the control plane. Holds no session state of its own --
/// that's the session manager's job -- just the DHT subsystems it orchestrates and
/// the event dispatch table that drives them.
pub struct Pathfinder {
    state: State,
    my_addr: Option<Address>,
    settings: Settings,
    registry: Option<Box<dyn DhtRegistry>>,
    node_store: Option<Box<dyn NodeStore>>,
    router: Option<Box<dyn Router>>,
    search_runner: Option<Box<dyn SearchRunner>>,
    rumor_mill: Option<Box<dyn RumorMill>>,
}

impl Pathfinder {
    pub fn new(settings: Settings) -> Self {
        Self { state: State::Initializing, my_addr: None, settings, registry: None, node_store: None, router: None, search_runner: None, rumor_mill: None }
    }

    /// Constructs a pathfinder with custom DHT subsystem implementations already
    /// `RUNNING`, bypassing `CONNECT` -- used by tests that want to inject mocks and
    /// skip construction boilerplate.
    #[cfg(test)]
    fn running_with(
        settings: Settings,
        my_addr: Address,
        registry: Box<dyn DhtRegistry>,
        node_store: Box<dyn NodeStore>,
        router: Box<dyn Router>,
        search_runner: Box<dyn SearchRunner>,
        rumor_mill: Box<dyn RumorMill>,
    ) -> Self {
        Self {
            state: State::Running,
            my_addr: Some(my_addr),
            settings,
            registry: Some(registry),
            node_store: Some(node_store),
            router: Some(router),
            search_runner: Some(search_runner),
            rumor_mill: Some(rumor_mill),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    pub fn my_addr(&self) -> Option<&Address> {
        self.my_addr.as_ref()
    }

    /// Emits this pathfinder's own `CONNECT` self-announcement. Call once, right
    /// after registering the pathfinder on the channel.
    pub fn announce_self(&self, chan: &mut PFChan, public_key: PublicKey) {
        chan.send_to_core(PathfinderEvent::Connect {
            public_key,
            superiority: 1,
            version: PROTOCOL_VERSION,
            user_agent: user_agent_field(),
        });
    }

    /// Dispatches one event arriving from the session manager. Any event other than
    /// `CONNECT` while `INITIALIZING` is a protocol violation and a fatal assertion.
    pub fn handle_event(&mut self, event: CoreEvent, chan: &mut PFChan, _now_ms: i64) {
        if self.state == State::Initializing {
            match event {
                CoreEvent::Connect { public_key, .. } => self.connect(public_key),
                other => panic!("pathfinder received {:?} before CONNECT", other),
            }
            return;
        }

        match event {
            CoreEvent::SwitchErr { failing_label, error_type, .. } => handlers::switch_err(self, failing_label, error_type),
            CoreEvent::SearchReq { ip6 } => handlers::search_req(self, ip6),
            CoreEvent::Peer { node } => handlers::peer(self, node),
            CoreEvent::PeerGone { node } => handlers::peer_gone(self, node),
            CoreEvent::Session { node, .. } => handlers::session(self, node),
            CoreEvent::SessionEnded { node } => handlers::session_ended(self, node),
            CoreEvent::DiscoveredPath { node } => handlers::discovered_path(self, node),
            CoreEvent::UnsetupSession { ip6 } => handlers::unsetup_session(self, ip6),
            CoreEvent::Msg { route_header, data_header, payload } => handlers::msg(self, chan, route_header, data_header, payload),
            CoreEvent::Ping => handlers::ping(chan),
            CoreEvent::Pong => handlers::pong(),
            CoreEvent::Connect { .. } => panic!("pathfinder received CONNECT while already RUNNING"),
        }
    }

    fn connect(&mut self, public_key: PublicKey) {
        debug!("init");
        let mut addr = Address::from_public_key(public_key);
        addr.label = 1;
        self.my_addr = Some(addr);

        self.registry = Some(Box::new(NullDhtRegistry));
        self.rumor_mill = Some(Box::new(BoundedRumorMill::new(self.settings.rumor_mill_capacity)));
        self.node_store = Some(Box::new(SimpleNodeStore::new()));
        self.router = Some(Box::new(LoggingRouter::default()));
        self.search_runner = Some(Box::new(LoggingSearchRunner::default()));

        self.state = State::Running;
    }

    fn node_store(&self) -> &dyn NodeStore {
        self.node_store.as_deref().expect("RUNNING implies node_store is set")
    }

    fn node_store_mut(&mut self) -> &mut dyn NodeStore {
        self.node_store.as_deref_mut().expect("RUNNING implies node_store is set")
    }

    fn router_mut(&mut self) -> &mut dyn Router {
        self.router.as_deref_mut().expect("RUNNING implies router is set")
    }

    fn search_runner_mut(&mut self) -> &mut dyn SearchRunner {
        self.search_runner.as_deref_mut().expect("RUNNING implies search_runner is set")
    }

    fn rumor_mill_mut(&mut self) -> &mut dyn RumorMill {
        self.rumor_mill.as_deref_mut().expect("RUNNING implies rumor_mill is set")
    }

    fn registry_mut(&mut self) -> &mut dyn DhtRegistry {
        self.registry.as_deref_mut().expect("RUNNING implies registry is set")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pfchan::NodeInfo;
    use crate::protocol::{ContentType, DataHeader, RouteHeader};

    fn connected_pathfinder() -> Pathfinder {
        let mut pf = Pathfinder::new(Settings::default());
        let mut chan = PFChan::new();
        pf.handle_event(CoreEvent::Connect { public_key: [1u8; 32], superiority: 1, version: 18, user_agent: [0u8; 64] }, &mut chan, 0);
        pf
    }

    #[test]
    fn non_connect_event_while_initializing_is_fatal() {
        let result = std::panic::catch_unwind(|| {
            let mut pf = Pathfinder::new(Settings::default());
            let mut chan = PFChan::new();
            pf.handle_event(CoreEvent::Ping, &mut chan, 0);
        });
        assert!(result.is_err());
    }

    #[test]
    fn connect_transitions_to_running_and_derives_address() {
        let pf = connected_pathfinder();
        assert!(pf.is_running());
        let addr = pf.my_addr().unwrap();
        assert!(crate::address::is_valid_prefix(&addr.ip6));
        assert_eq!(addr.label, 1);
    }

    #[test]
    fn announce_self_emits_connect_event() {
        let pf = Pathfinder::new(Settings::default());
        let mut chan = PFChan::new();
        pf.announce_self(&mut chan, [2u8; 32]);
        match chan.recv_for_core() {
            Some(PathfinderEvent::Connect { superiority, .. }) => assert_eq!(superiority, 1),
            other => panic!("expected Connect, got {:?}", other),
        }
    }

    #[test]
    fn session_event_for_unknown_node_does_not_panic_or_pin_anything() {
        let mut pf = connected_pathfinder();
        let mut chan = PFChan::new();
        let node = NodeInfo { path: 0x15, metric: 10, version: 18, public_key: [9u8; 32], ip6: [9u8; 16] };
        pf.handle_event(CoreEvent::Session { node: node.clone(), dest_pf: 0xFFFF_FFFF }, &mut chan, 0);
        assert!(pf.node_store.as_ref().unwrap().node_for_addr(&node.ip6).is_none());
    }

    #[test]
    fn session_known_node_pins_it() {
        let mut node_store = SimpleNodeStore::new();
        let node = NodeInfo { path: 0x15, metric: 10, version: 18, public_key: [9u8; 32], ip6: [9u8; 16] };
        node_store.add_node(&node);

        let mut pf = Pathfinder::running_with(
            Settings::default(),
            Address::from_public_key([1u8; 32]),
            Box::new(NullDhtRegistry),
            Box::new(node_store),
            Box::new(LoggingRouter::default()),
            Box::new(LoggingSearchRunner::default()),
            Box::new(BoundedRumorMill::new(8)),
        );
        let mut chan = PFChan::new();
        pf.handle_event(CoreEvent::Session { node: node.clone(), dest_pf: 0xFFFF_FFFF }, &mut chan, 0);

        let store = pf.node_store.as_ref().unwrap();
        assert!(store.node_for_addr(&node.ip6).is_some());
    }

    #[test]
    fn peer_gone_disconnects_from_node_store() {
        let mut node_store = SimpleNodeStore::new();
        let node = NodeInfo { path: 0x15, metric: 10, version: 18, public_key: [9u8; 32], ip6: [9u8; 16] };
        node_store.add_node(&node);

        let mut pf = Pathfinder::running_with(
            Settings::default(),
            Address::from_public_key([1u8; 32]),
            Box::new(NullDhtRegistry),
            Box::new(node_store),
            Box::new(LoggingRouter::default()),
            Box::new(LoggingSearchRunner::default()),
            Box::new(BoundedRumorMill::new(8)),
        );
        let mut chan = PFChan::new();
        pf.handle_event(CoreEvent::PeerGone { node: node.clone() }, &mut chan, 0);

        let store = pf.node_store.as_ref().unwrap();
        assert!(store.link_for_path(node.path).is_none());
    }

    #[test]
    fn discovered_path_inserts_into_rumor_mill() {
        let mut pf = connected_pathfinder();
        let mut chan = PFChan::new();
        let node = NodeInfo { path: 0x15, metric: 10, version: 18, public_key: [9u8; 32], ip6: [9u8; 16] };
        pf.handle_event(CoreEvent::DiscoveredPath { node }, &mut chan, 0);
        assert_eq!(pf.rumor_mill.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn ping_emits_pong() {
        let mut pf = connected_pathfinder();
        let mut chan = PFChan::new();
        pf.handle_event(CoreEvent::Ping, &mut chan, 0);
        assert!(matches!(chan.recv_for_core(), Some(PathfinderEvent::Pong)));
    }

    #[test]
    fn msg_with_learned_version_emits_node() {
        struct LearnsVersion;
        impl DhtRegistry for LearnsVersion {
            fn handle_message(&mut self, _r: &RouteHeader, _d: &DataHeader, _p: &[u8]) -> DhtMessageOutcome {
                DhtMessageOutcome { reply: None, learned_version: Some(22) }
            }
        }
        let mut pf = Pathfinder::running_with(
            Settings::default(),
            Address::from_public_key([1u8; 32]),
            Box::new(LearnsVersion),
            Box::new(SimpleNodeStore::new()),
            Box::new(LoggingRouter::default()),
            Box::new(LoggingSearchRunner::default()),
            Box::new(BoundedRumorMill::new(8)),
        );
        let mut chan = PFChan::new();
        let route_header = RouteHeader { ip6: [9u8; 16], public_key: [9u8; 32], label_be: 0x15, version_be: 0, flags: 0 };
        let data_header = DataHeader { version: 1, content_type: ContentType::Cjdht };
        pf.handle_event(CoreEvent::Msg { route_header, data_header, payload: vec![] }, &mut chan, 0);
        match chan.recv_for_core() {
            Some(PathfinderEvent::Node { node }) => assert_eq!(node.version, 22),
            other => panic!("expected Node event, got {:?}", other),
        }
    }

    #[test]
    fn msg_with_reply_sends_it_back() {
        struct RepliesAlways;
        impl DhtRegistry for RepliesAlways {
            fn handle_message(&mut self, _r: &RouteHeader, _d: &DataHeader, _p: &[u8]) -> DhtMessageOutcome {
                DhtMessageOutcome { reply: Some(vec![1, 2, 3]), learned_version: None }
            }
        }
        let mut pf = Pathfinder::running_with(
            Settings::default(),
            Address::from_public_key([1u8; 32]),
            Box::new(RepliesAlways),
            Box::new(SimpleNodeStore::new()),
            Box::new(LoggingRouter::default()),
            Box::new(LoggingSearchRunner::default()),
            Box::new(BoundedRumorMill::new(8)),
        );
        let mut chan = PFChan::new();
        let route_header = RouteHeader { ip6: [9u8; 16], public_key: [9u8; 32], label_be: 0x15, version_be: 18, flags: 0 };
        let data_header = DataHeader { version: 1, content_type: ContentType::Cjdht };
        pf.handle_event(CoreEvent::Msg { route_header, data_header, payload: vec![] }, &mut chan, 0);
        assert!(matches!(chan.recv_for_core(), Some(PathfinderEvent::SendMsg { .. })));
    }
}
