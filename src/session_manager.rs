// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! Top-level wiring for the session half of the core: owns the session table, the
//! buffer table, and the channel to the pathfinder; dispatches switch-side and
//! inside-side frames and runs the periodic maintenance tick.

use crate::address::PublicKey;
use crate::config::Settings;
use crate::inside_iface::{self, OutgoingOutcome};
use crate::pfchan::{CoreEvent, PFChan, PathfinderEvent};
use crate::protocol::{ContentType, DataHeader, RouteHeader, DEAD_LINK};
use crate::session::{BufferTable, SessionTable};
use crate::switch_iface::{self, IngressOutcome};
use crate::util::buffer::BufferReader;
use crate::util::gate::IntervalGate;

const TICK_INTERVAL_MS: i64 = 10_000;

pub struct SessionManager {
    pub our_public_key: PublicKey,
    pub table: SessionTable,
    pub buffers: BufferTable,
    pub settings: Settings,
    tick_gate: IntervalGate<TICK_INTERVAL_MS>,
}

impl SessionManager {
    pub fn new(our_public_key: PublicKey, settings: Settings) -> Self {
        Self {
            our_public_key,
            table: SessionTable::new(),
            buffers: BufferTable::new(settings.max_buffered_messages),
            settings,
            tick_gate: IntervalGate::default(),
        }
    }

    /// Processes one raw frame arriving on the switch interface, returning a frame to
    /// send back on the switch if the handler produced one (e.g. a failed-decrypt
    /// reply), or the decoded route header/data header/payload bound for the inside
    /// interface.
    pub fn on_switch_frame(&mut self, chan: &mut PFChan, frame: &[u8], now_ms: i64) -> IngressOutcome {
        switch_iface::handle_incoming(&self.table, chan, &self.our_public_key, frame, now_ms)
    }

    /// Processes one outgoing payload named by a route header, arriving from the
    /// inside (application) interface.
    pub fn on_inside_payload(
        &mut self,
        chan: &mut PFChan,
        route_header: &RouteHeader,
        data_header: &DataHeader,
        payload: &[u8],
        now_ms: i64,
    ) -> OutgoingOutcome {
        inside_iface::handle_outgoing(&self.table, &mut self.buffers, chan, route_header, data_header, payload, now_ms)
    }

    /// Handles an event arriving from the pathfinder: a `NODE` descriptor, or a
    /// `SESSIONS` request for a snapshot of this table's live sessions. Returns a
    /// flushed frame bound for the switch interface when a `NODE` event resolves a
    /// buffered message (the caller is responsible for forwarding it on).
    pub fn on_pathfinder_event(&mut self, chan: &mut PFChan, event: PathfinderEvent, now_ms: i64) -> Option<Vec<u8>> {
        match event {
            PathfinderEvent::Node { node } => self.handle_node(chan, node, now_ms),
            PathfinderEvent::Sessions { source_pf } => {
                self.handle_sessions_snapshot(chan, source_pf);
                None
            }
            PathfinderEvent::SendMsg { .. } | PathfinderEvent::Connect { .. } | PathfinderEvent::Ping | PathfinderEvent::Pong => {
                // Not this component's concern to act on; the event channel test
                // harness or a higher-level node loop handles these.
                None
            }
        }
    }

    /// Mirrors `incomingFromEventIf`'s NODE branch: a session is only created/updated
    /// when one already exists or the destination is buffered, and a buffered-only
    /// destination reported with `DEAD_LINK` is ignored outright rather than installed.
    fn handle_node(&mut self, chan: &mut PFChan, node: crate::pfchan::NodeInfo, now_ms: i64) -> Option<Vec<u8>> {
        let has_session = self.table.session_for_ip6(&node.ip6).is_some();
        if !has_session {
            if self.buffers.get(&node.ip6).is_none() {
                return None;
            }
            if node.metric == DEAD_LINK {
                return None;
            }
        }

        let maintain = false;
        let handle = self.table.get_or_create(
            chan,
            node.ip6,
            node.public_key,
            node.version,
            node.path,
            node.metric,
            maintain,
            now_ms,
        );

        let established = self
            .table
            .session_for_handle(handle)
            .map(|s| s.crypto.is_established())
            .unwrap_or(false);

        let mut flushed = None;

        if let Some(buffered) = self.buffers.take(&node.ip6) {
            if established {
                let mut r = BufferReader::new(&buffered.payload);
                if let Ok(data_header) = DataHeader::parse(&mut r) {
                    let remaining = r.remaining();
                    let payload = &buffered.payload[buffered.payload.len() - remaining..];
                    let route_header = RouteHeader {
                        ip6: node.ip6,
                        public_key: node.public_key,
                        label_be: node.path,
                        version_be: node.version,
                        flags: 0,
                    };
                    if let OutgoingOutcome::ToSwitch(frame) = inside_iface::handle_outgoing(
                        &self.table,
                        &mut self.buffers,
                        chan,
                        &route_header,
                        &data_header,
                        payload,
                        now_ms,
                    ) {
                        flushed = Some(frame);
                    }
                }
            } else {
                self.buffers.put(node.ip6, buffered.payload, buffered.setup_session, now_ms);
            }
        }

        // Independent of whether anything was buffered: nudge the pathfinder whenever
        // the session still hasn't received a crypto key.
        if !established {
            chan.send_to_pathfinder(CoreEvent::UnsetupSession { ip6: node.ip6 });
        }

        flushed
    }

    /// Re-emits a `SESSION` descriptor for every live session addressed to the
    /// requesting pathfinder instance, rather than to the broadcast destination.
    fn handle_sessions_snapshot(&mut self, chan: &mut PFChan, source_pf: u32) {
        for handle in self.table.handle_list() {
            if let Some(s) = self.table.session_for_handle(handle) {
                let node = crate::pfchan::NodeInfo {
                    path: s.send_switch_label,
                    metric: s.metric,
                    version: s.version,
                    public_key: s.her_public_key,
                    ip6: s.her_ip6,
                };
                chan.send_to_pathfinder(crate::pfchan::CoreEvent::Session { node, dest_pf: source_pf });
            }
        }
    }

    /// Runs the 10s periodic maintenance sweep if due.
    pub fn maybe_tick(&mut self, chan: &mut PFChan, now_ms: i64) {
        if !self.tick_gate.gate(now_ms) {
            return;
        }
        self.table.tick(chan, now_ms, self.settings.session_timeout_ms, self.settings.session_search_after_ms);
        self.buffers.sweep(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pfchan::NodeInfo;
    use crate::protocol::SM_SEND;

    /// Routes this crate's `tracing` output to the test harness writer so `cargo test
    /// -- --nocapture` shows the same `debug!`/`warn!` lines a running node would log.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[test]
    fn node_event_flushes_buffer_once_key_established() {
        init_tracing();
        let mut sm = SessionManager::new([0u8; 32], Settings::default());
        let mut chan = PFChan::new();

        let route_header = RouteHeader { ip6: [0xfc; 16], public_key: [0u8; 32], label_be: 0, version_be: 0, flags: 0 };
        let dh = DataHeader { version: 1, content_type: ContentType::Opaque(1) };
        let outcome = sm.on_inside_payload(&mut chan, &route_header, &dh, b"payload", 0);
        assert!(matches!(outcome, OutgoingOutcome::Buffered));
        chan.recv_for_pathfinder(); // drain SEARCH_REQ

        let node = NodeInfo { path: 0x15, metric: SM_SEND, version: 18, public_key: [7u8; 32], ip6: [0xfc; 16] };
        sm.on_pathfinder_event(&mut chan, PathfinderEvent::Node { node: node.clone() }, 100);
        // Session created but not yet established, so the buffer is kept and
        // re-queued, with a fresh UNSETUP_SESSION nudge for the pathfinder.
        assert_eq!(sm.buffers.len(), 1);

        // Drain events emitted by the NODE handling (SESSION, then UNSETUP_SESSION).
        let mut saw_unsetup = false;
        while let Some(ev) = chan.recv_for_pathfinder() {
            if matches!(ev, crate::pfchan::CoreEvent::UnsetupSession { .. }) {
                saw_unsetup = true;
            }
        }
        assert!(saw_unsetup);

        {
            let handle = sm.table.session_for_ip6(&[0xfc; 16]).unwrap().receive_handle;
            let mut s = sm.table.session_for_handle(handle).unwrap();
            s.crypto.learn_peer_key([7u8; 32], 100);
            s.crypto.complete_handshake(100);
        }
        let flushed = sm.on_pathfinder_event(&mut chan, PathfinderEvent::Node { node }, 200);
        assert_eq!(sm.buffers.len(), 0);
        assert!(flushed.is_some(), "flushed buffer must be handed back for the switch interface to send");
    }

    #[test]
    fn node_event_for_unbuffered_unsessioned_node_is_ignored() {
        let mut sm = SessionManager::new([0u8; 32], Settings::default());
        let mut chan = PFChan::new();
        let node = NodeInfo { path: 0x15, metric: SM_SEND, version: 18, public_key: [7u8; 32], ip6: [0xfc; 16] };
        let flushed = sm.on_pathfinder_event(&mut chan, PathfinderEvent::Node { node }, 0);
        assert!(flushed.is_none());
        assert_eq!(sm.table.len(), 0);
        assert!(chan.recv_for_pathfinder().is_none());
    }

    #[test]
    fn node_event_with_dead_link_metric_does_not_install_buffered_destination() {
        let mut sm = SessionManager::new([0u8; 32], Settings::default());
        let mut chan = PFChan::new();

        let route_header = RouteHeader { ip6: [0xfc; 16], public_key: [0u8; 32], label_be: 0, version_be: 0, flags: 0 };
        let dh = DataHeader { version: 1, content_type: ContentType::Opaque(1) };
        sm.on_inside_payload(&mut chan, &route_header, &dh, b"payload", 0);
        chan.recv_for_pathfinder(); // drain SEARCH_REQ

        let node = NodeInfo { path: 0x15, metric: crate::protocol::DEAD_LINK, version: 18, public_key: [7u8; 32], ip6: [0xfc; 16] };
        let flushed = sm.on_pathfinder_event(&mut chan, PathfinderEvent::Node { node }, 0);
        assert!(flushed.is_none());
        assert_eq!(sm.table.len(), 0);
        assert_eq!(sm.buffers.len(), 1, "buffered message must survive a DEAD_LINK NODE report");
        assert!(chan.recv_for_pathfinder().is_none());
    }

    #[test]
    fn node_event_nudges_unsetup_session_even_without_a_buffered_message() {
        let mut sm = SessionManager::new([0u8; 32], Settings::default());
        let mut chan = PFChan::new();
        sm.table.get_or_create(&mut chan, [0xfc; 16], [7u8; 32], 18, 0x10, SM_SEND, false, 0);
        chan.recv_for_pathfinder(); // drain creation SESSION event

        let node = NodeInfo { path: 0x20, metric: SM_SEND, version: 18, public_key: [7u8; 32], ip6: [0xfc; 16] };
        let flushed = sm.on_pathfinder_event(&mut chan, PathfinderEvent::Node { node }, 0);
        assert!(flushed.is_none());
        assert!(matches!(chan.recv_for_pathfinder(), Some(crate::pfchan::CoreEvent::UnsetupSession { .. })));
    }

    #[test]
    fn sessions_snapshot_replies_to_requesting_pathfinder() {
        let mut sm = SessionManager::new([0u8; 32], Settings::default());
        let mut chan = PFChan::new();
        sm.table.get_or_create(&mut chan, [9u8; 16], [9u8; 32], 18, 0x10, 10, false, 0);
        chan.recv_for_pathfinder(); // drain creation SESSION event

        sm.on_pathfinder_event(&mut chan, PathfinderEvent::Sessions { source_pf: 42 }, 0);
        match chan.recv_for_pathfinder() {
            Some(crate::pfchan::CoreEvent::Session { dest_pf, .. }) => assert_eq!(dest_pf, 42),
            other => panic!("expected a Session event, got {:?}", other),
        }
    }

    #[test]
    fn tick_is_rate_limited_to_interval() {
        let mut sm = SessionManager::new([0u8; 32], Settings::default());
        let mut chan = PFChan::new();
        sm.table.get_or_create(&mut chan, [1u8; 16], [1u8; 32], 18, 0x10, 10, false, 0);
        chan.recv_for_pathfinder();

        sm.maybe_tick(&mut chan, 5_000);
        assert_eq!(sm.table.len(), 1);
        sm.maybe_tick(&mut chan, 70_000);
        assert_eq!(sm.table.len(), 0);
    }
}
