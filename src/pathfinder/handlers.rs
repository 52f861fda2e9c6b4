// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The per-event-kind handlers dispatched from `Pathfinder::handle_event` once the
//! pathfinder is `RUNNING`. Kept as free functions taking `&mut Pathfinder` rather
//! than inherent methods, matching the free-function handler style used in
//! `inside_iface`/`switch_iface`.

use tracing::debug;

use crate::address::Ip6;
use crate::pfchan::{NodeInfo, PFChan, PathfinderEvent};
use crate::pathfinder::dht::NodeHandle;
use crate::pathfinder::Pathfinder;
use crate::protocol::{DataHeader, RouteHeader, SM_INCOMING};

pub(super) fn switch_err(pf: &mut Pathfinder, failing_label: u64, error_type: u32) {
    debug!(path = failing_label, error_type, "switch err");

    let link = pf.node_store().link_for_path(failing_label);
    // Copy the address out before mutating the store: `broken_link` may invalidate
    // the entry the link was borrowed from.
    let affected_ip6 = link.as_ref().map(|l| l.ip6);

    if let Some(ip6) = affected_ip6 {
        pf.node_store_mut().broken_link(&ip6);
        pf.search_runner_mut().start_refined_search(ip6, 20, 3);
    }
}

pub(super) fn search_req(pf: &mut Pathfinder, ip6: Ip6) {
    debug!(ip6 = ?ip6, "search req");
    pf.search_runner_mut().start_search(ip6);
}

pub(super) fn peer(pf: &mut Pathfinder, node: NodeInfo) {
    debug!(ip6 = ?node.ip6, "peer");
    if pf.node_store().is_direct_child_with_label(&node.ip6, node.path) {
        return;
    }
    let handle = NodeHandle { ip6: node.ip6, public_key: node.public_key, label: node.path, metric: node.metric, version: node.version };
    pf.router_mut().send_get_peers(&handle);
}

pub(super) fn peer_gone(pf: &mut Pathfinder, node: NodeInfo) {
    debug!(ip6 = ?node.ip6, "peer gone");
    pf.node_store_mut().disconnected_peer(node.path);
}

pub(super) fn session(pf: &mut Pathfinder, node: NodeInfo) {
    debug!(ip6 = ?node.ip6, "session");
    if pf.node_store().node_for_addr(&node.ip6).is_some() {
        pf.node_store_mut().pin_node(&node.ip6);
    } else {
        pf.search_runner_mut().start_search(node.ip6);
    }
}

pub(super) fn session_ended(pf: &mut Pathfinder, node: NodeInfo) {
    debug!(ip6 = ?node.ip6, "session ended");
    if pf.node_store().node_for_addr(&node.ip6).is_some() {
        pf.node_store_mut().unpin_node(&node.ip6);
    }
}

pub(super) fn discovered_path(pf: &mut Pathfinder, node: NodeInfo) {
    debug!(ip6 = ?node.ip6, "discovered path");
    pf.rumor_mill_mut().insert(node);
}

/// The pathfinder's own reaction to `UNSETUP_SESSION`: the session manager emits this
/// when it has a session but no key material yet, so the pathfinder can trigger
/// discovery. Starting a search for the named node mirrors the `SESSION`-unknown
/// branch above.
pub(super) fn unsetup_session(pf: &mut Pathfinder, ip6: Ip6) {
    debug!(ip6 = ?ip6, "unsetup session");
    pf.search_runner_mut().start_search(ip6);
}

pub(super) fn msg(pf: &mut Pathfinder, chan: &mut PFChan, route_header: RouteHeader, data_header: DataHeader, payload: Vec<u8>) {
    let outcome = pf.registry_mut().handle_message(&route_header, &data_header, &payload);

    if let Some(reply) = outcome.reply {
        // Short-circuit: send the reply straight back out rather than dropping it.
        chan.send_to_core(PathfinderEvent::SendMsg { route_header, payload: reply });
        return;
    }

    if route_header.version_be == 0 {
        if let Some(learned) = outcome.learned_version {
            if learned != 0 {
                let node = NodeInfo {
                    path: route_header.label_be,
                    metric: SM_INCOMING,
                    version: learned,
                    public_key: route_header.public_key,
                    ip6: route_header.ip6,
                };
                chan.send_to_core(PathfinderEvent::Node { node });
            }
        }
    }
}

pub(super) fn ping(chan: &mut PFChan) {
    debug!("received ping");
    chan.send_to_core(PathfinderEvent::Pong);
}

pub(super) fn pong() {
    debug!("received pong");
}
