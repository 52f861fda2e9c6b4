// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! Inside-side ingress: payloads entering from the application side, named by a
//! route header, headed for the switch. Buffers when a session isn't ready,
//! triggers lookups, and prepends the handle/nonce framing the switch-side
//! ingress on the far end expects to find.

use tracing::debug;

use crate::pfchan::{CoreEvent, PFChan};
use crate::protocol::{route_flags, ContentType, DataHeader, RouteHeader, SwitchHeader, CONTROL_FRAME_SENTINEL, SM_SEND};
use crate::session::{BufferTable, SessionTable};
use crate::switch_iface::NONCE_PLACEHOLDER;
use crate::util::buffer::{Buffer, MAX_FRAME_SIZE};

/// Result of processing one outgoing (inside -> switch) payload.
pub enum OutgoingOutcome {
    /// Structurally invalid; dropped.
    Dropped,
    /// No session ready; payload was buffered and a lookup was triggered.
    Buffered,
    /// Ready to hand to the switch interface.
    ToSwitch(Vec<u8>),
}

/// Processes one outgoing payload named by `route_header` (+ `data_header` + `payload`).
pub fn handle_outgoing(
    table: &SessionTable,
    buffers: &mut BufferTable,
    chan: &mut PFChan,
    route_header: &RouteHeader,
    data_header: &DataHeader,
    payload: &[u8],
    now_ms: i64,
) -> OutgoingOutcome {
    if route_header.has_flag(route_flags::CTRLMSG) {
        if route_header.public_key != [0u8; 32] || route_header.ip6 != [0u8; 16] {
            debug!("control message with non-zero destination");
            return OutgoingOutcome::Dropped;
        }
        let mut out = Vec::new();
        let header = SwitchHeader { label_be: route_header.label_be, flags_version: 0, congestion: 0, sequence: 0 };
        header.write(&mut out);
        out.extend_from_slice(&CONTROL_FRAME_SENTINEL.to_be_bytes());
        out.extend_from_slice(payload);
        return gate_frame_size(out);
    }

    let no_key = route_header.public_key == [0u8; 32];
    let no_version = route_header.version_be == 0;

    let handle = if let Some(s) = table.session_for_ip6(&route_header.ip6) {
        Some(s.receive_handle)
    } else if !no_key && !no_version {
        let maintain = !route_header.has_flag(route_flags::PATHFINDER);
        Some(table.get_or_create(
            chan,
            route_header.ip6,
            route_header.public_key,
            route_header.version_be,
            route_header.label_be,
            SM_SEND,
            maintain,
            now_ms,
        ))
    } else {
        None
    };

    let handle = match handle {
        Some(h) => h,
        None => return buffer_and_search(buffers, chan, route_header, data_header, payload, false, now_ms),
    };

    let mut session = table.session_for_handle(handle).expect("just resolved");

    if session.version == 0 && no_version {
        drop(session);
        return buffer_and_search(buffers, chan, route_header, data_header, payload, false, now_ms);
    }

    let label = if route_header.label_be == 0 && session.send_switch_label != 0 {
        session.send_switch_label
    } else {
        route_header.label_be
    };

    if !matches!(data_header.content_type, ContentType::Cjdht) && !session.crypto.has_received_key() {
        drop(session);
        return buffer_and_search(buffers, chan, route_header, data_header, payload, true, now_ms);
    }

    let mut plaintext = Vec::new();
    data_header.write(&mut plaintext);
    plaintext.extend_from_slice(payload);

    let established = session.crypto.is_established();
    let ciphertext = match session.crypto.encrypt(&plaintext, now_ms) {
        Ok(c) => c,
        Err(_) => return OutgoingOutcome::Dropped,
    };
    session.time_of_last_out = now_ms;
    session.bytes_out += plaintext.len() as u64;
    let receive_handle = session.receive_handle;
    let send_handle = session.send_handle;
    drop(session);

    let mut out = Vec::new();
    let header = SwitchHeader { label_be: label, flags_version: 0, congestion: 0, sequence: 0 };
    header.write(&mut out);
    if established {
        out.extend_from_slice(&send_handle.to_be_bytes());
        out.extend_from_slice(&NONCE_PLACEHOLDER.to_be_bytes());
    } else {
        out.extend_from_slice(&receive_handle.to_be_bytes());
    }
    out.extend_from_slice(&ciphertext);
    gate_frame_size(out)
}

/// Rejects a fully-assembled outbound frame that exceeds `MAX_FRAME_SIZE` instead of
/// handing it to the switch interface; a frame this large can only come from an
/// oversized application payload, not a well-formed protocol message.
fn gate_frame_size(out: Vec<u8>) -> OutgoingOutcome {
    match Buffer::<MAX_FRAME_SIZE>::from_bytes(&out) {
        Ok(_) => OutgoingOutcome::ToSwitch(out),
        Err(_) => {
            debug!(len = out.len(), "outbound frame exceeds max frame size, dropping");
            OutgoingOutcome::Dropped
        }
    }
}

fn buffer_and_search(
    buffers: &mut BufferTable,
    chan: &mut PFChan,
    route_header: &RouteHeader,
    data_header: &DataHeader,
    payload: &[u8],
    setup_session: bool,
    now_ms: i64,
) -> OutgoingOutcome {
    let mut framed = Vec::new();
    data_header.write(&mut framed);
    framed.extend_from_slice(payload);
    buffers.put(route_header.ip6, framed, setup_session, now_ms);
    chan.send_to_pathfinder(CoreEvent::SearchReq { ip6: route_header.ip6 });
    OutgoingOutcome::Buffered
}
