// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use rand::Rng;
use tracing::debug;

use crate::address::Ip6;
use crate::crypto::CryptoSession;
use crate::pfchan::{CoreEvent, NodeInfo, PFChan, BROADCAST_PF};
use crate::protocol::{DEAD_LINK, MAX_FIRST_HANDLE, MIN_FIRST_HANDLE, SM_INCOMING};

/// A single encrypted session between this node and a peer, indexed both by the
/// peer's IPv6 and by its locally-assigned receive handle.
pub struct Session {
    pub her_ip6: Ip6,
    pub her_public_key: [u8; 32],
    pub receive_handle: u32,
    pub send_handle: u32,
    pub send_switch_label: u64,
    pub recv_switch_label: u64,
    pub metric: u32,
    pub version: u32,
    pub maintain_session: bool,
    pub time_of_last_in: i64,
    pub time_of_keepalive_in: i64,
    pub time_of_last_out: i64,
    pub last_search_time: i64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub crypto: CryptoSession,
    /// Latches true the first time the crypto session's learned key has been checked
    /// against `her_ip6`. Checked exactly once -- see `SessionTable::session_for_ip6`.
    pub found_key: bool,
}

impl Session {
    fn descriptor(&self) -> NodeInfo {
        NodeInfo {
            path: self.send_switch_label,
            metric: self.metric,
            version: self.version,
            public_key: self.her_public_key,
            ip6: self.her_ip6,
        }
    }
}

/// IPv6 <-> encrypted-session <-> handle table. Handle numbers are drawn from a
/// randomized base (`first_handle`) so they can't be guessed cross-process; slot ids
/// beyond that are assigned by a monotone counter, matching the source's "slotted
/// map" allocation scheme.
pub struct SessionTable {
    first_handle: u32,
    next_slot: AtomicU32,
    by_ip6: DashMap<Ip6, u32>,
    by_handle: DashMap<u32, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::with_first_handle(rand::thread_rng().gen_range(MIN_FIRST_HANDLE..MAX_FIRST_HANDLE))
    }

    pub fn with_first_handle(first_handle: u32) -> Self {
        assert!(first_handle >= MIN_FIRST_HANDLE && first_handle < MAX_FIRST_HANDLE);
        Self { first_handle, next_slot: AtomicU32::new(0), by_ip6: DashMap::new(), by_handle: DashMap::new() }
    }

    #[inline(always)]
    pub fn first_handle(&self) -> u32 {
        self.first_handle
    }

    /// Snapshot of every live receive handle, for diagnostics (`handle_list`).
    pub fn handle_list(&self) -> Vec<u32> {
        self.by_handle.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    /// Looks a session up by its peer IPv6. If the crypto session has learned the
    /// peer's key and hasn't yet latched `found_key`, verifies the IPv6<->key binding
    /// once -- a mismatch here means a peer's claimed address doesn't match the key
    /// it's actually handshaking with.
    pub fn session_for_ip6(&self, ip6: &Ip6) -> Option<dashmap::mapref::one::RefMut<'_, u32, Session>> {
        let handle = *self.by_ip6.get(ip6)?;
        let mut entry = self.by_handle.get_mut(&handle)?;
        if !entry.found_key {
            if let Some(key) = entry.crypto.peer_public_key {
                let derived = crate::address::address_for_public_key(&key);
                assert_eq!(derived, entry.her_ip6, "peer key does not derive the address it handshook as");
                entry.found_key = true;
            }
        }
        Some(entry)
    }

    pub fn session_for_handle(&self, handle: u32) -> Option<dashmap::mapref::one::RefMut<'_, u32, Session>> {
        self.by_handle.get_mut(&handle)
    }

    /// Creates a session on miss; on hit, applies the metric/label/version update
    /// rule and returns the (possibly updated) existing session.
    pub fn get_or_create(
        &self,
        chan: &mut PFChan,
        ip6: Ip6,
        public_key: [u8; 32],
        version: u32,
        label: u64,
        metric: u32,
        maintain: bool,
        now_ms: i64,
    ) -> u32 {
        if let Some(handle) = self.by_ip6.get(&ip6).map(|h| *h) {
            if let Some(mut s) = self.by_handle.get_mut(&handle) {
                Self::apply_update(&mut s, label, metric, version, maintain);
                return handle;
            }
        }

        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let receive_handle = self.first_handle + slot;
        let session = Session {
            her_ip6: ip6,
            her_public_key: public_key,
            receive_handle,
            send_handle: 0,
            send_switch_label: label,
            recv_switch_label: 0,
            metric,
            version,
            maintain_session: maintain,
            time_of_last_in: now_ms,
            time_of_keepalive_in: now_ms,
            time_of_last_out: now_ms,
            last_search_time: now_ms,
            bytes_in: 0,
            bytes_out: 0,
            crypto: CryptoSession::new(now_ms),
            found_key: false,
        };
        let descriptor = session.descriptor();
        self.by_ip6.insert(ip6, receive_handle);
        self.by_handle.insert(receive_handle, session);
        chan.send_to_pathfinder(CoreEvent::Session { node: descriptor, dest_pf: BROADCAST_PF });
        receive_handle
    }

    /// The metric update rule applied to an already-existing session on a repeat
    /// `get_or_create`. Note the DEAD_LINK branch tests the *caller's*
    /// incoming metric, not the session's current one -- it's how a caller reports a
    /// path as broken, not a property of the stored session.
    fn apply_update(s: &mut Session, label: u64, metric: u32, version: u32, maintain: bool) {
        if s.version == 0 {
            s.version = version;
        }
        s.maintain_session |= maintain;
        if metric == DEAD_LINK {
            if s.send_switch_label == label {
                if s.send_switch_label == s.recv_switch_label {
                    s.send_switch_label = 0;
                    s.metric = DEAD_LINK;
                } else {
                    s.send_switch_label = s.recv_switch_label;
                    s.metric = SM_INCOMING;
                }
            }
        } else if metric <= s.metric && label != 0 {
            s.send_switch_label = label;
            if version != 0 {
                s.version = version;
            }
            s.metric = metric;
        }
    }

    /// Destroys a session, removing both indices. Returns it so the caller can emit
    /// whatever follow-up event is appropriate (e.g. `SESSION_ENDED`).
    fn remove(&self, handle: u32) -> Option<Session> {
        let (_, session) = self.by_handle.remove(&handle)?;
        self.by_ip6.remove(&session.her_ip6);
        Some(session)
    }

    /// Periodic sweep (every 10s): expires sessions past `session_timeout_ms`, emits
    /// search triggers for maintained sessions, and nudges the pathfinder about
    /// sessions still missing a crypto key.
    pub fn tick(&self, chan: &mut PFChan, now_ms: i64, session_timeout_ms: i64, session_search_after_ms: i64) {
        let expired: Vec<u32> = self
            .by_handle
            .iter()
            .filter(|e| now_ms - e.value().time_of_keepalive_in > session_timeout_ms)
            .map(|e| *e.key())
            .collect();
        for handle in expired {
            if let Some(s) = self.remove(handle) {
                debug!(handle = s.receive_handle, ip6 = ?s.her_ip6, "session expired");
                chan.send_to_pathfinder(CoreEvent::SessionEnded { node: s.descriptor() });
            }
        }

        for mut entry in self.by_handle.iter_mut() {
            let s = entry.value_mut();
            if s.maintain_session && now_ms - s.last_search_time >= session_search_after_ms {
                s.last_search_time = now_ms;
                chan.send_to_pathfinder(CoreEvent::SearchReq { ip6: s.her_ip6 });
            } else if !s.crypto.has_received_key() {
                chan.send_to_pathfinder(CoreEvent::UnsetupSession { ip6: s.her_ip6 });
            }
        }
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
