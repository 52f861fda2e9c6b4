// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

use std::collections::HashMap;

use tracing::debug;

use crate::address::Ip6;

/// Payload awaiting a session, keyed by destination IPv6.
///
/// The table adopts the payload's allocation scope after inserting it: the table
/// owns the `Vec<u8>` outright once inserted, rather than the caller retaining a
/// reference to mutate concurrently.
pub struct BufferedMessage {
    pub payload: Vec<u8>,
    pub created_ms: i64,
    pub setup_session: bool,
}

pub const BUFFERED_MESSAGE_TIMEOUT_MS: i64 = 10_000;

/// Table of at most one buffered message per destination IPv6, bounded by
/// `max_buffered_messages`.
pub struct BufferTable {
    max_buffered_messages: usize,
    messages: HashMap<Ip6, BufferedMessage>,
}

impl BufferTable {
    pub fn new(max_buffered_messages: usize) -> Self {
        Self { max_buffered_messages, messages: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, ip6: &Ip6) -> Option<&BufferedMessage> {
        self.messages.get(ip6)
    }

    pub fn take(&mut self, ip6: &Ip6) -> Option<BufferedMessage> {
        self.messages.remove(ip6)
    }

    /// Drops entries older than `BUFFERED_MESSAGE_TIMEOUT_MS`.
    pub fn sweep(&mut self, now_ms: i64) {
        self.messages.retain(|ip6, m| {
            let alive = now_ms - m.created_ms <= BUFFERED_MESSAGE_TIMEOUT_MS;
            if !alive {
                debug!(ip6 = ?ip6, "buffered message timed out");
            }
            alive
        });
    }

    /// Inserts `payload` for `ip6`, displacing any existing buffered message for the
    /// same IPv6 (most-recent-wins). If the table is at capacity, first runs the 10s
    /// sweep; if still full after that, the new message is dropped (returns `false`).
    pub fn put(&mut self, ip6: Ip6, payload: Vec<u8>, setup_session: bool, now_ms: i64) -> bool {
        if !self.messages.contains_key(&ip6) && self.messages.len() >= self.max_buffered_messages {
            self.sweep(now_ms);
            if self.messages.len() >= self.max_buffered_messages {
                debug!(ip6 = ?ip6, "buffer table full, dropping message");
                return false;
            }
        }
        self.messages.insert(ip6, BufferedMessage { payload, created_ms: now_ms, setup_session });
        true
    }
}
