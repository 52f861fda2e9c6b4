// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! The event channel between the session manager and the pathfinder: a typed,
//! length-prefixed, in-process message queue. Every frame is tagged by a 32-bit
//! big-endian event kind; kinds are partitioned into two closed sets, one per
//! direction, and flow only one way (see `CoreEvent` / `PathfinderEvent`).
//!
//! There is no numbered wire header for this channel in the retrieved sources, so the
//! kind constants below are this crate's own internal assignment; they carry no
//! meaning outside a single process and need not match any other implementation.

use std::collections::VecDeque;

use crate::address::{Ip6, PublicKey};
use crate::error::{MeshCoreError, Result};
use crate::protocol::{DataHeader, RouteHeader};
use crate::util::buffer::BufferReader;

/// Broadcast destination pathfinder id used for events with no single addressee.
pub const BROADCAST_PF: u32 = 0xFFFF_FFFF;

mod kind {
    pub const CORE_CONNECT: u32 = 1;
    pub const CORE_SWITCH_ERR: u32 = 2;
    pub const CORE_SEARCH_REQ: u32 = 3;
    pub const CORE_PEER: u32 = 4;
    pub const CORE_PEER_GONE: u32 = 5;
    pub const CORE_SESSION: u32 = 6;
    pub const CORE_SESSION_ENDED: u32 = 7;
    pub const CORE_DISCOVERED_PATH: u32 = 8;
    pub const CORE_MSG: u32 = 9;
    pub const CORE_PING: u32 = 10;
    pub const CORE_PONG: u32 = 11;
    pub const CORE_UNSETUP_SESSION: u32 = 12;

    pub const PF_CONNECT: u32 = 101;
    pub const PF_NODE: u32 = 102;
    pub const PF_SESSIONS: u32 = 103;
    pub const PF_SENDMSG: u32 = 104;
    pub const PF_PING: u32 = 105;
    pub const PF_PONG: u32 = 106;
}

/// A peer descriptor as carried by `CONNECT`/`PF_NODE` events: a switch label,
/// metric, protocol version, public key, and IPv6 address (see DESIGN.md for the
/// field-size note).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub path: u64,
    pub metric: u32,
    pub version: u32,
    pub public_key: PublicKey,
    pub ip6: Ip6,
}

impl NodeInfo {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.path.to_be_bytes());
        out.extend_from_slice(&self.metric.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.ip6);
    }

    fn parse(r: &mut BufferReader<'_>) -> std::io::Result<Self> {
        Ok(Self {
            path: r.take_u64_be()?,
            metric: r.take_u32_be()?,
            version: r.take_u32_be()?,
            public_key: r.take_array::<32>()?,
            ip6: r.take_array::<16>()?,
        })
    }
}

/// Events emitted by the session manager and consumed by the pathfinder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoreEvent {
    Connect { public_key: PublicKey, superiority: u32, version: u32, user_agent: [u8; 64] },
    SwitchErr { switch_header: [u8; 12], failing_label: u64, error_type: u32 },
    SearchReq { ip6: Ip6 },
    Peer { node: NodeInfo },
    PeerGone { node: NodeInfo },
    Session { node: NodeInfo, dest_pf: u32 },
    SessionEnded { node: NodeInfo },
    DiscoveredPath { node: NodeInfo },
    Msg { route_header: RouteHeader, data_header: DataHeader, payload: Vec<u8> },
    Ping,
    Pong,
    UnsetupSession { ip6: Ip6 },
}

/// Events emitted by the pathfinder and consumed by the session manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathfinderEvent {
    Connect { public_key: PublicKey, superiority: u32, version: u32, user_agent: [u8; 64] },
    Node { node: NodeInfo },
    Sessions { source_pf: u32 },
    SendMsg { route_header: RouteHeader, payload: Vec<u8> },
    Ping,
    Pong,
}

impl CoreEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            CoreEvent::Connect { public_key, superiority, version, user_agent } => {
                out.extend_from_slice(&kind::CORE_CONNECT.to_be_bytes());
                out.extend_from_slice(public_key);
                out.extend_from_slice(&superiority.to_be_bytes());
                out.extend_from_slice(&version.to_be_bytes());
                out.extend_from_slice(user_agent);
            }
            CoreEvent::SwitchErr { switch_header, failing_label, error_type } => {
                out.extend_from_slice(&kind::CORE_SWITCH_ERR.to_be_bytes());
                out.extend_from_slice(switch_header);
                out.extend_from_slice(&failing_label.to_be_bytes());
                out.extend_from_slice(&error_type.to_be_bytes());
            }
            CoreEvent::SearchReq { ip6 } => {
                out.extend_from_slice(&kind::CORE_SEARCH_REQ.to_be_bytes());
                out.extend_from_slice(ip6);
            }
            CoreEvent::Peer { node } => {
                out.extend_from_slice(&kind::CORE_PEER.to_be_bytes());
                node.write(&mut out);
            }
            CoreEvent::PeerGone { node } => {
                out.extend_from_slice(&kind::CORE_PEER_GONE.to_be_bytes());
                node.write(&mut out);
            }
            CoreEvent::Session { node, dest_pf } => {
                out.extend_from_slice(&kind::CORE_SESSION.to_be_bytes());
                out.extend_from_slice(&dest_pf.to_be_bytes());
                node.write(&mut out);
            }
            CoreEvent::SessionEnded { node } => {
                out.extend_from_slice(&kind::CORE_SESSION_ENDED.to_be_bytes());
                node.write(&mut out);
            }
            CoreEvent::DiscoveredPath { node } => {
                out.extend_from_slice(&kind::CORE_DISCOVERED_PATH.to_be_bytes());
                node.write(&mut out);
            }
            CoreEvent::Msg { route_header, data_header, payload } => {
                out.extend_from_slice(&kind::CORE_MSG.to_be_bytes());
                route_header.write(&mut out);
                data_header.write(&mut out);
                out.extend_from_slice(payload);
            }
            CoreEvent::Ping => out.extend_from_slice(&kind::CORE_PING.to_be_bytes()),
            CoreEvent::Pong => out.extend_from_slice(&kind::CORE_PONG.to_be_bytes()),
            CoreEvent::UnsetupSession { ip6 } => {
                out.extend_from_slice(&kind::CORE_UNSETUP_SESSION.to_be_bytes());
                out.extend_from_slice(ip6);
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = BufferReader::new(buf);
        let k = r.take_u32_be().map_err(|_| MeshCoreError::MalformedFrame("truncated kind"))?;
        let bad = |_| MeshCoreError::MalformedFrame("truncated body");
        match k {
            kind::CORE_CONNECT => Ok(CoreEvent::Connect {
                public_key: r.take_array::<32>().map_err(bad)?,
                superiority: r.take_u32_be().map_err(bad)?,
                version: r.take_u32_be().map_err(bad)?,
                user_agent: r.take_array::<64>().map_err(bad)?,
            }),
            kind::CORE_SWITCH_ERR => Ok(CoreEvent::SwitchErr {
                switch_header: r.take_array::<12>().map_err(bad)?,
                failing_label: r.take_u64_be().map_err(bad)?,
                error_type: r.take_u32_be().map_err(bad)?,
            }),
            kind::CORE_SEARCH_REQ => Ok(CoreEvent::SearchReq { ip6: r.take_array::<16>().map_err(bad)? }),
            kind::CORE_PEER => Ok(CoreEvent::Peer { node: NodeInfo::parse(&mut r).map_err(bad)? }),
            kind::CORE_PEER_GONE => Ok(CoreEvent::PeerGone { node: NodeInfo::parse(&mut r).map_err(bad)? }),
            kind::CORE_SESSION => {
                let dest_pf = r.take_u32_be().map_err(bad)?;
                let node = NodeInfo::parse(&mut r).map_err(bad)?;
                Ok(CoreEvent::Session { node, dest_pf })
            }
            kind::CORE_SESSION_ENDED => {
                Ok(CoreEvent::SessionEnded { node: NodeInfo::parse(&mut r).map_err(bad)? })
            }
            kind::CORE_DISCOVERED_PATH => {
                Ok(CoreEvent::DiscoveredPath { node: NodeInfo::parse(&mut r).map_err(bad)? })
            }
            kind::CORE_MSG => {
                let route_header = RouteHeader::parse(&mut r).map_err(bad)?;
                let data_header = DataHeader::parse(&mut r).map_err(bad)?;
                let payload = r.take(r.remaining()).map_err(bad)?.to_vec();
                Ok(CoreEvent::Msg { route_header, data_header, payload })
            }
            kind::CORE_PING => Ok(CoreEvent::Ping),
            kind::CORE_PONG => Ok(CoreEvent::Pong),
            kind::CORE_UNSETUP_SESSION => Ok(CoreEvent::UnsetupSession { ip6: r.take_array::<16>().map_err(bad)? }),
            _ => Err(MeshCoreError::MalformedFrame("unknown core event kind")),
        }
    }
}

impl PathfinderEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            PathfinderEvent::Connect { public_key, superiority, version, user_agent } => {
                out.extend_from_slice(&kind::PF_CONNECT.to_be_bytes());
                out.extend_from_slice(public_key);
                out.extend_from_slice(&superiority.to_be_bytes());
                out.extend_from_slice(&version.to_be_bytes());
                out.extend_from_slice(user_agent);
            }
            PathfinderEvent::Node { node } => {
                out.extend_from_slice(&kind::PF_NODE.to_be_bytes());
                node.write(&mut out);
            }
            PathfinderEvent::Sessions { source_pf } => {
                out.extend_from_slice(&kind::PF_SESSIONS.to_be_bytes());
                out.extend_from_slice(&source_pf.to_be_bytes());
            }
            PathfinderEvent::SendMsg { route_header, payload } => {
                out.extend_from_slice(&kind::PF_SENDMSG.to_be_bytes());
                route_header.write(&mut out);
                out.extend_from_slice(payload);
            }
            PathfinderEvent::Ping => out.extend_from_slice(&kind::PF_PING.to_be_bytes()),
            PathfinderEvent::Pong => out.extend_from_slice(&kind::PF_PONG.to_be_bytes()),
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = BufferReader::new(buf);
        let k = r.take_u32_be().map_err(|_| MeshCoreError::MalformedFrame("truncated kind"))?;
        let bad = |_| MeshCoreError::MalformedFrame("truncated body");
        match k {
            kind::PF_CONNECT => Ok(PathfinderEvent::Connect {
                public_key: r.take_array::<32>().map_err(bad)?,
                superiority: r.take_u32_be().map_err(bad)?,
                version: r.take_u32_be().map_err(bad)?,
                user_agent: r.take_array::<64>().map_err(bad)?,
            }),
            kind::PF_NODE => Ok(PathfinderEvent::Node { node: NodeInfo::parse(&mut r).map_err(bad)? }),
            kind::PF_SESSIONS => Ok(PathfinderEvent::Sessions { source_pf: r.take_u32_be().map_err(bad)? }),
            kind::PF_SENDMSG => {
                let route_header = RouteHeader::parse(&mut r).map_err(bad)?;
                let payload = r.take(r.remaining()).map_err(bad)?.to_vec();
                Ok(PathfinderEvent::SendMsg { route_header, payload })
            }
            kind::PF_PING => Ok(PathfinderEvent::Ping),
            kind::PF_PONG => Ok(PathfinderEvent::Pong),
            _ => Err(MeshCoreError::MalformedFrame("unknown pathfinder event kind")),
        }
    }
}

/// The channel itself: two ordered, unbounded FIFOs, one per direction. The
/// concurrency model is a single cooperative event loop with no internal locking, so
/// this is a plain `VecDeque` pair rather than a thread-safe queue -- both ends are
/// driven from the same loop and a push can never block a pop.
#[derive(Default)]
pub struct PFChan {
    to_pathfinder: VecDeque<CoreEvent>,
    to_core: VecDeque<PathfinderEvent>,
}

impl PFChan {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn send_to_pathfinder(&mut self, ev: CoreEvent) {
        self.to_pathfinder.push_back(ev);
    }

    #[inline(always)]
    pub fn send_to_core(&mut self, ev: PathfinderEvent) {
        self.to_core.push_back(ev);
    }

    #[inline(always)]
    pub fn recv_for_pathfinder(&mut self) -> Option<CoreEvent> {
        self.to_pathfinder.pop_front()
    }

    #[inline(always)]
    pub fn recv_for_core(&mut self) -> Option<PathfinderEvent> {
        self.to_core.pop_front()
    }
}
