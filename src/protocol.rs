// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! Wire structures shared by the switch-facing and inside-facing interfaces: the
//! 12-byte switch header, the route header synthesized/consumed at the boundary
//! between the two, and the 4-byte data header that tags payload content type.

use crate::address::{Ip6, PublicKey};
use crate::util::buffer::BufferReader;

/// Handles below this value are reserved for the crypto handshake nonce space.
pub const MIN_FIRST_HANDLE: u32 = 4;

/// Upper bound (exclusive) on the randomized starting handle drawn at table construction.
pub const MAX_FIRST_HANDLE: u32 = 100_000;

/// Sentinel `nonce_or_handle` value marking a control frame rather than a session handle.
pub const CONTROL_FRAME_SENTINEL: u32 = 0xFFFF_FFFF;

/// Worst-case metric value: the path is known dead.
pub const DEAD_LINK: u32 = 0xFFFF_FFFF;

/// Metric assigned to a session created from an inbound handshake.
pub const SM_INCOMING: u32 = 0xFFFF_FFFE;

/// Metric assigned to a session created purely to send (no path info yet).
pub const SM_SEND: u32 = 0xFFFF_FFFD;

pub const SWITCH_HEADER_SIZE: usize = 12;
/// Sized from its field list: IPv6 16 + public key 32 + label 8 + version 4 + flags 4.
pub const ROUTE_HEADER_SIZE: usize = 16 + 32 + 8 + 4 + 4;
pub const DATA_HEADER_SIZE: usize = 4;

/// Bit within the switch header's flags/version byte that suppresses further error
/// generation for a frame -- set on failed-decrypt replies so they can't recurse.
pub const SWITCH_HEADER_SUPPRESS_ERRORS_BIT: u8 = 0x80;

/// 12-byte header prefixing every frame on the switch interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchHeader {
    pub label_be: u64,
    pub flags_version: u8,
    pub congestion: u8,
    pub sequence: u16,
}

impl SwitchHeader {
    pub fn parse(r: &mut BufferReader<'_>) -> std::io::Result<Self> {
        Ok(Self {
            label_be: r.take_u64_be()?,
            flags_version: r.take_u8()?,
            congestion: r.take_u8()?,
            sequence: r.take_u16_be()?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.label_be.to_be_bytes());
        out.push(self.flags_version);
        out.push(self.congestion);
        out.extend_from_slice(&self.sequence.to_be_bytes());
    }

    #[inline(always)]
    pub fn suppress_errors(&self) -> bool {
        self.flags_version & SWITCH_HEADER_SUPPRESS_ERRORS_BIT != 0
    }

    #[inline(always)]
    pub fn set_suppress_errors(&mut self, suppress: bool) {
        if suppress {
            self.flags_version |= SWITCH_HEADER_SUPPRESS_ERRORS_BIT;
        } else {
            self.flags_version &= !SWITCH_HEADER_SUPPRESS_ERRORS_BIT;
        }
    }
}

/// Route header flag bits, declared as plain constants rather than a `bitflags!` enum.
pub mod route_flags {
    pub const INCOMING: u32 = 1;
    pub const CTRLMSG: u32 = 2;
    pub const PATHFINDER: u32 = 4;
}

/// Header synthesized at the switch/inside boundary: names the peer (IPv6 + public
/// key), the switch label in use, the protocol version, and routing flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteHeader {
    pub ip6: Ip6,
    pub public_key: PublicKey,
    pub label_be: u64,
    pub version_be: u32,
    pub flags: u32,
}

impl RouteHeader {
    pub fn parse(r: &mut BufferReader<'_>) -> std::io::Result<Self> {
        Ok(Self {
            ip6: r.take_array::<16>()?,
            public_key: r.take_array::<32>()?,
            label_be: r.take_u64_be()?,
            version_be: r.take_u32_be()?,
            flags: r.take_u32_be()?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ip6);
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.label_be.to_be_bytes());
        out.extend_from_slice(&self.version_be.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// Content type carried in the data header. `Cjdht` is the single reserved value this
/// layer inspects (to decide whether `time_of_last_in` updates and whether the msg is
/// handed to the pathfinder); everything else is opaque payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    Cjdht,
    Opaque(u16),
}

impl ContentType {
    const CJDHT_VALUE: u16 = 256;

    pub fn from_wire(v: u16) -> Self {
        if v == Self::CJDHT_VALUE {
            ContentType::Cjdht
        } else {
            ContentType::Opaque(v)
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            ContentType::Cjdht => Self::CJDHT_VALUE,
            ContentType::Opaque(v) => v,
        }
    }
}

/// 4-byte envelope prefixing application payload: a 4-bit version and a content-type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
    pub version: u8,
    pub content_type: ContentType,
}

impl DataHeader {
    pub fn parse(r: &mut BufferReader<'_>) -> std::io::Result<Self> {
        let b0 = r.take_u8()?;
        let _reserved = r.take_u8()?;
        let content_type = r.take_u16_be()?;
        Ok(Self { version: b0 & 0x0f, content_type: ContentType::from_wire(content_type) })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(self.version & 0x0f);
        out.push(0);
        out.extend_from_slice(&self.content_type.to_wire().to_be_bytes());
    }
}
