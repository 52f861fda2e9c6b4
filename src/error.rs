// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

use thiserror::Error;

/// Top level error type for the control plane.
///
/// Most hot-path failures (runt frames, unknown handles, decrypt failures) are not
/// propagated as errors at all -- they are absorbed by the drop/buffer/reply
/// machinery in `switch_iface` and `inside_iface`. This type exists for the handful of
/// operations that have a genuine caller-facing failure mode: channel construction,
/// config loading, and the admin-facing diagnostics.
#[derive(Error, Debug)]
pub enum MeshCoreError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("event channel closed")]
    ChannelClosed,

    #[error("malformed pfchan frame: {0}")]
    MalformedFrame(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

pub type Result<T> = std::result::Result<T, MeshCoreError>;
