// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! Mesh-routing control plane: the session manager (IPv6 <-> encrypted-session <->
//! handle bookkeeping, buffering, timeouts) and the pathfinder event loop (DHT-driven
//! discovery) for a source-routed overlay network, joined by an in-process event
//! channel (`pfchan`).

pub mod address;
pub mod config;
pub mod crypto;
pub mod error;
pub mod inside_iface;
pub mod pathfinder;
pub mod pfchan;
pub mod protocol;
pub mod session;
pub mod session_manager;
pub mod switch_iface;
pub mod util;

pub use config::Settings;
pub use error::{MeshCoreError, Result};
pub use pathfinder::Pathfinder;
pub use pfchan::{CoreEvent, PFChan, PathfinderEvent};
pub use session_manager::SessionManager;
