// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

pub mod buffer;
pub mod table;

pub use buffer::{BufferTable, BufferedMessage, BUFFERED_MESSAGE_TIMEOUT_MS};
pub use table::{Session, SessionTable};
