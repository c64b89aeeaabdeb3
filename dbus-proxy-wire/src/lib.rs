//! Wire-level building blocks for the D-Bus filtering proxy: framed buffers, the binary
//! message header parser, and the small set of body codecs and message-synthesis helpers
//! the rewrite pipeline needs. Kept free of any policy or event-loop logic so it can be
//! unit-tested without a real socket (§3, §4.1, §4.3).

pub mod buffer;
pub mod error;
pub mod header;
pub mod message;
pub mod transport;

pub use buffer::Buffer;
pub use error::{WireError, WireResult};
pub use header::{Endian, Header, HeaderFlags, MessageType, FIXED_HEADER_SIZE};
pub use transport::Transport;
