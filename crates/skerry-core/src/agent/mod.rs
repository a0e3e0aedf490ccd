//! Guest agent protocol and client.

pub mod client;
pub mod protocol;
pub mod stream;

pub use client::AgentClient;
pub use protocol::{AgentInfo, PROTOCOL_VERSION};
pub use stream::{OutputStream, ProcessHandle};
