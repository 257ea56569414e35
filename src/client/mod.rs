//! Client side of llx.
//!
//! The client is a short-lived process that:
//! - Makes sure a daemon is listening, launching one if needed
//! - Sends the prompt over the Unix socket
//! - Renders the streamed answer to stdout

pub mod fetch;
pub mod input;
pub mod launcher;
pub mod probe;
pub mod render;
pub mod socket;

pub use probe::DaemonManager;
pub use socket::{is_running, send_prompt, send_shutdown};
