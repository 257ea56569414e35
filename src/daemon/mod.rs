//! The llxd daemon.
//!
//! The daemon is a long-running process that:
//! - Holds one loaded model for its whole lifetime
//! - Listens on a Unix domain socket
//! - Serializes inference through a single worker thread
//! - Streams generated text back to each client as it is produced

pub mod engine;
pub mod inference;
pub mod metrics;
pub mod prompts;
pub mod queue;
pub mod server;
pub mod shutdown;

pub use server::{Daemon, DaemonConfig, DaemonHandle};
