//! Per-connection terminal bridge.
//!
//! A [`session::TerminalSession`] sits between one client connection and at
//! most one PTY-backed child process. While no process is attached it emulates
//! a tiny line-editing shell that understands a handful of built-in commands
//! and launches whitelisted apps; once an app is running, keystrokes pass
//! straight through to it and its output streams back to the client.
//!
//! Key components:
//! - [`admission`]: process-wide cap on concurrently running apps
//! - [`command`]: classifies a typed line into a builtin or an app invocation
//! - [`pty_bridge`]: spawns, pumps, resizes and terminates one child process
//! - [`session`]: the Idle / Busy / Closed state machine per connection
//! - [`message`]: the JSON wire messages exchanged with the client
//! - [`output`]: the single serialization point for outbound frames

pub mod admission;
pub mod command;
pub mod message;
pub mod output;
pub mod pty_bridge;
pub mod session;

pub use admission::{AdmissionController, AdmissionSlot};
pub use message::{ClientMessage, ServerMessage};
pub use output::OutputWriter;
pub use pty_bridge::{SessionConfig, SpawnError};
pub use session::TerminalSession;
