//! nb-daemon: SSH front-end for a single fixed local command
//!
//! Accepts SSH connections without client authentication, serves `session`
//! channels, and answers every `exec` request by starting the configured
//! command with its stdin and stdout bridged to the channel. The command
//! text sent by the client is never used.

pub mod bridge;
pub mod dispatch;
pub mod server;
pub mod state;

pub use state::DaemonState;
