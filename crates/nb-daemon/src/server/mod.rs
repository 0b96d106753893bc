//! SSH server implementation

mod handler;
mod listener;

pub use handler::{server_config, ConnectionHandler};
pub use listener::{generate_host_key, SshServer};
