//! SSH server listener
//!
//! Accepts incoming connections and spawns a handler task for each client.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::server::handler::{server_config, ConnectionHandler};
use crate::state::DaemonState;

/// SSH server bound to its listen address
pub struct SshServer {
    /// Bound listener
    listener: TcpListener,
    /// russh configuration carrying the host key
    ssh_config: Arc<russh::server::Config>,
    /// Shared daemon state
    state: Arc<DaemonState>,
    /// Cancellation token for shutdown
    cancel: CancellationToken,
}

impl SshServer {
    /// Bind the configured listen address.
    ///
    /// A bind failure is returned to the caller; nothing else about the
    /// server is fatal.
    pub async fn bind(
        host_key: KeyPair,
        state: Arc<DaemonState>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let bind_addr = &state.config.listen_address;
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        Ok(Self {
            listener,
            ssh_config: server_config(host_key, &state.config),
            state,
            cancel,
        })
    }

    /// Address the server is actually listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until cancelled
    pub async fn run(self) -> Result<()> {
        tracing::info!("SSH server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("SSH server shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            self.handle_connection(socket, peer_addr);
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a new incoming connection
    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let Some(admission) = self.state.try_admit() else {
            tracing::warn!(peer = %peer_addr, "Connection limit reached, dropping connection");
            return;
        };

        tracing::info!(peer = %peer_addr, "New connection");

        let config = Arc::clone(&self.ssh_config);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let _admission = admission;
            let handler = ConnectionHandler::new(state, peer_addr);

            let session = match russh::server::run_stream(config, socket, handler).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::error!(peer = %peer_addr, error = %e, "SSH negotiation failed");
                    return;
                }
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Connection handler cancelled for {}", peer_addr);
                    return;
                }
                result = session => result
            };

            match result {
                Ok(()) => {
                    tracing::info!(peer = %peer_addr, "Connection closed");
                }
                Err(e) => {
                    tracing::warn!(peer = %peer_addr, error = %e, "Connection closed with error");
                }
            }
        });
    }
}

/// Generate a fresh Ed25519 host key.
///
/// The key is never persisted, so the host identity changes on every start.
pub fn generate_host_key() -> Result<KeyPair> {
    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;

    let fingerprint = key
        .clone_public_key()
        .context("Failed to derive host public key")?
        .fingerprint();
    tracing::info!("Generated ephemeral host key, fingerprint: {}", fingerprint);

    Ok(key)
}
