//! SSH connection handler
//!
//! Implements the russh server handler for one client connection. russh
//! invokes these callbacks one at a time per connection, so requests on a
//! channel are seen in arrival order and each reply is queued before the
//! next request is read.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodSet, Pty, Sig};
use russh_keys::key::KeyPair;

use nb_core::config::DaemonConfig;
use nb_core::{ChannelKind, RequestKind};

use crate::bridge::BridgedProcess;
use crate::dispatch::{admit_channel, ChannelContext, ChannelDecision, Reply, RequestOutcome};
use crate::state::DaemonState;

/// Handler for a single SSH client connection
pub struct ConnectionHandler {
    /// Shared daemon state
    state: Arc<DaemonState>,
    /// Peer address of the connecting client
    peer_addr: SocketAddr,
    /// Accepted channels and the processes started on them
    channels: HashMap<ChannelId, ChannelContext<BridgedProcess>>,
}

impl ConnectionHandler {
    /// Create a handler for a freshly accepted connection
    pub fn new(state: Arc<DaemonState>, peer_addr: SocketAddr) -> Self {
        Self {
            state,
            peer_addr,
            channels: HashMap::new(),
        }
    }

    /// Log and refuse a channel that is not a `session`.
    ///
    /// russh answers the refusal itself, as administratively prohibited.
    fn reject_channel(&self, kind: ChannelKind) -> bool {
        let decision = admit_channel(&kind, self.channels.len(), None);
        if let ChannelDecision::Reject(reason) = decision {
            tracing::warn!(
                peer = %self.peer_addr,
                kind = %kind,
                reason = %reason,
                "New channel rejected"
            );
        }
        false
    }

    /// Run one channel request through the dispatcher and send its reply
    fn handle_request(&mut self, channel: ChannelId, kind: RequestKind, session: &mut Session) {
        let Some(ctx) = self.channels.get_mut(&channel) else {
            tracing::debug!(channel = ?channel, kind = %kind, "Request for unknown channel");
            session.channel_failure(channel);
            return;
        };

        let config = &self.state.config;
        let outcome = ctx.handle_request(&kind, || {
            BridgedProcess::spawn(config, channel, session.handle())
        });

        match &outcome {
            RequestOutcome::Started => {
                let pid = ctx.input_target().and_then(|process| process.pid());
                tracing::info!(
                    peer = %self.peer_addr,
                    channel = ?channel,
                    pid = ?pid,
                    processes = ctx.process_count(),
                    "Exec request accepted"
                );
            }
            RequestOutcome::Unsupported => {
                tracing::debug!(channel = ?channel, kind = %kind, "Unsupported channel request");
            }
            RequestOutcome::Abandoned => {
                tracing::debug!(channel = ?channel, kind = %kind, "Request on abandoned channel");
            }
            RequestOutcome::Failed(e) => {
                tracing::error!(
                    peer = %self.peer_addr,
                    channel = ?channel,
                    error = %e,
                    "Failed to start bridged process"
                );
            }
        }

        match outcome.reply() {
            Reply::Success => {
                session.channel_success(channel);
            }
            Reply::Failure => {
                session.channel_failure(channel);
            }
        }

        if outcome.ends_channel() {
            session.close(channel);
        }
    }
}

#[async_trait]
impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    /// Every client is admitted without credentials
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        tracing::info!(peer = %self.peer_addr, user, "Client admitted without authentication");
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        let kind = ChannelKind::Session;

        match admit_channel(
            &kind,
            self.channels.len(),
            self.state.config.max_channels_per_connection,
        ) {
            ChannelDecision::Accept => {
                tracing::info!(peer = %self.peer_addr, channel = ?channel_id, kind = %kind, "New channel");
                self.channels.insert(channel_id, ChannelContext::new());
                Ok(true)
            }
            ChannelDecision::Reject(reason) => {
                tracing::warn!(
                    peer = %self.peer_addr,
                    kind = %kind,
                    reason = %reason,
                    "New channel rejected"
                );
                Ok(false)
            }
        }
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel(ChannelKind::from("x11")))
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel(ChannelKind::from("direct-tcpip")))
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel(ChannelKind::from("forwarded-tcpip")))
    }

    /// The command text in `_command` is deliberately ignored
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _command: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_request(channel, RequestKind::Exec, session);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_request(channel, RequestKind::from("shell"), session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(channel = ?channel, subsystem = name, "Subsystem requested");
        self.handle_request(channel, RequestKind::from("subsystem"), session);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_request(channel, RequestKind::from("pty-req"), session);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_request(channel, RequestKind::from("env"), session);
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_request(channel, RequestKind::from("x11-req"), session);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_request(channel, RequestKind::from("window-change"), session);
        Ok(())
    }

    /// Signals are not forwarded to bridged processes
    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(channel = ?channel, signal = ?signal, "Signal requested");
        self.handle_request(channel, RequestKind::from("signal"), session);
        Ok(())
    }

    /// Session-level forwarding requests are discarded
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(peer = %self.peer_addr, address, port = *port, "Discarding tcpip-forward request");
        Ok(false)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!("Received {} bytes on channel {:?}", data.len(), channel);

        let target = self
            .channels
            .get_mut(&channel)
            .and_then(|ctx| ctx.input_target());

        let Some(process) = target else {
            tracing::debug!(channel = ?channel, "Dropping data for channel without process");
            return Ok(());
        };

        // Waiting here holds back the rest of the connection until the
        // process has taken enough of its queued input
        let input = process.send_input(Bytes::copy_from_slice(data));
        match self.state.config.inactivity_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, input).await.is_err() {
                    anyhow::bail!(
                        "bridged process on channel {:?} did not read its input within {:?}",
                        channel,
                        limit
                    );
                }
            }
            None => input.await,
        }

        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF: {:?}", channel);
        if let Some(ctx) = self.channels.get_mut(&channel) {
            ctx.close_input();
        }
        Ok(())
    }

    /// Closing a channel kills whatever is still running on it
    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(ctx) = self.channels.remove(&channel) {
            tracing::debug!(
                peer = %self.peer_addr,
                channel = ?channel,
                processes = ctx.process_count(),
                "Channel closed"
            );
        }
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        if !self.channels.is_empty() {
            tracing::debug!(
                peer = %self.peer_addr,
                channels = self.channels.len(),
                "Connection ended with open channels"
            );
        }
    }
}

/// Build the russh server configuration: one host key, `none` auth only
pub fn server_config(host_key: KeyPair, daemon: &DaemonConfig) -> Arc<russh::server::Config> {
    let mut config = russh::server::Config::default();
    config.keys.push(host_key);
    config.methods = MethodSet::NONE;
    config.auth_rejection_time = Duration::from_secs(1);
    config.auth_rejection_time_initial = Some(Duration::from_secs(0));
    config.inactivity_timeout = daemon.inactivity_timeout;

    Arc::new(config)
}
