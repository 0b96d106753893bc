//! Channel dispatch and request handling
//!
//! Decides what happens to channel-open events and to the requests that
//! arrive on accepted channels. Nothing here touches russh types, so the
//! protocol rules can be exercised without a network.

use std::fmt;

use nb_core::{ChannelKind, RequestKind};

/// Why a channel-open was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Only `session` channels are served
    UnknownChannelType,
    /// The connection already holds its maximum number of channels
    ResourceShortage,
}

impl RejectReason {
    /// Human-readable description, used in logs.
    ///
    /// russh only puts this on the wire for kinds it does not parse itself;
    /// a refusal from a handler callback always goes out as
    /// `SSH_OPEN_ADMINISTRATIVELY_PROHIBITED` with the text "Rejected".
    pub fn message(&self) -> &'static str {
        match self {
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "too many open channels",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Outcome of a channel-open event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDecision {
    Accept,
    Reject(RejectReason),
}

/// Decide whether a channel of `kind` may be opened on a connection that
/// already has `open_channels` channels.
pub fn admit_channel(kind: &ChannelKind, open_channels: usize, limit: Option<u32>) -> ChannelDecision {
    if !kind.is_supported() {
        return ChannelDecision::Reject(RejectReason::UnknownChannelType);
    }

    match limit {
        Some(max) if open_channels >= max as usize => {
            ChannelDecision::Reject(RejectReason::ResourceShortage)
        }
        _ => ChannelDecision::Accept,
    }
}

/// Reply owed to the client for one channel request.
///
/// The transport only puts it on the wire when the request asked for a
/// reply, so every request maps to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Success,
    Failure,
}

/// What handling a single request did
#[derive(Debug)]
pub enum RequestOutcome<E> {
    /// An exec request started a new bridged process
    Started,
    /// Not an exec request; the channel stays usable
    Unsupported,
    /// The channel already gave up after a failed start
    Abandoned,
    /// The bridged process could not be started
    Failed(E),
}

impl<E> RequestOutcome<E> {
    pub fn reply(&self) -> Reply {
        match self {
            Self::Started => Reply::Success,
            Self::Unsupported | Self::Abandoned | Self::Failed(_) => Reply::Failure,
        }
    }

    /// Whether the channel should be closed after replying
    pub fn ends_channel(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// A process attached to a channel
pub trait ChannelProcess {
    /// Stop feeding the process; it sees end-of-file on stdin
    fn close_stdin(&mut self);

    /// Whether the process is still running
    fn is_running(&self) -> bool;
}

/// Request-processing state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// A process failed to start; no further requests are acted on
    Abandoned,
}

/// Per-channel state: processes started on it and whether it still takes
/// requests. Requests must be fed in arrival order.
pub struct ChannelContext<P> {
    state: ChannelState,
    processes: Vec<P>,
}

impl<P: ChannelProcess> ChannelContext<P> {
    pub fn new() -> Self {
        Self {
            state: ChannelState::Open,
            processes: Vec::new(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Number of processes on this channel that have not been pruned
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Handle one request. `launch` is only called for exec requests on an
    /// open channel; the request payload is never consulted.
    pub fn handle_request<E>(
        &mut self,
        kind: &RequestKind,
        launch: impl FnOnce() -> Result<P, E>,
    ) -> RequestOutcome<E> {
        if self.state == ChannelState::Abandoned {
            return RequestOutcome::Abandoned;
        }

        match kind {
            RequestKind::Other(_) => RequestOutcome::Unsupported,
            RequestKind::Exec => match launch() {
                Ok(process) => {
                    self.prune();
                    self.processes.push(process);
                    RequestOutcome::Started
                }
                Err(e) => {
                    self.state = ChannelState::Abandoned;
                    RequestOutcome::Failed(e)
                }
            },
        }
    }

    /// Process that receives client input: the most recently started one
    /// that is still running
    pub fn input_target(&mut self) -> Option<&mut P> {
        self.prune();
        self.processes.last_mut()
    }

    /// Forget processes that have exited
    fn prune(&mut self) {
        self.processes.retain(|process| process.is_running());
    }

    /// Client sent EOF: close stdin of every process on the channel
    pub fn close_input(&mut self) {
        for process in &mut self.processes {
            process.close_stdin();
        }
    }
}

impl<P: ChannelProcess> Default for ChannelContext<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct FakeProcess {
        id: u32,
        stdin_open: bool,
        exited: Option<Arc<AtomicBool>>,
    }

    impl FakeProcess {
        fn started(id: u32) -> Result<Self, String> {
            Ok(Self {
                id,
                stdin_open: true,
                exited: None,
            })
        }

        /// A process whose exit is controlled through the returned flag
        fn with_exit_flag(id: u32) -> (Result<Self, String>, Arc<AtomicBool>) {
            let exited = Arc::new(AtomicBool::new(false));
            let process = Self {
                id,
                stdin_open: true,
                exited: Some(exited.clone()),
            };
            (Ok(process), exited)
        }
    }

    impl ChannelProcess for FakeProcess {
        fn close_stdin(&mut self) {
            self.stdin_open = false;
        }

        fn is_running(&self) -> bool {
            self.exited
                .as_ref()
                .map_or(true, |exited| !exited.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn test_admit_session_channel() {
        assert_eq!(
            admit_channel(&ChannelKind::Session, 0, None),
            ChannelDecision::Accept
        );
        assert_eq!(
            admit_channel(&ChannelKind::Session, 3, Some(4)),
            ChannelDecision::Accept
        );
    }

    #[test]
    fn test_reject_unknown_channel_kind() {
        for kind in ["shell", "direct-tcpip", "x11", "forwarded-tcpip"] {
            let decision = admit_channel(&ChannelKind::from(kind), 0, None);
            assert_eq!(
                decision,
                ChannelDecision::Reject(RejectReason::UnknownChannelType)
            );
        }
        assert_eq!(
            RejectReason::UnknownChannelType.message(),
            "unknown channel type"
        );
    }

    #[test]
    fn test_unknown_kind_rejected_before_limit() {
        assert_eq!(
            admit_channel(&ChannelKind::from("x11"), 10, Some(1)),
            ChannelDecision::Reject(RejectReason::UnknownChannelType)
        );
    }

    #[test]
    fn test_reject_over_channel_limit() {
        assert_eq!(
            admit_channel(&ChannelKind::Session, 2, Some(2)),
            ChannelDecision::Reject(RejectReason::ResourceShortage)
        );
    }

    #[test]
    fn test_non_exec_requests_fail_without_abandoning() {
        let mut ctx = ChannelContext::<FakeProcess>::new();

        for name in [
            "shell",
            "pty-req",
            "env",
            "subsystem",
            "x11-req",
            "window-change",
            "signal",
        ] {
            let outcome = ctx.handle_request(&RequestKind::from(name), || -> Result<_, String> {
                panic!("launch must not run for {}", name)
            });
            assert!(matches!(outcome, RequestOutcome::Unsupported));
            assert_eq!(outcome.reply(), Reply::Failure);
            assert!(!outcome.ends_channel());
        }

        assert_eq!(ctx.state(), ChannelState::Open);
        assert_eq!(ctx.process_count(), 0);
    }

    #[test]
    fn test_exec_starts_process() {
        let mut ctx = ChannelContext::new();

        let outcome = ctx.handle_request(&RequestKind::Exec, || FakeProcess::started(1));
        assert!(matches!(outcome, RequestOutcome::Started));
        assert_eq!(outcome.reply(), Reply::Success);
        assert_eq!(ctx.process_count(), 1);
        assert_eq!(ctx.input_target().map(|p| p.id), Some(1));
    }

    #[test]
    fn test_repeat_exec_starts_another_process() {
        let mut ctx = ChannelContext::new();

        ctx.handle_request(&RequestKind::Exec, || FakeProcess::started(1));
        let outcome = ctx.handle_request(&RequestKind::Exec, || FakeProcess::started(2));

        assert_eq!(outcome.reply(), Reply::Success);
        assert_eq!(ctx.process_count(), 2);
        // Input goes to the newest process
        assert_eq!(ctx.input_target().map(|p| p.id), Some(2));
    }

    #[test]
    fn test_failed_exec_abandons_channel() {
        let mut ctx = ChannelContext::<FakeProcess>::new();

        let outcome = ctx.handle_request(&RequestKind::Exec, || Err("no such file".to_string()));
        assert!(matches!(outcome, RequestOutcome::Failed(ref e) if e == "no such file"));
        assert_eq!(outcome.reply(), Reply::Failure);
        assert!(outcome.ends_channel());
        assert_eq!(ctx.state(), ChannelState::Abandoned);

        // Later requests, exec included, are not acted on
        let outcome = ctx.handle_request(&RequestKind::Exec, || -> Result<_, String> {
            panic!("launch must not run on an abandoned channel")
        });
        assert!(matches!(outcome, RequestOutcome::Abandoned));
        assert_eq!(outcome.reply(), Reply::Failure);
        assert!(!outcome.ends_channel());
    }

    #[test]
    fn test_close_input_reaches_every_process() {
        let mut ctx = ChannelContext::new();
        ctx.handle_request(&RequestKind::Exec, || FakeProcess::started(1));
        ctx.handle_request(&RequestKind::Exec, || FakeProcess::started(2));

        ctx.close_input();

        assert!(ctx.processes.iter().all(|p| !p.stdin_open));
    }

    #[test]
    fn test_input_skips_exited_process() {
        let mut ctx = ChannelContext::new();
        ctx.handle_request(&RequestKind::Exec, || FakeProcess::started(1));
        let (second, second_exited) = FakeProcess::with_exit_flag(2);
        ctx.handle_request(&RequestKind::Exec, || second);
        assert_eq!(ctx.input_target().map(|p| p.id), Some(2));

        second_exited.store(true, Ordering::SeqCst);

        assert_eq!(ctx.input_target().map(|p| p.id), Some(1));
        assert_eq!(ctx.process_count(), 1);
    }

    #[test]
    fn test_no_input_target_once_all_exited() {
        let mut ctx = ChannelContext::new();
        let (only, exited) = FakeProcess::with_exit_flag(1);
        ctx.handle_request(&RequestKind::Exec, || only);

        exited.store(true, Ordering::SeqCst);

        assert!(ctx.input_target().is_none());
        assert_eq!(ctx.process_count(), 0);
        assert_eq!(ctx.state(), ChannelState::Open);
    }
}
