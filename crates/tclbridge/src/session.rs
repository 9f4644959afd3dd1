//! Session controller: one remote tool, one pipe set, one call at a time.
//!
//! # Lifecycle
//!
//! ```text
//! Created -> AwaitingHandshake -> Ready <-> Calling
//!                                   |
//!                                Closing -> Terminated
//! ```
//!
//! Any fatal error jumps straight to `Terminated`: the child is killed and
//! reaped, the pipe directory is removed, and the original error is returned.
//! Remote evaluation errors are not fatal; the session stays `Ready`.

use std::fmt;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tokio::time::Instant;

use crate::bootstrap;
use crate::bridge::liveness::Sentinel;
use crate::bridge::protocol::{ControllerMessage, Hello, ProcedureResult, RemoteMessage};
use crate::bridge::transport::PipeSet;
use crate::command::Invocation;
use crate::config::SessionConfig;
use crate::error::BridgeError;
use crate::reference::{RemoteRef, SessionId};
use crate::version::VersionInfo;

/// Grace for a remote whose sentinel closed to finish exiting on its own.
const REAP_GRACE: Duration = Duration::from_secs(1);
/// Wait after SIGTERM before escalating to SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(1);
/// Wait after SIGKILL for the child to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    AwaitingHandshake,
    Ready,
    Calling,
    Closing,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::AwaitingHandshake => "awaiting_handshake",
            Self::Ready => "ready",
            Self::Calling => "calling",
            Self::Closing => "closing",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// How a closed session's child ended up.
#[derive(Debug)]
pub enum CloseOutcome {
    /// The child exited and was reaped.
    Exited(ExitStatus),
    /// The child left the protocol and keeps running; the caller owns it.
    Detached(Child),
}

pub struct Session {
    id: SessionId,
    config: SessionConfig,
    state: SessionState,
    pipes: PipeSet,
    sentinel: Option<Sentinel>,
    child: Option<Child>,
    child_id: Option<u32>,
    hello: Option<Hello>,
    next_cmd_idx: u64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("child_id", &self.child_id)
            .field("next_cmd_idx", &self.next_cmd_idx)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn the tool and wait for its handshake.
    pub async fn open(config: SessionConfig) -> Result<Self, BridgeError> {
        let id = SessionId::new();
        let pipes = PipeSet::create().map_err(BridgeError::Resource)?;
        let script = bootstrap::install(pipes.dir()).map_err(BridgeError::Resource)?;
        // Before spawn, so the remote's open-for-write finds a reader.
        let sentinel = Sentinel::open(pipes.sentinel()).map_err(BridgeError::Resource)?;

        let mut session = Self {
            id,
            config,
            state: SessionState::Created,
            pipes,
            sentinel: Some(sentinel),
            child: None,
            child_id: None,
            hello: None,
            next_cmd_idx: 0,
        };

        let spec = session.config.launcher.spawn_spec(&script);
        tracing::info!(
            session = %id,
            program = %spec.program.to_string_lossy(),
            dir = %session.pipes.dir().display(),
            "Spawning remote tool"
        );
        let child = match spec.spawn(session.pipes.child_env(), session.config.debug_remote) {
            Ok(child) => child,
            Err(e) => return Err(session.terminate(BridgeError::Spawn(e)).await),
        };
        session.child_id = child.id();
        session.child = Some(child);
        session.state = SessionState::AwaitingHandshake;

        tracing::debug!(session = %id, pid = ?session.child_id, "Waiting for Hello");
        match session.handshake().await {
            Ok(hello) => {
                tracing::info!(
                    session = %id,
                    patchlevel = %hello.patchlevel,
                    executable = %hello.nameofexecutable,
                    "Remote ready"
                );
                session.hello = Some(hello);
                session.state = SessionState::Ready;
                Ok(session)
            }
            Err(e) => Err(session.terminate(e).await),
        }
    }

    async fn handshake(&mut self) -> Result<Hello, BridgeError> {
        let deadline = self.config.handshake_timeout.map(|t| Instant::now() + t);
        let sentinel = self.sentinel.as_ref().ok_or(BridgeError::SessionClosed)?;
        let child = self.child.as_mut().ok_or(BridgeError::SessionClosed)?;

        // A child that dies before opening the sentinel never makes it report
        // EOF, so child exit is watched too.
        let msg = tokio::select! {
            biased;
            res = self.pipes.receive::<RemoteMessage>(sentinel, deadline) => res?,
            status = child.wait() => {
                return Err(BridgeError::EarlyExit { status: status.ok() });
            }
        };

        match msg {
            RemoteMessage::Hello(hello) => Ok(hello),
            other => Err(BridgeError::Protocol(format!(
                "expected Hello as first message, got {}",
                other.class()
            ))),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Handshake received from the remote.
    pub fn hello(&self) -> Option<&Hello> {
        self.hello.as_ref()
    }

    pub fn version_info(&self) -> VersionInfo {
        let info = VersionInfo::new();
        match &self.hello {
            Some(hello) => info
                .with_tcl(hello.patchlevel.clone())
                .with_executable(hello.nameofexecutable.clone()),
            None => info,
        }
    }

    /// Index the next call will get.
    pub fn next_cmd_idx(&self) -> u64 {
        self.next_cmd_idx
    }

    pub fn child_id(&self) -> Option<u32> {
        self.child_id
    }

    /// Pipe directory, while it exists.
    pub fn pipe_dir(&self) -> Option<&Path> {
        self.pipes.is_live().then(|| self.pipes.dir())
    }

    /// Evaluate `command` in the remote's global scope.
    pub async fn call(&mut self, command: impl Into<String>) -> Result<RemoteRef, BridgeError> {
        let timeout = self.config.call_timeout;
        self.call_inner(command.into(), timeout).await
    }

    /// Like [`call`](Self::call) with a deadline for this call only.
    pub async fn call_with_timeout(
        &mut self,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Result<RemoteRef, BridgeError> {
        self.call_inner(command.into(), Some(timeout)).await
    }

    /// Render and call `invocation`.
    pub async fn invoke(&mut self, invocation: &Invocation) -> Result<RemoteRef, BridgeError> {
        self.check_refs(invocation.refs())?;
        self.call(invocation.render()).await
    }

    /// Call `invocation` as a method of `target`, placed per
    /// [`SessionConfig::object_position`].
    pub async fn invoke_on(
        &mut self,
        target: &RemoteRef,
        invocation: &Invocation,
    ) -> Result<RemoteRef, BridgeError> {
        self.check_refs(std::iter::once(target).chain(invocation.refs()))?;
        let command = invocation.render_on(target, self.config.object_position);
        self.call(command).await
    }

    fn check_refs<'a>(
        &self,
        refs: impl IntoIterator<Item = &'a RemoteRef>,
    ) -> Result<(), BridgeError> {
        for r in refs {
            if r.session() != self.id {
                return Err(BridgeError::InvalidArgument(format!(
                    "reference to result {} belongs to session {}, not {}",
                    r.cmd_idx(),
                    r.session(),
                    self.id
                )));
            }
        }
        Ok(())
    }

    async fn call_inner(
        &mut self,
        command: String,
        timeout: Option<Duration>,
    ) -> Result<RemoteRef, BridgeError> {
        match self.state {
            SessionState::Ready => {}
            SessionState::Calling => {
                // A previous call future was dropped mid-exchange; the pipes
                // are in an unknown state.
                let err = BridgeError::Protocol("a previous call was abandoned mid-flight".into());
                return Err(self.terminate(err).await);
            }
            _ => return Err(BridgeError::SessionClosed),
        }
        if self.sentinel.as_ref().is_some_and(Sentinel::is_closed_now) {
            return Err(self.terminate(BridgeError::early_exit()).await);
        }

        let cmd_idx = self.next_cmd_idx;
        self.next_cmd_idx += 1;
        self.state = SessionState::Calling;

        if self.config.log_commands {
            tracing::info!(target: "tclbridge::command", session = %self.id, cmd_idx, "{}", command);
        } else {
            tracing::debug!(session = %self.id, cmd_idx, %command, "Calling");
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let reply = match self.exchange(cmd_idx, &command, deadline).await {
            Ok(reply) => reply,
            Err(e) => return Err(self.terminate(e).await),
        };
        self.state = SessionState::Ready;

        if reply.is_error() {
            tracing::debug!(
                session = %self.id,
                cmd_idx,
                err_code = reply.err_code,
                message = %reply.result,
                "Remote evaluation failed"
            );
            return Err(BridgeError::RemoteEvaluation {
                cmd_idx,
                message: reply.result,
                error_info: reply.error_info,
            });
        }

        if self.config.log_results {
            tracing::info!(target: "tclbridge::result", session = %self.id, cmd_idx, "{}", reply.result);
        }
        Ok(RemoteRef::new(self.id, cmd_idx, reply.result, command))
    }

    async fn exchange(
        &self,
        cmd_idx: u64,
        command: &str,
        deadline: Option<Instant>,
    ) -> Result<ProcedureResult, BridgeError> {
        let sentinel = self.sentinel.as_ref().ok_or(BridgeError::SessionClosed)?;
        let call = ControllerMessage::ProcedureCall {
            command: command.to_owned(),
        };
        self.pipes.send(call, sentinel, deadline).await?;

        match self.pipes.receive::<RemoteMessage>(sentinel, deadline).await? {
            RemoteMessage::ProcedureResult(reply) if reply.cmd_idx == cmd_idx => Ok(reply),
            RemoteMessage::ProcedureResult(reply) => Err(BridgeError::Protocol(format!(
                "reply carries command index {}, expected {}",
                reply.cmd_idx, cmd_idx
            ))),
            other => Err(BridgeError::Protocol(format!(
                "expected ProcedureResult, got {}",
                other.class()
            ))),
        }
    }

    /// Leave the protocol.
    ///
    /// With `quit` the remote exits; it gets [`SessionConfig::exit_grace`] to
    /// do so before SIGTERM, then SIGKILL. Without `quit` the remote keeps
    /// running and is handed back as [`CloseOutcome::Detached`]. The pipe
    /// directory is removed either way.
    pub async fn close(&mut self, quit: bool) -> Result<CloseOutcome, BridgeError> {
        match self.state {
            SessionState::Terminated => return Err(BridgeError::SessionClosed),
            SessionState::Calling => {
                let err = BridgeError::Protocol("a previous call was abandoned mid-flight".into());
                return Err(self.terminate(err).await);
            }
            _ => {}
        }
        self.state = SessionState::Closing;
        tracing::debug!(session = %self.id, quit, "Closing session");

        let deadline = Some(Instant::now() + self.config.exit_grace);
        let sent = match &self.sentinel {
            Some(sentinel) => self
                .pipes
                .send(ControllerMessage::Exit { quit }, sentinel, deadline)
                .await
                .map_err(BridgeError::from),
            None => Err(BridgeError::SessionClosed),
        };

        match sent {
            Ok(()) => {}
            Err(BridgeError::EarlyExit { .. }) => {
                // Already gone: nothing to say goodbye to.
                self.release();
                let status = match self.child.take() {
                    Some(mut child) => reap(&mut child, true).await,
                    None => None,
                };
                self.state = SessionState::Terminated;
                return match status {
                    Some(status) => Ok(CloseOutcome::Exited(status)),
                    None => Err(BridgeError::early_exit()),
                };
            }
            Err(e) => return Err(self.terminate(e).await),
        }

        self.release();
        let Some(mut child) = self.child.take() else {
            self.state = SessionState::Terminated;
            return Err(BridgeError::SessionClosed);
        };
        self.state = SessionState::Terminated;

        if !quit {
            tracing::info!(session = %self.id, pid = ?self.child_id, "Remote detached");
            return Ok(CloseOutcome::Detached(child));
        }

        let status = shutdown(&mut child, self.config.exit_grace).await?;
        tracing::info!(session = %self.id, %status, "Remote exited");
        Ok(CloseOutcome::Exited(status))
    }

    /// Kill the child, release the pipes, and hand back `err`.
    async fn terminate(&mut self, mut err: BridgeError) -> BridgeError {
        tracing::warn!(session = %self.id, state = %self.state, error = %err, "Terminating session");
        self.state = SessionState::Terminated;

        if let Some(mut child) = self.child.take() {
            let natural = matches!(err, BridgeError::EarlyExit { .. });
            let reaped = reap(&mut child, natural).await;
            if let BridgeError::EarlyExit { status } = &mut err
                && status.is_none()
            {
                *status = reaped;
            }
        }
        self.release();
        err
    }

    fn release(&mut self) {
        self.sentinel = None;
        self.pipes.release_blocked_writers();
        if let Err(e) = self.pipes.cleanup() {
            tracing::warn!(session = %self.id, error = %e, "Failed to cleanup pipe directory");
        }
    }
}

/// Reap `child`, giving it [`REAP_GRACE`] to exit on its own when `natural`,
/// and killing it otherwise.
async fn reap(child: &mut Child, natural: bool) -> Option<ExitStatus> {
    if natural && let Ok(Ok(status)) = tokio::time::timeout(REAP_GRACE, child.wait()).await {
        return Some(status);
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Failed to kill remote");
    }
    match tokio::time::timeout(KILL_WAIT, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Failed to reap remote");
            None
        }
        Err(_) => {
            tracing::warn!("Remote did not exit after SIGKILL");
            None
        }
    }
}

/// Wait `grace` for a natural exit, then SIGTERM, then SIGKILL.
async fn shutdown(child: &mut Child, grace: Duration) -> Result<ExitStatus, BridgeError> {
    if let Ok(res) = tokio::time::timeout(grace, child.wait()).await {
        return res.map_err(BridgeError::Resource);
    }

    if let Some(pid) = child.id() {
        tracing::warn!(pid, "Remote did not exit in time, sending SIGTERM");
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            tracing::debug!(error = %e, "Failed to send SIGTERM");
        }
        if let Ok(res) = tokio::time::timeout(TERM_GRACE, child.wait()).await {
            return res.map_err(BridgeError::Resource);
        }
    }

    tracing::warn!("Remote ignored SIGTERM, sending SIGKILL");
    child.start_kill().map_err(BridgeError::Resource)?;
    match tokio::time::timeout(KILL_WAIT, child.wait()).await {
        Ok(res) => res.map_err(BridgeError::Resource),
        Err(_) => Err(BridgeError::Timeout),
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }
        tracing::warn!(session = %self.id, state = %self.state, "Session dropped while open, killing remote");
        if let Some(child) = self.child.as_mut()
            && let Err(e) = child.start_kill()
        {
            tracing::debug!(error = %e, "Failed to kill remote");
        }
        self.sentinel = None;
        self.pipes.release_blocked_writers();
    }
}
