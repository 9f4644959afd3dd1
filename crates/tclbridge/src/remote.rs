//! Remote side of the bridge, for interpreters written in Rust.
//!
//! Mirrors the companion Tcl script: hold the sentinel, say Hello, then
//! evaluate calls and keep every result until the controller sends Exit.
//! The loopback fixture binary is built on this.

use std::fmt;

use async_trait::async_trait;

use crate::bridge::protocol::{ControllerMessage, Hello, ProcedureResult, RemoteMessage};
use crate::bridge::transport::{self, RemotePipes};
use crate::error::BridgeError;
use crate::reference::ResultStore;

/// An interpreter that can serve bridge calls.
#[async_trait]
pub trait Evaluator: Send {
    /// Values kept in the result store. Errors are stored as their message.
    type Value: Clone + Send + Sync + fmt::Display + From<String>;

    /// Handshake describing this interpreter.
    fn hello(&self) -> Hello;

    /// Evaluate one command. `Err` carries the error message.
    async fn eval(
        &mut self,
        command: &str,
        results: &ResultStore<Self::Value>,
    ) -> Result<Self::Value, String>;
}

pub struct RemoteEndpoint {
    pipes: RemotePipes,
}

impl RemoteEndpoint {
    /// Endpoint for the pipes named in the `TCLBRIDGE_PIPE_*` environment.
    pub fn from_env() -> Result<Self, BridgeError> {
        let pipes = RemotePipes::from_env().map_err(BridgeError::Resource)?;
        Ok(Self::new(pipes))
    }

    pub fn new(pipes: RemotePipes) -> Self {
        Self { pipes }
    }

    pub fn pipes(&self) -> &RemotePipes {
        &self.pipes
    }

    /// Serve calls until the controller sends Exit.
    ///
    /// Returns the Exit message's `quit` flag. The sentinel is released on
    /// return, so a detached process no longer looks alive to the controller.
    pub async fn serve<E: Evaluator>(&self, mut evaluator: E) -> Result<bool, BridgeError> {
        let sentinel = self.pipes.hold_sentinel().await?;
        tracing::debug!(path = %self.pipes.sentinel.display(), "Holding sentinel");

        transport::send_unguarded(&self.pipes.inbound, RemoteMessage::Hello(evaluator.hello()))
            .await?;

        let mut results: ResultStore<E::Value> = ResultStore::new();
        let quit = loop {
            let msg = transport::read_message::<ControllerMessage>(&self.pipes.outbound).await?;
            match msg {
                Some(ControllerMessage::ProcedureCall { command }) => {
                    let cmd_idx = results.next_idx();
                    tracing::debug!(cmd_idx, %command, "Evaluating");
                    let reply = match evaluator.eval(&command, &results).await {
                        Ok(value) => {
                            let result = value.to_string();
                            results.push(value);
                            ProcedureResult {
                                err_code: 0,
                                cmd_idx,
                                result,
                                error_info: None,
                            }
                        }
                        Err(message) => {
                            results.push(E::Value::from(message.clone()));
                            let error_info = format!("{message}\n    while executing\n\"{command}\"");
                            ProcedureResult {
                                err_code: 1,
                                cmd_idx,
                                result: message,
                                error_info: Some(error_info),
                            }
                        }
                    };
                    transport::send_unguarded(
                        &self.pipes.inbound,
                        RemoteMessage::ProcedureResult(reply),
                    )
                    .await?;
                }
                Some(ControllerMessage::Exit { quit }) => break quit,
                None => {
                    return Err(BridgeError::Protocol(
                        "controller closed the pipe without sending a message".to_string(),
                    ));
                }
            }
        };

        tracing::debug!(quit, "Leaving the bridge");
        drop(sentinel);
        Ok(quit)
    }
}
