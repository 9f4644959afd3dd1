//! tclbridge: drive Tcl-scripted tools from Rust.
//!
//! A [`Session`] spawns the tool with a small companion script, then exchanges
//! messages with that script over named pipes. No native extension is loaded
//! into the remote interpreter.

#[cfg(not(unix))]
compile_error!("tclbridge requires a Unix platform (named pipes)");

mod bootstrap;
mod version;

pub mod bridge;
pub mod command;
pub mod config;
pub mod error;
pub mod reference;
pub mod remote;
pub mod session;
pub mod spawn;

pub use command::{Arg, Invocation, ObjectPosition};
pub use config::SessionConfig;
pub use error::BridgeError;
pub use reference::{RemoteRef, ResultStore, SessionId};
pub use remote::{Evaluator, RemoteEndpoint};
pub use session::{CloseOutcome, Session, SessionState};
pub use spawn::{CommandLineLauncher, SpawnSpec, StdioMode, ToolLauncher};
pub use version::{TCLBRIDGE_VERSION, VersionInfo};
