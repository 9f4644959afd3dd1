//! Pipe bridge between the controller and the remote interpreter.
//!
//! # Architecture
//!
//! - **protocol**: Frames (ordered key/value records) and the typed messages
//!   carried in them (Hello, ProcedureCall, ProcedureResult, Exit)
//! - **codec**: EOF-terminated frame codec for AsyncRead/AsyncWrite
//! - **transport**: The private FIFO set and the open-per-message discipline
//! - **liveness**: Sentinel pipe that reports remote death as EOF

pub mod codec;
pub mod liveness;
pub mod protocol;
pub mod transport;
