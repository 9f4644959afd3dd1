//! Wire protocol types for controller-remote communication.
//!
//! A message is a [`Frame`]: an ordered set of `key -> value` records. On the
//! wire each record is a key line followed by a base64 value line, records are
//! joined with `\n`, and the writer closing the pipe terminates the frame.
//! Base64 keeps arbitrary value bytes (NUL, newlines) out of the line syntax.
//!
//! Four message classes ride in frames:
//! - **Hello** (remote -> controller): mandatory handshake
//! - **ProcedureCall** (controller -> remote): one command to evaluate
//! - **ProcedureResult** (remote -> controller): error code, index, result
//! - **Exit** (controller -> remote): leave the protocol, optionally quitting

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use indexmap::IndexMap;
use serde::Serialize;
use tokio_util::bytes::{BufMut, Bytes, BytesMut};

/// Key carrying the message class. Mandatory in every typed message.
pub const KEY_CLASS: &str = "class";

/// Message class names as they appear in the `class` field.
pub mod class {
    pub const HELLO: &str = "Hello";
    pub const PROCEDURE_CALL: &str = "ProcedureCall";
    pub const PROCEDURE_RESULT: &str = "ProcedureResult";
    pub const EXIT: &str = "Exit";
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame has an unpaired key line ({lines} lines)")]
    OddRecord { lines: usize },

    #[error("invalid frame key '{0}': keys are ASCII letters, digits and underscores")]
    InvalidKey(String),

    #[error("duplicate frame key '{0}'")]
    DuplicateKey(String),

    #[error("value of '{key}' is not valid base64: {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("missing required key '{0}'")]
    MissingKey(String),

    #[error("value of '{key}' is not valid UTF-8")]
    NotUtf8 { key: String },

    #[error("unexpected message class '{found}', expected {expected}")]
    UnexpectedClass {
        found: String,
        expected: &'static str,
    },

    #[error("invalid value '{value}' for '{key}': {reason}")]
    InvalidField {
        key: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Ordered key/value record set, the unit of transfer on a pipe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    fields: IndexMap<String, Bytes>,
}

impl Frame {
    /// Start a frame of the given message class.
    pub fn new(class: &str) -> Self {
        Self::default().with(KEY_CLASS, class.to_owned())
    }

    /// Append a record. A repeated key replaces the value in place.
    pub fn with(mut self, key: &str, value: impl Into<Bytes>) -> Self {
        self.fields.insert(key.to_owned(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.fields.get(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Value of `key` as UTF-8 text.
    pub fn text(&self, key: &str) -> Result<&str, FrameError> {
        let value = self
            .get(key)
            .ok_or_else(|| FrameError::MissingKey(key.to_owned()))?;
        std::str::from_utf8(value).map_err(|_| FrameError::NotUtf8 {
            key: key.to_owned(),
        })
    }

    /// Value of `key` parsed with [`FromStr`].
    pub fn parse<T>(&self, key: &str) -> Result<T, FrameError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let text = self.text(key)?;
        text.trim().parse().map_err(|e: T::Err| FrameError::InvalidField {
            key: key.to_owned(),
            value: text.to_owned(),
            reason: e.to_string(),
        })
    }

    pub fn class(&self) -> Result<&str, FrameError> {
        self.text(KEY_CLASS)
    }

    /// Append the wire form of this frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if !is_valid_key(key) {
                return Err(FrameError::InvalidKey(key.clone()));
            }
            if i > 0 {
                dst.put_u8(b'\n');
            }
            dst.extend_from_slice(key.as_bytes());
            dst.put_u8(b'\n');
            dst.extend_from_slice(STANDARD.encode(value).as_bytes());
        }
        Ok(())
    }

    /// Parse the complete wire form of one frame (everything up to EOF).
    pub fn decode(src: &[u8]) -> Result<Self, FrameError> {
        let mut lines: Vec<&[u8]> = src.split(|b| *b == b'\n').collect();
        // One trailing newline is tolerated; an empty final value line keeps the count even.
        if lines.len() % 2 != 0 && lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        if lines.len() % 2 != 0 {
            return Err(FrameError::OddRecord { lines: lines.len() });
        }

        let mut fields = IndexMap::with_capacity(lines.len() / 2);
        for pair in lines.chunks_exact(2) {
            let key = std::str::from_utf8(pair[0])
                .ok()
                .filter(|k| is_valid_key(k))
                .ok_or_else(|| {
                    FrameError::InvalidKey(String::from_utf8_lossy(pair[0]).into_owned())
                })?;
            let value = STANDARD
                .decode(pair[1])
                .map_err(|source| FrameError::InvalidValue {
                    key: key.to_owned(),
                    source,
                })?;
            if fields.insert(key.to_owned(), Bytes::from(value)).is_some() {
                return Err(FrameError::DuplicateKey(key.to_owned()));
            }
        }
        Ok(Self { fields })
    }
}

/// Handshake sent by the remote before any call is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hello {
    /// Tcl patchlevel of the remote interpreter.
    pub patchlevel: String,
    /// Commands known to the interpreter at startup.
    pub commands: Vec<String>,
    /// Global variable names at startup.
    pub globals: Vec<String>,
    pub nameofexecutable: String,
}

fn split_names(text: &str) -> Vec<String> {
    text.split('\n')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

impl Hello {
    fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        Ok(Self {
            patchlevel: frame.text("patchlevel")?.to_owned(),
            commands: split_names(frame.text("commands")?),
            globals: split_names(frame.text("globals")?),
            nameofexecutable: frame.text("nameofexecutable")?.to_owned(),
        })
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.iter().any(|c| c == name || c.strip_prefix("::") == Some(name))
    }
}

/// Reply to one ProcedureCall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureResult {
    /// Tcl completion code: 0 is success, anything else is an error.
    pub err_code: i32,
    pub cmd_idx: u64,
    /// Result value, or the error message when `err_code != 0`.
    pub result: String,
    /// Remote stack trace for errors, when the remote provides one.
    pub error_info: Option<String>,
}

impl ProcedureResult {
    pub fn is_error(&self) -> bool {
        self.err_code != 0
    }

    fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        let error_info = match frame.get("error_info") {
            Some(_) => Some(frame.text("error_info")?.to_owned()),
            None => None,
        };
        Ok(Self {
            err_code: frame.parse("err_code")?,
            cmd_idx: frame.parse("cmd_idx")?,
            result: frame.text("result")?.to_owned(),
            error_info,
        })
    }
}

/// Messages from controller to remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerMessage {
    ProcedureCall { command: String },
    Exit { quit: bool },
}

/// Messages from remote to controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteMessage {
    Hello(Hello),
    ProcedureResult(ProcedureResult),
}

impl RemoteMessage {
    pub fn class(&self) -> &'static str {
        match self {
            Self::Hello(_) => class::HELLO,
            Self::ProcedureResult(_) => class::PROCEDURE_RESULT,
        }
    }
}

fn parse_flag(frame: &Frame, key: &str) -> Result<bool, FrameError> {
    let text = frame.text(key)?;
    match text.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(FrameError::InvalidField {
            key: key.to_owned(),
            value: other.to_owned(),
            reason: "expected 1 or 0".to_owned(),
        }),
    }
}

impl From<ControllerMessage> for Frame {
    fn from(msg: ControllerMessage) -> Self {
        match msg {
            ControllerMessage::ProcedureCall { command } => {
                Frame::new(class::PROCEDURE_CALL).with("command", command)
            }
            ControllerMessage::Exit { quit } => {
                Frame::new(class::EXIT).with("quit", if quit { "1" } else { "0" })
            }
        }
    }
}

impl TryFrom<Frame> for ControllerMessage {
    type Error = FrameError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        match frame.class()? {
            class::PROCEDURE_CALL => Ok(Self::ProcedureCall {
                command: frame.text("command")?.to_owned(),
            }),
            class::EXIT => Ok(Self::Exit {
                quit: parse_flag(&frame, "quit")?,
            }),
            other => Err(FrameError::UnexpectedClass {
                found: other.to_owned(),
                expected: "ProcedureCall or Exit",
            }),
        }
    }
}

impl From<RemoteMessage> for Frame {
    fn from(msg: RemoteMessage) -> Self {
        match msg {
            RemoteMessage::Hello(hello) => Frame::new(class::HELLO)
                .with("patchlevel", hello.patchlevel)
                .with("commands", hello.commands.join("\n"))
                .with("globals", hello.globals.join("\n"))
                .with("nameofexecutable", hello.nameofexecutable),
            RemoteMessage::ProcedureResult(result) => {
                let frame = Frame::new(class::PROCEDURE_RESULT)
                    .with("err_code", result.err_code.to_string())
                    .with("cmd_idx", result.cmd_idx.to_string())
                    .with("result", result.result);
                match result.error_info {
                    Some(info) => frame.with("error_info", info),
                    None => frame,
                }
            }
        }
    }
}

impl TryFrom<Frame> for RemoteMessage {
    type Error = FrameError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        match frame.class()? {
            class::HELLO => Ok(Self::Hello(Hello::from_frame(&frame)?)),
            class::PROCEDURE_RESULT => Ok(Self::ProcedureResult(ProcedureResult::from_frame(
                &frame,
            )?)),
            other => Err(FrameError::UnexpectedClass {
                found: other.to_owned(),
                expected: "Hello or ProcedureResult",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(frame: &Frame) -> String {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn exit_frame_wire_form() {
        let frame = Frame::from(ControllerMessage::Exit { quit: true });
        insta::assert_snapshot!(wire(&frame), @r"
        class
        RXhpdA==
        quit
        MQ==
        ");
    }

    #[test]
    fn procedure_call_wire_form() {
        let frame = Frame::from(ControllerMessage::ProcedureCall {
            command: "expr 3 * 5".to_string(),
        });
        insta::assert_snapshot!(wire(&frame), @r"
        class
        UHJvY2VkdXJlQ2FsbA==
        command
        ZXhwciAzICogNQ==
        ");
    }

    #[test]
    fn value_bytes_survive_exactly() {
        let nasty: &[u8] = b"line one\nline two\r\n\0tail\xff\xfe\n";
        let frame = Frame::new("Test")
            .with("nasty", Bytes::from_static(nasty))
            .with("empty", Bytes::new())
            .with("newline", "\n");

        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        assert!(!buf.is_empty());

        let decoded = Frame::decode(&buf).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.get("nasty").unwrap().as_ref(), nasty);
        assert_eq!(decoded.get("empty").unwrap().as_ref(), b"");
    }

    #[test]
    fn key_order_is_preserved() {
        let frame = Frame::new("Test").with("zeta", "1").with("alpha", "2");
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        let keys: Vec<_> = Frame::decode(&buf)
            .unwrap()
            .iter()
            .map(|(k, _)| k.to_string())
            .collect();
        assert_eq!(keys, ["class", "zeta", "alpha"]);
    }

    #[test]
    fn empty_final_value_decodes() {
        // "k" with an empty value, no trailing newline
        let frame = Frame::decode(b"class\nSGVsbG8=\nk\n").unwrap();
        assert_eq!(frame.text("k").unwrap(), "");
        assert_eq!(frame.class().unwrap(), "Hello");
    }

    #[test]
    fn single_trailing_newline_is_tolerated() {
        let frame = Frame::decode(b"class\nRXhpdA==\nquit\nMA==\n").unwrap();
        assert_eq!(
            ControllerMessage::try_from(frame).unwrap(),
            ControllerMessage::Exit { quit: false }
        );
    }

    #[test]
    fn odd_record_is_rejected() {
        let err = Frame::decode(b"class\nRXhpdA==\nquit").unwrap_err();
        assert!(matches!(err, FrameError::OddRecord { lines: 3 }));
    }

    #[test]
    fn undecodable_value_is_rejected() {
        let err = Frame::decode(b"class\n!!!not base64!!!").unwrap_err();
        assert!(matches!(err, FrameError::InvalidValue { ref key, .. } if key == "class"));
    }

    #[test]
    fn invalid_key_is_rejected_both_ways() {
        assert!(matches!(
            Frame::decode(b"bad key\nMQ==").unwrap_err(),
            FrameError::InvalidKey(_)
        ));

        let mut buf = BytesMut::new();
        let err = Frame::new("Test").with("no-dashes", "x").encode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::InvalidKey(ref k) if k == "no-dashes"));
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let err = Frame::decode(b"class\nMQ==\nclass\nMA==").unwrap_err();
        assert!(matches!(err, FrameError::DuplicateKey(ref k) if k == "class"));
    }

    #[test]
    fn missing_class_is_rejected() {
        let frame = Frame::decode(b"command\nZXhwciAzICogNQ==").unwrap();
        let err = ControllerMessage::try_from(frame).unwrap_err();
        assert!(matches!(err, FrameError::MissingKey(ref k) if k == "class"));
    }

    #[test]
    fn wrong_direction_class_is_rejected() {
        let frame = Frame::from(ControllerMessage::Exit { quit: true });
        let err = RemoteMessage::try_from(frame).unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedClass { ref found, .. } if found == "Exit"));
    }

    #[test]
    fn procedure_result_parses_fields() {
        let frame = Frame::new(class::PROCEDURE_RESULT)
            .with("err_code", "1")
            .with("cmd_idx", "7")
            .with("result", "syntax error")
            .with("error_info", "while executing\n\"expr 1 +\"");
        match RemoteMessage::try_from(frame).unwrap() {
            RemoteMessage::ProcedureResult(r) => {
                assert!(r.is_error());
                assert_eq!(r.cmd_idx, 7);
                assert_eq!(r.result, "syntax error");
                assert_eq!(r.error_info.as_deref(), Some("while executing\n\"expr 1 +\""));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn procedure_result_rejects_non_numeric_index() {
        let frame = Frame::new(class::PROCEDURE_RESULT)
            .with("err_code", "0")
            .with("cmd_idx", "seven")
            .with("result", "");
        let err = RemoteMessage::try_from(frame).unwrap_err();
        assert!(matches!(err, FrameError::InvalidField { ref key, .. } if key == "cmd_idx"));
    }

    #[test]
    fn hello_splits_name_lists() {
        let frame = Frame::new(class::HELLO)
            .with("patchlevel", "8.6.13")
            .with("commands", "set\nputs\n::tcl::mathfunc::abs\n")
            .with("globals", "")
            .with("nameofexecutable", "/usr/bin/tclsh8.6");
        let RemoteMessage::Hello(hello) = RemoteMessage::try_from(frame).unwrap() else {
            panic!("expected Hello");
        };
        assert_eq!(hello.commands, ["set", "puts", "::tcl::mathfunc::abs"]);
        assert!(hello.globals.is_empty());
        assert!(hello.has_command("puts"));
        assert!(!hello.has_command("unwrap_box"));
    }

    #[test]
    fn quit_flag_rejects_garbage() {
        let frame = Frame::new(class::EXIT).with("quit", "maybe");
        assert!(matches!(
            ControllerMessage::try_from(frame).unwrap_err(),
            FrameError::InvalidField { .. }
        ));
    }
}
