//! Status-line classification and the wire dialect seam.
//!
//! Every reply starts with a line of the form `NNN- message`. The three
//! digit code selects a [`ResponseType`]; the text after the dash and space
//! is the message.

use std::fmt;

use crate::constants::{GREETING, LINE_ENDING, MULTILINE_TERMINATOR};
use crate::error::{ConnectionError, Result};

/// Response type selected by a reply's status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    /// 200: the whole reply fits on the status line.
    SingleResponse,
    /// 201: greeting.
    Connected,
    /// 202: lines follow until a lone ".".
    MultiResponse,
    /// 203: binary chunks follow.
    BinaryResponse,
    /// 204: the console is waiting for binary data.
    ReadyForBinary,
    /// 205: the connection became a notification channel.
    DedicatedConnection,

    /// 400
    UnexpectedError,
    /// 401
    MaxConnectionsExceeded,
    /// 402
    FileNotFound,
    /// 403
    NoSuchModule,
    /// 404
    MemoryNotMapped,
    /// 405
    NoSuchThread,
    /// 406
    ClockNotSet,
    /// 407
    UnknownCommand,
    /// 408
    NotStopped,
    /// 409
    FileMustBeCopied,
    /// 410
    FileAlreadyExists,
    /// 411
    DirectoryNotEmpty,
    /// 412
    BadFileName,
    /// 413
    FileCannotBeCreated,
    /// 414
    AccessDenied,
    /// 415
    NoRoomOnDevice,
    /// 416
    NotDebuggable,
    /// 417
    TypeInvalid,
    /// 418
    DataNotAvailable,
    /// 420
    BoxNotLocked,
    /// 421
    KeyExchangeRequired,
    /// 422
    DedicatedConnectionRequired,
    /// 423
    InvalidArgument,
    /// 424
    ProfileNotStarted,
    /// 425
    ProfileAlreadyStarted,
    /// 426
    AlreadyStopped,

    /// Any other well-formed code.
    Other(u16),
}

impl ResponseType {
    /// Map a numeric status code.
    pub fn from_code(code: u16) -> Self {
        match code {
            200 => Self::SingleResponse,
            201 => Self::Connected,
            202 => Self::MultiResponse,
            203 => Self::BinaryResponse,
            204 => Self::ReadyForBinary,
            205 => Self::DedicatedConnection,
            400 => Self::UnexpectedError,
            401 => Self::MaxConnectionsExceeded,
            402 => Self::FileNotFound,
            403 => Self::NoSuchModule,
            404 => Self::MemoryNotMapped,
            405 => Self::NoSuchThread,
            406 => Self::ClockNotSet,
            407 => Self::UnknownCommand,
            408 => Self::NotStopped,
            409 => Self::FileMustBeCopied,
            410 => Self::FileAlreadyExists,
            411 => Self::DirectoryNotEmpty,
            412 => Self::BadFileName,
            413 => Self::FileCannotBeCreated,
            414 => Self::AccessDenied,
            415 => Self::NoRoomOnDevice,
            416 => Self::NotDebuggable,
            417 => Self::TypeInvalid,
            418 => Self::DataNotAvailable,
            420 => Self::BoxNotLocked,
            421 => Self::KeyExchangeRequired,
            422 => Self::DedicatedConnectionRequired,
            423 => Self::InvalidArgument,
            424 => Self::ProfileNotStarted,
            425 => Self::ProfileAlreadyStarted,
            426 => Self::AlreadyStopped,
            other => Self::Other(other),
        }
    }

    /// Numeric status code.
    pub fn code(self) -> u16 {
        match self {
            Self::SingleResponse => 200,
            Self::Connected => 201,
            Self::MultiResponse => 202,
            Self::BinaryResponse => 203,
            Self::ReadyForBinary => 204,
            Self::DedicatedConnection => 205,
            Self::UnexpectedError => 400,
            Self::MaxConnectionsExceeded => 401,
            Self::FileNotFound => 402,
            Self::NoSuchModule => 403,
            Self::MemoryNotMapped => 404,
            Self::NoSuchThread => 405,
            Self::ClockNotSet => 406,
            Self::UnknownCommand => 407,
            Self::NotStopped => 408,
            Self::FileMustBeCopied => 409,
            Self::FileAlreadyExists => 410,
            Self::DirectoryNotEmpty => 411,
            Self::BadFileName => 412,
            Self::FileCannotBeCreated => 413,
            Self::AccessDenied => 414,
            Self::NoRoomOnDevice => 415,
            Self::NotDebuggable => 416,
            Self::TypeInvalid => 417,
            Self::DataNotAvailable => 418,
            Self::BoxNotLocked => 420,
            Self::KeyExchangeRequired => 421,
            Self::DedicatedConnectionRequired => 422,
            Self::InvalidArgument => 423,
            Self::ProfileNotStarted => 424,
            Self::ProfileAlreadyStarted => 425,
            Self::AlreadyStopped => 426,
            Self::Other(code) => code,
        }
    }

    /// 2xx codes.
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.code())
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "Other({code})"),
            known => write!(f, "{known:?}"),
        }
    }
}

/// A classified status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Classification from the status code.
    pub kind: ResponseType,
    /// Text after `NNN- `.
    pub message: String,
    /// The full line as received.
    pub raw: String,
}

impl Response {
    /// Parse `NNN- message`.
    ///
    /// Returns `None` when the line is too short or the prefix is not a
    /// number, which is how event lines are told apart from replies.
    pub fn try_parse(line: &str) -> Option<Self> {
        if line.len() <= 4 || !line.is_char_boundary(3) {
            return None;
        }
        let code: u16 = line[..3].parse().ok()?;
        let message = line.get(5..).unwrap_or_default().to_owned();
        Some(Self {
            kind: ResponseType::from_code(code),
            message,
            raw: line.to_owned(),
        })
    }

    /// Parse `NNN- message`, failing with [`ConnectionError::MalformedResponse`].
    pub fn parse(line: &str) -> Result<Self> {
        Self::try_parse(line).ok_or_else(|| ConnectionError::MalformedResponse(line.to_owned()))
    }
}

/// Command encoding and reply classification for one protocol flavour.
///
/// A [`crate::Connection`] holds one dialect and routes every outgoing
/// command and every incoming status line through it.
pub trait WireDialect: Send + Sync + fmt::Debug {
    /// Bytes to put on the wire for `command`.
    fn encode_command(&self, command: &str) -> Vec<u8>;

    /// Classify a status line.
    fn classify(&self, line: &str) -> Result<Response>;

    /// Whether `line` is the greeting the console sends on connect.
    fn accepts_greeting(&self, line: &str) -> bool;

    /// Whether `line` ends a multi-line reply.
    fn is_terminator(&self, line: &str) -> bool;
}

/// The standard XBDM text protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct XbdmDialect;

impl WireDialect for XbdmDialect {
    fn encode_command(&self, command: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(command.len() + LINE_ENDING.len());
        bytes.extend_from_slice(command.as_bytes());
        if !command.ends_with(LINE_ENDING) {
            bytes.extend_from_slice(LINE_ENDING.as_bytes());
        }
        bytes
    }

    fn classify(&self, line: &str) -> Result<Response> {
        Response::parse(line)
    }

    fn accepts_greeting(&self, line: &str) -> bool {
        line.eq_ignore_ascii_case(GREETING)
    }

    fn is_terminator(&self, line: &str) -> bool {
        line == MULTILINE_TERMINATOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_response() {
        let response = Response::parse("200- OK").unwrap();
        assert_eq!(response.kind, ResponseType::SingleResponse);
        assert_eq!(response.message, "OK");
        assert_eq!(response.raw, "200- OK");
    }

    #[test]
    fn test_parse_negative_acks() {
        assert_eq!(Response::parse("405- no such thread").unwrap().kind, ResponseType::NoSuchThread);
        assert_eq!(Response::parse("426- already stopped").unwrap().kind, ResponseType::AlreadyStopped);
        assert_eq!(Response::parse("408- not stopped").unwrap().kind, ResponseType::NotStopped);
        assert_eq!(Response::parse("404- memory not mapped").unwrap().kind, ResponseType::MemoryNotMapped);
        assert_eq!(Response::parse("499- who knows").unwrap().kind, ResponseType::Other(499));
    }

    #[test]
    fn test_parse_rejects_short_and_non_numeric_lines() {
        assert!(Response::try_parse("200-").is_none());
        assert!(Response::try_parse("").is_none());
        assert!(Response::try_parse("break addr=0x82000000").is_none());
        assert!(matches!(
            Response::parse("hello"),
            Err(ConnectionError::MalformedResponse(line)) if line == "hello"
        ));
    }

    #[test]
    fn test_five_char_line_has_empty_message() {
        let response = Response::parse("202- ").unwrap();
        assert_eq!(response.kind, ResponseType::MultiResponse);
        assert_eq!(response.message, "");
    }

    #[test]
    fn test_code_round_trips_through_table() {
        for code in (200..=205).chain(400..=426) {
            assert_eq!(ResponseType::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_encode_command_appends_crlf_once() {
        let dialect = XbdmDialect;
        assert_eq!(dialect.encode_command("dbgname"), b"dbgname\r\n");
        assert_eq!(dialect.encode_command("dbgname\r\n"), b"dbgname\r\n");
    }

    #[test]
    fn test_greeting_is_case_insensitive() {
        let dialect = XbdmDialect;
        assert!(dialect.accepts_greeting("201- connected"));
        assert!(dialect.accepts_greeting("201- CONNECTED"));
        assert!(!dialect.accepts_greeting("201- connected!"));
        assert!(!dialect.accepts_greeting("401- max number of connections exceeded"));
    }

    #[test]
    fn test_terminator_is_exact() {
        let dialect = XbdmDialect;
        assert!(dialect.is_terminator("."));
        assert!(!dialect.is_terminator(". "));
        assert!(!dialect.is_terminator(".."));
    }
}
