/*!
error module defines the error types used across the bgpmon crate.
*/
use crate::models::{Afi, BgpMessageType, BmfType, MrtEntryType};
use num_enum::TryFromPrimitiveError;
use std::fmt::{Display, Formatter};
use std::io::ErrorKind;
use std::{error::Error, fmt, io};

/// Errors raised while decoding or encoding wire formats (BGP, MRT, BMF).
#[derive(Debug)]
pub enum ParserError {
    IoError(io::Error),
    EofError(io::Error),
    ParseError(String),
    TruncatedMsg(String),
    Unsupported(String),
}

impl Error for ParserError {}

impl Display for ParserError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ParserError::IoError(e) => write!(f, "Error: {e}"),
            ParserError::EofError(e) => write!(f, "Error: {e}"),
            ParserError::ParseError(s) => write!(f, "Error: {s}"),
            ParserError::TruncatedMsg(s) => write!(f, "Error: {s}"),
            ParserError::Unsupported(s) => write!(f, "Error: {s}"),
        }
    }
}

impl From<io::Error> for ParserError {
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            ErrorKind::UnexpectedEof => ParserError::EofError(io_error),
            _ => ParserError::IoError(io_error),
        }
    }
}

impl From<TryFromPrimitiveError<BgpMessageType>> for ParserError {
    fn from(value: TryFromPrimitiveError<BgpMessageType>) -> Self {
        ParserError::ParseError(format!("cannot parse BGP message type: {}", value.number))
    }
}

impl From<TryFromPrimitiveError<MrtEntryType>> for ParserError {
    fn from(value: TryFromPrimitiveError<MrtEntryType>) -> Self {
        ParserError::ParseError(format!("cannot parse MRT entry type: {}", value.number))
    }
}

impl From<TryFromPrimitiveError<Afi>> for ParserError {
    fn from(value: TryFromPrimitiveError<Afi>) -> Self {
        ParserError::ParseError(format!("Unknown AFI type: {}", value.number))
    }
}

impl From<TryFromPrimitiveError<BmfType>> for ParserError {
    fn from(value: TryFromPrimitiveError<BmfType>) -> Self {
        ParserError::ParseError(format!("unknown BMF record type: {}", value.number))
    }
}

/// Errors raised by the daemon side: session management, queue fabric,
/// configuration. Wire-format failures are wrapped so they can cross the
/// module boundary unchanged.
#[derive(Debug)]
pub enum MonitorError {
    Parser(ParserError),
    IoError(io::Error),
    SessionLimit,
    ConfigError(String),
}

impl Error for MonitorError {}

impl Display for MonitorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Parser(e) => write!(f, "{e}"),
            MonitorError::IoError(e) => write!(f, "Error: {e}"),
            MonitorError::SessionLimit => write!(f, "Error: session table is full"),
            MonitorError::ConfigError(s) => write!(f, "Error: {s}"),
        }
    }
}

impl From<ParserError> for MonitorError {
    fn from(error: ParserError) -> Self {
        MonitorError::Parser(error)
    }
}

impl From<io::Error> for MonitorError {
    fn from(error: io::Error) -> Self {
        MonitorError::IoError(error)
    }
}
