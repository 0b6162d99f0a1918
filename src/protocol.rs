//! The request/response types exchanged between client and server, and the
//! binary wire codec that carries them.
//!
//! Every message travels as one length-prefixed frame:
//!
//! ```text
//! Frame    := u64 payload_len , payload[payload_len]
//! Request  := u8  operation , String key , String value
//! Response := u8  operation , u8 error , String value
//! String   := u16 len , bytes[len]
//! ```
//!
//! All multi-byte integers, the outer length prefix included, are big-endian.

use crate::{KvdError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

/// the maximum number of bytes in a key
pub const MAX_KEY_LENGTH: usize = 1024;

/// the maximum number of bytes in a value
pub const MAX_VALUE_LENGTH: usize = 1024 * 1024;

/// the longest string the 16-bit wire length field can carry
pub const MAX_WIRE_STRING: usize = u16::MAX as usize;

/// upper bound on a frame's payload length. A request with two maximum-length
/// strings is the largest message either side may send.
pub const MAX_FRAME_LEN: u64 = (1 + 1 + 2 * (2 + MAX_WIRE_STRING)) as u64;

/// The operations supported by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    /// insert key:value
    Insert = 0,
    /// update key:value
    Update = 1,
    /// delete key
    Delete = 2,
    /// get value using key
    Get = 3,
}

impl Operation {
    /// every operation, in wire-tag order
    pub const ALL: [Operation; 4] = [
        Operation::Insert,
        Operation::Update,
        Operation::Delete,
        Operation::Get,
    ];

    /// maps a wire tag byte back to an `Operation`
    pub fn from_u8(tag: u8) -> Option<Operation> {
        match tag {
            0 => Some(Operation::Insert),
            1 => Some(Operation::Update),
            2 => Some(Operation::Delete),
            3 => Some(Operation::Get),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Get => "GET",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Operation {
    type Err = KvdError;

    /// accepts the numeric tag, the single-letter shorthand, or the full word
    fn from_str(s: &str) -> Result<Operation> {
        match s {
            "0" | "I" | "INSERT" => Ok(Operation::Insert),
            "1" | "U" | "UPDATE" => Ok(Operation::Update),
            "2" | "D" | "DELETE" => Ok(Operation::Delete),
            "3" | "G" | "GET" => Ok(Operation::Get),
            _ => Err(KvdError::Parsing(format!(
                "unrecognized operation: {}, expected one of \
                 [0|I|INSERT, 1|U|UPDATE, 2|D|DELETE, 3|G|GET]",
                s
            ))),
        }
    }
}

/// The outcome of an operation, carried in every [`Response`].
///
/// Anything other than [`ErrorCode::None`] is a protocol-level error: the
/// request was understood and refused, and the connection stays usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// the operation succeeded
    None = 0,
    /// attempt to INSERT a key which already exists
    InsertKeyAlreadyExists = 1,
    /// attempt to UPDATE a key which doesn't exist
    UpdateKeyNotFound = 2,
    /// attempt to UPDATE a key to the same value
    UpdateValueAlreadyExists = 3,
    /// attempt to DELETE a key which doesn't exist
    DeleteKeyNotFound = 4,
    /// attempt to GET a value from a key which doesn't exist
    GetKeyNotFound = 5,
    /// a key exceeded the maximum key length
    InvalidKeyLength = 6,
    /// a value exceeded the maximum value length
    InvalidValueLength = 7,
}

impl ErrorCode {
    /// maps a wire tag byte back to an `ErrorCode`
    pub fn from_u8(tag: u8) -> Option<ErrorCode> {
        match tag {
            0 => Some(ErrorCode::None),
            1 => Some(ErrorCode::InsertKeyAlreadyExists),
            2 => Some(ErrorCode::UpdateKeyNotFound),
            3 => Some(ErrorCode::UpdateValueAlreadyExists),
            4 => Some(ErrorCode::DeleteKeyNotFound),
            5 => Some(ErrorCode::GetKeyNotFound),
            6 => Some(ErrorCode::InvalidKeyLength),
            7 => Some(ErrorCode::InvalidValueLength),
            _ => None,
        }
    }

    /// true when the code reports success
    pub fn is_none(self) -> bool {
        self == ErrorCode::None
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::None => "NONE",
            ErrorCode::InsertKeyAlreadyExists => "INSERT KEY ALREADY EXISTS",
            ErrorCode::UpdateKeyNotFound => "UPDATE KEY NOT FOUND",
            ErrorCode::UpdateValueAlreadyExists => "UPDATE VALUE ALREADY EXISTS",
            ErrorCode::DeleteKeyNotFound => "DELETE KEY NOT FOUND",
            ErrorCode::GetKeyNotFound => "GET KEY NOT FOUND",
            ErrorCode::InvalidKeyLength => "INVALID KEY LENGTH",
            ErrorCode::InvalidValueLength => "INVALID VALUE LENGTH",
        };
        write!(f, "{}", text)
    }
}

/// A request as sent by a client.
///
/// For [`Operation::Delete`] and [`Operation::Get`] the `value` field is sent
/// empty; receivers ignore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// the operation to perform
    pub operation: Operation,
    /// the key the operation applies to
    pub key: String,
    /// the value for INSERT and UPDATE, empty otherwise
    pub value: String,
}

impl Request {
    /// serializes this request into a frame payload
    ///
    /// # Errors
    /// returns [`KvdError::InvalidKeyLength`] / [`KvdError::InvalidValueLength`]
    /// when a string does not fit the 16-bit wire length field
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(1 + 2 + self.key.len() + 2 + self.value.len());
        buf.put_u8(self.operation as u8);
        put_string(&mut buf, &self.key, StringField::Key)?;
        put_string(&mut buf, &self.value, StringField::Value)?;
        Ok(buf.to_vec())
    }

    /// deserializes a request from a frame payload, consuming it exactly
    pub fn decode(payload: &[u8]) -> Result<Request> {
        let mut buf = payload;
        let tag = get_u8(&mut buf)?;
        let operation = Operation::from_u8(tag).ok_or(KvdError::InvalidOperation(tag))?;
        let key = get_string(&mut buf)?;
        let value = get_string(&mut buf)?;
        if buf.has_remaining() {
            return Err(KvdError::TrailingBytes(buf.remaining()));
        }
        Ok(Request {
            operation,
            key,
            value,
        })
    }
}

/// A response as sent by the server.
///
/// `value` carries the fetched payload only for a successful
/// [`Operation::Get`]; in every other case it is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// the operation this response answers
    pub operation: Operation,
    /// the outcome of the operation
    pub error: ErrorCode,
    /// the fetched value for a successful GET, empty otherwise
    pub value: String,
}

impl Response {
    /// serializes this response into a frame payload
    ///
    /// # Errors
    /// returns [`KvdError::InvalidValueLength`] when the value does not fit
    /// the 16-bit wire length field
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(1 + 1 + 2 + self.value.len());
        buf.put_u8(self.operation as u8);
        buf.put_u8(self.error as u8);
        put_string(&mut buf, &self.value, StringField::Value)?;
        Ok(buf.to_vec())
    }

    /// deserializes a response from a frame payload, consuming it exactly
    pub fn decode(payload: &[u8]) -> Result<Response> {
        let mut buf = payload;
        let tag = get_u8(&mut buf)?;
        let operation = Operation::from_u8(tag).ok_or(KvdError::InvalidOperation(tag))?;
        let tag = get_u8(&mut buf)?;
        let error = ErrorCode::from_u8(tag).ok_or(KvdError::InvalidErrorCode(tag))?;
        let value = get_string(&mut buf)?;
        if buf.has_remaining() {
            return Err(KvdError::TrailingBytes(buf.remaining()));
        }
        Ok(Response {
            operation,
            error,
            value,
        })
    }
}

/// which message field a string belongs to, for error reporting
#[derive(Clone, Copy)]
enum StringField {
    Key,
    Value,
}

fn put_string(buf: &mut BytesMut, s: &str, field: StringField) -> Result<()> {
    if s.len() > MAX_WIRE_STRING {
        return Err(match field {
            StringField::Key => KvdError::InvalidKeyLength(s.len()),
            StringField::Value => KvdError::InvalidValueLength(s.len()),
        });
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(KvdError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(KvdError::Truncated);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(KvdError::Truncated);
    }
    let bytes = buf.copy_to_bytes(len);
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// writes one frame: the 8-byte big-endian length prefix, then the payload
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_all(&(payload.len() as u64).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// reads one frame and returns its payload.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly, i.e. EOF
/// arrived on a frame boundary. EOF in the middle of a frame is an error.
///
/// # Errors
/// returns [`KvdError::FrameTooLarge`] when the length prefix announces more
/// bytes than any valid message can hold, so that a corrupt prefix cannot
/// trigger an unbounded allocation
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 8];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(KvdError::Truncated);
        }
        filled += n;
    }

    let len = u64::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(KvdError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}
