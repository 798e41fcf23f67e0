use crate::frame::OpCode;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use cloudgate_core::CloudgateError;

pub const ERROR_SERVER: i32 = 0x0000;
pub const ERROR_PROTOCOL: i32 = 0x000A;
pub const ERROR_AUTHENTICATION: i32 = 0x0100;
pub const ERROR_UNPREPARED: i32 = 0x2500;

pub const RESULT_KIND_PREPARED: i32 = 0x0004;

/// Decoded body of a CQL frame. Only the messages the proxy has to look
/// into are decoded, everything else stays raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Startup { options: Vec<(String, String)> },
    Ready,
    Authenticate { authenticator: String },
    AuthChallenge { token: Option<Bytes> },
    AuthResponse { token: Option<Bytes> },
    AuthSuccess { token: Option<Bytes> },
    Error(ErrorMessage),
    Query { query: String, parameters: Bytes },
    Prepare { query: String, parameters: Bytes },
    Execute { id: Bytes, parameters: Bytes },
    Result(ResultMessage),
    Other { opcode: OpCode, body: Bytes },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub code: i32,
    pub message: String,
    /// Code specific payload following the message string.
    pub details: Bytes,
}

impl ErrorMessage {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Bytes::new(),
        }
    }

    pub fn unprepared(message: impl Into<String>, id: &[u8]) -> Result<Self, CloudgateError> {
        let mut details = BytesMut::new();
        put_short_bytes(&mut details, id)?;
        Ok(Self {
            code: ERROR_UNPREPARED,
            message: message.into(),
            details: details.freeze(),
        })
    }

    pub fn is_authentication_error(&self) -> bool {
        self.code == ERROR_AUTHENTICATION
    }

    pub fn unprepared_id(&self) -> Option<Bytes> {
        if self.code != ERROR_UNPREPARED {
            return None;
        }
        let mut details = self.details.clone();
        get_short_bytes(&mut details).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultMessage {
    Prepared { id: Bytes, metadata: Bytes },
    Other { kind: i32, body: Bytes },
}

impl Message {
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Startup { .. } => OpCode::Startup,
            Message::Ready => OpCode::Ready,
            Message::Authenticate { .. } => OpCode::Authenticate,
            Message::AuthChallenge { .. } => OpCode::AuthChallenge,
            Message::AuthResponse { .. } => OpCode::AuthResponse,
            Message::AuthSuccess { .. } => OpCode::AuthSuccess,
            Message::Error(_) => OpCode::Error,
            Message::Query { .. } => OpCode::Query,
            Message::Prepare { .. } => OpCode::Prepare,
            Message::Execute { .. } => OpCode::Execute,
            Message::Result(_) => OpCode::Result,
            Message::Other { opcode, .. } => *opcode,
        }
    }

    pub fn decode(opcode: OpCode, body: Bytes) -> Result<Self, CloudgateError> {
        let mut buf = body.clone();
        let message = match opcode {
            OpCode::Startup => Message::Startup {
                options: get_string_map(&mut buf)?,
            },
            OpCode::Ready => Message::Ready,
            OpCode::Authenticate => Message::Authenticate {
                authenticator: get_string(&mut buf)?,
            },
            OpCode::AuthChallenge => Message::AuthChallenge {
                token: get_bytes(&mut buf)?,
            },
            OpCode::AuthResponse => Message::AuthResponse {
                token: get_bytes(&mut buf)?,
            },
            OpCode::AuthSuccess => Message::AuthSuccess {
                token: get_bytes(&mut buf)?,
            },
            OpCode::Error => {
                let code = get_i32(&mut buf)?;
                let message = get_string(&mut buf)?;
                Message::Error(ErrorMessage {
                    code,
                    message,
                    details: buf,
                })
            }
            OpCode::Query => Message::Query {
                query: get_long_string(&mut buf)?,
                parameters: buf,
            },
            OpCode::Prepare => Message::Prepare {
                query: get_long_string(&mut buf)?,
                parameters: buf,
            },
            OpCode::Execute => Message::Execute {
                id: get_short_bytes(&mut buf)?,
                parameters: buf,
            },
            OpCode::Result => {
                let kind = get_i32(&mut buf)?;
                if kind == RESULT_KIND_PREPARED {
                    Message::Result(ResultMessage::Prepared {
                        id: get_short_bytes(&mut buf)?,
                        metadata: buf,
                    })
                } else {
                    Message::Result(ResultMessage::Other { kind, body: buf })
                }
            }
            other => Message::Other { opcode: other, body },
        };
        Ok(message)
    }

    /// Serializes the body. Fails when a value is too long for its CQL
    /// length prefix.
    pub fn encode(&self) -> Result<Bytes, CloudgateError> {
        let mut buf = BytesMut::new();
        match self {
            Message::Startup { options } => put_string_map(&mut buf, options)?,
            Message::Ready => {}
            Message::Authenticate { authenticator } => put_string(&mut buf, authenticator)?,
            Message::AuthChallenge { token }
            | Message::AuthResponse { token }
            | Message::AuthSuccess { token } => put_bytes(&mut buf, token.as_deref())?,
            Message::Error(error) => {
                buf.put_i32(error.code);
                put_string(&mut buf, &error.message)?;
                buf.extend_from_slice(&error.details);
            }
            Message::Query { query, parameters } | Message::Prepare { query, parameters } => {
                put_long_string(&mut buf, query)?;
                buf.extend_from_slice(parameters);
            }
            Message::Execute { id, parameters } => {
                put_short_bytes(&mut buf, id)?;
                buf.extend_from_slice(parameters);
            }
            Message::Result(ResultMessage::Prepared { id, metadata }) => {
                buf.put_i32(RESULT_KIND_PREPARED);
                put_short_bytes(&mut buf, id)?;
                buf.extend_from_slice(metadata);
            }
            Message::Result(ResultMessage::Other { kind, body }) => {
                buf.put_i32(*kind);
                buf.extend_from_slice(body);
            }
            Message::Other { body, .. } => buf.extend_from_slice(body),
        }
        Ok(buf.freeze())
    }
}

fn truncated(what: &str) -> CloudgateError {
    CloudgateError::Protocol(format!("truncated {what}"))
}

fn get_i32(buf: &mut Bytes) -> Result<i32, CloudgateError> {
    if buf.remaining() < 4 {
        return Err(truncated("int"));
    }
    Ok(buf.get_i32())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, CloudgateError> {
    if buf.remaining() < 2 {
        return Err(truncated("short"));
    }
    Ok(buf.get_u16())
}

fn take(buf: &mut Bytes, len: usize, what: &str) -> Result<Bytes, CloudgateError> {
    if buf.remaining() < len {
        return Err(truncated(what));
    }
    Ok(buf.split_to(len))
}

fn utf8(raw: Bytes) -> Result<String, CloudgateError> {
    String::from_utf8(raw.to_vec())
        .map_err(|err| CloudgateError::Protocol(format!("invalid utf-8 string: {err}")))
}

pub fn get_string(buf: &mut Bytes) -> Result<String, CloudgateError> {
    let len = get_u16(buf)? as usize;
    utf8(take(buf, len, "string")?)
}

pub fn get_long_string(buf: &mut Bytes) -> Result<String, CloudgateError> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Err(CloudgateError::Protocol("negative long string length".into()));
    }
    utf8(take(buf, len as usize, "long string")?)
}

pub fn get_bytes(buf: &mut Bytes) -> Result<Option<Bytes>, CloudgateError> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    take(buf, len as usize, "bytes").map(Some)
}

pub fn get_short_bytes(buf: &mut Bytes) -> Result<Bytes, CloudgateError> {
    let len = get_u16(buf)? as usize;
    take(buf, len, "short bytes")
}

fn get_string_map(buf: &mut Bytes) -> Result<Vec<(String, String)>, CloudgateError> {
    let count = get_u16(buf)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = get_string(buf)?;
        let value = get_string(buf)?;
        entries.push((key, value));
    }
    Ok(entries)
}

fn length<T: TryFrom<usize>>(len: usize, what: &str) -> Result<T, CloudgateError> {
    T::try_from(len).map_err(|_| {
        CloudgateError::Protocol(format!("{what} of {len} bytes does not fit its length prefix"))
    })
}

pub fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), CloudgateError> {
    buf.put_u16(length(value.len(), "string")?);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

pub fn put_long_string(buf: &mut BytesMut, value: &str) -> Result<(), CloudgateError> {
    buf.put_i32(length(value.len(), "long string")?);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

pub fn put_bytes(buf: &mut BytesMut, value: Option<&[u8]>) -> Result<(), CloudgateError> {
    match value {
        Some(v) => {
            buf.put_i32(length(v.len(), "bytes")?);
            buf.extend_from_slice(v);
        }
        None => buf.put_i32(-1),
    }
    Ok(())
}

pub fn put_short_bytes(buf: &mut BytesMut, value: &[u8]) -> Result<(), CloudgateError> {
    buf.put_u16(length(value.len(), "short bytes")?);
    buf.extend_from_slice(value);
    Ok(())
}

fn put_string_map(buf: &mut BytesMut, entries: &[(String, String)]) -> Result<(), CloudgateError> {
    buf.put_u16(length(entries.len(), "string map")?);
    for (key, value) in entries {
        put_string(buf, key)?;
        put_string(buf, value)?;
    }
    Ok(())
}
