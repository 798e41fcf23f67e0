use anyhow::{anyhow, Result};
use bytes::{BufMut, Bytes, BytesMut};
use cloudgate_core::CloudgateError;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LENGTH: usize = 9;
pub const MAX_BODY_LENGTH: usize = 256 * 1024 * 1024;

const RESPONSE_BIT: u8 = 0x80;
pub const FLAG_COMPRESSION: u8 = 0x01;

/// Native protocol versions whose framing the proxy understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V3,
    V4,
}

impl ProtocolVersion {
    pub fn from_byte(byte: u8) -> Result<Self, CloudgateError> {
        match byte & !RESPONSE_BIT {
            3 => Ok(ProtocolVersion::V3),
            4 => Ok(ProtocolVersion::V4),
            other => Err(CloudgateError::NotSupported(format!(
                "protocol version {other}"
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            ProtocolVersion::V3 => 3,
            ProtocolVersion::V4 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Error,
    Startup,
    Ready,
    Authenticate,
    Options,
    Supported,
    Query,
    Result,
    Prepare,
    Execute,
    Register,
    Event,
    Batch,
    AuthChallenge,
    AuthResponse,
    AuthSuccess,
}

impl OpCode {
    pub fn from_byte(byte: u8) -> Result<Self, CloudgateError> {
        Ok(match byte {
            0x00 => OpCode::Error,
            0x01 => OpCode::Startup,
            0x02 => OpCode::Ready,
            0x03 => OpCode::Authenticate,
            0x05 => OpCode::Options,
            0x06 => OpCode::Supported,
            0x07 => OpCode::Query,
            0x08 => OpCode::Result,
            0x09 => OpCode::Prepare,
            0x0A => OpCode::Execute,
            0x0B => OpCode::Register,
            0x0C => OpCode::Event,
            0x0D => OpCode::Batch,
            0x0E => OpCode::AuthChallenge,
            0x0F => OpCode::AuthResponse,
            0x10 => OpCode::AuthSuccess,
            other => {
                return Err(CloudgateError::Protocol(format!(
                    "unknown opcode 0x{other:02x}"
                )))
            }
        })
    }

    pub fn as_byte(self) -> u8 {
        match self {
            OpCode::Error => 0x00,
            OpCode::Startup => 0x01,
            OpCode::Ready => 0x02,
            OpCode::Authenticate => 0x03,
            OpCode::Options => 0x05,
            OpCode::Supported => 0x06,
            OpCode::Query => 0x07,
            OpCode::Result => 0x08,
            OpCode::Prepare => 0x09,
            OpCode::Execute => 0x0A,
            OpCode::Register => 0x0B,
            OpCode::Event => 0x0C,
            OpCode::Batch => 0x0D,
            OpCode::AuthChallenge => 0x0E,
            OpCode::AuthResponse => 0x0F,
            OpCode::AuthSuccess => 0x10,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Error => "ERROR",
            OpCode::Startup => "STARTUP",
            OpCode::Ready => "READY",
            OpCode::Authenticate => "AUTHENTICATE",
            OpCode::Options => "OPTIONS",
            OpCode::Supported => "SUPPORTED",
            OpCode::Query => "QUERY",
            OpCode::Result => "RESULT",
            OpCode::Prepare => "PREPARE",
            OpCode::Execute => "EXECUTE",
            OpCode::Register => "REGISTER",
            OpCode::Event => "EVENT",
            OpCode::Batch => "BATCH",
            OpCode::AuthChallenge => "AUTH_CHALLENGE",
            OpCode::AuthResponse => "AUTH_RESPONSE",
            OpCode::AuthSuccess => "AUTH_SUCCESS",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: ProtocolVersion,
    pub is_response: bool,
    pub flags: u8,
    pub stream_id: i16,
    pub opcode: OpCode,
}

impl FrameHeader {
    pub fn request(version: ProtocolVersion, stream_id: i16, opcode: OpCode) -> Self {
        Self {
            version,
            is_response: false,
            flags: 0,
            stream_id,
            opcode,
        }
    }

    pub fn response(version: ProtocolVersion, stream_id: i16, opcode: OpCode) -> Self {
        Self {
            is_response: true,
            ..Self::request(version, stream_id, opcode)
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSION != 0
    }

    fn version_byte(&self) -> u8 {
        if self.is_response {
            self.version.as_byte() | RESPONSE_BIT
        } else {
            self.version.as_byte()
        }
    }
}

/// A frame whose body has not been decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl RawFrame {
    pub fn new(header: FrameHeader, body: Bytes) -> Self {
        Self { header, body }
    }

    pub fn stream_id(&self) -> i16 {
        self.header.stream_id
    }

    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LENGTH + self.body.len());
        buf.put_u8(self.header.version_byte());
        buf.put_u8(self.header.flags);
        buf.put_i16(self.header.stream_id);
        buf.put_u8(self.header.opcode.as_byte());
        buf.put_u32(self.body.len() as u32);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }
}

/// Reads one frame, returning `None` on a clean end of stream. A header
/// with a version other than v3/v4 fails with
/// [`CloudgateError::UnsupportedVersion`] before the body is read.
pub async fn read_raw_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<RawFrame>> {
    let mut header = [0u8; HEADER_LENGTH];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let stream_id = i16::from_be_bytes([header[2], header[3]]);
    let version = ProtocolVersion::from_byte(header[0]).map_err(|_| {
        CloudgateError::UnsupportedVersion {
            version: header[0] & !RESPONSE_BIT,
            stream_id,
        }
    })?;
    let is_response = header[0] & RESPONSE_BIT != 0;
    let flags = header[1];
    let opcode = OpCode::from_byte(header[4])?;
    let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if length > MAX_BODY_LENGTH {
        return Err(anyhow!("frame body of {length} bytes exceeds limit"));
    }
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    Ok(Some(RawFrame {
        header: FrameHeader {
            version,
            is_response,
            flags,
            stream_id,
            opcode,
        },
        body: Bytes::from(body),
    }))
}

pub async fn write_raw_frame<S: AsyncWrite + Unpin>(stream: &mut S, frame: &RawFrame) -> Result<()> {
    stream.write_all(&frame.to_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
