use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudgateError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("unsupported protocol version {version} on stream {stream_id}")]
    UnsupportedVersion { version: u8, stream_id: i16 },
}
