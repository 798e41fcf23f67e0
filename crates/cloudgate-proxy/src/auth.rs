use bytes::{BufMut, Bytes, BytesMut};
use cloudgate_core::CloudgateError;
use cloudgate_protocol::{Frame, Message, ProtocolVersion};
use std::fmt;
use tracing::warn;

pub const DSE_AUTHENTICATOR: &str = "com.datastax.bdp.cassandra.auth.DseAuthenticator";
pub const PASSWORD_AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

const PLAIN_MECHANISM: &[u8] = b"PLAIN";
const PLAIN_START_CHALLENGE: &[u8] = b"PLAIN-START";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// SASL PLAIN token: empty authorization id, username, password, each
    /// separated by a NUL byte.
    pub fn plain_token(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.username.len() + self.password.len() + 2);
        buf.put_u8(0);
        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(self.password.as_bytes());
        buf.freeze()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Builds the next AUTH_RESPONSE of a handshake from the frame the server
/// sent last. Implementations keep no state between calls.
pub trait Authenticator: Send + Sync {
    fn next_request(
        &self,
        version: ProtocolVersion,
        stream_id: i16,
        previous: &Frame,
    ) -> Result<Frame, CloudgateError>;
}

#[derive(Debug, Clone)]
pub struct PlainTextAuthenticator {
    credentials: Credentials,
}

impl PlainTextAuthenticator {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    fn initial_response(&self, authenticator: &str) -> Bytes {
        match authenticator {
            DSE_AUTHENTICATOR => Bytes::from_static(PLAIN_MECHANISM),
            PASSWORD_AUTHENTICATOR => self.credentials.plain_token(),
            other => {
                warn!("unknown authenticator {other}, sending plain text credentials");
                self.credentials.plain_token()
            }
        }
    }

    fn evaluate_challenge(&self, challenge: Option<&[u8]>) -> Result<Bytes, CloudgateError> {
        match challenge {
            Some(PLAIN_START_CHALLENGE) => Ok(self.credentials.plain_token()),
            Some(other) => Err(CloudgateError::Protocol(format!(
                "unsupported authentication challenge {:?}",
                String::from_utf8_lossy(other)
            ))),
            None => Err(CloudgateError::Protocol(
                "authentication challenge carried no token".into(),
            )),
        }
    }
}

impl Authenticator for PlainTextAuthenticator {
    fn next_request(
        &self,
        version: ProtocolVersion,
        stream_id: i16,
        previous: &Frame,
    ) -> Result<Frame, CloudgateError> {
        let token = match &previous.message {
            Message::Authenticate { authenticator } => self.initial_response(authenticator),
            Message::AuthChallenge { token } => self.evaluate_challenge(token.as_deref())?,
            other => {
                return Err(CloudgateError::Protocol(format!(
                    "expected AUTHENTICATE or AUTH_CHALLENGE, got {}",
                    other.opcode()
                )))
            }
        };
        Ok(Frame::request(
            version,
            stream_id,
            Message::AuthResponse { token: Some(token) },
        ))
    }
}
