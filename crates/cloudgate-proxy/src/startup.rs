use crate::auth::Authenticator;
use crate::forwarder::RequestForwarder;
use cloudgate_core::{CloudgateError, ForwardDecision};
use cloudgate_protocol::{ErrorMessage, Frame, FrameCodec, Message, OpCode, RawFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Upper bound on AUTH_RESPONSE rounds sent to the target per handshake.
pub const MAX_AUTH_ROUNDS: usize = 5;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("proxy is shutting down")]
    Shutdown,
    #[error("authentication error: {}", .0.message)]
    Authentication(ErrorMessage),
    #[error("target requested authentication but no target credentials are configured")]
    MissingTargetCredentials,
    #[error(
        "received {opcode} from target {target} during handshake, expected READY, AUTHENTICATE, \
         AUTH_CHALLENGE or AUTH_SUCCESS"
    )]
    UnexpectedResponse { opcode: OpCode, target: SocketAddr },
    #[error("reached max number of attempts ({rounds}) to complete target cluster handshake")]
    AttemptsExhausted { rounds: usize },
    #[error("could not decode handshake frame from {target}: {source}")]
    Decode {
        target: SocketAddr,
        #[source]
        source: CloudgateError,
    },
    #[error("could not perform handshake step: {0}")]
    AuthStep(#[source] CloudgateError),
    #[error("unable to send handshake frame from {client} to {target}: {reason}")]
    Transmission {
        client: SocketAddr,
        target: SocketAddr,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakePhase {
    /// The STARTUP pair exchanged before the orchestrator ran is examined.
    Initial,
    /// An AUTH_RESPONSE has to be sent for the last AUTHENTICATE or
    /// AUTH_CHALLENGE.
    AwaitingAuthResponse,
}

enum Transition {
    Complete,
    Continue(HandshakePhase),
    Reject,
}

fn next_phase(phase: HandshakePhase, opcode: OpCode) -> Transition {
    match (phase, opcode) {
        (_, OpCode::Ready) | (_, OpCode::AuthSuccess) => Transition::Complete,
        (_, OpCode::Authenticate) | (_, OpCode::AuthChallenge) => {
            Transition::Continue(HandshakePhase::AwaitingAuthResponse)
        }
        _ => Transition::Reject,
    }
}

struct HandshakeState {
    phase: HandshakePhase,
    rounds: usize,
}

/// Completes the handshake of a proxy-to-target connection on behalf of a
/// client whose STARTUP has already been sent to the target.
pub struct HandshakeOrchestrator {
    codec: Arc<dyn FrameCodec>,
    forwarder: Arc<dyn RequestForwarder>,
    authenticator: Option<Arc<dyn Authenticator>>,
    cancel: CancellationToken,
    client_addr: SocketAddr,
    target_addr: SocketAddr,
    max_auth_rounds: usize,
}

impl HandshakeOrchestrator {
    pub fn new(
        codec: Arc<dyn FrameCodec>,
        forwarder: Arc<dyn RequestForwarder>,
        authenticator: Option<Arc<dyn Authenticator>>,
        cancel: CancellationToken,
        client_addr: SocketAddr,
        target_addr: SocketAddr,
    ) -> Self {
        Self {
            codec,
            forwarder,
            authenticator,
            cancel,
            client_addr,
            target_addr,
            max_auth_rounds: MAX_AUTH_ROUNDS,
        }
    }

    pub fn with_max_auth_rounds(mut self, max_auth_rounds: usize) -> Self {
        self.max_auth_rounds = max_auth_rounds;
        self
    }

    pub async fn run(
        &self,
        startup_request: &RawFrame,
        startup_response: RawFrame,
    ) -> Result<(), HandshakeError> {
        info!(
            "initiating target handshake between {} and {}",
            self.client_addr, self.target_addr
        );
        let version = startup_request.header.version;
        let stream_id = startup_request.header.stream_id;
        let mut state = HandshakeState {
            phase: HandshakePhase::Initial,
            rounds: 0,
        };
        let mut response = startup_response;

        loop {
            let frame = self
                .codec
                .decode(&response)
                .map_err(|source| HandshakeError::Decode {
                    target: self.target_addr,
                    source,
                })?;
            match next_phase(state.phase, frame.header.opcode) {
                Transition::Complete => {
                    self.log_completion(frame.header.opcode, state.rounds);
                    return Ok(());
                }
                Transition::Continue(phase) => {
                    debug!(
                        "received {} for target handshake in phase {:?}",
                        frame.header.opcode, state.phase
                    );
                    state.phase = phase;
                }
                Transition::Reject => return Err(self.rejection(frame)),
            }

            let authenticator = self
                .authenticator
                .as_ref()
                .ok_or(HandshakeError::MissingTargetCredentials)?;
            if state.rounds >= self.max_auth_rounds {
                return Err(HandshakeError::AttemptsExhausted {
                    rounds: state.rounds,
                });
            }
            state.rounds += 1;

            let request = authenticator
                .next_request(version, stream_id, &frame)
                .map_err(HandshakeError::AuthStep)?;
            let request = self
                .codec
                .encode(&request)
                .map_err(HandshakeError::AuthStep)?;
            response = self.send_round(request).await?;
        }
    }

    async fn send_round(&self, request: RawFrame) -> Result<RawFrame, HandshakeError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.forwarder
            .submit(request, ForwardDecision::Target, Instant::now(), response_tx)
            .map_err(|err| self.transmission(err.to_string()))?;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HandshakeError::Shutdown),
            received = response_rx => match received {
                Ok(response) => Ok(response.aggregated_response),
                Err(_) if self.cancel.is_cancelled() => Err(HandshakeError::Shutdown),
                Err(_) => Err(self.transmission("response channel closed without a response".into())),
            },
        }
    }

    fn rejection(&self, frame: Frame) -> HandshakeError {
        match frame.message {
            Message::Error(error) if error.is_authentication_error() => {
                HandshakeError::Authentication(error)
            }
            _ => HandshakeError::UnexpectedResponse {
                opcode: frame.header.opcode,
                target: self.target_addr,
            },
        }
    }

    fn transmission(&self, reason: String) -> HandshakeError {
        HandshakeError::Transmission {
            client: self.client_addr,
            target: self.target_addr,
            reason,
        }
    }

    fn log_completion(&self, opcode: OpCode, rounds: usize) {
        if opcode == OpCode::Ready {
            debug!(
                "target cluster {} did not request authentication for client {}",
                self.target_addr, self.client_addr
            );
        } else {
            debug!(
                "{} authenticated with target {} after {} round(s)",
                self.client_addr, self.target_addr, rounds
            );
        }
    }
}
