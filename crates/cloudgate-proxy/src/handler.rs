use crate::auth::{Authenticator, Credentials, PlainTextAuthenticator};
use crate::connector::ClusterConnector;
use crate::forwarder::{ForwardedResponse, RequestForwarder};
use crate::startup::{HandshakeError, HandshakeOrchestrator};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use cloudgate_core::{
    CloudgateError, ClusterType, ForwardDecision, PreparedStatementCache, PreparedStatementInfo,
};
use cloudgate_protocol::messages::{ERROR_AUTHENTICATION, ERROR_PROTOCOL, ERROR_SERVER};
use cloudgate_protocol::{
    read_raw_frame, write_raw_frame, ErrorMessage, Frame, FrameCodec, Message, OpCode,
    ProtocolVersion, RawFrame, ResultMessage,
};
use metrics::{counter, histogram};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CLIENT_QUEUE_CAPACITY: usize = 1024;
const COMPRESSION_OPTION: &str = "COMPRESSION";

/// Everything a client connection needs from the proxy process.
#[derive(Clone)]
pub struct ProxySettings {
    pub origin_contact_point: String,
    pub target_contact_point: String,
    pub target_credentials: Option<Credentials>,
    pub max_auth_rounds: usize,
}

/// Picks the clusters a request goes to from its statement text. Reads are
/// served by origin alone, everything else is applied to both clusters.
pub fn decision_for_statement(query: &str) -> ForwardDecision {
    let first_word = query
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default();
    if first_word.eq_ignore_ascii_case("select") {
        ForwardDecision::Origin
    } else {
        ForwardDecision::Both
    }
}

/// Sends requests to the cluster connections of one client connection.
#[derive(Clone)]
pub struct Dispatcher {
    origin: Arc<ClusterConnector>,
    target: Arc<ClusterConnector>,
    cache: Arc<PreparedStatementCache>,
    codec: Arc<dyn FrameCodec>,
    connection: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        origin: Arc<ClusterConnector>,
        target: Arc<ClusterConnector>,
        cache: Arc<PreparedStatementCache>,
        codec: Arc<dyn FrameCodec>,
        connection: CancellationToken,
    ) -> Self {
        Self {
            origin,
            target,
            cache,
            codec,
            connection,
        }
    }

    async fn send_to(&self, cluster: ClusterType, request: RawFrame) -> Result<RawFrame, CloudgateError> {
        let connector = match cluster {
            ClusterType::Origin => &self.origin,
            ClusterType::Target => &self.target,
        };
        let response_rx = connector.send(request).await?;
        tokio::select! {
            biased;
            _ = self.connection.cancelled() => Err(CloudgateError::Connection("client connection is closing".into())),
            received = response_rx => received.map_err(|_| {
                CloudgateError::Connection(format!(
                    "{} cluster {} closed before responding",
                    connector.cluster(),
                    connector.remote_addr()
                ))
            }),
        }
    }

    async fn send_to_both(
        &self,
        origin_request: RawFrame,
        target_request: RawFrame,
    ) -> Result<(RawFrame, RawFrame), CloudgateError> {
        tokio::try_join!(
            self.send_to(ClusterType::Origin, origin_request),
            self.send_to(ClusterType::Target, target_request)
        )
    }

    async fn dispatch(&self, request: RawFrame, decision: ForwardDecision) -> Result<RawFrame, CloudgateError> {
        match decision {
            ForwardDecision::Origin => self.send_to(ClusterType::Origin, request).await,
            ForwardDecision::Target => self.send_to(ClusterType::Target, request).await,
            ForwardDecision::Both => {
                let (origin, target) = self.send_to_both(request.clone(), request).await?;
                Ok(self.aggregate(origin, target))
            }
        }
    }

    /// Chooses the response the client sees for a request both clusters
    /// executed. A target failure is surfaced only when origin succeeded.
    pub fn aggregate(&self, origin: RawFrame, target: RawFrame) -> RawFrame {
        if target.opcode() == OpCode::Error && origin.opcode() != OpCode::Error {
            warn!("target failed a request origin completed, returning target error to client");
            return self.translate_target_error(target);
        }
        origin
    }

    /// Rewrites an UNPREPARED error from target so it names the id the
    /// client knows.
    pub fn translate_target_error(&self, response: RawFrame) -> RawFrame {
        let Ok(mut frame) = self.codec.decode(&response) else {
            return response;
        };
        let Message::Error(error) = &mut frame.message else {
            return response;
        };
        let Some(target_id) = error.unprepared_id() else {
            return response;
        };
        let Some(entry) = self.cache.get_by_target_prepared_id(&target_id) else {
            debug!(
                "target reported unknown prepared id {} with no cached origin id",
                hex::encode(&target_id)
            );
            return response;
        };
        *error = match ErrorMessage::unprepared(error.message.clone(), entry.origin_id()) {
            Ok(translated) => translated,
            Err(err) => {
                error!("could not rebuild unprepared error for origin id: {err}");
                return response;
            }
        };
        match self.codec.encode(&frame) {
            Ok(translated) => translated,
            Err(err) => {
                error!("could not re-encode translated unprepared error: {err}");
                response
            }
        }
    }
}

impl RequestForwarder for Dispatcher {
    fn submit(
        &self,
        request: RawFrame,
        decision: ForwardDecision,
        start_time: Instant,
        response_tx: oneshot::Sender<ForwardedResponse>,
    ) -> Result<(), CloudgateError> {
        if self.connection.is_cancelled() {
            return Err(CloudgateError::Connection("client connection is closing".into()));
        }
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let stream_id = request.stream_id();
            let result = dispatcher.dispatch(request, decision).await;
            histogram!("proxy_request_duration_seconds", "decision" => decision.as_str())
                .record(start_time.elapsed().as_secs_f64());
            match result {
                Ok(aggregated_response) => {
                    let _ = response_tx.send(ForwardedResponse { aggregated_response });
                }
                Err(err) => {
                    warn!("request on stream {stream_id} to {} failed: {err}", decision.as_str());
                }
            }
        });
        Ok(())
    }
}

/// Proxies one client connection.
pub struct ClientHandler {
    client_addr: SocketAddr,
    dispatcher: Dispatcher,
    cache: Arc<PreparedStatementCache>,
    codec: Arc<dyn FrameCodec>,
    settings: ProxySettings,
    target_addr: SocketAddr,
    client_tx: mpsc::Sender<RawFrame>,
    connection: CancellationToken,
}

impl ClientHandler {
    /// Connects to both clusters and proxies `stream` until either side
    /// goes away or `shutdown` fires.
    pub async fn serve<S>(
        stream: S,
        client_addr: SocketAddr,
        settings: ProxySettings,
        cache: Arc<PreparedStatementCache>,
        codec: Arc<dyn FrameCodec>,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = shutdown.child_token();
        let (client_tx, client_rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let origin = ClusterConnector::connect(
            ClusterType::Origin,
            &settings.origin_contact_point,
            Some(client_tx.clone()),
            connection.clone(),
        )
        .await?;
        let target = match ClusterConnector::connect(
            ClusterType::Target,
            &settings.target_contact_point,
            None,
            connection.clone(),
        )
        .await
        {
            Ok(target) => target,
            Err(err) => {
                connection.cancel();
                return Err(err.into());
            }
        };

        let handler = Arc::new(Self {
            client_addr,
            target_addr: target.remote_addr(),
            dispatcher: Dispatcher::new(origin, target, cache.clone(), codec.clone(), connection.clone()),
            cache,
            codec,
            settings,
            client_tx,
            connection: connection.clone(),
        });

        let (reader, writer) = tokio::io::split(stream);
        let writer_task = tokio::spawn(client_write_loop(writer, client_rx, connection.clone()));
        handler.clone().client_read_loop(reader).await;
        connection.cancel();
        let _ = writer_task.await;
        info!("client connection {client_addr} closed");
        Ok(())
    }

    async fn client_read_loop<R: AsyncRead + Unpin>(self: Arc<Self>, reader: R) {
        let mut reader = BufReader::new(reader);
        loop {
            let read = tokio::select! {
                biased;
                _ = self.connection.cancelled() => break,
                read = read_raw_frame(&mut reader) => read,
            };
            let request = match read {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(err) => {
                    if let Some(&CloudgateError::UnsupportedVersion { version, stream_id }) =
                        err.downcast_ref::<CloudgateError>()
                    {
                        warn!(
                            "client {} opened with protocol version {version}, asking it to downgrade",
                            self.client_addr
                        );
                        self.reply_error(
                            ProtocolVersion::V4,
                            stream_id,
                            ERROR_PROTOCOL,
                            format!("Invalid or unsupported protocol version ({version})"),
                        )
                        .await;
                    } else {
                        error!("read from client {} failed: {err}", self.client_addr);
                    }
                    break;
                }
            };
            let handler = self.clone();
            tokio::spawn(async move {
                let version = request.header.version;
                let stream_id = request.stream_id();
                match handler.handle_request(request).await {
                    Ok(response) => {
                        let _ = handler.client_tx.send(response).await;
                    }
                    Err(err) if is_request_error(&err) => {
                        debug!("rejecting request on stream {stream_id} from {}: {err}", handler.client_addr);
                        handler
                            .reply_error(version, stream_id, ERROR_PROTOCOL, err.to_string())
                            .await;
                    }
                    Err(err) => {
                        error!("closing client connection {}: {err}", handler.client_addr);
                        handler.connection.cancel();
                    }
                }
            });
        }
    }

    async fn handle_request(&self, request: RawFrame) -> Result<RawFrame> {
        match request.opcode() {
            OpCode::Startup => self.handle_startup(request).await,
            OpCode::Prepare => self.handle_prepare(request).await,
            OpCode::Execute => self.handle_execute(request).await,
            OpCode::Query => {
                let decision = match self.codec.decode(&request)?.message {
                    Message::Query { query, .. } => decision_for_statement(&query),
                    _ => ForwardDecision::Both,
                };
                self.forward(request, decision).await
            }
            OpCode::Batch => self.forward(request, ForwardDecision::Both).await,
            _ => self.forward(request, ForwardDecision::Origin).await,
        }
    }

    async fn forward(&self, request: RawFrame, decision: ForwardDecision) -> Result<RawFrame> {
        counter!("proxy_requests_total", "decision" => decision.as_str()).increment(1);
        let (response_tx, response_rx) = oneshot::channel();
        self.dispatcher
            .submit(request, decision, Instant::now(), response_tx)?;
        let response = response_rx
            .await
            .map_err(|_| anyhow!("request to {} cluster(s) failed", decision.as_str()))?;
        Ok(response.aggregated_response)
    }

    async fn handle_startup(&self, request: RawFrame) -> Result<RawFrame> {
        let options = match self.codec.decode(&request)?.message {
            Message::Startup { options } => options,
            other => {
                return Err(CloudgateError::Protocol(format!("STARTUP frame decoded to {}", other.opcode())).into())
            }
        };
        if let Some((_, algorithm)) = options
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(COMPRESSION_OPTION))
        {
            return Err(CloudgateError::NotSupported(format!("{algorithm} compression")).into());
        }

        counter!("proxy_requests_total", "decision" => ForwardDecision::Both.as_str()).increment(1);
        let (origin_response, target_response) = self
            .dispatcher
            .send_to_both(request.clone(), request.clone())
            .await?;

        let authenticator = self
            .settings
            .target_credentials
            .clone()
            .map(|credentials| Arc::new(PlainTextAuthenticator::new(credentials)) as Arc<dyn Authenticator>);
        let orchestrator = HandshakeOrchestrator::new(
            self.codec.clone(),
            Arc::new(self.dispatcher.clone()),
            authenticator,
            self.connection.clone(),
            self.client_addr,
            self.target_addr,
        )
        .with_max_auth_rounds(self.settings.max_auth_rounds);

        if let Err(err) = orchestrator.run(&request, target_response).await {
            counter!("proxy_target_handshake_failures_total").increment(1);
            if !matches!(err, HandshakeError::Shutdown) {
                self.send_handshake_failure(&request, &err).await;
            }
            return Err(anyhow!("target handshake failed: {err}"));
        }
        Ok(origin_response)
    }

    async fn send_handshake_failure(&self, request: &RawFrame, err: &HandshakeError) {
        let code = match err {
            HandshakeError::Authentication(_) | HandshakeError::MissingTargetCredentials => {
                ERROR_AUTHENTICATION
            }
            _ => ERROR_SERVER,
        };
        self.reply_error(
            request.header.version,
            request.stream_id(),
            code,
            format!("proxy could not connect to target cluster: {err}"),
        )
        .await;
    }

    /// Queues an ERROR response for the client on `stream_id`.
    async fn reply_error(&self, version: ProtocolVersion, stream_id: i16, code: i32, message: String) {
        let frame = Frame::response(version, stream_id, Message::Error(ErrorMessage::new(code, message)));
        match self.codec.encode(&frame) {
            Ok(raw) => {
                let _ = self.client_tx.send(raw).await;
            }
            Err(err) => error!("could not encode error response for stream {stream_id}: {err}"),
        }
    }

    async fn handle_prepare(&self, request: RawFrame) -> Result<RawFrame> {
        let decision = match self.codec.decode(&request)?.message {
            Message::Prepare { query, .. } => decision_for_statement(&query),
            _ => ForwardDecision::Both,
        };
        counter!("proxy_requests_total", "decision" => ForwardDecision::Both.as_str()).increment(1);
        let (origin_response, target_response) = self
            .dispatcher
            .send_to_both(request.clone(), request)
            .await?;

        if let (Ok(origin), Ok(target)) = (
            self.codec.decode(&origin_response),
            self.codec.decode(&target_response),
        ) {
            if let (
                Message::Result(ResultMessage::Prepared { id: origin_id, .. }),
                Message::Result(ResultMessage::Prepared { id: target_id, .. }),
            ) = (origin.message, target.message)
            {
                self.cache
                    .store(origin_id, target_id, PreparedStatementInfo::new(decision));
            }
        }
        Ok(self.dispatcher.aggregate(origin_response, target_response))
    }

    async fn handle_execute(&self, request: RawFrame) -> Result<RawFrame> {
        let frame = self.codec.decode(&request)?;
        let (id, parameters) = match frame.message {
            Message::Execute { id, parameters } => (id, parameters),
            other => {
                return Err(CloudgateError::Protocol(format!("EXECUTE frame decoded to {}", other.opcode())).into())
            }
        };
        let Some(entry) = self.cache.get(&id) else {
            debug!("prepared id {} unknown to proxy, asking client to re-prepare", hex::encode(&id));
            return Ok(self.unprepared_response(&request, &id)?);
        };

        let decision = entry.statement_info().forward_decision;
        counter!("proxy_requests_total", "decision" => decision.as_str()).increment(1);
        let target_request = || -> Result<RawFrame, CloudgateError> {
            self.codec.encode(&Frame {
                header: frame.header,
                message: Message::Execute {
                    id: entry.target_id().clone(),
                    parameters: parameters.clone(),
                },
            })
        };
        match decision {
            ForwardDecision::Origin => Ok(self.dispatcher.send_to(ClusterType::Origin, request).await?),
            ForwardDecision::Target => {
                let response = self.dispatcher.send_to(ClusterType::Target, target_request()?).await?;
                Ok(self.dispatcher.translate_target_error(response))
            }
            ForwardDecision::Both => {
                let (origin, target) = self
                    .dispatcher
                    .send_to_both(request, target_request()?)
                    .await?;
                Ok(self.dispatcher.aggregate(origin, target))
            }
        }
    }

    fn unprepared_response(&self, request: &RawFrame, id: &Bytes) -> Result<RawFrame, CloudgateError> {
        self.codec.encode(&Frame::response(
            request.header.version,
            request.stream_id(),
            Message::Error(ErrorMessage::unprepared(
                format!("prepared statement {} is unknown to the proxy", hex::encode(id)),
                id,
            )?),
        ))
    }
}

/// Failures caused by the request itself. The client gets an ERROR on the
/// request's stream and the connection stays up.
fn is_request_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<CloudgateError>(),
        Some(CloudgateError::Protocol(_) | CloudgateError::NotSupported(_))
    )
}

async fn client_write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut client_rx: mpsc::Receiver<RawFrame>,
    connection: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            next = client_rx.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
            _ = connection.cancelled() => {
                while let Ok(frame) = client_rx.try_recv() {
                    let _ = write_raw_frame(&mut writer, &frame).await;
                }
                break;
            }
        };
        if let Err(err) = write_raw_frame(&mut writer, &frame).await {
            debug!("write to client failed: {err}");
            break;
        }
    }
    connection.cancel();
}
