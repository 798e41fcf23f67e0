use cloudgate_core::{CloudgateError, ClusterType};
use cloudgate_protocol::{read_raw_frame, write_raw_frame, RawFrame};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WRITE_QUEUE_CAPACITY: usize = 1024;

type PendingRequests = Arc<Mutex<HashMap<i16, oneshot::Sender<RawFrame>>>>;

/// Connection from the proxy to one cluster, shared by all in-flight
/// requests of a client connection. Responses are matched to requests by
/// stream id.
///
/// When the cluster connection ends, every pending response channel is
/// closed and `connection` is cancelled so the whole client connection
/// tears down.
pub struct ClusterConnector {
    cluster: ClusterType,
    remote_addr: SocketAddr,
    write_tx: mpsc::Sender<RawFrame>,
    pending: PendingRequests,
    connection: CancellationToken,
}

impl ClusterConnector {
    pub async fn connect(
        cluster: ClusterType,
        contact_point: &str,
        events_tx: Option<mpsc::Sender<RawFrame>>,
        connection: CancellationToken,
    ) -> Result<Arc<Self>, CloudgateError> {
        let stream = TcpStream::connect(contact_point).await.map_err(|err| {
            CloudgateError::Connection(format!(
                "unable to connect to {cluster} cluster at {contact_point}: {err}"
            ))
        })?;
        let _ = stream.set_nodelay(true);
        let remote_addr = stream
            .peer_addr()
            .map_err(|err| CloudgateError::Connection(err.to_string()))?;
        info!("connected to {cluster} cluster at {remote_addr}");

        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(write_loop(
            cluster,
            remote_addr,
            write_half,
            write_rx,
            connection.clone(),
        ));
        tokio::spawn(read_loop(
            cluster,
            remote_addr,
            read_half,
            pending.clone(),
            events_tx,
            connection.clone(),
        ));

        Ok(Arc::new(Self {
            cluster,
            remote_addr,
            write_tx,
            pending,
            connection,
        }))
    }

    pub fn cluster(&self) -> ClusterType {
        self.cluster
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Queues `request` and returns the channel its response arrives on.
    pub async fn send(&self, request: RawFrame) -> Result<oneshot::Receiver<RawFrame>, CloudgateError> {
        if self.connection.is_cancelled() {
            return Err(self.closed_error());
        }
        let stream_id = request.stream_id();
        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.contains_key(&stream_id) {
                return Err(CloudgateError::Protocol(format!(
                    "stream id {stream_id} already in use on {} connection",
                    self.cluster
                )));
            }
            pending.insert(stream_id, response_tx);
        }
        if self.write_tx.send(request).await.is_err() {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&stream_id);
            return Err(self.closed_error());
        }
        Ok(response_rx)
    }

    fn closed_error(&self) -> CloudgateError {
        CloudgateError::Connection(format!(
            "connection to {} cluster {} is closed",
            self.cluster, self.remote_addr
        ))
    }
}

async fn write_loop(
    cluster: ClusterType,
    remote_addr: SocketAddr,
    mut writer: OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<RawFrame>,
    connection: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = connection.cancelled() => break,
            next = write_rx.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(err) = write_raw_frame(&mut writer, &frame).await {
            error!("write to {cluster} cluster {remote_addr} failed: {err}");
            break;
        }
    }
    connection.cancel();
}

async fn read_loop(
    cluster: ClusterType,
    remote_addr: SocketAddr,
    reader: OwnedReadHalf,
    pending: PendingRequests,
    events_tx: Option<mpsc::Sender<RawFrame>>,
    connection: CancellationToken,
) {
    let mut reader = BufReader::new(reader);
    loop {
        let read = tokio::select! {
            biased;
            _ = connection.cancelled() => break,
            read = read_raw_frame(&mut reader) => read,
        };
        let frame = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("{cluster} cluster {remote_addr} closed the connection");
                break;
            }
            Err(err) => {
                error!("read from {cluster} cluster {remote_addr} failed: {err}");
                break;
            }
        };

        if frame.stream_id() < 0 {
            match &events_tx {
                Some(events_tx) => {
                    if events_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                None => debug!("dropping {} from {cluster} cluster", frame.opcode()),
            }
            continue;
        }

        let waiter = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&frame.stream_id());
        match waiter {
            Some(response_tx) => {
                let _ = response_tx.send(frame);
            }
            None => warn!(
                "{cluster} cluster {remote_addr} answered stream {} which has no pending request",
                frame.stream_id()
            ),
        }
    }
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
    connection.cancel();
}
