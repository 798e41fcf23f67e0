use cloudgate_core::{CloudgateError, ForwardDecision};
use cloudgate_protocol::RawFrame;
use std::time::Instant;
use tokio::sync::oneshot;

/// Response delivered for one forwarded request, already aggregated when
/// the request went to both clusters.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub aggregated_response: RawFrame,
}

/// Sends a request to the clusters named by the decision.
///
/// Exactly one `ForwardedResponse` is delivered on `response_tx`, or the
/// sender is dropped if the request could not be completed.
pub trait RequestForwarder: Send + Sync {
    fn submit(
        &self,
        request: RawFrame,
        decision: ForwardDecision,
        start_time: Instant,
        response_tx: oneshot::Sender<ForwardedResponse>,
    ) -> Result<(), CloudgateError>;
}
