use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use super::error::{Leg, MiniLbError, Result};
use super::types::ServerPair;

/// Chunks held between the decode reader and the client. One is enough to pass a chunk through.
const STREAM_CHANNEL_CAPACITY: usize = 1;

/// Decode leg result returned to the client as-is.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub status: StatusCode,
    pub body: Value,
}

impl IntoResponse for DispatchOutcome {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Counts of prefill connections held open for streaming requests.
#[derive(Debug, Default)]
pub struct PrefillLeaseStats {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl PrefillLeaseStats {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

/// An open prefill response. Dropping it closes the connection and is counted exactly once.
struct PrefillLease {
    response: Option<reqwest::Response>,
    stats: Arc<PrefillLeaseStats>,
}

impl PrefillLease {
    fn acquire(response: reqwest::Response, stats: Arc<PrefillLeaseStats>) -> Self {
        stats.acquired.fetch_add(1, Ordering::SeqCst);
        Self {
            response: Some(response),
            stats,
        }
    }

    /// Read and discard one chunk. Returns false once the body is finished or broken.
    async fn drain_chunk(&mut self) -> bool {
        let Some(response) = self.response.as_mut() else {
            return false;
        };
        match response.chunk().await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!("Prefill stream ended with error: {}", e);
                false
            }
        }
    }
}

impl Drop for PrefillLease {
    fn drop(&mut self) {
        self.response.take();
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sends one request to a prefill/decode pair and shapes a single client response.
#[derive(Debug, Clone)]
pub struct DualDispatcher {
    client: Client,
    lease_stats: Arc<PrefillLeaseStats>,
}

impl DualDispatcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            lease_stats: Arc::new(PrefillLeaseStats::default()),
        }
    }

    pub fn lease_stats(&self) -> &Arc<PrefillLeaseStats> {
        &self.lease_stats
    }

    pub async fn dispatch(
        &self,
        request: Value,
        server_pair: &ServerPair,
        route: &str,
        streaming: bool,
    ) -> Result<Response> {
        if streaming {
            Ok(self.dispatch_stream(request, server_pair, route))
        } else {
            self.dispatch_json(&request, server_pair, route)
                .await
                .map(IntoResponse::into_response)
        }
    }

    fn leg_requests(
        &self,
        request: &Value,
        server_pair: &ServerPair,
        route: &str,
    ) -> (RequestBuilder, RequestBuilder) {
        let route = route.trim_start_matches('/');
        let prefill_url = format!("{}/{}", server_pair.prefill_url, route);
        let decode_url = format!("{}/{}", server_pair.decode_url, route);
        debug!("Dispatching to prefill {} and decode {}", prefill_url, decode_url);

        (
            self.client.post(prefill_url).json(request),
            self.client.post(decode_url).json(request),
        )
    }

    /// Wait for both legs; the decode status and JSON body become the response.
    ///
    /// The first leg to fail fails the request without waiting for the other.
    pub async fn dispatch_json(
        &self,
        request: &Value,
        server_pair: &ServerPair,
        route: &str,
    ) -> Result<DispatchOutcome> {
        let (prefill_req, decode_req) = self.leg_requests(request, server_pair, route);

        let (prefill_resp, decode_resp) = tokio::try_join!(
            send_leg(Leg::Prefill, prefill_req),
            send_leg(Leg::Decode, decode_req),
        )?;
        check_prefill_status(&prefill_resp)?;
        let decode_status = decode_resp.status();

        // Prefill must run to completion even though its body is discarded.
        let (_, decode_body) = tokio::try_join!(
            read_leg(Leg::Prefill, prefill_resp),
            read_leg(Leg::Decode, decode_resp),
        )?;

        let body: Value = serde_json::from_slice(&decode_body).map_err(|e| {
            MiniLbError::unavailable(Leg::Decode, format!("invalid JSON body: {}", e))
        })?;

        Ok(DispatchOutcome {
            status: decode_status,
            body,
        })
    }

    /// Forward the decode body as server-sent events.
    ///
    /// Both legs are opened by a background task. The prefill response is drained
    /// alongside and released once decode reaches a terminal event, including when
    /// the client goes away. Failures become one trailing `data:` error event.
    pub fn dispatch_stream(&self, request: Value, server_pair: &ServerPair, route: &str) -> Response {
        let (prefill_req, decode_req) = self.leg_requests(&request, server_pair, route);
        let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, Infallible>>(
            STREAM_CHANNEL_CAPACITY,
        );
        let stats = Arc::clone(&self.lease_stats);

        tokio::spawn(async move {
            let mut lease = None;
            if let Err(e) = forward_decode_stream(prefill_req, decode_req, &tx, &mut lease, stats).await
            {
                error!("Streaming request failed: {}", e);
                let _ = tx.send(Ok(sse_error_event(&e))).await;
            }
            // Prefill is closed only after the terminal event went out.
            drop(lease);
        });

        (
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(ReceiverStream::new(rx)),
        )
            .into_response()
    }
}

async fn forward_decode_stream(
    prefill_req: RequestBuilder,
    decode_req: RequestBuilder,
    tx: &mpsc::Sender<std::result::Result<Bytes, Infallible>>,
    lease: &mut Option<PrefillLease>,
    stats: Arc<PrefillLeaseStats>,
) -> Result<()> {
    let (prefill_resp, decode_resp) = tokio::try_join!(
        send_leg(Leg::Prefill, prefill_req),
        send_leg(Leg::Decode, decode_req),
    )?;
    check_prefill_status(&prefill_resp)?;
    if !decode_resp.status().is_success() {
        error!("Decode server returned {}", decode_resp.status());
        return Err(MiniLbError::unavailable(
            Leg::Decode,
            format!("status {}", decode_resp.status()),
        ));
    }
    let lease = lease.insert(PrefillLease::acquire(prefill_resp, stats));

    let mut decode_stream = Box::pin(decode_resp.bytes_stream());
    let mut prefill_open = true;

    loop {
        tokio::select! {
            biased;
            _ = tx.closed() => {
                debug!("Client disconnected, closing streaming request");
                return Ok(());
            }
            chunk = decode_stream.next() => match chunk {
                Some(Ok(chunk)) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        debug!("Client disconnected, closing streaming request");
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(MiniLbError::unavailable(Leg::Decode, e)),
                None => return Ok(()),
            },
            more = lease.drain_chunk(), if prefill_open => {
                prefill_open = more;
            }
        }
    }
}

async fn send_leg(leg: Leg, request: RequestBuilder) -> Result<reqwest::Response> {
    request.send().await.map_err(|e| {
        error!("{} request failed: {}", leg, e);
        MiniLbError::unavailable(leg, e)
    })
}

async fn read_leg(leg: Leg, response: reqwest::Response) -> Result<Bytes> {
    response
        .bytes()
        .await
        .map_err(|e| MiniLbError::unavailable(leg, e))
}

fn check_prefill_status(response: &reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    error!("Prefill server returned {}", status);
    Err(MiniLbError::unavailable(Leg::Prefill, format!("status {}", status)))
}

fn sse_error_event(err: &MiniLbError) -> Bytes {
    let payload = json!({
        "error": { "message": format!("Stream processing error: {}", err) }
    });
    Bytes::from(format!("data: {}\n\n", payload))
}
