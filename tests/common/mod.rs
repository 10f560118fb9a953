//! In-process backends standing in for SGLang prefill/decode servers.
#![allow(dead_code)]

use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, StatusCode, Uri},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sglang_mini_lb::mini_lb::{MiniLbConfig, MiniLoadBalancer, PrefillConfig};
use tokio::net::TcpListener;

/// Serve `app` on an ephemeral loopback port and return its base URL.
pub async fn spawn_backend(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// A loopback URL nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// Paths a backend was called on, in arrival order.
#[derive(Clone, Default)]
pub struct Hits(Arc<Mutex<Vec<String>>>);

impl Hits {
    pub fn count(&self) -> usize {
        self.0.lock().len()
    }

    pub fn paths(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// Answers every path and method with `status`.
pub fn status_backend(status: StatusCode, hits: Hits) -> Router {
    Router::new().fallback(move |uri: Uri| {
        let hits = hits.clone();
        async move {
            hits.0.lock().push(uri.path().to_string());
            status
        }
    })
}

/// Like [`status_backend`], but each answer is held back for `delay`.
pub fn delayed_status_backend(status: StatusCode, delay: Duration, hits: Hits) -> Router {
    Router::new().fallback(move |uri: Uri| {
        let hits = hits.clone();
        async move {
            hits.0.lock().push(uri.path().to_string());
            tokio::time::sleep(delay).await;
            status
        }
    })
}

/// Request bodies a generation backend received.
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<Value>>>);

impl Captured {
    pub fn bodies(&self) -> Vec<Value> {
        self.0.lock().clone()
    }
}

/// `/generate` and `/v1/chat/completions` answer `{"role", "received"}` with `status`.
pub fn json_backend(role: &'static str, status: StatusCode, captured: Captured) -> Router {
    let handler = move |Json(body): Json<Value>| {
        let captured = captured.clone();
        async move {
            captured.0.lock().push(body.clone());
            (status, Json(json!({ "role": role, "received": body })))
        }
    };
    Router::new()
        .route("/generate", post(handler.clone()))
        .route("/v1/chat/completions", post(handler))
}

/// `/generate` answers 200 JSON after sleeping for `delay`.
pub fn delayed_json_backend(role: &'static str, delay: Duration) -> Router {
    Router::new().route(
        "/generate",
        post(move || async move {
            tokio::time::sleep(delay).await;
            Json(json!({ "role": role }))
        }),
    )
}

/// `/generate` streams `chunks` and then breaks the body mid-response.
pub fn broken_sse_backend(chunks: Vec<&'static str>) -> Router {
    Router::new().route(
        "/generate",
        post(move || {
            let chunks = chunks.clone();
            async move {
                let head = stream::iter(
                    chunks
                        .into_iter()
                        .map(|c| Ok::<_, io::Error>(Bytes::from_static(c.as_bytes()))),
                );
                let tail = stream::once(async {
                    Err(io::Error::new(io::ErrorKind::ConnectionReset, "decode worker died"))
                });
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    Body::from_stream(head.chain(tail)),
                )
            }
        }),
    )
}

/// `/generate` streams `chunks`; with `hang` the body then stays open forever.
pub fn sse_backend(chunks: Vec<&'static str>, hang: bool) -> Router {
    Router::new().route(
        "/generate",
        post(move || {
            let chunks = chunks.clone();
            async move {
                let head = stream::iter(
                    chunks
                        .into_iter()
                        .map(|c| Ok::<_, Infallible>(Bytes::from_static(c.as_bytes()))),
                );
                let body = if hang {
                    Body::from_stream(head.chain(stream::pending()))
                } else {
                    Body::from_stream(head)
                };
                ([(header::CONTENT_TYPE, "text/event-stream")], body)
            }
        }),
    )
}

/// `/get_server_info` returns `info`.
pub fn info_backend(info: Value) -> Router {
    Router::new().route(
        "/get_server_info",
        get(move || {
            let info = info.clone();
            async move { Json(info) }
        }),
    )
}

pub fn build_lb(prefill: Vec<String>, decode: Vec<String>) -> MiniLoadBalancer {
    let prefill = prefill
        .into_iter()
        .map(|url| PrefillConfig::new(url, 8998))
        .collect();
    let config = MiniLbConfig::new("127.0.0.1".to_string(), 0, prefill, decode, 30);
    MiniLoadBalancer::new(config).unwrap()
}

/// Poll `cond` for up to two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
