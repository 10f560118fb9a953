//! Bootstrap metadata injection.
//!
//! Prefill and decode servers rendezvous out of band through the prefill
//! server's bootstrap endpoint. Every request forwarded to a pair carries the
//! bootstrap host, port and a room id so both sides can find each other.

use rand::Rng;
use serde_json::{json, Value};
use tracing::debug;
use url::Host;

use super::error::{MiniLbError, Result};
use super::types::ServerPair;

/// Batch layout of a `/generate` body, decided before any field is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestShape {
    SingleText,
    BatchedText(usize),
    SingleIds,
    BatchedIds(usize),
    Unknown,
}

impl RequestShape {
    /// `text` takes precedence over `input_ids`; a null field counts as absent.
    pub fn classify(body: &Value) -> Result<Self> {
        let obj = body.as_object().ok_or_else(|| {
            MiniLbError::MalformedRequest("request body must be a JSON object".to_string())
        })?;

        match obj.get("text") {
            None | Some(Value::Null) => {}
            Some(Value::String(_)) => return Ok(RequestShape::SingleText),
            Some(Value::Array(items)) => return Ok(RequestShape::BatchedText(items.len())),
            Some(_) => {
                return Err(MiniLbError::MalformedRequest(
                    "`text` must be a string or a list of strings".to_string(),
                ))
            }
        }

        match obj.get("input_ids") {
            None | Some(Value::Null) => Ok(RequestShape::Unknown),
            Some(Value::Array(ids)) => match ids.first() {
                None => Err(MiniLbError::MalformedRequest(
                    "`input_ids` must not be empty".to_string(),
                )),
                Some(Value::Number(_)) => Ok(RequestShape::SingleIds),
                Some(Value::Array(_)) => Ok(RequestShape::BatchedIds(ids.len())),
                Some(_) => Err(MiniLbError::MalformedRequest(
                    "`input_ids` must hold token ids or lists of token ids".to_string(),
                )),
            },
            Some(_) => Err(MiniLbError::MalformedRequest(
                "`input_ids` must be a list".to_string(),
            )),
        }
    }

    /// `None` means a single item.
    pub fn batch_size(&self) -> Option<usize> {
        match self {
            RequestShape::BatchedText(n) | RequestShape::BatchedIds(n) => Some(*n),
            RequestShape::SingleText | RequestShape::SingleIds | RequestShape::Unknown => None,
        }
    }
}

/// How the room id is chosen for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionMode {
    /// `/generate`: one room per batch item.
    Batched,
    /// OpenAI-style routes: always scalar, `req_id` reused as the room when given.
    Single,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapRoom {
    Single(Value),
    Batch(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapMetadata {
    pub host: String,
    pub port: u16,
    pub room: BootstrapRoom,
}

impl BootstrapMetadata {
    pub fn for_shape(host: String, port: u16, shape: RequestShape) -> Self {
        let room = match shape.batch_size() {
            Some(n) => BootstrapRoom::Batch((0..n).map(|_| generate_bootstrap_room()).collect()),
            None => BootstrapRoom::Single(json!(generate_bootstrap_room())),
        };
        Self { host, port, room }
    }

    pub fn for_request_id(host: String, port: u16, req_id: Option<&Value>) -> Self {
        let room = match req_id {
            Some(id) if !id.is_null() => id.clone(),
            _ => json!(generate_bootstrap_room()),
        };
        Self {
            host,
            port,
            room: BootstrapRoom::Single(room),
        }
    }

    pub fn apply(&self, body: &mut Value) -> Result<()> {
        let obj = body.as_object_mut().ok_or_else(|| {
            MiniLbError::MalformedRequest("request body must be a JSON object".to_string())
        })?;

        match &self.room {
            BootstrapRoom::Single(room) => {
                obj.insert("bootstrap_host".to_string(), json!(self.host));
                obj.insert("bootstrap_port".to_string(), json!(self.port));
                obj.insert("bootstrap_room".to_string(), room.clone());
            }
            BootstrapRoom::Batch(rooms) => {
                let n = rooms.len();
                obj.insert("bootstrap_host".to_string(), json!(vec![&self.host; n]));
                obj.insert("bootstrap_port".to_string(), json!(vec![self.port; n]));
                obj.insert("bootstrap_room".to_string(), json!(rooms));
            }
        }
        Ok(())
    }
}

/// Classify `request`, then write the bootstrap fields for `server_pair` into it.
pub fn inject_bootstrap(
    request: &mut Value,
    server_pair: &ServerPair,
    mode: InjectionMode,
) -> Result<BootstrapMetadata> {
    let hostname = extract_hostname(&server_pair.prefill_url);
    let port = server_pair.prefill_bootstrap_port;

    let metadata = match mode {
        InjectionMode::Batched => {
            let shape = RequestShape::classify(request)?;
            BootstrapMetadata::for_shape(hostname, port, shape)
        }
        InjectionMode::Single => {
            if !request.is_object() {
                return Err(MiniLbError::MalformedRequest(
                    "request body must be a JSON object".to_string(),
                ));
            }
            BootstrapMetadata::for_request_id(hostname, port, request.get("req_id"))
        }
    };
    metadata.apply(request)?;

    debug!(
        "Injected bootstrap host={} port={} room={:?}",
        metadata.host, metadata.port, metadata.room
    );
    Ok(metadata)
}

/// Hostname of a server URL, scheme, port and path stripped. IPv6 literals come back bare.
pub fn extract_hostname(url: &str) -> String {
    match url::Url::parse(url).ok().and_then(|u| u.host().map(|h| h.to_owned())) {
        Some(Host::Domain(domain)) => domain,
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => url.to_string(),
    }
}

/// Uniform over the non-negative 63-bit range.
pub fn generate_bootstrap_room() -> u64 {
    rand::thread_rng().gen_range(0..=i64::MAX as u64)
}
