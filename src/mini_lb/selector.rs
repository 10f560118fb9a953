use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use super::error::{MiniLbError, Result};
use super::types::{BackendRegistry, ServerPair};

/// Picks a prefill server round-robin and a decode server uniformly at random.
///
/// The cursor is owned here and advanced under a single lock acquisition with
/// no await in between, so concurrent callers never share a cursor value.
#[derive(Debug)]
pub struct PairSelector {
    registry: Arc<BackendRegistry>,
    prefill_cursor: Mutex<usize>,
}

impl PairSelector {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self::with_cursor(registry, 0)
    }

    /// Start the round-robin at `cursor` (taken modulo the prefill pool size).
    pub fn with_cursor(registry: Arc<BackendRegistry>, cursor: usize) -> Self {
        let start = match registry.prefill().len() {
            0 => 0,
            n => cursor % n,
        };
        Self {
            registry,
            prefill_cursor: Mutex::new(start),
        }
    }

    pub fn select_pair(&self) -> Result<ServerPair> {
        let prefill_pool = self.registry.prefill();
        let decode_pool = self.registry.decode();
        if prefill_pool.is_empty() || decode_pool.is_empty() {
            return Err(MiniLbError::Configuration(
                "cannot select a server pair from an empty pool".to_string(),
            ));
        }

        let prefill_idx = {
            let mut cursor = self.prefill_cursor.lock();
            let idx = *cursor;
            *cursor = (idx + 1) % prefill_pool.len();
            idx
        };
        let decode_idx = rand::thread_rng().gen_range(0..decode_pool.len());

        let prefill = &prefill_pool[prefill_idx];
        let decode_url = &decode_pool[decode_idx];
        debug!(
            "Selected prefill[{}]={} decode[{}]={}",
            prefill_idx, prefill.url, decode_idx, decode_url
        );

        Ok(ServerPair::new(
            prefill.url.clone(),
            prefill.bootstrap_port,
            decode_url.clone(),
            prefill_idx,
        ))
    }

    /// The index the next selection will use.
    pub fn cursor(&self) -> usize {
        *self.prefill_cursor.lock()
    }
}
