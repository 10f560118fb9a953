//! Fan-out of administrative commands to every prefill and decode server.

use std::sync::Arc;

use futures_util::{future::join_all, stream::FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::error::{Leg, MiniLbError, Result};
use super::types::BackendRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    StartProfile,
    StopProfile,
    StartExpertDistributionRecord,
    StopExpertDistributionRecord,
    DumpExpertDistributionRecord,
    EplbRebalance,
    EplbSaveExpertDistribution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdminFlag {
    Profiling,
    Recording,
}

impl AdminCommand {
    /// Backend path, without the leading slash.
    pub fn path(&self) -> &'static str {
        match self {
            AdminCommand::StartProfile => "start_profile",
            AdminCommand::StopProfile => "stop_profile",
            AdminCommand::StartExpertDistributionRecord => "start_expert_distribution_record",
            AdminCommand::StopExpertDistributionRecord => "stop_expert_distribution_record",
            AdminCommand::DumpExpertDistributionRecord => "dump_expert_distribution_record",
            AdminCommand::EplbRebalance => "eplb_rebalance",
            AdminCommand::EplbSaveExpertDistribution => "eplb_save_expert_distribution",
        }
    }

    fn messages(&self) -> (&'static str, &'static str) {
        match self {
            AdminCommand::StartProfile => ("Profiling started", "Failed to start profiling"),
            AdminCommand::StopProfile => ("Profiling stopped", "Failed to stop profiling"),
            AdminCommand::StartExpertDistributionRecord => (
                "Recording expert distribution started",
                "Failed to start recording expert distribution",
            ),
            AdminCommand::StopExpertDistributionRecord => (
                "Recording expert distribution stopped",
                "Failed to stop recording expert distribution",
            ),
            AdminCommand::DumpExpertDistributionRecord => (
                "Dumping expert distribution succeed",
                "Failed to dumping expert distribution",
            ),
            AdminCommand::EplbRebalance => ("EPLB rebalanced", "Failed to rebalancing EPLB."),
            AdminCommand::EplbSaveExpertDistribution => (
                "Saving expert distribution succeed",
                "Failed to saving expert distribution.",
            ),
        }
    }

    /// The flag this command flips and the value it flips it to.
    fn transition(&self) -> Option<(AdminFlag, bool)> {
        match self {
            AdminCommand::StartProfile => Some((AdminFlag::Profiling, true)),
            AdminCommand::StopProfile => Some((AdminFlag::Profiling, false)),
            AdminCommand::StartExpertDistributionRecord => Some((AdminFlag::Recording, true)),
            AdminCommand::StopExpertDistributionRecord => Some((AdminFlag::Recording, false)),
            AdminCommand::DumpExpertDistributionRecord
            | AdminCommand::EplbRebalance
            | AdminCommand::EplbSaveExpertDistribution => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdminState {
    pub profiling: bool,
    pub recording: bool,
}

impl AdminState {
    fn get(&self, flag: AdminFlag) -> bool {
        match flag {
            AdminFlag::Profiling => self.profiling,
            AdminFlag::Recording => self.recording,
        }
    }

    fn set(&mut self, flag: AdminFlag, value: bool) {
        match flag {
            AdminFlag::Profiling => self.profiling = value,
            AdminFlag::Recording => self.recording = value,
        }
    }
}

/// A start/stop broadcast that has passed the guard and not yet committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reservation {
    target: bool,
    ticket: u64,
}

/// Committed flags plus the transitions still being broadcast.
///
/// The guard reads the newest reserved target, so a second start issued while
/// the first is in flight is rejected. Only the latest reservation for a flag
/// commits.
#[derive(Debug, Default)]
struct FlagTable {
    committed: AdminState,
    profiling: Option<Reservation>,
    recording: Option<Reservation>,
    next_ticket: u64,
}

impl FlagTable {
    fn reservation(&mut self, flag: AdminFlag) -> &mut Option<Reservation> {
        match flag {
            AdminFlag::Profiling => &mut self.profiling,
            AdminFlag::Recording => &mut self.recording,
        }
    }

    fn effective(&mut self, flag: AdminFlag) -> bool {
        let committed = self.committed.get(flag);
        (*self.reservation(flag)).map_or(committed, |r| r.target)
    }

    /// Reserve `target` for `flag`, or `None` when the flag already holds or is heading to it.
    fn reserve(&mut self, flag: AdminFlag, target: bool) -> Option<u64> {
        if self.effective(flag) == target {
            return None;
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        *self.reservation(flag) = Some(Reservation { target, ticket });
        Some(ticket)
    }

    fn commit(&mut self, flag: AdminFlag, ticket: u64) {
        let slot = self.reservation(flag);
        match *slot {
            Some(r) if r.ticket == ticket => {
                *slot = None;
                self.committed.set(flag, r.target);
            }
            _ => {}
        }
    }
}

/// Commits a reservation when dropped, so a cancelled broadcast still flips its flag.
struct PendingTransition<'a> {
    flags: &'a Mutex<FlagTable>,
    flag: AdminFlag,
    ticket: u64,
}

impl Drop for PendingTransition<'_> {
    fn drop(&mut self) {
        self.flags.lock().commit(self.flag, self.ticket);
    }
}

fn rejection_message(flag: AdminFlag, active: bool) -> &'static str {
    match (flag, active) {
        (AdminFlag::Profiling, true) => "Profiling is already in progress",
        (AdminFlag::Profiling, false) => "Profiling is not in progress",
        (AdminFlag::Recording, true) => "Recording is already in progress",
        (AdminFlag::Recording, false) => "Recording is not in progress",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOutcome {
    pub success: bool,
    pub message: String,
}

impl BroadcastOutcome {
    fn new(success: bool, message: &str) -> Self {
        Self {
            success,
            message: message.to_string(),
        }
    }
}

pub struct Broadcaster {
    client: Client,
    registry: Arc<BackendRegistry>,
    flags: Mutex<FlagTable>,
}

impl Broadcaster {
    pub fn new(client: Client, registry: Arc<BackendRegistry>) -> Self {
        Self {
            client,
            registry,
            flags: Mutex::new(FlagTable::default()),
        }
    }

    pub fn state(&self) -> AdminState {
        self.flags.lock().committed
    }

    /// Run `command` against every backend.
    ///
    /// Start/stop commands are refused without any network call when the flag
    /// already holds, or is being moved to, the target value. The check and the
    /// reservation happen under one lock; the flag is committed after the
    /// broadcast returns, whether or not every backend accepted it.
    pub async fn run(&self, command: AdminCommand) -> BroadcastOutcome {
        let pending = match command.transition() {
            Some((flag, target)) => {
                let Some(ticket) = self.flags.lock().reserve(flag, target) else {
                    let message = rejection_message(flag, target);
                    warn!("Rejected /{}: {}", command.path(), message);
                    return BroadcastOutcome::new(false, message);
                };
                Some(PendingTransition {
                    flags: &self.flags,
                    flag,
                    ticket,
                })
            }
            None => None,
        };

        let success = self.broadcast(command.path()).await;
        drop(pending);

        let (ok_message, failed_message) = command.messages();
        let outcome = if success {
            BroadcastOutcome::new(true, ok_message)
        } else {
            BroadcastOutcome::new(false, failed_message)
        };
        info!("/{} broadcast: {}", command.path(), outcome.message);
        outcome
    }

    /// POST `path` on every backend concurrently. True iff every backend answered 200.
    pub async fn broadcast(&self, path: &str) -> bool {
        let requests = self.backends().map(|(leg, url)| {
            let target = format!("{}/{}", url, path);
            let request = self.client.post(&target).send();
            async move {
                match request.await {
                    Ok(resp) if resp.status() == StatusCode::OK => true,
                    Ok(resp) => {
                        warn!("{} server {} returned {}", leg, target, resp.status());
                        false
                    }
                    Err(e) => {
                        warn!("{} server {} failed: {}", leg, target, e);
                        false
                    }
                }
            }
        });

        join_all(requests).await.into_iter().all(|ok| ok)
    }

    /// Probe `/health_generate` everywhere and wait for every answer.
    ///
    /// Responses are consumed as they arrive. The first transport fault is
    /// returned, but only after the remaining probes have finished.
    pub async fn health_generate_all(&self) -> Result<()> {
        self.post_all_unordered("health_generate").await
    }

    /// Ask every backend to flush its cache. Failures are logged, never returned.
    pub async fn flush_cache_all(&self) {
        if let Err(e) = self.post_all_unordered("flush_cache").await {
            warn!("Flush cache failed: {}", e);
        }
    }

    async fn post_all_unordered(&self, path: &str) -> Result<()> {
        let mut pending: FuturesUnordered<_> = self
            .backends()
            .map(|(leg, url)| {
                let request = self.client.post(format!("{}/{}", url, path)).send();
                async move { (leg, request.await) }
            })
            .collect();

        let mut first_error = None;
        while let Some((leg, result)) = pending.next().await {
            if let Err(e) = result {
                error!("/{} on {} server failed: {}", path, leg, e);
                first_error.get_or_insert_with(|| MiniLbError::unavailable(leg, e));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fetch `/get_server_info` from each backend one at a time, keeping pool order.
    ///
    /// Decode servers' `internal_states` are gathered into a top-level list; a
    /// placeholder state is reported when none exist.
    pub async fn server_info_all(&self) -> Result<Value> {
        let mut prefill_infos = Vec::with_capacity(self.registry.prefill().len());
        let mut decode_infos = Vec::with_capacity(self.registry.decode().len());
        let mut internal_states = Vec::new();

        for prefill in self.registry.prefill() {
            prefill_infos.push(self.fetch_info(Leg::Prefill, &prefill.url).await?);
        }
        for decode_url in self.registry.decode() {
            let info = self.fetch_info(Leg::Decode, decode_url).await?;
            if let Some(states) = info.get("internal_states").and_then(Value::as_array) {
                internal_states.extend(states.iter().cloned());
            }
            decode_infos.push(info);
        }

        if internal_states.is_empty() {
            internal_states.push(json!({
                "last_gen_throughput": 0.0,
                "avg_spec_accept_length": null,
            }));
        }

        Ok(json!({
            "internal_states": internal_states,
            "prefill": prefill_infos,
            "decode": decode_infos,
        }))
    }

    async fn fetch_info(&self, leg: Leg, url: &str) -> Result<Value> {
        let resp = self
            .client
            .get(format!("{}/get_server_info", url))
            .send()
            .await
            .map_err(|e| MiniLbError::unavailable(leg, e))?;
        resp.json::<Value>()
            .await
            .map_err(|e| MiniLbError::unavailable(leg, e))
    }

    fn backends(&self) -> impl Iterator<Item = (Leg, &str)> {
        self.registry
            .prefill()
            .iter()
            .map(|p| (Leg::Prefill, p.url.as_str()))
            .chain(self.registry.decode().iter().map(|d| (Leg::Decode, d.as_str())))
    }
}
