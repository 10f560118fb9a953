/// Mini Load Balancer for Prefill-Decode Disaggregation
///
/// This module provides a minimal HTTP load balancer for prefill and decode
/// servers in a disaggregated setup. Prefill servers are picked round-robin,
/// decode servers at random, and every request is sent to both halves of the
/// pair with bootstrap metadata so they can exchange KV cache directly.

pub mod bootstrap;
pub mod broadcast;
pub mod dispatch;
pub mod error;
pub mod router;
pub mod selector;
pub mod types;

pub use bootstrap::{InjectionMode, RequestShape};
pub use broadcast::{AdminCommand, AdminState, BroadcastOutcome};
pub use error::{Leg, MiniLbError};
pub use router::MiniLoadBalancer;
pub use types::{BackendRegistry, MiniLbConfig, PrefillConfig, ServerPair};
