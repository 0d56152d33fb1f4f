//! Provider runtime core for the MCP Hangar control plane.
//!
//! Owns everything between the client-facing tools and the upstream MCP
//! providers: transports, the per-provider supervisor state machine, group
//! routing, the batch executor, and the background workers that keep
//! provider state honest.

pub mod batch;
pub mod bus;
pub mod cancel;
pub mod continuation;
pub mod group;
pub mod health;
pub mod launcher;
pub mod metrics;
pub mod provider;
pub mod ratelimit;
pub mod registry;
pub mod singleflight;
pub mod transport;
pub mod workers;

pub use batch::{BatchExecutor, BatchOutcome, BatchRequest, CallSpec};
pub use bus::EventBus;
pub use cancel::CancelToken;
pub use group::ProviderGroup;
pub use metrics::HangarMetrics;
pub use provider::{ProviderState, ProviderSupervisor};
pub use registry::Registry;
