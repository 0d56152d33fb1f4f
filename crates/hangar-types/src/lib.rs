//! Shared types for the MCP Hangar control plane.
//!
//! Everything the other crates agree on lives here: the error taxonomy,
//! JSON-RPC 2.0 protocol types, validated identifiers, and domain events.

pub mod errors;
pub mod events;
pub mod ids;
pub mod wire;

pub use errors::{ErrorEnvelope, ErrorKind, HangarError, HangarResult};
pub use events::HangarEvent;
pub use ids::{GroupId, ProviderId};
pub use wire::{McpTool, RpcOutcome};
