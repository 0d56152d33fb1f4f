//! Serving surface of the MCP Hangar control plane.
//!
//! The hangar is itself an MCP server: clients call its management tools
//! over stdio JSON-RPC or HTTP. This crate wires the runtime core to those
//! two front-ends plus the metrics pull endpoint.

pub mod rpc;
pub mod routes;
pub mod state;
pub mod tools;
