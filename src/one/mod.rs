//! OpenNebula API integration module.
//!
//! This module provides the session handle used for every remote call, the
//! XML-RPC wire encoding, and the header projection shared by all object
//! documents.

mod client;
mod types;
mod xmlrpc;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{OneClient, RemoteCall, RemoteSession};
pub use types::{parse_pool, ObjectHeader, Ownership, PoolEntry, PoolScope};
pub use xmlrpc::{decode_response, encode_call, Value};
