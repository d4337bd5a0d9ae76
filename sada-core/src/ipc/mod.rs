//! Event types broadcast to hosts.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them as JSON without its own mirror types.

pub mod events;
