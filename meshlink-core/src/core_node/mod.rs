//! Client node: signaling link, direct connections, sync and storage wired
//! into one event loop

pub mod errors;
pub mod node;

pub use errors::{NodeError, NodeResult};
pub use node::{negotiation_to_signal, MeshNode, NodeEvent};
