//! Cluster node identity, master election, and the plugin ownership ledger.
//! Each node publishes its own liveness and plugin ownership into a shared
//! keyed store, a CAS'd lock key elects exactly one master, and ownership
//! lookups let the redirector find which node to forward to.

mod ledger;
mod node;

pub use ledger::{InMemoryLedger, SharedLedger};
pub use node::{ClusterNode, NodeRecord};
