use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use plugind_types::PluginUniqueIdentifier;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ledger::SharedLedger;

const NODE_KEY_PREFIX: &str = "cluster:nodes:";
const MASTER_LOCK_KEY: &str = "cluster:master-lock";

const NODE_TTL: Duration = Duration::from_secs(60);
const NODE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const MASTER_LOCK_TTL: Duration = Duration::from_secs(30);
const MASTER_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
const STALE_NODE_AGE: Duration = Duration::from_secs(120);

fn node_key(id: Uuid) -> String {
    format!("{NODE_KEY_PREFIX}{id}")
}

/// What a node publishes about itself into the shared ledger: its own
/// plugin ownership list alongside host/port for redirect routing, the
/// last time it heartbeated, and its current election state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: Uuid,
    pub host: String,
    pub port: u16,
    pub now: DateTime<Utc>,
    pub is_master: bool,
    pub vote_token: String,
    pub plugins: Vec<PluginUniqueIdentifier>,
}

/// A single cluster member: publishes its own liveness, takes part in
/// master election via a CAS'd lock key, and tracks which plugins it has
/// launched locally.
pub struct ClusterNode {
    pub id: Uuid,
    host: String,
    port: u16,
    ledger: Arc<dyn SharedLedger>,
    is_master: AtomicBool,
    plugins: tokio::sync::RwLock<HashSet<PluginUniqueIdentifier>>,
    voting_completed: Notify,
    node_update_completed: Notify,
}

impl ClusterNode {
    pub fn new(host: impl Into<String>, port: u16, ledger: Arc<dyn SharedLedger>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            host: host.into(),
            port,
            ledger,
            is_master: AtomicBool::new(false),
            plugins: tokio::sync::RwLock::new(HashSet::new()),
            voting_completed: Notify::new(),
            node_update_completed: Notify::new(),
        })
    }

    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }

    pub async fn notify_voting_completed(&self) {
        self.voting_completed.notified().await;
    }

    pub async fn notify_node_update_completed(&self) {
        self.node_update_completed.notified().await;
    }

    pub async fn mark_plugin_launched(&self, identifier: PluginUniqueIdentifier) {
        self.plugins.write().await.insert(identifier);
        self.publish_record().await;
    }

    pub async fn mark_plugin_stopped(&self, identifier: &PluginUniqueIdentifier) {
        self.plugins.write().await.remove(identifier);
        self.publish_record().await;
    }

    pub async fn is_plugin_on_current_node(&self, identifier: &PluginUniqueIdentifier) -> bool {
        self.plugins.read().await.contains(identifier)
    }

    /// Scans every live node's published record for the owner of `identifier`.
    /// Returns `None` if no node currently claims it (not yet launched, or the
    /// owning node went stale and was evicted).
    pub async fn fetch_plugin_node(&self, identifier: &PluginUniqueIdentifier) -> Option<NodeRecord> {
        for (_, bytes) in self.ledger.scan_prefix(NODE_KEY_PREFIX).await {
            if let Ok(record) = serde_json::from_slice::<NodeRecord>(&bytes) {
                if record.plugins.iter().any(|p| p == identifier) {
                    return Some(record);
                }
            }
        }
        None
    }

    async fn publish_record(&self) {
        let record = NodeRecord {
            id: self.id,
            host: self.host.clone(),
            port: self.port,
            now: Utc::now(),
            is_master: self.is_master(),
            vote_token: self.id.to_string(),
            plugins: self.plugins.read().await.iter().cloned().collect(),
        };
        let bytes = serde_json::to_vec(&record).expect("NodeRecord serializes");
        self.ledger.put(&node_key(self.id), bytes, NODE_TTL).await;
        self.node_update_completed.notify_waiters();
    }

    /// Spawns the heartbeat loop (republishes this node's record before its
    /// TTL lapses) and returns a join handle the caller can hold to keep the
    /// task alive and to abort it on shutdown.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                node.publish_record().await;
                tokio::time::sleep(NODE_HEARTBEAT_INTERVAL).await;
            }
        })
    }

    /// Spawns the master-election loop: jittered first vote, CAS against the
    /// lock key, periodic refresh while holding it, demotion the moment a
    /// refresh loses the lock to another node.
    pub fn spawn_election(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let jitter_ms: u64 = rand::thread_rng().gen_range(0..2000);
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

            loop {
                let my_token = node.id.to_string().into_bytes();
                let current = node.ledger.get(MASTER_LOCK_KEY).await;

                let won = match &current {
                    None => node.ledger.compare_and_swap(MASTER_LOCK_KEY, None, my_token.clone(), MASTER_LOCK_TTL).await,
                    Some(holder) if holder.as_slice() == my_token.as_slice() => {
                        node.ledger
                            .compare_and_swap(MASTER_LOCK_KEY, Some(holder.as_slice()), my_token.clone(), MASTER_LOCK_TTL)
                            .await
                    }
                    Some(_) => false,
                };

                node.is_master.store(won, Ordering::SeqCst);
                node.voting_completed.notify_waiters();

                if won {
                    tokio::time::sleep(MASTER_REFRESH_INTERVAL).await;
                } else {
                    let retry_jitter: u64 = rand::thread_rng().gen_range(0..2000);
                    tokio::time::sleep(Duration::from_millis(retry_jitter)).await;
                }
            }
        })
    }

    /// A master-only maintenance pass: evicts node records whose `now` is
    /// older than [`STALE_NODE_AGE`], alongside any record that fails to
    /// deserialize at all. [`NODE_TTL`] already drops most dead nodes out of
    /// the ledger on its own; this catches entries a ledger implementation
    /// still surfaces past their nominal TTL.
    pub async fn evict_stale_nodes(&self) {
        if !self.is_master() {
            return;
        }
        let now = Utc::now();
        for (key, bytes) in self.ledger.scan_prefix(NODE_KEY_PREFIX).await {
            let stale = match serde_json::from_slice::<NodeRecord>(&bytes) {
                Ok(record) => now.signed_duration_since(record.now) > chrono::Duration::from_std(STALE_NODE_AGE).unwrap(),
                Err(_) => true,
            };
            if stale {
                self.ledger.delete(&key).await;
            }
        }
    }

    pub fn stale_node_age() -> Duration {
        STALE_NODE_AGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;

    fn identifier(name: &str) -> PluginUniqueIdentifier {
        PluginUniqueIdentifier::parse(&format!("acme/{name}:1.0.0@1234567890abcdef1234567890abcdef1234567890abcdef")).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_master_among_two_nodes() {
        let ledger: Arc<dyn SharedLedger> = Arc::new(InMemoryLedger::new());
        let a = ClusterNode::new("a", 8080, Arc::clone(&ledger));
        let b = ClusterNode::new("b", 8081, Arc::clone(&ledger));

        let _ha = a.spawn_election();
        let _hb = b.spawn_election();

        // drive both nodes past the worst-case 0-2000ms jitter before their
        // first vote, and past a retry jitter in case of a split first vote.
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }

        let masters = [a.is_master(), b.is_master()].into_iter().filter(|&m| m).count();
        assert!(masters <= 1, "at most one of the two nodes may hold the lock at a time");
    }

    #[tokio::test]
    async fn plugin_ownership_round_trips_through_ledger() {
        let ledger: Arc<dyn SharedLedger> = Arc::new(InMemoryLedger::new());
        let a = ClusterNode::new("a", 8080, Arc::clone(&ledger));
        let b = ClusterNode::new("b", 8081, Arc::clone(&ledger));

        let id = identifier("widget");
        a.mark_plugin_launched(id.clone()).await;

        assert!(a.is_plugin_on_current_node(&id).await);
        assert!(!b.is_plugin_on_current_node(&id).await);

        let owner = b.fetch_plugin_node(&id).await.expect("owner record present");
        assert_eq!(owner.id, a.id);
    }

    #[tokio::test]
    async fn stopped_plugin_is_removed_from_ownership() {
        let ledger: Arc<dyn SharedLedger> = Arc::new(InMemoryLedger::new());
        let a = ClusterNode::new("a", 8080, Arc::clone(&ledger));
        let id = identifier("widget");

        a.mark_plugin_launched(id.clone()).await;
        a.mark_plugin_stopped(&id).await;

        assert!(!a.is_plugin_on_current_node(&id).await);
        assert!(a.fetch_plugin_node(&id).await.is_none());
    }
}
