//! Shared agent state
//!
//! Everything the workers share is behind its own lock: the operating
//! configuration, the vote decision, and the three proposal sets. Workers
//! never hold one of these locks across an external call.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::ledger::{ProposalId, Stance};

/// Holder of the operating configuration.
///
/// Readers take an `Arc` snapshot, so a replacement is never observed half
/// applied and becomes visible at the reader's next snapshot.
pub struct ConfigStore {
    config: RwLock<Arc<AgentConfig>>,
    book: Arc<ProposalBook>,
}

impl ConfigStore {
    pub fn new(config: AgentConfig, book: Arc<ProposalBook>) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            book,
        }
    }

    pub async fn snapshot(&self) -> Arc<AgentConfig> {
        self.config.read().await.clone()
    }

    /// Replace the configuration and clear the cooldown set
    pub async fn update(&self, config: AgentConfig) {
        let mut current = self.config.write().await;
        *current = Arc::new(config);
        self.book.clear_cooldown().await;

        info!(
            metric_index = %current.metric_index,
            rules = current.rules.len(),
            actions = current.actions_map.len(),
            "Configuration replaced, cooldowns cleared"
        );
    }
}

/// The agent's current voting stance, applied to every vote it casts
pub struct VoteDecision {
    stance: RwLock<Stance>,
}

impl VoteDecision {
    pub fn new(initial: Stance) -> Self {
        Self {
            stance: RwLock::new(initial),
        }
    }

    pub async fn current(&self) -> Stance {
        *self.stance.read().await
    }

    pub async fn set(&self, stance: Stance) {
        let mut current = self.stance.write().await;
        let previous = *current;
        *current = stance;
        if previous != stance {
            info!(from = %previous, to = %stance, "Vote decision changed");
        }
    }
}

impl Default for VoteDecision {
    fn default() -> Self {
        Self::new(Stance::For)
    }
}

/// Cooldown, pending and voted sets
#[derive(Default)]
pub struct ProposalBook {
    /// Messages whose proposal was found redundant this epoch
    cooldown: RwLock<BTreeSet<String>>,
    /// Proposals seen Pending and waiting to become Active
    pending: RwLock<BTreeSet<ProposalId>>,
    /// Proposals with a confirmed vote from this agent
    voted: RwLock<BTreeSet<ProposalId>>,
}

impl ProposalBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn in_cooldown(&self, message: &str) -> bool {
        self.cooldown.read().await.contains(message)
    }

    pub async fn add_cooldown(&self, message: &str) {
        if self.cooldown.write().await.insert(message.to_string()) {
            debug!(message, "Message placed on cooldown");
        }
    }

    pub async fn clear_cooldown(&self) {
        self.cooldown.write().await.clear();
    }

    pub async fn cooldown(&self) -> Vec<String> {
        self.cooldown.read().await.iter().cloned().collect()
    }

    /// Returns false if the id was already pending
    pub async fn add_pending(&self, id: ProposalId) -> bool {
        self.pending.write().await.insert(id)
    }

    pub async fn remove_pending(&self, id: &ProposalId) -> bool {
        self.pending.write().await.remove(id)
    }

    pub async fn pending(&self) -> Vec<ProposalId> {
        self.pending.read().await.iter().cloned().collect()
    }

    pub async fn record_vote(&self, id: ProposalId) {
        self.voted.write().await.insert(id);
    }

    pub async fn has_voted(&self, id: &ProposalId) -> bool {
        self.voted.read().await.contains(id)
    }

    pub async fn voted(&self) -> Vec<ProposalId> {
        self.voted.read().await.iter().cloned().collect()
    }
}
