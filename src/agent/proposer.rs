//! Proposer - proposal creation, deduplication and vote casting
//!
//! Creation is guarded by a scan of live proposals: if a `Pending` or
//! `Active` proposal already carries the same call payload, the request is
//! reported as redundant and its message goes on cooldown. The scan keeps a
//! cursor into the `ProposalCreated` log and an index of proposals that may
//! still be live, so each check only reads new events plus the states of
//! the proposals it still tracks.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::bounded;
use super::state::ProposalBook;
use crate::ledger::{
    ActionValue, CallData, EventCursor, GovernanceClient, LedgerError, ProposalId, Stance,
    ValueStore,
};

/// Result of a proposal creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProposalOutcome {
    /// Proposal submitted
    Created {
        device_name: String,
        description: String,
        tx_hash: String,
    },
    /// A live proposal with the same payload exists; nothing submitted
    Redundant { message: String },
}

/// Result of a vote request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteOutcome {
    pub device_name: String,
    pub proposal_id: ProposalId,
    pub stance: Stance,
    /// Whether the vote was confirmed and added to the voted set
    pub recorded: bool,
}

/// Index of proposals that may still be live, fed from the event log
#[derive(Debug, Default)]
pub struct ProposalIndex {
    cursor: EventCursor,
    /// In log order; entries leave once observed outside Pending/Active
    tracked: Vec<(ProposalId, Option<CallData>)>,
}

impl ProposalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> EventCursor {
        self.cursor
    }

    pub fn tracked(&self) -> usize {
        self.tracked.len()
    }

    async fn sync(
        &mut self,
        governance: &dyn GovernanceClient,
        timeout: Duration,
    ) -> Result<(), LedgerError> {
        let batch = bounded(timeout, governance.proposal_created(self.cursor)).await?;
        for event in batch.events {
            let payload = event.primary_calldata().cloned();
            self.tracked.push((event.proposal_id, payload));
        }
        self.cursor = batch.next;
        Ok(())
    }

    /// Whether a Pending or Active proposal carries `payload`.
    ///
    /// Scans most recent first and stops at the first match. Proposals seen
    /// in any other state can never become live again and are dropped. A
    /// state read failure only fails the check for a proposal carrying the
    /// same payload.
    pub async fn similar_active(
        &mut self,
        governance: &dyn GovernanceClient,
        payload: &CallData,
        timeout: Duration,
    ) -> Result<bool, LedgerError> {
        self.sync(governance, timeout).await?;

        let mut expired = Vec::new();
        let mut found = false;

        for (id, calldata) in self.tracked.iter().rev() {
            let same_payload = calldata.as_ref() == Some(payload);
            let state = match bounded(timeout, governance.state(id)).await {
                Ok(state) => state,
                // Unrelated proposals only matter for pruning
                Err(e) if !same_payload => {
                    warn!(proposal_id = %id, error = %e, "Skipping proposal with unreadable state");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !state.is_live() {
                expired.push(id.clone());
                continue;
            }
            if same_payload {
                debug!(proposal_id = %id, state = ?state, "Found live proposal with same payload");
                found = true;
                break;
            }
        }

        if !expired.is_empty() {
            self.tracked.retain(|(id, _)| !expired.contains(id));
        }

        Ok(found)
    }
}

/// Creates proposals and casts votes on behalf of the agent
pub struct Proposer {
    device_name: String,
    governance: Arc<dyn GovernanceClient>,
    store: Arc<dyn ValueStore>,
    book: Arc<ProposalBook>,
    index: Mutex<ProposalIndex>,
    call_timeout: Duration,
}

impl Proposer {
    pub fn new(
        device_name: String,
        governance: Arc<dyn GovernanceClient>,
        store: Arc<dyn ValueStore>,
        book: Arc<ProposalBook>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            device_name,
            governance,
            store,
            book,
            index: Mutex::new(ProposalIndex::new()),
            call_timeout,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Whether `proposed` differs from the value currently in the store
    pub async fn change_detected(&self, proposed: ActionValue) -> Result<bool, LedgerError> {
        let current = bounded(self.call_timeout, self.store.read()).await?;
        Ok(current != proposed)
    }

    /// Dedup check on its own, as used by [`Proposer::create_proposal`]
    pub async fn similar_active(&self, payload: &CallData) -> Result<bool, LedgerError> {
        self.index
            .lock()
            .await
            .similar_active(self.governance.as_ref(), payload, self.call_timeout)
            .await
    }

    /// Propose setting the store to `action`, unless an equivalent live
    /// proposal exists.
    pub async fn create_proposal(
        &self,
        action: ActionValue,
        message: &str,
    ) -> Result<ProposalOutcome, LedgerError> {
        let payload = self.store.encode_update(action);

        // Held through submission so concurrent callers cannot both pass the check
        let mut index = self.index.lock().await;

        if index
            .similar_active(self.governance.as_ref(), &payload, self.call_timeout)
            .await?
        {
            self.book.add_cooldown(message).await;
            info!(message, action = %action, "Similar Pending/Active proposal already exists");
            return Ok(ProposalOutcome::Redundant {
                message: message.to_string(),
            });
        }

        let description = format!("{} {}-{}", self.device_name, message, now());

        let receipt = bounded(
            self.call_timeout,
            self.governance.propose(
                vec![self.store.address().to_string()],
                vec![0],
                vec![payload],
                description.clone(),
            ),
        )
        .await?;

        drop(index);

        info!(
            action = %action,
            description = %description,
            tx_hash = %receipt.tx_hash,
            "Proposal created"
        );

        Ok(ProposalOutcome::Created {
            device_name: self.device_name.clone(),
            description,
            tx_hash: receipt.tx_hash,
        })
    }

    /// Cast a vote.
    ///
    /// A ledger rejection is logged and reported with `recorded: false`;
    /// only a confirmed vote enters the voted set. Transport failures are
    /// returned to the caller.
    pub async fn cast_vote(
        &self,
        proposal_id: &ProposalId,
        stance: Stance,
        reason: &str,
    ) -> Result<VoteOutcome, LedgerError> {
        let reason = format!("{} {}", self.device_name, reason);
        let submitted = bounded(
            self.call_timeout,
            self.governance.cast_vote(proposal_id, stance, reason),
        )
        .await;

        let recorded = match submitted {
            Ok(receipt) => {
                self.book.record_vote(proposal_id.clone()).await;
                info!(
                    proposal_id = %proposal_id,
                    stance = %stance,
                    tx_hash = %receipt.tx_hash,
                    "Vote submitted"
                );
                true
            }
            Err(LedgerError::Rejected(e)) => {
                warn!(proposal_id = %proposal_id, error = %e, "Vote rejected by ledger");
                false
            }
            Err(e) => return Err(e),
        };

        Ok(VoteOutcome {
            device_name: self.device_name.clone(),
            proposal_id: proposal_id.clone(),
            stance,
            recorded,
        })
    }
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
