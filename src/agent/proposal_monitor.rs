//! Proposal monitor - votes on proposals as they become active
//!
//! Reads the `ProposalCreated` log from a cursor that starts at genesis for
//! each worker generation. New proposals that are already Active are voted
//! on at once; Pending ones join the pending set and are re-checked every
//! iteration until they turn Active.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::supervisor::Worker;
use super::{bounded, AgentContext, AgentError};
use crate::ledger::{EventCursor, ProposalId, ProposalState};

/// Reason attached to every automated vote
pub const AUTOMATED_VOTE_REASON: &str = "Automated vote";

pub struct ProposalMonitor {
    ctx: Arc<AgentContext>,
    cursor: EventCursor,
}

impl ProposalMonitor {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            ctx,
            cursor: EventCursor::GENESIS,
        }
    }

    pub fn cursor(&self) -> EventCursor {
        self.cursor
    }

    async fn state(&self, id: &ProposalId) -> Result<ProposalState, AgentError> {
        let governance = self.ctx.clients.governance.as_ref();
        Ok(bounded(self.ctx.timings.call_timeout, governance.state(id)).await?)
    }

    /// Vote with the current decision. On a transport failure the id goes
    /// (back) into the pending set so the vote is retried next iteration.
    async fn vote(&self, id: &ProposalId) {
        let stance = self.ctx.vote.current().await;
        match self
            .ctx
            .proposer
            .cast_vote(id, stance, AUTOMATED_VOTE_REASON)
            .await
        {
            Ok(_) => {
                self.ctx.book.remove_pending(id).await;
            }
            Err(e) => {
                warn!(proposal_id = %id, error = %e, "Vote failed, will retry");
                self.ctx.book.add_pending(id.clone()).await;
            }
        }
    }

    /// Handle a proposal seen for the first time
    async fn observe(&self, id: ProposalId) {
        match self.state(&id).await {
            Ok(ProposalState::Active) => self.vote(&id).await,
            Ok(ProposalState::Pending) => {
                if self.ctx.book.add_pending(id.clone()).await {
                    info!(proposal_id = %id, "Proposal pending, waiting for voting period");
                }
            }
            Ok(state) => debug!(proposal_id = %id, ?state, "Proposal no longer open"),
            Err(e) => {
                warn!(proposal_id = %id, error = %e, "Could not read proposal state, rechecking later");
                self.ctx.book.add_pending(id).await;
            }
        }
    }

    /// Re-check every pending proposal
    async fn sweep_pending(&self) {
        for id in self.ctx.book.pending().await {
            match self.state(&id).await {
                Ok(ProposalState::Active) => self.vote(&id).await,
                Ok(ProposalState::Pending) => {}
                Ok(state) => {
                    debug!(proposal_id = %id, ?state, "Pending proposal closed without voting period");
                    self.ctx.book.remove_pending(&id).await;
                }
                Err(e) => warn!(proposal_id = %id, error = %e, "Could not read proposal state"),
            }
        }
    }
}

#[async_trait]
impl Worker for ProposalMonitor {
    fn name(&self) -> &'static str {
        "proposal-monitor"
    }

    async fn iterate(&mut self) -> Result<(), AgentError> {
        let governance = self.ctx.clients.governance.clone();
        let batch = bounded(
            self.ctx.timings.call_timeout,
            governance.proposal_created(self.cursor),
        )
        .await?;

        if !batch.events.is_empty() {
            debug!(count = batch.events.len(), cursor = self.cursor.0, "New proposals");
        }
        self.cursor = batch.next;

        for event in batch.events {
            self.observe(event.proposal_id).await;
        }

        self.sweep_pending().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentClients, AgentTimings};
    use crate::config::{AgentConfig, ProposalRule};
    use crate::ledger::mock::MockLedger;
    use crate::ledger::{encode_store_call, ActionValue, Stance};
    use crate::telemetry::query::PromQlCompiler;
    use crate::telemetry::{QueryResult, TelemetryClient, TelemetryError};
    use std::collections::BTreeMap;

    struct NoTelemetry;

    #[async_trait]
    impl TelemetryClient for NoTelemetry {
        async fn query(&self, _query: &str) -> Result<QueryResult, TelemetryError> {
            Ok(QueryResult::default())
        }
    }

    fn setup() -> (Agent, Arc<MockLedger>) {
        let ledger = Arc::new(MockLedger::new(1));
        let config = AgentConfig {
            metric_index: "1".to_string(),
            rules: vec![ProposalRule {
                event: "cpu_high > 0".to_string(),
                message: "scale-up".to_string(),
                action_value: ActionValue(2),
                vote_condition: None,
            }],
            actions_map: BTreeMap::new(),
        };
        let clients = AgentClients {
            governance: ledger.clone(),
            store: ledger.clone(),
            telemetry: Arc::new(NoTelemetry),
            compiler: Arc::new(PromQlCompiler::default()),
        };
        (Agent::new("edge-1", config, clients, AgentTimings::default()), ledger)
    }

    #[tokio::test]
    async fn test_pending_then_active_gets_one_vote() {
        let (agent, ledger) = setup();
        let ctx = agent.context().clone();
        let id = ledger.insert_proposal(encode_store_call(ActionValue(2)), ProposalState::Pending);
        let mut monitor = ProposalMonitor::new(ctx.clone());

        monitor.iterate().await.unwrap();
        assert_eq!(ctx.book.pending().await, vec![id.clone()]);
        assert!(ledger.votes().is_empty());

        ledger.set_state(&id, ProposalState::Active);
        monitor.iterate().await.unwrap();
        monitor.iterate().await.unwrap();

        let votes = ledger.votes();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].proposal_id, id);
        assert_eq!(votes[0].stance, Stance::For);
        assert_eq!(votes[0].reason, "edge-1 Automated vote");
        assert!(ctx.book.pending().await.is_empty());
        assert!(ctx.book.has_voted(&id).await);
    }

    #[tokio::test]
    async fn test_active_on_discovery_voted_immediately() {
        let (agent, ledger) = setup();
        let ctx = agent.context().clone();
        ctx.vote.set(Stance::Against).await;
        let id = ledger.insert_proposal(encode_store_call(ActionValue(3)), ProposalState::Active);
        let mut monitor = ProposalMonitor::new(ctx.clone());

        monitor.iterate().await.unwrap();

        let votes = ledger.votes();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].proposal_id, id);
        assert_eq!(votes[0].stance, Stance::Against);
        assert_eq!(monitor.cursor(), EventCursor(1));
    }

    #[tokio::test]
    async fn test_closed_proposals_ignored() {
        let (agent, ledger) = setup();
        let ctx = agent.context().clone();
        let id = ledger.insert_proposal(encode_store_call(ActionValue(2)), ProposalState::Pending);
        let mut monitor = ProposalMonitor::new(ctx.clone());

        monitor.iterate().await.unwrap();
        ledger.set_state(&id, ProposalState::Canceled);
        monitor.iterate().await.unwrap();

        assert!(ctx.book.pending().await.is_empty());
        assert!(ledger.votes().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_vote_not_retried() {
        let (agent, ledger) = setup();
        let ctx = agent.context().clone();
        ledger.reject_votes(true);
        let id = ledger.insert_proposal(encode_store_call(ActionValue(2)), ProposalState::Active);
        let mut monitor = ProposalMonitor::new(ctx.clone());

        monitor.iterate().await.unwrap();
        monitor.iterate().await.unwrap();

        assert!(ctx.book.pending().await.is_empty());
        assert!(!ctx.book.has_voted(&id).await);
    }

    #[tokio::test]
    async fn test_log_unavailable_fails_iteration() {
        let (agent, ledger) = setup();
        ledger.set_unavailable(true);
        let mut monitor = ProposalMonitor::new(agent.context().clone());

        assert!(monitor.iterate().await.is_err());
        assert_eq!(monitor.cursor(), EventCursor::GENESIS);
    }
}
