//! Metrics monitor - evaluates proposal rules against telemetry
//!
//! For every rule, each iteration:
//!
//! 1. runs the trigger query; if it fires, the message is not on cooldown
//!    and the store does not already hold the rule's value, a proposal is
//!    created
//! 2. runs the vote-condition query (if any) and updates the vote decision
//!
//! A telemetry failure skips the rest of that rule for this iteration.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::supervisor::Worker;
use super::{AgentContext, AgentError};
use crate::telemetry::query::{bind_identity, CompiledRule};
use crate::telemetry::{parse_vote_token, QueryResult, TelemetryError};

pub struct MetricsMonitor {
    ctx: Arc<AgentContext>,
}

impl MetricsMonitor {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    async fn query(&self, compiled: &str) -> Result<QueryResult, TelemetryError> {
        let query = bind_identity(compiled, &self.ctx.device_name);
        let limit = self.ctx.timings.call_timeout;
        match tokio::time::timeout(limit, self.ctx.clients.telemetry.query(&query)).await {
            Ok(result) => result,
            Err(_) => Err(TelemetryError::Timeout(limit.as_secs())),
        }
    }

    /// Trigger half of a rule
    async fn check_trigger(&self, rule: &CompiledRule) -> Result<(), AgentError> {
        let result = self.query(&rule.trigger_query).await?;
        if !result.fired()? {
            return Ok(());
        }

        if self.ctx.book.in_cooldown(&rule.message).await {
            debug!(message = %rule.message, "Rule fired but message is on cooldown");
            return Ok(());
        }

        let proposer = &self.ctx.proposer;
        if !proposer.change_detected(rule.action_value).await? {
            debug!(message = %rule.message, action = %rule.action_value, "No proposal needed");
            return Ok(());
        }

        proposer
            .create_proposal(rule.action_value, &rule.message)
            .await?;
        Ok(())
    }

    /// Vote-condition half of a rule
    async fn check_vote(&self, rule: &CompiledRule) -> Result<(), TelemetryError> {
        let Some(vote_query) = &rule.vote_query else {
            return Ok(());
        };

        let result = self.query(vote_query).await?;
        match result.first_value() {
            None => debug!(message = %rule.message, "Vote condition returned no data"),
            Some(token) => match parse_vote_token(token) {
                Some(stance) => self.ctx.vote.set(stance).await,
                None => warn!(message = %rule.message, token, "Malformed vote token, decision unchanged"),
            },
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for MetricsMonitor {
    fn name(&self) -> &'static str {
        "metrics-monitor"
    }

    async fn iterate(&mut self) -> Result<(), AgentError> {
        let config = self.ctx.config.snapshot().await;
        let compiler = self.ctx.clients.compiler.clone();

        for rule in &config.rules {
            let compiled = match CompiledRule::compile(compiler.as_ref(), &config.metric_index, rule) {
                Ok(compiled) => compiled,
                Err(e) => {
                    warn!(message = %rule.message, error = %e, "Rule does not compile, skipping");
                    continue;
                }
            };

            match self.check_trigger(&compiled).await {
                Ok(()) => {}
                Err(AgentError::Telemetry(e)) => {
                    warn!(message = %compiled.message, error = %e, "Trigger query failed, skipping rule");
                    continue;
                }
                Err(e) => {
                    warn!(message = %compiled.message, error = %e, "Proposal attempt failed");
                }
            }

            if let Err(e) = self.check_vote(&compiled).await {
                warn!(message = %compiled.message, error = %e, "Vote condition query failed");
            }
        }

        Ok(())
    }
}
