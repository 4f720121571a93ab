//! Value monitor - dispatches actions when the shared value changes
//!
//! The first successful read sets the baseline without dispatching. After
//! that, every change is dispatched to the endpoint mapped to the new value,
//! the baseline moves to the new value and the cooldown set is cleared.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::supervisor::Worker;
use super::{bounded, AgentContext, AgentError};
use crate::ledger::ActionValue;

pub struct ValueMonitor {
    ctx: Arc<AgentContext>,
    baseline: Option<ActionValue>,
}

impl ValueMonitor {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            ctx,
            baseline: None,
        }
    }

    pub fn baseline(&self) -> Option<ActionValue> {
        self.baseline
    }

    async fn read(&self) -> Result<ActionValue, AgentError> {
        let store = self.ctx.clients.store.as_ref();
        let value = bounded(self.ctx.timings.call_timeout, store.read()).await?;
        *self.ctx.last_value.write().await = Some(value);
        Ok(value)
    }

    /// POST the mapped action for `value`. Failures are logged only.
    async fn dispatch(&self, value: ActionValue) {
        let config = self.ctx.config.snapshot().await;
        let Some(action) = config.action_for(value) else {
            warn!(value = %value, "Action not defined for value, no action taken");
            return;
        };

        let response = self
            .ctx
            .http
            .post(&action.action_endpoint)
            .json(&action.args)
            .timeout(self.ctx.timings.dispatch_timeout)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                info!(
                    value = %value,
                    endpoint = %action.action_endpoint,
                    status = resp.status().as_u16(),
                    "Action dispatched"
                );
            }
            Ok(resp) => {
                warn!(
                    value = %value,
                    endpoint = %action.action_endpoint,
                    status = resp.status().as_u16(),
                    "Action endpoint returned error"
                );
            }
            Err(e) => {
                warn!(value = %value, endpoint = %action.action_endpoint, error = %e, "Action dispatch failed");
            }
        }
    }
}

#[async_trait]
impl Worker for ValueMonitor {
    fn name(&self) -> &'static str {
        "value-monitor"
    }

    async fn start(&mut self) {
        match self.read().await {
            Ok(value) => {
                debug!(value = %value, "Baseline value read");
                self.baseline = Some(value);
            }
            Err(e) => warn!(error = %e, "Could not read baseline value, retrying"),
        }
    }

    async fn iterate(&mut self) -> Result<(), AgentError> {
        let value = self.read().await?;

        match self.baseline {
            None => {
                debug!(value = %value, "Baseline value read");
                self.baseline = Some(value);
            }
            Some(previous) if previous == value => {
                debug!(value = %value, "No new value");
            }
            Some(previous) => {
                info!(from = %previous, to = %value, "Store value changed");
                self.dispatch(value).await;
                self.baseline = Some(value);
                self.ctx.book.clear_cooldown().await;
            }
        }

        Ok(())
    }
}
