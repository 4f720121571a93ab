//! HTTP ledger gateway client
//!
//! Talks JSON to a signing gateway that owns the agent's keys, nonces and
//! gas policy. The gateway exposes:
//!
//! - `POST /governance/proposals` - submit a proposal, returns `{tx_hash}`
//! - `POST /governance/votes` - cast a vote, returns `{tx_hash}`
//! - `GET /governance/proposals/{id}/state` - returns `{state}` (0-7)
//! - `GET /governance/events/proposal-created?from=N` - returns `{events, next}`
//! - `GET /store` - returns `{address, value}`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::*;

/// Gateway-backed [`GovernanceClient`] and [`ValueStore`]
pub struct LedgerGateway {
    client: Client,
    base_url: String,
    store_address: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ProposeRequest<'a> {
    targets: &'a [String],
    values: &'a [u64],
    calldatas: &'a [CallData],
    description: &'a str,
}

#[derive(Debug, Serialize)]
struct VoteRequest<'a> {
    proposal_id: &'a ProposalId,
    support: u8,
    reason: &'a str,
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: u8,
}

#[derive(Debug, Deserialize)]
struct StoreResponse {
    #[serde(default)]
    address: Option<String>,
    value: ActionValue,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

impl LedgerGateway {
    /// Create a client; `store_address` is the proposal target for value updates
    pub fn new(
        base_url: impl Into<String>,
        store_address: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store_address: store_address.into(),
            timeout,
        }
    }

    /// Create a client and learn the value-store address from the gateway
    pub async fn connect(base_url: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let mut gateway = Self::new(base_url, String::new(), timeout);
        let store: StoreResponse = gateway.get_json("/store").await?;
        gateway.store_address = store.address.ok_or_else(|| {
            LedgerError::InvalidResponse("gateway did not report a store address".to_string())
        })?;
        Ok(gateway)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_send_error(&self, e: reqwest::Error) -> LedgerError {
        if e.is_timeout() {
            LedgerError::Timeout(self.timeout.as_secs())
        } else {
            LedgerError::Network(e.to_string())
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, LedgerError> {
        let response = self
            .client
            .get(self.url(path))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(LedgerError::InvalidResponse(format!(
                "GET {} returned HTTP {}",
                path,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))
    }

    async fn submit<B: Serialize>(&self, path: &str, body: &B) -> Result<TxReceipt, LedgerError> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let response = check_submission(response).await?;

        response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))
    }
}

/// Client errors mean the ledger refused the transaction; anything else
/// non-2xx is a gateway fault.
async fn check_submission(response: Response) -> Result<Response, LedgerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or(text);

    if status.is_client_error() && status != StatusCode::NOT_FOUND {
        Err(LedgerError::Rejected(message))
    } else {
        Err(LedgerError::InvalidResponse(format!(
            "HTTP {}: {}",
            status, message
        )))
    }
}

#[async_trait]
impl GovernanceClient for LedgerGateway {
    async fn propose(
        &self,
        targets: Vec<String>,
        values: Vec<u64>,
        calldatas: Vec<CallData>,
        description: String,
    ) -> Result<TxReceipt, LedgerError> {
        debug!(description = %description, "Submitting proposal");
        self.submit(
            "/governance/proposals",
            &ProposeRequest {
                targets: &targets,
                values: &values,
                calldatas: &calldatas,
                description: &description,
            },
        )
        .await
    }

    async fn cast_vote(
        &self,
        proposal_id: &ProposalId,
        stance: Stance,
        reason: String,
    ) -> Result<TxReceipt, LedgerError> {
        debug!(proposal_id = %proposal_id, stance = %stance, "Submitting vote");
        self.submit(
            "/governance/votes",
            &VoteRequest {
                proposal_id,
                support: stance.support_code(),
                reason: &reason,
            },
        )
        .await
    }

    async fn state(&self, proposal_id: &ProposalId) -> Result<ProposalState, LedgerError> {
        let response: StateResponse = self
            .get_json(&format!("/governance/proposals/{}/state", proposal_id))
            .await?;
        ProposalState::from_code(response.state)
    }

    async fn proposal_created(&self, from: EventCursor) -> Result<EventBatch, LedgerError> {
        self.get_json(&format!("/governance/events/proposal-created?from={}", from.0))
            .await
    }
}

#[async_trait]
impl ValueStore for LedgerGateway {
    fn address(&self) -> &str {
        &self.store_address
    }

    async fn read(&self) -> Result<ActionValue, LedgerError> {
        let store: StoreResponse = self.get_json("/store").await?;
        Ok(store.value)
    }
}
