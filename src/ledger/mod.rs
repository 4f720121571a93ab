//! Ledger - governance and value-store collaborators
//!
//! The agent never signs or submits transactions itself. It talks to two
//! black-box clients:
//!
//! - [`GovernanceClient`]: propose, vote, read proposal state, and page
//!   through the append-only `ProposalCreated` event log
//! - [`ValueStore`]: read the shared decision value and encode calls that
//!   would update it
//!
//! [`gateway::LedgerGateway`] implements both over HTTP; [`mock::MockLedger`]
//! is an in-memory ledger for tests.

pub mod gateway;
pub mod mock;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ledger-assigned proposal identifier.
///
/// Governor ids are 256-bit hashes, so they travel as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(String);

impl ProposalId {
    pub fn new(id: impl Into<String>) -> Self {
        ProposalId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for ProposalId {
    fn from(id: u64) -> Self {
        ProposalId(id.to_string())
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Function selector of `store(uint256)` on the value-store contract
pub const STORE_SELECTOR: &str = "6057361d";

/// Errors raised by ledger collaborators
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Ledger call timed out after {0}s")]
    Timeout(u64),

    /// The ledger refused the transaction (reverted, invalid state, ...)
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Unknown proposal state code {0}")]
    UnknownState(u8),
}

//=============================================================================
// PROPOSAL LIFECYCLE
//=============================================================================

/// Proposal lifecycle state as reported by the governor contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalState {
    Pending,
    Active,
    Canceled,
    Defeated,
    Succeeded,
    Queued,
    Expired,
    Executed,
}

impl ProposalState {
    /// Decode the contract's `state(uint256)` return code
    pub fn from_code(code: u8) -> Result<Self, LedgerError> {
        match code {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Active),
            2 => Ok(Self::Canceled),
            3 => Ok(Self::Defeated),
            4 => Ok(Self::Succeeded),
            5 => Ok(Self::Queued),
            6 => Ok(Self::Expired),
            7 => Ok(Self::Executed),
            other => Err(LedgerError::UnknownState(other)),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Active => 1,
            Self::Canceled => 2,
            Self::Defeated => 3,
            Self::Succeeded => 4,
            Self::Queued => 5,
            Self::Expired => 6,
            Self::Executed => 7,
        }
    }

    /// Pending or Active: the proposal can still be voted into effect
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::Defeated | Self::Succeeded | Self::Expired | Self::Executed
        )
    }
}

//=============================================================================
// VOTING
//=============================================================================

/// The agent's voting stance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    For,
    Against,
}

impl Stance {
    /// Governor `support` code (0 = Against, 1 = For)
    pub fn support_code(self) -> u8 {
        match self {
            Self::Against => 0,
            Self::For => 1,
        }
    }
}

impl fmt::Display for Stance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::For => write!(f, "for"),
            Self::Against => write!(f, "against"),
        }
    }
}

//=============================================================================
// VALUES AND CALL DATA
//=============================================================================

/// A value of the shared decision store.
///
/// Serialized as a number; deserializes from either a number or a numeric
/// string since configuration files use both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionValue(pub u64);

impl fmt::Display for ActionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ActionValue {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(ActionValue)
    }
}

impl Serialize for ActionValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ActionValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(ActionValue(n)),
            Raw::Text(s) => s.parse().map_err(|_| {
                serde::de::Error::custom(format!("invalid action value '{}'", s))
            }),
        }
    }
}

/// Hex-encoded call payload (`0x`-prefixed, lower case)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CallData(String);

impl From<String> for CallData {
    fn from(hex: String) -> Self {
        CallData::new(hex)
    }
}

impl From<CallData> for String {
    fn from(data: CallData) -> Self {
        data.0
    }
}

impl CallData {
    /// Normalize a hex payload so payloads from different sources compare equal
    pub fn new(hex: impl AsRef<str>) -> Self {
        let hex = hex.as_ref().trim();
        let body = hex
            .strip_prefix("0x")
            .or_else(|| hex.strip_prefix("0X"))
            .unwrap_or(hex);
        CallData(format!("0x{}", body.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ABI-encode a `store(uint256)` call
pub fn encode_store_call(value: ActionValue) -> CallData {
    CallData(format!("0x{}{:064x}", STORE_SELECTOR, value.0))
}

//=============================================================================
// EVENTS
//=============================================================================

/// Position in the `ProposalCreated` event log; `EventCursor::GENESIS` is
/// the start of the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventCursor(pub u64);

impl EventCursor {
    pub const GENESIS: EventCursor = EventCursor(0);
}

/// A `ProposalCreated` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalCreated {
    pub proposal_id: ProposalId,
    pub calldatas: Vec<CallData>,
    #[serde(default)]
    pub description: String,
}

impl ProposalCreated {
    /// The payload compared for deduplication (first call of the proposal)
    pub fn primary_calldata(&self) -> Option<&CallData> {
        self.calldatas.first()
    }
}

/// A page of events and the cursor to resume from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<ProposalCreated>,
    pub next: EventCursor,
}

/// Receipt of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: String,
}

//=============================================================================
// COLLABORATOR TRAITS
//=============================================================================

/// Governance contract client
#[async_trait]
pub trait GovernanceClient: Send + Sync {
    /// Submit a new proposal and wait for its receipt
    async fn propose(
        &self,
        targets: Vec<String>,
        values: Vec<u64>,
        calldatas: Vec<CallData>,
        description: String,
    ) -> Result<TxReceipt, LedgerError>;

    /// Cast a vote with a free-text reason
    async fn cast_vote(
        &self,
        proposal_id: &ProposalId,
        stance: Stance,
        reason: String,
    ) -> Result<TxReceipt, LedgerError>;

    /// Current lifecycle state of a proposal
    async fn state(&self, proposal_id: &ProposalId) -> Result<ProposalState, LedgerError>;

    /// `ProposalCreated` events at or after `from`
    async fn proposal_created(&self, from: EventCursor) -> Result<EventBatch, LedgerError>;
}

/// Shared decision value store
#[async_trait]
pub trait ValueStore: Send + Sync {
    /// Contract address used as the proposal target
    fn address(&self) -> &str;

    /// Current value
    async fn read(&self) -> Result<ActionValue, LedgerError>;

    /// Call payload that would set the store to `value`
    fn encode_update(&self, value: ActionValue) -> CallData {
        encode_store_call(value)
    }
}
