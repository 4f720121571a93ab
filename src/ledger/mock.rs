//! In-memory ledger for testing.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use super::*;

/// A vote recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedVote {
    pub proposal_id: ProposalId,
    pub stance: Stance,
    pub reason: String,
}

/// Mock governor + value store.
///
/// Proposals created through [`GovernanceClient::propose`] start `Pending`;
/// tests drive the lifecycle with [`MockLedger::set_state`].
pub struct MockLedger {
    address: String,
    log: Mutex<Vec<ProposalCreated>>,
    states: Mutex<HashMap<ProposalId, ProposalState>>,
    broken_states: Mutex<HashSet<ProposalId>>,
    votes: Mutex<Vec<RecordedVote>>,
    value: AtomicU64,
    next_id: AtomicU64,
    propose_count: AtomicU32,
    state_calls: AtomicU32,
    reject_votes: AtomicBool,
    unavailable: AtomicBool,
}

impl MockLedger {
    pub fn new(initial_value: u64) -> Self {
        Self {
            address: "0x0000000000000000000000000000000000000b0c".to_string(),
            log: Mutex::new(Vec::new()),
            states: Mutex::new(HashMap::new()),
            broken_states: Mutex::new(HashSet::new()),
            votes: Mutex::new(Vec::new()),
            value: AtomicU64::new(initial_value),
            next_id: AtomicU64::new(1),
            propose_count: AtomicU32::new(0),
            state_calls: AtomicU32::new(0),
            reject_votes: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Append a proposal raised by someone else
    pub fn insert_proposal(&self, calldata: CallData, state: ProposalState) -> ProposalId {
        let id = ProposalId::from(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.log.lock().unwrap().push(ProposalCreated {
            proposal_id: id.clone(),
            calldatas: vec![calldata],
            description: "peer proposal".to_string(),
        });
        self.states.lock().unwrap().insert(id.clone(), state);
        id
    }

    pub fn set_state(&self, id: &ProposalId, state: ProposalState) {
        self.states.lock().unwrap().insert(id.clone(), state);
    }

    /// Make `state` for `id` report an undecodable state code
    pub fn break_state(&self, id: &ProposalId) {
        self.broken_states.lock().unwrap().insert(id.clone());
    }

    pub fn set_value(&self, value: u64) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Make `cast_vote` fail with [`LedgerError::Rejected`]
    pub fn reject_votes(&self, reject: bool) {
        self.reject_votes.store(reject, Ordering::SeqCst);
    }

    /// Make every call fail with [`LedgerError::Network`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn propose_count(&self) -> u32 {
        self.propose_count.load(Ordering::SeqCst)
    }

    pub fn state_calls(&self) -> u32 {
        self.state_calls.load(Ordering::SeqCst)
    }

    pub fn votes(&self) -> Vec<RecordedVote> {
        self.votes.lock().unwrap().clone()
    }

    pub fn proposals(&self) -> Vec<ProposalCreated> {
        self.log.lock().unwrap().clone()
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LedgerError::Network("mock ledger unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl GovernanceClient for MockLedger {
    async fn propose(
        &self,
        _targets: Vec<String>,
        _values: Vec<u64>,
        calldatas: Vec<CallData>,
        description: String,
    ) -> Result<TxReceipt, LedgerError> {
        self.check_available()?;
        self.propose_count.fetch_add(1, Ordering::SeqCst);

        let id = ProposalId::from(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.log.lock().unwrap().push(ProposalCreated {
            proposal_id: id.clone(),
            calldatas,
            description,
        });
        self.states
            .lock()
            .unwrap()
            .insert(id.clone(), ProposalState::Pending);

        Ok(TxReceipt {
            tx_hash: format!("0xpropose{}", id),
        })
    }

    async fn cast_vote(
        &self,
        proposal_id: &ProposalId,
        stance: Stance,
        reason: String,
    ) -> Result<TxReceipt, LedgerError> {
        self.check_available()?;
        if self.reject_votes.load(Ordering::SeqCst) {
            return Err(LedgerError::Rejected(
                "Governor: vote not currently active".to_string(),
            ));
        }

        self.votes.lock().unwrap().push(RecordedVote {
            proposal_id: proposal_id.clone(),
            stance,
            reason,
        });

        Ok(TxReceipt {
            tx_hash: format!("0xvote{}", proposal_id),
        })
    }

    async fn state(&self, proposal_id: &ProposalId) -> Result<ProposalState, LedgerError> {
        self.check_available()?;
        self.state_calls.fetch_add(1, Ordering::SeqCst);
        if self.broken_states.lock().unwrap().contains(proposal_id) {
            return Err(LedgerError::UnknownState(9));
        }

        self.states
            .lock()
            .unwrap()
            .get(proposal_id)
            .copied()
            .ok_or_else(|| LedgerError::InvalidResponse(format!("unknown proposal {}", proposal_id)))
    }

    async fn proposal_created(&self, from: EventCursor) -> Result<EventBatch, LedgerError> {
        self.check_available()?;
        let log = self.log.lock().unwrap();
        let start = (from.0 as usize).min(log.len());

        Ok(EventBatch {
            events: log[start..].to_vec(),
            next: EventCursor(log.len() as u64),
        })
    }
}

#[async_trait]
impl ValueStore for MockLedger {
    fn address(&self) -> &str {
        &self.address
    }

    async fn read(&self) -> Result<ActionValue, LedgerError> {
        self.check_available()?;
        Ok(ActionValue(self.value.load(Ordering::SeqCst)))
    }
}
