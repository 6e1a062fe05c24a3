//! Fan-out of decoded source events into signed, content-addressed
//! [`RelayMessage`]s, one per enabled destination.

use alloy::primitives::{Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::ChainTarget;
use crate::listener::abi::parse_address;
use crate::types::{MessageStatus, RelayMessage, SourceEvent};
use crate::verify::PayloadSigner;
use crate::Result;

sol! {
    /// Entry points of the lending receiver deployed on every destination.
    /// The transaction calls `relay`, whose `body` is the calldata of one of
    /// the per-kind functions.
    interface ILendingReceiver {
        function relay(uint8 kind, string targetChain, string relayer, bytes body);

        function disburseLoan(
            uint256 loanId,
            address borrower,
            address merchant,
            uint256 amount,
            uint256 interestRate,
            uint256 duration,
            string borrowerDid,
            string merchantDid,
            uint64 timestamp
        );
        function approveLoan(uint256 loanId, uint8 status, address updatedBy, uint64 timestamp);
        function recordDisbursement(uint256 loanId, address merchant, uint256 amount, uint64 timestamp);
        function confirmRepayment(uint256 loanId, uint256 amount, uint256 totalRepaid, address payer, uint64 timestamp);
        function transferLiquidity(
            string fromPool,
            string toPool,
            string token,
            uint256 amount,
            string reason,
            uint64 timestamp
        );
        function updateCreditScore(string userDid, uint32 newScore, uint32 previousScore, string reason, uint64 timestamp);
    }
}

pub struct MessageFactory {
    signer: Arc<dyn PayloadSigner>,
    relayer_address: String,
}

impl MessageFactory {
    pub fn new(signer: Arc<dyn PayloadSigner>) -> Self {
        let relayer_address = signer.address();
        Self {
            signer,
            relayer_address,
        }
    }

    /// One message per enabled target. A target whose payload cannot be
    /// encoded or signed is logged and skipped.
    pub fn create_messages<'a>(
        &self,
        event: &SourceEvent,
        targets: impl IntoIterator<Item = &'a ChainTarget>,
    ) -> Vec<RelayMessage> {
        targets
            .into_iter()
            .filter(|target| target.enabled)
            .filter_map(|target| match self.create_message(event, target) {
                Ok(message) => Some(message),
                Err(e) => {
                    error!(
                        chain = %target.id,
                        event = event.name(),
                        error = %e,
                        "failed to create relay message"
                    );
                    None
                }
            })
            .collect()
    }

    pub fn create_message(&self, event: &SourceEvent, target: &ChainTarget) -> Result<RelayMessage> {
        let kind = event.message_kind();
        let payload = self.encode_payload(event, target)?;
        let signature = self.signer.sign(&payload)?;
        let id = message_id(&payload, &signature);

        debug!(message_id = %id, chain = %target.id, kind = %kind, "created relay message");

        Ok(RelayMessage {
            id,
            kind,
            target_chain: target.id.clone(),
            payload,
            signature,
            created_at: Utc::now(),
            retry_count: 0,
            status: MessageStatus::Pending,
            tx_hash: None,
            last_error: None,
        })
    }

    /// Target-specific payload bytes: `relay(...)` calldata for the
    /// receiver contract. Pure: depends only on the event, the target and the
    /// relayer address.
    pub fn encode_payload(&self, event: &SourceEvent, target: &ChainTarget) -> Result<Vec<u8>> {
        let body = match event {
            SourceEvent::LoanApproval(e) => ILendingReceiver::disburseLoanCall {
                loanId: U256::from(e.token_id),
                borrower: parse_address(&e.borrower)?,
                merchant: parse_address(&e.merchant)?,
                amount: U256::from(e.amount),
                interestRate: U256::from(e.interest_rate),
                duration: U256::from(e.duration),
                borrowerDid: e.borrower_did.clone(),
                merchantDid: e.merchant_did.clone(),
                timestamp: e.timestamp,
            }
            .abi_encode(),
            SourceEvent::LoanStatusUpdated(e) => ILendingReceiver::approveLoanCall {
                loanId: U256::from(e.token_id),
                status: e.status,
                updatedBy: parse_address(&e.updated_by)?,
                timestamp: e.timestamp,
            }
            .abi_encode(),
            SourceEvent::LoanDisbursement(e) => ILendingReceiver::recordDisbursementCall {
                loanId: U256::from(e.token_id),
                merchant: parse_address(&e.merchant)?,
                amount: U256::from(e.amount),
                timestamp: e.timestamp,
            }
            .abi_encode(),
            SourceEvent::Repayment(e) => ILendingReceiver::confirmRepaymentCall {
                loanId: U256::from(e.token_id),
                amount: U256::from(e.amount),
                totalRepaid: U256::from(e.total_repaid),
                payer: parse_address(&e.payer)?,
                timestamp: e.timestamp,
            }
            .abi_encode(),
            SourceEvent::LiquidityTransfer(e) => ILendingReceiver::transferLiquidityCall {
                fromPool: e.from_pool.clone(),
                toPool: e.to_pool.clone(),
                token: e.token.clone(),
                amount: U256::from(e.amount),
                reason: e.reason.clone(),
                timestamp: e.timestamp,
            }
            .abi_encode(),
            SourceEvent::CreditScoreUpdate(e) => ILendingReceiver::updateCreditScoreCall {
                userDid: e.user_did.clone(),
                newScore: e.new_score,
                previousScore: e.previous_score,
                reason: e.update_reason.clone(),
                timestamp: e.timestamp,
            }
            .abi_encode(),
        };

        Ok(ILendingReceiver::relayCall {
            kind: event.message_kind().tag(),
            targetChain: target.id.clone(),
            relayer: self.relayer_address.clone(),
            body: Bytes::from(body),
        }
        .abi_encode())
    }
}

/// Content address of a message: hex sha256 over `payload || signature`.
pub fn message_id(payload: &[u8], signature: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(signature);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_chain;
    use crate::types::{CreditScoreUpdateEvent, LoanApprovalEvent, MessageKind};
    use crate::Error;
    use crate::verify::{MockPayloadSigner, RelaySigner};
    use std::collections::HashSet;

    fn loan_approval() -> SourceEvent {
        SourceEvent::LoanApproval(LoanApprovalEvent {
            token_id: 7,
            borrower: "0x1234567890123456789012345678901234567890".to_string(),
            merchant: "0x0987654321098765432109876543210987654321".to_string(),
            amount: 1000,
            interest_rate: 1000,
            duration: 30,
            borrower_did: "did:hedera:test:123".to_string(),
            merchant_did: "did:hedera:test:456".to_string(),
            timestamp: 1_700_000_000,
        })
    }

    fn factory() -> MessageFactory {
        MessageFactory::new(Arc::new(RelaySigner::from_bytes(&[7u8; 32]).unwrap()))
    }

    #[test]
    fn test_message_id_is_reproducible() {
        let target = test_chain("ethereum", 12);
        let first = factory().create_message(&loan_approval(), &target).unwrap();
        let second = factory().create_message(&loan_approval(), &target).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.id, message_id(&first.payload, &first.signature));
        assert_eq!(first.kind, MessageKind::LoanDisbursement);
        assert_eq!(first.status, MessageStatus::Pending);
    }

    #[test]
    fn test_fan_out_one_message_per_enabled_target() {
        let mut solana = test_chain("solana", 1);
        solana.enabled = false;
        let targets = vec![test_chain("ethereum", 12), test_chain("base", 5), solana];

        let messages = factory().create_messages(&loan_approval(), &targets);
        assert_eq!(messages.len(), 2);

        let chains: HashSet<_> = messages.iter().map(|m| m.target_chain.as_str()).collect();
        let ids: HashSet<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(chains, HashSet::from(["ethereum", "base"]));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_disabling_target_leaves_others_unchanged() {
        let all = vec![test_chain("ethereum", 12), test_chain("base", 5)];
        let mut reduced = all.clone();
        reduced[1].enabled = false;

        let before = factory().create_messages(&loan_approval(), &all);
        let after = factory().create_messages(&loan_approval(), &reduced);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, before[0].id);
    }

    #[test]
    fn test_signing_failure_skips_only_that_target() {
        let mut signer = MockPayloadSigner::new();
        signer.expect_address().return_const("0xrelayer".to_string());
        let mut calls = 0;
        signer.expect_sign().returning(move |payload| {
            calls += 1;
            if calls == 1 {
                Err(Error::Authentication("hsm unavailable".to_string()))
            } else {
                Ok(payload[..4].to_vec())
            }
        });

        let factory = MessageFactory::new(Arc::new(signer));
        let targets = vec![test_chain("ethereum", 12), test_chain("base", 5)];
        let messages = factory.create_messages(&loan_approval(), &targets);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].target_chain, "base");
    }

    #[test]
    fn test_payload_is_receiver_calldata() {
        let target = test_chain("base", 5);
        let score = SourceEvent::CreditScoreUpdate(CreditScoreUpdateEvent {
            user_did: "did:hedera:test:123".to_string(),
            new_score: 720,
            previous_score: 690,
            update_reason: "on-time repayment".to_string(),
            timestamp: 1_700_000_000,
        });
        let factory = factory();
        let a = factory.encode_payload(&loan_approval(), &target).unwrap();
        let b = factory.encode_payload(&score, &target).unwrap();
        assert_ne!(a, b);
        assert_eq!(b[..4], ILendingReceiver::relayCall::SELECTOR);

        let relay = ILendingReceiver::relayCall::abi_decode(&b).unwrap();
        assert_eq!(relay.kind, MessageKind::CreditScoreUpdate.tag());
        assert_eq!(relay.targetChain, "base");
        let update = ILendingReceiver::updateCreditScoreCall::abi_decode(&relay.body).unwrap();
        assert_eq!(update.newScore, 720);
        assert_eq!(update.reason, "on-time repayment");
    }

    #[test]
    fn test_invalid_borrower_address_skips_message() {
        let mut event = loan_approval();
        if let SourceEvent::LoanApproval(e) = &mut event {
            e.borrower = "borrower-7".to_string();
        }
        let targets = vec![test_chain("ethereum", 12)];
        assert!(factory().create_messages(&event, &targets).is_empty());
        assert!(matches!(
            factory().create_message(&event, &targets[0]),
            Err(Error::Validation(_))
        ));
    }
}
