//! Event bindings for the lending pool contract on the source ledger.
//!
//! Only `topics[0]` is used (the event signature hash); every parameter is
//! ABI-encoded in the log data.

use alloy::primitives::{keccak256, Address, LogData, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;

use crate::chain_adapter::RawLog;
use crate::types::{LoanApprovalEvent, LoanDisbursementEvent, LoanStatusUpdatedEvent, RepaymentEvent, SourceEvent};
use crate::{Error, Result};

sol! {
    interface ILendingPool {
        #[derive(Debug)]
        event LoanCreated(
            uint256 tokenId,
            address borrower,
            address merchant,
            uint256 amount,
            uint256 interestRate,
            uint256 duration,
            string borrowerDid,
            string merchantDid
        );

        #[derive(Debug)]
        event LoanStatusUpdated(uint256 tokenId, uint8 status, address updatedBy);

        #[derive(Debug)]
        event LoanDisbursed(uint256 tokenId, uint256 amount, address merchant);

        #[derive(Debug)]
        event RepaymentMade(uint256 tokenId, uint256 amount, uint256 totalRepaid, address payer);
    }
}

/// `0x`-prefixed keccak-256 of an event signature.
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
}

/// Decodes a raw log. `Ok(None)` means the topic is not one of ours.
pub fn decode_log(log: &RawLog) -> Result<Option<SourceEvent>> {
    let topics = log
        .topics
        .iter()
        .map(|topic| {
            topic
                .parse::<B256>()
                .map_err(|e| Error::Serialization(format!("invalid topic {}: {}", topic, e)))
        })
        .collect::<Result<Vec<_>>>()?;
    let data = LogData::new_unchecked(topics, log.data.clone().into());
    let timestamp = log.timestamp.unwrap_or_default();

    let event = match data.topics().first() {
        None => return Err(Error::Serialization("log has no topics".to_string())),
        Some(&ILendingPool::LoanCreated::SIGNATURE_HASH) => {
            let e = decode::<ILendingPool::LoanCreated>(&data)?;
            SourceEvent::LoanApproval(LoanApprovalEvent {
                token_id: to_u128(e.tokenId, "tokenId")?,
                borrower: address_string(e.borrower),
                merchant: address_string(e.merchant),
                amount: to_u128(e.amount, "amount")?,
                interest_rate: to_u128(e.interestRate, "interestRate")?,
                duration: to_u128(e.duration, "duration")?,
                borrower_did: e.borrowerDid,
                merchant_did: e.merchantDid,
                timestamp,
            })
        }
        Some(&ILendingPool::LoanStatusUpdated::SIGNATURE_HASH) => {
            let e = decode::<ILendingPool::LoanStatusUpdated>(&data)?;
            SourceEvent::LoanStatusUpdated(LoanStatusUpdatedEvent {
                token_id: to_u128(e.tokenId, "tokenId")?,
                status: e.status,
                updated_by: address_string(e.updatedBy),
                timestamp,
            })
        }
        Some(&ILendingPool::LoanDisbursed::SIGNATURE_HASH) => {
            let e = decode::<ILendingPool::LoanDisbursed>(&data)?;
            SourceEvent::LoanDisbursement(LoanDisbursementEvent {
                token_id: to_u128(e.tokenId, "tokenId")?,
                amount: to_u128(e.amount, "amount")?,
                merchant: address_string(e.merchant),
                timestamp,
            })
        }
        Some(&ILendingPool::RepaymentMade::SIGNATURE_HASH) => {
            let e = decode::<ILendingPool::RepaymentMade>(&data)?;
            SourceEvent::Repayment(RepaymentEvent {
                token_id: to_u128(e.tokenId, "tokenId")?,
                amount: to_u128(e.amount, "amount")?,
                total_repaid: to_u128(e.totalRepaid, "totalRepaid")?,
                payer: address_string(e.payer),
                timestamp,
            })
        }
        Some(_) => return Ok(None),
    };

    Ok(Some(event))
}

/// Encodes a ledger-originated event as the log the contract would emit.
/// Producer-only events have no log form and yield `None`.
pub fn encode_event(event: &SourceEvent, contract: &str) -> Result<Option<RawLog>> {
    let (topic, data, timestamp) = match event {
        SourceEvent::LoanApproval(e) => {
            let log = ILendingPool::LoanCreated {
                tokenId: U256::from(e.token_id),
                borrower: parse_address(&e.borrower)?,
                merchant: parse_address(&e.merchant)?,
                amount: U256::from(e.amount),
                interestRate: U256::from(e.interest_rate),
                duration: U256::from(e.duration),
                borrowerDid: e.borrower_did.clone(),
                merchantDid: e.merchant_did.clone(),
            };
            (ILendingPool::LoanCreated::SIGNATURE_HASH, log.encode_data(), e.timestamp)
        }
        SourceEvent::LoanStatusUpdated(e) => {
            let log = ILendingPool::LoanStatusUpdated {
                tokenId: U256::from(e.token_id),
                status: e.status,
                updatedBy: parse_address(&e.updated_by)?,
            };
            (ILendingPool::LoanStatusUpdated::SIGNATURE_HASH, log.encode_data(), e.timestamp)
        }
        SourceEvent::LoanDisbursement(e) => {
            let log = ILendingPool::LoanDisbursed {
                tokenId: U256::from(e.token_id),
                amount: U256::from(e.amount),
                merchant: parse_address(&e.merchant)?,
            };
            (ILendingPool::LoanDisbursed::SIGNATURE_HASH, log.encode_data(), e.timestamp)
        }
        SourceEvent::Repayment(e) => {
            let log = ILendingPool::RepaymentMade {
                tokenId: U256::from(e.token_id),
                amount: U256::from(e.amount),
                totalRepaid: U256::from(e.total_repaid),
                payer: parse_address(&e.payer)?,
            };
            (ILendingPool::RepaymentMade::SIGNATURE_HASH, log.encode_data(), e.timestamp)
        }
        SourceEvent::LiquidityTransfer(_) | SourceEvent::CreditScoreUpdate(_) => return Ok(None),
    };

    Ok(Some(RawLog {
        address: contract.to_string(),
        topics: vec![format!("0x{}", hex::encode(topic))],
        data,
        block_number: 0,
        transaction_hash: String::new(),
        log_index: 0,
        timestamp: Some(timestamp),
    }))
}

fn decode<E: SolEvent>(data: &LogData) -> Result<E> {
    E::decode_log_data(data).map_err(|e| Error::Serialization(format!("{}: {}", E::SIGNATURE, e)))
}

/// Amounts and ids are carried as `u128`; wider values are rejected.
fn to_u128(value: U256, field: &str) -> Result<u128> {
    u128::try_from(value).map_err(|_| Error::Serialization(format!("{} {} exceeds 128 bits", field, value)))
}

fn address_string(address: Address) -> String {
    format!("0x{}", hex::encode(address))
}

pub(crate) fn parse_address(address: &str) -> Result<Address> {
    address
        .parse::<Address>()
        .map_err(|e| Error::Validation(format!("invalid address {}: {}", address, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approval() -> SourceEvent {
        SourceEvent::LoanApproval(LoanApprovalEvent {
            token_id: 1,
            borrower: "0x1234567890123456789012345678901234567890".to_string(),
            merchant: "0x0987654321098765432109876543210987654321".to_string(),
            amount: 1000,
            interest_rate: 1000,
            duration: 30,
            borrower_did: "did:hedera:testnet:z6MkBorrower".to_string(),
            merchant_did: "did:hedera:testnet:z6MkMerchant".to_string(),
            timestamp: 1_700_000_000,
        })
    }

    #[test]
    fn test_topics_are_keccak_of_signature() {
        assert_eq!(
            event_topic("Transfer(address,address,uint256)"),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
        assert_eq!(
            event_topic(ILendingPool::LoanCreated::SIGNATURE),
            format!("0x{}", hex::encode(ILendingPool::LoanCreated::SIGNATURE_HASH))
        );
        assert_eq!(
            ILendingPool::RepaymentMade::SIGNATURE,
            "RepaymentMade(uint256,uint256,uint256,address)"
        );
    }

    #[test]
    fn test_loan_created_decodes_dynamic_strings() {
        let log = encode_event(&approval(), "0xaa").unwrap().unwrap();
        // 8 head words, two string tails of one length word plus one data word
        assert_eq!(log.data.len(), 8 * 32 + 2 * 64);
        assert_eq!(decode_log(&log).unwrap(), Some(approval()));
    }

    #[test]
    fn test_oversized_uint_rejected() {
        let mut log = encode_event(&approval(), "0xaa").unwrap().unwrap();
        log.data[0] = 1;
        assert!(matches!(decode_log(&log), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_truncated_data_rejected() {
        let mut log = encode_event(&approval(), "0xaa").unwrap().unwrap();
        log.data.truncate(100);
        assert!(matches!(decode_log(&log), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_invalid_address_rejected_on_encode() {
        let event = SourceEvent::LoanDisbursement(LoanDisbursementEvent {
            token_id: 1,
            amount: 10,
            merchant: "merchant-7".to_string(),
            timestamp: 0,
        });
        assert!(matches!(encode_event(&event, "0xaa"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_unknown_topic_and_producer_events() {
        let log = RawLog {
            address: "0xaa".to_string(),
            topics: vec![event_topic("Approval(address,address,uint256)")],
            data: vec![],
            block_number: 1,
            transaction_hash: "0x01".to_string(),
            log_index: 0,
            timestamp: None,
        };
        assert_eq!(decode_log(&log).unwrap(), None);

        let score = SourceEvent::CreditScoreUpdate(crate::types::CreditScoreUpdateEvent {
            user_did: "did:hedera:testnet:z6MkUser".to_string(),
            new_score: 700,
            previous_score: 650,
            update_reason: "repayment".to_string(),
            timestamp: 0,
        });
        assert_eq!(encode_event(&score, "0xaa").unwrap(), None);
    }

    #[test]
    fn test_status_update_round_trips_through_log() {
        let event = SourceEvent::LoanStatusUpdated(LoanStatusUpdatedEvent {
            token_id: 9,
            status: 2,
            updated_by: "0x1234567890123456789012345678901234567890".to_string(),
            timestamp: 5,
        });
        let log = encode_event(&event, "0xaa").unwrap().unwrap();
        assert_eq!(log.data.len(), 3 * 32);
        assert_eq!(decode_log(&log).unwrap(), Some(event));
    }
}
