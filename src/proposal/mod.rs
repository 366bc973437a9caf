//! Destination-chain proposals
//!
//! A proposal is the destination side of a deposit. Relayers vote on it
//! until it passes, then one of them executes it. Status lives entirely in
//! the bridge contract and is only ever read, never tracked locally.

pub mod bridge;
pub mod relay;

pub use bridge::{Bridge, EvmBridge};
pub use relay::{ProposalRelay, RetryPolicy};

#[cfg(test)]
pub use bridge::MockBridge;

use crate::error::{RelayerError, RelayerResult};
use crate::events::keccak256;
use crate::message::codec::encode_payload;
use crate::message::{DepositNonce, DomainId, Message, ResourceId};

use ethers::types::{Address, H256};
use std::fmt;

/// On-chain proposal status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    Inactive,
    Active,
    Passed,
    Executed,
    Cancelled,
}

impl ProposalStatus {
    /// No more votes are needed
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Passed | ProposalStatus::Executed | ProposalStatus::Cancelled
        )
    }

    /// Nothing is left to do on-chain
    pub fn is_finalized(&self) -> bool {
        matches!(self, ProposalStatus::Executed | ProposalStatus::Cancelled)
    }
}

impl TryFrom<u8> for ProposalStatus {
    type Error = RelayerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProposalStatus::Inactive),
            1 => Ok(ProposalStatus::Active),
            2 => Ok(ProposalStatus::Passed),
            3 => Ok(ProposalStatus::Executed),
            4 => Ok(ProposalStatus::Cancelled),
            other => Err(RelayerError::Contract(format!(
                "unknown proposal status {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProposalStatus::Inactive => "inactive",
            ProposalStatus::Active => "active",
            ProposalStatus::Passed => "passed",
            ProposalStatus::Executed => "executed",
            ProposalStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A message prepared for voting on its destination chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub source: DomainId,
    pub destination: DomainId,
    pub deposit_nonce: DepositNonce,
    pub resource_id: ResourceId,
    /// Handler calldata without the priority extension
    pub data: Vec<u8>,
    pub handler_address: Address,
    pub priority: Option<u8>,
}

impl Proposal {
    /// Build a proposal for `message`, targeting `handler_address`
    pub fn from_message(message: &Message, handler_address: Address) -> RelayerResult<Self> {
        let data = encode_payload(message.transfer_type, &message.payload)?;

        Ok(Self {
            source: message.source,
            destination: message.destination,
            deposit_nonce: message.deposit_nonce,
            resource_id: message.resource_id,
            data,
            handler_address,
            priority: message.priority(),
        })
    }

    /// `keccak256(handler ‖ data)`, the key the bridge stores votes under
    pub fn data_hash(&self) -> H256 {
        let mut preimage = Vec::with_capacity(20 + self.data.len());
        preimage.extend_from_slice(self.handler_address.as_bytes());
        preimage.extend_from_slice(&self.data);
        H256::from(keccak256(&preimage))
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{} nonce {}",
            self.source, self.destination, self.deposit_nonce
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::message::{Metadata, TransferType};
    use ethers::abi::AbiEncode;
    use ethers::types::U256;

    pub(crate) fn proposal() -> Proposal {
        Proposal {
            source: 1,
            destination: 2,
            deposit_nonce: 42,
            resource_id: ResourceId([7; 32]),
            data: vec![0xaa; 84],
            handler_address: Address::repeat_byte(0x0d),
            priority: None,
        }
    }

    #[test]
    fn status_from_contract_value() {
        assert_eq!(ProposalStatus::try_from(2).unwrap(), ProposalStatus::Passed);
        assert_eq!(ProposalStatus::try_from(4).unwrap(), ProposalStatus::Cancelled);
        assert!(ProposalStatus::try_from(5).is_err());
    }

    #[test]
    fn completion_and_finality() {
        assert!(!ProposalStatus::Active.is_complete());
        assert!(ProposalStatus::Passed.is_complete());
        assert!(!ProposalStatus::Passed.is_finalized());
        assert!(ProposalStatus::Executed.is_finalized());
        assert!(ProposalStatus::Cancelled.is_finalized());
    }

    #[test]
    fn proposal_data_drops_priority() {
        let message = Message::new(
            1,
            2,
            9,
            ResourceId([1; 32]),
            TransferType::Fungible,
            vec![U256::from(1_000_000u64).encode(), vec![0x11; 20]],
            Metadata::with_priority(1),
        );

        let proposal = Proposal::from_message(&message, Address::repeat_byte(3)).unwrap();
        assert_eq!(proposal.data.len(), 32 + 32 + 20);
        assert_eq!(&proposal.data[29..32], &[0x0f, 0x42, 0x40]);
        assert_eq!(proposal.priority, Some(1));
    }

    #[test]
    fn data_hash_covers_handler_and_data() {
        let base = proposal();
        let mut other_handler = base.clone();
        other_handler.handler_address = Address::repeat_byte(0x0e);

        let mut preimage = base.handler_address.as_bytes().to_vec();
        preimage.extend_from_slice(&base.data);

        assert_eq!(base.data_hash(), H256::from(keccak256(&preimage)));
        assert_ne!(base.data_hash(), other_handler.data_hash());
    }
}
