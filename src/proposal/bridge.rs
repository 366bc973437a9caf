//! Bridge contract calls used by the proposal relay

use super::{Proposal, ProposalStatus};
use crate::chain::ChainClient;
use crate::error::{RelayerError, RelayerResult};
use crate::events::keccak256;
use crate::tx::{TransactOptions, Transactor};

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

const GET_PROPOSAL: &str = "getProposal(uint8,uint64,bytes32)";
const HAS_VOTED: &str = "_hasVotedOnProposal(uint72,bytes32,address)";
const VOTE_PROPOSAL: &str = "voteProposal(uint8,uint64,bytes32,bytes32)";
const EXECUTE_PROPOSAL: &str = "executeProposal(uint8,uint64,bytes,bytes32)";

/// Destination bridge operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Bridge: Send + Sync {
    async fn proposal_status(&self, proposal: &Proposal) -> RelayerResult<ProposalStatus>;

    /// Whether this relayer already voted on `proposal`
    async fn has_voted(&self, proposal: &Proposal) -> RelayerResult<bool>;

    async fn vote_proposal(
        &self,
        proposal: &Proposal,
        opts: TransactOptions,
    ) -> RelayerResult<H256>;

    async fn execute_proposal(
        &self,
        proposal: &Proposal,
        opts: TransactOptions,
    ) -> RelayerResult<H256>;
}

/// Bridge contract reached through a chain client and a transactor
pub struct EvmBridge {
    address: Address,
    client: Arc<dyn ChainClient>,
    transactor: Arc<dyn Transactor>,
}

impl EvmBridge {
    pub fn new(
        address: Address,
        client: Arc<dyn ChainClient>,
        transactor: Arc<dyn Transactor>,
    ) -> Self {
        Self {
            address,
            client,
            transactor,
        }
    }

    async fn call(
        &self,
        signature: &str,
        args: &[Token],
        output: &[ParamType],
    ) -> RelayerResult<Vec<Token>> {
        let data = calldata(signature, args);
        let raw = self.client.call_contract(self.address, data, None).await?;
        abi::decode(output, &raw).map_err(|e| {
            RelayerError::Contract(format!("{} returned invalid data: {}", signature, e))
        })
    }
}

#[async_trait]
impl Bridge for EvmBridge {
    async fn proposal_status(&self, proposal: &Proposal) -> RelayerResult<ProposalStatus> {
        let output = [ParamType::Tuple(vec![
            ParamType::FixedBytes(32),
            ParamType::FixedBytes(32),
            ParamType::Array(Box::new(ParamType::Address)),
            ParamType::Array(Box::new(ParamType::Address)),
            ParamType::Uint(8),
            ParamType::Uint(256),
        ])];
        let tokens = self
            .call(
                GET_PROPOSAL,
                &[
                    Token::Uint(U256::from(proposal.source)),
                    Token::Uint(U256::from(proposal.deposit_nonce)),
                    Token::FixedBytes(proposal.data_hash().as_bytes().to_vec()),
                ],
                &output,
            )
            .await?;

        let status = match tokens.as_slice() {
            [Token::Tuple(fields)] => match fields.get(4) {
                Some(Token::Uint(status)) => u8::try_from(*status).map_err(|_| {
                    RelayerError::Contract(format!("proposal status {} out of range", status))
                })?,
                _ => return Err(RelayerError::Contract("proposal status missing".into())),
            },
            _ => return Err(RelayerError::Contract("unexpected proposal layout".into())),
        };

        let status = ProposalStatus::try_from(status)?;
        debug!("Proposal {} status {}", proposal, status);
        Ok(status)
    }

    async fn has_voted(&self, proposal: &Proposal) -> RelayerResult<bool> {
        // nonce and source domain packed into a single uint72
        let nonce_and_id =
            (U256::from(proposal.deposit_nonce) << 8) | U256::from(proposal.source);
        let tokens = self
            .call(
                HAS_VOTED,
                &[
                    Token::Uint(nonce_and_id),
                    Token::FixedBytes(proposal.data_hash().as_bytes().to_vec()),
                    Token::Address(self.client.relayer_address()),
                ],
                &[ParamType::Bool],
            )
            .await?;

        match tokens.as_slice() {
            [Token::Bool(voted)] => Ok(*voted),
            _ => Err(RelayerError::Contract("unexpected vote lookup result".into())),
        }
    }

    async fn vote_proposal(
        &self,
        proposal: &Proposal,
        opts: TransactOptions,
    ) -> RelayerResult<H256> {
        let data = calldata(
            VOTE_PROPOSAL,
            &[
                Token::Uint(U256::from(proposal.source)),
                Token::Uint(U256::from(proposal.deposit_nonce)),
                Token::FixedBytes(proposal.resource_id.0.to_vec()),
                Token::FixedBytes(proposal.data_hash().as_bytes().to_vec()),
            ],
        );
        self.transactor.transact(self.address, data, opts).await
    }

    async fn execute_proposal(
        &self,
        proposal: &Proposal,
        opts: TransactOptions,
    ) -> RelayerResult<H256> {
        let data = calldata(
            EXECUTE_PROPOSAL,
            &[
                Token::Uint(U256::from(proposal.source)),
                Token::Uint(U256::from(proposal.deposit_nonce)),
                Token::Bytes(proposal.data.clone()),
                Token::FixedBytes(proposal.resource_id.0.to_vec()),
            ],
        );
        self.transactor.transact(self.address, data, opts).await
    }
}

/// 4-byte selector followed by the ABI-encoded arguments
fn calldata(signature: &str, args: &[Token]) -> Bytes {
    let mut data = keccak256(signature.as_bytes())[..4].to_vec();
    data.extend(abi::encode(args));
    data.into()
}
