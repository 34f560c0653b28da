// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Contract bindings for the withdrawal vault and its underlying token.

use crate::chain_reader::ContractCall;
use crate::error::ReadError;
use ethers::abi::{self, AbiEncode, ParamType, Token};
use ethers::contract::abigen;
use ethers::types::{Address, U256};

abigen!(
    WithdrawalVault,
    r#"[
        function decimals() external view returns (uint8)
        function totalAssets() external view returns (uint256)
        function totalSupply() external view returns (uint256)
        function redemptionRate() external view returns (uint256)
        function balanceOf(address account) external view returns (uint256)
        function convertToAssets(uint256 shares) external view returns (uint256)
        function updateInfos(uint64 updateId) external view returns (uint256 withdrawRate, uint64 timestamp, uint256 withdrawFee)
        function userWithdrawRequest(address owner) external view returns (uint64 updateId, uint64 claimTimestamp, uint256 sharesAmount, string receiver)
        event Deposit(address indexed sender, address indexed owner, uint256 assets, uint256 shares)
        event WithdrawRequested(address indexed owner, string receiver, uint256 shares, uint32 maxLossBps, bool solverEnabled, uint64 indexed updateId)
        event UpdateProcessed(uint64 indexed updateId, uint256 withdrawRate, uint256 totalAssetsToWithdraw)
    ]"#,
);

/// Builders for the read calls the engine issues. The token's `decimals()`
/// shares its selector with the vault's, so one binding covers both.
pub struct VaultCalls;

impl VaultCalls {
    pub fn decimals(target: Address) -> ContractCall {
        ContractCall::new(target, DecimalsCall.encode(), "decimals")
    }

    pub fn total_assets(vault: Address) -> ContractCall {
        ContractCall::new(vault, TotalAssetsCall.encode(), "totalAssets")
    }

    pub fn total_supply(vault: Address) -> ContractCall {
        ContractCall::new(vault, TotalSupplyCall.encode(), "totalSupply")
    }

    pub fn redemption_rate(vault: Address) -> ContractCall {
        ContractCall::new(vault, RedemptionRateCall.encode(), "redemptionRate")
    }

    pub fn balance_of(vault: Address, account: Address) -> ContractCall {
        ContractCall::new(vault, BalanceOfCall { account }.encode(), "balanceOf")
    }

    pub fn convert_to_assets(vault: Address, shares: U256) -> ContractCall {
        ContractCall::new(
            vault,
            ConvertToAssetsCall { shares }.encode(),
            "convertToAssets",
        )
    }

    pub fn update_info(vault: Address, update_id: u64) -> ContractCall {
        ContractCall::new(vault, UpdateInfosCall { update_id }.encode(), "updateInfos")
    }

    pub fn account_withdraw_request(vault: Address, owner: Address) -> ContractCall {
        ContractCall::new(
            vault,
            UserWithdrawRequestCall { owner }.encode(),
            "userWithdrawRequest",
        )
    }
}

/// Settlement data recorded for an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateInfo {
    pub withdraw_rate: U256,
    /// Seconds since epoch; zero while the update has not been processed.
    pub timestamp: u64,
    pub withdraw_fee: U256,
}

/// The account's currently open withdraw request, as stored by the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountWithdrawRequest {
    pub update_id: u64,
    /// Seconds since epoch; zero when the account has no open request.
    pub claim_timestamp: u64,
    pub shares: U256,
    pub receiver: String,
}

pub fn decode_u256(data: &[u8]) -> Result<U256, ReadError> {
    let mut tokens = decode_tokens(&[ParamType::Uint(256)], data)?;
    take_uint(&mut tokens)
}

pub fn decode_update_info(data: &[u8]) -> Result<UpdateInfo, ReadError> {
    let mut tokens = decode_tokens(
        &[ParamType::Uint(256), ParamType::Uint(64), ParamType::Uint(256)],
        data,
    )?;
    Ok(UpdateInfo {
        withdraw_rate: take_uint(&mut tokens)?,
        timestamp: take_u64(&mut tokens)?,
        withdraw_fee: take_uint(&mut tokens)?,
    })
}

pub fn decode_account_withdraw_request(data: &[u8]) -> Result<AccountWithdrawRequest, ReadError> {
    let mut tokens = decode_tokens(
        &[
            ParamType::Uint(64),
            ParamType::Uint(64),
            ParamType::Uint(256),
            ParamType::String,
        ],
        data,
    )?;
    Ok(AccountWithdrawRequest {
        update_id: take_u64(&mut tokens)?,
        claim_timestamp: take_u64(&mut tokens)?,
        shares: take_uint(&mut tokens)?,
        receiver: match tokens.next() {
            Some(Token::String(receiver)) => receiver,
            other => return Err(ReadError::Decode(format!("expected string, got {:?}", other))),
        },
    })
}

fn decode_tokens(
    types: &[ParamType],
    data: &[u8],
) -> Result<std::vec::IntoIter<Token>, ReadError> {
    abi::decode(types, data)
        .map(|tokens| tokens.into_iter())
        .map_err(|e| ReadError::Decode(e.to_string()))
}

fn take_uint(tokens: &mut std::vec::IntoIter<Token>) -> Result<U256, ReadError> {
    match tokens.next() {
        Some(Token::Uint(value)) => Ok(value),
        other => Err(ReadError::Decode(format!("expected uint, got {:?}", other))),
    }
}

fn take_u64(tokens: &mut std::vec::IntoIter<Token>) -> Result<u64, ReadError> {
    let value = take_uint(tokens)?;
    if value > U256::from(u64::MAX) {
        return Err(ReadError::Decode(format!("{} does not fit in uint64", value)));
    }
    Ok(value.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::contract::EthEvent;
    use ethers::utils::keccak256;

    #[test]
    fn test_event_signatures() {
        assert_eq!(
            DepositFilter::signature().0,
            keccak256("Deposit(address,address,uint256,uint256)")
        );
        assert_eq!(
            WithdrawRequestedFilter::signature().0,
            keccak256("WithdrawRequested(address,string,uint256,uint32,bool,uint64)")
        );
        assert_eq!(
            UpdateProcessedFilter::signature().0,
            keccak256("UpdateProcessed(uint64,uint256,uint256)")
        );
    }

    #[test]
    fn test_call_selectors() {
        let vault = Address::repeat_byte(1);
        let call = VaultCalls::balance_of(vault, Address::repeat_byte(2));
        assert_eq!(call.target, vault);
        assert_eq!(&call.calldata[..4], &keccak256("balanceOf(address)")[..4]);
        let call = VaultCalls::update_info(vault, 7);
        assert_eq!(&call.calldata[..4], &keccak256("updateInfos(uint64)")[..4]);
        assert_eq!(call.calldata.len(), 4 + 32);
    }

    #[test]
    fn test_decode_account_withdraw_request() {
        let data = abi::encode(&[
            Token::Uint(U256::from(9u64)),
            Token::Uint(U256::from(1_700_000_000u64)),
            Token::Uint(U256::from(5_000u64)),
            Token::String("neutron1receiver".to_string()),
        ]);
        let decoded = decode_account_withdraw_request(&data).unwrap();
        assert_eq!(decoded.update_id, 9);
        assert_eq!(decoded.claim_timestamp, 1_700_000_000);
        assert_eq!(decoded.shares, U256::from(5_000u64));
        assert_eq!(decoded.receiver, "neutron1receiver");
    }

    #[test]
    fn test_decode_rejects_short_data() {
        assert!(matches!(decode_u256(&[0u8; 4]), Err(ReadError::Decode(_))));
        let too_big = abi::encode(&[
            Token::Uint(U256::MAX),
            Token::Uint(U256::MAX),
            Token::Uint(U256::zero()),
        ]);
        assert!(matches!(
            decode_update_info(&too_big),
            Err(ReadError::Decode(_))
        ));
    }
}
