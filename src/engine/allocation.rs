//! Proportional mirror sizing.
//!
//! Given a leader trade of size `S` and follower balances `b_i` summing to
//! `T`, follower `i` mirrors `floor(S * b_i / T)`. Everything stays in the
//! ledger's U256 fixed-point domain, so the result matches what the contract
//! computes and `sum(size_i) <= S` holds exactly.

use crate::domain::Address;
use alloy_primitives::U256;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorAllocation {
    pub follower: Address,
    pub size: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("total balance overflows U256")]
    TotalOverflow,
    #[error("size * balance overflows U256 for follower {0}")]
    ProductOverflow(Address),
}

/// Split `total_size` across followers in proportion to their balances.
///
/// Zero-balance followers are skipped. Returns an empty list when the total
/// balance is zero. Input order is preserved.
pub fn allocate_mirror_sizes(
    total_size: U256,
    balances: &[(Address, U256)],
) -> Result<Vec<MirrorAllocation>, AllocationError> {
    let total_balance = balances.iter().try_fold(U256::ZERO, |acc, (_, b)| {
        acc.checked_add(*b).ok_or(AllocationError::TotalOverflow)
    })?;
    if total_balance.is_zero() {
        return Ok(Vec::new());
    }

    balances
        .iter()
        .filter(|(_, balance)| !balance.is_zero())
        .map(|(follower, balance)| {
            let product = total_size
                .checked_mul(*balance)
                .ok_or_else(|| AllocationError::ProductOverflow(follower.clone()))?;
            Ok(MirrorAllocation {
                follower: follower.clone(),
                size: product / total_balance,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn addr(n: u8) -> Address {
        Address::from_str(&format!("0x{:040x}", n)).unwrap()
    }

    #[test]
    fn test_two_followers_split_proportionally() {
        let balances = vec![(addr(1), U256::from(100u64)), (addr(2), U256::from(200u64))];
        let sizes = allocate_mirror_sizes(U256::from(900u64), &balances).unwrap();
        assert_eq!(
            sizes,
            vec![
                MirrorAllocation {
                    follower: addr(1),
                    size: U256::from(300u64)
                },
                MirrorAllocation {
                    follower: addr(2),
                    size: U256::from(600u64)
                },
            ]
        );
    }

    #[test]
    fn test_floor_never_exceeds_total() {
        let balances = vec![
            (addr(1), U256::from(1u64)),
            (addr(2), U256::from(1u64)),
            (addr(3), U256::from(1u64)),
        ];
        let sizes = allocate_mirror_sizes(U256::from(100u64), &balances).unwrap();
        let sum: U256 = sizes.iter().map(|a| a.size).fold(U256::ZERO, |a, b| a + b);
        assert_eq!(sum, U256::from(99u64));
        assert!(sizes.iter().all(|a| a.size == U256::from(33u64)));
    }

    #[test]
    fn test_zero_balances_skipped() {
        let balances = vec![(addr(1), U256::ZERO), (addr(2), U256::from(5u64))];
        let sizes = allocate_mirror_sizes(U256::from(10u64), &balances).unwrap();
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].follower, addr(2));
        assert_eq!(sizes[0].size, U256::from(10u64));

        assert!(allocate_mirror_sizes(U256::from(10u64), &[(addr(1), U256::ZERO)])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_eighteen_decimal_amounts() {
        let one = U256::from(10u64).pow(U256::from(18u64));
        let balances = vec![
            (addr(1), U256::from(100u64) * one),
            (addr(2), U256::from(200u64) * one),
        ];
        let sizes = allocate_mirror_sizes(U256::from(900u64) * one, &balances).unwrap();
        assert_eq!(sizes[0].size, U256::from(300u64) * one);
        assert_eq!(sizes[1].size, U256::from(600u64) * one);
    }

    #[test]
    fn test_product_overflow_reported() {
        let balances = vec![(addr(1), U256::MAX)];
        assert_eq!(
            allocate_mirror_sizes(U256::from(2u64), &balances),
            Err(AllocationError::ProductOverflow(addr(1)))
        );
    }
}
