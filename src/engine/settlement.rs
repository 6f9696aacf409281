//! Realized P&L for a follower position closed at the leader's exit price.

use crate::domain::{AmountError, Decimal, Direction, Position};

/// Long: `(exit - entry) / entry * size`. Short: `(entry - exit) / entry * size`.
///
/// A non-positive entry price yields zero rather than dividing by it.
pub fn compute_pnl(
    direction: Direction,
    entry_price: Decimal,
    exit_price: Decimal,
    size_usd: Decimal,
) -> Result<Decimal, AmountError> {
    if !entry_price.is_positive() {
        return Ok(Decimal::zero());
    }
    let price_move = match direction {
        Direction::Long => exit_price - entry_price,
        Direction::Short => entry_price - exit_price,
    };
    price_move.checked_mul(size_usd)?.checked_div(entry_price)
}

/// What will be written on-chain for one follower position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementQuote {
    pub pnl: Decimal,
    /// `floor(pnl * 10^decimals)` as a decimal integer string.
    pub pnl_fixed: String,
}

pub fn quote_settlement(
    position: &Position,
    exit_price: Decimal,
    decimals: u32,
) -> Result<SettlementQuote, AmountError> {
    let pnl = compute_pnl(
        position.direction,
        position.entry_price,
        exit_price,
        position.size_usd,
    )?;
    let fixed = pnl.to_fixed_point_floor(decimals)?;
    Ok(SettlementQuote {
        pnl,
        pnl_fixed: fixed.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, LeaderId, TimeMs, TxHash};

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_long_and_short_signs() {
        assert_eq!(
            compute_pnl(Direction::Long, d("3000"), d("3300"), d("1000")).unwrap(),
            d("100")
        );
        assert_eq!(
            compute_pnl(Direction::Short, d("3000"), d("3300"), d("1000")).unwrap(),
            d("-100")
        );
    }

    #[test]
    fn test_zero_entry_guard() {
        assert_eq!(
            compute_pnl(Direction::Long, Decimal::zero(), d("3300"), d("1000")).unwrap(),
            Decimal::zero()
        );
        assert_eq!(
            compute_pnl(Direction::Short, d("-1"), d("3300"), d("1000")).unwrap(),
            Decimal::zero()
        );
    }

    #[test]
    fn test_quote_floors_fixed_point() {
        let position = Position {
            id: 1,
            leader_id: LeaderId::new(1),
            follower: Some(Address::new("0xf1".to_string())),
            direction: Direction::Short,
            entry_price: d("3"),
            size_usd: d("1"),
            is_open: true,
            exit_price: None,
            realized_pnl: None,
            index_token: Address::new("0xe7".to_string()),
            tx_hash: TxHash::new("0x01".to_string()),
            opened_at: TimeMs::new(0),
            closed_at: None,
        };

        // (3 - 4) / 3 * 1 = -0.333..., floored at 2 decimals
        let quote = quote_settlement(&position, d("4"), 2).unwrap();
        assert_eq!(quote.pnl_fixed, "-34");
        assert!(quote.pnl.is_negative());

        let quote = quote_settlement(&position, d("3"), 18).unwrap();
        assert_eq!(quote.pnl, Decimal::zero());
        assert_eq!(quote.pnl_fixed, "0");
    }
}
