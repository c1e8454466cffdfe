//! Split planner: how a spend draws down the three token sources.
//!
//! Strict priority: beneficiary-specific free tokens first, then the system
//! bucket, then paid. When the beneficiary *is* the system bucket it is
//! read once as the beneficiary bucket and never charged a second time.

use tokenledger_core::constants::SYSTEM_BENEFICIARY_ID;
use tokenledger_core::error::LedgerError;
use tokenledger_core::types::Amount;

use crate::balance::Balance;

/// How one requested spend splits across the sources.
/// `beneficiary_free + system_free + paid` always equals the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitPlan {
    pub beneficiary_free: Amount,
    pub system_free: Amount,
    pub paid: Amount,
}

/// Plan the split of `amount` against `balance` for `beneficiary_id`.
pub fn plan_split(
    balance: &Balance,
    amount: Amount,
    beneficiary_id: &str,
) -> Result<SplitPlan, LedgerError> {
    let charging_system = beneficiary_id == SYSTEM_BENEFICIARY_ID;

    let beneficiary_avail = balance.free_for(beneficiary_id).max(0);
    let system_avail = if charging_system {
        0 // already read as the beneficiary bucket
    } else {
        balance.free_for(SYSTEM_BENEFICIARY_ID).max(0)
    };

    let beneficiary_free = amount.min(beneficiary_avail);
    let mut remaining = amount - beneficiary_free;
    let system_free = remaining.min(system_avail);
    remaining -= system_free;

    if remaining > balance.paid_tokens {
        return Err(LedgerError::InsufficientPaidTokens {
            need: remaining,
            have: balance.paid_tokens,
        });
    }

    Ok(SplitPlan { beneficiary_free, system_free, paid: remaining })
}

/// Whether `balance` can cover `amount` for `beneficiary_id`. Zero is
/// trivially sufficient; negative buckets never help.
pub fn validate_sufficient_tokens(balance: &Balance, amount: Amount, beneficiary_id: &str) -> bool {
    if amount <= 0 {
        return true;
    }
    usable_total(balance, beneficiary_id) >= amount
}

/// Total tokens usable toward a spend for `beneficiary_id`.
pub fn usable_total(balance: &Balance, beneficiary_id: &str) -> Amount {
    let charging_system = beneficiary_id == SYSTEM_BENEFICIARY_ID;
    let beneficiary_avail = balance.free_for(beneficiary_id).max(0);
    let system_avail = if charging_system {
        0
    } else {
        balance.free_for(SYSTEM_BENEFICIARY_ID).max(0)
    };
    balance.paid_tokens.max(0) + beneficiary_avail + system_avail
}
