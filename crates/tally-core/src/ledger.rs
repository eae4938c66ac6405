//! # Ledger Balance
//!
//! Net balance of signed, time-stamped, expirable amounts at an instant.
//!
//! ## Sweep
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Input (any order)              Accumulators (by time)                 │
//! │  ─────────────────              ──────────────────────                 │
//! │  +10  t0   exp t0+14d    ──►    granted[t0]      += 10                 │
//! │                                  expired[t0+14d]  += 10  (exp <= now)  │
//! │  -3   t0+1d exp ∞        ──►    used[t0+1d]      += 3                  │
//! │                                                                         │
//! │  Sweep distinct times ascending:                                       │
//! │    usedOrExpired = max(usedOrExpired + used[t], expiredSum)            │
//! │                                                                         │
//! │    t0      granted 10   usedOrExpired = max(0 + 0, 0)  = 0             │
//! │    t0+1d   granted 10   usedOrExpired = max(0 + 3, 0)  = 3             │
//! │    t0+14d  granted 10   usedOrExpired = max(3 + 0, 10) = 10            │
//! │                                                                         │
//! │  balance = 10 - 10 = 0   (usage against an expired grant stands)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Largest instant representable by the ledger (`+∞` for expirations).
pub const FAR_FUTURE_MILLIS: i64 = 8_640_000_000_000_000;

/// Minimal input of the balance algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Positive for grants, negative for usage.
    pub amount: i64,
    pub grant_time: i64,
    pub expiration_time: i64,
}

impl LedgerTransaction {
    /// A transaction that never expires.
    pub fn permanent(amount: i64, grant_time: i64) -> Self {
        LedgerTransaction {
            amount,
            grant_time,
            expiration_time: FAR_FUTURE_MILLIS,
        }
    }
}

/// Computes the balance at `now` (epoch millis).
///
/// - Grants with `grant_time > now` are ignored.
/// - A grant at exactly `now` counts; an expiration at exactly `now` has happened.
/// - Usage counts when `grant_time <= now` and its own expiration is after `now`.
/// - The result may be negative when usage exceeds grants.
pub fn compute_ledger_balance_at_now(transactions: &[LedgerTransaction], now: i64) -> i64 {
    let mut granted_at: BTreeMap<i64, i64> = BTreeMap::new();
    let mut expired_at: BTreeMap<i64, i64> = BTreeMap::new();
    let mut used_at: BTreeMap<i64, i64> = BTreeMap::new();
    let mut times: BTreeSet<i64> = BTreeSet::new();

    for tx in transactions {
        if tx.grant_time > now {
            continue;
        }
        if tx.amount > 0 {
            *granted_at.entry(tx.grant_time).or_default() += tx.amount;
            times.insert(tx.grant_time);
            if tx.expiration_time <= now {
                *expired_at.entry(tx.expiration_time).or_default() += tx.amount;
                times.insert(tx.expiration_time);
            }
        } else if tx.amount < 0 && tx.expiration_time > now {
            *used_at.entry(tx.grant_time).or_default() += -tx.amount;
            times.insert(tx.grant_time);
        }
    }

    let mut granted_sum = 0i64;
    let mut expired_sum = 0i64;
    let mut used_or_expired_sum = 0i64;
    for t in times {
        granted_sum += granted_at.get(&t).copied().unwrap_or(0);
        expired_sum += expired_at.get(&t).copied().unwrap_or(0);
        let used = used_at.get(&t).copied().unwrap_or(0);
        used_or_expired_sum = (used_or_expired_sum + used).max(expired_sum);
    }
    granted_sum - used_or_expired_sum
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400_000;
    const T0: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z

    fn tx(amount: i64, grant_time: i64, expiration_time: i64) -> LedgerTransaction {
        LedgerTransaction {
            amount,
            grant_time,
            expiration_time,
        }
    }

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(compute_ledger_balance_at_now(&[], T0), 0);
    }

    #[test]
    fn test_future_grants_excluded() {
        let txs = [tx(10, T0 + DAY, FAR_FUTURE_MILLIS)];
        assert_eq!(compute_ledger_balance_at_now(&txs, T0), 0);
    }

    #[test]
    fn test_boundaries_at_now() {
        // Grant exactly at now counts
        let grant = [tx(10, T0, FAR_FUTURE_MILLIS)];
        assert_eq!(compute_ledger_balance_at_now(&grant, T0), 10);

        // Expiration exactly at now means expired
        let expiring = [tx(10, T0 - DAY, T0)];
        assert_eq!(compute_ledger_balance_at_now(&expiring, T0), 0);
        assert_eq!(compute_ledger_balance_at_now(&expiring, T0 - 1), 10);
    }

    #[test]
    fn test_usage_against_expired_grant_stands() {
        let txs = [
            tx(10, T0, T0 + 14 * DAY),
            tx(-3, T0 + DAY, FAR_FUTURE_MILLIS),
        ];
        assert_eq!(compute_ledger_balance_at_now(&txs, T0 + 30 * DAY), 0);
        assert_eq!(compute_ledger_balance_at_now(&txs, T0 + 2 * DAY), 7);
    }

    #[test]
    fn test_usage_exceeding_grants_goes_negative() {
        let txs = [
            tx(5, T0, FAR_FUTURE_MILLIS),
            tx(-8, T0 + DAY, FAR_FUTURE_MILLIS),
        ];
        assert_eq!(compute_ledger_balance_at_now(&txs, T0 + 2 * DAY), -3);
    }

    #[test]
    fn test_expired_usage_not_counted() {
        let txs = [
            tx(10, T0, FAR_FUTURE_MILLIS),
            tx(-4, T0 + DAY, T0 + 2 * DAY),
        ];
        assert_eq!(compute_ledger_balance_at_now(&txs, T0 + DAY), 6);
        assert_eq!(compute_ledger_balance_at_now(&txs, T0 + 3 * DAY), 10);
    }

    #[test]
    fn test_same_timestamp_aggregated() {
        let txs = [
            tx(4, T0, FAR_FUTURE_MILLIS),
            tx(6, T0, FAR_FUTURE_MILLIS),
            tx(-2, T0, FAR_FUTURE_MILLIS),
        ];
        assert_eq!(compute_ledger_balance_at_now(&txs, T0), 8);
    }

    #[test]
    fn test_order_independent() {
        let txs = vec![
            tx(10, T0, T0 + 14 * DAY),
            tx(-3, T0 + DAY, FAR_FUTURE_MILLIS),
            tx(20, T0 + 2 * DAY, FAR_FUTURE_MILLIS),
            tx(-5, T0 + 20 * DAY, FAR_FUTURE_MILLIS),
        ];
        let now = T0 + 30 * DAY;
        let expected = compute_ledger_balance_at_now(&txs, now);

        let mut reversed = txs.clone();
        reversed.reverse();
        assert_eq!(compute_ledger_balance_at_now(&reversed, now), expected);

        let rotated: Vec<_> = txs[2..].iter().chain(&txs[..2]).copied().collect();
        assert_eq!(compute_ledger_balance_at_now(&rotated, now), expected);
        assert_eq!(expected, 15);
    }
}
