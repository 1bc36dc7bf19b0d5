//! Lease - leader_election テーブルの単一行
//!
//! Both lease backends hold an exclusive lock on the anchor row, call
//! [`decide`], and then write whatever it returns inside the same transaction.
//! Keeping the decision pure means the in-memory and SQL stores cannot drift.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed primary key of the singleton lease row.
pub const LEASE_ANCHOR: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub anchor: i64,
    /// Empty when the lease is unheld.
    pub master_id: String,
    pub ip: String,
    pub last_seen_active: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn held_by(&self, candidate_id: &str) -> bool {
        !self.master_id.is_empty() && self.master_id == candidate_id
    }

    pub fn is_unheld(&self) -> bool {
        self.master_id.is_empty()
    }

    /// A lease is stale once `last_seen_active` is strictly older than
    /// `now - stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        // A window reaching past chrono's range has no cutoff: never stale.
        chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .is_some_and(|cutoff| self.last_seen_active < cutoff)
    }
}

/// One contention attempt by `candidate_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseClaim {
    pub candidate_id: String,
    pub ip: String,
    pub now: DateTime<Utc>,
    pub stale_after: Duration,
}

impl LeaseClaim {
    fn record(&self) -> LeaseRecord {
        LeaseRecord {
            anchor: LEASE_ANCHOR,
            master_id: self.candidate_id.clone(),
            ip: self.ip.clone(),
            last_seen_active: self.now,
        }
    }
}

/// What a contention attempt does to the lease row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAction {
    /// No row yet: insert with the candidate as holder.
    Acquire(LeaseRecord),
    /// Holder is stale or the seat is empty: overwrite with the candidate.
    TakeOver(LeaseRecord),
    /// The candidate already holds the lease: refresh `last_seen_active`.
    Renew(LeaseRecord),
    /// Someone else holds a live lease: no write.
    Observe,
}

impl LeaseAction {
    /// Row to write, if any.
    pub fn record(&self) -> Option<&LeaseRecord> {
        match self {
            LeaseAction::Acquire(r) | LeaseAction::TakeOver(r) | LeaseAction::Renew(r) => Some(r),
            LeaseAction::Observe => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LeaseAction::Acquire(_) => "acquire",
            LeaseAction::TakeOver(_) => "take_over",
            LeaseAction::Renew(_) => "renew",
            LeaseAction::Observe => "observe",
        }
    }
}

/// Result of one contention attempt: the action taken and the row as it
/// stands after the transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseOutcome {
    pub action: LeaseAction,
    pub record: LeaseRecord,
}

impl LeaseOutcome {
    pub fn is_leader(&self, candidate_id: &str) -> bool {
        self.record.held_by(candidate_id)
    }
}

/// Decide the write for one contention attempt against the locked row.
pub fn decide(existing: Option<&LeaseRecord>, claim: &LeaseClaim) -> LeaseAction {
    let Some(current) = existing else {
        return LeaseAction::Acquire(claim.record());
    };

    if current.held_by(&claim.candidate_id) {
        return LeaseAction::Renew(claim.record());
    }

    if current.is_unheld() || current.is_stale(claim.now, claim.stale_after) {
        return LeaseAction::TakeOver(claim.record());
    }

    LeaseAction::Observe
}

/// Apply `decide` to the locked row and produce the post-transaction state.
/// On `Observe` the current row is returned unchanged.
pub fn resolve(existing: Option<LeaseRecord>, claim: &LeaseClaim) -> LeaseOutcome {
    let action = decide(existing.as_ref(), claim);
    let record = match (action.record(), existing) {
        (Some(written), _) => written.clone(),
        (None, Some(current)) => current,
        (None, None) => claim.record(),
    };
    LeaseOutcome { action, record }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    const STALE: Duration = Duration::from_secs(15);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn claim(candidate: &str, now: i64) -> LeaseClaim {
        LeaseClaim {
            candidate_id: candidate.to_string(),
            ip: "10.0.0.1".to_string(),
            now: at(now),
            stale_after: STALE,
        }
    }

    fn held(master: &str, last_seen: i64) -> LeaseRecord {
        LeaseRecord {
            anchor: LEASE_ANCHOR,
            master_id: master.to_string(),
            ip: "10.0.0.9".to_string(),
            last_seen_active: at(last_seen),
        }
    }

    #[test]
    fn first_contender_acquires() {
        let action = decide(None, &claim("a", 0));
        assert_eq!(action.name(), "acquire");
        assert_eq!(action.record().unwrap().master_id, "a");
    }

    #[test]
    fn incumbent_renews_and_keeps_its_seat() {
        let action = decide(Some(&held("a", 0)), &claim("a", 3));
        let LeaseAction::Renew(record) = action else {
            panic!("expected renew, got {action:?}");
        };
        assert_eq!(record.master_id, "a");
        assert_eq!(record.last_seen_active, at(3));
    }

    #[rstest]
    #[case::live_holder(14, "observe")]
    #[case::exactly_at_threshold(15, "observe")]
    #[case::just_past_threshold(16, "take_over")]
    fn challenger_respects_staleness(#[case] now: i64, #[case] expected: &str) {
        let action = decide(Some(&held("a", 0)), &claim("b", now));
        assert_eq!(action.name(), expected);
    }

    #[rstest]
    #[case::cutoff_overflows(Duration::from_millis(10_000_000_000_000_000))]
    #[case::before_min_utc(Duration::from_secs(400_000 * 365 * 24 * 3600))]
    #[case::max(Duration::MAX)]
    fn oversized_window_never_goes_stale(#[case] stale_after: Duration) {
        let record = held("a", 0);
        assert!(!record.is_stale(at(1_000_000), stale_after));

        let mut challenger = claim("b", 1_000_000);
        challenger.stale_after = stale_after;
        assert_eq!(decide(Some(&record), &challenger), LeaseAction::Observe);
    }

    #[test]
    fn empty_seat_is_taken_immediately() {
        let action = decide(Some(&held("", 0)), &claim("b", 1));
        assert_eq!(action.name(), "take_over");
    }

    #[test]
    fn stale_incumbent_still_renews_itself() {
        // The holder came back after a long pause and nobody took over.
        let action = decide(Some(&held("a", 0)), &claim("a", 100));
        assert_eq!(action.name(), "renew");
    }

    #[test]
    fn resolve_keeps_current_row_on_observe() {
        let outcome = resolve(Some(held("a", 0)), &claim("b", 5));
        assert_eq!(outcome.action, LeaseAction::Observe);
        assert_eq!(outcome.record.master_id, "a");
        assert!(!outcome.is_leader("b"));
        assert!(!outcome.is_leader(""));
    }
}
