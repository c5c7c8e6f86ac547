//! Per-transfer timeouts
//!
//! Deadlines are kept ordered so the I/O thread can bound its reap wait by the
//! nearest one and collect every expired entry after waking. An entry leaves
//! the scheduler either by `disarm` or by being returned from `take_expired`,
//! never both.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::kernel::TransferId;

#[derive(Debug, Default)]
pub struct TimeoutScheduler {
    deadlines: BTreeSet<(Instant, TransferId)>,
    armed: HashMap<TransferId, Instant>,
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `id` to expire after `duration`
    ///
    /// Zero means no timeout, as does a duration too large to represent as
    /// an `Instant`.
    pub fn arm(&mut self, id: TransferId, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        match Instant::now().checked_add(duration) {
            Some(deadline) => self.arm_at(id, deadline),
            None => trace!("Timeout {:?} for {} is unbounded; not armed", duration, id),
        }
    }

    /// Schedule `id` to expire at `deadline`, replacing any earlier entry
    pub fn arm_at(&mut self, id: TransferId, deadline: Instant) {
        if let Some(previous) = self.armed.insert(id, deadline) {
            self.deadlines.remove(&(previous, id));
        }
        self.deadlines.insert((deadline, id));
    }

    /// Cancel the entry for `id`; false if none was armed
    ///
    /// Safe after the entry fired or was already disarmed.
    pub fn disarm(&mut self, id: TransferId) -> bool {
        match self.armed.remove(&id) {
            Some(deadline) => {
                self.deadlines.remove(&(deadline, id));
                true
            }
            None => false,
        }
    }

    /// Remove and return every entry due at `now`, earliest first
    pub fn take_expired(&mut self, now: Instant) -> Vec<TransferId> {
        let mut expired = Vec::new();
        while let Some(&(deadline, id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_first();
            self.armed.remove(&id);
            expired.push(id);
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|&(deadline, _)| deadline)
    }

    pub fn is_armed(&self, id: TransferId) -> bool {
        self.armed.contains_key(&id)
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
        self.armed.clear();
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_duration_not_armed() {
        let mut timeouts = TimeoutScheduler::new();
        timeouts.arm(TransferId(1), Duration::ZERO);
        assert!(timeouts.is_empty());
        assert!(timeouts.next_deadline().is_none());
    }

    #[test]
    fn test_unrepresentable_duration_not_armed() {
        let mut timeouts = TimeoutScheduler::new();
        timeouts.arm(TransferId(1), Duration::MAX);
        timeouts.arm(TransferId(2), Duration::from_secs(u64::MAX));
        assert!(timeouts.is_empty());
        assert!(timeouts.next_deadline().is_none());

        timeouts.arm(TransferId(3), Duration::from_secs(60));
        assert!(timeouts.is_armed(TransferId(3)));
    }

    #[test]
    fn test_expire_in_deadline_order() {
        let base = Instant::now();
        let mut timeouts = TimeoutScheduler::new();
        timeouts.arm_at(TransferId(1), base + Duration::from_millis(30));
        timeouts.arm_at(TransferId(2), base + Duration::from_millis(10));
        timeouts.arm_at(TransferId(3), base + Duration::from_millis(50));

        assert_eq!(timeouts.next_deadline(), Some(base + Duration::from_millis(10)));
        assert!(timeouts.take_expired(base).is_empty());

        let expired = timeouts.take_expired(base + Duration::from_millis(30));
        assert_eq!(expired, vec![TransferId(2), TransferId(1)]);
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts.next_deadline(), Some(base + Duration::from_millis(50)));
    }

    #[test]
    fn test_disarm_is_idempotent() {
        let base = Instant::now();
        let mut timeouts = TimeoutScheduler::new();
        timeouts.arm_at(TransferId(1), base);

        assert!(timeouts.disarm(TransferId(1)));
        assert!(!timeouts.disarm(TransferId(1)));
        assert!(timeouts.take_expired(base + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_fired_entry_cannot_be_disarmed() {
        let base = Instant::now();
        let mut timeouts = TimeoutScheduler::new();
        timeouts.arm_at(TransferId(4), base);

        assert_eq!(timeouts.take_expired(base), vec![TransferId(4)]);
        assert!(!timeouts.disarm(TransferId(4)));
        assert!(timeouts.take_expired(base).is_empty());
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let base = Instant::now();
        let mut timeouts = TimeoutScheduler::new();
        timeouts.arm_at(TransferId(1), base);
        timeouts.arm_at(TransferId(1), base + Duration::from_secs(5));

        assert!(timeouts.take_expired(base + Duration::from_secs(1)).is_empty());
        assert!(timeouts.is_armed(TransferId(1)));
    }

    proptest::proptest! {
        #[test]
        fn prop_each_armed_id_fires_once(
            offsets in proptest::collection::vec(0u64..500, 0..64),
            cut in 0u64..500,
        ) {
            let base = Instant::now();
            let mut timeouts = TimeoutScheduler::new();
            for (i, ms) in offsets.iter().enumerate() {
                timeouts.arm_at(TransferId(i as u64 + 1), base + Duration::from_millis(*ms));
            }

            let early = timeouts.take_expired(base + Duration::from_millis(cut));
            let late = timeouts.take_expired(base + Duration::from_secs(1));

            let expected_early = offsets.iter().filter(|&&ms| ms <= cut).count();
            proptest::prop_assert_eq!(early.len(), expected_early);
            proptest::prop_assert_eq!(early.len() + late.len(), offsets.len());
            proptest::prop_assert!(timeouts.is_empty());
        }
    }
}
