use std::time::Duration;

use tokio::time::Instant;

use troupe_core::error::{Result, TroupeError};

/// Depth and time allowance carried down one handoff chain.
///
/// The deadline is fixed when the top-level invocation starts and is shared
/// by every hop beneath it. Depth is consumed one per hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffBudget {
    pub max_depth: usize,
    pub remaining_depth: usize,
    pub started: Instant,
    pub deadline: Instant,
}

/// Allowances are capped here so the deadline always fits in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

impl HandoffBudget {
    pub fn new(max_depth: usize, allowance: Duration) -> Self {
        let started = Instant::now();
        let deadline = started + allowance.min(FAR_FUTURE);
        Self {
            max_depth,
            remaining_depth: max_depth,
            started,
            deadline,
        }
    }

    pub fn remaining_time(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining_time().is_zero()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Hops taken so far.
    pub fn hops(&self) -> usize {
        self.max_depth - self.remaining_depth
    }

    /// Budget for the next hop, or `HandoffDepth` if none is left.
    pub fn consume_hop(&self) -> Result<Self> {
        if self.remaining_depth == 0 {
            return Err(TroupeError::HandoffDepth {
                max_depth: self.max_depth,
                hops: self.hops() + 1,
            });
        }
        Ok(Self {
            remaining_depth: self.remaining_depth - 1,
            ..*self
        })
    }

    /// Same deadline, full depth. Used when a new task starts its own chain.
    pub fn with_fresh_depth(&self) -> Self {
        Self {
            remaining_depth: self.max_depth,
            ..*self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_is_consumed_per_hop() {
        let budget = HandoffBudget::new(2, Duration::from_secs(60));
        let one = budget.consume_hop().unwrap();
        let two = one.consume_hop().unwrap();
        assert_eq!(two.remaining_depth, 0);
        assert_eq!(two.hops(), 2);
        match two.consume_hop().unwrap_err() {
            TroupeError::HandoffDepth { max_depth, hops } => {
                assert_eq!(max_depth, 2);
                assert_eq!(hops, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn deadline_survives_hops() {
        let budget = HandoffBudget::new(3, Duration::from_secs(60));
        let next = budget.consume_hop().unwrap();
        assert_eq!(next.deadline, budget.deadline);
        assert_eq!(next.with_fresh_depth().remaining_depth, 3);
    }

    #[test]
    fn huge_allowance_is_capped() {
        let budget = HandoffBudget::new(3, Duration::from_secs(u64::MAX));
        assert!(!budget.is_expired());
        assert!(budget.remaining_time() <= FAR_FUTURE);
        assert!(budget.remaining_time() > Duration::from_secs(86400 * 365));
    }

    #[test]
    fn zero_allowance_is_expired() {
        let budget = HandoffBudget::new(3, Duration::ZERO);
        assert!(budget.is_expired());
        assert_eq!(budget.remaining_time(), Duration::ZERO);
    }
}
