//! Run-wide budgets for the orchestration loop.

use std::time::Duration;

use serde::Serialize;

/// Caps that end a run normally when reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budgets {
    pub max_iterations: u32,
    pub max_invocations: u32,
    pub max_elapsed: Duration,
}

/// Which cap was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetExhausted {
    Iterations,
    Invocations,
    Elapsed,
}

impl BudgetExhausted {
    pub fn as_str(self) -> &'static str {
        match self {
            BudgetExhausted::Iterations => "max iterations reached",
            BudgetExhausted::Invocations => "max scanner invocations reached",
            BudgetExhausted::Elapsed => "max elapsed time reached",
        }
    }
}

impl Budgets {
    /// Check the caps before starting `iteration` (1-indexed).
    pub fn check(
        &self,
        iteration: u32,
        invocations: u32,
        elapsed: Duration,
    ) -> Option<BudgetExhausted> {
        if iteration > self.max_iterations {
            return Some(BudgetExhausted::Iterations);
        }
        if elapsed > self.max_elapsed {
            return Some(BudgetExhausted::Elapsed);
        }
        if invocations >= self.max_invocations {
            return Some(BudgetExhausted::Invocations);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budgets() -> Budgets {
        Budgets {
            max_iterations: 30,
            max_invocations: 25,
            max_elapsed: Duration::from_secs(3600),
        }
    }

    #[test]
    fn within_budget() {
        assert_eq!(budgets().check(30, 24, Duration::from_secs(3600)), None);
    }

    #[test]
    fn reports_first_exhausted_cap() {
        let budgets = budgets();
        assert_eq!(
            budgets.check(31, 0, Duration::ZERO),
            Some(BudgetExhausted::Iterations)
        );
        assert_eq!(
            budgets.check(1, 25, Duration::ZERO),
            Some(BudgetExhausted::Invocations)
        );
        assert_eq!(
            budgets.check(1, 0, Duration::from_secs(3601)),
            Some(BudgetExhausted::Elapsed)
        );
    }
}
