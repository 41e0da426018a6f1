//! The fair-share priority function.

use super::record::{PriorityInputs, QUOTA_EXCEEDED};

/// Why a user ended up with its computed priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityVerdict {
    /// 24 hour running time quota exceeded.
    RunningTimeQuotaExceeded,
    /// More cores in use than the parallelism quota allows.
    ParallelQuotaExceeded,
    /// Below the parallelism quota; weight derived from usage.
    Weighted,
    /// Exactly at the parallelism quota.
    AtCapacity,
}

impl PriorityVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityVerdict::RunningTimeQuotaExceeded => "running_time_quota",
            PriorityVerdict::ParallelQuotaExceeded => "parallel_quota",
            PriorityVerdict::Weighted => "weighted",
            PriorityVerdict::AtCapacity => "at_capacity",
        }
    }
}

/// Output of `compute_priority`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComputedPriority {
    pub userload: f64,
    pub computed_priority: f64,
    pub verdict: PriorityVerdict,
}

/// Computes a user's scheduling weight from quota and recent usage.
///
/// Pure: the result depends on `inputs` only. A negative result
/// (`QUOTA_EXCEEDED`) removes the user's jobs from matching; every other
/// result is strictly positive.
pub fn compute_priority(inputs: &PriorityInputs) -> ComputedPriority {
    let userload = if inputs.max_parallel_jobs > 0 {
        inputs.running as f64 / inputs.max_parallel_jobs as f64
    } else {
        0.0
    };

    if inputs.total_running_time_last24h > inputs.max_total_running_time {
        return ComputedPriority {
            userload,
            computed_priority: QUOTA_EXCEEDED,
            verdict: PriorityVerdict::RunningTimeQuotaExceeded,
        };
    }

    if inputs.running > inputs.max_parallel_jobs {
        return ComputedPriority {
            userload,
            computed_priority: QUOTA_EXCEEDED,
            verdict: PriorityVerdict::ParallelQuotaExceeded,
        };
    }

    if inputs.running == inputs.max_parallel_jobs {
        return ComputedPriority {
            userload,
            computed_priority: 1.0,
            verdict: PriorityVerdict::AtCapacity,
        };
    }

    // 0/0 (no quota, no usage) counts as no historical usage.
    let historical_usage = if inputs.max_total_running_time > 0 {
        inputs.total_running_time_last24h as f64 / inputs.max_total_running_time as f64
    } else {
        0.0
    };

    let core_usage_cost = if inputs.running == 0 {
        1.0
    } else {
        inputs.running as f64 * (-historical_usage).exp()
    };

    let adjusted_priority_factor = (2.0 - userload) * (inputs.priority / core_usage_cost);
    let computed_priority = if adjusted_priority_factor > 0.0 {
        50.0 * adjusted_priority_factor
    } else {
        1.0
    };

    ComputedPriority {
        userload,
        computed_priority,
        verdict: PriorityVerdict::Weighted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(priority: f64, running: i64, max_parallel: i64, last24h: i64, max_total: i64) -> PriorityInputs {
        PriorityInputs {
            priority,
            running,
            max_parallel_jobs: max_parallel,
            total_running_time_last24h: last24h,
            max_total_running_time: max_total,
        }
    }

    #[test]
    fn test_weighted_user() {
        let result = compute_priority(&inputs(10.0, 2, 10, 0, 100_000));

        assert_eq!(result.verdict, PriorityVerdict::Weighted);
        assert!((result.userload - 0.2).abs() < 1e-9);
        assert!((result.computed_priority - 450.0).abs() < 1e-9);
    }

    #[test]
    fn test_running_time_quota_gate() {
        let result = compute_priority(&inputs(10.0, 2, 10, 150_000, 100_000));
        assert_eq!(result.computed_priority, QUOTA_EXCEEDED);
        assert_eq!(result.verdict, PriorityVerdict::RunningTimeQuotaExceeded);

        // Gate wins regardless of the other inputs.
        let idle = compute_priority(&inputs(1000.0, 0, 500, 150_000, 100_000));
        assert_eq!(idle.computed_priority, QUOTA_EXCEEDED);
    }

    #[test]
    fn test_parallel_quota_gate() {
        let result = compute_priority(&inputs(10.0, 11, 10, 0, 100_000));
        assert_eq!(result.computed_priority, QUOTA_EXCEEDED);
        assert_eq!(result.verdict, PriorityVerdict::ParallelQuotaExceeded);
    }

    #[test]
    fn test_at_capacity() {
        let result = compute_priority(&inputs(10.0, 10, 10, 5_000, 100_000));
        assert_eq!(result.computed_priority, 1.0);
        assert_eq!(result.verdict, PriorityVerdict::AtCapacity);
    }

    #[test]
    fn test_idle_user_uses_unit_cost() {
        // running == 0 -> cost 1, userload 0, factor 2 * priority
        let result = compute_priority(&inputs(3.0, 0, 10, 0, 100_000));
        assert!((result.computed_priority - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_historical_usage_lowers_cost() {
        let fresh = compute_priority(&inputs(10.0, 2, 10, 0, 100_000));
        let busy = compute_priority(&inputs(10.0, 2, 10, 50_000, 100_000));

        // e^-0.5 shrinks the core cost, which raises the weight.
        assert!(busy.computed_priority > fresh.computed_priority);
    }

    #[test]
    fn test_zero_base_priority_floors_at_one() {
        let result = compute_priority(&inputs(0.0, 2, 10, 0, 100_000));
        assert_eq!(result.computed_priority, 1.0);
    }

    #[test]
    fn test_zero_quotas_do_not_divide_by_zero() {
        let result = compute_priority(&inputs(10.0, 0, 0, 0, 0));
        assert_eq!(result.verdict, PriorityVerdict::AtCapacity);
        assert_eq!(result.userload, 0.0);
    }

    #[test]
    fn test_deterministic() {
        let a = inputs(7.5, 3, 40, 12_345, 99_999);
        assert_eq!(compute_priority(&a), compute_priority(&a));
    }

    #[test]
    fn test_result_is_minus_one_or_positive() {
        for priority in [0.0, 0.5, 10.0] {
            for running in [0, 1, 5, 10, 12] {
                for last24h in [0, 50_000, 100_000, 100_001] {
                    let result = compute_priority(&inputs(priority, running, 10, last24h, 100_000));
                    assert!(
                        result.computed_priority == QUOTA_EXCEEDED || result.computed_priority > 0.0,
                        "{:?}",
                        result
                    );
                }
            }
        }
    }
}
