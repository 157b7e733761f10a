//! Timer arithmetic for the wall-time and CPU-time limits
//!
//! Both watchdogs start when the tracee announces its exec. The CPU watchdog cannot
//! be told when the cgroup crosses its budget, so it polls `cpu.stat`; between polls
//! it sleeps for the shortest time in which the sandbox could burn the remaining
//! budget with all of its threads running.

use std::time::Duration;

use tokio::time::Instant;

/// Floor of every rearm, at most a thousand polls per second
pub const MIN_REARM: Duration = Duration::from_millis(1);

/// Floor of the first arm; a zero timer would never fire
pub const MIN_FIRST_ARM: Duration = Duration::from_nanos(1);

/// Wall timer for `limit`; a zero limit still gets the smallest timer
pub fn wall_timer(limit: Duration) -> Duration {
    if limit.is_zero() {
        MIN_FIRST_ARM
    } else {
        limit
    }
}

/// `now + delay`, or `None` when that lies beyond what an [`Instant`] can hold.
///
/// Such a deadline would never be reached, so it is treated as no deadline at all.
pub fn deadline_after(now: Instant, delay: Duration) -> Option<Instant> {
    now.checked_add(delay)
}

/// Microseconds of `d`, rounding a partial microsecond up
pub fn usec_round_up(d: Duration) -> u64 {
    let usec = d.as_secs().saturating_mul(1_000_000);
    usec.saturating_add(u64::from(d.subsec_nanos().div_ceil(1000)))
}

/// How many CPUs the sandbox can keep busy at once
pub fn max_parallelism(process_num_limit: Option<u32>, available: usize) -> u32 {
    let available = u32::try_from(available).unwrap_or(u32::MAX);
    process_num_limit
        .map_or(available, |n| n.min(available))
        .max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuCheck {
    Kill,
    Rearm(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuWatchdog {
    end_usec: u64,
    parallelism: u32,
}

impl CpuWatchdog {
    /// `start` is the cgroup's user + system time at exec
    pub fn new(start: Duration, limit: Duration, parallelism: u32) -> Self {
        Self {
            end_usec: usec_round_up(start).saturating_add(usec_round_up(limit)),
            parallelism: parallelism.max(1),
        }
    }

    pub fn end_usec(&self) -> u64 {
        self.end_usec
    }

    /// Delay before the first poll
    pub fn first_arm(&self, start: Duration) -> Duration {
        self.delay(usec_round_up(start), MIN_FIRST_ARM)
    }

    /// Decide after reading the cgroup's current usage
    pub fn check(&self, usage: Duration) -> CpuCheck {
        let usage_usec = u64::try_from(usage.as_micros()).unwrap_or(u64::MAX);
        if usage_usec >= self.end_usec {
            CpuCheck::Kill
        } else {
            CpuCheck::Rearm(self.delay(usage_usec, MIN_REARM))
        }
    }

    fn delay(&self, usage_usec: u64, floor: Duration) -> Duration {
        let remaining_usec = self.end_usec.saturating_sub(usage_usec);
        let nanos = u128::from(remaining_usec) * 1000 / u128::from(self.parallelism);
        let delay = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        delay.max(floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_wall_limit_gets_minimal_timer() {
        assert_eq!(wall_timer(Duration::ZERO), Duration::from_nanos(1));
        assert_eq!(wall_timer(Duration::from_millis(100)), Duration::from_millis(100));
    }

    #[test]
    fn huge_limits_arm_no_deadline() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, wall_timer(Duration::from_secs(u64::MAX))), None);
        assert_eq!(deadline_after(now, Duration::MAX), None);
    }

    #[test]
    fn ordinary_limits_arm_a_deadline() {
        let now = Instant::now();
        assert_eq!(
            deadline_after(now, wall_timer(Duration::from_millis(100))),
            Some(now + Duration::from_millis(100))
        );
    }

    #[test]
    fn nanoseconds_round_up_to_microseconds() {
        assert_eq!(usec_round_up(Duration::from_nanos(1)), 1);
        assert_eq!(usec_round_up(Duration::from_nanos(1000)), 1);
        assert_eq!(usec_round_up(Duration::from_nanos(1001)), 2);
        assert_eq!(usec_round_up(Duration::new(2, 500)), 2_000_001);
        assert_eq!(usec_round_up(Duration::MAX), u64::MAX);
    }

    #[test]
    fn parallelism_is_bounded_by_pids_and_cpus() {
        assert_eq!(max_parallelism(None, 8), 8);
        assert_eq!(max_parallelism(Some(1), 8), 1);
        assert_eq!(max_parallelism(Some(16), 8), 8);
        assert_eq!(max_parallelism(Some(0), 8), 1);
    }

    #[test]
    fn deadline_counts_from_exec_usage() {
        let wd = CpuWatchdog::new(Duration::from_micros(500), Duration::from_secs(1), 1);
        assert_eq!(wd.end_usec(), 1_000_500);
        assert_eq!(wd.check(Duration::from_micros(1_000_499)), CpuCheck::Rearm(MIN_REARM));
        assert_eq!(wd.check(Duration::from_micros(1_000_500)), CpuCheck::Kill);
    }

    #[test]
    fn first_arm_waits_for_whole_budget_on_one_cpu() {
        let wd = CpuWatchdog::new(Duration::ZERO, Duration::from_secs(1), 1);
        assert_eq!(wd.first_arm(Duration::ZERO), Duration::from_secs(1));
    }

    #[test]
    fn rearm_divides_remaining_budget_by_parallelism() {
        let wd = CpuWatchdog::new(Duration::ZERO, Duration::from_secs(1), 4);
        assert_eq!(wd.first_arm(Duration::ZERO), Duration::from_millis(250));
        assert_eq!(
            wd.check(Duration::from_millis(600)),
            CpuCheck::Rearm(Duration::from_millis(100))
        );
    }

    #[test]
    fn zero_cpu_limit() {
        let wd = CpuWatchdog::new(Duration::from_millis(3), Duration::ZERO, 1);
        assert_eq!(wd.first_arm(Duration::from_millis(3)), MIN_FIRST_ARM);
        assert_eq!(wd.check(Duration::from_millis(3)), CpuCheck::Kill);
    }

    #[test]
    fn rearm_never_below_floor() {
        let wd = CpuWatchdog::new(Duration::ZERO, Duration::from_micros(10), 64);
        assert_eq!(wd.check(Duration::from_micros(9)), CpuCheck::Rearm(MIN_REARM));
    }
}
