//! Time accounting for one worker: the wall-clock deadline and the command
//! time a plan declared for itself.

use std::time::{Duration, Instant};

use anyhow::{Result, bail};

use crate::core::plan::{Capability, Step, StepType};

/// Time left before the worker deadline.
pub fn time_left(deadline: Instant) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        bail!("worker deadline exceeded");
    }
    Ok(left)
}

/// Clamp the configured step limit to whatever is left before the deadline.
pub fn step_budget(deadline: Instant, step_timeout: Duration) -> Result<Duration> {
    Ok(time_left(deadline)?.min(step_timeout))
}

/// The step's own `timeout_secs`, if it declared one.
pub fn declared_timeout(step: &Step) -> Option<Duration> {
    step.param("timeout_secs")
        .and_then(|value| value.as_positive_int())
        .map(Duration::from_secs)
}

/// Command seconds a step declares against the plan budget: a verification
/// step's `timeout_secs` (or `default_secs`), a `wait` step's `seconds`.
/// `None` for steps that run no command.
pub fn declared_command_secs(step: &Step, default_secs: u64) -> Option<u64> {
    match step.kind.known()? {
        ty if ty.capability() == Capability::Verification => Some(
            declared_timeout(step).map_or(default_secs, |timeout| timeout.as_secs()),
        ),
        StepType::Wait => Some(
            step.param("seconds")
                .and_then(|value| value.as_positive_int())
                .unwrap_or(0),
        ),
        _ => None,
    }
}

/// Command time a plan may still spend, charged as steps finish.
#[derive(Debug, Clone, Copy)]
pub struct CommandClock {
    limit: Duration,
    spent: Duration,
    default_secs: u64,
}

impl CommandClock {
    pub fn new(max_command_secs: u64, default_secs: u64) -> Self {
        Self {
            limit: Duration::from_secs(max_command_secs),
            spent: Duration::ZERO,
            default_secs,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.spent)
    }

    /// Timeout for `step`: `base` narrowed to the step's declared command time
    /// and to what is left of the plan budget. Steps that run no command keep
    /// `base`.
    pub fn allowance(&self, step: &Step, base: Duration) -> Duration {
        match declared_command_secs(step, self.default_secs) {
            Some(secs) => base.min(Duration::from_secs(secs)).min(self.remaining()),
            None => base,
        }
    }

    /// Charge the time a step actually used, if it counts against the budget.
    pub fn charge(&mut self, step: &Step, used: Duration) {
        if declared_command_secs(step, self.default_secs).is_some() {
            self.spent = self.spent.saturating_add(used);
        }
    }
}
