//! Provider scoring and ordering.
//!
//! Pure over a slice of [`Candidate`]s so routing decisions are testable
//! without backends or clocks.

use std::cmp::Ordering;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::types::{TaskType, UserTier};

/// Points for a specialty match.
pub const SPECIALTY_BONUS: f64 = 10.0;
/// Points for rate headroom.
pub const HEADROOM_BONUS: f64 = 5.0;
/// Weight of `1 / cost_per_token`.
pub const COST_WEIGHT: f64 = 0.1;

/// What the selector needs to know about one AVAILABLE provider.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    /// Provider name.
    pub name: &'a str,
    /// Declared specialties.
    pub specialties: &'a [TaskType],
    /// Calls in the trailing window.
    pub current_usage: u32,
    /// Calls admitted per window.
    pub rate_limit: u32,
    /// Price of one token.
    pub cost_per_token: Decimal,
    /// Lower is preferred.
    pub priority: u32,
    /// Position in the registry, the final tie-breaker.
    pub index: usize,
}

impl Candidate<'_> {
    /// Whether one more call fits under the rate limit.
    #[must_use]
    pub fn admitted(&self) -> bool {
        self.current_usage < self.rate_limit
    }

    /// Routing score for `task`.
    #[must_use]
    pub fn score(&self, task: TaskType, rate_threshold: f64) -> f64 {
        let mut score = 0.0;
        if self.specialties.contains(&task) {
            score += SPECIALTY_BONUS;
        }
        if f64::from(self.current_usage) < rate_threshold * f64::from(self.rate_limit) {
            score += HEADROOM_BONUS;
        }
        if self.cost_per_token > Decimal::ZERO {
            if let Some(cost) = self.cost_per_token.to_f64() {
                score += (1.0 / cost) * COST_WEIGHT;
            }
        }
        score
    }
}

/// Admitted candidates in the order they should be tried.
///
/// Basic tier: declared priority, then registry order. Premium: score
/// descending, ties by priority, then registry order.
#[must_use]
pub fn rank<'a>(candidates: Vec<Candidate<'a>>, task: TaskType, tier: UserTier, rate_threshold: f64) -> Vec<Candidate<'a>> {
    let mut admitted: Vec<(f64, Candidate<'a>)> = candidates
        .into_iter()
        .filter(Candidate::admitted)
        .map(|c| (c.score(task, rate_threshold), c))
        .collect();

    let by_priority = |a: &Candidate<'_>, b: &Candidate<'_>| a.priority.cmp(&b.priority).then(a.index.cmp(&b.index));
    match tier {
        UserTier::Basic => admitted.sort_by(|(_, a), (_, b)| by_priority(a, b)),
        UserTier::Premium => admitted.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa).unwrap_or(Ordering::Equal).then_with(|| by_priority(a, b))
        }),
    }
    admitted.into_iter().map(|(_, c)| c).collect()
}
