use serde::Serialize;
use std::fmt;

use crate::clock::Window;
use crate::config::LimitSeverity;
use crate::usage::{ScopeCounters, ScopeId};

/// Runtime limit metric. Cost limits from configuration are already
/// translated to `TotalTokens` before they reach the evaluator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Requests,
    InputTokens,
    OutputTokens,
    TotalTokens,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Requests => "requests",
            Metric::InputTokens => "input_tokens",
            Metric::OutputTokens => "output_tokens",
            Metric::TotalTokens => "total_tokens",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Limit {
    pub scope: ScopeId,
    pub window: Window,
    pub metric: Metric,
    pub threshold: u64,
    pub severity: LimitSeverity,
}

#[derive(Clone, Debug, Serialize)]
pub struct Breach {
    pub scope: String,
    pub window: Window,
    pub metric: Metric,
    pub threshold: u64,
    pub observed: u64,
    pub severity: LimitSeverity,
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} per {} at {} (threshold {})",
            self.scope,
            self.metric.as_str(),
            self.window.as_str(),
            self.observed,
            self.threshold
        )
    }
}

#[derive(Clone, Debug)]
pub enum Decision {
    Admit,
    AdmitWithWarnings(Vec<Breach>),
    Deny(Vec<Breach>),
}

/// Pure pre-flight check of one scope's counters against its limits.
///
/// A request limit is evaluated as the projected count post-request
/// (current + 1 over the threshold). Token limits can only compare the
/// already-accumulated value, since the request's own tokens are unknown
/// until the upstream call returns; both reduce to `observed >= threshold`.
/// Any hard breach denies; soft breaches alone admit with warnings.
pub fn evaluate(counters: &ScopeCounters, limits: &[Limit]) -> Decision {
    let mut hard = Vec::new();
    let mut soft = Vec::new();
    for limit in limits {
        let observed = counters.bucket(limit.window).metric(limit.metric);
        if observed >= limit.threshold {
            let breach = Breach {
                scope: limit.scope.to_string(),
                window: limit.window,
                metric: limit.metric,
                threshold: limit.threshold,
                observed,
                severity: limit.severity,
            };
            match limit.severity {
                LimitSeverity::Hard => hard.push(breach),
                LimitSeverity::Soft => soft.push(breach),
            }
        }
    }
    if !hard.is_empty() {
        hard.extend(soft);
        Decision::Deny(hard)
    } else if !soft.is_empty() {
        Decision::AdmitWithWarnings(soft)
    } else {
        Decision::Admit
    }
}

/// Post-flight check: hard token limits the just-recorded request pushed
/// over their threshold. The in-flight request is not rolled back; the
/// caller puts the provider into cooldown instead.
pub fn hard_token_breaches(counters: &ScopeCounters, limits: &[Limit]) -> Vec<Breach> {
    limits
        .iter()
        .filter(|l| l.severity == LimitSeverity::Hard && l.metric != Metric::Requests)
        .filter_map(|l| {
            let observed = counters.bucket(l.window).metric(l.metric);
            (observed >= l.threshold).then(|| Breach {
                scope: l.scope.to_string(),
                window: l.window,
                metric: l.metric,
                threshold: l.threshold,
                observed,
                severity: l.severity,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::usage::{CounterStore, ScopeId, UsageDelta};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn counters_with(requests: u64, input: u64, output: u64) -> ScopeCounters {
        let clock = Arc::new(ManualClock::new(
            chrono::Local
                .with_ymd_and_hms(2025, 6, 15, 10, 42, 30)
                .single()
                .expect("valid datetime"),
        ));
        let store = CounterStore::new(clock);
        let scope = ScopeId::provider("p");
        for _ in 0..requests {
            store.record(&scope, &UsageDelta::success(0, 0, 0.0));
        }
        if input > 0 || output > 0 {
            store.record(
                &scope,
                &UsageDelta {
                    requests: 0,
                    input_tokens: input,
                    output_tokens: output,
                    errors: 0,
                    cost: 0.0,
                },
            );
        }
        store.snapshot(&scope)
    }

    fn limit(metric: Metric, threshold: u64, severity: LimitSeverity) -> Limit {
        Limit {
            scope: ScopeId::provider("p"),
            window: Window::Minute,
            metric,
            threshold,
            severity,
        }
    }

    #[test]
    fn admits_below_threshold() {
        let counters = counters_with(9, 0, 0);
        let limits = [limit(Metric::Requests, 10, LimitSeverity::Hard)];
        assert!(matches!(evaluate(&counters, &limits), Decision::Admit));
    }

    #[test]
    fn denies_at_hard_request_threshold() {
        // 10 already recorded with a threshold of 10: the 11th is refused.
        let counters = counters_with(10, 0, 0);
        let limits = [limit(Metric::Requests, 10, LimitSeverity::Hard)];
        match evaluate(&counters, &limits) {
            Decision::Deny(breaches) => {
                assert_eq!(breaches.len(), 1);
                assert_eq!(breaches[0].observed, 10);
            }
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[test]
    fn soft_breach_warns_but_admits() {
        let counters = counters_with(10, 0, 0);
        let limits = [limit(Metric::Requests, 10, LimitSeverity::Soft)];
        assert!(matches!(
            evaluate(&counters, &limits),
            Decision::AdmitWithWarnings(_)
        ));
    }

    #[test]
    fn any_hard_breach_wins_and_reasons_accumulate() {
        let counters = counters_with(10, 600, 0);
        let limits = [
            limit(Metric::Requests, 10, LimitSeverity::Soft),
            limit(Metric::InputTokens, 500, LimitSeverity::Hard),
        ];
        match evaluate(&counters, &limits) {
            Decision::Deny(breaches) => assert_eq!(breaches.len(), 2),
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[test]
    fn accumulated_token_limits_apply_pre_flight() {
        let counters = counters_with(1, 400, 200);
        let limits = [limit(Metric::TotalTokens, 600, LimitSeverity::Hard)];
        assert!(matches!(evaluate(&counters, &limits), Decision::Deny(_)));
    }

    #[test]
    fn post_flight_reports_only_hard_token_breaches() {
        let counters = counters_with(20, 700, 0);
        let limits = [
            limit(Metric::Requests, 10, LimitSeverity::Hard),
            limit(Metric::InputTokens, 500, LimitSeverity::Hard),
            limit(Metric::OutputTokens, 500, LimitSeverity::Soft),
        ];
        let breaches = hard_token_breaches(&counters, &limits);
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].metric, Metric::InputTokens);
    }
}
