use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::errors::RelayError;
use crate::health::HealthController;
use crate::limits::{evaluate, Breach, Decision};
use crate::state::RegistrySnapshot;
use crate::usage::{CounterStore, ScopeId};

/// The scopes one attempt charges. Direct access charges only the base
/// scope; routing through a virtual also charges the virtual scope and the
/// (virtual, member) pair.
#[derive(Clone, Debug)]
pub struct ChargedScopes {
    pub member: ScopeId,
    pub virtual_scope: Option<ScopeId>,
    pub pair: Option<ScopeId>,
}

impl ChargedScopes {
    pub fn direct(provider_id: &str) -> Self {
        Self {
            member: ScopeId::provider(provider_id),
            virtual_scope: None,
            pair: None,
        }
    }

    pub fn via_virtual(virtual_id: &str, provider_id: &str) -> Self {
        Self {
            member: ScopeId::provider(provider_id),
            virtual_scope: Some(ScopeId::virtual_provider(virtual_id)),
            pair: Some(ScopeId::pair(virtual_id, provider_id)),
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &ScopeId> {
        std::iter::once(&self.member)
            .chain(self.virtual_scope.as_ref())
            .chain(self.pair.as_ref())
    }
}

#[derive(Clone)]
pub struct RouteCandidate {
    pub provider: Arc<ProviderConfig>,
    pub scopes: ChargedScopes,
}

/// Ordered, non-empty list of base providers to try in turn.
pub struct RoutingPlan {
    pub candidates: Vec<RouteCandidate>,
    pub virtual_id: Option<String>,
}

#[derive(Debug)]
pub enum Ineligible {
    Disabled,
    Unhealthy,
    HardLimited(Vec<Breach>),
}

/// Health plus pre-flight limit check for one candidate, against every
/// limit-bearing scope it would charge. Soft breaches come back as
/// warnings; the caller logs and proceeds.
pub fn check_candidate(
    snapshot: &RegistrySnapshot,
    counters: &CounterStore,
    health: &HealthController,
    candidate: &RouteCandidate,
) -> Result<Vec<Breach>, Ineligible> {
    if !candidate.provider.enabled {
        return Err(Ineligible::Disabled);
    }
    if !health.eligible(&candidate.provider.id) {
        return Err(Ineligible::Unhealthy);
    }
    let mut warnings = Vec::new();
    let limited_scopes = [Some(&candidate.scopes.member), candidate.scopes.virtual_scope.as_ref()];
    for scope in limited_scopes.into_iter().flatten() {
        let limits = snapshot.limits_for(scope);
        if limits.is_empty() {
            continue;
        }
        let totals = counters.snapshot(scope);
        match evaluate(&totals, limits) {
            Decision::Admit => {}
            Decision::AdmitWithWarnings(w) => warnings.extend(w),
            Decision::Deny(breaches) => return Err(Ineligible::HardLimited(breaches)),
        }
    }
    Ok(warnings)
}

/// Resolve one request to an ordered candidate list.
///
/// An explicit selector names a single base provider and bypasses virtual
/// logic entirely; otherwise the model resolves to a base provider or to a
/// virtual provider whose members are taken in (priority, id) order and
/// filtered down to the currently eligible.
pub fn route(
    snapshot: &RegistrySnapshot,
    counters: &CounterStore,
    health: &HealthController,
    model: &str,
    explicit: Option<&str>,
) -> Result<RoutingPlan, RelayError> {
    if let Some(provider_id) = explicit {
        let provider = snapshot.providers.get(provider_id).ok_or_else(|| {
            RelayError::InvalidRequest(format!("unknown provider {}", provider_id))
        })?;
        let candidate = RouteCandidate {
            provider: provider.clone(),
            scopes: ChargedScopes::direct(provider_id),
        };
        return single_candidate_plan(snapshot, counters, health, candidate);
    }

    if let Some(provider) = snapshot.providers.get(model) {
        let candidate = RouteCandidate {
            provider: provider.clone(),
            scopes: ChargedScopes::direct(model),
        };
        return single_candidate_plan(snapshot, counters, health, candidate);
    }

    if let Some(virt) = snapshot.virtuals.get(model) {
        let virtual_scope = ScopeId::virtual_provider(&virt.id);
        let virtual_limits = snapshot.limits_for(&virtual_scope);
        if !virtual_limits.is_empty() {
            match evaluate(&counters.snapshot(&virtual_scope), virtual_limits) {
                Decision::Admit => {}
                Decision::AdmitWithWarnings(warnings) => log_warnings(&warnings),
                Decision::Deny(breaches) => return Err(limit_error(breaches)),
            }
        }

        let mut members = virt.members.clone();
        members.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.provider.cmp(&b.provider))
        });

        let mut candidates = Vec::new();
        for member in &members {
            let Some(provider) = snapshot.providers.get(&member.provider) else {
                continue;
            };
            let candidate = RouteCandidate {
                provider: provider.clone(),
                scopes: ChargedScopes::via_virtual(&virt.id, &member.provider),
            };
            match check_candidate(snapshot, counters, health, &candidate) {
                Ok(warnings) => {
                    log_warnings(&warnings);
                    candidates.push(candidate);
                }
                Err(reason) => {
                    debug!(
                        provider = %member.provider,
                        "skipping member of {}: {:?}",
                        virt.id,
                        reason
                    );
                }
            }
        }

        if candidates.is_empty() {
            return Err(RelayError::NoProviderAvailable(format!(
                "virtual provider {} has no eligible member",
                virt.id
            )));
        }
        return Ok(RoutingPlan {
            candidates,
            virtual_id: Some(virt.id.clone()),
        });
    }

    Err(RelayError::InvalidRequest(format!("unknown model {}", model)))
}

fn single_candidate_plan(
    snapshot: &RegistrySnapshot,
    counters: &CounterStore,
    health: &HealthController,
    candidate: RouteCandidate,
) -> Result<RoutingPlan, RelayError> {
    match check_candidate(snapshot, counters, health, &candidate) {
        Ok(warnings) => {
            log_warnings(&warnings);
            Ok(RoutingPlan {
                candidates: vec![candidate],
                virtual_id: None,
            })
        }
        Err(Ineligible::HardLimited(breaches)) => Err(limit_error(breaches)),
        Err(reason) => Err(RelayError::NoProviderAvailable(format!(
            "provider {} is not available: {:?}",
            candidate.provider.id, reason
        ))),
    }
}

fn log_warnings(warnings: &[Breach]) {
    for w in warnings {
        warn!(scope = %w.scope, "soft limit breached: {}", w);
    }
}

pub fn limit_error(breaches: Vec<Breach>) -> RelayError {
    let detail = breaches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    let first = &breaches[0];
    RelayError::LimitExceeded {
        scope: first.scope.clone(),
        window: first.window.as_str(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, Window};
    use crate::config::{
        Config, CooldownPolicy, LimitConfig, LimitMetric, LimitSeverity, ProviderKind,
        VirtualMember, VirtualProviderConfig,
    };
    use crate::health::HealthPolicy;
    use crate::usage::UsageDelta;
    use chrono::TimeZone;
    use std::collections::HashMap;

    struct Fixture {
        snapshot: RegistrySnapshot,
        counters: CounterStore,
        health: HealthController,
        clock: Arc<ManualClock>,
    }

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            display_name: String::new(),
            kind: ProviderKind::Http {
                base_url: "http://localhost:9000/v1".to_string(),
                auth_header: None,
                extra_headers: HashMap::new(),
                timeout_ms: 30_000,
                retry_count: 0,
                health_path: "/models".to_string(),
            },
            enabled: true,
            cost: None,
            cooldown: CooldownPolicy::Exponential {
                base_seconds: 1,
                cap_seconds: 60,
            },
            failure_threshold: 3,
        }
    }

    fn fixture(limits: Vec<LimitConfig>) -> Fixture {
        let cfg = Config {
            providers: vec![provider("a"), provider("b")],
            virtual_providers: vec![VirtualProviderConfig {
                id: "main".to_string(),
                display_name: String::new(),
                members: vec![
                    VirtualMember {
                        provider: "b".to_string(),
                        priority: 2,
                    },
                    VirtualMember {
                        provider: "a".to_string(),
                        priority: 1,
                    },
                ],
            }],
            limits,
        };
        let clock = Arc::new(ManualClock::new(
            chrono::Local
                .with_ymd_and_hms(2025, 6, 15, 10, 0, 0)
                .single()
                .expect("valid datetime"),
        ));
        let snapshot = RegistrySnapshot::build(&cfg, 1).expect("snapshot");
        let counters = CounterStore::new(clock.clone());
        let health = HealthController::new(clock.clone());
        health.ensure("a");
        health.ensure("b");
        Fixture {
            snapshot,
            counters,
            health,
            clock,
        }
    }

    fn candidate_ids(plan: &RoutingPlan) -> Vec<&str> {
        plan.candidates
            .iter()
            .map(|c| c.provider.id.as_str())
            .collect()
    }

    #[test]
    fn members_are_ordered_by_priority_with_id_tiebreak() {
        let f = fixture(vec![]);
        let plan = route(&f.snapshot, &f.counters, &f.health, "main", None).expect("plan");
        assert_eq!(candidate_ids(&plan), vec!["a", "b"]);
        assert_eq!(plan.virtual_id.as_deref(), Some("main"));
    }

    #[test]
    fn cooling_member_is_excluded_until_deadline() {
        let f = fixture(vec![]);
        let policy = HealthPolicy::from(&provider("a"));
        for _ in 0..3 {
            f.health.on_failure("a", &policy, "boom");
        }
        let plan = route(&f.snapshot, &f.counters, &f.health, "main", None).expect("plan");
        assert_eq!(candidate_ids(&plan), vec!["b"]);

        f.clock.advance(chrono::Duration::seconds(1));
        let plan = route(&f.snapshot, &f.counters, &f.health, "main", None).expect("plan");
        assert_eq!(candidate_ids(&plan), vec!["a", "b"]);
    }

    #[test]
    fn hard_limited_member_is_skipped() {
        let f = fixture(vec![LimitConfig {
            scope: "a".to_string(),
            window: Window::Minute,
            metric: LimitMetric::Requests,
            threshold: 10.0,
            severity: LimitSeverity::Hard,
        }]);
        for _ in 0..10 {
            f.counters
                .record(&ScopeId::provider("a"), &UsageDelta::success(0, 0, 0.0));
        }
        let plan = route(&f.snapshot, &f.counters, &f.health, "main", None).expect("plan");
        assert_eq!(candidate_ids(&plan), vec!["b"]);
    }

    #[test]
    fn soft_limit_does_not_refuse_selection() {
        let f = fixture(vec![LimitConfig {
            scope: "a".to_string(),
            window: Window::Minute,
            metric: LimitMetric::Requests,
            threshold: 10.0,
            severity: LimitSeverity::Soft,
        }]);
        for _ in 0..20 {
            f.counters
                .record(&ScopeId::provider("a"), &UsageDelta::success(0, 0, 0.0));
        }
        let plan = route(&f.snapshot, &f.counters, &f.health, "main", None).expect("plan");
        assert_eq!(candidate_ids(&plan), vec!["a", "b"]);
    }

    #[test]
    fn virtual_scope_hard_limit_denies_the_whole_plan() {
        let f = fixture(vec![LimitConfig {
            scope: "main".to_string(),
            window: Window::Minute,
            metric: LimitMetric::Requests,
            threshold: 5.0,
            severity: LimitSeverity::Hard,
        }]);
        for _ in 0..5 {
            f.counters.record(
                &ScopeId::virtual_provider("main"),
                &UsageDelta::success(0, 0, 0.0),
            );
        }
        match route(&f.snapshot, &f.counters, &f.health, "main", None) {
            Err(RelayError::LimitExceeded { scope, .. }) => assert_eq!(scope, "main"),
            other => panic!("expected limit error, got {:?}", other.map(|p| candidate_ids(&p).len())),
        }
    }

    #[test]
    fn explicit_selector_bypasses_virtual_accounting() {
        let f = fixture(vec![]);
        let plan =
            route(&f.snapshot, &f.counters, &f.health, "main", Some("a")).expect("plan");
        assert_eq!(candidate_ids(&plan), vec!["a"]);
        assert!(plan.virtual_id.is_none());
        let scopes = &plan.candidates[0].scopes;
        assert!(scopes.virtual_scope.is_none());
        assert!(scopes.pair.is_none());
    }

    #[test]
    fn model_naming_a_base_provider_routes_directly() {
        let f = fixture(vec![]);
        let plan = route(&f.snapshot, &f.counters, &f.health, "b", None).expect("plan");
        assert_eq!(candidate_ids(&plan), vec!["b"]);
        assert!(plan.virtual_id.is_none());
    }

    #[test]
    fn virtual_members_charge_all_three_scopes() {
        let f = fixture(vec![]);
        let plan = route(&f.snapshot, &f.counters, &f.health, "main", None).expect("plan");
        let scopes = &plan.candidates[0].scopes;
        assert_eq!(scopes.member, ScopeId::provider("a"));
        assert_eq!(
            scopes.virtual_scope,
            Some(ScopeId::virtual_provider("main"))
        );
        assert_eq!(scopes.pair, Some(ScopeId::pair("main", "a")));
    }

    #[test]
    fn unknown_model_is_a_client_error() {
        let f = fixture(vec![]);
        assert!(matches!(
            route(&f.snapshot, &f.counters, &f.health, "ghost", None),
            Err(RelayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn exhausted_virtual_reports_no_provider_available() {
        let f = fixture(vec![]);
        let policy = HealthPolicy::from(&provider("a"));
        for _ in 0..3 {
            f.health.on_failure("a", &policy, "boom");
            f.health.on_failure("b", &policy, "boom");
        }
        assert!(matches!(
            route(&f.snapshot, &f.counters, &f.health, "main", None),
            Err(RelayError::NoProviderAvailable(_))
        ));
    }

    #[test]
    fn hard_limited_direct_access_is_a_limit_error() {
        let f = fixture(vec![LimitConfig {
            scope: "a".to_string(),
            window: Window::Minute,
            metric: LimitMetric::Requests,
            threshold: 1.0,
            severity: LimitSeverity::Hard,
        }]);
        f.counters
            .record(&ScopeId::provider("a"), &UsageDelta::success(0, 0, 0.0));
        assert!(matches!(
            route(&f.snapshot, &f.counters, &f.health, "a", None),
            Err(RelayError::LimitExceeded { .. })
        ));
    }
}
