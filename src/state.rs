use anyhow::{bail, Context};
use parking_lot::RwLock;
use reqwest::Client;
use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

use crate::config::{
    Config, CostCatalog, LimitConfig, LimitMetric, ProviderConfig, ProviderKind, Settings,
    VirtualProviderConfig,
};
use crate::health::{self, HealthController};
use crate::limits::{Limit, Metric};
use crate::usage::{CounterStore, ScopeId};

/// Immutable view of the configured world. Requests clone the `Arc` once at
/// the door and see this exact catalog until they finish, whatever
/// reconfiguration happens meanwhile.
pub struct RegistrySnapshot {
    pub version: u64,
    pub providers: HashMap<String, Arc<ProviderConfig>>,
    pub virtuals: HashMap<String, Arc<VirtualProviderConfig>>,
    limits: HashMap<ScopeId, Vec<Limit>>,
}

impl RegistrySnapshot {
    pub fn build(cfg: &Config, version: u64) -> anyhow::Result<Self> {
        let mut ids = HashSet::new();
        for p in &cfg.providers {
            if p.id.is_empty() {
                bail!("provider with empty id");
            }
            if !ids.insert(p.id.clone()) {
                bail!("duplicate id {}", p.id);
            }
            if let ProviderKind::Http { base_url, .. } = &p.kind {
                reqwest::Url::parse(base_url)
                    .with_context(|| format!("provider {} has invalid base_url", p.id))?;
            }
        }
        let provider_ids: HashSet<&str> = cfg.providers.iter().map(|p| p.id.as_str()).collect();
        for v in &cfg.virtual_providers {
            if v.id.is_empty() {
                bail!("virtual provider with empty id");
            }
            if !ids.insert(v.id.clone()) {
                bail!("duplicate id {}", v.id);
            }
            if v.members.len() < 2 {
                bail!("virtual provider {} needs at least two members", v.id);
            }
            for m in &v.members {
                if !provider_ids.contains(m.provider.as_str()) {
                    bail!("virtual provider {} references unknown provider {}", v.id, m.provider);
                }
            }
        }

        let providers: HashMap<String, Arc<ProviderConfig>> = cfg
            .providers
            .iter()
            .map(|p| (p.id.clone(), Arc::new(p.clone())))
            .collect();
        let virtuals: HashMap<String, Arc<VirtualProviderConfig>> = cfg
            .virtual_providers
            .iter()
            .map(|v| (v.id.clone(), Arc::new(v.clone())))
            .collect();

        let mut limits: HashMap<ScopeId, Vec<Limit>> = HashMap::new();
        for lc in &cfg.limits {
            let (scope, price) = if providers.contains_key(&lc.scope) {
                let price = providers[&lc.scope]
                    .cost
                    .as_ref()
                    .map(CostCatalog::max_price_per_token);
                (ScopeId::provider(&lc.scope), price)
            } else if let Some(v) = virtuals.get(&lc.scope) {
                // A virtual has no catalog of its own; price cost limits at
                // the dearest member so the derived cap stays conservative.
                let price = v
                    .members
                    .iter()
                    .filter_map(|m| providers.get(&m.provider))
                    .filter_map(|p| p.cost.as_ref().map(CostCatalog::max_price_per_token))
                    .fold(None::<f64>, |acc, p| Some(acc.map_or(p, |a| a.max(p))));
                (ScopeId::virtual_provider(&lc.scope), price)
            } else {
                bail!("limit references unknown scope {}", lc.scope);
            };
            let limit = build_limit(lc, scope.clone(), price)?;
            limits.entry(scope).or_default().push(limit);
        }

        Ok(Self {
            version,
            providers,
            virtuals,
            limits,
        })
    }

    pub fn limits_for(&self, scope: &ScopeId) -> &[Limit] {
        self.limits.get(scope).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolve an externally supplied scope string: a bare provider or
    /// virtual id, or `virtual/member` for the pair scope.
    pub fn resolve_scope(&self, raw: &str) -> Option<ScopeId> {
        if let Some((virtual_id, provider_id)) = raw.split_once('/') {
            let v = self.virtuals.get(virtual_id)?;
            v.members.iter().any(|m| m.provider == provider_id).then(|| {
                ScopeId::pair(virtual_id, provider_id)
            })
        } else if self.providers.contains_key(raw) {
            Some(ScopeId::provider(raw))
        } else if self.virtuals.contains_key(raw) {
            Some(ScopeId::virtual_provider(raw))
        } else {
            None
        }
    }
}

fn build_limit(lc: &LimitConfig, scope: ScopeId, price: Option<f64>) -> anyhow::Result<Limit> {
    if lc.threshold <= 0.0 {
        bail!("limit on {} has non-positive threshold", lc.scope);
    }
    let (metric, threshold) = match lc.metric {
        LimitMetric::Requests => (Metric::Requests, lc.threshold as u64),
        LimitMetric::InputTokens => (Metric::InputTokens, lc.threshold as u64),
        LimitMetric::OutputTokens => (Metric::OutputTokens, lc.threshold as u64),
        LimitMetric::TotalTokens => (Metric::TotalTokens, lc.threshold as u64),
        LimitMetric::Cost => {
            let price = price.with_context(|| {
                format!("cost limit on {} requires a cost catalog", lc.scope)
            })?;
            if price <= 0.0 {
                bail!("cost limit on {} requires non-zero prices", lc.scope);
            }
            // Ceiling: the derived token cap never admits more spend than
            // the configured amount.
            (Metric::TotalTokens, (lc.threshold / price).ceil() as u64)
        }
    };
    Ok(Limit {
        scope,
        window: lc.window,
        metric,
        threshold,
        severity: lc.severity,
    })
}

/// Atomically swapped snapshot handle.
pub struct Registry {
    current: RwLock<Arc<RegistrySnapshot>>,
    version: AtomicU64,
}

impl Registry {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let snapshot = RegistrySnapshot::build(cfg, 1)?;
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            version: AtomicU64::new(1),
        })
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    /// Validate and swap. A failed build leaves the old snapshot in place.
    pub fn publish(&self, cfg: &Config) -> anyhow::Result<()> {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = RegistrySnapshot::build(cfg, version)?;
        *self.current.write() = Arc::new(snapshot);
        Ok(())
    }
}

pub struct AppState {
    pub settings: Settings,
    pub cfg: RwLock<Config>,
    pub registry: Registry,
    pub counters: Arc<CounterStore>,
    pub health: Arc<HealthController>,
    pub client: Client,
    pub total_requests: AtomicU64,
}

impl AppState {
    pub fn new(
        settings: Settings,
        cfg: Config,
        counters: Arc<CounterStore>,
        health: Arc<HealthController>,
        client: Client,
    ) -> anyhow::Result<Self> {
        let registry = Registry::new(&cfg)?;
        health::reconcile(&health, &cfg.providers);
        Ok(Self {
            settings,
            cfg: RwLock::new(cfg),
            registry,
            counters,
            health,
            client,
            total_requests: AtomicU64::new(0),
        })
    }

    /// Publish a new configuration: validate, swap the registry snapshot,
    /// reconcile health records, then store the raw document.
    pub fn apply_config(&self, new_cfg: Config) -> anyhow::Result<()> {
        self.registry.publish(&new_cfg)?;
        health::reconcile(&self.health, &new_cfg.providers);
        *self.cfg.write() = new_cfg;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Window;
    use crate::config::{CooldownPolicy, LimitSeverity, VirtualMember};

    fn provider(id: &str, cost: Option<CostCatalog>) -> ProviderConfig {
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
            cost,
            cooldown: CooldownPolicy::default(),
            failure_threshold: 3,
        }
    }

    fn catalog(input: f64, output: f64) -> CostCatalog {
        CostCatalog {
            currency: "USD".to_string(),
            input_per_million: input,
            output_per_million: output,
        }
    }

    fn two_member_config() -> Config {
        Config {
            providers: vec![provider("a", None), provider("b", None)],
            virtual_providers: vec![VirtualProviderConfig {
                id: "main".to_string(),
                display_name: String::new(),
                members: vec![
                    VirtualMember {
                        provider: "a".to_string(),
                        priority: 1,
                    },
                    VirtualMember {
                        provider: "b".to_string(),
                        priority: 2,
                    },
                ],
            }],
            limits: vec![],
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let cfg = Config {
            providers: vec![provider("a", None), provider("a", None)],
            ..Config::default()
        };
        assert!(RegistrySnapshot::build(&cfg, 1).is_err());
    }

    #[test]
    fn single_member_virtual_is_rejected() {
        let mut cfg = two_member_config();
        cfg.virtual_providers[0].members.truncate(1);
        assert!(RegistrySnapshot::build(&cfg, 1).is_err());
    }

    #[test]
    fn unknown_member_is_rejected() {
        let mut cfg = two_member_config();
        cfg.virtual_providers[0].members[1].provider = "ghost".to_string();
        assert!(RegistrySnapshot::build(&cfg, 1).is_err());
    }

    #[test]
    fn limit_on_unknown_scope_is_rejected() {
        let mut cfg = two_member_config();
        cfg.limits.push(LimitConfig {
            scope: "ghost".to_string(),
            window: Window::Day,
            metric: LimitMetric::Requests,
            threshold: 10.0,
            severity: LimitSeverity::Hard,
        });
        assert!(RegistrySnapshot::build(&cfg, 1).is_err());
    }

    #[test]
    fn cost_limit_without_catalog_is_rejected() {
        let mut cfg = two_member_config();
        cfg.limits.push(LimitConfig {
            scope: "a".to_string(),
            window: Window::Day,
            metric: LimitMetric::Cost,
            threshold: 5.0,
            severity: LimitSeverity::Hard,
        });
        assert!(RegistrySnapshot::build(&cfg, 1).is_err());
    }

    #[test]
    fn cost_limit_derives_token_threshold_with_ceiling() {
        let mut cfg = two_member_config();
        cfg.providers[0].cost = Some(catalog(3.0, 15.0));
        cfg.limits.push(LimitConfig {
            scope: "a".to_string(),
            window: Window::Day,
            metric: LimitMetric::Cost,
            threshold: 1.0,
            severity: LimitSeverity::Hard,
        });
        let snap = RegistrySnapshot::build(&cfg, 1).expect("build");
        let limits = snap.limits_for(&ScopeId::provider("a"));
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0].metric, Metric::TotalTokens);
        // $1 at $15/M on the dearer direction: 66666.67 tokens, ceiled.
        assert_eq!(limits[0].threshold, 66_667);
    }

    #[test]
    fn virtual_cost_limit_uses_dearest_member_price() {
        let mut cfg = two_member_config();
        cfg.providers[0].cost = Some(catalog(3.0, 15.0));
        cfg.providers[1].cost = Some(catalog(1.0, 30.0));
        cfg.limits.push(LimitConfig {
            scope: "main".to_string(),
            window: Window::Month,
            metric: LimitMetric::Cost,
            threshold: 3.0,
            severity: LimitSeverity::Soft,
        });
        let snap = RegistrySnapshot::build(&cfg, 1).expect("build");
        let limits = snap.limits_for(&ScopeId::virtual_provider("main"));
        // $3 at $30/M = exactly 100k tokens.
        assert_eq!(limits[0].threshold, 100_000);
    }

    #[test]
    fn resolve_scope_forms() {
        let cfg = two_member_config();
        let snap = RegistrySnapshot::build(&cfg, 1).expect("build");
        assert_eq!(snap.resolve_scope("a"), Some(ScopeId::provider("a")));
        assert_eq!(
            snap.resolve_scope("main"),
            Some(ScopeId::virtual_provider("main"))
        );
        assert_eq!(
            snap.resolve_scope("main/b"),
            Some(ScopeId::pair("main", "b"))
        );
        assert_eq!(snap.resolve_scope("main/ghost"), None);
        assert_eq!(snap.resolve_scope("ghost"), None);
    }

    #[test]
    fn in_flight_snapshot_is_unaffected_by_publish() {
        let registry = Registry::new(&two_member_config()).expect("registry");
        let held = registry.snapshot();
        assert_eq!(held.providers.len(), 2);

        let mut next = two_member_config();
        next.providers.push(provider("c", None));
        next.virtual_providers[0].members.push(VirtualMember {
            provider: "c".to_string(),
            priority: 3,
        });
        registry.publish(&next).expect("publish");

        // The held snapshot is the pre-swap world, coherent in full.
        assert_eq!(held.providers.len(), 2);
        assert_eq!(held.version, 1);
        let fresh = registry.snapshot();
        assert_eq!(fresh.providers.len(), 3);
        assert_eq!(fresh.version, 2);
    }

    #[test]
    fn failed_publish_keeps_previous_snapshot() {
        let registry = Registry::new(&two_member_config()).expect("registry");
        let mut broken = two_member_config();
        broken.virtual_providers[0].members[0].provider = "ghost".to_string();
        assert!(registry.publish(&broken).is_err());
        assert_eq!(registry.snapshot().providers.len(), 2);
    }
}
