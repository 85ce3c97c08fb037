use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{collections::HashMap, collections::HashSet, path::Path, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{CooldownPolicy, ProviderConfig, ProviderKind};
use crate::state::AppState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Cooling,
    Disabled,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Cooling => "cooling",
            HealthState::Disabled => "disabled",
        }
    }
}

#[derive(Clone, Debug)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub cooldown: CooldownPolicy,
}

impl From<&ProviderConfig> for HealthPolicy {
    fn from(p: &ProviderConfig) -> Self {
        Self {
            failure_threshold: p.failure_threshold.max(1),
            cooldown: p.cooldown.clone(),
        }
    }
}

#[derive(Debug)]
struct ProviderHealth {
    state: HealthState,
    consecutive_failures: u32,
    cooldown_until: Option<DateTime<Local>>,
    last_probe_at: Option<DateTime<Local>>,
    last_error: Option<String>,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            cooldown_until: None,
            last_probe_at: None,
            last_error: None,
        }
    }
}

/// Serializable health summary for status output.
#[derive(Clone, Debug, Serialize)]
pub struct HealthView {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub cooldown_remaining_s: Option<u64>,
    pub last_probe_at: Option<DateTime<Local>>,
    pub last_error: Option<String>,
}

/// Per-provider health records behind one mutex each. Cooldown expiry is
/// applied lazily on observation, the way the relay's ban deadlines work:
/// nothing wakes up to flip state, the next eligibility check does it.
pub struct HealthController {
    clock: Arc<dyn Clock>,
    records: RwLock<HashMap<String, Arc<Mutex<ProviderHealth>>>>,
}

impl HealthController {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn ensure(&self, provider_id: &str) {
        let mut map = self.records.write();
        map.entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ProviderHealth::new())));
    }

    /// Drop records for providers that no longer exist.
    pub fn retain(&self, provider_ids: &HashSet<String>) {
        self.records.write().retain(|id, _| provider_ids.contains(id));
    }

    fn handle(&self, provider_id: &str) -> Arc<Mutex<ProviderHealth>> {
        if let Some(h) = self.records.read().get(provider_id) {
            return h.clone();
        }
        self.records
            .write()
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ProviderHealth::new())))
            .clone()
    }

    /// Manual disable removes the provider from rotation until re-enabled.
    pub fn set_enabled(&self, provider_id: &str, enabled: bool) {
        let handle = self.handle(provider_id);
        let mut rec = handle.lock();
        if !enabled {
            rec.state = HealthState::Disabled;
            rec.cooldown_until = None;
        } else if rec.state == HealthState::Disabled {
            rec.state = HealthState::Healthy;
            rec.consecutive_failures = 0;
            rec.cooldown_until = None;
        }
    }

    /// Whether the provider may be selected right now. Expired cooldowns
    /// transition to healthy-on-probation here, with the failure count
    /// retained so backoff keeps growing if the next attempt fails too.
    pub fn eligible(&self, provider_id: &str) -> bool {
        let handle = self.handle(provider_id);
        let now = self.clock.now();
        let mut rec = handle.lock();
        expire_if_due(&mut rec, now);
        matches!(rec.state, HealthState::Healthy | HealthState::Degraded)
    }

    pub fn on_success(&self, provider_id: &str) {
        let handle = self.handle(provider_id);
        let now = self.clock.now();
        let mut rec = handle.lock();
        apply_success(&mut rec, now);
    }

    pub fn on_failure(&self, provider_id: &str, policy: &HealthPolicy, error: &str) {
        let handle = self.handle(provider_id);
        let now = self.clock.now();
        let mut rec = handle.lock();
        apply_failure(&mut rec, policy, now, error);
        if rec.state == HealthState::Cooling {
            warn!(
                provider = provider_id,
                failures = rec.consecutive_failures,
                until = %rec.cooldown_until.map(|d| d.to_rfc3339()).unwrap_or_default(),
                "provider entered cooldown: {}",
                error
            );
        }
    }

    /// Immediate cooldown regardless of the failure threshold. Used for
    /// upstream auth rejections (unlikely to self-repair) and upstream rate
    /// limiting, where `min_cooldown` carries any Retry-After hint.
    pub fn force_cooling(
        &self,
        provider_id: &str,
        policy: &HealthPolicy,
        min_cooldown: Option<Duration>,
        error: &str,
    ) {
        let handle = self.handle(provider_id);
        let now = self.clock.now();
        let mut rec = handle.lock();
        if rec.state == HealthState::Disabled {
            return;
        }
        rec.consecutive_failures = rec.consecutive_failures.saturating_add(1);
        let mut secs = cooldown_seconds(&policy.cooldown, policy.failure_threshold, rec.consecutive_failures);
        if let Some(min) = min_cooldown {
            secs = secs.max(min.as_secs());
        }
        rec.state = HealthState::Cooling;
        rec.cooldown_until = Some(now + chrono::Duration::seconds(secs as i64));
        rec.last_error = Some(error.to_string());
        warn!(provider = provider_id, cooldown_s = secs, "provider forced into cooldown: {}", error);
    }

    /// A probe outcome counts as a success/failure event for state purposes
    /// but touches no usage counters.
    pub fn on_probe(&self, provider_id: &str, policy: &HealthPolicy, result: Result<(), String>) {
        let handle = self.handle(provider_id);
        let now = self.clock.now();
        let mut rec = handle.lock();
        rec.last_probe_at = Some(now);
        match result {
            Ok(()) => apply_success(&mut rec, now),
            Err(e) => {
                debug!(provider = provider_id, "probe failed: {}", e);
                apply_failure(&mut rec, policy, now, &e);
            }
        }
    }

    pub fn view(&self, provider_id: &str) -> Option<HealthView> {
        let handle = self.records.read().get(provider_id)?.clone();
        let now = self.clock.now();
        let rec = handle.lock();
        let (state, remaining) = match (rec.state, rec.cooldown_until) {
            (HealthState::Cooling, Some(until)) if until > now => (
                HealthState::Cooling,
                Some((until - now).num_seconds().max(0) as u64),
            ),
            // Deadline passed but nothing observed it yet: report as healthy.
            (HealthState::Cooling, _) => (HealthState::Healthy, None),
            (state, _) => (state, None),
        };
        Some(HealthView {
            state,
            consecutive_failures: rec.consecutive_failures,
            cooldown_remaining_s: remaining,
            last_probe_at: rec.last_probe_at,
            last_error: rec.last_error.clone(),
        })
    }
}

fn expire_if_due(rec: &mut ProviderHealth, now: DateTime<Local>) {
    if rec.state == HealthState::Cooling {
        let due = rec.cooldown_until.map(|until| now >= until).unwrap_or(true);
        if due {
            // Probation: healthy again, failure count retained.
            rec.state = HealthState::Healthy;
            rec.cooldown_until = None;
        }
    }
}

fn apply_success(rec: &mut ProviderHealth, now: DateTime<Local>) {
    if rec.state == HealthState::Disabled {
        return;
    }
    expire_if_due(rec, now);
    if rec.state == HealthState::Cooling {
        // Still inside the cooldown; nothing re-admits early.
        return;
    }
    rec.consecutive_failures = 0;
    rec.state = HealthState::Healthy;
}

fn apply_failure(rec: &mut ProviderHealth, policy: &HealthPolicy, now: DateTime<Local>, error: &str) {
    if rec.state == HealthState::Disabled {
        return;
    }
    expire_if_due(rec, now);
    rec.consecutive_failures = rec.consecutive_failures.saturating_add(1);
    rec.last_error = Some(error.to_string());
    if rec.state == HealthState::Cooling {
        // Failures while already cooling extend the deadline per policy.
        if rec.consecutive_failures >= policy.failure_threshold {
            let secs =
                cooldown_seconds(&policy.cooldown, policy.failure_threshold, rec.consecutive_failures);
            rec.cooldown_until = Some(now + chrono::Duration::seconds(secs as i64));
        }
        return;
    }
    if rec.consecutive_failures >= policy.failure_threshold {
        let secs =
            cooldown_seconds(&policy.cooldown, policy.failure_threshold, rec.consecutive_failures);
        rec.state = HealthState::Cooling;
        rec.cooldown_until = Some(now + chrono::Duration::seconds(secs as i64));
    } else {
        rec.state = HealthState::Degraded;
    }
}

fn cooldown_seconds(policy: &CooldownPolicy, threshold: u32, failures: u32) -> u64 {
    match policy {
        CooldownPolicy::Fixed { seconds } => *seconds,
        CooldownPolicy::Exponential {
            base_seconds,
            cap_seconds,
        } => {
            let exp = failures.saturating_sub(threshold).min(32);
            base_seconds.saturating_mul(1u64 << exp).min(*cap_seconds)
        }
    }
}

// ----------------------
// Probe loop
// ----------------------

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Periodic out-of-band probes: HTTP health endpoint for remote providers,
/// executable presence for local ones. All providers are probed
/// concurrently, then the loop sleeps.
pub async fn probe_loop(state: Arc<AppState>) {
    loop {
        let interval = state.settings.probe_interval_s.max(1);
        let snapshot = state.registry.snapshot();

        let mut handles = Vec::with_capacity(snapshot.providers.len());
        for provider in snapshot.providers.values() {
            if !provider.enabled {
                continue;
            }
            let provider = provider.clone();
            let client = state.client.clone();
            let health = state.health.clone();
            handles.push(tokio::spawn(async move {
                let result = probe_provider(&client, &provider).await;
                health.on_probe(&provider.id, &HealthPolicy::from(&*provider), result);
            }));
        }
        for h in handles {
            let _ = h.await;
        }

        debug!("probe round done");
        sleep(Duration::from_secs(interval)).await;
    }
}

async fn probe_provider(client: &reqwest::Client, provider: &ProviderConfig) -> Result<(), String> {
    match &provider.kind {
        ProviderKind::Http {
            base_url,
            auth_header,
            health_path,
            ..
        } => {
            let url = format!("{}{}", base_url.trim_end_matches('/'), health_path);
            let mut req = client.get(&url).timeout(PROBE_TIMEOUT);
            if let Some(auth) = auth_header {
                req = req.header(reqwest::header::AUTHORIZATION, auth);
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => Ok(()),
                Ok(resp) => Err(format!("probe status {}", resp.status())),
                Err(e) if e.is_timeout() => Err("probe timeout".to_string()),
                Err(e) => Err(format!("probe error: {}", e)),
            }
        }
        ProviderKind::Local { command, .. } => {
            if Path::new(command).exists() {
                Ok(())
            } else {
                Err(format!("executable {} not found", command))
            }
        }
    }
}

pub fn reconcile(health: &HealthController, providers: &[ProviderConfig]) {
    let ids: HashSet<String> = providers.iter().map(|p| p.id.clone()).collect();
    health.retain(&ids);
    for p in providers {
        health.ensure(&p.id);
        health.set_enabled(&p.id, p.enabled);
    }
    info!(providers = ids.len(), "health records reconciled");
}
