use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, fs, path::Path, sync::Arc};
use tracing::warn;

use crate::clock::{boundary, Clock, Window};
use crate::limits::Metric;

/// Target of counter accumulation and limit enforcement.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScopeId {
    Provider { id: String },
    Virtual { id: String },
    VirtualMember { virtual_id: String, provider_id: String },
}

impl ScopeId {
    pub fn provider(id: impl Into<String>) -> Self {
        ScopeId::Provider { id: id.into() }
    }

    pub fn virtual_provider(id: impl Into<String>) -> Self {
        ScopeId::Virtual { id: id.into() }
    }

    pub fn pair(virtual_id: impl Into<String>, provider_id: impl Into<String>) -> Self {
        ScopeId::VirtualMember {
            virtual_id: virtual_id.into(),
            provider_id: provider_id.into(),
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeId::Provider { id } => write!(f, "{}", id),
            ScopeId::Virtual { id } => write!(f, "{}", id),
            ScopeId::VirtualMember {
                virtual_id,
                provider_id,
            } => write!(f, "{}/{}", virtual_id, provider_id),
        }
    }
}

/// One request's worth of accumulation. All five metrics advance together.
#[derive(Clone, Copy, Debug, Default)]
pub struct UsageDelta {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub errors: u64,
    pub cost: f64,
}

impl UsageDelta {
    pub fn success(input_tokens: u64, output_tokens: u64, cost: f64) -> Self {
        Self {
            requests: 1,
            input_tokens,
            output_tokens,
            errors: 0,
            cost,
        }
    }

    pub fn failure() -> Self {
        Self {
            requests: 1,
            errors: 1,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CounterBucket {
    pub window_start: DateTime<Local>,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub errors: u64,
    pub cost: f64,
}

impl CounterBucket {
    fn new(window_start: DateTime<Local>) -> Self {
        Self {
            window_start,
            requests: 0,
            input_tokens: 0,
            output_tokens: 0,
            errors: 0,
            cost: 0.0,
        }
    }

    /// Zero the bucket if its window has passed (or its start is ahead of
    /// `now`, which can happen after a clock step backwards). Idempotent.
    fn roll_forward(&mut self, window: Window, now: DateTime<Local>) {
        let bound = boundary(window, now);
        if self.window_start < bound || self.window_start > now {
            *self = CounterBucket::new(bound);
        }
    }

    fn add(&mut self, delta: &UsageDelta) {
        self.requests += delta.requests;
        self.input_tokens += delta.input_tokens;
        self.output_tokens += delta.output_tokens;
        self.errors += delta.errors;
        self.cost += delta.cost;
    }

    pub fn metric(&self, metric: Metric) -> u64 {
        match metric {
            Metric::Requests => self.requests,
            Metric::InputTokens => self.input_tokens,
            Metric::OutputTokens => self.output_tokens,
            Metric::TotalTokens => self.input_tokens + self.output_tokens,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScopeCounters {
    pub minute: CounterBucket,
    pub day: CounterBucket,
    pub month: CounterBucket,
}

impl ScopeCounters {
    fn new(now: DateTime<Local>) -> Self {
        Self {
            minute: CounterBucket::new(boundary(Window::Minute, now)),
            day: CounterBucket::new(boundary(Window::Day, now)),
            month: CounterBucket::new(boundary(Window::Month, now)),
        }
    }

    fn roll_forward(&mut self, now: DateTime<Local>) {
        self.minute.roll_forward(Window::Minute, now);
        self.day.roll_forward(Window::Day, now);
        self.month.roll_forward(Window::Month, now);
    }

    pub fn bucket(&self, window: Window) -> &CounterBucket {
        match window {
            Window::Minute => &self.minute,
            Window::Day => &self.day,
            Window::Month => &self.month,
        }
    }

    fn bucket_mut(&mut self, window: Window) -> &mut CounterBucket {
        match window {
            Window::Minute => &mut self.minute,
            Window::Day => &mut self.day,
            Window::Month => &mut self.month,
        }
    }
}

/// Point-in-time copy of the whole store, as persisted to disk. Retention is
/// this single snapshot of current buckets; there is no historical archive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub saved_at: DateTime<Local>,
    pub scopes: Vec<ScopeUsage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScopeUsage {
    pub scope: ScopeId,
    pub counters: ScopeCounters,
}

/// Thread-safe tally of five metrics across three windows per scope.
/// One mutex per scope; the outer map lock is held only to find or create
/// the scope entry, never across metric updates.
pub struct CounterStore {
    clock: Arc<dyn Clock>,
    scopes: RwLock<HashMap<ScopeId, Arc<Mutex<ScopeCounters>>>>,
}

impl CounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            scopes: RwLock::new(HashMap::new()),
        }
    }

    /// Load from a snapshot file; an unreadable or corrupt file is not fatal,
    /// the store just starts empty.
    pub fn load(path: &Path, clock: Arc<dyn Clock>) -> Self {
        let store = Self::new(clock);
        match fs::read_to_string(path) {
            Ok(body) => match serde_json::from_str::<UsageSnapshot>(&body) {
                Ok(snap) => store.import(snap),
                Err(e) => warn!("usage snapshot at {:?} is corrupt, starting empty: {}", path, e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("cannot read usage snapshot at {:?}, starting empty: {}", path, e),
        }
        store
    }

    fn handle(&self, scope: &ScopeId) -> Arc<Mutex<ScopeCounters>> {
        if let Some(h) = self.scopes.read().get(scope) {
            return h.clone();
        }
        let now = self.clock.now();
        self.scopes
            .write()
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ScopeCounters::new(now))))
            .clone()
    }

    pub fn record(&self, scope: &ScopeId, delta: &UsageDelta) {
        let handle = self.handle(scope);
        let now = self.clock.now();
        let mut counters = handle.lock();
        counters.roll_forward(now);
        counters.minute.add(delta);
        counters.day.add(delta);
        counters.month.add(delta);
    }

    /// Coherent per-window copy after roll-forward.
    pub fn snapshot(&self, scope: &ScopeId) -> ScopeCounters {
        let handle = self.handle(scope);
        let now = self.clock.now();
        let mut counters = handle.lock();
        counters.roll_forward(now);
        counters.clone()
    }

    pub fn reset(&self, scope: &ScopeId, windows: &[Window]) {
        let handle = self.handle(scope);
        let now = self.clock.now();
        let mut counters = handle.lock();
        for w in windows {
            *counters.bucket_mut(*w) = CounterBucket::new(boundary(*w, now));
        }
    }

    pub fn scope_ids(&self) -> Vec<ScopeId> {
        self.scopes.read().keys().cloned().collect()
    }

    /// Deep copy for persistence. Scope locks are taken one at a time and
    /// never held across the serialization that follows.
    pub fn export(&self) -> UsageSnapshot {
        let handles: Vec<(ScopeId, Arc<Mutex<ScopeCounters>>)> = self
            .scopes
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let now = self.clock.now();
        let scopes = handles
            .into_iter()
            .map(|(scope, handle)| {
                let mut counters = handle.lock();
                counters.roll_forward(now);
                ScopeUsage {
                    scope,
                    counters: counters.clone(),
                }
            })
            .collect();
        UsageSnapshot {
            saved_at: now,
            scopes,
        }
    }

    /// Replace all state. Startup only.
    pub fn import(&self, snapshot: UsageSnapshot) {
        let mut map = self.scopes.write();
        map.clear();
        for entry in snapshot.scopes {
            map.insert(entry.scope, Arc::new(Mutex::new(entry.counters)));
        }
    }

    /// Serialize to `path` via write-temp-then-rename.
    pub fn persist(&self, path: &Path) -> anyhow::Result<()> {
        let snapshot = self.export();
        let body = serde_json::to_string(&snapshot)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn fixed_clock() -> Arc<ManualClock> {
        let start = Local
            .with_ymd_and_hms(2025, 6, 15, 10, 42, 30)
            .single()
            .expect("valid datetime");
        Arc::new(ManualClock::new(start))
    }

    fn scope() -> ScopeId {
        ScopeId::provider("openai")
    }

    #[test]
    fn record_advances_all_windows_together() {
        let clock = fixed_clock();
        let store = CounterStore::new(clock);
        store.record(&scope(), &UsageDelta::success(100, 40, 0.5));
        store.record(&scope(), &UsageDelta::failure());

        let snap = store.snapshot(&scope());
        for w in Window::ALL {
            let b = snap.bucket(w);
            assert_eq!(b.requests, 2);
            assert_eq!(b.input_tokens, 100);
            assert_eq!(b.output_tokens, 40);
            assert_eq!(b.errors, 1);
            assert!((b.cost - 0.5).abs() < 1e-9);
        }
    }

    #[test]
    fn counters_are_monotonic_within_a_window() {
        let clock = fixed_clock();
        let store = CounterStore::new(clock.clone());
        let mut last = 0;
        for _ in 0..5 {
            store.record(&scope(), &UsageDelta::success(10, 5, 0.0));
            clock.advance(Duration::seconds(2));
            let requests = store.snapshot(&scope()).minute.requests;
            assert!(requests > last);
            last = requests;
        }
    }

    #[test]
    fn roll_forward_is_idempotent_at_the_same_instant() {
        let clock = fixed_clock();
        let store = CounterStore::new(clock);
        store.record(&scope(), &UsageDelta::success(8, 4, 0.0));
        let a = store.snapshot(&scope());
        let b = store.snapshot(&scope());
        assert_eq!(a.minute.requests, b.minute.requests);
        assert_eq!(a.minute.window_start, b.minute.window_start);
    }

    #[test]
    fn minute_boundary_zeroes_only_the_minute_bucket() {
        let clock = fixed_clock();
        let store = CounterStore::new(clock.clone());
        store.record(&scope(), &UsageDelta::success(100, 50, 0.0));

        clock.advance(Duration::seconds(45)); // crosses :00 of the next minute
        let snap = store.snapshot(&scope());
        assert_eq!(snap.minute.requests, 0);
        assert_eq!(snap.minute.input_tokens, 0);
        assert_eq!(snap.day.requests, 1);
        assert_eq!(snap.month.input_tokens, 100);
    }

    #[test]
    fn day_boundary_zeroes_day_but_not_month() {
        let clock = fixed_clock();
        let store = CounterStore::new(clock.clone());
        store.record(&scope(), &UsageDelta::success(100, 50, 1.0));

        clock.advance(Duration::days(1));
        let snap = store.snapshot(&scope());
        assert_eq!(snap.day.requests, 0);
        assert_eq!(snap.month.requests, 1);
    }

    #[test]
    fn reset_zeroes_selected_windows_only() {
        let clock = fixed_clock();
        let store = CounterStore::new(clock);
        store.record(&scope(), &UsageDelta::success(100, 50, 0.0));
        store.reset(&scope(), &[Window::Minute]);

        let snap = store.snapshot(&scope());
        assert_eq!(snap.minute.requests, 0);
        assert_eq!(snap.day.requests, 1);
        assert_eq!(snap.month.requests, 1);
    }

    #[test]
    fn export_import_round_trip_preserves_current_windows() {
        let clock = fixed_clock();
        let store = CounterStore::new(clock.clone());
        store.record(&scope(), &UsageDelta::success(100, 50, 0.25));
        store.record(
            &ScopeId::pair("main", "openai"),
            &UsageDelta::success(10, 5, 0.0),
        );

        let exported = store.export();
        let restored = CounterStore::new(clock);
        restored.import(exported);

        let snap = restored.snapshot(&scope());
        assert_eq!(snap.minute.requests, 1);
        assert_eq!(snap.minute.input_tokens, 100);
        assert_eq!(snap.day.output_tokens, 50);
        let pair = restored.snapshot(&ScopeId::pair("main", "openai"));
        assert_eq!(pair.minute.requests, 1);
    }

    #[test]
    fn persisted_counters_survive_restart_then_roll_at_the_boundary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("usage.json");
        let clock = fixed_clock();

        let store = CounterStore::new(clock.clone());
        store.record(&scope(), &UsageDelta::success(40, 20, 0.0));
        store.persist(&path).expect("persist");

        // Same minute: the pre-restart values come back.
        let reloaded = CounterStore::load(&path, clock.clone());
        assert_eq!(reloaded.snapshot(&scope()).minute.requests, 1);

        // Crossing the minute boundary zeroes them.
        clock.advance(Duration::seconds(60));
        assert_eq!(reloaded.snapshot(&scope()).minute.requests, 0);
    }

    #[test]
    fn corrupt_snapshot_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("usage.json");
        fs::write(&path, "{ not json").expect("write");
        let store = CounterStore::load(&path, fixed_clock());
        assert!(store.scope_ids().is_empty());
    }
}
