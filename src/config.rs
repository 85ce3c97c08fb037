use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env, fs, path::Path, path::PathBuf};

use crate::clock::Window;

/// The persisted configuration document: providers, virtual providers and
/// limits, kept as one pretty-printed JSON file. A `.bak` sibling is written
/// before every overwrite.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub virtual_providers: Vec<VirtualProviderConfig>,
    #[serde(default)]
    pub limits: Vec<LimitConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(flatten)]
    pub kind: ProviderKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub cost: Option<CostCatalog>,
    #[serde(default)]
    pub cooldown: CooldownPolicy,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}
fn default_enabled() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    3
}

impl ProviderConfig {
    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderKind {
    Http {
        /// Base URL including the version segment, e.g. "https://api.openai.com/v1".
        base_url: String,
        /// Full header value, e.g. "Bearer sk-...". Sent as `Authorization`.
        #[serde(default)]
        auth_header: Option<String>,
        #[serde(default)]
        extra_headers: HashMap<String, String>,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
        #[serde(default)]
        retry_count: u32,
        #[serde(default = "default_health_path")]
        health_path: String,
    },
    Local {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        working_dir: Option<PathBuf>,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
        #[serde(default = "default_max_processes")]
        max_processes: usize,
    },
}
fn default_timeout_ms() -> u64 {
    120_000
}
fn default_health_path() -> String {
    "/models".to_string()
}
fn default_max_processes() -> usize {
    2
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CostCatalog {
    #[serde(default = "default_currency")]
    pub currency: String,
    pub input_per_million: f64,
    pub output_per_million: f64,
}
fn default_currency() -> String {
    "USD".to_string()
}

impl CostCatalog {
    pub fn cost_of(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 * self.input_per_million / 1_000_000.0
            + output_tokens as f64 * self.output_per_million / 1_000_000.0
    }

    /// Price of one token in the dearer direction. Used to turn cost
    /// thresholds into token thresholds.
    pub fn max_price_per_token(&self) -> f64 {
        self.input_per_million.max(self.output_per_million) / 1_000_000.0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum CooldownPolicy {
    Fixed {
        #[serde(default = "default_cooldown_seconds")]
        seconds: u64,
    },
    Exponential {
        #[serde(default = "default_backoff_base")]
        base_seconds: u64,
        #[serde(default = "default_backoff_cap")]
        cap_seconds: u64,
    },
}
fn default_cooldown_seconds() -> u64 {
    30
}
fn default_backoff_base() -> u64 {
    1
}
fn default_backoff_cap() -> u64 {
    300
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        CooldownPolicy::Fixed {
            seconds: default_cooldown_seconds(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VirtualProviderConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub members: Vec<VirtualMember>,
}

impl VirtualProviderConfig {
    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VirtualMember {
    pub provider: String,
    /// Lower number = preferred.
    pub priority: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Provider or virtual-provider id.
    pub scope: String,
    pub window: Window,
    pub metric: LimitMetric,
    /// Count for token/request metrics; currency amount for `cost`.
    pub threshold: f64,
    #[serde(default)]
    pub severity: LimitSeverity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitMetric {
    Requests,
    InputTokens,
    OutputTokens,
    TotalTokens,
    /// Translated into a `total_tokens` limit at config-apply time.
    Cost,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitSeverity {
    Hard,
    #[default]
    Soft,
}

// ----------------------
// Load / save
// ----------------------

impl Config {
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&content)?;
        Ok(cfg)
    }

    /// Pretty-print to `path`, preserving the previous contents as
    /// `<path>.bak` first.
    pub fn save_to_path(&self, path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            let mut bak = path.as_os_str().to_owned();
            bak.push(".bak");
            fs::copy(path, PathBuf::from(bak))?;
        }
        let body = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

// ----------------------
// Runtime settings (env)
// ----------------------

#[derive(Clone, Debug)]
pub struct Settings {
    pub bind_addr: String,
    pub port: u16,
    pub config_path: PathBuf,
    pub usage_path: PathBuf,
    pub probe_interval_s: u64,
    pub persist_interval_s: u64,
    pub tui: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8787,
            config_path: PathBuf::from("config.json"),
            usage_path: PathBuf::from("usage.json"),
            probe_interval_s: 30,
            persist_interval_s: 300,
            tui: true,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let mut s = Settings::default();
        if let Ok(addr) = env::var("MRELAY_HTTP_ADDR") {
            s.bind_addr = addr;
        }
        if let Ok(port) = env::var("MRELAY_HTTP_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                s.port = p;
            }
        }
        if let Ok(path) = env::var("MRELAY_CONFIG_PATH") {
            s.config_path = PathBuf::from(path);
        }
        if let Ok(path) = env::var("MRELAY_USAGE_PATH") {
            s.usage_path = PathBuf::from(path);
        }
        if let Ok(v) = env::var("MRELAY_PROBE_INTERVAL_S") {
            if let Ok(n) = v.parse::<u64>() {
                s.probe_interval_s = n.max(1);
            }
        }
        if let Ok(v) = env::var("MRELAY_PERSIST_INTERVAL_S") {
            if let Ok(n) = v.parse::<u64>() {
                s.persist_interval_s = n.max(10);
            }
        }
        if let Ok(v) = env::var("MRELAY_TUI") {
            s.tui = v != "0";
        }
        s
    }
}
