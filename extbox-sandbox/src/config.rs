//! Sandbox configuration.
//!
//! Three tiers, later wins: built-in defaults, the operator's `extbox.toml`
//! (`[sandbox]` table), then `EXTBOX_*` environment variables. A malformed
//! file or value never aborts startup; it is logged and the lower tier stays
//! in effect.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hosts reachable under `allowlist_only` when no operator list is configured.
pub const BUILTIN_ALLOWLIST: &[&str] = &[
    "api.github.com",
    "api.openweathermap.org",
    "api.weather.gov",
    "*.wikipedia.org",
    "api.coingecko.com",
    "icanhazdadjoke.com",
];

/// Environment variable holding a comma-separated default allowlist.
pub const ENV_DEFAULT_ALLOWLIST: &str = "EXTBOX_DEFAULT_ALLOWLIST";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub isolate_memory_limit_mb: u64,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub network_timeout_ms: u64,
    pub max_response_bytes: u64,
    pub max_request_bytes: u64,
    pub rate_window_ms: u64,
    pub rate_max_requests: u64,
    pub default_allowlist: Vec<String>,
    pub max_concurrent_isolates: u64,
    pub queue_timeout_ms: u64,
    pub epoch_tick_ms: u64,
    /// Total bytes of replies one execution may emit.
    pub max_output_bytes: u64,
    pub max_storage_key_bytes: u64,
    pub max_storage_value_bytes: u64,
    pub module_cache_capacity: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolate_memory_limit_mb: 128,
            default_timeout_ms: 5_000,
            max_timeout_ms: 30_000,
            network_timeout_ms: 6_000,
            max_response_bytes: MIB,
            max_request_bytes: 256 * 1024,
            rate_window_ms: 60_000,
            rate_max_requests: 30,
            default_allowlist: BUILTIN_ALLOWLIST.iter().map(|h| h.to_string()).collect(),
            max_concurrent_isolates: 32,
            queue_timeout_ms: 10_000,
            epoch_tick_ms: 10,
            max_output_bytes: 16 * 1024,
            max_storage_key_bytes: 256,
            max_storage_value_bytes: 64 * 1024,
            module_cache_capacity: 256,
        }
    }
}

/// Raw TOML structure of `extbox.toml`.
#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    sandbox: SandboxConfig,
}

impl SandboxConfig {
    /// Loads the full tier stack: defaults, then `path` if given, then the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Self {
        let base = match path {
            Some(path) => Self::load_from(path),
            None => Self::default(),
        };
        base.with_env(std::env::vars())
    }

    /// Loads the file tier over the defaults.
    /// Falls back to defaults with a warning on read or parse errors.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            info!("No sandbox config found at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                Ok(file) => {
                    info!("Loaded sandbox config from {:?}", path);
                    file.sandbox.sanitized()
                }
                Err(e) => {
                    warn!(
                        "Failed to parse sandbox config {:?}: {}. Falling back to defaults.",
                        path, e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read sandbox config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Applies `EXTBOX_*` overrides from `vars`. Unknown keys are ignored;
    /// unparseable or zero values are ignored with a warning.
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref().trim();
            if key == ENV_DEFAULT_ALLOWLIST {
                self.default_allowlist = parse_host_list(value);
                debug!(hosts = self.default_allowlist.len(), "Default allowlist from environment");
                continue;
            }
            let Some(slot) = self.env_slot(key) else {
                continue;
            };
            match value.parse::<u64>() {
                Ok(v) if v > 0 => *slot = v,
                _ => warn!(key, value, "Ignoring invalid sandbox environment override"),
            }
        }
        self
    }

    fn env_slot(&mut self, key: &str) -> Option<&mut u64> {
        Some(match key {
            "EXTBOX_ISOLATE_MEMORY_LIMIT_MB" => &mut self.isolate_memory_limit_mb,
            "EXTBOX_DEFAULT_TIMEOUT_MS" => &mut self.default_timeout_ms,
            "EXTBOX_MAX_TIMEOUT_MS" => &mut self.max_timeout_ms,
            "EXTBOX_NETWORK_TIMEOUT_MS" => &mut self.network_timeout_ms,
            "EXTBOX_MAX_RESPONSE_BYTES" => &mut self.max_response_bytes,
            "EXTBOX_MAX_REQUEST_BYTES" => &mut self.max_request_bytes,
            "EXTBOX_RATE_WINDOW_MS" => &mut self.rate_window_ms,
            "EXTBOX_RATE_MAX_REQUESTS" => &mut self.rate_max_requests,
            "EXTBOX_MAX_CONCURRENT_ISOLATES" => &mut self.max_concurrent_isolates,
            "EXTBOX_QUEUE_TIMEOUT_MS" => &mut self.queue_timeout_ms,
            _ => return None,
        })
    }

    /// Replaces zero-valued knobs from the file tier with their defaults.
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        let knobs: [(&str, &mut u64, u64); 15] = [
            ("isolate_memory_limit_mb", &mut self.isolate_memory_limit_mb, defaults.isolate_memory_limit_mb),
            ("default_timeout_ms", &mut self.default_timeout_ms, defaults.default_timeout_ms),
            ("max_timeout_ms", &mut self.max_timeout_ms, defaults.max_timeout_ms),
            ("network_timeout_ms", &mut self.network_timeout_ms, defaults.network_timeout_ms),
            ("max_response_bytes", &mut self.max_response_bytes, defaults.max_response_bytes),
            ("max_request_bytes", &mut self.max_request_bytes, defaults.max_request_bytes),
            ("rate_window_ms", &mut self.rate_window_ms, defaults.rate_window_ms),
            ("rate_max_requests", &mut self.rate_max_requests, defaults.rate_max_requests),
            ("max_concurrent_isolates", &mut self.max_concurrent_isolates, defaults.max_concurrent_isolates),
            ("queue_timeout_ms", &mut self.queue_timeout_ms, defaults.queue_timeout_ms),
            ("epoch_tick_ms", &mut self.epoch_tick_ms, defaults.epoch_tick_ms),
            ("max_output_bytes", &mut self.max_output_bytes, defaults.max_output_bytes),
            ("max_storage_key_bytes", &mut self.max_storage_key_bytes, defaults.max_storage_key_bytes),
            ("max_storage_value_bytes", &mut self.max_storage_value_bytes, defaults.max_storage_value_bytes),
            ("module_cache_capacity", &mut self.module_cache_capacity, defaults.module_cache_capacity),
        ];
        for (name, slot, default) in knobs {
            if *slot == 0 {
                warn!(knob = name, default, "Zero is not a valid sandbox setting, using default");
                *slot = default;
            }
        }
        self
    }

    pub fn memory_limit_bytes(&self) -> usize {
        usize::try_from(self.isolate_memory_limit_mb.saturating_mul(MIB)).unwrap_or(usize::MAX)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }
}

fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_lowercase)
        .collect()
}
