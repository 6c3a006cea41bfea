use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;

/// All mender session parameters. Loaded from `mender_config` table at startup,
/// or from `MENDER_*` environment variables when no database is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenderCfg {
    // sandbox instrumentation
    pub enable_console_capture: bool,
    pub enable_network_error_capture: bool,
    pub enable_performance_monitoring: bool,
    pub slow_load_threshold_ms: u64,

    // classifier
    pub dedup_window_ms: u64,

    // circuit breaker
    pub breaker_failure_threshold: u32,
    /// 0 disables the automatic cooldown reset.
    pub breaker_cooldown_secs: u64,
    pub recurrence_threshold: u32,
    pub recurrence_window_secs: u64,

    // repair orchestrator
    pub repair_timeout_ms: u64,
    pub repair_history_cap: usize,
    pub repair_warnings: bool,
    pub pending_queue_cap: usize,

    // event channel
    pub channel_buffer: usize,
}

impl Default for MenderCfg {
    fn default() -> Self {
        Self {
            enable_console_capture: true,
            enable_network_error_capture: true,
            enable_performance_monitoring: false,
            slow_load_threshold_ms: 3000,
            dedup_window_ms: 3000,
            breaker_failure_threshold: 3,
            breaker_cooldown_secs: 0,
            recurrence_threshold: 2,
            recurrence_window_secs: 60,
            repair_timeout_ms: 60_000,
            repair_history_cap: 50,
            repair_warnings: false,
            pending_queue_cap: 4,
            channel_buffer: 256,
        }
    }
}

/// Interceptor toggles applied when instrumenting a sandbox context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrumentationConfig {
    pub enable_console_capture: bool,
    pub enable_network_error_capture: bool,
    pub enable_performance_monitoring: bool,
    pub slow_load_threshold: Duration,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        MenderCfg::default().instrumentation()
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Option<Duration>,
    pub recurrence_threshold: u32,
    pub recurrence_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        MenderCfg::default().breaker()
    }
}

impl MenderCfg {
    pub fn instrumentation(&self) -> InstrumentationConfig {
        InstrumentationConfig {
            enable_console_capture: self.enable_console_capture,
            enable_network_error_capture: self.enable_network_error_capture,
            enable_performance_monitoring: self.enable_performance_monitoring,
            slow_load_threshold: Duration::from_millis(self.slow_load_threshold_ms),
        }
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_failure_threshold.max(1),
            cooldown: (self.breaker_cooldown_secs > 0)
                .then(|| Duration::from_secs(self.breaker_cooldown_secs)),
            recurrence_threshold: self.recurrence_threshold,
            recurrence_window: Duration::from_secs(self.recurrence_window_secs),
        }
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn repair_timeout(&self) -> Duration {
        Duration::from_millis(self.repair_timeout_ms)
    }

    /// Load config from `mender_config` table. If table is empty, seed with defaults.
    pub async fn load(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM mender_config")
                .fetch_all(pool)
                .await?;

        if rows.is_empty() {
            let cfg = Self::default();
            cfg.seed(pool).await?;
            return Ok(cfg);
        }

        let map: HashMap<String, String> = rows.into_iter().collect();
        Ok(Self::from_map(&map))
    }

    /// Read `MENDER_<KEY>` environment variables, e.g. `MENDER_DEDUP_WINDOW_MS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let map: HashMap<String, String> = d
            .to_entries()
            .into_iter()
            .filter_map(|(key, _, _)| {
                let var = format!("MENDER_{}", key.to_uppercase());
                std::env::var(var).ok().map(|v| (key.to_string(), v))
            })
            .collect();
        Self::from_map(&map)
    }

    /// Write all default values into `mender_config` table.
    async fn seed(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        let entries = self.to_entries();
        for (key, value, desc) in &entries {
            sqlx::query(
                "INSERT INTO mender_config (key, value, description) VALUES ($1, $2, $3) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .bind(desc)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    pub fn from_map(m: &HashMap<String, String>) -> Self {
        let d = Self::default();
        Self {
            enable_console_capture: get_or(m, "enable_console_capture", d.enable_console_capture),
            enable_network_error_capture: get_or(m, "enable_network_error_capture", d.enable_network_error_capture),
            enable_performance_monitoring: get_or(m, "enable_performance_monitoring", d.enable_performance_monitoring),
            slow_load_threshold_ms: get_or(m, "slow_load_threshold_ms", d.slow_load_threshold_ms),
            dedup_window_ms: get_or(m, "dedup_window_ms", d.dedup_window_ms),
            breaker_failure_threshold: get_or(m, "breaker_failure_threshold", d.breaker_failure_threshold),
            breaker_cooldown_secs: get_or(m, "breaker_cooldown_secs", d.breaker_cooldown_secs),
            recurrence_threshold: get_or(m, "recurrence_threshold", d.recurrence_threshold),
            recurrence_window_secs: get_or(m, "recurrence_window_secs", d.recurrence_window_secs),
            repair_timeout_ms: get_or(m, "repair_timeout_ms", d.repair_timeout_ms),
            repair_history_cap: get_or(m, "repair_history_cap", d.repair_history_cap),
            repair_warnings: get_or(m, "repair_warnings", d.repair_warnings),
            pending_queue_cap: get_or(m, "pending_queue_cap", d.pending_queue_cap),
            channel_buffer: get_or(m, "channel_buffer", d.channel_buffer),
        }
    }

    fn to_entries(&self) -> Vec<(&str, String, &str)> {
        vec![
            ("enable_console_capture", self.enable_console_capture.to_string(), "Capture console error/warning calls"),
            ("enable_network_error_capture", self.enable_network_error_capture.to_string(), "Capture failed network requests"),
            ("enable_performance_monitoring", self.enable_performance_monitoring.to_string(), "Report abnormally slow page loads"),
            ("slow_load_threshold_ms", self.slow_load_threshold_ms.to_string(), "Page load time reported as slow"),
            ("dedup_window_ms", self.dedup_window_ms.to_string(), "Window in which identical reports collapse"),
            ("breaker_failure_threshold", self.breaker_failure_threshold.to_string(), "Consecutive failed repairs that trip the breaker"),
            ("breaker_cooldown_secs", self.breaker_cooldown_secs.to_string(), "Automatic breaker reset after inactivity (0 = off)"),
            ("recurrence_threshold", self.recurrence_threshold.to_string(), "Recurrences of a repaired error that trip the breaker"),
            ("recurrence_window_secs", self.recurrence_window_secs.to_string(), "Window after a repair in which recurrence counts"),
            ("repair_timeout_ms", self.repair_timeout_ms.to_string(), "Patch generation timeout ms"),
            ("repair_history_cap", self.repair_history_cap.to_string(), "Repair attempts retained for diagnostics"),
            ("repair_warnings", self.repair_warnings.to_string(), "Attempt repairs for warning-severity errors"),
            ("pending_queue_cap", self.pending_queue_cap.to_string(), "Distinct errors queued behind an in-flight repair"),
            ("channel_buffer", self.channel_buffer.to_string(), "Sandbox to host channel capacity"),
        ]
    }
}

fn get_or<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    map.get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
