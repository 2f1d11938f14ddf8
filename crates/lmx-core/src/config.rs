//! Configuration management for lmx
//!
//! Provides a unified configuration system that supports YAML files and
//! environment variable overrides on top of built-in defaults.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "LMX_CONFIG";

/// Main configuration structure for lmx
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub admission: AdmissionConfig,
    pub shedding: SheddingConfig,
    pub rate_limit: RateLimitConfig,
    pub security: SecurityConfig,
    pub health: HealthConfig,
    pub state: StateConfig,
    pub reclaimer: ReclaimerConfig,
    pub models: ModelsConfig,
    pub runtime: RuntimeConfig,
    pub helpers: Vec<HelperConfig>,
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (`LMX_` prefix, `__` between nested keys)
    /// 2. Configuration file
    /// 3. Defaults (lowest)
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        } else {
            for path in &["./lmx.yaml", "/etc/lmx/config.yaml"] {
                builder = builder.add_source(config::File::with_name(path).required(false));
            }
        }

        builder = builder.add_source(Self::environment());

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;

        parsed.validate()?;

        Ok(parsed)
    }

    /// Load configuration from a specific file, still honouring environment overrides
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path))
            .add_source(Self::environment());

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("LMX")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.admission.validate()?;
        self.shedding.validate()?;
        self.rate_limit.validate()?;
        self.health.validate()?;
        self.state.validate()?;
        self.reclaimer.validate()?;
        self.runtime.validate()?;

        let mut names = std::collections::HashSet::new();
        for helper in &self.helpers {
            if helper.name.is_empty() || helper.url.is_empty() {
                return Err(crate::Error::config("Helper services need a name and a url"));
            }
            if !names.insert(helper.name.as_str()) {
                return Err(crate::Error::config(format!(
                    "Duplicate helper service name: {}",
                    helper.name
                )));
            }
        }

        Ok(())
    }

    /// Get the bind address for the HTTP server
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.host, self.server.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            admission: AdmissionConfig::default(),
            shedding: SheddingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            security: SecurityConfig::default(),
            health: HealthConfig::default(),
            state: StateConfig::default(),
            reclaimer: ReclaimerConfig::default(),
            models: ModelsConfig::default(),
            runtime: RuntimeConfig::default(),
            helpers: Vec::new(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Enable permissive CORS
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 1234,
            enable_cors: false,
        }
    }
}

/// Admission controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Fixed capacity of the concurrency gate
    pub max_concurrent_requests: usize,

    /// How long a normal-priority request may wait for a slot
    pub acquire_timeout_ms: u64,

    /// Retry hint returned with a busy rejection
    pub busy_retry_after_secs: u64,

    /// Upper bound for a single inference call
    pub inference_timeout_secs: u64,

    /// How long shutdown waits for in-flight requests
    pub drain_timeout_secs: u64,
}

impl AdmissionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(crate::Error::config("Max concurrent requests must be > 0"));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(crate::Error::config("Acquire timeout must be > 0"));
        }
        if self.inference_timeout_secs == 0 {
            return Err(crate::Error::config("Inference timeout must be > 0"));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 4,
            acquire_timeout_ms: 30_000,
            busy_retry_after_secs: 5,
            inference_timeout_secs: 300,
            drain_timeout_secs: 30,
        }
    }
}

/// Load-shedding gate configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheddingConfig {
    pub enabled: bool,
    pub critical_threshold_percent: f64,
    pub retry_after_secs: u64,
}

impl SheddingConfig {
    pub fn validate(&self) -> Result<()> {
        validate_percent("Critical memory threshold", self.critical_threshold_percent)
    }
}

impl Default for SheddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            critical_threshold_percent: 95.0,
            retry_after_secs: 30,
        }
    }
}

/// Token bucket limits for one route group
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub requests_per_minute: u32,
    /// Bucket capacity
    pub burst: u32,
}

impl RateLimitRule {
    pub fn validate(&self, group: &str) -> Result<()> {
        if self.requests_per_minute == 0 || self.burst == 0 {
            return Err(crate::Error::config(format!(
                "Rate limit for {} routes must have non-zero rate and burst",
                group
            )));
        }
        Ok(())
    }

    /// Tokens added per second
    pub fn refill_per_second(&self) -> f64 {
        self.requests_per_minute as f64 / 60.0
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub inference: RateLimitRule,
    pub admin: RateLimitRule,
    /// Idle time after which a full bucket is forgotten
    pub idle_eviction_secs: u64,
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        self.inference.validate("inference")?;
        self.admin.validate("admin")?;
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            inference: RateLimitRule {
                requests_per_minute: 60,
                burst: 20,
            },
            admin: RateLimitRule {
                requests_per_minute: 20,
                burst: 5,
            },
            idle_eviction_secs: 600,
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Admin key required on administrative routes; auth is disabled when unset
    pub admin_key: Option<String>,
}

/// Health reporting configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Deep health reports degraded above this memory usage
    pub memory_warning_percent: f64,

    /// Timeout for each helper-service probe
    pub helper_timeout_ms: u64,
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        validate_percent("Memory warning threshold", self.memory_warning_percent)?;
        if self.helper_timeout_ms == 0 {
            return Err(crate::Error::config("Helper timeout must be > 0"));
        }
        Ok(())
    }

    pub fn helper_timeout(&self) -> Duration {
        Duration::from_millis(self.helper_timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            memory_warning_percent: 90.0,
            helper_timeout_ms: 2_000,
        }
    }
}

/// Runtime state persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: PathBuf,
    pub crash_loop_threshold: u32,
    pub crash_loop_window_secs: u64,
    /// Refuse to start while another live process owns an unclean record
    pub enforce_single_instance: bool,
}

impl StateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.crash_loop_threshold == 0 {
            return Err(crate::Error::config("Crash loop threshold must be > 0"));
        }
        if self.crash_loop_window_secs == 0 {
            return Err(crate::Error::config("Crash loop window must be > 0"));
        }
        Ok(())
    }

    pub fn crash_loop_window(&self) -> Duration {
        Duration::from_secs(self.crash_loop_window_secs)
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/runtime-state.json"),
            crash_loop_threshold: 3,
            crash_loop_window_secs: 60,
            enforce_single_instance: true,
        }
    }
}

/// Accelerator cache reclaimer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub cache_limit_bytes: u64,
}

impl ReclaimerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(crate::Error::config("Reclaimer interval must be > 0"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            cache_limit_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

/// Model loading configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Models loaded at startup outside safe mode
    pub auto_load: Vec<String>,
}

/// Inference runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime kind (http, mock)
    pub kind: String,

    /// Base URL of an OpenAI-compatible upstream for the http runtime
    pub endpoint: String,

    pub request_timeout_secs: u64,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        match self.kind.as_str() {
            "mock" => Ok(()),
            "http" if self.endpoint.is_empty() => {
                Err(crate::Error::config("HTTP runtime requires an endpoint"))
            }
            "http" => Ok(()),
            other => Err(crate::Error::config(format!("Unknown runtime kind: {}", other))),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: "http".to_string(),
            endpoint: "http://127.0.0.1:8080".to_string(),
            request_timeout_secs: 300,
        }
    }
}

/// A helper service probed by deep health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperConfig {
    pub name: String,
    /// Health URL; any 2xx response counts as healthy
    pub url: String,
}

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,

    pub log_level: String,

    /// Log format (json or text)
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

fn validate_percent(what: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value <= 100.0) {
        return Err(crate::Error::config(format!(
            "{} must be in (0, 100], got {}",
            what, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // loaders read the process environment
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvVars(Vec<&'static str>);

    impl EnvVars {
        fn set(vars: &[(&'static str, &str)]) -> Self {
            for (key, value) in vars {
                std::env::set_var(key, value);
            }
            Self(vars.iter().map(|(key, _)| *key).collect())
        }
    }

    impl Drop for EnvVars {
        fn drop(&mut self) {
            for key in &self.0 {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.admission.acquire_timeout(), Duration::from_secs(30));
        assert_eq!(config.shedding.critical_threshold_percent, 95.0);
        assert_eq!(config.state.crash_loop_threshold, 3);
        assert_eq!(config.state.crash_loop_window(), Duration::from_secs(60));
        assert_eq!(config.reclaimer.interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_admin_limits_stricter_by_default() {
        let config = RateLimitConfig::default();
        assert!(config.admin.requests_per_minute < config.inference.requests_per_minute);
        assert!(config.admin.burst < config.inference.burst);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.admission.max_concurrent_requests = 0;
        assert!(config.validate().is_err());
        config.admission.max_concurrent_requests = 2;

        config.shedding.critical_threshold_percent = 120.0;
        assert!(config.validate().is_err());
        config.shedding.critical_threshold_percent = 95.0;

        config.rate_limit.admin.burst = 0;
        assert!(config.validate().is_err());
        config.rate_limit.admin.burst = 1;

        config.runtime.kind = "tensorflow".to_string();
        assert!(config.validate().is_err());
        config.runtime.kind = "mock".to_string();

        config.helpers = vec![
            HelperConfig {
                name: "embed".to_string(),
                url: "http://127.0.0.1:9000/health".to_string(),
            },
            HelperConfig {
                name: "embed".to_string(),
                url: "http://127.0.0.1:9001/health".to_string(),
            },
        ];
        assert!(config.validate().is_err());
        config.helpers.pop();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "admission:\n  max_concurrent_requests: 2\n  acquire_timeout_ms: 200\nmodels:\n  auto_load: [m1]\nruntime:\n  kind: mock"
        )
        .unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.admission.max_concurrent_requests, 2);
        assert_eq!(config.admission.acquire_timeout(), Duration::from_millis(200));
        // untouched keys keep their defaults
        assert_eq!(config.admission.inference_timeout_secs, 300);
        assert_eq!(config.models.auto_load, vec!["m1".to_string()]);
        assert_eq!(config.runtime.kind, "mock");
    }

    #[test]
    fn test_environment_overrides_file_and_defaults() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "admission:\n  max_concurrent_requests: 2\n  acquire_timeout_ms: 200\nruntime:\n  kind: mock"
        )
        .unwrap();

        let _env = EnvVars::set(&[
            ("LMX_ADMISSION__MAX_CONCURRENT_REQUESTS", "8"),
            ("LMX_SHEDDING__CRITICAL_THRESHOLD_PERCENT", "90.5"),
            ("LMX_RATE_LIMIT__ENABLED", "false"),
        ]);

        let config = Config::load_from_file(file.path()).unwrap();
        // environment beats the file
        assert_eq!(config.admission.max_concurrent_requests, 8);
        // environment beats the defaults
        assert_eq!(config.shedding.critical_threshold_percent, 90.5);
        assert!(!config.rate_limit.enabled);
        // the file still beats the defaults where the environment is silent
        assert_eq!(config.admission.acquire_timeout(), Duration::from_millis(200));
        assert_eq!(config.runtime.kind, "mock");
        assert_eq!(config.admission.inference_timeout_secs, 300);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();

        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, deserialized);

        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config.bind_addr(), deserialized.bind_addr());
    }
}
