// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// TOML configuration with environment overrides:
// - figment layering (file, then NGX_TELEMETRY_* variables)
// - serde defaults for every section
// - hot reload through `ConfigManager`
// ============================================================================

use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

// ----------------------------------------------------------------------------
// 3.1 Constants
// ----------------------------------------------------------------------------

pub const ENV_PREFIX: &str = "NGX_TELEMETRY_";
pub const MIN_COLLECTION_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_PLUS_API_VERSION: u32 = 6;

/// nginx's predefined `combined` format.
pub const DEFAULT_ACCESS_LOG_FORMAT: &str = r#"$remote_addr - $remote_user [$time_local] "$request" $status $body_bytes_sent "$http_referer" "$http_user_agent""#;

// ----------------------------------------------------------------------------
// 3.2 Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for the agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Identity and scheduling
    #[serde(default)]
    pub agent: GeneralConfig,

    /// Monitored nginx instances
    #[serde(default)]
    pub nginx: Vec<NginxInstanceConfig>,

    /// Host metrics
    #[serde(default)]
    pub system: SystemConfig,

    /// Container (cgroup) metrics
    #[serde(default)]
    pub container: ContainerConfig,

    /// Report finalization
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Report sink
    #[serde(default)]
    pub export: ExportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.agent.collection_interval < MIN_COLLECTION_INTERVAL {
            return Err(ConfigError::invalid_value(
                "agent.collection_interval",
                format!(
                    "Collection interval must be at least {}",
                    humantime::format_duration(MIN_COLLECTION_INTERVAL)
                ),
            ));
        }

        if self.agent.report_interval < self.agent.collection_interval {
            return Err(ConfigError::invalid_value(
                "agent.report_interval",
                "Report interval cannot be shorter than the collection interval",
            ));
        }

        let mut seen = HashSet::new();
        for (idx, instance) in self.nginx.iter().enumerate() {
            if instance.id.is_empty() {
                return Err(ConfigError::missing_field(format!("nginx[{}].id", idx)));
            }
            if !seen.insert(instance.id.as_str()) {
                return Err(ConfigError::ValidationFailed {
                    message: format!("Duplicate nginx instance id '{}'", instance.id),
                });
            }
            if instance.pid.is_none() && instance.pid_file.is_none() && instance.bin_path.is_empty() {
                return Err(ConfigError::invalid_value(
                    format!("nginx[{}]", idx),
                    "One of pid, pid_file or bin_path is required to locate the master process",
                ));
            }
            if let Some(interval) = instance.collection_interval {
                if interval < MIN_COLLECTION_INTERVAL {
                    return Err(ConfigError::invalid_value(
                        format!("nginx[{}].collection_interval", idx),
                        "Collection interval must be at least 1s",
                    ));
                }
            }
        }

        if self.export.sink == SinkKind::Json && self.export.path.is_none() {
            return Err(ConfigError::missing_field("export.path"));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Per-instance collector configuration, resolved against agent defaults.
    pub fn collector_configs(&self) -> Vec<NginxCollectorConfig> {
        self.nginx
            .iter()
            .map(|instance| instance.collector_config(&self.agent))
            .collect()
    }
}

// ----------------------------------------------------------------------------
// 3.3 General Agent Configuration
// ----------------------------------------------------------------------------

/// How finalized reports are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportMode {
    /// Accumulate collection ticks and finalize once per report interval
    Aggregated,
    /// Finalize every collection tick on its own
    Streaming,
}

impl Default for ReportMode {
    fn default() -> Self {
        ReportMode::Aggregated
    }
}

/// Identity and scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Stable host identifier
    #[serde(default = "default_system_id")]
    pub system_id: String,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub instance_group: String,

    /// Tags attached to every metric (joined by comma)
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default = "default_collection_interval", with = "humantime_serde")]
    pub collection_interval: Duration,

    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,

    #[serde(default)]
    pub mode: ReportMode,

    /// How often the config file is checked for changes
    #[serde(default = "default_reload_interval", with = "humantime_serde")]
    pub reload_interval: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            system_id: default_system_id(),
            hostname: default_hostname(),
            display_name: String::new(),
            instance_group: String::new(),
            tags: Vec::new(),
            collection_interval: default_collection_interval(),
            report_interval: default_report_interval(),
            mode: ReportMode::default(),
            reload_interval: default_reload_interval(),
        }
    }
}

fn default_system_id() -> String {
    fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn default_hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".into())
}

fn default_collection_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_reload_interval() -> Duration {
    Duration::from_secs(30)
}

// ----------------------------------------------------------------------------
// 3.4 NGINX Instance Configuration
// ----------------------------------------------------------------------------

/// One monitored nginx instance as written in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NginxInstanceConfig {
    pub id: String,

    /// stub_status URL; empty disables the OSS source
    #[serde(default)]
    pub stub_status: String,

    /// Plus API base URL, e.g. `http://127.0.0.1:8080/api`; empty disables it
    #[serde(default)]
    pub plus_api: String,

    #[serde(default = "default_plus_api_version")]
    pub plus_api_version: u32,

    #[serde(default)]
    pub bin_path: String,

    #[serde(default)]
    pub conf_path: String,

    /// Master process id
    #[serde(default)]
    pub pid: Option<u32>,

    /// File holding the master process id
    #[serde(default)]
    pub pid_file: Option<PathBuf>,

    /// Access log path (or glob) to log_format. An empty format means `combined`.
    #[serde(default)]
    pub access_logs: BTreeMap<String, String>,

    /// Error log paths (or globs)
    #[serde(default)]
    pub error_logs: Vec<String>,

    /// Overrides `agent.collection_interval` for this instance
    #[serde(default, with = "humantime_serde::option")]
    pub collection_interval: Option<Duration>,
}

fn default_plus_api_version() -> u32 {
    DEFAULT_PLUS_API_VERSION
}

impl NginxInstanceConfig {
    /// Resolve into the shape the nginx collector works from.
    pub fn collector_config(&self, agent: &GeneralConfig) -> NginxCollectorConfig {
        let access_logs = self
            .access_logs
            .iter()
            .flat_map(|(pattern, format)| {
                let format = if format.trim().is_empty() {
                    DEFAULT_ACCESS_LOG_FORMAT.to_string()
                } else {
                    format.clone()
                };
                expand_log_paths(pattern)
                    .into_iter()
                    .map(move |path| (path, format.clone()))
            })
            .collect();

        let error_logs = self
            .error_logs
            .iter()
            .flat_map(|pattern| expand_log_paths(pattern))
            .collect();

        NginxCollectorConfig {
            nginx_id: self.id.clone(),
            stub_status: self.stub_status.clone(),
            plus_api: self.plus_api.clone(),
            client_version: self.plus_api_version,
            bin_path: self.bin_path.clone(),
            conf_path: self.conf_path.clone(),
            pid: self.pid,
            pid_file: self.pid_file.clone(),
            collection_interval: self.collection_interval.unwrap_or(agent.collection_interval),
            access_logs,
            error_logs,
        }
    }
}

/// How to reach and observe one nginx instance. Drives which sources the
/// nginx collector builds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NginxCollectorConfig {
    pub nginx_id: String,
    pub stub_status: String,
    pub plus_api: String,
    pub client_version: u32,
    pub bin_path: String,
    pub conf_path: String,
    pub pid: Option<u32>,
    pub pid_file: Option<PathBuf>,
    pub collection_interval: Duration,
    /// Resolved access log path to log_format
    pub access_logs: BTreeMap<String, String>,
    pub error_logs: Vec<String>,
}

impl NginxCollectorConfig {
    pub fn is_plus(&self) -> bool {
        !self.plus_api.is_empty()
    }

    /// True when the change requires the source set to be rebuilt.
    pub fn shape_changed(&self, other: &NginxCollectorConfig) -> bool {
        self.stub_status != other.stub_status
            || self.plus_api != other.plus_api
            || self.client_version != other.client_version
    }
}

#[cfg(feature = "log-processing")]
fn expand_log_paths(pattern: &str) -> Vec<String> {
    if !pattern.contains(['*', '?', '[']) {
        return vec![pattern.to_string()];
    }
    match glob::glob(pattern) {
        Ok(paths) => paths
            .filter_map(Result::ok)
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        Err(e) => {
            debug!(target: "nginx_telemetry::config", pattern, error = %e, "Invalid log glob");
            Vec::new()
        }
    }
}

#[cfg(not(feature = "log-processing"))]
fn expand_log_paths(pattern: &str) -> Vec<String> {
    debug!(target: "nginx_telemetry::config", pattern, "Glob expansion disabled");
    vec![pattern.to_string()]
}

// ----------------------------------------------------------------------------
// 3.5 Host, Container, Aggregation & Export Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            proc_root: default_proc_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cgroup_root: default_cgroup_root(),
        }
    }
}

/// What finalize does with a metric name the catalog does not know
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownMetricPolicy {
    Drop,
    Average,
}

impl Default for UnknownMetricPolicy {
    fn default() -> Self {
        UnknownMetricPolicy::Drop
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default)]
    pub unknown_metric_policy: UnknownMetricPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Log,
    Json,
}

impl Default for SinkKind {
    fn default() -> Self {
        SinkKind::Log
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub sink: SinkKind,

    /// Output file for the json sink
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

// ----------------------------------------------------------------------------
// 3.6 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

// ----------------------------------------------------------------------------
// 3.7 Configuration Hot-Reload
// ----------------------------------------------------------------------------

type ReloadCallback = Box<dyn Fn(&AgentConfig) + Send + Sync>;

/// Configuration manager with hot-reload support
pub struct ConfigManager {
    config: ArcSwap<AgentConfig>,
    config_path: Option<PathBuf>,
    last_modified: Mutex<Option<SystemTime>>,
    callbacks: RwLock<Vec<ReloadCallback>>,
}

impl ConfigManager {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            config_path: None,
            last_modified: Mutex::new(None),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let config = AgentConfig::load(path)?;
        let mut manager = Self::new(config);
        manager.config_path = Some(path.to_path_buf());
        *manager.last_modified.lock() = modified_time(path);
        Ok(manager)
    }

    /// Get current configuration
    pub fn get(&self) -> Arc<AgentConfig> {
        self.config.load_full()
    }

    /// Replace the configuration after validating it
    pub fn update(&self, config: AgentConfig) -> ConfigResult<()> {
        config.validate()?;
        self.config.store(Arc::new(config));

        let current = self.config.load();
        for callback in self.callbacks.read().iter() {
            callback(&current);
        }
        Ok(())
    }

    /// Reload from file
    pub fn reload(&self) -> ConfigResult<()> {
        if let Some(path) = &self.config_path {
            let config = AgentConfig::load(path).map_err(|e| ConfigError::ReloadFailed {
                message: e.to_string(),
            })?;
            self.update(config)?;
            *self.last_modified.lock() = modified_time(path);
        }
        Ok(())
    }

    /// Register a reload callback
    pub fn on_reload<F>(&self, callback: F)
    where
        F: Fn(&AgentConfig) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Box::new(callback));
    }

    /// Reload when the file's mtime moved. Returns whether a reload happened.
    pub fn check_and_reload(&self) -> ConfigResult<bool> {
        let Some(path) = &self.config_path else {
            return Ok(false);
        };
        let current = modified_time(path);
        let changed = match (current, *self.last_modified.lock()) {
            (Some(now), Some(last)) => now > last,
            (Some(_), None) => true,
            _ => false,
        };
        if changed {
            self.reload()?;
        }
        Ok(changed)
    }
}

impl Debug for ConfigManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigManager")
            .field("config", &*self.config.load())
            .field("config_path", &self.config_path)
            .finish()
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SAMPLE: &str = r#"
[agent]
system_id = "sys-1"
hostname = "web-01"
tags = ["prod", "eu"]
collection_interval = "10s"
report_interval = "1m"

[[nginx]]
id = "main"
stub_status = "http://127.0.0.1/nginx_status"
pid = 1234
error_logs = ["/var/log/nginx/error.log"]

[nginx.access_logs]
"/var/log/nginx/access.log" = ""
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = AgentConfig::from_str(SAMPLE).unwrap();
        assert_eq!(config.agent.collection_interval, Duration::from_secs(10));
        assert_eq!(config.agent.mode, ReportMode::Aggregated);
        assert_eq!(config.nginx.len(), 1);
        assert_eq!(config.nginx[0].plus_api_version, DEFAULT_PLUS_API_VERSION);

        let collector = &config.collector_configs()[0];
        assert_eq!(collector.collection_interval, Duration::from_secs(10));
        assert_eq!(
            collector.access_logs.get("/var/log/nginx/access.log").map(String::as_str),
            Some(DEFAULT_ACCESS_LOG_FORMAT)
        );
        assert!(!collector.is_plus());
    }

    #[test]
    fn test_rejects_short_interval() {
        let err = AgentConfig::from_str("[agent]\ncollection_interval = \"100ms\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_rejects_duplicate_instances() {
        let toml = r#"
[[nginx]]
id = "a"
pid = 1
[[nginx]]
id = "a"
pid = 2
"#;
        let err = AgentConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed { .. }));
    }

    #[test]
    fn test_rejects_instance_without_process_locator() {
        let err = AgentConfig::from_str("[[nginx]]\nid = \"a\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_default_config_round_trips() {
        let rendered = AgentConfig::generate_default_config();
        let parsed = AgentConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed.agent.report_interval, default_report_interval());
        assert!(parsed.system.enabled);
    }

    #[test]
    fn test_shape_changed() {
        let base = NginxCollectorConfig {
            stub_status: "http://localhost/status".into(),
            ..Default::default()
        };
        let mut same_shape = base.clone();
        same_shape.error_logs.push("/tmp/error.log".into());
        assert!(!base.shape_changed(&same_shape));

        let plus = NginxCollectorConfig {
            plus_api: "http://localhost/api".into(),
            ..base.clone()
        };
        assert!(base.shape_changed(&plus));
    }

    #[test]
    fn test_manager_reload_runs_callbacks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", SAMPLE).unwrap();

        let manager = ConfigManager::from_file(file.path()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        manager.on_reload(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        manager.reload().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get().agent.hostname, "web-01");
    }
}
