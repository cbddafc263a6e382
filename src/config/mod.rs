//! Configuration loading and validation.
//!
//! One TOML file, `#[serde(default)]` on every nested section, and a free
//! function per field default so both `Config::default()` and a partial
//! file parse to sane values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub r#static: StaticConfig,
    #[serde(default)]
    pub sticky_sessions: StickyConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub bot_detection: BotDetectionConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub idle: IdleConfig,
    #[serde(default)]
    pub proxy_routes: Vec<ProxyRouteConfig>,
    #[serde(default)]
    pub rewrites: Vec<RewriteRuleConfig>,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }

    /// Structured validation: path-prefix collisions, bad regexes, missing
    /// tenant directories. Returns every problem found rather than failing
    /// on the first one, so `--check-config` can report them all at once.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let mut seen_prefixes: HashMap<&str, &str> = HashMap::new();
        for tenant in &self.tenants {
            if let Some(existing) = seen_prefixes.insert(tenant.path.as_str(), tenant.name.as_str()) {
                problems.push(format!(
                    "tenant path prefix {:?} used by both {:?} and {:?}",
                    tenant.path, existing, tenant.name
                ));
            }
            if !tenant.working_dir.exists() {
                problems.push(format!(
                    "tenant {:?} working directory {} does not exist",
                    tenant.name,
                    tenant.working_dir.display()
                ));
            }
            if tenant.command.is_empty() {
                problems.push(format!("tenant {:?} has an empty command", tenant.name));
            }
        }

        for route in &self.proxy_routes {
            if route.is_regex {
                if let Err(e) = regex::Regex::new(&route.pattern) {
                    problems.push(format!("proxy route pattern {:?} is not a valid regex: {}", route.pattern, e));
                }
            }
        }

        for rule in &self.rewrites {
            if let Err(e) = regex::Regex::new(&rule.pattern) {
                problems.push(format!("rewrite pattern {:?} is not a valid regex: {}", rule.pattern, e));
            }
            if rule.action == RewriteAction::FlyReplay && rule.fly_replay_target.is_none() {
                problems.push(format!("rewrite rule {:?} has action fly_replay but no fly_replay_target", rule.pattern));
            }
        }

        if self.ports.min > self.ports.max {
            problems.push(format!(
                "port range is empty: min ({}) > max ({})",
                self.ports.min, self.ports.max
            ));
        }

        problems
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            r#static: StaticConfig::default(),
            sticky_sessions: StickyConfig::default(),
            auth: AuthConfig::default(),
            bot_detection: BotDetectionConfig::default(),
            ports: PortsConfig::default(),
            idle: IdleConfig::default(),
            proxy_routes: Vec::new(),
            rewrites: Vec::new(),
            tenants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Accept HTTP/2 cleartext (h2c) in addition to HTTP/1.1 (spec section 6).
    #[serde(default = "default_true")]
    pub h2c_enabled: bool,
    /// Bound on how long graceful shutdown waits for in-flight requests to drain.
    #[serde(default = "default_shutdown_drain_seconds")]
    pub shutdown_drain_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            h2c_enabled: default_true(),
            shutdown_drain_seconds: default_shutdown_drain_seconds(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_true() -> bool {
    true
}
fn default_shutdown_drain_seconds() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    /// URL prefix stripped before resolving against `public_dir` (spec 4.7).
    #[serde(default)]
    pub root_path: String,
    #[serde(default = "default_public_dir")]
    pub public_dir: PathBuf,
    /// Extension allow-list for ServeStatic; empty means "any extension".
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Suffixes tried in order for extensionless paths (TryFiles).
    #[serde(default = "default_try_files")]
    pub try_files: Vec<String>,
    #[serde(default = "default_true")]
    pub normalize_trailing_slash: bool,
    #[serde(default = "default_cache_max_age")]
    pub cache_max_age_seconds: u64,
    #[serde(default)]
    pub cache_immutable: bool,
    /// Longest-prefix-matched overrides of cache-control.
    #[serde(default)]
    pub cache_overrides: Vec<CacheOverride>,
    /// Served when no static file and no tenant prefix matches.
    pub fallback_file: Option<PathBuf>,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            root_path: String::new(),
            public_dir: default_public_dir(),
            extensions: Vec::new(),
            try_files: default_try_files(),
            normalize_trailing_slash: true,
            cache_max_age_seconds: default_cache_max_age(),
            cache_immutable: false,
            cache_overrides: Vec::new(),
            fallback_file: None,
        }
    }
}

fn default_public_dir() -> PathBuf {
    PathBuf::from("./public")
}
fn default_try_files() -> Vec<String> {
    vec![".html".to_string(), "/index.html".to_string()]
}
fn default_cache_max_age() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheOverride {
    pub prefix: String,
    pub max_age_seconds: u64,
    #[serde(default)]
    pub immutable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StickyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sticky_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_cookie_path")]
    pub cookie_path: String,
    #[serde(default = "default_sticky_max_age")]
    pub max_age_seconds: u64,
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_true")]
    pub http_only: bool,
    #[serde(default)]
    pub same_site: SameSitePolicy,
    /// Path globs scoping which requests are subject to stickiness; empty = all.
    #[serde(default)]
    pub paths: Vec<String>,
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cookie_name: default_sticky_cookie_name(),
            cookie_path: default_cookie_path(),
            max_age_seconds: default_sticky_max_age(),
            secure: false,
            http_only: true,
            same_site: SameSitePolicy::default(),
            paths: Vec::new(),
        }
    }
}

fn default_sticky_cookie_name() -> String {
    "fly-machine-id".to_string()
}
fn default_cookie_path() -> String {
    "/".to_string()
}
fn default_sticky_max_age() -> u64 {
    3600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    #[default]
    Lax,
    Strict,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Path globs that bypass authentication entirely.
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    /// htpasswd-format credential file. Parsing it is an external
    /// collaborator's job (spec section 1, out of scope); Navigator only
    /// needs a `CredentialStore` that can verify a username/password.
    pub htpasswd_file: Option<PathBuf>,
    #[serde(default = "default_realm")]
    pub realm: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            exclude_paths: Vec::new(),
            htpasswd_file: None,
            realm: default_realm(),
        }
    }
}

fn default_realm() -> String {
    "Navigator".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BotPolicy {
    Reject,
    StaticOnly,
    #[default]
    Ignore,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotDetectionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub policy: BotPolicy,
    /// Case-insensitive `User-Agent` substrings, in addition to Navigator's
    /// built-in baseline list.
    #[serde(default)]
    pub user_agents: Vec<String>,
}

impl Default for BotDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: BotPolicy::default(),
            user_agents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_port_min")]
    pub min: u16,
    #[serde(default = "default_port_max")]
    pub max: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            min: default_port_min(),
            max: default_port_max(),
        }
    }
}

fn default_port_min() -> u16 {
    4000
}
fn default_port_max() -> u16 {
    4999
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdleConfig {
    /// Process-wide idle threshold driving the suspend-to-disk signal.
    #[serde(default = "default_process_idle_seconds")]
    pub process_idle_seconds: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    /// Default per-tenant idle timeout before stopping the app instance.
    #[serde(default = "default_tenant_idle_seconds")]
    pub tenant_idle_seconds: u64,
    #[serde(default = "default_tenant_stop_grace_seconds")]
    pub tenant_stop_grace_seconds: u64,
    /// Deadline for a tenant readiness probe before giving up (spec 4.3).
    #[serde(default = "default_tenant_start_timeout_seconds")]
    pub tenant_start_timeout_seconds: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            process_idle_seconds: default_process_idle_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            tenant_idle_seconds: default_tenant_idle_seconds(),
            tenant_stop_grace_seconds: default_tenant_stop_grace_seconds(),
            tenant_start_timeout_seconds: default_tenant_start_timeout_seconds(),
        }
    }
}

fn default_process_idle_seconds() -> u64 {
    300
}
fn default_sweep_interval_seconds() -> u64 {
    5
}
fn default_tenant_idle_seconds() -> u64 {
    600
}
fn default_tenant_stop_grace_seconds() -> u64 {
    10
}
fn default_tenant_start_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyRouteConfig {
    pub pattern: String,
    #[serde(default)]
    pub is_regex: bool,
    pub target: String,
    #[serde(default)]
    pub strip_path: bool,
    #[serde(default)]
    pub websocket: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteAction {
    Redirect,
    FlyReplay,
    Last,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewriteRuleConfig {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
    pub action: RewriteAction,
    /// Method allow-list; `None` means "all methods".
    pub methods: Option<Vec<String>>,
    /// `"region-name"`, `"app=NAME"` or `"machine=ID:APP"` (spec 4.4).
    pub fly_replay_target: Option<String>,
    #[serde(default = "default_fly_replay_status")]
    pub fly_replay_status: u16,
    /// HTTP status for `redirect` actions.
    #[serde(default = "default_redirect_status")]
    pub redirect_status: u16,
}

fn default_fly_replay_status() -> u16 {
    307
}
fn default_redirect_status() -> u16 {
    302
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    pub name: String,
    /// URL path prefix this tenant owns (spec: "path prefixes are distinct").
    pub path: String,
    pub working_dir: PathBuf,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub bot_detection: Option<BotPolicy>,
    #[serde(default = "default_readiness_path")]
    pub readiness_path: String,
    pub idle_timeout_seconds: Option<u64>,
}

fn default_readiness_path() -> String {
    "/up".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_validation_problems() {
        let config = Config::default();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn duplicate_tenant_prefixes_are_rejected() {
        let mut config = Config::default();
        config.tenants.push(TenantConfig {
            name: "a".into(),
            path: "/app".into(),
            working_dir: PathBuf::from("."),
            command: vec!["true".into()],
            env: HashMap::new(),
            bot_detection: None,
            readiness_path: "/up".into(),
            idle_timeout_seconds: None,
        });
        config.tenants.push(TenantConfig {
            name: "b".into(),
            path: "/app".into(),
            working_dir: PathBuf::from("."),
            command: vec!["true".into()],
            env: HashMap::new(),
            bot_detection: None,
            readiness_path: "/up".into(),
            idle_timeout_seconds: None,
        });
        let problems = config.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("/app"));
    }

    #[test]
    fn invalid_port_range_is_rejected() {
        let mut config = Config::default();
        config.ports.min = 500;
        config.ports.max = 100;
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("port range")));
    }

    #[test]
    fn fly_replay_rule_without_target_is_rejected() {
        let mut config = Config::default();
        config.rewrites.push(RewriteRuleConfig {
            pattern: "^/api/".into(),
            replacement: String::new(),
            action: RewriteAction::FlyReplay,
            methods: None,
            fly_replay_target: None,
            fly_replay_status: 307,
            redirect_status: 302,
        });
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("fly_replay_target")));
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/navigator.toml")).unwrap();
        assert_eq!(config.server.port, default_port());
    }

    #[test]
    fn load_parses_a_minimal_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("navigator.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            port = 9000
            "#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, default_host());
    }
}
