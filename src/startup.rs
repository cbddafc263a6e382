//! Startup self-checks module
//!
//! Runs before the server accepts connections. Unlike the access-log and
//! reverse-proxy request path, these checks are allowed to be expensive and
//! synchronous: they exist to fail fast with a clear message rather than let
//! a misconfigured tenant surface as a confusing 502 later.

use serde::Serialize;
use std::path::Path;
use tracing::{error, info, warn};

use crate::config::Config;

/// Result of a single startup check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    /// Whether this check failing should abort startup.
    pub critical: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { name: name.into(), passed: true, critical: false, message: message.into(), details: None }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>, critical: bool) -> Self {
        Self { name: name.into(), passed: false, critical, message: message.into(), details: None }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Aggregated startup check results.
#[derive(Debug, Clone, Serialize)]
pub struct StartupCheckReport {
    pub checks: Vec<CheckResult>,
    pub all_critical_passed: bool,
    pub all_passed: bool,
    pub summary: String,
}

impl StartupCheckReport {
    pub fn new(checks: Vec<CheckResult>) -> Self {
        let all_critical_passed = checks.iter().filter(|c| c.critical).all(|c| c.passed);
        let all_passed = checks.iter().all(|c| c.passed);
        let failed_critical = checks.iter().filter(|c| c.critical && !c.passed).count();
        let failed_non_critical = checks.iter().filter(|c| !c.critical && !c.passed).count();
        let total = checks.len();
        let passed = checks.iter().filter(|c| c.passed).count();

        let summary = if all_passed {
            format!("All {total} startup checks passed")
        } else if all_critical_passed {
            format!("{passed}/{total} checks passed ({failed_non_critical} non-critical warnings)")
        } else {
            format!("{passed}/{total} checks passed ({failed_critical} critical failures)")
        };

        Self { checks, all_critical_passed, all_passed, summary }
    }
}

/// Runs every startup check and logs each result as it completes (spec
/// section 10: config validation, tenant working directories, tenant
/// commands, static root, port range).
pub fn run_startup_checks(config: &Config) -> StartupCheckReport {
    info!("running startup self-checks");

    let mut checks = Vec::new();
    checks.push(check_config_validation(config));
    checks.push(check_tenant_prefixes(config));
    checks.push(check_tenant_working_dirs(config));
    checks.push(check_tenant_commands(config));
    checks.push(check_static_root(config));
    checks.push(check_port_range(config));

    let report = StartupCheckReport::new(checks);

    for check in &report.checks {
        if check.passed {
            info!(check = %check.name, message = %check.message, "startup check passed");
        } else if check.critical {
            error!(check = %check.name, message = %check.message, details = ?check.details, "startup check failed (critical)");
        } else {
            warn!(check = %check.name, message = %check.message, details = ?check.details, "startup check failed (non-critical)");
        }
    }

    info!(summary = %report.summary, all_passed = report.all_passed, "startup checks completed");
    report
}

/// Re-runs `Config::validate` and folds every message into one check; this
/// duplicates the same errors `--check-config` prints, but here they block
/// startup instead of just being reported.
fn check_config_validation(config: &Config) -> CheckResult {
    let errors = config.validate();
    if errors.is_empty() {
        CheckResult::pass("config_validation", "configuration is internally consistent")
    } else {
        CheckResult::fail("config_validation", "configuration has validation errors", true)
            .with_details(errors.join("; "))
    }
}

fn check_tenant_prefixes(config: &Config) -> CheckResult {
    let mut prefixes: Vec<&str> = config.tenants.iter().map(|t| t.path.as_str()).collect();
    prefixes.sort_unstable();
    let duplicate = prefixes.windows(2).find(|pair| pair[0] == pair[1]);
    match duplicate {
        None => CheckResult::pass("tenant_prefixes", format!("{} tenants, prefixes distinct", config.tenants.len())),
        Some(pair) => {
            CheckResult::fail("tenant_prefixes", "duplicate tenant path prefix", true).with_details(pair[0].to_string())
        }
    }
}

fn check_tenant_working_dirs(config: &Config) -> CheckResult {
    let missing: Vec<String> = config
        .tenants
        .iter()
        .filter(|t| !t.working_dir.is_dir())
        .map(|t| format!("{}: {}", t.name, t.working_dir.display()))
        .collect();
    if missing.is_empty() {
        CheckResult::pass("tenant_working_dirs", "all tenant working directories exist")
    } else {
        CheckResult::fail("tenant_working_dirs", "tenant working directory missing", true)
            .with_details(missing.join(", "))
    }
}

/// Resolves the first element of each tenant's `command` either as an
/// absolute/relative path or by searching `PATH`, mirroring what the shell
/// would do at spawn time (spec 4.3: tenant process launch).
fn check_tenant_commands(config: &Config) -> CheckResult {
    let path_var = std::env::var_os("PATH");
    let unresolved: Vec<String> = config
        .tenants
        .iter()
        .filter_map(|t| {
            let program = t.command.first()?;
            if command_resolves(program, path_var.as_deref()) {
                None
            } else {
                Some(format!("{}: {}", t.name, program))
            }
        })
        .collect();

    if unresolved.is_empty() {
        CheckResult::pass("tenant_commands", "all tenant commands resolve")
    } else {
        CheckResult::fail("tenant_commands", "tenant command not found on PATH", false)
            .with_details(unresolved.join(", "))
    }
}

fn command_resolves(program: &str, path_var: Option<&std::ffi::OsStr>) -> bool {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file();
    }
    let Some(path_var) = path_var else { return false };
    std::env::split_paths(path_var).any(|dir| dir.join(program).is_file())
}

fn check_static_root(config: &Config) -> CheckResult {
    let public_dir = &config.r#static.public_dir;
    if public_dir.is_dir() {
        CheckResult::pass("static_root", "static public directory exists")
            .with_details(public_dir.display().to_string())
    } else {
        CheckResult::fail("static_root", "static public directory does not exist", false)
            .with_details(public_dir.display().to_string())
    }
}

fn check_port_range(config: &Config) -> CheckResult {
    let ports = &config.ports;
    if ports.min < ports.max {
        CheckResult::pass("port_range", format!("tenant port pool [{}, {})", ports.min, ports.max))
    } else {
        CheckResult::fail("port_range", "tenant port range is empty or inverted", true)
            .with_details(format!("min={} max={}", ports.min, ports.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_result_pass() {
        let result = CheckResult::pass("test", "ok");
        assert!(result.passed);
        assert!(!result.critical);
    }

    #[test]
    fn check_result_fail() {
        let result = CheckResult::fail("test", "bad", true);
        assert!(!result.passed);
        assert!(result.critical);
    }

    #[test]
    fn report_all_passed() {
        let report = StartupCheckReport::new(vec![CheckResult::pass("a", "ok"), CheckResult::pass("b", "ok")]);
        assert!(report.all_passed);
        assert!(report.all_critical_passed);
    }

    #[test]
    fn report_critical_failure() {
        let report = StartupCheckReport::new(vec![CheckResult::pass("a", "ok"), CheckResult::fail("b", "bad", true)]);
        assert!(!report.all_passed);
        assert!(!report.all_critical_passed);
    }

    #[test]
    fn report_non_critical_failure_still_critical_ok() {
        let report = StartupCheckReport::new(vec![CheckResult::pass("a", "ok"), CheckResult::fail("b", "warn", false)]);
        assert!(!report.all_passed);
        assert!(report.all_critical_passed);
    }

    #[test]
    fn command_resolves_absolute_path() {
        assert!(command_resolves("/bin/sh", None) || command_resolves("/bin/ls", None));
    }

    #[test]
    fn command_does_not_resolve_unknown_bare_name() {
        assert!(!command_resolves("definitely-not-a-real-binary-xyz", Some(std::ffi::OsStr::new("/usr/bin"))));
    }
}
