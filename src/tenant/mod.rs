//! Per-tenant process lifecycle (spec section 4.3): lazy spawn, port
//! assignment, readiness probing, single-flight start, idle shutdown.

pub mod ports;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{BotPolicy, Config, IdleConfig};
use crate::error::NavigatorError;
use ports::PortAllocator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppState {
    Ready,
    Stopping,
    Failed,
}

/// Immutable-per-reload tenant descriptor (spec section 3).
#[derive(Debug, Clone)]
pub struct TenantDescriptor {
    pub name: String,
    pub path_prefix: String,
    pub working_dir: std::path::PathBuf,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub readiness_path: String,
    pub idle_timeout: Duration,
    pub bot_detection: Option<BotPolicy>,
}

impl TenantDescriptor {
    pub fn from_config(config: &Config) -> Vec<Self> {
        config
            .tenants
            .iter()
            .map(|t| TenantDescriptor {
                name: t.name.clone(),
                path_prefix: t.path.clone(),
                working_dir: t.working_dir.clone(),
                command: t.command.clone(),
                env: t.env.clone(),
                readiness_path: t.readiness_path.clone(),
                idle_timeout: Duration::from_secs(
                    t.idle_timeout_seconds.unwrap_or(config.idle.tenant_idle_seconds),
                ),
                bot_detection: t.bot_detection,
            })
            .collect()
    }

    /// Longest-prefix match among the given descriptors (spec 4.1 tie-break iii).
    pub fn longest_prefix_match<'a>(descriptors: &'a [Self], path: &str) -> Option<&'a Self> {
        descriptors
            .iter()
            .filter(|d| path.starts_with(d.path_prefix.as_str()))
            .max_by_key(|d| d.path_prefix.len())
    }
}

struct TenantRuntime {
    name: String,
    port: u16,
    child: SyncMutex<Option<Child>>,
    last_used: SyncMutex<Instant>,
    refcount: AtomicI64,
    state: SyncMutex<AppState>,
    stop_grace: Duration,
}

type TenantCell = Arc<OnceCell<Arc<TenantRuntime>>>;

pub struct TenantAppManager {
    descriptors: HashMap<String, TenantDescriptor>,
    ports: Arc<PortAllocator>,
    cells: DashMap<String, TenantCell>,
    http_client: reqwest::Client,
    idle: IdleConfig,
}

/// Held by the pipeline for the duration of one proxied request; releases
/// the tenant's refcount on drop (spec 4.3: "Release is idempotent").
pub struct TenantHandle {
    runtime: Arc<TenantRuntime>,
    released: bool,
}

impl TenantHandle {
    pub fn target_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.runtime.port)
    }

    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if !self.released {
            self.released = true;
            self.runtime.refcount.fetch_sub(1, Ordering::SeqCst);
            *self.runtime.last_used.lock() = Instant::now();
        }
    }
}

impl Drop for TenantHandle {
    fn drop(&mut self) {
        self.do_release();
    }
}

impl TenantAppManager {
    pub fn new(descriptors: Vec<TenantDescriptor>, ports: Arc<PortAllocator>, idle: IdleConfig) -> Arc<Self> {
        let descriptors = descriptors.into_iter().map(|d| (d.name.clone(), d)).collect();
        Arc::new(Self {
            descriptors,
            ports,
            cells: DashMap::new(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("readiness probe client builds with static config"),
            idle,
        })
    }

    pub fn descriptor(&self, name: &str) -> Option<&TenantDescriptor> {
        self.descriptors.get(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &TenantDescriptor> {
        self.descriptors.values()
    }

    /// `acquire(name)`: blocks until ready or the tenant's start deadline
    /// elapses. Concurrent callers for the same absent tenant observe a
    /// single spawn (testable property 1).
    pub async fn acquire(&self, name: &str) -> Result<TenantHandle, NavigatorError> {
        let descriptor = self
            .descriptors
            .get(name)
            .ok_or_else(|| NavigatorError::TenantNotFound(name.to_string()))?;

        let cell: TenantCell = self.cells.entry(name.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone();

        let result = cell.get_or_try_init(|| self.spawn_and_probe(descriptor)).await;

        match result {
            Ok(runtime) => {
                if *runtime.state.lock() != AppState::Ready {
                    // Stale record left behind by a concurrent stop; discard
                    // so the next caller respawns (spec 4.3 invariant 5).
                    self.cells.remove(name);
                    return Err(NavigatorError::UpstreamUnavailable(format!(
                        "tenant {name} is shutting down, retry"
                    )));
                }
                runtime.refcount.fetch_add(1, Ordering::SeqCst);
                *runtime.last_used.lock() = Instant::now();
                Ok(TenantHandle { runtime: runtime.clone(), released: false })
            }
            Err(message) => {
                // Failed record is discarded so the next acquire retries a
                // fresh spawn (spec 4.3 *starting* -> *failed* transition).
                self.cells.remove(name);
                Err(NavigatorError::TenantStartFailed(message.clone()))
            }
        }
    }

    async fn spawn_and_probe(&self, descriptor: &TenantDescriptor) -> Result<Arc<TenantRuntime>, String> {
        crate::metrics::record_tenant_start_attempt();
        let port = self
            .ports
            .acquire(&descriptor.name)
            .ok_or_else(|| "no free ports available in the configured range".to_string())?;

        info!(tenant = %descriptor.name, port, "starting tenant application");

        let mut command = Command::new(&descriptor.command[0]);
        command
            .args(&descriptor.command[1..])
            .current_dir(&descriptor.working_dir)
            .envs(descriptor.env.clone())
            .env("PORT", port.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.ports.release(&descriptor.name);
                return Err(format!("failed to spawn {:?}: {e}", descriptor.command[0]));
            }
        };

        spawn_log_relay(&descriptor.name, child.stdout.take(), "stdout");
        spawn_log_relay(&descriptor.name, child.stderr.take(), "stderr");

        let deadline = Instant::now() + Duration::from_secs(self.idle.tenant_start_timeout_seconds);
        match probe_readiness(&self.http_client, port, &descriptor.readiness_path, deadline, &mut child).await {
            Ok(()) => {
                info!(tenant = %descriptor.name, port, "tenant application ready");
                crate::metrics::set_tenant_instances_running(self.cells.len());
                crate::metrics::set_port_pool_usage(self.ports.assigned_count(), self.ports.capacity());
                Ok(Arc::new(TenantRuntime {
                    name: descriptor.name.clone(),
                    port,
                    child: SyncMutex::new(Some(child)),
                    last_used: SyncMutex::new(Instant::now()),
                    refcount: AtomicI64::new(0),
                    state: SyncMutex::new(AppState::Ready),
                    stop_grace: descriptor.idle_timeout.min(Duration::from_secs(30)).max(Duration::from_secs(1)),
                }))
            }
            Err(e) => {
                warn!(tenant = %descriptor.name, error = %e, "tenant failed to become ready");
                crate::metrics::record_tenant_start_failure();
                let _ = child.start_kill();
                let _ = child.wait().await;
                self.ports.release(&descriptor.name);
                Err(e)
            }
        }
    }

    /// Idle-sweep: stops any tenant whose refcount is zero and whose
    /// last-used timestamp exceeds its idle timeout (spec 4.3 invariant 3).
    pub async fn sweep_idle(&self, default_timeout: Duration, stop_grace: Duration) {
        let mut to_stop = Vec::new();
        for entry in self.cells.iter() {
            if let Some(runtime) = entry.value().get() {
                if runtime.refcount.load(Ordering::SeqCst) != 0 {
                    continue;
                }
                if *runtime.state.lock() != AppState::Ready {
                    continue;
                }
                let idle_for = runtime.last_used.lock().elapsed();
                let threshold = self.descriptors.get(runtime.name.as_str()).map(|d| d.idle_timeout).unwrap_or(default_timeout);
                if idle_for >= threshold {
                    to_stop.push(runtime.clone());
                }
            }
        }
        for runtime in to_stop {
            self.stop_runtime(&runtime, stop_grace).await;
            self.cells.remove(&runtime.name);
            crate::metrics::record_tenant_idle_shutdown();
        }
        crate::metrics::set_tenant_instances_running(self.cells.len());
        crate::metrics::set_port_pool_usage(self.ports.assigned_count(), self.ports.capacity());
    }

    /// Stops every running tenant with its configured grace period (spec 5
    /// shutdown sequencing / SPEC_FULL 10.7).
    pub async fn shutdown_all(&self, stop_grace: Duration) {
        let runtimes: Vec<_> = self
            .cells
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();
        for runtime in runtimes {
            self.stop_runtime(&runtime, stop_grace).await;
        }
        self.cells.clear();
    }

    async fn stop_runtime(&self, runtime: &Arc<TenantRuntime>, stop_grace: Duration) {
        *runtime.state.lock() = AppState::Stopping;
        let mut child_guard = runtime.child.lock();
        let Some(mut child) = child_guard.take() else {
            return;
        };
        drop(child_guard);

        info!(tenant = %runtime.name, "stopping tenant application");
        send_graceful_signal(&child);

        let grace = stop_grace.min(runtime.stop_grace).max(Duration::from_millis(100));
        let exited = tokio::time::timeout(grace, child.wait()).await;
        if exited.is_err() {
            warn!(tenant = %runtime.name, "tenant did not exit within grace period, force-killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        self.ports.release(&runtime.name);
        *runtime.state.lock() = AppState::Stopping;
    }
}

#[cfg(unix)]
fn send_graceful_signal(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is a valid child pid owned by this process; sending
        // SIGTERM to it is the documented graceful-shutdown request.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_graceful_signal(_child: &Child) {
    // No portable graceful-signal equivalent; the grace-period wait below
    // still applies before force-kill.
}

fn spawn_log_relay<R>(tenant: &str, pipe: Option<R>, stream_name: &'static str)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else { return };
    let tenant = tenant.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(tenant = %tenant, stream = stream_name, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    warn!(tenant = %tenant, stream = stream_name, error = %e, "log relay read error");
                    break;
                }
            }
        }
    });
}

/// Pure loopback HTTP client against the assigned port; deliberately does
/// not go through the request pipeline (design notes section 9).
async fn probe_readiness(
    client: &reqwest::Client,
    port: u16,
    path: &str,
    deadline: Instant,
    child: &mut Child,
) -> Result<(), String> {
    let url = format!("http://127.0.0.1:{port}{path}");
    let mut backoff = Duration::from_millis(25);

    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(format!("process exited before becoming ready (status {status})"));
        }

        match client.get(&url).send().await {
            Ok(resp) if resp.status().as_u16() < 500 => return Ok(()),
            _ => {}
        }

        if Instant::now() >= deadline {
            return Err(format!("readiness probe against {url} did not succeed before deadline"));
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_millis(500));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, prefix: &str) -> TenantDescriptor {
        TenantDescriptor {
            name: name.to_string(),
            path_prefix: prefix.to_string(),
            working_dir: std::path::PathBuf::from("."),
            command: vec!["true".to_string()],
            env: HashMap::new(),
            readiness_path: "/up".to_string(),
            idle_timeout: Duration::from_secs(600),
            bot_detection: None,
        }
    }

    #[test]
    fn longest_prefix_wins_among_overlapping_tenants() {
        let descriptors = vec![descriptor("root", "/"), descriptor("showcase", "/showcase/"), descriptor("t1", "/showcase/t1/")];
        let found = TenantDescriptor::longest_prefix_match(&descriptors, "/showcase/t1/index").unwrap();
        assert_eq!(found.name, "t1");
    }

    #[test]
    fn no_match_when_no_prefix_fits() {
        let descriptors = vec![descriptor("t1", "/showcase/t1/")];
        assert!(TenantDescriptor::longest_prefix_match(&descriptors, "/other").is_none());
    }

    #[tokio::test]
    async fn acquire_on_unknown_tenant_is_not_found() {
        let manager = TenantAppManager::new(Vec::new(), Arc::new(PortAllocator::new(4000, 4010)), IdleConfig::default());
        let err = manager.acquire("ghost").await.unwrap_err();
        assert!(matches!(err, NavigatorError::TenantNotFound(_)));
    }
}
