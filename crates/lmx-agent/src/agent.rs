//! Process lifecycle: startup state machine, background tasks and shutdown

use crate::{AgentError, Result};
use lmx_adapter_accel::{CacheReclaimer, NullAccelerator, ReclaimerHandle, SystemMemoryMonitor};
use lmx_adapter_runtime::{build_helper_probes, build_runtime};
use lmx_core::{Accelerator, Config, HelperProbe, InferenceRuntime, MemoryMonitor};
use lmx_metrics::{MetricsRegistry, MetricsRegistryBuilder};
use lmx_router::{AppState, Collaborators, HttpServer, RateLimiter, RecoveryReport};
use lmx_state::RuntimeStateStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What happened during startup
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub startup_count: u64,
    pub safe_mode: bool,
    pub previous_unclean: bool,
    /// Reload of models left by an unclean exit
    pub recovery: RecoveryReport,
    /// Configured auto-load list
    pub auto_load: RecoveryReport,
}

/// Requests shutdown of a running [`Agent::run`]
#[derive(Debug, Clone)]
pub struct ShutdownTrigger(Arc<Notify>);

impl ShutdownTrigger {
    pub fn shutdown(&self) {
        self.0.notify_one();
    }
}

struct BackgroundTask {
    name: &'static str,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            warn!(task = self.name, error = %e, "Background task failed");
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    server_shutdown: oneshot::Sender<()>,
    server: JoinHandle<lmx_router::Result<()>>,
    reclaimer: Option<ReclaimerHandle>,
    bucket_eviction: Option<BackgroundTask>,
}

/// The lmx server process
pub struct Agent {
    config: Config,
    state: AppState,
    store: Arc<RuntimeStateStore>,
    reclaimer: Option<CacheReclaimer>,
    running: Option<Running>,
    startup: Option<StartupReport>,
    shutdown: Arc<Notify>,
}

impl Agent {
    /// Record the startup, bring up the server and background tasks, then
    /// recover models unless the crash-loop detector demands safe mode
    pub async fn start(&mut self) -> Result<StartupReport> {
        if self.running.is_some() {
            return Err(AgentError::AlreadyRunning);
        }

        info!(
            runtime = self.state.models.runtime().runtime_type(),
            capacity = self.config.admission.max_concurrent_requests,
            "Starting lmx"
        );

        let record = self.store.record_startup().await?;
        let safe_mode = record.safe_mode();
        self.state
            .lifecycle()
            .set(safe_mode, record.current.startup_count);
        self.state
            .metrics
            .set_lifecycle(safe_mode, record.current.startup_count);

        let mut report = StartupReport {
            startup_count: record.current.startup_count,
            safe_mode,
            previous_unclean: record.previous_unclean(),
            ..StartupReport::default()
        };

        // Serve probes while models are coming back
        let server = HttpServer::new(&self.config.server, self.state.clone());
        let listener = server.bind().await?;
        let local_addr = listener.local_addr()?;
        let (server_shutdown, server_shutdown_rx) = oneshot::channel::<()>();
        let server_task = tokio::spawn(server.serve_with_listener(listener, async move {
            let _ = server_shutdown_rx.await;
        }));

        let reclaimer = match self.reclaimer.take() {
            Some(reclaimer) if self.config.reclaimer.enabled => Some(reclaimer.spawn()),
            _ => None,
        };
        let bucket_eviction = self
            .state
            .rate_limiter
            .is_enabled()
            .then(|| spawn_bucket_eviction(Arc::clone(&self.state.rate_limiter)));

        self.running = Some(Running {
            local_addr,
            server_shutdown,
            server: server_task,
            reclaimer,
            bucket_eviction,
        });

        if safe_mode {
            warn!(
                recent_startups = record.verdict.recent_startups,
                threshold = record.verdict.threshold,
                window_secs = record.verdict.window_secs,
                "Crash loop detected, starting in safe mode with no models loaded"
            );
        } else {
            if report.previous_unclean {
                let models = record.models_to_recover();
                info!(models = ?models, "Previous shutdown was unclean, recovering models");
                report.recovery = self.state.models.recover(models).await;
            }
            report.auto_load = self
                .state
                .models
                .auto_load(&self.config.models.auto_load)
                .await;
            self.state.models.persist(false).await?;
        }

        let loaded = self.state.models.loaded_models().await;
        self.state.metrics.set_loaded_models(loaded.len());
        info!(
            addr = %local_addr,
            startup_count = report.startup_count,
            safe_mode,
            models = ?loaded,
            "lmx started"
        );

        self.startup = Some(report.clone());
        Ok(report)
    }

    /// Ordered shutdown ending with the clean-shutdown record
    ///
    /// New work is refused first, in-flight requests get up to the drain
    /// timeout, background tasks stop, and only then is the final model set
    /// persisted as clean.
    pub async fn stop(&mut self) -> Result<()> {
        let running = self.running.take().ok_or(AgentError::NotRunning)?;
        info!("Stopping lmx");

        self.state.admission.close();
        let _ = running.server_shutdown.send(());

        let drain_timeout = self.config.admission.drain_timeout();
        if !self.state.admission.drain(drain_timeout).await {
            warn!(
                in_flight = self.state.admission.in_flight(),
                timeout_secs = drain_timeout.as_secs(),
                "Drain timed out with requests still in flight"
            );
        }

        let mut server = running.server;
        match tokio::time::timeout(drain_timeout, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "HTTP server exited with error"),
            Ok(Err(e)) => error!(error = %e, "HTTP server task failed"),
            Err(_) => {
                warn!("HTTP server did not stop in time, aborting");
                server.abort();
            }
        }

        if let Some(reclaimer) = running.reclaimer {
            reclaimer.shutdown().await;
        }
        if let Some(task) = running.bucket_eviction {
            task.stop().await;
        }

        self.state.models.persist(true).await?;
        let models = self.state.models.loaded_models().await;
        info!(models = ?models, "Clean shutdown recorded");
        Ok(())
    }

    /// Start, wait for a termination signal or a trigger, then stop
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        tokio::select! {
            _ = self.shutdown.notified() => info!("Shutdown requested"),
            _ = wait_for_termination() => info!("Received termination signal"),
        }

        self.stop().await
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger(Arc::clone(&self.shutdown))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn app_state(&self) -> &AppState {
        &self.state
    }

    pub fn metrics_registry(&self) -> &MetricsRegistry {
        &self.state.metrics
    }

    pub fn state_store(&self) -> &Arc<RuntimeStateStore> {
        &self.store
    }

    /// Address the HTTP server is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn startup_report(&self) -> Option<&StartupReport> {
        self.startup.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.server_shutdown.send(());
            if let Some(task) = running.bucket_eviction {
                let _ = task.shutdown_tx.send(());
            }
        }
    }
}

fn spawn_bucket_eviction(limiter: Arc<RateLimiter>) -> BackgroundTask {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let period = (limiter.idle_eviction() / 2).max(Duration::from_secs(1));

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    limiter.prune_idle();
                }
            }
        }
        debug!("Rate-limit bucket eviction stopped");
    });

    BackgroundTask {
        name: "bucket-eviction",
        shutdown_tx,
        handle,
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to install signal handlers, falling back to Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Builder for [`Agent`]
///
/// Collaborators not supplied explicitly are built from configuration.
#[derive(Default)]
pub struct AgentBuilder {
    config: Option<Config>,
    runtime: Option<Arc<dyn InferenceRuntime>>,
    memory: Option<Arc<dyn MemoryMonitor>>,
    accelerator: Option<Arc<dyn Accelerator>>,
    helpers: Option<Vec<Arc<dyn HelperProbe>>>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn InferenceRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_memory_monitor(mut self, memory: Arc<dyn MemoryMonitor>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_accelerator(mut self, accelerator: Arc<dyn Accelerator>) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    pub fn with_helpers(mut self, helpers: Vec<Arc<dyn HelperProbe>>) -> Self {
        self.helpers = Some(helpers);
        self
    }

    pub fn build(self) -> Result<Agent> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        if config.security.admin_key.as_deref().map_or(true, str::is_empty) {
            warn!("No admin key configured, administrative routes are unauthenticated");
        }

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => build_runtime(&config.runtime)?,
        };
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(SystemMemoryMonitor::new()));
        let accelerator = self
            .accelerator
            .unwrap_or_else(|| Arc::new(NullAccelerator));
        let helpers = match self.helpers {
            Some(helpers) => helpers,
            None => build_helper_probes(&config.helpers, config.health.helper_timeout())?,
        };

        let metrics = MetricsRegistryBuilder::new()
            .with_global_label("runtime", runtime.runtime_type())
            .build()?;
        let store = Arc::new(RuntimeStateStore::from_config(&config.state));
        let reclaimer = CacheReclaimer::new(Arc::clone(&accelerator), config.reclaimer.clone());

        let state = AppState::new(
            &config,
            Collaborators {
                runtime,
                memory,
                accelerator,
                helpers,
                state_store: Arc::clone(&store),
            },
            metrics,
        )
        .with_reclaimer_stats(reclaimer.stats());

        Ok(Agent {
            config,
            state,
            store,
            reclaimer: Some(reclaimer),
            running: None,
            startup: None,
            shutdown: Arc::new(Notify::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmx_adapter_accel::mock::MockMemoryMonitor;
    use lmx_adapter_runtime::mock::MockRuntime;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.port = 0;
        config.state.path = dir.path().join("runtime-state.json");
        config.admission.drain_timeout_secs = 2;
        config
    }

    fn build(config: Config, runtime: Arc<MockRuntime>) -> Agent {
        AgentBuilder::new()
            .with_config(config)
            .with_runtime(runtime)
            .with_memory_monitor(Arc::new(MockMemoryMonitor::new(40.0)))
            .with_helpers(Vec::new())
            .build()
            .unwrap()
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_first_start_and_clean_stop() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let mut agent = build(test_config(&dir), runtime.clone());

        let report = agent.start().await.unwrap();
        assert_eq!(report.startup_count, 1);
        assert!(!report.safe_mode);
        assert!(!report.previous_unclean);
        assert!(runtime.load_attempts().is_empty());

        let addr = agent.local_addr().unwrap();
        assert!(get(addr, "/healthz").await.starts_with("HTTP/1.1 200"));
        assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 503"));

        // mid-session the record looks unclean
        let state = agent.state_store().load().await.unwrap().unwrap();
        assert!(!state.last_clean_shutdown);

        agent.stop().await.unwrap();
        assert!(!agent.is_running());
        let state = agent.state_store().load().await.unwrap().unwrap();
        assert!(state.last_clean_shutdown);
        assert_eq!(state.recent_startups.len(), 1);
        assert_eq!(state.startup_count, 1);

        assert!(matches!(agent.stop().await, Err(AgentError::NotRunning)));
    }

    #[tokio::test]
    async fn test_recovery_after_unclean_shutdown_skips_failures() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let previous = RuntimeStateStore::new(&config.state.path);
        previous
            .save(&["m1".to_string(), "m2".to_string()], false)
            .await
            .unwrap();

        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_model("m1");
        let mut agent = build(config, runtime.clone());

        let report = agent.start().await.unwrap();
        assert!(report.previous_unclean);
        assert!(!report.safe_mode);
        assert_eq!(runtime.load_attempts(), vec!["m1", "m2"]);
        assert_eq!(report.recovery.loaded, vec!["m2"]);
        assert_eq!(report.recovery.failed[0].model_id, "m1");

        let addr = agent.local_addr().unwrap();
        assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 200"));

        agent.stop().await.unwrap();
        let state = agent.state_store().load().await.unwrap().unwrap();
        assert_eq!(state.loaded_models, vec!["m2"]);
        assert!(state.last_clean_shutdown);
    }

    #[tokio::test]
    async fn test_clean_previous_exit_is_not_recovered() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        RuntimeStateStore::new(&config.state.path)
            .save(&["m1".to_string()], true)
            .await
            .unwrap();

        let runtime = Arc::new(MockRuntime::new());
        let mut agent = build(config, runtime.clone());
        let report = agent.start().await.unwrap();
        assert!(!report.previous_unclean);
        assert!(runtime.load_attempts().is_empty());
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_loop_enters_safe_mode() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.models.auto_load = vec!["m3".to_string()];

        // two earlier startups that never shut down cleanly
        let previous = RuntimeStateStore::from_config(&config.state);
        previous.record_startup().await.unwrap();
        previous.record_startup().await.unwrap();
        previous.save(&["m1".to_string()], false).await.unwrap();

        let runtime = Arc::new(MockRuntime::new());
        let mut agent = build(config, runtime.clone());
        let report = agent.start().await.unwrap();

        assert!(report.safe_mode);
        assert_eq!(report.startup_count, 3);
        assert!(runtime.load_attempts().is_empty());
        assert!(agent.app_state().lifecycle().safe_mode());

        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_two_startups_are_not_a_crash_loop() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let previous = RuntimeStateStore::from_config(&config.state);
        previous.record_startup().await.unwrap();
        previous.save(&["m1".to_string()], false).await.unwrap();

        let runtime = Arc::new(MockRuntime::new());
        let mut agent = build(config, runtime.clone());
        let report = agent.start().await.unwrap();

        assert!(!report.safe_mode);
        assert_eq!(report.startup_count, 2);
        assert_eq!(runtime.load_attempts(), vec!["m1"]);
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_load_after_recovery() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.models.auto_load = vec!["m1".to_string(), "m3".to_string()];

        RuntimeStateStore::new(&config.state.path)
            .save(&["m1".to_string()], false)
            .await
            .unwrap();

        let runtime = Arc::new(MockRuntime::new());
        let mut agent = build(config, runtime.clone());
        let report = agent.start().await.unwrap();

        assert_eq!(report.recovery.loaded, vec!["m1"]);
        assert_eq!(report.auto_load.loaded, vec!["m3"]);
        assert_eq!(runtime.load_attempts(), vec!["m1", "m3"]);
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_until_triggered() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runtime-state.json");
        let mut agent = build(test_config(&dir), Arc::new(MockRuntime::new()));
        let trigger = agent.shutdown_trigger();

        let task = tokio::spawn(async move { agent.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.shutdown();

        task.await.unwrap().unwrap();
        let state = RuntimeStateStore::new(path).load().await.unwrap().unwrap();
        assert!(state.last_clean_shutdown);
    }

    #[tokio::test]
    async fn test_lifecycle_futures_can_be_spawned() {
        fn assert_send<T: Send>(_: T) {}

        let dir = TempDir::new().unwrap();
        let mut agent = build(test_config(&dir), Arc::new(MockRuntime::new()));
        assert_send(agent.stop());
        assert_send(agent.run());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut agent = build(test_config(&dir), Arc::new(MockRuntime::new()));
        agent.start().await.unwrap();
        assert!(matches!(agent.start().await, Err(AgentError::AlreadyRunning)));
        agent.stop().await.unwrap();
    }

    #[test]
    fn test_invalid_config_fails_build() {
        let mut config = Config::default();
        config.admission.max_concurrent_requests = 0;
        let result = AgentBuilder::new()
            .with_config(config)
            .with_runtime(Arc::new(MockRuntime::new()))
            .build();
        assert!(matches!(result, Err(AgentError::Core(_))));
    }
}
