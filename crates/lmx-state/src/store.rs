//! File-backed runtime state store
//!
//! One JSON record per installation. Every write goes to a temporary file,
//! is fsynced and then renamed over the record, so a crash mid-write leaves
//! either the old or the new record and never a torn one. Writers are
//! serialized through the in-memory cache lock and each call returns only
//! after the record is durable.

use crate::identity::{current_instance_name, owner_alive};
use crate::{CrashLoopDetector, CrashLoopVerdict, Result, RuntimeState, StateError};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Durable store for [`RuntimeState`]
#[derive(Debug)]
pub struct RuntimeStateStore {
    path: PathBuf,
    detector: CrashLoopDetector,
    enforce_single_instance: bool,
    instance_name: String,
    current: Mutex<Option<RuntimeState>>,
}

/// What the store learned while recording a startup
#[derive(Debug, Clone)]
pub struct StartupRecord {
    /// Record left by the previous process, `None` on first run
    pub previous: Option<RuntimeState>,
    /// Record as written for this process
    pub current: RuntimeState,
    pub verdict: CrashLoopVerdict,
}

impl StartupRecord {
    pub fn safe_mode(&self) -> bool {
        self.verdict.safe_mode
    }

    /// True when the previous exit was unclean
    pub fn previous_unclean(&self) -> bool {
        self.previous
            .as_ref()
            .map(RuntimeState::was_unclean)
            .unwrap_or(false)
    }

    /// Models to reload: empty in safe mode or after a clean exit
    pub fn models_to_recover(&self) -> &[String] {
        match &self.previous {
            Some(prev) if !self.safe_mode() && prev.was_unclean() => &prev.loaded_models,
            _ => &[],
        }
    }
}

impl RuntimeStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            detector: CrashLoopDetector::default(),
            enforce_single_instance: true,
            instance_name: current_instance_name().unwrap_or_else(|| "lmxd".to_string()),
            current: Mutex::new(None),
        }
    }

    pub fn with_detector(mut self, detector: CrashLoopDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_single_instance_check(mut self, enforce: bool) -> Self {
        self.enforce_single_instance = enforce;
        self
    }

    /// Executable name that identifies another live owner of the record
    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    pub fn from_config(config: &lmx_core::StateConfig) -> Self {
        Self::new(&config.path)
            .with_detector(CrashLoopDetector::from_config(config))
            .with_single_instance_check(config.enforce_single_instance)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn detector(&self) -> &CrashLoopDetector {
        &self.detector
    }

    /// Read the record from disk; a missing or unreadable record reads as `None`
    pub async fn load(&self) -> Result<Option<RuntimeState>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(&self.path, e)),
        };

        match serde_json::from_slice::<RuntimeState>(&data) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Runtime state unreadable, treating as first run");
                Ok(None)
            }
        }
    }

    /// Record a process startup and persist it before returning
    pub async fn record_startup(&self) -> Result<StartupRecord> {
        self.record_startup_at(Utc::now(), std::process::id()).await
    }

    /// Record a startup at an explicit time for an explicit pid
    pub async fn record_startup_at(&self, now: DateTime<Utc>, pid: u32) -> Result<StartupRecord> {
        let mut current = self.current.lock().await;

        let previous = self.load().await?;

        let owner = previous
            .as_ref()
            .filter(|prev| {
                self.enforce_single_instance
                    && prev.was_unclean()
                    && prev.pid != pid
                    && owner_alive(prev.pid, &self.instance_name, prev.saved_at)
            })
            .map(|prev| prev.pid);

        let mut state = previous
            .clone()
            .unwrap_or_else(|| RuntimeState::first_run(pid));
        state.startup_count += 1;
        state.last_startup_at = Some(now);
        self.detector.record(&mut state.recent_startups, now);

        if let Some(owner_pid) = owner {
            // the attempt still counts towards the crash window; the owner's
            // models and pid stay as they are
            self.write(&state).await?;
            warn!(
                path = %self.path.display(),
                owner_pid,
                startup_count = state.startup_count,
                "Runtime state is owned by another live instance, refusing to start"
            );
            return Err(StateError::InUse {
                path: self.path.display().to_string(),
                pid: owner_pid,
            });
        }

        state.pid = pid;
        state.saved_at = now;
        self.write(&state).await?;

        let verdict = self.detector.evaluate(&state, now);
        info!(
            startup_count = state.startup_count,
            recent_startups = verdict.recent_startups,
            safe_mode = verdict.safe_mode,
            "Recorded startup"
        );

        *current = Some(state.clone());

        Ok(StartupRecord {
            previous,
            current: state,
            verdict,
        })
    }

    /// Persist the loaded model set
    ///
    /// `clean` is only true for the final write of a graceful shutdown. The
    /// startup history is kept either way; only the window ages it out.
    pub async fn save(&self, loaded_models: &[String], clean: bool) -> Result<()> {
        let mut current = self.current.lock().await;

        let mut state = match current.clone() {
            Some(state) => state,
            None => self
                .load()
                .await?
                .unwrap_or_else(|| RuntimeState::first_run(std::process::id())),
        };

        state.loaded_models = loaded_models.to_vec();
        state.last_clean_shutdown = clean;
        state.pid = std::process::id();
        state.saved_at = Utc::now();

        self.write(&state).await?;
        debug!(models = ?state.loaded_models, clean, "Runtime state saved");

        *current = Some(state);
        Ok(())
    }

    /// Last record written by this process
    pub async fn current(&self) -> Option<RuntimeState> {
        self.current.lock().await.clone()
    }

    /// Remove the record
    pub async fn clear(&self) -> Result<()> {
        let mut current = self.current.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StateError::io(&self.path, e)),
        }
        *current = None;
        Ok(())
    }

    async fn write(&self, state: &RuntimeState) -> Result<()> {
        let data = serde_json::to_vec_pretty(state)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StateError::io(parent, e))?;
            }
        }

        let temp_path = temp_path(&self.path);

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::io(&temp_path, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| StateError::io(&temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::io(&temp_path, e))?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| StateError::io(&self.path, e))?;

        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
