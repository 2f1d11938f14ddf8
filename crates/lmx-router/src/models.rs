//! Model lifecycle on top of the inference runtime
//!
//! Every load and unload is persisted as an unclean record before the call
//! returns, so a crash at any point mid-session leads to recovery on the
//! next start.

use lmx_core::{Error, InferenceRuntime, Result};
use lmx_state::RuntimeStateStore;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Outcome of reloading a list of models
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub loaded: Vec<String>,
    pub failed: Vec<FailedModel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedModel {
    pub model_id: String,
    pub reason: String,
}

impl RecoveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Loads and unloads models, keeping the runtime state record current
pub struct ModelManager {
    runtime: Arc<dyn InferenceRuntime>,
    store: Arc<RuntimeStateStore>,
    ops: Mutex<()>,
}

impl ModelManager {
    pub fn new(runtime: Arc<dyn InferenceRuntime>, store: Arc<RuntimeStateStore>) -> Self {
        Self {
            runtime,
            store,
            ops: Mutex::new(()),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn InferenceRuntime> {
        &self.runtime
    }

    pub fn store(&self) -> &Arc<RuntimeStateStore> {
        &self.store
    }

    pub async fn loaded_models(&self) -> Vec<String> {
        self.runtime.loaded_models().await
    }

    pub async fn is_loaded(&self, model_id: &str) -> bool {
        self.runtime.loaded_models().await.iter().any(|m| m == model_id)
    }

    pub async fn load(&self, model_id: &str) -> Result<()> {
        validate_model_id(model_id)?;
        let _guard = self.ops.lock().await;

        self.runtime.load_model(model_id).await?;
        info!(model_id, "Model loaded");
        self.persist_locked(false).await
    }

    pub async fn unload(&self, model_id: &str) -> Result<()> {
        validate_model_id(model_id)?;
        let _guard = self.ops.lock().await;

        if !self.is_loaded(model_id).await {
            return Err(Error::not_found(format!("model {} is not loaded", model_id)));
        }
        self.runtime.unload_model(model_id).await?;
        info!(model_id, "Model unloaded");
        self.persist_locked(false).await
    }

    /// Reload models left by an unclean exit
    ///
    /// Each failure is logged and skipped; the rest are still attempted.
    pub async fn recover(&self, models: &[String]) -> RecoveryReport {
        let _guard = self.ops.lock().await;
        let mut report = RecoveryReport::default();

        for model_id in models {
            info!(model_id = %model_id, "Recovering model");
            match self.runtime.load_model(model_id).await {
                Ok(()) => report.loaded.push(model_id.clone()),
                Err(e) => {
                    let failure = Error::recovery_failure(model_id, e.to_string());
                    warn!(model_id = %model_id, error = %failure, "Model recovery failed");
                    report.failed.push(FailedModel {
                        model_id: model_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if !models.is_empty() {
            if let Err(e) = self.persist_locked(false).await {
                warn!(error = %e, "Failed to persist state after recovery");
            }
        }
        report
    }

    /// Load configured models that are not already loaded
    pub async fn auto_load(&self, models: &[String]) -> RecoveryReport {
        let loaded = self.loaded_models().await;
        let pending: Vec<String> = models
            .iter()
            .filter(|m| !loaded.contains(m))
            .cloned()
            .collect();

        if pending.is_empty() {
            return RecoveryReport::default();
        }
        info!(models = ?pending, "Auto-loading configured models");
        self.recover(&pending).await
    }

    /// Persist the current model set
    pub async fn persist(&self, clean: bool) -> Result<()> {
        let _guard = self.ops.lock().await;
        self.persist_locked(clean).await
    }

    async fn persist_locked(&self, clean: bool) -> Result<()> {
        let models = self.runtime.loaded_models().await;
        self.store.save(&models, clean).await?;
        Ok(())
    }
}

fn validate_model_id(model_id: &str) -> Result<()> {
    if model_id.trim().is_empty() {
        return Err(Error::invalid_request("model_id must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmx_adapter_runtime::mock::MockRuntime;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> (ModelManager, Arc<MockRuntime>, Arc<RuntimeStateStore>) {
        let runtime = Arc::new(MockRuntime::new());
        let store = Arc::new(RuntimeStateStore::new(dir.path().join("state.json")));
        (ModelManager::new(runtime.clone(), store.clone()), runtime, store)
    }

    #[tokio::test]
    async fn test_load_and_unload_persist_unclean() {
        let dir = TempDir::new().unwrap();
        let (manager, _runtime, store) = manager(&dir);

        manager.load("m1").await.unwrap();
        manager.load("m2").await.unwrap();
        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.loaded_models, vec!["m1", "m2"]);
        assert!(!state.last_clean_shutdown);

        manager.unload("m1").await.unwrap();
        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.loaded_models, vec!["m2"]);
        assert!(!state.last_clean_shutdown);

        manager.persist(true).await.unwrap();
        assert!(store.load().await.unwrap().unwrap().last_clean_shutdown);
    }

    #[tokio::test]
    async fn test_unload_unknown_model() {
        let dir = TempDir::new().unwrap();
        let (manager, _, _) = manager(&dir);
        let err = manager.unload("ghost").await.unwrap_err();
        assert_eq!(err.to_http_status(), 404);
        assert_eq!(manager.load("  ").await.unwrap_err().to_http_status(), 400);
    }

    #[tokio::test]
    async fn test_recovery_continues_past_failures() {
        let dir = TempDir::new().unwrap();
        let (manager, runtime, store) = manager(&dir);
        runtime.fail_model("m1");

        let report = manager.recover(&["m1".to_string(), "m2".to_string()]).await;
        assert_eq!(runtime.load_attempts(), vec!["m1", "m2"]);
        assert_eq!(report.loaded, vec!["m2"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].model_id, "m1");
        assert!(!report.is_complete());

        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.loaded_models, vec!["m2"]);
    }

    #[tokio::test]
    async fn test_auto_load_skips_loaded_models() {
        let dir = TempDir::new().unwrap();
        let (manager, runtime, _) = manager(&dir);
        manager.load("m1").await.unwrap();

        let report = manager.auto_load(&["m1".to_string(), "m3".to_string()]).await;
        assert_eq!(report.loaded, vec!["m3"]);
        assert_eq!(runtime.load_attempts(), vec!["m1", "m3"]);
    }
}
